use bitcoincore_rpc::Auth;
pub use bitcoincore_rpc::{
    bitcoin::Block,
    jsonrpc::{error::RpcError, Error as JsonRpcError},
    Client, Error as BitcoinError, RpcApi,
};
use futures::prelude::*;
use num_derive::FromPrimitive;
use std::sync::Arc;
use std::time::Duration;
use tracing::*;

pub use bitcoincore_rpc::bitcoin;
use bitcoin::{BlockHash, Transaction, Txid};

use crate::Error;

const RETRY_DURATION: Duration = Duration::from_secs(1);

// https://github.com/bitcoin/bitcoin/blob/be3af4f31089726267ce2dbdd6c9c153bb5aeae1/src/rpc/protocol.h#L43
#[derive(Debug, FromPrimitive, PartialEq, Eq)]
pub enum BitcoinRpcError {
    RpcInvalidRequest = -32600,
    RpcMethodNotFound = -32601,
    RpcInvalidParams = -32602,
    RpcInternalError = -32603,
    RpcParseError = -32700,

    RpcMiscError = -1,
    RpcTypeError = -3,
    RpcInvalidAddressOrKey = -5,
    RpcOutOfMemory = -7,
    RpcInvalidParameter = -8,
    RpcDatabaseError = -20,
    RpcDeserializationError = -22,
    RpcVerifyError = -25,
    RpcVerifyRejected = -26,
    RpcVerifyAlreadyInChain = -27,
    RpcInWarmup = -28,
    RpcMethodDeprecated = -32,

    /// Unknown error code (not in spec).
    RpcUnknownError = 0,
}

impl From<RpcError> for BitcoinRpcError {
    fn from(err: RpcError) -> Self {
        match num::FromPrimitive::from_i32(err.code) {
            Some(err) => err,
            None => Self::RpcUnknownError,
        }
    }
}

/// The view a federation member has of the Bitcoin chain. Every member
/// queries its own node; consensus never assumes two members see the same
/// tip, only that confirmations accumulate monotonically past the policy
/// depth.
pub trait ChainQuery: Send + Sync {
    fn block_height(&self) -> Result<u32, Error>;

    /// Confirmation count for a block, `None` if the block is unknown to
    /// this member's node (not yet seen, or forked out).
    fn confirmations(&self, block_hash: &BlockHash) -> Result<Option<i32>, Error>;

    /// Confirmation count for a broadcast transaction, `None` while it is
    /// unknown or unconfirmed.
    fn tx_confirmations(&self, txid: &Txid) -> Result<Option<u32>, Error>;

    fn broadcast(&self, transaction: &Transaction) -> Result<Txid, Error>;
}

#[derive(Clone)]
pub struct BitcoinCore {
    pub rpc: Arc<Client>,
}

impl BitcoinCore {
    pub fn new(
        url: &str,
        rpc_user: impl Into<String>,
        rpc_pass: impl Into<String>,
    ) -> Result<Self, Error> {
        Ok(Self {
            rpc: Client::new(url, Auth::UserPass(rpc_user.into(), rpc_pass.into()))?.into(),
        })
    }

    /// Wait until the block at `height` has the required number of
    /// confirmations, then return it. Blocks indefinitely; a stalled chain
    /// keeps the caller pending rather than failing.
    async fn wait_for_block(&self, height: u32, num_confirmations: u32) -> Result<Block, Error> {
        loop {
            match self.rpc.get_block_hash(height.into()) {
                Ok(hash) => {
                    let info = self.rpc.get_block_info(&hash)?;
                    if info.confirmations >= num_confirmations as i32 {
                        return Ok(self.rpc.get_block(&hash)?);
                    } else {
                        tokio::time::sleep(RETRY_DURATION).await;
                        continue;
                    }
                }
                Err(BitcoinError::JsonRpc(JsonRpcError::Rpc(err)))
                    if BitcoinRpcError::from(err.clone())
                        == BitcoinRpcError::RpcInvalidParameter =>
                {
                    // block does not exist yet
                    tokio::time::sleep(RETRY_DURATION).await;
                    continue;
                }
                Err(err) => {
                    return Err(err.into());
                }
            }
        }
    }
}

impl ChainQuery for BitcoinCore {
    fn block_height(&self) -> Result<u32, Error> {
        Ok(self.rpc.get_block_count()? as u32)
    }

    fn confirmations(&self, block_hash: &BlockHash) -> Result<Option<i32>, Error> {
        match self.rpc.get_block_header_info(block_hash) {
            Ok(info) => Ok(Some(info.confirmations)),
            Err(BitcoinError::JsonRpc(JsonRpcError::Rpc(err)))
                if BitcoinRpcError::from(err.clone())
                    == BitcoinRpcError::RpcInvalidAddressOrKey =>
            {
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn tx_confirmations(&self, txid: &Txid) -> Result<Option<u32>, Error> {
        match self.rpc.get_raw_transaction_info(txid, None) {
            Ok(info) => Ok(info.confirmations),
            Err(BitcoinError::JsonRpc(JsonRpcError::Rpc(err)))
                if BitcoinRpcError::from(err.clone())
                    == BitcoinRpcError::RpcInvalidAddressOrKey =>
            {
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn broadcast(&self, transaction: &Transaction) -> Result<Txid, Error> {
        Ok(self.rpc.send_raw_transaction(transaction)?)
    }
}

/// Stream blocks continuously from `from_height`, waiting for each block
/// to reach `num_confirmations` before yielding it. The stream never ends;
/// deposit detection degrades to "pending" while the chain stalls.
pub async fn stream_blocks(
    rpc: BitcoinCore,
    from_height: u32,
    num_confirmations: u32,
) -> impl Stream<Item = Result<(Block, u32), Error>> + Unpin {
    struct StreamState {
        rpc: BitcoinCore,
        next_height: u32,
    }

    let state = StreamState {
        rpc,
        next_height: from_height,
    };

    Box::pin(
        stream::unfold(state, move |mut state| async move {
            let height = state.next_height;
            match state.rpc.wait_for_block(height, num_confirmations).await {
                Ok(block) => {
                    debug!("found block {} at height {}", block.block_hash(), height);
                    state.next_height += 1;
                    Some((Ok((block, height)), state))
                }
                Err(e) => Some((Err(e), state)),
            }
        })
        .fuse(),
    )
}
