//! Bitcoin plumbing for the federation: chain access, deposit proofs and
//! the threshold-signed withdrawal wallet.

mod chain;
mod pegout;
mod txoproof;

use thiserror::Error;

pub use bdk::database::{Database, MemoryDatabase};
pub use bitcoincore_rpc::Error as RpcError;

pub use chain::{bitcoin, stream_blocks, BitcoinCore, BitcoinRpcError, ChainQuery};
pub use pegout::{
    sled, FederationDescriptor, FeeRate, MemberSignatures, MemberSigner, PartiallySignedPegOut,
    PublicKey as BitcoinPublicKey, SecretKey as BitcoinSecretKey, SignatureCollector, Tree,
    UtxoTracker,
};
pub use txoproof::{consensus_hex, PegInProof, TxOutProof};

pub const REQUIRED_CONFIRMATIONS: u32 = 6;

#[derive(Error, Debug)]
pub enum Error {
    #[error("DB access error")]
    DbError,
    #[error("Unknown or spent input")]
    UnknownOrSpentInput,
    #[error("Invalid number of signatures")]
    InvalidNumberOfSignatures,
    #[error("Missing signature")]
    MissingSignature,
    #[error("Txid was not found")]
    TxidNotFound,
    #[error("Given signature does not match the given public key")]
    IncorrectSignature,
    #[error("Invalid witness length")]
    InvalidWitnessLength,
    #[error("Invalid witness script")]
    InvalidWitnessScript,
    #[error("Missing pegout proposal")]
    MissingPegoutProposal,
    #[error("Invalid pegout output")]
    InvalidPegoutOutput,
    #[error("Invalid pegout output count")]
    InvalidPegoutOutputCount,
    #[error("Invalid change output")]
    InvalidChangeOutput,
    #[error("Unspendable input")]
    UnspendableInput,
    #[error("Invalid transaction header")]
    InvalidTransactionHeader,
    #[error("Network fee exceeds pegout output value")]
    FeeExceedsOutput,
    #[error("Insufficient federation funds")]
    InsufficientFunds,
    #[error("Insufficient bitcoin confirmations ({0})")]
    InsufficientConfirmations(i32),
    #[error("Transaction is not committed by the inclusion proof")]
    TxNotInProof,
    #[error("Referenced output does not exist")]
    MissingOutput,
    #[error("Referenced output does not pay the federation")]
    NotADeposit,
    #[error("Rpc error: {0}")]
    RpcError(#[from] RpcError),
}
