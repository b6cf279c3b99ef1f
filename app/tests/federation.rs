//! End-to-end: a four member federation agreeing epochs over in-process
//! channels, driven through the client wallet.

use async_trait::async_trait;
use bridge::bitcoin::absolute::LockTime;
use bridge::bitcoin::address::NetworkUnchecked;
use bridge::bitcoin::block::{Header, Version};
use bridge::bitcoin::hashes::Hash;
use bridge::bitcoin::merkle_tree::PartialMerkleTree;
use bridge::bitcoin::{Address, BlockHash, CompactTarget, ScriptBuf, Transaction, TxOut, Txid};
use bridge::{ChainQuery, MemoryDatabase, PegInProof, TxOutProof};
use ecash::Amount;
use lightning_invoice::{Currency, InvoiceBuilder, PaymentSecret};
use mintd::client::{ClientConfig, ClientWallet, InProcessApi};
use mintd::config::{dev_federation, FederationSpec};
use mintd::consensus::MemberId;
use mintd::error::Error;
use mintd::ln::LightningClient;
use mintd::member::{run_consensus, Member};
use mintd::store::EpochStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, Mutex};

const EPOCH: Duration = Duration::from_millis(25);

struct MockChain {
    confirmations: StdMutex<HashMap<BlockHash, i32>>,
    broadcasts: StdMutex<Vec<Transaction>>,
}

impl MockChain {
    fn new() -> Self {
        MockChain {
            confirmations: StdMutex::new(HashMap::new()),
            broadcasts: StdMutex::new(Vec::new()),
        }
    }

    fn confirm(&self, block_hash: BlockHash, depth: i32) {
        self.confirmations.lock().unwrap().insert(block_hash, depth);
    }

    /// True once some broadcast pays the script. The network fee comes
    /// out of the withdrawal output, so the paid value is at most the
    /// requested one.
    fn broadcast_paying(&self, script: &ScriptBuf, requested: u64) -> bool {
        self.broadcasts
            .lock()
            .unwrap()
            .iter()
            .any(|tx| {
                tx.output.iter().any(|out| {
                    out.value <= requested && out.value > 0 && &out.script_pubkey == script
                })
            })
    }
}

impl ChainQuery for MockChain {
    fn block_height(&self) -> Result<u32, bridge::Error> {
        Ok(100)
    }

    fn confirmations(&self, block_hash: &BlockHash) -> Result<Option<i32>, bridge::Error> {
        Ok(self.confirmations.lock().unwrap().get(block_hash).copied())
    }

    fn tx_confirmations(&self, _txid: &Txid) -> Result<Option<u32>, bridge::Error> {
        Ok(None)
    }

    fn broadcast(&self, transaction: &Transaction) -> Result<Txid, bridge::Error> {
        self.broadcasts.lock().unwrap().push(transaction.clone());
        Ok(transaction.txid())
    }
}

struct MockLightning {
    preimage: [u8; 32],
}

#[async_trait]
impl LightningClient for MockLightning {
    async fn pay(&self, _bolt11: &str) -> Result<[u8; 32], Error> {
        Ok(self.preimage)
    }
}

/// Spawn all four dev members with an in-process channel mesh. Member 0
/// carries the gateway when a lightning backend is given.
fn start_federation(
    spec: &FederationSpec,
    chain: Arc<MockChain>,
    gateway_ln: Option<Arc<dyn LightningClient>>,
) -> Vec<Arc<Mutex<Member<MemoryDatabase>>>> {
    let (_, secrets) = dev_federation();

    let mut senders = Vec::new();
    let mut inboxes = Vec::new();
    for _ in &secrets {
        let (sender, inbox) = mpsc::unbounded_channel();
        senders.push(sender);
        inboxes.push(inbox);
    }

    let mut members = Vec::new();
    for ((id, member_secrets), inbox) in secrets.into_iter().enumerate().zip(inboxes) {
        let ln = if id == 0 { gateway_ln.clone() } else { None };
        let member = Arc::new(Mutex::new(Member::new(
            id as MemberId,
            spec.clone(),
            member_secrets,
            MemoryDatabase::new(),
            EpochStore::open_temporary().unwrap(),
            chain.clone(),
            ln,
        )));
        let peers = senders
            .iter()
            .enumerate()
            .filter(|(peer, _)| *peer != id)
            .map(|(_, sender)| sender.clone())
            .collect();
        tokio::spawn(run_consensus(member.clone(), inbox, peers, EPOCH));
        members.push(member);
    }
    members
}

fn deposit_proof(chain: &MockChain, script: &ScriptBuf, value: u64) -> PegInProof {
    let deposit = Transaction {
        version: 2,
        lock_time: LockTime::ZERO,
        input: vec![],
        output: vec![TxOut {
            value,
            script_pubkey: script.clone(),
        }],
    };
    let merkle_proof = PartialMerkleTree::from_txids(&[deposit.txid()], &[true]);
    let mut matched = Vec::new();
    let mut indices = Vec::new();
    let root = merkle_proof
        .extract_matches(&mut matched, &mut indices)
        .unwrap();
    let block_header = Header {
        version: Version::ONE,
        prev_blockhash: BlockHash::all_zeros(),
        merkle_root: root,
        time: 0,
        bits: CompactTarget::from_consensus(0x207fffff),
        nonce: 0,
    };
    let txout_proof = TxOutProof {
        block_header,
        merkle_proof,
    };
    let proof = PegInProof::new(txout_proof, deposit, 0, script).unwrap();
    chain.confirm(proof.block_hash(), 6);
    proof
}

fn invoice_for(preimage: [u8; 32], sats: u64) -> String {
    // hash and signature types come from the crate versions
    // lightning-invoice links, not the bridge re-exports
    use bitcoin_hashes::{sha256, Hash as _};

    let secp = secp256k1::Secp256k1::new();
    let node_key = secp256k1::SecretKey::from_slice(&[41; 32]).unwrap();
    InvoiceBuilder::new(Currency::Regtest)
        .description("federation test".into())
        .payment_hash(sha256::Hash::hash(&preimage))
        .payment_secret(PaymentSecret([7; 32]))
        .amount_milli_satoshis(sats * 1000)
        .duration_since_epoch(SystemTime::now().duration_since(UNIX_EPOCH).unwrap())
        .min_final_cltv_expiry_delta(18)
        .build_signed(|hash| secp.sign_ecdsa_recoverable(hash, &node_key))
        .unwrap()
        .to_string()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pegin_spend_receive_and_withdraw() {
    let (spec, _) = dev_federation();
    let chain = Arc::new(MockChain::new());
    let members = start_federation(&spec, chain.clone(), None);

    let mut alice = ClientWallet::new(
        InProcessApi(members[0].clone()),
        ClientConfig::from(&spec),
    );
    let mut bob = ClientWallet::new(
        InProcessApi(members[0].clone()),
        ClientConfig::from(&spec),
    );

    let deposit_script = alice.deposit_address().await.unwrap().script_pubkey();
    let proof = deposit_proof(&chain, &deposit_script, 99_999);
    let amount = alice.peg_in(proof).await.unwrap();
    assert_eq!(amount, Amount::from_sats(99_999));
    assert_eq!(alice.balance(), Amount::from_sats(99_999));

    // no exact subset for 42k exists, so this exercises the split path
    let token = alice.spend(Amount::from_sats(42_000)).await.unwrap();
    assert_eq!(alice.balance(), Amount::from_sats(57_999));

    let received = bob.receive(&token).await.unwrap();
    assert_eq!(received, Amount::from_sats(42_000));
    assert_eq!(bob.balance(), Amount::from_sats(42_000));

    // a spent token cannot be redeemed again
    assert!(bob.receive(&token).await.is_err());

    let address = "bcrt1qs758ursh4q9z627kt3pp5yysm78ddny6txaqgw"
        .parse::<Address<NetworkUnchecked>>()
        .unwrap();
    let withdrawal_script = address.clone().assume_checked().script_pubkey();
    alice
        .peg_out(address, Amount::from_sats(500))
        .await
        .unwrap();
    assert_eq!(alice.balance(), Amount::from_sats(57_499));

    let deadline = Instant::now() + Duration::from_secs(15);
    while !chain.broadcast_paying(&withdrawal_script, 500) {
        assert!(Instant::now() < deadline, "withdrawal was never broadcast");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lightning_payment_through_the_gateway() {
    let (mut spec, _) = dev_federation();
    // epochs are fast here; keep contracts alive long enough to claim
    spec.contract_expiry_epochs = 400;

    let preimage = [11u8; 32];
    let chain = Arc::new(MockChain::new());
    let ln: Arc<dyn LightningClient> = Arc::new(MockLightning { preimage });
    let members = start_federation(&spec, chain.clone(), Some(ln));

    let mut alice = ClientWallet::new(
        InProcessApi(members[0].clone()),
        ClientConfig::from(&spec),
    );

    let deposit_script = alice.deposit_address().await.unwrap().script_pubkey();
    let proof = deposit_proof(&chain, &deposit_script, 100_000);
    alice.peg_in(proof).await.unwrap();

    let bolt11 = invoice_for(preimage, 25_000);
    alice.pay_invoice(&bolt11).await.unwrap();
    assert_eq!(alice.balance(), Amount::from_sats(75_000));
}
