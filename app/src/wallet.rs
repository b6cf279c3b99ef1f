//! Peg handling on top of the bridge crate: deposit claims, the queue of
//! agreed withdrawals and the signing lifecycle of each withdrawal
//! transaction. All transitions here happen while applying epochs, so
//! every member walks through the same states in the same order.

use crate::error::Error;
use bridge::bitcoin::address::NetworkUnchecked;
use bridge::bitcoin::{
    Address, Network, OutPoint as BitcoinOutPoint, Transaction, TxOut, Txid,
};
use bridge::{
    ChainQuery, Database, FederationDescriptor, FeeRate, MemberSignatures, MemberSigner,
    PegInProof, SignatureCollector, UtxoTracker,
};
use ecash::Amount;
use serde_derive::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PegOutStatus {
    /// Agreed withdrawal transaction, waiting for member signatures.
    PartiallySigned,
    /// Threshold reached, witness assembled, ready for the chain.
    Broadcastable,
    /// Handed to a bitcoin node.
    Broadcast,
    /// Buried under the required confirmations.
    Confirmed,
}

pub struct PegWallet<T: Database> {
    tracker: UtxoTracker<T>,
    collector: SignatureCollector,
    signer: Option<MemberSigner>,
    descriptor: FederationDescriptor,
    network: Network,
    fee_rate: FeeRate,
    claimed_deposits: HashSet<BitcoinOutPoint>,
    /// Withdrawal outputs agreed on the ledger but not yet in a proposal.
    queued: Vec<TxOut>,
    unsigned: BTreeMap<Txid, Transaction>,
    finalized: BTreeMap<Txid, Transaction>,
    signed_by_us: HashSet<Txid>,
    statuses: BTreeMap<Txid, PegOutStatus>,
}

impl<T: Database> PegWallet<T> {
    pub fn new(
        tracker: UtxoTracker<T>,
        descriptor: FederationDescriptor,
        signer: Option<MemberSigner>,
        network: Network,
        fee_rate: FeeRate,
    ) -> Self {
        PegWallet {
            tracker,
            collector: SignatureCollector::new(descriptor.clone()),
            signer,
            descriptor,
            network,
            fee_rate,
            claimed_deposits: HashSet::new(),
            queued: Vec::new(),
            unsigned: BTreeMap::new(),
            finalized: BTreeMap::new(),
            signed_by_us: HashSet::new(),
            statuses: BTreeMap::new(),
        }
    }

    pub fn deposit_address(&self) -> &Address {
        &self.descriptor.deposit_address
    }

    pub fn descriptor(&self) -> &FederationDescriptor {
        &self.descriptor
    }

    pub fn balance(&self) -> Result<Amount, Error> {
        Ok(Amount::from_sats(self.tracker.balance()?))
    }

    /// Deterministic part of peg-in validation, identical on every
    /// member: proof integrity and that the outpoint is unclaimed.
    /// Confirmation depth is checked against the local chain view at
    /// submission time, before the transaction enters consensus.
    pub fn validate_pegin(&self, proof: &PegInProof) -> Result<Amount, Error> {
        proof.verify(&self.descriptor.deposit_script())?;
        if self.claimed_deposits.contains(&proof.outpoint()) {
            return Err(Error::DepositAlreadyClaimed);
        }
        Ok(Amount::from_sats(proof.tx_output().value))
    }

    pub fn apply_pegin(&mut self, proof: &PegInProof) -> Result<Amount, Error> {
        let amount = self.validate_pegin(proof)?;
        self.claimed_deposits.insert(proof.outpoint());
        self.tracker.register_deposit(proof.transaction())?;
        Ok(amount)
    }

    /// Validate a peg-out output against the federation's network before
    /// it is accepted onto the ledger.
    pub fn validate_pegout_request(
        &self,
        address: &Address<NetworkUnchecked>,
        amount: Amount,
    ) -> Result<TxOut, Error> {
        let address = address
            .clone()
            .require_network(self.network)
            .map_err(|_| Error::BridgeError(bridge::Error::InvalidPegoutOutput))?;
        Ok(TxOut {
            value: amount.sats,
            script_pubkey: address.script_pubkey(),
        })
    }

    pub fn queue_pegout(&mut self, output: TxOut) {
        self.queued.push(output);
    }

    /// Build the next withdrawal proposal. Only one transaction is in
    /// flight at a time; further requests keep queueing behind it.
    pub fn create_proposal(&mut self) -> Result<Option<Transaction>, Error> {
        if self.queued.is_empty() || !self.unsigned.is_empty() {
            return Ok(None);
        }
        let tx = self
            .tracker
            .create_pegout_tx(self.queued.clone(), self.fee_rate)?;
        Ok(Some(tx))
    }

    pub fn validate_proposal(&self, tx: &Transaction) -> Result<(), Error> {
        if !self.unsigned.is_empty() {
            return Err(Error::BridgeError(bridge::Error::UnspendableInput));
        }
        self.tracker
            .check_pegout_proposal(self.queued.clone(), Some(tx))?;
        Ok(())
    }

    pub fn apply_proposal(&mut self, tx: Transaction) -> Result<(), Error> {
        self.validate_proposal(&tx)?;
        let txid = tx.txid();
        self.tracker.register_spend(&tx)?;
        self.unsigned.insert(txid, tx);
        self.statuses.insert(txid, PegOutStatus::PartiallySigned);
        self.queued.clear();
        Ok(())
    }

    /// Signatures this member still owes for in-flight withdrawals.
    pub fn pending_signatures(&mut self) -> Vec<(Txid, MemberSignatures)> {
        let signer = match &self.signer {
            Some(signer) => signer,
            None => return Vec::new(),
        };
        let mut contributions = Vec::new();
        for (txid, tx) in self.unsigned.iter() {
            if self.signed_by_us.contains(txid) {
                continue;
            }
            match signer.sign_pegout(&self.tracker, tx) {
                Ok(signatures) => {
                    self.signed_by_us.insert(*txid);
                    contributions.push((*txid, signatures));
                }
                Err(e) => warn!("failed to sign withdrawal {}: {:?}", txid, e),
            }
        }
        contributions
    }

    /// Record another member's signatures; returns the finalized
    /// transaction once the threshold is reached.
    pub fn apply_signatures(
        &mut self,
        txid: Txid,
        signatures: MemberSignatures,
    ) -> Result<Option<Transaction>, Error> {
        if !self.unsigned.contains_key(&txid) {
            return Err(Error::BridgeError(bridge::Error::TxidNotFound));
        }
        self.collector
            .add_signature(&self.tracker, txid, signatures)?;

        if self.collector.signature_count(&txid) >= self.descriptor.threshold() {
            let tx = self.collector.get_finalized(txid)?;
            self.tracker.check_transaction_signatures(&tx)?;
            self.collector.cleanup_signatures_for(&txid);
            self.unsigned.remove(&txid);
            self.finalized.insert(txid, tx.clone());
            self.statuses.insert(txid, PegOutStatus::Broadcastable);
            return Ok(Some(tx));
        }
        Ok(None)
    }

    pub fn mark_broadcast(&mut self, txid: Txid) {
        if let Some(status) = self.statuses.get_mut(&txid) {
            *status = PegOutStatus::Broadcast;
        }
    }

    /// Drive Broadcast withdrawals to Confirmed from the local chain
    /// view.
    pub fn watch_confirmations(&mut self, chain: &dyn ChainQuery, required: u32) {
        for (txid, status) in self.statuses.iter_mut() {
            if *status != PegOutStatus::Broadcast {
                continue;
            }
            match chain.tx_confirmations(txid) {
                Ok(Some(confirmations)) if confirmations >= required => {
                    info!("withdrawal {} confirmed", txid);
                    *status = PegOutStatus::Confirmed;
                }
                Ok(_) => {}
                Err(e) => warn!("confirmation check for {} failed: {:?}", txid, e),
            }
        }
    }

    pub fn statuses(&self) -> &BTreeMap<Txid, PegOutStatus> {
        &self.statuses
    }

    pub fn finalized(&self, txid: &Txid) -> Option<&Transaction> {
        self.finalized.get(txid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge::bitcoin::absolute::LockTime;
    use bridge::bitcoin::secp256k1::{Secp256k1, SecretKey};
    use bridge::{BitcoinSecretKey, MemoryDatabase};
    use rand::rngs::OsRng;

    struct TestSetup {
        wallets: Vec<PegWallet<MemoryDatabase>>,
    }

    fn setup(members: usize, funded: u64) -> TestSetup {
        let secp = Secp256k1::new();
        let keys: Vec<BitcoinSecretKey> =
            (0..members).map(|_| SecretKey::new(&mut OsRng)).collect();
        let pubkeys: Vec<_> = keys.iter().map(|k| k.public_key(&secp)).collect();
        let threshold = (members * 2 + 2) / 3;
        let descriptor = FederationDescriptor::new(pubkeys, threshold, Network::Regtest);

        let deposit = Transaction {
            version: 2,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![TxOut {
                value: funded,
                script_pubkey: descriptor.deposit_script(),
            }],
        };

        let wallets = keys
            .into_iter()
            .map(|key| {
                let tracker =
                    UtxoTracker::new_with_db(MemoryDatabase::new(), descriptor.clone());
                let mut wallet = PegWallet::new(
                    tracker,
                    descriptor.clone(),
                    Some(MemberSigner::new(key)),
                    Network::Regtest,
                    FeeRate::from_sat_per_vb(1.0),
                );
                wallet.tracker.register_deposit(&deposit).unwrap();
                wallet
            })
            .collect();
        TestSetup { wallets }
    }

    fn withdrawal_output(amount: u64) -> TxOut {
        let address: Address<NetworkUnchecked> = "bcrt1qs758ursh4q9z627kt3pp5yysm78ddny6txaqgw"
            .parse()
            .unwrap();
        TxOut {
            value: amount,
            script_pubkey: address.assume_checked().script_pubkey(),
        }
    }

    #[test]
    fn withdrawal_lifecycle_reaches_broadcastable() {
        let mut setup = setup(4, 100_000);
        for wallet in setup.wallets.iter_mut() {
            wallet.queue_pegout(withdrawal_output(500));
        }

        let proposal = setup.wallets[0].create_proposal().unwrap().unwrap();
        let txid = proposal.txid();
        for wallet in setup.wallets.iter_mut() {
            wallet.apply_proposal(proposal.clone()).unwrap();
            assert_eq!(
                wallet.statuses().get(&txid),
                Some(&PegOutStatus::PartiallySigned)
            );
        }

        // nothing further may be proposed while one is in flight
        setup.wallets[0].queue_pegout(withdrawal_output(100));
        assert!(setup.wallets[0].create_proposal().unwrap().is_none());

        let contributions: Vec<_> = setup
            .wallets
            .iter_mut()
            .take(3)
            .map(|wallet| wallet.pending_signatures().remove(0))
            .collect();

        let mut finalized = None;
        for (txid, signatures) in contributions {
            finalized = setup.wallets[3].apply_signatures(txid, signatures).unwrap();
        }
        let tx = finalized.expect("threshold reached");
        assert_eq!(tx.txid(), txid);
        assert_eq!(
            setup.wallets[3].statuses().get(&txid),
            Some(&PegOutStatus::Broadcastable)
        );
    }

    fn proof_for(deposit: Transaction, script: &bridge::bitcoin::ScriptBuf) -> PegInProof {
        use bridge::bitcoin::block::{Header, Version};
        use bridge::bitcoin::hashes::Hash;
        use bridge::bitcoin::merkle_tree::PartialMerkleTree;
        use bridge::bitcoin::{BlockHash, CompactTarget};
        use bridge::TxOutProof;

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
        PegInProof::new(txout_proof, deposit, 0, script).unwrap()
    }

    #[test]
    fn deposit_cannot_be_claimed_twice() {
        let mut setup = setup(4, 100_000);
        let wallet = &mut setup.wallets[0];

        let script = wallet.descriptor().deposit_script();
        let deposit = Transaction {
            version: 2,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![TxOut {
                value: 99_999,
                script_pubkey: script.clone(),
            }],
        };
        let proof = proof_for(deposit, &script);

        assert_eq!(
            wallet.apply_pegin(&proof).unwrap(),
            Amount::from_sats(99_999)
        );
        assert!(matches!(
            wallet.validate_pegin(&proof),
            Err(Error::DepositAlreadyClaimed)
        ));
    }
}
