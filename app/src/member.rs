//! One federation member: the replicated ledger state (mint, peg wallet,
//! contracts) plus the engine loop that drives epoch agreement with the
//! other members. Everything chain-view dependent is checked when a
//! transaction is accepted; applying an agreed epoch only runs
//! deterministic checks, so every member ends an epoch in the same state.

use crate::client::IssuanceRequest;
use crate::config::{FederationSpec, MemberSecrets};
use crate::consensus::{
    epoch_leader, merge_items, ConsensusItem, Contribution, EpochCertificate, EpochProposal,
    FaultTracker, MemberId, Message, SignedContribution, SignedProposal, SignedVote, Vote,
};
use crate::error::Error;
use crate::ln::{
    decode_invoice, ContractId, ContractLedger, ContractOutcome, ContractState, LightningClient,
};
use crate::metrics::{CONSENSUS_ITEMS, EPOCHS_FINALIZED};
use crate::mint::Mint;
use crate::store::EpochStore;
use crate::transaction::{Input, LedgerTransaction, OutPoint, Output, TransactionId};
use crate::wallet::{PegOutStatus, PegWallet};
use bridge::bitcoin::{Address, Transaction as BitcoinTransaction, Txid};
use bridge::{ChainQuery, Database, FeeRate, MemberSigner, UtxoTracker};
use ecash::{BlindedSignature, TieredMulti};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use serde_derive::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::*;

struct Gateway {
    ln: Arc<dyn LightningClient>,
    /// Invoices clients announced before funding, by payment hash.
    invoices: HashMap<[u8; 32], String>,
    attempted: HashSet<ContractId>,
    /// Blinding material for claim issuances, redeemed once the
    /// resolution is agreed.
    claims: HashMap<OutPoint, IssuanceRequest>,
}

/// An invoice the gateway has agreed funding for and still has to pay.
pub struct GatewayJob {
    pub contract: ContractId,
    pub bolt11: String,
    pub ln: Arc<dyn LightningClient>,
}

/// Summary of in-flight work, for operators.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PendingStatus {
    pub epoch: u64,
    pub pending_issuances: Vec<OutPoint>,
    pub pegouts: BTreeMap<Txid, PegOutStatus>,
}

pub struct Member<DB: Database> {
    pub id: MemberId,
    spec: FederationSpec,
    signing_key: SigningKey,
    mint: Mint,
    wallet: PegWallet<DB>,
    contracts: ContractLedger,
    faults: FaultTracker,
    /// Next epoch to agree on.
    epoch: u64,
    parent: [u8; 32],
    /// Items waiting for inclusion in a certificate.
    outstanding: Vec<ConsensusItem>,
    store: EpochStore,
    pub chain: Arc<dyn ChainQuery>,
    gateway: Option<Gateway>,
}

impl<DB: Database> Member<DB> {
    pub fn new(
        id: MemberId,
        spec: FederationSpec,
        secrets: MemberSecrets,
        db: DB,
        store: EpochStore,
        chain: Arc<dyn ChainQuery>,
        ln: Option<Arc<dyn LightningClient>>,
    ) -> Self {
        let descriptor = spec.descriptor();
        let mint = Mint::new(
            id,
            secrets.note_keys,
            spec.member_note_keys.clone(),
            spec.aggregate_keys.clone(),
            spec.threshold(),
        );
        let wallet = PegWallet::new(
            UtxoTracker::new_with_db(db, descriptor.clone()),
            descriptor,
            Some(MemberSigner::new(secrets.bitcoin_key)),
            spec.network,
            FeeRate::from_sat_per_vb(spec.pegout_fee_rate),
        );
        Member {
            id,
            spec,
            signing_key: secrets.consensus_key,
            mint,
            wallet,
            contracts: ContractLedger::default(),
            faults: FaultTracker::default(),
            epoch: 0,
            parent: [0; 32],
            outstanding: Vec::new(),
            store,
            chain,
            gateway: ln.map(|ln| Gateway {
                ln,
                invoices: HashMap::new(),
                attempted: HashSet::new(),
                claims: HashMap::new(),
            }),
        }
    }

    pub fn spec(&self) -> &FederationSpec {
        &self.spec
    }

    pub fn current_epoch(&self) -> u64 {
        self.epoch
    }

    pub fn deposit_address(&self) -> Address {
        self.wallet.deposit_address().clone()
    }

    pub fn pending(&self) -> PendingStatus {
        PendingStatus {
            epoch: self.epoch,
            pending_issuances: self.mint.pending_issuances(),
            pegouts: self.wallet.statuses().clone(),
        }
    }

    /// Rebuild state from the persisted epoch log. Outstanding items are
    /// regenerated along the way, so a restarted member resumes signing
    /// and issuing where it left off.
    pub fn replay(&mut self) -> Result<u64, Error> {
        let certificates: Vec<EpochCertificate> =
            self.store.iter().collect::<Result<_, _>>()?;
        for certificate in &certificates {
            self.apply_certificate(certificate, true)?;
        }
        if self.epoch > 0 {
            info!("replayed {} epochs", self.epoch);
        }
        Ok(self.epoch)
    }

    /// Accept a client transaction. Runs the full check set, including
    /// this member's chain view for peg-in depth; the deterministic
    /// subset is re-run by everyone at apply time.
    pub fn submit_transaction(
        &mut self,
        transaction: LedgerTransaction,
    ) -> Result<TransactionId, Error> {
        self.validate_transaction(&transaction, true)?;
        let txid = transaction.txid();
        debug!("accepted transaction {}", txid);
        self.outstanding
            .push(ConsensusItem::Transaction(transaction));
        Ok(txid)
    }

    /// Combined blinded signatures for an output, `None` while the
    /// issuance is unknown or still collecting shares.
    pub fn output_signatures(
        &self,
        out_point: OutPoint,
    ) -> Result<Option<TieredMulti<BlindedSignature>>, Error> {
        match self.mint.signatures(out_point) {
            Ok(result) => Ok(result.cloned()),
            Err(Error::UnknownOutput) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn validate_notes(&self, notes: &ecash::Notes) -> Result<(), Error> {
        self.mint.validate_notes(notes)
    }

    pub fn contract_state(&self, id: &ContractId) -> Option<ContractState> {
        self.contracts.state(id)
    }

    /// Register an invoice this member's gateway is willing to pay once a
    /// matching contract is funded.
    pub fn announce_invoice(&mut self, bolt11: &str) -> Result<(), Error> {
        let (payment_hash, _) = decode_invoice(bolt11)?;
        let gateway = self.gateway.as_mut().ok_or(Error::NoGateway)?;
        gateway.invoices.insert(payment_hash, bolt11.to_string());
        Ok(())
    }

    /// Funded contracts matching an announced invoice that the gateway
    /// has not started paying yet.
    pub fn take_gateway_jobs(&mut self) -> Vec<GatewayJob> {
        let gateway = match self.gateway.as_mut() {
            Some(gateway) => gateway,
            None => return Vec::new(),
        };
        let mut jobs = Vec::new();
        for (id, contract) in self.contracts.funded() {
            if gateway.attempted.contains(id) {
                continue;
            }
            if let Some(bolt11) = gateway.invoices.get(&contract.output.payment_hash) {
                gateway.attempted.insert(*id);
                jobs.push(GatewayJob {
                    contract: *id,
                    bolt11: bolt11.clone(),
                    ln: gateway.ln.clone(),
                });
            }
        }
        jobs
    }

    /// Turn a successful payment into a claim resolution carrying the
    /// gateway's own blinded serials.
    pub fn submit_gateway_claim(
        &mut self,
        contract: ContractId,
        preimage: [u8; 32],
    ) -> Result<(), Error> {
        let amount = self
            .contracts
            .get(&contract)
            .ok_or(Error::UnknownContract)?
            .output
            .amount;
        let (claim, request) =
            IssuanceRequest::new(amount, &self.spec.note_tiers, &mut OsRng)?;
        let gateway = self.gateway.as_mut().ok_or(Error::NoGateway)?;
        gateway
            .claims
            .insert(contract.issuance_out_point(0), request);
        self.outstanding.push(ConsensusItem::ContractResolution {
            contract,
            outcome: ContractOutcome::Paid { preimage, claim },
        });
        Ok(())
    }

    /// Blinding material for an agreed gateway claim, for unblinding the
    /// issued notes.
    pub fn take_gateway_claim(&mut self, out_point: OutPoint) -> Option<IssuanceRequest> {
        self.gateway.as_mut()?.claims.remove(&out_point)
    }

    fn validate_transaction(
        &self,
        transaction: &LedgerTransaction,
        check_chain: bool,
    ) -> Result<(), Error> {
        if transaction.input_amount() != transaction.output_amount() + self.spec.tx_fee {
            return Err(Error::UnbalancedTransaction);
        }

        let mut seen_serials = HashSet::new();
        let mut seen_deposits = HashSet::new();
        for input in &transaction.inputs {
            match input {
                Input::Notes(notes) => {
                    self.mint.validate_notes(notes)?;
                    for (_, note) in notes.iter_items() {
                        if !seen_serials.insert(note.serial) {
                            return Err(Error::DoubleSpend);
                        }
                    }
                }
                Input::PegIn(proof) => {
                    self.wallet.validate_pegin(proof)?;
                    if !seen_deposits.insert(proof.outpoint()) {
                        return Err(Error::DepositAlreadyClaimed);
                    }
                    if check_chain {
                        proof.check_confirmations(
                            self.chain.as_ref(),
                            self.spec.finality_confirmations,
                        )?;
                    }
                }
            }
        }

        for output in &transaction.outputs {
            match output {
                Output::Notes(request) => self.mint.validate_request(request)?,
                Output::PegOut { address, amount } => {
                    self.wallet.validate_pegout_request(address, *amount)?;
                }
                Output::Contract(contract) => self.contracts.validate_funding(contract)?,
            }
        }
        Ok(())
    }

    fn apply_transaction(&mut self, transaction: &LedgerTransaction) -> Result<(), Error> {
        self.validate_transaction(transaction, false)?;

        for input in &transaction.inputs {
            match input {
                Input::Notes(notes) => self.mint.apply_spend(notes),
                Input::PegIn(proof) => {
                    self.wallet.apply_pegin(proof)?;
                }
            }
        }

        let txid = transaction.txid();
        for (idx, output) in transaction.outputs.iter().enumerate() {
            let out_point = OutPoint {
                txid,
                out_idx: idx as u32,
            };
            match output {
                Output::Notes(request) => {
                    self.mint.begin_issuance(out_point, request.clone());
                }
                Output::PegOut { address, amount } => {
                    let txout = self.wallet.validate_pegout_request(address, *amount)?;
                    self.wallet.queue_pegout(txout);
                }
                Output::Contract(contract) => {
                    let id = self.contracts.fund(out_point, contract.clone());
                    debug!("funded contract {}", id);
                }
            }
        }
        Ok(())
    }

    fn apply_item(
        &mut self,
        item: &ConsensusItem,
        broadcasts: &mut Vec<BitcoinTransaction>,
    ) -> Result<(), Error> {
        match item {
            ConsensusItem::Transaction(transaction) => self.apply_transaction(transaction),
            ConsensusItem::IssuanceShares {
                member,
                out_point,
                shares,
            } => self.mint.apply_shares(*member, *out_point, shares.clone()),
            ConsensusItem::PegOutProposal { tx } => self.wallet.apply_proposal(tx.clone()),
            ConsensusItem::PegOutSignatures {
                member: _,
                txid,
                signatures,
            } => {
                if let Some(finalized) =
                    self.wallet.apply_signatures(*txid, signatures.clone())?
                {
                    broadcasts.push(finalized);
                }
                Ok(())
            }
            ConsensusItem::ContractResolution { contract, outcome } => {
                let (out_point, request) =
                    self.contracts
                        .apply_resolution(contract, outcome, self.epoch)?;
                self.mint.begin_issuance(out_point, request);
                Ok(())
            }
        }
    }

    /// Apply an agreed epoch. Invalid items are skipped with a warning
    /// rather than failing the epoch; identical validation on every
    /// member means everyone skips the same items. Returns the finalized
    /// withdrawals ready for broadcast.
    pub fn apply_certificate(
        &mut self,
        certificate: &EpochCertificate,
        replay: bool,
    ) -> Result<Vec<BitcoinTransaction>, Error> {
        certificate.verify(&self.spec.members, self.spec.threshold())?;
        if certificate.epoch() != self.epoch {
            return Err(Error::WrongEpoch);
        }
        if certificate.proposal.proposal.parent != self.parent {
            return Err(Error::WrongParent);
        }
        if !replay {
            self.store.append(certificate)?;
        }

        let items = &certificate.proposal.proposal.items;
        let included: HashSet<[u8; 32]> = items.iter().map(|item| item.hash()).collect();
        self.outstanding
            .retain(|item| !included.contains(&item.hash()));

        let mut broadcasts = Vec::new();
        for item in items {
            CONSENSUS_ITEMS.with_label_values(&[item.kind()]).inc();
            if let Err(e) = self.apply_item(item, &mut broadcasts) {
                warn!("epoch {}: skipping invalid item: {:?}", self.epoch, e);
            }
        }

        self.parent = certificate.hash();
        self.epoch += 1;
        EPOCHS_FINALIZED.inc();
        self.regenerate_outstanding();

        for tx in &broadcasts {
            self.wallet.mark_broadcast(tx.txid());
        }
        if !replay {
            self.wallet
                .watch_confirmations(self.chain.as_ref(), self.spec.finality_confirmations);
        }
        Ok(broadcasts)
    }

    /// Everything this member owes the next epoch: blind signature shares,
    /// withdrawal signatures, the next withdrawal proposal if it leads,
    /// and expiry resolutions.
    fn regenerate_outstanding(&mut self) {
        for (out_point, shares) in self.mint.pending_contributions() {
            self.outstanding.push(ConsensusItem::IssuanceShares {
                member: self.id,
                out_point,
                shares,
            });
        }
        for (txid, signatures) in self.wallet.pending_signatures() {
            self.outstanding.push(ConsensusItem::PegOutSignatures {
                member: self.id,
                txid,
                signatures,
            });
        }

        let active = self.faults.active_members(self.spec.members.len());
        if epoch_leader(self.epoch, &active) == Some(self.id) {
            match self.wallet.create_proposal() {
                Ok(Some(tx)) => self.outstanding.push(ConsensusItem::PegOutProposal { tx }),
                Ok(None) => {}
                Err(e) => warn!("could not build withdrawal proposal: {:?}", e),
            }
        }

        for contract in self.contracts.expired(self.epoch) {
            self.outstanding.push(ConsensusItem::ContractResolution {
                contract,
                outcome: ContractOutcome::Expired,
            });
        }

        // expiry items recur until resolved
        self.outstanding = merge_items(vec![std::mem::take(&mut self.outstanding)]);
    }

    fn signed_contribution(&self) -> SignedContribution {
        SignedContribution::new(
            Contribution {
                epoch: self.epoch,
                items: self.outstanding.clone(),
            },
            self.id,
            &self.signing_key,
        )
    }

    fn sign_vote(&self, proposal_hash: [u8; 32]) -> SignedVote {
        SignedVote::new(
            Vote {
                epoch: self.epoch,
                proposal_hash,
            },
            self.id,
            &self.signing_key,
        )
    }
}

#[derive(Default)]
struct Round {
    contributions: HashMap<MemberId, Vec<ConsensusItem>>,
    proposal: Option<SignedProposal>,
    votes: HashMap<MemberId, SignedVote>,
    contributed: bool,
}

struct Engine<DB: Database> {
    member: Arc<Mutex<Member<DB>>>,
    peers: Vec<mpsc::UnboundedSender<Message>>,
    round: Round,
}

impl<DB: Database + Send + 'static> Engine<DB> {
    fn broadcast(&self, message: Message) {
        for peer in &self.peers {
            // a closed peer channel only means that member is down
            let _ = peer.send(message.clone());
        }
    }

    fn contribute(&mut self, member: &Member<DB>) {
        let contribution = member.signed_contribution();
        self.round
            .contributions
            .insert(member.id, contribution.contribution.items.clone());
        self.round.contributed = true;
        self.broadcast(Message::Contribution(contribution));
    }

    fn maybe_propose(&mut self, member: &mut Member<DB>) {
        if self.round.proposal.is_some() {
            return;
        }
        let active = member.faults.active_members(member.spec.members.len());
        if epoch_leader(member.epoch, &active) != Some(member.id) {
            return;
        }
        let items = merge_items(self.round.contributions.values().cloned());
        let proposal = SignedProposal::new(
            EpochProposal {
                epoch: member.epoch,
                parent: member.parent,
                items,
            },
            member.id,
            &member.signing_key,
        );
        self.broadcast(Message::Proposal(proposal.clone()));
        self.accept_proposal(member, proposal);
    }

    fn accept_proposal(&mut self, member: &mut Member<DB>, proposal: SignedProposal) {
        if self.round.proposal.is_some() {
            return;
        }
        let vote = member.sign_vote(proposal.proposal.hash());
        let _ = member
            .faults
            .record_vote(vote.vote.epoch, member.id, vote.vote.proposal_hash);
        self.round.proposal = Some(proposal);
        self.round.votes.insert(member.id, vote.clone());
        self.broadcast(Message::Vote(vote));
    }

    async fn tick(&mut self) {
        {
            let handle = self.member.clone();
            let mut member = handle.lock().await;
            if !self.round.contributed {
                self.contribute(&member);
            } else {
                // a full interval has passed; propose with whatever
                // arrived instead of waiting for stragglers
                self.maybe_propose(&mut member);
            }
        }
        self.try_finalize().await;
    }

    async fn handle(&mut self, message: Message) {
        match message {
            Message::Contribution(contribution) => {
                let handle = self.member.clone();
                let mut member = handle.lock().await;
                if contribution.contribution.epoch != member.epoch
                    || contribution.verify(&member.spec.members).is_err()
                    || member.faults.is_faulted(contribution.member)
                {
                    return;
                }
                self.round
                    .contributions
                    .insert(contribution.member, contribution.contribution.items);
                if self.round.contributions.len() >= member.spec.threshold() {
                    self.maybe_propose(&mut member);
                }
                drop(member);
                self.try_finalize().await;
            }
            Message::Proposal(proposal) => {
                {
                    let handle = self.member.clone();
                    let mut member = handle.lock().await;
                    if proposal.proposal.epoch != member.epoch
                        || proposal.verify(&member.spec.members).is_err()
                    {
                        return;
                    }
                    if member
                        .faults
                        .record_proposal(
                            proposal.proposal.epoch,
                            proposal.leader,
                            proposal.proposal.hash(),
                        )
                        .is_err()
                    {
                        warn!("member {} proposed twice in one epoch", proposal.leader);
                        return;
                    }
                    let active = member.faults.active_members(member.spec.members.len());
                    if epoch_leader(member.epoch, &active) != Some(proposal.leader) {
                        warn!(
                            "rejecting proposal from {}, not the epoch {} leader",
                            proposal.leader, member.epoch
                        );
                        return;
                    }
                    if proposal.proposal.parent != member.parent {
                        warn!("proposal for epoch {} has a different parent", member.epoch);
                        return;
                    }
                    self.accept_proposal(&mut member, proposal);
                }
                self.try_finalize().await;
            }
            Message::Vote(vote) => {
                {
                    let mut member = self.member.lock().await;
                    if vote.vote.epoch != member.epoch
                        || vote.verify(&member.spec.members).is_err()
                    {
                        return;
                    }
                    if member
                        .faults
                        .record_vote(vote.vote.epoch, vote.member, vote.vote.proposal_hash)
                        .is_err()
                    {
                        warn!("member {} voted twice in one epoch", vote.member);
                        return;
                    }
                    self.round.votes.insert(vote.member, vote);
                }
                self.try_finalize().await;
            }
            Message::Certificate(certificate) => {
                let current = { self.member.lock().await.epoch };
                if certificate.epoch() == current {
                    self.advance(*certificate).await;
                }
            }
        }
    }

    async fn try_finalize(&mut self) {
        let certificate = {
            let member = self.member.lock().await;
            let proposal = match &self.round.proposal {
                Some(proposal) => proposal,
                None => return,
            };
            let hash = proposal.proposal.hash();
            let votes: Vec<SignedVote> = self
                .round
                .votes
                .values()
                .filter(|vote| vote.vote.proposal_hash == hash)
                .cloned()
                .collect();
            if votes.len() < member.spec.threshold() {
                return;
            }
            EpochCertificate {
                proposal: proposal.clone(),
                votes,
            }
        };
        self.advance(certificate).await;
    }

    async fn advance(&mut self, certificate: EpochCertificate) {
        let (broadcasts, jobs, chain) = {
            let handle = self.member.clone();
            let mut member = handle.lock().await;
            let broadcasts = match member.apply_certificate(&certificate, false) {
                Ok(broadcasts) => broadcasts,
                Err(e) => {
                    warn!(
                        "could not apply certificate for epoch {}: {:?}",
                        certificate.epoch(),
                        e
                    );
                    return;
                }
            };
            debug!("epoch {} finalized", certificate.epoch());
            self.round = Round::default();
            self.broadcast(Message::Certificate(Box::new(certificate)));
            self.contribute(&member);
            (broadcasts, member.take_gateway_jobs(), member.chain.clone())
        };

        for tx in broadcasts {
            match chain.broadcast(&tx) {
                Ok(txid) => info!("broadcast withdrawal {}", txid),
                Err(e) => warn!("withdrawal broadcast failed: {:?}", e),
            }
        }

        for job in jobs {
            let member = self.member.clone();
            tokio::spawn(async move {
                match job.ln.pay(&job.bolt11).await {
                    Ok(preimage) => {
                        let mut member = member.lock().await;
                        if let Err(e) = member.submit_gateway_claim(job.contract, preimage) {
                            warn!("gateway claim for {} failed: {:?}", job.contract, e);
                        }
                    }
                    Err(e) => {
                        warn!("payment for contract {} failed: {:?}", job.contract, e);
                    }
                }
            });
        }
    }
}

/// Drive one member's participation in epoch agreement until its inbox
/// closes.
pub async fn run_consensus<DB: Database + Send + 'static>(
    member: Arc<Mutex<Member<DB>>>,
    mut incoming: mpsc::UnboundedReceiver<Message>,
    peers: Vec<mpsc::UnboundedSender<Message>>,
    epoch_duration: Duration,
) {
    let mut engine = Engine {
        member,
        peers,
        round: Round::default(),
    };
    let mut ticks = tokio::time::interval(epoch_duration);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticks.tick() => engine.tick().await,
            message = incoming.recv() => match message {
                Some(message) => engine.handle(message).await,
                None => return,
            },
        }
    }
}
