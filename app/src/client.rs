//! Client-side wallet: holds bearer notes, builds ledger transactions
//! and waits for the federation to issue against them. Clients never see
//! other clients; everything goes through the [`FederationApi`] seam.

use crate::config::FederationSpec;
use crate::error::Error;
use crate::ln::{decode_invoice, ContractId, ContractOutput, ContractState};
use crate::member::Member;
use crate::transaction::{Input, LedgerTransaction, OutPoint, Output, TransactionId};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bridge::bitcoin::address::NetworkUnchecked;
use bridge::bitcoin::Address;
use bridge::{Database, PegInProof};
use ecash::{
    blind, split_amount, AggregatePublicKey, Amount, BlindedNotes, BlindedSignature, BlindingKey,
    Note, Notes, Serial, Tiered, TieredMulti,
};
use rand::rngs::OsRng;
use rand::{CryptoRng, RngCore};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const FETCH_TIMEOUT: Duration = Duration::from_secs(60);
const PAYMENT_TIMEOUT: Duration = Duration::from_secs(120);

/// Blinding material for one issuance: the serials and blinding keys the
/// blinded request was built from. Whoever holds this can unblind the
/// combined signatures into spendable notes.
pub struct IssuanceRequest {
    entries: TieredMulti<(Serial, BlindingKey)>,
}

impl IssuanceRequest {
    /// Request `amount` split into the configured denominations.
    pub fn new<R: RngCore + CryptoRng>(
        amount: Amount,
        tiers: &[Amount],
        rng: &mut R,
    ) -> Result<(BlindedNotes, Self), Error> {
        let denominations = split_amount(amount, tiers.iter().copied())?;
        Ok(Self::from_denominations(&denominations, rng))
    }

    pub fn from_denominations<R: RngCore + CryptoRng>(
        denominations: &[Amount],
        rng: &mut R,
    ) -> (BlindedNotes, Self) {
        let mut blinded = BlindedNotes::default();
        let mut entries = TieredMulti::default();
        for &tier in denominations {
            let serial = Serial::random(rng);
            let (key, message) = blind(&serial, rng);
            blinded.push(tier, message);
            entries.push(tier, (serial, key));
        }
        (blinded, IssuanceRequest { entries })
    }

    pub fn amount(&self) -> Amount {
        self.entries.total_amount()
    }

    /// Unblind the combined signatures and verify every note against the
    /// federation key before trusting it.
    pub fn finalize(
        &self,
        signatures: &TieredMulti<BlindedSignature>,
        keys: &Tiered<AggregatePublicKey>,
    ) -> Result<Notes, Error> {
        if !self.entries.structure_matches(signatures) {
            return Err(Error::EcashError(ecash::Error::TierMismatch));
        }
        let mut notes = Notes::default();
        for ((tier, (serial, key)), (_, combined)) in
            self.entries.iter_items().zip(signatures.iter_items())
        {
            let aggregate = keys
                .get(tier)
                .ok_or(Error::EcashError(ecash::Error::UnknownDenomination(tier)))?;
            let note = Note {
                serial: *serial,
                signature: ecash::unblind(combined, key, aggregate),
            };
            if !note.verify(aggregate) {
                return Err(Error::EcashError(ecash::Error::InvalidSignature));
            }
            notes.push(tier, note);
        }
        Ok(notes)
    }
}

/// What a client needs from any federation member. The in-process
/// implementation talks straight to a member; a remote one would wrap
/// the JSON-RPC surface.
#[async_trait]
pub trait FederationApi: Send + Sync {
    async fn submit_transaction(
        &self,
        transaction: LedgerTransaction,
    ) -> Result<TransactionId, Error>;
    async fn fetch_output(
        &self,
        out_point: OutPoint,
    ) -> Result<Option<TieredMulti<BlindedSignature>>, Error>;
    async fn deposit_address(&self) -> Result<Address, Error>;
    async fn announce_invoice(&self, bolt11: &str) -> Result<(), Error>;
    async fn contract_state(&self, id: &ContractId) -> Result<Option<ContractState>, Error>;
    async fn validate_notes(&self, notes: &Notes) -> Result<(), Error>;
    async fn current_epoch(&self) -> Result<u64, Error>;
}

pub struct InProcessApi<DB: Database>(pub Arc<Mutex<Member<DB>>>);

#[async_trait]
impl<DB: Database + Send + 'static> FederationApi for InProcessApi<DB> {
    async fn submit_transaction(
        &self,
        transaction: LedgerTransaction,
    ) -> Result<TransactionId, Error> {
        self.0.lock().await.submit_transaction(transaction)
    }

    async fn fetch_output(
        &self,
        out_point: OutPoint,
    ) -> Result<Option<TieredMulti<BlindedSignature>>, Error> {
        self.0.lock().await.output_signatures(out_point)
    }

    async fn deposit_address(&self) -> Result<Address, Error> {
        Ok(self.0.lock().await.deposit_address())
    }

    async fn announce_invoice(&self, bolt11: &str) -> Result<(), Error> {
        self.0.lock().await.announce_invoice(bolt11)
    }

    async fn contract_state(&self, id: &ContractId) -> Result<Option<ContractState>, Error> {
        Ok(self.0.lock().await.contract_state(id))
    }

    async fn validate_notes(&self, notes: &Notes) -> Result<(), Error> {
        self.0.lock().await.validate_notes(notes)
    }

    async fn current_epoch(&self) -> Result<u64, Error> {
        Ok(self.0.lock().await.current_epoch())
    }
}

/// Public federation parameters a client needs.
#[derive(Clone)]
pub struct ClientConfig {
    pub note_tiers: Vec<Amount>,
    pub aggregate_keys: Tiered<AggregatePublicKey>,
    pub tx_fee: Amount,
    pub contract_expiry_epochs: u64,
}

impl From<&FederationSpec> for ClientConfig {
    fn from(spec: &FederationSpec) -> Self {
        ClientConfig {
            note_tiers: spec.note_tiers.clone(),
            aggregate_keys: spec.aggregate_keys.clone(),
            tx_fee: spec.tx_fee,
            contract_expiry_epochs: spec.contract_expiry_epochs,
        }
    }
}

pub fn encode_token(notes: &Notes) -> String {
    let encoded = rmp_serde::to_vec(notes).expect("in-memory note encoding cannot fail");
    BASE64.encode(encoded)
}

pub fn decode_token(token: &str) -> Result<Notes, Error> {
    let bytes = BASE64.decode(token).map_err(|_| Error::CodecError)?;
    Ok(rmp_serde::from_slice(&bytes)?)
}

pub struct ClientWallet<A: FederationApi> {
    api: A,
    config: ClientConfig,
    notes: Notes,
}

impl<A: FederationApi> ClientWallet<A> {
    pub fn new(api: A, config: ClientConfig) -> Self {
        ClientWallet {
            api,
            config,
            notes: Notes::default(),
        }
    }

    pub fn balance(&self) -> Amount {
        self.notes.total_amount()
    }

    pub async fn deposit_address(&self) -> Result<Address, Error> {
        self.api.deposit_address().await
    }

    /// Claim a confirmed deposit. The federation fee comes off the
    /// deposited value; the rest lands as notes.
    pub async fn peg_in(&mut self, proof: PegInProof) -> Result<Amount, Error> {
        let value = Amount::from_sats(proof.tx_output().value);
        let amount = value
            .checked_sub(self.config.tx_fee)
            .ok_or(Error::InsufficientBalance)?;
        let (blinded, request) =
            IssuanceRequest::new(amount, &self.config.note_tiers, &mut OsRng)?;
        let transaction = LedgerTransaction {
            inputs: vec![Input::PegIn(Box::new(proof))],
            outputs: vec![Output::Notes(blinded)],
        };
        let out_point = transaction.out_point(0);
        self.api.submit_transaction(transaction).await?;
        self.await_issuance(out_point, &request).await
    }

    /// Produce a bearer token worth exactly `amount`, removing the notes
    /// from this wallet. Splits the holding through a reissue first when
    /// no exact subset exists.
    pub async fn spend(&mut self, amount: Amount) -> Result<String, Error> {
        let notes = self.take_or_split(amount).await?;
        Ok(encode_token(&notes))
    }

    /// Redeem a received token by reissuing its notes as our own. The
    /// federation fee comes off the token value.
    pub async fn receive(&mut self, token: &str) -> Result<Amount, Error> {
        let notes = decode_token(token)?;
        let amount = notes
            .total_amount()
            .checked_sub(self.config.tx_fee)
            .ok_or(Error::InsufficientBalance)?;
        let (blinded, request) =
            IssuanceRequest::new(amount, &self.config.note_tiers, &mut OsRng)?;
        let transaction = LedgerTransaction {
            inputs: vec![Input::Notes(notes)],
            outputs: vec![Output::Notes(blinded)],
        };
        let out_point = transaction.out_point(0);
        self.api.submit_transaction(transaction).await?;
        self.await_issuance(out_point, &request).await
    }

    /// Check a token against a federation member without redeeming it.
    pub async fn validate_token(&self, token: &str) -> Result<Amount, Error> {
        let notes = decode_token(token)?;
        self.api.validate_notes(&notes).await?;
        Ok(notes.total_amount())
    }

    /// Withdraw on-chain. `amount` leaves the ledger; network fees are
    /// deducted from it by the federation.
    pub async fn peg_out(
        &mut self,
        address: Address<NetworkUnchecked>,
        amount: Amount,
    ) -> Result<TransactionId, Error> {
        let notes = self.take_or_split(amount + self.config.tx_fee).await?;
        let backup = notes.clone();
        let transaction = LedgerTransaction {
            inputs: vec![Input::Notes(notes)],
            outputs: vec![Output::PegOut { address, amount }],
        };
        match self.api.submit_transaction(transaction).await {
            Ok(txid) => Ok(txid),
            Err(e) => {
                self.insert_notes(backup);
                Err(e)
            }
        }
    }

    /// Pay a lightning invoice by funding an outgoing contract and
    /// waiting for the gateway to claim it. On refund the locked value
    /// returns to this wallet and the payment counts as failed.
    pub async fn pay_invoice(&mut self, bolt11: &str) -> Result<(), Error> {
        let (payment_hash, amount) = decode_invoice(bolt11)?;
        let (refund, refund_request) =
            IssuanceRequest::new(amount, &self.config.note_tiers, &mut OsRng)?;
        let expiry_epoch =
            self.api.current_epoch().await? + self.config.contract_expiry_epochs;

        let notes = self.take_or_split(amount + self.config.tx_fee).await?;
        let backup = notes.clone();
        let transaction = LedgerTransaction {
            inputs: vec![Input::Notes(notes)],
            outputs: vec![Output::Contract(ContractOutput {
                payment_hash,
                amount,
                expiry_epoch,
                refund,
            })],
        };
        let contract = ContractId::from_funding(transaction.out_point(0));

        // announce first so the gateway recognizes the contract the
        // moment it funds
        self.api.announce_invoice(bolt11).await?;
        if let Err(e) = self.api.submit_transaction(transaction).await {
            self.insert_notes(backup);
            return Err(e);
        }

        let started = Instant::now();
        loop {
            match self.api.contract_state(&contract).await? {
                Some(ContractState::Claimed) => return Ok(()),
                Some(ContractState::Refunded) => {
                    self.await_issuance(contract.issuance_out_point(1), &refund_request)
                        .await?;
                    return Err(Error::PaymentFailed);
                }
                _ => {}
            }
            if started.elapsed() > PAYMENT_TIMEOUT {
                return Err(Error::Timeout);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Poll until the issuance completes, then unblind into the wallet.
    async fn await_issuance(
        &mut self,
        out_point: OutPoint,
        request: &IssuanceRequest,
    ) -> Result<Amount, Error> {
        let started = Instant::now();
        loop {
            if let Some(signatures) = self.api.fetch_output(out_point).await? {
                let notes = request.finalize(&signatures, &self.config.aggregate_keys)?;
                let amount = notes.total_amount();
                self.insert_notes(notes);
                return Ok(amount);
            }
            if started.elapsed() > FETCH_TIMEOUT {
                return Err(Error::Timeout);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    fn insert_notes(&mut self, notes: Notes) {
        for (tier, note) in notes.into_iter_items() {
            self.notes.push(tier, note);
        }
    }

    /// Remove an exact subset worth `amount`, largest denominations
    /// first. Fails without touching the holding if no subset fits.
    fn take_exact(&mut self, amount: Amount) -> Option<Notes> {
        let mut remaining = amount.sats;
        let mut take_counts: BTreeMap<Amount, usize> = BTreeMap::new();
        let tiers: Vec<Amount> = self.notes.iter_tiers().map(|(tier, _)| tier).collect();
        for tier in tiers.into_iter().rev() {
            let available = self.notes.get_tier(tier).map(Vec::len).unwrap_or(0);
            let take = ((remaining / tier.sats) as usize).min(available);
            if take > 0 {
                take_counts.insert(tier, take);
                remaining -= tier.sats * take as u64;
            }
        }
        if remaining != 0 {
            return None;
        }

        let mut selected = Notes::default();
        let mut rest = Notes::default();
        for (tier, note) in std::mem::take(&mut self.notes).into_iter_items() {
            match take_counts.get_mut(&tier) {
                Some(count) if *count > 0 => {
                    *count -= 1;
                    selected.push(tier, note);
                }
                _ => rest.push(tier, note),
            }
        }
        self.notes = rest;
        Some(selected)
    }

    /// Exact subset worth `target`, reissuing the whole holding into
    /// fitting denominations when necessary.
    async fn take_or_split(&mut self, target: Amount) -> Result<Notes, Error> {
        if self.balance() < target {
            return Err(Error::InsufficientBalance);
        }
        if let Some(notes) = self.take_exact(target) {
            return Ok(notes);
        }

        let all = std::mem::take(&mut self.notes);
        let backup = all.clone();
        let total = all.total_amount();
        let remainder = total
            .checked_sub(target)
            .and_then(|r| r.checked_sub(self.config.tx_fee))
            .ok_or(Error::InsufficientBalance)?;

        let mut denominations =
            split_amount(target, self.config.note_tiers.iter().copied())?;
        denominations.extend(split_amount(
            remainder,
            self.config.note_tiers.iter().copied(),
        )?);
        let (blinded, request) = IssuanceRequest::from_denominations(&denominations, &mut OsRng);

        let transaction = LedgerTransaction {
            inputs: vec![Input::Notes(all)],
            outputs: vec![Output::Notes(blinded)],
        };
        let out_point = transaction.out_point(0);
        if let Err(e) = self.api.submit_transaction(transaction).await {
            self.insert_notes(backup);
            return Err(e);
        }
        self.await_issuance(out_point, &request).await?;

        self.take_exact(target).ok_or(Error::InsufficientBalance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecash::{combine_shares, dealer_keygen, unblind};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    // the api is never touched by the selection and token tests
    struct NullApi;

    #[async_trait]
    impl FederationApi for NullApi {
        async fn submit_transaction(
            &self,
            _: LedgerTransaction,
        ) -> Result<TransactionId, Error> {
            unreachable!()
        }
        async fn fetch_output(
            &self,
            _: OutPoint,
        ) -> Result<Option<TieredMulti<BlindedSignature>>, Error> {
            unreachable!()
        }
        async fn deposit_address(&self) -> Result<Address, Error> {
            unreachable!()
        }
        async fn announce_invoice(&self, _: &str) -> Result<(), Error> {
            unreachable!()
        }
        async fn contract_state(&self, _: &ContractId) -> Result<Option<ContractState>, Error> {
            unreachable!()
        }
        async fn validate_notes(&self, _: &Notes) -> Result<(), Error> {
            unreachable!()
        }
        async fn current_epoch(&self) -> Result<u64, Error> {
            unreachable!()
        }
    }

    fn tiers() -> Vec<Amount> {
        (0..16).map(|i| Amount::from_sats(1 << i)).collect()
    }

    /// A 1-of-1 signer producing real notes without consensus.
    fn wallet_with(denominations: &[u64]) -> ClientWallet<NullApi> {
        let mut rng = StdRng::seed_from_u64(5);
        let tiers = tiers();
        let (aggregates, commitments, secrets) = dealer_keygen(1, 1, &tiers, &mut rng);

        let mut notes = Notes::default();
        for &sats in denominations {
            let tier = Amount::from_sats(sats);
            let serial = Serial::random(&mut rng);
            let (key, message) = blind(&serial, &mut rng);
            let share = secrets[0].get(tier).unwrap().sign_blinded(&message);
            let commitment = commitments.get(tier).unwrap()[0];
            let combined = combine_shares(&message, &[(share, commitment)], 1).unwrap();
            let aggregate = aggregates.get(tier).unwrap();
            notes.push(
                tier,
                Note {
                    serial,
                    signature: unblind(&combined, &key, aggregate),
                },
            );
        }

        let mut wallet = ClientWallet::new(
            NullApi,
            ClientConfig {
                note_tiers: tiers,
                aggregate_keys: aggregates,
                tx_fee: Amount::ZERO,
                contract_expiry_epochs: 10,
            },
        );
        wallet.insert_notes(notes);
        wallet
    }

    #[test]
    fn exact_selection_prefers_large_denominations() {
        let mut wallet = wallet_with(&[1, 2, 4, 8]);
        let selected = wallet.take_exact(Amount::from_sats(12)).unwrap();
        assert_eq!(selected.total_amount(), Amount::from_sats(12));
        assert_eq!(selected.item_count(), 2);
        assert_eq!(wallet.balance(), Amount::from_sats(3));
    }

    #[test]
    fn selection_without_exact_subset_fails_cleanly() {
        let mut wallet = wallet_with(&[8, 8]);
        assert!(wallet.take_exact(Amount::from_sats(12)).is_none());
        // the holding is untouched
        assert_eq!(wallet.balance(), Amount::from_sats(16));
    }

    #[test]
    fn tokens_roundtrip_through_base64() {
        let wallet = wallet_with(&[1, 4]);
        let token = encode_token(&wallet.notes);
        let decoded = decode_token(&token).unwrap();
        assert_eq!(decoded, wallet.notes);
        assert_eq!(decoded.total_amount(), Amount::from_sats(5));
    }

    #[test]
    fn garbage_tokens_are_rejected() {
        assert!(matches!(decode_token("not base64!"), Err(Error::CodecError)));
        let valid_base64 = BASE64.encode([1u8, 2, 3]);
        assert!(matches!(
            decode_token(&valid_base64),
            Err(Error::CodecError)
        ));
    }
}
