use crate::error::Error;
use crate::transaction::{sha256, OutPoint, TransactionId};
use async_trait::async_trait;
use ecash::{Amount, BlindedNotes};
use lightning_invoice::Bolt11Invoice;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_derive::{Deserialize as DeserializeDerive, Serialize as SerializeDerive};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Identifier of a funded outgoing contract, derived from its funding
/// outpoint.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContractId(pub [u8; 32]);

impl ContractId {
    pub fn from_funding(out_point: OutPoint) -> Self {
        let mut preimage = Vec::with_capacity(64);
        preimage.extend_from_slice(b"outgoing-contract");
        preimage.extend_from_slice(&out_point.txid.0);
        preimage.extend_from_slice(&out_point.out_idx.to_be_bytes());
        ContractId(sha256(&preimage))
    }

    /// Synthetic outpoint under which the resolution notes are issued.
    pub fn issuance_out_point(&self, outcome_tag: u32) -> OutPoint {
        let mut preimage = Vec::with_capacity(64);
        preimage.extend_from_slice(b"contract-resolution");
        preimage.extend_from_slice(&self.0);
        OutPoint {
            txid: TransactionId(sha256(&preimage)),
            out_idx: outcome_tag,
        }
    }
}

impl fmt::Display for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ContractId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContractId({})", hex::encode(self.0))
    }
}

impl Serialize for ContractId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for ContractId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let hex_str = String::deserialize(d)?;
        let bytes: [u8; 32] = hex::decode(&hex_str)
            .map_err(D::Error::custom)?
            .try_into()
            .map_err(|_| D::Error::custom("expected 32 bytes"))?;
        Ok(ContractId(bytes))
    }
}

/// Funds locked for one outgoing lightning payment. The gateway claims by
/// revealing the payment preimage before expiry; otherwise the funder gets
/// the refund issuance.
#[derive(Clone, Debug, PartialEq, SerializeDerive, DeserializeDerive)]
pub struct ContractOutput {
    pub payment_hash: [u8; 32],
    pub amount: Amount,
    /// Epoch counter after which the contract may be refunded.
    pub expiry_epoch: u64,
    /// Blinded serials issued back to the funder on expiry.
    pub refund: BlindedNotes,
}

#[derive(Clone, Debug, PartialEq, SerializeDerive, DeserializeDerive)]
pub enum ContractOutcome {
    /// The gateway paid the invoice and proves it with the preimage. The
    /// claim notes are the gateway's own blinded serials.
    Paid {
        preimage: [u8; 32],
        claim: BlindedNotes,
    },
    /// The expiry epoch passed without a claim; refund the funder.
    Expired,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, SerializeDerive, DeserializeDerive)]
pub enum ContractState {
    Funded,
    Claimed,
    Refunded,
}

#[derive(Clone, Debug)]
pub struct FundedContract {
    pub output: ContractOutput,
    pub funded_at: OutPoint,
    pub state: ContractState,
}

/// All contracts the federation has agreed to fund, in every member
/// identically. Resolutions turn into note issuances at synthetic
/// outpoints so the regular fetch path applies.
#[derive(Default)]
pub struct ContractLedger {
    contracts: HashMap<ContractId, FundedContract>,
}

impl ContractLedger {
    /// Structural checks applied before a funding output is accepted:
    /// the refund issuance must be worth exactly the locked amount.
    pub fn validate_funding(&self, output: &ContractOutput) -> Result<(), Error> {
        if output.refund.total_amount() != output.amount {
            return Err(Error::InvalidContract);
        }
        Ok(())
    }

    pub fn fund(&mut self, out_point: OutPoint, output: ContractOutput) -> ContractId {
        let id = ContractId::from_funding(out_point);
        self.contracts.insert(
            id,
            FundedContract {
                output,
                funded_at: out_point,
                state: ContractState::Funded,
            },
        );
        id
    }

    pub fn get(&self, id: &ContractId) -> Option<&FundedContract> {
        self.contracts.get(id)
    }

    pub fn state(&self, id: &ContractId) -> Option<ContractState> {
        self.contracts.get(id).map(|c| c.state)
    }

    pub fn validate_resolution(
        &self,
        id: &ContractId,
        outcome: &ContractOutcome,
        current_epoch: u64,
    ) -> Result<(), Error> {
        let contract = self.contracts.get(id).ok_or(Error::UnknownContract)?;
        if contract.state != ContractState::Funded {
            return Err(Error::ContractAlreadyResolved);
        }
        match outcome {
            ContractOutcome::Paid { preimage, claim } => {
                // past the expiry epoch only a refund may resolve, even
                // with the correct preimage
                if current_epoch >= contract.output.expiry_epoch {
                    return Err(Error::ContractExpired);
                }
                if sha256(preimage) != contract.output.payment_hash {
                    return Err(Error::WrongPreimage);
                }
                if claim.total_amount() != contract.output.amount {
                    return Err(Error::InvalidContract);
                }
                Ok(())
            }
            ContractOutcome::Expired => {
                if current_epoch < contract.output.expiry_epoch {
                    return Err(Error::ContractNotExpired);
                }
                Ok(())
            }
        }
    }

    /// Resolve the contract and return the issuance it triggers.
    pub fn apply_resolution(
        &mut self,
        id: &ContractId,
        outcome: &ContractOutcome,
        current_epoch: u64,
    ) -> Result<(OutPoint, BlindedNotes), Error> {
        self.validate_resolution(id, outcome, current_epoch)?;
        let contract = self.contracts.get_mut(id).ok_or(Error::UnknownContract)?;
        let issuance = match outcome {
            ContractOutcome::Paid { claim, .. } => {
                contract.state = ContractState::Claimed;
                (id.issuance_out_point(0), claim.clone())
            }
            ContractOutcome::Expired => {
                contract.state = ContractState::Refunded;
                (id.issuance_out_point(1), contract.output.refund.clone())
            }
        };
        Ok(issuance)
    }

    /// Contracts past their expiry epoch that are still unclaimed.
    pub fn expired(&self, current_epoch: u64) -> Vec<ContractId> {
        let mut ids: Vec<ContractId> = self
            .contracts
            .iter()
            .filter(|(_, c)| {
                c.state == ContractState::Funded && current_epoch >= c.output.expiry_epoch
            })
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Unclaimed contracts, for the gateway to match against registered
    /// invoices.
    pub fn funded(&self) -> impl Iterator<Item = (&ContractId, &FundedContract)> {
        self.contracts
            .iter()
            .filter(|(_, c)| c.state == ContractState::Funded)
    }
}

/// Seam to whatever pays invoices on the gateway's behalf. Returns the
/// payment preimage on success.
#[async_trait]
pub trait LightningClient: Send + Sync {
    async fn pay(&self, bolt11: &str) -> Result<[u8; 32], Error>;
}

/// Pays through an external lightning node's pay endpoint: the bolt11 goes
/// in the POST body, the preimage comes back hex-encoded.
pub struct HttpLightningClient {
    endpoint: String,
    client: hyper::Client<hyper::client::HttpConnector>,
}

impl HttpLightningClient {
    pub fn new(endpoint: String) -> Self {
        HttpLightningClient {
            endpoint,
            client: hyper::Client::new(),
        }
    }
}

#[async_trait]
impl LightningClient for HttpLightningClient {
    async fn pay(&self, bolt11: &str) -> Result<[u8; 32], Error> {
        let request = hyper::Request::builder()
            .method(hyper::Method::POST)
            .uri(&self.endpoint)
            .body(hyper::Body::from(bolt11.to_string()))
            .map_err(|_| Error::PaymentFailed)?;
        let response = self
            .client
            .request(request)
            .await
            .map_err(|_| Error::PaymentFailed)?;
        if !response.status().is_success() {
            return Err(Error::PaymentFailed);
        }
        let body = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(|_| Error::PaymentFailed)?;
        let hex_str = String::from_utf8(body.to_vec()).map_err(|_| Error::PaymentFailed)?;
        let preimage: [u8; 32] = hex::decode(hex_str.trim())
            .map_err(|_| Error::PaymentFailed)?
            .try_into()
            .map_err(|_| Error::PaymentFailed)?;
        Ok(preimage)
    }
}

/// Payment hash and amount of a bolt11 invoice. Sub-satoshi remainders
/// are rounded up so the gateway is never underfunded.
pub fn decode_invoice(bolt11: &str) -> Result<([u8; 32], Amount), Error> {
    let invoice = Bolt11Invoice::from_str(bolt11).map_err(|_| Error::InvalidInvoice)?;
    let payment_hash: [u8; 32] = invoice
        .payment_hash()
        .as_ref()
        .try_into()
        .map_err(|_| Error::InvalidInvoice)?;
    let msats = invoice.amount_milli_satoshis().ok_or(Error::InvalidInvoice)?;
    Ok((payment_hash, Amount::from_sats((msats + 999) / 1000)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecash::{blind, Serial};
    use rand::rngs::OsRng;

    fn blinded(amounts: &[u64]) -> BlindedNotes {
        amounts
            .iter()
            .map(|&sats| {
                let serial = Serial::random(&mut OsRng);
                let (_key, message) = blind(&serial, &mut OsRng);
                (Amount::from_sats(sats), message)
            })
            .collect()
    }

    fn contract(preimage: [u8; 32], amount: u64, expiry_epoch: u64) -> ContractOutput {
        ContractOutput {
            payment_hash: sha256(&preimage),
            amount: Amount::from_sats(amount),
            expiry_epoch,
            refund: blinded(&[amount]),
        }
    }

    fn funding_point(n: u8) -> OutPoint {
        OutPoint {
            txid: TransactionId([n; 32]),
            out_idx: 0,
        }
    }

    #[test]
    fn claim_with_correct_preimage() {
        let preimage = [3u8; 32];
        let mut ledger = ContractLedger::default();
        let id = ledger.fund(funding_point(1), contract(preimage, 1_000, 100));

        let outcome = ContractOutcome::Paid {
            preimage,
            claim: blinded(&[1_000]),
        };
        let (out_point, notes) = ledger.apply_resolution(&id, &outcome, 5).unwrap();
        assert_eq!(notes.total_amount(), Amount::from_sats(1_000));
        assert_eq!(out_point.out_idx, 0);
        assert_eq!(ledger.state(&id), Some(ContractState::Claimed));

        // a second resolution of either kind is rejected
        assert!(matches!(
            ledger.apply_resolution(&id, &ContractOutcome::Expired, 200),
            Err(Error::ContractAlreadyResolved)
        ));
    }

    #[test]
    fn claim_past_expiry_is_rejected() {
        let preimage = [3u8; 32];
        let mut ledger = ContractLedger::default();
        let id = ledger.fund(funding_point(1), contract(preimage, 1_000, 100));

        // the correct preimage no longer claims once the expiry passed
        let outcome = ContractOutcome::Paid {
            preimage,
            claim: blinded(&[1_000]),
        };
        assert!(matches!(
            ledger.apply_resolution(&id, &outcome, 200),
            Err(Error::ContractExpired)
        ));
        assert_eq!(ledger.state(&id), Some(ContractState::Funded));

        // the refund path still resolves it
        ledger
            .apply_resolution(&id, &ContractOutcome::Expired, 200)
            .unwrap();
        assert_eq!(ledger.state(&id), Some(ContractState::Refunded));
    }

    #[test]
    fn claim_with_wrong_preimage_is_rejected() {
        let mut ledger = ContractLedger::default();
        let id = ledger.fund(funding_point(1), contract([3u8; 32], 1_000, 100));

        let outcome = ContractOutcome::Paid {
            preimage: [4u8; 32],
            claim: blinded(&[1_000]),
        };
        assert!(matches!(
            ledger.apply_resolution(&id, &outcome, 5),
            Err(Error::WrongPreimage)
        ));
        assert_eq!(ledger.state(&id), Some(ContractState::Funded));
    }

    #[test]
    fn underfunded_claim_is_rejected() {
        let preimage = [3u8; 32];
        let mut ledger = ContractLedger::default();
        let id = ledger.fund(funding_point(1), contract(preimage, 1_000, 100));

        let outcome = ContractOutcome::Paid {
            preimage,
            claim: blinded(&[999]),
        };
        assert!(matches!(
            ledger.apply_resolution(&id, &outcome, 5),
            Err(Error::InvalidContract)
        ));
    }

    #[test]
    fn refund_only_after_expiry() {
        let mut ledger = ContractLedger::default();
        let id = ledger.fund(funding_point(1), contract([3u8; 32], 1_000, 100));

        assert!(matches!(
            ledger.apply_resolution(&id, &ContractOutcome::Expired, 99),
            Err(Error::ContractNotExpired)
        ));
        assert!(ledger.expired(99).is_empty());

        assert_eq!(ledger.expired(100), vec![id]);
        let (out_point, notes) = ledger
            .apply_resolution(&id, &ContractOutcome::Expired, 100)
            .unwrap();
        assert_eq!(out_point.out_idx, 1);
        assert_eq!(notes.total_amount(), Amount::from_sats(1_000));
        assert_eq!(ledger.state(&id), Some(ContractState::Refunded));
    }

    #[tokio::test]
    async fn http_client_reads_the_preimage() {
        use hyper::service::{make_service_fn, service_fn};

        let preimage = [9u8; 32];
        let make_service = make_service_fn(move |_| async move {
            Ok::<_, hyper::Error>(service_fn(move |_req| async move {
                Ok::<_, hyper::Error>(hyper::Response::new(hyper::Body::from(hex::encode(
                    preimage,
                ))))
            }))
        });
        let server = hyper::Server::bind(&"127.0.0.1:0".parse().unwrap()).serve(make_service);
        let addr = server.local_addr();
        tokio::spawn(server);

        let client = HttpLightningClient::new(format!("http://{addr}/pay"));
        assert_eq!(client.pay("lnbcrt1...").await.unwrap(), preimage);
    }

    #[test]
    fn funding_requires_matching_refund() {
        let ledger = ContractLedger::default();
        let mut output = contract([3u8; 32], 1_000, 100);
        output.refund = blinded(&[500]);
        assert!(matches!(
            ledger.validate_funding(&output),
            Err(Error::InvalidContract)
        ));
    }
}
