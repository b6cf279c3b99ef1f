use crate::ln::ContractOutput;
use bridge::bitcoin::address::NetworkUnchecked;
use bridge::bitcoin::Address;
use bridge::PegInProof;
use ecash::{Amount, BlindedNotes, Notes};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_derive::{Deserialize as DeserializeDerive, Serialize as SerializeDerive};
use sha2::{Digest, Sha256};
use std::fmt;

pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Hash of the canonical encoding of a [`LedgerTransaction`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub [u8; 32]);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({})", hex::encode(self.0))
    }
}

impl Serialize for TransactionId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for TransactionId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let hex_str = String::deserialize(d)?;
        let bytes: [u8; 32] = hex::decode(&hex_str)
            .map_err(D::Error::custom)?
            .try_into()
            .map_err(|_| D::Error::custom("expected 32 bytes"))?;
        Ok(TransactionId(bytes))
    }
}

/// Reference to one output of an agreed ledger transaction. Issuances are
/// tracked under these, including the synthetic ones minted for contract
/// resolutions.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, SerializeDerive, DeserializeDerive,
)]
pub struct OutPoint {
    pub txid: TransactionId,
    pub out_idx: u32,
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.out_idx)
    }
}

#[derive(Clone, Debug, PartialEq, SerializeDerive, DeserializeDerive)]
pub enum Input {
    /// Spend previously issued notes, revealing their serials.
    Notes(Notes),
    /// Claim a confirmed on-chain deposit to the federation.
    PegIn(Box<PegInProof>),
}

#[derive(Clone, Debug, PartialEq, SerializeDerive, DeserializeDerive)]
pub enum Output {
    /// Issue new notes against the blinded serials.
    Notes(BlindedNotes),
    /// Withdraw on-chain. Network fees come out of `amount`.
    PegOut {
        address: Address<NetworkUnchecked>,
        amount: Amount,
    },
    /// Lock funds for an outgoing lightning payment.
    Contract(ContractOutput),
}

/// An atomic transfer on the issuance ledger. Inputs must cover the
/// outputs plus the federation fee exactly; validation rejects anything
/// else so funds can neither be printed nor silently burned.
#[derive(Clone, Debug, PartialEq, SerializeDerive, DeserializeDerive)]
pub struct LedgerTransaction {
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
}

impl LedgerTransaction {
    pub fn txid(&self) -> TransactionId {
        let encoded =
            rmp_serde::to_vec(self).expect("in-memory transaction encoding cannot fail");
        TransactionId(sha256(&encoded))
    }

    /// Total value entering the transaction. Peg-in value is read from the
    /// proven output, never from a client-supplied number.
    pub fn input_amount(&self) -> Amount {
        self.inputs
            .iter()
            .map(|input| match input {
                Input::Notes(notes) => notes.total_amount(),
                Input::PegIn(proof) => Amount::from_sats(proof.tx_output().value),
            })
            .sum()
    }

    pub fn output_amount(&self) -> Amount {
        self.outputs
            .iter()
            .map(|output| match output {
                Output::Notes(notes) => notes.total_amount(),
                Output::PegOut { amount, .. } => *amount,
                Output::Contract(contract) => contract.amount,
            })
            .sum()
    }

    pub fn out_point(&self, out_idx: u32) -> OutPoint {
        OutPoint {
            txid: self.txid(),
            out_idx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecash::{blind, Serial};
    use rand::rngs::OsRng;

    fn blinded_request(amounts: &[u64]) -> BlindedNotes {
        amounts
            .iter()
            .map(|&sats| {
                let serial = Serial::random(&mut OsRng);
                let (_key, blinded) = blind(&serial, &mut OsRng);
                (Amount::from_sats(sats), blinded)
            })
            .collect()
    }

    #[test]
    fn txid_is_stable_and_content_addressed() {
        let tx = LedgerTransaction {
            inputs: vec![],
            outputs: vec![Output::Notes(blinded_request(&[1, 2, 4]))],
        };
        assert_eq!(tx.txid(), tx.clone().txid());

        let other = LedgerTransaction {
            inputs: vec![],
            outputs: vec![Output::Notes(blinded_request(&[1, 2, 4]))],
        };
        // fresh serials, different id
        assert_ne!(tx.txid(), other.txid());
    }

    #[test]
    fn amounts_are_summed_per_side() {
        let address: Address<NetworkUnchecked> = "bcrt1qs758ursh4q9z627kt3pp5yysm78ddny6txaqgw"
            .parse()
            .unwrap();
        let tx = LedgerTransaction {
            inputs: vec![],
            outputs: vec![
                Output::Notes(blinded_request(&[8, 8])),
                Output::PegOut {
                    address,
                    amount: Amount::from_sats(500),
                },
            ],
        };
        assert_eq!(tx.input_amount(), Amount::ZERO);
        assert_eq!(tx.output_amount(), Amount::from_sats(516));
    }

    #[test]
    fn id_serde_is_hex() {
        let id = TransactionId([7; 32]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", hex::encode([7u8; 32])));
        let decoded: TransactionId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, decoded);
    }
}
