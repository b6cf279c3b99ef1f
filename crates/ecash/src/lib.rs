mod blind;
mod keys;
mod tiered;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, AddAssign, Sub};
use thiserror::Error;

pub use blind::{
    blind, combine_shares, unblind, BlindedMessage, BlindedSignature, BlindingKey, Serial,
    ShareSignature, Signature,
};
pub use keys::{dealer_keygen, AggregatePublicKey, PublicKeyShare, SecretKeyShare};
pub use tiered::{split_amount, Tiered, TieredMulti};

/// Notes held by a client, spendable exactly once each.
pub type Notes = TieredMulti<Note>;
/// Blinded serials awaiting federation signatures, one sub-list per tier.
pub type BlindedNotes = TieredMulti<BlindedMessage>;
/// One member's blind signature shares for an issuance, aligned with
/// the [`BlindedNotes`] they were requested for.
pub type NoteShares = TieredMulti<ShareSignature>;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("Not enough signature shares: got {got}, need {need}")]
    InsufficientShares { got: usize, need: usize },
    #[error("Invalid signature share from member {0}")]
    InvalidShare(u16),
    #[error("Share tiers do not line up with the requested notes")]
    TierMismatch,
    #[error("Unknown denomination {0}")]
    UnknownDenomination(Amount),
    #[error("Invalid note signature")]
    InvalidSignature,
    #[error("Malformed curve point encoding")]
    InvalidEncoding,
    #[error("Amount {0} is not representable in the configured denominations")]
    NotRepresentable(Amount),
}

/// Value in satoshi. All ledger arithmetic happens in this unit.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Amount {
    pub sats: u64,
}

impl Amount {
    pub const ZERO: Amount = Amount { sats: 0 };

    pub const fn from_sats(sats: u64) -> Self {
        Amount { sats }
    }

    pub fn saturating_sub(self, other: Amount) -> Amount {
        Amount {
            sats: self.sats.saturating_sub(other.sats),
        }
    }

    pub fn checked_sub(self, other: Amount) -> Option<Amount> {
        self.sats.checked_sub(other.sats).map(Amount::from_sats)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} sat", self.sats)
    }
}

impl Add for Amount {
    type Output = Amount;
    fn add(self, rhs: Amount) -> Amount {
        Amount::from_sats(self.sats + rhs.sats)
    }
}

impl AddAssign for Amount {
    fn add_assign(&mut self, rhs: Amount) {
        self.sats += rhs.sats;
    }
}

impl Sub for Amount {
    type Output = Amount;
    fn sub(self, rhs: Amount) -> Amount {
        Amount::from_sats(self.sats - rhs.sats)
    }
}

impl Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Amount {
        Amount::from_sats(iter.map(|a| a.sats).sum())
    }
}

/// An unblinded bearer token. Whoever holds a valid (serial, signature)
/// pair can spend it; the federation only ever learns the serial when
/// the note is spent, not when it was issued.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub serial: Serial,
    pub signature: Signature,
}

impl Note {
    /// Check the note against the federation's aggregate key for its tier.
    pub fn verify(&self, key: &AggregatePublicKey) -> bool {
        blind::verify(key, &self.serial, &self.signature)
    }
}
