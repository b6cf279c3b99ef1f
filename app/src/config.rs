use bridge::bitcoin::Network;
use bridge::{BitcoinPublicKey, BitcoinSecretKey, FederationDescriptor};
use ecash::{dealer_keygen, AggregatePublicKey, Amount, PublicKeyShare, SecretKeyShare, Tiered};
use ed25519_dalek::{SigningKey, VerifyingKey};
use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::consensus::vote_threshold;

/// The public parameters every member and client agrees on before the
/// federation produces its first epoch.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FederationSpec {
    /// Epoch duration, milliseconds
    pub epoch_duration: u64,
    /// Consensus keys, indexed by member id
    pub members: Vec<VerifyingKey>,
    /// Member keys for the bitcoin withdrawal multisig
    pub bitcoin_pubkeys: Vec<BitcoinPublicKey>,
    /// Note denominations, ascending
    pub note_tiers: Vec<Amount>,
    /// Aggregate note verification key per tier
    pub aggregate_keys: Tiered<AggregatePublicKey>,
    /// Per-member share commitments, outer index = member id
    pub member_note_keys: Vec<Tiered<PublicKeyShare>>,
    /// Confirmations a deposit needs before a member accepts its claim
    pub finality_confirmations: u32,
    /// Lifetime of an outgoing lightning contract, in epochs
    pub contract_expiry_epochs: u64,
    /// Flat fee charged on every ledger transaction
    pub tx_fee: Amount,
    /// Fee rate for withdrawal transactions, sat/vB
    pub pegout_fee_rate: f32,
    pub network: Network,
}

impl FederationSpec {
    pub fn threshold(&self) -> usize {
        vote_threshold(self.members.len())
    }

    pub fn descriptor(&self) -> FederationDescriptor {
        FederationDescriptor::new(self.bitcoin_pubkeys.clone(), self.threshold(), self.network)
    }
}

/// One member's private key material.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberSecrets {
    pub consensus_key: SigningKey,
    pub bitcoin_key: BitcoinSecretKey,
    pub note_keys: Tiered<SecretKeyShare>,
}

const DEV_SEED: u64 = 42;
const DEV_MEMBERS: usize = 4;

/// Powers of two up to 2^15 sats.
fn dev_tiers() -> Vec<Amount> {
    (0..16).map(|i| Amount::from_sats(1 << i)).collect()
}

/// A deterministic 4-member regtest federation. Every process deriving
/// from the same seed ends up with the same spec and the same secrets,
/// so dev nodes need no key exchange.
pub fn dev_federation() -> (FederationSpec, Vec<MemberSecrets>) {
    let mut rng = StdRng::seed_from_u64(DEV_SEED);
    let tiers = dev_tiers();

    let consensus_keys: Vec<SigningKey> = (0..DEV_MEMBERS)
        .map(|_| SigningKey::generate(&mut rng))
        .collect();
    let bitcoin_keys: Vec<BitcoinSecretKey> = (0..DEV_MEMBERS)
        .map(|_| BitcoinSecretKey::new(&mut rng))
        .collect();

    let threshold = vote_threshold(DEV_MEMBERS);
    let (aggregate_keys, commitments, note_keys) =
        dealer_keygen(threshold, DEV_MEMBERS, &tiers, &mut rng);

    let member_note_keys = (0..DEV_MEMBERS)
        .map(|member| {
            tiers
                .iter()
                .map(|&tier| {
                    let commitment = commitments
                        .get(tier)
                        .expect("tier was generated above")[member];
                    (tier, commitment)
                })
                .collect()
        })
        .collect();

    let secp = bridge::bitcoin::secp256k1::Secp256k1::new();
    let spec = FederationSpec {
        epoch_duration: 1000,
        members: consensus_keys.iter().map(|k| k.verifying_key()).collect(),
        bitcoin_pubkeys: bitcoin_keys.iter().map(|k| k.public_key(&secp)).collect(),
        note_tiers: tiers,
        aggregate_keys,
        member_note_keys,
        finality_confirmations: bridge::REQUIRED_CONFIRMATIONS,
        contract_expiry_epochs: 10,
        tx_fee: Amount::ZERO,
        pegout_fee_rate: 1.0,
        network: Network::Regtest,
    };

    let secrets = consensus_keys
        .into_iter()
        .zip(bitcoin_keys)
        .zip(note_keys)
        .map(|((consensus_key, bitcoin_key), note_keys)| MemberSecrets {
            consensus_key,
            bitcoin_key,
            note_keys,
        })
        .collect();

    (spec, secrets)
}

pub static DEV: Lazy<FederationSpec> = Lazy::new(|| dev_federation().0);

impl Default for FederationSpec {
    fn default() -> Self {
        DEV.clone()
    }
}

pub fn genesis_value_parser(s: &str) -> eyre::Result<FederationSpec, eyre::Error> {
    Ok(match s {
        "dev" => DEV.clone(),
        _ => {
            let raw = std::fs::read_to_string(PathBuf::from(s))?;
            serde_json::from_str(&raw)?
        }
    })
}
