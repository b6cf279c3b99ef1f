//! Blind signature scheme used for note issuance.
//!
//! The scheme is a threshold blind signature over BLS12-381: a note serial
//! is hashed to the G1 group and blinded with a random multiple of the
//! generator before it is handed to the federation. Each member signs the
//! blinded point with its Shamir share of the tier key; any `t` verified
//! shares Lagrange-interpolate to the group signature, which the client
//! unblinds. Verification is public via a pairing against the group key,
//! so no member ever needs (or holds) the full signing key.

use ark_bls12_381::{g1, Bls12_381, Fr, G1Affine, G1Projective, G2Projective};
use ark_ec::hashing::curve_maps::wb::WBMap;
use ark_ec::hashing::map_to_curve_hasher::MapToCurveBasedHasher;
use ark_ec::hashing::HashToCurve;
use ark_ec::pairing::Pairing;
use ark_ec::{CurveGroup, Group};
use ark_ff::{Field, One, Zero};
use ark_std::UniformRand;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;

use crate::keys::{AggregatePublicKey, PublicKeyShare, SecretKeyShare};
use crate::Error;

const HASH_TO_CURVE_DOMAIN: &[u8] = b"ECASH_NOTE_BLS12381G1_XMD:SHA-256_SSWU_RO_";

type G1Hasher =
    MapToCurveBasedHasher<G1Projective, ark_ff::field_hashers::DefaultFieldHasher<Sha256>, WBMap<g1::Config>>;

/// Serde helpers for arkworks types: compressed point/scalar bytes as hex,
/// which survives both the json RPC surface and the rmp epoch log.
pub(crate) mod ark_hex {
    use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<T: CanonicalSerialize, S: Serializer>(t: &T, s: S) -> Result<S::Ok, S::Error> {
        let mut buf = Vec::with_capacity(t.compressed_size());
        t.serialize_compressed(&mut buf)
            .map_err(serde::ser::Error::custom)?;
        s.serialize_str(&hex::encode(buf))
    }

    pub fn deserialize<'de, T: CanonicalDeserialize, D: Deserializer<'de>>(
        d: D,
    ) -> Result<T, D::Error> {
        let hex_str = String::deserialize(d)?;
        let bytes = hex::decode(hex_str).map_err(D::Error::custom)?;
        T::deserialize_compressed(&bytes[..]).map_err(D::Error::custom)
    }
}

/// The secret embedded in a note. Random per note; revealed only on spend.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Serial(pub [u8; 32]);

impl Serial {
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        Serial(bytes)
    }

    pub(crate) fn to_message_point(self) -> G1Projective {
        let hasher = G1Hasher::new(HASH_TO_CURVE_DOMAIN).expect("valid domain");
        hasher.hash(&self.0).expect("hashing cannot fail").into()
    }
}

impl fmt::Debug for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Serial({})", hex::encode(self.0))
    }
}

impl fmt::Display for Serial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Client-side blinding factor. Must be kept until the signature shares
/// come back from the federation, then discarded with the request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlindingKey(#[serde(with = "ark_hex")] pub(crate) Fr);

/// A blinded serial as submitted to the federation for signing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlindedMessage(#[serde(with = "ark_hex")] pub(crate) G1Affine);

/// One member's signature share over a blinded message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareSignature {
    pub member: u16,
    #[serde(with = "ark_hex")]
    pub(crate) point: G1Affine,
}

/// Threshold-combined signature, still blinded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlindedSignature(#[serde(with = "ark_hex")] pub(crate) G1Affine);

/// The unblinded group signature carried inside a spendable note.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "ark_hex")] pub(crate) G1Affine);

/// Blind a fresh serial for submission: `B' = H(serial) + r*G`.
pub fn blind<R: RngCore + CryptoRng>(
    serial: &Serial,
    rng: &mut R,
) -> (BlindingKey, BlindedMessage) {
    let r = Fr::rand(rng);
    let blinded = serial.to_message_point() + G1Projective::generator() * r;
    (BlindingKey(r), BlindedMessage(blinded.into_affine()))
}

impl SecretKeyShare {
    /// Produce this member's signature share `C'_i = k_i * B'`.
    pub fn sign_blinded(&self, message: &BlindedMessage) -> ShareSignature {
        ShareSignature {
            member: self.index,
            point: (G1Projective::from(message.0) * self.scalar).into_affine(),
        }
    }
}

impl ShareSignature {
    /// Pairing check of a single share against the member's published
    /// share commitment: `e(C'_i, G2) == e(B', K_i)`.
    pub fn verify(&self, message: &BlindedMessage, commitment: &PublicKeyShare) -> bool {
        Bls12_381::pairing(self.point, G2Projective::generator())
            == Bls12_381::pairing(message.0, commitment.point)
    }
}

fn lagrange_coefficient(xs: &[Fr], i: usize) -> Fr {
    let mut num = Fr::one();
    let mut den = Fr::one();
    for (j, x) in xs.iter().enumerate() {
        if j != i {
            num *= x;
            den *= *x - xs[i];
        }
    }
    num * den.inverse().expect("distinct evaluation points")
}

/// Combine at least `threshold` verified member shares into the blinded
/// group signature. Shares with a bad pairing relation fail the whole
/// combination attributably.
pub fn combine_shares(
    message: &BlindedMessage,
    shares: &[(ShareSignature, PublicKeyShare)],
    threshold: usize,
) -> Result<BlindedSignature, Error> {
    let mut selected: Vec<&(ShareSignature, PublicKeyShare)> = Vec::with_capacity(threshold);
    for pair in shares {
        if selected.iter().any(|s| s.0.member == pair.0.member) {
            continue;
        }
        selected.push(pair);
        if selected.len() == threshold {
            break;
        }
    }

    if selected.len() < threshold {
        return Err(Error::InsufficientShares {
            got: selected.len(),
            need: threshold,
        });
    }

    for (share, commitment) in selected.iter() {
        if !share.verify(message, commitment) {
            return Err(Error::InvalidShare(share.member));
        }
    }

    // Shamir x-coordinates are member index + 1 so that no share sits at zero
    let xs: Vec<Fr> = selected
        .iter()
        .map(|(share, _)| Fr::from(share.member as u64 + 1))
        .collect();

    let combined = selected
        .iter()
        .enumerate()
        .fold(G1Projective::zero(), |acc, (i, (share, _))| {
            acc + G1Projective::from(share.point) * lagrange_coefficient(&xs, i)
        });

    Ok(BlindedSignature(combined.into_affine()))
}

/// Strip the blinding factor: `C = C' - r*PK1`, where `PK1` is the group
/// key in G1. The result is the plain group signature over `H(serial)`.
pub fn unblind(
    combined: &BlindedSignature,
    blinding_key: &BlindingKey,
    key: &AggregatePublicKey,
) -> Signature {
    let unblinded = G1Projective::from(combined.0) - G1Projective::from(key.g1) * blinding_key.0;
    Signature(unblinded.into_affine())
}

/// Public verification of an unblinded note signature:
/// `e(C, G2) == e(H(serial), PK2)`.
pub fn verify(key: &AggregatePublicKey, serial: &Serial, signature: &Signature) -> bool {
    Bls12_381::pairing(signature.0, G2Projective::generator())
        == Bls12_381::pairing(serial.to_message_point(), key.g2)
}
