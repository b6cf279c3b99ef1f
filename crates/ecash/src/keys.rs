use ark_bls12_381::{Fr, G1Affine, G1Projective, G2Affine, G2Projective};
use ark_ec::{CurveGroup, Group};
use ark_ff::Zero;
use ark_std::UniformRand;
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::blind::ark_hex;
use crate::{Amount, Tiered};

/// One member's Shamir share of a tier signing key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretKeyShare {
    pub index: u16,
    #[serde(with = "ark_hex")]
    pub(crate) scalar: Fr,
}

/// Public commitment to a member's key share, used by clients to verify
/// that member's signature shares before combining them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyShare {
    pub index: u16,
    #[serde(with = "ark_hex")]
    pub(crate) point: G2Affine,
}

/// The federation's group key for one denomination tier. `g2` is the
/// verification key; `g1` is the same key in G1, needed for unblinding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatePublicKey {
    #[serde(with = "ark_hex")]
    pub(crate) g1: G1Affine,
    #[serde(with = "ark_hex")]
    pub(crate) g2: G2Affine,
}

fn eval_poly(coefficients: &[Fr], x: Fr) -> Fr {
    coefficients
        .iter()
        .rev()
        .fold(Fr::zero(), |acc, c| acc * x + c)
}

/// Trusted-dealer key generation for a single tier: a random polynomial of
/// degree `threshold - 1` whose constant term is the group key. Used for
/// dev federations and tests; production setups would run a DKG instead,
/// which only changes how the shares come to exist, not their shape.
pub fn dealer_keygen_tier<R: RngCore + CryptoRng>(
    threshold: usize,
    members: usize,
    rng: &mut R,
) -> (AggregatePublicKey, Vec<PublicKeyShare>, Vec<SecretKeyShare>) {
    assert!(threshold >= 1 && threshold <= members);

    let coefficients: Vec<Fr> = (0..threshold).map(|_| Fr::rand(rng)).collect();
    let group_key = coefficients[0];

    let aggregate = AggregatePublicKey {
        g1: (G1Projective::generator() * group_key).into_affine(),
        g2: (G2Projective::generator() * group_key).into_affine(),
    };

    let mut commitments = Vec::with_capacity(members);
    let mut shares = Vec::with_capacity(members);
    for index in 0..members as u16 {
        let scalar = eval_poly(&coefficients, Fr::from(index as u64 + 1));
        commitments.push(PublicKeyShare {
            index,
            point: (G2Projective::generator() * scalar).into_affine(),
        });
        shares.push(SecretKeyShare { index, scalar });
    }

    (aggregate, commitments, shares)
}

/// Generate keys for every denomination tier. Returns the per-tier group
/// keys, the public share commitments (per tier, indexed by member) and
/// each member's private share set.
#[allow(clippy::type_complexity)]
pub fn dealer_keygen<R: RngCore + CryptoRng>(
    threshold: usize,
    members: usize,
    tiers: &[Amount],
    rng: &mut R,
) -> (
    Tiered<AggregatePublicKey>,
    Tiered<Vec<PublicKeyShare>>,
    Vec<Tiered<SecretKeyShare>>,
) {
    let mut aggregates = Tiered::default();
    let mut commitments = Tiered::default();
    let mut member_shares: Vec<Tiered<SecretKeyShare>> = vec![Tiered::default(); members];

    for &tier in tiers {
        let (agg, tier_commitments, tier_shares) = dealer_keygen_tier(threshold, members, rng);
        aggregates.insert(tier, agg);
        commitments.insert(tier, tier_commitments);
        for (member, share) in tier_shares.into_iter().enumerate() {
            member_shares[member].insert(tier, share);
        }
    }

    (aggregates, commitments, member_shares)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn keygen_produces_aligned_share_sets() {
        let mut rng = StdRng::seed_from_u64(7);
        let tiers = [Amount::from_sats(1), Amount::from_sats(2), Amount::from_sats(4)];
        let (aggregates, commitments, member_shares) = dealer_keygen(3, 4, &tiers, &mut rng);

        assert_eq!(aggregates.tiers().count(), 3);
        assert_eq!(member_shares.len(), 4);
        for (member, shares) in member_shares.iter().enumerate() {
            for &tier in &tiers {
                let share = shares.get(tier).unwrap();
                assert_eq!(share.index, member as u16);
                let commitment = commitments.get(tier).unwrap()[member];
                assert_eq!(
                    commitment.point,
                    (G2Projective::generator() * share.scalar).into_affine()
                );
            }
        }
    }
}
