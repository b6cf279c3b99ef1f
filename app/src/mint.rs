//! One member's view of the issuance ledger: spent serials, pending
//! issuances and the blind signature shares collected for them. Every
//! member holds the same view after applying the same epochs; only the
//! secret share set differs.

use crate::consensus::MemberId;
use crate::error::Error;
use crate::transaction::OutPoint;
use ecash::{
    combine_shares, AggregatePublicKey, BlindedNotes, BlindedSignature, NoteShares, Notes,
    PublicKeyShare, SecretKeyShare, Serial, Tiered, TieredMulti,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::*;

struct Issuance {
    request: BlindedNotes,
    shares: BTreeMap<MemberId, NoteShares>,
    result: Option<TieredMulti<BlindedSignature>>,
    contributed: bool,
}

pub struct Mint {
    member: MemberId,
    secret_shares: Tiered<SecretKeyShare>,
    /// Published share commitments, outer index is the member.
    share_commitments: Vec<Tiered<PublicKeyShare>>,
    aggregate_keys: Tiered<AggregatePublicKey>,
    threshold: usize,
    spent_serials: HashSet<Serial>,
    issuances: HashMap<OutPoint, Issuance>,
}

impl Mint {
    pub fn new(
        member: MemberId,
        secret_shares: Tiered<SecretKeyShare>,
        share_commitments: Vec<Tiered<PublicKeyShare>>,
        aggregate_keys: Tiered<AggregatePublicKey>,
        threshold: usize,
    ) -> Self {
        Mint {
            member,
            secret_shares,
            share_commitments,
            aggregate_keys,
            threshold,
            spent_serials: HashSet::new(),
            issuances: HashMap::new(),
        }
    }

    pub fn aggregate_keys(&self) -> &Tiered<AggregatePublicKey> {
        &self.aggregate_keys
    }

    /// Check notes offered as transaction inputs: known denominations,
    /// valid group signatures, serials neither spent nor repeated within
    /// the bundle.
    pub fn validate_notes(&self, notes: &Notes) -> Result<(), Error> {
        let mut seen = HashSet::new();
        for (tier, note) in notes.iter_items() {
            let key = self
                .aggregate_keys
                .get(tier)
                .ok_or(Error::EcashError(ecash::Error::UnknownDenomination(tier)))?;
            if !note.verify(key) {
                return Err(Error::EcashError(ecash::Error::InvalidSignature));
            }
            if self.spent_serials.contains(&note.serial) || !seen.insert(note.serial) {
                return Err(Error::DoubleSpend);
            }
        }
        Ok(())
    }

    pub fn apply_spend(&mut self, notes: &Notes) {
        for (_, note) in notes.iter_items() {
            self.spent_serials.insert(note.serial);
        }
    }

    pub fn is_spent(&self, serial: &Serial) -> bool {
        self.spent_serials.contains(serial)
    }

    pub fn validate_request(&self, request: &BlindedNotes) -> Result<(), Error> {
        for (tier, _) in request.iter_items() {
            if self.aggregate_keys.get(tier).is_none() {
                return Err(Error::EcashError(ecash::Error::UnknownDenomination(tier)));
            }
        }
        Ok(())
    }

    /// Track a newly agreed issuance. Shares for it are produced by
    /// [`Mint::pending_contributions`] in the following epoch.
    pub fn begin_issuance(&mut self, out_point: OutPoint, request: BlindedNotes) {
        self.issuances.entry(out_point).or_insert(Issuance {
            request,
            shares: BTreeMap::new(),
            result: None,
            contributed: false,
        });
    }

    /// Sign every pending issuance this member has not yet contributed
    /// to, marking them contributed.
    pub fn pending_contributions(&mut self) -> Vec<(OutPoint, NoteShares)> {
        let mut contributions: Vec<(OutPoint, NoteShares)> = Vec::new();
        for (out_point, issuance) in self.issuances.iter_mut() {
            if issuance.contributed || issuance.result.is_some() {
                continue;
            }
            let mut shares = NoteShares::default();
            for (tier, message) in issuance.request.iter_items() {
                let secret = self
                    .secret_shares
                    .get(tier)
                    .expect("request tiers are validated on apply");
                shares.push(tier, secret.sign_blinded(message));
            }
            issuance.contributed = true;
            contributions.push((*out_point, shares));
        }
        contributions.sort_by_key(|(out_point, _)| *out_point);
        contributions
    }

    /// Structural and cryptographic validation of one member's shares.
    pub fn validate_shares(
        &self,
        member: MemberId,
        out_point: OutPoint,
        shares: &NoteShares,
    ) -> Result<(), Error> {
        let issuance = self.issuances.get(&out_point).ok_or(Error::UnknownOutput)?;
        if !issuance.request.structure_matches(shares) {
            return Err(Error::EcashError(ecash::Error::TierMismatch));
        }
        let commitments = self
            .share_commitments
            .get(member as usize)
            .ok_or(Error::UnknownMember)?;

        let messages = issuance.request.iter_items();
        for ((tier, share), (_, message)) in shares.iter_items().zip(messages) {
            if share.member != member {
                return Err(Error::EcashError(ecash::Error::InvalidShare(share.member)));
            }
            let commitment = commitments
                .get(tier)
                .ok_or(Error::EcashError(ecash::Error::UnknownDenomination(tier)))?;
            if !share.verify(message, commitment) {
                return Err(Error::EcashError(ecash::Error::InvalidShare(member)));
            }
        }
        Ok(())
    }

    /// Record a member's verified shares; combines the issuance once the
    /// threshold is reached.
    pub fn apply_shares(
        &mut self,
        member: MemberId,
        out_point: OutPoint,
        shares: NoteShares,
    ) -> Result<(), Error> {
        self.validate_shares(member, out_point, &shares)?;

        let threshold = self.threshold;
        let commitments = &self.share_commitments;
        let issuance = self
            .issuances
            .get_mut(&out_point)
            .ok_or(Error::UnknownOutput)?;

        if issuance.shares.contains_key(&member) {
            return Err(Error::DuplicateIssuanceShare);
        }
        issuance.shares.insert(member, shares);

        if issuance.result.is_none() && issuance.shares.len() >= threshold {
            let mut combined = TieredMulti::default();
            for (tier, messages) in issuance.request.iter_tiers() {
                for (idx, message) in messages.iter().enumerate() {
                    let tier_shares: Vec<_> = issuance
                        .shares
                        .iter()
                        .filter_map(|(contributor, note_shares)| {
                            let share = *note_shares.get_tier(tier)?.get(idx)?;
                            let commitment =
                                *commitments.get(*contributor as usize)?.get(tier)?;
                            Some((share, commitment))
                        })
                        .collect();
                    let signature = combine_shares(message, &tier_shares, threshold)
                        .map_err(Error::EcashError)?;
                    combined.push(tier, signature);
                }
            }
            debug!("issuance {} complete", out_point);
            issuance.result = Some(combined);
        }
        Ok(())
    }

    /// Combined blinded signatures for a finished issuance, `None` while
    /// shares are still being collected.
    pub fn signatures(
        &self,
        out_point: OutPoint,
    ) -> Result<Option<&TieredMulti<BlindedSignature>>, Error> {
        self.issuances
            .get(&out_point)
            .map(|issuance| issuance.result.as_ref())
            .ok_or(Error::UnknownOutput)
    }

    pub fn pending_issuances(&self) -> Vec<OutPoint> {
        let mut pending: Vec<OutPoint> = self
            .issuances
            .iter()
            .filter(|(_, issuance)| issuance.result.is_none())
            .map(|(out_point, _)| *out_point)
            .collect();
        pending.sort();
        pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TransactionId;
    use ecash::{blind, dealer_keygen, unblind, Amount, BlindingKey, Note};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const TIERS: [Amount; 3] = [
        Amount::from_sats(1),
        Amount::from_sats(2),
        Amount::from_sats(4),
    ];

    fn mints(members: usize, threshold: usize) -> Vec<Mint> {
        let mut rng = StdRng::seed_from_u64(42);
        let (aggregates, commitments, secrets) =
            dealer_keygen(threshold, members, &TIERS, &mut rng);
        let share_commitments: Vec<Tiered<PublicKeyShare>> = (0..members)
            .map(|member| {
                TIERS
                    .iter()
                    .map(|&tier| (tier, commitments.get(tier).unwrap()[member]))
                    .collect()
            })
            .collect();
        secrets
            .into_iter()
            .enumerate()
            .map(|(member, secret)| {
                Mint::new(
                    member as MemberId,
                    secret,
                    share_commitments.clone(),
                    aggregates.clone(),
                    threshold,
                )
            })
            .collect()
    }

    fn out_point(n: u8) -> OutPoint {
        OutPoint {
            txid: TransactionId([n; 32]),
            out_idx: 0,
        }
    }

    fn request(
        amounts: &[u64],
        rng: &mut StdRng,
    ) -> (BlindedNotes, Vec<(Amount, Serial, BlindingKey)>) {
        let mut blinded = BlindedNotes::default();
        let mut secrets = Vec::new();
        for &sats in amounts {
            let tier = Amount::from_sats(sats);
            let serial = Serial::random(rng);
            let (key, message) = blind(&serial, rng);
            blinded.push(tier, message);
            secrets.push((tier, serial, key));
        }
        (blinded, secrets)
    }

    fn run_issuance(mints: &mut [Mint], out_point: OutPoint, blinded: &BlindedNotes) {
        for mint in mints.iter_mut() {
            mint.begin_issuance(out_point, blinded.clone());
        }
        let contributions: Vec<(MemberId, Vec<(OutPoint, NoteShares)>)> = mints
            .iter_mut()
            .map(|mint| (mint.member, mint.pending_contributions()))
            .collect();
        for (member, contribution) in contributions {
            for (point, shares) in contribution {
                for mint in mints.iter_mut() {
                    mint.apply_shares(member, point, shares.clone()).unwrap();
                }
            }
        }
    }

    fn unblind_notes(
        mint: &Mint,
        signatures: &TieredMulti<BlindedSignature>,
        secrets: &[(Amount, Serial, BlindingKey)],
    ) -> Notes {
        signatures
            .iter_items()
            .zip(secrets.iter())
            .map(|((tier, combined), (_, serial, key))| {
                let signature = unblind(combined, key, mint.aggregate_keys().get(tier).unwrap());
                (tier, Note {
                    serial: *serial,
                    signature,
                })
            })
            .collect()
    }

    #[test]
    fn full_issuance_and_spend_cycle() {
        let mut mints = mints(4, 3);
        let mut rng = StdRng::seed_from_u64(1);
        let (blinded, secrets) = request(&[1, 2, 4], &mut rng);

        run_issuance(&mut mints, out_point(1), &blinded);

        let signatures = mints[0].signatures(out_point(1)).unwrap().unwrap().clone();
        // every mint combined to the same signatures
        for mint in &mints {
            assert_eq!(
                mint.signatures(out_point(1)).unwrap().unwrap(),
                &signatures
            );
        }

        let notes = unblind_notes(&mints[0], &signatures, &secrets);
        assert_eq!(notes.total_amount(), Amount::from_sats(7));
        mints[1].validate_notes(&notes).unwrap();

        // after the spend is applied the same notes are rejected
        mints[1].apply_spend(&notes);
        assert!(matches!(
            mints[1].validate_notes(&notes),
            Err(Error::DoubleSpend)
        ));
    }

    #[test]
    fn share_from_wrong_member_key_is_rejected() {
        let mut mints = mints(4, 3);
        let mut rng = StdRng::seed_from_u64(2);
        let (blinded, _) = request(&[2], &mut rng);
        for mint in mints.iter_mut() {
            mint.begin_issuance(out_point(1), blinded.clone());
        }

        // member 1's shares presented as member 2's
        let shares = mints[1].pending_contributions().remove(0).1;
        assert!(matches!(
            mints[0].validate_shares(2, out_point(1), &shares),
            Err(Error::EcashError(ecash::Error::InvalidShare(_)))
        ));
    }

    #[test]
    fn duplicate_shares_are_rejected() {
        let mut mints = mints(4, 3);
        let mut rng = StdRng::seed_from_u64(3);
        let (blinded, _) = request(&[4], &mut rng);
        for mint in mints.iter_mut() {
            mint.begin_issuance(out_point(1), blinded.clone());
        }

        let shares = mints[1].pending_contributions().remove(0).1;
        mints[0].apply_shares(1, out_point(1), shares.clone()).unwrap();
        assert!(matches!(
            mints[0].apply_shares(1, out_point(1), shares),
            Err(Error::DuplicateIssuanceShare)
        ));
    }

    #[test]
    fn below_threshold_stays_pending() {
        let mut mints = mints(4, 3);
        let mut rng = StdRng::seed_from_u64(4);
        let (blinded, _) = request(&[1], &mut rng);
        for mint in mints.iter_mut() {
            mint.begin_issuance(out_point(1), blinded.clone());
        }

        let shares_0 = mints[0].pending_contributions().remove(0).1;
        let shares_1 = mints[1].pending_contributions().remove(0).1;
        mints[3].apply_shares(0, out_point(1), shares_0).unwrap();
        mints[3].apply_shares(1, out_point(1), shares_1).unwrap();

        assert!(mints[3].signatures(out_point(1)).unwrap().is_none());
        assert_eq!(mints[3].pending_issuances(), vec![out_point(1)]);
    }
}
