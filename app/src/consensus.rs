//! Epoch agreement for the federation. Each epoch one member leads:
//! members broadcast signed contributions, the leader merges them into a
//! proposal, and a proposal backed by a threshold of signed votes becomes
//! an epoch certificate that every member applies and persists. Members
//! caught signing two different proposals or votes for the same epoch are
//! excluded from leadership and quorum for the life of the process;
//! the engine prefers stalling over diverging.

use crate::error::Error;
use crate::ln::{ContractId, ContractOutcome};
use crate::transaction::{sha256, LedgerTransaction, OutPoint};
use bridge::bitcoin::{Transaction as BitcoinTransaction, Txid};
use bridge::MemberSignatures;
use ecash::NoteShares;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::Serialize;
use serde_derive::{Deserialize as DeserializeDerive, Serialize as SerializeDerive};
use std::collections::{BTreeSet, HashMap};

pub type MemberId = u16;

const TAG_CONTRIBUTION: u8 = 1;
const TAG_PROPOSAL: u8 = 2;
const TAG_VOTE: u8 = 3;

/// Votes needed for a certificate: two thirds of the members, rounded up.
pub fn vote_threshold(members: usize) -> usize {
    (members * 2 + 2) / 3
}

/// Everything a member may put up for agreement in an epoch.
#[derive(Clone, Debug, PartialEq, SerializeDerive, DeserializeDerive)]
pub enum ConsensusItem {
    /// A client transaction accepted by some member.
    Transaction(LedgerTransaction),
    /// One member's blind signature shares for a pending issuance.
    IssuanceShares {
        member: MemberId,
        out_point: OutPoint,
        shares: NoteShares,
    },
    /// The next withdrawal transaction, built from the queued peg-outs.
    PegOutProposal { tx: BitcoinTransaction },
    /// One member's schnorr signatures over an agreed withdrawal.
    PegOutSignatures {
        member: MemberId,
        txid: Txid,
        signatures: MemberSignatures,
    },
    /// Outcome of an outgoing lightning contract.
    ContractResolution {
        contract: ContractId,
        outcome: ContractOutcome,
    },
}

impl ConsensusItem {
    pub fn hash(&self) -> [u8; 32] {
        let encoded = rmp_serde::to_vec(self).expect("in-memory item encoding cannot fail");
        sha256(&encoded)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ConsensusItem::Transaction(_) => "transaction",
            ConsensusItem::IssuanceShares { .. } => "issuance_shares",
            ConsensusItem::PegOutProposal { .. } => "pegout_proposal",
            ConsensusItem::PegOutSignatures { .. } => "pegout_signatures",
            ConsensusItem::ContractResolution { .. } => "contract_resolution",
        }
    }
}

/// Merge per-member contributions into the canonical item list: dedup by
/// hash, order by hash. Identical items from several members collapse to
/// one, so every honest leader derives the same list from the same set.
pub fn merge_items(contributions: impl IntoIterator<Item = Vec<ConsensusItem>>) -> Vec<ConsensusItem> {
    let mut by_hash: Vec<([u8; 32], ConsensusItem)> = Vec::new();
    for items in contributions {
        for item in items {
            let hash = item.hash();
            if !by_hash.iter().any(|(h, _)| *h == hash) {
                by_hash.push((hash, item));
            }
        }
    }
    by_hash.sort_by(|a, b| a.0.cmp(&b.0));
    by_hash.into_iter().map(|(_, item)| item).collect()
}

fn signing_payload<T: Serialize>(tag: u8, value: &T) -> Vec<u8> {
    let mut payload = vec![tag];
    payload.extend(rmp_serde::to_vec(value).expect("in-memory encoding cannot fail"));
    payload
}

fn member_key(members: &[VerifyingKey], member: MemberId) -> Result<&VerifyingKey, Error> {
    members.get(member as usize).ok_or(Error::UnknownMember)
}

/// A member's raw input to an epoch, before the leader merges.
#[derive(Clone, Debug, SerializeDerive, DeserializeDerive)]
pub struct Contribution {
    pub epoch: u64,
    pub items: Vec<ConsensusItem>,
}

#[derive(Clone, Debug, SerializeDerive, DeserializeDerive)]
pub struct SignedContribution {
    pub contribution: Contribution,
    pub member: MemberId,
    pub signature: Signature,
}

impl SignedContribution {
    pub fn new(contribution: Contribution, member: MemberId, key: &SigningKey) -> Self {
        let signature = key.sign(&signing_payload(TAG_CONTRIBUTION, &contribution));
        SignedContribution {
            contribution,
            member,
            signature,
        }
    }

    pub fn verify(&self, members: &[VerifyingKey]) -> Result<(), Error> {
        member_key(members, self.member)?
            .verify(
                &signing_payload(TAG_CONTRIBUTION, &self.contribution),
                &self.signature,
            )
            .map_err(|_| Error::InvalidSignature)
    }
}

/// The merged item list the leader puts to a vote. `parent` chains the
/// epochs together so certificates cannot be replayed across histories.
#[derive(Clone, Debug, SerializeDerive, DeserializeDerive)]
pub struct EpochProposal {
    pub epoch: u64,
    pub parent: [u8; 32],
    pub items: Vec<ConsensusItem>,
}

impl EpochProposal {
    pub fn hash(&self) -> [u8; 32] {
        sha256(&signing_payload(TAG_PROPOSAL, self))
    }
}

#[derive(Clone, Debug, SerializeDerive, DeserializeDerive)]
pub struct SignedProposal {
    pub proposal: EpochProposal,
    pub leader: MemberId,
    pub signature: Signature,
}

impl SignedProposal {
    pub fn new(proposal: EpochProposal, leader: MemberId, key: &SigningKey) -> Self {
        let signature = key.sign(&signing_payload(TAG_PROPOSAL, &proposal));
        SignedProposal {
            proposal,
            leader,
            signature,
        }
    }

    pub fn verify(&self, members: &[VerifyingKey]) -> Result<(), Error> {
        member_key(members, self.leader)?
            .verify(
                &signing_payload(TAG_PROPOSAL, &self.proposal),
                &self.signature,
            )
            .map_err(|_| Error::InvalidSignature)
    }
}

#[derive(Clone, Copy, Debug, SerializeDerive, DeserializeDerive)]
pub struct Vote {
    pub epoch: u64,
    pub proposal_hash: [u8; 32],
}

#[derive(Clone, Debug, SerializeDerive, DeserializeDerive)]
pub struct SignedVote {
    pub vote: Vote,
    pub member: MemberId,
    pub signature: Signature,
}

impl SignedVote {
    pub fn new(vote: Vote, member: MemberId, key: &SigningKey) -> Self {
        let signature = key.sign(&signing_payload(TAG_VOTE, &vote));
        SignedVote {
            vote,
            member,
            signature,
        }
    }

    pub fn verify(&self, members: &[VerifyingKey]) -> Result<(), Error> {
        member_key(members, self.member)?
            .verify(&signing_payload(TAG_VOTE, &self.vote), &self.signature)
            .map_err(|_| Error::InvalidSignature)
    }
}

/// A proposal plus enough votes to make it final. This is the unit that
/// gets persisted and replayed, and the unit a lagging member catches up
/// with.
#[derive(Clone, Debug, SerializeDerive, DeserializeDerive)]
pub struct EpochCertificate {
    pub proposal: SignedProposal,
    pub votes: Vec<SignedVote>,
}

impl EpochCertificate {
    pub fn epoch(&self) -> u64 {
        self.proposal.proposal.epoch
    }

    pub fn hash(&self) -> [u8; 32] {
        self.proposal.proposal.hash()
    }

    pub fn verify(&self, members: &[VerifyingKey], threshold: usize) -> Result<(), Error> {
        self.proposal.verify(members)?;
        let proposal_hash = self.proposal.proposal.hash();

        let mut voters = BTreeSet::new();
        for vote in &self.votes {
            if vote.vote.epoch != self.epoch() || vote.vote.proposal_hash != proposal_hash {
                return Err(Error::WrongEpoch);
            }
            vote.verify(members)?;
            if !voters.insert(vote.member) {
                return Err(Error::DuplicateVote);
            }
        }

        if voters.len() < threshold {
            return Err(Error::InsufficientVotes);
        }
        Ok(())
    }
}

/// Messages exchanged between member engines.
#[derive(Clone, Debug, SerializeDerive, DeserializeDerive)]
pub enum Message {
    Contribution(SignedContribution),
    Proposal(SignedProposal),
    Vote(SignedVote),
    Certificate(Box<EpochCertificate>),
}

/// Tracks equivocation. A member that signs two different payloads for
/// the same epoch is faulted and drops out of leadership and quorum.
#[derive(Default)]
pub struct FaultTracker {
    proposals_seen: HashMap<(u64, MemberId), [u8; 32]>,
    votes_seen: HashMap<(u64, MemberId), [u8; 32]>,
    faulted: BTreeSet<MemberId>,
}

impl FaultTracker {
    pub fn record_proposal(
        &mut self,
        epoch: u64,
        member: MemberId,
        proposal_hash: [u8; 32],
    ) -> Result<(), Error> {
        match self.proposals_seen.insert((epoch, member), proposal_hash) {
            Some(previous) if previous != proposal_hash => {
                self.faulted.insert(member);
                Err(Error::EquivocatingMember(member))
            }
            _ => Ok(()),
        }
    }

    pub fn record_vote(
        &mut self,
        epoch: u64,
        member: MemberId,
        proposal_hash: [u8; 32],
    ) -> Result<(), Error> {
        match self.votes_seen.insert((epoch, member), proposal_hash) {
            Some(previous) if previous != proposal_hash => {
                self.faulted.insert(member);
                Err(Error::EquivocatingMember(member))
            }
            _ => Ok(()),
        }
    }

    pub fn is_faulted(&self, member: MemberId) -> bool {
        self.faulted.contains(&member)
    }

    pub fn active_members(&self, total: usize) -> Vec<MemberId> {
        (0..total as MemberId)
            .filter(|member| !self.faulted.contains(member))
            .collect()
    }
}

/// Round-robin leadership over the non-faulted members. `None` once every
/// member has been excluded; no quorum can form at that point either.
pub fn epoch_leader(epoch: u64, active: &[MemberId]) -> Option<MemberId> {
    if active.is_empty() {
        return None;
    }
    Some(active[(epoch % active.len() as u64) as usize])
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn keys(n: usize) -> (Vec<SigningKey>, Vec<VerifyingKey>) {
        let signing: Vec<SigningKey> = (0..n).map(|_| SigningKey::generate(&mut OsRng)).collect();
        let verifying = signing.iter().map(|k| k.verifying_key()).collect();
        (signing, verifying)
    }

    fn proposal(epoch: u64) -> EpochProposal {
        EpochProposal {
            epoch,
            parent: [0; 32],
            items: vec![],
        }
    }

    fn certificate(
        signing: &[SigningKey],
        voters: &[usize],
        leader: usize,
        epoch: u64,
    ) -> EpochCertificate {
        let signed = SignedProposal::new(proposal(epoch), leader as MemberId, &signing[leader]);
        let hash = signed.proposal.hash();
        let votes = voters
            .iter()
            .map(|&i| {
                SignedVote::new(
                    Vote {
                        epoch,
                        proposal_hash: hash,
                    },
                    i as MemberId,
                    &signing[i],
                )
            })
            .collect();
        EpochCertificate {
            proposal: signed,
            votes,
        }
    }

    #[test]
    fn threshold_is_two_thirds_rounded_up() {
        assert_eq!(vote_threshold(1), 1);
        assert_eq!(vote_threshold(3), 2);
        assert_eq!(vote_threshold(4), 3);
        assert_eq!(vote_threshold(7), 5);
    }

    #[test]
    fn certificate_verification() {
        let (signing, verifying) = keys(4);

        certificate(&signing, &[0, 1, 2], 0, 5)
            .verify(&verifying, 3)
            .unwrap();

        assert!(matches!(
            certificate(&signing, &[0, 1], 0, 5).verify(&verifying, 3),
            Err(Error::InsufficientVotes)
        ));

        // a vote signed by the wrong key fails
        let mut forged = certificate(&signing, &[0, 1, 2], 0, 5);
        forged.votes[2].member = 3;
        assert!(matches!(
            forged.verify(&verifying, 3),
            Err(Error::InvalidSignature)
        ));

        // duplicated voters do not reach quorum
        let mut doubled = certificate(&signing, &[0, 1], 0, 5);
        let dup = doubled.votes[0].clone();
        doubled.votes.push(dup);
        assert!(matches!(
            doubled.verify(&verifying, 3),
            Err(Error::DuplicateVote)
        ));
    }

    #[test]
    fn equivocation_faults_the_member() {
        let mut tracker = FaultTracker::default();
        tracker.record_vote(3, 1, [1; 32]).unwrap();
        // same vote again is fine
        tracker.record_vote(3, 1, [1; 32]).unwrap();
        assert!(matches!(
            tracker.record_vote(3, 1, [2; 32]),
            Err(Error::EquivocatingMember(1))
        ));
        assert!(tracker.is_faulted(1));
        assert_eq!(tracker.active_members(4), vec![0, 2, 3]);
    }

    #[test]
    fn leadership_rotates_over_active_members() {
        let active = vec![0u16, 2, 3];
        assert_eq!(epoch_leader(0, &active), Some(0));
        assert_eq!(epoch_leader(1, &active), Some(2));
        assert_eq!(epoch_leader(2, &active), Some(3));
        assert_eq!(epoch_leader(3, &active), Some(0));
        // with nobody left there is no leader rather than a panic
        assert_eq!(epoch_leader(0, &[]), None);
    }

    #[test]
    fn merged_items_are_deduped_and_ordered() {
        let tx = LedgerTransaction {
            inputs: vec![],
            outputs: vec![],
        };
        let item = ConsensusItem::Transaction(tx);
        let merged = merge_items(vec![vec![item.clone()], vec![item.clone()]]);
        assert_eq!(merged.len(), 1);

        let merged_a = merge_items(vec![vec![item.clone()], vec![]]);
        let merged_b = merge_items(vec![vec![], vec![item]]);
        assert_eq!(merged_a, merged_b);
    }

    #[test]
    fn signed_payloads_are_domain_separated() {
        let (signing, verifying) = keys(1);
        let contribution = SignedContribution::new(
            Contribution {
                epoch: 1,
                items: vec![],
            },
            0,
            &signing[0],
        );
        contribution.verify(&verifying).unwrap();

        // a contribution signature does not verify as a vote
        let vote = SignedVote {
            vote: Vote {
                epoch: 1,
                proposal_hash: [0; 32],
            },
            member: 0,
            signature: contribution.signature,
        };
        assert!(vote.verify(&verifying).is_err());
    }
}
