//! Proposals, ballots, validators and Byzantine evidence.

use chrono::{DateTime, Utc};
use fabric::{verify_signature, FabricError, NodeId, Signature, SigningService};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Proposals
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalType {
    ResourceMutation,
    FlowCompletion,
    Checkpoint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusPhase {
    Prepare,
    Commit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    /// Collecting prepare votes.
    Pending,
    /// Prepare approved; collecting commit votes.
    Prepared,
    Approved,
    Rejected,
    Timeout,
}

impl ProposalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProposalStatus::Approved | ProposalStatus::Rejected | ProposalStatus::Timeout
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusProposal {
    pub proposal_id: Uuid,
    pub proposal_type: ProposalType,
    pub data: Value,
    pub proposer: NodeId,
    pub created_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub required_votes: usize,
    pub phase: ConsensusPhase,
    pub status: ProposalStatus,
    /// Ballots counted in the current phase.
    pub votes: Vec<ConsensusVote>,
    pub decided_at: Option<DateTime<Utc>>,
}

impl ConsensusProposal {
    pub fn weighted_totals(&self) -> (f64, f64) {
        self.votes.iter().fold((0.0, 0.0), |(yes, no), v| match v.choice {
            VoteChoice::Yes => (yes + v.weight, no),
            VoteChoice::No => (yes, no + v.weight),
            VoteChoice::Abstain => (yes, no),
        })
    }
}

// ---------------------------------------------------------------------------
// Votes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteChoice {
    Yes,
    No,
    Abstain,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusVote {
    pub vote_id: Uuid,
    pub proposal_id: Uuid,
    pub node_id: NodeId,
    pub phase: ConsensusPhase,
    pub choice: VoteChoice,
    pub weight: f64,
    pub cast_at: DateTime<Utc>,
    pub signature: Option<Signature>,
}

#[derive(Serialize)]
struct BallotFields<'a> {
    vote_id: &'a Uuid,
    proposal_id: &'a Uuid,
    node_id: &'a NodeId,
    phase: ConsensusPhase,
    choice: VoteChoice,
    weight: f64,
    cast_at: &'a DateTime<Utc>,
}

impl ConsensusVote {
    pub fn new(
        proposal_id: Uuid,
        node_id: NodeId,
        phase: ConsensusPhase,
        choice: VoteChoice,
        weight: f64,
    ) -> Self {
        Self {
            vote_id: Uuid::new_v4(),
            proposal_id,
            node_id,
            phase,
            choice,
            weight,
            cast_at: Utc::now(),
            signature: None,
        }
    }

    pub fn signing_bytes(&self) -> Result<Vec<u8>, FabricError> {
        let fields = BallotFields {
            vote_id: &self.vote_id,
            proposal_id: &self.proposal_id,
            node_id: &self.node_id,
            phase: self.phase,
            choice: self.choice,
            weight: self.weight,
            cast_at: &self.cast_at,
        };
        Ok(serde_json::to_vec(&fields)?)
    }

    pub fn signed(mut self, signer: &dyn SigningService) -> Result<Self, FabricError> {
        let bytes = self.signing_bytes()?;
        self.signature = Some(signer.sign(&bytes));
        Ok(self)
    }

    /// True when signed by `public_key` over the current ballot fields.
    pub fn verify(&self, public_key: &str) -> bool {
        let Some(sig) = &self.signature else {
            return false;
        };
        if sig.public_key != public_key {
            return false;
        }
        match self.signing_bytes() {
            Ok(bytes) => verify_signature(&bytes, sig),
            Err(_) => false,
        }
    }
}

/// Result of submitting a ballot. Only `Counted` changed the tally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    Counted(ProposalStatus),
    /// Same vote id seen before.
    Duplicate,
    /// The proposal was already decided.
    Closed,
    /// Held until the proposal (or its commit phase) is known locally.
    Deferred,
}

// ---------------------------------------------------------------------------
// Validators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidatorStatus {
    Active,
    Byzantine,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorNode {
    pub node_id: NodeId,
    /// Hex verifying key ballots must be signed with.
    pub public_key: String,
    pub weight: f64,
    /// `[0, 1]`.
    pub reputation: f64,
    pub status: ValidatorStatus,
    /// Vote-credit budget per proposal.
    pub credits: f64,
    pub last_heartbeat: DateTime<Utc>,
    /// Set once a stale heartbeat was reported, cleared by the next heartbeat.
    pub heartbeat_flagged: bool,
}

impl ValidatorNode {
    pub fn new(node_id: NodeId, public_key: String) -> Self {
        Self {
            node_id,
            public_key,
            weight: 1.0,
            reputation: 1.0,
            status: ValidatorStatus::Active,
            credits: 0.0,
            last_heartbeat: Utc::now(),
            heartbeat_flagged: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ValidatorStatus::Active
    }
}

// ---------------------------------------------------------------------------
// Byzantine evidence
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ByzantineBehavior {
    /// A second ballot with the same choice.
    DoubleVoting,
    /// A second ballot with a different choice.
    ConflictingVotes,
    InvalidSignature,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warn,
    Penalize,
    Exclude,
}

impl ByzantineBehavior {
    pub fn severity(&self) -> Severity {
        match self {
            ByzantineBehavior::DoubleVoting | ByzantineBehavior::ConflictingVotes => Severity::Exclude,
            ByzantineBehavior::InvalidSignature => Severity::Penalize,
            ByzantineBehavior::Timeout => Severity::Warn,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ByzantineDetection {
    pub detection_id: Uuid,
    pub node_id: NodeId,
    pub behavior: ByzantineBehavior,
    pub severity: Severity,
    pub evidence: Value,
    /// What was done about it, for the audit trail.
    pub action: String,
    pub detected_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Wire messages
// ---------------------------------------------------------------------------

/// Payload of envelopes on the consensus topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConsensusMessage {
    Proposal { proposal: ConsensusProposal },
    Vote { vote: ConsensusVote },
    Decision { proposal_id: Uuid, status: ProposalStatus },
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric::Ed25519Signer;

    #[test]
    fn ballot_signature_binds_choice_and_key() {
        let signer = Ed25519Signer::from_seed([4u8; 32]);
        let vote = ConsensusVote::new(
            Uuid::new_v4(),
            NodeId::from("v1"),
            ConsensusPhase::Prepare,
            VoteChoice::Yes,
            1.0,
        )
        .signed(&signer)
        .unwrap();
        assert!(vote.verify(&signer.public_key()));
        assert!(!vote.verify(&Ed25519Signer::from_seed([5u8; 32]).public_key()));

        let mut flipped = vote.clone();
        flipped.choice = VoteChoice::No;
        assert!(!flipped.verify(&signer.public_key()));
    }

    #[test]
    fn totals_ignore_abstentions() {
        let mk = |choice, weight| {
            ConsensusVote::new(Uuid::nil(), NodeId::from("v"), ConsensusPhase::Prepare, choice, weight)
        };
        let proposal = ConsensusProposal {
            proposal_id: Uuid::nil(),
            proposal_type: ProposalType::Checkpoint,
            data: Value::Null,
            proposer: NodeId::from("p"),
            created_at: Utc::now(),
            deadline: Utc::now(),
            required_votes: 3,
            phase: ConsensusPhase::Prepare,
            status: ProposalStatus::Pending,
            votes: vec![
                mk(VoteChoice::Yes, 2.0),
                mk(VoteChoice::No, 1.0),
                mk(VoteChoice::Abstain, 5.0),
            ],
            decided_at: None,
        };
        assert_eq!(proposal.weighted_totals(), (2.0, 1.0));
    }
}
