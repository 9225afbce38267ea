//! `consensus` crate: the Byzantine Consensus Engine.
//!
//! Operations that must not be decided unilaterally (resource mutation, flow
//! completion, checkpoints) go through a two-phase vote among registered
//! validators. Ballots are Ed25519-signed and weighted; weight is paid for
//! with vote credits under a configurable cost function.

pub mod agent;
pub mod config;
pub mod engine;
pub mod error;
pub mod types;

pub use agent::{ApproveAll, FixedVote, ValidatorAgent, VotePolicy};
pub use config::{quorum, ConsensusConfig, TieBreaker, VoteCostFunction};
pub use engine::ByzantineConsensus;
pub use error::ConsensusError;
pub use types::{
    ByzantineBehavior, ByzantineDetection, ConsensusMessage, ConsensusPhase, ConsensusProposal,
    ConsensusVote, ProposalStatus, ProposalType, Severity, ValidatorNode, ValidatorStatus,
    VoteChoice, VoteOutcome,
};
