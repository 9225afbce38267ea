//! Typed error type for the consensus crate.

use fabric::{FabricError, NodeId};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("proposal {0} not found")]
    ProposalNotFound(Uuid),

    #[error("no active validators")]
    NoActiveValidators,

    #[error("node {0} is not a registered validator")]
    UnknownValidator(NodeId),

    #[error("validator {0} is not active")]
    NotActiveValidator(NodeId),

    #[error("invalid ballot signature from {0}")]
    InvalidSignature(NodeId),

    #[error("node {node_id} already voted in this phase of proposal {proposal_id}")]
    DoubleVote { node_id: NodeId, proposal_id: Uuid },

    #[error("vote weight {weight} is not allowed for {node_id}")]
    InvalidWeight { node_id: NodeId, weight: f64 },

    #[error("{node_id} needs {cost} vote credits but has {available}")]
    InsufficientCredits {
        node_id: NodeId,
        cost: f64,
        available: f64,
    },

    #[error("ballot buffer full, dropping ballot for unknown proposal {0}")]
    OrphanBufferFull(Uuid),

    #[error("fabric error: {0}")]
    Fabric(#[from] FabricError),
}
