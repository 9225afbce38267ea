//! Typed error type for the queue crate.
//!
//! Claim contention is not an error: `claim_work` returns `false`.

use fabric::{FabricError, NodeId};
use thiserror::Error;
use uuid::Uuid;

use crate::models::WorkStatus;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("work item {0} not found")]
    WorkNotFound(Uuid),

    #[error("node {node_id} does not hold the claim on work item {work_id}")]
    NotClaimant { work_id: Uuid, node_id: NodeId },

    #[error("work item {work_id} cannot move from {status:?}")]
    InvalidTransition { work_id: Uuid, status: WorkStatus },

    #[error("fabric error: {0}")]
    Fabric(#[from] FabricError),
}
