//! Engine-level error types.

use consensus::{ConsensusError, ProposalStatus};
use fabric::{FabricError, NodeId};
use nodes::RegistryError;
use queue::QueueError;
use thiserror::Error;
use uuid::Uuid;

/// Errors produced by the engine (flow validation, ledger integrity, state
/// synchronisation and coordination).
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Flow validation errors ------

    /// Two or more steps share the same ID.
    #[error("duplicate step ID: '{0}'")]
    DuplicateStepId(String),

    /// An `on_success` / `on_failure` edge points at a step that doesn't exist.
    #[error("step '{step_id}' references unknown step '{target}' ({edge} edge)")]
    UnknownStepReference {
        step_id: String,
        target: String,
        edge: &'static str,
    },

    /// DFS found a back edge. `path` is the cycle, first step repeated last.
    #[error("flow graph contains a cycle: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    #[error("flow has no steps")]
    EmptyFlow,

    // ------ Ledger integrity errors ------

    #[error("record {index}: stored hash does not match recomputed hash")]
    HashMismatch { index: usize },

    #[error("record {index}: previous-hash link or sequence number is broken")]
    ChainBroken { index: usize },

    #[error("genesis record does not carry the zero previous-hash")]
    InvalidGenesis,

    #[error("record {index}: signature does not verify against the actor key")]
    InvalidSignature { index: usize },

    #[error("record {index}: actor key {actor} is not a trusted signer")]
    UntrustedActor { index: usize, actor: String },

    #[error("record {index}: vector clock of node '{node_id}' went backwards")]
    CausalityViolation { index: usize, node_id: NodeId },

    #[error("ledger for execution {execution_id} is invalid: {reason}")]
    LedgerInvalid { execution_id: Uuid, reason: String },

    #[error("replay {0} not found")]
    ReplayNotFound(Uuid),

    #[error("execution {0} not found")]
    ExecutionNotFound(Uuid),

    /// A state-sync batch was unsigned, signed with a key other than the
    /// one the sender first used, or carried another node's operations.
    #[error("state-sync message from '{0}' failed authentication")]
    UnauthenticatedSync(NodeId),

    // ------ Coordination errors ------

    /// A step failed with a fatal error; the execution is aborted.
    #[error("step '{step_id}' failed fatally: {message}")]
    StepFatal { step_id: String, message: String },

    /// A step's retryable error was exhausted.
    #[error("step '{step_id}' exceeded retry limit: {message}")]
    StepRetryExhausted { step_id: String, message: String },

    #[error("no executor registered for step type '{0}'")]
    NoExecutor(String),

    #[error("no eligible node for step '{0}'")]
    NoEligibleNode(String),

    #[error("every eligible node refused the claim for step '{0}'")]
    ClaimRejected(String),

    #[error("consensus for step '{step_id}' ended as {status:?}")]
    ConsensusNotReached {
        step_id: String,
        status: ProposalStatus,
    },

    // ------ Lower layers ------

    #[error(transparent)]
    Fabric(#[from] FabricError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Persistence error from the db crate.
    #[error("database error: {0}")]
    Database(#[from] db::DbError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
