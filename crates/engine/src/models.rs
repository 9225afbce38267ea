//! Core domain models for the engine.
//!
//! A flow is an arena of steps indexed by id; control edges are plain id
//! lists (`on_success`, `on_failure`). Ledger records are the tamper-evident
//! trace of what happened to each step of an execution.

use chrono::{DateTime, Utc};
use fabric::{ContentHash, NodeId, Signature, VectorClock};
use queue::WorkPriority;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// StepDefinition
// ---------------------------------------------------------------------------

/// A single step in the flow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique identifier within this flow (referenced by edges).
    pub id: String,
    /// Maps to a registered `StepExecutor` implementation.
    pub step_type: String,
    /// Arbitrary configuration passed to the step at execution time.
    #[serde(default)]
    pub config: Value,
    /// Capabilities a node must hold to claim this step.
    #[serde(default)]
    pub requirements: Vec<String>,
    /// When set, the step's result is only final once validators approve it.
    #[serde(default)]
    pub consensus_gated: bool,
    #[serde(default)]
    pub priority: WorkPriority,
    /// Steps activated when this one succeeds.
    #[serde(default)]
    pub on_success: Vec<String>,
    /// Steps activated when this one fails. A failure with no handler fails
    /// the execution.
    #[serde(default)]
    pub on_failure: Vec<String>,
}

impl StepDefinition {
    pub fn new(id: impl Into<String>, step_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            step_type: step_type.into(),
            config: Value::Null,
            requirements: Vec::new(),
            consensus_gated: false,
            priority: WorkPriority::Normal,
            on_success: Vec::new(),
            on_failure: Vec::new(),
        }
    }

    pub fn then(mut self, next: impl Into<String>) -> Self {
        self.on_success.push(next.into());
        self
    }

    pub fn on_failure(mut self, handler: impl Into<String>) -> Self {
        self.on_failure.push(handler.into());
        self
    }

    pub fn requires(mut self, capability: impl Into<String>) -> Self {
        self.requirements.push(capability.into());
        self
    }

    pub fn gated(mut self) -> Self {
        self.consensus_gated = true;
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }
}

// ---------------------------------------------------------------------------
// FlowDefinition
// ---------------------------------------------------------------------------

/// A complete flow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub id: Uuid,
    pub name: String,
    pub steps: Vec<StepDefinition>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl FlowDefinition {
    /// Convenience constructor for testing.
    pub fn new(name: impl Into<String>, steps: Vec<StepDefinition>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            steps,
            created_at: Utc::now(),
        }
    }

    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }
}

// ---------------------------------------------------------------------------
// Ledger records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    StepCompleted,
    StepFailed,
    ConsensusApproved,
    ConsensusRejected,
    FlowCompleted,
    FlowFailed,
}

/// What a caller hands to `append_record`; the ledger fills in the rest.
#[derive(Debug, Clone)]
pub struct PartialRecord {
    pub execution_id: Uuid,
    pub step_id: String,
    pub kind: RecordKind,
    /// Node that performed the step.
    pub node_id: NodeId,
    pub payload: Value,
}

/// One entry of an execution's hash chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: Uuid,
    /// Position in the chain, starting at 0.
    pub seq: u64,
    pub step_id: String,
    pub kind: RecordKind,
    pub prev_hash: ContentHash,
    /// Blob-store address of the record payload.
    pub payload_hash: ContentHash,
    /// Hex public key of the signer.
    pub actor: String,
    pub node_id: NodeId,
    pub timestamp: DateTime<Utc>,
    pub vector_clock: VectorClock,
    pub record_hash: ContentHash,
    pub signature: Option<Signature>,
}

/// Cursor over a validated chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayState {
    pub replay_id: Uuid,
    pub execution_id: Uuid,
    pub cursor: usize,
    pub total: usize,
    pub vector_clock: VectorClock,
    /// `h_i = BLAKE3(h_{i-1} || record_hash_i)`, starting from the zero hash.
    pub state_hash: ContentHash,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ReplayState {
    pub fn is_finished(&self) -> bool {
        self.cursor >= self.total
    }
}
