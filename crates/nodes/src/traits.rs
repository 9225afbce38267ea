//! Contracts for the opaque step runtime and for benchmark probes.

use async_trait::async_trait;
use fabric::NodeId;
use serde_json::Value;
use uuid::Uuid;

use crate::manifest::Capability;
use crate::NodeError;

/// Shared context passed to every executor invocation.
///
/// Defined here (in the nodes crate) so both the engine and individual
/// executor implementations can import it without a circular dependency.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// ID of the flow definition being run.
    pub flow_id: Uuid,
    /// ID of the current execution run.
    pub execution_id: Uuid,
    pub step_id: String,
    /// Node the step was dispatched to.
    pub node_id: NodeId,
    /// 1-based attempt number.
    pub attempt: u32,
}

/// The step runtime contract.
///
/// The core never looks inside a step: it hands the executor a JSON payload
/// and records whatever comes back.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, payload: Value, ctx: &ExecutionContext) -> Result<Value, NodeError>;
}

/// Runs a capability-specific benchmark against a node.
#[async_trait]
pub trait BenchmarkProbe: Send + Sync {
    /// Measured performance, in the same unit as
    /// [`Capability::declared_performance`].
    async fn measure(&self, node_id: &NodeId, capability: &Capability) -> Result<f64, NodeError>;
}
