//! Error types for step executors and the capability registry.

use fabric::{FabricError, NodeId};
use thiserror::Error;

/// Errors returned by a step executor's `execute` method.
///
/// The coordinator uses the variant to decide retry behaviour:
/// - `Retryable`: the step is re-run with exponential back-off.
/// - `Fatal`:     the step is immediately failed.
#[derive(Debug, Error, Clone)]
pub enum NodeError {
    /// Transient failure; the coordinator should re-try the step.
    #[error("retryable node error: {0}")]
    Retryable(String),

    /// Permanent failure; no retry should be attempted.
    #[error("fatal node error: {0}")]
    Fatal(String),
}

/// Errors raised by the capability registry and selector.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("manifest for node {0} has expired")]
    ManifestExpired(NodeId),

    #[error("manifest for node {0} is not signed")]
    ManifestUnsigned(NodeId),

    #[error("manifest signature for node {0} does not verify against its issuer")]
    InvalidSignature(NodeId),

    #[error("manifest for node {node_id} is signed by {issuer}, not the node's pinned key")]
    IssuerMismatch { node_id: NodeId, issuer: String },

    #[error("node {0} has no registered manifest")]
    NodeNotFound(NodeId),

    #[error("fabric error: {0}")]
    Fabric(#[from] FabricError),
}
