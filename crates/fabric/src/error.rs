//! Fabric-level error types.

use thiserror::Error;

use crate::ContentHash;

/// Errors produced by the fabric adapters.
#[derive(Debug, Error)]
pub enum FabricError {
    /// The blob store has no content under this hash.
    #[error("blob not found: {0}")]
    BlobNotFound(ContentHash),

    /// Stored bytes no longer hash to the address they were fetched by.
    #[error("blob {0} failed its content-hash check")]
    BlobCorrupted(ContentHash),

    /// Backing storage failed (database, disk, …).
    #[error("storage error: {0}")]
    Storage(String),

    /// A message could not be delivered on a topic.
    #[error("bus error on topic '{topic}': {message}")]
    Bus { topic: String, message: String },

    /// Malformed key or signature material.
    #[error("invalid key material: {0}")]
    KeyMaterial(String),

    /// Risk scoring collaborator failed or was unreachable.
    #[error("risk scoring unavailable: {0}")]
    RiskUnavailable(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
