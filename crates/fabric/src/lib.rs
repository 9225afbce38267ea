//! `fabric` crate: shared primitives and the adapters the swarm core depends on.
//!
//! Everything here is either a value type used by every subsystem
//! ([`NodeId`], [`ContentHash`], [`VectorClock`]) or the contract of an
//! external collaborator (blob store, pub/sub bus, signing service, risk
//! scoring) together with an in-process implementation.

pub mod blob;
pub mod bus;
pub mod clock;
pub mod error;
pub mod hash;
pub mod risk;
pub mod signing;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use blob::{BlobStore, MemoryBlobStore};
pub use bus::{
    publish_heartbeat, spawn_heartbeat, Envelope, Heartbeat, IdleLoad, LoadReporter, LocalBus,
    MessageBus, MessagePriority, Topic,
};
pub use clock::{CausalOrder, VectorClock};
pub use error::FabricError;
pub use hash::ContentHash;
pub use risk::{LocalRiskScorer, RiskContext, RiskScorer};
pub use signing::{verify_signature, Ed25519Signer, Signature, SigningService};

/// Identity of a swarm node.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for NodeId {
    fn from(value: String) -> Self {
        Self(value)
    }
}
