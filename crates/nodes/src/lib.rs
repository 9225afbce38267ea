//! `nodes` crate: the step executor contract, node capability manifests,
//! the Node Capability Registry and the Node Selector.
//!
//! Steps are opaque to the core: anything implementing [`StepExecutor`] can
//! run one. Which node runs it is decided from verified capabilities
//! ([`CapabilityRegistry`]) and live load ([`NodeSelector`]).

pub mod error;
pub mod manifest;
pub mod mock;
pub mod registry;
pub mod selector;
pub mod traits;

pub use error::{NodeError, RegistryError};
pub use manifest::{Capability, DeclaredResources, NodeCapabilityManifest};
pub use registry::{
    CapabilityRegistry, CapabilityStatus, CapabilityVerification, RegistryConfig,
    VerificationStatus, VerifiedCandidate, VerifiedSelectionCriteria,
};
pub use selector::{
    verification_scores, NodeSelector, NodeStatus, SelectionCriteria, SelectionStrategy,
};
pub use traits::{BenchmarkProbe, ExecutionContext, StepExecutor};
