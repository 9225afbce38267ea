//! `queue` crate: the Fair Work Distributor.
//!
//! Work is announced on the bus, claimed by at most one node at a time under
//! capacity and token-bucket gates, and re-announced with exponential backoff
//! until it is claimed or expires.

pub mod config;
pub mod distributor;
pub mod error;
pub mod models;
pub mod token_bucket;
pub mod workload;

pub use config::DistributorConfig;
pub use distributor::WorkDistributor;
pub use error::QueueError;
pub use models::{
    NodeCapacity, WorkAnnouncement, WorkClaimNotice, WorkItem, WorkOutcome, WorkPriority,
    WorkRequirements, WorkStatus, WorkSubmission,
};
pub use token_bucket::TokenBucket;
pub use workload::NodeWorkload;
