//! `engine` crate: flow models, graph validation, the execution ledger,
//! CRDT state synchronisation and the flow coordinator.

pub mod config;
pub mod coordinator;
pub mod crdt;
pub mod dag;
pub mod error;
pub mod ledger;
pub mod models;

pub use config::SwarmConfig;
pub use coordinator::{
    ExecutorConfig, ExecutorRegistry, FlowCoordinator, FlowOutcome, FlowStatus, SwarmServices,
};
pub use crdt::{CrdtConfig, CrdtSynchronizer, OperationSpec};
pub use dag::{entry_steps, validate_flow};
pub use error::EngineError;
pub use ledger::{
    validate_chain, validate_chain_signed_by, ExecutionLedger, LedgerArchive, LedgerConfig,
    PgLedgerArchive,
};
pub use models::{
    ExecutionRecord, FlowDefinition, PartialRecord, RecordKind, ReplayState, StepDefinition,
};

#[cfg(test)]
mod coordinator_tests;
