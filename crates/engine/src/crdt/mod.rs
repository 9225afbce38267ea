//! CRDT State Synchronizer.
//!
//! Every execution carries a shared JSON state document. Nodes mutate it
//! with operations stamped by vector clocks; concurrent operations are merged
//! without locks and conflicts are resolved deterministically and logged.

pub mod document;
pub mod operation;
pub mod synchronizer;

use serde::{Deserialize, Serialize};

pub use document::{
    CompactionRecord, ConflictResolution, CrdtDocument, CrdtSnapshot, MergeReport,
    ResolutionStrategy,
};
pub use operation::{CrdtOperation, OperationKind, OperationSpec};
pub use synchronizer::{CrdtSynchronizer, StateSyncMessage};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrdtConfig {
    /// Compact once the log holds more operations than this.
    pub compaction_threshold: usize,
    /// Compact at least this often while the log is above `retain_operations`.
    pub compaction_interval_ms: u64,
    /// Operations kept in the log after compaction.
    pub retain_operations: usize,
    /// How often the background compactor checks documents.
    pub compactor_interval_ms: u64,
    /// Remote operations held per document while their dependencies are
    /// missing. Further ones are dropped.
    pub max_deferred_ops: usize,
}

impl Default for CrdtConfig {
    fn default() -> Self {
        Self {
            compaction_threshold: 1_000,
            compaction_interval_ms: 300_000,
            retain_operations: 100,
            compactor_interval_ms: 10_000,
            max_deferred_ops: document::DEFAULT_MAX_DEFERRED,
        }
    }
}
