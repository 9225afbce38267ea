//! Node-wide configuration.
//!
//! Every section falls back to its defaults, so a config file only needs to
//! name the knobs it changes:
//!
//! ```json
//! { "executor": { "max_retries": 5 }, "consensus": { "default_timeout_ms": 10000 } }
//! ```

use std::path::Path;

use consensus::ConsensusConfig;
use nodes::RegistryConfig;
use queue::DistributorConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::coordinator::ExecutorConfig;
use crate::crdt::CrdtConfig;
use crate::ledger::LedgerConfig;
use crate::EngineError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    pub executor: ExecutorConfig,
    pub crdt: CrdtConfig,
    pub ledger: LedgerConfig,
    pub consensus: ConsensusConfig,
    pub registry: RegistryConfig,
    pub distributor: DistributorConfig,
}

impl SwarmConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, EngineError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        debug!(path = %path.display(), "loading swarm config");
        Self::from_json_str(&raw)
    }
}
