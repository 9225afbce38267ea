//! Per-node workload statistics.

use serde::{Deserialize, Serialize};

const AVG_SMOOTHING: f64 = 0.2;
const RELIABILITY_DECAY: f64 = 0.9;
const RELIABILITY_RECOVERY: f64 = 0.05;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeWorkload {
    pub active_jobs: u32,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    /// Exponential moving average, milliseconds.
    pub avg_execution_ms: f64,
    /// `[0, 1]`; decays on failure.
    pub reliability: f64,
}

impl Default for NodeWorkload {
    fn default() -> Self {
        Self {
            active_jobs: 0,
            completed_jobs: 0,
            failed_jobs: 0,
            avg_execution_ms: 0.0,
            reliability: 1.0,
        }
    }
}

impl NodeWorkload {
    pub fn record_claim(&mut self) {
        self.active_jobs += 1;
    }

    pub fn record_completion(&mut self, elapsed_ms: f64) {
        self.active_jobs = self.active_jobs.saturating_sub(1);
        self.completed_jobs += 1;
        self.avg_execution_ms = if self.completed_jobs == 1 {
            elapsed_ms
        } else {
            AVG_SMOOTHING * elapsed_ms + (1.0 - AVG_SMOOTHING) * self.avg_execution_ms
        };
        self.reliability = (self.reliability + RELIABILITY_RECOVERY).min(1.0);
    }

    pub fn record_failure(&mut self) {
        self.active_jobs = self.active_jobs.saturating_sub(1);
        self.failed_jobs += 1;
        self.reliability *= RELIABILITY_DECAY;
    }
}
