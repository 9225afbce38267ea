//! Distributor tuning knobs.

use chrono::Duration;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributorConfig {
    /// Delay before the first reannouncement.
    pub initial_announce_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub max_announce_delay_ms: u64,
    /// Delays are scaled by a random factor in `[1 - jitter, 1 + jitter]`.
    pub jitter_ratio: f64,
    /// Reannouncements without a claim before the item expires.
    pub max_announce_attempts: u32,
    pub max_concurrent_jobs: u32,
    pub cpu_threshold: f64,
    pub memory_threshold: f64,
    pub bucket_capacity: f64,
    pub refill_per_sec: f64,
    /// Pending longer than this gets a priority boost on rebalance.
    pub starvation_threshold_ms: u64,
    /// A claim not completed within this window counts as a failure.
    pub claim_timeout_ms: u64,
    pub default_max_retries: u32,
    pub scheduler_interval_ms: u64,
    /// Completed, failed and expired items are dropped after this long.
    pub finished_retention_ms: u64,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            initial_announce_delay_ms: 1_000,
            backoff_multiplier: 2.0,
            max_announce_delay_ms: 60_000,
            jitter_ratio: 0.1,
            max_announce_attempts: 5,
            max_concurrent_jobs: 4,
            cpu_threshold: 0.9,
            memory_threshold: 0.9,
            bucket_capacity: 10.0,
            refill_per_sec: 1.0,
            starvation_threshold_ms: 30_000,
            claim_timeout_ms: 300_000,
            default_max_retries: 3,
            scheduler_interval_ms: 1_000,
            finished_retention_ms: 600_000,
        }
    }
}

impl DistributorConfig {
    /// Un-jittered delay before reannouncement number `attempt + 1`.
    pub fn base_delay_ms(&self, attempt: u32) -> f64 {
        let raw = self.initial_announce_delay_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        raw.min(self.max_announce_delay_ms as f64)
    }

    pub fn starvation_threshold(&self) -> Duration {
        Duration::milliseconds(self.starvation_threshold_ms as i64)
    }

    pub fn claim_timeout(&self) -> Duration {
        Duration::milliseconds(self.claim_timeout_ms as i64)
    }

    pub fn finished_retention(&self) -> Duration {
        Duration::milliseconds(self.finished_retention_ms as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let cfg = DistributorConfig::default();
        assert_eq!(cfg.base_delay_ms(0), 1_000.0);
        assert_eq!(cfg.base_delay_ms(1), 2_000.0);
        assert_eq!(cfg.base_delay_ms(3), 8_000.0);
        assert_eq!(cfg.base_delay_ms(10), 60_000.0);
    }
}
