//! Consensus policy knobs.
//!
//! The vote-cost function and tie-breaking rule are policy, not protocol, so
//! both are configurable.

use chrono::Duration;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteCostFunction {
    /// cost = weight
    Linear,
    /// cost = weight²
    #[default]
    Quadratic,
}

impl VoteCostFunction {
    pub fn cost(&self, weight: f64) -> f64 {
        match self {
            VoteCostFunction::Linear => weight,
            VoteCostFunction::Quadratic => weight * weight,
        }
    }
}

/// How a phase is decided when weighted yes equals weighted no.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreaker {
    /// Compare summed reputation of the yes and no voters; yes wins ties.
    #[default]
    ReputationWeighted,
    Approve,
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub default_timeout_ms: u64,
    /// Validators silent for longer are flagged.
    pub heartbeat_timeout_ms: u64,
    /// How often a validator publishes its own heartbeat.
    pub heartbeat_interval_ms: u64,
    pub vote_cost: VoteCostFunction,
    pub tie_breaker: TieBreaker,
    /// Credits each validator may spend on vote weight within one proposal,
    /// across both phases. Every new proposal starts from a full budget.
    pub vote_credits: f64,
    pub default_vote_weight: f64,
    /// Fraction of reputation and weight lost per invalid signature.
    pub signature_penalty: f64,
    pub watchdog_interval_ms: u64,
    /// Decided proposals are dropped this long after their decision.
    pub decided_retention_ms: u64,
    /// Ballots for a proposal that never shows up are dropped after this.
    pub orphan_vote_ttl_ms: u64,
    pub max_orphan_votes: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            heartbeat_timeout_ms: 300_000,
            heartbeat_interval_ms: 30_000,
            vote_cost: VoteCostFunction::Quadratic,
            tie_breaker: TieBreaker::ReputationWeighted,
            vote_credits: 100.0,
            default_vote_weight: 1.0,
            signature_penalty: 0.1,
            watchdog_interval_ms: 1_000,
            decided_retention_ms: 600_000,
            orphan_vote_ttl_ms: 60_000,
            max_orphan_votes: 10_000,
        }
    }
}

impl ConsensusConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::milliseconds(self.default_timeout_ms as i64)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::milliseconds(self.heartbeat_timeout_ms as i64)
    }

    pub fn decided_retention(&self) -> Duration {
        Duration::milliseconds(self.decided_retention_ms as i64)
    }

    pub fn orphan_vote_ttl(&self) -> Duration {
        Duration::milliseconds(self.orphan_vote_ttl_ms as i64)
    }
}

/// ⌊2n/3⌋ + 1
pub fn quorum(active_validators: usize) -> usize {
    2 * active_validators / 3 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_is_two_thirds_plus_one() {
        assert_eq!(quorum(1), 1);
        assert_eq!(quorum(3), 3);
        assert_eq!(quorum(4), 3);
        assert_eq!(quorum(7), 5);
        assert_eq!(quorum(10), 7);
    }

    #[test]
    fn quadratic_cost() {
        assert_eq!(VoteCostFunction::Quadratic.cost(3.0), 9.0);
        assert_eq!(VoteCostFunction::Linear.cost(3.0), 3.0);
    }
}
