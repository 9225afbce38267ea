//! Risk scoring collaborator and its local fallback.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{FabricError, NodeId};

/// Input handed to the risk scoring service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskContext {
    pub node_id: NodeId,
    /// Capabilities whose measured performance deviated past the anomaly threshold.
    pub anomalies: Vec<String>,
    /// Largest per-capability variance observed, in percent.
    pub max_variance_pct: f64,
    pub capabilities_checked: usize,
}

/// Scores a node's risk in `[0, 1]`; higher is riskier.
#[async_trait]
pub trait RiskScorer: Send + Sync {
    async fn assess_risk(&self, context: &RiskContext) -> Result<f64, FabricError>;
}

/// Linear penalty per anomaly, clamped to `[0, 1]`.
#[derive(Debug, Clone)]
pub struct LocalRiskScorer {
    pub penalty_per_anomaly: f64,
}

impl Default for LocalRiskScorer {
    fn default() -> Self {
        Self {
            penalty_per_anomaly: 0.25,
        }
    }
}

impl LocalRiskScorer {
    pub fn score(&self, context: &RiskContext) -> f64 {
        (context.anomalies.len() as f64 * self.penalty_per_anomaly).clamp(0.0, 1.0)
    }
}

#[async_trait]
impl RiskScorer for LocalRiskScorer {
    async fn assess_risk(&self, context: &RiskContext) -> Result<f64, FabricError> {
        Ok(self.score(context))
    }
}
