//! Live node selection for dispatch.
//!
//! [`NodeSelector`] narrows the registry's verified candidates using live
//! status fed by heartbeats, then picks one node with a
//! [`SelectionStrategy`]. Heartbeats off the bus are accepted only when
//! signed with the node's pinned key. Performance and reputation come from
//! the node's latest capability verification.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use fabric::{Envelope, Heartbeat, MessageBus, NodeId, Topic};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, instrument};

use crate::registry::{
    CapabilityRegistry, CapabilityVerification, VerifiedSelectionCriteria,
};
use crate::RegistryError;

// ---------------------------------------------------------------------------
// Live status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    /// Fraction of job slots in use, `[0, 1]`.
    pub load: f64,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub latency_ms: f64,
    /// `[0, 1]`.
    pub reputation: f64,
    /// Normalised benchmark score, `[0, 1]`.
    pub performance_score: f64,
    pub last_seen: DateTime<Utc>,
}

impl NodeStatus {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            load: 0.0,
            cpu_usage: 0.0,
            memory_usage: 0.0,
            latency_ms: 0.0,
            reputation: 0.5,
            performance_score: 0.5,
            last_seen: Utc::now(),
        }
    }
}

/// Performance as the mean fraction of declared capability a node actually
/// delivered (capped at 1, failed probes count as 0), and reputation as
/// `1 - risk`.
pub fn verification_scores(verification: &CapabilityVerification) -> (f64, f64) {
    let performance = if verification.checks.is_empty() {
        0.0
    } else {
        let delivered: f64 = verification
            .checks
            .iter()
            .map(|c| match c.measured {
                Some(m) if c.declared > 0.0 => (m / c.declared).clamp(0.0, 1.0),
                Some(_) => 1.0,
                None => 0.0,
            })
            .sum();
        delivered / verification.checks.len() as f64
    };
    (performance, (1.0 - verification.risk_score).clamp(0.0, 1.0))
}

/// 40% performance, 30% inverse load, 20% reputation, 10% inverse latency
/// (latency saturates at one second).
pub fn weighted_score(status: &NodeStatus) -> f64 {
    let inverse_latency = 1.0 - (status.latency_ms / 1000.0).min(1.0);
    0.4 * status.performance_score
        + 0.3 * (1.0 - status.load)
        + 0.2 * status.reputation
        + 0.1 * inverse_latency
}

// ---------------------------------------------------------------------------
// Criteria
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    RoundRobin,
    LeastLoaded,
    #[default]
    WeightedScore,
    Random,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionCriteria {
    pub required_capabilities: Vec<String>,
    pub min_compliance_level: u8,
    pub max_risk_score: Option<f64>,
    pub dao_subnet: Option<String>,
    pub min_performance: Option<f64>,
    pub max_latency_ms: Option<f64>,
    /// Minimum free CPU fraction.
    pub min_cpu_headroom: Option<f64>,
    /// Minimum free memory fraction.
    pub min_memory_headroom: Option<f64>,
    /// Allowed regions; empty means any.
    pub regions: Vec<String>,
    pub exclude: Vec<NodeId>,
    pub strategy: SelectionStrategy,
}

impl SelectionCriteria {
    fn verified(&self) -> VerifiedSelectionCriteria {
        VerifiedSelectionCriteria {
            required_capabilities: self.required_capabilities.clone(),
            min_compliance_level: self.min_compliance_level,
            max_risk_score: self.max_risk_score,
        }
    }
}

// ---------------------------------------------------------------------------
// NodeSelector
// ---------------------------------------------------------------------------

pub struct NodeSelector {
    registry: Arc<CapabilityRegistry>,
    statuses: DashMap<NodeId, NodeStatus>,
    cursor: AtomicUsize,
    /// Nodes not heard from for longer are not selectable.
    stale_after: Option<Duration>,
}

impl NodeSelector {
    pub fn new(registry: Arc<CapabilityRegistry>) -> Self {
        Self {
            registry,
            statuses: DashMap::new(),
            cursor: AtomicUsize::new(0),
            stale_after: None,
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = Some(stale_after);
        self
    }

    pub fn update_status(&self, status: NodeStatus) {
        self.statuses.insert(status.node_id.clone(), status);
    }

    /// Default status seeded with the node's verification scores, if any.
    fn fresh_status(&self, node_id: &NodeId) -> NodeStatus {
        let mut status = NodeStatus::new(node_id.clone());
        if let Some(v) = self.registry.verification(node_id) {
            (status.performance_score, status.reputation) = verification_scores(&v);
        }
        status
    }

    /// Fold a verification result into the node's live status.
    pub fn apply_verification(&self, verification: &CapabilityVerification) {
        let (performance, reputation) = verification_scores(verification);
        if let Some(mut s) = self.statuses.get_mut(&verification.node_id) {
            s.performance_score = performance;
            s.reputation = reputation;
        }
        debug!(node_id = %verification.node_id, performance, reputation, "verification scores applied");
    }

    /// Fold a heartbeat into the node's live status, keeping reputation and
    /// performance from earlier updates.
    pub fn record_heartbeat(&self, heartbeat: &Heartbeat) {
        let mut entry = self
            .statuses
            .entry(heartbeat.node_id.clone())
            .or_insert_with(|| self.fresh_status(&heartbeat.node_id));
        entry.load = heartbeat.load();
        entry.cpu_usage = heartbeat.cpu_usage;
        entry.memory_usage = heartbeat.memory_usage;
        entry.latency_ms = heartbeat.latency_ms;
        entry.last_seen = heartbeat.sent_at;
    }

    /// Check and ingest a heartbeat envelope from the bus.
    pub fn handle_heartbeat(&self, envelope: &Envelope) -> Result<(), RegistryError> {
        if !envelope.verify() {
            return Err(RegistryError::InvalidSignature(envelope.sender.clone()));
        }
        let heartbeat: Heartbeat = envelope.decode()?;
        if heartbeat.node_id != envelope.sender {
            return Err(RegistryError::InvalidSignature(envelope.sender.clone()));
        }
        let key = self
            .registry
            .node_key(&heartbeat.node_id)
            .ok_or_else(|| RegistryError::NodeNotFound(heartbeat.node_id.clone()))?;
        if !envelope.verify_from(&key) {
            return Err(RegistryError::InvalidSignature(heartbeat.node_id));
        }
        self.record_heartbeat(&heartbeat);
        Ok(())
    }

    /// Subscribe to the heartbeat topic, then feed every envelope to
    /// [`handle_heartbeat`](Self::handle_heartbeat).
    pub async fn spawn_heartbeat_listener(self: Arc<Self>, bus: Arc<dyn MessageBus>) -> JoinHandle<()> {
        let mut rx = bus.subscribe(Topic::Heartbeat).await;
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if let Err(e) = self.handle_heartbeat(&envelope) {
                    debug!(sender = %envelope.sender, error = %e, "heartbeat rejected");
                }
            }
        })
    }

    pub fn set_reputation(&self, node_id: &NodeId, reputation: f64) {
        if let Some(mut s) = self.statuses.get_mut(node_id) {
            s.reputation = reputation.clamp(0.0, 1.0);
        }
    }

    pub fn status(&self, node_id: &NodeId) -> Option<NodeStatus> {
        self.statuses.get(node_id).map(|s| s.clone())
    }

    pub fn select_node(&self, criteria: &SelectionCriteria) -> Option<NodeId> {
        self.select_node_at(criteria, Utc::now())
    }

    #[instrument(skip(self, criteria), fields(strategy = ?criteria.strategy))]
    pub fn select_node_at(&self, criteria: &SelectionCriteria, now: DateTime<Utc>) -> Option<NodeId> {
        let candidates = self.candidates_at(criteria, now);
        if candidates.is_empty() {
            debug!("no node satisfies selection criteria");
            return None;
        }

        let chosen = match criteria.strategy {
            SelectionStrategy::RoundRobin => {
                let i = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
                &candidates[i]
            }
            SelectionStrategy::LeastLoaded => candidates
                .iter()
                .min_by(|a, b| a.load.total_cmp(&b.load))?,
            SelectionStrategy::WeightedScore => candidates
                .iter()
                .max_by(|a, b| weighted_score(a).total_cmp(&weighted_score(b)))?,
            SelectionStrategy::Random => candidates.choose(&mut rand::thread_rng())?,
        };
        debug!(node_id = %chosen.node_id, candidates = candidates.len(), "node selected");
        Some(chosen.node_id.clone())
    }

    /// Every node passing the verified-capability and live filters, in node id
    /// order. Nodes without live status are skipped.
    pub fn candidates_at(&self, criteria: &SelectionCriteria, now: DateTime<Utc>) -> Vec<NodeStatus> {
        let mut out: Vec<NodeStatus> = self
            .registry
            .select_verified_nodes_at(&criteria.verified(), now)
            .into_iter()
            .filter(|c| !criteria.exclude.contains(&c.node_id))
            .filter_map(|c| {
                let manifest = self.registry.manifest(&c.node_id)?;
                if let Some(subnet) = &criteria.dao_subnet {
                    if !manifest.dao_subnets.contains(subnet) {
                        return None;
                    }
                }
                if !criteria.regions.is_empty() {
                    let region = manifest.region.as_ref()?;
                    if !criteria.regions.contains(region) {
                        return None;
                    }
                }
                let status = self.status(&c.node_id)?;
                if self.stale_after.is_some_and(|max| now - status.last_seen > max) {
                    return None;
                }
                if criteria.min_performance.is_some_and(|min| status.performance_score < min)
                    || criteria.max_latency_ms.is_some_and(|max| status.latency_ms > max)
                    || criteria
                        .min_cpu_headroom
                        .is_some_and(|min| 1.0 - status.cpu_usage < min)
                    || criteria
                        .min_memory_headroom
                        .is_some_and(|min| 1.0 - status.memory_usage < min)
                {
                    return None;
                }
                Some(status)
            })
            .collect();
        out.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        out
    }
}
