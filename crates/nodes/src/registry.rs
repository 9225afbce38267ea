//! Node Capability Registry.
//!
//! Accepts signed manifests, checks them against live benchmark probes and
//! keeps a cached risk score per node. Verification failures never make the
//! registry itself fail; they only shrink the set of selectable nodes.
//!
//! The first accepted manifest pins the node's identity key: later manifests
//! for the same node must be signed by the same issuer.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use fabric::{
    Envelope, LocalRiskScorer, MessageBus, NodeId, RiskContext, RiskScorer, SigningService, Topic,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::manifest::NodeCapabilityManifest;
use crate::traits::BenchmarkProbe;
use crate::RegistryError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Variance above this percentage marks a capability degraded.
    pub degraded_variance_pct: f64,
    /// Variance above this percentage marks a capability failed.
    pub failed_variance_pct: f64,
    /// Penalty applied per anomaly when the risk service is unavailable.
    pub local_penalty_per_anomaly: f64,
    /// Risk assumed for nodes that have never been benchmarked.
    pub unverified_risk_score: f64,
    /// How often a worker reports its load.
    pub heartbeat_interval_ms: u64,
    /// Workers silent for longer are not selected.
    pub stale_after_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            degraded_variance_pct: 20.0,
            failed_variance_pct: 50.0,
            local_penalty_per_anomaly: 0.25,
            unverified_risk_score: 0.5,
            heartbeat_interval_ms: 10_000,
            stale_after_ms: 60_000,
        }
    }
}

impl RegistryConfig {
    pub fn heartbeat_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.stale_after_ms as i64)
    }
}

// ---------------------------------------------------------------------------
// Verification results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityStatus {
    Verified,
    Degraded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityCheck {
    pub capability: String,
    pub declared: f64,
    /// `None` when the probe itself failed.
    pub measured: Option<f64>,
    pub variance_pct: f64,
    pub status: CapabilityStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    /// Every capability verified.
    Verified,
    /// Some capabilities degraded, none failed.
    Partial,
    /// Some, but not all, capabilities failed.
    Anomaly,
    /// Every capability failed.
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityVerification {
    pub node_id: NodeId,
    pub manifest_id: Option<Uuid>,
    pub checks: Vec<CapabilityCheck>,
    pub anomalies: Vec<String>,
    pub status: VerificationStatus,
    pub risk_score: f64,
    pub verified_at: DateTime<Utc>,
}

impl CapabilityVerification {
    pub fn check(&self, capability: &str) -> Option<&CapabilityCheck> {
        self.checks.iter().find(|c| c.capability == capability)
    }
}

/// Percentage deviation of `measured` from `declared`.
pub fn variance_pct(declared: f64, measured: f64) -> f64 {
    if declared.abs() < f64::EPSILON {
        return if measured.abs() < f64::EPSILON { 0.0 } else { 100.0 };
    }
    ((declared - measured).abs() / declared.abs()) * 100.0
}

fn aggregate(checks: &[CapabilityCheck]) -> VerificationStatus {
    let failed = checks
        .iter()
        .filter(|c| c.status == CapabilityStatus::Failed)
        .count();
    let degraded = checks
        .iter()
        .filter(|c| c.status == CapabilityStatus::Degraded)
        .count();

    if failed == 0 && degraded == 0 {
        VerificationStatus::Verified
    } else if failed == 0 {
        VerificationStatus::Partial
    } else if failed == checks.len() {
        VerificationStatus::Failed
    } else {
        VerificationStatus::Anomaly
    }
}

// ---------------------------------------------------------------------------
// Selection
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifiedSelectionCriteria {
    pub required_capabilities: Vec<String>,
    pub min_compliance_level: u8,
    /// Candidates with a higher risk score are dropped.
    pub max_risk_score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiedCandidate {
    pub node_id: NodeId,
    pub risk_score: f64,
    pub status: Option<VerificationStatus>,
}

// ---------------------------------------------------------------------------
// CapabilityRegistry
// ---------------------------------------------------------------------------

pub struct CapabilityRegistry {
    node_id: NodeId,
    config: RegistryConfig,
    signer: Arc<dyn SigningService>,
    probe: Arc<dyn BenchmarkProbe>,
    risk: Arc<dyn RiskScorer>,
    fallback: LocalRiskScorer,
    bus: Option<Arc<dyn MessageBus>>,
    manifests: DashMap<NodeId, NodeCapabilityManifest>,
    verifications: DashMap<NodeId, CapabilityVerification>,
    /// Issuer key pinned by each node's first accepted manifest.
    node_keys: DashMap<NodeId, String>,
}

impl CapabilityRegistry {
    pub fn new(
        node_id: NodeId,
        config: RegistryConfig,
        signer: Arc<dyn SigningService>,
        probe: Arc<dyn BenchmarkProbe>,
        risk: Arc<dyn RiskScorer>,
    ) -> Self {
        let fallback = LocalRiskScorer {
            penalty_per_anomaly: config.local_penalty_per_anomaly,
        };
        Self {
            node_id,
            config,
            signer,
            probe,
            risk,
            fallback,
            bus: None,
            manifests: DashMap::new(),
            verifications: DashMap::new(),
            node_keys: DashMap::new(),
        }
    }

    /// Announce registrations on the node-discovery topic.
    pub fn with_bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub async fn register_capability_manifest(
        &self,
        manifest: NodeCapabilityManifest,
    ) -> Result<NodeCapabilityManifest, RegistryError> {
        self.register_capability_manifest_at(manifest, Utc::now()).await
    }

    /// Validate, attest and store a manifest. A re-registration by the same
    /// issuer replaces the node's previous manifest and drops its cached
    /// verification.
    #[instrument(skip(self, manifest), fields(node_id = %manifest.node_id))]
    pub async fn register_capability_manifest_at(
        &self,
        mut manifest: NodeCapabilityManifest,
        now: DateTime<Utc>,
    ) -> Result<NodeCapabilityManifest, RegistryError> {
        let node_id = manifest.node_id.clone();

        if manifest.is_expired(now) {
            warn!("rejecting expired manifest");
            return Err(RegistryError::ManifestExpired(node_id));
        }
        if manifest.signature.is_none() {
            warn!("rejecting unsigned manifest");
            return Err(RegistryError::ManifestUnsigned(node_id));
        }
        if !manifest.verify_issuer_signature() {
            warn!(issuer = %manifest.issuer, "manifest signature does not verify");
            return Err(RegistryError::InvalidSignature(node_id));
        }
        match self.node_keys.entry(node_id.clone()) {
            Entry::Occupied(pinned) if pinned.get() != &manifest.issuer => {
                warn!(issuer = %manifest.issuer, pinned = %pinned.get(), "manifest issuer does not match pinned key");
                return Err(RegistryError::IssuerMismatch {
                    node_id,
                    issuer: manifest.issuer.clone(),
                });
            }
            Entry::Occupied(_) => {}
            Entry::Vacant(slot) => {
                debug!(issuer = %manifest.issuer, "node key pinned");
                slot.insert(manifest.issuer.clone());
            }
        }

        manifest.manifest_id = Some(Uuid::new_v4());
        manifest.attest(self.signer.as_ref())?;
        if !manifest.verify_attestation(&self.signer.public_key()) {
            return Err(RegistryError::InvalidSignature(node_id));
        }

        self.manifests.insert(node_id.clone(), manifest.clone());
        self.verifications.remove(&node_id);
        info!(
            manifest_id = ?manifest.manifest_id,
            capabilities = manifest.capabilities.len(),
            "capability manifest registered"
        );

        if let Some(bus) = &self.bus {
            let envelope = Envelope::with_payload(Topic::NodeDiscovery, self.node_id.clone(), &manifest)?
                .signed(self.signer.as_ref())?;
            bus.publish(envelope).await?;
        }

        Ok(manifest)
    }

    /// The identity key pinned for `node_id`. Survives revocation.
    pub fn node_key(&self, node_id: &NodeId) -> Option<String> {
        self.node_keys.get(node_id).map(|k| k.clone())
    }

    pub fn revoke_manifest(&self, node_id: &NodeId) -> Option<NodeCapabilityManifest> {
        self.verifications.remove(node_id);
        self.manifests.remove(node_id).map(|(_, m)| m)
    }

    /// Benchmark every declared capability and cache the outcome.
    #[instrument(skip(self), fields(node_id = %node_id))]
    pub async fn verify_node_capabilities(
        &self,
        node_id: &NodeId,
    ) -> Result<CapabilityVerification, RegistryError> {
        let manifest = self
            .manifests
            .get(node_id)
            .map(|m| m.clone())
            .ok_or_else(|| RegistryError::NodeNotFound(node_id.clone()))?;

        let mut checks = Vec::with_capacity(manifest.capabilities.len());
        for capability in &manifest.capabilities {
            let check = match self.probe.measure(node_id, capability).await {
                Ok(measured) => {
                    let variance = variance_pct(capability.declared_performance, measured);
                    CapabilityCheck {
                        capability: capability.name.clone(),
                        declared: capability.declared_performance,
                        measured: Some(measured),
                        variance_pct: variance,
                        status: self.classify(variance),
                    }
                }
                Err(e) => {
                    warn!(capability = %capability.name, error = %e, "benchmark probe failed");
                    CapabilityCheck {
                        capability: capability.name.clone(),
                        declared: capability.declared_performance,
                        measured: None,
                        variance_pct: 100.0,
                        status: CapabilityStatus::Failed,
                    }
                }
            };
            debug!(
                capability = %check.capability,
                variance_pct = check.variance_pct,
                status = ?check.status,
                "capability checked"
            );
            checks.push(check);
        }

        let anomalies: Vec<String> = checks
            .iter()
            .filter(|c| c.status != CapabilityStatus::Verified)
            .map(|c| c.capability.clone())
            .collect();
        let status = aggregate(&checks);

        let risk_score = if anomalies.is_empty() {
            0.0
        } else {
            let context = RiskContext {
                node_id: node_id.clone(),
                anomalies: anomalies.clone(),
                max_variance_pct: checks.iter().map(|c| c.variance_pct).fold(0.0, f64::max),
                capabilities_checked: checks.len(),
            };
            match self.risk.assess_risk(&context).await {
                Ok(score) => score.clamp(0.0, 1.0),
                Err(e) => {
                    warn!(error = %e, "risk service unavailable, using local penalty");
                    self.fallback.score(&context)
                }
            }
        };

        let verification = CapabilityVerification {
            node_id: node_id.clone(),
            manifest_id: manifest.manifest_id,
            checks,
            anomalies,
            status,
            risk_score,
            verified_at: Utc::now(),
        };

        if verification.status == VerificationStatus::Verified {
            info!(risk_score, "capabilities verified");
        } else {
            warn!(
                status = ?verification.status,
                anomalies = ?verification.anomalies,
                risk_score,
                "capability anomalies detected"
            );
        }

        self.verifications.insert(node_id.clone(), verification.clone());
        Ok(verification)
    }

    fn classify(&self, variance: f64) -> CapabilityStatus {
        if variance > self.config.failed_variance_pct {
            CapabilityStatus::Failed
        } else if variance > self.config.degraded_variance_pct {
            CapabilityStatus::Degraded
        } else {
            CapabilityStatus::Verified
        }
    }

    pub fn manifest(&self, node_id: &NodeId) -> Option<NodeCapabilityManifest> {
        self.manifests.get(node_id).map(|m| m.clone())
    }

    pub fn verification(&self, node_id: &NodeId) -> Option<CapabilityVerification> {
        self.verifications.get(node_id).map(|v| v.clone())
    }

    /// Cached risk score, or the configured default for unverified nodes.
    pub fn risk_score(&self, node_id: &NodeId) -> f64 {
        self.verifications
            .get(node_id)
            .map(|v| v.risk_score)
            .unwrap_or(self.config.unverified_risk_score)
    }

    /// Whether `node_id` holds a live manifest declaring every capability in
    /// `required`, none of which failed its most recent verification.
    pub fn has_capabilities(&self, node_id: &NodeId, required: &[String], now: DateTime<Utc>) -> bool {
        let Some(manifest) = self.manifests.get(node_id) else {
            return false;
        };
        if !manifest.is_valid_at(now) {
            return false;
        }
        let verification = self.verifications.get(node_id);
        if verification
            .as_ref()
            .is_some_and(|v| v.status == VerificationStatus::Failed)
        {
            return false;
        }
        required.iter().all(|name| {
            manifest.capability(name).is_some()
                && !verification.as_ref().is_some_and(|v| {
                    v.check(name)
                        .is_some_and(|c| c.status == CapabilityStatus::Failed)
                })
        })
    }

    pub fn select_verified_nodes(&self, criteria: &VerifiedSelectionCriteria) -> Vec<VerifiedCandidate> {
        self.select_verified_nodes_at(criteria, Utc::now())
    }

    /// Eligible nodes ordered by ascending risk score.
    pub fn select_verified_nodes_at(
        &self,
        criteria: &VerifiedSelectionCriteria,
        now: DateTime<Utc>,
    ) -> Vec<VerifiedCandidate> {
        let mut candidates: Vec<VerifiedCandidate> = self
            .manifests
            .iter()
            .filter(|m| m.compliance_level >= criteria.min_compliance_level)
            .filter(|m| self.has_capabilities(&m.node_id, &criteria.required_capabilities, now))
            .filter_map(|m| {
                let risk_score = self.risk_score(&m.node_id);
                if criteria.max_risk_score.is_some_and(|max| risk_score > max) {
                    return None;
                }
                Some(VerifiedCandidate {
                    node_id: m.node_id.clone(),
                    risk_score,
                    status: self.verifications.get(&m.node_id).map(|v| v.status),
                })
            })
            .collect();

        candidates.sort_by(|a, b| {
            a.risk_score
                .total_cmp(&b.risk_score)
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        candidates
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self.manifests.iter().map(|m| m.node_id.clone()).collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Capability;
    use crate::mock::MockProbe;
    use async_trait::async_trait;
    use chrono::Duration;
    use fabric::{Ed25519Signer, FabricError, LocalBus};

    struct UnavailableRisk;

    #[async_trait]
    impl RiskScorer for UnavailableRisk {
        async fn assess_risk(&self, _context: &RiskContext) -> Result<f64, FabricError> {
            Err(FabricError::RiskUnavailable("offline".into()))
        }
    }

    fn registry(probe: MockProbe) -> CapabilityRegistry {
        CapabilityRegistry::new(
            NodeId::from("registry"),
            RegistryConfig::default(),
            Arc::new(Ed25519Signer::from_seed([9u8; 32])),
            Arc::new(probe),
            Arc::new(UnavailableRisk),
        )
    }

    fn signed_manifest(node: &str, caps: &[(&str, f64)], seed: u8) -> NodeCapabilityManifest {
        let now = Utc::now();
        let mut m = NodeCapabilityManifest::new(
            NodeId::from(node),
            caps.iter().map(|(n, p)| Capability::new(*n, *p)).collect(),
            now - Duration::minutes(5),
            now + Duration::hours(1),
        );
        m.compliance_level = 2;
        m.signed(&Ed25519Signer::from_seed([seed; 32])).unwrap()
    }

    #[test]
    fn variance_is_relative_to_declared() {
        assert!((variance_pct(100.0, 75.0) - 25.0).abs() < 1e-9);
        assert!((variance_pct(100.0, 160.0) - 60.0).abs() < 1e-9);
        assert_eq!(variance_pct(0.0, 0.0), 0.0);
    }

    #[tokio::test]
    async fn registration_assigns_id_and_attests() {
        let reg = registry(MockProbe::default());
        let stored = reg
            .register_capability_manifest(signed_manifest("a", &[("cpu", 10.0)], 1))
            .await
            .unwrap();
        assert!(stored.manifest_id.is_some());
        assert!(stored.verify_attestation(&reg.signer.public_key()));
        assert!(reg.manifest(&NodeId::from("a")).is_some());
    }

    #[tokio::test]
    async fn expired_and_unsigned_manifests_are_rejected() {
        let reg = registry(MockProbe::default());

        let mut unsigned = signed_manifest("a", &[("cpu", 10.0)], 1);
        unsigned.signature = None;
        assert!(matches!(
            reg.register_capability_manifest(unsigned).await,
            Err(RegistryError::ManifestUnsigned(_))
        ));

        let m = signed_manifest("b", &[("cpu", 10.0)], 2);
        let later = m.valid_until + Duration::seconds(1);
        assert!(matches!(
            reg.register_capability_manifest_at(m, later).await,
            Err(RegistryError::ManifestExpired(_))
        ));
    }

    #[tokio::test]
    async fn tampered_manifest_is_rejected() {
        let reg = registry(MockProbe::default());
        let mut m = signed_manifest("a", &[("cpu", 10.0)], 1);
        m.compliance_level = 5;
        assert!(matches!(
            reg.register_capability_manifest(m).await,
            Err(RegistryError::InvalidSignature(_))
        ));
    }

    #[tokio::test]
    async fn manifest_from_another_issuer_cannot_replace_a_node() {
        let reg = registry(MockProbe::default());
        let owner = Ed25519Signer::from_seed([1u8; 32]);
        reg.register_capability_manifest(signed_manifest("a", &[("cpu", 10.0)], 1))
            .await
            .unwrap();
        assert_eq!(reg.node_key(&NodeId::from("a")), Some(owner.public_key()));

        let hijack = signed_manifest("a", &[("cpu", 10_000.0)], 66);
        assert!(matches!(
            reg.register_capability_manifest(hijack).await,
            Err(RegistryError::IssuerMismatch { .. })
        ));
        let kept = reg.manifest(&NodeId::from("a")).unwrap();
        assert_eq!(kept.capability("cpu").unwrap().declared_performance, 10.0);

        // The owner may still update its own manifest, even after revocation.
        reg.revoke_manifest(&NodeId::from("a"));
        let update = signed_manifest("a", &[("cpu", 20.0)], 1);
        reg.register_capability_manifest(update).await.unwrap();
        assert!(matches!(
            reg.register_capability_manifest(signed_manifest("a", &[("cpu", 1.0)], 66))
                .await,
            Err(RegistryError::IssuerMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn registration_is_announced() {
        let bus = Arc::new(LocalBus::new());
        let mut rx = bus.subscribe(Topic::NodeDiscovery).await;
        let reg = registry(MockProbe::default()).with_bus(bus.clone());
        reg.register_capability_manifest(signed_manifest("a", &[("cpu", 10.0)], 1))
            .await
            .unwrap();
        let env = rx.recv().await.unwrap();
        assert!(env.verify());
        let announced: NodeCapabilityManifest = env.decode().unwrap();
        assert_eq!(announced.node_id, NodeId::from("a"));
    }

    #[tokio::test]
    async fn verification_classifies_by_variance() {
        let probe = MockProbe::default()
            .with("a", "cpu", 95.0) // 5% -> verified
            .with("a", "gpu", 70.0) // 30% -> degraded
            .with("a", "disk", 40.0); // 60% -> failed
        let reg = registry(probe);
        reg.register_capability_manifest(signed_manifest(
            "a",
            &[("cpu", 100.0), ("gpu", 100.0), ("disk", 100.0)],
            1,
        ))
        .await
        .unwrap();

        let v = reg.verify_node_capabilities(&NodeId::from("a")).await.unwrap();
        assert_eq!(v.check("cpu").unwrap().status, CapabilityStatus::Verified);
        assert_eq!(v.check("gpu").unwrap().status, CapabilityStatus::Degraded);
        assert_eq!(v.check("disk").unwrap().status, CapabilityStatus::Failed);
        assert_eq!(v.status, VerificationStatus::Anomaly);
        // Risk service is down: two anomalies at the 0.25 local penalty.
        assert!((v.risk_score - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn aggregate_status_rules() {
        let probe = MockProbe::default()
            .with("ok", "cpu", 100.0)
            .with("partial", "cpu", 75.0)
            .with("dead", "cpu", 10.0);
        let reg = registry(probe);
        for (node, seed) in [("ok", 1), ("partial", 2), ("dead", 3)] {
            reg.register_capability_manifest(signed_manifest(node, &[("cpu", 100.0)], seed))
                .await
                .unwrap();
        }

        for (node, expected) in [
            ("ok", VerificationStatus::Verified),
            ("partial", VerificationStatus::Partial),
            ("dead", VerificationStatus::Failed),
        ] {
            let v = reg.verify_node_capabilities(&NodeId::from(node)).await.unwrap();
            assert_eq!(v.status, expected, "node {node}");
        }
    }

    #[tokio::test]
    async fn selection_filters_and_orders_by_risk() {
        let probe = MockProbe::default()
            .with("clean", "cpu", 100.0)
            .with("shaky", "cpu", 70.0)
            .with("broken", "cpu", 10.0)
            .with("liar", "cpu", 100.0)
            .with("liar", "gpu", 1.0);
        let reg = registry(probe);
        reg.register_capability_manifest(signed_manifest("clean", &[("cpu", 100.0)], 1))
            .await
            .unwrap();
        reg.register_capability_manifest(signed_manifest("shaky", &[("cpu", 100.0)], 2))
            .await
            .unwrap();
        reg.register_capability_manifest(signed_manifest("broken", &[("cpu", 100.0)], 3))
            .await
            .unwrap();
        reg.register_capability_manifest(signed_manifest(
            "liar",
            &[("cpu", 100.0), ("gpu", 100.0)],
            4,
        ))
        .await
        .unwrap();
        for n in ["clean", "shaky", "broken", "liar"] {
            reg.verify_node_capabilities(&NodeId::from(n)).await.unwrap();
        }

        let cpu = VerifiedSelectionCriteria {
            required_capabilities: vec!["cpu".into()],
            min_compliance_level: 1,
            max_risk_score: None,
        };
        let ids: Vec<String> = reg
            .select_verified_nodes(&cpu)
            .into_iter()
            .map(|c| c.node_id.0)
            .collect();
        // "broken" failed every capability; "shaky" and "liar" carry one anomaly each.
        assert_eq!(ids, vec!["clean", "liar", "shaky"]);

        let gpu = VerifiedSelectionCriteria {
            required_capabilities: vec!["gpu".into()],
            ..cpu.clone()
        };
        assert!(reg.select_verified_nodes(&gpu).is_empty());

        let strict = VerifiedSelectionCriteria {
            max_risk_score: Some(0.1),
            ..cpu.clone()
        };
        assert_eq!(reg.select_verified_nodes(&strict).len(), 1);

        let compliance = VerifiedSelectionCriteria {
            min_compliance_level: 3,
            ..cpu
        };
        assert!(reg.select_verified_nodes(&compliance).is_empty());
    }

    #[tokio::test]
    async fn expired_manifest_is_not_selectable() {
        let reg = registry(MockProbe::default());
        let m = signed_manifest("a", &[("cpu", 10.0)], 1);
        let after_expiry = m.valid_until + Duration::minutes(1);
        reg.register_capability_manifest(m).await.unwrap();
        let criteria = VerifiedSelectionCriteria::default();
        assert_eq!(reg.select_verified_nodes(&criteria).len(), 1);
        assert!(reg.select_verified_nodes_at(&criteria, after_expiry).is_empty());
    }
}
