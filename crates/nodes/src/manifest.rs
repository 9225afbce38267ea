//! Signed node capability manifests.
//!
//! A node signs its own manifest (the signer becomes the `issuer`). The
//! registry later assigns a `manifest_id` and countersigns the whole manifest,
//! id included, as an attestation.

use chrono::{DateTime, Utc};
use fabric::{verify_signature, FabricError, NodeId, Signature, SigningService};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One advertised ability, e.g. `gpu-inference` at 120 (ops/s).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
    pub declared_performance: f64,
    #[serde(default)]
    pub unit: String,
}

impl Capability {
    pub fn new(name: impl Into<String>, declared_performance: f64) -> Self {
        Self {
            name: name.into(),
            declared_performance,
            unit: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeclaredResources {
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub gpu_count: u32,
    pub storage_gb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeCapabilityManifest {
    /// Assigned by the registry on registration.
    pub manifest_id: Option<Uuid>,
    pub node_id: NodeId,
    pub capabilities: Vec<Capability>,
    pub resources: DeclaredResources,
    pub compliance_level: u8,
    pub region: Option<String>,
    #[serde(default)]
    pub dao_subnets: Vec<String>,
    /// Hex verifying key of the signer.
    pub issuer: String,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub signature: Option<Signature>,
    /// Registry countersignature over the manifest including its id.
    pub attestation: Option<Signature>,
}

/// Fields covered by the issuer signature.
#[derive(Serialize)]
struct IssuerFields<'a> {
    node_id: &'a NodeId,
    capabilities: &'a [Capability],
    resources: &'a DeclaredResources,
    compliance_level: u8,
    region: &'a Option<String>,
    dao_subnets: &'a [String],
    issuer: &'a str,
    valid_from: &'a DateTime<Utc>,
    valid_until: &'a DateTime<Utc>,
}

/// Fields covered by the registry attestation.
#[derive(Serialize)]
struct AttestedFields<'a> {
    manifest_id: &'a Option<Uuid>,
    issuer_fields: IssuerFields<'a>,
    signature: &'a Option<Signature>,
}

impl NodeCapabilityManifest {
    pub fn new(
        node_id: NodeId,
        capabilities: Vec<Capability>,
        valid_from: DateTime<Utc>,
        valid_until: DateTime<Utc>,
    ) -> Self {
        Self {
            manifest_id: None,
            node_id,
            capabilities,
            resources: DeclaredResources::default(),
            compliance_level: 0,
            region: None,
            dao_subnets: Vec::new(),
            issuer: String::new(),
            valid_from,
            valid_until,
            signature: None,
            attestation: None,
        }
    }

    fn issuer_fields(&self) -> IssuerFields<'_> {
        IssuerFields {
            node_id: &self.node_id,
            capabilities: &self.capabilities,
            resources: &self.resources,
            compliance_level: self.compliance_level,
            region: &self.region,
            dao_subnets: &self.dao_subnets,
            issuer: &self.issuer,
            valid_from: &self.valid_from,
            valid_until: &self.valid_until,
        }
    }

    pub fn signing_bytes(&self) -> Result<Vec<u8>, FabricError> {
        Ok(serde_json::to_vec(&self.issuer_fields())?)
    }

    fn attested_bytes(&self) -> Result<Vec<u8>, FabricError> {
        let fields = AttestedFields {
            manifest_id: &self.manifest_id,
            issuer_fields: self.issuer_fields(),
            signature: &self.signature,
        };
        Ok(serde_json::to_vec(&fields)?)
    }

    /// Sign as issuer. Sets `issuer` to the signer's key first so the key is
    /// covered by the signature.
    pub fn signed(mut self, signer: &dyn SigningService) -> Result<Self, FabricError> {
        self.issuer = signer.public_key();
        let bytes = self.signing_bytes()?;
        self.signature = Some(signer.sign(&bytes));
        Ok(self)
    }

    /// True when the signature exists, was made by `issuer` and covers the
    /// current field values.
    pub fn verify_issuer_signature(&self) -> bool {
        let Some(sig) = &self.signature else {
            return false;
        };
        if sig.public_key != self.issuer {
            return false;
        }
        match self.signing_bytes() {
            Ok(bytes) => verify_signature(&bytes, sig),
            Err(_) => false,
        }
    }

    pub(crate) fn attest(&mut self, registry: &dyn SigningService) -> Result<(), FabricError> {
        let bytes = self.attested_bytes()?;
        self.attestation = Some(registry.sign(&bytes));
        Ok(())
    }

    pub fn verify_attestation(&self, registry_key: &str) -> bool {
        let Some(att) = &self.attestation else {
            return false;
        };
        if att.public_key != registry_key {
            return false;
        }
        match self.attested_bytes() {
            Ok(bytes) => verify_signature(&bytes, att),
            Err(_) => false,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.valid_until
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.valid_from && now < self.valid_until
    }

    pub fn capability(&self, name: &str) -> Option<&Capability> {
        self.capabilities.iter().find(|c| c.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use fabric::Ed25519Signer;

    fn manifest() -> NodeCapabilityManifest {
        let now = Utc::now();
        NodeCapabilityManifest::new(
            NodeId::from("node-a"),
            vec![Capability::new("transcode", 100.0)],
            now - Duration::minutes(1),
            now + Duration::hours(1),
        )
    }

    #[test]
    fn issuer_signature_covers_capabilities() {
        let signer = Ed25519Signer::from_seed([1u8; 32]);
        let signed = manifest().signed(&signer).unwrap();
        assert_eq!(signed.issuer, signer.public_key());
        assert!(signed.verify_issuer_signature());

        let mut inflated = signed.clone();
        inflated.capabilities[0].declared_performance = 1_000.0;
        assert!(!inflated.verify_issuer_signature());
    }

    #[test]
    fn signature_from_other_key_is_rejected() {
        let signer = Ed25519Signer::from_seed([1u8; 32]);
        let other = Ed25519Signer::from_seed([2u8; 32]);
        let mut signed = manifest().signed(&signer).unwrap();
        signed.issuer = other.public_key();
        assert!(!signed.verify_issuer_signature());
    }

    #[test]
    fn validity_window() {
        let m = manifest();
        assert!(m.is_valid_at(Utc::now()));
        assert!(m.is_expired(Utc::now() + Duration::hours(2)));
    }
}
