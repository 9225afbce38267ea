//! CRDT State Synchronizer service.
//!
//! Owns one [`CrdtDocument`] per execution behind an async mutex, so writes
//! to a document are serialized within this node. Local operations are
//! broadcast on the state-sync topic; batches from other nodes are merged.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use fabric::{BlobStore, ContentHash, Envelope, MessageBus, NodeId, SigningService, Topic};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::document::{
    CompactionRecord, ConflictResolution, CrdtDocument, CrdtSnapshot, MergeReport,
};
use super::operation::{CrdtOperation, OperationSpec};
use super::CrdtConfig;
use crate::EngineError;

/// Payload published on [`Topic::StateSync`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSyncMessage {
    pub execution_id: Uuid,
    pub operations: Vec<CrdtOperation>,
}

type Document = Arc<Mutex<CrdtDocument>>;

pub struct CrdtSynchronizer {
    node_id: NodeId,
    config: CrdtConfig,
    blobs: Arc<dyn BlobStore>,
    bus: Option<(Arc<dyn MessageBus>, Arc<dyn SigningService>)>,
    documents: DashMap<Uuid, Document>,
    /// Signing key first seen for each peer; later batches must match it.
    peer_keys: DashMap<NodeId, String>,
}

impl CrdtSynchronizer {
    pub fn new(node_id: NodeId, config: CrdtConfig, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            node_id,
            config,
            blobs,
            bus: None,
            documents: DashMap::new(),
            peer_keys: DashMap::new(),
        }
    }

    /// Broadcast local operations on `bus`, signed with `signer`.
    pub fn with_bus(mut self, bus: Arc<dyn MessageBus>, signer: Arc<dyn SigningService>) -> Self {
        self.bus = Some((bus, signer));
        self
    }

    pub fn config(&self) -> &CrdtConfig {
        &self.config
    }

    fn document(&self, execution_id: Uuid, now: DateTime<Utc>) -> Document {
        self.documents
            .entry(execution_id)
            .or_insert_with(|| {
                let doc = CrdtDocument::new(execution_id, now)
                    .with_deferred_limit(self.config.max_deferred_ops);
                Arc::new(Mutex::new(doc))
            })
            .clone()
    }

    fn existing(&self, execution_id: Uuid) -> Result<Document, EngineError> {
        self.documents
            .get(&execution_id)
            .map(|d| d.clone())
            .ok_or(EngineError::ExecutionNotFound(execution_id))
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    pub async fn apply_operation(
        &self,
        execution_id: Uuid,
        spec: OperationSpec,
    ) -> Result<CrdtOperation, EngineError> {
        self.apply_operation_at(execution_id, spec, Utc::now()).await
    }

    /// Stamp, apply and broadcast a local mutation.
    #[instrument(skip(self, spec), fields(node_id = %self.node_id, path = %spec.path, kind = ?spec.kind))]
    pub async fn apply_operation_at(
        &self,
        execution_id: Uuid,
        spec: OperationSpec,
        now: DateTime<Utc>,
    ) -> Result<CrdtOperation, EngineError> {
        let doc = self.document(execution_id, now);
        let op = {
            let mut doc = doc.lock().await;
            let (op, report) = doc.apply_local(&self.node_id, spec, now);
            if report.conflicts > 0 {
                debug!(conflicts = report.conflicts, "local operation resolved conflicts");
            }
            op
        };

        self.broadcast(StateSyncMessage {
            execution_id,
            operations: vec![op.clone()],
        })
        .await;
        Ok(op)
    }

    pub async fn merge_concurrent_updates(
        &self,
        execution_id: Uuid,
        operations: Vec<CrdtOperation>,
    ) -> MergeReport {
        self.merge_concurrent_updates_at(execution_id, operations, Utc::now())
            .await
    }

    /// Merge a remote batch: dedupe by operation id, buffer operations with
    /// missing dependencies, merge clocks and recompute.
    #[instrument(skip(self, operations), fields(node_id = %self.node_id, batch = operations.len()))]
    pub async fn merge_concurrent_updates_at(
        &self,
        execution_id: Uuid,
        operations: Vec<CrdtOperation>,
        now: DateTime<Utc>,
    ) -> MergeReport {
        let doc = self.document(execution_id, now);
        let mut doc = doc.lock().await;
        let report = doc.merge(operations, now);
        debug!(
            applied = report.applied,
            duplicates = report.duplicates,
            deferred = report.deferred,
            conflicts = report.conflicts,
            "remote batch merged"
        );
        report
    }

    // -----------------------------------------------------------------------
    // Reading
    // -----------------------------------------------------------------------

    pub async fn state(&self, execution_id: Uuid) -> Option<Value> {
        let doc = self.existing(execution_id).ok()?;
        let doc = doc.lock().await;
        Some(doc.state().clone())
    }

    /// Hash of the visible state, for convergence checks across replicas.
    pub async fn state_hash(&self, execution_id: Uuid) -> Result<ContentHash, EngineError> {
        let doc = self.existing(execution_id)?;
        let doc = doc.lock().await;
        Ok(doc.state_hash()?)
    }

    pub async fn conflicts(&self, execution_id: Uuid) -> Vec<ConflictResolution> {
        let Ok(doc) = self.existing(execution_id) else {
            return Vec::new();
        };
        let doc = doc.lock().await;
        doc.conflicts().to_vec()
    }

    pub async fn compactions(&self, execution_id: Uuid) -> Vec<CompactionRecord> {
        let Ok(doc) = self.existing(execution_id) else {
            return Vec::new();
        };
        let doc = doc.lock().await;
        doc.compactions().to_vec()
    }

    pub async fn operation_count(&self, execution_id: Uuid) -> usize {
        let Ok(doc) = self.existing(execution_id) else {
            return 0;
        };
        let doc = doc.lock().await;
        doc.operations().len()
    }

    // -----------------------------------------------------------------------
    // Compaction
    // -----------------------------------------------------------------------

    pub async fn compact_state(&self, execution_id: Uuid) -> Result<CompactionRecord, EngineError> {
        self.compact_state_at(execution_id, Utc::now()).await
    }

    /// Fold history into a new base, persist the snapshot and record it.
    #[instrument(skip(self), fields(node_id = %self.node_id))]
    pub async fn compact_state_at(
        &self,
        execution_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<CompactionRecord, EngineError> {
        let doc = self.existing(execution_id)?;
        let mut doc = doc.lock().await;

        let operations_before = doc.operations().len();
        let snapshot = doc.compact(self.config.retain_operations, now);
        let snapshot_hash = self.blobs.put(serde_json::to_vec(&snapshot)?).await?;

        let record = CompactionRecord {
            execution_id,
            operations_before,
            operations_after: doc.operations().len(),
            snapshot_hash,
            compacted_at: now,
        };
        doc.record_compaction(record.clone());
        info!(
            operations_before,
            operations_after = record.operations_after,
            snapshot = %snapshot_hash,
            "state compacted"
        );
        Ok(record)
    }

    /// Compact every document that crossed the size or age trigger.
    pub async fn run_compaction_pass(&self, now: DateTime<Utc>) -> Vec<CompactionRecord> {
        let documents: Vec<(Uuid, Document)> = self
            .documents
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut records = Vec::new();
        for (execution_id, doc) in documents {
            let due = doc.lock().await.needs_compaction(&self.config, now);
            if !due {
                continue;
            }
            match self.compact_state_at(execution_id, now).await {
                Ok(record) => records.push(record),
                Err(e) => warn!(%execution_id, error = %e, "compaction failed"),
            }
        }
        records
    }

    /// Replace an execution's document with a persisted snapshot.
    pub async fn restore_snapshot(
        &self,
        snapshot_hash: &ContentHash,
    ) -> Result<Uuid, EngineError> {
        let bytes = self.blobs.get(snapshot_hash).await?;
        let snapshot: CrdtSnapshot = serde_json::from_slice(&bytes)?;
        let execution_id = snapshot.execution_id;
        self.documents.insert(
            execution_id,
            Arc::new(Mutex::new(
                CrdtDocument::from_snapshot(snapshot).with_deferred_limit(self.config.max_deferred_ops),
            )),
        );
        info!(%execution_id, snapshot = %snapshot_hash, "state restored from snapshot");
        Ok(execution_id)
    }

    // -----------------------------------------------------------------------
    // Networking
    // -----------------------------------------------------------------------

    async fn broadcast(&self, message: StateSyncMessage) {
        let Some((bus, signer)) = &self.bus else {
            return;
        };
        let envelope = Envelope::with_payload(Topic::StateSync, self.node_id.clone(), &message)
            .and_then(|envelope| envelope.signed(signer.as_ref()));
        let envelope = match envelope {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "state-sync message not encoded");
                return;
            }
        };
        if let Err(e) = bus.publish(envelope).await {
            warn!(error = %e, "state-sync message not published");
        }
    }

    /// Merge a state-sync envelope from another node. Own broadcasts are
    /// ignored. The envelope must be signed, every operation must originate
    /// from the sender, and the sender must keep the key it first used.
    pub async fn handle_message(&self, envelope: &Envelope) -> Result<Option<MergeReport>, EngineError> {
        if envelope.sender == self.node_id {
            return Ok(None);
        }
        let key = match envelope.signer_key() {
            Some(key) if envelope.verify() => key.to_string(),
            _ => return Err(EngineError::UnauthenticatedSync(envelope.sender.clone())),
        };
        let message: StateSyncMessage = envelope.decode()?;
        if message.operations.iter().any(|op| op.node_id != envelope.sender) {
            return Err(EngineError::UnauthenticatedSync(envelope.sender.clone()));
        }
        match self.peer_keys.entry(envelope.sender.clone()) {
            Entry::Occupied(pinned) if *pinned.get() != key => {
                return Err(EngineError::UnauthenticatedSync(envelope.sender.clone()));
            }
            Entry::Occupied(_) => {}
            Entry::Vacant(slot) => {
                slot.insert(key);
            }
        }
        let report = self
            .merge_concurrent_updates(message.execution_id, message.operations)
            .await;
        Ok(Some(report))
    }

    pub async fn spawn_listener(self: Arc<Self>) -> Option<JoinHandle<()>> {
        let (bus, _) = self.bus.clone()?;
        let mut rx = bus.subscribe(Topic::StateSync).await;
        Some(tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if let Err(e) = self.handle_message(&envelope).await {
                    debug!(sender = %envelope.sender, error = %e, "state-sync message rejected");
                }
            }
        }))
    }

    /// Periodic size/age compaction trigger.
    pub fn spawn_compactor(self: Arc<Self>) -> JoinHandle<()> {
        let period = std::time::Duration::from_millis(self.config.compactor_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let compacted = self.run_compaction_pass(Utc::now()).await;
                if !compacted.is_empty() {
                    debug!(documents = compacted.len(), "compaction pass finished");
                }
            }
        })
    }
}
