//! Execution Ledger.
//!
//! One append-only hash chain per execution. Each record commits to its
//! predecessor's hash, carries a vector clock ticked for the node that did
//! the work, and is signed by the ledger owner. Payloads live in the blob
//! store; the record only holds their content hash.
//!
//! Integrity failures are reported as the first violation found and are never
//! repaired. Replay refuses to start on a chain that does not validate.
//!
//! A ledger configured with trusted signers only accepts records sealed by
//! its own key or one of those keys. Without them, any actor whose signature
//! verifies is accepted, so a chain re-sealed end to end still validates.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use db::DbPool;
use fabric::{
    verify_signature, BlobStore, ContentHash, FabricError, NodeId, SigningService, VectorClock,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::models::{ExecutionRecord, PartialRecord, RecordKind, ReplayState};
use crate::EngineError;

const RECORD_DOMAIN: &[u8] = b"execution-record-v1:";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Actor keys, besides the ledger's own, whose records are accepted.
    /// Empty accepts any actor whose signature verifies.
    pub trusted_signers: Vec<String>,
    /// Open replays untouched for this long are dropped.
    pub replay_idle_ttl_ms: u64,
    /// Open replays kept at once; the idlest is dropped to make room.
    pub max_open_replays: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            trusted_signers: Vec::new(),
            replay_idle_ttl_ms: 300_000,
            max_open_replays: 256,
        }
    }
}

impl LedgerConfig {
    pub fn replay_idle_ttl(&self) -> Duration {
        Duration::milliseconds(self.replay_idle_ttl_ms as i64)
    }
}

// ---------------------------------------------------------------------------
// Hashing & sealing
// ---------------------------------------------------------------------------

/// Fields covered by `record_hash`, in canonical order.
#[derive(Serialize)]
struct HashedFields<'a> {
    execution_id: &'a Uuid,
    seq: u64,
    step_id: &'a str,
    kind: &'a RecordKind,
    prev_hash: &'a ContentHash,
    payload_hash: &'a ContentHash,
    actor: &'a str,
    node_id: &'a NodeId,
    timestamp: &'a DateTime<Utc>,
    vector_clock: &'a VectorClock,
}

/// Recompute the hash of a record from its content fields.
pub fn compute_record_hash(record: &ExecutionRecord) -> Result<ContentHash, FabricError> {
    let fields = HashedFields {
        execution_id: &record.execution_id,
        seq: record.seq,
        step_id: &record.step_id,
        kind: &record.kind,
        prev_hash: &record.prev_hash,
        payload_hash: &record.payload_hash,
        actor: &record.actor,
        node_id: &record.node_id,
        timestamp: &record.timestamp,
        vector_clock: &record.vector_clock,
    };
    let mut bytes = RECORD_DOMAIN.to_vec();
    bytes.extend(serde_json::to_vec(&fields)?);
    Ok(ContentHash::of(&bytes))
}

/// Set `actor`, `record_hash` and `signature`. The signature covers the hash.
pub(crate) fn seal(record: &mut ExecutionRecord, signer: &dyn SigningService) -> Result<(), FabricError> {
    record.actor = signer.public_key();
    record.record_hash = compute_record_hash(record)?;
    record.signature = Some(signer.sign(record.record_hash.as_bytes()));
    Ok(())
}

// ---------------------------------------------------------------------------
// Chain validation
// ---------------------------------------------------------------------------

/// Incremental chain checker, shared by full validation and ingestion.
#[derive(Default)]
struct ChainCheck<'a> {
    prev: Option<ContentHash>,
    /// Clock of the latest record per acting node.
    last_by_node: HashMap<NodeId, VectorClock>,
    trusted: Option<&'a HashSet<String>>,
}

impl<'a> ChainCheck<'a> {
    fn new(trusted: Option<&'a HashSet<String>>) -> Self {
        Self {
            trusted,
            ..Self::default()
        }
    }

    /// Rebuild checker state from a chain already known to be valid.
    fn resume(records: &[ExecutionRecord], trusted: Option<&'a HashSet<String>>) -> Self {
        let mut check = Self::new(trusted);
        for record in records {
            check.advance(record);
        }
        check
    }

    fn advance(&mut self, record: &ExecutionRecord) {
        self.prev = Some(record.record_hash);
        self.last_by_node
            .insert(record.node_id.clone(), record.vector_clock.clone());
    }

    fn check(&mut self, index: usize, record: &ExecutionRecord) -> Result<(), EngineError> {
        if record.seq != index as u64 {
            return Err(EngineError::ChainBroken { index });
        }

        if compute_record_hash(record)? != record.record_hash {
            return Err(EngineError::HashMismatch { index });
        }

        match self.prev {
            None if !record.prev_hash.is_zero() => return Err(EngineError::InvalidGenesis),
            Some(prev) if prev != record.prev_hash => {
                return Err(EngineError::ChainBroken { index })
            }
            _ => {}
        }

        let signed_by_actor = record.signature.as_ref().is_some_and(|sig| {
            sig.public_key == record.actor && verify_signature(record.record_hash.as_bytes(), sig)
        });
        if !signed_by_actor {
            return Err(EngineError::InvalidSignature { index });
        }
        if self.trusted.is_some_and(|keys| !keys.contains(&record.actor)) {
            return Err(EngineError::UntrustedActor {
                index,
                actor: record.actor.clone(),
            });
        }

        if let Some(earlier) = self.last_by_node.get(&record.node_id) {
            let own = &record.node_id;
            if !record.vector_clock.dominates(earlier)
                || record.vector_clock.get(own) <= earlier.get(own)
            {
                return Err(EngineError::CausalityViolation {
                    index,
                    node_id: own.clone(),
                });
            }
        }

        self.advance(record);
        Ok(())
    }
}

/// Walk a chain and return the first integrity violation, if any. Only
/// self-consistency is checked: each record must be signed by its own actor.
pub fn validate_chain(records: &[ExecutionRecord]) -> Result<(), EngineError> {
    validate_chain_signed_by(records, None)
}

/// [`validate_chain`], additionally requiring every actor to be in `trusted`.
pub fn validate_chain_signed_by(
    records: &[ExecutionRecord],
    trusted: Option<&HashSet<String>>,
) -> Result<(), EngineError> {
    let mut check = ChainCheck::new(trusted);
    for (index, record) in records.iter().enumerate() {
        check.check(index, record)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Archive
// ---------------------------------------------------------------------------

/// Durable copy of ledger records.
#[async_trait]
pub trait LedgerArchive: Send + Sync {
    async fn archive(&self, record: &ExecutionRecord) -> Result<(), EngineError>;

    /// Archived chain of one execution, in sequence order.
    async fn load(&self, execution_id: Uuid) -> Result<Vec<ExecutionRecord>, EngineError>;
}

/// [`LedgerArchive`] over the `ledger_records` table.
#[derive(Clone)]
pub struct PgLedgerArchive {
    pool: DbPool,
}

impl PgLedgerArchive {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerArchive for PgLedgerArchive {
    async fn archive(&self, record: &ExecutionRecord) -> Result<(), EngineError> {
        db::repository::ledger::archive_record(
            &self.pool,
            &record.execution_id.to_string(),
            record.seq as i64,
            &record.record_hash.to_hex(),
            record.node_id.as_str(),
            serde_json::to_value(record)?,
        )
        .await?;
        Ok(())
    }

    async fn load(&self, execution_id: Uuid) -> Result<Vec<ExecutionRecord>, EngineError> {
        let rows = db::repository::ledger::load_records(&self.pool, &execution_id.to_string()).await?;
        rows.into_iter()
            .map(|row| serde_json::from_value(row.record).map_err(EngineError::from))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// ExecutionLedger
// ---------------------------------------------------------------------------

type Chain = Arc<Mutex<Vec<ExecutionRecord>>>;

struct Replay {
    state: ReplayState,
    /// Snapshot taken at `start_replay`; later appends are not replayed.
    records: Vec<ExecutionRecord>,
    touched_at: DateTime<Utc>,
}

pub struct ExecutionLedger {
    signer: Arc<dyn SigningService>,
    blobs: Arc<dyn BlobStore>,
    archive: Option<Arc<dyn LedgerArchive>>,
    config: LedgerConfig,
    /// Own key plus the configured signers; `None` when none are configured.
    trusted: Option<HashSet<String>>,
    chains: DashMap<Uuid, Chain>,
    replays: DashMap<Uuid, Replay>,
}

impl ExecutionLedger {
    pub fn new(signer: Arc<dyn SigningService>, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            signer,
            blobs,
            archive: None,
            config: LedgerConfig::default(),
            trusted: None,
            chains: DashMap::new(),
            replays: DashMap::new(),
        }
    }

    pub fn with_config(mut self, config: LedgerConfig) -> Self {
        self.trusted = (!config.trusted_signers.is_empty()).then(|| {
            let mut keys: HashSet<String> = config.trusted_signers.iter().cloned().collect();
            keys.insert(self.signer.public_key());
            keys
        });
        self.config = config;
        self
    }

    pub fn with_archive(mut self, archive: Arc<dyn LedgerArchive>) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    fn chain(&self, execution_id: Uuid) -> Chain {
        self.chains.entry(execution_id).or_default().clone()
    }

    fn existing_chain(&self, execution_id: Uuid) -> Result<Chain, EngineError> {
        self.chains
            .get(&execution_id)
            .map(|c| c.clone())
            .ok_or(EngineError::ExecutionNotFound(execution_id))
    }

    // -----------------------------------------------------------------------
    // Writing
    // -----------------------------------------------------------------------

    /// Append a record to the execution's chain and return it fully populated.
    #[instrument(skip(self, partial), fields(execution_id = %partial.execution_id, step_id = %partial.step_id))]
    pub async fn append_record(&self, partial: PartialRecord) -> Result<ExecutionRecord, EngineError> {
        let chain = self.chain(partial.execution_id);
        let mut records = chain.lock().await;

        let payload_hash = self.blobs.put(serde_json::to_vec(&partial.payload)?).await?;
        let (prev_hash, mut vector_clock) = match records.last() {
            Some(last) => (last.record_hash, last.vector_clock.clone()),
            None => (ContentHash::ZERO, VectorClock::new()),
        };
        vector_clock.tick(&partial.node_id);

        let mut record = ExecutionRecord {
            execution_id: partial.execution_id,
            seq: records.len() as u64,
            step_id: partial.step_id,
            kind: partial.kind,
            prev_hash,
            payload_hash,
            actor: String::new(),
            node_id: partial.node_id,
            timestamp: Utc::now(),
            vector_clock,
            record_hash: ContentHash::ZERO,
            signature: None,
        };
        seal(&mut record, self.signer.as_ref())?;
        records.push(record.clone());

        if let Some(archive) = &self.archive {
            if let Err(e) = archive.archive(&record).await {
                warn!(seq = record.seq, error = %e, "ledger record not archived");
            }
        }
        debug!(seq = record.seq, hash = %record.record_hash, kind = ?record.kind, "record appended");
        Ok(record)
    }

    /// Accept a record replicated from another node. It must extend the
    /// local chain exactly: next sequence number, matching link, valid hash,
    /// signature and clock.
    #[instrument(skip(self, record), fields(execution_id = %record.execution_id, seq = record.seq))]
    pub async fn ingest_record(&self, record: ExecutionRecord) -> Result<(), EngineError> {
        let chain = self.chain(record.execution_id);
        let mut records = chain.lock().await;

        let mut check = ChainCheck::resume(&records, self.trusted.as_ref());
        if let Err(e) = check.check(records.len(), &record) {
            warn!(error = %e, "replicated record rejected");
            return Err(e);
        }
        records.push(record);
        Ok(())
    }

    /// Load an execution's chain from the archive. The chain must validate;
    /// an execution already present in memory is left untouched.
    pub async fn restore(&self, execution_id: Uuid) -> Result<usize, EngineError> {
        let Some(archive) = &self.archive else {
            return Err(EngineError::ExecutionNotFound(execution_id));
        };
        let loaded = archive.load(execution_id).await?;
        if loaded.is_empty() {
            return Err(EngineError::ExecutionNotFound(execution_id));
        }
        validate_chain_signed_by(&loaded, self.trusted.as_ref()).map_err(|e| EngineError::LedgerInvalid {
            execution_id,
            reason: e.to_string(),
        })?;

        let chain = self.chain(execution_id);
        let mut records = chain.lock().await;
        if records.is_empty() {
            *records = loaded;
            info!(%execution_id, records = records.len(), "ledger restored from archive");
        }
        Ok(records.len())
    }

    // -----------------------------------------------------------------------
    // Reading
    // -----------------------------------------------------------------------

    pub async fn records(&self, execution_id: Uuid) -> Vec<ExecutionRecord> {
        let Some(chain) = self.chains.get(&execution_id).map(|c| c.clone()) else {
            return Vec::new();
        };
        let records = chain.lock().await;
        records.clone()
    }

    /// Hash of the latest record, or `None` for an unknown execution.
    pub async fn head(&self, execution_id: Uuid) -> Option<ContentHash> {
        let chain = self.chains.get(&execution_id).map(|c| c.clone())?;
        let records = chain.lock().await;
        records.last().map(|r| r.record_hash)
    }

    /// Fetch the payload a record points at.
    pub async fn payload(&self, record: &ExecutionRecord) -> Result<Value, EngineError> {
        let bytes = self.blobs.get(&record.payload_hash).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Re-verify the whole chain. Returns the number of records checked.
    #[instrument(skip(self))]
    pub async fn validate_ledger(&self, execution_id: Uuid) -> Result<usize, EngineError> {
        let chain = self.existing_chain(execution_id)?;
        let records = chain.lock().await;
        if let Err(e) = validate_chain_signed_by(&records, self.trusted.as_ref()) {
            warn!(error = %e, "ledger validation failed");
            return Err(e);
        }
        Ok(records.len())
    }

    // -----------------------------------------------------------------------
    // Replay
    // -----------------------------------------------------------------------

    /// Validate the chain and open a cursor over a snapshot of it.
    #[instrument(skip(self))]
    pub async fn start_replay(&self, execution_id: Uuid) -> Result<ReplayState, EngineError> {
        let chain = self.existing_chain(execution_id)?;
        let records = chain.lock().await.clone();

        if let Err(e) = validate_chain_signed_by(&records, self.trusted.as_ref()) {
            warn!(error = %e, "replay refused");
            return Err(EngineError::LedgerInvalid {
                execution_id,
                reason: e.to_string(),
            });
        }

        let now = Utc::now();
        self.prune_replays(now);
        self.make_room_for_replay();

        let state = ReplayState {
            replay_id: Uuid::new_v4(),
            execution_id,
            cursor: 0,
            total: records.len(),
            vector_clock: VectorClock::new(),
            state_hash: ContentHash::ZERO,
            started_at: now,
            completed_at: None,
        };
        self.replays.insert(
            state.replay_id,
            Replay {
                state: state.clone(),
                records,
                touched_at: now,
            },
        );
        info!(replay_id = %state.replay_id, total = state.total, "replay started");
        Ok(state)
    }

    /// Advance the cursor by one. `None` once every record has been returned.
    pub fn get_next_replay_record(&self, replay_id: Uuid) -> Result<Option<ExecutionRecord>, EngineError> {
        let mut replay = self
            .replays
            .get_mut(&replay_id)
            .ok_or(EngineError::ReplayNotFound(replay_id))?;
        replay.touched_at = Utc::now();
        let Replay { state, records, .. } = &mut *replay;
        Ok(step_replay(state, records))
    }

    pub fn replay_state(&self, replay_id: Uuid) -> Option<ReplayState> {
        self.replays.get(&replay_id).map(|r| r.state.clone())
    }

    /// Consume whatever is left, close the replay and return its final state.
    pub fn complete_replay(&self, replay_id: Uuid) -> Result<ReplayState, EngineError> {
        let (_, mut replay) = self
            .replays
            .remove(&replay_id)
            .ok_or(EngineError::ReplayNotFound(replay_id))?;
        while step_replay(&mut replay.state, &replay.records).is_some() {}
        replay.state.completed_at = Some(Utc::now());
        info!(
            %replay_id,
            execution_id = %replay.state.execution_id,
            state_hash = %replay.state.state_hash,
            "replay completed"
        );
        Ok(replay.state)
    }

    /// Drop replays nobody has advanced within the idle window. Returns how
    /// many were dropped.
    pub fn prune_replays(&self, now: DateTime<Utc>) -> usize {
        let ttl = self.config.replay_idle_ttl();
        let before = self.replays.len();
        self.replays.retain(|_, replay| now - replay.touched_at < ttl);
        let dropped = before.saturating_sub(self.replays.len());
        if dropped > 0 {
            debug!(dropped, "idle replays dropped");
        }
        dropped
    }

    pub fn open_replays(&self) -> usize {
        self.replays.len()
    }

    fn make_room_for_replay(&self) {
        while self.replays.len() >= self.config.max_open_replays.max(1) {
            let idlest = self
                .replays
                .iter()
                .min_by_key(|entry| entry.value().touched_at)
                .map(|entry| *entry.key());
            let Some(replay_id) = idlest else {
                break;
            };
            self.replays.remove(&replay_id);
            warn!(%replay_id, "open replay limit reached, idlest replay dropped");
        }
    }
}

fn step_replay(state: &mut ReplayState, records: &[ExecutionRecord]) -> Option<ExecutionRecord> {
    let record = records.get(state.cursor)?.clone();
    state.cursor += 1;
    state.vector_clock.merge(&record.vector_clock);
    let mut bytes = Vec::with_capacity(64);
    bytes.extend_from_slice(state.state_hash.as_bytes());
    bytes.extend_from_slice(record.record_hash.as_bytes());
    state.state_hash = ContentHash::of(&bytes);
    Some(record)
}
