//! Per-execution CRDT document: a base snapshot plus an operation log.
//!
//! The visible state is the base with every surviving operation applied in
//! causal order (vector-clock sum, then timestamp, node id and operation id).
//! Whether an operation survives depends only on the set of operations
//! present, never on arrival order, so two replicas holding the same
//! operations hold the same state.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use fabric::{ContentHash, FabricError, NodeId, VectorClock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::operation::{coerce_to_string, CrdtOperation, OperationSpec};
use super::CrdtConfig;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Concurrent writes: the later timestamp wins.
    LastWriteWins,
    /// Causal violation: the larger vector-clock sum wins.
    Merge,
    /// Type mismatch: the later write wins, coerced to a string.
    Custom,
}

/// Permanent log entry for one detected conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub resolution_id: Uuid,
    pub operation_ids: (Uuid, Uuid),
    pub path: String,
    pub strategy: ResolutionStrategy,
    pub winner: Uuid,
    pub resolved_value: Value,
    pub resolved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactionRecord {
    pub execution_id: Uuid,
    pub operations_before: usize,
    pub operations_after: usize,
    pub snapshot_hash: ContentHash,
    pub compacted_at: DateTime<Utc>,
}

/// What compaction persists to the blob store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrdtSnapshot {
    pub execution_id: Uuid,
    pub base_state: Value,
    pub base_clock: VectorClock,
    pub vector_clock: VectorClock,
    /// Retained tail of the log, in causal order.
    pub operations: Vec<CrdtOperation>,
    /// Every operation id ever applied, folded or retained.
    pub applied: Vec<Uuid>,
    pub losers: Vec<Uuid>,
    pub overrides: Vec<(Uuid, Value)>,
    pub taken_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeReport {
    pub applied: usize,
    pub duplicates: usize,
    /// Operations still waiting for causal dependencies after this merge.
    pub deferred: usize,
    /// Operations discarded because the deferred buffer was full.
    pub dropped: usize,
    pub conflicts: usize,
}

/// Default bound on operations waiting for their dependencies.
pub const DEFAULT_MAX_DEFERRED: usize = 10_000;

// ---------------------------------------------------------------------------
// CrdtDocument
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CrdtDocument {
    execution_id: Uuid,
    base_state: Value,
    base_clock: VectorClock,
    operations: Vec<CrdtOperation>,
    applied: HashSet<Uuid>,
    vector_clock: VectorClock,
    conflicts: Vec<ConflictResolution>,
    resolved_pairs: HashSet<(Uuid, Uuid)>,
    /// Operations that lost a conflict and are skipped when folding.
    losers: HashSet<Uuid>,
    /// Replacement values chosen by the custom strategy.
    overrides: HashMap<Uuid, Value>,
    /// Remote operations whose causal dependencies have not arrived.
    deferred: Vec<CrdtOperation>,
    max_deferred: usize,
    state: Value,
    compactions: Vec<CompactionRecord>,
    last_compacted_at: DateTime<Utc>,
}

fn causal_cmp(a: &CrdtOperation, b: &CrdtOperation) -> Ordering {
    a.vector_clock
        .sum()
        .cmp(&b.vector_clock.sum())
        .then_with(|| a.timestamp.cmp(&b.timestamp))
        .then_with(|| a.node_id.cmp(&b.node_id))
        .then_with(|| a.operation_id.cmp(&b.operation_id))
}

fn last_write_cmp(a: &CrdtOperation, b: &CrdtOperation) -> Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.node_id.cmp(&b.node_id))
        .then_with(|| a.operation_id.cmp(&b.operation_id))
}

fn pair_key(a: Uuid, b: Uuid) -> (Uuid, Uuid) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

impl CrdtDocument {
    pub fn new(execution_id: Uuid, now: DateTime<Utc>) -> Self {
        Self {
            execution_id,
            base_state: Value::Object(Map::new()),
            base_clock: VectorClock::new(),
            operations: Vec::new(),
            applied: HashSet::new(),
            vector_clock: VectorClock::new(),
            conflicts: Vec::new(),
            resolved_pairs: HashSet::new(),
            losers: HashSet::new(),
            overrides: HashMap::new(),
            deferred: Vec::new(),
            max_deferred: DEFAULT_MAX_DEFERRED,
            state: Value::Object(Map::new()),
            compactions: Vec::new(),
            last_compacted_at: now,
        }
    }

    /// Bound the deferred buffer. Operations arriving while it is full are
    /// dropped and must be re-sent once their dependencies are known.
    pub fn with_deferred_limit(mut self, limit: usize) -> Self {
        self.max_deferred = limit;
        self
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn state(&self) -> &Value {
        &self.state
    }

    pub fn vector_clock(&self) -> &VectorClock {
        &self.vector_clock
    }

    pub fn operations(&self) -> &[CrdtOperation] {
        &self.operations
    }

    pub fn conflicts(&self) -> &[ConflictResolution] {
        &self.conflicts
    }

    pub fn compactions(&self) -> &[CompactionRecord] {
        &self.compactions
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    pub fn state_hash(&self) -> Result<ContentHash, FabricError> {
        ContentHash::of_json(&self.state)
    }

    // -----------------------------------------------------------------------
    // Applying
    // -----------------------------------------------------------------------

    /// Stamp a local mutation with a fresh clock tick for `node_id` and apply
    /// it. The latest operation on the same path becomes its causal dependency.
    pub fn apply_local(
        &mut self,
        node_id: &NodeId,
        spec: OperationSpec,
        now: DateTime<Utc>,
    ) -> (CrdtOperation, MergeReport) {
        self.vector_clock.tick(node_id);
        let causal_deps = self
            .operations
            .iter()
            .filter(|op| op.path == spec.path)
            .max_by(|a, b| causal_cmp(a, b))
            .map(|op| vec![op.operation_id])
            .unwrap_or_default();

        let op = CrdtOperation {
            operation_id: Uuid::new_v4(),
            kind: spec.kind,
            path: spec.path,
            value: spec.value,
            node_id: node_id.clone(),
            vector_clock: self.vector_clock.clone(),
            timestamp: now,
            causal_deps,
        };
        let report = self.merge(vec![op.clone()], now);
        (op, report)
    }

    /// Integrate a batch: duplicates are dropped, operations with missing
    /// dependencies wait in the deferred buffer, and the visible state is
    /// recomputed once.
    pub fn merge(&mut self, batch: Vec<CrdtOperation>, now: DateTime<Utc>) -> MergeReport {
        let mut report = MergeReport::default();

        for op in batch {
            let id = op.operation_id;
            if self.applied.contains(&id) || self.deferred.iter().any(|d| d.operation_id == id) {
                report.duplicates += 1;
                continue;
            }
            if !self.dependencies_met(&op) {
                if self.deferred.len() >= self.max_deferred {
                    warn!(operation_id = %id, limit = self.max_deferred, "deferred buffer full, operation dropped");
                    report.dropped += 1;
                    continue;
                }
                debug!(operation_id = %id, "operation deferred until its dependencies arrive");
                self.deferred.push(op);
                continue;
            }
            report.conflicts += self.integrate(op, now);
            report.applied += 1;
        }

        // Deferred operations may now be unblocked, possibly in chains.
        while let Some(index) = self.deferred.iter().position(|op| self.dependencies_met(op)) {
            let op = self.deferred.remove(index);
            report.conflicts += self.integrate(op, now);
            report.applied += 1;
        }

        report.deferred = self.deferred.len();
        if report.applied > 0 {
            self.recompute();
        }
        report
    }

    fn dependencies_met(&self, op: &CrdtOperation) -> bool {
        op.causal_deps.iter().all(|dep| self.applied.contains(dep))
    }

    /// Detect and resolve conflicts for `op`, then append it. Returns the
    /// number of new resolutions logged.
    fn integrate(&mut self, op: CrdtOperation, now: DateTime<Utc>) -> usize {
        let mut resolutions = Vec::new();

        for other in &self.operations {
            if self.resolved_pairs.contains(&pair_key(op.operation_id, other.operation_id)) {
                continue;
            }

            if op.causal_deps.contains(&other.operation_id)
                && !other.vector_clock.happens_before(&op.vector_clock)
            {
                resolutions.push(self.resolve_causal_violation(&op, other, now));
                continue;
            }

            if other.path != op.path || (op.kind.commutes() && other.kind.commutes()) {
                continue;
            }
            let ordered = op.vector_clock.happens_before(&other.vector_clock)
                || other.vector_clock.happens_before(&op.vector_clock);
            if !ordered {
                resolutions.push(self.resolve_concurrent_write(&op, other, now));
            }
        }

        let count = resolutions.len();
        for resolution in resolutions {
            let (a, b) = resolution.operation_ids;
            let loser = if resolution.winner == a { b } else { a };
            self.losers.insert(loser);
            if resolution.strategy == ResolutionStrategy::Custom {
                self.overrides
                    .insert(resolution.winner, resolution.resolved_value.clone());
            }
            self.resolved_pairs.insert(pair_key(a, b));
            info!(
                execution_id = %self.execution_id,
                path = %resolution.path,
                strategy = ?resolution.strategy,
                winner = %resolution.winner,
                "conflict resolved"
            );
            self.conflicts.push(resolution);
        }

        self.applied.insert(op.operation_id);
        self.vector_clock.merge(&op.vector_clock);
        self.operations.push(op);
        count
    }

    fn resolve_concurrent_write(
        &self,
        op: &CrdtOperation,
        other: &CrdtOperation,
        now: DateTime<Utc>,
    ) -> ConflictResolution {
        let winner = match last_write_cmp(op, other) {
            Ordering::Less => other,
            _ => op,
        };
        let mismatch = match (op.result_type(), other.result_type()) {
            (Some(a), Some(b)) => a != b,
            _ => false,
        };
        let (strategy, resolved_value) = if mismatch {
            (ResolutionStrategy::Custom, coerce_to_string(&winner.value))
        } else {
            (ResolutionStrategy::LastWriteWins, winner.value.clone())
        };
        ConflictResolution {
            resolution_id: Uuid::new_v4(),
            operation_ids: (other.operation_id, op.operation_id),
            path: op.path.clone(),
            strategy,
            winner: winner.operation_id,
            resolved_value,
            resolved_at: now,
        }
    }

    fn resolve_causal_violation(
        &self,
        op: &CrdtOperation,
        dependency: &CrdtOperation,
        now: DateTime<Utc>,
    ) -> ConflictResolution {
        let winner = match op
            .vector_clock
            .sum()
            .cmp(&dependency.vector_clock.sum())
            .then_with(|| last_write_cmp(op, dependency))
        {
            Ordering::Less => dependency,
            _ => op,
        };
        ConflictResolution {
            resolution_id: Uuid::new_v4(),
            operation_ids: (dependency.operation_id, op.operation_id),
            path: op.path.clone(),
            strategy: ResolutionStrategy::Merge,
            winner: winner.operation_id,
            resolved_value: winner.value.clone(),
            resolved_at: now,
        }
    }

    fn ordered_operations(&self) -> Vec<&CrdtOperation> {
        let mut ordered: Vec<&CrdtOperation> = self.operations.iter().collect();
        ordered.sort_by(|a, b| causal_cmp(a, b));
        ordered
    }

    fn fold_into(&self, state: &mut Value, op: &CrdtOperation) {
        if self.losers.contains(&op.operation_id) {
            return;
        }
        let value = self.overrides.get(&op.operation_id).unwrap_or(&op.value);
        op.apply_with(state, value);
    }

    fn recompute(&mut self) {
        let mut state = self.base_state.clone();
        for op in self.ordered_operations() {
            self.fold_into(&mut state, op);
        }
        self.state = state;
    }

    // -----------------------------------------------------------------------
    // Compaction
    // -----------------------------------------------------------------------

    pub fn needs_compaction(&self, config: &CrdtConfig, now: DateTime<Utc>) -> bool {
        if self.operations.len() > config.compaction_threshold {
            return true;
        }
        let interval = Duration::milliseconds(config.compaction_interval_ms as i64);
        self.operations.len() > config.retain_operations && now - self.last_compacted_at >= interval
    }

    /// Fold everything but the newest `retain` operations into the base and
    /// return the snapshot to persist. The visible state is unchanged.
    pub fn compact(&mut self, retain: usize, now: DateTime<Utc>) -> CrdtSnapshot {
        let mut ordered: Vec<CrdtOperation> = self.ordered_operations().into_iter().cloned().collect();
        let split = ordered.len().saturating_sub(retain);
        let retained = ordered.split_off(split);

        let mut base = self.base_state.clone();
        for op in &ordered {
            self.fold_into(&mut base, op);
            self.base_clock.merge(&op.vector_clock);
        }
        for op in &ordered {
            self.losers.remove(&op.operation_id);
            self.overrides.remove(&op.operation_id);
        }
        self.base_state = base;
        self.operations = retained;
        self.last_compacted_at = now;
        self.recompute();

        CrdtSnapshot {
            execution_id: self.execution_id,
            base_state: self.base_state.clone(),
            base_clock: self.base_clock.clone(),
            vector_clock: self.vector_clock.clone(),
            operations: self.operations.clone(),
            applied: self.applied.iter().copied().collect(),
            losers: self.losers.iter().copied().collect(),
            overrides: self
                .overrides
                .iter()
                .map(|(id, v)| (*id, v.clone()))
                .collect(),
            taken_at: now,
        }
    }

    pub(crate) fn record_compaction(&mut self, record: CompactionRecord) {
        self.compactions.push(record);
    }

    /// Rebuild a document from a persisted snapshot.
    pub fn from_snapshot(snapshot: CrdtSnapshot) -> Self {
        let mut doc = Self::new(snapshot.execution_id, snapshot.taken_at);
        doc.base_state = snapshot.base_state;
        doc.base_clock = snapshot.base_clock;
        doc.vector_clock = snapshot.vector_clock;
        doc.operations = snapshot.operations;
        doc.applied = snapshot.applied.into_iter().collect();
        doc.losers = snapshot.losers.into_iter().collect();
        doc.overrides = snapshot.overrides.into_iter().collect();
        doc.recompute();
        doc
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::operation::OperationKind;
    use proptest::prelude::*;
    use serde_json::json;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn clock(pairs: &[(&str, u64)]) -> VectorClock {
        pairs.iter().map(|(n, c)| (NodeId::from(*n), *c)).collect()
    }

    fn remote(
        node: &str,
        clock_pairs: &[(&str, u64)],
        secs: i64,
        spec: OperationSpec,
        deps: Vec<Uuid>,
    ) -> CrdtOperation {
        CrdtOperation {
            operation_id: Uuid::new_v4(),
            kind: spec.kind,
            path: spec.path,
            value: spec.value,
            node_id: node.into(),
            vector_clock: clock(clock_pairs),
            timestamp: at(secs),
            causal_deps: deps,
        }
    }

    #[test]
    fn local_operations_build_visible_state() {
        let mut doc = CrdtDocument::new(Uuid::new_v4(), at(0));
        let node = NodeId::from("a");
        doc.apply_local(&node, OperationSpec::set("status", json!("running")), at(1));
        doc.apply_local(&node, OperationSpec::increment("progress", 1.0), at(2));
        doc.apply_local(&node, OperationSpec::set("status", json!("done")), at(3));

        assert_eq!(doc.state(), &json!({ "status": "done", "progress": 1 }));
        assert_eq!(doc.vector_clock().get(&node), 3);
        assert!(doc.conflicts().is_empty());
    }

    #[test]
    fn later_timestamp_wins_concurrent_sets() {
        let early = remote("a", &[("a", 1)], 10, OperationSpec::set("x", json!("early")), vec![]);
        let late = remote("b", &[("b", 1)], 20, OperationSpec::set("x", json!("late")), vec![]);

        for batch in [vec![early.clone(), late.clone()], vec![late.clone(), early.clone()]] {
            let mut doc = CrdtDocument::new(Uuid::new_v4(), at(0));
            let report = doc.merge(batch, at(30));
            assert_eq!(report.applied, 2);
            assert_eq!(report.conflicts, 1);
            assert_eq!(doc.state()["x"], json!("late"));

            let resolution = &doc.conflicts()[0];
            assert_eq!(resolution.strategy, ResolutionStrategy::LastWriteWins);
            assert_eq!(resolution.winner, late.operation_id);
            assert_eq!(resolution.resolved_value, json!("late"));
        }
    }

    #[test]
    fn concurrent_counters_do_not_conflict() {
        let mut doc = CrdtDocument::new(Uuid::new_v4(), at(0));
        let report = doc.merge(
            vec![
                remote("a", &[("a", 1)], 1, OperationSpec::increment("n", 2.0), vec![]),
                remote("b", &[("b", 1)], 1, OperationSpec::increment("n", 5.0), vec![]),
            ],
            at(2),
        );
        assert_eq!(report.conflicts, 0);
        assert_eq!(doc.state()["n"], json!(7));
    }

    #[test]
    fn type_mismatch_falls_back_to_string_coercion() {
        let number = remote("a", &[("a", 1)], 10, OperationSpec::set("x", json!(1)), vec![]);
        let object = remote("b", &[("b", 1)], 20, OperationSpec::set("x", json!({ "k": 1 })), vec![]);

        let mut doc = CrdtDocument::new(Uuid::new_v4(), at(0));
        doc.merge(vec![number, object], at(30));

        assert_eq!(doc.conflicts()[0].strategy, ResolutionStrategy::Custom);
        assert_eq!(doc.state()["x"], json!("{\"k\":1}"));
    }

    #[test]
    fn contradicted_dependency_is_a_causal_violation() {
        let dep = remote("a", &[("a", 5)], 10, OperationSpec::set("x", json!("dep")), vec![]);
        // Claims to follow `dep` but its clock says otherwise.
        let bad = remote(
            "b",
            &[("b", 1)],
            20,
            OperationSpec::set("y", json!("bad")),
            vec![dep.operation_id],
        );

        let mut doc = CrdtDocument::new(Uuid::new_v4(), at(0));
        doc.merge(vec![dep.clone(), bad], at(30));

        let resolution = &doc.conflicts()[0];
        assert_eq!(resolution.strategy, ResolutionStrategy::Merge);
        assert_eq!(resolution.winner, dep.operation_id);
        assert_eq!(doc.state(), &json!({ "x": "dep" }));
    }

    #[test]
    fn operations_wait_for_missing_dependencies() {
        let first = remote("a", &[("a", 1)], 1, OperationSpec::set("x", json!(1)), vec![]);
        let second = remote(
            "a",
            &[("a", 2)],
            2,
            OperationSpec::set("x", json!(2)),
            vec![first.operation_id],
        );

        let mut doc = CrdtDocument::new(Uuid::new_v4(), at(0));
        let report = doc.merge(vec![second.clone()], at(3));
        assert_eq!(report.applied, 0);
        assert_eq!(report.deferred, 1);
        assert_eq!(doc.state(), &json!({}));

        let report = doc.merge(vec![first, second], at(4));
        assert_eq!(report.applied, 2);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.deferred, 0);
        assert_eq!(doc.state()["x"], json!(2));
    }

    #[test]
    fn deferred_buffer_is_bounded() {
        let missing = Uuid::new_v4();
        let orphans: Vec<_> = (0..5)
            .map(|i| {
                remote(
                    "a",
                    &[("a", i + 2)],
                    i as i64,
                    OperationSpec::set("x", json!(i)),
                    vec![missing],
                )
            })
            .collect();

        let mut doc = CrdtDocument::new(Uuid::new_v4(), at(0)).with_deferred_limit(3);
        let report = doc.merge(orphans.clone(), at(10));
        assert_eq!(report.applied, 0);
        assert_eq!(report.deferred, 3);
        assert_eq!(report.dropped, 2);
        assert_eq!(doc.deferred_len(), 3);

        // A dropped operation is accepted again once there is room.
        let report = doc.merge(vec![orphans[4].clone()], at(11));
        assert_eq!(report.dropped, 1);
        assert_eq!(report.duplicates, 0);
    }

    #[test]
    fn merging_the_same_batch_twice_is_idempotent() {
        let ops = vec![
            remote("a", &[("a", 1)], 1, OperationSpec::append("log", json!("a1")), vec![]),
            remote("b", &[("b", 1)], 2, OperationSpec::append("log", json!("b1")), vec![]),
        ];
        let mut doc = CrdtDocument::new(Uuid::new_v4(), at(0));
        doc.merge(ops.clone(), at(3));
        let before = doc.state_hash().unwrap();

        let report = doc.merge(ops, at(4));
        assert_eq!(report.duplicates, 2);
        assert_eq!(doc.state_hash().unwrap(), before);
    }

    #[test]
    fn compaction_preserves_state_and_retains_the_tail() {
        let mut doc = CrdtDocument::new(Uuid::new_v4(), at(0));
        let node = NodeId::from("a");
        for i in 0..30 {
            doc.apply_local(&node, OperationSpec::increment("count", 1.0), at(i));
            doc.apply_local(&node, OperationSpec::set(format!("k{i}"), json!(i)), at(i));
        }
        let before = doc.state().clone();

        let config = CrdtConfig {
            compaction_threshold: 50,
            retain_operations: 10,
            ..CrdtConfig::default()
        };
        assert!(doc.needs_compaction(&config, at(60)));

        let snapshot = doc.compact(config.retain_operations, at(60));
        assert_eq!(doc.operations().len(), 10);
        assert_eq!(doc.state(), &before);
        assert_eq!(snapshot.operations.len(), 10);
        assert!(!doc.needs_compaction(&config, at(61)));

        let restored = CrdtDocument::from_snapshot(snapshot);
        assert_eq!(restored.state(), &before);
    }

    #[test]
    fn interval_triggers_compaction_only_above_retained_size() {
        let config = CrdtConfig::default();
        let mut doc = CrdtDocument::new(Uuid::new_v4(), at(0));
        let node = NodeId::from("a");
        for i in 0..(config.retain_operations as i64 + 1) {
            doc.apply_local(&node, OperationSpec::increment("n", 1.0), at(i));
        }
        assert!(!doc.needs_compaction(&config, at(10)));
        assert!(doc.needs_compaction(&config, at(301)));
    }

    #[test]
    fn folded_operations_are_still_deduplicated() {
        let mut doc = CrdtDocument::new(Uuid::new_v4(), at(0));
        let node = NodeId::from("a");
        let (first, _) = doc.apply_local(&node, OperationSpec::increment("n", 1.0), at(1));
        doc.apply_local(&node, OperationSpec::increment("n", 1.0), at(2));
        doc.compact(0, at(3));

        let report = doc.merge(vec![first], at(4));
        assert_eq!(report.duplicates, 1);
        assert_eq!(doc.state()["n"], json!(2));
    }

    // -----------------------------------------------------------------------
    // Convergence
    // -----------------------------------------------------------------------

    fn spec_strategy() -> impl Strategy<Value = OperationSpec> {
        let path = prop::sample::select(vec!["x", "y", "cfg.a"]);
        let kind = prop::sample::select(vec![
            OperationKind::Set,
            OperationKind::Delete,
            OperationKind::Increment,
            OperationKind::Append,
            OperationKind::Merge,
        ]);
        (kind, path, 0i64..5).prop_map(|(kind, path, n)| {
            let value = match kind {
                OperationKind::Merge => {
                    let mut patch = Map::new();
                    patch.insert(format!("k{n}"), json!(n));
                    Value::Object(patch)
                }
                OperationKind::Delete => Value::Null,
                _ => json!(n),
            };
            OperationSpec::new(kind, path, value)
        })
    }

    /// Independent histories from three nodes; each node's own operations
    /// form a causal chain.
    fn histories() -> impl Strategy<Value = Vec<CrdtOperation>> {
        prop::collection::vec((0usize..3, spec_strategy(), 0i64..20), 1..25).prop_map(|raw| {
            let nodes = ["a", "b", "c"];
            let mut clocks = vec![VectorClock::new(); 3];
            let mut last: Vec<Option<Uuid>> = vec![None; 3];
            raw.into_iter()
                .map(|(n, spec, secs)| {
                    let node = NodeId::from(nodes[n]);
                    clocks[n].tick(&node);
                    let op = CrdtOperation {
                        operation_id: Uuid::new_v4(),
                        kind: spec.kind,
                        path: spec.path,
                        value: spec.value,
                        node_id: node,
                        vector_clock: clocks[n].clone(),
                        timestamp: at(secs),
                        causal_deps: last[n].into_iter().collect(),
                    };
                    last[n] = Some(op.operation_id);
                    op
                })
                .collect()
        })
    }

    proptest! {
        #[test]
        fn replicas_converge_regardless_of_delivery_order(
            ops in histories(),
            seed in any::<u64>(),
        ) {
            let mut shuffled = ops.clone();
            // Deterministic shuffle; the deferred buffer restores causal order.
            let len = shuffled.len();
            for i in (1..len).rev() {
                let j = (seed.wrapping_mul(6364136223846793005).wrapping_add(i as u64) % (i as u64 + 1)) as usize;
                shuffled.swap(i, j);
            }

            let mut left = CrdtDocument::new(Uuid::nil(), at(0));
            left.merge(ops, at(100));

            let mut right = CrdtDocument::new(Uuid::nil(), at(0));
            for op in shuffled {
                right.merge(vec![op], at(100));
            }

            prop_assert_eq!(right.deferred_len(), 0);
            prop_assert_eq!(left.state(), right.state());
            prop_assert_eq!(left.state_hash().unwrap(), right.state_hash().unwrap());
        }
    }
}
