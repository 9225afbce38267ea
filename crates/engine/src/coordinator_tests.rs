//! End-to-end tests for the flow coordinator.
//!
//! Every test runs a whole in-process swarm: one `LocalBus`, a capability
//! registry with honest benchmarks, a work distributor, a validator set with
//! auto-voting agents and an in-memory blob store. No Postgres is required.

use std::sync::Arc;

use chrono::{Duration, Utc};
use consensus::{
    ApproveAll, ByzantineConsensus, ConsensusConfig, FixedVote, ProposalStatus, ValidatorAgent,
    VoteChoice, VotePolicy,
};
use fabric::{
    Ed25519Signer, LocalBus, LocalRiskScorer, MemoryBlobStore, MessageBus, NodeId, SigningService,
    Topic,
};
use nodes::mock::{MockExecutor, MockProbe};
use nodes::{
    Capability, CapabilityRegistry, NodeCapabilityManifest, NodeSelector, NodeStatus,
    RegistryConfig, StepExecutor,
};
use queue::{DistributorConfig, NodeCapacity, WorkDistributor};
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::coordinator::StepResult;
use crate::crdt::{CrdtConfig, CrdtSynchronizer};
use crate::ledger::ExecutionLedger;
use crate::models::{FlowDefinition, RecordKind, StepDefinition};
use crate::{EngineError, ExecutorConfig, ExecutorRegistry, FlowCoordinator, FlowStatus, SwarmServices};

// ============================================================
// Harness
// ============================================================

struct Harness {
    bus: Arc<LocalBus>,
    blobs: Arc<MemoryBlobStore>,
    registry: Arc<CapabilityRegistry>,
    signer: Arc<Ed25519Signer>,
    services: SwarmServices,
    handles: Vec<JoinHandle<()>>,
}

impl Drop for Harness {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// A swarm with one worker per `(name, capabilities)` entry and one
/// validator per vote policy.
async fn harness(workers: &[(&str, &[&str])], policies: Vec<Arc<dyn VotePolicy>>) -> Harness {
    let bus = Arc::new(LocalBus::new());
    let blobs = Arc::new(MemoryBlobStore::new());
    let coordinator = NodeId::from("coordinator");
    let signer = Arc::new(Ed25519Signer::from_seed([200u8; 32]));

    let registry = Arc::new(CapabilityRegistry::new(
        coordinator.clone(),
        RegistryConfig::default(),
        signer.clone(),
        Arc::new(MockProbe::honest()),
        Arc::new(LocalRiskScorer::default()),
    ));
    let selector = Arc::new(NodeSelector::new(registry.clone()));
    let distributor = Arc::new(WorkDistributor::new(
        coordinator.clone(),
        DistributorConfig::default(),
        signer.clone(),
        bus.clone() as Arc<dyn MessageBus>,
    ));
    let ledger = Arc::new(ExecutionLedger::new(signer.clone(), blobs.clone()));
    let state = Arc::new(
        CrdtSynchronizer::new(coordinator.clone(), CrdtConfig::default(), blobs.clone())
            .with_bus(bus.clone(), signer.clone()),
    );

    let validators: Vec<(NodeId, String)> = (0..policies.len())
        .map(|i| {
            let key = Ed25519Signer::from_seed([i as u8 + 1; 32]).public_key();
            (NodeId::from(format!("v{i}")), key)
        })
        .collect();
    let consensus_replica = |id: NodeId, seed: u8| {
        Arc::new(ByzantineConsensus::new(
            id,
            ConsensusConfig::default(),
            Arc::new(Ed25519Signer::from_seed([seed; 32])),
            bus.clone() as Arc<dyn MessageBus>,
        ))
    };

    let mut handles = Vec::new();
    for (i, policy) in policies.into_iter().enumerate() {
        let engine = consensus_replica(NodeId::from(format!("v{i}")), i as u8 + 1);
        for (node, key) in &validators {
            engine.register_validator(node.clone(), key.clone(), 1.0).await;
        }
        handles.push(ValidatorAgent::new(engine, policy).spawn().await);
    }
    let consensus = consensus_replica(coordinator.clone(), 100);
    for (node, key) in &validators {
        consensus.register_validator(node.clone(), key.clone(), 1.0).await;
    }
    handles.push(consensus.clone().spawn_listener().await);

    let harness = Harness {
        bus,
        blobs,
        registry,
        signer,
        services: SwarmServices {
            ledger,
            state,
            consensus,
            distributor,
            selector,
        },
        handles,
    };
    for (i, (name, capabilities)) in workers.iter().enumerate() {
        harness.enlist(name, i as u8 + 50, capabilities, true).await;
    }
    harness
}

impl Harness {
    /// Register, verify and mark a worker live. `claimable` controls whether
    /// the distributor knows about it.
    async fn enlist(&self, name: &str, seed: u8, capabilities: &[&str], claimable: bool) {
        let now = Utc::now();
        let node = NodeId::from(name);
        let manifest = NodeCapabilityManifest::new(
            node.clone(),
            capabilities.iter().map(|c| Capability::new(*c, 100.0)).collect(),
            now - Duration::hours(1),
            now + Duration::hours(1),
        )
        .signed(&Ed25519Signer::from_seed([seed; 32]))
        .unwrap();
        self.registry.register_capability_manifest(manifest).await.unwrap();
        self.registry.verify_node_capabilities(&node).await.unwrap();
        self.services.selector.update_status(NodeStatus::new(node.clone()));

        if claimable {
            self.services
                .distributor
                .register_node(NodeCapacity::new(
                    node,
                    capabilities.iter().map(|c| (*c).to_owned()).collect(),
                ))
                .await
                .unwrap();
        }
    }

    fn coordinator(&self, config: ExecutorConfig, executors: ExecutorRegistry) -> FlowCoordinator {
        FlowCoordinator::new(NodeId::from("coordinator"), config, executors, self.services.clone())
    }

    async fn record_kinds(&self, execution_id: Uuid) -> Vec<(String, RecordKind)> {
        self.services
            .ledger
            .records(execution_id)
            .await
            .into_iter()
            .map(|r| (r.step_id, r.kind))
            .collect()
    }
}

fn approve_all(n: usize) -> Vec<Arc<dyn VotePolicy>> {
    (0..n).map(|_| Arc::new(ApproveAll) as Arc<dyn VotePolicy>).collect()
}

fn registry(entries: &[(&str, &Arc<MockExecutor>)]) -> ExecutorRegistry {
    entries
        .iter()
        .map(|(step_type, executor)| ((*step_type).to_owned(), Arc::clone(executor) as Arc<dyn StepExecutor>))
        .collect()
}

fn fast_retries(max_retries: u32) -> ExecutorConfig {
    ExecutorConfig {
        max_retries,
        retry_base_delay_ms: 1,
        ..ExecutorConfig::default()
    }
}

fn calls(executor: &MockExecutor) -> Vec<(NodeId, Value)> {
    executor.calls.lock().unwrap().clone()
}

const WORKERS: &[(&str, &[&str])] = &[("w1", &["compute"]), ("w2", &["compute", "gpu"])];

// ============================================================
// Happy path
// ============================================================

#[tokio::test]
async fn linear_flow_runs_every_step_and_chains_outputs() {
    let h = harness(WORKERS, Vec::new()).await;
    let fetch = Arc::new(MockExecutor::returning("fetch", json!({ "rows": 3 })));
    let transform = Arc::new(MockExecutor::returning("transform", json!({ "ok": true })));
    let store = Arc::new(MockExecutor::returning("store", json!({ "stored": 3 })));

    let flow = FlowDefinition::new(
        "etl",
        vec![
            StepDefinition::new("fetch", "fetch").then("transform"),
            StepDefinition::new("transform", "transform").then("store"),
            StepDefinition::new("store", "store"),
        ],
    );
    let coordinator = h.coordinator(
        ExecutorConfig::default(),
        registry(&[("fetch", &fetch), ("transform", &transform), ("store", &store)]),
    );

    let outcome = coordinator.run(&flow, json!({ "source": "s3://bucket" })).await.unwrap();

    assert_eq!(outcome.status, FlowStatus::Completed);
    assert_eq!(fetch.call_count(), 1);
    assert_eq!(transform.call_count(), 1);
    assert_eq!(store.call_count(), 1);
    assert_eq!(outcome.outputs["store"]["stored"], 3);

    // Each step sees the flow input and its predecessor's output.
    let (_, payload) = &calls(&transform)[0];
    assert_eq!(payload["input"]["source"], "s3://bucket");
    assert_eq!(payload["upstream"]["fetch"]["rows"], 3);
    assert!(payload["upstream"].get("store").is_none());

    assert_eq!(
        h.record_kinds(outcome.execution_id).await,
        vec![
            ("fetch".to_owned(), RecordKind::StepCompleted),
            ("transform".to_owned(), RecordKind::StepCompleted),
            ("store".to_owned(), RecordKind::StepCompleted),
            ("$flow".to_owned(), RecordKind::FlowCompleted),
        ]
    );
    assert_eq!(outcome.records, 4);
    assert_eq!(
        h.services.ledger.validate_ledger(outcome.execution_id).await.unwrap(),
        4
    );
    assert_eq!(
        h.services.ledger.head(outcome.execution_id).await,
        outcome.ledger_head
    );
}

#[tokio::test]
async fn shared_state_tracks_step_progress() {
    let h = harness(WORKERS, Vec::new()).await;
    let step = Arc::new(MockExecutor::returning("step", json!({})));
    let flow = FlowDefinition::new(
        "two",
        vec![
            StepDefinition::new("a", "step").then("b"),
            StepDefinition::new("b", "step"),
        ],
    );

    let outcome = h
        .coordinator(ExecutorConfig::default(), registry(&[("step", &step)]))
        .run(&flow, json!({ "n": 1 }))
        .await
        .unwrap();

    let state = &outcome.final_state;
    assert_eq!(state["input"], json!({ "n": 1 }));
    assert_eq!(state["status"], "completed");
    assert_eq!(state["progress"]["completed"], 2);
    assert_eq!(state["steps"]["a"]["status"], "completed");
    assert_eq!(state["steps"]["b"]["output"]["step"], "step");
    assert_eq!(
        h.services.state.state_hash(outcome.execution_id).await.unwrap(),
        outcome.state_hash
    );
}

#[tokio::test]
async fn state_delta_in_step_output_is_applied() {
    let h = harness(WORKERS, Vec::new()).await;
    let counter = Arc::new(MockExecutor::returning(
        "counter",
        json!({
            "state_delta": [
                { "kind": "increment", "path": "metrics.rows", "value": 5 },
                { "kind": "append", "path": "metrics.log", "value": "counted" }
            ]
        }),
    ));
    let flow = FlowDefinition::new(
        "delta",
        vec![
            StepDefinition::new("first", "counter").then("second"),
            StepDefinition::new("second", "counter"),
        ],
    );

    let outcome = h
        .coordinator(ExecutorConfig::default(), registry(&[("counter", &counter)]))
        .run(&flow, json!({}))
        .await
        .unwrap();

    assert_eq!(outcome.final_state["metrics"]["rows"], 10);
    assert_eq!(outcome.final_state["metrics"]["log"], json!(["counted", "counted"]));
}

#[tokio::test]
async fn steps_run_only_on_nodes_holding_required_capabilities() {
    let h = harness(WORKERS, Vec::new()).await;
    let render = Arc::new(MockExecutor::returning("render", json!({})));
    let flow = FlowDefinition::new("gpu", vec![StepDefinition::new("render", "render").requires("gpu")]);

    h.coordinator(ExecutorConfig::default(), registry(&[("render", &render)]))
        .run(&flow, json!({}))
        .await
        .unwrap();

    let (node, _) = &calls(&render)[0];
    assert_eq!(node, &NodeId::from("w2"));
}

#[tokio::test]
async fn claim_falls_through_to_the_next_candidate() {
    let h = harness(&[("w1", &["compute"])], Vec::new()).await;
    // Known to the selector with the best score, but never registered with
    // the distributor, so every claim on its behalf is refused.
    h.enlist("ghost", 90, &["compute"], false).await;
    let mut status = NodeStatus::new(NodeId::from("ghost"));
    status.performance_score = 1.0;
    h.services.selector.update_status(status);

    let step = Arc::new(MockExecutor::returning("step", json!({})));
    let flow = FlowDefinition::new("fallback", vec![StepDefinition::new("a", "step")]);

    h.coordinator(ExecutorConfig::default(), registry(&[("step", &step)]))
        .run(&flow, json!({}))
        .await
        .unwrap();

    let (node, _) = &calls(&step)[0];
    assert_eq!(node, &NodeId::from("w1"));
}

// ============================================================
// Failures and retries
// ============================================================

#[tokio::test]
async fn flaky_step_is_retried_until_it_succeeds() {
    let h = harness(WORKERS, Vec::new()).await;
    let flaky = Arc::new(MockExecutor::flaky("flaky", 2, json!({ "done": true })));
    let flow = FlowDefinition::new("retry", vec![StepDefinition::new("a", "flaky")]);

    let outcome = h
        .coordinator(fast_retries(3), registry(&[("flaky", &flaky)]))
        .run(&flow, json!({}))
        .await
        .unwrap();

    assert_eq!(flaky.call_count(), 3);
    assert_eq!(outcome.outputs["a"]["done"], true);
    // Retries happen inside one claim, so the ledger sees one completion.
    assert_eq!(
        h.record_kinds(outcome.execution_id).await[0],
        ("a".to_owned(), RecordKind::StepCompleted)
    );
}

#[tokio::test]
async fn retry_exhaustion_without_handler_aborts_the_flow() {
    let h = harness(WORKERS, Vec::new()).await;
    let broken = Arc::new(MockExecutor::failing_retryable("broken", "upstream timeout"));
    let never = Arc::new(MockExecutor::returning("never", json!({})));
    let flow = FlowDefinition::new(
        "exhaust",
        vec![
            StepDefinition::new("a", "broken").then("b"),
            StepDefinition::new("b", "never"),
        ],
    );

    let err = h
        .coordinator(fast_retries(2), registry(&[("broken", &broken), ("never", &never)]))
        .run(&flow, json!({}))
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::StepRetryExhausted { ref step_id, .. } if step_id == "a"));
    assert_eq!(broken.call_count(), 3);
    assert_eq!(never.call_count(), 0);
}

#[tokio::test]
async fn fatal_failure_follows_on_failure_edge() {
    let h = harness(WORKERS, Vec::new()).await;
    let boom = Arc::new(MockExecutor::failing_fatal("boom", "disk full"));
    let next = Arc::new(MockExecutor::returning("next", json!({})));
    let cleanup = Arc::new(MockExecutor::returning("cleanup", json!({ "cleaned": true })));
    let flow = FlowDefinition::new(
        "handled",
        vec![
            StepDefinition::new("a", "boom").then("b").on_failure("cleanup"),
            StepDefinition::new("b", "next"),
            StepDefinition::new("cleanup", "cleanup"),
        ],
    );

    let outcome = h
        .coordinator(
            ExecutorConfig::default(),
            registry(&[("boom", &boom), ("next", &next), ("cleanup", &cleanup)]),
        )
        .run(&flow, json!({}))
        .await
        .unwrap();

    // Fatal errors are never retried.
    assert_eq!(boom.call_count(), 1);
    assert_eq!(next.call_count(), 0);
    assert_eq!(cleanup.call_count(), 1);
    assert_eq!(outcome.status, FlowStatus::Recovered);
    assert_eq!(outcome.failed_steps, vec!["a".to_owned()]);
    assert_eq!(outcome.skipped_steps, vec!["b".to_owned()]);

    let kinds = h.record_kinds(outcome.execution_id).await;
    assert!(kinds.contains(&("a".to_owned(), RecordKind::StepFailed)));
    assert!(kinds.contains(&("cleanup".to_owned(), RecordKind::StepCompleted)));
    assert_eq!(outcome.final_state["steps"]["a"]["status"], "failed");
    assert_eq!(outcome.final_state["steps"]["b"]["status"], "skipped");
    assert_eq!(outcome.final_state["progress"]["failed"], 1);
}

#[tokio::test]
async fn missing_capability_is_reported_as_no_eligible_node() {
    let h = harness(&[("w1", &["compute"])], Vec::new()).await;
    let render = Arc::new(MockExecutor::returning("render", json!({})));
    let flow = FlowDefinition::new("gpu", vec![StepDefinition::new("render", "render").requires("gpu")]);

    let err = h
        .coordinator(ExecutorConfig::default(), registry(&[("render", &render)]))
        .run(&flow, json!({}))
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::NoEligibleNode(ref id) if id == "render"));
    assert_eq!(render.call_count(), 0);
}

#[tokio::test]
async fn unregistered_step_type_is_rejected() {
    let h = harness(WORKERS, Vec::new()).await;
    let flow = FlowDefinition::new("unknown", vec![StepDefinition::new("a", "teleport")]);

    let err = h
        .coordinator(ExecutorConfig::default(), ExecutorRegistry::new())
        .run(&flow, json!({}))
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::NoExecutor(ref t) if t == "teleport"));
}

#[tokio::test]
async fn invalid_flow_is_rejected_before_any_work() {
    let h = harness(WORKERS, Vec::new()).await;
    let step = Arc::new(MockExecutor::returning("step", json!({})));
    let flow = FlowDefinition::new(
        "cyclic",
        vec![
            StepDefinition::new("x", "step").then("y"),
            StepDefinition::new("y", "step").then("x"),
        ],
    );

    let err = h
        .coordinator(ExecutorConfig::default(), registry(&[("step", &step)]))
        .run(&flow, json!({}))
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::CycleDetected { .. }));
    assert_eq!(step.call_count(), 0);
    assert!(h.services.distributor.pending().await.is_empty());
}

#[test]
fn retry_backoff_saturates_at_the_cap() {
    let config = ExecutorConfig {
        max_retries: 64,
        retry_base_delay_ms: 100,
        retry_max_delay_ms: 5_000,
        ..ExecutorConfig::default()
    };
    assert_eq!(config.retry_delay(1), std::time::Duration::from_millis(100));
    assert_eq!(config.retry_delay(3), std::time::Duration::from_millis(400));
    assert_eq!(config.retry_delay(7), std::time::Duration::from_millis(5_000));
    // Attempts past the width of the multiplier must not overflow.
    for attempt in [33, 64, 65, u32::MAX] {
        assert_eq!(config.retry_delay(attempt), std::time::Duration::from_millis(5_000));
    }
}

// ============================================================
// Consensus gating
// ============================================================

#[tokio::test]
async fn gated_step_waits_for_approval() {
    let h = harness(WORKERS, approve_all(4)).await;
    let pay = Arc::new(MockExecutor::returning("pay", json!({ "amount": 10 })));
    let flow = FlowDefinition::new("payout", vec![StepDefinition::new("pay", "pay").gated()]);

    let outcome = h
        .coordinator(ExecutorConfig::default(), registry(&[("pay", &pay)]))
        .run(&flow, json!({}))
        .await
        .unwrap();

    assert_eq!(
        h.record_kinds(outcome.execution_id).await,
        vec![
            ("pay".to_owned(), RecordKind::StepCompleted),
            ("pay".to_owned(), RecordKind::ConsensusApproved),
            ("$flow".to_owned(), RecordKind::FlowCompleted),
        ]
    );
    assert_eq!(outcome.final_state["steps"]["pay"]["consensus"], "approved");
    assert_eq!(outcome.final_state["steps"]["pay"]["status"], "completed");
}

#[tokio::test]
async fn rejected_gate_fails_the_step() {
    let policies: Vec<Arc<dyn VotePolicy>> = vec![
        Arc::new(ApproveAll),
        Arc::new(FixedVote(VoteChoice::No)),
        Arc::new(FixedVote(VoteChoice::No)),
        Arc::new(FixedVote(VoteChoice::No)),
    ];
    let h = harness(WORKERS, policies).await;
    let pay = Arc::new(MockExecutor::returning("pay", json!({ "amount": 10 })));
    let after = Arc::new(MockExecutor::returning("after", json!({})));
    let flow = FlowDefinition::new(
        "payout",
        vec![
            StepDefinition::new("pay", "pay").gated().then("after"),
            StepDefinition::new("after", "after"),
        ],
    );

    let err = h
        .coordinator(ExecutorConfig::default(), registry(&[("pay", &pay), ("after", &after)]))
        .run(&flow, json!({}))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        EngineError::ConsensusNotReached { ref step_id, status: ProposalStatus::Rejected } if step_id == "pay"
    ));
    assert_eq!(after.call_count(), 0);
}

#[tokio::test]
async fn rejected_gate_can_be_handled() {
    let policies: Vec<Arc<dyn VotePolicy>> = (0..4)
        .map(|_| Arc::new(FixedVote(VoteChoice::No)) as Arc<dyn VotePolicy>)
        .collect();
    let h = harness(WORKERS, policies).await;
    let pay = Arc::new(MockExecutor::returning("pay", json!({})));
    let refund = Arc::new(MockExecutor::returning("refund", json!({})));
    let flow = FlowDefinition::new(
        "payout",
        vec![
            StepDefinition::new("pay", "pay").gated().on_failure("refund"),
            StepDefinition::new("refund", "refund"),
        ],
    );

    let outcome = h
        .coordinator(ExecutorConfig::default(), registry(&[("pay", &pay), ("refund", &refund)]))
        .run(&flow, json!({}))
        .await
        .unwrap();

    assert_eq!(refund.call_count(), 1);
    let kinds = h.record_kinds(outcome.execution_id).await;
    assert!(kinds.contains(&("pay".to_owned(), RecordKind::ConsensusRejected)));
    assert!(!kinds.contains(&("pay".to_owned(), RecordKind::StepFailed)));
    assert_eq!(outcome.final_state["steps"]["pay"]["status"], "rejected");
}

#[tokio::test]
async fn completion_consensus_signs_off_the_execution() {
    let h = harness(WORKERS, approve_all(4)).await;
    let step = Arc::new(MockExecutor::returning("step", json!({})));
    let flow = FlowDefinition::new("signed", vec![StepDefinition::new("a", "step")]);
    let config = ExecutorConfig {
        require_completion_consensus: true,
        ..ExecutorConfig::default()
    };

    let outcome = h
        .coordinator(config, registry(&[("step", &step)]))
        .run(&flow, json!({}))
        .await
        .unwrap();

    assert_eq!(outcome.status, FlowStatus::Completed);
}

// ============================================================
// Replication and announcements
// ============================================================

#[tokio::test]
async fn replica_converges_through_state_sync() {
    let h = harness(WORKERS, Vec::new()).await;
    let replica = Arc::new(
        CrdtSynchronizer::new(NodeId::from("replica"), CrdtConfig::default(), h.blobs.clone())
            .with_bus(h.bus.clone(), Arc::new(Ed25519Signer::from_seed([201u8; 32]))),
    );
    let listener = replica.clone().spawn_listener().await.unwrap();

    let step = Arc::new(MockExecutor::returning("step", json!({ "v": 1 })));
    let flow = FlowDefinition::new(
        "replicated",
        vec![
            StepDefinition::new("a", "step").then("b"),
            StepDefinition::new("b", "step"),
        ],
    );
    let outcome = h
        .coordinator(ExecutorConfig::default(), registry(&[("step", &step)]))
        .run(&flow, json!({}))
        .await
        .unwrap();

    for _ in 0..200 {
        if replica.state(outcome.execution_id).await.as_ref() == Some(&outcome.final_state) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(
        replica.state_hash(outcome.execution_id).await.unwrap(),
        outcome.state_hash
    );
    listener.abort();
}

#[tokio::test]
async fn step_results_are_announced_on_the_bus() {
    let h = harness(WORKERS, Vec::new()).await;
    let mut results = h.bus.subscribe(Topic::ExecutionResult).await;
    let mut dispatches = h.bus.subscribe(Topic::ExecutionDispatch).await;

    let ok = Arc::new(MockExecutor::returning("ok", json!({})));
    let bad = Arc::new(MockExecutor::failing_fatal("bad", "nope"));
    let flow = FlowDefinition::new(
        "announced",
        vec![
            StepDefinition::new("a", "ok").then("b"),
            StepDefinition::new("b", "bad").on_failure("c"),
            StepDefinition::new("c", "ok"),
        ],
    );
    h.coordinator(ExecutorConfig::default(), registry(&[("ok", &ok), ("bad", &bad)]))
        .with_bus(h.bus.clone(), h.signer.clone())
        .run(&flow, json!({}))
        .await
        .unwrap();

    let coordinator_key = h.signer.public_key();
    let mut seen = Vec::new();
    while let Ok(envelope) = results.try_recv() {
        assert!(envelope.verify_from(&coordinator_key));
        let result: StepResult = envelope.decode().unwrap();
        seen.push((result.step_id, result.success));
    }
    assert_eq!(
        seen,
        vec![
            ("a".to_owned(), true),
            ("b".to_owned(), false),
            ("c".to_owned(), true),
        ]
    );

    let mut dispatched = 0;
    while let Ok(envelope) = dispatches.try_recv() {
        assert!(envelope.verify_from(&coordinator_key));
        dispatched += 1;
    }
    assert_eq!(dispatched, 3);
}
