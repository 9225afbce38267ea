//! In-process swarm used by `swarmflow simulate`.
//!
//! Spins up worker nodes that hold every capability the flow asks for, a
//! validator set that approves everything, and runs the flow through a
//! coordinator with an echoing step runtime. Workers and validators publish
//! signed heartbeats for as long as the flow runs.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use consensus::{ApproveAll, ByzantineConsensus, ValidatorAgent};
use engine::{
    CrdtSynchronizer, ExecutionLedger, ExecutionRecord, ExecutorRegistry, FlowCoordinator,
    FlowDefinition, FlowOutcome, SwarmConfig, SwarmServices,
};
use fabric::{
    spawn_heartbeat, Ed25519Signer, LoadReporter, LocalBus, LocalRiskScorer, MemoryBlobStore,
    MessageBus, NodeId, SigningService,
};
use nodes::mock::MockProbe;
use nodes::{
    Capability, CapabilityRegistry, ExecutionContext, NodeCapabilityManifest, NodeError,
    NodeSelector, StepExecutor,
};
use queue::{NodeCapacity, WorkDistributor};
use serde_json::{json, Value};
use tracing::info;

/// Returns the step's config together with where and how it ran.
pub struct EchoExecutor;

#[async_trait]
impl StepExecutor for EchoExecutor {
    async fn execute(&self, payload: Value, ctx: &ExecutionContext) -> Result<Value, NodeError> {
        Ok(json!({
            "step_id": ctx.step_id,
            "node_id": ctx.node_id,
            "attempt": ctx.attempt,
            "config": payload.get("config").cloned().unwrap_or(Value::Null),
        }))
    }
}

pub struct Simulation {
    pub workers: usize,
    pub validators: usize,
    pub config: SwarmConfig,
}

impl Simulation {
    /// Run the flow and return its outcome with the execution's ledger.
    pub async fn run(
        &self,
        flow: &FlowDefinition,
        input: Value,
    ) -> anyhow::Result<(FlowOutcome, Vec<ExecutionRecord>)> {
        let bus: Arc<dyn MessageBus> = Arc::new(LocalBus::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let coordinator = NodeId::from("coordinator");
        let signer = Arc::new(Ed25519Signer::generate());

        let registry = Arc::new(
            CapabilityRegistry::new(
                coordinator.clone(),
                self.config.registry.clone(),
                signer.clone(),
                Arc::new(MockProbe::honest()),
                Arc::new(LocalRiskScorer::default()),
            )
            .with_bus(bus.clone()),
        );
        let selector = Arc::new(
            NodeSelector::new(registry.clone()).with_stale_after(self.config.registry.stale_after()),
        );
        let distributor = Arc::new(WorkDistributor::new(
            coordinator.clone(),
            self.config.distributor.clone(),
            signer.clone(),
            bus.clone(),
        ));
        let consensus = Arc::new(ByzantineConsensus::new(
            coordinator.clone(),
            self.config.consensus.clone(),
            signer.clone(),
            bus.clone(),
        ));
        let services = SwarmServices {
            ledger: Arc::new(
                ExecutionLedger::new(signer.clone(), blobs.clone())
                    .with_config(self.config.ledger.clone()),
            ),
            state: Arc::new(
                CrdtSynchronizer::new(coordinator.clone(), self.config.crdt.clone(), blobs)
                    .with_bus(bus.clone(), signer.clone()),
            ),
            consensus: consensus.clone(),
            distributor: distributor.clone(),
            selector: selector.clone(),
        };

        // Validators: every replica knows the full set.
        let validator_signers: Vec<(NodeId, Arc<Ed25519Signer>)> = (0..self.validators)
            .map(|i| (NodeId::from(format!("validator-{i}")), Arc::new(Ed25519Signer::generate())))
            .collect();
        let mut handles = Vec::new();
        for (node, signer) in &validator_signers {
            let replica = Arc::new(ByzantineConsensus::new(
                node.clone(),
                self.config.consensus.clone(),
                signer.clone(),
                bus.clone(),
            ));
            for (peer, peer_signer) in &validator_signers {
                replica
                    .register_validator(peer.clone(), peer_signer.public_key(), 1.0)
                    .await;
            }
            handles.push(replica.spawn_heartbeat());
            handles.push(ValidatorAgent::new(replica, Arc::new(ApproveAll)).spawn().await);
        }
        for (node, signer) in &validator_signers {
            consensus
                .register_validator(node.clone(), signer.public_key(), 1.0)
                .await;
        }
        handles.push(consensus.clone().spawn_listener().await);
        handles.push(consensus.clone().spawn_watchdog());
        handles.push(selector.clone().spawn_heartbeat_listener(bus.clone()).await);

        // Workers hold every capability the flow requires.
        let capabilities: BTreeSet<&str> = flow
            .steps
            .iter()
            .flat_map(|s| s.requirements.iter().map(String::as_str))
            .collect();
        let now = Utc::now();
        for i in 0..self.workers {
            let node = NodeId::from(format!("worker-{i}"));
            let worker_signer = Arc::new(Ed25519Signer::generate());
            let manifest = NodeCapabilityManifest::new(
                node.clone(),
                capabilities.iter().map(|c| Capability::new(*c, 100.0)).collect(),
                now - Duration::minutes(1),
                now + Duration::hours(24),
            )
            .signed(worker_signer.as_ref())?;
            registry
                .register_capability_manifest(manifest)
                .await
                .with_context(|| format!("registering {node}"))?;
            distributor
                .register_node(NodeCapacity::new(
                    node.clone(),
                    capabilities.iter().map(|c| (*c).to_owned()).collect(),
                ))
                .await?;

            // Seed the selector synchronously; the heartbeat task keeps it fresh.
            if let Some(heartbeat) = distributor.sample(&node).await {
                selector.record_heartbeat(&heartbeat);
            }
            let verification = registry.verify_node_capabilities(&node).await?;
            selector.apply_verification(&verification);
            handles.push(spawn_heartbeat(
                node,
                worker_signer,
                bus.clone(),
                distributor.clone(),
                self.config.registry.heartbeat_interval(),
            ));
        }
        info!(workers = self.workers, validators = self.validators, "simulated swarm ready");

        let executors: ExecutorRegistry = flow
            .steps
            .iter()
            .map(|s| (s.step_type.clone(), Arc::new(EchoExecutor) as Arc<dyn StepExecutor>))
            .collect();
        let ledger = services.ledger.clone();
        let coordinator = FlowCoordinator::new(
            coordinator,
            self.config.executor.clone(),
            executors,
            services,
        )
        .with_bus(bus, signer);

        let result = coordinator.run(flow, input).await;
        for handle in handles {
            handle.abort();
        }
        let outcome = result?;
        let records = ledger.records(outcome.execution_id).await;
        Ok((outcome, records))
    }
}
