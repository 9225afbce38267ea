//! Flow coordination.
//!
//! `FlowCoordinator` is the central orchestrator of an execution:
//! 1. Validates the flow graph and produces a topological ordering.
//! 2. Walks the ordering, running every step activated by an incoming edge.
//! 3. Publishes each step as work, picks a verified node and claims for it.
//! 4. Runs the step through its `StepExecutor`, retrying retryable errors.
//! 5. Records the outcome in the execution ledger and the shared state.
//! 6. Holds consensus-gated results until validators approve them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use consensus::{ByzantineConsensus, ProposalStatus, ProposalType};
use fabric::{ContentHash, Envelope, MessageBus, MessagePriority, NodeId, SigningService, Topic};
use nodes::{
    ExecutionContext, NodeError, NodeSelector, SelectionCriteria, SelectionStrategy, StepExecutor,
};
use queue::{WorkDistributor, WorkItem, WorkRequirements, WorkSubmission};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::crdt::{CrdtSynchronizer, OperationSpec};
use crate::dag::{entry_steps, validate_flow};
use crate::ledger::ExecutionLedger;
use crate::models::{FlowDefinition, PartialRecord, RecordKind, StepDefinition};
use crate::EngineError;

/// Output key under which a step may return state operations to apply.
pub const STATE_DELTA_KEY: &str = "state_delta";

/// Step id used for flow-level ledger records and proposals.
const FLOW_STEP: &str = "$flow";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Maximum number of times a retryable step failure will be retried.
    pub max_retries: u32,
    /// Base delay for exponential back-off between retries.
    pub retry_base_delay_ms: u64,
    /// Upper bound on a single back-off delay.
    pub retry_max_delay_ms: u64,
    /// Candidates tried before a step gives up on claiming.
    pub max_claim_attempts: usize,
    pub selection_strategy: SelectionStrategy,
    pub max_risk_score: Option<f64>,
    /// Falls back to the consensus engine default.
    pub consensus_timeout_ms: Option<u64>,
    /// Ask validators to sign off on the whole execution before it completes.
    pub require_completion_consensus: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 30_000,
            max_claim_attempts: 3,
            selection_strategy: SelectionStrategy::WeightedScore,
            max_risk_score: None,
            consensus_timeout_ms: None,
            require_completion_consensus: false,
        }
    }
}

impl ExecutorConfig {
    /// Back-off before retry number `attempt` (1-based): the base delay
    /// doubled per earlier attempt, capped at `retry_max_delay_ms`.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        let ms = self
            .retry_base_delay_ms
            .saturating_mul(factor)
            .min(self.retry_max_delay_ms);
        Duration::from_millis(ms)
    }

    fn consensus_timeout(&self) -> Option<chrono::Duration> {
        self.consensus_timeout_ms
            .map(|ms| chrono::Duration::milliseconds(ms as i64))
    }
}

// ---------------------------------------------------------------------------
// Executor registry and collaborators
// ---------------------------------------------------------------------------

/// Maps `step_type` strings to `StepExecutor` implementations.
pub type ExecutorRegistry = HashMap<String, Arc<dyn StepExecutor>>;

/// The swarm services a coordinator drives.
#[derive(Clone)]
pub struct SwarmServices {
    pub ledger: Arc<ExecutionLedger>,
    pub state: Arc<CrdtSynchronizer>,
    pub consensus: Arc<ByzantineConsensus>,
    pub distributor: Arc<WorkDistributor>,
    pub selector: Arc<NodeSelector>,
}

// ---------------------------------------------------------------------------
// Wire messages
// ---------------------------------------------------------------------------

/// Published on the execution-dispatch topic when a step starts on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDispatch {
    pub execution_id: Uuid,
    pub step_id: String,
    pub work_id: Uuid,
    pub node_id: NodeId,
}

/// Published on the execution-result topic once a step outcome is recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub execution_id: Uuid,
    pub step_id: String,
    pub node_id: NodeId,
    pub success: bool,
    pub record_hash: ContentHash,
}

// ---------------------------------------------------------------------------
// Output of an execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Completed,
    /// Completed after one or more failures were handled by `on_failure` edges.
    Recovered,
}

/// The result of running a full flow.
#[derive(Debug, Clone)]
pub struct FlowOutcome {
    pub execution_id: Uuid,
    pub status: FlowStatus,
    /// Output of every step that succeeded.
    pub outputs: HashMap<String, Value>,
    /// Steps that failed and were handled by an `on_failure` edge.
    pub failed_steps: Vec<String>,
    /// Steps no edge activated.
    pub skipped_steps: Vec<String>,
    /// Number of ledger records written for the execution.
    pub records: usize,
    pub ledger_head: Option<ContentHash>,
    pub state_hash: ContentHash,
    pub final_state: Value,
}

// ---------------------------------------------------------------------------
// FlowCoordinator
// ---------------------------------------------------------------------------

/// Runs flows across the swarm on behalf of one node.
pub struct FlowCoordinator {
    node_id: NodeId,
    config: ExecutorConfig,
    executors: ExecutorRegistry,
    services: SwarmServices,
    bus: Option<(Arc<dyn MessageBus>, Arc<dyn SigningService>)>,
}

impl FlowCoordinator {
    pub fn new(
        node_id: NodeId,
        config: ExecutorConfig,
        executors: ExecutorRegistry,
        services: SwarmServices,
    ) -> Self {
        Self {
            node_id,
            config,
            executors,
            services,
            bus: None,
        }
    }

    /// Announce dispatches and results on the bus, signed with `signer`.
    pub fn with_bus(mut self, bus: Arc<dyn MessageBus>, signer: Arc<dyn SigningService>) -> Self {
        self.bus = Some((bus, signer));
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn services(&self) -> &SwarmServices {
        &self.services
    }

    /// Run the flow to completion.
    ///
    /// # Errors
    /// Returns `EngineError` for validation failures, unhandled step
    /// failures, rejected consensus, or problems in the lower layers. The
    /// ledger records the failure before the error is returned.
    #[instrument(skip(self, flow, input), fields(flow_id = %flow.id, node_id = %self.node_id))]
    pub async fn run(&self, flow: &FlowDefinition, input: Value) -> Result<FlowOutcome, EngineError> {
        let order = validate_flow(flow)?;
        let execution_id = Uuid::new_v4();
        info!(%execution_id, steps = order.len(), "flow validated, starting execution");

        let step_map: HashMap<&str, &StepDefinition> =
            flow.steps.iter().map(|s| (s.id.as_str(), s)).collect();
        let mut predecessors: HashMap<&str, Vec<&str>> = HashMap::new();
        for step in &flow.steps {
            for next in step.on_success.iter().chain(&step.on_failure) {
                predecessors
                    .entry(next.as_str())
                    .or_default()
                    .push(step.id.as_str());
            }
        }

        self.services
            .state
            .apply_operation(execution_id, OperationSpec::set("input", input.clone()))
            .await?;

        let mut active: HashSet<String> = entry_steps(flow).into_iter().collect();
        let mut outputs: HashMap<String, Value> = HashMap::new();
        let mut failed_steps = Vec::new();
        let mut skipped_steps = Vec::new();

        for step_id in &order {
            let Some(step) = step_map.get(step_id.as_str()).copied() else {
                continue;
            };
            if !active.contains(step_id) {
                debug!(step_id = %step_id, "no incoming edge fired, skipping");
                self.set_step_status(execution_id, step_id, "skipped").await?;
                skipped_steps.push(step_id.clone());
                continue;
            }

            let upstream: Map<String, Value> = predecessors
                .get(step_id.as_str())
                .into_iter()
                .flatten()
                .filter_map(|p| outputs.get(*p).map(|o| ((*p).to_owned(), o.clone())))
                .collect();
            let payload = json!({
                "input": input,
                "config": step.config,
                "upstream": upstream,
            });

            match self.run_step(flow.id, execution_id, step, payload).await {
                Ok(output) => {
                    active.extend(step.on_success.iter().cloned());
                    outputs.insert(step_id.clone(), output);
                }
                Err(e) if is_step_failure(&e) && !step.on_failure.is_empty() => {
                    warn!(step_id = %step_id, error = %e, "step failed, following on_failure edges");
                    active.extend(step.on_failure.iter().cloned());
                    failed_steps.push(step_id.clone());
                }
                Err(e) => {
                    error!(step_id = %step_id, error = %e, "step failed, aborting execution");
                    self.finish_failed(execution_id, &e).await;
                    return Err(e);
                }
            }
        }

        if self.config.require_completion_consensus {
            if let Err(e) = self.confirm_completion(flow, execution_id).await {
                self.finish_failed(execution_id, &e).await;
                return Err(e);
            }
        }

        self.services
            .ledger
            .append_record(PartialRecord {
                execution_id,
                step_id: FLOW_STEP.to_owned(),
                kind: RecordKind::FlowCompleted,
                node_id: self.node_id.clone(),
                payload: json!({
                    "flow_id": flow.id,
                    "completed": order.iter().filter(|id| outputs.contains_key(*id)).collect::<Vec<_>>(),
                    "failed": failed_steps,
                }),
            })
            .await?;
        self.services
            .state
            .apply_operation(execution_id, OperationSpec::set("status", json!("completed")))
            .await?;

        let records = self.services.ledger.validate_ledger(execution_id).await?;
        let outcome = FlowOutcome {
            execution_id,
            status: if failed_steps.is_empty() {
                FlowStatus::Completed
            } else {
                FlowStatus::Recovered
            },
            outputs,
            failed_steps,
            skipped_steps,
            records,
            ledger_head: self.services.ledger.head(execution_id).await,
            state_hash: self.services.state.state_hash(execution_id).await?,
            final_state: self
                .services
                .state
                .state(execution_id)
                .await
                .unwrap_or(Value::Null),
        };
        info!(%execution_id, records, "flow execution completed");
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Internal: one step, end to end.
    // -----------------------------------------------------------------------

    #[instrument(skip(self, step, payload), fields(execution_id = %execution_id, step_id = %step.id))]
    async fn run_step(
        &self,
        flow_id: Uuid,
        execution_id: Uuid,
        step: &StepDefinition,
        payload: Value,
    ) -> Result<Value, EngineError> {
        let executor = self
            .executors
            .get(&step.step_type)
            .cloned()
            .ok_or_else(|| EngineError::NoExecutor(step.step_type.clone()))?;

        // The coordinator retries in place, so the distributor must not
        // re-announce a failed item behind its back.
        let item = self
            .services
            .distributor
            .submit_work(WorkSubmission {
                execution_id,
                step_id: step.id.clone(),
                priority: step.priority,
                requirements: WorkRequirements {
                    capabilities: step.requirements.clone(),
                },
                payload: payload.clone(),
                max_retries: Some(0),
            })
            .await?;

        let node = self.claim(&item, step).await?;
        self.services
            .distributor
            .start_processing(item.work_id, &node)
            .await?;
        self.announce(
            Topic::ExecutionDispatch,
            &StepDispatch {
                execution_id,
                step_id: step.id.clone(),
                work_id: item.work_id,
                node_id: node.clone(),
            },
        )
        .await;

        let ctx = ExecutionContext {
            flow_id,
            execution_id,
            step_id: step.id.clone(),
            node_id: node.clone(),
            attempt: 1,
        };
        let result = match self
            .execute_with_retry(&step.id, executor.as_ref(), payload, ctx)
            .await
        {
            Ok(output) => self.settle_success(execution_id, step, &node, output).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(output) => {
                self.services
                    .distributor
                    .complete_work(item.work_id, &node, output.clone())
                    .await?;
                info!(node_id = %node, "step succeeded");
                Ok(output)
            }
            Err(e) => {
                if let Err(queue_err) = self
                    .services
                    .distributor
                    .fail_work(item.work_id, &node, e.to_string())
                    .await
                {
                    warn!(error = %queue_err, "could not mark work failed");
                }
                // Consensus rejections were already written to the ledger.
                if !matches!(e, EngineError::ConsensusNotReached { .. }) {
                    self.record_failure(execution_id, step, &node, &e).await?;
                }
                Err(e)
            }
        }
    }

    /// Record a successful execution and, for gated steps, wait for approval.
    async fn settle_success(
        &self,
        execution_id: Uuid,
        step: &StepDefinition,
        node: &NodeId,
        output: Value,
    ) -> Result<Value, EngineError> {
        let record = self
            .services
            .ledger
            .append_record(PartialRecord {
                execution_id,
                step_id: step.id.clone(),
                kind: RecordKind::StepCompleted,
                node_id: node.clone(),
                payload: json!({ "output": output }),
            })
            .await?;

        let state = &self.services.state;
        let prefix = format!("steps.{}", step.id);
        state
            .apply_operation(execution_id, OperationSpec::set(format!("{prefix}.node"), json!(node)))
            .await?;
        state
            .apply_operation(execution_id, OperationSpec::set(format!("{prefix}.output"), output.clone()))
            .await?;
        state
            .apply_operation(execution_id, OperationSpec::increment("progress.completed", 1.0))
            .await?;
        for spec in state_delta(&output)? {
            state.apply_operation(execution_id, spec).await?;
        }

        if step.consensus_gated {
            self.gate(execution_id, step, node, &output).await?;
        }

        self.set_step_status(execution_id, &step.id, "completed").await?;
        self.announce(
            Topic::ExecutionResult,
            &StepResult {
                execution_id,
                step_id: step.id.clone(),
                node_id: node.clone(),
                success: true,
                record_hash: record.record_hash,
            },
        )
        .await;
        Ok(output)
    }

    async fn record_failure(
        &self,
        execution_id: Uuid,
        step: &StepDefinition,
        node: &NodeId,
        cause: &EngineError,
    ) -> Result<(), EngineError> {
        let record = self
            .services
            .ledger
            .append_record(PartialRecord {
                execution_id,
                step_id: step.id.clone(),
                kind: RecordKind::StepFailed,
                node_id: node.clone(),
                payload: json!({ "error": cause.to_string() }),
            })
            .await?;
        self.services
            .state
            .apply_operation(execution_id, OperationSpec::increment("progress.failed", 1.0))
            .await?;
        self.set_step_status(execution_id, &step.id, "failed").await?;
        self.announce(
            Topic::ExecutionResult,
            &StepResult {
                execution_id,
                step_id: step.id.clone(),
                node_id: node.clone(),
                success: false,
                record_hash: record.record_hash,
            },
        )
        .await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internal: node selection and claiming.
    // -----------------------------------------------------------------------

    async fn claim(&self, item: &WorkItem, step: &StepDefinition) -> Result<NodeId, EngineError> {
        let mut criteria = SelectionCriteria {
            required_capabilities: step.requirements.clone(),
            max_risk_score: self.config.max_risk_score,
            strategy: self.config.selection_strategy,
            ..SelectionCriteria::default()
        };

        for _ in 0..self.config.max_claim_attempts.max(1) {
            let Some(node) = self.services.selector.select_node(&criteria) else {
                break;
            };
            if self.services.distributor.claim_work(item.work_id, &node).await {
                debug!(node_id = %node, "claimed");
                return Ok(node);
            }
            debug!(node_id = %node, "claim refused, trying next candidate");
            criteria.exclude.push(node);
        }

        if criteria.exclude.is_empty() {
            Err(EngineError::NoEligibleNode(step.id.clone()))
        } else {
            Err(EngineError::ClaimRejected(step.id.clone()))
        }
    }

    // -----------------------------------------------------------------------
    // Internal: consensus.
    // -----------------------------------------------------------------------

    async fn gate(
        &self,
        execution_id: Uuid,
        step: &StepDefinition,
        node: &NodeId,
        output: &Value,
    ) -> Result<(), EngineError> {
        let proposal = self
            .services
            .consensus
            .propose(
                ProposalType::ResourceMutation,
                json!({
                    "execution_id": execution_id,
                    "step_id": step.id,
                    "node_id": node,
                    "output_hash": ContentHash::of_json(output)?,
                }),
                self.config.consensus_timeout(),
                None,
            )
            .await?;
        let status = self
            .services
            .consensus
            .await_decision(proposal.proposal_id)
            .await?;
        info!(proposal_id = %proposal.proposal_id, ?status, "gated step decided");

        let approved = status == ProposalStatus::Approved;
        self.services
            .ledger
            .append_record(PartialRecord {
                execution_id,
                step_id: step.id.clone(),
                kind: if approved {
                    RecordKind::ConsensusApproved
                } else {
                    RecordKind::ConsensusRejected
                },
                node_id: self.node_id.clone(),
                payload: json!({ "proposal_id": proposal.proposal_id, "status": status }),
            })
            .await?;
        self.services
            .state
            .apply_operation(
                execution_id,
                OperationSpec::set(format!("steps.{}.consensus", step.id), json!(status)),
            )
            .await?;

        if approved {
            Ok(())
        } else {
            self.set_step_status(execution_id, &step.id, "rejected").await?;
            Err(EngineError::ConsensusNotReached {
                step_id: step.id.clone(),
                status,
            })
        }
    }

    async fn confirm_completion(&self, flow: &FlowDefinition, execution_id: Uuid) -> Result<(), EngineError> {
        let ledger_head = self.services.ledger.head(execution_id).await;
        let state_hash = self.services.state.state_hash(execution_id).await?;
        let proposal = self
            .services
            .consensus
            .propose(
                ProposalType::FlowCompletion,
                json!({
                    "flow_id": flow.id,
                    "execution_id": execution_id,
                    "ledger_head": ledger_head,
                    "state_hash": state_hash,
                }),
                self.config.consensus_timeout(),
                None,
            )
            .await?;
        let status = self
            .services
            .consensus
            .await_decision(proposal.proposal_id)
            .await?;
        info!(proposal_id = %proposal.proposal_id, ?status, "completion decided");

        if status == ProposalStatus::Approved {
            Ok(())
        } else {
            Err(EngineError::ConsensusNotReached {
                step_id: FLOW_STEP.to_owned(),
                status,
            })
        }
    }

    // -----------------------------------------------------------------------
    // Internal: bookkeeping.
    // -----------------------------------------------------------------------

    async fn set_step_status(&self, execution_id: Uuid, step_id: &str, status: &str) -> Result<(), EngineError> {
        self.services
            .state
            .apply_operation(
                execution_id,
                OperationSpec::set(format!("steps.{step_id}.status"), json!(status)),
            )
            .await?;
        Ok(())
    }

    /// Best effort: the execution already failed, so errors here only log.
    async fn finish_failed(&self, execution_id: Uuid, cause: &EngineError) {
        let appended = self
            .services
            .ledger
            .append_record(PartialRecord {
                execution_id,
                step_id: FLOW_STEP.to_owned(),
                kind: RecordKind::FlowFailed,
                node_id: self.node_id.clone(),
                payload: json!({ "error": cause.to_string() }),
            })
            .await;
        if let Err(e) = appended {
            warn!(%execution_id, error = %e, "could not record flow failure");
        }
        if let Err(e) = self
            .services
            .state
            .apply_operation(execution_id, OperationSpec::set("status", json!("failed")))
            .await
        {
            warn!(%execution_id, error = %e, "could not record failed status");
        }
    }

    async fn announce<T: Serialize>(&self, topic: Topic, message: &T) {
        let Some((bus, signer)) = &self.bus else {
            return;
        };
        let envelope = Envelope::with_payload(topic, self.node_id.clone(), message)
            .and_then(|envelope| envelope.with_priority(MessagePriority::Low).signed(signer.as_ref()));
        let envelope = match envelope {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(%topic, error = %e, "could not encode announcement");
                return;
            }
        };
        if let Err(e) = bus.publish(envelope).await {
            warn!(%topic, error = %e, "announcement not published");
        }
    }

    // -----------------------------------------------------------------------
    // Internal: execute a single step with retry logic.
    // -----------------------------------------------------------------------

    async fn execute_with_retry(
        &self,
        step_id: &str,
        executor: &dyn StepExecutor,
        payload: Value,
        mut ctx: ExecutionContext,
    ) -> Result<Value, EngineError> {
        let mut attempts = 0u32;

        loop {
            ctx.attempt = attempts + 1;
            match executor.execute(payload.clone(), &ctx).await {
                Ok(output) => return Ok(output),

                Err(NodeError::Fatal(msg)) => {
                    return Err(EngineError::StepFatal {
                        step_id: step_id.to_owned(),
                        message: msg,
                    });
                }

                Err(NodeError::Retryable(msg)) => {
                    attempts += 1;
                    if attempts > self.config.max_retries {
                        return Err(EngineError::StepRetryExhausted {
                            step_id: step_id.to_owned(),
                            message: msg,
                        });
                    }

                    let delay = self.config.retry_delay(attempts);

                    warn!(
                        "step '{}' retryable error (attempt {}/{}), retrying in {:?}: {}",
                        step_id, attempts, self.config.max_retries, delay, msg
                    );

                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Failures an `on_failure` edge may handle. Anything else is a fault in the
/// swarm itself and aborts the execution.
fn is_step_failure(error: &EngineError) -> bool {
    matches!(
        error,
        EngineError::StepFatal { .. }
            | EngineError::StepRetryExhausted { .. }
            | EngineError::ConsensusNotReached { .. }
    )
}

/// State operations a step asked for in its output.
fn state_delta(output: &Value) -> Result<Vec<OperationSpec>, EngineError> {
    match output.get(STATE_DELTA_KEY) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(raw) => Ok(serde_json::from_value(raw.clone())?),
    }
}
