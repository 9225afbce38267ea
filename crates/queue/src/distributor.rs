//! Fair Work Distributor.
//!
//! Pending items wait in four priority lanes ordered by arrival. A claim is
//! arbitrated under the distributor lock: the item must still be pending, the
//! node must have spare capacity and the required capabilities, and its token
//! bucket must cover the priority's cost. Unclaimed items are re-announced
//! with exponential backoff until they run out of attempts and expire.
//! Finished items are kept for a retention window, then dropped.
//!
//! Every broadcast is signed with the distributor's key.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use fabric::{
    Envelope, Heartbeat, LoadReporter, MessageBus, MessagePriority, NodeId, SigningService, Topic,
};
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::DistributorConfig;
use crate::models::{
    NodeCapacity, WorkAnnouncement, WorkClaimNotice, WorkItem, WorkOutcome, WorkPriority,
    WorkStatus, WorkSubmission,
};
use crate::token_bucket::TokenBucket;
use crate::workload::NodeWorkload;
use crate::QueueError;

struct NodeEntry {
    capacity: NodeCapacity,
    bucket: TokenBucket,
    workload: NodeWorkload,
}

#[derive(Default)]
struct DistributorState {
    items: HashMap<Uuid, WorkItem>,
    lanes: [VecDeque<Uuid>; 4],
    nodes: HashMap<NodeId, NodeEntry>,
}

impl DistributorState {
    /// Insert into the item's lane keeping arrival order.
    fn enqueue(&mut self, work_id: Uuid) {
        let Some(item) = self.items.get(&work_id) else {
            return;
        };
        let lane_idx = item.effective_priority.lane();
        let enqueued_at = item.enqueued_at;
        let items = &self.items;
        let lane = &mut self.lanes[lane_idx];
        let pos = lane
            .iter()
            .position(|id| items.get(id).is_some_and(|other| other.enqueued_at > enqueued_at))
            .unwrap_or(lane.len());
        lane.insert(pos, work_id);
    }

    fn dequeue(&mut self, work_id: &Uuid) {
        for lane in &mut self.lanes {
            lane.retain(|id| id != work_id);
        }
    }
}

/// Messages queued under the lock and published after it is released.
type Outbox = Vec<(Topic, Value, MessagePriority)>;

pub struct WorkDistributor {
    node_id: NodeId,
    config: DistributorConfig,
    signer: Arc<dyn SigningService>,
    bus: Arc<dyn MessageBus>,
    state: Mutex<DistributorState>,
}

impl WorkDistributor {
    pub fn new(
        node_id: NodeId,
        config: DistributorConfig,
        signer: Arc<dyn SigningService>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self {
            node_id,
            config,
            signer,
            bus,
            state: Mutex::new(DistributorState::default()),
        }
    }

    pub fn config(&self) -> &DistributorConfig {
        &self.config
    }

    /// Backoff for reannouncement number `attempt + 1`, with jitter.
    fn announce_delay(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay_ms(attempt);
        let jitter = self.config.jitter_ratio.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter)
        } else {
            1.0
        };
        Duration::milliseconds((base * factor).round() as i64)
    }

    async fn publish_all(&self, outbox: Outbox) -> Result<(), QueueError> {
        for (topic, data, priority) in outbox {
            let envelope = Envelope::new(topic, self.node_id.clone(), data)
                .with_priority(priority)
                .signed(self.signer.as_ref())?;
            self.bus.publish(envelope).await?;
        }
        Ok(())
    }

    fn message<T: Serialize>(
        outbox: &mut Outbox,
        topic: Topic,
        payload: &T,
        priority: MessagePriority,
    ) -> Result<(), QueueError> {
        outbox.push((topic, serde_json::to_value(payload).map_err(fabric::FabricError::from)?, priority));
        Ok(())
    }

    fn bus_priority(priority: WorkPriority) -> MessagePriority {
        match priority {
            WorkPriority::Critical => MessagePriority::Critical,
            WorkPriority::High => MessagePriority::High,
            WorkPriority::Normal => MessagePriority::Normal,
            WorkPriority::Low => MessagePriority::Low,
        }
    }

    // -----------------------------------------------------------------------
    // Nodes
    // -----------------------------------------------------------------------

    /// Register or update a node's capacity. The token bucket and workload
    /// survive updates.
    pub async fn register_node(&self, capacity: NodeCapacity) -> Result<(), QueueError> {
        self.register_node_at(capacity, Utc::now()).await
    }

    pub async fn register_node_at(
        &self,
        capacity: NodeCapacity,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let mut outbox = Outbox::new();
        {
            let mut state = self.state.lock().await;
            match state.nodes.get_mut(&capacity.node_id) {
                Some(entry) => entry.capacity = capacity.clone(),
                None => {
                    state.nodes.insert(
                        capacity.node_id.clone(),
                        NodeEntry {
                            capacity: capacity.clone(),
                            bucket: TokenBucket::new(
                                self.config.bucket_capacity,
                                self.config.refill_per_sec,
                                now,
                            ),
                            workload: NodeWorkload::default(),
                        },
                    );
                }
            }
            Self::message(&mut outbox, Topic::NodeCapacity, &capacity, MessagePriority::Low)?;
        }
        debug!(node_id = %capacity.node_id, "node capacity registered");
        self.publish_all(outbox).await
    }

    pub async fn update_node_usage(&self, node_id: &NodeId, cpu_usage: f64, memory_usage: f64) {
        if let Some(entry) = self.state.lock().await.nodes.get_mut(node_id) {
            entry.capacity.cpu_usage = cpu_usage;
            entry.capacity.memory_usage = memory_usage;
        }
    }

    pub async fn workload(&self, node_id: &NodeId) -> Option<NodeWorkload> {
        self.state
            .lock()
            .await
            .nodes
            .get(node_id)
            .map(|e| e.workload.clone())
    }

    pub async fn tokens(&self, node_id: &NodeId) -> Option<f64> {
        self.state
            .lock()
            .await
            .nodes
            .get(node_id)
            .map(|e| e.bucket.tokens())
    }

    // -----------------------------------------------------------------------
    // Submission & claiming
    // -----------------------------------------------------------------------

    pub async fn submit_work(&self, submission: WorkSubmission) -> Result<WorkItem, QueueError> {
        self.submit_work_at(submission, Utc::now()).await
    }

    /// Enqueue an item, announce it and arm its reannounce timer.
    #[instrument(skip(self, submission), fields(step_id = %submission.step_id, priority = ?submission.priority))]
    pub async fn submit_work_at(
        &self,
        submission: WorkSubmission,
        now: DateTime<Utc>,
    ) -> Result<WorkItem, QueueError> {
        let item = WorkItem {
            work_id: Uuid::new_v4(),
            execution_id: submission.execution_id,
            step_id: submission.step_id,
            priority: submission.priority,
            effective_priority: submission.priority,
            requirements: submission.requirements,
            payload: submission.payload,
            status: WorkStatus::Pending,
            claimed_by: None,
            claimed_at: None,
            retries_remaining: submission
                .max_retries
                .unwrap_or(self.config.default_max_retries),
            announce_attempts: 0,
            next_announce_at: Some(now + self.announce_delay(0)),
            enqueued_at: now,
            last_boosted_at: None,
            last_error: None,
            finished_at: None,
        };

        let mut outbox = Outbox::new();
        {
            let mut state = self.state.lock().await;
            state.items.insert(item.work_id, item.clone());
            state.enqueue(item.work_id);
            Self::message(
                &mut outbox,
                Topic::WorkAvailable,
                &WorkAnnouncement::from(&item),
                Self::bus_priority(item.priority),
            )?;
        }
        info!(work_id = %item.work_id, "work submitted");
        self.publish_all(outbox).await?;
        Ok(item)
    }

    pub async fn claim_work(&self, work_id: Uuid, node_id: &NodeId) -> bool {
        self.claim_work_at(work_id, node_id, Utc::now()).await
    }

    /// Try to give `work_id` to `node_id`. Returns `false` on any contention
    /// or capacity outcome; nothing is consumed unless the claim succeeds.
    #[instrument(skip(self), fields(work_id = %work_id, node_id = %node_id))]
    pub async fn claim_work_at(&self, work_id: Uuid, node_id: &NodeId, now: DateTime<Utc>) -> bool {
        let mut outbox = Outbox::new();
        {
            let mut state = self.state.lock().await;
            let (cost, requirements) = match state.items.get(&work_id) {
                Some(item) if item.status == WorkStatus::Pending => {
                    (item.priority.token_cost(), item.requirements.capabilities.clone())
                }
                Some(item) => {
                    debug!(status = ?item.status, "claim rejected: item not pending");
                    return false;
                }
                None => {
                    debug!("claim rejected: unknown item");
                    return false;
                }
            };

            let Some(entry) = state.nodes.get_mut(node_id) else {
                debug!("claim rejected: node not registered");
                return false;
            };
            let max_jobs = entry
                .capacity
                .max_concurrent_jobs
                .min(self.config.max_concurrent_jobs);
            if entry.workload.active_jobs >= max_jobs
                || entry.capacity.cpu_usage >= self.config.cpu_threshold
                || entry.capacity.memory_usage >= self.config.memory_threshold
            {
                debug!(
                    active_jobs = entry.workload.active_jobs,
                    cpu = entry.capacity.cpu_usage,
                    memory = entry.capacity.memory_usage,
                    "claim rejected: node over capacity"
                );
                return false;
            }
            if !requirements
                .iter()
                .all(|c| entry.capacity.capabilities.contains(c))
            {
                debug!("claim rejected: missing capabilities");
                return false;
            }
            if !entry.bucket.try_consume(cost, now) {
                debug!(cost, tokens = entry.bucket.tokens(), "claim rejected: rate limited");
                return false;
            }
            entry.workload.record_claim();

            state.dequeue(&work_id);
            if let Some(item) = state.items.get_mut(&work_id) {
                item.status = WorkStatus::Claimed;
                item.claimed_by = Some(node_id.clone());
                item.claimed_at = Some(now);
                item.next_announce_at = None;
            }
            let notice = WorkClaimNotice {
                work_id,
                node_id: node_id.clone(),
                claimed_at: now,
            };
            if let Err(e) = Self::message(&mut outbox, Topic::WorkClaim, &notice, MessagePriority::High) {
                warn!(error = %e, "could not encode claim notice");
            }
        }

        info!("work claimed");
        if let Err(e) = self.publish_all(outbox).await {
            warn!(error = %e, "claim notice not published");
        }
        true
    }

    pub async fn start_processing(&self, work_id: Uuid, node_id: &NodeId) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let item = state
            .items
            .get_mut(&work_id)
            .ok_or(QueueError::WorkNotFound(work_id))?;
        if item.claimed_by.as_ref() != Some(node_id) {
            return Err(QueueError::NotClaimant {
                work_id,
                node_id: node_id.clone(),
            });
        }
        if item.status != WorkStatus::Claimed {
            return Err(QueueError::InvalidTransition {
                work_id,
                status: item.status,
            });
        }
        item.status = WorkStatus::Processing;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Outcomes
    // -----------------------------------------------------------------------

    pub async fn complete_work(
        &self,
        work_id: Uuid,
        node_id: &NodeId,
        result: Value,
    ) -> Result<WorkItem, QueueError> {
        self.complete_work_at(work_id, node_id, result, Utc::now()).await
    }

    #[instrument(skip(self, result), fields(work_id = %work_id, node_id = %node_id))]
    pub async fn complete_work_at(
        &self,
        work_id: Uuid,
        node_id: &NodeId,
        result: Value,
        now: DateTime<Utc>,
    ) -> Result<WorkItem, QueueError> {
        let mut outbox = Outbox::new();
        let item = {
            let mut state = self.state.lock().await;
            let item = Self::held_by(&mut state, work_id, node_id)?;
            item.status = WorkStatus::Completed;
            item.finished_at = Some(now);
            let elapsed_ms = item
                .claimed_at
                .map(|t| (now - t).num_milliseconds().max(0) as f64)
                .unwrap_or(0.0);
            let item = item.clone();

            if let Some(entry) = state.nodes.get_mut(node_id) {
                entry.workload.record_completion(elapsed_ms);
            }
            let outcome = WorkOutcome {
                work_id,
                node_id: node_id.clone(),
                status: WorkStatus::Completed,
                result: Some(result),
                error: None,
            };
            Self::message(&mut outbox, Topic::WorkResult, &outcome, MessagePriority::Normal)?;
            item
        };
        info!("work completed");
        self.publish_all(outbox).await?;
        Ok(item)
    }

    pub async fn fail_work(
        &self,
        work_id: Uuid,
        node_id: &NodeId,
        reason: impl Into<String>,
    ) -> Result<WorkItem, QueueError> {
        self.fail_work_at(work_id, node_id, reason.into(), Utc::now()).await
    }

    /// Record a failure. Items with retry budget left go back to pending and
    /// are re-announced from the first backoff step.
    #[instrument(skip(self, reason), fields(work_id = %work_id, node_id = %node_id))]
    pub async fn fail_work_at(
        &self,
        work_id: Uuid,
        node_id: &NodeId,
        reason: String,
        now: DateTime<Utc>,
    ) -> Result<WorkItem, QueueError> {
        let mut outbox = Outbox::new();
        let item = {
            let mut state = self.state.lock().await;
            Self::held_by(&mut state, work_id, node_id)?;
            self.record_failure(&mut state, work_id, node_id, reason, now, &mut outbox)?
        };
        self.publish_all(outbox).await?;
        Ok(item)
    }

    fn held_by<'a>(
        state: &'a mut DistributorState,
        work_id: Uuid,
        node_id: &NodeId,
    ) -> Result<&'a mut WorkItem, QueueError> {
        let item = state
            .items
            .get_mut(&work_id)
            .ok_or(QueueError::WorkNotFound(work_id))?;
        if !matches!(item.status, WorkStatus::Claimed | WorkStatus::Processing) {
            return Err(QueueError::InvalidTransition {
                work_id,
                status: item.status,
            });
        }
        if item.claimed_by.as_ref() != Some(node_id) {
            return Err(QueueError::NotClaimant {
                work_id,
                node_id: node_id.clone(),
            });
        }
        Ok(item)
    }

    fn record_failure(
        &self,
        state: &mut DistributorState,
        work_id: Uuid,
        node_id: &NodeId,
        reason: String,
        now: DateTime<Utc>,
        outbox: &mut Outbox,
    ) -> Result<WorkItem, QueueError> {
        if let Some(entry) = state.nodes.get_mut(node_id) {
            entry.workload.record_failure();
        }

        let next_announce = now + self.announce_delay(0);
        let item = state
            .items
            .get_mut(&work_id)
            .ok_or(QueueError::WorkNotFound(work_id))?;
        item.claimed_by = None;
        item.claimed_at = None;
        item.last_error = Some(reason.clone());

        let requeue = item.retries_remaining > 0;
        if requeue {
            item.retries_remaining -= 1;
            item.status = WorkStatus::Pending;
            item.announce_attempts = 0;
            item.next_announce_at = Some(next_announce);
            warn!(%work_id, %node_id, retries_remaining = item.retries_remaining, %reason, "work failed, returned to pending");
        } else {
            item.status = WorkStatus::Failed;
            item.next_announce_at = None;
            item.finished_at = Some(now);
            warn!(%work_id, %node_id, %reason, "work failed, retry budget exhausted");
        }
        let item = item.clone();
        if requeue {
            state.enqueue(work_id);
        }

        let outcome = WorkOutcome {
            work_id,
            node_id: node_id.clone(),
            status: item.status,
            result: None,
            error: Some(reason),
        };
        Self::message(outbox, Topic::WorkResult, &outcome, MessagePriority::Normal)?;
        Ok(item)
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    /// Re-announce due pending items, expire those out of attempts, and fail
    /// claims that outlived the claim timeout. Returns the number of
    /// reannouncements.
    #[instrument(skip(self))]
    pub async fn process_reannouncements(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut outbox = Outbox::new();
        let mut announced = 0;
        {
            let mut state = self.state.lock().await;

            let timed_out: Vec<(Uuid, NodeId)> = state
                .items
                .values()
                .filter(|i| matches!(i.status, WorkStatus::Claimed | WorkStatus::Processing))
                .filter(|i| i.claimed_at.is_some_and(|t| now - t >= self.config.claim_timeout()))
                .filter_map(|i| i.claimed_by.clone().map(|n| (i.work_id, n)))
                .collect();
            for (work_id, node_id) in timed_out {
                warn!(%work_id, %node_id, "claim timed out");
                self.record_failure(&mut state, work_id, &node_id, "claim timed out".into(), now, &mut outbox)?;
            }

            let due: Vec<Uuid> = state
                .items
                .values()
                .filter(|i| i.status == WorkStatus::Pending)
                .filter(|i| i.next_announce_at.is_some_and(|t| t <= now))
                .map(|i| i.work_id)
                .collect();

            for work_id in due {
                let attempts = state.items.get(&work_id).map(|i| i.announce_attempts).unwrap_or(0);
                if attempts >= self.config.max_announce_attempts {
                    state.dequeue(&work_id);
                    if let Some(item) = state.items.get_mut(&work_id) {
                        item.status = WorkStatus::Expired;
                        item.next_announce_at = None;
                        item.finished_at = Some(now);
                        warn!(%work_id, attempts, "work expired without a claim");
                        let outcome = WorkOutcome {
                            work_id,
                            node_id: self.node_id.clone(),
                            status: WorkStatus::Expired,
                            result: None,
                            error: Some("no claim before announce attempts ran out".into()),
                        };
                        Self::message(&mut outbox, Topic::WorkResult, &outcome, MessagePriority::Normal)?;
                    }
                    continue;
                }

                let delay = self.announce_delay(attempts + 1);
                if let Some(item) = state.items.get_mut(&work_id) {
                    item.announce_attempts += 1;
                    item.next_announce_at = Some(now + delay);
                    debug!(%work_id, attempt = item.announce_attempts, "re-announcing work");
                    Self::message(
                        &mut outbox,
                        Topic::WorkAvailable,
                        &WorkAnnouncement::from(&*item),
                        Self::bus_priority(item.effective_priority),
                    )?;
                    announced += 1;
                }
            }
        }
        self.publish_all(outbox).await?;
        Ok(announced)
    }

    /// Boost pending items that have waited past the starvation threshold by
    /// one priority level. Returns the number of boosted items.
    #[instrument(skip(self))]
    pub async fn rebalance(&self, now: DateTime<Utc>) -> usize {
        let threshold = self.config.starvation_threshold();
        let mut state = self.state.lock().await;

        let starved: Vec<Uuid> = state
            .items
            .values()
            .filter(|i| i.status == WorkStatus::Pending)
            .filter(|i| now - i.last_boosted_at.unwrap_or(i.enqueued_at) > threshold)
            .filter(|i| i.effective_priority.boosted().is_some())
            .map(|i| i.work_id)
            .collect();

        for work_id in &starved {
            state.dequeue(work_id);
            if let Some(item) = state.items.get_mut(work_id) {
                if let Some(next) = item.effective_priority.boosted() {
                    info!(%work_id, from = ?item.effective_priority, to = ?next, "boosting starved work");
                    item.effective_priority = next;
                    item.last_boosted_at = Some(now);
                }
            }
            state.enqueue(*work_id);
        }
        starved.len()
    }

    /// Drop finished items older than the retention window. Returns the
    /// number dropped.
    pub async fn prune_finished(&self, now: DateTime<Utc>) -> usize {
        let retention = self.config.finished_retention();
        let mut state = self.state.lock().await;
        let before = state.items.len();
        state.items.retain(|_, item| {
            !(item.status.is_terminal() && item.finished_at.is_some_and(|t| now - t >= retention))
        });
        let dropped = before - state.items.len();
        if dropped > 0 {
            debug!(dropped, "finished work pruned");
        }
        dropped
    }

    /// Spawn the background loop driving reannouncement, rebalance and
    /// pruning.
    pub fn spawn_scheduler(self: Arc<Self>) -> JoinHandle<()> {
        let period = std::time::Duration::from_millis(self.config.scheduler_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let now = Utc::now();
                if let Err(e) = self.process_reannouncements(now).await {
                    warn!(error = %e, "reannouncement pass failed");
                }
                self.rebalance(now).await;
                self.prune_finished(now).await;
            }
        })
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn get(&self, work_id: Uuid) -> Option<WorkItem> {
        self.state.lock().await.items.get(&work_id).cloned()
    }

    /// Pending ids in service order: lane by lane, oldest first.
    pub async fn pending(&self) -> Vec<Uuid> {
        let state = self.state.lock().await;
        state.lanes.iter().flatten().copied().collect()
    }

    /// Highest-priority pending item whose requirements `node_id` meets.
    pub async fn next_for_node(&self, node_id: &NodeId) -> Option<WorkItem> {
        let state = self.state.lock().await;
        let entry = state.nodes.get(node_id)?;
        state
            .lanes
            .iter()
            .flatten()
            .filter_map(|id| state.items.get(id))
            .find(|item| {
                item.requirements
                    .capabilities
                    .iter()
                    .all(|c| entry.capacity.capabilities.contains(c))
            })
            .cloned()
    }
}

/// Heartbeat figures for a registered node, from the distributor's view of
/// its capacity and workload. Average execution time stands in for latency.
#[async_trait]
impl LoadReporter for WorkDistributor {
    async fn sample(&self, node_id: &NodeId) -> Option<Heartbeat> {
        let state = self.state.lock().await;
        let entry = state.nodes.get(node_id)?;
        Some(Heartbeat {
            node_id: node_id.clone(),
            cpu_usage: entry.capacity.cpu_usage,
            memory_usage: entry.capacity.memory_usage,
            active_jobs: entry.workload.active_jobs,
            max_jobs: entry
                .capacity
                .max_concurrent_jobs
                .min(self.config.max_concurrent_jobs),
            latency_ms: entry.workload.avg_execution_ms,
            sent_at: Utc::now(),
        })
    }
}
