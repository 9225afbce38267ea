//! Byzantine Consensus Engine.
//!
//! Each node runs a replica. Proposals and ballots travel over the consensus
//! topic; every replica tallies the ballots it sees and reaches the same
//! decision. A proposal moves `Pending → Prepared → Approved`, or ends as
//! `Rejected` or `Timeout`.
//!
//! Ballots are idempotent by vote id. A second ballot with a different id
//! from the same node in the same phase is Byzantine: the node is excluded
//! and its ballots are withdrawn from every open tally.
//!
//! Vote weight is paid for out of a per-proposal credit budget, so a busy
//! validator never runs dry. Decided proposals and ballots for proposals that
//! never arrive are pruned by the watchdog.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use fabric::{
    spawn_heartbeat, Envelope, Heartbeat, IdleLoad, MessageBus, MessagePriority, NodeId,
    SigningService, Topic,
};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{quorum, ConsensusConfig, TieBreaker};
use crate::types::{
    ByzantineBehavior, ByzantineDetection, ConsensusMessage, ConsensusPhase, ConsensusProposal,
    ConsensusVote, ProposalStatus, ProposalType, ValidatorNode, ValidatorStatus, VoteChoice,
    VoteOutcome,
};
use crate::ConsensusError;

struct ProposalEntry {
    proposal: ConsensusProposal,
    /// Every ballot accepted per (node, phase), across both phases.
    ballots: HashMap<(NodeId, ConsensusPhase), ConsensusVote>,
    /// Commit ballots that arrived while this replica was still in prepare.
    deferred: Vec<ConsensusVote>,
    /// Credits each validator has spent on this proposal.
    spent: HashMap<NodeId, f64>,
    status_tx: watch::Sender<ProposalStatus>,
}

impl ProposalEntry {
    fn new(proposal: ConsensusProposal) -> Self {
        let (status_tx, _) = watch::channel(proposal.status);
        Self {
            proposal,
            ballots: HashMap::new(),
            deferred: Vec::new(),
            spent: HashMap::new(),
            status_tx,
        }
    }
}

#[derive(Default)]
struct ConsensusState {
    validators: HashMap<NodeId, ValidatorNode>,
    proposals: HashMap<Uuid, ProposalEntry>,
    /// Ballots for proposals this replica has not seen yet, with arrival time.
    orphan_votes: HashMap<Uuid, Vec<(DateTime<Utc>, ConsensusVote)>>,
    detections: Vec<ByzantineDetection>,
}

type Outbox = Vec<ConsensusMessage>;

pub struct ByzantineConsensus {
    node_id: NodeId,
    config: ConsensusConfig,
    signer: Arc<dyn SigningService>,
    bus: Arc<dyn MessageBus>,
    state: Mutex<ConsensusState>,
}

impl ByzantineConsensus {
    pub fn new(
        node_id: NodeId,
        config: ConsensusConfig,
        signer: Arc<dyn SigningService>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        Self {
            node_id,
            config,
            signer,
            bus,
            state: Mutex::new(ConsensusState::default()),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn public_key(&self) -> String {
        self.signer.public_key()
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Validator set
    // -----------------------------------------------------------------------

    pub async fn register_validator(
        &self,
        node_id: NodeId,
        public_key: String,
        weight: f64,
    ) -> ValidatorNode {
        let mut validator = ValidatorNode::new(node_id.clone(), public_key);
        validator.weight = weight.max(0.0);
        validator.credits = self.config.vote_credits;
        self.state
            .lock()
            .await
            .validators
            .insert(node_id.clone(), validator.clone());
        info!(%node_id, weight, "validator registered");
        validator
    }

    pub async fn validator(&self, node_id: &NodeId) -> Option<ValidatorNode> {
        self.state.lock().await.validators.get(node_id).cloned()
    }

    pub async fn active_validator_count(&self) -> usize {
        self.state
            .lock()
            .await
            .validators
            .values()
            .filter(|v| v.is_active())
            .count()
    }

    pub async fn record_heartbeat(&self, node_id: &NodeId, at: DateTime<Utc>) {
        if let Some(v) = self.state.lock().await.validators.get_mut(node_id) {
            if at > v.last_heartbeat {
                v.last_heartbeat = at;
            }
            v.heartbeat_flagged = false;
        }
    }

    /// Manual reinstatement is the only way out of `Byzantine`.
    pub async fn reinstate_validator(&self, node_id: &NodeId) -> Result<(), ConsensusError> {
        let mut state = self.state.lock().await;
        let v = state
            .validators
            .get_mut(node_id)
            .ok_or_else(|| ConsensusError::UnknownValidator(node_id.clone()))?;
        v.status = ValidatorStatus::Active;
        v.heartbeat_flagged = false;
        info!(%node_id, "validator reinstated");
        Ok(())
    }

    pub async fn detections(&self) -> Vec<ByzantineDetection> {
        self.state.lock().await.detections.clone()
    }

    // -----------------------------------------------------------------------
    // Proposals
    // -----------------------------------------------------------------------

    pub async fn propose(
        &self,
        proposal_type: ProposalType,
        data: Value,
        timeout: Option<Duration>,
        required_votes: Option<usize>,
    ) -> Result<ConsensusProposal, ConsensusError> {
        self.propose_at(proposal_type, data, timeout, required_votes, Utc::now())
            .await
    }

    /// Open a proposal and broadcast it. The quorum defaults to ⌊2n/3⌋+1 of
    /// the currently active validators.
    #[instrument(skip(self, data, timeout, required_votes), fields(node_id = %self.node_id))]
    pub async fn propose_at(
        &self,
        proposal_type: ProposalType,
        data: Value,
        timeout: Option<Duration>,
        required_votes: Option<usize>,
        now: DateTime<Utc>,
    ) -> Result<ConsensusProposal, ConsensusError> {
        let mut outbox = Outbox::new();
        let proposal = {
            let mut state = self.state.lock().await;
            let active = state.validators.values().filter(|v| v.is_active()).count();
            if active == 0 {
                return Err(ConsensusError::NoActiveValidators);
            }
            let proposal = ConsensusProposal {
                proposal_id: Uuid::new_v4(),
                proposal_type,
                data,
                proposer: self.node_id.clone(),
                created_at: now,
                deadline: now + timeout.unwrap_or_else(|| self.config.default_timeout()),
                required_votes: required_votes.unwrap_or_else(|| quorum(active)).max(1),
                phase: ConsensusPhase::Prepare,
                status: ProposalStatus::Pending,
                votes: Vec::new(),
                decided_at: None,
            };
            outbox.push(ConsensusMessage::Proposal {
                proposal: proposal.clone(),
            });
            self.insert_proposal(&mut state, proposal.clone(), now, &mut outbox);
            proposal
        };
        info!(
            proposal_id = %proposal.proposal_id,
            required_votes = proposal.required_votes,
            deadline = %proposal.deadline,
            "proposal opened"
        );
        self.publish(outbox).await?;
        Ok(proposal)
    }

    fn insert_proposal(
        &self,
        state: &mut ConsensusState,
        proposal: ConsensusProposal,
        now: DateTime<Utc>,
        outbox: &mut Outbox,
    ) {
        let proposal_id = proposal.proposal_id;
        state.proposals.insert(proposal_id, ProposalEntry::new(proposal));
        if let Some(orphans) = state.orphan_votes.remove(&proposal_id) {
            for (_, vote) in orphans {
                if let Err(e) = self.apply_vote(state, vote, now, outbox) {
                    debug!(%proposal_id, error = %e, "buffered ballot rejected");
                }
            }
        }
    }

    /// Credits `node_id` has spent on `proposal_id` so far.
    pub async fn credits_spent(&self, proposal_id: Uuid, node_id: &NodeId) -> Option<f64> {
        let state = self.state.lock().await;
        let entry = state.proposals.get(&proposal_id)?;
        Some(entry.spent.get(node_id).copied().unwrap_or(0.0))
    }

    pub async fn proposal(&self, proposal_id: Uuid) -> Option<ConsensusProposal> {
        self.state
            .lock()
            .await
            .proposals
            .get(&proposal_id)
            .map(|e| e.proposal.clone())
    }

    /// Open proposals on which `node_id` has not voted in the current phase.
    pub async fn awaiting_vote(&self, node_id: &NodeId) -> Vec<ConsensusProposal> {
        let state = self.state.lock().await;
        if !state.validators.get(node_id).is_some_and(|v| v.is_active()) {
            return Vec::new();
        }
        let mut open: Vec<ConsensusProposal> = state
            .proposals
            .values()
            .filter(|e| !e.proposal.status.is_terminal())
            .filter(|e| !e.ballots.contains_key(&(node_id.clone(), e.proposal.phase)))
            .map(|e| e.proposal.clone())
            .collect();
        open.sort_by_key(|p| p.created_at);
        open
    }

    // -----------------------------------------------------------------------
    // Voting
    // -----------------------------------------------------------------------

    /// Sign and submit this node's ballot for the proposal's current phase,
    /// then broadcast it.
    pub async fn cast_vote(
        &self,
        proposal_id: Uuid,
        choice: VoteChoice,
    ) -> Result<VoteOutcome, ConsensusError> {
        let phase = self
            .proposal(proposal_id)
            .await
            .ok_or(ConsensusError::ProposalNotFound(proposal_id))?
            .phase;
        let vote = ConsensusVote::new(
            proposal_id,
            self.node_id.clone(),
            phase,
            choice,
            self.config.default_vote_weight,
        )
        .signed(self.signer.as_ref())?;

        let outcome = self.vote_on_proposal(vote.clone()).await?;
        if matches!(outcome, VoteOutcome::Counted(_) | VoteOutcome::Deferred) {
            self.publish(vec![ConsensusMessage::Vote { vote }]).await?;
        }
        Ok(outcome)
    }

    /// Arbitrate one ballot.
    #[instrument(skip(self, vote), fields(proposal_id = %vote.proposal_id, voter = %vote.node_id, phase = ?vote.phase))]
    pub async fn vote_on_proposal(&self, vote: ConsensusVote) -> Result<VoteOutcome, ConsensusError> {
        self.vote_on_proposal_at(vote, Utc::now()).await
    }

    pub async fn vote_on_proposal_at(
        &self,
        vote: ConsensusVote,
        now: DateTime<Utc>,
    ) -> Result<VoteOutcome, ConsensusError> {
        let mut outbox = Outbox::new();
        let outcome = {
            let mut state = self.state.lock().await;
            self.apply_vote(&mut state, vote, now, &mut outbox)
        };
        self.publish(outbox).await?;
        outcome
    }

    fn apply_vote(
        &self,
        state: &mut ConsensusState,
        vote: ConsensusVote,
        now: DateTime<Utc>,
        outbox: &mut Outbox,
    ) -> Result<VoteOutcome, ConsensusError> {
        let node_id = vote.node_id.clone();
        let proposal_id = vote.proposal_id;

        let validator = state
            .validators
            .get(&node_id)
            .ok_or_else(|| ConsensusError::UnknownValidator(node_id.clone()))?;
        if !validator.is_active() {
            return Err(ConsensusError::NotActiveValidator(node_id));
        }
        if !vote.verify(&validator.public_key) {
            self.penalize_signature(state, &vote, now);
            return Err(ConsensusError::InvalidSignature(node_id));
        }
        let max_weight = validator.weight;
        let credits = validator.credits;

        if !state.proposals.contains_key(&proposal_id) {
            let buffered: usize = state.orphan_votes.values().map(Vec::len).sum();
            if buffered >= self.config.max_orphan_votes {
                warn!(buffered, "ballot buffer full");
                return Err(ConsensusError::OrphanBufferFull(proposal_id));
            }
            debug!("ballot for unknown proposal buffered");
            state
                .orphan_votes
                .entry(proposal_id)
                .or_default()
                .push((now, vote));
            return Ok(VoteOutcome::Deferred);
        }
        let Some(entry) = state.proposals.get_mut(&proposal_id) else {
            return Err(ConsensusError::ProposalNotFound(proposal_id));
        };

        let key = (node_id.clone(), vote.phase);
        if let Some(previous) = entry.ballots.get(&key) {
            if previous.vote_id == vote.vote_id {
                return Ok(VoteOutcome::Duplicate);
            }
            let behavior = if previous.choice == vote.choice {
                ByzantineBehavior::DoubleVoting
            } else {
                ByzantineBehavior::ConflictingVotes
            };
            let evidence = json!({
                "proposal_id": proposal_id,
                "phase": vote.phase,
                "first": previous,
                "second": vote,
            });
            self.exclude(state, &node_id, behavior, evidence, now);
            return Err(ConsensusError::DoubleVote {
                node_id,
                proposal_id,
            });
        }

        if entry.proposal.status.is_terminal() {
            debug!(status = ?entry.proposal.status, "ballot after decision ignored");
            return Ok(VoteOutcome::Closed);
        }
        if vote.phase != entry.proposal.phase {
            return match vote.phase {
                ConsensusPhase::Commit => {
                    entry.deferred.push(vote);
                    Ok(VoteOutcome::Deferred)
                }
                ConsensusPhase::Prepare => {
                    // Kept so a later conflicting prepare ballot is still caught.
                    entry.ballots.insert(key, vote);
                    Ok(VoteOutcome::Closed)
                }
            };
        }

        if !vote.weight.is_finite() || vote.weight <= 0.0 {
            return Err(ConsensusError::InvalidWeight {
                node_id,
                weight: vote.weight,
            });
        }
        let counted_weight = vote.weight.min(max_weight);
        let cost = self.config.vote_cost.cost(counted_weight);
        let available = (credits - entry.spent.get(&node_id).copied().unwrap_or(0.0)).max(0.0);
        if cost > available + f64::EPSILON {
            return Err(ConsensusError::InsufficientCredits {
                node_id,
                cost,
                available,
            });
        }
        *entry.spent.entry(node_id.clone()).or_insert(0.0) += cost;

        let mut counted = vote.clone();
        counted.weight = counted_weight;
        entry.ballots.insert(key, vote);
        entry.proposal.votes.push(counted);
        debug!(
            votes = entry.proposal.votes.len(),
            required = entry.proposal.required_votes,
            "ballot counted"
        );

        let decision = self.tally(&entry.proposal, &state.validators);
        if let Some(approved) = decision {
            self.advance(state, proposal_id, approved, now, outbox);
        }
        let status = state
            .proposals
            .get(&proposal_id)
            .map(|e| e.proposal.status)
            .ok_or(ConsensusError::ProposalNotFound(proposal_id))?;
        Ok(VoteOutcome::Counted(status))
    }

    /// `Some(approved)` once the current phase has a quorum of ballots.
    fn tally(
        &self,
        proposal: &ConsensusProposal,
        validators: &HashMap<NodeId, ValidatorNode>,
    ) -> Option<bool> {
        if proposal.votes.len() < proposal.required_votes {
            return None;
        }
        let (yes, no) = proposal.weighted_totals();
        if (yes - no).abs() > f64::EPSILON {
            return Some(yes > no);
        }
        Some(match self.config.tie_breaker {
            TieBreaker::Approve => true,
            TieBreaker::Reject => false,
            TieBreaker::ReputationWeighted => {
                let reputation = |choice: VoteChoice| -> f64 {
                    proposal
                        .votes
                        .iter()
                        .filter(|v| v.choice == choice)
                        .filter_map(|v| validators.get(&v.node_id))
                        .map(|v| v.reputation)
                        .sum()
                };
                reputation(VoteChoice::Yes) >= reputation(VoteChoice::No)
            }
        })
    }

    fn advance(
        &self,
        state: &mut ConsensusState,
        proposal_id: Uuid,
        approved: bool,
        now: DateTime<Utc>,
        outbox: &mut Outbox,
    ) {
        let Some(entry) = state.proposals.get_mut(&proposal_id) else {
            return;
        };

        if approved && entry.proposal.phase == ConsensusPhase::Prepare {
            entry.proposal.phase = ConsensusPhase::Commit;
            entry.proposal.status = ProposalStatus::Prepared;
            entry.proposal.votes.clear();
            entry.status_tx.send_replace(ProposalStatus::Prepared);
            info!(%proposal_id, "prepare phase approved, entering commit");

            let deferred = std::mem::take(&mut entry.deferred);
            for vote in deferred {
                if let Err(e) = self.apply_vote(state, vote, now, outbox) {
                    debug!(%proposal_id, error = %e, "deferred commit ballot rejected");
                }
            }
            return;
        }

        let status = if approved {
            ProposalStatus::Approved
        } else {
            ProposalStatus::Rejected
        };
        self.finalize(entry, status, now, outbox);
    }

    fn finalize(
        &self,
        entry: &mut ProposalEntry,
        status: ProposalStatus,
        now: DateTime<Utc>,
        outbox: &mut Outbox,
    ) {
        entry.proposal.status = status;
        entry.proposal.decided_at = Some(now);
        entry.status_tx.send_replace(status);

        let (yes, no) = entry.proposal.weighted_totals();
        let proposal_id = entry.proposal.proposal_id;
        match status {
            ProposalStatus::Approved => info!(%proposal_id, yes, no, "proposal approved"),
            _ => warn!(%proposal_id, ?status, phase = ?entry.proposal.phase, yes, no, "proposal not approved"),
        }

        if entry.proposal.proposer == self.node_id {
            outbox.push(ConsensusMessage::Decision {
                proposal_id,
                status,
            });
        }
    }

    // -----------------------------------------------------------------------
    // Byzantine detection
    // -----------------------------------------------------------------------

    fn record_detection(
        &self,
        state: &mut ConsensusState,
        node_id: &NodeId,
        behavior: ByzantineBehavior,
        evidence: Value,
        action: String,
        now: DateTime<Utc>,
    ) -> ByzantineDetection {
        let detection = ByzantineDetection {
            detection_id: Uuid::new_v4(),
            node_id: node_id.clone(),
            behavior,
            severity: behavior.severity(),
            evidence,
            action,
            detected_at: now,
        };
        warn!(
            %node_id,
            ?behavior,
            severity = ?detection.severity,
            evidence = %detection.evidence,
            action = %detection.action,
            "byzantine behaviour detected"
        );
        state.detections.push(detection.clone());
        detection
    }

    fn exclude(
        &self,
        state: &mut ConsensusState,
        node_id: &NodeId,
        behavior: ByzantineBehavior,
        evidence: Value,
        now: DateTime<Utc>,
    ) {
        if let Some(v) = state.validators.get_mut(node_id) {
            v.status = ValidatorStatus::Byzantine;
        }
        let mut withdrawn = 0;
        for entry in state
            .proposals
            .values_mut()
            .filter(|e| !e.proposal.status.is_terminal())
        {
            let before = entry.proposal.votes.len();
            entry.proposal.votes.retain(|v| &v.node_id != node_id);
            withdrawn += before - entry.proposal.votes.len();
        }
        error!(%node_id, withdrawn, "validator excluded");
        self.record_detection(
            state,
            node_id,
            behavior,
            evidence,
            format!("excluded, {withdrawn} ballot(s) withdrawn"),
            now,
        );
    }

    fn penalize_signature(&self, state: &mut ConsensusState, vote: &ConsensusVote, now: DateTime<Utc>) {
        let penalty = self.config.signature_penalty.clamp(0.0, 1.0);
        if let Some(v) = state.validators.get_mut(&vote.node_id) {
            v.reputation = (v.reputation - penalty).max(0.0);
            v.weight *= 1.0 - penalty;
        }
        let evidence = json!({
            "vote_id": vote.vote_id,
            "proposal_id": vote.proposal_id,
            "signature": vote.signature,
        });
        self.record_detection(
            state,
            &vote.node_id,
            ByzantineBehavior::InvalidSignature,
            evidence,
            format!("reputation and weight reduced by {penalty}"),
            now,
        );
    }

    /// Flag active validators silent past the heartbeat timeout. Each silence
    /// is reported once.
    pub async fn check_heartbeats(&self, now: DateTime<Utc>) -> Vec<ByzantineDetection> {
        let timeout = self.config.heartbeat_timeout();
        let mut state = self.state.lock().await;
        let stale: Vec<(NodeId, DateTime<Utc>)> = state
            .validators
            .values()
            .filter(|v| v.is_active() && !v.heartbeat_flagged)
            .filter(|v| now - v.last_heartbeat > timeout)
            .map(|v| (v.node_id.clone(), v.last_heartbeat))
            .collect();

        let mut detections = Vec::with_capacity(stale.len());
        for (node_id, last_heartbeat) in stale {
            if let Some(v) = state.validators.get_mut(&node_id) {
                v.heartbeat_flagged = true;
            }
            let evidence = json!({
                "last_heartbeat": last_heartbeat,
                "silent_ms": (now - last_heartbeat).num_milliseconds(),
            });
            detections.push(self.record_detection(
                &mut state,
                &node_id,
                ByzantineBehavior::Timeout,
                evidence,
                "flagged".into(),
                now,
            ));
        }
        detections
    }

    // -----------------------------------------------------------------------
    // Deadlines
    // -----------------------------------------------------------------------

    /// Finalize every open proposal whose deadline has passed.
    pub async fn check_timeouts(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, ConsensusError> {
        let mut outbox = Outbox::new();
        let expired = {
            let mut state = self.state.lock().await;
            let mut expired = Vec::new();
            for entry in state.proposals.values_mut() {
                if !entry.proposal.status.is_terminal() && entry.proposal.deadline <= now {
                    expired.push(entry.proposal.proposal_id);
                    self.finalize(entry, ProposalStatus::Timeout, now, &mut outbox);
                }
            }
            expired
        };
        self.publish(outbox).await?;
        Ok(expired)
    }

    /// Drop proposals decided longer than the retention window ago and
    /// buffered ballots older than the orphan TTL. Returns how many of each
    /// were dropped.
    pub async fn prune(&self, now: DateTime<Utc>) -> (usize, usize) {
        let retention = self.config.decided_retention();
        let ttl = self.config.orphan_vote_ttl();
        let mut state = self.state.lock().await;

        let before = state.proposals.len();
        state.proposals.retain(|_, e| {
            !(e.proposal.status.is_terminal()
                && e.proposal.decided_at.is_some_and(|t| now - t >= retention))
        });
        let proposals = before - state.proposals.len();

        let mut orphans = 0;
        state.orphan_votes.retain(|_, votes| {
            let held = votes.len();
            votes.retain(|(received, _)| now - *received < ttl);
            orphans += held - votes.len();
            !votes.is_empty()
        });

        if proposals + orphans > 0 {
            debug!(proposals, orphans, "consensus state pruned");
        }
        (proposals, orphans)
    }

    /// Wait until the proposal reaches a terminal status. The deadline is
    /// enforced here as well, so this returns even without a watchdog.
    pub async fn await_decision(&self, proposal_id: Uuid) -> Result<ProposalStatus, ConsensusError> {
        let (mut rx, deadline) = {
            let state = self.state.lock().await;
            let entry = state
                .proposals
                .get(&proposal_id)
                .ok_or(ConsensusError::ProposalNotFound(proposal_id))?;
            (entry.status_tx.subscribe(), entry.proposal.deadline)
        };

        loop {
            let status = *rx.borrow_and_update();
            if status.is_terminal() {
                return Ok(status);
            }
            let remaining = (deadline - Utc::now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO);
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(remaining) => {
                    self.check_timeouts(Utc::now()).await?;
                }
            }
        }

        self.proposal(proposal_id)
            .await
            .map(|p| p.status)
            .ok_or(ConsensusError::ProposalNotFound(proposal_id))
    }

    // -----------------------------------------------------------------------
    // Networking
    // -----------------------------------------------------------------------

    async fn publish(&self, messages: Outbox) -> Result<(), ConsensusError> {
        for message in messages {
            let envelope = Envelope::with_payload(Topic::Consensus, self.node_id.clone(), &message)?
                .with_priority(MessagePriority::High)
                .signed(self.signer.as_ref())?;
            self.bus.publish(envelope).await?;
        }
        Ok(())
    }

    /// Ingest one envelope from the consensus or heartbeat topic. Unsigned
    /// envelopes are rejected before anything is decoded.
    pub async fn handle_message(&self, envelope: &Envelope) -> Result<(), ConsensusError> {
        if !envelope.verify() {
            return Err(ConsensusError::InvalidSignature(envelope.sender.clone()));
        }
        if envelope.topic == Topic::Heartbeat {
            return self.handle_heartbeat(envelope).await;
        }

        match envelope.decode::<ConsensusMessage>()? {
            ConsensusMessage::Proposal { mut proposal } => {
                if proposal.proposer != envelope.sender {
                    return Err(ConsensusError::InvalidSignature(envelope.sender.clone()));
                }
                let mut outbox = Outbox::new();
                {
                    let mut state = self.state.lock().await;
                    if state.proposals.contains_key(&proposal.proposal_id) {
                        return Ok(());
                    }
                    // Replicas tally from the ballots they see themselves.
                    proposal.phase = ConsensusPhase::Prepare;
                    proposal.status = ProposalStatus::Pending;
                    proposal.votes.clear();
                    proposal.decided_at = None;
                    debug!(proposal_id = %proposal.proposal_id, proposer = %proposal.proposer, "replicating proposal");
                    self.insert_proposal(&mut state, proposal, Utc::now(), &mut outbox);
                }
                self.publish(outbox).await
            }
            ConsensusMessage::Vote { vote } => self.vote_on_proposal(vote).await.map(|_| ()),
            ConsensusMessage::Decision {
                proposal_id,
                status,
            } => {
                let local = self.proposal(proposal_id).await.map(|p| p.status);
                match local {
                    Some(local) if local.is_terminal() && local != status => {
                        warn!(%proposal_id, ?local, remote = ?status, "replica decision diverges from proposer");
                    }
                    _ => debug!(%proposal_id, ?status, "proposer decision received"),
                }
                Ok(())
            }
        }
    }

    /// A heartbeat counts only when it is signed with the key the validator
    /// registered. Heartbeats from non-validators are ignored.
    async fn handle_heartbeat(&self, envelope: &Envelope) -> Result<(), ConsensusError> {
        let heartbeat: Heartbeat = envelope.decode()?;
        if heartbeat.node_id != envelope.sender {
            return Err(ConsensusError::InvalidSignature(envelope.sender.clone()));
        }
        let key = self
            .state
            .lock()
            .await
            .validators
            .get(&heartbeat.node_id)
            .map(|v| v.public_key.clone());
        match key {
            Some(key) if envelope.verify_from(&key) => {
                self.record_heartbeat(&heartbeat.node_id, heartbeat.sent_at)
                    .await;
                Ok(())
            }
            Some(_) => Err(ConsensusError::InvalidSignature(heartbeat.node_id)),
            None => Ok(()),
        }
    }

    pub async fn subscribe_consensus(&self) -> mpsc::Receiver<Envelope> {
        self.bus.subscribe(Topic::Consensus).await
    }

    /// Subscribe to the consensus and heartbeat topics and feed every
    /// envelope to [`handle_message`](Self::handle_message).
    pub async fn spawn_listener(self: Arc<Self>) -> JoinHandle<()> {
        let mut consensus = self.bus.subscribe(Topic::Consensus).await;
        let mut heartbeats = self.bus.subscribe(Topic::Heartbeat).await;
        tokio::spawn(async move {
            loop {
                let envelope = tokio::select! {
                    Some(e) = consensus.recv() => e,
                    Some(e) = heartbeats.recv() => e,
                    else => break,
                };
                if let Err(e) = self.handle_message(&envelope).await {
                    debug!(sender = %envelope.sender, error = %e, "consensus message rejected");
                }
            }
        })
    }

    /// Publish this node's own heartbeat so peers see it as live.
    pub fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let period = std::time::Duration::from_millis(self.config.heartbeat_interval_ms.max(1));
        spawn_heartbeat(
            self.node_id.clone(),
            self.signer.clone(),
            self.bus.clone(),
            Arc::new(IdleLoad),
            period,
        )
    }

    /// Periodically enforce deadlines and heartbeat staleness, and prune
    /// finished state.
    pub fn spawn_watchdog(self: Arc<Self>) -> JoinHandle<()> {
        let period = std::time::Duration::from_millis(self.config.watchdog_interval_ms.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let now = Utc::now();
                if let Err(e) = self.check_timeouts(now).await {
                    warn!(error = %e, "timeout sweep failed");
                }
                self.check_heartbeats(now).await;
                self.prune(now).await;
            }
        })
    }
}
