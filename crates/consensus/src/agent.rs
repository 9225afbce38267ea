//! Auto-voting validator participant.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::engine::ByzantineConsensus;
use crate::types::{ConsensusProposal, VoteChoice};

/// Decides how a validator votes on a proposal in its current phase.
pub trait VotePolicy: Send + Sync {
    fn decide(&self, proposal: &ConsensusProposal) -> VoteChoice;
}

pub struct ApproveAll;

impl VotePolicy for ApproveAll {
    fn decide(&self, _proposal: &ConsensusProposal) -> VoteChoice {
        VoteChoice::Yes
    }
}

/// Always casts the same choice.
pub struct FixedVote(pub VoteChoice);

impl VotePolicy for FixedVote {
    fn decide(&self, _proposal: &ConsensusProposal) -> VoteChoice {
        self.0
    }
}

/// A validator that keeps its own replica in sync from the bus and votes on
/// every open proposal according to its policy.
pub struct ValidatorAgent {
    engine: Arc<ByzantineConsensus>,
    policy: Arc<dyn VotePolicy>,
}

impl ValidatorAgent {
    pub fn new(engine: Arc<ByzantineConsensus>, policy: Arc<dyn VotePolicy>) -> Self {
        Self { engine, policy }
    }

    pub fn engine(&self) -> &Arc<ByzantineConsensus> {
        &self.engine
    }

    /// Vote on everything awaiting this validator. Repeats until nothing is
    /// left, since a ballot may itself advance a proposal into commit.
    pub async fn vote_pending(&self) -> usize {
        let me = self.engine.node_id().clone();
        let mut cast = 0;
        loop {
            let awaiting = self.engine.awaiting_vote(&me).await;
            if awaiting.is_empty() {
                return cast;
            }
            let mut progressed = false;
            for proposal in awaiting {
                let choice = self.policy.decide(&proposal);
                match self.engine.cast_vote(proposal.proposal_id, choice).await {
                    Ok(outcome) => {
                        debug!(node_id = %me, proposal_id = %proposal.proposal_id, ?choice, ?outcome, "ballot cast");
                        cast += 1;
                        progressed = true;
                    }
                    Err(e) => {
                        warn!(node_id = %me, proposal_id = %proposal.proposal_id, error = %e, "could not cast ballot");
                    }
                }
            }
            if !progressed {
                return cast;
            }
        }
    }

    /// Subscribe before spawning so no message published after this call
    /// returns is missed.
    pub async fn spawn(self) -> JoinHandle<()> {
        let bus_rx = self.engine.subscribe_consensus().await;
        tokio::spawn(async move {
            let mut rx = bus_rx;
            while let Some(envelope) = rx.recv().await {
                if let Err(e) = self.engine.handle_message(&envelope).await {
                    debug!(sender = %envelope.sender, error = %e, "consensus message rejected");
                }
                self.vote_pending().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConsensusConfig;
    use crate::types::{ProposalStatus, ProposalType};
    use chrono::Duration;
    use fabric::{Ed25519Signer, LocalBus, MessageBus, NodeId, SigningService};
    use serde_json::json;

    async fn replica(
        bus: &Arc<LocalBus>,
        id: &str,
        seed: u8,
        validators: &[(NodeId, String)],
    ) -> Arc<ByzantineConsensus> {
        let engine = Arc::new(ByzantineConsensus::new(
            NodeId::from(id),
            ConsensusConfig::default(),
            Arc::new(Ed25519Signer::from_seed([seed; 32])),
            bus.clone() as Arc<dyn MessageBus>,
        ));
        for (node, key) in validators {
            engine.register_validator(node.clone(), key.clone(), 1.0).await;
        }
        engine
    }

    async fn swarm(policies: Vec<Arc<dyn VotePolicy>>) -> (Arc<ByzantineConsensus>, Vec<tokio::task::JoinHandle<()>>) {
        let bus = Arc::new(LocalBus::new());
        let validators: Vec<(NodeId, String)> = (0..policies.len())
            .map(|i| {
                let key = Ed25519Signer::from_seed([i as u8 + 1; 32]).public_key();
                (NodeId::from(format!("v{i}")), key)
            })
            .collect();

        let mut handles = Vec::new();
        for (i, policy) in policies.into_iter().enumerate() {
            let engine = replica(&bus, &format!("v{i}"), i as u8 + 1, &validators).await;
            handles.push(ValidatorAgent::new(engine, policy).spawn().await);
        }
        let proposer = replica(&bus, "coordinator", 100, &validators).await;
        handles.push(proposer.clone().spawn_listener().await);
        (proposer, handles)
    }

    #[tokio::test]
    async fn agents_reach_approval_over_the_bus() {
        let policies: Vec<Arc<dyn VotePolicy>> = (0..4).map(|_| Arc::new(ApproveAll) as Arc<dyn VotePolicy>).collect();
        let (proposer, handles) = swarm(policies).await;

        let p = proposer
            .propose(ProposalType::FlowCompletion, json!({"flow": "f"}), Some(Duration::seconds(5)), None)
            .await
            .unwrap();
        assert_eq!(proposer.await_decision(p.proposal_id).await.unwrap(), ProposalStatus::Approved);

        for h in handles {
            h.abort();
        }
    }

    #[tokio::test]
    async fn validator_heartbeats_reach_the_proposer() {
        let bus = Arc::new(LocalBus::new());
        let validators = vec![(
            NodeId::from("v0"),
            Ed25519Signer::from_seed([1u8; 32]).public_key(),
        )];
        let config = ConsensusConfig {
            heartbeat_interval_ms: 10,
            ..Default::default()
        };
        let proposer = replica(&bus, "coordinator", 100, &validators).await;
        let listener = proposer.clone().spawn_listener().await;
        let registered = proposer.validator(&NodeId::from("v0")).await.unwrap().last_heartbeat;

        let v0 = Arc::new(ByzantineConsensus::new(
            NodeId::from("v0"),
            config,
            Arc::new(Ed25519Signer::from_seed([1u8; 32])),
            bus.clone() as Arc<dyn MessageBus>,
        ));
        let beating = v0.spawn_heartbeat();

        let seen = tokio::time::timeout(std::time::Duration::from_secs(2), async {
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                let v = proposer.validator(&NodeId::from("v0")).await.unwrap();
                if v.last_heartbeat > registered {
                    return;
                }
            }
        })
        .await;
        assert!(seen.is_ok());

        beating.abort();
        listener.abort();
    }

    #[tokio::test]
    async fn dissenting_majority_rejects() {
        let policies: Vec<Arc<dyn VotePolicy>> = vec![
            Arc::new(ApproveAll),
            Arc::new(FixedVote(VoteChoice::No)),
            Arc::new(FixedVote(VoteChoice::No)),
            Arc::new(FixedVote(VoteChoice::No)),
        ];
        let (proposer, handles) = swarm(policies).await;

        let p = proposer
            .propose(ProposalType::ResourceMutation, json!({}), Some(Duration::seconds(5)), None)
            .await
            .unwrap();
        assert_eq!(proposer.await_decision(p.proposal_id).await.unwrap(), ProposalStatus::Rejected);

        for h in handles {
            h.abort();
        }
    }
}
