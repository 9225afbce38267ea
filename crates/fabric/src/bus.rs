//! Publish/subscribe message bus.
//!
//! Every broadcast is an [`Envelope`]; subscribers receive envelopes for a
//! single [`Topic`] over a bounded channel. [`LocalBus`] fans out in-process
//! and is what tests and the simulator use; a networked transport implements
//! the same [`MessageBus`] trait.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::signing::{verify_signature, Signature, SigningService};
use crate::{FabricError, NodeId};

const SUBSCRIBER_BUFFER: usize = 1024;

// ---------------------------------------------------------------------------
// Topic
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Topic {
    ExecutionDispatch,
    ExecutionResult,
    Consensus,
    Heartbeat,
    StateSync,
    NodeDiscovery,
    WorkAvailable,
    WorkClaim,
    WorkResult,
    NodeCapacity,
}

impl Topic {
    pub const ALL: [Topic; 10] = [
        Topic::ExecutionDispatch,
        Topic::ExecutionResult,
        Topic::Consensus,
        Topic::Heartbeat,
        Topic::StateSync,
        Topic::NodeDiscovery,
        Topic::WorkAvailable,
        Topic::WorkClaim,
        Topic::WorkResult,
        Topic::NodeCapacity,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::ExecutionDispatch => "execution-dispatch",
            Topic::ExecutionResult => "execution-result",
            Topic::Consensus => "consensus",
            Topic::Heartbeat => "heartbeat",
            Topic::StateSync => "state-sync",
            Topic::NodeDiscovery => "node-discovery",
            Topic::WorkAvailable => "work-available",
            Topic::WorkClaim => "work-claim",
            Topic::WorkResult => "work-result",
            Topic::NodeCapacity => "node-capacity",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// JSON-serializable broadcast message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: Uuid,
    pub topic: Topic,
    pub data: Value,
    pub sender: NodeId,
    pub timestamp: DateTime<Utc>,
    pub signature: Option<Signature>,
    pub priority: MessagePriority,
}

/// Fields covered by the envelope signature, in canonical order.
#[derive(Serialize)]
struct SignedFields<'a> {
    message_id: &'a Uuid,
    topic: &'a Topic,
    data: &'a Value,
    sender: &'a NodeId,
    timestamp: &'a DateTime<Utc>,
    priority: &'a MessagePriority,
}

impl Envelope {
    pub fn new(topic: Topic, sender: NodeId, data: Value) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            topic,
            data,
            sender,
            timestamp: Utc::now(),
            signature: None,
            priority: MessagePriority::Normal,
        }
    }

    /// Serialize a payload into a new envelope.
    pub fn with_payload<T: Serialize>(
        topic: Topic,
        sender: NodeId,
        payload: &T,
    ) -> Result<Self, FabricError> {
        Ok(Self::new(topic, sender, serde_json::to_value(payload)?))
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    fn signed_bytes(&self) -> Result<Vec<u8>, FabricError> {
        let fields = SignedFields {
            message_id: &self.message_id,
            topic: &self.topic,
            data: &self.data,
            sender: &self.sender,
            timestamp: &self.timestamp,
            priority: &self.priority,
        };
        Ok(serde_json::to_vec(&fields)?)
    }

    pub fn signed(mut self, signer: &dyn SigningService) -> Result<Self, FabricError> {
        let bytes = self.signed_bytes()?;
        self.signature = Some(signer.sign(&bytes));
        Ok(self)
    }

    pub fn verify(&self) -> bool {
        match (&self.signature, self.signed_bytes()) {
            (Some(sig), Ok(bytes)) => verify_signature(&bytes, sig),
            _ => false,
        }
    }

    /// Like [`verify`](Self::verify), and the signature must also have been
    /// made with `public_key`.
    pub fn verify_from(&self, public_key: &str) -> bool {
        self.signer_key() == Some(public_key) && self.verify()
    }

    pub fn signer_key(&self) -> Option<&str> {
        self.signature.as_ref().map(|s| s.public_key.as_str())
    }

    /// Decode the payload into a typed message.
    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, FabricError> {
        Ok(serde_json::from_value(self.data.clone())?)
    }
}

// ---------------------------------------------------------------------------
// Heartbeat
// ---------------------------------------------------------------------------

/// Periodic liveness and load report, published on [`Topic::Heartbeat`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub node_id: NodeId,
    /// Fractions in `[0, 1]`.
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub active_jobs: u32,
    pub max_jobs: u32,
    pub latency_ms: f64,
    pub sent_at: DateTime<Utc>,
}

impl Heartbeat {
    /// A report with no load, for nodes that run no jobs.
    pub fn idle(node_id: NodeId, sent_at: DateTime<Utc>) -> Self {
        Self {
            node_id,
            cpu_usage: 0.0,
            memory_usage: 0.0,
            active_jobs: 0,
            max_jobs: 1,
            latency_ms: 0.0,
            sent_at,
        }
    }

    /// Fraction of job slots in use.
    pub fn load(&self) -> f64 {
        if self.max_jobs == 0 {
            return 1.0;
        }
        (self.active_jobs as f64 / self.max_jobs as f64).clamp(0.0, 1.0)
    }
}

/// Where a node's heartbeat figures come from.
#[async_trait]
pub trait LoadReporter: Send + Sync {
    /// `None` when nothing is known about `node_id` yet.
    async fn sample(&self, node_id: &NodeId) -> Option<Heartbeat>;
}

/// Reports every node as idle.
pub struct IdleLoad;

#[async_trait]
impl LoadReporter for IdleLoad {
    async fn sample(&self, node_id: &NodeId) -> Option<Heartbeat> {
        Some(Heartbeat::idle(node_id.clone(), Utc::now()))
    }
}

/// Sign a heartbeat as its node and publish it.
pub async fn publish_heartbeat(
    bus: &dyn MessageBus,
    signer: &dyn SigningService,
    heartbeat: &Heartbeat,
) -> Result<usize, FabricError> {
    let envelope = Envelope::with_payload(Topic::Heartbeat, heartbeat.node_id.clone(), heartbeat)?
        .with_priority(MessagePriority::Low)
        .signed(signer)?;
    bus.publish(envelope).await
}

/// Publish a heartbeat for `node_id` every `period`.
pub fn spawn_heartbeat(
    node_id: NodeId,
    signer: Arc<dyn SigningService>,
    bus: Arc<dyn MessageBus>,
    reporter: Arc<dyn LoadReporter>,
    period: std::time::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let Some(heartbeat) = reporter.sample(&node_id).await else {
                debug!(%node_id, "no load sample, heartbeat skipped");
                continue;
            };
            if let Err(e) = publish_heartbeat(bus.as_ref(), signer.as_ref(), &heartbeat).await {
                warn!(%node_id, error = %e, "heartbeat not published");
            }
        }
    })
}

// ---------------------------------------------------------------------------
// MessageBus
// ---------------------------------------------------------------------------

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Deliver an envelope to every subscriber of its topic.
    /// Returns the number of subscribers reached.
    async fn publish(&self, envelope: Envelope) -> Result<usize, FabricError>;

    async fn subscribe(&self, topic: Topic) -> mpsc::Receiver<Envelope>;
}

/// In-process bus with one bounded channel per subscriber.
#[derive(Default)]
pub struct LocalBus {
    subscribers: RwLock<HashMap<Topic, Vec<mpsc::Sender<Envelope>>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscriber_count(&self, topic: Topic) -> usize {
        self.subscribers
            .read()
            .await
            .get(&topic)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl MessageBus for LocalBus {
    async fn publish(&self, envelope: Envelope) -> Result<usize, FabricError> {
        let topic = envelope.topic;
        let mut delivered = 0;
        let mut closed = false;

        {
            let subs = self.subscribers.read().await;
            if let Some(senders) = subs.get(&topic) {
                for sender in senders {
                    match sender.try_send(envelope.clone()) {
                        Ok(()) => delivered += 1,
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            warn!(%topic, message_id = %envelope.message_id, "subscriber channel full, dropping message");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => closed = true,
                    }
                }
            }
        }

        if closed {
            let mut subs = self.subscribers.write().await;
            if let Some(senders) = subs.get_mut(&topic) {
                senders.retain(|s| !s.is_closed());
                debug!(%topic, remaining = senders.len(), "pruned closed subscribers");
            }
        }

        Ok(delivered)
    }

    async fn subscribe(&self, topic: Topic) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers.write().await.entry(topic).or_default().push(tx);
        debug!(%topic, "new subscription");
        rx
    }
}
