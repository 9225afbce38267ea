//! Work items, node capacity and the payloads broadcast on the work topics.

use chrono::{DateTime, Utc};
use fabric::NodeId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Priority & status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl WorkPriority {
    /// Lanes in service order.
    pub const LANES: [WorkPriority; 4] = [
        WorkPriority::Critical,
        WorkPriority::High,
        WorkPriority::Normal,
        WorkPriority::Low,
    ];

    /// Tokens a claim at this priority consumes.
    pub fn token_cost(&self) -> f64 {
        match self {
            WorkPriority::Critical => 4.0,
            WorkPriority::High => 2.0,
            WorkPriority::Normal => 1.0,
            WorkPriority::Low => 0.5,
        }
    }

    pub(crate) fn lane(&self) -> usize {
        match self {
            WorkPriority::Critical => 0,
            WorkPriority::High => 1,
            WorkPriority::Normal => 2,
            WorkPriority::Low => 3,
        }
    }

    /// Next priority up, or `None` at the top.
    pub fn boosted(&self) -> Option<WorkPriority> {
        match self {
            WorkPriority::Low => Some(WorkPriority::Normal),
            WorkPriority::Normal => Some(WorkPriority::High),
            WorkPriority::High => Some(WorkPriority::Critical),
            WorkPriority::Critical => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    Pending,
    Claimed,
    Processing,
    Completed,
    Failed,
    Expired,
}

impl WorkStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkStatus::Completed | WorkStatus::Failed | WorkStatus::Expired)
    }
}

// ---------------------------------------------------------------------------
// WorkItem
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkRequirements {
    pub capabilities: Vec<String>,
}

/// What a caller hands to `submit_work`.
#[derive(Debug, Clone, Default)]
pub struct WorkSubmission {
    pub execution_id: Uuid,
    pub step_id: String,
    pub priority: WorkPriority,
    pub requirements: WorkRequirements,
    pub payload: Value,
    /// Falls back to the distributor default.
    pub max_retries: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub work_id: Uuid,
    pub execution_id: Uuid,
    pub step_id: String,
    pub priority: WorkPriority,
    /// Lane the item currently waits in; raised by starvation rebalance.
    pub effective_priority: WorkPriority,
    pub requirements: WorkRequirements,
    pub payload: Value,
    pub status: WorkStatus,
    pub claimed_by: Option<NodeId>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub retries_remaining: u32,
    /// Reannouncements since the item last became pending.
    pub announce_attempts: u32,
    pub next_announce_at: Option<DateTime<Utc>>,
    pub enqueued_at: DateTime<Utc>,
    pub last_boosted_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// When the item reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// A node's advertised capacity, published on the node-capacity topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCapacity {
    pub node_id: NodeId,
    pub max_concurrent_jobs: u32,
    pub cpu_usage: f64,
    pub memory_usage: f64,
    pub capabilities: Vec<String>,
}

impl NodeCapacity {
    pub fn new(node_id: NodeId, capabilities: Vec<String>) -> Self {
        Self {
            node_id,
            max_concurrent_jobs: u32::MAX,
            cpu_usage: 0.0,
            memory_usage: 0.0,
            capabilities,
        }
    }
}

// ---------------------------------------------------------------------------
// Broadcast payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkAnnouncement {
    pub work_id: Uuid,
    pub execution_id: Uuid,
    pub step_id: String,
    pub priority: WorkPriority,
    pub requirements: WorkRequirements,
    /// 0 for the initial announcement.
    pub attempt: u32,
}

impl From<&WorkItem> for WorkAnnouncement {
    fn from(item: &WorkItem) -> Self {
        Self {
            work_id: item.work_id,
            execution_id: item.execution_id,
            step_id: item.step_id.clone(),
            priority: item.effective_priority,
            requirements: item.requirements.clone(),
            attempt: item.announce_attempts,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkClaimNotice {
    pub work_id: Uuid,
    pub node_id: NodeId,
    pub claimed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkOutcome {
    pub work_id: Uuid,
    pub node_id: NodeId,
    pub status: WorkStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
}
