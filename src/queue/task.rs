//! Task queue items

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::shard;
use crate::types::{NamespaceId, RunId, WorkflowId};

/// Which kind of work a queue carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueType {
    /// Workflow decision tasks
    Workflow,
    /// Activity tasks
    Activity,
}

impl std::fmt::Display for QueueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueType::Workflow => write!(f, "workflow"),
            QueueType::Activity => write!(f, "activity"),
        }
    }
}

/// One pending unit of work
///
/// `task_id` is assigned from the queue's monotonic counter at admission and
/// doubles as the FIFO tie-break for identical `scheduled_at`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskQueueItem {
    /// Owning namespace
    pub namespace_id: NamespaceId,
    /// Queue name
    pub queue_name: String,
    /// Queue kind
    pub queue_type: QueueType,
    /// Queue-assigned monotonic identifier; 0 until admitted
    pub task_id: u64,
    /// Workflow the task belongs to
    pub workflow_id: WorkflowId,
    /// Run the task belongs to
    pub run_id: RunId,
    /// Earliest dispatch time
    pub scheduled_at: DateTime<Utc>,
    /// Hard expiry; the entry is dropped once this passes
    pub expiry_at: Option<DateTime<Utc>>,
    /// Opaque payload
    pub payload: serde_json::Value,
    /// Stable hash of the workflow ID, for partition placement
    pub partition_hash: i64,
}

impl TaskQueueItem {
    /// Build an item dispatchable immediately
    pub fn new(
        namespace_id: NamespaceId,
        queue_name: impl Into<String>,
        queue_type: QueueType,
        workflow_id: WorkflowId,
        run_id: RunId,
        payload: serde_json::Value,
    ) -> Self {
        let partition_hash = shard::partition_hash(&workflow_id);
        Self {
            namespace_id,
            queue_name: queue_name.into(),
            queue_type,
            task_id: 0,
            workflow_id,
            run_id,
            scheduled_at: Utc::now(),
            expiry_at: None,
            payload,
            partition_hash,
        }
    }

    /// Delay dispatch until `scheduled_at`
    pub fn scheduled_at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = scheduled_at;
        self
    }

    /// Drop the entry once `expiry_at` passes
    pub fn expires_at(mut self, expiry_at: DateTime<Utc>) -> Self {
        self.expiry_at = Some(expiry_at);
        self
    }

    /// Whether the entry has expired as of `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expiry_at, Some(expiry) if expiry <= now)
    }
}
