//! Matched tasks and their completion handles

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::EngineResult;
use crate::queue::{TaskLease, TaskQueue};
use crate::types::{NamespaceId, RunId, WorkflowId};

/// Decoded payload of a workflow decision task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTask {
    /// Owning namespace
    pub namespace_id: NamespaceId,
    /// Workflow the decision belongs to
    pub workflow_id: WorkflowId,
    /// Run the decision belongs to
    pub run_id: RunId,
    /// Registered workflow type name
    pub workflow_type: String,
    /// Task queue the workflow runs on
    pub task_queue: String,
    /// Start input
    pub input: serde_json::Value,
}

/// One leased task delivered to a subscriber
///
/// Completion, failure, and heartbeat resolve the lease through the queue
/// handle; the subscription tracks the lease as outstanding until one of
/// them settles it.
#[derive(Clone)]
pub struct MatchingTask {
    lease: TaskLease,
    workflow_task: WorkflowTask,
    queue: Arc<TaskQueue>,
    outstanding: Arc<Mutex<HashSet<Uuid>>>,
}

impl MatchingTask {
    pub(crate) fn new(
        lease: TaskLease,
        workflow_task: WorkflowTask,
        queue: Arc<TaskQueue>,
        outstanding: Arc<Mutex<HashSet<Uuid>>>,
    ) -> Self {
        Self {
            lease,
            workflow_task,
            queue,
            outstanding,
        }
    }

    /// The lease this delivery holds
    pub fn lease(&self) -> &TaskLease {
        &self.lease
    }

    /// The decoded workflow task
    pub fn task(&self) -> &WorkflowTask {
        &self.workflow_task
    }

    fn settle(&self) {
        self.outstanding.lock().remove(&self.lease.lease_id);
    }

    /// Complete the lease; the task is removed permanently
    pub async fn complete(&self) -> EngineResult<()> {
        self.settle();
        self.queue.complete(self.lease.lease_id)
    }

    /// Fail the lease, optionally requeueing the task
    pub async fn fail(&self, reason: &str, requeue: bool) -> EngineResult<()> {
        self.settle();
        self.queue.fail(self.lease.lease_id, reason, requeue)
    }

    /// Extend the lease
    pub async fn heartbeat(&self) -> EngineResult<TaskLease> {
        self.queue.heartbeat(self.lease.lease_id)
    }
}
