//! History store contract

use async_trait::async_trait;

use crate::error::EngineResult;
use crate::event::HistoryEvent;
use crate::execution::{ExecutionState, WorkflowExecution};
use crate::types::{NamespaceId, RunId, WorkflowId};

/// One page of history events in ID order
///
/// Pagination uses `last_id + 1` as the next `from`.
#[derive(Debug, Clone)]
pub struct HistoryBatch {
    /// Events in ascending ID order
    pub events: Vec<HistoryEvent>,
    /// ID of the first returned event, 0 when the page is empty
    pub first_id: i64,
    /// ID of the last returned event, 0 when the page is empty
    pub last_id: i64,
    /// Whether this page reaches the end of persisted history
    pub is_last: bool,
}

/// Visibility filter for execution listings
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    /// Match a lifecycle state
    pub state: Option<ExecutionState>,
    /// Match a workflow type name
    pub workflow_type: Option<String>,
    /// Match a task queue name
    pub task_queue: Option<String>,
}

impl ExecutionFilter {
    /// Whether `execution` passes this filter
    pub fn matches(&self, execution: &WorkflowExecution) -> bool {
        if let Some(state) = self.state {
            if execution.state != state {
                return false;
            }
        }
        if let Some(workflow_type) = &self.workflow_type {
            if &execution.workflow_type != workflow_type {
                return false;
            }
        }
        if let Some(task_queue) = &self.task_queue {
            if &execution.task_queue != task_queue {
                return false;
            }
        }
        true
    }
}

/// Persistence contract for executions and their event logs
///
/// The store is shard-agnostic; ownership checks live in
/// [`HistoryService`](super::HistoryService). The optimistic version guard is
/// what rejects lost writes from a host that no longer holds the shard.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Persist a new execution together with its initial events (IDs `1..`)
    ///
    /// Rejected with `AlreadyExists` when the run already exists or another
    /// run of the same workflow ID is still open.
    async fn create_execution(
        &self,
        execution: WorkflowExecution,
        initial_events: Vec<HistoryEvent>,
    ) -> EngineResult<WorkflowExecution>;

    /// Fetch one execution; `run = None` resolves the latest run
    async fn get_execution(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        run_id: Option<&RunId>,
    ) -> EngineResult<WorkflowExecution>;

    /// Executions in a namespace passing `filter`, ordered by creation time
    async fn list_executions(
        &self,
        namespace_id: &NamespaceId,
        filter: &ExecutionFilter,
    ) -> EngineResult<Vec<WorkflowExecution>>;

    /// Versioned update of mutable state; no fields change on conflict
    ///
    /// On success the stored version is `expected_version + 1` and
    /// `next_event_id` is left untouched.
    async fn update_execution(
        &self,
        execution: &WorkflowExecution,
        expected_version: u64,
    ) -> EngineResult<WorkflowExecution>;

    /// Versioned update plus event append in one transaction
    ///
    /// The events must continue the run's contiguous ID sequence; the whole
    /// batch is rejected otherwise and nothing changes. `next_event_id`
    /// advances past the batch under the same version guard.
    async fn update_with_events(
        &self,
        execution: &WorkflowExecution,
        expected_version: u64,
        events: Vec<HistoryEvent>,
    ) -> EngineResult<WorkflowExecution>;

    /// Append events without touching the caller-visible state fields
    ///
    /// An empty batch is a no-op returning success without a version bump.
    async fn append_events(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        run_id: &RunId,
        events: Vec<HistoryEvent>,
        expected_version: u64,
    ) -> EngineResult<WorkflowExecution>;

    /// Read a page of history in ID order starting at `from`
    async fn get_history(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        run_id: &RunId,
        from: i64,
        max: usize,
    ) -> EngineResult<HistoryBatch>;

    /// Whether stored event IDs form the contiguous sequence `1..N`
    async fn validate_event_sequence(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        run_id: &RunId,
    ) -> EngineResult<bool>;

    /// Purge a closed execution and its events (retention)
    async fn remove_execution(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        run_id: &RunId,
    ) -> EngineResult<()>;
}
