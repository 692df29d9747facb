//! Workflow execution state
//!
//! The mutable row describing one run. `state` only moves from `Running` to
//! a terminal state, `next_event_id` only increases, and `version` increases
//! by exactly one per successful store update.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{EngineError, EngineResult};
use crate::shard;
use crate::types::{NamespaceId, RunId, WorkflowId};

/// Execution lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionState {
    /// The run is open and making progress
    Running,
    /// Terminal: finished with a result
    Completed,
    /// Terminal: finished with an error
    Failed,
    /// Terminal: canceled cooperatively
    Canceled,
    /// Terminal: closed by operator request
    Terminated,
    /// Terminal: superseded by a new run
    ContinuedAsNew,
    /// Terminal: execution deadline exceeded
    TimedOut,
}

impl ExecutionState {
    /// Whether the run is closed
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionState::Running)
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Linkage to the execution that started this one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentExecution {
    /// Parent workflow ID
    pub workflow_id: WorkflowId,
    /// Parent run ID
    pub run_id: RunId,
}

/// Mutable state of one workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    /// Owning namespace
    pub namespace_id: NamespaceId,
    /// User-chosen workflow identifier
    pub workflow_id: WorkflowId,
    /// This run
    pub run_id: RunId,
    /// Registered workflow type name
    pub workflow_type: String,
    /// Task queue the workflow's tasks are dispatched on
    pub task_queue: String,
    /// Lifecycle state
    pub state: ExecutionState,
    /// ID the next appended event will receive; starts at 1, only increases
    pub next_event_id: i64,
    /// Highest event ID a decision task has processed
    pub last_processed_event_id: i64,
    /// ID of the terminal event once the run closes
    pub completion_event_id: Option<i64>,
    /// Execution that started this one, if any
    pub parent: Option<ParentExecution>,
    /// History shard, derived from `workflow_id`
    pub shard_id: u32,
    /// Optimistic-concurrency counter
    pub version: u64,
    /// Cooperative cancellation was requested
    pub cancel_requested: bool,
    /// Start input
    pub input: Option<serde_json::Value>,
    /// Result recorded at completion
    pub result: Option<serde_json::Value>,
    /// Error recorded at failure or termination
    pub failure: Option<String>,
    /// Indexed attributes for visibility filters
    pub search_attributes: HashMap<String, serde_json::Value>,
    /// Row creation time
    pub created_at: DateTime<Utc>,
    /// First workflow task dispatch time
    pub started_at: Option<DateTime<Utc>>,
    /// Close time
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowExecution {
    /// Create a new `Running` execution; the shard is derived from the
    /// workflow ID over `shard_count` shards
    pub fn new(
        namespace_id: NamespaceId,
        workflow_id: WorkflowId,
        run_id: RunId,
        workflow_type: impl Into<String>,
        task_queue: impl Into<String>,
        input: Option<serde_json::Value>,
        shard_count: u32,
    ) -> Self {
        let shard_id = shard::shard_for(&workflow_id, shard_count);
        Self {
            namespace_id,
            workflow_id,
            run_id,
            workflow_type: workflow_type.into(),
            task_queue: task_queue.into(),
            state: ExecutionState::Running,
            next_event_id: 1,
            last_processed_event_id: 0,
            completion_event_id: None,
            parent: None,
            shard_id,
            version: 1,
            cancel_requested: false,
            input,
            result: None,
            failure: None,
            search_attributes: HashMap::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    fn transition(&mut self, to: ExecutionState) -> EngineResult<()> {
        if self.state != ExecutionState::Running {
            return Err(EngineError::FailedPrecondition(format!(
                "workflow {} run {} is {}, cannot transition to {}",
                self.workflow_id, self.run_id, self.state, to
            )));
        }
        self.state = to;
        self.completed_at = Some(Utc::now());
        Ok(())
    }

    /// Close the run with a result
    pub fn complete(&mut self, result: serde_json::Value) -> EngineResult<()> {
        self.transition(ExecutionState::Completed)?;
        self.result = Some(result);
        Ok(())
    }

    /// Close the run with an error
    pub fn fail(&mut self, error: impl Into<String>) -> EngineResult<()> {
        self.transition(ExecutionState::Failed)?;
        self.failure = Some(error.into());
        Ok(())
    }

    /// Close the run after cooperative cancellation
    pub fn cancel(&mut self) -> EngineResult<()> {
        self.transition(ExecutionState::Canceled)
    }

    /// Close the run by operator request; `completion_event_id` points at
    /// the terminal event the caller appends in the same unit of work
    pub fn terminate(&mut self, reason: impl Into<String>) -> EngineResult<()> {
        let terminal_event_id = self.next_event_id;
        self.transition(ExecutionState::Terminated)?;
        self.completion_event_id = Some(terminal_event_id);
        self.failure = Some(reason.into());
        Ok(())
    }

    /// Close the run on deadline expiry
    pub fn time_out(&mut self) -> EngineResult<()> {
        self.transition(ExecutionState::TimedOut)
    }

    /// Close the run in favor of a successor
    pub fn continue_as_new(&mut self) -> EngineResult<()> {
        self.transition(ExecutionState::ContinuedAsNew)
    }

    /// Whether the run is closed
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}
