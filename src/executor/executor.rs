//! Task → decision state machine

use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;

use super::registry::WorkflowRegistry;
use crate::cancel::CancelToken;
use crate::error::EngineError;
use crate::matching::WorkflowTask;
use crate::runtime::{ReplayStateRepository, RuntimeOptions, WorkflowRuntime};

/// How a workflow invocation failed
///
/// Only a returned failure whose underlying error is retryable triggers
/// fail-with-requeue; everything else is terminal. An unregistered type or
/// an undecodable input is a schema-level bug that redelivery cannot fix.
#[derive(Error, Debug)]
pub enum ExecutionFailure {
    /// The type name has no registration
    #[error("workflow type {0} is not registered")]
    Unregistered(String),

    /// The input did not match the registered input type
    #[error("input deserialization failed: {0}")]
    InputDeserialization(String),

    /// The workflow function returned an error
    #[error("workflow returned failure: {0}")]
    Returned(#[source] EngineError),

    /// The workflow function panicked
    #[error("workflow panicked: {0}")]
    Panicked(String),
}

impl ExecutionFailure {
    /// Whether the worker should fail the lease with requeue
    pub fn should_requeue(&self) -> bool {
        matches!(self, ExecutionFailure::Returned(err) if err.is_retryable())
    }

    /// Wire code recorded in the terminal failure event
    pub fn code(&self) -> &'static str {
        match self {
            ExecutionFailure::Unregistered(_) => "NOT_FOUND",
            ExecutionFailure::InputDeserialization(_) => "INVALID_ARGUMENT",
            ExecutionFailure::Returned(err) => err.code(),
            ExecutionFailure::Panicked(_) => "INTERNAL",
        }
    }
}

/// Binds a polled task to its registered workflow and drives it through a
/// runtime scope to a terminal decision
pub struct WorkflowExecutor {
    registry: Arc<WorkflowRegistry>,
    replay: Arc<ReplayStateRepository>,
}

impl WorkflowExecutor {
    /// Create an executor over a registry and the engine's replay state
    pub fn new(registry: Arc<WorkflowRegistry>, replay: Arc<ReplayStateRepository>) -> Self {
        Self { registry, replay }
    }

    /// Per-run replay state repository
    pub fn replay(&self) -> Arc<ReplayStateRepository> {
        self.replay.clone()
    }

    /// Execute one delivered workflow task to a decision
    ///
    /// The runtime scope is opened from the task's options and closed
    /// unconditionally; panics are caught and classified.
    pub async fn execute(
        &self,
        task: &WorkflowTask,
        started_at: DateTime<Utc>,
        cancellation: CancelToken,
    ) -> Result<serde_json::Value, ExecutionFailure> {
        let registered = self
            .registry
            .get(&task.workflow_type)
            .ok_or_else(|| ExecutionFailure::Unregistered(task.workflow_type.clone()))?;

        let input = registered
            .decode(task.input.clone())
            .map_err(|e| ExecutionFailure::InputDeserialization(e.to_string()))?;

        let state = self.replay.state_for(&task.run_id);
        let runtime = Arc::new(
            WorkflowRuntime::open(RuntimeOptions {
                namespace_id: task.namespace_id,
                workflow_id: task.workflow_id.clone(),
                run_id: task.run_id,
                task_queue: task.task_queue.clone(),
                started_at,
                initial_logical_clock: 0,
                metadata: HashMap::new(),
                cancellation,
                state,
            })
            .map_err(ExecutionFailure::Returned)?,
        );

        let invocation = registered.invoke(runtime.clone(), input);
        let outcome = AssertUnwindSafe(invocation).catch_unwind().await;
        // Last handle closes the scope before the lease settles.
        drop(runtime);

        match outcome {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) => Err(ExecutionFailure::Returned(err)),
            Err(panic) => Err(ExecutionFailure::Panicked(panic_message(panic))),
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
