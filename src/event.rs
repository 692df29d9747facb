//! Immutable history events
//!
//! Every state change of a workflow execution is recorded as an append-only
//! event. Within one run, event IDs form the contiguous sequence 1, 2, 3, …
//! with no gaps; the history store rejects any batch that would break that.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of a history event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// Execution row created; payload carries the start input
    WorkflowExecutionStarted,
    /// A workflow task was enqueued for matching
    WorkflowTaskScheduled,
    /// A worker leased the workflow task
    WorkflowTaskStarted,
    /// The workflow task produced a decision
    WorkflowTaskCompleted,
    /// The workflow task failed; a new one will be scheduled if retryable
    WorkflowTaskFailed,
    /// An activity effect was scheduled
    ActivityScheduled,
    /// An activity effect completed
    ActivityCompleted,
    /// An activity effect failed
    ActivityFailed,
    /// A durable timer was started
    TimerStarted,
    /// A durable timer fired
    TimerFired,
    /// An external signal was delivered
    WorkflowExecutionSignaled,
    /// Cancellation was requested; the workflow observes it cooperatively
    WorkflowExecutionCancelRequested,
    /// Terminal: completed with a result
    WorkflowExecutionCompleted,
    /// Terminal: failed with an error
    WorkflowExecutionFailed,
    /// Terminal: canceled cooperatively
    WorkflowExecutionCanceled,
    /// Terminal: terminated by operator request
    WorkflowExecutionTerminated,
    /// Terminal: continued as a new run
    WorkflowExecutionContinuedAsNew,
    /// Terminal: execution deadline exceeded
    WorkflowExecutionTimedOut,
}

/// One immutable history row
///
/// The `(namespace_id, workflow_id, run_id)` part of the composite key is
/// carried by the store; the event itself holds the in-run remainder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEvent {
    /// Position in the run's event sequence, starting at 1
    pub event_id: i64,
    /// Event kind
    pub event_type: EventType,
    /// Wall-clock time the event was recorded
    pub event_timestamp: DateTime<Utc>,
    /// Decision task this event is bound to, -1 when not decision-bound
    pub task_id: i64,
    /// Payload schema version
    pub schema_version: u32,
    /// Opaque payload
    pub payload: serde_json::Value,
}

impl HistoryEvent {
    /// Current payload schema version
    pub const SCHEMA_VERSION: u32 = 1;

    /// Build an event that is not bound to a decision task
    pub fn new(event_id: i64, event_type: EventType, payload: serde_json::Value) -> Self {
        Self {
            event_id,
            event_type,
            event_timestamp: Utc::now(),
            task_id: -1,
            schema_version: Self::SCHEMA_VERSION,
            payload,
        }
    }

    /// Bind this event to the decision task that produced it
    pub fn with_task_id(mut self, task_id: i64) -> Self {
        self.task_id = task_id;
        self
    }

    /// Whether this event closes the run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.event_type,
            EventType::WorkflowExecutionCompleted
                | EventType::WorkflowExecutionFailed
                | EventType::WorkflowExecutionCanceled
                | EventType::WorkflowExecutionTerminated
                | EventType::WorkflowExecutionContinuedAsNew
                | EventType::WorkflowExecutionTimedOut
        )
    }
}

/// Check that `events` continues the sequence `1..` after `last_persisted_id`
///
/// Returns the ID the next append must start at on success.
pub(crate) fn check_sequence(last_persisted_id: i64, events: &[HistoryEvent]) -> Result<i64, String> {
    let mut expected = last_persisted_id + 1;
    for event in events {
        if event.event_id != expected {
            return Err(format!(
                "event ID {} out of sequence, expected {}",
                event.event_id, expected
            ));
        }
        expected += 1;
    }
    Ok(expected)
}
