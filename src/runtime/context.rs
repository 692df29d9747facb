//! Execution context snapshot

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::{NamespaceId, RunId, WorkflowId};

/// Immutable view of the run a workflow invocation belongs to
///
/// Runtime-only; never persisted. The live logical clock is read through
/// the runtime handle, this snapshot carries its value at scope open.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Owning namespace
    pub namespace_id: NamespaceId,
    /// Workflow identifier
    pub workflow_id: WorkflowId,
    /// This run
    pub run_id: RunId,
    /// Task queue the run is dispatched on
    pub task_queue: String,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// Logical clock value at scope open
    pub logical_clock: u64,
    /// How many times this run has been replayed before this attempt
    pub replay_count: u32,
    /// Ambient metadata
    pub metadata: HashMap<String, String>,
}

impl ExecutionContext {
    /// Whether this attempt is a replay of earlier progress
    pub fn is_replaying(&self) -> bool {
        self.replay_count > 0
    }
}
