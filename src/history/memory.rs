//! In-memory history store
//!
//! The primary store for tests and single-process deployments. One write
//! lock covers "append events + advance pointer + bump version" so the
//! transaction contract holds without a database.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::store::{ExecutionFilter, HistoryBatch, HistoryStore};
use crate::error::{EngineError, EngineResult};
use crate::event::{check_sequence, HistoryEvent};
use crate::execution::WorkflowExecution;
use crate::types::{NamespaceId, RunId, WorkflowId};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ExecutionKey {
    namespace_id: NamespaceId,
    workflow_id: WorkflowId,
    run_id: RunId,
}

struct StoredExecution {
    execution: WorkflowExecution,
    events: Vec<HistoryEvent>,
}

#[derive(Default)]
struct Inner {
    executions: HashMap<ExecutionKey, StoredExecution>,
    runs: HashMap<(NamespaceId, WorkflowId), Vec<RunId>>,
}

/// History store backed by process memory
pub struct InMemoryHistoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryHistoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
        }
    }

    fn key(
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        run_id: &RunId,
    ) -> ExecutionKey {
        ExecutionKey {
            namespace_id: *namespace_id,
            workflow_id: workflow_id.clone(),
            run_id: *run_id,
        }
    }

    fn not_found(workflow_id: &WorkflowId, run_id: &RunId) -> EngineError {
        EngineError::NotFound(format!("workflow {} run {}", workflow_id, run_id))
    }

    /// Shared path for versioned update + append; `allow_state_change` is
    /// false for pure appends so caller-visible fields cannot drift
    fn apply_update(
        stored: &mut StoredExecution,
        execution: &WorkflowExecution,
        expected_version: u64,
        events: Vec<HistoryEvent>,
        allow_state_change: bool,
    ) -> EngineResult<WorkflowExecution> {
        if stored.execution.version != expected_version {
            return Err(EngineError::ConcurrencyConflict {
                expected: expected_version,
                actual: stored.execution.version,
            });
        }
        let last_persisted = stored.execution.next_event_id - 1;
        let next_event_id =
            check_sequence(last_persisted, &events).map_err(EngineError::HistoryEvent)?;

        let mut updated = if allow_state_change {
            execution.clone()
        } else {
            stored.execution.clone()
        };
        updated.version = expected_version + 1;
        updated.next_event_id = next_event_id;

        stored.events.extend(events);
        stored.execution = updated.clone();
        Ok(updated)
    }
}

impl Default for InMemoryHistoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn create_execution(
        &self,
        execution: WorkflowExecution,
        initial_events: Vec<HistoryEvent>,
    ) -> EngineResult<WorkflowExecution> {
        let key = Self::key(
            &execution.namespace_id,
            &execution.workflow_id,
            &execution.run_id,
        );
        let next_event_id =
            check_sequence(0, &initial_events).map_err(EngineError::HistoryEvent)?;

        let mut inner = self.inner.write().await;
        if inner.executions.contains_key(&key) {
            return Err(EngineError::AlreadyExists(format!(
                "workflow {} run {}",
                execution.workflow_id, execution.run_id
            )));
        }
        let workflow_key = (execution.namespace_id, execution.workflow_id.clone());
        if let Some(runs) = inner.runs.get(&workflow_key) {
            for run in runs {
                let open = inner
                    .executions
                    .get(&Self::key(&execution.namespace_id, &execution.workflow_id, run))
                    .map(|s| !s.execution.is_terminal())
                    .unwrap_or(false);
                if open {
                    return Err(EngineError::AlreadyExists(format!(
                        "workflow {} already has an open run",
                        execution.workflow_id
                    )));
                }
            }
        }

        let mut stored = execution;
        stored.version = 1;
        stored.next_event_id = next_event_id;
        inner.runs.entry(workflow_key).or_default().push(stored.run_id);
        inner.executions.insert(
            key,
            StoredExecution {
                execution: stored.clone(),
                events: initial_events,
            },
        );
        Ok(stored)
    }

    async fn get_execution(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        run_id: Option<&RunId>,
    ) -> EngineResult<WorkflowExecution> {
        let inner = self.inner.read().await;
        let run_id = match run_id {
            Some(run_id) => *run_id,
            None => *inner
                .runs
                .get(&(*namespace_id, workflow_id.clone()))
                .and_then(|runs| runs.last())
                .ok_or_else(|| {
                    EngineError::NotFound(format!("workflow {}", workflow_id))
                })?,
        };
        inner
            .executions
            .get(&Self::key(namespace_id, workflow_id, &run_id))
            .map(|s| s.execution.clone())
            .ok_or_else(|| Self::not_found(workflow_id, &run_id))
    }

    async fn list_executions(
        &self,
        namespace_id: &NamespaceId,
        filter: &ExecutionFilter,
    ) -> EngineResult<Vec<WorkflowExecution>> {
        let inner = self.inner.read().await;
        let mut executions: Vec<WorkflowExecution> = inner
            .executions
            .values()
            .map(|s| &s.execution)
            .filter(|e| e.namespace_id == *namespace_id && filter.matches(e))
            .cloned()
            .collect();
        executions.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.workflow_id.as_str().cmp(b.workflow_id.as_str()))
        });
        Ok(executions)
    }

    async fn update_execution(
        &self,
        execution: &WorkflowExecution,
        expected_version: u64,
    ) -> EngineResult<WorkflowExecution> {
        self.update_with_events(execution, expected_version, Vec::new())
            .await
    }

    async fn update_with_events(
        &self,
        execution: &WorkflowExecution,
        expected_version: u64,
        events: Vec<HistoryEvent>,
    ) -> EngineResult<WorkflowExecution> {
        let key = Self::key(
            &execution.namespace_id,
            &execution.workflow_id,
            &execution.run_id,
        );
        let mut inner = self.inner.write().await;
        let stored = inner
            .executions
            .get_mut(&key)
            .ok_or_else(|| Self::not_found(&execution.workflow_id, &execution.run_id))?;
        Self::apply_update(stored, execution, expected_version, events, true)
    }

    async fn append_events(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        run_id: &RunId,
        events: Vec<HistoryEvent>,
        expected_version: u64,
    ) -> EngineResult<WorkflowExecution> {
        let key = Self::key(namespace_id, workflow_id, run_id);
        let mut inner = self.inner.write().await;
        let stored = inner
            .executions
            .get_mut(&key)
            .ok_or_else(|| Self::not_found(workflow_id, run_id))?;
        if events.is_empty() {
            return Ok(stored.execution.clone());
        }
        let snapshot = stored.execution.clone();
        Self::apply_update(stored, &snapshot, expected_version, events, false)
    }

    async fn get_history(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        run_id: &RunId,
        from: i64,
        max: usize,
    ) -> EngineResult<HistoryBatch> {
        let inner = self.inner.read().await;
        let stored = inner
            .executions
            .get(&Self::key(namespace_id, workflow_id, run_id))
            .ok_or_else(|| Self::not_found(workflow_id, run_id))?;

        let last_persisted = stored.execution.next_event_id - 1;
        let events: Vec<HistoryEvent> = stored
            .events
            .iter()
            .filter(|e| e.event_id >= from)
            .take(max)
            .cloned()
            .collect();
        let first_id = events.first().map(|e| e.event_id).unwrap_or(0);
        let last_id = events.last().map(|e| e.event_id).unwrap_or(0);
        let is_last = events.is_empty() || last_id >= last_persisted;
        Ok(HistoryBatch {
            events,
            first_id,
            last_id,
            is_last,
        })
    }

    async fn validate_event_sequence(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        run_id: &RunId,
    ) -> EngineResult<bool> {
        let inner = self.inner.read().await;
        let stored = inner
            .executions
            .get(&Self::key(namespace_id, workflow_id, run_id))
            .ok_or_else(|| Self::not_found(workflow_id, run_id))?;
        Ok(stored
            .events
            .iter()
            .enumerate()
            .all(|(i, e)| e.event_id == i as i64 + 1))
    }

    async fn remove_execution(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        run_id: &RunId,
    ) -> EngineResult<()> {
        let mut inner = self.inner.write().await;
        inner
            .executions
            .remove(&Self::key(namespace_id, workflow_id, run_id));
        if let Some(runs) = inner.runs.get_mut(&(*namespace_id, workflow_id.clone())) {
            runs.retain(|r| r != run_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use serde_json::json;

    fn execution(workflow_id: &str) -> WorkflowExecution {
        WorkflowExecution::new(
            NamespaceId::new(),
            WorkflowId::new(workflow_id),
            RunId::new(),
            "order-processing",
            "orders",
            None,
            512,
        )
    }

    fn started_event() -> HistoryEvent {
        HistoryEvent::new(1, EventType::WorkflowExecutionStarted, json!({}))
    }

    fn event(id: i64) -> HistoryEvent {
        HistoryEvent::new(id, EventType::WorkflowTaskCompleted, json!({}))
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let store = InMemoryHistoryStore::new();
        let exec = execution("wf-1");
        let created = store
            .create_execution(exec.clone(), vec![started_event()])
            .await
            .expect("create failed");
        assert_eq!(created.version, 1);
        assert_eq!(created.next_event_id, 2);

        let fetched = store
            .get_execution(&exec.namespace_id, &exec.workflow_id, None)
            .await
            .expect("get failed");
        assert_eq!(fetched.run_id, exec.run_id);
    }

    #[tokio::test]
    async fn test_duplicate_open_run_rejected() {
        let store = InMemoryHistoryStore::new();
        let exec = execution("wf-1");
        store
            .create_execution(exec.clone(), vec![started_event()])
            .await
            .expect("create failed");

        let mut second = execution("wf-1");
        second.namespace_id = exec.namespace_id;
        let err = store
            .create_execution(second, vec![started_event()])
            .await
            .expect_err("second open run must be rejected");
        assert!(matches!(err, EngineError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_version_conflict_leaves_row_unchanged() {
        let store = InMemoryHistoryStore::new();
        let exec = execution("wf-1");
        let created = store
            .create_execution(exec, vec![started_event()])
            .await
            .expect("create failed");

        let mut winner = created.clone();
        winner.last_processed_event_id = 1;
        let updated = store
            .update_execution(&winner, 1)
            .await
            .expect("first update must win");
        assert_eq!(updated.version, 2);

        let mut loser = created.clone();
        loser.last_processed_event_id = 99;
        let err = store
            .update_execution(&loser, 1)
            .await
            .expect_err("stale update must lose");
        assert_eq!(
            err,
            EngineError::ConcurrencyConflict {
                expected: 1,
                actual: 2
            }
        );

        let current = store
            .get_execution(&created.namespace_id, &created.workflow_id, Some(&created.run_id))
            .await
            .expect("get failed");
        assert_eq!(current.last_processed_event_id, 1);
        assert_eq!(current.version, 2);
    }

    #[tokio::test]
    async fn test_append_rejects_gap_atomically() {
        let store = InMemoryHistoryStore::new();
        let exec = execution("wf-1");
        let created = store
            .create_execution(exec, vec![started_event()])
            .await
            .expect("create failed");

        let err = store
            .append_events(
                &created.namespace_id,
                &created.workflow_id,
                &created.run_id,
                vec![event(2), event(4)],
                1,
            )
            .await
            .expect_err("gapped batch must be rejected");
        assert!(matches!(err, EngineError::HistoryEvent(_)));

        let valid = store
            .validate_event_sequence(
                &created.namespace_id,
                &created.workflow_id,
                &created.run_id,
            )
            .await
            .expect("validate failed");
        assert!(valid);
        let current = store
            .get_execution(&created.namespace_id, &created.workflow_id, Some(&created.run_id))
            .await
            .expect("get failed");
        assert_eq!(current.next_event_id, 2);
    }

    #[tokio::test]
    async fn test_empty_append_is_noop() {
        let store = InMemoryHistoryStore::new();
        let exec = execution("wf-1");
        let created = store
            .create_execution(exec, vec![started_event()])
            .await
            .expect("create failed");
        let after = store
            .append_events(
                &created.namespace_id,
                &created.workflow_id,
                &created.run_id,
                Vec::new(),
                1,
            )
            .await
            .expect("empty append must succeed");
        assert_eq!(after.version, 1);
        assert_eq!(after.next_event_id, 2);
    }

    #[tokio::test]
    async fn test_history_pagination() {
        let store = InMemoryHistoryStore::new();
        let exec = execution("wf-1");
        let created = store
            .create_execution(exec, vec![started_event()])
            .await
            .expect("create failed");
        store
            .append_events(
                &created.namespace_id,
                &created.workflow_id,
                &created.run_id,
                (2..=5).map(event).collect(),
                1,
            )
            .await
            .expect("append failed");

        let page1 = store
            .get_history(&created.namespace_id, &created.workflow_id, &created.run_id, 1, 3)
            .await
            .expect("page 1 failed");
        assert_eq!(page1.first_id, 1);
        assert_eq!(page1.last_id, 3);
        assert!(!page1.is_last);

        let page2 = store
            .get_history(
                &created.namespace_id,
                &created.workflow_id,
                &created.run_id,
                page1.last_id + 1,
                10,
            )
            .await
            .expect("page 2 failed");
        assert_eq!(page2.first_id, 4);
        assert_eq!(page2.last_id, 5);
        assert!(page2.is_last);
    }
}
