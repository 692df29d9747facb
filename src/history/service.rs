//! Shard-checked history writes
//!
//! The store is shard-agnostic; this layer verifies that the current host
//! holds the lease for the shard implied by the workflow ID before any
//! write. Reads pass through unchecked. Even if a stale owner slips past the
//! check, the store's version guard rejects its late writes.

use std::sync::Arc;

use super::store::{ExecutionFilter, HistoryBatch, HistoryStore};
use crate::error::{EngineError, EngineResult};
use crate::event::{EventType, HistoryEvent};
use crate::execution::WorkflowExecution;
use crate::shard::{self, ShardManager};
use crate::types::{NamespaceId, RunId, WorkflowId};

/// History store front-end bound to one host identity
pub struct HistoryService {
    store: Arc<dyn HistoryStore>,
    shards: Arc<ShardManager>,
    host: String,
    shard_count: u32,
}

impl HistoryService {
    /// Bind `store` to this host's shard ownership
    pub fn new(
        store: Arc<dyn HistoryStore>,
        shards: Arc<ShardManager>,
        host: impl Into<String>,
        shard_count: u32,
    ) -> Self {
        Self {
            store,
            shards,
            host: host.into(),
            shard_count,
        }
    }

    /// The underlying store, for read-side collaborators
    pub fn store(&self) -> Arc<dyn HistoryStore> {
        self.store.clone()
    }

    async fn ensure_owned(&self, workflow_id: &WorkflowId) -> EngineResult<()> {
        let shard_id = shard::shard_for(workflow_id, self.shard_count);
        let now = chrono::Utc::now();
        let owned = self
            .shards
            .get_lease(shard_id)
            .await
            .map(|lease| lease.is_held_by(&self.host, now))
            .unwrap_or(false);
        if owned {
            Ok(())
        } else {
            Err(EngineError::ShardUnavailable(format!(
                "shard {} for workflow {} is not owned by {}",
                shard_id, workflow_id, self.host
            )))
        }
    }

    /// Create an execution with its initial events; shard-checked
    pub async fn create_execution(
        &self,
        execution: WorkflowExecution,
        initial_events: Vec<HistoryEvent>,
    ) -> EngineResult<WorkflowExecution> {
        self.ensure_owned(&execution.workflow_id).await?;
        self.store.create_execution(execution, initial_events).await
    }

    /// Fetch one execution
    pub async fn get_execution(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        run_id: Option<&RunId>,
    ) -> EngineResult<WorkflowExecution> {
        self.store.get_execution(namespace_id, workflow_id, run_id).await
    }

    /// List executions in a namespace
    pub async fn list_executions(
        &self,
        namespace_id: &NamespaceId,
        filter: &ExecutionFilter,
    ) -> EngineResult<Vec<WorkflowExecution>> {
        self.store.list_executions(namespace_id, filter).await
    }

    /// Versioned state update; shard-checked
    pub async fn update_execution(
        &self,
        execution: &WorkflowExecution,
        expected_version: u64,
    ) -> EngineResult<WorkflowExecution> {
        self.ensure_owned(&execution.workflow_id).await?;
        self.store.update_execution(execution, expected_version).await
    }

    /// Versioned state update plus event append; shard-checked
    pub async fn update_with_events(
        &self,
        execution: &WorkflowExecution,
        expected_version: u64,
        events: Vec<HistoryEvent>,
    ) -> EngineResult<WorkflowExecution> {
        self.ensure_owned(&execution.workflow_id).await?;
        self.store
            .update_with_events(execution, expected_version, events)
            .await
    }

    /// Event append; shard-checked
    pub async fn append_events(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        run_id: &RunId,
        events: Vec<HistoryEvent>,
        expected_version: u64,
    ) -> EngineResult<WorkflowExecution> {
        self.ensure_owned(workflow_id).await?;
        self.store
            .append_events(namespace_id, workflow_id, run_id, events, expected_version)
            .await
    }

    /// Read a page of history
    pub async fn get_history(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        run_id: &RunId,
        from: i64,
        max: usize,
    ) -> EngineResult<HistoryBatch> {
        self.store
            .get_history(namespace_id, workflow_id, run_id, from, max)
            .await
    }

    /// Check stored IDs are `1..N` contiguous
    pub async fn validate_event_sequence(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        run_id: &RunId,
    ) -> EngineResult<bool> {
        self.store
            .validate_event_sequence(namespace_id, workflow_id, run_id)
            .await
    }

    /// Close a run by operator request
    ///
    /// Transitions to `Terminated`, points `completion_event_id` at the
    /// terminal event, and appends that event in the same unit of work.
    pub async fn terminate(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        run_id: Option<&RunId>,
        reason: &str,
    ) -> EngineResult<WorkflowExecution> {
        self.ensure_owned(workflow_id).await?;
        let mut execution = self
            .store
            .get_execution(namespace_id, workflow_id, run_id)
            .await?;
        let expected_version = execution.version;
        execution.terminate(reason)?;
        let event = HistoryEvent::new(
            execution.next_event_id,
            EventType::WorkflowExecutionTerminated,
            serde_json::json!({ "reason": reason }),
        );
        self.store
            .update_with_events(&execution, expected_version, vec![event])
            .await
    }

    /// Purge a closed execution (retention)
    pub async fn remove_execution(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        run_id: &RunId,
    ) -> EngineResult<()> {
        self.store
            .remove_execution(namespace_id, workflow_id, run_id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::InMemoryHistoryStore;
    use serde_json::json;
    use std::time::Duration;

    async fn fixture(host: &str) -> (HistoryService, Arc<ShardManager>) {
        let shards = Arc::new(ShardManager::new());
        shards.initialize(8).await.expect("initialize failed");
        let store: Arc<dyn HistoryStore> = Arc::new(InMemoryHistoryStore::new());
        (HistoryService::new(store, shards.clone(), host, 8), shards)
    }

    fn execution() -> WorkflowExecution {
        WorkflowExecution::new(
            NamespaceId::new(),
            WorkflowId::new("wf-1"),
            RunId::new(),
            "order-processing",
            "orders",
            None,
            8,
        )
    }

    #[tokio::test]
    async fn test_write_requires_shard_lease() {
        let (service, shards) = fixture("host-a").await;
        let exec = execution();
        let initial = vec![HistoryEvent::new(
            1,
            EventType::WorkflowExecutionStarted,
            json!({}),
        )];

        let err = service
            .create_execution(exec.clone(), initial.clone())
            .await
            .expect_err("write without lease must fail");
        assert!(matches!(err, EngineError::ShardUnavailable(_)));

        shards
            .acquire_lease(exec.shard_id, "host-a", Duration::from_secs(60))
            .await
            .expect("acquire failed");
        service
            .create_execution(exec, initial)
            .await
            .expect("write with lease must succeed");
    }

    #[tokio::test]
    async fn test_terminate_appends_terminal_event() {
        let (service, shards) = fixture("host-a").await;
        let exec = execution();
        shards
            .acquire_lease(exec.shard_id, "host-a", Duration::from_secs(60))
            .await
            .expect("acquire failed");
        service
            .create_execution(
                exec.clone(),
                vec![HistoryEvent::new(
                    1,
                    EventType::WorkflowExecutionStarted,
                    json!({}),
                )],
            )
            .await
            .expect("create failed");

        let terminated = service
            .terminate(
                &exec.namespace_id,
                &exec.workflow_id,
                Some(&exec.run_id),
                "operator request",
            )
            .await
            .expect("terminate failed");
        assert_eq!(terminated.completion_event_id, Some(2));
        assert!(terminated.completed_at.is_some());

        let batch = service
            .get_history(&exec.namespace_id, &exec.workflow_id, &exec.run_id, 1, 10)
            .await
            .expect("history failed");
        assert_eq!(batch.last_id, 2);
        assert_eq!(
            batch.events.last().map(|e| e.event_type),
            Some(EventType::WorkflowExecutionTerminated)
        );

        let again = service
            .terminate(
                &exec.namespace_id,
                &exec.workflow_id,
                Some(&exec.run_id),
                "again",
            )
            .await
            .expect_err("second terminate must fail");
        assert!(matches!(again, EngineError::FailedPrecondition(_)));
    }
}
