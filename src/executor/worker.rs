//! Worker loop
//!
//! Subscribes to a task queue through matching and turns each delivered
//! task into a persisted decision: heartbeat the lease while the workflow
//! runs, then append the outcome events and update execution state under
//! the optimistic version guard before settling the lease.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use super::executor::{ExecutionFailure, WorkflowExecutor};
use super::registry::WorkflowRegistry;
use crate::cancel::CancelToken;
use crate::error::{EngineError, EngineResult};
use crate::event::{EventType, HistoryEvent};
use crate::history::HistoryService;
use crate::matching::{MatchingService, MatchingTask, WorkflowTask};
use crate::queue::QueueKey;
use crate::retry::{with_backoff, BackoffPolicy};
use crate::runtime::ReplayStateRepository;
use crate::types::WorkerIdentity;

/// One polling worker bound to a queue
pub struct Worker {
    identity: WorkerIdentity,
    matching: Arc<MatchingService>,
    history: Arc<HistoryService>,
    executor: WorkflowExecutor,
    heartbeat_interval: Duration,
    backoff: BackoffPolicy,
}

impl Worker {
    /// Create a worker
    pub fn new(
        identity: WorkerIdentity,
        matching: Arc<MatchingService>,
        history: Arc<HistoryService>,
        registry: Arc<WorkflowRegistry>,
        replay: Arc<ReplayStateRepository>,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            identity,
            matching,
            history,
            executor: WorkflowExecutor::new(registry, replay),
            heartbeat_interval,
            backoff: BackoffPolicy::default(),
        }
    }

    /// Subscribe to `key` and process tasks until cancelled
    pub async fn run(&self, key: QueueKey, token: CancelToken) {
        tracing::info!(worker = %self.identity, queue = %key.name, "worker started");
        let mut subscription = self
            .matching
            .subscribe(&key, self.identity.clone(), &token);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                task = subscription.next_task() => match task {
                    Some(task) => self.process(task, &token).await,
                    None => break,
                },
            }
        }
        tracing::info!(worker = %self.identity, queue = %key.name, "worker stopped");
    }

    async fn process(&self, task: MatchingTask, token: &CancelToken) {
        let workflow_task = task.task().clone();
        let decision_task_id = task.lease().task.task_id as i64;

        let execution = match self
            .history
            .get_execution(
                &workflow_task.namespace_id,
                &workflow_task.workflow_id,
                Some(&workflow_task.run_id),
            )
            .await
        {
            Ok(execution) => execution,
            Err(EngineError::NotFound(_)) => {
                tracing::warn!(
                    workflow_id = %workflow_task.workflow_id,
                    run_id = %workflow_task.run_id,
                    "dropping task for unknown execution"
                );
                let _ = task.fail("execution not found", false).await;
                return;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to load execution; requeueing task");
                let _ = task.fail(&format!("load failed: {}", err), true).await;
                return;
            }
        };
        if execution.is_terminal() {
            // Stale redelivery of an already-concluded run.
            let _ = task.complete().await;
            return;
        }

        // Keep the lease alive while the workflow runs.
        let heartbeat_token = token.child();
        let heartbeat = {
            let task = task.clone();
            let token = heartbeat_token.clone();
            let interval = self.heartbeat_interval;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {
                            if let Err(err) = task.heartbeat().await {
                                tracing::debug!(error = %err, "lease heartbeat stopped");
                                break;
                            }
                        }
                    }
                }
            })
        };

        let cancellation = token.child();
        if execution.cancel_requested {
            cancellation.cancel();
        }
        let started_at = execution.started_at.unwrap_or(execution.created_at);
        let outcome = self
            .executor
            .execute(&workflow_task, started_at, cancellation)
            .await;

        heartbeat_token.cancel();
        let _ = heartbeat.await;

        match outcome {
            Ok(result) => {
                match self
                    .persist_completed(&workflow_task, decision_task_id, result)
                    .await
                {
                    Ok(()) => {
                        let _ = task.complete().await;
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to persist completion; requeueing");
                        let _ = task.fail(&format!("persist failed: {}", err), true).await;
                    }
                }
            }
            Err(failure) => {
                let canceled = execution.cancel_requested
                    && matches!(&failure, ExecutionFailure::Returned(EngineError::Canceled));
                if canceled {
                    match self
                        .persist_canceled(&workflow_task, decision_task_id)
                        .await
                    {
                        Ok(()) => {
                            let _ = task.complete().await;
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "failed to persist cancel; requeueing");
                            let _ = task.fail(&format!("persist failed: {}", err), true).await;
                        }
                    }
                } else if matches!(&failure, ExecutionFailure::Returned(EngineError::Canceled)) {
                    // Worker shutdown, not a user cancel: leave the run for
                    // another worker.
                    let _ = task.fail("worker canceled", true).await;
                } else if failure.should_requeue() {
                    if let Err(err) = self
                        .persist_task_failed(&workflow_task, decision_task_id, &failure)
                        .await
                    {
                        tracing::debug!(error = %err, "failed to record task failure event");
                    }
                    let _ = task.fail(&failure.to_string(), true).await;
                } else {
                    match self
                        .persist_failed(&workflow_task, decision_task_id, &failure)
                        .await
                    {
                        Ok(()) => {
                            let _ = task.fail(&failure.to_string(), false).await;
                        }
                        Err(err) => {
                            // Another host may still record the terminal state.
                            tracing::warn!(error = %err, "failed to persist failure; requeueing");
                            let _ = task.fail(&format!("persist failed: {}", err), true).await;
                        }
                    }
                }
            }
        }
    }

    async fn persist_completed(
        &self,
        workflow_task: &WorkflowTask,
        decision_task_id: i64,
        result: serde_json::Value,
    ) -> EngineResult<()> {
        with_backoff(&self.backoff, "persist-completed", || {
            let result = result.clone();
            async move {
                let mut execution = self
                    .history
                    .get_execution(
                        &workflow_task.namespace_id,
                        &workflow_task.workflow_id,
                        Some(&workflow_task.run_id),
                    )
                    .await?;
                if execution.is_terminal() {
                    return Ok(());
                }
                let expected_version = execution.version;
                let first_event_id = execution.next_event_id;
                let events = vec![
                    HistoryEvent::new(first_event_id, EventType::WorkflowTaskCompleted, json!({}))
                        .with_task_id(decision_task_id),
                    HistoryEvent::new(
                        first_event_id + 1,
                        EventType::WorkflowExecutionCompleted,
                        json!({ "result": result }),
                    )
                    .with_task_id(decision_task_id),
                ];
                if execution.started_at.is_none() {
                    execution.started_at = Some(Utc::now());
                }
                execution.complete(result.clone())?;
                execution.completion_event_id = Some(first_event_id + 1);
                execution.last_processed_event_id = first_event_id + 1;
                self.history
                    .update_with_events(&execution, expected_version, events)
                    .await?;
                Ok(())
            }
        })
        .await
    }

    async fn persist_failed(
        &self,
        workflow_task: &WorkflowTask,
        decision_task_id: i64,
        failure: &ExecutionFailure,
    ) -> EngineResult<()> {
        with_backoff(&self.backoff, "persist-failed", || async move {
            let mut execution = self
                .history
                .get_execution(
                    &workflow_task.namespace_id,
                    &workflow_task.workflow_id,
                    Some(&workflow_task.run_id),
                )
                .await?;
            if execution.is_terminal() {
                return Ok(());
            }
            let expected_version = execution.version;
            let first_event_id = execution.next_event_id;
            let events = vec![HistoryEvent::new(
                first_event_id,
                EventType::WorkflowExecutionFailed,
                json!({ "error": failure.to_string(), "code": failure.code() }),
            )
            .with_task_id(decision_task_id)];
            if execution.started_at.is_none() {
                execution.started_at = Some(Utc::now());
            }
            execution.fail(failure.to_string())?;
            execution.completion_event_id = Some(first_event_id);
            execution.last_processed_event_id = first_event_id;
            self.history
                .update_with_events(&execution, expected_version, events)
                .await?;
            Ok(())
        })
        .await
    }

    async fn persist_canceled(
        &self,
        workflow_task: &WorkflowTask,
        decision_task_id: i64,
    ) -> EngineResult<()> {
        with_backoff(&self.backoff, "persist-canceled", || async move {
            let mut execution = self
                .history
                .get_execution(
                    &workflow_task.namespace_id,
                    &workflow_task.workflow_id,
                    Some(&workflow_task.run_id),
                )
                .await?;
            if execution.is_terminal() {
                return Ok(());
            }
            let expected_version = execution.version;
            let first_event_id = execution.next_event_id;
            let events = vec![HistoryEvent::new(
                first_event_id,
                EventType::WorkflowExecutionCanceled,
                json!({}),
            )
            .with_task_id(decision_task_id)];
            execution.cancel()?;
            execution.completion_event_id = Some(first_event_id);
            execution.last_processed_event_id = first_event_id;
            self.history
                .update_with_events(&execution, expected_version, events)
                .await?;
            Ok(())
        })
        .await
    }

    async fn persist_task_failed(
        &self,
        workflow_task: &WorkflowTask,
        decision_task_id: i64,
        failure: &ExecutionFailure,
    ) -> EngineResult<()> {
        with_backoff(&self.backoff, "persist-task-failed", || async move {
            let execution = self
                .history
                .get_execution(
                    &workflow_task.namespace_id,
                    &workflow_task.workflow_id,
                    Some(&workflow_task.run_id),
                )
                .await?;
            if execution.is_terminal() {
                return Ok(());
            }
            let event = HistoryEvent::new(
                execution.next_event_id,
                EventType::WorkflowTaskFailed,
                json!({ "error": failure.to_string(), "code": failure.code() }),
            )
            .with_task_id(decision_task_id);
            self.history
                .append_events(
                    &workflow_task.namespace_id,
                    &workflow_task.workflow_id,
                    &workflow_task.run_id,
                    vec![event],
                    execution.version,
                )
                .await?;
            Ok(())
        })
        .await
    }
}
