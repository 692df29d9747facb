//! Durable workflow timers
//!
//! Timers fire at second granularity: each tick collects due timers,
//! appends a `TimerFired` event, and enqueues a workflow task so the run
//! makes progress. A timer whose history write hits a transient failure
//! stays registered and fires again on the next tick.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::error::{EngineError, EngineResult};
use crate::event::{EventType, HistoryEvent};
use crate::history::HistoryService;
use crate::matching::{MatchingService, WorkflowTask};
use crate::queue::{QueueType, TaskQueueItem};
use crate::types::{NamespaceId, RunId, WorkflowId};

const TIMER_TICK: Duration = Duration::from_secs(1);

/// One registered timer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DurableTimer {
    /// Timer identifier
    pub timer_id: String,
    /// Owning namespace
    pub namespace_id: NamespaceId,
    /// Workflow the timer belongs to
    pub workflow_id: WorkflowId,
    /// Run the timer belongs to
    pub run_id: RunId,
    /// Workflow-chosen timer key
    pub key: String,
    /// When the timer is due
    pub fire_at: DateTime<Utc>,
}

/// Fires due timers into history and matching
pub struct TimerWorker {
    timers: Arc<RwLock<HashMap<String, DurableTimer>>>,
    history: Arc<HistoryService>,
    matching: Arc<MatchingService>,
}

impl TimerWorker {
    /// Create a timer worker
    pub fn new(history: Arc<HistoryService>, matching: Arc<MatchingService>) -> Self {
        Self {
            timers: Arc::new(RwLock::new(HashMap::new())),
            history,
            matching,
        }
    }

    /// Register a timer and record `TimerStarted` in the run's history
    pub async fn register(
        &self,
        namespace_id: NamespaceId,
        workflow_id: WorkflowId,
        run_id: RunId,
        key: impl Into<String>,
        fire_at: DateTime<Utc>,
    ) -> EngineResult<String> {
        let key = key.into();
        let execution = self
            .history
            .get_execution(&namespace_id, &workflow_id, Some(&run_id))
            .await?;
        if execution.is_terminal() {
            return Err(EngineError::FailedPrecondition(format!(
                "workflow {} run {} is {}",
                workflow_id, run_id, execution.state
            )));
        }

        let timer_id = Uuid::new_v4().to_string();
        let event = HistoryEvent::new(
            execution.next_event_id,
            EventType::TimerStarted,
            json!({ "timerId": timer_id, "key": key, "fireAt": fire_at }),
        );
        self.history
            .append_events(
                &namespace_id,
                &workflow_id,
                &run_id,
                vec![event],
                execution.version,
            )
            .await?;

        let timer = DurableTimer {
            timer_id: timer_id.clone(),
            namespace_id,
            workflow_id,
            run_id,
            key,
            fire_at,
        };
        self.timers.write().await.insert(timer_id.clone(), timer);
        Ok(timer_id)
    }

    /// Cancel a registered timer
    pub async fn cancel(&self, timer_id: &str) -> EngineResult<()> {
        self.timers
            .write()
            .await
            .remove(timer_id)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound(format!("timer {}", timer_id)))
    }

    /// Number of registered timers
    pub async fn len(&self) -> usize {
        self.timers.read().await.len()
    }

    /// Fire due timers until cancelled
    pub async fn run(&self, token: CancelToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(TIMER_TICK) => {}
            }

            let now = Utc::now();
            let due: Vec<DurableTimer> = {
                let timers = self.timers.read().await;
                timers
                    .values()
                    .filter(|t| t.fire_at <= now)
                    .cloned()
                    .collect()
            };

            for timer in due {
                match self.fire(&timer, now).await {
                    Ok(()) => {
                        self.timers.write().await.remove(&timer.timer_id);
                    }
                    Err(err) if err.is_retryable() => {
                        tracing::debug!(
                            timer_id = %timer.timer_id,
                            error = %err,
                            "timer fire hit transient failure, will retry"
                        );
                    }
                    Err(err) => {
                        tracing::warn!(
                            timer_id = %timer.timer_id,
                            error = %err,
                            "dropping timer"
                        );
                        self.timers.write().await.remove(&timer.timer_id);
                    }
                }
            }
        }
    }

    async fn fire(&self, timer: &DurableTimer, fired_at: DateTime<Utc>) -> EngineResult<()> {
        let execution = self
            .history
            .get_execution(
                &timer.namespace_id,
                &timer.workflow_id,
                Some(&timer.run_id),
            )
            .await?;
        if execution.is_terminal() {
            return Err(EngineError::FailedPrecondition(format!(
                "workflow {} run {} is {}",
                timer.workflow_id, timer.run_id, execution.state
            )));
        }

        let event = HistoryEvent::new(
            execution.next_event_id,
            EventType::TimerFired,
            json!({ "timerId": timer.timer_id, "key": timer.key, "firedAt": fired_at }),
        );
        self.history
            .append_events(
                &timer.namespace_id,
                &timer.workflow_id,
                &timer.run_id,
                vec![event],
                execution.version,
            )
            .await?;

        let payload = serde_json::to_value(WorkflowTask {
            namespace_id: execution.namespace_id,
            workflow_id: execution.workflow_id.clone(),
            run_id: execution.run_id,
            workflow_type: execution.workflow_type.clone(),
            task_queue: execution.task_queue.clone(),
            input: execution.input.clone().unwrap_or(serde_json::Value::Null),
        })
        .map_err(|e| EngineError::Internal(format!("task serialization failed: {}", e)))?;
        self.matching
            .enqueue_task(TaskQueueItem::new(
                execution.namespace_id,
                execution.task_queue.clone(),
                QueueType::Workflow,
                execution.workflow_id.clone(),
                execution.run_id,
                payload,
            ))
            .await?;

        tracing::debug!(timer_id = %timer.timer_id, key = %timer.key, "timer fired");
        Ok(())
    }
}
