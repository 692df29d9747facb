//! Workflow lifecycle operations
//!
//! The in-process service surface consumed by API adapters: start, get,
//! signal, query, terminate, cancel, list, and history reads. Wire encoding
//! is a collaborator's concern; errors carry their wire code via
//! [`EngineError::code`](crate::error::EngineError::code).

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

use crate::config::OrchestratorConfig;
use crate::error::{EngineError, EngineResult};
use crate::event::{EventType, HistoryEvent};
use crate::execution::WorkflowExecution;
use crate::executor::WorkflowRegistry;
use crate::history::{ExecutionFilter, HistoryService};
use crate::matching::{MatchingService, WorkflowTask};
use crate::namespace::NamespaceRegistry;
use crate::queue::{QueueType, TaskQueueItem};
use crate::retry::{with_backoff, BackoffPolicy};
use crate::types::{deadline_after, NamespaceId, RunId, WorkflowId};

/// How long a history long-poll waits for a new event
const HISTORY_LONG_POLL_TIMEOUT: Duration = Duration::from_secs(10);
const HISTORY_LONG_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Start request
#[derive(Debug, Clone)]
pub struct StartWorkflowRequest {
    /// Target namespace
    pub namespace_id: NamespaceId,
    /// Registered workflow type name
    pub workflow_type: String,
    /// Task queue to dispatch on
    pub task_queue: String,
    /// Caller-chosen workflow ID; generated when absent
    pub workflow_id: Option<WorkflowId>,
    /// Start input
    pub input: Option<serde_json::Value>,
    /// Overall execution deadline
    pub execution_timeout: Option<Duration>,
}

/// Start response
#[derive(Debug, Clone)]
pub struct StartWorkflowResponse {
    /// The workflow ID the run was started under
    pub workflow_id: WorkflowId,
    /// The new run
    pub run_id: RunId,
}

/// Read consistency requested by a query
///
/// A single-store deployment serves both levels identically; the parameter
/// is carried so a wire façade can pass it through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryConsistency {
    /// Serve from the freshest locally visible state
    #[default]
    Eventual,
    /// Serve only after pending updates are applied
    Strong,
}

/// One page of execution listings
#[derive(Debug, Clone)]
pub struct ExecutionPage {
    /// Executions in creation order
    pub executions: Vec<WorkflowExecution>,
    /// Opaque token for the next page, absent on the last page
    pub next_page_token: Option<String>,
}

/// One page of history events
#[derive(Debug, Clone)]
pub struct HistoryPage {
    /// Events in ID order
    pub events: Vec<HistoryEvent>,
    /// Opaque token for the next page, absent once history is exhausted
    pub next_page_token: Option<String>,
}

/// The workflow lifecycle service
pub struct WorkflowService {
    config: OrchestratorConfig,
    namespaces: Arc<NamespaceRegistry>,
    history: Arc<HistoryService>,
    matching: Arc<MatchingService>,
    registry: Arc<WorkflowRegistry>,
    backoff: BackoffPolicy,
}

impl WorkflowService {
    /// Wire the service over its collaborators
    pub fn new(
        config: OrchestratorConfig,
        namespaces: Arc<NamespaceRegistry>,
        history: Arc<HistoryService>,
        matching: Arc<MatchingService>,
        registry: Arc<WorkflowRegistry>,
    ) -> Self {
        Self {
            config,
            namespaces,
            history,
            matching,
            registry,
            backoff: BackoffPolicy::default(),
        }
    }

    /// Start a new workflow execution and schedule its first task
    pub async fn start_workflow(
        &self,
        request: StartWorkflowRequest,
    ) -> EngineResult<StartWorkflowResponse> {
        if request.workflow_type.is_empty() {
            return Err(EngineError::InvalidArgument(
                "workflow_type must not be empty".to_string(),
            ));
        }
        if request.task_queue.is_empty() {
            return Err(EngineError::InvalidArgument(
                "task_queue must not be empty".to_string(),
            ));
        }
        let namespace = self
            .namespaces
            .get(&request.namespace_id)
            .await
            .map_err(|_| {
                EngineError::InvalidArgument(format!(
                    "unknown namespace {}",
                    request.namespace_id
                ))
            })?;
        self.namespaces.require_active(&namespace.id).await?;

        let workflow_id = request
            .workflow_id
            .unwrap_or_else(WorkflowId::generate);
        let run_id = RunId::new();
        let execution = WorkflowExecution::new(
            request.namespace_id,
            workflow_id.clone(),
            run_id,
            request.workflow_type.clone(),
            request.task_queue.clone(),
            request.input.clone(),
            self.config.shard_count,
        );

        let started_event = HistoryEvent::new(
            1,
            EventType::WorkflowExecutionStarted,
            json!({
                "workflowType": request.workflow_type,
                "taskQueue": request.task_queue,
                "input": request.input,
            }),
        );
        self.history
            .create_execution(execution, vec![started_event])
            .await?;

        let payload = serde_json::to_value(WorkflowTask {
            namespace_id: request.namespace_id,
            workflow_id: workflow_id.clone(),
            run_id,
            workflow_type: request.workflow_type,
            task_queue: request.task_queue.clone(),
            input: request.input.unwrap_or(serde_json::Value::Null),
        })
        .map_err(|e| EngineError::Internal(format!("task serialization failed: {}", e)))?;

        let mut item = TaskQueueItem::new(
            request.namespace_id,
            request.task_queue,
            QueueType::Workflow,
            workflow_id.clone(),
            run_id,
            payload,
        );
        if let Some(timeout) = request.execution_timeout {
            item = item.expires_at(deadline_after(Utc::now(), timeout));
        }
        self.matching.enqueue_task(item).await?;

        tracing::info!(workflow_id = %workflow_id, run_id = %run_id, "workflow started");
        Ok(StartWorkflowResponse {
            workflow_id,
            run_id,
        })
    }

    /// Fetch the execution record; `run_id = None` resolves the latest run
    pub async fn get_workflow(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        run_id: Option<&RunId>,
    ) -> EngineResult<WorkflowExecution> {
        self.history
            .get_execution(namespace_id, workflow_id, run_id)
            .await
    }

    /// Deliver an external signal to a running workflow
    pub async fn signal_workflow(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        run_id: Option<&RunId>,
        signal_name: &str,
        input: Option<serde_json::Value>,
    ) -> EngineResult<()> {
        if signal_name.is_empty() {
            return Err(EngineError::InvalidArgument(
                "signal_name must not be empty".to_string(),
            ));
        }
        let execution = with_backoff(&self.backoff, "signal-workflow", || {
            let input = input.clone();
            async move {
                let execution = self
                    .history
                    .get_execution(namespace_id, workflow_id, run_id)
                    .await?;
                if execution.is_terminal() {
                    return Err(EngineError::FailedPrecondition(format!(
                        "workflow {} run {} is {}",
                        workflow_id, execution.run_id, execution.state
                    )));
                }
                let event = HistoryEvent::new(
                    execution.next_event_id,
                    EventType::WorkflowExecutionSignaled,
                    json!({ "signalName": signal_name, "input": input }),
                );
                self.history
                    .append_events(
                        namespace_id,
                        workflow_id,
                        &execution.run_id,
                        vec![event],
                        execution.version,
                    )
                    .await
            }
        })
        .await?;

        // Wake the workflow so it can observe the signal.
        self.enqueue_workflow_task(&execution).await?;
        Ok(())
    }

    /// Run a registered read-only query against an execution
    pub async fn query_workflow(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        run_id: Option<&RunId>,
        query_name: &str,
        input: Option<serde_json::Value>,
        _consistency: QueryConsistency,
    ) -> EngineResult<serde_json::Value> {
        let execution = self
            .history
            .get_execution(namespace_id, workflow_id, run_id)
            .await?;
        let handler = self
            .registry
            .get_query(&execution.workflow_type, query_name)
            .ok_or_else(|| {
                EngineError::InvalidArgument(format!(
                    "query {} is not registered for workflow type {}",
                    query_name, execution.workflow_type
                ))
            })?;
        handler(&execution, input)
    }

    /// Close a run immediately by operator request
    pub async fn terminate_workflow(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        run_id: Option<&RunId>,
        reason: &str,
    ) -> EngineResult<()> {
        with_backoff(&self.backoff, "terminate-workflow", || async move {
            self.history
                .terminate(namespace_id, workflow_id, run_id, reason)
                .await
        })
        .await?;
        Ok(())
    }

    /// Request cooperative cancellation; the workflow observes a cancel
    /// signal rather than being closed immediately
    pub async fn cancel_workflow(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        run_id: Option<&RunId>,
        reason: &str,
    ) -> EngineResult<()> {
        let execution = with_backoff(&self.backoff, "cancel-workflow", || async move {
            let mut execution = self
                .history
                .get_execution(namespace_id, workflow_id, run_id)
                .await?;
            if execution.is_terminal() {
                return Err(EngineError::FailedPrecondition(format!(
                    "workflow {} run {} is {}",
                    workflow_id, execution.run_id, execution.state
                )));
            }
            let expected_version = execution.version;
            let event = HistoryEvent::new(
                execution.next_event_id,
                EventType::WorkflowExecutionCancelRequested,
                json!({ "reason": reason }),
            );
            execution.cancel_requested = true;
            self.history
                .update_with_events(&execution, expected_version, vec![event])
                .await
        })
        .await?;

        self.enqueue_workflow_task(&execution).await?;
        Ok(())
    }

    /// Page through executions in a namespace
    pub async fn list_workflow_executions(
        &self,
        namespace_id: &NamespaceId,
        filter: ExecutionFilter,
        page_size: usize,
        page_token: Option<&str>,
    ) -> EngineResult<ExecutionPage> {
        let page_size = if page_size == 0 { 100 } else { page_size };
        let offset = parse_token(page_token)?;
        let all = self.history.list_executions(namespace_id, &filter).await?;

        let executions: Vec<WorkflowExecution> =
            all.iter().skip(offset).take(page_size).cloned().collect();
        let next_offset = offset + executions.len();
        let next_page_token = if next_offset < all.len() {
            Some(next_offset.to_string())
        } else {
            None
        };
        Ok(ExecutionPage {
            executions,
            next_page_token,
        })
    }

    /// Page through a run's history; optionally long-poll for a new event
    pub async fn get_workflow_history(
        &self,
        namespace_id: &NamespaceId,
        workflow_id: &WorkflowId,
        run_id: Option<&RunId>,
        max_page_size: usize,
        page_token: Option<&str>,
        wait_new_event: bool,
    ) -> EngineResult<HistoryPage> {
        let max_page_size = if max_page_size == 0 { 256 } else { max_page_size };
        let execution = self
            .history
            .get_execution(namespace_id, workflow_id, run_id)
            .await?;
        let from = match page_token {
            Some(token) => parse_token(Some(token))? as i64,
            None => 1,
        };

        let deadline = tokio::time::Instant::now() + HISTORY_LONG_POLL_TIMEOUT;
        loop {
            let batch = self
                .history
                .get_history(
                    namespace_id,
                    workflow_id,
                    &execution.run_id,
                    from,
                    max_page_size,
                )
                .await?;
            if !batch.events.is_empty() || !wait_new_event {
                let next_page_token = if batch.is_last {
                    None
                } else {
                    Some((batch.last_id + 1).to_string())
                };
                return Ok(HistoryPage {
                    events: batch.events,
                    next_page_token,
                });
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(HistoryPage {
                    events: Vec::new(),
                    next_page_token: Some(from.to_string()),
                });
            }
            tokio::time::sleep(HISTORY_LONG_POLL_INTERVAL).await;
        }
    }

    async fn enqueue_workflow_task(&self, execution: &WorkflowExecution) -> EngineResult<()> {
        let payload = serde_json::to_value(WorkflowTask {
            namespace_id: execution.namespace_id,
            workflow_id: execution.workflow_id.clone(),
            run_id: execution.run_id,
            workflow_type: execution.workflow_type.clone(),
            task_queue: execution.task_queue.clone(),
            input: execution.input.clone().unwrap_or(serde_json::Value::Null),
        })
        .map_err(|e| EngineError::Internal(format!("task serialization failed: {}", e)))?;
        let item = TaskQueueItem::new(
            execution.namespace_id,
            execution.task_queue.clone(),
            QueueType::Workflow,
            execution.workflow_id.clone(),
            execution.run_id,
            payload,
        );
        self.matching.enqueue_task(item).await?;
        Ok(())
    }
}

fn parse_token(token: Option<&str>) -> EngineResult<usize> {
    match token {
        None => Ok(0),
        Some(token) => token
            .parse::<usize>()
            .map_err(|_| EngineError::InvalidArgument(format!("malformed page token {}", token))),
    }
}
