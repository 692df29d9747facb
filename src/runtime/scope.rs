//! The per-run runtime scope
//!
//! Opened by the executor when it begins processing a task, closed
//! unconditionally (on drop) before the task settles. A run has at most one
//! open scope at a time; the handle is passed explicitly to the workflow
//! function.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::context::ExecutionContext;
use super::effects::EffectRecord;
use super::replay::RunReplayState;
use super::versions::VersionDecision;
use crate::cancel::CancelToken;
use crate::error::{EngineError, EngineResult};
use crate::types::{NamespaceId, RunId, WorkflowId};

/// Everything needed to open a runtime scope for one attempt
pub struct RuntimeOptions {
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
    /// Logical clock value the attempt starts from
    pub initial_logical_clock: u64,
    /// Ambient metadata
    pub metadata: HashMap<String, String>,
    /// Cancellation threaded from the worker
    pub cancellation: CancelToken,
    /// Replay state persisted across attempts of this run
    pub state: Arc<RunReplayState>,
}

/// Open runtime scope handed to workflow code
#[derive(Debug)]
pub struct WorkflowRuntime {
    context: ExecutionContext,
    state: Arc<RunReplayState>,
    clock: AtomicU64,
    cancellation: CancelToken,
}

impl WorkflowRuntime {
    /// Open the scope; fails if the run already has one open
    pub fn open(options: RuntimeOptions) -> EngineResult<Self> {
        let replay_count = options.state.open_scope()?;
        let context = ExecutionContext {
            namespace_id: options.namespace_id,
            workflow_id: options.workflow_id,
            run_id: options.run_id,
            task_queue: options.task_queue,
            started_at: options.started_at,
            logical_clock: options.initial_logical_clock,
            replay_count,
            metadata: options.metadata,
        };
        Ok(Self {
            context,
            state: options.state,
            clock: AtomicU64::new(options.initial_logical_clock),
            cancellation: options.cancellation,
        })
    }

    /// Immutable context snapshot
    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Cancellation signal for this attempt
    pub fn cancellation(&self) -> &CancelToken {
        &self.cancellation
    }

    /// Run a side effect exactly once per run
    ///
    /// If `effect_id` has a recorded result, that result (success or
    /// failure) is returned without invoking `effect`. Otherwise the effect
    /// runs and its outcome is recorded first. Cancellation is not an
    /// outcome and is never recorded.
    pub async fn capture<T, F, Fut>(&self, effect_id: &str, effect: F) -> EngineResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        if let Some(record) = self.state.effects.get(effect_id) {
            return match record {
                EffectRecord::Success(payload) => {
                    serde_json::from_value(payload).map_err(|e| {
                        EngineError::NonDeterministic(format!(
                            "effect {} replayed with an incompatible payload shape: {}",
                            effect_id, e
                        ))
                    })
                }
                EffectRecord::Failure { code, message } => {
                    Err(EngineError::from_code(&code, message))
                }
            };
        }

        match effect().await {
            Ok(value) => {
                let payload = serde_json::to_value(&value).map_err(|e| {
                    EngineError::Internal(format!(
                        "effect {} result serialization failed: {}",
                        effect_id, e
                    ))
                })?;
                self.state.effects.record_success(effect_id, payload)?;
                Ok(value)
            }
            Err(EngineError::Canceled) => Err(EngineError::Canceled),
            Err(err) => {
                self.state.effects.record_failure(effect_id, &err)?;
                Err(err)
            }
        }
    }

    /// Resolve a change point with the default chooser (`max`)
    pub fn require_version(
        &self,
        change_id: &str,
        min: u32,
        max: u32,
    ) -> EngineResult<VersionDecision> {
        self.state.versions.require(change_id, min, max)
    }

    /// Resolve a change point with an explicit initial chooser
    pub fn require_version_with(
        &self,
        change_id: &str,
        min: u32,
        max: u32,
        chooser: impl FnOnce(u32) -> u32,
    ) -> EngineResult<VersionDecision> {
        self.state.versions.require_with(change_id, min, max, chooser)
    }

    /// Advance the logical clock; returns the new value
    pub fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Current logical clock value
    pub fn logical_clock(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    /// Ambient metadata lookup
    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.context.metadata.get(key).map(String::as_str)
    }
}

impl Drop for WorkflowRuntime {
    fn drop(&mut self) {
        self.state.close_scope();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn options(state: Arc<RunReplayState>) -> RuntimeOptions {
        RuntimeOptions {
            namespace_id: NamespaceId::new(),
            workflow_id: WorkflowId::new("wf-1"),
            run_id: RunId::new(),
            task_queue: "orders".to_string(),
            started_at: Utc::now(),
            initial_logical_clock: 0,
            metadata: HashMap::from([("region".to_string(), "eu-1".to_string())]),
            cancellation: CancelToken::new(),
            state,
        }
    }

    #[tokio::test]
    async fn test_capture_runs_effect_once_across_scopes() {
        let state = Arc::new(RunReplayState::default());
        let invocations = Arc::new(AtomicU32::new(0));

        for attempt in 0..2 {
            let runtime =
                WorkflowRuntime::open(options(state.clone())).expect("open failed");
            assert_eq!(runtime.context().replay_count, attempt);
            let counter = invocations.clone();
            let value: serde_json::Value = runtime
                .capture("payment::ORD-0001", || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!({"transactionId": "T1"}))
                })
                .await
                .expect("capture failed");
            assert_eq!(value, json!({"transactionId": "T1"}));
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_capture_replays_failure() {
        let state = Arc::new(RunReplayState::default());
        {
            let runtime =
                WorkflowRuntime::open(options(state.clone())).expect("open failed");
            let result: EngineResult<serde_json::Value> = runtime
                .capture("charge", || async { Err(EngineError::Timeout) })
                .await;
            assert_eq!(result, Err(EngineError::Timeout));
        }
        let runtime = WorkflowRuntime::open(options(state)).expect("open failed");
        let invoked = Arc::new(AtomicU32::new(0));
        let counter = invoked.clone();
        let result: EngineResult<serde_json::Value> = runtime
            .capture("charge", || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!(1))
            })
            .await;
        assert_eq!(result, Err(EngineError::Timeout));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancellation_is_not_recorded() {
        let state = Arc::new(RunReplayState::default());
        {
            let runtime =
                WorkflowRuntime::open(options(state.clone())).expect("open failed");
            let result: EngineResult<u32> = runtime
                .capture("flaky", || async { Err(EngineError::Canceled) })
                .await;
            assert_eq!(result, Err(EngineError::Canceled));
        }
        let runtime = WorkflowRuntime::open(options(state)).expect("open failed");
        let result: u32 = runtime
            .capture("flaky", || async { Ok(7) })
            .await
            .expect("effect must run after a canceled attempt");
        assert_eq!(result, 7);
    }

    #[tokio::test]
    async fn test_logical_clock_restarts_per_attempt() {
        let state = Arc::new(RunReplayState::default());
        {
            let runtime =
                WorkflowRuntime::open(options(state.clone())).expect("open failed");
            assert_eq!(runtime.tick(), 1);
            assert_eq!(runtime.tick(), 2);
        }
        let runtime = WorkflowRuntime::open(options(state)).expect("open failed");
        assert_eq!(runtime.logical_clock(), 0);
        assert_eq!(runtime.tick(), 1);
    }

    #[tokio::test]
    async fn test_nested_scope_is_rejected() {
        let state = Arc::new(RunReplayState::default());
        let _open = WorkflowRuntime::open(options(state.clone())).expect("open failed");
        let err = WorkflowRuntime::open(options(state)).expect_err("nested open must fail");
        assert!(matches!(err, EngineError::FailedPrecondition(_)));
    }

    #[tokio::test]
    async fn test_metadata_lookup() {
        let state = Arc::new(RunReplayState::default());
        let runtime = WorkflowRuntime::open(options(state)).expect("open failed");
        assert_eq!(runtime.metadata("region"), Some("eu-1"));
        assert_eq!(runtime.metadata("missing"), None);
    }
}
