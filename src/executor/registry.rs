//! Workflow type registry
//!
//! Stores, per registered type name, a decode closure and an executor
//! closure over opaque JSON. Type safety lives at registration time: the
//! typed input/output of the workflow function are erased here and
//! reconstructed at dispatch through the pair the registration created.

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::error::{EngineError, EngineResult};
use crate::execution::WorkflowExecution;
use crate::runtime::WorkflowRuntime;

type DecodeFn =
    Arc<dyn Fn(serde_json::Value) -> EngineResult<Box<dyn Any + Send>> + Send + Sync>;
type RunFn = Arc<
    dyn Fn(
            Arc<WorkflowRuntime>,
            Box<dyn Any + Send>,
        ) -> BoxFuture<'static, EngineResult<serde_json::Value>>
        + Send
        + Sync,
>;

/// Read-only query over an execution's visible state
pub type QueryHandler = Arc<
    dyn Fn(&WorkflowExecution, Option<serde_json::Value>) -> EngineResult<serde_json::Value>
        + Send
        + Sync,
>;

/// One registered workflow type
#[derive(Clone)]
pub struct RegisteredWorkflow {
    /// Registered type name
    pub type_name: String,
    decode: DecodeFn,
    run: RunFn,
}

impl RegisteredWorkflow {
    /// Decode an opaque input into the registered input type
    pub fn decode(&self, input: serde_json::Value) -> EngineResult<Box<dyn Any + Send>> {
        (self.decode)(input)
    }

    /// Invoke the workflow function with a decoded input
    pub fn invoke(
        &self,
        runtime: Arc<WorkflowRuntime>,
        input: Box<dyn Any + Send>,
    ) -> BoxFuture<'static, EngineResult<serde_json::Value>> {
        (self.run)(runtime, input)
    }
}

/// Registry of workflow types and query handlers
pub struct WorkflowRegistry {
    workflows: RwLock<HashMap<String, RegisteredWorkflow>>,
    queries: RwLock<HashMap<(String, String), QueryHandler>>,
}

impl WorkflowRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
            queries: RwLock::new(HashMap::new()),
        }
    }

    /// Register a workflow function under `type_name`
    ///
    /// The function receives the runtime handle and its typed input; its
    /// typed output is serialized back to opaque JSON at dispatch.
    pub fn register<I, O, F, Fut>(&self, type_name: impl Into<String>, workflow: F)
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + 'static,
        F: Fn(Arc<WorkflowRuntime>, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = EngineResult<O>> + Send + 'static,
    {
        let type_name = type_name.into();
        let workflow = Arc::new(workflow);

        let decode: DecodeFn = Arc::new(|input: serde_json::Value| {
            let input: I = serde_json::from_value(input)
                .map_err(|e| EngineError::InvalidArgument(e.to_string()))?;
            Ok(Box::new(input) as Box<dyn Any + Send>)
        });

        let run: RunFn = Arc::new(move |runtime, input: Box<dyn Any + Send>| {
            let workflow = workflow.clone();
            Box::pin(async move {
                let input = input.downcast::<I>().map_err(|_| {
                    EngineError::Internal("workflow input type mismatch".to_string())
                })?;
                let output = workflow(runtime, *input).await?;
                serde_json::to_value(output).map_err(|e| {
                    EngineError::Internal(format!("output serialization failed: {}", e))
                })
            })
        });

        self.workflows.write().insert(
            type_name.clone(),
            RegisteredWorkflow {
                type_name,
                decode,
                run,
            },
        );
    }

    /// Register a query handler for `(type_name, query_name)`
    pub fn register_query<F>(
        &self,
        type_name: impl Into<String>,
        query_name: impl Into<String>,
        handler: F,
    ) where
        F: Fn(&WorkflowExecution, Option<serde_json::Value>) -> EngineResult<serde_json::Value>
            + Send
            + Sync
            + 'static,
    {
        self.queries
            .write()
            .insert((type_name.into(), query_name.into()), Arc::new(handler));
    }

    /// Resolve a workflow type
    pub fn get(&self, type_name: &str) -> Option<RegisteredWorkflow> {
        self.workflows.read().get(type_name).cloned()
    }

    /// Resolve a query handler
    pub fn get_query(&self, type_name: &str, query_name: &str) -> Option<QueryHandler> {
        self.queries
            .read()
            .get(&(type_name.to_string(), query_name.to_string()))
            .cloned()
    }

    /// Registered type names
    pub fn registered_types(&self) -> Vec<String> {
        self.workflows.read().keys().cloned().collect()
    }
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelToken;
    use crate::runtime::{RunReplayState, RuntimeOptions};
    use crate::types::{NamespaceId, RunId, WorkflowId};
    use chrono::Utc;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct EchoInput {
        message: String,
    }

    fn runtime() -> Arc<WorkflowRuntime> {
        Arc::new(
            WorkflowRuntime::open(RuntimeOptions {
                namespace_id: NamespaceId::new(),
                workflow_id: WorkflowId::new("wf-1"),
                run_id: RunId::new(),
                task_queue: "orders".to_string(),
                started_at: Utc::now(),
                initial_logical_clock: 0,
                metadata: HashMap::new(),
                cancellation: CancelToken::new(),
                state: Arc::new(RunReplayState::default()),
            })
            .expect("open failed"),
        )
    }

    #[tokio::test]
    async fn test_registered_workflow_round_trips_types() {
        let registry = WorkflowRegistry::new();
        registry.register(
            "echo",
            |_runtime: Arc<WorkflowRuntime>, input: EchoInput| async move {
                Ok(format!("echo: {}", input.message))
            },
        );

        let registered = registry.get("echo").expect("type must resolve");
        let input = registered
            .decode(json!({"message": "hello"}))
            .expect("decode failed");
        let output = registered
            .invoke(runtime(), input)
            .await
            .expect("invoke failed");
        assert_eq!(output, json!("echo: hello"));
    }

    #[tokio::test]
    async fn test_decode_rejects_wrong_shape() {
        let registry = WorkflowRegistry::new();
        registry.register(
            "echo",
            |_runtime: Arc<WorkflowRuntime>, input: EchoInput| async move {
                Ok(input.message)
            },
        );
        let registered = registry.get("echo").expect("type must resolve");
        let err = registered
            .decode(json!({"wrong": 1}))
            .expect_err("decode must fail");
        assert!(matches!(err, EngineError::InvalidArgument(_)));
    }

    #[test]
    fn test_unknown_type_is_none() {
        let registry = WorkflowRegistry::new();
        assert!(registry.get("missing").is_none());
    }
}
