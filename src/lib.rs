//! Durable workflow orchestrator
//!
//! This crate provides an execution engine in the style of
//! Temporal/Cadence that:
//! - Keeps an append-only, shard-owned history per execution with strict
//!   monotonic event IDs and optimistic concurrency on mutable state
//! - Delivers tasks from bounded FIFO queues under time-bounded leases
//!   with heartbeats, requeue, and dead-lettering
//! - Partitions the workflow key space into leased shards with
//!   expiry-driven reclamation
//! - Replays workflow code deterministically against a persisted effect
//!   store and version gates
//! - Binds polled tasks to registered workflows and persists their
//!   terminal decisions

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod cancel;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod execution;
pub mod executor;
pub mod history;
pub mod matching;
pub mod namespace;
pub mod queue;
pub mod retry;
pub mod runtime;
pub mod service;
pub mod shard;
pub mod system;
pub mod types;

pub use cancel::CancelToken;
pub use config::OrchestratorConfig;
pub use engine::Engine;
pub use error::{EngineError, EngineResult};
pub use event::{EventType, HistoryEvent};
pub use execution::{ExecutionState, WorkflowExecution};
pub use executor::{ExecutionFailure, Worker, WorkflowExecutor, WorkflowRegistry};
pub use history::{
    DurableHistoryStore, ExecutionFilter, HistoryBatch, HistoryService, HistoryStore,
    InMemoryHistoryStore,
};
pub use matching::{MatchingService, MatchingSubscription, MatchingTask, WorkflowTask};
pub use namespace::{Namespace, NamespaceRegistry, NamespaceStatus};
pub use queue::{QueueKey, QueueOptions, QueueType, TaskLease, TaskQueue, TaskQueueItem};
pub use runtime::{
    EffectStore, ExecutionContext, ReplayStateRepository, RuntimeOptions, VersionDecision,
    VersionGate, WorkflowRuntime,
};
pub use service::{
    ExecutionPage, HistoryPage, QueryConsistency, StartWorkflowRequest, StartWorkflowResponse,
    WorkflowService,
};
pub use shard::{shard_for, ShardLease, ShardManager};
pub use types::{NamespaceId, RunId, WorkerIdentity, WorkflowId};
