//! Engine assembly
//!
//! Wires the shard table, history store, queue registry, matching,
//! workflow registry, and replay state together, owns the root cancellation
//! token, and supervises the background loops and workers.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::cancel::CancelToken;
use crate::config::OrchestratorConfig;
use crate::error::EngineResult;
use crate::executor::{Worker, WorkflowRegistry};
use crate::history::{HistoryService, HistoryStore, InMemoryHistoryStore};
use crate::matching::MatchingService;
use crate::namespace::NamespaceRegistry;
use crate::queue::{QueueKey, QueueRegistry, QueueType};
use crate::runtime::ReplayStateRepository;
use crate::service::WorkflowService;
use crate::shard::ShardManager;
use crate::system::{LeaseReclaimer, RetentionSweeper, ShardKeeper, TimerWorker};
use crate::types::{NamespaceId, WorkerIdentity};

const RETENTION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// The orchestrator engine
pub struct Engine {
    config: OrchestratorConfig,
    host: WorkerIdentity,
    namespaces: Arc<NamespaceRegistry>,
    shards: Arc<ShardManager>,
    history: Arc<HistoryService>,
    matching: Arc<MatchingService>,
    registry: Arc<WorkflowRegistry>,
    replay: Arc<ReplayStateRepository>,
    service: Arc<WorkflowService>,
    timers: Arc<TimerWorker>,
    root: CancelToken,
    background: Mutex<Vec<JoinHandle<()>>>,
    worker_seq: AtomicUsize,
}

impl Engine {
    /// Build an engine over the in-memory history store
    pub fn new(config: OrchestratorConfig) -> Self {
        Self::with_store(config, Arc::new(InMemoryHistoryStore::new()))
    }

    /// Build an engine over an explicit history store
    pub fn with_store(config: OrchestratorConfig, store: Arc<dyn HistoryStore>) -> Self {
        let host = WorkerIdentity::local();
        let namespaces = Arc::new(NamespaceRegistry::new());
        let shards = Arc::new(ShardManager::new());
        let history = Arc::new(HistoryService::new(
            store,
            shards.clone(),
            host.as_str(),
            config.shard_count,
        ));
        let matching = Arc::new(MatchingService::new(Arc::new(QueueRegistry::new(
            config.queue_options(),
        ))));
        let registry = Arc::new(WorkflowRegistry::new());
        let replay = Arc::new(ReplayStateRepository::new());
        let service = Arc::new(WorkflowService::new(
            config.clone(),
            namespaces.clone(),
            history.clone(),
            matching.clone(),
            registry.clone(),
        ));
        let timers = Arc::new(TimerWorker::new(history.clone(), matching.clone()));

        Self {
            config,
            host,
            namespaces,
            shards,
            history,
            matching,
            registry,
            replay,
            service,
            timers,
            root: CancelToken::new(),
            background: Mutex::new(Vec::new()),
            worker_seq: AtomicUsize::new(0),
        }
    }

    /// Initialize shards, acquire what this host can hold, and start the
    /// system worker loops
    pub async fn start(&self) -> EngineResult<()> {
        self.config.validate()?;
        self.shards.initialize(self.config.shard_count).await?;

        let keeper = ShardKeeper::new(
            self.shards.clone(),
            self.host.as_str(),
            self.config.shard_lease_duration(),
        );
        let owned = keeper.acquire_available().await;
        tracing::info!(
            host = %self.host,
            owned,
            shard_count = self.config.shard_count,
            "engine started"
        );

        let mut background = self.background.lock();
        background.push(tokio::spawn({
            let token = self.root.child();
            async move { keeper.run(token).await }
        }));
        background.push(tokio::spawn({
            let reclaimer = LeaseReclaimer::new(
                self.matching.clone(),
                self.config.lease_sweep_interval(),
            );
            let token = self.root.child();
            async move { reclaimer.run(token).await }
        }));
        background.push(tokio::spawn({
            let sweeper = RetentionSweeper::new(
                self.history.clone(),
                self.namespaces.clone(),
                self.replay.clone(),
                RETENTION_SWEEP_INTERVAL,
            );
            let token = self.root.child();
            async move { sweeper.run(token).await }
        }));
        background.push(tokio::spawn({
            let timers = self.timers.clone();
            let token = self.root.child();
            async move { timers.run(token).await }
        }));
        Ok(())
    }

    /// Spawn a worker polling `queue_name` in `namespace_id`
    pub fn spawn_worker(&self, namespace_id: NamespaceId, queue_name: &str) -> CancelToken {
        let seq = self.worker_seq.fetch_add(1, Ordering::SeqCst);
        let worker = Worker::new(
            WorkerIdentity::new(format!("{}-worker-{}", self.host, seq)),
            self.matching.clone(),
            self.history.clone(),
            self.registry.clone(),
            self.replay.clone(),
            self.config.heartbeat_interval(),
        );
        let key = QueueKey::new(namespace_id, queue_name, QueueType::Workflow);
        let token = self.root.child();
        let worker_token = token.clone();
        self.background
            .lock()
            .push(tokio::spawn(async move { worker.run(key, worker_token).await }));
        token
    }

    /// Cancel every background loop and wait for them to stop
    pub async fn shutdown(&self) {
        self.root.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.background.lock());
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!(host = %self.host, "engine stopped");
    }

    /// Engine configuration
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// This host's identity
    pub fn host(&self) -> &WorkerIdentity {
        &self.host
    }

    /// Namespace registry
    pub fn namespaces(&self) -> Arc<NamespaceRegistry> {
        self.namespaces.clone()
    }

    /// Shard table
    pub fn shards(&self) -> Arc<ShardManager> {
        self.shards.clone()
    }

    /// Shard-checked history front-end
    pub fn history(&self) -> Arc<HistoryService> {
        self.history.clone()
    }

    /// Matching service
    pub fn matching(&self) -> Arc<MatchingService> {
        self.matching.clone()
    }

    /// Workflow type registry
    pub fn registry(&self) -> Arc<WorkflowRegistry> {
        self.registry.clone()
    }

    /// Per-run replay state
    pub fn replay(&self) -> Arc<ReplayStateRepository> {
        self.replay.clone()
    }

    /// Workflow lifecycle service
    pub fn service(&self) -> Arc<WorkflowService> {
        self.service.clone()
    }

    /// Durable timer worker
    pub fn timers(&self) -> Arc<TimerWorker> {
        self.timers.clone()
    }
}
