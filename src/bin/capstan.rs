//! Orchestrator process
//!
//! Boots the engine, registers the built-in echo workflow, spawns a worker
//! on the configured task queue, and runs until interrupted.

use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use capstan::runtime::WorkflowRuntime;
use capstan::{DurableHistoryStore, Engine, EngineResult, HistoryStore, OrchestratorConfig};

#[derive(Parser, Debug)]
#[command(name = "capstan", about = "Durable workflow orchestrator")]
struct Args {
    /// Durable store directory; in-memory when omitted
    #[arg(long, env = "CAPSTAN_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Namespace to create at boot
    #[arg(long, env = "CAPSTAN_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Task queue to poll
    #[arg(long, env = "CAPSTAN_TASK_QUEUE", default_value = "default")]
    task_queue: String,

    /// Workers to spawn on the task queue
    #[arg(long, env = "CAPSTAN_WORKERS", default_value_t = 2)]
    workers: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct EchoInput {
    message: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct EchoOutput {
    message: String,
    logical_clock: u64,
}

async fn echo(runtime: Arc<WorkflowRuntime>, input: EchoInput) -> EngineResult<EchoOutput> {
    runtime.tick();
    let message = runtime
        .capture("echo::format", || async move {
            Ok(format!("echo: {}", input.message))
        })
        .await?;
    Ok(EchoOutput {
        message,
        logical_clock: runtime.logical_clock(),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = OrchestratorConfig::from_env().context("loading configuration")?;

    let engine = match &args.data_dir {
        Some(path) => {
            let store: Arc<dyn HistoryStore> =
                Arc::new(DurableHistoryStore::open(path).context("opening durable store")?);
            Engine::with_store(config, store)
        }
        None => Engine::new(config),
    };

    engine.start().await.context("starting engine")?;
    let namespace = engine
        .namespaces()
        .create(&args.namespace, engine.config().history_retention_days)
        .await
        .context("creating namespace")?;

    engine.registry().register("echo", echo);
    for _ in 0..args.workers.max(1) {
        engine.spawn_worker(namespace.id, &args.task_queue);
    }
    tracing::info!(
        namespace = %namespace.name,
        task_queue = %args.task_queue,
        "capstan is ready"
    );

    tokio::signal::ctrl_c().await.context("awaiting ctrl-c")?;
    tracing::info!("shutting down");
    engine.shutdown().await;
    Ok(())
}
