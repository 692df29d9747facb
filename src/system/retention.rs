//! Retention cleanup
//!
//! Removes closed executions once they outlive their namespace's retention
//! window, together with their replay state.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::history::{ExecutionFilter, HistoryService};
use crate::namespace::NamespaceRegistry;
use crate::runtime::ReplayStateRepository;

/// Periodic retention sweep
pub struct RetentionSweeper {
    history: Arc<HistoryService>,
    namespaces: Arc<NamespaceRegistry>,
    replay: Arc<ReplayStateRepository>,
    interval: Duration,
}

impl RetentionSweeper {
    /// Create a sweeper running every `interval`
    pub fn new(
        history: Arc<HistoryService>,
        namespaces: Arc<NamespaceRegistry>,
        replay: Arc<ReplayStateRepository>,
        interval: Duration,
    ) -> Self {
        Self {
            history,
            namespaces,
            replay,
            interval,
        }
    }

    /// Sweep until cancelled
    pub async fn run(&self, token: CancelToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            let removed = self.sweep_once().await;
            if removed > 0 {
                tracing::info!(removed, "removed executions past retention");
            }
        }
    }

    /// One sweep pass; returns how many executions were removed
    pub async fn sweep_once(&self) -> usize {
        let now = Utc::now();
        let mut removed = 0;
        for namespace in self.namespaces.list().await {
            let cutoff = now - ChronoDuration::days(i64::from(namespace.retention_days));
            let executions = match self
                .history
                .list_executions(&namespace.id, &ExecutionFilter::default())
                .await
            {
                Ok(executions) => executions,
                Err(err) => {
                    tracing::warn!(namespace = %namespace.name, error = %err, "retention listing failed");
                    continue;
                }
            };
            for execution in executions {
                let expired = execution.is_terminal()
                    && execution
                        .completed_at
                        .map(|completed| completed < cutoff)
                        .unwrap_or(false);
                if !expired {
                    continue;
                }
                match self
                    .history
                    .remove_execution(
                        &execution.namespace_id,
                        &execution.workflow_id,
                        &execution.run_id,
                    )
                    .await
                {
                    Ok(()) => {
                        self.replay.remove(&execution.run_id);
                        removed += 1;
                    }
                    Err(err) => {
                        tracing::warn!(
                            workflow_id = %execution.workflow_id,
                            error = %err,
                            "retention removal failed"
                        );
                    }
                }
            }
        }
        removed
    }
}
