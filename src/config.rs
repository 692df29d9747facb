//! Orchestrator configuration
//!
//! Defaults follow the deployment knobs below; every key can be overridden
//! through `CAPSTAN_`-prefixed environment variables, e.g.
//! `CAPSTAN_SHARD_COUNT=1024` or `CAPSTAN_LEASE_DURATION_MS=30000`.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{EngineError, EngineResult};
use crate::queue::QueueOptions;

/// Engine-wide configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Number of history shards; immutable after first initialization
    pub shard_count: u32,
    /// Default namespace retention in days
    pub history_retention_days: u32,
    /// Shard lease length granted to a history host, in milliseconds
    pub shard_lease_duration_ms: u64,
    /// Initial task lease length granted by poll, in milliseconds
    pub lease_duration_ms: u64,
    /// Target heartbeat cadence, in milliseconds
    pub heartbeat_interval_ms: u64,
    /// Sweep period for expired leases, in milliseconds
    pub lease_sweep_interval_ms: u64,
    /// Delay applied when a task is failed with requeue, in milliseconds
    pub requeue_delay_ms: u64,
    /// Delivery attempts before a task is dead-lettered
    pub max_delivery_attempts: u32,
    /// Bounded capacity per task queue
    pub task_queue_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            shard_count: 512,
            history_retention_days: 30,
            shard_lease_duration_ms: 60_000,
            lease_duration_ms: 60_000,
            heartbeat_interval_ms: 30_000,
            lease_sweep_interval_ms: 30_000,
            requeue_delay_ms: 5_000,
            max_delivery_attempts: 5,
            task_queue_capacity: 1024,
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration: defaults layered under the process environment
    pub fn from_env() -> EngineResult<Self> {
        let settings = config::Config::builder()
            .add_source(
                config::Config::try_from(&OrchestratorConfig::default())
                    .map_err(|e| EngineError::Internal(format!("config defaults: {}", e)))?,
            )
            .add_source(config::Environment::with_prefix("CAPSTAN").try_parsing(true))
            .build()
            .map_err(|e| EngineError::InvalidArgument(format!("configuration: {}", e)))?;

        let cfg: OrchestratorConfig = settings
            .try_deserialize()
            .map_err(|e| EngineError::InvalidArgument(format!("configuration: {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> EngineResult<()> {
        if self.shard_count == 0 {
            return Err(EngineError::InvalidArgument(
                "shard_count must be positive".to_string(),
            ));
        }
        if self.lease_duration_ms == 0 {
            return Err(EngineError::InvalidArgument(
                "lease_duration_ms must be positive".to_string(),
            ));
        }
        if self.max_delivery_attempts == 0 {
            return Err(EngineError::InvalidArgument(
                "max_delivery_attempts must be positive".to_string(),
            ));
        }
        if self.task_queue_capacity == 0 {
            return Err(EngineError::InvalidArgument(
                "task_queue_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Shard lease length
    pub fn shard_lease_duration(&self) -> Duration {
        Duration::from_millis(self.shard_lease_duration_ms)
    }

    /// Task lease length
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    /// Heartbeat cadence
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Expired-lease sweep period
    pub fn lease_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.lease_sweep_interval_ms)
    }

    /// Requeue delay
    pub fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_delay_ms)
    }

    /// Per-queue options derived from this configuration
    pub fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            capacity: self.task_queue_capacity,
            lease_duration: self.lease_duration(),
            requeue_delay: self.requeue_delay(),
            max_delivery_attempts: self.max_delivery_attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.shard_count, 512);
        assert_eq!(cfg.history_retention_days, 30);
        assert_eq!(cfg.lease_duration(), Duration::from_secs(60));
        assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(cfg.lease_sweep_interval(), Duration::from_secs(30));
        assert_eq!(cfg.requeue_delay(), Duration::from_secs(5));
        assert_eq!(cfg.max_delivery_attempts, 5);
        assert_eq!(cfg.task_queue_capacity, 1024);
    }

    #[test]
    fn test_validate_rejects_zero_shards() {
        let cfg = OrchestratorConfig {
            shard_count: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
