//! Reclamation loops
//!
//! The lease reclaimer sweeps expired task leases back onto their queues;
//! the shard keeper renews this host's shard leases and picks up whatever
//! the reclaimer of the shard table frees.

use std::sync::Arc;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::matching::MatchingService;
use crate::shard::ShardManager;

/// Periodic expired-lease sweep across all queues
pub struct LeaseReclaimer {
    matching: Arc<MatchingService>,
    interval: Duration,
}

impl LeaseReclaimer {
    /// Create a reclaimer sweeping every `interval`
    pub fn new(matching: Arc<MatchingService>, interval: Duration) -> Self {
        Self { matching, interval }
    }

    /// Sweep until cancelled
    pub async fn run(&self, token: CancelToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            let reclaimed = self.matching.reclaim_expired_leases();
            if reclaimed > 0 {
                tracing::info!(reclaimed, "reclaimed expired task leases");
            }
        }
    }
}

/// Keeps this host's shard leases alive and reclaims lapsed ones
pub struct ShardKeeper {
    shards: Arc<ShardManager>,
    owner: String,
    lease_duration: Duration,
}

impl ShardKeeper {
    /// Create a keeper for `owner`
    pub fn new(shards: Arc<ShardManager>, owner: impl Into<String>, lease_duration: Duration) -> Self {
        Self {
            shards,
            owner: owner.into(),
            lease_duration,
        }
    }

    /// Acquire every shard this host can hold; returns how many it owns
    pub async fn acquire_available(&self) -> usize {
        let mut owned = 0;
        for shard in self.shards.list_all().await {
            if self
                .shards
                .acquire_lease(shard.shard_id, &self.owner, self.lease_duration)
                .await
                .is_ok()
            {
                owned += 1;
            }
        }
        owned
    }

    /// Renew and re-acquire until cancelled
    ///
    /// Runs at a third of the lease duration so a healthy host never lets
    /// its leases lapse.
    pub async fn run(&self, token: CancelToken) {
        let interval = self.lease_duration / 3;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            let reclaimed = self.shards.reclaim_expired().await;
            if reclaimed > 0 {
                tracing::info!(reclaimed, "reclaimed expired shard leases");
            }

            let before = self.shards.owned_shards(&self.owner).await.len();
            let owned = self.acquire_available().await;
            if owned < before {
                tracing::warn!(
                    owner = %self.owner,
                    before,
                    owned,
                    "lost shard leases"
                );
            }
        }
    }
}
