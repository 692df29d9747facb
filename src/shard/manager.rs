//! Lease-based shard ownership
//!
//! Acquire succeeds when a shard is unowned, its lease has lapsed, or the
//! caller already owns it. Losing a lease does not stop in-flight work on the
//! losing host; the store's versioned update is what rejects its late writes.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use super::ShardLease;
use crate::error::{EngineError, EngineResult};
use crate::types::deadline_after;

/// Shard table with lease operations
pub struct ShardManager {
    shards: Arc<RwLock<HashMap<u32, ShardLease>>>,
}

impl ShardManager {
    /// Create an empty shard table; call [`ShardManager::initialize`] before use
    pub fn new() -> Self {
        Self {
            shards: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Idempotently create `shard_count` rows with evenly split hash ranges
    /// over the positive signed-64-bit range
    pub async fn initialize(&self, shard_count: u32) -> EngineResult<()> {
        if shard_count == 0 {
            return Err(EngineError::InvalidArgument(
                "shard_count must be positive".to_string(),
            ));
        }
        let mut shards = self.shards.write().await;
        if !shards.is_empty() {
            if shards.len() != shard_count as usize {
                return Err(EngineError::FailedPrecondition(format!(
                    "shard table already initialized with {} shards",
                    shards.len()
                )));
            }
            return Ok(());
        }
        let step = i64::MAX / i64::from(shard_count);
        for shard_id in 0..shard_count {
            let range_start = i64::from(shard_id) * step;
            let range_end = if shard_id == shard_count - 1 {
                i64::MAX
            } else {
                i64::from(shard_id + 1) * step
            };
            shards.insert(
                shard_id,
                ShardLease {
                    shard_id,
                    owner: None,
                    lease_expires_at: None,
                    range_start,
                    range_end,
                    last_heartbeat: None,
                },
            );
        }
        Ok(())
    }

    /// Take or extend ownership of a shard
    ///
    /// Succeeds iff the shard is unowned, its recorded lease has lapsed, or
    /// the caller is already the owner. Returns `ShardUnavailable` otherwise;
    /// callers back off and retry rather than block.
    pub async fn acquire_lease(
        &self,
        shard_id: u32,
        owner: &str,
        lease_duration: Duration,
    ) -> EngineResult<ShardLease> {
        let now = Utc::now();
        let mut shards = self.shards.write().await;
        let shard = shards
            .get_mut(&shard_id)
            .ok_or_else(|| EngineError::NotFound(format!("shard {}", shard_id)))?;

        let available = match &shard.owner {
            None => true,
            Some(current) => current == owner || shard.is_expired(now),
        };
        if !available {
            return Err(EngineError::ShardUnavailable(format!(
                "shard {} is leased to {}",
                shard_id,
                shard.owner.as_deref().unwrap_or("unknown")
            )));
        }

        shard.owner = Some(owner.to_string());
        shard.lease_expires_at = Some(deadline_after(now, lease_duration));
        shard.last_heartbeat = Some(now);
        Ok(shard.clone())
    }

    /// Extend a lease the caller still holds
    pub async fn renew_lease(
        &self,
        shard_id: u32,
        owner: &str,
        extend_by: Duration,
    ) -> EngineResult<ShardLease> {
        let now = Utc::now();
        let mut shards = self.shards.write().await;
        let shard = shards
            .get_mut(&shard_id)
            .ok_or_else(|| EngineError::NotFound(format!("shard {}", shard_id)))?;

        if !shard.is_held_by(owner, now) {
            return Err(EngineError::ShardUnavailable(format!(
                "shard {} is not held by {}",
                shard_id, owner
            )));
        }
        shard.lease_expires_at = Some(deadline_after(now, extend_by));
        shard.last_heartbeat = Some(now);
        Ok(shard.clone())
    }

    /// Clear ownership; must be caller-owned
    pub async fn release_lease(&self, shard_id: u32, owner: &str) -> EngineResult<()> {
        let mut shards = self.shards.write().await;
        let shard = shards
            .get_mut(&shard_id)
            .ok_or_else(|| EngineError::NotFound(format!("shard {}", shard_id)))?;
        if shard.owner.as_deref() != Some(owner) {
            return Err(EngineError::FailedPrecondition(format!(
                "shard {} is not owned by {}",
                shard_id, owner
            )));
        }
        shard.owner = None;
        shard.lease_expires_at = None;
        shard.last_heartbeat = None;
        Ok(())
    }

    /// Current row for one shard
    pub async fn get_lease(&self, shard_id: u32) -> Option<ShardLease> {
        let shards = self.shards.read().await;
        shards.get(&shard_id).cloned()
    }

    /// Shards currently leased (unexpired) to `owner`
    pub async fn owned_shards(&self, owner: &str) -> Vec<u32> {
        let now = Utc::now();
        let shards = self.shards.read().await;
        let mut owned: Vec<u32> = shards
            .values()
            .filter(|s| s.is_held_by(owner, now))
            .map(|s| s.shard_id)
            .collect();
        owned.sort_unstable();
        owned
    }

    /// Every shard row
    pub async fn list_all(&self) -> Vec<ShardLease> {
        let shards = self.shards.read().await;
        let mut all: Vec<ShardLease> = shards.values().cloned().collect();
        all.sort_unstable_by_key(|s| s.shard_id);
        all
    }

    /// Clear ownership on all shards whose lease has lapsed; returns how many
    pub async fn reclaim_expired(&self) -> usize {
        let now = Utc::now();
        let mut shards = self.shards.write().await;
        let mut reclaimed = 0;
        for shard in shards.values_mut() {
            if shard.owner.is_some() && shard.is_expired(now) {
                tracing::info!(
                    shard_id = shard.shard_id,
                    owner = shard.owner.as_deref().unwrap_or(""),
                    "reclaiming expired shard lease"
                );
                shard.owner = None;
                shard.lease_expires_at = None;
                shard.last_heartbeat = None;
                reclaimed += 1;
            }
        }
        reclaimed
    }
}

impl Default for ShardManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn manager(n: u32) -> ShardManager {
        let manager = ShardManager::new();
        manager.initialize(n).await.expect("initialize failed");
        manager
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent_and_covers_range() {
        let manager = manager(8).await;
        manager.initialize(8).await.expect("reinitialize failed");
        let all = manager.list_all().await;
        assert_eq!(all.len(), 8);
        assert_eq!(all[0].range_start, 0);
        assert_eq!(all[7].range_end, i64::MAX);
        for pair in all.windows(2) {
            assert_eq!(pair[0].range_end, pair[1].range_start);
            assert!(pair[0].range_end > pair[0].range_start);
        }
    }

    #[tokio::test]
    async fn test_acquire_excludes_second_owner() {
        let manager = manager(4).await;
        manager
            .acquire_lease(2, "host-a", Duration::from_secs(60))
            .await
            .expect("acquire failed");
        let err = manager
            .acquire_lease(2, "host-b", Duration::from_secs(60))
            .await
            .expect_err("host-b must be rejected");
        assert!(matches!(err, EngineError::ShardUnavailable(_)));
    }

    #[tokio::test]
    async fn test_reacquire_by_owner_is_idempotent() {
        let manager = manager(4).await;
        manager
            .acquire_lease(1, "host-a", Duration::from_secs(60))
            .await
            .expect("acquire failed");
        let lease = manager
            .acquire_lease(1, "host-a", Duration::from_secs(60))
            .await
            .expect("re-acquire by owner must succeed");
        assert_eq!(lease.owner.as_deref(), Some("host-a"));
    }

    #[tokio::test]
    async fn test_expired_lease_is_acquirable() {
        let manager = manager(4).await;
        manager
            .acquire_lease(3, "host-a", Duration::from_millis(20))
            .await
            .expect("acquire failed");
        tokio::time::sleep(Duration::from_millis(40)).await;
        let lease = manager
            .acquire_lease(3, "host-b", Duration::from_secs(60))
            .await
            .expect("takeover must succeed after expiry");
        assert_eq!(lease.owner.as_deref(), Some("host-b"));
    }

    #[tokio::test]
    async fn test_renew_requires_live_lease() {
        let manager = manager(4).await;
        manager
            .acquire_lease(0, "host-a", Duration::from_millis(20))
            .await
            .expect("acquire failed");
        tokio::time::sleep(Duration::from_millis(40)).await;
        let err = manager
            .renew_lease(0, "host-a", Duration::from_secs(60))
            .await
            .expect_err("renew of lapsed lease must fail");
        assert!(matches!(err, EngineError::ShardUnavailable(_)));
    }

    #[tokio::test]
    async fn test_reclaim_expired_clears_ownership() {
        let manager = manager(4).await;
        manager
            .acquire_lease(0, "host-a", Duration::from_millis(10))
            .await
            .expect("acquire failed");
        manager
            .acquire_lease(1, "host-a", Duration::from_secs(60))
            .await
            .expect("acquire failed");
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(manager.reclaim_expired().await, 1);
        let shard0 = manager.get_lease(0).await.expect("shard 0 must exist");
        assert!(shard0.owner.is_none());
        assert_eq!(manager.owned_shards("host-a").await, vec![1]);
    }
}
