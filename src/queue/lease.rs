//! Task leases

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::TaskQueueItem;
use crate::types::WorkerIdentity;

/// A currently-held delivery of one task
///
/// A task has at most one active lease; the lease is extended by heartbeat
/// and reclaimed by the expiry sweep when the worker goes quiet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLease {
    /// Lease identifier, fresh per grant
    pub lease_id: Uuid,
    /// Queue-internal instance of the leased entry
    pub instance_id: Uuid,
    /// The leased task
    pub task: TaskQueueItem,
    /// Worker holding the lease
    pub worker: WorkerIdentity,
    /// Grant time
    pub leased_at: DateTime<Utc>,
    /// When the lease lapses unless heartbeated
    pub lease_expires_at: DateTime<Utc>,
    /// Last heartbeat (equals `leased_at` until the first heartbeat)
    pub last_heartbeat: DateTime<Utc>,
    /// Delivery attempt this lease represents, 1-based
    pub attempt: u32,
}

impl TaskLease {
    /// Whether the lease has lapsed as of `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at <= now
    }
}
