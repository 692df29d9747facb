//! Core leased FIFO queue

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

use super::lease::TaskLease;
use super::task::{QueueType, TaskQueueItem};
use crate::error::{EngineError, EngineResult};
use crate::types::{deadline_after, WorkerIdentity};

/// Per-queue tuning, normally derived from the orchestrator configuration
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Bounded capacity; enqueue blocks when the queue is full
    pub capacity: usize,
    /// Lease length granted by poll
    pub lease_duration: Duration,
    /// Delay applied when a task is failed with requeue
    pub requeue_delay: Duration,
    /// Delivery attempts before dead-lettering
    pub max_delivery_attempts: u32,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            capacity: 1024,
            lease_duration: Duration::from_secs(60),
            requeue_delay: Duration::from_secs(5),
            max_delivery_attempts: 5,
        }
    }
}

/// A task that exhausted its delivery attempts
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// The task as it stood when it was dead-lettered
    pub item: TaskQueueItem,
    /// Delivery attempts consumed
    pub attempt: u32,
    /// Reason of the final failure
    pub reason: String,
    /// When the task was dead-lettered
    pub dead_at: DateTime<Utc>,
}

/// One admitted entry; the permit returns capacity when the entry is dropped
struct QueueEntry {
    item: TaskQueueItem,
    instance_id: Uuid,
    attempt: u32,
    _permit: OwnedSemaphorePermit,
}

struct LeasedEntry {
    entry: QueueEntry,
    lease: TaskLease,
}

struct QueueInner {
    next_task_id: u64,
    pending: BTreeMap<(DateTime<Utc>, u64), QueueEntry>,
    leased: HashMap<Uuid, LeasedEntry>,
    dead: Vec<DeadLetter>,
}

/// A bounded FIFO queue with lease-bound delivery
///
/// Per-task state machine: `Pending → Leased → (Completed | Failed |
/// DeadLettered)`, with `Leased → Pending` on requeue. Lease granting is
/// atomic under the queue lock.
pub struct TaskQueue {
    name: String,
    queue_type: QueueType,
    options: QueueOptions,
    capacity: Arc<Semaphore>,
    notify: Notify,
    inner: Mutex<QueueInner>,
}

impl TaskQueue {
    /// Create an empty queue
    pub fn new(name: impl Into<String>, queue_type: QueueType, options: QueueOptions) -> Self {
        let capacity = Arc::new(Semaphore::new(options.capacity));
        Self {
            name: name.into(),
            queue_type,
            options,
            capacity,
            notify: Notify::new(),
            inner: Mutex::new(QueueInner {
                next_task_id: 0,
                pending: BTreeMap::new(),
                leased: HashMap::new(),
                dead: Vec::new(),
            }),
        }
    }

    /// Queue name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue kind
    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    /// Configured options
    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    /// Admit a task at the tail; blocks while the queue is at capacity
    ///
    /// Returns the queue-assigned task ID.
    pub async fn enqueue(&self, mut item: TaskQueueItem) -> EngineResult<u64> {
        let permit = self
            .capacity
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| EngineError::Internal("task queue is closed".to_string()))?;

        let task_id = {
            let mut inner = self.inner.lock();
            inner.next_task_id += 1;
            let task_id = inner.next_task_id;
            item.task_id = task_id;
            let key = (item.scheduled_at, task_id);
            inner.pending.insert(
                key,
                QueueEntry {
                    item,
                    instance_id: Uuid::new_v4(),
                    attempt: 0,
                    _permit: permit,
                },
            );
            task_id
        };
        self.notify.notify_one();
        Ok(task_id)
    }

    /// Lease at most one task for `worker`
    ///
    /// Selection is strictly FIFO by `scheduled_at`, then `task_id`. Expired
    /// entries are dropped; entries past the attempt cap are dead-lettered.
    pub fn poll(&self, worker: &WorkerIdentity) -> Option<TaskLease> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        loop {
            let key = *inner.pending.keys().next()?;
            if key.0 > now {
                // Front of the queue is not due yet; nothing behind it is either.
                return None;
            }
            let mut entry = match inner.pending.remove(&key) {
                Some(entry) => entry,
                None => continue,
            };
            if entry.item.is_expired(now) {
                tracing::debug!(
                    queue = %self.name,
                    task_id = entry.item.task_id,
                    "dropping expired task"
                );
                continue;
            }
            if entry.attempt >= self.options.max_delivery_attempts {
                Self::dead_letter(&mut inner, entry, "max delivery attempts exceeded", now);
                continue;
            }

            entry.attempt += 1;
            let lease = TaskLease {
                lease_id: Uuid::new_v4(),
                instance_id: entry.instance_id,
                task: entry.item.clone(),
                worker: worker.clone(),
                leased_at: now,
                lease_expires_at: deadline_after(now, self.options.lease_duration),
                last_heartbeat: now,
                attempt: entry.attempt,
            };
            inner
                .leased
                .insert(lease.lease_id, LeasedEntry {
                    entry,
                    lease: lease.clone(),
                });
            return Some(lease);
        }
    }

    /// Slide the lease expiry forward; idempotent
    ///
    /// Fails with `TaskLeaseExpired` when the lease is unknown or has
    /// already lapsed; racing against reclamation resolves in favor of
    /// whichever committed first under the queue lock.
    pub fn heartbeat(&self, lease_id: Uuid) -> EngineResult<TaskLease> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let leased = inner
            .leased
            .get_mut(&lease_id)
            .ok_or_else(|| EngineError::TaskLeaseExpired(format!("lease {}", lease_id)))?;
        if leased.lease.is_expired(now) {
            return Err(EngineError::TaskLeaseExpired(format!("lease {}", lease_id)));
        }
        leased.lease.last_heartbeat = now;
        leased.lease.lease_expires_at = deadline_after(now, self.options.lease_duration);
        Ok(leased.lease.clone())
    }

    /// Permanently remove a leased task
    pub fn complete(&self, lease_id: Uuid) -> EngineResult<()> {
        let mut inner = self.inner.lock();
        inner
            .leased
            .remove(&lease_id)
            .map(|_| ())
            .ok_or_else(|| EngineError::TaskLeaseExpired(format!("lease {}", lease_id)))
    }

    /// Settle a leased task as failed
    ///
    /// With `requeue`, the entry re-enters the queue after the configured
    /// delay unless its attempts are exhausted, in which case it is
    /// dead-lettered. Without `requeue` the task is removed permanently.
    pub fn fail(&self, lease_id: Uuid, reason: &str, requeue: bool) -> EngineResult<()> {
        let now = Utc::now();
        let requeued = {
            let mut inner = self.inner.lock();
            let leased = inner
                .leased
                .remove(&lease_id)
                .ok_or_else(|| EngineError::TaskLeaseExpired(format!("lease {}", lease_id)))?;
            if requeue {
                Self::requeue_or_dead_letter(&mut inner, leased.entry, reason, now, &self.options)
            } else {
                tracing::debug!(
                    queue = %self.name,
                    task_id = leased.entry.item.task_id,
                    reason,
                    "task failed permanently"
                );
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
        Ok(())
    }

    /// Reclaim every lease whose expiry has passed; returns how many
    ///
    /// Reclaimed tasks follow the fail-with-requeue policy.
    pub fn sweep(&self) -> usize {
        let now = Utc::now();
        let (reclaimed, requeued_any) = {
            let mut inner = self.inner.lock();
            let expired: Vec<Uuid> = inner
                .leased
                .iter()
                .filter(|(_, l)| l.lease.is_expired(now))
                .map(|(id, _)| *id)
                .collect();
            let mut requeued_any = false;
            for lease_id in &expired {
                if let Some(leased) = inner.leased.remove(lease_id) {
                    tracing::info!(
                        queue = %self.name,
                        task_id = leased.entry.item.task_id,
                        attempt = leased.entry.attempt,
                        "reclaiming expired lease"
                    );
                    if Self::requeue_or_dead_letter(
                        &mut inner,
                        leased.entry,
                        "lease expired",
                        now,
                        &self.options,
                    ) {
                        requeued_any = true;
                    }
                }
            }
            (expired.len(), requeued_any)
        };
        if requeued_any {
            self.notify.notify_waiters();
        }
        reclaimed
    }

    /// Currently-dispatchable entries (due, unexpired, not leased)
    pub fn depth(&self) -> usize {
        let now = Utc::now();
        let inner = self.inner.lock();
        inner
            .pending
            .iter()
            .filter(|((scheduled_at, _), entry)| {
                *scheduled_at <= now && !entry.item.is_expired(now)
            })
            .count()
    }

    /// Number of active leases
    pub fn active_leases(&self) -> usize {
        self.inner.lock().leased.len()
    }

    /// Dead-lettered tasks, oldest first
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.lock().dead.clone()
    }

    /// Wait until something is enqueued or requeued
    pub async fn notified(&self) {
        self.notify.notified().await;
    }

    fn requeue_or_dead_letter(
        inner: &mut QueueInner,
        mut entry: QueueEntry,
        reason: &str,
        now: DateTime<Utc>,
        options: &QueueOptions,
    ) -> bool {
        if entry.attempt >= options.max_delivery_attempts {
            Self::dead_letter(inner, entry, reason, now);
            return false;
        }
        entry.item.scheduled_at = deadline_after(now, options.requeue_delay);
        let key = (entry.item.scheduled_at, entry.item.task_id);
        inner.pending.insert(key, entry);
        true
    }

    fn dead_letter(inner: &mut QueueInner, entry: QueueEntry, reason: &str, now: DateTime<Utc>) {
        tracing::warn!(
            task_id = entry.item.task_id,
            attempt = entry.attempt,
            reason,
            "dead-lettering task"
        );
        inner.dead.push(DeadLetter {
            item: entry.item,
            attempt: entry.attempt,
            reason: reason.to_string(),
            dead_at: now,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NamespaceId, RunId, WorkflowId};
    use serde_json::json;

    fn options() -> QueueOptions {
        QueueOptions {
            capacity: 16,
            lease_duration: Duration::from_millis(100),
            requeue_delay: Duration::from_millis(0),
            max_delivery_attempts: 3,
        }
    }

    fn item(queue: &str) -> TaskQueueItem {
        TaskQueueItem::new(
            NamespaceId::new(),
            queue,
            QueueType::Workflow,
            WorkflowId::new("wf-1"),
            RunId::new(),
            json!({"kind": "workflow-task"}),
        )
    }

    fn worker(name: &str) -> WorkerIdentity {
        WorkerIdentity::new(name)
    }

    #[tokio::test]
    async fn test_fifo_order_with_task_id_tie_break() {
        let queue = TaskQueue::new("orders", QueueType::Workflow, options());
        let now = Utc::now();
        for _ in 0..5 {
            queue
                .enqueue(item("orders").scheduled_at(now))
                .await
                .expect("enqueue failed");
        }
        let w = worker("w-1");
        let delivered: Vec<u64> = (0..5)
            .map(|_| queue.poll(&w).expect("poll must deliver").task.task_id)
            .collect();
        assert_eq!(delivered, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_round_trip_restores_depth() {
        let queue = TaskQueue::new("orders", QueueType::Workflow, options());
        let before = queue.depth();
        queue.enqueue(item("orders")).await.expect("enqueue failed");
        let lease = queue.poll(&worker("w-1")).expect("poll must deliver");
        assert_eq!(queue.depth(), before);
        queue.complete(lease.lease_id).expect("complete must succeed");
        assert_eq!(queue.depth(), before);
        assert_eq!(queue.active_leases(), 0);
    }

    #[tokio::test]
    async fn test_leased_entry_is_not_redeliverable() {
        let queue = TaskQueue::new("orders", QueueType::Workflow, options());
        queue.enqueue(item("orders")).await.expect("enqueue failed");
        let _lease = queue.poll(&worker("w-1")).expect("poll must deliver");
        assert!(queue.poll(&worker("w-2")).is_none());
    }

    #[tokio::test]
    async fn test_complete_twice_reports_expired_lease() {
        let queue = TaskQueue::new("orders", QueueType::Workflow, options());
        queue.enqueue(item("orders")).await.expect("enqueue failed");
        let lease = queue.poll(&worker("w-1")).expect("poll must deliver");
        queue.complete(lease.lease_id).expect("first complete succeeds");
        let err = queue
            .complete(lease.lease_id)
            .expect_err("second complete must fail");
        assert!(matches!(err, EngineError::TaskLeaseExpired(_)));
    }

    #[tokio::test]
    async fn test_heartbeat_extends_until_expiry() {
        let queue = TaskQueue::new("orders", QueueType::Workflow, options());
        queue.enqueue(item("orders")).await.expect("enqueue failed");
        let lease = queue.poll(&worker("w-1")).expect("poll must deliver");

        let first = queue.heartbeat(lease.lease_id).expect("heartbeat failed");
        let second = queue.heartbeat(lease.lease_id).expect("heartbeat failed");
        assert!(second.lease_expires_at >= first.lease_expires_at);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let err = queue
            .heartbeat(lease.lease_id)
            .expect_err("heartbeat after expiry must fail");
        assert!(matches!(err, EngineError::TaskLeaseExpired(_)));
    }

    #[tokio::test]
    async fn test_fail_with_requeue_keeps_attempt_from_lease() {
        let queue = TaskQueue::new("orders", QueueType::Workflow, options());
        queue.enqueue(item("orders")).await.expect("enqueue failed");

        let lease = queue.poll(&worker("w-1")).expect("poll must deliver");
        assert_eq!(lease.attempt, 1);
        queue
            .fail(lease.lease_id, "worker error", true)
            .expect("fail failed");

        let lease = queue.poll(&worker("w-2")).expect("requeued task must poll");
        assert_eq!(lease.attempt, 2);
    }

    #[tokio::test]
    async fn test_requeue_at_cap_dead_letters() {
        let queue = TaskQueue::new("orders", QueueType::Workflow, options());
        queue.enqueue(item("orders")).await.expect("enqueue failed");

        for expected_attempt in 1..=3u32 {
            let lease = queue.poll(&worker("w-1")).expect("poll must deliver");
            assert_eq!(lease.attempt, expected_attempt);
            queue
                .fail(lease.lease_id, "worker error", true)
                .expect("fail failed");
        }

        assert!(queue.poll(&worker("w-1")).is_none());
        assert_eq!(queue.depth(), 0);
        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempt, 3);
    }

    #[tokio::test]
    async fn test_sweep_reclaims_expired_leases() {
        let queue = TaskQueue::new("orders", QueueType::Workflow, options());
        queue.enqueue(item("orders")).await.expect("enqueue failed");
        let _lease = queue.poll(&worker("w-1")).expect("poll must deliver");

        assert_eq!(queue.sweep(), 0);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(queue.sweep(), 1);
        assert_eq!(queue.active_leases(), 0);

        let lease = queue.poll(&worker("w-2")).expect("reclaimed task must poll");
        assert_eq!(lease.attempt, 2);
    }

    #[tokio::test]
    async fn test_expired_entry_is_dropped_at_poll() {
        let queue = TaskQueue::new("orders", QueueType::Workflow, options());
        queue
            .enqueue(item("orders").expires_at(Utc::now() - chrono::Duration::seconds(1)))
            .await
            .expect("enqueue failed");
        assert!(queue.poll(&worker("w-1")).is_none());
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn test_future_scheduled_entry_is_not_due() {
        let queue = TaskQueue::new("orders", QueueType::Workflow, options());
        queue
            .enqueue(item("orders").scheduled_at(Utc::now() + chrono::Duration::seconds(30)))
            .await
            .expect("enqueue failed");
        assert!(queue.poll(&worker("w-1")).is_none());
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_blocks_at_capacity() {
        let queue = Arc::new(TaskQueue::new(
            "orders",
            QueueType::Workflow,
            QueueOptions {
                capacity: 1,
                ..options()
            },
        ));
        queue.enqueue(item("orders")).await.expect("enqueue failed");

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            queue.enqueue(item("orders")),
        )
        .await;
        assert!(blocked.is_err(), "second enqueue must block at capacity");

        let lease = queue.poll(&worker("w-1")).expect("poll must deliver");
        queue.complete(lease.lease_id).expect("complete failed");
        tokio::time::timeout(Duration::from_millis(200), queue.enqueue(item("orders")))
            .await
            .expect("enqueue must unblock after capacity frees")
            .expect("enqueue failed");
    }
}
