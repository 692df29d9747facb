//! Matching service: enqueue, subscribe, reclaim

use futures::Stream;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use super::task::{MatchingTask, WorkflowTask};
use crate::cancel::CancelToken;
use crate::error::EngineResult;
use crate::queue::{DeadLetter, QueueKey, QueueRegistry, TaskQueue, TaskQueueItem};
use crate::types::WorkerIdentity;

/// Fallback poll cadence when no enqueue wakeup arrives; also what makes
/// delayed (requeued) entries dispatch close to their due time
const DISPATCH_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Thin orchestration over the queue registry
pub struct MatchingService {
    queues: Arc<QueueRegistry>,
}

impl MatchingService {
    /// Wrap a queue registry
    pub fn new(queues: Arc<QueueRegistry>) -> Self {
        Self { queues }
    }

    /// Admit a task to its queue; blocks on backpressure
    pub async fn enqueue_task(&self, item: TaskQueueItem) -> EngineResult<u64> {
        let key = QueueKey::new(item.namespace_id, item.queue_name.clone(), item.queue_type);
        let queue = self.queues.get_or_create(&key);
        queue.enqueue(item).await
    }

    /// Subscribe to a queue; tasks arrive as a stream of leased deliveries
    ///
    /// Cancelling (or dropping) the subscription fails every outstanding
    /// in-flight task with requeue so another worker can pick it up.
    pub fn subscribe(
        &self,
        key: &QueueKey,
        worker: WorkerIdentity,
        parent: &CancelToken,
    ) -> MatchingSubscription {
        let queue = self.queues.get_or_create(key);
        let token = parent.child();
        let outstanding: Arc<Mutex<HashSet<Uuid>>> = Arc::new(Mutex::new(HashSet::new()));
        let (tx, rx) = mpsc::channel::<MatchingTask>(1);

        let handle = tokio::spawn(Self::dispatch_loop(
            queue,
            worker,
            token.clone(),
            outstanding,
            tx,
        ));

        MatchingSubscription {
            stream: ReceiverStream::new(rx),
            token,
            _dispatcher: handle,
        }
    }

    /// Sweep expired leases on every queue; returns total reclaimed
    pub fn reclaim_expired_leases(&self) -> usize {
        self.queues.sweep_all()
    }

    /// Dispatchable depth of one queue
    pub fn queue_depth(&self, key: &QueueKey) -> usize {
        self.queues.get(key).map(|q| q.depth()).unwrap_or(0)
    }

    /// Dispatchable depth per queue name
    pub fn list_queues(&self) -> HashMap<String, usize> {
        self.queues.list_queues()
    }

    /// Dead-lettered tasks of one queue
    pub fn dead_letters(&self, key: &QueueKey) -> Vec<DeadLetter> {
        self.queues
            .get(key)
            .map(|q| q.dead_letters())
            .unwrap_or_default()
    }

    async fn dispatch_loop(
        queue: Arc<TaskQueue>,
        worker: WorkerIdentity,
        token: CancelToken,
        outstanding: Arc<Mutex<HashSet<Uuid>>>,
        tx: mpsc::Sender<MatchingTask>,
    ) {
        while !token.is_cancelled() {
            let Some(lease) = queue.poll(&worker) else {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = queue.notified() => {}
                    _ = tokio::time::sleep(DISPATCH_POLL_INTERVAL) => {}
                }
                continue;
            };

            let workflow_task =
                match serde_json::from_value::<WorkflowTask>(lease.task.payload.clone()) {
                    Ok(task) => task,
                    Err(e) => {
                        tracing::warn!(
                            queue = queue.name(),
                            task_id = lease.task.task_id,
                            error = %e,
                            "dropping task with malformed payload"
                        );
                        let _ = queue.fail(lease.lease_id, "malformed task payload", false);
                        continue;
                    }
                };

            outstanding.lock().insert(lease.lease_id);
            let task = MatchingTask::new(
                lease.clone(),
                workflow_task,
                queue.clone(),
                outstanding.clone(),
            );

            tokio::select! {
                _ = token.cancelled() => {
                    outstanding.lock().remove(&lease.lease_id);
                    let _ = queue.fail(lease.lease_id, "subscription canceled", true);
                    break;
                }
                sent = tx.send(task) => {
                    if sent.is_err() {
                        outstanding.lock().remove(&lease.lease_id);
                        let _ = queue.fail(lease.lease_id, "subscriber dropped", true);
                        break;
                    }
                }
            }
        }

        // The worker no longer intends to process anything still in flight.
        let leftover: Vec<Uuid> = outstanding.lock().drain().collect();
        for lease_id in leftover {
            let _ = queue.fail(lease_id, "subscription canceled", true);
        }
    }
}

/// A live subscription; a stream of leased tasks
///
/// Dropping the subscription cancels its dispatch loop and requeues the
/// tasks it still holds.
pub struct MatchingSubscription {
    stream: ReceiverStream<MatchingTask>,
    token: CancelToken,
    _dispatcher: JoinHandle<()>,
}

impl MatchingSubscription {
    /// Next leased task, or `None` once the subscription is closed
    pub async fn next_task(&mut self) -> Option<MatchingTask> {
        self.stream.next().await
    }

    /// Stop dispatching; outstanding tasks are failed with requeue
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl Stream for MatchingSubscription {
    type Item = MatchingTask;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.stream).poll_next(cx)
    }
}

impl Drop for MatchingSubscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
