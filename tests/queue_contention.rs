//! Queue behavior under contention: exhausted deliveries dead-letter,
//! FIFO holds across many subscribers, and settled leases are idempotent.

use chrono::Utc;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use capstan::queue::{QueueOptions, QueueType, TaskQueue, TaskQueueItem};
use capstan::{EngineError, NamespaceId, RunId, WorkerIdentity, WorkflowId};

fn item(queue: &str, workflow_id: &str) -> TaskQueueItem {
    TaskQueueItem::new(
        NamespaceId::new(),
        queue,
        QueueType::Workflow,
        WorkflowId::new(workflow_id),
        RunId::new(),
        json!({"kind": "workflow-task"}),
    )
}

#[tokio::test]
async fn test_lease_expiry_requeue_then_dead_letter() {
    // MAX_DELIVERY_ATTEMPTS = 3, LEASE_DURATION = 100ms.
    let queue = TaskQueue::new(
        "orders",
        QueueType::Workflow,
        QueueOptions {
            capacity: 16,
            lease_duration: Duration::from_millis(100),
            requeue_delay: Duration::from_millis(0),
            max_delivery_attempts: 3,
        },
    );
    queue
        .enqueue(item("orders", "wf-dlq"))
        .await
        .expect("enqueue failed");

    for expected_attempt in 1..=3u32 {
        let worker = WorkerIdentity::new(format!("worker-{}", expected_attempt));
        let lease = queue.poll(&worker).expect("poll must deliver");
        assert_eq!(lease.attempt, expected_attempt);
        // The worker dies: no heartbeat, no completion.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(queue.sweep(), 1);
    }

    assert_eq!(queue.depth(), 0);
    assert_eq!(queue.active_leases(), 0);
    let dead = queue.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempt, 3);
    assert_eq!(dead[0].reason, "lease expired");
}

#[tokio::test]
async fn test_fifo_under_ten_subscribers() {
    let queue = Arc::new(TaskQueue::new(
        "orders",
        QueueType::Workflow,
        QueueOptions {
            capacity: 128,
            lease_duration: Duration::from_secs(10),
            requeue_delay: Duration::from_millis(0),
            max_delivery_attempts: 5,
        },
    ));

    // 100 tasks with identical scheduled_at.
    let scheduled_at = Utc::now();
    for i in 0..100 {
        queue
            .enqueue(item("orders", &format!("wf-{}", i)).scheduled_at(scheduled_at))
            .await
            .expect("enqueue failed");
    }

    let mut subscribers = Vec::new();
    for s in 0..10 {
        let queue = queue.clone();
        subscribers.push(tokio::spawn(async move {
            let worker = WorkerIdentity::new(format!("subscriber-{}", s));
            let mut delivered: Vec<(u64, u32)> = Vec::new();
            while let Some(lease) = queue.poll(&worker) {
                delivered.push((lease.task.task_id, lease.attempt));
                queue.complete(lease.lease_id).expect("complete failed");
                tokio::task::yield_now().await;
            }
            delivered
        }));
    }

    let mut seen: HashMap<u64, u32> = HashMap::new();
    for subscriber in subscribers {
        let delivered = subscriber.await.expect("subscriber panicked");
        // Within one subscriber's stream, task IDs are monotonically
        // non-decreasing.
        for pair in delivered.windows(2) {
            assert!(pair[0].0 < pair[1].0);
        }
        for (task_id, attempt) in delivered {
            assert_eq!(attempt, 1);
            *seen.entry(task_id).or_insert(0) += 1;
        }
    }

    // Every task delivered exactly once.
    assert_eq!(seen.len(), 100);
    assert!(seen.values().all(|&count| count == 1));
    assert_eq!(queue.depth(), 0);
    assert_eq!(queue.active_leases(), 0);
}

#[tokio::test]
async fn test_settled_lease_operations_are_idempotent() {
    let queue = TaskQueue::new("orders", QueueType::Workflow, QueueOptions::default());
    queue
        .enqueue(item("orders", "wf-idem"))
        .await
        .expect("enqueue failed");

    let lease = queue
        .poll(&WorkerIdentity::new("worker-1"))
        .expect("poll must deliver");
    let first = queue.heartbeat(lease.lease_id).expect("heartbeat failed");
    let second = queue.heartbeat(lease.lease_id).expect("heartbeat failed");
    assert!(second.lease_expires_at >= first.lease_expires_at);
    assert_eq!(first.attempt, second.attempt);

    queue.complete(lease.lease_id).expect("complete failed");
    let err = queue
        .complete(lease.lease_id)
        .expect_err("second complete must report an expired lease");
    assert!(matches!(err, EngineError::TaskLeaseExpired(_)));
    let err = queue
        .heartbeat(lease.lease_id)
        .expect_err("heartbeat after completion must fail");
    assert!(matches!(err, EngineError::TaskLeaseExpired(_)));
}
