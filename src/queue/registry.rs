//! Queue registry
//!
//! Queues are created on first use and resolved by `(namespace, name,
//! type)`. Cross-references between queues, leases, and their adapters go
//! through this indexed map rather than back-pointers.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

use super::queue::{QueueOptions, TaskQueue};
use super::task::QueueType;
use crate::types::NamespaceId;

/// Identity of one queue
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueKey {
    /// Owning namespace
    pub namespace_id: NamespaceId,
    /// Queue name
    pub name: String,
    /// Queue kind
    pub queue_type: QueueType,
}

impl QueueKey {
    /// Build a key
    pub fn new(namespace_id: NamespaceId, name: impl Into<String>, queue_type: QueueType) -> Self {
        Self {
            namespace_id,
            name: name.into(),
            queue_type,
        }
    }
}

/// Registry of live queues, one per key
pub struct QueueRegistry {
    queues: DashMap<QueueKey, Arc<TaskQueue>>,
    options: QueueOptions,
}

impl QueueRegistry {
    /// Create a registry; every queue inherits `options`
    pub fn new(options: QueueOptions) -> Self {
        Self {
            queues: DashMap::new(),
            options,
        }
    }

    /// Resolve a queue, creating it on first use
    pub fn get_or_create(&self, key: &QueueKey) -> Arc<TaskQueue> {
        self.queues
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(TaskQueue::new(
                    key.name.clone(),
                    key.queue_type,
                    self.options.clone(),
                ))
            })
            .clone()
    }

    /// Resolve an existing queue
    pub fn get(&self, key: &QueueKey) -> Option<Arc<TaskQueue>> {
        self.queues.get(key).map(|q| q.clone())
    }

    /// Dispatchable depth per queue name
    pub fn list_queues(&self) -> HashMap<String, usize> {
        let mut depths = HashMap::new();
        for entry in self.queues.iter() {
            *depths.entry(entry.key().name.clone()).or_insert(0) += entry.value().depth();
        }
        depths
    }

    /// Sweep expired leases on every queue; returns total reclaimed
    pub fn sweep_all(&self) -> usize {
        self.queues.iter().map(|entry| entry.value().sweep()).sum()
    }
}
