//! Matching: task routing between the service layer and workers
//!
//! A thin orchestration layer over the queue registry. Producers enqueue
//! decision tasks; workers subscribe and receive a stream of leased
//! [`MatchingTask`]s whose completion handles bridge back to the lease.

mod service;
mod task;

pub use service::{MatchingService, MatchingSubscription};
pub use task::{MatchingTask, WorkflowTask};
