//! Leased task queues
//!
//! Per-name bounded FIFO queues whose items are delivered under
//! time-bounded leases. Polling is strictly FIFO by `scheduled_at` with
//! `task_id` as the tie-break; leased entries leave the dispatchable set
//! until completed, failed, or reclaimed by the expiry sweep; tasks that
//! exhaust their delivery attempts are dead-lettered.

mod lease;
mod queue;
mod registry;
mod task;

pub use lease::TaskLease;
pub use queue::{DeadLetter, QueueOptions, TaskQueue};
pub use registry::{QueueKey, QueueRegistry};
pub use task::{QueueType, TaskQueueItem};
