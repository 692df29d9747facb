//! Per-execution history: append-only events plus versioned execution state
//!
//! Every write to mutable execution state is guarded by an optimistic
//! version; every event append must continue the run's contiguous ID
//! sequence and advances `next_event_id` in the same transaction.

mod durable;
mod memory;
mod service;
mod store;

pub use durable::DurableHistoryStore;
pub use memory::InMemoryHistoryStore;
pub use service::HistoryService;
pub use store::{ExecutionFilter, HistoryBatch, HistoryStore};
