//! System workers
//!
//! Long-lived background loops: durable timer firing, expired-lease
//! reclamation, shard lease keeping, and retention cleanup. Each loop runs
//! under a child cancellation token and shuts down deterministically when
//! the engine's root token is cancelled.

mod reclaim;
mod retention;
mod timer;

pub use reclaim::{LeaseReclaimer, ShardKeeper};
pub use retention::RetentionSweeper;
pub use timer::{DurableTimer, TimerWorker};
