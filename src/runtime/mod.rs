//! Deterministic replay runtime
//!
//! A per-run scope handed to workflow code. Side effects go through
//! [`WorkflowRuntime::capture`], which persists each effect's result by ID
//! so reruns of the same workflow code reproduce identical decisions
//! without re-invoking the effect. Version gates pin branch choices the
//! same way. The effect store and version decisions survive attempts; the
//! logical clock restarts each attempt and is re-advanced deterministically
//! by the replayed code.

mod context;
mod effects;
mod replay;
mod scope;
mod versions;

pub use context::ExecutionContext;
pub use effects::{EffectRecord, EffectStore};
pub use replay::{ReplayStateRepository, RunReplayState};
pub use scope::{RuntimeOptions, WorkflowRuntime};
pub use versions::{VersionDecision, VersionGate};
