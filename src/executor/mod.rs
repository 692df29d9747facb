//! Workflow execution
//!
//! The registry maps type names to codec+executor closure pairs (typed at
//! registration, opaque at dispatch); the executor binds a delivered task
//! to its registered workflow and drives it through a runtime scope; the
//! worker loop subscribes to matching, heartbeats its leases, and persists
//! each terminal decision back to history.

mod executor;
mod registry;
mod worker;

pub use executor::{ExecutionFailure, WorkflowExecutor};
pub use registry::{QueryHandler, RegisteredWorkflow, WorkflowRegistry};
pub use worker::Worker;
