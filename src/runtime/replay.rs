//! Per-run replay state
//!
//! The effect store and version decisions must survive attempts of a run,
//! otherwise a retried task would re-invoke effects it already performed.
//! The repository owns that state, keyed by run, and also tracks the single
//! open runtime scope per run.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use super::effects::EffectStore;
use super::versions::VersionGate;
use crate::error::{EngineError, EngineResult};
use crate::types::RunId;

/// Replay state of one run, shared across its attempts
#[derive(Debug, Default)]
pub struct RunReplayState {
    /// Recorded effect results
    pub effects: EffectStore,
    /// Pinned change versions
    pub versions: VersionGate,
    replays: AtomicU32,
    scope_open: AtomicBool,
}

impl RunReplayState {
    /// Attempts opened so far
    pub fn replay_count(&self) -> u32 {
        self.replays.load(Ordering::SeqCst)
    }

    /// Claim the run's single scope slot; returns the prior attempt count
    pub(crate) fn open_scope(&self) -> EngineResult<u32> {
        if self
            .scope_open
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(EngineError::FailedPrecondition(
                "a runtime scope is already open for this run".to_string(),
            ));
        }
        Ok(self.replays.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn close_scope(&self) {
        self.scope_open.store(false, Ordering::SeqCst);
    }
}

/// Engine-owned registry of per-run replay state
#[derive(Default)]
pub struct ReplayStateRepository {
    runs: RwLock<HashMap<RunId, Arc<RunReplayState>>>,
}

impl ReplayStateRepository {
    /// Create an empty repository
    pub fn new() -> Self {
        Self::default()
    }

    /// State for a run, created on first use
    pub fn state_for(&self, run_id: &RunId) -> Arc<RunReplayState> {
        if let Some(state) = self.runs.read().get(run_id) {
            return state.clone();
        }
        self.runs
            .write()
            .entry(*run_id)
            .or_insert_with(|| Arc::new(RunReplayState::default()))
            .clone()
    }

    /// Drop a closed run's state (retention)
    pub fn remove(&self, run_id: &RunId) {
        self.runs.write().remove(run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_is_shared_across_lookups() {
        let repo = ReplayStateRepository::new();
        let run_id = RunId::new();
        let a = repo.state_for(&run_id);
        let b = repo.state_for(&run_id);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_single_scope_per_run() {
        let state = RunReplayState::default();
        assert_eq!(state.open_scope().expect("first open failed"), 0);
        let err = state.open_scope().expect_err("nested open must fail");
        assert!(matches!(err, EngineError::FailedPrecondition(_)));
        state.close_scope();
        assert_eq!(state.open_scope().expect("reopen failed"), 1);
    }
}
