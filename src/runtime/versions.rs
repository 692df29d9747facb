//! Version gates
//!
//! A version gate pins the branch a workflow takes at a change point. The
//! first encounter records a version in `[min, max]`; every later
//! encounter, including later replays, returns the pinned version.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{EngineError, EngineResult};

/// Outcome of a version gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionDecision {
    /// The pinned version
    pub version: u32,
    /// Whether this call recorded the version for the first time
    pub is_new: bool,
}

/// Per-run pinned change versions, shared across attempts
#[derive(Debug, Default)]
pub struct VersionGate {
    decisions: RwLock<HashMap<String, u32>>,
}

impl VersionGate {
    /// Create an empty gate
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `change_id` with the default chooser (`max`)
    pub fn require(&self, change_id: &str, min: u32, max: u32) -> EngineResult<VersionDecision> {
        self.require_with(change_id, min, max, |max| max)
    }

    /// Resolve `change_id`, choosing the initial version with `chooser`
    ///
    /// The chosen version is clamped to `[min, max]`. A pinned version
    /// outside the caller's `[min, max]` is a determinism violation: the
    /// code no longer supports the branch it recorded.
    pub fn require_with(
        &self,
        change_id: &str,
        min: u32,
        max: u32,
        chooser: impl FnOnce(u32) -> u32,
    ) -> EngineResult<VersionDecision> {
        if min > max {
            return Err(EngineError::InvalidArgument(format!(
                "change {}: min {} exceeds max {}",
                change_id, min, max
            )));
        }
        let mut decisions = self.decisions.write();
        if let Some(&version) = decisions.get(change_id) {
            if version < min || version > max {
                return Err(EngineError::NonDeterministic(format!(
                    "change {} was recorded at version {}, outside the supported range [{}, {}]",
                    change_id, version, min, max
                )));
            }
            return Ok(VersionDecision {
                version,
                is_new: false,
            });
        }
        let version = chooser(max).clamp(min, max);
        decisions.insert(change_id.to_string(), version);
        Ok(VersionDecision {
            version,
            is_new: true,
        })
    }

    /// Number of pinned changes
    pub fn len(&self) -> usize {
        self.decisions.read().len()
    }

    /// Whether no change has been pinned yet
    pub fn is_empty(&self) -> bool {
        self.decisions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_call_records_then_pins() {
        let gate = VersionGate::new();
        let first = gate.require("new-codepath", 1, 3).expect("require failed");
        assert_eq!(first.version, 3);
        assert!(first.is_new);

        let again = gate.require("new-codepath", 1, 3).expect("require failed");
        assert_eq!(again.version, 3);
        assert!(!again.is_new);
    }

    #[test]
    fn test_chooser_is_clamped() {
        let gate = VersionGate::new();
        let decision = gate
            .require_with("rollout", 2, 4, |_| 99)
            .expect("require failed");
        assert_eq!(decision.version, 4);
    }

    #[test]
    fn test_unsupported_recorded_version_is_violation() {
        let gate = VersionGate::new();
        gate.require("migration", 1, 1).expect("require failed");
        let err = gate
            .require("migration", 2, 5)
            .expect_err("recorded version below min must fail");
        assert!(matches!(err, EngineError::NonDeterministic(_)));
    }

    #[test]
    fn test_min_above_max_rejected() {
        let gate = VersionGate::new();
        assert!(gate.require("bad", 5, 2).is_err());
    }
}
