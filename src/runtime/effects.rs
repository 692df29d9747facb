//! Deterministic effect records
//!
//! For a given run, an effect ID maps to exactly one recorded result;
//! second reads return the stored result without invoking the effect.
//! Failures are recorded too, so a failed capture replays as the same
//! failure and the workflow is free to recover around it.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{EngineError, EngineResult};

/// Persisted outcome of one effect invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EffectRecord {
    /// The effect succeeded with this payload
    Success(serde_json::Value),
    /// The effect failed; `(wire code, message)` reconstructs the error
    Failure { code: String, message: String },
}

/// Per-run store of effect results, shared across attempts
#[derive(Debug, Default)]
pub struct EffectStore {
    records: RwLock<HashMap<String, EffectRecord>>,
}

impl EffectStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded result for `effect_id`, if any
    pub fn get(&self, effect_id: &str) -> Option<EffectRecord> {
        self.records.read().get(effect_id).cloned()
    }

    /// Record a successful invocation; the ID must be unused
    pub fn record_success(
        &self,
        effect_id: &str,
        payload: serde_json::Value,
    ) -> EngineResult<()> {
        self.record(effect_id, EffectRecord::Success(payload))
    }

    /// Record a failed invocation; the ID must be unused
    pub fn record_failure(&self, effect_id: &str, error: &EngineError) -> EngineResult<()> {
        self.record(
            effect_id,
            EffectRecord::Failure {
                code: error.code().to_string(),
                message: error.to_string(),
            },
        )
    }

    fn record(&self, effect_id: &str, record: EffectRecord) -> EngineResult<()> {
        let mut records = self.records.write();
        if records.contains_key(effect_id) {
            return Err(EngineError::NonDeterministic(format!(
                "effect {} was recorded twice; parallel captures must not share an effect ID",
                effect_id
            )));
        }
        records.insert(effect_id.to_string(), record);
        Ok(())
    }

    /// Number of recorded effects
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether nothing has been recorded yet
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_second_read_returns_stored_payload() {
        let store = EffectStore::new();
        store
            .record_success("payment::ORD-0001", json!({"transactionId": "T1"}))
            .expect("record failed");
        match store.get("payment::ORD-0001") {
            Some(EffectRecord::Success(payload)) => {
                assert_eq!(payload, json!({"transactionId": "T1"}));
            }
            other => panic!("unexpected record: {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_record_is_determinism_error() {
        let store = EffectStore::new();
        store
            .record_success("payment::ORD-0001", json!(1))
            .expect("record failed");
        let err = store
            .record_success("payment::ORD-0001", json!(2))
            .expect_err("duplicate must fail");
        assert!(matches!(err, EngineError::NonDeterministic(_)));
    }

    #[test]
    fn test_failure_round_trips_as_same_error() {
        let store = EffectStore::new();
        let original = EngineError::Timeout;
        store
            .record_failure("charge", &original)
            .expect("record failed");
        match store.get("charge") {
            Some(EffectRecord::Failure { code, message }) => {
                assert_eq!(EngineError::from_code(&code, message), EngineError::Timeout);
            }
            other => panic!("unexpected record: {:?}", other),
        }
    }
}
