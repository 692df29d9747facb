//! Error types for the orchestrator

use thiserror::Error;

/// Result type for orchestrator operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Error taxonomy shared by every component
///
/// Components return these typed errors; the worker and API adapters
/// translate them into wire codes via [`EngineError::code`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed request; never retried
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Resource absent; surfaced to the caller
    #[error("not found: {0}")]
    NotFound(String),

    /// Resource already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// State machine violation (e.g. signaling a terminal run)
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// Versioned update lost; reload state and retry with bounded attempts
    #[error("concurrency conflict: expected version {expected}, actual {actual}")]
    ConcurrencyConflict { expected: u64, actual: u64 },

    /// This host does not hold the shard lease
    #[error("shard unavailable: {0}")]
    ShardUnavailable(String),

    /// The lease is gone; the worker abandons the task
    #[error("task lease expired: {0}")]
    TaskLeaseExpired(String),

    /// Event sequence violation; fatal for the current append
    #[error("history event error: {0}")]
    HistoryEvent(String),

    /// Workflow code diverged from its recorded decisions
    #[error("non-deterministic workflow execution: {0}")]
    NonDeterministic(String),

    /// Deadline exceeded; retryable when the caller has budget
    #[error("operation timed out")]
    Timeout,

    /// Cooperative shutdown; not an error to alarm on
    #[error("operation canceled")]
    Canceled,

    /// Storage-layer failure
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Unexpected failure; logged with cause, surfaced as INTERNAL
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Wire code for API adapters
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidArgument(_) => "INVALID_ARGUMENT",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::AlreadyExists(_) => "ALREADY_EXISTS",
            EngineError::FailedPrecondition(_) => "FAILED_PRECONDITION",
            EngineError::ConcurrencyConflict { .. } => "CONCURRENCY_CONFLICT",
            EngineError::ShardUnavailable(_) => "SHARD_UNAVAILABLE",
            EngineError::TaskLeaseExpired(_) => "TASK_LEASE_EXPIRED",
            EngineError::HistoryEvent(_) => "HISTORY_EVENT_ERROR",
            EngineError::NonDeterministic(_) => "INTERNAL",
            EngineError::Timeout => "TIMEOUT",
            EngineError::Canceled => "CANCELED",
            EngineError::Persistence(_) => "PERSISTENCE_ERROR",
            EngineError::Internal(_) => "INTERNAL",
        }
    }

    /// Reconstruct an error from a persisted `(code, message)` pair
    ///
    /// Used by the replay runtime so a captured failure replays as the same
    /// failure on later attempts.
    pub fn from_code(code: &str, message: String) -> Self {
        match code {
            "INVALID_ARGUMENT" => EngineError::InvalidArgument(message),
            "NOT_FOUND" => EngineError::NotFound(message),
            "ALREADY_EXISTS" => EngineError::AlreadyExists(message),
            "FAILED_PRECONDITION" => EngineError::FailedPrecondition(message),
            "SHARD_UNAVAILABLE" => EngineError::ShardUnavailable(message),
            "TASK_LEASE_EXPIRED" => EngineError::TaskLeaseExpired(message),
            "HISTORY_EVENT_ERROR" => EngineError::HistoryEvent(message),
            "TIMEOUT" => EngineError::Timeout,
            "CANCELED" => EngineError::Canceled,
            "PERSISTENCE_ERROR" => EngineError::Persistence(message),
            _ => EngineError::Internal(message),
        }
    }

    /// Whether a local retry with backoff is worthwhile
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::ConcurrencyConflict { .. }
                | EngineError::ShardUnavailable(_)
                | EngineError::Timeout
                | EngineError::Persistence(_)
        )
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Persistence(err.to_string())
    }
}

impl From<sled::Error> for EngineError {
    fn from(err: sled::Error) -> Self {
        EngineError::Persistence(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_codes() {
        assert_eq!(
            EngineError::ConcurrencyConflict {
                expected: 1,
                actual: 2
            }
            .code(),
            "CONCURRENCY_CONFLICT"
        );
        assert_eq!(EngineError::Timeout.code(), "TIMEOUT");
        assert_eq!(
            EngineError::NonDeterministic("divergent".into()).code(),
            "INTERNAL"
        );
    }

    #[test]
    fn test_retryability() {
        assert!(EngineError::ConcurrencyConflict {
            expected: 1,
            actual: 2
        }
        .is_retryable());
        assert!(EngineError::Persistence("disk".into()).is_retryable());
        assert!(!EngineError::InvalidArgument("bad".into()).is_retryable());
        assert!(!EngineError::Canceled.is_retryable());
    }

    #[test]
    fn test_from_code_round_trip() {
        let err = EngineError::TaskLeaseExpired("lease-1".into());
        let back = EngineError::from_code(err.code(), "lease-1".into());
        assert_eq!(err, back);
    }
}
