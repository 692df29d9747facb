//! Bounded exponential backoff for transient failures
//!
//! History and matching retry locally on `ConcurrencyConflict` and transient
//! persistence failures; validation and precondition errors are surfaced
//! immediately.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

use crate::error::EngineResult;

/// Retry policy: bounded attempts with exponential backoff and jitter
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Maximum total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Ceiling on the computed delay
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(25),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based), with jitter
    fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_delay);
        let jitter_cap = (base.as_millis() as u64 / 2).max(1);
        let jitter = rand::thread_rng().gen_range(0..jitter_cap);
        base + Duration::from_millis(jitter)
    }
}

/// Run `op` until it succeeds, returns a non-retryable error, or the policy
/// is exhausted; the last error is returned as-is
pub async fn with_backoff<T, F, Fut>(
    policy: &BackoffPolicy,
    op_name: &str,
    mut op: F,
) -> EngineResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = EngineResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay(attempt);
                tracing::debug!(
                    op = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after transient failure"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn test_retries_transient_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = with_backoff(&fast_policy(), "test", move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(EngineError::Persistence("transient".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_validation() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: EngineResult<()> = with_backoff(&fast_policy(), "test", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(EngineError::InvalidArgument("bad".into()))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let result: EngineResult<()> = with_backoff(&fast_policy(), "test", || async {
            Err(EngineError::ConcurrencyConflict {
                expected: 1,
                actual: 2,
            })
        })
        .await;
        assert!(matches!(
            result,
            Err(EngineError::ConcurrencyConflict { .. })
        ));
    }
}
