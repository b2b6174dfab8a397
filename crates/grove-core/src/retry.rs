//! Bounded retry with exponential backoff.

use crate::error::{CoreError, Result};
use std::future::Future;
use std::time::Duration;

/// Error messages containing one of these are retried by default.
pub const DEFAULT_RETRYABLE_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "connection refused",
    "connection reset",
    "temporarily unavailable",
];

/// Retry parameters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after each retry.
    pub backoff_factor: f64,
    /// Ceiling for any single delay.
    pub max_delay: Duration,
    /// Case-insensitive substrings that mark an error as retryable.
    pub retryable_patterns: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(5),
            retryable_patterns: DEFAULT_RETRYABLE_PATTERNS.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl RetryPolicy {
    /// Whether `err` matches one of the retryable patterns.
    ///
    /// An open circuit is never retried.
    pub fn is_retryable(&self, err: &CoreError) -> bool {
        if err.is_circuit_open() {
            return false;
        }
        let message = err.to_string().to_lowercase();
        self.retryable_patterns
            .iter()
            .any(|pattern| message.contains(&pattern.to_lowercase()))
    }

    /// Delay before retry number `retry` (0-based), capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.backoff_factor.max(1.0).powi(retry.min(i32::MAX as u32) as i32);
        let secs = self.initial_delay.as_secs_f64() * factor;
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// `max_retries + 1` attempts have been made.
    ///
    /// Non-retryable errors are returned unchanged. Running out of attempts
    /// returns [`CoreError::RetriesExhausted`] wrapping the last error.
    /// Dropping the future cancels any pending delay.
    pub async fn retry<T, F, Fut>(&self, operation: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let err = match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(operation, attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !self.is_retryable(&err) {
                tracing::debug!(operation, attempt, error = %err, "Non-retryable error");
                return Err(err);
            }
            if attempt > self.max_retries {
                tracing::warn!(operation, attempts = attempt, error = %err, "Retries exhausted");
                return Err(CoreError::RetriesExhausted {
                    attempts: attempt,
                    source: Box::new(err),
                });
            }

            let delay = self.delay_for(attempt - 1);
            tracing::debug!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::time::Instant;

    #[test]
    fn test_delays_double_and_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
        assert_eq!(policy.delay_for(10), Duration::from_secs(5));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_classification() {
        let policy = RetryPolicy::default();
        assert!(policy.is_retryable(&CoreError::Connection("Connection refused (os error 111)".into())));
        assert!(policy.is_retryable(&CoreError::PoolTimeout(Duration::from_secs(1))));
        assert!(!policy.is_retryable(&CoreError::NotFound("sb".into())));
        assert!(!policy.is_retryable(&CoreError::CircuitOpen {
            name: "timeout".into()
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_runs_once() {
        let policy = RetryPolicy::default();
        let calls = Mutex::new(0);
        let err = policy
            .retry("op", || async {
                *calls.lock().unwrap() += 1;
                Err::<(), _>(CoreError::NotFound("sb".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_runs_max_plus_one_with_backoff() {
        let policy = RetryPolicy::default();
        let start = Instant::now();
        let attempts_at = Mutex::new(Vec::new());
        let err = policy
            .retry("op", || async {
                attempts_at.lock().unwrap().push(start.elapsed());
                Err::<(), _>(CoreError::Connection("connection refused".into()))
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::RetriesExhausted { attempts: 4, .. }));
        let at = attempts_at.lock().unwrap().clone();
        assert_eq!(
            at,
            vec![
                Duration::ZERO,
                Duration::from_millis(100),
                Duration::from_millis(300),
                Duration::from_millis(700),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_midway() {
        let policy = RetryPolicy::default();
        let calls = Mutex::new(0);
        let value = policy
            .retry("op", || async {
                let mut n = calls.lock().unwrap();
                *n += 1;
                if *n < 3 {
                    Err(CoreError::Connection("timed out".into()))
                } else {
                    Ok(*n)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 3);
    }
}
