//! Circuit breaker for fallible sandbox operations.
//!
//! ```text
//!            threshold failures            reset_timeout elapsed
//!   Closed ───────────────────▶ Open ───────────────────────▶ HalfOpen
//!     ▲                          ▲                               │
//!     │        trial succeeds    │        trial fails            │
//!     └──────────────────────────┼───────────────────────────────┤
//!                                └───────────────────────────────┘
//! ```
//!
//! While open, calls are rejected with [`CoreError::CircuitOpen`] without
//! running the operation. After the reset timeout exactly one trial call is
//! let through; concurrent callers are rejected until it finishes.

use crate::error::{CoreError, Result};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    /// Default: 5
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial.
    /// Default: 30 seconds
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        })
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
}

/// A named circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config: CircuitBreakerConfig {
                failure_threshold: config.failure_threshold.max(1),
                ..config
            },
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                opened_at: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current position. An open circuit whose timeout has elapsed still
    /// reads `Open` until the next call.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Consecutive failures counted while closed.
    pub fn failure_count(&self) -> u32 {
        self.lock().failures
    }

    /// Force the circuit closed.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.opened_at = None;
    }

    /// Run `op` through the breaker.
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = self.admit()?;
        let result = op().await;
        attempt.finish(result.is_ok());
        result
    }

    fn admit(&self) -> Result<Attempt<'_>> {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => Ok(Attempt::new(self, false)),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.reset_timeout)
                    .unwrap_or(true);
                if !elapsed {
                    return Err(self.rejection());
                }
                inner.state = CircuitState::HalfOpen;
                tracing::info!(breaker = %self.name, "Circuit half-open, allowing trial call");
                Ok(Attempt::new(self, true))
            }
            // a trial is already in flight
            CircuitState::HalfOpen => Err(self.rejection()),
        }
    }

    fn rejection(&self) -> CoreError {
        tracing::debug!(breaker = %self.name, "Circuit open, rejecting call");
        CoreError::CircuitOpen {
            name: self.name.clone(),
        }
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.lock();
        if trial {
            tracing::info!(breaker = %self.name, "Trial succeeded, circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.opened_at = None;
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.lock();
        if trial {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            tracing::warn!(breaker = %self.name, "Trial failed, circuit re-opened");
            return;
        }
        inner.failures += 1;
        if inner.state == CircuitState::Closed && inner.failures >= self.config.failure_threshold {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            tracing::warn!(
                breaker = %self.name,
                failures = inner.failures,
                "Failure threshold reached, circuit opened"
            );
        }
    }
}

/// An admitted call. Dropped unfinished (the caller's future was
/// cancelled) it counts as a failure so a trial cannot wedge the breaker
/// half-open.
struct Attempt<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    done: bool,
}

impl<'a> Attempt<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            done: false,
        }
    }

    fn finish(&mut self, ok: bool) {
        self.done = true;
        if ok {
            self.breaker.on_success(self.trial);
        } else {
            self.breaker.on_failure(self.trial);
        }
    }
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        if !self.done && self.trial {
            self.breaker.on_failure(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn breaker(threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: threshold,
                reset_timeout: Duration::from_secs(10),
            },
        )
    }

    async fn fail(b: &CircuitBreaker, calls: &AtomicU32) -> Result<()> {
        b.call(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(CoreError::Connection("boom".into()))
        })
        .await
    }

    async fn succeed(b: &CircuitBreaker, calls: &AtomicU32) -> Result<u32> {
        b.call(|| async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(7)
        })
        .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_transition_sequence() {
        let b = breaker(3);
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            assert!(!fail(&b, &calls).await.unwrap_err().is_circuit_open());
        }
        assert_eq!(b.state(), CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        // rejected without running the operation
        assert!(succeed(&b, &calls).await.unwrap_err().is_circuit_open());
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(succeed(&b, &calls).await.unwrap(), 7);
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_reopens() {
        let b = breaker(1);
        let calls = AtomicU32::new(0);
        fail(&b, &calls).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!fail(&b, &calls).await.unwrap_err().is_circuit_open());
        assert_eq!(b.state(), CircuitState::Open);

        // open-since was reset by the failed trial
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(succeed(&b, &calls).await.unwrap_err().is_circuit_open());
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(succeed(&b, &calls).await.is_ok());
    }

    #[tokio::test]
    async fn test_success_resets_count() {
        let b = breaker(3);
        let calls = AtomicU32::new(0);
        fail(&b, &calls).await.unwrap_err();
        fail(&b, &calls).await.unwrap_err();
        assert_eq!(b.failure_count(), 2);
        succeed(&b, &calls).await.unwrap();
        assert_eq!(b.failure_count(), 0);
        fail(&b, &calls).await.unwrap_err();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_trial_in_half_open() {
        let b = Arc::new(breaker(1));
        let calls = AtomicU32::new(0);
        fail(&b, &calls).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(10)).await;

        let release = Arc::new(tokio::sync::Notify::new());
        let trial = {
            let b = Arc::clone(&b);
            let release = Arc::clone(&release);
            tokio::spawn(async move { b.call(|| async move {
                release.notified().await;
                Ok(())
            })
            .await })
        };
        tokio::task::yield_now().await;
        assert_eq!(b.state(), CircuitState::HalfOpen);
        assert!(succeed(&b, &calls).await.unwrap_err().is_circuit_open());

        release.notify_one();
        trial.await.unwrap().unwrap();
        assert_eq!(b.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_trial_reopens() {
        let b = breaker(1);
        let calls = AtomicU32::new(0);
        fail(&b, &calls).await.unwrap_err();
        tokio::time::advance(Duration::from_secs(10)).await;

        let cancelled = tokio::time::timeout(
            Duration::from_secs(1),
            b.call(|| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            }),
        )
        .await;
        assert!(cancelled.is_err());
        assert_eq!(b.state(), CircuitState::Open);
    }
}
