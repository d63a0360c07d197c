//! Fault-isolation policies wrapped around store operations.
//!
//! Two composable policy objects:
//!
//! - `CircuitBreaker`: fails fast after repeated errors, protecting workers
//!   from hammering an unreachable store
//! - `RetryPolicy`: bounded retry with linear backoff for transient errors
//!
//! Both wrap arbitrary async operations rather than being inlined into call
//! sites, so a caller can stack them: retry inside, breaker outside, or
//! either alone.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::warn;

/// Error returned by a circuit-breaker-wrapped operation.
#[derive(Debug, Error)]
pub enum BreakerError<E: std::error::Error> {
    /// The breaker is open; the operation was not invoked.
    #[error("circuit breaker is open")]
    Open,

    /// The operation ran and failed.
    #[error(transparent)]
    Inner(E),
}

/// Configuration for a `CircuitBreaker`.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// How long the breaker stays open after the last failure.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

struct BreakerState {
    failures: u32,
    last_failure: Option<Instant>,
}

/// Failure-isolation wrapper around a fallible async operation.
///
/// Opens after `failure_threshold` consecutive failures and short-circuits
/// calls until `reset_timeout` has elapsed since the last failure. The first
/// call after the cooldown is let through; success closes the breaker.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState {
                failures: 0,
                last_failure: None,
            }),
        }
    }

    /// Runs the operation unless the breaker is open.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        E: std::error::Error,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if self.is_open() {
            return Err(BreakerError::Open);
        }

        match operation().await {
            Ok(value) => {
                self.reset();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Returns whether calls are currently short-circuited.
    pub fn is_open(&self) -> bool {
        let state = self.lock_state();
        match state.last_failure {
            Some(last) => {
                state.failures >= self.config.failure_threshold
                    && last.elapsed() <= self.config.reset_timeout
            }
            None => false,
        }
    }

    /// Returns the current consecutive-failure count.
    pub fn failure_count(&self) -> u32 {
        self.lock_state().failures
    }

    fn record_failure(&self) {
        let mut state = self.lock_state();
        state.failures += 1;
        state.last_failure = Some(Instant::now());
    }

    fn reset(&self) {
        let mut state = self.lock_state();
        state.failures = 0;
        state.last_failure = None;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        // The guarded section never panics, but recover anyway rather than
        // propagating a poison error out of an infallible accessor.
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

/// Bounded retry with linear backoff for transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    /// Creates a policy that retries up to `max_attempts` total attempts,
    /// sleeping `base_delay * attempt` between them.
    pub fn linear(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Runs the operation, retrying on failure until the attempt budget is
    /// spent. Returns the last error once it is.
    pub async fn run<T, E, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        return Err(e);
                    }
                    warn!(attempt, error = %e, "operation failed, retrying");
                    tokio::time::sleep(self.base_delay * attempt).await;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::linear(3, Duration::from_secs(1))
    }
}
