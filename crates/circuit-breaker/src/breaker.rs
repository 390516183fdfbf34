use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in `Closed` that open the circuit
    pub failure_threshold: u32,
    /// Consecutive successes in `HalfOpen` that close it again
    pub success_threshold: u32,
    /// How long the circuit stays open before admitting a trial call
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Error, Debug)]
pub enum CircuitError<E> {
    #[error("Circuit '{name}' is open; retry after {retry_after_ms}ms")]
    Open { name: String, retry_after_ms: u64 },

    #[error(transparent)]
    Inner(E),
}

impl<E> CircuitError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitError::Open { .. })
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            CircuitError::Inner(e) => Some(e),
            CircuitError::Open { .. } => None,
        }
    }
}

/// Point-in-time view of a breaker, for logs and status endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub total_opens: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    opened_at: Option<Instant>,
    total_opens: u64,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
}

/// Closed / open / half-open protection around an external dependency.
///
/// The lock is never held across the wrapped call, so concurrent callers only
/// serialize on the bookkeeping.
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
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                opened_at: None,
                total_opens: 0,
                last_failure_at: None,
                last_success_at: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Bookkeeping stays consistent even if a holder panicked mid-update.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Run `f` through the breaker; every error counts as a failure.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_classified(f, |_| true).await
    }

    /// Run `f` through the breaker; only errors for which `is_failure`
    /// returns true count against the circuit. Other errors are returned
    /// unchanged and leave the counters untouched.
    pub async fn call_classified<F, Fut, T, E, P>(
        &self,
        f: F,
        is_failure: P,
    ) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnOnce(&E) -> bool,
    {
        self.admit()?;

        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                if is_failure(&e) {
                    self.record_failure();
                }
                Err(CircuitError::Inner(e))
            }
        }
    }

    /// Decide whether a call may proceed, moving Open -> HalfOpen once the
    /// reset timeout has elapsed.
    fn admit<E>(&self) -> Result<(), CircuitError<E>> {
        let mut inner = self.lock();
        if inner.state != CircuitState::Open {
            return Ok(());
        }

        let opened_at = inner.opened_at.unwrap_or_else(Instant::now);
        let elapsed = opened_at.elapsed();
        if elapsed >= self.config.reset_timeout {
            inner.state = CircuitState::HalfOpen;
            inner.successes = 0;
            tracing::info!("Circuit '{}' half-open, admitting trial call", self.name);
            return Ok(());
        }

        let remaining = self.config.reset_timeout - elapsed;
        Err(CircuitError::Open {
            name: self.name.clone(),
            retry_after_ms: (remaining.as_millis() as u64).max(1),
        })
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.last_success_at = Some(Utc::now());

        match inner.state {
            CircuitState::Closed => inner.failures = 0,
            CircuitState::HalfOpen => {
                inner.successes += 1;
                if inner.successes >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failures = 0;
                    inner.successes = 0;
                    inner.opened_at = None;
                    tracing::info!("Circuit '{}' closed after recovery", self.name);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.last_failure_at = Some(Utc::now());

        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    Self::trip(&self.name, &mut inner);
                }
            }
            CircuitState::HalfOpen => Self::trip(&self.name, &mut inner),
            CircuitState::Open => inner.opened_at = Some(Instant::now()),
        }
    }

    fn trip(name: &str, inner: &mut Inner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.successes = 0;
        inner.total_opens += 1;
        tracing::warn!(
            "Circuit '{}' opened after {} consecutive failures",
            name,
            inner.failures
        );
    }

    /// Force the breaker back to closed with clean counters
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.successes = 0;
        inner.opened_at = None;
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.failures,
            consecutive_successes: inner.successes,
            total_opens: inner.total_opens,
            last_failure_at: inner.last_failure_at,
            last_success_at: inner.last_success_at,
        }
    }
}
