// SPDX-License-Identifier: MIT OR Apache-2.0

//! Circuit breaker pattern implementation for resilient API calls.
//!
//! The circuit breaker prevents cascading failures by temporarily stopping
//! requests to a failing dependency and allowing it to recover.
//!
//! # States
//!
//! - **Closed**: Normal operation, requests pass through
//! - **Open**: Requests immediately fail with [`ApiError::CircuitOpen`]
//! - **Half-Open**: A probe call tests whether the dependency has recovered
//!
//! All state lives behind one mutex. The lock is never held across an
//! `.await` or a blocking call, so checking the breaker never suspends.
//!
//! # Example
//!
//! ```
//! use resilient_api_rs::runtime::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! let config = CircuitBreakerConfig::default()
//!     .with_failure_threshold(5)
//!     .with_reset_timeout(Duration::from_secs(30));
//!
//! let breaker = CircuitBreaker::new(config);
//! assert_eq!(breaker.failure_count(), 0);
//! ```

use crate::error::{ApiError, ErrorKind, Result};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally.
    Closed,
    /// Circuit is open, requests fail immediately.
    Open,
    /// Circuit is half-open, testing if service has recovered.
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding used by the Prometheus exporter.
    #[must_use]
    pub fn as_gauge(self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// Cooldown measured from the last failure before a probe is allowed.
    pub reset_timeout: Duration,
    /// Maximum number of concurrent probes allowed in half-open state.
    pub half_open_max_requests: u32,
    /// Error kinds that count as dependency failures.
    ///
    /// `None` counts every kind except configuration errors, caller
    /// cancellation and breaker rejections.
    pub expected_failures: Option<Vec<ErrorKind>>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_max_requests: 1,
            expected_failures: None,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold.
    #[must_use]
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the reset timeout.
    #[must_use]
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Set the maximum half-open requests.
    #[must_use]
    pub fn with_half_open_max_requests(mut self, max: u32) -> Self {
        self.half_open_max_requests = max.max(1);
        self
    }

    /// Restrict the breaker to the given failure kinds.
    #[must_use]
    pub fn with_expected_failures(mut self, kinds: Vec<ErrorKind>) -> Self {
        self.expected_failures = Some(kinds);
        self
    }

    fn is_expected(&self, err: &ApiError) -> bool {
        let kind = err.kind();
        let root = err.root_cause().kind();
        match &self.expected_failures {
            Some(kinds) => kinds.contains(&kind) || kinds.contains(&root),
            None => kind.is_dependency_failure() && root.is_dependency_failure(),
        }
    }
}

/// Read-only view of the breaker, safe to serialize for health endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    pub last_failure: Option<SystemTime>,
    pub time_since_last_failure: Option<Duration>,
    /// Cooldown left before a probe is admitted; zero unless open.
    pub remaining: Duration,
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    pub failure_rate: f64,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    last_failure_wall: Option<SystemTime>,
    half_open_in_flight: u32,
    // Bumped on every transition into half-open so stale probes cannot
    // release slots of a newer probing round.
    generation: u64,
}

/// Circuit breaker for protecting against cascading failures.
///
/// One instance guards one logical dependency and is shared by every call
/// routed to it.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
    total_calls: AtomicU64,
    total_failures: AtomicU64,
    total_rejections: AtomicU64,
}

/// Admission ticket returned by [`CircuitBreaker::try_acquire`].
///
/// Report the outcome with [`BreakerPermit::record`]. Dropping the permit
/// without recording (for example when the caller's future is cancelled)
/// frees its half-open slot and leaves the state untouched.
#[derive(Debug)]
#[must_use = "record the call outcome on the permit"]
pub struct BreakerPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: Option<u64>,
}

impl BreakerPermit<'_> {
    /// Whether this permit was admitted as a half-open probe.
    #[must_use]
    pub fn is_probe(&self) -> bool {
        self.probe.is_some()
    }

    /// Feed the call outcome back into the breaker.
    pub fn record<T>(mut self, result: &Result<T>) {
        let probe = self.probe.take();
        match result {
            Ok(_) => self.breaker.on_success(probe),
            Err(e) => self.breaker.on_failure(e, probe),
        }
    }
}

impl Drop for BreakerPermit<'_> {
    fn drop(&mut self) {
        if let Some(generation) = self.probe.take() {
            self.breaker.release_probe(&mut self.breaker.lock(), generation);
        }
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                last_failure_wall: None,
                half_open_in_flight: 0,
                generation: 0,
            }),
            total_calls: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
        }
    }

    /// Create a circuit breaker with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state as last recorded.
    ///
    /// An open circuit whose cooldown has elapsed still reports `Open`
    /// until the next call moves it to `HalfOpen`.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Ask for admission of one call.
    ///
    /// # Errors
    ///
    /// Returns `ApiError::CircuitOpen` with the remaining cooldown while
    /// the circuit is open, or with a zero remainder when every half-open
    /// probe slot is taken.
    pub fn try_acquire(&self) -> Result<BreakerPermit<'_>> {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.lock();
        let state = inner.state;

        let probe = match state {
            CircuitState::Closed => None,
            CircuitState::Open => {
                let remaining = self.remaining(&inner);
                if !remaining.is_zero() {
                    drop(inner);
                    return Err(self.reject(remaining));
                }
                inner.state = CircuitState::HalfOpen;
                inner.generation += 1;
                inner.half_open_in_flight = 1;
                info!(
                    failure_count = inner.failure_count,
                    "Circuit breaker half-open, admitting probe"
                );
                Some(inner.generation)
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight >= self.config.half_open_max_requests {
                    drop(inner);
                    return Err(self.reject(Duration::ZERO));
                }
                inner.half_open_in_flight += 1;
                Some(inner.generation)
            }
        };

        Ok(BreakerPermit {
            breaker: self,
            probe,
        })
    }

    fn reject(&self, remaining: Duration) -> ApiError {
        self.total_rejections.fetch_add(1, Ordering::Relaxed);
        ApiError::CircuitOpen { remaining }
    }

    /// Execute an async operation with circuit breaker protection.
    ///
    /// # Errors
    ///
    /// Returns `ApiError::CircuitOpen` without invoking `operation` if the
    /// circuit rejects the call, otherwise the operation's own error.
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.try_acquire()?;
        let result = operation().await;
        permit.record(&result);
        result
    }

    /// Execute a blocking operation with circuit breaker protection.
    ///
    /// # Errors
    ///
    /// Same as [`CircuitBreaker::call`].
    pub fn call_blocking<F, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let permit = self.try_acquire()?;
        let result = operation();
        permit.record(&result);
        result
    }

    fn on_success(&self, probe: Option<u64>) {
        let mut inner = self.lock();
        let current_probe =
            probe.is_some_and(|generation| self.release_probe(&mut inner, generation));
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            // Only a probe of the current half-open round may close the circuit.
            CircuitState::HalfOpen if !current_probe => {}
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.half_open_in_flight = 0;
                info!("Circuit breaker closed after successful probe");
            }
            // A call admitted before the circuit opened; the probe decides.
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, err: &ApiError, probe: Option<u64>) {
        let mut inner = self.lock();
        if let Some(generation) = probe {
            self.release_probe(&mut inner, generation);
        }
        if !self.config.is_expected(err) {
            return;
        }

        self.total_failures.fetch_add(1, Ordering::Relaxed);
        inner.failure_count = inner.failure_count.saturating_add(1);
        // Late failures while open must not push the cooldown further out.
        if inner.state != CircuitState::Open {
            inner.last_failure = Some(Instant::now());
            inner.last_failure_wall = Some(SystemTime::now());
        }

        match inner.state {
            CircuitState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    error!(
                        failure_count = inner.failure_count,
                        cooldown = ?self.config.reset_timeout,
                        error = %err,
                        "Circuit breaker opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.half_open_in_flight = 0;
                warn!(error = %err, "Probe failed, circuit breaker reopened");
            }
            CircuitState::Open => {}
        }
    }

    /// Frees a probe slot. Returns `true` if the permit belonged to the
    /// current half-open round.
    fn release_probe(&self, inner: &mut Inner, generation: u64) -> bool {
        if inner.state == CircuitState::HalfOpen && inner.generation == generation {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            true
        } else {
            false
        }
    }

    fn remaining(&self, inner: &Inner) -> Duration {
        match inner.last_failure {
            Some(at) => self.config.reset_timeout.saturating_sub(at.elapsed()),
            None => Duration::ZERO,
        }
    }

    /// Manually reset the circuit breaker to closed state.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure = None;
        inner.last_failure_wall = None;
        inner.half_open_in_flight = 0;
        inner.generation += 1;
        info!("Circuit breaker manually reset");
    }

    /// Get the time until the circuit admits a probe (if open).
    #[must_use]
    pub fn time_until_retry(&self) -> Option<Duration> {
        let inner = self.lock();
        (inner.state == CircuitState::Open).then(|| self.remaining(&inner))
    }

    /// Point-in-time view of state and counters.
    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        let remaining = if inner.state == CircuitState::Open {
            self.remaining(&inner)
        } else {
            Duration::ZERO
        };
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.config.failure_threshold,
            last_failure: inner.last_failure_wall,
            time_since_last_failure: inner.last_failure.map(|at| at.elapsed()),
            remaining,
            total_calls: self.total_calls(),
            total_failures: self.total_failures(),
            total_rejections: self.total_rejections(),
            failure_rate: self.failure_rate(),
        }
    }

    /// Get the current consecutive failure count.
    #[must_use]
    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Get total number of calls.
    #[must_use]
    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::Relaxed)
    }

    /// Get total number of counted failures.
    #[must_use]
    pub fn total_failures(&self) -> u64 {
        self.total_failures.load(Ordering::Relaxed)
    }

    /// Get total number of rejections (circuit open).
    #[must_use]
    pub fn total_rejections(&self) -> u64 {
        self.total_rejections.load(Ordering::Relaxed)
    }

    /// Get failure rate (0.0 to 1.0).
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let total = self.total_calls.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        let failures = self.total_failures.load(Ordering::Relaxed);
        failures as f64 / total as f64
    }

    /// Get the circuit breaker configuration.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }
}
