// SPDX-License-Identifier: MIT OR Apache-2.0

//! Retry policies and the retry executor.
//!
//! [`RetryConfig`] runs a unit of work up to `max_attempts` times. Failures
//! the [`RetryPolicy`] rejects propagate on first occurrence; retryable
//! failures are retried after the backoff delay, and once the attempts run
//! out the last error is wrapped in [`ApiError::RetriesExhausted`].
//!
//! The async executor suspends with `tokio::time::sleep`, so other tasks
//! keep running while a caller waits. The blocking executor parks only the
//! calling thread.
//!
//! # Example
//!
//! ```
//! use resilient_api_rs::runtime::{FixedBackoff, RetryConfig};
//!
//! let retry = RetryConfig::builder()
//!     .max_attempts(3)
//!     .backoff(FixedBackoff::from_millis(100))
//!     .build();
//! ```

use crate::error::{ApiError, ErrorKind, Result};
use crate::runtime::backoff::{BackoffStrategy, ExponentialBackoff, NoBackoff};
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

// =============================================================================
// Retry Policy
// =============================================================================

/// Determines whether an error should be retried.
pub trait RetryPolicy: Clone + Send + Sync + 'static {
    /// Returns `true` if the operation should be retried for this error.
    fn should_retry(&self, error: &ApiError) -> bool;
}

/// Default retry policy: connection failures, timeouts, rate limits and
/// server errors.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRetryPolicy;

impl RetryPolicy for DefaultRetryPolicy {
    fn should_retry(&self, error: &ApiError) -> bool {
        error.kind().is_retryable()
    }
}

/// Never retry - fail immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetryPolicy;

impl RetryPolicy for NoRetryPolicy {
    fn should_retry(&self, _error: &ApiError) -> bool {
        false
    }
}

/// Retry policy based on an explicit set of error kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomRetryPolicy {
    retry_kinds: Vec<ErrorKind>,
}

impl CustomRetryPolicy {
    /// Create a policy that retries on specific kinds.
    #[must_use]
    pub fn new(retry_kinds: Vec<ErrorKind>) -> Self {
        Self { retry_kinds }
    }

    /// Create a policy for network-level errors only.
    #[must_use]
    pub fn network_errors() -> Self {
        Self::new(vec![ErrorKind::Connection, ErrorKind::Timeout])
    }

    /// The kinds this policy retries.
    #[must_use]
    pub fn kinds(&self) -> &[ErrorKind] {
        &self.retry_kinds
    }
}

impl Default for CustomRetryPolicy {
    fn default() -> Self {
        Self::new(ErrorKind::RETRYABLE.to_vec())
    }
}

impl RetryPolicy for CustomRetryPolicy {
    fn should_retry(&self, error: &ApiError) -> bool {
        self.retry_kinds.contains(&error.kind())
    }
}

// =============================================================================
// Retry hook
// =============================================================================

/// Callback invoked before every retry with the error and the attempt number
/// that failed.
///
/// A panicking hook is logged and ignored; it never aborts the retry loop.
#[derive(Clone)]
pub struct RetryHook(Arc<dyn Fn(&ApiError, u32) + Send + Sync>);

impl RetryHook {
    /// Wrap a closure as a retry hook.
    pub fn new(hook: impl Fn(&ApiError, u32) + Send + Sync + 'static) -> Self {
        Self(Arc::new(hook))
    }

    fn notify(&self, error: &ApiError, attempt: u32) {
        if catch_unwind(AssertUnwindSafe(|| (self.0)(error, attempt))).is_err() {
            warn!(attempt, "Retry callback panicked; continuing");
        }
    }
}

impl fmt::Debug for RetryHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RetryHook(..)")
    }
}

// =============================================================================
// Retry Configuration
// =============================================================================

/// Result of a retried operation together with the number of attempts made.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// Final result: a success, a non-retryable error, `RetriesExhausted`
    /// or `Cancelled`.
    pub result: Result<T>,
    /// Attempts actually started (0 if cancelled before the first one).
    pub attempts: u32,
}

impl<T> RetryOutcome<T> {
    /// Attempts beyond the first.
    #[must_use]
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

enum Step {
    Fail(ApiError),
    Retry(Duration),
}

/// Complete retry configuration combining policy and backoff.
#[derive(Debug, Clone)]
pub struct RetryConfig<P: RetryPolicy = DefaultRetryPolicy, B: BackoffStrategy = ExponentialBackoff>
{
    /// Maximum number of attempts, including the first one.
    pub max_attempts: u32,
    /// Policy determining which errors to retry.
    pub policy: P,
    /// Backoff strategy for calculating delays.
    pub backoff: B,
    /// Maximum total time after which no new attempt is started.
    pub total_timeout: Option<Duration>,
    /// Wait at least the server's `Retry-After` on rate-limited failures.
    pub honor_retry_after: bool,
    /// Callback fired before each retry.
    pub on_retry: Option<RetryHook>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            policy: DefaultRetryPolicy,
            backoff: ExponentialBackoff::default(),
            total_timeout: None,
            honor_retry_after: false,
            on_retry: None,
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a configuration builder.
    #[must_use]
    pub fn builder() -> RetryConfigBuilder<DefaultRetryPolicy, ExponentialBackoff> {
        RetryConfigBuilder::new()
    }

    /// Disable retries.
    #[must_use]
    pub fn disabled() -> RetryConfig<NoRetryPolicy, NoBackoff> {
        RetryConfig {
            max_attempts: 1,
            policy: NoRetryPolicy,
            backoff: NoBackoff,
            total_timeout: None,
            honor_retry_after: false,
            on_retry: None,
        }
    }
}

impl<P: RetryPolicy, B: BackoffStrategy> RetryConfig<P, B> {
    /// Execute an async operation with retry logic.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(operation, None).await.result
    }

    /// Execute an async operation and report how many attempts it took.
    pub async fn execute_counted<T, F, Fut>(&self, operation: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(operation, None).await
    }

    /// Execute an async operation that stops as soon as `token` is cancelled.
    ///
    /// Cancellation abandons the in-flight attempt or backoff wait and
    /// yields `ApiError::Cancelled`; no further attempt is started.
    pub async fn execute_cancellable<T, F, Fut>(
        &self,
        operation: F,
        token: &CancellationToken,
    ) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(operation, Some(token)).await
    }

    /// Execute a blocking operation with retry logic.
    ///
    /// Backoff waits park the calling thread only.
    pub fn execute_blocking<T, F>(&self, operation: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        self.execute_blocking_counted(operation).result
    }

    /// Execute a blocking operation and report how many attempts it took.
    pub fn execute_blocking_counted<T, F>(&self, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Result<T>,
    {
        let start = std::time::Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;
            match operation() {
                Ok(value) => return self.succeeded(value, attempt),
                Err(e) => match self.after_failure(attempt, e, start.elapsed()) {
                    Step::Fail(e) => return RetryOutcome { result: Err(e), attempts: attempt },
                    Step::Retry(delay) => {
                        if !delay.is_zero() {
                            std::thread::sleep(delay);
                        }
                    }
                },
            }
        }
    }

    async fn run<T, F, Fut>(
        &self,
        mut operation: F,
        cancel: Option<&CancellationToken>,
    ) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let start = tokio::time::Instant::now();
        let mut attempt = 0;

        loop {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return Self::cancelled(attempt);
            }
            attempt += 1;

            let result = match cancel {
                Some(token) => tokio::select! {
                    biased;
                    () = token.cancelled() => return Self::cancelled(attempt),
                    result = operation() => result,
                },
                None => operation().await,
            };

            match result {
                Ok(value) => return self.succeeded(value, attempt),
                Err(e) => match self.after_failure(attempt, e, start.elapsed()) {
                    Step::Fail(e) => return RetryOutcome { result: Err(e), attempts: attempt },
                    Step::Retry(delay) => match cancel {
                        Some(token) => tokio::select! {
                            biased;
                            () = token.cancelled() => return Self::cancelled(attempt),
                            () = tokio::time::sleep(delay) => {}
                        },
                        None => tokio::time::sleep(delay).await,
                    },
                },
            }
        }
    }

    fn succeeded<T>(&self, value: T, attempt: u32) -> RetryOutcome<T> {
        if attempt > 1 {
            info!(attempt, max_attempts = self.max_attempts, "Succeeded after retry");
        }
        RetryOutcome {
            result: Ok(value),
            attempts: attempt,
        }
    }

    fn cancelled<T>(attempts: u32) -> RetryOutcome<T> {
        info!(attempts, "Retry loop cancelled by caller");
        RetryOutcome {
            result: Err(ApiError::Cancelled),
            attempts,
        }
    }

    fn after_failure(&self, attempt: u32, err: ApiError, elapsed: Duration) -> Step {
        if !self.policy.should_retry(&err) {
            return Step::Fail(err);
        }

        let max_attempts = self.max_attempts.max(1);
        if attempt >= max_attempts {
            error!(attempt, error = %err, "Failed after {max_attempts} attempts");
            return Step::Fail(ApiError::exhausted(attempt, err));
        }

        if let Some(budget) = self.total_timeout {
            if elapsed >= budget {
                error!(attempt, error = %err, ?budget, "Retry time budget exhausted");
                return Step::Fail(ApiError::exhausted(attempt, err));
            }
        }

        let delay = self.delay_for(attempt, &err);
        warn!(
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying after error"
        );

        if let Some(hook) = &self.on_retry {
            hook.notify(&err, attempt);
        }

        Step::Retry(delay)
    }

    fn delay_for(&self, attempt: u32, err: &ApiError) -> Duration {
        let delay = self.backoff.delay(attempt);
        match err.retry_after() {
            Some(retry_after) if self.honor_retry_after => delay.max(retry_after),
            _ => delay,
        }
    }
}

/// Builder for `RetryConfig`.
#[derive(Debug, Clone)]
pub struct RetryConfigBuilder<P: RetryPolicy, B: BackoffStrategy> {
    max_attempts: u32,
    policy: P,
    backoff: B,
    total_timeout: Option<Duration>,
    honor_retry_after: bool,
    on_retry: Option<RetryHook>,
}

impl RetryConfigBuilder<DefaultRetryPolicy, ExponentialBackoff> {
    /// Create a new builder with defaults.
    #[must_use]
    pub fn new() -> Self {
        let defaults = RetryConfig::default();
        Self {
            max_attempts: defaults.max_attempts,
            policy: defaults.policy,
            backoff: defaults.backoff,
            total_timeout: defaults.total_timeout,
            honor_retry_after: defaults.honor_retry_after,
            on_retry: None,
        }
    }
}

impl Default for RetryConfigBuilder<DefaultRetryPolicy, ExponentialBackoff> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: RetryPolicy, B: BackoffStrategy> RetryConfigBuilder<P, B> {
    /// Set maximum attempts (first try included).
    #[must_use]
    pub fn max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    /// Set the retry policy.
    #[must_use]
    pub fn policy<P2: RetryPolicy>(self, policy: P2) -> RetryConfigBuilder<P2, B> {
        RetryConfigBuilder {
            max_attempts: self.max_attempts,
            policy,
            backoff: self.backoff,
            total_timeout: self.total_timeout,
            honor_retry_after: self.honor_retry_after,
            on_retry: self.on_retry,
        }
    }

    /// Set the backoff strategy.
    #[must_use]
    pub fn backoff<B2: BackoffStrategy>(self, backoff: B2) -> RetryConfigBuilder<P, B2> {
        RetryConfigBuilder {
            max_attempts: self.max_attempts,
            policy: self.policy,
            backoff,
            total_timeout: self.total_timeout,
            honor_retry_after: self.honor_retry_after,
            on_retry: self.on_retry,
        }
    }

    /// Set the total time budget for all attempts.
    #[must_use]
    pub fn total_timeout(mut self, timeout: Duration) -> Self {
        self.total_timeout = Some(timeout);
        self
    }

    /// Disable the total time budget.
    #[must_use]
    pub fn no_total_timeout(mut self) -> Self {
        self.total_timeout = None;
        self
    }

    /// Wait at least the server-advertised `Retry-After` when rate limited.
    #[must_use]
    pub fn honor_retry_after(mut self, enabled: bool) -> Self {
        self.honor_retry_after = enabled;
        self
    }

    /// Register a callback fired before every retry.
    #[must_use]
    pub fn on_retry(mut self, hook: impl Fn(&ApiError, u32) + Send + Sync + 'static) -> Self {
        self.on_retry = Some(RetryHook::new(hook));
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> RetryConfig<P, B> {
        RetryConfig {
            max_attempts: self.max_attempts,
            policy: self.policy,
            backoff: self.backoff,
            total_timeout: self.total_timeout,
            honor_retry_after: self.honor_retry_after,
            on_retry: self.on_retry,
        }
    }
}
