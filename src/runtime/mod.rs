// SPDX-License-Identifier: MIT OR Apache-2.0

//! Runtime utilities for resilience and observability.
//!
//! Backoff strategies, the retry executor, the circuit breaker, call
//! statistics and request logging. The clients in [`crate::client`] compose
//! these; each piece is also usable on its own around any unit of work.

mod backoff;
mod circuit_breaker;
mod logging;
mod metrics;
mod retry;

pub use backoff::{
    Backoff, BackoffStrategy, ConstantJitter, ExponentialBackoff, FixedBackoff, JitterSource,
    LinearBackoff, NoBackoff, SeededJitter, ThreadRngJitter,
};
pub use circuit_breaker::{
    BreakerPermit, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState,
};
pub use logging::{LogLevel, LoggingConfig, RequestLogger, RequestSpan, LOG_TARGET};
pub use metrics::{
    CallStats, ClientHealth, LatencySnapshot, StatsSnapshot, DEFAULT_LATENCY_BUCKETS,
};
pub use retry::{
    CustomRetryPolicy, DefaultRetryPolicy, NoRetryPolicy, RetryConfig, RetryConfigBuilder,
    RetryHook, RetryOutcome, RetryPolicy,
};
