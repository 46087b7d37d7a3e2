// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error taxonomy shared by every layer of the client.
//!
//! Every failure path produces exactly one [`ApiError`]. The set is closed:
//! retry policies and the circuit breaker select on [`ErrorKind`], and
//! [`ApiError::RetriesExhausted`] keeps the last underlying error so callers
//! can always reach the root cause.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Fallback used when a `429` response carries no usable `Retry-After`.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("Connection to {target} failed: {message}")]
    Connection { target: String, message: String },

    #[error("Request timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Rate limit exceeded, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Server error (HTTP {status}): {body}")]
    Server { status: u16, body: String },

    #[error("Client error (HTTP {status}): {body}")]
    Client { status: u16, body: String },

    #[error("Circuit breaker is open, will retry after {remaining:?}")]
    CircuitOpen { remaining: Duration },

    #[error("Max retries ({attempts}) exceeded: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<ApiError>,
    },

    #[error("Request cancelled")]
    Cancelled,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Discriminant of [`ApiError`], used to describe sets of error kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Connection,
    Timeout,
    RateLimited,
    Server,
    Client,
    CircuitOpen,
    RetriesExhausted,
    Cancelled,
    InvalidResponse,
    Config,
}

impl ErrorKind {
    /// Kinds that are expected to be transient and safe to retry.
    pub const RETRYABLE: [ErrorKind; 4] = [
        ErrorKind::Connection,
        ErrorKind::Timeout,
        ErrorKind::RateLimited,
        ErrorKind::Server,
    ];

    /// Returns `true` for kinds in [`ErrorKind::RETRYABLE`].
    #[must_use]
    pub fn is_retryable(self) -> bool {
        Self::RETRYABLE.contains(&self)
    }

    /// Returns `true` if this kind describes a failure of the downstream
    /// dependency rather than of the caller.
    ///
    /// Configuration mistakes and caller cancellation are not the
    /// dependency's fault, and a breaker rejection is not an outcome of
    /// the dependency at all.
    #[must_use]
    pub fn is_dependency_failure(self) -> bool {
        !matches!(
            self,
            ErrorKind::Config | ErrorKind::Cancelled | ErrorKind::CircuitOpen
        )
    }

    /// Short snake-case label, used in logs and fallback payloads.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Connection => "connection",
            ErrorKind::Timeout => "timeout",
            ErrorKind::RateLimited => "rate_limit",
            ErrorKind::Server => "server_error",
            ErrorKind::Client => "client_error",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::RetriesExhausted => "retries_exhausted",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InvalidResponse => "invalid_response",
            ErrorKind::Config => "config",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ApiError {
    /// The kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Connection { .. } => ErrorKind::Connection,
            ApiError::Timeout { .. } => ErrorKind::Timeout,
            ApiError::RateLimited { .. } => ErrorKind::RateLimited,
            ApiError::Server { .. } => ErrorKind::Server,
            ApiError::Client { .. } => ErrorKind::Client,
            ApiError::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            ApiError::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
            ApiError::Cancelled => ErrorKind::Cancelled,
            ApiError::InvalidResponse(_) => ErrorKind::InvalidResponse,
            ApiError::Config(_) => ErrorKind::Config,
        }
    }

    /// The innermost error, looking through any `RetriesExhausted` wrapping.
    #[must_use]
    pub fn root_cause(&self) -> &ApiError {
        let mut current = self;
        while let ApiError::RetriesExhausted { last, .. } = current {
            current = last;
        }
        current
    }

    /// Returns `true` if the error (not its root cause) is retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Server-advertised wait for rate-limited responses.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self.root_cause() {
            ApiError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// HTTP status attached to the root cause, if any.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self.root_cause() {
            ApiError::Server { status, .. } | ApiError::Client { status, .. } => Some(*status),
            ApiError::RateLimited { .. } => Some(429),
            _ => None,
        }
    }

    /// Wraps `last` as the final error of an exhausted retry loop.
    #[must_use]
    pub fn exhausted(attempts: u32, last: ApiError) -> Self {
        ApiError::RetriesExhausted {
            attempts,
            last: Box::new(last),
        }
    }
}

pub type Result<T> = std::result::Result<T, ApiError>;
