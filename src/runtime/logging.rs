// SPDX-License-Identifier: MIT OR Apache-2.0

//! Structured per-call logging for HTTP requests.
//!
//! One line is emitted per completed call (not per attempt) under the
//! `resilient_api::http` target, carrying method, URL, elapsed time, the
//! number of attempts and, when enabled, the request headers with
//! credentials redacted.
//!
//! # Example
//!
//! ```
//! use resilient_api_rs::runtime::{LogLevel, LoggingConfig, RequestLogger};
//!
//! let logger = RequestLogger::with_config(
//!     LoggingConfig::new()
//!         .with_success_level(LogLevel::Debug)
//!         .with_sensitive_header("x-session"),
//! );
//! let span = logger.start("GET", "https://api.example.com/v1/events", None);
//! logger.finish_success(span, 200, 1);
//! ```

use crate::error::ApiError;
use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Log target shared by every line this module emits.
pub const LOG_TARGET: &str = "resilient_api::http";

const REDACTED: &str = "[REDACTED]";

/// Log level for request logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// Trace level - most verbose.
    Trace,
    /// Debug level.
    Debug,
    /// Info level.
    #[default]
    Info,
    /// Warn level.
    Warn,
    /// Error level - only errors.
    Error,
    /// Disabled - no logging.
    Off,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "TRACE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
            LogLevel::Off => write!(f, "OFF"),
        }
    }
}

fn default_sensitive_headers() -> Vec<String> {
    vec![
        "authorization".to_string(),
        "x-api-key".to_string(),
        "x-auth-token".to_string(),
    ]
}

/// Configuration for request logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Log level for successful calls.
    pub success_level: LogLevel,
    /// Log level for failed calls.
    pub error_level: LogLevel,
    /// Whether to log request headers.
    pub log_headers: bool,
    /// Whether to redact sensitive headers.
    pub redact_sensitive: bool,
    /// List of sensitive header names to redact.
    pub sensitive_headers: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            success_level: LogLevel::Info,
            error_level: LogLevel::Error,
            log_headers: false,
            redact_sensitive: true,
            sensitive_headers: default_sensitive_headers(),
        }
    }
}

impl LoggingConfig {
    /// Create a new logging configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the success log level.
    #[must_use]
    pub fn with_success_level(mut self, level: LogLevel) -> Self {
        self.success_level = level;
        self
    }

    /// Set the error log level.
    #[must_use]
    pub fn with_error_level(mut self, level: LogLevel) -> Self {
        self.error_level = level;
        self
    }

    /// Enable or disable header logging.
    #[must_use]
    pub fn with_headers(mut self, enabled: bool) -> Self {
        self.log_headers = enabled;
        self
    }

    /// Enable or disable sensitive data redaction.
    #[must_use]
    pub fn with_redaction(mut self, enabled: bool) -> Self {
        self.redact_sensitive = enabled;
        self
    }

    /// Add a sensitive header to redact.
    #[must_use]
    pub fn with_sensitive_header(mut self, header: impl Into<String>) -> Self {
        self.sensitive_headers.push(header.into());
        self
    }

    /// Create a verbose configuration for debugging.
    #[must_use]
    pub fn verbose() -> Self {
        Self {
            success_level: LogLevel::Debug,
            error_level: LogLevel::Error,
            log_headers: true,
            redact_sensitive: true,
            sensitive_headers: default_sensitive_headers(),
        }
    }

    /// Create a quiet configuration for production.
    #[must_use]
    pub fn quiet() -> Self {
        Self {
            success_level: LogLevel::Off,
            error_level: LogLevel::Warn,
            log_headers: false,
            redact_sensitive: true,
            sensitive_headers: default_sensitive_headers(),
        }
    }

    fn is_sensitive(&self, name: &str) -> bool {
        self.redact_sensitive
            && self
                .sensitive_headers
                .iter()
                .any(|h| h.eq_ignore_ascii_case(name))
    }
}

fn emit(level: LogLevel, msg: &str) {
    match level {
        LogLevel::Trace => trace!(target: LOG_TARGET, "{}", msg),
        LogLevel::Debug => debug!(target: LOG_TARGET, "{}", msg),
        LogLevel::Info => info!(target: LOG_TARGET, "{}", msg),
        LogLevel::Warn => warn!(target: LOG_TARGET, "{}", msg),
        LogLevel::Error => error!(target: LOG_TARGET, "{}", msg),
        LogLevel::Off => {}
    }
}

/// A request logger that tracks timing and logs call outcomes.
#[derive(Debug, Clone, Default)]
pub struct RequestLogger {
    config: LoggingConfig,
}

impl RequestLogger {
    /// Create a new request logger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a request logger with custom configuration.
    #[must_use]
    pub fn with_config(config: LoggingConfig) -> Self {
        Self { config }
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &LoggingConfig {
        &self.config
    }

    /// Render headers as `name=value` pairs, sorted, credentials redacted.
    #[must_use]
    pub fn describe_headers(&self, headers: &HashMap<String, String>) -> String {
        let mut parts: Vec<String> = headers
            .iter()
            .map(|(name, value)| {
                if self.config.is_sensitive(name) {
                    format!("{name}={REDACTED}")
                } else {
                    format!("{name}={value}")
                }
            })
            .collect();
        parts.sort();
        parts.join(", ")
    }

    /// Start tracking a call.
    #[must_use]
    pub fn start(
        &self,
        method: &str,
        url: &str,
        headers: Option<&HashMap<String, String>>,
    ) -> RequestSpan {
        let headers = match headers {
            Some(headers) if self.config.log_headers && !headers.is_empty() => {
                Some(self.describe_headers(headers))
            }
            _ => None,
        };
        RequestSpan {
            method: method.to_string(),
            url: url.to_string(),
            headers,
            start: Instant::now(),
        }
    }

    /// Finish tracking a call (success).
    pub fn finish_success(&self, span: RequestSpan, status: u16, attempts: u32) {
        if self.config.success_level == LogLevel::Off {
            return;
        }
        let msg = format!(
            "{} {} -> {} in {:?} (attempts: {}){}",
            span.method,
            span.url,
            status,
            span.elapsed(),
            attempts,
            span.header_suffix()
        );
        emit(self.config.success_level, &msg);
    }

    /// Finish tracking a call (failure).
    pub fn finish_error(&self, span: RequestSpan, err: &ApiError, attempts: u32) {
        if self.config.error_level == LogLevel::Off {
            return;
        }
        let msg = format!(
            "{} {} failed in {:?} (attempts: {}, kind: {}): {}{}",
            span.method,
            span.url,
            span.elapsed(),
            attempts,
            err.root_cause().kind(),
            err,
            span.header_suffix()
        );
        emit(self.config.error_level, &msg);
    }
}

/// A span representing an in-flight call.
#[derive(Debug)]
pub struct RequestSpan {
    method: String,
    url: String,
    headers: Option<String>,
    start: Instant,
}

impl RequestSpan {
    /// Get the method name.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Get the request URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Rendered headers, when header logging is enabled.
    #[must_use]
    pub fn headers(&self) -> Option<&str> {
        self.headers.as_deref()
    }

    /// Get the elapsed time since the call started.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    fn header_suffix(&self) -> String {
        self.headers
            .as_ref()
            .map(|h| format!(" headers=[{h}]"))
            .unwrap_or_default()
    }
}
