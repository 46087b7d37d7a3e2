// SPDX-License-Identifier: MIT OR Apache-2.0

//! Resilient HTTP clients.
//!
//! [`ResilientClient`] (async) and [`BlockingClient`] share one contract:
//! every call goes through the circuit breaker (when enabled), which wraps
//! the retry executor, which wraps a single bounded transport exchange.
//! Responses are classified into success or a typed [`ApiError`], and every
//! completed call updates the client's [`CallStats`].
//!
//! # Example
//!
//! ```no_run
//! use resilient_api_rs::client::{ClientConfig, ResilientClient};
//! use resilient_api_rs::runtime::FixedBackoff;
//! use std::time::Duration;
//!
//! # async fn run() -> resilient_api_rs::error::Result<()> {
//! let config = ClientConfig::builder("https://calendar.example.com/api")
//!     .header("x-api-key", "secret")
//!     .timeout(Duration::from_secs(10))
//!     .backoff(FixedBackoff::from_millis(500))
//!     .build();
//!
//! let client = ResilientClient::new(config)?;
//! let events = client.get("/events").await?;
//! println!("{:?}", events.json());
//! client.close();
//! # Ok(())
//! # }
//! ```

mod blocking;
pub mod transport;

pub use blocking::BlockingClient;
pub use transport::{
    BlockingReqwestTransport, BlockingTransport, HttpRequest, HttpResponse, ReqwestTransport,
    Transport,
};

use crate::error::{ApiError, ErrorKind, Result, DEFAULT_RETRY_AFTER};
use crate::runtime::{
    Backoff, CallStats, CircuitBreaker, CircuitBreakerConfig, ClientHealth, CustomRetryPolicy,
    LoggingConfig, RequestLogger, RequestSpan, RetryConfig, RetryOutcome,
};
use bytes::Bytes;
use http::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Per-attempt timeout used when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Attempts per call (first try included) used when none is configured.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
/// Idle connections kept per host.
pub const DEFAULT_POOL_MAX_IDLE_PER_HOST: usize = 10;

/// Immutable configuration shared by both client variants.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Prefix joined with every endpoint. May be empty if endpoints are absolute.
    pub base_url: String,
    /// Headers sent with every call; per-call headers win on conflict.
    pub default_headers: HashMap<String, String>,
    /// Bound for each transport attempt.
    pub timeout: Duration,
    /// Attempts per call, first try included.
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Error kinds the retry executor retries.
    pub retryable: Vec<ErrorKind>,
    /// Optional wall-clock budget for all attempts of one call.
    pub total_timeout: Option<Duration>,
    pub honor_retry_after: bool,
    /// `None` disables the circuit breaker.
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    pub logging: LoggingConfig,
    pub pool_max_idle_per_host: usize,
}

impl ClientConfig {
    /// Configuration with defaults for the given base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            default_headers: HashMap::new(),
            timeout: DEFAULT_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::default(),
            retryable: ErrorKind::RETRYABLE.to_vec(),
            total_timeout: None,
            honor_retry_after: false,
            circuit_breaker: Some(CircuitBreakerConfig::default()),
            logging: LoggingConfig::default(),
            pool_max_idle_per_host: DEFAULT_POOL_MAX_IDLE_PER_HOST,
        }
    }

    /// Create a configuration builder.
    pub fn builder(base_url: impl Into<String>) -> ClientConfigBuilder {
        ClientConfigBuilder {
            config: Self::new(base_url),
        }
    }

    fn retry_config(&self) -> RetryConfig<CustomRetryPolicy, Backoff> {
        let builder = RetryConfig::builder()
            .max_attempts(self.max_attempts)
            .policy(CustomRetryPolicy::new(self.retryable.clone()))
            .backoff(self.backoff.clone())
            .honor_retry_after(self.honor_retry_after);
        match self.total_timeout {
            Some(budget) => builder.total_timeout(budget).build(),
            None => builder.build(),
        }
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Clone)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Add a default header.
    #[must_use]
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.config
            .default_headers
            .insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Set the per-attempt timeout.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Set maximum attempts per call (first try included).
    #[must_use]
    pub fn max_attempts(mut self, max: u32) -> Self {
        self.config.max_attempts = max.max(1);
        self
    }

    /// Set the backoff strategy.
    #[must_use]
    pub fn backoff(mut self, backoff: impl Into<Backoff>) -> Self {
        self.config.backoff = backoff.into();
        self
    }

    /// Replace the set of retryable error kinds.
    #[must_use]
    pub fn retryable(mut self, kinds: Vec<ErrorKind>) -> Self {
        self.config.retryable = kinds;
        self
    }

    /// Set the total time budget for all attempts of a call.
    #[must_use]
    pub fn total_timeout(mut self, budget: Duration) -> Self {
        self.config.total_timeout = Some(budget);
        self
    }

    /// Wait at least the server's `Retry-After` before retrying a 429.
    #[must_use]
    pub fn honor_retry_after(mut self, enabled: bool) -> Self {
        self.config.honor_retry_after = enabled;
        self
    }

    /// Enable the circuit breaker with the given configuration.
    #[must_use]
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.config.circuit_breaker = Some(config);
        self
    }

    /// Disable the circuit breaker.
    #[must_use]
    pub fn without_circuit_breaker(mut self) -> Self {
        self.config.circuit_breaker = None;
        self
    }

    /// Set the request logging configuration.
    #[must_use]
    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.config.logging = logging;
        self
    }

    /// Set the idle pool size per host.
    #[must_use]
    pub fn pool_max_idle_per_host(mut self, max: usize) -> Self {
        self.config.pool_max_idle_per_host = max;
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> ClientConfig {
        self.config
    }
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        ClientConfig::builder("")
    }
}

/// Request payload.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    /// Serialized as JSON; sets `content-type: application/json` unless given.
    Json(Value),
    Raw(Bytes),
}

/// One logical call, before URL resolution and header merging.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub endpoint: String,
    pub headers: HashMap<String, String>,
    pub query: Vec<(String, String)>,
    pub body: Option<RequestBody>,
}

impl ApiRequest {
    pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            headers: HashMap::new(),
            query: Vec::new(),
            body: None,
        }
    }

    pub fn get(endpoint: impl Into<String>) -> Self {
        Self::new(Method::GET, endpoint)
    }

    pub fn post(endpoint: impl Into<String>) -> Self {
        Self::new(Method::POST, endpoint)
    }

    pub fn put(endpoint: impl Into<String>) -> Self {
        Self::new(Method::PUT, endpoint)
    }

    pub fn delete(endpoint: impl Into<String>) -> Self {
        Self::new(Method::DELETE, endpoint)
    }

    /// Add a per-call header (overrides a default header of the same name).
    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Append a query parameter.
    #[must_use]
    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Set a JSON body.
    #[must_use]
    pub fn with_json(mut self, body: Value) -> Self {
        self.body = Some(RequestBody::Json(body));
        self
    }

    /// Set a raw body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(RequestBody::Raw(body.into()));
        self
    }
}

/// Parsed body of a successful response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Json(Value),
    /// Body that is not valid JSON (including an empty body).
    Text(String),
}

impl ResponseBody {
    fn parse(body: &[u8]) -> Self {
        match serde_json::from_slice(body) {
            Ok(value) => ResponseBody::Json(value),
            Err(_) => ResponseBody::Text(String::from_utf8_lossy(body).into_owned()),
        }
    }
}

/// Successful (2xx) response.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: ResponseBody,
}

impl ApiResponse {
    /// The JSON body, if the response was JSON.
    #[must_use]
    pub fn json(&self) -> Option<&Value> {
        match &self.body {
            ResponseBody::Json(value) => Some(value),
            ResponseBody::Text(_) => None,
        }
    }

    /// The text body, if the response was not JSON.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        match &self.body {
            ResponseBody::Text(text) => Some(text),
            ResponseBody::Json(_) => None,
        }
    }

    /// The body as JSON; text bodies become `{"text": "..."}`.
    #[must_use]
    pub fn into_json(self) -> Value {
        match self.body {
            ResponseBody::Json(value) => value,
            ResponseBody::Text(text) => serde_json::json!({ "text": text }),
        }
    }

    /// Deserialize the JSON body into `T`.
    ///
    /// # Errors
    ///
    /// Returns `ApiError::InvalidResponse` if the body is not JSON or does
    /// not match `T`.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        let value = self
            .json()
            .ok_or_else(|| ApiError::InvalidResponse("Response body is not JSON".to_string()))?;
        T::deserialize(value).map_err(|e| ApiError::InvalidResponse(e.to_string()))
    }
}

/// Join base URL and endpoint with exactly one `/` and validate the result.
pub(crate) fn build_url(base: &str, endpoint: &str) -> Result<String> {
    let base = base.trim_end_matches('/');
    let endpoint = endpoint.trim_start_matches('/');
    let joined = match (base.is_empty(), endpoint.is_empty()) {
        (true, _) => endpoint.to_string(),
        (false, true) => base.to_string(),
        (false, false) => format!("{base}/{endpoint}"),
    };
    url::Url::parse(&joined)
        .map_err(|e| ApiError::Config(format!("Invalid URL '{joined}': {e}")))?;
    Ok(joined)
}

fn parse_retry_after(value: Option<&str>) -> Duration {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(DEFAULT_RETRY_AFTER, Duration::from_secs)
}

/// Map a raw response to success or a typed error.
pub(crate) fn classify(response: HttpResponse) -> Result<ApiResponse> {
    let status = response.status;
    match status {
        200..=299 => Ok(ApiResponse {
            status,
            body: ResponseBody::parse(&response.body),
            headers: response.headers,
        }),
        429 => Err(ApiError::RateLimited {
            retry_after: parse_retry_after(response.header("retry-after")),
        }),
        500..=599 => Err(ApiError::Server {
            status,
            body: String::from_utf8_lossy(&response.body).into_owned(),
        }),
        _ => Err(ApiError::Client {
            status,
            body: String::from_utf8_lossy(&response.body).into_owned(),
        }),
    }
}

/// State shared by the async and blocking clients.
#[derive(Debug)]
pub(crate) struct ClientCore {
    config: ClientConfig,
    retry: RetryConfig<CustomRetryPolicy, Backoff>,
    breaker: Option<Arc<CircuitBreaker>>,
    stats: CallStats,
    logger: RequestLogger,
    closed: AtomicBool,
}

impl ClientCore {
    pub(crate) fn new(mut config: ClientConfig) -> Result<Self> {
        if !config.base_url.is_empty() {
            url::Url::parse(&config.base_url).map_err(|e| {
                ApiError::Config(format!("Invalid base URL '{}': {e}", config.base_url))
            })?;
        }
        config.default_headers = config
            .default_headers
            .into_iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value))
            .collect();

        let breaker = config
            .circuit_breaker
            .clone()
            .map(|c| Arc::new(CircuitBreaker::new(c)));
        Ok(Self {
            retry: config.retry_config(),
            logger: RequestLogger::with_config(config.logging.clone()),
            stats: CallStats::new(),
            closed: AtomicBool::new(false),
            breaker,
            config,
        })
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub(crate) fn retry(&self) -> &RetryConfig<CustomRetryPolicy, Backoff> {
        &self.retry
    }

    pub(crate) fn breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    pub(crate) fn set_breaker(&mut self, breaker: Option<Arc<CircuitBreaker>>) {
        self.breaker = breaker;
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ApiError::Config("Client is closed".to_string()));
        }
        Ok(())
    }

    /// Returns `true` only for the first call.
    pub(crate) fn mark_closed(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        if first {
            info!(base_url = %self.config.base_url, "Closing client, releasing pooled connections");
        }
        first
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolve URL, merge headers and encode the body.
    pub(crate) fn prepare(&self, request: &ApiRequest) -> Result<HttpRequest> {
        let url = build_url(&self.config.base_url, &request.endpoint)?;

        let mut headers = self.config.default_headers.clone();
        for (name, value) in &request.headers {
            headers.insert(name.to_ascii_lowercase(), value.clone());
        }

        let body = match &request.body {
            None => None,
            Some(RequestBody::Raw(bytes)) => Some(bytes.clone()),
            Some(RequestBody::Json(value)) => {
                headers
                    .entry("content-type".to_string())
                    .or_insert_with(|| "application/json".to_string());
                let encoded = serde_json::to_vec(value)
                    .map_err(|e| ApiError::Config(format!("Unserializable body: {e}")))?;
                Some(Bytes::from(encoded))
            }
        };

        Ok(HttpRequest {
            method: request.method.clone(),
            url,
            headers,
            query: request.query.clone(),
            body,
            timeout: self.config.timeout,
        })
    }

    pub(crate) fn start(&self, request: &HttpRequest) -> RequestSpan {
        self.logger
            .start(request.method.as_str(), &request.url, Some(&request.headers))
    }

    /// Record statistics and log the outcome of one completed call.
    pub(crate) fn finish(
        &self,
        span: RequestSpan,
        outcome: RetryOutcome<ApiResponse>,
    ) -> Result<ApiResponse> {
        let RetryOutcome { result, attempts } = outcome;
        self.stats.record(result.is_ok(), attempts, span.elapsed());
        match &result {
            Ok(response) => self.logger.finish_success(span, response.status, attempts),
            Err(e) => self.logger.finish_error(span, e, attempts),
        }
        result
    }

    pub(crate) fn health(&self) -> ClientHealth {
        ClientHealth {
            stats: self.stats.snapshot(),
            breaker: self.breaker.as_ref().map(|b| b.snapshot()),
        }
    }

    pub(crate) fn reset_stats(&self) {
        self.stats.reset();
    }

    pub(crate) fn reset_breaker(&self) {
        if let Some(breaker) = &self.breaker {
            breaker.reset();
        }
    }
}

/// Async resilient client.
///
/// Cloning is cheap; clones share the connection pool, breaker, statistics
/// and closed flag.
#[derive(Debug, Clone)]
pub struct ResilientClient {
    core: Arc<ClientCore>,
    transport: Arc<dyn Transport>,
}

impl ResilientClient {
    /// Create a client with a pooled reqwest transport.
    ///
    /// # Errors
    ///
    /// Returns `ApiError::Config` for an invalid base URL or if the HTTP
    /// client cannot be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let transport =
            ReqwestTransport::new(config.timeout, config.pool_max_idle_per_host)?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Create a client over a custom transport.
    ///
    /// # Errors
    ///
    /// Returns `ApiError::Config` for an invalid base URL.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        Ok(Self {
            core: Arc::new(ClientCore::new(config)?),
            transport,
        })
    }

    /// Route calls through an externally owned breaker, typically one shared
    /// by every client of the same dependency.
    ///
    /// Must be called before the client is cloned.
    ///
    /// # Errors
    ///
    /// Returns `ApiError::Config` if the client has already been cloned.
    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Result<Self> {
        Arc::get_mut(&mut self.core)
            .ok_or_else(|| {
                ApiError::Config("Cannot replace the breaker of a shared client".to_string())
            })?
            .set_breaker(Some(breaker));
        Ok(self)
    }

    /// Execute a request.
    ///
    /// # Errors
    ///
    /// Returns the classified failure: `CircuitOpen` when the breaker
    /// rejects the call, a non-retryable error on first occurrence, or
    /// `RetriesExhausted` wrapping the last retryable error.
    pub async fn request(&self, request: ApiRequest) -> Result<ApiResponse> {
        self.execute(request, None).await
    }

    /// Execute a request that stops as soon as `token` is cancelled.
    ///
    /// # Errors
    ///
    /// Same as [`ResilientClient::request`], plus `ApiError::Cancelled`.
    pub async fn request_cancellable(
        &self,
        request: ApiRequest,
        token: &CancellationToken,
    ) -> Result<ApiResponse> {
        self.execute(request, Some(token)).await
    }

    /// GET `endpoint`.
    ///
    /// # Errors
    ///
    /// See [`ResilientClient::request`].
    pub async fn get(&self, endpoint: &str) -> Result<ApiResponse> {
        self.request(ApiRequest::get(endpoint)).await
    }

    /// POST a JSON body to `endpoint`.
    ///
    /// # Errors
    ///
    /// See [`ResilientClient::request`].
    pub async fn post(&self, endpoint: &str, body: Value) -> Result<ApiResponse> {
        self.request(ApiRequest::post(endpoint).with_json(body)).await
    }

    /// PUT a JSON body to `endpoint`.
    ///
    /// # Errors
    ///
    /// See [`ResilientClient::request`].
    pub async fn put(&self, endpoint: &str, body: Value) -> Result<ApiResponse> {
        self.request(ApiRequest::put(endpoint).with_json(body)).await
    }

    /// DELETE `endpoint`.
    ///
    /// # Errors
    ///
    /// See [`ResilientClient::request`].
    pub async fn delete(&self, endpoint: &str) -> Result<ApiResponse> {
        self.request(ApiRequest::delete(endpoint)).await
    }

    async fn execute(
        &self,
        request: ApiRequest,
        cancel: Option<&CancellationToken>,
    ) -> Result<ApiResponse> {
        self.core.ensure_open()?;
        let http = self.core.prepare(&request)?;
        let span = self.core.start(&http);

        let outcome = match self.core.breaker() {
            Some(breaker) => match breaker.try_acquire() {
                Ok(permit) => {
                    let outcome = self.attempt_all(&http, cancel).await;
                    permit.record(&outcome.result);
                    outcome
                }
                Err(rejected) => RetryOutcome {
                    result: Err(rejected),
                    attempts: 0,
                },
            },
            None => self.attempt_all(&http, cancel).await,
        };

        self.core.finish(span, outcome)
    }

    async fn attempt_all(
        &self,
        http: &HttpRequest,
        cancel: Option<&CancellationToken>,
    ) -> RetryOutcome<ApiResponse> {
        let send = || self.send_once(http.clone());
        match cancel {
            Some(token) => self.core.retry().execute_cancellable(send, token).await,
            None => self.core.retry().execute_counted(send).await,
        }
    }

    async fn send_once(&self, request: HttpRequest) -> Result<ApiResponse> {
        let timeout = request.timeout;
        match tokio::time::timeout(timeout, self.transport.send(request)).await {
            Ok(response) => classify(response?),
            Err(_) => Err(ApiError::Timeout { duration: timeout }),
        }
    }

    /// Call statistics plus the breaker view.
    #[must_use]
    pub fn stats(&self) -> ClientHealth {
        self.core.health()
    }

    /// Zero the call statistics.
    pub fn reset_stats(&self) {
        self.core.reset_stats();
    }

    /// Force the breaker closed.
    pub fn reset_breaker(&self) {
        self.core.reset_breaker();
    }

    /// The breaker guarding this client, if enabled.
    #[must_use]
    pub fn circuit_breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.core.breaker()
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        self.core.config()
    }

    /// Release pooled connections. Later calls are no-ops.
    pub fn close(&self) {
        if self.core.mark_closed() {
            self.transport.close();
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new("")
    }
}
