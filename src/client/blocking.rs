// SPDX-License-Identifier: MIT OR Apache-2.0

//! Blocking variant of the resilient client.
//!
//! Same breaker, retry, classification and statistics semantics as
//! [`super::ResilientClient`]; backoff waits and transport calls block the
//! calling thread only. Do not call it from inside an async task; use
//! `tokio::task::spawn_blocking` there.

use super::transport::{BlockingReqwestTransport, BlockingTransport, HttpRequest};
use super::{classify, ApiRequest, ApiResponse, ClientConfig, ClientCore};
use crate::error::{ApiError, Result};
use crate::runtime::{CircuitBreaker, ClientHealth, RetryOutcome};
use serde_json::Value;
use std::sync::Arc;

/// Blocking resilient client.
#[derive(Debug, Clone)]
pub struct BlockingClient {
    core: Arc<ClientCore>,
    transport: Arc<dyn BlockingTransport>,
}

impl BlockingClient {
    /// Create a client with a pooled blocking reqwest transport.
    ///
    /// # Errors
    ///
    /// Returns `ApiError::Config` for an invalid base URL or if the HTTP
    /// client cannot be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let transport =
            BlockingReqwestTransport::new(config.timeout, config.pool_max_idle_per_host)?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Create a client over a custom blocking transport.
    ///
    /// # Errors
    ///
    /// Returns `ApiError::Config` for an invalid base URL.
    pub fn with_transport(
        config: ClientConfig,
        transport: Arc<dyn BlockingTransport>,
    ) -> Result<Self> {
        Ok(Self {
            core: Arc::new(ClientCore::new(config)?),
            transport,
        })
    }

    /// Route calls through an externally owned breaker.
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
    /// Same contract as `ResilientClient::request`.
    pub fn request(&self, request: ApiRequest) -> Result<ApiResponse> {
        self.core.ensure_open()?;
        let http = self.core.prepare(&request)?;
        let span = self.core.start(&http);

        let outcome = match self.core.breaker() {
            Some(breaker) => match breaker.try_acquire() {
                Ok(permit) => {
                    let outcome = self.attempt_all(&http);
                    permit.record(&outcome.result);
                    outcome
                }
                Err(rejected) => RetryOutcome {
                    result: Err(rejected),
                    attempts: 0,
                },
            },
            None => self.attempt_all(&http),
        };

        self.core.finish(span, outcome)
    }

    fn attempt_all(&self, http: &HttpRequest) -> RetryOutcome<ApiResponse> {
        self.core
            .retry()
            .execute_blocking_counted(|| classify(self.transport.send(http.clone())?))
    }

    /// GET `endpoint`.
    ///
    /// # Errors
    ///
    /// See [`BlockingClient::request`].
    pub fn get(&self, endpoint: &str) -> Result<ApiResponse> {
        self.request(ApiRequest::get(endpoint))
    }

    /// POST a JSON body to `endpoint`.
    ///
    /// # Errors
    ///
    /// See [`BlockingClient::request`].
    pub fn post(&self, endpoint: &str, body: Value) -> Result<ApiResponse> {
        self.request(ApiRequest::post(endpoint).with_json(body))
    }

    /// PUT a JSON body to `endpoint`.
    ///
    /// # Errors
    ///
    /// See [`BlockingClient::request`].
    pub fn put(&self, endpoint: &str, body: Value) -> Result<ApiResponse> {
        self.request(ApiRequest::put(endpoint).with_json(body))
    }

    /// DELETE `endpoint`.
    ///
    /// # Errors
    ///
    /// See [`BlockingClient::request`].
    pub fn delete(&self, endpoint: &str) -> Result<ApiResponse> {
        self.request(ApiRequest::delete(endpoint))
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
