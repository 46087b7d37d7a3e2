// SPDX-License-Identifier: MIT OR Apache-2.0

//! Transport seam between the resilient clients and the network.
//!
//! The clients speak to a [`Transport`] (async) or [`BlockingTransport`]
//! instead of a concrete HTTP library. The reqwest-backed implementations
//! keep one connection pool per client, reused across calls and released
//! on `close`. Tests substitute [`crate::testkit::ScriptedTransport`].

use crate::error::{ApiError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http::Method;
use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

/// Fully resolved outbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    /// Header names are lowercase.
    pub headers: HashMap<String, String>,
    pub query: Vec<(String, String)>,
    pub body: Option<Bytes>,
    /// Bound for this single attempt.
    pub timeout: Duration,
}

/// Raw response as seen on the wire, before classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    /// Header names are lowercase.
    pub headers: HashMap<String, String>,
    pub body: Bytes,
}

impl HttpResponse {
    /// Create a response with the given status and body.
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    /// Create a JSON response.
    #[must_use]
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self::new(status, value.to_string()).with_header("content-type", "application/json")
    }

    /// Add a header.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// Async transport used by [`super::ResilientClient`].
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Perform one HTTP exchange.
    ///
    /// Implementations map network faults to `ApiError::Connection` and
    /// `ApiError::Timeout`; any HTTP status is returned as a response.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;

    /// Release pooled connections. Called at most once by the client.
    fn close(&self) {}
}

/// Blocking transport used by [`super::BlockingClient`].
pub trait BlockingTransport: Send + Sync + fmt::Debug {
    /// Perform one HTTP exchange on the calling thread.
    fn send(&self, request: HttpRequest) -> Result<HttpResponse>;

    /// Release pooled connections. Called at most once by the client.
    fn close(&self) {}
}

fn map_reqwest_error(err: &reqwest::Error, request: &HttpRequest) -> ApiError {
    if err.is_timeout() {
        ApiError::Timeout {
            duration: request.timeout,
        }
    } else if err.is_builder() {
        ApiError::Config(format!("Invalid request to {}: {err}", request.url))
    } else {
        ApiError::Connection {
            target: request.url.clone(),
            message: err.to_string(),
        }
    }
}

fn collect_headers(headers: &reqwest::header::HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn closed() -> ApiError {
    ApiError::Config("Transport is closed".to_string())
}

/// Pooled async transport backed by `reqwest`.
#[derive(Debug)]
pub struct ReqwestTransport {
    client: RwLock<Option<reqwest::Client>>,
}

impl ReqwestTransport {
    /// Build a pooled client.
    ///
    /// # Errors
    ///
    /// Returns `ApiError::Config` if the underlying client cannot be built.
    pub fn new(connect_timeout: Duration, pool_max_idle_per_host: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .pool_max_idle_per_host(pool_max_idle_per_host)
            .build()
            .map_err(|e| ApiError::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self::with_client(client))
    }

    /// Wrap an existing client.
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client: RwLock::new(Some(client)),
        }
    }

    fn client(&self) -> Option<reqwest::Client> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let client = self.client().ok_or_else(closed)?;

        let mut builder = client
            .request(request.method.clone(), &request.url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_reqwest_error(&e, &request))?;
        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let body = response
            .bytes()
            .await
            .map_err(|e| map_reqwest_error(&e, &request))?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    fn close(&self) {
        // In-flight requests keep their own handle; the pool goes with the last one.
        self.client
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Pooled blocking transport backed by `reqwest::blocking`.
///
/// Like every `reqwest::blocking` client, it must not be created or dropped
/// from within an async context.
#[derive(Debug)]
pub struct BlockingReqwestTransport {
    client: RwLock<Option<reqwest::blocking::Client>>,
}

impl BlockingReqwestTransport {
    /// Build a pooled blocking client.
    ///
    /// # Errors
    ///
    /// Returns `ApiError::Config` if the underlying client cannot be built.
    pub fn new(connect_timeout: Duration, pool_max_idle_per_host: usize) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(connect_timeout)
            .pool_max_idle_per_host(pool_max_idle_per_host)
            .build()
            .map_err(|e| ApiError::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self::with_client(client))
    }

    /// Wrap an existing blocking client.
    #[must_use]
    pub fn with_client(client: reqwest::blocking::Client) -> Self {
        Self {
            client: RwLock::new(Some(client)),
        }
    }

    fn client(&self) -> Option<reqwest::blocking::Client> {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl BlockingTransport for BlockingReqwestTransport {
    fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let client = self.client().ok_or_else(closed)?;

        let mut builder = client
            .request(request.method.clone(), &request.url)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder
            .send()
            .map_err(|e| map_reqwest_error(&e, &request))?;
        let status = response.status().as_u16();
        let headers = collect_headers(response.headers());
        let body = response
            .bytes()
            .map_err(|e| map_reqwest_error(&e, &request))?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    fn close(&self) {
        self.client
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_headers_are_case_insensitive() {
        let response = HttpResponse::new(429, "slow down").with_header("Retry-After", "5");

        assert_eq!(response.header("retry-after"), Some("5"));
        assert_eq!(response.header("RETRY-AFTER"), Some("5"));
        assert_eq!(response.header("x-missing"), None);
    }

    #[test]
    fn test_json_response() {
        let response = HttpResponse::json(200, &serde_json::json!({"ok": true}));

        assert_eq!(response.header("content-type"), Some("application/json"));
        assert_eq!(&response.body[..], br#"{"ok":true}"#);
    }

    #[tokio::test]
    async fn test_closed_transport_rejects() {
        let transport = ReqwestTransport::new(Duration::from_secs(1), 1).unwrap();
        Transport::close(&transport);

        let err = Transport::send(
            &transport,
            HttpRequest {
                method: Method::GET,
                url: "http://127.0.0.1:9/".to_string(),
                headers: HashMap::new(),
                query: Vec::new(),
                body: None,
                timeout: Duration::from_secs(1),
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ApiError::Config(_)));
    }
}
