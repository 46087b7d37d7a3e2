// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory transport for tests and for collaborators that want to
//! exercise retry and breaker behaviour without a network.
//!
//! ```
//! use resilient_api_rs::client::HttpResponse;
//! use resilient_api_rs::testkit::ScriptedTransport;
//!
//! let transport = ScriptedTransport::new()
//!     .then_status(503)
//!     .then(Ok(HttpResponse::new(200, "ok")));
//! assert_eq!(transport.remaining(), 2);
//! ```

use crate::client::{BlockingTransport, HttpRequest, HttpResponse, Transport};
use crate::error::{ApiError, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Transport that replays a queue of canned outcomes.
///
/// Once the queue is empty the `otherwise` outcome is repeated, or a
/// connection error is returned if none was set. Every request is recorded.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Result<HttpResponse>>>,
    otherwise: Option<Result<HttpResponse>>,
    delay: Option<Duration>,
    requests: Mutex<Vec<HttpRequest>>,
    closes: AtomicU32,
}

impl ScriptedTransport {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next outcome.
    #[must_use]
    pub fn then(self, outcome: Result<HttpResponse>) -> Self {
        lock(&self.script).push_back(outcome);
        self
    }

    /// Queue a response with the given status and an empty body.
    #[must_use]
    pub fn then_status(self, status: u16) -> Self {
        self.then(Ok(HttpResponse::new(status, "")))
    }

    /// Queue a JSON response.
    #[must_use]
    pub fn then_json(self, status: u16, body: serde_json::Value) -> Self {
        self.then(Ok(HttpResponse::json(status, &body)))
    }

    /// Outcome repeated once the queue is drained.
    #[must_use]
    pub fn otherwise(mut self, outcome: Result<HttpResponse>) -> Self {
        self.otherwise = Some(outcome);
        self
    }

    /// Delay every exchange, to exercise timeouts and cancellation.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queue an outcome on a shared transport.
    pub fn push(&self, outcome: Result<HttpResponse>) {
        lock(&self.script).push_back(outcome);
    }

    /// Outcomes still queued.
    #[must_use]
    pub fn remaining(&self) -> usize {
        lock(&self.script).len()
    }

    /// Number of exchanges attempted so far.
    #[must_use]
    pub fn send_count(&self) -> usize {
        lock(&self.requests).len()
    }

    /// Every request seen so far, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<HttpRequest> {
        lock(&self.requests).clone()
    }

    /// Number of times `close` was called.
    #[must_use]
    pub fn close_count(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }

    fn record(&self, request: &HttpRequest) {
        lock(&self.requests).push(request.clone());
    }

    fn next_outcome(&self, target: &str) -> Result<HttpResponse> {
        lock(&self.script)
            .pop_front()
            .or_else(|| self.otherwise.clone())
            .unwrap_or_else(|| {
                Err(ApiError::Connection {
                    target: target.to_string(),
                    message: "script exhausted".to_string(),
                })
            })
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        // Recorded up front so abandoned attempts still count.
        self.record(&request);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.next_outcome(&request.url)
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

impl BlockingTransport for ScriptedTransport {
    fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.record(&request);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.next_outcome(&request.url)
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}
