// SPDX-License-Identifier: MIT OR Apache-2.0

//! Example: Resilient Client with Retry and Circuit Breaker
//!
//! Runs offline against a scripted transport and shows:
//! - Retries with backoff on transient failures
//! - The circuit breaker opening on a dependency that stays down
//! - Call statistics in Prometheus text format
//! - The standalone retry executor

use resilient_api_rs::client::{ClientConfig, HttpResponse, ResilientClient};
use resilient_api_rs::runtime::{
    BackoffStrategy, CircuitBreakerConfig, ExponentialBackoff, FixedBackoff, LoggingConfig,
    RetryConfig,
};
use resilient_api_rs::testkit::ScriptedTransport;
use resilient_api_rs::ApiError;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    // ==========================================================================
    // 1. Transient failures are retried
    // ==========================================================================
    println!("=== Retry on transient failures ===");

    let transport = Arc::new(
        ScriptedTransport::new()
            .then_status(503)
            .then(Ok(HttpResponse::new(429, "").with_header("retry-after", "1")))
            .then_json(200, serde_json::json!({"events": 3})),
    );
    let config = ClientConfig::builder("https://calendar.example.com/api")
        .backoff(FixedBackoff::from_millis(100))
        .logging(LoggingConfig::verbose())
        .build();
    let client = ResilientClient::with_transport(config, transport.clone())?;

    let response = client.get("/events/today").await?;
    println!("Response: {:?}", response.json());
    println!("Attempts sent: {}", transport.send_count());

    // ==========================================================================
    // 2. Circuit breaker
    // ==========================================================================
    println!("\n=== Circuit Breaker ===");

    let down = Arc::new(ScriptedTransport::new().otherwise(Ok(HttpResponse::new(500, ""))));
    let config = ClientConfig::builder("https://search.example.com")
        .max_attempts(1)
        .circuit_breaker(
            CircuitBreakerConfig::new()
                .with_failure_threshold(3)
                .with_reset_timeout(Duration::from_secs(30)),
        )
        .build();
    let search = ResilientClient::with_transport(config, down.clone())?;

    for i in 1..=5 {
        match search.get("/query").await {
            Ok(_) => println!("  Call {i}: ok"),
            Err(ApiError::CircuitOpen { remaining }) => {
                println!("  Call {i}: rejected, retry in {remaining:?}")
            }
            Err(e) => println!("  Call {i}: {e}"),
        }
    }
    println!("Requests that reached the service: {}", down.send_count());

    // ==========================================================================
    // 3. Statistics
    // ==========================================================================
    println!("\n=== Statistics ===");
    println!("{}", search.stats().to_prometheus_text("search"));

    // ==========================================================================
    // 4. Retry executor on its own
    // ==========================================================================
    println!("=== Retry Executor ===");

    let backoff = ExponentialBackoff::new(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_jitter(false);
    for attempt in 1..=5 {
        println!("  Delay after attempt {attempt}: {:?}", backoff.delay(attempt));
    }

    let retry = RetryConfig::builder()
        .max_attempts(4)
        .backoff(backoff)
        .on_retry(|err, attempt| println!("  attempt {attempt} failed: {err}"))
        .build();
    let calls = Arc::new(AtomicU32::new(0));
    let value = retry
        .execute(|| {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ApiError::Connection {
                        target: "db".to_string(),
                        message: "connection reset".to_string(),
                    })
                } else {
                    Ok("connected")
                }
            }
        })
        .await?;
    println!("Result: {value}");

    client.close();
    search.close();
    Ok(())
}
