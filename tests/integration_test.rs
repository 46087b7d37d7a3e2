// SPDX-License-Identifier: MIT OR Apache-2.0

use resilient_api_rs::client::{ApiRequest, BlockingClient, ClientConfig, ResilientClient};
use resilient_api_rs::llm::{ChatMessage, FallbackReason, LlmClient};
use resilient_api_rs::runtime::{CircuitBreakerConfig, CircuitState, FixedBackoff, NoBackoff};
use resilient_api_rs::ApiError;
use serde_json::json;
use std::time::{Duration, Instant};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

#[tokio::test]
async fn test_breaker_opens_after_repeated_server_errors() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/reports"))
        .respond_with(ResponseTemplate::new(500).set_body_string("database unavailable"))
        .expect(3)
        .mount(&server)
        .await;

    let config = ClientConfig::builder(server.uri())
        .max_attempts(1)
        .backoff(NoBackoff)
        .circuit_breaker(
            CircuitBreakerConfig::new()
                .with_failure_threshold(3)
                .with_reset_timeout(Duration::from_secs(60)),
        )
        .build();
    let client = ResilientClient::new(config)?;

    for _ in 0..3 {
        let err = client.get("/reports").await.unwrap_err();
        assert_eq!(err.status(), Some(500));
    }
    let err = client.get("/reports").await.unwrap_err();

    assert!(matches!(err, ApiError::CircuitOpen { .. }));
    assert_eq!(server.received_requests().await.unwrap_or_default().len(), 3);

    let health = client.stats();
    assert_eq!(health.stats.total, 4);
    assert_eq!(health.stats.failed, 4);
    assert_eq!(health.breaker.map(|b| b.state), Some(CircuitState::Open));

    client.close();
    Ok(())
}

#[tokio::test]
async fn test_rate_limit_is_retried_after_backoff() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/events"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "5"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/events"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"items": []})))
        .mount(&server)
        .await;

    let backoff = Duration::from_millis(50);
    let config = ClientConfig::builder(server.uri())
        .backoff(FixedBackoff::new(backoff))
        .build();
    let client = ResilientClient::new(config)?;

    let started = Instant::now();
    let response = client.get("/events").await?;

    assert!(started.elapsed() >= backoff);
    assert_eq!(response.json(), Some(&json!({"items": []})));
    let stats = client.stats().stats;
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.retried, 1);
    Ok(())
}

#[tokio::test]
async fn test_persistent_rate_limit_keeps_retry_after() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "5"))
        .expect(2)
        .mount(&server)
        .await;

    let config = ClientConfig::builder(server.uri())
        .max_attempts(2)
        .backoff(NoBackoff)
        .build();
    let client = ResilientClient::new(config)?;

    let err = client.get("/events").await.unwrap_err();

    assert!(matches!(err, ApiError::RetriesExhausted { attempts: 2, .. }));
    assert_eq!(err.retry_after(), Some(Duration::from_secs(5)));
    Ok(())
}

#[tokio::test]
async fn test_slow_response_times_out() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let config = ClientConfig::builder(server.uri())
        .timeout(Duration::from_millis(100))
        .max_attempts(1)
        .build();
    let client = ResilientClient::new(config)?;

    let err = client.get("/slow").await.unwrap_err();

    assert!(matches!(err.root_cause(), ApiError::Timeout { .. }));
    Ok(())
}

#[tokio::test]
async fn test_headers_and_body_reach_server() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/events"))
        .and(header("x-api-key", "secret"))
        .and(header("content-type", "application/json"))
        .and(body_partial_json(json!({"title": "standup"})))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 42})))
        .expect(1)
        .mount(&server)
        .await;

    let config = ClientConfig::builder(server.uri())
        .header("X-Api-Key", "secret")
        .build();
    let client = ResilientClient::new(config)?;

    let response = client
        .request(ApiRequest::post("/events").with_json(json!({"title": "standup"})))
        .await?;

    assert_eq!(response.status, 201);
    assert_eq!(response.json(), Some(&json!({"id": 42})));
    Ok(())
}

#[tokio::test]
async fn test_llm_rate_limit_returns_fallback() -> anyhow::Result<()> {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "30"))
        .mount(&server)
        .await;

    let config = LlmClient::config_builder("test-key", server.uri())
        .backoff(NoBackoff)
        .build();
    let llm = LlmClient::with_config(config)?;

    let reply = llm.complete(&[ChatMessage::user("What's on today?")]).await?;

    assert_eq!(reply.error, Some(FallbackReason::RateLimit));
    assert_eq!(reply.retry_after, Some(Duration::from_secs(30)));
    assert!(!reply.content.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_llm_completion_round_trip() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({"model": "sonar-pro", "max_tokens": 500})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "model": "sonar-pro",
            "choices": [{"message": {"role": "assistant", "content": "Two meetings."}}],
            "usage": {"prompt_tokens": 9, "completion_tokens": 3, "total_tokens": 12}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let llm = LlmClient::new("test-key", server.uri())?;

    let reply = llm.complete(&[ChatMessage::user("What's on today?")]).await?;

    assert_eq!(reply.content, "Two meetings.");
    assert_eq!(reply.usage.map(|u| u.total_tokens), Some(12));
    assert!(!reply.is_fallback());
    Ok(())
}

#[tokio::test]
async fn test_blocking_client_retries_server_error() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let config = ClientConfig::builder(server.uri())
        .backoff(FixedBackoff::from_millis(10))
        .build();

    // reqwest's blocking client must be created and dropped off the runtime.
    let (text, retried) = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        let client = BlockingClient::new(config)?;
        let response = client.get("/status")?;
        let retried = client.stats().stats.retried;
        client.close();
        Ok((response.text().map(str::to_string), retried))
    })
    .await??;

    assert_eq!(text.as_deref(), Some("ok"));
    assert_eq!(retried, 1);
    Ok(())
}

#[tokio::test]
async fn test_blocking_client_times_out() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let config = ClientConfig::builder(server.uri())
        .timeout(Duration::from_millis(100))
        .max_attempts(1)
        .build();

    let err = tokio::task::spawn_blocking(move || -> anyhow::Result<_> {
        let client = BlockingClient::new(config)?;
        let result = client.get("/slow");
        client.close();
        Ok(result.err())
    })
    .await??;

    let err = err.ok_or_else(|| anyhow::anyhow!("slow response should time out"))?;
    assert!(
        matches!(err.root_cause(), ApiError::Timeout { .. }),
        "unexpected error: {err:?}"
    );
    Ok(())
}

#[tokio::test]
async fn test_unreachable_host_is_connection_error() -> anyhow::Result<()> {
    let config = ClientConfig::builder("http://127.0.0.1:1")
        .max_attempts(2)
        .backoff(NoBackoff)
        .without_circuit_breaker()
        .build();
    let client = ResilientClient::new(config)?;

    let err = client.get("/").await.unwrap_err();

    assert!(matches!(err, ApiError::RetriesExhausted { attempts: 2, .. }));
    assert!(matches!(err.root_cause(), ApiError::Connection { .. }));
    Ok(())
}
