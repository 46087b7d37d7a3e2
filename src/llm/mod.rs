// SPDX-License-Identifier: MIT OR Apache-2.0

//! Chat-completion client built on [`ResilientClient`].
//!
//! Transient faults are handled by the retry and breaker layers underneath.
//! When a call still ends in a rate limit or a timeout, the adapter returns
//! a canned, user-safe reply tagged with the failure instead of an error.
//! Every other failure is returned to the caller unchanged.
//!
//! # Example
//!
//! ```no_run
//! use resilient_api_rs::llm::{ChatMessage, ChatOptions, LlmClient};
//!
//! # async fn run() -> resilient_api_rs::error::Result<()> {
//! let llm = LlmClient::new("pplx-key", "https://api.perplexity.ai")?;
//! let reply = llm
//!     .chat_completion(
//!         &[ChatMessage::system("Be brief."), ChatMessage::user("Hello")],
//!         &ChatOptions::default(),
//!     )
//!     .await?;
//! if let Some(reason) = reply.error {
//!     eprintln!("degraded reply ({reason})");
//! }
//! println!("{}", reply.content);
//! # Ok(())
//! # }
//! ```

use crate::client::{ApiRequest, ClientConfig, ClientConfigBuilder, ResilientClient, Transport};
use crate::error::{ApiError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Model used when none is configured.
pub const DEFAULT_MODEL: &str = "sonar-pro";
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_MAX_TOKENS: u32 = 500;
/// Endpoint, relative to the base URL.
pub const CHAT_COMPLETIONS_PATH: &str = "/chat/completions";

const RATE_LIMIT_MESSAGE: &str =
    "The service is receiving too many requests right now. Please try again shortly.";
const TIMEOUT_MESSAGE: &str = "The response took too long. Please try again.";

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Sampling options for one completion.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatOptions {
    pub temperature: f64,
    pub max_tokens: u32,
    /// Provider-specific fields merged into the request body last, so they
    /// override the fields above.
    pub extra: Map<String, Value>,
}

impl Default for ChatOptions {
    fn default() -> Self {
        Self {
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            extra: Map::new(),
        }
    }
}

impl ChatOptions {
    #[must_use]
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Add a provider-specific body field.
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// Why a completion carries fallback content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    RateLimit,
    Timeout,
}

impl FallbackReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FallbackReason::RateLimit => "rate_limit",
            FallbackReason::Timeout => "timeout",
        }
    }
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of [`LlmClient::chat_completion`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChatCompletion {
    /// Model reply, or the fallback text when `error` is set.
    pub content: String,
    pub usage: Option<Usage>,
    pub model: String,
    pub error: Option<FallbackReason>,
    /// Server-advertised wait, for rate-limit fallbacks.
    pub retry_after: Option<Duration>,
    /// Full provider response; absent for fallbacks.
    pub raw: Option<Value>,
}

impl ChatCompletion {
    #[must_use]
    pub fn is_fallback(&self) -> bool {
        self.error.is_some()
    }

    fn fallback(model: &str, reason: FallbackReason, retry_after: Option<Duration>) -> Self {
        let content = match reason {
            FallbackReason::RateLimit => RATE_LIMIT_MESSAGE,
            FallbackReason::Timeout => TIMEOUT_MESSAGE,
        };
        Self {
            content: content.to_string(),
            usage: None,
            model: model.to_string(),
            error: Some(reason),
            retry_after,
            raw: None,
        }
    }
}

#[derive(Deserialize)]
struct CompletionBody {
    #[serde(default)]
    choices: Vec<Choice>,
    model: Option<String>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}

/// Chat-completion client for OpenAI-compatible endpoints.
#[derive(Debug, Clone)]
pub struct LlmClient {
    client: ResilientClient,
    model: String,
}

impl LlmClient {
    /// Client configuration with the provider's auth headers set.
    ///
    /// Start from this to tune retries or the breaker before calling
    /// [`LlmClient::with_config`].
    pub fn config_builder(api_key: &str, base_url: impl Into<String>) -> ClientConfigBuilder {
        ClientConfig::builder(base_url)
            .header("authorization", format!("Bearer {api_key}"))
            .header("content-type", "application/json")
    }

    /// Create a client with default settings and a pooled reqwest transport.
    ///
    /// # Errors
    ///
    /// Returns `ApiError::Config` for an invalid base URL.
    pub fn new(api_key: &str, base_url: impl Into<String>) -> Result<Self> {
        Self::with_config(Self::config_builder(api_key, base_url).build())
    }

    /// Create a client from a prepared configuration.
    ///
    /// # Errors
    ///
    /// Returns `ApiError::Config` for an invalid base URL.
    pub fn with_config(config: ClientConfig) -> Result<Self> {
        Ok(Self::from_client(ResilientClient::new(config)?))
    }

    /// Create a client over a custom transport.
    ///
    /// # Errors
    ///
    /// Returns `ApiError::Config` for an invalid base URL.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        Ok(Self::from_client(ResilientClient::with_transport(
            config, transport,
        )?))
    }

    /// Wrap an existing resilient client.
    #[must_use]
    pub fn from_client(client: ResilientClient) -> Self {
        Self {
            client,
            model: DEFAULT_MODEL.to_string(),
        }
    }

    #[must_use]
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// The underlying resilient client, for statistics and lifecycle.
    #[must_use]
    pub fn client(&self) -> &ResilientClient {
        &self.client
    }

    fn request_body(&self, messages: &[ChatMessage], options: &ChatOptions) -> Value {
        let mut body = Map::new();
        body.insert("model".to_string(), Value::from(self.model.clone()));
        body.insert(
            "messages".to_string(),
            serde_json::to_value(messages).unwrap_or(Value::Array(Vec::new())),
        );
        body.insert("temperature".to_string(), Value::from(options.temperature));
        body.insert("max_tokens".to_string(), Value::from(options.max_tokens));
        for (key, value) in &options.extra {
            body.insert(key.clone(), value.clone());
        }
        Value::Object(body)
    }

    /// Request a completion for `messages`.
    ///
    /// Rate-limit and timeout failures, including those that exhausted
    /// retries, yield a fallback [`ChatCompletion`] with `error` set.
    ///
    /// # Errors
    ///
    /// Returns `ApiError::InvalidResponse` if the provider's reply has no
    /// choices, and any other client failure unchanged.
    pub async fn chat_completion(
        &self,
        messages: &[ChatMessage],
        options: &ChatOptions,
    ) -> Result<ChatCompletion> {
        info!(
            messages = messages.len(),
            model = %self.model,
            "LLM request"
        );

        let request =
            ApiRequest::post(CHAT_COMPLETIONS_PATH).with_json(self.request_body(messages, options));
        let response = match self.client.request(request).await {
            Ok(response) => response,
            Err(err) => return self.fallback_for(err),
        };

        let parsed: CompletionBody = response.deserialize()?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| {
                ApiError::InvalidResponse("Completion response has no choices".to_string())
            })?;

        info!(
            total_tokens = parsed.usage.map_or(0, |u| u.total_tokens),
            "LLM response"
        );

        Ok(ChatCompletion {
            content,
            usage: parsed.usage,
            model: parsed.model.unwrap_or_else(|| self.model.clone()),
            error: None,
            retry_after: None,
            raw: Some(response.into_json()),
        })
    }

    /// [`LlmClient::chat_completion`] with default options.
    ///
    /// # Errors
    ///
    /// See [`LlmClient::chat_completion`].
    pub async fn complete(&self, messages: &[ChatMessage]) -> Result<ChatCompletion> {
        self.chat_completion(messages, &ChatOptions::default())
            .await
    }

    fn fallback_for(&self, err: ApiError) -> Result<ChatCompletion> {
        match err.root_cause() {
            ApiError::RateLimited { retry_after } => {
                error!(error = %err, "LLM rate limited, returning fallback reply");
                Ok(ChatCompletion::fallback(
                    &self.model,
                    FallbackReason::RateLimit,
                    Some(*retry_after),
                ))
            }
            ApiError::Timeout { .. } => {
                error!(error = %err, "LLM timed out, returning fallback reply");
                Ok(ChatCompletion::fallback(
                    &self.model,
                    FallbackReason::Timeout,
                    None,
                ))
            }
            _ => {
                error!(error = %err, "LLM request failed");
                Err(err)
            }
        }
    }

    /// Release pooled connections.
    pub fn close(&self) {
        self.client.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::HttpResponse;
    use crate::runtime::NoBackoff;
    use crate::testkit::ScriptedTransport;
    use serde_json::json;

    fn llm(transport: &Arc<ScriptedTransport>) -> LlmClient {
        let config = LlmClient::config_builder("test-key", "https://llm.example.com")
            .backoff(NoBackoff)
            .timeout(Duration::from_secs(5))
            .build();
        LlmClient::with_transport(config, transport.clone()).unwrap()
    }

    fn completion_body() -> Value {
        json!({
            "model": "sonar-pro-2",
            "choices": [{"message": {"role": "assistant", "content": "Hi there"}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        })
    }

    #[test]
    fn test_chat_options_default() {
        let options = ChatOptions::default();
        assert_eq!(options.temperature, 0.7);
        assert_eq!(options.max_tokens, 500);
        assert!(options.extra.is_empty());
    }

    #[test]
    fn test_message_serialization() {
        let value = serde_json::to_value(ChatMessage::system("be brief")).unwrap();
        assert_eq!(value, json!({"role": "system", "content": "be brief"}));
    }

    #[tokio::test]
    async fn test_successful_completion() {
        let transport = Arc::new(ScriptedTransport::new().then_json(200, completion_body()));
        let client = llm(&transport);

        let reply = client
            .chat_completion(&[ChatMessage::user("Hello")], &ChatOptions::default())
            .await
            .unwrap();

        assert_eq!(reply.content, "Hi there");
        assert_eq!(reply.model, "sonar-pro-2");
        assert_eq!(reply.usage.unwrap().total_tokens, 15);
        assert!(!reply.is_fallback());
        assert_eq!(reply.raw, Some(completion_body()));
    }

    #[tokio::test]
    async fn test_request_shape() {
        let transport = Arc::new(ScriptedTransport::new().then_json(200, completion_body()));
        let client = llm(&transport).with_model("custom-model");

        client
            .chat_completion(
                &[ChatMessage::system("sys"), ChatMessage::user("q")],
                &ChatOptions::default()
                    .with_temperature(0.2)
                    .with_max_tokens(64)
                    .with_extra("search_recency_filter", json!("week")),
            )
            .await
            .unwrap();

        let sent = &transport.requests()[0];
        assert_eq!(sent.url, "https://llm.example.com/chat/completions");
        assert_eq!(
            sent.headers.get("authorization").map(String::as_str),
            Some("Bearer test-key")
        );
        let body: Value = serde_json::from_slice(sent.body.as_ref().unwrap()).unwrap();
        assert_eq!(body["model"], "custom-model");
        assert_eq!(body["temperature"], 0.2);
        assert_eq!(body["max_tokens"], 64);
        assert_eq!(body["messages"][1], json!({"role": "user", "content": "q"}));
        assert_eq!(body["search_recency_filter"], "week");
    }

    #[tokio::test]
    async fn test_model_defaults_to_configured() {
        let transport = Arc::new(ScriptedTransport::new().then_json(
            200,
            json!({"choices": [{"message": {"content": "ok"}}]}),
        ));

        let reply = llm(&transport).complete(&[ChatMessage::user("q")]).await.unwrap();

        assert_eq!(reply.model, DEFAULT_MODEL);
        assert!(reply.usage.is_none());
    }

    #[tokio::test]
    async fn test_rate_limit_returns_fallback() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .otherwise(Ok(HttpResponse::new(429, "").with_header("retry-after", "7"))),
        );
        let client = llm(&transport);

        let reply = client.complete(&[ChatMessage::user("q")]).await.unwrap();

        assert_eq!(reply.error, Some(FallbackReason::RateLimit));
        assert_eq!(reply.error.unwrap().to_string(), "rate_limit");
        assert_eq!(reply.retry_after, Some(Duration::from_secs(7)));
        assert_eq!(reply.content, RATE_LIMIT_MESSAGE);
        assert!(reply.raw.is_none());
        assert_eq!(transport.send_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_returns_fallback() {
        let transport = Arc::new(
            ScriptedTransport::new()
                .otherwise(Ok(HttpResponse::json(200, &completion_body())))
                .with_delay(Duration::from_secs(60)),
        );
        let client = llm(&transport);

        let reply = client.complete(&[ChatMessage::user("q")]).await.unwrap();

        assert_eq!(reply.error, Some(FallbackReason::Timeout));
        assert_eq!(reply.content, TIMEOUT_MESSAGE);
        assert!(reply.retry_after.is_none());
    }

    #[tokio::test]
    async fn test_other_failures_propagate() {
        let transport = Arc::new(ScriptedTransport::new().then_status(401));
        let client = llm(&transport);

        let err = client.complete(&[ChatMessage::user("q")]).await.unwrap_err();

        assert!(matches!(err, ApiError::Client { status: 401, .. }));
    }

    #[tokio::test]
    async fn test_missing_choices_is_invalid_response() {
        let transport = Arc::new(ScriptedTransport::new().then_json(200, json!({"choices": []})));
        let client = llm(&transport);

        let err = client.complete(&[ChatMessage::user("q")]).await.unwrap_err();

        assert!(matches!(err, ApiError::InvalidResponse(_)));
    }
}
