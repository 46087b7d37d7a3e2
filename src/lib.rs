// SPDX-License-Identifier: MIT OR Apache-2.0

pub mod client;
pub mod config;
pub mod error;
pub mod llm;
pub mod runtime;
pub mod testkit;

pub use client::{ApiRequest, ApiResponse, BlockingClient, ClientConfig, ResilientClient};
pub use error::{ApiError, ErrorKind};
pub use llm::{ChatCompletion, ChatMessage, LlmClient};
pub use runtime::{CircuitBreaker, CircuitBreakerConfig, RetryConfig};
