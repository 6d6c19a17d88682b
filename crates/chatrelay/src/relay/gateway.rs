//! Completion provider gateway
//!
//! Wraps an OpenAI-compatible chat completion endpoint behind the
//! [`CompletionGateway`] trait. Failures come back as [`GatewayError`]
//! values; the orchestrator decides whether to retry.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::prompt::{Message, Prompt};
use crate::config::ProviderConfig;

/// Raw byte chunks of a streamed completion
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, GatewayError>> + Send>>;

/// Errors from the completion provider
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// Connection, TLS or timeout failure
    #[error("Network error: {0}")]
    Network(String),

    /// Provider answered with a non-success status
    #[error("Provider returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Response did not have the expected shape
    #[error("Decode error: {0}")]
    Decode(String),

    /// Request could not be built
    #[error("Request error: {0}")]
    Request(String),
}

impl GatewayError {
    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            GatewayError::Network(_) => "network",
            GatewayError::Status { .. } => "status",
            GatewayError::Decode(_) => "decode",
            GatewayError::Request(_) => "request",
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            GatewayError::Request(err.to_string())
        } else if err.is_decode() {
            GatewayError::Decode(err.to_string())
        } else {
            GatewayError::Network(err.to_string())
        }
    }
}

/// A chat completion provider
#[async_trait]
pub trait CompletionGateway: Send + Sync {
    /// Request a single complete reply
    async fn complete_once(&self, prompt: &Prompt) -> Result<String, GatewayError>;

    /// Request a streamed reply; the stream yields raw SSE bytes
    async fn complete_streaming(&self, prompt: &Prompt) -> Result<ChunkStream, GatewayError>;
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// Gateway for OpenAI-compatible HTTP APIs
#[derive(Debug, Clone)]
pub struct OpenAiGateway {
    client: Client,
    endpoint: String,
    model: String,
    temperature: f32,
    api_key: Option<String>,
}

impl OpenAiGateway {
    /// Create a gateway from provider settings
    ///
    /// A missing API key is allowed so that keyless local servers work;
    /// requests are then sent without an `Authorization` header.
    pub fn new(config: &ProviderConfig) -> Result<Self, GatewayError> {
        let mut builder = Client::builder();
        if let Some(secs) = config.timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let client = builder
            .build()
            .map_err(|e| GatewayError::Request(e.to_string()))?;

        if config.api_key.is_none() {
            warn!(
                "No API key found in {}; calling provider without authorization",
                config.api_key_env
            );
        }

        let endpoint = format!("{}/chat/completions", config.base_url.trim_end_matches('/'));
        info!(
            "OpenAiGateway initialized with model: {}, endpoint: {}",
            config.model, endpoint
        );

        Ok(Self {
            client,
            endpoint,
            model: config.model.clone(),
            temperature: config.temperature,
            api_key: config.api_key.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn post(&self, prompt: &Prompt, stream: bool) -> Result<reqwest::Response, GatewayError> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: prompt.messages(),
            temperature: self.temperature,
            stream,
        };

        debug!(
            endpoint = %self.endpoint,
            messages = prompt.len(),
            stream,
            "Posting chat completion"
        );

        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(GatewayError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl CompletionGateway for OpenAiGateway {
    async fn complete_once(&self, prompt: &Prompt) -> Result<String, GatewayError> {
        let response = self.post(prompt, false).await?;
        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| GatewayError::Decode("response has no choices[0].message.content".to_string()))
    }

    async fn complete_streaming(&self, prompt: &Prompt) -> Result<ChunkStream, GatewayError> {
        let response = self.post(prompt, true).await?;
        Ok(Box::pin(response.bytes_stream().map_err(GatewayError::from)))
    }
}
