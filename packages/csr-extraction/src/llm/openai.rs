//! OpenAI-compatible chat client.
//!
//! Works against the OpenAI API and any compatible gateway (set
//! `LLM_BASE_URL`). Holds the shared rate limiter; retries live in the
//! extractor, not here.

use std::num::NonZeroU32;
use std::time::Duration;

use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use nonzero_ext::nonzero;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConfigError, LlmError, PipelineError};
use crate::traits::llm::{ChatModel, ChatRequest, ChatResponse};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-mini";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_REQUESTS_PER_SECOND: NonZeroU32 = nonzero!(4u32);

pub struct OpenAiChatModel {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    limiter: DefaultDirectRateLimiter,
}

impl OpenAiChatModel {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Result<Self, PipelineError> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| PipelineError::Llm(LlmError::Transport(Box::new(e))))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: model.into(),
            limiter: RateLimiter::direct(Quota::per_second(DEFAULT_REQUESTS_PER_SECOND)),
        })
    }

    /// Build from `LLM_API_KEY`, `LLM_BASE_URL` and `LLM_MODEL`.
    pub fn from_env() -> Result<Self, PipelineError> {
        let api_key = std::env::var("LLM_API_KEY")
            .map_err(|_| ConfigError::single("LLM_API_KEY is not set"))?;
        let model = std::env::var("LLM_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let mut this = Self::new(api_key, model)?;
        if let Ok(base_url) = std::env::var("LLM_BASE_URL") {
            this = this.with_base_url(base_url);
        }
        Ok(this)
    }

    /// Point at a compatible gateway instead of api.openai.com.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_requests_per_second(mut self, rps: NonZeroU32) -> Self {
        self.limiter = RateLimiter::direct(Quota::per_second(rps));
        self
    }
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct WireResponse {
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: WireUsage,
}

#[derive(Deserialize)]
struct WireChoice {
    message: WireResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

/// Map a non-success HTTP response onto the failure taxonomy.
fn map_status(status: StatusCode, body: &str) -> LlmError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return LlmError::RateLimited;
    }
    if status == StatusCode::BAD_REQUEST && body.contains("content_filter") {
        return LlmError::PolicyBlocked;
    }
    LlmError::Upstream {
        status: status.as_u16(),
        message: body.chars().take(500).collect(),
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        self.limiter.until_ready().await;

        let body = WireRequest {
            model: &self.model,
            messages: vec![
                WireMessage {
                    role: "system",
                    content: &request.system,
                },
                WireMessage {
                    role: "user",
                    content: &request.user,
                },
            ],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: request
                .json_response
                .then_some(ResponseFormat { kind: "json_object" }),
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::Transport(Box::new(e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_status(status, &body));
        }

        let wire: WireResponse = response
            .json()
            .await
            .map_err(|e| LlmError::MalformedOutput(e.to_string()))?;
        let choice = wire
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| LlmError::MalformedOutput("no choices in response".to_string()))?;

        if choice.finish_reason.as_deref() == Some("content_filter") {
            return Err(LlmError::PolicyBlocked);
        }
        let content = choice
            .message
            .content
            .ok_or_else(|| LlmError::MalformedOutput("choice has no content".to_string()))?;

        debug!(
            prompt_tokens = wire.usage.prompt_tokens,
            completion_tokens = wire.usage.completion_tokens,
            "chat completion"
        );
        Ok(ChatResponse {
            content,
            prompt_tokens: wire.usage.prompt_tokens,
            completion_tokens: wire.usage.completion_tokens,
        })
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}
