//! ChatModel trait for LLM operations.
//!
//! Implementations wrap specific providers and handle transport, rate
//! limiting and status mapping. The pipeline only sees `ChatRequest` in
//! and `ChatResponse` out.

use async_trait::async_trait;

use crate::error::LlmError;

/// A single chat-style completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Ask the provider for its structured-output (JSON object) mode.
    pub json_response: bool,
}

impl ChatRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            temperature: 0.0,
            max_tokens: 1024,
            json_response: true,
        }
    }

    /// Rough token estimate for budgeting (4 chars per token).
    pub fn estimated_tokens(&self) -> u32 {
        ((self.system.len() + self.user.len()) / 4) as u32 + self.max_tokens
    }
}

/// Completion plus the provider-reported token usage.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub content: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl ChatResponse {
    pub fn total_tokens(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Chat-style LLM endpoint.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Issue one completion. Implementations map provider failures onto
    /// the `LlmError` taxonomy; retries live in the extractor, not here.
    async fn chat(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError>;

    /// Stable model identifier recorded in lineage.
    fn model_id(&self) -> &str;
}
