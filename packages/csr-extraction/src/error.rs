//! Typed errors for the extraction pipeline.
//!
//! Uses `thiserror` for library errors (not `anyhow`) to provide
//! strongly-typed, composable error handling.

use thiserror::Error;

/// Errors that can occur while running the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Catalogue or environment configuration is invalid; aborts the run
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// PDF text extraction failed for one report
    #[error("text extraction failed{}: {message}", page.map(|p| format!(" on page {p}")).unwrap_or_default())]
    Extraction { page: Option<u32>, message: String },

    /// LLM provider failed after all retries
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    /// Object store operation failed
    #[error("object store error: {0}")]
    ObjectStore(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Warehouse or lineage store operation failed
    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Report key does not follow `<year>/<company>.pdf`
    #[error("invalid report key: {key}")]
    InvalidReportKey { key: String },

    /// Checkpoint artifact could not be read or written
    #[error("checkpoint error: {0}")]
    Checkpoint(#[source] std::io::Error),

    /// Token budget too small to cover a single request's estimate
    #[error("token budget {budget} cannot cover request estimate {estimate}")]
    BudgetExhausted { estimate: u32, budget: u32 },

    /// Operation was cancelled
    #[error("operation cancelled")]
    Cancelled,

    /// JSON parsing error
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),
}

impl PipelineError {
    /// Short class name recorded in lineage and run summaries.
    pub fn class(&self) -> &'static str {
        match self {
            PipelineError::Config(_) => "config",
            PipelineError::Extraction { .. } => "extraction",
            PipelineError::Llm(e) => e.class(),
            PipelineError::ObjectStore(_) => "object_store",
            PipelineError::Storage(_) => "storage",
            PipelineError::InvalidReportKey { .. } => "invalid_report_key",
            PipelineError::BudgetExhausted { .. } => "config",
            PipelineError::Checkpoint(_) => "checkpoint",
            PipelineError::Cancelled => "cancelled",
            PipelineError::JsonParse(_) => "malformed_output",
        }
    }
}

/// LLM failure taxonomy surfaced to the driver.
#[derive(Debug, Error)]
pub enum LlmError {
    /// Provider returned 429 or a rate-limit error body
    #[error("rate limited")]
    RateLimited,

    /// Request exceeded the configured deadline
    #[error("request timed out")]
    Timeout,

    /// Response was not the expected JSON shape
    #[error("malformed output: {0}")]
    MalformedOutput(String),

    /// Provider refused the prompt (content policy)
    #[error("blocked by provider policy")]
    PolicyBlocked,

    /// Provider returned a 5xx or an error body
    #[error("upstream error ({status}): {message}")]
    Upstream { status: u16, message: String },

    /// Transport-level failure (connection, TLS, DNS)
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl LlmError {
    /// Transient failures are retried with backoff; the rest fail fast.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LlmError::RateLimited
                | LlmError::Timeout
                | LlmError::MalformedOutput(_)
                | LlmError::Upstream { .. }
                | LlmError::Transport(_)
        )
    }

    /// Short class name recorded in lineage and run summaries.
    pub fn class(&self) -> &'static str {
        match self {
            LlmError::RateLimited => "rate_limited",
            LlmError::Timeout => "timeout",
            LlmError::MalformedOutput(_) => "malformed_output",
            LlmError::PolicyBlocked => "policy_blocked",
            LlmError::Upstream { .. } => "upstream_error",
            LlmError::Transport(_) => "upstream_error",
        }
    }
}

/// Catalogue validation error listing every malformed entry.
///
/// Validation never short-circuits: all issues are collected so a bad
/// catalogue can be fixed in one pass.
#[derive(Debug, Error)]
#[error("invalid catalogue ({} issue{}): {}", issues.len(), if issues.len() == 1 { "" } else { "s" }, issues.join("; "))]
pub struct ConfigError {
    pub issues: Vec<String>,
}

impl ConfigError {
    pub fn new(issues: Vec<String>) -> Self {
        Self { issues }
    }

    pub fn single(issue: impl Into<String>) -> Self {
        Self {
            issues: vec![issue.into()],
        }
    }
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
