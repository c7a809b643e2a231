//! CSR Indicator Extraction Pipeline
//!
//! Turns corporate sustainability (CSR) PDF reports into verified,
//! lineage-tracked ESG indicator rows in a relational warehouse.
//!
//! Stages: PDF text extraction, passage location against an indicator
//! catalogue, LLM-driven structured extraction, rule-based verification
//! with one constrained re-prompt, and idempotent ingestion keyed by
//! `(company, report_year, indicator, year)`.
//!
//! # Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use csr_extraction::{
//!     run_report, Catalogue, HttpObjectStore, OpenAiChatModel, PipelineConfig, RunContext,
//! };
//! use csr_extraction::stores::{MemoryLineage, MemoryWarehouse};
//!
//! let catalogue = Arc::new(Catalogue::load("config/catalogue.toml")?);
//! let ctx = RunContext::new(
//!     catalogue,
//!     Arc::new(OpenAiChatModel::from_env()?),
//!     Arc::new(HttpObjectStore::from_env()?),
//!     Arc::new(MemoryWarehouse::new()),
//!     Arc::new(MemoryLineage::new()),
//!     PipelineConfig::default(),
//! );
//! let summary = run_report(&ctx, "2024/Acme.pdf", None).await?;
//! ```
//!
//! # Modules
//!
//! - [`catalogue`] - Indicator definitions and match rules
//! - [`text`] - PDF text extraction and whitespace normalisation
//! - [`locate`] - Candidate passage scoring
//! - [`pipeline`] - Extraction, verification, ingest and the driver
//! - [`traits`] - Collaborator abstractions (LLM, object store, warehouse)
//! - [`stores`] - Store implementations (memory, HTTP, PostgreSQL)
//! - [`llm`] - LLM provider clients
//! - [`testing`] - Mocks and fixtures for applications using the library

pub mod catalogue;
pub mod context;
pub mod error;
pub mod llm;
pub mod locate;
pub mod numeric;
pub mod pipeline;
pub mod stores;
pub mod testing;
pub mod text;
pub mod traits;

// Re-export core types at crate root
pub use catalogue::{Catalogue, FiscalYearMapping, GroupDef, IndicatorDef};
pub use context::{PipelineConfig, RunContext};
pub use error::{ConfigError, LlmError, PipelineError, Result};
pub use llm::OpenAiChatModel;
pub use locate::{locate, CandidatePassage, LocateConfig};
pub use numeric::{format_number, num_from_str, safe_eval};
pub use pipeline::{
    extract_records, ingest_verified, run_batch, run_report, verify_records, ExtractOutcome,
    ExtractorConfig, RawRecord, RawValue, RejectReason, Rejection, ResumeStage, RunLineage,
    RunSummary, TokenBudget, VerifyOutcome,
};
pub use stores::{HttpObjectStore, MemoryLineage, MemoryObjectStore, MemoryWarehouse};
pub use text::{extract, ExtractedDoc, Page};
pub use traits::{
    llm::{ChatModel, ChatRequest, ChatResponse},
    object_store::{ObjectStore, ReportKey},
    warehouse::{
        IndicatorRow, IngestStats, LineageInputs, LineageOutputs, LineageRecord, LineageStore,
        NewIndicatorRow, ReportRow, Warehouse,
    },
};

#[cfg(feature = "postgres")]
pub use stores::{PostgresLineage, PostgresWarehouse};

// Re-export testing utilities
pub use testing::MockChatModel;
