//! The pipeline stages, wired together by the driver.
//!
//! Each stage is a pure transformation over typed records; only the
//! driver knows the order and owns the checkpointing between them.

pub mod driver;
pub mod extract;
pub mod ingest;
pub mod prompts;
pub mod verify;

pub use driver::{run_batch, run_report, ResumeStage, RunSummary};
pub use extract::{extract_records, ExtractOutcome, ExtractorConfig, RawRecord, RawValue, TokenBudget};
pub use ingest::{ingest_verified, RunLineage};
pub use prompts::{extract_prompt_hash, format_extract_prompt, format_unit_prompt};
pub use verify::{verify_records, RejectReason, Rejection, VerifyOutcome};
