//! Relational warehouse and lineage store collaborators.
//!
//! The warehouse holds one row per `(company_id, report_year,
//! indicator_name, year)`; re-running a report overwrites by that key and
//! bumps `revision`. The lineage store is append-only provenance.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::Result;

/// A report registered by the upstream downloader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRow {
    pub company_id: String,
    pub report_year: i32,
    pub url: Option<String>,
    pub ingested_at: DateTime<Utc>,
}

/// A verified indicator value as the pipeline hands it to the warehouse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewIndicatorRow {
    pub indicator_name: String,
    pub year: i32,
    pub value_numeric: f64,
    pub unit_canonical: String,
    pub source_page: u32,
    pub source_quote: String,
    pub confidence: f64,
}

/// A stored indicator row, including warehouse-managed columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorRow {
    pub company_id: String,
    pub report_year: i32,
    pub indicator_name: String,
    pub year: i32,
    pub value_numeric: f64,
    pub unit_canonical: String,
    pub source_page: u32,
    pub source_quote: String,
    pub confidence: f64,
    pub revision: i32,
    pub updated_at: DateTime<Utc>,
}

/// Counters from one report's transactional ingest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestStats {
    pub inserted: usize,
    pub updated: usize,
}

impl IngestStats {
    pub fn total(&self) -> usize {
        self.inserted + self.updated
    }
}

/// Relational warehouse access.
///
/// `ingest_report` is all-or-nothing for one report and serialises with
/// concurrent ingests of the same `(company_id, report_year)`; different
/// reports may ingest in parallel.
#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Register (or refresh) the report dimension row.
    async fn upsert_report(&self, report: &ReportRow) -> Result<()>;

    /// Upsert all rows for one report in a single transaction.
    async fn ingest_report(
        &self,
        company_id: &str,
        report_year: i32,
        rows: &[NewIndicatorRow],
    ) -> Result<IngestStats>;

    /// Fetch stored rows for one report (for verification and tooling).
    async fn fetch_indicators(
        &self,
        company_id: &str,
        report_year: i32,
    ) -> Result<Vec<IndicatorRow>>;
}

/// Inputs half of a lineage record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageInputs {
    pub report_id: String,
    pub catalogue_hash: String,
    pub model_id: String,
    pub prompt_hash: String,
}

/// Outputs half of a lineage record.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LineageOutputs {
    pub verified_count: usize,
    pub rejected_count: usize,
    /// Rejection reason -> count.
    pub rejection_reasons: BTreeMap<String, usize>,
    /// Indicator name -> failure class for per-indicator LLM failures.
    pub failed_indicators: BTreeMap<String, String>,
    /// Aggregate LLM tokens spent.
    pub tokens_spent: u64,
}

/// One append-only provenance record per run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineageRecord {
    pub run_id: String,
    pub timestamp: DateTime<Utc>,
    /// `succeeded`, `partial`, or `failed`.
    pub outcome: String,
    /// Error class when `outcome == "failed"`.
    pub error_class: Option<String>,
    pub inputs: LineageInputs,
    pub outputs: LineageOutputs,
}

/// Append-only lineage store.
#[async_trait]
pub trait LineageStore: Send + Sync {
    async fn append(&self, record: &LineageRecord) -> Result<()>;
}
