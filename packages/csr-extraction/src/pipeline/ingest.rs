//! Ingest stage: verified rows into the warehouse, provenance into the
//! lineage store.
//!
//! One report is one transactional unit (the warehouse backend holds the
//! per-report lock). A failed ingest still appends a lineage record with
//! a `failed` outcome before the error surfaces.

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::traits::object_store::ReportKey;
use crate::traits::warehouse::{
    IngestStats, LineageInputs, LineageOutputs, LineageRecord, LineageStore, NewIndicatorRow,
    ReportRow, Warehouse,
};

/// Per-run lineage under construction: inputs fixed at run start,
/// outputs accumulated by the driver as stages complete.
#[derive(Debug, Clone)]
pub struct RunLineage {
    pub run_id: String,
    pub inputs: LineageInputs,
    pub outputs: LineageOutputs,
}

impl RunLineage {
    pub fn new(inputs: LineageInputs) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            inputs,
            outputs: LineageOutputs::default(),
        }
    }

    /// `partial` when some indicators failed at the LLM, `succeeded`
    /// otherwise. Rejections are a normal outcome, not a failure.
    pub fn outcome(&self) -> &'static str {
        if self.outputs.failed_indicators.is_empty() {
            "succeeded"
        } else {
            "partial"
        }
    }

    pub fn into_record(self, outcome: &str, error_class: Option<String>) -> LineageRecord {
        LineageRecord {
            run_id: self.run_id,
            timestamp: Utc::now(),
            outcome: outcome.to_string(),
            error_class,
            inputs: self.inputs,
            outputs: self.outputs,
        }
    }
}

/// Write one report's verified rows and its lineage record.
///
/// Rows are sorted by `(indicator_name, year, source_page)` before the
/// write so re-runs touch the warehouse in a stable order.
pub async fn ingest_verified(
    warehouse: &dyn Warehouse,
    lineage: &dyn LineageStore,
    key: &ReportKey,
    source_url: Option<String>,
    mut rows: Vec<NewIndicatorRow>,
    run: RunLineage,
) -> Result<IngestStats> {
    rows.sort_by(|a, b| {
        (a.indicator_name.as_str(), a.year, a.source_page)
            .cmp(&(b.indicator_name.as_str(), b.year, b.source_page))
    });

    let company_id = key.company_id();
    let result = async {
        warehouse
            .upsert_report(&ReportRow {
                company_id: company_id.clone(),
                report_year: key.report_year,
                url: source_url,
                ingested_at: Utc::now(),
            })
            .await?;
        warehouse
            .ingest_report(&company_id, key.report_year, &rows)
            .await
    }
    .await;

    match result {
        Ok(stats) => {
            let outcome = run.outcome();
            info!(
                report_id = %run.inputs.report_id,
                inserted = stats.inserted,
                updated = stats.updated,
                outcome,
                "report ingested"
            );
            lineage.append(&run.into_record(outcome, None)).await?;
            Ok(stats)
        }
        Err(err) => {
            warn!(report_id = %run.inputs.report_id, error = %err, "ingest failed, rolling back");
            let class = err.class().to_string();
            // best effort: the original error wins over a lineage failure
            if let Err(lineage_err) = lineage.append(&run.into_record("failed", Some(class))).await
            {
                warn!(error = %lineage_err, "could not record failed run in lineage");
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::memory::{MemoryLineage, MemoryWarehouse};

    fn run() -> RunLineage {
        RunLineage::new(LineageInputs {
            report_id: "acme:2024".to_string(),
            catalogue_hash: "cat".to_string(),
            model_id: "mock-model".to_string(),
            prompt_hash: "prompt".to_string(),
        })
    }

    fn row(indicator: &str, year: i32) -> NewIndicatorRow {
        NewIndicatorRow {
            indicator_name: indicator.to_string(),
            year,
            value_numeric: 1.0,
            unit_canonical: "tCO2e".to_string(),
            source_page: 1,
            source_quote: "q".to_string(),
            confidence: 0.9,
        }
    }

    #[tokio::test]
    async fn ingest_writes_rows_and_lineage() {
        let warehouse = MemoryWarehouse::new();
        let lineage = MemoryLineage::new();
        let key = ReportKey::parse("2024/Acme.pdf").unwrap();

        let stats = ingest_verified(
            &warehouse,
            &lineage,
            &key,
            Some("https://acme.example/csr.pdf".to_string()),
            vec![row("Scope 1 Emissions", 2023)],
            run(),
        )
        .await
        .unwrap();

        assert_eq!(stats.total(), 1);
        assert_eq!(warehouse.report_count(), 1);
        let records = lineage.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, "succeeded");
        assert_eq!(records[0].inputs.report_id, "acme:2024");
    }

    #[tokio::test]
    async fn llm_failures_mark_the_run_partial() {
        let warehouse = MemoryWarehouse::new();
        let lineage = MemoryLineage::new();
        let key = ReportKey::parse("2024/Acme.pdf").unwrap();

        let mut run = run();
        run.outputs
            .failed_indicators
            .insert("Water Withdrawal".to_string(), "timeout".to_string());

        ingest_verified(&warehouse, &lineage, &key, None, vec![], run)
            .await
            .unwrap();
        assert_eq!(lineage.records()[0].outcome, "partial");
    }

    #[tokio::test]
    async fn rerun_bumps_revision_only() {
        let warehouse = MemoryWarehouse::new();
        let lineage = MemoryLineage::new();
        let key = ReportKey::parse("2024/Acme.pdf").unwrap();
        let rows = vec![row("Scope 1 Emissions", 2023), row("Scope 1 Emissions", 2022)];

        ingest_verified(&warehouse, &lineage, &key, None, rows.clone(), run())
            .await
            .unwrap();
        let stats = ingest_verified(&warehouse, &lineage, &key, None, rows, run())
            .await
            .unwrap();

        assert_eq!(stats, IngestStats { inserted: 0, updated: 2 });
        let stored = warehouse.fetch_indicators("acme", 2024).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|r| r.revision == 2));
        assert_eq!(lineage.record_count(), 2);
    }
}
