//! Pipeline driver: one report end to end, or a bounded batch.
//!
//! Stage order: fetch PDF, extract text, locate passages, LLM extract,
//! verify, ingest. After the LLM stage the driver checkpoints the raw
//! records (and the page text they were verified against) to a per-run
//! artifact, so a crash past that point can resume from the verifier
//! without re-spending tokens.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{info, info_span, warn, Instrument};

use crate::context::RunContext;
use crate::error::{PipelineError, Result};
use crate::locate::locate;
use crate::pipeline::extract::{extract_records, ExtractOutcome};
use crate::pipeline::ingest::{ingest_verified, RunLineage};
use crate::pipeline::prompts::extract_prompt_hash;
use crate::pipeline::verify::verify_records;
use crate::text::{self, ExtractedDoc, Page};
use crate::traits::object_store::ReportKey;
use crate::traits::warehouse::LineageInputs;

/// Stage to resume from, driven by `--resume-from`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeStage {
    /// Re-hydrate the post-LLM checkpoint and continue with verification.
    Verify,
}

impl FromStr for ResumeStage {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "verify" => Ok(Self::Verify),
            other => Err(format!("unknown stage {other:?} (expected: verify)")),
        }
    }
}

/// Post-LLM artifact written under the checkpoint directory.
#[derive(Debug, Serialize, Deserialize)]
struct Checkpoint {
    report_key: String,
    pages: Vec<Page>,
    extract: ExtractOutcome,
}

/// What one run did, printed by the CLI as a single JSON line.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub report_id: String,
    pub run_id: String,
    pub verified_count: usize,
    pub rejected_count: usize,
    /// Indicator name -> failure class.
    pub failed_indicators: std::collections::BTreeMap<String, String>,
    pub inserted: usize,
    pub updated: usize,
    /// Serialized as `cost`, the key downstream consumers read.
    #[serde(rename = "cost")]
    pub tokens_spent: u64,
    pub dry_run: bool,
}

/// Run one report through every stage.
pub async fn run_report(
    ctx: &RunContext,
    report_key: &str,
    resume_from: Option<ResumeStage>,
) -> Result<RunSummary> {
    let key = ReportKey::parse(report_key)?;
    let mut run = RunLineage::new(LineageInputs {
        report_id: key.report_id(),
        catalogue_hash: ctx.catalogue.hash.clone(),
        model_id: ctx.llm.model_id().to_string(),
        prompt_hash: extract_prompt_hash(),
    });
    let run_id = run.run_id.clone();
    let checkpoint_path = checkpoint_path(ctx, &key);

    let span = info_span!("run_report", report_id = %run.inputs.report_id, %run_id);
    let staged = run_stages(ctx, &key, report_key, resume_from, &checkpoint_path)
        .instrument(span)
        .await;

    let (doc, extract_outcome) = match staged {
        Ok(staged) => staged,
        Err(err) => {
            record_failed_run(ctx, run, &err).await;
            return Err(err);
        }
    };

    let verify_outcome = match verify_records(
        Arc::clone(&ctx.llm),
        &ctx.catalogue,
        &doc,
        &extract_outcome.records,
        ctx.llm_slots(),
        ctx.budget(),
        &ctx.cancel,
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(err) => {
            record_failed_run(ctx, run, &err).await;
            return Err(err);
        }
    };

    run.outputs.verified_count = verify_outcome.verified.len();
    run.outputs.rejected_count = verify_outcome.rejections.len();
    for rejection in &verify_outcome.rejections {
        *run.outputs
            .rejection_reasons
            .entry(rejection.reason.as_str().to_string())
            .or_insert(0) += 1;
    }
    for failure in &extract_outcome.failures {
        run.outputs
            .failed_indicators
            .insert(failure.indicator.clone(), failure.class.clone());
    }
    run.outputs.tokens_spent = extract_outcome.tokens_spent + verify_outcome.tokens_spent;

    // cancellation before the transaction means nothing is committed
    if ctx.cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }

    let mut summary = RunSummary {
        report_id: run.inputs.report_id.clone(),
        run_id,
        verified_count: run.outputs.verified_count,
        rejected_count: run.outputs.rejected_count,
        failed_indicators: run.outputs.failed_indicators.clone(),
        inserted: 0,
        updated: 0,
        tokens_spent: run.outputs.tokens_spent,
        dry_run: ctx.config.dry_run,
    };

    if ctx.config.dry_run {
        info!(verified = summary.verified_count, "dry run, skipping ingest");
        return Ok(summary);
    }

    let stats = ingest_verified(
        &*ctx.warehouse,
        &*ctx.lineage,
        &key,
        None,
        verify_outcome.verified,
        run,
    )
    .await?;
    summary.inserted = stats.inserted;
    summary.updated = stats.updated;

    // the run is durable; the checkpoint has served its purpose
    if let Err(err) = fs::remove_file(&checkpoint_path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %checkpoint_path.display(), error = %err, "could not remove checkpoint");
        }
    }
    Ok(summary)
}

/// One lineage record per run, failures included. Dry runs and
/// cancellations leave no trace.
async fn record_failed_run(ctx: &RunContext, run: RunLineage, err: &PipelineError) {
    if ctx.config.dry_run || matches!(err, PipelineError::Cancelled) {
        return;
    }
    let record = run.into_record("failed", Some(err.class().to_string()));
    if let Err(lineage_err) = ctx.lineage.append(&record).await {
        warn!(error = %lineage_err, "could not record failed run in lineage");
    }
}

/// Everything up to and including the LLM stage.
async fn run_stages(
    ctx: &RunContext,
    key: &ReportKey,
    report_key: &str,
    resume_from: Option<ResumeStage>,
    checkpoint_path: &Path,
) -> Result<(ExtractedDoc, ExtractOutcome)> {
    if let Some(ResumeStage::Verify) = resume_from {
        let checkpoint = read_checkpoint(checkpoint_path, report_key)?;
        info!(records = checkpoint.extract.records.len(), "resuming from checkpoint");
        let full_text = checkpoint
            .pages
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        return Ok((
            ExtractedDoc {
                pages: checkpoint.pages,
                full_text,
            },
            checkpoint.extract,
        ));
    }

    if ctx.cancel.is_cancelled() {
        return Err(PipelineError::Cancelled);
    }

    let bytes = ctx.object_store.get(&ctx.config.bucket, report_key).await?;

    let permit = ctx.pdf_slot().await;
    let doc = tokio::task::spawn_blocking(move || {
        let doc = text::extract(&bytes);
        drop(permit);
        doc
    })
    .await
    .map_err(|e| PipelineError::Storage(Box::new(e)))??;
    info!(pages = doc.pages.len(), "text extracted");

    let mut candidates = Vec::new();
    for def in ctx.catalogue.indicators() {
        candidates.extend(locate(&doc.pages, def, &ctx.config.locate));
    }
    info!(candidates = candidates.len(), "passages located");

    let extract_outcome = extract_records(
        Arc::clone(&ctx.llm),
        &ctx.catalogue,
        candidates,
        &ctx.config.extractor,
        ctx.llm_slots(),
        ctx.budget(),
        &ctx.cancel,
    )
    .await?;
    info!(
        records = extract_outcome.records.len(),
        failures = extract_outcome.failures.len(),
        tokens = extract_outcome.tokens_spent,
        "LLM extraction complete"
    );

    let checkpoint = Checkpoint {
        report_key: report_key.to_string(),
        pages: doc.pages.clone(),
        extract: extract_outcome,
    };
    write_checkpoint(checkpoint_path, &checkpoint)?;
    Ok((doc, checkpoint.extract))
}

/// Run a batch of reports, at most `C_report` at a time. A failing
/// report does not stop the others.
pub async fn run_batch(
    ctx: Arc<RunContext>,
    report_keys: Vec<String>,
) -> Vec<(String, Result<RunSummary>)> {
    let slots = Arc::new(Semaphore::new(ctx.config.report_concurrency.max(1)));
    let mut handles = Vec::with_capacity(report_keys.len());

    for report_key in report_keys {
        let ctx = Arc::clone(&ctx);
        let slots = Arc::clone(&slots);
        let key_for_result = report_key.clone();
        let handle = tokio::spawn(async move {
            let _permit = slots.acquire().await.expect("batch semaphore never closed");
            run_report(&ctx, &report_key, None).await
        });
        handles.push((key_for_result, handle));
    }

    let mut results = Vec::with_capacity(handles.len());
    for (report_key, handle) in handles {
        let result = match handle.await {
            Ok(result) => result,
            Err(join_err) => Err(PipelineError::Storage(Box::new(join_err))),
        };
        results.push((report_key, result));
    }
    results
}

fn checkpoint_path(ctx: &RunContext, key: &ReportKey) -> PathBuf {
    ctx.config
        .checkpoint_dir
        .join(format!("{}-{}.json", key.report_year, key.company_id()))
}

fn write_checkpoint(path: &Path, checkpoint: &Checkpoint) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(PipelineError::Checkpoint)?;
    }
    let json = serde_json::to_vec_pretty(checkpoint)?;
    fs::write(path, json).map_err(PipelineError::Checkpoint)?;
    Ok(())
}

fn read_checkpoint(path: &Path, report_key: &str) -> Result<Checkpoint> {
    let bytes = fs::read(path).map_err(PipelineError::Checkpoint)?;
    let checkpoint: Checkpoint = serde_json::from_slice(&bytes)?;
    if checkpoint.report_key != report_key {
        return Err(PipelineError::Checkpoint(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "checkpoint at {} is for {:?}, not {report_key:?}",
                path.display(),
                checkpoint.report_key
            ),
        )));
    }
    Ok(checkpoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalogue::Catalogue;
    use crate::context::PipelineConfig;
    use crate::stores::memory::{MemoryLineage, MemoryObjectStore, MemoryWarehouse};
    use crate::testing::{pdf_with_pages, MockChatModel, TEST_CATALOGUE_TOML};
    use crate::traits::warehouse::{LineageStore, Warehouse};

    const SCOPE1_REPLY: &str = r#"{"value": "32,400", "unit": "metric tons CO2e", "year": 2023, "source_quote": "Scope 1 Emissions in 2023 totaled 32,400 metric tons CO2e."}"#;

    fn report_pdf() -> Vec<u8> {
        pdf_with_pages(&[
            "Our people are our greatest asset.",
            "Scope 1 Emissions in 2023 totaled 32,400 metric tons CO2e.",
        ])
    }

    struct Harness {
        warehouse: Arc<MemoryWarehouse>,
        lineage: Arc<MemoryLineage>,
        llm: MockChatModel,
        ctx: RunContext,
    }

    fn harness(llm: MockChatModel, config: PipelineConfig) -> Harness {
        let catalogue = Arc::new(Catalogue::from_toml(TEST_CATALOGUE_TOML).unwrap());
        let store = Arc::new(
            MemoryObjectStore::new().with_object("reports", "2024/Acme.pdf", report_pdf()),
        );
        let warehouse = Arc::new(MemoryWarehouse::new());
        let lineage = Arc::new(MemoryLineage::new());
        let ctx = RunContext::new(
            catalogue,
            Arc::new(llm.clone()),
            store,
            Arc::clone(&warehouse) as Arc<dyn Warehouse>,
            Arc::clone(&lineage) as Arc<dyn LineageStore>,
            config,
        );
        Harness {
            warehouse,
            lineage,
            llm,
            ctx,
        }
    }

    fn config(dir: &std::path::Path) -> PipelineConfig {
        PipelineConfig {
            checkpoint_dir: dir.to_path_buf(),
            extractor: crate::pipeline::extract::ExtractorConfig {
                backoff_base: std::time::Duration::from_millis(1),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn full_run_ingests_and_cleans_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(
            MockChatModel::new().with_reply("Indicator: Scope 1 Emissions", SCOPE1_REPLY),
            config(dir.path()),
        );

        let summary = run_report(&h.ctx, "2024/Acme.pdf", None).await.unwrap();
        assert_eq!(summary.report_id, "acme:2024");
        assert_eq!(summary.verified_count, 1);
        assert_eq!(summary.inserted, 1);
        assert!(summary.tokens_spent > 0);

        // the summary line reports spend under the `cost` key
        let line = serde_json::to_value(&summary).unwrap();
        assert_eq!(line["cost"].as_u64(), Some(summary.tokens_spent));
        assert!(line.get("tokens_spent").is_none());

        let rows = h.warehouse.fetch_indicators("acme", 2024).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value_numeric, 32_400.0);
        assert_eq!(rows[0].unit_canonical, "tCO2e");
        assert_eq!(rows[0].year, 2023);
        assert_eq!(rows[0].source_page, 2);

        let records = h.lineage.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, "succeeded");
        assert_eq!(records[0].inputs.model_id, "mock-model");

        // checkpoint removed after a durable run
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.dry_run = true;
        let h = harness(
            MockChatModel::new().with_reply("Indicator: Scope 1 Emissions", SCOPE1_REPLY),
            cfg,
        );

        let summary = run_report(&h.ctx, "2024/Acme.pdf", None).await.unwrap();
        assert!(summary.dry_run);
        assert_eq!(summary.verified_count, 1);
        assert_eq!(summary.inserted, 0);
        assert_eq!(h.warehouse.row_count(), 0);
        assert_eq!(h.lineage.record_count(), 0);
    }

    #[tokio::test]
    async fn resume_from_verify_skips_the_llm_stage() {
        let dir = tempfile::tempdir().unwrap();

        // first pass: dry run leaves the checkpoint behind
        let mut cfg = config(dir.path());
        cfg.dry_run = true;
        let first = harness(
            MockChatModel::new().with_reply("Indicator: Scope 1 Emissions", SCOPE1_REPLY),
            cfg,
        );
        run_report(&first.ctx, "2024/Acme.pdf", None).await.unwrap();

        // second pass resumes; an unscripted model proves no chat happens
        let second = harness(MockChatModel::new(), config(dir.path()));
        let summary = run_report(&second.ctx, "2024/Acme.pdf", Some(ResumeStage::Verify))
            .await
            .unwrap();

        assert_eq!(summary.verified_count, 1);
        assert_eq!(summary.inserted, 1);
        assert_eq!(second.llm.call_count(), 0);
    }

    #[tokio::test]
    async fn extraction_failure_records_failed_lineage() {
        let dir = tempfile::tempdir().unwrap();
        let catalogue = Arc::new(Catalogue::from_toml(TEST_CATALOGUE_TOML).unwrap());
        let store = Arc::new(
            MemoryObjectStore::new().with_object("reports", "2024/Bad.pdf", b"not a pdf".to_vec()),
        );
        let lineage = Arc::new(MemoryLineage::new());
        let ctx = RunContext::new(
            catalogue,
            Arc::new(MockChatModel::new()),
            store,
            Arc::new(MemoryWarehouse::new()),
            Arc::clone(&lineage) as Arc<dyn LineageStore>,
            config(dir.path()),
        );

        let err = run_report(&ctx, "2024/Bad.pdf", None).await.unwrap_err();
        assert!(matches!(err, PipelineError::Extraction { .. }));
        let records = lineage.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, "failed");
        assert_eq!(records[0].error_class.as_deref(), Some("extraction"));
    }

    #[tokio::test]
    async fn invalid_report_key_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(MockChatModel::new(), config(dir.path()));
        let err = run_report(&h.ctx, "Acme.pdf", None).await.unwrap_err();
        assert!(matches!(err, PipelineError::InvalidReportKey { .. }));
    }

    #[tokio::test]
    async fn batch_isolates_per_report_failures() {
        let dir = tempfile::tempdir().unwrap();
        let catalogue = Arc::new(Catalogue::from_toml(TEST_CATALOGUE_TOML).unwrap());
        let store = Arc::new(
            MemoryObjectStore::new()
                .with_object("reports", "2024/Acme.pdf", report_pdf())
                .with_object("reports", "2024/Bad.pdf", b"not a pdf".to_vec()),
        );
        let warehouse = Arc::new(MemoryWarehouse::new());
        let ctx = Arc::new(RunContext::new(
            catalogue,
            Arc::new(MockChatModel::new().with_reply("Indicator: Scope 1 Emissions", SCOPE1_REPLY)),
            store,
            Arc::clone(&warehouse) as Arc<dyn Warehouse>,
            Arc::new(MemoryLineage::new()),
            config(dir.path()),
        ));

        let results = run_batch(
            ctx,
            vec!["2024/Acme.pdf".to_string(), "2024/Bad.pdf".to_string()],
        )
        .await;

        assert_eq!(results.len(), 2);
        assert!(results.iter().find(|(k, _)| k == "2024/Acme.pdf").unwrap().1.is_ok());
        assert!(results.iter().find(|(k, _)| k == "2024/Bad.pdf").unwrap().1.is_err());
        assert_eq!(warehouse.row_count(), 1);
    }

    #[tokio::test]
    async fn rerun_is_idempotent_up_to_revision() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(
            MockChatModel::new().with_reply("Indicator: Scope 1 Emissions", SCOPE1_REPLY),
            config(dir.path()),
        );

        let first = run_report(&h.ctx, "2024/Acme.pdf", None).await.unwrap();
        let second = run_report(&h.ctx, "2024/Acme.pdf", None).await.unwrap();

        assert_eq!(first.inserted, 1);
        assert_eq!(second.inserted, 0);
        assert_eq!(second.updated, 1);

        let rows = h.warehouse.fetch_indicators("acme", 2024).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].revision, 2);
    }

    #[tokio::test]
    async fn cancelled_context_commits_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let h = harness(
            MockChatModel::new().with_reply("Indicator: Scope 1 Emissions", SCOPE1_REPLY),
            config(dir.path()),
        );
        h.ctx.cancel.cancel();

        let err = run_report(&h.ctx, "2024/Acme.pdf", None).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
        assert_eq!(h.warehouse.row_count(), 0);
    }
}
