//! Per-run injected context.
//!
//! Configuration, clients and store handles travel through one context
//! object built at startup; no process-wide mutable state. The context
//! also owns the process-wide concurrency bounds: the LLM request
//! semaphore and the PDF extraction slots are shared by every report in
//! a batch.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::catalogue::Catalogue;
use crate::locate::LocateConfig;
use crate::pipeline::extract::{ExtractorConfig, TokenBudget};
use crate::traits::llm::ChatModel;
use crate::traits::object_store::ObjectStore;
use crate::traits::warehouse::{LineageStore, Warehouse};

/// Tunable bounds and paths for one pipeline process.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Object store bucket holding the report PDFs.
    pub bucket: String,
    /// Concurrent PDF extractions (C_pdf).
    pub pdf_concurrency: usize,
    /// Concurrent reports in a batch (C_report).
    pub report_concurrency: usize,
    /// Aggregate LLM token cap per run; `None` means unbounded.
    pub token_budget: Option<u32>,
    /// Where per-run checkpoint artifacts live.
    pub checkpoint_dir: PathBuf,
    /// Run every stage but skip warehouse and lineage writes.
    pub dry_run: bool,
    pub locate: LocateConfig,
    pub extractor: ExtractorConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            bucket: "reports".to_string(),
            pdf_concurrency: cpus.min(4),
            report_concurrency: 4,
            token_budget: None,
            checkpoint_dir: PathBuf::from(".csr-checkpoints"),
            dry_run: false,
            locate: LocateConfig::default(),
            extractor: ExtractorConfig::default(),
        }
    }
}

/// Everything a run needs, wired once by the caller.
pub struct RunContext {
    pub catalogue: Arc<Catalogue>,
    pub llm: Arc<dyn ChatModel>,
    pub object_store: Arc<dyn ObjectStore>,
    pub warehouse: Arc<dyn Warehouse>,
    pub lineage: Arc<dyn LineageStore>,
    pub config: PipelineConfig,
    pub cancel: CancellationToken,
    llm_slots: Arc<Semaphore>,
    pdf_slots: Arc<Semaphore>,
    budget: Option<Arc<TokenBudget>>,
}

impl RunContext {
    pub fn new(
        catalogue: Arc<Catalogue>,
        llm: Arc<dyn ChatModel>,
        object_store: Arc<dyn ObjectStore>,
        warehouse: Arc<dyn Warehouse>,
        lineage: Arc<dyn LineageStore>,
        config: PipelineConfig,
    ) -> Self {
        let llm_slots = Arc::new(Semaphore::new(config.extractor.concurrency));
        let pdf_slots = Arc::new(Semaphore::new(config.pdf_concurrency.max(1)));
        let budget = config.token_budget.map(TokenBudget::new);
        Self {
            catalogue,
            llm,
            object_store,
            warehouse,
            lineage,
            config,
            cancel: CancellationToken::new(),
            llm_slots,
            pdf_slots,
            budget,
        }
    }

    /// Global LLM request slots, shared across the whole batch.
    pub fn llm_slots(&self) -> Arc<Semaphore> {
        Arc::clone(&self.llm_slots)
    }

    /// Shared run-level token budget, if one is configured.
    pub fn budget(&self) -> Option<Arc<TokenBudget>> {
        self.budget.clone()
    }

    /// Acquire one CPU slot for PDF text extraction.
    pub async fn pdf_slot(&self) -> OwnedSemaphorePermit {
        Arc::clone(&self.pdf_slots)
            .acquire_owned()
            .await
            .expect("pdf semaphore never closed")
    }
}
