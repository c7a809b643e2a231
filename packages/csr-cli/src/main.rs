//! `csr` - driver binary for the CSR indicator extraction pipeline.
//!
//! Wires the library's stores and LLM client from the environment, runs
//! one report (or a batch under a key prefix), and prints one JSON
//! summary line per report on stdout. Logs go to stderr.
//!
//! Environment:
//! - `LLM_API_KEY` (required), `LLM_MODEL`, `LLM_BASE_URL`
//! - `OBJECT_STORE_URL` (required)
//! - `WAREHOUSE_URL` - PostgreSQL DSN; optional with `--dry-run`
//! - `LINEAGE_URL` - defaults to `WAREHOUSE_URL`
//! - `LOG_LEVEL` - tracing filter, defaults to `info`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use csr_extraction::stores::{MemoryLineage, MemoryWarehouse};
use csr_extraction::traits::warehouse::{LineageStore, Warehouse};
use csr_extraction::{
    run_batch, run_report, Catalogue, HttpObjectStore, OpenAiChatModel, PipelineConfig,
    PostgresLineage, PostgresWarehouse, ResumeStage, RunContext,
};

#[derive(Parser)]
#[command(name = "csr", about = "CSR indicator extraction pipeline", version)]
struct Cli {
    /// Indicator catalogue TOML.
    #[arg(long, global = true, default_value = "config/catalogue.toml")]
    catalogue: PathBuf,

    /// Run every stage but skip warehouse and lineage writes.
    #[arg(long, global = true)]
    dry_run: bool,

    /// Aggregate LLM token cap for this invocation.
    #[arg(long, global = true)]
    token_budget: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process a single report.
    Run {
        /// Object store key, e.g. `2024/Acme.pdf`.
        #[arg(long)]
        report: String,

        /// Resume from a checkpointed stage (`verify`).
        #[arg(long)]
        resume_from: Option<ResumeStage>,
    },
    /// Process every report under an object store key prefix.
    Batch {
        /// Key prefix, e.g. `2024/`.
        #[arg(long)]
        prefix: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let ctx = Arc::new(build_context(&cli).await?);

    // First Ctrl-C requests a clean stop; the pipeline finishes in-flight
    // LLM calls and commits nothing afterwards.
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    match cli.command {
        Command::Run { report, resume_from } => {
            let summary = run_report(&ctx, &report, resume_from)
                .await
                .with_context(|| format!("report {report} failed"))?;
            println!("{}", serde_json::to_string(&summary)?);
        }
        Command::Batch { prefix } => {
            let keys = ctx
                .object_store
                .list(&ctx.config.bucket, &prefix)
                .await
                .context("listing reports")?;
            if keys.is_empty() {
                bail!("no reports under prefix {prefix:?}");
            }
            info!(reports = keys.len(), %prefix, "starting batch");

            let results = run_batch(Arc::clone(&ctx), keys).await;
            let mut failed = 0usize;
            for (key, result) in &results {
                match result {
                    Ok(summary) => println!("{}", serde_json::to_string(summary)?),
                    Err(err) => {
                        failed += 1;
                        error!(report = %key, %err, "report failed");
                    }
                }
            }
            info!(
                reports = results.len(),
                succeeded = results.len() - failed,
                failed,
                "batch finished"
            );
            if failed == results.len() {
                bail!("all {failed} reports failed");
            }
        }
    }
    Ok(())
}

async fn build_context(cli: &Cli) -> anyhow::Result<RunContext> {
    let catalogue = Arc::new(
        Catalogue::load(&cli.catalogue)
            .with_context(|| format!("loading catalogue {}", cli.catalogue.display()))?,
    );
    let llm = Arc::new(OpenAiChatModel::from_env()?);
    let object_store = Arc::new(HttpObjectStore::from_env()?);

    let config = PipelineConfig {
        token_budget: cli.token_budget,
        dry_run: cli.dry_run,
        ..Default::default()
    };

    let (warehouse, lineage): (Arc<dyn Warehouse>, Arc<dyn LineageStore>) =
        match std::env::var("WAREHOUSE_URL") {
            Ok(warehouse_url) => {
                // One pool serves both stores unless LINEAGE_URL points
                // elsewhere.
                let pool_size = config.report_concurrency as u32 + 2;
                let warehouse = PostgresWarehouse::connect(&warehouse_url, pool_size).await?;
                let lineage = match std::env::var("LINEAGE_URL") {
                    Ok(lineage_url) if lineage_url != warehouse_url => {
                        PostgresLineage::connect(&lineage_url, 2).await?
                    }
                    _ => PostgresLineage::from_pool(warehouse.pool().clone()).await?,
                };
                (Arc::new(warehouse), Arc::new(lineage))
            }
            Err(_) if cli.dry_run => {
                // Dry runs never write, so in-memory stores suffice.
                (
                    Arc::new(MemoryWarehouse::new()),
                    Arc::new(MemoryLineage::new()),
                )
            }
            Err(_) => bail!("WAREHOUSE_URL is not set (required unless --dry-run)"),
        };

    Ok(RunContext::new(
        catalogue,
        llm,
        object_store,
        warehouse,
        lineage,
        config,
    ))
}
