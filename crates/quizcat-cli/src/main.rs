use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use quizcat_reconcile::{CatalogConfig, CatalogPipeline, PassReport};
use tracing::error;
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "quizcat=info,quizcat_reconcile=info,quizcat_storage=info,quizcat_adapters=info";

#[derive(Debug, Parser)]
#[command(name = "quizcat")]
#[command(about = "Quiz catalog reconciliation and meta description tooling")]
struct Cli {
    /// Workspace root holding the catalog collections (overrides QUIZCAT_ROOT).
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Registry, content store and build output totals with every discrepancy.
    Count,
    /// Registry against content store: duplicates, missing and extra ids.
    Mismatch,
    /// Ids missing from the content store, classified against the backup store.
    Missing,
    /// Merge recoverable records from the backup store into the content store.
    Recover,
    /// Drop duplicate registry entries and renumber, through a verified staged copy.
    DedupeRegistry,
    /// Drop duplicate records from the content and backup stores.
    DedupeStores,
    /// Generate a unique meta description per registry entry.
    Describe,
    /// Write generated meta descriptions into the backup and content stores.
    ApplyDescriptions,
    /// Rebuild the registry from the content store.
    ExportRegistry,
    /// Check stored meta descriptions for collisions, length and near duplicates.
    AuditDescriptions,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "pass failed");
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = CatalogConfig::from_env();
    if let Some(root) = cli.root {
        config.workspace_root = root;
    }
    let pipeline = CatalogPipeline::new(config);

    match cli.command.unwrap_or(Commands::Count) {
        Commands::Count => finish(&pipeline, pipeline.count()?).await,
        Commands::Mismatch => finish(&pipeline, pipeline.mismatch()?).await,
        Commands::Missing => finish(&pipeline, pipeline.missing()?).await,
        Commands::Recover => finish(&pipeline, pipeline.recover().await?).await,
        Commands::DedupeRegistry => finish(&pipeline, pipeline.dedupe_registry().await?).await,
        Commands::DedupeStores => finish(&pipeline, pipeline.dedupe_stores().await?).await,
        Commands::Describe => finish(&pipeline, pipeline.describe().await?).await,
        Commands::ApplyDescriptions => {
            finish(&pipeline, pipeline.apply_descriptions().await?).await
        }
        Commands::ExportRegistry => finish(&pipeline, pipeline.export_registry().await?).await,
        Commands::AuditDescriptions => finish(&pipeline, pipeline.audit_descriptions()?).await,
    }
}

/// Print the report, persist it under `reports/<run_id>/` and map it to an exit code.
async fn finish<R: PassReport>(pipeline: &CatalogPipeline, report: R) -> Result<ExitCode> {
    println!("{}", report.render());
    let reports_dir = pipeline.write_report(&report).await?;
    println!();
    println!(
        "{} complete: run_id={} reports={}",
        R::PASS,
        pipeline.run_id(),
        reports_dir.display()
    );

    if report.needs_attention() {
        Ok(ExitCode::from(2))
    } else {
        Ok(ExitCode::SUCCESS)
    }
}
