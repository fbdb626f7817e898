use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use jat_adapters::{OpenAiClient, OpenAiConfig};
use jat_pipeline::{
    maybe_build_scheduler, report_markdown, Reconciler, TrackerConfig, TrackerPipeline,
};
use jat_storage::{RecordStore, ResearchCache};

#[derive(Debug, Parser)]
#[command(name = "jat-cli")]
#[command(about = "Job application tracker command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, extract, reconcile and deliver the digest once.
    Run,
    /// Compact the store to one record per (title, company) pair.
    Dedup,
    /// Generate missing research notes for every tracked company.
    Research,
    /// Print a markdown snapshot of the store.
    Report,
    /// Run now, then keep running on the configured daily schedule.
    Schedule,
}

/// Installs the process-wide subscriber once: console output filtered by
/// `RUST_LOG` (default `info`) plus an append-mode file under the data dir.
fn init_logging(logs_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("creating {}", logs_dir.display()))?;
    let log_path = logs_dir.join("applications.log");
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("opening {}", log_path.display()))?;

    let env_filter =
        || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_filter(env_filter());
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(log_file)
        .with_target(true)
        .with_filter(env_filter());

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();
    Ok(())
}

fn openai_client(config: &TrackerConfig) -> Result<OpenAiClient> {
    OpenAiClient::new(OpenAiConfig {
        api_key: config.openai_api_key.clone(),
        model: config.openai_model.clone(),
        base_url: config.openai_base_url.clone(),
        timeout: Duration::from_secs(config.http_timeout_secs),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = TrackerConfig::from_env();
    init_logging(&config.logs_dir())?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let pipeline = TrackerPipeline::from_config(config)?;
            let summary = pipeline.run_once().await?;
            println!(
                "run complete: run_id={} fetched={} saved={} duplicates={} researched={}",
                summary.run_id,
                summary.fetched_emails,
                summary.saved_records,
                summary.duplicates_skipped,
                summary.companies_researched
            );
        }
        Commands::Dedup => {
            let store = RecordStore::new(config.store_path());
            store.initialize().await?;
            let cache = ResearchCache::new(config.research_dir());
            let client = openai_client(&config)?;
            let reconciler = Reconciler::new(&store, &cache, &client);
            let summary = reconciler.deduplicate_store().await?;
            println!(
                "deduplication complete: {} -> {} records ({} invalid dropped, {} merged)",
                summary.before,
                summary.after,
                summary.invalid_dropped,
                summary.duplicates_merged()
            );
        }
        Commands::Research => {
            let store = RecordStore::new(config.store_path());
            store.initialize().await?;
            let cache = ResearchCache::new(config.research_dir());
            let client = openai_client(&config)?;
            let reconciler = Reconciler::new(&store, &cache, &client);
            let count = reconciler.generate_research_for_all_companies().await?;
            println!("generated research for {count} companies");
        }
        Commands::Report => {
            println!("{}", report_markdown(&config).await?);
        }
        Commands::Schedule => {
            let mut config = config;
            config.scheduler_enabled = true;
            let scheduler = maybe_build_scheduler(&config)
                .await?
                .context("scheduler was not built")?;

            // Mirror the daily batch deployment: one run right away, then
            // fire on the cron schedule until interrupted.
            let pipeline = TrackerPipeline::from_config(config.clone())?;
            let summary = pipeline.run_once().await?;
            info!(run_id = %summary.run_id, saved = summary.saved_records, "initial run complete");

            scheduler.start().await.context("starting scheduler")?;
            println!("scheduler started, cron: {}", config.run_cron);
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        }
    }

    Ok(())
}
