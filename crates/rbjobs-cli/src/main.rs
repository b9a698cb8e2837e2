use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rbjobs_adapters::{adapter_for_source, AdapterContext, AdapterOptions, WwrCategory};
use rbjobs_storage::{HttpFetcher, JobStore, PgStore, RunStore};
use rbjobs_sync::{SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "rbjobs-cli")]
#[command(about = "Remote Balkan job ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every enabled source (or just one) and upsert into Postgres.
    Ingest {
        #[arg(long)]
        source: Option<String>,
    },
    /// Fetch and normalize one source without touching the database.
    Fetch {
        #[arg(long)]
        source: String,
        #[arg(long)]
        query: Option<String>,
        #[arg(long)]
        category: Option<WwrCategory>,
        #[arg(long)]
        discover_feed: bool,
    },
    /// Print the job count and the most recent run records.
    Verify,
    /// Run ingestion on the configured cron schedules until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Ingest { source: None }) {
        Commands::Ingest { source } => {
            let pipeline = SyncPipeline::connect(config).await?;
            let summary = pipeline.run_once(source.as_deref()).await?;
            for report in &summary.sources {
                println!(
                    "{:<16} {:<5} attempts={} fetched={} inserted={} latency_ms={}{}",
                    report.source_id,
                    report.status.as_str(),
                    report.attempts,
                    report.fetched,
                    report.inserted,
                    report.mean_latency_ms,
                    report
                        .error
                        .as_deref()
                        .map(|e| format!(" error={e}"))
                        .unwrap_or_default()
                );
            }
            println!(
                "ingest complete: sources={} failed={} inserted={}",
                summary.sources.len(),
                summary.failed(),
                summary.total_inserted()
            );
            if !summary.sources.is_empty() && summary.failed() == summary.sources.len() {
                bail!("every source failed");
            }
        }
        Commands::Fetch {
            source,
            query,
            category,
            discover_feed,
        } => {
            let options = AdapterOptions {
                query,
                category,
                discover_feed,
            };
            let adapter = adapter_for_source(&source, &options)
                .with_context(|| format!("no adapter registered for {source}"))?;
            let http = HttpFetcher::new(config.http_client_config())?;
            let ctx = AdapterContext::new(Uuid::new_v4());
            let jobs = adapter.fetch_jobs(&http, &ctx).await?;
            info!(source_id = %source, count = jobs.len(), "dry run");
            println!(
                "{}",
                serde_json::to_string_pretty(&jobs).context("serializing jobs")?
            );
        }
        Commands::Verify => {
            let store = PgStore::connect(config.require_database_url()?).await?;
            let count = store.count_jobs().await?;
            println!("jobs: {count}");
            for run in store.recent_runs(10).await? {
                println!(
                    "{} {:<16} {:<5} started={} ended={} inserted={} errors={} latency_ms={} notes={}",
                    run.id,
                    run.source_id,
                    run.status.as_deref().unwrap_or("-"),
                    run.started_at.to_rfc3339(),
                    run.ended_at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string()),
                    run.items_inserted.unwrap_or(0),
                    run.errors.unwrap_or(0),
                    run.mean_latency_ms.unwrap_or(0),
                    run.notes.as_deref().unwrap_or("")
                );
            }
        }
        Commands::Schedule => {
            let pipeline = Arc::new(SyncPipeline::connect(config).await?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler disabled; set RBJOBS_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(
                cron_1 = %pipeline.config().sync_cron_1,
                cron_2 = %pipeline.config().sync_cron_2,
                "scheduler running"
            );
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
