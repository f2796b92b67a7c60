use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use jobfeed_sync::{
    build_invalidator, connect_store, CleanupEngine, RunStatusTracker, SyncConfig, SyncPipeline,
    SystemClock,
};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "jobfeed-cli")]
#[command(about = "Job vacancy ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion cycle across every enabled source.
    Sync,
    /// Remove expired and duplicate vacancies.
    Cleanup {
        #[arg(long)]
        dry_run: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Run cycles on the SYNC_CRON_1/SYNC_CRON_2 calendar until interrupted.
    Schedule {
        #[arg(long)]
        max_cycles: Option<usize>,
    },
    /// Latest run per source, or one source's run history.
    Status {
        #[arg(long)]
        source: Option<String>,
        #[arg(long, default_value_t = 1)]
        page: usize,
        #[arg(long, default_value_t = 20)]
        per_page: usize,
    },
    /// Aggregate run statistics over a trailing window.
    Stats {
        #[arg(long, default_value_t = 7)]
        days: i64,
    },
    /// Stuck and failing sources.
    Health,
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serializing output")?
    );
    Ok(())
}

async fn tracker(config: &SyncConfig) -> Result<RunStatusTracker> {
    let store = connect_store(config).await?;
    Ok(RunStatusTracker::new(store, Arc::new(SystemClock))
        .with_stale_after(chrono::Duration::minutes(config.stale_run_minutes)))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let pipeline = SyncPipeline::from_config(config).await?;
            let summary = pipeline.run_once().await;
            println!(
                "sync complete: cycle_id={} succeeded={} failed={} processed={} errors={}",
                summary.cycle_id,
                summary.succeeded_sources.len(),
                summary.failed_sources.len(),
                summary.total_processed,
                summary.total_errors
            );
            for failed in &summary.failed_sources {
                println!("  failed {}: {}", failed.source_name, failed.error);
            }
            if summary.status_write_failed() {
                bail!(
                    "run status could not be recorded for {} source(s)",
                    summary.status_write_failures
                );
            }
        }
        Commands::Cleanup { dry_run } => {
            let store = connect_store(&config).await?;
            let engine = CleanupEngine::new(
                store,
                build_invalidator(&config)?,
                Arc::new(SystemClock),
                config.cache_prefix.clone(),
            );
            let stats = engine.run(dry_run).await;
            print_json(&stats)?;
            if stats.has_errors() {
                bail!("cleanup finished with {} error(s)", stats.errors.len());
            }
        }
        Commands::Migrate => {
            let store = connect_store(&config).await?;
            store.migrate().await.context("applying migrations")?;
            info!("migrations applied");
        }
        Commands::Schedule { max_cycles } => {
            let pipeline = SyncPipeline::from_config(config).await?;
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; stopping after the current cycle");
                    let _ = shutdown_tx.send(true);
                }
            });
            let cycles = pipeline
                .run_scheduled(Arc::new(SystemClock), max_cycles, shutdown_rx)
                .await?;
            println!("scheduler stopped after {cycles} cycle(s)");
        }
        Commands::Status {
            source,
            page,
            per_page,
        } => {
            let tracker = tracker(&config).await?;
            match source {
                Some(source) => print_json(&tracker.history(&source, page, per_page).await?)?,
                None => print_json(&tracker.latest().await?)?,
            }
        }
        Commands::Stats { days } => {
            let tracker = tracker(&config).await?;
            print_json(&tracker.statistics(days).await?)?;
        }
        Commands::Health => {
            let tracker = tracker(&config).await?;
            let health = tracker.health().await?;
            print_json(&health)?;
            if !health.healthy {
                bail!(
                    "unhealthy: {} stuck, {} failing",
                    health.stuck_runs.len(),
                    health.failing_sources.len()
                );
            }
        }
    }

    Ok(())
}
