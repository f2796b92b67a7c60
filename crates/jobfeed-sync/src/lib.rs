//! Ingestion pipeline: orchestration, merge, run tracking, cleanup and scheduling.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use jobfeed_connectors::{build_connectors, SourceRegistry};
use jobfeed_storage::{HttpFetcher, PgStore};
use tokio::sync::watch;
use tracing::{info, warn};

pub mod cleanup;
pub mod clock;
pub mod config;
pub mod invalidate;
pub mod orchestrator;
pub mod report;
pub mod resolver;
pub mod scheduler;
pub mod status;
pub mod upsert;

pub use cleanup::{select_stale_copies, CleanupEngine, CleanupError};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SyncConfig;
pub use invalidate::{
    HttpInvalidator, InvalidationError, Invalidator, NoopInvalidator, DEFAULT_CACHE_PREFIX,
};
pub use orchestrator::{
    CycleSummary, FailedSource, Orchestrator, OrchestratorSettings, SourceFailure,
    SourceRunReport, StoreHandles,
};
pub use report::{daily_brief_markdown, write_cycle_report};
pub use resolver::{normalize_key_fragment, OrganizationResolver, DEFAULT_ORGANIZATION_ID};
pub use scheduler::{CronSchedule, ScheduleError, Scheduler};
pub use status::{
    HealthSnapshot, RunHistoryPage, RunStatistics, RunStatusTracker, SourceStatistics,
    StatusError, StuckRun,
};
pub use upsert::{MergeError, UpsertEngine};

pub const CRATE_NAME: &str = "jobfeed-sync";

const INVALIDATION_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_DB_CONNECTIONS: u32 = 5;

pub fn build_invalidator(config: &SyncConfig) -> Result<Arc<dyn Invalidator>> {
    match &config.cache_invalidate_url {
        Some(url) => Ok(Arc::new(
            HttpInvalidator::new(url.clone(), INVALIDATION_TIMEOUT)
                .context("building cache invalidation client")?,
        )),
        None => Ok(Arc::new(NoopInvalidator)),
    }
}

pub async fn connect_store(config: &SyncConfig) -> Result<Arc<PgStore>> {
    let store = PgStore::connect(&config.database_url, MAX_DB_CONNECTIONS)
        .await
        .context("connecting to database")?;
    Ok(Arc::new(store))
}

pub struct SyncPipeline {
    config: SyncConfig,
    orchestrator: Orchestrator,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, orchestrator: Orchestrator) -> Self {
        Self {
            config,
            orchestrator,
        }
    }

    /// Wires the production pipeline: Postgres, the source registry and the system clock.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let store = connect_store(&config).await?;
        let registry = SourceRegistry::load(&config.sources_path)?;
        let http = HttpFetcher::new(config.http_client_config())?;
        let http = Arc::new(registry.apply_rate_limits(http));
        let connectors = build_connectors(&registry, http.clone(), None)
            .context("building connectors from the source registry")?;
        info!(
            sources = connectors.len(),
            registry = %config.sources_path.display(),
            "connector registry built"
        );

        let settings = OrchestratorSettings {
            default_organization_id: config.default_organization_id,
            cache_prefix: config.cache_prefix.clone(),
            ..Default::default()
        };
        let orchestrator = Orchestrator::new(
            connectors,
            http,
            StoreHandles::shared(store),
            build_invalidator(&config)?,
            Arc::new(SystemClock),
            settings,
        );
        Ok(Self::new(config, orchestrator))
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Runs one cycle and writes its report. A report that cannot be written is logged only.
    pub async fn run_once(&self) -> CycleSummary {
        let summary = self.orchestrator.run_cycle().await;
        match write_cycle_report(&self.config.reports_dir, &summary).await {
            Ok(dir) => info!(report = %dir.display(), "cycle report written"),
            Err(err) => warn!(error = ?err, "could not write cycle report"),
        }
        summary
    }

    /// Runs cycles on the configured calendar until `shutdown` is signalled.
    pub async fn run_scheduled(
        &self,
        clock: Arc<dyn Clock>,
        max_cycles: Option<usize>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<usize> {
        let schedule = CronSchedule::from_cron(&self.config.cron_expressions())
            .context("parsing SYNC_CRON_1/SYNC_CRON_2")?;
        info!(cron = ?schedule.expressions(), "scheduler started");
        let scheduler = Scheduler::new(schedule, clock);
        let cycles = scheduler
            .run(
                move || async move {
                    let summary = self.run_once().await;
                    if summary.status_write_failed() {
                        warn!(
                            failures = summary.status_write_failures,
                            "run status could not be recorded for every source"
                        );
                    }
                },
                max_cycles,
                shutdown,
            )
            .await;
        Ok(cycles)
    }
}

pub async fn run_sync_once_from_env() -> Result<CycleSummary> {
    let config = SyncConfig::from_env();
    let pipeline = SyncPipeline::from_config(config).await?;
    Ok(pipeline.run_once().await)
}
