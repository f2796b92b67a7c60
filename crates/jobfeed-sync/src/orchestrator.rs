//! One ingestion cycle: every connector in turn, then invalidation and cleanup.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use jobfeed_connectors::{Connector, ConnectorContext, ConnectorError, PageCursor};
use jobfeed_core::{CleanupStats, MergeAction, OrganizationId, RunId, RunOutcome, RunStats};
use jobfeed_storage::{HttpFetcher, JobStore, OrganizationStore, RunStatusStore};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cleanup::CleanupEngine;
use crate::clock::Clock;
use crate::invalidate::{Invalidator, DEFAULT_CACHE_PREFIX};
use crate::resolver::{OrganizationResolver, DEFAULT_ORGANIZATION_ID};
use crate::status::RunStatusTracker;
use crate::upsert::UpsertEngine;

/// Store handles the orchestrator writes through. Usually three views of one backend.
#[derive(Clone)]
pub struct StoreHandles {
    pub jobs: Arc<dyn JobStore>,
    pub runs: Arc<dyn RunStatusStore>,
    pub organizations: Arc<dyn OrganizationStore>,
}

impl StoreHandles {
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: JobStore + RunStatusStore + OrganizationStore + 'static,
    {
        Self {
            jobs: store.clone(),
            runs: store.clone(),
            organizations: store,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub default_organization_id: OrganizationId,
    pub cache_prefix: String,
    /// Hard stop for sources that never report their last page.
    pub page_limit: u32,
    pub run_cleanup: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            default_organization_id: DEFAULT_ORGANIZATION_ID,
            cache_prefix: DEFAULT_CACHE_PREFIX.to_string(),
            page_limit: 500,
            run_cleanup: true,
        }
    }
}

/// Why a source's paging stopped early.
#[derive(Debug, Error)]
pub enum SourceFailure {
    #[error(transparent)]
    Connector(#[from] ConnectorError),
    #[error("cursor did not advance past {0}")]
    StalledCursor(PageCursor),
    #[error("page limit of {0} reached without a final page")]
    PageLimit(u32),
    #[error("organization catalogue unavailable: {0}")]
    Catalogue(String),
    #[error("could not record run start: {0}")]
    StatusUnavailable(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceRunReport {
    pub source_name: String,
    pub run_id: Option<RunId>,
    pub outcome: RunOutcome,
    pub pages: u32,
    pub processed: i64,
    pub success: i64,
    pub errors: i64,
    pub inserted: u64,
    pub updated: u64,
    pub live_count: i64,
    pub error_message: Option<String>,
    pub duration_ms: u64,
}

impl SourceRunReport {
    fn new(source_name: &str) -> Self {
        Self {
            source_name: source_name.to_string(),
            run_id: None,
            outcome: RunOutcome::Success,
            pages: 0,
            processed: 0,
            success: 0,
            errors: 0,
            inserted: 0,
            updated: 0,
            live_count: 0,
            error_message: None,
            duration_ms: 0,
        }
    }

    fn stats(&self) -> RunStats {
        RunStats {
            processed_count: self.processed,
            success_count: self.success,
            error_count: self.errors,
            live_count: self.live_count,
            error_message: self.error_message.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedSource {
    pub source_name: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub succeeded_sources: Vec<String>,
    pub failed_sources: Vec<FailedSource>,
    pub total_processed: i64,
    pub total_success: i64,
    pub total_errors: i64,
    pub total_inserted: u64,
    pub total_updated: u64,
    pub sources: Vec<SourceRunReport>,
    pub cache_invalidated: bool,
    pub cleanup: Option<CleanupStats>,
    /// Runs whose start or finish could not be written to the status log.
    pub status_write_failures: u32,
}

impl CycleSummary {
    pub fn source(&self, source_name: &str) -> Option<&SourceRunReport> {
        self.sources.iter().find(|s| s.source_name == source_name)
    }

    pub fn status_write_failed(&self) -> bool {
        self.status_write_failures > 0
    }
}

pub struct Orchestrator {
    connectors: Vec<Box<dyn Connector>>,
    http: Arc<HttpFetcher>,
    stores: StoreHandles,
    upsert: UpsertEngine,
    tracker: RunStatusTracker,
    cleanup: CleanupEngine,
    invalidator: Arc<dyn Invalidator>,
    clock: Arc<dyn Clock>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        connectors: Vec<Box<dyn Connector>>,
        http: Arc<HttpFetcher>,
        stores: StoreHandles,
        invalidator: Arc<dyn Invalidator>,
        clock: Arc<dyn Clock>,
        settings: OrchestratorSettings,
    ) -> Self {
        let upsert = UpsertEngine::new(stores.jobs.clone(), clock.clone());
        let tracker = RunStatusTracker::new(stores.runs.clone(), clock.clone());
        let cleanup = CleanupEngine::new(
            stores.jobs.clone(),
            invalidator.clone(),
            clock.clone(),
            settings.cache_prefix.clone(),
        );
        Self {
            connectors,
            http,
            stores,
            upsert,
            tracker,
            cleanup,
            invalidator,
            clock,
            settings,
        }
    }

    pub fn connector_names(&self) -> Vec<&str> {
        self.connectors.iter().map(|c| c.source_name()).collect()
    }

    pub fn tracker(&self) -> &RunStatusTracker {
        &self.tracker
    }

    pub fn cleanup_engine(&self) -> &CleanupEngine {
        &self.cleanup
    }

    pub async fn run_cycle(&self) -> CycleSummary {
        let started_at = self.clock.now();
        let ctx = ConnectorContext::new(started_at);
        let span = info_span!("cycle", cycle_id = %ctx.cycle_id);
        self.run_cycle_with(ctx).instrument(span).await
    }

    async fn run_cycle_with(&self, ctx: ConnectorContext) -> CycleSummary {
        info!(sources = self.connectors.len(), "ingestion cycle started");
        let resolver = OrganizationResolver::load(
            self.stores.organizations.as_ref(),
            self.settings.default_organization_id,
        )
        .await
        .map_err(|e| {
            error!(error = %e, "could not load organization catalogue");
            e.to_string()
        });

        let mut summary = CycleSummary {
            cycle_id: ctx.cycle_id,
            started_at: ctx.started_at,
            finished_at: ctx.started_at,
            succeeded_sources: Vec::new(),
            failed_sources: Vec::new(),
            total_processed: 0,
            total_success: 0,
            total_errors: 0,
            total_inserted: 0,
            total_updated: 0,
            sources: Vec::new(),
            cache_invalidated: false,
            cleanup: None,
            status_write_failures: 0,
        };

        for connector in &self.connectors {
            let span = info_span!("source_run", source = connector.source_name());
            let (report, write_failures) = self
                .run_source(connector.as_ref(), &ctx, resolver.as_ref())
                .instrument(span)
                .await;
            summary.status_write_failures += write_failures;
            summary.total_processed += report.processed;
            summary.total_success += report.success;
            summary.total_errors += report.errors;
            summary.total_inserted += report.inserted;
            summary.total_updated += report.updated;
            match report.outcome {
                RunOutcome::Success => summary.succeeded_sources.push(report.source_name.clone()),
                RunOutcome::Failed => summary.failed_sources.push(FailedSource {
                    source_name: report.source_name.clone(),
                    error: report.error_message.clone().unwrap_or_default(),
                }),
            }
            summary.sources.push(report);
        }

        let prefix = &self.settings.cache_prefix;
        summary.cache_invalidated = match self.invalidator.invalidate(prefix).await {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, %prefix, "cache invalidation failed");
                false
            }
        };

        if self.settings.run_cleanup {
            summary.cleanup = Some(self.cleanup.run(false).await);
        }

        summary.finished_at = self.clock.now();
        info!(
            succeeded = summary.succeeded_sources.len(),
            failed = summary.failed_sources.len(),
            processed = summary.total_processed,
            errors = summary.total_errors,
            "ingestion cycle finished"
        );
        summary
    }

    /// Returns the report and how many status writes failed for this source.
    async fn run_source(
        &self,
        connector: &dyn Connector,
        ctx: &ConnectorContext,
        resolver: Result<&OrganizationResolver, &String>,
    ) -> (SourceRunReport, u32) {
        let timer = Instant::now();
        let source_name = connector.source_name();
        let mut report = SourceRunReport::new(source_name);
        let mut write_failures = 0;

        let run_id = match self.tracker.begin(source_name).await {
            Ok(run_id) => run_id,
            Err(err) => {
                error!(error = %err, "could not record run start; skipping source");
                report.outcome = RunOutcome::Failed;
                report.error_message =
                    Some(SourceFailure::StatusUnavailable(err.to_string()).to_string());
                return (report, 1);
            }
        };
        report.run_id = Some(run_id);

        let result = match resolver {
            Ok(resolver) => self.ingest(connector, ctx, resolver, &mut report).await,
            Err(message) => Err(SourceFailure::Catalogue(message.clone())),
        };
        if let Err(failure) = result {
            error!(
                error = %failure,
                pages = report.pages,
                processed = report.processed,
                "source run failed"
            );
            report.outcome = RunOutcome::Failed;
            report.error_message = Some(failure.to_string());
        }

        report.live_count = match self
            .stores
            .jobs
            .count_live_jobs(source_name, self.clock.now())
            .await
        {
            Ok(count) => count,
            Err(err) => {
                warn!(error = %err, "could not count live jobs");
                0
            }
        };
        report.duration_ms = timer.elapsed().as_millis() as u64;

        if let Err(err) = self.tracker.finish(run_id, report.outcome, report.stats()).await {
            error!(error = %err, run_id, "could not record run result");
            write_failures += 1;
        }
        (report, write_failures)
    }

    async fn ingest(
        &self,
        connector: &dyn Connector,
        ctx: &ConnectorContext,
        resolver: &OrganizationResolver,
        report: &mut SourceRunReport,
    ) -> Result<(), SourceFailure> {
        let declared_limit = connector.max_pages();
        let limit = declared_limit
            .unwrap_or(self.settings.page_limit)
            .min(self.settings.page_limit);
        let mut cursor = PageCursor::Start;

        loop {
            if report.pages >= limit {
                return match declared_limit {
                    Some(max) if max <= self.settings.page_limit => {
                        info!(max_pages = max, "declared page limit reached");
                        Ok(())
                    }
                    _ => Err(SourceFailure::PageLimit(limit)),
                };
            }
            let page = connector.fetch_page(&self.http, ctx, &cursor).await?;
            report.pages += 1;
            debug!(%cursor, items = page.items.len(), "page fetched");

            for raw in &page.items {
                report.processed += 1;
                let Some(mut candidate) = connector.normalize(raw) else {
                    report.errors += 1;
                    debug!("item could not be normalized");
                    continue;
                };
                if candidate.organization_id.is_none() {
                    let department = candidate.department_text.as_deref().unwrap_or_default();
                    candidate.organization_id = Some(resolver.resolve(department));
                }
                match self.upsert.merge(candidate).await {
                    Ok(MergeAction::Inserted) => {
                        report.success += 1;
                        report.inserted += 1;
                    }
                    Ok(MergeAction::Updated) => {
                        report.success += 1;
                        report.updated += 1;
                    }
                    Err(err) => {
                        report.errors += 1;
                        if err.is_validation() {
                            debug!(error = %err, "item dropped");
                        } else {
                            warn!(error = %err, "item not persisted");
                        }
                    }
                }
            }

            if !page.has_more {
                return Ok(());
            }
            if page.next_cursor == cursor {
                return Err(SourceFailure::StalledCursor(cursor));
            }
            cursor = page.next_cursor;
        }
    }
}
