//! Per-source run lifecycle and the health/statistics views derived from it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use jobfeed_core::{RunFinalization, RunId, RunOutcome, RunState, RunStats, RunStatus};
use jobfeed_storage::{RunStatusStore, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::clock::Clock;

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("run {0} not found")]
    NotFound(RunId),
    #[error("run {run_id} already finished as {state}")]
    AlreadyFinished { run_id: RunId, state: RunState },
    #[error(
        "run {run_id} reported inconsistent counts (processed {processed}, success {success}, error {error})"
    )]
    InvalidCounts {
        run_id: RunId,
        processed: i64,
        success: i64,
        error: i64,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct RunHistoryPage {
    pub source_name: String,
    pub page: usize,
    pub per_page: usize,
    pub total_runs: usize,
    pub total_pages: usize,
    pub runs: Vec<RunStatus>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceStatistics {
    pub runs: u64,
    pub successes: u64,
    pub failures: u64,
    pub average_duration_seconds: Option<f64>,
    pub last_live_count: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunStatistics {
    pub window_days: i64,
    pub since: DateTime<Utc>,
    pub total_runs: u64,
    pub successful_runs: u64,
    pub failed_runs: u64,
    pub running_runs: u64,
    pub average_duration_seconds: Option<f64>,
    /// Sum over sources of the live count from each source's most recent finished run.
    pub total_live_records: i64,
    pub per_source: BTreeMap<String, SourceStatistics>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StuckRun {
    pub run_id: RunId,
    pub source_name: String,
    pub start_time: DateTime<Utc>,
    pub running_minutes: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub checked_at: DateTime<Utc>,
    pub healthy: bool,
    pub known_sources: usize,
    pub active_sources_24h: usize,
    pub stuck_runs: Vec<StuckRun>,
    pub failing_sources: Vec<String>,
}

fn average(sum: f64, count: u64) -> Option<f64> {
    (count > 0).then(|| sum / count as f64)
}

#[derive(Clone)]
pub struct RunStatusTracker {
    store: Arc<dyn RunStatusStore>,
    clock: Arc<dyn Clock>,
    stale_after: Duration,
}

impl RunStatusTracker {
    pub fn new(store: Arc<dyn RunStatusStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            stale_after: Duration::minutes(120),
        }
    }

    /// Runs still `running` after this long are reported as stuck.
    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub async fn begin(&self, source_name: &str) -> Result<RunId, StatusError> {
        let run_id = self
            .store
            .insert_running(source_name, self.clock.now())
            .await?;
        debug!(source = source_name, run_id, "run started");
        Ok(run_id)
    }

    /// Moves a running row to its terminal state. Finishing a run twice is rejected.
    pub async fn finish(
        &self,
        run_id: RunId,
        outcome: RunOutcome,
        stats: RunStats,
    ) -> Result<RunStatus, StatusError> {
        if !stats.counts_consistent() {
            return Err(StatusError::InvalidCounts {
                run_id,
                processed: stats.processed_count,
                success: stats.success_count,
                error: stats.error_count,
            });
        }
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or(StatusError::NotFound(run_id))?;
        if run.state.is_terminal() {
            return Err(StatusError::AlreadyFinished {
                run_id,
                state: run.state,
            });
        }

        let end_time = self.clock.now().max(run.start_time);
        let duration_seconds = (end_time - run.start_time).num_milliseconds() as f64 / 1000.0;
        let finalization = RunFinalization {
            run_id,
            state: outcome.into(),
            stats,
            end_time,
            duration_seconds,
        };
        if !self.store.finalize_run(&finalization).await? {
            // lost a race with another writer
            let state = self
                .store
                .get_run(run_id)
                .await?
                .map(|r| r.state)
                .ok_or(StatusError::NotFound(run_id))?;
            return Err(StatusError::AlreadyFinished { run_id, state });
        }
        info!(
            source = %run.source_name,
            run_id,
            state = %finalization.state,
            processed = finalization.stats.processed_count,
            success = finalization.stats.success_count,
            errors = finalization.stats.error_count,
            live = finalization.stats.live_count,
            duration_seconds,
            "run finished"
        );
        self.store
            .get_run(run_id)
            .await?
            .ok_or(StatusError::NotFound(run_id))
    }

    /// Most recent run per source.
    pub async fn latest(&self) -> Result<Vec<RunStatus>, StatusError> {
        Ok(self.store.latest_per_source().await?)
    }

    pub async fn history(
        &self,
        source_name: &str,
        page: usize,
        per_page: usize,
    ) -> Result<RunHistoryPage, StatusError> {
        let per_page = per_page.clamp(1, 200);
        let total_runs = self.store.count_runs(source_name).await?.max(0) as usize;
        let total_pages = total_runs.max(1).div_ceil(per_page);
        let page = page.clamp(1, total_pages);
        let runs = self
            .store
            .run_history(
                source_name,
                per_page as i64,
                ((page - 1) * per_page) as i64,
            )
            .await?;
        Ok(RunHistoryPage {
            source_name: source_name.to_string(),
            page,
            per_page,
            total_runs,
            total_pages,
            runs,
        })
    }

    pub async fn statistics(&self, window_days: i64) -> Result<RunStatistics, StatusError> {
        let window_days = window_days.max(1);
        let since = self.clock.now() - Duration::days(window_days);
        // newest first
        let runs = self.store.runs_since(since).await?;

        let mut stats = RunStatistics {
            window_days,
            since,
            total_runs: runs.len() as u64,
            successful_runs: 0,
            failed_runs: 0,
            running_runs: 0,
            average_duration_seconds: None,
            total_live_records: 0,
            per_source: BTreeMap::new(),
        };
        let mut duration_sum = 0.0;
        let mut duration_count = 0u64;
        let mut per_source_durations: BTreeMap<String, (f64, u64)> = BTreeMap::new();
        let mut live_seen = BTreeSet::new();

        for run in &runs {
            let entry = stats.per_source.entry(run.source_name.clone()).or_default();
            entry.runs += 1;
            match run.state {
                RunState::Success => {
                    stats.successful_runs += 1;
                    entry.successes += 1;
                }
                RunState::Failed => {
                    stats.failed_runs += 1;
                    entry.failures += 1;
                }
                RunState::Running => stats.running_runs += 1,
            }
            if run.state.is_terminal() && live_seen.insert(run.source_name.clone()) {
                entry.last_live_count = run.live_count;
                stats.total_live_records += run.live_count;
            }
            if let Some(duration) = run.duration_seconds {
                duration_sum += duration;
                duration_count += 1;
                let slot = per_source_durations
                    .entry(run.source_name.clone())
                    .or_default();
                slot.0 += duration;
                slot.1 += 1;
            }
        }

        stats.average_duration_seconds = average(duration_sum, duration_count);
        for (source, (sum, count)) in per_source_durations {
            if let Some(entry) = stats.per_source.get_mut(&source) {
                entry.average_duration_seconds = average(sum, count);
            }
        }
        Ok(stats)
    }

    pub async fn health(&self) -> Result<HealthSnapshot, StatusError> {
        let now = self.clock.now();
        let latest = self.store.latest_per_source().await?;
        let recent = self.store.runs_since(now - Duration::hours(24)).await?;

        let stuck_runs: Vec<StuckRun> = latest
            .iter()
            .filter(|run| run.state == RunState::Running && now - run.start_time > self.stale_after)
            .map(|run| StuckRun {
                run_id: run.id,
                source_name: run.source_name.clone(),
                start_time: run.start_time,
                running_minutes: (now - run.start_time).num_minutes(),
            })
            .collect();
        let failing_sources: Vec<String> = latest
            .iter()
            .filter(|run| run.state == RunState::Failed)
            .map(|run| run.source_name.clone())
            .collect();
        let active_sources_24h = recent
            .iter()
            .map(|run| run.source_name.as_str())
            .collect::<BTreeSet<_>>()
            .len();

        Ok(HealthSnapshot {
            checked_at: now,
            healthy: stuck_runs.is_empty() && failing_sources.is_empty(),
            known_sources: latest.len(),
            active_sources_24h,
            stuck_runs,
            failing_sources,
        })
    }
}
