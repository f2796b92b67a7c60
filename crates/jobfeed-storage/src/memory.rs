//! In-process backend with the same contract as Postgres. Backs tests and local dry runs.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobfeed_core::{
    DuplicateGroupKey, JobId, JobRecord, MergeAction, NaturalKey, Organization, RunFinalization,
    RunId, RunState, RunStatus, ValidJob,
};
use tokio::sync::Mutex;

use crate::store::{JobStore, OrganizationStore, RunStatusStore, StoreError};

#[derive(Debug, Default)]
struct MemoryState {
    // Keyed on the natural key, so a second row for the same key cannot exist.
    jobs: BTreeMap<NaturalKey, JobRecord>,
    next_job_id: JobId,
    runs: Vec<RunStatus>,
    next_run_id: RunId,
    organizations: Vec<Organization>,
    failing_upserts: usize,
    unavailable: bool,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_organizations(organizations: Vec<Organization>) -> Self {
        let mut sorted = organizations;
        sorted.sort_by_key(|o| o.id);
        Self {
            state: Mutex::new(MemoryState {
                organizations: sorted,
                ..Default::default()
            }),
        }
    }

    /// Makes the next `count` upserts fail with a storage error.
    pub async fn fail_next_upserts(&self, count: usize) {
        self.state.lock().await.failing_upserts = count;
    }

    /// Simulates a lost database connection for every operation.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    /// Inserts a row verbatim, bypassing the natural-key check. Models rows written before
    /// the constraint existed or under a drifted key shape.
    pub async fn insert_raw(&self, mut record: JobRecord) -> JobId {
        let mut state = self.state.lock().await;
        state.next_job_id += 1;
        record.id = state.next_job_id;
        let mut key = record.natural_key();
        while state.jobs.contains_key(&key) {
            key.source_job_id.push('~');
        }
        state.jobs.insert(key, record);
        state.next_job_id
    }

    pub async fn all_jobs(&self) -> Vec<JobRecord> {
        let state = self.state.lock().await;
        let mut jobs: Vec<_> = state.jobs.values().cloned().collect();
        jobs.sort_by_key(|j| j.id);
        jobs
    }

    pub async fn all_runs(&self) -> Vec<RunStatus> {
        self.state.lock().await.runs.clone()
    }
}

fn check_available(state: &MemoryState) -> Result<(), StoreError> {
    if state.unavailable {
        return Err(StoreError::Unavailable("memory store marked unavailable".into()));
    }
    Ok(())
}

fn newest_first(a: &RunStatus, b: &RunStatus) -> std::cmp::Ordering {
    b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id))
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn upsert_job(
        &self,
        job: &ValidJob,
        ingested_at: DateTime<Utc>,
    ) -> Result<MergeAction, StoreError> {
        let mut state = self.state.lock().await;
        check_available(&state)?;
        if state.failing_upserts > 0 {
            state.failing_upserts -= 1;
            return Err(StoreError::Unavailable(format!(
                "injected upsert failure for {}",
                job.key
            )));
        }

        if let Some(existing) = state.jobs.get_mut(&job.key) {
            let id = existing.id;
            *existing = JobRecord::from_valid(id, job, ingested_at);
            return Ok(MergeAction::Updated);
        }

        state.next_job_id += 1;
        let id = state.next_job_id;
        state
            .jobs
            .insert(job.key.clone(), JobRecord::from_valid(id, job, ingested_at));
        Ok(MergeAction::Inserted)
    }

    async fn get_job(&self, key: &NaturalKey) -> Result<Option<JobRecord>, StoreError> {
        let state = self.state.lock().await;
        check_available(&state)?;
        Ok(state.jobs.get(key).cloned())
    }

    async fn expired_jobs(&self, now: DateTime<Utc>) -> Result<Vec<JobRecord>, StoreError> {
        let state = self.state.lock().await;
        check_available(&state)?;
        let mut rows: Vec<_> = state
            .jobs
            .values()
            .filter(|j| j.end_date.is_some_and(|end| end < now))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            a.source_name
                .cmp(&b.source_name)
                .then(a.end_date.cmp(&b.end_date))
                .then(a.id.cmp(&b.id))
        });
        Ok(rows)
    }

    async fn duplicate_candidates(&self) -> Result<Vec<JobRecord>, StoreError> {
        let state = self.state.lock().await;
        check_available(&state)?;
        let mut groups: HashMap<DuplicateGroupKey, Vec<JobRecord>> = HashMap::new();
        for job in state.jobs.values() {
            groups
                .entry(job.duplicate_group_key())
                .or_default()
                .push(job.clone());
        }
        let mut rows: Vec<_> = groups
            .into_values()
            .filter(|members| members.len() > 1)
            .flatten()
            .collect();
        rows.sort_by_key(|j| j.id);
        Ok(rows)
    }

    async fn delete_expired(&self, ids: &[JobId], now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        check_available(&state)?;
        let before = state.jobs.len();
        state.jobs.retain(|_, job| {
            !(ids.contains(&job.id) && job.end_date.is_some_and(|end| end < now))
        });
        Ok((before - state.jobs.len()) as u64)
    }

    async fn delete_stale_copies(
        &self,
        copies: &[(JobId, DateTime<Utc>)],
    ) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        check_available(&state)?;
        let before = state.jobs.len();
        state
            .jobs
            .retain(|_, job| !copies.contains(&(job.id, job.ingested_at)));
        Ok((before - state.jobs.len()) as u64)
    }

    async fn count_live_jobs(
        &self,
        source_name: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let state = self.state.lock().await;
        check_available(&state)?;
        Ok(state
            .jobs
            .values()
            .filter(|j| j.source_name == source_name && j.is_live_at(now))
            .count() as i64)
    }

    async fn count_jobs(&self) -> Result<i64, StoreError> {
        let state = self.state.lock().await;
        check_available(&state)?;
        Ok(state.jobs.len() as i64)
    }
}

#[async_trait]
impl RunStatusStore for MemoryStore {
    async fn insert_running(
        &self,
        source_name: &str,
        start_time: DateTime<Utc>,
    ) -> Result<RunId, StoreError> {
        let mut state = self.state.lock().await;
        check_available(&state)?;
        state.next_run_id += 1;
        let id = state.next_run_id;
        state.runs.push(RunStatus {
            id,
            source_name: source_name.to_string(),
            state: RunState::Running,
            processed_count: 0,
            success_count: 0,
            error_count: 0,
            error_message: None,
            start_time,
            end_time: None,
            duration_seconds: None,
            live_count: 0,
            created_at: start_time,
        });
        Ok(id)
    }

    async fn finalize_run(&self, finalization: &RunFinalization) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        check_available(&state)?;
        let Some(run) = state
            .runs
            .iter_mut()
            .find(|r| r.id == finalization.run_id && r.state == RunState::Running)
        else {
            return Ok(false);
        };
        run.state = finalization.state;
        run.processed_count = finalization.stats.processed_count;
        run.success_count = finalization.stats.success_count;
        run.error_count = finalization.stats.error_count;
        run.error_message = finalization.stats.error_message.clone();
        run.live_count = finalization.stats.live_count;
        run.end_time = Some(finalization.end_time);
        run.duration_seconds = Some(finalization.duration_seconds);
        Ok(true)
    }

    async fn get_run(&self, run_id: RunId) -> Result<Option<RunStatus>, StoreError> {
        let state = self.state.lock().await;
        check_available(&state)?;
        Ok(state.runs.iter().find(|r| r.id == run_id).cloned())
    }

    async fn latest_per_source(&self) -> Result<Vec<RunStatus>, StoreError> {
        let state = self.state.lock().await;
        check_available(&state)?;
        let mut latest: BTreeMap<String, RunStatus> = BTreeMap::new();
        for run in &state.runs {
            match latest.get(&run.source_name) {
                Some(current) if newest_first(run, current).is_gt() => {}
                _ => {
                    latest.insert(run.source_name.clone(), run.clone());
                }
            }
        }
        Ok(latest.into_values().collect())
    }

    async fn run_history(
        &self,
        source_name: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RunStatus>, StoreError> {
        let state = self.state.lock().await;
        check_available(&state)?;
        let mut runs: Vec<_> = state
            .runs
            .iter()
            .filter(|r| r.source_name == source_name)
            .cloned()
            .collect();
        runs.sort_by(newest_first);
        Ok(runs
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn count_runs(&self, source_name: &str) -> Result<i64, StoreError> {
        let state = self.state.lock().await;
        check_available(&state)?;
        Ok(state
            .runs
            .iter()
            .filter(|r| r.source_name == source_name)
            .count() as i64)
    }

    async fn runs_since(&self, since: DateTime<Utc>) -> Result<Vec<RunStatus>, StoreError> {
        let state = self.state.lock().await;
        check_available(&state)?;
        let mut runs: Vec<_> = state
            .runs
            .iter()
            .filter(|r| r.created_at >= since)
            .cloned()
            .collect();
        runs.sort_by(newest_first);
        Ok(runs)
    }
}

#[async_trait]
impl OrganizationStore for MemoryStore {
    async fn organizations(&self) -> Result<Vec<Organization>, StoreError> {
        let state = self.state.lock().await;
        check_available(&state)?;
        Ok(state.organizations.clone())
    }
}
