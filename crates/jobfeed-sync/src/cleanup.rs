//! Reconciliation pass: removes expired vacancies and stale copies of the same posting.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use jobfeed_core::{CleanupStats, DuplicateGroupKey, JobId, JobRecord};
use jobfeed_storage::{JobStore, StoreError};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};

use crate::clock::Clock;
use crate::invalidate::Invalidator;

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("selecting expired jobs failed: {0}")]
    SelectExpired(#[source] StoreError),
    #[error("deleting expired jobs failed: {0}")]
    DeleteExpired(#[source] StoreError),
    #[error("selecting duplicate jobs failed: {0}")]
    SelectDuplicates(#[source] StoreError),
    #[error("deleting duplicate jobs failed: {0}")]
    DeleteDuplicates(#[source] StoreError),
}

/// Rows to drop from each duplicate group: everything except the most recently ingested
/// (ties go to the higher id). Returns the number of groups and the ids to delete.
pub fn select_stale_copies(rows: Vec<JobRecord>) -> (u64, Vec<JobRecord>) {
    let mut groups: BTreeMap<DuplicateGroupKey, Vec<JobRecord>> = BTreeMap::new();
    for row in rows {
        groups.entry(row.duplicate_group_key()).or_default().push(row);
    }
    let mut group_count = 0;
    let mut stale = Vec::new();
    for (_, mut members) in groups {
        if members.len() < 2 {
            continue;
        }
        group_count += 1;
        members.sort_by(|a, b| b.ingested_at.cmp(&a.ingested_at).then(b.id.cmp(&a.id)));
        stale.extend(members.into_iter().skip(1));
    }
    (group_count, stale)
}

pub struct CleanupEngine {
    store: Arc<dyn JobStore>,
    invalidator: Arc<dyn Invalidator>,
    clock: Arc<dyn Clock>,
    cache_prefix: String,
}

impl CleanupEngine {
    pub fn new(
        store: Arc<dyn JobStore>,
        invalidator: Arc<dyn Invalidator>,
        clock: Arc<dyn Clock>,
        cache_prefix: impl Into<String>,
    ) -> Self {
        Self {
            store,
            invalidator,
            clock,
            cache_prefix: cache_prefix.into(),
        }
    }

    /// Runs the expired pass then the duplicate pass. Never fails: pass errors are logged and
    /// collected in `errors`. With `dry_run` nothing is deleted but the same numbers are
    /// reported.
    pub async fn run(&self, dry_run: bool) -> CleanupStats {
        let span = info_span!("cleanup", dry_run);
        async {
            let now = self.clock.now();
            let timer = Instant::now();
            let mut stats = CleanupStats::new(dry_run, now);

            let expired_ids = match self.expired_pass(dry_run, now, &mut stats).await {
                Ok(ids) => ids,
                Err((ids, err)) => {
                    error!(error = %err, "expired pass failed");
                    stats.errors.push(err.to_string());
                    ids
                }
            };
            if let Err(err) = self.duplicate_pass(dry_run, &expired_ids, &mut stats).await {
                error!(error = %err, "duplicate pass failed");
                stats.errors.push(err.to_string());
            }

            if !dry_run && stats.total_deleted() > 0 {
                if let Err(err) = self.invalidator.invalidate(&self.cache_prefix).await {
                    warn!(
                        error = %err,
                        prefix = %self.cache_prefix,
                        "cache invalidation after cleanup failed"
                    );
                }
            }

            stats.duration_ms = timer.elapsed().as_millis() as u64;
            info!(
                expired_found = stats.expired_found,
                expired_deleted = stats.expired_deleted,
                duplicate_groups = stats.duplicate_groups,
                duplicates_found = stats.duplicates_found,
                duplicates_deleted = stats.duplicates_deleted,
                errors = stats.errors.len(),
                duration_ms = stats.duration_ms,
                "cleanup finished"
            );
            stats
        }
        .instrument(span)
        .await
    }

    /// Returns the ids the pass selected, which the duplicate pass must not count again.
    async fn expired_pass(
        &self,
        dry_run: bool,
        now: DateTime<Utc>,
        stats: &mut CleanupStats,
    ) -> Result<HashSet<JobId>, (HashSet<JobId>, CleanupError)> {
        let expired = self
            .store
            .expired_jobs(now)
            .await
            .map_err(|e| (HashSet::new(), CleanupError::SelectExpired(e)))?;

        let ids: HashSet<JobId> = expired.iter().map(|j| j.id).collect();
        for job in &expired {
            let entry = stats.per_source.entry(job.source_name.clone()).or_default();
            entry.expired += 1;
            if let Some(end) = job.end_date {
                entry.oldest_expiry = Some(entry.oldest_expiry.map_or(end, |o| o.min(end)));
                entry.newest_expiry = Some(entry.newest_expiry.map_or(end, |n| n.max(end)));
            }
        }
        stats.expired_found = expired.len() as u64;

        if dry_run || expired.is_empty() {
            stats.expired_deleted = stats.expired_found;
            return Ok(ids);
        }
        // the delete re-checks the deadline; a row refreshed since selection survives
        let to_delete: Vec<JobId> = expired.iter().map(|j| j.id).collect();
        match self.store.delete_expired(&to_delete, now).await {
            Ok(deleted) => {
                stats.expired_deleted = deleted;
                Ok(ids)
            }
            Err(e) => Err((ids, CleanupError::DeleteExpired(e))),
        }
    }

    async fn duplicate_pass(
        &self,
        dry_run: bool,
        exclude: &HashSet<JobId>,
        stats: &mut CleanupStats,
    ) -> Result<(), CleanupError> {
        let candidates: Vec<JobRecord> = self
            .store
            .duplicate_candidates()
            .await
            .map_err(CleanupError::SelectDuplicates)?
            .into_iter()
            .filter(|j| !exclude.contains(&j.id))
            .collect();

        let (groups, stale) = select_stale_copies(candidates);
        stats.duplicate_groups = groups;
        stats.duplicates_found = stale.len() as u64;
        for job in &stale {
            stats
                .per_source
                .entry(job.source_name.clone())
                .or_default()
                .duplicates += 1;
        }

        if dry_run || stale.is_empty() {
            stats.duplicates_deleted = stats.duplicates_found;
            return Ok(());
        }
        let copies: Vec<(JobId, DateTime<Utc>)> =
            stale.iter().map(|j| (j.id, j.ingested_at)).collect();
        stats.duplicates_deleted = self
            .store
            .delete_stale_copies(&copies)
            .await
            .map_err(CleanupError::DeleteDuplicates)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::invalidate::testing::RecordingInvalidator;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use jobfeed_core::{JobCandidate, MergeAction, NaturalKey, ValidJob};
    use jobfeed_storage::MemoryStore;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap()
    }

    fn record(
        source_job_id: &str,
        title: &str,
        end_date: Option<DateTime<Utc>>,
        ingested_at: DateTime<Utc>,
    ) -> JobRecord {
        JobRecord {
            id: 0,
            source_job_id: source_job_id.into(),
            source_name: "undp".into(),
            organization_id: 7,
            title: title.into(),
            description: None,
            category_code: None,
            level: None,
            job_family: None,
            duty_station: Some("Nairobi".into()),
            recruitment_type: None,
            start_date: None,
            end_date,
            department_text: None,
            apply_link: None,
            ingested_at,
        }
    }

    fn engine(
        store: Arc<MemoryStore>,
        invalidator: Arc<RecordingInvalidator>,
    ) -> CleanupEngine {
        CleanupEngine::new(store, invalidator, Arc::new(ManualClock::new(now())), "jobs:")
    }

    async fn seeded() -> (Arc<MemoryStore>, Vec<JobId>) {
        let store = Arc::new(MemoryStore::new());
        let day = Duration::days(1);
        let ids = vec![
            // expired
            store.insert_raw(record("1", "Clerk", Some(now() - day), now() - day * 10)).await,
            // deadline exactly now is still live
            store.insert_raw(record("2", "Driver", Some(now()), now() - day)).await,
            // no deadline
            store.insert_raw(record("3", "Nurse", None, now() - day)).await,
            // duplicate group: two copies of "Analyst", newer one survives
            store.insert_raw(record("4", "Analyst", Some(now() + day), now() - day * 3)).await,
            store.insert_raw(record("5", "Analyst", Some(now() + day), now() - day)).await,
        ];
        (store, ids)
    }

    #[test]
    fn newest_copy_survives_and_ties_go_to_higher_id() {
        let t = now();
        let mut a = record("a", "Analyst", None, t);
        a.id = 1;
        let mut b = record("b", "Analyst", None, t);
        b.id = 2;
        let mut c = record("c", "Analyst", None, t - Duration::hours(1));
        c.id = 3;
        let (groups, stale) = select_stale_copies(vec![a, b, c]);
        assert_eq!(groups, 1);
        let mut ids: Vec<_> = stale.iter().map(|j| j.id).collect();
        ids.sort();
        assert_eq!(ids, vec![1, 3]);
    }

    #[test]
    fn different_stations_are_not_duplicates() {
        let t = now();
        let a = record("a", "Analyst", None, t);
        let mut b = record("b", "Analyst", None, t);
        b.duty_station = Some("Geneva".into());
        let (groups, stale) = select_stale_copies(vec![a, b]);
        assert_eq!(groups, 0);
        assert!(stale.is_empty());
    }

    #[tokio::test]
    async fn live_run_removes_expired_and_stale_copies() {
        let (store, ids) = seeded().await;
        let invalidator = Arc::new(RecordingInvalidator::default());
        let stats = engine(store.clone(), invalidator.clone()).run(false).await;

        assert_eq!(stats.expired_found, 1);
        assert_eq!(stats.expired_deleted, 1);
        assert_eq!(stats.duplicate_groups, 1);
        assert_eq!(stats.duplicates_deleted, 1);
        assert!(!stats.has_errors());
        let per_source = &stats.per_source["undp"];
        assert_eq!(per_source.expired, 1);
        assert_eq!(per_source.duplicates, 1);
        assert_eq!(per_source.oldest_expiry, Some(now() - Duration::days(1)));

        let remaining: Vec<_> = store.all_jobs().await.iter().map(|j| j.id).collect();
        assert_eq!(remaining, vec![ids[1], ids[2], ids[4]]);
        assert_eq!(invalidator.calls(), vec!["jobs:".to_string()]);
    }

    #[tokio::test]
    async fn dry_run_reports_the_same_numbers_without_deleting() {
        let (store, _) = seeded().await;
        let invalidator = Arc::new(RecordingInvalidator::default());
        let before = store.all_jobs().await;
        let dry = engine(store.clone(), invalidator.clone()).run(true).await;
        assert_eq!(store.all_jobs().await, before);
        assert!(invalidator.calls().is_empty());

        let live = engine(store.clone(), invalidator.clone()).run(false).await;
        assert!(dry.dry_run);
        assert_eq!(dry.expired_found, live.expired_found);
        assert_eq!(dry.expired_deleted, live.expired_deleted);
        assert_eq!(dry.duplicate_groups, live.duplicate_groups);
        assert_eq!(dry.duplicates_found, live.duplicates_found);
        assert_eq!(dry.duplicates_deleted, live.duplicates_deleted);
        assert_eq!(dry.per_source, live.per_source);
    }

    #[tokio::test]
    async fn expired_copies_are_not_counted_twice() {
        let store = Arc::new(MemoryStore::new());
        let past = Some(now() - Duration::days(2));
        store.insert_raw(record("1", "Analyst", past, now() - Duration::days(5))).await;
        store.insert_raw(record("2", "Analyst", past, now() - Duration::days(4))).await;
        let stats = engine(store.clone(), Arc::new(RecordingInvalidator::default()))
            .run(false)
            .await;
        assert_eq!(stats.expired_deleted, 2);
        assert_eq!(stats.duplicate_groups, 0);
        assert_eq!(stats.duplicates_found, 0);
        assert_eq!(store.count_jobs().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn store_failures_are_recorded_not_raised() {
        let (store, _) = seeded().await;
        store.set_unavailable(true).await;
        let invalidator = Arc::new(RecordingInvalidator::default());
        let stats = engine(store.clone(), invalidator.clone()).run(false).await;
        assert_eq!(stats.errors.len(), 2);
        assert_eq!(stats.total_deleted(), 0);
        assert!(invalidator.calls().is_empty());
    }

    #[tokio::test]
    async fn invalidation_failure_does_not_affect_stats() {
        let (store, _) = seeded().await;
        let invalidator = Arc::new(RecordingInvalidator::failing());
        let stats = engine(store, invalidator.clone()).run(false).await;
        assert_eq!(stats.total_deleted(), 2);
        assert!(!stats.has_errors());
        assert_eq!(invalidator.calls().len(), 1);
    }

    #[derive(PartialEq)]
    enum Pass {
        Expired,
        Duplicates,
    }

    /// Re-ingests `refresh` just before the given pass deletes, like a merge landing between
    /// the cleanup's select and delete.
    struct RacingStore {
        inner: Arc<MemoryStore>,
        refresh: ValidJob,
        at: DateTime<Utc>,
        before: Pass,
    }

    impl RacingStore {
        async fn race(&self, pass: Pass) -> Result<(), StoreError> {
            if self.before == pass {
                self.inner.upsert_job(&self.refresh, self.at).await?;
            }
            Ok(())
        }
    }

    #[async_trait]
    impl JobStore for RacingStore {
        async fn upsert_job(
            &self,
            job: &ValidJob,
            ingested_at: DateTime<Utc>,
        ) -> Result<MergeAction, StoreError> {
            self.inner.upsert_job(job, ingested_at).await
        }

        async fn get_job(&self, key: &NaturalKey) -> Result<Option<JobRecord>, StoreError> {
            self.inner.get_job(key).await
        }

        async fn expired_jobs(&self, now: DateTime<Utc>) -> Result<Vec<JobRecord>, StoreError> {
            self.inner.expired_jobs(now).await
        }

        async fn duplicate_candidates(&self) -> Result<Vec<JobRecord>, StoreError> {
            self.inner.duplicate_candidates().await
        }

        async fn delete_expired(
            &self,
            ids: &[JobId],
            now: DateTime<Utc>,
        ) -> Result<u64, StoreError> {
            self.race(Pass::Expired).await?;
            self.inner.delete_expired(ids, now).await
        }

        async fn delete_stale_copies(
            &self,
            copies: &[(JobId, DateTime<Utc>)],
        ) -> Result<u64, StoreError> {
            self.race(Pass::Duplicates).await?;
            self.inner.delete_stale_copies(copies).await
        }

        async fn count_live_jobs(
            &self,
            source_name: &str,
            now: DateTime<Utc>,
        ) -> Result<i64, StoreError> {
            self.inner.count_live_jobs(source_name, now).await
        }

        async fn count_jobs(&self) -> Result<i64, StoreError> {
            self.inner.count_jobs().await
        }
    }

    fn reingested(source_job_id: &str, title: &str) -> ValidJob {
        JobCandidate {
            source_job_id: source_job_id.into(),
            source_name: "undp".into(),
            organization_id: Some(7),
            title: title.into(),
            duty_station: Some("Nairobi".into()),
            end_date: Some(now() + Duration::days(30)),
            ..Default::default()
        }
        .validate()
        .unwrap()
    }

    #[tokio::test]
    async fn row_reopened_after_selection_is_not_deleted_as_expired() {
        let (inner, _) = seeded().await;
        let store = Arc::new(RacingStore {
            inner: inner.clone(),
            refresh: reingested("1", "Clerk"),
            at: now(),
            before: Pass::Expired,
        });
        let stats = CleanupEngine::new(
            store,
            Arc::new(RecordingInvalidator::default()),
            Arc::new(ManualClock::new(now())),
            "jobs:",
        )
        .run(false)
        .await;

        assert_eq!(stats.expired_found, 1);
        assert_eq!(stats.expired_deleted, 0);
        let row = inner
            .get_job(&reingested("1", "Clerk").key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.end_date, Some(now() + Duration::days(30)));
    }

    #[tokio::test]
    async fn copy_reingested_after_selection_is_not_deleted_as_duplicate() {
        let (inner, _) = seeded().await;
        // "4" is the older Analyst copy; re-ingesting it makes it current again
        let store = Arc::new(RacingStore {
            inner: inner.clone(),
            refresh: reingested("4", "Analyst"),
            at: now(),
            before: Pass::Duplicates,
        });
        let stats = CleanupEngine::new(
            store,
            Arc::new(RecordingInvalidator::default()),
            Arc::new(ManualClock::new(now())),
            "jobs:",
        )
        .run(false)
        .await;

        assert_eq!(stats.duplicates_found, 1);
        assert_eq!(stats.duplicates_deleted, 0);
        assert!(inner
            .get_job(&reingested("4", "Analyst").key)
            .await
            .unwrap()
            .is_some());
    }
}
