//! Storage seams shared by the Postgres and in-memory backends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobfeed_core::{
    JobId, JobRecord, MergeAction, NaturalKey, Organization, RunFinalization, RunId, RunStatus,
    ValidJob,
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt row: {0}")]
    CorruptRow(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Vacancy table operations.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Inserts the job, or overwrites every mutable column of the row with the same natural
    /// key and refreshes `ingested_at`. One atomic statement; the natural-key uniqueness is
    /// enforced by the backend itself.
    async fn upsert_job(
        &self,
        job: &ValidJob,
        ingested_at: DateTime<Utc>,
    ) -> Result<MergeAction, StoreError>;

    async fn get_job(&self, key: &NaturalKey) -> Result<Option<JobRecord>, StoreError>;

    /// Rows whose `end_date` is strictly before `now`.
    async fn expired_jobs(&self, now: DateTime<Utc>) -> Result<Vec<JobRecord>, StoreError>;

    /// Every row belonging to a `(title, duty_station, source_name, organization_id)` group
    /// with more than one member.
    async fn duplicate_candidates(&self) -> Result<Vec<JobRecord>, StoreError>;

    /// Deletes the given rows in one transaction, skipping any whose `end_date` is no longer
    /// strictly before `now`. Returns how many were removed.
    async fn delete_expired(&self, ids: &[JobId], now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Deletes each `(id, ingested_at)` row in one transaction, skipping rows re-ingested since
    /// they were selected. Returns how many were removed.
    async fn delete_stale_copies(
        &self,
        copies: &[(JobId, DateTime<Utc>)],
    ) -> Result<u64, StoreError>;

    async fn count_live_jobs(
        &self,
        source_name: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError>;

    async fn count_jobs(&self) -> Result<i64, StoreError>;
}

/// Append-only run log operations.
#[async_trait]
pub trait RunStatusStore: Send + Sync {
    async fn insert_running(
        &self,
        source_name: &str,
        start_time: DateTime<Utc>,
    ) -> Result<RunId, StoreError>;

    /// Writes terminal values onto a row that is still `running`. Returns `false` when no such
    /// row exists, which leaves finished rows untouched.
    async fn finalize_run(&self, finalization: &RunFinalization) -> Result<bool, StoreError>;

    async fn get_run(&self, run_id: RunId) -> Result<Option<RunStatus>, StoreError>;

    /// Most recent row per source, ordered by source name.
    async fn latest_per_source(&self) -> Result<Vec<RunStatus>, StoreError>;

    /// Newest first.
    async fn run_history(
        &self,
        source_name: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RunStatus>, StoreError>;

    async fn count_runs(&self, source_name: &str) -> Result<i64, StoreError>;

    async fn runs_since(&self, since: DateTime<Utc>) -> Result<Vec<RunStatus>, StoreError>;
}

#[async_trait]
pub trait OrganizationStore: Send + Sync {
    /// Known organizations ordered by id.
    async fn organizations(&self) -> Result<Vec<Organization>, StoreError>;
}
