//! Postgres backend.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobfeed_core::{
    JobId, JobRecord, MergeAction, NaturalKey, Organization, RunFinalization, RunId, RunState,
    RunStatus, ValidJob,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use crate::store::{JobStore, OrganizationStore, RunStatusStore, StoreError};

const JOB_COLUMNS: &str = "id, source_job_id, source_name, organization_id, title, description, \
     category_code, level, job_family, duty_station, recruitment_type, start_date, end_date, \
     department_text, apply_link, ingested_at";

const RUN_COLUMNS: &str = "id, source_name, state, processed_count, success_count, error_count, \
     error_message, start_time, end_time, duration_seconds, live_count, created_at";

const DELETE_CHUNK: usize = 1000;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn job_from_row(row: &PgRow) -> Result<JobRecord, StoreError> {
    Ok(JobRecord {
        id: row.try_get("id")?,
        source_job_id: row.try_get("source_job_id")?,
        source_name: row.try_get("source_name")?,
        organization_id: row.try_get("organization_id")?,
        title: row.try_get("title")?,
        description: row.try_get("description")?,
        category_code: row.try_get("category_code")?,
        level: row.try_get("level")?,
        job_family: row.try_get("job_family")?,
        duty_station: row.try_get("duty_station")?,
        recruitment_type: row.try_get("recruitment_type")?,
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
        department_text: row.try_get("department_text")?,
        apply_link: row.try_get("apply_link")?,
        ingested_at: row.try_get("ingested_at")?,
    })
}

fn run_from_row(row: &PgRow) -> Result<RunStatus, StoreError> {
    let state: String = row.try_get("state")?;
    let state = state.parse::<RunState>().map_err(StoreError::CorruptRow)?;
    Ok(RunStatus {
        id: row.try_get("id")?,
        source_name: row.try_get("source_name")?,
        state,
        processed_count: row.try_get("processed_count")?,
        success_count: row.try_get("success_count")?,
        error_count: row.try_get("error_count")?,
        error_message: row.try_get("error_message")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        duration_seconds: row.try_get("duration_seconds")?,
        live_count: row.try_get("live_count")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl JobStore for PgStore {
    #[instrument(skip(self, job), fields(key = %job.key))]
    async fn upsert_job(
        &self,
        job: &ValidJob,
        ingested_at: DateTime<Utc>,
    ) -> Result<MergeAction, StoreError> {
        // xmax = 0 only on the freshly inserted tuple
        let row = sqlx::query(
            r#"
            INSERT INTO job_record (
                source_job_id, source_name, organization_id, title, description,
                category_code, level, job_family, duty_station, recruitment_type,
                start_date, end_date, department_text, apply_link, ingested_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            ON CONFLICT (source_job_id, source_name, organization_id) DO UPDATE SET
                title = EXCLUDED.title,
                description = EXCLUDED.description,
                category_code = EXCLUDED.category_code,
                level = EXCLUDED.level,
                job_family = EXCLUDED.job_family,
                duty_station = EXCLUDED.duty_station,
                recruitment_type = EXCLUDED.recruitment_type,
                start_date = EXCLUDED.start_date,
                end_date = EXCLUDED.end_date,
                department_text = EXCLUDED.department_text,
                apply_link = EXCLUDED.apply_link,
                ingested_at = EXCLUDED.ingested_at
            RETURNING id, (xmax = 0) AS was_inserted
            "#,
        )
        .bind(&job.key.source_job_id)
        .bind(&job.key.source_name)
        .bind(job.key.organization_id)
        .bind(&job.title)
        .bind(&job.description)
        .bind(&job.category_code)
        .bind(&job.level)
        .bind(&job.job_family)
        .bind(&job.duty_station)
        .bind(&job.recruitment_type)
        .bind(job.start_date)
        .bind(job.end_date)
        .bind(&job.department_text)
        .bind(&job.apply_link)
        .bind(ingested_at)
        .fetch_one(&self.pool)
        .await?;

        let was_inserted: bool = row.try_get("was_inserted")?;
        Ok(if was_inserted {
            MergeAction::Inserted
        } else {
            MergeAction::Updated
        })
    }

    async fn get_job(&self, key: &NaturalKey) -> Result<Option<JobRecord>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM job_record \
             WHERE source_job_id = $1 AND source_name = $2 AND organization_id = $3"
        );
        let row = sqlx::query(&sql)
            .bind(&key.source_job_id)
            .bind(&key.source_name)
            .bind(key.organization_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn expired_jobs(&self, now: DateTime<Utc>) -> Result<Vec<JobRecord>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM job_record \
             WHERE end_date IS NOT NULL AND end_date < $1 \
             ORDER BY source_name, end_date, id"
        );
        let rows = sqlx::query(&sql).bind(now).fetch_all(&self.pool).await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn duplicate_candidates(&self) -> Result<Vec<JobRecord>, StoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM job_record j
             WHERE EXISTS (
                SELECT 1 FROM job_record d
                 WHERE d.id <> j.id
                   AND d.title = j.title
                   AND d.duty_station IS NOT DISTINCT FROM j.duty_station
                   AND d.source_name = j.source_name
                   AND d.organization_id = j.organization_id
             )
             ORDER BY source_name, organization_id, title, ingested_at DESC, id DESC
            "#
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self, ids), fields(count = ids.len()))]
    async fn delete_expired(&self, ids: &[JobId], now: DateTime<Utc>) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut deleted = 0u64;
        for chunk in ids.chunks(DELETE_CHUNK) {
            let result = sqlx::query(
                "DELETE FROM job_record WHERE id = ANY($1) AND end_date IS NOT NULL AND end_date < $2",
            )
            .bind(chunk.to_vec())
            .bind(now)
            .execute(&mut *tx)
            .await?;
            deleted += result.rows_affected();
        }
        tx.commit().await?;
        debug!(deleted, "deleted expired job rows");
        Ok(deleted)
    }

    #[instrument(skip(self, copies), fields(count = copies.len()))]
    async fn delete_stale_copies(
        &self,
        copies: &[(JobId, DateTime<Utc>)],
    ) -> Result<u64, StoreError> {
        if copies.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let mut deleted = 0u64;
        for chunk in copies.chunks(DELETE_CHUNK) {
            let ids: Vec<JobId> = chunk.iter().map(|(id, _)| *id).collect();
            let ingested: Vec<DateTime<Utc>> = chunk.iter().map(|(_, at)| *at).collect();
            let result = sqlx::query(
                r#"
                DELETE FROM job_record j
                 USING UNNEST($1::BIGINT[], $2::TIMESTAMPTZ[]) AS s(id, ingested_at)
                 WHERE j.id = s.id AND j.ingested_at = s.ingested_at
                "#,
            )
            .bind(ids)
            .bind(ingested)
            .execute(&mut *tx)
            .await?;
            deleted += result.rows_affected();
        }
        tx.commit().await?;
        debug!(deleted, "deleted duplicate job rows");
        Ok(deleted)
    }

    async fn count_live_jobs(
        &self,
        source_name: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS live
              FROM job_record
             WHERE source_name = $1
               AND (end_date IS NULL OR end_date >= $2)
            "#,
        )
        .bind(source_name)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("live")?)
    }

    async fn count_jobs(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM job_record")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("total")?)
    }
}

#[async_trait]
impl RunStatusStore for PgStore {
    async fn insert_running(
        &self,
        source_name: &str,
        start_time: DateTime<Utc>,
    ) -> Result<RunId, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO run_status (source_name, state, start_time, created_at)
            VALUES ($1, 'running', $2, $2)
            RETURNING id
            "#,
        )
        .bind(source_name)
        .bind(start_time)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("id")?)
    }

    #[instrument(skip(self, finalization), fields(run_id = finalization.run_id, state = %finalization.state))]
    async fn finalize_run(&self, finalization: &RunFinalization) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE run_status
               SET state = $2,
                   processed_count = $3,
                   success_count = $4,
                   error_count = $5,
                   error_message = $6,
                   live_count = $7,
                   end_time = $8,
                   duration_seconds = $9
             WHERE id = $1
               AND state = 'running'
            "#,
        )
        .bind(finalization.run_id)
        .bind(finalization.state.as_str())
        .bind(finalization.stats.processed_count)
        .bind(finalization.stats.success_count)
        .bind(finalization.stats.error_count)
        .bind(&finalization.stats.error_message)
        .bind(finalization.stats.live_count)
        .bind(finalization.end_time)
        .bind(finalization.duration_seconds)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_run(&self, run_id: RunId) -> Result<Option<RunStatus>, StoreError> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM run_status WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn latest_per_source(&self) -> Result<Vec<RunStatus>, StoreError> {
        let sql = format!(
            "SELECT DISTINCT ON (source_name) {RUN_COLUMNS} FROM run_status \
             ORDER BY source_name, created_at DESC, id DESC"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn run_history(
        &self,
        source_name: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<RunStatus>, StoreError> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM run_status WHERE source_name = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query(&sql)
            .bind(source_name)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn count_runs(&self, source_name: &str) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM run_status WHERE source_name = $1")
            .bind(source_name)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("total")?)
    }

    async fn runs_since(&self, since: DateTime<Utc>) -> Result<Vec<RunStatus>, StoreError> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM run_status WHERE created_at >= $1 \
             ORDER BY created_at DESC, id DESC"
        );
        let rows = sqlx::query(&sql).bind(since).fetch_all(&self.pool).await?;
        rows.iter().map(run_from_row).collect()
    }
}

#[async_trait]
impl OrganizationStore for PgStore {
    async fn organizations(&self) -> Result<Vec<Organization>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, code, name, short_name, long_name
              FROM organization
             ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(Organization {
                id: row.try_get("id")?,
                code: row.try_get("code")?,
                name: row.try_get("name")?,
                short_name: row.try_get("short_name")?,
                long_name: row.try_get("long_name")?,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use jobfeed_core::{JobCandidate, RunStats};

    async fn store() -> Option<PgStore> {
        let url = std::env::var("DATABASE_URL").ok()?;
        let store = PgStore::connect(&url, 2).await.unwrap();
        store.migrate().await.unwrap();
        Some(store)
    }

    /// Source name no other test run shares, so assertions can filter on it.
    fn isolated_source(label: &str) -> String {
        format!("{label}-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default())
    }

    fn ts(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn job(id: &str, source: &str, title: &str, station: Option<&str>) -> ValidJob {
        JobCandidate {
            source_job_id: id.into(),
            source_name: source.into(),
            organization_id: Some(1),
            title: title.into(),
            duty_station: station.map(str::to_string),
            ..Default::default()
        }
        .validate()
        .unwrap()
    }

    async fn rows_for(store: &PgStore, source: &str) -> Vec<JobRecord> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM job_record WHERE source_name = $1 ORDER BY id");
        let rows = sqlx::query(&sql)
            .bind(source)
            .fetch_all(store.pool())
            .await
            .unwrap();
        rows.iter().map(|r| job_from_row(r).unwrap()).collect()
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn upsert_inserts_then_updates_the_same_row() {
        let Some(store) = store().await else { return };
        let source = isolated_source("upsert");

        let first = store
            .upsert_job(&job("1", &source, "Analyst", Some("Geneva")), ts(2026, 1, 1))
            .await
            .unwrap();
        let mut changed = job("1", &source, "Senior Analyst", Some("Geneva"));
        changed.end_date = Some(ts(2099, 1, 1));
        let second = store.upsert_job(&changed, ts(2026, 1, 2)).await.unwrap();

        assert_eq!(first, MergeAction::Inserted);
        assert_eq!(second, MergeAction::Updated);
        let rows = rows_for(&store, &source).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].title, "Senior Analyst");
        assert_eq!(rows[0].ingested_at, ts(2026, 1, 2));
        let fetched = store.get_job(&changed.key).await.unwrap().unwrap();
        assert_eq!(fetched.id, rows[0].id);
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn natural_key_constraint_rejects_a_second_row() {
        let Some(store) = store().await else { return };
        let source = isolated_source("constraint");
        let insert = "INSERT INTO job_record (source_job_id, source_name, organization_id, title) \
                      VALUES ('dup', $1, 1, 'Officer')";

        sqlx::query(insert).bind(&source).execute(store.pool()).await.unwrap();
        let err = sqlx::query(insert)
            .bind(&source)
            .execute(store.pool())
            .await
            .unwrap_err();
        assert!(err
            .as_database_error()
            .is_some_and(|e| e.constraint() == Some("job_record_natural_key")));
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn duplicate_candidates_group_missing_stations_together() {
        let Some(store) = store().await else { return };
        let source = isolated_source("duplicates");
        for (id, station) in [("a", None), ("b", None), ("c", Some("Rome")), ("d", Some("Oslo"))] {
            store
                .upsert_job(&job(id, &source, "Driver", station), ts(2026, 2, 1))
                .await
                .unwrap();
        }

        let ids: Vec<String> = store
            .duplicate_candidates()
            .await
            .unwrap()
            .into_iter()
            .filter(|j| j.source_name == source)
            .map(|j| j.source_job_id)
            .collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"a".to_string()) && ids.contains(&"b".to_string()));
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn guarded_deletes_keep_rows_changed_since_selection() {
        let Some(store) = store().await else { return };
        let source = isolated_source("deletes");
        let now = ts(2026, 3, 1);
        let mut expired = job("old", &source, "Clerk", None);
        expired.end_date = Some(ts(2026, 2, 1));
        let mut reopened = job("reopened", &source, "Clerk", Some("Lima"));
        reopened.end_date = Some(ts(2026, 2, 1));
        store.upsert_job(&expired, ts(2026, 1, 1)).await.unwrap();
        store.upsert_job(&reopened, ts(2026, 1, 1)).await.unwrap();

        let selected: Vec<JobId> = store
            .expired_jobs(now)
            .await
            .unwrap()
            .into_iter()
            .filter(|j| j.source_name == source)
            .map(|j| j.id)
            .collect();
        assert_eq!(selected.len(), 2);
        reopened.end_date = Some(ts(2026, 6, 1));
        store.upsert_job(&reopened, ts(2026, 3, 1)).await.unwrap();

        assert_eq!(store.delete_expired(&selected, now).await.unwrap(), 1);
        let rows = rows_for(&store, &source).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].source_job_id, "reopened");

        let stale = vec![(rows[0].id, ts(2026, 1, 1))];
        assert_eq!(store.delete_stale_copies(&stale).await.unwrap(), 0);
        let current = vec![(rows[0].id, rows[0].ingested_at)];
        assert_eq!(store.delete_stale_copies(&current).await.unwrap(), 1);
        assert!(rows_for(&store, &source).await.is_empty());
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn runs_finalize_once_and_latest_wins() {
        let Some(store) = store().await else { return };
        let source = isolated_source("runs");
        let first = store.insert_running(&source, ts(2026, 4, 1)).await.unwrap();
        let second = store.insert_running(&source, ts(2026, 4, 2)).await.unwrap();

        let finalization = RunFinalization {
            run_id: first,
            state: RunState::Success,
            stats: RunStats {
                processed_count: 3,
                success_count: 2,
                error_count: 1,
                live_count: 2,
                error_message: None,
            },
            end_time: ts(2026, 4, 1),
            duration_seconds: 1.5,
        };
        assert!(store.finalize_run(&finalization).await.unwrap());
        let again = RunFinalization {
            state: RunState::Failed,
            ..finalization
        };
        assert!(!store.finalize_run(&again).await.unwrap());

        let run = store.get_run(first).await.unwrap().unwrap();
        assert_eq!(run.state, RunState::Success);
        assert_eq!(run.processed_count, 3);

        let latest: Vec<RunStatus> = store
            .latest_per_source()
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.source_name == source)
            .collect();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].id, second);
        assert_eq!(latest[0].state, RunState::Running);
        assert_eq!(store.count_runs(&source).await.unwrap(), 2);
        let history = store.run_history(&source, 1, 1).await.unwrap();
        assert_eq!(history[0].id, first);
    }
}
