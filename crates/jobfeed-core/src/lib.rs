//! Core domain model for jobfeed: vacancy records, run status rows and cleanup statistics.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "jobfeed-core";

pub type JobId = i64;
pub type RunId = i64;
pub type OrganizationId = i64;

/// Natural key of a vacancy. Unique across the whole store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey {
    pub source_job_id: String,
    pub source_name: String,
    pub organization_id: OrganizationId,
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}@{}",
            self.source_name, self.source_job_id, self.organization_id
        )
    }
}

/// Grouping used by the duplicate cleanup pass. Rows sharing this key inside one source
/// are treated as copies of the same posting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DuplicateGroupKey {
    pub title: String,
    pub duty_station: Option<String>,
    pub source_name: String,
    pub organization_id: OrganizationId,
}

/// Normalized handoff contract from connectors into the merge pipeline.
///
/// `organization_id` is usually left empty by connectors and filled in by the
/// organization resolver from `department_text`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobCandidate {
    pub source_job_id: String,
    pub source_name: String,
    pub organization_id: Option<OrganizationId>,
    pub department_text: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub category_code: Option<String>,
    pub level: Option<String>,
    pub job_family: Option<String>,
    pub duty_station: Option<String>,
    pub recruitment_type: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub apply_link: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("required field `{0}` is missing or empty")]
    MissingField(&'static str),
}

impl JobCandidate {
    /// Checks the required fields and produces the write-ready form.
    pub fn validate(self) -> Result<ValidJob, ValidationError> {
        if self.source_job_id.trim().is_empty() {
            return Err(ValidationError::MissingField("source_job_id"));
        }
        if self.title.trim().is_empty() {
            return Err(ValidationError::MissingField("title"));
        }
        if self.source_name.trim().is_empty() {
            return Err(ValidationError::MissingField("source_name"));
        }
        let Some(organization_id) = self.organization_id else {
            return Err(ValidationError::MissingField("organization_id"));
        };

        Ok(ValidJob {
            key: NaturalKey {
                source_job_id: self.source_job_id.trim().to_string(),
                source_name: self.source_name.trim().to_string(),
                organization_id,
            },
            title: self.title.trim().to_string(),
            description: self.description,
            category_code: self.category_code,
            level: self.level,
            job_family: self.job_family,
            duty_station: self.duty_station,
            recruitment_type: self.recruitment_type,
            start_date: self.start_date,
            end_date: self.end_date,
            department_text: self.department_text,
            apply_link: self.apply_link,
        })
    }
}

/// A candidate that passed validation; every field the store requires is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidJob {
    pub key: NaturalKey,
    pub title: String,
    pub description: Option<String>,
    pub category_code: Option<String>,
    pub level: Option<String>,
    pub job_family: Option<String>,
    pub duty_station: Option<String>,
    pub recruitment_type: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub department_text: Option<String>,
    pub apply_link: Option<String>,
}

/// Canonical persisted vacancy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub source_job_id: String,
    pub source_name: String,
    pub organization_id: OrganizationId,
    pub title: String,
    pub description: Option<String>,
    pub category_code: Option<String>,
    pub level: Option<String>,
    pub job_family: Option<String>,
    pub duty_station: Option<String>,
    pub recruitment_type: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub department_text: Option<String>,
    pub apply_link: Option<String>,
    pub ingested_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            source_job_id: self.source_job_id.clone(),
            source_name: self.source_name.clone(),
            organization_id: self.organization_id,
        }
    }

    pub fn duplicate_group_key(&self) -> DuplicateGroupKey {
        DuplicateGroupKey {
            title: self.title.clone(),
            duty_station: self.duty_station.clone(),
            source_name: self.source_name.clone(),
            organization_id: self.organization_id,
        }
    }

    /// A record is live while its deadline is unknown or not yet in the past.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.end_date.map_or(true, |end| end >= now)
    }

    pub fn from_valid(id: JobId, job: &ValidJob, ingested_at: DateTime<Utc>) -> Self {
        Self {
            id,
            source_job_id: job.key.source_job_id.clone(),
            source_name: job.key.source_name.clone(),
            organization_id: job.key.organization_id,
            title: job.title.clone(),
            description: job.description.clone(),
            category_code: job.category_code.clone(),
            level: job.level.clone(),
            job_family: job.job_family.clone(),
            duty_station: job.duty_station.clone(),
            recruitment_type: job.recruitment_type.clone(),
            start_date: job.start_date,
            end_date: job.end_date,
            department_text: job.department_text.clone(),
            apply_link: job.apply_link.clone(),
            ingested_at,
        }
    }
}

/// Which branch of the insert-or-update fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeAction {
    Inserted,
    Updated,
}

impl MergeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inserted => "inserted",
            Self::Updated => "updated",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Success,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown run state: {other}")),
        }
    }
}

/// Terminal outcome passed when a run is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Failed,
}

impl From<RunOutcome> for RunState {
    fn from(outcome: RunOutcome) -> Self {
        match outcome {
            RunOutcome::Success => RunState::Success,
            RunOutcome::Failed => RunState::Failed,
        }
    }
}

/// Counters reported when a run is finished.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub processed_count: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub live_count: i64,
    pub error_message: Option<String>,
}

impl RunStats {
    pub fn counts_consistent(&self) -> bool {
        self.processed_count >= 0
            && self.success_count >= 0
            && self.error_count >= 0
            && self.success_count + self.error_count <= self.processed_count
    }
}

/// One row of the append-only run log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub id: RunId,
    pub source_name: String,
    pub state: RunState,
    pub processed_count: i64,
    pub success_count: i64,
    pub error_count: i64,
    pub error_message: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub live_count: i64,
    pub created_at: DateTime<Utc>,
}

/// Terminal values written onto a running row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunFinalization {
    pub run_id: RunId,
    pub state: RunState,
    pub stats: RunStats,
    pub end_time: DateTime<Utc>,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Organization {
    pub id: OrganizationId,
    pub code: String,
    pub name: String,
    pub short_name: Option<String>,
    pub long_name: Option<String>,
}

/// Per-source slice of a cleanup run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceCleanupStats {
    pub expired: u64,
    pub duplicates: u64,
    pub oldest_expiry: Option<DateTime<Utc>>,
    pub newest_expiry: Option<DateTime<Utc>>,
}

/// Result of one cleanup run.
///
/// In dry-run mode the `*_deleted` counters report the rows that would have been deleted,
/// so a dry run and a live run over the same data report the same numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupStats {
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    pub expired_found: u64,
    pub expired_deleted: u64,
    pub duplicate_groups: u64,
    pub duplicates_found: u64,
    pub duplicates_deleted: u64,
    pub per_source: BTreeMap<String, SourceCleanupStats>,
    pub duration_ms: u64,
    pub errors: Vec<String>,
}

impl CleanupStats {
    pub fn new(dry_run: bool, started_at: DateTime<Utc>) -> Self {
        Self {
            dry_run,
            started_at,
            expired_found: 0,
            expired_deleted: 0,
            duplicate_groups: 0,
            duplicates_found: 0,
            duplicates_deleted: 0,
            per_source: BTreeMap::new(),
            duration_ms: 0,
            errors: Vec::new(),
        }
    }

    pub fn total_deleted(&self) -> u64 {
        self.expired_deleted + self.duplicates_deleted
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candidate() -> JobCandidate {
        JobCandidate {
            source_job_id: " 42 ".into(),
            source_name: "x".into(),
            organization_id: Some(7),
            title: "Analyst".into(),
            ..Default::default()
        }
    }

    #[test]
    fn validate_trims_key_fields() {
        let job = candidate().validate().unwrap();
        assert_eq!(job.key.source_job_id, "42");
        assert_eq!(job.key.organization_id, 7);
    }

    #[test]
    fn validate_rejects_each_missing_required_field() {
        let mut c = candidate();
        c.source_job_id = "  ".into();
        assert_eq!(c.validate(), Err(ValidationError::MissingField("source_job_id")));

        let mut c = candidate();
        c.title.clear();
        assert_eq!(c.validate(), Err(ValidationError::MissingField("title")));

        let mut c = candidate();
        c.source_name.clear();
        assert_eq!(c.validate(), Err(ValidationError::MissingField("source_name")));

        let mut c = candidate();
        c.organization_id = None;
        assert_eq!(c.validate(), Err(ValidationError::MissingField("organization_id")));
    }

    #[test]
    fn liveness_treats_null_and_future_deadlines_as_live() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let job = candidate().validate().unwrap();
        let mut record = JobRecord::from_valid(1, &job, now);
        assert!(record.is_live_at(now));
        record.end_date = Some(now);
        assert!(record.is_live_at(now));
        record.end_date = Some(now - chrono::Duration::seconds(1));
        assert!(!record.is_live_at(now));
    }

    #[test]
    fn run_state_round_trips_through_strings() {
        for state in [RunState::Running, RunState::Success, RunState::Failed] {
            assert_eq!(state.as_str().parse::<RunState>().unwrap(), state);
        }
        assert!("stuck".parse::<RunState>().is_err());
        assert!(!RunState::Running.is_terminal());
        assert!(RunState::Failed.is_terminal());
    }

    #[test]
    fn run_stats_count_invariant() {
        let stats = RunStats {
            processed_count: 3,
            success_count: 2,
            error_count: 1,
            ..Default::default()
        };
        assert!(stats.counts_consistent());
        let bad = RunStats {
            processed_count: 1,
            success_count: 1,
            error_count: 1,
            ..Default::default()
        };
        assert!(!bad.counts_consistent());
    }
}
