//! Validated, natural-key merge of normalized candidates into the store.

use std::sync::Arc;

use jobfeed_core::{JobCandidate, MergeAction, ValidationError};
use jobfeed_storage::{JobStore, StoreError};
use thiserror::Error;
use tracing::debug;

use crate::clock::Clock;

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("invalid candidate from {source_name}: {source}")]
    Validation {
        source_name: String,
        source: ValidationError,
    },
    #[error("failed to persist {source_name}/{source_job_id}: {source}")]
    Persistence {
        source_name: String,
        source_job_id: String,
        source: StoreError,
    },
}

impl MergeError {
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }
}

#[derive(Clone)]
pub struct UpsertEngine {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
}

impl UpsertEngine {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Inserts the candidate or overwrites the row sharing its natural key. Invalid candidates
    /// never reach the store.
    pub async fn merge(&self, candidate: JobCandidate) -> Result<MergeAction, MergeError> {
        let source_name = candidate.source_name.clone();
        let job = candidate.validate().map_err(|source| MergeError::Validation {
            source_name: source_name.clone(),
            source,
        })?;

        let action = self
            .store
            .upsert_job(&job, self.clock.now())
            .await
            .map_err(|source| MergeError::Persistence {
                source_name,
                source_job_id: job.key.source_job_id.clone(),
                source,
            })?;
        debug!(key = %job.key, action = action.as_str(), "merged job");
        Ok(action)
    }
}
