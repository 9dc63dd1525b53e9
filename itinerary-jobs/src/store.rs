//! Persistence of itinerary file jobs.
//!
//! [`JobStore`] is the only component that writes job state. Implementations provide the raw
//! persistence primitives; the state machine transitions ([`JobStore::start`],
//! [`JobStore::complete`], [`JobStore::fail`] and [`JobStore::stop`]) are provided on top of them.
//!
//! Every transition is computed on a copy of the job and only written back to the caller's handle
//! once it has been persisted, so a failed write leaves the handle as it was.
//!
//! Implementations must apply [`JobStore::update_status`] only when the stored status is one of
//! the new status' [`JobStatus::allowed_sources`], and return [`StoreError::TransitionRejected`]
//! otherwise. This is what keeps a late `complete` from overwriting a `stopped` or `deleted` job.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{
    itinerary::{Itinerary, ItineraryId, UserId},
    job::{ItineraryFileJob, JobId, JobStatus},
};

pub mod memory;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job {0} not found")]
    NotFound(JobId),
    #[error("Job {id} cannot move to {to} from its stored status")]
    TransitionRejected { id: JobId, to: JobStatus },
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },
    #[error("Store in bad state")]
    BadState,
    #[error("Database error: {0}")]
    Database(String),
}

/// A position in the reaping order of deleted jobs: by creation date, then by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReapCursor {
    pub creation_date: DateTime<Utc>,
    pub id: JobId,
}

impl From<&ItineraryFileJob> for ReapCursor {
    fn from(job: &ItineraryFileJob) -> Self {
        Self {
            creation_date: job.creation_date,
            id: job.id,
        }
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new `pending` job for the itinerary using the given storage backend.
    async fn prepare(
        &self,
        itinerary: &Itinerary,
        file_manager: &str,
    ) -> Result<ItineraryFileJob, StoreError>;

    /// Persist `status`, `status_description`, `start_date`, `end_date` and `file_path` of `job`,
    /// guarded by the allowed source statuses of `job.status`.
    async fn update_status(&self, job: &ItineraryFileJob) -> Result<(), StoreError>;

    async fn set_async_task_id(&self, id: JobId, task_id: &str) -> Result<(), StoreError>;

    /// Mark a single job as `deleted`. No other column is touched.
    async fn soft_delete(&self, id: JobId) -> Result<(), StoreError>;

    /// Mark every job of the itinerary as `deleted`, returning how many rows changed.
    async fn soft_delete_itinerary_jobs(
        &self,
        itinerary_id: ItineraryId,
    ) -> Result<u64, StoreError>;

    /// Look up a job that has not been deleted.
    async fn get(&self, id: JobId) -> Result<Option<ItineraryFileJob>, StoreError>;

    /// Jobs of the itinerary that have not been deleted, newest first.
    async fn list_for_itinerary(
        &self,
        itinerary_id: ItineraryId,
    ) -> Result<Vec<ItineraryFileJob>, StoreError>;

    async fn in_progress_count_for_itinerary(
        &self,
        itinerary_id: ItineraryId,
    ) -> Result<u64, StoreError>;

    async fn in_progress_count_for_user(&self, user_id: UserId) -> Result<u64, StoreError>;

    /// The oldest `deleted` jobs, ordered by creation date ascending then by id, starting
    /// strictly after `after` when given.
    async fn reap_candidates(
        &self,
        limit: u32,
        after: Option<ReapCursor>,
    ) -> Result<Vec<ItineraryFileJob>, StoreError>;

    /// Physically remove `deleted` jobs. Jobs in any other status are left alone.
    async fn purge(&self, ids: &[JobId]) -> Result<u64, StoreError>;

    async fn start(&self, job: &mut ItineraryFileJob) -> Result<(), StoreError> {
        let next = job.started()?;
        self.update_status(&next).await?;
        *job = next;
        Ok(())
    }

    async fn complete(&self, job: &mut ItineraryFileJob, file_path: &str) -> Result<(), StoreError> {
        let next = job.completed(file_path)?;
        self.update_status(&next).await?;
        *job = next;
        Ok(())
    }

    async fn fail(&self, job: &mut ItineraryFileJob, reason: &str) -> Result<(), StoreError> {
        let next = job.failed(reason)?;
        self.update_status(&next).await?;
        *job = next;
        Ok(())
    }

    async fn stop(&self, job: &mut ItineraryFileJob) -> Result<(), StoreError> {
        let next = job.stopped()?;
        self.update_status(&next).await?;
        *job = next;
        Ok(())
    }
}
