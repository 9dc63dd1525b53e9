//! Provides an in memory implementation of [`JobStore`].
//!
//! It is a correct (but not optimized) implementation for use in tests and local tooling. Failures
//! of individual operations can be scripted with [`InMemoryJobStore::fail_next`] to exercise the
//! error paths of the job service.
use std::sync::{
    atomic::{AtomicI32, Ordering},
    Arc, Mutex, RwLock,
};

use async_trait::async_trait;

use crate::{
    itinerary::{Itinerary, ItineraryId, UserId},
    job::{ItineraryFileJob, JobId, JobStatus},
};

use super::{JobStore, ReapCursor, StoreError};

/// Operations whose next invocation can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOperation {
    Prepare,
    /// A status update moving a job into the given status.
    UpdateStatus(JobStatus),
    SetAsyncTaskId,
    SoftDelete,
    Count,
}

#[derive(Clone)]
struct StoredJob {
    job: ItineraryFileJob,
    user_id: UserId,
}

#[derive(Clone, Default)]
pub struct InMemoryJobStore {
    jobs: Arc<RwLock<Vec<StoredJob>>>,
    id_counter: Arc<AtomicI32>,
    failures: Arc<Mutex<Vec<StoreOperation>>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of `operation` fail with [`StoreError::Database`].
    pub fn fail_next(&self, operation: StoreOperation) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.push(operation);
        }
    }

    /// Every job including deleted ones, in insertion order.
    pub fn all_jobs(&self) -> Vec<ItineraryFileJob> {
        self.jobs
            .read()
            .map(|jobs| jobs.iter().map(|stored| stored.job.clone()).collect())
            .unwrap_or_default()
    }

    fn take_failure(&self, operation: StoreOperation) -> Result<(), StoreError> {
        let mut failures = self.failures.lock().map_err(|_| StoreError::BadState)?;
        match failures.iter().position(|failure| *failure == operation) {
            Some(index) => {
                failures.remove(index);
                Err(StoreError::Database(format!(
                    "scripted failure of {operation:?}"
                )))
            }
            None => Ok(()),
        }
    }

    fn count_in_progress(&self, predicate: impl Fn(&StoredJob) -> bool) -> Result<u64, StoreError> {
        self.take_failure(StoreOperation::Count)?;
        Ok(self
            .jobs
            .read()
            .map_err(|_| StoreError::BadState)?
            .iter()
            .filter(|stored| stored.job.status.is_in_progress() && predicate(stored))
            .count() as u64)
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn prepare(
        &self,
        itinerary: &Itinerary,
        file_manager: &str,
    ) -> Result<ItineraryFileJob, StoreError> {
        self.take_failure(StoreOperation::Prepare)?;
        let id = self.id_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let job = ItineraryFileJob::new_pending(id.into(), itinerary.id, file_manager);
        self.jobs
            .write()
            .map_err(|_| StoreError::BadState)?
            .push(StoredJob {
                job: job.clone(),
                user_id: itinerary.user_id,
            });
        Ok(job)
    }

    async fn update_status(&self, job: &ItineraryFileJob) -> Result<(), StoreError> {
        self.take_failure(StoreOperation::UpdateStatus(job.status))?;
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let stored = jobs
            .iter_mut()
            .find(|stored| stored.job.id == job.id)
            .ok_or(StoreError::NotFound(job.id))?;
        if !job.status.allowed_sources().contains(&stored.job.status) {
            return Err(StoreError::TransitionRejected {
                id: job.id,
                to: job.status,
            });
        }
        stored.job.status = job.status;
        stored.job.status_description = job.status_description.clone();
        stored.job.start_date = job.start_date;
        stored.job.end_date = job.end_date;
        stored.job.file_path = job.file_path.clone();
        Ok(())
    }

    async fn set_async_task_id(&self, id: JobId, task_id: &str) -> Result<(), StoreError> {
        self.take_failure(StoreOperation::SetAsyncTaskId)?;
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        match jobs
            .iter_mut()
            .find(|stored| stored.job.id == id && stored.job.status != JobStatus::Deleted)
        {
            None => Err(StoreError::NotFound(id)),
            Some(stored) => {
                stored.job.async_task_id = Some(task_id.to_owned());
                Ok(())
            }
        }
    }

    async fn soft_delete(&self, id: JobId) -> Result<(), StoreError> {
        self.take_failure(StoreOperation::SoftDelete)?;
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let stored = jobs
            .iter_mut()
            .find(|stored| stored.job.id == id)
            .ok_or(StoreError::NotFound(id))?;
        if !JobStatus::Deleted
            .allowed_sources()
            .contains(&stored.job.status)
        {
            return Err(StoreError::TransitionRejected {
                id,
                to: JobStatus::Deleted,
            });
        }
        stored.job.status = JobStatus::Deleted;
        Ok(())
    }

    async fn soft_delete_itinerary_jobs(
        &self,
        itinerary_id: ItineraryId,
    ) -> Result<u64, StoreError> {
        self.take_failure(StoreOperation::SoftDelete)?;
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let mut count = 0;
        jobs.iter_mut()
            .filter(|stored| {
                stored.job.itinerary_id == itinerary_id && stored.job.status != JobStatus::Deleted
            })
            .for_each(|stored| {
                stored.job.status = JobStatus::Deleted;
                count += 1;
            });
        Ok(count)
    }

    async fn get(&self, id: JobId) -> Result<Option<ItineraryFileJob>, StoreError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| StoreError::BadState)?
            .iter()
            .find(|stored| stored.job.id == id && stored.job.status != JobStatus::Deleted)
            .map(|stored| stored.job.clone()))
    }

    async fn list_for_itinerary(
        &self,
        itinerary_id: ItineraryId,
    ) -> Result<Vec<ItineraryFileJob>, StoreError> {
        let mut jobs = self
            .jobs
            .read()
            .map_err(|_| StoreError::BadState)?
            .iter()
            .filter(|stored| {
                stored.job.itinerary_id == itinerary_id && stored.job.status != JobStatus::Deleted
            })
            .map(|stored| stored.job.clone())
            .collect::<Vec<_>>();
        jobs.sort_by(|a, b| {
            b.creation_date
                .cmp(&a.creation_date)
                .then(b.id.cmp(&a.id))
        });
        Ok(jobs)
    }

    async fn in_progress_count_for_itinerary(
        &self,
        itinerary_id: ItineraryId,
    ) -> Result<u64, StoreError> {
        self.count_in_progress(|stored| stored.job.itinerary_id == itinerary_id)
    }

    async fn in_progress_count_for_user(&self, user_id: UserId) -> Result<u64, StoreError> {
        self.count_in_progress(|stored| stored.user_id == user_id)
    }

    async fn reap_candidates(
        &self,
        limit: u32,
        after: Option<ReapCursor>,
    ) -> Result<Vec<ItineraryFileJob>, StoreError> {
        let after = after.map(|cursor| (cursor.creation_date, cursor.id));
        let mut jobs = self
            .jobs
            .read()
            .map_err(|_| StoreError::BadState)?
            .iter()
            .filter(|stored| stored.job.status == JobStatus::Deleted)
            .filter(|stored| {
                after.map_or(true, |after| (stored.job.creation_date, stored.job.id) > after)
            })
            .map(|stored| stored.job.clone())
            .collect::<Vec<_>>();
        jobs.sort_by(|a, b| {
            a.creation_date
                .cmp(&b.creation_date)
                .then(a.id.cmp(&b.id))
        });
        jobs.truncate(limit as usize);
        Ok(jobs)
    }

    async fn purge(&self, ids: &[JobId]) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let before = jobs.len();
        jobs.retain(|stored| {
            !(stored.job.status == JobStatus::Deleted && ids.contains(&stored.job.id))
        });
        Ok((before - jobs.len()) as u64)
    }
}
