//! Physical removal of soft deleted jobs and their files.
//!
//! Deleting a job only marks it as `deleted`. The [`Reaper`] runs on a [`cron::Schedule`] and
//! reclaims such jobs in batches, oldest first: the generated file is deleted through the file
//! manager the job was written with, and then the row itself is purged.
//!
//! A job whose file could not be deleted is left in place. While a run fills its whole batch the
//! next run continues after the last job it saw, so jobs that keep failing cannot hold back the
//! rest. Once a run comes up short the reaper starts again from the oldest job and retries them.
//!
//! # Example
//!
//! ```
//! # use itinerary_jobs::reaper::ReaperConfig;
//! # use std::str::FromStr;
//! let config = ReaperConfig::new(cron::Schedule::from_str("0 */10 * * * *").unwrap())
//!     .with_batch_size(100);
//! ```
use std::{
    ops::Sub,
    sync::{Arc, Mutex},
    time::Duration,
};

use chrono::{TimeDelta, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    config::{Config, ConfigError},
    file_manager::{FileManagerError, FileManagers},
    job::{ItineraryFileJob, JobId},
    store::{JobStore, ReapCursor, StoreError},
};

const DEFAULT_BATCH_SIZE: u32 = 50;

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    schedule: cron::Schedule,
    batch_size: u32,
}

impl ReaperConfig {
    pub fn new(schedule: cron::Schedule) -> Self {
        Self {
            schedule,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// The most jobs reclaimed by a single run.
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

impl TryFrom<&Config> for ReaperConfig {
    type Error = ConfigError;

    fn try_from(config: &Config) -> Result<Self, Self::Error> {
        Ok(Self::new(config.reaper_schedule()?).with_batch_size(config.reaper_batch_size))
    }
}

/// Outcome of a single reaping run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReapSummary {
    /// Jobs removed from the store.
    pub purged: u64,
    /// Jobs kept because their file could not be deleted.
    pub skipped: usize,
}

pub struct Reaper {
    store: Arc<dyn JobStore>,
    file_managers: FileManagers,
    config: ReaperConfig,
    cursor: Mutex<Option<ReapCursor>>,
}

impl Reaper {
    pub fn new(store: Arc<dyn JobStore>, file_managers: FileManagers, config: ReaperConfig) -> Self {
        Self {
            store,
            file_managers,
            config,
            cursor: Mutex::new(None),
        }
    }

    /// Run the reaper on its schedule until `cancellation_token` is cancelled.
    pub fn spawn(self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let Some(next) = self.config.schedule.upcoming(Utc).next() else {
                    tracing::error!("No future scheduled time for the reaper");
                    break;
                };
                let delay = next
                    .sub(Utc::now())
                    .sub(TimeDelta::milliseconds(10))
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        let _ = self.reap().await.inspect_err(|err| {
                            tracing::error!(?err, "Failed to reap deleted jobs with error {err}")
                        });
                        if let Ok(delay) = (next - Utc::now()).to_std() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                    _ = cancellation_token.cancelled() => {
                        tracing::debug!("Shutting down the job reaper");
                        break;
                    },
                }
            }
        })
    }

    /// Reclaim one batch of deleted jobs, oldest first.
    #[instrument(skip(self))]
    pub async fn reap(&self) -> Result<ReapSummary, StoreError> {
        let after = *self.cursor.lock().map_err(|_| StoreError::BadState)?;
        let candidates = self
            .store
            .reap_candidates(self.config.batch_size, after)
            .await?;
        let next = match candidates.last() {
            Some(last) if candidates.len() >= self.config.batch_size as usize => {
                Some(ReapCursor::from(last))
            }
            _ => None,
        };
        *self.cursor.lock().map_err(|_| StoreError::BadState)? = next;
        if candidates.is_empty() {
            return Ok(ReapSummary::default());
        }

        let mut reclaimed = Vec::with_capacity(candidates.len());
        let mut skipped = 0;
        for job in &candidates {
            match self.delete_file(job).await {
                Ok(()) => reclaimed.push(job.id),
                Err(error) => {
                    skipped += 1;
                    tracing::error!(
                        ?error,
                        job_id = %job.id,
                        "Failed to delete file of job {}, keeping it for the next run: {error}",
                        job.id
                    );
                }
            }
        }

        let purged = self.purge(&reclaimed).await?;
        tracing::debug!(purged, skipped, "Reaped {purged} deleted jobs");
        Ok(ReapSummary { purged, skipped })
    }

    async fn delete_file(&self, job: &ItineraryFileJob) -> Result<(), FileManagerError> {
        let Some(path) = job.file_path.as_deref() else {
            return Ok(());
        };
        match self.file_managers.resolve(&job.file_manager).delete(path).await {
            Ok(()) | Err(FileManagerError::NotFound(_)) => Ok(()),
            Err(error) => Err(error),
        }
    }

    async fn purge(&self, ids: &[JobId]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.store.purge(ids).await
    }
}
