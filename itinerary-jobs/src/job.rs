//! The itinerary file job and its state machine.
//!
//! ```text
//! pending ──▶ running ──▶ completed
//!    │           │
//!    │           ├──────▶ failed
//!    ├───────────┴──────▶ stopped
//!    │
//!    └─ any non-running status ──▶ deleted
//! ```
//!
//! `deleted` is terminal; rows in that status are only removed by the [`crate::reaper::Reaper`].
use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::{itinerary::ItineraryId, store::StoreError};

/// Status description written when a job completes.
pub const COMPLETED_DESCRIPTION: &str = "Itinerary file generated successfully";
/// Status description written when a user stops a job.
pub const STOPPED_DESCRIPTION: &str = "Job stopped by user";

#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(i32);

impl From<i32> for JobId {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl From<JobId> for i32 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
    Deleted,
}

impl JobStatus {
    /// Statuses counted by admission control.
    pub const IN_PROGRESS: [JobStatus; 2] = [JobStatus::Pending, JobStatus::Running];

    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Stopped,
        JobStatus::Deleted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Stopped => "stopped",
            JobStatus::Deleted => "deleted",
        }
    }

    pub fn is_in_progress(&self) -> bool {
        Self::IN_PROGRESS.contains(self)
    }

    /// The statuses a job must currently be in to move into `self`.
    ///
    /// `running` accepts `running` so that a redelivered task can restart its job.
    pub fn allowed_sources(&self) -> &'static [JobStatus] {
        match self {
            JobStatus::Pending => &[],
            JobStatus::Running => &[JobStatus::Pending, JobStatus::Running],
            JobStatus::Completed => &[JobStatus::Running],
            JobStatus::Failed | JobStatus::Stopped => &[JobStatus::Pending, JobStatus::Running],
            JobStatus::Deleted => &[
                JobStatus::Pending,
                JobStatus::Completed,
                JobStatus::Failed,
                JobStatus::Stopped,
            ],
        }
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        next.allowed_sources().contains(self)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
            .ok_or(StoreError::BadState)
    }
}

/// One attempt to generate and store an itinerary document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItineraryFileJob {
    pub id: JobId,
    pub status: JobStatus,
    pub status_description: String,
    pub creation_date: DateTime<Utc>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub file_path: Option<String>,
    /// The storage backend chosen when the job was prepared. Never changes afterwards.
    pub file_manager: String,
    pub itinerary_id: ItineraryId,
    /// Correlates the job with its queue task. Not used for dispatch.
    pub async_task_id: Option<String>,
}

/// Timestamps are kept at microsecond precision so they survive a round trip through Postgres.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

impl ItineraryFileJob {
    /// A freshly prepared job as stores insert it.
    pub fn new_pending(id: JobId, itinerary_id: ItineraryId, file_manager: &str) -> Self {
        Self {
            id,
            status: JobStatus::Pending,
            status_description: String::new(),
            creation_date: now(),
            start_date: None,
            end_date: None,
            file_path: None,
            file_manager: file_manager.to_owned(),
            itinerary_id,
            async_task_id: None,
        }
    }

    fn transition(&self, to: JobStatus) -> Result<Self, StoreError> {
        if !self.status.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                from: self.status,
                to,
            });
        }
        Ok(Self {
            status: to,
            ..self.clone()
        })
    }

    pub(crate) fn started(&self) -> Result<Self, StoreError> {
        let mut job = self.transition(JobStatus::Running)?;
        job.start_date = Some(now());
        Ok(job)
    }

    pub(crate) fn completed(&self, file_path: &str) -> Result<Self, StoreError> {
        let mut job = self.transition(JobStatus::Completed)?;
        job.status_description = COMPLETED_DESCRIPTION.to_owned();
        job.end_date = Some(now());
        job.file_path = Some(file_path.to_owned());
        Ok(job)
    }

    pub(crate) fn failed(&self, reason: &str) -> Result<Self, StoreError> {
        let mut job = self.transition(JobStatus::Failed)?;
        job.status_description = reason.to_owned();
        job.end_date = Some(now());
        Ok(job)
    }

    pub(crate) fn stopped(&self) -> Result<Self, StoreError> {
        let mut job = self.transition(JobStatus::Stopped)?;
        job.status_description = STOPPED_DESCRIPTION.to_owned();
        job.end_date = Some(now());
        Ok(job)
    }
}
