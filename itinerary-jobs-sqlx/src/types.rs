use chrono::{DateTime, Utc};
use itinerary_jobs::{
    job::ItineraryFileJob,
    queue::{QueueError, Task, TaskError},
};
use sqlx::{
    postgres::{PgHasArrayType, PgTypeInfo},
    prelude::FromRow,
};

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "itinerary_file_job_status", rename_all = "lowercase")]
pub(crate) enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
    Deleted,
}

impl PgHasArrayType for JobStatus {
    fn array_type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("itinerary_file_job_status[]")
    }
}

impl From<JobStatus> for itinerary_jobs::job::JobStatus {
    fn from(value: JobStatus) -> Self {
        match value {
            JobStatus::Pending => Self::Pending,
            JobStatus::Running => Self::Running,
            JobStatus::Completed => Self::Completed,
            JobStatus::Failed => Self::Failed,
            JobStatus::Stopped => Self::Stopped,
            JobStatus::Deleted => Self::Deleted,
        }
    }
}

impl From<itinerary_jobs::job::JobStatus> for JobStatus {
    fn from(value: itinerary_jobs::job::JobStatus) -> Self {
        match value {
            itinerary_jobs::job::JobStatus::Pending => Self::Pending,
            itinerary_jobs::job::JobStatus::Running => Self::Running,
            itinerary_jobs::job::JobStatus::Completed => Self::Completed,
            itinerary_jobs::job::JobStatus::Failed => Self::Failed,
            itinerary_jobs::job::JobStatus::Stopped => Self::Stopped,
            itinerary_jobs::job::JobStatus::Deleted => Self::Deleted,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct Job {
    pub id: i32,
    pub status: JobStatus,
    pub status_description: String,
    pub creation_date: DateTime<Utc>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub file_path: Option<String>,
    pub file_manager: String,
    pub itinerary_id: i32,
    pub async_task_id: Option<String>,
}

impl From<Job> for ItineraryFileJob {
    fn from(value: Job) -> Self {
        Self {
            id: value.id.into(),
            status: value.status.into(),
            status_description: value.status_description,
            creation_date: value.creation_date,
            start_date: value.start_date,
            end_date: value.end_date,
            file_path: value.file_path,
            file_manager: value.file_manager,
            itinerary_id: value.itinerary_id.into(),
            async_task_id: value.async_task_id,
        }
    }
}

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "itinerary_task_status", rename_all = "lowercase")]
pub(crate) enum TaskStatus {
    Pending,
    Active,
    Retry,
    Completed,
    Archived,
}

impl From<TaskStatus> for itinerary_jobs::queue::TaskStatus {
    fn from(value: TaskStatus) -> Self {
        match value {
            TaskStatus::Pending => Self::Pending,
            TaskStatus::Active => Self::Active,
            TaskStatus::Retry => Self::Retry,
            TaskStatus::Completed => Self::Completed,
            TaskStatus::Archived => Self::Archived,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct TaskRow {
    pub id: String,
    pub task_type: String,
    pub payload: Vec<u8>,
    pub status: TaskStatus,
    pub attempt: i32,
    pub max_attempts: i32,
    pub timeout_ms: i64,
    pub errors: Vec<serde_json::Value>,
    pub inserted_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
}

impl TryFrom<TaskRow> for Task {
    type Error = QueueError;

    fn try_from(value: TaskRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: value.id.into(),
            task_type: value.task_type,
            payload: value.payload,
            status: value.status.into(),
            attempt: u16::try_from(value.attempt).map_err(|_| QueueError::BadState)?,
            max_attempts: u16::try_from(value.max_attempts).map_err(|_| QueueError::BadState)?,
            timeout: std::time::Duration::from_millis(
                u64::try_from(value.timeout_ms).map_err(|_| QueueError::BadState)?,
            ),
            errors: value
                .errors
                .into_iter()
                .map(serde_json::from_value::<TaskError>)
                .collect::<Result<_, _>>()?,
            inserted_at: value.inserted_at,
            scheduled_at: value.scheduled_at,
            deadline: value.deadline,
        })
    }
}
