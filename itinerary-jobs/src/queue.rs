//! Durable, at least once delivery of serialized work to a pool of workers.
//!
//! Producers [`TaskQueue::enqueue`] a named task type with an opaque payload and an execution
//! timeout. A [`server::TaskServer`] subscribes to the ready tasks of every registered type and
//! hands them to a [`TaskHandler`], recording the outcome back on the queue:
//!
//! ```text
//! pending ──▶ active ──▶ completed
//!    ▲          │
//!    │          ├──▶ retry ──▶ active ...
//!    │          │
//!    │          └──▶ archived (attempts exhausted)
//!    └── lease deadline passed
//! ```
//!
//! A leased task whose deadline passes without an outcome is delivered again, so handlers must be
//! safe to run more than once.
use std::{fmt::Display, pin::Pin, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod backoff;
pub mod memory;
mod runner;
pub mod server;

/// Time added to a task's timeout before its lease expires and it becomes deliverable again.
pub const LEASE_GRACE: TimeDelta = TimeDelta::seconds(30);

/// Error type recorded when a handler panics.
pub const ERROR_TYPE_PANIC: &str = "panic";
/// Error type recorded when a handler exceeds the task's timeout.
pub const ERROR_TYPE_TIMEOUT: &str = "timeout";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<TaskId> for String {
    fn from(value: TaskId) -> Self {
        value.0
    }
}

impl Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Active,
    Retry,
    Completed,
    Archived,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Active,
        TaskStatus::Retry,
        TaskStatus::Completed,
        TaskStatus::Archived,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Active => "active",
            TaskStatus::Retry => "retry",
            TaskStatus::Completed => "completed",
            TaskStatus::Archived => "archived",
        }
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed delivery as recorded on the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub attempt: u16,
    pub error_type: String,
    pub details: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: TaskId,
    pub task_type: String,
    pub payload: Vec<u8>,
    pub status: TaskStatus,
    /// Deliveries so far, including the current one for an `active` task.
    pub attempt: u16,
    pub max_attempts: u16,
    pub timeout: Duration,
    pub errors: Vec<TaskError>,
    pub inserted_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    /// When the current lease expires. Only set while `active`.
    pub deadline: Option<DateTime<Utc>>,
}

impl Task {
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// The lease deadline for a delivery starting at `now`.
    pub fn lease_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        TimeDelta::from_std(self.timeout)
            .ok()
            .and_then(|timeout| timeout.checked_add(&LEASE_GRACE))
            .and_then(|lease| now.checked_add_signed(lease))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[derive(Debug, Clone)]
pub struct EnqueuableTask {
    pub task_type: String,
    pub payload: Vec<u8>,
    pub timeout: Duration,
    pub max_attempts: u16,
    pub scheduled_at: DateTime<Utc>,
}

impl EnqueuableTask {
    pub fn new(task_type: impl Into<String>, payload: Vec<u8>, timeout: Duration) -> Self {
        Self {
            task_type: task_type.into(),
            payload,
            timeout,
            max_attempts: 1,
            scheduled_at: Utc::now(),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u16) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_scheduled_at(mut self, scheduled_at: DateTime<Utc>) -> Self {
        self.scheduled_at = scheduled_at;
        self
    }
}

/// The outcome of a failed delivery, handed to the queue to be recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub error_type: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Error encoding or decoding task payload")]
    Encode(#[from] serde_json::Error),
    #[error("Task {0} not found")]
    TaskNotFound(TaskId),
    #[error("Queue in bad state")]
    BadState,
    #[error("Queue backend error: {0}")]
    Backend(String),
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
}

/// Errors returned by a [`TaskHandler`].
///
/// The error type is recorded with the failure on the task.
pub trait ExecutionError: std::error::Error + Send + Sync + 'static {
    fn error_type(&self) -> &'static str;
}

pub type ReadyTasks = Pin<Box<dyn Stream<Item = Result<Task, QueueError>> + Send>>;

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: EnqueuableTask) -> Result<TaskId, QueueError>;

    /// A stream leasing ready tasks of the given type, oldest first.
    ///
    /// Every item is already marked `active` with its attempt counted and a lease deadline set.
    async fn subscribe_ready_tasks(&self, task_type: &str) -> Result<ReadyTasks, QueueError>;

    async fn mark_task_complete(&self, id: &TaskId) -> Result<(), QueueError>;

    async fn mark_task_retryable(
        &self,
        id: &TaskId,
        next_scheduled_at: DateTime<Utc>,
        failure: TaskFailure,
    ) -> Result<(), QueueError>;

    async fn mark_task_archived(&self, id: &TaskId, failure: TaskFailure)
        -> Result<(), QueueError>;

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>, QueueError>;
}

/// Processes the payload of one task type.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, payload: &[u8]) -> Result<(), Box<dyn ExecutionError>>;
}
