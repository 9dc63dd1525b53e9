use std::{collections::HashMap, ops::Deref, ops::Sub, sync::Arc};

use async_stream::stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itinerary_jobs::queue::{
    EnqueuableTask, QueueError, ReadyTasks, Task, TaskFailure, TaskId, TaskQueue, LEASE_GRACE,
};
use serde::Deserialize;
use sqlx::{postgres::PgListener, PgPool};
use tokio::sync::{mpsc, RwLock};
use tracing::instrument;

use crate::types::TaskRow;

const CHANNEL: &str = "public.itinerary_tasks_scheduled";

const TASK_COLUMNS: &str = r#"
    id,
    task_type,
    payload,
    status,
    attempt,
    max_attempts,
    timeout_ms,
    errors,
    inserted_at,
    scheduled_at,
    deadline
"#;

type Subscribers = Arc<RwLock<HashMap<String, Vec<mpsc::UnboundedSender<DateTime<Utc>>>>>>;

/// A [`TaskQueue`] keeping tasks in the `itinerary_tasks` table.
///
/// Tasks are leased with `FOR UPDATE SKIP LOCKED`, so any number of worker processes can share
/// the table. Subscribers are woken through `LISTEN`/`NOTIFY` when a queue is created with
/// [`PgTaskQueue::new`]; one converted from a pool only wakes subscribers of its own process and
/// otherwise polls.
#[derive(Clone, Debug)]
pub struct PgTaskQueue {
    pool: PgPool,
    subscribers: Subscribers,
}

impl Deref for PgTaskQueue {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl From<PgPool> for PgTaskQueue {
    fn from(pool: PgPool) -> Self {
        Self {
            pool,
            subscribers: Default::default(),
        }
    }
}

impl From<&PgPool> for PgTaskQueue {
    fn from(value: &PgPool) -> Self {
        Self {
            pool: value.to_owned(),
            subscribers: Default::default(),
        }
    }
}

fn backend(error: sqlx::Error) -> QueueError {
    QueueError::Backend(error.to_string())
}

#[derive(Deserialize, Debug)]
struct Notification {
    task_type: String,
    scheduled_at: DateTime<Utc>,
}

struct ReadyTaskStream {
    queue: PgTaskQueue,
    task_type: String,
    receiver: mpsc::UnboundedReceiver<DateTime<Utc>>,
}

impl ReadyTaskStream {
    const DEFAULT_DELAY: std::time::Duration = std::time::Duration::from_secs(30);
    const DELTA: std::time::Duration = std::time::Duration::from_millis(15);

    async fn next(&mut self) -> Result<Task, QueueError> {
        loop {
            let delay = match self.queue.next_ready_at(&self.task_type).await? {
                Some(timestamp) => timestamp
                    .sub(Utc::now())
                    .to_std()
                    .unwrap_or(Self::DELTA)
                    .min(Self::DEFAULT_DELAY),
                None => Self::DEFAULT_DELAY,
            };
            if delay <= Self::DELTA {
                if let Some(task) = self.queue.lease_next(&self.task_type).await? {
                    return task.try_into();
                }
            }
            tokio::select! {
                _ = self.receiver.recv() => {},
                _ = tokio::time::sleep(delay) => {},
            }
        }
    }
}

impl PgTaskQueue {
    /// Create the queue and start listening for tasks scheduled by any process.
    pub async fn new(pool: PgPool) -> Result<Self, QueueError> {
        let this = Self::from(pool);
        let mut listener = PgListener::connect_with(&this).await.map_err(backend)?;
        listener.listen(CHANNEL).await.map_err(backend)?;

        tokio::spawn({
            let subscribers = this.subscribers.clone();
            async move {
                while let Ok(notification) = listener.recv().await {
                    let notification =
                        match serde_json::from_str::<Notification>(notification.payload()) {
                            Ok(notification) => notification,
                            Err(error) => {
                                tracing::warn!(?error, "Ignoring malformed task notification");
                                continue;
                            }
                        };
                    notify(&subscribers, &notification.task_type, notification.scheduled_at)
                        .await;
                }
                tracing::warn!("Stopped listening for scheduled tasks");
            }
        });

        Ok(this)
    }

    async fn next_ready_at(&self, task_type: &str) -> Result<Option<DateTime<Utc>>, QueueError> {
        sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            r#"SELECT MIN(CASE WHEN status = 'active' THEN deadline ELSE scheduled_at END)
            FROM itinerary_tasks
            WHERE task_type = $1
            AND status IN ('pending', 'retry', 'active')"#,
        )
        .bind(task_type)
        .fetch_one(self.deref())
        .await
        .map_err(backend)
    }

    /// Lease the oldest ready task, including one whose previous lease has expired.
    async fn lease_next(&self, task_type: &str) -> Result<Option<TaskRow>, QueueError> {
        let task = sqlx::query_as::<_, TaskRow>(&format!(
            r#"UPDATE itinerary_tasks
            SET
                status = 'active',
                attempt = attempt + 1,
                deadline = now() + (timeout_ms + $2) * interval '1 millisecond'
            WHERE id IN (
                SELECT id FROM itinerary_tasks
                WHERE task_type = $1
                AND (
                    (status IN ('pending', 'retry') AND scheduled_at <= now())
                    OR (status = 'active' AND deadline <= now())
                )
                ORDER BY
                    CASE WHEN status = 'active' THEN deadline ELSE scheduled_at END,
                    inserted_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {TASK_COLUMNS}"#
        ))
        .bind(task_type)
        .bind(LEASE_GRACE.num_milliseconds())
        .fetch_optional(self.deref())
        .await
        .map_err(backend)?;

        if let Some(task) = &task {
            if task.attempt > 1 && task.errors.len() < (task.attempt - 1) as usize {
                tracing::warn!(task_id = %task.id, "Lease of task {} expired, redelivering", task.id);
            }
        }
        Ok(task)
    }

    async fn record_failure(
        &self,
        id: &TaskId,
        status: &str,
        next_scheduled_at: Option<DateTime<Utc>>,
        failure: TaskFailure,
    ) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"UPDATE itinerary_tasks
            SET
                status = $2::itinerary_task_status,
                scheduled_at = COALESCE($5, scheduled_at),
                deadline = NULL,
                errors = ARRAY_APPEND(
                    errors,
                    jsonb_build_object(
                        'attempt', attempt,
                        'error_type', $3::text,
                        'details', $4::text,
                        'recorded_at', now()
                    )
                )
            WHERE id = $1"#,
        )
        .bind(id.as_str())
        .bind(status)
        .bind(failure.error_type)
        .bind(failure.message)
        .bind(next_scheduled_at)
        .execute(self.deref())
        .await
        .map_err(backend)?;

        match result.rows_affected() {
            0 => Err(QueueError::TaskNotFound(id.clone())),
            _ => Ok(()),
        }
    }
}

async fn notify(subscribers: &Subscribers, task_type: &str, scheduled_at: DateTime<Utc>) {
    subscribers
        .read()
        .await
        .get(task_type)
        .into_iter()
        .flatten()
        .for_each(|sender| {
            let _ = sender.send(scheduled_at);
        });
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    #[instrument(skip(self, task), fields(task_type = %task.task_type))]
    async fn enqueue(&self, task: EnqueuableTask) -> Result<TaskId, QueueError> {
        let id = TaskId::generate();
        let timeout_ms = i64::try_from(task.timeout.as_millis()).unwrap_or(i64::MAX / 2);
        sqlx::query(
            r#"INSERT INTO itinerary_tasks (
                id,
                task_type,
                payload,
                max_attempts,
                timeout_ms,
                scheduled_at
            ) VALUES ($1, $2, $3, $4, $5, $6)"#,
        )
        .bind(id.as_str())
        .bind(&task.task_type)
        .bind(&task.payload)
        .bind(i32::from(task.max_attempts))
        .bind(timeout_ms)
        .bind(task.scheduled_at)
        .execute(self.deref())
        .await
        .map_err(backend)
        .inspect_err(|error| tracing::error!(?error, "Failed to enqueue task: {error}"))?;

        notify(&self.subscribers, &task.task_type, task.scheduled_at).await;
        Ok(id)
    }

    async fn subscribe_ready_tasks(&self, task_type: &str) -> Result<ReadyTasks, QueueError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .await
            .entry(task_type.to_owned())
            .or_default()
            .push(sender);

        let mut stream = ReadyTaskStream {
            queue: self.clone(),
            task_type: task_type.to_owned(),
            receiver,
        };
        Ok(Box::pin(stream! {
            loop {
                yield stream.next().await;
            }
        }))
    }

    async fn mark_task_complete(&self, id: &TaskId) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"UPDATE itinerary_tasks
            SET
                status = 'completed',
                deadline = NULL
            WHERE id = $1"#,
        )
        .bind(id.as_str())
        .execute(self.deref())
        .await
        .map_err(backend)?;

        match result.rows_affected() {
            0 => Err(QueueError::TaskNotFound(id.clone())),
            _ => Ok(()),
        }
    }

    async fn mark_task_retryable(
        &self,
        id: &TaskId,
        next_scheduled_at: DateTime<Utc>,
        failure: TaskFailure,
    ) -> Result<(), QueueError> {
        self.record_failure(id, "retry", Some(next_scheduled_at), failure)
            .await
    }

    async fn mark_task_archived(
        &self,
        id: &TaskId,
        failure: TaskFailure,
    ) -> Result<(), QueueError> {
        self.record_failure(id, "archived", None, failure).await
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>, QueueError> {
        sqlx::query_as::<_, TaskRow>(&format!(
            "SELECT {TASK_COLUMNS} FROM itinerary_tasks WHERE id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(self.deref())
        .await
        .map_err(backend)?
        .map(Task::try_from)
        .transpose()
    }
}
