use std::{sync::Arc, time::Duration};

use chrono::Utc;
use tokio::task::JoinError;
use tracing::{instrument, Instrument};

use super::{
    backoff::Backoff, ExecutionError, Task, TaskFailure, TaskHandler, TaskId, TaskQueue,
    ERROR_TYPE_PANIC, ERROR_TYPE_TIMEOUT,
};

/// Runs single deliveries of a task type and records their outcome on the queue.
#[derive(Clone)]
pub(crate) struct TaskRunner {
    queue: Arc<dyn TaskQueue>,
    handler: Arc<dyn TaskHandler>,
    backoff: Backoff,
}

impl TaskRunner {
    pub(crate) fn new(
        queue: Arc<dyn TaskQueue>,
        handler: Arc<dyn TaskHandler>,
        backoff: Backoff,
    ) -> Self {
        Self {
            queue,
            handler,
            backoff,
        }
    }

    #[instrument(skip(self, task), fields(task_id = %task.id, task_type = %task.task_type, attempt = task.attempt))]
    pub(crate) async fn execute_task(&self, task: Task) {
        let is_final_attempt = task.is_final_attempt();
        let Task {
            id,
            payload,
            timeout,
            attempt,
            ..
        } = task;
        let handler = self.handler.clone();

        tracing::debug!(task_id = %id, "Executing task {id}");
        let result = tokio::spawn(
            async move { tokio::time::timeout(timeout, handler.handle(&payload)).await }
                .in_current_span(),
        )
        .await;

        match result {
            Ok(Ok(Ok(()))) => self.handle_task_complete(&id).await,
            Ok(Ok(Err(error))) => {
                self.handle_task_error(is_final_attempt, &id, attempt, error)
                    .await
            }
            Ok(Err(_elapsed)) => {
                self.handle_task_error(is_final_attempt, &id, attempt, timeout)
                    .await
            }
            Err(error) => {
                self.handle_task_error(is_final_attempt, &id, attempt, error)
                    .await
            }
        }
    }

    async fn handle_task_complete(&self, id: &TaskId) {
        tracing::debug!(task_id = %id, "Task complete {id}");
        let _ = self
            .queue
            .mark_task_complete(id)
            .await
            .inspect_err(|err| {
                tracing::error!(
                    ?err,
                    task_id = %id,
                    "Failed to mark task {id} as complete, error: {err:?}",
                )
            });
    }

    async fn handle_task_error(
        &self,
        is_final_attempt: bool,
        id: &TaskId,
        attempt: u16,
        failure: impl Into<TaskFailure>,
    ) {
        let failure = failure.into();
        if is_final_attempt {
            tracing::error!(
                task_id = %id,
                ?failure,
                "Task {id} failed and will be archived: error type: {}, message: {}",
                failure.error_type,
                failure.message
            );
            let _ = self
                .queue
                .mark_task_archived(id, failure)
                .await
                .inspect_err(|err| {
                    tracing::error!(
                        ?err,
                        task_id = %id,
                        "Failed to mark task {id} as archived, error: {err:?}",
                    )
                });
        } else {
            let delay = self.backoff.backoff(attempt);
            tracing::warn!(
                task_id = %id,
                ?failure,
                "Task {id} failed and will be retried in {delay}: error type: {}, message: {}",
                failure.error_type,
                failure.message
            );
            let _ = self
                .queue
                .mark_task_retryable(id, Utc::now() + delay, failure)
                .await
                .inspect_err(|err| {
                    tracing::error!(
                        ?err,
                        task_id = %id,
                        "Failed to mark task {id} as retryable, error: {err:?}",
                    )
                });
        }
    }
}

impl From<JoinError> for TaskFailure {
    fn from(value: JoinError) -> Self {
        let msg = value.to_string();
        let message = match value.try_into_panic() {
            Ok(panic) => panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or(msg),
            Err(_) => msg,
        };
        Self {
            error_type: ERROR_TYPE_PANIC.to_owned(),
            message,
        }
    }
}

impl From<Box<dyn ExecutionError>> for TaskFailure {
    fn from(value: Box<dyn ExecutionError>) -> Self {
        Self {
            error_type: value.error_type().to_owned(),
            message: value.to_string(),
        }
    }
}

impl From<Duration> for TaskFailure {
    fn from(value: Duration) -> Self {
        Self {
            error_type: ERROR_TYPE_TIMEOUT.to_owned(),
            message: format!("Task failed to complete within timeout: {value:?}"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::queue::{memory::InMemoryTaskQueue, EnqueuableTask, TaskStatus};
    use async_trait::async_trait;
    use chrono::TimeDelta;
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("handler refused: {0}")]
    struct Refused(String);

    impl ExecutionError for Refused {
        fn error_type(&self) -> &'static str {
            "refused"
        }
    }

    enum Behaviour {
        Succeed,
        Refuse,
        Panic,
        Hang,
    }

    struct TestHandler(Behaviour);

    #[async_trait]
    impl TaskHandler for TestHandler {
        async fn handle(&self, payload: &[u8]) -> Result<(), Box<dyn ExecutionError>> {
            match self.0 {
                Behaviour::Succeed => Ok(()),
                Behaviour::Refuse => Err(Box::new(Refused(
                    String::from_utf8_lossy(payload).into_owned(),
                ))),
                Behaviour::Panic => panic!("handler exploded"),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                }
            }
        }
    }

    async fn run_once(behaviour: Behaviour, max_attempts: u16, timeout: Duration) -> Task {
        let queue = InMemoryTaskQueue::new().paused();
        let id = queue
            .enqueue(
                EnqueuableTask::new("test", b"payload".to_vec(), timeout)
                    .with_max_attempts(max_attempts),
            )
            .await
            .unwrap();
        let mut stream = queue.subscribe_ready_tasks("test").await.unwrap();
        queue.notify_all().unwrap();
        let task = futures::StreamExt::next(&mut stream)
            .await
            .unwrap()
            .unwrap();

        let runner = TaskRunner::new(
            Arc::new(queue.clone()),
            Arc::new(TestHandler(behaviour)),
            Backoff::default(),
        );
        runner.execute_task(task).await;

        queue.get_task(&id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn success_completes_task() {
        let task = run_once(Behaviour::Succeed, 1, Duration::from_secs(1)).await;

        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.errors.is_empty());
    }

    #[tokio::test]
    async fn error_on_final_attempt_archives_task() {
        let task = run_once(Behaviour::Refuse, 1, Duration::from_secs(1)).await;

        assert_eq!(task.status, TaskStatus::Archived);
        assert_eq!(task.errors.len(), 1);
        assert_eq!(task.errors[0].error_type, "refused");
        assert_eq!(task.errors[0].details, "handler refused: payload");
    }

    #[tokio::test]
    async fn error_with_attempts_left_schedules_retry() {
        let before = Utc::now();
        let task = run_once(Behaviour::Refuse, 3, Duration::from_secs(1)).await;

        assert_eq!(task.status, TaskStatus::Retry);
        assert!(task.scheduled_at >= before + TimeDelta::milliseconds(3_600));
        assert!(task.scheduled_at <= Utc::now() + TimeDelta::milliseconds(4_400));
    }

    #[tokio::test]
    async fn panic_is_recorded() {
        let task = run_once(Behaviour::Panic, 1, Duration::from_secs(1)).await;

        assert_eq!(task.status, TaskStatus::Archived);
        assert_eq!(task.errors[0].error_type, ERROR_TYPE_PANIC);
        assert_eq!(task.errors[0].details, "handler exploded");
    }

    #[tokio::test]
    async fn timeout_is_recorded() {
        let task = run_once(Behaviour::Hang, 1, Duration::from_millis(20)).await;

        assert_eq!(task.status, TaskStatus::Archived);
        assert_eq!(task.errors[0].error_type, ERROR_TYPE_TIMEOUT);
    }
}
