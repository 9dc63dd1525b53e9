//! Provides an in memory implementation of [`TaskQueue`].
//!
//! It is a correct (but not optimized) implementation intended for tests and local tooling.
//! Tasks do not survive the process.
use std::{
    collections::HashMap,
    ops::Sub,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, RwLock,
    },
};

use async_stream::stream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use super::{
    EnqueuableTask, QueueError, ReadyTasks, Task, TaskError, TaskFailure, TaskId, TaskQueue,
    TaskStatus,
};

struct ReadyTaskStream {
    queue: InMemoryTaskQueue,
    task_type: String,
    receiver: mpsc::UnboundedReceiver<DateTime<Utc>>,
}

impl ReadyTaskStream {
    const DEFAULT_DELAY: std::time::Duration = std::time::Duration::from_secs(30);
    const DELTA: std::time::Duration = std::time::Duration::from_millis(15);

    async fn next(&mut self) -> Result<Task, QueueError> {
        loop {
            let delay = match self.queue.next_ready_at(&self.task_type)? {
                Some(timestamp) => timestamp
                    .sub(Utc::now())
                    .to_std()
                    .unwrap_or(Self::DELTA)
                    .min(Self::DEFAULT_DELAY),
                None => Self::DEFAULT_DELAY,
            };
            if delay <= Self::DELTA {
                if let Some(task) = self.queue.lease_next(&self.task_type)? {
                    return Ok(task);
                }
            }
            tokio::select! {
                _ = self.receiver.recv() => {},
                _ = tokio::time::sleep(delay) => {},
            }
        }
    }
}

type Subscriber = mpsc::UnboundedSender<DateTime<Utc>>;

#[derive(Clone, Default)]
pub struct InMemoryTaskQueue {
    tasks: Arc<RwLock<Vec<Task>>>,
    subscribers: Arc<RwLock<HashMap<String, Vec<Subscriber>>>>,
    paused: Arc<AtomicBool>,
}

impl Task {
    /// When the task next becomes deliverable, if it ever does.
    fn ready_at(&self) -> Option<DateTime<Utc>> {
        match self.status {
            TaskStatus::Pending | TaskStatus::Retry => Some(self.scheduled_at),
            TaskStatus::Active => self.deadline,
            TaskStatus::Completed | TaskStatus::Archived => None,
        }
    }

    fn mark_task_active(&mut self, now: DateTime<Utc>) {
        self.attempt = self.attempt.saturating_add(1);
        self.status = TaskStatus::Active;
        self.deadline = Some(self.lease_deadline(now));
    }

    fn mark_task_complete(&mut self) {
        self.status = TaskStatus::Completed;
        self.deadline = None;
    }

    fn mark_task_retryable(&mut self, scheduled_at: DateTime<Utc>, failure: TaskFailure) {
        self.errors.push(failure.into_task_error(self.attempt));
        self.scheduled_at = scheduled_at;
        self.status = TaskStatus::Retry;
        self.deadline = None;
    }

    fn mark_task_archived(&mut self, failure: TaskFailure) {
        self.errors.push(failure.into_task_error(self.attempt));
        self.status = TaskStatus::Archived;
        self.deadline = None;
    }
}

impl TaskFailure {
    pub(crate) fn into_task_error(self, attempt: u16) -> TaskError {
        TaskError {
            attempt,
            error_type: self.error_type,
            details: self.message,
            recorded_at: Utc::now(),
        }
    }
}

impl EnqueuableTask {
    fn into_task(self, id: TaskId) -> Task {
        Task {
            id,
            task_type: self.task_type,
            payload: self.payload,
            status: TaskStatus::Pending,
            attempt: 0,
            max_attempts: self.max_attempts,
            timeout: self.timeout,
            errors: vec![],
            inserted_at: Utc::now(),
            scheduled_at: self.scheduled_at,
            deadline: None,
        }
    }
}

impl InMemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the queue in paused mode where subscribers are not woken when tasks are enqueued or
    /// rescheduled.
    ///
    /// Call [`InMemoryTaskQueue::notify_all`] to wake them.
    pub fn paused(self) -> Self {
        self.paused.store(true, Ordering::Relaxed);
        self
    }

    /// Wake every subscriber.
    pub fn notify_all(&self) -> Result<(), QueueError> {
        let now = Utc::now();
        self.subscribers
            .read()
            .map_err(|_| QueueError::BadState)?
            .values()
            .flatten()
            .for_each(|sender| {
                let _ = sender.send(now);
            });
        Ok(())
    }

    /// Every task in insertion order.
    pub fn tasks(&self) -> Result<Vec<Task>, QueueError> {
        Ok(self.tasks.read().map_err(|_| QueueError::BadState)?.clone())
    }

    fn next_ready_at(&self, task_type: &str) -> Result<Option<DateTime<Utc>>, QueueError> {
        Ok(self
            .tasks
            .read()
            .map_err(|_| QueueError::BadState)?
            .iter()
            .filter(|task| task.task_type == task_type)
            .filter_map(Task::ready_at)
            .min())
    }

    fn lease_next(&self, task_type: &str) -> Result<Option<Task>, QueueError> {
        let now = Utc::now();
        let mut tasks = self.tasks.write().map_err(|_| QueueError::BadState)?;
        let next = tasks
            .iter_mut()
            .filter(|task| {
                task.task_type == task_type && task.ready_at().is_some_and(|ready| ready <= now)
            })
            .min_by_key(|task| (task.ready_at(), task.inserted_at));
        Ok(next.map(|task| {
            if task.status == TaskStatus::Active {
                tracing::warn!(task_id = %task.id, "Lease of task {} expired, redelivering", task.id);
            }
            task.mark_task_active(now);
            task.clone()
        }))
    }

    fn notify_subscribers(
        &self,
        task_type: &str,
        scheduled_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        if !self.paused.load(Ordering::Relaxed) {
            if let Some(senders) = self
                .subscribers
                .read()
                .map_err(|_| QueueError::BadState)?
                .get(task_type)
            {
                senders.iter().for_each(|sender| {
                    let _ = sender.send(scheduled_at);
                });
            }
        }
        Ok(())
    }

    fn update_task(
        &self,
        id: &TaskId,
        update: impl FnOnce(&mut Task),
    ) -> Result<Task, QueueError> {
        let mut tasks = self.tasks.write().map_err(|_| QueueError::BadState)?;
        match tasks.iter_mut().find(|task| task.id == *id) {
            None => Err(QueueError::TaskNotFound(id.clone())),
            Some(task) => {
                update(task);
                Ok(task.clone())
            }
        }
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, task: EnqueuableTask) -> Result<TaskId, QueueError> {
        let id = TaskId::generate();
        let task = task.into_task(id.clone());
        let task_type = task.task_type.clone();
        let scheduled_at = task.scheduled_at;

        self.tasks
            .write()
            .map_err(|_| QueueError::BadState)?
            .push(task);
        self.notify_subscribers(&task_type, scheduled_at)?;

        Ok(id)
    }

    async fn subscribe_ready_tasks(&self, task_type: &str) -> Result<ReadyTasks, QueueError> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .map_err(|_| QueueError::BadState)?
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
        self.update_task(id, Task::mark_task_complete)?;
        Ok(())
    }

    async fn mark_task_retryable(
        &self,
        id: &TaskId,
        next_scheduled_at: DateTime<Utc>,
        failure: TaskFailure,
    ) -> Result<(), QueueError> {
        let task = self.update_task(id, |task| {
            task.mark_task_retryable(next_scheduled_at, failure)
        })?;
        self.notify_subscribers(&task.task_type, task.scheduled_at)
    }

    async fn mark_task_archived(
        &self,
        id: &TaskId,
        failure: TaskFailure,
    ) -> Result<(), QueueError> {
        self.update_task(id, |task| task.mark_task_archived(failure))?;
        Ok(())
    }

    async fn get_task(&self, id: &TaskId) -> Result<Option<Task>, QueueError> {
        Ok(self
            .tasks
            .read()
            .map_err(|_| QueueError::BadState)?
            .iter()
            .find(|task| task.id == *id)
            .cloned())
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use assert_matches::assert_matches;
    use chrono::TimeDelta;
    use futures::StreamExt;

    fn task(task_type: &str) -> EnqueuableTask {
        EnqueuableTask::new(task_type, b"payload".to_vec(), Duration::from_secs(60))
    }

    fn failure() -> TaskFailure {
        TaskFailure {
            error_type: "test".to_owned(),
            message: "it broke".to_owned(),
        }
    }

    #[tokio::test]
    async fn enqueue_creates_pending_task() {
        let queue = InMemoryTaskQueue::new();
        let id = queue.enqueue(task("generate").with_max_attempts(3)).await.unwrap();

        let task = queue.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempt, 0);
        assert_eq!(task.max_attempts, 3);
        assert_eq!(task.payload, b"payload");
        assert!(task.deadline.is_none());
    }

    #[tokio::test]
    async fn subscriber_leases_task_of_its_type() {
        let queue = InMemoryTaskQueue::new();
        let mut stream = queue.subscribe_ready_tasks("generate").await.unwrap();
        queue.enqueue(task("other")).await.unwrap();
        let id = queue.enqueue(task("generate")).await.unwrap();

        let leased = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(leased.id, id);
        assert_eq!(leased.status, TaskStatus::Active);
        assert_eq!(leased.attempt, 1);
        assert!(leased.deadline.is_some());
        assert_eq!(
            queue.get_task(&id).await.unwrap().unwrap().status,
            TaskStatus::Active
        );
    }

    #[tokio::test]
    async fn tasks_are_leased_oldest_first() {
        let queue = InMemoryTaskQueue::new().paused();
        let later = queue
            .enqueue(task("generate").with_scheduled_at(Utc::now() - TimeDelta::seconds(1)))
            .await
            .unwrap();
        let earlier = queue
            .enqueue(task("generate").with_scheduled_at(Utc::now() - TimeDelta::seconds(10)))
            .await
            .unwrap();

        assert_eq!(queue.lease_next("generate").unwrap().unwrap().id, earlier);
        assert_eq!(queue.lease_next("generate").unwrap().unwrap().id, later);
        assert_matches!(queue.lease_next("generate"), Ok(None));
    }

    #[tokio::test]
    async fn future_tasks_are_not_leased() {
        let queue = InMemoryTaskQueue::new();
        queue
            .enqueue(task("generate").with_scheduled_at(Utc::now() + TimeDelta::hours(1)))
            .await
            .unwrap();

        assert_matches!(queue.lease_next("generate"), Ok(None));
    }

    #[tokio::test]
    async fn expired_lease_is_redelivered() {
        let queue = InMemoryTaskQueue::new();
        let id = queue
            .enqueue(EnqueuableTask::new("generate", vec![], Duration::ZERO))
            .await
            .unwrap();
        queue.lease_next("generate").unwrap().unwrap();
        assert_matches!(queue.lease_next("generate"), Ok(None));

        queue
            .update_task(&id, |task| {
                task.deadline = Some(Utc::now() - TimeDelta::seconds(1))
            })
            .unwrap();

        let redelivered = queue.lease_next("generate").unwrap().unwrap();
        assert_eq!(redelivered.id, id);
        assert_eq!(redelivered.attempt, 2);
    }

    #[tokio::test]
    async fn paused_queue_does_not_wake_subscribers() {
        let queue = InMemoryTaskQueue::new().paused();
        let mut stream = queue.subscribe_ready_tasks("generate").await.unwrap();
        let handle = tokio::spawn(async move {
            match tokio::time::timeout(Duration::from_millis(500), stream.next()).await {
                Ok(Some(Ok(_task))) => panic!("Should not get woken up"),
                Err(_) => {}
                _ => panic!("Bad things happened"),
            }
        });
        tokio::task::yield_now().await;
        queue.enqueue(task("generate")).await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn notify_all_wakes_paused_subscribers() {
        let queue = InMemoryTaskQueue::new().paused();
        let mut stream = queue.subscribe_ready_tasks("generate").await.unwrap();
        let handle = tokio::spawn(async move {
            match tokio::time::timeout(Duration::from_secs(1), stream.next()).await {
                Ok(Some(Ok(task))) => assert_eq!(task.task_type, "generate"),
                Err(_) => panic!("Didn't get woken by notify_all"),
                _ => panic!("Bad things happened"),
            }
        });
        tokio::task::yield_now().await;
        queue.enqueue(task("generate")).await.unwrap();
        queue.notify_all().unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn retry_and_archive_record_errors() {
        let queue = InMemoryTaskQueue::new().paused();
        let id = queue.enqueue(task("generate").with_max_attempts(2)).await.unwrap();
        queue.lease_next("generate").unwrap().unwrap();

        let next = Utc::now() + TimeDelta::seconds(4);
        queue.mark_task_retryable(&id, next, failure()).await.unwrap();
        let task = queue.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Retry);
        assert_eq!(task.scheduled_at, next);
        assert_eq!(task.errors.len(), 1);
        assert_eq!(task.errors[0].attempt, 1);
        assert_eq!(task.errors[0].error_type, "test");
        assert_eq!(task.errors[0].details, "it broke");

        queue.mark_task_archived(&id, failure()).await.unwrap();
        let task = queue.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Archived);
        assert_eq!(task.errors.len(), 2);
        assert_matches!(queue.lease_next("generate"), Ok(None));
    }

    #[tokio::test]
    async fn completed_tasks_are_not_redelivered() {
        let queue = InMemoryTaskQueue::new().paused();
        let id = queue.enqueue(task("generate")).await.unwrap();
        queue.lease_next("generate").unwrap().unwrap();
        queue.mark_task_complete(&id).await.unwrap();

        assert_eq!(
            queue.get_task(&id).await.unwrap().unwrap().status,
            TaskStatus::Completed
        );
        assert_matches!(queue.next_ready_at("generate"), Ok(None));
    }

    #[tokio::test]
    async fn marking_unknown_task_fails() {
        let queue = InMemoryTaskQueue::new();
        let id = TaskId::from("missing");

        assert_matches!(
            queue.mark_task_complete(&id).await,
            Err(QueueError::TaskNotFound(_))
        );
        assert_matches!(
            queue.mark_task_archived(&id, failure()).await,
            Err(QueueError::TaskNotFound(_))
        );
    }

    #[tokio::test]
    async fn badstate_errors() {
        let queue = InMemoryTaskQueue::new();
        let id = queue.enqueue(task("generate")).await.unwrap();

        tokio::task::spawn({
            let queue = queue.clone();
            async move {
                let _guard = queue.tasks.write();
                panic!()
            }
        })
        .await
        .unwrap_err();

        assert_matches!(queue.enqueue(task("generate")).await, Err(QueueError::BadState));
        assert_matches!(queue.mark_task_complete(&id).await, Err(QueueError::BadState));
        assert_matches!(queue.get_task(&id).await, Err(QueueError::BadState));
    }
}
