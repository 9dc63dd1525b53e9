//! The worker pool consuming tasks from a [`TaskQueue`].
use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::StreamExt;
use tokio::{sync::Semaphore, task::JoinHandle};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{backoff::Backoff, runner::TaskRunner, QueueError, TaskHandler, TaskQueue};

/// Pause after the ready task stream reports an error, before asking it again.
const STREAM_ERROR_DELAY: Duration = Duration::from_secs(1);

/// Dispatches ready tasks to their registered handlers.
///
/// One pool of `concurrency` permits is shared by every task type: a task is only leased from
/// the queue once a permit is available, so at most `concurrency` tasks run at any time.
pub struct TaskServer {
    queue: Arc<dyn TaskQueue>,
    semaphore: Arc<Semaphore>,
    backoff: Backoff,
    cancellation_token: CancellationToken,
    tracker: TaskTracker,
    consumers: HashMap<String, JoinHandle<()>>,
}

impl TaskServer {
    pub fn new(queue: Arc<dyn TaskQueue>, concurrency: usize) -> Self {
        Self {
            queue,
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            backoff: Backoff::default(),
            cancellation_token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            consumers: HashMap::new(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Start consuming tasks of `task_type` with `handler`.
    ///
    /// Registering a second handler for the same type replaces the first.
    pub fn with_handler(
        mut self,
        task_type: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        let task_type = task_type.into();
        let runner = TaskRunner::new(self.queue.clone(), handler, self.backoff);
        let handle = tokio::spawn(consume(
            self.queue.clone(),
            task_type.clone(),
            runner,
            self.semaphore.clone(),
            self.tracker.clone(),
            self.cancellation_token.child_token(),
        ));
        if let Some(previous) = self.consumers.insert(task_type, handle) {
            previous.abort();
        }
        self
    }

    /// Stop leasing new tasks and wait for running ones to finish.
    pub async fn graceful_shutdown(self) -> Result<(), QueueError> {
        tracing::debug!("Shutting down task server");
        self.cancellation_token.cancel();
        let results = futures::future::join_all(self.consumers.into_values()).await;
        self.tracker.close();
        self.tracker.wait().await;
        results
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| QueueError::GracefulShutdownFailed)?;
        Ok(())
    }
}

async fn consume(
    queue: Arc<dyn TaskQueue>,
    task_type: String,
    runner: TaskRunner,
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
    cancellation_token: CancellationToken,
) {
    let mut stream = match queue.subscribe_ready_tasks(&task_type).await {
        Ok(stream) => stream,
        Err(error) => {
            tracing::error!(
                ?error,
                task_type = %task_type,
                "Failed to subscribe to {task_type} tasks: {error}"
            );
            return;
        }
    };

    loop {
        let permit = tokio::select! {
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = cancellation_token.cancelled() => break,
        };
        tokio::select! {
            next = stream.next() => match next {
                Some(Ok(task)) => {
                    let runner = runner.clone();
                    tracker.spawn(async move {
                        runner.execute_task(task).await;
                        drop(permit);
                    });
                }
                Some(Err(error)) => {
                    tracing::warn!(
                        ?error,
                        task_type = %task_type,
                        "Failed to get {task_type} tasks from stream: {error}"
                    );
                    tokio::time::sleep(STREAM_ERROR_DELAY).await;
                }
                None => break,
            },
            _ = cancellation_token.cancelled() => break,
        }
    }
    tracing::debug!("Shutting down task consumer for {task_type}");
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::queue::{
        memory::InMemoryTaskQueue, EnqueuableTask, ExecutionError, TaskId, TaskStatus,
    };
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct Recorder(mpsc::UnboundedSender<Vec<u8>>);

    #[async_trait]
    impl TaskHandler for Recorder {
        async fn handle(&self, payload: &[u8]) -> Result<(), Box<dyn ExecutionError>> {
            let _ = self.0.send(payload.to_vec());
            Ok(())
        }
    }

    #[derive(Default)]
    struct Slow {
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    #[async_trait]
    impl TaskHandler for Slow {
        async fn handle(&self, _payload: &[u8]) -> Result<(), Box<dyn ExecutionError>> {
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn task(task_type: &str, payload: &[u8]) -> EnqueuableTask {
        EnqueuableTask::new(task_type, payload.to_vec(), Duration::from_secs(5))
    }

    async fn wait_for_status(queue: &InMemoryTaskQueue, id: &TaskId, status: TaskStatus) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if queue.get_task(id).await.unwrap().unwrap().status == status {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn dispatches_tasks_to_handler_of_their_type() {
        let queue = InMemoryTaskQueue::new();
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let (other_sender, mut other_receiver) = mpsc::unbounded_channel();
        let server = TaskServer::new(Arc::new(queue.clone()), 2)
            .with_handler("generate", Arc::new(Recorder(sender)))
            .with_handler("other", Arc::new(Recorder(other_sender)));

        let id = queue.enqueue(task("generate", b"first")).await.unwrap();
        let other = queue.enqueue(task("other", b"second")).await.unwrap();

        assert_eq!(receiver.recv().await.unwrap(), b"first");
        assert_eq!(other_receiver.recv().await.unwrap(), b"second");
        wait_for_status(&queue, &id, TaskStatus::Completed).await;
        wait_for_status(&queue, &other, TaskStatus::Completed).await;

        server.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn concurrency_is_shared_across_task_types() {
        let queue = InMemoryTaskQueue::new();
        let handler = Arc::new(Slow::default());
        let server = TaskServer::new(Arc::new(queue.clone()), 2)
            .with_handler("a", handler.clone())
            .with_handler("b", handler.clone());

        let mut ids = vec![];
        for index in 0..6 {
            let task_type = if index % 2 == 0 { "a" } else { "b" };
            ids.push(queue.enqueue(task(task_type, b"")).await.unwrap());
        }
        for id in &ids {
            wait_for_status(&queue, id, TaskStatus::Completed).await;
        }

        assert!(handler.max_running.load(Ordering::SeqCst) <= 2);
        server.graceful_shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn graceful_shutdown_waits_for_running_tasks() {
        let queue = InMemoryTaskQueue::new();
        let handler = Arc::new(Slow::default());
        let server = TaskServer::new(Arc::new(queue.clone()), 1).with_handler("a", handler.clone());

        let id = queue.enqueue(task("a", b"")).await.unwrap();
        wait_for_status(&queue, &id, TaskStatus::Active).await;
        server.graceful_shutdown().await.unwrap();

        assert_eq!(
            queue.get_task(&id).await.unwrap().unwrap().status,
            TaskStatus::Completed
        );
    }

    #[tokio::test]
    async fn no_tasks_leased_after_shutdown() {
        let queue = InMemoryTaskQueue::new();
        let (sender, _receiver) = mpsc::unbounded_channel();
        let server =
            TaskServer::new(Arc::new(queue.clone()), 1).with_handler("a", Arc::new(Recorder(sender)));
        server.graceful_shutdown().await.unwrap();

        let id = queue.enqueue(task("a", b"")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            queue.get_task(&id).await.unwrap().unwrap().status,
            TaskStatus::Pending
        );
    }
}
