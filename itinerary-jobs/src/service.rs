//! The job orchestration service.
//!
//! [`JobService`] is the only writer of job state. On the producer side it applies admission
//! control, prepares jobs and hands them to the task queue; on the consumer side
//! [`JobService::execute`] drives a job from `pending` to `completed` or `failed`.
//!
//! Stopping a job is cooperative: before every step of an execution the stored status is read
//! again, and the execution is abandoned with [`JobServiceError::Cancelled`] once the job has been
//! stopped or deleted. Because every transition is a compare-and-set in the store, a worker
//! finishing late cannot overwrite a `stopped` job either.
use std::{fmt::Display, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tracing::instrument;

use crate::{
    config::Config,
    file_manager::{FileManagers, FileReader, LOCAL},
    itinerary::{Itinerary, ItineraryError, ItineraryId, UserId},
    job::{ItineraryFileJob, JobId, JobStatus},
    llm::LlmGateway,
    payload::{AsyncTaskPayload, GENERATE_FILE_TASK},
    prompt::PromptBuilder,
    queue::{EnqueuableTask, ExecutionError, QueueError, TaskHandler, TaskId, TaskQueue},
    store::{JobStore, StoreError},
};

/// The external step of an execution that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Prompt,
    Generation,
    FileSave,
    FileOpen,
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Stage::Prompt => "Building the prompt",
            Stage::Generation => "Generating the itinerary",
            Stage::FileSave => "Saving the itinerary file",
            Stage::FileOpen => "Opening the itinerary file",
        })
    }
}

/// Why admission control refused a new job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("{0} already has a file being generated")]
    ItineraryBusy(ItineraryId),
    #[error("{user_id} already has {limit} files being generated")]
    UserLimitReached { user_id: UserId, limit: u32 },
}

#[derive(Debug, Error)]
pub enum JobServiceError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Persistence error: {0}")]
    Persistence(#[from] StoreError),
    #[error("{stage} failed: {message}")]
    ExternalService { stage: Stage, message: String },
    #[error("Request rejected: {0}")]
    PolicyRejection(#[from] Rejection),
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("{0} was stopped or deleted")]
    Cancelled(JobId),
    #[error("{id} has already finished with status {status}")]
    AlreadyFinished { id: JobId, status: JobStatus },
    #[error("{id} did not finish within {after:?}")]
    TimedOut { id: JobId, after: Duration },
}

impl JobServiceError {
    fn external(stage: Stage, error: impl Display) -> Self {
        Self::ExternalService {
            stage,
            message: error.to_string(),
        }
    }
}

impl From<ItineraryError> for JobServiceError {
    fn from(value: ItineraryError) -> Self {
        Self::InvalidArgument(value.to_string())
    }
}

impl ExecutionError for JobServiceError {
    fn error_type(&self) -> &'static str {
        match self {
            JobServiceError::InvalidArgument(_) => "invalid_argument",
            JobServiceError::Persistence(_) => "persistence",
            JobServiceError::ExternalService { .. } => "external_service",
            JobServiceError::PolicyRejection(_) => "policy_rejection",
            JobServiceError::Queue(_) => "queue",
            JobServiceError::Cancelled(_) => "cancelled",
            JobServiceError::AlreadyFinished { .. } => "already_finished",
            JobServiceError::TimedOut { .. } => "timed_out",
        }
    }
}

type Result<T> = std::result::Result<T, JobServiceError>;

/// Policy parameters of the [`JobService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSettings {
    /// Storage backend recorded on newly prepared jobs.
    pub file_manager: String,
    pub task_timeout: Duration,
    pub max_attempts: u16,
    /// Jobs a user may have in flight at once. Zero disables the limit.
    pub max_jobs_per_user: u32,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for ServiceSettings {
    fn from(config: &Config) -> Self {
        Self {
            file_manager: config.file_manager.clone(),
            task_timeout: config.task_timeout(),
            max_attempts: config.task_max_attempts,
            max_jobs_per_user: config.max_jobs_per_user,
        }
    }
}

#[derive(Clone)]
pub struct JobService {
    store: Arc<dyn JobStore>,
    queue: Arc<dyn TaskQueue>,
    llm: Arc<dyn LlmGateway>,
    file_managers: FileManagers,
    prompt_builder: PromptBuilder,
    settings: ServiceSettings,
}

impl JobService {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<dyn TaskQueue>,
        llm: Arc<dyn LlmGateway>,
        file_managers: FileManagers,
    ) -> Self {
        Self {
            store,
            queue,
            llm,
            file_managers,
            prompt_builder: PromptBuilder::new(),
            settings: ServiceSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: ServiceSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_prompt_builder(mut self, prompt_builder: PromptBuilder) -> Self {
        self.prompt_builder = prompt_builder;
        self
    }

    pub fn settings(&self) -> &ServiceSettings {
        &self.settings
    }

    /// The storage backend for new jobs, `"local"` when none is configured.
    fn file_manager(&self) -> &str {
        match self.settings.file_manager.trim() {
            "" => LOCAL,
            file_manager => file_manager,
        }
    }

    /// Admit, prepare and enqueue a job generating a file for the itinerary.
    ///
    /// Returns the job as it was enqueued. Its outcome has to be polled with
    /// [`JobService::get_job`].
    #[instrument(skip(self, itinerary), fields(itinerary_id = %itinerary.id, job_id = tracing::field::Empty))]
    pub async fn request_file(&self, itinerary: &Itinerary) -> Result<ItineraryFileJob> {
        self.admit(itinerary).await?;
        let payload = self.prepare_job(itinerary).await?;
        let mut job = payload.job.clone();
        tracing::Span::current().record("job_id", tracing::field::display(job.id));

        let task_id = match self.enqueue(&payload).await {
            Ok(task_id) => task_id,
            Err(error) => {
                self.fail_best_effort(&mut job, &error.to_string()).await;
                return Err(error);
            }
        };
        if let Err(error) = self.add_async_task_id(&mut job, &task_id).await {
            tracing::error!(
                ?error,
                job_id = %job.id,
                task_id = %task_id,
                "Failed to attach task {task_id} to job {}: {error}",
                job.id
            );
        }
        Ok(job)
    }

    /// Refuse a new job when the itinerary already has one in flight or its owner has reached
    /// the per user limit.
    ///
    /// The counts are not locked against concurrent requests, so two simultaneous requests can
    /// both be admitted.
    pub async fn admit(&self, itinerary: &Itinerary) -> Result<()> {
        validate_ids(itinerary)?;
        if self
            .store
            .in_progress_count_for_itinerary(itinerary.id)
            .await?
            > 0
        {
            tracing::warn!(itinerary_id = %itinerary.id, "Rejected job for busy itinerary");
            return Err(Rejection::ItineraryBusy(itinerary.id).into());
        }

        let limit = self.settings.max_jobs_per_user;
        if limit > 0
            && self
                .store
                .in_progress_count_for_user(itinerary.user_id)
                .await?
                >= u64::from(limit)
        {
            tracing::warn!(user_id = %itinerary.user_id, limit, "Rejected job over user limit");
            return Err(Rejection::UserLimitReached {
                user_id: itinerary.user_id,
                limit,
            }
            .into());
        }
        Ok(())
    }

    /// Persist a new `pending` job and bundle it with the itinerary snapshot.
    #[instrument(skip(self, itinerary), fields(itinerary_id = %itinerary.id))]
    pub async fn prepare_job(&self, itinerary: &Itinerary) -> Result<AsyncTaskPayload> {
        validate_ids(itinerary)?;
        itinerary.validate()?;

        let job = self.store.prepare(itinerary, self.file_manager()).await?;
        tracing::debug!(job_id = %job.id, "Prepared job {}", job.id);
        Ok(AsyncTaskPayload {
            itinerary: itinerary.clone(),
            job,
        })
    }

    /// Submit the payload to the task queue, returning the queue's task identifier.
    pub async fn enqueue(&self, payload: &AsyncTaskPayload) -> Result<TaskId> {
        if self.settings.task_timeout.is_zero() {
            return Err(JobServiceError::InvalidArgument(
                "task timeout must be positive".to_owned(),
            ));
        }
        let task = EnqueuableTask::new(
            GENERATE_FILE_TASK,
            payload.encode()?,
            self.settings.task_timeout,
        )
        .with_max_attempts(self.settings.max_attempts);
        let task_id = self.queue.enqueue(task).await?;
        tracing::debug!(job_id = %payload.job.id, task_id = %task_id, "Enqueued job {}", payload.job.id);
        Ok(task_id)
    }

    /// Record the queue task carrying the job.
    pub async fn add_async_task_id(
        &self,
        job: &mut ItineraryFileJob,
        task_id: &TaskId,
    ) -> Result<()> {
        validate_job_id(job.id)?;
        if task_id.as_str().is_empty() {
            return Err(JobServiceError::InvalidArgument(
                "task id must not be empty".to_owned(),
            ));
        }
        self.store.set_async_task_id(job.id, task_id.as_str()).await?;
        job.async_task_id = Some(task_id.to_string());
        Ok(())
    }

    /// Run a job: generate the itinerary document, store it and mark the job `completed`.
    ///
    /// Every failure other than a stop or deletion leaves the job `failed` with the failure as its
    /// description, and is returned so the queue can act on it too. A run is limited to nine
    /// tenths of the task timeout and fails the job once that has elapsed, ahead of the queue
    /// abandoning the task.
    #[instrument(skip(self, payload), fields(job_id = %payload.job.id, itinerary_id = %payload.itinerary.id))]
    pub async fn execute(&self, payload: AsyncTaskPayload) -> Result<ItineraryFileJob> {
        let AsyncTaskPayload { itinerary, mut job } = payload;
        validate_job_id(job.id)?;

        let budget = self.execution_budget();
        match tokio::time::timeout(budget, self.run(&itinerary, &mut job)).await {
            Ok(Ok(())) => Ok(job),
            Ok(Err(error)) => Err(error),
            Err(_) => {
                tracing::error!(job_id = %job.id, ?budget, "Job {} timed out", job.id);
                let error = JobServiceError::TimedOut {
                    id: job.id,
                    after: budget,
                };
                Err(self.abort(&mut job, error).await)
            }
        }
    }

    fn execution_budget(&self) -> Duration {
        let timeout = self.settings.task_timeout;
        timeout - timeout / 10
    }

    async fn run(&self, itinerary: &Itinerary, job: &mut ItineraryFileJob) -> Result<()> {
        self.checkpoint(job).await?;
        if let Err(error) = self.store.start(job).await {
            tracing::error!(?error, job_id = %job.id, "Failed to start job {}: {error}", job.id);
            return Err(self.abort(job, error.into()).await);
        }
        tracing::debug!(job_id = %job.id, "Started job {}", job.id);

        self.checkpoint_or_fail(job).await?;
        let messages = match self.prompt_builder.messages(itinerary) {
            Ok(messages) => messages,
            Err(error) => {
                return Err(self
                    .abort(job, JobServiceError::external(Stage::Prompt, error))
                    .await)
            }
        };

        self.checkpoint_or_fail(job).await?;
        let content = match self.llm.generate(&messages).await {
            Ok(content) => content,
            Err(error) => {
                return Err(self
                    .abort(job, JobServiceError::external(Stage::Generation, error))
                    .await)
            }
        };

        self.checkpoint_or_fail(job).await?;
        let file_manager = self.file_managers.resolve(&job.file_manager);
        let path = file_path(itinerary);
        if let Err(error) = file_manager.save(&path, content.as_bytes()).await {
            job.file_path = Some(path);
            return Err(self
                .abort(job, JobServiceError::external(Stage::FileSave, error))
                .await);
        }

        if let Err(error) = self.checkpoint(job).await {
            if matches!(error, JobServiceError::Cancelled(_)) {
                let _ = file_manager.delete(&path).await.inspect_err(|err| {
                    tracing::error!(?err, path = %path, "Failed to remove file of cancelled job: {err}")
                });
            }
            return Err(self.abort(job, error).await);
        }
        if let Err(error) = self.store.complete(job, &path).await {
            tracing::error!(
                ?error,
                job_id = %job.id,
                path = %path,
                "Saved file for job {} but failed to complete it: {error}",
                job.id
            );
            return Err(self.abort(job, error.into()).await);
        }
        tracing::debug!(job_id = %job.id, path = %path, "Completed job {}", job.id);
        Ok(())
    }

    /// Fail a job whose execution was abandoned without reaching a terminal status.
    async fn fail_abandoned(&self, id: JobId, reason: &str) {
        match self.store.get(id).await {
            Ok(Some(mut job)) if job.status.is_in_progress() => {
                self.fail_best_effort(&mut job, reason).await
            }
            Ok(_) => {}
            Err(error) => tracing::error!(
                ?error,
                job_id = %id,
                "Failed to look up abandoned job {id}: {error}"
            ),
        }
    }

    /// Stop a job on behalf of its user.
    ///
    /// Stopping a job that is no longer in progress does nothing. If the stop cannot be persisted
    /// `job` keeps its previous status.
    #[instrument(skip(self, job), fields(job_id = %job.id, status = %job.status))]
    pub async fn stop_job(&self, job: &mut ItineraryFileJob) -> Result<()> {
        validate_job_id(job.id)?;
        if !job.status.is_in_progress() {
            tracing::debug!(job_id = %job.id, "Job {} is {}, nothing to stop", job.id, job.status);
            return Ok(());
        }
        self.store.stop(job).await?;
        tracing::debug!(job_id = %job.id, "Stopped job {}", job.id);
        Ok(())
    }

    /// Soft delete a job. Its file is reclaimed later by the reaper.
    #[instrument(skip(self))]
    pub async fn delete_job(&self, id: JobId) -> Result<()> {
        validate_job_id(id)?;
        self.store.soft_delete(id).await?;
        tracing::debug!(job_id = %id, "Deleted job {id}");
        Ok(())
    }

    /// Soft delete every job of an itinerary that is being deleted.
    #[instrument(skip(self))]
    pub async fn delete_itinerary_jobs(&self, itinerary_id: ItineraryId) -> Result<u64> {
        if i32::from(itinerary_id) == 0 {
            return Err(JobServiceError::InvalidArgument(
                "itinerary id must not be zero".to_owned(),
            ));
        }
        Ok(self.store.soft_delete_itinerary_jobs(itinerary_id).await?)
    }

    pub async fn get_job(&self, id: JobId) -> Result<Option<ItineraryFileJob>> {
        validate_job_id(id)?;
        Ok(self.store.get(id).await?)
    }

    pub async fn list_jobs(&self, itinerary_id: ItineraryId) -> Result<Vec<ItineraryFileJob>> {
        Ok(self.store.list_for_itinerary(itinerary_id).await?)
    }

    /// Open the generated file of a completed job through the backend it was written with.
    pub async fn open_file(&self, job: &ItineraryFileJob) -> Result<FileReader> {
        let path = match (job.status, job.file_path.as_deref()) {
            (JobStatus::Completed, Some(path)) => path,
            _ => {
                return Err(JobServiceError::InvalidArgument(format!(
                    "{} has no file, its status is {}",
                    job.id, job.status
                )))
            }
        };
        self.file_managers
            .resolve(&job.file_manager)
            .open(path)
            .await
            .map_err(|error| JobServiceError::external(Stage::FileOpen, error))
    }

    /// Abandon the execution when the job was stopped or deleted since it was last looked at.
    async fn checkpoint(&self, job: &ItineraryFileJob) -> Result<()> {
        match self.store.get(job.id).await? {
            None => {
                tracing::info!(job_id = %job.id, "Job {} was deleted, abandoning it", job.id);
                Err(JobServiceError::Cancelled(job.id))
            }
            Some(stored) if stored.status == JobStatus::Stopped => {
                tracing::info!(job_id = %job.id, "Job {} was stopped, abandoning it", job.id);
                Err(JobServiceError::Cancelled(job.id))
            }
            Some(stored) if !stored.status.is_in_progress() => {
                Err(JobServiceError::AlreadyFinished {
                    id: job.id,
                    status: stored.status,
                })
            }
            Some(_) => Ok(()),
        }
    }

    async fn checkpoint_or_fail(&self, job: &mut ItineraryFileJob) -> Result<()> {
        match self.checkpoint(job).await {
            Ok(()) => Ok(()),
            Err(error) => Err(self.abort(job, error).await),
        }
    }

    /// Fail the job for anything but a cancellation, and hand the error back.
    async fn abort(&self, job: &mut ItineraryFileJob, error: JobServiceError) -> JobServiceError {
        if !matches!(
            error,
            JobServiceError::Cancelled(_) | JobServiceError::AlreadyFinished { .. }
        ) {
            self.fail_best_effort(job, &error.to_string()).await;
        }
        error
    }

    /// The job is already failing, so a failure to record that is only logged.
    async fn fail_best_effort(&self, job: &mut ItineraryFileJob, reason: &str) {
        match self.store.fail(job, reason).await {
            Ok(()) => tracing::warn!(job_id = %job.id, "Job {} failed: {reason}", job.id),
            Err(error) => tracing::error!(
                ?error,
                job_id = %job.id,
                "Failed to mark job {} as failed ({reason}): {error}",
                job.id
            ),
        }
    }
}

/// Storage path for a generated file. The random component keeps repeated generations for the
/// same itinerary apart.
fn file_path(itinerary: &Itinerary) -> String {
    format!(
        "itineraries/{}/{}/{}.md",
        i32::from(itinerary.user_id),
        i32::from(itinerary.id),
        uuid::Uuid::new_v4()
    )
}

fn validate_ids(itinerary: &Itinerary) -> Result<()> {
    if i32::from(itinerary.id) == 0 {
        return Err(JobServiceError::InvalidArgument(
            "itinerary id must not be zero".to_owned(),
        ));
    }
    if i32::from(itinerary.user_id) == 0 {
        return Err(JobServiceError::InvalidArgument(
            "user id must not be zero".to_owned(),
        ));
    }
    Ok(())
}

fn validate_job_id(id: JobId) -> Result<()> {
    if i32::from(id) == 0 {
        return Err(JobServiceError::InvalidArgument(
            "job id must not be zero".to_owned(),
        ));
    }
    Ok(())
}

/// Executes [`GENERATE_FILE_TASK`] tasks with a [`JobService`].
#[derive(Clone)]
pub struct JobExecutor {
    service: JobService,
}

impl JobExecutor {
    pub fn new(service: JobService) -> Self {
        Self { service }
    }
}

#[async_trait]
impl TaskHandler for JobExecutor {
    async fn handle(&self, payload: &[u8]) -> std::result::Result<(), Box<dyn ExecutionError>> {
        let payload = AsyncTaskPayload::decode(payload).map_err(|error| {
            tracing::error!(?error, "Failed to decode task payload: {error}");
            Box::new(JobServiceError::from(error)) as Box<dyn ExecutionError>
        })?;
        let id = payload.job.id;
        let execution = match AssertUnwindSafe(self.service.execute(payload))
            .catch_unwind()
            .await
        {
            Ok(execution) => execution,
            Err(panic) => {
                self.service
                    .fail_abandoned(id, "Job execution panicked")
                    .await;
                std::panic::resume_unwind(panic);
            }
        };
        match execution {
            Ok(_) => Ok(()),
            // Nothing left to do for the task.
            Err(JobServiceError::Cancelled(_) | JobServiceError::AlreadyFinished { .. }) => Ok(()),
            Err(error) => Err(Box::new(error)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        file_manager::{memory::InMemoryFileManager, FileManagerError, MockFileManager},
        llm::{ChatMessage, LlmError, MockLlmGateway, Role},
        prompt::SYSTEM_PERSONA,
        queue::memory::InMemoryTaskQueue,
        store::memory::{InMemoryJobStore, StoreOperation},
        testing::mock_itinerary,
    };
    use assert_matches::assert_matches;
    use tokio::io::AsyncReadExt;

    const GENERATED: &str = "# Day 1\nRome";

    struct Fixture {
        store: InMemoryJobStore,
        queue: InMemoryTaskQueue,
        files: InMemoryFileManager,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: InMemoryJobStore::new(),
                queue: InMemoryTaskQueue::new().paused(),
                files: InMemoryFileManager::new(),
            }
        }

        fn service(&self, llm: MockLlmGateway) -> JobService {
            self.service_with(Arc::new(llm))
        }

        fn service_with(&self, llm: Arc<dyn LlmGateway>) -> JobService {
            JobService::new(
                Arc::new(self.store.clone()),
                Arc::new(self.queue.clone()),
                llm,
                FileManagers::new(LOCAL, Arc::new(self.files.clone())),
            )
        }

        fn stored(&self, id: JobId) -> ItineraryFileJob {
            self.store
                .all_jobs()
                .into_iter()
                .find(|job| job.id == id)
                .unwrap()
        }
    }

    fn llm_returning(content: &'static str) -> MockLlmGateway {
        let mut llm = MockLlmGateway::new();
        llm.expect_generate()
            .returning(move |_| Ok(content.to_owned()));
        llm
    }

    fn llm_never_called() -> MockLlmGateway {
        let mut llm = MockLlmGateway::new();
        llm.expect_generate().never();
        llm
    }

    #[tokio::test]
    async fn prepare_job_creates_pending_job_with_local_backend() {
        let fixture = Fixture::new();
        let service = fixture.service(llm_never_called());

        let payload = service.prepare_job(&mock_itinerary(1, 1)).await.unwrap();

        assert_eq!(payload.job.status, JobStatus::Pending);
        assert_ne!(i32::from(payload.job.id), 0);
        assert_eq!(payload.job.file_manager, "local");
        assert_eq!(payload.itinerary, mock_itinerary(1, 1));
    }

    #[tokio::test]
    async fn prepare_job_records_configured_backend() {
        let fixture = Fixture::new();
        let service = fixture.service(llm_never_called()).with_settings(ServiceSettings {
            file_manager: "s3".to_owned(),
            ..Default::default()
        });

        let payload = service.prepare_job(&mock_itinerary(1, 1)).await.unwrap();
        assert_eq!(payload.job.file_manager, "s3");

        let service = service.with_settings(ServiceSettings {
            file_manager: String::new(),
            ..Default::default()
        });
        let payload = service.prepare_job(&mock_itinerary(2, 1)).await.unwrap();
        assert_eq!(payload.job.file_manager, "local");
    }

    #[tokio::test]
    async fn prepare_job_rejects_invalid_itineraries() {
        let fixture = Fixture::new();
        let service = fixture.service(llm_never_called());

        assert_matches!(
            service.prepare_job(&mock_itinerary(0, 1)).await,
            Err(JobServiceError::InvalidArgument(_))
        );
        let mut itinerary = mock_itinerary(1, 1);
        itinerary.destinations.clear();
        assert_matches!(
            service.prepare_job(&itinerary).await,
            Err(JobServiceError::InvalidArgument(_))
        );
        assert!(fixture.store.all_jobs().is_empty());
    }

    #[tokio::test]
    async fn prepare_job_propagates_persistence_errors() {
        let fixture = Fixture::new();
        let service = fixture.service(llm_never_called());
        fixture.store.fail_next(StoreOperation::Prepare);

        assert_matches!(
            service.prepare_job(&mock_itinerary(1, 1)).await,
            Err(JobServiceError::Persistence(StoreError::Database(_)))
        );
    }

    #[tokio::test]
    async fn request_file_enqueues_and_records_task() {
        let fixture = Fixture::new();
        let service = fixture.service(llm_never_called());

        let job = service.request_file(&mock_itinerary(1, 1)).await.unwrap();

        let task_id = TaskId::from(job.async_task_id.clone().unwrap());
        assert_eq!(fixture.stored(job.id).async_task_id, job.async_task_id);
        let task = fixture.queue.get_task(&task_id).await.unwrap().unwrap();
        assert_eq!(task.task_type, GENERATE_FILE_TASK);
        assert_eq!(task.timeout, Duration::from_secs(300));
        let payload = AsyncTaskPayload::decode(&task.payload).unwrap();
        assert_eq!(payload.job.id, job.id);
        assert_eq!(payload.itinerary, mock_itinerary(1, 1));
    }

    #[tokio::test]
    async fn request_file_rejects_busy_itinerary() {
        let fixture = Fixture::new();
        let service = fixture.service(llm_never_called());
        service.request_file(&mock_itinerary(1, 1)).await.unwrap();

        assert_matches!(
            service.request_file(&mock_itinerary(1, 1)).await,
            Err(JobServiceError::PolicyRejection(Rejection::ItineraryBusy(id))) if i32::from(id) == 1
        );
        assert_eq!(fixture.store.all_jobs().len(), 1);
    }

    #[tokio::test]
    async fn request_file_rejects_user_over_limit() {
        let fixture = Fixture::new();
        let service = fixture.service(llm_never_called()).with_settings(ServiceSettings {
            max_jobs_per_user: 2,
            ..Default::default()
        });
        service.request_file(&mock_itinerary(1, 1)).await.unwrap();
        service.request_file(&mock_itinerary(2, 1)).await.unwrap();

        assert_matches!(
            service.request_file(&mock_itinerary(3, 1)).await,
            Err(JobServiceError::PolicyRejection(Rejection::UserLimitReached { limit: 2, .. }))
        );
        // Other users are not affected.
        service.request_file(&mock_itinerary(4, 2)).await.unwrap();
    }

    #[tokio::test]
    async fn user_limit_of_zero_is_unlimited() {
        let fixture = Fixture::new();
        let service = fixture.service(llm_never_called()).with_settings(ServiceSettings {
            max_jobs_per_user: 0,
            ..Default::default()
        });

        for id in 1..=5 {
            service.request_file(&mock_itinerary(id, 1)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn finished_jobs_do_not_count_towards_admission() {
        let fixture = Fixture::new();
        let service = fixture.service(llm_never_called());
        let mut job = service.request_file(&mock_itinerary(1, 1)).await.unwrap();
        service.stop_job(&mut job).await.unwrap();

        service.request_file(&mock_itinerary(1, 1)).await.unwrap();
    }

    #[tokio::test]
    async fn request_file_fails_job_when_enqueue_fails() {
        let fixture = Fixture::new();
        let service = fixture.service(llm_never_called()).with_settings(ServiceSettings {
            task_timeout: Duration::ZERO,
            ..Default::default()
        });

        assert_matches!(
            service.request_file(&mock_itinerary(1, 1)).await,
            Err(JobServiceError::InvalidArgument(_))
        );
        let jobs = fixture.store.all_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Failed);
        // The failed job does not block a later request.
        assert!(service.admit(&mock_itinerary(1, 1)).await.is_ok());
    }

    #[tokio::test]
    async fn execute_generates_and_stores_file() {
        let fixture = Fixture::new();
        let mut llm = MockLlmGateway::new();
        llm.expect_generate()
            .withf(|messages| {
                messages.len() == 2
                    && messages[0].role == Role::System
                    && messages[0].content == SYSTEM_PERSONA
                    && messages[1].role == Role::User
                    && messages[1].content.contains("Florence")
            })
            .times(1)
            .returning(|_| Ok(GENERATED.to_owned()));
        let service = fixture.service(llm);
        let payload = service.prepare_job(&mock_itinerary(12, 7)).await.unwrap();

        let job = service.execute(payload).await.unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.status_description, crate::job::COMPLETED_DESCRIPTION);
        assert!(job.start_date.is_some());
        assert!(job.end_date.is_some());
        let path = job.file_path.clone().unwrap();
        assert!(path.starts_with("itineraries/7/12/"));
        assert!(path.ends_with(".md"));
        assert_eq!(fixture.files.content(&path).unwrap(), GENERATED.as_bytes());
        assert_eq!(fixture.stored(job.id), job);
    }

    #[tokio::test]
    async fn repeated_generations_use_distinct_paths() {
        let fixture = Fixture::new();
        let service = fixture.service(llm_returning(GENERATED));

        let first = service.prepare_job(&mock_itinerary(1, 1)).await.unwrap();
        let first = service.execute(first).await.unwrap();
        let second = service.prepare_job(&mock_itinerary(1, 1)).await.unwrap();
        let second = service.execute(second).await.unwrap();

        assert_ne!(first.file_path, second.file_path);
        assert_eq!(fixture.files.paths().len(), 2);
    }

    #[tokio::test]
    async fn execute_llm_failure_fails_job_without_file() {
        let fixture = Fixture::new();
        let mut llm = MockLlmGateway::new();
        llm.expect_generate()
            .returning(|_| Err(LlmError::Unavailable("rate limited".to_owned())));
        let service = fixture.service(llm);
        let payload = service.prepare_job(&mock_itinerary(1, 1)).await.unwrap();
        let id = payload.job.id;

        assert_matches!(
            service.execute(payload).await,
            Err(JobServiceError::ExternalService {
                stage: Stage::Generation,
                ..
            })
        );

        let job = fixture.stored(id);
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.status_description.contains("rate limited"));
        assert_eq!(job.file_path, None);
        assert!(job.end_date.is_some());
        assert!(fixture.files.paths().is_empty());
    }

    #[tokio::test]
    async fn execute_prompt_failure_fails_job() {
        let fixture = Fixture::new();
        let service = fixture.service(llm_never_called());
        let mut payload = service.prepare_job(&mock_itinerary(1, 1)).await.unwrap();
        payload.itinerary.destinations.clear();
        let id = payload.job.id;

        assert_matches!(
            service.execute(payload).await,
            Err(JobServiceError::ExternalService {
                stage: Stage::Prompt,
                ..
            })
        );
        assert_eq!(fixture.stored(id).status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn execute_save_failure_records_partial_path() {
        let fixture = Fixture::new();
        let mut files = MockFileManager::new();
        files
            .expect_save()
            .returning(|path, _| Err(FileManagerError::InvalidPath(path.to_owned())));
        let service = JobService::new(
            Arc::new(fixture.store.clone()),
            Arc::new(fixture.queue.clone()),
            Arc::new(llm_returning(GENERATED)),
            FileManagers::new(LOCAL, Arc::new(files)),
        );
        let payload = service.prepare_job(&mock_itinerary(1, 1)).await.unwrap();
        let id = payload.job.id;

        assert_matches!(
            service.execute(payload).await,
            Err(JobServiceError::ExternalService {
                stage: Stage::FileSave,
                ..
            })
        );

        let job = fixture.stored(id);
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.file_path.unwrap().starts_with("itineraries/1/1/"));
    }

    #[tokio::test]
    async fn execute_complete_failure_leaves_file_in_place() {
        let fixture = Fixture::new();
        let service = fixture.service(llm_returning(GENERATED));
        let payload = service.prepare_job(&mock_itinerary(1, 1)).await.unwrap();
        let id = payload.job.id;
        fixture
            .store
            .fail_next(StoreOperation::UpdateStatus(JobStatus::Completed));

        assert_matches!(
            service.execute(payload).await,
            Err(JobServiceError::Persistence(StoreError::Database(_)))
        );

        let paths = fixture.files.paths();
        assert_eq!(paths.len(), 1);
        assert!(fixture.files.contains(&paths[0]));
        let job = fixture.stored(id);
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.file_path, None);
    }

    #[tokio::test]
    async fn execute_start_failure_fails_job_without_generating() {
        let fixture = Fixture::new();
        let service = fixture.service(llm_never_called());
        let payload = service.prepare_job(&mock_itinerary(1, 1)).await.unwrap();
        let id = payload.job.id;
        fixture
            .store
            .fail_next(StoreOperation::UpdateStatus(JobStatus::Running));

        assert_matches!(
            service.execute(payload).await,
            Err(JobServiceError::Persistence(_))
        );
        let stored = fixture.stored(id);
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.status_description.contains("Database error"));
        // The itinerary accepts a new job again.
        service.admit(&mock_itinerary(1, 1)).await.unwrap();
    }

    struct StalledGateway;

    #[async_trait]
    impl LlmGateway for StalledGateway {
        async fn generate(&self, _messages: &[ChatMessage]) -> std::result::Result<String, LlmError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(GENERATED.to_owned())
        }
    }

    struct PanickingGateway;

    #[async_trait]
    impl LlmGateway for PanickingGateway {
        async fn generate(&self, _messages: &[ChatMessage]) -> std::result::Result<String, LlmError> {
            panic!("gateway blew up")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn execute_fails_job_that_runs_out_of_time() {
        let fixture = Fixture::new();
        let service = fixture
            .service_with(Arc::new(StalledGateway))
            .with_settings(ServiceSettings {
                task_timeout: Duration::from_millis(50),
                ..Default::default()
            });
        let payload = service.prepare_job(&mock_itinerary(1, 1)).await.unwrap();
        let id = payload.job.id;

        assert_matches!(
            service.execute(payload).await,
            Err(JobServiceError::TimedOut { id: timed_out, after }) if timed_out == id && after == Duration::from_millis(45)
        );
        let stored = fixture.stored(id);
        assert_eq!(stored.status, JobStatus::Failed);
        assert!(stored.file_path.is_none());
        service.admit(&mock_itinerary(1, 1)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn executor_reports_timeout_before_the_task_deadline() {
        let fixture = Fixture::new();
        let service = fixture
            .service_with(Arc::new(StalledGateway))
            .with_settings(ServiceSettings {
                task_timeout: Duration::from_millis(50),
                ..Default::default()
            });
        let payload = service.prepare_job(&mock_itinerary(1, 1)).await.unwrap();
        let id = payload.job.id;
        let executor = JobExecutor::new(service);

        let result = tokio::time::timeout(
            Duration::from_millis(50),
            executor.handle(&payload.encode().unwrap()),
        )
        .await
        .unwrap();

        assert_eq!(result.err().unwrap().error_type(), "timed_out");
        assert_eq!(fixture.stored(id).status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn executor_fails_job_when_execution_panics() {
        let fixture = Fixture::new();
        let service = fixture.service_with(Arc::new(PanickingGateway));
        let payload = service.prepare_job(&mock_itinerary(1, 1)).await.unwrap();
        let id = payload.job.id;
        let executor = JobExecutor::new(service.clone());
        let bytes = payload.encode().unwrap();

        let outcome = AssertUnwindSafe(executor.handle(&bytes)).catch_unwind().await;

        assert!(outcome.is_err());
        let stored = fixture.stored(id);
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.status_description, "Job execution panicked");
        service.admit(&mock_itinerary(1, 1)).await.unwrap();
    }

    #[tokio::test]
    async fn execute_stopped_job_is_cancelled() {
        let fixture = Fixture::new();
        let service = fixture.service(llm_never_called());
        let payload = service.prepare_job(&mock_itinerary(1, 1)).await.unwrap();
        let mut job = payload.job.clone();
        service.stop_job(&mut job).await.unwrap();

        assert_matches!(
            service.execute(payload).await,
            Err(JobServiceError::Cancelled(id)) if id == job.id
        );
        assert_eq!(fixture.stored(job.id).status, JobStatus::Stopped);
    }

    #[tokio::test]
    async fn execute_deleted_job_is_cancelled() {
        let fixture = Fixture::new();
        let service = fixture.service(llm_never_called());
        let payload = service.prepare_job(&mock_itinerary(1, 1)).await.unwrap();
        service.delete_job(payload.job.id).await.unwrap();

        assert_matches!(
            service.execute(payload).await,
            Err(JobServiceError::Cancelled(_))
        );
    }

    #[tokio::test]
    async fn stop_during_generation_discards_result() {
        let fixture = Fixture::new();
        let store = fixture.store.clone();
        let mut llm = MockLlmGateway::new();
        llm.expect_generate().returning(move |_| {
            // The user stops the job while the model is still writing.
            let mut job = store.all_jobs().remove(0);
            futures::executor::block_on(store.stop(&mut job)).unwrap();
            Ok(GENERATED.to_owned())
        });
        let service = fixture.service(llm);
        let payload = service.prepare_job(&mock_itinerary(1, 1)).await.unwrap();
        let id = payload.job.id;

        assert_matches!(
            service.execute(payload).await,
            Err(JobServiceError::Cancelled(_))
        );

        let job = fixture.stored(id);
        assert_eq!(job.status, JobStatus::Stopped);
        assert_eq!(job.status_description, crate::job::STOPPED_DESCRIPTION);
        assert!(fixture.files.paths().is_empty());
    }

    #[tokio::test]
    async fn execute_redelivered_finished_job_does_nothing() {
        let fixture = Fixture::new();
        let service = fixture.service(llm_returning(GENERATED));
        let payload = service.prepare_job(&mock_itinerary(1, 1)).await.unwrap();
        service.execute(payload.clone()).await.unwrap();

        assert_matches!(
            service.execute(payload).await,
            Err(JobServiceError::AlreadyFinished {
                status: JobStatus::Completed,
                ..
            })
        );
        assert_eq!(fixture.files.paths().len(), 1);
    }

    #[tokio::test]
    async fn execute_redelivered_running_job_restarts() {
        let fixture = Fixture::new();
        let service = fixture.service(llm_returning(GENERATED));
        let payload = service.prepare_job(&mock_itinerary(1, 1)).await.unwrap();
        let mut job = payload.job.clone();
        fixture.store.start(&mut job).await.unwrap();

        let job = service.execute(payload).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn stop_pending_and_running_jobs() {
        let fixture = Fixture::new();
        let service = fixture.service(llm_never_called());

        let mut pending = service.prepare_job(&mock_itinerary(1, 1)).await.unwrap().job;
        service.stop_job(&mut pending).await.unwrap();
        assert_eq!(pending.status, JobStatus::Stopped);
        assert_eq!(pending.status_description, "Job stopped by user");

        let mut running = service.prepare_job(&mock_itinerary(2, 1)).await.unwrap().job;
        fixture.store.start(&mut running).await.unwrap();
        service.stop_job(&mut running).await.unwrap();
        assert_eq!(running.status, JobStatus::Stopped);
        assert_eq!(fixture.stored(running.id).status, JobStatus::Stopped);
        assert_eq!(
            fixture.stored(running.id).status_description,
            "Job stopped by user"
        );
    }

    #[tokio::test]
    async fn stop_completed_job_is_a_noop() {
        let fixture = Fixture::new();
        let service = fixture.service(llm_returning(GENERATED));
        let payload = service.prepare_job(&mock_itinerary(1, 1)).await.unwrap();
        let mut job = service.execute(payload).await.unwrap();
        let before = job.clone();

        service.stop_job(&mut job).await.unwrap();

        assert_eq!(job, before);
        assert_eq!(fixture.stored(job.id), before);
    }

    #[tokio::test]
    async fn stop_failure_keeps_previous_status() {
        let fixture = Fixture::new();
        let service = fixture.service(llm_never_called());
        let mut job = service.prepare_job(&mock_itinerary(1, 1)).await.unwrap().job;
        fixture
            .store
            .fail_next(StoreOperation::UpdateStatus(JobStatus::Stopped));

        assert_matches!(
            service.stop_job(&mut job).await,
            Err(JobServiceError::Persistence(_))
        );
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.status_description, "");
        assert_eq!(job.end_date, None);
    }

    #[tokio::test]
    async fn late_completion_cannot_overwrite_stop() {
        let fixture = Fixture::new();
        let service = fixture.service(llm_never_called());
        let mut worker_view = service.prepare_job(&mock_itinerary(1, 1)).await.unwrap().job;
        fixture.store.start(&mut worker_view).await.unwrap();
        let mut user_view = worker_view.clone();
        service.stop_job(&mut user_view).await.unwrap();

        assert_matches!(
            fixture.store.complete(&mut worker_view, "late.md").await,
            Err(StoreError::TransitionRejected { .. })
        );
        assert_eq!(fixture.stored(user_view.id).status, JobStatus::Stopped);
    }

    #[tokio::test]
    async fn delete_jobs() {
        let fixture = Fixture::new();
        let service = fixture.service(llm_never_called());
        let first = service.prepare_job(&mock_itinerary(1, 1)).await.unwrap().job;
        let second = service.prepare_job(&mock_itinerary(1, 1)).await.unwrap().job;
        let other = service.prepare_job(&mock_itinerary(2, 1)).await.unwrap().job;

        service.delete_job(first.id).await.unwrap();
        assert_eq!(service.get_job(first.id).await.unwrap(), None);
        assert_eq!(fixture.stored(first.id).status, JobStatus::Deleted);

        assert_eq!(service.delete_itinerary_jobs(1.into()).await.unwrap(), 1);
        assert_eq!(service.get_job(second.id).await.unwrap(), None);
        assert_eq!(service.list_jobs(1.into()).await.unwrap(), vec![]);
        assert_eq!(service.list_jobs(2.into()).await.unwrap(), vec![other]);

        assert_matches!(
            service.delete_job(0.into()).await,
            Err(JobServiceError::InvalidArgument(_))
        );
    }

    #[tokio::test]
    async fn open_file_reads_completed_job() {
        let fixture = Fixture::new();
        let service = fixture.service(llm_returning(GENERATED));
        let payload = service.prepare_job(&mock_itinerary(1, 1)).await.unwrap();
        let pending = payload.job.clone();

        assert_matches!(
            service.open_file(&pending).await.err(),
            Some(JobServiceError::InvalidArgument(_))
        );

        let job = service.execute(payload).await.unwrap();
        let mut content = String::new();
        service
            .open_file(&job)
            .await
            .unwrap()
            .read_to_string(&mut content)
            .await
            .unwrap();
        assert_eq!(content, GENERATED);
    }

    #[tokio::test]
    async fn job_executor_acknowledges_cancelled_jobs() {
        let fixture = Fixture::new();
        let service = fixture.service(llm_never_called());
        let payload = service.prepare_job(&mock_itinerary(1, 1)).await.unwrap();
        service.delete_job(payload.job.id).await.unwrap();
        let executor = JobExecutor::new(service);

        assert!(executor.handle(&payload.encode().unwrap()).await.is_ok());
    }

    #[tokio::test]
    async fn job_executor_reports_failures_with_error_type() {
        let fixture = Fixture::new();
        let mut llm = MockLlmGateway::new();
        llm.expect_generate()
            .returning(|_| Err(LlmError::EmptyResponse));
        let service = fixture.service(llm);
        let payload = service.prepare_job(&mock_itinerary(1, 1)).await.unwrap();
        let executor = JobExecutor::new(service);

        let error = executor
            .handle(&payload.encode().unwrap())
            .await
            .unwrap_err();
        assert_eq!(error.error_type(), "external_service");

        let error = executor.handle(b"not json").await.unwrap_err();
        assert_eq!(error.error_type(), "queue");
    }
}
