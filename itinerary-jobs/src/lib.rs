//! Background generation of travel itinerary documents.
//!
//! A request for an itinerary file is admitted and persisted as an [`job::ItineraryFileJob`] by
//! the [`service::JobService`], then carried to a worker by a [`queue::TaskQueue`]. Workers run
//! a [`queue::server::TaskServer`] whose [`service::JobExecutor`] drives the job through the
//! language model and into a [`file_manager::FileManager`].
//!
//! ```
//! # use itinerary_jobs::prelude::*;
//! # use std::sync::Arc;
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let queue = InMemoryTaskQueue::new();
//! let files = FileManagers::new(LOCAL, Arc::new(InMemoryFileManager::new()));
//! let service = JobService::new(
//!     Arc::new(InMemoryJobStore::new()),
//!     Arc::new(queue.clone()),
//!     Arc::new(OpenAiGateway::new("http://localhost:8080/v1", "local-model")),
//!     files,
//! );
//!
//! let server = TaskServer::new(Arc::new(queue), 4)
//!     .with_handler(GENERATE_FILE_TASK, Arc::new(JobExecutor::new(service.clone())));
//! server.graceful_shutdown().await.unwrap();
//! # }
//! ```

pub mod config;
pub mod file_manager;
pub mod itinerary;
pub mod job;
pub mod llm;
pub mod payload;
pub mod prelude;
pub mod prompt;
pub mod queue;
pub mod reaper;
pub mod service;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
