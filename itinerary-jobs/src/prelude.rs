//! Re-exports of the types needed to wire up a producer or a worker.
//!
//! ```
//! # #![allow(unused_imports)]
//! use itinerary_jobs::prelude::*;
//! ```
pub use crate::config::Config;
pub use crate::file_manager::{
    local::LocalFileManager, memory::InMemoryFileManager, FileManager, FileManagers, LOCAL,
};
pub use crate::itinerary::{Destination, Itinerary, ItineraryId, UserId};
pub use crate::job::{ItineraryFileJob, JobId, JobStatus};
pub use crate::llm::{LlmGateway, OpenAiGateway};
pub use crate::payload::{AsyncTaskPayload, GENERATE_FILE_TASK};
pub use crate::prompt::PromptBuilder;
pub use crate::queue::{
    backoff::Backoff, memory::InMemoryTaskQueue, server::TaskServer, TaskQueue,
};
pub use crate::reaper::{Reaper, ReaperConfig};
pub use crate::service::{JobExecutor, JobService, JobServiceError, ServiceSettings};
pub use crate::store::{memory::InMemoryJobStore, JobStore};
