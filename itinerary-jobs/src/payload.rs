//! The message carried by the task queue from the producer to a worker.
use serde::{Deserialize, Serialize};

use crate::{itinerary::Itinerary, job::ItineraryFileJob, queue::QueueError};

/// Task type under which itinerary file generation is enqueued.
pub const GENERATE_FILE_TASK: &str = "itinerary:generate_file";

/// Everything a worker needs to execute a job, as it was when the job was prepared.
///
/// Workers never re-read the itinerary, so later edits do not reach a job in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsyncTaskPayload {
    pub itinerary: Itinerary,
    pub job: ItineraryFileJob,
}

impl AsyncTaskPayload {
    pub fn encode(&self) -> Result<Vec<u8>, QueueError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, QueueError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
