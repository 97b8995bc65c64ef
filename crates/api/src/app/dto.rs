use serde::{Deserialize, Serialize};
use uuid::Uuid;

use troubadour_infra::jobs::{Job, JobStatus};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    #[serde(rename = "type")]
    pub job_type: String,
    pub subject_id: Uuid,
    pub owner_id: Uuid,
    pub batch_id: Option<String>,
    pub max_attempts: Option<u32>,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct CreateJobResponse {
    pub job_id: String,
}

/// Progress of a batch, counted over all members.
#[derive(Debug, Default, PartialEq, Eq, Serialize)]
pub struct BatchProgress {
    pub total: usize,
    pub done: usize,
    pub error: usize,
    pub pending: usize,
}

impl BatchProgress {
    pub fn of(members: &[Job]) -> Self {
        members.iter().fold(Self::default(), |mut acc, job| {
            acc.total += 1;
            match job.status {
                JobStatus::Done => acc.done += 1,
                JobStatus::Error => acc.error += 1,
                JobStatus::Queued | JobStatus::Running => acc.pending += 1,
            }
            acc
        })
    }
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub batch_id: String,
    pub summary: BatchProgress,
    pub jobs: Vec<Job>,
}
