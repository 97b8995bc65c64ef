//! Resolution of a failed attempt into exactly one of re-queue or error.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use troubadour_core::JobId;

use super::stages::{StageError, restore_subject};
use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobStatus, RetryPolicy, truncate_error};
use crate::catalog::CatalogStore;

/// What happened to a failed job.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureResolution {
    /// Back in the queue for another attempt.
    Requeued(Job),
    /// Terminal `error`.
    Failed(Job),
}

impl FailureResolution {
    pub fn job(&self) -> &Job {
        match self {
            FailureResolution::Requeued(job) | FailureResolution::Failed(job) => job,
        }
    }
}

/// Retry/backoff controller.
#[derive(Clone)]
pub struct RetryController {
    jobs: Arc<dyn JobStore>,
    catalog: Arc<dyn CatalogStore>,
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(jobs: Arc<dyn JobStore>, catalog: Arc<dyn CatalogStore>, policy: RetryPolicy) -> Self {
        Self {
            jobs,
            catalog,
            policy,
        }
    }

    /// Decide the fate of running job `job_id` after `error`.
    ///
    /// The subject is rolled back in both outcomes. A failure to roll back is
    /// logged; it does not block the job transition.
    pub async fn resolve(
        &self,
        job_id: JobId,
        error: &StageError,
    ) -> Result<FailureResolution, JobStoreError> {
        // Re-read: the stage recorded the rollback snapshot after the claim.
        let job = self
            .jobs
            .get(job_id)
            .await?
            .ok_or(JobStoreError::NotFound(job_id))?;
        if job.status != JobStatus::Running {
            return Err(JobStoreError::InvalidTransition {
                job_id,
                expected: JobStatus::Running,
                actual: job.status,
            });
        }

        if let Err(e) = restore_subject(&*self.catalog, &job).await {
            warn!(job_id = %job_id, error = %e, "failed to roll back subject status");
        }

        let reason = truncate_error(&error.to_string());

        if error.is_retryable() && job.has_attempts_left() {
            let next = job.attempts + 1;
            let message = format!(
                "Retrying (attempt {next} of {}): {reason}",
                job.max_attempts
            );
            let delay = self.policy.delay_for_attempt(job.attempts);
            let not_before = (!delay.is_zero())
                .then(|| Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());

            match self.jobs.requeue(job_id, &message, not_before).await {
                Ok(requeued) => {
                    info!(
                        job_id = %job_id,
                        attempt = next,
                        max_attempts = job.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "job re-queued"
                    );
                    return Ok(FailureResolution::Requeued(requeued));
                }
                // Lost a race on the last attempt; fall through to terminal.
                Err(JobStoreError::AttemptsExhausted { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let message = if error.is_retryable() {
            format!("Failed after {} attempts: {reason}", job.attempts)
        } else {
            reason
        };
        let failed = self.jobs.fail(job_id, &message).await?;
        warn!(job_id = %job_id, attempts = job.attempts, error = %message, "job failed");
        Ok(FailureResolution::Failed(failed))
    }
}
