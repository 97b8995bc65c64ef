//! Startup sweep for jobs orphaned by a previous process.

use std::sync::Arc;

use tracing::{debug, info, warn};

use troubadour_core::JobId;

use super::stages::restore_subject;
use super::store::{JobStore, JobStoreError};
use super::types::JobStatus;
use crate::catalog::CatalogStore;

pub const RECOVERY_MESSAGE: &str = "Recovered after worker restart";

/// Jobs put back in the queue by one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct RecoveryReport {
    pub recovered: Vec<JobId>,
}

/// Resets every `running` job to `queued`.
///
/// Runs once, before the worker polls. Any `running` row at that point was
/// left by a dead process regardless of how fresh its heartbeat looks. The
/// attempt counter is not touched: a crash is not a failed attempt.
#[derive(Clone)]
pub struct RecoverySweep {
    jobs: Arc<dyn JobStore>,
    catalog: Arc<dyn CatalogStore>,
}

impl RecoverySweep {
    pub fn new(jobs: Arc<dyn JobStore>, catalog: Arc<dyn CatalogStore>) -> Self {
        Self { jobs, catalog }
    }

    pub async fn run(&self) -> Result<RecoveryReport, JobStoreError> {
        let orphans = self
            .jobs
            .list_by_status(Some(JobStatus::Running), usize::MAX)
            .await?;

        let mut report = RecoveryReport::default();
        for job in orphans {
            // Subject first: if we crash again here the job is still
            // `running` and the next sweep retries both steps.
            if let Err(e) = restore_subject(&*self.catalog, &job).await {
                warn!(job_id = %job.id, error = %e, "failed to roll back subject during recovery");
            }

            match self.jobs.recover(job.id, RECOVERY_MESSAGE).await {
                Ok(_) => report.recovered.push(job.id),
                Err(JobStoreError::InvalidTransition { actual, .. }) => {
                    debug!(job_id = %job.id, status = %actual, "job left running state during recovery");
                }
                Err(e) => return Err(e),
            }
        }

        if !report.recovered.is_empty() {
            info!(count = report.recovered.len(), "recovered orphaned jobs");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{InMemoryCatalog, Project, Track};
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::{JobKind, NewJob};
    use troubadour_core::{ProjectId, ProjectStatus, SubjectStatus, TrackId, TrackStatus, UserId};

    #[tokio::test]
    async fn running_jobs_are_requeued_with_subject_restored() {
        let jobs = InMemoryJobStore::arc();
        let catalog = InMemoryCatalog::arc();
        let owner = UserId::new();
        let project_id = ProjectId::new();
        catalog
            .put_project(Project {
                id: project_id,
                owner_id: owner,
                title: "EP".into(),
                review_focus: None,
                status: ProjectStatus::Draft,
            })
            .unwrap();
        let track_id = TrackId::new();
        catalog
            .put_track(Track {
                id: track_id,
                project_id,
                owner_id: owner,
                title: "Intro".into(),
                media_ref: "s3://intro.wav".into(),
                duration_secs: None,
                predecessor_id: None,
                status: TrackStatus::Analyzing,
            })
            .unwrap();

        let crashed = jobs
            .enqueue(NewJob::new(JobKind::Analyze { track_id }, owner).into_job())
            .await
            .unwrap();
        jobs.claim_next().await.unwrap();
        jobs.record_rollback(crashed, SubjectStatus::Track(TrackStatus::Uploaded))
            .await
            .unwrap();
        let untouched = jobs
            .enqueue(NewJob::new(JobKind::Analyze { track_id }, owner).into_job())
            .await
            .unwrap();

        let report = RecoverySweep::new(jobs.clone(), catalog.clone())
            .run()
            .await
            .unwrap();
        assert_eq!(report.recovered, vec![crashed]);

        let job = jobs.get(crashed).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.progress_message.as_deref(), Some(RECOVERY_MESSAGE));
        assert_eq!(
            jobs.get(untouched).await.unwrap().unwrap().progress_message,
            None
        );

        let track = catalog.get_track(track_id).await.unwrap().unwrap();
        assert_eq!(track.status, TrackStatus::Uploaded);
    }

    #[tokio::test]
    async fn empty_store_recovers_nothing() {
        let report = RecoverySweep::new(InMemoryJobStore::arc(), InMemoryCatalog::arc())
            .run()
            .await
            .unwrap();
        assert!(report.recovered.is_empty());
    }
}
