//! Stage executors: one handler per job type.
//!
//! Every stage follows the same shape:
//!
//! 1. load and validate the subject (a missing subject or input is a
//!    precondition failure, never retried)
//! 2. record the subject's current status on the job, then move the subject
//!    into its transient status
//! 3. call exactly one capability (compare also calls the enricher, whose
//!    failure only degrades the result) under a time budget
//! 4. persist the artifact, move the subject to its final status, bump usage
//!
//! Stages never notify directly; they return the notification text and the
//! worker decides whether (and for batches, how) to send it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use troubadour_ai::{AudioAnalyzer, CapabilityError, ComparisonEnricher, CritiqueGenerator};
use troubadour_core::{ReviewId, SubjectRef, SubjectStatus};

use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobType};
use crate::catalog::{CatalogError, CatalogStore};

mod album_review;
mod analyze;
mod compare;
mod review;

pub use album_review::AlbumReviewStage;
pub use analyze::AnalyzeStage;
pub use compare::CompareStage;
pub use review::ReviewStage;

/// Failure of a stage, already classified for the retry controller.
#[derive(Debug, Error)]
pub enum StageError {
    /// Input missing or wrong; another attempt would fail the same way.
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error(transparent)]
    Capability(#[from] CapabilityError),

    #[error("job store: {0}")]
    Store(#[from] JobStoreError),

    #[error("catalog: {0}")]
    Catalog(#[from] CatalogError),
}

impl StageError {
    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            StageError::Precondition(_) => false,
            StageError::Capability(e) => e.is_retryable(),
            // A subject deleted mid-stage will not come back.
            StageError::Catalog(
                CatalogError::TrackNotFound(_) | CatalogError::ProjectNotFound(_),
            ) => false,
            // Infrastructure hiccups are treated as transient.
            StageError::Store(_) | StageError::Catalog(_) => true,
        }
    }
}

/// What a successful stage hands back to the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct StageOutcome {
    pub result_id: Option<ReviewId>,
    pub title: String,
    pub content: String,
}

/// Handler for one job type.
#[async_trait]
pub trait StageExecutor: Send + Sync + 'static {
    fn job_type(&self) -> JobType;

    async fn execute(&self, job: &Job) -> Result<StageOutcome, StageError>;
}

/// External capabilities the stages call.
#[derive(Clone)]
pub struct Capabilities {
    pub analyzer: Arc<dyn AudioAnalyzer>,
    pub critic: Arc<dyn CritiqueGenerator>,
    pub enricher: Arc<dyn ComparisonEnricher>,
}

/// Stores and limits shared by all stages.
#[derive(Clone)]
pub struct StageContext {
    pub jobs: Arc<dyn JobStore>,
    pub catalog: Arc<dyn CatalogStore>,
    pub capability_timeout: Duration,
}

impl StageContext {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        catalog: Arc<dyn CatalogStore>,
        capability_timeout: Duration,
    ) -> Self {
        Self {
            jobs,
            catalog,
            capability_timeout,
        }
    }

    /// Run a capability call under the time budget; expiry is a transient
    /// `Timeout`.
    pub async fn call<T, F>(&self, call: F) -> Result<T, CapabilityError>
    where
        F: Future<Output = Result<T, CapabilityError>> + Send,
    {
        match tokio::time::timeout(self.capability_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(CapabilityError::Timeout(self.capability_timeout)),
        }
    }

    pub async fn progress(&self, job: &Job, percent: u8, message: &str) -> Result<(), StageError> {
        self.jobs.update_progress(job.id, percent, message).await?;
        Ok(())
    }

    /// Snapshot the subject's status onto the job, then apply `transient`.
    ///
    /// The snapshot is written first so that a crash between the two writes
    /// still leaves enough on the job to restore the subject. If an earlier
    /// attempt's rollback never landed, the subject is still in a transient
    /// status; the earlier snapshot is kept so the pre-stage value survives.
    pub async fn enter(
        &self,
        job: &Job,
        current: SubjectStatus,
        transient: SubjectStatus,
    ) -> Result<(), StageError> {
        let snapshot = match job.subject_rollback {
            Some(previous) if current.is_transient() => {
                warn!(
                    job_id = %job.id,
                    ?current,
                    ?previous,
                    "subject still in a transient status; keeping earlier snapshot"
                );
                previous
            }
            _ => current,
        };
        self.jobs.record_rollback(job.id, snapshot).await?;
        apply_status(&*self.catalog, job.subject(), transient).await?;
        Ok(())
    }
}

/// Write `status` onto `subject`. A status of the wrong kind is ignored.
pub async fn apply_status(
    catalog: &dyn CatalogStore,
    subject: SubjectRef,
    status: SubjectStatus,
) -> Result<(), CatalogError> {
    match (subject, status) {
        (SubjectRef::Track(id), SubjectStatus::Track(s)) => catalog.set_track_status(id, s).await,
        (SubjectRef::Project(id), SubjectStatus::Project(s)) => {
            catalog.set_project_status(id, s).await
        }
        (subject, status) => {
            warn!(%subject, ?status, "status kind does not match subject; skipping");
            Ok(())
        }
    }
}

/// Put the subject back to the status recorded on `job`, if any.
pub async fn restore_subject(catalog: &dyn CatalogStore, job: &Job) -> Result<(), CatalogError> {
    match job.subject_rollback {
        Some(snapshot) => apply_status(catalog, job.subject(), snapshot).await,
        None => Ok(()),
    }
}

/// Executors keyed by job type.
#[derive(Default, Clone)]
pub struct StageRegistry {
    executors: HashMap<JobType, Arc<dyn StageExecutor>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the four built-in stages.
    pub fn standard(ctx: StageContext, caps: Capabilities) -> Self {
        let mut registry = Self::new();
        registry.register(AnalyzeStage::new(ctx.clone(), caps.analyzer.clone()));
        registry.register(ReviewStage::new(ctx.clone(), caps.critic.clone()));
        registry.register(AlbumReviewStage::new(ctx.clone(), caps.critic.clone()));
        registry.register(CompareStage::new(ctx, caps.critic, caps.enricher));
        registry
    }

    /// Register (or replace) the executor for its job type.
    pub fn register<E: StageExecutor>(&mut self, executor: E) {
        self.executors.insert(executor.job_type(), Arc::new(executor));
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn StageExecutor>> {
        self.executors.get(&job_type).cloned()
    }

    pub fn job_types(&self) -> Vec<JobType> {
        JobType::ALL
            .into_iter()
            .filter(|t| self.executors.contains_key(t))
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::Harness;
    use super::*;
    use crate::jobs::types::JobKind;
    use troubadour_core::{ProjectId, TrackId, TrackStatus};

    #[test]
    fn deleted_subject_is_not_retried() {
        assert!(!StageError::from(CatalogError::TrackNotFound(TrackId::new())).is_retryable());
        assert!(!StageError::from(CatalogError::ProjectNotFound(ProjectId::new())).is_retryable());
        assert!(StageError::from(CatalogError::Storage("connection reset".into())).is_retryable());
    }

    #[tokio::test]
    async fn enter_records_current_status_on_first_attempt() {
        let h = Harness::new();
        let track_id = h.add_track("Tape Hiss", TrackStatus::Analyzed);
        let job = h.running_job(JobKind::Review { track_id }).await;

        h.ctx()
            .enter(
                &job,
                SubjectStatus::Track(TrackStatus::Analyzed),
                SubjectStatus::Track(TrackStatus::Reviewing),
            )
            .await
            .unwrap();

        let stored = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(
            stored.subject_rollback,
            Some(SubjectStatus::Track(TrackStatus::Analyzed))
        );
        let track = h.catalog.get_track(track_id).await.unwrap().unwrap();
        assert_eq!(track.status, TrackStatus::Reviewing);
    }

    #[tokio::test]
    async fn enter_keeps_earlier_snapshot_over_stuck_transient_status() {
        let h = Harness::new();
        let track_id = h.add_track("Tape Hiss", TrackStatus::Reviewing);
        let mut job = h.running_job(JobKind::Review { track_id }).await;
        h.jobs
            .record_rollback(job.id, SubjectStatus::Track(TrackStatus::Analyzed))
            .await
            .unwrap();
        job.subject_rollback = Some(SubjectStatus::Track(TrackStatus::Analyzed));

        h.ctx()
            .enter(
                &job,
                SubjectStatus::Track(TrackStatus::Reviewing),
                SubjectStatus::Track(TrackStatus::Reviewing),
            )
            .await
            .unwrap();

        let stored = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(
            stored.subject_rollback,
            Some(SubjectStatus::Track(TrackStatus::Analyzed))
        );
    }
}
