//! Job storage: the trait every backend implements, plus the in-memory
//! backend used for tests/dev.
//!
//! Every mutating operation is a single atomic step guarded on the status the
//! caller expects. A worker that lost ownership of a job (for example because
//! recovery re-queued it) gets `InvalidTransition` instead of silently
//! overwriting someone else's state.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use troubadour_core::{BatchId, JobId, ReviewId, SubjectStatus};

use super::types::{Job, JobStatus, truncate_error};

/// Job store abstraction.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Persist a freshly built `queued` job.
    async fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Atomically pick the oldest claimable job and mark it `running`.
    ///
    /// At most one concurrent caller receives any given job.
    async fn claim_next(&self) -> Result<Option<Job>, JobStoreError>;

    /// Refresh `heartbeat_at` of a running job.
    async fn heartbeat(&self, job_id: JobId) -> Result<(), JobStoreError>;

    async fn update_progress(
        &self,
        job_id: JobId,
        progress: u8,
        message: &str,
    ) -> Result<(), JobStoreError>;

    /// Remember the subject's status before the stage mutates it.
    async fn record_rollback(
        &self,
        job_id: JobId,
        snapshot: SubjectStatus,
    ) -> Result<(), JobStoreError>;

    /// `running -> done`.
    async fn complete(&self, job_id: JobId, result_id: Option<ReviewId>)
    -> Result<Job, JobStoreError>;

    /// `running -> queued` for another attempt; `attempts` increments.
    ///
    /// Refused once the job has used its last attempt.
    async fn requeue(
        &self,
        job_id: JobId,
        message: &str,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<Job, JobStoreError>;

    /// `running -> error`.
    async fn fail(&self, job_id: JobId, error_message: &str) -> Result<Job, JobStoreError>;

    /// `running -> queued` after a crash; `attempts` is left alone.
    async fn recover(&self, job_id: JobId, message: &str) -> Result<Job, JobStoreError>;

    /// Flip `notification_sent` from false to true. Returns whether this
    /// caller performed the flip.
    async fn mark_notification_sent(&self, job_id: JobId) -> Result<bool, JobStoreError>;

    /// All members of a batch, oldest first.
    async fn list_batch(&self, batch_id: &BatchId) -> Result<Vec<Job>, JobStoreError>;

    /// Take the batch's one-time notification marker. Returns whether this
    /// caller took it.
    async fn claim_batch_notification(&self, batch_id: &BatchId) -> Result<bool, JobStoreError>;

    /// Jobs in a given status (all when `None`), oldest first.
    async fn list_by_status(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {job_id}: cannot move from {actual} (expected {expected})")]
    InvalidTransition {
        job_id: JobId,
        expected: JobStatus,
        actual: JobStatus,
    },
    #[error("job {job_id}: no attempts left ({attempts} of {max_attempts} used)")]
    AttemptsExhausted {
        job_id: JobId,
        attempts: u32,
        max_attempts: u32,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub queued: usize,
    pub running: usize,
    pub done: usize,
    pub error: usize,
}

impl JobStats {
    pub fn total(&self) -> usize {
        self.queued + self.running + self.done + self.error
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    notified_batches: RwLock<HashSet<BatchId>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .read()
            .map_err(|_| JobStoreError::Storage("job map lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Storage("job map lock poisoned".into()))
    }

    /// Apply `f` to a job that is `running`, under the write lock.
    fn guarded<F>(&self, job_id: JobId, f: F) -> Result<Job, JobStoreError>
    where
        F: FnOnce(&mut Job) -> Result<(), JobStoreError>,
    {
        let mut jobs = self.write()?;
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if job.status != JobStatus::Running {
            return Err(JobStoreError::InvalidTransition {
                job_id,
                expected: JobStatus::Running,
                actual: job.status,
            });
        }
        f(job)?;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    /// Move a job to `next` along a state-machine edge, applying `f` first.
    ///
    /// Every edge other than the claim leaves `running`, so that is the
    /// status reported when the edge does not exist.
    fn transition<F>(&self, job_id: JobId, next: JobStatus, f: F) -> Result<Job, JobStoreError>
    where
        F: FnOnce(&mut Job) -> Result<(), JobStoreError>,
    {
        let mut jobs = self.write()?;
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if !job.status.can_transition_to(next) {
            return Err(JobStoreError::InvalidTransition {
                job_id,
                expected: JobStatus::Running,
                actual: job.status,
            });
        }
        f(job)?;
        job.status = next;
        job.updated_at = Utc::now();
        Ok(job.clone())
    }

    fn sorted(mut jobs: Vec<Job>) -> Vec<Job> {
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        jobs
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut jobs = self.write()?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.get(&job_id).cloned())
    }

    async fn claim_next(&self) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.write()?;
        let now = Utc::now();

        let next = jobs
            .values()
            .filter(|j| j.is_claimable(now))
            .min_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)))
            .map(|j| j.id);

        let Some(job_id) = next else {
            return Ok(None);
        };
        let Some(job) = jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        job.status = JobStatus::Running;
        job.started_at = Some(now);
        job.heartbeat_at = Some(now);
        job.not_before = None;
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn heartbeat(&self, job_id: JobId) -> Result<(), JobStoreError> {
        self.guarded(job_id, |job| {
            job.heartbeat_at = Some(Utc::now());
            Ok(())
        })
        .map(|_| ())
    }

    async fn update_progress(
        &self,
        job_id: JobId,
        progress: u8,
        message: &str,
    ) -> Result<(), JobStoreError> {
        self.guarded(job_id, |job| {
            job.progress = progress.min(100);
            job.progress_message = Some(message.to_string());
            Ok(())
        })
        .map(|_| ())
    }

    async fn record_rollback(
        &self,
        job_id: JobId,
        snapshot: SubjectStatus,
    ) -> Result<(), JobStoreError> {
        self.guarded(job_id, |job| {
            job.subject_rollback = Some(snapshot);
            Ok(())
        })
        .map(|_| ())
    }

    async fn complete(
        &self,
        job_id: JobId,
        result_id: Option<ReviewId>,
    ) -> Result<Job, JobStoreError> {
        self.transition(job_id, JobStatus::Done, |job| {
            job.progress = 100;
            job.result_id = result_id;
            job.completed_at = Some(Utc::now());
            Ok(())
        })
    }

    async fn requeue(
        &self,
        job_id: JobId,
        message: &str,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<Job, JobStoreError> {
        self.transition(job_id, JobStatus::Queued, |job| {
            if !job.has_attempts_left() {
                return Err(JobStoreError::AttemptsExhausted {
                    job_id,
                    attempts: job.attempts,
                    max_attempts: job.max_attempts,
                });
            }
            job.attempts += 1;
            job.progress = 0;
            job.progress_message = Some(message.to_string());
            job.heartbeat_at = None;
            job.not_before = not_before;
            Ok(())
        })
    }

    async fn fail(&self, job_id: JobId, error_message: &str) -> Result<Job, JobStoreError> {
        self.transition(job_id, JobStatus::Error, |job| {
            job.error_message = Some(truncate_error(error_message));
            job.completed_at = Some(Utc::now());
            Ok(())
        })
    }

    async fn recover(&self, job_id: JobId, message: &str) -> Result<Job, JobStoreError> {
        self.transition(job_id, JobStatus::Queued, |job| {
            job.progress = 0;
            job.progress_message = Some(message.to_string());
            job.heartbeat_at = None;
            job.not_before = None;
            Ok(())
        })
    }

    async fn mark_notification_sent(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        let mut jobs = self.write()?;
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        if job.notification_sent {
            return Ok(false);
        }
        job.notification_sent = true;
        Ok(true)
    }

    async fn list_batch(&self, batch_id: &BatchId) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.read()?;
        let members = jobs
            .values()
            .filter(|j| j.batch_id.as_ref() == Some(batch_id))
            .cloned()
            .collect();
        Ok(Self::sorted(members))
    }

    async fn claim_batch_notification(&self, batch_id: &BatchId) -> Result<bool, JobStoreError> {
        let mut notified = self
            .notified_batches
            .write()
            .map_err(|_| JobStoreError::Storage("batch marker lock poisoned".into()))?;
        Ok(notified.insert(batch_id.clone()))
    }

    async fn list_by_status(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.read()?;
        let matching = jobs
            .values()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();
        let mut result = Self::sorted(matching);
        result.truncate(limit);
        Ok(result)
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let jobs = self.read()?;
        let mut stats = JobStats::default();
        for job in jobs.values() {
            match job.status {
                JobStatus::Queued => stats.queued += 1,
                JobStatus::Running => stats.running += 1,
                JobStatus::Done => stats.done += 1,
                JobStatus::Error => stats.error += 1,
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{JobKind, NewJob};
    use troubadour_core::{TrackId, TrackStatus, UserId};

    fn analyze_job() -> Job {
        NewJob::new(
            JobKind::Analyze {
                track_id: TrackId::new(),
            },
            UserId::new(),
        )
        .into_job()
    }

    #[tokio::test]
    async fn enqueue_and_claim() {
        let store = InMemoryJobStore::new();
        let job_id = store.enqueue(analyze_job()).await.unwrap();

        let claimed = store.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, job_id);
        assert_eq!(claimed.status, JobStatus::Running);
        assert_eq!(claimed.attempts, 1);
        assert!(claimed.started_at.is_some());

        assert!(store.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claims_oldest_first() {
        let store = InMemoryJobStore::new();
        let first = analyze_job();
        let mut second = analyze_job();
        second.created_at = first.created_at + chrono::Duration::seconds(1);
        let second_id = store.enqueue(second).await.unwrap();
        let first_id = store.enqueue(first).await.unwrap();

        assert_eq!(store.claim_next().await.unwrap().unwrap().id, first_id);
        assert_eq!(store.claim_next().await.unwrap().unwrap().id, second_id);
    }

    #[tokio::test]
    async fn backed_off_job_is_skipped() {
        let store = InMemoryJobStore::new();
        let mut job = analyze_job();
        job.not_before = Some(Utc::now() + chrono::Duration::hours(1));
        store.enqueue(job).await.unwrap();

        assert!(store.claim_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn terminal_jobs_reject_transitions() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue(analyze_job()).await.unwrap();
        store.claim_next().await.unwrap();
        store.complete(id, None).await.unwrap();

        let err = store.fail(id, "late failure").await.unwrap_err();
        assert_eq!(
            err,
            JobStoreError::InvalidTransition {
                job_id: id,
                expected: JobStatus::Running,
                actual: JobStatus::Done,
            }
        );
        assert!(store.requeue(id, "again", None).await.is_err());
        assert!(store.heartbeat(id).await.is_err());
    }

    #[tokio::test]
    async fn queued_jobs_cannot_skip_running() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue(analyze_job()).await.unwrap();

        let err = store.complete(id, None).await.unwrap_err();
        assert_eq!(
            err,
            JobStoreError::InvalidTransition {
                job_id: id,
                expected: JobStatus::Running,
                actual: JobStatus::Queued,
            }
        );
        assert!(store.fail(id, "nope").await.is_err());
        assert!(store.recover(id, "nope").await.is_err());
        assert!(store.update_progress(id, 10, "nope").await.is_err());

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.error_message.is_none());
    }

    #[tokio::test]
    async fn requeue_increments_until_exhausted() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue(analyze_job()).await.unwrap();

        for expected in 2..=3 {
            store.claim_next().await.unwrap();
            let job = store.requeue(id, "retrying", None).await.unwrap();
            assert_eq!(job.attempts, expected);
            assert_eq!(job.status, JobStatus::Queued);
        }

        store.claim_next().await.unwrap();
        let err = store.requeue(id, "retrying", None).await.unwrap_err();
        assert!(matches!(err, JobStoreError::AttemptsExhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn recover_keeps_attempt_count() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue(analyze_job()).await.unwrap();
        store.claim_next().await.unwrap();
        store
            .record_rollback(id, SubjectStatus::Track(TrackStatus::Uploaded))
            .await
            .unwrap();

        let job = store.recover(id, "Recovered after worker restart").await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.attempts, 1);
        assert_eq!(
            job.subject_rollback,
            Some(SubjectStatus::Track(TrackStatus::Uploaded))
        );
    }

    #[tokio::test]
    async fn notification_flags_flip_once() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue(analyze_job()).await.unwrap();
        assert!(store.mark_notification_sent(id).await.unwrap());
        assert!(!store.mark_notification_sent(id).await.unwrap());

        let batch = BatchId::new("upload-1").unwrap();
        assert!(store.claim_batch_notification(&batch).await.unwrap());
        assert!(!store.claim_batch_notification(&batch).await.unwrap());
    }

    #[tokio::test]
    async fn error_message_is_truncated() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue(analyze_job()).await.unwrap();
        store.claim_next().await.unwrap();
        let job = store.fail(id, &"x".repeat(5000)).await.unwrap();
        assert_eq!(job.error_message.unwrap().len(), 1000);
    }

    #[tokio::test]
    async fn stats_count_each_status() {
        let store = InMemoryJobStore::new();
        for _ in 0..3 {
            store.enqueue(analyze_job()).await.unwrap();
        }
        let claimed = store.claim_next().await.unwrap().unwrap();
        store.fail(claimed.id, "boom").await.unwrap();
        store.claim_next().await.unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(
            stats,
            JobStats {
                queued: 1,
                running: 1,
                done: 0,
                error: 1,
            }
        );
        assert_eq!(stats.total(), 3);
    }
}
