//! The polling worker: claim, execute under heartbeat, resolve.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};

use troubadour_ai::NotificationSink;

use super::batch::BatchAggregator;
use super::heartbeat::run_with_heartbeat;
use super::recovery::RecoverySweep;
use super::retry::{FailureResolution, RetryController};
use super::stages::{StageError, StageOutcome, StageRegistry};
use super::store::{JobStore, JobStoreError};
use super::types::Job;
use crate::catalog::CatalogStore;
use crate::config::WorkerConfig;

/// What one pass of the worker did with the job it claimed.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessedJob {
    Succeeded(Job),
    Requeued(Job),
    Failed(Job),
}

impl ProcessedJob {
    pub fn job(&self) -> &Job {
        match self {
            ProcessedJob::Succeeded(job) | ProcessedJob::Requeued(job) | ProcessedJob::Failed(job) => {
                job
            }
        }
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_requeued: u64,
    pub jobs_failed: u64,
    pub jobs_recovered: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// Wakes an idle worker before its poll interval elapses.
#[derive(Debug, Clone)]
pub struct WorkerTrigger(Arc<Notify>);

impl WorkerTrigger {
    pub fn wake(&self) {
        self.0.notify_one();
    }
}

/// Handle to a spawned worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    trigger: WorkerTrigger,
    join: JoinHandle<()>,
    stats: Arc<Mutex<WorkerStats>>,
    started: Instant,
}

impl WorkerHandle {
    pub fn trigger(&self) -> WorkerTrigger {
        self.trigger.clone()
    }

    pub fn stats(&self) -> WorkerStats {
        let mut stats = lock(&self.stats).clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }

    /// Stop polling and wait for the in-flight job, if any, to settle.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            error!(error = %e, "job worker task ended abnormally");
        }
    }
}

fn lock(stats: &Mutex<WorkerStats>) -> std::sync::MutexGuard<'_, WorkerStats> {
    stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Drains the queue one job at a time.
///
/// Every claimed job ends the pass in exactly one of `done`, `queued`
/// (re-queued for another attempt) or `error`, unless the store itself fails,
/// in which case the job stays `running` until the next recovery sweep.
pub struct JobWorker {
    jobs: Arc<dyn JobStore>,
    registry: StageRegistry,
    retry: RetryController,
    batches: BatchAggregator,
    recovery: RecoverySweep,
    notifier: Arc<dyn NotificationSink>,
    config: WorkerConfig,
    stats: Arc<Mutex<WorkerStats>>,
}

impl JobWorker {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        catalog: Arc<dyn CatalogStore>,
        registry: StageRegistry,
        notifier: Arc<dyn NotificationSink>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            retry: RetryController::new(
                jobs.clone(),
                catalog.clone(),
                config.retry_policy.clone(),
            ),
            batches: BatchAggregator::new(jobs.clone(), notifier.clone()),
            recovery: RecoverySweep::new(jobs.clone(), catalog),
            jobs,
            registry,
            notifier,
            config,
            stats: Arc::new(Mutex::new(WorkerStats::default())),
        }
    }

    pub fn stats(&self) -> WorkerStats {
        lock(&self.stats).clone()
    }

    /// Claim and fully process at most one job.
    pub async fn run_once(&self) -> Result<Option<ProcessedJob>, JobStoreError> {
        let Some(job) = self.jobs.claim_next().await? else {
            return Ok(None);
        };

        let span = info_span!(
            "job",
            worker = %self.config.name,
            job_id = %job.id,
            job_type = %job.job_type(),
            attempt = job.attempts,
        );

        lock(&self.stats).current_running += 1;
        let processed = self.process(job).instrument(span).await;

        let mut stats = lock(&self.stats);
        stats.current_running = stats.current_running.saturating_sub(1);
        stats.jobs_processed += 1;
        match &processed {
            Ok(ProcessedJob::Succeeded(_)) => stats.jobs_succeeded += 1,
            Ok(ProcessedJob::Requeued(_)) => stats.jobs_requeued += 1,
            Ok(ProcessedJob::Failed(_)) | Err(_) => stats.jobs_failed += 1,
        }
        drop(stats);

        processed.map(Some)
    }

    /// Process jobs until none is claimable. Returns how many were handled.
    pub async fn drain(&self) -> Result<usize, JobStoreError> {
        let mut handled = 0;
        while self.run_once().await?.is_some() {
            handled += 1;
        }
        Ok(handled)
    }

    async fn process(&self, job: Job) -> Result<ProcessedJob, JobStoreError> {
        debug!("claimed job");

        let result = match self.registry.get(job.job_type()) {
            Some(executor) => {
                run_with_heartbeat(
                    &*self.jobs,
                    job.id,
                    self.config.heartbeat_interval,
                    executor.execute(&job),
                )
                .await
            }
            None => Err(StageError::precondition(format!(
                "no executor registered for {}",
                job.job_type()
            ))),
        };

        match result {
            Ok(outcome) => {
                let done = self.jobs.complete(job.id, outcome.result_id).await?;
                info!(result_id = ?done.result_id, "job done");
                self.after_terminal(&done, Some(&outcome)).await;
                Ok(ProcessedJob::Succeeded(done))
            }
            Err(e) => {
                debug!(error = %e, retryable = e.is_retryable(), "stage failed");
                match self.retry.resolve(job.id, &e).await? {
                    FailureResolution::Requeued(job) => Ok(ProcessedJob::Requeued(job)),
                    FailureResolution::Failed(job) => {
                        self.after_terminal(&job, None).await;
                        Ok(ProcessedJob::Failed(job))
                    }
                }
            }
        }
    }

    /// Side effects of a terminal transition. Nothing here can fail the job.
    async fn after_terminal(&self, job: &Job, outcome: Option<&StageOutcome>) {
        if let Some(batch_id) = &job.batch_id {
            if let Err(e) = self.batches.on_member_terminal(batch_id).await {
                warn!(batch_id = %batch_id, error = %e, "batch aggregation failed");
            }
            return;
        }

        // Standalone jobs notify on success only.
        let Some(outcome) = outcome else {
            return;
        };
        match self.jobs.mark_notification_sent(job.id).await {
            Ok(true) => {
                let send = self
                    .notifier
                    .notify(job.owner_id, &outcome.title, &outcome.content);
                match tokio::time::timeout(self.config.capability_timeout, send).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(error = %e, "notification failed"),
                    Err(_) => warn!("notification timed out"),
                }
            }
            Ok(false) => debug!("notification already sent"),
            Err(e) => warn!(error = %e, "failed to mark notification as sent"),
        }
    }

    /// Run the recovery sweep, then poll until shut down.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let trigger = WorkerTrigger(Arc::new(Notify::new()));
        let stats = self.stats.clone();
        let wake = trigger.0.clone();

        let join = tokio::spawn(async move { self.run(shutdown_rx, wake).await });

        WorkerHandle {
            shutdown: shutdown_tx,
            trigger,
            join,
            stats,
            started: Instant::now(),
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>, wake: Arc<Notify>) {
        info!(worker = %self.config.name, job_types = ?self.registry.job_types(), "job worker started");

        match self.recovery.run().await {
            Ok(report) => {
                lock(&self.stats).jobs_recovered += report.recovered.len() as u64;
            }
            Err(e) => error!(worker = %self.config.name, error = %e, "recovery sweep failed"),
        }

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_once().await {
                // Look for the next job right away.
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => error!(worker = %self.config.name, error = %e, "job processing failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = wake.notified() => debug!(worker = %self.config.name, "worker woken"),
                _ = shutdown.changed() => {}
            }
        }

        info!(worker = %self.config.name, "job worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::stages::StageExecutor;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::{JobKind, JobStatus, JobType, NewJob, RetryPolicy};
    use crate::catalog::InMemoryCatalog;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use troubadour_ai::CapabilityError;
    use troubadour_ai::scripted::RecordingNotificationSink;
    use troubadour_core::{BatchId, TrackId, UserId};

    /// Fails the first `failures` calls transiently, then succeeds.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl StageExecutor for Flaky {
        fn job_type(&self) -> JobType {
            JobType::Analyze
        }

        async fn execute(&self, _job: &Job) -> Result<StageOutcome, StageError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(CapabilityError::transient("upstream 503").into());
            }
            Ok(StageOutcome {
                result_id: None,
                title: "Analysis complete".into(),
                content: "ok".into(),
            })
        }
    }

    struct Fixture {
        jobs: Arc<InMemoryJobStore>,
        sink: Arc<RecordingNotificationSink>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                jobs: InMemoryJobStore::arc(),
                sink: Arc::new(RecordingNotificationSink::new()),
            }
        }

        fn worker(&self, failures: u32) -> JobWorker {
            let mut registry = StageRegistry::new();
            registry.register(Flaky {
                failures,
                calls: AtomicU32::new(0),
            });
            JobWorker::new(
                self.jobs.clone(),
                InMemoryCatalog::arc(),
                registry,
                self.sink.clone(),
                WorkerConfig::default()
                    .with_poll_interval(Duration::from_millis(20))
                    .with_retry_policy(RetryPolicy::immediate()),
            )
        }

        async fn enqueue(&self, batch: Option<&BatchId>) -> troubadour_core::JobId {
            let mut new = NewJob::new(
                JobKind::Analyze {
                    track_id: TrackId::new(),
                },
                UserId::new(),
            );
            if let Some(batch) = batch {
                new = new.in_batch(batch.clone());
            }
            self.jobs.enqueue(new.into_job()).await.unwrap()
        }
    }

    #[tokio::test]
    async fn empty_queue_does_nothing() {
        let f = Fixture::new();
        assert!(f.worker(0).run_once().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn success_completes_and_notifies_once() {
        let f = Fixture::new();
        let id = f.enqueue(None).await;
        let worker = f.worker(0);

        let processed = worker.run_once().await.unwrap().unwrap();
        assert!(matches!(processed, ProcessedJob::Succeeded(_)));

        let job = f.jobs.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.progress, 100);
        assert!(job.notification_sent);
        assert_eq!(f.sink.sent().len(), 1);
        assert_eq!(worker.stats().jobs_succeeded, 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let f = Fixture::new();
        let id = f.enqueue(None).await;
        let worker = f.worker(2);

        assert_eq!(worker.drain().await.unwrap(), 3);

        let job = f.jobs.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.attempts, 3);
        let stats = worker.stats();
        assert_eq!(stats.jobs_requeued, 2);
        assert_eq!(stats.jobs_succeeded, 1);
    }

    #[tokio::test]
    async fn missing_executor_fails_without_retry() {
        let f = Fixture::new();
        let job = NewJob::new(
            JobKind::Compare {
                track_id: TrackId::new(),
            },
            UserId::new(),
        )
        .into_job();
        let id = f.jobs.enqueue(job).await.unwrap();

        let processed = f.worker(0).run_once().await.unwrap().unwrap();
        assert!(matches!(processed, ProcessedJob::Failed(_)));

        let job = f.jobs.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.attempts, 1);
        assert!(f.sink.sent().is_empty());
    }

    #[tokio::test]
    async fn batch_members_notify_only_as_a_batch() {
        let f = Fixture::new();
        let batch = BatchId::new("b1").unwrap();
        f.enqueue(Some(&batch)).await;
        f.enqueue(Some(&batch)).await;

        f.worker(0).drain().await.unwrap();

        let sent = f.sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].content, "2 of 2 succeeded");
    }

    #[tokio::test]
    async fn notification_failure_does_not_fail_the_job() {
        let f = Fixture::new();
        f.sink.set_failing(true);
        let id = f.enqueue(None).await;

        f.worker(0).run_once().await.unwrap();

        let job = f.jobs.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
    }

    #[tokio::test]
    async fn spawned_worker_recovers_then_processes() {
        let f = Fixture::new();
        let orphan = f.enqueue(None).await;
        f.jobs.claim_next().await.unwrap();

        let handle = f.worker(0).spawn();
        let mut status = JobStatus::Running;
        for _ in 0..100 {
            status = f.jobs.get(orphan).await.unwrap().unwrap().status;
            if status == JobStatus::Done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, JobStatus::Done);
        assert_eq!(handle.stats().jobs_recovered, 1);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn trigger_wakes_an_idle_worker() {
        let f = Fixture::new();
        let mut registry = StageRegistry::new();
        registry.register(Flaky {
            failures: 0,
            calls: AtomicU32::new(0),
        });
        let worker = JobWorker::new(
            f.jobs.clone(),
            InMemoryCatalog::arc(),
            registry,
            f.sink.clone(),
            WorkerConfig::default().with_poll_interval(Duration::from_secs(3600)),
        );
        let handle = worker.spawn();
        // Let the worker reach its idle wait.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let id = f.enqueue(None).await;
        handle.trigger().wake();

        let mut status = JobStatus::Queued;
        for _ in 0..100 {
            status = f.jobs.get(id).await.unwrap().unwrap().status;
            if status == JobStatus::Done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, JobStatus::Done);
        handle.shutdown().await;
    }
}
