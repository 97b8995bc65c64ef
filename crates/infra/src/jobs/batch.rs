//! Batch completion aggregation.
//!
//! Members of a batch do not notify individually. Each time a member reaches
//! a terminal status the aggregator looks at the whole batch; once every
//! member is terminal, whoever takes the batch's one-time marker sends a
//! single consolidated notification.

use std::sync::Arc;

use tracing::{debug, info, warn};

use troubadour_ai::NotificationSink;
use troubadour_core::BatchId;

use super::store::{JobStore, JobStoreError};
use super::types::{Job, JobStatus, JobType};

/// Success/failure tally of a finished batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl BatchSummary {
    /// Tally `members`, or `None` while any of them is still in flight.
    ///
    /// Review jobs are what the user asked for; when a batch has any, only
    /// they are counted. Otherwise every member counts.
    pub fn from_members(members: &[Job]) -> Option<Self> {
        if members.is_empty() || members.iter().any(|j| !j.status.is_terminal()) {
            return None;
        }

        let has_reviews = members.iter().any(|j| j.job_type() == JobType::Review);
        let counted = members
            .iter()
            .filter(|j| !has_reviews || j.job_type() == JobType::Review);

        let mut summary = BatchSummary {
            total: 0,
            succeeded: 0,
            failed: 0,
        };
        for job in counted {
            summary.total += 1;
            match job.status {
                JobStatus::Done => summary.succeeded += 1,
                _ => summary.failed += 1,
            }
        }
        Some(summary)
    }

    /// "2 of 3 succeeded, 1 failed"
    pub fn message(&self) -> String {
        let mut message = format!("{} of {} succeeded", self.succeeded, self.total);
        if self.failed > 0 {
            message.push_str(&format!(", {} failed", self.failed));
        }
        message
    }
}

/// Result of consulting the aggregator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Some members are still queued or running.
    Pending { remaining: usize },
    /// Another caller already sent the batch notification.
    AlreadyNotified,
    /// This caller sent (or attempted to send) the notification.
    Notified(BatchSummary),
}

#[derive(Clone)]
pub struct BatchAggregator {
    jobs: Arc<dyn JobStore>,
    notifier: Arc<dyn NotificationSink>,
}

impl BatchAggregator {
    pub fn new(jobs: Arc<dyn JobStore>, notifier: Arc<dyn NotificationSink>) -> Self {
        Self { jobs, notifier }
    }

    pub async fn on_member_terminal(&self, batch_id: &BatchId) -> Result<BatchOutcome, JobStoreError> {
        let members = self.jobs.list_batch(batch_id).await?;
        let Some(summary) = BatchSummary::from_members(&members) else {
            let remaining = members.iter().filter(|j| !j.status.is_terminal()).count();
            debug!(batch_id = %batch_id, remaining, "batch still in progress");
            return Ok(BatchOutcome::Pending { remaining });
        };

        if !self.jobs.claim_batch_notification(batch_id).await? {
            return Ok(BatchOutcome::AlreadyNotified);
        }

        // Members share an owner; the first one addresses the notification.
        let owner = members[0].owner_id;
        let content = summary.message();
        info!(batch_id = %batch_id, summary = %content, "batch complete");

        if let Err(e) = self
            .notifier
            .notify(owner, &format!("Batch {batch_id} complete"), &content)
            .await
        {
            warn!(batch_id = %batch_id, error = %e, "batch notification failed");
        }
        Ok(BatchOutcome::Notified(summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::{JobKind, NewJob};
    use troubadour_ai::scripted::RecordingNotificationSink;
    use troubadour_core::{TrackId, UserId};

    fn member(kind: JobKind, status: JobStatus) -> Job {
        let mut job = NewJob::new(kind, UserId::new()).into_job();
        job.status = status;
        job
    }

    fn review(status: JobStatus) -> Job {
        member(
            JobKind::Review {
                track_id: TrackId::new(),
            },
            status,
        )
    }

    fn analyze(status: JobStatus) -> Job {
        member(
            JobKind::Analyze {
                track_id: TrackId::new(),
            },
            status,
        )
    }

    #[test]
    fn message_mentions_failures_only_when_present() {
        let all_good = BatchSummary {
            total: 3,
            succeeded: 3,
            failed: 0,
        };
        assert_eq!(all_good.message(), "3 of 3 succeeded");

        let mixed = BatchSummary {
            total: 3,
            succeeded: 2,
            failed: 1,
        };
        assert_eq!(mixed.message(), "2 of 3 succeeded, 1 failed");
    }

    #[test]
    fn unfinished_batch_has_no_summary() {
        let members = vec![review(JobStatus::Done), review(JobStatus::Running)];
        assert!(BatchSummary::from_members(&members).is_none());
        assert!(BatchSummary::from_members(&[]).is_none());
    }

    #[test]
    fn review_members_dominate_the_count() {
        let members = vec![
            analyze(JobStatus::Error),
            review(JobStatus::Done),
            review(JobStatus::Error),
        ];
        let summary = BatchSummary::from_members(&members).unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
    }

    #[test]
    fn batch_without_reviews_counts_everything() {
        let members = vec![analyze(JobStatus::Done), analyze(JobStatus::Error)];
        let summary = BatchSummary::from_members(&members).unwrap();
        assert_eq!(summary.message(), "1 of 2 succeeded, 1 failed");
    }

    #[tokio::test]
    async fn notifies_once() {
        let jobs = InMemoryJobStore::arc();
        let sink = Arc::new(RecordingNotificationSink::new());
        let batch = BatchId::new("upload-42").unwrap();
        for status in [JobStatus::Done, JobStatus::Error] {
            let mut job = review(status);
            job.batch_id = Some(batch.clone());
            jobs.enqueue(job).await.unwrap();
        }

        let aggregator = BatchAggregator::new(jobs.clone(), sink.clone());
        assert!(matches!(
            aggregator.on_member_terminal(&batch).await.unwrap(),
            BatchOutcome::Notified(_)
        ));
        assert_eq!(
            aggregator.on_member_terminal(&batch).await.unwrap(),
            BatchOutcome::AlreadyNotified
        );

        let sent = sink.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].content, "1 of 2 succeeded, 1 failed");
    }

    #[tokio::test]
    async fn pending_members_hold_the_notification() {
        let jobs = InMemoryJobStore::arc();
        let sink = Arc::new(RecordingNotificationSink::new());
        let batch = BatchId::new("upload-7").unwrap();
        for status in [JobStatus::Done, JobStatus::Queued] {
            let mut job = review(status);
            job.batch_id = Some(batch.clone());
            jobs.enqueue(job).await.unwrap();
        }

        let outcome = BatchAggregator::new(jobs, sink.clone())
            .on_member_terminal(&batch)
            .await
            .unwrap();
        assert_eq!(outcome, BatchOutcome::Pending { remaining: 1 });
        assert!(sink.sent().is_empty());
    }

    #[tokio::test]
    async fn delivery_failure_still_consumes_the_marker() {
        let jobs = InMemoryJobStore::arc();
        let sink = Arc::new(RecordingNotificationSink::new());
        sink.set_failing(true);
        let batch = BatchId::new("upload-9").unwrap();
        let mut job = review(JobStatus::Done);
        job.batch_id = Some(batch.clone());
        jobs.enqueue(job).await.unwrap();

        let aggregator = BatchAggregator::new(jobs, sink.clone());
        assert!(matches!(
            aggregator.on_member_terminal(&batch).await.unwrap(),
            BatchOutcome::Notified(_)
        ));
        assert_eq!(
            aggregator.on_member_terminal(&batch).await.unwrap(),
            BatchOutcome::AlreadyNotified
        );
    }
}
