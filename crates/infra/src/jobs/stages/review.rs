use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use troubadour_ai::{CritiqueGenerator, CritiqueRequest, PreviousCritique};
use troubadour_core::{SubjectStatus, TrackStatus};

use super::{StageContext, StageError, StageExecutor, StageOutcome};
use crate::catalog::{NewReview, ReviewKind, ReviewSubject};
use crate::jobs::types::{Job, JobKind, JobType};

/// Critique of a single analysed track.
///
/// When the track already has a review, the previous one is passed along and
/// the new review is stored as a re-review.
pub struct ReviewStage {
    ctx: StageContext,
    critic: Arc<dyn CritiqueGenerator>,
}

impl ReviewStage {
    pub fn new(ctx: StageContext, critic: Arc<dyn CritiqueGenerator>) -> Self {
        Self { ctx, critic }
    }
}

#[async_trait]
impl StageExecutor for ReviewStage {
    fn job_type(&self) -> JobType {
        JobType::Review
    }

    async fn execute(&self, job: &Job) -> Result<StageOutcome, StageError> {
        let JobKind::Review { track_id } = job.kind else {
            return Err(StageError::precondition(format!(
                "review stage cannot run a {} job",
                job.job_type()
            )));
        };

        let catalog = &self.ctx.catalog;
        let track = catalog
            .get_track(track_id)
            .await?
            .ok_or_else(|| StageError::precondition(format!("track {track_id} not found")))?;
        let features = catalog.get_features(track_id).await?.ok_or_else(|| {
            StageError::precondition(format!(
                "track {track_id} has no audio analysis; run analyze first"
            ))
        })?;
        let focus = catalog
            .get_project(track.project_id)
            .await?
            .and_then(|p| p.review_focus);
        let depth = catalog
            .get_account(job.owner_id)
            .await?
            .map(|a| a.preferred_review_depth)
            .unwrap_or_default();

        let subject = ReviewSubject::Track { track_id };
        let previous = catalog.latest_review(&subject).await?.map(|r| PreviousCritique {
            review_number: r.review_number,
            text: r.text,
            scores: r.scores,
        });
        let kind = if previous.is_some() {
            ReviewKind::Rereview
        } else {
            ReviewKind::Initial
        };

        self.ctx
            .enter(
                job,
                SubjectStatus::Track(track.status),
                SubjectStatus::Track(TrackStatus::Reviewing),
            )
            .await?;
        self.ctx.progress(job, 20, "Generating critique").await?;

        let request = CritiqueRequest {
            track_title: track.title.clone(),
            features,
            focus,
            depth,
            previous,
        };
        let critique = self.ctx.call(self.critic.critique(&request)).await?;

        self.ctx.progress(job, 80, "Saving review").await?;
        let quick_take = critique.quick_take();
        let review = catalog
            .insert_review(NewReview {
                subject,
                owner_id: job.owner_id,
                kind,
                text: critique.text,
                quick_take: quick_take.clone(),
                scores: critique.scores,
            })
            .await?;

        catalog
            .set_track_status(track_id, TrackStatus::Reviewed)
            .await?;
        catalog.increment_reviews(job.owner_id).await?;

        info!(
            track_id = %track_id,
            review_id = %review.id,
            review_number = review.review_number,
            "track reviewed"
        );

        Ok(StageOutcome {
            result_id: Some(review.id),
            title: format!("Review ready: {}", track.title),
            content: quick_take,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogStore;
    use crate::jobs::stages::testing::Harness;
    use crate::jobs::store::JobStore;
    use troubadour_ai::FeatureSet;
    use troubadour_core::ReviewDepth;

    async fn analysed_track(h: &Harness) -> troubadour_core::TrackId {
        let id = h.add_track("Night Drive", TrackStatus::Analyzed);
        h.catalog
            .save_features(id, &FeatureSet::default())
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn review_persists_critique() {
        let h = Harness::new();
        let track_id = analysed_track(&h).await;
        let job = h.running_job(JobKind::Review { track_id }).await;

        let outcome = ReviewStage::new(h.ctx(), h.critic.clone())
            .execute(&job)
            .await
            .unwrap();

        let review = h
            .catalog
            .get_review(outcome.result_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(review.kind, ReviewKind::Initial);
        assert_eq!(review.review_number, 1);
        assert_eq!(review.quick_take, "Confident arrangement with a memorable hook.");
        assert_eq!(outcome.content, review.quick_take);

        let track = h.catalog.get_track(track_id).await.unwrap().unwrap();
        assert_eq!(track.status, TrackStatus::Reviewed);
        let account = h.catalog.get_account(h.owner).await.unwrap().unwrap();
        assert_eq!(account.reviews_this_month, 1);

        let request = &h.critic.critique_requests()[0];
        assert_eq!(request.focus.as_deref(), Some("mixing"));
        assert_eq!(request.depth, ReviewDepth::Standard);
        assert!(request.previous.is_none());
    }

    #[tokio::test]
    async fn second_review_runs_in_rereview_mode() {
        let h = Harness::new();
        let track_id = analysed_track(&h).await;
        h.catalog
            .put_account(crate::catalog::Account {
                preferred_review_depth: ReviewDepth::Detailed,
                ..crate::catalog::Account::new(h.owner)
            })
            .unwrap();

        for _ in 0..2 {
            let job = h.running_job(JobKind::Review { track_id }).await;
            ReviewStage::new(h.ctx(), h.critic.clone())
                .execute(&job)
                .await
                .unwrap();
            h.jobs.complete(job.id, None).await.unwrap();
        }

        let requests = h.critic.critique_requests();
        assert_eq!(requests[1].depth, ReviewDepth::Detailed);
        assert_eq!(requests[1].previous.as_ref().unwrap().review_number, 1);

        let latest = h
            .catalog
            .latest_review(&ReviewSubject::Track { track_id })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.kind, ReviewKind::Rereview);
        assert_eq!(latest.review_number, 2);
    }

    #[tokio::test]
    async fn unanalysed_track_is_rejected_without_calling_the_critic() {
        let h = Harness::new();
        let track_id = h.add_track("Night Drive", TrackStatus::Uploaded);
        let job = h.running_job(JobKind::Review { track_id }).await;

        let err = ReviewStage::new(h.ctx(), h.critic.clone())
            .execute(&job)
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Precondition(_)));
        assert_eq!(h.critic.script.calls(), 0);

        let track = h.catalog.get_track(track_id).await.unwrap().unwrap();
        assert_eq!(track.status, TrackStatus::Uploaded);
    }
}
