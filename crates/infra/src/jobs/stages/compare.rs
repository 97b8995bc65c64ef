use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use troubadour_ai::{ComparisonEnricher, ComparisonRequest, CritiqueGenerator};
use troubadour_core::{SubjectStatus, TrackStatus};

use super::{StageContext, StageError, StageExecutor, StageOutcome};
use crate::catalog::{NewReview, ReviewKind, ReviewSubject};
use crate::jobs::types::{Job, JobKind, JobType};

/// Joint evaluation of a track against its previous version.
///
/// The track returns to whatever status it had before the comparison.
pub struct CompareStage {
    ctx: StageContext,
    critic: Arc<dyn CritiqueGenerator>,
    enricher: Arc<dyn ComparisonEnricher>,
}

impl CompareStage {
    pub fn new(
        ctx: StageContext,
        critic: Arc<dyn CritiqueGenerator>,
        enricher: Arc<dyn ComparisonEnricher>,
    ) -> Self {
        Self {
            ctx,
            critic,
            enricher,
        }
    }
}

#[async_trait]
impl StageExecutor for CompareStage {
    fn job_type(&self) -> JobType {
        JobType::Compare
    }

    async fn execute(&self, job: &Job) -> Result<StageOutcome, StageError> {
        let JobKind::Compare { track_id } = job.kind else {
            return Err(StageError::precondition(format!(
                "compare stage cannot run a {} job",
                job.job_type()
            )));
        };

        let catalog = &self.ctx.catalog;
        let track = catalog
            .get_track(track_id)
            .await?
            .ok_or_else(|| StageError::precondition(format!("track {track_id} not found")))?;
        let predecessor_id = track.predecessor_id.ok_or_else(|| {
            StageError::precondition(format!("track {track_id} has no previous version"))
        })?;
        let predecessor = catalog.get_track(predecessor_id).await?.ok_or_else(|| {
            StageError::precondition(format!("previous version {predecessor_id} not found"))
        })?;
        let current = catalog.get_features(track_id).await?.ok_or_else(|| {
            StageError::precondition(format!("track {track_id} has no audio analysis"))
        })?;
        let previous = catalog.get_features(predecessor_id).await?.ok_or_else(|| {
            StageError::precondition(format!(
                "previous version {predecessor_id} has no audio analysis"
            ))
        })?;
        let depth = catalog
            .get_account(job.owner_id)
            .await?
            .map(|a| a.preferred_review_depth)
            .unwrap_or_default();

        let resting = track.status;
        self.ctx
            .enter(
                job,
                SubjectStatus::Track(resting),
                SubjectStatus::Track(TrackStatus::Comparing),
            )
            .await?;
        self.ctx.progress(job, 15, "Listening side by side").await?;

        let side_by_side = match self
            .ctx
            .call(self.enricher.compare(&predecessor.media_ref, &track.media_ref))
            .await
        {
            Ok(text) => Some(text),
            Err(e) => {
                warn!(track_id = %track_id, error = %e, "side-by-side enrichment failed; continuing without it");
                None
            }
        };

        self.ctx.progress(job, 50, "Comparing versions").await?;
        let request = ComparisonRequest {
            track_title: track.title.clone(),
            current,
            previous,
            side_by_side,
            depth,
        };
        let critique = self.ctx.call(self.critic.compare_versions(&request)).await?;

        self.ctx.progress(job, 85, "Saving comparison").await?;
        let quick_take = critique.quick_take();
        let review = catalog
            .insert_review(NewReview {
                subject: ReviewSubject::Comparison {
                    track_id,
                    predecessor_id,
                },
                owner_id: job.owner_id,
                kind: ReviewKind::Comparison,
                text: critique.text,
                quick_take: quick_take.clone(),
                scores: critique.scores,
            })
            .await?;

        catalog.set_track_status(track_id, resting).await?;

        info!(
            track_id = %track_id,
            predecessor_id = %predecessor_id,
            review_id = %review.id,
            "versions compared"
        );

        Ok(StageOutcome {
            result_id: Some(review.id),
            title: format!("Version comparison ready: {}", track.title),
            content: quick_take,
        })
    }
}
