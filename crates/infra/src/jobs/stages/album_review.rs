use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use troubadour_ai::{AlbumRequest, AlbumTrackInput, CritiqueGenerator};
use troubadour_core::{ProjectStatus, SubjectStatus, TrackStatus};

use super::{StageContext, StageError, StageExecutor, StageOutcome};
use crate::catalog::{NewReview, ReviewKind, ReviewSubject};
use crate::jobs::types::{Job, JobKind, JobType};

/// Project-level synthesis over the project's reviewed tracks.
pub struct AlbumReviewStage {
    ctx: StageContext,
    critic: Arc<dyn CritiqueGenerator>,
}

impl AlbumReviewStage {
    pub fn new(ctx: StageContext, critic: Arc<dyn CritiqueGenerator>) -> Self {
        Self { ctx, critic }
    }
}

#[async_trait]
impl StageExecutor for AlbumReviewStage {
    fn job_type(&self) -> JobType {
        JobType::AlbumReview
    }

    async fn execute(&self, job: &Job) -> Result<StageOutcome, StageError> {
        let JobKind::AlbumReview { project_id } = job.kind else {
            return Err(StageError::precondition(format!(
                "album review stage cannot run a {} job",
                job.job_type()
            )));
        };

        let catalog = &self.ctx.catalog;
        let project = catalog
            .get_project(project_id)
            .await?
            .ok_or_else(|| StageError::precondition(format!("project {project_id} not found")))?;

        // Only reviewed tracks that still have their analysis take part.
        let mut inputs = Vec::new();
        for track in catalog.list_project_tracks(project_id).await? {
            if track.status != TrackStatus::Reviewed {
                continue;
            }
            let Some(features) = catalog.get_features(track.id).await? else {
                continue;
            };
            let latest = catalog
                .latest_review(&ReviewSubject::Track { track_id: track.id })
                .await?;
            let (critique, scores) = latest
                .map(|r| (r.text, r.scores))
                .unwrap_or_default();
            inputs.push(AlbumTrackInput {
                title: track.title,
                features,
                critique,
                scores,
            });
        }
        if inputs.is_empty() {
            return Err(StageError::precondition(format!(
                "project {project_id} has no reviewed tracks"
            )));
        }

        let depth = catalog
            .get_account(job.owner_id)
            .await?
            .map(|a| a.preferred_review_depth)
            .unwrap_or_default();

        self.ctx
            .enter(
                job,
                SubjectStatus::Project(project.status),
                SubjectStatus::Project(ProjectStatus::Reviewing),
            )
            .await?;
        let track_count = inputs.len();
        self.ctx
            .progress(job, 20, &format!("Synthesizing {track_count} tracks"))
            .await?;

        let request = AlbumRequest {
            project_title: project.title.clone(),
            focus: project.review_focus.clone(),
            depth,
            tracks: inputs,
        };
        let critique = self.ctx.call(self.critic.synthesize_album(&request)).await?;

        self.ctx.progress(job, 80, "Saving album review").await?;
        let quick_take = critique.quick_take();
        let review = catalog
            .insert_review(NewReview {
                subject: ReviewSubject::Project { project_id },
                owner_id: job.owner_id,
                kind: ReviewKind::Album,
                text: critique.text,
                quick_take: quick_take.clone(),
                scores: critique.scores,
            })
            .await?;

        catalog
            .set_project_status(project_id, ProjectStatus::Reviewed)
            .await?;

        info!(project_id = %project_id, review_id = %review.id, track_count, "album reviewed");

        Ok(StageOutcome {
            result_id: Some(review.id),
            title: format!("Album review ready: {}", project.title),
            content: quick_take,
        })
    }
}
