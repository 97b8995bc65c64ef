use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use troubadour_ai::AudioAnalyzer;
use troubadour_core::{SubjectStatus, TrackStatus};

use super::{StageContext, StageError, StageExecutor, StageOutcome};
use crate::jobs::types::{Job, JobKind, JobType};

/// Audio feature extraction for one track.
pub struct AnalyzeStage {
    ctx: StageContext,
    analyzer: Arc<dyn AudioAnalyzer>,
}

impl AnalyzeStage {
    pub fn new(ctx: StageContext, analyzer: Arc<dyn AudioAnalyzer>) -> Self {
        Self { ctx, analyzer }
    }
}

/// Billable minutes for a track of `secs` seconds.
pub(crate) fn billable_minutes(secs: f64) -> u64 {
    if secs.is_finite() && secs > 0.0 {
        (secs / 60.0).ceil() as u64
    } else {
        0
    }
}

#[async_trait]
impl StageExecutor for AnalyzeStage {
    fn job_type(&self) -> JobType {
        JobType::Analyze
    }

    async fn execute(&self, job: &Job) -> Result<StageOutcome, StageError> {
        let JobKind::Analyze { track_id } = job.kind else {
            return Err(StageError::precondition(format!(
                "analyze stage cannot run a {} job",
                job.job_type()
            )));
        };

        let catalog = &self.ctx.catalog;
        let track = catalog
            .get_track(track_id)
            .await?
            .ok_or_else(|| StageError::precondition(format!("track {track_id} not found")))?;
        let focus = catalog
            .get_project(track.project_id)
            .await?
            .and_then(|p| p.review_focus);

        self.ctx
            .enter(
                job,
                SubjectStatus::Track(track.status),
                SubjectStatus::Track(TrackStatus::Analyzing),
            )
            .await?;
        self.ctx.progress(job, 10, "Analyzing audio").await?;

        let features = self
            .ctx
            .call(self.analyzer.analyze(&track.media_ref, focus.as_deref()))
            .await?;

        self.ctx.progress(job, 80, "Saving analysis").await?;
        catalog.save_features(track_id, &features).await?;

        let duration = match (track.duration_secs, features.duration_secs) {
            (Some(known), _) => Some(known),
            (None, Some(measured)) => {
                catalog.backfill_track_duration(track_id, measured).await?;
                Some(measured)
            }
            (None, None) => None,
        };

        catalog
            .set_track_status(track_id, TrackStatus::Analyzed)
            .await?;

        if let Some(secs) = duration {
            catalog
                .add_minutes_used(job.owner_id, billable_minutes(secs))
                .await?;
        }

        info!(track_id = %track_id, duration_secs = ?duration, "track analyzed");

        Ok(StageOutcome {
            result_id: None,
            title: "Analysis complete".into(),
            content: format!("\"{}\" has been analyzed and is ready for review.", track.title),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogStore;
    use crate::jobs::stages::testing::Harness;
    use crate::jobs::store::JobStore;
    use troubadour_ai::{CapabilityError, FeatureSet};
    use troubadour_core::TrackId;

    #[test]
    fn minutes_round_up() {
        assert_eq!(billable_minutes(185.0), 4);
        assert_eq!(billable_minutes(60.0), 1);
        assert_eq!(billable_minutes(0.5), 1);
        assert_eq!(billable_minutes(0.0), 0);
        assert_eq!(billable_minutes(f64::NAN), 0);
    }

    #[tokio::test]
    async fn analyze_persists_features_and_usage() {
        let h = Harness::new();
        let track_id = h.add_track("Night Drive", TrackStatus::Uploaded);
        let job = h.running_job(JobKind::Analyze { track_id }).await;

        let stage = AnalyzeStage::new(h.ctx(), h.analyzer.clone());
        let outcome = stage.execute(&job).await.unwrap();
        assert!(outcome.result_id.is_none());

        let track = h.catalog.get_track(track_id).await.unwrap().unwrap();
        assert_eq!(track.status, TrackStatus::Analyzed);
        assert_eq!(track.duration_secs, Some(185.0));
        assert!(h.catalog.get_features(track_id).await.unwrap().is_some());

        let account = h.catalog.get_account(h.owner).await.unwrap().unwrap();
        assert_eq!(account.minutes_used, 4);

        let stored = h.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(
            stored.subject_rollback,
            Some(SubjectStatus::Track(TrackStatus::Uploaded))
        );
    }

    #[tokio::test]
    async fn missing_track_is_a_precondition_failure() {
        let h = Harness::new();
        let job = h
            .running_job(JobKind::Analyze {
                track_id: TrackId::new(),
            })
            .await;

        let err = AnalyzeStage::new(h.ctx(), h.analyzer.clone())
            .execute(&job)
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Precondition(_)));
        assert!(!err.is_retryable());
        assert_eq!(h.analyzer.script.calls(), 0);
    }

    #[tokio::test]
    async fn capability_failure_leaves_transient_status_for_rollback() {
        let h = Harness::new();
        let track_id = h.add_track("Night Drive", TrackStatus::Uploaded);
        let job = h.running_job(JobKind::Analyze { track_id }).await;
        h.analyzer
            .script
            .push(Err(CapabilityError::transient("503")));

        let err = AnalyzeStage::new(h.ctx(), h.analyzer.clone())
            .execute(&job)
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let track = h.catalog.get_track(track_id).await.unwrap().unwrap();
        assert_eq!(track.status, TrackStatus::Analyzing);
    }

    #[tokio::test]
    async fn slow_capability_times_out() {
        let h = Harness::new();
        let track_id = h.add_track("Night Drive", TrackStatus::Uploaded);
        let job = h.running_job(JobKind::Analyze { track_id }).await;
        h.analyzer
            .script
            .set_delay(std::time::Duration::from_millis(200));

        let mut ctx = h.ctx();
        ctx.capability_timeout = std::time::Duration::from_millis(20);
        let err = AnalyzeStage::new(ctx, h.analyzer.clone())
            .execute(&job)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StageError::Capability(CapabilityError::Timeout(_))
        ));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn known_duration_is_not_overwritten() {
        let h = Harness::new();
        let track_id = h.add_track("Night Drive", TrackStatus::Uploaded);
        h.catalog
            .backfill_track_duration(track_id, 61.0)
            .await
            .unwrap();
        h.analyzer.script.set_fallback(Ok(FeatureSet {
            duration_secs: Some(400.0),
            ..Default::default()
        }));
        let job = h.running_job(JobKind::Analyze { track_id }).await;

        AnalyzeStage::new(h.ctx(), h.analyzer.clone())
            .execute(&job)
            .await
            .unwrap();

        let account = h.catalog.get_account(h.owner).await.unwrap().unwrap();
        assert_eq!(account.minutes_used, 2);
    }
}
