use async_trait::async_trait;

use troubadour_core::UserId;

use crate::error::{CapabilityError, NotifyError};
use crate::model::{AlbumRequest, ComparisonRequest, Critique, CritiqueRequest, FeatureSet};

/// Audio-understanding service.
#[async_trait]
pub trait AudioAnalyzer: Send + Sync + 'static {
    /// Extract features from the media at `media_ref`.
    ///
    /// `focus` is the project's review-focus hint, passed through verbatim.
    async fn analyze(
        &self,
        media_ref: &str,
        focus: Option<&str>,
    ) -> Result<FeatureSet, CapabilityError>;
}

/// Critique-generation service.
#[async_trait]
pub trait CritiqueGenerator: Send + Sync + 'static {
    async fn critique(&self, request: &CritiqueRequest) -> Result<Critique, CapabilityError>;

    async fn synthesize_album(&self, request: &AlbumRequest) -> Result<Critique, CapabilityError>;

    async fn compare_versions(
        &self,
        request: &ComparisonRequest,
    ) -> Result<Critique, CapabilityError>;
}

/// Side-by-side listening of two media files.
///
/// Failures here degrade a comparison rather than abort it.
#[async_trait]
pub trait ComparisonEnricher: Send + Sync + 'static {
    async fn compare(&self, media_a: &str, media_b: &str) -> Result<String, CapabilityError>;
}

/// Outbound notification channel (email, Slack, webhook...).
///
/// Best-effort: callers log and swallow errors.
#[async_trait]
pub trait NotificationSink: Send + Sync + 'static {
    async fn notify(&self, owner: UserId, title: &str, content: &str) -> Result<(), NotifyError>;
}
