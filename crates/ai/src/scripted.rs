//! Scripted capabilities for tests/dev.
//!
//! Each double replays a queue of canned outcomes and falls back to a default
//! once the queue is empty, so a test can say "fail twice, then succeed".

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use troubadour_core::UserId;

use crate::capability::{AudioAnalyzer, ComparisonEnricher, CritiqueGenerator, NotificationSink};
use crate::error::{CapabilityError, NotifyError};
use crate::model::{AlbumRequest, ComparisonRequest, Critique, CritiqueRequest, FeatureSet};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Queue of outcomes with a fallback.
#[derive(Debug)]
pub struct Script<T> {
    queued: Mutex<VecDeque<Result<T, CapabilityError>>>,
    fallback: Mutex<Result<T, CapabilityError>>,
    calls: Mutex<u32>,
    delay: Mutex<Duration>,
}

impl<T: Clone> Script<T> {
    pub fn new(fallback: Result<T, CapabilityError>) -> Self {
        Self {
            queued: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(fallback),
            calls: Mutex::new(0),
            delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Queue an outcome ahead of the fallback.
    pub fn push(&self, outcome: Result<T, CapabilityError>) {
        lock(&self.queued).push_back(outcome);
    }

    pub fn set_fallback(&self, outcome: Result<T, CapabilityError>) {
        *lock(&self.fallback) = outcome;
    }

    /// Make each call sleep before answering (exercises heartbeats/timeouts).
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    pub fn calls(&self) -> u32 {
        *lock(&self.calls)
    }

    async fn next(&self) -> Result<T, CapabilityError> {
        *lock(&self.calls) += 1;
        let delay = *lock(&self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let queued = lock(&self.queued).pop_front();
        match queued {
            Some(outcome) => outcome,
            None => lock(&self.fallback).clone(),
        }
    }
}

/// Audio analyzer answering from a script.
#[derive(Debug)]
pub struct ScriptedAudioAnalyzer {
    pub script: Script<FeatureSet>,
}

impl ScriptedAudioAnalyzer {
    pub fn new(features: FeatureSet) -> Self {
        Self {
            script: Script::new(Ok(features)),
        }
    }
}

impl Default for ScriptedAudioAnalyzer {
    fn default() -> Self {
        Self::new(FeatureSet {
            tempo_bpm: Some(120.0),
            key: Some("C major".into()),
            time_signature: Some("4/4".into()),
            duration_secs: Some(185.0),
            ..Default::default()
        })
    }
}

#[async_trait]
impl AudioAnalyzer for ScriptedAudioAnalyzer {
    async fn analyze(
        &self,
        _media_ref: &str,
        _focus: Option<&str>,
    ) -> Result<FeatureSet, CapabilityError> {
        self.script.next().await
    }
}

/// Critique generator answering from one script shared by all three
/// operations, recording every request it receives.
#[derive(Debug)]
pub struct ScriptedCritiqueGenerator {
    pub script: Script<Critique>,
    critiques: Mutex<Vec<CritiqueRequest>>,
    albums: Mutex<Vec<AlbumRequest>>,
    comparisons: Mutex<Vec<ComparisonRequest>>,
}

impl ScriptedCritiqueGenerator {
    pub fn new(critique: Critique) -> Self {
        Self {
            script: Script::new(Ok(critique)),
            critiques: Mutex::new(Vec::new()),
            albums: Mutex::new(Vec::new()),
            comparisons: Mutex::new(Vec::new()),
        }
    }

    pub fn critique_requests(&self) -> Vec<CritiqueRequest> {
        lock(&self.critiques).clone()
    }

    pub fn album_requests(&self) -> Vec<AlbumRequest> {
        lock(&self.albums).clone()
    }

    pub fn comparison_requests(&self) -> Vec<ComparisonRequest> {
        lock(&self.comparisons).clone()
    }
}

impl Default for ScriptedCritiqueGenerator {
    fn default() -> Self {
        Self::new(Critique {
            text: "Confident arrangement with a memorable hook. The mix is slightly crowded."
                .into(),
            scores: [("production".to_string(), 7.0), ("songwriting".to_string(), 8.0)]
                .into_iter()
                .collect(),
            excerpt: String::new(),
        })
    }
}

#[async_trait]
impl CritiqueGenerator for ScriptedCritiqueGenerator {
    async fn critique(&self, request: &CritiqueRequest) -> Result<Critique, CapabilityError> {
        lock(&self.critiques).push(request.clone());
        self.script.next().await
    }

    async fn synthesize_album(&self, request: &AlbumRequest) -> Result<Critique, CapabilityError> {
        lock(&self.albums).push(request.clone());
        self.script.next().await
    }

    async fn compare_versions(
        &self,
        request: &ComparisonRequest,
    ) -> Result<Critique, CapabilityError> {
        lock(&self.comparisons).push(request.clone());
        self.script.next().await
    }
}

/// Comparison enricher answering from a script.
#[derive(Debug)]
pub struct ScriptedEnricher {
    pub script: Script<String>,
}

impl Default for ScriptedEnricher {
    fn default() -> Self {
        Self {
            script: Script::new(Ok("The new version has a tighter low end.".into())),
        }
    }
}

#[async_trait]
impl ComparisonEnricher for ScriptedEnricher {
    async fn compare(&self, _media_a: &str, _media_b: &str) -> Result<String, CapabilityError> {
        self.script.next().await
    }
}

/// A delivered notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotification {
    pub owner: UserId,
    pub title: String,
    pub content: String,
}

/// In-memory notification sink for tests/dev.
#[derive(Debug, Default)]
pub struct RecordingNotificationSink {
    sent: Mutex<Vec<SentNotification>>,
    failing: Mutex<bool>,
}

impl RecordingNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every delivery fails (and is not recorded).
    pub fn set_failing(&self, failing: bool) {
        *lock(&self.failing) = failing;
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        lock(&self.sent).clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotificationSink {
    async fn notify(&self, owner: UserId, title: &str, content: &str) -> Result<(), NotifyError> {
        if *lock(&self.failing) {
            return Err(NotifyError::Delivery("sink is failing".into()));
        }
        lock(&self.sent).push(SentNotification {
            owner,
            title: title.to_string(),
            content: content.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queued_outcomes_run_before_fallback() {
        let analyzer = ScriptedAudioAnalyzer::default();
        analyzer
            .script
            .push(Err(CapabilityError::transient("502")));

        assert!(analyzer.analyze("s3://a", None).await.is_err());
        assert!(analyzer.analyze("s3://a", None).await.is_ok());
        assert!(analyzer.analyze("s3://a", None).await.is_ok());
        assert_eq!(analyzer.script.calls(), 3);
    }

    #[tokio::test]
    async fn critique_requests_are_recorded() {
        let generator = ScriptedCritiqueGenerator::default();
        let request = CritiqueRequest {
            track_title: "Night Drive".into(),
            features: FeatureSet::default(),
            focus: Some("mixing".into()),
            depth: Default::default(),
            previous: None,
        };
        generator.critique(&request).await.unwrap();
        assert_eq!(generator.critique_requests(), vec![request]);
    }

    #[tokio::test]
    async fn failing_sink_records_nothing() {
        let sink = RecordingNotificationSink::new();
        sink.set_failing(true);
        assert!(sink.notify(UserId::new(), "t", "c").await.is_err());
        assert!(sink.sent().is_empty());

        sink.set_failing(false);
        sink.notify(UserId::new(), "t", "c").await.unwrap();
        assert_eq!(sink.sent().len(), 1);
    }
}
