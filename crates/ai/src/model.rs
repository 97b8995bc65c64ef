//! Payloads exchanged with the capabilities.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use troubadour_core::ReviewDepth;

/// Longest quick take derived from a critique body.
pub const QUICK_TAKE_MAX_CHARS: usize = 200;

/// One labelled region of a track (intro, verse, chorus...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub label: String,
    pub start_secs: f64,
    pub end_secs: f64,
}

/// Audio features extracted by the audio-understanding service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet {
    #[serde(default)]
    pub tempo_bpm: Option<f64>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub time_signature: Option<String>,
    #[serde(default)]
    pub duration_secs: Option<f64>,
    #[serde(default)]
    pub loudness_lufs: Option<f64>,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub moods: Vec<String>,
    #[serde(default)]
    pub instruments: Vec<String>,
    #[serde(default)]
    pub sections: Vec<Section>,
    /// Anything else the service reports (lyrics summary, energy curve, ...).
    #[serde(default)]
    pub extra: JsonValue,
}

/// A generated critique.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Critique {
    pub text: String,
    /// Named scores on a 0–10 scale ("production", "songwriting", ...).
    #[serde(default)]
    pub scores: BTreeMap<String, f64>,
    /// Short excerpt suitable for list views; may be empty.
    #[serde(default)]
    pub excerpt: String,
}

impl Critique {
    /// The excerpt if the service gave one, otherwise the first sentence of
    /// the text, capped at [`QUICK_TAKE_MAX_CHARS`].
    pub fn quick_take(&self) -> String {
        let source = if self.excerpt.trim().is_empty() {
            first_sentence(&self.text)
        } else {
            self.excerpt.trim()
        };
        source.chars().take(QUICK_TAKE_MAX_CHARS).collect()
    }
}

fn first_sentence(text: &str) -> &str {
    let text = text.trim();
    match text.find(|c: char| matches!(c, '.' | '!' | '?')) {
        Some(idx) => &text[..=idx],
        None => text,
    }
}

/// A review this track already received, for re-review mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviousCritique {
    pub review_number: u32,
    pub text: String,
    pub scores: BTreeMap<String, f64>,
}

/// Input for a single-track critique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CritiqueRequest {
    pub track_title: String,
    pub features: FeatureSet,
    pub focus: Option<String>,
    pub depth: ReviewDepth,
    /// Present when the track was reviewed before; the service is asked to
    /// compare against its own earlier output.
    pub previous: Option<PreviousCritique>,
}

/// Per-track material fed into an album synthesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlbumTrackInput {
    pub title: String,
    pub features: FeatureSet,
    pub critique: String,
    pub scores: BTreeMap<String, f64>,
}

/// Input for a project-level synthesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlbumRequest {
    pub project_title: String,
    pub focus: Option<String>,
    pub depth: ReviewDepth,
    pub tracks: Vec<AlbumTrackInput>,
}

/// Input for a joint evaluation of two versions of the same song.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonRequest {
    pub track_title: String,
    pub current: FeatureSet,
    pub previous: FeatureSet,
    /// Side-by-side listening notes; `None` when enrichment failed.
    pub side_by_side: Option<String>,
    pub depth: ReviewDepth,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quick_take_prefers_excerpt() {
        let c = Critique {
            text: "Long body. More words.".into(),
            scores: BTreeMap::new(),
            excerpt: "  Punchy chorus, muddy low end.  ".into(),
        };
        assert_eq!(c.quick_take(), "Punchy chorus, muddy low end.");
    }

    #[test]
    fn quick_take_falls_back_to_first_sentence() {
        let c = Critique {
            text: "The hook lands hard! The bridge wanders.".into(),
            ..Default::default()
        };
        assert_eq!(c.quick_take(), "The hook lands hard!");
    }

    #[test]
    fn quick_take_is_capped() {
        let c = Critique {
            text: "a".repeat(500),
            ..Default::default()
        };
        assert_eq!(c.quick_take().chars().count(), QUICK_TAKE_MAX_CHARS);
    }

    #[test]
    fn feature_set_tolerates_missing_fields() {
        let features: FeatureSet = serde_json::from_str(r#"{"tempo_bpm": 120.0}"#).unwrap();
        assert_eq!(features.tempo_bpm, Some(120.0));
        assert!(features.sections.is_empty());
    }
}
