//! Entities the job engine reads and whose status/usage fields it writes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use troubadour_core::{
    DomainError, ProjectId, ProjectStatus, ReviewDepth, ReviewId, TrackId, TrackStatus, UserId,
};

/// Usage counters and preferences of a requesting account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: UserId,
    pub preferred_review_depth: ReviewDepth,
    pub minutes_used: u64,
    pub reviews_this_month: u32,
}

impl Account {
    pub fn new(id: UserId) -> Self {
        Self {
            id,
            preferred_review_depth: ReviewDepth::default(),
            minutes_used: 0,
            reviews_this_month: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub owner_id: UserId,
    pub title: String,
    /// Free-text hint ("mixing", "songwriting") passed to the services.
    pub review_focus: Option<String>,
    pub status: ProjectStatus,
}

/// One uploaded version of a song.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,
    pub project_id: ProjectId,
    pub owner_id: UserId,
    pub title: String,
    pub media_ref: String,
    pub duration_secs: Option<f64>,
    /// Earlier version of the same song, if this is a re-upload.
    pub predecessor_id: Option<TrackId>,
    pub status: TrackStatus,
}

/// What a review is about.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReviewSubject {
    Track {
        track_id: TrackId,
    },
    Project {
        project_id: ProjectId,
    },
    Comparison {
        track_id: TrackId,
        predecessor_id: TrackId,
    },
}

impl ReviewSubject {
    pub fn kind_str(&self) -> &'static str {
        match self {
            ReviewSubject::Track { .. } => "track",
            ReviewSubject::Project { .. } => "project",
            ReviewSubject::Comparison { .. } => "comparison",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewKind {
    /// First critique of a track
    Initial,
    /// Critique written against an earlier one
    Rereview,
    Album,
    Comparison,
}

impl ReviewKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewKind::Initial => "initial",
            ReviewKind::Rereview => "rereview",
            ReviewKind::Album => "album",
            ReviewKind::Comparison => "comparison",
        }
    }
}

impl core::str::FromStr for ReviewKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initial" => Ok(ReviewKind::Initial),
            "rereview" => Ok(ReviewKind::Rereview),
            "album" => Ok(ReviewKind::Album),
            "comparison" => Ok(ReviewKind::Comparison),
            other => Err(DomainError::unknown_variant("review kind", other)),
        }
    }
}

/// A persisted critique.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub id: ReviewId,
    pub subject: ReviewSubject,
    pub owner_id: UserId,
    pub kind: ReviewKind,
    pub text: String,
    pub quick_take: String,
    pub scores: BTreeMap<String, f64>,
    /// 1-based, per subject
    pub review_number: u32,
    pub created_at: DateTime<Utc>,
}

/// A review before the store numbers it.
#[derive(Debug, Clone, PartialEq)]
pub struct NewReview {
    pub subject: ReviewSubject,
    pub owner_id: UserId,
    pub kind: ReviewKind,
    pub text: String,
    pub quick_take: String,
    pub scores: BTreeMap<String, f64>,
}
