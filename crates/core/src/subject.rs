//! Lifecycle statuses of the entities that jobs act upon.
//!
//! Tracks and projects are owned by the wider application; the job engine
//! only reads them and moves their status fields. These enums are the whole
//! contract between the two.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::{ProjectId, TrackId};

/// Lifecycle of a single track.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackStatus {
    Uploaded,
    Analyzing,
    Analyzed,
    Reviewing,
    Reviewed,
    Comparing,
}

impl TrackStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackStatus::Uploaded => "uploaded",
            TrackStatus::Analyzing => "analyzing",
            TrackStatus::Analyzed => "analyzed",
            TrackStatus::Reviewing => "reviewing",
            TrackStatus::Reviewed => "reviewed",
            TrackStatus::Comparing => "comparing",
        }
    }

    /// Statuses only held while a stage is in flight.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TrackStatus::Analyzing | TrackStatus::Reviewing | TrackStatus::Comparing
        )
    }
}

impl FromStr for TrackStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uploaded" => Ok(TrackStatus::Uploaded),
            "analyzing" => Ok(TrackStatus::Analyzing),
            "analyzed" => Ok(TrackStatus::Analyzed),
            "reviewing" => Ok(TrackStatus::Reviewing),
            "reviewed" => Ok(TrackStatus::Reviewed),
            "comparing" => Ok(TrackStatus::Comparing),
            other => Err(DomainError::unknown_variant("track status", other)),
        }
    }
}

/// Lifecycle of a project (album-level synthesis).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Draft,
    Reviewing,
    Reviewed,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Draft => "draft",
            ProjectStatus::Reviewing => "reviewing",
            ProjectStatus::Reviewed => "reviewed",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ProjectStatus::Reviewing)
    }
}

impl FromStr for ProjectStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(ProjectStatus::Draft),
            "reviewing" => Ok(ProjectStatus::Reviewing),
            "reviewed" => Ok(ProjectStatus::Reviewed),
            other => Err(DomainError::unknown_variant("project status", other)),
        }
    }
}

/// How long a generated critique should be, per the account's preference.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDepth {
    Brief,
    #[default]
    Standard,
    Detailed,
}

impl ReviewDepth {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewDepth::Brief => "brief",
            ReviewDepth::Standard => "standard",
            ReviewDepth::Detailed => "detailed",
        }
    }
}

impl FromStr for ReviewDepth {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "brief" => Ok(ReviewDepth::Brief),
            "standard" => Ok(ReviewDepth::Standard),
            "detailed" => Ok(ReviewDepth::Detailed),
            other => Err(DomainError::unknown_variant("review depth", other)),
        }
    }
}

/// The entity a job acts on.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum SubjectRef {
    Track(TrackId),
    Project(ProjectId),
}

impl core::fmt::Display for SubjectRef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SubjectRef::Track(id) => write!(f, "track:{id}"),
            SubjectRef::Project(id) => write!(f, "project:{id}"),
        }
    }
}

/// A subject's status as captured before a stage touched it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "status", rename_all = "snake_case")]
pub enum SubjectStatus {
    Track(TrackStatus),
    Project(ProjectStatus),
}

impl SubjectStatus {
    /// Whether this is a status a stage holds the subject in while running.
    pub fn is_transient(&self) -> bool {
        match self {
            SubjectStatus::Track(s) => s.is_transient(),
            SubjectStatus::Project(s) => s.is_transient(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_status_parses_its_own_labels() {
        for status in [
            TrackStatus::Uploaded,
            TrackStatus::Analyzing,
            TrackStatus::Analyzed,
            TrackStatus::Reviewing,
            TrackStatus::Reviewed,
            TrackStatus::Comparing,
        ] {
            assert_eq!(status.as_str().parse::<TrackStatus>().unwrap(), status);
        }
    }

    #[test]
    fn unknown_label_is_rejected() {
        let err = "mastering".parse::<TrackStatus>().unwrap_err();
        assert_eq!(err, DomainError::unknown_variant("track status", "mastering"));
    }

    #[test]
    fn only_in_flight_statuses_are_transient() {
        assert!(SubjectStatus::Track(TrackStatus::Reviewing).is_transient());
        assert!(SubjectStatus::Project(ProjectStatus::Reviewing).is_transient());
        assert!(!SubjectStatus::Track(TrackStatus::Analyzed).is_transient());
        assert!(!SubjectStatus::Project(ProjectStatus::Draft).is_transient());
    }

    #[test]
    fn subject_status_serializes_with_kind_tag() {
        let json = serde_json::to_value(SubjectStatus::Track(TrackStatus::Analyzed)).unwrap();
        assert_eq!(json, serde_json::json!({"kind": "track", "status": "analyzed"}));
    }
}
