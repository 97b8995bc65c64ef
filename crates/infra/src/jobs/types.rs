//! Core job types and policies.

use core::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use troubadour_core::{
    BatchId, DomainError, JobId, ProjectId, ReviewId, SubjectRef, SubjectStatus, TrackId, UserId,
};

/// Longest error message kept on a job.
pub const MAX_ERROR_CHARS: usize = 1000;

/// Attempts allowed when the caller does not say otherwise.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Largest attempt budget a job may carry.
pub const MAX_ATTEMPTS_LIMIT: u32 = 100;

/// Stage a job runs through; one executor per type.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    Analyze,
    Review,
    AlbumReview,
    Compare,
}

impl JobType {
    pub const ALL: [JobType; 4] = [
        JobType::Analyze,
        JobType::Review,
        JobType::AlbumReview,
        JobType::Compare,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Analyze => "analyze",
            JobType::Review => "review",
            JobType::AlbumReview => "album_review",
            JobType::Compare => "compare",
        }
    }
}

impl FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "analyze" => Ok(JobType::Analyze),
            "review" => Ok(JobType::Review),
            "album_review" => Ok(JobType::AlbumReview),
            "compare" => Ok(JobType::Compare),
            other => Err(DomainError::unknown_variant("job type", other)),
        }
    }
}

impl core::fmt::Display for JobType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a job does and to which subject.
///
/// The subject's kind is fixed by the variant, so a review can never be
/// pointed at a project.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    Analyze { track_id: TrackId },
    Review { track_id: TrackId },
    AlbumReview { project_id: ProjectId },
    Compare { track_id: TrackId },
}

impl JobKind {
    /// Build from a type and a raw subject id (API input, database rows).
    pub fn from_parts(job_type: JobType, subject_id: Uuid) -> Self {
        match job_type {
            JobType::Analyze => JobKind::Analyze {
                track_id: TrackId::from_uuid(subject_id),
            },
            JobType::Review => JobKind::Review {
                track_id: TrackId::from_uuid(subject_id),
            },
            JobType::AlbumReview => JobKind::AlbumReview {
                project_id: ProjectId::from_uuid(subject_id),
            },
            JobType::Compare => JobKind::Compare {
                track_id: TrackId::from_uuid(subject_id),
            },
        }
    }

    pub fn job_type(&self) -> JobType {
        match self {
            JobKind::Analyze { .. } => JobType::Analyze,
            JobKind::Review { .. } => JobType::Review,
            JobKind::AlbumReview { .. } => JobType::AlbumReview,
            JobKind::Compare { .. } => JobType::Compare,
        }
    }

    pub fn subject(&self) -> SubjectRef {
        match *self {
            JobKind::Analyze { track_id }
            | JobKind::Review { track_id }
            | JobKind::Compare { track_id } => SubjectRef::Track(track_id),
            JobKind::AlbumReview { project_id } => SubjectRef::Project(project_id),
        }
    }

    pub fn subject_uuid(&self) -> Uuid {
        match self.subject() {
            SubjectRef::Track(id) => *id.as_uuid(),
            SubjectRef::Project(id) => *id.as_uuid(),
        }
    }
}

/// Job execution status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed
    Queued,
    /// Owned by exactly one worker
    Running,
    Done,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }

    /// Whether the state machine has an edge `self -> next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Done)
                | (JobStatus::Running, JobStatus::Error)
                | (JobStatus::Running, JobStatus::Queued)
        )
    }
}

impl FromStr for JobStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "done" => Ok(JobStatus::Done),
            "error" => Ok(JobStatus::Error),
            other => Err(DomainError::unknown_variant("job status", other)),
        }
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backoff strategy between attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time
    Fixed,
    /// base * 2^(attempt-1)
    #[default]
    Exponential,
    /// base * attempt
    Linear,
}

/// Delay applied before a re-queued job becomes claimable again.
///
/// The attempt budget itself lives on the job (`max_attempts`); this only
/// shapes the wait between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(5), Duration::from_secs(300))
    }
}

impl RetryPolicy {
    /// Re-queued jobs are claimable straight away.
    pub fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }

    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay after the given failed attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic spread so tests stay reproducible.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).clamp(0.0, max_ms.max(base_ms)) as u64)
    }
}

/// A unit of asynchronous work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    #[serde(flatten)]
    pub kind: JobKind,
    pub status: JobStatus,
    pub owner_id: UserId,
    pub batch_id: Option<BatchId>,
    /// 1-based number of the attempt currently queued or running
    pub attempts: u32,
    pub max_attempts: u32,
    /// 0-100, advisory
    pub progress: u8,
    pub progress_message: Option<String>,
    pub result_id: Option<ReviewId>,
    pub error_message: Option<String>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub notification_sent: bool,
    /// Subject status captured right before the running stage touched it
    pub subject_rollback: Option<SubjectStatus>,
    /// Earliest instant the job may be claimed
    pub not_before: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn job_type(&self) -> JobType {
        self.kind.job_type()
    }

    pub fn subject(&self) -> SubjectRef {
        self.kind.subject()
    }

    /// Whether a claim may pick this job at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued && self.not_before.is_none_or(|at| at <= now)
    }

    pub fn has_attempts_left(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// Request to enqueue a job.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub kind: JobKind,
    pub owner_id: UserId,
    pub batch_id: Option<BatchId>,
    pub max_attempts: u32,
}

impl NewJob {
    pub fn new(kind: JobKind, owner_id: UserId) -> Self {
        Self {
            kind,
            owner_id,
            batch_id: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn in_batch(mut self, batch_id: BatchId) -> Self {
        self.batch_id = Some(batch_id);
        self
    }

    /// Clamped to `1..=MAX_ATTEMPTS_LIMIT`.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.clamp(1, MAX_ATTEMPTS_LIMIT);
        self
    }

    pub fn into_job(self) -> Job {
        let now = Utc::now();
        Job {
            id: JobId::new(),
            kind: self.kind,
            status: JobStatus::Queued,
            owner_id: self.owner_id,
            batch_id: self.batch_id,
            attempts: 1,
            max_attempts: self.max_attempts.clamp(1, MAX_ATTEMPTS_LIMIT),
            progress: 0,
            progress_message: None,
            result_id: None,
            error_message: None,
            heartbeat_at: None,
            notification_sent: false,
            subject_rollback: None,
            not_before: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }
}

/// Cut `message` to [`MAX_ERROR_CHARS`] characters.
pub fn truncate_error(message: &str) -> String {
    match message.char_indices().nth(MAX_ERROR_CHARS) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}
