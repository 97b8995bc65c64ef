//! Catalog storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;

use troubadour_ai::FeatureSet;
use troubadour_core::{ProjectId, ProjectStatus, ReviewId, TrackId, TrackStatus, UserId};

use super::types::{Account, NewReview, Project, Review, ReviewSubject, Track};

/// Catalog error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    #[error("track not found: {0}")]
    TrackNotFound(TrackId),
    #[error("project not found: {0}")]
    ProjectNotFound(ProjectId),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Read access to tracks/projects/accounts plus the handful of writes the
/// stages perform.
#[async_trait]
pub trait CatalogStore: Send + Sync + 'static {
    async fn get_account(&self, id: UserId) -> Result<Option<Account>, CatalogError>;

    async fn get_project(&self, id: ProjectId) -> Result<Option<Project>, CatalogError>;

    async fn get_track(&self, id: TrackId) -> Result<Option<Track>, CatalogError>;

    /// Tracks of a project, in upload order.
    async fn list_project_tracks(&self, id: ProjectId) -> Result<Vec<Track>, CatalogError>;

    async fn set_track_status(&self, id: TrackId, status: TrackStatus)
    -> Result<(), CatalogError>;

    async fn set_project_status(
        &self,
        id: ProjectId,
        status: ProjectStatus,
    ) -> Result<(), CatalogError>;

    /// Fill in the duration only if the track does not have one yet.
    async fn backfill_track_duration(&self, id: TrackId, secs: f64) -> Result<(), CatalogError>;

    /// Replace the track's feature set.
    async fn save_features(&self, id: TrackId, features: &FeatureSet) -> Result<(), CatalogError>;

    async fn get_features(&self, id: TrackId) -> Result<Option<FeatureSet>, CatalogError>;

    /// Persist a review, numbering it after the subject's existing ones.
    async fn insert_review(&self, review: NewReview) -> Result<Review, CatalogError>;

    async fn latest_review(&self, subject: &ReviewSubject) -> Result<Option<Review>, CatalogError>;

    async fn get_review(&self, id: ReviewId) -> Result<Option<Review>, CatalogError>;

    /// Add analysed minutes; creates the account row if missing.
    async fn add_minutes_used(&self, id: UserId, minutes: u64) -> Result<(), CatalogError>;

    /// Count one more review this month; creates the account row if missing.
    async fn increment_reviews(&self, id: UserId) -> Result<(), CatalogError>;
}

#[derive(Debug, Default)]
struct CatalogState {
    accounts: HashMap<UserId, Account>,
    projects: HashMap<ProjectId, Project>,
    tracks: HashMap<TrackId, Track>,
    track_order: Vec<TrackId>,
    features: HashMap<TrackId, FeatureSet>,
    reviews: Vec<Review>,
}

/// In-memory catalog for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    state: RwLock<CatalogState>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, CatalogState>, CatalogError> {
        self.state
            .read()
            .map_err(|_| CatalogError::Storage("catalog lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, CatalogState>, CatalogError> {
        self.state
            .write()
            .map_err(|_| CatalogError::Storage("catalog lock poisoned".into()))
    }

    pub fn put_account(&self, account: Account) -> Result<(), CatalogError> {
        self.write()?.accounts.insert(account.id, account);
        Ok(())
    }

    pub fn put_project(&self, project: Project) -> Result<(), CatalogError> {
        self.write()?.projects.insert(project.id, project);
        Ok(())
    }

    pub fn put_track(&self, track: Track) -> Result<(), CatalogError> {
        let mut state = self.write()?;
        if !state.tracks.contains_key(&track.id) {
            state.track_order.push(track.id);
        }
        state.tracks.insert(track.id, track);
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for InMemoryCatalog {
    async fn get_account(&self, id: UserId) -> Result<Option<Account>, CatalogError> {
        Ok(self.read()?.accounts.get(&id).cloned())
    }

    async fn get_project(&self, id: ProjectId) -> Result<Option<Project>, CatalogError> {
        Ok(self.read()?.projects.get(&id).cloned())
    }

    async fn get_track(&self, id: TrackId) -> Result<Option<Track>, CatalogError> {
        Ok(self.read()?.tracks.get(&id).cloned())
    }

    async fn list_project_tracks(&self, id: ProjectId) -> Result<Vec<Track>, CatalogError> {
        let state = self.read()?;
        Ok(state
            .track_order
            .iter()
            .filter_map(|tid| state.tracks.get(tid))
            .filter(|t| t.project_id == id)
            .cloned()
            .collect())
    }

    async fn set_track_status(
        &self,
        id: TrackId,
        status: TrackStatus,
    ) -> Result<(), CatalogError> {
        let mut state = self.write()?;
        let track = state
            .tracks
            .get_mut(&id)
            .ok_or(CatalogError::TrackNotFound(id))?;
        track.status = status;
        Ok(())
    }

    async fn set_project_status(
        &self,
        id: ProjectId,
        status: ProjectStatus,
    ) -> Result<(), CatalogError> {
        let mut state = self.write()?;
        let project = state
            .projects
            .get_mut(&id)
            .ok_or(CatalogError::ProjectNotFound(id))?;
        project.status = status;
        Ok(())
    }

    async fn backfill_track_duration(&self, id: TrackId, secs: f64) -> Result<(), CatalogError> {
        let mut state = self.write()?;
        let track = state
            .tracks
            .get_mut(&id)
            .ok_or(CatalogError::TrackNotFound(id))?;
        if track.duration_secs.is_none() {
            track.duration_secs = Some(secs);
        }
        Ok(())
    }

    async fn save_features(&self, id: TrackId, features: &FeatureSet) -> Result<(), CatalogError> {
        self.write()?.features.insert(id, features.clone());
        Ok(())
    }

    async fn get_features(&self, id: TrackId) -> Result<Option<FeatureSet>, CatalogError> {
        Ok(self.read()?.features.get(&id).cloned())
    }

    async fn insert_review(&self, review: NewReview) -> Result<Review, CatalogError> {
        let mut state = self.write()?;
        let previous = state
            .reviews
            .iter()
            .filter(|r| r.subject == review.subject)
            .count() as u32;
        let stored = Review {
            id: ReviewId::new(),
            subject: review.subject,
            owner_id: review.owner_id,
            kind: review.kind,
            text: review.text,
            quick_take: review.quick_take,
            scores: review.scores,
            review_number: previous + 1,
            created_at: Utc::now(),
        };
        state.reviews.push(stored.clone());
        Ok(stored)
    }

    async fn latest_review(&self, subject: &ReviewSubject) -> Result<Option<Review>, CatalogError> {
        Ok(self
            .read()?
            .reviews
            .iter()
            .filter(|r| &r.subject == subject)
            .max_by_key(|r| r.review_number)
            .cloned())
    }

    async fn get_review(&self, id: ReviewId) -> Result<Option<Review>, CatalogError> {
        Ok(self.read()?.reviews.iter().find(|r| r.id == id).cloned())
    }

    async fn add_minutes_used(&self, id: UserId, minutes: u64) -> Result<(), CatalogError> {
        let mut state = self.write()?;
        let account = state.accounts.entry(id).or_insert_with(|| Account::new(id));
        account.minutes_used += minutes;
        Ok(())
    }

    async fn increment_reviews(&self, id: UserId) -> Result<(), CatalogError> {
        let mut state = self.write()?;
        let account = state.accounts.entry(id).or_insert_with(|| Account::new(id));
        account.reviews_this_month += 1;
        Ok(())
    }
}
