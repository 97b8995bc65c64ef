//! Postgres-backed catalog.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use troubadour_ai::FeatureSet;
use troubadour_core::{ProjectId, ProjectStatus, ReviewId, TrackId, TrackStatus, UserId};

use super::store::{CatalogError, CatalogStore};
use super::types::{Account, NewReview, Project, Review, ReviewSubject, Track};

#[derive(Debug, Clone)]
pub struct PgCatalogStore {
    pool: Arc<PgPool>,
}

impl PgCatalogStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn storage(operation: &str) -> impl Fn(sqlx::Error) -> CatalogError + '_ {
    move |e| CatalogError::Storage(format!("sqlx error in {operation}: {e}"))
}

fn decode(operation: &str) -> impl Fn(String) -> CatalogError + '_ {
    move |e| CatalogError::Storage(format!("invalid row in {operation}: {e}"))
}

/// (kind, subject id, predecessor id) columns of a review subject.
fn subject_columns(subject: &ReviewSubject) -> (&'static str, Uuid, Option<Uuid>) {
    match subject {
        ReviewSubject::Track { track_id } => ("track", *track_id.as_uuid(), None),
        ReviewSubject::Project { project_id } => ("project", *project_id.as_uuid(), None),
        ReviewSubject::Comparison {
            track_id,
            predecessor_id,
        } => (
            "comparison",
            *track_id.as_uuid(),
            Some(*predecessor_id.as_uuid()),
        ),
    }
}

fn track_from_row(row: &sqlx::postgres::PgRow) -> Result<Track, CatalogError> {
    let err = storage("track row");
    let status: String = row.try_get("status").map_err(&err)?;
    let predecessor: Option<Uuid> = row.try_get("predecessor_id").map_err(&err)?;
    Ok(Track {
        id: TrackId::from_uuid(row.try_get("id").map_err(&err)?),
        project_id: ProjectId::from_uuid(row.try_get("project_id").map_err(&err)?),
        owner_id: UserId::from_uuid(row.try_get("owner_id").map_err(&err)?),
        title: row.try_get("title").map_err(&err)?,
        media_ref: row.try_get("media_ref").map_err(&err)?,
        duration_secs: row.try_get("duration_secs").map_err(&err)?,
        predecessor_id: predecessor.map(TrackId::from_uuid),
        status: status
            .parse()
            .map_err(|e: troubadour_core::DomainError| decode("track row")(e.to_string()))?,
    })
}

fn review_from_row(row: &sqlx::postgres::PgRow) -> Result<Review, CatalogError> {
    let err = storage("review row");
    let bad = decode("review row");
    let subject_kind: String = row.try_get("subject_kind").map_err(&err)?;
    let subject_id: Uuid = row.try_get("subject_id").map_err(&err)?;
    let predecessor: Option<Uuid> = row.try_get("predecessor_id").map_err(&err)?;
    let kind: String = row.try_get("kind").map_err(&err)?;
    let scores: serde_json::Value = row.try_get("scores").map_err(&err)?;
    let review_number: i32 = row.try_get("review_number").map_err(&err)?;

    let subject = match (subject_kind.as_str(), predecessor) {
        ("track", _) => ReviewSubject::Track {
            track_id: TrackId::from_uuid(subject_id),
        },
        ("project", _) => ReviewSubject::Project {
            project_id: ProjectId::from_uuid(subject_id),
        },
        ("comparison", Some(pred)) => ReviewSubject::Comparison {
            track_id: TrackId::from_uuid(subject_id),
            predecessor_id: TrackId::from_uuid(pred),
        },
        (other, _) => return Err(bad(format!("unknown review subject {other}"))),
    };
    let scores: BTreeMap<String, f64> =
        serde_json::from_value(scores).map_err(|e| bad(e.to_string()))?;

    Ok(Review {
        id: ReviewId::from_uuid(row.try_get("id").map_err(&err)?),
        subject,
        owner_id: UserId::from_uuid(row.try_get("owner_id").map_err(&err)?),
        kind: kind.parse().map_err(|e: troubadour_core::DomainError| bad(e.to_string()))?,
        text: row.try_get("text").map_err(&err)?,
        quick_take: row.try_get("quick_take").map_err(&err)?,
        scores,
        review_number: review_number.max(1) as u32,
        created_at: row.try_get("created_at").map_err(&err)?,
    })
}

const TRACK_COLUMNS: &str =
    "id, project_id, owner_id, title, media_ref, duration_secs, predecessor_id, status";
const REVIEW_COLUMNS: &str = "id, subject_kind, subject_id, predecessor_id, owner_id, kind, \
                              text, quick_take, scores, review_number, created_at";

#[async_trait]
impl CatalogStore for PgCatalogStore {
    #[instrument(skip(self), fields(user_id = %id), err)]
    async fn get_account(&self, id: UserId) -> Result<Option<Account>, CatalogError> {
        let row = sqlx::query(
            "SELECT preferred_review_depth, minutes_used, reviews_this_month \
             FROM accounts WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(storage("get_account"))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let err = storage("account row");
        let depth: String = row.try_get("preferred_review_depth").map_err(&err)?;
        let minutes: i64 = row.try_get("minutes_used").map_err(&err)?;
        let reviews: i32 = row.try_get("reviews_this_month").map_err(&err)?;
        Ok(Some(Account {
            id,
            preferred_review_depth: depth
                .parse()
                .map_err(|e: troubadour_core::DomainError| decode("account row")(e.to_string()))?,
            minutes_used: minutes.max(0) as u64,
            reviews_this_month: reviews.max(0) as u32,
        }))
    }

    #[instrument(skip(self), fields(project_id = %id), err)]
    async fn get_project(&self, id: ProjectId) -> Result<Option<Project>, CatalogError> {
        let row = sqlx::query(
            "SELECT owner_id, title, review_focus, status FROM projects WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(storage("get_project"))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let err = storage("project row");
        let status: String = row.try_get("status").map_err(&err)?;
        Ok(Some(Project {
            id,
            owner_id: UserId::from_uuid(row.try_get("owner_id").map_err(&err)?),
            title: row.try_get("title").map_err(&err)?,
            review_focus: row.try_get("review_focus").map_err(&err)?,
            status: status
                .parse()
                .map_err(|e: troubadour_core::DomainError| decode("project row")(e.to_string()))?,
        }))
    }

    #[instrument(skip(self), fields(track_id = %id), err)]
    async fn get_track(&self, id: TrackId) -> Result<Option<Track>, CatalogError> {
        let row = sqlx::query(&format!("SELECT {TRACK_COLUMNS} FROM tracks WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(storage("get_track"))?;
        row.as_ref().map(track_from_row).transpose()
    }

    #[instrument(skip(self), fields(project_id = %id), err)]
    async fn list_project_tracks(&self, id: ProjectId) -> Result<Vec<Track>, CatalogError> {
        let rows = sqlx::query(&format!(
            "SELECT {TRACK_COLUMNS} FROM tracks WHERE project_id = $1 ORDER BY created_at, id"
        ))
        .bind(id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(storage("list_project_tracks"))?;
        rows.iter().map(track_from_row).collect()
    }

    #[instrument(skip(self), fields(track_id = %id, status = status.as_str()), err)]
    async fn set_track_status(
        &self,
        id: TrackId,
        status: TrackStatus,
    ) -> Result<(), CatalogError> {
        let result = sqlx::query("UPDATE tracks SET status = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(status.as_str())
            .execute(&*self.pool)
            .await
            .map_err(storage("set_track_status"))?;
        if result.rows_affected() == 0 {
            return Err(CatalogError::TrackNotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(project_id = %id, status = status.as_str()), err)]
    async fn set_project_status(
        &self,
        id: ProjectId,
        status: ProjectStatus,
    ) -> Result<(), CatalogError> {
        let result = sqlx::query("UPDATE projects SET status = $2 WHERE id = $1")
            .bind(id.as_uuid())
            .bind(status.as_str())
            .execute(&*self.pool)
            .await
            .map_err(storage("set_project_status"))?;
        if result.rows_affected() == 0 {
            return Err(CatalogError::ProjectNotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(track_id = %id), err)]
    async fn backfill_track_duration(&self, id: TrackId, secs: f64) -> Result<(), CatalogError> {
        sqlx::query(
            "UPDATE tracks SET duration_secs = $2 WHERE id = $1 AND duration_secs IS NULL",
        )
        .bind(id.as_uuid())
        .bind(secs)
        .execute(&*self.pool)
        .await
        .map_err(storage("backfill_track_duration"))?;
        Ok(())
    }

    #[instrument(skip(self, features), fields(track_id = %id), err)]
    async fn save_features(&self, id: TrackId, features: &FeatureSet) -> Result<(), CatalogError> {
        let value = serde_json::to_value(features)
            .map_err(|e| CatalogError::Storage(format!("encoding features: {e}")))?;
        sqlx::query(
            r#"
            INSERT INTO track_features (track_id, features, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (track_id) DO UPDATE SET features = EXCLUDED.features, updated_at = NOW()
            "#,
        )
        .bind(id.as_uuid())
        .bind(value)
        .execute(&*self.pool)
        .await
        .map_err(storage("save_features"))?;
        Ok(())
    }

    #[instrument(skip(self), fields(track_id = %id), err)]
    async fn get_features(&self, id: TrackId) -> Result<Option<FeatureSet>, CatalogError> {
        let row = sqlx::query("SELECT features FROM track_features WHERE track_id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(storage("get_features"))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let value: serde_json::Value = row.try_get("features").map_err(storage("features row"))?;
        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| CatalogError::Storage(format!("invalid features: {e}")))
    }

    #[instrument(skip(self, review), fields(subject = review.subject.kind_str()), err)]
    async fn insert_review(&self, review: NewReview) -> Result<Review, CatalogError> {
        let (kind, subject_id, predecessor) = subject_columns(&review.subject);
        let scores = serde_json::to_value(&review.scores)
            .map_err(|e| CatalogError::Storage(format!("encoding scores: {e}")))?;

        // The unique (subject_kind, subject_id, review_number) constraint turns
        // a numbering race into an error rather than a duplicate number.
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO reviews (
                id, subject_kind, subject_id, predecessor_id, owner_id, kind,
                text, quick_take, scores, review_number, created_at
            )
            SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9,
                   COALESCE(MAX(review_number), 0) + 1, NOW()
            FROM reviews WHERE subject_kind = $2 AND subject_id = $3
            RETURNING {REVIEW_COLUMNS}
            "#
        ))
        .bind(ReviewId::new().as_uuid())
        .bind(kind)
        .bind(subject_id)
        .bind(predecessor)
        .bind(review.owner_id.as_uuid())
        .bind(review.kind.as_str())
        .bind(&review.text)
        .bind(&review.quick_take)
        .bind(scores)
        .fetch_one(&*self.pool)
        .await
        .map_err(storage("insert_review"))?;

        review_from_row(&row)
    }

    #[instrument(skip(self, subject), fields(subject = subject.kind_str()), err)]
    async fn latest_review(&self, subject: &ReviewSubject) -> Result<Option<Review>, CatalogError> {
        let (kind, subject_id, _) = subject_columns(subject);
        let row = sqlx::query(&format!(
            "SELECT {REVIEW_COLUMNS} FROM reviews \
             WHERE subject_kind = $1 AND subject_id = $2 \
             ORDER BY review_number DESC LIMIT 1"
        ))
        .bind(kind)
        .bind(subject_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(storage("latest_review"))?;
        row.as_ref().map(review_from_row).transpose()
    }

    #[instrument(skip(self), fields(review_id = %id), err)]
    async fn get_review(&self, id: ReviewId) -> Result<Option<Review>, CatalogError> {
        let row = sqlx::query(&format!("SELECT {REVIEW_COLUMNS} FROM reviews WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(storage("get_review"))?;
        row.as_ref().map(review_from_row).transpose()
    }

    #[instrument(skip(self), fields(user_id = %id), err)]
    async fn add_minutes_used(&self, id: UserId, minutes: u64) -> Result<(), CatalogError> {
        sqlx::query(
            r#"
            INSERT INTO accounts (id, minutes_used) VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET minutes_used = accounts.minutes_used + EXCLUDED.minutes_used
            "#,
        )
        .bind(id.as_uuid())
        .bind(minutes.min(i64::MAX as u64) as i64)
        .execute(&*self.pool)
        .await
        .map_err(storage("add_minutes_used"))?;
        Ok(())
    }

    #[instrument(skip(self), fields(user_id = %id), err)]
    async fn increment_reviews(&self, id: UserId) -> Result<(), CatalogError> {
        sqlx::query(
            r#"
            INSERT INTO accounts (id, reviews_this_month) VALUES ($1, 1)
            ON CONFLICT (id) DO UPDATE SET reviews_this_month = accounts.reviews_this_month + 1
            "#,
        )
        .bind(id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(storage("increment_reviews"))?;
        Ok(())
    }
}
