//! Postgres-backed job store.
//!
//! ## Claiming
//!
//! `claim_next` is one statement:
//!
//! ```sql
//! UPDATE jobs SET status = 'running', ...
//! WHERE id = (SELECT id FROM jobs WHERE status = 'queued' ...
//!             ORDER BY created_at, id LIMIT 1 FOR UPDATE SKIP LOCKED)
//! RETURNING ...
//! ```
//!
//! The row lock taken by the sub-select is held until the update commits, and
//! `SKIP LOCKED` makes concurrent claimers move on to the next row instead of
//! waiting, so two workers (in one process or many) never receive the same job.
//!
//! ## Guarded transitions
//!
//! Every other mutation carries `AND status = 'running'`. When no row comes
//! back the job is re-read to report `NotFound`, `InvalidTransition` or
//! `AttemptsExhausted`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | JobStoreError |
//! |------------|---------------|
//! | Database (unique violation `23505`) on insert | `AlreadyExists` |
//! | anything else | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use troubadour_core::{BatchId, JobId, ReviewId, SubjectStatus, UserId};

use super::store::{JobStats, JobStore, JobStoreError};
use super::types::{Job, JobKind, JobStatus, JobType, truncate_error};

macro_rules! job_columns {
    () => {
        "id, job_type, subject_id, status, owner_id, batch_id, attempts, max_attempts, \
         progress, progress_message, result_id, error_message, heartbeat_at, \
         notification_sent, subject_rollback, not_before, created_at, started_at, \
         completed_at, updated_at"
    };
}

/// Postgres-backed job store.
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: Arc<PgPool>,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn fetch(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(concat!("SELECT ", job_columns!(), " FROM jobs WHERE id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.map(|r| JobRow::from_row(&r)).transpose()
    }

    /// Explain why a guarded update on `job_id` matched no row.
    async fn guard_failure(&self, job_id: JobId) -> JobStoreError {
        match self.fetch(job_id).await {
            Ok(None) => JobStoreError::NotFound(job_id),
            Ok(Some(job)) if job.status == JobStatus::Running => JobStoreError::AttemptsExhausted {
                job_id,
                attempts: job.attempts,
                max_attempts: job.max_attempts,
            },
            Ok(Some(job)) => JobStoreError::InvalidTransition {
                job_id,
                expected: JobStatus::Running,
                actual: job.status,
            },
            Err(e) => e,
        }
    }

    async fn expect_row(
        &self,
        job_id: JobId,
        row: Option<sqlx::postgres::PgRow>,
    ) -> Result<Job, JobStoreError> {
        match row {
            Some(row) => JobRow::from_row(&row),
            None => Err(self.guard_failure(job_id).await),
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, job_type = %job.job_type()), err)]
    async fn enqueue(&self, job: Job) -> Result<JobId, JobStoreError> {
        let rollback = job
            .subject_rollback
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| JobStoreError::Storage(format!("encoding subject_rollback: {e}")))?;
        let attempts = i32::try_from(job.attempts)
            .map_err(|_| JobStoreError::Storage(format!("attempts out of range: {}", job.attempts)))?;
        let max_attempts = i32::try_from(job.max_attempts).map_err(|_| {
            JobStoreError::Storage(format!("max_attempts out of range: {}", job.max_attempts))
        })?;

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, job_type, subject_id, status, owner_id, batch_id, attempts, max_attempts,
                progress, progress_message, result_id, error_message, heartbeat_at,
                notification_sent, subject_rollback, not_before, created_at, started_at,
                completed_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(job.job_type().as_str())
        .bind(job.kind.subject_uuid())
        .bind(job.status.as_str())
        .bind(job.owner_id.as_uuid())
        .bind(job.batch_id.as_ref().map(|b| b.as_str().to_string()))
        .bind(attempts)
        .bind(max_attempts)
        .bind(job.progress as i16)
        .bind(job.progress_message.as_deref())
        .bind(job.result_id.map(|r| *r.as_uuid()))
        .bind(job.error_message.as_deref())
        .bind(job.heartbeat_at)
        .bind(job.notification_sent)
        .bind(rollback)
        .bind(job.not_before)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                JobStoreError::AlreadyExists(job.id)
            }
            _ => map_sqlx_error("enqueue", e),
        })?;

        Ok(job.id)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.fetch(job_id).await
    }

    #[instrument(skip(self), err)]
    async fn claim_next(&self) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(concat!(
            r#"
            UPDATE jobs
            SET status = 'running',
                started_at = NOW(),
                heartbeat_at = NOW(),
                not_before = NULL,
                updated_at = NOW()
            WHERE id = (
                SELECT id FROM jobs
                WHERE status = 'queued'
                  AND (not_before IS NULL OR not_before <= NOW())
                ORDER BY created_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING "#,
            job_columns!()
        ))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_next", e))?;

        row.map(|r| JobRow::from_row(&r)).transpose()
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn heartbeat(&self, job_id: JobId) -> Result<(), JobStoreError> {
        let row = sqlx::query(concat!(
            "UPDATE jobs SET heartbeat_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status = 'running' RETURNING ",
            job_columns!()
        ))
        .bind(job_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("heartbeat", e))?;
        self.expect_row(job_id, row).await.map(|_| ())
    }

    #[instrument(skip(self, message), fields(job_id = %job_id), err)]
    async fn update_progress(
        &self,
        job_id: JobId,
        progress: u8,
        message: &str,
    ) -> Result<(), JobStoreError> {
        let row = sqlx::query(concat!(
            "UPDATE jobs SET progress = $2, progress_message = $3, updated_at = NOW() \
             WHERE id = $1 AND status = 'running' RETURNING ",
            job_columns!()
        ))
        .bind(job_id.as_uuid())
        .bind(progress.min(100) as i16)
        .bind(message)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_progress", e))?;
        self.expect_row(job_id, row).await.map(|_| ())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn record_rollback(
        &self,
        job_id: JobId,
        snapshot: SubjectStatus,
    ) -> Result<(), JobStoreError> {
        let value = serde_json::to_value(snapshot)
            .map_err(|e| JobStoreError::Storage(format!("encoding subject_rollback: {e}")))?;
        let row = sqlx::query(concat!(
            "UPDATE jobs SET subject_rollback = $2, updated_at = NOW() \
             WHERE id = $1 AND status = 'running' RETURNING ",
            job_columns!()
        ))
        .bind(job_id.as_uuid())
        .bind(value)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_rollback", e))?;
        self.expect_row(job_id, row).await.map(|_| ())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn complete(
        &self,
        job_id: JobId,
        result_id: Option<ReviewId>,
    ) -> Result<Job, JobStoreError> {
        let row = sqlx::query(concat!(
            "UPDATE jobs SET status = 'done', progress = 100, result_id = $2, \
             completed_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status = 'running' RETURNING ",
            job_columns!()
        ))
        .bind(job_id.as_uuid())
        .bind(result_id.map(|r| *r.as_uuid()))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?;
        self.expect_row(job_id, row).await
    }

    #[instrument(skip(self, message), fields(job_id = %job_id), err)]
    async fn requeue(
        &self,
        job_id: JobId,
        message: &str,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<Job, JobStoreError> {
        let row = sqlx::query(concat!(
            "UPDATE jobs SET status = 'queued', attempts = attempts + 1, progress = 0, \
             progress_message = $2, heartbeat_at = NULL, not_before = $3, updated_at = NOW() \
             WHERE id = $1 AND status = 'running' AND attempts < max_attempts RETURNING ",
            job_columns!()
        ))
        .bind(job_id.as_uuid())
        .bind(message)
        .bind(not_before)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue", e))?;
        self.expect_row(job_id, row).await
    }

    #[instrument(skip(self, error_message), fields(job_id = %job_id), err)]
    async fn fail(&self, job_id: JobId, error_message: &str) -> Result<Job, JobStoreError> {
        let row = sqlx::query(concat!(
            "UPDATE jobs SET status = 'error', error_message = $2, \
             completed_at = NOW(), updated_at = NOW() \
             WHERE id = $1 AND status = 'running' RETURNING ",
            job_columns!()
        ))
        .bind(job_id.as_uuid())
        .bind(truncate_error(error_message))
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail", e))?;
        self.expect_row(job_id, row).await
    }

    #[instrument(skip(self, message), fields(job_id = %job_id), err)]
    async fn recover(&self, job_id: JobId, message: &str) -> Result<Job, JobStoreError> {
        let row = sqlx::query(concat!(
            "UPDATE jobs SET status = 'queued', progress = 0, progress_message = $2, \
             heartbeat_at = NULL, not_before = NULL, updated_at = NOW() \
             WHERE id = $1 AND status = 'running' RETURNING ",
            job_columns!()
        ))
        .bind(job_id.as_uuid())
        .bind(message)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("recover", e))?;
        self.expect_row(job_id, row).await
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn mark_notification_sent(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET notification_sent = TRUE, updated_at = NOW() \
             WHERE id = $1 AND notification_sent = FALSE",
        )
        .bind(job_id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_notification_sent", e))?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.fetch(job_id).await? {
            Some(_) => Ok(false),
            None => Err(JobStoreError::NotFound(job_id)),
        }
    }

    #[instrument(skip(self), fields(batch_id = %batch_id), err)]
    async fn list_batch(&self, batch_id: &BatchId) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(concat!(
            "SELECT ",
            job_columns!(),
            " FROM jobs WHERE batch_id = $1 ORDER BY created_at, id"
        ))
        .bind(batch_id.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_batch", e))?;

        rows.iter().map(JobRow::from_row).collect()
    }

    #[instrument(skip(self), fields(batch_id = %batch_id), err)]
    async fn claim_batch_notification(&self, batch_id: &BatchId) -> Result<bool, JobStoreError> {
        let result = sqlx::query(
            "INSERT INTO job_batches (batch_id) VALUES ($1) ON CONFLICT (batch_id) DO NOTHING",
        )
        .bind(batch_id.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_batch_notification", e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn list_by_status(
        &self,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(concat!(
            "SELECT ",
            job_columns!(),
            " FROM jobs WHERE ($1::text IS NULL OR status = $1) ORDER BY created_at, id LIMIT $2"
        ))
        .bind(status.map(|s| s.as_str()))
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_by_status", e))?;

        rows.iter().map(JobRow::from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("stats", e))?;
            let n = n.max(0) as usize;
            match status.parse::<JobStatus>() {
                Ok(JobStatus::Queued) => stats.queued = n,
                Ok(JobStatus::Running) => stats.running = n,
                Ok(JobStatus::Done) => stats.done = n,
                Ok(JobStatus::Error) => stats.error = n,
                Err(e) => return Err(JobStoreError::Storage(e.to_string())),
            }
        }
        Ok(stats)
    }
}

/// Decoding of a `jobs` row.
struct JobRow;

impl JobRow {
    fn from_row(row: &sqlx::postgres::PgRow) -> Result<Job, JobStoreError> {
        let get_err = |e: sqlx::Error| JobStoreError::Storage(format!("failed to read job row: {e}"));
        let bad = |e: troubadour_core::DomainError| {
            JobStoreError::Storage(format!("invalid job row: {e}"))
        };

        let job_type: String = row.try_get("job_type").map_err(get_err)?;
        let subject_id: Uuid = row.try_get("subject_id").map_err(get_err)?;
        let status: String = row.try_get("status").map_err(get_err)?;
        let batch_id: Option<String> = row.try_get("batch_id").map_err(get_err)?;
        let attempts: i32 = row.try_get("attempts").map_err(get_err)?;
        let max_attempts: i32 = row.try_get("max_attempts").map_err(get_err)?;
        let progress: i16 = row.try_get("progress").map_err(get_err)?;
        let result_id: Option<Uuid> = row.try_get("result_id").map_err(get_err)?;
        let rollback: Option<serde_json::Value> = row.try_get("subject_rollback").map_err(get_err)?;

        let job_type: JobType = job_type.parse().map_err(bad)?;
        let subject_rollback = rollback
            .map(serde_json::from_value::<SubjectStatus>)
            .transpose()
            .map_err(|e| JobStoreError::Storage(format!("invalid subject_rollback: {e}")))?;

        Ok(Job {
            id: JobId::from_uuid(row.try_get("id").map_err(get_err)?),
            kind: JobKind::from_parts(job_type, subject_id),
            status: status.parse().map_err(bad)?,
            owner_id: UserId::from_uuid(row.try_get("owner_id").map_err(get_err)?),
            batch_id: batch_id.map(BatchId::new).transpose().map_err(bad)?,
            attempts: attempts.max(0) as u32,
            max_attempts: max_attempts.max(0) as u32,
            progress: progress.clamp(0, 100) as u8,
            progress_message: row.try_get("progress_message").map_err(get_err)?,
            result_id: result_id.map(ReviewId::from_uuid),
            error_message: row.try_get("error_message").map_err(get_err)?,
            heartbeat_at: row.try_get("heartbeat_at").map_err(get_err)?,
            notification_sent: row.try_get("notification_sent").map_err(get_err)?,
            subject_rollback,
            not_before: row.try_get("not_before").map_err(get_err)?,
            created_at: row.try_get("created_at").map_err(get_err)?,
            started_at: row.try_get("started_at").map_err(get_err)?,
            completed_at: row.try_get("completed_at").map_err(get_err)?,
            updated_at: row.try_get("updated_at").map_err(get_err)?,
        })
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => JobStoreError::Storage(format!(
            "database error in {operation}: {}",
            db_err.message()
        )),
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        other => JobStoreError::Storage(format!("sqlx error in {operation}: {other}")),
    }
}
