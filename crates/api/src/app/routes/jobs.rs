use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use tracing::info;

use troubadour_core::{BatchId, DomainError, JobId, UserId};
use troubadour_infra::jobs::{JobKind, JobType, MAX_ATTEMPTS_LIMIT, NewJob};

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(create_job))
        .route("/stats", get(job_stats))
        .route("/:id", get(get_job))
}

pub async fn create_job(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::CreateJobRequest>,
) -> axum::response::Response {
    let job_type = match body.job_type.parse::<JobType>() {
        Ok(t) => t,
        Err(e) => return errors::domain_error_to_response(e),
    };
    let max_attempts = body.max_attempts.unwrap_or(services.default_max_attempts);
    if !(1..=MAX_ATTEMPTS_LIMIT).contains(&max_attempts) {
        return errors::domain_error_to_response(DomainError::validation(format!(
            "max_attempts must be between 1 and {MAX_ATTEMPTS_LIMIT}"
        )));
    }

    let mut new_job = NewJob::new(
        JobKind::from_parts(job_type, body.subject_id),
        UserId::from_uuid(body.owner_id),
    )
    .with_max_attempts(max_attempts);
    if let Some(raw) = body.batch_id {
        match BatchId::new(raw) {
            Ok(batch_id) => new_job = new_job.in_batch(batch_id),
            Err(e) => return errors::domain_error_to_response(e),
        }
    }

    let job_id = match services.jobs.enqueue(new_job.into_job()).await {
        Ok(id) => id,
        Err(e) => return errors::store_error_to_response(e),
    };
    info!(job_id = %job_id, job_type = %job_type, "job enqueued");
    services.wake_worker();

    (
        StatusCode::CREATED,
        Json(dto::CreateJobResponse {
            job_id: job_id.to_string(),
        }),
    )
        .into_response()
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id = match id.parse::<JobId>() {
        Ok(id) => id,
        Err(e) => return errors::domain_error_to_response(e),
    };
    match services.jobs.get(job_id).await {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", format!("job {job_id} not found")),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn job_stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.jobs.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}
