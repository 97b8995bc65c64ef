use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};

use troubadour_core::BatchId;

use crate::app::services::AppServices;
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new().route("/:id", get(get_batch))
}

pub async fn get_batch(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let batch_id = match BatchId::new(id) {
        Ok(id) => id,
        Err(e) => return errors::domain_error_to_response(e),
    };
    let members = match services.jobs.list_batch(&batch_id).await {
        Ok(members) => members,
        Err(e) => return errors::store_error_to_response(e),
    };
    if members.is_empty() {
        return errors::json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("batch {batch_id} not found"),
        );
    }

    Json(dto::BatchResponse {
        batch_id: batch_id.to_string(),
        summary: dto::BatchProgress::of(&members),
        jobs: members,
    })
    .into_response()
}
