use axum::{Router, routing::get};

pub mod batches;
pub mod jobs;
pub mod system;

/// Router for the job endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/health", get(system::health))
        .nest("/jobs", jobs::router())
        .nest("/batches", batches::router())
}
