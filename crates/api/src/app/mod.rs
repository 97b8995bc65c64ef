//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: store, capability and worker wiring
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router};

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::{AppServices, Wiring};

/// Build the full HTTP router over already-wired services.
pub fn build_app(services: AppServices) -> Router {
    routes::router().layer(Extension(Arc::new(services)))
}
