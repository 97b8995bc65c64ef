//! HTTP API: job submission and status queries over the job engine.

pub mod app;
pub mod config;
