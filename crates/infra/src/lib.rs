//! Infrastructure layer: job queue, catalog persistence, config.

pub mod catalog;
pub mod config;
pub mod db;
pub mod jobs;
