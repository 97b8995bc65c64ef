//! `troubadour-core`: domain foundation building blocks.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! identifiers, the lifecycle statuses of the entities jobs act upon, and the
//! domain error model.

pub mod error;
pub mod id;
pub mod subject;

pub use error::DomainError;
pub use id::{BatchId, JobId, ProjectId, ReviewId, TrackId, UserId};
pub use subject::{ProjectStatus, ReviewDepth, SubjectRef, SubjectStatus, TrackStatus};
