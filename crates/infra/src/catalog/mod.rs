//! Tracks, projects, accounts, feature sets and reviews.
//!
//! These entities are owned by the wider application. The job engine reads
//! them, writes their lifecycle status, stores feature sets and reviews, and
//! bumps usage counters. Nothing else.

pub mod postgres;
pub mod store;
pub mod types;

pub use postgres::PgCatalogStore;
pub use store::{CatalogError, CatalogStore, InMemoryCatalog};
pub use types::{Account, NewReview, Project, Review, ReviewKind, ReviewSubject, Track};
