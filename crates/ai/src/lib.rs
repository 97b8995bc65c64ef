//! `troubadour-ai`
//!
//! **Responsibility:** boundary to the external audio-understanding,
//! critique-generation, comparison-enrichment and notification services.
//!
//! The job engine treats these as opaque capabilities: it hands them inputs,
//! waits, and classifies their failures. Nothing in this crate touches job or
//! catalog state.

pub mod capability;
pub mod error;
pub mod http;
pub mod model;
pub mod scripted;

pub use capability::{AudioAnalyzer, ComparisonEnricher, CritiqueGenerator, NotificationSink};
pub use error::{CapabilityError, NotifyError};
pub use model::{
    AlbumRequest, AlbumTrackInput, ComparisonRequest, Critique, CritiqueRequest, FeatureSet,
    PreviousCritique, Section,
};
