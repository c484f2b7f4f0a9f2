//! Signal enrichment: validation, market snapshot, technical indicators,
//! data-quality flags.

pub mod indicators;
mod profile;
mod service;
mod validator;
mod worker;

pub use profile::{Constraints, FeatureProfile, IndicatorSet, ProfileRegistry};
pub use service::{EnrichmentOutcome, EnrichmentService, QualityFlags};
pub use validator::{SignalValidator, ValidationOutcome};
pub use worker::EnrichmentWorker;
