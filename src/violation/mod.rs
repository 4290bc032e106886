//! Violation confirmation.
//!
//! - `temporal`: consecutive-frame counter per (kind, track)
//! - `confidence`: signal aggregation and tier routing
//! - `rules`: per-kind pure evaluators and their settings
//! - `engine`: the per-frame state machine tying them together

pub mod confidence;
pub mod engine;
pub mod rules;
pub mod temporal;

pub use confidence::{ConfidenceAggregator, SignalWeights, Signals, TierThresholds};
pub use engine::{EngineSettings, EngineStats, RuleEngine};
pub use rules::{
    evaluate, HelmetObservation, Nomination, RuleContext, RuleSet, RuleSettings, EGO_TRACK_ID,
};
pub use temporal::TemporalTracker;
