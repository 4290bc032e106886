//! Perception capabilities consumed by the pipeline.
//!
//! Detection, tracking, classification, OCR and GPS are external
//! collaborators; the pipeline sees them only through these traits.
//! `backends` holds the inert and replay implementations used for dry runs
//! and tests.

mod backend;
pub mod backends;
mod registry;
mod tracker;

pub use backend::{
    Classified, Classifier, Detector, GpsSource, ObjectTracker, PlateRead, PlateReader,
};
pub use backends::{
    FixedGps, ScriptedDetector, StubDetector, StubHelmetClassifier, StubPlateReader,
    StubSignalClassifier,
};
pub use registry::DetectorRegistry;
pub use tracker::{IouTracker, DEFAULT_MAX_MISSING_FRAMES, DEFAULT_TRACK_IOU};
