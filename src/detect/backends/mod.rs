pub mod scripted;
pub mod stub;

pub use scripted::ScriptedDetector;
pub use stub::{FixedGps, StubDetector, StubHelmetClassifier, StubPlateReader, StubSignalClassifier};
