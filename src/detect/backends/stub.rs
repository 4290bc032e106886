use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::detect::backend::{Classified, Classifier, Detector, GpsSource, PlateRead, PlateReader};
use crate::frame::Crop;
use crate::{Detection, GpsFix, SignalState};

/// Stub detector for dry runs. Never reports objects; tracks whether the
/// pixel content changed so `frames_changed` can be logged.
pub struct StubDetector {
    last_hash: Option<[u8; 32]>,
    frames_changed: u64,
}

impl StubDetector {
    pub fn new() -> Self {
        Self {
            last_hash: None,
            frames_changed: 0,
        }
    }

    pub fn frames_changed(&self) -> u64 {
        self.frames_changed
    }
}

impl Default for StubDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector for StubDetector {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(
        &mut self,
        pixels: &[u8],
        _width: u32,
        _height: u32,
        _frame_id: u64,
        _timestamp_ms: u64,
    ) -> Result<Vec<Detection>> {
        let current: [u8; 32] = Sha256::digest(pixels).into();
        if self.last_hash.is_some_and(|prev| prev != current) {
            self.frames_changed += 1;
        }
        self.last_hash = Some(current);
        Ok(Vec::new())
    }
}

/// Reports every rider as helmeted with a fixed confidence.
pub struct StubHelmetClassifier {
    pub has_helmet: bool,
    pub confidence: f32,
}

impl Default for StubHelmetClassifier {
    fn default() -> Self {
        Self {
            has_helmet: true,
            confidence: 0.0,
        }
    }
}

impl Classifier for StubHelmetClassifier {
    type Label = bool;

    fn classify(&mut self, _crop: &Crop) -> Result<Classified<bool>> {
        Ok(Classified {
            label: self.has_helmet,
            confidence: self.confidence,
        })
    }
}

/// Always returns a fixed signal state.
pub struct StubSignalClassifier {
    pub state: SignalState,
}

impl Default for StubSignalClassifier {
    fn default() -> Self {
        Self {
            state: SignalState::Unknown,
        }
    }
}

impl Classifier for StubSignalClassifier {
    type Label = SignalState;

    fn classify(&mut self, _crop: &Crop) -> Result<Classified<SignalState>> {
        Ok(Classified {
            label: self.state,
            confidence: if self.state == SignalState::Unknown { 0.0 } else { 1.0 },
        })
    }
}

/// Plate reader that returns a fixed read, or nothing.
#[derive(Default)]
pub struct StubPlateReader {
    pub read: Option<PlateRead>,
}

impl PlateReader for StubPlateReader {
    fn read(&mut self, _crop: &Crop) -> Result<Option<PlateRead>> {
        Ok(self.read.clone())
    }
}

/// GPS source pinned to one fix (or none).
#[derive(Default)]
pub struct FixedGps {
    pub fix: Option<GpsFix>,
}

impl GpsSource for FixedGps {
    fn latest(&mut self) -> Option<GpsFix> {
        self.fix
    }
}
