use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::frame::Crop;
use crate::{Detection, GpsFix};

/// Object detector backend.
///
/// Implementations receive an RGB8 frame and return detections stamped with
/// the frame id and timestamp they were given. Confidence values outside
/// `0.0..=1.0` are dropped by the pipeline, not clamped.
pub trait Detector: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    fn detect(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
        frame_id: u64,
        timestamp_ms: u64,
    ) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Assigns stable track ids across frames.
pub trait ObjectTracker: Send {
    fn assign(&mut self, detections: Vec<Detection>) -> Vec<Detection>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Classified<L> {
    pub label: L,
    pub confidence: f32,
}

/// Crop classifier. Helmet classification uses `Label = bool` (true when a
/// helmet is present); signal classification uses `SignalState`.
pub trait Classifier: Send {
    type Label;

    fn classify(&mut self, crop: &Crop) -> Result<Classified<Self::Label>>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlateRead {
    pub text: String,
    pub confidence: f32,
}

pub trait PlateReader: Send {
    /// `Ok(None)` when no plate text could be read.
    fn read(&mut self, crop: &Crop) -> Result<Option<PlateRead>>;
}

pub trait GpsSource: Send {
    /// Most recent fix, if any.
    fn latest(&mut self) -> Option<GpsFix>;
}
