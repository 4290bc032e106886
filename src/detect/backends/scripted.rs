use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::Path;

use crate::detect::backend::Detector;
use crate::{BoundingBox, Detection, ObjectClass};

/// One object in a scripted frame.
#[derive(Clone, Debug, Deserialize)]
pub struct ScriptedObject {
    pub label: String,
    pub bbox: [f32; 4],
    pub confidence: f32,
}

/// Replays a fixed sequence of per-frame detections. Used for replaying
/// recorded scenes and for exercising the pipeline without a model.
pub struct ScriptedDetector {
    frames: Vec<Vec<ScriptedObject>>,
    cursor: usize,
    looping: bool,
}

impl ScriptedDetector {
    pub fn new(frames: Vec<Vec<ScriptedObject>>, looping: bool) -> Self {
        Self {
            frames,
            cursor: 0,
            looping,
        }
    }

    /// Load a JSON array of frames, each an array of `{label, bbox, confidence}`.
    pub fn from_file(path: &Path, looping: bool) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read detection script {}: {}", path.display(), e))?;
        let frames: Vec<Vec<ScriptedObject>> = serde_json::from_str(&raw)
            .map_err(|e| anyhow!("failed to parse detection script {}: {}", path.display(), e))?;
        Ok(Self::new(frames, looping))
    }

    pub fn remaining(&self) -> usize {
        self.frames.len().saturating_sub(self.cursor)
    }
}

impl Detector for ScriptedDetector {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn detect(
        &mut self,
        _pixels: &[u8],
        _width: u32,
        _height: u32,
        frame_id: u64,
        timestamp_ms: u64,
    ) -> Result<Vec<Detection>> {
        if self.cursor >= self.frames.len() {
            if !self.looping || self.frames.is_empty() {
                return Ok(Vec::new());
            }
            self.cursor = 0;
        }
        let objects = &self.frames[self.cursor];
        self.cursor += 1;
        Ok(objects
            .iter()
            .map(|o| {
                let [x1, y1, x2, y2] = o.bbox;
                Detection::new(
                    ObjectClass::from_label(&o.label),
                    BoundingBox::new(x1, y1, x2, y2),
                    o.confidence,
                    frame_id,
                    timestamp_ms,
                )
            })
            .collect())
    }
}
