use anyhow::{anyhow, Result};
use log::{info, warn};

use crate::frame::FrameSnapshot;
use crate::Detection;

use super::backend::Detector;

/// The detectors the daemon was built with, exactly one of them active.
///
/// Owned by the frame loop, so detectors are called without locking.
pub struct DetectorRegistry {
    detectors: Vec<Box<dyn Detector>>,
    active: Option<usize>,
    consecutive_failures: u32,
}

impl DetectorRegistry {
    pub fn new() -> Self {
        Self {
            detectors: Vec::new(),
            active: None,
            consecutive_failures: 0,
        }
    }

    /// Add a detector. The first one added is active until `select` picks
    /// another; registering a name again replaces the earlier detector.
    pub fn register<D: Detector + 'static>(&mut self, detector: D) {
        let name = detector.name();
        match self.position(name) {
            Some(i) => self.detectors[i] = Box::new(detector),
            None => {
                self.detectors.push(Box::new(detector));
                if self.active.is_none() {
                    self.active = Some(self.detectors.len() - 1);
                }
            }
        }
    }

    /// Warm up `name` and make it the active detector. On failure the
    /// previous selection stays active.
    pub fn select(&mut self, name: &str) -> Result<()> {
        let i = self.position(name).ok_or_else(|| {
            anyhow!(
                "detector '{}' not available (have: {})",
                name,
                self.names().join(", ")
            )
        })?;
        self.detectors[i]
            .warm_up()
            .map_err(|e| anyhow!("detector '{}' failed to warm up: {}", name, e))?;
        self.active = Some(i);
        self.consecutive_failures = 0;
        info!("detector '{}' selected", name);
        Ok(())
    }

    pub fn active_name(&self) -> Option<&'static str> {
        self.active.map(|i| self.detectors[i].name())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.detectors.iter().map(|d| d.name()).collect()
    }

    /// Failed `detect` calls since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Run the active detector on `frame`. Detections stamped for another
    /// frame are dropped.
    pub fn detect(&mut self, frame: &FrameSnapshot) -> Result<Vec<Detection>> {
        let i = self
            .active
            .ok_or_else(|| anyhow!("no detector registered"))?;
        let detector = &mut self.detectors[i];
        let result = detector.detect(
            frame.pixels(),
            frame.width,
            frame.height,
            frame.frame_id,
            frame.timestamp_ms,
        );
        match result {
            Ok(detections) => {
                self.consecutive_failures = 0;
                let total = detections.len();
                let kept: Vec<Detection> = detections
                    .into_iter()
                    .filter(|d| d.frame_id == frame.frame_id)
                    .collect();
                if kept.len() < total {
                    warn!(
                        "{}: dropped {} detection(s) stamped for another frame",
                        detector.name(),
                        total - kept.len()
                    );
                }
                Ok(kept)
            }
            Err(e) => {
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                Err(e)
            }
        }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.detectors.iter().position(|d| d.name() == name)
    }
}

impl Default for DetectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
