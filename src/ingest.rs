//! Frame sources.
//!
//! A source yields RGB8 snapshots without detections; the daemon runs the
//! detector and tracker over them. Sources never write frames to disk.
//!
//! - `SyntheticSource`: generated frames for unattended dry runs and tests
//! - `HttpSnapshotSource`: JPEG snapshots polled from a camera URL
//!   (feature `http-transport`)

use anyhow::{anyhow, Result};

use crate::frame::FrameSnapshot;
use crate::now_ms;

pub trait FrameSource: Send {
    fn name(&self) -> &str;

    fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    /// Next frame in capture order. Frame ids increase by one per frame.
    fn next_frame(&mut self) -> Result<FrameSnapshot>;

    fn is_healthy(&self) -> bool {
        true
    }

    fn frames_captured(&self) -> u64;
}

/// Open the source named by `uri`: `stub://` for synthetic frames, an
/// `http(s)://` snapshot URL otherwise.
pub fn open_source(uri: &str, width: u32, height: u32, fps: u32) -> Result<Box<dyn FrameSource>> {
    if uri.starts_with("stub://") {
        return Ok(Box::new(SyntheticSource::new(width, height, fps)));
    }
    if uri.starts_with("http://") || uri.starts_with("https://") {
        #[cfg(feature = "http-transport")]
        {
            return Ok(Box::new(HttpSnapshotSource::new(uri)));
        }
        #[cfg(not(feature = "http-transport"))]
        {
            return Err(anyhow!("http sources require the http-transport feature"));
        }
    }
    Err(anyhow!("unsupported frame source: {}", uri))
}

// ----------------------------------------------------------------------------
// Synthetic source
// ----------------------------------------------------------------------------

/// Deterministic frames with a slowly changing pattern. Timestamps advance
/// by the nominal frame interval from the wall clock at construction.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    interval_ms: u64,
    start_ms: u64,
    frame_count: u64,
    scene_state: u8,
}

impl SyntheticSource {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width: width.max(1),
            height: height.max(1),
            interval_ms: 1000 / u64::from(fps.max(1)),
            start_ms: now_ms().unwrap_or(0),
            frame_count: 0,
            scene_state: 0,
        }
    }

    fn pixels(&mut self) -> Vec<u8> {
        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }
        let len = self.width as usize * self.height as usize * 3;
        let shift = self.frame_count + u64::from(self.scene_state);
        (0..len)
            .map(|i| ((i as u64 + shift) % 256) as u8)
            .collect()
    }
}

impl FrameSource for SyntheticSource {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn next_frame(&mut self) -> Result<FrameSnapshot> {
        self.frame_count += 1;
        let pixels = self.pixels();
        let ts = self.start_ms + self.frame_count * self.interval_ms;
        FrameSnapshot::new(self.frame_count, ts, self.width, self.height, pixels)
    }

    fn frames_captured(&self) -> u64 {
        self.frame_count
    }
}

// ----------------------------------------------------------------------------
// HTTP snapshot source
// ----------------------------------------------------------------------------

#[cfg(feature = "http-transport")]
pub struct HttpSnapshotSource {
    url: String,
    frame_count: u64,
    last_error: Option<String>,
}

#[cfg(feature = "http-transport")]
impl HttpSnapshotSource {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            frame_count: 0,
            last_error: None,
        }
    }

    fn fetch(&self) -> Result<Vec<u8>> {
        use std::io::Read;

        let response = ureq::get(&self.url)
            .call()
            .map_err(|e| anyhow!("fetch snapshot from {}: {}", self.url, e))?;
        let mut bytes = Vec::new();
        response
            .into_reader()
            .read_to_end(&mut bytes)
            .map_err(|e| anyhow!("read snapshot: {}", e))?;
        if bytes.is_empty() {
            return Err(anyhow!("empty snapshot"));
        }
        Ok(bytes)
    }
}

#[cfg(feature = "http-transport")]
impl FrameSource for HttpSnapshotSource {
    fn name(&self) -> &str {
        "http-snapshot"
    }

    fn next_frame(&mut self) -> Result<FrameSnapshot> {
        let decoded = self.fetch().and_then(|bytes| {
            image::load_from_memory(&bytes).map_err(|e| anyhow!("decode snapshot: {}", e))
        });
        let image = match decoded {
            Ok(image) => {
                self.last_error = None;
                image.into_rgb8()
            }
            Err(e) => {
                self.last_error = Some(e.to_string());
                return Err(e);
            }
        };
        self.frame_count += 1;
        let (width, height) = image.dimensions();
        FrameSnapshot::new(self.frame_count, now_ms()?, width, height, image.into_raw())
    }

    fn is_healthy(&self) -> bool {
        self.last_error.is_none()
    }

    fn frames_captured(&self) -> u64 {
        self.frame_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_frames_are_ordered_and_sized() {
        let mut source = SyntheticSource::new(16, 8, 10);
        let a = source.next_frame().unwrap();
        let b = source.next_frame().unwrap();
        assert_eq!((a.frame_id, b.frame_id), (1, 2));
        assert_eq!(b.timestamp_ms - a.timestamp_ms, 100);
        assert_eq!(a.pixels().len(), 16 * 8 * 3);
        assert_ne!(a.pixels(), b.pixels());
        assert!(a.detections.is_empty());
        assert_eq!(source.frames_captured(), 2);
    }

    #[test]
    fn open_source_rejects_unknown_scheme() {
        assert!(open_source("rtsp://camera/stream", 640, 480, 30).is_err());
        assert_eq!(open_source("stub://", 4, 4, 30).unwrap().name(), "synthetic");
    }
}
