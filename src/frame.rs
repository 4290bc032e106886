//! Frame history for evidence capture.
//!
//! - `FrameSnapshot`: one processed frame (RGB8 pixels, detections, GPS).
//!   Immutable once built; pixels are zeroized on drop.
//! - `FrameBuffer`: bounded ring of recent snapshots, evicted by count and age.
//! - `SharedFrameBuffer`: the buffer behind a mutex so the frame loop and the
//!   packager can both reach it.
//!
//! Snapshots are held as `Arc<FrameSnapshot>`. Eviction only drops the
//! buffer's handle, so frames already selected for a packet stay alive until
//! the packet is written.

use anyhow::{anyhow, Result};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use zeroize::Zeroize;

use crate::{BoundingBox, Detection, GpsFix};

/// Hard cap on buffered frames regardless of configuration.
pub const MAX_BUFFER_FRAMES: usize = 900;

/// Default retention window in seconds.
pub const DEFAULT_BUFFER_SECS: u64 = 10;

// ----------------------------------------------------------------------------
// FrameSnapshot
// ----------------------------------------------------------------------------

pub struct FrameSnapshot {
    pub frame_id: u64,
    pub timestamp_ms: u64,
    pub width: u32,
    pub height: u32,
    /// RGB8, row-major.
    pixels: Vec<u8>,
    pub detections: Vec<Detection>,
    pub gps: Option<GpsFix>,
}

impl FrameSnapshot {
    pub fn new(
        frame_id: u64,
        timestamp_ms: u64,
        width: u32,
        height: u32,
        pixels: Vec<u8>,
    ) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|n| n.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow: {}x{}", width, height))?;
        if width == 0 || height == 0 {
            return Err(anyhow!("frame {} has empty dimensions", frame_id));
        }
        if pixels.len() != expected {
            return Err(anyhow!(
                "frame {} pixel buffer is {} bytes, expected {} for {}x{} RGB",
                frame_id,
                pixels.len(),
                expected,
                width,
                height
            ));
        }
        Ok(Self {
            frame_id,
            timestamp_ms,
            width,
            height,
            pixels,
            detections: Vec::new(),
            gps: None,
        })
    }

    /// Solid grey frame. Used by the synthetic source and tests.
    pub fn blank(frame_id: u64, timestamp_ms: u64, width: u32, height: u32) -> Self {
        let len = width as usize * height as usize * 3;
        Self {
            frame_id,
            timestamp_ms,
            width,
            height,
            pixels: vec![96u8; len],
            detections: Vec::new(),
            gps: None,
        }
    }

    pub fn with_detections(mut self, detections: Vec<Detection>) -> Self {
        self.detections = detections;
        self
    }

    pub fn with_gps(mut self, gps: Option<GpsFix>) -> Self {
        self.gps = gps;
        self
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn byte_len(&self) -> usize {
        self.pixels.len()
    }

    /// Evidence ranking score: highest confidence among detections on the
    /// given track, or among all detections when the track is absent.
    pub fn score_for_track(&self, track_id: u64) -> f32 {
        let on_track = self
            .detections
            .iter()
            .filter(|d| d.track_id == Some(track_id))
            .map(|d| d.confidence)
            .fold(None, |acc: Option<f32>, c| Some(acc.map_or(c, |a| a.max(c))));
        on_track.unwrap_or_else(|| {
            self.detections
                .iter()
                .map(|d| d.confidence)
                .fold(0.0, f32::max)
        })
    }

    /// Copy out the pixels under a normalized box. Boxes are clamped to the
    /// frame; a degenerate box yields at least one pixel.
    pub fn crop(&self, bbox: &BoundingBox) -> Crop {
        let (x0, y0, x1, y1) = pixel_rect(bbox, self.width, self.height);
        let w = x1 - x0;
        let h = y1 - y0;
        let mut pixels = Vec::with_capacity(w as usize * h as usize * 3);
        for y in y0..y1 {
            let start = (y as usize * self.width as usize + x0 as usize) * 3;
            let end = start + w as usize * 3;
            pixels.extend_from_slice(&self.pixels[start..end]);
        }
        Crop {
            width: w,
            height: h,
            pixels,
        }
    }
}

impl Drop for FrameSnapshot {
    fn drop(&mut self) {
        self.pixels.zeroize();
    }
}

impl std::fmt::Debug for FrameSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSnapshot")
            .field("frame_id", &self.frame_id)
            .field("timestamp_ms", &self.timestamp_ms)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("detections", &self.detections.len())
            .field("gps", &self.gps)
            .finish()
    }
}

/// Pixel rectangle `[x0, x1) x [y0, y1)` for a normalized box.
pub(crate) fn pixel_rect(bbox: &BoundingBox, width: u32, height: u32) -> (u32, u32, u32, u32) {
    let scale = |v: f32, max: u32| -> u32 {
        if !v.is_finite() {
            return 0;
        }
        ((v.clamp(0.0, 1.0) * max as f32).round() as u32).min(max)
    };
    let x0 = scale(bbox.x1, width).min(width.saturating_sub(1));
    let y0 = scale(bbox.y1, height).min(height.saturating_sub(1));
    let x1 = scale(bbox.x2, width).max(x0 + 1).min(width);
    let y1 = scale(bbox.y2, height).max(y0 + 1).min(height);
    (x0, y0, x1, y1)
}

/// Pixels cut from a snapshot, handed to classifiers and OCR.
#[derive(Clone, Debug, PartialEq)]
pub struct Crop {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Drop for Crop {
    fn drop(&mut self) {
        self.pixels.zeroize();
    }
}

// ----------------------------------------------------------------------------
// FrameBuffer
// ----------------------------------------------------------------------------

pub struct FrameBuffer {
    frames: VecDeque<Arc<FrameSnapshot>>,
    max_frames: usize,
    max_age_ms: u64,
    evicted: u64,
}

impl FrameBuffer {
    pub fn new(max_frames: usize, max_age_ms: u64) -> Self {
        let max_frames = max_frames.clamp(1, MAX_BUFFER_FRAMES);
        Self {
            frames: VecDeque::with_capacity(max_frames),
            max_frames,
            max_age_ms,
            evicted: 0,
        }
    }

    /// Size the buffer for `secs` of history at the processed frame rate.
    pub fn for_window(secs: u64, processed_fps: f64) -> Self {
        let frames = (secs as f64 * processed_fps.max(0.1)).ceil() as usize;
        Self::new(frames.max(1), secs.saturating_mul(1000))
    }

    /// Push a frame. Evicts anything older than the retention window relative
    /// to the new frame, then the oldest frames while over capacity.
    pub fn push(&mut self, frame: Arc<FrameSnapshot>) {
        let horizon = frame.timestamp_ms.saturating_sub(self.max_age_ms);
        while let Some(oldest) = self.frames.front() {
            if oldest.timestamp_ms < horizon {
                self.frames.pop_front();
                self.evicted += 1;
            } else {
                break;
            }
        }
        while self.frames.len() >= self.max_frames {
            self.frames.pop_front();
            self.evicted += 1;
        }
        self.frames.push_back(frame);
    }

    /// Frames with `start_ms <= timestamp_ms <= end_ms`, oldest first.
    pub fn window(&self, start_ms: u64, end_ms: u64) -> Vec<Arc<FrameSnapshot>> {
        self.frames
            .iter()
            .filter(|f| f.timestamp_ms >= start_ms && f.timestamp_ms <= end_ms)
            .cloned()
            .collect()
    }

    pub fn latest(&self) -> Option<Arc<FrameSnapshot>> {
        self.frames.back().cloned()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_frames
    }

    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn memory_bytes(&self) -> usize {
        self.frames.iter().map(|f| f.byte_len()).sum()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

#[derive(Clone)]
pub struct SharedFrameBuffer {
    inner: Arc<Mutex<FrameBuffer>>,
}

impl SharedFrameBuffer {
    pub fn new(buffer: FrameBuffer) -> Self {
        Self {
            inner: Arc::new(Mutex::new(buffer)),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, FrameBuffer>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("frame buffer lock poisoned"))
    }

    pub fn push(&self, frame: Arc<FrameSnapshot>) -> Result<()> {
        self.lock()?.push(frame);
        Ok(())
    }

    /// Snapshot copy of a window. The lock is released before returning.
    pub fn window(&self, start_ms: u64, end_ms: u64) -> Result<Vec<Arc<FrameSnapshot>>> {
        Ok(self.lock()?.window(start_ms, end_ms))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    pub fn memory_bytes(&self) -> Result<usize> {
        Ok(self.lock()?.memory_bytes())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ObjectClass;

    fn frame(id: u64, ts: u64) -> Arc<FrameSnapshot> {
        Arc::new(FrameSnapshot::blank(id, ts, 8, 6))
    }

    #[test]
    fn rejects_mismatched_pixel_buffer() {
        assert!(FrameSnapshot::new(1, 0, 4, 4, vec![0u8; 10]).is_err());
        assert!(FrameSnapshot::new(1, 0, 4, 4, vec![0u8; 48]).is_ok());
    }

    #[test]
    fn evicts_by_capacity() {
        let mut buf = FrameBuffer::new(3, 60_000);
        for i in 0..5 {
            buf.push(frame(i, i * 100));
        }
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.evicted(), 2);
        assert_eq!(buf.window(0, u64::MAX)[0].frame_id, 2);
    }

    #[test]
    fn evicts_by_age() {
        let mut buf = FrameBuffer::new(100, 1_000);
        buf.push(frame(1, 0));
        buf.push(frame(2, 500));
        buf.push(frame(3, 1_600));
        let ids: Vec<u64> = buf.window(0, u64::MAX).iter().map(|f| f.frame_id).collect();
        assert_eq!(ids, vec![3]);
    }

    #[test]
    fn evicted_frame_survives_while_referenced() {
        let mut buf = FrameBuffer::new(1, 60_000);
        buf.push(frame(1, 0));
        let held = buf.window(0, 10);
        buf.push(frame(2, 100));
        assert_eq!(buf.len(), 1);
        assert_eq!(held[0].frame_id, 1);
        assert_eq!(held[0].pixels().len(), 8 * 6 * 3);
    }

    #[test]
    fn window_is_inclusive() {
        let mut buf = FrameBuffer::new(10, 60_000);
        for i in 0..5 {
            buf.push(frame(i, i * 100));
        }
        let ids: Vec<u64> = buf.window(100, 300).iter().map(|f| f.frame_id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn crop_clamps_to_frame() {
        let f = FrameSnapshot::blank(1, 0, 10, 10);
        let crop = f.crop(&BoundingBox::new(0.5, 0.5, 1.5, 1.5));
        assert_eq!((crop.width, crop.height), (5, 5));
        assert_eq!(crop.pixels.len(), 5 * 5 * 3);
        let dot = f.crop(&BoundingBox::new(0.2, 0.2, 0.2, 0.2));
        assert_eq!((dot.width, dot.height), (1, 1));
    }

    #[test]
    fn score_prefers_candidate_track() {
        let det = |conf: f32, track: u64| {
            Detection::new(ObjectClass::Car, BoundingBox::new(0.1, 0.1, 0.2, 0.2), conf, 1, 0)
                .with_track(track)
        };
        let f = FrameSnapshot::blank(1, 0, 4, 4).with_detections(vec![det(0.9, 1), det(0.6, 2)]);
        assert_eq!(f.score_for_track(2), 0.6);
        assert_eq!(f.score_for_track(7), 0.9);
    }

    #[test]
    fn shared_buffer_reports_len() {
        let shared = SharedFrameBuffer::new(FrameBuffer::new(4, 10_000));
        shared.push(frame(1, 0)).unwrap();
        shared.push(frame(2, 10)).unwrap();
        assert_eq!(shared.len().unwrap(), 2);
        assert_eq!(shared.memory_bytes().unwrap(), 2 * 8 * 6 * 3);
    }
}
