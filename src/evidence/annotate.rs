use anyhow::{anyhow, Result};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use crate::frame::{pixel_rect, FrameSnapshot};
use crate::ViolationCandidate;

const HIGHLIGHT: [u8; 3] = [220, 20, 20];
const CONTEXT: [u8; 3] = [20, 200, 20];
const BOX_THICKNESS: u32 = 2;
const CAPTION_BAR_PX: u32 = 40;

/// One-line caption for the packet. Kept in metadata and shown under the
/// frames by report renderers.
pub fn caption(candidate: &ViolationCandidate) -> String {
    let mut parts = vec![
        format!("TYPE: {}", candidate.kind.as_str()),
        format!("CONF: {:.2}", candidate.confidence),
    ];
    if let Some(gps) = candidate.gps {
        parts.push(format!("GPS: {:.4},{:.4}", gps.latitude, gps.longitude));
    }
    if let Some(plate) = &candidate.plate_text {
        parts.push(format!("PLATE: {}", plate));
    }
    parts.join(" | ")
}

/// Copy the frame pixels and draw detection boxes plus a caption bar.
/// The candidate's track is highlighted; other detections get a context colour.
pub fn annotate(frame: &FrameSnapshot, track_id: u64) -> Vec<u8> {
    let mut pixels = frame.pixels().to_vec();
    let (w, h) = (frame.width, frame.height);
    for det in &frame.detections {
        if !det.bbox.is_finite() {
            continue;
        }
        let color = if det.track_id == Some(track_id) {
            HIGHLIGHT
        } else {
            CONTEXT
        };
        let (x0, y0, x1, y1) = pixel_rect(&det.bbox, w, h);
        draw_rect(&mut pixels, w, (x0, y0, x1, y1), color);
    }
    let bar = CAPTION_BAR_PX.min(h / 4);
    fill_rect(&mut pixels, w, (0, h - bar, w, h), [0, 0, 0]);
    pixels
}

fn put(pixels: &mut [u8], width: u32, x: u32, y: u32, color: [u8; 3]) {
    let idx = (y as usize * width as usize + x as usize) * 3;
    if let Some(px) = pixels.get_mut(idx..idx + 3) {
        px.copy_from_slice(&color);
    }
}

fn fill_rect(pixels: &mut [u8], width: u32, rect: (u32, u32, u32, u32), color: [u8; 3]) {
    let (x0, y0, x1, y1) = rect;
    for y in y0..y1 {
        for x in x0..x1 {
            put(pixels, width, x, y, color);
        }
    }
}

fn draw_rect(pixels: &mut [u8], width: u32, rect: (u32, u32, u32, u32), color: [u8; 3]) {
    let (x0, y0, x1, y1) = rect;
    let t = BOX_THICKNESS;
    fill_rect(pixels, width, (x0, y0, x1, (y0 + t).min(y1)), color);
    fill_rect(pixels, width, (x0, y1.saturating_sub(t).max(y0), x1, y1), color);
    fill_rect(pixels, width, (x0, y0, (x0 + t).min(x1), y1), color);
    fill_rect(pixels, width, (x1.saturating_sub(t).max(x0), y0, x1, y1), color);
}

pub fn encode_jpeg(pixels: &[u8], width: u32, height: u32, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
        .encode(pixels, width, height, ExtendedColorType::Rgb8)
        .map_err(|e| anyhow!("jpeg encode failed: {}", e))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::GenericImageView;
    use crate::{BoundingBox, CandidateStatus, Detection, ObjectClass, ViolationKind};

    #[test]
    fn highlights_candidate_track() {
        let frame = FrameSnapshot::blank(1, 0, 100, 100).with_detections(vec![
            Detection::new(ObjectClass::Car, BoundingBox::new(0.1, 0.1, 0.3, 0.3), 0.9, 1, 0)
                .with_track(5),
            Detection::new(ObjectClass::Bus, BoundingBox::new(0.5, 0.1, 0.7, 0.3), 0.9, 1, 0)
                .with_track(6),
        ]);
        let out = annotate(&frame, 5);
        let at = |x: usize, y: usize| &out[(y * 100 + x) * 3..(y * 100 + x) * 3 + 3];
        assert_eq!(at(10, 10), &HIGHLIGHT);
        assert_eq!(at(50, 10), &CONTEXT);
        assert_eq!(at(20, 20), &[96, 96, 96]);
        assert_eq!(at(50, 99), &[0, 0, 0]);
        assert_eq!(frame.pixels()[0], 96);
    }

    #[test]
    fn encodes_decodable_jpeg() {
        let frame = FrameSnapshot::blank(1, 0, 32, 24);
        let bytes = encode_jpeg(frame.pixels(), 32, 24, 95).unwrap();
        assert_eq!(&bytes[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 24));
    }

    #[test]
    fn caption_lists_plate_and_gps() {
        let candidate = ViolationCandidate {
            kind: ViolationKind::NoHelmet,
            confidence: 0.912,
            tier: crate::ActionTier::Verify,
            track_id: 7,
            supporting_frames: vec![1],
            plate_text: Some("MH12AB1234".into()),
            plate_confidence: Some(0.9),
            gps: None,
            created_at_ms: 0,
            consecutive_frames: 3,
            status: CandidateStatus::Emitted,
        };
        assert_eq!(
            caption(&candidate),
            "TYPE: no_helmet | CONF: 0.91 | PLATE: MH12AB1234"
        );
    }
}
