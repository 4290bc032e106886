use crate::detect::backend::ObjectTracker;
use crate::{BoundingBox, Detection, ObjectClass};

pub const DEFAULT_TRACK_IOU: f32 = 0.3;
pub const DEFAULT_MAX_MISSING_FRAMES: u32 = 5;

#[derive(Clone, Debug)]
struct Track {
    id: u64,
    bbox: BoundingBox,
    class: ObjectClass,
    missing_frames: u32,
}

/// Greedy IoU tracker.
///
/// Each frame, detections are matched to live tracks of the same class by
/// descending IoU; unmatched detections open new tracks and tracks missing
/// for more than `max_missing_frames` are dropped. Track ids start at 1 and
/// are never reused.
pub struct IouTracker {
    iou_threshold: f32,
    max_missing_frames: u32,
    tracks: Vec<Track>,
    next_id: u64,
}

impl IouTracker {
    pub fn new(iou_threshold: f32, max_missing_frames: u32) -> Self {
        Self {
            iou_threshold,
            max_missing_frames,
            tracks: Vec::new(),
            next_id: 1,
        }
    }

    pub fn active_tracks(&self) -> usize {
        self.tracks.iter().filter(|t| t.missing_frames == 0).count()
    }

    pub fn reset(&mut self) {
        self.tracks.clear();
    }

    fn open_track(&mut self, det: &Detection) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.tracks.push(Track {
            id,
            bbox: det.bbox,
            class: det.class,
            missing_frames: 0,
        });
        id
    }
}

impl Default for IouTracker {
    fn default() -> Self {
        Self::new(DEFAULT_TRACK_IOU, DEFAULT_MAX_MISSING_FRAMES)
    }
}

impl ObjectTracker for IouTracker {
    fn assign(&mut self, detections: Vec<Detection>) -> Vec<Detection> {
        let mut pairs: Vec<(usize, usize, f32)> = Vec::new();
        for (di, det) in detections.iter().enumerate() {
            for (ti, track) in self.tracks.iter().enumerate() {
                if track.class != det.class {
                    continue;
                }
                let iou = det.bbox.iou(&track.bbox);
                if iou >= self.iou_threshold {
                    pairs.push((ti, di, iou));
                }
            }
        }
        pairs.sort_by(|a, b| b.2.total_cmp(&a.2));

        let mut track_taken = vec![false; self.tracks.len()];
        let mut assigned: Vec<Option<u64>> = vec![None; detections.len()];
        for (ti, di, _) in pairs {
            if track_taken[ti] || assigned[di].is_some() {
                continue;
            }
            track_taken[ti] = true;
            let track = &mut self.tracks[ti];
            track.bbox = detections[di].bbox;
            track.missing_frames = 0;
            assigned[di] = Some(track.id);
        }

        for (ti, taken) in track_taken.iter().enumerate() {
            if !taken {
                self.tracks[ti].missing_frames += 1;
            }
        }
        let max_missing = self.max_missing_frames;
        self.tracks.retain(|t| t.missing_frames <= max_missing);

        detections
            .into_iter()
            .zip(assigned)
            .map(|(det, id)| {
                let id = match id {
                    Some(id) => id,
                    None => self.open_track(&det),
                };
                det.with_track(id)
            })
            .collect()
    }
}
