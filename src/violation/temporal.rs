use std::collections::{HashMap, VecDeque};

use crate::ViolationKind;

/// Upper bound on supporting frame ids remembered per key.
const MAX_SUPPORTING_FRAMES: usize = 64;

#[derive(Clone, Debug, Default)]
struct TrackState {
    hits: u32,
    last_seen_frame: u64,
    frames: VecDeque<u64>,
}

/// Consecutive-frame counter per `(kind, track)`.
///
/// A condition that holds increments the counter; one that does not resets
/// it to zero. Entries are created on the first hit and evicted once their
/// track has gone `max_idle_frames` frames without any update.
pub struct TemporalTracker {
    entries: HashMap<(ViolationKind, u64), TrackState>,
    max_idle_frames: u64,
    current_frame: u64,
}

impl TemporalTracker {
    pub fn new(max_idle_frames: u64) -> Self {
        Self {
            entries: HashMap::new(),
            max_idle_frames,
            current_frame: 0,
        }
    }

    /// Start a new frame: remember its id and drop keys idle for too long.
    pub fn advance(&mut self, frame_id: u64) {
        self.current_frame = frame_id;
        let idle = self.max_idle_frames;
        self.entries
            .retain(|_, state| frame_id.saturating_sub(state.last_seen_frame) <= idle);
    }

    /// Record whether the condition held this frame. Returns true on every
    /// hit from the `min_frames`th consecutive one onwards (a value of 0 is
    /// treated as 1). The engine's cooldown limits how often a long streak
    /// emits.
    pub fn update(
        &mut self,
        kind: ViolationKind,
        track_id: u64,
        condition_met: bool,
        min_frames: u32,
    ) -> bool {
        let frame = self.current_frame;
        if !condition_met {
            if let Some(state) = self.entries.get_mut(&(kind, track_id)) {
                state.hits = 0;
                state.frames.clear();
                state.last_seen_frame = frame;
            }
            return false;
        }
        let state = self.entries.entry((kind, track_id)).or_default();
        state.hits = state.hits.saturating_add(1);
        state.last_seen_frame = frame;
        if state.frames.len() == MAX_SUPPORTING_FRAMES {
            state.frames.pop_front();
        }
        state.frames.push_back(frame);
        state.hits >= min_frames.max(1)
    }

    pub fn count(&self, kind: ViolationKind, track_id: u64) -> u32 {
        self.entries
            .get(&(kind, track_id))
            .map(|s| s.hits)
            .unwrap_or(0)
    }

    /// Frame ids of the current run of hits, oldest first.
    pub fn supporting_frames(&self, kind: ViolationKind, track_id: u64) -> Vec<u64> {
        self.entries
            .get(&(kind, track_id))
            .map(|s| s.frames.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn reset_all(&mut self) {
        self.entries.clear();
    }
}

impl Default for TemporalTracker {
    fn default() -> Self {
        Self::new(30)
    }
}
