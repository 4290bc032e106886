use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::detect::PlateRead;
use crate::frame::FrameSnapshot;
use crate::{BoundingBox, Detection, ObjectClass, SignalState, ViolationKind};

/// Track id used for rules that judge the camera vehicle itself.
/// Tracker-assigned ids start at 1.
pub const EGO_TRACK_ID: u64 = 0;

// -------------------- Settings --------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSettings {
    pub enabled: bool,
    pub min_consecutive_frames: u32,
    /// Nominations below this raw confidence are treated as "condition not met".
    pub confidence_threshold: f32,
    pub cooldown_secs: u64,
}

impl Default for RuleSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            min_consecutive_frames: 3,
            confidence_threshold: 0.7,
            cooldown_secs: 30,
        }
    }
}

impl RuleSettings {
    fn problems(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.min_consecutive_frames == 0 {
            out.push("min_consecutive_frames must be >= 1".to_string());
        }
        if !(self.confidence_threshold.is_finite()
            && (0.0..=1.0).contains(&self.confidence_threshold))
        {
            out.push(format!(
                "confidence_threshold {} is outside 0..=1",
                self.confidence_threshold
            ));
        }
        out
    }
}

/// Per-kind rule settings plus the geometric parameters the rules use.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSet {
    pub no_helmet: RuleSettings,
    pub red_light_jump: RuleSettings,
    pub wrong_side: RuleSettings,
    /// Minimum rider/person IoU to pair them (the position heuristic also pairs).
    pub rider_overlap_threshold: f32,
    /// Normalized y a vehicle centre must pass while the signal is red.
    pub stop_line_y: f32,
    /// Heading deviation from road bearing, in degrees, that counts as wrong side.
    pub heading_deviation_deg: f64,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self {
            no_helmet: RuleSettings::default(),
            red_light_jump: RuleSettings::default(),
            wrong_side: RuleSettings::default(),
            rider_overlap_threshold: 0.3,
            stop_line_y: 0.5,
            heading_deviation_deg: 120.0,
        }
    }
}

impl RuleSet {
    pub fn settings(&self, kind: ViolationKind) -> &RuleSettings {
        match kind {
            ViolationKind::NoHelmet => &self.no_helmet,
            ViolationKind::RedLightJump => &self.red_light_jump,
            ViolationKind::WrongSide => &self.wrong_side,
        }
    }

    pub fn settings_mut(&mut self, kind: ViolationKind) -> &mut RuleSettings {
        match kind {
            ViolationKind::NoHelmet => &mut self.no_helmet,
            ViolationKind::RedLightJump => &mut self.red_light_jump,
            ViolationKind::WrongSide => &mut self.wrong_side,
        }
    }

    /// Disable any rule whose settings are unusable. Returns one warning per
    /// disabled rule; the remaining rules keep running.
    pub fn disable_invalid(&mut self) -> Vec<String> {
        let mut warnings = Vec::new();
        for kind in ViolationKind::ALL {
            let mut problems = self.settings(kind).problems();
            match kind {
                ViolationKind::NoHelmet
                    if !(0.0..=1.0).contains(&self.rider_overlap_threshold) =>
                {
                    problems.push("rider_overlap_threshold is outside 0..=1".to_string());
                }
                ViolationKind::RedLightJump if !(0.0..=1.0).contains(&self.stop_line_y) => {
                    problems.push("stop_line_y is outside 0..=1".to_string());
                }
                ViolationKind::WrongSide
                    if !(self.heading_deviation_deg > 0.0
                        && self.heading_deviation_deg <= 180.0) =>
                {
                    problems.push("heading_deviation_deg must be in (0, 180]".to_string());
                }
                _ => {}
            }
            let settings = self.settings_mut(kind);
            if settings.enabled && !problems.is_empty() {
                settings.enabled = false;
                warnings.push(format!("rule {} disabled: {}", kind, problems.join("; ")));
            }
        }
        warnings
    }
}

// -------------------- Context --------------------

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct HelmetObservation {
    pub has_helmet: bool,
    pub confidence: f32,
}

/// Per-frame facts supplied by collaborators outside the detector.
#[derive(Clone, Debug, Default)]
pub struct RuleContext {
    pub signal_state: SignalState,
    /// Helmet classification keyed by person track id.
    pub helmets: HashMap<u64, HelmetObservation>,
    /// Expected direction of travel for the current road segment.
    pub road_bearing_deg: Option<f64>,
    /// Plate reads keyed by track id.
    pub plates: HashMap<u64, PlateRead>,
}

/// A rule's claim that `track_id` satisfies its condition this frame.
#[derive(Clone, Debug, PartialEq)]
pub struct Nomination {
    pub track_id: u64,
    /// Raw confidence compared against the rule threshold.
    pub confidence: f32,
    pub detection_confidence: f32,
    pub classification_confidence: Option<f32>,
}

fn unit(v: f32) -> bool {
    v.is_finite() && (0.0..=1.0).contains(&v)
}

// -------------------- Evaluators --------------------

/// Run one rule over one frame. Pure; malformed inputs yield no nominations.
pub fn evaluate(
    kind: ViolationKind,
    frame: &FrameSnapshot,
    ctx: &RuleContext,
    rules: &RuleSet,
) -> Vec<Nomination> {
    match kind {
        ViolationKind::NoHelmet => no_helmet(&frame.detections, ctx, rules.rider_overlap_threshold),
        ViolationKind::RedLightJump => red_light_jump(&frame.detections, ctx, rules.stop_line_y),
        ViolationKind::WrongSide => wrong_side(frame, ctx, rules.heading_deviation_deg),
    }
}

/// Person box sits on the rider box: horizontal overlap, person's feet at or
/// below the rider's top, and person's head above the rider's bottom.
fn person_on_rider(person: &BoundingBox, rider: &BoundingBox) -> bool {
    rider.width() > 0.0
        && person.horizontal_overlap(rider) > 0.0
        && person.y2 >= rider.y1
        && person.y1 < rider.y2
}

fn no_helmet(detections: &[Detection], ctx: &RuleContext, overlap: f32) -> Vec<Nomination> {
    let usable = |d: &&Detection| d.has_valid_confidence() && d.bbox.is_finite();
    let riders: Vec<&Detection> = detections
        .iter()
        .filter(|d| d.class == ObjectClass::Motorcycle)
        .filter(usable)
        .collect();
    let mut best: BTreeMap<u64, Nomination> = BTreeMap::new();
    for person in detections
        .iter()
        .filter(|d| d.class == ObjectClass::Person)
        .filter(usable)
    {
        let Some(track_id) = person.track_id else {
            continue;
        };
        let Some(helmet) = ctx.helmets.get(&track_id) else {
            continue;
        };
        if helmet.has_helmet || !unit(helmet.confidence) {
            continue;
        }
        for rider in &riders {
            if person.bbox.iou(&rider.bbox) < overlap && !person_on_rider(&person.bbox, &rider.bbox)
            {
                continue;
            }
            let detection_confidence = rider.confidence.min(person.confidence);
            let nomination = Nomination {
                track_id,
                confidence: detection_confidence.min(helmet.confidence),
                detection_confidence,
                classification_confidence: Some(helmet.confidence),
            };
            let keep = best
                .get(&track_id)
                .map_or(true, |prev| nomination.confidence > prev.confidence);
            if keep {
                best.insert(track_id, nomination);
            }
        }
    }
    best.into_values().collect()
}

fn red_light_jump(detections: &[Detection], ctx: &RuleContext, stop_line_y: f32) -> Vec<Nomination> {
    if ctx.signal_state != SignalState::Red {
        return Vec::new();
    }
    detections
        .iter()
        .filter(|d| d.class.is_vehicle() && d.has_valid_confidence() && d.bbox.is_finite())
        .filter(|d| d.bbox.center().1 > stop_line_y)
        .filter_map(|d| {
            Some(Nomination {
                track_id: d.track_id?,
                confidence: d.confidence,
                detection_confidence: d.confidence,
                classification_confidence: None,
            })
        })
        .collect()
}

/// Shortest signed difference between two bearings, in (-180, 180].
pub fn angle_diff(a: f64, b: f64) -> f64 {
    (a - b + 180.0).rem_euclid(360.0) - 180.0
}

fn wrong_side(frame: &FrameSnapshot, ctx: &RuleContext, threshold: f64) -> Vec<Nomination> {
    let (Some(gps), Some(bearing)) = (frame.gps, ctx.road_bearing_deg) else {
        return Vec::new();
    };
    let Some(heading) = gps.heading_deg.filter(|h| h.is_finite()) else {
        return Vec::new();
    };
    if !gps.has_fix() || !bearing.is_finite() {
        return Vec::new();
    }
    let deviation = angle_diff(heading, bearing).abs();
    if deviation <= threshold {
        return Vec::new();
    }
    let confidence = (deviation / 180.0).min(1.0) as f32;
    vec![Nomination {
        track_id: EGO_TRACK_ID,
        confidence,
        detection_confidence: confidence,
        classification_confidence: None,
    }]
}
