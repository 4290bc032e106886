use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

use crate::frame::FrameSnapshot;
use crate::plate::process_plate;
use crate::violation::confidence::{ConfidenceAggregator, Signals};
use crate::violation::rules::{self, RuleContext, RuleSet, EGO_TRACK_ID};
use crate::violation::temporal::TemporalTracker;
use crate::{ActionTier, CandidateStatus, GpsFix, ViolationCandidate, ViolationKind};

const ROLLING_WINDOW_MS: u64 = 3_600_000;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Frames are skipped while GPS speed is below this.
    pub speed_gate_kmh: f64,
    /// Skip frames that carry no usable GPS fix. Off by default, so a camera
    /// without GPS still runs the vision rules.
    pub require_gps: bool,
    /// Rolling one-hour emission cap across all kinds.
    pub max_reports_per_hour: u32,
    /// Temporal keys unseen for this many frames are evicted.
    pub track_idle_frames: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            speed_gate_kmh: 5.0,
            require_gps: false,
            max_reports_per_hour: 20,
            track_idle_frames: 30,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineStats {
    pub frames_seen: u64,
    pub frames_gated: u64,
    pub nominations: u64,
    pub confirmed: u64,
    pub discarded: u64,
    pub suppressed_cooldown: u64,
    pub suppressed_rate_limit: u64,
    pub emitted: u64,
}

/// Per-frame violation state machine:
/// gate → rules → temporal → aggregate → cooldown / rate limit → emit.
///
/// Cooldown and the hourly cap run on frame timestamps, so replayed or
/// simulated footage behaves the same as live capture.
pub struct RuleEngine {
    rules: RuleSet,
    settings: EngineSettings,
    tracker: TemporalTracker,
    aggregator: ConfidenceAggregator,
    last_emitted_ms: HashMap<ViolationKind, u64>,
    emissions: VecDeque<u64>,
    stats: EngineStats,
}

impl RuleEngine {
    pub fn new(rules: RuleSet, settings: EngineSettings, aggregator: ConfidenceAggregator) -> Self {
        let tracker = TemporalTracker::new(settings.track_idle_frames);
        Self {
            rules,
            settings,
            tracker,
            aggregator,
            last_emitted_ms: HashMap::new(),
            emissions: VecDeque::new(),
            stats: EngineStats::default(),
        }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub fn reset(&mut self) {
        self.tracker.reset_all();
        self.last_emitted_ms.clear();
        self.emissions.clear();
    }

    fn gate_open(&self, frame: &FrameSnapshot) -> bool {
        match frame.gps {
            Some(gps) if gps.has_fix() => gps.speed_kmh >= self.settings.speed_gate_kmh,
            _ => !self.settings.require_gps,
        }
    }

    fn cooldown_elapsed(&self, kind: ViolationKind, now_ms: u64, cooldown_secs: u64) -> bool {
        match self.last_emitted_ms.get(&kind) {
            Some(last) => now_ms.saturating_sub(*last) >= cooldown_secs.saturating_mul(1000),
            None => true,
        }
    }

    fn rate_limit_allows(&mut self, now_ms: u64) -> bool {
        while let Some(oldest) = self.emissions.front() {
            if now_ms.saturating_sub(*oldest) >= ROLLING_WINDOW_MS {
                self.emissions.pop_front();
            } else {
                break;
            }
        }
        self.emissions.len() < self.settings.max_reports_per_hour as usize
    }

    fn record_emission(&mut self, kind: ViolationKind, now_ms: u64) {
        self.last_emitted_ms.insert(kind, now_ms);
        self.emissions.push_back(now_ms);
    }

    /// Run every enabled rule over one frame. Frames must arrive in order.
    pub fn process_frame(
        &mut self,
        frame: &FrameSnapshot,
        ctx: &RuleContext,
    ) -> Vec<ViolationCandidate> {
        self.stats.frames_seen += 1;
        self.tracker.advance(frame.frame_id);
        if !self.gate_open(frame) {
            self.stats.frames_gated += 1;
            debug!("frame {} gated (speed / gps precondition)", frame.frame_id);
            return Vec::new();
        }

        let now_ms = frame.timestamp_ms;
        let mut present: HashSet<u64> = frame.detections.iter().filter_map(|d| d.track_id).collect();
        present.insert(EGO_TRACK_ID);

        let mut candidates = Vec::new();
        for kind in ViolationKind::ALL {
            let settings = self.rules.settings(kind).clone();
            if !settings.enabled {
                continue;
            }
            let min_frames = settings.min_consecutive_frames.max(1);
            let mut nominated: HashSet<u64> = HashSet::new();

            for nom in rules::evaluate(kind, frame, ctx, &self.rules) {
                if !(nom.confidence >= settings.confidence_threshold) {
                    continue;
                }
                nominated.insert(nom.track_id);
                self.stats.nominations += 1;
                if !self.tracker.update(kind, nom.track_id, true, min_frames) {
                    continue;
                }
                self.stats.confirmed += 1;

                let count = self.tracker.count(kind, nom.track_id);
                let plate = ctx
                    .plates
                    .get(&nom.track_id)
                    .map(|read| (process_plate(&read.text), read.confidence))
                    .filter(|(p, conf)| p.valid && conf.is_finite());
                let signals = Signals::default()
                    .detection(nom.detection_confidence)
                    .classification(nom.classification_confidence)
                    .temporal(count, min_frames)
                    .ocr(plate.as_ref().map(|(_, conf)| *conf));
                let score = self.aggregator.combine(&signals);
                let tier = self.aggregator.route(score);
                if tier == ActionTier::Discard {
                    self.stats.discarded += 1;
                    debug!(
                        "{} track {} scored {:.3}, below discard floor",
                        kind, nom.track_id, score
                    );
                    continue;
                }
                if !self.cooldown_elapsed(kind, now_ms, settings.cooldown_secs) {
                    self.stats.suppressed_cooldown += 1;
                    debug!("{} track {} suppressed by cooldown", kind, nom.track_id);
                    continue;
                }
                if !self.rate_limit_allows(now_ms) {
                    self.stats.suppressed_rate_limit += 1;
                    info!(
                        "{} track {} suppressed: hourly cap of {} reached",
                        kind, nom.track_id, self.settings.max_reports_per_hour
                    );
                    continue;
                }
                self.record_emission(kind, now_ms);
                self.stats.emitted += 1;

                let (plate_text, plate_confidence) = match plate {
                    Some((p, conf)) => (Some(p.text), Some(conf)),
                    None => (None, None),
                };
                info!(
                    "violation candidate: {} track {} score {:.3} tier {}",
                    kind,
                    nom.track_id,
                    score,
                    tier.as_str()
                );
                candidates.push(ViolationCandidate {
                    kind,
                    confidence: score,
                    tier,
                    track_id: nom.track_id,
                    supporting_frames: self.tracker.supporting_frames(kind, nom.track_id),
                    plate_text,
                    plate_confidence,
                    gps: frame.gps.and_then(GpsFix::sanitized),
                    created_at_ms: now_ms,
                    consecutive_frames: count,
                    status: CandidateStatus::Emitted,
                });
            }

            for track_id in present.iter().filter(|t| !nominated.contains(*t)) {
                self.tracker.update(kind, *track_id, false, min_frames);
            }
        }
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::PlateRead;
    use crate::violation::confidence::{SignalWeights, TierThresholds};
    use crate::violation::rules::HelmetObservation;
    use crate::{BoundingBox, Detection, GpsFix, ObjectClass, SignalState};

    fn engine(rules: RuleSet, settings: EngineSettings) -> RuleEngine {
        RuleEngine::new(rules, settings, ConfidenceAggregator::default())
    }

    fn moving(speed: f64) -> Option<GpsFix> {
        Some(GpsFix {
            latitude: 12.97,
            longitude: 77.59,
            heading_deg: Some(90.0),
            speed_kmh: speed,
            fix_quality: 1,
        })
    }

    fn red_light_frame(id: u64, ts: u64, conf: f32) -> FrameSnapshot {
        FrameSnapshot::blank(id, ts, 4, 4)
            .with_detections(vec![Detection::new(
                ObjectClass::Car,
                BoundingBox::new(0.3, 0.6, 0.5, 0.9),
                conf,
                id,
                ts,
            )
            .with_track(3)])
            .with_gps(moving(30.0))
    }

    fn red() -> RuleContext {
        RuleContext {
            signal_state: SignalState::Red,
            ..RuleContext::default()
        }
    }

    #[test]
    fn emits_once_threshold_reached() {
        let mut e = engine(RuleSet::default(), EngineSettings::default());
        let ctx = red();
        assert!(e.process_frame(&red_light_frame(1, 0, 0.9), &ctx).is_empty());
        assert!(e.process_frame(&red_light_frame(2, 100, 0.9), &ctx).is_empty());
        let out = e.process_frame(&red_light_frame(3, 200, 0.9), &ctx);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].kind, ViolationKind::RedLightJump);
        assert_eq!(out[0].track_id, 3);
        assert_eq!(out[0].supporting_frames, vec![1, 2, 3]);
        assert_eq!(out[0].consecutive_frames, 3);
        assert_eq!(out[0].tier, ActionTier::Verify);
    }

    #[test]
    fn low_speed_gates_frame() {
        let mut e = engine(RuleSet::default(), EngineSettings::default());
        let ctx = red();
        for i in 1..=5 {
            let f = red_light_frame(i, i * 100, 0.9).with_gps(moving(2.0));
            assert!(e.process_frame(&f, &ctx).is_empty());
        }
        assert_eq!(e.stats().frames_gated, 5);
    }

    #[test]
    fn missing_gps_gates_only_when_required() {
        let settings = EngineSettings {
            require_gps: true,
            ..EngineSettings::default()
        };
        let mut e = engine(RuleSet::default(), settings);
        let f = red_light_frame(1, 0, 0.9).with_gps(None);
        e.process_frame(&f, &red());
        assert_eq!(e.stats().frames_gated, 1);

        let mut open = engine(RuleSet::default(), EngineSettings::default());
        open.process_frame(&f, &red());
        assert_eq!(open.stats().frames_gated, 0);
    }

    #[test]
    fn below_threshold_nomination_breaks_the_run() {
        let mut e = engine(RuleSet::default(), EngineSettings::default());
        let ctx = red();
        let confs = [0.9, 0.9, 0.5, 0.9, 0.9];
        let emitted: usize = confs
            .iter()
            .enumerate()
            .map(|(i, c)| {
                e.process_frame(&red_light_frame(i as u64 + 1, i as u64 * 100, *c), &ctx)
                    .len()
            })
            .sum();
        assert_eq!(emitted, 0);
    }

    #[test]
    fn cooldown_suppresses_renomination() {
        let mut rules = RuleSet::default();
        rules.red_light_jump.min_consecutive_frames = 1;
        let mut e = engine(rules, EngineSettings::default());
        let ctx = red();
        assert_eq!(e.process_frame(&red_light_frame(1, 0, 0.9), &ctx).len(), 1);
        assert!(e.process_frame(&red_light_frame(2, 29_999, 0.9), &ctx).is_empty());
        assert_eq!(e.process_frame(&red_light_frame(3, 30_000, 0.9), &ctx).len(), 1);
        assert_eq!(e.stats().suppressed_cooldown, 1);
    }

    #[test]
    fn hourly_cap_rolls_over() {
        let mut rules = RuleSet::default();
        rules.red_light_jump.min_consecutive_frames = 1;
        rules.red_light_jump.cooldown_secs = 0;
        let settings = EngineSettings {
            max_reports_per_hour: 2,
            ..EngineSettings::default()
        };
        let mut e = engine(rules, settings);
        let ctx = red();
        assert_eq!(e.process_frame(&red_light_frame(1, 0, 0.9), &ctx).len(), 1);
        assert_eq!(e.process_frame(&red_light_frame(2, 1_000, 0.9), &ctx).len(), 1);
        assert!(e.process_frame(&red_light_frame(3, 2_000, 0.9), &ctx).is_empty());
        assert_eq!(e.stats().suppressed_rate_limit, 1);
        let later = e.process_frame(&red_light_frame(4, ROLLING_WINDOW_MS, 0.9), &ctx);
        assert_eq!(later.len(), 1);
    }

    #[test]
    fn disabled_rule_contributes_nothing() {
        let mut rules = RuleSet::default();
        rules.red_light_jump.enabled = false;
        rules.red_light_jump.min_consecutive_frames = 1;
        let mut e = engine(rules, EngineSettings::default());
        assert!(e.process_frame(&red_light_frame(1, 0, 0.99), &red()).is_empty());
        assert_eq!(e.stats().nominations, 0);
    }

    #[test]
    fn valid_plate_feeds_ocr_signal_and_candidate() {
        let mut rules = RuleSet::default();
        rules.red_light_jump.min_consecutive_frames = 1;
        let mut e = engine(rules, EngineSettings::default());
        let mut ctx = red();
        ctx.plates.insert(
            3,
            PlateRead {
                text: "mh 12 ab 1234".to_string(),
                confidence: 0.9,
            },
        );
        let out = e.process_frame(&red_light_frame(1, 0, 0.9), &ctx);
        assert_eq!(out[0].plate_text.as_deref(), Some("MH12AB1234"));
        assert_eq!(out[0].plate_confidence, Some(0.9));
    }

    #[test]
    fn weak_scores_are_discarded() {
        let mut rules = RuleSet::default();
        rules.no_helmet.min_consecutive_frames = 1;
        rules.no_helmet.confidence_threshold = 0.1;
        let aggregator = ConfidenceAggregator::new(
            SignalWeights::default(),
            TierThresholds {
                report_directly: 0.99,
                discard_below: 0.9,
            },
        );
        let mut e = RuleEngine::new(rules, EngineSettings::default(), aggregator);
        let f = FrameSnapshot::blank(1, 0, 4, 4).with_detections(vec![
            Detection::new(ObjectClass::Motorcycle, BoundingBox::new(0.3, 0.5, 0.5, 0.9), 0.5, 1, 0)
                .with_track(8),
            Detection::new(ObjectClass::Person, BoundingBox::new(0.32, 0.3, 0.48, 0.7), 0.5, 1, 0)
                .with_track(7),
        ]);
        let mut ctx = RuleContext::default();
        ctx.helmets.insert(
            7,
            HelmetObservation {
                has_helmet: false,
                confidence: 0.5,
            },
        );
        assert!(e.process_frame(&f, &ctx).is_empty());
        assert_eq!(e.stats().discarded, 1);
    }
}
