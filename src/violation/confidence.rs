use serde::{Deserialize, Serialize};

use crate::ActionTier;

/// Relative weights of the evidence signals. They need not sum to 1; only
/// the weights of signals actually present are used.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalWeights {
    pub detection: f32,
    pub classification: f32,
    pub temporal: f32,
    pub ocr: f32,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            detection: 0.30,
            classification: 0.30,
            temporal: 0.20,
            ocr: 0.20,
        }
    }
}

impl SignalWeights {
    pub fn is_valid(&self) -> bool {
        let all = [self.detection, self.classification, self.temporal, self.ocr];
        all.iter().all(|w| w.is_finite() && *w >= 0.0) && all.iter().sum::<f32>() > 0.0
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierThresholds {
    /// Scores at or above this are reported without remote verification.
    pub report_directly: f32,
    /// Scores below this are discarded.
    pub discard_below: f32,
}

impl Default for TierThresholds {
    fn default() -> Self {
        Self {
            report_directly: 0.96,
            discard_below: 0.70,
        }
    }
}

impl TierThresholds {
    pub fn is_valid(&self) -> bool {
        (0.0..=1.0).contains(&self.discard_below)
            && (0.0..=1.0).contains(&self.report_directly)
            && self.discard_below <= self.report_directly
    }
}

/// Per-candidate signal values. Absent signals are left out of the weighted
/// mean rather than counted as zero.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Signals {
    pub detection: Option<f32>,
    pub classification: Option<f32>,
    pub temporal: Option<f32>,
    pub ocr: Option<f32>,
}

impl Signals {
    pub fn detection(mut self, v: f32) -> Self {
        self.detection = Some(v);
        self
    }

    pub fn classification(mut self, v: Option<f32>) -> Self {
        self.classification = v;
        self
    }

    /// Ratio of consecutive frames seen to frames required, capped at 1.
    pub fn temporal(mut self, count: u32, required: u32) -> Self {
        let required = required.max(1) as f32;
        self.temporal = Some((count as f32 / required).min(1.0));
        self
    }

    pub fn ocr(mut self, v: Option<f32>) -> Self {
        self.ocr = v;
        self
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConfidenceAggregator {
    weights: SignalWeights,
    thresholds: TierThresholds,
}

impl ConfidenceAggregator {
    pub fn new(weights: SignalWeights, thresholds: TierThresholds) -> Self {
        Self {
            weights,
            thresholds,
        }
    }

    pub fn thresholds(&self) -> &TierThresholds {
        &self.thresholds
    }

    /// Weighted mean over present signals, each clamped to [0, 1]. Missing
    /// signals hand their weight to the others in proportion. Non-finite
    /// values count as missing. No signals at all scores 0.
    pub fn combine(&self, signals: &Signals) -> f32 {
        let pairs = [
            (signals.detection, self.weights.detection),
            (signals.classification, self.weights.classification),
            (signals.temporal, self.weights.temporal),
            (signals.ocr, self.weights.ocr),
        ];
        let mut weighted = 0.0f32;
        let mut total = 0.0f32;
        for (value, weight) in pairs {
            let Some(value) = value.filter(|v| v.is_finite()) else {
                continue;
            };
            weighted += value.clamp(0.0, 1.0) * weight;
            total += weight;
        }
        if total <= 0.0 {
            return 0.0;
        }
        (weighted / total).clamp(0.0, 1.0)
    }

    pub fn route(&self, score: f32) -> ActionTier {
        if score >= self.thresholds.report_directly {
            ActionTier::ReportDirectly
        } else if score >= self.thresholds.discard_below {
            ActionTier::Verify
        } else {
            ActionTier::Discard
        }
    }
}
