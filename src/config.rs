use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::evidence::EvidenceSettings;
use crate::governor::GovernorConfig;
use crate::violation::{EngineSettings, RuleSet, SignalWeights, TierThresholds};
use crate::worker::WorkerSettings;

const DEFAULT_DB_PATH: &str = "traffic_witness.db";
const DEFAULT_SOURCE: &str = "stub://front_camera";
const DEFAULT_OUTBOX_DIR: &str = "outbox";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    /// `stub://...` or an `http(s)://` JPEG snapshot URL.
    pub source: String,
    pub fps: u32,
    pub width: u32,
    pub height: u32,
    /// Seconds of processed frames kept for evidence.
    pub buffer_secs: u64,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            source: DEFAULT_SOURCE.to_string(),
            fps: 30,
            width: 640,
            height: 480,
            buffer_secs: 10,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorSettings {
    /// `stub` or `scripted`; empty selects the registry default.
    pub backend: String,
    /// Detection script for the `scripted` backend.
    pub script_path: Option<PathBuf>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorSettings {
    pub weights: SignalWeights,
    pub thresholds: TierThresholds,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Verification endpoint; without one, verification items wait.
    pub verify_url: Option<String>,
    /// Delivery endpoint; without one, reports are spooled to `outbox_dir`.
    pub delivery_url: Option<String>,
    #[serde(skip_serializing)]
    pub api_token: Option<String>,
    pub outbox_dir: PathBuf,
    /// `host:port` probed before network work; unset means always online.
    pub connectivity_probe: Option<String>,
    pub probe_timeout_secs: u64,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            verify_url: None,
            delivery_url: None,
            api_token: None,
            outbox_dir: PathBuf::from(DEFAULT_OUTBOX_DIR),
            connectivity_probe: None,
            probe_timeout_secs: 3,
        }
    }
}

impl ServiceSettings {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.max(1))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficWitnessConfig {
    pub db_path: String,
    pub device_name: Option<String>,
    /// Seed for the Ed25519 manifest key; unset leaves manifests unsigned.
    #[serde(skip_serializing)]
    pub device_key_seed: Option<String>,
    /// Expected direction of travel for the wrong-side rule.
    pub road_bearing_deg: Option<f64>,
    pub camera: CameraSettings,
    pub detector: DetectorSettings,
    pub engine: EngineSettings,
    pub rules: RuleSet,
    pub aggregator: AggregatorSettings,
    pub evidence: EvidenceSettings,
    pub workers: WorkerSettings,
    pub services: ServiceSettings,
    pub governor: GovernorConfig,
}

impl Default for TrafficWitnessConfig {
    fn default() -> Self {
        Self {
            db_path: DEFAULT_DB_PATH.to_string(),
            device_name: None,
            device_key_seed: None,
            road_bearing_deg: None,
            camera: CameraSettings::default(),
            detector: DetectorSettings::default(),
            engine: EngineSettings::default(),
            rules: RuleSet::default(),
            aggregator: AggregatorSettings::default(),
            evidence: EvidenceSettings::default(),
            workers: WorkerSettings::default(),
            services: ServiceSettings::default(),
            governor: GovernorConfig::default(),
        }
    }
}

impl TrafficWitnessConfig {
    /// Read `TRAFFIC_WITNESS_CONFIG` (if set), apply environment overrides
    /// and validate. Rule problems disable the rule and are logged; core
    /// problems are errors.
    pub fn load() -> Result<Self> {
        let mut cfg = match std::env::var("TRAFFIC_WITNESS_CONFIG").ok() {
            Some(path) if !path.trim().is_empty() => read_config_file(Path::new(&path))?,
            _ => Self::default(),
        };
        cfg.apply_env()?;
        for warning in cfg.validate()? {
            log::warn!("{}", warning);
        }
        Ok(cfg)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_non_empty("TRAFFIC_WITNESS_DB_PATH") {
            self.db_path = path;
        }
        if let Some(dir) = env_non_empty("TRAFFIC_WITNESS_EVIDENCE_DIR") {
            self.evidence.evidence_dir = PathBuf::from(dir);
        }
        if let Some(url) = env_non_empty("TRAFFIC_WITNESS_VERIFY_URL") {
            self.services.verify_url = Some(url);
        }
        if let Some(url) = env_non_empty("TRAFFIC_WITNESS_DELIVERY_URL") {
            self.services.delivery_url = Some(url);
        }
        if let Some(dir) = env_non_empty("TRAFFIC_WITNESS_OUTBOX_DIR") {
            self.services.outbox_dir = PathBuf::from(dir);
        }
        if let Some(cap) = env_non_empty("TRAFFIC_WITNESS_MAX_REPORTS_PER_HOUR") {
            self.engine.max_reports_per_hour = cap.parse().map_err(|_| {
                anyhow!("TRAFFIC_WITNESS_MAX_REPORTS_PER_HOUR must be a non-negative integer")
            })?;
        }
        if let Some(seed) = env_non_empty("TRAFFIC_WITNESS_DEVICE_KEY_SEED") {
            self.device_key_seed = Some(seed);
        }
        Ok(())
    }

    /// Fail on structurally broken settings; disable individually broken
    /// rules and return a warning for each.
    pub fn validate(&mut self) -> Result<Vec<String>> {
        if self.db_path.trim().is_empty() {
            return Err(anyhow!("db_path must not be empty"));
        }
        if !self.aggregator.weights.is_valid() {
            return Err(anyhow!(
                "aggregator weights must be non-negative with a positive sum"
            ));
        }
        if !self.aggregator.thresholds.is_valid() {
            return Err(anyhow!(
                "aggregator thresholds must satisfy 0 <= discard_below <= report_directly <= 1"
            ));
        }
        if self.camera.fps == 0 || self.camera.width == 0 || self.camera.height == 0 {
            return Err(anyhow!("camera fps, width and height must be greater than zero"));
        }
        if self.camera.buffer_secs == 0 {
            return Err(anyhow!("camera buffer_secs must be greater than zero"));
        }
        if self.evidence.best_frames == 0 {
            return Err(anyhow!("evidence best_frames must be at least 1"));
        }
        if !(1..=100).contains(&self.evidence.jpeg_quality) {
            return Err(anyhow!("evidence jpeg_quality must be within 1..=100"));
        }
        if !(self.evidence.video_fps.is_finite() && self.evidence.video_fps > 0.0) {
            return Err(anyhow!("evidence video_fps must be positive"));
        }
        if self.workers.batch_size == 0 {
            return Err(anyhow!("workers batch_size must be at least 1"));
        }
        if self.workers.retry.max_attempts == 0 {
            return Err(anyhow!("workers retry max_attempts must be at least 1"));
        }
        if self.workers.retry.backoff_base_secs == 0 {
            return Err(anyhow!("workers retry backoff_base_secs must be at least 1"));
        }
        if self.governor.frame_skip == 0 {
            return Err(anyhow!("governor frame_skip must be at least 1"));
        }
        if !(self.governor.throttle_celsius < self.governor.pause_celsius) {
            return Err(anyhow!(
                "governor throttle_celsius ({}) must be below pause_celsius ({})",
                self.governor.throttle_celsius,
                self.governor.pause_celsius
            ));
        }
        if let Some(bearing) = self.road_bearing_deg {
            if !bearing.is_finite() {
                return Err(anyhow!("road_bearing_deg must be finite"));
            }
        }
        Ok(self.rules.disable_invalid())
    }

    /// Frames per second reaching the rule engine in the normal zone.
    pub fn processed_fps(&self) -> f64 {
        f64::from(self.camera.fps) / f64::from(self.governor.frame_skip.max(1))
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<TrafficWitnessConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let mut cfg = TrafficWitnessConfig::default();
        assert!(cfg.validate().unwrap().is_empty());
        assert_eq!(cfg.processed_fps(), 6.0);
    }

    #[test]
    fn broken_core_settings_fail_fast() {
        let mut cfg = TrafficWitnessConfig::default();
        cfg.aggregator.thresholds.discard_below = 0.99;
        assert!(cfg.validate().is_err());

        let mut cfg = TrafficWitnessConfig::default();
        cfg.governor.throttle_celsius = 85.0;
        assert!(cfg.validate().is_err());

        let mut cfg = TrafficWitnessConfig::default();
        cfg.workers.retry.max_attempts = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn broken_rule_is_disabled_not_fatal() {
        let mut cfg = TrafficWitnessConfig::default();
        cfg.rules.stop_line_y = 1.5;
        let warnings = cfg.validate().unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(!cfg.rules.red_light_jump.enabled);
        assert!(cfg.rules.no_helmet.enabled);
    }
}
