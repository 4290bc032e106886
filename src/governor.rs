//! Thermal and load governor.
//!
//! The governor is a pure function of the latest temperature reading plus a
//! pause deadline. Below the throttle threshold every Nth frame is processed;
//! in the throttle band the skip factor is multiplied; at or above the pause
//! threshold processing stops for a fixed duration, after which the sensor is
//! read again.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const SENSOR_POLL: Duration = Duration::from_millis(10);

// -------------------- Sensors --------------------

pub trait TemperatureSensor: Send {
    /// Current SoC temperature in °C. Sensors that cannot read report their
    /// fallback value instead of failing.
    fn read_celsius(&mut self) -> f32;
}

/// Fixed reading, for tests and hosts without a thermal zone.
#[derive(Clone, Copy, Debug)]
pub struct FixedTemperature(pub f32);

impl TemperatureSensor for FixedTemperature {
    fn read_celsius(&mut self) -> f32 {
        self.0
    }
}

/// `vcgencmd measure_temp`, then the sysfs thermal zone, then a fallback.
#[derive(Clone, Debug)]
pub struct SysfsThermalSensor {
    pub zone_path: PathBuf,
    /// vcgencmd binary; None reads the thermal zone only.
    pub vcgencmd: Option<String>,
    /// Longest a vcgencmd call may take before it is killed.
    pub command_timeout: Duration,
    pub fallback_celsius: f32,
}

impl Default for SysfsThermalSensor {
    fn default() -> Self {
        Self {
            zone_path: PathBuf::from("/sys/class/thermal/thermal_zone0/temp"),
            vcgencmd: Some("vcgencmd".to_string()),
            command_timeout: Duration::from_millis(500),
            fallback_celsius: 50.0,
        }
    }
}

impl SysfsThermalSensor {
    /// A vcgencmd that overruns `command_timeout` is killed and not tried
    /// again; later reads go straight to the thermal zone.
    fn read_vcgencmd(&mut self) -> Option<f32> {
        let binary = self.vcgencmd.as_deref()?;
        let mut child = Command::new(binary)
            .arg("measure_temp")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .ok()?;
        let deadline = Instant::now() + self.command_timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() < deadline => thread::sleep(SENSOR_POLL),
                Ok(None) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    warn!(
                        "{} timed out after {:?}; using the thermal zone from now on",
                        binary, self.command_timeout
                    );
                    self.vcgencmd = None;
                    return None;
                }
                Err(e) => {
                    debug!("{} wait failed: {}", binary, e);
                    let _ = child.kill();
                    return None;
                }
            }
        };
        if !status.success() {
            return None;
        }
        let mut text = String::new();
        child.stdout.take()?.read_to_string(&mut text).ok()?;
        parse_vcgencmd(&text)
    }

    fn read_zone(&self) -> Option<f32> {
        let text = fs::read_to_string(&self.zone_path).ok()?;
        let millis: f32 = text.trim().parse().ok()?;
        Some(millis / 1000.0)
    }
}

/// `temp=48.3'C` → 48.3
fn parse_vcgencmd(text: &str) -> Option<f32> {
    let value = text.trim().strip_prefix("temp=")?;
    let end = value.find(|c: char| !(c.is_ascii_digit() || c == '.'))?;
    value[..end].parse().ok()
}

impl TemperatureSensor for SysfsThermalSensor {
    fn read_celsius(&mut self) -> f32 {
        self.read_vcgencmd()
            .or_else(|| self.read_zone())
            .filter(|t| t.is_finite())
            .unwrap_or(self.fallback_celsius)
    }
}

// -------------------- Governor --------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub throttle_celsius: f32,
    pub pause_celsius: f32,
    pub pause_secs: u64,
    pub fallback_celsius: f32,
    /// Process every Nth frame in the normal zone.
    pub frame_skip: u32,
    /// Skip multiplier in the throttle zone.
    pub throttle_multiplier: u32,
    pub thermal_zone: PathBuf,
    /// vcgencmd binary tried before the thermal zone; None skips it.
    pub vcgencmd: Option<String>,
    pub sensor_timeout_ms: u64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            throttle_celsius: 75.0,
            pause_celsius: 80.0,
            pause_secs: 30,
            fallback_celsius: 50.0,
            frame_skip: 5,
            throttle_multiplier: 2,
            thermal_zone: PathBuf::from("/sys/class/thermal/thermal_zone0/temp"),
            vcgencmd: Some("vcgencmd".to_string()),
            sensor_timeout_ms: 500,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Zone {
    Normal,
    Throttle,
    Pause,
}

impl Zone {
    pub fn as_str(&self) -> &'static str {
        match self {
            Zone::Normal => "normal",
            Zone::Throttle => "throttle",
            Zone::Pause => "pause",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GovernorDecision {
    /// Process one frame in every `frame_skip`.
    Run { frame_skip: u32 },
    /// Process nothing until `remaining` has elapsed.
    Pause { remaining: Duration },
}

pub struct ResourceGovernor {
    config: GovernorConfig,
    sensor: Box<dyn TemperatureSensor>,
    paused_until: Option<Instant>,
    zone: Zone,
    last_celsius: Option<f32>,
}

impl ResourceGovernor {
    pub fn new(config: GovernorConfig, sensor: Box<dyn TemperatureSensor>) -> Self {
        Self {
            config,
            sensor,
            paused_until: None,
            zone: Zone::Normal,
            last_celsius: None,
        }
    }

    /// Governor reading the host's thermal zone.
    pub fn for_host(config: GovernorConfig) -> Self {
        let sensor = SysfsThermalSensor {
            zone_path: config.thermal_zone.clone(),
            vcgencmd: config.vcgencmd.clone(),
            command_timeout: Duration::from_millis(config.sensor_timeout_ms.max(1)),
            fallback_celsius: config.fallback_celsius,
        };
        Self::new(config, Box::new(sensor))
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    pub fn zone(&self) -> Zone {
        self.zone
    }

    pub fn last_celsius(&self) -> Option<f32> {
        self.last_celsius
    }

    pub fn classify(&self, celsius: f32) -> Zone {
        if celsius >= self.config.pause_celsius {
            Zone::Pause
        } else if celsius >= self.config.throttle_celsius {
            Zone::Throttle
        } else {
            Zone::Normal
        }
    }

    /// Decide what the loop does at `now`. While a pause is running the
    /// sensor is not read.
    pub fn poll(&mut self, now: Instant) -> GovernorDecision {
        if let Some(until) = self.paused_until {
            if now < until {
                return GovernorDecision::Pause {
                    remaining: until - now,
                };
            }
            self.paused_until = None;
            debug!("thermal pause elapsed; re-reading temperature");
        }

        let celsius = self.sensor.read_celsius();
        self.last_celsius = Some(celsius);
        let zone = self.classify(celsius);
        if zone != self.zone {
            warn!(
                "governor zone {} -> {} at {:.1} C",
                self.zone.as_str(),
                zone.as_str(),
                celsius
            );
        }
        self.zone = zone;

        let base = self.config.frame_skip.max(1);
        match zone {
            Zone::Normal => GovernorDecision::Run { frame_skip: base },
            Zone::Throttle => GovernorDecision::Run {
                frame_skip: base.saturating_mul(self.config.throttle_multiplier.max(1)),
            },
            Zone::Pause => {
                let pause = Duration::from_secs(self.config.pause_secs);
                self.paused_until = Some(now + pause);
                GovernorDecision::Pause { remaining: pause }
            }
        }
    }
}
