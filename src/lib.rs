//! Traffic Witness
//!
//! On-device pipeline that turns per-frame object detections into confirmed
//! traffic violations, packages hash-verified evidence for each one, and
//! delivers it through durable queues that survive power loss and network
//! outages.
//!
//! # Architecture
//!
//! Frames flow through a single synchronous path:
//!
//! 1. **Admission**: the resource governor decides whether the frame is
//!    processed, skipped (throttle) or the loop pauses (thermal).
//! 2. **Rules**: each enabled rule nominates `(track, confidence)` pairs.
//! 3. **Temporal filter**: a nomination must hold for N consecutive frames.
//! 4. **Aggregation**: detection, classification, temporal and OCR signals
//!    collapse into one score that routes to report / verify / discard.
//! 5. **Packaging**: frames, clip, and metadata are written and hashed.
//! 6. **Queues**: packets are registered in SQLite and drained by the
//!    verification and delivery workers on their own threads.
//!
//! # Module Structure
//!
//! - `config`: file and environment configuration
//! - `frame`: frame snapshots and the rolling frame buffer
//! - `ingest`: frame sources
//! - `detect`: perception capability traits plus an IoU tracker
//! - `plate`: licence plate text cleanup and validation
//! - `violation`: temporal tracker, aggregator, rule set and rule engine
//! - `evidence`: evidence packager and packet integrity checks
//! - `store`: durable violation store and work queues
//! - `transport`: verification service and delivery transports
//! - `worker`: verification and delivery workers
//! - `governor`: thermal / load governor
//! - `pipeline`: frame loop wiring

use anyhow::{anyhow, Result};
use rand::RngCore;
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod config;
pub mod detect;
pub mod evidence;
pub mod frame;
pub mod governor;
pub mod ingest;
pub mod pipeline;
pub mod plate;
pub mod store;
pub mod transport;
pub mod violation;
pub mod worker;

pub use config::TrafficWitnessConfig;
pub use evidence::{EvidenceError, EvidencePackager, EvidencePacket};
pub use frame::{FrameBuffer, FrameSnapshot, SharedFrameBuffer};
pub use governor::{GovernorDecision, ResourceGovernor};
pub use pipeline::{FrameAdmission, Pipeline, PipelineStatus};
pub use store::{QueueKind, QueueStatus, WitnessStore};
pub use transport::{DeliveryTransport, ServiceError, VerificationService};
pub use violation::{ConfidenceAggregator, RuleEngine, RuleSet, TemporalTracker};
pub use worker::{DeliveryWorker, RetryPolicy, VerificationWorker};

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

pub fn now_ms() -> Result<u64> {
    let elapsed = SystemTime::now().duration_since(UNIX_EPOCH)?;
    u64::try_from(elapsed.as_millis()).map_err(|_| anyhow!("system clock out of range"))
}

/// New violation id: millisecond timestamp plus 48 random bits, so ids sort
/// by creation time and never collide across restarts.
pub fn new_violation_id(created_at_ms: u64) -> String {
    let mut bytes = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("v{:013}-{}", created_at_ms, hex::encode(bytes))
}

// -------------------- Geometry --------------------

/// Axis-aligned box in normalized image coordinates (0.0..=1.0).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        }
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    pub fn is_finite(&self) -> bool {
        self.x1.is_finite() && self.y1.is_finite() && self.x2.is_finite() && self.y2.is_finite()
    }

    pub fn intersection(&self, other: &BoundingBox) -> f32 {
        let w = (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0);
        let h = (self.y2.min(other.y2) - self.y1.max(other.y1)).max(0.0);
        w * h
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let inter = self.intersection(other);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            return 0.0;
        }
        inter / union
    }

    pub fn horizontal_overlap(&self, other: &BoundingBox) -> f32 {
        (self.x2.min(other.x2) - self.x1.max(other.x1)).max(0.0)
    }
}

// -------------------- Detections --------------------

#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectClass {
    Person,
    Motorcycle,
    Bicycle,
    Car,
    Truck,
    Bus,
    TrafficLight,
    Other,
}

impl ObjectClass {
    /// Map a detector label (COCO style) onto a class.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "person" | "rider" => ObjectClass::Person,
            "motorcycle" | "motorbike" | "scooter" => ObjectClass::Motorcycle,
            "bicycle" => ObjectClass::Bicycle,
            "car" => ObjectClass::Car,
            "truck" => ObjectClass::Truck,
            "bus" => ObjectClass::Bus,
            "traffic light" | "traffic_light" => ObjectClass::TrafficLight,
            _ => ObjectClass::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectClass::Person => "person",
            ObjectClass::Motorcycle => "motorcycle",
            ObjectClass::Bicycle => "bicycle",
            ObjectClass::Car => "car",
            ObjectClass::Truck => "truck",
            ObjectClass::Bus => "bus",
            ObjectClass::TrafficLight => "traffic_light",
            ObjectClass::Other => "other",
        }
    }

    /// Vehicles subject to signal rules.
    pub fn is_vehicle(&self) -> bool {
        matches!(
            self,
            ObjectClass::Car | ObjectClass::Truck | ObjectClass::Bus | ObjectClass::Motorcycle
        )
    }
}

/// One detected object in one frame. Immutable once produced; the tracker
/// hands back new values with `track_id` filled in.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub class: ObjectClass,
    pub confidence: f32,
    pub frame_id: u64,
    pub timestamp_ms: u64,
    pub track_id: Option<u64>,
}

impl Detection {
    pub fn new(
        class: ObjectClass,
        bbox: BoundingBox,
        confidence: f32,
        frame_id: u64,
        timestamp_ms: u64,
    ) -> Self {
        Self {
            bbox,
            class,
            confidence,
            frame_id,
            timestamp_ms,
            track_id: None,
        }
    }

    pub fn with_track(mut self, track_id: u64) -> Self {
        self.track_id = Some(track_id);
        self
    }

    pub fn has_valid_confidence(&self) -> bool {
        self.confidence.is_finite() && (0.0..=1.0).contains(&self.confidence)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    pub latitude: f64,
    pub longitude: f64,
    /// None while the receiver has no course (stationary or cold start).
    #[serde(default)]
    pub heading_deg: Option<f64>,
    pub speed_kmh: f64,
    /// 0 = no fix.
    pub fix_quality: u8,
}

impl GpsFix {
    pub fn has_fix(&self) -> bool {
        self.fix_quality > 0
            && self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.speed_kmh.is_finite()
    }

    /// The fix as it may be recorded: None without a usable position, a
    /// non-finite heading becomes unknown and a finite one is folded into
    /// [0, 360).
    pub fn sanitized(self) -> Option<Self> {
        if !self.has_fix() {
            return None;
        }
        Some(Self {
            heading_deg: self
                .heading_deg
                .filter(|h| h.is_finite())
                .map(|h| h.rem_euclid(360.0)),
            ..self
        })
    }

    pub fn maps_url(&self) -> String {
        format!(
            "https://maps.google.com/?q={:.6},{:.6}",
            self.latitude, self.longitude
        )
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalState {
    Red,
    Yellow,
    Green,
    #[default]
    Unknown,
}

// -------------------- Violations --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    NoHelmet,
    RedLightJump,
    WrongSide,
}

impl ViolationKind {
    pub const ALL: [ViolationKind; 3] = [
        ViolationKind::NoHelmet,
        ViolationKind::RedLightJump,
        ViolationKind::WrongSide,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationKind::NoHelmet => "no_helmet",
            ViolationKind::RedLightJump => "red_light_jump",
            ViolationKind::WrongSide => "wrong_side",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            ViolationKind::NoHelmet => "Riding Without Helmet",
            ViolationKind::RedLightJump => "Red Light Violation",
            ViolationKind::WrongSide => "Wrong Side Driving",
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ViolationKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        ViolationKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| anyhow!("unknown violation kind: {}", s))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionTier {
    ReportDirectly,
    Verify,
    Discard,
}

impl ActionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionTier::ReportDirectly => "report_directly",
            ActionTier::Verify => "verify",
            ActionTier::Discard => "discard",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateStatus {
    Emitted,
    QueuedForVerification,
    QueuedForDelivery,
    PackagingFailed,
}

impl CandidateStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CandidateStatus::Emitted)
    }
}

/// A violation that passed the temporal filter and scored above the discard
/// floor. Owned by the pipeline until it is queued or packaging fails.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ViolationCandidate {
    pub kind: ViolationKind,
    pub confidence: f32,
    pub tier: ActionTier,
    pub track_id: u64,
    pub supporting_frames: Vec<u64>,
    pub plate_text: Option<String>,
    pub plate_confidence: Option<f32>,
    pub gps: Option<GpsFix>,
    pub created_at_ms: u64,
    pub consecutive_frames: u32,
    pub status: CandidateStatus,
}

impl ViolationCandidate {
    /// Move to a terminal status. Each candidate reaches exactly one.
    pub fn settle(&mut self, status: CandidateStatus) -> Result<()> {
        if !status.is_terminal() {
            return Err(anyhow!("{:?} is not a terminal candidate status", status));
        }
        if self.status.is_terminal() {
            return Err(anyhow!(
                "candidate already settled as {:?}; refusing {:?}",
                self.status,
                status
            ));
        }
        self.status = status;
        Ok(())
    }

    pub fn last_frame(&self) -> Option<u64> {
        self.supporting_frames.iter().copied().max()
    }
}
