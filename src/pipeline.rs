//! Per-frame orchestration.
//!
//! `Pipeline` owns the rule engine, the frame buffer and a store connection,
//! and runs on the frame loop thread. Packaging and registration happen on a
//! dedicated packaging thread with its own connection, fed through a bounded
//! channel. Workers see the output only through the queues.

use log::{debug, error, info, warn};
use serde::Serialize;
use ed25519_dalek::VerifyingKey;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::detect::{Classifier, PlateRead, PlateReader};
use crate::evidence::{release_dir, EvidencePackager};
use crate::frame::{FrameSnapshot, SharedFrameBuffer};
use crate::governor::{GovernorDecision, ResourceGovernor, Zone};
use crate::store::{QueueKind, QueueStats, WitnessStore};
use crate::violation::{EngineStats, HelmetObservation, RuleContext, RuleEngine};
use crate::{
    new_violation_id, now_ms, BoundingBox, CandidateStatus, ObjectClass, SignalState,
    ViolationCandidate,
};

// -------------------- Perception context --------------------

/// Runs the crop classifiers and OCR over a frame's tracked detections to
/// build the rule context. A failed classification leaves that entry out.
pub struct Perception {
    helmet: Box<dyn Classifier<Label = bool>>,
    signal: Box<dyn Classifier<Label = SignalState>>,
    plates: Box<dyn PlateReader>,
    road_bearing_deg: Option<f64>,
}

impl Perception {
    pub fn new(
        helmet: Box<dyn Classifier<Label = bool>>,
        signal: Box<dyn Classifier<Label = SignalState>>,
        plates: Box<dyn PlateReader>,
        road_bearing_deg: Option<f64>,
    ) -> Self {
        Self {
            helmet,
            signal,
            plates,
            road_bearing_deg,
        }
    }

    pub fn set_road_bearing(&mut self, bearing: Option<f64>) {
        self.road_bearing_deg = bearing;
    }

    pub fn context(&mut self, frame: &FrameSnapshot) -> RuleContext {
        let mut ctx = RuleContext {
            road_bearing_deg: self.road_bearing_deg,
            ..RuleContext::default()
        };
        let usable = frame
            .detections
            .iter()
            .filter(|d| d.has_valid_confidence() && d.bbox.is_finite());

        let mut best_light: Option<(f32, BoundingBox)> = None;
        let mut riders: Vec<(u64, BoundingBox)> = Vec::new();
        for det in usable {
            match (det.class, det.track_id) {
                (ObjectClass::TrafficLight, _) => {
                    if best_light.map_or(true, |(c, _)| det.confidence > c) {
                        best_light = Some((det.confidence, det.bbox));
                    }
                }
                (ObjectClass::Person, Some(track)) => {
                    let head = BoundingBox::new(
                        det.bbox.x1,
                        det.bbox.y1,
                        det.bbox.x2,
                        det.bbox.y1 + det.bbox.height() / 3.0,
                    );
                    match self.helmet.classify(&frame.crop(&head)) {
                        Ok(c) => {
                            ctx.helmets.insert(
                                track,
                                HelmetObservation {
                                    has_helmet: c.label,
                                    confidence: c.confidence,
                                },
                            );
                        }
                        Err(e) => debug!("helmet classification for track {} failed: {}", track, e),
                    }
                }
                (class, Some(track)) if class.is_vehicle() => {
                    if class == ObjectClass::Motorcycle {
                        riders.push((track, det.bbox));
                    }
                    let plate_region = BoundingBox::new(
                        det.bbox.x1,
                        det.bbox.y1 + det.bbox.height() / 2.0,
                        det.bbox.x2,
                        det.bbox.y2,
                    );
                    match self.plates.read(&frame.crop(&plate_region)) {
                        Ok(Some(read)) => {
                            ctx.plates.insert(track, read);
                        }
                        Ok(None) => {}
                        Err(e) => debug!("plate read for track {} failed: {}", track, e),
                    }
                }
                _ => {}
            }
        }

        if let Some((_, bbox)) = best_light {
            match self.signal.classify(&frame.crop(&bbox)) {
                Ok(c) => ctx.signal_state = c.label,
                Err(e) => debug!("signal classification failed: {}", e),
            }
        }

        // A rider's plate is the motorcycle's plate.
        let mut rider_plates: HashMap<u64, PlateRead> = HashMap::new();
        for person in frame
            .detections
            .iter()
            .filter(|d| d.class == ObjectClass::Person)
        {
            let Some(person_track) = person.track_id else {
                continue;
            };
            if let Some(read) = riders
                .iter()
                .filter(|(_, bbox)| person.bbox.horizontal_overlap(bbox) > 0.0)
                .find_map(|(track, _)| ctx.plates.get(track))
            {
                rider_plates.insert(person_track, read.clone());
            }
        }
        for (track, read) in rider_plates {
            ctx.plates.entry(track).or_insert(read);
        }
        ctx
    }
}

// -------------------- Pipeline --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameAdmission {
    Process,
    /// Sampled out by the current skip factor.
    Skip,
    /// Thermal pause; nothing is processed until `remaining` elapses.
    Paused { remaining: Duration },
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PipelineStats {
    pub frames_admitted: u64,
    pub frames_skipped: u64,
    pub frames_paused: u64,
    pub packaged: u64,
    pub packaging_failures: u64,
}

/// Read-only snapshot for monitoring and the CLI.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PipelineStatus {
    pub verification: QueueStats,
    pub delivery: QueueStats,
    pub last_error: Option<String>,
    pub zone: Zone,
    pub celsius: Option<f32>,
    pub buffered_frames: usize,
    pub buffer_bytes: usize,
    pub engine: EngineStats,
    pub pipeline: PipelineStats,
}

/// Candidates waiting for the packaging thread. A full queue fails the
/// candidate rather than stalling capture.
pub const PACKAGING_QUEUE_DEPTH: usize = 8;

struct PackagingJob {
    candidate: ViolationCandidate,
    window: Vec<Arc<FrameSnapshot>>,
}

/// Counters and the last failure, written by the packaging thread.
#[derive(Default)]
struct PackagingShared {
    packaged: AtomicU64,
    failures: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl PackagingShared {
    fn record_failure(&self, store: &mut WitnessStore, message: String) {
        error!("{}", message);
        self.failures.fetch_add(1, Ordering::SeqCst);
        if let Err(alarm) =
            now_ms().and_then(|now| store.log_alarm("PACKAGING_FAILED", &message, now))
        {
            error!("alarm not recorded: {}", alarm);
        }
        match self.last_error.lock() {
            Ok(mut last) => *last = Some(message),
            Err(_) => warn!("packaging error slot poisoned"),
        }
    }

    fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|last| last.clone())
    }
}

/// Owns the packager and a second store connection. Writes packets and
/// registers them off the frame loop.
struct PackagingThread {
    packager: EvidencePackager,
    store: WitnessStore,
    shared: Arc<PackagingShared>,
}

impl PackagingThread {
    fn run(mut self, jobs: Receiver<PackagingJob>, settled: Sender<ViolationCandidate>) {
        let trusted = self.packager.verifying_key();
        for job in jobs {
            let mut candidate = job.candidate;
            let status = match self.package(&candidate, &job.window, trusted.as_ref()) {
                Ok(status) => status,
                Err(e) => {
                    self.shared.record_failure(
                        &mut self.store,
                        format!(
                            "{} on track {} not queued: {}",
                            candidate.kind, candidate.track_id, e
                        ),
                    );
                    CandidateStatus::PackagingFailed
                }
            };
            if let Err(e) = candidate.settle(status) {
                warn!("{}", e);
            }
            if settled.send(candidate).is_err() {
                debug!("pipeline gone; dropping settled candidate");
            }
        }
        debug!("packaging thread exiting");
    }

    fn package(
        &mut self,
        candidate: &ViolationCandidate,
        window: &[Arc<FrameSnapshot>],
        trusted: Option<&VerifyingKey>,
    ) -> anyhow::Result<CandidateStatus> {
        let queue = QueueKind::for_tier(candidate.tier)
            .ok_or_else(|| anyhow::anyhow!("discard-tier candidate reached packaging"))?;
        let violation_id = new_violation_id(candidate.created_at_ms);
        let packet = self.packager.package(&violation_id, candidate, window)?;
        if let Err(e) = self
            .store
            .register_packet(candidate, &packet, queue, now_ms()?, trusted)
        {
            if let Err(cleanup) = release_dir(&packet.dir) {
                warn!("{}", cleanup);
            }
            return Err(e);
        }
        self.shared.packaged.fetch_add(1, Ordering::SeqCst);
        info!(
            "{} {} (track {}, conf {:.2}) queued for {}",
            violation_id,
            candidate.kind,
            candidate.track_id,
            candidate.confidence,
            queue.as_str()
        );
        Ok(match queue {
            QueueKind::Verification => CandidateStatus::QueuedForVerification,
            QueueKind::Delivery => CandidateStatus::QueuedForDelivery,
        })
    }
}

pub struct Pipeline {
    engine: RuleEngine,
    buffer: SharedFrameBuffer,
    store: WitnessStore,
    governor: ResourceGovernor,
    clip_before_ms: u64,
    jobs: Option<SyncSender<PackagingJob>>,
    settled: Receiver<ViolationCandidate>,
    packaging: Option<JoinHandle<()>>,
    shared: Arc<PackagingShared>,
    outstanding: usize,
    frame_counter: u64,
    stats: PipelineStats,
}

impl Pipeline {
    /// Start the packaging thread. It gets its own connection to the
    /// store's database.
    pub fn new(
        engine: RuleEngine,
        buffer: SharedFrameBuffer,
        packager: EvidencePackager,
        store: WitnessStore,
        governor: ResourceGovernor,
    ) -> anyhow::Result<Self> {
        let clip_before_ms = packager.settings().clip_before_secs.saturating_mul(1000);
        let shared = Arc::new(PackagingShared::default());
        let worker = PackagingThread {
            packager,
            store: store.reopen()?,
            shared: shared.clone(),
        };
        let (jobs, job_rx) = mpsc::sync_channel(PACKAGING_QUEUE_DEPTH);
        let (settled_tx, settled) = mpsc::channel();
        let packaging = std::thread::Builder::new()
            .name("packaging".to_string())
            .spawn(move || worker.run(job_rx, settled_tx))?;
        Ok(Self {
            engine,
            buffer,
            store,
            governor,
            clip_before_ms,
            jobs: Some(jobs),
            settled,
            packaging: Some(packaging),
            shared,
            outstanding: 0,
            frame_counter: 0,
            stats: PipelineStats::default(),
        })
    }

    pub fn buffer(&self) -> &SharedFrameBuffer {
        &self.buffer
    }

    pub fn store(&self) -> &WitnessStore {
        &self.store
    }

    /// Ask the governor whether the next captured frame is processed.
    pub fn admit(&mut self, now: Instant) -> FrameAdmission {
        match self.governor.poll(now) {
            GovernorDecision::Pause { remaining } => {
                self.stats.frames_paused += 1;
                FrameAdmission::Paused { remaining }
            }
            GovernorDecision::Run { frame_skip } => {
                let n = self.frame_counter;
                self.frame_counter = self.frame_counter.wrapping_add(1);
                if n % u64::from(frame_skip.max(1)) == 0 {
                    self.stats.frames_admitted += 1;
                    FrameAdmission::Process
                } else {
                    self.stats.frames_skipped += 1;
                    FrameAdmission::Skip
                }
            }
        }
    }

    /// Buffer the frame, run the rules and hand every candidate to the
    /// packaging thread. Returned candidates are still `Emitted` unless
    /// they could not be handed off, in which case they are already
    /// settled as `PackagingFailed`. Packaging failures are logged and
    /// alarmed; they never escape the frame.
    pub fn process_frame(
        &mut self,
        snapshot: FrameSnapshot,
        ctx: &RuleContext,
    ) -> Vec<ViolationCandidate> {
        let frame = Arc::new(snapshot);
        if let Err(e) = self.buffer.push(frame.clone()) {
            warn!("frame {} not buffered: {}", frame.frame_id, e);
        }
        let mut candidates = self.engine.process_frame(&frame, ctx);
        for candidate in &mut candidates {
            if let Err(e) = self.submit(candidate) {
                self.shared.record_failure(
                    &mut self.store,
                    format!(
                        "{} on track {} not queued: {}",
                        candidate.kind, candidate.track_id, e
                    ),
                );
                if let Err(e) = candidate.settle(CandidateStatus::PackagingFailed) {
                    warn!("{}", e);
                }
            }
        }
        candidates
    }

    fn submit(&mut self, candidate: &ViolationCandidate) -> anyhow::Result<()> {
        let at = candidate.created_at_ms;
        let window = self
            .buffer
            .window(at.saturating_sub(self.clip_before_ms), at)?;
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("packaging thread stopped"))?;
        let job = PackagingJob {
            candidate: candidate.clone(),
            window,
        };
        match jobs.try_send(job) {
            Ok(()) => {
                self.outstanding += 1;
                Ok(())
            }
            Err(TrySendError::Full(_)) => Err(anyhow::anyhow!(
                "packaging queue full ({} waiting)",
                PACKAGING_QUEUE_DEPTH
            )),
            Err(TrySendError::Disconnected(_)) => {
                Err(anyhow::anyhow!("packaging thread stopped"))
            }
        }
    }

    /// Candidates the packaging thread has settled since the last call.
    pub fn poll_completed(&mut self) -> Vec<ViolationCandidate> {
        let mut done = Vec::new();
        while let Ok(candidate) = self.settled.try_recv() {
            done.push(candidate);
        }
        self.outstanding = self.outstanding.saturating_sub(done.len());
        done
    }

    /// Block until every handed-off candidate is settled.
    pub fn drain(&mut self) -> Vec<ViolationCandidate> {
        let mut done = Vec::new();
        while self.outstanding > 0 {
            match self.settled.recv() {
                Ok(candidate) => {
                    self.outstanding -= 1;
                    done.push(candidate);
                }
                Err(_) => {
                    warn!("packaging thread exited with {} jobs outstanding", self.outstanding);
                    self.outstanding = 0;
                }
            }
        }
        done
    }

    /// Finish outstanding packaging and stop the thread.
    pub fn shutdown(mut self) -> Vec<ViolationCandidate> {
        let done = self.drain();
        self.stop_packaging();
        done
    }

    fn stop_packaging(&mut self) {
        self.jobs.take();
        if let Some(handle) = self.packaging.take() {
            if handle.join().is_err() {
                error!("packaging thread panicked");
            }
        }
    }

    pub fn status(&self) -> anyhow::Result<PipelineStatus> {
        let last_error = match self.shared.last_error() {
            Some(e) => Some(e),
            None => self.store.last_queue_error()?,
        };
        let mut stats = self.stats.clone();
        stats.packaged = self.shared.packaged.load(Ordering::SeqCst);
        stats.packaging_failures = self.shared.failures.load(Ordering::SeqCst);
        Ok(PipelineStatus {
            verification: self.store.queue_stats(QueueKind::Verification)?,
            delivery: self.store.queue_stats(QueueKind::Delivery)?,
            last_error,
            zone: self.governor.zone(),
            celsius: self.governor.last_celsius(),
            buffered_frames: self.buffer.len()?,
            buffer_bytes: self.buffer.memory_bytes()?,
            engine: self.engine.stats(),
            pipeline: stats,
        })
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.stop_packaging();
    }
}
