//! traffic_witnessd - on-device traffic violation witness
//!
//! This daemon:
//! 1. Captures frames from the configured source
//! 2. Lets the resource governor sample or pause the loop
//! 3. Runs detection, tracking, classifiers and OCR on admitted frames
//! 4. Confirms violations through the rule engine and packages evidence
//! 5. Queues packets for verification or delivery
//! 6. Drains the queues on background workers

use anyhow::{anyhow, Result};
use clap::Parser;
use ed25519_dalek::VerifyingKey;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use traffic_witness::config::TrafficWitnessConfig;
use traffic_witness::detect::{
    DetectorRegistry, FixedGps, GpsSource, IouTracker, ObjectTracker, ScriptedDetector,
    StubDetector, StubHelmetClassifier, StubPlateReader, StubSignalClassifier,
};
use traffic_witness::evidence::signing_key_from_seed;
use traffic_witness::ingest::open_source;
use traffic_witness::pipeline::Perception;
use traffic_witness::transport::{
    AlwaysOnline, ConnectivityProbe, DeliveryTransport, SpoolTransport, TcpProbe,
};
use traffic_witness::worker::{spawn_periodic, TextReportRenderer, WorkerHandle};
use traffic_witness::{
    now_ms, ConfidenceAggregator, DeliveryWorker, EvidencePackager, FrameAdmission, FrameBuffer,
    Pipeline, ResourceGovernor, RuleEngine, SharedFrameBuffer, VerificationWorker, WitnessStore,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "TRAFFIC_WITNESS_CONFIG")]
    config: Option<PathBuf>,
    /// Stop after this many captured frames.
    #[arg(long)]
    max_frames: Option<u64>,
    /// Run the frame loop only; queued work is left for a later run.
    #[arg(long, default_value_t = false)]
    no_workers: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if let Some(path) = &args.config {
        std::env::set_var("TRAFFIC_WITNESS_CONFIG", path);
    }
    let cfg = TrafficWitnessConfig::load()?;

    let signer = match cfg.device_key_seed.as_deref() {
        Some(seed) => Some(signing_key_from_seed(seed)?),
        None => {
            log::warn!("TRAFFIC_WITNESS_DEVICE_KEY_SEED not set; evidence manifests are unsigned");
            None
        }
    };

    let mut store = WitnessStore::open(&cfg.db_path)?;
    store.recover_interrupted(now_ms()?)?;

    let device_key = signer.as_ref().map(|key| key.verifying_key());
    let workers = if args.no_workers {
        Vec::new()
    } else {
        spawn_workers(&cfg, device_key)?
    };

    let mut registry = DetectorRegistry::new();
    registry.register(StubDetector::new());
    if cfg.detector.backend == "scripted" {
        let path = cfg
            .detector
            .script_path
            .as_deref()
            .ok_or_else(|| anyhow!("scripted detector requires detector.script_path"))?;
        registry.register(ScriptedDetector::from_file(path, true)?);
    }
    if !cfg.detector.backend.is_empty() {
        registry.select(&cfg.detector.backend)?;
    }
    let mut tracker = IouTracker::default();
    let mut gps = FixedGps::default();
    let mut perception = Perception::new(
        Box::new(StubHelmetClassifier::default()),
        Box::new(StubSignalClassifier::default()),
        Box::new(StubPlateReader::default()),
        cfg.road_bearing_deg,
    );

    let engine = RuleEngine::new(
        cfg.rules.clone(),
        cfg.engine.clone(),
        ConfidenceAggregator::new(
            cfg.aggregator.weights.clone(),
            cfg.aggregator.thresholds.clone(),
        ),
    );
    let buffer = SharedFrameBuffer::new(FrameBuffer::for_window(
        cfg.camera.buffer_secs,
        cfg.processed_fps(),
    ));
    let packager = EvidencePackager::new(cfg.evidence.clone(), signer);
    let governor = ResourceGovernor::for_host(cfg.governor.clone());
    let mut pipeline = Pipeline::new(engine, buffer, packager, store, governor)?;

    let mut source = open_source(
        &cfg.camera.source,
        cfg.camera.width,
        cfg.camera.height,
        cfg.camera.fps,
    )?;
    source.connect()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_signal = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_signal.store(true, Ordering::SeqCst);
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    log::info!(
        "traffic_witnessd running: source={} detector={} db={}",
        cfg.camera.source,
        registry.active_name().unwrap_or("none"),
        cfg.db_path
    );

    let frame_interval = Duration::from_millis(1000 / u64::from(cfg.camera.fps.max(1)));
    let mut last_health_log = Instant::now();
    let mut captured = 0u64;
    let mut emitted = 0u64;

    while !shutdown.load(Ordering::SeqCst) {
        if args.max_frames.is_some_and(|max| captured >= max) {
            break;
        }
        let loop_start = Instant::now();

        match pipeline.admit(loop_start) {
            FrameAdmission::Paused { remaining } => {
                std::thread::sleep(remaining.min(Duration::from_secs(1)));
                continue;
            }
            FrameAdmission::Skip => {
                // Keep capture paced even when the frame is sampled out.
                if let Err(e) = source.next_frame() {
                    log::warn!("frame capture failed: {}", e);
                }
                captured += 1;
                pace(loop_start, frame_interval);
                continue;
            }
            FrameAdmission::Process => {}
        }

        let frame = match source.next_frame() {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("frame capture failed: {}", e);
                pace(loop_start, frame_interval);
                continue;
            }
        };
        captured += 1;

        let detections = match registry.detect(&frame) {
            Ok(d) => d,
            Err(e) => {
                log::warn!(
                    "frame {} skipped: detection failed ({} in a row): {}",
                    frame.frame_id,
                    registry.consecutive_failures(),
                    e
                );
                pace(loop_start, frame_interval);
                continue;
            }
        };
        let frame = frame
            .with_detections(tracker.assign(detections))
            .with_gps(gps.latest());
        let ctx = perception.context(&frame);
        emitted += pipeline.process_frame(frame, &ctx).len() as u64;
        for settled in pipeline.poll_completed() {
            log::debug!(
                "{} on track {} settled as {:?}",
                settled.kind,
                settled.track_id,
                settled.status
            );
        }

        if last_health_log.elapsed() >= Duration::from_secs(30) {
            match pipeline.status() {
                Ok(status) => log::info!(
                    "health source={} frames={} emitted={} zone={} verify_depth={} delivery_depth={} buffer={}KB",
                    source.is_healthy(),
                    captured,
                    emitted,
                    status.zone.as_str(),
                    status.verification.depth(),
                    status.delivery.depth(),
                    status.buffer_bytes / 1024
                ),
                Err(e) => log::warn!("status unavailable: {}", e),
            }
            last_health_log = Instant::now();
        }

        pace(loop_start, frame_interval);
    }

    log::info!("shutting down after {} frames, {} violations", captured, emitted);
    let settled = pipeline.shutdown();
    if !settled.is_empty() {
        log::info!("{} candidate(s) finished packaging during shutdown", settled.len());
    }
    for worker in workers {
        let name = worker.name().to_string();
        if let Err(e) = worker.stop() {
            log::error!("{} worker did not stop cleanly: {}", name, e);
        }
    }
    Ok(())
}

fn pace(loop_start: Instant, interval: Duration) {
    let spent = loop_start.elapsed();
    if spent < interval {
        std::thread::sleep(interval - spent);
    }
}

fn spawn_workers(
    cfg: &TrafficWitnessConfig,
    device_key: Option<VerifyingKey>,
) -> Result<Vec<WorkerHandle>> {
    let probe: Arc<dyn ConnectivityProbe> = match &cfg.services.connectivity_probe {
        Some(target) => Arc::new(TcpProbe::new(target, cfg.services.probe_timeout())),
        None => Arc::new(AlwaysOnline),
    };
    let mut handles = Vec::new();

    if let Some(url) = &cfg.services.verify_url {
        let service = http_verification(url, cfg)?;
        let mut worker = VerificationWorker::new(
            WitnessStore::open(&cfg.db_path)?,
            service,
            probe.clone(),
            cfg.workers.clone(),
        )
        .with_device_key(device_key);
        handles.push(spawn_periodic(
            "verification",
            Duration::from_secs(cfg.workers.verification_interval_secs.max(1)),
            move || worker.run_verification_cycle().map(|_| ()),
        )?);
    } else {
        log::warn!("no verification endpoint configured; verification items stay queued");
    }

    let transport: Arc<dyn DeliveryTransport> = match &cfg.services.delivery_url {
        Some(url) => http_delivery(url, cfg)?,
        None => {
            log::info!(
                "no delivery endpoint configured; spooling reports to {}",
                cfg.services.outbox_dir.display()
            );
            Arc::new(SpoolTransport::new(cfg.services.outbox_dir.clone()))
        }
    };
    let renderer = TextReportRenderer {
        device: cfg.device_name.clone(),
    };
    let mut worker = DeliveryWorker::new(
        WitnessStore::open(&cfg.db_path)?,
        transport,
        Box::new(renderer),
        probe,
        cfg.workers.clone(),
    )
    .with_device_key(device_key);
    handles.push(spawn_periodic(
        "delivery",
        Duration::from_secs(cfg.workers.delivery_interval_secs.max(1)),
        move || worker.run_delivery_cycle().map(|_| ()),
    )?);
    Ok(handles)
}

#[cfg(feature = "http-transport")]
fn http_verification(
    url: &str,
    cfg: &TrafficWitnessConfig,
) -> Result<Arc<dyn traffic_witness::VerificationService>> {
    Ok(Arc::new(traffic_witness::transport::HttpVerificationService::new(
        url,
        cfg.services.api_token.clone(),
        cfg.workers.call_timeout(),
    )))
}

#[cfg(not(feature = "http-transport"))]
fn http_verification(
    _url: &str,
    _cfg: &TrafficWitnessConfig,
) -> Result<Arc<dyn traffic_witness::VerificationService>> {
    Err(anyhow!("verify_url requires the http-transport feature"))
}

#[cfg(feature = "http-transport")]
fn http_delivery(url: &str, cfg: &TrafficWitnessConfig) -> Result<Arc<dyn DeliveryTransport>> {
    Ok(Arc::new(traffic_witness::transport::HttpDeliveryTransport::new(
        url,
        cfg.services.api_token.clone(),
        cfg.workers.call_timeout(),
    )))
}

#[cfg(not(feature = "http-transport"))]
fn http_delivery(_url: &str, _cfg: &TrafficWitnessConfig) -> Result<Arc<dyn DeliveryTransport>> {
    Err(anyhow!("delivery_url requires the http-transport feature"))
}
