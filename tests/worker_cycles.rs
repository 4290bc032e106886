use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use ed25519_dalek::SigningKey;

use traffic_witness::evidence::{signing_key_from_seed, EvidenceSettings};
use traffic_witness::store::ViolationStatus;
use traffic_witness::transport::{
    AlwaysOnline, ConnectivityProbe, Report, VerificationRequest, VerificationVerdict,
};
use traffic_witness::worker::{TextReportRenderer, WorkerSettings};
use traffic_witness::{
    ActionTier, BoundingBox, CandidateStatus, DeliveryTransport, DeliveryWorker, Detection,
    EvidencePackager, FrameSnapshot, ObjectClass, QueueKind, QueueStatus, RetryPolicy,
    ServiceError, VerificationService, VerificationWorker, ViolationCandidate, ViolationKind,
    WitnessStore,
};

// -------------------- Fakes --------------------

#[derive(Default)]
struct ScriptedTransport {
    script: Mutex<VecDeque<Result<(), ServiceError>>>,
    sent: Mutex<Vec<Report>>,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    fn failing(results: Vec<Result<(), ServiceError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(results.into()),
            ..Self::default()
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl DeliveryTransport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    fn send(&self, report: &Report) -> Result<(), ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front().unwrap_or(Ok(()));
        if next.is_ok() {
            self.sent.lock().unwrap().push(report.clone());
        }
        next
    }
}

struct ScriptedVerifier {
    verdict: Result<VerificationVerdict, ServiceError>,
    delay: Duration,
    calls: AtomicUsize,
}

impl ScriptedVerifier {
    fn new(verdict: Result<VerificationVerdict, ServiceError>) -> Arc<Self> {
        Arc::new(Self {
            verdict,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }
}

impl VerificationService for ScriptedVerifier {
    fn name(&self) -> &str {
        "scripted"
    }

    fn verify(&self, request: &VerificationRequest) -> Result<VerificationVerdict, ServiceError> {
        assert!(!request.image.is_empty());
        self.calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.verdict.clone()
    }
}

struct Offline;

impl ConnectivityProbe for Offline {
    fn is_online(&self) -> bool {
        false
    }
}

// -------------------- Fixtures --------------------

struct Env {
    dir: TempDir,
    db: String,
}

impl Env {
    fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = dir
            .path()
            .join("witness.db")
            .to_str()
            .expect("utf8 path")
            .to_string();
        Self { dir, db }
    }

    fn store(&self) -> WitnessStore {
        WitnessStore::open(&self.db).expect("open store")
    }

    fn evidence_root(&self) -> PathBuf {
        self.dir.path().join("evidence")
    }

    /// Package and register one unsigned violation; returns its id.
    fn seed(&self, id: &str, queue: QueueKind) -> String {
        self.seed_signed(id, queue, None)
    }

    fn seed_signed(&self, id: &str, queue: QueueKind, signer: Option<SigningKey>) -> String {
        let packager = EvidencePackager::new(
            EvidenceSettings {
                evidence_dir: self.evidence_root(),
                video_enabled: false,
                ..EvidenceSettings::default()
            },
            signer,
        );
        let window: Vec<Arc<FrameSnapshot>> = (1..=3u64)
            .map(|n| {
                Arc::new(
                    FrameSnapshot::blank(n, 1_000 + n * 100, 32, 24).with_detections(vec![
                        Detection::new(
                            ObjectClass::Car,
                            BoundingBox::new(0.3, 0.6, 0.5, 0.9),
                            0.9,
                            n,
                            1_000 + n * 100,
                        )
                        .with_track(3),
                    ]),
                )
            })
            .collect();
        let tier = match queue {
            QueueKind::Verification => ActionTier::Verify,
            QueueKind::Delivery => ActionTier::ReportDirectly,
        };
        let candidate = ViolationCandidate {
            kind: ViolationKind::RedLightJump,
            confidence: 0.9,
            tier,
            track_id: 3,
            supporting_frames: vec![1, 2, 3],
            plate_text: Some("KA01AB1234".to_string()),
            plate_confidence: Some(0.8),
            gps: None,
            created_at_ms: 1_300,
            consecutive_frames: 3,
            status: CandidateStatus::Emitted,
        };
        let packet = packager.package(id, &candidate, &window).expect("package");
        self.store()
            .register_packet(&candidate, &packet, queue, 1_300, None)
            .expect("register");
        id.to_string()
    }
}

fn settings() -> WorkerSettings {
    WorkerSettings {
        call_timeout_secs: 1,
        retry: RetryPolicy {
            max_attempts: 5,
            backoff_base_secs: 2,
            backoff_cap_secs: 0,
        },
        ..WorkerSettings::default()
    }
}

fn delivery_worker(
    env: &Env,
    transport: Arc<ScriptedTransport>,
    probe: Arc<dyn ConnectivityProbe>,
    settings: WorkerSettings,
) -> DeliveryWorker {
    DeliveryWorker::new(
        env.store(),
        transport,
        Box::new(TextReportRenderer {
            device: Some("dashcam-01".to_string()),
        }),
        probe,
        settings,
    )
}

fn verification_worker(env: &Env, service: Arc<ScriptedVerifier>) -> VerificationWorker {
    VerificationWorker::new(env.store(), service, Arc::new(AlwaysOnline), settings())
}

fn queue_status(store: &WitnessStore, queue: QueueKind, id: &str) -> QueueStatus {
    store
        .item_for_violation(queue, id)
        .expect("query")
        .expect("queued")
        .status
}

fn violation_status(store: &WitnessStore, id: &str) -> ViolationStatus {
    store.violation(id).expect("query").expect("violation").status
}

fn packet_dir(env: &Env, id: &str) -> PathBuf {
    env.evidence_root().join(id)
}

fn corrupt(path: &Path) {
    let mut bytes = std::fs::read(path).expect("read artifact");
    let mid = bytes.len() / 2;
    bytes[mid] ^= 0xff;
    std::fs::write(path, bytes).expect("write artifact");
}

// -------------------- Delivery --------------------

#[test]
fn delivered_item_is_sent_once_and_evidence_released() {
    let env = Env::new();
    let id = env.seed("v-deliver", QueueKind::Delivery);
    let transport = ScriptedTransport::failing(Vec::new());
    let mut worker = delivery_worker(&env, transport.clone(), Arc::new(AlwaysOnline), settings());

    let first = worker.run_delivery_cycle().expect("cycle");
    assert_eq!(first.claimed, 1);
    assert_eq!(first.succeeded, 1);
    let second = worker.run_delivery_cycle().expect("cycle");
    assert_eq!(second.claimed, 0);
    assert_eq!(transport.calls(), 1);

    let sent = transport.sent.lock().unwrap();
    assert_eq!(sent[0].violation_id, id);
    assert!(sent[0].subject.contains(&id));
    assert!(!sent[0].attachments.is_empty());

    let store = env.store();
    assert_eq!(queue_status(&store, QueueKind::Delivery, &id), QueueStatus::Done);
    assert_eq!(violation_status(&store, &id), ViolationStatus::Delivered);
    assert!(!packet_dir(&env, &id).exists());
    assert!(store
        .evidence_files(&id)
        .expect("files")
        .iter()
        .all(|f| f.released));
}

#[test]
fn retryable_failures_exhaust_attempts_then_stop() {
    let env = Env::new();
    let id = env.seed("v-retry", QueueKind::Delivery);
    let transport = ScriptedTransport::failing(
        (0..10)
            .map(|_| Err(ServiceError::Retryable("HTTP 503: unavailable".to_string())))
            .collect(),
    );
    let mut worker = delivery_worker(&env, transport.clone(), Arc::new(AlwaysOnline), settings());

    for attempt in 1..=5u32 {
        let report = worker.run_delivery_cycle().expect("cycle");
        assert_eq!(report.claimed, 1, "attempt {}", attempt);
        let item = env
            .store()
            .item_for_violation(QueueKind::Delivery, &id)
            .expect("query")
            .expect("queued");
        assert_eq!(item.attempts, attempt);
        if attempt < 5 {
            assert_eq!(item.status, QueueStatus::Pending);
            assert_eq!(report.retried, 1);
        } else {
            assert_eq!(item.status, QueueStatus::Failed);
            assert_eq!(report.failed, 1);
        }
    }
    for _ in 0..3 {
        assert_eq!(worker.run_delivery_cycle().expect("cycle").claimed, 0);
    }
    assert_eq!(transport.calls(), 5);
    let store = env.store();
    assert_eq!(violation_status(&store, &id), ViolationStatus::Failed);
    assert_eq!(
        store.last_queue_error().expect("query").as_deref(),
        Some("HTTP 503: unavailable")
    );
}

#[test]
fn backoff_holds_item_until_due() {
    let env = Env::new();
    let id = env.seed("v-backoff", QueueKind::Delivery);
    let transport = ScriptedTransport::failing(vec![Err(ServiceError::Retryable(
        "connection reset".to_string(),
    ))]);
    let mut slow = settings();
    slow.retry.backoff_cap_secs = 300;
    let mut worker = delivery_worker(&env, transport.clone(), Arc::new(AlwaysOnline), slow);

    assert_eq!(worker.run_delivery_cycle().expect("cycle").retried, 1);
    assert_eq!(worker.run_delivery_cycle().expect("cycle").claimed, 0);
    assert_eq!(transport.calls(), 1);
    assert_eq!(
        queue_status(&env.store(), QueueKind::Delivery, &id),
        QueueStatus::Pending
    );
}

#[test]
fn auth_failure_is_terminal_without_retry() {
    let env = Env::new();
    let id = env.seed("v-auth", QueueKind::Delivery);
    let transport =
        ScriptedTransport::failing(vec![Err(ServiceError::from_status(401, "unauthorized"))]);
    let mut worker = delivery_worker(&env, transport.clone(), Arc::new(AlwaysOnline), settings());

    let report = worker.run_delivery_cycle().expect("cycle");
    assert_eq!(report.failed, 1);
    assert_eq!(worker.run_delivery_cycle().expect("cycle").claimed, 0);
    assert_eq!(transport.calls(), 1);

    let store = env.store();
    let item = store
        .item_for_violation(QueueKind::Delivery, &id)
        .expect("query")
        .expect("queued");
    assert_eq!(item.status, QueueStatus::Failed);
    assert_eq!(item.attempts, 1);
    assert_eq!(violation_status(&store, &id), ViolationStatus::Failed);
}

#[test]
fn tampered_evidence_raises_alarm_and_is_never_sent() {
    let env = Env::new();
    let id = env.seed("v-tamper", QueueKind::Delivery);
    corrupt(&packet_dir(&env, &id).join("frame_00.jpg"));
    let transport = ScriptedTransport::failing(Vec::new());
    let mut worker = delivery_worker(&env, transport.clone(), Arc::new(AlwaysOnline), settings());

    let report = worker.run_delivery_cycle().expect("cycle");
    assert_eq!(report.failed, 1);
    assert_eq!(transport.calls(), 0);

    let store = env.store();
    assert_eq!(queue_status(&store, QueueKind::Delivery, &id), QueueStatus::Failed);
    let alarms = store.alarms(10).expect("alarms");
    assert_eq!(alarms.len(), 1);
    assert_eq!(alarms[0].code, "EVIDENCE_HASH_MISMATCH");
    assert!(alarms[0].message.contains(&id));
}

#[test]
fn erroring_item_does_not_strand_the_rest_of_the_batch() {
    let env = Env::new();
    let broken = env.seed("v-a-broken", QueueKind::Delivery);
    let healthy = env.seed("v-b-healthy", QueueKind::Delivery);
    corrupt(&packet_dir(&env, &broken).join("frame_00.jpg"));
    let transport = ScriptedTransport::failing(Vec::new());
    let mut worker = delivery_worker(&env, transport.clone(), Arc::new(AlwaysOnline), settings());

    // Raising the integrity alarm for the first item now errors mid-item.
    rusqlite::Connection::open(&env.db)
        .expect("open db")
        .execute_batch("DROP TABLE alarms")
        .expect("drop alarms");

    let report = worker.run_delivery_cycle().expect("cycle survives the item");
    assert_eq!(report.claimed, 2);
    assert_eq!(report.succeeded, 1);
    assert_eq!(transport.calls(), 1);

    let store = env.store();
    assert_eq!(queue_status(&store, QueueKind::Delivery, &broken), QueueStatus::Failed);
    assert_eq!(queue_status(&store, QueueKind::Delivery, &healthy), QueueStatus::Done);
    assert_eq!(
        store.queue_stats(QueueKind::Delivery).expect("stats").processing,
        0
    );
}

#[test]
fn packet_signed_by_another_device_is_refused() {
    let env = Env::new();
    let device = signing_key_from_seed("dashcam-01-seed").expect("device key");
    let foreign = signing_key_from_seed("someone-else").expect("foreign key");
    let forged = env.seed_signed("v-forged", QueueKind::Delivery, Some(foreign));
    let genuine = env.seed_signed("v-genuine", QueueKind::Delivery, Some(device.clone()));
    let transport = ScriptedTransport::failing(Vec::new());
    let mut worker = delivery_worker(&env, transport.clone(), Arc::new(AlwaysOnline), settings())
        .with_device_key(Some(device.verifying_key()));

    let report = worker.run_delivery_cycle().expect("cycle");
    assert_eq!(report.failed, 1);
    assert_eq!(report.succeeded, 1);
    assert_eq!(transport.calls(), 1);
    assert_eq!(transport.sent.lock().unwrap()[0].violation_id, genuine);

    let store = env.store();
    assert_eq!(queue_status(&store, QueueKind::Delivery, &forged), QueueStatus::Failed);
    let alarms = store.alarms(10).expect("alarms");
    assert_eq!(alarms.len(), 1);
    assert_eq!(alarms[0].code, "EVIDENCE_BAD_SIGNATURE");
    assert!(alarms[0].message.contains(&forged));
}

#[test]
fn offline_cycle_leaves_queue_untouched() {
    let env = Env::new();
    let id = env.seed("v-offline", QueueKind::Delivery);
    let transport = ScriptedTransport::failing(Vec::new());
    let mut worker = delivery_worker(&env, transport.clone(), Arc::new(Offline), settings());

    let report = worker.run_delivery_cycle().expect("cycle");
    assert!(report.offline);
    assert_eq!(report.claimed, 0);
    assert_eq!(transport.calls(), 0);
    let item = env
        .store()
        .item_for_violation(QueueKind::Delivery, &id)
        .expect("query")
        .expect("queued");
    assert_eq!(item.status, QueueStatus::Pending);
    assert_eq!(item.attempts, 0);
}

#[test]
fn hourly_delivery_cap_defers_the_rest() {
    let env = Env::new();
    for n in 0..3 {
        env.seed(&format!("v-cap-{}", n), QueueKind::Delivery);
    }
    let transport = ScriptedTransport::failing(Vec::new());
    let capped = WorkerSettings {
        max_deliveries_per_hour: 2,
        ..settings()
    };
    let mut worker = delivery_worker(&env, transport.clone(), Arc::new(AlwaysOnline), capped);

    let first = worker.run_delivery_cycle().expect("cycle");
    assert_eq!(first.succeeded, 2);
    let second = worker.run_delivery_cycle().expect("cycle");
    assert!(second.rate_limited);
    assert_eq!(second.claimed, 0);
    assert_eq!(transport.calls(), 2);
    assert_eq!(
        env.store()
            .queue_stats(QueueKind::Delivery)
            .expect("stats")
            .pending,
        1
    );
}

#[test]
fn interrupted_item_is_recovered_after_restart() {
    let env = Env::new();
    let id = env.seed("v-crash", QueueKind::Delivery);
    {
        let mut store = env.store();
        let claimed = store
            .claim(QueueKind::Delivery, 10, 2_000, &RetryPolicy::default())
            .expect("claim");
        assert_eq!(claimed.len(), 1);
        // Dropped mid-flight without settling.
    }
    let mut store = env.store();
    assert_eq!(
        queue_status(&store, QueueKind::Delivery, &id),
        QueueStatus::Processing
    );
    assert_eq!(store.recover_interrupted(3_000).expect("recover"), 1);
    let item = store
        .item_for_violation(QueueKind::Delivery, &id)
        .expect("query")
        .expect("queued");
    assert_eq!(item.status, QueueStatus::Pending);
    assert_eq!(item.attempts, 0);

    let transport = ScriptedTransport::failing(Vec::new());
    let mut worker = delivery_worker(&env, transport.clone(), Arc::new(AlwaysOnline), settings());
    assert_eq!(worker.run_delivery_cycle().expect("cycle").succeeded, 1);
    assert_eq!(transport.calls(), 1);
    assert_eq!(violation_status(&env.store(), &id), ViolationStatus::Delivered);
}

// -------------------- Verification --------------------

#[test]
fn confirmed_violation_moves_to_delivery_with_corrected_plate() {
    let env = Env::new();
    let id = env.seed("v-confirm", QueueKind::Verification);
    let verifier = ScriptedVerifier::new(Ok(VerificationVerdict {
        is_violation: true,
        confidence: 0.93,
        corrected_plate: Some("ka 05 mn 4321".to_string()),
    }));
    let mut worker = verification_worker(&env, verifier.clone());

    let report = worker.run_verification_cycle().expect("cycle");
    assert_eq!(report.succeeded, 1);
    assert_eq!(verifier.calls.load(Ordering::SeqCst), 1);

    let store = env.store();
    assert_eq!(
        queue_status(&store, QueueKind::Verification, &id),
        QueueStatus::Done
    );
    assert_eq!(
        queue_status(&store, QueueKind::Delivery, &id),
        QueueStatus::Pending
    );
    let record = store.violation(&id).expect("query").expect("violation");
    assert_eq!(record.status, ViolationStatus::Verified);
    assert_eq!(record.plate_text.as_deref(), Some("KA05MN4321"));
    assert!(packet_dir(&env, &id).exists());
}

#[test]
fn rejected_violation_is_closed_and_evidence_released() {
    let env = Env::new();
    let id = env.seed("v-reject", QueueKind::Verification);
    let verifier = ScriptedVerifier::new(Ok(VerificationVerdict {
        is_violation: false,
        confidence: 0.88,
        corrected_plate: None,
    }));
    let mut worker = verification_worker(&env, verifier);

    let report = worker.run_verification_cycle().expect("cycle");
    assert_eq!(report.rejected, 1);

    let store = env.store();
    assert_eq!(violation_status(&store, &id), ViolationStatus::Rejected);
    assert!(store
        .item_for_violation(QueueKind::Delivery, &id)
        .expect("query")
        .is_none());
    assert!(!packet_dir(&env, &id).exists());
}

#[test]
fn slow_verifier_times_out_as_retry() {
    let env = Env::new();
    let id = env.seed("v-slow", QueueKind::Verification);
    let verifier = Arc::new(ScriptedVerifier {
        verdict: Ok(VerificationVerdict {
            is_violation: true,
            confidence: 0.9,
            corrected_plate: None,
        }),
        delay: Duration::from_millis(1_500),
        calls: AtomicUsize::new(0),
    });
    let mut worker = verification_worker(&env, verifier);

    let report = worker.run_verification_cycle().expect("cycle");
    assert_eq!(report.retried, 1);
    let item = env
        .store()
        .item_for_violation(QueueKind::Verification, &id)
        .expect("query")
        .expect("queued");
    assert_eq!(item.status, QueueStatus::Pending);
    assert_eq!(item.attempts, 1);
    assert!(item.last_error.unwrap_or_default().contains("timed out"));
}

#[test]
fn verification_skips_direct_reports() {
    let env = Env::new();
    let id = env.seed("v-direct", QueueKind::Delivery);
    let verifier = ScriptedVerifier::new(Err(ServiceError::Fatal("unused".to_string())));
    let mut worker = verification_worker(&env, verifier.clone());

    assert_eq!(worker.run_verification_cycle().expect("cycle").claimed, 0);
    assert_eq!(verifier.calls.load(Ordering::SeqCst), 0);
    assert_eq!(violation_status(&env.store(), &id), ViolationStatus::Verified);
}
