//! Queue workers.
//!
//! Workers drain the durable queues on their own threads, each with its own
//! store connection. Every external call is bounded by a timeout; a timeout
//! is a retryable failure. Nothing here is ever called from the frame loop.

mod delivery;
mod report;
mod verification;

pub use crate::store::RetryPolicy;
pub use delivery::DeliveryWorker;
pub use report::{ReportRenderer, TextReportRenderer};
pub use verification::VerificationWorker;

use anyhow::{anyhow, Result};
use ed25519_dalek::VerifyingKey;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::evidence::{release_dir, EvidenceError, EvidencePacket};
use crate::now_ms;
use crate::store::{QueueItem, QueueKind, QueueStatus, ViolationRecord, WitnessStore};
use crate::transport::ServiceError;

const STOP_POLL: Duration = Duration::from_millis(100);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Items claimed per cycle.
    pub batch_size: usize,
    pub call_timeout_secs: u64,
    pub verification_interval_secs: u64,
    pub delivery_interval_secs: u64,
    /// Rolling-hour cap on delivered reports; 0 disables the cap.
    pub max_deliveries_per_hour: u32,
    pub retry: RetryPolicy,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            call_timeout_secs: 30,
            verification_interval_secs: 15,
            delivery_interval_secs: 30,
            max_deliveries_per_hour: 20,
            retry: RetryPolicy::default(),
        }
    }
}

impl WorkerSettings {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs.max(1))
    }
}

/// Outcome counts for one worker cycle.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub rejected: usize,
    pub retried: usize,
    pub failed: usize,
    pub released: usize,
    pub offline: bool,
    pub rate_limited: bool,
}

/// Run `call` on a helper thread and wait at most `timeout` for it. A call
/// that overruns is abandoned and reported as retryable.
pub fn call_with_timeout<T, F>(timeout: Duration, call: F) -> Result<T, ServiceError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ServiceError> + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("external-call".to_string())
        .spawn(move || {
            let _ = tx.send(call());
        })
        .map_err(|e| ServiceError::Retryable(format!("failed to start call thread: {}", e)))?;
    match rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(mpsc::RecvTimeoutError::Timeout) => Err(ServiceError::Retryable(format!(
            "call timed out after {:?}",
            timeout
        ))),
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            Err(ServiceError::Retryable("call thread panicked".to_string()))
        }
    }
}

/// Load and verify the packet behind a violation record, against the device
/// key when one is known. Any failure here is a data-integrity failure.
fn load_verified_packet(
    record: &ViolationRecord,
    device_key: Option<&VerifyingKey>,
) -> Result<EvidencePacket, EvidenceError> {
    let packet = EvidencePacket::load_dir(&record.evidence_dir).map_err(as_evidence_error)?;
    packet.verify(device_key)?;
    Ok(packet)
}

/// An item whose processing errored before it was settled goes back to the
/// queue as a retry, so one bad item never strands the rest of the batch.
/// Items that did settle first are left as they are.
fn requeue_errored(
    store: &mut WitnessStore,
    queue: QueueKind,
    item: &QueueItem,
    err: &anyhow::Error,
    max_attempts: u32,
    report: &mut CycleReport,
) {
    error!(
        "{} item {} ({}) errored: {:#}",
        queue.as_str(),
        item.id,
        item.violation_id,
        err
    );
    let message = format!("processing error: {}", err);
    match now_ms().and_then(|now| store.mark_retry(queue, item.id, &message, now, max_attempts)) {
        Ok(Some(QueueStatus::Failed)) => report.failed += 1,
        Ok(Some(_)) => report.retried += 1,
        Ok(None) => {}
        Err(e) => error!(
            "{} item {} left for startup recovery: {}",
            queue.as_str(),
            item.id,
            e
        ),
    }
}

fn as_evidence_error(err: anyhow::Error) -> EvidenceError {
    match err.downcast::<EvidenceError>() {
        Ok(e) => e,
        Err(other) => EvidenceError::CorruptMetadata(other.to_string()),
    }
}

/// Delete evidence directories of settled violations that are still on
/// disk. Returns how many were released.
fn release_settled(store: &mut WitnessStore, limit: usize) -> Result<usize> {
    let mut released = 0;
    for (violation_id, dir) in store.unreleased_settled(limit)? {
        match release_dir(&dir) {
            Ok(()) => {
                store.mark_evidence_released(&violation_id)?;
                released += 1;
            }
            Err(e) => warn!("evidence release for {} deferred: {}", violation_id, e),
        }
    }
    Ok(released)
}

// -------------------- Scheduling --------------------

pub struct WorkerHandle {
    name: String,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, |j| j.is_finished())
    }

    /// Signal the worker and wait for its current cycle to finish.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("{} worker thread panicked", self.name))?;
        }
        Ok(())
    }
}

/// Run `job` every `interval` on a named thread until stopped. Job errors
/// are logged and the schedule continues.
pub fn spawn_periodic<F>(name: &str, interval: Duration, mut job: F) -> Result<WorkerHandle>
where
    F: FnMut() -> Result<()> + Send + 'static,
{
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_thread = shutdown.clone();
    let thread_name = name.to_string();
    let join = thread::Builder::new()
        .name(format!("{}-worker", name))
        .spawn(move || {
            info!("{} worker started (every {:?})", thread_name, interval);
            while !shutdown_thread.load(Ordering::SeqCst) {
                if let Err(e) = job() {
                    error!("{} cycle failed: {}", thread_name, e);
                }
                let next = Instant::now() + interval;
                while Instant::now() < next && !shutdown_thread.load(Ordering::SeqCst) {
                    thread::sleep(STOP_POLL.min(interval));
                }
            }
            info!("{} worker stopped", thread_name);
        })?;
    Ok(WorkerHandle {
        name: name.to_string(),
        shutdown,
        join: Some(join),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn slow_call_times_out_as_retryable() {
        let result: Result<(), ServiceError> = call_with_timeout(Duration::from_millis(50), || {
            thread::sleep(Duration::from_millis(500));
            Ok(())
        });
        let err = result.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.message().contains("timed out"));
    }

    #[test]
    fn fast_call_passes_result_through() {
        let ok = call_with_timeout(Duration::from_secs(1), || Ok(7)).unwrap();
        assert_eq!(ok, 7);
        let fatal: Result<u8, _> =
            call_with_timeout(Duration::from_secs(1), || Err(ServiceError::Fatal("auth".into())));
        assert_eq!(fatal.unwrap_err(), ServiceError::Fatal("auth".into()));
    }

    #[test]
    fn periodic_job_runs_until_stopped() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let handle = spawn_periodic("test", Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("errors do not stop the schedule"))
        })
        .unwrap();
        thread::sleep(Duration::from_millis(100));
        handle.stop().unwrap();
        let seen = runs.load(Ordering::SeqCst);
        assert!(seen >= 2, "ran {} times", seen);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(runs.load(Ordering::SeqCst), seen);
    }
}
