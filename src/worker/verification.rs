use anyhow::Result;
use ed25519_dalek::VerifyingKey;
use log::{error, info, warn};
use std::sync::Arc;

use super::{
    call_with_timeout, load_verified_packet, release_settled, requeue_errored, CycleReport,
    WorkerSettings,
};
use crate::plate::clean_plate_text;
use crate::store::{QueueItem, QueueKind, QueueStatus, WitnessStore};
use crate::transport::{ConnectivityProbe, ServiceError, VerificationRequest, VerificationService};
use crate::now_ms;

/// Drains the verification queue through a second-opinion service.
pub struct VerificationWorker {
    store: WitnessStore,
    service: Arc<dyn VerificationService>,
    probe: Arc<dyn ConnectivityProbe>,
    settings: WorkerSettings,
    device_key: Option<VerifyingKey>,
}

impl VerificationWorker {
    pub fn new(
        store: WitnessStore,
        service: Arc<dyn VerificationService>,
        probe: Arc<dyn ConnectivityProbe>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store,
            service,
            probe,
            settings,
            device_key: None,
        }
    }

    /// Require packets to carry a valid signature by this device key.
    pub fn with_device_key(mut self, key: Option<VerifyingKey>) -> Self {
        self.device_key = key;
        self
    }

    pub fn store(&self) -> &WitnessStore {
        &self.store
    }

    pub fn run_verification_cycle(&mut self) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        if !self.probe.is_online() {
            report.offline = true;
            return Ok(report);
        }
        report.released = release_settled(&mut self.store, self.settings.batch_size)?;
        let items = self.store.claim(
            QueueKind::Verification,
            self.settings.batch_size,
            now_ms()?,
            &self.settings.retry,
        )?;
        report.claimed = items.len();
        for item in items {
            if let Err(e) = self.process(&item, &mut report) {
                requeue_errored(
                    &mut self.store,
                    QueueKind::Verification,
                    &item,
                    &e,
                    self.settings.retry.max_attempts,
                    &mut report,
                );
            }
        }
        if report.claimed > 0 {
            info!(
                "verification cycle: {} claimed, {} confirmed, {} rejected, {} retried, {} failed",
                report.claimed, report.succeeded, report.rejected, report.retried, report.failed
            );
        }
        Ok(report)
    }

    fn process(&mut self, item: &QueueItem, report: &mut CycleReport) -> Result<()> {
        let Some(record) = self.store.violation(&item.violation_id)? else {
            self.fail_integrity(item, "VIOLATION_MISSING", "violation record not found")?;
            report.failed += 1;
            return Ok(());
        };
        let packet = match load_verified_packet(&record, self.device_key.as_ref()) {
            Ok(packet) => packet,
            Err(e) => {
                self.fail_integrity(item, e.code(), &e.to_string())?;
                report.failed += 1;
                return Ok(());
            }
        };
        let image = match packet.best_frame_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                self.fail_integrity(item, "EVIDENCE_UNREADABLE", &e.to_string())?;
                report.failed += 1;
                return Ok(());
            }
        };

        let request = VerificationRequest {
            violation_id: record.id.clone(),
            kind: record.kind,
            image,
        };
        let service = self.service.clone();
        let outcome = call_with_timeout(self.settings.call_timeout(), move || {
            service.verify(&request)
        });
        let now = now_ms()?;
        match outcome {
            Ok(verdict) if verdict.is_violation => {
                let corrected = verdict
                    .corrected_plate
                    .as_deref()
                    .map(clean_plate_text)
                    .filter(|p| !p.is_empty());
                if self.store.confirm_and_forward(
                    item.id,
                    &item.violation_id,
                    corrected.as_deref(),
                    now,
                )? {
                    info!(
                        "{} confirmed by {} ({:.2})",
                        item.violation_id,
                        self.service.name(),
                        verdict.confidence
                    );
                    report.succeeded += 1;
                }
            }
            Ok(_) => {
                if self.store.reject(item.id, &item.violation_id, now)? {
                    info!("{} rejected by {}", item.violation_id, self.service.name());
                    match packet.release() {
                        Ok(()) => {
                            self.store.mark_evidence_released(&item.violation_id)?;
                            report.released += 1;
                        }
                        Err(e) => warn!("{}", e),
                    }
                    report.rejected += 1;
                }
            }
            Err(ServiceError::Retryable(message)) => {
                match self.store.mark_retry(
                    QueueKind::Verification,
                    item.id,
                    &message,
                    now,
                    self.settings.retry.max_attempts,
                )? {
                    Some(QueueStatus::Failed) => {
                        error!(
                            "verification of {} failed permanently: {}",
                            item.violation_id, message
                        );
                        report.failed += 1;
                    }
                    Some(_) => {
                        warn!("verification of {} will retry: {}", item.violation_id, message);
                        report.retried += 1;
                    }
                    None => {}
                }
            }
            Err(ServiceError::Fatal(message)) => {
                error!("verification of {} failed: {}", item.violation_id, message);
                if self
                    .store
                    .mark_failed(QueueKind::Verification, item.id, &message, now)?
                {
                    report.failed += 1;
                }
            }
        }
        Ok(())
    }

    fn fail_integrity(&mut self, item: &QueueItem, code: &str, message: &str) -> Result<()> {
        let now = now_ms()?;
        error!("{}: {} ({})", code, message, item.violation_id);
        self.store.mark_failed(QueueKind::Verification, item.id, message, now)?;
        self.store.log_alarm(
            code,
            &format!("{}: {}", item.violation_id, message),
            now,
        )
    }
}
