use anyhow::Result;
use ed25519_dalek::VerifyingKey;
use log::{error, info, warn};
use std::collections::VecDeque;
use std::sync::Arc;

use super::{
    call_with_timeout, load_verified_packet, release_settled, requeue_errored, CycleReport,
    ReportRenderer, WorkerSettings,
};
use crate::store::{QueueItem, QueueKind, QueueStatus, WitnessStore};
use crate::transport::{ConnectivityProbe, DeliveryTransport, ServiceError};
use crate::now_ms;

const HOUR_MS: u64 = 3_600_000;

/// Drains the delivery queue: render, send, then release evidence.
pub struct DeliveryWorker {
    store: WitnessStore,
    transport: Arc<dyn DeliveryTransport>,
    renderer: Box<dyn ReportRenderer>,
    probe: Arc<dyn ConnectivityProbe>,
    settings: WorkerSettings,
    device_key: Option<VerifyingKey>,
    /// Send times within the last hour, oldest first.
    sent: VecDeque<u64>,
}

impl DeliveryWorker {
    pub fn new(
        store: WitnessStore,
        transport: Arc<dyn DeliveryTransport>,
        renderer: Box<dyn ReportRenderer>,
        probe: Arc<dyn ConnectivityProbe>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store,
            transport,
            renderer,
            probe,
            settings,
            device_key: None,
            sent: VecDeque::new(),
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

    /// Sends still allowed in the current rolling hour.
    fn send_budget(&mut self, now: u64) -> usize {
        while self
            .sent
            .front()
            .is_some_and(|t| now.saturating_sub(*t) >= HOUR_MS)
        {
            self.sent.pop_front();
        }
        match self.settings.max_deliveries_per_hour {
            0 => usize::MAX,
            cap => (cap as usize).saturating_sub(self.sent.len()),
        }
    }

    pub fn run_delivery_cycle(&mut self) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        if !self.probe.is_online() {
            report.offline = true;
            return Ok(report);
        }
        report.released = release_settled(&mut self.store, self.settings.batch_size)?;
        let now = now_ms()?;
        let budget = self.send_budget(now);
        if budget == 0 {
            report.rate_limited = true;
            return Ok(report);
        }
        let items = self.store.claim(
            QueueKind::Delivery,
            self.settings.batch_size.min(budget),
            now,
            &self.settings.retry,
        )?;
        report.claimed = items.len();
        for item in items {
            if let Err(e) = self.process(&item, &mut report) {
                requeue_errored(
                    &mut self.store,
                    QueueKind::Delivery,
                    &item,
                    &e,
                    self.settings.retry.max_attempts,
                    &mut report,
                );
            }
        }
        if report.claimed > 0 {
            info!(
                "delivery cycle: {} claimed, {} delivered, {} retried, {} failed",
                report.claimed, report.succeeded, report.retried, report.failed
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
        let rendered = match self.renderer.render(&record, &packet) {
            Ok(r) => r,
            Err(e) => {
                self.fail_integrity(item, "REPORT_RENDER_FAILED", &e.to_string())?;
                report.failed += 1;
                return Ok(());
            }
        };

        let transport = self.transport.clone();
        let outcome = call_with_timeout(self.settings.call_timeout(), move || {
            transport.send(&rendered)
        });
        let now = now_ms()?;
        match outcome {
            Ok(()) => {
                self.sent.push_back(now);
                if self.store.mark_delivered(item.id, &item.violation_id, now)? {
                    info!(
                        "{} delivered via {}",
                        item.violation_id,
                        self.transport.name()
                    );
                    report.succeeded += 1;
                    match packet.release() {
                        Ok(()) => {
                            self.store.mark_evidence_released(&item.violation_id)?;
                            report.released += 1;
                        }
                        Err(e) => warn!("{}", e),
                    }
                }
            }
            Err(ServiceError::Retryable(message)) => {
                match self.store.mark_retry(
                    QueueKind::Delivery,
                    item.id,
                    &message,
                    now,
                    self.settings.retry.max_attempts,
                )? {
                    Some(QueueStatus::Failed) => {
                        error!(
                            "delivery of {} failed permanently: {}",
                            item.violation_id, message
                        );
                        report.failed += 1;
                    }
                    Some(_) => {
                        warn!("delivery of {} will retry: {}", item.violation_id, message);
                        report.retried += 1;
                    }
                    None => {}
                }
            }
            Err(ServiceError::Fatal(message)) => {
                error!("delivery of {} failed: {}", item.violation_id, message);
                if self
                    .store
                    .mark_failed(QueueKind::Delivery, item.id, &message, now)?
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
        self.store.mark_failed(QueueKind::Delivery, item.id, message, now)?;
        self.store.log_alarm(
            code,
            &format!("{}: {}", item.violation_id, message),
            now,
        )
    }
}
