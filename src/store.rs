//! Durable violation store and work queues (SQLite, WAL).
//!
//! Each actor (frame loop, verification worker, delivery worker, CLI) opens
//! its own connection to the same database file. Every state change is a
//! single transaction, and queue updates only apply to rows in the state the
//! caller claimed, so a racing or repeated update is a no-op.
//!
//! Queue item lifecycle:
//!
//! ```text
//! pending ──claim──▶ processing ──▶ done
//!    ▲                   │
//!    └──retry / recover──┤
//!                        └──────▶ failed
//! ```

use anyhow::{anyhow, Result};
use log::{info, warn};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use ed25519_dalek::VerifyingKey;

use crate::evidence::EvidencePacket;
use crate::{open_db_connection, ActionTier, GpsFix, ViolationCandidate, ViolationKind};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

fn to_i64(v: u64) -> Result<i64> {
    i64::try_from(v).map_err(|_| anyhow!("value {} exceeds i64 range", v))
}

fn to_u64(v: i64) -> u64 {
    u64::try_from(v).unwrap_or(0)
}

// -------------------- Retry policy --------------------

/// Exponential backoff in seconds: `min(cap, base^attempts)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_base_secs: 2,
            backoff_cap_secs: 300,
        }
    }
}

impl RetryPolicy {
    pub fn backoff_secs(&self, attempts: u32) -> u64 {
        if attempts == 0 {
            return 0;
        }
        self.backoff_base_secs
            .checked_pow(attempts)
            .unwrap_or(u64::MAX)
            .min(self.backoff_cap_secs)
    }

    /// Whether an item with `attempts` failures, last tried at
    /// `last_attempt_ms`, may be retried at `now_ms`.
    pub fn is_due(&self, attempts: u32, last_attempt_ms: Option<u64>, now_ms: u64) -> bool {
        match last_attempt_ms {
            None => true,
            Some(last) => {
                now_ms.saturating_sub(last) >= self.backoff_secs(attempts).saturating_mul(1000)
            }
        }
    }
}

// -------------------- Records --------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    Verification,
    Delivery,
}

impl QueueKind {
    pub const ALL: [QueueKind; 2] = [QueueKind::Verification, QueueKind::Delivery];

    fn table(&self) -> &'static str {
        match self {
            QueueKind::Verification => "verification_queue",
            QueueKind::Delivery => "delivery_queue",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueKind::Verification => "verification",
            QueueKind::Delivery => "delivery",
        }
    }

    /// Queue a freshly packaged candidate of this tier enters.
    pub fn for_tier(tier: ActionTier) -> Option<QueueKind> {
        match tier {
            ActionTier::ReportDirectly => Some(QueueKind::Delivery),
            ActionTier::Verify => Some(QueueKind::Verification),
            ActionTier::Discard => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    Processing,
    Done,
    Failed,
}

impl QueueStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Done => "done",
            QueueStatus::Failed => "failed",
        }
    }
}

impl FromStr for QueueStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(QueueStatus::Pending),
            "processing" => Ok(QueueStatus::Processing),
            "done" => Ok(QueueStatus::Done),
            "failed" => Ok(QueueStatus::Failed),
            other => Err(anyhow!("unknown queue status: {}", other)),
        }
    }
}

/// Violation lifecycle: `pending → verified | rejected`, `verified →
/// delivered | failed`. Directly reported candidates start as `verified`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationStatus {
    Pending,
    Verified,
    Rejected,
    Delivered,
    Failed,
}

impl ViolationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationStatus::Pending => "pending",
            ViolationStatus::Verified => "verified",
            ViolationStatus::Rejected => "rejected",
            ViolationStatus::Delivered => "delivered",
            ViolationStatus::Failed => "failed",
        }
    }
}

impl FromStr for ViolationStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ViolationStatus::Pending),
            "verified" => Ok(ViolationStatus::Verified),
            "rejected" => Ok(ViolationStatus::Rejected),
            "delivered" => Ok(ViolationStatus::Delivered),
            "failed" => Ok(ViolationStatus::Failed),
            other => Err(anyhow!("unknown violation status: {}", other)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueueItem {
    pub id: i64,
    pub queue: QueueKind,
    pub violation_id: String,
    pub status: QueueStatus,
    pub attempts: u32,
    pub last_attempt_ms: Option<u64>,
    pub last_error: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ViolationRecord {
    pub id: String,
    pub kind: ViolationKind,
    pub confidence: f32,
    pub tier: String,
    pub track_id: u64,
    pub plate_text: Option<String>,
    pub plate_confidence: Option<f32>,
    pub gps: Option<GpsFix>,
    pub created_ms: u64,
    pub consecutive_frames: u32,
    pub status: ViolationStatus,
    pub evidence_dir: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct EvidenceFileRecord {
    pub violation_id: String,
    pub name: String,
    pub kind: String,
    pub path: PathBuf,
    pub sha256: String,
    pub size: u64,
    pub released: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub done: u64,
    pub failed: u64,
}

impl QueueStats {
    /// Items not yet settled.
    pub fn depth(&self) -> u64 {
        self.pending + self.processing
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AlarmRecord {
    pub id: i64,
    pub created_ms: u64,
    pub code: String,
    pub message: String,
}

// -------------------- Store --------------------

pub struct WitnessStore {
    conn: Connection,
    db_path: String,
}

impl WitnessStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let mut store = Self {
            conn,
            db_path: db_path.to_string(),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    /// A second, independent connection to the same database.
    pub fn reopen(&self) -> Result<Self> {
        Self::open(&self.db_path)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=FULL;
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS violations (
              id TEXT PRIMARY KEY,
              kind TEXT NOT NULL,
              confidence REAL NOT NULL,
              tier TEXT NOT NULL,
              track_id INTEGER NOT NULL,
              plate_text TEXT,
              plate_confidence REAL,
              gps_lat REAL,
              gps_lon REAL,
              gps_heading REAL,
              gps_speed_kmh REAL,
              gps_fix_quality INTEGER,
              created_ms INTEGER NOT NULL,
              consecutive_frames INTEGER NOT NULL,
              status TEXT NOT NULL,
              evidence_dir TEXT NOT NULL,
              updated_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS evidence_files (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              violation_id TEXT NOT NULL REFERENCES violations(id),
              name TEXT NOT NULL,
              kind TEXT NOT NULL,
              path TEXT NOT NULL,
              sha256 TEXT NOT NULL,
              size INTEGER NOT NULL,
              released INTEGER NOT NULL DEFAULT 0,
              UNIQUE(violation_id, name)
            );

            CREATE TABLE IF NOT EXISTS verification_queue (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              violation_id TEXT NOT NULL UNIQUE REFERENCES violations(id),
              status TEXT NOT NULL,
              attempts INTEGER NOT NULL DEFAULT 0,
              last_attempt_ms INTEGER,
              last_error TEXT,
              created_ms INTEGER NOT NULL,
              updated_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS delivery_queue (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              violation_id TEXT NOT NULL UNIQUE REFERENCES violations(id),
              status TEXT NOT NULL,
              attempts INTEGER NOT NULL DEFAULT 0,
              last_attempt_ms INTEGER,
              last_error TEXT,
              created_ms INTEGER NOT NULL,
              updated_ms INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS alarms (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              created_ms INTEGER NOT NULL,
              code TEXT NOT NULL,
              message TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_verification_status ON verification_queue(status);
            CREATE INDEX IF NOT EXISTS idx_delivery_status ON delivery_queue(status);
            CREATE INDEX IF NOT EXISTS idx_violations_status ON violations(status);
            "#,
        )?;
        Ok(())
    }

    /// Record a verified packet and enqueue it, all in one transaction.
    /// The packet is re-verified from disk first (against `trusted` when the
    /// device signs), so a row never points at evidence that was not durably
    /// written.
    pub fn register_packet(
        &mut self,
        candidate: &ViolationCandidate,
        packet: &EvidencePacket,
        queue: QueueKind,
        now_ms: u64,
        trusted: Option<&VerifyingKey>,
    ) -> Result<()> {
        packet.verify(trusted)?;
        let status = match queue {
            QueueKind::Verification => ViolationStatus::Pending,
            QueueKind::Delivery => ViolationStatus::Verified,
        };
        let now = to_i64(now_ms)?;
        let gps = candidate.gps.and_then(GpsFix::sanitized);
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            r#"
            INSERT INTO violations(
              id, kind, confidence, tier, track_id, plate_text, plate_confidence,
              gps_lat, gps_lon, gps_heading, gps_speed_kmh, gps_fix_quality,
              created_ms, consecutive_frames, status, evidence_dir, updated_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
            "#,
            params![
                packet.violation_id,
                candidate.kind.as_str(),
                candidate.confidence as f64,
                candidate.tier.as_str(),
                to_i64(candidate.track_id)?,
                candidate.plate_text,
                candidate.plate_confidence.map(f64::from),
                gps.map(|g| g.latitude),
                gps.map(|g| g.longitude),
                gps.and_then(|g| g.heading_deg),
                gps.map(|g| g.speed_kmh),
                gps.map(|g| g.fix_quality as i64),
                to_i64(candidate.created_at_ms)?,
                candidate.consecutive_frames as i64,
                status.as_str(),
                packet.dir.to_string_lossy(),
                now,
            ],
        )?;
        for artifact in &packet.metadata.artifacts {
            tx.execute(
                r#"
                INSERT INTO evidence_files(violation_id, name, kind, path, sha256, size)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
                params![
                    packet.violation_id,
                    artifact.name,
                    artifact.kind.as_str(),
                    packet.path_of(artifact).to_string_lossy(),
                    artifact.sha256,
                    to_i64(artifact.size)?,
                ],
            )?;
        }
        tx.execute(
            &format!(
                "INSERT INTO {}(violation_id, status, attempts, created_ms, updated_ms) VALUES (?1, 'pending', 0, ?2, ?2)",
                queue.table()
            ),
            params![packet.violation_id, now],
        )?;
        tx.commit()?;
        info!(
            "registered {} ({}) on {} queue",
            packet.violation_id,
            candidate.kind,
            queue.as_str()
        );
        Ok(())
    }

    /// Claim up to `limit` pending items whose backoff has elapsed, oldest
    /// first, moving them to `processing`.
    pub fn claim(
        &mut self,
        queue: QueueKind,
        limit: usize,
        now_ms: u64,
        policy: &RetryPolicy,
    ) -> Result<Vec<QueueItem>> {
        let now = to_i64(now_ms)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let candidates = {
            let mut stmt = tx.prepare(&format!(
                "SELECT id, violation_id, attempts, last_attempt_ms, last_error FROM {} WHERE status = 'pending' ORDER BY id",
                queue.table()
            ))?;
            let rows = stmt.query_map([], |row| {
                Ok(QueueItem {
                    id: row.get(0)?,
                    queue,
                    violation_id: row.get(1)?,
                    status: QueueStatus::Pending,
                    attempts: row.get::<_, i64>(2)?.max(0) as u32,
                    last_attempt_ms: row.get::<_, Option<i64>>(3)?.map(to_u64),
                    last_error: row.get(4)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        let mut claimed = Vec::new();
        for mut item in candidates {
            if claimed.len() >= limit {
                break;
            }
            if !policy.is_due(item.attempts, item.last_attempt_ms, now_ms) {
                continue;
            }
            tx.execute(
                &format!(
                    "UPDATE {} SET status = 'processing', last_attempt_ms = ?1, updated_ms = ?1 WHERE id = ?2 AND status = 'pending'",
                    queue.table()
                ),
                params![now, item.id],
            )?;
            item.status = QueueStatus::Processing;
            item.last_attempt_ms = Some(now_ms);
            claimed.push(item);
        }
        tx.commit()?;
        Ok(claimed)
    }

    /// `processing → done`. Returns false if the item was not processing.
    pub fn mark_done(&mut self, queue: QueueKind, item_id: i64, now_ms: u64) -> Result<bool> {
        let changed = self.conn.execute(
            &format!(
                "UPDATE {} SET status = 'done', last_error = NULL, updated_ms = ?1 WHERE id = ?2 AND status = 'processing'",
                queue.table()
            ),
            params![to_i64(now_ms)?, item_id],
        )?;
        Ok(changed == 1)
    }

    /// Record a retryable failure. The item returns to `pending`, or becomes
    /// `failed` (with its violation) once `max_attempts` is reached.
    /// Returns the new status, or None if the item was not processing.
    pub fn mark_retry(
        &mut self,
        queue: QueueKind,
        item_id: i64,
        error: &str,
        now_ms: u64,
        max_attempts: u32,
    ) -> Result<Option<QueueStatus>> {
        let now = to_i64(now_ms)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let attempts: Option<i64> = tx
            .query_row(
                &format!(
                    "SELECT attempts FROM {} WHERE id = ?1 AND status = 'processing'",
                    queue.table()
                ),
                params![item_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(attempts) = attempts else {
            return Ok(None);
        };
        let attempts = attempts + 1;
        let status = if attempts >= i64::from(max_attempts.max(1)) {
            QueueStatus::Failed
        } else {
            QueueStatus::Pending
        };
        tx.execute(
            &format!(
                "UPDATE {} SET status = ?1, attempts = ?2, last_error = ?3, updated_ms = ?4 WHERE id = ?5",
                queue.table()
            ),
            params![status.as_str(), attempts, error, now, item_id],
        )?;
        if status == QueueStatus::Failed {
            Self::fail_violation(&tx, queue, item_id, now)?;
        }
        tx.commit()?;
        Ok(Some(status))
    }

    /// `processing → failed` without retry. Returns false if not processing.
    pub fn mark_failed(
        &mut self,
        queue: QueueKind,
        item_id: i64,
        error: &str,
        now_ms: u64,
    ) -> Result<bool> {
        let now = to_i64(now_ms)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            &format!(
                "UPDATE {} SET status = 'failed', attempts = attempts + 1, last_error = ?1, updated_ms = ?2 WHERE id = ?3 AND status = 'processing'",
                queue.table()
            ),
            params![error, now, item_id],
        )?;
        if changed == 1 {
            Self::fail_violation(&tx, queue, item_id, now)?;
        }
        tx.commit()?;
        Ok(changed == 1)
    }

    fn fail_violation(
        tx: &rusqlite::Transaction<'_>,
        queue: QueueKind,
        item_id: i64,
        now: i64,
    ) -> Result<()> {
        tx.execute(
            &format!(
                "UPDATE violations SET status = 'failed', updated_ms = ?1 WHERE id = (SELECT violation_id FROM {} WHERE id = ?2)",
                queue.table()
            ),
            params![now, item_id],
        )?;
        Ok(())
    }

    /// Verification confirmed: close the verification item, mark the
    /// violation verified (applying a corrected plate) and enqueue delivery.
    pub fn confirm_and_forward(
        &mut self,
        item_id: i64,
        violation_id: &str,
        corrected_plate: Option<&str>,
        now_ms: u64,
    ) -> Result<bool> {
        let now = to_i64(now_ms)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE verification_queue SET status = 'done', last_error = NULL, updated_ms = ?1 WHERE id = ?2 AND status = 'processing'",
            params![now, item_id],
        )?;
        if changed == 0 {
            return Ok(false);
        }
        tx.execute(
            "UPDATE violations SET status = 'verified', plate_text = COALESCE(?1, plate_text), updated_ms = ?2 WHERE id = ?3",
            params![corrected_plate, now, violation_id],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO delivery_queue(violation_id, status, attempts, created_ms, updated_ms) VALUES (?1, 'pending', 0, ?2, ?2)",
            params![violation_id, now],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// Verification rejected: close the item and mark the violation rejected.
    pub fn reject(&mut self, item_id: i64, violation_id: &str, now_ms: u64) -> Result<bool> {
        let now = to_i64(now_ms)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE verification_queue SET status = 'done', updated_ms = ?1 WHERE id = ?2 AND status = 'processing'",
            params![now, item_id],
        )?;
        if changed == 1 {
            tx.execute(
                "UPDATE violations SET status = 'rejected', updated_ms = ?1 WHERE id = ?2",
                params![now, violation_id],
            )?;
        }
        tx.commit()?;
        Ok(changed == 1)
    }

    /// Delivery succeeded: close the item and mark the violation delivered.
    pub fn mark_delivered(&mut self, item_id: i64, violation_id: &str, now_ms: u64) -> Result<bool> {
        let now = to_i64(now_ms)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = tx.execute(
            "UPDATE delivery_queue SET status = 'done', last_error = NULL, updated_ms = ?1 WHERE id = ?2 AND status = 'processing'",
            params![now, item_id],
        )?;
        if changed == 1 {
            tx.execute(
                "UPDATE violations SET status = 'delivered', updated_ms = ?1 WHERE id = ?2",
                params![now, violation_id],
            )?;
        }
        tx.commit()?;
        Ok(changed == 1)
    }

    /// Return every `processing` item to `pending` without charging an
    /// attempt. Run once at startup, before any worker claims.
    pub fn recover_interrupted(&mut self, now_ms: u64) -> Result<usize> {
        let now = to_i64(now_ms)?;
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut recovered = 0;
        for queue in QueueKind::ALL {
            recovered += tx.execute(
                &format!(
                    "UPDATE {} SET status = 'pending', updated_ms = ?1 WHERE status = 'processing'",
                    queue.table()
                ),
                params![now],
            )?;
        }
        tx.commit()?;
        if recovered > 0 {
            warn!("recovered {} interrupted queue item(s) to pending", recovered);
        }
        Ok(recovered)
    }

    pub fn item(&self, queue: QueueKind, item_id: i64) -> Result<Option<QueueItem>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT id, violation_id, status, attempts, last_attempt_ms, last_error FROM {} WHERE id = ?1",
                    queue.table()
                ),
                params![item_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(id, violation_id, status, attempts, last, err)| {
            Ok(QueueItem {
                id,
                queue,
                violation_id,
                status: status.parse()?,
                attempts: attempts.max(0) as u32,
                last_attempt_ms: last.map(to_u64),
                last_error: err,
            })
        })
        .transpose()
    }

    pub fn item_for_violation(
        &self,
        queue: QueueKind,
        violation_id: &str,
    ) -> Result<Option<QueueItem>> {
        let id: Option<i64> = self
            .conn
            .query_row(
                &format!("SELECT id FROM {} WHERE violation_id = ?1", queue.table()),
                params![violation_id],
                |row| row.get(0),
            )
            .optional()?;
        match id {
            Some(id) => self.item(queue, id),
            None => Ok(None),
        }
    }

    pub fn queue_stats(&self, queue: QueueKind) -> Result<QueueStats> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT status, COUNT(*) FROM {} GROUP BY status",
            queue.table()
        ))?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        let mut stats = QueueStats::default();
        for row in rows {
            let (status, count) = row?;
            let count = to_u64(count);
            match status.parse::<QueueStatus>()? {
                QueueStatus::Pending => stats.pending = count,
                QueueStatus::Processing => stats.processing = count,
                QueueStatus::Done => stats.done = count,
                QueueStatus::Failed => stats.failed = count,
            }
        }
        Ok(stats)
    }

    /// Most recent error recorded on any queue item.
    pub fn last_queue_error(&self) -> Result<Option<String>> {
        let row: Option<String> = self
            .conn
            .query_row(
                r#"
                SELECT last_error FROM (
                  SELECT last_error, updated_ms FROM verification_queue WHERE last_error IS NOT NULL
                  UNION ALL
                  SELECT last_error, updated_ms FROM delivery_queue WHERE last_error IS NOT NULL
                ) ORDER BY updated_ms DESC LIMIT 1
                "#,
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row)
    }

    pub fn violation(&self, violation_id: &str) -> Result<Option<ViolationRecord>> {
        let row = self
            .conn
            .query_row(
                r#"
                SELECT id, kind, confidence, tier, track_id, plate_text, plate_confidence,
                       gps_lat, gps_lon, gps_heading, gps_speed_kmh, gps_fix_quality,
                       created_ms, consecutive_frames, status, evidence_dir
                FROM violations WHERE id = ?1
                "#,
                params![violation_id],
                |row| {
                    let gps = match (
                        row.get::<_, Option<f64>>(7)?,
                        row.get::<_, Option<f64>>(8)?,
                    ) {
                        (Some(latitude), Some(longitude)) => Some(GpsFix {
                            latitude,
                            longitude,
                            heading_deg: row.get::<_, Option<f64>>(9)?,
                            speed_kmh: row.get::<_, Option<f64>>(10)?.unwrap_or(0.0),
                            fix_quality: row.get::<_, Option<i64>>(11)?.unwrap_or(0).clamp(0, 255)
                                as u8,
                        }),
                        _ => None,
                    };
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<f64>>(6)?,
                        gps,
                        row.get::<_, i64>(12)?,
                        row.get::<_, i64>(13)?,
                        row.get::<_, String>(14)?,
                        row.get::<_, String>(15)?,
                    ))
                },
            )
            .optional()?;
        let Some((id, kind, conf, tier, track, plate, plate_conf, gps, created, frames, status, dir)) =
            row
        else {
            return Ok(None);
        };
        Ok(Some(ViolationRecord {
            id,
            kind: kind.parse()?,
            confidence: conf as f32,
            tier,
            track_id: to_u64(track),
            plate_text: plate,
            plate_confidence: plate_conf.map(|c| c as f32),
            gps,
            created_ms: to_u64(created),
            consecutive_frames: frames.clamp(0, i64::from(u32::MAX)) as u32,
            status: status.parse()?,
            evidence_dir: PathBuf::from(dir),
        }))
    }

    /// Most recently created violations, newest first.
    pub fn recent_violations(&self, limit: usize) -> Result<Vec<ViolationRecord>> {
        let ids = {
            let mut stmt = self
                .conn
                .prepare("SELECT id FROM violations ORDER BY created_ms DESC, id DESC LIMIT ?1")?;
            let rows = stmt.query_map(params![to_i64(limit as u64)?], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.violation(&id)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub fn set_violation_status(
        &mut self,
        violation_id: &str,
        status: ViolationStatus,
        now_ms: u64,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE violations SET status = ?1, updated_ms = ?2 WHERE id = ?3",
            params![status.as_str(), to_i64(now_ms)?, violation_id],
        )?;
        Ok(())
    }

    pub fn evidence_files(&self, violation_id: &str) -> Result<Vec<EvidenceFileRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT violation_id, name, kind, path, sha256, size, released FROM evidence_files WHERE violation_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![violation_id], |row| {
            Ok(EvidenceFileRecord {
                violation_id: row.get(0)?,
                name: row.get(1)?,
                kind: row.get(2)?,
                path: PathBuf::from(row.get::<_, String>(3)?),
                sha256: row.get(4)?,
                size: to_u64(row.get(5)?),
                released: row.get::<_, i64>(6)? != 0,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn mark_evidence_released(&mut self, violation_id: &str) -> Result<usize> {
        Ok(self.conn.execute(
            "UPDATE evidence_files SET released = 1 WHERE violation_id = ?1 AND released = 0",
            params![violation_id],
        )?)
    }

    /// Settled violations (delivered or rejected) whose evidence is still on
    /// disk, e.g. after a crash between settling and release.
    pub fn unreleased_settled(&self, limit: usize) -> Result<Vec<(String, PathBuf)>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT DISTINCT v.id, v.evidence_dir FROM violations v
            JOIN evidence_files f ON f.violation_id = v.id
            WHERE v.status IN ('delivered', 'rejected') AND f.released = 0
            ORDER BY v.id LIMIT ?1
            "#,
        )?;
        let rows = stmt.query_map(params![to_i64(limit as u64)?], |row| {
            Ok((row.get::<_, String>(0)?, PathBuf::from(row.get::<_, String>(1)?)))
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn log_alarm(&mut self, code: &str, message: &str, now_ms: u64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO alarms(created_ms, code, message) VALUES (?1, ?2, ?3)",
            params![to_i64(now_ms)?, code, message],
        )?;
        Ok(())
    }

    pub fn alarms(&self, limit: usize) -> Result<Vec<AlarmRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, created_ms, code, message FROM alarms ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![to_i64(limit as u64)?], |row| {
            Ok(AlarmRecord {
                id: row.get(0)?,
                created_ms: to_u64(row.get(1)?),
                code: row.get(2)?,
                message: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}
