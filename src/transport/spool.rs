use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::{DeliveryTransport, Report, ServiceError};

/// Writes each report to `<outbox>/<violation_id>.json` for an external
/// mailer or uploader to pick up. Rewriting the same report is harmless.
pub struct SpoolTransport {
    outbox: PathBuf,
}

impl SpoolTransport {
    pub fn new(outbox: impl Into<PathBuf>) -> Self {
        Self {
            outbox: outbox.into(),
        }
    }

    pub fn outbox(&self) -> &Path {
        &self.outbox
    }

    fn write(&self, report: &Report) -> std::io::Result<()> {
        fs::create_dir_all(&self.outbox)?;
        let bytes = serde_json::to_vec_pretty(report)?;
        let path = self.outbox.join(format!("{}.json", report.violation_id));
        let tmp = path.with_extension("json.tmp");
        let mut file = fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)
    }
}

impl DeliveryTransport for SpoolTransport {
    fn name(&self) -> &str {
        "spool"
    }

    fn send(&self, report: &Report) -> Result<(), ServiceError> {
        // Disk full or a missing mount may clear up; treat as retryable.
        self.write(report)
            .map_err(|e| ServiceError::Retryable(format!("outbox write failed: {}", e)))
    }
}
