use anyhow::Result;

use crate::evidence::EvidencePacket;
use crate::store::ViolationRecord;
use crate::transport::{Attachment, Report};

/// Turns a delivered violation into the report sent by the transport.
pub trait ReportRenderer: Send {
    fn render(&self, record: &ViolationRecord, packet: &EvidencePacket) -> Result<Report>;
}

/// Plain-text report with the evidence frames attached.
#[derive(Clone, Debug, Default)]
pub struct TextReportRenderer {
    /// Device name shown in the footer.
    pub device: Option<String>,
}

impl TextReportRenderer {
    pub fn subject(record: &ViolationRecord) -> String {
        format!(
            "[Traffic Violation] {} - {}",
            record.kind.display_name(),
            record.id
        )
    }

    fn body(&self, record: &ViolationRecord, packet: &EvidencePacket) -> String {
        let mut lines = vec![
            format!("Violation: {}", record.kind.display_name()),
            format!("Reference: {}", record.id),
            format!("Confidence: {:.1}%", record.confidence * 100.0),
            format!("Detected at (unix ms): {}", record.created_ms),
            format!(
                "Plate: {}",
                record.plate_text.as_deref().unwrap_or("not read")
            ),
        ];
        match record.gps {
            Some(gps) => {
                let heading = gps
                    .heading_deg
                    .map_or_else(|| "unknown".to_string(), |h| format!("{:.0} deg", h));
                lines.push(format!(
                    "Location: {:.6}, {:.6} (heading {}, {:.1} km/h)",
                    gps.latitude, gps.longitude, heading, gps.speed_kmh
                ));
                lines.push(format!("Map: {}", gps.maps_url()));
            }
            None => lines.push("Location: unavailable".to_string()),
        }
        lines.push(format!(
            "Evidence: {} frame(s){}",
            packet.frames().count(),
            if packet.video().is_some() {
                " + video clip"
            } else {
                ""
            }
        ));
        lines.push(String::new());
        lines.push(packet.metadata.caption.clone());
        if let Some(device) = &self.device {
            lines.push(format!("Reported by {}", device));
        }
        lines.join("\n")
    }
}

impl ReportRenderer for TextReportRenderer {
    fn render(&self, record: &ViolationRecord, packet: &EvidencePacket) -> Result<Report> {
        let mut attachments = Vec::new();
        for artifact in packet.frames() {
            attachments.push(Attachment {
                name: artifact.name.clone(),
                content_type: "image/jpeg".to_string(),
                data: packet.read_artifact(artifact)?,
            });
        }
        Ok(Report {
            violation_id: record.id.clone(),
            subject: Self::subject(record),
            body: self.body(record, packet),
            attachments,
        })
    }
}
