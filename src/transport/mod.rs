//! Outbound collaborators: the second-opinion verification service and the
//! report delivery transport.
//!
//! Both return [`ServiceError`], which splits failures into retryable
//! (network, timeout, throttling, server errors) and fatal (auth, malformed
//! request). Workers map the first to a backoff retry and the second to a
//! terminal `failed` item.

#[cfg(feature = "http-transport")]
mod http;
mod spool;

#[cfg(feature = "http-transport")]
pub use http::{HttpDeliveryTransport, HttpVerificationService};
pub use spool::SpoolTransport;

use serde::{Deserialize, Serialize};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::ViolationKind;

// -------------------- Errors --------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServiceError {
    Retryable(String),
    Fatal(String),
}

impl ServiceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServiceError::Retryable(_))
    }

    pub fn message(&self) -> &str {
        match self {
            ServiceError::Retryable(m) | ServiceError::Fatal(m) => m,
        }
    }

    /// Classify an HTTP status. 408, 429 and 5xx are retryable; other 4xx
    /// (including 401/403) are fatal.
    pub fn from_status(status: u16, detail: &str) -> Self {
        let message = format!("HTTP {}: {}", status, detail);
        match status {
            408 | 429 => ServiceError::Retryable(message),
            s if s >= 500 => ServiceError::Retryable(message),
            _ => ServiceError::Fatal(message),
        }
    }
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceError::Retryable(m) => write!(f, "SERVICE_RETRYABLE: {}", m),
            ServiceError::Fatal(m) => write!(f, "SERVICE_FATAL: {}", m),
        }
    }
}

impl std::error::Error for ServiceError {}

// -------------------- Verification --------------------

#[derive(Clone, Debug, PartialEq)]
pub struct VerificationRequest {
    pub violation_id: String,
    pub kind: ViolationKind,
    /// Best evidence frame, JPEG encoded.
    pub image: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VerificationVerdict {
    pub is_violation: bool,
    #[serde(default)]
    pub confidence: f32,
    /// Plate text as read by the verifier, replacing the on-device read.
    #[serde(default, alias = "plate_text")]
    pub corrected_plate: Option<String>,
}

pub trait VerificationService: Send + Sync {
    fn name(&self) -> &str;

    fn verify(&self, request: &VerificationRequest) -> Result<VerificationVerdict, ServiceError>;
}

// -------------------- Delivery --------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub content_type: String,
    #[serde(with = "hex_bytes")]
    pub data: Vec<u8>,
}

/// A rendered violation report, ready to send.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub violation_id: String,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<Attachment>,
}

pub trait DeliveryTransport: Send + Sync {
    fn name(&self) -> &str;

    fn send(&self, report: &Report) -> Result<(), ServiceError>;
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}

// -------------------- Connectivity --------------------

/// Gates network work. Workers skip a cycle entirely while offline.
pub trait ConnectivityProbe: Send + Sync {
    fn is_online(&self) -> bool;
}

pub struct AlwaysOnline;

impl ConnectivityProbe for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }
}

/// TCP connect to `host:port` within a timeout.
pub struct TcpProbe {
    target: String,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(target: &str, timeout: Duration) -> Self {
        Self {
            target: target.to_string(),
            timeout,
        }
    }
}

impl ConnectivityProbe for TcpProbe {
    fn is_online(&self) -> bool {
        let addrs = match self.target.to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                log::debug!("connectivity probe cannot resolve {}: {}", self.target, e);
                return false;
            }
        };
        for addr in addrs {
            if TcpStream::connect_timeout(&addr, self.timeout).is_ok() {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn status_codes_split_retryable_and_fatal() {
        assert!(!ServiceError::from_status(401, "unauthorized").is_retryable());
        assert!(!ServiceError::from_status(403, "forbidden").is_retryable());
        assert!(!ServiceError::from_status(400, "bad request").is_retryable());
        assert!(ServiceError::from_status(429, "slow down").is_retryable());
        assert!(ServiceError::from_status(503, "unavailable").is_retryable());
        assert_eq!(
            ServiceError::from_status(401, "unauthorized").to_string(),
            "SERVICE_FATAL: HTTP 401: unauthorized"
        );
    }

    #[test]
    fn verdict_accepts_plate_text_alias() {
        let verdict: VerificationVerdict =
            serde_json::from_str(r#"{"is_violation":true,"confidence":0.9,"plate_text":"KA01AB0001"}"#)
                .unwrap();
        assert_eq!(verdict.corrected_plate.as_deref(), Some("KA01AB0001"));
    }

    #[test]
    fn report_attachments_survive_json() {
        let report = Report {
            violation_id: "v1".into(),
            subject: "s".into(),
            body: "b".into(),
            attachments: vec![Attachment {
                name: "frame_00.jpg".into(),
                content_type: "image/jpeg".into(),
                data: vec![0xFF, 0xD8, 0x00],
            }],
        };
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("ffd800"));
        let back: Report = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
    }

    #[test]
    fn tcp_probe_sees_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(TcpProbe::new(&addr.to_string(), Duration::from_secs(1)).is_online());
        drop(listener);
        assert!(!TcpProbe::new("missing-port", Duration::from_millis(100)).is_online());
    }
}
