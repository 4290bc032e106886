use std::time::Duration;

use super::{
    DeliveryTransport, Report, ServiceError, VerificationRequest, VerificationService,
    VerificationVerdict,
};

fn agent(timeout: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new().timeout(timeout).build()
}

fn classify(err: ureq::Error) -> ServiceError {
    match err {
        ureq::Error::Status(code, response) => {
            let detail = response.into_string().unwrap_or_default();
            ServiceError::from_status(code, detail.trim())
        }
        ureq::Error::Transport(t) => ServiceError::Retryable(t.to_string()),
    }
}

/// Posts the best frame as `image/jpeg` and expects a JSON verdict.
pub struct HttpVerificationService {
    url: String,
    token: Option<String>,
    agent: ureq::Agent,
}

impl HttpVerificationService {
    pub fn new(url: &str, token: Option<String>, timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            token,
            agent: agent(timeout),
        }
    }
}

impl VerificationService for HttpVerificationService {
    fn name(&self) -> &str {
        "http"
    }

    fn verify(&self, request: &VerificationRequest) -> Result<VerificationVerdict, ServiceError> {
        let mut call = self
            .agent
            .post(&self.url)
            .set("Content-Type", "image/jpeg")
            .set("X-Violation-Id", &request.violation_id)
            .set("X-Violation-Kind", request.kind.as_str());
        if let Some(token) = &self.token {
            call = call.set("Authorization", &format!("Bearer {}", token));
        }
        let response = call.send_bytes(&request.image).map_err(classify)?;
        response
            .into_json::<VerificationVerdict>()
            .map_err(|e| ServiceError::Retryable(format!("unreadable verdict: {}", e)))
    }
}

/// Posts the rendered report as JSON.
pub struct HttpDeliveryTransport {
    url: String,
    token: Option<String>,
    agent: ureq::Agent,
}

impl HttpDeliveryTransport {
    pub fn new(url: &str, token: Option<String>, timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            token,
            agent: agent(timeout),
        }
    }
}

impl DeliveryTransport for HttpDeliveryTransport {
    fn name(&self) -> &str {
        "http"
    }

    fn send(&self, report: &Report) -> Result<(), ServiceError> {
        let body = serde_json::to_value(report)
            .map_err(|e| ServiceError::Fatal(format!("report encoding failed: {}", e)))?;
        let mut call = self.agent.post(&self.url);
        if let Some(token) = &self.token {
            call = call.set("Authorization", &format!("Bearer {}", token));
        }
        call.send_json(body).map_err(classify)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ViolationKind;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};

    /// Answers one request with `status` and a JSON `body`; yields the raw
    /// request it saw.
    fn serve_once(status: &str, body: &str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/submit", listener.local_addr().unwrap());
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream);
            let mut head = String::new();
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                    content_length = value.trim().parse().unwrap();
                }
                head.push_str(&line);
                if line == "\r\n" || line.is_empty() {
                    break;
                }
            }
            let mut body = vec![0u8; content_length];
            reader.read_exact(&mut body).unwrap();
            reader.get_mut().write_all(response.as_bytes()).unwrap();
            head + &String::from_utf8_lossy(&body)
        });
        (url, handle)
    }

    fn request() -> VerificationRequest {
        VerificationRequest {
            violation_id: "v-http".to_string(),
            kind: ViolationKind::NoHelmet,
            image: vec![0xff, 0xd8, 0xff, 0xd9],
        }
    }

    #[test]
    fn verdict_is_read_from_json_response() {
        let (url, server) = serve_once(
            "200 OK",
            r#"{"is_violation": true, "confidence": 0.91, "plate_text": "KA01AB1234"}"#,
        );
        let service =
            HttpVerificationService::new(&url, Some("secret".into()), Duration::from_secs(5));
        let verdict = service.verify(&request()).unwrap();
        assert!(verdict.is_violation);
        assert_eq!(verdict.corrected_plate.as_deref(), Some("KA01AB1234"));

        let seen = server.join().unwrap().to_ascii_lowercase();
        assert!(seen.starts_with("post /submit"));
        assert!(seen.contains("x-violation-kind: no_helmet"));
        assert!(seen.contains("authorization: bearer secret"));
    }

    #[test]
    fn report_is_posted_as_json() {
        let (url, server) = serve_once("200 OK", "{}");
        let transport = HttpDeliveryTransport::new(&url, None, Duration::from_secs(5));
        let report = Report {
            violation_id: "v-http".to_string(),
            subject: "No Helmet".to_string(),
            body: "details".to_string(),
            attachments: Vec::new(),
        };
        transport.send(&report).unwrap();

        let seen = server.join().unwrap();
        assert!(seen.to_ascii_lowercase().contains("content-type: application/json"));
        let json = &seen[seen.find('{').unwrap()..];
        let posted: Report = serde_json::from_str(json).unwrap();
        assert_eq!(posted, report);
    }

    #[test]
    fn status_codes_map_to_retry_classes() {
        let (url, server) = serve_once("503 Service Unavailable", r#"{"error":"busy"}"#);
        let err = HttpVerificationService::new(&url, None, Duration::from_secs(5))
            .verify(&request())
            .unwrap_err();
        assert!(err.is_retryable());
        assert!(err.message().starts_with("HTTP 503"));
        server.join().unwrap();

        let (url, server) = serve_once("401 Unauthorized", r#"{"error":"token"}"#);
        let err = HttpDeliveryTransport::new(&url, None, Duration::from_secs(5))
            .send(&Report {
                violation_id: "v".into(),
                subject: String::new(),
                body: String::new(),
                attachments: Vec::new(),
            })
            .unwrap_err();
        assert!(!err.is_retryable());
        server.join().unwrap();
    }
}
