//! Run notifications. Delivery failures are logged and never fail a run.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    PipelineStarted,
    PhaseFailed,
    PipelineFinished,
    DeployFinished,
    RotationCompleted,
    RotationFailed,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::PipelineStarted => "pipeline_started",
            Event::PhaseFailed => "phase_failed",
            Event::PipelineFinished => "pipeline_finished",
            Event::DeployFinished => "deploy_finished",
            Event::RotationCompleted => "rotation_completed",
            Event::RotationFailed => "rotation_failed",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub event: Event,
    pub status: String,
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    pub message: String,
    pub timestamp: String,
}

impl Notification {
    pub fn new(event: Event, run_id: &str, status: &str, message: impl Into<String>) -> Self {
        Self {
            event,
            status: status.to_string(),
            run_id: run_id.to_string(),
            phase: None,
            message: message.into(),
            timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        }
    }

    pub fn for_phase(mut self, phase: &str) -> Self {
        self.phase = Some(phase.to_string());
        self
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification);
}

/// Structured log line per notification; the sink when no webhook is configured.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, n: &Notification) {
        tracing::info!(
            event = %n.event,
            status = %n.status,
            run_id = %n.run_id,
            phase = n.phase.as_deref().unwrap_or("-"),
            "{}",
            n.message
        );
    }
}

/// POSTs each notification as JSON to a webhook URL.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::blocking::Client,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(format!("keel/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::internal_io(e.to_string(), Some("create HTTP client".to_string())))?;
        Ok(Self {
            url: url.to_string(),
            client,
        })
    }

    fn send(&self, n: &Notification) -> std::result::Result<(), String> {
        let response = self
            .client
            .post(&self.url)
            .json(n)
            .send()
            .map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("webhook answered {}", response.status()));
        }
        Ok(())
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, n: &Notification) {
        LogNotifier.notify(n);
        if let Err(e) = self.send(n) {
            tracing::warn!(event = %n.event, error = %e, "notification not delivered");
            log_status!("notify", "Could not deliver {} notification: {}", n.event, e);
        }
    }
}

/// Webhook sink when a URL is configured, log sink otherwise.
pub fn from_config(webhook_url: Option<&str>) -> Result<Box<dyn Notifier>> {
    match webhook_url {
        Some(url) if !url.is_empty() => Ok(Box::new(WebhookNotifier::new(url)?)),
        _ => Ok(Box::new(LogNotifier)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    #[test]
    fn notification_serializes_camel_case() {
        let n = Notification::new(Event::PhaseFailed, "r1", "failed", "boom").for_phase("deploy");
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["event"], "phase_failed");
        assert_eq!(json["runId"], "r1");
        assert_eq!(json["phase"], "deploy");
    }

    #[test]
    fn unreachable_webhook_is_not_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let notifier = WebhookNotifier::new(&format!("http://127.0.0.1:{}/hook", port)).unwrap();
        notifier.notify(&Notification::new(Event::PipelineStarted, "r1", "running", "start"));
    }

    #[test]
    fn webhook_receives_json_body() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            while !String::from_utf8_lossy(&request).contains("\"timestamp\"") {
                let n = stream.read(&mut buf).unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            stream
                .write_all(b"HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n")
                .unwrap();
            String::from_utf8_lossy(&request).to_string()
        });

        let notifier = WebhookNotifier::new(&format!("http://127.0.0.1:{}/hook", port)).unwrap();
        notifier.notify(&Notification::new(Event::RotationCompleted, "r2", "succeeded", "done"));

        let request = server.join().unwrap();
        assert!(request.starts_with("POST /hook"));
        assert!(request.contains("\"event\":\"rotation_completed\""));
    }
}
