//! Bounded, retried health probes.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::deadline::Deadline;
use crate::defaults::{default_health_retries, default_health_timeout};
use crate::error::{Error, HealthCheckFailedDetails, Result};
use crate::host::{self, Hosts};
use crate::ssh::{self, RemoteExecutor};
use crate::utils::shell::quote_arg;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKind {
    /// systemd unit is active
    Process,
    /// `host:port` accepts a connection (probed from the check's host)
    Tcp,
    /// URL answers 2xx or `expectStatus` (probed from the control machine)
    Http,
    /// `command` exits 0 on the check's host
    Dependency,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub name: String,
    pub kind: CheckKind,
    pub target: String,
    /// Host the probe runs on; defaults to the application host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expect_status: Option<u16>,
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_health_retries")]
    pub retries: u32,
}

impl HealthCheck {
    pub fn new(name: &str, kind: CheckKind, target: &str) -> Self {
        Self {
            name: name.to_string(),
            kind,
            target: target.to_string(),
            host: None,
            command: None,
            expect_status: None,
            timeout_secs: default_health_timeout(),
            retries: default_health_retries(),
        }
    }

    pub fn on_host(mut self, host: &str) -> Self {
        self.host = Some(host.to_string());
        self
    }

    pub fn with_command(mut self, command: &str) -> Self {
        self.command = Some(command.to_string());
        self
    }

    pub fn with_budget(mut self, timeout_secs: u64, retries: u32) -> Self {
        self.timeout_secs = timeout_secs;
        self.retries = retries;
        self
    }

    pub fn host_id(&self) -> &str {
        self.host.as_deref().unwrap_or(host::APP)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        match self.kind {
            CheckKind::Tcp if parse_endpoint(&self.target).is_none() => {
                problems.push(format!("check '{}': tcp target must be host:port", self.name))
            }
            CheckKind::Http
                if !(self.target.starts_with("http://") || self.target.starts_with("https://")) =>
            {
                problems.push(format!("check '{}': http target must be a URL", self.name))
            }
            CheckKind::Dependency if self.command.is_none() => {
                problems.push(format!("check '{}': dependency check needs a command", self.name))
            }
            _ => {}
        }
        problems
    }
}

fn parse_endpoint(target: &str) -> Option<(&str, u16)> {
    let (host, port) = target.rsplit_once(':')?;
    let port = port.parse().ok()?;
    if host.is_empty() {
        return None;
    }
    Some((host, port))
}

/// One attempt at a check. `Ok(false)` is an unhealthy answer; `Err` means
/// the probe itself could not run. Both count as a failed attempt.
pub trait Probe: Send + Sync {
    fn probe(&self, check: &HealthCheck) -> Result<bool>;
}

/// Probes through the remote executor, HTTP from the control machine.
pub struct RemoteProbe<'a> {
    executor: &'a dyn RemoteExecutor,
    hosts: &'a Hosts,
    http: reqwest::blocking::Client,
}

impl<'a> RemoteProbe<'a> {
    pub fn new(executor: &'a dyn RemoteExecutor, hosts: &'a Hosts) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .user_agent(format!("keel/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::internal_io(e.to_string(), Some("create HTTP client".to_string())))?;
        Ok(Self {
            executor,
            hosts,
            http,
        })
    }

    fn on_host(&self, check: &HealthCheck, command: &str) -> Result<bool> {
        let host = self.hosts.get(check.host_id())?;
        let bounded = format!("timeout {} {}", check.timeout().as_secs(), command);
        ssh::test(self.executor, host, &bounded)
    }
}

impl Probe for RemoteProbe<'_> {
    fn probe(&self, check: &HealthCheck) -> Result<bool> {
        match check.kind {
            CheckKind::Process => self.on_host(
                check,
                &format!("systemctl is-active --quiet {}", quote_arg(&check.target)),
            ),
            CheckKind::Tcp => {
                let (addr, port) = parse_endpoint(&check.target).ok_or_else(|| {
                    Error::config_invalid_value(
                        format!("checks.{}.target", check.name),
                        Some(check.target.clone()),
                        "expected host:port",
                    )
                })?;
                let script = format!("exec 3<>/dev/tcp/{}/{}", addr, port);
                self.on_host(check, &format!("bash -c {}", quote_arg(&script)))
            }
            CheckKind::Dependency => {
                let command = check.command.as_deref().unwrap_or(&check.target);
                self.on_host(check, &format!("sh -c {}", quote_arg(command)))
            }
            CheckKind::Http => {
                let response = self
                    .http
                    .get(&check.target)
                    .timeout(check.timeout())
                    .send()
                    .map_err(|e| {
                        Error::internal_io(e.to_string(), Some(format!("GET {}", check.target)))
                    })?;
                let status = response.status();
                Ok(match check.expect_status {
                    Some(expected) => status.as_u16() == expected,
                    None => status.is_success(),
                })
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub name: String,
    pub kind: CheckKind,
    pub target: String,
    pub passed: bool,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub duration_ms: u128,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub passed: bool,
    pub results: Vec<CheckResult>,
}

impl HealthReport {
    pub fn first_failure(&self) -> Option<&CheckResult> {
        self.results.iter().find(|r| !r.passed)
    }

    /// Turn a failed report into a verification error.
    pub fn into_result(self) -> Result<HealthReport> {
        let Some(failed) = self.first_failure() else {
            return Ok(self);
        };
        let err = Error::health_check_failed(HealthCheckFailedDetails {
            check: failed.name.clone(),
            target: failed.target.clone(),
            attempts: failed.attempts,
            last_error: failed.last_error.clone(),
        });
        let results = serde_json::to_value(&self.results).unwrap_or_default();
        Err(err.with_detail("results", results))
    }
}

pub struct HealthVerifier<'a> {
    probe: &'a dyn Probe,
    backoff: Duration,
    deadline: Deadline,
}

impl<'a> HealthVerifier<'a> {
    pub fn new(probe: &'a dyn Probe, backoff: Duration) -> Self {
        Self {
            probe,
            backoff,
            deadline: Deadline::none(),
        }
    }

    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    /// Up to `retries` attempts (at least one) with a fixed backoff. Retries
    /// stop early once the deadline has passed.
    pub fn check(&self, check: &HealthCheck) -> CheckResult {
        let started = Instant::now();
        let budget = check.retries.max(1);
        let mut attempts = 0;
        let mut last_error = None;
        let mut passed = false;

        while attempts < budget {
            if attempts > 0 {
                if self.deadline.expired() {
                    break;
                }
                std::thread::sleep(self.deadline.clamp(self.backoff));
            }
            attempts += 1;

            match self.probe.probe(check) {
                Ok(true) => {
                    passed = true;
                    break;
                }
                Ok(false) => {
                    last_error = None;
                }
                Err(e) => {
                    last_error = Some(e.to_string());
                }
            }
            tracing::debug!(check = %check.name, attempt = attempts, budget, "health probe failed");
        }

        if passed {
            tracing::info!(check = %check.name, attempts, "healthy");
        } else {
            tracing::warn!(check = %check.name, attempts, error = ?last_error, "unhealthy");
            log_status!("health", "{} failed after {} attempt(s)", check.name, attempts);
        }

        CheckResult {
            name: check.name.clone(),
            kind: check.kind,
            target: check.target.clone(),
            passed,
            attempts,
            last_error,
            duration_ms: started.elapsed().as_millis(),
        }
    }

    /// Logical AND in order, stopping at the first check that fails its full budget.
    pub fn check_all(&self, checks: &[HealthCheck]) -> HealthReport {
        let mut results = Vec::with_capacity(checks.len());
        for check in checks {
            let result = self.check(check);
            let passed = result.passed;
            results.push(result);
            if !passed {
                return HealthReport {
                    passed: false,
                    results,
                };
            }
        }
        HealthReport {
            passed: true,
            results,
        }
    }

    pub fn require(&self, checks: &[HealthCheck]) -> Result<HealthReport> {
        self.check_all(checks).into_result()
    }
}
