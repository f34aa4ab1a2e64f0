//! Remote execution: one independent SSH invocation per call.

mod client;

pub use client::{is_transient_ssh_error, CommandOutput, SshClient};

use std::path::Path;
use std::time::Duration;

use crate::error::{Error, RemoteCommandFailedDetails, Result};
use crate::host::Host;

/// Runs commands and uploads files on a named host.
///
/// `Ok` carries the command's own outcome (including non-zero exits and
/// connection failures flagged in `transport_failure`); `Err` means the call
/// could not be attempted at all.
pub trait RemoteExecutor: Send + Sync {
    fn execute(&self, host: &Host, command: &str) -> Result<CommandOutput>;

    fn upload(&self, host: &Host, content: &[u8], remote_path: &str) -> Result<CommandOutput>;

    fn upload_file(&self, host: &Host, local_path: &Path, remote_path: &str) -> Result<CommandOutput> {
        let content = std::fs::read(local_path).map_err(|e| {
            Error::internal_io(e.to_string(), Some(format!("read {}", local_path.display())))
        })?;
        self.upload(host, &content, remote_path)
    }
}

/// Executor backed by the system `ssh` binary (local `sh` for localhost).
pub struct SshExecutor {
    connect_timeout_secs: u64,
}

impl SshExecutor {
    pub fn new(connect_timeout_secs: u64) -> Self {
        Self {
            connect_timeout_secs,
        }
    }
}

impl RemoteExecutor for SshExecutor {
    fn execute(&self, host: &Host, command: &str) -> Result<CommandOutput> {
        let client = SshClient::from_host(host, self.connect_timeout_secs)?;
        tracing::trace!(host = %host.id, bytes = command.len(), "execute");
        Ok(client.execute(command))
    }

    fn upload(&self, host: &Host, content: &[u8], remote_path: &str) -> Result<CommandOutput> {
        let client = SshClient::from_host(host, self.connect_timeout_secs)?;
        tracing::debug!(host = %host.id, remote_path, bytes = content.len(), "upload");
        Ok(client.upload(content, remote_path))
    }
}

/// Convert a command outcome into a typed error unless it succeeded.
pub fn require_success(host: &Host, command: &str, output: CommandOutput) -> Result<CommandOutput> {
    if output.success {
        return Ok(output);
    }

    if output.transport_failure {
        return Err(Error::ssh_connect_failed(host.id.clone(), output.stderr));
    }

    // coreutils `timeout` exits 124 when it had to kill the command
    if output.exit_code == 124 {
        return Err(Error::remote_command_timeout(host.id.clone(), command));
    }

    Err(Error::remote_command_failed(RemoteCommandFailedDetails {
        host: host.id.clone(),
        command: command.to_string(),
        exit_code: output.exit_code,
        stdout: output.stdout,
        stderr: output.stderr,
        duration_ms: output.duration.as_millis(),
    }))
}

/// Run and require exit 0.
pub fn run(executor: &dyn RemoteExecutor, host: &Host, command: &str) -> Result<CommandOutput> {
    let output = executor.execute(host, command)?;
    require_success(host, command, output)
}

/// Run a state query: exit 0 is `true`, any other exit is `false`,
/// a connection failure is an error.
pub fn test(executor: &dyn RemoteExecutor, host: &Host, command: &str) -> Result<bool> {
    let output = executor.execute(host, command)?;
    if output.transport_failure {
        return Err(Error::ssh_connect_failed(host.id.clone(), output.stderr));
    }
    Ok(output.success)
}

/// Caller-level retry policy for transport errors. Every retry is logged.
pub fn retry_transport<T>(
    label: &str,
    retries: u32,
    backoff: Duration,
    mut f: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut attempt = 0;
    loop {
        match f() {
            Err(err) if err.is_transport() && attempt < retries => {
                attempt += 1;
                tracing::warn!(
                    operation = label,
                    attempt,
                    retries,
                    error = %err,
                    "transport failure, retrying"
                );
                log_status!(
                    "ssh",
                    "{} failed to connect (attempt {}/{}), retrying in {}s",
                    label,
                    attempt,
                    retries + 1,
                    backoff.as_secs()
                );
                std::thread::sleep(backoff);
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn host() -> Host {
        Host {
            id: "app".to_string(),
            address: "10.0.0.2".to_string(),
            user: "deploy".to_string(),
            port: 22,
            identity_file: None,
        }
    }

    #[test]
    fn require_success_classifies_failures() {
        let err = require_success(&host(), "x", CommandOutput::unreachable("refused")).unwrap_err();
        assert!(err.is_transport());

        let err = require_success(&host(), "x", CommandOutput::failed(124, "")).unwrap_err();
        assert_eq!(err.code.as_str(), "remote.command_timeout");

        let err = require_success(&host(), "x", CommandOutput::failed(2, "boom")).unwrap_err();
        assert_eq!(err.code.as_str(), "remote.command_failed");
        assert_eq!(err.details["stderr"], "boom");
    }

    #[test]
    fn retry_transport_retries_only_transport_errors() {
        let calls = Cell::new(0);
        let result: Result<()> = retry_transport("probe", 2, Duration::ZERO, || {
            calls.set(calls.get() + 1);
            Err(Error::ssh_connect_failed("app", "refused"))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 3);

        let calls = Cell::new(0);
        let result: Result<()> = retry_transport("probe", 2, Duration::ZERO, || {
            calls.set(calls.get() + 1);
            Err(Error::precondition_failed("x", "y"))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn retry_transport_returns_first_success() {
        let calls = Cell::new(0);
        let value = retry_transport("probe", 3, Duration::ZERO, || {
            calls.set(calls.get() + 1);
            if calls.get() < 2 {
                Err(Error::ssh_connect_failed("app", "refused"))
            } else {
                Ok(7)
            }
        })
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.get(), 2);
    }
}
