use crate::error::{Error, Result};
use crate::host::Host;
use crate::utils::shell;
use std::io::Write;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

pub struct SshClient {
    pub host_id: String,
    pub address: String,
    pub user: String,
    pub port: u16,
    pub identity_file: Option<String>,
    pub connect_timeout_secs: u64,
    /// When true, all commands run locally instead of over SSH.
    /// Set automatically when the host address is localhost/127.0.0.1/::1.
    pub is_local: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub exit_code: i32,
    pub duration: Duration,
    /// The command never reached the host (connection-level failure).
    pub transport_failure: bool,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            success: true,
            exit_code: 0,
            duration: Duration::ZERO,
            transport_failure: false,
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            success: false,
            exit_code,
            duration: Duration::ZERO,
            transport_failure: false,
        }
    }

    pub fn unreachable(stderr: impl Into<String>) -> Self {
        Self {
            transport_failure: true,
            ..Self::failed(255, stderr)
        }
    }
}

impl SshClient {
    pub fn from_host(host: &Host, connect_timeout_secs: u64) -> Result<Self> {
        let identity_file = match &host.identity_file {
            Some(path) if !path.is_empty() => {
                let expanded = shellexpand::tilde(path).to_string();
                if !std::path::Path::new(&expanded).exists() {
                    return Err(Error::ssh_identity_file_not_found(host.id.clone(), expanded));
                }
                Some(expanded)
            }
            _ => None,
        };

        Ok(Self {
            host_id: host.id.clone(),
            address: host.address.clone(),
            user: host.user.clone(),
            port: host.port,
            identity_file,
            connect_timeout_secs,
            is_local: host.is_local(),
        })
    }

    fn build_ssh_args(&self, command: &str) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(identity_file) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity_file.clone());
        }

        if self.port != 22 {
            args.push("-p".to_string());
            args.push(self.port.to_string());
        }

        // Key-based only, bounded connect, no prompts.
        args.extend([
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "PasswordAuthentication=no".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            "-o".to_string(),
            "ServerAliveInterval=15".to_string(),
            "-o".to_string(),
            "ServerAliveCountMax=3".to_string(),
        ]);

        args.push(format!("{}@{}", self.user, self.address));
        args.push(command.to_string());

        args
    }

    /// Run a command once. Connection failures are reported, never retried here.
    pub fn execute(&self, command: &str) -> CommandOutput {
        self.execute_with_input(command, None)
    }

    /// Stream `content` into `remote_path` on the host.
    pub fn upload(&self, content: &[u8], remote_path: &str) -> CommandOutput {
        let remote_command = format!("cat > {}", shell::quote_path(remote_path));
        self.execute_with_input(&remote_command, Some(content))
    }

    fn execute_with_input(&self, command: &str, input: Option<&[u8]>) -> CommandOutput {
        let started = Instant::now();

        let mut cmd = if self.is_local {
            let mut cmd = Command::new("sh");
            cmd.args(["-c", command]);
            cmd
        } else {
            let mut cmd = Command::new("ssh");
            cmd.args(self.build_ssh_args(command));
            cmd
        };

        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut output = match spawn_and_wait(cmd, input) {
            Ok(out) => CommandOutput {
                stdout: String::from_utf8_lossy(&out.stdout).to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).to_string(),
                success: out.status.success(),
                exit_code: out.status.code().unwrap_or(-1),
                duration: Duration::ZERO,
                transport_failure: false,
            },
            Err(e) => CommandOutput {
                transport_failure: !self.is_local,
                ..CommandOutput::failed(-1, format!("SSH error: {}", e))
            },
        };

        output.duration = started.elapsed();
        if !self.is_local && !output.success && is_transient_ssh_error(&output) {
            output.transport_failure = true;
        }
        output
    }
}

fn spawn_and_wait(mut cmd: Command, input: Option<&[u8]>) -> std::io::Result<std::process::Output> {
    let mut child = cmd.spawn()?;
    if let Some(bytes) = input {
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(bytes)?;
        }
    }
    child.wait_with_output()
}

/// Check if an SSH failure is a connection error rather than a remote command failure.
pub fn is_transient_ssh_error(output: &CommandOutput) -> bool {
    let stderr = output.stderr.to_lowercase();
    // SSH exit code 255 = connection error (not a remote command failure)
    let is_connection_exit = output.exit_code == 255;

    let transient_patterns = [
        "connection refused",
        "connection reset",
        "connection timed out",
        "no route to host",
        "network is unreachable",
        "temporary failure in name resolution",
        "could not resolve hostname",
        "broken pipe",
        "ssh_exchange_identification",
        "connection closed by remote host",
    ];

    is_connection_exit || transient_patterns.iter().any(|p| stderr.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_host() -> Host {
        Host {
            id: "app".to_string(),
            address: "localhost".to_string(),
            user: "deploy".to_string(),
            port: 22,
            identity_file: None,
        }
    }

    #[test]
    fn ssh_args_are_batch_mode_with_timeout() {
        let host = Host {
            address: "10.0.0.5".to_string(),
            port: 2222,
            ..local_host()
        };
        let client = SshClient::from_host(&host, 7).unwrap();
        let args = client.build_ssh_args("uptime");

        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.contains(&"ConnectTimeout=7".to_string()));
        assert!(args.windows(2).any(|w| w[0] == "-p" && w[1] == "2222"));
        assert_eq!(args.last().unwrap(), "uptime");
        assert!(args.contains(&"deploy@10.0.0.5".to_string()));
    }

    #[test]
    fn missing_identity_file_is_rejected() {
        let host = Host {
            identity_file: Some("/nonexistent/keel_test_key".to_string()),
            ..local_host()
        };
        let err = SshClient::from_host(&host, 10).err().unwrap();
        assert_eq!(err.code.as_str(), "ssh.identity_file_not_found");
    }

    #[test]
    fn local_execution_captures_output_and_exit_code() {
        let client = SshClient::from_host(&local_host(), 10).unwrap();

        let ok = client.execute("echo hello");
        assert!(ok.success);
        assert_eq!(ok.stdout.trim(), "hello");

        let failed = client.execute("exit 3");
        assert!(!failed.success);
        assert_eq!(failed.exit_code, 3);
        assert!(!failed.transport_failure);
    }

    #[test]
    fn local_upload_writes_content() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("uploaded.txt");
        let client = SshClient::from_host(&local_host(), 10).unwrap();

        let out = client.upload(b"payload\n", &target.to_string_lossy());
        assert!(out.success, "{}", out.stderr);
        assert_eq!(std::fs::read_to_string(target).unwrap(), "payload\n");
    }

    #[test]
    fn exit_255_is_a_connection_error() {
        assert!(is_transient_ssh_error(&CommandOutput::failed(255, "")));
        assert!(is_transient_ssh_error(&CommandOutput::failed(
            1,
            "ssh: connect to host x port 22: Connection refused"
        )));
        assert!(!is_transient_ssh_error(&CommandOutput::failed(1, "grep: no match")));
    }
}
