use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigMissingKey,
    ConfigInvalidJson,
    ConfigInvalidValue,

    ValidationMissingArgument,
    ValidationInvalidArgument,
    ValidationInvalidJson,

    HostNotFound,
    ReleaseNotFound,
    SecretNotFound,

    SshIdentityFileNotFound,
    SshConnectFailed,

    RemoteCommandFailed,
    RemoteCommandTimeout,

    PreconditionFailed,
    LockHeld,
    SecretsVersionConflict,
    SecretInvalid,

    HealthCheckFailed,
    RollbackFailed,
    RunCancelled,

    InternalIoError,
    InternalJsonError,
    InternalUnexpected,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConfigMissingKey => "config.missing_key",
            ErrorCode::ConfigInvalidJson => "config.invalid_json",
            ErrorCode::ConfigInvalidValue => "config.invalid_value",

            ErrorCode::ValidationMissingArgument => "validation.missing_argument",
            ErrorCode::ValidationInvalidArgument => "validation.invalid_argument",
            ErrorCode::ValidationInvalidJson => "validation.invalid_json",

            ErrorCode::HostNotFound => "host.not_found",
            ErrorCode::ReleaseNotFound => "release.not_found",
            ErrorCode::SecretNotFound => "secrets.unknown",

            ErrorCode::SshIdentityFileNotFound => "ssh.identity_file_not_found",
            ErrorCode::SshConnectFailed => "ssh.connect_failed",

            ErrorCode::RemoteCommandFailed => "remote.command_failed",
            ErrorCode::RemoteCommandTimeout => "remote.command_timeout",

            ErrorCode::PreconditionFailed => "precondition.failed",
            ErrorCode::LockHeld => "lock.held",
            ErrorCode::SecretsVersionConflict => "secrets.version_conflict",
            ErrorCode::SecretInvalid => "secrets.invalid",

            ErrorCode::HealthCheckFailed => "health.check_failed",
            ErrorCode::RollbackFailed => "rollback.failed",
            ErrorCode::RunCancelled => "run.cancelled",

            ErrorCode::InternalIoError => "internal.io_error",
            ErrorCode::InternalJsonError => "internal.json_error",
            ErrorCode::InternalUnexpected => "internal.unexpected",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Hint {
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct Error {
    pub code: ErrorCode,
    pub message: String,
    pub details: Value,
    pub hints: Vec<Hint>,
    pub retryable: Option<bool>,
}

pub type Result<T> = std::result::Result<T, Error>;

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Error {}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotFoundDetails {
    pub id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingArgumentDetails {
    pub args: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidArgumentDetails {
    pub field: String,
    pub problem: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tried: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigInvalidValueDetails {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub problem: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InternalIoErrorDetails {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCommandFailedDetails {
    pub host: String,
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u128,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckFailedDetails {
    pub check: String,
    pub target: String,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

fn to_details<T: Serialize>(details: T) -> Value {
    serde_json::to_value(details).unwrap_or_else(|_| Value::Object(serde_json::Map::new()))
}

impl Error {
    pub fn new(code: ErrorCode, message: impl Into<String>, details: Value) -> Self {
        Self {
            code,
            message: message.into(),
            details,
            hints: Vec::new(),
            retryable: None,
        }
    }

    pub fn validation_missing_argument(args: Vec<String>) -> Self {
        Self::new(
            ErrorCode::ValidationMissingArgument,
            "Missing required argument",
            to_details(MissingArgumentDetails { args }),
        )
    }

    pub fn validation_invalid_argument(
        field: impl Into<String>,
        problem: impl Into<String>,
        id: Option<String>,
        tried: Option<Vec<String>>,
    ) -> Self {
        let problem = problem.into();
        let details = to_details(InvalidArgumentDetails {
            field: field.into(),
            problem: problem.clone(),
            id,
            tried,
        });

        Self::new(
            ErrorCode::ValidationInvalidArgument,
            format!("Invalid argument: {}", problem),
            details,
        )
    }

    pub fn validation_invalid_json(err: serde_json::Error, context: Option<String>) -> Self {
        let details = serde_json::json!({
            "error": err.to_string(),
            "context": context,
        });

        Self::new(ErrorCode::ValidationInvalidJson, "Invalid JSON", details)
    }

    pub fn config_missing_key(key: impl Into<String>, path: Option<String>) -> Self {
        let details = serde_json::json!({ "key": key.into(), "path": path });
        Self::new(
            ErrorCode::ConfigMissingKey,
            "Missing required configuration key",
            details,
        )
    }

    pub fn config_invalid_json(path: impl Into<String>, err: serde_json::Error) -> Self {
        let path = path.into();
        let details = serde_json::json!({ "path": path, "error": err.to_string() });
        Self::new(
            ErrorCode::ConfigInvalidJson,
            format!("Invalid JSON in configuration {}", path),
            details,
        )
        .with_hint("Check the topology file against the documented keys (camelCase)")
    }

    pub fn config_invalid_value(
        key: impl Into<String>,
        value: Option<String>,
        problem: impl Into<String>,
    ) -> Self {
        let problem = problem.into();
        let details = to_details(ConfigInvalidValueDetails {
            key: key.into(),
            value,
            problem: problem.clone(),
        });

        Self::new(
            ErrorCode::ConfigInvalidValue,
            format!("Invalid configuration value: {}", problem),
            details,
        )
    }

    pub fn host_not_found(id: impl Into<String>) -> Self {
        Self::not_found(ErrorCode::HostNotFound, "Host not found", id)
            .with_hint("Hosts are declared under 'hosts' in the topology file")
    }

    pub fn release_not_found(host: impl Into<String>, id: impl Into<String>) -> Self {
        let id = id.into();
        let details = serde_json::json!({ "host": host.into(), "id": id });
        Self::new(
            ErrorCode::ReleaseNotFound,
            format!("Release '{}' not found", id),
            details,
        )
        .with_hint("Run 'keel releases' to see the releases kept on the host")
    }

    pub fn secret_not_found(name: impl Into<String>) -> Self {
        Self::not_found(ErrorCode::SecretNotFound, "Secret not in catalog", name)
            .with_hint("Secrets are declared under 'secrets' in the topology file")
    }

    fn not_found(code: ErrorCode, message: &str, id: impl Into<String>) -> Self {
        let id = id.into();
        Self::new(
            code,
            format!("{}: {}", message, id),
            to_details(NotFoundDetails { id }),
        )
    }

    pub fn ssh_identity_file_not_found(
        host_id: impl Into<String>,
        identity_file: impl Into<String>,
    ) -> Self {
        let details = serde_json::json!({
            "hostId": host_id.into(),
            "identityFile": identity_file.into(),
        });
        Self::new(
            ErrorCode::SshIdentityFileNotFound,
            "SSH identity file not found",
            details,
        )
    }

    /// Transport failure: the host could not be reached. Callers decide whether to retry.
    pub fn ssh_connect_failed(host: impl Into<String>, stderr: impl Into<String>) -> Self {
        let host = host.into();
        let details = serde_json::json!({ "host": host, "stderr": stderr.into() });
        let mut err = Self::new(
            ErrorCode::SshConnectFailed,
            format!("Cannot reach host '{}'", host),
            details,
        );
        err.retryable = Some(true);
        err
    }

    pub fn remote_command_failed(details: RemoteCommandFailedDetails) -> Self {
        let message = format!(
            "Command failed on '{}' (exit {})",
            details.host, details.exit_code
        );
        Self::new(ErrorCode::RemoteCommandFailed, message, to_details(details))
    }

    pub fn remote_command_timeout(host: impl Into<String>, command: impl Into<String>) -> Self {
        let host = host.into();
        let details = serde_json::json!({ "host": host, "command": command.into() });
        let mut err = Self::new(
            ErrorCode::RemoteCommandTimeout,
            format!("Command timed out on '{}'", host),
            details,
        );
        err.retryable = Some(true);
        err
    }

    pub fn precondition_failed(resource: impl Into<String>, problem: impl Into<String>) -> Self {
        let problem = problem.into();
        let details = serde_json::json!({ "resource": resource.into(), "problem": problem });
        let mut err = Self::new(ErrorCode::PreconditionFailed, problem, details);
        err.retryable = Some(false);
        err
    }

    pub fn lock_held(resource: impl Into<String>, holder: impl Into<String>) -> Self {
        let resource = resource.into();
        let details = serde_json::json!({ "resource": resource, "holder": holder.into() });
        let mut err = Self::new(
            ErrorCode::LockHeld,
            format!("Another run holds the lock on {}", resource),
            details,
        )
        .with_hint("Wait for the other run to finish; remove the marker only if that run is dead");
        err.retryable = Some(false);
        err
    }

    pub fn secrets_version_conflict(expected: u64, found: u64) -> Self {
        let details = serde_json::json!({ "expected": expected, "found": found });
        let mut err = Self::new(
            ErrorCode::SecretsVersionConflict,
            format!(
                "Secrets store changed underneath this run (expected version {}, found {})",
                expected, found
            ),
            details,
        );
        err.retryable = Some(false);
        err
    }

    pub fn secret_invalid(name: impl Into<String>, problems: Vec<String>) -> Self {
        let name = name.into();
        let details = serde_json::json!({ "name": name, "problems": problems });
        Self::new(
            ErrorCode::SecretInvalid,
            format!("Secret '{}' does not meet its requirements", name),
            details,
        )
    }

    pub fn health_check_failed(details: HealthCheckFailedDetails) -> Self {
        let message = format!(
            "Health check '{}' failed after {} attempt(s)",
            details.check, details.attempts
        );
        Self::new(ErrorCode::HealthCheckFailed, message, to_details(details))
    }

    /// A rollback could not restore the previous state. Never retried automatically.
    pub fn rollback_failed(context: impl Into<String>, cause: &Error, failures: Vec<String>) -> Self {
        let context = context.into();
        let details = serde_json::json!({
            "context": context,
            "cause": { "code": cause.code.as_str(), "message": cause.message, "details": cause.details },
            "failures": failures,
        });
        let mut err = Self::new(
            ErrorCode::RollbackFailed,
            format!("Rollback failed during {}: manual intervention required", context),
            details,
        );
        err.retryable = Some(false);
        err
    }

    pub fn run_cancelled(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new(
            ErrorCode::RunCancelled,
            format!("Run cancelled: {}", reason),
            serde_json::json!({ "reason": reason }),
        )
    }

    pub fn internal_io(error: impl Into<String>, context: Option<String>) -> Self {
        let details = to_details(InternalIoErrorDetails {
            error: error.into(),
            context,
        });
        Self::new(ErrorCode::InternalIoError, "IO error", details)
    }

    pub fn internal_json(error: impl Into<String>, context: Option<String>) -> Self {
        let details = serde_json::json!({ "error": error.into(), "context": context });
        Self::new(ErrorCode::InternalJsonError, "JSON error", details)
    }

    pub fn internal_unexpected(error: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::InternalUnexpected,
            "Unexpected error",
            serde_json::json!({ "error": error.into() }),
        )
    }

    pub fn with_hint(mut self, message: impl Into<String>) -> Self {
        self.hints.push(Hint {
            message: message.into(),
        });
        self
    }

    /// Attach an extra key to the details object (replaces non-object details).
    pub fn with_detail(mut self, key: &str, value: Value) -> Self {
        if !self.details.is_object() {
            self.details = Value::Object(serde_json::Map::new());
        }
        if let Value::Object(map) = &mut self.details {
            map.insert(key.to_string(), value);
        }
        self
    }

    /// Transport errors are the only class a caller may retry.
    pub fn is_transport(&self) -> bool {
        matches!(
            self.code,
            ErrorCode::SshConnectFailed | ErrorCode::RemoteCommandTimeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_retryable() {
        let err = Error::ssh_connect_failed("app", "Connection refused");
        assert!(err.is_transport());
        assert_eq!(err.retryable, Some(true));
        assert_eq!(err.code.as_str(), "ssh.connect_failed");
    }

    #[test]
    fn precondition_errors_are_not_retryable() {
        let err = Error::precondition_failed("release", "no active release");
        assert!(!err.is_transport());
        assert_eq!(err.retryable, Some(false));
    }

    #[test]
    fn rollback_failed_carries_cause() {
        let cause = Error::precondition_failed("cache", "bad state");
        let err = Error::rollback_failed("rotation", &cause, vec!["cache".to_string()]);
        assert_eq!(err.details["cause"]["code"], "precondition.failed");
        assert_eq!(err.details["failures"][0], "cache");
    }

    #[test]
    fn with_detail_extends_object() {
        let err = Error::precondition_failed("x", "y").with_detail("extra", serde_json::json!(1));
        assert_eq!(err.details["extra"], 1);
        assert_eq!(err.details["resource"], "x");
    }
}
