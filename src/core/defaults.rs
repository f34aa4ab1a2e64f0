use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables that can be overridden under `settings` in the topology file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Release directories kept per host after a successful deploy
    #[serde(default = "default_retention")]
    pub retention: usize,

    #[serde(default = "default_ssh_connect_timeout")]
    pub ssh_connect_timeout_secs: u64,

    /// Extra attempts for operations that failed with a transport error
    #[serde(default = "default_transport_retries")]
    pub transport_retries: u32,

    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_secs: u64,

    #[serde(default = "default_health_timeout")]
    pub health_timeout_secs: u64,

    #[serde(default = "default_health_retries")]
    pub health_retries: u32,

    #[serde(default = "default_health_backoff")]
    pub health_backoff_secs: u64,

    /// Secrets backups kept after a successful rotation
    #[serde(default = "default_backup_retention")]
    pub backup_retention: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            retention: default_retention(),
            ssh_connect_timeout_secs: default_ssh_connect_timeout(),
            transport_retries: default_transport_retries(),
            retry_backoff_secs: default_retry_backoff(),
            health_timeout_secs: default_health_timeout(),
            health_retries: default_health_retries(),
            health_backoff_secs: default_health_backoff(),
            backup_retention: default_backup_retention(),
        }
    }
}

impl Settings {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_secs)
    }

    pub fn health_backoff(&self) -> Duration {
        Duration::from_secs(self.health_backoff_secs)
    }
}

// =============================================================================
// Default value functions
// =============================================================================

pub fn default_retention() -> usize {
    5
}

pub fn default_ssh_connect_timeout() -> u64 {
    10
}

pub fn default_transport_retries() -> u32 {
    2
}

pub fn default_retry_backoff() -> u64 {
    2
}

pub fn default_health_timeout() -> u64 {
    5
}

pub fn default_health_retries() -> u32 {
    3
}

pub fn default_health_backoff() -> u64 {
    2
}

pub fn default_backup_retention() -> usize {
    10
}

pub fn default_ssh_port() -> u16 {
    22
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_uses_defaults() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.retention, 5);
    }

    #[test]
    fn partial_override_keeps_other_defaults() {
        let settings: Settings = serde_json::from_str(r#"{"retention": 2}"#).unwrap();
        assert_eq!(settings.retention, 2);
        assert_eq!(settings.health_retries, 3);
    }
}
