use crate::defaults::default_ssh_port;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Host id of the application server
pub const APP: &str = "app";
/// Host id of the observability server
pub const OBSERVABILITY: &str = "observability";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Host {
    #[serde(skip_deserializing, default)]
    pub id: String,
    pub address: String,
    pub user: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub identity_file: Option<String>,
}

impl Host {
    pub fn is_valid(&self) -> bool {
        !self.address.is_empty() && !self.user.is_empty()
    }

    /// Hosts addressed as the local machine run commands through `sh -c`.
    pub fn is_local(&self) -> bool {
        is_local_address(&self.address)
    }

    pub fn label(&self) -> String {
        format!("{} ({}@{})", self.id, self.user, self.address)
    }
}

/// The fixed two-host topology
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hosts {
    pub app: Host,
    pub observability: Host,
}

impl Hosts {
    /// Stamp ids onto the hosts; ids are positional, not user-supplied.
    pub fn assign_ids(&mut self) {
        self.app.id = APP.to_string();
        self.observability.id = OBSERVABILITY.to_string();
    }

    pub fn get(&self, id: &str) -> Result<&Host> {
        match id {
            APP => Ok(&self.app),
            OBSERVABILITY => Ok(&self.observability),
            _ => Err(Error::host_not_found(id)),
        }
    }

    pub fn all(&self) -> Vec<&Host> {
        vec![&self.app, &self.observability]
    }

    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        for host in self.all() {
            if !host.is_valid() {
                problems.push(format!("host '{}' needs both address and user", host.id));
            }
        }
        problems
    }
}

/// Check if a host address refers to the local machine.
pub fn is_local_address(address: &str) -> bool {
    matches!(address, "localhost" | "127.0.0.1" | "::1")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hosts() -> Hosts {
        let mut hosts: Hosts = serde_json::from_str(
            r#"{
                "app": {"address": "10.0.0.2", "user": "deploy"},
                "observability": {"address": "localhost", "user": "root", "port": 2222}
            }"#,
        )
        .unwrap();
        hosts.assign_ids();
        hosts
    }

    #[test]
    fn ids_are_assigned_by_role() {
        let hosts = hosts();
        assert_eq!(hosts.get(APP).unwrap().address, "10.0.0.2");
        assert_eq!(hosts.get(OBSERVABILITY).unwrap().port, 2222);
        assert_eq!(hosts.app.port, 22);
    }

    #[test]
    fn unknown_host_is_not_found() {
        let err = hosts().get("db").unwrap_err();
        assert_eq!(err.code.as_str(), "host.not_found");
    }

    #[test]
    fn local_detection() {
        let hosts = hosts();
        assert!(!hosts.app.is_local());
        assert!(hosts.observability.is_local());
    }

    #[test]
    fn validate_reports_missing_user() {
        let mut hosts = hosts();
        hosts.app.user.clear();
        assert_eq!(hosts.validate().len(), 1);
    }
}
