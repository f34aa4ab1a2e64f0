use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::health::HealthCheck;
use crate::host;
use crate::secrets;

/// Update tiers, in the only order credentials may flow: a later tier
/// consumes credentials issued by an earlier one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceTier {
    Data,
    Cache,
    Application,
    Web,
}

impl ServiceTier {
    pub const ALL: [ServiceTier; 4] = [
        ServiceTier::Data,
        ServiceTier::Cache,
        ServiceTier::Application,
        ServiceTier::Web,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceTier::Data => "data",
            ServiceTier::Cache => "cache",
            ServiceTier::Application => "application",
            ServiceTier::Web => "web",
        }
    }
}

/// How a service receives a credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CredentialAction {
    /// `KEY=VALUE` lines; `keys` maps env key to secret name
    EnvFile {
        path: String,
        keys: BTreeMap<String, String>,
    },
    PostgresPassword { role: String, secret: String },
    /// Live `CONFIG SET requirepass` plus the persisted `requirepass` line
    RedisPassword {
        secret: String,
        #[serde(default = "default_redis_config")]
        config: String,
    },
    /// Shell command with `{{SECRET_NAME}}` placeholders
    Command { command: String },
}

fn default_redis_config() -> String {
    "/etc/redis/redis.conf".to_string()
}

/// `{{NAME}}` placeholders in a command template.
fn placeholders(template: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            break;
        };
        let name = &after[..end];
        if secrets::is_valid_name(name) {
            names.push(name.to_string());
        }
        rest = &after[end + 2..];
    }
    names
}

impl CredentialAction {
    pub fn secrets(&self) -> Vec<String> {
        match self {
            CredentialAction::EnvFile { keys, .. } => keys.values().cloned().collect(),
            CredentialAction::PostgresPassword { secret, .. }
            | CredentialAction::RedisPassword { secret, .. } => vec![secret.clone()],
            CredentialAction::Command { command } => placeholders(command),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            CredentialAction::EnvFile { path, keys } => format!(
                "set {} in {}",
                keys.keys().cloned().collect::<Vec<_>>().join(", "),
                path
            ),
            CredentialAction::PostgresPassword { role, .. } => format!("password of role {}", role),
            CredentialAction::RedisPassword { config, .. } => format!("requirepass (live and {})", config),
            CredentialAction::Command { command } => format!("run {}", command),
        }
    }
}

/// A service that consumes one or more secrets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceTarget {
    pub name: String,
    #[serde(default = "default_service_host")]
    pub host: String,
    pub tier: ServiceTier,
    pub actions: Vec<CredentialAction>,
    /// systemd unit reloaded after the credentials change
    #[serde(default)]
    pub unit: Option<String>,
    /// The unit cannot reload; a restart (brief unavailability) is accepted
    #[serde(default)]
    pub restart: bool,
    #[serde(default)]
    pub check: Option<HealthCheck>,
}

fn default_service_host() -> String {
    host::APP.to_string()
}

impl ServiceTarget {
    pub fn consumes(&self) -> BTreeSet<String> {
        self.actions.iter().flat_map(|a| a.secrets()).collect()
    }

    pub fn is_affected_by(&self, selected: &BTreeSet<String>) -> bool {
        self.consumes().iter().any(|s| selected.contains(s))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationPlan {
    pub selected: BTreeSet<String>,
    #[serde(default = "default_order")]
    pub order: Vec<ServiceTier>,
    #[serde(default)]
    pub dry_run: bool,
}

fn default_order() -> Vec<ServiceTier> {
    ServiceTier::ALL.to_vec()
}

impl RotationPlan {
    pub fn new<I, S>(selected: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            selected: selected.into_iter().map(Into::into).collect(),
            order: default_order(),
            dry_run: false,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// The order may omit tiers but never reorder them.
    pub fn validate(&self) -> Result<()> {
        if self.selected.is_empty() {
            return Err(Error::validation_missing_argument(vec!["secrets".to_string()]));
        }
        if !self.order.windows(2).all(|w| w[0] < w[1]) {
            return Err(Error::validation_invalid_argument(
                "order",
                "tiers must follow data, cache, application, web without repeats",
                None,
                Some(self.order.iter().map(|t| t.as_str().to_string()).collect()),
            ));
        }
        Ok(())
    }

    /// Services consuming a selected secret, tier by tier, declaration order
    /// within a tier.
    pub fn affected<'s>(&self, services: &'s [ServiceTarget]) -> Result<Vec<&'s ServiceTarget>> {
        let affected: Vec<&ServiceTarget> = services
            .iter()
            .filter(|s| s.is_affected_by(&self.selected))
            .collect();

        if let Some(outside) = affected.iter().find(|s| !self.order.contains(&s.tier)) {
            return Err(Error::precondition_failed(
                format!("service {}", outside.name),
                format!(
                    "service consumes a rotated secret but its tier ({}) is not in the update order",
                    outside.tier.as_str()
                ),
            ));
        }

        let mut ordered = Vec::with_capacity(affected.len());
        for tier in &self.order {
            ordered.extend(affected.iter().filter(|s| s.tier == *tier).copied());
        }
        Ok(ordered)
    }
}
