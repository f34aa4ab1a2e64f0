//! Topology file: the two hosts and everything keel does to them.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::defaults::Settings;
use crate::error::{Error, Result};
use crate::health::{CheckKind, HealthCheck};
use crate::host::{self, Hosts};
use crate::local_files::{self, FileSystem};
use crate::ops::HostPlan;
use crate::paths;
use crate::release::{ReleaseSettings, ReleaseSource};
use crate::rotation::ServiceTarget;
use crate::secrets::{self, SecretSpec, SecretsStore};

pub const SSHD_CONFIG: &str = "/etc/ssh/sshd_config";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topology {
    /// Names the local state directory; defaults to the file stem
    #[serde(default)]
    pub name: String,
    pub hosts: Hosts,
    #[serde(default)]
    pub admin: AdminAccount,
    #[serde(default = "default_sshd")]
    pub sshd: BTreeMap<String, String>,
    /// Secret catalog
    #[serde(default)]
    pub secrets: Vec<SecretSpec>,
    #[serde(default)]
    pub secrets_file: Option<String>,
    pub app: AppConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
    /// Secret consumers, for rotation
    #[serde(default)]
    pub services: Vec<ServiceTarget>,
    /// Verification-phase checks, after the default `/health` check
    #[serde(default)]
    pub checks: Vec<HealthCheck>,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub settings: Settings,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AdminAccount {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default)]
    pub authorized_keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    /// Public base URL; enables the default `/health` check
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub plan: HostPlan,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    /// Shared env file; maps env key to secret name
    #[serde(default)]
    pub env_file: Option<EnvFileConfig>,
    pub release: ReleaseSettings,
    #[serde(default)]
    pub source: Option<ReleaseSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    pub name: String,
    pub role: String,
    pub password_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvFileConfig {
    pub path: String,
    pub keys: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ObservabilityConfig {
    /// Packages, directories and base services
    #[serde(default)]
    pub plan: HostPlan,
    /// Stack configuration applied last; restored on failure
    #[serde(default)]
    pub activate: HostPlan,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NotifyConfig {
    #[serde(default)]
    pub webhook_url: Option<String>,
}

fn default_sshd() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("PasswordAuthentication".to_string(), "no".to_string()),
        ("PermitRootLogin".to_string(), "prohibit-password".to_string()),
    ])
}

/// Topology file path: explicit flag, then `KEEL_CONFIG`, then `./keel.json`.
pub fn resolve_path(explicit: Option<&str>) -> PathBuf {
    if let Some(path) = explicit.filter(|p| !p.is_empty()) {
        return paths::expand(path);
    }
    match std::env::var("KEEL_CONFIG") {
        Ok(path) if !path.is_empty() => paths::expand(&path),
        _ => paths::default_config(),
    }
}

impl Topology {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::config_missing_key(
                "topology",
                Some(path.display().to_string()),
            )
            .with_hint("Pass --config <file> or set KEEL_CONFIG"));
        }
        let content = local_files::local().read(path)?;
        Self::parse(&content, path)
    }

    /// Parse and normalize: host ids, file name, relative file sources.
    pub fn parse(content: &str, path: &Path) -> Result<Self> {
        let mut topology: Topology = serde_json::from_str(content)
            .map_err(|e| Error::config_invalid_json(path.display().to_string(), e))?;

        topology.hosts.assign_ids();
        if topology.name.is_empty() {
            topology.name = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "keel".to_string());
        }

        let base = path.parent().unwrap_or(Path::new("."));
        for plan in [
            &mut topology.app.plan,
            &mut topology.observability.plan,
            &mut topology.observability.activate,
        ] {
            for file in &mut plan.files {
                if file.source.is_relative() {
                    file.source = base.join(&file.source);
                }
            }
        }
        if let Some(ReleaseSource::Archive { path }) = &mut topology.app.source {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }

        Ok(topology)
    }

    pub fn secrets_path(&self) -> Result<PathBuf> {
        match &self.secrets_file {
            Some(file) => Ok(paths::expand(file)),
            None => paths::secrets(&self.name),
        }
    }

    pub fn secrets_store(&self) -> Result<SecretsStore> {
        Ok(SecretsStore::new(self.secrets_path()?, paths::backups(&self.name)?))
    }

    pub fn secret_spec(&self, name: &str) -> Option<&SecretSpec> {
        self.secrets.iter().find(|s| s.name == name)
    }

    /// The application `/health` endpoint, when a URL is configured.
    pub fn default_health_check(&self) -> Option<HealthCheck> {
        let url = self.app.url.as_deref()?.trim_end_matches('/');
        let mut check = HealthCheck::new("app-health", CheckKind::Http, &format!("{}/health", url))
            .with_budget(self.settings.health_timeout_secs, self.settings.health_retries);
        check.expect_status = Some(200);
        Some(check)
    }

    /// Checks run by the verification phase and `keel health`.
    pub fn verification_checks(&self) -> Vec<HealthCheck> {
        self.default_health_check()
            .into_iter()
            .chain(self.checks.iter().cloned())
            .collect()
    }

    /// Secrets referenced anywhere outside the catalog itself.
    fn referenced_secrets(&self) -> Vec<(String, String)> {
        let mut refs = Vec::new();
        if let Some(db) = &self.app.database {
            refs.push(("app.database".to_string(), db.password_secret.clone()));
        }
        if let Some(env) = &self.app.env_file {
            for secret in env.keys.values() {
                refs.push(("app.envFile".to_string(), secret.clone()));
            }
        }
        for service in &self.services {
            for secret in service.consumes() {
                refs.push((format!("service {}", service.name), secret));
            }
        }
        refs
    }

    /// Everything wrong with the file, checked before any remote call.
    pub fn problems(&self) -> Vec<String> {
        let mut problems = self.hosts.validate();

        let deploy_path = &self.app.release.deploy_path;
        if !deploy_path.starts_with('/') {
            problems.push(format!(
                "app.release.deployPath must be absolute (got '{}')",
                deploy_path
            ));
        }
        if deploy_path.trim_end_matches('/').is_empty() && deploy_path.starts_with('/') {
            problems.push("app.release.deployPath cannot be the filesystem root".to_string());
        }

        problems.extend(secrets::validate_catalog(&self.secrets));

        let catalog: BTreeSet<&str> = self.secrets.iter().map(|s| s.name.as_str()).collect();
        for (owner, secret) in self.referenced_secrets() {
            if !catalog.contains(secret.as_str()) {
                problems.push(format!("{} uses secret {} which is not in the catalog", owner, secret));
            }
        }

        let mut names = BTreeSet::new();
        for service in &self.services {
            if !names.insert(service.name.as_str()) {
                problems.push(format!("service '{}' is declared twice", service.name));
            }
            if service.host != host::APP && service.host != host::OBSERVABILITY {
                problems.push(format!(
                    "service '{}' names unknown host '{}'",
                    service.name, service.host
                ));
            }
            if service.actions.is_empty() {
                problems.push(format!("service '{}' declares no credential actions", service.name));
            }
            if let Some(check) = &service.check {
                problems.extend(check.validate());
            }
        }

        for check in self
            .checks
            .iter()
            .chain(&self.app.release.pre_checks)
            .chain(&self.app.release.post_checks)
        {
            problems.extend(check.validate());
        }

        if self.admin.user.is_empty() && !self.admin.authorized_keys.is_empty() {
            problems.push("admin.authorizedKeys needs admin.user".to_string());
        }

        problems
    }

    pub fn validate(&self) -> Result<()> {
        let problems = self.problems();
        if problems.is_empty() {
            return Ok(());
        }
        let count = problems.len();
        Err(Error::config_invalid_value(
            "topology",
            None,
            format!("{} problem(s) in topology {}", count, self.name),
        )
        .with_detail("problems", serde_json::json!(problems)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "hosts": {
            "app": {"address": "10.0.0.2", "user": "deploy"},
            "observability": {"address": "10.0.0.3", "user": "deploy"}
        },
        "admin": {"user": "deploy", "groups": ["sudo"], "authorizedKeys": ["ssh-ed25519 AAAA ops"]},
        "secrets": [
            {"name": "DB_PASSWORD", "format": "alphanumeric", "minLength": 32},
            {"name": "REDIS_PASSWORD", "format": "hex", "minLength": 40}
        ],
        "app": {
            "url": "https://shop.example.com/",
            "plan": {"packages": ["nginx"], "files": [{"source": "files/nginx.conf", "path": "/etc/nginx/nginx.conf"}]},
            "database": {"name": "shop", "role": "shop", "passwordSecret": "DB_PASSWORD"},
            "release": {"deployPath": "/srv/shop"}
        },
        "services": [
            {"name": "redis", "tier": "cache", "actions": [{"type": "redis_password", "secret": "REDIS_PASSWORD"}]}
        ]
    }"#;

    fn sample() -> Topology {
        Topology::parse(SAMPLE, Path::new("/etc/keel/shop.json")).unwrap()
    }

    #[test]
    fn parse_normalizes_names_and_sources() {
        let topology = sample();
        assert_eq!(topology.name, "shop");
        assert_eq!(topology.hosts.app.id, "app");
        assert_eq!(
            topology.app.plan.files[0].source,
            PathBuf::from("/etc/keel/files/nginx.conf")
        );
        assert_eq!(topology.sshd["PasswordAuthentication"], "no");
        assert_eq!(topology.settings.retention, 5);
        assert!(topology.problems().is_empty(), "{:?}", topology.problems());
    }

    #[test]
    fn default_health_check_targets_health_endpoint() {
        let checks = sample().verification_checks();
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].target, "https://shop.example.com/health");
        assert_eq!(checks[0].expect_status, Some(200));
    }

    #[test]
    fn relative_deploy_path_is_rejected() {
        let mut topology = sample();
        topology.app.release.deploy_path = "srv/shop".to_string();
        let err = topology.validate().unwrap_err();
        assert_eq!(err.code.as_str(), "config.invalid_value");
        assert!(err.details["problems"][0]
            .as_str()
            .unwrap()
            .contains("must be absolute"));
    }

    #[test]
    fn uncatalogued_service_secret_is_rejected() {
        let mut topology = sample();
        topology.secrets.retain(|s| s.name != "REDIS_PASSWORD");
        let problems = topology.problems();
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("service redis uses secret REDIS_PASSWORD"));
    }

    #[test]
    fn invalid_json_is_a_config_error() {
        let err = Topology::parse("{", Path::new("keel.json")).unwrap_err();
        assert_eq!(err.code.as_str(), "config.invalid_json");
    }

    #[test]
    fn missing_file_is_reported_with_hint() {
        let err = Topology::load(Path::new("/nonexistent/keel.json")).unwrap_err();
        assert_eq!(err.code.as_str(), "config.missing_key");
        assert!(!err.hints.is_empty());
    }
}
