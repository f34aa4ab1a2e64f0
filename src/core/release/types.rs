use std::path::PathBuf;

use chrono::{DateTime, NaiveDateTime, TimeDelta, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::health::{HealthCheck, HealthReport};
use crate::utils::shell::join_remote;

pub(crate) const RELEASE_ID_FORMAT: &str = "%Y%m%d%H%M%S";
pub(crate) const METADATA_FILE: &str = ".keel-release.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseStatus {
    Pending,
    Active,
    Retired,
}

/// Where a release's files come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ReleaseSource {
    /// Shallow fetch of a branch, tag or commit
    Git { repository: String, reference: String },
    /// Local `.tar.gz` uploaded and extracted on the host
    Archive { path: PathBuf },
    /// Directory already present on the host
    Path { path: String },
}

impl ReleaseSource {
    pub fn describe(&self) -> String {
        match self {
            ReleaseSource::Git {
                repository,
                reference,
            } => format!("{}@{}", repository, reference),
            ReleaseSource::Archive { path } => format!("archive {}", path.display()),
            ReleaseSource::Path { path } => format!("copy of {}", path),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ReleaseSource>,
    pub status: ReleaseStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retired_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Release {
    pub fn pending(id: &str, source: &ReleaseSource) -> Self {
        Self {
            id: id.to_string(),
            source: Some(source.clone()),
            status: ReleaseStatus::Pending,
            created_at: Utc::now(),
            activated_at: None,
            retired_at: None,
            reason: None,
        }
    }

    /// Stand-in for a release directory without readable metadata.
    pub fn unknown(id: &str) -> Self {
        let created_at = NaiveDateTime::parse_from_str(id, RELEASE_ID_FORMAT)
            .map(|t| t.and_utc())
            .unwrap_or_else(|_| Utc::now());
        Self {
            id: id.to_string(),
            source: None,
            status: ReleaseStatus::Retired,
            created_at,
            activated_at: None,
            retired_at: None,
            reason: Some("no release metadata".to_string()),
        }
    }

    pub fn activate(&mut self) {
        self.status = ReleaseStatus::Active;
        self.activated_at = Some(Utc::now());
        self.retired_at = None;
        self.reason = None;
    }

    pub fn retire(&mut self, reason: impl Into<String>) {
        self.status = ReleaseStatus::Retired;
        self.retired_at = Some(Utc::now());
        self.reason = Some(reason.into());
    }

    pub fn was_activated(&self) -> bool {
        self.activated_at.is_some()
    }
}

pub fn is_release_id(name: &str) -> bool {
    name.len() == 14 && name.bytes().all(|b| b.is_ascii_digit())
}

/// Timestamp id for `now`, bumped past the newest existing id so ids stay
/// strictly increasing even when the clock repeats or steps back.
pub fn next_release_id(now: DateTime<Utc>, existing: &[String]) -> String {
    let now = now.naive_utc();
    let candidate = now.with_nanosecond(0).unwrap_or(now);
    let newest = existing
        .iter()
        .filter_map(|id| NaiveDateTime::parse_from_str(id, RELEASE_ID_FORMAT).ok())
        .max();

    let id = match newest {
        Some(newest) if candidate <= newest => newest + TimeDelta::seconds(1),
        _ => candidate,
    };
    id.format(RELEASE_ID_FORMAT).to_string()
}

/// Release settings under `app.release` in the topology file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseSettings {
    pub deploy_path: String,
    /// Paths inside a release that live in `shared/`; a trailing `/` marks a directory
    #[serde(default)]
    pub shared_paths: Vec<String>,
    #[serde(default)]
    pub install: Vec<String>,
    #[serde(default)]
    pub migrate: Vec<String>,
    /// Services reloaded after each pointer swap
    #[serde(default)]
    pub reload_services: Vec<String>,
    #[serde(default)]
    pub pre_checks: Vec<HealthCheck>,
    #[serde(default)]
    pub post_checks: Vec<HealthCheck>,
}

/// Host-side directory layout under the deploy path.
#[derive(Debug, Clone)]
pub struct ReleaseLayout {
    root: String,
}

impl ReleaseLayout {
    pub fn new(deploy_path: &str) -> Self {
        Self {
            root: deploy_path.trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn releases(&self) -> String {
        join_remote(&self.root, "releases")
    }

    pub fn release(&self, id: &str) -> String {
        join_remote(&self.releases(), id)
    }

    pub fn metadata(&self, id: &str) -> String {
        join_remote(&self.release(id), METADATA_FILE)
    }

    pub fn shared(&self) -> String {
        join_remote(&self.root, "shared")
    }

    pub fn current(&self) -> String {
        join_remote(&self.root, "current")
    }

    pub fn marker(&self) -> String {
        join_remote(&self.root, ".keel/deploy.lock")
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployReport {
    pub host: String,
    pub release: Release,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pruned: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checks: Option<HealthReport>,
    pub duration_ms: u128,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackReport {
    pub host: String,
    pub from: String,
    pub to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checks: Option<HealthReport>,
}
