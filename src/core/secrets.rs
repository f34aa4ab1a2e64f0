//! Secrets store: the single source of truth for credential values.
//!
//! Values live in one owner-only `KEY=VALUE` file headed by
//! `# keel-secrets version=<n> updated=<rfc3339>`. Every mutation goes through
//! [`SecretsStore::commit`], which takes the version the caller read and
//! refuses to write when the file moved on in between.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::local_files::{self, FileSystem};
use crate::lock::LocalLock;

const HEADER_PREFIX: &str = "# keel-secrets";
const APP_KEY_PREFIX: &str = "base64:";
const APP_KEY_BYTES: usize = 32;
/// `base64:` plus the padded encoding of the key bytes.
const APP_KEY_LENGTH: usize = APP_KEY_PREFIX.len() + APP_KEY_BYTES.div_ceil(3) * 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecretFormat {
    #[default]
    Alphanumeric,
    Base64,
    Hex,
    AppKey,
}

impl SecretFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecretFormat::Alphanumeric => "alphanumeric",
            SecretFormat::Base64 => "base64",
            SecretFormat::Hex => "hex",
            SecretFormat::AppKey => "app-key",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretSpec {
    pub name: String,
    #[serde(default)]
    pub format: SecretFormat,
    #[serde(default = "default_min_length")]
    pub min_length: usize,
}

fn default_min_length() -> usize {
    32
}

impl SecretSpec {
    pub fn new(name: &str, format: SecretFormat, min_length: usize) -> Self {
        Self {
            name: name.to_string(),
            format,
            min_length,
        }
    }
}

// ============================================================================
// Generation
// ============================================================================

/// Generate a value meeting the entry's length and character class, from the OS RNG.
pub fn generate(spec: &SecretSpec) -> String {
    let n = spec.min_length.max(1);
    match spec.format {
        SecretFormat::Alphanumeric => OsRng
            .sample_iter(&Alphanumeric)
            .take(n)
            .map(char::from)
            .collect(),
        SecretFormat::Hex => {
            let bytes = random_bytes(n.div_ceil(2));
            let mut hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
            hex.truncate(n);
            hex
        }
        SecretFormat::Base64 => {
            // Whole 3-byte groups encode without padding to a multiple of 4 chars.
            let groups = n.div_ceil(4);
            STANDARD.encode(random_bytes(groups * 3))
        }
        SecretFormat::AppKey => {
            format!("{}{}", APP_KEY_PREFIX, STANDARD.encode(random_bytes(APP_KEY_BYTES)))
        }
    }
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}

// ============================================================================
// Audit
// ============================================================================

const WEAK_PASSWORDS: &[&str] = &[
    "password",
    "password1",
    "123456",
    "admin",
    "root",
    "changeme",
    "default",
    "guest",
    "test",
    "demo",
];

fn placeholder_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"(?i)^CHANGE[_-]?ME",
            r"(?i)^YOUR[_-]",
            r"(?i)^REPLACE[_-]",
            r"(?i)^TODO",
            r"(?i)^FIXME",
            r"^<.*>$",
            r"^\[.*\]$",
            r"(?i)^xxx+",
            r"(?i)^example",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect()
    })
}

/// Upper-case letter first, then upper-case letters, digits or underscores.
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_uppercase())
        && chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

pub fn is_placeholder(value: &str) -> bool {
    placeholder_patterns().iter().any(|p| p.is_match(value))
}

pub fn is_weak_password(value: &str) -> bool {
    let lower = value.to_lowercase();
    WEAK_PASSWORDS.contains(&lower.as_str())
}

/// Problems with `value` measured against `spec`; empty when acceptable.
pub fn audit(spec: &SecretSpec, value: &str) -> Vec<String> {
    let mut problems = Vec::new();

    if value.is_empty() {
        problems.push("value is empty".to_string());
        return problems;
    }
    if is_placeholder(value) {
        problems.push("looks like a placeholder".to_string());
    }
    if is_weak_password(value) {
        problems.push("is a well-known weak password".to_string());
    }

    let len = value.chars().count();
    if len < spec.min_length {
        problems.push(format!(
            "shorter than {} characters ({})",
            spec.min_length, len
        ));
    }

    match spec.format {
        SecretFormat::AppKey => match value.strip_prefix(APP_KEY_PREFIX) {
            Some(encoded) => {
                let decoded = STANDARD.decode(encoded).map(|b| b.len()).unwrap_or(0);
                if decoded != APP_KEY_BYTES {
                    problems.push(format!(
                        "app key must encode {} bytes after '{}'",
                        APP_KEY_BYTES, APP_KEY_PREFIX
                    ));
                }
            }
            None => problems.push(format!("app key must start with '{}'", APP_KEY_PREFIX)),
        },
        format => {
            let class_ok = match format {
                SecretFormat::Alphanumeric => value.chars().all(|c| c.is_ascii_alphanumeric()),
                SecretFormat::Hex => value.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')),
                _ => {
                    let body = value.trim_end_matches('=');
                    value.len() - body.len() <= 2
                        && body
                            .chars()
                            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '/')
                }
            };
            if !class_ok {
                problems.push(format!("contains characters outside the {} class", format.as_str()));
            }
        }
    }

    problems
}

/// Catalog-level problems: malformed or duplicate names.
pub fn validate_catalog(catalog: &[SecretSpec]) -> Vec<String> {
    let mut problems = Vec::new();
    let mut seen = HashSet::new();
    for spec in catalog {
        if !is_valid_name(&spec.name) {
            problems.push(format!(
                "secret name '{}' must be upper-case letters, digits and underscores",
                spec.name
            ));
        }
        if !seen.insert(spec.name.as_str()) {
            problems.push(format!("secret '{}' is declared more than once", spec.name));
        }
        if spec.min_length == 0 {
            problems.push(format!("secret '{}' has a zero minimum length", spec.name));
        }
        if spec.format == SecretFormat::AppKey && spec.min_length > APP_KEY_LENGTH {
            problems.push(format!(
                "secret '{}' wants {} characters but app keys are always {}",
                spec.name, spec.min_length, APP_KEY_LENGTH
            ));
        }
    }
    problems
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub name: String,
    pub problems: Vec<String>,
}

/// Audit every catalog entry against the record. Values outside the catalog
/// are reported too.
pub fn audit_record(catalog: &[SecretSpec], record: &SecretsRecord) -> Vec<Finding> {
    let mut findings = Vec::new();

    for spec in catalog {
        let problems = match record.get(&spec.name) {
            Some(value) => audit(spec, value),
            None => vec!["missing from the secrets file".to_string()],
        };
        if !problems.is_empty() {
            findings.push(Finding {
                name: spec.name.clone(),
                problems,
            });
        }
    }

    for name in record.names() {
        if !catalog.iter().any(|s| s.name == name) {
            findings.push(Finding {
                name: name.to_string(),
                problems: vec!["not declared in the catalog".to_string()],
            });
        }
    }

    findings
}

/// Display form: short values fully hidden, longer ones keep 3 leading and 2 trailing characters.
pub fn mask(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 8 {
        return "***".to_string();
    }
    let head: String = chars[..3].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{}...{}", head, tail)
}

// ============================================================================
// Record
// ============================================================================

#[derive(Clone, PartialEq, Eq, Default)]
pub struct SecretsRecord {
    pub version: u64,
    pub updated_at: Option<DateTime<Utc>>,
    values: BTreeMap<String, String>,
}

impl fmt::Debug for SecretsRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretsRecord")
            .field("version", &self.version)
            .field("updated_at", &self.updated_at)
            .field("names", &self.names().collect::<Vec<_>>())
            .finish()
    }
}

impl SecretsRecord {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn parse(content: &str, source: &Path) -> Result<Self> {
        let mut record = SecretsRecord::default();

        for (index, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if let Some(header) = line.strip_prefix(HEADER_PREFIX) {
                for field in header.split_whitespace() {
                    match field.split_once('=') {
                        Some(("version", v)) => {
                            record.version = v.parse().map_err(|_| {
                                Error::config_invalid_value(
                                    source.display().to_string(),
                                    Some(v.to_string()),
                                    "secrets header version is not a number",
                                )
                            })?;
                        }
                        Some(("updated", v)) => {
                            record.updated_at = DateTime::parse_from_rfc3339(v)
                                .ok()
                                .map(|t| t.with_timezone(&Utc));
                        }
                        _ => {}
                    }
                }
                continue;
            }
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = raw.split_once('=').ok_or_else(|| {
                Error::config_invalid_value(
                    format!("{}:{}", source.display(), index + 1),
                    None,
                    "expected KEY=VALUE",
                )
            })?;
            record
                .values
                .insert(key.trim().to_string(), value.to_string());
        }

        Ok(record)
    }

    pub fn serialize(&self) -> String {
        let updated = self
            .updated_at
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_default();
        let mut out = format!("{} version={} updated={}\n", HEADER_PREFIX, self.version, updated);
        for (key, value) in &self.values {
            out.push_str(key);
            out.push('=');
            out.push_str(value);
            out.push('\n');
        }
        out
    }
}

// ============================================================================
// Store
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateReport {
    pub version: u64,
    pub generated: Vec<String>,
    pub kept: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<PathBuf>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct SecretsStore {
    path: PathBuf,
    backups: PathBuf,
}

impl SecretsStore {
    pub fn new(path: impl Into<PathBuf>, backups: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            backups: backups.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        self.path.with_extension("lock")
    }

    /// Exclusive lock for the duration of a mutation.
    pub fn lock(&self) -> Result<LocalLock> {
        LocalLock::acquire(&self.lock_path())
    }

    /// A missing file is an empty record at version 0.
    pub fn load(&self) -> Result<SecretsRecord> {
        if !self.path.exists() {
            return Ok(SecretsRecord::default());
        }
        let content = local_files::local().read(&self.path)?;
        SecretsRecord::parse(&content, &self.path)
    }

    /// Replace the stored values if the file is still at `expected_version`.
    /// Returns the new record at `expected_version + 1`.
    pub fn commit(
        &self,
        _lock: &LocalLock,
        expected_version: u64,
        values: BTreeMap<String, String>,
    ) -> Result<SecretsRecord> {
        let current = self.load()?;
        if current.version != expected_version {
            return Err(Error::secrets_version_conflict(expected_version, current.version));
        }

        let record = SecretsRecord {
            version: expected_version + 1,
            updated_at: Some(Utc::now()),
            values,
        };

        let fs = local_files::local();
        if let Some(parent) = self.path.parent() {
            fs.ensure_dir(parent)?;
        }
        fs.write_private(&self.path, &record.serialize())?;
        tracing::info!(path = %self.path.display(), version = record.version, "secrets committed");
        Ok(record)
    }

    /// Copy the record to a timestamped owner-only backup.
    pub fn snapshot(&self, _lock: &LocalLock, record: &SecretsRecord) -> Result<PathBuf> {
        let fs = local_files::local();
        fs.ensure_dir(&self.backups)?;

        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string();
        let mut path = self.backups.join(format!("secrets-{}.env", stamp));
        let mut n = 1;
        while path.exists() {
            path = self.backups.join(format!("secrets-{}-{}.env", stamp, n));
            n += 1;
        }

        fs.write_private(&path, &record.serialize())?;
        tracing::debug!(backup = %path.display(), version = record.version, "secrets snapshot");
        Ok(path)
    }

    /// Bring the stored values back to `snapshot`. A store that never moved
    /// is left untouched; otherwise the values are written as a new version.
    pub fn restore(&self, lock: &LocalLock, snapshot: &SecretsRecord) -> Result<SecretsRecord> {
        let current = self.load()?;
        if current.values == snapshot.values {
            return Ok(current);
        }
        self.commit(lock, current.version, snapshot.values.clone())
    }

    /// Fill in catalog entries that have no value yet. With `force` every
    /// entry is regenerated after a backup of the previous values.
    pub fn ensure_generated(
        &self,
        catalog: &[SecretSpec],
        force: bool,
        dry_run: bool,
    ) -> Result<GenerateReport> {
        if dry_run {
            let current = self.load()?;
            let (generated, kept) = partition(catalog, &current, force);
            return Ok(GenerateReport {
                version: current.version,
                generated,
                kept,
                backup: None,
                dry_run: true,
            });
        }

        let lock = self.lock()?;
        let current = self.load()?;
        let (generated, kept) = partition(catalog, &current, force);

        if generated.is_empty() {
            return Ok(GenerateReport {
                version: current.version,
                generated,
                kept,
                backup: None,
                dry_run: false,
            });
        }

        let backup = if force && !current.is_empty() {
            Some(self.snapshot(&lock, &current)?)
        } else {
            None
        };

        let mut values = current.values.clone();
        for spec in catalog.iter().filter(|s| generated.contains(&s.name)) {
            values.insert(spec.name.clone(), generate(spec));
        }

        let record = self.commit(&lock, current.version, values)?;
        Ok(GenerateReport {
            version: record.version,
            generated,
            kept,
            backup,
            dry_run: false,
        })
    }

    pub fn list_backups(&self) -> Result<Vec<PathBuf>> {
        let mut backups: Vec<PathBuf> = local_files::local()
            .list(&self.backups)?
            .into_iter()
            .filter(|e| !e.is_dir && e.has_extension("env"))
            .map(|e| e.path)
            .filter(|p| {
                p.file_name()
                    .is_some_and(|n| n.to_string_lossy().starts_with("secrets-"))
            })
            .collect();
        backups.sort();
        Ok(backups)
    }

    /// Delete all but the newest `keep` backups; returns what was removed.
    pub fn prune_backups(&self, keep: usize) -> Result<Vec<PathBuf>> {
        let backups = self.list_backups()?;
        let excess = backups.len().saturating_sub(keep);
        let fs = local_files::local();
        let mut removed = Vec::new();
        for path in backups.into_iter().take(excess) {
            fs.delete(&path)?;
            removed.push(path);
        }
        Ok(removed)
    }
}

fn partition(catalog: &[SecretSpec], record: &SecretsRecord, force: bool) -> (Vec<String>, Vec<String>) {
    catalog
        .iter()
        .map(|s| s.name.clone())
        .partition(|name| force || record.get(name).is_none())
}
