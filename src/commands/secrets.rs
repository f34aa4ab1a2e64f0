use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use serde::Serialize;

use keel::log_status;
use keel::secrets::{self, Finding, GenerateReport, SecretFormat};

use super::{CmdResult, GlobalArgs};

#[derive(Args)]
pub struct SecretsArgs {
    #[command(subcommand)]
    command: SecretsCommand,
}

#[derive(Subcommand)]
enum SecretsCommand {
    /// Generate values for catalog secrets that have none
    Generate {
        /// Regenerate every value (the previous file is backed up first)
        #[arg(long)]
        force: bool,

        /// Report what would be generated without writing
        #[arg(long)]
        dry_run: bool,
    },
    /// Show catalog secrets with masked values
    List,
    /// Audit stored values for placeholders, weak passwords, length and format
    Validate,
}

#[derive(Serialize)]
#[serde(tag = "command")]
pub enum SecretsOutput {
    #[serde(rename = "secrets.generate")]
    Generate {
        path: PathBuf,
        #[serde(flatten)]
        report: GenerateReport,
    },
    #[serde(rename = "secrets.list")]
    List {
        path: PathBuf,
        version: u64,
        #[serde(rename = "updatedAt", skip_serializing_if = "Option::is_none")]
        updated_at: Option<DateTime<Utc>>,
        secrets: Vec<SecretEntry>,
        backups: Vec<PathBuf>,
    },
    #[serde(rename = "secrets.validate")]
    Validate {
        path: PathBuf,
        version: u64,
        valid: bool,
        findings: Vec<Finding>,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretEntry {
    pub name: String,
    pub format: SecretFormat,
    pub min_length: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub masked: Option<String>,
}

pub fn run(args: SecretsArgs, global: &GlobalArgs) -> CmdResult<SecretsOutput> {
    let topology = global.topology()?;
    let store = topology.secrets_store()?;
    let path = store.path().to_path_buf();

    match args.command {
        SecretsCommand::Generate { force, dry_run } => {
            let report = store.ensure_generated(&topology.secrets, force, dry_run)?;
            if !dry_run && !report.generated.is_empty() {
                log_status!(
                    "secrets",
                    "Generated {} value(s) in {}",
                    report.generated.len(),
                    path.display()
                );
            }
            Ok((SecretsOutput::Generate { path, report }, 0))
        }
        SecretsCommand::List => {
            let record = store.load()?;
            let entries = topology
                .secrets
                .iter()
                .map(|spec| SecretEntry {
                    name: spec.name.clone(),
                    format: spec.format,
                    min_length: spec.min_length,
                    masked: record.get(&spec.name).map(secrets::mask),
                })
                .collect();
            Ok((
                SecretsOutput::List {
                    path,
                    version: record.version,
                    updated_at: record.updated_at,
                    secrets: entries,
                    backups: store.list_backups()?,
                },
                0,
            ))
        }
        SecretsCommand::Validate => {
            let record = store.load()?;
            let findings = secrets::audit_record(&topology.secrets, &record);
            let valid = findings.is_empty();
            Ok((
                SecretsOutput::Validate {
                    path,
                    version: record.version,
                    valid,
                    findings,
                },
                if valid { 0 } else { 1 },
            ))
        }
    }
}
