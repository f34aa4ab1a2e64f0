use std::path::PathBuf;

use clap::Args;
use serde::Serialize;

use keel::log_status;
use keel::phases;
use keel::release::{DeployReport, ReleaseSource};

use super::{CmdResult, GlobalArgs};

#[derive(Args)]
pub struct DeployArgs {
    /// Deploy from this git repository instead of app.source
    #[arg(long, requires = "reference", conflicts_with_all = ["archive", "path"])]
    pub git: Option<String>,

    /// Branch, tag or commit to fetch with --git
    #[arg(long = "ref", value_name = "REF")]
    pub reference: Option<String>,

    /// Deploy a local .tar.gz
    #[arg(long, conflicts_with = "path")]
    pub archive: Option<PathBuf>,

    /// Deploy a directory already on the application host
    #[arg(long)]
    pub path: Option<String>,

    /// Show the deploy steps without executing
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployOutput {
    pub command: String,
    pub source: String,
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<DeployReport>,
}

impl DeployArgs {
    fn source(self) -> Option<ReleaseSource> {
        if let (Some(repository), Some(reference)) = (self.git, self.reference) {
            return Some(ReleaseSource::Git {
                repository,
                reference,
            });
        }
        if let Some(path) = self.archive {
            return Some(ReleaseSource::Archive { path });
        }
        self.path.map(|path| ReleaseSource::Path { path })
    }
}

pub fn run(args: DeployArgs, global: &GlobalArgs) -> CmdResult<DeployOutput> {
    let topology = global.topology()?;
    let dry_run = args.dry_run;

    let source = match args.source().or_else(|| topology.app.source.clone()) {
        Some(source) => source,
        None => {
            return Err(keel::Error::config_missing_key("app.source", None)
                .with_hint("Declare app.source or pass --git/--archive/--path"))
        }
    };

    super::with_runtime(&topology, |rt| {
        let verifier = super::verifier(&topology, rt);
        let manager = phases::release_manager(rt, &topology, &verifier);

        if dry_run {
            return Ok((
                DeployOutput {
                    command: "deploy".to_string(),
                    source: source.describe(),
                    dry_run,
                    steps: manager.plan(&source),
                    result: None,
                },
                0,
            ));
        }

        log_status!("deploy", "Deploying {} to {}", source.describe(), topology.hosts.app.label());
        let report = manager.deploy(&source)?;
        log_status!("deploy", "Release {} is active", report.release.id);

        Ok((
            DeployOutput {
                command: "deploy".to_string(),
                source: source.describe(),
                dry_run,
                steps: Vec::new(),
                result: Some(report),
            },
            0,
        ))
    })
}
