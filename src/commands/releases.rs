use clap::Args;
use serde::Serialize;

use keel::phases;
use keel::release::Release;

use super::{CmdResult, GlobalArgs};

#[derive(Args)]
pub struct ReleasesArgs {
    /// Remove retired releases beyond the retention limit
    #[arg(long)]
    pub prune: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleasesOutput {
    pub host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<String>,
    pub releases: Vec<Release>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pruned: Vec<String>,
}

pub fn run(args: ReleasesArgs, global: &GlobalArgs) -> CmdResult<ReleasesOutput> {
    let topology = global.topology()?;

    super::with_runtime(&topology, |rt| {
        let verifier = super::verifier(&topology, rt);
        let manager = phases::release_manager(rt, &topology, &verifier);

        let pruned = if args.prune { manager.prune()? } else { Vec::new() };
        let releases = manager.list()?;
        let current = manager.current_id()?;

        Ok((
            ReleasesOutput {
                host: topology.hosts.app.id.clone(),
                current,
                releases,
                pruned,
            },
            0,
        ))
    })
}
