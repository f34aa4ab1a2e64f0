use std::path::PathBuf;

use clap::Args;
use serde::Serialize;

use keel::host::Host;
use keel::phases;
use keel::pipeline::{PhaseId, SkipSet};

use super::{CmdResult, GlobalArgs};

#[derive(Args)]
pub struct PlanArgs {
    /// Phase to leave out of the plan (repeatable)
    #[arg(long = "skip", value_name = "PHASE")]
    pub skip: Vec<PhaseId>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanOutput {
    pub config: PathBuf,
    pub topology: String,
    pub hosts: Vec<PlannedHost>,
    pub secrets_file: PathBuf,
    pub phases: Vec<PlannedPhase>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedHost {
    pub id: String,
    pub target: String,
    pub local: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedPhase {
    pub id: PhaseId,
    pub description: String,
    pub skipped: bool,
    pub skippable: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<PhaseId>,
    pub rollback: bool,
    pub steps: Vec<String>,
}

fn planned_host(host: &Host) -> PlannedHost {
    PlannedHost {
        id: host.id.clone(),
        target: host.label(),
        local: host.is_local(),
    }
}

/// Validate the topology and describe the run. No host is contacted.
pub fn run(args: PlanArgs, global: &GlobalArgs) -> CmdResult<PlanOutput> {
    let config = global.config_path();
    let topology = global.topology()?;
    let skip: SkipSet = args.skip.into_iter().collect();

    let phases = super::with_runtime(&topology, |rt| {
        let pipeline = phases::standard(&topology, rt)?;
        pipeline.validate_skip(&skip)?;
        Ok(pipeline
            .phases()
            .iter()
            .map(|phase| PlannedPhase {
                id: phase.id,
                description: phase.description.clone(),
                skipped: skip.contains(phase.id),
                skippable: phase.skippable,
                depends_on: phase.depends_on.clone(),
                rollback: phase.has_rollback(),
                steps: phase.steps.clone(),
            })
            .collect::<Vec<_>>())
    })?;

    Ok((
        PlanOutput {
            config,
            topology: topology.name.clone(),
            hosts: topology.hosts.all().into_iter().map(planned_host).collect(),
            secrets_file: topology.secrets_path()?,
            phases,
        },
        0,
    ))
}
