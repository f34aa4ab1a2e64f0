use clap::Args;

use keel::log_status;
use keel::phases;
use keel::release::RollbackReport;

use super::{CmdResult, GlobalArgs};

#[derive(Args)]
pub struct RollbackArgs {
    /// Release id to reactivate (defaults to the previously active release)
    #[arg(long)]
    pub to: Option<String>,
}

pub fn run(args: RollbackArgs, global: &GlobalArgs) -> CmdResult<RollbackReport> {
    let topology = global.topology()?;

    super::with_runtime(&topology, |rt| {
        let verifier = super::verifier(&topology, rt);
        let report = phases::release_manager(rt, &topology, &verifier).rollback(args.to.as_deref())?;
        log_status!("rollback", "{} -> {}", report.from, report.to);
        Ok((report, 0))
    })
}
