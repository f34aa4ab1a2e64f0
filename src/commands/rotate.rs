use clap::Args;

use keel::log_status;
use keel::notify;
use keel::rotation::{Coordinator, RotationPlan, RotationReport};

use super::{CmdResult, GlobalArgs};

#[derive(Args)]
pub struct RotateArgs {
    /// Secret names to rotate
    #[arg(required_unless_present = "all")]
    pub secrets: Vec<String>,

    /// Rotate every secret in the catalog
    #[arg(long, conflicts_with = "secrets")]
    pub all: bool,

    /// List the affected services and update steps without changing anything
    #[arg(long)]
    pub dry_run: bool,
}

pub fn run(args: RotateArgs, global: &GlobalArgs) -> CmdResult<RotationReport> {
    let topology = global.topology()?;
    let notifier = notify::from_config(topology.notify.webhook_url.as_deref())?;

    let selected: Vec<String> = if args.all {
        topology.secrets.iter().map(|s| s.name.clone()).collect()
    } else {
        args.secrets
    };
    let plan = RotationPlan::new(selected).dry_run(args.dry_run);

    super::with_runtime(&topology, |rt| {
        let verifier = super::verifier(&topology, rt);
        let coordinator = Coordinator {
            executor: rt.executor,
            hosts: &topology.hosts,
            store: rt.store,
            catalog: &topology.secrets,
            services: &topology.services,
            verifier: &verifier,
            notifier: notifier.as_ref(),
            run_id: super::new_run_id(),
            backup_retention: topology.settings.backup_retention,
            retries: topology.settings.transport_retries,
            backoff: topology.settings.retry_backoff(),
        };

        let report = coordinator.rotate(&plan)?;
        if !report.dry_run {
            log_status!(
                "rotate",
                "Rotated {} secret(s) across {} service(s)",
                report.secrets.len(),
                report.services.len()
            );
        }
        Ok((report, 0))
    })
}
