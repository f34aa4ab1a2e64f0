use clap::Args;

use keel::deadline::Deadline;
use keel::notify;
use keel::phases;
use keel::pipeline::{PhaseGate, PhaseId, PipelineReport, RunOptions, SkipSet};

use super::{CmdResult, GlobalArgs};

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Skip admin account creation
    #[arg(long)]
    pub skip_user_setup: bool,

    /// Skip SSH daemon hardening
    #[arg(long)]
    pub skip_ssh: bool,

    /// Skip secret generation and audit
    #[arg(long)]
    pub skip_secrets: bool,

    /// Skip observability host preparation
    #[arg(long)]
    pub skip_observability_prep: bool,

    /// Skip application host preparation
    #[arg(long)]
    pub skip_app_prep: bool,

    /// Skip the release deploy
    #[arg(long)]
    pub skip_deploy: bool,

    /// Skip observability stack activation
    #[arg(long)]
    pub skip_observability: bool,

    /// Skip the final health verification
    #[arg(long)]
    pub skip_verification: bool,

    /// Describe every phase without touching any host
    #[arg(long)]
    pub dry_run: bool,

    /// Ask before each phase
    #[arg(long, conflicts_with = "dry_run")]
    pub interactive: bool,

    /// Stop starting new work after this many seconds
    #[arg(long, value_name = "SECS")]
    pub deadline: Option<u64>,
}

impl RunArgs {
    pub fn skip_set(&self) -> SkipSet {
        [
            (self.skip_user_setup, PhaseId::UserSetup),
            (self.skip_ssh, PhaseId::Ssh),
            (self.skip_secrets, PhaseId::Secrets),
            (self.skip_observability_prep, PhaseId::ObservabilityPrep),
            (self.skip_app_prep, PhaseId::AppPrep),
            (self.skip_deploy, PhaseId::Deploy),
            (self.skip_observability, PhaseId::Observability),
            (self.skip_verification, PhaseId::Verification),
        ]
        .into_iter()
        .filter_map(|(skip, phase)| skip.then_some(phase))
        .collect()
    }
}

pub fn run(args: RunArgs, global: &GlobalArgs) -> CmdResult<PipelineReport> {
    let topology = global.topology()?;
    let notifier = notify::from_config(topology.notify.webhook_url.as_deref())?;

    let gate = crate::tty::PromptGate;
    if args.interactive && !crate::tty::require_tty_for_interactive() {
        return Err(keel::Error::validation_invalid_argument(
            "interactive",
            "--interactive requires a terminal on stdin and stdout",
            None,
            None,
        ));
    }

    let options = RunOptions {
        run_id: super::new_run_id(),
        skip: args.skip_set(),
        dry_run: args.dry_run,
        interactive: args.interactive.then_some(&gate as &dyn PhaseGate),
        deadline: Deadline::from_secs(args.deadline),
    };

    tracing::info!(
        run_id = %options.run_id,
        topology = %topology.name,
        dry_run = options.dry_run,
        skipped = ?options.skip.iter().map(|p| p.as_str()).collect::<Vec<_>>(),
        "starting run"
    );

    let report = super::with_runtime(&topology, |rt| {
        let pipeline = phases::standard(&topology, rt)?;
        pipeline.validate_skip(&options.skip)?;
        pipeline.run(&options, notifier.as_ref())
    })?;

    let exit_code = report.exit_code();
    Ok((report, exit_code))
}
