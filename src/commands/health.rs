use clap::Args;

use keel::health::HealthReport;

use super::{CmdResult, GlobalArgs};

#[derive(Args)]
pub struct HealthArgs {
    /// Only run the named check (repeatable)
    #[arg(long = "check", value_name = "NAME")]
    pub checks: Vec<String>,
}

/// Run the verification checks once, outside a pipeline run.
pub fn run(args: HealthArgs, global: &GlobalArgs) -> CmdResult<HealthReport> {
    let topology = global.topology()?;

    let mut checks = topology.verification_checks();
    if !args.checks.is_empty() {
        if let Some(unknown) = args.checks.iter().find(|n| !checks.iter().any(|c| &c.name == *n)) {
            return Err(keel::Error::validation_invalid_argument(
                "check",
                format!("No check named '{}'", unknown),
                Some(unknown.clone()),
                Some(checks.iter().map(|c| c.name.clone()).collect()),
            ));
        }
        checks.retain(|c| args.checks.contains(&c.name));
    }

    super::with_runtime(&topology, |rt| {
        let report = super::verifier(&topology, rt).check_all(&checks);
        let exit_code = if report.passed { 0 } else { 1 };
        Ok((report, exit_code))
    })
}
