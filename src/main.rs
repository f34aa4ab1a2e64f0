use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use commands::GlobalArgs;

mod commands;
mod output;
mod tty;

use commands::{deploy, health, plan, releases, rollback, rotate, run, secrets};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "keel")]
#[command(version = VERSION)]
#[command(about = "Provision, deploy and rotate secrets on an application and observability host pair")]
struct Cli {
    /// Topology file (defaults to $KEEL_CONFIG, then ./keel.json)
    #[arg(long, global = true, env = "KEEL_CONFIG", value_name = "PATH")]
    config: Option<String>,

    /// Log debug diagnostics to stderr (KEEL_LOG overrides)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the provisioning pipeline
    Run(run::RunArgs),
    /// Validate the topology and show what a run would do
    Plan(plan::PlanArgs),
    /// Deploy a new release to the application host
    Deploy(deploy::DeployArgs),
    /// Reactivate a previous release
    Rollback(rollback::RollbackArgs),
    /// List releases on the application host
    Releases(releases::ReleasesArgs),
    /// Rotate secrets across the services that consume them
    Rotate(rotate::RotateArgs),
    /// Manage the local secrets file
    Secrets(secrets::SecretsArgs),
    /// Run the verification health checks
    Health(health::HealthArgs),
}

fn init_tracing(verbose: u8) {
    let filter = EnvFilter::try_from_env("KEEL_LOG").unwrap_or_else(|_| match verbose {
        0 => EnvFilter::new("keel=warn"),
        1 => EnvFilter::new("keel=info"),
        2 => EnvFilter::new("keel=debug"),
        _ => EnvFilter::new("keel=trace"),
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();
}

fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let global = GlobalArgs { config: cli.config };

    let (json_result, exit_code) = commands::run_json(cli.command, &global);
    if let Err(e) = output::print_json_result(json_result) {
        eprintln!("{}", e);
        return std::process::ExitCode::from(1);
    }

    std::process::ExitCode::from(exit_code_to_u8(exit_code))
}

fn exit_code_to_u8(code: i32) -> u8 {
    if code <= 0 {
        0
    } else if code >= 255 {
        255
    } else {
        code as u8
    }
}
