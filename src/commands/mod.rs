use std::path::PathBuf;

use keel::config::{self, Topology};
use keel::health::{HealthVerifier, RemoteProbe};
use keel::phases::Runtime;
use keel::ssh::SshExecutor;

pub type CmdResult<T> = keel::Result<(T, i32)>;

pub(crate) struct GlobalArgs {
    pub config: Option<String>,
}

impl GlobalArgs {
    pub fn config_path(&self) -> PathBuf {
        config::resolve_path(self.config.as_deref())
    }

    /// Load and validate the topology. Nothing reaches a host before this succeeds.
    pub fn topology(&self) -> keel::Result<Topology> {
        let topology = Topology::load(&self.config_path())?;
        topology.validate()?;
        Ok(topology)
    }
}

/// Fresh id shared by every log line and notification of one invocation.
pub(crate) fn new_run_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Build the SSH-backed runtime for a topology and hand it to `f`.
pub(crate) fn with_runtime<T>(
    topology: &Topology,
    f: impl FnOnce(&Runtime) -> keel::Result<T>,
) -> keel::Result<T> {
    let executor = SshExecutor::new(topology.settings.ssh_connect_timeout_secs);
    let probe = RemoteProbe::new(&executor, &topology.hosts)?;
    let store = topology.secrets_store()?;
    f(&Runtime {
        executor: &executor,
        probe: &probe,
        store: &store,
    })
}

pub(crate) fn verifier<'a>(topology: &Topology, rt: &'a Runtime) -> HealthVerifier<'a> {
    HealthVerifier::new(rt.probe, topology.settings.health_backoff())
}

pub mod deploy;
pub mod health;
pub mod plan;
pub mod releases;
pub mod rollback;
pub mod rotate;
pub mod run;
pub mod secrets;

/// Dispatch a command to its handler and map result to JSON.
macro_rules! dispatch {
    ($args:expr, $global:expr, $module:ident) => {
        crate::output::map_cmd_result_to_json($module::run($args, $global))
    };
}

pub(crate) fn run_json(
    command: crate::Commands,
    global: &GlobalArgs,
) -> (keel::Result<serde_json::Value>, i32) {
    crate::tty::status("keel is working...");

    match command {
        crate::Commands::Run(args) => dispatch!(args, global, run),
        crate::Commands::Plan(args) => dispatch!(args, global, plan),
        crate::Commands::Deploy(args) => dispatch!(args, global, deploy),
        crate::Commands::Rollback(args) => dispatch!(args, global, rollback),
        crate::Commands::Releases(args) => dispatch!(args, global, releases),
        crate::Commands::Rotate(args) => dispatch!(args, global, rotate),
        crate::Commands::Secrets(args) => dispatch!(args, global, secrets),
        crate::Commands::Health(args) => dispatch!(args, global, health),
    }
}
