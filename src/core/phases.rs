//! The standard run: eight phases built from a topology.

use crate::config::{Topology, SSHD_CONFIG};
use crate::error::{Error, Result};
use crate::health::{HealthVerifier, Probe};
use crate::host::Host;
use crate::ops::{self, OpContext, OpOutcome};
use crate::pipeline::{per_host, Phase, PhaseId, Pipeline};
use crate::release::ReleaseManager;
use crate::secrets::{self, SecretsStore};
use crate::ssh::RemoteExecutor;
use crate::utils::shell::quote_path;

/// Collaborators every phase runs against.
pub struct Runtime<'a> {
    pub executor: &'a dyn RemoteExecutor,
    pub probe: &'a dyn Probe,
    pub store: &'a SecretsStore,
}

pub fn op_context<'c>(rt: &'c Runtime, topology: &Topology, host: &'c Host) -> OpContext<'c> {
    OpContext::new(rt.executor, host).with_retries(
        topology.settings.transport_retries,
        topology.settings.retry_backoff(),
    )
}

/// Release manager for the application host, with the topology's retention and retry policy.
pub fn release_manager<'m>(
    rt: &'m Runtime,
    topology: &'m Topology,
    verifier: &'m HealthVerifier<'m>,
) -> ReleaseManager<'m> {
    ReleaseManager::new(rt.executor, &topology.hosts.app, &topology.app.release, verifier)
        .with_retention(topology.settings.retention)
        .with_retries(
            topology.settings.transport_retries,
            topology.settings.retry_backoff(),
        )
}

pub fn standard<'a>(topology: &'a Topology, rt: &'a Runtime<'a>) -> Result<Pipeline<'a>> {
    Pipeline::new(vec![
        user_setup(topology, rt),
        ssh(topology, rt),
        secrets_phase(topology, rt),
        observability_prep(topology, rt),
        app_prep(topology, rt),
        deploy(topology, rt),
        observability(topology, rt),
        verification(topology, rt),
    ])
}

fn user_setup<'a>(topology: &'a Topology, rt: &'a Runtime<'a>) -> Phase<'a> {
    let admin = &topology.admin;
    let steps = if admin.user.is_empty() {
        vec!["no admin account declared".to_string()]
    } else {
        vec![
            format!("ensure user {} on both hosts", admin.user),
            format!("authorize {} key(s)", admin.authorized_keys.len()),
        ]
    };

    Phase::new(PhaseId::UserSetup, "create the admin account and authorize its keys", move |_| {
        if admin.user.is_empty() {
            return Ok(Vec::new());
        }
        per_host(&topology.hosts.all(), |host| {
            let ctx = op_context(rt, topology, host);
            let mut out = vec![ops::ensure_user(
                &ctx,
                &admin.user,
                &admin.groups,
                admin.shell.as_deref(),
            )?];
            for key in &admin.authorized_keys {
                out.push(ops::ensure_authorized_key(&ctx, &admin.user, key)?);
            }
            Ok(out)
        })
    })
    .with_steps(steps)
}

fn ssh<'a>(topology: &'a Topology, rt: &'a Runtime<'a>) -> Phase<'a> {
    let steps = topology
        .sshd
        .iter()
        .map(|(k, v)| format!("set {} {} in {}", k, v, SSHD_CONFIG))
        .chain(std::iter::once("validate and reload ssh if changed".to_string()))
        .collect();

    Phase::new(PhaseId::Ssh, "harden sshd on both hosts", move |_| {
        per_host(&topology.hosts.all(), |host| {
            let ctx = op_context(rt, topology, host);
            preserve(&ctx, SSHD_CONFIG)?;
            let mut out = Vec::new();
            for (key, value) in &topology.sshd {
                out.push(ops::ensure_setting(&ctx, SSHD_CONFIG, key, " ", value)?);
            }
            if out.iter().any(|o| o.changed) {
                ctx.apply("sshd -t")?;
                out.push(ops::reload_service(&ctx, "ssh")?);
            }
            Ok(out)
        })
    })
    .depends_on(&[PhaseId::UserSetup])
    .with_steps(steps)
    .with_rollback(move |_| {
        per_host(&topology.hosts.all(), |host| {
            let ctx = op_context(rt, topology, host);
            let restored = restore(&ctx, SSHD_CONFIG)?;
            let mut out = vec![];
            if restored.changed {
                out.push(ops::reload_service(&ctx, "ssh")?);
            }
            out.insert(0, restored);
            Ok(out)
        })
    })
}

fn secrets_phase<'a>(topology: &'a Topology, rt: &'a Runtime<'a>) -> Phase<'a> {
    let steps = vec![format!(
        "generate missing values for {} catalog secret(s) in {}",
        topology.secrets.len(),
        rt.store.path().display()
    )];

    Phase::new(PhaseId::Secrets, "generate missing secrets", move |_| {
        let report = rt.store.ensure_generated(&topology.secrets, false, false)?;
        let record = rt.store.load()?;

        for finding in secrets::audit_record(&topology.secrets, &record) {
            if topology.secret_spec(&finding.name).is_none() {
                tracing::warn!(secret = %finding.name, "value not declared in the catalog");
                continue;
            }
            return Err(Error::secret_invalid(finding.name, finding.problems)
                .with_hint("Replace it with 'keel rotate <NAME>'"));
        }

        let outcome = |name: &String, changed: bool| OpOutcome {
            operation: "ensure_secret".to_string(),
            host: "local".to_string(),
            resource: name.clone(),
            changed,
            dry_run: false,
            detail: None,
        };
        Ok(report
            .generated
            .iter()
            .map(|n| outcome(n, true))
            .chain(report.kept.iter().map(|n| outcome(n, false)))
            .collect())
    })
    .with_steps(steps)
}

fn observability_prep<'a>(topology: &'a Topology, rt: &'a Runtime<'a>) -> Phase<'a> {
    let plan = &topology.observability.plan;
    Phase::new(PhaseId::ObservabilityPrep, "prepare the observability host", move |_| {
        let ctx = op_context(rt, topology, &topology.hosts.observability);
        ops::apply_host_plan(&ctx, plan)
    })
    .with_steps(vec![plan.describe()])
}

fn app_prep<'a>(topology: &'a Topology, rt: &'a Runtime<'a>) -> Phase<'a> {
    let app = &topology.app;
    let mut steps = vec![app.plan.describe()];
    if let Some(db) = &app.database {
        steps.push(format!("ensure role {} and database {}", db.role, db.name));
    }
    if let Some(env) = &app.env_file {
        steps.push(format!("write {} key(s) to {}", env.keys.len(), env.path));
    }

    Phase::new(PhaseId::AppPrep, "prepare the application host", move |_| {
        let ctx = op_context(rt, topology, &topology.hosts.app);
        let mut out = ops::apply_host_plan(&ctx, &app.plan)?;
        if app.database.is_none() && app.env_file.is_none() {
            return Ok(out);
        }

        let record = rt.store.load()?;
        let secret = |name: &str| {
            record.get(name).ok_or_else(|| {
                Error::precondition_failed(
                    format!("secret {}", name),
                    "secret has no value; run the secrets phase or 'keel secrets generate'",
                )
            })
        };

        if let Some(db) = &app.database {
            out.push(ops::ensure_db_role(&ctx, &db.role, secret(&db.password_secret)?)?);
            out.push(ops::ensure_database(&ctx, &db.name, &db.role)?);
        }
        if let Some(env) = &app.env_file {
            for (key, name) in &env.keys {
                out.push(ops::ensure_key_value(&ctx, &env.path, key, secret(name)?)?);
            }
            out.push(ops::ensure_file_mode(&ctx, &env.path, "600")?);
        }
        Ok(out)
    })
    .depends_on(&[PhaseId::Secrets])
    .with_steps(steps)
}

fn deploy<'a>(topology: &'a Topology, rt: &'a Runtime<'a>) -> Phase<'a> {
    let steps = match &topology.app.source {
        Some(source) => {
            let verifier = HealthVerifier::new(rt.probe, topology.settings.health_backoff());
            release_manager(rt, topology, &verifier).plan(source)
        }
        None => vec!["no release source configured".to_string()],
    };

    Phase::new(PhaseId::Deploy, "deploy a new application release", move |ctx| {
        let source = topology.app.source.as_ref().ok_or_else(|| {
            Error::config_missing_key("app.source", None)
                .with_hint("Declare app.source or skip this phase with --skip-deploy")
        })?;
        let verifier = HealthVerifier::new(rt.probe, topology.settings.health_backoff())
            .with_deadline(ctx.deadline);
        let report = release_manager(rt, topology, &verifier).deploy(source)?;

        Ok(vec![OpOutcome {
            operation: "deploy_release".to_string(),
            host: report.host.clone(),
            resource: report.release.id.clone(),
            changed: true,
            dry_run: false,
            detail: Some(match &report.previous {
                Some(previous) => format!("{} (was {})", source.describe(), previous),
                None => source.describe(),
            }),
        }])
    })
    .depends_on(&[PhaseId::AppPrep])
    .with_steps(steps)
}

fn observability<'a>(topology: &'a Topology, rt: &'a Runtime<'a>) -> Phase<'a> {
    let plan = &topology.observability.activate;
    let mut steps = vec![plan.describe()];
    if !plan.files.is_empty() {
        steps.push("restore previous configuration on failure".to_string());
    }

    Phase::new(PhaseId::Observability, "activate the observability stack", move |_| {
        let ctx = op_context(rt, topology, &topology.hosts.observability);
        for file in &plan.files {
            preserve(&ctx, &file.path)?;
        }
        ops::apply_host_plan(&ctx, plan)
    })
    .depends_on(&[PhaseId::ObservabilityPrep])
    .with_steps(steps)
    .with_rollback(move |_| {
        let ctx = op_context(rt, topology, &topology.hosts.observability);
        let mut out = Vec::new();
        for file in &plan.files {
            out.push(restore(&ctx, &file.path)?);
        }
        if out.iter().any(|o| o.changed) {
            for service in &plan.services {
                out.push(ops::reload_service(&ctx, service)?);
            }
        }
        Ok(out)
    })
}

fn verification<'a>(topology: &'a Topology, rt: &'a Runtime<'a>) -> Phase<'a> {
    let checks = topology.verification_checks();
    let steps = checks
        .iter()
        .map(|c| format!("check {} ({})", c.name, c.target))
        .collect();

    Phase::new(PhaseId::Verification, "verify both hosts", move |ctx| {
        let verifier = HealthVerifier::new(rt.probe, topology.settings.health_backoff())
            .with_deadline(ctx.deadline);
        let report = verifier.require(&checks)?;
        Ok(report
            .results
            .iter()
            .zip(&checks)
            .map(|(result, check)| OpOutcome {
                operation: "health_check".to_string(),
                host: check.host_id().to_string(),
                resource: result.name.clone(),
                changed: false,
                dry_run: false,
                detail: Some(format!("passed after {} attempt(s)", result.attempts)),
            })
            .collect())
    })
    .with_steps(steps)
}

// Known-good copies of files a phase may rewrite, kept beside them as `<path>.keel-prev`.

fn preserve(ctx: &OpContext, path: &str) -> Result<()> {
    let p = quote_path(path);
    let prev = quote_path(&format!("{}.keel-prev", path));
    ctx.apply(&format!(
        "if [ -f {p} ] && ! cmp -s {p} {prev}; then cp -p {p} {prev}; fi",
        p = p,
        prev = prev
    ))
}

fn restore(ctx: &OpContext, path: &str) -> Result<OpOutcome> {
    let p = quote_path(path);
    let prev = quote_path(&format!("{}.keel-prev", path));
    let differs = ctx.test(&format!("[ -f {prev} ] && ! cmp -s {prev} {p}", p = p, prev = prev))?;
    if !differs {
        return Ok(ctx.outcome("restore_file", path, false));
    }
    ctx.apply(&format!("cp -p {} {}", prev, p))?;
    Ok(ctx.outcome("restore_file", path, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{PhaseStatus, PipelineStatus, RollbackStatus, RunOptions, SkipSet};
    use crate::ssh::SshExecutor;
    use crate::testing::{FakeExecutor, RecordingNotifier, ScriptedProbe};
    use serde_json::json;
    use std::path::Path;
    use tempfile::{tempdir, TempDir};

    /// Both hosts are this machine; every path lives in a temp directory.
    fn local_topology(dir: &Path, extra: serde_json::Value) -> Topology {
        let src = dir.join("src");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("index.html"), "v1").unwrap();

        let mut doc = json!({
            "name": "test",
            "hosts": {
                "app": {"address": "localhost", "user": "root"},
                "observability": {"address": "localhost", "user": "root"}
            },
            "secrets": [{"name": "DB_PASSWORD", "format": "alphanumeric", "minLength": 32}],
            "app": {
                "release": {"deployPath": dir.join("site").to_string_lossy()},
                "source": {"type": "path", "path": src.to_string_lossy()},
                "envFile": {"path": dir.join("app.env").to_string_lossy(), "keys": {"DB_PASSWORD": "DB_PASSWORD"}}
            },
            "settings": {"transportRetries": 0, "healthBackoffSecs": 0}
        });
        if let (Some(doc), Some(extra)) = (doc.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                doc.insert(k.clone(), v.clone());
            }
        }
        Topology::parse(&doc.to_string(), &dir.join("keel.json")).unwrap()
    }

    fn store(dir: &TempDir) -> SecretsStore {
        SecretsStore::new(dir.path().join("state/secrets.env"), dir.path().join("state/backups"))
    }

    fn skip_accounts() -> SkipSet {
        [PhaseId::UserSetup, PhaseId::Ssh].into_iter().collect()
    }

    fn run_options(skip: SkipSet) -> RunOptions<'static> {
        RunOptions {
            run_id: "test".to_string(),
            skip,
            ..Default::default()
        }
    }

    #[test]
    fn standard_pipeline_declares_every_phase_in_order() {
        let dir = tempdir().unwrap();
        let topology = local_topology(dir.path(), json!({}));
        let exec = FakeExecutor::always_ok();
        let probe = ScriptedProbe::passing();
        let store = store(&dir);
        let rt = Runtime { executor: &exec, probe: &probe, store: &store };

        let pipeline = standard(&topology, &rt).unwrap();
        let ids: Vec<_> = pipeline.phases().iter().map(|p| p.id).collect();
        assert_eq!(ids, PhaseId::ALL.to_vec());
        let with_rollback: Vec<_> = pipeline
            .phases()
            .iter()
            .filter(|p| p.has_rollback())
            .map(|p| p.id)
            .collect();
        assert_eq!(with_rollback, vec![PhaseId::Ssh, PhaseId::Observability]);
    }

    #[test]
    fn dry_run_touches_nothing() {
        let dir = tempdir().unwrap();
        let topology = local_topology(dir.path(), json!({}));
        let exec = FakeExecutor::always_ok();
        let probe = ScriptedProbe::passing();
        let store = store(&dir);
        let rt = Runtime { executor: &exec, probe: &probe, store: &store };
        let mut options = run_options(SkipSet::new());
        options.dry_run = true;

        let report = standard(&topology, &rt)
            .unwrap()
            .run(&options, &RecordingNotifier::default())
            .unwrap();

        assert_eq!(report.exit_code(), 0);
        assert!(exec.calls().is_empty());
        assert!(probe.calls().is_empty());
        assert!(!store.path().exists());
        let deploy = report.phase(PhaseId::Deploy).unwrap();
        assert!(deploy.steps.iter().any(|s| s.starts_with("swap")));
    }

    #[test]
    fn skipped_account_phases_and_repeat_run_reports_no_changes() {
        let dir = tempdir().unwrap();
        let topology = local_topology(dir.path(), json!({}));
        let exec = SshExecutor::new(5);
        let probe = ScriptedProbe::passing();
        let store = store(&dir);
        let rt = Runtime { executor: &exec, probe: &probe, store: &store };
        let pipeline = standard(&topology, &rt).unwrap();
        let notifier = RecordingNotifier::default();

        let first = pipeline.run(&run_options(skip_accounts()), &notifier).unwrap();
        assert_eq!(first.status, PipelineStatus::Succeeded, "{:?}", first.phases);
        assert_eq!(first.phase(PhaseId::UserSetup).unwrap().status, PhaseStatus::Skipped);
        assert_eq!(first.phase(PhaseId::Ssh).unwrap().status, PhaseStatus::Skipped);
        assert!(dir.path().join("site/current").exists());

        let env = std::fs::read_to_string(dir.path().join("app.env")).unwrap();
        let db = store.load().unwrap();
        assert_eq!(env, format!("DB_PASSWORD={}\n", db.get("DB_PASSWORD").unwrap()));

        let second = pipeline.run(&run_options(skip_accounts()), &notifier).unwrap();
        assert_eq!(second.exit_code(), 0);
        for phase in &second.phases {
            if phase.id == PhaseId::Deploy {
                continue;
            }
            assert!(
                phase.changes.iter().all(|c| !c.changed),
                "{} reported changes on the second run",
                phase.id
            );
        }
        assert_eq!(store.load().unwrap(), db);
    }

    #[test]
    fn failed_activation_restores_previous_configuration() {
        let dir = tempdir().unwrap();
        let config = dir.path().join("prometheus.yml");
        std::fs::write(&config, "old\n").unwrap();
        std::fs::write(dir.path().join("prometheus.new.yml"), "new\n").unwrap();
        let topology = local_topology(
            dir.path(),
            json!({
                "observability": {
                    "activate": {
                        "files": [{"source": "prometheus.new.yml", "path": config.to_string_lossy()}],
                        "lines": [{"path": dir.path().join("missing/dir/alerts").to_string_lossy(), "line": "x"}]
                    }
                }
            }),
        );
        let exec = SshExecutor::new(5);
        let probe = ScriptedProbe::passing();
        let store = store(&dir);
        let rt = Runtime { executor: &exec, probe: &probe, store: &store };

        let report = standard(&topology, &rt)
            .unwrap()
            .run(&run_options(skip_accounts()), &RecordingNotifier::default())
            .unwrap();

        assert_eq!(report.status, PipelineStatus::Failed);
        assert_eq!(report.failed_phase, Some(PhaseId::Observability));
        let phase = report.phase(PhaseId::Observability).unwrap();
        assert_eq!(phase.rollback.as_ref().unwrap().status, RollbackStatus::Succeeded);
        assert_eq!(std::fs::read_to_string(&config).unwrap(), "old\n");
        assert_eq!(report.phase(PhaseId::Verification).unwrap().status, PhaseStatus::NotRun);
    }

    #[test]
    fn missing_source_fails_the_deploy_phase() {
        let dir = tempdir().unwrap();
        let mut topology = local_topology(dir.path(), json!({}));
        topology.app.source = None;
        let exec = SshExecutor::new(5);
        let probe = ScriptedProbe::passing();
        let store = store(&dir);
        let rt = Runtime { executor: &exec, probe: &probe, store: &store };

        let report = standard(&topology, &rt)
            .unwrap()
            .run(&run_options(skip_accounts()), &RecordingNotifier::default())
            .unwrap();

        assert_eq!(report.failed_phase, Some(PhaseId::Deploy));
        let error = report.phase(PhaseId::Deploy).unwrap().error.as_ref().unwrap();
        assert_eq!(error.code, "config.missing_key");
    }

    #[test]
    fn verification_runs_the_default_health_check() {
        let dir = tempdir().unwrap();
        let topology = local_topology(dir.path(), json!({}));
        let mut topology = topology;
        topology.app.url = Some("http://127.0.0.1:9".to_string());
        let exec = FakeExecutor::always_ok();
        let probe = ScriptedProbe::with_default(false);
        let store = store(&dir);
        let rt = Runtime { executor: &exec, probe: &probe, store: &store };
        let skip: SkipSet = PhaseId::ALL
            .into_iter()
            .filter(|p| *p != PhaseId::Verification)
            .collect();

        let report = standard(&topology, &rt)
            .unwrap()
            .run(&run_options(skip), &RecordingNotifier::default())
            .unwrap();

        assert_eq!(report.failed_phase, Some(PhaseId::Verification));
        assert!(probe.calls().iter().all(|c| c == "app-health"));
        let error = report.phase(PhaseId::Verification).unwrap().error.as_ref().unwrap();
        assert_eq!(error.code, "health.check_failed");
    }
}
