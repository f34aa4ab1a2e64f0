use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::health::HealthVerifier;
use crate::host::Hosts;
use crate::notify::{Event, Notification, Notifier};
use crate::ops::{self, OpContext, OpOutcome};
use crate::secrets::{self, SecretSpec, SecretsRecord, SecretsStore};
use crate::utils::shell::quote_path;
use crate::utils::template;

use super::plan::{CredentialAction, RotationPlan, ServiceTarget, ServiceTier};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceUpdate {
    pub service: String,
    pub host: String,
    pub tier: ServiceTier,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub planned: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<OpOutcome>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub restarted: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationReport {
    pub run_id: String,
    pub dry_run: bool,
    pub secrets: Vec<String>,
    pub services: Vec<ServiceUpdate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<PathBuf>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub pruned_backups: Vec<PathBuf>,
}

/// Rotates selected secrets across their consumers, all or nothing.
pub struct Coordinator<'a> {
    pub executor: &'a dyn crate::ssh::RemoteExecutor,
    pub hosts: &'a Hosts,
    pub store: &'a SecretsStore,
    pub catalog: &'a [SecretSpec],
    pub services: &'a [ServiceTarget],
    pub verifier: &'a HealthVerifier<'a>,
    pub notifier: &'a dyn Notifier,
    pub run_id: String,
    pub backup_retention: usize,
    pub retries: u32,
    pub backoff: Duration,
}

/// Values going live, and the values the service currently holds.
struct Credentials<'v> {
    target: &'v BTreeMap<String, String>,
    live: &'v BTreeMap<String, String>,
}

impl<'a> Coordinator<'a> {
    pub fn rotate(&self, plan: &RotationPlan) -> Result<RotationReport> {
        plan.validate()?;
        for name in &plan.selected {
            if !self.catalog.iter().any(|s| &s.name == name) {
                return Err(Error::secret_not_found(name.clone()));
            }
        }
        let affected = plan.affected(self.services)?;
        let secrets: Vec<String> = plan.selected.iter().cloned().collect();

        if plan.dry_run {
            return Ok(RotationReport {
                run_id: self.run_id.clone(),
                dry_run: true,
                secrets,
                services: affected.iter().map(|s| self.planned(s, plan)).collect(),
                version: None,
                backup: None,
                pruned_backups: Vec::new(),
            });
        }

        let lock = self.store.lock()?;
        let snapshot = self.store.load()?;
        for name in &plan.selected {
            if snapshot.get(name).is_none() {
                return Err(Error::precondition_failed(
                    format!("secret {}", name),
                    "secret has no current value; run 'keel secrets generate' first",
                ));
            }
        }
        let backup = self.store.snapshot(&lock, &snapshot)?;
        log_status!("rotate", "Snapshot saved to {}", backup.display());

        let mut next = snapshot.values().clone();
        for spec in self.catalog.iter().filter(|s| plan.selected.contains(&s.name)) {
            next.insert(spec.name.clone(), secrets::generate(spec));
        }

        let mut touched: Vec<&ServiceTarget> = Vec::new();
        let mut updates = Vec::new();
        let forward = Credentials {
            target: &next,
            live: snapshot.values(),
        };

        let outcome: Result<SecretsRecord> = (|| {
            for service in &affected {
                touched.push(service);
                log_status!("rotate", "Updating {} ({})", service.name, service.tier.as_str());
                let update = self.apply(service, plan, &forward)?;
                self.verify(service)?;
                updates.push(update);
            }
            self.store.commit(&lock, snapshot.version, next.clone())
        })();

        match outcome {
            Ok(record) => {
                // New values are live; a pruning failure must not report the rotation as failed.
                let pruned_backups = match self.store.prune_backups(self.backup_retention) {
                    Ok(pruned) => pruned,
                    Err(e) => {
                        tracing::warn!(run_id = %self.run_id, error = %e, "backup pruning failed");
                        log_status!("rotate", "Warning: could not prune old backups: {}", e);
                        Vec::new()
                    }
                };
                self.notifier.notify(&Notification::new(
                    Event::RotationCompleted,
                    &self.run_id,
                    "succeeded",
                    format!("rotated {} across {} service(s)", secrets.join(", "), updates.len()),
                ));
                Ok(RotationReport {
                    run_id: self.run_id.clone(),
                    dry_run: false,
                    secrets,
                    services: updates,
                    version: Some(record.version),
                    backup: Some(backup),
                    pruned_backups,
                })
            }
            Err(cause) => {
                let err = self.roll_back(plan, &lock, &snapshot, &next, &touched, cause, &backup);
                self.notifier.notify(&Notification::new(
                    Event::RotationFailed,
                    &self.run_id,
                    err.code.as_str(),
                    err.message.clone(),
                ));
                Err(err)
            }
        }
    }

    /// Put the snapshot back in the store and re-apply the old values to every
    /// touched service, newest first, re-verifying each.
    #[allow(clippy::too_many_arguments)]
    fn roll_back(
        &self,
        plan: &RotationPlan,
        lock: &crate::lock::LocalLock,
        snapshot: &SecretsRecord,
        next: &BTreeMap<String, String>,
        touched: &[&ServiceTarget],
        cause: Error,
        backup: &std::path::Path,
    ) -> Error {
        tracing::error!(run_id = %self.run_id, error = %cause, touched = touched.len(), "rotation failed, rolling back");
        log_status!("rotate", "Rotation failed: {}. Restoring previous credentials", cause);

        let mut failures = Vec::new();
        if let Err(e) = self.store.restore(lock, snapshot) {
            failures.push(format!("secrets store: {}", e));
        }

        let backward = Credentials {
            target: snapshot.values(),
            live: next,
        };
        for service in touched.iter().rev() {
            if let Err(e) = self.apply(service, plan, &backward) {
                failures.push(format!("{}: {}", service.name, e));
                continue;
            }
            if let Err(e) = self.verify(service) {
                failures.push(format!("{}: {}", service.name, e));
            }
        }

        if !failures.is_empty() {
            return Error::rollback_failed("secret rotation", &cause, failures)
                .with_detail("backup", serde_json::json!(backup.display().to_string()))
                .with_hint(format!(
                    "Previous values are in {}; restore the failed services by hand",
                    backup.display()
                ));
        }

        let restored: Vec<&str> = touched.iter().map(|s| s.name.as_str()).collect();
        cause
            .with_detail(
                "rollback",
                serde_json::json!({ "status": "succeeded", "services": restored }),
            )
            .with_hint("Previous credentials were restored and verified; nothing was rotated")
    }

    fn planned(&self, service: &ServiceTarget, plan: &RotationPlan) -> ServiceUpdate {
        let mut planned: Vec<String> = service
            .actions
            .iter()
            .filter(|a| a.secrets().iter().any(|s| plan.selected.contains(s)))
            .map(|a| a.describe())
            .collect();
        if let Some(unit) = &service.unit {
            planned.push(if service.restart {
                format!("restart {} (brief unavailability accepted)", unit)
            } else {
                format!("reload {}", unit)
            });
        }
        if let Some(check) = &service.check {
            planned.push(format!("check {}", check.name));
        }
        ServiceUpdate {
            service: service.name.clone(),
            host: service.host.clone(),
            tier: service.tier,
            planned,
            changes: Vec::new(),
            restarted: false,
        }
    }

    fn apply(
        &self,
        service: &ServiceTarget,
        plan: &RotationPlan,
        creds: &Credentials<'_>,
    ) -> Result<ServiceUpdate> {
        let host = self.hosts.get(&service.host)?;
        let ctx = OpContext::new(self.executor, host).with_retries(self.retries, self.backoff);
        let value = |name: &str| -> Result<&str> {
            creds
                .target
                .get(name)
                .map(String::as_str)
                .ok_or_else(|| Error::secret_not_found(name))
        };

        let mut changes = Vec::new();
        for action in &service.actions {
            if !action.secrets().iter().any(|s| plan.selected.contains(s)) {
                continue;
            }
            match action {
                CredentialAction::EnvFile { path, keys } => {
                    for (key, secret) in keys {
                        if plan.selected.contains(secret) {
                            changes.push(ops::ensure_key_value(&ctx, path, key, value(secret)?)?);
                        }
                    }
                }
                CredentialAction::PostgresPassword { role, secret } => {
                    changes.push(ops::ensure_db_role_password(&ctx, role, value(secret)?)?);
                }
                CredentialAction::RedisPassword { secret, config } => {
                    let live = creds.live.get(secret).map(String::as_str).unwrap_or("");
                    changes.push(self.set_redis_password(&ctx, value(secret)?, live)?);
                    changes.push(ops::ensure_setting(&ctx, config, "requirepass", " ", value(secret)?)?);
                }
                CredentialAction::Command { command } => {
                    let rendered = template::render_map_with(command, creds.target, quote_path);
                    ctx.apply_redacted(&rendered, &format!("{} credential command", service.name))?;
                    changes.push(ctx.outcome("credential_command", &service.name, true));
                }
            }
        }

        let mut restarted = false;
        if let Some(unit) = &service.unit {
            if service.restart {
                tracing::warn!(
                    service = %service.name,
                    unit = %unit,
                    "restarting a unit without reload support; brief unavailability accepted"
                );
                log_status!("rotate", "Restarting {} (brief unavailability)", unit);
                changes.push(ops::restart_service(&ctx, unit)?);
                restarted = true;
            } else {
                changes.push(ops::reload_service(&ctx, unit)?);
            }
        }

        Ok(ServiceUpdate {
            service: service.name.clone(),
            host: service.host.clone(),
            tier: service.tier,
            planned: Vec::new(),
            changes,
            restarted,
        })
    }

    /// Live password change. The new password is tried first so a repeated
    /// apply is a no-op.
    fn set_redis_password(&self, ctx: &OpContext, target: &str, live: &str) -> Result<OpOutcome> {
        let probe = format!(
            "REDISCLI_AUTH={} redis-cli --no-auth-warning PING 2>/dev/null | grep -q PONG",
            quote_path(target)
        );
        if ctx.test_redacted(&probe, "redis-cli PING")? {
            return Ok(ctx.outcome("redis_password", "requirepass", false));
        }

        let set = format!(
            "{{ REDISCLI_AUTH={live} redis-cli --no-auth-warning CONFIG SET requirepass {new} || redis-cli CONFIG SET requirepass {new}; }} | grep -q OK",
            live = quote_path(live),
            new = quote_path(target)
        );
        ctx.apply_redacted(&set, "redis-cli CONFIG SET requirepass")?;
        Ok(ctx.outcome("redis_password", "requirepass", true))
    }

    fn verify(&self, service: &ServiceTarget) -> Result<()> {
        match &service.check {
            Some(check) => self.verifier.require(std::slice::from_ref(check)).map(|_| ()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{CheckKind, HealthCheck, Probe};
    use crate::secrets::SecretFormat;
    use crate::ssh::SshExecutor;
    use crate::testing::{local_host, RecordingNotifier, ScriptedProbe};
    use std::path::Path;
    use tempfile::{tempdir, TempDir};

    struct Env {
        dir: TempDir,
        hosts: Hosts,
        store: SecretsStore,
        catalog: Vec<SecretSpec>,
        services: Vec<ServiceTarget>,
    }

    impl Env {
        fn read(&self, name: &str) -> String {
            std::fs::read_to_string(self.dir.path().join(name)).unwrap()
        }
    }

    fn env_service(dir: &Path, name: &str, tier: ServiceTier, file: &str, secret: &str) -> ServiceTarget {
        ServiceTarget {
            name: name.to_string(),
            host: "app".to_string(),
            tier,
            actions: vec![CredentialAction::EnvFile {
                path: dir.join(file).to_string_lossy().to_string(),
                keys: BTreeMap::from([("PASSWORD".to_string(), secret.to_string())]),
            }],
            unit: None,
            restart: false,
            check: Some(HealthCheck::new(name, CheckKind::Process, name).with_budget(1, 1)),
        }
    }

    /// Cache declared before the database to prove tier ordering.
    fn setup() -> Env {
        let dir = tempdir().unwrap();
        let store = SecretsStore::new(dir.path().join("secrets.env"), dir.path().join("backups"));
        let catalog = vec![
            SecretSpec::new("DB_PASSWORD", SecretFormat::Alphanumeric, 32),
            SecretSpec::new("REDIS_PASSWORD", SecretFormat::Hex, 40),
            SecretSpec::new("APP_KEY", SecretFormat::AppKey, 32),
        ];
        store.ensure_generated(&catalog, false, false).unwrap();
        let record = store.load().unwrap();
        for (file, secret) in [("db.env", "DB_PASSWORD"), ("cache.env", "REDIS_PASSWORD")] {
            std::fs::write(
                dir.path().join(file),
                format!("PASSWORD={}\n", record.get(secret).unwrap()),
            )
            .unwrap();
        }
        let services = vec![
            env_service(dir.path(), "cache", ServiceTier::Cache, "cache.env", "REDIS_PASSWORD"),
            env_service(dir.path(), "db", ServiceTier::Data, "db.env", "DB_PASSWORD"),
        ];
        Env {
            hosts: Hosts {
                app: local_host("app"),
                observability: local_host("observability"),
            },
            dir,
            store,
            catalog,
            services,
        }
    }

    fn coordinator<'a>(
        env: &'a Env,
        exec: &'a SshExecutor,
        verifier: &'a HealthVerifier<'a>,
        notifier: &'a RecordingNotifier,
    ) -> Coordinator<'a> {
        Coordinator {
            executor: exec,
            hosts: &env.hosts,
            store: &env.store,
            catalog: &env.catalog,
            services: &env.services,
            verifier,
            notifier,
            run_id: "test".to_string(),
            backup_retention: 10,
            retries: 0,
            backoff: Duration::ZERO,
        }
    }

    #[test]
    fn successful_rotation_commits_and_updates_consumers() {
        let env = setup();
        let before = env.store.load().unwrap();
        let exec = SshExecutor::new(5);
        let probe = ScriptedProbe::passing();
        let verifier = HealthVerifier::new(&probe, Duration::ZERO);
        let notifier = RecordingNotifier::default();

        let report = coordinator(&env, &exec, &verifier, &notifier)
            .rotate(&RotationPlan::new(["DB_PASSWORD", "REDIS_PASSWORD"]))
            .unwrap();

        let after = env.store.load().unwrap();
        assert_eq!(report.version, Some(before.version + 1));
        assert_ne!(after.get("DB_PASSWORD"), before.get("DB_PASSWORD"));
        assert_eq!(after.get("APP_KEY"), before.get("APP_KEY"));
        assert_eq!(env.read("db.env"), format!("PASSWORD={}\n", after.get("DB_PASSWORD").unwrap()));
        assert_eq!(probe.calls(), vec!["db", "cache"]);
        assert_eq!(notifier.events(), vec!["rotation_completed"]);
        assert!(report.backup.unwrap().exists());
    }

    #[test]
    fn cache_failure_reverts_database_and_keeps_store() {
        let env = setup();
        let before = env.store.load().unwrap();
        let db_before = env.read("db.env");
        let cache_before = env.read("cache.env");
        let exec = SshExecutor::new(5);
        let probe = ScriptedProbe::passing().script("cache", &[false]);
        let verifier = HealthVerifier::new(&probe, Duration::ZERO);
        let notifier = RecordingNotifier::default();

        let err = coordinator(&env, &exec, &verifier, &notifier)
            .rotate(&RotationPlan::new(["DB_PASSWORD", "REDIS_PASSWORD"]))
            .unwrap_err();

        assert_eq!(err.code.as_str(), "health.check_failed");
        assert_eq!(err.details["rollback"]["status"], "succeeded");
        assert_eq!(env.read("db.env"), db_before);
        assert_eq!(env.read("cache.env"), cache_before);
        assert_eq!(env.store.load().unwrap(), before);
        // forward db, cache; rollback cache, db
        assert_eq!(probe.calls(), vec!["db", "cache", "cache", "db"]);
        assert_eq!(notifier.events(), vec!["rotation_failed"]);
    }

    #[test]
    fn failed_re_verification_is_a_rollback_failure() {
        let env = setup();
        let exec = SshExecutor::new(5);
        let probe = ScriptedProbe::passing().script("cache", &[false, false]);
        let verifier = HealthVerifier::new(&probe, Duration::ZERO);
        let notifier = RecordingNotifier::default();

        let err = coordinator(&env, &exec, &verifier, &notifier)
            .rotate(&RotationPlan::new(["REDIS_PASSWORD"]))
            .unwrap_err();

        assert_eq!(err.code.as_str(), "rollback.failed");
        assert_eq!(err.details["cause"]["code"], "health.check_failed");
        assert!(err.details["failures"][0].as_str().unwrap().starts_with("cache"));
    }

    #[test]
    fn dry_run_plans_in_tier_order_without_changes() {
        let env = setup();
        let before = env.store.load().unwrap();
        let db_before = env.read("db.env");
        let exec = SshExecutor::new(5);
        let probe = ScriptedProbe::passing();
        let verifier = HealthVerifier::new(&probe, Duration::ZERO);
        let notifier = RecordingNotifier::default();

        let report = coordinator(&env, &exec, &verifier, &notifier)
            .rotate(&RotationPlan::new(["DB_PASSWORD", "REDIS_PASSWORD"]).dry_run(true))
            .unwrap();

        let order: Vec<_> = report.services.iter().map(|s| s.service.as_str()).collect();
        assert_eq!(order, vec!["db", "cache"]);
        assert!(report.services[0].planned[0].starts_with("set PASSWORD in"));
        assert_eq!(env.store.load().unwrap(), before);
        assert_eq!(env.read("db.env"), db_before);
        assert!(probe.calls().is_empty());
        assert!(env.store.list_backups().unwrap().is_empty());
    }

    #[test]
    fn unknown_secret_is_rejected_before_any_change() {
        let env = setup();
        let exec = SshExecutor::new(5);
        let probe = ScriptedProbe::passing();
        let verifier = HealthVerifier::new(&probe, Duration::ZERO);
        let notifier = RecordingNotifier::default();

        let err = coordinator(&env, &exec, &verifier, &notifier)
            .rotate(&RotationPlan::new(["NOPE"]))
            .unwrap_err();

        assert_eq!(err.code.as_str(), "secrets.unknown");
        assert!(env.store.list_backups().unwrap().is_empty());
    }

    #[test]
    fn rejected_credential_reverts_earlier_services() {
        let mut env = setup();
        let before = env.store.load().unwrap();
        let db_before = env.read("db.env");
        // The cache only accepts its current password.
        let current = before.get("REDIS_PASSWORD").unwrap().to_string();
        env.services[0].actions = vec![CredentialAction::Command {
            command: format!("test {{{{REDIS_PASSWORD}}}} = {}", current),
        }];
        let exec = SshExecutor::new(5);
        let probe = ScriptedProbe::passing();
        let verifier = HealthVerifier::new(&probe, Duration::ZERO);
        let notifier = RecordingNotifier::default();

        let err = coordinator(&env, &exec, &verifier, &notifier)
            .rotate(&RotationPlan::new(["DB_PASSWORD", "REDIS_PASSWORD"]))
            .unwrap_err();

        assert_eq!(err.details["rollback"]["status"], "succeeded");
        assert_eq!(env.read("db.env"), db_before);
        assert_eq!(env.store.load().unwrap(), before);
        // forward db; rollback cache, db
        assert_eq!(probe.calls(), vec!["db", "cache", "db"]);
        assert_eq!(notifier.events(), vec!["rotation_failed"]);
    }

    /// Bumps the secrets file version the first time the cache is checked.
    struct ConcurrentWriter<'a> {
        path: &'a Path,
        inner: ScriptedProbe,
    }

    impl Probe for ConcurrentWriter<'_> {
        fn probe(&self, check: &HealthCheck) -> Result<bool> {
            if check.name == "cache" {
                let content = std::fs::read_to_string(self.path).unwrap();
                std::fs::write(self.path, content.replacen("version=1 ", "version=7 ", 1)).unwrap();
            }
            self.inner.probe(check)
        }
    }

    #[test]
    fn version_conflict_at_commit_reverts_services() {
        let env = setup();
        let before = env.store.load().unwrap();
        assert_eq!(before.version, 1);
        let db_before = env.read("db.env");
        let cache_before = env.read("cache.env");
        let exec = SshExecutor::new(5);
        let probe = ConcurrentWriter {
            path: env.store.path(),
            inner: ScriptedProbe::passing(),
        };
        let verifier = HealthVerifier::new(&probe, Duration::ZERO);
        let notifier = RecordingNotifier::default();

        let err = coordinator(&env, &exec, &verifier, &notifier)
            .rotate(&RotationPlan::new(["DB_PASSWORD", "REDIS_PASSWORD"]))
            .unwrap_err();

        assert_eq!(err.code.as_str(), "secrets.version_conflict");
        assert_eq!(err.details["rollback"]["status"], "succeeded");
        assert_eq!(env.read("db.env"), db_before);
        assert_eq!(env.read("cache.env"), cache_before);
        let after = env.store.load().unwrap();
        assert_eq!(after.values(), before.values());
        assert_eq!(after.version, 7);
        assert_eq!(notifier.events(), vec!["rotation_failed"]);
    }

    #[cfg(unix)]
    #[test]
    fn pruning_failure_does_not_fail_a_committed_rotation() {
        let env = setup();
        let before = env.store.load().unwrap();
        std::fs::create_dir_all(env.dir.path().join("backups")).unwrap();
        // Sorts oldest; deleting a dangling link fails.
        std::os::unix::fs::symlink(
            env.dir.path().join("gone"),
            env.dir.path().join("backups").join("secrets-00.env"),
        )
        .unwrap();
        let exec = SshExecutor::new(5);
        let probe = ScriptedProbe::passing();
        let verifier = HealthVerifier::new(&probe, Duration::ZERO);
        let notifier = RecordingNotifier::default();

        let mut rotation = coordinator(&env, &exec, &verifier, &notifier);
        rotation.backup_retention = 1;
        let report = rotation
            .rotate(&RotationPlan::new(["DB_PASSWORD"]))
            .unwrap();

        assert_eq!(report.version, Some(before.version + 1));
        assert!(report.pruned_backups.is_empty());
        assert_eq!(env.store.load().unwrap().version, before.version + 1);
        assert_eq!(notifier.events(), vec!["rotation_completed"]);
    }
}
