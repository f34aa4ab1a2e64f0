use std::time::{Duration, Instant};

use chrono::Utc;

use crate::error::{Error, Result};
use crate::health::{HealthReport, HealthVerifier};
use crate::host::Host;
use crate::lock::RemoteLock;
use crate::ops::{self, OpContext};
use crate::ssh::{self, RemoteExecutor};
use crate::utils::shell::{join_remote, quote_path};
use crate::utils::template::{self, TemplateVars};

use super::types::{
    is_release_id, next_release_id, DeployReport, Release, ReleaseLayout, ReleaseSettings,
    ReleaseSource, ReleaseStatus, RollbackReport,
};

const LIST_MARKER: &str = "==> ";

/// Release lifecycle on one host: `pending -> active -> retired`, with the
/// `current` symlink as the only notion of "active".
pub struct ReleaseManager<'a> {
    executor: &'a dyn RemoteExecutor,
    host: &'a Host,
    settings: &'a ReleaseSettings,
    verifier: &'a HealthVerifier<'a>,
    layout: ReleaseLayout,
    retention: usize,
    retries: u32,
    backoff: Duration,
}

impl<'a> ReleaseManager<'a> {
    pub fn new(
        executor: &'a dyn RemoteExecutor,
        host: &'a Host,
        settings: &'a ReleaseSettings,
        verifier: &'a HealthVerifier<'a>,
    ) -> Self {
        Self {
            executor,
            host,
            settings,
            verifier,
            layout: ReleaseLayout::new(&settings.deploy_path),
            retention: crate::defaults::default_retention(),
            retries: 0,
            backoff: Duration::ZERO,
        }
    }

    pub fn with_retention(mut self, retention: usize) -> Self {
        self.retention = retention.max(1);
        self
    }

    pub fn with_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.retries = retries;
        self.backoff = backoff;
        self
    }

    pub fn layout(&self) -> &ReleaseLayout {
        &self.layout
    }

    /// Steps a deploy would take, without touching the host.
    pub fn plan(&self, source: &ReleaseSource) -> Vec<String> {
        let mut steps = vec![
            format!("lock {}", self.layout.marker()),
            format!("fetch {} into {}/<id>", source.describe(), self.layout.releases()),
        ];
        for path in &self.settings.shared_paths {
            steps.push(format!("link shared {}", path));
        }
        for cmd in self.settings.install.iter().chain(&self.settings.migrate) {
            steps.push(format!("run {}", cmd));
        }
        if !self.settings.pre_checks.is_empty() {
            steps.push(format!("{} pre-activation check(s)", self.settings.pre_checks.len()));
        }
        steps.push(format!("swap {} to the new release", self.layout.current()));
        for service in &self.settings.reload_services {
            steps.push(format!("reload {}", service));
        }
        if !self.settings.post_checks.is_empty() {
            steps.push(format!("{} post-activation check(s)", self.settings.post_checks.len()));
        }
        steps.push(format!("keep at most {} release(s)", self.retention));
        steps
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Id the `current` pointer targets, if any.
    pub fn current_id(&self) -> Result<Option<String>> {
        let target = self.read(&format!(
            "readlink {} || true",
            quote_path(&self.layout.current())
        ))?;
        let id = target
            .trim()
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or("")
            .to_string();
        Ok(is_release_id(&id).then_some(id))
    }

    /// Releases on the host, oldest first. Status comes from the pointer:
    /// exactly the release `current` targets is active.
    pub fn list(&self) -> Result<Vec<Release>> {
        let current = self.current_id()?;
        let output = self.read(&format!(
            "cd {} 2>/dev/null || exit 0; for d in */; do id=${{d%/}}; printf '{}%s\\n' \"$id\"; cat \"$id/{}\" 2>/dev/null; echo; done",
            quote_path(&self.layout.releases()),
            LIST_MARKER,
            super::types::METADATA_FILE
        ))?;

        let mut releases: Vec<Release> = parse_listing(&output)
            .into_iter()
            .filter(|(id, _)| is_release_id(id))
            .map(|(id, meta)| {
                serde_json::from_str::<Release>(meta.trim()).unwrap_or_else(|_| Release::unknown(&id))
            })
            .collect();

        for release in &mut releases {
            let is_current = current.as_deref() == Some(release.id.as_str());
            if is_current {
                release.status = ReleaseStatus::Active;
            } else if release.status == ReleaseStatus::Active {
                release.status = ReleaseStatus::Retired;
            }
        }

        releases.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(releases)
    }

    pub fn current(&self) -> Result<Option<Release>> {
        Ok(self
            .list()?
            .into_iter()
            .find(|r| r.status == ReleaseStatus::Active))
    }

    // ------------------------------------------------------------------------
    // Deploy
    // ------------------------------------------------------------------------

    pub fn deploy(&self, source: &ReleaseSource) -> Result<DeployReport> {
        let lock = RemoteLock::acquire(self.executor, self.host, &self.layout.marker())?;
        let result = self.deploy_locked(source);
        self.release_lock(lock);
        result
    }

    fn release_lock(&self, lock: RemoteLock<'_>) {
        if let Err(e) = lock.release() {
            let marker = self.layout.marker();
            tracing::warn!(host = %self.host.id, marker = %marker, error = %e, "could not remove deploy marker");
            log_status!(
                "release",
                "Could not remove {} on {}; the next run will report lock.held until it is removed with: rm -rf {}",
                marker,
                self.host.id,
                quote_path(&marker)
            );
        }
    }

    fn deploy_locked(&self, source: &ReleaseSource) -> Result<DeployReport> {
        let started = Instant::now();
        self.run(&format!(
            "mkdir -p {} {}",
            quote_path(&self.layout.releases()),
            quote_path(&self.layout.shared())
        ))?;

        let existing: Vec<String> = self.list()?.into_iter().map(|r| r.id).collect();
        let previous = self.current_id()?;
        let id = next_release_id(Utc::now(), &existing);
        let mut release = Release::pending(&id, source);

        log_status!("release", "Staging {} on {} from {}", id, self.host.id, source.describe());
        tracing::info!(host = %self.host.id, release = %id, source = %source.describe(), "staging release");

        if let Err(e) = self.stage(&release, source) {
            self.retire_quietly(&mut release, format!("staging failed: {}", e));
            return Err(e.with_detail("release", serde_json::json!(id)));
        }

        if let Err(e) = self.swap_to(&id) {
            self.retire_quietly(&mut release, format!("pointer swap failed: {}", e));
            return Err(e.with_detail("release", serde_json::json!(id)));
        }
        release.activate();
        log_status!("release", "{} is live on {}", id, self.host.id);

        let checks = match self.after_swap() {
            Ok(checks) => checks,
            Err(cause) => return Err(self.undo_activation(&mut release, previous.as_deref(), cause)),
        };

        // The release is live from here on; bookkeeping failures only warn.
        if let Err(e) = self.write_metadata(&release) {
            tracing::warn!(host = %self.host.id, release = %id, error = %e, "could not record activation");
        }
        if let Some(prev) = &previous {
            self.retire_id(prev, &format!("superseded by {}", id));
        }
        let pruned = match self.prune_locked(Some(&id)) {
            Ok(pruned) => pruned,
            Err(e) => {
                tracing::warn!(host = %self.host.id, error = %e, "release pruning failed");
                log_status!("release", "Warning: could not prune old releases on {}: {}", self.host.id, e);
                Vec::new()
            }
        };

        Ok(DeployReport {
            host: self.host.id.clone(),
            release,
            previous,
            pruned,
            checks,
            duration_ms: started.elapsed().as_millis(),
        })
    }

    /// Everything before the pointer swap. Nothing here is visible to traffic.
    fn stage(&self, release: &Release, source: &ReleaseSource) -> Result<()> {
        let dir = self.layout.release(&release.id);
        self.run(&format!("mkdir -p {}", quote_path(&dir)))?;
        self.write_metadata(release)?;
        self.fetch(source, &dir)?;
        self.link_shared(&dir)?;

        let vars = [
            (TemplateVars::RELEASE_PATH, dir.as_str()),
            (TemplateVars::RELEASE_ID, release.id.as_str()),
            (TemplateVars::DEPLOY_PATH, self.layout.root()),
            (TemplateVars::SHARED_PATH, &self.layout.shared()),
        ];
        for cmd in self.settings.install.iter().chain(&self.settings.migrate) {
            let rendered = template::render(cmd, &vars);
            tracing::info!(host = %self.host.id, release = %release.id, command = %rendered, "release command");
            self.run(&format!("cd {} && {}", quote_path(&dir), rendered))?;
        }

        if !self.settings.pre_checks.is_empty() {
            self.verifier.require(&self.settings.pre_checks)?;
        }
        Ok(())
    }

    fn fetch(&self, source: &ReleaseSource, dir: &str) -> Result<()> {
        let d = quote_path(dir);
        match source {
            ReleaseSource::Git {
                repository,
                reference,
            } => self.run(&format!(
                "git -C {d} init -q && git -C {d} remote add origin {repo} && git -C {d} fetch -q --depth 1 origin {r} && git -C {d} checkout -q FETCH_HEAD",
                d = d,
                repo = quote_path(repository),
                r = quote_path(reference)
            )),
            ReleaseSource::Archive { path } => {
                let remote = join_remote(dir, ".keel-artifact.tar.gz");
                let output = self.executor.upload_file(self.host, path, &remote)?;
                ssh::require_success(self.host, &format!("upload {}", remote), output)?;
                self.run(&format!(
                    "tar -xzf {a} -C {d} && rm -f {a}",
                    a = quote_path(&remote),
                    d = d
                ))
            }
            ReleaseSource::Path { path } => self.run(&format!(
                "cp -a {}/. {}/",
                quote_path(path.trim_end_matches('/')),
                d
            )),
        }
    }

    fn link_shared(&self, dir: &str) -> Result<()> {
        for entry in &self.settings.shared_paths {
            let is_dir = entry.ends_with('/');
            let rel = entry.trim_matches('/');
            let shared = join_remote(&self.layout.shared(), rel);
            let inside = join_remote(dir, rel);
            let create = if is_dir {
                format!("mkdir -p {}", quote_path(&shared))
            } else {
                format!(
                    "mkdir -p \"$(dirname {s})\" && touch {s}",
                    s = quote_path(&shared)
                )
            };
            self.run(&format!(
                "{create} && rm -rf {i} && mkdir -p \"$(dirname {i})\" && ln -s {s} {i}",
                create = create,
                i = quote_path(&inside),
                s = quote_path(&shared)
            ))?;
        }
        Ok(())
    }

    /// Point `current` at the release through a rename; readers see either
    /// the old or the new target, never a missing link.
    fn swap_to(&self, id: &str) -> Result<()> {
        let current = self.layout.current();
        let tmp = format!("{}.{}.tmp", current, id);
        self.run(&format!(
            "ln -sfn {} {} && mv -Tf {} {}",
            quote_path(&self.layout.release(id)),
            quote_path(&tmp),
            quote_path(&tmp),
            quote_path(&current)
        ))
    }

    fn clear_pointer(&self) -> Result<()> {
        self.run(&format!("rm -f {}", quote_path(&self.layout.current())))
    }

    fn reload_services(&self) -> Result<()> {
        let ctx = OpContext::new(self.executor, self.host).with_retries(self.retries, self.backoff);
        for service in &self.settings.reload_services {
            ops::reload_service(&ctx, service)?;
        }
        Ok(())
    }

    fn after_swap(&self) -> Result<Option<HealthReport>> {
        self.reload_services()?;
        if self.settings.post_checks.is_empty() {
            return Ok(None);
        }
        self.verifier.require(&self.settings.post_checks).map(Some)
    }

    /// Post-activation failure: put the previous pointer back (or remove it),
    /// reload, retire the new release. Returns the error to surface.
    fn undo_activation(&self, release: &mut Release, previous: Option<&str>, cause: Error) -> Error {
        tracing::warn!(host = %self.host.id, release = %release.id, error = %cause, "post-activation failure, rolling back");
        log_status!("release", "{} failed verification on {}, rolling back", release.id, self.host.id);

        let mut failures = Vec::new();
        let restore = match previous {
            Some(prev) => self.swap_to(prev),
            None => self.clear_pointer(),
        };
        if let Err(e) = restore {
            failures.push(format!("restore pointer: {}", e));
        } else if let Err(e) = self.reload_services() {
            failures.push(format!("reload: {}", e));
        }

        release.retire(format!("post-activation verification failed: {}", cause));
        if let Err(e) = self.write_metadata(release) {
            tracing::warn!(release = %release.id, error = %e, "could not record retirement");
        }

        if !failures.is_empty() {
            return Error::rollback_failed(format!("deploy of {}", release.id), &cause, failures)
                .with_detail("host", serde_json::json!(self.host.id));
        }

        cause.with_detail(
            "rollback",
            serde_json::json!({
                "status": "succeeded",
                "release": release.id,
                "restored": previous,
            }),
        )
    }

    // ------------------------------------------------------------------------
    // Rollback & retention
    // ------------------------------------------------------------------------

    /// Re-point `current` at `to`, or at the newest earlier release that was
    /// once active. Post-checks run; on failure the pointer goes back.
    pub fn rollback(&self, to: Option<&str>) -> Result<RollbackReport> {
        let lock = RemoteLock::acquire(self.executor, self.host, &self.layout.marker())?;
        let result = self.rollback_locked(to);
        self.release_lock(lock);
        result
    }

    fn rollback_locked(&self, to: Option<&str>) -> Result<RollbackReport> {
        let releases = self.list()?;
        let current = releases
            .iter()
            .find(|r| r.status == ReleaseStatus::Active)
            .cloned()
            .ok_or_else(|| Error::precondition_failed("release", "no active release to roll back from"))?;

        let target = match to {
            Some(id) => {
                let target = releases
                    .iter()
                    .find(|r| r.id == id)
                    .ok_or_else(|| Error::release_not_found(self.host.id.clone(), id))?;
                if target.id == current.id {
                    return Err(Error::precondition_failed(
                        format!("release {}", id),
                        "release is already active",
                    ));
                }
                if !target.was_activated() {
                    return Err(Error::precondition_failed(
                        format!("release {}", id),
                        "release was never activated",
                    ));
                }
                target.clone()
            }
            None => releases
                .iter()
                .rev()
                .find(|r| r.id < current.id && r.was_activated())
                .cloned()
                .ok_or_else(|| {
                    Error::precondition_failed("release", "no earlier release to roll back to")
                })?,
        };

        log_status!("release", "Rolling back {} -> {} on {}", current.id, target.id, self.host.id);
        self.swap_to(&target.id)?;

        let checks = match self.after_swap() {
            Ok(checks) => checks,
            Err(cause) => {
                let restore = self.swap_to(&current.id).and_then(|_| self.reload_services());
                return Err(match restore {
                    Ok(()) => cause.with_detail(
                        "rollback",
                        serde_json::json!({ "status": "succeeded", "restored": current.id }),
                    ),
                    Err(e) => Error::rollback_failed(
                        format!("rollback to {}", target.id),
                        &cause,
                        vec![format!("restore pointer: {}", e)],
                    ),
                });
            }
        };

        let mut activated = target.clone();
        activated.activate();
        if let Err(e) = self.write_metadata(&activated) {
            tracing::warn!(host = %self.host.id, release = %activated.id, error = %e, "could not record activation");
        }
        self.retire_id(&current.id, &format!("rolled back to {}", target.id));

        Ok(RollbackReport {
            host: self.host.id.clone(),
            from: current.id,
            to: target.id,
            checks,
        })
    }

    pub fn prune(&self) -> Result<Vec<String>> {
        let lock = RemoteLock::acquire(self.executor, self.host, &self.layout.marker())?;
        let current = self.current_id();
        let result = current.and_then(|c| self.prune_locked(c.as_deref()));
        self.release_lock(lock);
        result
    }

    /// Remove the oldest releases until at most `retention` remain. The
    /// active release is never removed.
    fn prune_locked(&self, active: Option<&str>) -> Result<Vec<String>> {
        let ids: Vec<String> = self.list()?.into_iter().map(|r| r.id).collect();
        let excess = ids.len().saturating_sub(self.retention);
        let doomed: Vec<String> = ids
            .into_iter()
            .filter(|id| Some(id.as_str()) != active)
            .take(excess)
            .collect();

        for id in &doomed {
            self.run(&format!("rm -rf {}", quote_path(&self.layout.release(id))))?;
            tracing::info!(host = %self.host.id, release = %id, "pruned release");
        }
        Ok(doomed)
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn run(&self, command: &str) -> Result<()> {
        ssh::retry_transport(&self.host.id, self.retries, self.backoff, || {
            ssh::run(self.executor, self.host, command).map(|_| ())
        })
    }

    fn read(&self, command: &str) -> Result<String> {
        ssh::retry_transport(&self.host.id, self.retries, self.backoff, || {
            ssh::run(self.executor, self.host, command).map(|out| out.stdout)
        })
    }

    fn write_metadata(&self, release: &Release) -> Result<()> {
        let json = serde_json::to_string_pretty(release)
            .map_err(|e| Error::internal_json(e.to_string(), Some("serialize release".to_string())))?;
        let path = self.layout.metadata(&release.id);
        let output = self.executor.upload(self.host, json.as_bytes(), &path)?;
        ssh::require_success(self.host, &format!("upload {}", path), output).map(|_| ())
    }

    fn retire_quietly(&self, release: &mut Release, reason: String) {
        tracing::warn!(host = %self.host.id, release = %release.id, reason = %reason, "release retired before activation");
        release.retire(reason);
        if let Err(e) = self.write_metadata(release) {
            tracing::warn!(release = %release.id, error = %e, "could not record retirement");
        }
    }

    fn retire_id(&self, id: &str, reason: &str) {
        let listing = self.read(&format!(
            "cat {} 2>/dev/null || true",
            quote_path(&self.layout.metadata(id))
        ));
        let mut release = listing
            .ok()
            .and_then(|json| serde_json::from_str::<Release>(json.trim()).ok())
            .unwrap_or_else(|| Release::unknown(id));
        release.retire(reason);
        if let Err(e) = self.write_metadata(&release) {
            tracing::warn!(release = %id, error = %e, "could not record retirement");
        }
    }
}

fn parse_listing(output: &str) -> Vec<(String, String)> {
    let mut entries: Vec<(String, String)> = Vec::new();
    for line in output.lines() {
        if let Some(id) = line.strip_prefix(LIST_MARKER) {
            entries.push((id.trim().to_string(), String::new()));
        } else if let Some((_, meta)) = entries.last_mut() {
            meta.push_str(line);
            meta.push('\n');
        }
    }
    entries
}
