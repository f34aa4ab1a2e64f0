//! Idempotent "ensure" operations built on the remote executor.
//!
//! Every operation reads the current state first and mutates only when the
//! resource differs from the desired state. Already-satisfied resources are a
//! no-op (`changed: false`), never an error. In dry-run mode only the read
//! half runs and the outcome reports what would change.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::host::Host;
use crate::ssh::{self, RemoteExecutor};
use crate::utils::shell::{self, quote_arg, quote_path};

pub struct OpContext<'a> {
    pub executor: &'a dyn RemoteExecutor,
    pub host: &'a Host,
    pub dry_run: bool,
    pub retries: u32,
    pub backoff: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OpOutcome {
    pub operation: String,
    pub host: String,
    pub resource: String,
    pub changed: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub dry_run: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl OpOutcome {
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl<'a> OpContext<'a> {
    pub fn new(executor: &'a dyn RemoteExecutor, host: &'a Host) -> Self {
        Self {
            executor,
            host,
            dry_run: false,
            retries: 0,
            backoff: Duration::ZERO,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.retries = retries;
        self.backoff = backoff;
        self
    }

    /// State query: exit status as a boolean.
    pub fn test(&self, command: &str) -> Result<bool> {
        ssh::retry_transport(&self.host.id, self.retries, self.backoff, || {
            ssh::test(self.executor, self.host, command)
        })
    }

    /// State query: captured stdout (command must succeed).
    pub fn read(&self, command: &str) -> Result<String> {
        ssh::retry_transport(&self.host.id, self.retries, self.backoff, || {
            ssh::run(self.executor, self.host, command).map(|out| out.stdout)
        })
    }

    /// Mutation; skipped in dry-run.
    pub fn apply(&self, command: &str) -> Result<()> {
        self.apply_as(command, command)
    }

    /// Mutation whose command line carries a credential; logs and errors show `shown` instead.
    pub fn apply_redacted(&self, command: &str, shown: &str) -> Result<()> {
        self.apply_as(command, shown).map_err(|e| redact(e, shown))
    }

    fn apply_as(&self, command: &str, shown: &str) -> Result<()> {
        if self.dry_run {
            tracing::debug!(host = %self.host.id, command = %shown, "dry-run, skipped");
            return Ok(());
        }
        tracing::debug!(host = %self.host.id, command = %shown, "apply");
        ssh::retry_transport(&self.host.id, self.retries, self.backoff, || {
            ssh::run(self.executor, self.host, command).map(|_| ())
        })
    }

    pub fn test_redacted(&self, command: &str, shown: &str) -> Result<bool> {
        self.test(command).map_err(|e| redact(e, shown))
    }

    pub fn upload(&self, content: &[u8], remote_path: &str) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }
        ssh::retry_transport(&self.host.id, self.retries, self.backoff, || {
            let output = self.executor.upload(self.host, content, remote_path)?;
            ssh::require_success(self.host, &format!("upload {}", remote_path), output).map(|_| ())
        })
    }

    pub fn outcome(&self, operation: &str, resource: &str, changed: bool) -> OpOutcome {
        OpOutcome {
            operation: operation.to_string(),
            host: self.host.id.clone(),
            resource: resource.to_string(),
            changed,
            dry_run: self.dry_run,
            detail: None,
        }
    }
}

fn redact(err: Error, shown: &str) -> Error {
    if err.details.get("command").is_some() {
        err.with_detail("command", serde_json::Value::String(shown.to_string()))
    } else {
        err
    }
}

// ============================================================================
// Accounts
// ============================================================================

pub fn ensure_user(
    ctx: &OpContext,
    name: &str,
    groups: &[String],
    login_shell: Option<&str>,
) -> Result<OpOutcome> {
    let user = quote_arg(name);
    let exists = ctx.test(&format!("id -u {} >/dev/null 2>&1", user))?;

    if !exists {
        let mut cmd = format!(
            "useradd --create-home --shell {}",
            quote_arg(login_shell.unwrap_or("/bin/bash"))
        );
        if !groups.is_empty() {
            cmd.push_str(&format!(" --groups {}", quote_arg(&groups.join(","))));
        }
        cmd.push(' ');
        cmd.push_str(&user);
        ctx.apply(&cmd)?;
        return Ok(ctx.outcome("ensure_user", name, true).with_detail("created"));
    }

    let current = ctx.read(&format!("id -nG {}", user))?;
    let have: HashSet<&str> = current.split_whitespace().collect();
    let missing: Vec<String> = groups
        .iter()
        .filter(|g| !have.contains(g.as_str()))
        .cloned()
        .collect();

    if missing.is_empty() {
        return Ok(ctx.outcome("ensure_user", name, false));
    }

    ctx.apply(&format!(
        "usermod --append --groups {} {}",
        quote_arg(&missing.join(",")),
        user
    ))?;
    Ok(ctx
        .outcome("ensure_user", name, true)
        .with_detail(format!("added to {}", missing.join(", "))))
}

pub fn ensure_authorized_key(ctx: &OpContext, user: &str, public_key: &str) -> Result<OpOutcome> {
    let home = ctx.read(&format!(
        "getent passwd {} | cut -d: -f6",
        quote_arg(user)
    ))?;
    let home = home.trim();
    let resource = format!("{}:authorized_keys", user);

    if home.is_empty() {
        if ctx.dry_run {
            return Ok(ctx
                .outcome("ensure_authorized_key", &resource, true)
                .with_detail("user not created yet"));
        }
        return Err(Error::precondition_failed(
            resource,
            format!("user '{}' does not exist on {}", user, ctx.host.id),
        ));
    }

    let ssh_dir = shell::join_remote(home, ".ssh");
    let keys_file = shell::join_remote(&ssh_dir, "authorized_keys");
    let dir = ensure_directory(ctx, &ssh_dir, Some(user), Some("700"))?;
    let line = ensure_line_in_file(ctx, &keys_file, public_key.trim())?;

    if line.changed {
        ctx.apply(&format!(
            "chown {} {} && chmod 600 {}",
            quote_arg(user),
            quote_path(&keys_file),
            quote_path(&keys_file)
        ))?;
    }

    Ok(ctx.outcome("ensure_authorized_key", &resource, dir.changed || line.changed))
}

// ============================================================================
// Files
// ============================================================================

pub fn ensure_directory(
    ctx: &OpContext,
    path: &str,
    owner: Option<&str>,
    mode: Option<&str>,
) -> Result<OpOutcome> {
    let p = quote_path(path);
    let state = ctx.read(&format!("stat -c '%U:%G %a' {} 2>/dev/null || true", p))?;
    let state = state.trim();

    if state.is_empty() {
        let mut cmd = format!("mkdir -p {}", p);
        if let Some(owner) = owner {
            cmd.push_str(&format!(" && chown {} {}", quote_arg(owner), p));
        }
        if let Some(mode) = mode {
            cmd.push_str(&format!(" && chmod {} {}", quote_arg(mode), p));
        }
        ctx.apply(&cmd)?;
        return Ok(ctx.outcome("ensure_directory", path, true).with_detail("created"));
    }

    let (owner_now, mode_now) = state.split_once(' ').unwrap_or((state, ""));
    let mut fixes = Vec::new();

    if let Some(owner) = owner {
        if !owner_matches(owner_now, owner) {
            fixes.push(format!("chown {} {}", quote_arg(owner), p));
        }
    }
    if let Some(mode) = mode {
        if normalize_mode(mode) != normalize_mode(mode_now) {
            fixes.push(format!("chmod {} {}", quote_arg(mode), p));
        }
    }

    if fixes.is_empty() {
        return Ok(ctx.outcome("ensure_directory", path, false));
    }

    ctx.apply(&fixes.join(" && "))?;
    Ok(ctx.outcome("ensure_directory", path, true))
}

fn owner_matches(current: &str, desired: &str) -> bool {
    if desired.contains(':') {
        current == desired
    } else {
        current.split(':').next() == Some(desired)
    }
}

fn normalize_mode(mode: &str) -> &str {
    let trimmed = mode.trim().trim_start_matches('0');
    if trimmed.is_empty() {
        "0"
    } else {
        trimmed
    }
}

pub fn ensure_line_in_file(ctx: &OpContext, path: &str, line: &str) -> Result<OpOutcome> {
    let p = quote_path(path);
    let l = quote_arg(line);
    let resource = format!("{}:{}", path, line);

    if ctx.test(&format!("grep -qxF -- {} {} 2>/dev/null", l, p))? {
        return Ok(ctx.outcome("ensure_line", &resource, false));
    }

    // Keep the file newline-terminated before appending.
    ctx.apply(&format!(
        "touch {p} && {{ [ ! -s {p} ] || [ -z \"$(tail -c1 {p})\" ] || echo; printf '%s\\n' {l}; }} >> {p}",
        p = p,
        l = l
    ))?;
    Ok(ctx.outcome("ensure_line", &resource, true))
}

pub fn ensure_line_absent(ctx: &OpContext, path: &str, line: &str) -> Result<OpOutcome> {
    let p = quote_path(path);
    let l = quote_arg(line);
    let resource = format!("{}:{}", path, line);

    if !ctx.test(&format!("grep -qxF -- {} {} 2>/dev/null", l, p))? {
        return Ok(ctx.outcome("ensure_line_absent", &resource, false));
    }

    ctx.apply(&format!(
        "{{ grep -vxF -- {l} {p} || true; }} > {p}.keel.tmp && cat {p}.keel.tmp > {p} && rm -f {p}.keel.tmp",
        p = p,
        l = l
    ))?;
    Ok(ctx.outcome("ensure_line_absent", &resource, true))
}

/// Ensure `key<separator>value` is the first line starting with `key<separator>`;
/// later duplicates of the key are dropped. Values never appear in errors.
pub fn ensure_setting(
    ctx: &OpContext,
    path: &str,
    key: &str,
    separator: &str,
    value: &str,
) -> Result<OpOutcome> {
    let p = quote_path(path);
    let env = format!("K={} S={}", quote_path(key), quote_path(separator));
    let resource = format!("{}:{}", path, key);

    let current = ctx.read(&format!(
        "{} awk 'index($0, ENVIRON[\"K\"] ENVIRON[\"S\"]) == 1 {{ print; exit }}' {} 2>/dev/null || true",
        env, p
    ))?;
    let wanted = format!("{}{}{}", key, separator, value);
    if current.trim_end_matches('\n') == wanted {
        return Ok(ctx.outcome("ensure_setting", &resource, false));
    }

    let script = "BEGIN { p = ENVIRON[\"K\"] ENVIRON[\"S\"]; done = 0 } \
                  index($0, p) == 1 { if (!done) { print p ENVIRON[\"V\"]; done = 1 }; next } \
                  { print } \
                  END { if (!done) print p ENVIRON[\"V\"] }";
    let command = format!(
        "touch {p} && {env} V={v} awk '{script}' {p} > {p}.keel.tmp && cat {p}.keel.tmp > {p} && rm -f {p}.keel.tmp",
        p = p,
        env = env,
        v = quote_path(value),
        script = script
    );
    ctx.apply_redacted(&command, &format!("set {} in {}", key, path))?;
    Ok(ctx.outcome("ensure_setting", &resource, true))
}

/// `KEY=VALUE` form of [`ensure_setting`] (dotenv files).
pub fn ensure_key_value(ctx: &OpContext, path: &str, key: &str, value: &str) -> Result<OpOutcome> {
    ensure_setting(ctx, path, key, "=", value)
}

pub fn ensure_file_content(
    ctx: &OpContext,
    content: &[u8],
    remote_path: &str,
    mode: Option<&str>,
) -> Result<OpOutcome> {
    let p = quote_path(remote_path);
    let wanted = sha256_hex(content);
    let current = ctx.read(&format!("sha256sum {} 2>/dev/null | cut -d' ' -f1", p))?;

    if current.trim() == wanted {
        let mode_ok = match mode {
            Some(mode) => {
                let now = ctx.read(&format!("stat -c '%a' {}", p))?;
                normalize_mode(&now) == normalize_mode(mode)
            }
            None => true,
        };
        if mode_ok {
            return Ok(ctx.outcome("ensure_file", remote_path, false));
        }
    }

    let tmp = format!("{}.keel.tmp", remote_path);
    ctx.upload(content, &tmp)?;
    let mut cmd = String::new();
    if let Some(mode) = mode {
        cmd.push_str(&format!("chmod {} {} && ", quote_arg(mode), quote_path(&tmp)));
    }
    cmd.push_str(&format!("mv -f {} {}", quote_path(&tmp), p));
    ctx.apply(&cmd)?;
    Ok(ctx.outcome("ensure_file", remote_path, true))
}

pub fn ensure_file_mode(ctx: &OpContext, path: &str, mode: &str) -> Result<OpOutcome> {
    let p = quote_path(path);
    let now = ctx.read(&format!("stat -c '%a' {} 2>/dev/null || true", p))?;
    let resource = format!("{}:mode", path);
    if normalize_mode(&now) == normalize_mode(mode) {
        return Ok(ctx.outcome("ensure_file_mode", &resource, false));
    }
    if now.trim().is_empty() && !ctx.dry_run {
        return Err(Error::precondition_failed(path, "file does not exist"));
    }
    ctx.apply(&format!("chmod {} {}", quote_arg(mode), p))?;
    Ok(ctx
        .outcome("ensure_file_mode", &resource, true)
        .with_detail(mode.to_string()))
}

/// Point `link` at `target` through a rename, so readers never see a missing link.
pub fn ensure_symlink(ctx: &OpContext, link: &str, target: &str) -> Result<OpOutcome> {
    let l = quote_path(link);
    let current = ctx.read(&format!("readlink {} || true", l))?;
    if current.trim() == target {
        return Ok(ctx.outcome("ensure_symlink", link, false));
    }

    let tmp = quote_path(&format!("{}.keel.tmp", link));
    ctx.apply(&format!(
        "ln -sfn {} {} && mv -Tf {} {}",
        quote_path(target),
        tmp,
        tmp,
        l
    ))?;
    Ok(ctx
        .outcome("ensure_symlink", link, true)
        .with_detail(format!("-> {}", target)))
}

pub fn sha256_hex(content: &[u8]) -> String {
    let digest = Sha256::digest(content);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

// ============================================================================
// Packages, services, firewall (external collaborators)
// ============================================================================

pub fn ensure_package(ctx: &OpContext, name: &str) -> Result<OpOutcome> {
    let pkg = quote_arg(name);
    let installed = ctx.test(&format!(
        "dpkg-query -W -f='${{Status}}' {} 2>/dev/null | grep -q 'install ok installed'",
        pkg
    ))?;
    if installed {
        return Ok(ctx.outcome("ensure_package", name, false));
    }

    ctx.apply(&format!(
        "DEBIAN_FRONTEND=noninteractive apt-get install -y -q {}",
        pkg
    ))?;
    Ok(ctx.outcome("ensure_package", name, true))
}

pub fn ensure_service_enabled(ctx: &OpContext, name: &str) -> Result<OpOutcome> {
    let svc = quote_arg(name);
    if ctx.test(&format!("systemctl is-enabled --quiet {}", svc))? {
        return Ok(ctx.outcome("ensure_service_enabled", name, false));
    }
    ctx.apply(&format!("systemctl enable {}", svc))?;
    Ok(ctx.outcome("ensure_service_enabled", name, true))
}

pub fn ensure_service_running(ctx: &OpContext, name: &str) -> Result<OpOutcome> {
    let svc = quote_arg(name);
    if ctx.test(&format!("systemctl is-active --quiet {}", svc))? {
        return Ok(ctx.outcome("ensure_service_running", name, false));
    }
    ctx.apply(&format!("systemctl start {}", svc))?;
    Ok(ctx.outcome("ensure_service_running", name, true))
}

/// Make a running service re-read its configuration without dropping
/// connections. Units without reload support fall back to a restart, which
/// is reported in the outcome detail. This is a trigger, so `changed` is true.
pub fn reload_service(ctx: &OpContext, name: &str) -> Result<OpOutcome> {
    let svc = quote_arg(name);

    if !ctx.test(&format!("systemctl is-active --quiet {}", svc))? {
        ctx.apply(&format!("systemctl start {}", svc))?;
        return Ok(ctx
            .outcome("reload_service", name, true)
            .with_detail("started"));
    }

    let can_reload = ctx.read(&format!(
        "systemctl show -p CanReload --value {} || true",
        svc
    ))?;
    if can_reload.trim() == "yes" {
        ctx.apply(&format!("systemctl reload {}", svc))?;
        return Ok(ctx
            .outcome("reload_service", name, true)
            .with_detail("reloaded"));
    }

    tracing::warn!(host = %ctx.host.id, service = name, "no reload support, restarting");
    ctx.apply(&format!("systemctl restart {}", svc))?;
    Ok(ctx
        .outcome("reload_service", name, true)
        .with_detail("restarted (no reload support)"))
}

pub fn restart_service(ctx: &OpContext, name: &str) -> Result<OpOutcome> {
    ctx.apply(&format!("systemctl restart {}", quote_arg(name)))?;
    Ok(ctx
        .outcome("restart_service", name, true)
        .with_detail("restarted"))
}

pub fn ensure_firewall_port(ctx: &OpContext, port: u16, proto: &str) -> Result<OpOutcome> {
    let rule = format!("{}/{}", port, proto);
    let allowed = ctx.test(&format!(
        "ufw status | grep -qE {}",
        quote_path(&format!("^{}[[:space:]]+ALLOW", rule))
    ))?;
    if allowed {
        return Ok(ctx.outcome("ensure_firewall_port", &rule, false));
    }
    ctx.apply(&format!("ufw allow {}", quote_arg(&rule)))?;
    Ok(ctx.outcome("ensure_firewall_port", &rule, true))
}

// ============================================================================
// PostgreSQL
// ============================================================================

fn psql(sql: &str) -> String {
    format!(
        "sudo -u postgres psql -v ON_ERROR_STOP=1 -tAc {}",
        quote_path(sql)
    )
}

pub fn ensure_db_role(ctx: &OpContext, role: &str, password: &str) -> Result<OpOutcome> {
    let exists = ctx.read(&psql(&format!(
        "SELECT 1 FROM pg_roles WHERE rolname = {}",
        shell::sql_literal(role)
    )))?;

    if exists.trim() != "1" {
        ctx.apply_redacted(
            &psql(&format!(
                "CREATE ROLE {} LOGIN PASSWORD {}",
                shell::sql_identifier(role),
                shell::sql_literal(password)
            )),
            &format!("CREATE ROLE {}", role),
        )?;
        return Ok(ctx
            .outcome("ensure_db_role", role, true)
            .with_detail("created"));
    }

    let password = ensure_db_role_password(ctx, role, password)?;
    Ok(ctx.outcome("ensure_db_role", role, password.changed))
}

/// The password is unreadable, so the check is a login attempt with it.
pub fn ensure_db_role_password(ctx: &OpContext, role: &str, password: &str) -> Result<OpOutcome> {
    let login = format!(
        "PGPASSWORD={} psql -h 127.0.0.1 -U {} -d postgres -tAc 'SELECT 1' >/dev/null 2>&1",
        quote_path(password),
        quote_arg(role)
    );
    if ctx.test_redacted(&login, &format!("login as {}", role))? {
        return Ok(ctx.outcome("ensure_db_role_password", role, false));
    }

    ctx.apply_redacted(
        &psql(&format!(
            "ALTER ROLE {} WITH PASSWORD {}",
            shell::sql_identifier(role),
            shell::sql_literal(password)
        )),
        &format!("ALTER ROLE {} PASSWORD", role),
    )?;
    Ok(ctx.outcome("ensure_db_role_password", role, true))
}

pub fn ensure_database(ctx: &OpContext, name: &str, owner: &str) -> Result<OpOutcome> {
    let exists = ctx.read(&psql(&format!(
        "SELECT 1 FROM pg_database WHERE datname = {}",
        shell::sql_literal(name)
    )))?;
    if exists.trim() == "1" {
        return Ok(ctx.outcome("ensure_database", name, false));
    }

    ctx.apply(&psql(&format!(
        "CREATE DATABASE {} OWNER {}",
        shell::sql_identifier(name),
        shell::sql_identifier(owner)
    )))?;
    Ok(ctx.outcome("ensure_database", name, true))
}

// ============================================================================
// Host plans
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostPlan {
    #[serde(default)]
    pub packages: Vec<String>,
    #[serde(default)]
    pub firewall: Vec<FirewallRule>,
    #[serde(default)]
    pub directories: Vec<DirectorySpec>,
    #[serde(default)]
    pub files: Vec<FileSpec>,
    #[serde(default)]
    pub lines: Vec<LineSpec>,
    #[serde(default)]
    pub services: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallRule {
    pub port: u16,
    #[serde(default = "default_proto")]
    pub proto: String,
}

fn default_proto() -> String {
    "tcp".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectorySpec {
    pub path: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSpec {
    /// Local source file, resolved against the topology file's directory
    pub source: PathBuf,
    pub path: String,
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineSpec {
    pub path: String,
    pub line: String,
}

impl HostPlan {
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
            && self.firewall.is_empty()
            && self.directories.is_empty()
            && self.files.is_empty()
            && self.lines.is_empty()
            && self.services.is_empty()
    }

    pub fn describe(&self) -> String {
        if self.is_empty() {
            return "nothing declared".to_string();
        }
        let parts = [
            (self.packages.len(), "package(s)"),
            (self.firewall.len(), "firewall rule(s)"),
            (self.directories.len(), "director(ies)"),
            (self.files.len(), "file(s)"),
            (self.lines.len(), "line(s)"),
            (self.services.len(), "service(s)"),
        ];
        parts
            .iter()
            .filter(|(n, _)| *n > 0)
            .map(|(n, label)| format!("{} {}", n, label))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Apply a plan in a fixed order: packages, firewall, directories, files,
/// lines, services. Services already running are reloaded when any file or
/// line they may read changed.
pub fn apply_host_plan(ctx: &OpContext, plan: &HostPlan) -> Result<Vec<OpOutcome>> {
    let mut outcomes = Vec::new();

    for package in &plan.packages {
        outcomes.push(ensure_package(ctx, package)?);
    }
    for rule in &plan.firewall {
        outcomes.push(ensure_firewall_port(ctx, rule.port, &rule.proto)?);
    }
    for dir in &plan.directories {
        outcomes.push(ensure_directory(
            ctx,
            &dir.path,
            dir.owner.as_deref(),
            dir.mode.as_deref(),
        )?);
    }

    let mut config_changed = false;
    for file in &plan.files {
        let content = std::fs::read(&file.source).map_err(|e| {
            Error::internal_io(
                e.to_string(),
                Some(format!("read {}", file.source.display())),
            )
        })?;
        let outcome = ensure_file_content(ctx, &content, &file.path, file.mode.as_deref())?;
        config_changed |= outcome.changed;
        outcomes.push(outcome);
    }
    for line in &plan.lines {
        let outcome = ensure_line_in_file(ctx, &line.path, &line.line)?;
        config_changed |= outcome.changed;
        outcomes.push(outcome);
    }

    for service in &plan.services {
        outcomes.push(ensure_service_enabled(ctx, service)?);
        let running = ensure_service_running(ctx, service)?;
        let started = running.changed;
        outcomes.push(running);
        if config_changed && !started {
            outcomes.push(reload_service(ctx, service)?);
        }
    }

    Ok(outcomes)
}
