use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::deadline::Deadline;
use crate::error::{Error, Result};
use crate::host::Host;
use crate::notify::{Event, Notification, Notifier};
use crate::ops::OpOutcome;

/// Pipeline phases, in run order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseId {
    UserSetup,
    Ssh,
    Secrets,
    ObservabilityPrep,
    AppPrep,
    Deploy,
    Observability,
    Verification,
}

impl PhaseId {
    pub const ALL: [PhaseId; 8] = [
        PhaseId::UserSetup,
        PhaseId::Ssh,
        PhaseId::Secrets,
        PhaseId::ObservabilityPrep,
        PhaseId::AppPrep,
        PhaseId::Deploy,
        PhaseId::Observability,
        PhaseId::Verification,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseId::UserSetup => "user-setup",
            PhaseId::Ssh => "ssh",
            PhaseId::Secrets => "secrets",
            PhaseId::ObservabilityPrep => "observability-prep",
            PhaseId::AppPrep => "app-prep",
            PhaseId::Deploy => "deploy",
            PhaseId::Observability => "observability",
            PhaseId::Verification => "verification",
        }
    }
}

impl fmt::Display for PhaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        PhaseId::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| {
                Error::validation_invalid_argument(
                    "phase",
                    format!("Unknown phase '{}'", s),
                    Some(s.to_string()),
                    Some(PhaseId::ALL.iter().map(|p| p.as_str().to_string()).collect()),
                )
            })
    }
}

/// Phases the caller opted out of. Never computed from host state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SkipSet(BTreeSet<PhaseId>);

impl SkipSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, phase: PhaseId) -> bool {
        self.0.insert(phase)
    }

    pub fn contains(&self, phase: PhaseId) -> bool {
        self.0.contains(&phase)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = PhaseId> + '_ {
        self.0.iter().copied()
    }
}

impl FromIterator<PhaseId> for SkipSet {
    fn from_iter<I: IntoIterator<Item = PhaseId>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// What a phase action can see of the run.
pub struct PhaseContext<'r> {
    pub run_id: &'r str,
    pub phase: PhaseId,
    pub deadline: Deadline,
}

type PhaseFn<'a> = Box<dyn Fn(&PhaseContext) -> Result<Vec<OpOutcome>> + 'a>;

pub struct Phase<'a> {
    pub id: PhaseId,
    pub description: String,
    pub skippable: bool,
    pub depends_on: Vec<PhaseId>,
    /// Lines shown by dry runs and `keel plan`
    pub steps: Vec<String>,
    action: PhaseFn<'a>,
    rollback: Option<PhaseFn<'a>>,
}

impl<'a> Phase<'a> {
    pub fn new(
        id: PhaseId,
        description: impl Into<String>,
        action: impl Fn(&PhaseContext) -> Result<Vec<OpOutcome>> + 'a,
    ) -> Self {
        Self {
            id,
            description: description.into(),
            skippable: true,
            depends_on: Vec::new(),
            steps: Vec::new(),
            action: Box::new(action),
            rollback: None,
        }
    }

    pub fn with_rollback(
        mut self,
        rollback: impl Fn(&PhaseContext) -> Result<Vec<OpOutcome>> + 'a,
    ) -> Self {
        self.rollback = Some(Box::new(rollback));
        self
    }

    pub fn depends_on(mut self, phases: &[PhaseId]) -> Self {
        self.depends_on = phases.to_vec();
        self
    }

    pub fn required(mut self) -> Self {
        self.skippable = false;
        self
    }

    pub fn with_steps(mut self, steps: Vec<String>) -> Self {
        self.steps = steps;
        self
    }

    pub fn has_rollback(&self) -> bool {
        self.rollback.is_some()
    }
}

impl fmt::Debug for Phase<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Phase")
            .field("id", &self.id)
            .field("skippable", &self.skippable)
            .field("depends_on", &self.depends_on)
            .field("rollback", &self.rollback.is_some())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Run,
    Skip,
    Abort,
}

/// Asked before each phase of an interactive run.
pub trait PhaseGate {
    fn decide(&self, phase: &Phase) -> GateDecision;
}

#[derive(Default)]
pub struct RunOptions<'g> {
    pub run_id: String,
    pub skip: SkipSet,
    pub dry_run: bool,
    pub interactive: Option<&'g dyn PhaseGate>,
    pub deadline: Deadline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Succeeded,
    Skipped,
    DryRun,
    Failed,
    NotRun,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    Succeeded,
    Failed,
    NotDefined,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub details: Value,
}

impl From<&Error> for PhaseError {
    fn from(err: &Error) -> Self {
        Self {
            code: err.code.as_str().to_string(),
            message: err.message.clone(),
            details: err.details.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseRollback {
    pub status: RollbackStatus,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<OpOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<PhaseError>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseResult {
    pub id: PhaseId,
    pub description: String,
    pub status: PhaseStatus,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<OpOutcome>,
    pub duration_ms: u128,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<PhaseError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollback: Option<PhaseRollback>,
}

impl PhaseResult {
    fn pending(phase: &Phase, status: PhaseStatus) -> Self {
        Self {
            id: phase.id,
            description: phase.description.clone(),
            status,
            steps: Vec::new(),
            changes: Vec::new(),
            duration_ms: 0,
            error: None,
            rollback: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Succeeded,
    /// A phase failed; its rollback succeeded or none was defined
    Failed,
    RollbackFailed,
    Cancelled,
    Aborted,
}

impl PipelineStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Succeeded => "succeeded",
            PipelineStatus::Failed => "failed",
            PipelineStatus::RollbackFailed => "rollback_failed",
            PipelineStatus::Cancelled => "cancelled",
            PipelineStatus::Aborted => "aborted",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineStatus::Succeeded => 0,
            PipelineStatus::Failed => 1,
            PipelineStatus::RollbackFailed => 3,
            PipelineStatus::Cancelled => 5,
            PipelineStatus::Aborted => 6,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSummary {
    pub total_phases: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub not_run: usize,
    /// Operations that changed something
    pub changed: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub next_actions: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineReport {
    pub run_id: String,
    pub status: PipelineStatus,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub dry_run: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_phase: Option<PhaseId>,
    pub phases: Vec<PhaseResult>,
    pub summary: PipelineSummary,
    pub duration_ms: u128,
}

impl PipelineReport {
    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }

    pub fn phase(&self, id: PhaseId) -> Option<&PhaseResult> {
        self.phases.iter().find(|p| p.id == id)
    }
}

pub struct Pipeline<'a> {
    phases: Vec<Phase<'a>>,
}

impl fmt::Debug for Pipeline<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline").field("phases", &self.phases).finish()
    }
}

impl<'a> Pipeline<'a> {
    /// Phase ids must be unique and every dependency declared earlier.
    pub fn new(phases: Vec<Phase<'a>>) -> Result<Self> {
        let mut seen = HashSet::new();
        for phase in &phases {
            for dep in &phase.depends_on {
                if !seen.contains(dep) {
                    return Err(Error::validation_invalid_argument(
                        "pipeline",
                        format!(
                            "Phase '{}' depends on '{}', which is not declared before it",
                            phase.id, dep
                        ),
                        None,
                        None,
                    ));
                }
            }
            if !seen.insert(phase.id) {
                return Err(Error::validation_invalid_argument(
                    "pipeline",
                    format!("Duplicate phase '{}'", phase.id),
                    None,
                    None,
                ));
            }
        }
        Ok(Self { phases })
    }

    pub fn phases(&self) -> &[Phase<'a>] {
        &self.phases
    }

    /// Reject skips of required phases before anything runs.
    pub fn validate_skip(&self, skip: &SkipSet) -> Result<()> {
        let required: Vec<String> = self
            .phases
            .iter()
            .filter(|p| !p.skippable && skip.contains(p.id))
            .map(|p| p.id.to_string())
            .collect();
        if !required.is_empty() {
            return Err(Error::validation_invalid_argument(
                "skip",
                format!("Phases cannot be skipped: {}", required.join(", ")),
                None,
                Some(required),
            ));
        }
        Ok(())
    }

    /// Run phases in declaration order, halting at the first failure.
    ///
    /// `Err` is returned only for an invalid skip set; phase failures are
    /// reported through the report status.
    pub fn run(&self, options: &RunOptions, notifier: &dyn Notifier) -> Result<PipelineReport> {
        self.validate_skip(&options.skip)?;

        let started = Instant::now();
        let run_id = options.run_id.as_str();
        let notify = |n: Notification| {
            if !options.dry_run {
                notifier.notify(&n);
            }
        };

        tracing::info!(run_id, dry_run = options.dry_run, phases = self.phases.len(), "pipeline started");
        notify(Notification::new(
            Event::PipelineStarted,
            run_id,
            "started",
            format!("{} phase(s)", self.phases.len()),
        ));

        let mut results = Vec::with_capacity(self.phases.len());
        let mut status = PipelineStatus::Succeeded;
        let mut failed_phase = None;

        for phase in &self.phases {
            if status != PipelineStatus::Succeeded {
                results.push(PhaseResult::pending(phase, PhaseStatus::NotRun));
                continue;
            }

            if options.skip.contains(phase.id) {
                log_status!("pipeline", "{}: skipped", phase.id);
                tracing::info!(phase = %phase.id, "skipped");
                results.push(PhaseResult::pending(phase, PhaseStatus::Skipped));
                continue;
            }

            if options.dry_run {
                log_status!("pipeline", "{}: would {}", phase.id, phase.description);
                let mut result = PhaseResult::pending(phase, PhaseStatus::DryRun);
                result.steps = phase.steps.clone();
                results.push(result);
                continue;
            }

            if options.deadline.expired() {
                tracing::warn!(phase = %phase.id, "deadline passed, not starting phase");
                log_status!("pipeline", "Deadline passed before {}", phase.id);
                status = PipelineStatus::Cancelled;
                results.push(PhaseResult::pending(phase, PhaseStatus::NotRun));
                continue;
            }

            if let Some(gate) = options.interactive {
                match gate.decide(phase) {
                    GateDecision::Run => {}
                    GateDecision::Skip => {
                        results.push(PhaseResult::pending(phase, PhaseStatus::Skipped));
                        continue;
                    }
                    GateDecision::Abort => {
                        tracing::warn!(phase = %phase.id, "run aborted by operator");
                        status = PipelineStatus::Aborted;
                        results.push(PhaseResult::pending(phase, PhaseStatus::NotRun));
                        continue;
                    }
                }
            }

            let result = self.run_phase(phase, options);
            if result.status == PhaseStatus::Failed {
                let rolled_back = result
                    .rollback
                    .as_ref()
                    .map(|r| r.status)
                    .unwrap_or(RollbackStatus::NotDefined);
                status = if rolled_back == RollbackStatus::Failed {
                    PipelineStatus::RollbackFailed
                } else {
                    PipelineStatus::Failed
                };
                failed_phase = Some(phase.id);
                let message = result
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_default();
                notify(
                    Notification::new(Event::PhaseFailed, run_id, status.as_str(), message)
                        .for_phase(phase.id.as_str()),
                );
            }
            results.push(result);
        }

        let summary = summarize(&results, status);
        let report = PipelineReport {
            run_id: run_id.to_string(),
            status,
            dry_run: options.dry_run,
            failed_phase,
            phases: results,
            summary,
            duration_ms: started.elapsed().as_millis(),
        };

        tracing::info!(run_id, status = status.as_str(), changed = report.summary.changed, "pipeline finished");
        notify(Notification::new(
            Event::PipelineFinished,
            run_id,
            status.as_str(),
            match failed_phase {
                Some(phase) => format!("halted at {}", phase),
                None => format!("{} change(s)", report.summary.changed),
            },
        ));
        Ok(report)
    }

    fn run_phase(&self, phase: &Phase, options: &RunOptions) -> PhaseResult {
        let ctx = PhaseContext {
            run_id: &options.run_id,
            phase: phase.id,
            deadline: options.deadline,
        };
        let started = Instant::now();
        log_status!("pipeline", "{}: {}", phase.id, phase.description);
        tracing::info!(phase = %phase.id, "phase started");

        let mut result = PhaseResult::pending(phase, PhaseStatus::Succeeded);
        match (phase.action)(&ctx) {
            Ok(changes) => {
                let changed = changes.iter().filter(|c| c.changed).count();
                tracing::info!(phase = %phase.id, operations = changes.len(), changed, "phase succeeded");
                if changed == 0 {
                    log_status!("pipeline", "{}: no changes", phase.id);
                }
                result.changes = changes;
            }
            Err(err) => {
                let host = err
                    .details
                    .get("host")
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("-");
                tracing::error!(
                    phase = %phase.id,
                    code = err.code.as_str(),
                    host,
                    at = %chrono::Utc::now().to_rfc3339(),
                    error = %err,
                    "phase failed"
                );
                log_status!("pipeline", "{} failed: {}", phase.id, err);
                result.status = PhaseStatus::Failed;
                result.error = Some(PhaseError::from(&err));
                result.rollback = Some(roll_back(phase, &ctx));
            }
        }
        result.duration_ms = started.elapsed().as_millis();
        result
    }
}

fn roll_back(phase: &Phase, ctx: &PhaseContext) -> PhaseRollback {
    let Some(rollback) = &phase.rollback else {
        return PhaseRollback {
            status: RollbackStatus::NotDefined,
            changes: Vec::new(),
            error: None,
        };
    };

    log_status!("pipeline", "{}: rolling back", phase.id);
    match rollback(ctx) {
        Ok(changes) => {
            tracing::info!(phase = %phase.id, "rollback succeeded");
            PhaseRollback {
                status: RollbackStatus::Succeeded,
                changes,
                error: None,
            }
        }
        Err(err) => {
            tracing::error!(phase = %phase.id, code = err.code.as_str(), error = %err, "rollback failed");
            log_status!("pipeline", "{}: rollback failed: {}", phase.id, err);
            PhaseRollback {
                status: RollbackStatus::Failed,
                changes: Vec::new(),
                error: Some(PhaseError::from(&err)),
            }
        }
    }
}

fn summarize(results: &[PhaseResult], status: PipelineStatus) -> PipelineSummary {
    let count = |s: PhaseStatus| results.iter().filter(|r| r.status == s).count();
    let changed = results
        .iter()
        .flat_map(|r| &r.changes)
        .filter(|c| c.changed)
        .count();

    let next_actions = match status {
        PipelineStatus::Failed | PipelineStatus::Cancelled | PipelineStatus::Aborted => vec![
            "Fix the issue and re-run (idempotent - completed phases report no changes)".to_string(),
        ],
        PipelineStatus::RollbackFailed => vec![
            "Rollback did not complete; inspect the failed phase's hosts before re-running"
                .to_string(),
        ],
        PipelineStatus::Succeeded => Vec::new(),
    };

    PipelineSummary {
        total_phases: results.len(),
        succeeded: count(PhaseStatus::Succeeded),
        skipped: count(PhaseStatus::Skipped),
        failed: count(PhaseStatus::Failed),
        not_run: count(PhaseStatus::NotRun),
        changed,
        next_actions,
    }
}

/// Run `f` once per host, each on its own thread. Same-host work stays on one
/// thread. Outcomes come back in host order; the first error in host order wins
/// after every host has finished.
pub fn per_host<'h, F>(hosts: &[&'h Host], f: F) -> Result<Vec<OpOutcome>>
where
    F: Fn(&'h Host) -> Result<Vec<OpOutcome>> + Sync,
{
    if hosts.len() <= 1 {
        return match hosts.first() {
            Some(host) => f(host),
            None => Ok(Vec::new()),
        };
    }

    let f = &f;
    let results: Vec<Result<Vec<OpOutcome>>> = std::thread::scope(|scope| {
        let handles: Vec<_> = hosts
            .iter()
            .copied()
            .map(|host| scope.spawn(move || f(host)))
            .collect();

        handles
            .into_iter()
            .map(|handle| {
                handle.join().unwrap_or_else(|_| {
                    Err(Error::internal_unexpected("host worker thread panicked"))
                })
            })
            .collect()
    });

    let mut outcomes = Vec::new();
    for result in results {
        outcomes.extend(result?);
    }
    Ok(outcomes)
}
