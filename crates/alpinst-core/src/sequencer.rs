//! The run state machine.
//!
//! A `Sequencer` owns one controller per step and the matching
//! `StepRecord`s. It validates every step before anything is applied, then
//! applies them in table order with a per-step deadline. When a step fails
//! or the operator cancels, the steps that already ran are cleaned up in
//! reverse order and the cleanup outcome travels next to the original error.

use crate::concurrency::CancelToken;
use crate::context::PlanContext;
use crate::lifecycle::{validate_run_transition, validate_transition, RunState};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::step::{
    ApplyScope, CleanupReason, StepController, StepKind, StepRecord, StepStatus, ValidationError,
};
use crate::steps::default_steps;
use crate::{CoreError, RunError};
use alpinst_runtime::{CommandRunner, InstallerConfig, Session, StagingRoot};
use alpinst_schema::{dump_record, InstallPlan, SetupRecord};
use std::fmt;
use std::sync::mpsc::Sender;
use tracing::{debug, info, warn};

/// What the reverse cleanup pass achieved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Steps whose cleanup succeeded, in the order they ran.
    pub cleaned: Vec<StepKind>,
    pub failures: Vec<(StepKind, String)>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

impl fmt::Display for CleanupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.cleaned.is_empty() && self.failures.is_empty() {
            return f.write_str("nothing to clean up");
        }
        let cleaned: Vec<&str> = self.cleaned.iter().map(|k| k.name()).collect();
        write!(f, "cleaned up: [{}]", cleaned.join(", "))?;
        for (step, reason) in &self.failures {
            write!(f, "; {step} cleanup failed: {reason}")?;
        }
        Ok(())
    }
}

/// A completed run.
#[derive(Debug)]
pub struct RunOutcome {
    pub record: SetupRecord,
    pub records: Vec<StepRecord>,
    pub cleanup: CleanupReport,
}

pub struct Sequencer<'a> {
    runner: &'a dyn CommandRunner,
    config: &'a InstallerConfig,
    steps: Vec<Box<dyn StepController>>,
    records: Vec<StepRecord>,
    state: RunState,
    cancel: CancelToken,
    progress: ProgressSink,
    installer_version: String,
}

impl<'a> Sequencer<'a> {
    pub fn new(runner: &'a dyn CommandRunner, config: &'a InstallerConfig) -> Self {
        Self::with_steps(runner, config, default_steps())
    }

    /// Custom controllers, applied in the order given.
    pub fn with_steps(
        runner: &'a dyn CommandRunner,
        config: &'a InstallerConfig,
        steps: Vec<Box<dyn StepController>>,
    ) -> Self {
        Self {
            runner,
            config,
            steps,
            records: Vec::new(),
            state: RunState::Idle,
            cancel: CancelToken::new(),
            progress: ProgressSink::default(),
            installer_version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, tx: Option<Sender<ProgressEvent>>) -> Self {
        self.progress = ProgressSink::new(tx);
        self
    }

    #[must_use]
    pub fn with_installer_version(mut self, version: impl Into<String>) -> Self {
        self.installer_version = version.into();
        self
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    fn transition(&mut self, to: RunState) -> Result<(), CoreError> {
        validate_run_transition(self.state, to)?;
        debug!("run: {} -> {to}", self.state);
        self.state = to;
        Ok(())
    }

    fn set_status(&mut self, i: usize, to: StepStatus) -> Result<(), CoreError> {
        let record = &mut self.records[i];
        validate_transition(record.status, to)?;
        record.status = to;
        Ok(())
    }

    /// Validate and apply `plan`. The plan is moved in so nothing else can
    /// change it while the run is in progress.
    pub fn run(&mut self, plan: InstallPlan, ctx: &PlanContext) -> Result<RunOutcome, RunError> {
        self.transition(RunState::Validating)?;
        self.records = self
            .steps
            .iter()
            .map(|s| StepRecord::new(s.kind(), &plan))
            .collect();

        let errors = self.validate_all(&plan, ctx)?;
        if !errors.is_empty() {
            info!("validation failed with {} error(s)", errors.len());
            self.transition(RunState::Aborted)?;
            return Err(RunError::Validation(errors));
        }

        self.transition(RunState::Applying)?;
        let staging = StagingRoot::new(&self.config.staging_root);
        staging.ensure_exists().map_err(CoreError::from)?;

        for i in 0..self.steps.len() {
            let kind = self.records[i].kind;

            if self.cancel.is_cancelled() {
                warn!("cancelled before step {kind}");
                let cleanup = self.cleanup(&plan, ctx, &staging, CleanupReason::Aborted);
                self.transition(RunState::Aborted)?;
                return Err(RunError::Cancelled {
                    before: kind,
                    cleanup,
                });
            }

            if let Some(blocked_by) = self.unapplied_predecessor(kind) {
                let cleanup = self.cleanup(&plan, ctx, &staging, CleanupReason::Aborted);
                warn!("aborting on ordering violation; {cleanup}");
                self.transition(RunState::Aborted)?;
                return Err(RunError::Fatal(CoreError::OrderingViolation {
                    step: kind.to_string(),
                    blocked_by: blocked_by.to_string(),
                }));
            }

            info!("applying step {kind}");
            self.progress
                .emit(kind, StepStatus::Validated, format!("applying {kind}"));
            let session = Session::new(self.runner, self.config.timeouts.for_step(kind.name()));
            let scope = ApplyScope {
                session: &session,
                staging: &staging,
                config: self.config,
                host: &ctx.host,
            };
            match self.steps[i].apply(&plan, &scope) {
                Ok(()) => {
                    self.set_status(i, StepStatus::Applied)?;
                    self.progress
                        .emit(kind, StepStatus::Applied, format!("{kind} applied"));
                }
                Err(error) => {
                    warn!("{error}");
                    self.set_status(i, StepStatus::Failed)?;
                    self.records[i].diagnostic = Some(error.to_string());
                    self.progress.emit(kind, StepStatus::Failed, error.to_string());
                    let cleanup = self.cleanup(&plan, ctx, &staging, CleanupReason::Aborted);
                    self.transition(RunState::Aborted)?;
                    return Err(RunError::Execution { error, cleanup });
                }
            }
        }

        let record = match self.persist_record(plan.clone(), &staging) {
            Ok(record) => record,
            Err(source) => {
                warn!("cannot write setup record: {source}");
                let cleanup = self.cleanup(&plan, ctx, &staging, CleanupReason::Aborted);
                self.transition(RunState::Aborted)?;
                return Err(RunError::Record { source, cleanup });
            }
        };

        let cleanup = self.cleanup(&plan, ctx, &staging, CleanupReason::Completed);
        self.transition(RunState::Completed)?;
        info!("installation completed ({})", record.plan_digest().short());
        Ok(RunOutcome {
            record,
            records: self.records.clone(),
            cleanup,
        })
    }

    /// Runs every validator and collects all errors in step order.
    fn validate_all(
        &mut self,
        plan: &InstallPlan,
        ctx: &PlanContext,
    ) -> Result<Vec<ValidationError>, CoreError> {
        let mut all = Vec::new();
        for i in 0..self.steps.len() {
            match self.steps[i].validate(plan, ctx) {
                Ok(()) => self.set_status(i, StepStatus::Validated)?,
                Err(errors) => {
                    self.set_status(i, StepStatus::Failed)?;
                    self.records[i].diagnostic = errors.first().map(ToString::to_string);
                    all.extend(errors);
                }
            }
        }
        Ok(all)
    }

    /// An earlier step, by table position, that has not been applied yet.
    fn unapplied_predecessor(&self, kind: StepKind) -> Option<StepKind> {
        self.records
            .iter()
            .find(|r| r.kind.index() < kind.index() && r.status != StepStatus::Applied)
            .map(|r| r.kind)
    }

    fn persist_record(
        &self,
        plan: InstallPlan,
        staging: &StagingRoot,
    ) -> Result<SetupRecord, CoreError> {
        let record = SetupRecord::new(plan, &self.installer_version)?;
        if self.config.copy_record {
            let target = self.config.record_path.to_string_lossy();
            staging.write_file(&target, &dump_record(&record)?, 0o600)?;
            debug!("setup record written to {target}");
        }
        Ok(record)
    }

    /// Calls `cleanup` on every step that ran, the failed one included,
    /// last first. Failures are logged and collected, never raised.
    fn cleanup(
        &mut self,
        plan: &InstallPlan,
        ctx: &PlanContext,
        staging: &StagingRoot,
        reason: CleanupReason,
    ) -> CleanupReport {
        let mut report = CleanupReport::default();
        for i in (0..self.steps.len()).rev() {
            let record = &self.records[i];
            let ran = record.status == StepStatus::Applied
                || (record.status == StepStatus::Failed && self.state == RunState::Applying);
            if !ran {
                continue;
            }
            let kind = record.kind;
            let session = Session::new(self.runner, self.config.timeouts.for_step(kind.name()));
            let scope = ApplyScope {
                session: &session,
                staging,
                config: self.config,
                host: &ctx.host,
            };
            match self.steps[i].cleanup(plan, &scope, reason) {
                Ok(()) => report.cleaned.push(kind),
                Err(e) => {
                    warn!("cleanup of step {kind} failed: {e}");
                    report.failures.push((kind, e.to_string()));
                }
            }
        }
        report
    }
}
