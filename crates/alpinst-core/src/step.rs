//! The step controller contract and the per-step bookkeeping the sequencer
//! keeps.

use crate::context::PlanContext;
use alpinst_runtime::{HostFacts, InstallerConfig, RuntimeError, Session, StagingRoot};
use alpinst_schema::{InstallPlan, PlanSlice, Section};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// The installation steps, in their fixed apply order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Keyboard,
    Network,
    Disk,
    Mirror,
    Packages,
    Bootloader,
    Users,
}

impl StepKind {
    pub const ALL: [StepKind; 7] = [
        StepKind::Keyboard,
        StepKind::Network,
        StepKind::Disk,
        StepKind::Mirror,
        StepKind::Packages,
        StepKind::Bootloader,
        StepKind::Users,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Keyboard => "keyboard",
            Self::Network => "network",
            Self::Disk => "disk",
            Self::Mirror => "mirror",
            Self::Packages => "packages",
            Self::Bootloader => "bootloader",
            Self::Users => "users",
        }
    }

    /// Plan sub-record this step consumes.
    pub fn section(self) -> Section {
        match self {
            Self::Keyboard => Section::Keyboard,
            Self::Network => Section::Network,
            Self::Disk => Section::Disks,
            Self::Mirror => Section::Mirror,
            Self::Packages => Section::Packages,
            Self::Bootloader => Section::Bootloader,
            Self::Users => Section::Users,
        }
    }

    /// Position in the apply order.
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Validated,
    Applied,
    Failed,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Validated => "validated",
            Self::Applied => "applied",
            Self::Failed => "failed",
        })
    }
}

/// What the sequencer knows about one step. Only the sequencer changes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRecord {
    pub kind: StepKind,
    pub status: StepStatus,
    pub slice: PlanSlice,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

impl StepRecord {
    pub fn new(kind: StepKind, plan: &InstallPlan) -> Self {
        Self {
            kind,
            status: StepStatus::Pending,
            slice: plan.slice(kind.section()),
            diagnostic: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// The input breaks one of the step's own rules.
    Constraint,
    /// Trust could not be established: wrong key set or unverifiable index.
    Integrity,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{step}: {field}: {reason}")]
pub struct ValidationError {
    pub step: StepKind,
    pub field: String,
    pub reason: String,
    pub kind: ErrorKind,
}

impl ValidationError {
    pub fn constraint(step: StepKind, field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            step,
            field: field.into(),
            reason: reason.into(),
            kind: ErrorKind::Constraint,
        }
    }

    pub fn integrity(step: StepKind, field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            step,
            field: field.into(),
            reason: reason.into(),
            kind: ErrorKind::Integrity,
        }
    }

    pub fn is_integrity(&self) -> bool {
        self.kind == ErrorKind::Integrity
    }
}

#[derive(Debug, Error)]
#[error("step {step} failed: {cause}")]
pub struct ExecutionError {
    pub step: StepKind,
    #[source]
    pub cause: RuntimeError,
}

impl ExecutionError {
    pub fn new(step: StepKind, cause: RuntimeError) -> Self {
        Self { step, cause }
    }

    /// The step's sub-record was unset when it came to apply it.
    pub fn not_answered(step: StepKind) -> Self {
        Self::new(
            step,
            RuntimeError::Config(format!("{} not answered", step.section())),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupReason {
    /// The run finished; release what the step holds.
    Completed,
    /// A later step failed or the operator cancelled.
    Aborted,
}

/// Everything a step may touch while applying.
pub struct ApplyScope<'a> {
    pub session: &'a Session<'a>,
    pub staging: &'a StagingRoot,
    pub config: &'a InstallerConfig,
    pub host: &'a HostFacts,
}

pub trait StepController: Send {
    fn kind(&self) -> StepKind;

    /// Check the step's slice of the plan. Reads only the plan and the
    /// context; reports every problem found, not just the first.
    fn validate(&self, plan: &InstallPlan, ctx: &PlanContext) -> Result<(), Vec<ValidationError>>;

    /// Carry the step out. Called at most once per run.
    fn apply(&mut self, plan: &InstallPlan, scope: &ApplyScope<'_>) -> Result<(), ExecutionError>;

    /// Best-effort release or rollback of what `apply` left behind.
    fn cleanup(
        &mut self,
        _plan: &InstallPlan,
        _scope: &ApplyScope<'_>,
        _reason: CleanupReason,
    ) -> Result<(), RuntimeError> {
        Ok(())
    }
}

/// Collects validation errors for one step.
pub(crate) struct Findings {
    step: StepKind,
    errors: Vec<ValidationError>,
}

impl Findings {
    pub(crate) fn new(step: StepKind) -> Self {
        Self {
            step,
            errors: Vec::new(),
        }
    }

    pub(crate) fn constraint(&mut self, field: impl Into<String>, reason: impl Into<String>) {
        self.errors
            .push(ValidationError::constraint(self.step, field, reason));
    }

    pub(crate) fn integrity(&mut self, field: impl Into<String>, reason: impl Into<String>) {
        self.errors
            .push(ValidationError::integrity(self.step, field, reason));
    }

    pub(crate) fn finish(self) -> Result<(), Vec<ValidationError>> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(self.errors)
        }
    }
}
