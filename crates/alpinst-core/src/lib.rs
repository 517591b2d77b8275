//! Installation orchestration for alpinst.
//!
//! This crate turns a complete `InstallPlan` into an installed system: the
//! step controllers validate and apply their slice of the plan, the
//! `Sequencer` drives them in a fixed order through a small state machine
//! with reverse-order cleanup on failure or cancellation, and the `Engine`
//! facade ties environment queries, locking and sequencing together for both
//! front-ends.

pub mod concurrency;
pub mod context;
pub mod engine;
pub mod lifecycle;
pub mod progress;
pub mod sequencer;
pub mod step;
pub mod steps;

pub use concurrency::{install_signal_handler, CancelToken, InstallLock};
pub use context::PlanContext;
pub use engine::Engine;
pub use lifecycle::{validate_run_transition, validate_transition, RunState};
pub use progress::ProgressEvent;
pub use sequencer::{CleanupReport, RunOutcome, Sequencer};
pub use step::{
    ApplyScope, CleanupReason, ErrorKind, ExecutionError, StepController, StepKind, StepRecord,
    StepStatus, ValidationError,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("plan error: {0}")]
    Plan(#[from] alpinst_schema::PlanError),
    #[error("runtime error: {0}")]
    Runtime(#[from] alpinst_runtime::RuntimeError),
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("step {step} cannot apply before {blocked_by} is applied")]
    OrderingViolation { step: String, blocked_by: String },
    #[error("another installer holds {0}")]
    Locked(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Why a run stopped short of `Completed`.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("plan validation failed with {} error(s)", .0.len())]
    Validation(Vec<ValidationError>),
    #[error("{error}")]
    Execution {
        error: ExecutionError,
        cleanup: CleanupReport,
    },
    #[error("cannot write setup record: {source}")]
    Record {
        source: CoreError,
        cleanup: CleanupReport,
    },
    #[error("cancelled before step {before}")]
    Cancelled {
        before: StepKind,
        cleanup: CleanupReport,
    },
    #[error(transparent)]
    Fatal(#[from] CoreError),
}

impl RunError {
    /// Cleanup outcome reported next to the original failure, if any ran.
    pub fn cleanup(&self) -> Option<&CleanupReport> {
        match self {
            Self::Execution { cleanup, .. }
            | Self::Record { cleanup, .. }
            | Self::Cancelled { cleanup, .. } => Some(cleanup),
            Self::Validation(_) | Self::Fatal(_) => None,
        }
    }
}
