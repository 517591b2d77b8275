use crate::step::StepStatus;
use crate::CoreError;
use serde::Serialize;
use std::fmt;

/// Run state of a sequencer. A sequencer runs once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Validating,
    Applying,
    Completed,
    Aborted,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Validating => "validating",
            Self::Applying => "applying",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
        })
    }
}

pub fn validate_transition(from: StepStatus, to: StepStatus) -> Result<(), CoreError> {
    let valid = matches!(
        (from, to),
        (StepStatus::Pending, StepStatus::Validated | StepStatus::Failed)
            | (StepStatus::Validated, StepStatus::Applied | StepStatus::Failed)
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

pub fn validate_run_transition(from: RunState, to: RunState) -> Result<(), CoreError> {
    let valid = matches!(
        (from, to),
        (RunState::Idle, RunState::Validating)
            | (RunState::Validating, RunState::Applying | RunState::Aborted)
            | (RunState::Applying, RunState::Completed | RunState::Aborted)
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}
