use crate::step::{StepKind, StepStatus};
use serde::Serialize;
use std::sync::mpsc::Sender;

/// One-way progress report from a running sequencer to a front-end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressEvent {
    pub step: StepKind,
    pub status: StepStatus,
    pub message: String,
    /// Share of steps finished, 0-100.
    pub percent: u8,
}

/// Optional channel end. Sending never blocks; a front-end that went away
/// is ignored.
#[derive(Debug, Clone, Default)]
pub(crate) struct ProgressSink(Option<Sender<ProgressEvent>>);

impl ProgressSink {
    pub(crate) fn new(tx: Option<Sender<ProgressEvent>>) -> Self {
        Self(tx)
    }

    pub(crate) fn emit(&self, step: StepKind, status: StepStatus, message: impl Into<String>) {
        let Some(tx) = &self.0 else { return };
        let done = match status {
            StepStatus::Applied => step.index() + 1,
            _ => step.index(),
        };
        let percent = u8::try_from(done * 100 / StepKind::ALL.len()).unwrap_or(100);
        let _ = tx.send(ProgressEvent {
            step,
            status,
            message: message.into(),
            percent,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn percent_counts_applied_steps() {
        let (tx, rx) = mpsc::channel();
        let sink = ProgressSink::new(Some(tx));
        sink.emit(StepKind::Keyboard, StepStatus::Validated, "applying");
        sink.emit(StepKind::Users, StepStatus::Applied, "done");
        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(events[0].percent, 0);
        assert_eq!(events[1].percent, 100);
    }

    #[test]
    fn closed_channel_is_ignored() {
        let (tx, rx) = mpsc::channel();
        drop(rx);
        ProgressSink::new(Some(tx)).emit(StepKind::Disk, StepStatus::Applied, "x");
        ProgressSink::default().emit(StepKind::Disk, StepStatus::Applied, "x");
    }
}
