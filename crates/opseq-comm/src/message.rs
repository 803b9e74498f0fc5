//! Progress messages emitted during sequence execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What lifecycle event a [`Message`] reports.
///
/// Sequence-level kinds carry no step index; step-level kinds do.
///
/// | Kind | Emitted |
/// |------|---------|
/// | `SequenceStarted` | once, before the first step |
/// | `SequenceStopped` | once, after a clean run |
/// | `SequenceStoppedWithError` | once, when a run aborts or fails |
/// | `StepStarted` | per step, before its script runs |
/// | `StepStopped` | per step, after a clean script run |
/// | `StepStoppedWithError` | per step, when its script fails |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Execution of a sequence has begun.
    SequenceStarted,
    /// A sequence finished without error.
    SequenceStopped,
    /// A sequence terminated because of an error or an abort.
    SequenceStoppedWithError,
    /// A step's script is about to run.
    StepStarted,
    /// A step's script completed cleanly.
    StepStopped,
    /// A step's script raised an error.
    StepStoppedWithError,
}

impl MessageKind {
    /// Returns `true` for the two error-reporting kinds.
    #[must_use]
    pub fn is_error(self) -> bool {
        matches!(
            self,
            Self::SequenceStoppedWithError | Self::StepStoppedWithError
        )
    }
}

/// One progress report from the executor to the observer.
///
/// Messages from a single executor are enqueued in program order; the
/// timestamp records when the event happened, not when the observer
/// received it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// What happened.
    pub kind: MessageKind,
    /// Human-readable description.
    pub text: String,
    /// When it happened.
    pub timestamp: DateTime<Utc>,
    /// Zero-based index of the step concerned, if any.
    pub step_index: Option<usize>,
}

impl Message {
    /// Creates a message stamped with the current time.
    #[must_use]
    pub fn new(kind: MessageKind, text: impl Into<String>, step_index: Option<usize>) -> Self {
        Self {
            kind,
            text: text.into(),
            timestamp: Utc::now(),
            step_index,
        }
    }

    /// Creates a sequence-level message (no step index).
    #[must_use]
    pub fn sequence(kind: MessageKind, text: impl Into<String>) -> Self {
        Self::new(kind, text, None)
    }

    /// Creates a step-level message for the given zero-based index.
    #[must_use]
    pub fn step(kind: MessageKind, text: impl Into<String>, index: usize) -> Self {
        Self::new(kind, text, Some(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kinds() {
        assert!(MessageKind::SequenceStoppedWithError.is_error());
        assert!(MessageKind::StepStoppedWithError.is_error());
        assert!(!MessageKind::SequenceStarted.is_error());
        assert!(!MessageKind::StepStopped.is_error());
    }

    #[test]
    fn step_constructor_carries_index() {
        let msg = Message::step(MessageKind::StepStarted, "Step started", 3);
        assert_eq!(msg.step_index, Some(3));
        assert_eq!(msg.kind, MessageKind::StepStarted);
        assert_eq!(msg.text, "Step started");
    }

    #[test]
    fn sequence_constructor_has_no_index() {
        let msg = Message::sequence(MessageKind::SequenceStarted, "go");
        assert_eq!(msg.step_index, None);
    }

    #[test]
    fn message_serde_roundtrip() {
        let msg = Message::step(MessageKind::StepStoppedWithError, "boom", 1);
        let json = serde_json::to_string(&msg).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }
}
