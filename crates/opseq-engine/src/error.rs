//! Error types for sequence validation and execution.

use opseq_types::ErrorCode;
use thiserror::Error;

/// Marker prefix carried by abort-class error messages.
///
/// Termination requests and timeouts raise errors tagged with this
/// prefix. A `catch` step never intercepts such an error, whether it is
/// recognised by its [`EngineError::Aborted`] variant or, for scripts
/// that fabricate the prefix themselves via `error("[ABORT] ...")`, by
/// the prefix alone.
pub const ABORT_PREFIX: &str = "[ABORT] ";

/// Errors raised by the opseq engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// A caller-supplied value violated a documented constraint
    /// (illegal label, indentation level out of range).
    #[error("{0}")]
    InvalidArgument(String),

    /// A sequence was executed while structurally invalid.
    ///
    /// Carries the indentation diagnostic recorded by the sequence.
    #[error("{0}")]
    PreconditionFailed(String),

    /// A step's script failed.
    ///
    /// `step` is the 1-based number of the offending step; `message` is
    /// the sandbox diagnostic.
    #[error("Error while executing script of step {step}: {message}")]
    Script {
        /// 1-based number of the failing step.
        step: usize,
        /// Diagnostic text from the sandbox.
        message: String,
    },

    /// Execution was aborted by a termination request or a timeout.
    ///
    /// The message starts with [`ABORT_PREFIX`].
    #[error("{0}")]
    Aborted(String),
}

impl EngineError {
    /// Returns `true` for abort-class errors.
    ///
    /// An error is abort-class if it is the [`Aborted`](Self::Aborted)
    /// variant, or if its message carries the [`ABORT_PREFIX`] marker
    /// (the wire-compatible fallback for scripts that inspect or forge
    /// error text).
    #[must_use]
    pub fn is_abort(&self) -> bool {
        match self {
            Self::Aborted(_) => true,
            Self::Script { message, .. } => message.contains(ABORT_PREFIX),
            _ => false,
        }
    }
}

impl ErrorCode for EngineError {
    fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "ENGINE_INVALID_ARGUMENT",
            Self::PreconditionFailed(_) => "ENGINE_PRECONDITION_FAILED",
            Self::Script { .. } => "ENGINE_SCRIPT",
            Self::Aborted(_) => "ENGINE_ABORTED",
        }
    }

    fn is_recoverable(&self) -> bool {
        // A script error can be fixed by the sequence author and rerun;
        // the other kinds need a code or policy change.
        matches!(self, Self::Script { .. })
    }
}
