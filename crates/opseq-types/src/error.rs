//! Unified error interface for opseq.
//!
//! Every public error enum in the workspace implements [`ErrorCode`] so
//! callers can branch on stable machine-readable codes instead of matching
//! display strings.
//!
//! # Example
//!
//! ```
//! use opseq_types::ErrorCode;
//!
//! #[derive(Debug)]
//! enum MyError {
//!     Timeout,
//!     BadInput(String),
//! }
//!
//! impl ErrorCode for MyError {
//!     fn code(&self) -> &'static str {
//!         match self {
//!             Self::Timeout => "MY_TIMEOUT",
//!             Self::BadInput(_) => "MY_BAD_INPUT",
//!         }
//!     }
//!
//!     fn is_recoverable(&self) -> bool {
//!         matches!(self, Self::Timeout)
//!     }
//! }
//!
//! assert_eq!(MyError::Timeout.code(), "MY_TIMEOUT");
//! ```

/// Machine-readable error classification.
///
/// # Code format
///
/// - `UPPER_SNAKE_CASE`
/// - Prefixed with the owning domain (e.g. `ENGINE_`, `COMM_`)
/// - Stable once published; changing a code is a breaking change
///
/// # Recoverability
///
/// An error is recoverable when retrying after a user-visible fix can
/// succeed (a script error the author can correct). It is not recoverable
/// when the condition is deliberate (an abort) or indicates a caller bug
/// (an invalid argument).
pub trait ErrorCode {
    /// Returns the stable machine-readable code for this error.
    fn code(&self) -> &'static str;

    /// Returns whether retrying after corrective action can succeed.
    fn is_recoverable(&self) -> bool;
}
