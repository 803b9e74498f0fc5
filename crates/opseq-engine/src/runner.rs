//! Threaded execution of a sequence with an owned communication channel.
//!
//! A [`Runner`] moves a sequence and its context onto a worker thread and
//! hands the caller the observer side of a [`CommChannel`]:
//!
//! ```text
//! ┌────────────┐ spawn  ┌──────────────────────────┐
//! │  caller    │ ─────► │ worker thread            │
//! │            │        │   Executor::run(...)     │
//! │ cancel()   │ ─flag─► │                          │
//! │ try_recv() │ ◄─msgs─ │                          │
//! │ join()     │ ◄────── │ (sequence, context, res) │
//! └────────────┘        └──────────────────────────┘
//! ```
//!
//! One runner executes exactly one sequence; [`Runner::join`] consumes
//! the runner and returns ownership of the sequence and context together
//! with the execution result.

use crate::context::Context;
use crate::error::EngineError;
use crate::executor::Executor;
use crate::sequence::Sequence;
use opseq_comm::{CommChannel, Message};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Everything a finished run hands back to the caller.
#[derive(Debug)]
pub struct RunOutcome {
    /// The executed sequence, with updated step timestamps.
    pub sequence: Sequence,
    /// The context, with variables as the last step left them.
    pub context: Context,
    /// The execution result.
    pub result: Result<(), EngineError>,
}

/// Runs one sequence on a worker thread.
///
/// # Example
///
/// ```
/// use opseq_engine::{Context, Runner, Sequence, Step, StepType};
///
/// let mut sequence = Sequence::new("demo").unwrap();
/// sequence.add_step(Step::new(StepType::Action).with_script("sleep(0.01)"));
///
/// let runner = Runner::spawn(sequence, Context::new(), 64);
/// let outcome = runner.join();
/// assert!(outcome.result.is_ok());
/// ```
#[derive(Debug)]
pub struct Runner {
    channel: Arc<CommChannel>,
    handle: Option<JoinHandle<(Sequence, Context, Result<(), EngineError>)>>,
}

impl Runner {
    /// Starts executing `sequence` on a new worker thread.
    ///
    /// `capacity` bounds the progress-message queue; once full, the
    /// oldest unread message is dropped.
    #[must_use]
    pub fn spawn(sequence: Sequence, context: Context, capacity: usize) -> Self {
        let channel = Arc::new(CommChannel::new(capacity));
        let worker_channel = Arc::clone(&channel);

        let handle = std::thread::spawn(move || {
            let mut sequence = sequence;
            let mut context = context;
            let result = Executor::new().run(&mut sequence, &mut context, Some(&worker_channel));
            (sequence, context, result)
        });

        tracing::debug!("runner spawned");
        Self {
            channel,
            handle: Some(handle),
        }
    }

    /// Requests cooperative termination of the running sequence.
    ///
    /// Idempotent; the worker observes the request at its next watchdog
    /// tick and unwinds with an abort error.
    pub fn cancel(&self) {
        self.channel.request_termination();
    }

    /// Returns `true` while the worker thread is still executing.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Removes and returns the oldest pending progress message, if any.
    #[must_use]
    pub fn try_recv_message(&self) -> Option<Message> {
        self.channel.try_recv()
    }

    /// Returns a handle to the underlying channel, e.g. for a dedicated
    /// observer thread.
    #[must_use]
    pub fn channel(&self) -> Arc<CommChannel> {
        Arc::clone(&self.channel)
    }

    /// Waits for the worker to finish and returns the outcome.
    ///
    /// Progress messages that were never read remain available on the
    /// channel handle returned by [`channel`](Self::channel).
    ///
    /// # Panics
    ///
    /// Re-raises a panic from the worker thread, which can only stem
    /// from a bug in the engine itself.
    #[must_use]
    pub fn join(mut self) -> RunOutcome {
        let handle = self.handle.take().expect("join consumes the only handle");
        match handle.join() {
            Ok((sequence, context, result)) => RunOutcome {
                sequence,
                context,
                result,
            },
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

impl Drop for Runner {
    /// Cancels and detaches cleanly if the runner is dropped mid-run.
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.channel.request_termination();
            let _ = handle.join();
        }
    }
}
