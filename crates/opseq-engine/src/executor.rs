//! Interpretation of a validated sequence as control flow.
//!
//! The executor consumes the step list with an instruction pointer and a
//! small control stack. Block boundaries are located through the
//! indentation levels the sequence assigned during validation: from any
//! block header, the next step at the same level is that block's
//! `elseif`/`else`/`catch`/`end`.
//!
//! # Error routing
//!
//! ```text
//!           step error
//!               │
//!       ┌───────┴────────┐
//!       │ abort-class?   │── yes ──► unwind everything, re-raise
//!       └───────┬────────┘
//!               │ no
//!       ┌───────┴────────┐
//!       │ open try frame?│── yes ──► ERROR_MESSAGE := diagnostic,
//!       └───────┬────────┘           jump into catch body
//!               │ no
//!               ▼
//!        re-raise to caller
//! ```

use crate::context::Context;
use crate::error::EngineError;
use crate::sequence::Sequence;
use crate::step::StepType;
use opseq_comm::{CommChannel, Message, MessageKind};
use opseq_types::VariableName;
use std::sync::Arc;

/// Name of the context variable that carries the diagnostic of a caught
/// error into the `catch` body.
pub const ERROR_MESSAGE_VARIABLE: &str = "ERROR_MESSAGE";

/// One entry of the control stack.
#[derive(Debug)]
enum Frame {
    /// A taken branch of an `if` chain.
    If,
    /// A running `while` loop; `end` jumps back to the header.
    While { header_ip: usize },
    /// An entered `try` block; `catching` is set once an error was
    /// routed into the catch body.
    Try {
        catch_ip: usize,
        end_ip: usize,
        catching: bool,
    },
}

/// What a supervised step execution produced.
enum Flow {
    /// The script's logical result.
    Value(bool),
    /// The script failed, an enclosing `try` caught it; resume here.
    Caught(usize),
}

/// Interprets a validated [`Sequence`] as control flow over the step
/// stream.
///
/// # Example
///
/// ```
/// use opseq_engine::{Context, Executor, Sequence, Step, StepType};
/// use opseq_types::{VariableName, VariableValue};
///
/// let mut sequence = Sequence::new("count to three").unwrap();
/// let i = VariableName::new("i").unwrap();
/// sequence.add_step(
///     Step::new(StepType::Action)
///         .with_script("i = 0")
///         .with_used_context_variable_names([i.clone()]),
/// );
/// sequence.add_step(
///     Step::new(StepType::While)
///         .with_script("return i < 3")
///         .with_used_context_variable_names([i.clone()]),
/// );
/// sequence.add_step(
///     Step::new(StepType::Action)
///         .with_script("i = i + 1")
///         .with_used_context_variable_names([i.clone()]),
/// );
/// sequence.add_step(Step::new(StepType::End));
///
/// let mut context = Context::new();
/// Executor::new().run(&mut sequence, &mut context, None).unwrap();
/// assert_eq!(context.variables.get(&i), Some(&VariableValue::Integer(3)));
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct Executor;

impl Executor {
    /// Creates an executor.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Runs the sequence to completion against the given context.
    ///
    /// Emits `SequenceStarted` on entry and `SequenceStopped` or
    /// `SequenceStoppedWithError` on exit; per-step messages come from
    /// [`crate::Step::execute`].
    ///
    /// # Errors
    ///
    /// - [`EngineError::PreconditionFailed`] if the sequence fails
    ///   [`Sequence::check_correctness_of_steps`]; nothing runs and no
    ///   message is emitted.
    /// - [`EngineError::Aborted`] if a termination request or a timeout
    ///   unwound the run.
    /// - [`EngineError::Script`] for a step error no `catch` handled.
    pub fn run(
        &self,
        sequence: &mut Sequence,
        context: &mut Context,
        comm: Option<&Arc<CommChannel>>,
    ) -> Result<(), EngineError> {
        sequence.check_correctness_of_steps()?;

        tracing::info!(sequence = %sequence.label(), steps = sequence.len(), "sequence started");
        crate::send_message(
            comm,
            Message::sequence(
                MessageKind::SequenceStarted,
                format!("Sequence '{}' started", sequence.label()),
            ),
        );

        let result = self.run_steps(sequence, context, comm);

        match &result {
            Ok(()) => {
                tracing::info!(sequence = %sequence.label(), "sequence finished");
                crate::send_message(
                    comm,
                    Message::sequence(
                        MessageKind::SequenceStopped,
                        format!("Sequence '{}' finished", sequence.label()),
                    ),
                );
            }
            Err(err) => {
                tracing::warn!(sequence = %sequence.label(), error = %err, "sequence stopped");
                crate::send_message(
                    comm,
                    Message::sequence(MessageKind::SequenceStoppedWithError, err.to_string()),
                );
            }
        }
        result
    }

    fn run_steps(
        &self,
        sequence: &mut Sequence,
        context: &mut Context,
        comm: Option<&Arc<CommChannel>>,
    ) -> Result<(), EngineError> {
        let mut ip = 0usize;
        let mut frames: Vec<Frame> = Vec::new();

        'program: while ip < sequence.len() {
            let step_type = sequence[ip].step_type();
            let level = sequence[ip].indentation_level();

            match step_type {
                StepType::Action => match self.run_supervised(sequence, context, comm, ip, &mut frames)? {
                    Flow::Caught(resume) => ip = resume,
                    Flow::Value(_) => ip += 1,
                },

                StepType::If => {
                    // Walk the chain until a branch is taken or it is
                    // exhausted. The chain itself pushes no frame while
                    // scanning, so an error in any header unwinds
                    // exactly like an error in a body step.
                    let mut cursor = ip;
                    let mut flow = self.run_supervised(sequence, context, comm, cursor, &mut frames)?;
                    loop {
                        match flow {
                            Flow::Caught(resume) => {
                                ip = resume;
                                continue 'program;
                            }
                            Flow::Value(true) => {
                                frames.push(Frame::If);
                                ip = cursor + 1;
                                continue 'program;
                            }
                            Flow::Value(false) => {
                                let next = next_at_level(sequence, cursor, level, ip)?;
                                match sequence[next].step_type() {
                                    StepType::ElseIf => {
                                        cursor = next;
                                        flow = self.run_supervised(
                                            sequence, context, comm, cursor, &mut frames,
                                        )?;
                                    }
                                    StepType::Else => {
                                        frames.push(Frame::If);
                                        ip = next + 1;
                                        continue 'program;
                                    }
                                    StepType::End => {
                                        ip = next + 1;
                                        continue 'program;
                                    }
                                    _ => return Err(structure_error(ip)),
                                }
                            }
                        }
                    }
                }

                // Reached by fall-through after a taken branch: the rest
                // of the chain is skipped up to its `end`.
                StepType::ElseIf | StepType::Else => {
                    ip = find_matching_end(sequence, ip, level)?;
                }

                StepType::While => match self.run_supervised(sequence, context, comm, ip, &mut frames)? {
                    Flow::Caught(resume) => ip = resume,
                    Flow::Value(true) => {
                        frames.push(Frame::While { header_ip: ip });
                        ip += 1;
                    }
                    Flow::Value(false) => {
                        ip = find_matching_end(sequence, ip, level)? + 1;
                    }
                },

                StepType::Try => {
                    let catch_ip = next_at_level(sequence, ip, level, ip)?;
                    let end_ip = next_at_level(sequence, catch_ip, level, ip)?;
                    frames.push(Frame::Try {
                        catch_ip,
                        end_ip,
                        catching: false,
                    });
                    ip += 1;
                }

                // Reached by fall-through: the try body completed without
                // an error, so the handler is skipped entirely.
                StepType::Catch => match frames.pop() {
                    Some(Frame::Try { end_ip, .. }) => ip = end_ip + 1,
                    _ => return Err(structure_error(ip)),
                },

                StepType::End => match frames.pop() {
                    Some(Frame::While { header_ip }) => ip = header_ip,
                    Some(Frame::If | Frame::Try { .. }) => ip += 1,
                    None => return Err(structure_error(ip)),
                },
            }
        }

        Ok(())
    }

    /// Executes the step at `ip`, routing non-abort errors into the
    /// innermost open `try` frame.
    fn run_supervised(
        &self,
        sequence: &mut Sequence,
        context: &mut Context,
        comm: Option<&Arc<CommChannel>>,
        ip: usize,
        frames: &mut Vec<Frame>,
    ) -> Result<Flow, EngineError> {
        match sequence.step_mut(ip).execute(context, comm, ip) {
            Ok(value) => Ok(Flow::Value(value)),
            Err(err) if err.is_abort() => Err(err),
            Err(err) => match catch_in_frames(frames, context, &err) {
                Some(resume) => {
                    tracing::debug!(step = ip + 1, resume, "step error caught by try block");
                    Ok(Flow::Caught(resume))
                }
                None => Err(err),
            },
        }
    }
}

/// Routes an error into the innermost `try` frame that is not already
/// catching.
///
/// Pops every frame above it, publishes the diagnostic as the
/// [`ERROR_MESSAGE_VARIABLE`] context variable, marks the frame as
/// catching (so an error out of the catch body is not re-caught), and
/// returns the first instruction of the catch body.
fn catch_in_frames(
    frames: &mut Vec<Frame>,
    context: &mut Context,
    err: &EngineError,
) -> Option<usize> {
    let index = frames
        .iter()
        .rposition(|frame| matches!(frame, Frame::Try { catching: false, .. }))?;
    frames.truncate(index + 1);

    let Frame::Try { catch_ip, catching, .. } = &mut frames[index] else {
        return None;
    };
    *catching = true;

    let variable =
        VariableName::new(ERROR_MESSAGE_VARIABLE).expect("static identifier is valid");
    context.variables.set(variable, err.to_string());

    Some(*catch_ip + 1)
}

/// Finds the next step after `from` at exactly `level`.
///
/// For a validated sequence this is the matching `elseif`/`else`/
/// `catch`/`end` of the block opened at `from`.
fn next_at_level(
    sequence: &Sequence,
    from: usize,
    level: u16,
    reporting_ip: usize,
) -> Result<usize, EngineError> {
    sequence.steps()[from + 1..]
        .iter()
        .position(|step| step.indentation_level() == level)
        .map(|offset| from + 1 + offset)
        .ok_or_else(|| structure_error(reporting_ip))
}

/// Finds the `end` that closes the block containing `from` at `level`,
/// skipping over intervening same-level chain steps.
fn find_matching_end(
    sequence: &Sequence,
    from: usize,
    level: u16,
) -> Result<usize, EngineError> {
    let mut cursor = from;
    loop {
        cursor = next_at_level(sequence, cursor, level, from)?;
        if sequence[cursor].step_type() == StepType::End {
            return Ok(cursor);
        }
    }
}

/// Raised when navigation contradicts the validated structure, which can
/// only happen if the sequence changed between validation and execution.
fn structure_error(ip: usize) -> EngineError {
    EngineError::PreconditionFailed(format!(
        "block structure is inconsistent at step {}",
        ip + 1
    ))
}
