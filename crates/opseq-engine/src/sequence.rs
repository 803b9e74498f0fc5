//! Ordered step containers with structural validation.
//!
//! A [`Sequence`] owns its steps and keeps two pieces of derived state up
//! to date on every structural mutation: the indentation level of each
//! step and a block-structure diagnostic. The diagnostic is recorded
//! rather than thrown, since a sequence under construction may be
//! transiently invalid; [`Sequence::check_correctness_of_steps`] is the
//! gate that turns it into an error before execution.

use crate::error::EngineError;
use crate::step::{Step, StepType, MAX_INDENTATION_LEVEL, MAX_LABEL_LENGTH};
use std::ops::Index;

/// One open block during the indentation walk.
#[derive(Debug)]
enum OpenBlock {
    /// An `if` chain; `else_seen` closes it to further branches.
    If { else_seen: bool },
    /// A `while` loop.
    While,
    /// A `try` block; `catching` is set once its `catch` was seen.
    Try { catching: bool },
}

impl OpenBlock {
    fn keyword(&self) -> &'static str {
        match self {
            Self::If { .. } => "if",
            Self::While => "while",
            Self::Try { .. } => "try",
        }
    }
}

/// An ordered, structurally nested program of [`Step`]s.
///
/// # Example
///
/// ```
/// use opseq_engine::{Sequence, Step, StepType};
///
/// let mut sequence = Sequence::new("greet").unwrap();
/// sequence.add_step(Step::new(StepType::If).with_script("return true"));
/// sequence.add_step(Step::new(StepType::Action).with_script("x = 1"));
///
/// // The `if` block is still open:
/// assert!(sequence.indentation_error().is_some());
///
/// sequence.add_step(Step::new(StepType::End));
/// assert!(sequence.indentation_error().is_none());
/// assert_eq!(sequence[1].indentation_level(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct Sequence {
    label: String,
    steps: Vec<Step>,
    indentation_error: Option<String>,
}

impl Sequence {
    /// Creates an empty sequence with the given label.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidArgument`] if the label is empty or
    /// longer than [`MAX_LABEL_LENGTH`] UTF-8 code units.
    pub fn new(label: impl Into<String>) -> Result<Self, EngineError> {
        let label = label.into();
        if label.is_empty() {
            return Err(EngineError::InvalidArgument(
                "sequence label must not be empty".to_string(),
            ));
        }
        if label.len() > MAX_LABEL_LENGTH {
            return Err(EngineError::InvalidArgument(format!(
                "sequence label exceeds {MAX_LABEL_LENGTH} bytes ({} given)",
                label.len()
            )));
        }
        Ok(Self {
            label,
            steps: Vec::new(),
            indentation_error: None,
        })
    }

    /// Returns the sequence label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Returns the steps in execution order.
    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Returns the number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns `true` if the sequence contains no steps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Returns the current block-structure diagnostic, or `None` if the
    /// nesting is correct and complete.
    #[must_use]
    pub fn indentation_error(&self) -> Option<&str> {
        self.indentation_error.as_deref()
    }

    /// Appends a step and recomputes indentation and the diagnostic.
    ///
    /// Never fails: a transiently invalid structure is recorded in
    /// [`indentation_error`](Self::indentation_error) and rejected later
    /// by [`check_correctness_of_steps`](Self::check_correctness_of_steps).
    pub fn add_step(&mut self, step: Step) {
        self.steps.push(step);
        self.indent();
    }

    /// Verifies that the steps form a well-nested block structure.
    ///
    /// This is the gate the executor uses before running.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::PreconditionFailed`] carrying the recorded
    /// diagnostic if the structure is invalid.
    pub fn check_correctness_of_steps(&self) -> Result<(), EngineError> {
        match &self.indentation_error {
            None => Ok(()),
            Some(diagnostic) => Err(EngineError::PreconditionFailed(diagnostic.clone())),
        }
    }

    /// Mutable access for the executor; indentation stays untouched.
    pub(crate) fn step_mut(&mut self, index: usize) -> &mut Step {
        &mut self.steps[index]
    }

    /// Assigns indentation levels and recomputes the diagnostic.
    ///
    /// Walks the steps left to right over a stack of open blocks. On a
    /// rule violation the first diagnostic is kept, an approximate level
    /// is still assigned to every step, and the walk continues.
    fn indent(&mut self) {
        let mut stack: Vec<(OpenBlock, usize)> = Vec::new();
        let mut error: Option<String> = None;

        let mut record = |error: &mut Option<String>, message: String| {
            if error.is_none() {
                *error = Some(message);
            }
        };

        for index in 0..self.steps.len() {
            let step_type = self.steps[index].step_type();
            let depth = stack.len() as u16;
            let mut level = depth;

            match step_type {
                StepType::Action => {}
                StepType::If => {
                    stack.push((OpenBlock::If { else_seen: false }, index));
                }
                StepType::ElseIf => match stack.last() {
                    Some((OpenBlock::If { else_seen: false }, _)) => {
                        level = depth - 1;
                    }
                    Some((OpenBlock::If { else_seen: true }, _)) => {
                        record(
                            &mut error,
                            format!("step {}: 'elseif' after 'else'", index + 1),
                        );
                    }
                    _ => {
                        record(
                            &mut error,
                            format!("step {}: 'elseif' without matching 'if'", index + 1),
                        );
                    }
                },
                StepType::Else => match stack.last_mut() {
                    Some((OpenBlock::If { else_seen }, _)) if !*else_seen => {
                        *else_seen = true;
                        level = depth - 1;
                    }
                    Some((OpenBlock::If { .. }, _)) => {
                        record(
                            &mut error,
                            format!("step {}: duplicate 'else' in 'if' block", index + 1),
                        );
                    }
                    _ => {
                        record(
                            &mut error,
                            format!("step {}: 'else' without matching 'if'", index + 1),
                        );
                    }
                },
                StepType::While => {
                    stack.push((OpenBlock::While, index));
                }
                StepType::Try => {
                    stack.push((OpenBlock::Try { catching: false }, index));
                }
                StepType::Catch => match stack.last_mut() {
                    Some((OpenBlock::Try { catching }, _)) if !*catching => {
                        *catching = true;
                        level = depth - 1;
                    }
                    Some((OpenBlock::Try { .. }, _)) => {
                        record(
                            &mut error,
                            format!("step {}: duplicate 'catch' in 'try' block", index + 1),
                        );
                    }
                    _ => {
                        record(
                            &mut error,
                            format!("step {}: 'catch' without matching 'try'", index + 1),
                        );
                    }
                },
                StepType::End => match stack.pop() {
                    Some((OpenBlock::Try { catching: false }, opened_at)) => {
                        record(
                            &mut error,
                            format!(
                                "step {}: 'try' opened at step {} has no 'catch'",
                                index + 1,
                                opened_at + 1
                            ),
                        );
                        level = depth - 1;
                    }
                    Some(_) => {
                        level = depth - 1;
                    }
                    None => {
                        record(
                            &mut error,
                            format!("step {}: 'end' without open block", index + 1),
                        );
                    }
                },
            }

            if level > MAX_INDENTATION_LEVEL {
                record(
                    &mut error,
                    format!(
                        "step {}: nesting exceeds maximum depth of {MAX_INDENTATION_LEVEL}",
                        index + 1
                    ),
                );
                level = MAX_INDENTATION_LEVEL;
            }

            // Always within bounds after the clamp above.
            let _ = self.steps[index].set_indentation_level(level);
        }

        if let Some((block, opened_at)) = stack.last() {
            record(
                &mut error,
                format!(
                    "unterminated '{}' block opened at step {}",
                    block.keyword(),
                    opened_at + 1
                ),
            );
        }

        if let Some(diagnostic) = &error {
            tracing::debug!(sequence = %self.label, %diagnostic, "sequence structure invalid");
        }
        self.indentation_error = error;
    }
}

impl Index<usize> for Sequence {
    type Output = Step;

    fn index(&self, index: usize) -> &Step {
        &self.steps[index]
    }
}
