//! Typed steps and the single-step execution procedure.
//!
//! A [`Step`] is one instruction of a sequence: a type, a Lua fragment,
//! the set of context variables the fragment touches, and a per-step
//! timeout. [`Step::execute`] runs the fragment inside a fresh sandbox
//! (see [`crate::sandbox`]), marshalling declared variables in and out
//! and translating sandbox failures into [`EngineError`]s.

use crate::context::Context;
use crate::error::{EngineError, ABORT_PREFIX};
use crate::sandbox::{self, Watchdog};
use chrono::{DateTime, Utc};
use mlua::{Lua, Value};
use opseq_comm::{CommChannel, Message, MessageKind};
use opseq_types::{VariableName, VariableValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The set of context variable names a step declares.
pub type VariableNames = BTreeSet<VariableName>;

/// Maximum nesting depth a sequence may reach.
pub const MAX_INDENTATION_LEVEL: u16 = 16;

/// Maximum length of a step or sequence label, in UTF-8 code units.
pub const MAX_LABEL_LENGTH: usize = 128;

/// The type of a [`Step`], which determines how the executor interprets
/// its boolean result.
///
/// | Type | Role |
/// |------|------|
/// | `Action` | run the script, discard the result |
/// | `If` / `ElseIf` / `Else` | conditional chain |
/// | `While` | loop header |
/// | `Try` / `Catch` | error handler block |
/// | `End` | closes the innermost `If`/`While`/`Try` block |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    /// Plain script execution.
    Action,
    /// Conditional block opener.
    If,
    /// Additional branch of an `If` chain.
    ElseIf,
    /// Default branch of an `If` chain.
    Else,
    /// Loop block opener.
    While,
    /// Error-handler block opener.
    Try,
    /// Handler branch of a `Try` block.
    Catch,
    /// Block terminator.
    End,
}

impl StepType {
    /// Returns a lowercase keyword for diagnostics.
    #[must_use]
    pub fn keyword(self) -> &'static str {
        match self {
            Self::Action => "action",
            Self::If => "if",
            Self::ElseIf => "elseif",
            Self::Else => "else",
            Self::While => "while",
            Self::Try => "try",
            Self::Catch => "catch",
            Self::End => "end",
        }
    }
}

/// One typed instruction with an embedded script fragment.
///
/// # Example
///
/// ```
/// use opseq_engine::{Context, Step, StepType};
/// use opseq_types::{VariableName, VariableValue};
///
/// let mut step = Step::new(StepType::Action)
///     .with_script("x = x + 1")
///     .with_used_context_variable_names([VariableName::new("x").unwrap()]);
///
/// let mut context = Context::new();
/// context.variables.set(VariableName::new("x").unwrap(), 41i64);
///
/// step.execute(&mut context, None, 0).unwrap();
/// assert_eq!(
///     context.variables.get_str("x"),
///     Some(&VariableValue::Integer(42)),
/// );
/// ```
#[derive(Debug, Clone)]
pub struct Step {
    step_type: StepType,
    label: String,
    script: String,
    used_context_variables: VariableNames,
    timeout: Option<Duration>,
    indentation_level: u16,
    time_of_last_modification: DateTime<Utc>,
    time_of_last_execution: Option<DateTime<Utc>>,
}

impl Step {
    /// Creates a step of the given type with an empty script, an empty
    /// label, and no timeout.
    #[must_use]
    pub fn new(step_type: StepType) -> Self {
        Self {
            step_type,
            label: String::new(),
            script: String::new(),
            used_context_variables: VariableNames::new(),
            timeout: None,
            indentation_level: 0,
            time_of_last_modification: Utc::now(),
            time_of_last_execution: None,
        }
    }

    /// Builder form of [`set_script`](Self::set_script).
    #[must_use]
    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.set_script(script);
        self
    }

    /// Builder form of [`set_used_context_variable_names`](Self::set_used_context_variable_names).
    #[must_use]
    pub fn with_used_context_variable_names(
        mut self,
        names: impl IntoIterator<Item = VariableName>,
    ) -> Self {
        self.set_used_context_variable_names(names);
        self
    }

    /// Builder form of [`set_timeout`](Self::set_timeout).
    #[must_use]
    pub fn with_timeout(mut self, timeout: chrono::Duration) -> Self {
        self.set_timeout(Some(timeout));
        self
    }

    /// Returns the step type.
    #[must_use]
    pub fn step_type(&self) -> StepType {
        self.step_type
    }

    /// Returns the human-readable label.
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Returns the script source.
    #[must_use]
    pub fn script(&self) -> &str {
        &self.script
    }

    /// Returns the declared context variable names.
    #[must_use]
    pub fn used_context_variable_names(&self) -> &VariableNames {
        &self.used_context_variables
    }

    /// Returns the per-step timeout, or `None` if no deadline applies.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Returns the nesting depth assigned by the owning sequence.
    #[must_use]
    pub fn indentation_level(&self) -> u16 {
        self.indentation_level
    }

    /// Returns when a mutator last touched this step.
    #[must_use]
    pub fn time_of_last_modification(&self) -> DateTime<Utc> {
        self.time_of_last_modification
    }

    /// Returns when this step last executed, if ever.
    #[must_use]
    pub fn time_of_last_execution(&self) -> Option<DateTime<Utc>> {
        self.time_of_last_execution
    }

    /// Changes the step type and stamps the modification time.
    pub fn set_type(&mut self, step_type: StepType) {
        self.step_type = step_type;
        self.time_of_last_modification = Utc::now();
    }

    /// Changes the label and stamps the modification time.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidArgument`] if the label exceeds
    /// [`MAX_LABEL_LENGTH`] UTF-8 code units.
    pub fn set_label(&mut self, label: impl Into<String>) -> Result<(), EngineError> {
        let label = label.into();
        if label.len() > MAX_LABEL_LENGTH {
            return Err(EngineError::InvalidArgument(format!(
                "step label exceeds {MAX_LABEL_LENGTH} bytes ({} given)",
                label.len()
            )));
        }
        self.label = label;
        self.time_of_last_modification = Utc::now();
        Ok(())
    }

    /// Changes the script and stamps the modification time.
    pub fn set_script(&mut self, script: impl Into<String>) {
        self.script = script.into();
        self.time_of_last_modification = Utc::now();
    }

    /// Declares the context variables the script reads or writes.
    pub fn set_used_context_variable_names(
        &mut self,
        names: impl IntoIterator<Item = VariableName>,
    ) {
        self.used_context_variables = names.into_iter().collect();
    }

    /// Sets the per-step timeout.
    ///
    /// `None` disables the deadline. A negative duration is clamped to
    /// zero, which makes the first watchdog tick abort the step.
    pub fn set_timeout(&mut self, timeout: Option<chrono::Duration>) {
        self.timeout = timeout.map(|t| t.to_std().unwrap_or(Duration::ZERO));
    }

    /// Assigns the nesting depth.
    ///
    /// Sequences call this from their indentation pass; callers should
    /// not set it directly.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidArgument`] if `level` exceeds
    /// [`MAX_INDENTATION_LEVEL`].
    pub fn set_indentation_level(&mut self, level: u16) -> Result<(), EngineError> {
        if level > MAX_INDENTATION_LEVEL {
            return Err(EngineError::InvalidArgument(format!(
                "indentation level exceeds maximum ({level} > {MAX_INDENTATION_LEVEL})"
            )));
        }
        self.indentation_level = level;
        Ok(())
    }

    /// Runs the step script inside a fresh sandbox.
    ///
    /// `index` is the zero-based position of this step in its sequence;
    /// messages and error texts use the 1-based form.
    ///
    /// Returns the script's logical result: `true` only if the script
    /// explicitly returned the boolean `true`. Clean completions without
    /// a boolean return report `false`.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Script`] if the script fails or the sandbox
    ///   cannot be prepared; a `StepStoppedWithError` message is emitted.
    /// - [`EngineError::Aborted`] if the watchdog tripped (termination
    ///   request or timeout); the message starts with `[ABORT] `.
    pub fn execute(
        &mut self,
        context: &mut Context,
        comm: Option<&Arc<CommChannel>>,
        index: usize,
    ) -> Result<bool, EngineError> {
        let started = Instant::now();
        self.time_of_last_execution = Some(Utc::now());

        crate::send_message(
            comm,
            Message::step(
                MessageKind::StepStarted,
                format!("Step {} started", index + 1),
                index,
            ),
        );
        tracing::debug!(step = index + 1, step_type = self.step_type.keyword(), "step started");

        match self.run_script(context, comm, index, started) {
            Ok(result) => {
                crate::send_message(
                    comm,
                    Message::step(
                        MessageKind::StepStopped,
                        format!("Step {} finished (logical result: {result})", index + 1),
                        index,
                    ),
                );
                Ok(result)
            }
            Err(err) => {
                crate::send_message(
                    comm,
                    Message::step(MessageKind::StepStoppedWithError, err.to_string(), index),
                );
                tracing::debug!(step = index + 1, error = %err, "step failed");
                Err(err)
            }
        }
    }

    /// Sandbox lifecycle for one run: create, restrict, supervise,
    /// marshal in, evaluate, marshal out.
    fn run_script(
        &self,
        context: &mut Context,
        comm: Option<&Arc<CommChannel>>,
        index: usize,
        started: Instant,
    ) -> Result<bool, EngineError> {
        let script_err = |err: &mlua::Error| EngineError::Script {
            step: index + 1,
            message: sandbox::flatten_lua_error(err),
        };

        let lua = sandbox::create_sandbox().map_err(|e| script_err(&e))?;
        let watchdog = Arc::new(Watchdog::new(self.timeout, comm.cloned(), started));

        sandbox::install_sleep(&lua, &watchdog).map_err(|e| script_err(&e))?;
        if let Some(init) = &context.sandbox_init {
            init(&lua).map_err(|e| script_err(&e))?;
        }
        sandbox::install_watchdog_hook(&lua, &watchdog);

        self.import_variables(&lua, context).map_err(|e| script_err(&e))?;

        let chunk_name = if self.label.is_empty() {
            format!("step {}", index + 1)
        } else {
            self.label.clone()
        };
        let evaluated = lua.load(&self.script).set_name(chunk_name).eval::<Value>();

        match evaluated {
            Ok(value) => {
                self.export_variables(&lua, context).map_err(|e| script_err(&e))?;
                Ok(matches!(value, Value::Boolean(true)))
            }
            Err(err) => {
                // The latched watchdog message is authoritative; the text
                // fallback covers scripts that forge the prefix themselves.
                if let Some(abort) = watchdog.abort_message() {
                    return Err(EngineError::Aborted(abort));
                }
                let message = sandbox::flatten_lua_error(&err);
                if message.contains(ABORT_PREFIX) {
                    return Err(EngineError::Aborted(message));
                }
                Err(EngineError::Script {
                    step: index + 1,
                    message,
                })
            }
        }
    }

    /// Copies declared variables from the context into sandbox globals.
    ///
    /// Names absent from the store are silently skipped.
    fn import_variables(&self, lua: &Lua, context: &Context) -> mlua::Result<()> {
        let globals = lua.globals();
        for name in &self.used_context_variables {
            let Some(value) = context.variables.get(name) else {
                continue;
            };
            match value {
                VariableValue::Integer(i) => globals.set(name.as_str(), *i)?,
                VariableValue::Double(d) => globals.set(name.as_str(), *d)?,
                VariableValue::Text(s) => globals.set(name.as_str(), s.as_str())?,
            }
        }
        Ok(())
    }

    /// Copies declared variables from sandbox globals back into the
    /// context.
    ///
    /// Integers and floats keep their distinct tags; strings export as
    /// text; every other sandbox type is ignored.
    fn export_variables(&self, lua: &Lua, context: &mut Context) -> mlua::Result<()> {
        let globals = lua.globals();
        for name in &self.used_context_variables {
            match globals.get::<Value>(name.as_str())? {
                Value::Integer(i) => {
                    context.variables.set(name.clone(), i);
                }
                Value::Number(n) => {
                    context.variables.set(name.clone(), n);
                }
                Value::String(s) => {
                    let text = s.to_str()?;
                    context.variables.set(name.clone(), &*text);
                }
                _ => {}
            }
        }
        Ok(())
    }
}
