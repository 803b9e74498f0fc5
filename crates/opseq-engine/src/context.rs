//! Execution context shared across the steps of one sequence run.

use mlua::Lua;
use opseq_types::VariableStore;
use std::fmt;
use std::sync::Arc;

/// Host callback invoked against every freshly created sandbox.
///
/// The sandbox is recreated for every step, so the callback runs once per
/// step and must be idempotent. It is the single place where the host can
/// register custom functions or globals before a step's script is loaded.
pub type SandboxInitFn = Arc<dyn Fn(&Lua) -> mlua::Result<()> + Send + Sync>;

/// The exchange store of typed variables between host and sandbox.
///
/// A `Context` owns the [`VariableStore`] that steps read from and write
/// back to, plus an optional [`SandboxInitFn`]. It lives across all steps
/// of a run; the sandbox does not.
///
/// # Example
///
/// ```
/// use opseq_engine::Context;
/// use opseq_types::{VariableName, VariableValue};
///
/// let mut context = Context::new();
/// context.variables.set(
///     VariableName::new("attempts").unwrap(),
///     VariableValue::Integer(0),
/// );
/// assert!(context.sandbox_init.is_none());
/// ```
#[derive(Clone, Default)]
pub struct Context {
    /// Variables marshalled into and out of step sandboxes.
    pub variables: VariableStore,
    /// Optional per-sandbox initialization callback.
    pub sandbox_init: Option<SandboxInitFn>,
}

impl Context {
    /// Creates an empty context with no init callback.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the sandbox initialization callback.
    pub fn set_sandbox_init(
        &mut self,
        init: impl Fn(&Lua) -> mlua::Result<()> + Send + Sync + 'static,
    ) {
        self.sandbox_init = Some(Arc::new(init));
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("variables", &self.variables)
            .field(
                "sandbox_init",
                &self.sandbox_init.as_ref().map(|_| "<callback>"),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opseq_types::{VariableName, VariableValue};

    #[test]
    fn default_context_is_empty() {
        let context = Context::new();
        assert!(context.variables.is_empty());
        assert!(context.sandbox_init.is_none());
    }

    #[test]
    fn set_sandbox_init_stores_callback() {
        let mut context = Context::new();
        context.set_sandbox_init(|lua| lua.globals().set("answer", 42));
        assert!(context.sandbox_init.is_some());

        let lua = Lua::new();
        (context.sandbox_init.as_ref().unwrap())(&lua).unwrap();
        let answer: i64 = lua.globals().get("answer").unwrap();
        assert_eq!(answer, 42);
    }

    #[test]
    fn debug_output_masks_callback() {
        let mut context = Context::new();
        context.variables.set(
            VariableName::new("x").unwrap(),
            VariableValue::Integer(1),
        );
        context.set_sandbox_init(|_| Ok(()));
        let rendered = format!("{context:?}");
        assert!(rendered.contains("<callback>"));
        assert!(!rendered.contains("sandbox_init: None"));
    }
}
