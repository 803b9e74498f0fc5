//! Sandboxed Lua VM construction and the execution watchdog.
//!
//! Every step runs inside a fresh VM opened with a restricted library
//! subset. Two supervision mechanisms are wired into the VM before the
//! step script loads:
//!
//! - a **watchdog hook** firing every [`HOOK_INSTRUCTION_INTERVAL`]
//!   instructions and on every executed line, which polls the external
//!   termination flag and the step deadline;
//! - a custom **`sleep(seconds)`** global that polls the same conditions
//!   in ≤10 ms slices, so a sleeping script stays cancellable.
//!
//! Watchdog state travels in an [`Arc`] captured by both closures. The
//! hook never consults VM-global state, so there is no registry key that
//! could go missing mid-run.

use crate::error::ABORT_PREFIX;
use mlua::{HookTriggers, Lua, LuaOptions, StdLib, VmState};
use opseq_comm::CommChannel;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The watchdog hook fires every this many VM instructions.
pub const HOOK_INSTRUCTION_INTERVAL: u32 = 100;

/// Maximum time `sleep()` stays blocked between watchdog polls.
const SLEEP_POLL_SLICE: Duration = Duration::from_millis(10);

/// Globals removed from the sandbox after the library subset is opened.
///
/// File access, dynamic code loading, module loading, console output, and
/// collector controls are all withheld from step scripts.
const FORBIDDEN_GLOBALS: [&str; 7] = [
    "collectgarbage",
    "debug",
    "dofile",
    "load",
    "loadfile",
    "print",
    "require",
];

/// Shared supervision state for one step execution.
///
/// Once a condition trips, the abort message is latched: every later
/// check fails with the same message, so the script cannot outrun the
/// watchdog by absorbing a single error in a `pcall`.
#[derive(Debug)]
pub(crate) struct Watchdog {
    comm: Option<Arc<CommChannel>>,
    deadline: Option<Instant>,
    timeout_secs: f64,
    tripped: Mutex<Option<String>>,
}

impl Watchdog {
    /// Creates supervision state for a step that started at `started`.
    ///
    /// `timeout` of `None` disables the deadline; a deadline that would
    /// overflow the clock is treated the same way.
    pub(crate) fn new(
        timeout: Option<Duration>,
        comm: Option<Arc<CommChannel>>,
        started: Instant,
    ) -> Self {
        Self {
            comm,
            deadline: timeout.and_then(|t| started.checked_add(t)),
            timeout_secs: timeout.map_or(0.0, |t| t.as_secs_f64()),
            tripped: Mutex::new(None),
        }
    }

    /// Polls the termination flag and the deadline.
    ///
    /// Returns the abort message once either condition has tripped; the
    /// first trip latches.
    pub(crate) fn check(&self) -> Result<(), String> {
        let mut tripped = self.tripped.lock();
        if let Some(message) = tripped.as_ref() {
            return Err(message.clone());
        }
        if let Some(comm) = &self.comm {
            if comm.is_termination_requested() {
                let message = format!("{ABORT_PREFIX}Step aborted on user request");
                *tripped = Some(message.clone());
                return Err(message);
            }
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() > deadline {
                let message = format!(
                    "{ABORT_PREFIX}Timeout: Script took more than {} s to run",
                    self.timeout_secs
                );
                *tripped = Some(message.clone());
                return Err(message);
            }
        }
        Ok(())
    }

    /// Returns the latched abort message, if the watchdog tripped.
    pub(crate) fn abort_message(&self) -> Option<String> {
        self.tripped.lock().clone()
    }
}

/// Creates a fresh VM with the safe library subset.
///
/// Opens base, math, string, table, and utf8, then nils out the
/// [`FORBIDDEN_GLOBALS`].
pub(crate) fn create_sandbox() -> mlua::Result<Lua> {
    let lua = Lua::new_with(
        StdLib::MATH | StdLib::STRING | StdLib::TABLE | StdLib::UTF8,
        LuaOptions::default(),
    )?;
    let globals = lua.globals();
    for name in FORBIDDEN_GLOBALS {
        globals.set(name, mlua::Value::Nil)?;
    }
    Ok(lua)
}

/// Registers the `sleep(seconds)` global.
///
/// The implementation busy-polls the watchdog in [`SLEEP_POLL_SLICE`]
/// slices until the requested interval elapses, so termination and
/// timeout are honoured mid-sleep. Negative and non-finite arguments
/// sleep for zero time.
pub(crate) fn install_sleep(lua: &Lua, watchdog: &Arc<Watchdog>) -> mlua::Result<()> {
    let watchdog = Arc::clone(watchdog);
    let sleep_fn = lua.create_function(move |_, seconds: f64| {
        let requested = Duration::try_from_secs_f64(seconds).unwrap_or(Duration::ZERO);
        let started = Instant::now();
        loop {
            if let Err(message) = watchdog.check() {
                return Err(mlua::Error::RuntimeError(message));
            }
            let elapsed = started.elapsed();
            if elapsed >= requested {
                return Ok(());
            }
            std::thread::sleep((requested - elapsed).min(SLEEP_POLL_SLICE));
        }
    })?;
    lua.globals().set("sleep", sleep_fn)
}

/// Installs the watchdog hook on the VM.
///
/// The hook fires every [`HOOK_INSTRUCTION_INTERVAL`] instructions and on
/// every executed line. The line trigger keeps a latched abort re-firing
/// on the very next line, so a `pcall` that swallows the first abort
/// error cannot make further progress.
pub(crate) fn install_watchdog_hook(lua: &Lua, watchdog: &Arc<Watchdog>) {
    let watchdog = Arc::clone(watchdog);
    lua.set_hook(
        HookTriggers::new()
            .every_nth_instruction(HOOK_INSTRUCTION_INTERVAL)
            .every_line(),
        move |_lua, _debug| match watchdog.check() {
            Ok(()) => Ok(VmState::Continue),
            Err(message) => Err(mlua::Error::RuntimeError(message)),
        },
    );
}

/// Extracts the innermost human-readable message from an `mlua` error.
pub(crate) fn flatten_lua_error(err: &mlua::Error) -> String {
    match err {
        mlua::Error::RuntimeError(message) => message.clone(),
        mlua::Error::CallbackError { cause, .. } => flatten_lua_error(cause),
        mlua::Error::SyntaxError { message, .. } => format!("syntax error: {message}"),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_watchdog() -> Arc<Watchdog> {
        Arc::new(Watchdog::new(None, None, Instant::now()))
    }

    // ── Library restriction ──────────────────────────────────────

    #[test]
    fn safe_libraries_are_available() {
        let lua = create_sandbox().expect("create sandbox");
        let ok: bool = lua
            .load(
                r#"
                return type(math.sqrt) == "function"
                   and type(string.rep) == "function"
                   and type(table.insert) == "function"
                   and type(utf8.char) == "function"
                   and type(pcall) == "function"
                "#,
            )
            .eval()
            .expect("eval");
        assert!(ok);
    }

    #[test]
    fn forbidden_globals_are_nil() {
        let lua = create_sandbox().expect("create sandbox");
        for name in FORBIDDEN_GLOBALS {
            let rendered: String = lua
                .load(format!("return type({name})"))
                .eval()
                .expect("eval");
            assert_eq!(rendered, "nil", "{name} should be removed");
        }
    }

    #[test]
    fn io_and_os_are_not_opened() {
        let lua = create_sandbox().expect("create sandbox");
        let ok: bool = lua
            .load("return io == nil and os == nil")
            .eval()
            .expect("eval");
        assert!(ok);
    }

    // ── Watchdog ─────────────────────────────────────────────────

    #[test]
    fn watchdog_without_conditions_never_trips() {
        let watchdog = no_watchdog();
        assert!(watchdog.check().is_ok());
        assert!(watchdog.abort_message().is_none());
    }

    #[test]
    fn watchdog_trips_on_expired_deadline() {
        let watchdog = Watchdog::new(
            Some(Duration::from_millis(1)),
            None,
            Instant::now() - Duration::from_millis(50),
        );
        let err = watchdog.check().unwrap_err();
        assert!(err.starts_with(ABORT_PREFIX));
        assert!(err.contains("Timeout"));
        assert!(err.contains("0.001"));
    }

    #[test]
    fn watchdog_trips_on_termination_request() {
        let comm = Arc::new(CommChannel::default());
        let watchdog = Watchdog::new(None, Some(Arc::clone(&comm)), Instant::now());
        assert!(watchdog.check().is_ok());

        comm.request_termination();
        let err = watchdog.check().unwrap_err();
        assert_eq!(err, format!("{ABORT_PREFIX}Step aborted on user request"));
    }

    #[test]
    fn watchdog_latches_first_trip() {
        let comm = Arc::new(CommChannel::default());
        let watchdog = Watchdog::new(
            Some(Duration::ZERO),
            Some(Arc::clone(&comm)),
            Instant::now() - Duration::from_secs(1),
        );

        let first = watchdog.check().unwrap_err();
        // The later termination request does not change the latched text.
        comm.request_termination();
        let second = watchdog.check().unwrap_err();
        assert_eq!(first, second);
        assert_eq!(watchdog.abort_message(), Some(first));
    }

    // ── Hook and sleep ───────────────────────────────────────────

    #[test]
    fn hook_aborts_infinite_loop_on_deadline() {
        let lua = create_sandbox().expect("create sandbox");
        let watchdog = Arc::new(Watchdog::new(
            Some(Duration::from_millis(20)),
            None,
            Instant::now(),
        ));
        install_watchdog_hook(&lua, &watchdog);

        let result = lua.load("while true do end").exec();
        let err = result.expect_err("loop must be aborted");
        assert!(flatten_lua_error(&err).contains("Timeout"));
        assert!(watchdog.abort_message().is_some());
    }

    #[test]
    fn hook_abort_survives_pcall() {
        let lua = create_sandbox().expect("create sandbox");
        let watchdog = Arc::new(Watchdog::new(
            Some(Duration::from_millis(20)),
            None,
            Instant::now(),
        ));
        install_watchdog_hook(&lua, &watchdog);

        let result = lua
            .load(
                r#"
                while true do
                    pcall(function()
                        while true do end
                    end)
                end
                "#,
            )
            .exec();
        assert!(result.is_err(), "pcall must not absorb the abort");
    }

    #[test]
    fn sleep_completes_when_unsupervised() {
        let lua = create_sandbox().expect("create sandbox");
        install_sleep(&lua, &no_watchdog()).expect("install sleep");

        let started = Instant::now();
        lua.load("sleep(0.02)").exec().expect("sleep");
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn sleep_is_interrupted_by_termination() {
        let lua = create_sandbox().expect("create sandbox");
        let comm = Arc::new(CommChannel::default());
        let watchdog = Arc::new(Watchdog::new(None, Some(Arc::clone(&comm)), Instant::now()));
        install_sleep(&lua, &watchdog).expect("install sleep");

        let canceller = Arc::clone(&comm);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            canceller.request_termination();
        });

        let started = Instant::now();
        let result = lua.load("sleep(10)").exec();
        handle.join().expect("canceller thread");

        let err = result.expect_err("sleep must be interrupted");
        assert!(flatten_lua_error(&err).contains("user request"));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn sleep_accepts_pathological_arguments() {
        let lua = create_sandbox().expect("create sandbox");
        install_sleep(&lua, &no_watchdog()).expect("install sleep");
        lua.load("sleep(-1) sleep(0)").exec().expect("no-op sleeps");
    }

    #[test]
    fn flatten_unwraps_callback_chains() {
        let inner = mlua::Error::RuntimeError("innermost".to_string());
        let outer = mlua::Error::CallbackError {
            traceback: String::new(),
            cause: Arc::new(inner),
        };
        assert_eq!(flatten_lua_error(&outer), "innermost");
    }
}
