//! Sequence validation and sandboxed step execution.
//!
//! This crate is the core of opseq: it turns an ordered list of typed
//! [`Step`]s into a running program. Each step embeds a Lua fragment that
//! executes inside a fresh, restricted VM; control-flow step types
//! (`if`/`elseif`/`else`, `while`, `try`/`catch`, `end`) are interpreted
//! by the [`Executor`] against the boolean results those fragments
//! return.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │ Executor                                             │
//! │   instruction pointer + control stack                │
//! │   ┌────────────────────────────────────────────────┐ │
//! │   │ Sequence (validated: indentation + block rules)│ │
//! │   │   Step · Step · Step · …                       │ │
//! │   └────────────────────────────────────────────────┘ │
//! │        │ per step                                    │
//! │        ▼                                             │
//! │   ┌────────────────────────────────────────────────┐ │
//! │   │ fresh Lua VM (math/string/table/utf8 + base)   │ │
//! │   │   watchdog hook ── termination flag, deadline  │ │
//! │   │   sleep()       ── cancellable                 │ │
//! │   │   globals       ◄─► Context variables          │ │
//! │   └────────────────────────────────────────────────┘ │
//! └──────────────────────────────────────────────────────┘
//!          │ progress messages            ▲ cancel
//!          ▼                              │
//!     CommChannel (opseq-comm) ◄── external controller
//! ```
//!
//! # Example
//!
//! ```
//! use opseq_engine::{Context, Executor, Sequence, Step, StepType};
//! use opseq_types::{VariableName, VariableValue};
//!
//! let n = VariableName::new("n").unwrap();
//! let sign = VariableName::new("sign").unwrap();
//!
//! let mut sequence = Sequence::new("sign of n").unwrap();
//! sequence.add_step(
//!     Step::new(StepType::If)
//!         .with_script("return n > 0")
//!         .with_used_context_variable_names([n.clone()]),
//! );
//! sequence.add_step(
//!     Step::new(StepType::Action)
//!         .with_script("sign = 1")
//!         .with_used_context_variable_names([sign.clone()]),
//! );
//! sequence.add_step(Step::new(StepType::Else));
//! sequence.add_step(
//!     Step::new(StepType::Action)
//!         .with_script("sign = -1")
//!         .with_used_context_variable_names([sign.clone()]),
//! );
//! sequence.add_step(Step::new(StepType::End));
//!
//! let mut context = Context::new();
//! context.variables.set(n, VariableValue::Integer(5));
//!
//! Executor::new().run(&mut sequence, &mut context, None).unwrap();
//! assert_eq!(context.variables.get(&sign), Some(&VariableValue::Integer(1)));
//! ```
//!
//! # Cancellation and timeouts
//!
//! A watchdog hook runs every [`sandbox::HOOK_INSTRUCTION_INTERVAL`]
//! VM instructions (and on every executed line) and checks the
//! [`CommChannel`](opseq_comm::CommChannel) termination flag and the
//! per-step deadline. Either condition raises an abort error tagged with
//! [`ABORT_PREFIX`] that `catch` steps never intercept and that unwinds
//! the whole sequence.

mod context;
mod error;
mod executor;
mod runner;
pub mod sandbox;
mod sequence;
mod step;

pub use context::{Context, SandboxInitFn};
pub use error::{EngineError, ABORT_PREFIX};
pub use executor::{Executor, ERROR_MESSAGE_VARIABLE};
pub use runner::{RunOutcome, Runner};
pub use sequence::Sequence;
pub use step::{Step, StepType, VariableNames, MAX_INDENTATION_LEVEL, MAX_LABEL_LENGTH};

use opseq_comm::{CommChannel, Message};
use std::sync::Arc;

/// Sends a message if a channel is attached; a detached run skips it.
pub(crate) fn send_message(comm: Option<&Arc<CommChannel>>, message: Message) {
    if let Some(comm) = comm {
        comm.send(message);
    }
}
