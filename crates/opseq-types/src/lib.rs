//! Core data types for the opseq sequence engine.
//!
//! This crate is the leaf of the opseq workspace: it defines the typed
//! variable exchange layer shared between the host and the sandboxed
//! scripts, plus the unified error-code interface implemented by every
//! opseq error type.
//!
//! # Variable exchange
//!
//! Exactly three value shapes cross the host/sandbox boundary:
//!
//! | Variant | Rust type | Sandbox type |
//! |---------|-----------|--------------|
//! | [`VariableValue::Integer`] | `i64` | Lua integer |
//! | [`VariableValue::Double`] | `f64` | Lua float |
//! | [`VariableValue::Text`] | `String` | Lua string |
//!
//! Anything else (tables, functions, booleans, nil) stays on its own side
//! of the boundary.
//!
//! # Example
//!
//! ```
//! use opseq_types::{VariableName, VariableStore, VariableValue};
//!
//! let mut store = VariableStore::new();
//! let name = VariableName::new("retries").unwrap();
//! store.set(name.clone(), VariableValue::Integer(3));
//!
//! assert_eq!(store.get(&name), Some(&VariableValue::Integer(3)));
//! ```

mod error;
mod variable;

pub use error::ErrorCode;
pub use variable::{InvalidVariableName, VariableName, VariableStore, VariableValue};
