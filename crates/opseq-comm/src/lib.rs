//! Termination signalling and progress messages for the opseq engine.
//!
//! A [`CommChannel`] is the one object in the workspace that crosses
//! threads. The executor holds one end; an external controller or
//! observer holds the other.
//!
//! ```text
//! ┌──────────┐  Message (progress)   ┌─────────────┐
//! │ Executor │ ────────────────────► │  Observer   │
//! │  thread  │ ◄──────────────────── │  / UI /     │
//! └──────────┘  terminate_requested  │  controller │
//!                  (atomic flag)     └─────────────┘
//! ```
//!
//! The flag travels controller → executor; messages travel executor →
//! observer. Neither direction ever blocks the executor: the flag is a
//! plain atomic store, and [`CommChannel::send`] drops the oldest queued
//! message instead of waiting when the queue is full.

mod channel;
mod message;

pub use channel::CommChannel;
pub use message::{Message, MessageKind};
