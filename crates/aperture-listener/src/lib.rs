//! Listener lifecycle primitives
//!
//! [`ValueGate`] is a single-slot container whose readers block until a value
//! is published. [`ManagedListener`] builds on it to offer a TCP listener that
//! can be stopped and started again without the accept loop ever seeing the
//! stop as a failure.

#![deny(missing_docs)]

pub mod listener;
pub mod value_gate;

pub use listener::{is_listener_closed, ListenerError, ListenerState, ManagedListener};
pub use value_gate::ValueGate;
