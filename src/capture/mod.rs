//! Capturing method bodies from inside the compiler hook.
//!
//! # Key Components
//!
//! - [`crate::capture::sigwalk`] - Walks local-variable type tags in runtime memory
//! - [`crate::capture::eh`] - Reads exception clauses through the compiler interface
//! - [`crate::capture::dumper`] - The per-method capture state machine

pub mod dumper;
pub mod eh;
pub mod sigwalk;

pub use dumper::{CaptureRecord, DumpingState, MethodDumper};
