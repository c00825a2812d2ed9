//! # jitdump Prelude
//!
//! The types needed to set up and run a capture session, for glob import.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all jitdump operations
pub use crate::Error;

/// The result type used throughout jitdump
pub use crate::Result;

/// Metadata token of a method, signature or type
pub use crate::Token;

// ================================================================================================
// Session Entry Points
// ================================================================================================

/// The end-to-end sweep and its result
pub use crate::orchestrator::{CaptureOrchestrator, CaptureSummary, Collaborators};

/// Session configuration
pub use crate::config::UnpackerConfig;

/// Compiler hook strategy selection
pub use crate::hook::HookKind;

// ================================================================================================
// Collaborators
// ================================================================================================

/// Module reading and writing
pub use crate::module::{ModuleLoader, ModuleStore, WriteOptions};

/// Runtime services of the host application
pub use crate::runtime::{host::RuntimeHost, identity::MethodIntrospection};

/// Packer strategies
pub use crate::unpacker::{Unpacker, UnpackerContext, UnpackerDetector};

// ================================================================================================
// Body Assembly
// ================================================================================================

/// Captured bodies and token remapping
pub use crate::assembler::{BodyAssembler, MethodBody, TokenResolver};
