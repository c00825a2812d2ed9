//! Access to the hosting runtime.
//!
//! # Key Components
//!
//! - [`crate::runtime::environment`] - Architecture, runtime generation and loaded modules
//! - [`crate::runtime::offsets`] - Versioned offset table of hook and patch sites
//! - [`crate::runtime::memory`] - Raw memory access with page-protection handling
//! - [`crate::runtime::thunk`] - Calling-convention adapter stubs
//! - [`crate::runtime::corinfo`] - Raw compiler structures and the compile-request view
//! - [`crate::runtime::identity`] - Canonical method identity resolution
//! - [`crate::runtime::functions`] - Forcing methods through the compiler
//! - [`crate::runtime::patch`] - Temporary behavior patches
//! - [`crate::runtime::host`] - The runtime host collaborator

pub mod corinfo;
pub mod environment;
pub mod functions;
pub mod host;
pub mod identity;
pub mod memory;
pub mod offsets;
pub mod patch;
pub mod thunk;
