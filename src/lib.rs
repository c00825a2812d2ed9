// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(clippy::too_many_arguments)]
// Unsafe code is confined to the runtime boundary:
// - 'runtime/memory.rs' reads and writes foreign pages and flips their protection
// - 'runtime/thunk.rs' and 'hook/entry.rs' cross into native calling conventions
// - 'capture/eh.rs' and 'capture/sigwalk.rs' walk structures owned by the runtime

//! # jitdump
//!
//! Recovers the original method bodies of packed .NET modules by intercepting the
//! just-in-time compiler of a running .NET Framework runtime.
//!
//! Packers that encrypt method bodies must hand the real CIL to the compiler at some point.
//! `jitdump` sits in front of the compiler's `compileMethod` entry, forces every method of
//! the target module through it one at a time, reassembles each body it sees (code, stack
//! depth, locals and exception clauses) and writes them into a module reconstructed from the
//! decrypted in-memory image.
//!
//! ## Architecture
//!
//! - [`runtime`] - Detection of the loaded runtime, its offset table, raw memory access,
//!   calling-convention thunks, temporary behavior patches and method forcing
//! - [`hook`] - The compiler hook in its inline (`call compCompile`) and interface-table
//!   (`compileMethod` slot) forms, with the shared interception filter
//! - [`capture`] - The capture state machine and the readers for runtime-owned locals
//!   signatures and exception clauses
//! - [`assembler`] - CIL decoding and re-encoding of captured bodies
//! - [`snapshot`] - Rebuilding a PE file from the mapped image
//! - [`module`] - The collaborator interfaces for reading and writing modules
//! - [`unpacker`] - Packer-specific strategies
//! - [`orchestrator`] - The end-to-end capture sweep
//!
//! ## Usage
//!
//! A session runs inside the process that hosts the runtime. The host application supplies a
//! [`runtime::host::RuntimeHost`] for the loaded module and a [`module::ModuleLoader`]:
//!
//! ```rust,no_run
//! use std::{path::Path, rc::Rc};
//! use jitdump::prelude::*;
//!
//! fn unpack(host: Rc<dyn RuntimeHost>, loader: Box<dyn ModuleLoader>) -> jitdump::Result<()> {
//!     let config = UnpackerConfig::new()
//!         .with_hook_kind(HookKind::VTable)
//!         .with_offsets_directory("offsets");
//!
//!     // SAFETY: `host` describes the runtime of this process.
//!     let mut orchestrator =
//!         unsafe { CaptureOrchestrator::attach(config, Path::new("app.exe"), host, loader, Vec::new())? };
//!     let summary = orchestrator.run()?;
//!     println!("{} captured, {} failed", summary.captured, summary.failed);
//!     Ok(())
//! }
//! ```
//!
//! ## Error Handling
//!
//! All operations return [`Result<T, Error>`](Result). Failures while preparing a session
//! abort it; a failure while capturing one method is logged with its token and the sweep
//! continues:
//!
//! ```rust,no_run
//! use jitdump::{runtime::offsets::OffsetTable, Error};
//!
//! match OffsetTable::from_file(std::path::Path::new("offsets/JitUnpacker.RuntimeFunctions.CLR40.x86.config")) {
//!     Ok(table) => println!("{table}"),
//!     Err(Error::MissingOffset(key)) => println!("offset {key} not recorded"),
//!     Err(e) => println!("Error: {}", e),
//! }
//! ```
//!
//! ## Platform Support
//!
//! Hooks work on 32-bit and 64-bit processes. Behavior patches are only available for
//! 32-bit runtimes; on 64-bit runtimes they are reported as
//! [`Error::UnsupportedArchitecture`].
#[macro_use]
pub(crate) mod error;
pub(crate) mod file;

/// Shared functionality which is used in unit- and integration-tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust
/// use jitdump::prelude::*;
///
/// let config = UnpackerConfig::new().with_preserve_runtime(true);
/// assert!(!config.removes_runtime_support());
/// ```
pub mod prelude;

/// CIL decoding and re-encoding of captured method bodies.
///
/// # Key Types
///
/// - [`assembler::BodyAssembler`] - Turns a captured compile request into a [`assembler::MethodBody`]
/// - [`assembler::MethodBody`] - A decoded body with branch targets as instruction indices
/// - [`assembler::RawMethodBody`] - Header-level view of an encoded body
/// - [`assembler::TokenResolver`] - Hook for packers that remap metadata tokens
pub mod assembler;

/// The capture state machine and the readers for runtime-owned data.
pub mod capture;

/// Session configuration.
pub mod config;

/// The compiler hook.
///
/// Two strategies redirect compilations into the same filter: the inline hook rewrites the
/// `rel32` operand of the compiler's internal `call compCompile`, the interface-table hook
/// swaps the `compileMethod` slot of the compiler instance. Only one hook may exist per
/// process at a time.
pub mod hook;

/// The collaborator interfaces for reading and writing modules.
pub mod module;

/// The end-to-end capture sweep.
pub mod orchestrator;

/// Access to the hosting runtime.
pub mod runtime;

/// Rebuilding a PE file from a mapped image.
pub mod snapshot;

/// Metadata tokens.
pub mod token;

/// Packer-specific strategies.
pub mod unpacker;

/// `jitdump` Result type
///
/// A type alias for `std::result::Result<T, Error>` where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `jitdump` Error type
///
/// The main error type for all operations in this crate. Provides detailed error information
/// for runtime detection, hook management, patching and capture.
///
/// # Example
///
/// ```rust
/// use jitdump::{Error, token::Token};
///
/// let error = Error::Capture {
///     token: Token::method_def(3),
///     source: Box::new(Error::NoOutputModule),
/// };
/// assert!(error.to_string().contains("0x06000003"));
/// ```
pub use error::Error;

/// Cursor over byte slices with ECMA-335 compressed integer support.
pub use file::parser::Parser;

/// A metadata token.
pub use token::Token;
