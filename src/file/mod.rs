//! Byte-level reading and writing primitives.
//!
//! - [`crate::file::io`] - Little-endian encoding of primitive values
//! - [`crate::file::parser::Parser`] - Cursor over a byte slice with ECMA-335 compressed integers

pub mod io;
pub mod parser;
