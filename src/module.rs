//! The metadata-level view of .NET modules used by a capture session.
//!
//! Reading and writing modules is delegated to a collaborator: a [`ModuleLoader`] opens the
//! packed input and the in-memory snapshot, and each opened module is a [`ModuleStore`]
//! that answers row-level queries and accepts reconstructed bodies. Rows are 1-based
//! `MethodDef` / `StandAloneSig` row ids.

use std::{cell::RefCell, path::Path, rc::Rc};

use crate::{assembler::MethodBody, token::Token, Result};

/// How the output module is serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteOptions {
    /// Keep every metadata row at its original row id
    pub preserve_row_ids: bool,
    /// Keep heap offsets (strings, blobs, user strings) unchanged
    pub preserve_offsets: bool,
    /// Write the captured max-stack values instead of recomputing them
    pub keep_original_max_stack: bool,
}

/// One opened module.
pub trait ModuleStore {
    /// Number of `MethodDef` rows.
    fn method_count(&self) -> u32;

    /// `true` if method `row` has a CIL body (not abstract, runtime or P/Invoke).
    ///
    /// # Errors
    /// Returns an error if `row` does not exist.
    fn has_body(&self, row: u32) -> Result<bool>;

    /// The encoded body of method `row` as stored in the module, if it has one.
    ///
    /// # Errors
    /// Returns an error if `row` does not exist or the body cannot be located.
    fn method_body(&self, row: u32) -> Result<Option<Vec<u8>>>;

    /// Replaces the body of method `row`, allocating a `StandAloneSig` for its locals.
    ///
    /// # Errors
    /// Returns an error if `row` does not exist or the body cannot be stored.
    fn replace_body(&mut self, row: u32, body: &MethodBody) -> Result<()>;

    /// Static constructor of the module-global type, if any.
    fn global_static_constructor(&self) -> Option<Token>;

    /// Static constructors of all other types, in type order.
    fn type_static_constructors(&self) -> Vec<Token>;

    /// Number of `StandAloneSig` rows.
    fn standalone_signature_count(&self) -> u32;

    /// The signature blob of `StandAloneSig` row `row`, `None` if it has none.
    ///
    /// # Errors
    /// Returns an error if `row` does not exist.
    fn standalone_signature(&self, row: u32) -> Result<Option<Vec<u8>>>;

    /// Sets the signature blob of `StandAloneSig` row `row`.
    ///
    /// # Errors
    /// Returns an error if `row` does not exist.
    fn set_standalone_signature(&mut self, row: u32, blob: &[u8]) -> Result<()>;

    /// Removes a type by full name. Returns `false` if no such type exists.
    ///
    /// # Errors
    /// Returns an error if the type exists but cannot be removed.
    fn remove_type(&mut self, full_name: &str) -> Result<bool>;

    /// Serializes the module to `path`.
    ///
    /// # Errors
    /// Returns an error if the module cannot be serialized or written.
    fn write(&self, path: &Path, options: &WriteOptions) -> Result<()>;
}

/// Opens modules.
pub trait ModuleLoader {
    /// Opens the module stored at `path`.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or is not a .NET module.
    fn load(&self, path: &Path) -> Result<Box<dyn ModuleStore>>;

    /// Opens a module from a file image held in memory.
    ///
    /// # Errors
    /// Returns an error if the image is not a .NET module.
    fn load_bytes(&self, image: Vec<u8>) -> Result<Box<dyn ModuleStore>>;
}

/// The output module, shared between the capture callback and the session driving it.
///
/// Empty until the snapshot of the initialized image has been loaded.
pub type OutputSlot = Rc<RefCell<Option<Box<dyn ModuleStore>>>>;

/// Creates an empty [`OutputSlot`].
#[must_use]
pub fn output_slot() -> OutputSlot {
    Rc::new(RefCell::new(None))
}
