//! The hosting runtime as seen by a capture session.

use std::rc::Rc;

use crate::{
    runtime::{environment::RuntimeModules, identity::MethodIntrospection},
    token::Token,
    Result,
};

/// Services of the runtime the target module is loaded into.
///
/// The implementation lives on the managed side of the process (or in a test double); the
/// capture pipeline only ever talks to the runtime through this trait and raw memory.
pub trait RuntimeHost {
    /// Addresses and versions of the execution engine and compiler.
    fn modules(&self) -> RuntimeModules;

    /// Module handle of the loaded target, as it appears in compile requests.
    fn module_handle(&self) -> usize;

    /// Base address of the target image as mapped by the loader.
    fn image_base(&self) -> usize;

    /// Method handle for a `MethodDef` token, or `None` if the runtime has no descriptor for it.
    ///
    /// # Errors
    /// Returns an error if the runtime lookup itself fails.
    fn method_handle(&self, token: Token) -> Result<Option<usize>>;

    /// Invokes a parameterless method through the runtime's normal invocation path.
    ///
    /// # Errors
    /// Returns an error if the invoked method throws.
    fn invoke(&self, token: Token) -> Result<()>;

    /// Queries used to resolve canonical method identities.
    fn introspection(&self) -> Rc<dyn MethodIntrospection>;
}
