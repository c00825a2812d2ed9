//! Redirecting the compiler's compile entry point through a filter.
//!
//! Two interchangeable strategies implement [`CompilerHook`]:
//!
//! - [`inline::InlineHook`] rewrites the relative operand of the `call compCompile`
//!   instruction inside the compiler's `jitNativeCode`.
//! - [`vtable::VTableHook`] replaces the `compileMethod` slot of the compiler's interface
//!   table.
//!
//! Both route every compilation through the shared [`filter::CompileFilter`], which forwards
//! anything that is not the armed target and hands the target to a callback as a
//! [`CompilationEvent`].
//!
//! Only one hook may exist per process at a time; constructing a second one fails with
//! [`crate::Error::HookActive`] until the first is dropped.

pub mod entry;
pub mod filter;
pub mod inline;
pub mod vtable;

use std::{rc::Rc, str::FromStr};

use strum::{Display, EnumString};

use crate::{
    hook::filter::CompileFilter,
    runtime::{
        corinfo::{CompileRequest, MethodInfoLayout},
        environment::RuntimeEnvironment,
        identity::CanonicalResolver,
        memory::MemoryAccess,
        offsets::OffsetTable,
        thunk::ThunkFactory,
    },
    Error, Result,
};

/// `CORJIT_OK`
pub const CORJIT_OK: i32 = 0;

/// `CORJIT_INTERNALERROR`
pub const CORJIT_INTERNALERROR: i32 = 0x8000_0003_u32 as i32;

/// What the callback decided about an intercepted compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interception {
    /// The method was handled; the compiler is not invoked and `CORJIT_OK` is returned.
    Claimed,
    /// Continue into the real compiler with the (possibly edited) event.
    Forward,
}

/// One intercepted compile call.
///
/// The pointers are those passed to the compiler; edits made by the callback are what the
/// real compiler receives if the event is forwarded.
#[derive(Debug, Clone, Copy)]
pub struct CompilationEvent {
    jit_info: usize,
    method_info: usize,
    native_entry: usize,
    native_size: usize,
    layout: MethodInfoLayout,
}

impl CompilationEvent {
    /// Wraps the arguments of a compile call.
    ///
    /// # Safety
    ///
    /// `method_info` must be null or point to a live method-info block of `layout` for as long
    /// as the event (or a [`CompileRequest`] obtained from it) is used.
    #[must_use]
    pub unsafe fn new(
        layout: MethodInfoLayout,
        jit_info: usize,
        method_info: usize,
        native_entry: usize,
        native_size: usize,
    ) -> Self {
        CompilationEvent {
            jit_info,
            method_info,
            native_entry,
            native_size,
            layout,
        }
    }

    /// The request being compiled, or `None` if the method-info pointer is null.
    #[must_use]
    pub fn request(&self) -> Option<CompileRequest<'_>> {
        // SAFETY: `new`'s contract covers `method_info` for the lifetime of the event.
        unsafe { CompileRequest::from_ptr(self.layout, self.method_info) }
    }

    /// `ICorJitInfo*` of the compile call.
    #[must_use]
    pub fn jit_info(&self) -> usize {
        self.jit_info
    }

    /// Replaces the `ICorJitInfo*` handed to the real compiler.
    pub fn set_jit_info(&mut self, jit_info: usize) {
        self.jit_info = jit_info;
    }

    /// `CORINFO_METHOD_INFO*` of the compile call.
    #[must_use]
    pub fn method_info(&self) -> usize {
        self.method_info
    }

    /// Replaces the method-info block handed to the real compiler.
    ///
    /// # Safety
    ///
    /// Same contract as [`CompilationEvent::new`] for the new pointer.
    pub unsafe fn set_method_info(&mut self, method_info: usize) {
        self.method_info = method_info;
    }

    /// Slot receiving the native entry address (`BYTE**`).
    #[must_use]
    pub fn native_entry(&self) -> usize {
        self.native_entry
    }

    /// Replaces the native entry slot.
    pub fn set_native_entry(&mut self, native_entry: usize) {
        self.native_entry = native_entry;
    }

    /// Slot receiving the native code size (`ULONG*`).
    #[must_use]
    pub fn native_size(&self) -> usize {
        self.native_size
    }

    /// Replaces the native size slot.
    pub fn set_native_size(&mut self, native_size: usize) {
        self.native_size = native_size;
    }
}

/// Callback invoked for the armed target.
pub type CompileCallback = Rc<dyn Fn(&mut CompilationEvent) -> Result<Interception>>;

/// Hook strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum HookKind {
    /// Patch the `call compCompile` operand
    #[default]
    Inline,
    /// Patch the `compileMethod` interface slot
    VTable,
}

/// Everything a hook needs to locate and redirect the compiler.
pub struct HookContext {
    /// The classified runtime
    pub environment: RuntimeEnvironment,
    /// Verified runtime offsets
    pub offsets: OffsetTable,
    /// Memory holding the compiler's code and interface table
    pub memory: Rc<dyn MemoryAccess>,
    /// Adapter factory for the process architecture
    pub thunks: ThunkFactory,
    /// Canonical identity rule for incoming method handles
    pub resolver: Box<dyn CanonicalResolver>,
}

/// Redirect of one compilation entry point through a filter.
///
/// `hook()` and `unhook()` are not idempotent: hooking twice or unhooking while not hooked
/// is a [`crate::Error::HookState`] fault.
pub trait CompilerHook {
    /// Which strategy this is.
    fn kind(&self) -> HookKind;

    /// The shared filter.
    fn filter(&self) -> &CompileFilter;

    /// Installs the redirect.
    ///
    /// # Errors
    /// Returns [`crate::Error::HookState`] if already hooked, or a memory error.
    fn hook(&mut self) -> Result<()>;

    /// Restores the original target byte-for-byte.
    ///
    /// # Errors
    /// Returns [`crate::Error::HookState`] if not hooked, or a memory error.
    fn unhook(&mut self) -> Result<()>;

    /// `true` while the redirect is installed.
    fn is_hooked(&self) -> bool;

    /// Module handle compilations must belong to.
    fn target_module(&self) -> usize {
        self.filter().target_module()
    }

    /// Sets the module handle compilations must belong to.
    fn set_target_module(&self, module: usize) {
        self.filter().set_target_module(module);
    }

    /// Method handle currently armed, zero if none.
    fn target_method(&self) -> usize {
        self.filter().target_method()
    }

    /// Arms a method handle; zero disarms.
    fn set_target_method(&self, method: usize) {
        self.filter().set_target_method(method);
    }

    /// Replaces the callback invoked for the armed target.
    fn set_callback(&self, callback: Option<CompileCallback>) {
        self.filter().set_callback(callback);
    }

    /// Takes the error raised by the most recent failing callback, if any.
    fn take_error(&self) -> Option<Error> {
        self.filter().take_error()
    }
}

/// Creates a hook of the requested kind.
///
/// # Errors
/// Returns [`crate::Error::HookActive`] if another hook exists, or any setup error of the
/// chosen strategy.
pub fn create_hook(kind: HookKind, context: HookContext) -> Result<Box<dyn CompilerHook>> {
    Ok(match kind {
        HookKind::Inline => Box::new(inline::InlineHook::new(context)?),
        HookKind::VTable => Box::new(vtable::VTableHook::new(context)?),
    })
}

impl HookKind {
    /// Parses a strategy name case-insensitively.
    ///
    /// # Errors
    /// Returns [`crate::Error::Error`] for unknown names.
    pub fn parse(name: &str) -> Result<Self> {
        HookKind::from_str(name).map_err(|_| Error::Error(format!("Unknown hook type '{name}'")))
    }
}
