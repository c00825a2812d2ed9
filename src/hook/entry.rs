//! Native entry points the redirected compiler calls into.
//!
//! The compiler calls plain functions without a context argument, so the active hook is
//! published through process-wide slots. At most one hook exists at a time, enforced by
//! [`SessionGuard`].
//!
//! Compilations arriving on threads other than the one that installed the hook are forwarded
//! without touching the filter.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    ptr,
    rc::Rc,
    sync::atomic::{AtomicBool, AtomicPtr, Ordering},
    thread::{self, ThreadId},
};

use crate::{
    hook::{
        filter::{CompileFilter, FilterOutcome},
        CompilationEvent, CORJIT_INTERNALERROR, CORJIT_OK,
    },
    runtime::corinfo::MethodInfoLayout,
    Error, Result,
};

/// `ICorJitCompiler::compileMethod(this, comp, info, flags, nativeEntry, nativeSizeOfCode)`
pub type CompileMethodFn =
    unsafe extern "system" fn(usize, usize, usize, u32, usize, usize) -> i32;

/// `Compiler::compCompile(this, method, module, comp, info, nativeEntry, nativeSizeOfCode, flags)`
pub type CompCompileFn =
    unsafe extern "system" fn(usize, usize, usize, usize, usize, usize, usize, usize) -> i32;

static SESSION_ACTIVE: AtomicBool = AtomicBool::new(false);

/// Ownership of the process-wide hook session. Released on drop.
#[derive(Debug)]
pub struct SessionGuard {
    _private: (),
}

impl SessionGuard {
    /// Claims the session.
    ///
    /// # Errors
    /// Returns [`crate::Error::HookActive`] if another hook holds it.
    pub fn acquire() -> Result<Self> {
        SESSION_ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::HookActive)?;
        Ok(SessionGuard { _private: () })
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        SESSION_ACTIVE.store(false, Ordering::Release);
    }
}

/// What an entry point needs to route one compile call.
pub struct HookSlot<F> {
    owner: ThreadId,
    layout: MethodInfoLayout,
    filter: Rc<CompileFilter>,
    original: F,
}

impl<F: Copy> HookSlot<F> {
    /// Creates a slot owned by the calling thread.
    pub fn new(layout: MethodInfoLayout, filter: Rc<CompileFilter>, original: F) -> Self {
        HookSlot {
            owner: thread::current().id(),
            layout,
            filter,
            original,
        }
    }

    /// The function the redirect replaced.
    pub fn original(&self) -> F {
        self.original
    }
}

/// A process-wide pointer to the installed [`HookSlot`].
pub struct SlotCell<F>(AtomicPtr<HookSlot<F>>);

impl<F> SlotCell<F> {
    const fn new() -> Self {
        SlotCell(AtomicPtr::new(ptr::null_mut()))
    }

    /// Publishes `slot`.
    ///
    /// # Safety
    ///
    /// `slot` must stay alive and unmoved until [`SlotCell::clear`] is called.
    pub unsafe fn install(&self, slot: &HookSlot<F>) {
        self.0
            .store(ptr::from_ref(slot).cast_mut(), Ordering::Release);
    }

    /// Withdraws the published slot.
    pub fn clear(&self) {
        self.0.store(ptr::null_mut(), Ordering::Release);
    }

    /// `true` while a slot is published.
    pub fn is_installed(&self) -> bool {
        !self.0.load(Ordering::Acquire).is_null()
    }

    /// # Safety
    ///
    /// The returned reference is only valid while the slot stays installed.
    unsafe fn current<'a>(&self) -> Option<&'a HookSlot<F>> {
        // SAFETY: `install`'s contract keeps the pointee alive while published.
        unsafe { self.0.load(Ordering::Acquire).as_ref() }
    }
}

/// Slot served by [`compile_method_entry`].
pub static COMPILE_METHOD_SLOT: SlotCell<CompileMethodFn> = SlotCell::new();

/// Slot served by [`comp_compile_entry`].
pub static COMP_COMPILE_SLOT: SlotCell<CompCompileFn> = SlotCell::new();

fn run_filter(filter: &CompileFilter, event: CompilationEvent) -> FilterOutcome {
    catch_unwind(AssertUnwindSafe(|| filter.filter(event))).unwrap_or_else(|_| {
        filter.stash_error(Error::NativeFault(
            "compile callback panicked".to_string(),
        ));
        FilterOutcome::Failed
    })
}

/// Replacement for `ICorJitCompiler::compileMethod`.
///
/// # Safety
///
/// Only called by the compiler through the installed redirect.
pub unsafe extern "system" fn compile_method_entry(
    this: usize,
    jit_info: usize,
    method_info: usize,
    flags: u32,
    native_entry: usize,
    native_size: usize,
) -> i32 {
    // SAFETY: the hook clears the slot before releasing it.
    let Some(slot) = (unsafe { COMPILE_METHOD_SLOT.current() }) else {
        return CORJIT_INTERNALERROR;
    };

    if slot.owner != thread::current().id() {
        // SAFETY: forwarding the unmodified call to the replaced function.
        return unsafe { (slot.original)(this, jit_info, method_info, flags, native_entry, native_size) };
    }

    // SAFETY: `method_info` is the compiler's live block for this call.
    let event =
        unsafe { CompilationEvent::new(slot.layout, jit_info, method_info, native_entry, native_size) };

    match run_filter(&slot.filter, event) {
        FilterOutcome::Forward(event) => unsafe {
            // SAFETY: as above, with the callback's edits applied.
            (slot.original)(
                this,
                event.jit_info(),
                event.method_info(),
                flags,
                event.native_entry(),
                event.native_size(),
            )
        },
        FilterOutcome::Claimed => CORJIT_OK,
        FilterOutcome::Failed => CORJIT_INTERNALERROR,
    }
}

/// Replacement for the compiler's internal `compCompile`.
///
/// # Safety
///
/// Only called by the compiler through the installed redirect.
#[allow(clippy::too_many_arguments)]
pub unsafe extern "system" fn comp_compile_entry(
    this: usize,
    method: usize,
    module: usize,
    jit_info: usize,
    method_info: usize,
    native_entry: usize,
    native_size: usize,
    flags: usize,
) -> i32 {
    if this == 0 {
        return CORJIT_OK;
    }

    // SAFETY: the hook clears the slot before releasing it.
    let Some(slot) = (unsafe { COMP_COMPILE_SLOT.current() }) else {
        return CORJIT_INTERNALERROR;
    };

    if slot.owner != thread::current().id() {
        // SAFETY: forwarding the unmodified call to the replaced function.
        return unsafe {
            (slot.original)(this, method, module, jit_info, method_info, native_entry, native_size, flags)
        };
    }

    // SAFETY: `method_info` is the compiler's live block for this call.
    let event =
        unsafe { CompilationEvent::new(slot.layout, jit_info, method_info, native_entry, native_size) };

    match run_filter(&slot.filter, event) {
        FilterOutcome::Forward(event) => unsafe {
            // SAFETY: as above, with the callback's edits applied.
            (slot.original)(
                this,
                method,
                module,
                event.jit_info(),
                event.method_info(),
                event.native_entry(),
                event.native_size(),
                flags,
            )
        },
        FilterOutcome::Claimed => CORJIT_OK,
        FilterOutcome::Failed => CORJIT_INTERNALERROR,
    }
}
