//! Execution-engine routines that push a method through the compiler on demand.
//!
//! A method descriptor is reset to its "never compiled" state and its prestub is invoked,
//! which is exactly the path the runtime takes on a method's first call. Unboxing stubs are
//! thin wrappers, so the wrapped descriptor is forced through the same path as well.
//!
//! The runtime reports a failed compilation by raising an exception out of the prestub. Every
//! call into the execution engine is therefore made under a structured exception guard, and
//! a raised exception surfaces as [`crate::Error::NativeFault`] for the method at hand.

use std::rc::Rc;

use crate::{
    runtime::{
        environment::RuntimeEnvironment,
        memory::MemoryAccess,
        offsets::OffsetTable,
        thunk::{CallingConvention, ThunkFactory},
    },
    Result,
};

/// Operations on `MethodDesc` pointers.
pub trait MethodDescOps {
    /// `MethodDesc::Reset`: drops the compiled code so the next call goes through the prestub.
    ///
    /// # Errors
    /// Returns an error if the runtime call cannot be made.
    fn reset(&self, method_desc: usize) -> Result<()>;

    /// `MethodDesc::DoPrestub`: compiles the method. Returns the native entry point.
    ///
    /// # Errors
    /// Returns an error if the runtime call cannot be made.
    fn do_prestub(&self, method_desc: usize) -> Result<usize>;

    /// `true` if the descriptor is an unboxing stub.
    ///
    /// # Errors
    /// Returns an error if the descriptor cannot be read.
    fn is_unboxing_stub(&self, method_desc: usize) -> Result<bool>;

    /// `MethodDesc::GetWrappedMethodDesc`: the method an unboxing stub forwards to.
    ///
    /// # Errors
    /// Returns an error if the runtime call cannot be made.
    fn wrapped_method(&self, method_desc: usize) -> Result<usize>;
}

/// Forces `method_desc` through the compiler.
///
/// The descriptor is left reset afterwards, so a later real call compiles it again.
///
/// # Errors
/// Propagates the first failing operation.
pub fn force_compile(ops: &dyn MethodDescOps, method_desc: usize) -> Result<()> {
    ops.reset(method_desc)?;
    ops.do_prestub(method_desc)?;

    if ops.is_unboxing_stub(method_desc)? {
        let wrapped = ops.wrapped_method(method_desc)?;
        ops.reset(wrapped)?;
        ops.do_prestub(wrapped)?;
        ops.reset(wrapped)?;
    }

    ops.reset(method_desc)
}

/// Bit of `MethodDesc::m_bFlags2` marking unboxing stubs.
const FLAG2_IS_UNBOXING_STUB: u8 = 0x04;

type ResetFn = unsafe extern "system" fn(usize);
type DoPrestubFn = unsafe extern "system" fn(usize, usize) -> usize;
type GetWrappedFn = unsafe extern "system" fn(usize) -> usize;

/// Runs `call`, turning a structured exception raised inside it into
/// [`crate::Error::NativeFault`].
#[cfg(windows)]
fn guarded<R>(routine: &str, mut call: impl FnMut() -> R) -> Result<R> {
    microseh::try_seh(&mut call)
        .map_err(|exception| crate::Error::NativeFault(format!("{routine} raised {exception}")))
}

/// Runs `call`. Faults are not recoverable without structured exception handling.
#[cfg(not(windows))]
fn guarded<R>(_routine: &str, mut call: impl FnMut() -> R) -> Result<R> {
    Ok(call())
}

/// [`MethodDescOps`] calling into the loaded execution engine.
pub struct NativeMethodFunctions {
    memory: Rc<dyn MemoryAccess>,
    reset: ResetFn,
    do_prestub: DoPrestubFn,
    get_wrapped: GetWrappedFn,
}

impl NativeMethodFunctions {
    /// Binds the routines recorded in `offsets`.
    ///
    /// # Errors
    /// Returns [`crate::Error::MissingOffset`] for unrecorded routines or an error from
    /// adapter creation.
    ///
    /// # Safety
    ///
    /// `offsets` must have been verified against the execution engine loaded at
    /// `environment.modules.clr_base`.
    pub unsafe fn bind(
        memory: Rc<dyn MemoryAccess>,
        environment: &RuntimeEnvironment,
        offsets: &OffsetTable,
        thunks: &ThunkFactory,
    ) -> Result<Self> {
        let base = environment.modules.clr_base;
        let address = |offset: u32, key: &str| -> Result<usize> {
            Ok(base + OffsetTable::require(offset, key)? as usize)
        };

        // SAFETY: the signatures match the engine's member functions for verified offsets.
        unsafe {
            Ok(NativeMethodFunctions {
                memory,
                reset: thunks.create_callable(
                    address(offsets.method_desc_reset, "METHODDESC_RESET_RVA")?,
                    CallingConvention::ThisCall,
                )?,
                do_prestub: thunks.create_callable(
                    address(offsets.method_desc_do_prestub, "METHODDESC_DOPRESTUB_RVA")?,
                    CallingConvention::ThisCall,
                )?,
                get_wrapped: thunks.create_callable(
                    address(
                        offsets.method_desc_get_wrapped,
                        "METHODDESC_GETWRAPPEDMETHODDESC_RVA",
                    )?,
                    CallingConvention::ThisCall,
                )?,
            })
        }
    }
}

impl MethodDescOps for NativeMethodFunctions {
    fn reset(&self, method_desc: usize) -> Result<()> {
        // SAFETY: bound by `bind`; `method_desc` comes from the runtime.
        guarded("MethodDesc::Reset", || unsafe { (self.reset)(method_desc) })
    }

    fn do_prestub(&self, method_desc: usize) -> Result<usize> {
        // SAFETY: bound by `bind`; a null dispatching method table is accepted.
        guarded("MethodDesc::DoPrestub", || unsafe { (self.do_prestub)(method_desc, 0) })
    }

    fn is_unboxing_stub(&self, method_desc: usize) -> Result<bool> {
        Ok(self.memory.read_u8(method_desc + 3)? & FLAG2_IS_UNBOXING_STUB != 0)
    }

    fn wrapped_method(&self, method_desc: usize) -> Result<usize> {
        // SAFETY: bound by `bind`; only called for unboxing stubs.
        guarded("MethodDesc::GetWrappedMethodDesc", || unsafe {
            (self.get_wrapped)(method_desc)
        })
    }
}
