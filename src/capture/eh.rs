//! Reading exception clauses through the compiler's `ICorJitInfo::getEHinfo`.
//!
//! The slot of `getEHinfo` and the object it must be called on differ per runtime:
//!
//! | Runtime | `this`                                   | Slot | Convention |
//! |---------|------------------------------------------|------|------------|
//! | 4.5+    | the `ICorJitInfo*` as passed              | 8    | `thiscall` |
//! | 4.0     | adjusted to the embedded `ICorDynamicInfo` | 10   | `stdcall`  |
//! | 2.0     | adjusted to the embedded `ICorDynamicInfo` | 8    | `stdcall`  |
//!
//! The adjusted object is `this + *(*(this + ptr) + ptr) + ptr`, the displacement the runtime
//! itself records for the virtual base.

use crate::{
    runtime::{
        corinfo::CorInfoEhClause,
        environment::RuntimeFlavor,
        thunk::{CallingConvention, ThunkFactory},
    },
    Result,
};

/// `ICorJitInfo::getEHinfo(this, ftn, index, clause)`
pub type GetEhInfoFn = unsafe extern "system" fn(usize, usize, u32, *mut CorInfoEhClause);

/// Calls `getEHinfo` for the running runtime.
#[derive(Clone, Copy)]
pub struct EhInfoReader {
    get_eh_info: GetEhInfoFn,
    adjust_this: bool,
    pointer_size: usize,
}

impl EhInfoReader {
    /// Locates `getEHinfo` through the interface table of `jit_info`.
    ///
    /// # Errors
    /// Returns an error if no adapter can be created for the slot's convention.
    ///
    /// # Safety
    ///
    /// `jit_info` must be the live `ICorJitInfo*` of an ongoing compile call of `flavor`.
    pub unsafe fn locate(flavor: RuntimeFlavor, jit_info: usize, thunks: &ThunkFactory) -> Result<Self> {
        let pointer_size = std::mem::size_of::<usize>();
        let (adjust_this, slot, convention) = match flavor {
            RuntimeFlavor::Clr45x => (false, 8, CallingConvention::ThisCall),
            RuntimeFlavor::Clr40x => (true, 10, CallingConvention::StdCall),
            RuntimeFlavor::Clr2x => (true, 8, CallingConvention::StdCall),
        };

        let object = if adjust_this {
            // SAFETY: the caller guarantees a live object.
            unsafe { adjusted_this(jit_info, pointer_size) }
        } else {
            jit_info
        };

        // SAFETY: every interface object starts with its table pointer.
        let function = unsafe {
            let table = *(object as *const usize);
            *((table + slot * pointer_size) as *const usize)
        };
        log::trace!("getEHinfo at 0x{function:X} (slot {slot}, {convention})");

        // SAFETY: the slot holds `getEHinfo` for this runtime.
        let get_eh_info = unsafe { thunks.create_callable(function, convention)? };
        Ok(EhInfoReader {
            get_eh_info,
            adjust_this,
            pointer_size,
        })
    }

    /// Reads clauses `0..count` of `method`.
    ///
    /// # Safety
    ///
    /// `jit_info` must be the live `ICorJitInfo*` of the compile call that reported `count`
    /// clauses for `method`.
    #[must_use]
    pub unsafe fn read_clauses(
        &self,
        jit_info: usize,
        method: usize,
        count: u32,
    ) -> Vec<CorInfoEhClause> {
        let object = if self.adjust_this {
            // SAFETY: the caller guarantees a live object.
            unsafe { adjusted_this(jit_info, self.pointer_size) }
        } else {
            jit_info
        };

        (0..count)
            .map(|index| {
                let mut clause = CorInfoEhClause::default();
                // SAFETY: located by `locate` on the same runtime; `clause` is a valid out slot.
                unsafe { (self.get_eh_info)(object, method, index, &mut clause) };
                clause
            })
            .collect()
    }
}

unsafe fn adjusted_this(jit_info: usize, pointer_size: usize) -> usize {
    // SAFETY: the caller guarantees a live object with a virtual-base displacement table.
    unsafe {
        let displacements = *((jit_info + pointer_size) as *const usize);
        let displacement = *((displacements + pointer_size) as *const usize);
        jit_info
            .wrapping_add(displacement)
            .wrapping_add(pointer_size)
    }
}
