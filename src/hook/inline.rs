//! Inline strategy: retargets the `call compCompile` inside `jitNativeCode`.
//!
//! The call site is a five-byte `E8 rel32`. Hooking rewrites the displacement so the call
//! lands in [`comp_compile_entry`]; unhooking writes the original four bytes back. When the
//! entry point is beyond `rel32` reach the call lands in a jump stub next to the call site.

use std::rc::Rc;

use crate::{
    hook::{
        entry::{comp_compile_entry, CompCompileFn, HookSlot, SessionGuard, COMP_COMPILE_SLOT},
        filter::CompileFilter,
        CompilerHook, HookContext, HookKind,
    },
    runtime::{memory::MemoryAccess, offsets::OffsetTable},
    Error, Result,
};

const CALL_REL32: u8 = 0xE8;

/// Target of a `rel32` operand located at `operand`.
fn call_target(operand: usize, displacement: i32) -> usize {
    (operand as i64 + 4 + i64::from(displacement)) as usize
}

/// Displacement that makes the `rel32` operand at `operand` reach `target`.
///
/// # Errors
/// Returns [`crate::Error::DisplacementOutOfRange`] if `target` is not within ±2 GiB.
pub fn displacement_to(operand: usize, target: usize) -> Result<i32> {
    let delta = target as i64 - (operand as i64 + 4);
    i32::try_from(delta).map_err(|_| Error::DisplacementOutOfRange {
        site: operand,
        target,
    })
}

/// Redirect of the compiler's internal compile call.
pub struct InlineHook {
    filter: Rc<CompileFilter>,
    memory: Rc<dyn MemoryAccess>,
    slot: Box<HookSlot<CompCompileFn>>,
    operand: usize,
    original: i32,
    redirected: i32,
    hooked: bool,
    _session: SessionGuard,
}

impl InlineHook {
    /// Locates the call site and prepares the redirect without installing it.
    ///
    /// # Errors
    /// Returns [`crate::Error::HookActive`] if another hook exists,
    /// [`crate::Error::MissingOffset`] if the site is unknown, [`crate::Error::PatchMismatch`]
    /// if the site is not a relative call, or [`crate::Error::Memory`] if no jump stub can be
    /// placed near a site out of the entry point's reach.
    pub fn new(context: HookContext) -> Result<Self> {
        let session = SessionGuard::acquire()?;
        let HookContext {
            environment,
            offsets,
            memory,
            thunks,
            resolver,
        } = context;

        let rva = OffsetTable::require(offsets.call_comp_compile, "CALL_COMPCOMPILE_RVA")?;
        let site = environment.modules.jit_base + rva as usize;

        let opcode = memory.read_u8(site)?;
        if opcode != CALL_REL32 {
            return Err(Error::PatchMismatch {
                address: site,
                expected: vec![CALL_REL32],
                found: vec![opcode],
            });
        }

        let operand = site + 1;
        let original = memory.read_i32(operand)?;
        let convention = environment.comp_compile_convention();

        // SAFETY: the verified site calls `compCompile`, whose signature is `CompCompileFn`.
        let original_fn: CompCompileFn = unsafe {
            thunks.create_callable(call_target(operand, original), convention)?
        };
        let entry = thunks.get_address(comp_compile_entry as usize, convention)?;
        let stub = thunks.near_target(memory.as_ref(), operand, entry)?;
        let redirected = displacement_to(operand, stub)?;

        log::debug!(
            "compCompile call at 0x{site:X} -> 0x{:X}, entry stub 0x{stub:X}",
            call_target(operand, original)
        );

        let filter = Rc::new(CompileFilter::new(resolver));
        let slot = Box::new(HookSlot::new(
            environment.method_info_layout(),
            filter.clone(),
            original_fn,
        ));

        Ok(InlineHook {
            filter,
            memory,
            slot,
            operand,
            original,
            redirected,
            hooked: false,
            _session: session,
        })
    }

    /// Address of the patched `rel32` operand.
    #[must_use]
    pub fn operand(&self) -> usize {
        self.operand
    }
}

impl CompilerHook for InlineHook {
    fn kind(&self) -> HookKind {
        HookKind::Inline
    }

    fn filter(&self) -> &CompileFilter {
        &self.filter
    }

    fn hook(&mut self) -> Result<()> {
        if self.hooked {
            return Err(Error::HookState("inline hook is already installed"));
        }

        // SAFETY: the boxed slot outlives the installation; `unhook` and `Drop` clear it.
        unsafe { COMP_COMPILE_SLOT.install(&self.slot) };
        if let Err(error) = self.memory.write_i32(self.operand, self.redirected) {
            COMP_COMPILE_SLOT.clear();
            return Err(error);
        }

        self.hooked = true;
        Ok(())
    }

    fn unhook(&mut self) -> Result<()> {
        if !self.hooked {
            return Err(Error::HookState("inline hook is not installed"));
        }

        self.memory.write_i32(self.operand, self.original)?;
        COMP_COMPILE_SLOT.clear();
        self.hooked = false;
        Ok(())
    }

    fn is_hooked(&self) -> bool {
        self.hooked
    }
}

impl Drop for InlineHook {
    fn drop(&mut self) {
        if self.hooked {
            if let Err(error) = self.unhook() {
                log::error!("Failed to remove inline hook at 0x{:X} - {error}", self.operand);
                COMP_COMPILE_SLOT.clear();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{
        far_jit_memory, hook_context, hook_context_at, hook_lock, inline_jit_memory,
        OFFSET_TABLE_TEXT,
    };

    #[test]
    fn displacement_math() {
        assert_eq!(displacement_to(0x1000, 0x2000).unwrap(), 0x2000 - 0x1004);
        assert_eq!(displacement_to(0x2000, 0x1000).unwrap(), 0x1000 - 0x2004);
        assert_eq!(call_target(0x1000, 0x0FFC), 0x2000);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn unreachable_target() {
        assert!(matches!(
            displacement_to(0x1000, 0x1_0000_2004),
            Err(Error::DisplacementOutOfRange { site: 0x1000, .. })
        ));
    }

    #[test]
    fn hook_and_restore() {
        let _lock = hook_lock();
        let (memory, operand, original) = inline_jit_memory();
        let context = hook_context(memory.clone(), OFFSET_TABLE_TEXT);

        let mut hook = InlineHook::new(context).unwrap();
        assert_eq!(hook.operand(), operand);
        assert!(!hook.is_hooked());

        hook.hook().unwrap();
        assert!(hook.is_hooked());
        assert!(COMP_COMPILE_SLOT.is_installed());
        let redirected = memory.read_i32(operand).unwrap();
        assert_ne!(redirected, original);
        if cfg!(target_pointer_width = "64") {
            assert_eq!(
                call_target(operand, redirected),
                comp_compile_entry as usize
            );
        }

        assert!(matches!(hook.hook(), Err(Error::HookState(_))));

        hook.unhook().unwrap();
        assert_eq!(memory.read_i32(operand).unwrap(), original);
        assert!(!COMP_COMPILE_SLOT.is_installed());
        assert!(matches!(hook.unhook(), Err(Error::HookState(_))));
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn far_entry_goes_through_stub() {
        use crate::runtime::{
            memory::NEAR_RANGE,
            thunk::{absolute_jump, ABSOLUTE_JUMP_SIZE},
        };

        let _lock = hook_lock();
        let (memory, modules) = far_jit_memory();
        let operand = modules.jit_base + 0x101;
        let original = memory.read_i32(operand).unwrap();
        let entry = comp_compile_entry as usize;
        assert!(entry.abs_diff(operand) >= NEAR_RANGE);

        let mut hook =
            InlineHook::new(hook_context_at(memory.clone(), OFFSET_TABLE_TEXT, modules)).unwrap();
        hook.hook().unwrap();

        let stub = call_target(operand, memory.read_i32(operand).unwrap());
        assert!(stub.abs_diff(operand) < NEAR_RANGE);
        assert_eq!(
            memory.read_vec(stub, ABSOLUTE_JUMP_SIZE).unwrap(),
            absolute_jump(entry as u64)
        );

        hook.unhook().unwrap();
        assert_eq!(memory.read_i32(operand).unwrap(), original);
    }

    #[test]
    fn drop_restores() {
        let _lock = hook_lock();
        let (memory, operand, original) = inline_jit_memory();
        {
            let mut hook = InlineHook::new(hook_context(memory.clone(), OFFSET_TABLE_TEXT)).unwrap();
            hook.hook().unwrap();
        }
        assert_eq!(memory.read_i32(operand).unwrap(), original);
        InlineHook::new(hook_context(memory, OFFSET_TABLE_TEXT)).unwrap();
    }

    #[test]
    fn rejects_non_call_site() {
        let _lock = hook_lock();
        let (memory, operand, _) = inline_jit_memory();
        memory.write(operand - 1, &[0x90]).unwrap();
        assert!(matches!(
            InlineHook::new(hook_context(memory, OFFSET_TABLE_TEXT)),
            Err(Error::PatchMismatch { .. })
        ));
    }
}
