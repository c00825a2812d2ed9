//! Interface-table strategy: swaps slot 0 (`compileMethod`) of the compiler instance's table.

use std::rc::Rc;

use crate::{
    hook::{
        entry::{compile_method_entry, CompileMethodFn, HookSlot, SessionGuard, COMPILE_METHOD_SLOT},
        filter::CompileFilter,
        CompilerHook, HookContext, HookKind,
    },
    runtime::memory::MemoryAccess,
    Error, Result,
};

/// Redirect of `ICorJitCompiler::compileMethod`.
pub struct VTableHook {
    filter: Rc<CompileFilter>,
    memory: Rc<dyn MemoryAccess>,
    slot: Box<HookSlot<CompileMethodFn>>,
    pointer_size: usize,
    table_slot: usize,
    original: usize,
    redirected: usize,
    hooked: bool,
    _session: SessionGuard,
}

impl VTableHook {
    /// Reads the compiler's interface table and prepares the redirect without installing it.
    ///
    /// # Errors
    /// Returns [`crate::Error::HookActive`] if another hook exists, or a memory error if the
    /// compiler instance cannot be read.
    pub fn new(context: HookContext) -> Result<Self> {
        let session = SessionGuard::acquire()?;
        let HookContext {
            environment,
            memory,
            thunks,
            resolver,
            ..
        } = context;

        let pointer_size = environment.pointer_size();
        let instance = environment.modules.jit_instance;
        if instance == 0 {
            return Err(Error::HookState("compiler instance is not available"));
        }

        let table_slot = memory.read_pointer(instance, pointer_size)?;
        let original = memory.read_pointer(table_slot, pointer_size)?;
        let convention = environment.compile_method_convention();

        // SAFETY: slot 0 of `ICorJitCompiler` is `compileMethod`.
        let original_fn: CompileMethodFn =
            unsafe { thunks.create_callable(original, convention)? };
        let redirected = thunks.get_address(compile_method_entry as usize, convention)?;

        log::debug!(
            "compileMethod slot at 0x{table_slot:X} holds 0x{original:X}, entry stub 0x{redirected:X}"
        );

        let filter = Rc::new(CompileFilter::new(resolver));
        let slot = Box::new(HookSlot::new(
            environment.method_info_layout(),
            filter.clone(),
            original_fn,
        ));

        Ok(VTableHook {
            filter,
            memory,
            slot,
            pointer_size,
            table_slot,
            original,
            redirected,
            hooked: false,
            _session: session,
        })
    }

    /// Address of the replaced table slot.
    #[must_use]
    pub fn table_slot(&self) -> usize {
        self.table_slot
    }
}

impl CompilerHook for VTableHook {
    fn kind(&self) -> HookKind {
        HookKind::VTable
    }

    fn filter(&self) -> &CompileFilter {
        &self.filter
    }

    fn hook(&mut self) -> Result<()> {
        if self.hooked {
            return Err(Error::HookState("interface table hook is already installed"));
        }

        // SAFETY: the boxed slot outlives the installation; `unhook` and `Drop` clear it.
        unsafe { COMPILE_METHOD_SLOT.install(&self.slot) };
        if let Err(error) =
            self.memory
                .write_pointer(self.table_slot, self.pointer_size, self.redirected)
        {
            COMPILE_METHOD_SLOT.clear();
            return Err(error);
        }

        self.hooked = true;
        Ok(())
    }

    fn unhook(&mut self) -> Result<()> {
        if !self.hooked {
            return Err(Error::HookState("interface table hook is not installed"));
        }

        self.memory
            .write_pointer(self.table_slot, self.pointer_size, self.original)?;
        COMPILE_METHOD_SLOT.clear();
        self.hooked = false;
        Ok(())
    }

    fn is_hooked(&self) -> bool {
        self.hooked
    }
}

impl Drop for VTableHook {
    fn drop(&mut self) {
        if self.hooked {
            if let Err(error) = self.unhook() {
                log::error!(
                    "Failed to restore compileMethod slot at 0x{:X} - {error}",
                    self.table_slot
                );
                COMPILE_METHOD_SLOT.clear();
            }
        }
    }
}
