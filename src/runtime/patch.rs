//! Temporary byte patches to the execution engine.
//!
//! Forcing arbitrary methods through the compiler out of their natural order trips three
//! runtime guards. A [`BehaviorPatchSet`] disables them for the duration of a sweep:
//!
//! - [`PatchIntent::NoInline`] replaces `CEEInfo::canInline` with a stub answering
//!   "never inline", so each target reaches the compiler on its own.
//! - [`PatchIntent::SuppressStaticInit`] removes the automatic static-constructor trigger in
//!   `MethodDesc::DoPrestub`; the sweep runs the static constructor explicitly.
//! - [`PatchIntent::AllowGenericShells`] removes the "contains generic variables" rejection
//!   so open generic method shells can be compiled (4.5+ only).
//!
//! Patch sites come from the [`OffsetTable`] and are checked against the expected instruction
//! bytes when the set is built, before anything is written.

use std::rc::Rc;

use strum::Display;

use crate::{
    runtime::{
        environment::{Architecture, RuntimeEnvironment, RuntimeFlavor},
        memory::MemoryAccess,
        offsets::OffsetTable,
    },
    Error, Result,
};

/// Purpose of a behavior patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum PatchIntent {
    /// Every inlining decision answers "do not inline"
    NoInline,
    /// Compilation no longer triggers type static initializers
    SuppressStaticInit,
    /// Methods with unresolved generic parameters are no longer rejected
    AllowGenericShells,
}

/// One patch site: address, original bytes and replacement bytes of equal length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BehaviorPatch {
    intent: PatchIntent,
    address: usize,
    original: Vec<u8>,
    replacement: Vec<u8>,
}

impl BehaviorPatch {
    /// Creates a patch.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the byte runs differ in length.
    pub fn new(
        intent: PatchIntent,
        address: usize,
        original: Vec<u8>,
        replacement: Vec<u8>,
    ) -> Result<Self> {
        if original.len() != replacement.len() {
            return Err(malformed_error!(
                "Patch {} at 0x{:X} has {} original and {} replacement bytes",
                intent,
                address,
                original.len(),
                replacement.len()
            ));
        }

        Ok(BehaviorPatch {
            intent,
            address,
            original,
            replacement,
        })
    }

    /// Reads the current bytes at `address` as the original and verifies they start with
    /// `expected_prefix`.
    ///
    /// # Errors
    /// Returns [`crate::Error::PatchMismatch`] if the site does not hold the expected code.
    pub fn capture(
        memory: &dyn MemoryAccess,
        intent: PatchIntent,
        address: usize,
        replacement: Vec<u8>,
        expected_prefix: &[u8],
    ) -> Result<Self> {
        let original = memory.read_vec(address, replacement.len())?;
        if !original.starts_with(expected_prefix) {
            return Err(Error::PatchMismatch {
                address,
                expected: expected_prefix.to_vec(),
                found: original[..expected_prefix.len().min(original.len())].to_vec(),
            });
        }

        Self::new(intent, address, original, replacement)
    }

    /// What the patch disables.
    #[must_use]
    pub fn intent(&self) -> PatchIntent {
        self.intent
    }

    /// Address of the patched bytes.
    #[must_use]
    pub fn address(&self) -> usize {
        self.address
    }

    /// Bytes present before patching.
    #[must_use]
    pub fn original(&self) -> &[u8] {
        &self.original
    }

    /// Bytes written while the patch is applied.
    #[must_use]
    pub fn replacement(&self) -> &[u8] {
        &self.replacement
    }
}

// mov eax, [esp+0xC]; test eax, eax; je +3; and dword [eax], 0; push -2; pop eax; ret 0xC
const NO_INLINE_THISCALL: [u8; 17] = [
    0x8B, 0x44, 0x24, 0x0C, 0x85, 0xC0, 0x74, 0x03, 0x83, 0x20, 0x00, 0x6A, 0xFE, 0x58, 0xC2,
    0x0C, 0x00,
];

// same as above, `this` on the stack: [esp+0x10] and ret 0x10
const NO_INLINE_STDCALL: [u8; 17] = [
    0x8B, 0x44, 0x24, 0x10, 0x85, 0xC0, 0x74, 0x03, 0x83, 0x20, 0x00, 0x6A, 0xFE, 0x58, 0xC2,
    0x10, 0x00,
];

// mov eax, 0; nop; nop; nop
const FORCE_EAX_ZERO: [u8; 8] = [0xB8, 0x00, 0x00, 0x00, 0x00, 0x90, 0x90, 0x90];

// test eax, eax; jne rel32
const TEST_EAX_JNE: [u8; 4] = [0x85, 0xC0, 0x0F, 0x85];

// mov ecx, [ebp-0x18]; call rel32
const LOAD_ECX_CALL: [u8; 4] = [0x8B, 0x4D, 0xE8, 0xE8];

/// The catalog of patches for one runtime, applied and restored as a unit.
pub struct BehaviorPatchSet {
    memory: Rc<dyn MemoryAccess>,
    architecture: Architecture,
    patches: Vec<BehaviorPatch>,
    applied: bool,
}

impl BehaviorPatchSet {
    /// Builds the catalog for `environment`, reading and verifying the original bytes of
    /// every site.
    ///
    /// # Errors
    /// Returns [`crate::Error::UnsupportedArchitecture`] outside 32-bit processes,
    /// [`crate::Error::MissingOffset`] for unrecorded sites and
    /// [`crate::Error::PatchMismatch`] if a site holds unexpected code.
    pub fn for_runtime(
        memory: Rc<dyn MemoryAccess>,
        environment: &RuntimeEnvironment,
        offsets: &OffsetTable,
    ) -> Result<Self> {
        if environment.architecture != Architecture::X86 {
            return Err(Error::UnsupportedArchitecture(environment.architecture));
        }

        let clr = environment.modules.clr_base;
        let mut patches = Vec::with_capacity(3);

        let can_inline = OffsetTable::require(offsets.ceeinfo_can_inline, "CEEINFO_CANINLINE_RVA")?;
        let no_inline = if environment.flavor == RuntimeFlavor::Clr45x {
            NO_INLINE_THISCALL
        } else {
            NO_INLINE_STDCALL
        };
        patches.push(BehaviorPatch::capture(
            memory.as_ref(),
            PatchIntent::NoInline,
            clr + can_inline as usize,
            no_inline.to_vec(),
            &[],
        )?);

        if environment.flavor == RuntimeFlavor::Clr45x {
            let site = OffsetTable::require(
                offsets.prestub_class_constructor_triggered,
                "METHODDESC_DOPRESTUB_CALL_ISCLASSCONSTRUCTORTRIGGEREDVIAPRESTUB_RVA",
            )?;
            patches.push(BehaviorPatch::capture(
                memory.as_ref(),
                PatchIntent::SuppressStaticInit,
                clr + site as usize,
                FORCE_EAX_ZERO.to_vec(),
                &TEST_EAX_JNE,
            )?);

            let site = OffsetTable::require(
                offsets.prestub_contains_generic_variables,
                "METHODDESC_DOPRESTUB_CALL_CONTAINSGENERICVARIABLES_RVA",
            )?;
            patches.push(BehaviorPatch::capture(
                memory.as_ref(),
                PatchIntent::AllowGenericShells,
                clr + site as usize,
                FORCE_EAX_ZERO.to_vec(),
                &TEST_EAX_JNE,
            )?);
        } else {
            let site = OffsetTable::require(
                offsets.prestub_check_run_class_init,
                "METHODDESC_DOPRESTUB_CALL_CHECKRUNCLASSINITTHROWING_RVA",
            )?;
            patches.push(BehaviorPatch::capture(
                memory.as_ref(),
                PatchIntent::SuppressStaticInit,
                clr + site as usize,
                vec![0x90; 8],
                &LOAD_ECX_CALL,
            )?);
        }

        Ok(Self::from_patches(memory, environment.architecture, patches))
    }

    /// Builds a set from explicit patches.
    #[must_use]
    pub fn from_patches(
        memory: Rc<dyn MemoryAccess>,
        architecture: Architecture,
        patches: Vec<BehaviorPatch>,
    ) -> Self {
        BehaviorPatchSet {
            memory,
            architecture,
            patches,
            applied: false,
        }
    }

    /// The patches in application order.
    #[must_use]
    pub fn patches(&self) -> &[BehaviorPatch] {
        &self.patches
    }

    /// `true` while the replacement bytes are in place.
    #[must_use]
    pub fn is_applied(&self) -> bool {
        self.applied
    }

    /// Writes every replacement. Calling it again while applied does nothing.
    ///
    /// # Errors
    /// Returns [`crate::Error::UnsupportedArchitecture`] outside 32-bit processes. If a write
    /// fails, the patches already written are restored before the error is returned.
    pub fn apply(&mut self) -> Result<()> {
        self.check_architecture()?;
        if self.applied {
            return Ok(());
        }

        for (index, patch) in self.patches.iter().enumerate() {
            if let Err(error) = self.memory.write(patch.address, &patch.replacement) {
                for written in self.patches[..index].iter().rev() {
                    let _ = self.memory.write(written.address, &written.original);
                }
                return Err(error);
            }
            log::debug!("Applied {} patch at 0x{:X}", patch.intent, patch.address);
        }

        self.applied = true;
        Ok(())
    }

    /// Writes every original back. Calling it while not applied does nothing.
    ///
    /// # Errors
    /// Returns [`crate::Error::UnsupportedArchitecture`] outside 32-bit processes, or the
    /// first write failure after attempting all sites.
    pub fn restore(&mut self) -> Result<()> {
        self.check_architecture()?;
        if !self.applied {
            return Ok(());
        }

        let mut first_error = None;
        for patch in self.patches.iter().rev() {
            match self.memory.write(patch.address, &patch.original) {
                Ok(()) => log::debug!("Restored {} patch at 0x{:X}", patch.intent, patch.address),
                Err(error) => {
                    first_error.get_or_insert(error);
                }
            }
        }

        self.applied = false;
        first_error.map_or(Ok(()), Err)
    }

    fn check_architecture(&self) -> Result<()> {
        if self.architecture == Architecture::X86 {
            Ok(())
        } else {
            Err(Error::UnsupportedArchitecture(self.architecture))
        }
    }
}

impl Drop for BehaviorPatchSet {
    fn drop(&mut self) {
        if self.applied {
            if let Err(error) = self.restore() {
                log::error!("Failed to restore runtime patches: {error}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        runtime::memory::BufferMemory,
        test::{environment, patchable_clr, OFFSET_TABLE_TEXT},
    };

    fn table() -> OffsetTable {
        OFFSET_TABLE_TEXT.parse().unwrap()
    }

    #[test]
    fn catalog_clr45() {
        let env = environment(Architecture::X86, "4.0.30319.42000");
        let memory = patchable_clr(&env);
        let set = BehaviorPatchSet::for_runtime(memory, &env, &table()).unwrap();

        let intents: Vec<_> = set.patches().iter().map(BehaviorPatch::intent).collect();
        assert_eq!(
            intents,
            vec![
                PatchIntent::NoInline,
                PatchIntent::SuppressStaticInit,
                PatchIntent::AllowGenericShells
            ]
        );
        assert_eq!(set.patches()[0].replacement(), &NO_INLINE_THISCALL);
        assert_eq!(set.patches()[1].address(), env.modules.clr_base + 0x6000);
        assert_eq!(set.patches()[2].original()[..4], TEST_EAX_JNE);
    }

    #[test]
    fn apply_restore_roundtrip() {
        let env = environment(Architecture::X86, "4.0.30319.42000");
        let memory = patchable_clr(&env);
        let base = env.modules.clr_base;
        let before = memory.read_vec(base, 0x7000).unwrap();

        let mut set = BehaviorPatchSet::for_runtime(memory.clone(), &env, &table()).unwrap();
        set.apply().unwrap();
        set.apply().unwrap();
        assert!(set.is_applied());
        assert_eq!(memory.read_vec(base + 0x5000, 8).unwrap(), FORCE_EAX_ZERO);
        assert_eq!(memory.read_vec(base + 0x4000, 17).unwrap(), NO_INLINE_THISCALL);
        assert_ne!(memory.read_vec(base, 0x7000).unwrap(), before);

        set.restore().unwrap();
        set.restore().unwrap();
        assert!(!set.is_applied());
        assert_eq!(memory.read_vec(base, 0x7000).unwrap(), before);
    }

    #[test]
    fn drop_restores() {
        let env = environment(Architecture::X86, "4.0.30319.42000");
        let memory = patchable_clr(&env);
        let before = memory.read_vec(env.modules.clr_base, 0x7000).unwrap();
        {
            let mut set = BehaviorPatchSet::for_runtime(memory.clone(), &env, &table()).unwrap();
            set.apply().unwrap();
        }
        assert_eq!(memory.read_vec(env.modules.clr_base, 0x7000).unwrap(), before);
    }

    #[test]
    fn unexpected_site_bytes() {
        let env = environment(Architecture::X86, "4.0.30319.42000");
        let memory = patchable_clr(&env);
        memory.write(env.modules.clr_base + 0x5000, &[0xCC]).unwrap();

        let result = BehaviorPatchSet::for_runtime(memory, &env, &table());
        assert!(matches!(result, Err(Error::PatchMismatch { .. })));
    }

    #[test]
    fn clr40_needs_class_init_site() {
        let env = environment(Architecture::X86, "4.0.30319.1");
        let memory = patchable_clr(&env);
        let result = BehaviorPatchSet::for_runtime(memory, &env, &table());
        assert!(matches!(result, Err(Error::MissingOffset(_))));
    }

    #[test]
    fn x64_is_rejected() {
        let env = environment(Architecture::X64, "4.0.30319.42000");
        let memory = patchable_clr(&env);
        assert!(matches!(
            BehaviorPatchSet::for_runtime(memory.clone(), &env, &table()),
            Err(Error::UnsupportedArchitecture(Architecture::X64))
        ));

        let patch = BehaviorPatch::new(PatchIntent::NoInline, 0x10, vec![1], vec![2]).unwrap();
        let mut set = BehaviorPatchSet::from_patches(memory, Architecture::X64, vec![patch]);
        assert!(set.apply().is_err());
        assert!(set.restore().is_err());
    }

    #[test]
    fn unequal_lengths() {
        assert!(BehaviorPatch::new(PatchIntent::NoInline, 0, vec![1, 2], vec![3]).is_err());
    }

    #[test]
    fn failed_apply_rolls_back() {
        let memory = Rc::new(BufferMemory::new());
        memory.map(0x1000, vec![0xAA; 4]).unwrap();
        let shared: Rc<dyn MemoryAccess> = memory.clone();

        let good = BehaviorPatch::new(PatchIntent::NoInline, 0x1000, vec![0xAA], vec![0x90]).unwrap();
        let bad = BehaviorPatch::new(PatchIntent::SuppressStaticInit, 0x9000, vec![0], vec![1]).unwrap();
        let mut set = BehaviorPatchSet::from_patches(shared, Architecture::X86, vec![good, bad]);

        assert!(set.apply().is_err());
        assert!(!set.is_applied());
        assert_eq!(memory.read_u8(0x1000).unwrap(), 0xAA);
    }
}
