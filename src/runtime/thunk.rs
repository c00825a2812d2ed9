//! Calling-convention adapter stubs.
//!
//! On 32-bit x86 the runtime's internal routines use `thiscall` (first argument in `ecx`) and
//! `fastcall` (first two in `ecx`/`edx`), while Rust can only define and call `extern "system"`
//! (`stdcall`) functions. A [`ThunkFactory`] synthesizes tiny trampolines that move the leading
//! arguments between registers and the stack and then jump to the real function. On x64 every
//! convention is the same ABI and the original address is returned unchanged.
//!
//! # Stub encodings
//!
//! | From | To | Bytes |
//! |---|---|---|
//! | thiscall | stdcall | `pop eax; pop ecx; push eax; push imm32; ret` |
//! | fastcall | stdcall | `pop eax; pop ecx; pop edx; push eax; push imm32; ret` |
//! | stdcall | thiscall | `pop eax; push ecx; push eax; push imm32; ret` |
//! | stdcall | fastcall | `pop eax; push edx; push ecx; push eax; push imm32; ret` |
//!
//! A relative call patched on x64 can only reach 2 GiB around itself. Targets further away
//! are reached through a `jmp qword ptr [rip]` stub placed next to the call site, see
//! [`ThunkFactory::near_target`].

use memmap2::MmapMut;
use strum::{Display, EnumString};

use crate::{
    runtime::{
        environment::Architecture,
        memory::{MemoryAccess, NEAR_RANGE},
    },
    Error, Result,
};

/// Size of an [`absolute_jump`] stub.
pub const ABSOLUTE_JUMP_SIZE: usize = 14;

/// `jmp qword ptr [rip]` followed by the 64-bit target.
#[must_use]
pub fn absolute_jump(target: u64) -> [u8; ABSOLUTE_JUMP_SIZE] {
    let mut stub = [0u8; ABSOLUTE_JUMP_SIZE];
    stub[..6].copy_from_slice(&[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]);
    stub[6..].copy_from_slice(&target.to_le_bytes());
    stub
}

/// Native calling conventions the runtime exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
pub enum CallingConvention {
    /// Platform default, identical to `StdCall` on the supported targets
    Winapi,
    /// Caller-cleaned stack arguments
    Cdecl,
    /// Callee-cleaned stack arguments
    StdCall,
    /// `stdcall` with the first argument in `ecx`
    ThisCall,
    /// `stdcall` with the first two arguments in `ecx` and `edx`
    FastCall,
}

impl CallingConvention {
    /// The convention of `extern "system"` functions.
    pub const CANONICAL: CallingConvention = CallingConvention::StdCall;

    fn normalized(self) -> Self {
        match self {
            CallingConvention::Winapi => CallingConvention::StdCall,
            other => other,
        }
    }
}

/// Returns the adapter stub making a `from` function callable as `to`, with its jump target
/// set to `target`.
///
/// `Ok(None)` means no adapter is needed.
///
/// # Errors
/// Returns [`crate::Error::UnsupportedConvention`] if no adapter exists for the pair.
pub fn adapter_stub(
    from: CallingConvention,
    to: CallingConvention,
    target: u32,
) -> Result<Option<Vec<u8>>> {
    use CallingConvention::{FastCall, StdCall, ThisCall};

    let (mut stub, target_offset) = match (from.normalized(), to.normalized()) {
        (a, b) if a == b => return Ok(None),
        (ThisCall, StdCall) => (vec![0x58, 0x59, 0x50, 0x68, 0, 0, 0, 0, 0xC3], 4),
        (FastCall, StdCall) => (vec![0x58, 0x59, 0x5A, 0x50, 0x68, 0, 0, 0, 0, 0xC3], 5),
        (StdCall, ThisCall) => (vec![0x58, 0x51, 0x50, 0x68, 0, 0, 0, 0, 0xC3], 4),
        (StdCall, FastCall) => (vec![0x58, 0x52, 0x51, 0x50, 0x68, 0, 0, 0, 0, 0xC3], 5),
        _ => return Err(Error::UnsupportedConvention { from, to }),
    };

    stub[target_offset..target_offset + 4].copy_from_slice(&target.to_le_bytes());
    Ok(Some(stub))
}

/// Allocates convention adapters in executable memory.
///
/// Stubs are never freed: a session creates a handful of them and they must stay valid for
/// as long as the runtime may call through them.
#[derive(Debug, Clone, Copy)]
pub struct ThunkFactory {
    architecture: Architecture,
}

impl ThunkFactory {
    /// Creates a factory for the given architecture.
    #[must_use]
    pub fn new(architecture: Architecture) -> Self {
        ThunkFactory { architecture }
    }

    /// Creates a factory for the running process.
    #[must_use]
    pub fn current() -> Self {
        Self::new(Architecture::current())
    }

    /// Returns an address that behaves like `address` but is called with convention `to`,
    /// where `address` itself expects convention `from`.
    ///
    /// # Errors
    /// Returns [`crate::Error::UnsupportedConvention`] for pairs without an adapter and
    /// [`crate::Error::FileError`] if executable memory cannot be allocated.
    pub fn convert(
        &self,
        address: usize,
        from: CallingConvention,
        to: CallingConvention,
    ) -> Result<usize> {
        if self.architecture == Architecture::X64 {
            return Ok(address);
        }

        let target = u32::try_from(address).map_err(|_| Error::UnsupportedArchitecture(self.architecture))?;
        let Some(stub) = adapter_stub(from, to, target)? else {
            return Ok(address);
        };

        let mut map = MmapMut::map_anon(stub.len())?;
        map[..stub.len()].copy_from_slice(&stub);
        let map = map.make_exec()?;
        let stub_address = map.as_ptr() as usize;
        std::mem::forget(map);

        log::trace!("{from} -> {to} adapter for 0x{address:X} at 0x{stub_address:X}");
        Ok(stub_address)
    }

    /// Turns a native function using `from` into a Rust function pointer of type `F`.
    ///
    /// # Errors
    /// See [`ThunkFactory::convert`].
    ///
    /// # Safety
    ///
    /// `F` must be an `extern "system"` function pointer type whose signature matches the
    /// native function at `address`.
    pub unsafe fn create_callable<F: Copy>(
        &self,
        address: usize,
        from: CallingConvention,
    ) -> Result<F> {
        if std::mem::size_of::<F>() != std::mem::size_of::<usize>() {
            return Err(Error::Error(
                "callable type must be a function pointer".to_string(),
            ));
        }

        let callable = self.convert(address, from, CallingConvention::CANONICAL)?;
        // SAFETY: sizes match and the caller guarantees `F` describes the function.
        Ok(unsafe { std::mem::transmute_copy::<usize, F>(&callable) })
    }

    /// Returns an address within `rel32` range of `site` that continues at `target`.
    ///
    /// That is `target` itself when it is close enough, otherwise a new [`absolute_jump`]
    /// stub allocated through `memory` next to `site`. Stubs are never freed.
    ///
    /// # Errors
    /// Returns [`crate::Error::Memory`] if no stub can be placed near `site`.
    pub fn near_target(&self, memory: &dyn MemoryAccess, site: usize, target: usize) -> Result<usize> {
        if self.architecture == Architecture::X86 || site.abs_diff(target) < NEAR_RANGE {
            return Ok(target);
        }

        let stub = memory.allocate_near(site, ABSOLUTE_JUMP_SIZE)?;
        memory.write(stub, &absolute_jump(target as u64))?;
        log::debug!("Jump stub for 0x{target:X} at 0x{stub:X}, near 0x{site:X}");
        Ok(stub)
    }

    /// Returns an address through which native code using convention `to` can call the
    /// `extern "system"` function at `address`.
    ///
    /// # Errors
    /// See [`ThunkFactory::convert`].
    pub fn get_address(&self, address: usize, to: CallingConvention) -> Result<usize> {
        self.convert(address, CallingConvention::CANONICAL, to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::memory::BufferMemory;
    use CallingConvention::*;

    #[test]
    fn stub_layouts() {
        assert_eq!(
            adapter_stub(ThisCall, StdCall, 0x1122_3344).unwrap().unwrap(),
            vec![0x58, 0x59, 0x50, 0x68, 0x44, 0x33, 0x22, 0x11, 0xC3]
        );
        assert_eq!(
            adapter_stub(FastCall, StdCall, 0x1122_3344).unwrap().unwrap(),
            vec![0x58, 0x59, 0x5A, 0x50, 0x68, 0x44, 0x33, 0x22, 0x11, 0xC3]
        );
        assert_eq!(
            adapter_stub(StdCall, ThisCall, 0xAABB_CCDD).unwrap().unwrap(),
            vec![0x58, 0x51, 0x50, 0x68, 0xDD, 0xCC, 0xBB, 0xAA, 0xC3]
        );
        assert_eq!(
            adapter_stub(Winapi, FastCall, 0xAABB_CCDD).unwrap().unwrap(),
            vec![0x58, 0x52, 0x51, 0x50, 0x68, 0xDD, 0xCC, 0xBB, 0xAA, 0xC3]
        );
    }

    #[test]
    fn identical_conventions_need_no_stub() {
        assert!(adapter_stub(StdCall, StdCall, 1).unwrap().is_none());
        assert!(adapter_stub(Winapi, StdCall, 1).unwrap().is_none());
        assert!(adapter_stub(ThisCall, ThisCall, 1).unwrap().is_none());
    }

    #[test]
    fn unsupported_pairs() {
        assert!(matches!(
            adapter_stub(ThisCall, FastCall, 1),
            Err(Error::UnsupportedConvention { .. })
        ));
        assert!(adapter_stub(Cdecl, StdCall, 1).is_err());
        assert!(adapter_stub(StdCall, Cdecl, 1).is_err());
    }

    #[test]
    fn x64_is_identity() {
        let factory = ThunkFactory::new(Architecture::X64);
        assert_eq!(factory.convert(0x1234, ThisCall, StdCall).unwrap(), 0x1234);
        assert_eq!(factory.get_address(0x5678, FastCall).unwrap(), 0x5678);
        // no adapter exists, but nothing needs adapting either
        assert_eq!(factory.convert(0x1234, Cdecl, FastCall).unwrap(), 0x1234);
    }

    #[test]
    fn absolute_jump_layout() {
        assert_eq!(
            absolute_jump(0x1122_3344_5566_7788),
            [0xFF, 0x25, 0, 0, 0, 0, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
    }

    #[test]
    fn near_target_in_range_is_direct() {
        let memory = BufferMemory::new();
        let factory = ThunkFactory::new(Architecture::X64);
        assert_eq!(factory.near_target(&memory, 0x1000_0000, 0x5000_0000).unwrap(), 0x5000_0000);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn near_target_far_uses_stub() {
        let memory = BufferMemory::new();
        let factory = ThunkFactory::new(Architecture::X64);
        let site = 0x7FF6_1000_0105;
        let target = 0x0000_5555_0000_1000;

        let stub = factory.near_target(&memory, site, target).unwrap();
        assert!(stub.abs_diff(site) < NEAR_RANGE);
        assert_eq!(memory.read_vec(stub, ABSOLUTE_JUMP_SIZE).unwrap(), absolute_jump(target as u64));

        let x86 = ThunkFactory::new(Architecture::X86);
        assert_eq!(x86.near_target(&memory, site, target).unwrap(), target);
    }

    #[test]
    fn x86_allocates_stub() {
        let factory = ThunkFactory::new(Architecture::X86);
        assert_eq!(factory.convert(0x1234, StdCall, Winapi).unwrap(), 0x1234);

        if cfg!(target_pointer_width = "32") {
            let stub = factory.convert(0x1234, ThisCall, StdCall).unwrap();
            assert_ne!(stub, 0x1234);
            let bytes = unsafe { std::slice::from_raw_parts(stub as *const u8, 9) };
            assert_eq!(bytes[..4], [0x58, 0x59, 0x50, 0x68]);
        }
    }
}
