//! Shared fixtures for unit tests: fake runtime modules, offset tables and compiler images.

mod store;

use std::{
    cell::Cell,
    rc::Rc,
    sync::{Mutex, MutexGuard},
};

pub use store::*;

use crate::{
    hook::{
        entry::{comp_compile_entry, CompCompileFn, CompileMethodFn},
        inline::displacement_to,
        HookContext,
    },
    runtime::{
        environment::{Architecture, RuntimeEnvironment, RuntimeModules},
        identity::PassthroughResolver,
        memory::{BufferMemory, MemoryAccess},
        thunk::ThunkFactory,
    },
};

/// Offset table matching [`runtime_modules`] for version `4.0.30319.42000`.
pub const OFFSET_TABLE_TEXT: &str = "CLR_VERSION=4.0.30319.42000
JIT_VERSION=4.0.30319.42000
METHODDESC_RESET_RVA=1000
METHODDESC_DOPRESTUB_RVA=2000
METHODDESC_GETWRAPPEDMETHODDESC_RVA=3000
CEEINFO_CANINLINE_RVA=4000
METHODDESC_DOPRESTUB_CALL_CONTAINSGENERICVARIABLES_RVA=5000
METHODDESC_DOPRESTUB_CALL_ISCLASSCONSTRUCTORTRIGGEREDVIAPRESTUB_RVA=6000
METHODDESC_DOPRESTUB_CALL_CHECKRUNCLASSINITTHROWING_RVA=0
CALL_COMPCOMPILE_RVA=100
JITNATIVECODE_RVA=0x200
";

/// Value returned by the fake compiler entry points.
pub const FAKE_COMPILER_RESULT: i32 = 0x4A17;

/// Runtime modules at fixed fake addresses, both reporting `version`.
pub fn runtime_modules(version: &str) -> RuntimeModules {
    let version = version.parse().unwrap();
    RuntimeModules {
        clr_base: 0x1000_0000,
        clr_version: version,
        jit_base: 0x2000_0000,
        jit_version: version,
        jit_instance: 0x2010_0000,
    }
}

/// A classified environment over [`runtime_modules`].
pub fn environment(architecture: Architecture, version: &str) -> RuntimeEnvironment {
    RuntimeEnvironment::new(architecture, runtime_modules(version)).unwrap()
}

/// Execution engine image with the instruction bytes every patch site expects.
pub fn patchable_clr(environment: &RuntimeEnvironment) -> Rc<BufferMemory> {
    let mut image = vec![0xCC; 0x7000];
    image[0x4000..0x4003].copy_from_slice(&[0x55, 0x8B, 0xEC]);
    for site in [0x5000, 0x6000] {
        image[site..site + 8].copy_from_slice(&[0x85, 0xC0, 0x0F, 0x85, 0x10, 0x00, 0x00, 0x00]);
    }

    let memory = Rc::new(BufferMemory::new());
    memory.map(environment.modules.clr_base, image).unwrap();
    memory
}

static HOOK_LOCK: Mutex<()> = Mutex::new(());

/// Serializes tests that install process-wide hooks.
pub fn hook_lock() -> MutexGuard<'static, ()> {
    HOOK_LOCK
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

thread_local! {
    /// Number of calls that reached the fake compiler entry points.
    pub static FAKE_COMPILER_CALLS: Cell<usize> = const { Cell::new(0) };
}

/// Stands in for the compiler's `compileMethod`.
pub unsafe extern "system" fn fake_compile_method(
    _this: usize,
    _jit_info: usize,
    _method_info: usize,
    _flags: u32,
    _native_entry: usize,
    _native_size: usize,
) -> i32 {
    FAKE_COMPILER_CALLS.with(|calls| calls.set(calls.get() + 1));
    FAKE_COMPILER_RESULT
}

/// Stands in for the compiler's `compCompile`.
#[allow(clippy::too_many_arguments)]
pub unsafe extern "system" fn fake_comp_compile(
    _this: usize,
    _method: usize,
    _module: usize,
    _jit_info: usize,
    _method_info: usize,
    _native_entry: usize,
    _native_size: usize,
    _flags: usize,
) -> i32 {
    FAKE_COMPILER_CALLS.with(|calls| calls.set(calls.get() + 1));
    FAKE_COMPILER_RESULT
}

const JIT_IMAGE_SIZE: usize = 0x3000;
const JIT_INSTANCE_RVA: usize = 0x2000;
const JIT_TABLE_RVA: usize = 0x2100;

/// Compiler modules placed close enough to this binary's code for `rel32` calls to reach it.
pub fn hook_modules() -> RuntimeModules {
    let jit_base = ((comp_compile_entry as usize) & !0xFFFF) + 0x100_0000;
    let version = "4.0.30319.42000".parse().unwrap();
    RuntimeModules {
        clr_base: 0x1000_0000,
        clr_version: version,
        jit_base,
        jit_version: version,
        jit_instance: jit_base + JIT_INSTANCE_RVA,
    }
}

/// Compiler image holding `call fake_comp_compile` at `CALL_COMPCOMPILE_RVA` and an interface
/// table whose slot 0 is `fake_compile_method`.
pub fn jit_memory() -> Rc<BufferMemory> {
    let modules = hook_modules();
    let ptr = std::mem::size_of::<usize>();
    let memory = Rc::new(BufferMemory::new());
    memory
        .map(modules.jit_base, vec![0xCC; JIT_IMAGE_SIZE])
        .unwrap();

    let site = modules.jit_base + 0x100;
    let displacement = displacement_to(site + 1, fake_comp_compile as CompCompileFn as usize).unwrap();
    memory.write(site, &[0xE8]).unwrap();
    memory.write_i32(site + 1, displacement).unwrap();

    let table = modules.jit_base + JIT_TABLE_RVA;
    memory
        .write_pointer(modules.jit_instance, ptr, table)
        .unwrap();
    memory
        .write_pointer(table, ptr, fake_compile_method as CompileMethodFn as usize)
        .unwrap();
    memory
}

/// [`jit_memory`] with the address and original value of the `call compCompile` operand.
pub fn inline_jit_memory() -> (Rc<BufferMemory>, usize, i32) {
    let memory = jit_memory();
    let operand = hook_modules().jit_base + 0x101;
    let original = memory.read_i32(operand).unwrap();
    (memory, operand, original)
}

/// Compiler image far out of `rel32` reach of this binary's code, with a `call` at
/// `CALL_COMPCOMPILE_RVA` into its own image.
#[cfg(target_pointer_width = "64")]
pub fn far_jit_memory() -> (Rc<BufferMemory>, RuntimeModules) {
    let entry = comp_compile_entry as usize;
    let far = if entry > 0x2000_0000_0000 {
        entry - 0x1000_0000_0000
    } else {
        entry + 0x1000_0000_0000
    };
    let jit_base = far & !0xFFFF;

    let mut modules = hook_modules();
    modules.jit_base = jit_base;
    modules.jit_instance = jit_base + JIT_INSTANCE_RVA;

    let memory = Rc::new(BufferMemory::new());
    let mut image = vec![0xCC; JIT_IMAGE_SIZE];
    image[0x100..0x105].copy_from_slice(&[0xE8, 0x10, 0x00, 0x00, 0x00]);
    memory.map(jit_base, image).unwrap();
    (memory, modules)
}

/// [`jit_memory`] with the address of the `compileMethod` table slot.
pub fn vtable_jit_memory() -> (Rc<BufferMemory>, usize) {
    (jit_memory(), hook_modules().jit_base + JIT_TABLE_RVA)
}

/// Size of the file [`mapped_pe_image`] reconstructs to.
pub const PE_FILE_SIZE: usize = 0x600;

/// A 32-bit PE image as the loader maps it: headers of 0x200 bytes, `.text` at RVA 0x1000
/// (0x30 bytes used, 0x200 raw at file 0x200) and `.rsrc` at RVA 0x2000 (0x300 bytes
/// used, 0x200 raw at file 0x400). Section contents are a non-zero byte pattern.
pub fn mapped_pe_image() -> Vec<u8> {
    let mut image = vec![0u8; 0x3000];
    let mut put = |offset: usize, bytes: &[u8]| image[offset..offset + bytes.len()].copy_from_slice(bytes);

    put(0x00, b"MZ");
    put(0x3C, &0x80u32.to_le_bytes());
    put(0x80, b"PE\0\0");

    // COFF header
    put(0x84, &0x014Cu16.to_le_bytes());
    put(0x86, &2u16.to_le_bytes());
    put(0x94, &0xE0u16.to_le_bytes());
    put(0x96, &0x0102u16.to_le_bytes());

    // Optional header
    put(0x98, &0x010Bu16.to_le_bytes());
    put(0xB4, &0x0040_0000u32.to_le_bytes());
    put(0xB8, &0x1000u32.to_le_bytes());
    put(0xBC, &0x200u32.to_le_bytes());
    put(0xC8, &4u16.to_le_bytes());
    put(0xD0, &0x3000u32.to_le_bytes());
    put(0xD4, &0x200u32.to_le_bytes());
    put(0xDC, &3u16.to_le_bytes());
    put(0xF4, &16u32.to_le_bytes());

    for (index, (name, virtual_size, virtual_address, raw_offset)) in [
        (b".text\0\0\0", 0x30u32, 0x1000u32, 0x200u32),
        (b".rsrc\0\0\0", 0x300, 0x2000, 0x400),
    ]
    .into_iter()
    .enumerate()
    {
        let entry = 0x178 + index * 40;
        put(entry, name);
        put(entry + 8, &virtual_size.to_le_bytes());
        put(entry + 12, &virtual_address.to_le_bytes());
        put(entry + 16, &0x200u32.to_le_bytes());
        put(entry + 20, &raw_offset.to_le_bytes());
        put(entry + 36, &0x4000_0040u32.to_le_bytes());
    }

    for (offset, byte) in image.iter_mut().enumerate().skip(0x1000) {
        if (0x1000..0x1200).contains(&offset) || (0x2000..0x2300).contains(&offset) {
            *byte = (offset % 0xFB) as u8 | 1;
        }
    }
    image
}

/// Hook context over `memory` for the current architecture.
pub fn hook_context(memory: Rc<BufferMemory>, offsets: &str) -> HookContext {
    hook_context_at(memory, offsets, hook_modules())
}

/// [`hook_context`] over `modules`.
pub fn hook_context_at(
    memory: Rc<BufferMemory>,
    offsets: &str,
    modules: RuntimeModules,
) -> HookContext {
    HookContext {
        environment: RuntimeEnvironment::new(Architecture::current(), modules).unwrap(),
        offsets: offsets.parse().unwrap(),
        memory,
        thunks: ThunkFactory::current(),
        resolver: Box::new(PassthroughResolver),
    }
}
