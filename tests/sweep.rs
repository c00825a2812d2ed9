//! End-to-end capture sweeps against an in-memory runtime.
//!
//! The fake runtime hands the compiler the real code of each method while the module on
//! "disk" only holds placeholder bodies, the way an encrypting packer leaves it. A sweep must
//! recover the real code, locals and exception clauses into the written output.

use std::{
    cell::RefCell,
    collections::HashMap,
    path::Path,
    rc::Rc,
    sync::{Mutex, MutexGuard},
};

use jitdump::{
    assembler::{decoder::Operand, HandlerKind, MethodBody, OpCode, TokenResolver},
    config::UnpackerConfig,
    hook::{entry::compile_method_entry, HookKind},
    module::{ModuleLoader, ModuleStore, WriteOptions},
    orchestrator::{CaptureOrchestrator, Collaborators},
    runtime::{
        corinfo::{CorInfoEhClause, CorInfoMethodInfo40, CorInfoOptions},
        environment::{Architecture, RuntimeEnvironment, RuntimeModules},
        functions::MethodDescOps,
        host::RuntimeHost,
        identity::MethodIntrospection,
        memory::{BufferMemory, MemoryAccess},
        offsets::OffsetTable,
        patch::{BehaviorPatch, BehaviorPatchSet, PatchIntent},
    },
    unpacker::{Unpacker, UnpackerContext, UnpackerDetector},
    Result, Token,
};
use tempfile::TempDir;

static LOCK: Mutex<()> = Mutex::new(());

fn lock() -> MutexGuard<'static, ()> {
    LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

const JIT_BASE: usize = 0x2000_0000;
const JIT_INSTANCE: usize = JIT_BASE + 0x2000;
const JIT_TABLE: usize = JIT_BASE + 0x2100;
const IMAGE_BASE: usize = 0x0040_0000;
const PATCH_SITE: usize = 0x1000_0000;
const MODULE_HANDLE: usize = 0x7700;

// call 0x06000002; ret
const CCTOR: [u8; 6] = [0x28, 0x02, 0x00, 0x00, 0x06, 0x2A];
// ldstr 0x70000001; pop; ret
const GREETING: [u8; 7] = [0x72, 0x01, 0x00, 0x00, 0x70, 0x26, 0x2A];
// .try { ldc.i4.0; stloc.0; leave.s END } finally { endfinally } END: ret
const GUARDED: [u8; 6] = [0x16, 0x0A, 0xDE, 0x01, 0xDC, 0x2A];
// int32
const GUARDED_LOCALS: [u8; 1] = [0x08];

unsafe extern "system" fn original_compile_method(
    _this: usize,
    _jit_info: usize,
    _method_info: usize,
    _flags: u32,
    _native_entry: usize,
    _native_size: usize,
) -> i32 {
    0
}

unsafe extern "system" fn guarded_clause(
    _this: usize,
    _method: usize,
    _index: u32,
    clause: *mut CorInfoEhClause,
) {
    unsafe {
        *clause = CorInfoEhClause {
            flags: 2,
            try_offset: 0,
            try_length: 4,
            handler_offset: 4,
            handler_length: 1,
            class_token_or_filter_offset: 0,
        };
    }
}

fn handle_of(row: u32) -> usize {
    0x9000 + row as usize * 0x20
}

fn modules() -> RuntimeModules {
    let version = "4.0.30319.42000".parse().unwrap();
    RuntimeModules {
        clr_base: PATCH_SITE,
        clr_version: version,
        jit_base: JIT_BASE,
        jit_version: version,
        jit_instance: JIT_INSTANCE,
    }
}

/// A one-section PE32 image as mapped by the loader.
fn mapped_image() -> Vec<u8> {
    let mut image = vec![0u8; 0x2000];
    let mut put = |offset: usize, bytes: &[u8]| image[offset..offset + bytes.len()].copy_from_slice(bytes);
    put(0x00, b"MZ");
    put(0x3C, &0x80u32.to_le_bytes());
    put(0x80, b"PE\0\0");
    put(0x84, &0x014Cu16.to_le_bytes());
    put(0x86, &1u16.to_le_bytes());
    put(0x94, &0xE0u16.to_le_bytes());
    put(0x96, &0x0102u16.to_le_bytes());
    put(0x98, &0x010Bu16.to_le_bytes());
    put(0xB4, &(IMAGE_BASE as u32).to_le_bytes());
    put(0xB8, &0x1000u32.to_le_bytes());
    put(0xBC, &0x200u32.to_le_bytes());
    put(0xD0, &0x2000u32.to_le_bytes());
    put(0xD4, &0x200u32.to_le_bytes());
    put(0xDC, &3u16.to_le_bytes());
    put(0xF4, &16u32.to_le_bytes());
    put(0x178, b".text\0\0\0");
    put(0x180, &0x100u32.to_le_bytes());
    put(0x184, &0x1000u32.to_le_bytes());
    put(0x188, &0x200u32.to_le_bytes());
    put(0x18C, &0x200u32.to_le_bytes());
    put(0x19C, &0x6000_0020u32.to_le_bytes());
    put(0x1000, b"decrypted");
    image
}

fn memory() -> Rc<BufferMemory> {
    let pointer = std::mem::size_of::<usize>();
    let memory = Rc::new(BufferMemory::new());
    memory.map(JIT_BASE, vec![0u8; 0x3000]).unwrap();
    memory.write_pointer(JIT_INSTANCE, pointer, JIT_TABLE).unwrap();
    memory
        .write_pointer(JIT_TABLE, pointer, original_compile_method as usize)
        .unwrap();
    memory.map(IMAGE_BASE, mapped_image()).unwrap();
    memory.map(PATCH_SITE, vec![0x55, 0x8B, 0xEC, 0x83]).unwrap();
    memory
}

#[derive(Clone, Default)]
struct Store {
    bodies: Vec<Option<Vec<u8>>>,
    signatures: Vec<Option<Vec<u8>>>,
    types: Vec<String>,
}

impl Store {
    /// The packed form: three methods whose stored bodies are `ret` placeholders.
    fn packed() -> Self {
        Store {
            bodies: vec![Some(vec![0x06, 0x2A]); 3],
            signatures: Vec::new(),
            types: vec!["<Module>".to_string(), "Packer.Runtime".to_string()],
        }
    }
}

impl ModuleStore for Store {
    fn method_count(&self) -> u32 {
        self.bodies.len() as u32
    }

    fn has_body(&self, row: u32) -> Result<bool> {
        Ok(self.bodies[row as usize - 1].is_some())
    }

    fn method_body(&self, row: u32) -> Result<Option<Vec<u8>>> {
        Ok(self.bodies[row as usize - 1].clone())
    }

    fn replace_body(&mut self, row: u32, body: &MethodBody) -> Result<()> {
        let token = match &body.local_signature {
            Some(blob) => {
                self.signatures.push(Some(blob.clone()));
                Token::from_parts(Token::STANDALONE_SIG, self.signatures.len() as u32)
            }
            None => Token::new(0),
        };
        self.bodies[row as usize - 1] = Some(body.encode(token)?);
        Ok(())
    }

    fn global_static_constructor(&self) -> Option<Token> {
        Some(Token::method_def(1))
    }

    fn type_static_constructors(&self) -> Vec<Token> {
        Vec::new()
    }

    fn standalone_signature_count(&self) -> u32 {
        self.signatures.len() as u32
    }

    fn standalone_signature(&self, row: u32) -> Result<Option<Vec<u8>>> {
        Ok(self.signatures[row as usize - 1].clone())
    }

    fn set_standalone_signature(&mut self, row: u32, blob: &[u8]) -> Result<()> {
        self.signatures[row as usize - 1] = Some(blob.to_vec());
        Ok(())
    }

    fn remove_type(&mut self, full_name: &str) -> Result<bool> {
        let before = self.types.len();
        self.types.retain(|name| name != full_name);
        Ok(before != self.types.len())
    }

    fn write(&self, path: &Path, options: &WriteOptions) -> Result<()> {
        let mut text = format!("{}\n", options.preserve_row_ids);
        for body in &self.bodies {
            let line: String = body
                .iter()
                .flatten()
                .map(|byte| format!("{byte:02X}"))
                .collect();
            text.push_str(&line);
            text.push('\n');
        }
        text.push_str(&self.types.join(","));
        std::fs::write(path, text)?;
        Ok(())
    }
}

fn hex_bytes(line: &str) -> Vec<u8> {
    (0..line.len())
        .step_by(2)
        .map(|index| u8::from_str_radix(&line[index..index + 2], 16).unwrap())
        .collect()
}

/// Reads back the bodies written by [`Store::write`].
fn written_bodies(path: &Path) -> (String, Vec<MethodBody>, String) {
    let text = std::fs::read_to_string(path).unwrap();
    let mut lines = text.lines();
    let options = lines.next().unwrap().to_string();
    let mut lines: Vec<&str> = lines.collect();
    let types = lines.pop().unwrap().to_string();
    let bodies = lines
        .iter()
        .map(|line| MethodBody::decode(&hex_bytes(line)).unwrap())
        .collect();
    (options, bodies, types)
}

/// Opens the same module for the input and the snapshot.
struct Loader(Store);

impl ModuleLoader for Loader {
    fn load(&self, _path: &Path) -> Result<Box<dyn ModuleStore>> {
        Ok(Box::new(self.0.clone()))
    }

    fn load_bytes(&self, image: Vec<u8>) -> Result<Box<dyn ModuleStore>> {
        assert_eq!(&image[0x200..0x209], b"decrypted");
        Ok(Box::new(self.0.clone()))
    }
}

struct Introspection;

impl MethodIntrospection for Introspection {
    fn is_value_type_member(&self, _method: usize) -> Result<bool> {
        Ok(false)
    }

    fn instantiating_stub(&self, method: usize) -> Result<usize> {
        Ok(method)
    }

    fn unboxing_stub(&self, method: usize) -> Result<usize> {
        Ok(method)
    }
}

#[derive(Default)]
struct Host {
    invoked: RefCell<Vec<Token>>,
}

impl RuntimeHost for Host {
    fn modules(&self) -> RuntimeModules {
        modules()
    }

    fn module_handle(&self) -> usize {
        MODULE_HANDLE
    }

    fn image_base(&self) -> usize {
        IMAGE_BASE
    }

    fn method_handle(&self, token: Token) -> Result<Option<usize>> {
        Ok(Some(handle_of(token.row())))
    }

    fn invoke(&self, token: Token) -> Result<()> {
        self.invoked.borrow_mut().push(token);
        Ok(())
    }

    fn introspection(&self) -> Rc<dyn MethodIntrospection> {
        Rc::new(Introspection)
    }
}

/// Compiles the real code of each method through the installed hook.
struct Runtime {
    code: HashMap<usize, (&'static [u8], &'static [u8], u32)>,
    jit_info: Vec<usize>,
    table: Vec<usize>,
    /// Handles the prestub pushes through the compiler twice
    recompiled: Vec<usize>,
}

impl Runtime {
    fn new() -> Box<Self> {
        let mut table = vec![0usize; 12];
        table[8] = guarded_clause as usize;
        let mut runtime = Box::new(Runtime {
            code: HashMap::from([
                (handle_of(1), (&CCTOR[..], &[][..], 0)),
                (handle_of(2), (&GREETING[..], &[][..], 0)),
                (handle_of(3), (&GUARDED[..], &GUARDED_LOCALS[..], 1)),
            ]),
            jit_info: Vec::new(),
            table,
            recompiled: Vec::new(),
        });
        runtime.jit_info = vec![runtime.table.as_ptr() as usize];
        runtime
    }
}

impl MethodDescOps for Runtime {
    fn reset(&self, _method_desc: usize) -> Result<()> {
        Ok(())
    }

    fn do_prestub(&self, method_desc: usize) -> Result<usize> {
        let (code, locals, eh_count) = self.code[&method_desc];
        let mut info = CorInfoMethodInfo40 {
            ftn: method_desc,
            scope: MODULE_HANDLE,
            il_code: code.as_ptr() as usize,
            il_code_size: code.len() as u32,
            max_stack: 3,
            eh_count,
            options: CorInfoOptions::INIT_LOCALS.bits(),
            ..Default::default()
        };
        info.locals.num_args = locals.len() as u16;
        info.locals.args = locals.as_ptr() as usize;

        let jit_info = self.jit_info.as_ptr() as usize;
        let passes = if self.recompiled.contains(&method_desc) { 2 } else { 1 };
        let mut result = 0;
        for _ in 0..passes {
            result = unsafe {
                compile_method_entry(0, jit_info, &info as *const _ as usize, 0, 0, 0)
            };
        }
        Ok(result as usize)
    }

    fn is_unboxing_stub(&self, _method_desc: usize) -> Result<bool> {
        Ok(false)
    }

    fn wrapped_method(&self, method_desc: usize) -> Result<usize> {
        Ok(method_desc)
    }
}

/// A packer that routes calls through proxy methods and ships a runtime type.
struct ProxyPacker;

impl Unpacker for ProxyPacker {
    fn name(&self) -> &str {
        "Proxy"
    }

    fn needs_capture(&self, _context: &UnpackerContext, _row: u32) -> Result<bool> {
        Ok(true)
    }

    fn remove_runtime_support(
        &self,
        _context: &UnpackerContext,
        output: &mut dyn ModuleStore,
    ) -> Result<()> {
        output.remove_type("Packer.Runtime")?;
        Ok(())
    }

    fn token_resolver(&self) -> Rc<dyn TokenResolver> {
        Rc::new(|_: &OpCode, token: Token| -> Result<Token> {
            Ok(if token == Token::method_def(2) {
                Token::method_def(3)
            } else {
                token
            })
        })
    }
}

/// Leaves method 3 alone.
struct SelectivePacker;

impl Unpacker for SelectivePacker {
    fn name(&self) -> &str {
        "Selective"
    }

    fn needs_capture(&self, context: &UnpackerContext, row: u32) -> Result<bool> {
        Ok(row != 3 && context.original.has_body(row)?)
    }
}

struct SelectiveDetector;

impl UnpackerDetector for SelectiveDetector {
    fn detect(&self, _module: &dyn ModuleStore) -> Option<Box<dyn Unpacker>> {
        Some(Box::new(SelectivePacker))
    }
}

struct ProxyDetector;

impl UnpackerDetector for ProxyDetector {
    fn detect(&self, module: &dyn ModuleStore) -> Option<Box<dyn Unpacker>> {
        (module.method_count() == 3).then(|| Box::new(ProxyPacker) as Box<dyn Unpacker>)
    }
}

fn orchestrator(
    config: UnpackerConfig,
    input: &Path,
    module: Store,
    memory: Rc<BufferMemory>,
    host: Rc<Host>,
    runtime: Rc<Runtime>,
    detectors: Vec<Box<dyn UnpackerDetector>>,
) -> CaptureOrchestrator {
    let patches = BehaviorPatchSet::from_patches(
        memory.clone(),
        Architecture::X86,
        vec![BehaviorPatch::new(
            PatchIntent::NoInline,
            PATCH_SITE,
            vec![0x55, 0x8B, 0xEC, 0x83],
            vec![0x33, 0xC0, 0xC3, 0x90],
        )
        .unwrap()],
    );

    CaptureOrchestrator::new(
        config.with_hook_kind(HookKind::VTable),
        input,
        RuntimeEnvironment::new(Architecture::current(), modules()).unwrap(),
        OffsetTable::default(),
        patches,
        Collaborators {
            host,
            loader: Box::new(Loader(module)),
            memory,
            functions: runtime,
            detectors,
        },
    )
    .unwrap()
}

#[test]
fn recovers_packed_bodies() {
    let _lock = lock();
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("packed.exe");
    let memory = memory();
    let host = Rc::new(Host::default());

    let mut sweep = orchestrator(
        UnpackerConfig::new(),
        &input,
        Store::packed(),
        memory.clone(),
        host.clone(),
        Rc::from(Runtime::new()),
        Vec::new(),
    );
    let summary = sweep.run().unwrap();

    assert_eq!((summary.captured, summary.failed, summary.skipped), (3, 0, 0));
    assert_eq!(*host.invoked.borrow(), [Token::method_def(1)]);
    assert_eq!(memory.read_vec(PATCH_SITE, 4).unwrap(), [0x55, 0x8B, 0xEC, 0x83]);
    assert!(!sweep.dumper().is_hooked());

    let output = summary.output.unwrap();
    assert_eq!(output, dir.path().join("packed.jupk.exe"));
    let (options, bodies, types) = written_bodies(&output);
    assert_eq!(options, "false");
    assert_eq!(types, "<Module>,Packer.Runtime");
    assert_eq!(bodies.len(), 3);

    assert_eq!(bodies[0].instructions.len(), 2);
    assert_eq!(
        bodies[0].instructions[0].operand,
        Operand::Token(Token::method_def(2))
    );

    assert_eq!(bodies[1].max_stack, 3);
    assert_eq!(
        bodies[1].instructions[0].operand,
        Operand::Token(Token::new(0x7000_0001))
    );

    let guarded = &bodies[2];
    assert!(guarded.init_locals);
    assert_eq!(guarded.instructions.len(), 5);
    assert_eq!(guarded.exception_regions.len(), 1);
    assert_eq!(guarded.exception_regions[0].kind, HandlerKind::Finally);
    assert_eq!(guarded.instructions[2].operand, Operand::Target(4));
}

#[test]
fn packer_strategy_applies() {
    let _lock = lock();
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("proxied.dll");

    let mut sweep = orchestrator(
        UnpackerConfig::new().with_preserve_tokens(true),
        &input,
        Store::packed(),
        memory(),
        Rc::new(Host::default()),
        Rc::from(Runtime::new()),
        vec![Box::new(ProxyDetector)],
    );
    assert_eq!(sweep.unpacker().name(), "Proxy");
    let summary = sweep.run().unwrap();
    assert_eq!(summary.captured, 3);

    let (options, bodies, types) = written_bodies(&summary.output.unwrap());
    assert_eq!(options, "true");
    assert_eq!(types, "<Module>");
    assert_eq!(
        bodies[0].instructions[0].operand,
        Operand::Token(Token::method_def(3))
    );
}

#[test]
fn preserved_runtime_is_kept() {
    let _lock = lock();
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("proxied.dll");

    let mut sweep = orchestrator(
        UnpackerConfig::new().with_preserve_runtime(true),
        &input,
        Store::packed(),
        memory(),
        Rc::new(Host::default()),
        Rc::from(Runtime::new()),
        vec![Box::new(ProxyDetector)],
    );
    let summary = sweep.run().unwrap();
    let (_, _, types) = written_bodies(&summary.output.unwrap());
    assert_eq!(types, "<Module>,Packer.Runtime");
}

#[test]
fn only_needed_methods_change() {
    let _lock = lock();
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("partial.exe");

    let mut module = Store::packed();
    module.bodies[0] = None;

    let mut sweep = orchestrator(
        UnpackerConfig::new(),
        &input,
        module,
        memory(),
        Rc::new(Host::default()),
        Rc::from(Runtime::new()),
        vec![Box::new(SelectiveDetector)],
    );
    let summary = sweep.run().unwrap();
    assert_eq!((summary.captured, summary.failed, summary.skipped), (1, 0, 2));
    assert_eq!(sweep.dumper().dump_count(), 1);

    let text = std::fs::read_to_string(summary.output.unwrap()).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[1], "");
    assert_eq!(lines[3], "062A");

    let captured = MethodBody::decode(&hex_bytes(lines[2])).unwrap();
    assert_eq!(captured.instructions.len(), 3);
    assert_eq!(captured.max_stack, 3);
}

#[test]
fn repeated_capture_fails_method() {
    let _lock = lock();
    let dir = TempDir::new().unwrap();
    let input = dir.path().join("twice.exe");

    let mut runtime = Runtime::new();
    runtime.recompiled.push(handle_of(2));

    let mut sweep = orchestrator(
        UnpackerConfig::new(),
        &input,
        Store::packed(),
        memory(),
        Rc::new(Host::default()),
        Rc::from(runtime),
        Vec::new(),
    );
    let summary = sweep.run().unwrap();
    assert_eq!((summary.captured, summary.failed, summary.skipped), (2, 1, 0));
    assert_eq!(sweep.dumper().dump_count(), 4);

    let records = sweep.dumper().records();
    let failed: Vec<u32> = records
        .iter()
        .filter(|record| !record.success)
        .map(|record| record.row)
        .collect();
    assert_eq!(failed, [2]);

    let text = std::fs::read_to_string(summary.output.unwrap()).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[2], "062A");
    assert_ne!(lines[1], "062A");
    assert_ne!(lines[3], "062A");
}
