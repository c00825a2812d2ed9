//! In-memory stand-ins for the module store, the module loader and the runtime host.

use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    fmt::Write as _,
    path::Path,
    rc::Rc,
};

use crate::{
    assembler::MethodBody,
    hook::entry::compile_method_entry,
    module::{ModuleLoader, ModuleStore, WriteOptions},
    runtime::{
        corinfo::{CorInfoMethodInfo40, CorInfoOptions},
        environment::RuntimeModules,
        functions::MethodDescOps,
        host::RuntimeHost,
        identity::MethodIntrospection,
        memory::{BufferMemory, MemoryAccess},
    },
    test::hook_modules,
    token::Token,
    Error, Result,
};

/// A tiny `ret` body.
pub const TINY_RET: [u8; 2] = [0x06, 0x2A];

/// A module held as row-indexed byte vectors.
#[derive(Debug, Clone, Default)]
pub struct FakeModule {
    /// Encoded method bodies, index `row - 1`
    pub bodies: Vec<Option<Vec<u8>>>,
    /// `StandAloneSig` blobs, index `row - 1`
    pub signatures: Vec<Option<Vec<u8>>>,
    /// Static constructor of the module-global type
    pub global_cctor: Option<Token>,
    /// Static constructors of the other types
    pub type_cctors: Vec<Token>,
    /// Full names of the defined types
    pub types: Vec<String>,
}

impl FakeModule {
    /// `count` methods, each with a tiny `ret` body.
    pub fn with_methods(count: u32) -> Self {
        FakeModule {
            bodies: vec![Some(TINY_RET.to_vec()); count as usize],
            ..Default::default()
        }
    }

    /// Replaces the stored bytes of method `row`.
    pub fn set_body(&mut self, row: u32, body: Option<Vec<u8>>) {
        self.bodies[row as usize - 1] = body;
    }

    fn index(&self, row: u32) -> Result<usize> {
        match row {
            0 => Err(out_of_bounds_error!()),
            row if row as usize > self.bodies.len() => Err(out_of_bounds_error!()),
            row => Ok(row as usize - 1),
        }
    }
}

impl ModuleStore for FakeModule {
    fn method_count(&self) -> u32 {
        self.bodies.len() as u32
    }

    fn has_body(&self, row: u32) -> Result<bool> {
        Ok(self.bodies[self.index(row)?].is_some())
    }

    fn method_body(&self, row: u32) -> Result<Option<Vec<u8>>> {
        Ok(self.bodies[self.index(row)?].clone())
    }

    fn replace_body(&mut self, row: u32, body: &MethodBody) -> Result<()> {
        let index = self.index(row)?;
        let token = match &body.local_signature {
            Some(blob) => {
                self.signatures.push(Some(blob.clone()));
                Token::from_parts(Token::STANDALONE_SIG, self.signatures.len() as u32)
            }
            None => Token::new(0),
        };
        self.bodies[index] = Some(body.encode(token)?);
        Ok(())
    }

    fn global_static_constructor(&self) -> Option<Token> {
        self.global_cctor
    }

    fn type_static_constructors(&self) -> Vec<Token> {
        self.type_cctors.clone()
    }

    fn standalone_signature_count(&self) -> u32 {
        self.signatures.len() as u32
    }

    fn standalone_signature(&self, row: u32) -> Result<Option<Vec<u8>>> {
        (row as usize)
            .checked_sub(1)
            .and_then(|index| self.signatures.get(index))
            .cloned()
            .ok_or(out_of_bounds_error!())
    }

    fn set_standalone_signature(&mut self, row: u32, blob: &[u8]) -> Result<()> {
        let slot = (row as usize)
            .checked_sub(1)
            .and_then(|index| self.signatures.get_mut(index))
            .ok_or(out_of_bounds_error!())?;
        *slot = Some(blob.to_vec());
        Ok(())
    }

    fn remove_type(&mut self, full_name: &str) -> Result<bool> {
        let before = self.types.len();
        self.types.retain(|name| name != full_name);
        Ok(self.types.len() != before)
    }

    fn write(&self, path: &Path, options: &WriteOptions) -> Result<()> {
        let mut text = format!("{options:?}\n");
        let hex = |bytes: Option<&[u8]>| match bytes {
            Some(bytes) => bytes.iter().map(|byte| format!("{byte:02X}")).collect(),
            None => "-".to_string(),
        };
        for (index, body) in self.bodies.iter().enumerate() {
            let _ = writeln!(text, "method {} {}", index + 1, hex(body.as_deref()));
        }
        for (index, blob) in self.signatures.iter().enumerate() {
            let _ = writeln!(text, "sig {} {}", index + 1, hex(blob.as_deref()));
        }
        for name in &self.types {
            let _ = writeln!(text, "type {name}");
        }
        std::fs::write(path, text)?;
        Ok(())
    }
}

/// Opens `original` for the input path and `output` for any snapshot, keeping the snapshots.
pub struct FakeLoader {
    /// Module returned by `load`
    pub original: FakeModule,
    /// Module returned by `load_bytes`
    pub output: FakeModule,
    /// Every image passed to `load_bytes`
    pub snapshots: Rc<RefCell<Vec<Vec<u8>>>>,
}

impl FakeLoader {
    pub fn new(original: FakeModule, output: FakeModule) -> Self {
        FakeLoader {
            original,
            output,
            snapshots: Rc::new(RefCell::new(Vec::new())),
        }
    }
}

impl ModuleLoader for FakeLoader {
    fn load(&self, path: &Path) -> Result<Box<dyn ModuleStore>> {
        if path.as_os_str().is_empty() {
            return Err(Error::Error("empty input path".to_string()));
        }
        Ok(Box::new(self.original.clone()))
    }

    fn load_bytes(&self, image: Vec<u8>) -> Result<Box<dyn ModuleStore>> {
        self.snapshots.borrow_mut().push(image);
        Ok(Box::new(self.output.clone()))
    }
}

/// Reports every method as a reference-type member.
pub struct FakeIntrospection;

impl MethodIntrospection for FakeIntrospection {
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

/// Module handle reported by [`FakeHost`].
pub const FAKE_MODULE_HANDLE: usize = 0x7700;

/// Image base reported by [`FakeHost`].
pub const FAKE_IMAGE_BASE: usize = 0x0040_0000;

/// Byte [`FakeHost::invoke`] writes to the start of the image's `.text` section.
pub const STATIC_INIT_MARKER: u8 = 0xC7;

/// Runtime host over [`hook_modules`] with a fixed row-to-handle map.
pub struct FakeHost {
    /// Method handles by `MethodDef` row
    pub handles: HashMap<u32, usize>,
    /// Tokens passed to `invoke`
    pub invoked: RefCell<Vec<Token>>,
    /// Memory holding the mapped image, marked on `invoke`
    pub memory: Option<Rc<BufferMemory>>,
}

impl FakeHost {
    /// Rows `rows` get handles `0x8000 + row * 0x10`.
    pub fn new(rows: impl IntoIterator<Item = u32>, memory: Option<Rc<BufferMemory>>) -> Self {
        FakeHost {
            handles: rows.into_iter().map(|row| (row, handle_of(row))).collect(),
            invoked: RefCell::new(Vec::new()),
            memory,
        }
    }
}

/// Handle [`FakeHost`] assigns to method `row`.
pub fn handle_of(row: u32) -> usize {
    0x8000 + row as usize * 0x10
}

impl RuntimeHost for FakeHost {
    fn modules(&self) -> RuntimeModules {
        hook_modules()
    }

    fn module_handle(&self) -> usize {
        FAKE_MODULE_HANDLE
    }

    fn image_base(&self) -> usize {
        FAKE_IMAGE_BASE
    }

    fn method_handle(&self, token: Token) -> Result<Option<usize>> {
        Ok(self.handles.get(&token.row()).copied())
    }

    fn invoke(&self, token: Token) -> Result<()> {
        self.invoked.borrow_mut().push(token);
        if let Some(memory) = &self.memory {
            memory.write(FAKE_IMAGE_BASE + 0x1000, &[STATIC_INIT_MARKER])?;
        }
        Ok(())
    }

    fn introspection(&self) -> Rc<dyn MethodIntrospection> {
        Rc::new(FakeIntrospection)
    }
}

/// Method-descriptor routines whose prestub calls the installed compile entry directly.
#[derive(Default)]
pub struct FakeMethods {
    /// IL code compiled for each handle; handles without an entry compile `ret`
    pub code: HashMap<usize, Vec<u8>>,
    /// Handles whose prestub returns without compiling
    pub precompiled: HashSet<usize>,
    /// Handles whose prestub fails
    pub failing: HashSet<usize>,
    /// Handles whose prestub raises a native fault
    pub faulting: HashSet<usize>,
    /// Handles passed to `reset`
    pub resets: RefCell<Vec<usize>>,
}

impl MethodDescOps for FakeMethods {
    fn reset(&self, method_desc: usize) -> Result<()> {
        self.resets.borrow_mut().push(method_desc);
        Ok(())
    }

    fn do_prestub(&self, method_desc: usize) -> Result<usize> {
        if self.failing.contains(&method_desc) {
            return Err(Error::Error(format!("prestub of 0x{method_desc:X} failed")));
        }
        if self.faulting.contains(&method_desc) {
            return Err(Error::NativeFault(format!(
                "access violation in the prestub of 0x{method_desc:X}"
            )));
        }
        if self.precompiled.contains(&method_desc) {
            return Ok(0);
        }

        let code = self
            .code
            .get(&method_desc)
            .cloned()
            .unwrap_or_else(|| vec![0x2A]);
        let info = CorInfoMethodInfo40 {
            ftn: method_desc,
            scope: FAKE_MODULE_HANDLE,
            il_code: code.as_ptr() as usize,
            il_code_size: code.len() as u32,
            max_stack: 2,
            options: CorInfoOptions::INIT_LOCALS.bits(),
            ..Default::default()
        };

        let result = unsafe {
            compile_method_entry(0, 0, &info as *const _ as usize, 0, 0, 0)
        };
        Ok(result as usize)
    }

    fn is_unboxing_stub(&self, _method_desc: usize) -> Result<bool> {
        Ok(false)
    }

    fn wrapped_method(&self, method_desc: usize) -> Result<usize> {
        Ok(method_desc)
    }
}
