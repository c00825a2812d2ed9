//! The per-method capture state machine.
//!
//! A [`MethodDumper`] owns the compiler hook for a session. The session arms it with one
//! target method at a time and forces that method through the compiler; the hook callback
//! then reads the compile request, reconstructs the body and stages it, and declines the
//! compilation. The session installs a staged body into the output module once it has
//! confirmed that the force-compile produced exactly one capture.
//!
//! ```text
//! Waiting --(target compile observed)--> Dumping --(body staged)--> Finished
//!    ^                                                                 |
//!    +----------------------------(set_idle)---------------------------+
//! ```

use std::{
    cell::{Cell, OnceCell, RefCell},
    rc::Rc,
};

use strum::Display;

use crate::{
    assembler::{BodyAssembler, MethodBody, TokenResolver},
    capture::{
        eh::EhInfoReader,
        sigwalk::{read_local_sig, RawSigReader},
    },
    hook::{CompilationEvent, CompilerHook, Interception},
    module::OutputSlot,
    runtime::{corinfo::CorInfoOptions, environment::RuntimeFlavor, thunk::ThunkFactory},
    token::Token,
    Error, Result,
};

/// Progress of the current capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum DumpingState {
    /// Armed or idle, no target compile observed yet
    Waiting,
    /// Inside the callback for the target
    Dumping,
    /// The target's body has been staged
    Finished,
}

/// Outcome of one capture attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRecord {
    /// `MethodDef` row of the target
    pub row: u32,
    /// `true` if the body was captured
    pub success: bool,
    /// Instruction bytes as seen by the compiler, empty on failure
    pub code: Vec<u8>,
    /// Successful captures so far, including this one
    pub total: usize,
}

impl CaptureRecord {
    /// `MethodDef` token of the target.
    #[must_use]
    pub fn token(&self) -> Token {
        Token::method_def(self.row)
    }
}

struct DumperShared {
    state: Cell<DumpingState>,
    target_row: Cell<Option<u32>>,
    dump_count: Cell<usize>,
    records: RefCell<Vec<CaptureRecord>>,
    staged: RefCell<Option<(u32, MethodBody)>>,
    output: OutputSlot,
    resolver: Rc<dyn TokenResolver>,
    flavor: RuntimeFlavor,
    thunks: ThunkFactory,
    eh_reader: OnceCell<EhInfoReader>,
}

/// Drives a [`CompilerHook`] to capture one method per compile.
pub struct MethodDumper {
    hook: Box<dyn CompilerHook>,
    shared: Rc<DumperShared>,
}

impl MethodDumper {
    /// Takes over `hook`, restricting it to `module_handle` and storing captured bodies in
    /// `output`.
    #[must_use]
    pub fn new(
        hook: Box<dyn CompilerHook>,
        module_handle: usize,
        output: OutputSlot,
        resolver: Rc<dyn TokenResolver>,
        flavor: RuntimeFlavor,
        thunks: ThunkFactory,
    ) -> Self {
        let shared = Rc::new(DumperShared {
            state: Cell::new(DumpingState::Waiting),
            target_row: Cell::new(None),
            dump_count: Cell::new(0),
            records: RefCell::new(Vec::new()),
            staged: RefCell::new(None),
            output,
            resolver,
            flavor,
            thunks,
            eh_reader: OnceCell::new(),
        });

        hook.set_target_module(module_handle);
        let callback_state = shared.clone();
        hook.set_callback(Some(Rc::new(move |event: &mut CompilationEvent| {
            callback_state.capture(event)
        })));

        MethodDumper { hook, shared }
    }

    /// Installs the hook with no target armed.
    ///
    /// # Errors
    /// Propagates installation errors of the hook.
    pub fn hook(&mut self) -> Result<()> {
        self.set_idle();
        self.hook.hook()
    }

    /// Removes the hook and disarms the target.
    ///
    /// # Errors
    /// Propagates removal errors of the hook.
    pub fn unhook(&mut self) -> Result<()> {
        self.hook.unhook()?;
        self.set_idle();
        Ok(())
    }

    /// `true` while the hook is installed.
    #[must_use]
    pub fn is_hooked(&self) -> bool {
        self.hook.is_hooked()
    }

    /// Arms method `row`, whose runtime handle is `method_handle`.
    pub fn set_target_method(&self, row: u32, method_handle: usize) {
        self.shared.staged.borrow_mut().take();
        self.shared.target_row.set(Some(row));
        self.shared.state.set(DumpingState::Waiting);
        self.hook.set_target_method(method_handle);
    }

    /// Disarms the target; every compilation is forwarded until the next arm.
    pub fn set_idle(&self) {
        self.shared.target_row.set(None);
        self.shared.state.set(DumpingState::Waiting);
        self.hook.set_target_method(0);
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> DumpingState {
        self.shared.state.get()
    }

    /// Successful captures so far.
    #[must_use]
    pub fn dump_count(&self) -> usize {
        self.shared.dump_count.get()
    }

    /// Records of all capture attempts in order.
    #[must_use]
    pub fn records(&self) -> Vec<CaptureRecord> {
        self.shared.records.borrow().clone()
    }

    /// Notes a failed attempt for `row`.
    pub fn record_failure(&self, row: u32) {
        self.shared.records.borrow_mut().push(CaptureRecord {
            row,
            success: false,
            code: Vec::new(),
            total: self.shared.dump_count.get(),
        });
    }

    /// Takes the error raised by the last callback, if any.
    pub fn take_error(&self) -> Option<Error> {
        self.hook.take_error()
    }

    /// Takes the body captured since the last arm, with its `MethodDef` row.
    ///
    /// A repeated capture of the same arm replaces the staged body.
    pub fn take_staged(&self) -> Option<(u32, MethodBody)> {
        self.shared.staged.borrow_mut().take()
    }

    /// Stores `body` as method `row` of the output module.
    ///
    /// # Errors
    /// Returns [`crate::Error::NoOutputModule`] if the output slot is empty, or the error of
    /// the module store.
    pub fn install(&self, row: u32, body: &MethodBody) -> Result<()> {
        let mut output = self.shared.output.borrow_mut();
        let module = output.as_mut().ok_or(Error::NoOutputModule)?;
        module.replace_body(row, body)
    }
}

impl DumperShared {
    fn capture(&self, event: &mut CompilationEvent) -> Result<Interception> {
        let Some(row) = self.target_row.get() else {
            return Ok(Interception::Forward);
        };
        self.state.set(DumpingState::Dumping);

        let request = event
            .request()
            .ok_or(Error::HookState("compile event without method info"))?;
        let code = request.il_code();

        let locals = match request.locals_count() {
            0 => None,
            count => {
                // SAFETY: the runtime keeps the locals signature alive for the compile call.
                let mut reader =
                    unsafe { RawSigReader::new(request.locals_start(), RawSigReader::DEFAULT_LIMIT) };
                match read_local_sig(&mut reader, u32::from(count)) {
                    Ok(blob) => Some(blob),
                    Err(error) => {
                        log::warn!(
                            "Unable to read the locals of {} - {error}",
                            Token::method_def(row)
                        );
                        None
                    }
                }
            }
        };

        let clauses = match request.eh_count() {
            0 => Vec::new(),
            count => {
                let reader = match self.eh_reader.get() {
                    Some(reader) => *reader,
                    None => {
                        // SAFETY: `jit_info` is the live interface of this compile call.
                        let reader = unsafe {
                            EhInfoReader::locate(self.flavor, event.jit_info(), &self.thunks)?
                        };
                        *self.eh_reader.get_or_init(|| reader)
                    }
                };
                // SAFETY: as above; `count` comes from the same request.
                unsafe { reader.read_clauses(event.jit_info(), request.method_handle(), count) }
            }
        };

        let body = BodyAssembler::new(self.resolver.as_ref()).assemble(
            code,
            request.max_stack(),
            request.options().contains(CorInfoOptions::INIT_LOCALS),
            locals.as_deref(),
            &clauses,
        )?;

        if self.output.borrow().is_none() {
            return Err(Error::NoOutputModule);
        }
        *self.staged.borrow_mut() = Some((row, body));

        let total = self.dump_count.get() + 1;
        self.dump_count.set(total);
        self.records.borrow_mut().push(CaptureRecord {
            row,
            success: true,
            code: code.to_vec(),
            total,
        });
        self.state.set(DumpingState::Finished);
        log::debug!(
            "Captured {} ({} bytes, {} clauses)",
            Token::method_def(row),
            code.len(),
            clauses.len()
        );

        Ok(Interception::Claimed)
    }
}
