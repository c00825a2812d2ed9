//! The capture sweep.
//!
//! A [`CaptureOrchestrator`] drives one packed module from load to output:
//!
//! 1. apply the behavior patches (no inlining, no static initialization on compile)
//! 2. install the compiler hook with no target armed
//! 3. run the strategy's pre-initialization
//! 4. run the module's static constructor so the packer decrypts its metadata
//! 5. snapshot the mapped image (before step 4 if configured)
//! 6. load the snapshot as the output module
//! 7. run the strategy's post-initialization
//! 8. force every method that needs it through the compiler, capturing its body and
//!    installing it once exactly one capture is confirmed
//! 9. remove the hook and restore the patched bytes
//! 10. strip the packer's runtime support unless preserved
//! 11. give every empty standalone signature a placeholder
//! 12. write the output module if anything was captured
//!
//! Failures before step 8 abort the sweep; failures of a single method in step 8 are logged
//! and counted. The hook and the patches are taken down even when the sweep aborts.

use std::{
    path::{Path, PathBuf},
    rc::Rc,
};

use crate::{
    assembler::{instructions, MethodBody},
    capture::{sigwalk::LOCAL_SIG_PLACEHOLDER, MethodDumper},
    config::UnpackerConfig,
    hook::{create_hook, HookContext},
    module::{output_slot, ModuleLoader, ModuleStore},
    runtime::{
        environment::RuntimeEnvironment,
        functions::{MethodDescOps, NativeMethodFunctions},
        host::RuntimeHost,
        identity::resolver_for,
        memory::{MemoryAccess, ProcessMemory},
        offsets::OffsetTable,
        patch::BehaviorPatchSet,
        thunk::ThunkFactory,
    },
    snapshot,
    token::Token,
    unpacker::{self, Unpacker, UnpackerContext, UnpackerDetector},
    Error, Result,
};

/// Result of a completed sweep.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CaptureSummary {
    /// Methods whose bodies were captured
    pub captured: usize,
    /// Methods whose capture failed
    pub failed: usize,
    /// Methods not captured because the strategy or the runtime ruled them out
    pub skipped: usize,
    /// Path of the written output module, `None` if nothing was captured
    pub output: Option<PathBuf>,
}

/// The collaborators a sweep runs against.
pub struct Collaborators {
    /// Runtime services
    pub host: Rc<dyn RuntimeHost>,
    /// Module reader and writer
    pub loader: Box<dyn ModuleLoader>,
    /// The address space of the runtime
    pub memory: Rc<dyn MemoryAccess>,
    /// Method-descriptor routines
    pub functions: Rc<dyn MethodDescOps>,
    /// Packer detectors, tried in order
    pub detectors: Vec<Box<dyn UnpackerDetector>>,
}

/// Drives one capture sweep.
pub struct CaptureOrchestrator {
    context: UnpackerContext,
    unpacker: Box<dyn Unpacker>,
    patches: BehaviorPatchSet,
    dumper: MethodDumper,
    loader: Box<dyn ModuleLoader>,
    memory: Rc<dyn MemoryAccess>,
    input: PathBuf,
}

impl CaptureOrchestrator {
    /// Prepares a sweep inside the current process.
    ///
    /// Loads and verifies the offset table, binds the execution engine's routines and
    /// reads every patch site. Nothing is modified yet.
    ///
    /// # Errors
    /// Returns the first setup failure: unsupported runtime, missing or mismatching
    /// offsets, unexpected code at a patch site, or an unreadable input.
    ///
    /// # Safety
    ///
    /// `host` must describe the runtime hosting this process, and no other code may patch
    /// the same runtime while the orchestrator exists.
    pub unsafe fn attach(
        config: UnpackerConfig,
        input: &Path,
        host: Rc<dyn RuntimeHost>,
        loader: Box<dyn ModuleLoader>,
        detectors: Vec<Box<dyn UnpackerDetector>>,
    ) -> Result<Self> {
        let environment = RuntimeEnvironment::detect(host.modules())?;
        log::info!(
            "Runtime {} ({}, {})",
            environment.modules.clr_version,
            environment.flavor,
            environment.architecture
        );

        let offsets = OffsetTable::load(&config.offsets_directory, &environment)?;
        // SAFETY: the caller guarantees this process hosts the described runtime.
        let memory: Rc<dyn MemoryAccess> = Rc::new(unsafe { ProcessMemory::new() });
        let thunks = ThunkFactory::new(environment.architecture);
        // SAFETY: `offsets` was verified against the loaded modules.
        let functions = unsafe {
            NativeMethodFunctions::bind(memory.clone(), &environment, &offsets, &thunks)?
        };
        let patches = BehaviorPatchSet::for_runtime(memory.clone(), &environment, &offsets)?;

        Self::new(
            config,
            input,
            environment,
            offsets,
            patches,
            Collaborators {
                host,
                loader,
                memory,
                functions: Rc::new(functions),
                detectors,
            },
        )
    }

    /// Prepares a sweep from explicit parts.
    ///
    /// # Errors
    /// Returns an error if the input cannot be loaded or the hook cannot be created.
    pub fn new(
        config: UnpackerConfig,
        input: &Path,
        environment: RuntimeEnvironment,
        offsets: OffsetTable,
        patches: BehaviorPatchSet,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let Collaborators {
            host,
            loader,
            memory,
            functions,
            detectors,
        } = collaborators;

        let original = loader.load(input)?;
        let unpacker = unpacker::detect(&detectors, original.as_ref());
        log::info!(
            "{} - {} methods, packer: {}",
            input.display(),
            original.method_count(),
            unpacker.name()
        );

        let thunks = ThunkFactory::new(environment.architecture);
        let hook = create_hook(
            config.hook_kind,
            HookContext {
                environment,
                offsets,
                memory: memory.clone(),
                thunks,
                resolver: resolver_for(environment.flavor, host.introspection()),
            },
        )?;

        let output = output_slot();
        let dumper = MethodDumper::new(
            hook,
            host.module_handle(),
            output.clone(),
            unpacker.token_resolver(),
            environment.flavor,
            thunks,
        );

        Ok(CaptureOrchestrator {
            context: UnpackerContext {
                config,
                environment,
                original,
                output,
                host,
                functions,
            },
            unpacker,
            patches,
            dumper,
            loader,
            memory,
            input: input.to_path_buf(),
        })
    }

    /// The session state shared with the strategy.
    #[must_use]
    pub fn context(&self) -> &UnpackerContext {
        &self.context
    }

    /// The strategy selected for the module.
    #[must_use]
    pub fn unpacker(&self) -> &dyn Unpacker {
        self.unpacker.as_ref()
    }

    /// The capture state machine, e.g. for its records after a sweep.
    #[must_use]
    pub fn dumper(&self) -> &MethodDumper {
        &self.dumper
    }

    /// Runs the sweep.
    ///
    /// # Errors
    /// Returns the first fatal failure. Per-method failures are counted in the summary.
    pub fn run(&mut self) -> Result<CaptureSummary> {
        self.patches.apply()?;
        if let Err(error) = self.dumper.hook() {
            if let Err(restore) = self.patches.restore() {
                log::error!("Failed to restore runtime patches - {restore}");
            }
            return Err(error);
        }

        let sweep = self.initialize().map(|()| self.sweep());
        let teardown = self.teardown();
        let mut summary = sweep?;
        teardown?;

        self.finish(&mut summary)?;
        log::info!(
            "Captured {} methods, {} failed, {} skipped",
            summary.captured,
            summary.failed,
            summary.skipped
        );
        Ok(summary)
    }

    fn initialize(&mut self) -> Result<()> {
        self.unpacker.pre_initialize(&self.context)?;

        let constructor = select_static_constructor(self.context.original.as_ref())?;
        if constructor.is_none() {
            log::warn!("No static constructor found, snapshotting the image as loaded");
        }

        let image = if self.context.config.dump_before_static_constructor {
            let image = self.snapshot()?;
            self.run_static_constructor(constructor)?;
            image
        } else {
            self.run_static_constructor(constructor)?;
            self.snapshot()?
        };

        let output = self.loader.load_bytes(image)?;
        *self.context.output.borrow_mut() = Some(output);

        self.unpacker.post_initialize(&self.context)
    }

    fn run_static_constructor(&self, constructor: Option<Token>) -> Result<()> {
        if let Some(token) = constructor {
            log::info!("Running static constructor {token}");
            self.context.host.invoke(token)?;
        }
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        snapshot::reconstruct(self.memory.as_ref(), self.context.host.image_base())
    }

    fn sweep(&mut self) -> CaptureSummary {
        let mut summary = CaptureSummary::default();
        let count = self.context.original.method_count();

        for row in 1..=count {
            let token = Token::method_def(row);
            match self.capture(row) {
                Ok(true) => summary.captured += 1,
                Ok(false) => summary.skipped += 1,
                Err(error) => {
                    log::error!("Failed to capture 0x{:08X} - {}", token.value(), cause_chain(&error));
                    self.dumper.record_failure(row);
                    summary.failed += 1;
                }
            }
        }

        summary
    }

    /// Captures method `row`. Returns `false` if it is skipped.
    fn capture(&self, row: u32) -> Result<bool> {
        let token = Token::method_def(row);
        let wrap = |error: Error| Error::Capture {
            token,
            source: Box::new(error),
        };

        let Some(handle) = self.context.host.method_handle(token).map_err(wrap)? else {
            log::debug!("{token} has no method handle");
            return Ok(false);
        };
        if !self.unpacker.needs_capture(&self.context, row).map_err(wrap)? {
            return Ok(false);
        }

        let before = self.dumper.dump_count();
        self.dumper.set_target_method(row, handle);
        let compiled = self.unpacker.force_compile(&self.context, handle);
        self.dumper.set_idle();
        let staged = self.dumper.take_staged();

        if let Some(error) = self.dumper.take_error() {
            return Err(wrap(error));
        }
        compiled.map_err(wrap)?;

        let actual = self.dumper.dump_count() - before;
        let (staged_row, body) = match staged {
            Some(staged) if actual == 1 => staged,
            _ => {
                return Err(wrap(Error::CaptureCountMismatch {
                    expected: 1,
                    actual,
                }))
            }
        };

        self.dumper.install(staged_row, &body).map_err(wrap)?;
        Ok(true)
    }

    fn teardown(&mut self) -> Result<()> {
        let unhooked = self.dumper.unhook();
        let restored = self.patches.restore();
        unhooked.and(restored)
    }

    fn finish(&mut self, summary: &mut CaptureSummary) -> Result<()> {
        let Some(mut output) = self.context.output.borrow_mut().take() else {
            return Err(Error::NoOutputModule);
        };

        if self.context.config.removes_runtime_support() {
            self.unpacker
                .remove_runtime_support(&self.context, output.as_mut())?;
        }

        let filled = fill_standalone_signatures(output.as_mut())?;
        if filled > 0 {
            log::debug!("Filled {filled} empty standalone signatures");
        }

        if summary.captured > 0 {
            let path = self.context.config.output_path(&self.input);
            output.write(&path, &self.context.config.write_options())?;
            log::info!("Saved to {}", path.display());
            summary.output = Some(path);
        }

        *self.context.output.borrow_mut() = Some(output);
        Ok(())
    }
}

/// Picks the static constructor that starts the packer: the module-global type's, or the
/// first type-level one whose body is exactly `call <MethodDef>; ret`.
///
/// # Errors
/// Returns an error if a candidate's body cannot be read from the module.
pub fn select_static_constructor(module: &dyn ModuleStore) -> Result<Option<Token>> {
    if let Some(token) = module.global_static_constructor() {
        return Ok(Some(token));
    }

    for token in module.type_static_constructors() {
        let Some(data) = module.method_body(token.row())? else {
            continue;
        };
        match MethodBody::decode(&data) {
            Ok(body) if is_trampoline(&body) => return Ok(Some(token)),
            Ok(_) => {}
            Err(error) => log::debug!("Skipping static constructor {token} - {error}"),
        }
    }

    Ok(None)
}

fn is_trampoline(body: &MethodBody) -> bool {
    match body.instructions.as_slice() {
        [call, ret] => {
            call.opcode.value == instructions::CALL
                && call
                    .token()
                    .is_some_and(|target| target.table() == Token::METHOD_DEF)
                && ret.opcode.value == instructions::RET
        }
        _ => false,
    }
}

/// Gives every `StandAloneSig` row without a blob the placeholder local signature.
/// Returns the number of rows filled.
///
/// # Errors
/// Returns an error if a row cannot be read or written.
pub fn fill_standalone_signatures(module: &mut dyn ModuleStore) -> Result<usize> {
    let mut filled = 0;
    for row in 1..=module.standalone_signature_count() {
        if module.standalone_signature(row)?.is_none() {
            module.set_standalone_signature(row, &LOCAL_SIG_PLACEHOLDER)?;
            filled += 1;
        }
    }
    Ok(filled)
}

fn cause_chain(error: &Error) -> String {
    let mut chain = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(cause) = source {
        chain.push_str(" <- ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    chain
}
