//! Packer-specific behavior around a capture sweep.
//!
//! A packer may need work before or after the module initializes, may only encrypt some
//! methods, may need a special way to reach the compiler, may remap tokens inside the
//! code it hands over and usually leaves runtime support code behind. [`Unpacker`] exposes
//! those extension points; [`UnpackerDetector`]s pick a strategy for a module and the
//! [`UnknownUnpacker`] covers everything no detector claims.

use std::rc::Rc;

use crate::{
    assembler::{IdentityResolver, TokenResolver},
    config::UnpackerConfig,
    module::{ModuleStore, OutputSlot},
    runtime::{environment::RuntimeEnvironment, functions::{self, MethodDescOps}, host::RuntimeHost},
    Result,
};

/// Everything a strategy may consult during a sweep.
pub struct UnpackerContext {
    /// Session configuration
    pub config: UnpackerConfig,
    /// Runtime the module is loaded into
    pub environment: RuntimeEnvironment,
    /// The packed module as read from disk
    pub original: Box<dyn ModuleStore>,
    /// The module that receives captured bodies
    pub output: OutputSlot,
    /// Runtime services
    pub host: Rc<dyn RuntimeHost>,
    /// Method-descriptor routines of the execution engine
    pub functions: Rc<dyn MethodDescOps>,
}

/// A packer-specific strategy.
pub trait Unpacker {
    /// Display name of the packer.
    fn name(&self) -> &str;

    /// Runs before the module's static constructor.
    ///
    /// # Errors
    /// Any error aborts the sweep.
    fn pre_initialize(&self, _context: &UnpackerContext) -> Result<()> {
        Ok(())
    }

    /// Runs after the snapshot has been loaded as the output module.
    ///
    /// # Errors
    /// Any error aborts the sweep.
    fn post_initialize(&self, _context: &UnpackerContext) -> Result<()> {
        Ok(())
    }

    /// `true` if method `row` must be captured.
    ///
    /// # Errors
    /// An error fails this method only.
    fn needs_capture(&self, context: &UnpackerContext, row: u32) -> Result<bool>;

    /// Pushes `method_handle` through the compiler.
    ///
    /// # Errors
    /// An error fails this method only.
    fn force_compile(&self, context: &UnpackerContext, method_handle: usize) -> Result<()> {
        functions::force_compile(context.functions.as_ref(), method_handle)
    }

    /// Removes the packer's runtime support code from the output module.
    ///
    /// # Errors
    /// Any error aborts the sweep before the output is written.
    fn remove_runtime_support(
        &self,
        _context: &UnpackerContext,
        _output: &mut dyn ModuleStore,
    ) -> Result<()> {
        Ok(())
    }

    /// Resolver applied to the tokens of captured code.
    fn token_resolver(&self) -> Rc<dyn TokenResolver> {
        Rc::new(IdentityResolver)
    }
}

/// Recognizes one packer.
pub trait UnpackerDetector {
    /// Returns the strategy for `module` if it carries this detector's packer.
    fn detect(&self, module: &dyn ModuleStore) -> Option<Box<dyn Unpacker>>;
}

/// Runs `detectors` in order and returns the first match, or the [`UnknownUnpacker`].
#[must_use]
pub fn detect(detectors: &[Box<dyn UnpackerDetector>], module: &dyn ModuleStore) -> Box<dyn Unpacker> {
    detectors
        .iter()
        .find_map(|detector| detector.detect(module))
        .unwrap_or_else(|| Box::new(UnknownUnpacker))
}

/// Strategy for modules no detector recognizes: every method with a body is captured.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnknownUnpacker;

impl Unpacker for UnknownUnpacker {
    fn name(&self) -> &str {
        "Unknown"
    }

    fn needs_capture(&self, context: &UnpackerContext, row: u32) -> Result<bool> {
        context.original.has_body(row)
    }
}
