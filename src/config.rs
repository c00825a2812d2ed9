//! Configuration of a capture session.

use std::path::{Path, PathBuf};

use crate::{hook::HookKind, module::WriteOptions};

/// Default suffix inserted before the extension of the output file.
pub const DEFAULT_OUTPUT_SUFFIX: &str = ".jupk";

/// Configuration of a capture session.
///
/// The `preserve_*` and `keep_*` switches only affect how the output module is written;
/// `preserve_all` turns all of them on.
#[derive(Debug, Clone)]
pub struct UnpackerConfig {
    /// Compiler hook strategy (default: inline).
    pub hook_kind: HookKind,

    /// Directory holding the runtime offset tables (default: current directory).
    pub offsets_directory: PathBuf,

    /// Take the image snapshot before running the module's static constructor
    /// (default: false).
    pub dump_before_static_constructor: bool,

    /// Keep the packer's runtime support code in the output (default: false).
    pub preserve_runtime: bool,

    /// Keep metadata row ids and heap offsets unchanged (default: false).
    pub preserve_tokens: bool,

    /// Keep the captured max-stack values instead of recomputing them (default: false).
    pub keep_max_stacks: bool,

    /// Shorthand for every `preserve_*` / `keep_*` switch (default: false).
    pub preserve_all: bool,

    /// Inserted before the input's extension to name the output (default: `.jupk`).
    pub output_suffix: String,
}

impl Default for UnpackerConfig {
    fn default() -> Self {
        Self {
            hook_kind: HookKind::Inline,
            offsets_directory: PathBuf::from("."),
            dump_before_static_constructor: false,
            preserve_runtime: false,
            preserve_tokens: false,
            keep_max_stacks: false,
            preserve_all: false,
            output_suffix: DEFAULT_OUTPUT_SUFFIX.to_string(),
        }
    }
}

impl UnpackerConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the hook strategy.
    #[must_use]
    pub fn with_hook_kind(mut self, hook_kind: HookKind) -> Self {
        self.hook_kind = hook_kind;
        self
    }

    /// Sets the directory of the offset tables.
    #[must_use]
    pub fn with_offsets_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.offsets_directory = directory.into();
        self
    }

    /// Snapshots the image before the static constructor runs.
    #[must_use]
    pub fn with_dump_before_static_constructor(mut self, enabled: bool) -> Self {
        self.dump_before_static_constructor = enabled;
        self
    }

    /// Keeps the packer's runtime support code.
    #[must_use]
    pub fn with_preserve_runtime(mut self, enabled: bool) -> Self {
        self.preserve_runtime = enabled;
        self
    }

    /// Keeps row ids and heap offsets.
    #[must_use]
    pub fn with_preserve_tokens(mut self, enabled: bool) -> Self {
        self.preserve_tokens = enabled;
        self
    }

    /// Keeps captured max-stack values.
    #[must_use]
    pub fn with_keep_max_stacks(mut self, enabled: bool) -> Self {
        self.keep_max_stacks = enabled;
        self
    }

    /// Enables every preservation switch.
    #[must_use]
    pub fn with_preserve_all(mut self, enabled: bool) -> Self {
        self.preserve_all = enabled;
        self
    }

    /// Sets the output suffix.
    #[must_use]
    pub fn with_output_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.output_suffix = suffix.into();
        self
    }

    /// `true` if the packer's runtime support code should be removed from the output.
    #[must_use]
    pub fn removes_runtime_support(&self) -> bool {
        !(self.preserve_all || self.preserve_runtime)
    }

    /// Write options derived from the preservation switches.
    #[must_use]
    pub fn write_options(&self) -> WriteOptions {
        let preserve_tokens = self.preserve_all || self.preserve_tokens;
        WriteOptions {
            preserve_row_ids: preserve_tokens,
            preserve_offsets: preserve_tokens,
            keep_original_max_stack: self.preserve_all || self.keep_max_stacks,
        }
    }

    /// Output path for `input`: the suffix goes between the file stem and the extension.
    #[must_use]
    pub fn output_path(&self, input: &Path) -> PathBuf {
        let stem = input
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();
        let name = match input.extension() {
            Some(extension) => format!(
                "{stem}{}.{}",
                self.output_suffix,
                extension.to_string_lossy()
            ),
            None => format!("{stem}{}", self.output_suffix),
        };
        input.with_file_name(name)
    }
}
