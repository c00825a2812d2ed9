//! Versioned table of runtime offsets.
//!
//! Hook and patch sites live at fixed offsets inside a specific build of the execution engine
//! and compiler. They are recorded per architecture and runtime generation in a small text
//! file, `JitUnpacker.RuntimeFunctions.CLR{20|40}.{x86|x64}.config`, together with the file
//! versions they were taken from:
//!
//! ```text
//! CLR_VERSION=4.7.3190.0
//! JIT_VERSION=4.7.3190.0
//! METHODDESC_RESET_RVA=4C1B2
//! CALL_COMPCOMPILE_RVA=1F2A3
//! ```
//!
//! Loading verifies both versions against the running modules and refuses to continue on a
//! mismatch; patching a different build blindly would corrupt the runtime.

use std::{fmt, path::Path, str::FromStr};

use crate::{
    runtime::environment::{Architecture, RuntimeEnvironment, RuntimeFlavor, RuntimeModules, RuntimeVersion},
    Error, Result,
};

/// Offsets (relative to the owning module's base) of every routine and patch site the
/// capture session touches. A value of zero means the site does not exist for this runtime.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OffsetTable {
    /// Execution engine file version the table was generated for
    pub clr_version: RuntimeVersion,
    /// Compiler file version the table was generated for
    pub jit_version: RuntimeVersion,
    /// `MethodDesc::Reset`
    pub method_desc_reset: u32,
    /// `MethodDesc::DoPrestub`
    pub method_desc_do_prestub: u32,
    /// `MethodDesc::GetWrappedMethodDesc`
    pub method_desc_get_wrapped: u32,
    /// `CEEInfo::canInline`
    pub ceeinfo_can_inline: u32,
    /// `test eax, eax` after the `ContainsGenericVariables` call in `DoPrestub`
    pub prestub_contains_generic_variables: u32,
    /// `test eax, eax` after the `IsClassConstructorTriggeredViaPrestub` call in `DoPrestub`
    pub prestub_class_constructor_triggered: u32,
    /// Argument setup of the `CheckRunClassInitThrowing` call in `DoPrestub`
    pub prestub_check_run_class_init: u32,
    /// `call compCompile` inside `jitNativeCode` (compiler module)
    pub call_comp_compile: u32,
    /// `jitNativeCode` (compiler module)
    pub jit_native_code: u32,
}

const KEYS: [&str; 9] = [
    "METHODDESC_RESET_RVA",
    "METHODDESC_DOPRESTUB_RVA",
    "METHODDESC_GETWRAPPEDMETHODDESC_RVA",
    "CEEINFO_CANINLINE_RVA",
    "METHODDESC_DOPRESTUB_CALL_CONTAINSGENERICVARIABLES_RVA",
    "METHODDESC_DOPRESTUB_CALL_ISCLASSCONSTRUCTORTRIGGEREDVIAPRESTUB_RVA",
    "METHODDESC_DOPRESTUB_CALL_CHECKRUNCLASSINITTHROWING_RVA",
    "CALL_COMPCOMPILE_RVA",
    "JITNATIVECODE_RVA",
];

impl OffsetTable {
    /// File name of the table for an architecture and runtime generation.
    #[must_use]
    pub fn file_name(architecture: Architecture, flavor: RuntimeFlavor) -> String {
        format!(
            "JitUnpacker.RuntimeFunctions.{}.{}.config",
            flavor.table_tag(),
            architecture
        )
    }

    /// Reads a table from disk without verifying it.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the file cannot be read, or a parse error.
    pub fn from_file(path: &Path) -> Result<Self> {
        std::fs::read_to_string(path)?.parse()
    }

    /// Loads the table matching `environment` from `directory` and verifies it.
    ///
    /// # Errors
    /// Returns [`crate::Error::FileError`] if the table is missing and
    /// [`crate::Error::VersionMismatch`] if it belongs to another runtime build.
    pub fn load(directory: &Path, environment: &RuntimeEnvironment) -> Result<Self> {
        let path = directory.join(Self::file_name(environment.architecture, environment.flavor));
        log::debug!("Loading runtime offsets from {}", path.display());

        let table = Self::from_file(&path)?;
        table.verify(&environment.modules)?;
        Ok(table)
    }

    /// Checks that the recorded versions match the loaded runtime modules.
    ///
    /// # Errors
    /// Returns [`crate::Error::VersionMismatch`] naming the first mismatching module.
    pub fn verify(&self, modules: &RuntimeModules) -> Result<()> {
        let checks = [
            ("CLR", self.clr_version, modules.clr_version),
            ("JIT", self.jit_version, modules.jit_version),
        ];

        for (component, expected, actual) in checks {
            if expected != actual {
                return Err(Error::VersionMismatch {
                    component,
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }
        }

        Ok(())
    }

    /// Returns `offset` or a [`crate::Error::MissingOffset`] for `key` if it is zero.
    ///
    /// # Errors
    /// Returns [`crate::Error::MissingOffset`] when the site was not recorded.
    pub fn require(offset: u32, key: &str) -> Result<u32> {
        if offset == 0 {
            Err(Error::MissingOffset(key.to_string()))
        } else {
            Ok(offset)
        }
    }

    fn values(&self) -> [u32; 9] {
        [
            self.method_desc_reset,
            self.method_desc_do_prestub,
            self.method_desc_get_wrapped,
            self.ceeinfo_can_inline,
            self.prestub_contains_generic_variables,
            self.prestub_class_constructor_triggered,
            self.prestub_check_run_class_init,
            self.call_comp_compile,
            self.jit_native_code,
        ]
    }

    fn slot_mut(&mut self, key: &str) -> Option<&mut u32> {
        let slot = match key {
            "METHODDESC_RESET_RVA" => &mut self.method_desc_reset,
            "METHODDESC_DOPRESTUB_RVA" => &mut self.method_desc_do_prestub,
            "METHODDESC_GETWRAPPEDMETHODDESC_RVA" => &mut self.method_desc_get_wrapped,
            "CEEINFO_CANINLINE_RVA" => &mut self.ceeinfo_can_inline,
            "METHODDESC_DOPRESTUB_CALL_CONTAINSGENERICVARIABLES_RVA" => {
                &mut self.prestub_contains_generic_variables
            }
            "METHODDESC_DOPRESTUB_CALL_ISCLASSCONSTRUCTORTRIGGEREDVIAPRESTUB_RVA" => {
                &mut self.prestub_class_constructor_triggered
            }
            "METHODDESC_DOPRESTUB_CALL_CHECKRUNCLASSINITTHROWING_RVA" => {
                &mut self.prestub_check_run_class_init
            }
            "CALL_COMPCOMPILE_RVA" => &mut self.call_comp_compile,
            "JITNATIVECODE_RVA" => &mut self.jit_native_code,
            _ => return None,
        };
        Some(slot)
    }
}

impl FromStr for OffsetTable {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut table = OffsetTable::default();
        let mut seen = [false; KEYS.len() + 2];

        for (index, line) in s.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(malformed_error!("Line {} is not KEY=VALUE - {}", index + 1, line));
            };
            let (key, value) = (key.trim(), value.trim());

            match key {
                "CLR_VERSION" => {
                    table.clr_version = value.parse()?;
                    seen[KEYS.len()] = true;
                }
                "JIT_VERSION" => {
                    table.jit_version = value.parse()?;
                    seen[KEYS.len() + 1] = true;
                }
                _ => {
                    let Some(position) = KEYS.iter().position(|known| *known == key) else {
                        log::warn!("Ignoring unknown offset table key {key}");
                        continue;
                    };
                    let digits = value
                        .strip_prefix("0x")
                        .or_else(|| value.strip_prefix("0X"))
                        .unwrap_or(value);
                    let offset = u32::from_str_radix(digits, 16).map_err(|_| {
                        malformed_error!("Invalid hex value for {} - {}", key, value)
                    })?;
                    if let Some(slot) = table.slot_mut(key) {
                        *slot = offset;
                    }
                    seen[position] = true;
                }
            }
        }

        let names = KEYS.iter().copied().chain(["CLR_VERSION", "JIT_VERSION"]);
        if let Some((name, _)) = names.zip(seen).find(|(_, seen)| !seen) {
            return Err(Error::MissingOffset(name.to_string()));
        }

        Ok(table)
    }
}

impl fmt::Display for OffsetTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "CLR_VERSION={}", self.clr_version)?;
        writeln!(f, "JIT_VERSION={}", self.jit_version)?;
        for (key, value) in KEYS.iter().zip(self.values()) {
            writeln!(f, "{key}={value:X}")?;
        }
        Ok(())
    }
}
