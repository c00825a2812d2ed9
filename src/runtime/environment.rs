//! Description of the hosting runtime the capture session runs inside.
//!
//! Everything that differs between runtime builds is decided once here: the word size of
//! the process, the runtime flavor derived from the execution engine's file version, the
//! calling convention of the compiler's interface slot and the layout of the method-info
//! block the compiler receives.

use std::{fmt, str::FromStr};

use strum::Display;

use crate::{runtime::corinfo::MethodInfoLayout, runtime::thunk::CallingConvention, Error, Result};

/// Word size of the current process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Architecture {
    /// 32-bit x86
    #[strum(serialize = "x86")]
    X86,
    /// 64-bit x86-64
    #[strum(serialize = "x64")]
    X64,
}

impl Architecture {
    /// Architecture of the running process.
    #[must_use]
    pub fn current() -> Self {
        if cfg!(target_pointer_width = "64") {
            Architecture::X64
        } else {
            Architecture::X86
        }
    }

    /// Size of a native pointer in bytes.
    #[must_use]
    pub fn pointer_size(self) -> usize {
        match self {
            Architecture::X86 => 4,
            Architecture::X64 => 8,
        }
    }
}

/// A four-part file version, `major.minor.build.revision`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RuntimeVersion {
    /// Major version
    pub major: u16,
    /// Minor version
    pub minor: u16,
    /// Build number
    pub build: u16,
    /// Revision number
    pub revision: u16,
}

impl RuntimeVersion {
    /// Creates a version from its four parts.
    #[must_use]
    pub const fn new(major: u16, minor: u16, build: u16, revision: u16) -> Self {
        RuntimeVersion {
            major,
            minor,
            build,
            revision,
        }
    }
}

impl fmt::Display for RuntimeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.major, self.minor, self.build, self.revision
        )
    }
}

impl FromStr for RuntimeVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = [0u16; 4];
        let mut count = 0;
        for part in s.trim().split('.') {
            if count == 4 {
                return Err(malformed_error!("Version has more than four parts - {}", s));
            }
            parts[count] = part
                .parse::<u16>()
                .map_err(|_| malformed_error!("Invalid version component '{}' in {}", part, s))?;
            count += 1;
        }

        if count != 4 {
            return Err(malformed_error!("Version must have four parts - {}", s));
        }

        Ok(RuntimeVersion::new(parts[0], parts[1], parts[2], parts[3]))
    }
}

/// First 4.x build with the 4.5 execution engine.
pub const CLR45_FIRST_BUILD: RuntimeVersion = RuntimeVersion::new(4, 0, 30319, 17020);

/// First 4.5 build whose compiler interface moved back to `stdcall`.
pub const CLR45_STDCALL_BUILD: RuntimeVersion = RuntimeVersion::new(4, 0, 30319, 17929);

/// Runtime generation, which selects offsets, patch catalogs and structure layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum RuntimeFlavor {
    /// CLR 2.0 (framework 2.0 to 3.5)
    #[strum(serialize = "CLR 2.x")]
    Clr2x,
    /// CLR 4.0 before the 4.5 in-place update
    #[strum(serialize = "CLR 4.0")]
    Clr40x,
    /// CLR 4.5 and later
    #[strum(serialize = "CLR 4.5+")]
    Clr45x,
}

impl RuntimeFlavor {
    /// Classifies an execution-engine file version.
    ///
    /// # Errors
    /// Returns [`crate::Error::UnsupportedRuntime`] for any major version other than 2 or 4.
    pub fn from_version(version: RuntimeVersion) -> Result<Self> {
        match version.major {
            2 => Ok(RuntimeFlavor::Clr2x),
            4 if version >= CLR45_FIRST_BUILD => Ok(RuntimeFlavor::Clr45x),
            4 => Ok(RuntimeFlavor::Clr40x),
            _ => Err(Error::UnsupportedRuntime(version.to_string())),
        }
    }

    /// `true` for both 4.x flavors.
    #[must_use]
    pub fn is_clr4x(self) -> bool {
        !matches!(self, RuntimeFlavor::Clr2x)
    }

    /// Short tag used in offset table file names.
    #[must_use]
    pub fn table_tag(self) -> &'static str {
        match self {
            RuntimeFlavor::Clr2x => "CLR20",
            RuntimeFlavor::Clr40x | RuntimeFlavor::Clr45x => "CLR40",
        }
    }
}

/// Addresses and versions of the loaded runtime modules.
///
/// Supplied by the [`crate::runtime::host::RuntimeHost`]; nothing here is discovered by this
/// crate on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeModules {
    /// Base address of the execution engine (`clr.dll` / `mscorwks.dll`)
    pub clr_base: usize,
    /// File version of the execution engine
    pub clr_version: RuntimeVersion,
    /// Base address of the compiler (`clrjit.dll` / `mscorjit.dll`)
    pub jit_base: usize,
    /// File version of the compiler
    pub jit_version: RuntimeVersion,
    /// Compiler instance returned by its `getJit` export
    pub jit_instance: usize,
}

/// The fully classified runtime a session operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeEnvironment {
    /// Word size of the process
    pub architecture: Architecture,
    /// Runtime generation
    pub flavor: RuntimeFlavor,
    /// Loaded runtime modules
    pub modules: RuntimeModules,
}

impl RuntimeEnvironment {
    /// Classifies the runtime described by `modules`.
    ///
    /// # Errors
    /// Returns [`crate::Error::UnsupportedRuntime`] if the execution engine version is unknown.
    pub fn new(architecture: Architecture, modules: RuntimeModules) -> Result<Self> {
        let flavor = RuntimeFlavor::from_version(modules.clr_version)?;
        Ok(RuntimeEnvironment {
            architecture,
            flavor,
            modules,
        })
    }

    /// Classifies the runtime for the current process architecture.
    ///
    /// # Errors
    /// Returns [`crate::Error::UnsupportedRuntime`] if the execution engine version is unknown.
    pub fn detect(modules: RuntimeModules) -> Result<Self> {
        Self::new(Architecture::current(), modules)
    }

    /// Size of a native pointer in bytes.
    #[must_use]
    pub fn pointer_size(&self) -> usize {
        self.architecture.pointer_size()
    }

    /// Convention of the compiler's `compileMethod` interface slot.
    ///
    /// Only the 4.5 developer preview builds used `thiscall` for it.
    #[must_use]
    pub fn compile_method_convention(&self) -> CallingConvention {
        let version = self.modules.clr_version;
        if version >= CLR45_FIRST_BUILD && version < CLR45_STDCALL_BUILD {
            CallingConvention::ThisCall
        } else {
            CallingConvention::StdCall
        }
    }

    /// Convention of the compiler's internal compile routine targeted by the inline hook.
    #[must_use]
    pub fn comp_compile_convention(&self) -> CallingConvention {
        CallingConvention::FastCall
    }

    /// Layout of the method-info block for this runtime.
    #[must_use]
    pub fn method_info_layout(&self) -> MethodInfoLayout {
        match self.flavor {
            RuntimeFlavor::Clr2x => MethodInfoLayout::V20,
            RuntimeFlavor::Clr40x | RuntimeFlavor::Clr45x => MethodInfoLayout::V40,
        }
    }
}
