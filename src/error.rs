use thiserror::Error;

use crate::{
    runtime::{environment::Architecture, thunk::CallingConvention},
    token::Token,
};

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! out_of_bounds_error {
    () => {
        crate::Error::OutOfBounds {
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// The variants fall into the same groups the capture pipeline distinguishes when it decides
/// whether a failure aborts the run or only the current method.
///
/// # Error Categories
///
/// ## Parsing Errors
/// - [`Error::Malformed`] - Corrupted instruction stream, signature or image
/// - [`Error::OutOfBounds`] - Attempted to read beyond a buffer
///
/// ## Fatal Setup Errors
/// - [`Error::UnsupportedArchitecture`] - Operation only exists for another word size
/// - [`Error::UnsupportedRuntime`] - Runtime major version is not handled
/// - [`Error::UnsupportedConvention`] - No adapter exists between two calling conventions
/// - [`Error::VersionMismatch`] - Offset table was generated for another runtime build
/// - [`Error::MissingOffset`] - Offset table lacks a required entry
/// - [`Error::PatchMismatch`] - Bytes at a patch or hook site are not what was expected
///
/// ## Hook-State Errors
/// - [`Error::HookState`] - Double hook or double unhook
/// - [`Error::HookActive`] - Another capture session already owns the compiler redirect
/// - [`Error::DisplacementOutOfRange`] - A relative call cannot reach the generated stub
///
/// ## Per-Method Capture Errors
/// - [`Error::Capture`] - Capture of one method failed, with the underlying cause
/// - [`Error::CaptureCountMismatch`] - Forcing a method did not yield exactly one capture
/// - [`Error::NoOutputModule`] - A capture arrived before the output module was loaded
/// - [`Error::NativeFault`] - A panic or a structured exception was caught at the native boundary
///
/// ## I/O and External Errors
/// - [`Error::FileError`] - Filesystem I/O errors
/// - [`Error::GoblinErr`] - PE parsing errors from goblin crate
/// - [`Error::Memory`] - Page protection or raw memory access failed
///
/// # Examples
///
/// ```rust
/// use jitdump::Error;
///
/// fn describe(error: &Error) -> &'static str {
///     match error {
///         Error::VersionMismatch { .. } => "offset table must be regenerated",
///         Error::Capture { .. } => "method was skipped",
///         _ => "fatal",
///     }
/// }
/// # let _ = describe;
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // Parsing Errors
    /// The data is damaged and could not be parsed.
    ///
    /// The error includes the source location where the malformation was detected for
    /// debugging purposes.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// The message to be printed for the Malformed error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted while parsing.
    #[error("Out of Bound read would have occurred - {file}:{line}")]
    OutOfBounds {
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    // Fatal Setup Errors
    /// The operation is only defined for a different word size.
    ///
    /// Behavior patches and convention adapters are recorded for 32-bit processes only;
    /// requesting them elsewhere is a hard failure rather than a silent no-op.
    #[error("Operation is not supported on {0}")]
    UnsupportedArchitecture(Architecture),

    /// The hosting runtime's version is not one this library knows how to drive.
    #[error("Unsupported runtime version - {0}")]
    UnsupportedRuntime(String),

    /// No adapter exists between the two calling conventions.
    #[error("Cannot convert calling convention {from} to {to}")]
    UnsupportedConvention {
        /// Convention of the existing function
        from: CallingConvention,
        /// Convention the caller expects
        to: CallingConvention,
    },

    /// The offset table was recorded for a different runtime build.
    ///
    /// Offsets are only valid for the exact file version they were generated against and
    /// must be regenerated when the runtime is updated.
    #[error("{component} version mismatch - expected {expected}, found {actual}; regenerate the offset table")]
    VersionMismatch {
        /// Which runtime module did not match
        component: &'static str,
        /// Version recorded in the offset table
        expected: String,
        /// Version of the loaded module
        actual: String,
    },

    /// A required entry is missing from the offset table.
    #[error("Offset table has no entry for {0}")]
    MissingOffset(String),

    /// The bytes found at a patch or hook site differ from the catalog.
    #[error("Unexpected bytes at 0x{address:X} - expected {expected:02X?}, found {found:02X?}")]
    PatchMismatch {
        /// Address of the site
        address: usize,
        /// Bytes the catalog expects
        expected: Vec<u8>,
        /// Bytes actually present
        found: Vec<u8>,
    },

    // Hook-State Errors
    /// `hook()` while hooked or `unhook()` while not hooked.
    #[error("Invalid hook state - {0}")]
    HookState(&'static str),

    /// Only one capture session may own the compiler redirect per process.
    #[error("Another compiler hook is already active")]
    HookActive,

    /// A 32-bit relative displacement cannot reach the target.
    #[error("Target 0x{target:X} is out of rel32 range from 0x{site:X}")]
    DisplacementOutOfRange {
        /// Address of the displacement operand
        site: usize,
        /// Address the call should reach
        target: usize,
    },

    /// Raw memory access or a page protection change failed.
    #[error("Memory access failed at 0x{address:X} - {message}")]
    Memory {
        /// Address of the failed access
        address: usize,
        /// Platform error description
        message: String,
    },

    // Per-Method Capture Errors
    /// Capturing a single method failed.
    ///
    /// The sweep logs this with the method's token and its full cause chain and continues
    /// with the next method.
    #[error("Failed to capture method {token}")]
    Capture {
        /// `MethodDef` token of the method
        token: Token,
        /// The underlying failure
        #[source]
        source: Box<Error>,
    },

    /// Forcing a method through the compiler did not produce exactly one capture.
    #[error("Failed to dump current method - expected {expected} captures, found {actual}")]
    CaptureCountMismatch {
        /// Expected dump count
        expected: usize,
        /// Observed dump count
        actual: usize,
    },

    /// A compilation was intercepted before the output module was loaded.
    #[error("No output module is loaded")]
    NoOutputModule,

    /// A panic inside a compiler callback, or a structured exception raised by a runtime
    /// routine, was caught at the native boundary.
    #[error("Native fault - {0}")]
    NativeFault(String),

    // I/O and External Errors
    /// File I/O error.
    ///
    /// Wraps standard I/O errors that can occur during file operations
    /// such as reading from disk, permission issues, or filesystem errors.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Generic error for miscellaneous failures.
    #[error("{0}")]
    Error(String),

    /// Error from the goblin crate during PE parsing.
    #[error("{0}")]
    GoblinErr(#[from] goblin::error::Error),
}
