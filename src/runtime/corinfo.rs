//! Raw structures exchanged with the compiler.
//!
//! The method-info block the runtime hands to the compiler changed shape between runtime
//! generations (`maxStack` and `EHcount` widened, `cbSig` was added to signature info). The
//! layout is picked once per session as a [`MethodInfoLayout`] and read through the
//! [`CompileRequest`] view, so no call site branches on the runtime version.

use bitflags::bitflags;

bitflags! {
    /// `CorInfoOptions` bits of a compile request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CorInfoOptions: u32 {
        /// Zero-initialize all locals
        const INIT_LOCALS = 0x0000_0010;
        /// Shared generic code reads its context from `this`
        const GENERICS_CTXT_FROM_THIS = 0x0000_0020;
        /// Shared generic code reads its context from a method descriptor argument
        const GENERICS_CTXT_FROM_METHODDESC = 0x0000_0040;
        /// Shared generic code reads its context from a method table argument
        const GENERICS_CTXT_FROM_METHODTABLE = 0x0000_0080;
        /// Keep the generic context alive for the whole method
        const GENERICS_CTXT_KEEP_ALIVE = 0x0000_0100;
    }
}

bitflags! {
    /// `CORINFO_EH_CLAUSE_FLAGS`. No bit set means a typed catch clause.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EhClauseFlags: u32 {
        /// Filter clause
        const FILTER = 0x0001;
        /// Finally clause
        const FINALLY = 0x0002;
        /// Fault clause
        const FAULT = 0x0004;
        /// Clause duplicated by the runtime for a cloned finally
        const DUPLICATE = 0x0008;
        /// Shares its try region with the previous clause
        const SAMETRY = 0x0010;
    }
}

/// `CORINFO_SIG_INST`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CorInfoSigInst {
    /// Number of class type arguments
    pub class_inst_count: u32,
    /// Class type argument handles
    pub class_inst: usize,
    /// Number of method type arguments
    pub meth_inst_count: u32,
    /// Method type argument handles
    pub meth_inst: usize,
}

/// `CORINFO_SIG_INFO` of the 2.0 runtime.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
#[allow(missing_docs)]
pub struct CorInfoSigInfo20 {
    pub call_conv: u32,
    pub ret_type_class: usize,
    pub ret_type_sig_class: usize,
    pub ret_type: u8,
    pub flags: u8,
    /// Number of arguments, or of local variables for a locals signature
    pub num_args: u16,
    pub sig_inst: CorInfoSigInst,
    /// Start of the first argument's (or local's) type encoding
    pub args: usize,
    pub sig: usize,
    pub scope: usize,
    pub token: u32,
}

/// `CORINFO_SIG_INFO` of the 4.x runtimes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
#[allow(missing_docs)]
pub struct CorInfoSigInfo40 {
    pub call_conv: u32,
    pub ret_type_class: usize,
    pub ret_type_sig_class: usize,
    pub ret_type: u8,
    pub flags: u8,
    /// Number of arguments, or of local variables for a locals signature
    pub num_args: u16,
    pub sig_inst: CorInfoSigInst,
    /// Start of the first argument's (or local's) type encoding
    pub args: usize,
    pub sig: usize,
    pub cb_sig: u32,
    pub scope: usize,
    pub token: u32,
}

/// `CORINFO_METHOD_INFO` of the 2.0 runtime.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
#[allow(missing_docs)]
pub struct CorInfoMethodInfo20 {
    pub ftn: usize,
    pub scope: usize,
    pub il_code: usize,
    pub il_code_size: u32,
    pub max_stack: u16,
    pub eh_count: u16,
    pub options: u32,
    pub region_kind: u32,
    pub args: CorInfoSigInfo20,
    pub locals: CorInfoSigInfo20,
}

/// `CORINFO_METHOD_INFO` of the 4.x runtimes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
#[allow(missing_docs)]
pub struct CorInfoMethodInfo40 {
    pub ftn: usize,
    pub scope: usize,
    pub il_code: usize,
    pub il_code_size: u32,
    pub max_stack: u32,
    pub eh_count: u32,
    pub options: u32,
    pub region_kind: u32,
    pub args: CorInfoSigInfo40,
    pub locals: CorInfoSigInfo40,
}

/// `CORINFO_EH_CLAUSE`, filled in by `ICorJitInfo::getEHinfo`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorInfoEhClause {
    /// Raw [`EhClauseFlags`]
    pub flags: u32,
    /// Byte offset of the protected region
    pub try_offset: u32,
    /// Byte length of the protected region
    pub try_length: u32,
    /// Byte offset of the handler
    pub handler_offset: u32,
    /// Byte length of the handler
    pub handler_length: u32,
    /// Catch type token, or filter start offset for filter clauses
    pub class_token_or_filter_offset: u32,
}

impl CorInfoEhClause {
    /// Decoded clause flags; unknown bits are dropped.
    #[must_use]
    pub fn clause_flags(&self) -> EhClauseFlags {
        EhClauseFlags::from_bits_truncate(self.flags)
    }
}

/// Which method-info layout the running compiler uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodInfoLayout {
    /// 2.0 runtime
    V20,
    /// 4.x runtimes
    V40,
}

/// Read view over the method-info block of one compile request.
///
/// Only valid for the duration of the compile call the block was passed to.
#[derive(Debug, Clone, Copy)]
pub enum CompileRequest<'a> {
    /// 2.0 layout
    V20(&'a CorInfoMethodInfo20),
    /// 4.x layout
    V40(&'a CorInfoMethodInfo40),
}

impl<'a> CompileRequest<'a> {
    /// Interprets `method_info` with the given layout. Returns `None` for a null pointer.
    ///
    /// # Safety
    ///
    /// A non-null `method_info` must point to a live method-info block of the given layout,
    /// and its instruction pointer must cover `il_code_size` bytes, for the whole lifetime `'a`.
    #[must_use]
    pub unsafe fn from_ptr(layout: MethodInfoLayout, method_info: usize) -> Option<Self> {
        if method_info == 0 {
            return None;
        }

        // SAFETY: guaranteed by the caller.
        Some(unsafe {
            match layout {
                MethodInfoLayout::V20 => {
                    CompileRequest::V20(&*(method_info as *const CorInfoMethodInfo20))
                }
                MethodInfoLayout::V40 => {
                    CompileRequest::V40(&*(method_info as *const CorInfoMethodInfo40))
                }
            }
        })
    }

    /// Method handle (`CORINFO_METHOD_HANDLE`) being compiled.
    #[must_use]
    pub fn method_handle(&self) -> usize {
        match self {
            CompileRequest::V20(info) => info.ftn,
            CompileRequest::V40(info) => info.ftn,
        }
    }

    /// Module handle (`CORINFO_MODULE_HANDLE`) owning the method.
    #[must_use]
    pub fn module_handle(&self) -> usize {
        match self {
            CompileRequest::V20(info) => info.scope,
            CompileRequest::V40(info) => info.scope,
        }
    }

    /// The method's instruction bytes.
    #[must_use]
    pub fn il_code(&self) -> &'a [u8] {
        let (address, size) = match self {
            CompileRequest::V20(info) => (info.il_code, info.il_code_size),
            CompileRequest::V40(info) => (info.il_code, info.il_code_size),
        };

        if address == 0 || size == 0 {
            return &[];
        }

        // SAFETY: `from_ptr`'s contract covers the instruction buffer.
        unsafe { std::slice::from_raw_parts(address as *const u8, size as usize) }
    }

    /// Declared maximum evaluation stack depth.
    #[must_use]
    pub fn max_stack(&self) -> u32 {
        match self {
            CompileRequest::V20(info) => u32::from(info.max_stack),
            CompileRequest::V40(info) => info.max_stack,
        }
    }

    /// Number of exception clauses.
    #[must_use]
    pub fn eh_count(&self) -> u32 {
        match self {
            CompileRequest::V20(info) => u32::from(info.eh_count),
            CompileRequest::V40(info) => info.eh_count,
        }
    }

    /// Compiler option flags.
    #[must_use]
    pub fn options(&self) -> CorInfoOptions {
        let raw = match self {
            CompileRequest::V20(info) => info.options,
            CompileRequest::V40(info) => info.options,
        };
        CorInfoOptions::from_bits_truncate(raw)
    }

    /// Number of local variables.
    #[must_use]
    pub fn locals_count(&self) -> u16 {
        match self {
            CompileRequest::V20(info) => info.locals.num_args,
            CompileRequest::V40(info) => info.locals.num_args,
        }
    }

    /// Address of the first local variable's type encoding.
    #[must_use]
    pub fn locals_start(&self) -> usize {
        match self {
            CompileRequest::V20(info) => info.locals.args,
            CompileRequest::V40(info) => info.locals.args,
        }
    }
}
