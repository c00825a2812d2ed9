//! Reconstruction of method bodies from the raw material of a compile request.
//!
//! The compiler receives a method as loose parts: the instruction bytes, a maximum stack
//! depth, a local-variable signature and exception clauses expressed as byte offsets.
//! [`BodyAssembler`] turns those parts into a [`MethodBody`] that a module store can write:
//! instructions are decoded, branch and region bounds become instruction indices, and
//! metadata tokens pass through a [`TokenResolver`] so packers that remap tokens at run
//! time can be undone.
//!
//! # Key Components
//!
//! - [`crate::assembler::instructions`] - The CIL opcode table
//! - [`crate::assembler::decoder`] - Instruction stream decoding and re-encoding
//! - [`crate::assembler::body`] - [`MethodBody`] and the on-disk body format
//!
//! # Examples
//!
//! ```rust
//! use jitdump::assembler::{BodyAssembler, IdentityResolver};
//!
//! // ldc.i4.1; stloc.0; ldloc.0; ret with one int32 local
//! let il = [0x17, 0x0A, 0x06, 0x2A];
//! let body = BodyAssembler::new(&IdentityResolver)
//!     .assemble(&il, 1, true, Some(&[0x07, 0x01, 0x08][..]), &[])?;
//!
//! assert_eq!(body.instructions.len(), 4);
//! assert!(body.local_signature.is_some());
//! # Ok::<(), jitdump::Error>(())
//! ```

pub mod body;
pub mod decoder;
pub mod instructions;

pub use body::{ExceptionRegion, HandlerKind, MethodBody, RawMethodBody};
pub use decoder::{Instruction, Operand};
pub use instructions::{OpCode, OperandType};

use crate::{
    capture::sigwalk::split_local_sig, runtime::corinfo::CorInfoEhClause, token::Token, Result,
};

/// Maps a token read from captured code to the token the output module should reference.
pub trait TokenResolver {
    /// Resolves `token`, the operand of `opcode`.
    ///
    /// # Errors
    /// Returns an error if the token cannot be mapped; the method's capture fails.
    fn resolve(&self, opcode: &OpCode, token: Token) -> Result<Token>;
}

/// Leaves every token unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityResolver;

impl TokenResolver for IdentityResolver {
    fn resolve(&self, _opcode: &OpCode, token: Token) -> Result<Token> {
        Ok(token)
    }
}

impl<F> TokenResolver for F
where
    F: Fn(&OpCode, Token) -> Result<Token>,
{
    fn resolve(&self, opcode: &OpCode, token: Token) -> Result<Token> {
        self(opcode, token)
    }
}

/// Builds [`MethodBody`] values from compile-request parts.
pub struct BodyAssembler<'a> {
    resolver: &'a dyn TokenResolver,
}

impl<'a> BodyAssembler<'a> {
    /// Creates an assembler passing operand tokens through `resolver`.
    #[must_use]
    pub fn new(resolver: &'a dyn TokenResolver) -> Self {
        BodyAssembler { resolver }
    }

    /// Assembles one body.
    ///
    /// String literals (`ldstr`) and the class tokens of catch clauses are kept as read.
    /// A local signature that does not parse is dropped with a warning; the body is still
    /// produced without locals.
    ///
    /// # Errors
    /// Returns an error if the instructions cannot be decoded, an exception clause does not
    /// line up with instruction boundaries, `max_stack` exceeds the header range, or the
    /// resolver fails.
    pub fn assemble(
        &self,
        il: &[u8],
        max_stack: u32,
        init_locals: bool,
        local_signature: Option<&[u8]>,
        clauses: &[CorInfoEhClause],
    ) -> Result<MethodBody> {
        let Ok(max_stack) = u16::try_from(max_stack) else {
            return Err(malformed_error!("Max stack {} exceeds the header range", max_stack));
        };

        let mut instructions = decoder::decode_stream(il)?;
        for instruction in &mut instructions {
            if let Operand::Token(token) = instruction.operand {
                if instruction.opcode.value != instructions::LDSTR {
                    instruction.operand =
                        Operand::Token(self.resolver.resolve(instruction.opcode, token)?);
                }
            }
        }

        let offsets = decoder::layout(&instructions);
        let exception_regions = clauses
            .iter()
            .map(|clause| ExceptionRegion::from_clause(clause, &offsets))
            .collect::<Result<Vec<_>>>()?;

        let local_signature = local_signature.and_then(|blob| match split_local_sig(blob) {
            Ok(_) => Some(blob.to_vec()),
            Err(error) => {
                log::warn!("Dropping unreadable local signature - {error}");
                None
            }
        });

        Ok(MethodBody {
            max_stack,
            init_locals,
            local_signature,
            instructions,
            exception_regions,
        })
    }
}
