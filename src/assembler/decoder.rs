//! Decoding of CIL instruction streams into index-addressed instructions.
//!
//! Branch operands are stored as the index of the target instruction rather than a byte
//! displacement, so a decoded stream can be re-encoded after operands change and every
//! jump still lands on the same instruction.

use crate::{
    assembler::instructions::{self, OpCode, OperandType, PREFIX},
    file::io::write_le,
    token::Token,
    Parser, Result,
};

/// A decoded operand.
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// No operand
    None,
    /// Signed 8-bit immediate
    Int8(i8),
    /// Unsigned 8-bit index or alignment
    UInt8(u8),
    /// Unsigned 16-bit index
    UInt16(u16),
    /// Signed 32-bit immediate
    Int32(i32),
    /// Signed 64-bit immediate
    Int64(i64),
    /// 32-bit float immediate
    Float32(f32),
    /// 64-bit float immediate
    Float64(f64),
    /// Metadata token
    Token(Token),
    /// Index of the branch target instruction
    Target(usize),
    /// Indices of the jump table targets
    Switch(Vec<usize>),
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// Opcode table entry
    pub opcode: &'static OpCode,
    /// Byte offset within the stream it was decoded from
    pub offset: u32,
    /// Inline operand
    pub operand: Operand,
}

impl Instruction {
    /// Encoded size in bytes.
    #[must_use]
    pub fn size(&self) -> usize {
        let operand = match &self.operand {
            Operand::Switch(targets) => 4 + 4 * targets.len(),
            _ => self.opcode.operand.size(),
        };
        self.opcode.size() + operand
    }

    /// The metadata token operand, if any.
    #[must_use]
    pub fn token(&self) -> Option<Token> {
        match self.operand {
            Operand::Token(token) => Some(token),
            _ => None,
        }
    }
}

/// Decodes `code` completely.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] for undefined opcodes, truncated operands and
/// branches that do not land on an instruction boundary inside the stream.
pub fn decode_stream(code: &[u8]) -> Result<Vec<Instruction>> {
    let mut parser = Parser::new(code);
    let mut instructions = Vec::new();
    let mut offsets = Vec::new();
    let mut branches = Vec::new();

    while parser.has_more_data() {
        let offset = parser.pos();
        let (instruction, targets) = decode_instruction(&mut parser)?;
        // An empty switch table still needs its operand rewritten.
        if !targets.is_empty() || matches!(instruction.opcode.operand, OperandType::Switch) {
            branches.push((instructions.len(), targets));
        }
        offsets.push(offset);
        instructions.push(instruction);
    }

    for (index, targets) in branches {
        let resolved = targets
            .into_iter()
            .map(|target| {
                offsets.binary_search(&target).map_err(|_| {
                    malformed_error!(
                        "Branch at IL_{:04X} targets 0x{:X}, which is not an instruction boundary",
                        offsets[index],
                        target
                    )
                })
            })
            .collect::<Result<Vec<usize>>>()?;

        let instruction = &mut instructions[index];
        instruction.operand = match instruction.opcode.operand {
            OperandType::Switch => Operand::Switch(resolved),
            _ => Operand::Target(resolved[0]),
        };
    }

    Ok(instructions)
}

/// Decodes the instruction at the parser position.
///
/// Branch operands come back as `Operand::None` with the absolute target offsets returned
/// separately; [`decode_stream`] maps them to instruction indices.
fn decode_instruction(parser: &mut Parser) -> Result<(Instruction, Vec<usize>)> {
    let offset = parser.pos();
    let first = parser.read_le::<u8>()?;
    let value = if first == PREFIX {
        0xFE00 | u16::from(parser.read_le::<u8>()?)
    } else {
        u16::from(first)
    };

    let Some(opcode) = instructions::lookup(value) else {
        return Err(malformed_error!(
            "Invalid opcode 0x{:X} at IL_{:04X}",
            value,
            offset
        ));
    };

    let mut targets = Vec::new();
    let operand = match opcode.operand {
        OperandType::None => Operand::None,
        OperandType::Int8 => Operand::Int8(parser.read_le::<i8>()?),
        OperandType::UInt8 => Operand::UInt8(parser.read_le::<u8>()?),
        OperandType::UInt16 => Operand::UInt16(parser.read_le::<u16>()?),
        OperandType::Int32 => Operand::Int32(parser.read_le::<i32>()?),
        OperandType::Int64 => Operand::Int64(parser.read_le::<i64>()?),
        OperandType::Float32 => Operand::Float32(parser.read_le::<f32>()?),
        OperandType::Float64 => Operand::Float64(parser.read_le::<f64>()?),
        OperandType::Token => Operand::Token(Token::new(parser.read_le::<u32>()?)),
        OperandType::ShortBranch => {
            let displacement = i64::from(parser.read_le::<i8>()?);
            targets.push(branch_target(parser, offset, displacement)?);
            Operand::None
        }
        OperandType::Branch => {
            let displacement = i64::from(parser.read_le::<i32>()?);
            targets.push(branch_target(parser, offset, displacement)?);
            Operand::None
        }
        OperandType::Switch => {
            let count = parser.read_le::<u32>()? as usize;
            if count > parser.remaining() / 4 {
                return Err(malformed_error!(
                    "Switch at IL_{:04X} declares {} targets past the end of the stream",
                    offset,
                    count
                ));
            }

            let mut displacements = Vec::with_capacity(count);
            for _ in 0..count {
                displacements.push(i64::from(parser.read_le::<i32>()?));
            }
            // Switch displacements are relative to the end of the whole table.
            for displacement in displacements {
                targets.push(branch_target(parser, offset, displacement)?);
            }
            Operand::None
        }
    };

    Ok((
        Instruction {
            opcode,
            offset: offset as u32,
            operand,
        },
        targets,
    ))
}

fn branch_target(parser: &Parser, offset: usize, displacement: i64) -> Result<usize> {
    let target = parser.pos() as i64 + displacement;
    if target < 0 || target >= parser.len() as i64 {
        return Err(malformed_error!(
            "Branch at IL_{:04X} leaves the method (target {})",
            offset,
            target
        ));
    }
    Ok(target as usize)
}

/// Byte offset of every instruction followed by the total code size, as laid out by
/// [`encode_stream`].
#[must_use]
pub fn layout(instructions: &[Instruction]) -> Vec<usize> {
    let mut offsets = Vec::with_capacity(instructions.len() + 1);
    let mut offset = 0;
    for instruction in instructions {
        offsets.push(offset);
        offset += instruction.size();
    }
    offsets.push(offset);
    offsets
}

/// Encodes `instructions`, computing branch displacements from the target indices.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] if a target index is out of range, a short branch
/// cannot reach its target, or an operand does not match its opcode.
pub fn encode_stream(instructions: &[Instruction]) -> Result<Vec<u8>> {
    let offsets = layout(instructions);
    let mut out = Vec::with_capacity(offsets[instructions.len()]);

    let target_offset = |index: usize| -> Result<i64> {
        if index >= instructions.len() {
            return Err(malformed_error!(
                "Branch target {} is outside of {} instructions",
                index,
                instructions.len()
            ));
        }
        Ok(offsets[index] as i64)
    };

    for (index, instruction) in instructions.iter().enumerate() {
        instruction.opcode.encode(&mut out);
        let next = offsets[index + 1] as i64;

        match (&instruction.operand, instruction.opcode.operand) {
            (Operand::None, OperandType::None) => {}
            (Operand::Int8(value), OperandType::Int8) => push(&mut out, *value)?,
            (Operand::UInt8(value), OperandType::UInt8) => push(&mut out, *value)?,
            (Operand::UInt16(value), OperandType::UInt16) => push(&mut out, *value)?,
            (Operand::Int32(value), OperandType::Int32) => push(&mut out, *value)?,
            (Operand::Int64(value), OperandType::Int64) => push(&mut out, *value)?,
            (Operand::Float32(value), OperandType::Float32) => push(&mut out, *value)?,
            (Operand::Float64(value), OperandType::Float64) => push(&mut out, *value)?,
            (Operand::Token(token), OperandType::Token) => push(&mut out, token.value())?,
            (Operand::Target(target), OperandType::ShortBranch) => {
                let displacement = target_offset(*target)? - next;
                let Ok(displacement) = i8::try_from(displacement) else {
                    return Err(malformed_error!(
                        "{} at IL_{:04X} cannot reach its target ({} bytes)",
                        instruction.opcode,
                        offsets[index],
                        displacement
                    ));
                };
                push(&mut out, displacement)?;
            }
            (Operand::Target(target), OperandType::Branch) => {
                push(&mut out, (target_offset(*target)? - next) as i32)?;
            }
            (Operand::Switch(targets), OperandType::Switch) => {
                push(&mut out, targets.len() as u32)?;
                for target in targets {
                    push(&mut out, (target_offset(*target)? - next) as i32)?;
                }
            }
            (operand, _) => {
                return Err(malformed_error!(
                    "Operand {:?} does not fit {} at IL_{:04X}",
                    operand,
                    instruction.opcode,
                    offsets[index]
                ))
            }
        }
    }

    Ok(out)
}

fn push<T: crate::file::io::CilIO>(out: &mut Vec<u8>, value: T) -> Result<()> {
    let start = out.len();
    out.resize(start + std::mem::size_of::<T::Bytes>(), 0);
    write_le(&mut out[start..], value)
}
