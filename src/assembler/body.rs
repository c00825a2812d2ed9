//! Method bodies: the assembled form handed to a module store and the ECMA-335 on-disk
//! encoding (II.25.4).
//!
//! [`MethodBody`] is what a capture produces: instructions with index-based branch targets,
//! exception regions bounded by instruction indices, the flags of the method header and
//! the raw local-variable signature. Re-emission always uses the fat header format, which
//! can express every body; [`RawMethodBody`] parses both header formats.

use bitflags::bitflags;

use crate::{
    assembler::decoder::{self, Instruction},
    file::io::{read_le, read_le_at, write_le_at},
    runtime::corinfo::{CorInfoEhClause, EhClauseFlags},
    token::Token,
    Result,
};

bitflags! {
    /// Flags of the method header (II.25.4.4)
    #[derive(PartialEq, Eq, Debug, Clone, Copy)]
    pub struct MethodBodyFlags: u16 {
        /// Tiny header, no locals, no exception sections, max stack 8
        const TINY_FORMAT = 0x2;
        /// Fat header
        const FAT_FORMAT = 0x3;
        /// Data sections follow the code
        const MORE_SECTS = 0x8;
        /// Zero-initialize locals
        const INIT_LOCALS = 0x10;
    }
}

bitflags! {
    /// Flags of a method data section (II.25.4.5)
    #[derive(PartialEq, Eq, Debug, Clone, Copy)]
    pub struct SectionFlags: u8 {
        /// Exception handling table
        const EHTABLE = 0x1;
        /// Reserved optimization table
        const OPTILTABLE = 0x2;
        /// 24-byte clauses with a 3-byte section size
        const FAT_FORMAT = 0x40;
        /// Another section follows
        const MORE_SECTS = 0x80;
    }
}

/// Size of a fat method header in bytes.
pub const FAT_HEADER_SIZE: usize = 12;
/// Size of one fat exception clause in bytes.
pub const FAT_CLAUSE_SIZE: usize = 24;

/// What an exception region's handler does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Typed catch of the given class token
    Catch(Token),
    /// Filter whose code starts at the given instruction index
    Filter {
        /// Instruction index of the filter block
        filter_start: usize,
    },
    /// `finally` block
    Finally,
    /// `fault` block
    Fault,
}

/// One protected region, bounded by instruction indices.
///
/// End bounds are exclusive; `None` means the region runs to the end of the method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionRegion {
    /// Handler type
    pub kind: HandlerKind,
    /// First protected instruction
    pub try_start: usize,
    /// First instruction after the protected block
    pub try_end: Option<usize>,
    /// First handler instruction
    pub handler_start: usize,
    /// First instruction after the handler
    pub handler_end: Option<usize>,
}

impl ExceptionRegion {
    /// Maps a raw clause onto instruction indices, using `offsets` from
    /// [`crate::assembler::decoder::layout`].
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if any bound is not an instruction boundary.
    pub fn from_clause(clause: &CorInfoEhClause, offsets: &[usize]) -> Result<Self> {
        let flags = clause.clause_flags();
        let kind = if flags.contains(EhClauseFlags::FILTER) {
            HandlerKind::Filter {
                filter_start: start_index(offsets, clause.class_token_or_filter_offset)?,
            }
        } else if flags.contains(EhClauseFlags::FINALLY) {
            HandlerKind::Finally
        } else if flags.contains(EhClauseFlags::FAULT) {
            HandlerKind::Fault
        } else {
            HandlerKind::Catch(Token::new(clause.class_token_or_filter_offset))
        };

        Ok(ExceptionRegion {
            kind,
            try_start: start_index(offsets, clause.try_offset)?,
            try_end: end_index(offsets, clause.try_offset, clause.try_length)?,
            handler_start: start_index(offsets, clause.handler_offset)?,
            handler_end: end_index(offsets, clause.handler_offset, clause.handler_length)?,
        })
    }

    /// The region as a raw clause laid out by `offsets`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if an index lies outside `offsets`.
    pub fn to_clause(&self, offsets: &[usize]) -> Result<CorInfoEhClause> {
        let code_size = offsets.last().copied().unwrap_or(0);
        let offset_of = |index: usize| -> Result<u32> {
            // The final entry of `offsets` is the code size, which is not a valid start.
            if index + 1 >= offsets.len() {
                return Err(malformed_error!(
                    "Exception region references instruction {} of {}",
                    index,
                    offsets.len().saturating_sub(1)
                ));
            }
            Ok(offsets[index] as u32)
        };
        let end_of = |end: Option<usize>| -> Result<u32> {
            match end {
                Some(index) => offset_of(index),
                None => Ok(code_size as u32),
            }
        };

        let (flags, class_token_or_filter_offset) = match self.kind {
            HandlerKind::Catch(token) => (EhClauseFlags::empty(), token.value()),
            HandlerKind::Filter { filter_start } => (EhClauseFlags::FILTER, offset_of(filter_start)?),
            HandlerKind::Finally => (EhClauseFlags::FINALLY, 0),
            HandlerKind::Fault => (EhClauseFlags::FAULT, 0),
        };

        let try_offset = offset_of(self.try_start)?;
        let handler_offset = offset_of(self.handler_start)?;
        Ok(CorInfoEhClause {
            flags: flags.bits(),
            try_offset,
            try_length: end_of(self.try_end)?.saturating_sub(try_offset),
            handler_offset,
            handler_length: end_of(self.handler_end)?.saturating_sub(handler_offset),
            class_token_or_filter_offset,
        })
    }
}

fn start_index(offsets: &[usize], offset: u32) -> Result<usize> {
    let offset = offset as usize;
    match offsets[..offsets.len().saturating_sub(1)].binary_search(&offset) {
        Ok(index) => Ok(index),
        Err(_) => Err(malformed_error!(
            "Exception clause offset 0x{:X} is not an instruction boundary",
            offset
        )),
    }
}

fn end_index(offsets: &[usize], start: u32, length: u32) -> Result<Option<usize>> {
    let end = u64::from(start) + u64::from(length);
    let code_size = offsets.last().copied().unwrap_or(0) as u64;
    if end == code_size {
        return Ok(None);
    }
    if end > code_size {
        return Err(malformed_error!(
            "Exception clause ends at 0x{:X}, past the code size 0x{:X}",
            end,
            code_size
        ));
    }
    start_index(offsets, end as u32).map(Some)
}

/// A reconstructed method body.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodBody {
    /// Maximum evaluation stack depth
    pub max_stack: u16,
    /// Zero-initialize locals on entry
    pub init_locals: bool,
    /// Local-variable signature blob (`07 count types...`), `None` without locals
    pub local_signature: Option<Vec<u8>>,
    /// Decoded instructions with index-based branch targets
    pub instructions: Vec<Instruction>,
    /// Protected regions in clause order
    pub exception_regions: Vec<ExceptionRegion>,
}

impl MethodBody {
    /// Size of the encoded instruction stream.
    #[must_use]
    pub fn code_size(&self) -> usize {
        self.instructions.iter().map(Instruction::size).sum()
    }

    /// Encodes the body with a fat header referencing `local_signature_token` (use a null
    /// token when the body has no locals).
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] if the instructions or regions cannot be encoded.
    pub fn encode(&self, local_signature_token: Token) -> Result<Vec<u8>> {
        let offsets = decoder::layout(&self.instructions);
        let code = decoder::encode_stream(&self.instructions)?;

        let mut flags = MethodBodyFlags::FAT_FORMAT;
        if self.init_locals {
            flags |= MethodBodyFlags::INIT_LOCALS;
        }
        if !self.exception_regions.is_empty() {
            flags |= MethodBodyFlags::MORE_SECTS;
        }

        let mut data = vec![0u8; FAT_HEADER_SIZE];
        let mut cursor = 0;
        // Header size in dwords sits in the top nibble.
        write_le_at(&mut data, &mut cursor, flags.bits() | 0x3000)?;
        write_le_at(&mut data, &mut cursor, self.max_stack)?;
        write_le_at(&mut data, &mut cursor, code.len() as u32)?;
        write_le_at(&mut data, &mut cursor, local_signature_token.value())?;
        data.extend_from_slice(&code);

        if self.exception_regions.is_empty() {
            return Ok(data);
        }

        data.resize((data.len() + 3) & !3, 0);
        let section_size = 4 + FAT_CLAUSE_SIZE * self.exception_regions.len();
        if section_size > 0x00FF_FFFF {
            return Err(malformed_error!(
                "{} exception clauses do not fit a fat section",
                self.exception_regions.len()
            ));
        }

        let mut cursor = data.len();
        data.resize(cursor + section_size, 0);
        let kind = SectionFlags::EHTABLE | SectionFlags::FAT_FORMAT;
        write_le_at(
            &mut data,
            &mut cursor,
            u32::from(kind.bits()) | ((section_size as u32) << 8),
        )?;

        for region in &self.exception_regions {
            let clause = region.to_clause(&offsets)?;
            for value in [
                clause.flags,
                clause.try_offset,
                clause.try_length,
                clause.handler_offset,
                clause.handler_length,
                clause.class_token_or_filter_offset,
            ] {
                write_le_at(&mut data, &mut cursor, value)?;
            }
        }

        Ok(data)
    }

    /// Decodes an encoded body back into instructions and regions.
    ///
    /// The local signature is not part of the encoding and comes back as `None`.
    ///
    /// # Errors
    /// Returns an error if the header, code or exception sections are malformed.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let raw = RawMethodBody::parse(data)?;
        let instructions = decoder::decode_stream(raw.code)?;
        let offsets = decoder::layout(&instructions);
        let exception_regions = raw
            .clauses
            .iter()
            .map(|clause| ExceptionRegion::from_clause(clause, &offsets))
            .collect::<Result<Vec<_>>>()?;

        Ok(MethodBody {
            max_stack: raw.max_stack,
            init_locals: raw.init_locals,
            local_signature: None,
            instructions,
            exception_regions,
        })
    }
}

/// An encoded body split into header fields, code and raw clauses.
#[derive(Debug)]
pub struct RawMethodBody<'a> {
    /// Maximum evaluation stack depth (8 for tiny headers)
    pub max_stack: u16,
    /// Zero-initialize locals on entry
    pub init_locals: bool,
    /// `StandAloneSig` token of the locals, null if none
    pub local_signature_token: Token,
    /// Size of the header in bytes
    pub header_size: usize,
    /// The instruction stream
    pub code: &'a [u8],
    /// Exception clauses from every EH section
    pub clauses: Vec<CorInfoEhClause>,
}

impl<'a> RawMethodBody<'a> {
    /// Parses a tiny or fat body starting at the first byte of `data`.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for unknown header formats and
    /// [`crate::Error::OutOfBounds`] for truncated bodies.
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.is_empty() {
            return Err(malformed_error!("Provided data for body parsing is empty"));
        }

        let first_byte = read_le::<u8>(data)?;
        match MethodBodyFlags::from_bits_truncate(u16::from(first_byte & 0b_00000011_u8)) {
            MethodBodyFlags::TINY_FORMAT => {
                let size_code = (first_byte >> 2) as usize;
                if size_code + 1 > data.len() {
                    return Err(out_of_bounds_error!());
                }

                Ok(RawMethodBody {
                    max_stack: 8,
                    init_locals: false,
                    local_signature_token: Token::new(0),
                    header_size: 1,
                    code: &data[1..=size_code],
                    clauses: Vec::new(),
                })
            }
            MethodBodyFlags::FAT_FORMAT => {
                if data.len() < FAT_HEADER_SIZE {
                    return Err(out_of_bounds_error!());
                }

                let first_duo = read_le::<u16>(data)?;
                let header_size = ((first_duo >> 12) * 4) as usize;
                let size_code = read_le::<u32>(&data[4..])? as usize;
                if header_size < FAT_HEADER_SIZE || data.len() < size_code + header_size {
                    return Err(out_of_bounds_error!());
                }

                let flags = MethodBodyFlags::from_bits_truncate(first_duo & 0x0FFF);
                let mut clauses = Vec::new();
                if flags.contains(MethodBodyFlags::MORE_SECTS) {
                    let cursor = (header_size + size_code + 3) & !3;
                    read_sections(data, cursor, &mut clauses)?;
                }

                Ok(RawMethodBody {
                    max_stack: read_le::<u16>(&data[2..])?,
                    init_locals: flags.contains(MethodBodyFlags::INIT_LOCALS),
                    local_signature_token: Token::new(read_le::<u32>(&data[8..])?),
                    header_size,
                    code: &data[header_size..header_size + size_code],
                    clauses,
                })
            }
            _ => Err(malformed_error!(
                "MethodHeader is neither FAT nor TINY - {}",
                first_byte
            )),
        }
    }
}

fn read_sections(data: &[u8], mut cursor: usize, clauses: &mut Vec<CorInfoEhClause>) -> Result<()> {
    while data.len() >= cursor + 4 {
        let section_flags = SectionFlags::from_bits_truncate(read_le::<u8>(&data[cursor..])?);
        if !section_flags.contains(SectionFlags::EHTABLE) {
            break;
        }

        let fat = section_flags.contains(SectionFlags::FAT_FORMAT);
        let section_size = if fat {
            (read_le::<u32>(&data[cursor..])? >> 8) as usize
        } else {
            usize::from(read_le::<u8>(&data[cursor + 1..])?)
        };
        if section_size < 4 || data.len() < cursor + section_size {
            return Err(out_of_bounds_error!());
        }

        let mut position = cursor + 4;
        if fat {
            for _ in 0..(section_size - 4) / FAT_CLAUSE_SIZE {
                clauses.push(CorInfoEhClause {
                    flags: read_le_at::<u32>(data, &mut position)?,
                    try_offset: read_le_at::<u32>(data, &mut position)?,
                    try_length: read_le_at::<u32>(data, &mut position)?,
                    handler_offset: read_le_at::<u32>(data, &mut position)?,
                    handler_length: read_le_at::<u32>(data, &mut position)?,
                    class_token_or_filter_offset: read_le_at::<u32>(data, &mut position)?,
                });
            }
        } else {
            for _ in 0..(section_size - 4) / 12 {
                clauses.push(CorInfoEhClause {
                    flags: u32::from(read_le_at::<u16>(data, &mut position)?),
                    try_offset: u32::from(read_le_at::<u16>(data, &mut position)?),
                    try_length: u32::from(read_le_at::<u8>(data, &mut position)?),
                    handler_offset: u32::from(read_le_at::<u16>(data, &mut position)?),
                    handler_length: u32::from(read_le_at::<u8>(data, &mut position)?),
                    class_token_or_filter_offset: read_le_at::<u32>(data, &mut position)?,
                });
            }
        }

        if !section_flags.contains(SectionFlags::MORE_SECTS) {
            break;
        }
        cursor = (cursor + section_size + 3) & !3;
    }

    Ok(())
}
