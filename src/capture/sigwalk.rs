//! Walking ECMA-335 type encodings.
//!
//! The compiler hands over the locals of a method as a pointer to the first variable's type
//! encoding plus a count, not as a complete signature blob. To rebuild the blob each variable
//! is walked to find where it ends, the bytes are copied, and the `LOCAL_SIG` header
//! (`0x07`, compressed count) is put in front.

use crate::{file::parser::Parser, Error, Result};

/// `ELEMENT_TYPE_PTR`
pub const ELEMENT_TYPE_PTR: u8 = 0x0F;
/// `ELEMENT_TYPE_BYREF`
pub const ELEMENT_TYPE_BYREF: u8 = 0x10;
/// `ELEMENT_TYPE_VALUETYPE`
pub const ELEMENT_TYPE_VALUETYPE: u8 = 0x11;
/// `ELEMENT_TYPE_CLASS`
pub const ELEMENT_TYPE_CLASS: u8 = 0x12;
/// `ELEMENT_TYPE_VAR`
pub const ELEMENT_TYPE_VAR: u8 = 0x13;
/// `ELEMENT_TYPE_ARRAY`
pub const ELEMENT_TYPE_ARRAY: u8 = 0x14;
/// `ELEMENT_TYPE_GENERICINST`
pub const ELEMENT_TYPE_GENERICINST: u8 = 0x15;
/// `ELEMENT_TYPE_FNPTR`
pub const ELEMENT_TYPE_FNPTR: u8 = 0x1B;
/// `ELEMENT_TYPE_SZARRAY`
pub const ELEMENT_TYPE_SZARRAY: u8 = 0x1D;
/// `ELEMENT_TYPE_MVAR`
pub const ELEMENT_TYPE_MVAR: u8 = 0x1E;
/// `ELEMENT_TYPE_CMOD_REQD`
pub const ELEMENT_TYPE_CMOD_REQD: u8 = 0x1F;
/// `ELEMENT_TYPE_CMOD_OPT`
pub const ELEMENT_TYPE_CMOD_OPT: u8 = 0x20;
/// `ELEMENT_TYPE_SENTINEL`
pub const ELEMENT_TYPE_SENTINEL: u8 = 0x41;
/// `ELEMENT_TYPE_PINNED`
pub const ELEMENT_TYPE_PINNED: u8 = 0x45;

/// Leading byte of a local variable signature.
pub const LOCAL_SIG: u8 = 0x07;

/// Signature of a single `int32` local, used where the real locals are unavailable.
pub const LOCAL_SIG_PLACEHOLDER: [u8; 3] = [LOCAL_SIG, 0x01, 0x08];

const GENERIC_CALLCONV: u8 = 0x10;
const MAX_NESTING: usize = 64;
const MAX_COMPRESSED: u32 = 0x1FFF_FFFF;

/// `true` for element types that are complete in a single byte.
#[must_use]
pub fn is_primitive(tag: u8) -> bool {
    matches!(tag, 0x01..=0x0E | 0x16 | 0x18 | 0x19 | 0x1C)
}

/// Byte source for signature walking.
pub trait SigReader {
    /// Reads the next byte.
    ///
    /// # Errors
    /// Returns an error at the end of the readable range.
    fn read_u8(&mut self) -> Result<u8>;

    /// Reads an ECMA-335 compressed unsigned integer.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for an invalid lead byte or a read error.
    fn read_compressed_uint(&mut self) -> Result<u32> {
        let first = self.read_u8()?;
        if first & 0x80 == 0 {
            return Ok(u32::from(first));
        }

        if first & 0xC0 == 0x80 {
            let second = self.read_u8()?;
            return Ok((u32::from(first & 0x3F) << 8) | u32::from(second));
        }

        if first & 0xE0 == 0xC0 {
            let mut value = u32::from(first & 0x1F);
            for _ in 0..3 {
                value = (value << 8) | u32::from(self.read_u8()?);
            }
            return Ok(value);
        }

        Err(malformed_error!("Invalid compressed uint - {}", first))
    }
}

impl SigReader for Parser<'_> {
    fn read_u8(&mut self) -> Result<u8> {
        self.read_le::<u8>()
    }

    fn read_compressed_uint(&mut self) -> Result<u32> {
        Parser::read_compressed_uint(self)
    }
}

/// Reads signature bytes straight from process memory.
///
/// The compiler's locals pointer has no length attached, so reads are capped at `limit`
/// bytes to keep a corrupt encoding from running off into unrelated memory.
pub struct RawSigReader {
    address: usize,
    consumed: usize,
    limit: usize,
}

impl RawSigReader {
    /// Default cap on the bytes a single walk may consume.
    pub const DEFAULT_LIMIT: usize = 0x1_0000;

    /// Creates a reader starting at `address`.
    ///
    /// # Safety
    ///
    /// The bytes a walk consumes, at most `limit`, must be readable.
    #[must_use]
    pub unsafe fn new(address: usize, limit: usize) -> Self {
        RawSigReader {
            address,
            consumed: 0,
            limit,
        }
    }

    /// Bytes consumed so far.
    #[must_use]
    pub fn consumed(&self) -> usize {
        self.consumed
    }
}

impl SigReader for RawSigReader {
    fn read_u8(&mut self) -> Result<u8> {
        if self.address == 0 || self.consumed >= self.limit {
            return Err(out_of_bounds_error!());
        }

        // SAFETY: `new`'s contract covers every byte below `limit`.
        let byte = unsafe { *((self.address + self.consumed) as *const u8) };
        self.consumed += 1;
        Ok(byte)
    }
}

/// Copies everything read through it into `out`.
struct Recording<'a, R: ?Sized> {
    inner: &'a mut R,
    out: &'a mut Vec<u8>,
}

impl<R: SigReader + ?Sized> SigReader for Recording<'_, R> {
    fn read_u8(&mut self) -> Result<u8> {
        let byte = self.inner.read_u8()?;
        self.out.push(byte);
        Ok(byte)
    }
}

/// Consumes one complete type encoding.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] for unknown element types or excessive nesting, or a
/// read error if the encoding is truncated.
pub fn skip_type<R: SigReader + ?Sized>(reader: &mut R) -> Result<()> {
    skip_type_nested(reader, 0)
}

fn skip_type_nested<R: SigReader + ?Sized>(reader: &mut R, depth: usize) -> Result<()> {
    if depth > MAX_NESTING {
        return Err(malformed_error!("Type encoding nested deeper than {}", MAX_NESTING));
    }

    let tag = reader.read_u8()?;
    if is_primitive(tag) {
        return Ok(());
    }

    match tag {
        ELEMENT_TYPE_VALUETYPE | ELEMENT_TYPE_CLASS | ELEMENT_TYPE_VAR | ELEMENT_TYPE_MVAR => {
            reader.read_compressed_uint()?;
        }
        ELEMENT_TYPE_PTR
        | ELEMENT_TYPE_BYREF
        | ELEMENT_TYPE_SZARRAY
        | ELEMENT_TYPE_PINNED
        | ELEMENT_TYPE_SENTINEL => skip_type_nested(reader, depth + 1)?,
        ELEMENT_TYPE_CMOD_OPT | ELEMENT_TYPE_CMOD_REQD => {
            reader.read_compressed_uint()?;
            skip_type_nested(reader, depth + 1)?;
        }
        ELEMENT_TYPE_ARRAY => {
            skip_type_nested(reader, depth + 1)?;
            let _rank = reader.read_compressed_uint()?;
            for _ in 0..reader.read_compressed_uint()? {
                reader.read_compressed_uint()?;
            }
            // Lower bounds are signed but share the unsigned length encoding.
            for _ in 0..reader.read_compressed_uint()? {
                reader.read_compressed_uint()?;
            }
        }
        ELEMENT_TYPE_GENERICINST => {
            let _kind = reader.read_u8()?;
            reader.read_compressed_uint()?;
            for _ in 0..reader.read_compressed_uint()? {
                skip_type_nested(reader, depth + 1)?;
            }
        }
        ELEMENT_TYPE_FNPTR => {
            let convention = reader.read_u8()?;
            if convention & GENERIC_CALLCONV != 0 {
                reader.read_compressed_uint()?;
            }
            let parameters = reader.read_compressed_uint()?;
            for _ in 0..=parameters {
                skip_type_nested(reader, depth + 1)?;
            }
        }
        _ => return Err(malformed_error!("Unknown element type 0x{:02X}", tag)),
    }

    Ok(())
}

/// Consumes one type encoding and appends its bytes to `out`.
///
/// # Errors
/// See [`skip_type`]. `out` may hold a partial encoding on error.
pub fn copy_type<R: SigReader + ?Sized>(reader: &mut R, out: &mut Vec<u8>) -> Result<()> {
    let mut recording = Recording { inner: reader, out };
    skip_type(&mut recording)
}

/// Appends `value` in ECMA-335 compressed form.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] for values above `0x1FFFFFFF`.
pub fn encode_compressed_uint(value: u32, out: &mut Vec<u8>) -> Result<()> {
    match value {
        0..=0x7F => out.push(value as u8),
        0x80..=0x3FFF => out.extend_from_slice(&[0x80 | (value >> 8) as u8, value as u8]),
        0x4000..=MAX_COMPRESSED => out.extend_from_slice(&[
            0xC0 | (value >> 24) as u8,
            (value >> 16) as u8,
            (value >> 8) as u8,
            value as u8,
        ]),
        _ => {
            return Err(malformed_error!(
                "Value 0x{:X} does not fit a compressed integer",
                value
            ))
        }
    }
    Ok(())
}

/// Prefixes concatenated variable encodings with the local signature header.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] if `count` cannot be encoded.
pub fn build_local_sig(count: u32, variables: &[u8]) -> Result<Vec<u8>> {
    let mut blob = Vec::with_capacity(variables.len() + 5);
    blob.push(LOCAL_SIG);
    encode_compressed_uint(count, &mut blob)?;
    blob.extend_from_slice(variables);
    Ok(blob)
}

/// Reads `count` variable encodings from `reader` and returns the complete local signature.
///
/// # Errors
/// See [`skip_type`].
pub fn read_local_sig<R: SigReader + ?Sized>(reader: &mut R, count: u32) -> Result<Vec<u8>> {
    let mut variables = Vec::new();
    for index in 0..count {
        copy_type(reader, &mut variables).map_err(|error| match error {
            Error::Malformed { message, file, line } => Error::Malformed {
                message: format!("Local {index} - {message}"),
                file,
                line,
            },
            other => other,
        })?;
    }

    build_local_sig(count, &variables)
}

/// Splits a complete local signature into its variable encodings.
///
/// # Errors
/// Returns [`crate::Error::Malformed`] if `blob` is not a local signature or has trailing
/// bytes.
pub fn split_local_sig(blob: &[u8]) -> Result<Vec<&[u8]>> {
    let mut parser = Parser::new(blob);
    let header = parser.read_le::<u8>()?;
    if header != LOCAL_SIG {
        return Err(malformed_error!(
            "Local signature starts with 0x{:02X} instead of 0x07",
            header
        ));
    }

    let count = parser.read_compressed_uint()?;
    let mut variables = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let start = parser.pos();
        skip_type(&mut parser)?;
        variables.push(&blob[start..parser.pos()]);
    }

    if parser.has_more_data() {
        return Err(malformed_error!(
            "{} trailing bytes after {} locals",
            parser.remaining(),
            count
        ));
    }

    Ok(variables)
}
