//! Little-endian reading and writing of primitive values in byte buffers.
//!
//! Every structure this crate touches, from method-info blocks handed to the compiler to
//! CIL method headers and PE section tables, is little-endian. The helpers here are the
//! single bounds-checked path used to decode and encode them.
//!
//! # Key Components
//!
//! - [`crate::file::io::CilIO`] - Conversion between primitive types and their byte arrays
//! - [`crate::file::io::read_le`] / [`crate::file::io::read_le_at`] - Bounds-checked reads
//! - [`crate::file::io::write_le`] / [`crate::file::io::write_le_at`] - Bounds-checked writes
//!
//! # Examples
//!
//! ```rust,ignore
//! use jitdump::file::io::{read_le_at, write_le_at};
//!
//! let mut data = [0u8; 6];
//! let mut offset = 0;
//! write_le_at(&mut data, &mut offset, 0x1234u16)?;
//! write_le_at(&mut data, &mut offset, 0xDEAD_BEEFu32)?;
//!
//! let mut offset = 2;
//! assert_eq!(read_le_at::<u32>(&data, &mut offset)?, 0xDEAD_BEEF);
//! # Ok::<(), jitdump::Error>(())
//! ```

use crate::Result;

/// Trait for implementing type-specific safe binary data reading operations.
///
/// Each implementation defines a `Bytes` associated type that represents the fixed-size
/// byte array required for that particular type (e.g., `[u8; 4]` for `u32`).
pub trait CilIO: Sized {
    /// Associated type representing the byte array type for this numeric type.
    type Bytes: Sized + AsRef<[u8]> + for<'a> TryFrom<&'a [u8]>;

    /// Read T from a byte buffer in little-endian
    fn from_le_bytes(bytes: Self::Bytes) -> Self;

    /// Write T to a byte buffer in little-endian
    fn to_le_bytes(self) -> Self::Bytes;
}

macro_rules! impl_cilio {
    ($($ty:ty => $len:expr),* $(,)?) => {
        $(
            impl CilIO for $ty {
                type Bytes = [u8; $len];

                fn from_le_bytes(bytes: Self::Bytes) -> Self {
                    <$ty>::from_le_bytes(bytes)
                }

                fn to_le_bytes(self) -> Self::Bytes {
                    <$ty>::to_le_bytes(self)
                }
            }
        )*
    };
}

impl_cilio! {
    u8 => 1, i8 => 1,
    u16 => 2, i16 => 2,
    u32 => 4, i32 => 4,
    u64 => 8, i64 => 8,
    f32 => 4, f64 => 8,
}

/// Safely reads a value of type `T` in little-endian byte order from the start of a buffer.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
pub fn read_le<T: CilIO>(data: &[u8]) -> Result<T> {
    let mut offset = 0_usize;
    read_le_at(data, &mut offset)
}

/// Safely reads a value of type `T` in little-endian byte order at `offset`, advancing the
/// offset by the size of `T`.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if there are insufficient bytes.
pub fn read_le_at<T: CilIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let type_len = std::mem::size_of::<T>();
    let end = offset
        .checked_add(type_len)
        .ok_or(out_of_bounds_error!())?;
    if end > data.len() {
        return Err(out_of_bounds_error!());
    }

    let Ok(read) = data[*offset..end].try_into() else {
        return Err(out_of_bounds_error!());
    };

    *offset = end;
    Ok(T::from_le_bytes(read))
}

/// Writes `value` in little-endian byte order to the start of a buffer.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the buffer is too small.
pub fn write_le<T: CilIO>(data: &mut [u8], value: T) -> Result<()> {
    let mut offset = 0_usize;
    write_le_at(data, &mut offset, value)
}

/// Writes `value` in little-endian byte order at `offset`, advancing the offset by the size
/// of `T`.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the buffer is too small.
pub fn write_le_at<T: CilIO>(data: &mut [u8], offset: &mut usize, value: T) -> Result<()> {
    let bytes = value.to_le_bytes();
    let bytes = bytes.as_ref();
    let end = offset
        .checked_add(bytes.len())
        .ok_or(out_of_bounds_error!())?;
    if end > data.len() {
        return Err(out_of_bounds_error!());
    }

    data[*offset..end].copy_from_slice(bytes);
    *offset = end;
    Ok(())
}
