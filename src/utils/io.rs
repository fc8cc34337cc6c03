//! Bounds-checked little-endian reads and writes over byte buffers.
//!
//! Image headers, native records and relocated references are all serialized little-endian.
//! Every accessor checks the buffer length and fails with [`crate::Error::OutOfBounds`] instead
//! of panicking, so a truncated image is reported as an error when it is read back.
//!
//! # Examples
//!
//! ```rust,ignore
//! use oatforge::utils::{read_le_at, write_le_at};
//!
//! let mut data = [0u8; 6];
//! let mut offset = 0;
//! write_le_at(&mut data, &mut offset, 1u16)?;
//! write_le_at(&mut data, &mut offset, 2u32)?;
//!
//! offset = 0;
//! assert_eq!(read_le_at::<u16>(&data, &mut offset)?, 1);
//! assert_eq!(read_le_at::<u32>(&data, &mut offset)?, 2);
//! # Ok::<(), oatforge::Error>(())
//! ```

use crate::{Error::OutOfBounds, Result};

/// Primitive types with a fixed little-endian encoding.
pub trait LeIO: Sized + Copy {
    /// Byte array holding one encoded value.
    type Bytes: Sized + AsRef<[u8]> + for<'a> TryFrom<&'a [u8]>;

    /// Decodes a value.
    fn from_le_bytes(bytes: Self::Bytes) -> Self;

    /// Encodes a value.
    fn to_le_bytes(self) -> Self::Bytes;
}

macro_rules! impl_le_io {
    ($($ty:ty => $n:expr),* $(,)?) => {
        $(
            impl LeIO for $ty {
                type Bytes = [u8; $n];

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

impl_le_io!(u8 => 1, u16 => 2, u32 => 4, i32 => 4, u64 => 8);

/// Reads a value from the start of `data`.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if `data` is too short.
pub fn read_le<T: LeIO>(data: &[u8]) -> Result<T> {
    let mut offset = 0_usize;
    read_le_at(data, &mut offset)
}

/// Reads a value at `offset` and advances `offset` past it.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if fewer than `size_of::<T>()` bytes remain.
pub fn read_le_at<T: LeIO>(data: &[u8], offset: &mut usize) -> Result<T> {
    let type_len = std::mem::size_of::<T>();
    let end = offset.checked_add(type_len).ok_or(OutOfBounds)?;
    if end > data.len() {
        return Err(OutOfBounds);
    }

    let Ok(read) = data[*offset..end].try_into() else {
        return Err(OutOfBounds);
    };

    *offset = end;
    Ok(T::from_le_bytes(read))
}

/// Writes a value at `offset` and advances `offset` past it.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if fewer than `size_of::<T>()` bytes remain.
pub fn write_le_at<T: LeIO>(data: &mut [u8], offset: &mut usize, value: T) -> Result<()> {
    let bytes = value.to_le_bytes();
    let bytes = bytes.as_ref();
    let end = offset.checked_add(bytes.len()).ok_or(OutOfBounds)?;
    if end > data.len() {
        return Err(OutOfBounds);
    }

    data[*offset..end].copy_from_slice(bytes);
    *offset = end;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_BUFFER: [u8; 8] = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];

    #[test]
    fn read_le_u32() {
        let result = read_le::<u32>(&TEST_BUFFER).unwrap();
        assert_eq!(result, 0x0403_0201);
    }

    #[test]
    fn read_le_u64() {
        let result = read_le::<u64>(&TEST_BUFFER).unwrap();
        assert_eq!(result, 0x0807_0605_0403_0201);
    }

    #[test]
    fn read_le_at_advances() {
        let mut offset = 2;
        let value: u16 = read_le_at(&TEST_BUFFER, &mut offset).unwrap();
        assert_eq!(value, 0x0403);
        assert_eq!(offset, 4);
    }

    #[test]
    fn read_le_past_end() {
        let mut offset = 6;
        assert!(matches!(
            read_le_at::<u32>(&TEST_BUFFER, &mut offset),
            Err(OutOfBounds)
        ));
        assert_eq!(offset, 6);
    }

    #[test]
    fn write_le_sequence() {
        let mut data = [0u8; 7];
        let mut offset = 0;
        write_le_at(&mut data, &mut offset, 1u16).unwrap();
        write_le_at(&mut data, &mut offset, -2i32).unwrap();
        write_le_at(&mut data, &mut offset, 3u8).unwrap();
        assert_eq!(data, [0x01, 0x00, 0xFE, 0xFF, 0xFF, 0xFF, 0x03]);
        assert_eq!(offset, 7);
        assert!(write_le_at(&mut data, &mut offset, 0u8).is_err());
    }
}
