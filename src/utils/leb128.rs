//! Unsigned LEB128 encoding.
//!
//! Quickening information stored in a method's vmap table is a flat stream of unsigned LEB128
//! values. Each value is emitted in groups of seven bits, least significant group first, with the
//! high bit of every byte but the last set.

use crate::{Error::OutOfBounds, Result};

/// Appends `value` to `out` as unsigned LEB128.
///
/// # Arguments
///
/// * `out` - The buffer to append to
/// * `value` - The value to encode
pub fn write_unsigned_leb128(out: &mut Vec<u8>, mut value: u32) {
    loop {
        #[allow(clippy::cast_possible_truncation)]
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Decodes one unsigned LEB128 value from `data` starting at `*offset`, advancing the offset.
///
/// # Errors
///
/// Returns [`crate::Error::OutOfBounds`] if the stream ends in the middle of a value, or
/// [`crate::Error::Malformed`] if the value does not fit in 32 bits.
pub fn read_unsigned_leb128(data: &[u8], offset: &mut usize) -> Result<u32> {
    let mut result: u32 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *data.get(*offset).ok_or(OutOfBounds)?;
        *offset += 1;
        if shift == 28 && (byte & 0xF0) != 0 {
            return Err(malformed_error!("LEB128 value at {} overflows u32", *offset - 1));
        }
        result |= u32::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(result);
        }
        shift += 7;
    }
}

/// Returns the number of bytes `value` occupies when LEB128 encoded.
#[must_use]
pub fn unsigned_leb128_size(value: u32) -> usize {
    let bits = 32 - (value | 1).leading_zeros() as usize;
    bits.div_ceil(7)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leb128_known_encodings() {
        let mut out = Vec::new();
        write_unsigned_leb128(&mut out, 0);
        write_unsigned_leb128(&mut out, 127);
        write_unsigned_leb128(&mut out, 128);
        write_unsigned_leb128(&mut out, 0xFFFF);
        assert_eq!(out, vec![0x00, 0x7F, 0x80, 0x01, 0xFF, 0xFF, 0x03]);
    }

    #[test]
    fn test_leb128_sequential_decode() {
        let data = [0x00, 0x7F, 0x80, 0x01, 0xFF, 0xFF, 0x03];
        let mut offset = 0;
        assert_eq!(read_unsigned_leb128(&data, &mut offset).unwrap(), 0);
        assert_eq!(read_unsigned_leb128(&data, &mut offset).unwrap(), 127);
        assert_eq!(read_unsigned_leb128(&data, &mut offset).unwrap(), 128);
        assert_eq!(read_unsigned_leb128(&data, &mut offset).unwrap(), 0xFFFF);
        assert_eq!(offset, data.len());
    }

    #[test]
    fn test_leb128_truncated() {
        let data = [0x80];
        let mut offset = 0;
        assert!(read_unsigned_leb128(&data, &mut offset).is_err());
    }

    #[test]
    fn test_leb128_size() {
        assert_eq!(unsigned_leb128_size(0), 1);
        assert_eq!(unsigned_leb128_size(127), 1);
        assert_eq!(unsigned_leb128_size(128), 2);
        assert_eq!(unsigned_leb128_size(u32::MAX), 5);
    }
}
