//! Alignment and width conversion helpers used by the image layout code.

use crate::Result;

/// Converts a `usize` to `u32`, returning an error if the value exceeds `u32::MAX`.
///
/// Image offsets and sizes are stored as 32-bit values in the header and in relocated
/// references.
///
/// # Errors
///
/// Returns an error if `value` exceeds `u32::MAX`.
pub fn to_u32(value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| malformed_error!("Image value {value} exceeds u32::MAX"))
}

/// Rounds `value` up to the next multiple of `alignment`.
///
/// # Panics
///
/// Panics if `alignment` is not a power of two.
#[must_use]
pub const fn align_up(value: usize, alignment: usize) -> usize {
    assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Returns `true` if `value` is a multiple of `alignment`.
#[must_use]
pub const fn is_aligned(value: usize, alignment: usize) -> bool {
    value & (alignment - 1) == 0
}

/// Java-style modified UTF-8 string hash (`h = 31 * h + c`), used for class table and intern
/// table entries.
#[must_use]
pub fn descriptor_hash(value: &str) -> u32 {
    value
        .encode_utf16()
        .fold(0u32, |hash, c| hash.wrapping_mul(31).wrapping_add(u32::from(c)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 8), 0);
        assert_eq!(align_up(1, 8), 8);
        assert_eq!(align_up(8, 8), 8);
        assert_eq!(align_up(4097, 4096), 8192);
    }

    #[test]
    fn test_is_aligned() {
        assert!(is_aligned(16, 8));
        assert!(!is_aligned(12, 8));
    }

    #[test]
    fn test_descriptor_hash() {
        assert_eq!(descriptor_hash(""), 0);
        assert_eq!(descriptor_hash("a"), 97);
        assert_eq!(descriptor_hash("ab"), 97 * 31 + 98);
    }

    #[test]
    fn test_to_u32() {
        assert_eq!(to_u32(42).unwrap(), 42);
        #[cfg(target_pointer_width = "64")]
        assert!(to_u32(usize::MAX).is_err());
    }
}
