//! Shared low-level helpers.

mod bitset;
mod io;
mod leb128;
mod math;

pub use bitset::{BitSet, BitSetIter};
pub use io::{read_le, read_le_at, write_le_at, LeIO};
pub use leb128::{read_unsigned_leb128, unsigned_leb128_size, write_unsigned_leb128};
pub use math::{align_up, descriptor_hash, is_aligned, to_u32};
