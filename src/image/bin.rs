//! Bins group image objects by how likely they are to be written after the image is loaded.
//!
//! Mirror objects (heap objects) are placed in the first [`Bin::MIRROR_COUNT`] bins; native
//! runtime structures follow. The enum order is the order of the bins in the image.
//!
//! ```text
//! mirrors  MiscDirty | ClassVerified | Regular | ClassInitialized
//!          | ClassInitializedFinalStatics | String
//! natives  ArtField | ArtMethodClean | ArtMethodDirty | ImTable
//!          | ImtConflictTable | RuntimeMethod | DexCacheArray
//! ```

use std::fmt;

use strum::{Display, EnumCount, EnumIter, IntoEnumIterator};

use crate::runtime::heap::{OBJECT_ALIGNMENT, POINTER_SIZE};

/// Placement category of an image object.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumIter, EnumCount,
)]
#[repr(u8)]
pub enum Bin {
    /// Dex caches and lock objects
    MiscDirty,
    /// Classes whose initializer has not run
    ClassVerified,
    /// Anything not classified elsewhere
    Regular,
    /// Initialized classes with mutable statics
    ClassInitialized,
    /// Initialized classes without statics or with only final ones
    ClassInitializedFinalStatics,
    /// Strings, immutable apart from the header
    String,
    /// Field records
    ArtField,
    /// Methods of initialized classes without native methods
    ArtMethodClean,
    /// Methods that the runtime will patch after loading
    ArtMethodDirty,
    /// Interface method tables
    ImTable,
    /// Interface method conflict tables
    ImtConflictTable,
    /// Runtime-owned methods
    RuntimeMethod,
    /// Arrays backing the dex caches
    DexCacheArray,
}

impl Bin {
    /// Number of bins holding mirror objects.
    pub const MIRROR_COUNT: usize = Bin::ArtField as usize;

    /// Position of the bin in the image.
    #[must_use]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Returns the bin at `index`.
    #[must_use]
    pub fn from_index(index: usize) -> Option<Bin> {
        Bin::iter().nth(index)
    }

    /// Returns `true` for bins holding heap objects.
    #[must_use]
    pub fn is_mirror(self) -> bool {
        self.index() < Self::MIRROR_COUNT
    }

    /// Alignment of the start of the bin.
    #[must_use]
    pub fn alignment(self) -> usize {
        match self {
            Bin::ArtField => 4,
            Bin::ArtMethodClean | Bin::ArtMethodDirty | Bin::ImTable | Bin::ImtConflictTable => {
                POINTER_SIZE as usize
            }
            _ => OBJECT_ALIGNMENT,
        }
    }
}

/// Bin and bin-relative offset of a mirror object, packed into 32 bits.
///
/// The bin tag occupies the top bits and the offset the rest, mirroring the lock word encoding
/// the runtime uses for forwarding addresses.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BinSlot(u32);

impl BinSlot {
    /// Bits needed to store the tag of every mirror bin.
    pub const BIN_BITS: u32 = usize::BITS - (Bin::MIRROR_COUNT - 1).leading_zeros();
    /// Position of the bin tag.
    pub const BIN_SHIFT: u32 = u32::BITS - Self::BIN_BITS;
    /// Mask of the offset bits.
    pub const INDEX_MASK: u32 = (1 << Self::BIN_SHIFT) - 1;

    /// Packs `index` into `bin`.
    ///
    /// # Panics
    /// Panics if `bin` is not a mirror bin or `index` does not fit the offset bits.
    #[must_use]
    pub fn new(bin: Bin, index: u32) -> Self {
        assert!(bin.is_mirror(), "{bin} does not hold mirror objects");
        assert!(
            index <= Self::INDEX_MASK,
            "Bin offset {index:#x} does not fit a bin slot"
        );
        #[allow(clippy::cast_possible_truncation)]
        let tag = bin.index() as u32;
        BinSlot((tag << Self::BIN_SHIFT) | index)
    }

    /// Reinterprets a packed value.
    #[must_use]
    pub fn from_raw(raw: u32) -> Self {
        BinSlot(raw)
    }

    /// The packed value.
    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }

    /// The bin.
    ///
    /// # Panics
    /// Panics if the tag was not produced by [`BinSlot::new`].
    #[must_use]
    pub fn bin(self) -> Bin {
        match Bin::from_index((self.0 >> Self::BIN_SHIFT) as usize) {
            Some(bin) if bin.is_mirror() => bin,
            _ => panic!("Invalid bin slot {:#x}", self.0),
        }
    }

    /// Offset of the object within its bin.
    #[must_use]
    pub fn index(self) -> u32 {
        self.0 & Self::INDEX_MASK
    }
}

impl fmt::Debug for BinSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BinSlot({}+{:#x})", self.bin(), self.index())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bin_order() {
        let bins: Vec<Bin> = Bin::iter().collect();
        assert_eq!(bins.len(), Bin::COUNT);
        assert_eq!(bins[0], Bin::MiscDirty);
        assert_eq!(bins[Bin::MIRROR_COUNT], Bin::ArtField);
        assert_eq!(bins[Bin::COUNT - 1], Bin::DexCacheArray);
        assert!(Bin::String.is_mirror());
        assert!(!Bin::RuntimeMethod.is_mirror());
        assert_eq!(Bin::from_index(Bin::ImTable.index()), Some(Bin::ImTable));
        assert_eq!(Bin::from_index(Bin::COUNT), None);
    }

    #[test]
    fn test_bin_slot_packing() {
        assert_eq!(BinSlot::BIN_BITS, 3);
        assert_eq!(BinSlot::BIN_SHIFT, 29);

        let slot = BinSlot::new(Bin::ClassInitializedFinalStatics, 0x1234);
        assert_eq!(slot.bin(), Bin::ClassInitializedFinalStatics);
        assert_eq!(slot.index(), 0x1234);
        assert_eq!(BinSlot::from_raw(slot.raw()), slot);

        let last = BinSlot::new(Bin::String, BinSlot::INDEX_MASK);
        assert_eq!(last.bin(), Bin::String);
        assert_eq!(last.index(), BinSlot::INDEX_MASK);
    }

    #[test]
    #[should_panic(expected = "does not hold mirror objects")]
    fn test_native_bin_rejected() {
        let _ = BinSlot::new(Bin::ArtField, 0);
    }

    #[test]
    #[should_panic(expected = "does not fit")]
    fn test_oversized_offset_rejected() {
        let _ = BinSlot::new(Bin::Regular, BinSlot::INDEX_MASK + 1);
    }
}
