//! Dense bit vectors indexed by small integers.
//!
//! Three places in the crate track membership over a dense index range:
//!
//! - the verifier marks instruction starts and branch targets by code unit,
//! - the driver records which method indices of a bytecode file were deferred to the second
//!   quickening pass,
//! - the image writer marks the start of every live object, one bit per object alignment unit.
//!
//! Bits are packed least significant first into 64-bit words, which is exactly the layout the
//! image bitmap section expects once the words are serialized little endian.
//!
//! ```rust,ignore
//! use oatforge::utils::BitSet;
//!
//! let mut deferred = BitSet::new(100);
//! deferred.insert(3);
//! deferred.insert(64);
//!
//! assert!(deferred.contains(64));
//! assert_eq!(deferred.iter().collect::<Vec<_>>(), vec![3, 64]);
//! ```

const WORD_BITS: usize = u64::BITS as usize;

/// Fixed-capacity set of indices in `0..capacity`.
#[derive(Clone, PartialEq, Eq)]
pub struct BitSet {
    words: Vec<u64>,
    capacity: usize,
}

impl BitSet {
    /// Creates a set able to hold the indices `0..capacity`, all clear.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        BitSet {
            words: vec![0; capacity.div_ceil(WORD_BITS)],
            capacity,
        }
    }

    /// Number of indices the set can hold.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// `true` when no index is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !self.words.iter().any(|&word| word != 0)
    }

    /// Number of set indices.
    #[must_use]
    pub fn count(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }

    /// Marks `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is not below [`BitSet::capacity`].
    pub fn insert(&mut self, index: usize) {
        assert!(
            index < self.capacity,
            "bit {index} outside a set of capacity {}",
            self.capacity
        );
        self.words[index / WORD_BITS] |= 1 << (index % WORD_BITS);
    }

    /// Whether `index` is marked. Indices past the capacity are never marked, so a set sized
    /// for one code item or bytecode file can be queried with any index.
    #[must_use]
    pub fn contains(&self, index: usize) -> bool {
        self.words
            .get(index / WORD_BITS)
            .is_some_and(|word| index < self.capacity && word & (1 << (index % WORD_BITS)) != 0)
    }

    /// Set indices in ascending order.
    #[must_use]
    pub fn iter(&self) -> BitSetIter<'_> {
        BitSetIter {
            words: &self.words,
            base: 0,
            pending: self.words.first().copied().unwrap_or(0),
        }
    }

    /// Serializes the words little endian, `8 * ceil(capacity / 64)` bytes in total.
    #[must_use]
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(|word| word.to_le_bytes()).collect()
    }
}

impl std::fmt::Debug for BitSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BitSet[{}] ", self.capacity)?;
        f.debug_set().entries(self.iter()).finish()
    }
}

impl<'a> IntoIterator for &'a BitSet {
    type Item = usize;
    type IntoIter = BitSetIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Ascending iterator over the set indices of a [`BitSet`].
pub struct BitSetIter<'a> {
    words: &'a [u64],
    /// Index of the first bit of the word held in `pending`.
    base: usize,
    /// Bits of the current word not yet yielded.
    pending: u64,
}

impl Iterator for BitSetIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        while self.pending == 0 {
            self.base += WORD_BITS;
            self.pending = *self.words.get(self.base / WORD_BITS)?;
        }
        let bit = self.pending.trailing_zeros() as usize;
        self.pending &= self.pending - 1;
        Some(self.base + bit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marks_branch_targets_of_a_code_item() {
        let mut targets = BitSet::new(12);
        assert!(targets.is_empty());
        for pc in [0, 5, 11] {
            targets.insert(pc);
        }

        assert!(!targets.is_empty());
        assert_eq!(targets.count(), 3);
        assert!(targets.contains(5));
        assert!(!targets.contains(4));
        assert_eq!(targets.iter().collect::<Vec<_>>(), vec![0, 5, 11]);
    }

    #[test]
    fn test_query_past_capacity_is_clear() {
        let mut deferred = BitSet::new(70);
        deferred.insert(69);
        assert!(deferred.contains(69));
        assert!(!deferred.contains(70));
        assert!(!deferred.contains(127));
        assert!(!deferred.contains(10_000));
    }

    #[test]
    #[should_panic(expected = "outside a set of capacity 8")]
    fn test_insert_past_capacity_panics() {
        BitSet::new(8).insert(8);
    }

    #[test]
    fn test_iteration_skips_empty_words() {
        let mut set = BitSet::new(300);
        for index in [1, 63, 64, 255, 299] {
            set.insert(index);
        }
        let collected: Vec<usize> = (&set).into_iter().collect();
        assert_eq!(collected, vec![1, 63, 64, 255, 299]);
        assert_eq!(BitSet::new(0).iter().next(), None);
        assert_eq!(BitSet::new(200).iter().count(), 0);
    }

    #[test]
    fn test_live_object_bitmap_layout() {
        // One bit per 8-byte unit of a 1 KiB object section.
        let mut live = BitSet::new(128);
        live.insert(160 / 8);
        live.insert(1016 / 8);

        let bytes = live.to_le_bytes();
        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes[2], 0b0001_0000);
        assert_eq!(bytes[15], 0b1000_0000);
        assert_eq!(bytes.iter().filter(|&&b| b != 0).count(), 2);
    }

    #[test]
    fn test_debug_lists_members() {
        let mut set = BitSet::new(10);
        set.insert(2);
        set.insert(7);
        assert_eq!(format!("{set:?}"), "BitSet[10] {2, 7}");
    }
}
