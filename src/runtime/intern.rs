//! Strong string intern table.

use rustc_hash::FxHashMap;

use crate::runtime::heap::{Heap, HeapObject, ObjectId};

/// Maps string values to their canonical heap object.
///
/// Iteration follows insertion order so that anything derived from the table (GC roots, the
/// image's intern section) is deterministic.
#[derive(Debug, Default)]
pub struct InternTable {
    strong: FxHashMap<String, ObjectId>,
    order: Vec<ObjectId>,
}

impl InternTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        InternTable::default()
    }

    /// Returns the canonical string object for `value`, allocating it if needed.
    ///
    /// The boolean is `true` if a new object was allocated.
    pub fn intern(&mut self, heap: &mut Heap, string_class: ObjectId, value: &str) -> (ObjectId, bool) {
        if let Some(&id) = self.strong.get(value) {
            return (id, false);
        }
        let id = heap.allocate(HeapObject::new_string(string_class, value));
        self.strong.insert(value.to_string(), id);
        self.order.push(id);
        (id, true)
    }

    /// Looks up `value` without interning it.
    #[must_use]
    pub fn lookup(&self, value: &str) -> Option<ObjectId> {
        self.strong.get(value).copied()
    }

    /// Removes `value`; used when rolling back a transaction.
    pub fn remove(&mut self, value: &str) -> Option<ObjectId> {
        let id = self.strong.remove(value)?;
        self.order.retain(|&o| o != id);
        Some(id)
    }

    /// Interned strings in insertion order.
    #[must_use]
    pub fn strings(&self) -> &[ObjectId] {
        &self.order
    }

    /// Number of interned strings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Returns `true` if nothing is interned.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_is_canonical() {
        let mut heap = Heap::new();
        let mut table = InternTable::new();
        let (a, new_a) = table.intern(&mut heap, ObjectId(0), "hello");
        let (b, new_b) = table.intern(&mut heap, ObjectId(0), "hello");
        assert_eq!(a, b);
        assert!(new_a);
        assert!(!new_b);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_remove_forgets_value() {
        let mut heap = Heap::new();
        let mut table = InternTable::new();
        let (a, _) = table.intern(&mut heap, ObjectId(0), "x");
        assert_eq!(table.remove("x"), Some(a));
        assert!(table.lookup("x").is_none());
        assert!(table.is_empty());
    }
}
