//! Arena-backed object heap.
//!
//! Every managed object lives in a [`Heap`] slot addressed by a dense [`ObjectId`]. An object
//! keeps its raw instance bytes (header bytes included, left zero) together with side lists of
//! its reference slots and native pointer slots, so that the image writer can copy the bytes and
//! rewrite exactly the slots that hold pointers.
//!
//! Objects allocated before [`Heap::mark_boot_image_space`] form the boot image space: they are
//! never collected, and app image builds treat them as already relocated.

use rustc_hash::FxHashSet;

use crate::{
    dex::DexFileId,
    runtime::class::{ClassId, NativePtr},
    utils::align_up,
};

/// Size of the object header: class reference followed by the lock word.
pub const OBJECT_HEADER_SIZE: u32 = 8;
/// Offset of the lock word inside the header.
pub const LOCK_WORD_OFFSET: u32 = 4;
/// Alignment of every object.
pub const OBJECT_ALIGNMENT: usize = 8;
/// Size of a compressed heap reference.
pub const HEAP_REFERENCE_SIZE: u32 = 4;
/// Size of a native pointer in the target image.
pub const POINTER_SIZE: u32 = 8;
/// Offset of the length field of arrays.
pub const ARRAY_LENGTH_OFFSET: u32 = 8;
/// Offset of the first element of arrays with 4-byte (or smaller) elements.
pub const ARRAY_DATA_OFFSET: u32 = 12;
/// Offset of the first element of arrays with 8-byte elements.
pub const WIDE_ARRAY_DATA_OFFSET: u32 = 16;
/// Offset of `String.count`.
pub const STRING_COUNT_OFFSET: u32 = 8;
/// Offset of `String.hash`.
pub const STRING_HASH_OFFSET: u32 = 12;
/// Offset of the UTF-16 payload of strings.
pub const STRING_VALUE_OFFSET: u32 = 16;
/// Offset of `Reference.referent`.
pub const REFERENCE_REFERENT_OFFSET: u32 = 8;

/// Identity of a heap object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(pub u32);

impl ObjectId {
    /// Returns the id as an arena index.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// State of an object's lock word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockWord {
    /// Not locked, no hash code
    #[default]
    Unlocked,
    /// Thin lock held by `owner`, entered `count` times
    ThinLocked {
        /// Owning thread id
        owner: u16,
        /// Recursion count
        count: u16,
    },
    /// Inflated lock backed by a monitor
    FatLocked {
        /// Monitor id
        monitor: u32,
    },
    /// Identity hash code has been computed
    HashCode(u32),
    /// Object was moved, the payload is the new address
    ForwardingAddress(u32),
}

impl LockWord {
    const STATE_SHIFT: u32 = 30;
    const PAYLOAD_MASK: u32 = (1 << Self::STATE_SHIFT) - 1;

    /// Encodes the lock word as stored in the object header: two state bits on top, a 30-bit
    /// payload below.
    #[must_use]
    pub fn encode(self) -> u32 {
        match self {
            LockWord::Unlocked => 0,
            LockWord::ThinLocked { owner, count } => {
                (u32::from(count & 0x3FFF) << 16) | u32::from(owner)
            }
            LockWord::FatLocked { monitor } => {
                (1 << Self::STATE_SHIFT) | (monitor & Self::PAYLOAD_MASK)
            }
            LockWord::HashCode(hash) => (2 << Self::STATE_SHIFT) | (hash & Self::PAYLOAD_MASK),
            LockWord::ForwardingAddress(address) => {
                (3 << Self::STATE_SHIFT) | ((address >> 3) & Self::PAYLOAD_MASK)
            }
        }
    }

    /// Decodes a header lock word.
    #[must_use]
    pub fn decode(value: u32) -> Self {
        let payload = value & Self::PAYLOAD_MASK;
        match value >> Self::STATE_SHIFT {
            0 if value == 0 => LockWord::Unlocked,
            0 => LockWord::ThinLocked {
                owner: (value & 0xFFFF) as u16,
                count: ((value >> 16) & 0x3FFF) as u16,
            },
            1 => LockWord::FatLocked { monitor: payload },
            2 => LockWord::HashCode(payload),
            _ => LockWord::ForwardingAddress(payload << 3),
        }
    }
}

/// What kind of object a heap slot holds. Drives size computation, reference visiting and the
/// image writer's bin and fixup decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectKind {
    /// A plain instance laid out by its class
    Instance,
    /// A `java.lang.String` with the given value
    String(String),
    /// A `java.lang.Class` mirror of the given class
    Class(ClassId),
    /// The `DexCache` of a bytecode file
    DexCache(DexFileId),
    /// An array of references
    ObjectArray,
    /// An array of primitives with the given element size
    PrimitiveArray(u8),
    /// An array of native method pointers (vtables)
    PointerArray,
    /// A `java.lang.ref.Reference` with its referent
    Reference(Option<ObjectId>),
    /// A class loader instance
    ClassLoader,
    /// A `java.lang.reflect.Method` or `Constructor`
    Executable,
}

/// A field value as read from or written to an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    /// Raw primitive bits, zero-extended
    Primitive(u64),
    /// A reference, possibly null
    Reference(Option<ObjectId>),
}

impl Value {
    /// The null reference.
    pub const NULL: Value = Value::Reference(None);

    /// Primitive bits, or zero for references.
    #[must_use]
    pub fn bits(self) -> u64 {
        match self {
            Value::Primitive(bits) => bits,
            Value::Reference(_) => 0,
        }
    }

    /// Referenced object, or `None` for primitives and null.
    #[must_use]
    pub fn reference(self) -> Option<ObjectId> {
        match self {
            Value::Reference(r) => r,
            Value::Primitive(_) => None,
        }
    }
}

/// A managed object.
#[derive(Debug, Clone)]
pub struct HeapObject {
    pub(crate) class: ObjectId,
    pub(crate) lock_word: LockWord,
    pub(crate) kind: ObjectKind,
    pub(crate) data: Vec<u8>,
    pub(crate) references: Vec<(u32, Option<ObjectId>)>,
    pub(crate) natives: Vec<(u32, NativePtr)>,
}

impl HeapObject {
    /// Creates an object of `size` bytes with the given reference and native slot offsets, all
    /// null.
    #[must_use]
    pub fn new(
        class: ObjectId,
        kind: ObjectKind,
        size: u32,
        reference_offsets: &[u32],
        native_offsets: &[u32],
    ) -> Self {
        let mut references: Vec<(u32, Option<ObjectId>)> =
            reference_offsets.iter().map(|&o| (o, None)).collect();
        references.sort_unstable_by_key(|&(o, _)| o);
        let mut natives: Vec<(u32, NativePtr)> =
            native_offsets.iter().map(|&o| (o, NativePtr::Null)).collect();
        natives.sort_unstable_by_key(|&(o, _)| o);
        HeapObject {
            class,
            lock_word: LockWord::Unlocked,
            kind,
            data: vec![0; align_up(size as usize, OBJECT_ALIGNMENT)],
            references,
            natives,
        }
    }

    /// Creates a string object holding `value`.
    #[must_use]
    pub fn new_string(string_class: ObjectId, value: &str) -> Self {
        let chars: Vec<u16> = value.encode_utf16().collect();
        #[allow(clippy::cast_possible_truncation)]
        let size = STRING_VALUE_OFFSET + 2 * chars.len() as u32;
        let mut object = HeapObject::new(
            string_class,
            ObjectKind::String(value.to_string()),
            size,
            &[],
            &[],
        );
        #[allow(clippy::cast_possible_truncation)]
        object.write_u32(STRING_COUNT_OFFSET, chars.len() as u32);
        object.write_u32(STRING_HASH_OFFSET, crate::utils::descriptor_hash(value));
        for (i, c) in chars.iter().enumerate() {
            let at = STRING_VALUE_OFFSET as usize + 2 * i;
            object.data[at..at + 2].copy_from_slice(&c.to_le_bytes());
        }
        object
    }

    /// Creates an object array with the given elements.
    #[must_use]
    pub fn new_object_array(array_class: ObjectId, elements: &[Option<ObjectId>]) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let len = elements.len() as u32;
        let offsets: Vec<u32> = (0..len)
            .map(|i| ARRAY_DATA_OFFSET + i * HEAP_REFERENCE_SIZE)
            .collect();
        let mut object = HeapObject::new(
            array_class,
            ObjectKind::ObjectArray,
            ARRAY_DATA_OFFSET + len * HEAP_REFERENCE_SIZE,
            &offsets,
            &[],
        );
        object.write_u32(ARRAY_LENGTH_OFFSET, len);
        for (slot, element) in object.references.iter_mut().zip(elements) {
            slot.1 = *element;
        }
        object
    }

    /// Creates a zeroed primitive array.
    #[must_use]
    pub fn new_primitive_array(array_class: ObjectId, component_size: u8, len: u32) -> Self {
        let data_offset = if component_size == 8 {
            WIDE_ARRAY_DATA_OFFSET
        } else {
            ARRAY_DATA_OFFSET
        };
        let mut object = HeapObject::new(
            array_class,
            ObjectKind::PrimitiveArray(component_size),
            data_offset + len * u32::from(component_size),
            &[],
            &[],
        );
        object.write_u32(ARRAY_LENGTH_OFFSET, len);
        object
    }

    /// Creates a native pointer array with the given elements.
    #[must_use]
    pub fn new_pointer_array(array_class: ObjectId, elements: &[NativePtr]) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let len = elements.len() as u32;
        let offsets: Vec<u32> = (0..len)
            .map(|i| WIDE_ARRAY_DATA_OFFSET + i * POINTER_SIZE)
            .collect();
        let mut object = HeapObject::new(
            array_class,
            ObjectKind::PointerArray,
            WIDE_ARRAY_DATA_OFFSET + len * POINTER_SIZE,
            &[],
            &offsets,
        );
        object.write_u32(ARRAY_LENGTH_OFFSET, len);
        for (slot, element) in object.natives.iter_mut().zip(elements) {
            slot.1 = *element;
        }
        object
    }

    /// Mirror of this object's class.
    #[must_use]
    pub fn class(&self) -> ObjectId {
        self.class
    }

    /// Kind of the object.
    #[must_use]
    pub fn kind(&self) -> &ObjectKind {
        &self.kind
    }

    /// Current lock word.
    #[must_use]
    pub fn lock_word(&self) -> LockWord {
        self.lock_word
    }

    /// Replaces the lock word.
    pub fn set_lock_word(&mut self, lock_word: LockWord) {
        self.lock_word = lock_word;
    }

    /// Size in bytes, rounded to the object alignment.
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Raw instance bytes. Header and pointer slots are zero.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Reference slots as (offset, referent) pairs, ordered by offset.
    #[must_use]
    pub fn references(&self) -> &[(u32, Option<ObjectId>)] {
        &self.references
    }

    /// Native pointer slots as (offset, pointer) pairs, ordered by offset.
    #[must_use]
    pub fn natives(&self) -> &[(u32, NativePtr)] {
        &self.natives
    }

    /// Returns the reference stored at `offset`.
    ///
    /// # Panics
    /// Panics if `offset` is not a reference slot of this object.
    #[must_use]
    pub fn reference(&self, offset: u32) -> Option<ObjectId> {
        match self.references.binary_search_by_key(&offset, |&(o, _)| o) {
            Ok(pos) => self.references[pos].1,
            Err(_) => panic!("offset {offset} is not a reference slot of {:?}", self.kind),
        }
    }

    /// Stores a reference at `offset`, returning the previous value.
    ///
    /// # Panics
    /// Panics if `offset` is not a reference slot of this object.
    pub fn set_reference(&mut self, offset: u32, value: Option<ObjectId>) -> Option<ObjectId> {
        match self.references.binary_search_by_key(&offset, |&(o, _)| o) {
            Ok(pos) => std::mem::replace(&mut self.references[pos].1, value),
            Err(_) => panic!("offset {offset} is not a reference slot of {:?}", self.kind),
        }
    }

    /// Stores a native pointer at `offset`.
    ///
    /// # Panics
    /// Panics if `offset` is not a native slot of this object.
    pub fn set_native(&mut self, offset: u32, value: NativePtr) {
        match self.natives.binary_search_by_key(&offset, |&(o, _)| o) {
            Ok(pos) => self.natives[pos].1 = value,
            Err(_) => panic!("offset {offset} is not a native slot of {:?}", self.kind),
        }
    }

    /// Returns `true` if `offset` is one of the reference slots.
    #[must_use]
    pub fn is_reference_slot(&self, offset: u32) -> bool {
        self.references
            .binary_search_by_key(&offset, |&(o, _)| o)
            .is_ok()
    }

    /// Reads `len` primitive bytes at `offset`.
    #[must_use]
    pub fn read_bytes(&self, offset: u32, len: usize) -> &[u8] {
        &self.data[offset as usize..offset as usize + len]
    }

    /// Writes primitive bytes at `offset`, returning the previous contents.
    pub fn write_bytes(&mut self, offset: u32, bytes: &[u8]) -> Vec<u8> {
        let range = offset as usize..offset as usize + bytes.len();
        let old = self.data[range.clone()].to_vec();
        self.data[range].copy_from_slice(bytes);
        old
    }

    /// Writes a little-endian `u32` at `offset`.
    pub fn write_u32(&mut self, offset: u32, value: u32) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    /// Reads a little-endian `u32` at `offset`.
    #[must_use]
    pub fn read_u32(&self, offset: u32) -> u32 {
        let b = self.read_bytes(offset, 4);
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    /// Reads a field of `size` bytes at `offset`.
    #[must_use]
    pub fn get_field(&self, offset: u32, size: usize, is_reference: bool) -> Value {
        if is_reference {
            return Value::Reference(self.reference(offset));
        }
        let mut raw = [0u8; 8];
        raw[..size].copy_from_slice(self.read_bytes(offset, size));
        Value::Primitive(u64::from_le_bytes(raw))
    }

    /// Writes a field of `size` bytes at `offset`, returning the previous value.
    pub fn set_field(&mut self, offset: u32, size: usize, value: Value) -> Value {
        match value {
            Value::Reference(r) => Value::Reference(self.set_reference(offset, r)),
            Value::Primitive(bits) => {
                let old = self.get_field(offset, size, false);
                self.write_bytes(offset, &bits.to_le_bytes()[..size]);
                old
            }
        }
    }

    /// Visits the class reference, every reference slot and the referent of references.
    pub fn visit_references(&self, mut visitor: impl FnMut(Option<ObjectId>)) {
        visitor(Some(self.class));
        for &(_, referent) in &self.references {
            visitor(referent);
        }
        if let ObjectKind::Reference(referent) = self.kind {
            visitor(referent);
        }
    }
}

/// The object heap.
#[derive(Debug, Default)]
pub struct Heap {
    objects: Vec<Option<HeapObject>>,
    bytes_allocated: usize,
    boot_image_end: u32,
}

impl Heap {
    /// Creates an empty heap.
    #[must_use]
    pub fn new() -> Self {
        Heap::default()
    }

    /// Allocates `object` and returns its id.
    #[allow(clippy::cast_possible_truncation)]
    pub fn allocate(&mut self, object: HeapObject) -> ObjectId {
        self.bytes_allocated += object.size();
        self.objects.push(Some(object));
        ObjectId((self.objects.len() - 1) as u32)
    }

    /// Releases `id`. Boot image objects are never released.
    pub fn free(&mut self, id: ObjectId) {
        if self.is_in_boot_image_space(id) {
            return;
        }
        if let Some(slot) = self.objects.get_mut(id.index()) {
            if let Some(object) = slot.take() {
                self.bytes_allocated -= object.size();
            }
        }
    }

    /// Returns the object if it is live.
    #[must_use]
    pub fn get(&self, id: ObjectId) -> Option<&HeapObject> {
        self.objects.get(id.index()).and_then(Option::as_ref)
    }

    /// Returns the object mutably if it is live.
    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut HeapObject> {
        self.objects.get_mut(id.index()).and_then(Option::as_mut)
    }

    /// Returns the live object `id`.
    ///
    /// # Panics
    /// Panics on a dangling id; a live reference to a freed object is a heap corruption.
    #[must_use]
    pub fn object(&self, id: ObjectId) -> &HeapObject {
        match self.get(id) {
            Some(object) => object,
            None => panic!("dangling reference to {id:?}"),
        }
    }

    /// Mutable variant of [`Heap::object`].
    ///
    /// # Panics
    /// Panics on a dangling id.
    pub fn object_mut(&mut self, id: ObjectId) -> &mut HeapObject {
        match self.get_mut(id) {
            Some(object) => object,
            None => panic!("dangling reference to {id:?}"),
        }
    }

    /// Returns `true` if `id` is live.
    #[must_use]
    pub fn contains(&self, id: ObjectId) -> bool {
        self.get(id).is_some()
    }

    /// Number of bytes held by live objects.
    #[must_use]
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Number of live objects.
    #[must_use]
    pub fn num_objects(&self) -> usize {
        self.objects.iter().filter(|o| o.is_some()).count()
    }

    /// Upper bound of object ids handed out so far.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.objects.len()
    }

    /// Calls `visitor` for every live object in id order.
    pub fn visit_objects(&self, mut visitor: impl FnMut(ObjectId, &HeapObject)) {
        for (idx, slot) in self.objects.iter().enumerate() {
            if let Some(object) = slot {
                #[allow(clippy::cast_possible_truncation)]
                visitor(ObjectId(idx as u32), object);
            }
        }
    }

    /// Declares every object allocated so far to be part of the boot image space.
    #[allow(clippy::cast_possible_truncation)]
    pub fn mark_boot_image_space(&mut self) {
        self.boot_image_end = self.objects.len() as u32;
    }

    /// Returns `true` if `id` lives in the boot image space.
    #[must_use]
    pub fn is_in_boot_image_space(&self, id: ObjectId) -> bool {
        id.0 < self.boot_image_end
    }

    /// Returns `true` if a boot image space exists.
    #[must_use]
    pub fn has_boot_image_space(&self) -> bool {
        self.boot_image_end > 0
    }

    /// Mark-sweep collection from `roots`. Boot image objects are always retained.
    ///
    /// Returns the number of freed objects.
    pub fn collect_garbage(&mut self, roots: &[ObjectId]) -> usize {
        let mut marked = FxHashSet::default();
        let mut stack: Vec<ObjectId> = roots.to_vec();
        while let Some(id) = stack.pop() {
            if !marked.insert(id) {
                continue;
            }
            if let Some(object) = self.get(id) {
                object.visit_references(|referent| {
                    if let Some(r) = referent {
                        if !marked.contains(&r) {
                            stack.push(r);
                        }
                    }
                });
            }
        }

        let mut freed = 0;
        for idx in self.boot_image_end as usize..self.objects.len() {
            #[allow(clippy::cast_possible_truncation)]
            let id = ObjectId(idx as u32);
            if self.objects[idx].is_some() && !marked.contains(&id) {
                self.free(id);
                freed += 1;
            }
        }
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(class: ObjectId, refs: &[u32]) -> HeapObject {
        HeapObject::new(class, ObjectKind::Instance, 8 + 4 * refs.len() as u32, refs, &[])
    }

    #[test]
    fn test_lock_word_roundtrip_states() {
        for word in [
            LockWord::Unlocked,
            LockWord::ThinLocked { owner: 7, count: 2 },
            LockWord::FatLocked { monitor: 99 },
            LockWord::HashCode(0x1234_5678 & 0x3FFF_FFFF),
            LockWord::ForwardingAddress(0x7000_0008 & 0x3FFF_FFF8),
        ] {
            assert_eq!(LockWord::decode(word.encode()), word);
        }
    }

    #[test]
    fn test_string_layout() {
        let string = HeapObject::new_string(ObjectId(0), "hi");
        assert_eq!(string.size(), 24);
        assert_eq!(string.read_u32(STRING_COUNT_OFFSET), 2);
        assert_eq!(string.read_bytes(STRING_VALUE_OFFSET, 4), &[b'h', 0, b'i', 0]);
    }

    #[test]
    fn test_references_set_and_get() {
        let mut object = plain(ObjectId(0), &[8, 12]);
        assert_eq!(object.set_reference(12, Some(ObjectId(5))), None);
        assert_eq!(object.reference(12), Some(ObjectId(5)));
        assert!(object.is_reference_slot(8));
        assert!(!object.is_reference_slot(16));
    }

    #[test]
    #[should_panic(expected = "not a reference slot")]
    fn test_reference_on_primitive_offset_panics() {
        let object = plain(ObjectId(0), &[8]);
        let _ = object.reference(12);
    }

    #[test]
    fn test_primitive_field_roundtrip() {
        let mut object = plain(ObjectId(0), &[8]);
        object.data.resize(24, 0);
        assert_eq!(object.set_field(16, 4, Value::Primitive(7)), Value::Primitive(0));
        assert_eq!(object.get_field(16, 4, false), Value::Primitive(7));
        assert_eq!(object.set_field(8, 4, Value::Reference(Some(ObjectId(3)))), Value::NULL);
        assert_eq!(object.get_field(8, 4, true).reference(), Some(ObjectId(3)));
    }

    #[test]
    fn test_collect_garbage_frees_unreachable() {
        let mut heap = Heap::new();
        let class = heap.allocate(plain(ObjectId(0), &[]));
        let root = heap.allocate(plain(class, &[8]));
        let child = heap.allocate(plain(class, &[]));
        let garbage = heap.allocate(plain(class, &[]));
        heap.object_mut(root).set_reference(8, Some(child));

        let freed = heap.collect_garbage(&[root]);
        assert_eq!(freed, 1);
        assert!(heap.contains(child));
        assert!(!heap.contains(garbage));
    }

    #[test]
    fn test_boot_image_space_is_immortal() {
        let mut heap = Heap::new();
        let boot = heap.allocate(plain(ObjectId(0), &[]));
        heap.mark_boot_image_space();
        let app = heap.allocate(plain(boot, &[]));

        assert!(heap.is_in_boot_image_space(boot));
        assert!(!heap.is_in_boot_image_space(app));
        assert_eq!(heap.collect_garbage(&[]), 1);
        assert!(heap.contains(boot));
    }

    #[test]
    fn test_bytes_allocated_tracks_frees() {
        let mut heap = Heap::new();
        let a = heap.allocate(plain(ObjectId(0), &[8]));
        assert_eq!(heap.bytes_allocated(), 16);
        heap.free(a);
        assert_eq!(heap.bytes_allocated(), 0);
    }
}
