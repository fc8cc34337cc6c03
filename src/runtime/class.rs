//! Linked class model.
//!
//! A [`Class`] is the class linker's view of a loaded type. Its managed mirror (the
//! `java.lang.Class` object in the heap) carries the static field storage and references to the
//! other managed objects the class points at, while fields, methods and the interface method
//! table are native structures owned here and addressed through [`NativePtr`].

use std::fmt;

use strum::{EnumCount, EnumIter};

use crate::{
    dex::{AccessFlags, DexFileId},
    runtime::heap::{ObjectId, OBJECT_HEADER_SIZE},
};

/// Offset of the superclass reference in a class mirror.
pub const CLASS_SUPER_CLASS_OFFSET: u32 = OBJECT_HEADER_SIZE;
/// Offset of the dex cache reference in a class mirror.
pub const CLASS_DEX_CACHE_OFFSET: u32 = 12;
/// Offset of the class loader reference in a class mirror.
pub const CLASS_LOADER_OFFSET: u32 = 16;
/// Offset of the component type reference in an array class mirror.
pub const CLASS_COMPONENT_TYPE_OFFSET: u32 = 20;
/// Offset of the lazily computed name string.
pub const CLASS_NAME_OFFSET: u32 = 24;
/// Offset of the vtable pointer array reference.
pub const CLASS_VTABLE_OFFSET: u32 = 28;
/// Offset of the native instance field array pointer.
pub const CLASS_IFIELDS_OFFSET: u32 = 40;
/// Offset of the native static field array pointer.
pub const CLASS_SFIELDS_OFFSET: u32 = 48;
/// Offset of the native method array pointer.
pub const CLASS_METHODS_OFFSET: u32 = 56;
/// Offset of the native interface method table pointer.
pub const CLASS_IMT_OFFSET: u32 = 64;
/// Offset of the access flags word.
pub const CLASS_ACCESS_FLAGS_OFFSET: u32 = 72;
/// Offset of the status word.
pub const CLASS_STATUS_OFFSET: u32 = 76;
/// Offset of the instance size word.
pub const CLASS_OBJECT_SIZE_OFFSET: u32 = 80;
/// Offset of the mirror size word.
pub const CLASS_CLASS_SIZE_OFFSET: u32 = 84;
/// First byte of static field storage; also the instance size of `java.lang.Class`.
pub const CLASS_FIELDS_START: u32 = 88;

/// Reference slots of every class mirror.
pub const CLASS_REFERENCE_OFFSETS: [u32; 6] = [
    CLASS_SUPER_CLASS_OFFSET,
    CLASS_DEX_CACHE_OFFSET,
    CLASS_LOADER_OFFSET,
    CLASS_COMPONENT_TYPE_OFFSET,
    CLASS_NAME_OFFSET,
    CLASS_VTABLE_OFFSET,
];

/// Native slots of every class mirror.
pub const CLASS_NATIVE_OFFSETS: [u32; 4] = [
    CLASS_IFIELDS_OFFSET,
    CLASS_SFIELDS_OFFSET,
    CLASS_METHODS_OFFSET,
    CLASS_IMT_OFFSET,
];

/// Offset of the location string in a dex cache mirror.
pub const DEX_CACHE_LOCATION_OFFSET: u32 = 8;
/// Offset of the native dex file pointer in a dex cache mirror.
pub const DEX_CACHE_DEX_FILE_OFFSET: u32 = 16;
/// Offset of the resolved types array pointer.
pub const DEX_CACHE_RESOLVED_TYPES_OFFSET: u32 = 24;
/// Offset of the resolved methods array pointer.
pub const DEX_CACHE_RESOLVED_METHODS_OFFSET: u32 = 32;
/// Offset of the resolved fields array pointer.
pub const DEX_CACHE_RESOLVED_FIELDS_OFFSET: u32 = 40;
/// Offset of the resolved strings array pointer.
pub const DEX_CACHE_STRINGS_OFFSET: u32 = 48;
/// Offset of the four element counts.
pub const DEX_CACHE_NUM_RESOLVED_TYPES_OFFSET: u32 = 56;
/// Instance size of a dex cache mirror.
pub const DEX_CACHE_SIZE: u32 = 72;

/// Offset of the declaring class of a reflective method object.
pub const EXECUTABLE_DECLARING_CLASS_OFFSET: u32 = 8;
/// Offset of the native method pointer of a reflective method object.
pub const EXECUTABLE_ART_METHOD_OFFSET: u32 = 16;
/// Offset of the native class table pointer of a class loader.
pub const CLASS_LOADER_CLASS_TABLE_OFFSET: u32 = 16;

/// Serialized size of one native method record.
pub const ART_METHOD_SIZE: u32 = 32;
/// Serialized size of one native field record.
pub const ART_FIELD_SIZE: u32 = 16;
/// Size of the length prefix of native field and method arrays.
pub const LENGTH_PREFIX_SIZE: u32 = 8;
/// Number of interface method table slots.
pub const IMT_SIZE: usize = 43;
/// Sentinel method index of runtime methods.
pub const NO_DEX_INDEX: u32 = u32::MAX;

/// Index of a class in the class linker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

impl ClassId {
    /// Returns the id as a table index.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A method, identified by its declaring class and its position in the class's method array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtMethodId {
    /// Declaring class
    pub class: ClassId,
    /// Position in the declaring class's method array
    pub index: u32,
}

/// A field, identified by its declaring class and its position in one of its field arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArtFieldId {
    /// Declaring class
    pub class: ClassId,
    /// Whether the field lives in the static field array
    pub is_static: bool,
    /// Position in the field array
    pub index: u32,
}

/// Index of an interface method conflict table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConflictTableId(pub u32);

/// Methods owned by the runtime rather than by a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter, EnumCount)]
pub enum RuntimeMethod {
    /// Placeholder of unresolved dex cache method slots
    ResolutionTrampoline,
    /// Dispatches through an IMT conflict table
    ImtConflict,
    /// Fills IMT slots without any implementation
    ImtUnimplemented,
}

/// The four arrays backing a dex cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter, EnumCount)]
pub enum DexCacheArrayKind {
    /// Resolved classes, one reference per type index
    Types,
    /// Resolved methods, one native pointer per method index
    Methods,
    /// Resolved fields, one native pointer per field index
    Fields,
    /// Resolved strings, one reference per string index
    Strings,
}

impl DexCacheArrayKind {
    /// Size of one element.
    #[must_use]
    pub fn element_size(self) -> u32 {
        match self {
            DexCacheArrayKind::Types | DexCacheArrayKind::Strings => 4,
            DexCacheArrayKind::Methods | DexCacheArrayKind::Fields => 8,
        }
    }
}

/// A pointer to a native runtime structure.
///
/// Native structures are not heap objects; the image writer assigns them their own bins and
/// relocates them through a table keyed by this identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum NativePtr {
    /// Null pointer
    #[default]
    Null,
    /// A method record
    Method(ArtMethodId),
    /// A runtime-owned method record
    RuntimeMethod(RuntimeMethod),
    /// A field record
    Field(ArtFieldId),
    /// The length-prefixed static field array of a class
    StaticFieldArray(ClassId),
    /// The length-prefixed instance field array of a class
    InstanceFieldArray(ClassId),
    /// The length-prefixed method array of a class
    MethodArray(ClassId),
    /// The interface method table of a class
    Imt(ClassId),
    /// An interface method conflict table
    ImtConflictTable(ConflictTableId),
    /// One of the arrays backing a dex cache
    DexCacheArray(DexFileId, DexCacheArrayKind),
}

impl NativePtr {
    /// Returns `true` for [`NativePtr::Null`].
    #[must_use]
    pub fn is_null(self) -> bool {
        self == NativePtr::Null
    }
}

/// Lifecycle status of a class. Ordered; status only moves forward except on error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[repr(i8)]
pub enum ClassStatus {
    /// Loading, linking, verification or initialization failed
    Error = -1,
    /// Allocated but not linked
    #[default]
    NotReady = 0,
    /// Linked: fields laid out, vtable and IMT built
    Resolved = 2,
    /// Verification soft-failed and must be repeated at runtime
    RetryVerificationAtRuntime = 3,
    /// Verified
    Verified = 4,
    /// Static initializer is running
    Initializing = 5,
    /// Static initializer completed
    Initialized = 6,
}

impl ClassStatus {
    /// Raw value as stored in class mirrors and image files.
    #[must_use]
    pub fn as_raw(self) -> i32 {
        self as i8 as i32
    }
}

/// A native field record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtField {
    pub(crate) declaring_class: ClassId,
    pub(crate) dex_field_idx: u32,
    pub(crate) access_flags: AccessFlags,
    pub(crate) name: String,
    pub(crate) type_descriptor: String,
    pub(crate) offset: u32,
}

impl ArtField {
    /// Declaring class.
    #[must_use]
    pub fn declaring_class(&self) -> ClassId {
        self.declaring_class
    }

    /// Field index in the declaring class's bytecode file.
    #[must_use]
    pub fn dex_field_idx(&self) -> u32 {
        self.dex_field_idx
    }

    /// Access flags.
    #[must_use]
    pub fn access_flags(&self) -> AccessFlags {
        self.access_flags
    }

    /// Field name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Type descriptor.
    #[must_use]
    pub fn type_descriptor(&self) -> &str {
        &self.type_descriptor
    }

    /// Byte offset inside the instance, or inside the class mirror for statics.
    #[must_use]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Returns `true` for static fields.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.access_flags.contains(AccessFlags::STATIC)
    }

    /// Returns `true` for volatile fields.
    #[must_use]
    pub fn is_volatile(&self) -> bool {
        self.access_flags.contains(AccessFlags::VOLATILE)
    }

    /// Returns `true` for final fields.
    #[must_use]
    pub fn is_final(&self) -> bool {
        self.access_flags.contains(AccessFlags::FINAL)
    }

    /// Returns `true` if the field holds a reference.
    #[must_use]
    pub fn is_reference(&self) -> bool {
        crate::dex::is_reference_descriptor(&self.type_descriptor)
    }

    /// Storage size of the field value.
    #[must_use]
    pub fn size(&self) -> usize {
        crate::dex::descriptor_size(&self.type_descriptor)
    }
}

/// A native method record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtMethod {
    pub(crate) declaring_class: ClassId,
    pub(crate) dex_method_idx: u32,
    pub(crate) access_flags: AccessFlags,
    pub(crate) name: String,
    pub(crate) shorty: String,
    pub(crate) method_index: u16,
    pub(crate) has_code: bool,
}

impl ArtMethod {
    /// Declaring class.
    #[must_use]
    pub fn declaring_class(&self) -> ClassId {
        self.declaring_class
    }

    /// Method index in the declaring class's bytecode file.
    #[must_use]
    pub fn dex_method_idx(&self) -> u32 {
        self.dex_method_idx
    }

    /// Access flags.
    #[must_use]
    pub fn access_flags(&self) -> AccessFlags {
        self.access_flags
    }

    /// Method name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shorty signature.
    #[must_use]
    pub fn shorty(&self) -> &str {
        &self.shorty
    }

    /// Vtable index for virtual methods, declaration index within the interface for interface
    /// methods, position in the class for direct methods.
    #[must_use]
    pub fn method_index(&self) -> u16 {
        self.method_index
    }

    /// Returns `true` if the method has a bytecode body.
    #[must_use]
    pub fn has_code(&self) -> bool {
        self.has_code
    }

    /// Returns `true` for static methods.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.access_flags.contains(AccessFlags::STATIC)
    }

    /// Returns `true` for native methods.
    #[must_use]
    pub fn is_native(&self) -> bool {
        self.access_flags.contains(AccessFlags::NATIVE)
    }

    /// Returns `true` for abstract methods.
    #[must_use]
    pub fn is_abstract(&self) -> bool {
        self.access_flags.contains(AccessFlags::ABSTRACT)
    }

    /// Returns `true` for final methods.
    #[must_use]
    pub fn is_final(&self) -> bool {
        self.access_flags.contains(AccessFlags::FINAL)
    }

    /// Returns `true` for private methods.
    #[must_use]
    pub fn is_private(&self) -> bool {
        self.access_flags.contains(AccessFlags::PRIVATE)
    }

    /// Returns `true` for constructors and static initializers.
    #[must_use]
    pub fn is_constructor(&self) -> bool {
        self.access_flags.contains(AccessFlags::CONSTRUCTOR)
    }

    /// Returns `true` for `<clinit>`.
    #[must_use]
    pub fn is_class_initializer(&self) -> bool {
        self.is_constructor() && self.is_static()
    }

    /// Returns `true` for methods dispatched through the vtable.
    #[must_use]
    pub fn is_direct(&self) -> bool {
        self.is_static() || self.is_private() || self.is_constructor()
    }
}

/// An interface method conflict table: (interface method, implementation) pairs sharing one IMT
/// slot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImtConflictTable {
    pub(crate) entries: Vec<(ArtMethodId, ArtMethodId)>,
}

impl ImtConflictTable {
    /// The table's pairs.
    #[must_use]
    pub fn entries(&self) -> &[(ArtMethodId, ArtMethodId)] {
        &self.entries
    }

    /// Serialized size, including the null terminator pair.
    #[must_use]
    pub fn size_in_bytes(&self) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        let pairs = (self.entries.len() + 1) as u32;
        pairs * 16
    }
}

/// A loaded class.
#[derive(Clone)]
pub struct Class {
    pub(crate) descriptor: String,
    pub(crate) mirror: ObjectId,
    pub(crate) access_flags: AccessFlags,
    pub(crate) status: ClassStatus,
    pub(crate) super_class: Option<ClassId>,
    pub(crate) interfaces: Vec<ClassId>,
    pub(crate) iftable: Vec<ClassId>,
    pub(crate) component_type: Option<ClassId>,
    pub(crate) dex_file: Option<DexFileId>,
    pub(crate) class_def_idx: Option<u32>,
    pub(crate) class_loader: Option<ObjectId>,
    pub(crate) instance_fields: Vec<ArtField>,
    pub(crate) static_fields: Vec<ArtField>,
    pub(crate) methods: Vec<ArtMethod>,
    pub(crate) num_direct_methods: u32,
    pub(crate) vtable: Vec<ArtMethodId>,
    pub(crate) imt: Option<Vec<NativePtr>>,
    pub(crate) object_size: u32,
    pub(crate) reference_offsets: Vec<u32>,
    pub(crate) class_size: u32,
}

impl Class {
    /// Type descriptor, e.g. `Ljava/lang/String;`.
    #[must_use]
    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    /// The class's managed mirror.
    #[must_use]
    pub fn mirror(&self) -> ObjectId {
        self.mirror
    }

    /// Access flags.
    #[must_use]
    pub fn access_flags(&self) -> AccessFlags {
        self.access_flags
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ClassStatus {
        self.status
    }

    /// Superclass, `None` for the root class and primitives.
    #[must_use]
    pub fn super_class(&self) -> Option<ClassId> {
        self.super_class
    }

    /// Directly implemented interfaces.
    #[must_use]
    pub fn interfaces(&self) -> &[ClassId] {
        &self.interfaces
    }

    /// All implemented interfaces, inherited ones included.
    #[must_use]
    pub fn iftable(&self) -> &[ClassId] {
        &self.iftable
    }

    /// Element type of array classes.
    #[must_use]
    pub fn component_type(&self) -> Option<ClassId> {
        self.component_type
    }

    /// Bytecode file defining the class. `None` for primitives and arrays.
    #[must_use]
    pub fn dex_file(&self) -> Option<DexFileId> {
        self.dex_file
    }

    /// Index of the defining class definition.
    #[must_use]
    pub fn class_def_idx(&self) -> Option<u32> {
        self.class_def_idx
    }

    /// Defining loader, `None` for the boot loader.
    #[must_use]
    pub fn class_loader(&self) -> Option<ObjectId> {
        self.class_loader
    }

    /// Declared instance fields.
    #[must_use]
    pub fn instance_fields(&self) -> &[ArtField] {
        &self.instance_fields
    }

    /// Declared static fields.
    #[must_use]
    pub fn static_fields(&self) -> &[ArtField] {
        &self.static_fields
    }

    /// Declared methods, direct methods first.
    #[must_use]
    pub fn methods(&self) -> &[ArtMethod] {
        &self.methods
    }

    /// Virtual dispatch table.
    #[must_use]
    pub fn vtable(&self) -> &[ArtMethodId] {
        &self.vtable
    }

    /// Interface method table, when the class has one.
    #[must_use]
    pub fn imt(&self) -> Option<&[NativePtr]> {
        self.imt.as_deref()
    }

    /// Instance size in bytes, unaligned.
    #[must_use]
    pub fn object_size(&self) -> u32 {
        self.object_size
    }

    /// Offsets of all instance reference fields, inherited ones included.
    #[must_use]
    pub fn reference_offsets(&self) -> &[u32] {
        &self.reference_offsets
    }

    /// Size of the class mirror including static storage.
    #[must_use]
    pub fn class_size(&self) -> u32 {
        self.class_size
    }

    /// Returns `true` for interfaces.
    #[must_use]
    pub fn is_interface(&self) -> bool {
        self.access_flags.contains(AccessFlags::INTERFACE)
    }

    /// Returns `true` for final classes.
    #[must_use]
    pub fn is_final(&self) -> bool {
        self.access_flags.contains(AccessFlags::FINAL)
    }

    /// Returns `true` for abstract classes and interfaces.
    #[must_use]
    pub fn is_abstract(&self) -> bool {
        self.access_flags.contains(AccessFlags::ABSTRACT)
    }

    /// Returns `true` for array classes.
    #[must_use]
    pub fn is_array(&self) -> bool {
        self.descriptor.starts_with('[')
    }

    /// Returns `true` for arrays of references.
    #[must_use]
    pub fn is_object_array(&self) -> bool {
        self.is_array() && crate::dex::is_reference_descriptor(&self.descriptor[1..])
    }

    /// Returns `true` for primitive types.
    #[must_use]
    pub fn is_primitive(&self) -> bool {
        self.descriptor.len() == 1
    }

    /// Returns `true` once the class reached `Initialized`.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.status == ClassStatus::Initialized
    }

    /// Returns `true` once the class is at least `Verified`.
    #[must_use]
    pub fn is_verified(&self) -> bool {
        self.status >= ClassStatus::Verified
    }

    /// Returns `true` if linking completed.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.status >= ClassStatus::Resolved
    }

    /// Returns `true` if the class is in the error status.
    #[must_use]
    pub fn is_erroneous(&self) -> bool {
        self.status == ClassStatus::Error
    }

    /// Returns `true` if instances can be allocated.
    #[must_use]
    pub fn is_instantiable(&self) -> bool {
        !self.is_abstract() && !self.is_primitive() && !self.is_array()
    }

    /// Package prefix of the descriptor, used for access checks.
    #[must_use]
    pub fn package(&self) -> &str {
        match self.descriptor.rfind('/') {
            Some(pos) => &self.descriptor[..pos],
            None => "",
        }
    }

    /// Number of static reference fields.
    #[must_use]
    pub fn num_reference_static_fields(&self) -> usize {
        self.static_fields.iter().filter(|f| f.is_reference()).count()
    }

    /// Finds the `<clinit>` method.
    #[must_use]
    pub fn class_initializer(&self) -> Option<ArtMethodId> {
        let pos = self
            .methods
            .iter()
            .position(|m| m.is_class_initializer() && m.name == "<clinit>")?;
        Some(ArtMethodId {
            class: self.methods[pos].declaring_class,
            index: u32::try_from(pos).ok()?,
        })
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Class")
            .field("descriptor", &self.descriptor)
            .field("status", &self.status)
            .field("object_size", &self.object_size)
            .finish_non_exhaustive()
    }
}

/// Kind of dispatch of an invocation site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter, EnumCount)]
pub enum InvokeType {
    /// `invoke-static`
    Static,
    /// `invoke-direct`
    Direct,
    /// `invoke-virtual`
    Virtual,
    /// `invoke-super`
    Super,
    /// `invoke-interface`
    Interface,
}

impl InvokeType {
    /// Invoke type of an `invoke-*` opcode.
    #[must_use]
    pub fn from_opcode(opcode: crate::dex::Opcode) -> Option<Self> {
        use crate::dex::Opcode;
        let kind = match opcode {
            Opcode::INVOKE_STATIC | Opcode::INVOKE_STATIC_RANGE => InvokeType::Static,
            Opcode::INVOKE_DIRECT | Opcode::INVOKE_DIRECT_RANGE => InvokeType::Direct,
            Opcode::INVOKE_VIRTUAL
            | Opcode::INVOKE_VIRTUAL_RANGE
            | Opcode::INVOKE_VIRTUAL_QUICK
            | Opcode::INVOKE_VIRTUAL_RANGE_QUICK => InvokeType::Virtual,
            Opcode::INVOKE_SUPER | Opcode::INVOKE_SUPER_RANGE => InvokeType::Super,
            Opcode::INVOKE_INTERFACE | Opcode::INVOKE_INTERFACE_RANGE => InvokeType::Interface,
            _ => return None,
        };
        Some(kind)
    }

    /// Invoke type used to resolve a method declared with `flags` by a non-interface class.
    #[must_use]
    pub fn for_method(flags: AccessFlags, declared_by_interface: bool) -> Self {
        if flags.contains(AccessFlags::STATIC) {
            InvokeType::Static
        } else if declared_by_interface {
            InvokeType::Interface
        } else if flags.intersects(AccessFlags::PRIVATE | AccessFlags::CONSTRUCTOR) {
            InvokeType::Direct
        } else {
            InvokeType::Virtual
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_status_order() {
        assert!(ClassStatus::Error < ClassStatus::NotReady);
        assert!(ClassStatus::Resolved < ClassStatus::RetryVerificationAtRuntime);
        assert!(ClassStatus::RetryVerificationAtRuntime < ClassStatus::Verified);
        assert!(ClassStatus::Verified < ClassStatus::Initialized);
        assert_eq!(ClassStatus::Error.as_raw(), -1);
    }

    #[test]
    fn test_conflict_table_size_includes_terminator() {
        let table = ImtConflictTable::default();
        assert_eq!(table.size_in_bytes(), 16);
    }

    #[test]
    fn test_invoke_type_from_opcode() {
        use crate::dex::Opcode;
        assert_eq!(InvokeType::from_opcode(Opcode::INVOKE_SUPER_RANGE), Some(InvokeType::Super));
        assert_eq!(InvokeType::from_opcode(Opcode::NOP), None);
        assert_eq!(
            InvokeType::for_method(AccessFlags::PRIVATE, false),
            InvokeType::Direct
        );
    }
}
