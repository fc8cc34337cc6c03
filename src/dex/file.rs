//! In-memory model of a bytecode (dex) file.
//!
//! A [`DexFile`] is the unit of compilation: a table of strings, type descriptors, field and
//! method references, and class definitions whose methods carry [`CodeItem`]s. Files are
//! immutable once registered with the class linker and are addressed through a copyable
//! [`DexFileId`]; every cross reference in the crate goes through that handle rather than owning
//! the file.

use bitflags::bitflags;

use crate::{Error::OutOfBounds, Result};

/// Identity handle of a registered bytecode file.
///
/// Handles are dense and assigned in registration order, so they double as an index into the
/// class linker's dex file and dex cache tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DexFileId(pub u32);

impl DexFileId {
    /// Returns the handle as a table index.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

bitflags! {
    /// Access flags of classes, fields and methods.
    ///
    /// Some bit values are shared between fields and methods (`VOLATILE`/`BRIDGE`,
    /// `TRANSIENT`/`VARARGS`), exactly as in the bytecode format.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AccessFlags: u32 {
        /// Visible everywhere
        const PUBLIC = 0x0001;
        /// Visible only to the declaring class
        const PRIVATE = 0x0002;
        /// Visible to the package and subclasses
        const PROTECTED = 0x0004;
        /// Not bound to an instance
        const STATIC = 0x0008;
        /// Not subclassable / not overridable / immutable after construction
        const FINAL = 0x0010;
        /// Monitor is acquired around calls to this method
        const SYNCHRONIZED = 0x0020;
        /// Field with special access ordering rules
        const VOLATILE = 0x0040;
        /// Compiler generated bridge method
        const BRIDGE = 0x0040;
        /// Field not saved by default serialization
        const TRANSIENT = 0x0080;
        /// Method takes a variable number of arguments
        const VARARGS = 0x0080;
        /// Method implemented in native code
        const NATIVE = 0x0100;
        /// Class is an interface
        const INTERFACE = 0x0200;
        /// Class or method without implementation
        const ABSTRACT = 0x0400;
        /// Strict floating point
        const STRICT = 0x0800;
        /// Not directly defined in source code
        const SYNTHETIC = 0x1000;
        /// Annotation class
        const ANNOTATION = 0x2000;
        /// Enumerated type or enum value
        const ENUM = 0x4000;
        /// Instance or class initializer
        const CONSTRUCTOR = 0x1_0000;
        /// Method was declared `synchronized`
        const DECLARED_SYNCHRONIZED = 0x2_0000;
    }
}

/// A field reference: declaring class, field type and name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldId {
    /// Type index of the declaring class
    pub class_idx: u32,
    /// Type index of the field's type
    pub type_idx: u32,
    /// Field name
    pub name: String,
}

/// A method reference: declaring class, name and shorty signature.
///
/// The shorty lists the return type first, followed by one character per parameter (`L` for any
/// reference, `J`/`D` for wide primitives).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodId {
    /// Type index of the declaring class
    pub class_idx: u32,
    /// Method name
    pub name: String,
    /// Shorty signature
    pub shorty: String,
}

impl MethodId {
    /// Number of argument registers the parameters occupy (wide values take two).
    #[must_use]
    pub fn parameter_registers(&self) -> u16 {
        self.shorty
            .chars()
            .skip(1)
            .map(|c| if matches!(c, 'J' | 'D') { 2 } else { 1 })
            .sum()
    }
}

/// A field declared by a class definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodedField {
    /// Index into the file's field table
    pub field_idx: u32,
    /// Declared access flags
    pub access_flags: AccessFlags,
}

/// A catch handler of a try block. `type_idx` of `None` is a catch-all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchHandler {
    /// Caught exception type, if any
    pub type_idx: Option<u32>,
    /// Handler address in code units
    pub address: u32,
}

/// A protected range of a method body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TryItem {
    /// First protected code unit
    pub start_addr: u32,
    /// Number of protected code units
    pub insn_count: u16,
    /// Handlers, in matching order
    pub handlers: Vec<CatchHandler>,
}

/// The body of a method: register frame sizes, instruction stream and exception ranges.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CodeItem {
    /// Number of registers used by the method
    pub registers_size: u16,
    /// Number of incoming argument registers
    pub ins_size: u16,
    /// Number of outgoing argument registers needed for invocations
    pub outs_size: u16,
    /// Instruction stream in 16-bit code units
    pub insns: Vec<u16>,
    /// Try blocks
    pub tries: Vec<TryItem>,
}

/// A method declared by a class definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedMethod {
    /// Index into the file's method table
    pub method_idx: u32,
    /// Declared access flags
    pub access_flags: AccessFlags,
    /// Body, absent for abstract and native methods
    pub code: Option<CodeItem>,
}

/// A class definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDef {
    /// Type index of the defined class
    pub class_idx: u32,
    /// Class access flags
    pub access_flags: AccessFlags,
    /// Type index of the superclass, `None` only for the root class
    pub superclass_idx: Option<u32>,
    /// Type indices of directly implemented interfaces
    pub interfaces: Vec<u32>,
    /// Static fields
    pub static_fields: Vec<EncodedField>,
    /// Instance fields
    pub instance_fields: Vec<EncodedField>,
    /// Static, private and constructor methods
    pub direct_methods: Vec<EncodedMethod>,
    /// Overridable methods
    pub virtual_methods: Vec<EncodedMethod>,
}

impl ClassDef {
    /// Iterates all methods, direct methods first.
    pub fn methods(&self) -> impl Iterator<Item = &EncodedMethod> {
        self.direct_methods.iter().chain(self.virtual_methods.iter())
    }

    /// Iterates all fields, static fields first.
    pub fn fields(&self) -> impl Iterator<Item = &EncodedField> {
        self.static_fields.iter().chain(self.instance_fields.iter())
    }
}

/// An immutable bytecode file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DexFile {
    pub(crate) location: String,
    pub(crate) checksum: u32,
    pub(crate) strings: Vec<String>,
    pub(crate) types: Vec<u32>,
    pub(crate) fields: Vec<FieldId>,
    pub(crate) methods: Vec<MethodId>,
    pub(crate) class_defs: Vec<ClassDef>,
}

impl DexFile {
    /// Location (path or synthetic name) the file was loaded from.
    #[must_use]
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Content checksum.
    #[must_use]
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Number of entries in the string table.
    #[must_use]
    pub fn num_strings(&self) -> usize {
        self.strings.len()
    }

    /// Number of entries in the type table.
    #[must_use]
    pub fn num_types(&self) -> usize {
        self.types.len()
    }

    /// Number of entries in the field table.
    #[must_use]
    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    /// Number of entries in the method table.
    #[must_use]
    pub fn num_methods(&self) -> usize {
        self.methods.len()
    }

    /// All class definitions in declaration order.
    #[must_use]
    pub fn class_defs(&self) -> &[ClassDef] {
        &self.class_defs
    }

    /// Returns the string at `idx`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `idx` is not a valid string index.
    pub fn string(&self, idx: u32) -> Result<&str> {
        self.strings
            .get(idx as usize)
            .map(String::as_str)
            .ok_or(OutOfBounds)
    }

    /// Returns the type descriptor at `idx`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `idx` is not a valid type index.
    pub fn type_descriptor(&self, idx: u32) -> Result<&str> {
        let string_idx = *self.types.get(idx as usize).ok_or(OutOfBounds)?;
        self.string(string_idx)
    }

    /// Returns the field reference at `idx`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `idx` is not a valid field index.
    pub fn field_id(&self, idx: u32) -> Result<&FieldId> {
        self.fields.get(idx as usize).ok_or(OutOfBounds)
    }

    /// Returns the method reference at `idx`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `idx` is not a valid method index.
    pub fn method_id(&self, idx: u32) -> Result<&MethodId> {
        self.methods.get(idx as usize).ok_or(OutOfBounds)
    }

    /// Returns the class definition at `idx`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `idx` is not a valid class definition index.
    pub fn class_def(&self, idx: u32) -> Result<&ClassDef> {
        self.class_defs.get(idx as usize).ok_or(OutOfBounds)
    }

    /// Returns the descriptor of the class defined by `class_def`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if the class definition has a dangling type index.
    pub fn class_descriptor(&self, class_def: &ClassDef) -> Result<&str> {
        self.type_descriptor(class_def.class_idx)
    }

    /// Finds the type index for `descriptor`.
    #[must_use]
    pub fn find_type_idx(&self, descriptor: &str) -> Option<u32> {
        self.types
            .iter()
            .position(|&s| self.strings.get(s as usize).is_some_and(|d| d == descriptor))
            .and_then(|p| u32::try_from(p).ok())
    }

    /// Finds the string index for `value`.
    #[must_use]
    pub fn find_string_idx(&self, value: &str) -> Option<u32> {
        self.strings
            .iter()
            .position(|s| s == value)
            .and_then(|p| u32::try_from(p).ok())
    }

    /// Finds the index of the class definition defining `descriptor`.
    #[must_use]
    pub fn find_class_def_idx(&self, descriptor: &str) -> Option<u32> {
        let type_idx = self.find_type_idx(descriptor)?;
        self.class_defs
            .iter()
            .position(|def| def.class_idx == type_idx)
            .and_then(|p| u32::try_from(p).ok())
    }

    /// Finds the method index of `name` with `shorty` declared by `class_descriptor`.
    #[must_use]
    pub fn find_method_idx(&self, class_descriptor: &str, name: &str, shorty: &str) -> Option<u32> {
        let class_idx = self.find_type_idx(class_descriptor)?;
        self.methods
            .iter()
            .position(|m| m.class_idx == class_idx && m.name == name && m.shorty == shorty)
            .and_then(|p| u32::try_from(p).ok())
    }

    /// Finds the field index of `name` declared by `class_descriptor`.
    #[must_use]
    pub fn find_field_idx(&self, class_descriptor: &str, name: &str) -> Option<u32> {
        let class_idx = self.find_type_idx(class_descriptor)?;
        self.fields
            .iter()
            .position(|f| f.class_idx == class_idx && f.name == name)
            .and_then(|p| u32::try_from(p).ok())
    }

    /// Finds the encoded method and its class definition index for `method_idx`.
    #[must_use]
    pub fn find_encoded_method(&self, method_idx: u32) -> Option<(u32, &EncodedMethod)> {
        self.class_defs
            .iter()
            .enumerate()
            .find_map(|(def_idx, def)| {
                def.methods()
                    .find(|m| m.method_idx == method_idx)
                    .map(|m| (def_idx, m))
            })
            .and_then(|(def_idx, m)| u32::try_from(def_idx).ok().map(|d| (d, m)))
    }
}

/// Returns `true` if `descriptor` names a reference type (class or array).
#[must_use]
pub fn is_reference_descriptor(descriptor: &str) -> bool {
    descriptor.starts_with('L') || descriptor.starts_with('[')
}

/// Returns the storage size in bytes of a value of type `descriptor`.
#[must_use]
pub fn descriptor_size(descriptor: &str) -> usize {
    match descriptor.as_bytes().first() {
        Some(b'J' | b'D') => 8,
        Some(b'I' | b'F' | b'L' | b'[') => 4,
        Some(b'S' | b'C') => 2,
        Some(b'Z' | b'B') => 1,
        _ => 0,
    }
}

/// Converts a descriptor such as `Ljava/lang/Object;` into its dotted class name.
#[must_use]
pub fn descriptor_to_name(descriptor: &str) -> String {
    match descriptor.strip_prefix('L').and_then(|d| d.strip_suffix(';')) {
        Some(name) => name.replace('/', "."),
        None => descriptor.to_string(),
    }
}
