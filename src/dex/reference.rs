//! Identity keys for methods and classes of registered bytecode files.

use std::fmt;

use crate::dex::DexFileId;

/// A (bytecode file, method index) pair.
///
/// This is the key of the compiled method registry. It refers to the file through its
/// [`DexFileId`] and never owns it. Ordering is by file, then by index, which is the order in
/// which compiled code is laid out.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodReference {
    /// The file declaring the method reference
    pub dex_file: DexFileId,
    /// Index into the file's method table
    pub index: u32,
}

impl MethodReference {
    /// Creates a new method reference.
    #[must_use]
    pub fn new(dex_file: DexFileId, index: u32) -> Self {
        MethodReference { dex_file, index }
    }
}

impl fmt::Debug for MethodReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "method@{}:{}", self.dex_file.0, self.index)
    }
}

/// A (bytecode file, class definition index) pair. Same ownership discipline as
/// [`MethodReference`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassReference {
    /// The file holding the class definition
    pub dex_file: DexFileId,
    /// Index into the file's class definition table
    pub index: u32,
}

impl ClassReference {
    /// Creates a new class reference.
    #[must_use]
    pub fn new(dex_file: DexFileId, index: u32) -> Self {
        ClassReference { dex_file, index }
    }
}

impl fmt::Debug for ClassReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class_def@{}:{}", self.dex_file.0, self.index)
    }
}
