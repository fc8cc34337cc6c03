//! The method being compiled and its immediate context.

use crate::{
    dex::{AccessFlags, DexFileId, MethodReference},
    runtime::ClassId,
};

/// Identity and declaring-class context of one method compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DexCompilationUnit {
    /// File declaring the method
    pub dex_file: DexFileId,
    /// Class definition declaring the method
    pub class_def_idx: u32,
    /// Method index in `dex_file`
    pub method_idx: u32,
    /// Access flags of the encoded method
    pub access_flags: AccessFlags,
    /// The declaring class, if it resolved
    pub class: Option<ClassId>,
    /// Whether constructors of the declaring class must end with a store barrier, which is the
    /// case as soon as the class declares a `final` instance field
    pub requires_constructor_barrier: bool,
}

impl DexCompilationUnit {
    /// The method as a registry key.
    #[must_use]
    pub fn method_reference(&self) -> MethodReference {
        MethodReference::new(self.dex_file, self.method_idx)
    }

    /// Returns `true` for `<init>` methods.
    #[must_use]
    pub fn is_instance_constructor(&self) -> bool {
        self.access_flags.contains(AccessFlags::CONSTRUCTOR)
            && !self.access_flags.contains(AccessFlags::STATIC)
    }

    /// Returns `true` for static methods.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.access_flags.contains(AccessFlags::STATIC)
    }
}
