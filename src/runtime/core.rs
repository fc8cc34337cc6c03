//! The built-in core library.
//!
//! The runtime bootstraps from a small synthetic boot class path holding the classes the class
//! linker and the image writer have hard-wired knowledge of. Their declared fields reproduce the
//! fixed mirror layouts (`String.count` at 8, the dex cache's native array slots, and so on).

use crate::dex::{AccessFlags, CodeBuilder, DexFile, DexFileBuilder, Opcode};

/// `java.lang.Object`
pub const OBJECT: &str = "Ljava/lang/Object;";
/// `java.lang.Class`
pub const CLASS: &str = "Ljava/lang/Class;";
/// `java.lang.String`
pub const STRING: &str = "Ljava/lang/String;";
/// `java.lang.DexCache`
pub const DEX_CACHE: &str = "Ljava/lang/DexCache;";
/// `java.lang.ClassLoader`
pub const CLASS_LOADER: &str = "Ljava/lang/ClassLoader;";
/// `dalvik.system.PathClassLoader`
pub const PATH_CLASS_LOADER: &str = "Ldalvik/system/PathClassLoader;";
/// `java.lang.ref.Reference`
pub const REFERENCE: &str = "Ljava/lang/ref/Reference;";
/// `java.lang.ref.WeakReference`
pub const WEAK_REFERENCE: &str = "Ljava/lang/ref/WeakReference;";
/// `java.lang.ref.FinalizerReference`
pub const FINALIZER_REFERENCE: &str = "Ljava/lang/ref/FinalizerReference;";
/// `java.lang.reflect.Executable`
pub const EXECUTABLE: &str = "Ljava/lang/reflect/Executable;";
/// `java.lang.reflect.Method`
pub const METHOD: &str = "Ljava/lang/reflect/Method;";
/// `java.lang.reflect.Constructor`
pub const CONSTRUCTOR: &str = "Ljava/lang/reflect/Constructor;";
/// `java.lang.Throwable`
pub const THROWABLE: &str = "Ljava/lang/Throwable;";
/// `java.lang.Exception`
pub const EXCEPTION: &str = "Ljava/lang/Exception;";
/// `java.lang.RuntimeException`
pub const RUNTIME_EXCEPTION: &str = "Ljava/lang/RuntimeException;";
/// `java.lang.Error`
pub const ERROR: &str = "Ljava/lang/Error;";
/// `java.lang.NullPointerException`
pub const NULL_POINTER_EXCEPTION: &str = "Ljava/lang/NullPointerException;";
/// `java.lang.ExceptionInInitializerError`
pub const EXCEPTION_IN_INITIALIZER_ERROR: &str = "Ljava/lang/ExceptionInInitializerError;";
/// `java.lang.Runnable`
pub const RUNNABLE: &str = "Ljava/lang/Runnable;";
/// `java.lang.Comparable`
pub const COMPARABLE: &str = "Ljava/lang/Comparable;";
/// `long[]`, the class of vtable pointer arrays
pub const LONG_ARRAY: &str = "[J";
/// `Object[]`
pub const OBJECT_ARRAY: &str = "[Ljava/lang/Object;";

/// Primitive type descriptors.
pub const PRIMITIVES: [&str; 9] = ["Z", "B", "C", "S", "I", "J", "F", "D", "V"];

/// Classes resolved eagerly while bootstrapping, in order.
pub const BOOTSTRAP_CLASSES: [&str; 6] = [OBJECT, CLASS, STRING, DEX_CACHE, CLASS_LOADER, REFERENCE];

/// Location of the core library.
pub const CORE_LIBRARY_LOCATION: &str = "core-oj.dex";

fn empty_constructor() -> Option<crate::dex::CodeItem> {
    Some(CodeBuilder::new(1, 1).return_void().build())
}

/// Builds the core library.
#[must_use]
pub fn core_library() -> DexFile {
    let public = AccessFlags::PUBLIC;
    let ctor = AccessFlags::PUBLIC | AccessFlags::CONSTRUCTOR;
    let native = AccessFlags::PUBLIC | AccessFlags::NATIVE;
    let abstract_method = AccessFlags::PUBLIC | AccessFlags::ABSTRACT;
    let interface = AccessFlags::PUBLIC | AccessFlags::INTERFACE | AccessFlags::ABSTRACT;

    let mut dex = DexFileBuilder::new(CORE_LIBRARY_LOCATION);
    let count_field = dex.field_id(STRING, "count", "I");

    dex.class(OBJECT)
        .direct_method("<init>", "V", ctor, empty_constructor())
        .virtual_method("hashCode", "I", native, None)
        .virtual_method(
            "toString",
            "L",
            public,
            Some(CodeBuilder::new(2, 1).const4(0, 0).return_object(0).build()),
        )
        .finish();

    dex.class(CLASS)
        .access_flags(public | AccessFlags::FINAL)
        .superclass(OBJECT)
        .finish();

    dex.class(COMPARABLE)
        .access_flags(interface)
        .superclass(OBJECT)
        .virtual_method("compareTo", "IL", abstract_method, None)
        .finish();

    dex.class(RUNNABLE)
        .access_flags(interface)
        .superclass(OBJECT)
        .virtual_method("run", "V", abstract_method, None)
        .finish();

    #[allow(clippy::cast_possible_truncation)]
    let length_code = CodeBuilder::new(2, 1)
        .instance_field_op(Opcode::IGET, 0, 1, count_field as u16)
        .return_value(0)
        .build();
    dex.class(STRING)
        .access_flags(public | AccessFlags::FINAL)
        .superclass(OBJECT)
        .interface(COMPARABLE)
        .instance_field("count", "I", AccessFlags::PRIVATE | AccessFlags::FINAL)
        .instance_field("hash", "I", AccessFlags::PRIVATE)
        .virtual_method("length", "I", public, Some(length_code))
        .virtual_method("hashCode", "I", native, None)
        .virtual_method("compareTo", "IL", native, None)
        .finish();

    let private_final = AccessFlags::PRIVATE | AccessFlags::FINAL;
    dex.class(DEX_CACHE)
        .access_flags(public | AccessFlags::FINAL)
        .superclass(OBJECT)
        .instance_field("location", STRING, private_final)
        .instance_field("dexFile", "J", AccessFlags::PRIVATE)
        .instance_field("resolvedTypes", "J", AccessFlags::PRIVATE)
        .instance_field("resolvedMethods", "J", AccessFlags::PRIVATE)
        .instance_field("resolvedFields", "J", AccessFlags::PRIVATE)
        .instance_field("strings", "J", AccessFlags::PRIVATE)
        .instance_field("numResolvedTypes", "I", AccessFlags::PRIVATE)
        .instance_field("numResolvedMethods", "I", AccessFlags::PRIVATE)
        .instance_field("numResolvedFields", "I", AccessFlags::PRIVATE)
        .instance_field("numStrings", "I", AccessFlags::PRIVATE)
        .finish();

    dex.class(CLASS_LOADER)
        .access_flags(public | AccessFlags::ABSTRACT)
        .superclass(OBJECT)
        .instance_field("parent", CLASS_LOADER, private_final)
        .instance_field("classTable", "J", AccessFlags::PRIVATE)
        .direct_method("<init>", "V", ctor, empty_constructor())
        .finish();

    dex.class(PATH_CLASS_LOADER)
        .superclass(CLASS_LOADER)
        .direct_method("<init>", "V", ctor, empty_constructor())
        .finish();

    dex.class(REFERENCE)
        .access_flags(public | AccessFlags::ABSTRACT)
        .superclass(OBJECT)
        .virtual_method("get", "L", native, None)
        .finish();

    dex.class(WEAK_REFERENCE)
        .superclass(REFERENCE)
        .direct_method("<init>", "V", ctor, empty_constructor())
        .finish();

    dex.class(FINALIZER_REFERENCE)
        .access_flags(public | AccessFlags::FINAL)
        .superclass(REFERENCE)
        .static_field("head", FINALIZER_REFERENCE, AccessFlags::PRIVATE)
        .finish();

    dex.class(EXECUTABLE)
        .access_flags(public | AccessFlags::ABSTRACT)
        .superclass(OBJECT)
        .instance_field("declaringClass", CLASS, AccessFlags::PRIVATE)
        .instance_field("artMethod", "J", AccessFlags::PRIVATE)
        .instance_field("accessFlags", "I", AccessFlags::PRIVATE)
        .finish();
    dex.class(METHOD)
        .access_flags(public | AccessFlags::FINAL)
        .superclass(EXECUTABLE)
        .finish();
    dex.class(CONSTRUCTOR)
        .access_flags(public | AccessFlags::FINAL)
        .superclass(EXECUTABLE)
        .finish();

    dex.class(THROWABLE)
        .superclass(OBJECT)
        .instance_field("detailMessage", STRING, AccessFlags::PRIVATE)
        .direct_method("<init>", "V", ctor, empty_constructor())
        .finish();
    for (descriptor, superclass) in [
        (EXCEPTION, THROWABLE),
        (RUNTIME_EXCEPTION, EXCEPTION),
        (ERROR, THROWABLE),
        (NULL_POINTER_EXCEPTION, RUNTIME_EXCEPTION),
        (EXCEPTION_IN_INITIALIZER_ERROR, ERROR),
    ] {
        dex.class(descriptor)
            .superclass(superclass)
            .direct_method("<init>", "V", ctor, empty_constructor())
            .finish();
    }

    dex.build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_library_declares_bootstrap_classes() {
        let dex = core_library();
        for descriptor in BOOTSTRAP_CLASSES {
            assert!(dex.find_class_def_idx(descriptor).is_some(), "{descriptor}");
        }
        assert!(dex.find_method_idx(STRING, "length", "I").is_some());
    }
}
