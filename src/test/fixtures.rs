//! Synthetic bytecode files used across the unit tests.

use crate::{
    dex::{AccessFlags, CodeBuilder, DexFile, DexFileBuilder, Opcode},
    runtime::core,
};

/// Plain class with two `int` fields, an accessor, a static helper and a native method.
pub const POINT: &str = "Lfixture/Point;";
/// Abstract class with one abstract method.
pub const SHAPE: &str = "Lfixture/Shape;";
/// Class whose statics are all `final`, set by its initializer.
pub const CONSTANTS: &str = "Lfixture/Constants;";
/// Class with an initializer that must not run at compile time.
pub const LAZY: &str = "Lfixture/Lazy;";
/// Class whose initializer throws.
pub const THROWING: &str = "Lfixture/Throwing;";
/// Class whose only method fails verification.
pub const BROKEN: &str = "Lfixture/Broken;";

const CLINIT: AccessFlags = AccessFlags::STATIC.union(AccessFlags::CONSTRUCTOR);
const CTOR: AccessFlags = AccessFlags::PUBLIC.union(AccessFlags::CONSTRUCTOR);

#[allow(clippy::cast_possible_truncation)]
fn constructor(dex: &mut DexFileBuilder) -> crate::dex::CodeItem {
    let object_init = dex.method_id(core::OBJECT, "<init>", "V") as u16;
    CodeBuilder::new(1, 1)
        .invoke(Opcode::INVOKE_DIRECT, &[0], object_init)
        .return_void()
        .build()
}

#[allow(clippy::cast_possible_truncation)]
fn store_constant(dex: &mut DexFileBuilder, class: &str, field: &str) -> crate::dex::CodeItem {
    let field = dex.field_id(class, field, "I") as u16;
    CodeBuilder::new(1, 0)
        .const16(0, 7)
        .static_field_op(Opcode::SPUT, 0, field)
        .return_void()
        .build()
}

/// A file with [`POINT`], [`SHAPE`], [`CONSTANTS`], [`LAZY`] and [`THROWING`].
#[allow(clippy::cast_possible_truncation)]
pub fn app_dex() -> DexFile {
    let mut dex = DexFileBuilder::new("app.dex");

    let ctor = constructor(&mut dex);
    let x = dex.field_id(POINT, "x", "I") as u16;
    let get_x = CodeBuilder::new(2, 1)
        .instance_field_op(Opcode::IGET, 0, 1, x)
        .return_value(0)
        .build();
    let sum = CodeBuilder::new(3, 2)
        .add_int(0, 1, 2)
        .return_value(0)
        .build();
    dex.class(POINT)
        .access_flags(AccessFlags::PUBLIC)
        .superclass(core::OBJECT)
        .instance_field("x", "I", AccessFlags::PUBLIC)
        .instance_field("y", "I", AccessFlags::PUBLIC)
        .direct_method("<init>", "V", CTOR, Some(ctor.clone()))
        .direct_method(
            "sum",
            "III",
            AccessFlags::PUBLIC | AccessFlags::STATIC,
            Some(sum),
        )
        .virtual_method("getX", "I", AccessFlags::PUBLIC, Some(get_x))
        .virtual_method(
            "nativeHash",
            "I",
            AccessFlags::PUBLIC | AccessFlags::NATIVE,
            None,
        )
        .finish();

    dex.class(SHAPE)
        .access_flags(AccessFlags::PUBLIC | AccessFlags::ABSTRACT)
        .superclass(core::OBJECT)
        .direct_method("<init>", "V", CTOR, Some(ctor))
        .virtual_method(
            "area",
            "I",
            AccessFlags::PUBLIC | AccessFlags::ABSTRACT,
            None,
        )
        .finish();

    let clinit = store_constant(&mut dex, CONSTANTS, "VALUE");
    dex.class(CONSTANTS)
        .access_flags(AccessFlags::PUBLIC | AccessFlags::FINAL)
        .superclass(core::OBJECT)
        .static_field(
            "VALUE",
            "I",
            AccessFlags::PUBLIC | AccessFlags::STATIC | AccessFlags::FINAL,
        )
        .direct_method("<clinit>", "V", CLINIT, Some(clinit))
        .finish();

    let clinit = store_constant(&mut dex, LAZY, "count");
    dex.class(LAZY)
        .superclass(core::OBJECT)
        .static_field("count", "I", AccessFlags::STATIC)
        .direct_method("<clinit>", "V", CLINIT, Some(clinit))
        .finish();

    let clinit = CodeBuilder::new(1, 0).const4(0, 0).throw(0).build();
    dex.class(THROWING)
        .superclass(core::OBJECT)
        .static_field("value", "I", AccessFlags::STATIC)
        .direct_method("<clinit>", "V", CLINIT, Some(clinit))
        .finish();

    dex.build()
}

/// A file with [`BROKEN`], whose method loads a string index past the end of the string table,
/// and a well-formed [`CONSTANTS`].
pub fn broken_dex() -> DexFile {
    let mut dex = DexFileBuilder::new("broken.dex");
    let bad = CodeBuilder::new(1, 0)
        .const_string(0, 0x7FFF)
        .return_void()
        .build();
    dex.class(BROKEN)
        .superclass(core::OBJECT)
        .direct_method("run", "V", AccessFlags::STATIC, Some(bad))
        .finish();

    let clinit = store_constant(&mut dex, CONSTANTS, "VALUE");
    dex.class(CONSTANTS)
        .superclass(core::OBJECT)
        .static_field(
            "VALUE",
            "I",
            AccessFlags::PUBLIC | AccessFlags::STATIC | AccessFlags::FINAL,
        )
        .direct_method("<clinit>", "V", CLINIT, Some(clinit))
        .finish();
    dex.build()
}
