//! Integration tests for the compiler driver phases run through the public API.

use oatforge::{
    prelude::*,
    runtime::{ArtFieldId, ArtMethodId},
};

const OBJECT: &str = "Ljava/lang/Object;";
const NODE: &str = "Lpipeline/Node;";
const TREE: &str = "Lpipeline/Tree;";
const VISITOR: &str = "Lpipeline/Visitor;";
const COUNTER: &str = "Lpipeline/Counter;";

type DexCacheSnapshot = (
    Vec<Option<ClassId>>,
    Vec<Option<ArtMethodId>>,
    Vec<Option<ArtFieldId>>,
);

/// Classes referencing each other through fields, supertypes and calls, so that the order in
/// which they are resolved decides the ids they get.
#[allow(clippy::cast_possible_truncation)]
fn pipeline_dex() -> (DexFile, u32) {
    let mut dex = DexFileBuilder::new("pipeline.dex");
    let object_init = dex.method_id(OBJECT, "<init>", "V") as u16;
    let ctor = CodeBuilder::new(1, 1)
        .invoke(Opcode::INVOKE_DIRECT, &[0], object_init)
        .return_void()
        .build();
    let ctor_flags = AccessFlags::PUBLIC | AccessFlags::CONSTRUCTOR;

    let value = dex.field_id(NODE, "value", "I") as u16;
    let get_value = CodeBuilder::new(2, 1)
        .instance_field_op(Opcode::IGET, 0, 1, value)
        .return_value(0)
        .build();
    let count = dex.field_id(COUNTER, "count", "I") as u16;
    let bump = CodeBuilder::new(1, 0)
        .static_field_op(Opcode::SGET, 0, count)
        .add_int_lit8(0, 0, 1)
        .static_field_op(Opcode::SPUT, 0, count)
        .return_void()
        .build();

    dex.class(VISITOR)
        .access_flags(AccessFlags::PUBLIC | AccessFlags::INTERFACE | AccessFlags::ABSTRACT)
        .superclass(OBJECT)
        .virtual_method(
            "visit",
            "VL",
            AccessFlags::PUBLIC | AccessFlags::ABSTRACT,
            None,
        )
        .finish();
    dex.class(NODE)
        .access_flags(AccessFlags::PUBLIC)
        .superclass(OBJECT)
        .instance_field("value", "I", AccessFlags::PUBLIC)
        .instance_field("next", NODE, AccessFlags::PUBLIC)
        .direct_method("<init>", "V", ctor_flags, Some(ctor.clone()))
        .virtual_method("getValue", "I", AccessFlags::PUBLIC, Some(get_value))
        .finish();
    dex.class(TREE)
        .access_flags(AccessFlags::PUBLIC)
        .superclass(NODE)
        .instance_field("left", NODE, AccessFlags::PUBLIC)
        .instance_field("right", NODE, AccessFlags::PUBLIC)
        .direct_method("<init>", "V", ctor_flags, Some(ctor.clone()))
        .finish();
    let last = dex
        .class(COUNTER)
        .superclass(OBJECT)
        .static_field("count", "I", AccessFlags::STATIC)
        .direct_method("<init>", "V", ctor_flags, Some(ctor))
        .direct_method("bump", "V", AccessFlags::PUBLIC | AccessFlags::STATIC, Some(bump))
        .finish();
    (dex.build(), last + 1)
}

fn deterministic_driver() -> Result<(CompilerDriver, DexFileId)> {
    let (dex, _) = pipeline_dex();
    let runtime = Runtime::new(vec![dex])?;
    let files = runtime.class_linker().boot_class_path().to_vec();
    let pipeline = *files.last().unwrap();
    let options = CompilerOptions {
        thread_count: 4,
        force_determinism: true,
        abort_on_hard_verifier_failure: false,
        ..CompilerOptions::boot_image()
    };
    Ok((CompilerDriver::with_stub_backend(options, runtime, files)?, pipeline))
}

fn snapshot(driver: &CompilerDriver) -> Vec<DexCacheSnapshot> {
    let runtime = driver.runtime().read().unwrap();
    let linker = runtime.class_linker();
    driver
        .dex_files()
        .iter()
        .map(|&dex_file| {
            let cache = linker.dex_cache(dex_file);
            (
                cache.resolved_types().to_vec(),
                cache.resolved_methods().to_vec(),
                cache.resolved_fields().to_vec(),
            )
        })
        .collect()
}

#[test]
fn test_deterministic_resolve_is_reproducible() -> Result<()> {
    let (first, _) = deterministic_driver()?;
    first.resolve();
    let (second, _) = deterministic_driver()?;
    second.resolve();

    let a = snapshot(&first);
    let b = snapshot(&second);
    assert_eq!(a, b);
    assert!(a.iter().any(|(types, _, _)| types.iter().any(Option::is_some)));
    assert!(a.iter().any(|(_, methods, _)| methods.iter().any(Option::is_some)));
    Ok(())
}

#[test]
fn test_boot_resolve_loads_every_class() -> Result<()> {
    let (driver, pipeline) = deterministic_driver()?;
    driver.resolve();

    let runtime = driver.runtime().read().unwrap();
    let cache = runtime.class_linker().dex_cache(pipeline);
    assert!(cache.resolved_types().iter().any(Option::is_some));
    for descriptor in [NODE, TREE, VISITOR, COUNTER] {
        assert!(
            runtime.class_linker().lookup_class(descriptor, None).is_some(),
            "{descriptor} was not resolved"
        );
    }
    Ok(())
}

#[test]
fn test_deterministic_compile_is_reproducible() -> Result<()> {
    let (first, pipeline) = deterministic_driver()?;
    first.compile_all()?;
    let (second, _) = deterministic_driver()?;
    second.compile_all()?;

    assert_eq!(first.compiled_method_references(), second.compiled_method_references());
    assert_eq!(snapshot(&first), snapshot(&second));

    let (_, num_classes) = pipeline_dex();
    for class_def_idx in 0..num_classes {
        let class = ClassReference::new(pipeline, class_def_idx);
        let a = first.get_compiled_class(class).map(|c| c.status());
        let b = second.get_compiled_class(class).map(|c| c.status());
        assert_eq!(a, b, "class def {class_def_idx}");
    }
    let node = first.get_compiled_class(ClassReference::new(pipeline, 1));
    assert!(node.is_some_and(|c| c.status() >= ClassStatus::Verified));
    Ok(())
}

#[test]
fn test_class_status_only_moves_forward() -> Result<()> {
    let (driver, pipeline) = deterministic_driver()?;
    let class = ClassReference::new(pipeline, 0);

    driver.record_class_status(class, ClassStatus::Verified);
    driver.record_class_status(class, ClassStatus::Verified);
    driver.record_class_status(class, ClassStatus::Initialized);
    assert_eq!(
        driver.get_compiled_class(class).map(|c| c.status()),
        Some(ClassStatus::Initialized)
    );
    Ok(())
}

#[test]
#[should_panic(expected = "moved backwards")]
fn test_class_status_regression_is_fatal() {
    let (driver, pipeline) = deterministic_driver().unwrap();
    let class = ClassReference::new(pipeline, 0);

    driver.record_class_status(class, ClassStatus::Initialized);
    driver.record_class_status(class, ClassStatus::Verified);
}
