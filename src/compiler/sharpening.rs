//! Invoke sharpening.
//!
//! [`compute_invoke_info`] resolves the target of an invoke instruction and tries to turn a
//! dispatching call (`virtual`, `interface`, `super`) into a direct one. For direct and static
//! calls, [`get_code_and_method_for_direct_call`] then decides whether the generated code may
//! embed the callee's code and method pointers as literals instead of loading them from the
//! caller's dex cache:
//!
//! ```text
//!                      ┌───────────────────────────┐
//!   sharp type ───────►│ static or direct?         │── no ──► dex cache
//!                      └────────────┬──────────────┘
//!                                   ▼
//!                      ┌───────────────────────────┐
//!                      │ PIC and target not local? │── yes ─► dex cache
//!                      └────────────┬──────────────┘
//!                                   ▼
//!                      ┌───────────────────────────┐
//!                      │ needs clinit trampoline?  │── yes ─► dex cache
//!                      └────────────┬──────────────┘
//!                                   ▼
//!                      ┌───────────────────────────┐
//!                      │ target in an image?       │── no ──► dex cache
//!                      └────────────┬──────────────┘
//!                                   ▼
//!                  boot image literal / linker patch
//! ```

use std::collections::BTreeSet;

use crate::{
    compiler::{AotCompilationStats, CompilerOptions, DexCompilationUnit},
    dex::{DexFileId, MethodReference},
    runtime::{ArtMethodId, ClassId, InvokeType, Runtime, VerifiedMethod},
    Result,
};

/// How generated code reaches a callee's code or method record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DirectPointer {
    /// Loaded from the caller's dex cache at runtime
    #[default]
    None,
    /// A literal pointing into the boot image, known before linking
    BootImage,
    /// A literal filled in by the linker
    Linker {
        /// Whether the literal is relative to the call site
        pc_relative: bool,
    },
}

impl DirectPointer {
    /// Returns `true` unless the pointer goes through the dex cache.
    #[must_use]
    pub fn is_direct(self) -> bool {
        self != DirectPointer::None
    }
}

/// Result of sharpening one invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvokeInfo {
    /// Invoke type as written
    pub invoke_type: InvokeType,
    /// Invoke type after sharpening
    pub sharp_type: InvokeType,
    /// Call target, as a reference into a file whose dex cache the caller uses
    pub target: MethodReference,
    /// The resolved callee
    pub method: ArtMethodId,
    /// Vtable index for dispatching calls
    pub vtable_idx: u32,
    /// How the callee's code is reached
    pub direct_code: DirectPointer,
    /// How the callee's method record is reached
    pub direct_method: DirectPointer,
}

/// Options and image classes consulted while sharpening.
#[derive(Debug, Clone, Copy)]
pub struct SharpeningContext<'a> {
    /// Driver options
    pub options: &'a CompilerOptions,
    /// Image classes, `None` when every class is an image class
    pub image_classes: Option<&'a BTreeSet<String>>,
}

impl SharpeningContext<'_> {
    /// Returns `true` if `descriptor` goes into the image being built.
    #[must_use]
    pub fn is_image_class(&self, descriptor: &str) -> bool {
        self.image_classes
            .is_none_or(|classes| classes.contains(descriptor))
    }
}

/// Resolves the invoke of `method_idx` at `dex_pc` and sharpens it.
///
/// Returns `None` when the call must take the slow path: the callee does not resolve, is not
/// accessible from the referrer, or the referrer itself is unresolved. With
/// `enable_devirtualization` the verifier's devirtualization facts in `verified` are used.
#[allow(clippy::too_many_arguments)]
pub fn compute_invoke_info(
    ctx: &SharpeningContext<'_>,
    runtime: &mut Runtime,
    unit: &DexCompilationUnit,
    dex_pc: u32,
    method_idx: u32,
    invoke_type: InvokeType,
    verified: Option<&VerifiedMethod>,
    enable_devirtualization: bool,
    stats: &mut AotCompilationStats,
) -> Option<InvokeInfo> {
    if unit.class.is_none() {
        stats.unresolved_method(invoke_type);
        return None;
    }
    let (linker, heap) = runtime.parts_mut();
    let resolved = linker.resolve_method(heap, unit.dex_file, method_idx, invoke_type);
    sharpen_invoke(
        ctx,
        runtime,
        unit,
        dex_pc,
        method_idx,
        invoke_type,
        resolved,
        verified,
        enable_devirtualization,
        stats,
    )
}

/// Sharpens an invoke whose callee was already resolved (or failed to). Only reads the runtime.
#[allow(clippy::too_many_arguments)]
pub fn sharpen_invoke(
    ctx: &SharpeningContext<'_>,
    runtime: &Runtime,
    unit: &DexCompilationUnit,
    dex_pc: u32,
    method_idx: u32,
    invoke_type: InvokeType,
    resolved: Result<ArtMethodId>,
    verified: Option<&VerifiedMethod>,
    enable_devirtualization: bool,
    stats: &mut AotCompilationStats,
) -> Option<InvokeInfo> {
    let Some(referrer) = unit.class else {
        stats.unresolved_method(invoke_type);
        return None;
    };
    let resolved = match resolved {
        Ok(method) => method,
        Err(e) => {
            log::debug!("Method {method_idx} of {:?} unresolved: {e}", unit.dex_file);
            stats.unresolved_method(invoke_type);
            return None;
        }
    };

    let linker = runtime.class_linker();
    let method = linker.method(resolved);
    if !linker.can_access_class(referrer, resolved.class)
        || !linker.can_access_member(referrer, resolved.class, method.access_flags())
    {
        stats.unresolved_method(invoke_type);
        return None;
    }
    stats.resolved_method(invoke_type);

    let vtable_idx = u32::from(method.method_index());
    let mut sharp_type = invoke_type;
    let mut target = resolved;
    match invoke_type {
        InvokeType::Super => {
            let implementation = linker
                .class(referrer)
                .super_class()
                .and_then(|s| linker.find_virtual_implementation(s, resolved));
            if let Some(implementation) = implementation {
                sharp_type = InvokeType::Direct;
                target = implementation;
                stats.virtual_made_direct(invoke_type);
            }
        }
        InvokeType::Virtual | InvokeType::Interface => {
            let declaring = linker.class(resolved.class);
            if !declaring.is_interface() && (method.is_final() || declaring.is_final()) {
                sharp_type = InvokeType::Direct;
                stats.virtual_made_direct(invoke_type);
            } else if enable_devirtualization {
                let devirtualized = verified
                    .and_then(|v| v.devirt_target(dex_pc))
                    .and_then(|r| linker.dex_cache(r.dex_file).resolved_method(r.index));
                if let Some(devirtualized) = devirtualized {
                    sharp_type = InvokeType::Direct;
                    target = devirtualized;
                    stats.type_based_devirtualization += 1;
                }
            }
        }
        InvokeType::Static | InvokeType::Direct => {}
    }

    let mut target_ref = MethodReference::new(unit.dex_file, method_idx);
    if target != resolved {
        match reference_from_caller(ctx, runtime, unit.dex_file, target) {
            Some(reference) => target_ref = reference,
            None => {
                sharp_type = invoke_type;
                target = resolved;
            }
        }
    }

    let (direct_code, direct_method) =
        get_code_and_method_for_direct_call(ctx, runtime, unit.dex_file, referrer, sharp_type, target, stats);
    Some(InvokeInfo {
        invoke_type,
        sharp_type,
        target: target_ref,
        method: target,
        vtable_idx,
        direct_code,
        direct_method,
    })
}

/// Finds a method index through which the caller's file can name `target`.
fn reference_from_caller(
    ctx: &SharpeningContext<'_>,
    runtime: &Runtime,
    caller: DexFileId,
    target: ArtMethodId,
) -> Option<MethodReference> {
    let linker = runtime.class_linker();
    let method = linker.method(target);
    let class = linker.class(target.class);
    if class.dex_file() == Some(caller) {
        return Some(MethodReference::new(caller, method.dex_method_idx()));
    }
    if !ctx.options.best_effort_dex_cache_reuse {
        return None;
    }
    linker
        .dex_file(caller)
        .find_method_idx(class.descriptor(), method.name(), method.shorty())
        .map(|idx| MethodReference::new(caller, idx))
}

/// Decides how a `sharp_type` call from `referrer` (declared in `caller`) reaches `method`.
pub fn get_code_and_method_for_direct_call(
    ctx: &SharpeningContext<'_>,
    runtime: &Runtime,
    caller: DexFileId,
    referrer: ClassId,
    sharp_type: InvokeType,
    method: ArtMethodId,
    stats: &mut AotCompilationStats,
) -> (DirectPointer, DirectPointer) {
    if !matches!(sharp_type, InvokeType::Static | InvokeType::Direct) {
        return (DirectPointer::None, DirectPointer::None);
    }
    let linker = runtime.class_linker();
    let declaring = linker.class(method.class);
    let is_local = declaring.dex_file() == Some(caller);
    let code_in_boot = declaring.class_loader().is_none();

    if ctx.options.compile_pic && !is_local {
        return (DirectPointer::None, DirectPointer::None);
    }
    let needs_clinit_trampoline = linker.method(method).is_static()
        && !declaring.is_initialized()
        && method.class != referrer;
    if needs_clinit_trampoline {
        return (DirectPointer::None, DirectPointer::None);
    }

    let boot_resident = code_in_boot && runtime.is_in_boot_image_space(declaring.mirror());
    let in_image = if ctx.options.is_boot_image() {
        code_in_boot && ctx.is_image_class(declaring.descriptor())
    } else {
        boot_resident || is_local
    };
    if !in_image {
        return (DirectPointer::None, DirectPointer::None);
    }

    let pointer = if boot_resident {
        DirectPointer::BootImage
    } else {
        DirectPointer::Linker {
            pc_relative: ctx.options.compile_pic,
        }
    };
    stats.direct_call_to_boot(sharp_type, code_in_boot, code_in_boot);
    (pointer, pointer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dex::{AccessFlags, CodeBuilder, DexFileBuilder, Opcode},
        runtime::core,
    };

    struct Fixture {
        runtime: Runtime,
        unit: DexCompilationUnit,
        final_call: u32,
        open_call: u32,
        static_call: u32,
        private_call: u32,
    }

    fn fixture() -> Fixture {
        let mut dex = DexFileBuilder::new("sharpen.dex");
        let body = CodeBuilder::new(1, 1).return_void().build();
        dex.class("LBase;")
            .access_flags(AccessFlags::PUBLIC)
            .superclass(core::OBJECT)
            .virtual_method("open", "V", AccessFlags::PUBLIC, Some(body.clone()))
            .virtual_method("sealed", "V", AccessFlags::PUBLIC | AccessFlags::FINAL, Some(body.clone()))
            .direct_method("hidden", "V", AccessFlags::PRIVATE, Some(body.clone()))
            .direct_method(
                "helper",
                "V",
                AccessFlags::PUBLIC | AccessFlags::STATIC,
                Some(CodeBuilder::new(0, 0).return_void().build()),
            )
            .finish();
        let open_call = dex.method_id("LBase;", "open", "V");
        let final_call = dex.method_id("LBase;", "sealed", "V");
        let static_call = dex.method_id("LBase;", "helper", "V");
        let private_call = dex.method_id("LBase;", "hidden", "V");
        let caller_body = CodeBuilder::new(1, 1)
            .invoke(Opcode::INVOKE_VIRTUAL, &[0], open_call as u16)
            .return_void()
            .build();
        dex.class("LCaller;")
            .superclass(core::OBJECT)
            .virtual_method("run", "V", AccessFlags::PUBLIC, Some(caller_body))
            .finish();

        let mut runtime = Runtime::new(Vec::new()).unwrap();
        let (loader, files) = runtime.create_class_loader(vec![dex.build()]).unwrap();
        let caller = runtime.find_class("LCaller;", Some(loader)).unwrap();
        let unit = DexCompilationUnit {
            dex_file: files[0],
            class_def_idx: 1,
            method_idx: 0,
            access_flags: AccessFlags::PUBLIC,
            class: Some(caller),
            requires_constructor_barrier: false,
        };
        Fixture {
            runtime,
            unit,
            final_call,
            open_call,
            static_call,
            private_call,
        }
    }

    fn sharpen(f: &mut Fixture, method_idx: u32, invoke_type: InvokeType) -> Option<InvokeInfo> {
        let options = CompilerOptions::default();
        let ctx = SharpeningContext {
            options: &options,
            image_classes: None,
        };
        let mut stats = AotCompilationStats::new();
        compute_invoke_info(
            &ctx,
            &mut f.runtime,
            &f.unit,
            0,
            method_idx,
            invoke_type,
            None,
            true,
            &mut stats,
        )
    }

    #[test]
    fn test_final_method_made_direct() {
        let mut f = fixture();
        let final_call = f.final_call;
        let info = sharpen(&mut f, final_call, InvokeType::Virtual).unwrap();
        assert_eq!(info.sharp_type, InvokeType::Direct);
        assert_eq!(info.target, MethodReference::new(f.unit.dex_file, f.final_call));
        assert_eq!(info.direct_code, DirectPointer::Linker { pc_relative: false });
    }

    #[test]
    fn test_open_method_stays_virtual() {
        let mut f = fixture();
        let open_call = f.open_call;
        let info = sharpen(&mut f, open_call, InvokeType::Virtual).unwrap();
        assert_eq!(info.sharp_type, InvokeType::Virtual);
        assert_eq!(info.direct_code, DirectPointer::None);
        assert_eq!(info.direct_method, DirectPointer::None);
    }

    #[test]
    fn test_uninitialized_static_target_uses_dex_cache() {
        let mut f = fixture();
        let static_call = f.static_call;
        let info = sharpen(&mut f, static_call, InvokeType::Static).unwrap();
        assert_eq!(info.sharp_type, InvokeType::Static);
        assert_eq!(info.direct_code, DirectPointer::None);
    }

    #[test]
    fn test_inaccessible_target_is_slow_path() {
        let mut f = fixture();
        let private_call = f.private_call;
        assert!(sharpen(&mut f, private_call, InvokeType::Direct).is_none());
    }

    #[test]
    fn test_pic_forces_dex_cache_for_boot_targets() {
        let f = fixture();
        let linker = f.runtime.class_linker();
        let object = linker.lookup_class(core::OBJECT, None).unwrap();
        let init = linker.find_declared_method(object, "<init>", "V").unwrap();
        let options = CompilerOptions {
            compile_pic: true,
            ..CompilerOptions::default()
        };
        let ctx = SharpeningContext {
            options: &options,
            image_classes: None,
        };
        let mut stats = AotCompilationStats::new();
        let pointers = get_code_and_method_for_direct_call(
            &ctx,
            &f.runtime,
            f.unit.dex_file,
            f.unit.class.unwrap(),
            InvokeType::Direct,
            init,
            &mut stats,
        );
        assert_eq!(pointers, (DirectPointer::None, DirectPointer::None));
    }
}
