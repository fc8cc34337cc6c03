//! Field and method lowering information.
//!
//! Before generating code for a method, the driver collects every field and method reference the
//! method makes into pristine lowering records and resolves them in one batch per kind:
//! [`resolve_instance_field_infos`], [`resolve_static_field_infos`] and
//! [`resolve_method_infos`] look every reference up in the dex caches under the shared mutator
//! lock, resolve the misses under one exclusive acquisition, then fill the records one by one.
//! A record that fails to resolve keeps its pristine, slow-path state; the loop never stops early.

use std::sync::RwLock;

use crate::{
    compiler::{
        sharpening::{sharpen_invoke, DirectPointer, SharpeningContext},
        AotCompilationStats, DexCompilationUnit,
    },
    dex::{DexFileId, MethodReference},
    runtime::{
        class::NO_DEX_INDEX, ArtFieldId, ArtMethodId, ClassId, ClassLinker, Heap, InvokeType,
        Runtime, VerifiedMethod,
    },
    Error, Result,
};

/// Fast-path facts about an instance field access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceFieldInfo {
    /// The resolved field
    pub field: ArtFieldId,
    /// Byte offset of the field in its object
    pub offset: u32,
    /// Whether the field is volatile
    pub is_volatile: bool,
    /// Whether a read may bypass the runtime
    pub fast_get: bool,
    /// Whether a write may bypass the runtime
    pub fast_put: bool,
}

/// Fast-path facts about a static field access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticFieldInfo {
    /// The resolved field
    pub field: ArtFieldId,
    /// Byte offset of the field in its class object
    pub offset: u32,
    /// Whether the field is volatile
    pub is_volatile: bool,
    /// Whether a read may bypass the runtime
    pub fast_get: bool,
    /// Whether a write may bypass the runtime
    pub fast_put: bool,
    /// Type index, in the referrer's file, of the class holding the static storage
    pub storage_index: u32,
    /// Whether the field belongs to the referrer's own class
    pub is_referrers_class: bool,
    /// Whether the declaring class is known to be initialized
    pub is_initialized: bool,
}

fn fast_access(runtime: &Runtime, referrer: ClassId, field: ArtFieldId) -> (bool, bool) {
    let linker = runtime.class_linker();
    let f = linker.field(field);
    let accessible = linker.can_access_class(referrer, field.class)
        && linker.can_access_member(referrer, field.class, f.access_flags());
    let fast_put = accessible && (!f.is_final() || field.class == referrer);
    (accessible, fast_put)
}

/// Resolves an instance field reference of `unit` and decides whether its accesses can use the
/// fast path. Returns `None` if the field does not resolve.
pub fn compute_instance_field_info(
    runtime: &mut Runtime,
    unit: &DexCompilationUnit,
    field_idx: u32,
    is_put: bool,
    stats: &mut AotCompilationStats,
) -> Option<InstanceFieldInfo> {
    let (linker, heap) = runtime.parts_mut();
    let field = linker.resolve_field(heap, unit.dex_file, field_idx, false);
    instance_field_info(runtime, unit, field_idx, field, is_put, stats)
}

pub(crate) fn instance_field_info(
    runtime: &Runtime,
    unit: &DexCompilationUnit,
    field_idx: u32,
    field: Result<ArtFieldId>,
    is_put: bool,
    stats: &mut AotCompilationStats,
) -> Option<InstanceFieldInfo> {
    let field = match field {
        Ok(field) => field,
        Err(e) => {
            log::debug!("Instance field {field_idx} of {:?} unresolved: {e}", unit.dex_file);
            stats.unresolved_instance_fields += 1;
            return None;
        }
    };
    let Some(referrer) = unit.class else {
        stats.unresolved_instance_fields += 1;
        return None;
    };
    let (fast_get, fast_put) = fast_access(runtime, referrer, field);
    let f = runtime.class_linker().field(field);
    let info = InstanceFieldInfo {
        field,
        offset: f.offset(),
        is_volatile: f.is_volatile(),
        fast_get,
        fast_put,
    };
    if (is_put && fast_put) || (!is_put && fast_get) {
        stats.resolved_instance_fields += 1;
    } else {
        stats.unresolved_instance_fields += 1;
    }
    Some(info)
}

fn storage_index(runtime: &Runtime, referrer_dex: DexFileId, class: ClassId) -> Option<u32> {
    let linker = runtime.class_linker();
    let c = linker.class(class);
    if let (Some(dex_file), Some(class_def_idx)) = (c.dex_file(), c.class_def_idx()) {
        if dex_file == referrer_dex {
            return linker
                .dex_file(dex_file)
                .class_def(class_def_idx)
                .ok()
                .map(|def| def.class_idx);
        }
    }
    linker.dex_file(referrer_dex).find_type_idx(c.descriptor())
}

/// Resolves a static field reference of `unit` and decides whether its accesses can use the
/// fast path. Returns `None` if the field does not resolve.
pub fn compute_static_field_info(
    runtime: &mut Runtime,
    unit: &DexCompilationUnit,
    field_idx: u32,
    is_put: bool,
    stats: &mut AotCompilationStats,
) -> Option<StaticFieldInfo> {
    let (linker, heap) = runtime.parts_mut();
    let field = linker.resolve_field(heap, unit.dex_file, field_idx, true);
    static_field_info(runtime, unit, field_idx, field, is_put, stats)
}

pub(crate) fn static_field_info(
    runtime: &Runtime,
    unit: &DexCompilationUnit,
    field_idx: u32,
    field: Result<ArtFieldId>,
    is_put: bool,
    stats: &mut AotCompilationStats,
) -> Option<StaticFieldInfo> {
    let field = match field {
        Ok(field) => field,
        Err(e) => {
            log::debug!("Static field {field_idx} of {:?} unresolved: {e}", unit.dex_file);
            stats.unresolved_static_fields += 1;
            return None;
        }
    };
    let Some(referrer) = unit.class else {
        stats.unresolved_static_fields += 1;
        return None;
    };
    let (accessible, fast_put) = fast_access(runtime, referrer, field);
    let is_referrers_class = field.class == referrer;
    let storage = if is_referrers_class || accessible {
        storage_index(runtime, unit.dex_file, field.class)
    } else {
        None
    };
    let fast_get = accessible && storage.is_some();
    let fast_put = fast_put && storage.is_some();

    let linker = runtime.class_linker();
    let f = linker.field(field);
    let is_initialized = is_referrers_class || linker.class(field.class).is_initialized();
    let info = StaticFieldInfo {
        field,
        offset: f.offset(),
        is_volatile: f.is_volatile(),
        fast_get,
        fast_put,
        storage_index: storage.unwrap_or(NO_DEX_INDEX),
        is_referrers_class,
        is_initialized,
    };

    if (is_put && fast_put) || (!is_put && fast_get) {
        if is_referrers_class {
            stats.resolved_local_static_fields += 1;
        } else {
            stats.resolved_static_fields += 1;
            if is_initialized {
                stats.class_init_checks_elided += 1;
            }
        }
    } else {
        stats.unresolved_static_fields += 1;
    }
    Some(info)
}

/// Lowering record of one field reference.
///
/// Created pristine from the field index alone; the conservative defaults (volatile, slow path)
/// are what code generation sees if resolution fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldLoweringInfo {
    field_idx: u32,
    is_static: bool,
    is_put: bool,
    declaring: Option<ArtFieldId>,
    declaring_dex_file: Option<DexFileId>,
    declaring_field_idx: u32,
    offset: u32,
    is_volatile: bool,
    fast_get: bool,
    fast_put: bool,
    storage_index: u32,
    is_referrers_class: bool,
    is_class_initialized: bool,
}

impl FieldLoweringInfo {
    /// Creates an unresolved record.
    #[must_use]
    pub fn new(field_idx: u32, is_static: bool, is_put: bool) -> Self {
        FieldLoweringInfo {
            field_idx,
            is_static,
            is_put,
            declaring: None,
            declaring_dex_file: None,
            declaring_field_idx: NO_DEX_INDEX,
            offset: 0,
            is_volatile: true,
            fast_get: false,
            fast_put: false,
            storage_index: NO_DEX_INDEX,
            is_referrers_class: false,
            is_class_initialized: false,
        }
    }

    /// Returns `true` while the record has not been touched by a resolver.
    #[must_use]
    pub fn is_pristine(&self) -> bool {
        *self == Self::new(self.field_idx, self.is_static, self.is_put)
    }

    /// Field index in the referrer's file.
    #[must_use]
    pub fn field_idx(&self) -> u32 {
        self.field_idx
    }

    /// Whether this is a static field reference.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.is_static
    }

    /// Whether the reference is a write.
    #[must_use]
    pub fn is_put(&self) -> bool {
        self.is_put
    }

    /// The resolved field.
    #[must_use]
    pub fn declaring_field(&self) -> Option<ArtFieldId> {
        self.declaring
    }

    /// File and field index of the declaration.
    #[must_use]
    pub fn declaring_location(&self) -> Option<(DexFileId, u32)> {
        self.declaring_dex_file.map(|d| (d, self.declaring_field_idx))
    }

    /// Byte offset of the field.
    #[must_use]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Whether the field is volatile; `true` until resolved.
    #[must_use]
    pub fn is_volatile(&self) -> bool {
        self.is_volatile
    }

    /// Fast-path read.
    #[must_use]
    pub fn fast_get(&self) -> bool {
        self.fast_get
    }

    /// Fast-path write.
    #[must_use]
    pub fn fast_put(&self) -> bool {
        self.fast_put
    }

    /// Static storage type index.
    #[must_use]
    pub fn storage_index(&self) -> u32 {
        self.storage_index
    }

    /// Whether the field belongs to the referrer's class.
    #[must_use]
    pub fn is_referrers_class(&self) -> bool {
        self.is_referrers_class
    }

    /// Whether the declaring class needs no initialization check.
    #[must_use]
    pub fn is_class_initialized(&self) -> bool {
        self.is_class_initialized
    }

    fn set_declaring(&mut self, runtime: &Runtime, field: ArtFieldId, offset: u32, is_volatile: bool) {
        let linker = runtime.class_linker();
        self.declaring = Some(field);
        self.declaring_dex_file = linker.class(field.class).dex_file();
        self.declaring_field_idx = linker.field(field).dex_field_idx();
        self.offset = offset;
        self.is_volatile = is_volatile;
    }
}

fn assert_pristine(infos: &[FieldLoweringInfo]) {
    debug_assert!(
        infos.iter().all(FieldLoweringInfo::is_pristine),
        "Field lowering infos resolved twice"
    );
}

/// Looks every key up in the dex caches under the shared mutator lock, then resolves the misses
/// under a single exclusive acquisition. The outcomes line up with `keys`.
pub(crate) fn resolve_batch<K: Copy, T>(
    runtime: &RwLock<Runtime>,
    keys: &[K],
    lookup: impl Fn(&ClassLinker, K) -> Option<Result<T>>,
    resolve: impl Fn(&mut ClassLinker, &mut Heap, K) -> Result<T>,
) -> Vec<Result<T>> {
    let mut outcomes: Vec<Option<Result<T>>> = {
        let runtime = read_lock!(runtime);
        keys.iter().map(|&key| lookup(runtime.class_linker(), key)).collect()
    };
    if outcomes.iter().any(Option::is_none) {
        let mut runtime = write_lock!(runtime);
        let (linker, heap) = runtime.parts_mut();
        for (outcome, &key) in outcomes.iter_mut().zip(keys) {
            if outcome.is_none() {
                *outcome = Some(resolve(linker, heap, key));
            }
        }
    }
    outcomes
        .into_iter()
        .map(|outcome| outcome.unwrap_or_else(|| Err(Error::OutOfBounds)))
        .collect()
}

/// Resolves one field, looking it up under the shared lock first.
pub(crate) fn resolve_field_shared(
    runtime: &RwLock<Runtime>,
    dex_file: DexFileId,
    field_idx: u32,
    is_static: bool,
) -> Result<ArtFieldId> {
    let cached = read_lock!(runtime)
        .class_linker()
        .lookup_resolved_field(dex_file, field_idx, is_static);
    cached.unwrap_or_else(|| {
        let mut runtime = write_lock!(runtime);
        let (linker, heap) = runtime.parts_mut();
        linker.resolve_field(heap, dex_file, field_idx, is_static)
    })
}

/// Resolves one method, looking it up under the shared lock first.
pub(crate) fn resolve_method_shared(
    runtime: &RwLock<Runtime>,
    dex_file: DexFileId,
    method_idx: u32,
    invoke_type: InvokeType,
) -> Result<ArtMethodId> {
    let cached = read_lock!(runtime)
        .class_linker()
        .lookup_resolved_method(dex_file, method_idx, invoke_type);
    cached.unwrap_or_else(|| {
        let mut runtime = write_lock!(runtime);
        let (linker, heap) = runtime.parts_mut();
        linker.resolve_method(heap, dex_file, method_idx, invoke_type)
    })
}

fn resolve_fields(
    runtime: &RwLock<Runtime>,
    dex_file: DexFileId,
    infos: &[FieldLoweringInfo],
    is_static: bool,
) -> Vec<Result<ArtFieldId>> {
    let indices: Vec<u32> = infos.iter().map(FieldLoweringInfo::field_idx).collect();
    resolve_batch(
        runtime,
        &indices,
        |linker, idx| linker.lookup_resolved_field(dex_file, idx, is_static),
        |linker, heap, idx| linker.resolve_field(heap, dex_file, idx, is_static),
    )
}

/// Resolves a batch of instance field records of `unit`. Lookups share the mutator lock; only
/// fields missing from the dex cache take it exclusively, once for the whole batch.
pub fn resolve_instance_field_infos(
    runtime: &RwLock<Runtime>,
    unit: &DexCompilationUnit,
    infos: &mut [FieldLoweringInfo],
    stats: &mut AotCompilationStats,
) {
    assert_pristine(infos);
    let fields = resolve_fields(runtime, unit.dex_file, infos, false);
    let runtime = read_lock!(runtime);
    for (info, field) in infos.iter_mut().zip(fields) {
        debug_assert!(!info.is_static);
        let Some(resolved) =
            instance_field_info(&runtime, unit, info.field_idx, field, info.is_put, stats)
        else {
            continue;
        };
        info.set_declaring(&runtime, resolved.field, resolved.offset, resolved.is_volatile);
        info.fast_get = resolved.fast_get;
        info.fast_put = resolved.fast_put;
    }
}

/// Resolves a batch of static field records of `unit`, locking like
/// [`resolve_instance_field_infos`].
pub fn resolve_static_field_infos(
    runtime: &RwLock<Runtime>,
    unit: &DexCompilationUnit,
    infos: &mut [FieldLoweringInfo],
    stats: &mut AotCompilationStats,
) {
    assert_pristine(infos);
    let fields = resolve_fields(runtime, unit.dex_file, infos, true);
    let runtime = read_lock!(runtime);
    for (info, field) in infos.iter_mut().zip(fields) {
        debug_assert!(info.is_static);
        let Some(resolved) =
            static_field_info(&runtime, unit, info.field_idx, field, info.is_put, stats)
        else {
            continue;
        };
        info.set_declaring(&runtime, resolved.field, resolved.offset, resolved.is_volatile);
        info.fast_get = resolved.fast_get;
        info.fast_put = resolved.fast_put;
        info.storage_index = resolved.storage_index;
        info.is_referrers_class = resolved.is_referrers_class;
        info.is_class_initialized = resolved.is_initialized;
    }
}

/// Lowering record of one invoke instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodLoweringInfo {
    method_idx: u32,
    dex_pc: u32,
    invoke_type: InvokeType,
    sharp_type: InvokeType,
    target: Option<MethodReference>,
    vtable_idx: u32,
    direct_code: DirectPointer,
    direct_method: DirectPointer,
    fast_path: bool,
}

impl MethodLoweringInfo {
    /// Creates an unresolved record for the invoke at `dex_pc`.
    #[must_use]
    pub fn new(method_idx: u32, dex_pc: u32, invoke_type: InvokeType) -> Self {
        MethodLoweringInfo {
            method_idx,
            dex_pc,
            invoke_type,
            sharp_type: invoke_type,
            target: None,
            vtable_idx: NO_DEX_INDEX,
            direct_code: DirectPointer::None,
            direct_method: DirectPointer::None,
            fast_path: false,
        }
    }

    /// Returns `true` while the record has not been touched by a resolver.
    #[must_use]
    pub fn is_pristine(&self) -> bool {
        *self == Self::new(self.method_idx, self.dex_pc, self.invoke_type)
    }

    /// Method index in the referrer's file.
    #[must_use]
    pub fn method_idx(&self) -> u32 {
        self.method_idx
    }

    /// Pc of the invoke.
    #[must_use]
    pub fn dex_pc(&self) -> u32 {
        self.dex_pc
    }

    /// Invoke type as written.
    #[must_use]
    pub fn invoke_type(&self) -> InvokeType {
        self.invoke_type
    }

    /// Invoke type after sharpening.
    #[must_use]
    pub fn sharp_type(&self) -> InvokeType {
        self.sharp_type
    }

    /// Call target, as a reference the caller's dex cache can hold.
    #[must_use]
    pub fn target(&self) -> Option<MethodReference> {
        self.target
    }

    /// Vtable index for dispatching calls.
    #[must_use]
    pub fn vtable_idx(&self) -> u32 {
        self.vtable_idx
    }

    /// How the callee's code is reached.
    #[must_use]
    pub fn direct_code(&self) -> DirectPointer {
        self.direct_code
    }

    /// How the callee's method record is reached.
    #[must_use]
    pub fn direct_method(&self) -> DirectPointer {
        self.direct_method
    }

    /// Whether the invoke resolved at compile time.
    #[must_use]
    pub fn fast_path(&self) -> bool {
        self.fast_path
    }
}

/// Resolves and sharpens a batch of invoke records of `unit`, locking like
/// [`resolve_instance_field_infos`].
pub fn resolve_method_infos(
    runtime: &RwLock<Runtime>,
    ctx: &SharpeningContext<'_>,
    unit: &DexCompilationUnit,
    verified: Option<&VerifiedMethod>,
    infos: &mut [MethodLoweringInfo],
    stats: &mut AotCompilationStats,
) {
    debug_assert!(
        infos.iter().all(MethodLoweringInfo::is_pristine),
        "Method lowering infos resolved twice"
    );
    if unit.class.is_none() {
        for info in infos.iter() {
            stats.unresolved_method(info.invoke_type);
        }
        return;
    }
    let keys: Vec<(u32, InvokeType)> = infos
        .iter()
        .map(|info| (info.method_idx, info.invoke_type))
        .collect();
    let dex_file = unit.dex_file;
    let methods = resolve_batch(
        runtime,
        &keys,
        |linker, (idx, invoke_type)| linker.lookup_resolved_method(dex_file, idx, invoke_type),
        |linker, heap, (idx, invoke_type)| linker.resolve_method(heap, dex_file, idx, invoke_type),
    );

    let runtime = read_lock!(runtime);
    for (info, method) in infos.iter_mut().zip(methods) {
        let Some(invoke) = sharpen_invoke(
            ctx,
            &runtime,
            unit,
            info.dex_pc,
            info.method_idx,
            info.invoke_type,
            method,
            verified,
            true,
            stats,
        ) else {
            continue;
        };
        info.sharp_type = invoke.sharp_type;
        info.target = Some(invoke.target);
        info.vtable_idx = invoke.vtable_idx;
        info.direct_code = invoke.direct_code;
        info.direct_method = invoke.direct_method;
        info.fast_path = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dex::{AccessFlags, DexFileBuilder},
        runtime::core,
    };

    struct Fixture {
        runtime: RwLock<Runtime>,
        unit: DexCompilationUnit,
        other_field: u32,
        own_static: u32,
        private_field: u32,
        missing_field: u32,
    }

    fn fixture() -> Fixture {
        let mut dex = DexFileBuilder::new("lowering.dex");
        dex.class("LOther;")
            .access_flags(AccessFlags::PUBLIC)
            .superclass(core::OBJECT)
            .instance_field("count", "I", AccessFlags::PUBLIC)
            .instance_field("secret", "I", AccessFlags::PRIVATE)
            .instance_field("limit", "J", AccessFlags::PUBLIC | AccessFlags::FINAL)
            .finish();
        dex.class("LUser;")
            .superclass(core::OBJECT)
            .static_field("cache", "Ljava/lang/Object;", AccessFlags::PRIVATE)
            .finish();
        let other_field = dex.field_id("LOther;", "count", "I");
        let private_field = dex.field_id("LOther;", "secret", "I");
        let own_static = dex.field_id("LUser;", "cache", "Ljava/lang/Object;");
        let missing_field = dex.field_id("LOther;", "missing", "I");

        let mut runtime = Runtime::new(Vec::new()).unwrap();
        let (loader, files) = runtime.create_class_loader(vec![dex.build()]).unwrap();
        let user = runtime.find_class("LUser;", Some(loader)).unwrap();
        let unit = DexCompilationUnit {
            dex_file: files[0],
            class_def_idx: 1,
            method_idx: 0,
            access_flags: AccessFlags::STATIC,
            class: Some(user),
            requires_constructor_barrier: false,
        };
        Fixture {
            runtime: RwLock::new(runtime),
            unit,
            other_field,
            own_static,
            private_field,
            missing_field,
        }
    }

    #[test]
    fn test_instance_fields_resolve_per_element() {
        let f = fixture();
        let mut stats = AotCompilationStats::new();
        let mut infos = vec![
            FieldLoweringInfo::new(f.other_field, false, false),
            FieldLoweringInfo::new(f.missing_field, false, false),
            FieldLoweringInfo::new(f.private_field, false, true),
        ];
        resolve_instance_field_infos(&f.runtime, &f.unit, &mut infos, &mut stats);

        assert!(infos[0].fast_get() && infos[0].fast_put());
        assert!(!infos[0].is_volatile());
        assert!(infos[0].offset() >= 8);
        assert_eq!(
            infos[0].declaring_location(),
            Some((f.unit.dex_file, f.other_field))
        );
        assert!(infos[1].is_pristine());
        assert!(infos[2].declaring_field().is_some());
        assert!(!infos[2].fast_get() && !infos[2].fast_put());
        assert_eq!(stats.resolved_instance_fields, 1);
        assert_eq!(stats.unresolved_instance_fields, 2);
    }

    #[test]
    fn test_final_field_not_fast_put_from_other_class() {
        let f = fixture();
        let mut runtime = write_lock!(f.runtime);
        let limit = {
            let linker = runtime.class_linker();
            linker.dex_file(f.unit.dex_file).find_field_idx("LOther;", "limit").unwrap()
        };
        let mut stats = AotCompilationStats::new();
        let info = compute_instance_field_info(&mut runtime, &f.unit, limit, true, &mut stats).unwrap();
        assert!(info.fast_get);
        assert!(!info.fast_put);
    }

    #[test]
    fn test_static_field_of_referrer() {
        let f = fixture();
        let mut stats = AotCompilationStats::new();
        let mut infos = vec![FieldLoweringInfo::new(f.own_static, true, false)];
        resolve_static_field_infos(&f.runtime, &f.unit, &mut infos, &mut stats);

        let info = infos[0];
        assert!(info.fast_get());
        assert!(info.is_referrers_class());
        assert!(info.is_class_initialized());
        let runtime = read_lock!(f.runtime);
        let dex = runtime.class_linker().dex_file(f.unit.dex_file);
        assert_eq!(info.storage_index(), dex.find_type_idx("LUser;").unwrap());
        assert_eq!(stats.resolved_local_static_fields, 1);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "Field lowering infos resolved twice")]
    fn test_field_records_resolve_only_once() {
        let f = fixture();
        let mut stats = AotCompilationStats::new();
        let mut infos = vec![FieldLoweringInfo::new(f.other_field, false, false)];
        resolve_instance_field_infos(&f.runtime, &f.unit, &mut infos, &mut stats);
        assert!(!infos[0].is_pristine());
        resolve_instance_field_infos(&f.runtime, &f.unit, &mut infos, &mut stats);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "Method lowering infos resolved twice")]
    fn test_method_records_resolve_only_once() {
        let f = fixture();
        let options = crate::compiler::CompilerOptions::default();
        let ctx = SharpeningContext {
            options: &options,
            image_classes: None,
        };
        let mut resolved = MethodLoweringInfo::new(0, 0, InvokeType::Direct);
        resolved.fast_path = true;
        let mut infos = vec![MethodLoweringInfo::new(0, 2, InvokeType::Static), resolved];
        let mut stats = AotCompilationStats::new();
        resolve_method_infos(&f.runtime, &ctx, &f.unit, None, &mut infos, &mut stats);
    }

    #[test]
    fn test_shared_lookup_reuses_dex_cache() {
        let f = fixture();
        let mut stats = AotCompilationStats::new();
        let mut first = vec![FieldLoweringInfo::new(f.other_field, false, false)];
        resolve_instance_field_infos(&f.runtime, &f.unit, &mut first, &mut stats);
        {
            let runtime = read_lock!(f.runtime);
            let cache = runtime.class_linker().dex_cache(f.unit.dex_file);
            assert!(cache.resolved_field(f.other_field).is_some());
        }

        let mut second = vec![FieldLoweringInfo::new(f.other_field, false, true)];
        resolve_instance_field_infos(&f.runtime, &f.unit, &mut second, &mut stats);
        assert_eq!(second[0].declaring_field(), first[0].declaring_field());
        assert!(second[0].fast_put());

        let mut wrong_kind = vec![FieldLoweringInfo::new(f.other_field, true, false)];
        resolve_static_field_infos(&f.runtime, &f.unit, &mut wrong_kind, &mut stats);
        assert!(wrong_kind[0].is_pristine());
    }

    #[test]
    fn test_pristine_tracking() {
        let info = FieldLoweringInfo::new(3, false, false);
        assert!(info.is_pristine());
        assert!(info.is_volatile());
        let method = MethodLoweringInfo::new(1, 4, InvokeType::Virtual);
        assert!(method.is_pristine());
        assert_eq!(method.sharp_type(), InvokeType::Virtual);
    }
}
