//! The compiler driver.
//!
//! [`CompilerDriver`] runs the ahead-of-time pipeline over a batch of bytecode files:
//!
//! ```text
//! load_image_classes ─► resolve ─► verify | set_verified ─► initialize_classes
//!                                                               │
//!                 compile (native, then dex-to-dex) ◄─ update_image_classes
//! ```
//!
//! Every phase is a sequence of [`ParallelCompilationManager::for_all`] calls over the class
//! definitions of each file; the next phase starts only once every worker of the previous one
//! has finished. Resolution and initialization run on a single worker when
//! [`CompilerOptions::force_determinism`] is set.
//!
//! # Shared State
//!
//! The [`Runtime`] sits behind an `RwLock` that plays the role of the mutator lock. The
//! compiled-method and compiled-class registries are sharded maps of their own, so registering a
//! finished artifact never waits on heap access. Statistics are collected per worker and merged
//! after each phase.
//!
//! # Failures
//!
//! Classes that fail to resolve, verify or initialize are logged and skipped. Hard verification
//! failures are counted; with [`CompilerOptions::abort_on_hard_verifier_failure`] the count turns
//! into [`Error::HardVerifierFailure`] once every phase has run. Broken invariants (duplicate
//! compiled methods, class status regressions) panic.

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, RwLock,
    },
    time::{Duration, Instant},
};

use crossbeam_skiplist::SkipMap;
use dashmap::{mapref::entry::Entry, DashMap};
use rustc_hash::FxHashSet;

use crate::{
    compiler::{
        backend::{CodeGenerator, MethodCompilationContext, StubCodeGenerator},
        dex_to_dex::{dex_to_dex_compile, DexToDexCompilationLevel, QuickeningOracle},
        lowering::{
            instance_field_info, resolve_field_shared, resolve_instance_field_infos,
            resolve_method_infos, resolve_method_shared, resolve_static_field_infos,
            static_field_info, FieldLoweringInfo, InstanceFieldInfo, MethodLoweringInfo,
            StaticFieldInfo,
        },
        sharpening::{sharpen_invoke, InvokeInfo, SharpeningContext},
        AotCompilationStats, CompiledClass, CompiledMethod, CompilerFilter, CompilerOptions,
        DexCompilationUnit, ImageKind, ParallelCompilationManager,
    },
    dex::{
        AccessFlags, ClassReference, CodeItem, CodeIter, DexFile, DexFileId, EncodedMethod,
        MethodReference, Opcode,
    },
    runtime::{
        prepare_class, verify_prepared_class, ClassId, ClassLinker, ClassStatus, Heap,
        InitOutcome, InvokeType, ObjectKind, Runtime, VerifiedMethod, VerifyFailures,
    },
    utils::BitSet,
    Error, Result,
};

/// Methods of one bytecode file queued for the dex-to-dex pass.
#[derive(Debug, Clone)]
pub struct DexFileMethodSet {
    dex_file: DexFileId,
    methods: BitSet,
}

impl DexFileMethodSet {
    fn new(dex_file: DexFileId, num_methods: usize) -> Self {
        DexFileMethodSet {
            dex_file,
            methods: BitSet::new(num_methods),
        }
    }

    /// The file the method indices belong to.
    #[must_use]
    pub fn dex_file(&self) -> DexFileId {
        self.dex_file
    }

    /// Queued method indices.
    #[must_use]
    pub fn methods(&self) -> &BitSet {
        &self.methods
    }
}

/// Drives resolution, verification, initialization and compilation of a batch of files.
pub struct CompilerDriver {
    options: CompilerOptions,
    runtime: RwLock<Runtime>,
    dex_files: Vec<DexFileId>,
    code_generator: Box<dyn CodeGenerator>,
    parallel: ParallelCompilationManager,
    image_classes: RwLock<Option<BTreeSet<String>>>,
    compiled_methods: DashMap<MethodReference, Arc<CompiledMethod>>,
    compiled_classes: DashMap<ClassReference, CompiledClass>,
    verification_results: SkipMap<MethodReference, Arc<VerifiedMethod>>,
    quickened_code: DashMap<MethodReference, Vec<u16>>,
    dex_to_dex_references: Mutex<Vec<DexFileMethodSet>>,
    current_dex_to_dex_methods: RwLock<Option<Arc<BitSet>>>,
    hard_verifier_failures: AtomicUsize,
    stats: Mutex<AotCompilationStats>,
    timings: Mutex<Vec<(&'static str, Duration)>>,
}

impl CompilerDriver {
    /// Creates a driver compiling `dex_files`, all of which must be registered with `runtime`.
    ///
    /// # Errors
    /// Returns [`Error::Error`] if the worker pool cannot be created.
    pub fn new(
        options: CompilerOptions,
        runtime: Runtime,
        dex_files: Vec<DexFileId>,
        code_generator: Box<dyn CodeGenerator>,
    ) -> Result<Self> {
        let parallel = ParallelCompilationManager::new(options.thread_count)?;
        let image_classes = options.image_classes.clone();
        Ok(CompilerDriver {
            options,
            runtime: RwLock::new(runtime),
            dex_files,
            code_generator,
            parallel,
            image_classes: RwLock::new(image_classes),
            compiled_methods: DashMap::new(),
            compiled_classes: DashMap::new(),
            verification_results: SkipMap::new(),
            quickened_code: DashMap::new(),
            dex_to_dex_references: Mutex::new(Vec::new()),
            current_dex_to_dex_methods: RwLock::new(None),
            hard_verifier_failures: AtomicUsize::new(0),
            stats: Mutex::new(AotCompilationStats::new()),
            timings: Mutex::new(Vec::new()),
        })
    }

    /// Creates a driver backed by the [`StubCodeGenerator`] for the configured target.
    ///
    /// # Errors
    /// See [`CompilerDriver::new`].
    pub fn with_stub_backend(
        options: CompilerOptions,
        runtime: Runtime,
        dex_files: Vec<DexFileId>,
    ) -> Result<Self> {
        let generator = StubCodeGenerator::new(options.instruction_set);
        Self::new(options, runtime, dex_files, Box::new(generator))
    }

    /// The options this driver was created with.
    #[must_use]
    pub fn options(&self) -> &CompilerOptions {
        &self.options
    }

    /// The runtime, guarded by the mutator lock.
    #[must_use]
    pub fn runtime(&self) -> &RwLock<Runtime> {
        &self.runtime
    }

    /// Consumes the driver and returns its runtime, ready for the image writer.
    #[must_use]
    pub fn into_runtime(self) -> Runtime {
        self.runtime
            .into_inner()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Files being compiled.
    #[must_use]
    pub fn dex_files(&self) -> &[DexFileId] {
        &self.dex_files
    }

    /// Runs every phase, then applies the hard verification failure policy.
    ///
    /// # Errors
    /// Returns [`Error::HardVerifierFailure`] if classes failed verification and
    /// [`CompilerOptions::abort_on_hard_verifier_failure`] is set. Statistics have been dumped
    /// and every compiled artifact registered by then.
    pub fn compile_all(&self) -> Result<()> {
        self.pre_compile();
        self.compile();
        if self.options.dump_stats {
            self.dump_stats();
        }

        let failures = self.hard_verifier_failures.load(Ordering::Acquire);
        if failures > 0 && self.options.abort_on_hard_verifier_failure {
            log::error!("{failures} classes had hard verification failures, aborting");
            return Err(Error::HardVerifierFailure(failures));
        }
        Ok(())
    }

    /// Runs every phase up to and including the image class update.
    pub fn pre_compile(&self) {
        self.timed("LoadImageClasses", || self.load_image_classes());
        self.timed("Resolve", || self.resolve());
        match self.options.compiler_filter {
            CompilerFilter::VerifyNone => self.timed("SetVerified", || self.set_verified()),
            CompilerFilter::VerifyAtRuntime => {
                log::info!("Verification deferred to runtime");
            }
            _ => self.timed("Verify", || self.verify()),
        }
        self.timed("InitializeClasses", || self.initialize_classes());
        self.timed("UpdateImageClasses", || self.update_image_classes());
    }

    fn timed<T>(&self, phase: &'static str, work: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let result = work();
        let elapsed = start.elapsed();
        let heap_bytes = read_lock!(self.runtime).heap().bytes_allocated();
        log::info!("{phase}: {elapsed:?}, heap {heap_bytes} bytes");
        lock!(self.timings).push((phase, elapsed));
        result
    }

    /// Phase durations recorded so far, in execution order.
    #[must_use]
    pub fn timings(&self) -> Vec<(&'static str, Duration)> {
        lock!(self.timings).clone()
    }

    fn threads(&self, deterministic: bool) -> usize {
        if deterministic {
            1
        } else {
            self.parallel.thread_count()
        }
    }

    fn num_class_defs(&self, dex_file: DexFileId) -> usize {
        read_lock!(self.runtime)
            .class_linker()
            .dex_file(dex_file)
            .class_defs()
            .len()
    }

    fn dex(&self, dex_file: DexFileId) -> Arc<DexFile> {
        Arc::clone(read_lock!(self.runtime).class_linker().dex_file(dex_file))
    }

    /// Seeds the image class set, then closes it over catch handler types and every class loaded
    /// along the way. Boot images only.
    pub fn load_image_classes(&self) {
        if !self.options.is_boot_image() {
            return;
        }
        let mut image_classes = write_lock!(self.image_classes);
        let Some(image_classes) = image_classes.as_mut() else {
            return;
        };
        let mut runtime = write_lock!(self.runtime);

        let requested: Vec<String> = image_classes.iter().cloned().collect();
        for descriptor in requested {
            if let Err(e) = runtime.find_class(&descriptor, None) {
                log::warn!("Failed to find image class {descriptor}: {e}");
                image_classes.remove(&descriptor);
            }
        }

        let mut failed = FxHashSet::default();
        loop {
            let pending: Vec<(DexFileId, u32)> =
                unresolved_exception_types(runtime.class_linker())
                    .into_iter()
                    .filter(|key| !failed.contains(key))
                    .collect();
            if pending.is_empty() {
                break;
            }
            let (linker, heap) = runtime.parts_mut();
            for (dex_file, type_idx) in pending {
                if let Err(e) = linker.resolve_type(heap, dex_file, type_idx) {
                    log::warn!("Failed to resolve exception class {type_idx}: {e}");
                    failed.insert((dex_file, type_idx));
                }
            }
        }

        let before = image_classes.len();
        for (_, class) in runtime.class_linker().classes() {
            image_classes.insert(class.descriptor().to_string());
        }
        log::debug!(
            "Image classes: {} requested, {} after closure",
            before,
            image_classes.len()
        );
    }

    /// Resolves every class definition of every file together with its fields and methods. Boot
    /// images additionally resolve every type id.
    pub fn resolve(&self) {
        let threads = self.threads(self.options.force_determinism);
        for &dex_file in &self.dex_files {
            if self.options.is_boot_image() {
                let num_types = self.dex(dex_file).num_types();
                self.parallel.for_all(0, num_types, threads, |_: &mut (), index| {
                    #[allow(clippy::cast_possible_truncation)]
                    let type_idx = index as u32;
                    let cached = read_lock!(self.runtime)
                        .class_linker()
                        .dex_cache(dex_file)
                        .resolved_type(type_idx)
                        .is_some();
                    if cached {
                        return;
                    }
                    let mut runtime = write_lock!(self.runtime);
                    let (linker, heap) = runtime.parts_mut();
                    if let Err(e) = linker.resolve_type(heap, dex_file, type_idx) {
                        log::debug!("Type {type_idx} of {dex_file:?} unresolved: {e}");
                    }
                });
            }
            let num_class_defs = self.num_class_defs(dex_file);
            self.parallel.for_all(0, num_class_defs, threads, |_: &mut (), index| {
                #[allow(clippy::cast_possible_truncation)]
                self.resolve_class_def(dex_file, index as u32);
            });
        }
    }

    fn resolve_class_def(&self, dex_file: DexFileId, class_def_idx: u32) {
        let mut runtime = write_lock!(self.runtime);
        let (linker, heap) = runtime.parts_mut();
        let class = match linker.resolve_class_def(heap, dex_file, class_def_idx) {
            Ok(class) => class,
            Err(e) => {
                log::debug!("Class def {class_def_idx} of {dex_file:?} unresolved: {e}");
                return;
            }
        };
        let dex = Arc::clone(linker.dex_file(dex_file));
        let Ok(class_def) = dex.class_def(class_def_idx) else {
            return;
        };

        for field in &class_def.static_fields {
            if let Err(e) = linker.resolve_field(heap, dex_file, field.field_idx, true) {
                log::debug!("Static field {} unresolved: {e}", field.field_idx);
            }
        }
        for field in &class_def.instance_fields {
            if let Err(e) = linker.resolve_field(heap, dex_file, field.field_idx, false) {
                log::debug!("Instance field {} unresolved: {e}", field.field_idx);
            }
        }
        let is_interface = linker.class(class).is_interface();
        for method in class_def.methods() {
            let invoke_type = InvokeType::for_method(method.access_flags, is_interface);
            if let Err(e) = linker.resolve_method(heap, dex_file, method.method_idx, invoke_type) {
                log::debug!("Method {} unresolved: {e}", method.method_idx);
            }
        }
    }

    /// Class of a class definition of `dex_file`, `None` if it does not resolve or another file
    /// defines it. Linked classes are found under the shared lock; loading takes it exclusively.
    fn class_of_def(&self, dex_file: DexFileId, class_def_idx: u32) -> Option<ClassId> {
        let linked = read_lock!(self.runtime)
            .class_linker()
            .lookup_class_def(dex_file, class_def_idx);
        let class = match linked {
            Some(class) => class,
            None => {
                let mut runtime = write_lock!(self.runtime);
                let (linker, heap) = runtime.parts_mut();
                match linker.resolve_class_def(heap, dex_file, class_def_idx) {
                    Ok(class) => class,
                    Err(e) => {
                        log::debug!("Class def {class_def_idx} of {dex_file:?} unresolved: {e}");
                        return None;
                    }
                }
            }
        };
        let runtime = read_lock!(self.runtime);
        (runtime.class_linker().class(class).dex_file() == Some(dex_file)).then_some(class)
    }

    /// Verifies every class definition and records the per-method results.
    pub fn verify(&self) {
        let threads = self.threads(false);
        for &dex_file in &self.dex_files {
            let num_class_defs = self.num_class_defs(dex_file);
            self.parallel.for_all(0, num_class_defs, threads, |_: &mut (), index| {
                #[allow(clippy::cast_possible_truncation)]
                self.verify_class_def(dex_file, index as u32);
            });
        }
    }

    fn verify_class_def(&self, dex_file: DexFileId, class_def_idx: u32) {
        let prepared = {
            let mut runtime = write_lock!(self.runtime);
            let (linker, heap) = runtime.parts_mut();
            prepare_class(linker, heap, dex_file, class_def_idx)
        };
        let verification = verify_prepared_class(read_lock!(self.runtime).class_linker(), &prepared);

        let mut status = None;
        if let Some(class) = verification.class() {
            let mut runtime = write_lock!(self.runtime);
            let (linker, heap) = runtime.parts_mut();
            let current = linker.class(class).status();
            if current >= ClassStatus::Verified {
                status = Some(current);
            } else if !linker.class(class).is_erroneous() {
                linker.set_class_status(heap, class, verification.status());
                status = Some(verification.status());
            }
        }

        if verification.has_hard_failure() {
            self.hard_verifier_failures.fetch_add(1, Ordering::AcqRel);
        }
        if let Some(status) = status {
            self.record_class_status(ClassReference::new(dex_file, class_def_idx), status);
        }
        for method in verification.into_methods() {
            self.verification_results
                .insert(method.method(), Arc::new(method));
        }
    }

    /// Marks every class verified without running the verifier.
    pub fn set_verified(&self) {
        let threads = self.threads(false);
        for &dex_file in &self.dex_files {
            let num_class_defs = self.num_class_defs(dex_file);
            self.parallel.for_all(0, num_class_defs, threads, |_: &mut (), index| {
                #[allow(clippy::cast_possible_truncation)]
                let class_def_idx = index as u32;
                let Some(class) = self.class_of_def(dex_file, class_def_idx) else {
                    return;
                };
                let current = read_lock!(self.runtime).class_linker().class(class).status();
                let status = match current {
                    ClassStatus::Error => return,
                    current if current >= ClassStatus::Verified => current,
                    _ => {
                        let mut runtime = write_lock!(self.runtime);
                        let (linker, heap) = runtime.parts_mut();
                        let current = linker.class(class).status();
                        let status = current.max(ClassStatus::Verified);
                        if status != current {
                            linker.set_class_status(heap, class, status);
                        }
                        status
                    }
                };
                self.record_class_status(ClassReference::new(dex_file, class_def_idx), status);
            });
        }
    }

    /// Initializes every verified class as far as the options allow.
    pub fn initialize_classes(&self) {
        let threads = self.threads(self.options.force_determinism);
        for &dex_file in &self.dex_files {
            let num_class_defs = self.num_class_defs(dex_file);
            self.parallel.for_all(0, num_class_defs, threads, |_: &mut (), index| {
                #[allow(clippy::cast_possible_truncation)]
                self.initialize_class(dex_file, index as u32);
            });
        }
    }

    fn initialize_class(&self, dex_file: DexFileId, class_def_idx: u32) {
        let Some(class) = self.class_of_def(dex_file, class_def_idx) else {
            return;
        };
        let descriptor = {
            let runtime = read_lock!(self.runtime);
            let class = runtime.class_linker().class(class);
            if class.status() != ClassStatus::Verified {
                return;
            }
            class.descriptor().to_string()
        };

        let mut runtime = write_lock!(self.runtime);
        if runtime.class_linker().class(class).status() != ClassStatus::Verified {
            return;
        }

        let mut outcome = attempt_init(&mut runtime, class, false, false, &descriptor);
        if outcome != Some(InitOutcome::Initialized) {
            outcome = attempt_init(&mut runtime, class, false, true, &descriptor);
        }
        if outcome != Some(InitOutcome::Initialized) && self.can_init_statics(&descriptor) {
            match runtime.ensure_initialized(class, true, true) {
                Ok(_) => {}
                Err(e) => log::warn!("Initialization of {descriptor} aborted: {e}"),
            }
        }

        let status = runtime.class_linker().class(class).status();
        drop(runtime);
        if status >= ClassStatus::Verified {
            self.record_class_status(ClassReference::new(dex_file, class_def_idx), status);
        }
    }

    fn can_init_statics(&self, descriptor: &str) -> bool {
        self.options.image_kind != ImageKind::None
            && self.is_image_class(descriptor)
            && !self.options.is_no_preload(descriptor)
    }

    /// Adds every class reachable from the static state of an initialized image class to the
    /// image class set. Boot images only.
    pub fn update_image_classes(&self) {
        if !self.options.is_boot_image() {
            return;
        }
        let mut image_classes = write_lock!(self.image_classes);
        let Some(image_classes) = image_classes.as_mut() else {
            return;
        };
        let runtime = read_lock!(self.runtime);
        let linker = runtime.class_linker();
        let heap = runtime.heap();

        let mut stack: Vec<_> = linker
            .classes()
            .filter(|(_, class)| class.is_initialized() && image_classes.contains(class.descriptor()))
            .map(|(_, class)| class.mirror())
            .collect();
        let before = image_classes.len();
        let mut visited = FxHashSet::default();
        while let Some(object) = stack.pop() {
            if !visited.insert(object) {
                continue;
            }
            let Some(header) = heap.get(object) else {
                continue;
            };
            if let Some(class) = class_of_mirror(heap, header.class()) {
                add_with_supertypes(linker, image_classes, class);
            }
            match header.kind() {
                ObjectKind::DexCache(_) => continue,
                ObjectKind::Class(class) => add_with_supertypes(linker, image_classes, *class),
                _ => {}
            }
            header.visit_references(|reference| {
                if let Some(reference) = reference {
                    stack.push(reference);
                }
            });
        }
        log::debug!(
            "Image class update added {} classes",
            image_classes.len() - before
        );
    }

    /// Compiles every method of every file, then runs the dex-to-dex pass over the methods native
    /// compilation declined.
    pub fn compile(&self) {
        let start = Instant::now();
        let threads = self.threads(false);
        for &dex_file in &self.dex_files {
            let num_methods = self.dex(dex_file).num_methods();
            lock!(self.dex_to_dex_references).push(DexFileMethodSet::new(dex_file, num_methods));
            let num_class_defs = self.num_class_defs(dex_file);
            let states = self.parallel.for_all(0, num_class_defs, threads, |stats: &mut AotCompilationStats, index| {
                #[allow(clippy::cast_possible_truncation)]
                self.compile_class(dex_file, index as u32, stats);
            });
            self.merge_stats(&states);
        }
        self.compile_dex_to_dex_methods();

        let elapsed = start.elapsed();
        let heap_bytes = read_lock!(self.runtime).heap().bytes_allocated();
        log::info!(
            "Compile: {elapsed:?}, {} methods, heap {heap_bytes} bytes",
            self.compiled_methods.len()
        );
        lock!(self.timings).push(("Compile", elapsed));
    }

    fn merge_stats(&self, states: &[AotCompilationStats]) {
        let mut stats = lock!(self.stats);
        for state in states {
            stats.merge(state);
        }
    }

    fn compilation_unit(
        &self,
        dex: &DexFile,
        dex_file: DexFileId,
        class_def_idx: u32,
        method: &EncodedMethod,
    ) -> Option<(DexCompilationUnit, Option<ClassStatus>)> {
        let class_def = dex.class_def(class_def_idx).ok()?;
        let descriptor = dex.class_descriptor(class_def).ok()?;
        let runtime = read_lock!(self.runtime);
        let linker = runtime.class_linker();
        let class = linker
            .lookup_class(descriptor, linker.dex_file_loader(dex_file))
            .filter(|&class| linker.class(class).dex_file() == Some(dex_file));
        let status = class.map(|class| linker.class(class).status());
        let unit = DexCompilationUnit {
            dex_file,
            class_def_idx,
            method_idx: method.method_idx,
            access_flags: method.access_flags,
            class,
            requires_constructor_barrier: class_def
                .instance_fields
                .iter()
                .any(|field| field.access_flags.contains(AccessFlags::FINAL)),
        };
        Some((unit, status))
    }

    fn compile_class(&self, dex_file: DexFileId, class_def_idx: u32, stats: &mut AotCompilationStats) {
        let dex = self.dex(dex_file);
        let Ok(class_def) = dex.class_def(class_def_idx) else {
            return;
        };
        let compile_class = dex
            .class_descriptor(class_def)
            .is_ok_and(|descriptor| self.is_class_to_compile(descriptor));
        for method in class_def.methods() {
            let Some((unit, status)) = self.compilation_unit(&dex, dex_file, class_def_idx, method)
            else {
                continue;
            };
            self.compile_method(&dex, &unit, method, status, compile_class, stats);
        }
    }

    fn compile_method(
        &self,
        dex: &DexFile,
        unit: &DexCompilationUnit,
        method: &EncodedMethod,
        class_status: Option<ClassStatus>,
        compile_class: bool,
        stats: &mut AotCompilationStats,
    ) {
        let method_ref = unit.method_reference();
        let flags = method.access_flags;
        if flags.contains(AccessFlags::ABSTRACT) {
            return;
        }
        let start = Instant::now();

        let mut compiled = None;
        if flags.contains(AccessFlags::NATIVE) {
            if self.options.compile_jni || !self.options.instruction_set.has_generic_jni_stub() {
                let shorty = dex.method_id(method.method_idx).map_or("V", |m| m.shorty.as_str());
                compiled = Some(self.code_generator.jni_compile(method_ref, flags, shorty));
                stats.jni_stubs_compiled += 1;
            }
        } else if let Some(code_item) = &method.code {
            let verified = self.get_verified_method(method_ref);
            let compile = compile_class
                && self.options.compiler_filter.is_compilation_enabled()
                && self.is_method_to_compile(dex, method.method_idx)
                && verified.as_deref().is_some_and(is_compilable)
                && self.is_profiled(method_ref);
            if let (true, Some(verified)) = (compile, verified.as_deref()) {
                compiled = self.compile_native(dex, unit, code_item, verified, stats);
            }
            if compiled.is_none()
                && dex_to_dex_level(class_status) != DexToDexCompilationLevel::DontCompile
            {
                self.mark_for_dex_to_dex(method_ref);
            }
        }

        let elapsed = start.elapsed();
        if elapsed > self.options.slow_method_threshold {
            log::warn!(
                "Compilation of {} took {elapsed:?}",
                pretty_method(dex, method.method_idx)
            );
        }
        if let Some(compiled) = compiled {
            self.add_compiled_method(method_ref, compiled);
        }
    }

    fn is_profiled(&self, method: MethodReference) -> bool {
        self.options
            .profile
            .as_ref()
            .is_none_or(|profile| profile.contains(&method))
    }

    fn compile_native(
        &self,
        dex: &DexFile,
        unit: &DexCompilationUnit,
        code_item: &CodeItem,
        verified: &VerifiedMethod,
        stats: &mut AotCompilationStats,
    ) -> Option<CompiledMethod> {
        let mut instance_fields = Vec::new();
        let mut static_fields = Vec::new();
        let mut invokes = Vec::new();
        let mut type_indices = BTreeSet::new();
        let mut string_indices = BTreeSet::new();
        for instruction in CodeIter::new(&code_item.insns) {
            let instruction = match instruction {
                Ok(instruction) => instruction,
                Err(e) => {
                    log::debug!("{}: {e}", pretty_method(dex, unit.method_idx));
                    return None;
                }
            };
            let opcode = instruction.opcode();
            let Some(index) = instruction.index() else {
                continue;
            };
            if opcode.is_instance_get() || opcode.is_instance_put() {
                instance_fields.push(FieldLoweringInfo::new(index, false, opcode.is_instance_put()));
            } else if opcode.is_static_get() || opcode.is_static_put() {
                static_fields.push(FieldLoweringInfo::new(index, true, opcode.is_static_put()));
            } else if let Some(invoke_type) = InvokeType::from_opcode(opcode) {
                invokes.push(MethodLoweringInfo::new(index, instruction.pc(), invoke_type));
            } else if matches!(opcode, Opcode::CONST_STRING | Opcode::CONST_STRING_JUMBO) {
                string_indices.insert(index);
            } else if matches!(
                opcode,
                Opcode::CONST_CLASS | Opcode::NEW_INSTANCE | Opcode::CHECK_CAST
            ) {
                type_indices.insert(index);
            }
        }

        resolve_instance_field_infos(&self.runtime, unit, &mut instance_fields, stats);
        resolve_static_field_infos(&self.runtime, unit, &mut static_fields, stats);
        let (types_in_dex_cache, strings_in_dex_cache) = {
            let image_classes = read_lock!(self.image_classes);
            let ctx = SharpeningContext {
                options: &self.options,
                image_classes: image_classes.as_ref(),
            };
            resolve_method_infos(&self.runtime, &ctx, unit, Some(verified), &mut invokes, stats);

            let types: BTreeSet<u32> = {
                let runtime = read_lock!(self.runtime);
                type_indices
                    .into_iter()
                    .filter(|&type_idx| {
                        self.type_in_dex_cache(&ctx, &runtime, unit.dex_file, type_idx, stats)
                    })
                    .collect()
            };
            let strings: BTreeSet<u32> = string_indices
                .into_iter()
                .filter(|&string_idx| self.string_in_dex_cache(unit.dex_file, string_idx, stats))
                .collect();
            (types, strings)
        };

        let mut field_infos = instance_fields;
        field_infos.append(&mut static_fields);
        let shorty = dex.method_id(unit.method_idx).map_or("V", |m| m.shorty.as_str());
        let ctx = MethodCompilationContext {
            unit,
            code_item,
            shorty,
            verified,
            field_infos: &field_infos,
            method_infos: &invokes,
            types_in_dex_cache: &types_in_dex_cache,
            strings_in_dex_cache: &strings_in_dex_cache,
            compile_pic: self.options.compile_pic,
        };
        match self.code_generator.compile(&ctx) {
            Ok(Some(compiled)) => {
                stats.native_methods_compiled += 1;
                Some(compiled)
            }
            Ok(None) => None,
            Err(e) => {
                log::debug!("Backend declined {}: {e}", pretty_method(dex, unit.method_idx));
                None
            }
        }
    }

    fn mark_for_dex_to_dex(&self, method: MethodReference) {
        let mut references = lock!(self.dex_to_dex_references);
        let Some(current) = references.last_mut() else {
            panic!("No dex-to-dex method set open for {method:?}");
        };
        assert_eq!(
            current.dex_file, method.dex_file,
            "Dex-to-dex method set is not the current file"
        );
        current.methods.insert(method.index as usize);
    }

    fn compile_dex_to_dex_methods(&self) {
        let sets = lock!(self.dex_to_dex_references).clone();
        let threads = self.threads(!self.options.multi_threaded_dex_to_dex);
        for set in sets {
            let methods: Vec<usize> = set.methods.iter().collect();
            if methods.is_empty() {
                continue;
            }
            *write_lock!(self.current_dex_to_dex_methods) = Some(Arc::new(set.methods.clone()));
            let states = self
                .parallel
                .for_all(0, methods.len(), threads, |stats: &mut AotCompilationStats, index| {
                    #[allow(clippy::cast_possible_truncation)]
                    self.dex_to_dex_method(set.dex_file, methods[index] as u32, stats);
                });
            self.merge_stats(&states);
        }
        *write_lock!(self.current_dex_to_dex_methods) = None;
    }

    fn dex_to_dex_method(
        &self,
        dex_file: DexFileId,
        method_idx: u32,
        stats: &mut AotCompilationStats,
    ) {
        debug_assert!(self
            .get_current_dex_to_dex_methods()
            .is_some_and(|methods| methods.contains(method_idx as usize)));
        let dex = self.dex(dex_file);
        let Some((class_def_idx, method)) = dex.find_encoded_method(method_idx) else {
            return;
        };
        let Some(code_item) = &method.code else {
            return;
        };
        let Some((unit, status)) = self.compilation_unit(&dex, dex_file, class_def_idx, method)
        else {
            return;
        };
        let method_ref = unit.method_reference();
        let verified = self.get_verified_method(method_ref);
        let mut oracle = DriverQuickeningOracle {
            driver: self,
            unit: &unit,
            verified: verified.as_deref(),
            scratch: AotCompilationStats::new(),
        };

        let mut insns = code_item.insns.clone();
        let result = dex_to_dex_compile(
            &mut insns,
            &unit,
            dex_to_dex_level(status),
            self.options.instruction_set,
            &mut oracle,
            stats,
        );
        if insns != code_item.insns {
            self.quickened_code.insert(method_ref, insns);
        }
        match result {
            Ok(Some(compiled)) => self.add_compiled_method(method_ref, compiled),
            Ok(None) => {}
            Err(e) => log::debug!("Dex-to-dex of {} failed: {e}", pretty_method(&dex, method_idx)),
        }
    }

    /// Methods of the file currently in the dex-to-dex pass; `None` outside of it.
    #[must_use]
    pub fn get_current_dex_to_dex_methods(&self) -> Option<Arc<BitSet>> {
        read_lock!(self.current_dex_to_dex_methods).clone()
    }

    /// Methods queued for the dex-to-dex pass, one set per compiled file.
    #[must_use]
    pub fn dex_to_dex_references(&self) -> Vec<DexFileMethodSet> {
        lock!(self.dex_to_dex_references).clone()
    }

    /// Rewritten instructions of a method the dex-to-dex pass changed.
    #[must_use]
    pub fn get_quickened_code(&self, method: MethodReference) -> Option<Vec<u16>> {
        self.quickened_code.get(&method).map(|code| code.value().clone())
    }

    /// Registers a compiled method.
    ///
    /// # Panics
    /// Panics if `method` was already registered.
    pub fn add_compiled_method(&self, method: MethodReference, compiled: CompiledMethod) {
        match self.compiled_methods.entry(method) {
            Entry::Occupied(_) => {
                log::error!("Method {method:?} compiled twice");
                panic!("Duplicate compiled method {method:?}");
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(compiled));
            }
        }
    }

    /// The compiled form of `method`, if any.
    #[must_use]
    pub fn get_compiled_method(&self, method: MethodReference) -> Option<Arc<CompiledMethod>> {
        self.compiled_methods
            .get(&method)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Removes a compiled method so it can be compiled again.
    pub fn remove_compiled_method(&self, method: MethodReference) -> Option<Arc<CompiledMethod>> {
        self.compiled_methods.remove(&method).map(|(_, compiled)| compiled)
    }

    /// Number of registered compiled methods.
    #[must_use]
    pub fn num_compiled_methods(&self) -> usize {
        self.compiled_methods.len()
    }

    /// Every method with a compiled form, in method order.
    #[must_use]
    pub fn compiled_method_references(&self) -> Vec<MethodReference> {
        let mut methods: Vec<_> = self.compiled_methods.iter().map(|e| *e.key()).collect();
        methods.sort_unstable();
        methods
    }

    /// Records the status reached by a class. Re-recording the current status is a no-op.
    ///
    /// # Panics
    /// Panics if `status` is behind the status already recorded for `class`.
    pub fn record_class_status(&self, class: ClassReference, status: ClassStatus) {
        match self.compiled_classes.entry(class) {
            Entry::Occupied(mut entry) => {
                let recorded = entry.get().status();
                if status == recorded {
                    return;
                }
                if status < recorded {
                    log::error!("Class {class:?} status regressed from {recorded:?} to {status:?}");
                    panic!("Class status of {class:?} moved backwards: {recorded:?} -> {status:?}");
                }
                entry.insert(CompiledClass::new(status));
            }
            Entry::Vacant(entry) => {
                entry.insert(CompiledClass::new(status));
            }
        }
    }

    /// The status recorded for a class definition.
    #[must_use]
    pub fn get_compiled_class(&self, class: ClassReference) -> Option<CompiledClass> {
        self.compiled_classes.get(&class).map(|entry| *entry.value())
    }

    /// Verification facts of a method, if it was verified.
    #[must_use]
    pub fn get_verified_method(&self, method: MethodReference) -> Option<Arc<VerifiedMethod>> {
        self.verification_results
            .get(&method)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Returns `true` if any class failed verification hard.
    #[must_use]
    pub fn had_hard_verifier_failure(&self) -> bool {
        self.hard_verifier_failures.load(Ordering::Acquire) > 0
    }

    /// Returns `true` if `descriptor` belongs in the image. Without an allow-list, every class
    /// does.
    #[must_use]
    pub fn is_image_class(&self, descriptor: &str) -> bool {
        read_lock!(self.image_classes)
            .as_ref()
            .is_none_or(|classes| classes.contains(descriptor))
    }

    /// The current image class set, `None` if every class is an image class.
    #[must_use]
    pub fn image_classes(&self) -> Option<BTreeSet<String>> {
        read_lock!(self.image_classes).clone()
    }

    /// Returns `true` if methods of `descriptor` may be compiled natively.
    #[must_use]
    pub fn is_class_to_compile(&self, descriptor: &str) -> bool {
        self.options
            .classes_to_compile
            .as_ref()
            .is_none_or(|classes| classes.contains(descriptor))
    }

    /// Returns `true` if `method_idx` of `dex` may be compiled natively. Filter entries have the
    /// form `Lpkg/Class;->name`.
    #[must_use]
    pub fn is_method_to_compile(&self, dex: &DexFile, method_idx: u32) -> bool {
        self.options
            .methods_to_compile
            .as_ref()
            .is_none_or(|methods| methods.contains(&pretty_method(dex, method_idx)))
    }

    /// Resolves and sharpens an invoke, accounting the outcome in the driver statistics.
    #[must_use]
    pub fn compute_invoke_info(
        &self,
        unit: &DexCompilationUnit,
        dex_pc: u32,
        method_idx: u32,
        invoke_type: InvokeType,
    ) -> Option<InvokeInfo> {
        let verified = self.get_verified_method(unit.method_reference());
        let mut stats = AotCompilationStats::new();
        let info = {
            let image_classes = read_lock!(self.image_classes);
            let ctx = SharpeningContext {
                options: &self.options,
                image_classes: image_classes.as_ref(),
            };
            let resolved = resolve_method_shared(&self.runtime, unit.dex_file, method_idx, invoke_type);
            sharpen_invoke(
                &ctx,
                &read_lock!(self.runtime),
                unit,
                dex_pc,
                method_idx,
                invoke_type,
                resolved,
                verified.as_deref(),
                true,
                &mut stats,
            )
        };
        lock!(self.stats).merge(&stats);
        info
    }

    /// Resolves an instance field access, accounting the outcome in the driver statistics.
    #[must_use]
    pub fn compute_instance_field_info(
        &self,
        unit: &DexCompilationUnit,
        field_idx: u32,
        is_put: bool,
    ) -> Option<InstanceFieldInfo> {
        let mut stats = AotCompilationStats::new();
        let field = resolve_field_shared(&self.runtime, unit.dex_file, field_idx, false);
        let info = instance_field_info(
            &read_lock!(self.runtime),
            unit,
            field_idx,
            field,
            is_put,
            &mut stats,
        );
        lock!(self.stats).merge(&stats);
        info
    }

    /// Resolves a static field access, accounting the outcome in the driver statistics.
    #[must_use]
    pub fn compute_static_field_info(
        &self,
        unit: &DexCompilationUnit,
        field_idx: u32,
        is_put: bool,
    ) -> Option<StaticFieldInfo> {
        let mut stats = AotCompilationStats::new();
        let field = resolve_field_shared(&self.runtime, unit.dex_file, field_idx, true);
        let info = static_field_info(
            &read_lock!(self.runtime),
            unit,
            field_idx,
            field,
            is_put,
            &mut stats,
        );
        lock!(self.stats).merge(&stats);
        info
    }

    /// Returns `true` if compiled code may load `type_idx` from the dex cache without a
    /// resolution check. Only boot image types that already resolved qualify.
    #[must_use]
    pub fn can_assume_type_is_present_in_dex_cache(&self, dex_file: DexFileId, type_idx: u32) -> bool {
        let mut stats = AotCompilationStats::new();
        let result = {
            let image_classes = read_lock!(self.image_classes);
            let ctx = SharpeningContext {
                options: &self.options,
                image_classes: image_classes.as_ref(),
            };
            self.type_in_dex_cache(&ctx, &read_lock!(self.runtime), dex_file, type_idx, &mut stats)
        };
        lock!(self.stats).merge(&stats);
        result
    }

    /// Returns `true` if compiled code may load `string_idx` from the dex cache without a
    /// resolution check. Boot image strings are resolved eagerly to guarantee it.
    #[must_use]
    pub fn can_assume_string_is_present_in_dex_cache(
        &self,
        dex_file: DexFileId,
        string_idx: u32,
    ) -> bool {
        let mut stats = AotCompilationStats::new();
        let result = self.string_in_dex_cache(dex_file, string_idx, &mut stats);
        lock!(self.stats).merge(&stats);
        result
    }

    fn type_in_dex_cache(
        &self,
        ctx: &SharpeningContext<'_>,
        runtime: &Runtime,
        dex_file: DexFileId,
        type_idx: u32,
        stats: &mut AotCompilationStats,
    ) -> bool {
        let linker = runtime.class_linker();
        let result = self.options.is_boot_image()
            && linker
                .dex_file(dex_file)
                .type_descriptor(type_idx)
                .is_ok_and(|descriptor| ctx.is_image_class(descriptor))
            && linker.dex_cache(dex_file).resolved_type(type_idx).is_some();
        if result {
            stats.types_in_dex_cache += 1;
        } else {
            stats.types_not_in_dex_cache += 1;
        }
        result
    }

    fn string_in_dex_cache(
        &self,
        dex_file: DexFileId,
        string_idx: u32,
        stats: &mut AotCompilationStats,
    ) -> bool {
        let result = self.options.is_boot_image() && {
            let cached = read_lock!(self.runtime)
                .class_linker()
                .dex_cache(dex_file)
                .resolved_string(string_idx)
                .is_some();
            cached || {
                let mut runtime = write_lock!(self.runtime);
                let (linker, heap) = runtime.parts_mut();
                match linker.resolve_string(heap, dex_file, string_idx) {
                    Ok(_) => true,
                    Err(e) => {
                        log::debug!("String {string_idx} of {dex_file:?} unresolved: {e}");
                        false
                    }
                }
            }
        };
        if result {
            stats.strings_in_dex_cache += 1;
        } else {
            stats.strings_not_in_dex_cache += 1;
        }
        result
    }

    /// A snapshot of the merged statistics.
    #[must_use]
    pub fn stats(&self) -> AotCompilationStats {
        lock!(self.stats).clone()
    }

    /// Logs the statistics and the phase timings.
    pub fn dump_stats(&self) {
        lock!(self.stats).dump();
        for (phase, elapsed) in lock!(self.timings).iter() {
            log::info!("{phase}: {elapsed:?}");
        }
    }
}

impl std::fmt::Debug for CompilerDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompilerDriver")
            .field("options", &self.options)
            .field("dex_files", &self.dex_files)
            .field("compiled_methods", &self.compiled_methods.len())
            .field("compiled_classes", &self.compiled_classes.len())
            .finish_non_exhaustive()
    }
}

/// Answers the dex-to-dex pass's questions through the driver's runtime.
struct DriverQuickeningOracle<'a> {
    driver: &'a CompilerDriver,
    unit: &'a DexCompilationUnit,
    verified: Option<&'a VerifiedMethod>,
    // lookups made for quickening do not count towards the compilation statistics
    scratch: AotCompilationStats,
}

impl QuickeningOracle for DriverQuickeningOracle<'_> {
    fn is_safe_cast(&self, dex_pc: u32) -> bool {
        self.verified.is_some_and(|verified| verified.is_safe_cast(dex_pc))
    }

    fn instance_field_info(&mut self, field_idx: u32, is_put: bool) -> Option<InstanceFieldInfo> {
        let runtime = &self.driver.runtime;
        let field = resolve_field_shared(runtime, self.unit.dex_file, field_idx, false);
        instance_field_info(
            &read_lock!(runtime),
            self.unit,
            field_idx,
            field,
            is_put,
            &mut self.scratch,
        )
    }

    fn invoke_info(&mut self, dex_pc: u32, method_idx: u32) -> Option<InvokeInfo> {
        let image_classes = read_lock!(self.driver.image_classes);
        let ctx = SharpeningContext {
            options: &self.driver.options,
            image_classes: image_classes.as_ref(),
        };
        let runtime = &self.driver.runtime;
        let resolved =
            resolve_method_shared(runtime, self.unit.dex_file, method_idx, InvokeType::Virtual);
        sharpen_invoke(
            &ctx,
            &read_lock!(runtime),
            self.unit,
            dex_pc,
            method_idx,
            InvokeType::Virtual,
            resolved,
            None,
            false,
            &mut self.scratch,
        )
    }
}

fn is_compilable(verified: &VerifiedMethod) -> bool {
    !verified.has_runtime_throw()
        && !verified
            .failures()
            .intersects(VerifyFailures::LOCKING | VerifyFailures::FORCE_INTERPRETER)
}

fn dex_to_dex_level(class_status: Option<ClassStatus>) -> DexToDexCompilationLevel {
    match class_status {
        None => DexToDexCompilationLevel::DontCompile,
        Some(ClassStatus::Error) => DexToDexCompilationLevel::DontCompile,
        Some(status) if status >= ClassStatus::Verified => DexToDexCompilationLevel::Optimize,
        Some(_) => DexToDexCompilationLevel::Required,
    }
}

fn attempt_init(
    runtime: &mut Runtime,
    class: ClassId,
    can_init_statics: bool,
    can_init_parents: bool,
    descriptor: &str,
) -> Option<InitOutcome> {
    match runtime.ensure_initialized(class, can_init_statics, can_init_parents) {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            log::debug!("Initialization of {descriptor} failed: {e}");
            None
        }
    }
}

fn pretty_method(dex: &DexFile, method_idx: u32) -> String {
    let Ok(method) = dex.method_id(method_idx) else {
        return format!("<method {method_idx}>");
    };
    let class = dex.type_descriptor(method.class_idx).unwrap_or("<unknown>");
    format!("{class}->{}", method.name)
}

/// Catch handler types of loaded classes that are not in their file's dex cache yet.
fn unresolved_exception_types(linker: &ClassLinker) -> BTreeSet<(DexFileId, u32)> {
    let mut types = BTreeSet::new();
    for (_, class) in linker.classes() {
        let (Some(dex_file), Some(class_def_idx)) = (class.dex_file(), class.class_def_idx()) else {
            continue;
        };
        let Ok(class_def) = linker.dex_file(dex_file).class_def(class_def_idx) else {
            continue;
        };
        let dex_cache = linker.dex_cache(dex_file);
        let handlers = class_def
            .methods()
            .filter_map(|method| method.code.as_ref())
            .flat_map(|code| code.tries.iter())
            .flat_map(|try_item| try_item.handlers.iter())
            .filter_map(|handler| handler.type_idx);
        for type_idx in handlers {
            if dex_cache.resolved_type(type_idx).is_none() {
                types.insert((dex_file, type_idx));
            }
        }
    }
    types
}

fn class_of_mirror(heap: &Heap, mirror: crate::runtime::ObjectId) -> Option<ClassId> {
    match heap.get(mirror)?.kind() {
        ObjectKind::Class(class) => Some(*class),
        _ => None,
    }
}

fn add_with_supertypes(linker: &ClassLinker, image_classes: &mut BTreeSet<String>, class: ClassId) {
    let mut pending = vec![class];
    while let Some(class) = pending.pop() {
        let class = linker.class(class);
        if !image_classes.insert(class.descriptor().to_string()) {
            continue;
        }
        pending.extend(class.super_class());
        pending.extend(class.interfaces().iter().copied());
        pending.extend(class.component_type());
    }
}
