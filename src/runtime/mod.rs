//! Reference runtime the compiler and the image writer operate on.
//!
//! The compiler needs a live class hierarchy to resolve symbolic references, to verify bytecode
//! and to run static initializers; the image writer needs the resulting object graph. This
//! module provides both as a self-contained model:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Runtime                                                      │
//! │   ├─ Heap            arena of HeapObjects, mark-sweep GC     │
//! │   └─ ClassLinker     classes, dex caches, class loaders,     │
//! │        │             vtables, IMTs, intern table             │
//! │        ├─ verifier   structural verification + type facts    │
//! │        └─ interpreter transactional <clinit> execution       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`Runtime`] - Bundles the heap and the class linker
//! - [`ClassLinker`] - Loads, links and resolves classes
//! - [`Heap`] / [`HeapObject`] - Managed objects addressed by [`ObjectId`]
//! - [`Class`], [`ArtMethod`], [`ArtField`] - Native class metadata
//! - [`VerifiedMethod`] - Per-method verification facts
//! - [`Transaction`] - Undo log for static initialization
//!
//! # Thread Safety
//!
//! [`Runtime`] is `Send + Sync` but not internally synchronized. The compiler driver wraps it in
//! an `RwLock` that plays the role of the mutator lock.

pub mod class;
pub mod class_linker;
pub mod core;
pub mod heap;
pub mod intern;
pub mod interpreter;
pub mod verifier;

pub use class::{
    ArtField, ArtFieldId, ArtMethod, ArtMethodId, Class, ClassId, ClassStatus, ConflictTableId,
    DexCacheArrayKind, ImtConflictTable, InvokeType, NativePtr, RuntimeMethod,
};
pub use class_linker::{ClassLinker, DexCache};
pub use heap::{Heap, HeapObject, LockWord, ObjectId, ObjectKind, Value};
pub use intern::InternTable;
pub use interpreter::{ensure_initialized, ClinitInterpreter, InitOutcome, Transaction};
pub use verifier::{
    prepare_class, verify_class, verify_prepared_class, ClassVerification, PreparedClass,
    ResolvedReferences, VerifiedMethod, VerifyFailures,
};

use crate::{
    dex::{DexFile, DexFileId},
    Result,
};

/// The heap and class hierarchy of one compilation.
#[derive(Debug)]
pub struct Runtime {
    heap: Heap,
    class_linker: ClassLinker,
}

impl Runtime {
    /// Boots a runtime whose boot class path is the core library followed by `boot_class_path`.
    ///
    /// The bootstrap classes come up initialized; every other class starts unloaded.
    ///
    /// # Errors
    /// Returns an error if the core classes cannot be linked.
    pub fn new(boot_class_path: Vec<DexFile>) -> Result<Self> {
        let mut heap = Heap::new();
        let mut files = Vec::with_capacity(boot_class_path.len() + 1);
        files.push(core::core_library());
        files.extend(boot_class_path);
        let mut class_linker = ClassLinker::new(&mut heap, files)?;

        for descriptor in core::BOOTSTRAP_CLASSES {
            if let Some(class) = class_linker.lookup_class(descriptor, None) {
                class_linker.set_class_status(&mut heap, class, ClassStatus::Initialized);
            }
        }
        log::debug!(
            "Runtime booted: {} classes, {} bytes",
            class_linker.classes().count(),
            heap.bytes_allocated()
        );
        Ok(Runtime { heap, class_linker })
    }

    /// The heap.
    #[must_use]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// The heap, mutably.
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// The class linker.
    #[must_use]
    pub fn class_linker(&self) -> &ClassLinker {
        &self.class_linker
    }

    /// The class linker, mutably.
    pub fn class_linker_mut(&mut self) -> &mut ClassLinker {
        &mut self.class_linker
    }

    /// Borrows the class linker and the heap at the same time.
    pub fn parts_mut(&mut self) -> (&mut ClassLinker, &mut Heap) {
        (&mut self.class_linker, &mut self.heap)
    }

    /// Creates an application class loader over `dex_files`.
    ///
    /// # Errors
    /// Returns an error if the loader object cannot be created.
    pub fn create_class_loader(&mut self, dex_files: Vec<DexFile>) -> Result<(ObjectId, Vec<DexFileId>)> {
        self.class_linker.create_class_loader(&mut self.heap, dex_files)
    }

    /// Finds and links `descriptor` as seen from `loader`.
    ///
    /// # Errors
    /// See [`ClassLinker::find_class`].
    pub fn find_class(&mut self, descriptor: &str, loader: Option<ObjectId>) -> Result<ClassId> {
        self.class_linker.find_class(&mut self.heap, descriptor, loader)
    }

    /// Interns `value`.
    ///
    /// # Errors
    /// See [`ClassLinker::intern`].
    pub fn intern(&mut self, value: &str) -> Result<ObjectId> {
        Ok(self.class_linker.intern(&mut self.heap, value)?.0)
    }

    /// Verifies a class definition.
    pub fn verify_class(&mut self, dex_file: DexFileId, class_def_idx: u32) -> ClassVerification {
        verify_class(&mut self.class_linker, &mut self.heap, dex_file, class_def_idx)
    }

    /// Initializes `class`; see [`ensure_initialized`].
    ///
    /// # Errors
    /// Returns [`crate::Error::InitializationFailed`] if the initializer fails.
    pub fn ensure_initialized(
        &mut self,
        class: ClassId,
        can_init_statics: bool,
        can_init_parents: bool,
    ) -> Result<InitOutcome> {
        ensure_initialized(
            &mut self.class_linker,
            &mut self.heap,
            class,
            can_init_statics,
            can_init_parents,
        )
    }

    /// Declares every object allocated so far to be boot image resident. Used when an app image
    /// is layered on top of a boot image built in the same process.
    pub fn mark_boot_image_space(&mut self) {
        self.heap.mark_boot_image_space();
    }

    /// Returns `true` if `object` lives in the boot image.
    #[must_use]
    pub fn is_in_boot_image_space(&self, object: ObjectId) -> bool {
        self.heap.is_in_boot_image_space(object)
    }

    /// GC roots of the runtime.
    #[must_use]
    pub fn roots(&self) -> Vec<ObjectId> {
        self.class_linker.roots()
    }

    /// Runs a full collection and returns the number of freed objects.
    pub fn collect_garbage(&mut self) -> usize {
        let roots = self.roots();
        let freed = self.heap.collect_garbage(&roots);
        log::debug!("Collected {freed} objects, {} bytes live", self.heap.bytes_allocated());
        freed
    }
}
