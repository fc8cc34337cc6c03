//! Class loading, linking and symbolic resolution.
//!
//! The [`ClassLinker`] owns every registered bytecode file, its [`DexCache`], and the table of
//! loaded classes. Classes are defined lazily on the first [`ClassLinker::find_class`] for their
//! descriptor: the superclass chain and interfaces are loaded first, then fields are laid out,
//! methods are collected into the vtable, and the interface method table is built.
//!
//! # Bootstrap
//!
//! `java.lang.Class` is the class of every class mirror, including its own. The linker breaks
//! the cycle by allocating the mirror of `java.lang.Class` before anything else and pointing it
//! at itself; the primitive classes and the first core classes are then defined against that
//! placeholder. Dex cache objects and vtable arrays need `DexCache` and `long[]` respectively, so
//! they are created for the early classes once those two classes exist.
//!
//! # Resolution
//!
//! The `resolve_*` operations map constant pool indices of one file to runtime entities and
//! memoize the result in that file's dex cache. Failures are returned as resolution errors
//! (see [`crate::Error::is_resolution_failure`]) and are never cached.

use std::{collections::BTreeMap, sync::Arc};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::{
    dex::{descriptor_to_name, AccessFlags, DexFile, DexFileId, EncodedField, EncodedMethod},
    runtime::{
        class::{
            ArtField, ArtFieldId, ArtMethod, ArtMethodId, Class, ClassId, ClassStatus,
            ConflictTableId, DexCacheArrayKind, ImtConflictTable, InvokeType, NativePtr,
            RuntimeMethod, CLASS_ACCESS_FLAGS_OFFSET, CLASS_CLASS_SIZE_OFFSET,
            CLASS_COMPONENT_TYPE_OFFSET, CLASS_DEX_CACHE_OFFSET, CLASS_FIELDS_START,
            CLASS_IFIELDS_OFFSET, CLASS_IMT_OFFSET, CLASS_LOADER_CLASS_TABLE_OFFSET,
            CLASS_LOADER_OFFSET, CLASS_METHODS_OFFSET, CLASS_NAME_OFFSET, CLASS_NATIVE_OFFSETS,
            CLASS_OBJECT_SIZE_OFFSET, CLASS_REFERENCE_OFFSETS, CLASS_SFIELDS_OFFSET,
            CLASS_STATUS_OFFSET, CLASS_SUPER_CLASS_OFFSET, CLASS_VTABLE_OFFSET,
            DEX_CACHE_DEX_FILE_OFFSET, DEX_CACHE_LOCATION_OFFSET,
            DEX_CACHE_NUM_RESOLVED_TYPES_OFFSET, DEX_CACHE_RESOLVED_FIELDS_OFFSET,
            DEX_CACHE_RESOLVED_METHODS_OFFSET, DEX_CACHE_RESOLVED_TYPES_OFFSET, DEX_CACHE_SIZE,
            DEX_CACHE_STRINGS_OFFSET, EXECUTABLE_ART_METHOD_OFFSET,
            EXECUTABLE_DECLARING_CLASS_OFFSET, IMT_SIZE,
        },
        core,
        heap::{
            Heap, HeapObject, ObjectId, ObjectKind, Value, HEAP_REFERENCE_SIZE,
            OBJECT_HEADER_SIZE, REFERENCE_REFERENT_OFFSET,
        },
        intern::InternTable,
    },
    utils::{align_up, to_u32},
    Error::{ClassNotFound, IncompatibleClassChange, NoSuchField, NoSuchMethod},
    Result,
};

/// Per-file cache of resolved constant pool entries.
///
/// Empty method slots stand for the resolution trampoline once written into an image.
#[derive(Debug, Clone)]
pub struct DexCache {
    pub(crate) dex_file: DexFileId,
    pub(crate) object: Option<ObjectId>,
    pub(crate) class_loader: Option<ObjectId>,
    pub(crate) resolved_types: Vec<Option<ClassId>>,
    pub(crate) resolved_methods: Vec<Option<ArtMethodId>>,
    pub(crate) resolved_fields: Vec<Option<ArtFieldId>>,
    pub(crate) strings: Vec<Option<ObjectId>>,
}

impl DexCache {
    fn new(dex_file: DexFileId, dex: &DexFile, class_loader: Option<ObjectId>) -> Self {
        DexCache {
            dex_file,
            object: None,
            class_loader,
            resolved_types: vec![None; dex.num_types()],
            resolved_methods: vec![None; dex.num_methods()],
            resolved_fields: vec![None; dex.num_fields()],
            strings: vec![None; dex.num_strings()],
        }
    }

    /// The file this cache belongs to.
    #[must_use]
    pub fn dex_file(&self) -> DexFileId {
        self.dex_file
    }

    /// The managed `DexCache` object, absent only while bootstrapping.
    #[must_use]
    pub fn object(&self) -> Option<ObjectId> {
        self.object
    }

    /// Loader the file was registered with, `None` for the boot class path.
    #[must_use]
    pub fn class_loader(&self) -> Option<ObjectId> {
        self.class_loader
    }

    /// Cached class of a type index.
    #[must_use]
    pub fn resolved_type(&self, type_idx: u32) -> Option<ClassId> {
        self.resolved_types.get(type_idx as usize).copied().flatten()
    }

    /// Cached method of a method index.
    #[must_use]
    pub fn resolved_method(&self, method_idx: u32) -> Option<ArtMethodId> {
        self.resolved_methods.get(method_idx as usize).copied().flatten()
    }

    /// Cached field of a field index.
    #[must_use]
    pub fn resolved_field(&self, field_idx: u32) -> Option<ArtFieldId> {
        self.resolved_fields.get(field_idx as usize).copied().flatten()
    }

    /// Cached string of a string index.
    #[must_use]
    pub fn resolved_string(&self, string_idx: u32) -> Option<ObjectId> {
        self.strings.get(string_idx as usize).copied().flatten()
    }

    /// All type slots.
    #[must_use]
    pub fn resolved_types(&self) -> &[Option<ClassId>] {
        &self.resolved_types
    }

    /// All method slots.
    #[must_use]
    pub fn resolved_methods(&self) -> &[Option<ArtMethodId>] {
        &self.resolved_methods
    }

    /// All field slots.
    #[must_use]
    pub fn resolved_fields(&self) -> &[Option<ArtFieldId>] {
        &self.resolved_fields
    }

    /// All string slots.
    #[must_use]
    pub fn strings(&self) -> &[Option<ObjectId>] {
        &self.strings
    }

    /// Number of elements of one backing array.
    #[must_use]
    pub fn array_len(&self, kind: DexCacheArrayKind) -> usize {
        match kind {
            DexCacheArrayKind::Types => self.resolved_types.len(),
            DexCacheArrayKind::Methods => self.resolved_methods.len(),
            DexCacheArrayKind::Fields => self.resolved_fields.len(),
            DexCacheArrayKind::Strings => self.strings.len(),
        }
    }
}

#[derive(Debug, Clone)]
struct LoaderInfo {
    object: ObjectId,
    dex_files: Vec<DexFileId>,
}

/// Loads, links and resolves classes.
pub struct ClassLinker {
    dex_files: Vec<Arc<DexFile>>,
    dex_loaders: Vec<Option<ObjectId>>,
    dex_caches: Vec<DexCache>,
    boot_class_path: Vec<DexFileId>,
    loaders: Vec<LoaderInfo>,
    classes: Vec<Option<Class>>,
    class_tables: FxHashMap<Option<ObjectId>, BTreeMap<String, ClassId>>,
    conflict_tables: Vec<ImtConflictTable>,
    intern_table: InternTable,
    class_class_mirror: ObjectId,
    bootstrap_class_mirror: Option<ObjectId>,
    loading: FxHashSet<(Option<ObjectId>, String)>,
}

impl ClassLinker {
    /// Bootstraps the class hierarchy from `boot_class_path`, which must define the core
    /// library classes (see [`core::core_library`]).
    ///
    /// # Arguments
    /// * `heap` - Heap receiving the class mirrors and dex cache objects
    /// * `boot_class_path` - Files of the boot class path, in lookup order
    ///
    /// # Errors
    /// Returns an error if one of the bootstrap classes is missing or cannot be linked.
    pub fn new(heap: &mut Heap, boot_class_path: Vec<DexFile>) -> Result<Self> {
        let class_class_mirror = ObjectId(to_u32(heap.capacity())?);
        let placeholder = heap.allocate(HeapObject::new(
            class_class_mirror,
            ObjectKind::Instance,
            CLASS_FIELDS_START,
            &CLASS_REFERENCE_OFFSETS,
            &CLASS_NATIVE_OFFSETS,
        ));
        debug_assert_eq!(placeholder, class_class_mirror);

        let mut linker = ClassLinker {
            dex_files: Vec::new(),
            dex_loaders: Vec::new(),
            dex_caches: Vec::new(),
            boot_class_path: Vec::new(),
            loaders: Vec::new(),
            classes: Vec::new(),
            class_tables: FxHashMap::default(),
            conflict_tables: Vec::new(),
            intern_table: InternTable::new(),
            class_class_mirror,
            bootstrap_class_mirror: Some(placeholder),
            loading: FxHashSet::default(),
        };

        for dex in boot_class_path {
            linker.register_dex_file(heap, dex, None)?;
        }
        for descriptor in core::PRIMITIVES {
            linker.create_primitive_class(heap, descriptor)?;
        }
        for descriptor in core::BOOTSTRAP_CLASSES {
            linker.find_class(heap, descriptor, None)?;
        }
        if linker.bootstrap_class_mirror.is_some() {
            return Err(malformed_error!("Boot class path does not define {}", core::CLASS));
        }
        linker.find_class(heap, core::LONG_ARRAY, None)?;
        linker.find_class(heap, core::OBJECT_ARRAY, None)?;

        for idx in 0..linker.dex_caches.len() {
            if linker.dex_caches[idx].object.is_none() {
                linker.create_dex_cache_object(heap, DexFileId(to_u32(idx)?))?;
            }
        }
        let ids: Vec<ClassId> = linker.classes().map(|(id, _)| id).collect();
        for id in ids {
            linker.sync_mirror(heap, id);
            linker.attach_vtable_object(heap, id);
        }

        log::debug!(
            "Bootstrapped {} classes from {} boot dex files",
            linker.classes.len(),
            linker.boot_class_path.len()
        );
        Ok(linker)
    }

    /// Registers a bytecode file with `loader` (`None` for the boot class path).
    ///
    /// Registering a file with the same location and checksum twice returns the existing
    /// handle.
    ///
    /// # Errors
    /// Returns an error if the dex cache object cannot be allocated.
    pub fn register_dex_file(
        &mut self,
        heap: &mut Heap,
        dex: DexFile,
        loader: Option<ObjectId>,
    ) -> Result<DexFileId> {
        if let Some(pos) = self.dex_files.iter().zip(&self.dex_loaders).position(|(d, l)| {
            *l == loader && d.location() == dex.location() && d.checksum() == dex.checksum()
        }) {
            return Ok(DexFileId(to_u32(pos)?));
        }

        let id = DexFileId(to_u32(self.dex_files.len())?);
        self.dex_caches.push(DexCache::new(id, &dex, loader));
        self.dex_files.push(Arc::new(dex));
        self.dex_loaders.push(loader);
        match loader {
            None => self.boot_class_path.push(id),
            Some(object) => match self.loaders.iter_mut().find(|l| l.object == object) {
                Some(info) => info.dex_files.push(id),
                None => self.loaders.push(LoaderInfo {
                    object,
                    dex_files: vec![id],
                }),
            },
        }
        if self.lookup_class(core::DEX_CACHE, None).is_some() {
            self.create_dex_cache_object(heap, id)?;
        }
        Ok(id)
    }

    /// Creates a `PathClassLoader` and registers `dex_files` with it.
    ///
    /// # Errors
    /// Returns an error if the loader class cannot be instantiated.
    pub fn create_class_loader(
        &mut self,
        heap: &mut Heap,
        dex_files: Vec<DexFile>,
    ) -> Result<(ObjectId, Vec<DexFileId>)> {
        let loader_class = self.find_class(heap, core::PATH_CLASS_LOADER, None)?;
        let loader = self.alloc_object(heap, loader_class)?;
        self.loaders.push(LoaderInfo {
            object: loader,
            dex_files: Vec::new(),
        });
        let ids = dex_files
            .into_iter()
            .map(|dex| self.register_dex_file(heap, dex, Some(loader)))
            .collect::<Result<Vec<_>>>()?;
        Ok((loader, ids))
    }

    fn create_dex_cache_object(&mut self, heap: &mut Heap, dex_file: DexFileId) -> Result<()> {
        let dex_cache_class = self
            .lookup_class(core::DEX_CACHE, None)
            .ok_or_else(|| ClassNotFound(core::DEX_CACHE.to_string()))?;
        let location = self.dex_files[dex_file.index()].location().to_string();
        let (location, _) = self.intern(heap, &location)?;

        let mut object = HeapObject::new(
            self.class(dex_cache_class).mirror,
            ObjectKind::DexCache(dex_file),
            DEX_CACHE_SIZE,
            &[DEX_CACHE_LOCATION_OFFSET],
            &[
                DEX_CACHE_DEX_FILE_OFFSET,
                DEX_CACHE_RESOLVED_TYPES_OFFSET,
                DEX_CACHE_RESOLVED_METHODS_OFFSET,
                DEX_CACHE_RESOLVED_FIELDS_OFFSET,
                DEX_CACHE_STRINGS_OFFSET,
            ],
        );
        object.set_reference(DEX_CACHE_LOCATION_OFFSET, Some(location));

        let cache = &self.dex_caches[dex_file.index()];
        let arrays = [
            (DEX_CACHE_RESOLVED_TYPES_OFFSET, DexCacheArrayKind::Types),
            (DEX_CACHE_RESOLVED_METHODS_OFFSET, DexCacheArrayKind::Methods),
            (DEX_CACHE_RESOLVED_FIELDS_OFFSET, DexCacheArrayKind::Fields),
            (DEX_CACHE_STRINGS_OFFSET, DexCacheArrayKind::Strings),
        ];
        for (slot, (offset, kind)) in arrays.into_iter().enumerate() {
            let len = cache.array_len(kind);
            if len > 0 {
                object.set_native(offset, NativePtr::DexCacheArray(dex_file, kind));
            }
            object.write_u32(
                DEX_CACHE_NUM_RESOLVED_TYPES_OFFSET + 4 * to_u32(slot)?,
                to_u32(len)?,
            );
        }

        let object = heap.allocate(object);
        self.dex_caches[dex_file.index()].object = Some(object);
        Ok(())
    }

    fn create_primitive_class(&mut self, heap: &mut Heap, descriptor: &str) -> Result<ClassId> {
        let id = ClassId(to_u32(self.classes.len())?);
        let mirror = heap.allocate(HeapObject::new(
            self.class_class_mirror,
            ObjectKind::Class(id),
            CLASS_FIELDS_START,
            &CLASS_REFERENCE_OFFSETS,
            &CLASS_NATIVE_OFFSETS,
        ));
        self.classes.push(Some(Class {
            descriptor: descriptor.to_string(),
            mirror,
            access_flags: AccessFlags::PUBLIC | AccessFlags::FINAL | AccessFlags::ABSTRACT,
            status: ClassStatus::Initialized,
            super_class: None,
            interfaces: Vec::new(),
            iftable: Vec::new(),
            component_type: None,
            dex_file: None,
            class_def_idx: None,
            class_loader: None,
            instance_fields: Vec::new(),
            static_fields: Vec::new(),
            methods: Vec::new(),
            num_direct_methods: 0,
            vtable: Vec::new(),
            imt: None,
            object_size: 0,
            reference_offsets: Vec::new(),
            class_size: CLASS_FIELDS_START,
        }));
        self.insert_class(descriptor, None, id);
        self.sync_mirror(heap, id);
        Ok(id)
    }

    /// Finds the class `descriptor` as seen from `loader`, loading and linking it on first use.
    ///
    /// The boot class path is searched before the loader's own files.
    ///
    /// # Errors
    /// Returns [`crate::Error::ClassNotFound`] if no file defines the class, or any error raised
    /// while linking it or its supertypes.
    pub fn find_class(
        &mut self,
        heap: &mut Heap,
        descriptor: &str,
        loader: Option<ObjectId>,
    ) -> Result<ClassId> {
        if let Some(id) = self.lookup_class(descriptor, loader) {
            return Ok(id);
        }
        if let Some(component) = descriptor.strip_prefix('[') {
            let component = self.find_class(heap, component, loader)?;
            return self.create_array_class(heap, descriptor, component);
        }

        let Some((dex_file, class_def_idx)) = self.find_class_def(descriptor, loader) else {
            return Err(ClassNotFound(descriptor.to_string()));
        };
        let defining_loader = self.dex_loaders[dex_file.index()];
        let key = (defining_loader, descriptor.to_string());
        if !self.loading.insert(key.clone()) {
            return Err(IncompatibleClassChange(format!(
                "Class circularity detected for {descriptor}"
            )));
        }
        let result = self.define_class(heap, dex_file, class_def_idx, defining_loader);
        self.loading.remove(&key);
        result
    }

    fn find_class_def(&self, descriptor: &str, loader: Option<ObjectId>) -> Option<(DexFileId, u32)> {
        let loader_files = loader
            .and_then(|l| self.loaders.iter().find(|info| info.object == l))
            .map(|info| info.dex_files.as_slice())
            .unwrap_or_default();
        self.boot_class_path
            .iter()
            .chain(loader_files)
            .find_map(|&id| {
                self.dex_files[id.index()]
                    .find_class_def_idx(descriptor)
                    .map(|idx| (id, idx))
            })
    }

    /// Resolves the class defined by a class definition of `dex_file`.
    ///
    /// The returned class may come from another file when the boot class path shadows the
    /// definition.
    ///
    /// # Errors
    /// Same conditions as [`ClassLinker::find_class`].
    pub fn resolve_class_def(
        &mut self,
        heap: &mut Heap,
        dex_file: DexFileId,
        class_def_idx: u32,
    ) -> Result<ClassId> {
        let dex = Arc::clone(&self.dex_files[dex_file.index()]);
        let descriptor = dex.class_descriptor(dex.class_def(class_def_idx)?)?;
        self.find_class(heap, descriptor, self.dex_loaders[dex_file.index()])
    }

    /// Class of a class definition of `dex_file` if it is already loaded. Never loads.
    #[must_use]
    pub fn lookup_class_def(&self, dex_file: DexFileId, class_def_idx: u32) -> Option<ClassId> {
        let dex = &self.dex_files[dex_file.index()];
        let descriptor = dex.class_descriptor(dex.class_def(class_def_idx).ok()?).ok()?;
        self.lookup_class(descriptor, self.dex_loaders[dex_file.index()])
    }

    /// Cached field of a field index, checked against the kind of access. `None` while the
    /// index has not been resolved.
    #[must_use]
    pub fn lookup_resolved_field(
        &self,
        dex_file: DexFileId,
        field_idx: u32,
        is_static: bool,
    ) -> Option<Result<ArtFieldId>> {
        let id = self.dex_caches[dex_file.index()].resolved_field(field_idx)?;
        if id.is_static != is_static {
            return Some(Err(IncompatibleClassChange(self.describe_field(id))));
        }
        Some(Ok(id))
    }

    /// Cached method of a method index, checked against `invoke_type`. `None` while the index
    /// has not been resolved.
    #[must_use]
    pub fn lookup_resolved_method(
        &self,
        dex_file: DexFileId,
        method_idx: u32,
        invoke_type: InvokeType,
    ) -> Option<Result<ArtMethodId>> {
        let id = self.dex_caches[dex_file.index()].resolved_method(method_idx)?;
        Some(self.check_invoke_type(id, invoke_type).map(|()| id))
    }

    fn create_array_class(
        &mut self,
        heap: &mut Heap,
        descriptor: &str,
        component: ClassId,
    ) -> Result<ClassId> {
        let loader = self.class(component).class_loader;
        if let Some(id) = self.lookup_class(descriptor, loader) {
            return Ok(id);
        }
        let object = self
            .lookup_class(core::OBJECT, None)
            .ok_or_else(|| ClassNotFound(core::OBJECT.to_string()))?;
        let vtable = self.class(object).vtable.clone();

        let id = ClassId(to_u32(self.classes.len())?);
        let mirror = heap.allocate(HeapObject::new(
            self.class_class_mirror,
            ObjectKind::Class(id),
            CLASS_FIELDS_START,
            &CLASS_REFERENCE_OFFSETS,
            &CLASS_NATIVE_OFFSETS,
        ));
        self.classes.push(Some(Class {
            descriptor: descriptor.to_string(),
            mirror,
            access_flags: AccessFlags::PUBLIC | AccessFlags::FINAL | AccessFlags::ABSTRACT,
            status: ClassStatus::Initialized,
            super_class: Some(object),
            interfaces: Vec::new(),
            iftable: Vec::new(),
            component_type: Some(component),
            dex_file: None,
            class_def_idx: None,
            class_loader: loader,
            instance_fields: Vec::new(),
            static_fields: Vec::new(),
            methods: Vec::new(),
            num_direct_methods: 0,
            vtable,
            imt: None,
            object_size: 0,
            reference_offsets: Vec::new(),
            class_size: CLASS_FIELDS_START,
        }));
        self.insert_class(descriptor, loader, id);
        self.sync_mirror(heap, id);
        self.attach_vtable_object(heap, id);
        Ok(id)
    }

    #[allow(clippy::too_many_lines)]
    fn define_class(
        &mut self,
        heap: &mut Heap,
        dex_file: DexFileId,
        class_def_idx: u32,
        loader: Option<ObjectId>,
    ) -> Result<ClassId> {
        let dex = Arc::clone(&self.dex_files[dex_file.index()]);
        let def = dex.class_def(class_def_idx)?;
        let descriptor = dex.class_descriptor(def)?.to_string();
        let is_interface = def.access_flags.contains(AccessFlags::INTERFACE);

        let super_class = match def.superclass_idx {
            Some(type_idx) => {
                let super_descriptor = dex.type_descriptor(type_idx)?;
                let super_class = self.find_class(heap, super_descriptor, loader)?;
                let sup = self.class(super_class);
                if sup.is_interface() {
                    return Err(IncompatibleClassChange(format!(
                        "{descriptor} has interface {super_descriptor} as superclass"
                    )));
                }
                if sup.is_final() {
                    return Err(IncompatibleClassChange(format!(
                        "{descriptor} cannot inherit from final class {super_descriptor}"
                    )));
                }
                Some(super_class)
            }
            None if descriptor == core::OBJECT => None,
            None => return Err(malformed_error!("{} has no superclass", descriptor)),
        };

        let mut interfaces = Vec::with_capacity(def.interfaces.len());
        for &type_idx in &def.interfaces {
            let interface_descriptor = dex.type_descriptor(type_idx)?;
            let interface = self.find_class(heap, interface_descriptor, loader)?;
            if !self.class(interface).is_interface() {
                return Err(IncompatibleClassChange(format!(
                    "{descriptor} implements non-interface {interface_descriptor}"
                )));
            }
            interfaces.push(interface);
        }

        let id = ClassId(to_u32(self.classes.len())?);

        let mut instance_fields = def
            .instance_fields
            .iter()
            .map(|f| make_field(&dex, id, f))
            .collect::<Result<Vec<_>>>()?;
        let mut static_fields = def
            .static_fields
            .iter()
            .map(|f| make_field(&dex, id, f))
            .collect::<Result<Vec<_>>>()?;

        let (object_size, reference_offsets) = if descriptor == core::CLASS {
            (CLASS_FIELDS_START, CLASS_REFERENCE_OFFSETS.to_vec())
        } else {
            let (start, mut inherited) = match super_class {
                Some(s) => {
                    let sup = self.class(s);
                    (sup.object_size, sup.reference_offsets.clone())
                }
                None => (OBJECT_HEADER_SIZE, Vec::new()),
            };
            let start = if descriptor == core::REFERENCE {
                start.max(REFERENCE_REFERENT_OFFSET + HEAP_REFERENCE_SIZE)
            } else {
                start
            };
            let (end, own) = layout_fields(&mut instance_fields, start);
            inherited.extend(own);
            (end, inherited)
        };
        let (class_size, static_reference_offsets) =
            layout_fields(&mut static_fields, CLASS_FIELDS_START);

        let mut methods = Vec::with_capacity(def.direct_methods.len() + def.virtual_methods.len());
        for (position, encoded) in def.methods().enumerate() {
            methods.push(make_method(&dex, id, encoded, position)?);
        }
        let num_direct_methods = to_u32(def.direct_methods.len())?;

        let vtable = if is_interface {
            for (position, method) in methods
                .iter_mut()
                .skip(num_direct_methods as usize)
                .enumerate()
            {
                method.method_index = u16::try_from(position)
                    .map_err(|_| malformed_error!("Too many methods in {}", descriptor))?;
            }
            Vec::new()
        } else {
            self.build_vtable(&descriptor, id, super_class, &mut methods, num_direct_methods)?
        };

        let mut iftable = super_class
            .map(|s| self.class(s).iftable.clone())
            .unwrap_or_default();
        for &interface in &interfaces {
            for &inherited in &self.class(interface).iftable {
                if !iftable.contains(&inherited) {
                    iftable.push(inherited);
                }
            }
            if !iftable.contains(&interface) {
                iftable.push(interface);
            }
        }

        let imt = if is_interface {
            None
        } else {
            self.build_imt(&iftable, &vtable, &methods, id)
        };

        let mirror = if descriptor == core::CLASS {
            match self.bootstrap_class_mirror.take() {
                Some(mirror) => {
                    heap.object_mut(mirror).kind = ObjectKind::Class(id);
                    mirror
                }
                None => return Err(malformed_error!("{} defined twice", descriptor)),
            }
        } else {
            let mut refs = CLASS_REFERENCE_OFFSETS.to_vec();
            refs.extend(&static_reference_offsets);
            heap.allocate(HeapObject::new(
                self.class_class_mirror,
                ObjectKind::Class(id),
                class_size,
                &refs,
                &CLASS_NATIVE_OFFSETS,
            ))
        };

        self.classes.push(Some(Class {
            descriptor: descriptor.clone(),
            mirror,
            access_flags: def.access_flags,
            status: ClassStatus::Resolved,
            super_class,
            interfaces,
            iftable,
            component_type: None,
            dex_file: Some(dex_file),
            class_def_idx: Some(class_def_idx),
            class_loader: loader,
            instance_fields,
            static_fields,
            methods,
            num_direct_methods,
            vtable,
            imt,
            object_size,
            reference_offsets,
            class_size,
        }));
        self.insert_class(&descriptor, loader, id);
        self.sync_mirror(heap, id);
        self.attach_vtable_object(heap, id);

        log::trace!("Linked {descriptor} as {id:?}");
        Ok(id)
    }

    fn build_vtable(
        &self,
        descriptor: &str,
        id: ClassId,
        super_class: Option<ClassId>,
        methods: &mut [ArtMethod],
        num_direct_methods: u32,
    ) -> Result<Vec<ArtMethodId>> {
        let mut vtable = super_class
            .map(|s| self.class(s).vtable.clone())
            .unwrap_or_default();
        for (index, method) in methods.iter_mut().enumerate().skip(num_direct_methods as usize) {
            let method_id = ArtMethodId {
                class: id,
                index: to_u32(index)?,
            };
            let overridden = vtable.iter().position(|&slot| {
                // Own methods have unique signatures and are not linked yet.
                if slot.class == id {
                    return false;
                }
                let candidate = self.method(slot);
                !candidate.is_private()
                    && candidate.name == method.name
                    && candidate.shorty == method.shorty
            });
            let slot = match overridden {
                Some(slot) => {
                    if self.method(vtable[slot]).is_final() {
                        return Err(IncompatibleClassChange(format!(
                            "{descriptor}.{} overrides final method",
                            method.name
                        )));
                    }
                    vtable[slot] = method_id;
                    slot
                }
                None => {
                    vtable.push(method_id);
                    vtable.len() - 1
                }
            };
            method.method_index = u16::try_from(slot)
                .map_err(|_| malformed_error!("Vtable of {} is too large", descriptor))?;
        }
        Ok(vtable)
    }

    fn build_imt(
        &mut self,
        iftable: &[ClassId],
        vtable: &[ArtMethodId],
        own_methods: &[ArtMethod],
        id: ClassId,
    ) -> Option<Vec<NativePtr>> {
        let mut slots: Vec<Vec<(ArtMethodId, ArtMethodId)>> = vec![Vec::new(); IMT_SIZE];
        for &interface in iftable {
            let iface = self.class(interface);
            for (index, method) in iface
                .methods
                .iter()
                .enumerate()
                .skip(iface.num_direct_methods as usize)
            {
                let implementation = vtable.iter().copied().find(|&v| {
                    let candidate = if v.class == id {
                        &own_methods[v.index as usize]
                    } else {
                        self.method(v)
                    };
                    candidate.name == method.name && candidate.shorty == method.shorty
                });
                let (Some(implementation), Ok(index)) = (implementation, u32::try_from(index))
                else {
                    continue;
                };
                let interface_method = ArtMethodId {
                    class: interface,
                    index,
                };
                slots[method.dex_method_idx as usize % IMT_SIZE]
                    .push((interface_method, implementation));
            }
        }
        if slots.iter().all(Vec::is_empty) {
            return None;
        }

        let mut imt = Vec::with_capacity(IMT_SIZE);
        for entries in slots {
            let entry = match entries.len() {
                0 => NativePtr::RuntimeMethod(RuntimeMethod::ImtUnimplemented),
                1 => NativePtr::Method(entries[0].1),
                _ => {
                    let table = u32::try_from(self.conflict_tables.len()).ok()?;
                    self.conflict_tables.push(ImtConflictTable { entries });
                    NativePtr::ImtConflictTable(ConflictTableId(table))
                }
            };
            imt.push(entry);
        }
        Some(imt)
    }

    fn insert_class(&mut self, descriptor: &str, loader: Option<ObjectId>, id: ClassId) {
        self.class_tables
            .entry(loader)
            .or_default()
            .insert(descriptor.to_string(), id);
    }

    /// Rewrites the mirror of `id` from the native class state.
    pub(crate) fn sync_mirror(&self, heap: &mut Heap, id: ClassId) {
        let class = self.class(id);
        let super_mirror = class.super_class.map(|s| self.class(s).mirror);
        let component_mirror = class.component_type.map(|c| self.class(c).mirror);
        let dex_cache = class
            .dex_file
            .and_then(|d| self.dex_caches[d.index()].object);

        let mirror = heap.object_mut(class.mirror);
        mirror.set_reference(CLASS_SUPER_CLASS_OFFSET, super_mirror);
        mirror.set_reference(CLASS_DEX_CACHE_OFFSET, dex_cache);
        mirror.set_reference(CLASS_LOADER_OFFSET, class.class_loader);
        mirror.set_reference(CLASS_COMPONENT_TYPE_OFFSET, component_mirror);

        let native = |present: bool, ptr: NativePtr| if present { ptr } else { NativePtr::Null };
        mirror.set_native(
            CLASS_IFIELDS_OFFSET,
            native(!class.instance_fields.is_empty(), NativePtr::InstanceFieldArray(id)),
        );
        mirror.set_native(
            CLASS_SFIELDS_OFFSET,
            native(!class.static_fields.is_empty(), NativePtr::StaticFieldArray(id)),
        );
        mirror.set_native(
            CLASS_METHODS_OFFSET,
            native(!class.methods.is_empty(), NativePtr::MethodArray(id)),
        );
        mirror.set_native(CLASS_IMT_OFFSET, native(class.imt.is_some(), NativePtr::Imt(id)));

        mirror.write_u32(CLASS_ACCESS_FLAGS_OFFSET, class.access_flags.bits());
        mirror.write_bytes(CLASS_STATUS_OFFSET, &class.status.as_raw().to_le_bytes());
        mirror.write_u32(CLASS_OBJECT_SIZE_OFFSET, class.object_size);
        mirror.write_u32(CLASS_CLASS_SIZE_OFFSET, class.class_size);
    }

    fn attach_vtable_object(&self, heap: &mut Heap, id: ClassId) {
        let class = self.class(id);
        if class.is_interface() || class.is_primitive() || class.vtable.is_empty() {
            return;
        }
        let Some(long_array) = self.lookup_class(core::LONG_ARRAY, None) else {
            return;
        };
        if heap.object(class.mirror).reference(CLASS_VTABLE_OFFSET).is_some() {
            return;
        }
        let elements: Vec<NativePtr> = class.vtable.iter().map(|&m| NativePtr::Method(m)).collect();
        let vtable = heap.allocate(HeapObject::new_pointer_array(
            self.class(long_array).mirror,
            &elements,
        ));
        heap.object_mut(class.mirror)
            .set_reference(CLASS_VTABLE_OFFSET, Some(vtable));
    }

    /// Looks up an already loaded class without loading it. The boot table is consulted before
    /// the table of `loader`.
    #[must_use]
    pub fn lookup_class(&self, descriptor: &str, loader: Option<ObjectId>) -> Option<ClassId> {
        let boot = self
            .class_tables
            .get(&None)
            .and_then(|table| table.get(descriptor));
        if boot.is_some() || loader.is_none() {
            return boot.copied();
        }
        self.class_tables
            .get(&loader)
            .and_then(|table| table.get(descriptor))
            .copied()
    }

    /// Returns the class `id`.
    ///
    /// # Panics
    /// Panics if the class was removed from the linker.
    #[must_use]
    pub fn class(&self, id: ClassId) -> &Class {
        match self.get_class(id) {
            Some(class) => class,
            None => panic!("class {id:?} was removed"),
        }
    }

    /// Returns the class `id` if it is still loaded.
    #[must_use]
    pub fn get_class(&self, id: ClassId) -> Option<&Class> {
        self.classes.get(id.index()).and_then(Option::as_ref)
    }

    fn class_mut(&mut self, id: ClassId) -> &mut Class {
        match self.classes.get_mut(id.index()).and_then(Option::as_mut) {
            Some(class) => class,
            None => panic!("class {id:?} was removed"),
        }
    }

    /// Returns the method record `id`.
    #[must_use]
    pub fn method(&self, id: ArtMethodId) -> &ArtMethod {
        &self.class(id.class).methods[id.index as usize]
    }

    /// Returns the field record `id`.
    #[must_use]
    pub fn field(&self, id: ArtFieldId) -> &ArtField {
        let class = self.class(id.class);
        if id.is_static {
            &class.static_fields[id.index as usize]
        } else {
            &class.instance_fields[id.index as usize]
        }
    }

    /// Iterates all loaded classes in definition order.
    pub fn classes(&self) -> impl Iterator<Item = (ClassId, &Class)> {
        self.classes.iter().enumerate().filter_map(|(idx, class)| {
            let id = ClassId(u32::try_from(idx).ok()?);
            class.as_ref().map(|c| (id, c))
        })
    }

    /// Number of class slots handed out so far, removed classes included.
    #[must_use]
    pub fn num_class_slots(&self) -> usize {
        self.classes.len()
    }

    /// The class table of `loader`, ordered by descriptor.
    #[must_use]
    pub fn class_table(&self, loader: Option<ObjectId>) -> Option<&BTreeMap<String, ClassId>> {
        self.class_tables.get(&loader)
    }

    /// All registered files.
    #[must_use]
    pub fn dex_files(&self) -> &[Arc<DexFile>] {
        &self.dex_files
    }

    /// The registered file `id`.
    #[must_use]
    pub fn dex_file(&self, id: DexFileId) -> &Arc<DexFile> {
        &self.dex_files[id.index()]
    }

    /// Loader `id` was registered with.
    #[must_use]
    pub fn dex_file_loader(&self, id: DexFileId) -> Option<ObjectId> {
        self.dex_loaders[id.index()]
    }

    /// Files on the boot class path.
    #[must_use]
    pub fn boot_class_path(&self) -> &[DexFileId] {
        &self.boot_class_path
    }

    /// Files registered with `loader`.
    #[must_use]
    pub fn loader_dex_files(&self, loader: ObjectId) -> &[DexFileId] {
        self.loaders
            .iter()
            .find(|info| info.object == loader)
            .map(|info| info.dex_files.as_slice())
            .unwrap_or_default()
    }

    /// Managed class loader objects.
    pub fn class_loaders(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.loaders.iter().map(|info| info.object)
    }

    /// All dex caches, indexed by file.
    #[must_use]
    pub fn dex_caches(&self) -> &[DexCache] {
        &self.dex_caches
    }

    /// The dex cache of `id`.
    #[must_use]
    pub fn dex_cache(&self, id: DexFileId) -> &DexCache {
        &self.dex_caches[id.index()]
    }

    /// Mutable access to the dex cache of `id`.
    pub fn dex_cache_mut(&mut self, id: DexFileId) -> &mut DexCache {
        &mut self.dex_caches[id.index()]
    }

    /// The conflict table `id`.
    #[must_use]
    pub fn conflict_table(&self, id: ConflictTableId) -> &ImtConflictTable {
        &self.conflict_tables[id.0 as usize]
    }

    /// The intern table.
    #[must_use]
    pub fn intern_table(&self) -> &InternTable {
        &self.intern_table
    }

    /// Mutable access to the intern table.
    pub fn intern_table_mut(&mut self) -> &mut InternTable {
        &mut self.intern_table
    }

    /// Interns `value`. The boolean is `true` if a new string object was allocated.
    ///
    /// # Errors
    /// Returns [`crate::Error::ClassNotFound`] before `java.lang.String` is loaded.
    pub fn intern(&mut self, heap: &mut Heap, value: &str) -> Result<(ObjectId, bool)> {
        let string_class = self
            .lookup_class(core::STRING, None)
            .ok_or_else(|| ClassNotFound(core::STRING.to_string()))?;
        let string_mirror = self.class(string_class).mirror;
        Ok(self.intern_table.intern(heap, string_mirror, value))
    }

    /// Mirror of `java.lang.Class`.
    #[must_use]
    pub fn class_class_mirror(&self) -> ObjectId {
        self.class_class_mirror
    }

    /// Removes `id` from the loaded classes. Its mirror stays in the heap until collected.
    pub fn remove_class(&mut self, id: ClassId) -> Option<Class> {
        let class = self.classes.get_mut(id.index())?.take()?;
        if let Some(table) = self.class_tables.get_mut(&class.class_loader) {
            if table.get(&class.descriptor) == Some(&id) {
                table.remove(&class.descriptor);
            }
        }
        Some(class)
    }

    /// Updates the status of `id` in the class and in its mirror.
    pub fn set_class_status(&mut self, heap: &mut Heap, id: ClassId, status: ClassStatus) {
        let class = self.class_mut(id);
        class.status = status;
        let mirror = class.mirror;
        heap.object_mut(mirror)
            .write_bytes(CLASS_STATUS_OFFSET, &status.as_raw().to_le_bytes());
    }

    /// Interns the dotted name of `id` and stores it in the mirror's name slot.
    ///
    /// # Errors
    /// Returns an error if the name cannot be interned.
    pub fn compute_name(&mut self, heap: &mut Heap, id: ClassId) -> Result<ObjectId> {
        let name = descriptor_to_name(&self.class(id).descriptor);
        let (name, _) = self.intern(heap, &name)?;
        let mirror = self.class(id).mirror;
        heap.object_mut(mirror).set_reference(CLASS_NAME_OFFSET, Some(name));
        Ok(name)
    }

    /// Resolves a type index of `dex_file`.
    ///
    /// # Errors
    /// Returns the error raised while loading the class.
    pub fn resolve_type(
        &mut self,
        heap: &mut Heap,
        dex_file: DexFileId,
        type_idx: u32,
    ) -> Result<ClassId> {
        if let Some(id) = self.dex_caches[dex_file.index()].resolved_type(type_idx) {
            return Ok(id);
        }
        let dex = Arc::clone(&self.dex_files[dex_file.index()]);
        let descriptor = dex.type_descriptor(type_idx)?;
        let id = self.find_class(heap, descriptor, self.dex_loaders[dex_file.index()])?;
        self.dex_caches[dex_file.index()].resolved_types[type_idx as usize] = Some(id);
        Ok(id)
    }

    /// Resolves a string index of `dex_file` to its interned string.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] for an invalid index.
    pub fn resolve_string(
        &mut self,
        heap: &mut Heap,
        dex_file: DexFileId,
        string_idx: u32,
    ) -> Result<ObjectId> {
        if let Some(id) = self.dex_caches[dex_file.index()].resolved_string(string_idx) {
            return Ok(id);
        }
        let dex = Arc::clone(&self.dex_files[dex_file.index()]);
        let (id, _) = self.intern(heap, dex.string(string_idx)?)?;
        self.dex_caches[dex_file.index()].strings[string_idx as usize] = Some(id);
        Ok(id)
    }

    /// Resolves a field index of `dex_file`.
    ///
    /// Instance fields are searched along the superclass chain; static fields in the class, its
    /// interfaces and then its superclass.
    ///
    /// # Errors
    /// Returns [`crate::Error::IncompatibleClassChange`] if only a field of the other kind
    /// matches, or [`crate::Error::NoSuchField`] if none does.
    pub fn resolve_field(
        &mut self,
        heap: &mut Heap,
        dex_file: DexFileId,
        field_idx: u32,
        is_static: bool,
    ) -> Result<ArtFieldId> {
        if let Some(cached) = self.lookup_resolved_field(dex_file, field_idx, is_static) {
            return cached;
        }
        let dex = Arc::clone(&self.dex_files[dex_file.index()]);
        let field_id = dex.field_id(field_idx)?;
        let class = self.resolve_type(heap, dex_file, field_id.class_idx)?;
        let type_descriptor = dex.type_descriptor(field_id.type_idx)?;

        let lookup = |linker: &Self, is_static: bool| {
            if is_static {
                linker.find_static_field(class, &field_id.name, type_descriptor)
            } else {
                linker.find_instance_field(class, &field_id.name, type_descriptor)
            }
        };
        match lookup(&*self, is_static) {
            Some(id) => {
                self.dex_caches[dex_file.index()].resolved_fields[field_idx as usize] = Some(id);
                Ok(id)
            }
            None => {
                let description = format!(
                    "{}.{}:{}",
                    self.class(class).descriptor,
                    field_id.name,
                    type_descriptor
                );
                if lookup(&*self, !is_static).is_some() {
                    Err(IncompatibleClassChange(format!(
                        "Expected {} field {description}",
                        if is_static { "static" } else { "instance" }
                    )))
                } else {
                    Err(NoSuchField(description))
                }
            }
        }
    }

    fn describe_field(&self, id: ArtFieldId) -> String {
        let field = self.field(id);
        format!(
            "{}.{}:{}",
            self.class(id.class).descriptor,
            field.name,
            field.type_descriptor
        )
    }

    fn find_declared_field(
        &self,
        class: ClassId,
        name: &str,
        type_descriptor: &str,
        is_static: bool,
    ) -> Option<ArtFieldId> {
        let c = self.class(class);
        let fields = if is_static {
            &c.static_fields
        } else {
            &c.instance_fields
        };
        let index = fields
            .iter()
            .position(|f| f.name == name && f.type_descriptor == type_descriptor)?;
        Some(ArtFieldId {
            class,
            is_static,
            index: u32::try_from(index).ok()?,
        })
    }

    /// Finds an instance field in `class` or its superclasses.
    #[must_use]
    pub fn find_instance_field(
        &self,
        class: ClassId,
        name: &str,
        type_descriptor: &str,
    ) -> Option<ArtFieldId> {
        let mut current = Some(class);
        while let Some(c) = current {
            if let Some(field) = self.find_declared_field(c, name, type_descriptor, false) {
                return Some(field);
            }
            current = self.class(c).super_class;
        }
        None
    }

    /// Finds a static field in `class`, its interfaces or its superclasses.
    #[must_use]
    pub fn find_static_field(
        &self,
        class: ClassId,
        name: &str,
        type_descriptor: &str,
    ) -> Option<ArtFieldId> {
        let mut current = Some(class);
        while let Some(c) = current {
            if let Some(field) = self.find_declared_field(c, name, type_descriptor, true) {
                return Some(field);
            }
            let found = self
                .class(c)
                .iftable
                .iter()
                .find_map(|&i| self.find_declared_field(i, name, type_descriptor, true));
            if found.is_some() {
                return found;
            }
            current = self.class(c).super_class;
        }
        None
    }

    /// Finds a method declared by `class` itself.
    #[must_use]
    pub fn find_declared_method(
        &self,
        class: ClassId,
        name: &str,
        shorty: &str,
    ) -> Option<ArtMethodId> {
        let index = self
            .class(class)
            .methods
            .iter()
            .position(|m| m.name == name && m.shorty == shorty)?;
        Some(ArtMethodId {
            class,
            index: u32::try_from(index).ok()?,
        })
    }

    /// Finds a method in `class`, its superclasses and then its interfaces.
    #[must_use]
    pub fn find_class_method(
        &self,
        class: ClassId,
        name: &str,
        shorty: &str,
    ) -> Option<ArtMethodId> {
        let mut current = Some(class);
        while let Some(c) = current {
            if let Some(method) = self.find_declared_method(c, name, shorty) {
                return Some(method);
            }
            current = self.class(c).super_class;
        }
        self.class(class)
            .iftable
            .iter()
            .find_map(|&i| self.find_declared_method(i, name, shorty))
    }

    /// Finds a method of interface `class`, falling back to the public methods of
    /// `java.lang.Object`.
    #[must_use]
    pub fn find_interface_method(
        &self,
        class: ClassId,
        name: &str,
        shorty: &str,
    ) -> Option<ArtMethodId> {
        if let Some(method) = self.find_declared_method(class, name, shorty) {
            return Some(method);
        }
        let inherited = self
            .class(class)
            .iftable
            .iter()
            .find_map(|&i| self.find_declared_method(i, name, shorty));
        if inherited.is_some() {
            return inherited;
        }
        let object = self.lookup_class(core::OBJECT, None)?;
        self.find_declared_method(object, name, shorty)
            .filter(|&m| {
                let method = self.method(m);
                method.access_flags.contains(AccessFlags::PUBLIC) && !method.is_static()
            })
    }

    /// Resolves a method index of `dex_file` for an invocation of kind `invoke_type`.
    ///
    /// # Errors
    /// Returns [`crate::Error::IncompatibleClassChange`] if the method does not fit the
    /// invocation kind, or [`crate::Error::NoSuchMethod`] if nothing matches.
    pub fn resolve_method(
        &mut self,
        heap: &mut Heap,
        dex_file: DexFileId,
        method_idx: u32,
        invoke_type: InvokeType,
    ) -> Result<ArtMethodId> {
        if let Some(cached) = self.lookup_resolved_method(dex_file, method_idx, invoke_type) {
            return cached;
        }
        let dex = Arc::clone(&self.dex_files[dex_file.index()]);
        let method_id = dex.method_id(method_idx)?;
        let class = self.resolve_type(heap, dex_file, method_id.class_idx)?;
        let is_interface = self.class(class).is_interface();
        let description = format!(
            "{}.{}{}",
            self.class(class).descriptor,
            method_id.name,
            method_id.shorty
        );

        let resolved = match invoke_type {
            InvokeType::Interface => {
                if !is_interface {
                    return Err(IncompatibleClassChange(format!(
                        "Found class, expected interface: {description}"
                    )));
                }
                self.find_interface_method(class, &method_id.name, &method_id.shorty)
            }
            InvokeType::Direct | InvokeType::Virtual | InvokeType::Super if is_interface => {
                return Err(IncompatibleClassChange(format!(
                    "Found interface, expected class: {description}"
                )));
            }
            _ => self.find_class_method(class, &method_id.name, &method_id.shorty),
        };
        let Some(resolved) = resolved else {
            return Err(NoSuchMethod(description));
        };
        self.check_invoke_type(resolved, invoke_type)?;
        self.dex_caches[dex_file.index()].resolved_methods[method_idx as usize] = Some(resolved);
        Ok(resolved)
    }

    fn check_invoke_type(&self, id: ArtMethodId, invoke_type: InvokeType) -> Result<()> {
        let method = self.method(id);
        let declaring = self.class(id.class);
        let incompatible = match invoke_type {
            InvokeType::Static => !method.is_static(),
            InvokeType::Direct => !method.is_direct() || method.is_static(),
            InvokeType::Virtual | InvokeType::Super => method.is_direct(),
            InvokeType::Interface => {
                method.is_direct()
                    || !(declaring.is_interface() || declaring.descriptor == core::OBJECT)
            }
        };
        if incompatible {
            return Err(IncompatibleClassChange(format!(
                "{}.{}{} cannot be invoked as {invoke_type:?}",
                declaring.descriptor, method.name, method.shorty
            )));
        }
        Ok(())
    }

    /// Returns the implementation `class` dispatches `method` to, if any.
    #[must_use]
    pub fn find_virtual_implementation(
        &self,
        class: ClassId,
        method: ArtMethodId,
    ) -> Option<ArtMethodId> {
        let target = self.method(method);
        if target.is_direct() {
            return Some(method);
        }
        let c = self.class(class);
        if self.class(method.class).is_interface() {
            return c.vtable.iter().copied().find(|&v| {
                let candidate = self.method(v);
                candidate.name == target.name && candidate.shorty == target.shorty
            });
        }
        c.vtable.get(usize::from(target.method_index)).copied()
    }

    /// Returns `true` if `class` is `ancestor` or one of its subclasses.
    #[must_use]
    pub fn is_subclass(&self, class: ClassId, ancestor: ClassId) -> bool {
        let mut current = Some(class);
        while let Some(c) = current {
            if c == ancestor {
                return true;
            }
            current = self.class(c).super_class;
        }
        false
    }

    /// Returns `true` if a value of class `src` can be stored in a variable of class `dst`.
    #[must_use]
    pub fn is_assignable(&self, dst: ClassId, src: ClassId) -> bool {
        if dst == src {
            return true;
        }
        let d = self.class(dst);
        let s = self.class(src);
        if d.is_primitive() || s.is_primitive() {
            return false;
        }
        if d.descriptor == core::OBJECT {
            return true;
        }
        if d.is_interface() {
            return s.iftable.contains(&dst);
        }
        match (d.component_type, s.component_type) {
            (Some(dc), Some(sc)) => {
                if self.class(dc).is_primitive() || self.class(sc).is_primitive() {
                    dc == sc
                } else {
                    self.is_assignable(dc, sc)
                }
            }
            (Some(_), None) | (None, Some(_)) => false,
            (None, None) => self.is_subclass(src, dst),
        }
    }

    /// Returns `true` if code in `accessor` may access `target`.
    #[must_use]
    pub fn can_access_class(&self, accessor: ClassId, target: ClassId) -> bool {
        let mut target = target;
        while let Some(component) = self.class(target).component_type {
            target = component;
        }
        let t = self.class(target);
        t.is_primitive()
            || t.access_flags.contains(AccessFlags::PUBLIC)
            || self.in_same_package(accessor, target)
    }

    /// Returns `true` if code in `accessor` may access a member of `declaring` with `flags`.
    #[must_use]
    pub fn can_access_member(
        &self,
        accessor: ClassId,
        declaring: ClassId,
        flags: AccessFlags,
    ) -> bool {
        if flags.contains(AccessFlags::PUBLIC) || accessor == declaring {
            return true;
        }
        if flags.contains(AccessFlags::PRIVATE) {
            return false;
        }
        if self.in_same_package(accessor, declaring) {
            return true;
        }
        flags.contains(AccessFlags::PROTECTED) && self.is_subclass(accessor, declaring)
    }

    fn in_same_package(&self, a: ClassId, b: ClassId) -> bool {
        let a = self.class(a);
        let b = self.class(b);
        a.class_loader == b.class_loader && a.package() == b.package()
    }

    fn instance_kind(&self, class: ClassId) -> ObjectKind {
        let mut current = Some(class);
        while let Some(c) = current {
            match self.class(c).descriptor.as_str() {
                core::REFERENCE => return ObjectKind::Reference(None),
                core::CLASS_LOADER => return ObjectKind::ClassLoader,
                core::EXECUTABLE => return ObjectKind::Executable,
                _ => current = self.class(c).super_class,
            }
        }
        ObjectKind::Instance
    }

    /// Allocates a zeroed instance of `class`.
    ///
    /// # Errors
    /// Returns [`crate::Error::IncompatibleClassChange`] for abstract classes, interfaces,
    /// arrays, primitives, strings and classes.
    pub fn alloc_object(&self, heap: &mut Heap, class: ClassId) -> Result<ObjectId> {
        let c = self.class(class);
        if !c.is_instantiable() || c.descriptor == core::STRING || c.descriptor == core::CLASS {
            return Err(IncompatibleClassChange(format!(
                "Cannot instantiate {}",
                c.descriptor
            )));
        }
        let kind = self.instance_kind(class);
        let natives: &[u32] = match kind {
            ObjectKind::Executable => &[EXECUTABLE_ART_METHOD_OFFSET],
            ObjectKind::ClassLoader => &[CLASS_LOADER_CLASS_TABLE_OFFSET],
            _ => &[],
        };
        Ok(heap.allocate(HeapObject::new(
            c.mirror,
            kind,
            c.object_size,
            &c.reference_offsets,
            natives,
        )))
    }

    /// Allocates an array of `component` references holding `elements`.
    ///
    /// # Errors
    /// Returns an error if the array class cannot be created.
    pub fn alloc_object_array(
        &mut self,
        heap: &mut Heap,
        component: ClassId,
        elements: &[Option<ObjectId>],
    ) -> Result<ObjectId> {
        let descriptor = format!("[{}", self.class(component).descriptor);
        let loader = self.class(component).class_loader;
        let array_class = self.find_class(heap, &descriptor, loader)?;
        let mirror = self.class(array_class).mirror;
        Ok(heap.allocate(HeapObject::new_object_array(mirror, elements)))
    }

    /// Creates the reflective `Method` or `Constructor` object of `method`.
    ///
    /// # Errors
    /// Returns an error if the reflection classes are not available.
    pub fn create_executable(&mut self, heap: &mut Heap, method: ArtMethodId) -> Result<ObjectId> {
        let descriptor = if self.method(method).is_constructor() {
            core::CONSTRUCTOR
        } else {
            core::METHOD
        };
        let class = self.find_class(heap, descriptor, None)?;
        let object = self.alloc_object(heap, class)?;
        let access_flags = self
            .find_instance_field(class, "accessFlags", "I")
            .map(|f| self.field(f).offset);

        let declaring_mirror = self.class(method.class).mirror;
        let flags = self.method(method).access_flags.bits();
        let executable = heap.object_mut(object);
        executable.set_reference(EXECUTABLE_DECLARING_CLASS_OFFSET, Some(declaring_mirror));
        executable.set_native(EXECUTABLE_ART_METHOD_OFFSET, NativePtr::Method(method));
        if let Some(offset) = access_flags {
            executable.set_field(offset, 4, Value::Primitive(u64::from(flags)));
        }
        Ok(object)
    }

    /// GC roots held by the linker: class mirrors, dex cache objects, class loaders and
    /// interned strings.
    #[must_use]
    pub fn roots(&self) -> Vec<ObjectId> {
        let mut roots: Vec<ObjectId> = self.classes().map(|(_, c)| c.mirror).collect();
        roots.push(self.class_class_mirror);
        roots.extend(self.dex_caches.iter().filter_map(|c| c.object));
        roots.extend(self.class_loaders());
        roots.extend_from_slice(self.intern_table.strings());
        roots
    }
}

impl std::fmt::Debug for ClassLinker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassLinker")
            .field("dex_files", &self.dex_files.len())
            .field("classes", &self.classes.len())
            .field("loaders", &self.loaders.len())
            .finish_non_exhaustive()
    }
}

fn make_field(dex: &DexFile, class: ClassId, encoded: &EncodedField) -> Result<ArtField> {
    let field_id = dex.field_id(encoded.field_idx)?;
    Ok(ArtField {
        declaring_class: class,
        dex_field_idx: encoded.field_idx,
        access_flags: encoded.access_flags,
        name: field_id.name.clone(),
        type_descriptor: dex.type_descriptor(field_id.type_idx)?.to_string(),
        offset: 0,
    })
}

fn make_method(
    dex: &DexFile,
    class: ClassId,
    encoded: &EncodedMethod,
    position: usize,
) -> Result<ArtMethod> {
    let method_id = dex.method_id(encoded.method_idx)?;
    Ok(ArtMethod {
        declaring_class: class,
        dex_method_idx: encoded.method_idx,
        access_flags: encoded.access_flags,
        name: method_id.name.clone(),
        shorty: method_id.shorty.clone(),
        method_index: u16::try_from(position)
            .map_err(|_| malformed_error!("Too many methods declared by one class"))?,
        has_code: encoded.code.is_some(),
    })
}

/// Assigns offsets to `fields` starting at `start`: references first, then primitives by
/// decreasing size, each naturally aligned. Returns the end offset and the reference offsets.
#[allow(clippy::cast_possible_truncation)]
fn layout_fields(fields: &mut [ArtField], start: u32) -> (u32, Vec<u32>) {
    let mut order: Vec<usize> = (0..fields.len()).collect();
    order.sort_by_key(|&i| {
        let field = &fields[i];
        if field.is_reference() {
            0
        } else {
            16 - field.size()
        }
    });

    let mut offset = start;
    let mut references = Vec::new();
    for i in order {
        let size = (fields[i].size() as u32).max(1);
        offset = align_up(offset as usize, size as usize) as u32;
        fields[i].offset = offset;
        if fields[i].is_reference() {
            references.push(offset);
        }
        offset += size;
    }
    (offset, references)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dex::{CodeBuilder, DexFileBuilder},
        runtime::core::core_library,
    };

    fn boot() -> (Heap, ClassLinker) {
        let mut heap = Heap::new();
        let linker = ClassLinker::new(&mut heap, vec![core_library()]).unwrap();
        (heap, linker)
    }

    fn native() -> AccessFlags {
        AccessFlags::PUBLIC | AccessFlags::NATIVE
    }

    #[test]
    fn test_bootstrap_layouts() {
        let (heap, linker) = boot();
        let object = linker.lookup_class(core::OBJECT, None).unwrap();
        let string = linker.lookup_class(core::STRING, None).unwrap();
        let dex_cache = linker.lookup_class(core::DEX_CACHE, None).unwrap();
        let class = linker.lookup_class(core::CLASS, None).unwrap();

        assert_eq!(linker.class(object).object_size(), 8);
        assert_eq!(linker.class(string).object_size(), 16);
        assert_eq!(linker.class(dex_cache).object_size(), DEX_CACHE_SIZE);
        assert_eq!(linker.class(dex_cache).reference_offsets(), &[DEX_CACHE_LOCATION_OFFSET]);

        let class_mirror = linker.class(class).mirror();
        assert_eq!(class_mirror, linker.class_class_mirror());
        assert_eq!(heap.object(class_mirror).class(), class_mirror);
        assert_eq!(heap.object(class_mirror).kind(), &ObjectKind::Class(class));
    }

    #[test]
    fn test_bootstrap_patches_dex_cache_and_vtable() {
        let (heap, linker) = boot();
        let object = linker.lookup_class(core::OBJECT, None).unwrap();
        let mirror = heap.object(linker.class(object).mirror());
        let dex_cache = linker.dex_cache(DexFileId(0)).object().unwrap();

        assert_eq!(mirror.reference(CLASS_DEX_CACHE_OFFSET), Some(dex_cache));
        let vtable = mirror.reference(CLASS_VTABLE_OFFSET).unwrap();
        assert_eq!(heap.object(vtable).kind(), &ObjectKind::PointerArray);
        assert_eq!(heap.object(dex_cache).kind(), &ObjectKind::DexCache(DexFileId(0)));
    }

    #[test]
    fn test_primitives_are_initialized() {
        let (_, linker) = boot();
        let int = linker.lookup_class("I", None).unwrap();
        assert!(linker.class(int).is_primitive());
        assert!(linker.class(int).is_initialized());
        let long_array = linker.lookup_class(core::LONG_ARRAY, None).unwrap();
        assert_eq!(linker.class(long_array).component_type(), Some(ClassId(5)));
    }

    #[test]
    fn test_vtable_override_reuses_slot() {
        let (mut heap, mut linker) = boot();
        let mut dex = DexFileBuilder::new("app.dex");
        dex.class("LBase;")
            .superclass(core::OBJECT)
            .virtual_method("run", "V", native(), None)
            .finish();
        dex.class("LDerived;")
            .superclass("LBase;")
            .virtual_method("toString", "L", native(), None)
            .virtual_method("run", "V", native(), None)
            .virtual_method("extra", "V", native(), None)
            .finish();
        linker.register_dex_file(&mut heap, dex.build(), None).unwrap();

        let base = linker.find_class(&mut heap, "LBase;", None).unwrap();
        let derived = linker.find_class(&mut heap, "LDerived;", None).unwrap();
        let base_vtable = linker.class(base).vtable().to_vec();
        let derived_vtable = linker.class(derived).vtable();

        assert_eq!(derived_vtable.len(), base_vtable.len() + 1);
        let run = linker.find_declared_method(derived, "run", "V").unwrap();
        let slot = usize::from(linker.method(run).method_index());
        assert_eq!(derived_vtable[slot], run);
        assert_eq!(base_vtable[slot].class, base);
    }

    #[test]
    fn test_new_virtuals_get_fresh_slots_next_to_overrides() {
        let (mut heap, mut linker) = boot();
        let mut dex = DexFileBuilder::new("app.dex");
        dex.class("LShape;")
            .superclass(core::OBJECT)
            .virtual_method("area", "I", native(), None)
            .virtual_method("perimeter", "I", native(), None)
            .virtual_method("scale", "VI", native(), None)
            .finish();
        dex.class("LSquare;")
            .superclass("LShape;")
            .virtual_method("area", "I", native(), None)
            .virtual_method("side", "I", native(), None)
            .virtual_method("diagonal", "I", native(), None)
            .finish();
        linker.register_dex_file(&mut heap, dex.build(), None).unwrap();

        let shape = linker.find_class(&mut heap, "LShape;", None).unwrap();
        let square = linker.find_class(&mut heap, "LSquare;", None).unwrap();
        let object = linker.lookup_class(core::OBJECT, None).unwrap();
        let inherited = linker.class(object).vtable().len();
        let shape_vtable = linker.class(shape).vtable().to_vec();
        let square_vtable = linker.class(square).vtable();
        assert_eq!(shape_vtable.len(), inherited + 3);
        assert_eq!(square_vtable.len(), inherited + 5);

        let area = linker.find_declared_method(square, "area", "I").unwrap();
        let side = linker.find_declared_method(square, "side", "I").unwrap();
        let diagonal = linker.find_declared_method(square, "diagonal", "I").unwrap();
        assert_eq!(usize::from(linker.method(area).method_index()), inherited);
        assert_eq!(usize::from(linker.method(side).method_index()), inherited + 3);
        assert_eq!(usize::from(linker.method(diagonal).method_index()), inherited + 4);
        assert_eq!(square_vtable[inherited + 1], shape_vtable[inherited + 1]);
    }

    #[test]
    fn test_overriding_final_method_is_rejected() {
        let (mut heap, mut linker) = boot();
        let mut dex = DexFileBuilder::new("app.dex");
        dex.class("LBase;")
            .superclass(core::OBJECT)
            .virtual_method("run", "V", native() | AccessFlags::FINAL, None)
            .finish();
        dex.class("LDerived;")
            .superclass("LBase;")
            .virtual_method("run", "V", native(), None)
            .finish();
        linker.register_dex_file(&mut heap, dex.build(), None).unwrap();

        let err = linker.find_class(&mut heap, "LDerived;", None).unwrap_err();
        assert!(matches!(err, IncompatibleClassChange(_)));
    }

    #[test]
    fn test_instance_field_layout_orders_references_first() {
        let (mut heap, mut linker) = boot();
        let mut dex = DexFileBuilder::new("app.dex");
        dex.class("LFields;")
            .superclass(core::OBJECT)
            .instance_field("b", "B", AccessFlags::PUBLIC)
            .instance_field("l", "J", AccessFlags::PUBLIC)
            .instance_field("o", core::OBJECT, AccessFlags::PUBLIC)
            .static_field("s", core::STRING, AccessFlags::PUBLIC)
            .finish();
        linker.register_dex_file(&mut heap, dex.build(), None).unwrap();
        let id = linker.find_class(&mut heap, "LFields;", None).unwrap();
        let class = linker.class(id);

        let offset = |name: &str| {
            class
                .instance_fields()
                .iter()
                .find(|f| f.name() == name)
                .unwrap()
                .offset()
        };
        assert_eq!(offset("o"), 8);
        assert_eq!(offset("l"), 16);
        assert_eq!(offset("b"), 24);
        assert_eq!(class.object_size(), 25);
        assert_eq!(class.reference_offsets(), &[8]);
        assert_eq!(class.static_fields()[0].offset(), CLASS_FIELDS_START);
        assert!(heap
            .object(class.mirror())
            .is_reference_slot(CLASS_FIELDS_START));
    }

    #[test]
    fn test_imt_single_and_conflict_slots() {
        let (mut heap, mut linker) = boot();
        let mut dex = DexFileBuilder::new("app.dex");
        let abstract_method = AccessFlags::PUBLIC | AccessFlags::ABSTRACT;
        let mut iface = dex
            .class("LIface;")
            .access_flags(AccessFlags::PUBLIC | AccessFlags::INTERFACE | AccessFlags::ABSTRACT)
            .superclass(core::OBJECT);
        for i in 0..=IMT_SIZE {
            iface = iface.virtual_method(&format!("m{i}"), "V", abstract_method, None);
        }
        iface.finish();
        let mut implementation = dex
            .class("LImpl;")
            .superclass(core::OBJECT)
            .interface("LIface;");
        for i in 0..=IMT_SIZE {
            implementation = implementation.virtual_method(&format!("m{i}"), "V", native(), None);
        }
        implementation.finish();
        linker.register_dex_file(&mut heap, dex.build(), None).unwrap();

        let id = linker.find_class(&mut heap, "LImpl;", None).unwrap();
        let imt = linker.class(id).imt().unwrap();
        assert_eq!(imt.len(), IMT_SIZE);
        let NativePtr::ImtConflictTable(table) = imt[0] else {
            panic!("expected a conflict table, got {:?}", imt[0]);
        };
        assert_eq!(linker.conflict_table(table).entries().len(), 2);
        let m1 = linker.find_declared_method(id, "m1", "V").unwrap();
        assert_eq!(imt[1], NativePtr::Method(m1));
    }

    #[test]
    fn test_class_circularity_is_detected() {
        let (mut heap, mut linker) = boot();
        let mut dex = DexFileBuilder::new("app.dex");
        dex.class("LA;").superclass("LB;").finish();
        dex.class("LB;").superclass("LA;").finish();
        linker.register_dex_file(&mut heap, dex.build(), None).unwrap();

        let err = linker.find_class(&mut heap, "LA;", None).unwrap_err();
        assert!(matches!(err, IncompatibleClassChange(ref m) if m.contains("circularity")));
        assert!(linker.lookup_class("LA;", None).is_none());
    }

    #[test]
    fn test_resolve_field_kind_mismatch() {
        let (mut heap, mut linker) = boot();
        let mut dex = DexFileBuilder::new("app.dex");
        dex.class("LHolder;")
            .superclass(core::OBJECT)
            .static_field("counter", "I", AccessFlags::PUBLIC)
            .finish();
        let missing = dex.field_id("LHolder;", "absent", "I");
        let dex = linker.register_dex_file(&mut heap, dex.build(), None).unwrap();
        let counter = linker
            .dex_file(dex)
            .find_field_idx("LHolder;", "counter")
            .unwrap();

        let field = linker.resolve_field(&mut heap, dex, counter, true).unwrap();
        assert!(field.is_static);
        assert_eq!(linker.dex_cache(dex).resolved_field(counter), Some(field));
        assert!(matches!(
            linker.resolve_field(&mut heap, dex, counter, false),
            Err(IncompatibleClassChange(_))
        ));
        assert!(matches!(
            linker.resolve_field(&mut heap, dex, missing, true),
            Err(NoSuchField(_))
        ));
    }

    #[test]
    fn test_resolve_method_checks_invoke_type() {
        let (mut heap, mut linker) = boot();
        let mut dex = DexFileBuilder::new("app.dex");
        dex.class("LCalls;")
            .superclass(core::OBJECT)
            .direct_method(
                "helper",
                "V",
                AccessFlags::STATIC,
                Some(CodeBuilder::new(0, 0).return_void().build()),
            )
            .finish();
        let to_string = dex.method_id("LCalls;", "toString", "L");
        let dex = linker.register_dex_file(&mut heap, dex.build(), None).unwrap();
        let helper = linker
            .dex_file(dex)
            .find_method_idx("LCalls;", "helper", "V")
            .unwrap();

        assert!(linker
            .resolve_method(&mut heap, dex, helper, InvokeType::Static)
            .is_ok());
        assert!(matches!(
            linker.resolve_method(&mut heap, dex, helper, InvokeType::Virtual),
            Err(IncompatibleClassChange(_))
        ));
        assert!(matches!(
            linker.resolve_method(&mut heap, dex, to_string, InvokeType::Interface),
            Err(IncompatibleClassChange(_))
        ));
        let inherited = linker
            .resolve_method(&mut heap, dex, to_string, InvokeType::Virtual)
            .unwrap();
        let object = linker.lookup_class(core::OBJECT, None).unwrap();
        assert_eq!(inherited.class, object);
    }

    #[test]
    fn test_is_assignable() {
        let (mut heap, mut linker) = boot();
        let object = linker.lookup_class(core::OBJECT, None).unwrap();
        let string = linker.lookup_class(core::STRING, None).unwrap();
        let comparable = linker.find_class(&mut heap, core::COMPARABLE, None).unwrap();
        let strings = linker.find_class(&mut heap, "[Ljava/lang/String;", None).unwrap();
        let objects = linker.lookup_class(core::OBJECT_ARRAY, None).unwrap();
        let longs = linker.lookup_class(core::LONG_ARRAY, None).unwrap();

        assert!(linker.is_assignable(object, string));
        assert!(linker.is_assignable(comparable, string));
        assert!(!linker.is_assignable(string, object));
        assert!(linker.is_assignable(objects, strings));
        assert!(!linker.is_assignable(objects, longs));
        assert!(linker.is_assignable(object, longs));
    }

    #[test]
    fn test_alloc_object_kinds() {
        let (mut heap, mut linker) = boot();
        let weak = linker.find_class(&mut heap, core::WEAK_REFERENCE, None).unwrap();
        let string = linker.lookup_class(core::STRING, None).unwrap();
        let reference = linker.alloc_object(&mut heap, weak).unwrap();

        assert_eq!(heap.object(reference).kind(), &ObjectKind::Reference(None));
        assert!(linker.alloc_object(&mut heap, string).is_err());
    }

    #[test]
    fn test_class_loader_isolation() {
        let (mut heap, mut linker) = boot();
        let mut dex = DexFileBuilder::new("app.dex");
        dex.class("LApp;").superclass(core::OBJECT).finish();
        let (loader, files) = linker
            .create_class_loader(&mut heap, vec![dex.build()])
            .unwrap();

        assert_eq!(files.len(), 1);
        assert_eq!(linker.dex_file_loader(files[0]), Some(loader));
        assert!(matches!(
            linker.find_class(&mut heap, "LApp;", None),
            Err(ClassNotFound(_))
        ));
        let app = linker.find_class(&mut heap, "LApp;", Some(loader)).unwrap();
        assert_eq!(linker.class(app).class_loader(), Some(loader));
        assert_eq!(heap.object(loader).kind(), &ObjectKind::ClassLoader);
    }

    #[test]
    fn test_remove_class_clears_table() {
        let (mut heap, mut linker) = boot();
        let runnable = linker.find_class(&mut heap, core::RUNNABLE, None).unwrap();
        assert!(linker.remove_class(runnable).is_some());
        assert!(linker.lookup_class(core::RUNNABLE, None).is_none());
        assert!(linker.get_class(runnable).is_none());
    }
}
