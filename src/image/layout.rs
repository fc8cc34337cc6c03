//! Placement of objects and native structures.
//!
//! Every live object outside the boot image is given a [`BinSlot`] during an iterative mark
//! phase over an explicit work stack. Class mirrors drag their native structures along: field
//! and method arrays, the IMT and its conflict tables. Once every bin's size is known the bins
//! are laid out in order, and each bin slot is turned into a final image offset.

use strum::{EnumCount, IntoEnumIterator};

use crate::{
    dex::DexFileId,
    image::{
        bin::{Bin, BinSlot},
        header::{ImageSection, SectionRange},
        options::PAGE_SIZE,
        writer::{ImageWriter, NativeObjectRelocation, NativeObjectRelocationType},
    },
    runtime::{
        class::{
            ArtFieldId, ArtMethodId, Class, ClassId, ClassStatus, DexCacheArrayKind, NativePtr,
            RuntimeMethod, ART_FIELD_SIZE, ART_METHOD_SIZE, CLASS_VTABLE_OFFSET, IMT_SIZE,
            LENGTH_PREFIX_SIZE,
        },
        core,
        heap::{OBJECT_ALIGNMENT, POINTER_SIZE},
        ClassLinker, Heap, LockWord, ObjectId, ObjectKind, Runtime,
    },
    utils::{align_up, to_u32},
    Error, Result,
};

/// Size of the count and reserved words in front of the intern and class tables.
const TABLE_HEADER_SIZE: u32 = 8;
/// Size of one (hash, address) table entry.
const TABLE_ENTRY_SIZE: u32 = 8;

impl ImageWriter<'_> {
    /// Interns the name of every class that will be written, so that the names are part of the
    /// image instead of being created on first use.
    pub(super) fn compute_lazy_fields(&self, runtime: &mut Runtime) -> Result<()> {
        let (linker, heap) = runtime.parts_mut();
        let classes: Vec<ClassId> = linker
            .classes()
            .filter(|(_, class)| !heap.is_in_boot_image_space(class.mirror()))
            .map(|(id, _)| id)
            .collect();
        for id in classes {
            linker.compute_name(heap, id)?;
        }
        Ok(())
    }

    /// Assigns every object and native structure its place and fills in the section tables.
    pub(super) fn calculate_new_object_offsets(&mut self, runtime: &mut Runtime) -> Result<()> {
        self.create_image_roots(runtime)?;
        let runtime: &Runtime = runtime;
        self.prepare_dex_cache_array_slots(runtime.class_linker(), runtime.heap())?;

        let seeds = self.collect_seeds(runtime)?;
        let visited = self.assign_reachable(runtime, &seeds)?;
        log::debug!("Visited {visited} objects from {} seeds", seeds.len());

        if !self.options.compile_app_image {
            for method in RuntimeMethod::iter() {
                self.place_native(
                    NativePtr::RuntimeMethod(method),
                    0,
                    NativeObjectRelocationType::RuntimeMethod,
                    ART_METHOD_SIZE,
                );
            }
        }

        for info in &mut self.image_infos {
            info.assign_bin_offsets(Self::OBJECTS_BEGIN);
            info.image_end = info.bin_slot_offset(Bin::String) + info.bin_slot_size(Bin::String);
        }
        self.unbin_objects();
        self.layout_tables(runtime.class_linker(), runtime.heap())?;

        let mut begin = self.options.image_begin as usize;
        for info in &mut self.image_infos {
            info.image_begin = to_u32(begin)?;
            begin = align_up(begin + info.image_size as usize, PAGE_SIZE);
        }
        self.assign_oat_file_begins()
    }

    /// Allocates the roots array of every image: its dex caches, the bootstrap class mirrors
    /// and, for app images, the class loader.
    fn create_image_roots(&mut self, runtime: &mut Runtime) -> Result<()> {
        let (linker, heap) = runtime.parts_mut();
        let object = linker
            .lookup_class(core::OBJECT, None)
            .ok_or_else(|| Error::ClassNotFound(core::OBJECT.to_string()))?;
        let class_roots: Vec<Option<ObjectId>> = core::BOOTSTRAP_CLASSES
            .iter()
            .map(|descriptor| linker.lookup_class(descriptor, None).map(|c| linker.class(c).mirror()))
            .collect();

        for oat_index in 0..self.image_infos.len() {
            let dex_files: Vec<DexFileId> = self
                .options
                .dex_file_oat_index
                .iter()
                .filter(|(_, &index)| index == oat_index)
                .map(|(&dex_file, _)| dex_file)
                .collect();
            let dex_caches: Vec<Option<ObjectId>> = dex_files
                .iter()
                .map(|&dex_file| linker.dex_cache(dex_file).object())
                .collect();
            let class_loader = if self.options.compile_app_image {
                dex_files.first().and_then(|&d| linker.dex_file_loader(d))
            } else {
                None
            };

            let dex_caches = linker.alloc_object_array(heap, object, &dex_caches)?;
            let class_roots = linker.alloc_object_array(heap, object, &class_roots)?;
            let roots = linker.alloc_object_array(
                heap,
                object,
                &[Some(dex_caches), Some(class_roots), class_loader],
            )?;
            self.image_infos[oat_index].image_roots = Some(roots);
        }
        Ok(())
    }

    /// Reserves the arrays backing the dex caches of every image bytecode file.
    fn prepare_dex_cache_array_slots(&mut self, linker: &ClassLinker, heap: &Heap) -> Result<()> {
        let files: Vec<(DexFileId, usize)> = self
            .options
            .dex_file_oat_index
            .iter()
            .map(|(&d, &i)| (d, i))
            .collect();
        for (dex_file, oat_index) in files {
            let cache = linker.dex_cache(dex_file);
            if cache
                .object()
                .is_none_or(|object| heap.is_in_boot_image_space(object))
            {
                continue;
            }
            for kind in DexCacheArrayKind::iter() {
                let len = cache.array_len(kind);
                if len == 0 {
                    continue;
                }
                let size = align_up(len * kind.element_size() as usize, OBJECT_ALIGNMENT);
                self.place_native(
                    NativePtr::DexCacheArray(dex_file, kind),
                    oat_index,
                    NativeObjectRelocationType::DexCacheArray,
                    to_u32(size)?,
                );
            }
        }
        Ok(())
    }

    /// Starting points of the mark phase, in priority order.
    fn collect_seeds(&self, runtime: &Runtime) -> Result<Vec<(ObjectId, usize)>> {
        let linker = runtime.class_linker();
        let heap = runtime.heap();
        let mut seeds = Vec::new();

        for (&dex_file, &oat_index) in &self.options.dex_file_oat_index {
            let dex = linker.dex_file(dex_file);
            for idx in 0..to_u32(dex.num_strings())? {
                let interned = dex
                    .string(idx)
                    .ok()
                    .and_then(|value| linker.intern_table().lookup(value));
                if let Some(string) = interned {
                    seeds.push((string, oat_index));
                }
            }
        }
        for (oat_index, info) in self.image_infos.iter().enumerate() {
            if let Some(roots) = info.image_roots {
                seeds.push((roots, oat_index));
            }
        }
        seeds.extend(runtime.roots().into_iter().map(|root| (root, 0)));

        if self.options.compile_app_image {
            heap.visit_objects(|id, object| {
                if !heap.is_in_boot_image_space(id) {
                    return;
                }
                object.visit_references(|referent| {
                    if let Some(referent) = referent.filter(|r| !heap.is_in_boot_image_space(*r)) {
                        seeds.push((referent, 0));
                    }
                });
            });
        }
        Ok(seeds)
    }

    /// Assigns `seeds` and everything reachable from them, using an explicit work stack.
    /// Returns the number of objects taken off the stack.
    pub(crate) fn assign_reachable(
        &mut self,
        runtime: &Runtime,
        seeds: &[(ObjectId, usize)],
    ) -> Result<usize> {
        let heap = runtime.heap();
        let mut work = Vec::new();
        for &(object, oat_index) in seeds {
            self.try_assign(runtime, object, oat_index, &mut work)?;
        }

        let mut visited = 0;
        let mut referents = Vec::new();
        while let Some(object) = work.pop() {
            visited += 1;
            let oat_index = self.object_oat_index.get(&object).copied().unwrap_or_default();
            referents.clear();
            heap.object(object).visit_references(|referent| {
                if let Some(referent) = referent {
                    referents.push(referent);
                }
            });
            for &referent in &referents {
                self.try_assign(runtime, referent, oat_index, &mut work)?;
            }
        }
        Ok(visited)
    }

    fn try_assign(
        &mut self,
        runtime: &Runtime,
        object: ObjectId,
        oat_index: usize,
        work: &mut Vec<ObjectId>,
    ) -> Result<()> {
        let heap = runtime.heap();
        if heap.is_in_boot_image_space(object)
            || self.bin_slots.contains_key(&object)
            || !heap.contains(object)
        {
            return Ok(());
        }
        self.assign_image_bin_slot(runtime, object, oat_index)?;
        work.push(object);
        Ok(())
    }

    /// Places `object` into its bin of image `oat_index`, or of the image owning its dex file
    /// for dex caches and classes.
    ///
    /// # Errors
    /// Returns an error if the object is too large for the image address space.
    ///
    /// # Panics
    /// Panics if the object already has a bin slot, holds a lock, or is the mirror of a class
    /// that was removed.
    pub(crate) fn assign_image_bin_slot(
        &mut self,
        runtime: &Runtime,
        object: ObjectId,
        oat_index: usize,
    ) -> Result<()> {
        assert!(
            !self.bin_slots.contains_key(&object),
            "{object:?} already bin-slot-assigned"
        );
        let linker = runtime.class_linker();
        let heap = runtime.heap();
        let obj = heap.object(object);

        match obj.lock_word() {
            LockWord::Unlocked => {}
            LockWord::HashCode(hash) => {
                self.saved_hash_codes.insert(object, hash);
            }
            state => {
                log::error!("{object:?} has lock word {state:?} while writing the image");
                panic!("{object:?} is locked or forwarded while writing the image");
            }
        }

        let owner = |dex_file: DexFileId| {
            self.options
                .dex_file_oat_index
                .get(&dex_file)
                .copied()
                .unwrap_or(oat_index)
        };
        let oat_index = match obj.kind() {
            ObjectKind::DexCache(dex_file) => owner(*dex_file),
            ObjectKind::Class(class) => linker
                .get_class(*class)
                .and_then(Class::dex_file)
                .map_or(oat_index, owner),
            _ => oat_index,
        };

        let bin = match obj.kind() {
            ObjectKind::Class(id) => {
                let Some(class) = linker.get_class(*id) else {
                    log::error!("Mirror {object:?} belongs to removed class {id:?}");
                    panic!("Class mirror {object:?} of removed class {id:?}");
                };
                self.register_class_natives(linker, heap, *id, oat_index)?;
                class_bin(class)
            }
            ObjectKind::String(_) => Bin::String,
            ObjectKind::DexCache(_) => Bin::MiscDirty,
            ObjectKind::Instance if is_lock_object(linker, heap, object) => Bin::MiscDirty,
            _ => Bin::Regular,
        };

        let size = to_u32(obj.size())?;
        let offset = self.image_infos[oat_index].reserve(bin, size);
        self.bin_slots.insert(object, BinSlot::new(bin, offset));
        self.object_oat_index.insert(object, oat_index);
        Ok(())
    }

    /// Places the native structures of a class and registers its vtable as a pointer array.
    fn register_class_natives(
        &mut self,
        linker: &ClassLinker,
        heap: &Heap,
        id: ClassId,
        oat_index: usize,
    ) -> Result<()> {
        let class = linker.class(id);

        for (is_static, fields, array) in [
            (false, class.instance_fields(), NativePtr::InstanceFieldArray(id)),
            (true, class.static_fields(), NativePtr::StaticFieldArray(id)),
        ] {
            if fields.is_empty() {
                continue;
            }
            let size = LENGTH_PREFIX_SIZE + to_u32(fields.len())? * ART_FIELD_SIZE;
            let base = self.place_native(array, oat_index, NativeObjectRelocationType::ArtFieldArray, size);
            for index in 0..to_u32(fields.len())? {
                self.record_native(
                    NativePtr::Field(ArtFieldId { class: id, is_static, index }),
                    NativeObjectRelocation {
                        oat_index,
                        offset: base + LENGTH_PREFIX_SIZE + index * ART_FIELD_SIZE,
                        kind: NativeObjectRelocationType::ArtField,
                    },
                );
            }
        }

        let methods = class.methods();
        if !methods.is_empty() {
            let dirty = !class.is_initialized() || methods.iter().any(|m| m.is_native());
            let (array_kind, method_kind) = if dirty {
                (
                    NativeObjectRelocationType::ArtMethodArrayDirty,
                    NativeObjectRelocationType::ArtMethodDirty,
                )
            } else {
                (
                    NativeObjectRelocationType::ArtMethodArrayClean,
                    NativeObjectRelocationType::ArtMethodClean,
                )
            };
            let size = LENGTH_PREFIX_SIZE + to_u32(methods.len())? * ART_METHOD_SIZE;
            let base = self.place_native(NativePtr::MethodArray(id), oat_index, array_kind, size);
            for index in 0..to_u32(methods.len())? {
                self.record_native(
                    NativePtr::Method(ArtMethodId { class: id, index }),
                    NativeObjectRelocation {
                        oat_index,
                        offset: base + LENGTH_PREFIX_SIZE + index * ART_METHOD_SIZE,
                        kind: method_kind,
                    },
                );
            }
        }

        if let Some(imt) = class.imt() {
            self.place_native(
                NativePtr::Imt(id),
                oat_index,
                NativeObjectRelocationType::ImTable,
                to_u32(IMT_SIZE)? * POINTER_SIZE,
            );
            for &entry in imt {
                if let NativePtr::ImtConflictTable(table) = entry {
                    if !self.native_relocations.contains_key(&entry) {
                        let size = linker.conflict_table(table).size_in_bytes();
                        self.place_native(
                            entry,
                            oat_index,
                            NativeObjectRelocationType::ImtConflictTable,
                            size,
                        );
                    }
                }
            }
        }

        if let Some(vtable) = heap.object(class.mirror()).reference(CLASS_VTABLE_OFFSET) {
            if !heap.is_in_boot_image_space(vtable) {
                self.pointer_arrays.insert(vtable);
            }
        }
        Ok(())
    }

    /// Reserves `size` bytes for `ptr` in the bin of `kind` and returns the bin-relative offset.
    fn place_native(
        &mut self,
        ptr: NativePtr,
        oat_index: usize,
        kind: NativeObjectRelocationType,
        size: u32,
    ) -> u32 {
        let offset = self.image_infos[oat_index].reserve(kind.bin(), size);
        self.record_native(ptr, NativeObjectRelocation { oat_index, offset, kind });
        offset
    }

    fn record_native(&mut self, ptr: NativePtr, relocation: NativeObjectRelocation) {
        let previous = self.native_relocations.insert(ptr, relocation);
        assert!(previous.is_none(), "{ptr:?} placed twice");
    }

    /// Turns bin slots and bin-relative native offsets into image offsets.
    fn unbin_objects(&mut self) {
        for (&object, &slot) in &self.bin_slots {
            let oat_index = self.object_oat_index.get(&object).copied().unwrap_or_default();
            let offset = self.image_infos[oat_index].bin_slot_offset(slot.bin()) + slot.index();
            self.object_offsets.insert(object, offset);
        }
        for relocation in self.native_relocations.values_mut() {
            relocation.offset += self.image_infos[relocation.oat_index].bin_slot_offset(relocation.kind.bin());
        }
    }

    /// Sizes the intern and class tables and fills in the section table of every image.
    fn layout_tables(&mut self, linker: &ClassLinker, heap: &Heap) -> Result<()> {
        let mut interned = vec![0u32; self.image_infos.len()];
        for &string in linker.intern_table().strings() {
            if let Some(&oat_index) = self.object_oat_index.get(&string) {
                interned[oat_index] += 1;
            }
        }
        let mut classes = vec![0u32; self.image_infos.len()];
        for (_, class) in linker.classes() {
            if heap.is_in_boot_image_space(class.mirror()) {
                continue;
            }
            if let Some(&oat_index) = self.object_oat_index.get(&class.mirror()) {
                classes[oat_index] += 1;
            }
        }

        for (oat_index, info) in self.image_infos.iter_mut().enumerate() {
            info.intern_table_bytes = TABLE_HEADER_SIZE + interned[oat_index] * TABLE_ENTRY_SIZE;
            info.class_table_bytes = TABLE_HEADER_SIZE + classes[oat_index] * TABLE_ENTRY_SIZE;

            let bin_range = |bin: Bin| SectionRange::new(info.bin_slot_offset(bin), info.bin_slot_size(bin));
            let methods_begin = info.bin_slot_offset(Bin::ArtMethodClean);
            let methods_end = bin_range(Bin::ArtMethodDirty).end();
            let mut sections = [SectionRange::default(); ImageSection::COUNT];
            sections[ImageSection::Objects as usize] = SectionRange::new(0, info.image_end);
            sections[ImageSection::ArtFields as usize] = bin_range(Bin::ArtField);
            sections[ImageSection::ArtMethods as usize] =
                SectionRange::new(methods_begin, methods_end - methods_begin);
            sections[ImageSection::RuntimeMethods as usize] = bin_range(Bin::RuntimeMethod);
            sections[ImageSection::ImTables as usize] = bin_range(Bin::ImTable);
            sections[ImageSection::ImtConflictTables as usize] = bin_range(Bin::ImtConflictTable);
            sections[ImageSection::DexCacheArrays as usize] = bin_range(Bin::DexCacheArray);

            let interned_begin = to_u32(align_up(
                bin_range(Bin::DexCacheArray).end() as usize,
                OBJECT_ALIGNMENT,
            ))?;
            sections[ImageSection::InternedStrings as usize] =
                SectionRange::new(interned_begin, info.intern_table_bytes);
            let class_table_begin = to_u32(align_up(
                sections[ImageSection::InternedStrings as usize].end() as usize,
                OBJECT_ALIGNMENT,
            ))?;
            sections[ImageSection::ClassTable as usize] =
                SectionRange::new(class_table_begin, info.class_table_bytes);
            info.image_size = sections[ImageSection::ClassTable as usize].end();

            let bitmap_bits = info.image_end as usize / OBJECT_ALIGNMENT;
            let bitmap_size = align_up(bitmap_bits.div_ceil(8), OBJECT_ALIGNMENT);
            sections[ImageSection::ImageBitmap as usize] = SectionRange::new(
                to_u32(align_up(info.image_size as usize, PAGE_SIZE))?,
                to_u32(bitmap_size)?,
            );
            info.sections = sections;
        }
        Ok(())
    }
}

/// Bin of a class mirror: by initialization state, then by whether its statics can change.
fn class_bin(class: &Class) -> Bin {
    if class.status() < ClassStatus::Initialized {
        return Bin::ClassVerified;
    }
    if class.static_fields().iter().all(|field| field.is_final()) {
        Bin::ClassInitializedFinalStatics
    } else {
        Bin::ClassInitialized
    }
}

/// A plain `java.lang.Object` instance, most likely used as a lock.
fn is_lock_object(linker: &ClassLinker, heap: &Heap, object: ObjectId) -> bool {
    linker
        .lookup_class(core::OBJECT, None)
        .is_some_and(|class| heap.object(object).class() == linker.class(class).mirror())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        compiler::{CompilerDriver, CompilerOptions},
        image::options::ImageWriterOptions,
        runtime::heap::{ARRAY_DATA_OFFSET, OBJECT_HEADER_SIZE},
    };

    /// Two object arrays referencing each other, allocated after the boot image.
    fn cyclic_driver() -> (CompilerDriver, ObjectId, ObjectId) {
        let mut runtime = Runtime::new(Vec::new()).unwrap();
        runtime.mark_boot_image_space();
        let object = runtime.class_linker().lookup_class(core::OBJECT, None).unwrap();
        let (linker, heap) = runtime.parts_mut();
        let a = linker.alloc_object_array(heap, object, &[None]).unwrap();
        let b = linker.alloc_object_array(heap, object, &[Some(a)]).unwrap();
        heap.object_mut(a).set_reference(ARRAY_DATA_OFFSET, Some(b));

        let options = CompilerOptions {
            thread_count: 1,
            ..CompilerOptions::default()
        };
        let driver = CompilerDriver::with_stub_backend(options, runtime, Vec::new()).unwrap();
        (driver, a, b)
    }

    #[test]
    fn test_cycle_is_visited_once() {
        let (driver, a, b) = cyclic_driver();
        let mut writer = ImageWriter::new(&driver, ImageWriterOptions::boot_image()).unwrap();
        let runtime = read_lock!(driver.runtime());

        let visited = writer.assign_reachable(&runtime, &[(a, 0), (a, 0)]).unwrap();
        assert_eq!(visited, 2);
        assert_eq!(writer.bin_slot(a).unwrap().bin(), Bin::Regular);
        assert_eq!(writer.bin_slot(b).unwrap().bin(), Bin::Regular);
        assert_eq!(writer.bin_slot(a).unwrap().index(), 0);

        let size = to_u32(runtime.heap().object(a).size()).unwrap();
        assert_eq!(writer.bin_slot(b).unwrap().index(), size);
        assert_eq!(writer.image_info(0).bin_slot_count(Bin::Regular), 2);
    }

    #[test]
    #[should_panic(expected = "already bin-slot-assigned")]
    fn test_double_assignment_panics() {
        let (driver, a, _) = cyclic_driver();
        let mut writer = ImageWriter::new(&driver, ImageWriterOptions::boot_image()).unwrap();
        let runtime = read_lock!(driver.runtime());
        writer.assign_image_bin_slot(&runtime, a, 0).unwrap();
        writer.assign_image_bin_slot(&runtime, a, 0).unwrap();
    }

    #[test]
    fn test_hash_code_is_saved() {
        let (driver, a, _) = cyclic_driver();
        {
            let mut runtime = write_lock!(driver.runtime());
            runtime
                .heap_mut()
                .object_mut(a)
                .set_lock_word(LockWord::HashCode(0x1234));
        }
        let mut writer = ImageWriter::new(&driver, ImageWriterOptions::boot_image()).unwrap();
        let runtime = read_lock!(driver.runtime());
        writer.assign_image_bin_slot(&runtime, a, 0).unwrap();
        assert_eq!(writer.saved_hash_codes.get(&a), Some(&0x1234));
    }

    #[test]
    #[should_panic(expected = "is locked")]
    fn test_locked_object_panics() {
        let (driver, a, _) = cyclic_driver();
        {
            let mut runtime = write_lock!(driver.runtime());
            runtime
                .heap_mut()
                .object_mut(a)
                .set_lock_word(LockWord::ThinLocked { owner: 1, count: 1 });
        }
        let mut writer = ImageWriter::new(&driver, ImageWriterOptions::boot_image()).unwrap();
        let runtime = read_lock!(driver.runtime());
        writer.assign_image_bin_slot(&runtime, a, 0).unwrap();
    }

    #[test]
    fn test_lock_objects_are_dirty() {
        let (driver, _, _) = cyclic_driver();
        let lock = {
            let mut runtime = write_lock!(driver.runtime());
            let object = runtime.class_linker().lookup_class(core::OBJECT, None).unwrap();
            let (linker, heap) = runtime.parts_mut();
            linker.alloc_object(heap, object).unwrap()
        };
        let mut writer = ImageWriter::new(&driver, ImageWriterOptions::boot_image()).unwrap();
        let runtime = read_lock!(driver.runtime());
        writer.assign_image_bin_slot(&runtime, lock, 0).unwrap();
        assert_eq!(writer.bin_slot(lock).unwrap().bin(), Bin::MiscDirty);
        assert!(runtime.heap().object(lock).size() >= OBJECT_HEADER_SIZE as usize);
    }
}
