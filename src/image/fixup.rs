//! Copying and relocation of laid out content into the image buffers.
//!
//! Objects are copied byte for byte, then every slot holding a pointer is rewritten with the
//! final address of its target: the class word and the lock word of the header, reference
//! slots as 32-bit addresses and native slots as 64-bit addresses. Native structures have no
//! heap representation to copy and are serialized from the class linker's records.
//!
//! ```text
//! field record (16)   class u32 | access flags u32 | field idx u32 | offset u32
//! method record (32)  class u32 | access flags u32 | method idx u32 | method index u16
//!                     | hotness u16 | dex cache methods u64 | entry point u64
//! length prefix (8)   count u32 | padding u32
//! ```

use crate::{
    dex::MethodReference,
    image::{
        header::ImageSection,
        writer::{ImageWriter, NativeObjectRelocation},
    },
    runtime::{
        class::{
            ArtFieldId, ArtMethodId, DexCacheArrayKind, NativePtr, RuntimeMethod,
            DEX_CACHE_DEX_FILE_OFFSET, NO_DEX_INDEX,
        },
        heap::{LOCK_WORD_OFFSET, OBJECT_ALIGNMENT, POINTER_SIZE, REFERENCE_REFERENT_OFFSET},
        ClassLinker, HeapObject, LockWord, ObjectId, ObjectKind, Runtime,
    },
    utils::{descriptor_hash, to_u32, write_le_at, BitSet, LeIO},
    Result,
};

fn put<T: LeIO>(image: &mut [u8], offset: u32, value: T) -> Result<()> {
    let mut at = offset as usize;
    write_le_at(image, &mut at, value)
}

impl ImageWriter<'_> {
    /// Fills the image and bitmap buffers of every image.
    pub(super) fn copy_and_fixup(&mut self, runtime: &Runtime) -> Result<()> {
        let mut images: Vec<Vec<u8>> = self
            .image_infos
            .iter()
            .map(|info| vec![0u8; info.image_size as usize])
            .collect();
        let mut bitmaps: Vec<BitSet> = self
            .image_infos
            .iter()
            .map(|info| BitSet::new(info.section(ImageSection::ImageBitmap).size as usize * 8))
            .collect();

        self.copy_and_fixup_native_data(runtime.class_linker(), &mut images)?;
        self.copy_and_fixup_objects(runtime, &mut images, &mut bitmaps)?;
        self.write_intern_tables(runtime, &mut images)?;
        self.write_class_tables(runtime.class_linker(), &mut images)?;

        for ((info, image), bitmap) in self.image_infos.iter_mut().zip(images).zip(bitmaps) {
            info.image = image;
            info.bitmap = bitmap.to_le_bytes();
        }
        Ok(())
    }

    /// Address of an object, `None` if it was given no place.
    pub(super) fn find_image_address(&self, object: ObjectId) -> Option<u32> {
        if let Some(&offset) = self.object_offsets.get(&object) {
            let oat_index = self.object_oat_index.get(&object).copied().unwrap_or_default();
            return Some(self.image_infos[oat_index].image_begin + offset);
        }
        self.options
            .boot_image
            .as_ref()
            .and_then(|boot| boot.object_address(object))
    }

    /// Address of a native structure, `None` if it was given no place.
    pub(super) fn find_native_address(&self, ptr: NativePtr) -> Option<u64> {
        if ptr.is_null() {
            return Some(0);
        }
        if let Some(relocation) = self.native_relocations.get(&ptr) {
            let begin = self.image_infos[relocation.oat_index].image_begin;
            return Some(u64::from(begin + relocation.offset));
        }
        self.options
            .boot_image
            .as_ref()
            .and_then(|boot| boot.native_address(ptr))
            .map(u64::from)
    }

    fn copy_and_fixup_native_data(&self, linker: &ClassLinker, images: &mut [Vec<u8>]) -> Result<()> {
        for (&ptr, relocation) in &self.native_relocations {
            let image = &mut images[relocation.oat_index];
            let at = relocation.offset;
            match ptr {
                NativePtr::Null => {}
                NativePtr::Field(id) => self.write_field(linker, image, at, id)?,
                NativePtr::Method(id) => self.write_method(linker, image, relocation, id)?,
                NativePtr::RuntimeMethod(method) => self.write_runtime_method(image, at, method)?,
                NativePtr::InstanceFieldArray(class) => {
                    put(image, at, to_u32(linker.class(class).instance_fields().len())?)?;
                }
                NativePtr::StaticFieldArray(class) => {
                    put(image, at, to_u32(linker.class(class).static_fields().len())?)?;
                }
                NativePtr::MethodArray(class) => {
                    put(image, at, to_u32(linker.class(class).methods().len())?)?;
                }
                NativePtr::Imt(class) => {
                    let entries = linker.class(class).imt().unwrap_or_default();
                    for (i, &entry) in entries.iter().enumerate() {
                        let slot = at + to_u32(i)? * POINTER_SIZE;
                        put(image, slot, self.get_native_address(entry))?;
                    }
                }
                NativePtr::ImtConflictTable(table) => {
                    let entries = linker.conflict_table(table).entries();
                    for (i, &(interface_method, implementation)) in entries.iter().enumerate() {
                        let slot = at + to_u32(i)? * 2 * POINTER_SIZE;
                        put(image, slot, self.get_native_address(NativePtr::Method(interface_method)))?;
                        put(
                            image,
                            slot + POINTER_SIZE,
                            self.get_native_address(NativePtr::Method(implementation)),
                        )?;
                    }
                }
                NativePtr::DexCacheArray(dex_file, kind) => {
                    let cache = linker.dex_cache(dex_file);
                    match kind {
                        DexCacheArrayKind::Types => {
                            for (i, slot) in cache.resolved_types().iter().enumerate() {
                                let address = slot
                                    .and_then(|class| linker.get_class(class))
                                    .map_or(0, |class| self.get_image_address(class.mirror()));
                                put(image, at + to_u32(i)? * 4, address)?;
                            }
                        }
                        DexCacheArrayKind::Strings => {
                            for (i, slot) in cache.strings().iter().enumerate() {
                                let address = slot.map_or(0, |s| self.get_image_address(s));
                                put(image, at + to_u32(i)? * 4, address)?;
                            }
                        }
                        DexCacheArrayKind::Methods => {
                            let trampoline = self.get_native_address(NativePtr::RuntimeMethod(
                                RuntimeMethod::ResolutionTrampoline,
                            ));
                            for (i, slot) in cache.resolved_methods().iter().enumerate() {
                                let address = slot.map_or(trampoline, |m| {
                                    self.get_native_address(NativePtr::Method(m))
                                });
                                put(image, at + to_u32(i)? * POINTER_SIZE, address)?;
                            }
                        }
                        DexCacheArrayKind::Fields => {
                            for (i, slot) in cache.resolved_fields().iter().enumerate() {
                                let address = slot
                                    .map_or(0, |f| self.get_native_address(NativePtr::Field(f)));
                                put(image, at + to_u32(i)? * POINTER_SIZE, address)?;
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn write_field(&self, linker: &ClassLinker, image: &mut [u8], at: u32, id: ArtFieldId) -> Result<()> {
        let field = linker.field(id);
        let class = linker.class(field.declaring_class());
        put(image, at, self.get_image_address(class.mirror()))?;
        put(image, at + 4, field.access_flags().bits())?;
        put(image, at + 8, field.dex_field_idx())?;
        put(image, at + 12, field.offset())
    }

    fn write_method(
        &self,
        linker: &ClassLinker,
        image: &mut [u8],
        relocation: &NativeObjectRelocation,
        id: ArtMethodId,
    ) -> Result<()> {
        let method = linker.method(id);
        let class = linker.class(method.declaring_class());
        let at = relocation.offset;

        let dex_cache_methods = class
            .dex_file()
            .and_then(|d| self.find_native_address(NativePtr::DexCacheArray(d, DexCacheArrayKind::Methods)))
            .unwrap_or_default();

        let info = &self.image_infos[relocation.oat_index];
        let oat_data = u64::from(info.oat_data_begin());
        let trampolines = info.oat_layout().trampolines;
        let code = class.dex_file().and_then(|d| {
            info.oat_layout()
                .method_code_offsets
                .get(&MethodReference::new(d, method.dex_method_idx()))
                .copied()
        });
        let needs_initialization =
            method.is_static() && !method.is_constructor() && !class.is_initialized();
        let entry_point = match code {
            _ if needs_initialization => oat_data + u64::from(trampolines.resolution),
            Some(offset) => oat_data + u64::from(offset),
            None if method.is_native() => oat_data + u64::from(trampolines.generic_jni),
            None => oat_data + u64::from(trampolines.interpreter_bridge),
        };

        put(image, at, self.get_image_address(class.mirror()))?;
        put(image, at + 4, method.access_flags().bits())?;
        put(image, at + 8, method.dex_method_idx())?;
        put(image, at + 12, method.method_index())?;
        put(image, at + 14, 0u16)?;
        put(image, at + 16, dex_cache_methods)?;
        put(image, at + 24, entry_point)
    }

    fn write_runtime_method(&self, image: &mut [u8], at: u32, method: RuntimeMethod) -> Result<()> {
        let info = &self.image_infos[0];
        let oat_data = u64::from(info.oat_data_begin());
        let trampolines = info.oat_layout().trampolines;
        let entry_point = match method {
            RuntimeMethod::ResolutionTrampoline => trampolines.resolution,
            RuntimeMethod::ImtConflict | RuntimeMethod::ImtUnimplemented => trampolines.imt_conflict,
        };
        put(image, at + 8, NO_DEX_INDEX)?;
        put(image, at + 24, oat_data + u64::from(entry_point))
    }

    fn copy_and_fixup_objects(
        &self,
        runtime: &Runtime,
        images: &mut [Vec<u8>],
        bitmaps: &mut [BitSet],
    ) -> Result<()> {
        let heap = runtime.heap();
        let mut objects: Vec<ObjectId> = self.object_offsets.keys().copied().collect();
        objects.sort_unstable();

        for id in objects {
            let object = heap.object(id);
            let oat_index = self.object_oat_index.get(&id).copied().unwrap_or_default();
            let offset = self.object_offsets[&id];
            let image = &mut images[oat_index];

            let start = offset as usize;
            image[start..start + object.data().len()].copy_from_slice(object.data());
            bitmaps[oat_index].insert(start / OBJECT_ALIGNMENT);

            self.fixup_object(image, offset, id, object)?;
        }
        Ok(())
    }

    fn fixup_object(&self, image: &mut [u8], offset: u32, id: ObjectId, object: &HeapObject) -> Result<()> {
        put(image, offset, self.get_image_address(object.class()))?;
        let lock_word = self
            .saved_hash_codes
            .get(&id)
            .map_or(0, |&hash| LockWord::HashCode(hash).encode());
        put(image, offset + LOCK_WORD_OFFSET, lock_word)?;

        for &(slot, referent) in object.references() {
            let address = referent.map_or(0, |r| self.get_image_address(r));
            put(image, offset + slot, address)?;
        }
        if let ObjectKind::Reference(referent) = object.kind() {
            let address = referent.map_or(0, |r| self.get_image_address(r));
            put(image, offset + REFERENCE_REFERENT_OFFSET, address)?;
        }

        match object.kind() {
            ObjectKind::PointerArray => {
                assert!(
                    self.pointer_arrays.contains(&id),
                    "Pointer array {id:?} was not registered with its class"
                );
                for &(slot, element) in object.natives() {
                    put(image, offset + slot, self.get_native_address(element))?;
                }
            }
            ObjectKind::ClassLoader => {
                for &(slot, _) in object.natives() {
                    put(image, offset + slot, 0u64)?;
                }
            }
            ObjectKind::DexCache(_) => {
                for &(slot, ptr) in object.natives() {
                    let address = if slot == DEX_CACHE_DEX_FILE_OFFSET {
                        0
                    } else {
                        self.get_native_address(ptr)
                    };
                    put(image, offset + slot, address)?;
                }
            }
            _ => {
                for &(slot, ptr) in object.natives() {
                    put(image, offset + slot, self.get_native_address(ptr))?;
                }
            }
        }
        Ok(())
    }

    fn write_intern_tables(&self, runtime: &Runtime, images: &mut [Vec<u8>]) -> Result<()> {
        let heap = runtime.heap();
        let mut tables: Vec<Vec<(u32, u32)>> = vec![Vec::new(); images.len()];
        for &string in runtime.class_linker().intern_table().strings() {
            let Some(&oat_index) = self.object_oat_index.get(&string) else {
                continue;
            };
            if let ObjectKind::String(value) = heap.object(string).kind() {
                tables[oat_index].push((descriptor_hash(value), self.get_image_address(string)));
            }
        }
        for (oat_index, entries) in tables.iter_mut().enumerate() {
            let section = self.image_infos[oat_index].section(ImageSection::InternedStrings);
            write_table(&mut images[oat_index], section.offset, entries)?;
        }
        Ok(())
    }

    fn write_class_tables(&self, linker: &ClassLinker, images: &mut [Vec<u8>]) -> Result<()> {
        let mut tables: Vec<Vec<(u32, u32)>> = vec![Vec::new(); images.len()];
        for (_, class) in linker.classes() {
            if let Some(&oat_index) = self.object_oat_index.get(&class.mirror()) {
                tables[oat_index].push((
                    descriptor_hash(class.descriptor()),
                    self.get_image_address(class.mirror()),
                ));
            }
        }
        for (oat_index, entries) in tables.iter_mut().enumerate() {
            let section = self.image_infos[oat_index].section(ImageSection::ClassTable);
            write_table(&mut images[oat_index], section.offset, entries)?;
        }
        Ok(())
    }
}

/// Writes a sorted (hash, address) table behind its count word.
fn write_table(image: &mut [u8], offset: u32, entries: &mut [(u32, u32)]) -> Result<()> {
    entries.sort_unstable();
    put(image, offset, to_u32(entries.len())?)?;
    for (i, &(hash, address)) in entries.iter().enumerate() {
        let at = offset + 8 + to_u32(i)? * 8;
        put(image, at, hash)?;
        put(image, at + 4, address)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::read_le;

    #[test]
    fn test_table_is_sorted() {
        let mut image = vec![0u8; 32];
        let mut entries = vec![(9, 0x100), (3, 0x200), (5, 0x300)];
        write_table(&mut image, 0, &mut entries).unwrap();

        assert_eq!(read_le::<u32>(&image[0..]).unwrap(), 3);
        assert_eq!(read_le::<u32>(&image[8..]).unwrap(), 3);
        assert_eq!(read_le::<u32>(&image[12..]).unwrap(), 0x200);
        assert_eq!(read_le::<u32>(&image[24..]).unwrap(), 9);
    }

    #[test]
    fn test_table_overflow_is_an_error() {
        let mut image = vec![0u8; 12];
        let mut entries = vec![(1, 1), (2, 2)];
        assert!(write_table(&mut image, 0, &mut entries).is_err());
    }
}
