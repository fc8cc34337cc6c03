//! The image writer.
//!
//! [`ImageWriter`] snapshots the heap of a compiled [`CompilerDriver`] into one image per oat
//! file. Its work is split in two calls:
//!
//! 1. [`ImageWriter::prepare_image_address_space`] prunes the class hierarchy, collects garbage
//!    and assigns every surviving object and native structure its final address.
//! 2. [`ImageWriter::write`] copies and relocates everything into image buffers, optionally
//!    compresses them and writes the files.
//!
//! Between the two, the oat writer reports where the compiled code landed through
//! [`ImageWriter::update_oat_file_layout`], so that method entry points can be filled in.
//!
//! # Examples
//!
//! ```rust,no_run
//! use oatforge::prelude::*;
//!
//! # fn example(driver: &CompilerDriver) -> oatforge::Result<()> {
//! let mut writer = ImageWriter::new(driver, ImageWriterOptions::boot_image())?;
//! writer.prepare_image_address_space()?;
//! writer.write(&["boot.art"])?;
//! # Ok(())
//! # }
//! ```

use std::{borrow::Cow, path::Path, time::Instant};

use rustc_hash::{FxHashMap, FxHashSet};
use strum::{EnumCount, IntoEnumIterator};

use crate::{
    compiler::CompilerDriver,
    image::{
        bin::{Bin, BinSlot},
        header::{ImageHeader, ImageSection, SectionRange, StorageMode},
        info::{ImageInfo, OatFileLayout},
        options::{BootImageLayout, ImageWriterOptions, PAGE_SIZE},
        output::Output,
        prune::{check_non_image_classes_removed, prune_non_image_classes},
    },
    runtime::{class::NativePtr, heap::POINTER_SIZE, Heap, ObjectId},
    utils::{align_up, to_u32},
    Error, Result,
};

/// Highest LZ4HC level.
const LZ4HC_LEVEL: i32 = 12;

/// Kind of a native structure placed in the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NativeObjectRelocationType {
    /// A field record inside a field array
    ArtField,
    /// A length-prefixed field array
    ArtFieldArray,
    /// A method that is not patched after load
    ArtMethodClean,
    /// A method the runtime patches after load
    ArtMethodDirty,
    /// A method array without dirty methods
    ArtMethodArrayClean,
    /// A method array holding dirty methods
    ArtMethodArrayDirty,
    /// A runtime-owned method
    RuntimeMethod,
    /// An interface method table
    ImTable,
    /// An interface method conflict table
    ImtConflictTable,
    /// An array backing a dex cache
    DexCacheArray,
}

impl NativeObjectRelocationType {
    /// The bin structures of this kind are placed in.
    #[must_use]
    pub fn bin(self) -> Bin {
        match self {
            Self::ArtField | Self::ArtFieldArray => Bin::ArtField,
            Self::ArtMethodClean | Self::ArtMethodArrayClean => Bin::ArtMethodClean,
            Self::ArtMethodDirty | Self::ArtMethodArrayDirty => Bin::ArtMethodDirty,
            Self::RuntimeMethod => Bin::RuntimeMethod,
            Self::ImTable => Bin::ImTable,
            Self::ImtConflictTable => Bin::ImtConflictTable,
            Self::DexCacheArray => Bin::DexCacheArray,
        }
    }
}

/// Placement of a native structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeObjectRelocation {
    /// Image holding the structure
    pub oat_index: usize,
    /// Offset relative to the image begin once laid out, bin-relative before
    pub offset: u32,
    /// Kind of structure
    pub kind: NativeObjectRelocationType,
}

/// Writes the heap of a compiled driver into images.
pub struct ImageWriter<'a> {
    pub(super) driver: &'a CompilerDriver,
    pub(super) options: ImageWriterOptions,
    pub(super) image_infos: Vec<ImageInfo>,
    pub(super) bin_slots: FxHashMap<ObjectId, BinSlot>,
    pub(super) object_oat_index: FxHashMap<ObjectId, usize>,
    pub(super) object_offsets: FxHashMap<ObjectId, u32>,
    pub(super) saved_hash_codes: FxHashMap<ObjectId, u32>,
    pub(super) native_relocations: FxHashMap<NativePtr, NativeObjectRelocation>,
    pub(super) pointer_arrays: FxHashSet<ObjectId>,
    pub(super) laid_out: bool,
}

impl<'a> ImageWriter<'a> {
    /// Offset of the first object, just past the header.
    #[allow(clippy::cast_possible_truncation)]
    pub const OBJECTS_BEGIN: u32 = align_up(ImageHeader::SIZE, 8) as u32;

    /// Creates a writer for the heap of `driver`.
    ///
    /// Without an explicit [`ImageWriterOptions::dex_file_oat_index`], every bytecode file of the
    /// image goes into the first image: the boot class path for boot images, the compiled files
    /// for app images.
    ///
    /// # Errors
    /// Returns [`Error::Error`] if an app image is requested without a boot image to layer it
    /// on, or if no oat file name is configured.
    pub fn new(driver: &'a CompilerDriver, mut options: ImageWriterOptions) -> Result<Self> {
        if options.oat_filenames.is_empty() {
            return Err(Error::Error("Image writer needs at least one oat file".to_string()));
        }
        {
            let runtime = read_lock!(driver.runtime());
            if options.compile_app_image
                && (options.boot_image.is_none() || !runtime.heap().has_boot_image_space())
            {
                return Err(Error::Error(
                    "App images require a loaded boot image".to_string(),
                ));
            }
            if options.dex_file_oat_index.is_empty() {
                let files: Vec<_> = if options.compile_app_image {
                    driver.dex_files().to_vec()
                } else {
                    runtime.class_linker().boot_class_path().to_vec()
                };
                options.dex_file_oat_index = files.into_iter().map(|id| (id, 0)).collect();
            }
            let num_dex_files = runtime.class_linker().dex_files().len();
            if let Some((dex_file, oat_index)) = options.dex_file_oat_index.iter().find(|(d, &i)| {
                d.index() >= num_dex_files || i >= options.oat_filenames.len()
            }) {
                return Err(Error::Error(format!(
                    "Invalid image assignment of {dex_file:?} to image {oat_index}"
                )));
            }
        }

        let image_infos = options
            .oat_filenames
            .iter()
            .map(|name| ImageInfo::new(name.clone(), Self::OBJECTS_BEGIN))
            .collect();
        Ok(ImageWriter {
            driver,
            options,
            image_infos,
            bin_slots: FxHashMap::default(),
            object_oat_index: FxHashMap::default(),
            object_offsets: FxHashMap::default(),
            saved_hash_codes: FxHashMap::default(),
            native_relocations: FxHashMap::default(),
            pointer_arrays: FxHashSet::default(),
            laid_out: false,
        })
    }

    /// The options of this writer.
    #[must_use]
    pub fn options(&self) -> &ImageWriterOptions {
        &self.options
    }

    /// Prunes classes, collects garbage and lays out every image.
    ///
    /// Takes the mutator lock exclusively for the whole call.
    ///
    /// # Errors
    /// Returns an error if the image roots or class names cannot be allocated, or if an offset
    /// does not fit the 32-bit image address space.
    ///
    /// # Panics
    /// Panics on any heap inconsistency: a pruned class that is still reachable, a locked
    /// object, an object assigned twice or a live object left without a bin slot.
    pub fn prepare_image_address_space(&mut self) -> Result<()> {
        if self.laid_out {
            return Err(Error::Error("Image address space already prepared".to_string()));
        }
        let driver = self.driver;
        let image_classes = driver.image_classes();
        let mut runtime = write_lock!(driver.runtime());

        let start = Instant::now();
        let removed = {
            let (linker, heap) = runtime.parts_mut();
            prune_non_image_classes(
                linker,
                heap,
                image_classes.as_ref(),
                self.options.compile_app_image,
            )
        };
        log::info!(
            "Pruned {} classes in {:?}, heap {} bytes",
            removed.len(),
            start.elapsed(),
            runtime.heap().bytes_allocated()
        );

        if self.options.compute_lazy_fields {
            let start = Instant::now();
            self.compute_lazy_fields(&mut runtime)?;
            log::info!("Computed lazy fields in {:?}", start.elapsed());
        }

        let start = Instant::now();
        let freed = runtime.collect_garbage();
        log::info!(
            "Collected {freed} objects in {:?}, heap {} bytes",
            start.elapsed(),
            runtime.heap().bytes_allocated()
        );

        check_non_image_classes_removed(
            runtime.class_linker(),
            runtime.heap(),
            image_classes.as_ref(),
        );

        let start = Instant::now();
        self.calculate_new_object_offsets(&mut runtime)?;
        self.ensure_bin_slots_assigned(runtime.heap());
        self.laid_out = true;
        log::info!(
            "Laid out {} objects and {} native structures in {:?}",
            self.object_offsets.len(),
            self.native_relocations.len(),
            start.elapsed()
        );
        for info in &self.image_infos {
            log::info!(
                "Image for {}: begin {:#x}, {} bytes",
                info.oat_filename(),
                info.image_begin(),
                info.image_size()
            );
        }
        Ok(())
    }

    /// Records where the oat writer placed the oat file of image `oat_index`. Oat files are
    /// mapped back to back after the last image.
    ///
    /// # Errors
    /// Returns [`Error::Error`] if `oat_index` names no image.
    pub fn update_oat_file_layout(&mut self, oat_index: usize, layout: OatFileLayout) -> Result<()> {
        let info = self
            .image_infos
            .get_mut(oat_index)
            .ok_or_else(|| Error::Error(format!("No image with oat index {oat_index}")))?;
        info.oat = layout;
        self.assign_oat_file_begins()
    }

    /// Relocates every image and writes one file per entry of `image_filenames`.
    ///
    /// Each file holds the header, the (possibly compressed) payload and the page aligned live
    /// bitmap. The header is written last. A file left behind by a failed call must be removed
    /// by the caller.
    ///
    /// # Errors
    /// Returns an error if the address space was not prepared, the number of file names does
    /// not match the number of images, compression fails or a file cannot be written.
    pub fn write<P: AsRef<Path>>(&mut self, image_filenames: &[P]) -> Result<()> {
        if !self.laid_out {
            return Err(Error::Error(
                "prepare_image_address_space must run before write".to_string(),
            ));
        }
        if image_filenames.len() != self.image_infos.len() {
            return Err(Error::Error(format!(
                "Expected {} image file names, got {}",
                self.image_infos.len(),
                image_filenames.len()
            )));
        }

        let driver = self.driver;
        let start = Instant::now();
        {
            let runtime = read_lock!(driver.runtime());
            self.copy_and_fixup(&runtime)?;
        }
        log::info!("Copied and relocated images in {:?}", start.elapsed());

        for (oat_index, path) in image_filenames.iter().enumerate() {
            let start = Instant::now();
            let written = self.write_image(oat_index, path.as_ref())?;
            log::info!(
                "Wrote {} ({written} bytes) in {:?}",
                path.as_ref().display(),
                start.elapsed()
            );
        }
        Ok(())
    }

    /// Final address of a heap object, inside this image set or the boot image.
    ///
    /// # Panics
    /// Panics if the object was given no place; every object written into an image must have
    /// one.
    #[must_use]
    pub fn get_image_address(&self, object: ObjectId) -> u32 {
        if let Some(address) = self.find_image_address(object) {
            return address;
        }
        log::error!("Object {object:?} has no image address");
        panic!("missing relocation for {object:?}");
    }

    /// Final address of a native structure, inside this image set or the boot image.
    ///
    /// # Panics
    /// Panics if the structure was given no place.
    #[must_use]
    pub fn get_native_address(&self, ptr: NativePtr) -> u64 {
        if let Some(address) = self.find_native_address(ptr) {
            return address;
        }
        log::error!("Native structure {ptr:?} has no image address");
        panic!("missing relocation for {ptr:?}");
    }

    /// Total bytes per bin of image `oat_index`.
    #[must_use]
    pub fn bin_slot_sizes(&self, oat_index: usize) -> [u32; Bin::COUNT] {
        self.image_infos[oat_index].bin_slot_sizes
    }

    /// Every native structure placed so far.
    #[must_use]
    pub fn native_relocations(&self) -> &FxHashMap<NativePtr, NativeObjectRelocation> {
        &self.native_relocations
    }

    /// Layout of image `oat_index`.
    #[must_use]
    pub fn image_info(&self, oat_index: usize) -> &ImageInfo {
        &self.image_infos[oat_index]
    }

    /// Number of images.
    #[must_use]
    pub fn num_images(&self) -> usize {
        self.image_infos.len()
    }

    /// Bin slot of an object, before the final offsets are assigned.
    #[must_use]
    pub fn bin_slot(&self, object: ObjectId) -> Option<BinSlot> {
        self.bin_slots.get(&object).copied()
    }

    /// Image an object was placed in.
    #[must_use]
    pub fn oat_index_of(&self, object: ObjectId) -> Option<usize> {
        self.object_oat_index.get(&object).copied()
    }

    /// Describes the images written by this writer, for an app image layered on top.
    #[must_use]
    pub fn boot_image_layout(&self) -> BootImageLayout {
        let (Some(first), Some(last)) = (self.image_infos.first(), self.image_infos.last()) else {
            return BootImageLayout::default();
        };
        let oat_end = last.oat_file_begin + last.oat.file_size;

        let objects = self
            .object_offsets
            .keys()
            .map(|&object| (object, self.get_image_address(object)))
            .collect();
        #[allow(clippy::cast_possible_truncation)]
        let natives = self
            .native_relocations
            .keys()
            .map(|&ptr| (ptr, self.get_native_address(ptr) as u32))
            .collect();

        BootImageLayout {
            image_begin: first.image_begin,
            image_size: last.image_begin + last.image_size - first.image_begin,
            oat_begin: first.oat_file_begin,
            oat_size: oat_end - first.oat_file_begin,
            objects,
            natives,
        }
    }

    /// Places the oat files after the last image, page aligned and back to back.
    pub(super) fn assign_oat_file_begins(&mut self) -> Result<()> {
        let Some(last) = self.image_infos.last() else {
            return Ok(());
        };
        let mut begin = align_up((last.image_begin + last.image_size) as usize, PAGE_SIZE);
        for info in &mut self.image_infos {
            info.oat_file_begin = to_u32(begin)?;
            begin = align_up(begin + info.oat.file_size as usize, PAGE_SIZE);
        }
        Ok(())
    }

    /// Builds the header of image `oat_index`. `data_size` is the size of the stored payload.
    pub(super) fn create_header(&self, oat_index: usize, data_size: u32) -> ImageHeader {
        let info = &self.image_infos[oat_index];
        let oat_data_begin = info.oat_data_begin();
        let boot = self.options.boot_image.as_ref();
        let image_roots = info
            .image_roots
            .map(|roots| self.get_image_address(roots))
            .unwrap_or_default();

        let mut header = ImageHeader {
            image_begin: info.image_begin,
            image_size: info.image_size,
            oat_checksum: info.oat.checksum,
            oat_file_begin: info.oat_file_begin,
            oat_data_begin,
            oat_data_end: oat_data_begin + info.oat.data_size,
            oat_file_end: info.oat_file_begin + info.oat.file_size,
            boot_image_begin: boot.map_or(0, |b| b.image_begin),
            boot_image_size: boot.map_or(0, |b| b.image_size),
            boot_oat_begin: boot.map_or(0, |b| b.oat_begin),
            boot_oat_size: boot.map_or(0, |b| b.oat_size),
            image_roots,
            pointer_size: POINTER_SIZE,
            compile_pic: self.options.compile_pic,
            is_app_image: self.options.compile_app_image,
            storage_mode: self.options.storage_mode,
            data_size,
            sections: info.sections,
        };
        #[allow(clippy::cast_possible_truncation)]
        let bitmap_offset = align_up(ImageHeader::SIZE + data_size as usize, PAGE_SIZE) as u32;
        #[allow(clippy::cast_possible_truncation)]
        let bitmap_size = info.bitmap.len() as u32;
        *header.section_mut(ImageSection::ImageBitmap) = SectionRange::new(bitmap_offset, bitmap_size);
        header
    }

    /// Compresses the payload of image `oat_index` as configured. An uncompressed payload is
    /// borrowed from the image buffer.
    fn compress_payload(&self, oat_index: usize) -> Result<Cow<'_, [u8]>> {
        let info = &self.image_infos[oat_index];
        let payload = &info.image[ImageHeader::SIZE..info.image_size as usize];

        let start = Instant::now();
        let compressed = match self.options.storage_mode {
            StorageMode::Uncompressed => return Ok(Cow::Borrowed(payload)),
            StorageMode::Lz4 => lz4_flex::block::compress(payload),
            StorageMode::Lz4Hc => lz4::block::compress(
                payload,
                Some(lz4::block::CompressionMode::HIGHCOMPRESSION(LZ4HC_LEVEL)),
                false,
            )
            .map_err(|e| Error::Compression(format!("LZ4HC compression failed: {e}")))?,
        };
        // Both encoders emit the plain block format.
        if self.options.verify_compression {
            let decompressed = lz4_flex::block::decompress(&compressed, payload.len())
                .map_err(|e| Error::Compression(format!("Decompression check failed: {e}")))?;
            if decompressed != payload {
                return Err(Error::Compression(format!(
                    "Compressed image {} does not round-trip",
                    info.oat_filename()
                )));
            }
        }
        log::info!(
            "Compressed {} bytes to {} ({}) in {:?}",
            payload.len(),
            compressed.len(),
            self.options.storage_mode,
            start.elapsed()
        );
        Ok(Cow::Owned(compressed))
    }

    fn write_image(&self, oat_index: usize, path: &Path) -> Result<usize> {
        let payload = self.compress_payload(oat_index)?;
        let header = self.create_header(oat_index, to_u32(payload.len())?);
        let bitmap = &self.image_infos[oat_index].bitmap;
        let bitmap_range = header.section(ImageSection::ImageBitmap);
        let file_size = bitmap_range.offset as usize + bitmap.len();

        let mut output = Output::create(path, file_size as u64)?;
        output.write_at(ImageHeader::SIZE as u64, &payload)?;
        output.write_at(u64::from(bitmap_range.offset), bitmap)?;
        output.write_at(0, &header.to_bytes()?)?;
        output.finalize()?;
        Ok(file_size)
    }

    /// Asserts that every live object outside the boot image has a bin slot.
    ///
    /// # Panics
    /// Panics on the first object without one.
    pub(super) fn ensure_bin_slots_assigned(&self, heap: &Heap) {
        heap.visit_objects(|id, object| {
            if heap.is_in_boot_image_space(id) || self.bin_slots.contains_key(&id) {
                return;
            }
            log::error!("Live object {id:?} of kind {:?} was not laid out", object.kind());
            panic!("Image object {id:?} has no bin slot");
        });
    }

    /// Sums of the sizes per bin across every image.
    #[must_use]
    pub fn total_bin_sizes(&self) -> Vec<(Bin, u32)> {
        Bin::iter()
            .map(|bin| {
                let total = self.image_infos.iter().map(|i| i.bin_slot_size(bin)).sum();
                (bin, total)
            })
            .collect()
    }
}

impl std::fmt::Debug for ImageWriter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageWriter")
            .field("options", &self.options)
            .field("images", &self.image_infos.len())
            .field("objects", &self.bin_slots.len())
            .field("natives", &self.native_relocations.len())
            .field("laid_out", &self.laid_out)
            .finish()
    }
}
