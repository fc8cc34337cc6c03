//! Image writer configuration.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use crate::{
    dex::DexFileId,
    image::header::StorageMode,
    runtime::{class::NativePtr, ObjectId},
    utils::align_up,
};

/// Page size images and bitmaps are aligned to.
pub const PAGE_SIZE: usize = 4096;

/// Default address of the first boot image.
pub const DEFAULT_IMAGE_BEGIN: u32 = 0x7000_0000;

/// Where a previously written boot image placed its content.
///
/// App images reference boot image objects and native structures by address; this records the
/// addresses the boot image writer handed out.
#[derive(Debug, Clone, Default)]
pub struct BootImageLayout {
    /// Address of the first boot image
    pub image_begin: u32,
    /// Total size of the boot images
    pub image_size: u32,
    /// Address of the first boot oat file
    pub oat_begin: u32,
    /// Total size of the boot oat files
    pub oat_size: u32,
    pub(crate) objects: FxHashMap<ObjectId, u32>,
    pub(crate) natives: FxHashMap<NativePtr, u32>,
}

impl BootImageLayout {
    /// Address of a boot image object.
    #[must_use]
    pub fn object_address(&self, object: ObjectId) -> Option<u32> {
        self.objects.get(&object).copied()
    }

    /// Address of a boot image native structure.
    #[must_use]
    pub fn native_address(&self, ptr: NativePtr) -> Option<u32> {
        self.natives.get(&ptr).copied()
    }

    /// Number of objects in the boot image.
    #[must_use]
    pub fn num_objects(&self) -> usize {
        self.objects.len()
    }

    /// First address after the boot oat files.
    #[must_use]
    pub fn end(&self) -> u32 {
        self.oat_begin + self.oat_size
    }
}

/// Options of one image writer run.
#[derive(Debug, Clone)]
pub struct ImageWriterOptions {
    /// Address of the first image
    pub image_begin: u32,
    /// Whether the image may be relocated at load time
    pub compile_pic: bool,
    /// Write an app image on top of [`ImageWriterOptions::boot_image`]
    pub compile_app_image: bool,
    /// Payload storage
    pub storage_mode: StorageMode,
    /// One oat file, and image, per entry
    pub oat_filenames: Vec<String>,
    /// Image each bytecode file belongs to; empty puts every file of the image into the first
    pub dex_file_oat_index: BTreeMap<DexFileId, usize>,
    /// The boot image an app image is layered on
    pub boot_image: Option<BootImageLayout>,
    /// Resolve class names before the layout so they are part of the image
    pub compute_lazy_fields: bool,
    /// Decompress and compare every compressed payload
    pub verify_compression: bool,
}

impl Default for ImageWriterOptions {
    fn default() -> Self {
        ImageWriterOptions {
            image_begin: DEFAULT_IMAGE_BEGIN,
            compile_pic: false,
            compile_app_image: false,
            storage_mode: StorageMode::Uncompressed,
            oat_filenames: vec!["boot.oat".to_string()],
            dex_file_oat_index: BTreeMap::new(),
            boot_image: None,
            compute_lazy_fields: true,
            verify_compression: cfg!(debug_assertions),
        }
    }
}

impl ImageWriterOptions {
    /// Options for a single boot image at the default address.
    #[must_use]
    pub fn boot_image() -> Self {
        Self::default()
    }

    /// Options for a position independent app image placed after `boot`.
    #[must_use]
    pub fn app_image(boot: BootImageLayout) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let image_begin = align_up(boot.end() as usize, PAGE_SIZE) as u32;
        ImageWriterOptions {
            image_begin,
            compile_pic: true,
            compile_app_image: true,
            oat_filenames: vec!["app.oat".to_string()],
            boot_image: Some(boot),
            ..Self::default()
        }
    }

    /// Number of images to write.
    #[must_use]
    pub fn num_images(&self) -> usize {
        self.oat_filenames.len().max(1)
    }
}
