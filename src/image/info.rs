//! Per-image layout state.

use strum::{EnumCount, IntoEnumIterator};

use crate::{
    image::{
        bin::Bin,
        header::{ImageSection, SectionRange},
    },
    runtime::ObjectId,
    utils::align_up,
};

/// Offsets of the runtime entry stubs inside an oat file's code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Trampolines {
    /// Resolves the callee, then jumps to it
    pub resolution: u32,
    /// Enters the interpreter
    pub interpreter_bridge: u32,
    /// Generic JNI transition for native methods without a compiled stub
    pub generic_jni: u32,
    /// Dispatches through an IMT conflict table
    pub imt_conflict: u32,
}

/// Layout of the oat file written next to an image.
#[derive(Debug, Clone, Default)]
pub struct OatFileLayout {
    /// Size of the whole file
    pub file_size: u32,
    /// Offset of the oat data within the file
    pub data_offset: u32,
    /// Size of the oat data
    pub data_size: u32,
    /// Checksum of the oat header
    pub checksum: u32,
    /// Runtime stub offsets, relative to the oat data
    pub trampolines: Trampolines,
    /// Offset of compiled code per method, relative to the oat data
    pub method_code_offsets: std::collections::BTreeMap<crate::dex::MethodReference, u32>,
}

/// Layout and buffers of one image.
#[derive(Debug, Default)]
pub struct ImageInfo {
    pub(crate) oat_filename: String,
    pub(crate) image_begin: u32,
    pub(crate) image_end: u32,
    pub(crate) image_size: u32,
    pub(crate) image_roots: Option<ObjectId>,
    pub(crate) bin_slot_sizes: [u32; Bin::COUNT],
    pub(crate) bin_slot_offsets: [u32; Bin::COUNT],
    pub(crate) bin_slot_count: [u32; Bin::COUNT],
    pub(crate) intern_table_bytes: u32,
    pub(crate) class_table_bytes: u32,
    pub(crate) sections: [SectionRange; ImageSection::COUNT],
    pub(crate) oat: OatFileLayout,
    pub(crate) oat_file_begin: u32,
    pub(crate) image: Vec<u8>,
    pub(crate) bitmap: Vec<u8>,
}

impl ImageInfo {
    pub(crate) fn new(oat_filename: String, objects_begin: u32) -> Self {
        ImageInfo {
            oat_filename,
            image_end: objects_begin,
            ..ImageInfo::default()
        }
    }

    /// Name of the oat file this image belongs to.
    #[must_use]
    pub fn oat_filename(&self) -> &str {
        &self.oat_filename
    }

    /// Address the image is mapped at.
    #[must_use]
    pub fn image_begin(&self) -> u32 {
        self.image_begin
    }

    /// End of the mirror objects, relative to the image begin.
    #[must_use]
    pub fn image_end(&self) -> u32 {
        self.image_end
    }

    /// Size of the image, excluding the bitmap.
    #[must_use]
    pub fn image_size(&self) -> u32 {
        self.image_size
    }

    /// The image roots array.
    #[must_use]
    pub fn image_roots(&self) -> Option<ObjectId> {
        self.image_roots
    }

    /// Total bytes placed in `bin`.
    #[must_use]
    pub fn bin_slot_size(&self, bin: Bin) -> u32 {
        self.bin_slot_sizes[bin.index()]
    }

    /// Start of `bin`, relative to the image begin.
    #[must_use]
    pub fn bin_slot_offset(&self, bin: Bin) -> u32 {
        self.bin_slot_offsets[bin.index()]
    }

    /// Number of entries placed in `bin`.
    #[must_use]
    pub fn bin_slot_count(&self, bin: Bin) -> u32 {
        self.bin_slot_count[bin.index()]
    }

    /// Sum of the sizes of the first `up_to` bins.
    #[must_use]
    pub fn bin_size_sum(&self, up_to: usize) -> u32 {
        self.bin_slot_sizes[..up_to].iter().sum()
    }

    /// A section of the image.
    #[must_use]
    pub fn section(&self, section: ImageSection) -> SectionRange {
        self.sections[section as usize]
    }

    /// Oat file layout.
    #[must_use]
    pub fn oat_layout(&self) -> &OatFileLayout {
        &self.oat
    }

    /// Address of the oat file.
    #[must_use]
    pub fn oat_file_begin(&self) -> u32 {
        self.oat_file_begin
    }

    /// Address of the oat data.
    #[must_use]
    pub fn oat_data_begin(&self) -> u32 {
        self.oat_file_begin + self.oat.data_offset
    }

    /// Laid out image bytes, before compression.
    #[must_use]
    pub fn image_data(&self) -> &[u8] {
        &self.image
    }

    /// Live bitmap of the object section.
    #[must_use]
    pub fn bitmap(&self) -> &[u8] {
        &self.bitmap
    }

    /// Reserves `size` bytes at the end of `bin` and returns the bin-relative offset.
    pub(crate) fn reserve(&mut self, bin: Bin, size: u32) -> u32 {
        let offset = self.bin_slot_sizes[bin.index()];
        self.bin_slot_sizes[bin.index()] += size;
        self.bin_slot_count[bin.index()] += 1;
        if bin.is_mirror() {
            self.image_end += size;
        }
        offset
    }

    /// Assigns every bin its start offset, in bin order.
    pub(crate) fn assign_bin_offsets(&mut self, objects_begin: u32) {
        let mut offset = objects_begin as usize;
        for bin in Bin::iter() {
            offset = align_up(offset, bin.alignment());
            #[allow(clippy::cast_possible_truncation)]
            {
                self.bin_slot_offsets[bin.index()] = offset as u32;
            }
            offset += self.bin_slot_sizes[bin.index()] as usize;
        }
    }
}
