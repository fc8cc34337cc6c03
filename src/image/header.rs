//! On-disk image header and section table.
//!
//! # Layout
//!
//! ```text
//! offset  size  field
//! 0       4     magic "art\n"
//! 4       4     version
//! 8       68    17 little-endian u32 fields, in declaration order
//! 76      80    section table, (offset, size) per ImageSection
//! ```
//!
//! Section offsets are relative to the image begin. The header occupies the start of the
//! objects section; the bitmap section is the only one stored at its file offset directly,
//! after the (possibly compressed) payload.

use strum::{Display, EnumCount, EnumIter, IntoEnumIterator};

use crate::{
    utils::{read_le_at, write_le_at},
    Result,
};

/// Magic bytes at the start of every image.
pub const IMAGE_MAGIC: [u8; 4] = *b"art\n";
/// Format version.
pub const IMAGE_VERSION: [u8; 4] = *b"029\0";

/// Named regions of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumIter, EnumCount)]
pub enum ImageSection {
    /// Header and mirror objects
    Objects,
    /// Field arrays
    ArtFields,
    /// Method arrays, clean then dirty
    ArtMethods,
    /// Runtime-owned methods
    RuntimeMethods,
    /// Interface method tables
    ImTables,
    /// Interface method conflict tables
    ImtConflictTables,
    /// Dex cache arrays
    DexCacheArrays,
    /// Intern table
    InternedStrings,
    /// Class table
    ClassTable,
    /// Live bitmap of the objects section
    ImageBitmap,
}

/// Offset and size of a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SectionRange {
    /// Start, relative to the image begin
    pub offset: u32,
    /// Length in bytes
    pub size: u32,
}

impl SectionRange {
    /// Creates a range.
    #[must_use]
    pub fn new(offset: u32, size: u32) -> Self {
        SectionRange { offset, size }
    }

    /// First byte after the section.
    #[must_use]
    pub fn end(&self) -> u32 {
        self.offset + self.size
    }

    /// Returns `true` if `offset` lies within the section.
    #[must_use]
    pub fn contains(&self, offset: u32) -> bool {
        offset >= self.offset && offset < self.end()
    }
}

/// How the image payload is stored on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Display, EnumIter)]
#[repr(u32)]
pub enum StorageMode {
    /// Stored as laid out
    #[default]
    Uncompressed = 0,
    /// LZ4 block compression
    Lz4 = 1,
    /// LZ4 block compression with the high-compression encoder
    Lz4Hc = 2,
}

impl StorageMode {
    /// Decodes a stored mode.
    ///
    /// # Errors
    /// Returns [`crate::Error::Malformed`] for unknown values.
    pub fn from_raw(value: u32) -> Result<Self> {
        StorageMode::iter()
            .find(|mode| *mode as u32 == value)
            .ok_or_else(|| malformed_error!("Unknown image storage mode {}", value))
    }

    /// Returns `true` if the payload is compressed.
    #[must_use]
    pub fn is_compressed(self) -> bool {
        self != StorageMode::Uncompressed
    }
}

/// The image header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImageHeader {
    /// Address the image is mapped at
    pub image_begin: u32,
    /// Size of the image, excluding the bitmap
    pub image_size: u32,
    /// Checksum of the matching oat file
    pub oat_checksum: u32,
    /// Address of the oat file
    pub oat_file_begin: u32,
    /// Address of the oat data
    pub oat_data_begin: u32,
    /// End of the oat data
    pub oat_data_end: u32,
    /// End of the oat file
    pub oat_file_end: u32,
    /// Address of the boot image an app image depends on
    pub boot_image_begin: u32,
    /// Size of that boot image
    pub boot_image_size: u32,
    /// Address of the boot oat file
    pub boot_oat_begin: u32,
    /// Size of the boot oat file
    pub boot_oat_size: u32,
    /// Address of the image roots array
    pub image_roots: u32,
    /// Size of native pointers in the image
    pub pointer_size: u32,
    /// Whether the image may be mapped at another address
    pub compile_pic: bool,
    /// Whether this is an app image
    pub is_app_image: bool,
    /// Payload storage
    pub storage_mode: StorageMode,
    /// Size of the stored payload
    pub data_size: u32,
    /// Section table
    pub sections: [SectionRange; ImageSection::COUNT],
}

impl ImageHeader {
    /// Serialized size.
    pub const SIZE: usize = 8 + 17 * 4 + ImageSection::COUNT * 8;

    /// Returns one entry of the section table.
    #[must_use]
    pub fn section(&self, section: ImageSection) -> SectionRange {
        self.sections[section as usize]
    }

    /// Returns the section table entry for update.
    pub fn section_mut(&mut self, section: ImageSection) -> &mut SectionRange {
        &mut self.sections[section as usize]
    }

    /// End of the object section.
    #[must_use]
    pub fn objects_end(&self) -> u32 {
        self.section(ImageSection::Objects).end()
    }

    /// Serializes the header.
    ///
    /// # Errors
    /// Never fails for a well-formed header; the buffer is sized by [`ImageHeader::SIZE`].
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut data = vec![0u8; Self::SIZE];
        let mut offset = 0;
        for byte in IMAGE_MAGIC.iter().chain(IMAGE_VERSION.iter()) {
            write_le_at(&mut data, &mut offset, *byte)?;
        }
        for value in self.fields() {
            write_le_at(&mut data, &mut offset, value)?;
        }
        for section in &self.sections {
            write_le_at(&mut data, &mut offset, section.offset)?;
            write_le_at(&mut data, &mut offset, section.size)?;
        }
        Ok(data)
    }

    /// Parses a header from the start of `data`.
    ///
    /// # Errors
    /// Returns [`crate::Error::OutOfBounds`] if `data` is too short and
    /// [`crate::Error::Malformed`] if the magic, version or storage mode is wrong.
    pub fn read(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(crate::Error::OutOfBounds);
        }
        if data[0..4] != IMAGE_MAGIC {
            return Err(malformed_error!("Invalid image magic {:?}", &data[0..4]));
        }
        if data[4..8] != IMAGE_VERSION {
            return Err(malformed_error!("Unsupported image version {:?}", &data[4..8]));
        }

        let mut offset = 8;
        let mut fields = [0u32; 17];
        for field in &mut fields {
            *field = read_le_at(data, &mut offset)?;
        }
        let mut sections = [SectionRange::default(); ImageSection::COUNT];
        for section in &mut sections {
            let start = read_le_at(data, &mut offset)?;
            let size = read_le_at(data, &mut offset)?;
            *section = SectionRange::new(start, size);
        }

        Ok(ImageHeader {
            image_begin: fields[0],
            image_size: fields[1],
            oat_checksum: fields[2],
            oat_file_begin: fields[3],
            oat_data_begin: fields[4],
            oat_data_end: fields[5],
            oat_file_end: fields[6],
            boot_image_begin: fields[7],
            boot_image_size: fields[8],
            boot_oat_begin: fields[9],
            boot_oat_size: fields[10],
            image_roots: fields[11],
            pointer_size: fields[12],
            compile_pic: fields[13] != 0,
            is_app_image: fields[14] != 0,
            storage_mode: StorageMode::from_raw(fields[15])?,
            data_size: fields[16],
            sections,
        })
    }

    fn fields(&self) -> [u32; 17] {
        [
            self.image_begin,
            self.image_size,
            self.oat_checksum,
            self.oat_file_begin,
            self.oat_data_begin,
            self.oat_data_end,
            self.oat_file_end,
            self.boot_image_begin,
            self.boot_image_size,
            self.boot_oat_begin,
            self.boot_oat_size,
            self.image_roots,
            self.pointer_size,
            u32::from(self.compile_pic),
            u32::from(self.is_app_image),
            self.storage_mode as u32,
            self.data_size,
        ]
    }
}
