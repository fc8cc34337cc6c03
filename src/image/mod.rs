//! Boot and app image writing.
//!
//! An image is a snapshot of the runtime heap, plus the native structures classes point to,
//! laid out at fixed addresses so that a runtime can map it and use it without any parsing.
//! Writing one goes through a fixed sequence of states:
//!
//! ```text
//!  new ──► prepare_image_address_space ──► update_oat_file_layout* ──► write
//!           │                                                           │
//!           ├─ prune classes outside the image set                      ├─ copy objects
//!           ├─ resolve lazy fields (class names)                        ├─ relocate references
//!           ├─ collect garbage                                          │  and native pointers
//!           ├─ assign bin slots (objects and natives)                   ├─ write intern and
//!           └─ bins ──► offsets ──► sections ──► addresses              │  class tables
//!                                                                       └─ compress, write files
//! ```
//!
//! Each image file is an [`ImageHeader`] followed by the (possibly compressed) image payload
//! and the live object bitmap. Several images can be written in one run, one per oat file;
//! bytecode files are assigned to images through
//! [`ImageWriterOptions::dex_file_oat_index`].
//!
//! # Key Types
//!
//! - [`ImageWriter`] - Drives layout and output
//! - [`ImageWriterOptions`] - Addresses, image kind and storage mode
//! - [`Bin`] / [`BinSlot`] - Object categories and per-category placement
//! - [`ImageHeader`] - The fixed file header and its sections
//! - [`BootImageLayout`] - Addresses handed out by a boot image, for app images built on it
//! - [`ClassPruner`] - Decides which classes may be part of the image

/// Object and native structure categories
pub mod bin;
/// Copying and relocation into image buffers
mod fixup;
/// The image file header
pub mod header;
/// Per-image layout state
pub mod info;
/// Bin slot assignment and section layout
mod layout;
/// Writer configuration
pub mod options;
/// Atomic file output
pub mod output;
/// Class pruning
pub mod prune;
/// The image writer
pub mod writer;

pub use bin::{Bin, BinSlot};
pub use header::{ImageHeader, ImageSection, SectionRange, StorageMode};
pub use info::{ImageInfo, OatFileLayout, Trampolines};
pub use options::{BootImageLayout, ImageWriterOptions, DEFAULT_IMAGE_BEGIN, PAGE_SIZE};
pub use output::Output;
pub use prune::ClassPruner;
pub use writer::{ImageWriter, NativeObjectRelocation, NativeObjectRelocationType};
