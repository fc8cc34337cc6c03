// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
#![allow(clippy::too_many_arguments)]

//! # oatforge
//!
//! An ahead-of-time compiler driver and heap image writer for register-based bytecode files.
//!
//! `oatforge` takes a batch of bytecode files, resolves, verifies and initializes their classes
//! against a reference runtime, compiles their methods through a pluggable code generator, and
//! finally snapshots the resulting managed heap into boot or app images that a runtime can map
//! at a fixed address without any parsing.
//!
//! ## Features
//!
//! - **Parallel phases** - Resolution, verification, initialization and compilation run on a
//!   `rayon` pool, deterministically when asked to
//! - **Transactional initialization** - Static initializers of image classes run at compile time
//!   and are rolled back when they touch anything they must not
//! - **Bytecode quickening** - Methods the backend declines are rewritten in place with
//!   resolved offsets and vtable indices
//! - **Image writing** - Class pruning, bin-based layout, pointer relocation, optional LZ4
//!   payload compression
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use oatforge::prelude::*;
//!
//! let mut dex = DexFileBuilder::new("app.dex");
//! dex.class("LApp;").superclass("Ljava/lang/Object;").finish();
//!
//! let runtime = Runtime::new(vec![dex.build()])?;
//! let boot_class_path = runtime.class_linker().boot_class_path().to_vec();
//! let driver = CompilerDriver::with_stub_backend(CompilerOptions::boot_image(), runtime, boot_class_path)?;
//! driver.compile_all()?;
//!
//! let mut writer = ImageWriter::new(&driver, ImageWriterOptions::boot_image())?;
//! writer.prepare_image_address_space()?;
//! writer.write(&["boot.art"])?;
//! # Ok::<(), oatforge::Error>(())
//! ```
//!
//! ## Architecture
//!
//! ```text
//!  bytecode files ──► dex ──► runtime ──► compiler ──► image
//!                     │        │           │            │
//!                     │        │           │            └─ ImageWriter, bins, relocation
//!                     │        │           └─ CompilerDriver, lowering, quickening
//!                     │        └─ heap, class linker, verifier, interpreter
//!                     └─ file model, builder, instruction layer
//! ```

#[macro_use]
pub(crate) mod macros;

#[macro_use]
pub(crate) mod error;

/// Shared functionality which is used in unit tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types.
///
/// # Example
///
/// ```rust,no_run
/// use oatforge::prelude::*;
///
/// let runtime = Runtime::new(Vec::new())?;
/// assert!(runtime.class_linker().lookup_class("Ljava/lang/Object;", None).is_some());
/// # Ok::<(), oatforge::Error>(())
/// ```
pub mod prelude;

/// Bytecode files: the file model, a builder for constructing files and the instruction layer.
///
/// # Key Types
///
/// - [`dex::DexFile`] - A parsed, immutable bytecode file
/// - [`dex::DexFileBuilder`] - Programmatic construction of files
/// - [`dex::MethodReference`] / [`dex::ClassReference`] - Identity keys used across the crate
pub mod dex;

/// The reference runtime: heap, class linker, verifier and class initialization.
pub mod runtime;

/// The compiler driver and its phases.
pub mod compiler;

/// Boot and app image writing.
pub mod image;

/// Shared low level helpers: little endian IO, LEB128, alignment and bit sets.
pub mod utils;

/// `oatforge` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `oatforge` Error type
///
/// The main error type for all operations in this crate.
///
/// # Examples
///
/// ```rust,no_run
/// use oatforge::{prelude::*, Error};
///
/// let runtime = Runtime::new(Vec::new())?;
/// let driver = CompilerDriver::with_stub_backend(CompilerOptions::default(), runtime, Vec::new())?;
/// match driver.compile_all() {
///     Ok(()) => println!("compiled"),
///     Err(Error::HardVerifierFailure(count)) => println!("{count} classes failed verification"),
///     Err(e) => println!("Error: {}", e),
/// }
/// # Ok::<(), oatforge::Error>(())
/// ```
pub use error::Error;
