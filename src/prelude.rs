//! # oatforge Prelude
//!
//! This module provides a convenient prelude for the most commonly used types from the
//! oatforge library. Import it to get quick access to everything needed to build bytecode
//! files, compile them and write images.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all oatforge operations
pub use crate::Error;

/// The result type used throughout oatforge
pub use crate::Result;

// ================================================================================================
// Bytecode Files
// ================================================================================================

/// File model and identity keys
pub use crate::dex::{
    AccessFlags, ClassReference, DexFile, DexFileId, MethodReference,
};

/// Programmatic construction of bytecode files
pub use crate::dex::{CodeBuilder, DexFileBuilder};

/// Instruction layer
pub use crate::dex::{decode_instruction, Instruction, Opcode};

// ================================================================================================
// Runtime
// ================================================================================================

/// Heap, class linker and their handles
pub use crate::runtime::{
    ClassId, ClassLinker, ClassStatus, Heap, HeapObject, ObjectId, ObjectKind, Runtime,
};

// ================================================================================================
// Compiler
// ================================================================================================

/// Driver and configuration
pub use crate::compiler::{
    CompilerDriver, CompilerFilter, CompilerOptions, ImageKind, InstructionSet,
};

/// Backend interface and artifacts
pub use crate::compiler::{
    AotCompilationStats, CodeGenerator, CompiledClass, CompiledMethod, StubCodeGenerator,
};

// ================================================================================================
// Images
// ================================================================================================

/// Image writer and configuration
pub use crate::image::{
    Bin, BootImageLayout, ImageHeader, ImageSection, ImageWriter, ImageWriterOptions,
    OatFileLayout, StorageMode,
};
