//! Bytecode file model and instruction layer.
//!
//! This module provides everything the compiler and the runtime need to know about input
//! files:
//!
//! - [`DexFile`] and its tables ([`ClassDef`], [`CodeItem`], [`FieldId`], [`MethodId`])
//! - [`DexFileBuilder`] for constructing files programmatically
//! - [`MethodReference`] / [`ClassReference`] identity keys
//! - The instruction layer: [`OPCODES`], [`decode_instruction`], [`InstructionMut`] and
//!   [`CodeIter`]

mod builder;
mod file;
mod instruction;
mod reference;

pub use builder::{ClassBuilder, CodeBuilder, DexFileBuilder};
pub use file::{
    descriptor_size, descriptor_to_name, is_reference_descriptor, AccessFlags, CatchHandler,
    ClassDef, CodeItem, DexFile, DexFileId, EncodedField, EncodedMethod, FieldId, MethodId,
    TryItem,
};
pub use instruction::{
    decode_instruction, instruction_size, CodeIter, Format, Instruction, InstructionMut, Opcode,
    OpcodeInfo, ARRAY_DATA_SIGNATURE, OPCODES, PACKED_SWITCH_SIGNATURE, SPARSE_SWITCH_SIGNATURE,
};
pub use reference::{ClassReference, MethodReference};
