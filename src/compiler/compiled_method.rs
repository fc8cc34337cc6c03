//! Compiled artifacts recorded by the driver.

use crate::{
    compiler::InstructionSet,
    dex::{DexFileId, MethodReference},
    runtime::ClassStatus,
};

/// What a [`LinkerPatch`] points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatchTarget {
    /// Entry point of a method
    Method(MethodReference),
    /// The class of a type index
    Type {
        /// File of the type index
        dex_file: DexFileId,
        /// Type index
        type_idx: u32,
    },
    /// The interned string of a string index
    String {
        /// File of the string index
        dex_file: DexFileId,
        /// String index
        string_idx: u32,
    },
}

/// A relocatable reference inside a method's code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkerPatch {
    /// Offset of the literal within the code
    pub literal_offset: u32,
    /// Referenced entity
    pub target: PatchTarget,
    /// Whether the literal is relative to the patched instruction
    pub pc_relative: bool,
}

/// Output of compiling one method.
///
/// Dex-to-dex results carry no code; their vmap table is the LEB128 stream of
/// `(dex pc, original index)` pairs needed to undo quickening. Native results carry code and a
/// vmap table describing the frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledMethod {
    instruction_set: InstructionSet,
    code: Vec<u8>,
    frame_size: u32,
    stack_map: Vec<u8>,
    vmap_table: Vec<u8>,
    cfi: Vec<u8>,
    patches: Vec<LinkerPatch>,
}

impl CompiledMethod {
    /// Creates a natively compiled method.
    #[must_use]
    pub fn new(
        instruction_set: InstructionSet,
        code: Vec<u8>,
        frame_size: u32,
        stack_map: Vec<u8>,
        vmap_table: Vec<u8>,
        cfi: Vec<u8>,
        patches: Vec<LinkerPatch>,
    ) -> Self {
        CompiledMethod {
            instruction_set,
            code,
            frame_size,
            stack_map,
            vmap_table,
            cfi,
            patches,
        }
    }

    /// Creates a metadata-only result of the dex-to-dex optimizer.
    #[must_use]
    pub fn dex_to_dex(instruction_set: InstructionSet, vmap_table: Vec<u8>) -> Self {
        Self::new(
            instruction_set,
            Vec::new(),
            0,
            Vec::new(),
            vmap_table,
            Vec::new(),
            Vec::new(),
        )
    }

    /// Target instruction set.
    #[must_use]
    pub fn instruction_set(&self) -> InstructionSet {
        self.instruction_set
    }

    /// Machine code; empty for dex-to-dex results.
    #[must_use]
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Frame size in bytes.
    #[must_use]
    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    /// Stack map bytes.
    #[must_use]
    pub fn stack_map(&self) -> &[u8] {
        &self.stack_map
    }

    /// Vmap table bytes.
    #[must_use]
    pub fn vmap_table(&self) -> &[u8] {
        &self.vmap_table
    }

    /// Call frame information.
    #[must_use]
    pub fn cfi(&self) -> &[u8] {
        &self.cfi
    }

    /// Linker patches, ordered by literal offset.
    #[must_use]
    pub fn patches(&self) -> &[LinkerPatch] {
        &self.patches
    }

    /// Returns `true` for dex-to-dex results.
    #[must_use]
    pub fn is_dex_to_dex(&self) -> bool {
        self.code.is_empty()
    }
}

/// Compile-time status of a class definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompiledClass {
    status: ClassStatus,
}

impl CompiledClass {
    /// Creates a record.
    #[must_use]
    pub fn new(status: ClassStatus) -> Self {
        CompiledClass { status }
    }

    /// Recorded status.
    #[must_use]
    pub fn status(&self) -> ClassStatus {
        self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dex_to_dex_has_no_code() {
        let method = CompiledMethod::dex_to_dex(InstructionSet::Arm64, vec![0, 1]);
        assert!(method.is_dex_to_dex());
        assert_eq!(method.vmap_table(), &[0, 1]);
        assert!(method.patches().is_empty());
        assert_eq!(method.frame_size(), 0);
    }

    #[test]
    fn test_native_method() {
        let patch = LinkerPatch {
            literal_offset: 4,
            target: PatchTarget::Method(MethodReference::new(DexFileId(1), 3)),
            pc_relative: true,
        };
        let method = CompiledMethod::new(
            InstructionSet::X86_64,
            vec![0x90; 8],
            32,
            Vec::new(),
            Vec::new(),
            Vec::new(),
            vec![patch],
        );
        assert!(!method.is_dex_to_dex());
        assert_eq!(method.patches()[0], patch);
    }
}
