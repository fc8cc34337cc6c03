//! Native code generation interface.
//!
//! The driver hands every method it decides to compile natively to a [`CodeGenerator`] together
//! with the resolved lowering information. [`StubCodeGenerator`] is the bundled implementation:
//! it emits deterministic placeholder code shaped like real output, with one linker patch per
//! directly reachable callee and per type or string literal known to be in the dex cache.

use std::collections::BTreeSet;

use crate::{
    compiler::{
        lowering::{FieldLoweringInfo, MethodLoweringInfo},
        CompiledMethod, DexCompilationUnit, DirectPointer, InstructionSet, LinkerPatch,
        PatchTarget,
    },
    dex::{AccessFlags, CodeItem, CodeIter, MethodReference, Opcode},
    runtime::VerifiedMethod,
    utils::{align_up, to_u32, write_unsigned_leb128},
    Result,
};

/// Everything a code generator gets to see about one method.
#[derive(Debug, Clone, Copy)]
pub struct MethodCompilationContext<'a> {
    /// The method and its declaring class
    pub unit: &'a DexCompilationUnit,
    /// The method body
    pub code_item: &'a CodeItem,
    /// Shorty of the method
    pub shorty: &'a str,
    /// Verification facts
    pub verified: &'a VerifiedMethod,
    /// Field references, in instruction order
    pub field_infos: &'a [FieldLoweringInfo],
    /// Invokes, in instruction order
    pub method_infos: &'a [MethodLoweringInfo],
    /// Type indices that may be loaded from the dex cache without a resolution check
    pub types_in_dex_cache: &'a BTreeSet<u32>,
    /// String indices that may be loaded from the dex cache without a resolution check
    pub strings_in_dex_cache: &'a BTreeSet<u32>,
    /// Whether the output must be position independent
    pub compile_pic: bool,
}

/// Generates native code for methods.
pub trait CodeGenerator: Send + Sync {
    /// Target of the generated code.
    fn instruction_set(&self) -> InstructionSet;

    /// Compiles a method; `Ok(None)` declines, leaving the method to the dex-to-dex pass.
    ///
    /// # Errors
    /// Returns an error if the method body cannot be decoded.
    fn compile(&self, ctx: &MethodCompilationContext<'_>) -> Result<Option<CompiledMethod>>;

    /// Compiles the transition stub of a native method.
    fn jni_compile(
        &self,
        method: MethodReference,
        access_flags: AccessFlags,
        shorty: &str,
    ) -> CompiledMethod;
}

/// Placeholder code generator.
#[derive(Debug, Clone, Copy)]
pub struct StubCodeGenerator {
    instruction_set: InstructionSet,
}

impl StubCodeGenerator {
    /// Size of the placeholder emitted per bytecode instruction.
    pub const INSTRUCTION_SIZE: usize = 4;
    /// Size of a patchable literal.
    pub const LITERAL_SIZE: usize = 4;

    /// Creates a generator for `instruction_set`.
    #[must_use]
    pub fn new(instruction_set: InstructionSet) -> Self {
        StubCodeGenerator { instruction_set }
    }

    fn emit_literal(
        code: &mut Vec<u8>,
        patches: &mut Vec<LinkerPatch>,
        target: PatchTarget,
        pc_relative: bool,
    ) -> Result<()> {
        patches.push(LinkerPatch {
            literal_offset: to_u32(code.len())?,
            target,
            pc_relative,
        });
        code.extend_from_slice(&[0; Self::LITERAL_SIZE]);
        Ok(())
    }
}

impl CodeGenerator for StubCodeGenerator {
    fn instruction_set(&self) -> InstructionSet {
        self.instruction_set
    }

    fn compile(&self, ctx: &MethodCompilationContext<'_>) -> Result<Option<CompiledMethod>> {
        if self.instruction_set == InstructionSet::None || ctx.code_item.insns.is_empty() {
            return Ok(None);
        }
        let dex_file = ctx.unit.dex_file;
        let mut code = Vec::with_capacity(ctx.code_item.insns.len() * Self::INSTRUCTION_SIZE);
        let mut patches = Vec::new();
        let mut stack_map = Vec::new();

        for instruction in CodeIter::new(&ctx.code_item.insns) {
            let instruction = instruction?;
            let opcode = instruction.opcode();
            let pc = instruction.pc();
            code.push(opcode.0);
            code.push(0);
            #[allow(clippy::cast_possible_truncation)]
            code.extend_from_slice(&(pc as u16).to_le_bytes());

            if opcode.is_invoke() {
                write_unsigned_leb128(&mut stack_map, pc);
                write_unsigned_leb128(&mut stack_map, to_u32(code.len())?);
                let info = ctx.method_infos.iter().find(|info| info.dex_pc() == pc);
                if let Some(info) = info {
                    if let (Some(target), DirectPointer::Linker { pc_relative }) =
                        (info.target(), info.direct_code())
                    {
                        let target = PatchTarget::Method(target);
                        Self::emit_literal(&mut code, &mut patches, target, pc_relative)?;
                    }
                }
                continue;
            }

            let Some(index) = instruction.index() else {
                continue;
            };
            match opcode {
                Opcode::CONST_STRING | Opcode::CONST_STRING_JUMBO
                    if ctx.strings_in_dex_cache.contains(&index) =>
                {
                    let target = PatchTarget::String {
                        dex_file,
                        string_idx: index,
                    };
                    Self::emit_literal(&mut code, &mut patches, target, ctx.compile_pic)?;
                }
                Opcode::CONST_CLASS | Opcode::NEW_INSTANCE | Opcode::CHECK_CAST
                    if ctx.types_in_dex_cache.contains(&index) =>
                {
                    if opcode == Opcode::CHECK_CAST && ctx.verified.is_safe_cast(pc) {
                        continue;
                    }
                    let target = PatchTarget::Type {
                        dex_file,
                        type_idx: index,
                    };
                    Self::emit_literal(&mut code, &mut patches, target, ctx.compile_pic)?;
                }
                _ => {}
            }
        }

        let registers = u32::from(ctx.code_item.registers_size);
        let frame_size = to_u32(align_up((registers as usize + 2) * 4, 16))?;
        let mut vmap_table = Vec::new();
        write_unsigned_leb128(&mut vmap_table, registers);
        write_unsigned_leb128(&mut vmap_table, u32::from(ctx.code_item.ins_size));
        write_unsigned_leb128(&mut vmap_table, to_u32(ctx.field_infos.len())?);
        let mut cfi = Vec::new();
        write_unsigned_leb128(&mut cfi, frame_size);

        Ok(Some(CompiledMethod::new(
            self.instruction_set,
            code,
            frame_size,
            stack_map,
            vmap_table,
            cfi,
            patches,
        )))
    }

    fn jni_compile(
        &self,
        method: MethodReference,
        access_flags: AccessFlags,
        shorty: &str,
    ) -> CompiledMethod {
        let mut code = Vec::with_capacity(align_up(shorty.len() + 8, 16));
        code.extend_from_slice(&method.index.to_le_bytes());
        code.extend_from_slice(&access_flags.bits().to_le_bytes());
        code.extend_from_slice(shorty.as_bytes());
        code.resize(align_up(code.len(), 16), 0);
        let frame_size = u32::try_from(align_up(shorty.len() * 8 + 16, 16)).unwrap_or(u32::MAX);
        CompiledMethod::new(
            self.instruction_set,
            code,
            frame_size,
            Vec::new(),
            Vec::new(),
            Vec::new(),
            Vec::new(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dex::{CodeBuilder, DexFileId},
        runtime::InvokeType,
    };

    fn unit() -> DexCompilationUnit {
        DexCompilationUnit {
            dex_file: DexFileId(2),
            class_def_idx: 0,
            method_idx: 9,
            access_flags: AccessFlags::STATIC,
            class: None,
            requires_constructor_barrier: false,
        }
    }

    #[test]
    fn test_stub_records_string_and_type_patches() {
        let mut code = CodeBuilder::new(2, 0);
        code.const_string(0, 4).new_instance(1, 6).const_class(1, 7).return_void();
        let code_item = code.build();
        let unit = unit();
        let verified = VerifiedMethod::new(unit.method_reference());
        let strings = BTreeSet::from([4]);
        let types = BTreeSet::from([6]);
        let ctx = MethodCompilationContext {
            unit: &unit,
            code_item: &code_item,
            shorty: "V",
            verified: &verified,
            field_infos: &[],
            method_infos: &[],
            types_in_dex_cache: &types,
            strings_in_dex_cache: &strings,
            compile_pic: true,
        };

        let method = StubCodeGenerator::new(InstructionSet::Arm64)
            .compile(&ctx)
            .unwrap()
            .unwrap();
        let targets: Vec<_> = method.patches().iter().map(|p| p.target).collect();
        assert_eq!(
            targets,
            vec![
                PatchTarget::String {
                    dex_file: DexFileId(2),
                    string_idx: 4
                },
                PatchTarget::Type {
                    dex_file: DexFileId(2),
                    type_idx: 6
                },
            ]
        );
        assert!(method.patches().iter().all(|p| p.pc_relative));
        assert_eq!(method.patches()[0].literal_offset, 4);
        assert_eq!(method.code().len(), 4 * 4 + 2 * 4);
        assert_eq!(method.frame_size() % 16, 0);
    }

    #[test]
    fn test_stub_patches_linker_calls_only() {
        let mut code = CodeBuilder::new(1, 1);
        code.invoke(Opcode::INVOKE_STATIC, &[], 3).return_void();
        let code_item = code.build();
        let unit = unit();
        let verified = VerifiedMethod::new(unit.method_reference());
        let infos = [MethodLoweringInfo::new(3, 0, InvokeType::Static)];
        let empty = BTreeSet::new();
        let ctx = MethodCompilationContext {
            unit: &unit,
            code_item: &code_item,
            shorty: "V",
            verified: &verified,
            field_infos: &[],
            method_infos: &infos,
            types_in_dex_cache: &empty,
            strings_in_dex_cache: &empty,
            compile_pic: false,
        };
        let method = StubCodeGenerator::new(InstructionSet::X86_64)
            .compile(&ctx)
            .unwrap()
            .unwrap();
        assert!(method.patches().is_empty());
        assert!(!method.stack_map().is_empty());
    }

    #[test]
    fn test_no_target_declines() {
        let code_item = CodeBuilder::new(0, 0).return_void().build();
        let unit = unit();
        let verified = VerifiedMethod::new(unit.method_reference());
        let empty = BTreeSet::new();
        let ctx = MethodCompilationContext {
            unit: &unit,
            code_item: &code_item,
            shorty: "V",
            verified: &verified,
            field_infos: &[],
            method_infos: &[],
            types_in_dex_cache: &empty,
            strings_in_dex_cache: &empty,
            compile_pic: false,
        };
        assert!(StubCodeGenerator::new(InstructionSet::None)
            .compile(&ctx)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_jni_stub() {
        let stub = StubCodeGenerator::new(InstructionSet::Arm).jni_compile(
            MethodReference::new(DexFileId(0), 5),
            AccessFlags::NATIVE | AccessFlags::STATIC,
            "VIL",
        );
        assert_eq!(stub.code().len() % 16, 0);
        assert!(!stub.is_dex_to_dex());
        assert_eq!(stub.frame_size(), 48);
    }
}
