//! Bytecode-to-bytecode optimization ("quickening").
//!
//! Methods that are not compiled to native code still benefit from work done ahead of time.
//! The optimizer rewrites their instruction stream in place:
//!
//! - `return-void` in an instance constructor becomes `return-void-no-barrier` when the class has
//!   no `final` instance field
//! - `check-cast` proven safe by the verifier becomes two `nop`s
//! - `iget*`/`iput*` on fast-path fields become `*-quick` variants carrying the byte offset
//! - `invoke-virtual[/range]` become `invoke-virtual-quick[/range]` carrying the vtable index
//!
//! The last two lose the symbolic index, so every rewrite records a [`QuickenedInfo`]. The list is
//! emitted as the vmap table of a code-less [`CompiledMethod`], a flat unsigned LEB128 stream of
//! `(dex pc, original index)` pairs in increasing pc order. A method without any such rewrite
//! gets no [`CompiledMethod`] at all.

use crate::{
    compiler::{
        lowering::InstanceFieldInfo, sharpening::InvokeInfo, AotCompilationStats,
        CompiledMethod, DexCompilationUnit, InstructionSet,
    },
    dex::{decode_instruction, InstructionMut, Opcode},
    runtime::InvokeType,
    utils::{read_unsigned_leb128, write_unsigned_leb128},
    Result,
};

/// How aggressively a method is optimized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DexToDexCompilationLevel {
    /// Leave the method alone
    DontCompile,
    /// Only rewrites that are valid without verification facts
    Required,
    /// Every rewrite
    Optimize,
}

/// A quickened instruction and the symbolic index it replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuickenedInfo {
    /// Pc of the rewritten instruction
    pub dex_pc: u32,
    /// Field or method index the instruction carried before
    pub dex_member_index: u16,
}

/// Facts the optimizer needs about the method being rewritten.
pub trait QuickeningOracle {
    /// Returns `true` if the `check-cast` at `dex_pc` cannot fail.
    fn is_safe_cast(&self, dex_pc: u32) -> bool;

    /// Resolves the instance field `field_idx` for a read or a write.
    fn instance_field_info(&mut self, field_idx: u32, is_put: bool) -> Option<InstanceFieldInfo>;

    /// Resolves the invoke of `method_idx` at `dex_pc` without devirtualization.
    fn invoke_info(&mut self, dex_pc: u32, method_idx: u32) -> Option<InvokeInfo>;
}

/// Rewrites `insns` in place and returns the quickening metadata, if any.
///
/// # Errors
/// Returns an error if an instruction cannot be decoded; `insns` may be partially rewritten.
pub fn dex_to_dex_compile(
    insns: &mut [u16],
    unit: &DexCompilationUnit,
    level: DexToDexCompilationLevel,
    instruction_set: InstructionSet,
    oracle: &mut dyn QuickeningOracle,
    stats: &mut AotCompilationStats,
) -> Result<Option<CompiledMethod>> {
    if level == DexToDexCompilationLevel::DontCompile {
        return Ok(None);
    }
    let optimize = level >= DexToDexCompilationLevel::Optimize;
    let mut quickened = Vec::new();

    let mut pc = 0u32;
    while (pc as usize) < insns.len() {
        let (opcode, size, index) = {
            let instruction = decode_instruction(insns, pc)?;
            (
                instruction.opcode(),
                instruction.size_in_code_units(),
                instruction.index(),
            )
        };

        match opcode {
            Opcode::RETURN_VOID => {
                if unit.is_instance_constructor() && !unit.requires_constructor_barrier {
                    InstructionMut::at(insns, pc)?.set_opcode(Opcode::RETURN_VOID_NO_BARRIER);
                    stats.constructor_barriers_elided += 1;
                }
            }
            Opcode::CHECK_CAST if optimize => {
                if oracle.is_safe_cast(pc) {
                    InstructionMut::at(insns, pc)?.fill_nops();
                    stats.safe_casts += 1;
                } else {
                    stats.not_safe_casts += 1;
                }
            }
            Opcode::INVOKE_VIRTUAL | Opcode::INVOKE_VIRTUAL_RANGE if optimize => {
                if let Some(method_idx) = index {
                    if let Some(info) = quicken_invoke(insns, pc, opcode, method_idx, oracle)? {
                        quickened.push(info);
                        stats.quickened_invokes += 1;
                    }
                }
            }
            op if optimize && op.quickened_field_opcode().is_some() => {
                if let Some(field_idx) = index {
                    if let Some(info) = quicken_field(insns, pc, op, field_idx, oracle)? {
                        quickened.push(info);
                        stats.quickened_field_accesses += 1;
                    }
                }
            }
            _ => {}
        }

        #[allow(clippy::cast_possible_truncation)]
        {
            pc += size as u32;
        }
    }

    if quickened.is_empty() {
        return Ok(None);
    }
    stats.dex_to_dex_methods += 1;
    Ok(Some(CompiledMethod::dex_to_dex(
        instruction_set,
        encode_quickening_info(&quickened),
    )))
}

fn quicken_field(
    insns: &mut [u16],
    pc: u32,
    opcode: Opcode,
    field_idx: u32,
    oracle: &mut dyn QuickeningOracle,
) -> Result<Option<QuickenedInfo>> {
    let (Some(quick), Ok(member)) = (opcode.quickened_field_opcode(), u16::try_from(field_idx))
    else {
        return Ok(None);
    };
    let is_put = opcode.is_instance_put();
    let Some(field) = oracle.instance_field_info(field_idx, is_put) else {
        return Ok(None);
    };
    let fast = if is_put { field.fast_put } else { field.fast_get };
    let Ok(offset) = u16::try_from(field.offset) else {
        return Ok(None);
    };
    if !fast || field.is_volatile {
        return Ok(None);
    }

    let mut instruction = InstructionMut::at(insns, pc)?;
    instruction.set_opcode(quick);
    instruction.set_vreg_c(offset);
    Ok(Some(QuickenedInfo {
        dex_pc: pc,
        dex_member_index: member,
    }))
}

fn quicken_invoke(
    insns: &mut [u16],
    pc: u32,
    opcode: Opcode,
    method_idx: u32,
    oracle: &mut dyn QuickeningOracle,
) -> Result<Option<QuickenedInfo>> {
    let Ok(member) = u16::try_from(method_idx) else {
        return Ok(None);
    };
    let Some(invoke) = oracle.invoke_info(pc, method_idx) else {
        return Ok(None);
    };
    if invoke.sharp_type != InvokeType::Virtual {
        return Ok(None);
    }
    let Ok(vtable_idx) = u16::try_from(invoke.vtable_idx) else {
        return Ok(None);
    };

    let quick = if opcode == Opcode::INVOKE_VIRTUAL_RANGE {
        Opcode::INVOKE_VIRTUAL_RANGE_QUICK
    } else {
        Opcode::INVOKE_VIRTUAL_QUICK
    };
    let mut instruction = InstructionMut::at(insns, pc)?;
    instruction.set_opcode(quick);
    instruction.set_vreg_b(vtable_idx);
    Ok(Some(QuickenedInfo {
        dex_pc: pc,
        dex_member_index: member,
    }))
}

/// Encodes quickening entries as the vmap table of a dex-to-dex result.
#[must_use]
pub fn encode_quickening_info(entries: &[QuickenedInfo]) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.len() * 3);
    for entry in entries {
        write_unsigned_leb128(&mut out, entry.dex_pc);
        write_unsigned_leb128(&mut out, u32::from(entry.dex_member_index));
    }
    out
}

/// Decodes the vmap table of a dex-to-dex result.
///
/// # Errors
/// Returns an error if the stream is truncated or an index does not fit 16 bits.
pub fn decode_quickening_info(vmap_table: &[u8]) -> Result<Vec<QuickenedInfo>> {
    let mut entries = Vec::new();
    let mut offset = 0;
    while offset < vmap_table.len() {
        let dex_pc = read_unsigned_leb128(vmap_table, &mut offset)?;
        let index = read_unsigned_leb128(vmap_table, &mut offset)?;
        let dex_member_index = u16::try_from(index)
            .map_err(|_| malformed_error!("Quickened index {} does not fit 16 bits", index))?;
        entries.push(QuickenedInfo {
            dex_pc,
            dex_member_index,
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::{
        compiler::DirectPointer,
        dex::{AccessFlags, CodeBuilder, DexFileId, MethodReference},
        runtime::{ArtFieldId, ArtMethodId, ClassId},
    };

    #[derive(Default)]
    struct FakeOracle {
        safe_casts: Vec<u32>,
        fields: BTreeMap<u32, (u32, bool)>,
        vtable: BTreeMap<u32, (InvokeType, u32)>,
    }

    impl QuickeningOracle for FakeOracle {
        fn is_safe_cast(&self, dex_pc: u32) -> bool {
            self.safe_casts.contains(&dex_pc)
        }

        fn instance_field_info(&mut self, field_idx: u32, _is_put: bool) -> Option<InstanceFieldInfo> {
            let &(offset, is_volatile) = self.fields.get(&field_idx)?;
            Some(InstanceFieldInfo {
                field: ArtFieldId {
                    class: ClassId(0),
                    is_static: false,
                    index: 0,
                },
                offset,
                is_volatile,
                fast_get: true,
                fast_put: true,
            })
        }

        fn invoke_info(&mut self, _dex_pc: u32, method_idx: u32) -> Option<InvokeInfo> {
            let &(sharp_type, vtable_idx) = self.vtable.get(&method_idx)?;
            Some(InvokeInfo {
                invoke_type: InvokeType::Virtual,
                sharp_type,
                target: MethodReference::new(DexFileId(0), method_idx),
                method: ArtMethodId {
                    class: ClassId(0),
                    index: 0,
                },
                vtable_idx,
                direct_code: DirectPointer::None,
                direct_method: DirectPointer::None,
            })
        }
    }

    fn unit(access_flags: AccessFlags, requires_constructor_barrier: bool) -> DexCompilationUnit {
        DexCompilationUnit {
            dex_file: DexFileId(0),
            class_def_idx: 0,
            method_idx: 0,
            access_flags,
            class: None,
            requires_constructor_barrier,
        }
    }

    fn compile(
        insns: &mut [u16],
        unit: &DexCompilationUnit,
        level: DexToDexCompilationLevel,
        oracle: &mut FakeOracle,
    ) -> Option<CompiledMethod> {
        let mut stats = AotCompilationStats::new();
        dex_to_dex_compile(insns, unit, level, InstructionSet::Arm64, oracle, &mut stats).unwrap()
    }

    #[test]
    fn test_arithmetic_only_produces_nothing() {
        let mut code = CodeBuilder::new(3, 0);
        code.const4(0, 1).const4(1, 2).add_int(2, 0, 1).return_void();
        let mut insns = code.build().insns;
        let before = insns.clone();

        let result = compile(
            &mut insns,
            &unit(AccessFlags::STATIC, false),
            DexToDexCompilationLevel::Optimize,
            &mut FakeOracle::default(),
        );
        assert!(result.is_none());
        assert_eq!(insns, before);
    }

    #[test]
    fn test_safe_check_cast_becomes_two_nops() {
        let mut code = CodeBuilder::new(2, 1);
        code.check_cast(1, 3).move_object(0, 1).return_void();
        let mut insns = code.build().insns;
        let next = decode_instruction(&insns, 2).unwrap().opcode();
        assert_eq!(next, Opcode::MOVE_OBJECT);

        let mut oracle = FakeOracle {
            safe_casts: vec![0],
            ..FakeOracle::default()
        };
        let result = compile(
            &mut insns,
            &unit(AccessFlags::STATIC, false),
            DexToDexCompilationLevel::Optimize,
            &mut oracle,
        );

        assert!(result.is_none());
        assert_eq!(&insns[0..2], &[u16::from(Opcode::NOP.0); 2]);
        assert_eq!(decode_instruction(&insns, 2).unwrap().opcode(), Opcode::MOVE_OBJECT);
    }

    #[test]
    fn test_check_cast_kept_at_required_level() {
        let mut code = CodeBuilder::new(2, 1);
        code.check_cast(1, 3).return_void();
        let mut insns = code.build().insns;
        let before = insns.clone();
        let mut oracle = FakeOracle {
            safe_casts: vec![0],
            ..FakeOracle::default()
        };
        compile(
            &mut insns,
            &unit(AccessFlags::STATIC, false),
            DexToDexCompilationLevel::Required,
            &mut oracle,
        );
        assert_eq!(insns, before);
    }

    #[test]
    fn test_field_offset_boundary() {
        let mut code = CodeBuilder::new(2, 1);
        code.instance_field_op(Opcode::IGET, 0, 1, 7)
            .instance_field_op(Opcode::IPUT, 0, 1, 8)
            .return_void();
        let mut insns = code.build().insns;
        let mut oracle = FakeOracle::default();
        oracle.fields.insert(7, (0xFFFF, false));
        oracle.fields.insert(8, (0x1_0000, false));

        let result = compile(
            &mut insns,
            &unit(AccessFlags::empty(), false),
            DexToDexCompilationLevel::Optimize,
            &mut oracle,
        )
        .unwrap();

        let first = decode_instruction(&insns, 0).unwrap();
        assert_eq!(first.opcode(), Opcode::IGET_QUICK);
        assert_eq!(first.vreg_c(), 0xFFFF);
        let second = decode_instruction(&insns, 2).unwrap();
        assert_eq!(second.opcode(), Opcode::IPUT);
        assert_eq!(second.index(), Some(8));

        let entries = decode_quickening_info(result.vmap_table()).unwrap();
        assert_eq!(
            entries,
            vec![QuickenedInfo {
                dex_pc: 0,
                dex_member_index: 7
            }]
        );
    }

    #[test]
    fn test_volatile_field_not_quickened() {
        let mut code = CodeBuilder::new(2, 1);
        code.instance_field_op(Opcode::IGET, 0, 1, 7).return_void();
        let mut insns = code.build().insns;
        let mut oracle = FakeOracle::default();
        oracle.fields.insert(7, (12, true));
        let result = compile(
            &mut insns,
            &unit(AccessFlags::empty(), false),
            DexToDexCompilationLevel::Optimize,
            &mut oracle,
        );
        assert!(result.is_none());
        assert_eq!(decode_instruction(&insns, 0).unwrap().opcode(), Opcode::IGET);
    }

    #[test]
    fn test_invoke_virtual_quickened_only_when_still_virtual() {
        let mut code = CodeBuilder::new(1, 1);
        code.invoke(Opcode::INVOKE_VIRTUAL, &[0], 4)
            .invoke(Opcode::INVOKE_VIRTUAL, &[0], 5)
            .invoke_range(Opcode::INVOKE_VIRTUAL_RANGE, 0, 1, 4)
            .return_void();
        let mut insns = code.build().insns;
        let mut oracle = FakeOracle::default();
        oracle.vtable.insert(4, (InvokeType::Virtual, 11));
        oracle.vtable.insert(5, (InvokeType::Direct, 12));

        let result = compile(
            &mut insns,
            &unit(AccessFlags::empty(), false),
            DexToDexCompilationLevel::Optimize,
            &mut oracle,
        )
        .unwrap();

        let first = decode_instruction(&insns, 0).unwrap();
        assert_eq!(first.opcode(), Opcode::INVOKE_VIRTUAL_QUICK);
        assert_eq!(first.index(), Some(11));
        assert_eq!(decode_instruction(&insns, 3).unwrap().opcode(), Opcode::INVOKE_VIRTUAL);
        assert_eq!(
            decode_instruction(&insns, 6).unwrap().opcode(),
            Opcode::INVOKE_VIRTUAL_RANGE_QUICK
        );

        let entries = decode_quickening_info(result.vmap_table()).unwrap();
        let pcs: Vec<u32> = entries.iter().map(|e| e.dex_pc).collect();
        assert_eq!(pcs, vec![0, 6]);
        assert!(entries.iter().all(|e| e.dex_member_index == 4));
    }

    #[test]
    fn test_constructor_barrier_elision() {
        let mut insns = CodeBuilder::new(1, 1).return_void().build().insns;
        let ctor = AccessFlags::CONSTRUCTOR | AccessFlags::PUBLIC;
        let result = compile(
            &mut insns,
            &unit(ctor, false),
            DexToDexCompilationLevel::Required,
            &mut FakeOracle::default(),
        );
        assert!(result.is_none());
        assert_eq!(insns[0] & 0xFF, u16::from(Opcode::RETURN_VOID_NO_BARRIER.0));

        let mut insns = CodeBuilder::new(1, 1).return_void().build().insns;
        compile(
            &mut insns,
            &unit(ctor, true),
            DexToDexCompilationLevel::Optimize,
            &mut FakeOracle::default(),
        );
        assert_eq!(insns[0] & 0xFF, u16::from(Opcode::RETURN_VOID.0));
    }

    #[test]
    fn test_quickening_info_encoding() {
        let entries = vec![
            QuickenedInfo {
                dex_pc: 0,
                dex_member_index: 300,
            },
            QuickenedInfo {
                dex_pc: 200,
                dex_member_index: 1,
            },
        ];
        let encoded = encode_quickening_info(&entries);
        assert_eq!(encoded, vec![0x00, 0xAC, 0x02, 0xC8, 0x01, 0x01]);
        assert_eq!(decode_quickening_info(&encoded).unwrap(), entries);
        assert!(decode_quickening_info(&[0x80]).is_err());
    }
}
