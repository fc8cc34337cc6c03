//! Structural bytecode verifier.
//!
//! The verifier decides whether the methods of a class may be compiled ahead of time and what
//! the compiler may assume about them. It distinguishes two kinds of problems:
//!
//! - **Hard failures** make the class unusable: an instruction does not decode, an index points
//!   outside its table, a branch lands inside another instruction, a register is out of range,
//!   or control falls off the end of the code. The class ends up in [`ClassStatus::Error`].
//! - **Soft failures** only mean that some instruction will throw at runtime (an unresolvable
//!   class, field or method, an inaccessible member, an incompatible class change). They are
//!   recorded as [`VerifyFailures`] on the [`VerifiedMethod`] and leave the class in
//!   [`ClassStatus::RetryVerificationAtRuntime`].
//!
//! Alongside the checks, a forward scan tracks the class of reference registers wherever it is
//! known without merging control flow. It certifies `check-cast` instructions that cannot fail
//! and records invoke sites whose target is statically known, both of which the compiler
//! consumes through the [`VerifiedMethod`].

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use bitflags::bitflags;
use rustc_hash::FxHashMap;

use crate::{
    dex::{
        AccessFlags, CodeItem, CodeIter, DexFile, DexFileId, EncodedMethod, Format, Instruction,
        MethodReference, Opcode, PACKED_SWITCH_SIGNATURE, SPARSE_SWITCH_SIGNATURE,
    },
    runtime::{
        class::{ArtFieldId, ArtMethodId, ClassId, ClassStatus, InvokeType},
        class_linker::ClassLinker,
        heap::Heap,
    },
    utils::BitSet,
    Error,
};

bitflags! {
    /// Soft failure categories recorded for a method.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct VerifyFailures: u32 {
        /// A referenced class could not be resolved
        const NO_CLASS = 1 << 0;
        /// A referenced field could not be resolved
        const NO_FIELD = 1 << 1;
        /// A referenced method could not be resolved
        const NO_METHOD = 1 << 2;
        /// A referenced class is not accessible from the method
        const ACCESS_CLASS = 1 << 3;
        /// A referenced field is not accessible from the method
        const ACCESS_FIELD = 1 << 4;
        /// A referenced method is not accessible from the method
        const ACCESS_METHOD = 1 << 5;
        /// A reference resolved to a member of the wrong kind
        const CLASS_CHANGE = 1 << 6;
        /// `new-instance` of an abstract class or interface
        const INSTANTIATION = 1 << 7;
        /// Monitor enter and exit instructions do not balance
        const LOCKING = 1 << 8;
        /// The method uses instructions only the interpreter supports
        const FORCE_INTERPRETER = 1 << 9;
    }
}

impl VerifyFailures {
    /// Failures that make some instruction throw at runtime.
    pub const RUNTIME_THROW: VerifyFailures = VerifyFailures::NO_CLASS
        .union(VerifyFailures::NO_FIELD)
        .union(VerifyFailures::NO_METHOD)
        .union(VerifyFailures::ACCESS_CLASS)
        .union(VerifyFailures::ACCESS_FIELD)
        .union(VerifyFailures::ACCESS_METHOD)
        .union(VerifyFailures::CLASS_CHANGE)
        .union(VerifyFailures::INSTANTIATION);

    fn from_error(error: &Error, unresolved: VerifyFailures) -> VerifyFailures {
        match error {
            Error::IncompatibleClassChange(_) => VerifyFailures::CLASS_CHANGE,
            Error::ClassNotFound(_) => VerifyFailures::NO_CLASS,
            _ => unresolved,
        }
    }
}

/// Verification outcome of one method that passed structural verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedMethod {
    method: MethodReference,
    failures: VerifyFailures,
    safe_cast_pcs: BTreeSet<u32>,
    devirt_targets: BTreeMap<u32, MethodReference>,
}

impl VerifiedMethod {
    /// Creates a record without failures or type-flow facts.
    #[must_use]
    pub fn new(method: MethodReference) -> Self {
        VerifiedMethod {
            method,
            failures: VerifyFailures::empty(),
            safe_cast_pcs: BTreeSet::new(),
            devirt_targets: BTreeMap::new(),
        }
    }

    /// The verified method.
    #[must_use]
    pub fn method(&self) -> MethodReference {
        self.method
    }

    /// Recorded soft failures.
    #[must_use]
    pub fn failures(&self) -> VerifyFailures {
        self.failures
    }

    /// Returns `true` if some instruction of the method throws at runtime.
    #[must_use]
    pub fn has_runtime_throw(&self) -> bool {
        self.failures.intersects(VerifyFailures::RUNTIME_THROW)
    }

    /// Returns `true` if the `check-cast` at `pc` can never fail.
    #[must_use]
    pub fn is_safe_cast(&self, pc: u32) -> bool {
        self.safe_cast_pcs.contains(&pc)
    }

    /// Program counters of all `check-cast` instructions that can never fail.
    #[must_use]
    pub fn safe_cast_pcs(&self) -> &BTreeSet<u32> {
        &self.safe_cast_pcs
    }

    /// The statically known target of the invoke at `pc`, if any.
    #[must_use]
    pub fn devirt_target(&self, pc: u32) -> Option<MethodReference> {
        self.devirt_targets.get(&pc).copied()
    }

    /// Adds a safe cast. Used by callers that supply their own type facts.
    pub fn add_safe_cast(&mut self, pc: u32) {
        self.safe_cast_pcs.insert(pc);
    }

    /// Adds soft failures.
    pub fn add_failures(&mut self, failures: VerifyFailures) {
        self.failures |= failures;
    }
}

/// Verification outcome of one class definition.
#[derive(Debug, Clone)]
pub struct ClassVerification {
    class: Option<ClassId>,
    status: ClassStatus,
    methods: Vec<VerifiedMethod>,
    hard_failure: Option<String>,
}

impl ClassVerification {
    /// The linked class, `None` if the definition did not resolve.
    #[must_use]
    pub fn class(&self) -> Option<ClassId> {
        self.class
    }

    /// Status the class reaches.
    #[must_use]
    pub fn status(&self) -> ClassStatus {
        self.status
    }

    /// Records of every method that passed structural verification.
    #[must_use]
    pub fn methods(&self) -> &[VerifiedMethod] {
        &self.methods
    }

    /// Takes the method records out of the result.
    #[must_use]
    pub fn into_methods(self) -> Vec<VerifiedMethod> {
        self.methods
    }

    /// Message of the first hard failure.
    #[must_use]
    pub fn hard_failure(&self) -> Option<&str> {
        self.hard_failure.as_deref()
    }

    /// Returns `true` if the class failed hard.
    #[must_use]
    pub fn has_hard_failure(&self) -> bool {
        self.hard_failure.is_some()
    }
}

type Resolution<T> = std::result::Result<T, VerifyFailures>;

/// Outcomes of every symbolic reference made by the code of one class definition.
///
/// Filled while the mutator lock is held exclusively, so that the checks themselves only need
/// shared access to the class linker.
#[derive(Debug, Default)]
pub struct ResolvedReferences {
    types: FxHashMap<u32, Resolution<ClassId>>,
    fields: FxHashMap<(u32, bool), Resolution<ArtFieldId>>,
    methods: FxHashMap<(u32, InvokeType), Resolution<ArtMethodId>>,
}

impl ResolvedReferences {
    fn ty(&self, type_idx: u32) -> Resolution<ClassId> {
        self.types
            .get(&type_idx)
            .copied()
            .unwrap_or(Err(VerifyFailures::NO_CLASS))
    }

    fn field(&self, field_idx: u32, is_static: bool) -> Resolution<ArtFieldId> {
        self.fields
            .get(&(field_idx, is_static))
            .copied()
            .unwrap_or(Err(VerifyFailures::NO_FIELD))
    }

    fn method(&self, method_idx: u32, invoke_type: InvokeType) -> Resolution<ArtMethodId> {
        self.methods
            .get(&(method_idx, invoke_type))
            .copied()
            .unwrap_or(Err(VerifyFailures::NO_METHOD))
    }

    /// Number of distinct references recorded.
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len() + self.fields.len() + self.methods.len()
    }

    /// Returns `true` if the code makes no symbolic references.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A class definition whose class and references were resolved, ready for
/// [`verify_prepared_class`].
#[derive(Debug)]
pub struct PreparedClass {
    dex_file: DexFileId,
    class_def_idx: u32,
    class: Option<ClassId>,
    references: ResolvedReferences,
}

impl PreparedClass {
    /// The linked class, `None` if the definition did not resolve.
    #[must_use]
    pub fn class(&self) -> Option<ClassId> {
        self.class
    }

    /// Resolved references of the class's code.
    #[must_use]
    pub fn references(&self) -> &ResolvedReferences {
        &self.references
    }
}

/// Resolves the class of a class definition and every type, field and method its code refers
/// to. Indices outside their table and undecodable code are left for the verifier to report.
pub fn prepare_class(
    linker: &mut ClassLinker,
    heap: &mut Heap,
    dex_file: DexFileId,
    class_def_idx: u32,
) -> PreparedClass {
    let dex = Arc::clone(linker.dex_file(dex_file));
    let class = match linker.resolve_class_def(heap, dex_file, class_def_idx) {
        Ok(class) if linker.class(class).dex_file() == Some(dex_file) => Some(class),
        Ok(_) => None,
        Err(e) => {
            log::debug!("Verifying unresolved class_def {class_def_idx} of {}: {e}", dex.location());
            None
        }
    };

    let mut references = ResolvedReferences::default();
    let codes = dex
        .class_def(class_def_idx)
        .into_iter()
        .flat_map(|def| def.methods())
        .filter_map(|method| method.code.as_ref());
    for code in codes {
        for instruction in CodeIter::new(&code.insns).flatten() {
            if instruction.is_payload() {
                continue;
            }
            let op = instruction.opcode();
            let Some(index) = instruction.index() else {
                continue;
            };
            match index_kind(op) {
                IndexKind::Type if (index as usize) < dex.num_types() => {
                    references.types.entry(index).or_insert_with(|| {
                        linker
                            .resolve_type(heap, dex_file, index)
                            .map_err(|e| VerifyFailures::from_error(&e, VerifyFailures::NO_CLASS))
                    });
                }
                IndexKind::Field if (index as usize) < dex.num_fields() => {
                    let is_static = op.is_static_get() || op.is_static_put();
                    references.fields.entry((index, is_static)).or_insert_with(|| {
                        linker
                            .resolve_field(heap, dex_file, index, is_static)
                            .map_err(|e| VerifyFailures::from_error(&e, VerifyFailures::NO_FIELD))
                    });
                }
                IndexKind::Method if (index as usize) < dex.num_methods() => {
                    let Some(invoke_type) = InvokeType::from_opcode(op) else {
                        continue;
                    };
                    references.methods.entry((index, invoke_type)).or_insert_with(|| {
                        linker
                            .resolve_method(heap, dex_file, index, invoke_type)
                            .map_err(|e| VerifyFailures::from_error(&e, VerifyFailures::NO_METHOD))
                    });
                }
                _ => {}
            }
        }
    }

    PreparedClass {
        dex_file,
        class_def_idx,
        class,
        references,
    }
}

/// Verifies the class definition `class_def_idx` of `dex_file`.
///
/// Classes that do not resolve are still verified structurally; members are then resolved
/// without access checks and no type-flow facts are produced.
pub fn verify_class(
    linker: &mut ClassLinker,
    heap: &mut Heap,
    dex_file: DexFileId,
    class_def_idx: u32,
) -> ClassVerification {
    let prepared = prepare_class(linker, heap, dex_file, class_def_idx);
    verify_prepared_class(linker, &prepared)
}

/// Verifies a class definition prepared by [`prepare_class`]. Only reads the class linker.
pub fn verify_prepared_class(linker: &ClassLinker, prepared: &PreparedClass) -> ClassVerification {
    let PreparedClass {
        dex_file,
        class_def_idx,
        class,
        ref references,
    } = *prepared;
    let dex = Arc::clone(linker.dex_file(dex_file));

    if let Some(super_class) = class.and_then(|c| linker.class(c).super_class()) {
        if linker.class(super_class).is_erroneous() {
            return ClassVerification {
                class,
                status: ClassStatus::Error,
                methods: Vec::new(),
                hard_failure: Some(format!(
                    "superclass {} failed verification",
                    linker.class(super_class).descriptor()
                )),
            };
        }
    }

    let def = match dex.class_def(class_def_idx) {
        Ok(def) => def,
        Err(e) => {
            return ClassVerification {
                class,
                status: ClassStatus::Error,
                methods: Vec::new(),
                hard_failure: Some(e.to_string()),
            };
        }
    };

    let mut methods = Vec::new();
    let mut hard_failure = None;
    for encoded in def.methods() {
        let mut verifier = MethodVerifier {
            linker,
            references,
            dex: &dex,
            dex_file,
            class,
            method: encoded,
        };
        match verifier.verify() {
            Ok(verified) => methods.push(verified),
            Err(message) => {
                let message = format!(
                    "{}: {message}",
                    dex.method_id(encoded.method_idx)
                        .map_or("<invalid>", |m| m.name.as_str())
                );
                log::warn!("Hard verification failure in {}: {message}", dex.location());
                hard_failure.get_or_insert(message);
            }
        }
    }

    let status = if hard_failure.is_some() {
        ClassStatus::Error
    } else if methods
        .iter()
        .any(|m| m.has_runtime_throw() || m.failures.contains(VerifyFailures::LOCKING))
    {
        ClassStatus::RetryVerificationAtRuntime
    } else {
        ClassStatus::Verified
    };

    ClassVerification {
        class,
        status,
        methods,
        hard_failure,
    }
}

/// Type of a reference register as far as the forward scan knows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RegType {
    class: ClassId,
    precise: bool,
}

struct MethodVerifier<'a> {
    linker: &'a ClassLinker,
    references: &'a ResolvedReferences,
    dex: &'a DexFile,
    dex_file: DexFileId,
    class: Option<ClassId>,
    method: &'a EncodedMethod,
}

type HardResult<T> = std::result::Result<T, String>;

impl MethodVerifier<'_> {
    fn verify(&mut self) -> HardResult<VerifiedMethod> {
        let reference = MethodReference::new(self.dex_file, self.method.method_idx);
        let flags = self.method.access_flags;
        let bodyless = flags.intersects(AccessFlags::ABSTRACT | AccessFlags::NATIVE);
        let code = match (&self.method.code, bodyless) {
            (None, true) => return Ok(VerifiedMethod::new(reference)),
            (Some(_), true) => return Err("abstract or native method has code".to_string()),
            (None, false) => return Err("method without code".to_string()),
            (Some(code), false) => code,
        };

        let boundaries = self.check_structure(code)?;
        let mut verified = VerifiedMethod::new(reference);
        self.check_references(code, &mut verified)?;
        self.check_monitors(code, &mut verified);
        if self.class.is_some() {
            self.scan_types(code, &boundaries, &mut verified);
        }
        Ok(verified)
    }

    /// Decodes the whole body and checks operands, branch targets and fall-through. Returns the
    /// set of branch and handler targets.
    fn check_structure(&self, code: &CodeItem) -> HardResult<BitSet> {
        let insns = &code.insns;
        if insns.is_empty() {
            return Err("empty code".to_string());
        }
        if code.ins_size > code.registers_size {
            return Err(format!(
                "ins_size {} exceeds registers_size {}",
                code.ins_size, code.registers_size
            ));
        }

        let mut starts = BitSet::new(insns.len());
        let mut decoded = Vec::new();
        for instruction in CodeIter::new(insns) {
            let instruction = instruction.map_err(|e| e.to_string())?;
            starts.insert(instruction.pc() as usize);
            decoded.push(instruction);
        }

        let mut targets = BitSet::new(insns.len());
        let add_target = |from: u32, offset: i32, targets: &mut BitSet| -> HardResult<()> {
            let target = i64::from(from) + i64::from(offset);
            let in_range = usize::try_from(target).ok().filter(|&t| t < insns.len());
            match in_range {
                Some(t) if starts.contains(t) => {
                    targets.insert(t);
                    Ok(())
                }
                _ => Err(format!("invalid branch target {target} at pc {from:04x}")),
            }
        };

        for (position, instruction) in decoded.iter().enumerate() {
            if instruction.is_payload() {
                continue;
            }
            let op = instruction.opcode();
            if is_quickened(op) {
                return Err(format!("quickened opcode {op:?} in input at pc {:04x}", instruction.pc()));
            }
            for register in registers(instruction) {
                if register >= u32::from(code.registers_size) {
                    return Err(format!(
                        "register v{register} out of range at pc {:04x}",
                        instruction.pc()
                    ));
                }
            }
            self.check_index(instruction)?;

            if let Some(offset) = instruction.branch_offset() {
                if op == Opcode::PACKED_SWITCH || op == Opcode::SPARSE_SWITCH {
                    let payload = add_payload(insns, instruction.pc(), offset)?;
                    for case in switch_targets(insns, payload)? {
                        add_target(instruction.pc(), case, &mut targets)?;
                    }
                } else if op == Opcode::FILL_ARRAY_DATA {
                    add_payload(insns, instruction.pc(), offset)?;
                } else {
                    if offset == 0 && op.is_goto() {
                        return Err(format!("self-branch at pc {:04x}", instruction.pc()));
                    }
                    add_target(instruction.pc(), offset, &mut targets)?;
                }
            }

            if op.can_continue() {
                let falls_through_to_code = decoded
                    .get(position + 1)
                    .is_some_and(|next| !next.is_payload());
                if !falls_through_to_code {
                    return Err(format!("control falls off the end at pc {:04x}", instruction.pc()));
                }
            }
        }

        for try_item in &code.tries {
            let start = try_item.start_addr as usize;
            let end = start + usize::from(try_item.insn_count);
            if !starts.contains(start) || (end < insns.len() && !starts.contains(end)) || end > insns.len() {
                return Err(format!("try block at {start:04x} is misaligned"));
            }
            for handler in &try_item.handlers {
                let address = handler.address as usize;
                if address >= insns.len() || !starts.contains(address) {
                    return Err(format!("catch handler at {address:04x} is misaligned"));
                }
                if let Some(type_idx) = handler.type_idx {
                    if type_idx as usize >= self.dex.num_types() {
                        return Err(format!("catch type index {type_idx} out of range"));
                    }
                }
                targets.insert(address);
            }
        }
        Ok(targets)
    }

    fn check_index(&self, instruction: &Instruction<'_>) -> HardResult<()> {
        let Some(index) = instruction.index() else {
            return Ok(());
        };
        let op = instruction.opcode();
        let (limit, table) = match index_kind(op) {
            IndexKind::String => (self.dex.num_strings(), "string"),
            IndexKind::Type => (self.dex.num_types(), "type"),
            IndexKind::Field => (self.dex.num_fields(), "field"),
            IndexKind::Method => (self.dex.num_methods(), "method"),
            IndexKind::None => return Ok(()),
        };
        if index as usize >= limit {
            return Err(format!(
                "{table} index {index} out of range at pc {:04x}",
                instruction.pc()
            ));
        }
        Ok(())
    }

    /// Resolves every symbolic reference and records soft failures for those that will throw.
    fn check_references(&mut self, code: &CodeItem, verified: &mut VerifiedMethod) -> HardResult<()> {
        for instruction in CodeIter::new(&code.insns) {
            let instruction = instruction.map_err(|e| e.to_string())?;
            if instruction.is_payload() {
                continue;
            }
            let op = instruction.opcode();
            if matches!(op.0, 0xfa..=0xff) {
                verified.add_failures(VerifyFailures::FORCE_INTERPRETER);
                continue;
            }
            let Some(index) = instruction.index() else {
                continue;
            };
            let failure = match index_kind(op) {
                IndexKind::Type => self.check_type(op, index),
                IndexKind::Field => self.check_field(op, index),
                IndexKind::Method => self.check_method(op, index),
                IndexKind::String | IndexKind::None => VerifyFailures::empty(),
            };
            if !failure.is_empty() {
                log::debug!(
                    "Soft verification failure {failure:?} at pc {:04x} of method {}",
                    instruction.pc(),
                    self.method.method_idx
                );
                verified.add_failures(failure);
            }
        }
        Ok(())
    }

    fn check_type(&self, op: Opcode, type_idx: u32) -> VerifyFailures {
        match self.references.ty(type_idx) {
            Ok(target) => {
                if let Some(class) = self.class {
                    if !self.linker.can_access_class(class, target) {
                        return VerifyFailures::ACCESS_CLASS;
                    }
                }
                let target = self.linker.class(target);
                if op == Opcode::NEW_INSTANCE && !target.is_instantiable() {
                    return VerifyFailures::INSTANTIATION;
                }
                VerifyFailures::empty()
            }
            Err(failures) => failures,
        }
    }

    fn check_field(&self, op: Opcode, field_idx: u32) -> VerifyFailures {
        let is_static = op.is_static_get() || op.is_static_put();
        match self.references.field(field_idx, is_static) {
            Ok(field) => {
                let declaring = field.class;
                let flags = self.linker.field(field).access_flags();
                match self.class {
                    Some(class) if !self.linker.can_access_member(class, declaring, flags) => {
                        VerifyFailures::ACCESS_FIELD
                    }
                    _ => VerifyFailures::empty(),
                }
            }
            Err(failures) => failures,
        }
    }

    fn check_method(&self, op: Opcode, method_idx: u32) -> VerifyFailures {
        let Some(invoke_type) = InvokeType::from_opcode(op) else {
            return VerifyFailures::empty();
        };
        match self.references.method(method_idx, invoke_type) {
            Ok(method) => {
                let flags = self.linker.method(method).access_flags();
                match self.class {
                    Some(class) if !self.linker.can_access_member(class, method.class, flags) => {
                        VerifyFailures::ACCESS_METHOD
                    }
                    _ => VerifyFailures::empty(),
                }
            }
            Err(failures) => failures,
        }
    }

    fn check_monitors(&self, code: &CodeItem, verified: &mut VerifiedMethod) {
        let mut depth: i64 = 0;
        let mut balanced = true;
        for instruction in CodeIter::new(&code.insns).flatten() {
            match instruction.opcode() {
                Opcode::MONITOR_ENTER if !instruction.is_payload() => depth += 1,
                Opcode::MONITOR_EXIT if !instruction.is_payload() => {
                    depth -= 1;
                    balanced &= depth >= 0;
                }
                _ => {}
            }
        }
        if !balanced || depth != 0 {
            verified.add_failures(VerifyFailures::LOCKING);
        }
    }

    /// Forward scan over reference register types. State is dropped at every branch or handler
    /// target and after every instruction that does not fall through.
    fn scan_types(&mut self, code: &CodeItem, targets: &BitSet, verified: &mut VerifiedMethod) {
        let Some(class) = self.class else {
            return;
        };
        let mut regs: Vec<Option<RegType>> = vec![None; usize::from(code.registers_size)];
        if !self.method.access_flags.contains(AccessFlags::STATIC) {
            let this = usize::from(code.registers_size - code.ins_size);
            let this_type = RegType {
                class,
                precise: self.linker.class(class).is_final(),
            };
            set_reg(&mut regs, this, Some(this_type));
        }

        let mut reset = false;
        for instruction in CodeIter::new(&code.insns).flatten() {
            if instruction.is_payload() {
                continue;
            }
            let pc = instruction.pc();
            if reset || (pc != 0 && targets.contains(pc as usize)) {
                regs.iter_mut().for_each(|r| *r = None);
            }
            let op = instruction.opcode();
            reset = !op.can_continue();
            let a = instruction.vreg_a() as usize;

            match op {
                Opcode::NEW_INSTANCE => {
                    let resolved = instruction
                        .index()
                        .and_then(|idx| self.linker.dex_cache(self.dex_file).resolved_type(idx));
                    set_reg(&mut regs, a, resolved.map(|c| RegType { class: c, precise: true }));
                }
                Opcode::CONST_STRING | Opcode::CONST_STRING_JUMBO => {
                    let string = self
                        .linker
                        .lookup_class(crate::runtime::core::STRING, None)
                        .map(|c| RegType { class: c, precise: true });
                    set_reg(&mut regs, a, string);
                }
                Opcode::CHECK_CAST => {
                    let target = instruction
                        .index()
                        .and_then(|idx| self.linker.dex_cache(self.dex_file).resolved_type(idx));
                    let current = regs.get(a).copied().flatten();
                    match (current, target) {
                        (Some(current), Some(target))
                            if self.linker.is_assignable(target, current.class) =>
                        {
                            verified.add_safe_cast(pc);
                        }
                        (_, target) => set_reg(
                            &mut regs,
                            a,
                            target.map(|c| RegType { class: c, precise: false }),
                        ),
                    }
                }
                Opcode::MOVE_OBJECT | Opcode::MOVE_OBJECT_FROM16 | Opcode::MOVE_OBJECT_16 => {
                    let value = regs.get(instruction.vreg_b() as usize).copied().flatten();
                    set_reg(&mut regs, a, value);
                }
                _ if op.is_invoke() => self.record_devirt_target(&instruction, &regs, verified),
                _ if writes_vreg_a(op) => {
                    set_reg(&mut regs, a, None);
                    set_reg(&mut regs, a + 1, None);
                }
                _ => {}
            }
        }
    }

    fn record_devirt_target(
        &self,
        instruction: &Instruction<'_>,
        regs: &[Option<RegType>],
        verified: &mut VerifiedMethod,
    ) {
        let op = instruction.opcode();
        if !matches!(
            InvokeType::from_opcode(op),
            Some(InvokeType::Virtual | InvokeType::Interface)
        ) {
            return;
        }
        let Some(method) = instruction
            .index()
            .and_then(|idx| self.linker.dex_cache(self.dex_file).resolved_method(idx))
        else {
            return;
        };
        let target = self.linker.method(method);
        let declaring = self.linker.class(method.class);
        let implementation = if target.is_final() || (declaring.is_final() && !declaring.is_interface()) {
            Some(method)
        } else {
            let receiver = instruction
                .argument_registers()
                .first()
                .and_then(|&r| regs.get(r as usize).copied().flatten());
            match receiver {
                Some(receiver) if receiver.precise => self
                    .linker
                    .find_virtual_implementation(receiver.class, method),
                _ => None,
            }
        };
        let Some(implementation) = implementation else {
            return;
        };
        let implementation_method = self.linker.method(implementation);
        if implementation_method.is_abstract() {
            return;
        }
        if let Some(dex_file) = self.linker.class(implementation.class).dex_file() {
            verified.devirt_targets.insert(
                instruction.pc(),
                MethodReference::new(dex_file, implementation_method.dex_method_idx()),
            );
        }
    }
}

fn set_reg(regs: &mut [Option<RegType>], reg: usize, value: Option<RegType>) {
    if let Some(slot) = regs.get_mut(reg) {
        *slot = value;
    }
}

enum IndexKind {
    None,
    String,
    Type,
    Field,
    Method,
}

fn index_kind(op: Opcode) -> IndexKind {
    match op {
        Opcode::CONST_STRING | Opcode::CONST_STRING_JUMBO => IndexKind::String,
        Opcode::CONST_CLASS
        | Opcode::CHECK_CAST
        | Opcode::INSTANCE_OF
        | Opcode::NEW_INSTANCE
        | Opcode::NEW_ARRAY => IndexKind::Type,
        _ if matches!(op.0, 0x24 | 0x25) => IndexKind::Type,
        _ if op.is_instance_get() || op.is_instance_put() || op.is_static_get() || op.is_static_put() => {
            IndexKind::Field
        }
        _ if op.is_invoke() => IndexKind::Method,
        _ => IndexKind::None,
    }
}

fn is_quickened(op: Opcode) -> bool {
    op == Opcode::RETURN_VOID_NO_BARRIER || (Opcode::IGET_QUICK.0..=Opcode::IGET_SHORT_QUICK.0).contains(&op.0)
}

/// Returns `true` if the instruction stores a result into register `A`.
fn writes_vreg_a(op: Opcode) -> bool {
    matches!(
        op.0,
        0x01..=0x0d
            | 0x12..=0x1c
            | 0x1f..=0x23
            | 0x2d..=0x31
            | 0x44..=0x4a
            | 0x52..=0x58
            | 0x60..=0x66
            | 0x7b..=0xe2
    )
}

/// Register operands of an instruction.
fn registers(instruction: &Instruction<'_>) -> Vec<u32> {
    let a = instruction.vreg_a();
    let b = instruction.vreg_b();
    let c = instruction.vreg_c();
    match instruction.opcode().format() {
        Format::K10x | Format::K10t | Format::K20t | Format::K30t => Vec::new(),
        Format::K11x
        | Format::K11n
        | Format::K21s
        | Format::K21h
        | Format::K21c
        | Format::K21t
        | Format::K31i
        | Format::K31t
        | Format::K31c
        | Format::K51l => vec![a],
        Format::K12x | Format::K22x | Format::K32x | Format::K22t | Format::K22s | Format::K22b => {
            vec![a, b]
        }
        Format::K22c => vec![a, b],
        Format::K23x => vec![a, b, c],
        Format::K35c | Format::K3rc | Format::K45cc | Format::K4rcc => {
            instruction.argument_registers()
        }
    }
}

fn add_payload(insns: &[u16], pc: u32, offset: i32) -> HardResult<usize> {
    let target = i64::from(pc) + i64::from(offset);
    usize::try_from(target)
        .ok()
        .filter(|&t| t < insns.len())
        .ok_or_else(|| format!("payload offset {offset} out of range at pc {pc:04x}"))
}

/// Relative branch offsets of a switch payload.
#[allow(clippy::cast_possible_wrap)]
fn switch_targets(insns: &[u16], payload: usize) -> HardResult<Vec<i32>> {
    let at = |i: usize| {
        insns
            .get(payload + i)
            .copied()
            .ok_or_else(|| "truncated switch payload".to_string())
    };
    let word = |i: usize| -> HardResult<i32> {
        Ok((u32::from(at(i)?) | (u32::from(at(i + 1)?) << 16)) as i32)
    };
    let size = usize::from(at(1)?);
    match at(0)? {
        PACKED_SWITCH_SIGNATURE => (0..size).map(|i| word(4 + 2 * i)).collect(),
        SPARSE_SWITCH_SIGNATURE => (0..size).map(|i| word(2 + 2 * size + 2 * i)).collect(),
        other => Err(format!("switch refers to non-switch payload {other:04x}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dex::{CodeBuilder, DexFileBuilder},
        runtime::core::{self, core_library},
    };

    fn setup(build: impl FnOnce(&mut DexFileBuilder)) -> (Heap, ClassLinker, DexFileId) {
        let mut heap = Heap::new();
        let mut linker = ClassLinker::new(&mut heap, vec![core_library()]).unwrap();
        let mut dex = DexFileBuilder::new("app.dex");
        build(&mut dex);
        let id = linker.register_dex_file(&mut heap, dex.build(), None).unwrap();
        (heap, linker, id)
    }

    fn code(build: impl FnOnce(&mut CodeBuilder)) -> Option<CodeItem> {
        let mut builder = CodeBuilder::new(4, 1);
        build(&mut builder);
        Some(builder.build())
    }

    #[test]
    fn test_well_formed_class_verifies() {
        let (mut heap, mut linker, dex) = setup(|dex| {
            dex.class("LOk;")
                .superclass(core::OBJECT)
                .virtual_method("f", "V", AccessFlags::PUBLIC, code(|c| {
                    c.const4(0, 1).add_int_lit8(1, 0, 2).return_void();
                }))
                .finish();
        });
        let result = verify_class(&mut linker, &mut heap, dex, 0);
        assert_eq!(result.status(), ClassStatus::Verified);
        assert_eq!(result.methods().len(), 1);
        assert!(!result.methods()[0].has_runtime_throw());
    }

    #[test]
    fn test_fall_off_end_is_hard_failure() {
        let (mut heap, mut linker, dex) = setup(|dex| {
            dex.class("LBad;")
                .superclass(core::OBJECT)
                .virtual_method("f", "V", AccessFlags::PUBLIC, code(|c| {
                    c.const4(0, 1);
                }))
                .finish();
        });
        let result = verify_class(&mut linker, &mut heap, dex, 0);
        assert_eq!(result.status(), ClassStatus::Error);
        assert!(result.hard_failure().unwrap().contains("falls off"));
        assert!(result.methods().is_empty());
    }

    #[test]
    fn test_branch_into_instruction_is_hard_failure() {
        let (mut heap, mut linker, dex) = setup(|dex| {
            dex.class("LBad;")
                .superclass(core::OBJECT)
                .virtual_method("f", "V", AccessFlags::PUBLIC, code(|c| {
                    // const/16 occupies two units; the branch lands on its second one.
                    c.const16(0, 5).goto(-1).return_void();
                }))
                .finish();
        });
        let result = verify_class(&mut linker, &mut heap, dex, 0);
        assert!(result.has_hard_failure());
    }

    #[test]
    fn test_register_out_of_range_is_hard_failure() {
        let (mut heap, mut linker, dex) = setup(|dex| {
            dex.class("LBad;")
                .superclass(core::OBJECT)
                .virtual_method("f", "V", AccessFlags::PUBLIC, code(|c| {
                    c.const4(9, 0).return_void();
                }))
                .finish();
        });
        assert!(verify_class(&mut linker, &mut heap, dex, 0).has_hard_failure());
    }

    #[test]
    fn test_unresolved_field_is_soft_failure() {
        let (mut heap, mut linker, dex) = setup(|dex| {
            let missing = dex.field_id("LMissing;", "value", "I");
            #[allow(clippy::cast_possible_truncation)]
            let missing = missing as u16;
            dex.class("LSoft;")
                .superclass(core::OBJECT)
                .direct_method(
                    "f",
                    "V",
                    AccessFlags::STATIC,
                    code(|c| {
                        c.static_field_op(Opcode::SGET, 0, missing).return_void();
                    }),
                )
                .finish();
        });
        let result = verify_class(&mut linker, &mut heap, dex, 0);
        assert_eq!(result.status(), ClassStatus::RetryVerificationAtRuntime);
        let method = &result.methods()[0];
        assert!(method.has_runtime_throw());
        assert!(method.failures().contains(VerifyFailures::NO_CLASS));
    }

    #[test]
    fn test_unbalanced_monitor_sets_locking() {
        let (mut heap, mut linker, dex) = setup(|dex| {
            dex.class("LLock;")
                .superclass(core::OBJECT)
                .virtual_method("f", "V", AccessFlags::PUBLIC, code(|c| {
                    c.monitor_enter(3).return_void();
                }))
                .finish();
        });
        let result = verify_class(&mut linker, &mut heap, dex, 0);
        let method = &result.methods()[0];
        assert!(method.failures().contains(VerifyFailures::LOCKING));
        assert!(!method.has_runtime_throw());
        assert_eq!(result.status(), ClassStatus::RetryVerificationAtRuntime);
    }

    #[test]
    fn test_check_cast_after_new_instance_is_safe() {
        let (mut heap, mut linker, dex) = setup(|dex| {
            let object = dex.type_id(core::OBJECT);
            let this_type = dex.type_id("LCasts;");
            #[allow(clippy::cast_possible_truncation)]
            let (object, this_type) = (object as u16, this_type as u16);
            dex.class("LCasts;")
                .superclass(core::OBJECT)
                .virtual_method("f", "V", AccessFlags::PUBLIC, code(|c| {
                    c.new_instance(0, this_type)
                        .check_cast(0, object)
                        .check_cast(1, this_type)
                        .return_void();
                }))
                .finish();
        });
        let result = verify_class(&mut linker, &mut heap, dex, 0);
        let method = &result.methods()[0];
        assert!(method.is_safe_cast(2));
        assert!(!method.is_safe_cast(4));
    }

    #[test]
    fn test_cast_is_safe_through_wide_register_moves() {
        let (mut heap, mut linker, dex) = setup(|dex| {
            let object = dex.type_id(core::OBJECT);
            let this_type = dex.type_id("LMoves;");
            #[allow(clippy::cast_possible_truncation)]
            let (object, this_type) = (object as u16, this_type as u16);
            dex.class("LMoves;")
                .superclass(core::OBJECT)
                .virtual_method("f", "V", AccessFlags::PUBLIC, code(|c| {
                    c.new_instance(0, this_type)
                        .move_object_from16(1, 0)
                        .move_object_16(2, 1)
                        .check_cast(2, this_type)
                        .check_cast(1, object)
                        .return_void();
                }))
                .finish();
        });
        let result = verify_class(&mut linker, &mut heap, dex, 0);
        assert_eq!(result.status(), ClassStatus::Verified);
        let method = &result.methods()[0];
        assert!(method.is_safe_cast(7));
        assert!(method.is_safe_cast(9));
        assert_eq!(method.safe_cast_pcs().len(), 2);
    }

    #[test]
    fn test_invoke_on_final_class_is_devirtualized() {
        let (mut heap, mut linker, dex) = setup(|dex| {
            let run = dex.method_id("LFinal;", "run", "V");
            #[allow(clippy::cast_possible_truncation)]
            let run = run as u16;
            dex.class("LFinal;")
                .access_flags(AccessFlags::PUBLIC | AccessFlags::FINAL)
                .superclass(core::OBJECT)
                .virtual_method("run", "V", AccessFlags::PUBLIC, code(|c| {
                    c.invoke(Opcode::INVOKE_VIRTUAL, &[3], run).return_void();
                }))
                .finish();
        });
        let result = verify_class(&mut linker, &mut heap, dex, 0);
        let method = &result.methods()[0];
        assert_eq!(method.devirt_target(0), Some(MethodReference::new(dex, 0)));
    }

    #[test]
    fn test_native_method_with_code_is_hard_failure() {
        let (mut heap, mut linker, dex) = setup(|dex| {
            dex.class("LNative;")
                .superclass(core::OBJECT)
                .virtual_method(
                    "f",
                    "V",
                    AccessFlags::PUBLIC | AccessFlags::NATIVE,
                    code(|c| {
                        c.return_void();
                    }),
                )
                .finish();
        });
        assert!(verify_class(&mut linker, &mut heap, dex, 0).has_hard_failure());
    }
}
