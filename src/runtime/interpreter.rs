//! Transactional static initializer interpreter.
//!
//! Running a class's `<clinit>` ahead of time lets the image capture initialized static state.
//! The interpreter supports the instruction subset that typical initializers of constant tables
//! use and refuses everything else, so that an initializer either runs to completion exactly as
//! it would at runtime or leaves no trace at all.
//!
//! Every heap mutation goes through a [`Transaction`]: field writes remember the previous value,
//! allocations and newly interned strings are recorded and class status changes are logged.
//! If the initializer throws, exceeds the step budget or hits an unsupported instruction, the
//! transaction is rolled back and the class keeps its verified status.

use std::sync::Arc;

use crate::{
    dex::{CodeIter, DexFile, DexFileId, Instruction, Opcode},
    runtime::{
        class::{ArtMethodId, ClassId, ClassStatus, InvokeType},
        class_linker::ClassLinker,
        core,
        heap::{Heap, ObjectId, Value},
    },
    Error::InitializationFailed,
    Result,
};

/// Upper bound of interpreted instructions per top-level initialization.
pub const DEFAULT_STEP_LIMIT: usize = 100_000;

/// Maximum interpreted call depth.
const MAX_CALL_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy)]
struct FieldWrite {
    object: ObjectId,
    offset: u32,
    size: usize,
    old: Value,
}

/// Undo log of heap mutations performed while running initializers.
#[derive(Debug, Default)]
pub struct Transaction {
    writes: Vec<FieldWrite>,
    allocations: Vec<ObjectId>,
    interned: Vec<String>,
    statuses: Vec<(ClassId, ClassStatus)>,
}

impl Transaction {
    /// Creates an empty transaction.
    #[must_use]
    pub fn new() -> Self {
        Transaction::default()
    }

    /// Writes a field of `object`, remembering the previous value.
    pub fn write_field(
        &mut self,
        heap: &mut Heap,
        object: ObjectId,
        offset: u32,
        size: usize,
        value: Value,
    ) {
        let old = heap.object_mut(object).set_field(offset, size, value);
        self.writes.push(FieldWrite {
            object,
            offset,
            size,
            old,
        });
    }

    /// Records an object allocated inside the transaction.
    pub fn record_allocation(&mut self, object: ObjectId) {
        self.allocations.push(object);
    }

    /// Records a string that was newly interned inside the transaction.
    pub fn record_intern(&mut self, value: &str, object: ObjectId) {
        self.interned.push(value.to_string());
        self.allocations.push(object);
    }

    /// Changes the status of `class`, remembering the previous one.
    pub fn set_class_status(
        &mut self,
        linker: &mut ClassLinker,
        heap: &mut Heap,
        class: ClassId,
        status: ClassStatus,
    ) {
        self.statuses.push((class, linker.class(class).status()));
        linker.set_class_status(heap, class, status);
    }

    /// Number of recorded field writes.
    #[must_use]
    pub fn num_writes(&self) -> usize {
        self.writes.len()
    }

    /// Objects allocated inside the transaction.
    #[must_use]
    pub fn allocations(&self) -> &[ObjectId] {
        &self.allocations
    }

    /// Returns `true` if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
            && self.allocations.is_empty()
            && self.interned.is_empty()
            && self.statuses.is_empty()
    }

    /// Undoes every recorded mutation in reverse order.
    pub fn rollback(self, linker: &mut ClassLinker, heap: &mut Heap) {
        for write in self.writes.iter().rev() {
            if let Some(object) = heap.get_mut(write.object) {
                object.set_field(write.offset, write.size, write.old);
            }
        }
        for value in &self.interned {
            linker.intern_table_mut().remove(value);
        }
        for &object in self.allocations.iter().rev() {
            heap.free(object);
        }
        for &(class, status) in self.statuses.iter().rev() {
            linker.set_class_status(heap, class, status);
        }
    }
}

/// Result of [`ensure_initialized`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// The class is initialized
    Initialized,
    /// Initialization was not attempted under the given permissions
    Deferred,
}

/// Initializes `class` unless the permissions forbid it.
///
/// `can_init_parents` allows initializing uninitialized superclasses first;
/// `can_init_statics` allows running `<clinit>` bodies. A class whose status is below
/// [`ClassStatus::Verified`] is never initialized.
///
/// # Errors
/// Returns [`crate::Error::InitializationFailed`] if an initializer throws or cannot be
/// interpreted. Every mutation of the attempt has been rolled back by then.
pub fn ensure_initialized(
    linker: &mut ClassLinker,
    heap: &mut Heap,
    class: ClassId,
    can_init_statics: bool,
    can_init_parents: bool,
) -> Result<InitOutcome> {
    let mut interpreter = ClinitInterpreter::new(linker, heap, DEFAULT_STEP_LIMIT);
    match interpreter.initialize(class, can_init_statics, can_init_parents) {
        Ok(outcome) => {
            let transaction = interpreter.into_transaction();
            log::trace!(
                "Initialized {class:?} with {} field writes",
                transaction.num_writes()
            );
            Ok(outcome)
        }
        Err(e) => {
            let transaction = interpreter.into_transaction();
            transaction.rollback(linker, heap);
            Err(e)
        }
    }
}

/// Interprets static initializers inside one [`Transaction`].
pub struct ClinitInterpreter<'a> {
    linker: &'a mut ClassLinker,
    heap: &'a mut Heap,
    transaction: Transaction,
    steps_left: usize,
    depth: usize,
}

impl<'a> ClinitInterpreter<'a> {
    /// Creates an interpreter allowed to execute `step_limit` instructions.
    pub fn new(linker: &'a mut ClassLinker, heap: &'a mut Heap, step_limit: usize) -> Self {
        ClinitInterpreter {
            linker,
            heap,
            transaction: Transaction::new(),
            steps_left: step_limit,
            depth: 0,
        }
    }

    /// Ends the interpretation and hands out the transaction for commit or rollback.
    #[must_use]
    pub fn into_transaction(self) -> Transaction {
        self.transaction
    }

    /// Initializes `class` and, if permitted, its superclasses.
    ///
    /// A class that is already being initialized counts as initialized, as it would for the
    /// initializing thread at runtime.
    ///
    /// # Errors
    /// Returns [`crate::Error::InitializationFailed`] if an initializer fails.
    pub fn initialize(
        &mut self,
        class: ClassId,
        can_init_statics: bool,
        can_init_parents: bool,
    ) -> Result<InitOutcome> {
        let status = self.linker.class(class).status();
        if status >= ClassStatus::Initializing {
            return Ok(InitOutcome::Initialized);
        }
        if status < ClassStatus::Verified {
            return Ok(InitOutcome::Deferred);
        }

        if let Some(super_class) = self.linker.class(class).super_class() {
            if !self.linker.class(super_class).is_initialized() {
                if !can_init_parents {
                    return Ok(InitOutcome::Deferred);
                }
                if self.initialize(super_class, can_init_statics, true)? == InitOutcome::Deferred {
                    return Ok(InitOutcome::Deferred);
                }
            }
        }

        let clinit = self.linker.class(class).class_initializer();
        if clinit.is_some() && !can_init_statics {
            return Ok(InitOutcome::Deferred);
        }

        self.transaction
            .set_class_status(self.linker, self.heap, class, ClassStatus::Initializing);
        if let Some(clinit) = clinit {
            self.invoke(clinit, &[])?;
        }
        self.transaction
            .set_class_status(self.linker, self.heap, class, ClassStatus::Initialized);
        Ok(InitOutcome::Initialized)
    }

    fn fail(&self, method: ArtMethodId, pc: u32, message: &str) -> crate::Error {
        let m = self.linker.method(method);
        InitializationFailed(format!(
            "{}.{} at pc {pc:04x}: {message}",
            self.linker.class(method.class).descriptor(),
            m.name()
        ))
    }

    fn invoke(&mut self, method: ArtMethodId, args: &[Value]) -> Result<Option<Value>> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(self.fail(method, 0, "call depth exceeded"));
        }
        let (dex_file, dex) = {
            let Some(dex_file) = self.linker.class(method.class).dex_file() else {
                return Err(self.fail(method, 0, "method has no bytecode"));
            };
            (dex_file, Arc::clone(self.linker.dex_file(dex_file)))
        };
        let dex_method_idx = self.linker.method(method).dex_method_idx();
        let Some(code) = dex
            .find_encoded_method(dex_method_idx)
            .and_then(|(_, encoded)| encoded.code.as_ref())
        else {
            return Err(self.fail(method, 0, "native or abstract method"));
        };

        let mut regs = vec![Value::Primitive(0); usize::from(code.registers_size)];
        let first_in = usize::from(code.registers_size - code.ins_size.min(code.registers_size));
        for (slot, &arg) in regs[first_in..].iter_mut().zip(args) {
            *slot = arg;
        }

        self.depth += 1;
        let result = self.run(method, dex_file, &dex, &code.insns, &mut regs);
        self.depth -= 1;
        result
    }

    #[allow(clippy::too_many_lines, clippy::cast_sign_loss)]
    fn run(
        &mut self,
        method: ArtMethodId,
        dex_file: DexFileId,
        dex: &DexFile,
        insns: &[u16],
        regs: &mut [Value],
    ) -> Result<Option<Value>> {
        let mut pc: u32 = 0;
        let mut result = Value::Primitive(0);
        loop {
            if self.steps_left == 0 {
                return Err(self.fail(method, pc, "step limit exceeded"));
            }
            self.steps_left -= 1;

            let instruction = crate::dex::decode_instruction(insns, pc)?;
            let op = instruction.opcode();
            let a = instruction.vreg_a() as usize;
            let b = instruction.vreg_b() as usize;
            
            #[allow(clippy::cast_possible_truncation)]
            let mut next = pc + instruction.size_in_code_units() as u32;

            match op {
                Opcode::NOP => {}
                _ if (Opcode::MOVE.0..=Opcode::MOVE_OBJECT.0 + 2).contains(&op.0) => {
                    regs[a] = read_reg(regs, b);
                }
                _ if (Opcode::MOVE_RESULT.0..=Opcode::MOVE_RESULT_OBJECT.0).contains(&op.0) => {
                    regs[a] = result;
                }
                _ if (Opcode::CONST_4.0..=Opcode::CONST_WIDE_HIGH16.0).contains(&op.0) => {
                    regs[a] = Value::Primitive(instruction.literal() as u64);
                }
                Opcode::CONST_STRING | Opcode::CONST_STRING_JUMBO => {
                    let string_idx = self.index(&instruction, method)?;
                    regs[a] = Value::Reference(Some(self.string(dex_file, dex, string_idx)?));
                }
                Opcode::CONST_CLASS => {
                    let type_idx = self.index(&instruction, method)?;
                    let class = self.linker.resolve_type(self.heap, dex_file, type_idx)?;
                    regs[a] = Value::Reference(Some(self.linker.class(class).mirror()));
                }
                Opcode::NEW_INSTANCE => {
                    let type_idx = self.index(&instruction, method)?;
                    let class = self.linker.resolve_type(self.heap, dex_file, type_idx)?;
                    if self.initialize(class, true, true)? == InitOutcome::Deferred {
                        return Err(self.fail(method, pc, "instantiated class is not initializable"));
                    }
                    let object = self.linker.alloc_object(self.heap, class)?;
                    self.transaction.record_allocation(object);
                    regs[a] = Value::Reference(Some(object));
                }
                _ if op.is_static_get() || op.is_static_put() => {
                    let field_idx = self.index(&instruction, method)?;
                    let field = self.linker.resolve_field(self.heap, dex_file, field_idx, true)?;
                    if self.initialize(field.class, true, true)? == InitOutcome::Deferred {
                        return Err(self.fail(method, pc, "field's class is not initializable"));
                    }
                    let (offset, size, is_reference) = {
                        let f = self.linker.field(field);
                        (f.offset(), f.size(), f.is_reference())
                    };
                    let mirror = self.linker.class(field.class).mirror();
                    if op.is_static_get() {
                        regs[a] = self.heap.object(mirror).get_field(offset, size, is_reference);
                    } else {
                        let value = store_value(read_reg(regs, a), is_reference);
                        self.transaction
                            .write_field(self.heap, mirror, offset, size, value);
                    }
                }
                _ if op.is_instance_get() || op.is_instance_put() => {
                    let field_idx = self.index(&instruction, method)?;
                    let field = self.linker.resolve_field(self.heap, dex_file, field_idx, false)?;
                    let Some(object) = read_reg(regs, b).reference() else {
                        return Err(self.fail(method, pc, "null object in field access"));
                    };
                    let (offset, size, is_reference) = {
                        let f = self.linker.field(field);
                        (f.offset(), f.size(), f.is_reference())
                    };
                    if op.is_instance_get() {
                        regs[a] = self.heap.object(object).get_field(offset, size, is_reference);
                    } else {
                        let value = store_value(read_reg(regs, a), is_reference);
                        self.transaction
                            .write_field(self.heap, object, offset, size, value);
                    }
                }
                _ if matches!(
                    InvokeType::from_opcode(op),
                    Some(InvokeType::Direct | InvokeType::Static)
                ) && op.is_invoke() =>
                {
                    let method_idx = self.index(&instruction, method)?;
                    let invoke_type = InvokeType::from_opcode(op).unwrap_or(InvokeType::Static);
                    let target = self
                        .linker
                        .resolve_method(self.heap, dex_file, method_idx, invoke_type)?;
                    if invoke_type == InvokeType::Static
                        && self.initialize(target.class, true, true)? == InitOutcome::Deferred
                    {
                        return Err(self.fail(method, pc, "callee's class is not initializable"));
                    }
                    let args: Vec<Value> = instruction
                        .argument_registers()
                        .iter()
                        .map(|&r| read_reg(regs, r as usize))
                        .collect();
                    if invoke_type == InvokeType::Direct && args.first().and_then(|v| v.reference()).is_none() {
                        return Err(self.fail(method, pc, "null receiver"));
                    }
                    if let Some(value) = self.invoke(target, &args)? {
                        result = value;
                    }
                }
                _ if op.is_return() => {
                    return Ok(match op {
                        Opcode::RETURN_VOID | Opcode::RETURN_VOID_NO_BARRIER => None,
                        _ => Some(read_reg(regs, a)),
                    });
                }
                Opcode::THROW => {
                    let thrown = read_reg(regs, a)
                        .reference()
                        .and_then(|o| self.describe_object(o))
                        .unwrap_or_else(|| core::NULL_POINTER_EXCEPTION.to_string());
                    return Err(self.fail(method, pc, &format!("initializer threw {thrown}")));
                }
                _ if op.is_goto() => {
                    next = branch(pc, &instruction);
                }
                _ if (Opcode::IF_EQZ.0..=Opcode::IF_LEZ.0).contains(&op.0) => {
                    let value = register_bits(read_reg(regs, a));
                    let taken = match op.0 - Opcode::IF_EQZ.0 {
                        0 => value == 0,
                        1 => value != 0,
                        2 => value < 0,
                        3 => value >= 0,
                        4 => value > 0,
                        _ => value <= 0,
                    };
                    if taken {
                        next = branch(pc, &instruction);
                    }
                }
                _ if (Opcode::IF_EQ.0..=Opcode::IF_LE.0).contains(&op.0) => {
                    let lhs = read_reg(regs, a);
                    let rhs = read_reg(regs, b);
                    let (l, r) = (register_bits(lhs), register_bits(rhs));
                    let taken = match op.0 - Opcode::IF_EQ.0 {
                        0 => lhs == rhs || (l == r && lhs.reference().is_none() && rhs.reference().is_none()),
                        1 => lhs != rhs,
                        2 => l < r,
                        3 => l >= r,
                        4 => l > r,
                        _ => l <= r,
                    };
                    if taken {
                        next = branch(pc, &instruction);
                    }
                }
                _ => {
                    return Err(self.fail(
                        method,
                        pc,
                        &format!("unsupported instruction {}", op.name()),
                    ));
                }
            }
            pc = next;
        }
    }

    fn index(&self, instruction: &Instruction<'_>, method: ArtMethodId) -> Result<u32> {
        instruction
            .index()
            .ok_or_else(|| self.fail(method, instruction.pc(), "missing index operand"))
    }

    fn string(&mut self, dex_file: DexFileId, dex: &DexFile, string_idx: u32) -> Result<ObjectId> {
        if let Some(id) = self.linker.dex_cache(dex_file).resolved_string(string_idx) {
            return Ok(id);
        }
        let value = dex.string(string_idx)?;
        let (id, allocated) = self.linker.intern(self.heap, value)?;
        if allocated {
            self.transaction.record_intern(value, id);
        }
        Ok(id)
    }

    fn describe_object(&self, object: ObjectId) -> Option<String> {
        let class_mirror = self.heap.get(object)?.class();
        self.linker
            .classes()
            .find(|(_, c)| c.mirror() == class_mirror)
            .map(|(_, c)| c.descriptor().to_string())
    }
}

fn store_value(value: Value, is_reference: bool) -> Value {
    match (value, is_reference) {
        (Value::Primitive(0), true) => Value::NULL,
        (Value::Reference(_), false) => Value::Primitive(0),
        _ => value,
    }
}

#[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
fn register_bits(value: Value) -> i64 {
    match value {
        Value::Primitive(bits) => i64::from(bits as u32 as i32),
        Value::Reference(Some(_)) => 1,
        Value::Reference(None) => 0,
    }
}

#[allow(clippy::cast_sign_loss)]
fn branch(pc: u32, instruction: &Instruction<'_>) -> u32 {
    let offset = instruction.branch_offset().unwrap_or(0);
    (i64::from(pc) + i64::from(offset)) as u32
}

/// Returns `true` if every instruction of `insns` belongs to the interpretable subset.
///
/// Used to skip initializers that would certainly abort.
#[must_use]
pub fn is_interpretable(insns: &[u16]) -> bool {
    CodeIter::new(insns).all(|instruction| {
        let Ok(instruction) = instruction else {
            return false;
        };
        let op = instruction.opcode();
        !instruction.is_payload()
            && (op == Opcode::NOP
                || (Opcode::MOVE.0..=Opcode::MOVE_RESULT_OBJECT.0).contains(&op.0)
                || (Opcode::CONST_4.0..=Opcode::CONST_CLASS.0).contains(&op.0)
                || op == Opcode::NEW_INSTANCE
                || op.is_static_get()
                || op.is_static_put()
                || op.is_instance_get()
                || op.is_instance_put()
                || matches!(
                    InvokeType::from_opcode(op),
                    Some(InvokeType::Direct | InvokeType::Static)
                )
                || op.is_return()
                || op == Opcode::THROW
                || op.is_goto()
                || (Opcode::IF_EQ.0..=Opcode::IF_LEZ.0).contains(&op.0))
    })
}

fn read_reg(regs: &[Value], r: usize) -> Value {
    regs.get(r).copied().unwrap_or(Value::NULL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dex::{AccessFlags, CodeBuilder, CodeItem, DexFileBuilder},
        runtime::core::core_library,
    };

    const CLINIT: AccessFlags = AccessFlags::STATIC.union(AccessFlags::CONSTRUCTOR);

    /// Loads `LInit;` built by `clinit` and marks it and `Object` ready for initialization.
    fn setup(clinit: impl FnOnce(&mut DexFileBuilder) -> CodeItem) -> (Heap, ClassLinker, ClassId) {
        let mut heap = Heap::new();
        let mut linker = ClassLinker::new(&mut heap, vec![core_library()]).unwrap();
        let mut dex = DexFileBuilder::new("init.dex");
        let code = clinit(&mut dex);
        #[allow(clippy::cast_possible_truncation)]
        let object_init = dex.method_id(core::OBJECT, "<init>", "V") as u16;
        let ctor = CodeBuilder::new(1, 1)
            .invoke(Opcode::INVOKE_DIRECT, &[0], object_init)
            .return_void()
            .build();
        dex.class("LInit;")
            .superclass(core::OBJECT)
            .static_field("value", "I", AccessFlags::PUBLIC)
            .static_field("name", core::STRING, AccessFlags::PUBLIC)
            .static_field("instance", "LInit;", AccessFlags::PUBLIC)
            .direct_method("<clinit>", "V", CLINIT, Some(code))
            .direct_method("<init>", "V", AccessFlags::PUBLIC | AccessFlags::CONSTRUCTOR, Some(ctor))
            .finish();
        linker.register_dex_file(&mut heap, dex.build(), None).unwrap();

        let object = linker.lookup_class(core::OBJECT, None).unwrap();
        linker.set_class_status(&mut heap, object, ClassStatus::Initialized);
        let class = linker.find_class(&mut heap, "LInit;", None).unwrap();
        linker.set_class_status(&mut heap, class, ClassStatus::Verified);
        (heap, linker, class)
    }

    fn static_value(linker: &ClassLinker, heap: &Heap, class: ClassId, name: &str, ty: &str) -> Value {
        let field = linker.find_static_field(class, name, ty).unwrap();
        let f = linker.field(field);
        heap.object(linker.class(class).mirror())
            .get_field(f.offset(), f.size(), f.is_reference())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn field(dex: &mut DexFileBuilder, name: &str, ty: &str) -> u16 {
        dex.field_id("LInit;", name, ty) as u16
    }

    #[test]
    fn test_clinit_writes_statics() {
        let (mut heap, mut linker, class) = setup(|dex| {
            let value = field(dex, "value", "I");
            let name = field(dex, "name", core::STRING);
            let instance = field(dex, "instance", "LInit;");
            #[allow(clippy::cast_possible_truncation)]
            let hello = dex.string_id("hello") as u16;
            #[allow(clippy::cast_possible_truncation)]
            let init_type = dex.type_id("LInit;") as u16;
            #[allow(clippy::cast_possible_truncation)]
            let ctor = dex.method_id("LInit;", "<init>", "V") as u16;
            CodeBuilder::new(3, 0)
                .const16(0, 42)
                .static_field_op(Opcode::SPUT, 0, value)
                .const_string(1, hello)
                .static_field_op(Opcode::SPUT_OBJECT, 1, name)
                .new_instance(2, init_type)
                .invoke(Opcode::INVOKE_DIRECT, &[2], ctor)
                .static_field_op(Opcode::SPUT_OBJECT, 2, instance)
                .return_void()
                .build()
        });

        let outcome = ensure_initialized(&mut linker, &mut heap, class, true, true).unwrap();
        assert_eq!(outcome, InitOutcome::Initialized);
        assert_eq!(linker.class(class).status(), ClassStatus::Initialized);
        assert_eq!(
            static_value(&linker, &heap, class, "value", "I"),
            Value::Primitive(42)
        );
        let hello = linker.intern_table().lookup("hello");
        assert!(hello.is_some());
        assert_eq!(
            static_value(&linker, &heap, class, "name", core::STRING).reference(),
            hello
        );
        assert!(static_value(&linker, &heap, class, "instance", "LInit;")
            .reference()
            .is_some());
    }

    #[test]
    fn test_throwing_clinit_rolls_back() {
        let (mut heap, mut linker, class) = setup(|dex| {
            let value = field(dex, "value", "I");
            #[allow(clippy::cast_possible_truncation)]
            let bye = dex.string_id("bye") as u16;
            CodeBuilder::new(2, 0)
                .const4(0, 7)
                .static_field_op(Opcode::SPUT, 0, value)
                .const_string(1, bye)
                .const4(1, 0)
                .throw(1)
                .build()
        });
        let objects_before = heap.num_objects();

        let result = ensure_initialized(&mut linker, &mut heap, class, true, true);
        assert!(matches!(result, Err(crate::Error::InitializationFailed(_))));
        assert_eq!(linker.class(class).status(), ClassStatus::Verified);
        assert_eq!(
            static_value(&linker, &heap, class, "value", "I"),
            Value::Primitive(0)
        );
        assert!(linker.intern_table().lookup("bye").is_none());
        assert_eq!(heap.num_objects(), objects_before);
    }

    #[test]
    fn test_unsupported_instruction_aborts() {
        let (mut heap, mut linker, class) = setup(|dex| {
            let value = field(dex, "value", "I");
            CodeBuilder::new(2, 0)
                .const4(0, 1)
                .static_field_op(Opcode::SPUT, 0, value)
                .add_int_lit8(1, 0, 1)
                .return_void()
                .build()
        });
        let result = ensure_initialized(&mut linker, &mut heap, class, true, true);
        let Err(crate::Error::InitializationFailed(message)) = result else {
            panic!("expected an initialization failure");
        };
        assert!(message.contains("add-int/lit8"));
        assert_eq!(
            static_value(&linker, &heap, class, "value", "I"),
            Value::Primitive(0)
        );
    }

    #[test]
    fn test_statics_permission_defers() {
        let (mut heap, mut linker, class) = setup(|_| CodeBuilder::new(1, 0).return_void().build());
        let outcome = ensure_initialized(&mut linker, &mut heap, class, false, true).unwrap();
        assert_eq!(outcome, InitOutcome::Deferred);
        assert_eq!(linker.class(class).status(), ClassStatus::Verified);
    }

    #[test]
    fn test_unverified_parent_defers() {
        let (mut heap, mut linker, class) = setup(|_| CodeBuilder::new(1, 0).return_void().build());
        let object = linker.lookup_class(core::OBJECT, None).unwrap();
        linker.set_class_status(&mut heap, object, ClassStatus::Resolved);
        assert_eq!(
            ensure_initialized(&mut linker, &mut heap, class, true, false).unwrap(),
            InitOutcome::Deferred
        );
        assert_eq!(
            ensure_initialized(&mut linker, &mut heap, class, true, true).unwrap(),
            InitOutcome::Deferred
        );
    }

    #[test]
    fn test_is_interpretable() {
        let simple = CodeBuilder::new(1, 0).const4(0, 1).return_void().build();
        assert!(is_interpretable(&simple.insns));
        let locking = CodeBuilder::new(1, 0).monitor_enter(0).return_void().build();
        assert!(!is_interpretable(&locking.insns));
    }
}
