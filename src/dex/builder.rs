//! Programmatic construction of bytecode files.
//!
//! [`DexFileBuilder`] interns strings and type descriptors and hands out table indices;
//! [`ClassBuilder`] declares one class at a time, and [`CodeBuilder`] assembles instruction
//! streams.
//!
//! # Example
//!
//! ```rust
//! use oatforge::dex::{AccessFlags, CodeBuilder, DexFileBuilder};
//!
//! let mut builder = DexFileBuilder::new("app.dex");
//! builder
//!     .class("LPoint;")
//!     .superclass("Ljava/lang/Object;")
//!     .instance_field("x", "I", AccessFlags::PUBLIC)
//!     .direct_method(
//!         "<init>",
//!         "V",
//!         AccessFlags::PUBLIC | AccessFlags::CONSTRUCTOR,
//!         Some(CodeBuilder::new(1, 1).return_void().build()),
//!     )
//!     .finish();
//! let dex = builder.build();
//! assert_eq!(dex.class_defs().len(), 1);
//! ```

use rustc_hash::FxHashMap;
use sha1::{Digest, Sha1};

use crate::dex::{
    file::{
        AccessFlags, CatchHandler, ClassDef, CodeItem, DexFile, EncodedField, EncodedMethod,
        FieldId, MethodId, TryItem,
    },
    instruction::Opcode,
};

/// Builder for a [`DexFile`].
pub struct DexFileBuilder {
    location: String,
    strings: Vec<String>,
    string_index: FxHashMap<String, u32>,
    types: Vec<u32>,
    type_index: FxHashMap<u32, u32>,
    fields: Vec<FieldId>,
    methods: Vec<MethodId>,
    class_defs: Vec<ClassDef>,
}

impl DexFileBuilder {
    /// Creates an empty builder for a file at `location`.
    #[must_use]
    pub fn new(location: &str) -> Self {
        DexFileBuilder {
            location: location.to_string(),
            strings: Vec::new(),
            string_index: FxHashMap::default(),
            types: Vec::new(),
            type_index: FxHashMap::default(),
            fields: Vec::new(),
            methods: Vec::new(),
            class_defs: Vec::new(),
        }
    }

    /// Interns `value` and returns its string index.
    #[allow(clippy::cast_possible_truncation)]
    pub fn string_id(&mut self, value: &str) -> u32 {
        if let Some(&idx) = self.string_index.get(value) {
            return idx;
        }
        let idx = self.strings.len() as u32;
        self.strings.push(value.to_string());
        self.string_index.insert(value.to_string(), idx);
        idx
    }

    /// Interns the descriptor and returns its type index.
    #[allow(clippy::cast_possible_truncation)]
    pub fn type_id(&mut self, descriptor: &str) -> u32 {
        let string_idx = self.string_id(descriptor);
        if let Some(&idx) = self.type_index.get(&string_idx) {
            return idx;
        }
        let idx = self.types.len() as u32;
        self.types.push(string_idx);
        self.type_index.insert(string_idx, idx);
        idx
    }

    /// Returns the index of the field reference, adding it if needed.
    #[allow(clippy::cast_possible_truncation)]
    pub fn field_id(&mut self, class: &str, name: &str, type_descriptor: &str) -> u32 {
        let class_idx = self.type_id(class);
        let type_idx = self.type_id(type_descriptor);
        if let Some(pos) = self
            .fields
            .iter()
            .position(|f| f.class_idx == class_idx && f.type_idx == type_idx && f.name == name)
        {
            return pos as u32;
        }
        self.fields.push(FieldId {
            class_idx,
            type_idx,
            name: name.to_string(),
        });
        (self.fields.len() - 1) as u32
    }

    /// Returns the index of the method reference, adding it if needed.
    #[allow(clippy::cast_possible_truncation)]
    pub fn method_id(&mut self, class: &str, name: &str, shorty: &str) -> u32 {
        let class_idx = self.type_id(class);
        self.string_id(name);
        if let Some(pos) = self
            .methods
            .iter()
            .position(|m| m.class_idx == class_idx && m.name == name && m.shorty == shorty)
        {
            return pos as u32;
        }
        self.methods.push(MethodId {
            class_idx,
            name: name.to_string(),
            shorty: shorty.to_string(),
        });
        (self.methods.len() - 1) as u32
    }

    /// Starts declaring the class `descriptor`.
    pub fn class(&mut self, descriptor: &str) -> ClassBuilder<'_> {
        let class_idx = self.type_id(descriptor);
        ClassBuilder {
            descriptor: descriptor.to_string(),
            def: ClassDef {
                class_idx,
                access_flags: AccessFlags::PUBLIC,
                superclass_idx: None,
                interfaces: Vec::new(),
                static_fields: Vec::new(),
                instance_fields: Vec::new(),
                direct_methods: Vec::new(),
                virtual_methods: Vec::new(),
            },
            builder: self,
        }
    }

    /// Finishes the file. The checksum is the leading word of a SHA-1 digest over the location
    /// and the declared tables.
    #[must_use]
    pub fn build(self) -> DexFile {
        let mut hasher = Sha1::new();
        hasher.update(self.location.as_bytes());
        for string in &self.strings {
            hasher.update(string.as_bytes());
            hasher.update([0u8]);
        }
        for type_idx in &self.types {
            hasher.update(type_idx.to_le_bytes());
        }
        hasher.update((self.class_defs.len() as u64).to_le_bytes());
        let digest = hasher.finalize();
        let checksum = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]);
        DexFile {
            location: self.location,
            checksum,
            strings: self.strings,
            types: self.types,
            fields: self.fields,
            methods: self.methods,
            class_defs: self.class_defs,
        }
    }
}

/// Builder for one class definition. Members are declared against the class being built.
pub struct ClassBuilder<'a> {
    builder: &'a mut DexFileBuilder,
    descriptor: String,
    def: ClassDef,
}

impl ClassBuilder<'_> {
    /// Sets the class access flags.
    #[must_use]
    pub fn access_flags(mut self, flags: AccessFlags) -> Self {
        self.def.access_flags = flags;
        self
    }

    /// Sets the superclass.
    #[must_use]
    pub fn superclass(mut self, descriptor: &str) -> Self {
        self.def.superclass_idx = Some(self.builder.type_id(descriptor));
        self
    }

    /// Adds a directly implemented interface.
    #[must_use]
    pub fn interface(mut self, descriptor: &str) -> Self {
        let idx = self.builder.type_id(descriptor);
        self.def.interfaces.push(idx);
        self
    }

    /// Declares a static field. `STATIC` is added to `flags`.
    #[must_use]
    pub fn static_field(mut self, name: &str, type_descriptor: &str, flags: AccessFlags) -> Self {
        let field_idx = self.builder.field_id(&self.descriptor, name, type_descriptor);
        self.def.static_fields.push(EncodedField {
            field_idx,
            access_flags: flags | AccessFlags::STATIC,
        });
        self
    }

    /// Declares an instance field.
    #[must_use]
    pub fn instance_field(mut self, name: &str, type_descriptor: &str, flags: AccessFlags) -> Self {
        let field_idx = self.builder.field_id(&self.descriptor, name, type_descriptor);
        self.def.instance_fields.push(EncodedField {
            field_idx,
            access_flags: flags,
        });
        self
    }

    /// Declares a direct (static, private or constructor) method.
    #[must_use]
    pub fn direct_method(
        mut self,
        name: &str,
        shorty: &str,
        flags: AccessFlags,
        code: Option<CodeItem>,
    ) -> Self {
        let method_idx = self.builder.method_id(&self.descriptor, name, shorty);
        self.def.direct_methods.push(EncodedMethod {
            method_idx,
            access_flags: flags,
            code,
        });
        self
    }

    /// Declares a virtual method.
    #[must_use]
    pub fn virtual_method(
        mut self,
        name: &str,
        shorty: &str,
        flags: AccessFlags,
        code: Option<CodeItem>,
    ) -> Self {
        let method_idx = self.builder.method_id(&self.descriptor, name, shorty);
        self.def.virtual_methods.push(EncodedMethod {
            method_idx,
            access_flags: flags,
            code,
        });
        self
    }

    /// Adds the class definition to the file and returns its class definition index.
    #[allow(clippy::cast_possible_truncation)]
    pub fn finish(self) -> u32 {
        self.builder.class_defs.push(self.def);
        (self.builder.class_defs.len() - 1) as u32
    }
}

/// Assembler for instruction streams.
pub struct CodeBuilder {
    registers_size: u16,
    ins_size: u16,
    outs_size: u16,
    insns: Vec<u16>,
    tries: Vec<TryItem>,
}

impl CodeBuilder {
    /// Starts a body with `registers_size` registers, the last `ins_size` of which hold the
    /// incoming arguments.
    #[must_use]
    pub fn new(registers_size: u16, ins_size: u16) -> Self {
        CodeBuilder {
            registers_size,
            ins_size,
            outs_size: 0,
            insns: Vec::new(),
            tries: Vec::new(),
        }
    }

    /// Current program counter.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn pc(&self) -> u32 {
        self.insns.len() as u32
    }

    fn emit(&mut self, units: &[u16]) -> &mut Self {
        self.insns.extend_from_slice(units);
        self
    }

    fn op_aa(op: Opcode, aa: u8) -> u16 {
        u16::from(op.0) | (u16::from(aa) << 8)
    }

    fn op_ba(op: Opcode, a: u8, b: u8) -> u16 {
        u16::from(op.0) | (u16::from(a & 0xF) << 8) | (u16::from(b & 0xF) << 12)
    }

    /// `nop`
    pub fn nop(&mut self) -> &mut Self {
        self.emit(&[u16::from(Opcode::NOP.0)])
    }

    /// `return-void`
    pub fn return_void(&mut self) -> &mut Self {
        self.emit(&[u16::from(Opcode::RETURN_VOID.0)])
    }

    /// `return vAA`
    pub fn return_value(&mut self, reg: u8) -> &mut Self {
        self.emit(&[Self::op_aa(Opcode::RETURN, reg)])
    }

    /// `return-object vAA`
    pub fn return_object(&mut self, reg: u8) -> &mut Self {
        self.emit(&[Self::op_aa(Opcode::RETURN_OBJECT, reg)])
    }

    /// `const/4 vA, #B`
    pub fn const4(&mut self, reg: u8, literal: i8) -> &mut Self {
        #[allow(clippy::cast_sign_loss)]
        let lit = (literal as u8) & 0xF;
        self.emit(&[Self::op_ba(Opcode::CONST_4, reg, lit)])
    }

    /// `const/16 vAA, #BBBB`
    #[allow(clippy::cast_sign_loss)]
    pub fn const16(&mut self, reg: u8, literal: i16) -> &mut Self {
        self.emit(&[Self::op_aa(Opcode::CONST_16, reg), literal as u16])
    }

    /// `const vAA, #BBBBBBBB`
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    pub fn const32(&mut self, reg: u8, literal: i32) -> &mut Self {
        let value = literal as u32;
        self.emit(&[
            Self::op_aa(Opcode::CONST, reg),
            value as u16,
            (value >> 16) as u16,
        ])
    }

    /// `const-wide vAA, #BBBBBBBBBBBBBBBB`
    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    pub fn const_wide(&mut self, reg: u8, literal: i64) -> &mut Self {
        let value = literal as u64;
        self.emit(&[
            Self::op_aa(Opcode::CONST_WIDE, reg),
            value as u16,
            (value >> 16) as u16,
            (value >> 32) as u16,
            (value >> 48) as u16,
        ])
    }

    /// `const-string vAA, string@BBBB`
    pub fn const_string(&mut self, reg: u8, string_idx: u16) -> &mut Self {
        self.emit(&[Self::op_aa(Opcode::CONST_STRING, reg), string_idx])
    }

    /// `const-class vAA, type@BBBB`
    pub fn const_class(&mut self, reg: u8, type_idx: u16) -> &mut Self {
        self.emit(&[Self::op_aa(Opcode::CONST_CLASS, reg), type_idx])
    }

    /// `new-instance vAA, type@BBBB`
    pub fn new_instance(&mut self, reg: u8, type_idx: u16) -> &mut Self {
        self.emit(&[Self::op_aa(Opcode::NEW_INSTANCE, reg), type_idx])
    }

    /// `check-cast vAA, type@BBBB`
    pub fn check_cast(&mut self, reg: u8, type_idx: u16) -> &mut Self {
        self.emit(&[Self::op_aa(Opcode::CHECK_CAST, reg), type_idx])
    }

    /// `move-object vA, vB`
    pub fn move_object(&mut self, dst: u8, src: u8) -> &mut Self {
        self.emit(&[Self::op_ba(Opcode::MOVE_OBJECT, dst, src)])
    }

    /// `move-object/from16 vAA, vBBBB`
    pub fn move_object_from16(&mut self, dst: u8, src: u16) -> &mut Self {
        self.emit(&[Self::op_aa(Opcode::MOVE_OBJECT_FROM16, dst), src])
    }

    /// `move-object/16 vAAAA, vBBBB`
    pub fn move_object_16(&mut self, dst: u16, src: u16) -> &mut Self {
        self.emit(&[Opcode::MOVE_OBJECT_16.0.into(), dst, src])
    }

    /// `move-result-object vAA`
    pub fn move_result_object(&mut self, reg: u8) -> &mut Self {
        self.emit(&[Self::op_aa(Opcode::MOVE_RESULT_OBJECT, reg)])
    }

    /// Instance field access (`iget*`/`iput*`): `op vA, vB, field@CCCC`.
    pub fn instance_field_op(&mut self, op: Opcode, value: u8, object: u8, field_idx: u16) -> &mut Self {
        self.emit(&[Self::op_ba(op, value, object), field_idx])
    }

    /// Static field access (`sget*`/`sput*`): `op vAA, field@BBBB`.
    pub fn static_field_op(&mut self, op: Opcode, value: u8, field_idx: u16) -> &mut Self {
        self.emit(&[Self::op_aa(op, value), field_idx])
    }

    /// Non-range invoke: `op {args}, method@BBBB`. At most five argument registers.
    ///
    /// # Panics
    /// Panics if more than five registers are passed.
    #[allow(clippy::cast_possible_truncation)]
    pub fn invoke(&mut self, op: Opcode, args: &[u8], method_idx: u16) -> &mut Self {
        assert!(args.len() <= 5, "35c invokes take at most five arguments");
        let count = args.len() as u8;
        let g = args.get(4).copied().unwrap_or(0);
        let packed = args
            .iter()
            .take(4)
            .enumerate()
            .fold(0u16, |acc, (i, &r)| acc | (u16::from(r & 0xF) << (i * 4)));
        self.outs_size = self.outs_size.max(u16::from(count));
        self.emit(&[Self::op_ba(op, g, count), method_idx, packed])
    }

    /// Range invoke: `op {vCCCC .. vNNNN}, method@BBBB`.
    pub fn invoke_range(&mut self, op: Opcode, first: u16, count: u8, method_idx: u16) -> &mut Self {
        self.outs_size = self.outs_size.max(u16::from(count));
        self.emit(&[Self::op_aa(op, count), method_idx, first])
    }

    /// `add-int vAA, vBB, vCC`
    pub fn add_int(&mut self, dst: u8, a: u8, b: u8) -> &mut Self {
        self.emit(&[
            Self::op_aa(Opcode::ADD_INT, dst),
            u16::from(a) | (u16::from(b) << 8),
        ])
    }

    /// `add-int/lit8 vAA, vBB, #CC`
    #[allow(clippy::cast_sign_loss)]
    pub fn add_int_lit8(&mut self, dst: u8, src: u8, literal: i8) -> &mut Self {
        self.emit(&[
            Self::op_aa(Opcode::ADD_INT_LIT8, dst),
            u16::from(src) | (u16::from(literal as u8) << 8),
        ])
    }

    /// `goto +AA`
    #[allow(clippy::cast_sign_loss)]
    pub fn goto(&mut self, offset: i8) -> &mut Self {
        self.emit(&[Self::op_aa(Opcode::GOTO, offset as u8)])
    }

    /// `if-eqz vAA, +BBBB`
    #[allow(clippy::cast_sign_loss)]
    pub fn if_eqz(&mut self, reg: u8, offset: i16) -> &mut Self {
        self.emit(&[Self::op_aa(Opcode::IF_EQZ, reg), offset as u16])
    }

    /// `throw vAA`
    pub fn throw(&mut self, reg: u8) -> &mut Self {
        self.emit(&[Self::op_aa(Opcode::THROW, reg)])
    }

    /// `monitor-enter vAA`
    pub fn monitor_enter(&mut self, reg: u8) -> &mut Self {
        self.emit(&[Self::op_aa(Opcode::MONITOR_ENTER, reg)])
    }

    /// `monitor-exit vAA`
    pub fn monitor_exit(&mut self, reg: u8) -> &mut Self {
        self.emit(&[Self::op_aa(Opcode::MONITOR_EXIT, reg)])
    }

    /// Appends raw code units.
    pub fn raw(&mut self, units: &[u16]) -> &mut Self {
        self.emit(units)
    }

    /// Declares a try block over `[start, start + count)` with the given handlers.
    pub fn try_block(&mut self, start: u32, count: u16, handlers: &[(Option<u32>, u32)]) -> &mut Self {
        self.tries.push(TryItem {
            start_addr: start,
            insn_count: count,
            handlers: handlers
                .iter()
                .map(|&(type_idx, address)| CatchHandler { type_idx, address })
                .collect(),
        });
        self
    }

    /// Finishes the body.
    #[must_use]
    pub fn build(&mut self) -> CodeItem {
        CodeItem {
            registers_size: self.registers_size,
            ins_size: self.ins_size,
            outs_size: self.outs_size,
            insns: std::mem::take(&mut self.insns),
            tries: std::mem::take(&mut self.tries),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dex::instruction::decode_instruction;

    #[test]
    fn test_builder_interns_descriptors() {
        let mut builder = DexFileBuilder::new("test.dex");
        let a = builder.type_id("LFoo;");
        let b = builder.type_id("LFoo;");
        let c = builder.type_id("LBar;");
        assert_eq!(a, b);
        assert_ne!(a, c);

        let dex = builder.build();
        assert_eq!(dex.type_descriptor(a).unwrap(), "LFoo;");
        assert_eq!(dex.find_type_idx("LBar;"), Some(c));
    }

    #[test]
    fn test_class_builder_declares_members() {
        let mut builder = DexFileBuilder::new("test.dex");
        let def_idx = builder
            .class("LFoo;")
            .superclass("Ljava/lang/Object;")
            .static_field("COUNT", "I", AccessFlags::FINAL)
            .instance_field("next", "LFoo;", AccessFlags::PRIVATE)
            .direct_method("<clinit>", "V", AccessFlags::STATIC | AccessFlags::CONSTRUCTOR, None)
            .virtual_method("run", "V", AccessFlags::PUBLIC, None)
            .finish();
        let dex = builder.build();

        let def = dex.class_def(def_idx).unwrap();
        assert_eq!(dex.class_descriptor(def).unwrap(), "LFoo;");
        assert!(def.static_fields[0].access_flags.contains(AccessFlags::STATIC));
        assert_eq!(def.methods().count(), 2);
        assert!(dex.find_method_idx("LFoo;", "run", "V").is_some());
        assert!(dex.find_field_idx("LFoo;", "next").is_some());
    }

    #[test]
    fn test_code_builder_encodings() {
        let code = CodeBuilder::new(4, 1)
            .const4(0, -1)
            .check_cast(1, 7)
            .instance_field_op(Opcode::IGET, 2, 3, 0x55)
            .invoke(Opcode::INVOKE_VIRTUAL, &[3, 2], 9)
            .return_void()
            .build();

        let cast = decode_instruction(&code.insns, 1).unwrap();
        assert_eq!(cast.opcode(), Opcode::CHECK_CAST);
        assert_eq!(cast.vreg_a(), 1);
        assert_eq!(cast.index(), Some(7));

        let get = decode_instruction(&code.insns, 3).unwrap();
        assert_eq!((get.vreg_a(), get.vreg_b(), get.vreg_c()), (2, 3, 0x55));

        let invoke = decode_instruction(&code.insns, 5).unwrap();
        assert_eq!(invoke.argument_registers(), vec![3, 2]);
        assert_eq!(code.outs_size, 2);
    }
}
