//! Bytecode instruction decoding and in-place mutation.
//!
//! Instructions are sequences of 16-bit code units. The low byte of the first unit is the
//! opcode; the instruction [`Format`] determines how many units follow and where the register
//! and index operands live. This module provides:
//!
//! - [`OPCODES`] - The static 256-entry opcode table (mnemonic and format)
//! - [`decode_instruction`] - Decode the instruction at a program counter into an
//!   [`Instruction`] view with positional operand accessors
//! - [`InstructionMut`] - Mutate opcode and operands of an instruction in place
//! - [`CodeIter`] - Sequential decoding of a whole method body
//!
//! Payload pseudo-instructions (`packed-switch`, `sparse-switch` and `fill-array-data` data
//! tables) share the `nop` opcode and are sized from their own headers.
//!
//! # Example
//!
//! ```rust
//! use oatforge::dex::{decode_instruction, Opcode};
//!
//! // const/4 v0, #1 ; return-void
//! let insns = [0x1012, 0x000e];
//! let first = decode_instruction(&insns, 0)?;
//! assert_eq!(first.opcode(), Opcode::CONST_4);
//! assert_eq!(first.size_in_code_units(), 1);
//! assert_eq!(decode_instruction(&insns, 1)?.opcode(), Opcode::RETURN_VOID);
//! # Ok::<(), oatforge::Error>(())
//! ```

use std::fmt;

use crate::{Error::OutOfBounds, Result};

/// Identifier of a packed-switch payload in the first code unit.
pub const PACKED_SWITCH_SIGNATURE: u16 = 0x0100;
/// Identifier of a sparse-switch payload in the first code unit.
pub const SPARSE_SWITCH_SIGNATURE: u16 = 0x0200;
/// Identifier of a fill-array-data payload in the first code unit.
pub const ARRAY_DATA_SIGNATURE: u16 = 0x0300;

/// Instruction formats, named after the bytecode format identifiers (`22c` = two code units,
/// two registers, one constant pool index).
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    K10x,
    K12x,
    K11n,
    K11x,
    K10t,
    K20t,
    K22x,
    K21t,
    K21s,
    K21h,
    K21c,
    K23x,
    K22b,
    K22t,
    K22s,
    K22c,
    K32x,
    K30t,
    K31t,
    K31i,
    K31c,
    K35c,
    K3rc,
    K45cc,
    K4rcc,
    K51l,
}

impl Format {
    /// Size of an instruction of this format in 16-bit code units.
    #[must_use]
    pub const fn size_in_code_units(self) -> usize {
        match self {
            Format::K10x | Format::K12x | Format::K11n | Format::K11x | Format::K10t => 1,
            Format::K20t
            | Format::K22x
            | Format::K21t
            | Format::K21s
            | Format::K21h
            | Format::K21c
            | Format::K23x
            | Format::K22b
            | Format::K22t
            | Format::K22s
            | Format::K22c => 2,
            Format::K32x
            | Format::K30t
            | Format::K31t
            | Format::K31i
            | Format::K31c
            | Format::K35c
            | Format::K3rc => 3,
            Format::K45cc | Format::K4rcc => 4,
            Format::K51l => 5,
        }
    }
}

/// Static description of one opcode.
#[derive(Debug, Clone, Copy)]
pub struct OpcodeInfo {
    /// Mnemonic, empty for unused opcodes
    pub name: &'static str,
    /// Encoding format
    pub format: Format,
}

macro_rules! op {
    ($name:expr, $format:ident) => {
        OpcodeInfo {
            name: $name,
            format: Format::$format,
        }
    };
}

/// The opcode table, indexed by opcode byte.
#[rustfmt::skip]
pub static OPCODES: [OpcodeInfo; 256] = [
    // 0x00
    op!("nop", K10x), op!("move", K12x), op!("move/from16", K22x), op!("move/16", K32x),
    op!("move-wide", K12x), op!("move-wide/from16", K22x), op!("move-wide/16", K32x), op!("move-object", K12x),
    op!("move-object/from16", K22x), op!("move-object/16", K32x), op!("move-result", K11x), op!("move-result-wide", K11x),
    op!("move-result-object", K11x), op!("move-exception", K11x), op!("return-void", K10x), op!("return", K11x),
    // 0x10
    op!("return-wide", K11x), op!("return-object", K11x), op!("const/4", K11n), op!("const/16", K21s),
    op!("const", K31i), op!("const/high16", K21h), op!("const-wide/16", K21s), op!("const-wide/32", K31i),
    op!("const-wide", K51l), op!("const-wide/high16", K21h), op!("const-string", K21c), op!("const-string/jumbo", K31c),
    op!("const-class", K21c), op!("monitor-enter", K11x), op!("monitor-exit", K11x), op!("check-cast", K21c),
    // 0x20
    op!("instance-of", K22c), op!("array-length", K12x), op!("new-instance", K21c), op!("new-array", K22c),
    op!("filled-new-array", K35c), op!("filled-new-array/range", K3rc), op!("fill-array-data", K31t), op!("throw", K11x),
    op!("goto", K10t), op!("goto/16", K20t), op!("goto/32", K30t), op!("packed-switch", K31t),
    op!("sparse-switch", K31t), op!("cmpl-float", K23x), op!("cmpg-float", K23x), op!("cmpl-double", K23x),
    // 0x30
    op!("cmpg-double", K23x), op!("cmp-long", K23x), op!("if-eq", K22t), op!("if-ne", K22t),
    op!("if-lt", K22t), op!("if-ge", K22t), op!("if-gt", K22t), op!("if-le", K22t),
    op!("if-eqz", K21t), op!("if-nez", K21t), op!("if-ltz", K21t), op!("if-gez", K21t),
    op!("if-gtz", K21t), op!("if-lez", K21t), op!("", K10x), op!("", K10x),
    // 0x40
    op!("", K10x), op!("", K10x), op!("", K10x), op!("", K10x),
    op!("aget", K23x), op!("aget-wide", K23x), op!("aget-object", K23x), op!("aget-boolean", K23x),
    op!("aget-byte", K23x), op!("aget-char", K23x), op!("aget-short", K23x), op!("aput", K23x),
    op!("aput-wide", K23x), op!("aput-object", K23x), op!("aput-boolean", K23x), op!("aput-byte", K23x),
    // 0x50
    op!("aput-char", K23x), op!("aput-short", K23x), op!("iget", K22c), op!("iget-wide", K22c),
    op!("iget-object", K22c), op!("iget-boolean", K22c), op!("iget-byte", K22c), op!("iget-char", K22c),
    op!("iget-short", K22c), op!("iput", K22c), op!("iput-wide", K22c), op!("iput-object", K22c),
    op!("iput-boolean", K22c), op!("iput-byte", K22c), op!("iput-char", K22c), op!("iput-short", K22c),
    // 0x60
    op!("sget", K21c), op!("sget-wide", K21c), op!("sget-object", K21c), op!("sget-boolean", K21c),
    op!("sget-byte", K21c), op!("sget-char", K21c), op!("sget-short", K21c), op!("sput", K21c),
    op!("sput-wide", K21c), op!("sput-object", K21c), op!("sput-boolean", K21c), op!("sput-byte", K21c),
    op!("sput-char", K21c), op!("sput-short", K21c), op!("invoke-virtual", K35c), op!("invoke-super", K35c),
    // 0x70
    op!("invoke-direct", K35c), op!("invoke-static", K35c), op!("invoke-interface", K35c), op!("return-void-no-barrier", K10x),
    op!("invoke-virtual/range", K3rc), op!("invoke-super/range", K3rc), op!("invoke-direct/range", K3rc), op!("invoke-static/range", K3rc),
    op!("invoke-interface/range", K3rc), op!("", K10x), op!("", K10x), op!("neg-int", K12x),
    op!("not-int", K12x), op!("neg-long", K12x), op!("not-long", K12x), op!("neg-float", K12x),
    // 0x80
    op!("neg-double", K12x), op!("int-to-long", K12x), op!("int-to-float", K12x), op!("int-to-double", K12x),
    op!("long-to-int", K12x), op!("long-to-float", K12x), op!("long-to-double", K12x), op!("float-to-int", K12x),
    op!("float-to-long", K12x), op!("float-to-double", K12x), op!("double-to-int", K12x), op!("double-to-long", K12x),
    op!("double-to-float", K12x), op!("int-to-byte", K12x), op!("int-to-char", K12x), op!("int-to-short", K12x),
    // 0x90
    op!("add-int", K23x), op!("sub-int", K23x), op!("mul-int", K23x), op!("div-int", K23x),
    op!("rem-int", K23x), op!("and-int", K23x), op!("or-int", K23x), op!("xor-int", K23x),
    op!("shl-int", K23x), op!("shr-int", K23x), op!("ushr-int", K23x), op!("add-long", K23x),
    op!("sub-long", K23x), op!("mul-long", K23x), op!("div-long", K23x), op!("rem-long", K23x),
    // 0xa0
    op!("and-long", K23x), op!("or-long", K23x), op!("xor-long", K23x), op!("shl-long", K23x),
    op!("shr-long", K23x), op!("ushr-long", K23x), op!("add-float", K23x), op!("sub-float", K23x),
    op!("mul-float", K23x), op!("div-float", K23x), op!("rem-float", K23x), op!("add-double", K23x),
    op!("sub-double", K23x), op!("mul-double", K23x), op!("div-double", K23x), op!("rem-double", K23x),
    // 0xb0
    op!("add-int/2addr", K12x), op!("sub-int/2addr", K12x), op!("mul-int/2addr", K12x), op!("div-int/2addr", K12x),
    op!("rem-int/2addr", K12x), op!("and-int/2addr", K12x), op!("or-int/2addr", K12x), op!("xor-int/2addr", K12x),
    op!("shl-int/2addr", K12x), op!("shr-int/2addr", K12x), op!("ushr-int/2addr", K12x), op!("add-long/2addr", K12x),
    op!("sub-long/2addr", K12x), op!("mul-long/2addr", K12x), op!("div-long/2addr", K12x), op!("rem-long/2addr", K12x),
    // 0xc0
    op!("and-long/2addr", K12x), op!("or-long/2addr", K12x), op!("xor-long/2addr", K12x), op!("shl-long/2addr", K12x),
    op!("shr-long/2addr", K12x), op!("ushr-long/2addr", K12x), op!("add-float/2addr", K12x), op!("sub-float/2addr", K12x),
    op!("mul-float/2addr", K12x), op!("div-float/2addr", K12x), op!("rem-float/2addr", K12x), op!("add-double/2addr", K12x),
    op!("sub-double/2addr", K12x), op!("mul-double/2addr", K12x), op!("div-double/2addr", K12x), op!("rem-double/2addr", K12x),
    // 0xd0
    op!("add-int/lit16", K22s), op!("rsub-int", K22s), op!("mul-int/lit16", K22s), op!("div-int/lit16", K22s),
    op!("rem-int/lit16", K22s), op!("and-int/lit16", K22s), op!("or-int/lit16", K22s), op!("xor-int/lit16", K22s),
    op!("add-int/lit8", K22b), op!("rsub-int/lit8", K22b), op!("mul-int/lit8", K22b), op!("div-int/lit8", K22b),
    op!("rem-int/lit8", K22b), op!("and-int/lit8", K22b), op!("or-int/lit8", K22b), op!("xor-int/lit8", K22b),
    // 0xe0
    op!("shl-int/lit8", K22b), op!("shr-int/lit8", K22b), op!("ushr-int/lit8", K22b), op!("iget-quick", K22c),
    op!("iget-wide-quick", K22c), op!("iget-object-quick", K22c), op!("iput-quick", K22c), op!("iput-wide-quick", K22c),
    op!("iput-object-quick", K22c), op!("invoke-virtual-quick", K35c), op!("invoke-virtual/range-quick", K3rc), op!("iput-boolean-quick", K22c),
    op!("iput-byte-quick", K22c), op!("iput-char-quick", K22c), op!("iput-short-quick", K22c), op!("iget-boolean-quick", K22c),
    // 0xf0
    op!("iget-byte-quick", K22c), op!("iget-char-quick", K22c), op!("iget-short-quick", K22c), op!("", K10x),
    op!("", K10x), op!("", K10x), op!("", K10x), op!("", K10x),
    op!("", K10x), op!("", K10x), op!("invoke-polymorphic", K45cc), op!("invoke-polymorphic/range", K4rcc),
    op!("invoke-custom", K35c), op!("invoke-custom/range", K3rc), op!("const-method-handle", K21c), op!("const-method-type", K21c),
];

/// An opcode byte.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Opcode(pub u8);

#[allow(missing_docs)]
impl Opcode {
    pub const NOP: Opcode = Opcode(0x00);
    pub const MOVE: Opcode = Opcode(0x01);
    pub const MOVE_OBJECT: Opcode = Opcode(0x07);
    pub const MOVE_OBJECT_FROM16: Opcode = Opcode(0x08);
    pub const MOVE_OBJECT_16: Opcode = Opcode(0x09);
    pub const MOVE_RESULT: Opcode = Opcode(0x0a);
    pub const MOVE_RESULT_OBJECT: Opcode = Opcode(0x0c);
    pub const MOVE_EXCEPTION: Opcode = Opcode(0x0d);
    pub const RETURN_VOID: Opcode = Opcode(0x0e);
    pub const RETURN: Opcode = Opcode(0x0f);
    pub const RETURN_WIDE: Opcode = Opcode(0x10);
    pub const RETURN_OBJECT: Opcode = Opcode(0x11);
    pub const CONST_4: Opcode = Opcode(0x12);
    pub const CONST_16: Opcode = Opcode(0x13);
    pub const CONST: Opcode = Opcode(0x14);
    pub const CONST_HIGH16: Opcode = Opcode(0x15);
    pub const CONST_WIDE_16: Opcode = Opcode(0x16);
    pub const CONST_WIDE_32: Opcode = Opcode(0x17);
    pub const CONST_WIDE: Opcode = Opcode(0x18);
    pub const CONST_WIDE_HIGH16: Opcode = Opcode(0x19);
    pub const CONST_STRING: Opcode = Opcode(0x1a);
    pub const CONST_STRING_JUMBO: Opcode = Opcode(0x1b);
    pub const CONST_CLASS: Opcode = Opcode(0x1c);
    pub const MONITOR_ENTER: Opcode = Opcode(0x1d);
    pub const MONITOR_EXIT: Opcode = Opcode(0x1e);
    pub const CHECK_CAST: Opcode = Opcode(0x1f);
    pub const INSTANCE_OF: Opcode = Opcode(0x20);
    pub const NEW_INSTANCE: Opcode = Opcode(0x22);
    pub const NEW_ARRAY: Opcode = Opcode(0x23);
    pub const FILL_ARRAY_DATA: Opcode = Opcode(0x26);
    pub const THROW: Opcode = Opcode(0x27);
    pub const GOTO: Opcode = Opcode(0x28);
    pub const GOTO_16: Opcode = Opcode(0x29);
    pub const GOTO_32: Opcode = Opcode(0x2a);
    pub const PACKED_SWITCH: Opcode = Opcode(0x2b);
    pub const SPARSE_SWITCH: Opcode = Opcode(0x2c);
    pub const IF_EQ: Opcode = Opcode(0x32);
    pub const IF_LE: Opcode = Opcode(0x37);
    pub const IF_EQZ: Opcode = Opcode(0x38);
    pub const IF_NEZ: Opcode = Opcode(0x39);
    pub const IF_LEZ: Opcode = Opcode(0x3d);
    pub const IGET: Opcode = Opcode(0x52);
    pub const IGET_WIDE: Opcode = Opcode(0x53);
    pub const IGET_OBJECT: Opcode = Opcode(0x54);
    pub const IGET_BOOLEAN: Opcode = Opcode(0x55);
    pub const IGET_BYTE: Opcode = Opcode(0x56);
    pub const IGET_CHAR: Opcode = Opcode(0x57);
    pub const IGET_SHORT: Opcode = Opcode(0x58);
    pub const IPUT: Opcode = Opcode(0x59);
    pub const IPUT_WIDE: Opcode = Opcode(0x5a);
    pub const IPUT_OBJECT: Opcode = Opcode(0x5b);
    pub const IPUT_BOOLEAN: Opcode = Opcode(0x5c);
    pub const IPUT_BYTE: Opcode = Opcode(0x5d);
    pub const IPUT_CHAR: Opcode = Opcode(0x5e);
    pub const IPUT_SHORT: Opcode = Opcode(0x5f);
    pub const SGET: Opcode = Opcode(0x60);
    pub const SGET_WIDE: Opcode = Opcode(0x61);
    pub const SGET_OBJECT: Opcode = Opcode(0x62);
    pub const SGET_SHORT: Opcode = Opcode(0x66);
    pub const SPUT: Opcode = Opcode(0x67);
    pub const SPUT_WIDE: Opcode = Opcode(0x68);
    pub const SPUT_OBJECT: Opcode = Opcode(0x69);
    pub const SPUT_BOOLEAN: Opcode = Opcode(0x6a);
    pub const SPUT_BYTE: Opcode = Opcode(0x6b);
    pub const SPUT_CHAR: Opcode = Opcode(0x6c);
    pub const SPUT_SHORT: Opcode = Opcode(0x6d);
    pub const INVOKE_VIRTUAL: Opcode = Opcode(0x6e);
    pub const INVOKE_SUPER: Opcode = Opcode(0x6f);
    pub const INVOKE_DIRECT: Opcode = Opcode(0x70);
    pub const INVOKE_STATIC: Opcode = Opcode(0x71);
    pub const INVOKE_INTERFACE: Opcode = Opcode(0x72);
    pub const RETURN_VOID_NO_BARRIER: Opcode = Opcode(0x73);
    pub const INVOKE_VIRTUAL_RANGE: Opcode = Opcode(0x74);
    pub const INVOKE_SUPER_RANGE: Opcode = Opcode(0x75);
    pub const INVOKE_DIRECT_RANGE: Opcode = Opcode(0x76);
    pub const INVOKE_STATIC_RANGE: Opcode = Opcode(0x77);
    pub const INVOKE_INTERFACE_RANGE: Opcode = Opcode(0x78);
    pub const ADD_INT: Opcode = Opcode(0x90);
    pub const ADD_INT_2ADDR: Opcode = Opcode(0xb0);
    pub const ADD_INT_LIT8: Opcode = Opcode(0xd8);
    pub const IGET_QUICK: Opcode = Opcode(0xe3);
    pub const IGET_WIDE_QUICK: Opcode = Opcode(0xe4);
    pub const IGET_OBJECT_QUICK: Opcode = Opcode(0xe5);
    pub const IPUT_QUICK: Opcode = Opcode(0xe6);
    pub const IPUT_WIDE_QUICK: Opcode = Opcode(0xe7);
    pub const IPUT_OBJECT_QUICK: Opcode = Opcode(0xe8);
    pub const INVOKE_VIRTUAL_QUICK: Opcode = Opcode(0xe9);
    pub const INVOKE_VIRTUAL_RANGE_QUICK: Opcode = Opcode(0xea);
    pub const IPUT_BOOLEAN_QUICK: Opcode = Opcode(0xeb);
    pub const IPUT_BYTE_QUICK: Opcode = Opcode(0xec);
    pub const IPUT_CHAR_QUICK: Opcode = Opcode(0xed);
    pub const IPUT_SHORT_QUICK: Opcode = Opcode(0xee);
    pub const IGET_BOOLEAN_QUICK: Opcode = Opcode(0xef);
    pub const IGET_BYTE_QUICK: Opcode = Opcode(0xf0);
    pub const IGET_CHAR_QUICK: Opcode = Opcode(0xf1);
    pub const IGET_SHORT_QUICK: Opcode = Opcode(0xf2);
}

impl Opcode {
    /// Static table entry of this opcode.
    #[must_use]
    pub fn info(self) -> &'static OpcodeInfo {
        &OPCODES[self.0 as usize]
    }

    /// Mnemonic of this opcode.
    #[must_use]
    pub fn name(self) -> &'static str {
        self.info().name
    }

    /// Encoding format of this opcode.
    #[must_use]
    pub fn format(self) -> Format {
        self.info().format
    }

    /// Returns `true` if the opcode byte is assigned.
    #[must_use]
    pub fn is_valid(self) -> bool {
        !self.info().name.is_empty()
    }

    /// `iget` through `iget-short`.
    #[must_use]
    pub fn is_instance_get(self) -> bool {
        (Self::IGET.0..=Self::IGET_SHORT.0).contains(&self.0)
    }

    /// `iput` through `iput-short`.
    #[must_use]
    pub fn is_instance_put(self) -> bool {
        (Self::IPUT.0..=Self::IPUT_SHORT.0).contains(&self.0)
    }

    /// `sget` through `sget-short`.
    #[must_use]
    pub fn is_static_get(self) -> bool {
        (Self::SGET.0..=Self::SGET_SHORT.0).contains(&self.0)
    }

    /// `sput` through `sput-short`.
    #[must_use]
    pub fn is_static_put(self) -> bool {
        (Self::SPUT.0..=Self::SPUT_SHORT.0).contains(&self.0)
    }

    /// Any of the non-quick `invoke-*` opcodes, including range variants.
    #[must_use]
    pub fn is_invoke(self) -> bool {
        (Self::INVOKE_VIRTUAL.0..=Self::INVOKE_INTERFACE.0).contains(&self.0)
            || (Self::INVOKE_VIRTUAL_RANGE.0..=Self::INVOKE_INTERFACE_RANGE.0).contains(&self.0)
    }

    /// Any `return` variant.
    #[must_use]
    pub fn is_return(self) -> bool {
        (Self::RETURN_VOID.0..=Self::RETURN_OBJECT.0).contains(&self.0)
            || self == Self::RETURN_VOID_NO_BARRIER
    }

    /// Unconditional `goto` variants.
    #[must_use]
    pub fn is_goto(self) -> bool {
        (Self::GOTO.0..=Self::GOTO_32.0).contains(&self.0)
    }

    /// Conditional branches.
    #[must_use]
    pub fn is_conditional_branch(self) -> bool {
        (Self::IF_EQ.0..=Self::IF_LEZ.0).contains(&self.0)
    }

    /// Returns `true` if control can fall through to the next instruction.
    #[must_use]
    pub fn can_continue(self) -> bool {
        !(self.is_return() || self.is_goto() || self == Self::THROW)
    }

    /// Returns the `-quick` counterpart of an instance field access opcode.
    #[must_use]
    pub fn quickened_field_opcode(self) -> Option<Opcode> {
        let quick = match self {
            Self::IGET => Self::IGET_QUICK,
            Self::IGET_WIDE => Self::IGET_WIDE_QUICK,
            Self::IGET_OBJECT => Self::IGET_OBJECT_QUICK,
            Self::IGET_BOOLEAN => Self::IGET_BOOLEAN_QUICK,
            Self::IGET_BYTE => Self::IGET_BYTE_QUICK,
            Self::IGET_CHAR => Self::IGET_CHAR_QUICK,
            Self::IGET_SHORT => Self::IGET_SHORT_QUICK,
            Self::IPUT => Self::IPUT_QUICK,
            Self::IPUT_WIDE => Self::IPUT_WIDE_QUICK,
            Self::IPUT_OBJECT => Self::IPUT_OBJECT_QUICK,
            Self::IPUT_BOOLEAN => Self::IPUT_BOOLEAN_QUICK,
            Self::IPUT_BYTE => Self::IPUT_BYTE_QUICK,
            Self::IPUT_CHAR => Self::IPUT_CHAR_QUICK,
            Self::IPUT_SHORT => Self::IPUT_SHORT_QUICK,
            _ => return None,
        };
        Some(quick)
    }
}

impl fmt::Debug for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.name())
        } else {
            write!(f, "unused-{:02x}", self.0)
        }
    }
}

/// A decoded, read-only view of one instruction.
#[derive(Clone, Copy)]
pub struct Instruction<'a> {
    pc: u32,
    units: &'a [u16],
}

impl<'a> Instruction<'a> {
    /// Program counter, in code units from the start of the method.
    #[must_use]
    pub fn pc(&self) -> u32 {
        self.pc
    }

    /// Opcode of the instruction. Payloads report [`Opcode::NOP`].
    #[must_use]
    pub fn opcode(&self) -> Opcode {
        Opcode((self.units[0] & 0xFF) as u8)
    }

    /// Returns `true` if this is a switch or array data payload.
    #[must_use]
    pub fn is_payload(&self) -> bool {
        matches!(
            self.units[0],
            PACKED_SWITCH_SIGNATURE | SPARSE_SWITCH_SIGNATURE | ARRAY_DATA_SIGNATURE
        )
    }

    /// Size in code units, used to advance a decoding cursor.
    #[must_use]
    pub fn size_in_code_units(&self) -> usize {
        self.units.len()
    }

    /// The raw code units of the instruction.
    #[must_use]
    pub fn units(&self) -> &'a [u16] {
        self.units
    }

    fn unit(&self, idx: usize) -> u16 {
        self.units.get(idx).copied().unwrap_or(0)
    }

    /// Register or value `A`.
    #[must_use]
    pub fn vreg_a(&self) -> u32 {
        let u0 = self.units[0];
        match self.opcode().format() {
            Format::K12x | Format::K11n | Format::K22c | Format::K22t | Format::K22s => {
                u32::from((u0 >> 8) & 0xF)
            }
            Format::K35c | Format::K45cc => u32::from(u0 >> 12),
            Format::K20t | Format::K32x => u32::from(self.unit(1)),
            Format::K30t => u32::from(self.unit(1)) | (u32::from(self.unit(2)) << 16),
            Format::K10x => 0,
            _ => u32::from(u0 >> 8),
        }
    }

    /// Register or value `B`.
    #[must_use]
    pub fn vreg_b(&self) -> u32 {
        match self.opcode().format() {
            Format::K12x | Format::K11n | Format::K22c | Format::K22t | Format::K22s => {
                u32::from(self.units[0] >> 12)
            }
            Format::K23x | Format::K22b => u32::from(self.unit(1) & 0xFF),
            Format::K31t | Format::K31i | Format::K31c => {
                u32::from(self.unit(1)) | (u32::from(self.unit(2)) << 16)
            }
            Format::K32x => u32::from(self.unit(2)),
            Format::K10x | Format::K11x | Format::K10t | Format::K20t | Format::K30t => 0,
            _ => u32::from(self.unit(1)),
        }
    }

    /// Register or value `C`.
    #[must_use]
    pub fn vreg_c(&self) -> u32 {
        match self.opcode().format() {
            Format::K22c | Format::K22t | Format::K22s => u32::from(self.unit(1)),
            Format::K23x | Format::K22b => u32::from(self.unit(1) >> 8),
            Format::K35c | Format::K45cc => u32::from(self.unit(2) & 0xF),
            Format::K3rc | Format::K4rcc => u32::from(self.unit(2)),
            _ => 0,
        }
    }

    /// Constant pool index (type, string, field or method), if the format carries one.
    #[must_use]
    pub fn index(&self) -> Option<u32> {
        match self.opcode().format() {
            Format::K21c | Format::K22c | Format::K35c | Format::K3rc | Format::K45cc
            | Format::K4rcc => Some(u32::from(self.unit(1))),
            Format::K31c => Some(u32::from(self.unit(1)) | (u32::from(self.unit(2)) << 16)),
            _ => None,
        }
    }

    /// Argument registers of a `35c` instruction, or the register range of a `3rc` one.
    #[must_use]
    pub fn argument_registers(&self) -> Vec<u32> {
        match self.opcode().format() {
            Format::K35c | Format::K45cc => {
                let count = self.vreg_a() as usize;
                let packed = self.unit(2);
                let mut regs: Vec<u32> = (0..4)
                    .map(|i| u32::from((packed >> (i * 4)) & 0xF))
                    .collect();
                regs.push(u32::from((self.units[0] >> 8) & 0xF));
                regs.truncate(count.min(5));
                regs
            }
            Format::K3rc | Format::K4rcc => {
                let first = self.vreg_c();
                (first..first + self.vreg_a()).collect()
            }
            _ => Vec::new(),
        }
    }

    /// Signed branch offset in code units for branches, switches and `fill-array-data`.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn branch_offset(&self) -> Option<i32> {
        match self.opcode().format() {
            Format::K10t => Some(i32::from((self.units[0] >> 8) as u8 as i8)),
            Format::K20t | Format::K21t | Format::K22t => Some(i32::from(self.unit(1) as i16)),
            Format::K30t => Some(self.vreg_a() as i32),
            Format::K31t => Some(self.vreg_b() as i32),
            _ => None,
        }
    }

    /// Sign-extended literal of the `const` family and the literal arithmetic forms.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn literal(&self) -> i64 {
        let op = self.opcode();
        match op.format() {
            Format::K11n => i64::from(((self.units[0] >> 12) as i8) << 4 >> 4),
            Format::K21s => i64::from(self.unit(1) as i16),
            Format::K21h => {
                let high = i64::from(self.unit(1) as i16);
                if op == Opcode::CONST_WIDE_HIGH16 {
                    high << 48
                } else {
                    high << 16
                }
            }
            Format::K31i => i64::from(self.vreg_b() as i32),
            Format::K22b => i64::from((self.unit(1) >> 8) as u8 as i8),
            Format::K22s => i64::from(self.unit(1) as i16),
            Format::K51l => (1..5).fold(0i64, |acc, i| {
                acc | (i64::from(self.unit(i)) << (16 * (i - 1)))
            }),
            _ => 0,
        }
    }
}

impl fmt::Debug for Instruction<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_payload() {
            return write!(f, "{:04x}: payload({})", self.pc, self.units.len());
        }
        write!(f, "{:04x}: {:?}", self.pc, self.opcode())?;
        if let Some(index) = self.index() {
            write!(f, " @{index}")?;
        }
        Ok(())
    }
}

fn payload_size(insns: &[u16], pc: usize) -> Result<Option<usize>> {
    let header = insns[pc];
    let at = |i: usize| insns.get(pc + i).copied().ok_or(OutOfBounds);
    let size = match header {
        PACKED_SWITCH_SIGNATURE => usize::from(at(1)?) * 2 + 4,
        SPARSE_SWITCH_SIGNATURE => usize::from(at(1)?) * 4 + 2,
        ARRAY_DATA_SIGNATURE => {
            let width = usize::from(at(1)?);
            let count = usize::from(at(2)?) | (usize::from(at(3)?) << 16);
            (width * count).div_ceil(2) + 4
        }
        _ => return Ok(None),
    };
    Ok(Some(size))
}

/// Size in code units of the instruction at `pc`.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if `pc` is outside the code or the instruction is
/// truncated.
pub fn instruction_size(insns: &[u16], pc: u32) -> Result<usize> {
    let pc = pc as usize;
    if pc >= insns.len() {
        return Err(OutOfBounds);
    }
    if let Some(size) = payload_size(insns, pc)? {
        return Ok(size);
    }
    Ok(Opcode((insns[pc] & 0xFF) as u8)
        .format()
        .size_in_code_units())
}

/// Decodes the instruction at `pc`.
///
/// # Errors
/// Returns [`crate::Error::OutOfBounds`] if the instruction extends past the end of the code,
/// or [`crate::Error::Malformed`] for an unassigned opcode.
pub fn decode_instruction(insns: &[u16], pc: u32) -> Result<Instruction<'_>> {
    let size = instruction_size(insns, pc)?;
    let start = pc as usize;
    let units = insns.get(start..start + size).ok_or(OutOfBounds)?;
    let instruction = Instruction { pc, units };
    if !instruction.is_payload() && !instruction.opcode().is_valid() {
        return Err(malformed_error!(
            "Unused opcode {:02x} at pc {:04x}",
            instruction.opcode().0,
            pc
        ));
    }
    Ok(instruction)
}

/// A mutable view of one instruction for in-place rewriting.
pub struct InstructionMut<'a> {
    units: &'a mut [u16],
}

impl<'a> InstructionMut<'a> {
    /// Borrows the instruction at `pc` for mutation.
    ///
    /// # Errors
    /// Same conditions as [`decode_instruction`].
    pub fn at(insns: &'a mut [u16], pc: u32) -> Result<Self> {
        let size = decode_instruction(insns, pc)?.size_in_code_units();
        let start = pc as usize;
        Ok(InstructionMut {
            units: &mut insns[start..start + size],
        })
    }

    /// Replaces the opcode byte, keeping the operand bits of the first unit.
    pub fn set_opcode(&mut self, opcode: Opcode) {
        self.units[0] = (self.units[0] & 0xFF00) | u16::from(opcode.0);
    }

    /// Sets operand `B` of a `21c`/`35c`/`3rc` instruction (the constant pool index slot).
    pub fn set_vreg_b(&mut self, value: u16) {
        self.units[1] = value;
    }

    /// Sets operand `C` of a `22c` instruction (the field index slot).
    pub fn set_vreg_c(&mut self, value: u16) {
        self.units[1] = value;
    }

    /// Sets the constant pool index of the instruction regardless of format.
    pub fn set_index(&mut self, value: u16) {
        self.units[1] = value;
    }

    /// Overwrites the whole instruction with `nop`s, one per code unit.
    pub fn fill_nops(&mut self) {
        for unit in self.units.iter_mut() {
            *unit = u16::from(Opcode::NOP.0);
        }
    }
}

/// Sequential decoder over a method body.
pub struct CodeIter<'a> {
    insns: &'a [u16],
    pc: u32,
    failed: bool,
}

impl<'a> CodeIter<'a> {
    /// Creates a cursor at pc 0.
    #[must_use]
    pub fn new(insns: &'a [u16]) -> Self {
        CodeIter {
            insns,
            pc: 0,
            failed: false,
        }
    }
}

impl<'a> Iterator for CodeIter<'a> {
    type Item = Result<Instruction<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pc as usize >= self.insns.len() {
            return None;
        }
        match decode_instruction(self.insns, self.pc) {
            Ok(instruction) => {
                #[allow(clippy::cast_possible_truncation)]
                let size = instruction.size_in_code_units() as u32;
                self.pc += size;
                Some(Ok(instruction))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_table_formats() {
        assert_eq!(Opcode::CHECK_CAST.format(), Format::K21c);
        assert_eq!(Opcode::CHECK_CAST.format().size_in_code_units(), 2);
        assert_eq!(Opcode::NOP.format().size_in_code_units(), 1);
        assert_eq!(Opcode::IGET_SHORT.format(), Format::K22c);
        assert_eq!(Opcode::INVOKE_VIRTUAL_RANGE.format(), Format::K3rc);
        assert_eq!(Opcode::CONST_WIDE.format().size_in_code_units(), 5);
        assert_eq!(Opcode::RETURN_VOID_NO_BARRIER.name(), "return-void-no-barrier");
        assert_eq!(Opcode::IGET_SHORT_QUICK.name(), "iget-short-quick");
        assert!(!Opcode(0x3e).is_valid());
    }

    #[test]
    fn test_decode_22c_operands() {
        // iget v1, v2, field@0x1234
        let insns = [0x2152, 0x1234];
        let insn = decode_instruction(&insns, 0).unwrap();
        assert_eq!(insn.opcode(), Opcode::IGET);
        assert_eq!(insn.vreg_a(), 1);
        assert_eq!(insn.vreg_b(), 2);
        assert_eq!(insn.vreg_c(), 0x1234);
        assert_eq!(insn.index(), Some(0x1234));
    }

    #[test]
    fn test_decode_wide_register_moves() {
        // move-object/from16 v200, v0x1234
        let insns = [0xC808, 0x1234];
        let insn = decode_instruction(&insns, 0).unwrap();
        assert_eq!(insn.opcode(), Opcode::MOVE_OBJECT_FROM16);
        assert_eq!(insn.opcode().format(), Format::K22x);
        assert_eq!((insn.vreg_a(), insn.vreg_b()), (200, 0x1234));

        // move-object/16 v0x0300, v0x0400
        let insns = [0x0009, 0x0300, 0x0400];
        let insn = decode_instruction(&insns, 0).unwrap();
        assert_eq!(insn.opcode(), Opcode::MOVE_OBJECT_16);
        assert_eq!(insn.size_in_code_units(), 3);
        assert_eq!((insn.vreg_a(), insn.vreg_b()), (0x300, 0x400));
    }

    #[test]
    fn test_decode_35c_arguments() {
        // invoke-virtual {v3, v4}, method@7
        let insns = [0x206e, 0x0007, 0x0043];
        let insn = decode_instruction(&insns, 0).unwrap();
        assert_eq!(insn.vreg_a(), 2);
        assert_eq!(insn.index(), Some(7));
        assert_eq!(insn.argument_registers(), vec![3, 4]);
    }

    #[test]
    fn test_decode_literals() {
        // const/4 v0, #-1
        let insns = [0xF012];
        assert_eq!(decode_instruction(&insns, 0).unwrap().literal(), -1);
        // const/16 v0, #300
        let insns = [0x0013, 300];
        assert_eq!(decode_instruction(&insns, 0).unwrap().literal(), 300);
        // const/high16 v0, #0x7f01 << 16
        let insns = [0x0015, 0x7f01];
        assert_eq!(decode_instruction(&insns, 0).unwrap().literal(), 0x7f01_0000);
    }

    #[test]
    fn test_decode_branch_offset() {
        // goto -2
        let insns = [0x0000, 0x0000, 0xFE28];
        assert_eq!(decode_instruction(&insns, 2).unwrap().branch_offset(), Some(-2));
    }

    #[test]
    fn test_payload_size() {
        // packed-switch payload with 2 targets
        let insns = [PACKED_SWITCH_SIGNATURE, 2, 0, 0, 1, 0, 2, 0];
        let insn = decode_instruction(&insns, 0).unwrap();
        assert!(insn.is_payload());
        assert_eq!(insn.size_in_code_units(), 8);
    }

    #[test]
    fn test_decode_truncated() {
        let insns = [0x001f];
        assert!(matches!(
            decode_instruction(&insns, 0),
            Err(crate::Error::OutOfBounds)
        ));
    }

    #[test]
    fn test_decode_unused_opcode() {
        let insns = [0x003e];
        assert!(matches!(
            decode_instruction(&insns, 0),
            Err(crate::Error::Malformed { .. })
        ));
    }

    #[test]
    fn test_mutate_in_place() {
        let mut insns = vec![0x2152, 0x1234, 0x000e];
        {
            let mut insn = InstructionMut::at(&mut insns, 0).unwrap();
            insn.set_opcode(Opcode::IGET_QUICK);
            insn.set_vreg_c(0x0010);
        }
        let insn = decode_instruction(&insns, 0).unwrap();
        assert_eq!(insn.opcode(), Opcode::IGET_QUICK);
        assert_eq!(insn.vreg_a(), 1);
        assert_eq!(insn.vreg_b(), 2);
        assert_eq!(insn.vreg_c(), 0x10);
    }

    #[test]
    fn test_code_iter() {
        // const/4 v0, #1 ; check-cast v0, type@3 ; return-void
        let insns = [0x1012, 0x001f, 0x0003, 0x000e];
        let pcs: Vec<u32> = CodeIter::new(&insns).map(|i| i.unwrap().pc()).collect();
        assert_eq!(pcs, vec![0, 1, 3]);
    }
}
