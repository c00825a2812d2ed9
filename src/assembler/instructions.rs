//! The CIL opcode table (ECMA-335 Partition III).
//!
//! Opcodes are identified by their encoded value: one-byte opcodes by the byte itself and
//! two-byte opcodes by `0xFE00 | second_byte`. The table is sorted by value so lookups are a
//! binary search.

use std::fmt;

/// Encoding of an instruction's inline operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandType {
    /// No operand
    None,
    /// Signed 8-bit immediate
    Int8,
    /// Unsigned 8-bit index or alignment
    UInt8,
    /// Unsigned 16-bit index
    UInt16,
    /// Signed 32-bit immediate
    Int32,
    /// Signed 64-bit immediate
    Int64,
    /// 32-bit float immediate
    Float32,
    /// 64-bit float immediate
    Float64,
    /// 32-bit metadata token
    Token,
    /// Signed 8-bit branch displacement
    ShortBranch,
    /// Signed 32-bit branch displacement
    Branch,
    /// Jump table: a `u32` count followed by that many `i32` displacements
    Switch,
}

impl OperandType {
    /// Encoded size of the operand, with `Switch` counting only its length prefix.
    #[must_use]
    pub fn size(self) -> usize {
        match self {
            OperandType::None => 0,
            OperandType::Int8 | OperandType::UInt8 | OperandType::ShortBranch => 1,
            OperandType::UInt16 => 2,
            OperandType::Int32
            | OperandType::Float32
            | OperandType::Token
            | OperandType::Branch
            | OperandType::Switch => 4,
            OperandType::Int64 | OperandType::Float64 => 8,
        }
    }
}

/// One entry of the opcode table.
#[derive(Debug, PartialEq, Eq)]
pub struct OpCode {
    /// Encoded value, `0xFExx` for two-byte opcodes
    pub value: u16,
    /// Assembler mnemonic
    pub name: &'static str,
    /// Encoding of the inline operand
    pub operand: OperandType,
}

impl OpCode {
    const fn new(value: u16, name: &'static str, operand: OperandType) -> Self {
        OpCode {
            value,
            name,
            operand,
        }
    }

    /// `true` for opcodes encoded with the `0xFE` prefix.
    #[must_use]
    pub fn is_two_byte(&self) -> bool {
        self.value > 0xFF
    }

    /// Encoded size of the opcode itself.
    #[must_use]
    pub fn size(&self) -> usize {
        if self.is_two_byte() {
            2
        } else {
            1
        }
    }

    /// Appends the opcode bytes to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        if self.is_two_byte() {
            out.extend_from_slice(&self.value.to_be_bytes());
        } else {
            out.push(self.value as u8);
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// `call`
pub const CALL: u16 = 0x28;
/// `ret`
pub const RET: u16 = 0x2A;
/// `ldstr`
pub const LDSTR: u16 = 0x72;

/// Prefix byte of two-byte opcodes.
pub const PREFIX: u8 = 0xFE;

use OperandType::{
    Branch, Float32, Float64, Int32, Int64, Int8, None as NoOperand, ShortBranch, Switch, Token,
    UInt16, UInt8,
};

/// Every defined opcode, sorted by value.
pub static OPCODES: &[OpCode] = &[
    OpCode::new(0x00, "nop", NoOperand),
    OpCode::new(0x01, "break", NoOperand),
    OpCode::new(0x02, "ldarg.0", NoOperand),
    OpCode::new(0x03, "ldarg.1", NoOperand),
    OpCode::new(0x04, "ldarg.2", NoOperand),
    OpCode::new(0x05, "ldarg.3", NoOperand),
    OpCode::new(0x06, "ldloc.0", NoOperand),
    OpCode::new(0x07, "ldloc.1", NoOperand),
    OpCode::new(0x08, "ldloc.2", NoOperand),
    OpCode::new(0x09, "ldloc.3", NoOperand),
    OpCode::new(0x0A, "stloc.0", NoOperand),
    OpCode::new(0x0B, "stloc.1", NoOperand),
    OpCode::new(0x0C, "stloc.2", NoOperand),
    OpCode::new(0x0D, "stloc.3", NoOperand),
    OpCode::new(0x0E, "ldarg.s", UInt8),
    OpCode::new(0x0F, "ldarga.s", UInt8),
    OpCode::new(0x10, "starg.s", UInt8),
    OpCode::new(0x11, "ldloc.s", UInt8),
    OpCode::new(0x12, "ldloca.s", UInt8),
    OpCode::new(0x13, "stloc.s", UInt8),
    OpCode::new(0x14, "ldnull", NoOperand),
    OpCode::new(0x15, "ldc.i4.m1", NoOperand),
    OpCode::new(0x16, "ldc.i4.0", NoOperand),
    OpCode::new(0x17, "ldc.i4.1", NoOperand),
    OpCode::new(0x18, "ldc.i4.2", NoOperand),
    OpCode::new(0x19, "ldc.i4.3", NoOperand),
    OpCode::new(0x1A, "ldc.i4.4", NoOperand),
    OpCode::new(0x1B, "ldc.i4.5", NoOperand),
    OpCode::new(0x1C, "ldc.i4.6", NoOperand),
    OpCode::new(0x1D, "ldc.i4.7", NoOperand),
    OpCode::new(0x1E, "ldc.i4.8", NoOperand),
    OpCode::new(0x1F, "ldc.i4.s", Int8),
    OpCode::new(0x20, "ldc.i4", Int32),
    OpCode::new(0x21, "ldc.i8", Int64),
    OpCode::new(0x22, "ldc.r4", Float32),
    OpCode::new(0x23, "ldc.r8", Float64),
    OpCode::new(0x25, "dup", NoOperand),
    OpCode::new(0x26, "pop", NoOperand),
    OpCode::new(0x27, "jmp", Token),
    OpCode::new(0x28, "call", Token),
    OpCode::new(0x29, "calli", Token),
    OpCode::new(0x2A, "ret", NoOperand),
    OpCode::new(0x2B, "br.s", ShortBranch),
    OpCode::new(0x2C, "brfalse.s", ShortBranch),
    OpCode::new(0x2D, "brtrue.s", ShortBranch),
    OpCode::new(0x2E, "beq.s", ShortBranch),
    OpCode::new(0x2F, "bge.s", ShortBranch),
    OpCode::new(0x30, "bgt.s", ShortBranch),
    OpCode::new(0x31, "ble.s", ShortBranch),
    OpCode::new(0x32, "blt.s", ShortBranch),
    OpCode::new(0x33, "bne.un.s", ShortBranch),
    OpCode::new(0x34, "bge.un.s", ShortBranch),
    OpCode::new(0x35, "bgt.un.s", ShortBranch),
    OpCode::new(0x36, "ble.un.s", ShortBranch),
    OpCode::new(0x37, "blt.un.s", ShortBranch),
    OpCode::new(0x38, "br", Branch),
    OpCode::new(0x39, "brfalse", Branch),
    OpCode::new(0x3A, "brtrue", Branch),
    OpCode::new(0x3B, "beq", Branch),
    OpCode::new(0x3C, "bge", Branch),
    OpCode::new(0x3D, "bgt", Branch),
    OpCode::new(0x3E, "ble", Branch),
    OpCode::new(0x3F, "blt", Branch),
    OpCode::new(0x40, "bne.un", Branch),
    OpCode::new(0x41, "bge.un", Branch),
    OpCode::new(0x42, "bgt.un", Branch),
    OpCode::new(0x43, "ble.un", Branch),
    OpCode::new(0x44, "blt.un", Branch),
    OpCode::new(0x45, "switch", Switch),
    OpCode::new(0x46, "ldind.i1", NoOperand),
    OpCode::new(0x47, "ldind.u1", NoOperand),
    OpCode::new(0x48, "ldind.i2", NoOperand),
    OpCode::new(0x49, "ldind.u2", NoOperand),
    OpCode::new(0x4A, "ldind.i4", NoOperand),
    OpCode::new(0x4B, "ldind.u4", NoOperand),
    OpCode::new(0x4C, "ldind.i8", NoOperand),
    OpCode::new(0x4D, "ldind.i", NoOperand),
    OpCode::new(0x4E, "ldind.r4", NoOperand),
    OpCode::new(0x4F, "ldind.r8", NoOperand),
    OpCode::new(0x50, "ldind.ref", NoOperand),
    OpCode::new(0x51, "stind.ref", NoOperand),
    OpCode::new(0x52, "stind.i1", NoOperand),
    OpCode::new(0x53, "stind.i2", NoOperand),
    OpCode::new(0x54, "stind.i4", NoOperand),
    OpCode::new(0x55, "stind.i8", NoOperand),
    OpCode::new(0x56, "stind.r4", NoOperand),
    OpCode::new(0x57, "stind.r8", NoOperand),
    OpCode::new(0x58, "add", NoOperand),
    OpCode::new(0x59, "sub", NoOperand),
    OpCode::new(0x5A, "mul", NoOperand),
    OpCode::new(0x5B, "div", NoOperand),
    OpCode::new(0x5C, "div.un", NoOperand),
    OpCode::new(0x5D, "rem", NoOperand),
    OpCode::new(0x5E, "rem.un", NoOperand),
    OpCode::new(0x5F, "and", NoOperand),
    OpCode::new(0x60, "or", NoOperand),
    OpCode::new(0x61, "xor", NoOperand),
    OpCode::new(0x62, "shl", NoOperand),
    OpCode::new(0x63, "shr", NoOperand),
    OpCode::new(0x64, "shr.un", NoOperand),
    OpCode::new(0x65, "neg", NoOperand),
    OpCode::new(0x66, "not", NoOperand),
    OpCode::new(0x67, "conv.i1", NoOperand),
    OpCode::new(0x68, "conv.i2", NoOperand),
    OpCode::new(0x69, "conv.i4", NoOperand),
    OpCode::new(0x6A, "conv.i8", NoOperand),
    OpCode::new(0x6B, "conv.r4", NoOperand),
    OpCode::new(0x6C, "conv.r8", NoOperand),
    OpCode::new(0x6D, "conv.u4", NoOperand),
    OpCode::new(0x6E, "conv.u8", NoOperand),
    OpCode::new(0x6F, "callvirt", Token),
    OpCode::new(0x70, "cpobj", Token),
    OpCode::new(0x71, "ldobj", Token),
    OpCode::new(0x72, "ldstr", Token),
    OpCode::new(0x73, "newobj", Token),
    OpCode::new(0x74, "castclass", Token),
    OpCode::new(0x75, "isinst", Token),
    OpCode::new(0x76, "conv.r.un", NoOperand),
    OpCode::new(0x79, "unbox", Token),
    OpCode::new(0x7A, "throw", NoOperand),
    OpCode::new(0x7B, "ldfld", Token),
    OpCode::new(0x7C, "ldflda", Token),
    OpCode::new(0x7D, "stfld", Token),
    OpCode::new(0x7E, "ldsfld", Token),
    OpCode::new(0x7F, "ldsflda", Token),
    OpCode::new(0x80, "stsfld", Token),
    OpCode::new(0x81, "stobj", Token),
    OpCode::new(0x82, "conv.ovf.i1.un", NoOperand),
    OpCode::new(0x83, "conv.ovf.i2.un", NoOperand),
    OpCode::new(0x84, "conv.ovf.i4.un", NoOperand),
    OpCode::new(0x85, "conv.ovf.i8.un", NoOperand),
    OpCode::new(0x86, "conv.ovf.u1.un", NoOperand),
    OpCode::new(0x87, "conv.ovf.u2.un", NoOperand),
    OpCode::new(0x88, "conv.ovf.u4.un", NoOperand),
    OpCode::new(0x89, "conv.ovf.u8.un", NoOperand),
    OpCode::new(0x8A, "conv.ovf.i.un", NoOperand),
    OpCode::new(0x8B, "conv.ovf.u.un", NoOperand),
    OpCode::new(0x8C, "box", Token),
    OpCode::new(0x8D, "newarr", Token),
    OpCode::new(0x8E, "ldlen", NoOperand),
    OpCode::new(0x8F, "ldelema", Token),
    OpCode::new(0x90, "ldelem.i1", NoOperand),
    OpCode::new(0x91, "ldelem.u1", NoOperand),
    OpCode::new(0x92, "ldelem.i2", NoOperand),
    OpCode::new(0x93, "ldelem.u2", NoOperand),
    OpCode::new(0x94, "ldelem.i4", NoOperand),
    OpCode::new(0x95, "ldelem.u4", NoOperand),
    OpCode::new(0x96, "ldelem.i8", NoOperand),
    OpCode::new(0x97, "ldelem.i", NoOperand),
    OpCode::new(0x98, "ldelem.r4", NoOperand),
    OpCode::new(0x99, "ldelem.r8", NoOperand),
    OpCode::new(0x9A, "ldelem.ref", NoOperand),
    OpCode::new(0x9B, "stelem.i", NoOperand),
    OpCode::new(0x9C, "stelem.i1", NoOperand),
    OpCode::new(0x9D, "stelem.i2", NoOperand),
    OpCode::new(0x9E, "stelem.i4", NoOperand),
    OpCode::new(0x9F, "stelem.i8", NoOperand),
    OpCode::new(0xA0, "stelem.r4", NoOperand),
    OpCode::new(0xA1, "stelem.r8", NoOperand),
    OpCode::new(0xA2, "stelem.ref", NoOperand),
    OpCode::new(0xA3, "ldelem", Token),
    OpCode::new(0xA4, "stelem", Token),
    OpCode::new(0xA5, "unbox.any", Token),
    OpCode::new(0xB3, "conv.ovf.i1", NoOperand),
    OpCode::new(0xB4, "conv.ovf.u1", NoOperand),
    OpCode::new(0xB5, "conv.ovf.i2", NoOperand),
    OpCode::new(0xB6, "conv.ovf.u2", NoOperand),
    OpCode::new(0xB7, "conv.ovf.i4", NoOperand),
    OpCode::new(0xB8, "conv.ovf.u4", NoOperand),
    OpCode::new(0xB9, "conv.ovf.i8", NoOperand),
    OpCode::new(0xBA, "conv.ovf.u8", NoOperand),
    OpCode::new(0xC2, "refanyval", Token),
    OpCode::new(0xC3, "ckfinite", NoOperand),
    OpCode::new(0xC6, "mkrefany", Token),
    OpCode::new(0xD0, "ldtoken", Token),
    OpCode::new(0xD1, "conv.u2", NoOperand),
    OpCode::new(0xD2, "conv.u1", NoOperand),
    OpCode::new(0xD3, "conv.i", NoOperand),
    OpCode::new(0xD4, "conv.ovf.i", NoOperand),
    OpCode::new(0xD5, "conv.ovf.u", NoOperand),
    OpCode::new(0xD6, "add.ovf", NoOperand),
    OpCode::new(0xD7, "add.ovf.un", NoOperand),
    OpCode::new(0xD8, "mul.ovf", NoOperand),
    OpCode::new(0xD9, "mul.ovf.un", NoOperand),
    OpCode::new(0xDA, "sub.ovf", NoOperand),
    OpCode::new(0xDB, "sub.ovf.un", NoOperand),
    OpCode::new(0xDC, "endfinally", NoOperand),
    OpCode::new(0xDD, "leave", Branch),
    OpCode::new(0xDE, "leave.s", ShortBranch),
    OpCode::new(0xDF, "stind.i", NoOperand),
    OpCode::new(0xE0, "conv.u", NoOperand),
    OpCode::new(0xFE00, "arglist", NoOperand),
    OpCode::new(0xFE01, "ceq", NoOperand),
    OpCode::new(0xFE02, "cgt", NoOperand),
    OpCode::new(0xFE03, "cgt.un", NoOperand),
    OpCode::new(0xFE04, "clt", NoOperand),
    OpCode::new(0xFE05, "clt.un", NoOperand),
    OpCode::new(0xFE06, "ldftn", Token),
    OpCode::new(0xFE07, "ldvirtftn", Token),
    OpCode::new(0xFE09, "ldarg", UInt16),
    OpCode::new(0xFE0A, "ldarga", UInt16),
    OpCode::new(0xFE0B, "starg", UInt16),
    OpCode::new(0xFE0C, "ldloc", UInt16),
    OpCode::new(0xFE0D, "ldloca", UInt16),
    OpCode::new(0xFE0E, "stloc", UInt16),
    OpCode::new(0xFE0F, "localloc", NoOperand),
    OpCode::new(0xFE11, "endfilter", NoOperand),
    OpCode::new(0xFE12, "unaligned.", UInt8),
    OpCode::new(0xFE13, "volatile.", NoOperand),
    OpCode::new(0xFE14, "tail.", NoOperand),
    OpCode::new(0xFE15, "initobj", Token),
    OpCode::new(0xFE16, "constrained.", Token),
    OpCode::new(0xFE17, "cpblk", NoOperand),
    OpCode::new(0xFE18, "initblk", NoOperand),
    OpCode::new(0xFE19, "no.", UInt8),
    OpCode::new(0xFE1A, "rethrow", NoOperand),
    OpCode::new(0xFE1C, "sizeof", Token),
    OpCode::new(0xFE1D, "refanytype", NoOperand),
    OpCode::new(0xFE1E, "readonly.", NoOperand),
];

/// Looks up an opcode by its encoded value.
#[must_use]
pub fn lookup(value: u16) -> Option<&'static OpCode> {
    OPCODES
        .binary_search_by_key(&value, |opcode| opcode.value)
        .ok()
        .map(|index| &OPCODES[index])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_sorted() {
        assert!(OPCODES.windows(2).all(|pair| pair[0].value < pair[1].value));
        assert_eq!(OPCODES.len(), 219);
    }

    #[test]
    fn lookup_known_and_unknown() {
        let call = lookup(CALL).unwrap();
        assert_eq!(call.name, "call");
        assert_eq!(call.operand, OperandType::Token);
        assert_eq!(call.size(), 1);

        let ldloc = lookup(0xFE0C).unwrap();
        assert_eq!(ldloc.to_string(), "ldloc");
        assert_eq!(ldloc.size(), 2);

        assert!(lookup(0x24).is_none());
        assert!(lookup(0xA6).is_none());
        assert!(lookup(0xFE08).is_none());
    }

    #[test]
    fn encode_prefix_first() {
        let mut out = Vec::new();
        lookup(0xFE01).unwrap().encode(&mut out);
        lookup(RET).unwrap().encode(&mut out);
        assert_eq!(out, [0xFE, 0x01, 0x2A]);
    }
}
