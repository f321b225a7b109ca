//! The opcode table (§4.1): decoding metadata per opcode.
//!
//! Grounded on `fuel-asm`'s `Opcode`/`Instruction` split (see
//! `fuel-asm/src/opcode.rs`, `fuel-asm/src/macros.rs`): a plain, explicit,
//! `#[repr(u8)]` tag enum carries the byte value, and a small descriptor
//! table alongside it carries the decoding metadata (operand width, stack
//! effect) a disassembler, loader scan, or the tiering engine's opcode
//! counters need without re-decoding a full [`crate::instruction::Instruction`].
//!
//! Unlike `fuel-asm`'s `impl_instructions!` macro, the ~140 opcodes here are
//! listed explicitly rather than code-generated from a table macro: with no
//! compiler in the loop to catch a malformed macro expansion, an explicit
//! enum is the safer choice for a component this central.

use strum::EnumIter;

/// Stack-effect marker for opcodes whose pop/push count depends on an
/// operand value or the callee's signature rather than being fixed by the
/// opcode alone (`Call*`, `NewClosure`, `Ret`, `Intrinsic`).
pub const VARIABLE_EFFECT: u8 = 0xFF;

/// A bytecode opcode tag (§4.1). Operand values live in
/// [`crate::instruction::Instruction`]; this enum is solely the one-byte
/// discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter)]
#[repr(u8)]
pub enum OpCode {
    /// Does nothing.
    Nop,
    /// Stops execution successfully.
    Halt,
    /// Unconditional trap (no guest-supplied code).
    Trap,
    /// Debugger breakpoint; a no-op outside of a debugger.
    Breakpoint,
    /// Unconditional relative jump.
    Jmp,
    /// Pop an `I32`; jump if its low bit is set.
    JmpTrue,
    /// Pop an `I32`; jump if its low bit is clear.
    JmpFalse,
    /// Pop an `I32` index; jump via a const-pool jump table, or the
    /// instruction's default offset if the index is out of range.
    JmpTable,
    /// Discard the top of the stack.
    Pop,
    /// Duplicate the top of the stack.
    Dup,
    /// Duplicate the top two stack slots, preserving order.
    Dup2,
    /// Swap the top two stack slots.
    Swap,
    /// Rotate the top three stack slots.
    Rot,
    /// Push a 32-bit integer immediate.
    ConstI32,
    /// Push a 64-bit integer immediate.
    ConstI64,
    /// Push a 32-bit float immediate.
    ConstF32,
    /// Push a 64-bit float immediate.
    ConstF64,
    /// Push a `Ref` to a heap string built from a const-pool string entry.
    ConstString,
    /// Push a null `Ref`.
    ConstNull,
    /// Push a local slot's value.
    LoadLocal,
    /// Pop the top of the stack into a local slot.
    StoreLocal,
    /// Push a global slot's value.
    LoadGlobal,
    /// Pop the top of the stack into a global slot.
    StoreGlobal,
    /// Push the current closure's Nth upvalue.
    LoadUpvalue,
    /// Pop the top of the stack into the current closure's Nth upvalue.
    StoreUpvalue,
    /// Allocate a new `Artifact` of a given type.
    NewObject,
    /// Pop a `Ref`, push the value of one of its fields.
    LoadField,
    /// Pop a value and a `Ref`, store the value into one of the ref's
    /// fields.
    StoreField,
    /// Pop an `I32` length, allocate a new fixed-size array of a given
    /// element width.
    NewArray,
    /// Pop a `Ref`, push its element count.
    ArrayLen,
    /// Array element load, `I32` lane.
    ArrayGetI32,
    /// Array element load, `I64` lane.
    ArrayGetI64,
    /// Array element load, `F32` lane.
    ArrayGetF32,
    /// Array element load, `F64` lane.
    ArrayGetF64,
    /// Array element load, `Ref` lane.
    ArrayGetRef,
    /// Array element store, `I32` lane.
    ArraySetI32,
    /// Array element store, `I64` lane.
    ArraySetI64,
    /// Array element store, `F32` lane.
    ArraySetF32,
    /// Array element store, `F64` lane.
    ArraySetF64,
    /// Array element store, `Ref` lane.
    ArraySetRef,
    /// Pop an `I32` capacity, allocate a new list of a given element width.
    NewList,
    /// Pop a `Ref`, push its current length.
    ListLen,
    /// Pop a `Ref`, set its length to zero without freeing capacity.
    ListClear,
    /// Append to a list, `I32` lane. Traps if at capacity.
    ListPushI32,
    /// Append to a list, `I64` lane.
    ListPushI64,
    /// Append to a list, `F32` lane.
    ListPushF32,
    /// Append to a list, `F64` lane.
    ListPushF64,
    /// Append to a list, `Ref` lane.
    ListPushRef,
    /// Remove and push the last element, `I32` lane.
    ListPopI32,
    /// Remove and push the last element, `I64` lane.
    ListPopI64,
    /// Remove and push the last element, `F32` lane.
    ListPopF32,
    /// Remove and push the last element, `F64` lane.
    ListPopF64,
    /// Remove and push the last element, `Ref` lane.
    ListPopRef,
    /// List element load, `I32` lane.
    ListGetI32,
    /// List element load, `I64` lane.
    ListGetI64,
    /// List element load, `F32` lane.
    ListGetF32,
    /// List element load, `F64` lane.
    ListGetF64,
    /// List element load, `Ref` lane.
    ListGetRef,
    /// List element store, `I32` lane.
    ListSetI32,
    /// List element store, `I64` lane.
    ListSetI64,
    /// List element store, `F32` lane.
    ListSetF32,
    /// List element store, `F64` lane.
    ListSetF64,
    /// List element store, `Ref` lane.
    ListSetRef,
    /// Insert at an index, shifting tail elements, `I32` lane.
    ListInsertI32,
    /// Insert at an index, shifting tail elements, `Ref` lane.
    ListInsertRef,
    /// Remove at an index, shifting tail elements, `I32` lane.
    ListRemoveI32,
    /// Remove at an index, shifting tail elements, `Ref` lane.
    ListRemoveRef,
    /// Pop a string `Ref`, push its code-unit count.
    StringLen,
    /// Pop an index and a string `Ref`, push the code unit as `I32`.
    StringGetChar,
    /// Pop `end`, `start`, and a string `Ref`; push a new string `Ref`.
    StringSlice,
    /// Pop two string `Ref`s; push their concatenation as a new `Ref`.
    StringConcat,
    /// Pop `upvalue_count` handles, push a new `Closure` over a method.
    NewClosure,
    /// `$rA = a + b`, `I32` lane, wrapping.
    AddI32,
    /// Subtraction, `I32` lane, wrapping.
    SubI32,
    /// Multiplication, `I32` lane, wrapping.
    MulI32,
    /// Division, `I32` lane. Traps on division by zero; wraps `MIN / -1`.
    DivI32,
    /// Modulo, `I32` lane. Traps on division by zero.
    ModI32,
    /// Addition, `I64` lane, wrapping.
    AddI64,
    /// Subtraction, `I64` lane, wrapping.
    SubI64,
    /// Multiplication, `I64` lane, wrapping.
    MulI64,
    /// Division, `I64` lane. Traps on division by zero; wraps `MIN / -1`.
    DivI64,
    /// Modulo, `I64` lane. Traps on division by zero.
    ModI64,
    /// Addition, `F32` lane.
    AddF32,
    /// Subtraction, `F32` lane.
    SubF32,
    /// Multiplication, `F32` lane.
    MulF32,
    /// Division, `F32` lane. Division by zero yields `0.0`.
    DivF32,
    /// Addition, `F64` lane.
    AddF64,
    /// Subtraction, `F64` lane.
    SubF64,
    /// Multiplication, `F64` lane.
    MulF64,
    /// Division, `F64` lane. Division by zero yields `0.0`.
    DivF64,
    /// `==`, `I32` lane, result pushed as `I32` bool.
    CmpEqI32,
    /// `!=`, `I32` lane.
    CmpNeI32,
    /// `<`, `I32` lane (signed).
    CmpLtI32,
    /// `<=`, `I32` lane (signed).
    CmpLeI32,
    /// `>`, `I32` lane (signed).
    CmpGtI32,
    /// `>=`, `I32` lane (signed).
    CmpGeI32,
    /// `==`, `I64` lane.
    CmpEqI64,
    /// `!=`, `I64` lane.
    CmpNeI64,
    /// `<`, `I64` lane (signed).
    CmpLtI64,
    /// `<=`, `I64` lane (signed).
    CmpLeI64,
    /// `>`, `I64` lane (signed).
    CmpGtI64,
    /// `>=`, `I64` lane (signed).
    CmpGeI64,
    /// `==`, `F32` lane.
    CmpEqF32,
    /// `!=`, `F32` lane.
    CmpNeF32,
    /// `<`, `F32` lane.
    CmpLtF32,
    /// `<=`, `F32` lane.
    CmpLeF32,
    /// `>`, `F32` lane.
    CmpGtF32,
    /// `>=`, `F32` lane.
    CmpGeF32,
    /// `==`, `F64` lane.
    CmpEqF64,
    /// `!=`, `F64` lane.
    CmpNeF64,
    /// `<`, `F64` lane.
    CmpLtF64,
    /// `<=`, `F64` lane.
    CmpLeF64,
    /// `>`, `F64` lane.
    CmpGtF64,
    /// `>=`, `F64` lane.
    CmpGeF64,
    /// Bitwise AND, `I32` lane.
    AndI32,
    /// Bitwise OR, `I32` lane.
    OrI32,
    /// Bitwise XOR, `I32` lane.
    XorI32,
    /// Shift left, `I32` lane, masked to 0..=31.
    ShlI32,
    /// Arithmetic shift right, `I32` lane, masked to 0..=31.
    ShrI32,
    /// Bitwise AND, `I64` lane.
    AndI64,
    /// Bitwise OR, `I64` lane.
    OrI64,
    /// Bitwise XOR, `I64` lane.
    XorI64,
    /// Shift left, `I64` lane, masked to 0..=63.
    ShlI64,
    /// Arithmetic shift right, `I64` lane, masked to 0..=63.
    ShrI64,
    /// Negate, `I32` lane; `MIN` wraps to itself.
    NegI32,
    /// Negate, `I64` lane; `MIN` wraps to itself.
    NegI64,
    /// Negate, `F32` lane.
    NegF32,
    /// Negate, `F64` lane.
    NegF64,
    /// Increment, `I32` lane, wrapping.
    IncI32,
    /// Decrement, `I32` lane, wrapping.
    DecI32,
    /// Increment, `I64` lane, wrapping.
    IncI64,
    /// Decrement, `I64` lane, wrapping.
    DecI64,
    /// Logical NOT over the low bit.
    BoolNot,
    /// Eager logical AND over the low bit.
    BoolAnd,
    /// Eager logical OR over the low bit.
    BoolOr,
    /// `I32` → `I64` (sign-extend).
    ConvI32I64,
    /// `I64` → `I32` (truncate).
    ConvI64I32,
    /// `I32` → `F32`.
    ConvI32F32,
    /// `I32` → `F64`.
    ConvI32F64,
    /// `I64` → `F32`.
    ConvI64F32,
    /// `I64` → `F64`.
    ConvI64F64,
    /// `F32` → `I32` (truncating toward zero).
    ConvF32I32,
    /// `F32` → `I64` (truncating toward zero).
    ConvF32I64,
    /// `F64` → `I32` (truncating toward zero).
    ConvF64I32,
    /// `F64` → `I64` (truncating toward zero).
    ConvF64I64,
    /// `F32` → `F64`.
    ConvF32F64,
    /// `F64` → `F32`.
    ConvF64F32,
    /// Call a function by index, popping `arg_count` arguments.
    Call,
    /// Call through a closure or raw function index on top of the stack.
    CallIndirect,
    /// Tail-call a function, reusing the current frame's locals base.
    TailCall,
    /// Assert the current frame has no caller.
    CallCheck,
    /// Allocate `locals` local slots for the current frame. Must be the
    /// first opcode of every function.
    Enter,
    /// Tear down the current frame without returning a value.
    Leave,
    /// Return from the current frame, optionally popping a return value.
    Ret,
    /// Associate subsequent opcodes with a source file/line/column.
    Line,
    /// Begin a profiling region.
    ProfileStart,
    /// End a profiling region.
    ProfileEnd,
    /// Invoke a builtin by numeric id.
    Intrinsic,
    /// Invoke a host syscall by numeric id.
    SysCall,
}

impl OpCode {
    /// Decode an opcode tag byte.
    pub fn from_byte(b: u8) -> Option<Self> {
        use strum::IntoEnumIterator;
        Self::iter().find(|op| *op as u8 == b)
    }

    /// The opcode's mnemonic, matching the SIR grammar's instruction names
    /// (§4.8) 1:1.
    pub fn mnemonic(self) -> &'static str {
        OPCODE_INFO[self as usize].mnemonic
    }

    /// Reverse of [`Self::mnemonic`], for the SIR assembler's tokenizer.
    pub fn from_mnemonic(s: &str) -> Option<Self> {
        use strum::IntoEnumIterator;
        Self::iter().find(|op| op.mnemonic() == s)
    }

    /// Number of operand bytes following the opcode tag (§4.1, §6).
    pub fn operand_bytes(self) -> u8 {
        OPCODE_INFO[self as usize].operand_bytes
    }

    /// Fixed pop count, or [`VARIABLE_EFFECT`] if it depends on an operand
    /// value or callee signature.
    pub fn pops(self) -> u8 {
        OPCODE_INFO[self as usize].pops
    }

    /// Fixed push count, or [`VARIABLE_EFFECT`] if it depends on an operand
    /// value or callee signature.
    pub fn pushes(self) -> u8 {
        OPCODE_INFO[self as usize].pushes
    }
}

/// Decoding metadata for one opcode: operand width and stack effect.
#[derive(Debug, Clone, Copy)]
pub struct OpInfo {
    /// SIR mnemonic.
    pub mnemonic: &'static str,
    /// Number of operand bytes following the tag byte.
    pub operand_bytes: u8,
    /// Fixed pop count, or [`VARIABLE_EFFECT`].
    pub pops: u8,
    /// Fixed push count, or [`VARIABLE_EFFECT`].
    pub pushes: u8,
}

const fn info(mnemonic: &'static str, operand_bytes: u8, pops: u8, pushes: u8) -> OpInfo {
    OpInfo { mnemonic, operand_bytes, pops, pushes }
}

/// Descriptor table, indexed by `OpCode as usize`. Order must track the
/// `OpCode` declaration exactly.
pub static OPCODE_INFO: &[OpInfo] = &[
    info("nop", 0, 0, 0),
    info("halt", 0, 0, 0),
    info("trap", 0, 0, 0),
    info("breakpoint", 0, 0, 0),
    info("jmp", 4, 0, 0),
    info("jmp.true", 4, 1, 0),
    info("jmp.false", 4, 1, 0),
    info("jmp.table", 8, 1, 0),
    info("pop", 0, 1, 0),
    info("dup", 0, 1, 2),
    info("dup2", 0, 2, 4),
    info("swap", 0, 2, 2),
    info("rot", 0, 3, 3),
    info("const.i32", 4, 0, 1),
    info("const.i64", 8, 0, 1),
    info("const.f32", 4, 0, 1),
    info("const.f64", 8, 0, 1),
    info("const.string", 4, 0, 1),
    info("const.null", 0, 0, 1),
    info("ldloc", 4, 0, 1),
    info("stloc", 4, 1, 0),
    info("ldglobal", 4, 0, 1),
    info("stglobal", 4, 1, 0),
    info("ldupval", 4, 0, 1),
    info("stupval", 4, 1, 0),
    info("newobject", 4, 0, 1),
    info("ldfield", 4, 1, 1),
    info("stfield", 4, 2, 0),
    info("newarray", 1, 1, 1),
    info("array.len", 0, 1, 1),
    info("array.get.i32", 0, 2, 1),
    info("array.get.i64", 0, 2, 1),
    info("array.get.f32", 0, 2, 1),
    info("array.get.f64", 0, 2, 1),
    info("array.get.ref", 0, 2, 1),
    info("array.set.i32", 0, 3, 0),
    info("array.set.i64", 0, 3, 0),
    info("array.set.f32", 0, 3, 0),
    info("array.set.f64", 0, 3, 0),
    info("array.set.ref", 0, 3, 0),
    info("newlist", 1, 1, 1),
    info("list.len", 0, 1, 1),
    info("list.clear", 0, 1, 0),
    info("list.push.i32", 0, 2, 0),
    info("list.push.i64", 0, 2, 0),
    info("list.push.f32", 0, 2, 0),
    info("list.push.f64", 0, 2, 0),
    info("list.push.ref", 0, 2, 0),
    info("list.pop.i32", 0, 1, 1),
    info("list.pop.i64", 0, 1, 1),
    info("list.pop.f32", 0, 1, 1),
    info("list.pop.f64", 0, 1, 1),
    info("list.pop.ref", 0, 1, 1),
    info("list.get.i32", 0, 2, 1),
    info("list.get.i64", 0, 2, 1),
    info("list.get.f32", 0, 2, 1),
    info("list.get.f64", 0, 2, 1),
    info("list.get.ref", 0, 2, 1),
    info("list.set.i32", 0, 3, 0),
    info("list.set.i64", 0, 3, 0),
    info("list.set.f32", 0, 3, 0),
    info("list.set.f64", 0, 3, 0),
    info("list.set.ref", 0, 3, 0),
    info("list.insert.i32", 0, 3, 0),
    info("list.insert.ref", 0, 3, 0),
    info("list.remove.i32", 0, 2, 1),
    info("list.remove.ref", 0, 2, 1),
    info("string.len", 0, 1, 1),
    info("string.getchar", 0, 2, 1),
    info("string.slice", 0, 3, 1),
    info("string.concat", 0, 2, 1),
    info("newclosure", 8, VARIABLE_EFFECT, 1),
    info("add.i32", 0, 2, 1),
    info("sub.i32", 0, 2, 1),
    info("mul.i32", 0, 2, 1),
    info("div.i32", 0, 2, 1),
    info("mod.i32", 0, 2, 1),
    info("add.i64", 0, 2, 1),
    info("sub.i64", 0, 2, 1),
    info("mul.i64", 0, 2, 1),
    info("div.i64", 0, 2, 1),
    info("mod.i64", 0, 2, 1),
    info("add.f32", 0, 2, 1),
    info("sub.f32", 0, 2, 1),
    info("mul.f32", 0, 2, 1),
    info("div.f32", 0, 2, 1),
    info("add.f64", 0, 2, 1),
    info("sub.f64", 0, 2, 1),
    info("mul.f64", 0, 2, 1),
    info("div.f64", 0, 2, 1),
    info("cmp.eq.i32", 0, 2, 1),
    info("cmp.ne.i32", 0, 2, 1),
    info("cmp.lt.i32", 0, 2, 1),
    info("cmp.le.i32", 0, 2, 1),
    info("cmp.gt.i32", 0, 2, 1),
    info("cmp.ge.i32", 0, 2, 1),
    info("cmp.eq.i64", 0, 2, 1),
    info("cmp.ne.i64", 0, 2, 1),
    info("cmp.lt.i64", 0, 2, 1),
    info("cmp.le.i64", 0, 2, 1),
    info("cmp.gt.i64", 0, 2, 1),
    info("cmp.ge.i64", 0, 2, 1),
    info("cmp.eq.f32", 0, 2, 1),
    info("cmp.ne.f32", 0, 2, 1),
    info("cmp.lt.f32", 0, 2, 1),
    info("cmp.le.f32", 0, 2, 1),
    info("cmp.gt.f32", 0, 2, 1),
    info("cmp.ge.f32", 0, 2, 1),
    info("cmp.eq.f64", 0, 2, 1),
    info("cmp.ne.f64", 0, 2, 1),
    info("cmp.lt.f64", 0, 2, 1),
    info("cmp.le.f64", 0, 2, 1),
    info("cmp.gt.f64", 0, 2, 1),
    info("cmp.ge.f64", 0, 2, 1),
    info("and.i32", 0, 2, 1),
    info("or.i32", 0, 2, 1),
    info("xor.i32", 0, 2, 1),
    info("shl.i32", 0, 2, 1),
    info("shr.i32", 0, 2, 1),
    info("and.i64", 0, 2, 1),
    info("or.i64", 0, 2, 1),
    info("xor.i64", 0, 2, 1),
    info("shl.i64", 0, 2, 1),
    info("shr.i64", 0, 2, 1),
    info("neg.i32", 0, 1, 1),
    info("neg.i64", 0, 1, 1),
    info("neg.f32", 0, 1, 1),
    info("neg.f64", 0, 1, 1),
    info("inc.i32", 0, 1, 1),
    info("dec.i32", 0, 1, 1),
    info("inc.i64", 0, 1, 1),
    info("dec.i64", 0, 1, 1),
    info("bool.not", 0, 1, 1),
    info("bool.and", 0, 2, 1),
    info("bool.or", 0, 2, 1),
    info("conv.i32.i64", 0, 1, 1),
    info("conv.i64.i32", 0, 1, 1),
    info("conv.i32.f32", 0, 1, 1),
    info("conv.i32.f64", 0, 1, 1),
    info("conv.i64.f32", 0, 1, 1),
    info("conv.i64.f64", 0, 1, 1),
    info("conv.f32.i32", 0, 1, 1),
    info("conv.f32.i64", 0, 1, 1),
    info("conv.f64.i32", 0, 1, 1),
    info("conv.f64.i64", 0, 1, 1),
    info("conv.f32.f64", 0, 1, 1),
    info("conv.f64.f32", 0, 1, 1),
    info("call", 8, VARIABLE_EFFECT, VARIABLE_EFFECT),
    info("call.indirect", 8, VARIABLE_EFFECT, VARIABLE_EFFECT),
    info("tailcall", 8, VARIABLE_EFFECT, VARIABLE_EFFECT),
    info("callcheck", 0, 0, 0),
    info("enter", 4, 0, 0),
    info("leave", 0, 0, 0),
    info("ret", 0, VARIABLE_EFFECT, 0),
    info("line", 12, 0, 0),
    info("profile.start", 0, 0, 0),
    info("profile.end", 0, 0, 0),
    info("intrinsic", 4, VARIABLE_EFFECT, VARIABLE_EFFECT),
    info("syscall", 4, 0, 0),
];

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn every_opcode_has_a_descriptor_row() {
        assert_eq!(OpCode::iter().count(), OPCODE_INFO.len());
    }

    #[test]
    fn round_trips_through_byte() {
        for op in OpCode::iter() {
            assert_eq!(OpCode::from_byte(op as u8), Some(op));
        }
    }

    #[test]
    fn unknown_byte_is_none() {
        assert_eq!(OpCode::from_byte(255), None);
    }
}
