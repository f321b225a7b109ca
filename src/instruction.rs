//! Decoding a single instruction from a function's code bytes.
//!
//! Rather than a second, parallel enum duplicating every [`OpCode`] variant
//! with typed operand fields (as `fuel-asm::Instruction` does over
//! `fuel-asm::Opcode`), operands here are read lazily through [`Operands`],
//! a thin cursor over the opcode's operand byte range. Every consumer
//! (loader scan, verifier, interpreter, disassembler) already knows which
//! opcode it has from the match it is inside, so it reads exactly the
//! fields that opcode defines — this keeps one source of truth (the
//! [`crate::opcode::OPCODE_INFO`] table) instead of two enums that could
//! drift apart.

use crate::opcode::OpCode;

/// A decoded instruction: its opcode, and a cursor over its operand bytes.
#[derive(Debug, Clone, Copy)]
pub struct Decoded<'a> {
    /// The opcode tag.
    pub op: OpCode,
    /// Program counter of the opcode tag byte, relative to the function's
    /// code start.
    pub pc: u32,
    /// The operand bytes following the tag (length given by
    /// `op.operand_bytes()`).
    pub operands: Operands<'a>,
    /// Total instruction length in bytes, including the tag byte.
    pub len: u32,
}

/// A cursor over an instruction's operand bytes.
#[derive(Debug, Clone, Copy)]
pub struct Operands<'a>(&'a [u8]);

impl<'a> Operands<'a> {
    /// Read a `u8` at a byte offset within the operand range.
    pub fn u8(&self, at: usize) -> u8 {
        self.0[at]
    }

    /// Read a little-endian `u32` at a byte offset.
    pub fn u32(&self, at: usize) -> u32 {
        u32::from_le_bytes(self.0[at..at + 4].try_into().unwrap())
    }

    /// Read a little-endian `i32` at a byte offset.
    pub fn i32(&self, at: usize) -> i32 {
        self.u32(at) as i32
    }

    /// Read a little-endian `u64` at a byte offset.
    pub fn u64(&self, at: usize) -> u64 {
        u64::from_le_bytes(self.0[at..at + 8].try_into().unwrap())
    }

    /// Read a little-endian `i64` at a byte offset.
    pub fn i64(&self, at: usize) -> i64 {
        self.u64(at) as i64
    }

    /// Read an `f32` bit pattern at a byte offset.
    pub fn f32(&self, at: usize) -> f32 {
        f32::from_bits(self.u32(at))
    }

    /// Read an `f64` bit pattern at a byte offset.
    pub fn f64(&self, at: usize) -> f64 {
        f64::from_bits(self.u64(at))
    }
}

/// Failure decoding a single instruction. Callers attach function/pc
/// context and convert to [`crate::error::LoadError`] or
/// [`crate::error::VerifyError`] as appropriate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// The byte at `pc` is not a known opcode.
    UnknownOpcode(u8),
    /// Fewer than `operand_bytes()` bytes remained after the tag.
    Truncated,
}

/// Decode one instruction from `code` at byte offset `pc`.
pub fn decode_at(code: &[u8], pc: u32) -> Result<Decoded<'_>, DecodeError> {
    let tag = *code.get(pc as usize).ok_or(DecodeError::Truncated)?;
    let op = OpCode::from_byte(tag).ok_or(DecodeError::UnknownOpcode(tag))?;
    let operand_len = op.operand_bytes() as usize;
    let start = pc as usize + 1;
    let end = start + operand_len;
    let bytes = code.get(start..end).ok_or(DecodeError::Truncated)?;
    Ok(Decoded {
        op,
        pc,
        operands: Operands(bytes),
        len: 1 + operand_len as u32,
    })
}

/// Append an instruction's encoded bytes (tag + operand bytes) to `out`.
/// Used by the SIR assembler (§4.9).
pub fn encode_into(out: &mut Vec<u8>, op: OpCode, operand_bytes: &[u8]) {
    debug_assert_eq!(operand_bytes.len(), op.operand_bytes() as usize);
    out.push(op as u8);
    out.extend_from_slice(operand_bytes);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_const_i32() {
        let mut code = vec![OpCode::ConstI32 as u8];
        code.extend_from_slice(&42i32.to_le_bytes());
        let d = decode_at(&code, 0).unwrap();
        assert_eq!(d.op, OpCode::ConstI32);
        assert_eq!(d.operands.i32(0), 42);
        assert_eq!(d.len, 5);
    }

    #[test]
    fn truncated_operand_errors() {
        let code = vec![OpCode::ConstI32 as u8, 1, 2];
        assert_eq!(decode_at(&code, 0), Err(DecodeError::Truncated));
    }

    #[test]
    fn unknown_opcode_errors() {
        let code = vec![0xFEu8];
        assert_eq!(decode_at(&code, 0), Err(DecodeError::UnknownOpcode(0xFE)));
    }
}
