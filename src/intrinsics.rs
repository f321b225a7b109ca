//! Builtin ids invoked by the `Intrinsic` opcode (§4.6).
//!
//! Kept as a single closed table, shared by the verifier (which needs each
//! id's lane signature to stack-check a call site) and the interpreter
//! (which needs the same ids to actually run them) — the "closed table that
//! returns a typed trampoline" shape §9 recommends for the FFI matrix,
//! applied here to the numeric/print/time builtin set plus the `dl_call_*`
//! family, whose trampoline casts a resolved `core.dl.sym` address to the
//! right `extern "C"` function-pointer type per id and calls through it.

use crate::value::Lane;

/// `abs`, `I32` lane.
pub const ABS_I32: u32 = 0;
/// `abs`, `I64` lane.
pub const ABS_I64: u32 = 1;
/// `abs`, `F32` lane.
pub const ABS_F32: u32 = 2;
/// `abs`, `F64` lane.
pub const ABS_F64: u32 = 3;
/// `min`, `I32` lane.
pub const MIN_I32: u32 = 4;
/// `max`, `I32` lane.
pub const MAX_I32: u32 = 5;
/// `min`, `I64` lane.
pub const MIN_I64: u32 = 6;
/// `max`, `I64` lane.
pub const MAX_I64: u32 = 7;
/// `min`, `F32` lane.
pub const MIN_F32: u32 = 8;
/// `max`, `F32` lane.
pub const MAX_F32: u32 = 9;
/// `min`, `F64` lane.
pub const MIN_F64: u32 = 10;
/// `max`, `F64` lane.
pub const MAX_F64: u32 = 11;
/// Monotonic clock, nanoseconds since an arbitrary epoch.
pub const MONOTONIC_NANOS: u32 = 12;
/// Wall clock, nanoseconds since the Unix epoch.
pub const WALL_CLOCK_NANOS: u32 = 13;
/// Print with a type tag, `I32` lane.
pub const PRINT_I32: u32 = 14;
/// Print with a type tag, `I64` lane.
pub const PRINT_I64: u32 = 15;
/// Print with a type tag, `F32` lane.
pub const PRINT_F32: u32 = 16;
/// Print with a type tag, `F64` lane.
pub const PRINT_F64: u32 = 17;
/// Print with a type tag, `Ref` lane (a heap string).
pub const PRINT_REF: u32 = 18;
/// Fatal guest-raised trap carrying an `I64` code.
pub const TRAP: u32 = 19;
/// `dl_call`, `i8` lane (carried as `I32`).
pub const DL_CALL_I8: u32 = 20;
/// `dl_call`, `i16` lane (carried as `I32`).
pub const DL_CALL_I16: u32 = 21;
/// `dl_call`, `i32` lane.
pub const DL_CALL_I32: u32 = 22;
/// `dl_call`, `i64` lane.
pub const DL_CALL_I64: u32 = 23;
/// `dl_call`, `u8` lane (carried as `I32`).
pub const DL_CALL_U8: u32 = 24;
/// `dl_call`, `u16` lane (carried as `I32`).
pub const DL_CALL_U16: u32 = 25;
/// `dl_call`, `u32` lane (carried as `I32`).
pub const DL_CALL_U32: u32 = 26;
/// `dl_call`, `u64` lane (carried as `I64`).
pub const DL_CALL_U64: u32 = 27;
/// `dl_call`, `f32` lane.
pub const DL_CALL_F32: u32 = 28;
/// `dl_call`, `f64` lane.
pub const DL_CALL_F64: u32 = 29;
/// `dl_call`, `bool` lane (carried as `I32`).
pub const DL_CALL_BOOL: u32 = 30;
/// `dl_call`, `char` lane (carried as `I32`, truncated to a byte).
pub const DL_CALL_CHAR: u32 = 31;
/// `dl_call`, nullary C-string return (`const char *(*)()`).
pub const DL_CALL_STR0: u32 = 32;

/// One past the highest assigned intrinsic id.
pub const COUNT: u32 = 33;

/// The pop/push lane signature for an intrinsic id, or `None` if `id` names
/// no known builtin.
pub fn signature(id: u32) -> Option<(&'static [Lane], &'static [Lane])> {
    use Lane::{F32, F64, I32, I64, Ref};
    Some(match id {
        ABS_I32 => (&[I32], &[I32]),
        ABS_I64 => (&[I64], &[I64]),
        ABS_F32 => (&[F32], &[F32]),
        ABS_F64 => (&[F64], &[F64]),
        MIN_I32 | MAX_I32 => (&[I32, I32], &[I32]),
        MIN_I64 | MAX_I64 => (&[I64, I64], &[I64]),
        MIN_F32 | MAX_F32 => (&[F32, F32], &[F32]),
        MIN_F64 | MAX_F64 => (&[F64, F64], &[F64]),
        MONOTONIC_NANOS | WALL_CLOCK_NANOS => (&[], &[I64]),
        PRINT_I32 => (&[I32], &[]),
        PRINT_I64 => (&[I64], &[]),
        PRINT_F32 => (&[F32], &[]),
        PRINT_F64 => (&[F64], &[]),
        PRINT_REF => (&[Ref], &[]),
        TRAP => (&[I64], &[]),
        DL_CALL_I8 | DL_CALL_I16 | DL_CALL_I32 | DL_CALL_U8 | DL_CALL_U16 | DL_CALL_U32
        | DL_CALL_BOOL | DL_CALL_CHAR => (&[I64, I32, I32], &[I32]),
        DL_CALL_I64 | DL_CALL_U64 => (&[I64, I64, I64], &[I64]),
        DL_CALL_F32 => (&[I64, F32, F32], &[F32]),
        DL_CALL_F64 => (&[I64, F64, F64], &[F64]),
        DL_CALL_STR0 => (&[I64], &[Ref]),
        _ => return None,
    })
}

/// SIR mnemonic for an intrinsic id, for the disassembler.
pub fn name(id: u32) -> Option<&'static str> {
    Some(match id {
        ABS_I32 => "abs.i32",
        ABS_I64 => "abs.i64",
        ABS_F32 => "abs.f32",
        ABS_F64 => "abs.f64",
        MIN_I32 => "min.i32",
        MAX_I32 => "max.i32",
        MIN_I64 => "min.i64",
        MAX_I64 => "max.i64",
        MIN_F32 => "min.f32",
        MAX_F32 => "max.f32",
        MIN_F64 => "min.f64",
        MAX_F64 => "max.f64",
        MONOTONIC_NANOS => "monotonic_nanos",
        WALL_CLOCK_NANOS => "wall_clock_nanos",
        PRINT_I32 => "print.i32",
        PRINT_I64 => "print.i64",
        PRINT_F32 => "print.f32",
        PRINT_F64 => "print.f64",
        PRINT_REF => "print.ref",
        TRAP => "trap",
        DL_CALL_I8 => "dl_call.i8",
        DL_CALL_I16 => "dl_call.i16",
        DL_CALL_I32 => "dl_call.i32",
        DL_CALL_I64 => "dl_call.i64",
        DL_CALL_U8 => "dl_call.u8",
        DL_CALL_U16 => "dl_call.u16",
        DL_CALL_U32 => "dl_call.u32",
        DL_CALL_U64 => "dl_call.u64",
        DL_CALL_F32 => "dl_call.f32",
        DL_CALL_F64 => "dl_call.f64",
        DL_CALL_BOOL => "dl_call.bool",
        DL_CALL_CHAR => "dl_call.char",
        DL_CALL_STR0 => "dl_call.str0",
        _ => return None,
    })
}

/// Reverse of [`name`], for the SIR assembler's tokenizer.
pub fn id_from_name(s: &str) -> Option<u32> {
    (0..COUNT).find(|&id| name(id) == Some(s))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_assigned_id_below_count_has_a_signature() {
        for id in 0..COUNT {
            assert!(signature(id).is_some(), "missing signature for id {id}");
        }
    }

    #[test]
    fn unassigned_id_has_no_signature() {
        assert_eq!(signature(COUNT), None);
        assert_eq!(signature(9_999), None);
    }

    #[test]
    fn every_assigned_id_round_trips_its_name() {
        for id in 0..COUNT {
            let n = name(id).unwrap();
            assert_eq!(id_from_name(n), Some(id));
        }
    }
}
