//! Property-based checks, grounded on `fuel-vm`'s
//! `cant_write_to_reserved_registers` test (decode an arbitrary raw integer
//! and assert an invariant holds for every input, not just hand-picked ones).

use quickcheck::TestResult;
use quickcheck_macros::quickcheck;
use simple_vm::opcode::OpCode;
use simple_vm::value::slot;

#[quickcheck]
fn opcode_from_byte_never_panics(raw: u8) -> TestResult {
    let _ = OpCode::from_byte(raw);
    TestResult::passed()
}

#[quickcheck]
fn slot_i32_round_trips(v: i32) -> bool {
    slot::to_i32(slot::from_i32(v)) == v
}

#[quickcheck]
fn slot_i64_round_trips(v: i64) -> bool {
    slot::to_i64(slot::from_i64(v)) == v
}

#[quickcheck]
fn slot_f32_round_trips(v: f32) -> bool {
    if v.is_nan() {
        return true;
    }
    slot::to_f32(slot::from_f32(v)) == v
}

#[quickcheck]
fn slot_handle_round_trips(raw: Option<u32>) -> bool {
    slot::to_handle(slot::from_handle(raw)) == raw
}
