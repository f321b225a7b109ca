//! The value-slot model.
//!
//! A [`Slot`] is a 64-bit word with no runtime tag. The verifier (see
//! [`crate::verifier`]) proves a [`Lane`] for every program point, so the
//! interpreter never has to ask "what kind of value is this" at run time —
//! the opcode being executed already knows.

use strum::EnumIter;

/// The abstract type of a value on the operand stack, in a local slot, or in
/// a global slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, derive_more::Display)]
pub enum Lane {
    /// 32-bit signed/unsigned integer, sign-extended into the low 32 bits.
    I32,
    /// 64-bit integer, occupying the full word.
    I64,
    /// 32-bit IEEE-754 float, bit pattern in the low 32 bits.
    F32,
    /// 64-bit IEEE-754 float, full bit pattern.
    F64,
    /// A 32-bit heap handle, null sentinel `0xFFFF_FFFF`.
    Ref,
}

impl Lane {
    /// Whether the verifier must track this lane in a GC reference bitmap.
    pub const fn is_ref(self) -> bool {
        matches!(self, Lane::Ref)
    }
}

/// Raw, untagged storage for a value-stack slot, a local, or a global.
pub type Slot = u64;

/// Sentinel handle value meaning "null reference".
pub const NULL_HANDLE: u32 = 0xFFFF_FFFF;

/// Reserved `type_id` values for the four primitive, non-heap lanes. Any
/// `type_id` at or above [`TYPE_ID_REF_BASE`] names a row in the module's
/// `types` table and is always the `Ref` lane — field/param/return types
/// never distinguish between user record kinds at the lane level, only the
/// verifier's const-ref and field-width checks do.
pub const TYPE_ID_I32: u32 = 0;
/// See [`TYPE_ID_I32`].
pub const TYPE_ID_I64: u32 = 1;
/// See [`TYPE_ID_I32`].
pub const TYPE_ID_F32: u32 = 2;
/// See [`TYPE_ID_I32`].
pub const TYPE_ID_F64: u32 = 3;
/// First `type_id` naming a `types`-table row rather than a primitive lane.
pub const TYPE_ID_REF_BASE: u32 = 4;

/// The lane a signature/field/global `type_id` denotes.
pub const fn lane_of_type_id(type_id: u32) -> Lane {
    match type_id {
        TYPE_ID_I32 => Lane::I32,
        TYPE_ID_I64 => Lane::I64,
        TYPE_ID_F32 => Lane::F32,
        TYPE_ID_F64 => Lane::F64,
        _ => Lane::Ref,
    }
}

/// Conversions between [`Slot`] and the Rust type a [`Lane`] denotes.
///
/// Kept as free functions (not methods on an enum-tagged `Value`) because no
/// tag exists at run time — the caller already knows the lane from the
/// opcode it is executing.
pub mod slot {
    use super::{Slot, NULL_HANDLE};

    /// Encode a signed 32-bit integer, sign-extending into the full word.
    pub fn from_i32(v: i32) -> Slot {
        v as i64 as u64
    }

    /// Decode the low 32 bits as a signed integer.
    pub fn to_i32(s: Slot) -> i32 {
        s as u32 as i32
    }

    /// Encode a signed 64-bit integer.
    pub fn from_i64(v: i64) -> Slot {
        v as u64
    }

    /// Decode the full word as a signed 64-bit integer.
    pub fn to_i64(s: Slot) -> i64 {
        s as i64
    }

    /// Encode an IEEE-754 single-precision float into the low 32 bits.
    pub fn from_f32(v: f32) -> Slot {
        v.to_bits() as u64
    }

    /// Decode the low 32 bits as an IEEE-754 single-precision float.
    pub fn to_f32(s: Slot) -> f32 {
        f32::from_bits(s as u32)
    }

    /// Encode an IEEE-754 double-precision float.
    pub fn from_f64(v: f64) -> Slot {
        v.to_bits()
    }

    /// Decode the full word as an IEEE-754 double-precision float.
    pub fn to_f64(s: Slot) -> f64 {
        f64::from_bits(s)
    }

    /// Encode a heap handle, `None` becoming the null sentinel.
    pub fn from_handle(h: Option<u32>) -> Slot {
        h.unwrap_or(NULL_HANDLE) as u64
    }

    /// Decode a heap handle, the null sentinel becoming `None`.
    pub fn to_handle(s: Slot) -> Option<u32> {
        let h = s as u32;
        if h == NULL_HANDLE {
            None
        } else {
            Some(h)
        }
    }

    /// Decode the low bit as a boolean (`Bool*` opcodes truth convention).
    pub fn to_bool(s: Slot) -> bool {
        (s as u32) & 1 != 0
    }

    /// Encode a boolean as an `I32` lane (`1` or `0`).
    pub fn from_bool(b: bool) -> Slot {
        from_i32(b as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn i32_round_trips_negative() {
        assert_eq!(slot::to_i32(slot::from_i32(-1)), -1);
        assert_eq!(slot::from_i32(-1), u64::MAX);
    }

    #[test]
    fn handle_sentinel_is_null() {
        assert_eq!(slot::to_handle(slot::from_handle(None)), None);
        assert_eq!(slot::to_handle(slot::from_handle(Some(7))), Some(7));
    }

    #[test]
    fn type_ids_below_ref_base_are_primitive_lanes() {
        assert_eq!(lane_of_type_id(TYPE_ID_I32), Lane::I32);
        assert_eq!(lane_of_type_id(TYPE_ID_F64), Lane::F64);
        assert_eq!(lane_of_type_id(TYPE_ID_REF_BASE), Lane::Ref);
        assert_eq!(lane_of_type_id(TYPE_ID_REF_BASE + 5), Lane::Ref);
    }

    #[test]
    fn float_bits_round_trip() {
        assert_eq!(slot::to_f64(slot::from_f64(1.5)), 1.5);
        assert_eq!(slot::to_f32(slot::from_f32(-2.25)), -2.25);
    }
}
