//! Handle-indexed object heap with mark-and-sweep GC (§4.5).
//!
//! Objects are never moved and never addressed by raw pointer across the
//! API boundary — only by a stable `u32` handle, in the same spirit as
//! `fuel-vm`'s memory model keeping all VM state behind owned buffers rather
//! than pointers the host could alias.

use crate::error::{RuntimeError, RuntimeResult};
use crate::sbc::rows::FieldRow;
use crate::sbc::Module;
use crate::value::{slot, Slot, NULL_HANDLE};

/// The kind of object a handle refers to, stamped in its header (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// UTF-16 string, immutable after creation.
    String,
    /// Fixed-length array of uniform-width elements.
    Array,
    /// Variable-length-up-to-capacity list of uniform-width elements.
    List,
    /// A user record, laid out per its `types`/`fields` rows.
    Artifact,
    /// A closure over a method plus captured upvalues.
    Closure,
}

impl ObjectKind {
    fn name(self) -> &'static str {
        match self {
            Self::String => "String",
            Self::Array => "Array",
            Self::List => "List",
            Self::Artifact => "Artifact",
            Self::Closure => "Closure",
        }
    }
}

/// Element kind for `Array`/`List` payloads, fixed at allocation time.
///
/// Tracks more than byte width: `Ref` is kept distinct from the same-width
/// `I32`/`F32` numeric kinds so the GC marker (`Heap::referenced_handles`)
/// knows which width-4 payloads actually hold handles instead of
/// reinterpreting every width-4 array's raw bytes as handle indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElemWidth {
    /// 4-byte `I32` elements.
    I32,
    /// 8-byte `I64` elements.
    I64,
    /// 4-byte `F32` elements.
    F32,
    /// 8-byte `F64` elements.
    F64,
    /// 4-byte heap handles.
    Ref,
}

impl ElemWidth {
    /// Width in bytes.
    pub fn bytes(self) -> usize {
        match self {
            Self::I32 | Self::F32 | Self::Ref => 4,
            Self::I64 | Self::F64 => 8,
        }
    }

    /// Whether elements of this kind are heap handles.
    pub fn is_ref(self) -> bool {
        matches!(self, Self::Ref)
    }

    /// Decode a `NewArray`/`NewList` operand tag byte, or `None` if it names
    /// no known element kind.
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Self::I32,
            1 => Self::I64,
            2 => Self::F32,
            3 => Self::F64,
            4 => Self::Ref,
            _ => return None,
        })
    }

    /// Reverse of [`Self::from_tag`].
    pub fn to_tag(self) -> u8 {
        match self {
            Self::I32 => 0,
            Self::I64 => 1,
            Self::F32 => 2,
            Self::F64 => 3,
            Self::Ref => 4,
        }
    }
}

/// A heap object: header plus a kind-specific payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    /// Object kind.
    pub kind: ObjectKind,
    /// The `type_id` this object was allocated with (meaningful for
    /// `Artifact`; `SENTINEL_U32`-ish placeholders for the other kinds since
    /// they aren't user types).
    pub type_id: u32,
    /// Set by `Mark`, cleared by `ResetMarks`.
    pub marked: bool,
    /// Raw payload bytes, laid out per `kind` (§3).
    pub payload: Vec<u8>,
    /// Element width, for `Array`/`List` only.
    pub elem_width: Option<ElemWidth>,
}

/// A handle-indexed, non-moving object store (§4.5).
#[derive(Debug, Clone, Default)]
pub struct Heap {
    slots: Vec<Option<Object>>,
    free_list: Vec<u32>,
}

impl Heap {
    /// A fresh, empty heap.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (allocated, not-yet-freed) objects.
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Allocate an object, returning its handle.
    pub fn allocate(&mut self, kind: ObjectKind, type_id: u32, payload: Vec<u8>, elem_width: Option<ElemWidth>) -> u32 {
        let object = Object { kind, type_id, marked: false, payload, elem_width };
        if let Some(handle) = self.free_list.pop() {
            self.slots[handle as usize] = Some(object);
            handle
        } else {
            let handle = self.slots.len() as u32;
            self.slots.push(Some(object));
            handle
        }
    }

    /// Look up an object by handle, failing with the right trap if it is
    /// null, dangling, or the wrong kind.
    pub fn get(&self, handle: u32, expected: ObjectKind) -> RuntimeResult<&Object> {
        if handle == NULL_HANDLE {
            return Err(RuntimeError::NullDereference);
        }
        let object = self
            .slots
            .get(handle as usize)
            .and_then(|s| s.as_ref())
            .ok_or(RuntimeError::NullDereference)?;
        if std::mem::discriminant(&object.kind) != std::mem::discriminant(&expected) {
            return Err(RuntimeError::WrongObjectKind {
                handle,
                found: object.kind.name(),
                expected: expected.name(),
            });
        }
        Ok(object)
    }

    /// Mutable lookup, same checks as [`Heap::get`].
    pub fn get_mut(&mut self, handle: u32, expected: ObjectKind) -> RuntimeResult<&mut Object> {
        if handle == NULL_HANDLE {
            return Err(RuntimeError::NullDereference);
        }
        let object = self
            .slots
            .get_mut(handle as usize)
            .and_then(|s| s.as_mut())
            .ok_or(RuntimeError::NullDereference)?;
        if std::mem::discriminant(&object.kind) != std::mem::discriminant(&expected) {
            return Err(RuntimeError::WrongObjectKind {
                handle,
                found: object.kind.name(),
                expected: expected.name(),
            });
        }
        Ok(object)
    }

    /// Clear every object's mark bit. First step of a GC cycle (§4.5).
    pub fn reset_marks(&mut self) {
        for slot in self.slots.iter_mut().flatten() {
            slot.marked = false;
        }
    }

    /// Mark `handle` and recursively everything it references, using
    /// `module`'s field tables to walk `Artifact` payloads.
    pub fn mark(&mut self, handle: u32, module: &Module) {
        if handle == NULL_HANDLE {
            return;
        }
        let Some(Some(object)) = self.slots.get(handle as usize) else {
            return;
        };
        if object.marked {
            return;
        }
        let kind = object.kind;
        let type_id = object.type_id;
        let payload = object.payload.clone();
        let elem_width = object.elem_width;
        if let Some(Some(object)) = self.slots.get_mut(handle as usize) {
            object.marked = true;
        }

        for child in self.referenced_handles(kind, type_id, &payload, elem_width, module) {
            self.mark(child, module);
        }
    }

    fn referenced_handles(
        &self,
        kind: ObjectKind,
        type_id: u32,
        payload: &[u8],
        elem_width: Option<ElemWidth>,
        module: &Module,
    ) -> Vec<u32> {
        match kind {
            ObjectKind::String => Vec::new(),
            ObjectKind::Array => {
                if elem_width != Some(ElemWidth::Ref) {
                    return Vec::new();
                }
                read_handles(&payload[4..])
            }
            ObjectKind::List => {
                if elem_width != Some(ElemWidth::Ref) {
                    return Vec::new();
                }
                let length = u32::from_le_bytes(payload[0..4].try_into().unwrap()) as usize;
                read_handles(&payload[8..8 + length * 4])
            }
            ObjectKind::Artifact => {
                let mut handles = Vec::new();
                for field in module.type_fields(type_id) {
                    if crate::value::lane_of_type_id(field.type_id).is_ref() {
                        if let Some(h) = read_field_handle(payload, field) {
                            handles.push(h);
                        }
                    }
                }
                handles
            }
            ObjectKind::Closure => read_handles(&payload[8..]),
        }
    }

    /// Free every unmarked handle back to the free list. Second (and final)
    /// step of a GC cycle.
    pub fn sweep(&mut self) {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let should_free = matches!(slot, Some(object) if !object.marked);
            if should_free {
                *slot = None;
                self.free_list.push(index as u32);
            }
        }
    }
}

fn read_handles(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .filter(|h| *h != NULL_HANDLE)
        .collect()
}

fn read_field_handle(payload: &[u8], field: &FieldRow) -> Option<u32> {
    let at = field.offset as usize;
    let bytes = payload.get(at..at + 4)?;
    let handle = u32::from_le_bytes(bytes.try_into().unwrap());
    (handle != NULL_HANDLE).then_some(handle)
}

/// Encode a handle as a [`Slot`].
pub fn handle_to_slot(h: u32) -> Slot {
    slot::from_handle((h != NULL_HANDLE).then_some(h))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn string_object(text: &str) -> (ObjectKind, u32, Vec<u8>, Option<ElemWidth>) {
        let mut payload = (text.encode_utf16().count() as u32).to_le_bytes().to_vec();
        for unit in text.encode_utf16() {
            payload.extend_from_slice(&unit.to_le_bytes());
        }
        (ObjectKind::String, 0, payload, None)
    }

    #[test]
    fn allocate_reuses_freed_handles() {
        let mut heap = Heap::new();
        let (kind, type_id, payload, width) = string_object("a");
        let h1 = heap.allocate(kind, type_id, payload.clone(), width);
        heap.reset_marks();
        heap.sweep();
        let h2 = heap.allocate(kind, type_id, payload, width);
        assert_eq!(h1, h2);
    }

    #[test]
    fn sweep_frees_unreached_strings() {
        let mut heap = Heap::new();
        let (kind, type_id, payload, width) = string_object("dead");
        heap.allocate(kind, type_id, payload, width);
        assert_eq!(heap.live_count(), 1);
        heap.reset_marks();
        heap.sweep();
        assert_eq!(heap.live_count(), 0);
    }

    #[test]
    fn mark_keeps_rooted_array_of_refs_alive() {
        let mut heap = Heap::new();
        let (kind, type_id, payload, width) = string_object("kept");
        let target = heap.allocate(kind, type_id, payload, width);

        let mut array_payload = 1u32.to_le_bytes().to_vec();
        array_payload.extend_from_slice(&target.to_le_bytes());
        let array = heap.allocate(ObjectKind::Array, 0, array_payload, Some(ElemWidth::Ref));

        let module = Module {
            header: crate::sbc::Header {
                magic: crate::sbc::MAGIC,
                version: crate::sbc::SUPPORTED_VERSION,
                endian: crate::sbc::ENDIAN_LITTLE,
                flags: 0,
                section_count: 0,
                section_table_offset: 32,
                entry_method_id: crate::consts::SENTINEL_U32,
            },
            types: vec![],
            fields: vec![],
            methods: vec![],
            sigs: vec![],
            param_types: vec![],
            globals: vec![],
            functions: vec![],
            imports: vec![],
            exports: vec![],
            const_pool: crate::const_pool::ConstPool::from_entries(vec![]),
            code: vec![],
            debug: Default::default(),
            function_is_import: vec![],
        };

        heap.reset_marks();
        heap.mark(array, &module);
        heap.sweep();

        assert_eq!(heap.live_count(), 2);
        assert!(heap.get(target, ObjectKind::String).is_ok());
    }

    #[test]
    fn mark_does_not_chase_handles_in_numeric_array() {
        let mut heap = Heap::new();
        let (kind, type_id, payload, width) = string_object("unrooted");
        let decoy = heap.allocate(kind, type_id, payload, width);

        // A width-4 I32 array whose only element's bit pattern matches
        // `decoy`'s handle. If marking ever reinterprets this payload as
        // handles, `decoy` would wrongly survive the sweep below.
        let mut array_payload = Vec::new();
        array_payload.extend_from_slice(&decoy.to_le_bytes());
        let array = heap.allocate(ObjectKind::Array, 0, array_payload, Some(ElemWidth::I32));

        let module = Module {
            header: crate::sbc::Header {
                magic: crate::sbc::MAGIC,
                version: crate::sbc::SUPPORTED_VERSION,
                endian: crate::sbc::ENDIAN_LITTLE,
                flags: 0,
                section_count: 0,
                section_table_offset: 32,
                entry_method_id: crate::consts::SENTINEL_U32,
            },
            types: vec![],
            fields: vec![],
            methods: vec![],
            sigs: vec![],
            param_types: vec![],
            globals: vec![],
            functions: vec![],
            imports: vec![],
            exports: vec![],
            const_pool: crate::const_pool::ConstPool::from_entries(vec![]),
            code: vec![],
            debug: Default::default(),
            function_is_import: vec![],
        };

        heap.reset_marks();
        heap.mark(array, &module);
        heap.sweep();

        assert_eq!(heap.live_count(), 1);
        assert!(heap.get(array, ObjectKind::Array).is_ok());
        assert!(heap.get(decoy, ObjectKind::String).is_err());
    }
}
