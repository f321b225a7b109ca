//! Fixed-width row table structs (§6).
//!
//! Every row type here is decoded the way `idb-rs` decodes its own
//! fixed-width binary records: read a `u32` field at a time off a byte
//! cursor, no intermediate allocation, bounds-checked against the buffer.

use crate::consts::SENTINEL_U32;
use crate::error::LoadError;
use std::string::ToString as _;

macro_rules! read_u32_field {
    ($buf:expr, $at:expr, $ctx:expr) => {{
        let bytes = $buf
            .get($at..$at + 4)
            .ok_or_else(|| LoadError::UnexpectedEof { context: $ctx.to_string() })?;
        u32::from_le_bytes(bytes.try_into().unwrap())
    }};
}

/// A `types` row (width 20).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeRow {
    /// Size in bytes of one instance of this type.
    pub size: u32,
    /// Index of the first row in `fields` belonging to this type.
    pub field_start: u32,
    /// Number of contiguous `fields` rows belonging to this type.
    pub field_count: u32,
    /// Type flags (reserved for front-end use; unused by the core runtime).
    pub flags: u32,
}

impl TypeRow {
    /// Row width in bytes.
    pub const WIDTH: usize = 20;

    pub(crate) fn decode(buf: &[u8], at: usize) -> Result<Self, LoadError> {
        Ok(Self {
            size: read_u32_field!(buf, at, "type row size"),
            field_start: read_u32_field!(buf, at + 4, "type row field_start"),
            field_count: read_u32_field!(buf, at + 8, "type row field_count"),
            flags: read_u32_field!(buf, at + 12, "type row flags"),
            // at + 16: reserved
        })
    }
}

/// A `fields` row (width 16). Belongs to the type row whose
/// `[field_start, field_start + field_count)` range contains its index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldRow {
    /// Byte offset of this field within its owning type's payload.
    pub offset: u32,
    /// Type id of the field's value (used to pick a width and, for `Ref`
    /// fields, to mark them in the GC's per-type walk).
    pub type_id: u32,
    /// Field flags.
    pub flags: u32,
}

impl FieldRow {
    /// Row width in bytes.
    pub const WIDTH: usize = 16;

    pub(crate) fn decode(buf: &[u8], at: usize) -> Result<Self, LoadError> {
        Ok(Self {
            offset: read_u32_field!(buf, at, "field row offset"),
            type_id: read_u32_field!(buf, at + 4, "field row type_id"),
            flags: read_u32_field!(buf, at + 8, "field row flags"),
            // at + 12: reserved
        })
    }
}

/// A `methods` row (width 16). `code_offset` is *not* stored here — it
/// lives on the corresponding `functions` row, referenced by
/// `FunctionRow::method_id` (see DESIGN.md's resolution of the row-width
/// vs. §3's prose mismatch).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodRow {
    /// Const-pool string index naming the method.
    pub name_const: u32,
    /// Index into `sigs`.
    pub sig_id: u32,
    /// Number of local slots the method's frame needs.
    pub local_count: u32,
    /// Method flags (bit 0: import).
    pub flags: u32,
}

impl MethodRow {
    /// Row width in bytes.
    pub const WIDTH: usize = 16;
    /// Flag bit marking a method row as a synthetic import (§4.3).
    pub const FLAG_IMPORT: u32 = 1;

    pub(crate) fn decode(buf: &[u8], at: usize) -> Result<Self, LoadError> {
        Ok(Self {
            name_const: read_u32_field!(buf, at, "method row name_const"),
            sig_id: read_u32_field!(buf, at + 4, "method row sig_id"),
            local_count: read_u32_field!(buf, at + 8, "method row local_count"),
            flags: read_u32_field!(buf, at + 12, "method row flags"),
        })
    }

    /// Whether this method row represents an import.
    pub fn is_import(&self) -> bool {
        self.flags & Self::FLAG_IMPORT != 0
    }
}

/// A `sigs` row (width 12). `param_type_start` is *derived*, not stored: the
/// flat `param_types[]` array is packed in sig declaration order, so a
/// sig's own params begin immediately after the previous sig's.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigRow {
    /// Type id of the return value, or `SENTINEL_U32` for void.
    pub ret_type_id: u32,
    /// Number of parameters.
    pub param_count: u32,
    /// Calling convention tag (0 = guest, 1 = import/FFI).
    pub call_conv: u32,
}

impl SigRow {
    /// Row width in bytes.
    pub const WIDTH: usize = 12;

    pub(crate) fn decode(buf: &[u8], at: usize) -> Result<Self, LoadError> {
        Ok(Self {
            ret_type_id: read_u32_field!(buf, at, "sig row ret_type_id"),
            param_count: read_u32_field!(buf, at + 4, "sig row param_count"),
            call_conv: read_u32_field!(buf, at + 8, "sig row call_conv"),
        })
    }

    /// Whether the signature returns a value.
    pub fn has_return(&self) -> bool {
        self.ret_type_id != SENTINEL_U32
    }
}

/// A `globals` row (width 16).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalRow {
    /// Type id of the global's value.
    pub type_id: u32,
    /// Global flags.
    pub flags: u32,
    /// Const-pool index supplying the initial value, or `SENTINEL_U32` for
    /// zero-initialized.
    pub init_const: u32,
}

impl GlobalRow {
    /// Row width in bytes.
    pub const WIDTH: usize = 16;

    pub(crate) fn decode(buf: &[u8], at: usize) -> Result<Self, LoadError> {
        Ok(Self {
            type_id: read_u32_field!(buf, at, "global row type_id"),
            flags: read_u32_field!(buf, at + 4, "global row flags"),
            init_const: read_u32_field!(buf, at + 8, "global row init_const"),
            // at + 12: reserved
        })
    }
}

/// A `functions` row (width 16): the concrete, code-bearing realization of
/// a `methods` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionRow {
    /// Index into `methods`.
    pub method_id: u32,
    /// Byte offset into the `code` section, or `SENTINEL_U32` for an
    /// import's synthetic function row.
    pub code_offset: u32,
    /// Size in bytes of this function's code range.
    pub code_size: u32,
    /// Verifier-computed upper bound on operand-stack depth (filled in by
    /// `verify`, zero beforehand).
    pub stack_max: u32,
}

impl FunctionRow {
    /// Row width in bytes.
    pub const WIDTH: usize = 16;

    pub(crate) fn decode(buf: &[u8], at: usize) -> Result<Self, LoadError> {
        Ok(Self {
            method_id: read_u32_field!(buf, at, "function row method_id"),
            code_offset: read_u32_field!(buf, at + 4, "function row code_offset"),
            code_size: read_u32_field!(buf, at + 8, "function row code_size"),
            stack_max: read_u32_field!(buf, at + 12, "function row stack_max"),
        })
    }

    /// Whether this function row is an import's synthetic placeholder.
    pub fn is_import(&self) -> bool {
        self.code_offset == SENTINEL_U32
    }
}

/// An `imports` row (width 16).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImportRow {
    /// Const-pool string index naming the import's module.
    pub module_name_const: u32,
    /// Const-pool string index naming the import's symbol.
    pub symbol_name_const: u32,
    /// Index into `sigs`.
    pub sig_id: u32,
    /// Import flags.
    pub flags: u32,
}

impl ImportRow {
    /// Row width in bytes.
    pub const WIDTH: usize = 16;

    pub(crate) fn decode(buf: &[u8], at: usize) -> Result<Self, LoadError> {
        Ok(Self {
            module_name_const: read_u32_field!(buf, at, "import row module_name_const"),
            symbol_name_const: read_u32_field!(buf, at + 4, "import row symbol_name_const"),
            sig_id: read_u32_field!(buf, at + 8, "import row sig_id"),
            flags: read_u32_field!(buf, at + 12, "import row flags"),
        })
    }
}

/// An `exports` row (width 16).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportRow {
    /// Const-pool string index naming the export.
    pub name_const: u32,
    /// Index into `methods`.
    pub method_id: u32,
    /// Export flags.
    pub flags: u32,
}

impl ExportRow {
    /// Row width in bytes.
    pub const WIDTH: usize = 16;

    pub(crate) fn decode(buf: &[u8], at: usize) -> Result<Self, LoadError> {
        Ok(Self {
            name_const: read_u32_field!(buf, at, "export row name_const"),
            method_id: read_u32_field!(buf, at + 4, "export row method_id"),
            flags: read_u32_field!(buf, at + 8, "export row flags"),
            // at + 12: reserved
        })
    }
}

/// A debug `files` row (width 8, second word reserved).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugFileRow {
    /// Const-pool string index naming the source file.
    pub name_const: u32,
}

impl DebugFileRow {
    /// Row width in bytes.
    pub const WIDTH: usize = 8;

    pub(crate) fn decode(buf: &[u8], at: usize) -> Result<Self, LoadError> {
        Ok(Self {
            name_const: read_u32_field!(buf, at, "debug file row name_const"),
            // at + 4: reserved
        })
    }
}

/// A debug `lines` row (width 20).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugLineRow {
    /// Function index this row documents.
    pub func_index: u32,
    /// Program counter within that function's code.
    pub pc: u32,
    /// Index into the debug `files` table.
    pub file_id: u32,
    /// Source line number.
    pub line: u32,
    /// Source column number.
    pub column: u32,
}

impl DebugLineRow {
    /// Row width in bytes.
    pub const WIDTH: usize = 20;

    pub(crate) fn decode(buf: &[u8], at: usize) -> Result<Self, LoadError> {
        Ok(Self {
            func_index: read_u32_field!(buf, at, "debug line row func_index"),
            pc: read_u32_field!(buf, at + 4, "debug line row pc"),
            file_id: read_u32_field!(buf, at + 8, "debug line row file_id"),
            line: read_u32_field!(buf, at + 12, "debug line row line"),
            column: read_u32_field!(buf, at + 16, "debug line row column"),
        })
    }
}

/// A debug `syms` row (width 16).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebugSymRow {
    /// Index into `methods`.
    pub method_id: u32,
    /// Const-pool string index naming the symbol.
    pub name_const: u32,
    /// Symbol flags.
    pub flags: u32,
}

impl DebugSymRow {
    /// Row width in bytes.
    pub const WIDTH: usize = 16;

    pub(crate) fn decode(buf: &[u8], at: usize) -> Result<Self, LoadError> {
        Ok(Self {
            method_id: read_u32_field!(buf, at, "debug sym row method_id"),
            name_const: read_u32_field!(buf, at + 4, "debug sym row name_const"),
            flags: read_u32_field!(buf, at + 8, "debug sym row flags"),
            // at + 12: reserved
        })
    }
}
