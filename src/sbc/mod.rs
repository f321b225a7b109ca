//! The SBC container (§3, §6): header, section directory, row tables, code
//! and const-pool blobs, assembled into an in-memory [`Module`].
//!
//! This module only defines the shapes; [`crate::loader`] is what turns raw
//! bytes into a validated [`Module`] (§4.3). A `Module` is otherwise an
//! owned, read-only aggregate — no raw pointers or lifetimes tie it back to
//! the byte buffer it was parsed from, matching the memory-model guidance in
//! §9 ("model the module as an owned, read-only aggregate").

pub mod rows;

use crate::const_pool::ConstPool;
use rows::{
    DebugFileRow, DebugLineRow, DebugSymRow, ExportRow, FieldRow, FunctionRow, GlobalRow,
    ImportRow, MethodRow, SigRow, TypeRow,
};

/// Magic number stamped at the start of every SBC file: ASCII `SBC\0`.
pub const MAGIC: u32 = 0x0043_4253;

/// The only endianness byte this runtime accepts.
pub const ENDIAN_LITTLE: u8 = 1;

/// Header format versions this runtime accepts.
pub const SUPPORTED_VERSION: u16 = 1;

/// The fixed 32-byte SBC header (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Must equal [`MAGIC`].
    pub magic: u32,
    /// Format version.
    pub version: u16,
    /// Must equal [`ENDIAN_LITTLE`].
    pub endian: u8,
    /// Reserved flag byte, must be zero.
    pub flags: u8,
    /// Number of entries in the section directory.
    pub section_count: u32,
    /// Byte offset of the section directory, 4-aligned.
    pub section_table_offset: u32,
    /// Method id of the module's entry point, or `SENTINEL_U32`.
    pub entry_method_id: u32,
}

/// Section ids named in the directory (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SectionId {
    /// `types` row table.
    Types = 0,
    /// `fields` row table.
    Fields = 1,
    /// `methods` row table.
    Methods = 2,
    /// `sigs` row table (plus trailing flat `param_types`).
    Sigs = 3,
    /// Constant pool.
    ConstPool = 4,
    /// `globals` row table.
    Globals = 5,
    /// `functions` row table.
    Functions = 6,
    /// Code byte buffer.
    Code = 7,
    /// Debug info.
    Debug = 8,
    /// `imports` row table.
    Imports = 9,
    /// `exports` row table.
    Exports = 10,
}

impl SectionId {
    /// Decode a section id word, if it names a known section.
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => Self::Types,
            1 => Self::Fields,
            2 => Self::Methods,
            3 => Self::Sigs,
            4 => Self::ConstPool,
            5 => Self::Globals,
            6 => Self::Functions,
            7 => Self::Code,
            8 => Self::Debug,
            9 => Self::Imports,
            10 => Self::Exports,
            _ => return None,
        })
    }
}

/// One row of the section directory (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionEntry {
    /// Section id.
    pub id: u32,
    /// Byte offset of the section, 4-aligned.
    pub offset: u32,
    /// Byte size of the section.
    pub size: u32,
    /// Row/element count (meaning depends on the section).
    pub count: u32,
}

/// Decoded debug information (§6, SPEC_FULL.md's diagnostics supplement).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugInfo {
    /// Source file table.
    pub files: Vec<DebugFileRow>,
    /// PC-to-source-location rows, one per instruction that the SIR
    /// assembler emitted a `Line` opcode for.
    pub lines: Vec<DebugLineRow>,
    /// Method-name rows.
    pub syms: Vec<DebugSymRow>,
}

impl DebugInfo {
    /// Find the most specific line row at or before `pc` within `func_index`,
    /// used by the trap reporter (§4.6) and the interpreter's `Line`
    /// tracking.
    pub fn line_at(&self, func_index: u32, pc: u32) -> Option<&DebugLineRow> {
        self.lines
            .iter()
            .filter(|l| l.func_index == func_index && l.pc <= pc)
            .max_by_key(|l| l.pc)
    }

    /// The debug sym row for a method, if debug info kept one. The name
    /// itself lives in the const pool; resolve it via `Module::method_name`.
    pub fn sym_of(&self, method_id: u32) -> Option<&DebugSymRow> {
        self.syms.iter().find(|s| s.method_id == method_id)
    }
}

/// A fully parsed, structurally validated SBC module (§3).
///
/// Owns every row table and blob; nothing borrows from the original byte
/// slice the loader read.
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    /// Parsed header.
    pub header: Header,
    /// `types` rows.
    pub types: Vec<TypeRow>,
    /// `fields` rows.
    pub fields: Vec<FieldRow>,
    /// `methods` rows.
    pub methods: Vec<MethodRow>,
    /// `sigs` rows.
    pub sigs: Vec<SigRow>,
    /// Flat parameter type ids, packed in sig declaration order (see
    /// `SigRow`'s doc comment for why `param_type_start` is derived rather
    /// than stored).
    pub param_types: Vec<u32>,
    /// `globals` rows.
    pub globals: Vec<GlobalRow>,
    /// `functions` rows.
    pub functions: Vec<FunctionRow>,
    /// `imports` rows.
    pub imports: Vec<ImportRow>,
    /// `exports` rows.
    pub exports: Vec<ExportRow>,
    /// Decoded constant pool.
    pub const_pool: ConstPool,
    /// Code byte buffer, sliced per-function via `FunctionRow`.
    pub code: Vec<u8>,
    /// Decoded debug info (empty if the module carried none).
    pub debug: DebugInfo,
    /// `function_is_import[i]` is true iff `functions[i]` is a synthetic
    /// import row (§4.3).
    pub function_is_import: Vec<bool>,
}

impl Module {
    /// The param type ids for a given signature, derived from the flat,
    /// packed `param_types` array.
    pub fn sig_param_types(&self, sig_id: u32) -> &[u32] {
        let mut start = 0usize;
        for (i, sig) in self.sigs.iter().enumerate() {
            let count = sig.param_count as usize;
            if i as u32 == sig_id {
                return &self.param_types[start..start + count];
            }
            start += count;
        }
        &[]
    }

    /// The code byte range belonging to a function, or `None` for an
    /// import's synthetic function row.
    pub fn function_code(&self, func_index: u32) -> Option<&[u8]> {
        let row = self.functions.get(func_index as usize)?;
        if row.is_import() {
            return None;
        }
        let start = row.code_offset as usize;
        let end = start + row.code_size as usize;
        self.code.get(start..end)
    }

    /// The fields belonging to a type row.
    pub fn type_fields(&self, type_id: u32) -> &[FieldRow] {
        match self.types.get(type_id as usize) {
            Some(t) => {
                let start = t.field_start as usize;
                let end = start + t.field_count as usize;
                self.fields.get(start..end).unwrap_or(&[])
            }
            None => &[],
        }
    }

    /// Resolve a method's name from the const pool, if present.
    pub fn method_name(&self, method_id: u32) -> Option<&str> {
        let method = self.methods.get(method_id as usize)?;
        match self.const_pool.get(method.name_const)? {
            crate::const_pool::ConstEntry::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Resolve a function's method id to its owning `methods` row.
    pub fn method_of_function(&self, func_index: u32) -> Option<&MethodRow> {
        let row = self.functions.get(func_index as usize)?;
        self.methods.get(row.method_id as usize)
    }
}
