//! Bytes → [`Module`] (§4.3).
//!
//! Mirrors the validate-then-construct shape of `fuel-vm`'s checked
//! transaction path: every structural check runs before any row table is
//! trusted, and a failure never leaves a partially built `Module` behind —
//! `load` either returns `Ok` with a fully decoded module or `Err` with
//! nothing constructed at all.

use crate::const_pool::decode_const_pool;
use crate::consts::{ALIGN, SENTINEL_U32};
use crate::error::{LoadError, LoadResult};
use crate::instruction::{decode_at, DecodeError};
use crate::sbc::rows::{
    DebugFileRow, DebugLineRow, DebugSymRow, ExportRow, FieldRow, FunctionRow, GlobalRow,
    ImportRow, MethodRow, SigRow, TypeRow,
};
use crate::sbc::{DebugInfo, Header, Module, SectionEntry, SectionId, ENDIAN_LITTLE, MAGIC};

const HEADER_LEN: usize = 32;
const SECTION_ENTRY_LEN: usize = 16;
const DEBUG_PREAMBLE_LEN: usize = 16;

/// Parse and structurally validate an SBC byte buffer into a [`Module`].
pub fn load(bytes: &[u8]) -> LoadResult<Module> {
    let header = read_header(bytes)?;
    let sections = read_section_table(bytes, &header)?;

    let types = decode_rows(bytes, &sections, SectionId::Types, TypeRow::WIDTH, TypeRow::decode)?;
    let fields =
        decode_rows(bytes, &sections, SectionId::Fields, FieldRow::WIDTH, FieldRow::decode)?;
    let mut methods =
        decode_rows(bytes, &sections, SectionId::Methods, MethodRow::WIDTH, MethodRow::decode)?;
    let (sigs, param_types) = decode_sigs(bytes, &sections)?;
    let globals =
        decode_rows(bytes, &sections, SectionId::Globals, GlobalRow::WIDTH, GlobalRow::decode)?;
    let mut functions = decode_rows(
        bytes,
        &sections,
        SectionId::Functions,
        FunctionRow::WIDTH,
        FunctionRow::decode,
    )?;
    let imports =
        decode_rows(bytes, &sections, SectionId::Imports, ImportRow::WIDTH, ImportRow::decode)?;
    let exports =
        decode_rows(bytes, &sections, SectionId::Exports, ExportRow::WIDTH, ExportRow::decode)?;
    let const_pool = decode_const_pool(section_bytes(bytes, &sections, SectionId::ConstPool)?)?;
    let code = section_bytes(bytes, &sections, SectionId::Code)?.to_vec();
    let debug = decode_debug(bytes, &sections)?;

    let mut function_is_import = vec![false; functions.len()];

    for import in &imports {
        let method_id = methods.len() as u32;
        methods.push(MethodRow {
            name_const: import.symbol_name_const,
            sig_id: import.sig_id,
            local_count: 0,
            flags: MethodRow::FLAG_IMPORT,
        });
        functions.push(FunctionRow {
            method_id,
            code_offset: SENTINEL_U32,
            code_size: 0,
            stack_max: 0,
        });
        function_is_import.push(true);
    }

    check_function_code_ranges(&functions)?;
    check_entry_method(&header, &functions)?;
    check_opcode_scan(&functions, &code)?;

    Ok(Module {
        header,
        types,
        fields,
        methods,
        sigs,
        param_types,
        globals,
        functions,
        imports,
        exports,
        const_pool,
        code,
        debug,
        function_is_import,
    })
}

fn read_header(bytes: &[u8]) -> LoadResult<Header> {
    let buf = bytes
        .get(0..HEADER_LEN)
        .ok_or_else(|| LoadError::UnexpectedEof { context: "header".to_string() })?;

    let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    if magic != MAGIC {
        return Err(LoadError::BadMagic { expected: MAGIC, found: magic });
    }
    let version = u16::from_le_bytes(buf[4..6].try_into().unwrap());
    if version != crate::sbc::SUPPORTED_VERSION {
        return Err(LoadError::UnsupportedVersion { found: version });
    }
    let endian = buf[6];
    if endian != ENDIAN_LITTLE {
        return Err(LoadError::UnsupportedEndian { found: endian });
    }
    let flags = buf[7];
    let section_count = u32::from_le_bytes(buf[8..12].try_into().unwrap());
    let section_table_offset = u32::from_le_bytes(buf[12..16].try_into().unwrap());
    let entry_method_id = u32::from_le_bytes(buf[16..20].try_into().unwrap());
    let reserved = &buf[20..32];
    if flags != 0 || reserved.iter().any(|b| *b != 0) {
        return Err(LoadError::ReservedNotZero);
    }

    Ok(Header {
        magic,
        version,
        endian,
        flags,
        section_count,
        section_table_offset,
        entry_method_id,
    })
}

fn read_section_table(bytes: &[u8], header: &Header) -> LoadResult<Vec<SectionEntry>> {
    let start = header.section_table_offset as usize;
    if start % ALIGN != 0 {
        return Err(LoadError::MisalignedSection { id: u32::MAX, offset: start as u32 });
    }
    let mut entries = Vec::with_capacity(header.section_count as usize);
    let mut seen = Vec::with_capacity(header.section_count as usize);

    for i in 0..header.section_count as usize {
        let at = start + i * SECTION_ENTRY_LEN;
        let row = bytes
            .get(at..at + SECTION_ENTRY_LEN)
            .ok_or_else(|| LoadError::UnexpectedEof { context: "section directory entry".to_string() })?;
        let id = u32::from_le_bytes(row[0..4].try_into().unwrap());
        let offset = u32::from_le_bytes(row[4..8].try_into().unwrap());
        let size = u32::from_le_bytes(row[8..12].try_into().unwrap());
        let count = u32::from_le_bytes(row[12..16].try_into().unwrap());

        if SectionId::from_u32(id).is_none() {
            return Err(LoadError::UnknownSection { id });
        }
        if seen.contains(&id) {
            return Err(LoadError::DuplicateSection { id });
        }
        if offset % ALIGN as u32 != 0 {
            return Err(LoadError::MisalignedSection { id, offset });
        }
        seen.push(id);
        entries.push(SectionEntry { id, offset, size, count });
    }

    let mut by_offset = entries.clone();
    by_offset.sort_by_key(|e| e.offset);
    for window in by_offset.windows(2) {
        let (a, b) = (&window[0], &window[1]);
        if a.offset + a.size > b.offset {
            return Err(LoadError::OverlappingSections { a: a.id, b: b.id });
        }
    }

    Ok(entries)
}

fn find_section(sections: &[SectionEntry], id: SectionId) -> Option<&SectionEntry> {
    sections.iter().find(|s| s.id == id as u32)
}

fn section_bytes<'a>(
    bytes: &'a [u8],
    sections: &[SectionEntry],
    id: SectionId,
) -> LoadResult<&'a [u8]> {
    match find_section(sections, id) {
        Some(entry) => bytes
            .get(entry.offset as usize..(entry.offset + entry.size) as usize)
            .ok_or_else(|| LoadError::UnexpectedEof { context: "section body".to_string() }),
        None => Ok(&[]),
    }
}

fn decode_rows<T>(
    bytes: &[u8],
    sections: &[SectionEntry],
    id: SectionId,
    row_width: usize,
    decode_one: fn(&[u8], usize) -> LoadResult<T>,
) -> LoadResult<Vec<T>> {
    let Some(entry) = find_section(sections, id) else {
        return Ok(Vec::new());
    };
    if entry.size as usize % row_width != 0 {
        return Err(LoadError::RowSizeMismatch {
            id: entry.id,
            size: entry.size,
            row_width: row_width as u32,
        });
    }
    let base = entry.offset as usize;
    let count = entry.size as usize / row_width;
    let mut rows = Vec::with_capacity(count);
    for i in 0..count {
        rows.push(decode_one(bytes, base + i * row_width)?);
    }
    Ok(rows)
}

/// `sigs` rows plus the trailing flat `param_types` array they share a
/// section with (§6: "Sigs=12 (+ trailing `param_types` u32 array)").
fn decode_sigs(bytes: &[u8], sections: &[SectionEntry]) -> LoadResult<(Vec<SigRow>, Vec<u32>)> {
    let Some(entry) = find_section(sections, SectionId::Sigs) else {
        return Ok((Vec::new(), Vec::new()));
    };
    let row_bytes = entry.count as usize * SigRow::WIDTH;
    if row_bytes as u32 > entry.size {
        return Err(LoadError::RowSizeMismatch {
            id: entry.id,
            size: entry.size,
            row_width: SigRow::WIDTH as u32,
        });
    }
    let base = entry.offset as usize;
    let mut sigs = Vec::with_capacity(entry.count as usize);
    for i in 0..entry.count as usize {
        sigs.push(SigRow::decode(bytes, base + i * SigRow::WIDTH)?);
    }

    let trailing = entry.size as usize - row_bytes;
    if trailing % 4 != 0 {
        return Err(LoadError::RowSizeMismatch { id: entry.id, size: entry.size, row_width: 4 });
    }
    let param_base = base + row_bytes;
    let param_count_total = trailing / 4;
    let mut param_types = Vec::with_capacity(param_count_total);
    for i in 0..param_count_total {
        let at = param_base + i * 4;
        let word = bytes
            .get(at..at + 4)
            .ok_or_else(|| LoadError::UnexpectedEof { context: "param_types entry".to_string() })?;
        param_types.push(u32::from_le_bytes(word.try_into().unwrap()));
    }

    Ok((sigs, param_types))
}

fn decode_debug(bytes: &[u8], sections: &[SectionEntry]) -> LoadResult<DebugInfo> {
    let Some(entry) = find_section(sections, SectionId::Debug) else {
        return Ok(DebugInfo::default());
    };
    if entry.size == 0 {
        return Ok(DebugInfo::default());
    }
    let base = entry.offset as usize;
    let preamble = bytes
        .get(base..base + DEBUG_PREAMBLE_LEN)
        .ok_or_else(|| LoadError::UnexpectedEof { context: "debug preamble".to_string() })?;
    let file_count = u32::from_le_bytes(preamble[0..4].try_into().unwrap()) as usize;
    let line_count = u32::from_le_bytes(preamble[4..8].try_into().unwrap()) as usize;
    let sym_count = u32::from_le_bytes(preamble[8..12].try_into().unwrap()) as usize;

    let mut at = base + DEBUG_PREAMBLE_LEN;
    let mut files = Vec::with_capacity(file_count);
    for _ in 0..file_count {
        files.push(DebugFileRow::decode(bytes, at)?);
        at += DebugFileRow::WIDTH;
    }
    let mut lines = Vec::with_capacity(line_count);
    for _ in 0..line_count {
        lines.push(DebugLineRow::decode(bytes, at)?);
        at += DebugLineRow::WIDTH;
    }
    let mut syms = Vec::with_capacity(sym_count);
    for _ in 0..sym_count {
        syms.push(DebugSymRow::decode(bytes, at)?);
        at += DebugSymRow::WIDTH;
    }

    Ok(DebugInfo { files, lines, syms })
}

/// Invariant I2: function code ranges don't overlap (guest functions only;
/// import placeholders carry no code).
fn check_function_code_ranges(functions: &[FunctionRow]) -> LoadResult<()> {
    let mut ranges: Vec<(u32, u32, u32)> = functions
        .iter()
        .enumerate()
        .filter(|(_, f)| !f.is_import())
        .map(|(i, f)| (f.code_offset, f.code_offset + f.code_size, i as u32))
        .collect();
    ranges.sort_by_key(|r| r.0);
    for window in ranges.windows(2) {
        let (a, b) = (window[0], window[1]);
        if a.1 > b.0 {
            return Err(LoadError::OverlappingFunctionCode { a: a.2, b: b.2 });
        }
    }
    Ok(())
}

/// Invariant I3: every opcode in a function's code range is followed by
/// exactly the operand bytes its descriptor mandates, and the run of
/// instructions ends exactly on the function's last byte.
fn check_opcode_scan(functions: &[FunctionRow], code: &[u8]) -> LoadResult<()> {
    for (index, function) in functions.iter().enumerate() {
        if function.is_import() {
            continue;
        }
        let start = function.code_offset;
        let end = function.code_offset + function.code_size;
        let Some(body) = code.get(start as usize..end as usize) else {
            return Err(LoadError::DanglingFunctionCode { index: index as u32, offset: start });
        };
        let mut pc = 0u32;
        while pc < body.len() as u32 {
            match decode_at(body, pc) {
                Ok(decoded) => pc += decoded.len,
                Err(DecodeError::UnknownOpcode(byte)) => {
                    return Err(LoadError::UnknownOpcode { function: index as u32, pc, byte })
                }
                Err(DecodeError::Truncated) => {
                    return Err(LoadError::TruncatedInstruction { function: index as u32, pc })
                }
            }
        }
        if pc != body.len() as u32 {
            return Err(LoadError::TruncatedInstruction { function: index as u32, pc });
        }
    }
    Ok(())
}

fn check_entry_method(header: &Header, functions: &[FunctionRow]) -> LoadResult<()> {
    if header.entry_method_id == SENTINEL_U32 {
        return Ok(());
    }
    let matches = functions
        .iter()
        .filter(|f| f.method_id == header.entry_method_id)
        .count();
    if matches != 1 {
        return Err(LoadError::BadEntryMethod { id: header.entry_method_id });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_header(section_count: u32, section_table_offset: u32) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&MAGIC.to_le_bytes());
        buf[4..6].copy_from_slice(&crate::sbc::SUPPORTED_VERSION.to_le_bytes());
        buf[6] = ENDIAN_LITTLE;
        buf[7] = 0;
        buf[8..12].copy_from_slice(&section_count.to_le_bytes());
        buf[12..16].copy_from_slice(&section_table_offset.to_le_bytes());
        buf[16..20].copy_from_slice(&SENTINEL_U32.to_le_bytes());
        buf
    }

    #[test]
    fn rejects_bad_magic() {
        let mut buf = minimal_header(0, HEADER_LEN as u32);
        buf[0] = 0;
        assert!(matches!(load(&buf), Err(LoadError::BadMagic { .. })));
    }

    #[test]
    fn loads_empty_module_with_no_sections() {
        let buf = minimal_header(0, HEADER_LEN as u32);
        let module = load(&buf).unwrap();
        assert!(module.types.is_empty());
        assert!(module.functions.is_empty());
    }

    #[test]
    fn rejects_unknown_section_id() {
        let mut buf = minimal_header(1, HEADER_LEN as u32);
        let mut entry = vec![0u8; SECTION_ENTRY_LEN];
        entry[0..4].copy_from_slice(&999u32.to_le_bytes());
        buf.extend_from_slice(&entry);
        assert!(matches!(load(&buf), Err(LoadError::UnknownSection { id: 999 })));
    }

    #[test]
    fn rejects_misaligned_section_offset() {
        let mut buf = minimal_header(1, HEADER_LEN as u32);
        let mut entry = vec![0u8; SECTION_ENTRY_LEN];
        entry[0..4].copy_from_slice(&(SectionId::Types as u32).to_le_bytes());
        entry[4..8].copy_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&entry);
        assert!(matches!(load(&buf), Err(LoadError::MisalignedSection { .. })));
    }
}
