//! SIR → SBC assembler (§4.9, §4.8).
//!
//! Three stages: [`parse`] turns source text into a line-oriented AST,
//! [`lower`] resolves every name (types, sigs, globals, functions, fields,
//! labels) against maps built from that AST and emits row tables plus code,
//! and a final serialization step lays the sections out exactly the way
//! [`crate::loader::load`] expects to read them back.
//!
//! Per function, label resolution is two passes in spirit though one scan in
//! code: the scan that discovers label program counters also resolves each
//! instruction's mnemonic once, so the emission pass never needs to look a
//! mnemonic up a second time.

use std::collections::HashMap;

use crate::const_pool::{encode_const_pool, ConstEntry};
use crate::consts::SENTINEL_U32;
use crate::error::AssembleError;
use crate::instruction::encode_into;
use crate::intrinsics;
use crate::opcode::OpCode;
use crate::sbc::rows::{
    DebugFileRow, DebugLineRow, DebugSymRow, ExportRow, FieldRow, FunctionRow, GlobalRow,
    ImportRow, MethodRow, SigRow, TypeRow,
};
use crate::sbc::{SectionId, ENDIAN_LITTLE, MAGIC, SUPPORTED_VERSION};
use crate::value::{TYPE_ID_F32, TYPE_ID_F64, TYPE_ID_I32, TYPE_ID_I64, TYPE_ID_REF_BASE};

const HEADER_LEN: usize = 32;
const SECTION_ENTRY_LEN: usize = 16;
const SECTION_COUNT: usize = 11;
const ALIGN: u32 = crate::consts::ALIGN as u32;

/// Assemble SIR source text into a fully formed SBC byte buffer.
pub fn assemble(source: &str) -> Result<Vec<u8>, AssembleError> {
    lower(parse(source)?)
}

// ---------------------------------------------------------------- parsing

struct ParsedType {
    name: String,
    size: u32,
    fields: Vec<(String, String, u32)>,
    line: u32,
}

struct ParsedSig {
    name: String,
    ret: Option<String>,
    params: Vec<String>,
}

struct ParsedGlobal {
    name: String,
    ty: String,
    init: Option<String>,
    line: u32,
}

struct ParsedImport {
    module: String,
    symbol: String,
    sig: String,
    line: u32,
}

enum ParsedLine {
    Label(String),
    Insn { mnemonic: String, operands: Vec<String>, line: u32 },
}

struct ParsedFunc {
    name: String,
    locals: u32,
    sig: String,
    body: Vec<ParsedLine>,
}

struct Parsed {
    types: Vec<ParsedType>,
    sigs: Vec<ParsedSig>,
    globals: Vec<ParsedGlobal>,
    imports: Vec<ParsedImport>,
    funcs: Vec<ParsedFunc>,
    entry: Option<String>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    Types,
    Sigs,
    Globals,
}

fn strip_comment(line: &str) -> &str {
    let mut in_quotes = false;
    for (i, c) in line.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            '#' if !in_quotes => return &line[..i],
            _ => {}
        }
    }
    line
}

fn tokenize_operands(rest: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut buf = String::new();
    let mut chars = rest.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            if !buf.is_empty() {
                out.push(std::mem::take(&mut buf));
            }
            continue;
        }
        if c == '"' {
            chars.next();
            buf.push('"');
            for c2 in chars.by_ref() {
                buf.push(c2);
                if c2 == '"' {
                    break;
                }
            }
            out.push(std::mem::take(&mut buf));
            continue;
        }
        buf.push(c);
        chars.next();
    }
    if !buf.is_empty() {
        out.push(buf);
    }
    out
}

fn split_name_and_kv(line: &str) -> (&str, Vec<&str>) {
    let mut it = line.split_whitespace();
    let name = it.next().unwrap_or("");
    (name, it.collect())
}

fn kv_get<'a>(kvs: &[&'a str], key: &str) -> Option<&'a str> {
    kvs.iter().find_map(|tok| {
        let (k, v) = tok.split_once('=')?;
        (k == key).then_some(v)
    })
}

fn syntax(line: u32, message: impl Into<String>) -> AssembleError {
    AssembleError::Syntax { line, message: message.into() }
}

fn parse_u32(tok: &str, line: u32) -> Result<u32, AssembleError> {
    tok.parse()
        .map_err(|_| AssembleError::InvalidLiteral { line, what: "u32", text: tok.to_string() })
}

fn parse_type_line(line_text: &str, line: u32) -> Result<ParsedType, AssembleError> {
    let (name, kvs) = split_name_and_kv(line_text);
    if name.is_empty() {
        return Err(syntax(line, "expected a type name"));
    }
    let size = kv_get(&kvs, "size")
        .ok_or_else(|| syntax(line, "type declaration missing size="))
        .and_then(|s| parse_u32(s, line))?;
    let mut fields = Vec::new();
    if let Some(spec) = kv_get(&kvs, "fields") {
        if !spec.is_empty() {
            for field in spec.split(',') {
                let (namety, offset) = field
                    .split_once('@')
                    .ok_or_else(|| syntax(line, format!("field {field:?} missing @offset")))?;
                let (fname, ftype) = namety
                    .split_once(':')
                    .ok_or_else(|| syntax(line, format!("field {field:?} missing :type")))?;
                let offset = parse_u32(offset, line)?;
                fields.push((fname.to_string(), ftype.to_string(), offset));
            }
        }
    }
    Ok(ParsedType { name: name.to_string(), size, fields, line })
}

fn parse_sig_line(line_text: &str, line: u32) -> Result<ParsedSig, AssembleError> {
    let (name, kvs) = split_name_and_kv(line_text);
    if name.is_empty() {
        return Err(syntax(line, "expected a sig name"));
    }
    let ret = kv_get(&kvs, "ret").map(|s| s.to_string());
    let params = kv_get(&kvs, "params")
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    Ok(ParsedSig { name: name.to_string(), ret, params })
}

fn parse_global_line(line_text: &str, line: u32) -> Result<ParsedGlobal, AssembleError> {
    let (name, kvs) = split_name_and_kv(line_text);
    if name.is_empty() {
        return Err(syntax(line, "expected a global name"));
    }
    let ty = kv_get(&kvs, "type")
        .ok_or_else(|| syntax(line, "global declaration missing type="))?
        .to_string();
    let init = kv_get(&kvs, "init").map(|s| s.to_string());
    Ok(ParsedGlobal { name: name.to_string(), ty, init, line })
}

fn parse_import_line(rest: &str, line: u32) -> Result<ParsedImport, AssembleError> {
    let mut it = rest.split_whitespace();
    let module = it.next().ok_or_else(|| syntax(line, "import missing module name"))?;
    let symbol = it.next().ok_or_else(|| syntax(line, "import missing symbol name"))?;
    let kvs: Vec<&str> = it.collect();
    let sig = kv_get(&kvs, "sig")
        .ok_or_else(|| syntax(line, "import missing sig="))?
        .to_string();
    Ok(ParsedImport { module: module.to_string(), symbol: symbol.to_string(), sig, line })
}

fn parse_func_header(rest: &str, line: u32) -> Result<(String, u32, String), AssembleError> {
    let (name, kvs) = split_name_and_kv(rest);
    if name.is_empty() {
        return Err(syntax(line, "expected a function name"));
    }
    let locals = kv_get(&kvs, "locals")
        .ok_or_else(|| syntax(line, "func declaration missing locals="))
        .and_then(|s| parse_u32(s, line))?;
    let sig = kv_get(&kvs, "sig")
        .ok_or_else(|| syntax(line, "func declaration missing sig="))?
        .to_string();
    Ok((name.to_string(), locals, sig))
}

fn parse(source: &str) -> Result<Parsed, AssembleError> {
    let mut types = Vec::new();
    let mut sigs = Vec::new();
    let mut globals = Vec::new();
    let mut imports = Vec::new();
    let mut funcs = Vec::new();
    let mut entry = None;

    let mut section: Option<Section> = None;
    let mut current_func: Option<ParsedFunc> = None;

    for (i, raw_line) in source.lines().enumerate() {
        let line = (i + 1) as u32;
        let stripped = strip_comment(raw_line);
        let trimmed = stripped.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(func) = current_func.as_mut() {
            if trimmed == "end" {
                funcs.push(current_func.take().unwrap());
                continue;
            }
            if let Some(label) = trimmed.strip_suffix(':') {
                if label.is_empty() || label.contains(char::is_whitespace) {
                    return Err(syntax(line, format!("invalid label {trimmed:?}")));
                }
                func.body.push(ParsedLine::Label(label.to_string()));
                continue;
            }
            let mut parts = trimmed.splitn(2, char::is_whitespace);
            let mnemonic = parts.next().unwrap_or("").to_string();
            let operands = tokenize_operands(parts.next().unwrap_or("").trim());
            func.body.push(ParsedLine::Insn { mnemonic, operands, line });
            continue;
        }

        let (kw, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((k, r)) => (k, r.trim()),
            None => (trimmed, ""),
        };
        match kw {
            "types:" => section = Some(Section::Types),
            "sigs:" => section = Some(Section::Sigs),
            "globals:" => section = Some(Section::Globals),
            "import" => {
                imports.push(parse_import_line(rest, line)?);
                section = None;
            }
            "func" => {
                let (name, locals, sig) = parse_func_header(rest, line)?;
                current_func = Some(ParsedFunc { name, locals, sig, body: Vec::new() });
                section = None;
            }
            "entry" => {
                if rest.is_empty() {
                    return Err(syntax(line, "entry missing a function name"));
                }
                entry = Some(rest.to_string());
                section = None;
            }
            _ => match section {
                Some(Section::Types) => types.push(parse_type_line(trimmed, line)?),
                Some(Section::Sigs) => sigs.push(parse_sig_line(trimmed, line)?),
                Some(Section::Globals) => globals.push(parse_global_line(trimmed, line)?),
                None => return Err(syntax(line, format!("unexpected line {trimmed:?}"))),
            },
        }
    }

    if let Some(func) = current_func {
        return Err(AssembleError::UnterminatedFunction { name: func.name });
    }

    Ok(Parsed { types, sigs, globals, imports, funcs, entry })
}

// --------------------------------------------------------------- lowering

fn resolve_type_keyword(kw: &str, types: &HashMap<String, u32>) -> Option<u32> {
    Some(match kw {
        "i32" => TYPE_ID_I32,
        "i64" => TYPE_ID_I64,
        "f32" => TYPE_ID_F32,
        "f64" => TYPE_ID_F64,
        "ref" => TYPE_ID_REF_BASE,
        other => *types.get(other)?,
    })
}

struct LowerCtx {
    type_map: HashMap<String, u32>,
    sig_map: HashMap<String, u32>,
    global_map: HashMap<String, u32>,
    field_map: HashMap<String, u32>,
    func_map: HashMap<String, u32>,
    consts: Vec<ConstEntry>,
}

impl LowerCtx {
    fn intern_const(&mut self, entry: ConstEntry) -> u32 {
        if let Some(i) = self.consts.iter().position(|e| *e == entry) {
            return i as u32;
        }
        self.consts.push(entry);
        (self.consts.len() - 1) as u32
    }

    fn resolve_func(&self, name: &str, line: u32) -> Result<u32, AssembleError> {
        self.func_map
            .get(name)
            .copied()
            .ok_or_else(|| AssembleError::UndefinedReference { line, kind: "function", name: name.to_string() })
    }

    fn resolve_sig(&self, name: &str, line: u32) -> Result<u32, AssembleError> {
        self.sig_map
            .get(name)
            .copied()
            .ok_or_else(|| AssembleError::UndefinedReference { line, kind: "sig", name: name.to_string() })
    }

    fn resolve_global(&self, tok: &str, line: u32) -> Result<u32, AssembleError> {
        if let Some(i) = self.global_map.get(tok) {
            return Ok(*i);
        }
        tok.parse::<u32>()
            .map_err(|_| AssembleError::UndefinedReference { line, kind: "global", name: tok.to_string() })
    }

    fn resolve_type_name(&self, tok: &str, line: u32) -> Result<u32, AssembleError> {
        self.type_map
            .get(tok)
            .copied()
            .ok_or_else(|| AssembleError::UndefinedReference { line, kind: "type", name: tok.to_string() })
    }

    fn resolve_field(&self, tok: &str, line: u32) -> Result<u32, AssembleError> {
        self.field_map
            .get(tok)
            .copied()
            .ok_or_else(|| AssembleError::UndefinedReference { line, kind: "field", name: tok.to_string() })
    }
}

fn parse_i32(tok: &str, line: u32) -> Result<i32, AssembleError> {
    tok.parse().map_err(|_| AssembleError::InvalidLiteral { line, what: "i32", text: tok.to_string() })
}

fn parse_i64(tok: &str, line: u32) -> Result<i64, AssembleError> {
    tok.parse().map_err(|_| AssembleError::InvalidLiteral { line, what: "i64", text: tok.to_string() })
}

fn parse_f32(tok: &str, line: u32) -> Result<f32, AssembleError> {
    tok.parse().map_err(|_| AssembleError::InvalidLiteral { line, what: "f32", text: tok.to_string() })
}

fn parse_f64(tok: &str, line: u32) -> Result<f64, AssembleError> {
    tok.parse().map_err(|_| AssembleError::InvalidLiteral { line, what: "f64", text: tok.to_string() })
}

fn parse_quoted(tok: &str, line: u32) -> Result<String, AssembleError> {
    if tok.len() >= 2 && tok.starts_with('"') && tok.ends_with('"') {
        Ok(tok[1..tok.len() - 1].to_string())
    } else {
        Err(AssembleError::InvalidLiteral { line, what: "quoted string", text: tok.to_string() })
    }
}

fn parse_elem_tag(tok: &str, line: u32) -> Result<u8, AssembleError> {
    use crate::heap::ElemWidth;
    let width = match tok {
        "i32" => ElemWidth::I32,
        "i64" => ElemWidth::I64,
        "f32" => ElemWidth::F32,
        "f64" => ElemWidth::F64,
        "ref" => ElemWidth::Ref,
        _ => return Err(AssembleError::InvalidLiteral { line, what: "element kind", text: tok.to_string() }),
    };
    Ok(width.to_tag())
}

fn parse_global_init(ty: &str, lit: &str, line: u32) -> Result<ConstEntry, AssembleError> {
    match ty {
        "i32" | "i64" => Ok(ConstEntry::I128(parse_i64(lit, line)? as i128)),
        "f32" => Ok(ConstEntry::F32(parse_f32(lit, line)?)),
        "f64" => Ok(ConstEntry::F64(parse_f64(lit, line)?)),
        _ => Err(AssembleError::InvalidLiteral { line, what: "global init", text: lit.to_string() }),
    }
}

struct ResolvedInsn<'a> {
    op: OpCode,
    tokens: &'a [String],
    line: u32,
    pc: u32,
}

fn assemble_function(
    func: &ParsedFunc,
    ctx: &mut LowerCtx,
    func_index: u32,
) -> Result<(Vec<u8>, Vec<DebugLineRow>), AssembleError> {
    let mut labels: HashMap<String, u32> = HashMap::new();
    let mut resolved = Vec::new();
    let mut pc = 1 + OpCode::Enter.operand_bytes() as u32;
    for item in &func.body {
        match item {
            ParsedLine::Label(name) => {
                labels.insert(name.clone(), pc);
            }
            ParsedLine::Insn { mnemonic, operands, line } => {
                if mnemonic == "enter" {
                    return Err(syntax(*line, "enter is synthesized from locals=N, do not write it"));
                }
                let op = OpCode::from_mnemonic(mnemonic)
                    .ok_or_else(|| AssembleError::UnknownMnemonic { line: *line, mnemonic: mnemonic.clone() })?;
                resolved.push(ResolvedInsn { op, tokens: operands, line: *line, pc });
                pc += 1 + op.operand_bytes() as u32;
            }
        }
    }

    let mut code = Vec::new();
    encode_into(&mut code, OpCode::Enter, &func.locals.to_le_bytes());
    let mut debug_lines = Vec::with_capacity(resolved.len());
    for insn in &resolved {
        let operand_bytes = encode_operands(insn.op, insn.tokens, insn.line, &labels, insn.pc, ctx)?;
        debug_lines.push(DebugLineRow { func_index, pc: insn.pc, file_id: 0, line: insn.line, column: 0 });
        encode_into(&mut code, insn.op, &operand_bytes);
    }
    Ok((code, debug_lines))
}

fn encode_operands(
    op: OpCode,
    tokens: &[String],
    line: u32,
    labels: &HashMap<String, u32>,
    cur_pc: u32,
    ctx: &mut LowerCtx,
) -> Result<Vec<u8>, AssembleError> {
    use OpCode::*;

    let expect = |n: usize| -> Result<(), AssembleError> {
        if tokens.len() == n {
            Ok(())
        } else {
            Err(AssembleError::WrongOperandCount {
                line,
                mnemonic: op.mnemonic().to_string(),
                expected: n,
                found: tokens.len(),
            })
        }
    };
    let resolve_label = |name: &str| -> Result<u32, AssembleError> {
        labels
            .get(name)
            .copied()
            .ok_or_else(|| AssembleError::UndefinedReference { line, kind: "label", name: name.to_string() })
    };
    let next_pc = cur_pc + 1 + op.operand_bytes() as u32;

    Ok(match op {
        Jmp | JmpTrue | JmpFalse => {
            expect(1)?;
            let target = resolve_label(&tokens[0])?;
            let rel = target as i64 - next_pc as i64;
            (rel as i32).to_le_bytes().to_vec()
        }
        JmpTable => {
            expect(2)?;
            let default_tok = tokens[1]
                .strip_prefix("default=")
                .ok_or_else(|| syntax(line, "jmp.table expects default=LABEL"))?;
            let mut rels = Vec::new();
            for name in tokens[0].split(',') {
                let target = resolve_label(name)?;
                rels.push((target as i64 - next_pc as i64) as i32);
            }
            let default_target = resolve_label(default_tok)?;
            let default_rel = (default_target as i64 - next_pc as i64) as i32;
            let const_idx = ctx.intern_const(ConstEntry::JumpTable(rels));
            let mut bytes = const_idx.to_le_bytes().to_vec();
            bytes.extend_from_slice(&default_rel.to_le_bytes());
            bytes
        }
        ConstI32 => {
            expect(1)?;
            parse_i32(&tokens[0], line)?.to_le_bytes().to_vec()
        }
        ConstI64 => {
            expect(1)?;
            parse_i64(&tokens[0], line)?.to_le_bytes().to_vec()
        }
        ConstF32 => {
            expect(1)?;
            parse_f32(&tokens[0], line)?.to_bits().to_le_bytes().to_vec()
        }
        ConstF64 => {
            expect(1)?;
            parse_f64(&tokens[0], line)?.to_bits().to_le_bytes().to_vec()
        }
        ConstString => {
            expect(1)?;
            let s = parse_quoted(&tokens[0], line)?;
            ctx.intern_const(ConstEntry::String(s)).to_le_bytes().to_vec()
        }
        LoadLocal | StoreLocal | LoadUpvalue | StoreUpvalue => {
            expect(1)?;
            parse_u32(&tokens[0], line)?.to_le_bytes().to_vec()
        }
        LoadGlobal | StoreGlobal => {
            expect(1)?;
            ctx.resolve_global(&tokens[0], line)?.to_le_bytes().to_vec()
        }
        NewObject => {
            expect(1)?;
            ctx.resolve_type_name(&tokens[0], line)?.to_le_bytes().to_vec()
        }
        LoadField | StoreField => {
            expect(1)?;
            ctx.resolve_field(&tokens[0], line)?.to_le_bytes().to_vec()
        }
        NewArray | NewList => {
            expect(1)?;
            vec![parse_elem_tag(&tokens[0], line)?]
        }
        NewClosure => {
            expect(2)?;
            let method = ctx.resolve_func(&tokens[0], line)?;
            let upvalues = parse_u32(&tokens[1], line)?;
            let mut bytes = method.to_le_bytes().to_vec();
            bytes.extend_from_slice(&upvalues.to_le_bytes());
            bytes
        }
        Call | TailCall => {
            expect(2)?;
            let target = ctx.resolve_func(&tokens[0], line)?;
            let arity = parse_u32(&tokens[1], line)?;
            let mut bytes = target.to_le_bytes().to_vec();
            bytes.extend_from_slice(&arity.to_le_bytes());
            bytes
        }
        CallIndirect => {
            expect(2)?;
            let sig = ctx.resolve_sig(&tokens[0], line)?;
            let arity = parse_u32(&tokens[1], line)?;
            let mut bytes = sig.to_le_bytes().to_vec();
            bytes.extend_from_slice(&arity.to_le_bytes());
            bytes
        }
        Intrinsic => {
            expect(1)?;
            let id = intrinsics::id_from_name(&tokens[0])
                .or_else(|| tokens[0].parse::<u32>().ok())
                .ok_or_else(|| AssembleError::UndefinedReference {
                    line,
                    kind: "intrinsic",
                    name: tokens[0].clone(),
                })?;
            id.to_le_bytes().to_vec()
        }
        SysCall => {
            expect(1)?;
            parse_u32(&tokens[0], line)?.to_le_bytes().to_vec()
        }
        Line => {
            expect(3)?;
            let file = parse_quoted(&tokens[0], line)?;
            let file_const = ctx.intern_const(ConstEntry::String(file));
            let ln = parse_u32(&tokens[1], line)?;
            let col = parse_u32(&tokens[2], line)?;
            let mut bytes = file_const.to_le_bytes().to_vec();
            bytes.extend_from_slice(&ln.to_le_bytes());
            bytes.extend_from_slice(&col.to_le_bytes());
            bytes
        }
        _ => {
            expect(0)?;
            Vec::new()
        }
    })
}

fn lower(parsed: Parsed) -> Result<Vec<u8>, AssembleError> {
    let mut ctx = LowerCtx {
        type_map: HashMap::new(),
        sig_map: HashMap::new(),
        global_map: HashMap::new(),
        field_map: HashMap::new(),
        func_map: HashMap::new(),
        consts: Vec::new(),
    };

    for (i, t) in parsed.types.iter().enumerate() {
        ctx.type_map.insert(t.name.clone(), TYPE_ID_REF_BASE + i as u32);
    }
    let mut type_rows = Vec::with_capacity(parsed.types.len());
    let mut field_rows = Vec::new();
    for t in &parsed.types {
        let field_start = field_rows.len() as u32;
        for (fname, ftype, foffset) in &t.fields {
            let type_id = resolve_type_keyword(ftype, &ctx.type_map)
                .ok_or_else(|| AssembleError::UndefinedReference { line: t.line, kind: "type", name: ftype.clone() })?;
            ctx.field_map.insert(format!("{}.{}", t.name, fname), field_rows.len() as u32);
            field_rows.push(FieldRow { offset: *foffset, type_id, flags: 0 });
        }
        type_rows.push(TypeRow {
            size: t.size,
            field_start,
            field_count: t.fields.len() as u32,
            flags: 0,
        });
    }

    for (i, s) in parsed.sigs.iter().enumerate() {
        ctx.sig_map.insert(s.name.clone(), i as u32);
    }
    let mut sig_rows = Vec::with_capacity(parsed.sigs.len());
    let mut param_types = Vec::new();
    for s in &parsed.sigs {
        let ret_type_id = match s.ret.as_deref() {
            None | Some("void") => SENTINEL_U32,
            Some(t) => resolve_type_keyword(t, &ctx.type_map)
                .ok_or_else(|| AssembleError::UndefinedReference { line: 0, kind: "type", name: t.to_string() })?,
        };
        for p in &s.params {
            let id = resolve_type_keyword(p, &ctx.type_map)
                .ok_or_else(|| AssembleError::UndefinedReference { line: 0, kind: "type", name: p.clone() })?;
            param_types.push(id);
        }
        sig_rows.push(SigRow { ret_type_id, param_count: s.params.len() as u32, call_conv: 0 });
    }

    for (i, g) in parsed.globals.iter().enumerate() {
        ctx.global_map.insert(g.name.clone(), i as u32);
    }
    let mut global_rows = Vec::with_capacity(parsed.globals.len());
    for g in &parsed.globals {
        let type_id = resolve_type_keyword(&g.ty, &ctx.type_map)
            .ok_or_else(|| AssembleError::UndefinedReference { line: g.line, kind: "type", name: g.ty.clone() })?;
        let init_const = match g.init.as_deref() {
            None | Some("zero") => SENTINEL_U32,
            Some(lit) => ctx.intern_const(parse_global_init(&g.ty, lit, g.line)?),
        };
        global_rows.push(GlobalRow { type_id, flags: 0, init_const });
    }

    for (i, f) in parsed.funcs.iter().enumerate() {
        ctx.func_map.insert(f.name.clone(), i as u32);
    }
    let base = parsed.funcs.len() as u32;
    let mut import_rows = Vec::with_capacity(parsed.imports.len());
    for (i, imp) in parsed.imports.iter().enumerate() {
        let index = base + i as u32;
        ctx.func_map.entry(imp.symbol.clone()).or_insert(index);
        ctx.func_map.insert(format!("{}.{}", imp.module, imp.symbol), index);
        let sig_id = ctx.resolve_sig(&imp.sig, imp.line)?;
        let module_name_const = ctx.intern_const(ConstEntry::String(imp.module.clone()));
        let symbol_name_const = ctx.intern_const(ConstEntry::String(imp.symbol.clone()));
        import_rows.push(ImportRow { module_name_const, symbol_name_const, sig_id, flags: 0 });
    }

    let mut methods = Vec::with_capacity(parsed.funcs.len());
    let mut functions = Vec::with_capacity(parsed.funcs.len());
    let mut exports = Vec::with_capacity(parsed.funcs.len());
    let mut syms = Vec::with_capacity(parsed.funcs.len());
    let mut code = Vec::new();
    let mut lines = Vec::new();

    for (i, f) in parsed.funcs.iter().enumerate() {
        let func_index = i as u32;
        let sig_id = ctx.resolve_sig(&f.sig, 0)?;
        let name_const = ctx.intern_const(ConstEntry::String(f.name.clone()));
        let (body, mut body_lines) = assemble_function(f, &mut ctx, func_index)?;
        let code_offset = code.len() as u32;
        let code_size = body.len() as u32;
        code.extend_from_slice(&body);
        lines.append(&mut body_lines);

        methods.push(MethodRow { name_const, sig_id, local_count: f.locals, flags: 0 });
        functions.push(FunctionRow { method_id: func_index, code_offset, code_size, stack_max: 0 });
        exports.push(ExportRow { name_const, method_id: func_index, flags: 0 });
        syms.push(DebugSymRow { method_id: func_index, name_const, flags: 0 });
    }

    let entry_name = parsed.entry.ok_or(AssembleError::MissingEntry)?;
    let entry_method_id = ctx.resolve_func(&entry_name, 0)?;

    let file_const = ctx.intern_const(ConstEntry::String("<sir>".to_string()));
    let files = vec![DebugFileRow { name_const: file_const }];

    Ok(build_module_bytes(
        entry_method_id,
        &type_rows,
        &field_rows,
        &methods,
        &sig_rows,
        &param_types,
        &ctx.consts,
        &global_rows,
        &functions,
        &code,
        &files,
        &lines,
        &syms,
        &import_rows,
        &exports,
    ))
}

// ----------------------------------------------------------- serialization

fn push_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn encode_type_row(buf: &mut Vec<u8>, r: &TypeRow) {
    push_u32(buf, r.size);
    push_u32(buf, r.field_start);
    push_u32(buf, r.field_count);
    push_u32(buf, r.flags);
    push_u32(buf, 0);
}

fn encode_field_row(buf: &mut Vec<u8>, r: &FieldRow) {
    push_u32(buf, r.offset);
    push_u32(buf, r.type_id);
    push_u32(buf, r.flags);
    push_u32(buf, 0);
}

fn encode_method_row(buf: &mut Vec<u8>, r: &MethodRow) {
    push_u32(buf, r.name_const);
    push_u32(buf, r.sig_id);
    push_u32(buf, r.local_count);
    push_u32(buf, r.flags);
}

fn encode_sig_row(buf: &mut Vec<u8>, r: &SigRow) {
    push_u32(buf, r.ret_type_id);
    push_u32(buf, r.param_count);
    push_u32(buf, r.call_conv);
}

fn encode_global_row(buf: &mut Vec<u8>, r: &GlobalRow) {
    push_u32(buf, r.type_id);
    push_u32(buf, r.flags);
    push_u32(buf, r.init_const);
    push_u32(buf, 0);
}

fn encode_function_row(buf: &mut Vec<u8>, r: &FunctionRow) {
    push_u32(buf, r.method_id);
    push_u32(buf, r.code_offset);
    push_u32(buf, r.code_size);
    push_u32(buf, r.stack_max);
}

fn encode_import_row(buf: &mut Vec<u8>, r: &ImportRow) {
    push_u32(buf, r.module_name_const);
    push_u32(buf, r.symbol_name_const);
    push_u32(buf, r.sig_id);
    push_u32(buf, r.flags);
}

fn encode_export_row(buf: &mut Vec<u8>, r: &ExportRow) {
    push_u32(buf, r.name_const);
    push_u32(buf, r.method_id);
    push_u32(buf, r.flags);
    push_u32(buf, 0);
}

fn encode_debug_file_row(buf: &mut Vec<u8>, r: &DebugFileRow) {
    push_u32(buf, r.name_const);
    push_u32(buf, 0);
}

fn encode_debug_line_row(buf: &mut Vec<u8>, r: &DebugLineRow) {
    push_u32(buf, r.func_index);
    push_u32(buf, r.pc);
    push_u32(buf, r.file_id);
    push_u32(buf, r.line);
    push_u32(buf, r.column);
}

fn encode_debug_sym_row(buf: &mut Vec<u8>, r: &DebugSymRow) {
    push_u32(buf, r.method_id);
    push_u32(buf, r.name_const);
    push_u32(buf, r.flags);
    push_u32(buf, 0);
}

fn encode_debug_section(files: &[DebugFileRow], lines: &[DebugLineRow], syms: &[DebugSymRow]) -> Vec<u8> {
    let mut out = Vec::new();
    push_u32(&mut out, files.len() as u32);
    push_u32(&mut out, lines.len() as u32);
    push_u32(&mut out, syms.len() as u32);
    push_u32(&mut out, 0);
    for f in files {
        encode_debug_file_row(&mut out, f);
    }
    for l in lines {
        encode_debug_line_row(&mut out, l);
    }
    for s in syms {
        encode_debug_sym_row(&mut out, s);
    }
    out
}

#[allow(clippy::too_many_arguments)]
fn build_module_bytes(
    entry_method_id: u32,
    types: &[TypeRow],
    fields: &[FieldRow],
    methods: &[MethodRow],
    sigs: &[SigRow],
    param_types: &[u32],
    consts: &[ConstEntry],
    globals: &[GlobalRow],
    functions: &[FunctionRow],
    code: &[u8],
    files: &[DebugFileRow],
    lines: &[DebugLineRow],
    syms: &[DebugSymRow],
    imports: &[ImportRow],
    exports: &[ExportRow],
) -> Vec<u8> {
    let mut types_bytes = Vec::new();
    for r in types {
        encode_type_row(&mut types_bytes, r);
    }
    let mut fields_bytes = Vec::new();
    for r in fields {
        encode_field_row(&mut fields_bytes, r);
    }
    let mut methods_bytes = Vec::new();
    for r in methods {
        encode_method_row(&mut methods_bytes, r);
    }
    let mut sigs_bytes = Vec::new();
    for r in sigs {
        encode_sig_row(&mut sigs_bytes, r);
    }
    for p in param_types {
        push_u32(&mut sigs_bytes, *p);
    }
    let const_pool_bytes = encode_const_pool(consts);
    let mut globals_bytes = Vec::new();
    for r in globals {
        encode_global_row(&mut globals_bytes, r);
    }
    let mut functions_bytes = Vec::new();
    for r in functions {
        encode_function_row(&mut functions_bytes, r);
    }
    let debug_bytes = encode_debug_section(files, lines, syms);
    let mut imports_bytes = Vec::new();
    for r in imports {
        encode_import_row(&mut imports_bytes, r);
    }
    let mut exports_bytes = Vec::new();
    for r in exports {
        encode_export_row(&mut exports_bytes, r);
    }

    let sections: [(SectionId, &[u8], u32); SECTION_COUNT] = [
        (SectionId::Types, &types_bytes, types.len() as u32),
        (SectionId::Fields, &fields_bytes, fields.len() as u32),
        (SectionId::Methods, &methods_bytes, methods.len() as u32),
        (SectionId::Sigs, &sigs_bytes, sigs.len() as u32),
        (SectionId::ConstPool, &const_pool_bytes, consts.len() as u32),
        (SectionId::Globals, &globals_bytes, globals.len() as u32),
        (SectionId::Functions, &functions_bytes, functions.len() as u32),
        (SectionId::Code, code, functions.len() as u32),
        (SectionId::Debug, &debug_bytes, 0),
        (SectionId::Imports, &imports_bytes, imports.len() as u32),
        (SectionId::Exports, &exports_bytes, exports.len() as u32),
    ];

    let dir_region = HEADER_LEN + SECTION_COUNT * SECTION_ENTRY_LEN;
    let mut out = vec![0u8; dir_region];
    let mut dir = Vec::with_capacity(SECTION_COUNT);
    for (id, bytes, count) in sections {
        while out.len() % ALIGN as usize != 0 {
            out.push(0);
        }
        let offset = out.len() as u32;
        dir.push((id as u32, offset, bytes.len() as u32, count));
        out.extend_from_slice(bytes);
    }

    out[0..4].copy_from_slice(&MAGIC.to_le_bytes());
    out[4..6].copy_from_slice(&SUPPORTED_VERSION.to_le_bytes());
    out[6] = ENDIAN_LITTLE;
    out[7] = 0;
    out[8..12].copy_from_slice(&(SECTION_COUNT as u32).to_le_bytes());
    out[12..16].copy_from_slice(&(HEADER_LEN as u32).to_le_bytes());
    out[16..20].copy_from_slice(&entry_method_id.to_le_bytes());
    for (i, (id, offset, size, count)) in dir.iter().enumerate() {
        let at = HEADER_LEN + i * SECTION_ENTRY_LEN;
        out[at..at + 4].copy_from_slice(&id.to_le_bytes());
        out[at + 4..at + 8].copy_from_slice(&offset.to_le_bytes());
        out[at + 8..at + 12].copy_from_slice(&size.to_le_bytes());
        out[at + 12..at + 16].copy_from_slice(&count.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::load;

    #[test]
    fn assembles_and_loads_integer_sum() {
        let src = r#"
            sigs:
              main ret=i32 params=

            func main locals=0 sig=main
              const.i32 2
              const.i32 3
              add.i32
              ret
            end

            entry main
        "#;
        let bytes = assemble(src).unwrap();
        let module = load(&bytes).unwrap();
        assert_eq!(module.functions.len(), 1);
        assert_eq!(module.header.entry_method_id, 0);
    }

    #[test]
    fn assembles_divide_by_zero_body() {
        let src = r#"
            sigs:
              main ret=i32 params=

            func main locals=0 sig=main
              const.i32 1
              const.i32 0
              div.i32
              ret
            end

            entry main
        "#;
        let bytes = assemble(src).unwrap();
        let module = load(&bytes).unwrap();
        assert_eq!(module.const_pool.len(), 0);
        assert!(!module.code.is_empty());
    }

    #[test]
    fn jump_table_resolves_relative_offsets() {
        let src = r#"
            sigs:
              main ret=i32 params=

            func main locals=1 sig=main
              ldloc 0
              jmp.table a,b default=c
            a:
              const.i32 1
              ret
            b:
              const.i32 2
              ret
            c:
              const.i32 3
              ret
            end

            entry main
        "#;
        let bytes = assemble(src).unwrap();
        let module = load(&bytes).unwrap();
        assert_eq!(module.const_pool.len(), 1);
    }

    #[test]
    fn unknown_mnemonic_is_rejected() {
        let src = "func main locals=0 sig=main\n  bogus.op\nend\nentry main\n";
        assert!(matches!(assemble(src), Err(AssembleError::UnknownMnemonic { .. })));
    }

    #[test]
    fn missing_entry_is_rejected() {
        let src = "func main locals=0 sig=main\n  ret\nend\n";
        assert!(matches!(assemble(src), Err(AssembleError::MissingEntry)));
    }

    #[test]
    fn unterminated_function_is_rejected() {
        let src = "func main locals=0 sig=main\n  ret\n";
        assert!(matches!(assemble(src), Err(AssembleError::UnterminatedFunction { .. })));
    }

    #[test]
    fn const_string_is_interned_once() {
        let src = r#"
            sigs:
              main ret=void params=

            func main locals=0 sig=main
              const.string "hi"
              pop
              const.string "hi"
              pop
              ret
            end

            entry main
        "#;
        let bytes = assemble(src).unwrap();
        let module = load(&bytes).unwrap();
        assert_eq!(module.const_pool.len(), 1);
    }
}
