//! SBC → SIR disassembler (§4.9). The inverse of [`crate::sir::assembler`],
//! used by the round-trip testable property (§8): for every opcode the
//! assembler can emit, the disassembler must print a line the assembler can
//! read back to the same bytes.
//!
//! Labels aren't preserved across a round trip — jump targets are printed as
//! synthetic `L<pc>` labels computed from each jump's resolved absolute
//! target, so a second assemble pass reconstructs byte-identical code even
//! though the original label names are gone.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use crate::const_pool::ConstEntry;
use crate::instruction::decode_at;
use crate::intrinsics;
use crate::opcode::OpCode;
use crate::sbc::Module;

/// Render a `type_id` the way the assembler's grammar expects to read it
/// back: a primitive keyword for the four reserved lane ids, or the
/// synthetic `typeN` name this disassembler gives every `types` row.
fn type_keyword(type_id: u32) -> String {
    use crate::value::{TYPE_ID_F32, TYPE_ID_F64, TYPE_ID_I32, TYPE_ID_I64, TYPE_ID_REF_BASE};
    match type_id {
        TYPE_ID_I32 => "i32".to_string(),
        TYPE_ID_I64 => "i64".to_string(),
        TYPE_ID_F32 => "f32".to_string(),
        TYPE_ID_F64 => "f64".to_string(),
        id if id >= TYPE_ID_REF_BASE => format!("type{}", id - TYPE_ID_REF_BASE),
        id => format!("type{id}"),
    }
}

/// Render a `NewArray`/`NewList` element-kind tag byte back into the
/// assembler's grammar keyword.
fn elem_tag_keyword(tag: u8) -> &'static str {
    use crate::heap::ElemWidth;
    match ElemWidth::from_tag(tag) {
        Some(ElemWidth::I32) => "i32",
        Some(ElemWidth::I64) => "i64",
        Some(ElemWidth::F32) => "f32",
        Some(ElemWidth::F64) => "f64",
        Some(ElemWidth::Ref) => "ref",
        None => "<bad-elem-tag>",
    }
}

/// Disassemble a loaded module back into SIR source text.
pub fn disassemble(module: &Module) -> String {
    let mut out = String::new();

    if !module.types.is_empty() {
        out.push_str("types:\n");
        for (i, t) in module.types.iter().enumerate() {
            let fields: Vec<String> = module
                .type_fields(i as u32)
                .iter()
                .map(|f| format!("f{}:{}@{}", f.offset, type_keyword(f.type_id), f.offset))
                .collect();
            if fields.is_empty() {
                let _ = writeln!(out, "  type{i} size={}", t.size);
            } else {
                let _ = writeln!(out, "  type{i} size={} fields={}", t.size, fields.join(","));
            }
        }
        out.push('\n');
    }

    if !module.sigs.is_empty() {
        out.push_str("sigs:\n");
        for (i, s) in module.sigs.iter().enumerate() {
            let params: Vec<String> =
                module.sig_param_types(i as u32).iter().map(|t| type_keyword(*t)).collect();
            if s.has_return() {
                let _ = writeln!(
                    out,
                    "  sig{i} ret={} params={}",
                    type_keyword(s.ret_type_id),
                    params.join(",")
                );
            } else {
                let _ = writeln!(out, "  sig{i} ret=void params={}", params.join(","));
            }
        }
        out.push('\n');
    }

    if !module.globals.is_empty() {
        out.push_str("globals:\n");
        for (i, g) in module.globals.iter().enumerate() {
            let init = match module.const_pool.get(g.init_const) {
                Some(ConstEntry::I128(v)) => v.to_string(),
                Some(ConstEntry::F32(v)) => v.to_string(),
                Some(ConstEntry::F64(v)) => v.to_string(),
                _ => "zero".to_string(),
            };
            let _ = writeln!(out, "  global{i} type={} init={init}", type_keyword(g.type_id));
        }
        out.push('\n');
    }

    for import in &module.imports {
        let module_name = const_string(module, import.module_name_const);
        let symbol_name = const_string(module, import.symbol_name_const);
        let _ = writeln!(out, "import {module_name} {symbol_name} sig=sig{}", import.sig_id);
    }
    if !module.imports.is_empty() {
        out.push('\n');
    }

    for (func_index, function) in module.functions.iter().enumerate() {
        if function.is_import() {
            continue;
        }
        let func_index = func_index as u32;
        let method = module.method_of_function(func_index);
        let locals = method.map(|m| m.local_count).unwrap_or(0);
        let sig_id = method.map(|m| m.sig_id).unwrap_or(0);
        let name = func_ref_name(module, func_index);
        let _ = writeln!(out, "func {name} locals={locals} sig=sig{sig_id}");
        out.push_str(&disassemble_body(module, func_index));
        out.push_str("end\n\n");
    }

    if module.header.entry_method_id != crate::consts::SENTINEL_U32 {
        let _ = writeln!(out, "entry {}", func_ref_name(module, module.header.entry_method_id));
    }

    out
}

/// Resolve a flat `fields`-table index back to the `TypeName.fieldName` form
/// the assembler's `field_map` registers, by finding the owning `types` row.
fn field_name(module: &Module, field_id: u32) -> String {
    for (type_index, t) in module.types.iter().enumerate() {
        let start = t.field_start;
        let end = start + t.field_count;
        if (start..end).contains(&field_id) {
            let field = &module.fields[field_id as usize];
            return format!("type{type_index}.f{}", field.offset);
        }
    }
    format!("<field{field_id}>")
}

/// Name a function/method index the way the assembler's `func_map` expects
/// to resolve it back: the debug-section name if one was kept (this is also
/// how an import's synthetic method row is named, via its symbol), or a
/// synthetic `funcN` fallback otherwise.
fn func_ref_name(module: &Module, index: u32) -> String {
    module.method_name(index).map(str::to_string).unwrap_or_else(|| format!("func{index}"))
}

fn const_string(module: &Module, idx: u32) -> String {
    match module.const_pool.get(idx) {
        Some(ConstEntry::String(s)) => s.clone(),
        _ => format!("<const{idx}>"),
    }
}

/// Disassemble one function's code range, skipping the leading synthesized
/// `Enter` (the SIR grammar never writes it explicitly).
fn disassemble_body(module: &Module, func_index: u32) -> String {
    let Some(code) = module.function_code(func_index) else {
        return String::new();
    };

    let mut labels = BTreeSet::new();
    let mut pc = 0u32;
    while (pc as usize) < code.len() {
        let Ok(decoded) = decode_at(code, pc) else { break };
        collect_jump_targets(module, decoded.op, &decoded, pc, &mut labels);
        pc += decoded.len;
    }

    let mut out = String::new();
    let mut pc = 0u32;
    let mut skipped_enter = false;
    while (pc as usize) < code.len() {
        let Ok(decoded) = decode_at(code, pc) else { break };
        if !skipped_enter && decoded.op == OpCode::Enter {
            skipped_enter = true;
            pc += decoded.len;
            continue;
        }
        if labels.contains(&pc) {
            let _ = writeln!(out, "L{pc}:");
        }
        let _ = writeln!(out, "  {}", render_instruction(module, decoded.op, &decoded, pc));
        pc += decoded.len;
    }
    out
}

fn collect_jump_targets(
    module: &Module,
    op: OpCode,
    decoded: &crate::instruction::Decoded<'_>,
    pc: u32,
    labels: &mut BTreeSet<u32>,
) {
    use OpCode::*;
    let next_pc = pc + decoded.len;
    match op {
        Jmp | JmpTrue | JmpFalse => {
            let rel = decoded.operands.i32(0);
            labels.insert((next_pc as i64 + rel as i64) as u32);
        }
        JmpTable => {
            let const_idx = decoded.operands.u32(0);
            let default_rel = decoded.operands.i32(4);
            labels.insert((next_pc as i64 + default_rel as i64) as u32);
            if let Some(ConstEntry::JumpTable(rels)) = module.const_pool.get(const_idx) {
                for rel in rels {
                    labels.insert((next_pc as i64 + *rel as i64) as u32);
                }
            }
        }
        _ => {}
    }
}

fn render_instruction(
    module: &Module,
    op: OpCode,
    decoded: &crate::instruction::Decoded<'_>,
    pc: u32,
) -> String {
    use OpCode::*;
    let ops = &decoded.operands;
    let next_pc = pc + decoded.len;
    match op {
        Jmp | JmpTrue | JmpFalse => {
            let rel = ops.i32(0);
            format!("{} L{}", op.mnemonic(), (next_pc as i64 + rel as i64) as u32)
        }
        JmpTable => {
            let const_idx = ops.u32(0);
            let default_rel = ops.i32(4);
            let cases = match module.const_pool.get(const_idx) {
                Some(ConstEntry::JumpTable(rels)) => rels
                    .iter()
                    .map(|rel| format!("L{}", (next_pc as i64 + *rel as i64) as u32))
                    .collect::<Vec<_>>()
                    .join(","),
                _ => String::new(),
            };
            let default_label = (next_pc as i64 + default_rel as i64) as u32;
            format!("{} {} default=L{}", op.mnemonic(), cases, default_label)
        }
        ConstI32 => format!("{} {}", op.mnemonic(), ops.i32(0)),
        ConstI64 => format!("{} {}", op.mnemonic(), ops.i64(0)),
        ConstF32 => format!("{} {}", op.mnemonic(), ops.f32(0)),
        ConstF64 => format!("{} {}", op.mnemonic(), ops.f64(0)),
        ConstString => {
            let idx = ops.u32(0);
            format!("{} \"{}\"", op.mnemonic(), const_string(module, idx))
        }
        LoadLocal | StoreLocal | LoadUpvalue | StoreUpvalue | LoadGlobal | StoreGlobal => {
            format!("{} {}", op.mnemonic(), ops.u32(0))
        }
        NewObject => format!("{} {}", op.mnemonic(), type_keyword(ops.u32(0))),
        LoadField | StoreField => format!("{} {}", op.mnemonic(), field_name(module, ops.u32(0))),
        NewArray | NewList => format!("{} {}", op.mnemonic(), elem_tag_keyword(ops.u8(0))),
        NewClosure => format!("{} {} {}", op.mnemonic(), func_ref_name(module, ops.u32(0)), ops.u32(4)),
        Call | TailCall => format!("{} {} {}", op.mnemonic(), func_ref_name(module, ops.u32(0)), ops.u32(4)),
        CallIndirect => format!("{} sig{} {}", op.mnemonic(), ops.u32(0), ops.u32(4)),
        Intrinsic => {
            let id = ops.u32(0);
            match intrinsics::name(id) {
                Some(n) => format!("{} {}", op.mnemonic(), n),
                None => format!("{} {}", op.mnemonic(), id),
            }
        }
        SysCall => format!("{} {}", op.mnemonic(), ops.u32(0)),
        Line => {
            let file_const = ops.u32(0);
            format!(
                "{} \"{}\" {} {}",
                op.mnemonic(),
                const_string(module, file_const),
                ops.u32(4),
                ops.u32(8)
            )
        }
        _ => op.mnemonic().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::load;
    use crate::sir::assembler::assemble;

    #[test]
    fn round_trips_a_simple_function() {
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
        let text = disassemble(&module);
        let bytes2 = assemble(&text).unwrap();
        let module2 = load(&bytes2).unwrap();
        assert_eq!(module.code, module2.code);
    }

    #[test]
    fn round_trips_a_jump() {
        let src = r#"
            sigs:
              main ret=i32 params=

            func main locals=1 sig=main
              ldloc 0
              jmp.true skip
              const.i32 1
              ret
            skip:
              const.i32 2
              ret
            end

            entry main
        "#;
        let bytes = assemble(src).unwrap();
        let module = load(&bytes).unwrap();
        let text = disassemble(&module);
        let bytes2 = assemble(&text).unwrap();
        let module2 = load(&bytes2).unwrap();
        assert_eq!(module.code, module2.code);
    }
}
