//! Per-function abstract interpretation (§4.4).
//!
//! Grounded on the worklist/abstract-state shape of `fuel-vm`'s validation
//! passes (`checked_transaction`): a function is verified by walking its
//! control-flow graph with a queue of not-yet-stable program points, merging
//! abstract state at each join, and failing closed the first time two
//! predecessors disagree. Plain `Vec<bool>` boolean vectors stand in for the
//! reference bitmaps §4.4 and §4.5 need for GC rooting — each one is sized to
//! a single function's per-pc stack height or local count, not worth a
//! dedicated bitset crate.

use std::collections::VecDeque;

use tracing::debug;

use crate::const_pool::ConstEntry;
use crate::consts::SENTINEL_U32;
use crate::error::{VerifyError, VerifyResult};
use crate::heap::ElemWidth;
use crate::instruction::decode_at;
use crate::intrinsics;
use crate::opcode::OpCode;
use crate::sbc::Module;
use crate::value::{lane_of_type_id, Lane};

/// Per-PC `{stack_height, ref_bits}` the GC consults at a safe-point (§4.4,
/// §4.6). Emitted for every reachable instruction boundary, a superset of
/// the minimum §4.4 requires (branch targets and call/return sites) — see
/// DESIGN.md.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackMapEntry {
    /// Program counter, relative to the function's code start.
    pub pc: u32,
    /// Operand-stack depth at this PC.
    pub stack_height: u32,
    /// `true` at every stack slot (bottom to top) holding a `Ref`.
    pub ref_bits: Vec<bool>,
}

/// Verification output for one function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionVerification {
    /// Upper bound on abstract operand-stack depth, also written back into
    /// the function/method rows.
    pub stack_max: u32,
    /// `true` at every local slot proven to hold a `Ref` on every path that
    /// assigns it.
    pub locals_ref_bits: Vec<bool>,
    /// Stack maps, sorted by `pc`.
    pub stack_maps: Vec<StackMapEntry>,
}

/// A verified module: the loaded [`Module`] plus every derived reference
/// bitmap and stack map the interpreter and GC need.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifiedModule {
    /// The underlying module (function/method `stack_max` rows updated in
    /// place).
    pub module: Module,
    /// `true` at every global slot proven to hold a `Ref`.
    pub globals_ref_bits: Vec<bool>,
    /// Per-function verification output, indexed like `module.functions`.
    /// Import placeholders get an empty entry.
    pub functions: Vec<FunctionVerification>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AbstractState {
    stack: Vec<Lane>,
    locals: Vec<Option<Lane>>,
}

/// Verify every guest function in `module`, deriving GC reference bitmaps
/// and stack maps, and writing `stack_max` back into the function/method
/// rows.
pub fn verify(mut module: Module) -> VerifyResult<VerifiedModule> {
    let globals_ref_bits = module
        .globals
        .iter()
        .map(|g| lane_of_type_id(g.type_id).is_ref())
        .collect();

    let mut verifications = Vec::with_capacity(module.functions.len());
    let mut stack_maxes = Vec::with_capacity(module.functions.len());

    for func_index in 0..module.functions.len() as u32 {
        if module.functions[func_index as usize].is_import() {
            verifications.push(FunctionVerification {
                stack_max: 0,
                locals_ref_bits: Vec::new(),
                stack_maps: Vec::new(),
            });
            stack_maxes.push(0);
            continue;
        }
        debug!(func_index, "verifying function");
        let result = verify_function(&module, func_index)?;
        stack_maxes.push(result.stack_max);
        verifications.push(result);
    }

    for (func_index, stack_max) in stack_maxes.into_iter().enumerate() {
        module.functions[func_index].stack_max = stack_max;
    }

    Ok(VerifiedModule { module, globals_ref_bits, functions: verifications })
}

fn verify_function(module: &Module, func_index: u32) -> VerifyResult<FunctionVerification> {
    let function = &module.functions[func_index as usize];
    let method = module
        .methods
        .get(function.method_id as usize)
        .expect("loader guarantees method_id is in range");
    let sig = module
        .sigs
        .get(method.sig_id as usize)
        .expect("loader guarantees sig_id is in range");
    let param_types = module.sig_param_types(method.sig_id);
    let code = module
        .function_code(func_index)
        .expect("loader guarantees guest functions have code");

    let locals_count = method.local_count as usize;
    let mut committed_locals: Vec<Option<Lane>> = vec![None; locals_count];
    for (i, ty) in param_types.iter().enumerate() {
        if i < locals_count {
            committed_locals[i] = Some(lane_of_type_id(*ty));
        }
    }

    let entry = decode_at(code, 0)
        .map_err(|_| VerifyError::MissingEnter { func: func_index })?;
    if entry.op != OpCode::Enter {
        return Err(VerifyError::MissingEnter { func: func_index });
    }

    let mut states: std::collections::HashMap<u32, AbstractState> = std::collections::HashMap::new();
    let mut worklist: VecDeque<u32> = VecDeque::new();
    states.insert(
        0,
        AbstractState { stack: Vec::new(), locals: committed_locals.clone() },
    );
    worklist.push_back(0);

    let mut stack_max = 0u32;
    let mut stack_maps: Vec<StackMapEntry> = Vec::new();
    let mut visited_for_map: std::collections::HashSet<u32> = std::collections::HashSet::new();

    while let Some(pc) = worklist.pop_front() {
        let state = states
            .get(&pc)
            .cloned()
            .expect("pc was only ever queued after its state was recorded");

        stack_max = stack_max.max(state.stack.len() as u32);
        if visited_for_map.insert(pc) {
            stack_maps.push(StackMapEntry {
                pc,
                stack_height: state.stack.len() as u32,
                ref_bits: state.stack.iter().map(|l| l.is_ref()).collect(),
            });
        }

        let decoded = decode_at(code, pc)
            .map_err(|_| VerifyError::TruncatedOperand { func: func_index, pc })?;
        let next_pc = pc + decoded.len;

        let step = step_opcode(
            module,
            func_index,
            pc,
            next_pc,
            code.len() as u32,
            decoded.op,
            &decoded.operands,
            sig,
            &state,
            &mut committed_locals,
        )?;

        for (target, out_state) in step.successors {
            merge_into(&mut states, &mut worklist, func_index, target, out_state)?;
        }
    }

    stack_maps.sort_by_key(|m| m.pc);

    Ok(FunctionVerification {
        stack_max,
        locals_ref_bits: committed_locals.iter().map(|l| matches!(l, Some(Lane::Ref))).collect(),
        stack_maps,
    })
}

struct StepResult {
    successors: Vec<(u32, AbstractState)>,
}

#[allow(clippy::too_many_arguments)]
fn step_opcode(
    module: &Module,
    func: u32,
    pc: u32,
    next_pc: u32,
    code_len: u32,
    op: OpCode,
    operands: &crate::instruction::Operands<'_>,
    sig: &crate::sbc::rows::SigRow,
    state: &AbstractState,
    committed_locals: &mut [Option<Lane>],
) -> VerifyResult<StepResult> {
    let mut stack = state.stack.clone();
    let mut locals = state.locals.clone();

    let pop = |stack: &mut Vec<Lane>, expected: Lane| -> VerifyResult<()> {
        match stack.pop() {
            Some(l) if l == expected => Ok(()),
            Some(_) => Err(VerifyError::LaneMismatch { func, pc, slot: stack.len() as u32 }),
            None => Err(VerifyError::StackUnderflow { func, pc }),
        }
    };
    let pop_any = |stack: &mut Vec<Lane>| -> VerifyResult<Lane> {
        stack.pop().ok_or(VerifyError::StackUnderflow { func, pc })
    };

    let mut terminal = false;
    let mut jump_targets: Vec<i64> = Vec::new();

    use OpCode::*;
    match op {
        Nop | Breakpoint | CallCheck | ProfileStart | ProfileEnd | Leave => {}
        Line => {}
        SysCall => {}
        Halt | Trap => terminal = true,

        Jmp => {
            jump_targets.push(next_pc as i64 + operands.i32(0) as i64);
            terminal = true;
        }
        JmpTrue | JmpFalse => {
            pop(&mut stack, Lane::I32)?;
            jump_targets.push(next_pc as i64 + operands.i32(0) as i64);
            jump_targets.push(next_pc as i64);
        }
        JmpTable => {
            pop(&mut stack, Lane::I32)?;
            let const_idx = operands.u32(0);
            let default_rel = operands.i32(4);
            let cases = match module.const_pool.get(const_idx) {
                Some(ConstEntry::JumpTable(rels)) => rels.clone(),
                _ => return Err(VerifyError::BadConstRef { func, pc, const_idx }),
            };
            for rel in cases {
                jump_targets.push(next_pc as i64 + rel as i64);
            }
            jump_targets.push(next_pc as i64 + default_rel as i64);
            terminal = true;
        }

        Pop => {
            pop_any(&mut stack)?;
        }
        Dup => {
            let l = *stack.last().ok_or(VerifyError::StackUnderflow { func, pc })?;
            stack.push(l);
        }
        Dup2 => {
            let len = stack.len();
            if len < 2 {
                return Err(VerifyError::StackUnderflow { func, pc });
            }
            let (a, b) = (stack[len - 2], stack[len - 1]);
            stack.push(a);
            stack.push(b);
        }
        Swap => {
            let b = pop_any(&mut stack)?;
            let a = pop_any(&mut stack)?;
            stack.push(b);
            stack.push(a);
        }
        Rot => {
            let c = pop_any(&mut stack)?;
            let b = pop_any(&mut stack)?;
            let a = pop_any(&mut stack)?;
            stack.push(c);
            stack.push(a);
            stack.push(b);
        }

        ConstI32 => stack.push(Lane::I32),
        ConstI64 => stack.push(Lane::I64),
        ConstF32 => stack.push(Lane::F32),
        ConstF64 => stack.push(Lane::F64),
        ConstString | ConstNull => stack.push(Lane::Ref),

        LoadLocal => {
            let idx = operands.u32(0) as usize;
            let lane = locals
                .get(idx)
                .and_then(|l| *l)
                .ok_or(VerifyError::StackUnderflow { func, pc })?;
            stack.push(lane);
        }
        StoreLocal => {
            let idx = operands.u32(0) as usize;
            let lane = pop_any(&mut stack)?;
            commit_local(committed_locals, idx, lane, func, pc)?;
            if let Some(slot) = locals.get_mut(idx) {
                *slot = Some(lane);
            }
        }
        LoadGlobal => {
            let idx = operands.u32(0) as usize;
            let g = module
                .globals
                .get(idx)
                .ok_or(VerifyError::BadConstRef { func, pc, const_idx: idx as u32 })?;
            stack.push(lane_of_type_id(g.type_id));
        }
        StoreGlobal => {
            let idx = operands.u32(0) as usize;
            let g = module
                .globals
                .get(idx)
                .ok_or(VerifyError::BadConstRef { func, pc, const_idx: idx as u32 })?;
            pop(&mut stack, lane_of_type_id(g.type_id))?;
        }
        LoadUpvalue => stack.push(Lane::Ref),
        StoreUpvalue => pop(&mut stack, Lane::Ref)?,

        NewObject => stack.push(Lane::Ref),
        LoadField => {
            pop(&mut stack, Lane::Ref)?;
            let field_id = operands.u32(0);
            let field = module
                .fields
                .get(field_id as usize)
                .ok_or(VerifyError::BadConstRef { func, pc, const_idx: field_id })?;
            stack.push(lane_of_type_id(field.type_id));
        }
        StoreField => {
            let field_id = operands.u32(0);
            let field = module
                .fields
                .get(field_id as usize)
                .ok_or(VerifyError::BadConstRef { func, pc, const_idx: field_id })?;
            let value_lane = lane_of_type_id(field.type_id);
            pop(&mut stack, value_lane)?;
            pop(&mut stack, Lane::Ref)?;
        }

        NewArray | NewList => {
            let tag = operands.u8(0);
            ElemWidth::from_tag(tag).ok_or(VerifyError::BadElementTag { func, pc, tag })?;
            pop(&mut stack, Lane::I32)?;
            stack.push(Lane::Ref);
        }
        ArrayLen | ListLen => {
            pop(&mut stack, Lane::Ref)?;
            stack.push(Lane::I32);
        }
        ListClear => pop(&mut stack, Lane::Ref)?,

        ArrayGetI32 | ListGetI32 => array_get(&mut stack, pop, Lane::I32)?,
        ArrayGetI64 | ListGetI64 => array_get(&mut stack, pop, Lane::I64)?,
        ArrayGetF32 | ListGetF32 => array_get(&mut stack, pop, Lane::F32)?,
        ArrayGetF64 | ListGetF64 => array_get(&mut stack, pop, Lane::F64)?,
        ArrayGetRef | ListGetRef => array_get(&mut stack, pop, Lane::Ref)?,

        ArraySetI32 | ListSetI32 => array_set(&mut stack, pop, Lane::I32)?,
        ArraySetI64 | ListSetI64 => array_set(&mut stack, pop, Lane::I64)?,
        ArraySetF32 | ListSetF32 => array_set(&mut stack, pop, Lane::F32)?,
        ArraySetF64 | ListSetF64 => array_set(&mut stack, pop, Lane::F64)?,
        ArraySetRef | ListSetRef => array_set(&mut stack, pop, Lane::Ref)?,

        ListPushI32 => list_push(&mut stack, pop, Lane::I32)?,
        ListPushI64 => list_push(&mut stack, pop, Lane::I64)?,
        ListPushF32 => list_push(&mut stack, pop, Lane::F32)?,
        ListPushF64 => list_push(&mut stack, pop, Lane::F64)?,
        ListPushRef => list_push(&mut stack, pop, Lane::Ref)?,

        ListPopI32 => list_pop(&mut stack, pop, Lane::I32)?,
        ListPopI64 => list_pop(&mut stack, pop, Lane::I64)?,
        ListPopF32 => list_pop(&mut stack, pop, Lane::F32)?,
        ListPopF64 => list_pop(&mut stack, pop, Lane::F64)?,
        ListPopRef => list_pop(&mut stack, pop, Lane::Ref)?,

        ListInsertI32 => list_insert(&mut stack, pop, Lane::I32)?,
        ListInsertRef => list_insert(&mut stack, pop, Lane::Ref)?,
        ListRemoveI32 => list_remove(&mut stack, pop, Lane::I32)?,
        ListRemoveRef => list_remove(&mut stack, pop, Lane::Ref)?,

        StringLen => {
            pop(&mut stack, Lane::Ref)?;
            stack.push(Lane::I32);
        }
        StringGetChar => {
            pop(&mut stack, Lane::I32)?;
            pop(&mut stack, Lane::Ref)?;
            stack.push(Lane::I32);
        }
        StringSlice => {
            pop(&mut stack, Lane::I32)?;
            pop(&mut stack, Lane::I32)?;
            pop(&mut stack, Lane::Ref)?;
            stack.push(Lane::Ref);
        }
        StringConcat => {
            pop(&mut stack, Lane::Ref)?;
            pop(&mut stack, Lane::Ref)?;
            stack.push(Lane::Ref);
        }

        NewClosure => {
            let upvalue_count = operands.u32(4);
            for _ in 0..upvalue_count {
                pop(&mut stack, Lane::Ref)?;
            }
            stack.push(Lane::Ref);
        }

        AddI32 | SubI32 | MulI32 | DivI32 | ModI32 => binop(&mut stack, pop, Lane::I32)?,
        AddI64 | SubI64 | MulI64 | DivI64 | ModI64 => binop(&mut stack, pop, Lane::I64)?,
        AddF32 | SubF32 | MulF32 | DivF32 => binop(&mut stack, pop, Lane::F32)?,
        AddF64 | SubF64 | MulF64 | DivF64 => binop(&mut stack, pop, Lane::F64)?,

        CmpEqI32 | CmpNeI32 | CmpLtI32 | CmpLeI32 | CmpGtI32 | CmpGeI32 => {
            cmpop(&mut stack, pop, Lane::I32)?
        }
        CmpEqI64 | CmpNeI64 | CmpLtI64 | CmpLeI64 | CmpGtI64 | CmpGeI64 => {
            cmpop(&mut stack, pop, Lane::I64)?
        }
        CmpEqF32 | CmpNeF32 | CmpLtF32 | CmpLeF32 | CmpGtF32 | CmpGeF32 => {
            cmpop(&mut stack, pop, Lane::F32)?
        }
        CmpEqF64 | CmpNeF64 | CmpLtF64 | CmpLeF64 | CmpGtF64 | CmpGeF64 => {
            cmpop(&mut stack, pop, Lane::F64)?
        }

        AndI32 | OrI32 | XorI32 | ShlI32 | ShrI32 => binop(&mut stack, pop, Lane::I32)?,
        AndI64 | OrI64 | XorI64 | ShlI64 | ShrI64 => binop(&mut stack, pop, Lane::I64)?,

        NegI32 | IncI32 | DecI32 => unop(&mut stack, pop, Lane::I32)?,
        NegI64 | IncI64 | DecI64 => unop(&mut stack, pop, Lane::I64)?,
        NegF32 => unop(&mut stack, pop, Lane::F32)?,
        NegF64 => unop(&mut stack, pop, Lane::F64)?,

        BoolNot => unop(&mut stack, pop, Lane::I32)?,
        BoolAnd | BoolOr => binop(&mut stack, pop, Lane::I32)?,

        ConvI32I64 => conv(&mut stack, pop, Lane::I32, Lane::I64)?,
        ConvI64I32 => conv(&mut stack, pop, Lane::I64, Lane::I32)?,
        ConvI32F32 => conv(&mut stack, pop, Lane::I32, Lane::F32)?,
        ConvI32F64 => conv(&mut stack, pop, Lane::I32, Lane::F64)?,
        ConvI64F32 => conv(&mut stack, pop, Lane::I64, Lane::F32)?,
        ConvI64F64 => conv(&mut stack, pop, Lane::I64, Lane::F64)?,
        ConvF32I32 => conv(&mut stack, pop, Lane::F32, Lane::I32)?,
        ConvF32I64 => conv(&mut stack, pop, Lane::F32, Lane::I64)?,
        ConvF64I32 => conv(&mut stack, pop, Lane::F64, Lane::I32)?,
        ConvF64I64 => conv(&mut stack, pop, Lane::F64, Lane::I64)?,
        ConvF32F64 => conv(&mut stack, pop, Lane::F32, Lane::F64)?,
        ConvF64F32 => conv(&mut stack, pop, Lane::F64, Lane::F32)?,

        Call => {
            let target = operands.u32(0);
            let arg_count = operands.u32(4);
            let callee = module
                .functions
                .get(target as usize)
                .ok_or(VerifyError::UnknownCallTarget { func, pc, target })?;
            let callee_method = module
                .methods
                .get(callee.method_id as usize)
                .ok_or(VerifyError::UnknownCallTarget { func, pc, target })?;
            let callee_sig = module
                .sigs
                .get(callee_method.sig_id as usize)
                .ok_or(VerifyError::UnknownCallTarget { func, pc, target })?;
            if callee_sig.param_count != arg_count {
                return Err(VerifyError::CallArityMismatch {
                    func,
                    pc,
                    expected: callee_sig.param_count,
                    found: arg_count,
                });
            }
            for ty in module.sig_param_types(callee_method.sig_id).iter().rev() {
                pop(&mut stack, lane_of_type_id(*ty))?;
            }
            if callee_sig.has_return() {
                stack.push(lane_of_type_id(callee_sig.ret_type_id));
            }
        }
        CallIndirect => {
            let sig_id = operands.u32(0);
            let arg_count = operands.u32(4);
            let target_sig = module
                .sigs
                .get(sig_id as usize)
                .ok_or(VerifyError::BadConstRef { func, pc, const_idx: sig_id })?;
            if target_sig.param_count != arg_count {
                return Err(VerifyError::CallArityMismatch {
                    func,
                    pc,
                    expected: target_sig.param_count,
                    found: arg_count,
                });
            }
            for ty in module.sig_param_types(sig_id).iter().rev() {
                pop(&mut stack, lane_of_type_id(*ty))?;
            }
            // Dispatch operand is a closure handle or a raw function index
            // (§4.6), so either lane is accepted here; which branch wins is
            // resolved at run time by whether the value is a live closure.
            let dispatch_lane = pop_any(&mut stack)?;
            if !matches!(dispatch_lane, Lane::Ref | Lane::I32) {
                return Err(VerifyError::LaneMismatch { func, pc, slot: stack.len() as u32 });
            }
            if target_sig.has_return() {
                stack.push(lane_of_type_id(target_sig.ret_type_id));
            }
        }
        TailCall => {
            let target = operands.u32(0);
            let arg_count = operands.u32(4);
            let callee = module
                .functions
                .get(target as usize)
                .ok_or(VerifyError::UnknownCallTarget { func, pc, target })?;
            let callee_method = module
                .methods
                .get(callee.method_id as usize)
                .ok_or(VerifyError::UnknownCallTarget { func, pc, target })?;
            let callee_sig = module
                .sigs
                .get(callee_method.sig_id as usize)
                .ok_or(VerifyError::UnknownCallTarget { func, pc, target })?;
            if callee_sig.param_count != arg_count {
                return Err(VerifyError::CallArityMismatch {
                    func,
                    pc,
                    expected: callee_sig.param_count,
                    found: arg_count,
                });
            }
            for ty in module.sig_param_types(callee_method.sig_id).iter().rev() {
                pop(&mut stack, lane_of_type_id(*ty))?;
            }
            terminal = true;
        }

        Enter => {}
        Ret => {
            if sig.has_return() {
                pop(&mut stack, lane_of_type_id(sig.ret_type_id))?;
            }
            terminal = true;
        }

        Intrinsic => {
            let id = operands.u32(0);
            let (pops, pushes) = intrinsics::signature(id)
                .ok_or(VerifyError::UnknownIntrinsic { func, pc, id })?;
            for lane in pops.iter().rev() {
                pop(&mut stack, *lane)?;
            }
            for lane in pushes {
                stack.push(*lane);
            }
        }
    }

    let mut successors = Vec::new();
    if !terminal {
        successors.push((next_pc, AbstractState { stack: stack.clone(), locals: locals.clone() }));
    }
    for target in jump_targets {
        if target < 0 || target as u32 > code_len {
            return Err(VerifyError::JumpOutOfRange { func, pc, target });
        }
        successors.push((target as u32, AbstractState { stack: stack.clone(), locals: locals.clone() }));
    }

    Ok(StepResult { successors })
}

fn commit_local(
    committed: &mut [Option<Lane>],
    idx: usize,
    lane: Lane,
    func: u32,
    pc: u32,
) -> VerifyResult<()> {
    let Some(slot) = committed.get_mut(idx) else {
        return Ok(());
    };
    match slot {
        None => *slot = Some(lane),
        Some(existing) if *existing == lane => {}
        Some(_) => return Err(VerifyError::ConflictingLocalLane { func, local: idx as u32 }),
    }
    Ok(())
}

fn binop(
    stack: &mut Vec<Lane>,
    pop: impl Fn(&mut Vec<Lane>, Lane) -> VerifyResult<()>,
    lane: Lane,
) -> VerifyResult<()> {
    pop(stack, lane)?;
    pop(stack, lane)?;
    stack.push(lane);
    Ok(())
}

fn cmpop(
    stack: &mut Vec<Lane>,
    pop: impl Fn(&mut Vec<Lane>, Lane) -> VerifyResult<()>,
    lane: Lane,
) -> VerifyResult<()> {
    pop(stack, lane)?;
    pop(stack, lane)?;
    stack.push(Lane::I32);
    Ok(())
}

fn unop(
    stack: &mut Vec<Lane>,
    pop: impl Fn(&mut Vec<Lane>, Lane) -> VerifyResult<()>,
    lane: Lane,
) -> VerifyResult<()> {
    pop(stack, lane)?;
    stack.push(lane);
    Ok(())
}

fn conv(
    stack: &mut Vec<Lane>,
    pop: impl Fn(&mut Vec<Lane>, Lane) -> VerifyResult<()>,
    from: Lane,
    to: Lane,
) -> VerifyResult<()> {
    pop(stack, from)?;
    stack.push(to);
    Ok(())
}

fn array_get(
    stack: &mut Vec<Lane>,
    pop: impl Fn(&mut Vec<Lane>, Lane) -> VerifyResult<()>,
    elem: Lane,
) -> VerifyResult<()> {
    pop(stack, Lane::I32)?;
    pop(stack, Lane::Ref)?;
    stack.push(elem);
    Ok(())
}

fn array_set(
    stack: &mut Vec<Lane>,
    pop: impl Fn(&mut Vec<Lane>, Lane) -> VerifyResult<()>,
    elem: Lane,
) -> VerifyResult<()> {
    pop(stack, elem)?;
    pop(stack, Lane::I32)?;
    pop(stack, Lane::Ref)?;
    Ok(())
}

fn list_push(
    stack: &mut Vec<Lane>,
    pop: impl Fn(&mut Vec<Lane>, Lane) -> VerifyResult<()>,
    elem: Lane,
) -> VerifyResult<()> {
    pop(stack, elem)?;
    pop(stack, Lane::Ref)?;
    Ok(())
}

fn list_pop(
    stack: &mut Vec<Lane>,
    pop: impl Fn(&mut Vec<Lane>, Lane) -> VerifyResult<()>,
    elem: Lane,
) -> VerifyResult<()> {
    pop(stack, Lane::Ref)?;
    stack.push(elem);
    Ok(())
}

fn list_insert(
    stack: &mut Vec<Lane>,
    pop: impl Fn(&mut Vec<Lane>, Lane) -> VerifyResult<()>,
    elem: Lane,
) -> VerifyResult<()> {
    pop(stack, elem)?;
    pop(stack, Lane::I32)?;
    pop(stack, Lane::Ref)?;
    Ok(())
}

fn list_remove(
    stack: &mut Vec<Lane>,
    pop: impl Fn(&mut Vec<Lane>, Lane) -> VerifyResult<()>,
    elem: Lane,
) -> VerifyResult<()> {
    pop(stack, Lane::I32)?;
    pop(stack, Lane::Ref)?;
    stack.push(elem);
    Ok(())
}

fn merge_into(
    states: &mut std::collections::HashMap<u32, AbstractState>,
    worklist: &mut VecDeque<u32>,
    func: u32,
    target: u32,
    incoming: AbstractState,
) -> VerifyResult<()> {
    match states.get_mut(&target) {
        None => {
            states.insert(target, incoming);
            worklist.push_back(target);
        }
        Some(existing) => {
            if existing.stack.len() != incoming.stack.len() {
                return Err(VerifyError::StackHeightMismatch {
                    func,
                    pc: target,
                    a: existing.stack.len() as u32,
                    b: incoming.stack.len() as u32,
                });
            }
            for (slot, (a, b)) in existing.stack.iter().zip(incoming.stack.iter()).enumerate() {
                if a != b {
                    return Err(VerifyError::LaneMismatch { func, pc: target, slot: slot as u32 });
                }
            }
            let mut changed = false;
            for (i, (a, b)) in existing.locals.iter_mut().zip(incoming.locals.iter()).enumerate() {
                match (*a, *b) {
                    (None, Some(lane)) => {
                        *a = Some(lane);
                        changed = true;
                    }
                    (Some(x), Some(y)) if x != y => {
                        return Err(VerifyError::ConflictingLocalLane { func, local: i as u32 })
                    }
                    _ => {}
                }
            }
            if changed {
                worklist.push_back(target);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::const_pool::ConstPool;
    use crate::instruction::encode_into;
    use crate::sbc::rows::{FunctionRow, MethodRow, SigRow};
    use crate::sbc::Header;

    fn module_with_code(code: Vec<u8>, local_count: u32, ret_type_id: u32) -> Module {
        Module {
            header: Header {
                magic: crate::sbc::MAGIC,
                version: crate::sbc::SUPPORTED_VERSION,
                endian: crate::sbc::ENDIAN_LITTLE,
                flags: 0,
                section_count: 0,
                section_table_offset: 32,
                entry_method_id: SENTINEL_U32,
            },
            types: vec![],
            fields: vec![],
            methods: vec![MethodRow { name_const: SENTINEL_U32, sig_id: 0, local_count, flags: 0 }],
            sigs: vec![SigRow { ret_type_id, param_count: 0, call_conv: 0 }],
            param_types: vec![],
            globals: vec![],
            functions: vec![FunctionRow {
                method_id: 0,
                code_offset: 0,
                code_size: code.len() as u32,
                stack_max: 0,
            }],
            imports: vec![],
            exports: vec![],
            const_pool: ConstPool::from_entries(vec![]),
            code,
            debug: Default::default(),
            function_is_import: vec![false],
        }
    }

    #[test]
    fn verifies_integer_sum() {
        let mut code = Vec::new();
        encode_into(&mut code, OpCode::Enter, &0u32.to_le_bytes());
        encode_into(&mut code, OpCode::ConstI32, &2i32.to_le_bytes());
        encode_into(&mut code, OpCode::ConstI32, &3i32.to_le_bytes());
        encode_into(&mut code, OpCode::AddI32, &[]);
        encode_into(&mut code, OpCode::Ret, &[]);
        let module = module_with_code(code, 0, crate::value::TYPE_ID_I32);
        let verified = verify(module).unwrap();
        assert_eq!(verified.functions[0].stack_max, 2);
    }

    #[test]
    fn rejects_missing_enter() {
        let mut code = Vec::new();
        encode_into(&mut code, OpCode::Nop, &[]);
        encode_into(&mut code, OpCode::Ret, &[]);
        let module = module_with_code(code, 0, SENTINEL_U32);
        assert!(matches!(verify(module), Err(VerifyError::MissingEnter { .. })));
    }

    #[test]
    fn rejects_stack_underflow() {
        let mut code = Vec::new();
        encode_into(&mut code, OpCode::Enter, &0u32.to_le_bytes());
        encode_into(&mut code, OpCode::AddI32, &[]);
        encode_into(&mut code, OpCode::Ret, &[]);
        let module = module_with_code(code, 0, SENTINEL_U32);
        assert!(matches!(verify(module), Err(VerifyError::StackUnderflow { .. })));
    }

    #[test]
    fn rejects_new_array_with_bad_element_tag() {
        let mut code = Vec::new();
        encode_into(&mut code, OpCode::Enter, &0u32.to_le_bytes());
        encode_into(&mut code, OpCode::ConstI32, &0i32.to_le_bytes());
        encode_into(&mut code, OpCode::NewArray, &[0xFF]);
        encode_into(&mut code, OpCode::Ret, &[]);
        let module = module_with_code(code, 0, SENTINEL_U32);
        assert!(matches!(verify(module), Err(VerifyError::BadElementTag { tag: 0xFF, .. })));
    }

    #[test]
    fn accepts_new_array_of_each_element_kind() {
        for tag in [
            ElemWidth::I32.to_tag(),
            ElemWidth::I64.to_tag(),
            ElemWidth::F32.to_tag(),
            ElemWidth::F64.to_tag(),
            ElemWidth::Ref.to_tag(),
        ] {
            let mut code = Vec::new();
            encode_into(&mut code, OpCode::Enter, &0u32.to_le_bytes());
            encode_into(&mut code, OpCode::ConstI32, &0i32.to_le_bytes());
            encode_into(&mut code, OpCode::NewArray, &[tag]);
            encode_into(&mut code, OpCode::Pop, &[]);
            encode_into(&mut code, OpCode::Ret, &[]);
            let module = module_with_code(code, 0, SENTINEL_U32);
            assert!(verify(module).is_ok(), "tag {tag} should verify");
        }
    }
}
