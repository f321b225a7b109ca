//! Dispatch loop, frames, and the bridge to the heap/tiering/FFI subsystems
//! (§4.6).
//!
//! Shaped like `fuel-vm::Interpreter`: a single `step`-per-opcode loop over
//! an explicit frame vector, `tracing` spans at call/trap boundaries, and no
//! panics — every failure becomes a [`Trapped`] value.

pub mod alu;
pub mod ffi;
pub mod flow;
pub mod frame;

use tracing::{trace, warn};

use crate::const_pool::ConstEntry;
use crate::consts::VmConfig;
use crate::error::{
    DecodedOperand, RuntimeError, RuntimeResult, TrapContext, TrapFrame, Trapped,
};
use crate::heap::{ElemWidth, Heap, ObjectKind};
use crate::instruction::decode_at;
use crate::intrinsics;
use crate::opcode::OpCode;
use crate::tiering::{Tier, Tiering, TieringStatistics};
use crate::value::{lane_of_type_id, slot, Lane, Slot, NULL_HANDLE};
use crate::verifier::VerifiedModule;

use ffi::{BuiltinResolver, ImportResolver};
use frame::Frame;

/// A running instance of a verified module. Owns the heap, globals, operand
/// stack, locals arena, and frame stack; never shared across interpreters
/// (§5 "Shared resources").
pub struct Interpreter<R: ImportResolver = BuiltinResolver> {
    module: VerifiedModule,
    heap: Heap,
    globals: Vec<Slot>,
    stack: Vec<Slot>,
    locals_arena: Vec<Slot>,
    frames: Vec<Frame>,
    pc: u32,
    config: VmConfig,
    resolver: R,
    tiering: Tiering,
    instructions_since_safepoint: u64,
}

/// Outcome of the module's root frame returning or halting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    /// The value the entry function returned, if its signature has one.
    pub result: Option<Slot>,
}

impl Interpreter<BuiltinResolver> {
    /// Build an interpreter over `module` with the default (clock-only)
    /// import resolver.
    pub fn new(module: VerifiedModule, config: VmConfig) -> Self {
        Self::with_resolver(module, config, BuiltinResolver)
    }
}

impl<R: ImportResolver> Interpreter<R> {
    /// Build an interpreter over `module` with a caller-supplied import
    /// resolver.
    pub fn with_resolver(module: VerifiedModule, config: VmConfig, resolver: R) -> Self {
        let globals = module
            .module
            .globals
            .iter()
            .map(|g| initial_global_value(&module, g.init_const))
            .collect();
        let function_count = module.module.functions.len();
        Self {
            tiering: Tiering::new(config, function_count),
            module,
            heap: Heap::new(),
            globals,
            stack: Vec::new(),
            locals_arena: Vec::new(),
            frames: Vec::new(),
            pc: 0,
            config,
            resolver,
            instructions_since_safepoint: 0,
        }
    }

    /// Run from the module's `entry_method_id` to completion.
    pub fn run(&mut self) -> Result<RunOutcome, Trapped> {
        let entry_id = self.module.module.header.entry_method_id;
        let func_index = self
            .module
            .module
            .functions
            .iter()
            .position(|f| f.method_id == entry_id)
            .expect("loader already validated entry_method_id resolves to a function")
            as u32;
        self.enter_function(func_index, &[], NULL_HANDLE, 0, 0)
            .map_err(|e| self.trap(e, None))?;
        loop {
            match self.step() {
                Ok(None) => {}
                Ok(Some(result)) => return Ok(RunOutcome { result }),
                Err(e) => return Err(self.trap(e, None)),
            }
        }
    }

    /// Tiering/statistics snapshot, meaningful once `run` has returned.
    pub fn tiering_statistics(&self) -> TieringStatistics {
        self.tiering.statistics()
    }

    /// Number of live heap objects (diagnostic / test hook).
    pub fn heap_live_count(&self) -> usize {
        self.heap.live_count()
    }

    fn current_function_code(&self) -> &[u8] {
        let func_index = self.frames.last().unwrap().func_index;
        self.module.module.function_code(func_index).expect("verified module has code for every guest function")
    }

    /// Execute exactly one instruction. Returns `Some(value)` once the root
    /// frame returns (program exit), `None` to keep stepping.
    fn step(&mut self) -> RuntimeResult<Option<Option<Slot>>> {
        let func_index = self.frames.last().unwrap().func_index;
        // Owned, not borrowed from `self`: the dispatch below needs `&mut self`
        // in almost every arm, which a `&[u8]` tied to `self.module`'s lifetime
        // would conflict with.
        let code = self.current_function_code().to_vec();
        let decoded = decode_at(&code, self.pc).expect("verifier already proved this function decodes cleanly");
        let next_pc = self.pc + decoded.len;
        trace!(func_index, pc = self.pc, op = decoded.op.mnemonic(), "step");

        self.tiering.record_opcode(func_index);
        self.instructions_since_safepoint += 1;
        if self.instructions_since_safepoint >= self.config.safe_point_interval {
            self.instructions_since_safepoint = 0;
            self.maybe_collect(func_index);
        }

        use OpCode::*;
        let op = decoded.op;
        let operands = decoded.operands;

        match op {
            Nop | Breakpoint => {}
            CallCheck => {
                if self.frames.len() != 1 {
                    return Err(RuntimeError::CallCheckFromNonRoot);
                }
            }
            Line => {
                let frame = self.frames.last_mut().unwrap();
                let line_row = self.module.module.debug.line_at(func_index, self.pc);
                frame.line = line_row.map(|l| l.line);
                frame.column = line_row.map(|l| l.column);
            }
            ProfileStart | ProfileEnd => {}
            Halt => return Ok(Some(None)),
            Trap => return Err(RuntimeError::GuestTrap { code: 0 }),

            Jmp => {
                self.pc = flow::resolve_relative(next_pc, operands.i32(0), code.len() as u32)
                    .expect("verifier bounds-checked every jump target");
                return Ok(None);
            }
            JmpTrue | JmpFalse => {
                let cond = slot::to_bool(self.pop());
                let take = cond == matches!(op, JmpTrue);
                if take {
                    self.pc = flow::resolve_relative(next_pc, operands.i32(0), code.len() as u32)
                        .expect("verifier bounds-checked every jump target");
                    return Ok(None);
                }
            }
            JmpTable => {
                let index = slot::to_i32(self.pop());
                let const_idx = operands.u32(0);
                let default_rel = operands.i32(4);
                let cases = match self.module.module.const_pool.get(const_idx) {
                    Some(ConstEntry::JumpTable(v)) => v.clone(),
                    _ => unreachable!("verifier already validated the jump table const ref"),
                };
                self.pc = flow::resolve_jump_table(index, &cases, default_rel, next_pc, code.len() as u32)
                    .expect("verifier bounds-checked every jump table target");
                return Ok(None);
            }

            Pop => {
                self.pop();
            }
            Dup => {
                let v = *self.stack.last().unwrap();
                self.stack.push(v);
            }
            Dup2 => {
                let len = self.stack.len();
                let (a, b) = (self.stack[len - 2], self.stack[len - 1]);
                self.stack.push(a);
                self.stack.push(b);
            }
            Swap => {
                let b = self.pop();
                let a = self.pop();
                self.stack.push(b);
                self.stack.push(a);
            }
            Rot => {
                let c = self.pop();
                let b = self.pop();
                let a = self.pop();
                self.stack.push(c);
                self.stack.push(a);
                self.stack.push(b);
            }

            ConstI32 => self.stack.push(slot::from_i32(operands.i32(0))),
            ConstI64 => self.stack.push(slot::from_i64(operands.i64(0))),
            ConstF32 => self.stack.push(slot::from_f32(operands.f32(0))),
            ConstF64 => self.stack.push(slot::from_f64(operands.f64(0))),
            ConstString => {
                let const_idx = operands.u32(0);
                let text = match self.module.module.const_pool.get(const_idx) {
                    Some(ConstEntry::String(s)) => s.clone(),
                    _ => unreachable!("verifier already validated the string const ref"),
                };
                let handle = self.alloc_string(&text);
                self.stack.push(slot::from_handle(Some(handle)));
            }
            ConstNull => self.stack.push(slot::from_handle(None)),

            LoadLocal => {
                let idx = self.locals_index(operands.u32(0));
                self.stack.push(self.locals_arena[idx]);
            }
            StoreLocal => {
                let idx = self.locals_index(operands.u32(0));
                let v = self.pop();
                self.locals_arena[idx] = v;
            }
            LoadGlobal => self.stack.push(self.globals[operands.u32(0) as usize]),
            StoreGlobal => {
                let v = self.pop();
                self.globals[operands.u32(0) as usize] = v;
            }
            LoadUpvalue => {
                let handle = self.current_closure()?;
                let idx = operands.u32(0) as usize;
                let object = self.heap.get(handle, ObjectKind::Closure)?;
                let at = 8 + idx * 4;
                let h = u32::from_le_bytes(object.payload[at..at + 4].try_into().unwrap());
                self.stack.push(slot::from_handle((h != NULL_HANDLE).then_some(h)));
            }
            StoreUpvalue => {
                let handle = self.current_closure()?;
                let idx = operands.u32(0) as usize;
                let v = slot::to_handle(self.pop()).unwrap_or(NULL_HANDLE);
                let object = self.heap.get_mut(handle, ObjectKind::Closure)?;
                let at = 8 + idx * 4;
                object.payload[at..at + 4].copy_from_slice(&v.to_le_bytes());
            }

            NewObject => {
                let type_id = operands.u32(0);
                let size = self.module.module.types.get(type_id as usize).map(|t| t.size).unwrap_or(0);
                let handle = self.heap.allocate(ObjectKind::Artifact, type_id, vec![0u8; size as usize], None);
                self.stack.push(slot::from_handle(Some(handle)));
            }
            LoadField => {
                let handle = slot::to_handle(self.pop()).ok_or(RuntimeError::NullDereference)?;
                let field_id = operands.u32(0);
                let field = self.module.module.fields[field_id as usize];
                let lane = lane_of_type_id(field.type_id);
                let object = self.heap.get(handle, ObjectKind::Artifact)?;
                self.stack.push(read_lane(&object.payload, field.offset as usize, lane));
            }
            StoreField => {
                let field_id = operands.u32(0);
                let field = self.module.module.fields[field_id as usize];
                let lane = lane_of_type_id(field.type_id);
                let value = self.pop();
                let handle = slot::to_handle(self.pop()).ok_or(RuntimeError::NullDereference)?;
                let object = self.heap.get_mut(handle, ObjectKind::Artifact)?;
                write_lane(&mut object.payload, field.offset as usize, lane, value);
            }

            NewArray | NewList => {
                let width = ElemWidth::from_tag(operands.u8(0)).expect("verified element tag");
                let n = slot::to_i32(self.pop());
                if n < 0 {
                    return Err(RuntimeError::IndexOutOfBounds { index: n as i64, length: 0 });
                }
                let handle = if op == NewArray {
                    self.heap.allocate(ObjectKind::Array, 0, vec![0u8; width.bytes() * n as usize], Some(width))
                } else {
                    let mut payload = (0u32).to_le_bytes().to_vec();
                    payload.extend_from_slice(&(n as u32).to_le_bytes());
                    payload.extend(std::iter::repeat(0u8).take(width.bytes() * n as usize));
                    self.heap.allocate(ObjectKind::List, 0, payload, Some(width))
                };
                self.stack.push(slot::from_handle(Some(handle)));
            }
            ArrayLen => {
                let handle = slot::to_handle(self.pop()).ok_or(RuntimeError::NullDereference)?;
                let object = self.heap.get(handle, ObjectKind::Array)?;
                let width = object.elem_width.unwrap().bytes();
                self.stack.push(slot::from_i32((object.payload.len() / width) as i32));
            }
            ArrayGetI32 | ArrayGetI64 | ArrayGetF32 | ArrayGetF64 | ArrayGetRef => {
                self.array_get(array_lane(op))?
            }
            ArraySetI32 | ArraySetI64 | ArraySetF32 | ArraySetF64 | ArraySetRef => {
                self.array_set(array_lane_for_set(op))?
            }

            ListLen => {
                let handle = slot::to_handle(self.pop()).ok_or(RuntimeError::NullDereference)?;
                let object = self.heap.get(handle, ObjectKind::List)?;
                self.stack.push(slot::from_i32(list_length(&object.payload)));
            }
            ListClear => {
                let handle = slot::to_handle(self.pop()).ok_or(RuntimeError::NullDereference)?;
                let object = self.heap.get_mut(handle, ObjectKind::List)?;
                object.payload[0..4].copy_from_slice(&0u32.to_le_bytes());
            }
            ListPushI32 | ListPushI64 | ListPushF32 | ListPushF64 | ListPushRef => {
                self.list_push(list_lane(op))?
            }
            ListPopI32 | ListPopI64 | ListPopF32 | ListPopF64 | ListPopRef => self.list_pop(list_lane(op))?,
            ListGetI32 | ListGetI64 | ListGetF32 | ListGetF64 | ListGetRef => self.list_get(list_lane(op))?,
            ListSetI32 | ListSetI64 | ListSetF32 | ListSetF64 | ListSetRef => self.list_set(list_lane(op))?,
            ListInsertI32 | ListInsertRef => self.list_insert(list_insert_lane(op))?,
            ListRemoveI32 | ListRemoveRef => self.list_remove(list_insert_lane(op))?,

            StringLen => {
                let handle = slot::to_handle(self.pop()).ok_or(RuntimeError::NullDereference)?;
                let object = self.heap.get(handle, ObjectKind::String)?;
                self.stack.push(slot::from_i32(string_len(&object.payload)));
            }
            StringGetChar => {
                let index = slot::to_i32(self.pop());
                let handle = slot::to_handle(self.pop()).ok_or(RuntimeError::NullDereference)?;
                let object = self.heap.get(handle, ObjectKind::String)?;
                let len = string_len(&object.payload);
                if index < 0 || index >= len {
                    return Err(RuntimeError::IndexOutOfBounds { index: index as i64, length: len as u32 });
                }
                let at = 4 + index as usize * 2;
                let unit = u16::from_le_bytes(object.payload[at..at + 2].try_into().unwrap());
                self.stack.push(slot::from_i32(unit as i32));
            }
            StringSlice => {
                let end = slot::to_i32(self.pop());
                let start = slot::to_i32(self.pop());
                let handle = slot::to_handle(self.pop()).ok_or(RuntimeError::NullDereference)?;
                let object = self.heap.get(handle, ObjectKind::String)?;
                let len = string_len(&object.payload);
                if start < 0 || end > len || start > end {
                    return Err(RuntimeError::IndexOutOfBounds { index: start as i64, length: len as u32 });
                }
                let units: Vec<u16> = (start..end)
                    .map(|i| {
                        let at = 4 + i as usize * 2;
                        u16::from_le_bytes(object.payload[at..at + 2].try_into().unwrap())
                    })
                    .collect();
                let handle = self.alloc_string_units(&units);
                self.stack.push(slot::from_handle(Some(handle)));
            }
            StringConcat => {
                let b = slot::to_handle(self.pop()).ok_or(RuntimeError::NullDereference)?;
                let a = slot::to_handle(self.pop()).ok_or(RuntimeError::NullDereference)?;
                let a_units = string_units(self.heap.get(a, ObjectKind::String)?);
                let b_units = string_units(self.heap.get(b, ObjectKind::String)?);
                let mut units = a_units;
                units.extend(b_units);
                let handle = self.alloc_string_units(&units);
                self.stack.push(slot::from_handle(Some(handle)));
            }

            NewClosure => {
                let method_id = operands.u32(0);
                let upvalue_count = operands.u32(4);
                let mut upvalues = Vec::with_capacity(upvalue_count as usize);
                for _ in 0..upvalue_count {
                    upvalues.push(slot::to_handle(self.pop()).unwrap_or(NULL_HANDLE));
                }
                upvalues.reverse();
                let mut payload = method_id.to_le_bytes().to_vec();
                payload.extend_from_slice(&upvalue_count.to_le_bytes());
                for h in upvalues {
                    payload.extend_from_slice(&h.to_le_bytes());
                }
                let handle = self.heap.allocate(ObjectKind::Closure, 0, payload, None);
                self.stack.push(slot::from_handle(Some(handle)));
            }

            AddI32 => self.binop_i32(|a, b| a.wrapping_add(b)),
            SubI32 => self.binop_i32(|a, b| a.wrapping_sub(b)),
            MulI32 => self.binop_i32(|a, b| a.wrapping_mul(b)),
            DivI32 => self.try_binop_i32(alu::div_i32)?,
            ModI32 => self.try_binop_i32(alu::mod_i32)?,
            AddI64 => self.binop_i64(|a, b| a.wrapping_add(b)),
            SubI64 => self.binop_i64(|a, b| a.wrapping_sub(b)),
            MulI64 => self.binop_i64(|a, b| a.wrapping_mul(b)),
            DivI64 => self.try_binop_i64(alu::div_i64)?,
            ModI64 => self.try_binop_i64(alu::mod_i64)?,
            AddF32 => self.binop_f32(|a, b| a + b),
            SubF32 => self.binop_f32(|a, b| a - b),
            MulF32 => self.binop_f32(|a, b| a * b),
            DivF32 => self.binop_f32(alu::div_f32),
            AddF64 => self.binop_f64(|a, b| a + b),
            SubF64 => self.binop_f64(|a, b| a - b),
            MulF64 => self.binop_f64(|a, b| a * b),
            DivF64 => self.binop_f64(alu::div_f64),

            CmpEqI32 => self.cmp_i32(|a, b| a == b),
            CmpNeI32 => self.cmp_i32(|a, b| a != b),
            CmpLtI32 => self.cmp_i32(|a, b| a < b),
            CmpLeI32 => self.cmp_i32(|a, b| a <= b),
            CmpGtI32 => self.cmp_i32(|a, b| a > b),
            CmpGeI32 => self.cmp_i32(|a, b| a >= b),
            CmpEqI64 => self.cmp_i64(|a, b| a == b),
            CmpNeI64 => self.cmp_i64(|a, b| a != b),
            CmpLtI64 => self.cmp_i64(|a, b| a < b),
            CmpLeI64 => self.cmp_i64(|a, b| a <= b),
            CmpGtI64 => self.cmp_i64(|a, b| a > b),
            CmpGeI64 => self.cmp_i64(|a, b| a >= b),
            CmpEqF32 => self.cmp_f32(|a, b| a == b),
            CmpNeF32 => self.cmp_f32(|a, b| a != b),
            CmpLtF32 => self.cmp_f32(|a, b| a < b),
            CmpLeF32 => self.cmp_f32(|a, b| a <= b),
            CmpGtF32 => self.cmp_f32(|a, b| a > b),
            CmpGeF32 => self.cmp_f32(|a, b| a >= b),
            CmpEqF64 => self.cmp_f64(|a, b| a == b),
            CmpNeF64 => self.cmp_f64(|a, b| a != b),
            CmpLtF64 => self.cmp_f64(|a, b| a < b),
            CmpLeF64 => self.cmp_f64(|a, b| a <= b),
            CmpGtF64 => self.cmp_f64(|a, b| a > b),
            CmpGeF64 => self.cmp_f64(|a, b| a >= b),

            AndI32 => self.binop_i32(|a, b| a & b),
            OrI32 => self.binop_i32(|a, b| a | b),
            XorI32 => self.binop_i32(|a, b| a ^ b),
            ShlI32 => self.binop_i32(alu::shl_i32),
            ShrI32 => self.binop_i32(alu::shr_i32),
            AndI64 => self.binop_i64(|a, b| a & b),
            OrI64 => self.binop_i64(|a, b| a | b),
            XorI64 => self.binop_i64(|a, b| a ^ b),
            ShlI64 => self.binop_i64(alu::shl_i64),
            ShrI64 => self.binop_i64(alu::shr_i64),

            NegI32 => self.unop_i32(|a| a.wrapping_neg()),
            NegI64 => self.unop_i64(|a| a.wrapping_neg()),
            NegF32 => self.unop_f32(|a| -a),
            NegF64 => self.unop_f64(|a| -a),
            IncI32 => self.unop_i32(|a| a.wrapping_add(1)),
            DecI32 => self.unop_i32(|a| a.wrapping_sub(1)),
            IncI64 => self.unop_i64(|a| a.wrapping_add(1)),
            DecI64 => self.unop_i64(|a| a.wrapping_sub(1)),

            BoolNot => {
                let a = slot::to_bool(self.pop());
                self.stack.push(slot::from_bool(!a));
            }
            BoolAnd => {
                let b = slot::to_bool(self.pop());
                let a = slot::to_bool(self.pop());
                self.stack.push(slot::from_bool(a && b));
            }
            BoolOr => {
                let b = slot::to_bool(self.pop());
                let a = slot::to_bool(self.pop());
                self.stack.push(slot::from_bool(a || b));
            }

            ConvI32I64 => {
                let a = slot::to_i32(self.pop());
                self.stack.push(slot::from_i64(a as i64));
            }
            ConvI64I32 => {
                let a = slot::to_i64(self.pop());
                self.stack.push(slot::from_i32(a as i32));
            }
            ConvI32F32 => {
                let a = slot::to_i32(self.pop());
                self.stack.push(slot::from_f32(a as f32));
            }
            ConvI32F64 => {
                let a = slot::to_i32(self.pop());
                self.stack.push(slot::from_f64(a as f64));
            }
            ConvI64F32 => {
                let a = slot::to_i64(self.pop());
                self.stack.push(slot::from_f32(a as f32));
            }
            ConvI64F64 => {
                let a = slot::to_i64(self.pop());
                self.stack.push(slot::from_f64(a as f64));
            }
            ConvF32I32 => {
                let a = slot::to_f32(self.pop());
                self.stack.push(slot::from_i32(a as i32));
            }
            ConvF32I64 => {
                let a = slot::to_f32(self.pop());
                self.stack.push(slot::from_i64(a as i64));
            }
            ConvF64I32 => {
                let a = slot::to_f64(self.pop());
                self.stack.push(slot::from_i32(a as i32));
            }
            ConvF64I64 => {
                let a = slot::to_f64(self.pop());
                self.stack.push(slot::from_i64(a as i64));
            }
            ConvF32F64 => {
                let a = slot::to_f32(self.pop());
                self.stack.push(slot::from_f64(a as f64));
            }
            ConvF64F32 => {
                let a = slot::to_f64(self.pop());
                self.stack.push(slot::from_f32(a as f32));
            }

            Call => {
                let target = operands.u32(0);
                let arg_count = operands.u32(4);
                self.do_call(target, arg_count, self.pc, false)?;
                return Ok(None);
            }
            CallIndirect => {
                let sig_id = operands.u32(0);
                let arg_count = operands.u32(4);
                self.do_call_indirect(sig_id, arg_count, self.pc)?;
                return Ok(None);
            }
            TailCall => {
                let target = operands.u32(0);
                let arg_count = operands.u32(4);
                self.do_call(target, arg_count, self.pc, true)?;
                return Ok(None);
            }

            Enter => {}
            Leave => {
                self.pop_frame(None);
                if self.frames.is_empty() {
                    return Ok(Some(None));
                }
                return Ok(None);
            }
            Ret => {
                let has_return = {
                    let frame = self.frames.last().unwrap();
                    let method = self.module.module.method_of_function(frame.func_index).unwrap();
                    self.module.module.sigs[method.sig_id as usize].has_return()
                };
                let value = has_return.then(|| self.pop());
                let is_root = self.frames.len() == 1;
                self.pop_frame(value);
                if is_root {
                    return Ok(Some(value));
                }
                return Ok(None);
            }

            Intrinsic => {
                let id = operands.u32(0);
                self.run_intrinsic(id)?;
            }
            SysCall => {
                return Err(RuntimeError::UnsupportedBuiltin { kind: "syscall", id: operands.u32(0) });
            }
        }

        self.pc = next_pc;
        Ok(None)
    }

    fn maybe_collect(&mut self, func_index: u32) {
        let at_safe_point = self.module.functions[func_index as usize]
            .stack_maps
            .iter()
            .any(|m| m.pc == self.pc);
        if at_safe_point {
            self.collect_garbage();
        }
    }

    fn collect_garbage(&mut self) {
        self.heap.reset_marks();
        for (global, is_ref) in self.globals.iter().zip(self.module.globals_ref_bits.iter()) {
            if *is_ref {
                if let Some(h) = slot::to_handle(*global) {
                    self.heap.mark(h, &self.module.module);
                }
            }
        }
        let top = self.frames.len().saturating_sub(1);
        for depth in 0..self.frames.len() {
            let frame = self.frames[depth];
            let verification = &self.module.functions[frame.func_index as usize];
            for (i, is_ref) in verification.locals_ref_bits.iter().enumerate() {
                if *is_ref {
                    if let Some(h) = slot::to_handle(self.locals_arena[frame.locals_base + i]) {
                        self.heap.mark(h, &self.module.module);
                    }
                }
            }
            let (height, ref_bits) = if depth == top {
                let height = self.stack.len() - frame.stack_base;
                let ref_bits = verification
                    .stack_maps
                    .iter()
                    .find(|m| m.pc == self.pc)
                    .map(|m| m.ref_bits.clone())
                    .unwrap_or_else(|| vec![false; height]);
                (height, ref_bits)
            } else {
                let callee = self.frames[depth + 1];
                let map = verification.stack_maps.iter().find(|m| m.pc == callee.call_site_pc);
                match map {
                    Some(m) => {
                        let height = m.stack_height as usize - callee.arg_count as usize;
                        (height, m.ref_bits[..height].to_vec())
                    }
                    None => (0, Vec::new()),
                }
            };
            for i in 0..height {
                if ref_bits.get(i).copied().unwrap_or(false) {
                    if let Some(h) = slot::to_handle(self.stack[frame.stack_base + i]) {
                        self.heap.mark(h, &self.module.module);
                    }
                }
            }
        }
        self.heap.sweep();
    }

    fn pop(&mut self) -> Slot {
        self.stack.pop().expect("verifier proved this pop cannot underflow")
    }

    fn locals_index(&self, local: u32) -> usize {
        self.frames.last().unwrap().locals_base + local as usize
    }

    fn current_closure(&self) -> RuntimeResult<u32> {
        let handle = self.frames.last().unwrap().closure_handle;
        if handle == NULL_HANDLE {
            Err(RuntimeError::NoActiveClosure)
        } else {
            Ok(handle)
        }
    }

    fn enter_function(
        &mut self,
        func_index: u32,
        args: &[Slot],
        closure_handle: u32,
        call_site_pc: u32,
        arg_count: u32,
    ) -> RuntimeResult<()> {
        if self.frames.len() >= self.config.max_call_depth {
            return Err(RuntimeError::CallDepthExceeded);
        }
        let function = &self.module.module.functions[func_index as usize];
        let method = &self.module.module.methods[function.method_id as usize];
        let locals_base = self.locals_arena.len();
        let locals_count = method.local_count as usize;
        self.locals_arena.resize(locals_base + locals_count, 0);
        self.locals_arena[locals_base..locals_base + args.len()].copy_from_slice(args);

        let stack_base = self.stack.len();
        let mut frame = Frame::root(func_index, locals_base, locals_count);
        frame.stack_base = stack_base;
        frame.closure_handle = closure_handle;
        frame.call_site_pc = call_site_pc;
        frame.arg_count = arg_count;
        if let Some(caller) = self.frames.last_mut() {
            caller.return_pc = self.pc;
        }
        self.frames.push(frame);
        self.tiering.record_call(func_index);
        self.pc = 0;
        Ok(())
    }

    fn pop_frame(&mut self, return_value: Option<Slot>) {
        let frame = self.frames.pop().expect("root frame present while executing");
        self.stack.truncate(frame.stack_base);
        self.locals_arena.truncate(frame.locals_base);
        if let Some(value) = return_value {
            self.stack.push(value);
        }
        if let Some(caller) = self.frames.last() {
            self.pc = caller.return_pc;
        }
    }

    fn do_call(&mut self, target: u32, arg_count: u32, call_site_pc: u32, tail: bool) -> RuntimeResult<()> {
        let function = *self
            .module
            .module
            .functions
            .get(target as usize)
            .ok_or(RuntimeError::UnknownMethod { target })?;
        if function.is_import() {
            return self.call_import(target, arg_count);
        }

        let mut args = Vec::with_capacity(arg_count as usize);
        for _ in 0..arg_count {
            args.push(self.pop());
        }
        args.reverse();

        if tail {
            let frame = *self.frames.last().unwrap();
            self.stack.truncate(frame.stack_base);
            self.locals_arena.truncate(frame.locals_base);
            self.frames.pop();
        }

        let tier = self.tiering.record_call(target);
        if tier != Tier::None && self.tiering.is_compilable(target, &self.module.module) {
            self.tiering.record_fast_path_dispatch(target);
            let code = self.module.module.function_code(target).unwrap().to_vec();
            let method = self.module.module.methods[function.method_id as usize];
            let int_args: Vec<i32> = args.iter().map(|s| slot::to_i32(*s)).collect();
            match crate::tiering::run_fast_path(&code, &int_args, method.local_count as usize) {
                Ok(result) => {
                    self.tiering.record_fast_path_success(target);
                    if let Some(v) = result {
                        self.stack.push(slot::from_i32(v));
                    }
                    return Ok(());
                }
                Err(e) => {
                    self.tiering.disable_fast_path(target);
                    warn!(func_index = target, error = %e, "fast path failed, falling back to generic dispatch");
                    return Err(e);
                }
            }
        }

        self.enter_function(target, &args, NULL_HANDLE, call_site_pc, arg_count)
    }

    /// `CallIndirect` pops its arguments before the dispatch reference, the
    /// same order the verifier's stack effect uses (§4.6), so closures never
    /// go through the fast path — `COMPILABLE_SUBSET` excludes calls anyway.
    fn do_call_indirect(&mut self, sig_id: u32, arg_count: u32, call_site_pc: u32) -> RuntimeResult<()> {
        let mut args = Vec::with_capacity(arg_count as usize);
        for _ in 0..arg_count {
            args.push(self.pop());
        }
        args.reverse();
        let dispatch = self.pop();
        let (target, closure_handle) = self.resolve_indirect(dispatch, sig_id)?;
        self.tiering.record_call(target);
        self.enter_function(target, &args, closure_handle, call_site_pc, arg_count)
    }

    /// Resolves `CallIndirect`'s dispatch operand, which is either a closure
    /// handle or a raw function index (§4.6). A closure handle wins when the
    /// value unpacks to a live `Closure` object; any other outcome (null,
    /// unknown handle, wrong kind) reinterprets the same slot as a direct
    /// `i32` function index, the same two-branch fallback the original
    /// interpreter's `CallIndirect` case uses.
    fn resolve_indirect(&self, dispatch: Slot, _sig_id: u32) -> RuntimeResult<(u32, u32)> {
        if let Some(handle) = slot::to_handle(dispatch) {
            if let Ok(object) = self.heap.get(handle, ObjectKind::Closure) {
                let method_id = u32::from_le_bytes(object.payload[0..4].try_into().unwrap());
                let target = self
                    .module
                    .module
                    .functions
                    .iter()
                    .position(|f| f.method_id == method_id)
                    .ok_or(RuntimeError::UnknownMethod { target: method_id })? as u32;
                return Ok((target, handle));
            }
        }
        let idx = slot::to_i32(dispatch);
        if idx < 0 || idx as usize >= self.module.module.functions.len() {
            return Err(RuntimeError::NullDereference);
        }
        Ok((idx as u32, NULL_HANDLE))
    }

    fn call_import(&mut self, target: u32, arg_count: u32) -> RuntimeResult<()> {
        let function = &self.module.module.functions[target as usize];
        let method = &self.module.module.methods[function.method_id as usize];
        let import = self
            .module
            .module
            .imports
            .iter()
            .find(|i| i.sig_id == method.sig_id)
            .expect("import synthetic method row always has a matching import row");
        let module_name = self.module.module.const_pool.get(import.module_name_const);
        let symbol_name = self.module.module.const_pool.get(import.symbol_name_const);
        let (module_name, symbol_name) = match (module_name, symbol_name) {
            (Some(ConstEntry::String(m)), Some(ConstEntry::String(s))) => (m.clone(), s.clone()),
            _ => unreachable!("loader validated import const refs"),
        };

        let mut args = Vec::with_capacity(arg_count as usize);
        for _ in 0..arg_count {
            args.push(self.pop());
        }
        args.reverse();

        match self.resolver.call(&module_name, &symbol_name, &args, &mut self.heap) {
            Ok(Some(v)) => self.stack.push(v),
            Ok(None) => {}
            Err(message) => return Err(RuntimeError::HostImportError { message }),
        }
        Ok(())
    }

    fn run_intrinsic(&mut self, id: u32) -> RuntimeResult<()> {
        let (pops, _pushes) = intrinsics::signature(id)
            .ok_or(RuntimeError::UnsupportedBuiltin { kind: "intrinsic", id })?;
        let mut args = Vec::with_capacity(pops.len());
        for _ in pops {
            args.push(self.pop());
        }
        args.reverse();

        match id {
            intrinsics::ABS_I32 => self.stack.push(slot::from_i32(slot::to_i32(args[0]).wrapping_abs())),
            intrinsics::ABS_I64 => self.stack.push(slot::from_i64(slot::to_i64(args[0]).wrapping_abs())),
            intrinsics::ABS_F32 => self.stack.push(slot::from_f32(slot::to_f32(args[0]).abs())),
            intrinsics::ABS_F64 => self.stack.push(slot::from_f64(slot::to_f64(args[0]).abs())),
            intrinsics::MIN_I32 => self.stack.push(slot::from_i32(slot::to_i32(args[0]).min(slot::to_i32(args[1])))),
            intrinsics::MAX_I32 => self.stack.push(slot::from_i32(slot::to_i32(args[0]).max(slot::to_i32(args[1])))),
            intrinsics::MIN_I64 => self.stack.push(slot::from_i64(slot::to_i64(args[0]).min(slot::to_i64(args[1])))),
            intrinsics::MAX_I64 => self.stack.push(slot::from_i64(slot::to_i64(args[0]).max(slot::to_i64(args[1])))),
            intrinsics::MIN_F32 => self.stack.push(slot::from_f32(slot::to_f32(args[0]).min(slot::to_f32(args[1])))),
            intrinsics::MAX_F32 => self.stack.push(slot::from_f32(slot::to_f32(args[0]).max(slot::to_f32(args[1])))),
            intrinsics::MIN_F64 => self.stack.push(slot::from_f64(slot::to_f64(args[0]).min(slot::to_f64(args[1])))),
            intrinsics::MAX_F64 => self.stack.push(slot::from_f64(slot::to_f64(args[0]).max(slot::to_f64(args[1])))),
            intrinsics::MONOTONIC_NANOS => {
                let nanos = std::time::Instant::now().elapsed().as_nanos() as i64;
                self.stack.push(slot::from_i64(nanos));
            }
            intrinsics::WALL_CLOCK_NANOS => {
                let nanos = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_nanos() as i64)
                    .unwrap_or(0);
                self.stack.push(slot::from_i64(nanos));
            }
            intrinsics::PRINT_I32 => println!("{}", slot::to_i32(args[0])),
            intrinsics::PRINT_I64 => println!("{}", slot::to_i64(args[0])),
            intrinsics::PRINT_F32 => println!("{}", slot::to_f32(args[0])),
            intrinsics::PRINT_F64 => println!("{}", slot::to_f64(args[0])),
            intrinsics::PRINT_REF => {
                if let Some(h) = slot::to_handle(args[0]) {
                    if let Ok(object) = self.heap.get(h, ObjectKind::String) {
                        println!("{}", String::from_utf16_lossy(&string_units_raw(&object.payload)));
                    }
                }
            }
            intrinsics::TRAP => return Err(RuntimeError::GuestTrap { code: slot::to_i64(args[0]) }),

            intrinsics::DL_CALL_I8 => {
                let f = dl_fn_ptr::<unsafe extern "C" fn(i8, i8) -> i8>(args[0])?;
                let result = unsafe { f(slot::to_i32(args[1]) as i8, slot::to_i32(args[2]) as i8) };
                self.stack.push(slot::from_i32(result as i32));
            }
            intrinsics::DL_CALL_I16 => {
                let f = dl_fn_ptr::<unsafe extern "C" fn(i16, i16) -> i16>(args[0])?;
                let result = unsafe { f(slot::to_i32(args[1]) as i16, slot::to_i32(args[2]) as i16) };
                self.stack.push(slot::from_i32(result as i32));
            }
            intrinsics::DL_CALL_I32 => {
                let f = dl_fn_ptr::<unsafe extern "C" fn(i32, i32) -> i32>(args[0])?;
                let result = unsafe { f(slot::to_i32(args[1]), slot::to_i32(args[2])) };
                self.stack.push(slot::from_i32(result));
            }
            intrinsics::DL_CALL_I64 => {
                let f = dl_fn_ptr::<unsafe extern "C" fn(i64, i64) -> i64>(args[0])?;
                let result = unsafe { f(slot::to_i64(args[1]), slot::to_i64(args[2])) };
                self.stack.push(slot::from_i64(result));
            }
            intrinsics::DL_CALL_U8 => {
                let f = dl_fn_ptr::<unsafe extern "C" fn(u8, u8) -> u8>(args[0])?;
                let result = unsafe { f(slot::to_i32(args[1]) as u8, slot::to_i32(args[2]) as u8) };
                self.stack.push(slot::from_i32(result as i32));
            }
            intrinsics::DL_CALL_U16 => {
                let f = dl_fn_ptr::<unsafe extern "C" fn(u16, u16) -> u16>(args[0])?;
                let result = unsafe { f(slot::to_i32(args[1]) as u16, slot::to_i32(args[2]) as u16) };
                self.stack.push(slot::from_i32(result as i32));
            }
            intrinsics::DL_CALL_U32 => {
                let f = dl_fn_ptr::<unsafe extern "C" fn(u32, u32) -> u32>(args[0])?;
                let result = unsafe { f(slot::to_i32(args[1]) as u32, slot::to_i32(args[2]) as u32) };
                self.stack.push(slot::from_i32(result as i32));
            }
            intrinsics::DL_CALL_U64 => {
                let f = dl_fn_ptr::<unsafe extern "C" fn(u64, u64) -> u64>(args[0])?;
                let result = unsafe { f(slot::to_i64(args[1]) as u64, slot::to_i64(args[2]) as u64) };
                self.stack.push(slot::from_i64(result as i64));
            }
            intrinsics::DL_CALL_F32 => {
                let f = dl_fn_ptr::<unsafe extern "C" fn(f32, f32) -> f32>(args[0])?;
                let result = unsafe { f(slot::to_f32(args[1]), slot::to_f32(args[2])) };
                self.stack.push(slot::from_f32(result));
            }
            intrinsics::DL_CALL_F64 => {
                let f = dl_fn_ptr::<unsafe extern "C" fn(f64, f64) -> f64>(args[0])?;
                let result = unsafe { f(slot::to_f64(args[1]), slot::to_f64(args[2])) };
                self.stack.push(slot::from_f64(result));
            }
            intrinsics::DL_CALL_BOOL => {
                let f = dl_fn_ptr::<unsafe extern "C" fn(bool, bool) -> bool>(args[0])?;
                let a = slot::to_i32(args[1]) != 0;
                let b = slot::to_i32(args[2]) != 0;
                let result = unsafe { f(a, b) };
                self.stack.push(slot::from_bool(result));
            }
            intrinsics::DL_CALL_CHAR => {
                let f = dl_fn_ptr::<unsafe extern "C" fn(u8, u8) -> u8>(args[0])?;
                let result = unsafe { f(slot::to_i32(args[1]) as u8, slot::to_i32(args[2]) as u8) };
                self.stack.push(slot::from_i32(result as i32));
            }
            intrinsics::DL_CALL_STR0 => {
                let f = dl_fn_ptr::<unsafe extern "C" fn() -> *const std::os::raw::c_char>(args[0])?;
                let raw = unsafe { f() };
                if raw.is_null() {
                    self.stack.push(slot::from_handle(None));
                } else {
                    let text = unsafe { std::ffi::CStr::from_ptr(raw) }.to_string_lossy().into_owned();
                    let handle = self.alloc_string(&text);
                    self.stack.push(slot::from_handle(Some(handle)));
                }
            }

            _ => return Err(RuntimeError::UnsupportedBuiltin { kind: "intrinsic", id }),
        }
        Ok(())
    }

    fn alloc_string(&mut self, text: &str) -> u32 {
        let units: Vec<u16> = text.encode_utf16().collect();
        self.alloc_string_units(&units)
    }

    fn alloc_string_units(&mut self, units: &[u16]) -> u32 {
        let mut payload = (units.len() as u32).to_le_bytes().to_vec();
        for unit in units {
            payload.extend_from_slice(&unit.to_le_bytes());
        }
        self.heap.allocate(ObjectKind::String, 0, payload, None)
    }

    fn binop_i32(&mut self, f: impl Fn(i32, i32) -> i32) {
        let b = slot::to_i32(self.pop());
        let a = slot::to_i32(self.pop());
        self.stack.push(slot::from_i32(f(a, b)));
    }
    fn try_binop_i32(&mut self, f: impl Fn(i32, i32) -> Result<i32, RuntimeError>) -> RuntimeResult<()> {
        let b = slot::to_i32(self.pop());
        let a = slot::to_i32(self.pop());
        self.stack.push(slot::from_i32(f(a, b)?));
        Ok(())
    }
    fn binop_i64(&mut self, f: impl Fn(i64, i64) -> i64) {
        let b = slot::to_i64(self.pop());
        let a = slot::to_i64(self.pop());
        self.stack.push(slot::from_i64(f(a, b)));
    }
    fn try_binop_i64(&mut self, f: impl Fn(i64, i64) -> Result<i64, RuntimeError>) -> RuntimeResult<()> {
        let b = slot::to_i64(self.pop());
        let a = slot::to_i64(self.pop());
        self.stack.push(slot::from_i64(f(a, b)?));
        Ok(())
    }
    fn binop_f32(&mut self, f: impl Fn(f32, f32) -> f32) {
        let b = slot::to_f32(self.pop());
        let a = slot::to_f32(self.pop());
        self.stack.push(slot::from_f32(f(a, b)));
    }
    fn binop_f64(&mut self, f: impl Fn(f64, f64) -> f64) {
        let b = slot::to_f64(self.pop());
        let a = slot::to_f64(self.pop());
        self.stack.push(slot::from_f64(f(a, b)));
    }
    fn unop_i32(&mut self, f: impl Fn(i32) -> i32) {
        let a = slot::to_i32(self.pop());
        self.stack.push(slot::from_i32(f(a)));
    }
    fn unop_i64(&mut self, f: impl Fn(i64) -> i64) {
        let a = slot::to_i64(self.pop());
        self.stack.push(slot::from_i64(f(a)));
    }
    fn unop_f32(&mut self, f: impl Fn(f32) -> f32) {
        let a = slot::to_f32(self.pop());
        self.stack.push(slot::from_f32(f(a)));
    }
    fn unop_f64(&mut self, f: impl Fn(f64) -> f64) {
        let a = slot::to_f64(self.pop());
        self.stack.push(slot::from_f64(f(a)));
    }
    fn cmp_i32(&mut self, f: impl Fn(i32, i32) -> bool) {
        let b = slot::to_i32(self.pop());
        let a = slot::to_i32(self.pop());
        self.stack.push(slot::from_bool(f(a, b)));
    }
    fn cmp_i64(&mut self, f: impl Fn(i64, i64) -> bool) {
        let b = slot::to_i64(self.pop());
        let a = slot::to_i64(self.pop());
        self.stack.push(slot::from_bool(f(a, b)));
    }
    fn cmp_f32(&mut self, f: impl Fn(f32, f32) -> bool) {
        let b = slot::to_f32(self.pop());
        let a = slot::to_f32(self.pop());
        self.stack.push(slot::from_bool(f(a, b)));
    }
    fn cmp_f64(&mut self, f: impl Fn(f64, f64) -> bool) {
        let b = slot::to_f64(self.pop());
        let a = slot::to_f64(self.pop());
        self.stack.push(slot::from_bool(f(a, b)));
    }

    fn array_get(&mut self, lane: Lane) -> RuntimeResult<()> {
        let index = slot::to_i32(self.pop());
        let handle = slot::to_handle(self.pop()).ok_or(RuntimeError::NullDereference)?;
        let object = self.heap.get(handle, ObjectKind::Array)?;
        let width = object.elem_width.unwrap().bytes();
        let length = (object.payload.len() / width) as i32;
        if index < 0 || index >= length {
            return Err(RuntimeError::IndexOutOfBounds { index: index as i64, length: length as u32 });
        }
        self.stack.push(read_lane(&object.payload, index as usize * width, lane));
        Ok(())
    }

    fn array_set(&mut self, lane: Lane) -> RuntimeResult<()> {
        let value = self.pop();
        let index = slot::to_i32(self.pop());
        let handle = slot::to_handle(self.pop()).ok_or(RuntimeError::NullDereference)?;
        let object = self.heap.get_mut(handle, ObjectKind::Array)?;
        let width = object.elem_width.unwrap().bytes();
        let length = (object.payload.len() / width) as i32;
        if index < 0 || index >= length {
            return Err(RuntimeError::IndexOutOfBounds { index: index as i64, length: length as u32 });
        }
        write_lane(&mut object.payload, index as usize * width, lane, value);
        Ok(())
    }

    fn list_push(&mut self, lane: Lane) -> RuntimeResult<()> {
        let value = self.pop();
        let handle = slot::to_handle(self.pop()).ok_or(RuntimeError::NullDereference)?;
        let object = self.heap.get_mut(handle, ObjectKind::List)?;
        let width = object.elem_width.unwrap().bytes();
        let length = list_length(&object.payload) as usize;
        let capacity = (object.payload.len() - 8) / width;
        if length >= capacity {
            return Err(RuntimeError::ListPushOverflow { capacity: capacity as u32 });
        }
        let at = 8 + length * width;
        object.payload[0..4].copy_from_slice(&((length + 1) as u32).to_le_bytes());
        let mut tmp = vec![0u8; width];
        write_lane(&mut tmp, 0, lane, value);
        object.payload[at..at + width].copy_from_slice(&tmp);
        Ok(())
    }

    fn list_pop(&mut self, lane: Lane) -> RuntimeResult<()> {
        let handle = slot::to_handle(self.pop()).ok_or(RuntimeError::NullDereference)?;
        let object = self.heap.get_mut(handle, ObjectKind::List)?;
        let width = object.elem_width.unwrap().bytes();
        let length = list_length(&object.payload) as usize;
        if length == 0 {
            return Err(RuntimeError::IndexOutOfBounds { index: -1, length: 0 });
        }
        let at = 8 + (length - 1) * width;
        let value = read_lane(&object.payload, at, lane);
        object.payload[0..4].copy_from_slice(&((length - 1) as u32).to_le_bytes());
        self.stack.push(value);
        Ok(())
    }

    fn list_get(&mut self, lane: Lane) -> RuntimeResult<()> {
        let index = slot::to_i32(self.pop());
        let handle = slot::to_handle(self.pop()).ok_or(RuntimeError::NullDereference)?;
        let object = self.heap.get(handle, ObjectKind::List)?;
        let width = object.elem_width.unwrap().bytes();
        let length = list_length(&object.payload);
        if index < 0 || index >= length {
            return Err(RuntimeError::IndexOutOfBounds { index: index as i64, length: length as u32 });
        }
        self.stack.push(read_lane(&object.payload, 8 + index as usize * width, lane));
        Ok(())
    }

    fn list_set(&mut self, lane: Lane) -> RuntimeResult<()> {
        let value = self.pop();
        let index = slot::to_i32(self.pop());
        let handle = slot::to_handle(self.pop()).ok_or(RuntimeError::NullDereference)?;
        let object = self.heap.get_mut(handle, ObjectKind::List)?;
        let width = object.elem_width.unwrap().bytes();
        let length = list_length(&object.payload);
        if index < 0 || index >= length {
            return Err(RuntimeError::IndexOutOfBounds { index: index as i64, length: length as u32 });
        }
        write_lane(&mut object.payload, 8 + index as usize * width, lane, value);
        Ok(())
    }

    fn list_insert(&mut self, lane: Lane) -> RuntimeResult<()> {
        let value = self.pop();
        let index = slot::to_i32(self.pop());
        let handle = slot::to_handle(self.pop()).ok_or(RuntimeError::NullDereference)?;
        let object = self.heap.get_mut(handle, ObjectKind::List)?;
        let width = object.elem_width.unwrap().bytes();
        let length = list_length(&object.payload) as usize;
        let capacity = (object.payload.len() - 8) / width;
        if index < 0 || index as usize > length {
            return Err(RuntimeError::IndexOutOfBounds { index: index as i64, length: length as u32 });
        }
        if length >= capacity {
            return Err(RuntimeError::ListPushOverflow { capacity: capacity as u32 });
        }
        let index = index as usize;
        for i in (index..length).rev() {
            let (src, dst) = (8 + i * width, 8 + (i + 1) * width);
            let bytes: Vec<u8> = object.payload[src..src + width].to_vec();
            object.payload[dst..dst + width].copy_from_slice(&bytes);
        }
        let at = 8 + index * width;
        let mut tmp = vec![0u8; width];
        write_lane(&mut tmp, 0, lane, value);
        object.payload[at..at + width].copy_from_slice(&tmp);
        object.payload[0..4].copy_from_slice(&((length + 1) as u32).to_le_bytes());
        Ok(())
    }

    fn list_remove(&mut self, lane: Lane) -> RuntimeResult<()> {
        let index = slot::to_i32(self.pop());
        let handle = slot::to_handle(self.pop()).ok_or(RuntimeError::NullDereference)?;
        let object = self.heap.get_mut(handle, ObjectKind::List)?;
        let width = object.elem_width.unwrap().bytes();
        let length = list_length(&object.payload) as usize;
        if index < 0 || index as usize >= length {
            return Err(RuntimeError::IndexOutOfBounds { index: index as i64, length: length as u32 });
        }
        let index = index as usize;
        let removed = read_lane(&object.payload, 8 + index * width, lane);
        for i in index..length - 1 {
            let (src, dst) = (8 + (i + 1) * width, 8 + i * width);
            let bytes: Vec<u8> = object.payload[src..src + width].to_vec();
            object.payload[dst..dst + width].copy_from_slice(&bytes);
        }
        object.payload[0..4].copy_from_slice(&((length - 1) as u32).to_le_bytes());
        self.stack.push(removed);
        Ok(())
    }

    fn trap(&self, error: RuntimeError, decoded_override: Option<DecodedOperand>) -> Trapped {
        let frame = self.frames.last();
        let func_index = frame.map(|f| f.func_index).unwrap_or(0);
        let code = self.module.module.function_code(func_index).unwrap_or(&[]);
        let decoded = decode_at(code, self.pc).ok();
        let mnemonic = decoded.map(|d| d.op.mnemonic()).unwrap_or("?");
        let opcode_byte = decoded.map(|d| d.op as u8).unwrap_or(0);
        let call_chain = self
            .frames
            .iter()
            .rev()
            .map(|f| TrapFrame {
                func_index: f.func_index,
                name: self.module.module.method_of_function(f.func_index).and_then(|_| {
                    self.module.module.method_name(
                        self.module.module.functions[f.func_index as usize].method_id,
                    )
                }).map(|s| s.to_string()),
                line: f.line,
                column: f.column,
            })
            .collect();
        Trapped {
            error,
            context: TrapContext {
                func_index,
                pc: self.pc,
                opcode_byte,
                mnemonic,
                decoded: decoded_override,
                line: frame.and_then(|f| f.line),
                column: frame.and_then(|f| f.column),
                call_chain,
            },
        }
    }
}

fn initial_global_value(module: &VerifiedModule, init_const: u32) -> Slot {
    if init_const == crate::consts::SENTINEL_U32 {
        return 0;
    }
    match module.module.const_pool.get(init_const) {
        Some(ConstEntry::I128(v)) => slot::from_i64(*v as i64),
        Some(ConstEntry::U128(v)) => slot::from_i64(*v as i64),
        Some(ConstEntry::F32(v)) => slot::from_f32(*v),
        Some(ConstEntry::F64(v)) => slot::from_f64(*v),
        _ => 0,
    }
}

fn read_lane(payload: &[u8], at: usize, lane: Lane) -> Slot {
    match lane {
        Lane::I32 => slot::from_i32(i32::from_le_bytes(payload[at..at + 4].try_into().unwrap())),
        Lane::I64 => slot::from_i64(i64::from_le_bytes(payload[at..at + 8].try_into().unwrap())),
        Lane::F32 => slot::from_f32(f32::from_bits(u32::from_le_bytes(payload[at..at + 4].try_into().unwrap()))),
        Lane::F64 => slot::from_f64(f64::from_bits(u64::from_le_bytes(payload[at..at + 8].try_into().unwrap()))),
        Lane::Ref => {
            let h = u32::from_le_bytes(payload[at..at + 4].try_into().unwrap());
            slot::from_handle((h != NULL_HANDLE).then_some(h))
        }
    }
}

fn write_lane(payload: &mut [u8], at: usize, lane: Lane, value: Slot) {
    match lane {
        Lane::I32 => payload[at..at + 4].copy_from_slice(&slot::to_i32(value).to_le_bytes()),
        Lane::I64 => payload[at..at + 8].copy_from_slice(&slot::to_i64(value).to_le_bytes()),
        Lane::F32 => payload[at..at + 4].copy_from_slice(&slot::to_f32(value).to_bits().to_le_bytes()),
        Lane::F64 => payload[at..at + 8].copy_from_slice(&slot::to_f64(value).to_bits().to_le_bytes()),
        Lane::Ref => {
            let h = slot::to_handle(value).unwrap_or(NULL_HANDLE);
            payload[at..at + 4].copy_from_slice(&h.to_le_bytes());
        }
    }
}

fn array_lane(op: OpCode) -> Lane {
    match op {
        OpCode::ArrayGetI32 => Lane::I32,
        OpCode::ArrayGetI64 => Lane::I64,
        OpCode::ArrayGetF32 => Lane::F32,
        OpCode::ArrayGetF64 => Lane::F64,
        OpCode::ArrayGetRef => Lane::Ref,
        _ => unreachable!(),
    }
}

fn array_lane_for_set(op: OpCode) -> Lane {
    match op {
        OpCode::ArraySetI32 => Lane::I32,
        OpCode::ArraySetI64 => Lane::I64,
        OpCode::ArraySetF32 => Lane::F32,
        OpCode::ArraySetF64 => Lane::F64,
        OpCode::ArraySetRef => Lane::Ref,
        _ => unreachable!(),
    }
}

fn list_lane(op: OpCode) -> Lane {
    use OpCode::*;
    match op {
        ListPushI32 | ListPopI32 | ListGetI32 | ListSetI32 => Lane::I32,
        ListPushI64 | ListPopI64 | ListGetI64 | ListSetI64 => Lane::I64,
        ListPushF32 | ListPopF32 | ListGetF32 | ListSetF32 => Lane::F32,
        ListPushF64 | ListPopF64 | ListGetF64 | ListSetF64 => Lane::F64,
        ListPushRef | ListPopRef | ListGetRef | ListSetRef => Lane::Ref,
        _ => unreachable!(),
    }
}

fn list_insert_lane(op: OpCode) -> Lane {
    match op {
        OpCode::ListInsertI32 | OpCode::ListRemoveI32 => Lane::I32,
        OpCode::ListInsertRef | OpCode::ListRemoveRef => Lane::Ref,
        _ => unreachable!(),
    }
}

fn list_length(payload: &[u8]) -> i32 {
    u32::from_le_bytes(payload[0..4].try_into().unwrap()) as i32
}

fn string_len(payload: &[u8]) -> i32 {
    u32::from_le_bytes(payload[0..4].try_into().unwrap()) as i32
}

fn string_units(object: &crate::heap::Object) -> Vec<u16> {
    string_units_raw(&object.payload)
}

fn string_units_raw(payload: &[u8]) -> Vec<u16> {
    let len = string_len(payload) as usize;
    (0..len)
        .map(|i| {
            let at = 4 + i * 2;
            u16::from_le_bytes(payload[at..at + 2].try_into().unwrap())
        })
        .collect()
}

/// Reinterprets a `dl_call_*` operand as a typed `extern "C"` function
/// pointer. The address came from a prior `core.dl.sym` resolution with no
/// type information attached, so the cast is trusted entirely on the guest
/// module having picked the `dl_call_*` variant matching the symbol's real
/// signature; calling through it after the owning library is closed is UB,
/// same sharp edge the raw `dlsym`/function-pointer-cast pattern always has.
fn dl_fn_ptr<F: Copy>(ptr_slot: Slot) -> RuntimeResult<F> {
    let addr = slot::to_i64(ptr_slot);
    if addr == 0 {
        return Err(RuntimeError::NullDereference);
    }
    Ok(unsafe { std::mem::transmute_copy::<usize, F>(&(addr as usize)) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::const_pool::ConstPool;
    use crate::instruction::encode_into;
    use crate::sbc::rows::{FunctionRow, MethodRow, SigRow};
    use crate::sbc::Header;
    use crate::verifier::verify;

    fn build_module(code: Vec<u8>, ret_type_id: u32) -> crate::sbc::Module {
        crate::sbc::Module {
            header: Header {
                magic: crate::sbc::MAGIC,
                version: crate::sbc::SUPPORTED_VERSION,
                endian: crate::sbc::ENDIAN_LITTLE,
                flags: 0,
                section_count: 0,
                section_table_offset: 32,
                entry_method_id: 0,
            },
            types: vec![],
            fields: vec![],
            methods: vec![MethodRow { name_const: crate::consts::SENTINEL_U32, sig_id: 0, local_count: 1, flags: 0 }],
            sigs: vec![SigRow { ret_type_id, param_count: 0, call_conv: 0 }],
            param_types: vec![],
            globals: vec![],
            functions: vec![FunctionRow { method_id: 0, code_offset: 0, code_size: code.len() as u32, stack_max: 0 }],
            imports: vec![],
            exports: vec![],
            const_pool: ConstPool::from_entries(vec![]),
            code,
            debug: Default::default(),
            function_is_import: vec![false],
        }
    }

    #[test]
    fn runs_integer_sum_to_five() {
        let mut code = Vec::new();
        encode_into(&mut code, OpCode::Enter, &0u32.to_le_bytes());
        encode_into(&mut code, OpCode::ConstI32, &2i32.to_le_bytes());
        encode_into(&mut code, OpCode::ConstI32, &3i32.to_le_bytes());
        encode_into(&mut code, OpCode::AddI32, &[]);
        encode_into(&mut code, OpCode::Ret, &[]);
        let module = build_module(code, crate::value::TYPE_ID_I32);
        let verified = verify(module).unwrap();
        let mut interp = Interpreter::new(verified, VmConfig::default());
        let outcome = interp.run().unwrap();
        assert_eq!(outcome.result.map(slot::to_i32), Some(5));
    }

    #[test]
    fn division_by_zero_traps_with_context() {
        let mut code = Vec::new();
        encode_into(&mut code, OpCode::Enter, &0u32.to_le_bytes());
        encode_into(&mut code, OpCode::ConstI32, &1i32.to_le_bytes());
        encode_into(&mut code, OpCode::ConstI32, &0i32.to_le_bytes());
        encode_into(&mut code, OpCode::DivI32, &[]);
        encode_into(&mut code, OpCode::Ret, &[]);
        let module = build_module(code, crate::value::TYPE_ID_I32);
        let verified = verify(module).unwrap();
        let mut interp = Interpreter::new(verified, VmConfig::default());
        let err = interp.run().unwrap_err();
        assert_eq!(err.error, RuntimeError::DivByZeroInt);
        assert_eq!(err.context.func_index, 0);
    }
}
