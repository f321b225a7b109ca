//! Call/opcode counters, tier promotion, and the fast-path runner (§4.7).
//!
//! Grounded on `fuel-vm::profiler` + `interpreter/gas.rs`: per-function
//! counters charged during dispatch, read back out as a flat statistics
//! struct once execution halts. The "fast path" plays the role `fuel-vm`'s
//! gas metering plays for cost accounting — a cheap, narrow pass that runs
//! alongside (and can bail out of) the generic dispatch loop.

use std::collections::HashMap;

use crate::consts::VmConfig;
use crate::error::RuntimeError;
use crate::instruction::decode_at;
use crate::opcode::OpCode;
use crate::sbc::Module;

/// Runtime hotness classification of a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Never promoted.
    None,
    /// Crossed the call-count or opcode-count Tier0 threshold.
    Tier0,
    /// Crossed the call-count Tier1 threshold.
    Tier1,
}

/// The fixed opcode subset the fast-path interpreter understands (§4.7 step 3).
pub const COMPILABLE_SUBSET: &[OpCode] = &[
    OpCode::Enter,
    OpCode::Nop,
    OpCode::Pop,
    OpCode::Ret,
    OpCode::ConstI32,
    OpCode::LoadLocal,
    OpCode::StoreLocal,
    OpCode::AddI32,
    OpCode::SubI32,
    OpCode::MulI32,
    OpCode::DivI32,
    OpCode::ModI32,
    OpCode::CmpEqI32,
    OpCode::CmpNeI32,
    OpCode::CmpLtI32,
    OpCode::CmpLeI32,
    OpCode::CmpGtI32,
    OpCode::CmpGeI32,
    OpCode::BoolNot,
    OpCode::BoolAnd,
    OpCode::BoolOr,
    OpCode::Jmp,
    OpCode::JmpTrue,
    OpCode::JmpFalse,
];

#[derive(Debug, Clone, Default)]
struct FunctionStats {
    call_count: u64,
    opcode_count: u64,
    tier: Option<Tier>,
    tier0_tick: Option<u64>,
    tier1_tick: Option<u64>,
    compilable: Option<bool>,
    fast_path_dispatches: u64,
    fast_path_executions: u64,
    tier1_executions: u64,
    fast_path_disabled: bool,
}

impl FunctionStats {
    fn tier(&self) -> Tier {
        self.tier.unwrap_or(Tier::None)
    }
}

/// Flat statistics snapshot returned at `Halt` (§4.7 final paragraph).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TieringStatistics {
    /// Per-function call counts.
    pub call_counts: Vec<u64>,
    /// Per-function executed-opcode counts.
    pub opcode_counts: Vec<u64>,
    /// Per-function current tier.
    pub tiers: Vec<Tier>,
    /// Tick at which each function crossed into `Tier0`, if it did.
    pub compile_ticks_tier0: Vec<Option<u64>>,
    /// Tick at which each function crossed into `Tier1`, if it did.
    pub compile_ticks_tier1: Vec<Option<u64>>,
    /// Per-function count of calls dispatched through the fast path.
    pub fast_path_dispatches: Vec<u64>,
    /// Per-function count of fast-path runs that completed without error.
    pub fast_path_executions: Vec<u64>,
    /// Per-function count of calls executed while at `Tier1`.
    pub tier1_executions: Vec<u64>,
}

/// Per-module tiering state: one [`FunctionStats`] per function, plus a
/// monotonic tick counter advanced on every promotion.
#[derive(Debug, Clone)]
pub struct Tiering {
    config: VmConfig,
    stats: Vec<FunctionStats>,
    tick: u64,
}

impl Tiering {
    /// Fresh tiering state for a module with `function_count` functions.
    pub fn new(config: VmConfig, function_count: usize) -> Self {
        Self { config, stats: vec![FunctionStats::default(); function_count], tick: 0 }
    }

    /// Record a call to `func_index`, promoting its tier if a threshold was
    /// crossed, and returning the tier to dispatch at.
    pub fn record_call(&mut self, func_index: u32) -> Tier {
        self.tick += 1;
        let tick = self.tick;
        let stats = &mut self.stats[func_index as usize];
        stats.call_count += 1;
        if stats.call_count >= self.config.tier1_threshold && stats.tier1_tick.is_none() {
            stats.tier = Some(Tier::Tier1);
            stats.tier1_tick = Some(tick);
            if stats.tier0_tick.is_none() {
                stats.tier0_tick = Some(tick);
            }
        } else if stats.call_count >= self.config.tier0_threshold && stats.tier0_tick.is_none() {
            stats.tier = Some(Tier::Tier0);
            stats.tier0_tick = Some(tick);
        }
        if stats.tier() == Tier::Tier1 {
            stats.tier1_executions += 1;
        }
        stats.tier()
    }

    /// Record one executed opcode in `func_index`; independently promotes to
    /// `Tier0` once the opcode-count threshold is crossed (§4.7 step 2).
    pub fn record_opcode(&mut self, func_index: u32) {
        self.tick += 1;
        let tick = self.tick;
        let stats = &mut self.stats[func_index as usize];
        stats.opcode_count += 1;
        if stats.opcode_count >= self.config.opcode_threshold
            && stats.tier.is_none()
            && stats.tier0_tick.is_none()
        {
            stats.tier = Some(Tier::Tier0);
            stats.tier0_tick = Some(tick);
        }
    }

    /// Whether `func_index` is known to use only [`COMPILABLE_SUBSET`]
    /// opcodes, scanning and caching the result on first use.
    pub fn is_compilable(&mut self, func_index: u32, module: &Module) -> bool {
        let stats = &mut self.stats[func_index as usize];
        if let Some(known) = stats.compilable {
            return known && !stats.fast_path_disabled;
        }
        let compilable = scan_compilable(func_index, module);
        stats.compilable = Some(compilable);
        compilable
    }

    /// Record a fast-path dispatch attempt.
    pub fn record_fast_path_dispatch(&mut self, func_index: u32) {
        self.stats[func_index as usize].fast_path_dispatches += 1;
    }

    /// Record a fast-path run that completed without error.
    pub fn record_fast_path_success(&mut self, func_index: u32) {
        self.stats[func_index as usize].fast_path_executions += 1;
    }

    /// Disable the fast path for `func_index` after it raised an error;
    /// the caller falls back to generic dispatch from then on.
    pub fn disable_fast_path(&mut self, func_index: u32) {
        self.stats[func_index as usize].fast_path_disabled = true;
    }

    /// Snapshot every counter for reporting at `Halt`.
    pub fn statistics(&self) -> TieringStatistics {
        TieringStatistics {
            call_counts: self.stats.iter().map(|s| s.call_count).collect(),
            opcode_counts: self.stats.iter().map(|s| s.opcode_count).collect(),
            tiers: self.stats.iter().map(|s| s.tier()).collect(),
            compile_ticks_tier0: self.stats.iter().map(|s| s.tier0_tick).collect(),
            compile_ticks_tier1: self.stats.iter().map(|s| s.tier1_tick).collect(),
            fast_path_dispatches: self.stats.iter().map(|s| s.fast_path_dispatches).collect(),
            fast_path_executions: self.stats.iter().map(|s| s.fast_path_executions).collect(),
            tier1_executions: self.stats.iter().map(|s| s.tier1_executions).collect(),
        }
    }
}

fn scan_compilable(func_index: u32, module: &Module) -> bool {
    let Some(code) = module.function_code(func_index) else {
        return false;
    };
    let mut pc = 0u32;
    while pc < code.len() as u32 {
        let Ok(decoded) = decode_at(code, pc) else {
            return false;
        };
        if !COMPILABLE_SUBSET.contains(&decoded.op) {
            return false;
        }
        pc += decoded.len;
    }
    true
}

/// Run `code` (known to use only [`COMPILABLE_SUBSET`] opcodes) with `args`
/// as the initial local slots, returning the `Ret` value if any.
///
/// Uses a private `i32` stack/locals pair so it never touches the GC's root
/// bitmaps — per §4.7 step 4, the fast path has no heap ops, no calls, no
/// FFI, so there is nothing for the collector to root here.
pub fn run_fast_path(
    code: &[u8],
    args: &[i32],
    locals_count: usize,
) -> Result<Option<i32>, RuntimeError> {
    let mut stack: Vec<i32> = Vec::new();
    let mut locals: Vec<i32> = vec![0; locals_count];
    locals[..args.len()].copy_from_slice(args);

    let mut pc = 0u32;
    loop {
        let decoded = decode_at(code, pc).map_err(|_| RuntimeError::CallDepthExceeded)?;
        let next_pc = pc + decoded.len;
        match decoded.op {
            OpCode::Enter | OpCode::Nop => {}
            OpCode::Pop => {
                stack.pop();
            }
            OpCode::ConstI32 => stack.push(decoded.operands.i32(0)),
            OpCode::LoadLocal => stack.push(locals[decoded.operands.u32(0) as usize]),
            OpCode::StoreLocal => {
                let v = stack.pop().unwrap_or(0);
                locals[decoded.operands.u32(0) as usize] = v;
            }
            OpCode::AddI32 => binop(&mut stack, |a, b| a.wrapping_add(b)),
            OpCode::SubI32 => binop(&mut stack, |a, b| a.wrapping_sub(b)),
            OpCode::MulI32 => binop(&mut stack, |a, b| a.wrapping_mul(b)),
            OpCode::DivI32 => {
                let b = stack.pop().unwrap_or(0);
                let a = stack.pop().unwrap_or(0);
                stack.push(crate::interpreter::alu::div_i32(a, b)?);
            }
            OpCode::ModI32 => {
                let b = stack.pop().unwrap_or(0);
                let a = stack.pop().unwrap_or(0);
                stack.push(crate::interpreter::alu::mod_i32(a, b)?);
            }
            OpCode::CmpEqI32 => binop(&mut stack, |a, b| (a == b) as i32),
            OpCode::CmpNeI32 => binop(&mut stack, |a, b| (a != b) as i32),
            OpCode::CmpLtI32 => binop(&mut stack, |a, b| (a < b) as i32),
            OpCode::CmpLeI32 => binop(&mut stack, |a, b| (a <= b) as i32),
            OpCode::CmpGtI32 => binop(&mut stack, |a, b| (a > b) as i32),
            OpCode::CmpGeI32 => binop(&mut stack, |a, b| (a >= b) as i32),
            OpCode::BoolNot => {
                let a = stack.pop().unwrap_or(0);
                stack.push(((a & 1) == 0) as i32);
            }
            OpCode::BoolAnd => binop(&mut stack, |a, b| ((a & 1 != 0) && (b & 1 != 0)) as i32),
            OpCode::BoolOr => binop(&mut stack, |a, b| ((a & 1 != 0) || (b & 1 != 0)) as i32),
            OpCode::Jmp => {
                pc = crate::interpreter::flow::resolve_relative(
                    next_pc,
                    decoded.operands.i32(0),
                    code.len() as u32,
                )
                .ok_or(RuntimeError::CallDepthExceeded)?;
                continue;
            }
            OpCode::JmpTrue | OpCode::JmpFalse => {
                let cond = stack.pop().unwrap_or(0) & 1 != 0;
                let take = cond == matches!(decoded.op, OpCode::JmpTrue);
                if take {
                    pc = crate::interpreter::flow::resolve_relative(
                        next_pc,
                        decoded.operands.i32(0),
                        code.len() as u32,
                    )
                    .ok_or(RuntimeError::CallDepthExceeded)?;
                    continue;
                }
            }
            OpCode::Ret => return Ok(stack.pop()),
            _ => unreachable!("scan_compilable excludes every other opcode"),
        }
        pc = next_pc;
    }
}

fn binop(stack: &mut Vec<i32>, f: impl Fn(i32, i32) -> i32) {
    let b = stack.pop().unwrap_or(0);
    let a = stack.pop().unwrap_or(0);
    stack.push(f(a, b));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_count_promotes_through_tiers() {
        let config = VmConfig { tier0_threshold: 2, tier1_threshold: 4, ..VmConfig::default() };
        let mut tiering = Tiering::new(config, 1);
        assert_eq!(tiering.record_call(0), Tier::None);
        assert_eq!(tiering.record_call(0), Tier::Tier0);
        assert_eq!(tiering.record_call(0), Tier::Tier0);
        assert_eq!(tiering.record_call(0), Tier::Tier1);
        let stats = tiering.statistics();
        assert!(stats.compile_ticks_tier0[0].is_some());
        assert!(stats.compile_ticks_tier1[0].is_some());
    }

    #[test]
    fn fast_path_runs_integer_sum() {
        let mut code = Vec::new();
        crate::instruction::encode_into(&mut code, OpCode::Enter, &0u32.to_le_bytes());
        crate::instruction::encode_into(&mut code, OpCode::ConstI32, &2i32.to_le_bytes());
        crate::instruction::encode_into(&mut code, OpCode::ConstI32, &3i32.to_le_bytes());
        crate::instruction::encode_into(&mut code, OpCode::AddI32, &[]);
        crate::instruction::encode_into(&mut code, OpCode::Ret, &[]);
        assert_eq!(run_fast_path(&code, &[], 0), Ok(Some(5)));
    }
}
