//! Error types for every stage of the toolchain.
//!
//! The shape follows `fuel-vm::error`: a closed, numbered leaf enum
//! (`RuntimeError`, playing the role of `fuel-asm::PanicReason`) composed
//! into richer per-stage enums (`LoadError`, `VerifyError`) with
//! `derive_more::Display`, and a `Trapped` wrapper that carries the rich
//! call-context §4.6 demands instead of a bare error value.

use std::fmt;

/// Structural problems found while parsing an SBC container (§7, `Load`).
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum LoadError {
    /// Header magic did not match.
    #[display(fmt = "bad magic: expected {expected:#x}, found {found:#x}")]
    BadMagic {
        /// Expected magic number.
        expected: u32,
        /// Magic number found in the header.
        found: u32,
    },
    /// Header version is not supported by this runtime.
    #[display(fmt = "unsupported version {found}")]
    UnsupportedVersion {
        /// Version found in the header.
        found: u16,
    },
    /// Header `endian` field was not `1` (little-endian).
    #[display(fmt = "unsupported endianness byte {found:#x}")]
    UnsupportedEndian {
        /// Byte found in the header.
        found: u8,
    },
    /// A reserved header field was non-zero.
    #[display(fmt = "reserved header field must be zero")]
    ReservedNotZero,
    /// A section offset was not 4-byte aligned (invariant I1).
    #[display(fmt = "section {id} offset {offset:#x} is not 4-aligned")]
    MisalignedSection {
        /// Section id.
        id: u32,
        /// Offset found.
        offset: u32,
    },
    /// Two sections occupy overlapping byte ranges (invariant I1).
    #[display(fmt = "section {a} overlaps section {b}")]
    OverlappingSections {
        /// First section id.
        a: u32,
        /// Second section id.
        b: u32,
    },
    /// The section directory named the same section id twice.
    #[display(fmt = "duplicate section id {id}")]
    DuplicateSection {
        /// Offending section id.
        id: u32,
    },
    /// A section id byte did not match any known section.
    #[display(fmt = "unknown section id {id}")]
    UnknownSection {
        /// Offending id.
        id: u32,
    },
    /// A row table's byte range was not an exact multiple of its row width.
    #[display(fmt = "section {id} size {size} is not a multiple of row width {row_width}")]
    RowSizeMismatch {
        /// Section id.
        id: u32,
        /// Section byte size.
        size: u32,
        /// Expected row width.
        row_width: u32,
    },
    /// A function's `code_offset` did not match exactly one method row
    /// (invariant I2).
    #[display(fmt = "function {index} code_offset {offset:#x} matches no method row")]
    DanglingFunctionCode {
        /// Function row index.
        index: u32,
        /// Offending code offset.
        offset: u32,
    },
    /// Two function code ranges overlap (invariant I2).
    #[display(fmt = "function {a} and function {b} code ranges overlap")]
    OverlappingFunctionCode {
        /// First function index.
        a: u32,
        /// Second function index.
        b: u32,
    },
    /// `entry_method_id` did not resolve to exactly one function row.
    #[display(fmt = "entry method id {id} does not resolve to a function")]
    BadEntryMethod {
        /// Offending method id.
        id: u32,
    },
    /// A const-pool entry's kind word was not recognised.
    #[display(fmt = "const pool entry {index} has unknown kind {kind}")]
    BadConstKind {
        /// Entry index.
        index: u32,
        /// Offending kind word.
        kind: u32,
    },
    /// A const-pool entry's payload length did not match its kind
    /// (invariant I4).
    #[display(fmt = "const pool entry {index} has wrong payload length {found}, expected {expected}")]
    BadConstLength {
        /// Entry index.
        index: u32,
        /// Length found.
        found: u32,
        /// Length required by the kind.
        expected: u32,
    },
    /// A string const's byte offset pointed outside the const blob region.
    #[display(fmt = "string const at offset {offset} is out of bounds")]
    BadStringOffset {
        /// Offending offset.
        offset: u32,
    },
    /// A string const's bytes were not valid UTF-8.
    #[display(fmt = "string const at offset {offset} is not valid UTF-8")]
    InvalidUtf8 {
        /// Offending offset.
        offset: u32,
    },
    /// The byte buffer ended before a fixed-width field could be read.
    #[display(fmt = "unexpected end of buffer while reading {context}")]
    UnexpectedEof {
        /// What was being read.
        context: String,
    },
    /// A byte in a function's code range did not name a known opcode
    /// (invariant I3).
    #[display(fmt = "function {function}: byte {byte:#x} at pc {pc} is not a known opcode")]
    UnknownOpcode {
        /// Function row index.
        function: u32,
        /// Program counter of the offending byte.
        pc: u32,
        /// The offending byte.
        byte: u8,
    },
    /// An opcode's operand bytes ran past the end of the function's code
    /// range (invariant I3).
    #[display(fmt = "function {function}: truncated instruction at pc {pc}")]
    TruncatedInstruction {
        /// Function row index.
        function: u32,
        /// Program counter of the offending opcode.
        pc: u32,
    },
}

/// Failures found while assembling SIR text into SBC bytes (§4.9). Kept
/// separate from `LoadError`/`VerifyError`: these are syntax/reference
/// problems in the *textual* source, not the binary container.
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum AssembleError {
    /// A line could not be tokenized at all.
    #[display(fmt = "line {line}: {message}")]
    Syntax {
        /// 1-based source line number.
        line: u32,
        /// What went wrong.
        message: String,
    },
    /// An opcode mnemonic was not recognised.
    #[display(fmt = "line {line}: unknown mnemonic {mnemonic:?}")]
    UnknownMnemonic {
        /// 1-based source line number.
        line: u32,
        /// The offending token.
        mnemonic: String,
    },
    /// An instruction had the wrong number of operand tokens for its
    /// mnemonic.
    #[display(fmt = "line {line}: {mnemonic} expects {expected} operand(s), found {found}")]
    WrongOperandCount {
        /// 1-based source line number.
        line: u32,
        /// The mnemonic.
        mnemonic: String,
        /// Operand tokens the mnemonic requires.
        expected: usize,
        /// Operand tokens found.
        found: usize,
    },
    /// A jump/call/field/type/sig/function reference named something that
    /// was never declared.
    #[display(fmt = "line {line}: undefined {kind} {name:?}")]
    UndefinedReference {
        /// 1-based source line number.
        line: u32,
        /// `"label"`, `"function"`, `"sig"`, `"type"`, `"field"`, or
        /// `"intrinsic"`.
        kind: &'static str,
        /// The offending name.
        name: String,
    },
    /// A numeric operand token did not parse as the type it needed to.
    #[display(fmt = "line {line}: invalid {what} literal {text:?}")]
    InvalidLiteral {
        /// 1-based source line number.
        line: u32,
        /// What kind of literal was expected.
        what: &'static str,
        /// The offending token text.
        text: String,
    },
    /// A `func` block was missing its terminating `end`.
    #[display(fmt = "function {name:?} is missing its terminating `end`")]
    UnterminatedFunction {
        /// The function's name.
        name: String,
    },
    /// No `entry NAME` line was found.
    #[display(fmt = "module has no entry point")]
    MissingEntry,
}

impl std::error::Error for AssembleError {}

/// Failures found during §4.4 abstract interpretation (§7, `Verify`).
#[derive(Debug, Clone, PartialEq, Eq, derive_more::Display)]
pub enum VerifyError {
    /// Two predecessors of a merge point disagree on stack height.
    #[display(
        fmt = "function {func}: stack height mismatch at pc {pc}: {a} vs {b}"
    )]
    StackHeightMismatch {
        /// Function index.
        func: u32,
        /// Program counter of the merge point.
        pc: u32,
        /// Height observed from one predecessor.
        a: u32,
        /// Height observed from another predecessor.
        b: u32,
    },
    /// Two predecessors of a merge point disagree on a slot's lane.
    #[display(fmt = "function {func}: lane mismatch at pc {pc}, stack slot {slot}")]
    LaneMismatch {
        /// Function index.
        func: u32,
        /// Program counter of the merge point.
        pc: u32,
        /// Operand-stack slot index (from the bottom) that disagreed.
        slot: u32,
    },
    /// An opcode popped from an operand stack that was shorter than its
    /// descriptor requires.
    #[display(fmt = "function {func}: stack underflow at pc {pc}")]
    StackUnderflow {
        /// Function index.
        func: u32,
        /// Program counter of the offending opcode.
        pc: u32,
    },
    /// A jump target (direct or via `JmpTable`) fell outside the function's
    /// code range.
    #[display(fmt = "function {func}: jump at pc {pc} targets out-of-range pc {target}")]
    JumpOutOfRange {
        /// Function index.
        func: u32,
        /// Program counter of the jump opcode.
        pc: u32,
        /// Computed (out of range) target.
        target: i64,
    },
    /// An opcode referenced a const-pool entry of the wrong kind or out of
    /// range.
    #[display(fmt = "function {func}: bad const pool reference {const_idx} at pc {pc}")]
    BadConstRef {
        /// Function index.
        func: u32,
        /// Program counter.
        pc: u32,
        /// Offending const-pool index.
        const_idx: u32,
    },
    /// An opcode's operand bytes ran past the end of the function's code.
    #[display(fmt = "function {func}: truncated operand at pc {pc}")]
    TruncatedOperand {
        /// Function index.
        func: u32,
        /// Program counter.
        pc: u32,
    },
    /// A function's code did not begin with `Enter`.
    #[display(fmt = "function {func}: missing leading Enter")]
    MissingEnter {
        /// Function index.
        func: u32,
    },
    /// A local slot was observed to be assigned both `Ref` and non-`Ref`
    /// lanes across the function.
    #[display(fmt = "function {func}: local {local} has conflicting lanes")]
    ConflictingLocalLane {
        /// Function index.
        func: u32,
        /// Offending local slot index.
        local: u32,
    },
    /// A function's code range overlapped another function's (duplicate of
    /// the loader's I2 check, re-asserted at verification time).
    #[display(fmt = "function {a} and function {b} code ranges overlap")]
    CrossFunctionOverlap {
        /// First function index.
        a: u32,
        /// Second function index.
        b: u32,
    },
    /// `Call`/`TailCall` named a function index with no function row.
    #[display(fmt = "function {func}: call at pc {pc} targets unknown function {target}")]
    UnknownCallTarget {
        /// Function index.
        func: u32,
        /// Program counter.
        pc: u32,
        /// Offending target.
        target: u32,
    },
    /// `Call`/`CallIndirect`/`TailCall`'s `arg_count` operand did not match
    /// the callee signature's `param_count`.
    #[display(
        fmt = "function {func}: call at pc {pc} passes {found} args, callee expects {expected}"
    )]
    CallArityMismatch {
        /// Function index.
        func: u32,
        /// Program counter.
        pc: u32,
        /// Arg count the callee's signature expects.
        expected: u32,
        /// Arg count the instruction's operand supplied.
        found: u32,
    },
    /// `Intrinsic`'s id named no known builtin.
    #[display(fmt = "function {func}: unknown intrinsic id {id} at pc {pc}")]
    UnknownIntrinsic {
        /// Function index.
        func: u32,
        /// Program counter.
        pc: u32,
        /// Offending id.
        id: u32,
    },
    /// `NewArray`/`NewList`'s element-kind operand byte named no known kind.
    #[display(fmt = "function {func}: bad element kind tag {tag} at pc {pc}")]
    BadElementTag {
        /// Function index.
        func: u32,
        /// Program counter.
        pc: u32,
        /// Offending tag byte.
        tag: u8,
    },
}

/// Errors that occur while interpreting already-verified bytecode (§7,
/// `Runtime`), or are raised by the guest (`Trap`) or a failing import
/// resolver (`HostImportError`).
#[derive(Debug, Clone, PartialEq, derive_more::Display)]
pub enum RuntimeError {
    /// Integer division or modulo by zero.
    #[display(fmt = "integer division by zero")]
    DivByZeroInt,
    /// `ListPush` onto a list already at its fixed capacity.
    #[display(fmt = "list push overflow: capacity {capacity} exceeded")]
    ListPushOverflow {
        /// The list's fixed capacity.
        capacity: u32,
    },
    /// Array, list, or string index out of bounds.
    #[display(fmt = "index {index} out of bounds (length {length})")]
    IndexOutOfBounds {
        /// Offending index.
        index: i64,
        /// Container length at the time of the access.
        length: u32,
    },
    /// A null reference was dereferenced.
    #[display(fmt = "null reference dereferenced")]
    NullDereference,
    /// A heap handle did not refer to the object kind the opcode expected.
    #[display(fmt = "handle {handle} has kind {found}, expected {expected}")]
    WrongObjectKind {
        /// Offending handle.
        handle: u32,
        /// Object kind found.
        found: &'static str,
        /// Object kind the opcode required.
        expected: &'static str,
    },
    /// `TailCall`/`Call`/`CallIndirect` targeted a function index or
    /// closure method id with no function row.
    #[display(fmt = "call target {target} is not a known method")]
    UnknownMethod {
        /// Offending target.
        target: u32,
    },
    /// `Load/StoreUpvalue` executed in a frame with no closure.
    #[display(fmt = "upvalue access with no active closure")]
    NoActiveClosure,
    /// An import's module/symbol name pair was not resolved by any
    /// resolver.
    #[display(fmt = "import {module}.{symbol} could not be resolved")]
    ImportResolutionFailed {
        /// Import's module name.
        module: String,
        /// Import's symbol name.
        symbol: String,
    },
    /// An `Intrinsic` or `SysCall` id had no known handler.
    #[display(fmt = "unsupported {kind} id {id}")]
    UnsupportedBuiltin {
        /// `"intrinsic"` or `"syscall"`.
        kind: &'static str,
        /// Offending id.
        id: u32,
    },
    /// `CallCheck` executed from a non-root frame.
    #[display(fmt = "CallCheck executed from a non-root frame")]
    CallCheckFromNonRoot,
    /// Guest call nesting exceeded `VmConfig::max_call_depth`.
    #[display(fmt = "call depth exceeded")]
    CallDepthExceeded,
    /// A heap allocation request exceeded the handle table's capacity.
    #[display(fmt = "heap exhausted")]
    HeapExhausted,
    /// An explicit `Intrinsic Trap code=` raised by the guest.
    #[display(fmt = "guest trap, code {code}")]
    GuestTrap {
        /// Guest-supplied trap code.
        code: i64,
    },
    /// An import resolver explicitly rejected a call.
    #[display(fmt = "host import error: {message}")]
    HostImportError {
        /// Message returned by the resolver.
        message: String,
    },
}

impl std::error::Error for RuntimeError {}
impl std::error::Error for LoadError {}
impl std::error::Error for VerifyError {}

/// A single entry in a trap's caller chain (§4.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrapFrame {
    /// Index of the function this frame is executing.
    pub func_index: u32,
    /// Function name, if the debug section carried one.
    pub name: Option<String>,
    /// Source line of the last-executed `Line` opcode in this frame, if any.
    pub line: Option<u32>,
    /// Source column of the last-executed `Line` opcode in this frame, if
    /// any.
    pub column: Option<u32>,
}

/// A decoded view of the operands of the opcode that caused a trap, when the
/// opcode is one §4.6 calls out specifically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedOperand {
    /// `Call`/`CallIndirect`/`TailCall`.
    Call {
        /// Call target (function or signature id, per opcode).
        target: u32,
        /// Argument count popped.
        arity: u32,
    },
    /// `Jmp`/`JmpTrue`/`JmpFalse`.
    Jump {
        /// Signed PC-relative offset as encoded.
        rel: i32,
        /// Resolved absolute program counter.
        resolved_target: u32,
    },
    /// `JmpTable`.
    JumpTable {
        /// Const-pool index of the jump table blob.
        const_idx: u32,
        /// Default relative offset.
        default_rel: i32,
    },
}

/// The full structured context attached to every trap (§4.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrapContext {
    /// Index of the function executing when the trap occurred.
    pub func_index: u32,
    /// Program counter, relative to the function's code start.
    pub pc: u32,
    /// The opcode byte that was executing.
    pub opcode_byte: u8,
    /// The opcode's mnemonic.
    pub mnemonic: &'static str,
    /// Decoded operands, for the opcodes §4.6 calls out.
    pub decoded: Option<DecodedOperand>,
    /// Source line, if a `Line` opcode has run in this frame.
    pub line: Option<u32>,
    /// Source column, if a `Line` opcode has run in this frame.
    pub column: Option<u32>,
    /// The full caller chain, innermost (the trapping frame) first.
    pub call_chain: Vec<TrapFrame>,
}

impl fmt::Display for TrapContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "at {} (func {}, pc {})",
            self.mnemonic, self.func_index, self.pc
        )?;
        if let Some(line) = self.line {
            write!(f, " [line {line}:{}]", self.column.unwrap_or(0))?;
        }
        if let Some(decoded) = &self.decoded {
            match decoded {
                DecodedOperand::Call { target, arity } => {
                    write!(f, " call target={target} arity={arity}")?
                }
                DecodedOperand::Jump { rel, resolved_target } => {
                    write!(f, " jump rel={rel} -> pc={resolved_target}")?
                }
                DecodedOperand::JumpTable { const_idx, default_rel } => write!(
                    f,
                    " jump table const={const_idx} default_rel={default_rel}"
                )?,
            }
        }
        for frame in &self.call_chain {
            write!(f, "\n  called from func {}", frame.func_index)?;
            if let Some(name) = &frame.name {
                write!(f, " ({name})")?;
            }
            if let Some(line) = frame.line {
                write!(f, " [line {line}:{}]", frame.column.unwrap_or(0))?;
            }
        }
        Ok(())
    }
}

/// A runtime failure paired with the structured context that produced it.
/// Returned as a value; the interpreter never panics or aborts (§4.6, §7).
#[derive(Debug, Clone, PartialEq)]
pub struct Trapped {
    /// The underlying error.
    pub error: RuntimeError,
    /// Where and how it happened.
    pub context: TrapContext,
}

impl fmt::Display for Trapped {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.error, self.context)
    }
}

impl std::error::Error for Trapped {}

/// Top-level result of any toolchain stage.
#[derive(Debug, Clone, PartialEq, derive_more::Display)]
pub enum SimpleError {
    /// Failed to assemble SIR text into SBC bytes.
    #[display(fmt = "assemble error: {_0}")]
    Assemble(AssembleError),
    /// Failed to parse the SBC container.
    #[display(fmt = "load error: {_0}")]
    Load(LoadError),
    /// Failed abstract interpretation.
    #[display(fmt = "verify error: {_0}")]
    Verify(VerifyError),
    /// Failed during interpretation.
    #[display(fmt = "runtime error: {_0}")]
    Runtime(Trapped),
}

impl std::error::Error for SimpleError {}

impl From<AssembleError> for SimpleError {
    fn from(e: AssembleError) -> Self {
        Self::Assemble(e)
    }
}

impl From<LoadError> for SimpleError {
    fn from(e: LoadError) -> Self {
        Self::Load(e)
    }
}

impl From<VerifyError> for SimpleError {
    fn from(e: VerifyError) -> Self {
        Self::Verify(e)
    }
}

impl From<Trapped> for SimpleError {
    fn from(e: Trapped) -> Self {
        Self::Runtime(e)
    }
}

/// Convenience alias used throughout the loader.
pub type LoadResult<T> = Result<T, LoadError>;
/// Convenience alias used throughout the verifier.
pub type VerifyResult<T> = Result<T, VerifyError>;
/// Convenience alias used throughout the interpreter; `Err` always carries
/// full trap context.
pub type RunResult<T> = Result<T, Trapped>;
/// Convenience alias for bare (context-free) runtime failures, used by
/// leaf helpers like [`crate::heap::Heap`] that don't have a `pc`/frame to
/// attach; callers wrap these into a [`Trapped`] with [`TrapContext`] at the
/// dispatch loop.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
/// Convenience alias for callers driving the whole assemble/load/verify/run
/// pipeline, who don't want to match on which stage failed.
pub type SimpleResult<T> = Result<T, SimpleError>;
