//! `simple-vm`: the bytecode container, loader, verifier, and tiered
//! interpreter for the Simple language (see `SPEC_FULL.md`).
//!
//! The pipeline from source text to a finished run is:
//!
//! ```text
//! sir::assembler::assemble  ->  loader::load  ->  verifier::verify  ->  Interpreter::run
//! ```
//!
//! Every stage is fallible and composes into a single [`error::SimpleError`]
//! via `?`; nothing downstream of `load` trusts a `Module` it hasn't already
//! passed through `verify`, matching `fuel-vm`'s "no unchecked transaction
//! reaches the interpreter" discipline.

pub mod const_pool;
pub mod consts;
pub mod error;
pub mod heap;
pub mod instruction;
pub mod interpreter;
pub mod intrinsics;
pub mod loader;
pub mod opcode;
pub mod sbc;
pub mod sir;
pub mod tiering;
pub mod value;
pub mod verifier;

pub use error::{SimpleError, SimpleResult};
pub use interpreter::{Interpreter, RunOutcome};
pub use sbc::Module;
pub use verifier::VerifiedModule;

/// Run SIR source text end to end: assemble, load, verify, execute.
///
/// Convenience wrapper over the four pipeline stages for callers (tests,
/// CLIs) that don't need to inspect the intermediate `Module`/`VerifiedModule`.
pub fn run_source(source: &str, config: consts::VmConfig) -> Result<RunOutcome, SimpleError> {
    let bytes = sir::assembler::assemble(source)?;
    let module = loader::load(&bytes)?;
    let verified = verifier::verify(module)?;
    let mut interp = Interpreter::new(verified, config);
    interp.run().map_err(SimpleError::from)
}
