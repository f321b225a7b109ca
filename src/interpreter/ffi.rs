//! Import resolution (§4.6 "Imports / FFI").
//!
//! Grounded on `fuel-vm::interpreter::ecal`'s external-call contract: a
//! closed dispatch point the interpreter calls into with a module/symbol
//! pair and already-popped argument slots, getting back either a return
//! slot or a host-supplied error string it turns into a trap.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::RuntimeError;
use crate::heap::{Heap, Object, ObjectKind};
use crate::value::{slot, Slot};

/// Result of a resolved import call: the value to push (if the signature
/// has a return), or a host-supplied failure message.
pub type ImportCallResult = Result<Option<Slot>, String>;

/// Resolves `module.symbol` import calls to host behavior.
///
/// A caller may plug in a custom resolver (e.g. to sandbox FFI entirely, or
/// to back specific `module.symbol` pairs with test doubles); [`BuiltinResolver`]
/// is the default, handling the clock surface and `core.dl`'s dynamic-library
/// lifecycle. `heap` lets a resolver read string arguments (a library path,
/// a symbol name) and allocate string returns (`last_error`) without the
/// interpreter having to marshal them up front.
pub trait ImportResolver {
    /// Invoke `module.symbol` with `args`, returning its result.
    fn call(&mut self, module: &str, symbol: &str, args: &[Slot], heap: &mut Heap) -> ImportCallResult;
}

/// The resolver used when no external one is supplied.
///
/// Covers the monotonic/wall-clock time surface directly, and `core.dl`'s
/// `open`/`sym`/`close`/`last_error` library lifecycle via `libloading`.
/// Filesystem access beyond that is left unresolved (`ImportResolutionFailed`).
/// The `dl_call_*` trampolines that actually invoke a symbol resolved here
/// live on the interpreter's `Intrinsic` dispatch (`run_intrinsic`'s
/// `DL_CALL_*` arms) rather than on the resolver, since by the time a guest
/// calls `dl_call_i32` etc. it only has the raw address — no module/symbol
/// string is involved any more.
#[derive(Default)]
pub struct BuiltinResolver {
    /// Loaded libraries, indexed by `handle - 1` (handle `0` means "no
    /// library"/failed open). A `None` slot is a library `core.dl.close`
    /// already unloaded; its handle stays reserved rather than being reused,
    /// so a stale handle fails cleanly instead of aliasing a new library.
    libraries: Vec<Option<libloading::Library>>,
    last_error: Option<String>,
}

impl std::fmt::Debug for BuiltinResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltinResolver")
            .field("libraries_loaded", &self.libraries.iter().filter(|l| l.is_some()).count())
            .finish()
    }
}

impl ImportResolver for BuiltinResolver {
    fn call(&mut self, module: &str, symbol: &str, args: &[Slot], heap: &mut Heap) -> ImportCallResult {
        match (module, symbol) {
            ("clock", "monotonic_nanos") => {
                let nanos = std::time::Instant::now().elapsed().as_nanos() as i64;
                Ok(Some(slot::from_i64(nanos)))
            }
            ("clock", "wall_clock_nanos") => {
                let nanos = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_nanos() as i64)
                    .map_err(|e| e.to_string())?;
                Ok(Some(slot::from_i64(nanos)))
            }
            ("core.dl", "open") => Ok(Some(self.dl_open(args, heap))),
            ("core.dl", "sym") => Ok(Some(self.dl_sym(args, heap))),
            ("core.dl", "close") => Ok(Some(self.dl_close(args))),
            ("core.dl", "last_error") => Ok(Some(self.dl_last_error(heap))),
            _ => Err(format!("no built-in handler for {module}.{symbol}")),
        }
    }
}

impl BuiltinResolver {
    /// `core.dl.open(path: Ref) -> I64`: `0` on any failure, recorded in
    /// `last_error`.
    fn dl_open(&mut self, args: &[Slot], heap: &Heap) -> Slot {
        let Some(path) = read_heap_string(args[0], heap) else {
            self.last_error = Some("core.dl.open: path is not a string".to_string());
            return slot::from_i64(0);
        };
        match unsafe { libloading::Library::new(&path) } {
            Ok(lib) => {
                self.last_error = None;
                self.libraries.push(Some(lib));
                slot::from_i64(self.libraries.len() as i64)
            }
            Err(e) => {
                self.last_error = Some(e.to_string());
                slot::from_i64(0)
            }
        }
    }

    /// `core.dl.sym(handle: I64, name: Ref) -> I64`: the raw symbol address,
    /// or `0` on any failure.
    fn dl_sym(&mut self, args: &[Slot], heap: &Heap) -> Slot {
        let Some(lib) = self.library(args[0]) else {
            self.last_error = Some("core.dl.sym: invalid library handle".to_string());
            return slot::from_i64(0);
        };
        let Some(name) = read_heap_string(args[1], heap) else {
            self.last_error = Some("core.dl.sym: name is not a string".to_string());
            return slot::from_i64(0);
        };
        match unsafe { lib.get::<*const ()>(name.as_bytes()) } {
            Ok(sym) => {
                self.last_error = None;
                slot::from_i64((*sym as usize) as i64)
            }
            Err(e) => {
                self.last_error = Some(e.to_string());
                slot::from_i64(0)
            }
        }
    }

    /// `core.dl.close(handle: I64) -> I32`: `0` on success, `-1` on an
    /// invalid handle.
    fn dl_close(&mut self, args: &[Slot]) -> Slot {
        let idx = slot::to_i64(args[0]) - 1;
        match self.libraries.get_mut(usize::try_from(idx).unwrap_or(usize::MAX)) {
            Some(slot @ Some(_)) => {
                *slot = None;
                self.last_error = None;
                slot::from_i32(0)
            }
            _ => {
                self.last_error = Some("core.dl.close: invalid library handle".to_string());
                slot::from_i32(-1)
            }
        }
    }

    /// `core.dl.last_error() -> Ref`: a heap string describing the most
    /// recent `open`/`sym`/`close` failure, or a null ref if the last call
    /// succeeded.
    fn dl_last_error(&self, heap: &mut Heap) -> Slot {
        match &self.last_error {
            Some(message) => slot::from_handle(Some(alloc_string(heap, message))),
            None => slot::from_handle(None),
        }
    }

    fn library(&self, handle: Slot) -> Option<&libloading::Library> {
        let idx = slot::to_i64(handle) - 1;
        self.libraries.get(usize::try_from(idx).ok()?)?.as_ref()
    }
}

fn read_heap_string(handle: Slot, heap: &Heap) -> Option<String> {
    let h = slot::to_handle(handle)?;
    let object = heap.get(h, ObjectKind::String).ok()?;
    Some(decode_heap_string(object))
}

fn decode_heap_string(object: &Object) -> String {
    String::from_utf16_lossy(&super::string_units(object))
}

fn alloc_string(heap: &mut Heap, text: &str) -> u32 {
    let units: Vec<u16> = text.encode_utf16().collect();
    let mut payload = (units.len() as u32).to_le_bytes().to_vec();
    for unit in units {
        payload.extend_from_slice(&unit.to_le_bytes());
    }
    heap.allocate(ObjectKind::String, 0, payload, None)
}

/// Resolve an unresolved import call into a [`RuntimeError`].
pub fn unresolved(module: &str, symbol: &str) -> RuntimeError {
    RuntimeError::ImportResolutionFailed {
        module: module.to_string(),
        symbol: symbol.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_resolver_answers_monotonic_clock() {
        let mut resolver = BuiltinResolver::default();
        let mut heap = Heap::new();
        let result = resolver.call("clock", "monotonic_nanos", &[], &mut heap);
        assert!(result.unwrap().is_some());
    }

    #[test]
    fn builtin_resolver_rejects_unknown_symbol() {
        let mut resolver = BuiltinResolver::default();
        let mut heap = Heap::new();
        assert!(resolver.call("fs", "read_file", &[], &mut heap).is_err());
    }

    #[test]
    fn dl_open_with_non_string_path_fails_without_panicking() {
        let mut resolver = BuiltinResolver::default();
        let mut heap = Heap::new();
        let result = resolver.call("core.dl", "open", &[slot::from_handle(None)], &mut heap);
        assert_eq!(result.unwrap(), Some(slot::from_i64(0)));
    }

    #[test]
    fn dl_sym_with_unknown_handle_fails_without_panicking() {
        let mut resolver = BuiltinResolver::default();
        let mut heap = Heap::new();
        let name_handle = alloc_string(&mut heap, "whatever");
        let args = [slot::from_i64(999), slot::from_handle(Some(name_handle))];
        let result = resolver.call("core.dl", "sym", &args, &mut heap);
        assert_eq!(result.unwrap(), Some(slot::from_i64(0)));
    }

    #[test]
    fn dl_close_with_invalid_handle_reports_failure() {
        let mut resolver = BuiltinResolver::default();
        let mut heap = Heap::new();
        let result = resolver.call("core.dl", "close", &[slot::from_i64(42)], &mut heap);
        assert_eq!(result.unwrap(), Some(slot::from_i32(-1)));
    }

    #[test]
    fn last_error_is_null_before_any_failure() {
        let resolver = BuiltinResolver::default();
        let mut heap = Heap::new();
        assert_eq!(resolver.dl_last_error(&mut heap), slot::from_handle(None));
    }
}
