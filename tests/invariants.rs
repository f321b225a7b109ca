//! Universal invariants from §8, exercised against small hand-assembled
//! modules rather than the six named scenarios (covered in `scenarios.rs`).

use simple_vm::loader::load;
use simple_vm::sir::assembler::assemble;
use simple_vm::sir::disassembler::disassemble;
use simple_vm::verifier::verify;

const SUM_SOURCE: &str = r#"
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

const BRANCHY_SOURCE: &str = r#"
    sigs:
      main ret=i32 params=

    func main locals=1 sig=main
      ldloc 0
      jmp.true take
      const.i32 1
      ret
    take:
      const.i32 2
      ret
    end

    entry main
"#;

#[test]
fn load_rejects_misaligned_section_offsets() {
    let bytes = assemble(SUM_SOURCE).unwrap();
    let mut tampered = bytes.clone();
    // Section table offset lives at header bytes [12..16); bump it off its
    // 4-byte alignment.
    let misaligned = u32::from_le_bytes(tampered[12..16].try_into().unwrap()) + 1;
    tampered[12..16].copy_from_slice(&misaligned.to_le_bytes());
    assert!(load(&tampered).is_err());
}

#[test]
fn entry_method_id_resolves_to_exactly_one_function() {
    let bytes = assemble(SUM_SOURCE).unwrap();
    let module = load(&bytes).unwrap();
    let matches = module.functions.iter().filter(|f| f.method_id == module.header.entry_method_id).count();
    assert_eq!(matches, 1);
}

#[test]
fn verifying_an_already_verified_module_is_idempotent() {
    let bytes = assemble(BRANCHY_SOURCE).unwrap();
    let module_a = load(&bytes).unwrap();
    let module_b = load(&bytes).unwrap();
    let verified_a = verify(module_a).unwrap();
    let verified_b = verify(module_b).unwrap();
    assert_eq!(verified_a, verified_b);
}

#[test]
fn sir_round_trips_through_disassembly() {
    for source in [SUM_SOURCE, BRANCHY_SOURCE] {
        let bytes = assemble(source).unwrap();
        let module = load(&bytes).unwrap();
        let text = disassemble(&module);
        let bytes2 = assemble(&text).unwrap();
        let module2 = load(&bytes2).unwrap();
        assert_eq!(module.code, module2.code, "round trip diverged for:\n{source}");
    }
}

#[test]
fn stack_merge_disagreement_is_rejected_at_verify_time() {
    // Two predecessors of `join:` leave the stack at different heights
    // (one leaves an extra value behind), which the verifier must reject
    // rather than silently pick one.
    let src = r#"
        sigs:
          main ret=i32 params=

        func main locals=1 sig=main
          ldloc 0
          jmp.true left
          const.i32 1
          jmp join
        left:
          const.i32 1
          const.i32 2
        join:
          ret
        end

        entry main
    "#;
    let bytes = assemble(src).unwrap();
    let module = load(&bytes).unwrap();
    assert!(verify(module).is_err());
}
