//! End-to-end scenarios (§8): each builds a module from SIR source through
//! the full `assemble -> load -> verify -> run` pipeline and checks the
//! observable outcome, the same way `fuel-vm`'s `tests/alu.rs` drives a
//! whole transaction through `Transactor` rather than poking the ALU
//! executor directly.

use rstest::rstest;
use simple_vm::consts::VmConfig;
use simple_vm::loader::load;
use simple_vm::sir::assembler::assemble;
use simple_vm::value::slot;
use simple_vm::verifier::verify;
use simple_vm::{error::RuntimeError, Interpreter};

fn run(source: &str, config: VmConfig) -> Result<simple_vm::RunOutcome, simple_vm::SimpleError> {
    let bytes = assemble(source)?;
    let module = load(&bytes)?;
    let verified = verify(module)?;
    let mut interp = Interpreter::new(verified, config);
    Ok(interp.run()?)
}

#[test]
fn scenario_1_integer_sum() {
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
    let outcome = run(src, VmConfig::default()).expect("module should run to completion");
    assert_eq!(outcome.result.map(slot::to_i32), Some(5));
}

#[test]
fn scenario_2_divide_by_zero_traps() {
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
    let verified = verify(module).unwrap();
    let mut interp = Interpreter::new(verified, VmConfig::default());
    let trapped = interp.run().unwrap_err();
    assert_eq!(trapped.error, RuntimeError::DivByZeroInt);
    assert_eq!(trapped.context.func_index, 0);
    assert_eq!(trapped.context.mnemonic, "div.i32");
}

/// Builds the three-way `jmp.table` module from §8 scenario 3 with `index`
/// baked in as a literal, and checks which case (or the default) wins.
fn jump_table_module(index: i32) -> String {
    format!(
        r#"
        sigs:
          main ret=i32 params=

        func main locals=0 sig=main
          const.i32 {index}
          jmp.table case0,case1 default=deflt
        case0:
          const.i32 1
          ret
        case1:
          const.i32 2
          ret
        deflt:
          const.i32 3
          ret
        end

        entry main
        "#
    )
}

#[rstest]
#[case::case0(0, 1)]
#[case::case1(1, 2)]
#[case::out_of_range_default(5, 3)]
fn scenario_3_jump_table(#[case] index: i32, #[case] expected: i32) {
    let src = jump_table_module(index);
    let outcome = run(&src, VmConfig::default()).expect("module should run to completion");
    pretty_assertions::assert_eq!(outcome.result.map(slot::to_i32), Some(expected));
}

#[test]
fn scenario_4_list_push_pop_round_trip() {
    let src = r#"
        sigs:
          main ret=i32 params=

        func main locals=1 sig=main
          const.i32 4
          newlist i32
          dup
          const.i32 10
          list.push.i32
          dup
          const.i32 20
          list.push.i32
          dup
          list.pop.i32
          stloc 0
          list.len
          ldloc 0
          add.i32
          ret
        end

        entry main
    "#;
    let outcome = run(src, VmConfig::default()).expect("module should run to completion");
    assert_eq!(outcome.result.map(slot::to_i32), Some(21));
}

#[test]
fn scenario_5_gc_safe_point_reclaims_throwaway_strings() {
    let src = r#"
        sigs:
          main ret=i32 params=

        func main locals=2 sig=main
        loop_top:
          ldloc 1
          const.i32 2000
          cmp.lt.i32
          jmp.false done
          const.string "throwaway"
          pop
          ldloc 0
          const.i32 1
          add.i32
          stloc 0
          ldloc 1
          const.i32 1
          add.i32
          stloc 1
          jmp loop_top
        done:
          ldloc 0
          ret
        end

        entry main
    "#;
    // Collect on every safe-point, so each iteration's throwaway string is
    // swept well before the 2000-iteration loop finishes.
    let config = VmConfig { safe_point_interval: 1, ..VmConfig::default() };
    let bytes = assemble(src).unwrap();
    let module = load(&bytes).unwrap();
    let verified = verify(module).unwrap();
    let mut interp = Interpreter::new(verified, config);
    let outcome = interp.run().expect("module should run to completion");
    assert_eq!(outcome.result.map(slot::to_i32), Some(2000));
    assert!(interp.heap_live_count() <= 16, "live count was {}", interp.heap_live_count());
}

#[test]
fn scenario_6_tier_promotion() {
    let src = r#"
        sigs:
          main ret=i32 params=
          inc ret=i32 params=i32

        func inc locals=1 sig=inc
          ldloc 0
          const.i32 1
          add.i32
          ret
        end

        func main locals=2 sig=main
        loop_top:
          ldloc 1
          const.i32 600
          cmp.lt.i32
          jmp.false done
          ldloc 0
          call inc 1
          stloc 0
          ldloc 1
          const.i32 1
          add.i32
          stloc 1
          jmp loop_top
        done:
          ldloc 0
          ret
        end

        entry main
    "#;
    let config = VmConfig { tier0_threshold: 50, tier1_threshold: 500, ..VmConfig::default() };
    let bytes = assemble(src).unwrap();
    let module = load(&bytes).unwrap();
    let verified = verify(module).unwrap();
    let mut interp = Interpreter::new(verified, config);
    let outcome = interp.run().expect("module should run to completion");
    assert_eq!(outcome.result.map(slot::to_i32), Some(600));

    let stats = interp.tiering_statistics();
    let inc_index = 0; // `inc` is declared first, so it is function 0.
    assert_eq!(stats.tiers[inc_index], simple_vm::tiering::Tier::Tier1);
    assert!(stats.compile_ticks_tier0[inc_index].is_some());
    assert!(stats.compile_ticks_tier1[inc_index].is_some());
}

#[test]
fn scenario_6_non_compilable_function_never_runs_fast_path() {
    // `touch_heap` allocates a string, which `COMPILABLE_SUBSET` does not
    // cover, so it must stay on generic dispatch even once tiered up.
    let src = r#"
        sigs:
          main ret=i32 params=
          touch_heap ret=i32 params=

        func touch_heap locals=0 sig=touch_heap
          const.string "x"
          pop
          const.i32 1
          ret
        end

        func main locals=1 sig=main
        loop_top:
          ldloc 0
          const.i32 60
          cmp.lt.i32
          jmp.false done
          call touch_heap 0
          pop
          ldloc 0
          const.i32 1
          add.i32
          stloc 0
          jmp loop_top
        done:
          const.i32 0
          ret
        end

        entry main
    "#;
    let config = VmConfig { tier0_threshold: 10, tier1_threshold: 1000, ..VmConfig::default() };
    let bytes = assemble(src).unwrap();
    let module = load(&bytes).unwrap();
    let verified = verify(module).unwrap();
    let mut interp = Interpreter::new(verified, config);
    interp.run().expect("module should run to completion");

    let stats = interp.tiering_statistics();
    let touch_heap_index = 0;
    assert_eq!(stats.fast_path_executions[touch_heap_index], 0);
}
