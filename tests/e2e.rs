// tests/e2e.rs
//
// End-to-end: parse a text module, compile it to native code, and
// call exported functions through the invoke path.

use marmot::ast::Literal;
use marmot::codegen::JitOptions;
use marmot::frontend::parse_file;
use marmot::runtime::{Instance, intrinsics};

fn instantiate(source: &str) -> Instance {
    let mut file = parse_file(source);
    assert!(file.errors.is_empty(), "parse errors: {:?}", file.errors);
    let module = file.modules.remove(0);
    Instance::instantiate(module, &JitOptions::default()).expect("instantiate")
}

fn invoke_i32(instance: &Instance, name: &str, args: &[Literal]) -> u32 {
    match instance.invoke(name, args).expect("invoke") {
        Some(Literal::I32(v)) => v,
        other => panic!("expected i32 result, got {:?}", other),
    }
}

#[test]
fn increment_returns_42() {
    let instance = instantiate(
        r#"(module
            (func $f (param i32) (result i32)
                (return (add.i32 (get_local 0) (const.i32 1))))
            (export "inc" $f))"#,
    );
    assert_eq!(invoke_i32(&instance, "inc", &[Literal::I32(41)]), 42);
}

#[test]
fn data_segment_byte_load() {
    let instance = instantiate(
        r#"(module (memory 1024 (segment 0 "abc"))
            (func $f (result i32) (return (load.i8_u (const.i32 1))))
            (export "g" $f))"#,
    );
    assert_eq!(invoke_i32(&instance, "g", &[]), 98);
}

#[test]
fn switch_selects_arm_by_key() {
    let instance = instantiate(
        r#"(module
            (func $f (param i32) (result i32)
                (return (switch.i32 (get_local 0)
                    (case 0 (const.i32 10))
                    (case 1 (const.i32 20))
                    (const.i32 99))))
            (export "sel" $f))"#,
    );
    assert_eq!(invoke_i32(&instance, "sel", &[Literal::I32(0)]), 10);
    assert_eq!(invoke_i32(&instance, "sel", &[Literal::I32(1)]), 20);
    assert_eq!(invoke_i32(&instance, "sel", &[Literal::I32(7)]), 99);
}

#[test]
fn switch_fallthrough_runs_into_next_arm() {
    let instance = instantiate(
        r#"(module
            (func $f (param i32) (result i32) (local $acc i32)
                (return (switch.i32 (get_local 0)
                    (case 0 (set_local $acc (const.i32 100)) fallthrough)
                    (case 1 (add.i32 (get_local $acc) (const.i32 20)))
                    (const.i32 99))))
            (export "f" $f))"#,
    );
    // Key 0 sets acc then falls into arm 1.
    assert_eq!(invoke_i32(&instance, "f", &[Literal::I32(0)]), 120);
    assert_eq!(invoke_i32(&instance, "f", &[Literal::I32(1)]), 20);
    assert_eq!(invoke_i32(&instance, "f", &[Literal::I32(5)]), 99);
}

#[test]
fn loop_counts_down_to_zero() {
    let instance = instantiate(
        r#"(module
            (func $f (result i32) (local $i i32)
                (set_local $i (const.i32 10))
                (loop $done $next
                    (if (eq.i32 (get_local $i) (const.i32 0))
                        (break $done))
                    (set_local $i (sub.i32 (get_local $i) (const.i32 1))))
                (return (get_local $i)))
            (export "f" $f))"#,
    );
    assert_eq!(invoke_i32(&instance, "f", &[]), 0);
}

#[test]
fn indirect_call_masks_the_index() {
    let instance = instantiate(
        r#"(module
            (func $f0 (result i32) (return (const.i32 0)))
            (func $f1 (result i32) (return (const.i32 1)))
            (func $f2 (result i32) (return (const.i32 2)))
            (func $f3 (result i32) (return (const.i32 3)))
            (table $t $f0 $f1 $f2 $f3)
            (func $dispatch (param i32) (result i32)
                (return (call_indirect $t (get_local 0))))
            (export "dispatch" $dispatch))"#,
    );
    // In-range indices dispatch directly.
    assert_eq!(invoke_i32(&instance, "dispatch", &[Literal::I32(1)]), 1);
    assert_eq!(invoke_i32(&instance, "dispatch", &[Literal::I32(3)]), 3);
    // Out-of-range index 6 wraps to table[6 & 3] = table[2].
    assert_eq!(invoke_i32(&instance, "dispatch", &[Literal::I32(6)]), 2);
}

#[test]
fn missing_import_fails_with_full_signature() {
    let mut file = parse_file(
        r#"(module
            (import $nope "_does_not_exist" (param i32 i32) (result i32))
            (func $f (result i32)
                (return (call_import $nope (const.i32 1) (const.i32 2))))
            (export "f" $f))"#,
    );
    assert!(file.errors.is_empty(), "parse errors: {:?}", file.errors);
    let module = file.modules.remove(0);
    let error = Instance::instantiate(module, &JitOptions::default())
        .err()
        .expect("link failure");
    let message = error.to_string();
    assert!(message.contains("_does_not_exist"), "message: {}", message);
    assert!(message.contains("(i32,i32) -> i32"), "message: {}", message);
}

extern "C" fn e2e_add(a: i32, b: i32) -> i32 {
    a.wrapping_add(b)
}

#[test]
fn imported_function_calls_the_registered_host_function() {
    intrinsics::register_function(
        "test_e2e_add",
        marmot::ast::FunctionType::new(
            marmot::ast::TypeId::I32,
            vec![marmot::ast::TypeId::I32, marmot::ast::TypeId::I32],
        ),
        e2e_add as *const u8,
    );
    let instance = instantiate(
        r#"(module
            (import $add "test_e2e_add" (param i32 i32) (result i32))
            (func $f (result i32)
                (return (call_import $add (const.i32 40) (const.i32 2))))
            (export "f" $f))"#,
    );
    assert_eq!(invoke_i32(&instance, "f", &[]), 42);
}

#[test]
fn sbrk_import_reports_initial_break() {
    let instance = instantiate(
        r#"(module (memory 65536)
            (import $sbrk "_sbrk" (param i32) (result i32))
            (func $f (result i32)
                (return (call_import $sbrk (const.i32 0))))
            (export "f" $f))"#,
    );
    assert_eq!(invoke_i32(&instance, "f", &[]), 65536);
}

#[test]
fn imported_global_binds_to_intrinsic_storage() {
    let instance = instantiate(
        r#"(module
            (import $top "STACKTOP" i32)
            (func $f (result i32) (return (load_global $top)))
            (export "f" $f))"#,
    );
    assert_eq!(invoke_i32(&instance, "f", &[]), 512 * 1024);
}

#[test]
fn globals_persist_across_calls() {
    let instance = instantiate(
        r#"(module
            (global $g i32)
            (func $f (result i32)
                (store_global $g (add.i32 (load_global $g) (const.i32 1)))
                (return (load_global $g)))
            (export "bump" $f))"#,
    );
    assert_eq!(invoke_i32(&instance, "bump", &[]), 1);
    assert_eq!(invoke_i32(&instance, "bump", &[]), 2);
    assert_eq!(invoke_i32(&instance, "bump", &[]), 3);
}

#[test]
fn direct_calls_resolve_forward_references() {
    let instance = instantiate(
        r#"(module
            (func $f (result i32) (return (call $g (const.i32 20))))
            (func $g (param i32) (result i32)
                (return (mul.i32 (get_local 0) (const.i32 2))))
            (export "f" $f))"#,
    );
    assert_eq!(invoke_i32(&instance, "f", &[]), 40);
}

#[test]
fn float_arithmetic_and_conversion() {
    let instance = instantiate(
        r#"(module
            (func $f (param f64) (result i32)
                (return (trunc_s.i32.f64 (sqrt.f64 (get_local 0)))))
            (export "isqrt" $f))"#,
    );
    assert_eq!(invoke_i32(&instance, "isqrt", &[Literal::F64(81.0)]), 9);
}

#[test]
fn float_results_round_trip() {
    let instance = instantiate(
        r#"(module
            (func $f (param f32 f32) (result f32)
                (return (add.f32 (get_local 0) (get_local 1))))
            (export "addf" $f))"#,
    );
    let result = instance
        .invoke("addf", &[Literal::F32(1.5), Literal::F32(2.25)])
        .unwrap();
    assert_eq!(result, Some(Literal::F32(3.75)));
}

#[test]
fn sub_width_stores_and_sign_extension() {
    let instance = instantiate(
        r#"(module (memory 4096)
            (func $f (result i32)
                (store.i8 (const.i32 16) (const.i32 255))
                (return (load.i8_s (const.i32 16))))
            (export "f" $f)
            (func $g (result i32)
                (store.i8 (const.i32 17) (const.i32 255))
                (return (load.i8_u (const.i32 17))))
            (export "g" $g))"#,
    );
    assert_eq!(invoke_i32(&instance, "f", &[]), 0xFFFF_FFFF);
    assert_eq!(invoke_i32(&instance, "g", &[]), 255);
}

#[test]
fn far_addressed_memory_access() {
    let instance = instantiate(
        r#"(module (memory 4096)
            (func $f (result i32)
                (store_far.i32 (const.i64 64) (const.i32 7))
                (return (load_far.i32 (const.i64 64))))
            (export "f" $f))"#,
    );
    assert_eq!(invoke_i32(&instance, "f", &[]), 7);
}

#[test]
fn wild_address_is_masked_into_the_sandbox() {
    // Address -4 zero-extends to 0xFFFFFFFC and masks into the
    // address space instead of reaching behind the base pointer.
    let instance = instantiate(
        r#"(module (memory 4096)
            (func $f (result i32) (return (load.i32 (const.i32 -4))))
            (export "f" $f))"#,
    );
    assert_eq!(invoke_i32(&instance, "f", &[]), 0);
}

#[test]
fn access_beyond_committed_memory_traps() {
    let instance = instantiate(
        r#"(module (memory 4096 65536)
            (func $f (result i32) (return (load.i32 (const.i32 32768))))
            (export "f" $f))"#,
    );
    let error = instance.invoke("f", &[]).unwrap_err();
    assert!(error.to_string().contains("trap"), "error: {}", error);
}

#[test]
fn division_by_zero_traps() {
    let instance = instantiate(
        r#"(module
            (func $f (param i32) (result i32)
                (return (div_s.i32 (get_local 0) (const.i32 0))))
            (export "f" $f))"#,
    );
    assert!(instance.invoke("f", &[Literal::I32(10)]).is_err());
}

#[test]
fn bool_operators_reach_integer_results() {
    let instance = instantiate(
        r#"(module
            (func $f (param i32) (result i32)
                (return (and.bool
                    (gt_s.i32 (get_local 0) (const.i32 0))
                    (lt_s.i32 (get_local 0) (const.i32 10)))))
            (export "in_range" $f))"#,
    );
    assert_eq!(invoke_i32(&instance, "in_range", &[Literal::I32(5)]), 1);
    assert_eq!(invoke_i32(&instance, "in_range", &[Literal::I32(50)]), 0);
}

#[test]
fn labels_yield_branch_values() {
    let instance = instantiate(
        r#"(module
            (func $f (param i32) (result i32)
                (return (label $out
                    (if (eq.i32 (get_local 0) (const.i32 0))
                        (break $out (const.i32 111)))
                    (const.i32 222))))
            (export "f" $f))"#,
    );
    assert_eq!(invoke_i32(&instance, "f", &[Literal::I32(0)]), 111);
    assert_eq!(invoke_i32(&instance, "f", &[Literal::I32(1)]), 222);
}

#[test]
fn void_exports_return_nothing() {
    let instance = instantiate(
        r#"(module
            (func $f (nop))
            (export "f" $f))"#,
    );
    assert_eq!(instance.invoke("f", &[]).unwrap(), None);
}

#[test]
fn invoking_an_unknown_export_is_an_error() {
    let instance = instantiate(r#"(module (func $f (nop)) (export "f" $f))"#);
    assert!(instance.invoke("missing", &[]).is_err());
}

#[test]
fn assert_eq_records_drive_the_instance() {
    let mut file = parse_file(
        r#"(module
            (func $f (param i32) (result i32)
                (return (mul.i32 (get_local 0) (get_local 0))))
            (export "square" $f))
           (assert_eq (invoke "square" (const.i32 5)) (const.i32 25))
           (assert_eq (invoke "square" (const.i32 9)) (const.i32 81))"#,
    );
    assert!(file.errors.is_empty(), "parse errors: {:?}", file.errors);
    assert_eq!(file.assert_eqs.len(), 2);
    let module = file.modules.remove(0);
    let instance = Instance::instantiate(module, &JitOptions::default()).unwrap();
    for assertion in &file.assert_eqs {
        let actual = instance
            .invoke_function(assertion.function_index, &assertion.args)
            .unwrap();
        assert_eq!(actual, Some(assertion.expected));
    }
}

#[test]
fn release_mode_produces_the_same_answers() {
    let mut file = parse_file(
        r#"(module
            (func $f (param i32) (result i32) (local $acc i32) (local $i i32)
                (set_local $acc (const.i32 0))
                (set_local $i (const.i32 0))
                (loop $done $next
                    (if (eq.i32 (get_local $i) (get_local 0)) (break $done))
                    (set_local $acc (add.i32 (get_local $acc) (get_local $i)))
                    (set_local $i (add.i32 (get_local $i) (const.i32 1))))
                (return (get_local $acc)))
            (export "sum" $f))"#,
    );
    assert!(file.errors.is_empty(), "parse errors: {:?}", file.errors);
    let module = file.modules.remove(0);
    let options = JitOptions {
        release: true,
        ..JitOptions::default()
    };
    let instance = Instance::instantiate(module, &options).unwrap();
    assert_eq!(invoke_i32(&instance, "sum", &[Literal::I32(10)]), 45);
}
