use crate::{
    Error, ImportsBuilder, Module, ModuleInstance, NopExternals, RuntimeValue, TrapKind,
};
use assert_matches::assert_matches;

fn parse_wat(source: &str) -> Module {
    let wasm_binary = wat::parse_str(source).expect("Failed to parse wat source");
    Module::from_bytes(wasm_binary).expect("Failed to load parsed module")
}

fn instantiate(source: &str) -> crate::ModuleRef {
    let module = parse_wat(source);
    ModuleInstance::new(&module, &ImportsBuilder::default())
        .expect("Failed to instantiate module")
        .assert_no_start()
}

fn trap_kind_of(result: Result<Option<RuntimeValue>, Error>) -> TrapKind {
    match result {
        Err(Error::Trap(trap)) => trap.into_kind(),
        other => panic!("expected a trap, got {:?}", other),
    }
}

#[test]
fn add_two_params() {
    let instance = instantiate(
        r#"
        (module
            (func (export "add") (param i32 i32) (result i32)
                local.get 0
                local.get 1
                i32.add))
        "#,
    );

    assert_eq!(
        instance
            .invoke_export(
                "add",
                &[RuntimeValue::I32(7), RuntimeValue::I32(35)],
                &mut NopExternals
            )
            .unwrap(),
        Some(RuntimeValue::I32(42)),
    );
}

#[test]
fn division_by_zero_traps() {
    let instance = instantiate(
        r#"
        (module
            (func (export "div") (result i32)
                i32.const 0
                i32.const 0
                i32.div_s))
        "#,
    );

    let kind = trap_kind_of(instance.invoke_export("div", &[], &mut NopExternals));
    assert_matches!(kind, TrapKind::DivisionByZero);
}

#[test]
fn signed_division_overflow_traps() {
    let instance = instantiate(
        r#"
        (module
            (func (export "div") (result i32)
                i32.const -2147483648
                i32.const -1
                i32.div_s)
            (func (export "rem") (result i32)
                i32.const -2147483648
                i32.const -1
                i32.rem_s))
        "#,
    );

    let kind = trap_kind_of(instance.invoke_export("div", &[], &mut NopExternals));
    assert_matches!(kind, TrapKind::IntegerOverflow);

    // The same operands under rem yield 0 instead of trapping.
    assert_eq!(
        instance.invoke_export("rem", &[], &mut NopExternals).unwrap(),
        Some(RuntimeValue::I32(0)),
    );
}

#[test]
fn store_across_memory_end_traps() {
    let instance = instantiate(
        r#"
        (module
            (memory (export "mem") 1)
            (func (export "store")
                i32.const 65535
                i32.const 0xDEADBEEF
                i32.store))
        "#,
    );

    let kind = trap_kind_of(instance.invoke_export("store", &[], &mut NopExternals));
    assert_matches!(kind, TrapKind::MemoryAccessOutOfBounds);

    // Nothing was written: the byte before the end is untouched.
    let memory = instance
        .export_by_name("mem")
        .and_then(|ev| ev.as_memory().cloned())
        .unwrap();
    assert_eq!(memory.get_value::<u8>(65535).unwrap(), 0);
}

#[test]
fn unaligned_access_works() {
    let instance = instantiate(
        r#"
        (module
            (memory 1)
            (func (export "roundtrip") (result i32)
                i32.const 65531
                i32.const 0x12345678
                i32.store
                i32.const 65531
                i32.load))
        "#,
    );

    assert_eq!(
        instance
            .invoke_export("roundtrip", &[], &mut NopExternals)
            .unwrap(),
        Some(RuntimeValue::I32(0x12345678)),
    );
}

#[test]
fn countdown_loop_with_br_if() {
    let instance = instantiate(
        r#"
        (module
            (func (export "sum") (result i32)
                (local $n i32)
                (local $acc i32)
                (local.set $n (i32.const 10))
                (block $exit
                    (loop $top
                        (br_if $exit (i32.eqz (local.get $n)))
                        (local.set $acc (i32.add (local.get $acc) (local.get $n)))
                        (local.set $n (i32.sub (local.get $n) (i32.const 1)))
                        (br $top)))
                (local.get $acc)))
        "#,
    );

    assert_eq!(
        instance.invoke_export("sum", &[], &mut NopExternals).unwrap(),
        Some(RuntimeValue::I32(55)),
    );
}

#[test]
fn loop_with_result_type() {
    let instance = instantiate(
        r#"
        (module
            (func (export "count") (result i32)
                (local $i i32)
                (loop $l (result i32)
                    (local.set $i (i32.add (local.get $i) (i32.const 1)))
                    (br_if $l (i32.lt_u (local.get $i) (i32.const 10)))
                    (local.get $i))))
        "#,
    );

    assert_eq!(
        instance
            .invoke_export("count", &[], &mut NopExternals)
            .unwrap(),
        Some(RuntimeValue::I32(10)),
    );
}

#[test]
fn trapping_start_function_fails_instantiation() {
    let wasm = wat::parse_str(
        r#"
        (module
            (memory (export "mem") 1)
            (func $start
                (i32.store8 (i32.const 0) (i32.const 7))
                unreachable)
            (start $start))
        "#,
    )
    .unwrap();
    let module = Module::from_bytes(&wasm).unwrap();
    let not_started = ModuleInstance::new(&module, &ImportsBuilder::default()).unwrap();
    assert!(not_started.has_start());

    let instance = not_started.not_started_instance().clone();
    assert!(not_started.run_start(&mut NopExternals).is_err());

    // The write preceding the trap is visible in the failed instance.
    let memory = instance
        .export_by_name("mem")
        .and_then(|ev| ev.as_memory().cloned())
        .unwrap();
    assert_eq!(memory.get_value::<u8>(0).unwrap(), 7);
}

#[test]
fn unbounded_recursion_overflows_call_stack() {
    let instance = instantiate(
        r#"
        (module
            (func $f (export "rec")
                call $f))
        "#,
    );

    let kind = trap_kind_of(instance.invoke_export("rec", &[], &mut NopExternals));
    assert_matches!(kind, TrapKind::StackOverflow);
}

#[test]
fn bounded_recursion_is_fine() {
    let instance = instantiate(
        r#"
        (module
            (func $fac (export "fac") (param i64) (result i64)
                (if (result i64)
                    (i64.eqz (local.get 0))
                    (then (i64.const 1))
                    (else
                        (i64.mul
                            (local.get 0)
                            (call $fac (i64.sub (local.get 0) (i64.const 1))))))))
        "#,
    );

    assert_eq!(
        instance
            .invoke_export("fac", &[RuntimeValue::I64(20)], &mut NopExternals)
            .unwrap(),
        Some(RuntimeValue::I64(2432902008176640000)),
    );
}

#[test]
fn trap_leaves_earlier_writes_in_place() {
    let instance = instantiate(
        r#"
        (module
            (memory (export "mem") 1)
            (global $g (mut i32) (i32.const 0))
            (func (export "get_g") (result i32) (global.get $g))
            (func (export "run")
                (i32.store (i32.const 16) (i32.const 1234))
                (global.set $g (i32.const 99))
                (i32.store (i32.const 70000) (i32.const 1))))
        "#,
    );

    let kind = trap_kind_of(instance.invoke_export("run", &[], &mut NopExternals));
    assert_matches!(kind, TrapKind::MemoryAccessOutOfBounds);

    let memory = instance
        .export_by_name("mem")
        .and_then(|ev| ev.as_memory().cloned())
        .unwrap();
    assert_eq!(memory.get_value::<i32>(16).unwrap(), 1234);

    assert_eq!(
        instance.invoke_export("get_g", &[], &mut NopExternals).unwrap(),
        Some(RuntimeValue::I32(99)),
    );
}

#[test]
fn br_table_dispatch() {
    let instance = instantiate(
        r#"
        (module
            (func (export "classify") (param i32) (result i32)
                (block $default
                    (block $b1
                        (block $b0
                            (br_table $b0 $b1 $default (local.get 0)))
                        (return (i32.const 0)))
                    (return (i32.const 1)))
                (i32.const 100)))
        "#,
    );

    let classify = |v: i32| {
        instance
            .invoke_export("classify", &[RuntimeValue::I32(v)], &mut NopExternals)
            .unwrap()
    };

    assert_eq!(classify(0), Some(RuntimeValue::I32(0)));
    assert_eq!(classify(1), Some(RuntimeValue::I32(1)));
    // Any selector at or past the table length picks the default label.
    assert_eq!(classify(2), Some(RuntimeValue::I32(100)));
    assert_eq!(classify(77), Some(RuntimeValue::I32(100)));
}

#[test]
fn call_indirect_dispatch_and_traps() {
    let instance = instantiate(
        r#"
        (module
            (type $ret_i32 (func (result i32)))
            (table 4 funcref)
            (func $ten (type $ret_i32) (result i32) i32.const 10)
            (func $eleven (type $ret_i32) (result i32) i32.const 11)
            (func $other (param i32) (result i32) local.get 0)
            (elem (i32.const 0) $ten $eleven $other)
            (func (export "dispatch") (param i32) (result i32)
                (call_indirect (type $ret_i32) (local.get 0))))
        "#,
    );

    let dispatch = |v: i32| {
        instance.invoke_export("dispatch", &[RuntimeValue::I32(v)], &mut NopExternals)
    };

    assert_eq!(dispatch(0).unwrap(), Some(RuntimeValue::I32(10)));
    assert_eq!(dispatch(1).unwrap(), Some(RuntimeValue::I32(11)));
    // Signature mismatch.
    assert_matches!(trap_kind_of(dispatch(2)), TrapKind::UnexpectedSignature);
    // Uninitialized element.
    assert_matches!(trap_kind_of(dispatch(3)), TrapKind::ElemUninitialized);
    // Out of table bounds.
    assert_matches!(trap_kind_of(dispatch(4)), TrapKind::TableAccessOutOfBounds);
}

#[test]
fn foreign_table_entry_outlives_its_instance() {
    // The table lives in one instance and is shared by import.
    let table_owner = instantiate(
        r#"
        (module
            (table (export "tab") 2 funcref))
        "#,
    );

    {
        // A second instance imports the table and writes its own function
        // into it through an element segment.
        let wasm = wat::parse_str(
            r#"
            (module
                (import "env" "tab" (table 2 funcref))
                (func $answer (result i32) i32.const 41)
                (elem (i32.const 0) $answer))
            "#,
        )
        .unwrap();
        let module = Module::from_bytes(&wasm).unwrap();
        let _provider = ModuleInstance::new(
            &module,
            &ImportsBuilder::new().with_resolver("env", &table_owner),
        )
        .unwrap()
        .assert_no_start();
        // The provider's last ModuleRef is dropped here; the table entry
        // keeps its instance alive.
    }

    // A third instance calls through the shared table.
    let wasm = wat::parse_str(
        r#"
        (module
            (import "env" "tab" (table 2 funcref))
            (type $ret_i32 (func (result i32)))
            (func (export "call") (param i32) (result i32)
                (i32.add
                    (call_indirect (type $ret_i32) (local.get 0))
                    (i32.const 1))))
        "#,
    )
    .unwrap();
    let module = Module::from_bytes(&wasm).unwrap();
    let caller = ModuleInstance::new(
        &module,
        &ImportsBuilder::new().with_resolver("env", &table_owner),
    )
    .unwrap()
    .assert_no_start();

    assert_eq!(
        caller
            .invoke_export("call", &[RuntimeValue::I32(0)], &mut NopExternals)
            .unwrap(),
        Some(RuntimeValue::I32(42)),
    );
}

#[test]
fn memory_size_and_grow() {
    let instance = instantiate(
        r#"
        (module
            (memory 1 3)
            (func (export "size") (result i32) memory.size)
            (func (export "grow") (param i32) (result i32)
                (memory.grow (local.get 0))))
        "#,
    );

    let grow = |v: i32| {
        instance
            .invoke_export("grow", &[RuntimeValue::I32(v)], &mut NopExternals)
            .unwrap()
    };
    let size = || {
        instance
            .invoke_export("size", &[], &mut NopExternals)
            .unwrap()
    };

    assert_eq!(size(), Some(RuntimeValue::I32(1)));
    // Growing returns the previous size.
    assert_eq!(grow(1), Some(RuntimeValue::I32(1)));
    assert_eq!(size(), Some(RuntimeValue::I32(2)));
    // Growing by zero returns the current size.
    assert_eq!(grow(0), Some(RuntimeValue::I32(2)));
    // Growing past the declared maximum fails with -1 and changes nothing.
    assert_eq!(grow(2), Some(RuntimeValue::I32(-1)));
    assert_eq!(size(), Some(RuntimeValue::I32(2)));
}

#[test]
fn globals_get_and_set() {
    let instance = instantiate(
        r#"
        (module
            (global $counter (mut i64) (i64.const 100))
            (func (export "bump") (result i64)
                (global.set $counter (i64.add (global.get $counter) (i64.const 1)))
                (global.get $counter)))
        "#,
    );

    assert_eq!(
        instance.invoke_export("bump", &[], &mut NopExternals).unwrap(),
        Some(RuntimeValue::I64(101)),
    );
    assert_eq!(
        instance.invoke_export("bump", &[], &mut NopExternals).unwrap(),
        Some(RuntimeValue::I64(102)),
    );
}

#[test]
fn float_min_canonicalizes_nan() {
    let instance = instantiate(
        r#"
        (module
            (func (export "fmin") (param f64 f64) (result f64)
                (f64.min (local.get 0) (local.get 1))))
        "#,
    );

    let noisy_nan = RuntimeValue::decode_f64(0xfff8_0000_0000_1234);
    let result = instance
        .invoke_export("fmin", &[noisy_nan, RuntimeValue::decode_f64(0)], &mut NopExternals)
        .unwrap();
    match result {
        Some(RuntimeValue::F64(v)) => assert_eq!(v.to_bits(), 0x7ff8_0000_0000_0000),
        other => panic!("unexpected result {:?}", other),
    }
}

#[test]
fn float_min_prefers_negative_zero() {
    let instance = instantiate(
        r#"
        (module
            (func (export "fmin") (result f64)
                (f64.min (f64.const 0.0) (f64.const -0.0))))
        "#,
    );

    match instance.invoke_export("fmin", &[], &mut NopExternals).unwrap() {
        Some(RuntimeValue::F64(v)) => assert_eq!(v.to_bits(), (-0.0f64).to_bits()),
        other => panic!("unexpected result {:?}", other),
    }
}

#[test]
fn truncation_out_of_range_traps() {
    let instance = instantiate(
        r#"
        (module
            (func (export "trunc") (param f64) (result i32)
                (i32.trunc_f64_s (local.get 0))))
        "#,
    );

    let trunc = |v: f64| {
        instance.invoke_export(
            "trunc",
            &[RuntimeValue::decode_f64(v.to_bits())],
            &mut NopExternals,
        )
    };

    assert_eq!(trunc(-1.9).unwrap(), Some(RuntimeValue::I32(-1)));
    assert_eq!(trunc(2147483647.0).unwrap(), Some(RuntimeValue::I32(i32::MAX)));
    assert_matches!(trap_kind_of(trunc(2147483648.0)), TrapKind::InvalidConversionToInt);
    assert_matches!(trap_kind_of(trunc(f64::NAN)), TrapKind::InvalidConversionToInt);
    assert_matches!(
        trap_kind_of(trunc(f64::NEG_INFINITY)),
        TrapKind::InvalidConversionToInt
    );
}

#[test]
fn reinterpret_is_bitwise_identity() {
    let instance = instantiate(
        r#"
        (module
            (func (export "roundtrip") (param i64) (result i64)
                (i64.reinterpret_f64 (f64.reinterpret_i64 (local.get 0)))))
        "#,
    );

    // A NaN bit pattern survives the double reinterpretation untouched.
    let bits = 0x7ff8_0000_0000_cafe_u64 as i64;
    assert_eq!(
        instance
            .invoke_export("roundtrip", &[RuntimeValue::I64(bits)], &mut NopExternals)
            .unwrap(),
        Some(RuntimeValue::I64(bits)),
    );
}

#[test]
fn shift_counts_are_masked() {
    let instance = instantiate(
        r#"
        (module
            (func (export "shl") (param i32 i32) (result i32)
                (i32.shl (local.get 0) (local.get 1))))
        "#,
    );

    let shl = |a: i32, k: i32| {
        instance
            .invoke_export(
                "shl",
                &[RuntimeValue::I32(a), RuntimeValue::I32(k)],
                &mut NopExternals,
            )
            .unwrap()
    };

    assert_eq!(shl(1, 1), Some(RuntimeValue::I32(2)));
    // Shifting by 33 is shifting by 1.
    assert_eq!(shl(1, 33), Some(RuntimeValue::I32(2)));
}

#[test]
fn select_and_drop() {
    let instance = instantiate(
        r#"
        (module
            (func (export "pick") (param i32) (result i64)
                (select (i64.const -1) (i64.const 1) (local.get 0))))
        "#,
    );

    assert_eq!(
        instance
            .invoke_export("pick", &[RuntimeValue::I32(1)], &mut NopExternals)
            .unwrap(),
        Some(RuntimeValue::I64(-1)),
    );
    assert_eq!(
        instance
            .invoke_export("pick", &[RuntimeValue::I32(0)], &mut NopExternals)
            .unwrap(),
        Some(RuntimeValue::I64(1)),
    );
}

#[test]
fn imported_global_initializes_defined_global() {
    let exporter = instantiate(
        r#"
        (module
            (global (export "base") i32 (i32.const 40)))
        "#,
    );

    let wasm = wat::parse_str(
        r#"
        (module
            (import "env" "base" (global $base i32))
            (global $derived i32 (global.get $base))
            (func (export "get") (result i32)
                (i32.add (global.get $derived) (i32.const 2))))
        "#,
    )
    .unwrap();
    let module = Module::from_bytes(&wasm).unwrap();
    let instance = ModuleInstance::new(
        &module,
        &ImportsBuilder::new().with_resolver("env", &exporter),
    )
    .unwrap()
    .assert_no_start();

    assert_eq!(
        instance.invoke_export("get", &[], &mut NopExternals).unwrap(),
        Some(RuntimeValue::I32(42)),
    );
}

#[test]
fn shared_imported_memory() {
    let exporter = instantiate(
        r#"
        (module
            (memory (export "memory") 1)
            (func (export "peek") (result i32)
                (i32.load (i32.const 0))))
        "#,
    );

    let wasm = wat::parse_str(
        r#"
        (module
            (import "env" "memory" (memory 1))
            (func (export "poke")
                (i32.store (i32.const 0) (i32.const 424242))))
        "#,
    )
    .unwrap();
    let module = Module::from_bytes(&wasm).unwrap();
    let instance = ModuleInstance::new(
        &module,
        &ImportsBuilder::new().with_resolver("env", &exporter),
    )
    .unwrap()
    .assert_no_start();

    instance.invoke_export("poke", &[], &mut NopExternals).unwrap();

    // The write is visible through the exporting instance.
    assert_eq!(
        exporter.invoke_export("peek", &[], &mut NopExternals).unwrap(),
        Some(RuntimeValue::I32(424242)),
    );
}

#[test]
fn wrong_argument_arity_is_an_error() {
    let instance = instantiate(
        r#"
        (module
            (func (export "id") (param i32) (result i32) (local.get 0)))
        "#,
    );

    assert!(instance.invoke_export("id", &[], &mut NopExternals).is_err());
    assert!(instance
        .invoke_export("id", &[RuntimeValue::I64(1)], &mut NopExternals)
        .is_err());
}

#[test]
fn deep_value_stack_within_limits() {
    // A chain of adds that builds a few hundred operands.
    let mut body = String::new();
    for i in 0..512 {
        body.push_str(&format!("(i32.const {})\n", i));
    }
    for _ in 0..511 {
        body.push_str("i32.add\n");
    }
    let source = format!(
        r#"
        (module
            (func (export "sum") (result i32)
                {}))
        "#,
        body
    );
    let instance = instantiate(&source);

    assert_eq!(
        instance.invoke_export("sum", &[], &mut NopExternals).unwrap(),
        Some(RuntimeValue::I32((0..512).sum())),
    );
}
