use super::validate_module;
use crate::elements::Module;

fn validate_wat(source: &str) -> Result<super::CompiledModule, super::Error> {
    let wasm = wat::parse_str(source).expect("Failed to parse wat source");
    let module = Module::parse(&wasm).expect("Failed to decode module");
    validate_module(&module)
}

fn assert_valid(source: &str) {
    if let Err(e) = validate_wat(source) {
        panic!("expected module to validate, got: {}", e);
    }
}

fn assert_invalid(source: &str) {
    assert!(
        validate_wat(source).is_ok() == false,
        "expected module to be rejected"
    );
}

#[test]
fn minimal_module_is_valid() {
    assert_valid("(module)");
}

#[test]
fn result_type_must_match() {
    assert_invalid(
        r#"
        (module
            (func (result i32)
                i64.const 1))
        "#,
    );
}

#[test]
fn leftover_operands_are_rejected() {
    assert_invalid(
        r#"
        (module
            (func
                i32.const 1))
        "#,
    );
}

#[test]
fn missing_result_is_rejected() {
    assert_invalid(
        r#"
        (module
            (func (result i32)
                nop))
        "#,
    );
}

#[test]
fn binop_operand_types_must_agree() {
    assert_invalid(
        r#"
        (module
            (func (result i32)
                i32.const 1
                i64.const 2
                i32.add))
        "#,
    );
}

#[test]
fn branch_depth_is_checked() {
    assert_invalid(
        r#"
        (module
            (func
                (block
                    (br 5))))
        "#,
    );
}

#[test]
fn if_without_else_cannot_return() {
    assert_invalid(
        r#"
        (module
            (func (param i32) (result i32)
                (local.get 0)
                (if (result i32)
                    (then (i32.const 1)))))
        "#,
    );
    assert_valid(
        r#"
        (module
            (func (param i32) (result i32)
                (local.get 0)
                (if (result i32)
                    (then (i32.const 1))
                    (else (i32.const 2)))))
        "#,
    );
}

#[test]
fn select_operand_types_must_agree() {
    assert_invalid(
        r#"
        (module
            (func (param i32) (result i32)
                (select (i32.const 1) (i64.const 2) (local.get 0))))
        "#,
    );
}

#[test]
fn immutable_global_cannot_be_set() {
    assert_invalid(
        r#"
        (module
            (global $g i32 (i32.const 0))
            (func
                (global.set $g (i32.const 1))))
        "#,
    );
}

#[test]
fn mutable_global_cannot_be_imported() {
    assert_invalid(
        r#"
        (module
            (import "env" "g" (global (mut i32))))
        "#,
    );
}

#[test]
fn mutable_global_cannot_be_exported() {
    assert_invalid(
        r#"
        (module
            (global $g (mut i32) (i32.const 0))
            (export "g" (global $g)))
        "#,
    );
}

#[test]
fn global_initializer_type_must_match() {
    assert_invalid(
        r#"
        (module
            (global i32 (i64.const 0)))
        "#,
    );
}

#[test]
fn global_initializer_may_use_imported_global_only() {
    assert_valid(
        r#"
        (module
            (import "env" "base" (global $base i32))
            (global i32 (global.get $base)))
        "#,
    );
    // A defined global is not in scope for initializers.
    assert_invalid(
        r#"
        (module
            (global $a i32 (i32.const 1))
            (global $b i32 (global.get $a)))
        "#,
    );
}

#[test]
fn call_index_is_checked() {
    assert_invalid(
        r#"
        (module
            (func
                (call 5)))
        "#,
    );
}

#[test]
fn local_index_is_checked() {
    assert_invalid(
        r#"
        (module
            (func (param i32)
                (drop (local.get 1))))
        "#,
    );
}

#[test]
fn memory_access_requires_a_memory() {
    assert_invalid(
        r#"
        (module
            (func (result i32)
                (i32.load (i32.const 0))))
        "#,
    );
    assert_invalid(
        r#"
        (module
            (func (result i32)
                memory.size))
        "#,
    );
}

#[test]
fn alignment_must_not_exceed_access_width() {
    assert_invalid(
        r#"
        (module
            (memory 1)
            (func (result i32)
                (i32.load align=8 (i32.const 0))))
        "#,
    );
    assert_valid(
        r#"
        (module
            (memory 1)
            (func (result i32)
                (drop (i32.load align=2 (i32.const 0)))
                (i32.load8_u align=1 (i32.const 0))))
        "#,
    );
}

#[test]
fn call_indirect_requires_a_table() {
    assert_invalid(
        r#"
        (module
            (type (func))
            (func
                (call_indirect (type 0) (i32.const 0))))
        "#,
    );
}

#[test]
fn start_function_must_have_empty_signature() {
    assert_invalid(
        r#"
        (module
            (func $f (param i32))
            (start $f))
        "#,
    );
    assert_invalid(
        r#"
        (module
            (func $f (result i32) (i32.const 0))
            (start $f))
        "#,
    );
    assert_valid(
        r#"
        (module
            (func $f)
            (start $f))
        "#,
    );
}

#[test]
fn duplicate_export_names_are_rejected() {
    assert_invalid(
        r#"
        (module
            (func $a)
            (func $b)
            (export "f" (func $a))
            (export "f" (func $b)))
        "#,
    );
}

#[test]
fn data_segment_requires_a_memory() {
    assert_invalid(
        r#"
        (module
            (data (i32.const 0) "x"))
        "#,
    );
}

#[test]
fn segment_offset_must_be_i32() {
    assert_invalid(
        r#"
        (module
            (memory 1)
            (data (i64.const 0) "x"))
        "#,
    );
}

#[test]
fn limits_must_be_ordered() {
    assert_invalid(
        r#"
        (module
            (memory 2 1))
        "#,
    );
}

#[test]
fn unreachable_makes_the_stack_polymorphic() {
    assert_valid(
        r#"
        (module
            (func (result i32)
                unreachable))
        "#,
    );
    assert_valid(
        r#"
        (module
            (func (result i32)
                unreachable
                i32.add))
        "#,
    );
    // The frame's entry height still anchors the stack: popping past it
    // with a concrete type mismatch is caught again once values are pushed.
    assert_invalid(
        r#"
        (module
            (func (result i32)
                unreachable
                (i32.add (i64.const 1) (i32.const 2))))
        "#,
    );
}

#[test]
fn branches_carry_block_results() {
    assert_valid(
        r#"
        (module
            (func (result i32)
                (block (result i32)
                    (br 0 (i32.const 1)))))
        "#,
    );
    assert_invalid(
        r#"
        (module
            (func (result i32)
                (block (result i32)
                    (br 0))))
        "#,
    );
}

#[test]
fn br_table_labels_must_have_uniform_types() {
    assert_invalid(
        r#"
        (module
            (func (param i32) (result i32)
                (block $a (result i32)
                    (block $b
                        (br_table $a $b (i32.const 1) (local.get 0)))
                    (i32.const 0))))
        "#,
    );
}

#[test]
fn loop_branches_carry_no_result() {
    // A branch to a loop label jumps to the loop head, so it needs no
    // operands even when the loop has a result type.
    assert_valid(
        r#"
        (module
            (func (result i32)
                (local $i i32)
                (loop $l (result i32)
                    (local.set $i (i32.add (local.get $i) (i32.const 1)))
                    (br_if $l (i32.lt_u (local.get $i) (i32.const 4)))
                    (local.get $i))))
        "#,
    );
}

#[test]
fn function_and_code_sections_must_agree() {
    // A function section entry with no body. Assembled by hand since the
    // text format cannot express the mismatch.
    let wasm = vec![
        0x00, 0x61, 0x73, 0x6D, 0x01, 0x00, 0x00, 0x00, // magic + version
        0x01, 0x04, 0x01, 0x60, 0x00, 0x00, // type section: [] -> []
        0x03, 0x02, 0x01, 0x00, // function section: one entry, type 0
    ];
    let module = Module::parse(&wasm).expect("structurally fine");
    assert!(validate_module(&module).is_err());
}

#[test]
fn compiled_code_records_max_stack_height() {
    let compiled = validate_wat(
        r#"
        (module
            (func (result i32)
                i32.const 1
                i32.const 2
                i32.const 3
                i32.add
                i32.add))
        "#,
    )
    .unwrap();
    assert_eq!(compiled.code_map.len(), 1);
    assert_eq!(compiled.code_map[0].max_stack_height(), 3);
}
