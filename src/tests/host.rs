use crate::{
    Error, Externals, FuncInstance, FuncRef, HostError, ImportsBuilder, Module,
    ModuleImportResolver, ModuleInstance, RuntimeArgs, RuntimeValue, Signature, Trap, TrapKind,
    ValueType,
};
use assert_matches::assert_matches;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
struct HostErrorWithCode {
    error_code: u32,
}

impl fmt::Display for HostErrorWithCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "failed with code {}", self.error_code)
    }
}

impl HostError for HostErrorWithCode {}

const SUB_FUNC_INDEX: usize = 0;
const ERR_FUNC_INDEX: usize = 1;
const BAD_TYPE_FUNC_INDEX: usize = 2;

/// A test host that provides a subtraction function, a function that always
/// fails with a custom error, and a function whose returned value lies about
/// its type.
struct TestHost {
    calls: usize,
}

impl TestHost {
    fn new() -> TestHost {
        TestHost { calls: 0 }
    }
}

impl Externals for TestHost {
    fn invoke_index(
        &mut self,
        index: usize,
        args: RuntimeArgs,
    ) -> Result<Option<RuntimeValue>, Trap> {
        self.calls += 1;
        match index {
            SUB_FUNC_INDEX => {
                let a: i32 = args.nth_checked(0)?;
                let b: i32 = args.nth_checked(1)?;
                Ok(Some(RuntimeValue::I32(a.wrapping_sub(b))))
            }
            ERR_FUNC_INDEX => {
                let error_code: u32 = args.nth_checked(0)?;
                Err(HostErrorWithCode { error_code }.into())
            }
            BAD_TYPE_FUNC_INDEX => Ok(Some(RuntimeValue::I64(0))),
            _ => panic!("env module doesn't provide function at index {}", index),
        }
    }
}

impl ModuleImportResolver for TestHost {
    fn resolve_func(&self, field_name: &str, _signature: &Signature) -> Result<FuncRef, Error> {
        let func = match field_name {
            "sub" => FuncInstance::alloc_host(
                Signature::new(&[ValueType::I32, ValueType::I32][..], Some(ValueType::I32)),
                SUB_FUNC_INDEX,
            ),
            "err" => FuncInstance::alloc_host(
                Signature::new(&[ValueType::I32][..], None),
                ERR_FUNC_INDEX,
            ),
            "bad_type" => FuncInstance::alloc_host(
                Signature::new(&[][..], Some(ValueType::I32)),
                BAD_TYPE_FUNC_INDEX,
            ),
            _ => {
                return Err(Error::Instantiation(format!(
                    "env module doesn't provide function '{}'",
                    field_name
                )))
            }
        };
        Ok(func)
    }
}

fn instantiate_with_host(source: &str) -> (crate::ModuleRef, TestHost) {
    let wasm = wat::parse_str(source).expect("Failed to parse wat source");
    let module = Module::from_bytes(wasm).expect("Failed to load module");
    let host = TestHost::new();
    let instance = ModuleInstance::new(
        &module,
        &ImportsBuilder::new().with_resolver("env", &host),
    )
    .expect("Failed to instantiate module")
    .assert_no_start();
    (instance, host)
}

#[test]
fn host_function_is_called_with_wasm_operands() {
    let (instance, mut host) = instantiate_with_host(
        r#"
        (module
            (import "env" "sub" (func $sub (param i32 i32) (result i32)))
            (func (export "test") (result i32)
                (call $sub (i32.const 50) (i32.const 8))))
        "#,
    );

    assert_eq!(
        instance.invoke_export("test", &[], &mut host).unwrap(),
        Some(RuntimeValue::I32(42)),
    );
    assert_eq!(host.calls, 1);
}

#[test]
fn host_error_is_reported_to_the_embedder() {
    let (instance, mut host) = instantiate_with_host(
        r#"
        (module
            (import "env" "err" (func $err (param i32)))
            (func (export "test")
                (call $err (i32.const 228))))
        "#,
    );

    let error = instance
        .invoke_export("test", &[], &mut host)
        .expect_err("expected a host error");
    let host_error = error
        .as_host_error()
        .expect("host error is preserved through the trap");
    assert_eq!(
        host_error.downcast_ref::<HostErrorWithCode>().unwrap(),
        &HostErrorWithCode { error_code: 228 }
    );
}

#[test]
fn host_return_value_type_is_checked() {
    let (instance, mut host) = instantiate_with_host(
        r#"
        (module
            (import "env" "bad_type" (func $bad (result i32)))
            (func (export "test") (result i32)
                (call $bad)))
        "#,
    );

    let error = instance
        .invoke_export("test", &[], &mut host)
        .expect_err("expected a signature trap");
    match error {
        Error::Trap(trap) => assert_matches!(trap.kind(), TrapKind::UnexpectedSignature),
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn missing_host_function_fails_instantiation() {
    let wasm = wat::parse_str(
        r#"
        (module
            (import "env" "no_such_fn" (func)))
        "#,
    )
    .unwrap();
    let module = Module::from_bytes(wasm).unwrap();
    let host = TestHost::new();
    assert_matches!(
        ModuleInstance::new(&module, &ImportsBuilder::new().with_resolver("env", &host)),
        Err(Error::Instantiation(_))
    );
}

#[test]
fn import_signature_mismatch_is_a_trap() {
    // The resolver hands out `sub` with its true signature; the interpreter
    // checks arguments against it on invocation.
    let (instance, mut host) = instantiate_with_host(
        r#"
        (module
            (import "env" "sub" (func $sub (param i32 i32) (result i32)))
            (func (export "test") (result i32)
                (call $sub (i32.const 1) (i32.const 2))))
        "#,
    );

    // Invoking the wasm export with bad args fails the same way.
    assert!(instance
        .invoke_export("test", &[RuntimeValue::I32(0)], &mut host)
        .is_err());
}
