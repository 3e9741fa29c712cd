//! Multi-target `var` declarations and unpack assignment: literal-sized
//! unpacks compile straight through, non-literal or size-mismatched RHS
//! goes through the `UNPACK` opcode and raises on a count mismatch.

mod support;

use ember::value::Value;
use ember::vm::Vm;

#[test]
fn var_decl_unpacks_a_runtime_list_of_matching_size() {
    let mut vm = Vm::with_defaults();
    let result = support::run(
        &mut vm,
        r#"
        fun pair() { return [1, 2] }
        var a, b = pair()
        a + b
        "#,
    )
    .unwrap();
    assert_eq!(result, Value::Number(3.0));
}

#[test]
fn var_decl_unpacks_a_tuple() {
    let mut vm = Vm::with_defaults();
    let result = support::run(
        &mut vm,
        r#"
        var a, b, c = (1, 2, 3)
        a + b + c
        "#,
    )
    .unwrap();
    assert_eq!(result, Value::Number(6.0));
}

#[test]
fn unpack_with_mismatched_size_raises_type_exception_mentioning_unpack() {
    let mut vm = Vm::with_defaults();
    let err = support::run(&mut vm, "var a, b, c = [1, 2]").unwrap_err();
    assert_eq!(support::exc_kind(&vm, err.value), Some(ember::ExcType::TypeException));
    assert!(
        support::exc_message(&vm, err.value).contains("unpack"),
        "expected the message to mention 'unpack', got: {:?}",
        support::exc_message(&vm, err.value)
    );
}

#[test]
fn unpack_of_a_non_iterable_value_raises_type_exception() {
    let mut vm = Vm::with_defaults();
    let err = support::run(&mut vm, "var a, b = 5").unwrap_err();
    assert_eq!(support::exc_kind(&vm, err.value), Some(ember::ExcType::TypeException));
}
