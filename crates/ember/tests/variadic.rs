//! Variadic call arity: `fun f(a, ...rest)` accepts any call with at least
//! the fixed parameter count, packing the excess into a trailing tuple.

mod support;

use ember::value::Value;
use ember::vm::Vm;

#[test]
fn variadic_function_accepts_only_its_fixed_arguments() {
    let mut vm = Vm::with_defaults();
    let result = support::run(
        &mut vm,
        r#"
        fun f(a, ...rest) { return a }
        f(1)
        "#,
    )
    .unwrap();
    assert_eq!(result, Value::Number(1.0));
}

#[test]
fn variadic_function_packs_excess_arguments_into_a_tuple() {
    let mut vm = Vm::with_defaults();
    let result = support::run(
        &mut vm,
        r#"
        fun f(a, ...rest) { return rest }
        f(1, 2, 3)
        "#,
    )
    .unwrap();
    let Value::Object(id) = result else { panic!("expected a tuple") };
    match &vm.heap().get(id).data {
        ember::object::ObjectData::Tuple(t) => {
            assert_eq!(t.items.as_ref(), &[Value::Number(2.0), Value::Number(3.0)]);
        }
        _ => panic!("expected a tuple"),
    }
}

#[test]
fn variadic_function_with_no_excess_args_gets_an_empty_tuple() {
    let mut vm = Vm::with_defaults();
    let result = support::run(
        &mut vm,
        r#"
        fun f(a, ...rest) { return rest }
        f(1)
        "#,
    )
    .unwrap();
    let Value::Object(id) = result else { panic!("expected a tuple") };
    match &vm.heap().get(id).data {
        ember::object::ObjectData::Tuple(t) => assert_eq!(t.items.len(), 0),
        _ => panic!("expected a tuple"),
    }
}

#[test]
fn calling_a_variadic_function_with_too_few_arguments_still_raises() {
    let mut vm = Vm::with_defaults();
    let err = support::run(
        &mut vm,
        r#"
        fun f(a, b, ...rest) { return a }
        f(1)
        "#,
    )
    .unwrap_err();
    assert_eq!(support::exc_kind(&vm, err.value), Some(ember::ExcType::TypeException));
}
