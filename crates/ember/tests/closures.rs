//! Upvalue capture, closing on frame return, and mutation through a closed
//! upvalue.

mod support;

use ember::value::Value;
use ember::vm::Vm;

#[test]
fn closure_captures_and_mutates_a_local_across_calls() {
    let mut vm = Vm::with_defaults();
    support::run(
        &mut vm,
        r#"
        fun mk() {
            var x = 1
            fun inc() { x = x + 1; return x }
            return inc
        }
        var c = mk()
        var first = c()
        var second = c()
        print(first)
        print(second)
        "#,
    )
    .unwrap();
    assert_eq!(vm.stdout, "2\n3\n");
}

#[test]
fn two_closures_over_the_same_local_share_the_upvalue() {
    let mut vm = Vm::with_defaults();
    let result = support::run(
        &mut vm,
        r#"
        fun mk() {
            var x = 0
            fun get() { return x }
            fun set(v) { x = v }
            return (get, set)
        }
        var pair = mk()
        pair
        "#,
    )
    .unwrap();
    assert!(matches!(result, Value::Object(_)));
}

#[test]
fn nested_closures_close_over_the_enclosing_function_not_the_grandparent() {
    let mut vm = Vm::with_defaults();
    support::run(
        &mut vm,
        r#"
        fun outer() {
            var a = 10
            fun middle() {
                var b = 20
                fun inner() { return a + b }
                return inner
            }
            return middle()
        }
        print(outer()())
        "#,
    )
    .unwrap();
    assert_eq!(vm.stdout, "30\n");
}
