//! Operator overload dispatch: the numeric fast path, forward dunders on the
//! left operand, and the `__radd__`-style reflected fallback on the right.

mod support;

use ember::value::Value;
use ember::vm::Vm;

#[test]
fn numeric_fast_path_bypasses_method_dispatch() {
    let mut vm = Vm::with_defaults();
    let result = support::run(&mut vm, "2 + 3 * 4").unwrap();
    assert_eq!(result, Value::Number(14.0));
}

#[test]
fn reverse_operator_fallback_is_tried_when_left_operand_lacks_add() {
    let mut vm = Vm::with_defaults();
    let result = support::run(
        &mut vm,
        r#"
        class V {
            construct(x) { this.x = x }
            fun __radd__(o) { return V(o + this.x) }
        }
        (10 + V(5)).x
        "#,
    )
    .unwrap();
    assert_eq!(result, Value::Number(15.0));
}

#[test]
fn forward_dunder_wins_over_reflected_when_both_are_defined() {
    let mut vm = Vm::with_defaults();
    let result = support::run(
        &mut vm,
        r#"
        class Always {
            fun __add__(o) { return "forward" }
            fun __radd__(o) { return "reverse" }
        }
        var a = Always()
        a + 1
        "#,
    )
    .unwrap();
    let Value::Object(id) = result else { panic!("expected a string") };
    assert_eq!(vm.heap().string_str(id), "forward");
}

#[test]
fn missing_operator_on_both_sides_raises_type_exception() {
    let mut vm = Vm::with_defaults();
    let err = support::run(
        &mut vm,
        r#"
        class Bare { }
        Bare() + 1
        "#,
    )
    .unwrap_err();
    assert_eq!(support::exc_kind(&vm, err.value), Some(ember::ExcType::TypeException));
}

#[test]
fn comparison_dunders_drive_lt_and_le() {
    let mut vm = Vm::with_defaults();
    let result = support::run(
        &mut vm,
        r#"
        class Box {
            construct(n) { this.n = n }
            fun __lt__(o) { return this.n < o.n }
        }
        Box(1) < Box(2)
        "#,
    )
    .unwrap();
    assert_eq!(result, Value::Bool(true));
}

#[test]
fn compound_assignment_desugars_to_a_single_evaluation() {
    let mut vm = Vm::with_defaults();
    let result = support::run(
        &mut vm,
        r#"
        var calls = 0
        fun track() { calls = calls + 1; return [1] }
        var target = track()
        target[0] += 5
        calls
        "#,
    )
    .unwrap();
    assert_eq!(result, Value::Number(1.0));
}
