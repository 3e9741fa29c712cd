//! `foreach` over a user-defined `__iter__`/`__next__` pair, and generator
//! functions driving the same loop form through `YIELD` instead.

mod support;

use ember::value::Value;
use ember::vm::Vm;

#[test]
fn foreach_drives_a_user_defined_iterator() {
    let mut vm = Vm::with_defaults();
    let result = support::run(
        &mut vm,
        r#"
        class R {
            construct(n) { this.n = n }
            fun __iter__(s) {
                if s == null { return 0 }
                if s < this.n - 1 { return s + 1 }
                return null
            }
            fun __next__(s) { return s }
        }
        var out = []
        for var v in R(3) { out.add(v) }
        out
        "#,
    )
    .unwrap();

    let items = support::list_items(&vm, result);
    assert_eq!(items, vec![Value::Number(0.0), Value::Number(1.0), Value::Number(2.0)]);
}

#[test]
fn foreach_over_an_empty_iterator_runs_zero_times() {
    let mut vm = Vm::with_defaults();
    let result = support::run(
        &mut vm,
        r#"
        class Empty {
            fun __iter__(s) { return null }
            fun __next__(s) { return s }
        }
        var out = []
        for var v in Empty() { out.add(v) }
        out
        "#,
    )
    .unwrap();
    assert_eq!(support::list_items(&vm, result), Vec::<Value>::new());
}

#[test]
fn generator_function_yields_a_sequence_across_resumes() {
    let mut vm = Vm::with_defaults();
    let result = support::run(
        &mut vm,
        r#"
        fun counter(n) {
            var i = 0
            while i < n {
                yield i
                i = i + 1
            }
        }
        var out = []
        for var v in counter(3) { out.add(v) }
        out
        "#,
    )
    .unwrap();
    assert_eq!(support::list_items(&vm, result), vec![Value::Number(0.0), Value::Number(1.0), Value::Number(2.0)]);
}
