//! `try`/`except`/`ensure`/`raise` semantics: ensure runs on both normal and
//! exceptional exit, except still catches outside a function whose own
//! ensure ran, and unmatched exceptions propagate as `RunError`.

mod support;

use ember::ExcType;
use ember::value::Value;
use ember::vm::Vm;

#[test]
fn ensure_runs_on_both_normal_and_exceptional_exit() {
    let mut vm = Vm::with_defaults();
    let result = support::run(
        &mut vm,
        r#"
        var log = []
        fun f(raise_) {
            try {
                if raise_ { raise Exception("x") }
                return 1
            } ensure {
                log.add("e")
            }
        }
        f(false)
        try { f(true) } except Exception e { log.add("c") }
        log
        "#,
    )
    .unwrap();

    let items = support::list_items(&vm, result);
    assert_eq!(items.len(), 3);
    let as_strings: Vec<String> = items
        .into_iter()
        .map(|v| match v {
            Value::Object(id) => vm.heap().string_str(id).to_string(),
            other => other.to_string(),
        })
        .collect();
    assert_eq!(as_strings, vec!["e", "e", "c"]);
}

#[test]
fn unhandled_raise_propagates_as_a_run_error() {
    let mut vm = Vm::with_defaults();
    let err = support::run(&mut vm, r#"raise TypeException("boom")"#).unwrap_err();
    assert_eq!(support::exc_kind(&vm, err.value), Some(ExcType::TypeException));
    assert_eq!(support::exc_message(&vm, err.value), "boom");
}

#[test]
fn except_matches_only_its_declared_type_unless_it_is_exception() {
    let mut vm = Vm::with_defaults();
    let err = support::run(
        &mut vm,
        r#"
        try {
            raise TypeException("nope")
        } except NameException e {
            print("wrong handler")
        }
        "#,
    )
    .unwrap_err();
    assert_eq!(support::exc_kind(&vm, err.value), Some(ExcType::TypeException));
}

#[test]
fn raise_requires_an_exception_instance() {
    let mut vm = Vm::with_defaults();
    let err = support::run(&mut vm, "raise 5").unwrap_err();
    assert_eq!(support::exc_kind(&vm, err.value), Some(ExcType::TypeException));
}
