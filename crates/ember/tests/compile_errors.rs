//! Out-of-band parse/compile diagnostics: reported via the collecting sink,
//! never surfaced as a runtime exception.

mod support;

use ember::vm::Vm;

#[test]
fn break_across_an_active_try_block_is_a_compile_error() {
    let mut vm = Vm::with_defaults();
    let messages = support::expect_compile_error(
        &mut vm,
        r#"
        while true {
            try {
                break
            } except Exception e { }
        }
        "#,
    );
    assert!(
        messages.iter().any(|m| m.contains("break") && m.contains("try")),
        "expected a message mentioning both 'break' and 'try', got: {messages:?}"
    );
}

#[test]
fn continue_across_an_active_try_block_is_a_compile_error() {
    let mut vm = Vm::with_defaults();
    let messages = support::expect_compile_error(
        &mut vm,
        r#"
        while true {
            try {
                continue
            } except Exception e { }
        }
        "#,
    );
    assert!(messages.iter().any(|m| m.contains("continue") && m.contains("try")));
}

#[test]
fn break_outside_any_loop_is_a_compile_error() {
    let mut vm = Vm::with_defaults();
    let messages = support::expect_compile_error(&mut vm, "break");
    assert!(messages.iter().any(|m| m.contains("break")));
}

#[test]
fn unterminated_string_is_a_compile_error() {
    let mut vm = Vm::with_defaults();
    support::expect_compile_error(&mut vm, "var s = \"unterminated");
}

#[test]
fn a_bare_syntax_error_does_not_run_any_code() {
    let mut vm = Vm::with_defaults();
    support::expect_compile_error(&mut vm, "var = = =");
    assert_eq!(vm.stdout, "", "a program that fails to compile must not execute any part of it");
}
