//! `raise`'s attached `StackTrace` covers exactly the frames between the
//! raise site and the catching handler — not every frame still active below
//! it on the call stack.

mod support;

use ember::vm::Vm;

#[test]
fn caught_exception_trace_does_not_include_frames_below_the_handler() {
    let mut vm = Vm::with_defaults();
    let result = support::run(
        &mut vm,
        r#"
        fun inner() { raise Exception("boom") }
        fun middle() { inner() }
        var trace = null
        fun outer() {
            try {
                middle()
            } except Exception e {
                trace = e
            }
        }
        outer()
        trace
        "#,
    )
    .unwrap();

    let trace = vm.exception_stacktrace(result).expect("exception carries a stacktrace");
    // Frames between the raise site (`inner`) and the catching frame
    // (`outer`, inclusive) are: inner, middle, outer. Frames below `outer`
    // on the call stack (the top-level module frame that called `outer()`)
    // must not appear.
    assert_eq!(trace.frames.len(), 3, "expected exactly the frames between raise and catch, got {:?}", trace.frames);
}

#[test]
fn unhandled_exception_trace_covers_the_whole_call_stack() {
    let mut vm = Vm::with_defaults();
    let err = support::run(
        &mut vm,
        r#"
        fun inner() { raise Exception("boom") }
        fun outer() { inner() }
        outer()
        "#,
    )
    .unwrap_err();

    let trace = vm.exception_stacktrace(err.value).expect("exception carries a stacktrace");
    assert_eq!(trace.frames.len(), 3, "top-level module frame, outer, and inner: {:?}", trace.frames);
}
