//! Shared helpers for integration tests: running a source string to
//! completion (or failure) and picking apart a raised exception without
//! every test re-deriving the same field-access boilerplate.

use ember::ExcType;
use ember::diagnostics::CollectingSink;
use ember::object::ObjectKind;
use ember::value::Value;
use ember::vm::Vm;

/// Runs `source` against a fresh module on `vm` and returns whatever
/// `run_source` does, panicking with the compile sink's errors if the
/// program failed to parse at all.
pub fn run(vm: &mut Vm, source: &str) -> Result<Value, ember::RunError> {
    let mut sink = CollectingSink::default();
    let result = vm.run_source("test", source, &mut sink);
    if sink.has_errors() {
        panic!("unexpected compile errors: {:?}", sink.errors);
    }
    result
}

/// Runs `source` expecting compilation itself to fail, returning the
/// collected diagnostic messages.
pub fn expect_compile_error(vm: &mut Vm, source: &str) -> Vec<String> {
    let mut sink = CollectingSink::default();
    let result = vm.run_source("test", source, &mut sink);
    assert!(sink.has_errors(), "expected a compile error, but compilation succeeded");
    assert!(result.is_err(), "a program that failed to compile must not report success");
    sink.errors.iter().map(|e| e.message.clone()).collect()
}

/// The `ExcType` of a raised exception instance, if it's one of the ten
/// bootstrapped built-in classes (not a user-defined subclass).
pub fn exc_kind(vm: &Vm, value: Value) -> Option<ExcType> {
    let Value::Object(id) = value else { return None };
    let class = vm.heap().get(id).header.class?;
    for kind in [
        ExcType::Exception,
        ExcType::TypeException,
        ExcType::NameException,
        ExcType::FieldException,
        ExcType::MethodException,
        ExcType::InvalidArgException,
        ExcType::IndexOutOfBoundException,
        ExcType::ImportException,
        ExcType::StackOverflowException,
        ExcType::SyntaxException,
    ] {
        if vm.builtins.exception_class(kind) == class {
            return Some(kind);
        }
    }
    None
}

/// The `message` field of a raised exception instance, as plain text.
pub fn exc_message(vm: &Vm, value: Value) -> String {
    let Value::Object(id) = value else { return String::new() };
    let key = Value::Object(vm.builtins.dunders.message);
    match vm.heap().instance_get_field(id, key) {
        Some(Value::Object(msg_id)) if vm.heap().kind(msg_id) == ObjectKind::String => vm.heap().string_str(msg_id).to_string(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

/// Reads back the elements of a `List` value as plain `Value`s, for
/// asserting on contents without going through string formatting.
pub fn list_items(vm: &Vm, value: Value) -> Vec<Value> {
    let Value::Object(id) = value else { panic!("expected a List value") };
    match &vm.heap().get(id).data {
        ember::object::ObjectData::List(l) => l.items.clone(),
        _ => panic!("expected a List value"),
    }
}
