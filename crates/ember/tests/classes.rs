//! Class declarations, inheritance (`is`), `super` dispatch, and the
//! attribute protocol's field-before-method lookup order.

mod support;

use ember::value::Value;
use ember::vm::Vm;

#[test]
fn construct_binds_fields_and_methods_see_them() {
    let mut vm = Vm::with_defaults();
    let result = support::run(
        &mut vm,
        r#"
        class Point {
            construct(x, y) { this.x = x; this.y = y }
            fun sum() { return this.x + this.y }
        }
        Point(3, 4).sum()
        "#,
    )
    .unwrap();
    assert_eq!(result, Value::Number(7.0));
}

#[test]
fn subclass_inherits_superclass_methods() {
    let mut vm = Vm::with_defaults();
    let result = support::run(
        &mut vm,
        r#"
        class Animal {
            construct(name) { this.name = name }
            fun speak() { return this.name }
        }
        class Dog is Animal { }
        Dog("Rex").speak()
        "#,
    )
    .unwrap();
    let Value::Object(id) = result else { panic!("expected a string") };
    assert_eq!(vm.heap().string_str(id), "Rex");
}

#[test]
fn subclass_can_override_and_call_up_via_super() {
    let mut vm = Vm::with_defaults();
    let result = support::run(
        &mut vm,
        r#"
        class Animal {
            construct(name) { this.name = name }
            fun describe() { return this.name }
        }
        class Dog is Animal {
            construct(name) { super(name) }
            fun describe() { return super.describe() }
        }
        Dog("Rex").describe()
        "#,
    )
    .unwrap();
    let Value::Object(id) = result else { panic!("expected a string") };
    assert_eq!(vm.heap().string_str(id), "Rex");
}

#[test]
fn instance_field_shadows_a_method_of_the_same_name() {
    let mut vm = Vm::with_defaults();
    let result = support::run(
        &mut vm,
        r#"
        class C {
            fun label() { return "method" }
        }
        var c = C()
        c.label = "field"
        c.label
        "#,
    )
    .unwrap();
    let Value::Object(id) = result else { panic!("expected a string") };
    assert_eq!(vm.heap().string_str(id), "field");
}

#[test]
fn missing_field_raises_field_exception() {
    let mut vm = Vm::with_defaults();
    let err = support::run(
        &mut vm,
        r#"
        class C { }
        C().missing
        "#,
    )
    .unwrap_err();
    assert_eq!(support::exc_kind(&vm, err.value), Some(ember::ExcType::FieldException));
}

#[test]
fn is_checks_the_whole_superclass_chain() {
    let mut vm = Vm::with_defaults();
    let result = support::run(
        &mut vm,
        r#"
        class Animal { }
        class Dog is Animal { }
        Dog() is Animal
        "#,
    )
    .unwrap();
    assert_eq!(result, Value::Bool(true));
}
