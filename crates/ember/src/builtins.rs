//! Bootstrap of the classes and dunder names the VM needs to exist before
//! any script runs: the per-`ObjectKind` receiver classes attribute lookup
//! falls back to, the `Exception` hierarchy §6 names as the runtime's
//! minimum exception-class list, and the handful of builtin classes a
//! script can directly instantiate (`List`, `Tuple`, `Number`, `Boolean`,
//! `String`).
//!
//! There is no script-level "core library" source file backing these (the
//! host-facing module loader and built-in modules are explicitly out of
//! scope per spec.md §1); instead they are native Rust classes constructed
//! once per `Vm` and seeded into every new module's globals table, playing
//! the role spec.md §6 ascribes to "the bootstrapped core library".
//!
//! Every name below is a heap-interned `ObjectId`, the same key type every
//! method table, field table, and globals table uses — not an
//! [`crate::intern::StringId`], which is reserved for `FunctionObj`/
//! `NativeObj`'s debug-only display names.

use crate::exception::{ExcType, RunResult};
use crate::heap::Heap;
use crate::intern::Interns;
use crate::native::{Arity, Native, NativeFn, NativeObj};
use crate::object::{ObjectData, ObjectId, ObjectKind};
use crate::value::Value;
use crate::vm::Vm;

/// Interned names of every dunder method the VM's opcodes dispatch to, so
/// dispatch never has to re-intern a literal at a hot path.
#[derive(Debug, Clone, Copy)]
pub struct Dunders {
    pub construct: ObjectId,
    pub iter: ObjectId,
    pub next: ObjectId,
    pub close: ObjectId,
    pub add: ObjectId,
    pub radd: ObjectId,
    pub sub: ObjectId,
    pub rsub: ObjectId,
    pub mul: ObjectId,
    pub rmul: ObjectId,
    pub div: ObjectId,
    pub rdiv: ObjectId,
    pub modulo: ObjectId,
    pub rmod: ObjectId,
    pub pow: ObjectId,
    pub rpow: ObjectId,
    pub eq: ObjectId,
    pub lt: ObjectId,
    pub le: ObjectId,
    pub gt: ObjectId,
    pub ge: ObjectId,
    pub get: ObjectId,
    pub set: ObjectId,
    pub message: ObjectId,
    pub args: ObjectId,
    pub stacktrace: ObjectId,
}

impl Dunders {
    fn new(heap: &mut Heap) -> Self {
        let mut name = |s: &str| heap.intern_string(s.as_bytes(), None);
        Self {
            construct: name("construct"),
            iter: name("__iter__"),
            next: name("__next__"),
            close: name("close"),
            add: name("__add__"),
            radd: name("__radd__"),
            sub: name("__sub__"),
            rsub: name("__rsub__"),
            mul: name("__mul__"),
            rmul: name("__rmul__"),
            div: name("__div__"),
            rdiv: name("__rdiv__"),
            modulo: name("__mod__"),
            rmod: name("__rmod__"),
            pow: name("__pow__"),
            rpow: name("__rpow__"),
            eq: name("__eq__"),
            lt: name("__lt__"),
            le: name("__le__"),
            gt: name("__gt__"),
            ge: name("__ge__"),
            get: name("__get__"),
            set: name("__set__"),
            message: name("message"),
            args: name("args"),
            stacktrace: name("stacktrace"),
        }
    }
}

/// Cached `ObjectId`s for every class the VM consults outside normal
/// user-level class lookup: the receiver class for each `ObjectKind` (used
/// by `GET_FIELD` on non-instance values and by method-not-found fallback),
/// the ten `ExcType` exception classes, and the name table above.
pub struct Builtins {
    pub dunders: Dunders,
    pub class_class: ObjectId,
    pub module_class: ObjectId,
    pub function_class: ObjectId,
    pub native_class: ObjectId,
    pub closure_class: ObjectId,
    pub upvalue_class: ObjectId,
    pub bound_method_class: ObjectId,
    pub list_class: ObjectId,
    pub tuple_class: ObjectId,
    pub table_class: ObjectId,
    pub stack_trace_class: ObjectId,
    pub userdata_class: ObjectId,
    pub generator_class: ObjectId,
    pub string_class: ObjectId,
    pub number_class: ObjectId,
    pub boolean_class: ObjectId,
    pub null_class: ObjectId,
    /// Indexed by `ExcType as usize`.
    pub exceptions: [ObjectId; 10],
    /// `print`, the one free function seeded into every module's globals.
    pub print: ObjectId,
}

fn new_bare_class(heap: &mut Heap, name: &str) -> ObjectId {
    let name_id = heap.intern_string(name.as_bytes(), None);
    heap.alloc_class(name_id, None, None)
}

/// Interns `name` as a table key, allocates a native wrapping `func`, and
/// installs it on `class_id`'s method table. `interns` only backs the
/// native's debug display name, never the table key.
fn native_fn(heap: &mut Heap, interns: &mut Interns, class_id: ObjectId, name: &str, arity: Arity, func: NativeFn) {
    let key = heap.intern_string(name.as_bytes(), None);
    let debug_name = interns.intern_str(name);
    let native = heap.alloc_native(NativeObj { name: Some(debug_name), native: Native { arity, func } }, None);
    heap.class_set_method(class_id, Value::Object(key), Value::Object(native));
}

fn exception_construct(vm: &mut Vm, this: Value, args: &[Value]) -> RunResult<Value> {
    let Value::Object(instance_id) = this else { unreachable!("exception @construct always receives an instance") };
    let message = args.first().copied().unwrap_or(Value::Null);
    let key = Value::Object(vm.builtins.dunders.message);
    vm.heap.instance_set_field(instance_id, key, message);
    Ok(this)
}

fn list_construct(vm: &mut Vm, _this: Value, args: &[Value]) -> RunResult<Value> {
    Ok(Value::Object(vm.heap.alloc_list(args.to_vec(), Some(vm.builtins.list_class))))
}

fn tuple_construct(vm: &mut Vm, _this: Value, args: &[Value]) -> RunResult<Value> {
    Ok(Value::Object(vm.heap.alloc_tuple(args.to_vec(), Some(vm.builtins.tuple_class))))
}

fn number_construct(vm: &mut Vm, _this: Value, args: &[Value]) -> RunResult<Value> {
    match args.first() {
        Some(Value::Number(n)) => Ok(Value::Number(*n)),
        Some(Value::Bool(b)) => Ok(Value::Number(if *b { 1.0 } else { 0.0 })),
        Some(Value::Object(id)) if vm.heap.kind(*id) == ObjectKind::String => {
            let s = vm.heap.string_str(*id);
            Ok(Value::Number(s.trim().parse::<f64>().unwrap_or(f64::NAN)))
        }
        _ => Ok(Value::Number(0.0)),
    }
}

fn boolean_construct(_vm: &mut Vm, _this: Value, args: &[Value]) -> RunResult<Value> {
    Ok(Value::Bool(args.first().is_some_and(Value::is_truthy)))
}

fn string_construct(vm: &mut Vm, _this: Value, args: &[Value]) -> RunResult<Value> {
    let text = match args.first() {
        Some(v) => vm.display_value(*v),
        None => String::new(),
    };
    Ok(Value::Object(vm.heap.alloc_string(text.into_bytes(), Some(vm.builtins.string_class))))
}

/// `List.add(value)`: appends in place and returns the appended value,
/// matching the Wren-flavored core library this language's grammar borrows
/// from (`__iter__`/`__next__` naming, `construct`/`is`) rather than
/// Python's `None`-returning `append`.
fn list_add(vm: &mut Vm, this: Value, args: &[Value]) -> RunResult<Value> {
    let Value::Object(id) = this else { unreachable!("List.add always receives a List instance") };
    let value = args.first().copied().unwrap_or(Value::Null);
    if let ObjectData::List(l) = &mut vm.heap.get_mut(id).data {
        l.items.push(value);
    }
    Ok(value)
}

fn list_len(vm: &mut Vm, this: Value, _args: &[Value]) -> RunResult<Value> {
    let Value::Object(id) = this else { unreachable!("List.len always receives a List instance") };
    let ObjectData::List(l) = &vm.heap.get(id).data else { unreachable!() };
    Ok(Value::Number(l.items.len() as f64))
}

fn tuple_len(vm: &mut Vm, this: Value, _args: &[Value]) -> RunResult<Value> {
    let Value::Object(id) = this else { unreachable!("Tuple.len always receives a Tuple instance") };
    let ObjectData::Tuple(t) = &vm.heap.get(id).data else { unreachable!() };
    Ok(Value::Number(t.items.len() as f64))
}

fn string_len(vm: &mut Vm, this: Value, _args: &[Value]) -> RunResult<Value> {
    let Value::Object(id) = this else { unreachable!("String.len always receives a String instance") };
    Ok(Value::Number(vm.heap.string_bytes(id).len() as f64))
}

/// `String.__add__(other)`: byte-wise concatenation. The numeric fast path
/// in `vm/ops.rs` never reaches this — only string-on-the-left `+` (or any
/// `__radd__`-seeking fallback) dispatches here.
fn string_add(vm: &mut Vm, this: Value, args: &[Value]) -> RunResult<Value> {
    let Value::Object(id) = this else { unreachable!("String.__add__ always receives a String instance") };
    let Some(&other) = args.first() else {
        return Err(vm.raise_exception(ExcType::TypeException, "__add__ expects one argument"));
    };
    let rhs = vm.display_value(other);
    let mut bytes = vm.heap.string_bytes(id).to_vec();
    bytes.extend_from_slice(rhs.as_bytes());
    Ok(Value::Object(vm.heap.alloc_string(bytes, Some(vm.builtins.string_class))))
}

fn table_len(vm: &mut Vm, this: Value, _args: &[Value]) -> RunResult<Value> {
    let Value::Object(id) = this else { unreachable!("Table.len always receives a Table instance") };
    let ObjectData::Table(t) = &vm.heap.get(id).data else { unreachable!() };
    Ok(Value::Number(t.len() as f64))
}

/// `print(..values)`: the one free function every module's globals carry
/// without an explicit import — spec.md's end-to-end scenarios (§8) call it
/// bare, so it can't live behind the excluded `io` module; it is the
/// minimum the core needs to make those scenarios observable at all. Joins
/// its arguments with a space and appends one newline, written to
/// [`Vm::stdout`] rather than a real file descriptor (source-file/host I/O
/// is explicitly out of scope per spec.md §1).
fn print_native(vm: &mut Vm, _this: Value, args: &[Value]) -> RunResult<Value> {
    let parts: Vec<String> = args.iter().map(|v| vm.display_value(*v)).collect();
    vm.stdout.push_str(&parts.join(" "));
    vm.stdout.push('\n');
    Ok(Value::Null)
}

impl Builtins {
    /// Creates every core class and binds their native methods. Must run
    /// once per `Vm`, before any user module is compiled, since the
    /// compiler's global-name resolution and the globals-seeding step in
    /// module creation both depend on these ids.
    pub fn bootstrap(heap: &mut Heap, interns: &mut Interns) -> Self {
        let dunders = Dunders::new(heap);

        let class_class = new_bare_class(heap, "Class");
        let module_class = new_bare_class(heap, "Module");
        let function_class = new_bare_class(heap, "Function");
        let native_class = new_bare_class(heap, "Native");
        let closure_class = new_bare_class(heap, "Closure");
        let upvalue_class = new_bare_class(heap, "Upvalue");
        let bound_method_class = new_bare_class(heap, "BoundMethod");
        let list_class = new_bare_class(heap, "List");
        let tuple_class = new_bare_class(heap, "Tuple");
        let table_class = new_bare_class(heap, "Table");
        let stack_trace_class = new_bare_class(heap, "StackTrace");
        let userdata_class = new_bare_class(heap, "Userdata");
        let generator_class = new_bare_class(heap, "Generator");
        let string_class = new_bare_class(heap, "String");
        let number_class = new_bare_class(heap, "Number");
        let boolean_class = new_bare_class(heap, "Boolean");
        let null_class = new_bare_class(heap, "Null");

        native_fn(heap, interns, list_class, "construct", Arity { most: 0, defaults: 0, variadic: true }, list_construct);
        native_fn(heap, interns, tuple_class, "construct", Arity { most: 0, defaults: 0, variadic: true }, tuple_construct);
        native_fn(heap, interns, number_class, "construct", Arity { most: 1, defaults: 1, variadic: false }, number_construct);
        native_fn(heap, interns, boolean_class, "construct", Arity { most: 1, defaults: 1, variadic: false }, boolean_construct);
        native_fn(heap, interns, string_class, "construct", Arity { most: 1, defaults: 1, variadic: false }, string_construct);

        native_fn(heap, interns, list_class, "add", Arity::fixed(1), list_add);
        native_fn(heap, interns, list_class, "len", Arity::fixed(0), list_len);
        native_fn(heap, interns, tuple_class, "len", Arity::fixed(0), tuple_len);
        native_fn(heap, interns, table_class, "len", Arity::fixed(0), table_len);
        native_fn(heap, interns, string_class, "len", Arity::fixed(0), string_len);
        native_fn(heap, interns, string_class, "__add__", Arity::fixed(1), string_add);

        let print_debug_name = interns.intern_str("print");
        let print = heap.alloc_native(
            NativeObj { name: Some(print_debug_name), native: Native { arity: Arity { most: 0, defaults: 0, variadic: true }, func: print_native } },
            None,
        );

        let exception_base = new_bare_class(heap, "Exception");
        native_fn(heap, interns, exception_base, "construct", Arity { most: 1, defaults: 1, variadic: false }, exception_construct);

        let exception_names = [
            "Exception",
            "TypeException",
            "NameException",
            "FieldException",
            "MethodException",
            "InvalidArgException",
            "IndexOutOfBoundException",
            "ImportException",
            "StackOverflowException",
            "SyntaxException",
        ];
        let mut exceptions = [exception_base; 10];
        for (i, name) in exception_names.iter().enumerate().skip(1) {
            let class = new_bare_class(heap, name);
            heap.class_inherit_methods(class, exception_base);
            if let ObjectData::Class(c) = &mut heap.get_mut(class).data {
                c.superclass = Some(exception_base);
            }
            exceptions[i] = class;
        }

        Self {
            dunders,
            class_class,
            module_class,
            function_class,
            native_class,
            closure_class,
            upvalue_class,
            bound_method_class,
            list_class,
            tuple_class,
            table_class,
            stack_trace_class,
            userdata_class,
            generator_class,
            string_class,
            number_class,
            boolean_class,
            null_class,
            exceptions,
            print,
        }
    }

    #[must_use]
    pub fn exception_class(&self, kind: ExcType) -> ObjectId {
        self.exceptions[kind as usize]
    }

    /// The receiver class used for attribute lookup / overload dispatch on
    /// a value that isn't an `Instance` — `GET_FIELD` on e.g. a `List`
    /// falls through to this class's methods per §4.5's attribute protocol.
    #[must_use]
    pub fn class_for_kind(&self, kind: ObjectKind) -> ObjectId {
        match kind {
            ObjectKind::String => self.string_class,
            ObjectKind::Class => self.class_class,
            ObjectKind::Instance => unreachable!("instances carry their own class in the header"),
            ObjectKind::Module => self.module_class,
            ObjectKind::Function => self.function_class,
            ObjectKind::Native => self.native_class,
            ObjectKind::Closure => self.closure_class,
            ObjectKind::Upvalue => self.upvalue_class,
            ObjectKind::BoundMethod => self.bound_method_class,
            ObjectKind::List => self.list_class,
            ObjectKind::Tuple => self.tuple_class,
            ObjectKind::Table => self.table_class,
            ObjectKind::StackTrace => self.stack_trace_class,
            ObjectKind::Userdata => self.userdata_class,
            ObjectKind::Generator => self.generator_class,
        }
    }

    /// The class of any `Value`, including the three non-object variants
    /// that still answer to a class (`Number`, `Bool`, `Null`).
    #[must_use]
    pub fn class_of(&self, heap: &Heap, value: Value) -> ObjectId {
        match value {
            Value::Null => self.null_class,
            Value::Bool(_) => self.boolean_class,
            Value::Number(_) => self.number_class,
            Value::Handle(_) => self.userdata_class,
            Value::Object(id) => heap.get(id).header.class.unwrap_or_else(|| self.class_for_kind(heap.kind(id))),
        }
    }

    /// Is `class_id` (or one of its superclasses) `ancestor`? Used by `IS`'s
    /// instanceof-style form and by except-clause matching.
    #[must_use]
    pub fn class_is_or_inherits(&self, heap: &Heap, mut class_id: ObjectId, ancestor: ObjectId) -> bool {
        loop {
            if class_id == ancestor {
                return true;
            }
            match heap.class_superclass(class_id) {
                Some(sup) => class_id = sup,
                None => return false,
            }
        }
    }
}

/// Extra native registration surface for hosts: binds `name` as a free
/// function in `module`'s globals, exactly the shape `NATIVE nameIdx`
/// resolves at runtime via a module's attached [`crate::native::NativeExtension`],
/// but usable directly by embedders/tests without building a whole registry.
pub fn define_native_function(heap: &mut Heap, module: ObjectId, name: &str, arity: Arity, func: NativeFn) {
    let name_id = heap.intern_string(name.as_bytes(), None);
    let native = heap.alloc_native(NativeObj { name: None, native: Native { arity, func } }, None);
    heap.module_set_global(module, Value::Object(name_id), Value::Object(native));
}
