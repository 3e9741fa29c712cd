//! Binary/unary operators, attribute access (`GET_FIELD`/`SET_FIELD`), and
//! the subscript protocol (`SUBSCR_GET`/`SUBSCR_SET`).
//!
//! Arithmetic and comparison have a numeric fast path that never touches the
//! class system; everything else falls back to dunder-method dispatch
//! (`__add__`/`__radd__`/…) run synchronously via `call::run_call`, exactly
//! as an ordinary method call would be, so overloaded operators can
//! themselves raise, recurse, or call back into script code.

use crate::exception::{ExcType, RunResult};
use crate::object::{ObjectData, ObjectId, ObjectKind};
use crate::table::KeyOps;
use crate::value::Value;

use super::{Step, Vm};

/// The six reflected-arithmetic dunder pairs, in opcode dispatch order.
#[derive(Clone, Copy)]
enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
}

/// The four comparison dunders with no reflected counterpart.
#[derive(Clone, Copy)]
enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
}

impl Vm {
    pub(crate) fn op_binary_or_unary(&mut self, opcode: crate::compiler::opcode::Opcode) -> RunResult<Step> {
        use crate::compiler::opcode::Opcode;
        match opcode {
            Opcode::Add => self.arith(ArithOp::Add),
            Opcode::Sub => self.arith(ArithOp::Sub),
            Opcode::Mul => self.arith(ArithOp::Mul),
            Opcode::Div => self.arith(ArithOp::Div),
            Opcode::Mod => self.arith(ArithOp::Mod),
            Opcode::Pow => self.arith(ArithOp::Pow),
            Opcode::Lt => self.compare(CmpOp::Lt),
            Opcode::Le => self.compare(CmpOp::Le),
            Opcode::Gt => self.compare(CmpOp::Gt),
            Opcode::Ge => self.compare(CmpOp::Ge),
            Opcode::Eq => self.op_eq(),
            Opcode::Is => self.op_is(),
            Opcode::Neg => self.op_neg(),
            Opcode::Not => self.op_not(),
            _ => unreachable!("op_binary_or_unary called with {opcode:?}"),
        }
    }

    fn arith(&mut self, op: ArithOp) -> RunResult<Step> {
        let b = self.pop();
        let a = self.pop();
        if let (Value::Number(x), Value::Number(y)) = (a, b) {
            let result = match op {
                ArithOp::Add => x + y,
                ArithOp::Sub => x - y,
                ArithOp::Mul => x * y,
                ArithOp::Div => x / y,
                ArithOp::Mod => x % y,
                ArithOp::Pow => x.powf(y),
            };
            self.push(Value::Number(result));
            return Ok(Step::Continue);
        }
        let (forward, reflected) = self.arith_dunders(op);
        let name = self.arith_name(op);
        let result = self.dispatch_reflected(a, b, forward, reflected, name)?;
        self.push(result);
        Ok(Step::Continue)
    }

    fn arith_dunders(&self, op: ArithOp) -> (ObjectId, ObjectId) {
        let d = &self.builtins.dunders;
        match op {
            ArithOp::Add => (d.add, d.radd),
            ArithOp::Sub => (d.sub, d.rsub),
            ArithOp::Mul => (d.mul, d.rmul),
            ArithOp::Div => (d.div, d.rdiv),
            ArithOp::Mod => (d.modulo, d.rmod),
            ArithOp::Pow => (d.pow, d.rpow),
        }
    }

    fn arith_name(&self, op: ArithOp) -> &'static str {
        match op {
            ArithOp::Add => "+",
            ArithOp::Sub => "-",
            ArithOp::Mul => "*",
            ArithOp::Div => "/",
            ArithOp::Mod => "%",
            ArithOp::Pow => "**",
        }
    }

    fn compare(&mut self, op: CmpOp) -> RunResult<Step> {
        let b = self.pop();
        let a = self.pop();
        if let (Value::Number(x), Value::Number(y)) = (a, b) {
            let result = match op {
                CmpOp::Lt => x < y,
                CmpOp::Le => x <= y,
                CmpOp::Gt => x > y,
                CmpOp::Ge => x >= y,
            };
            self.push(Value::Bool(result));
            return Ok(Step::Continue);
        }
        let d = &self.builtins.dunders;
        let (forward, name) = match op {
            CmpOp::Lt => (d.lt, "<"),
            CmpOp::Le => (d.le, "<="),
            CmpOp::Gt => (d.gt, ">"),
            CmpOp::Ge => (d.ge, ">="),
        };
        let class = self.builtins.class_of(&self.heap, a);
        let Some(method) = self.heap.class_get_method(class, Value::Object(forward)) else {
            return Err(self.raise_exception(
                ExcType::TypeException,
                format!("unsupported operand type(s) for {name}"),
            ));
        };
        let base = self.push_pair(a, b);
        let result = self.run_call(base, 1, a, method)?;
        self.push(result);
        Ok(Step::Continue)
    }

    /// `EQ`: number/bool/null/handle compare by value with no class
    /// involved; otherwise `__eq__` is tried on the left operand's class,
    /// falling back to structural/identity equality (the same rule the
    /// table implementation itself uses for its keys) when no override
    /// exists — never to the reflected `__req__`, since equality has none.
    fn op_eq(&mut self) -> RunResult<Step> {
        let b = self.pop();
        let a = self.pop();
        let is_primitive = |v: Value| matches!(v, Value::Number(_) | Value::Bool(_) | Value::Null | Value::Handle(_));
        if is_primitive(a) || is_primitive(b) {
            self.push(Value::Bool(a == b));
            return Ok(Step::Continue);
        }
        let class = self.builtins.class_of(&self.heap, a);
        let eq = self.builtins.dunders.eq;
        let result = match self.heap.class_get_method(class, Value::Object(eq)) {
            Some(method) => {
                let base = self.push_pair(a, b);
                self.run_call(base, 1, a, method)?
            }
            None => Value::Bool(self.heap.values_equal(a, b)),
        };
        self.push(result);
        Ok(Step::Continue)
    }

    /// `IS`: isinstance-style check when the right operand is a class
    /// (matching `except` clauses compiled by `compile_except_chain`),
    /// plain identity/value equality otherwise.
    fn op_is(&mut self) -> RunResult<Step> {
        let b = self.pop();
        let a = self.pop();
        if let Value::Object(class_id) = b {
            if self.heap.kind(class_id) == ObjectKind::Class {
                let class_of_a = self.builtins.class_of(&self.heap, a);
                let is_instance = self.builtins.class_is_or_inherits(&self.heap, class_of_a, class_id);
                self.push(Value::Bool(is_instance));
                return Ok(Step::Continue);
            }
        }
        self.push(Value::Bool(a == b));
        Ok(Step::Continue)
    }

    fn op_neg(&mut self) -> RunResult<Step> {
        let a = self.pop();
        match a {
            Value::Number(n) => {
                self.push(Value::Number(-n));
                Ok(Step::Continue)
            }
            _ => Err(self.raise_exception(ExcType::TypeException, "bad operand type for unary -")),
        }
    }

    fn op_not(&mut self) -> RunResult<Step> {
        let a = self.pop();
        self.push(Value::Bool(!a.is_truthy()));
        Ok(Step::Continue)
    }

    /// Pushes `a` then `b` and returns the base index `run_call` needs (the
    /// slot `a` itself occupies, since a synchronous dunder call is made
    /// exactly like an ordinary one-argument method invocation).
    fn push_pair(&mut self, a: Value, b: Value) -> usize {
        let base = self.stack.len();
        self.push(a);
        self.push(b);
        base
    }

    /// Tries `forward` on `a`'s class, then `reflected` on `b`'s class; both
    /// missing is a `TypeException`.
    fn dispatch_reflected(
        &mut self,
        a: Value,
        b: Value,
        forward: ObjectId,
        reflected: ObjectId,
        name: &str,
    ) -> RunResult<Value> {
        let class_a = self.builtins.class_of(&self.heap, a);
        if let Some(method) = self.heap.class_get_method(class_a, Value::Object(forward)) {
            let base = self.push_pair(a, b);
            return self.run_call(base, 1, a, method);
        }
        let class_b = self.builtins.class_of(&self.heap, b);
        if let Some(method) = self.heap.class_get_method(class_b, Value::Object(reflected)) {
            let base = self.push_pair(b, a);
            return self.run_call(base, 1, b, method);
        }
        Err(self.raise_exception(ExcType::TypeException, format!("unsupported operand type(s) for {name}")))
    }

    /// `GET_FIELD`: instances check fields before methods (`FieldException`
    /// if neither has it), modules check globals before module-class
    /// methods, anything else resolves directly on its class's methods.
    pub(crate) fn op_get_field(&mut self) -> RunResult<Step> {
        let name_idx = self.fetch_u16();
        let name = self.current_constant(name_idx);
        let receiver = self.pop();
        let value = self.get_field(receiver, name)?;
        self.push(value);
        Ok(Step::Continue)
    }

    fn get_field(&mut self, receiver: Value, name: Value) -> RunResult<Value> {
        if let Value::Object(id) = receiver {
            match self.heap.kind(id) {
                ObjectKind::Instance => {
                    if let Some(field) = self.heap.instance_get_field(id, name) {
                        return Ok(field);
                    }
                    let class = self.builtins.class_of(&self.heap, receiver);
                    return match self.heap.class_get_method(class, name) {
                        Some(method) => Ok(Value::Object(self.bind_method(receiver, method))),
                        None => Err(self.field_error(name)),
                    };
                }
                ObjectKind::Module => {
                    if let Some(value) = self.heap.module_get_global(id, name) {
                        return Ok(value);
                    }
                    let class = self.builtins.module_class;
                    return match self.heap.class_get_method(class, name) {
                        Some(method) => Ok(Value::Object(self.bind_method(receiver, method))),
                        None => Err(self.name_error(name)),
                    };
                }
                _ => {}
            }
        }
        let class = self.builtins.class_of(&self.heap, receiver);
        match self.heap.class_get_method(class, name) {
            Some(method) => Ok(Value::Object(self.bind_method(receiver, method))),
            None => Err(self.method_error(name)),
        }
    }

    fn bind_method(&mut self, receiver: Value, method: Value) -> ObjectId {
        self.heap.alloc_bound_method(receiver, method, Some(self.builtins.bound_method_class))
    }

    fn field_error(&mut self, name: Value) -> crate::exception::RunError {
        let shown = self.name_text(name);
        self.raise_exception(ExcType::FieldException, format!("no such field '{shown}'"))
    }

    fn name_text(&self, name: Value) -> String {
        match name {
            Value::Object(id) if self.heap.kind(id) == ObjectKind::String => self.heap.string_str(id).to_string(),
            _ => "<name>".to_string(),
        }
    }

    /// `SET_FIELD`: only instances and modules may be assigned to; leaves
    /// the assigned value on the stack (the result of the assignment
    /// expression, matching every other assignment form).
    pub(crate) fn op_set_field(&mut self) -> RunResult<Step> {
        let name_idx = self.fetch_u16();
        let name = self.current_constant(name_idx);
        let value = self.pop();
        let receiver = self.pop();
        match receiver {
            Value::Object(id) if self.heap.kind(id) == ObjectKind::Instance => {
                self.heap.instance_set_field(id, name, value);
            }
            Value::Object(id) if self.heap.kind(id) == ObjectKind::Module => {
                self.heap.module_set_global(id, name, value);
            }
            _ => {
                return Err(self.raise_exception(ExcType::TypeException, "field assignment requires an instance or module"));
            }
        }
        self.push(value);
        Ok(Step::Continue)
    }

    /// `SUBSCR_GET`: list/tuple/string index directly with bounds checking;
    /// table looks its key up (`null` if absent — tables aren't covered by
    /// spec's list/tuple/string subscript text, but a literal `{}` needs
    /// some way to read back what it stores); anything else dispatches
    /// `__get__`.
    pub(crate) fn op_subscr_get(&mut self) -> RunResult<Step> {
        let index = self.pop();
        let receiver = self.pop();
        let value = self.subscr_get(receiver, index)?;
        self.push(value);
        Ok(Step::Continue)
    }

    fn subscr_get(&mut self, receiver: Value, index: Value) -> RunResult<Value> {
        let Value::Object(id) = receiver else {
            return self.subscr_get_dunder(receiver, index);
        };
        match self.heap.kind(id) {
            ObjectKind::List => {
                let len = self.list_len(id);
                let i = self.index_in_bounds(index, len)?;
                Ok(self.list_item(id, i))
            }
            ObjectKind::Tuple => {
                let len = self.tuple_len(id);
                let i = self.index_in_bounds(index, len)?;
                Ok(self.tuple_item(id, i))
            }
            ObjectKind::String => {
                let len = self.heap.string_bytes(id).len();
                let i = self.index_in_bounds(index, len)?;
                let byte = self.heap.string_bytes(id)[i];
                let ch = self.heap.alloc_string(vec![byte], Some(self.builtins.string_class));
                Ok(Value::Object(ch))
            }
            ObjectKind::Table => Ok(self.heap.table_get(id, index).unwrap_or(Value::Null)),
            _ => self.subscr_get_dunder(receiver, index),
        }
    }

    fn list_len(&self, id: ObjectId) -> usize {
        match &self.heap.get(id).data {
            ObjectData::List(l) => l.items.len(),
            _ => unreachable!(),
        }
    }

    fn list_item(&self, id: ObjectId, i: usize) -> Value {
        match &self.heap.get(id).data {
            ObjectData::List(l) => l.items[i],
            _ => unreachable!(),
        }
    }

    fn tuple_len(&self, id: ObjectId) -> usize {
        match &self.heap.get(id).data {
            ObjectData::Tuple(t) => t.items.len(),
            _ => unreachable!(),
        }
    }

    fn tuple_item(&self, id: ObjectId, i: usize) -> Value {
        match &self.heap.get(id).data {
            ObjectData::Tuple(t) => t.items[i],
            _ => unreachable!(),
        }
    }

    fn subscr_get_dunder(&mut self, receiver: Value, index: Value) -> RunResult<Value> {
        let class = self.builtins.class_of(&self.heap, receiver);
        let get = self.builtins.dunders.get;
        match self.heap.class_get_method(class, Value::Object(get)) {
            Some(method) => {
                let base = self.push_pair(receiver, index);
                self.run_call(base, 1, receiver, method)
            }
            None => Err(self.raise_exception(ExcType::TypeException, "value does not support subscripting")),
        }
    }

    /// `SUBSCR_SET`: direct index assignment on list/table (tuples and
    /// strings are immutable and fall through to `__set__`, matching
    /// whatever their class registers — none today, so that path raises);
    /// leaves the assigned value on the stack like `SET_FIELD`.
    pub(crate) fn op_subscr_set(&mut self) -> RunResult<Step> {
        let value = self.pop();
        let index = self.pop();
        let receiver = self.pop();
        self.subscr_set(receiver, index, value)?;
        self.push(value);
        Ok(Step::Continue)
    }

    fn subscr_set(&mut self, receiver: Value, index: Value, value: Value) -> RunResult<()> {
        let Value::Object(id) = receiver else {
            return self.subscr_set_dunder(receiver, index, value);
        };
        match self.heap.kind(id) {
            ObjectKind::List => {
                let len = match &self.heap.get(id).data {
                    ObjectData::List(list) => list.items.len(),
                    _ => unreachable!(),
                };
                let i = self.index_in_bounds(index, len)?;
                if let ObjectData::List(list) = &mut self.heap.get_mut(id).data {
                    list.items[i] = value;
                }
                Ok(())
            }
            ObjectKind::Table => {
                self.heap.table_set(id, index, value);
                Ok(())
            }
            _ => self.subscr_set_dunder(receiver, index, value),
        }
    }

    fn subscr_set_dunder(&mut self, receiver: Value, index: Value, value: Value) -> RunResult<()> {
        let class = self.builtins.class_of(&self.heap, receiver);
        let set = self.builtins.dunders.set;
        match self.heap.class_get_method(class, Value::Object(set)) {
            Some(method) => {
                let base = self.stack.len();
                self.push(receiver);
                self.push(index);
                self.push(value);
                self.run_call(base, 2, receiver, method)?;
                Ok(())
            }
            None => Err(self.raise_exception(ExcType::TypeException, "value does not support subscript assignment")),
        }
    }

    /// Validates `index` is an in-range integer `Number`, returning it as a
    /// `usize`; negative indices are not part of spec.md's subscript text,
    /// so only `0..len` is accepted.
    fn index_in_bounds(&mut self, index: Value, len: usize) -> RunResult<usize> {
        let Value::Number(n) = index else {
            return Err(self.raise_exception(ExcType::TypeException, "index must be a number"));
        };
        let i = n as i64;
        if n.fract() != 0.0 || i < 0 || i as usize >= len {
            return Err(self.raise_exception(ExcType::IndexOutOfBoundException, format!("index {n} out of bounds")));
        }
        Ok(i as usize)
    }
}
