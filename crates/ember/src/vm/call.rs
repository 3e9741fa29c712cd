//! The call protocol: dispatching `CALL`/`INVOKE`/`SUPER` (and their short
//! fixed-arity forms) to a closure, native, bound method, or class
//! constructor, and the two ways a call's result makes it back to its
//! caller — the top-level dispatch loop driving its own frame, or a nested
//! synchronous call made on the Rust call stack by operator-overload
//! dispatch (`vm/ops.rs`) and the iteration protocol (`vm/iterate.rs`).

use crate::exception::ExcType;
use crate::object::{BoundMethodObj, GeneratorState, ObjectData, ObjectId, ObjectKind};
use crate::value::Value;

use super::{Frame, Step, Vm};

/// What `dispatch_call` did with the callee.
pub(crate) enum Dispatch {
    /// Pushed a new frame; the main loop must keep stepping until it pops.
    Pushed,
    /// Ran to completion without pushing a frame (a native, or a
    /// zero-bytecode intrinsic construct) — its result is already on the
    /// stack at `base`.
    Finished,
}

/// Render the "at most/at least/exactly" wording the call protocol requires
/// for arity mismatches, picking the phrasing from whichever bound `argc`
/// actually violated.
fn arity_message(least: u8, most: u8, variadic: bool, argc: u8) -> String {
    let plural = |n: u8| if n == 1 { "argument" } else { "arguments" };
    if least == most && !variadic {
        format!("expected exactly {least} {}, got {argc}", plural(least))
    } else if argc < least {
        format!("expected at least {least} {}, got {argc}", plural(least))
    } else {
        format!("expected at most {most} {}, got {argc}", plural(most))
    }
}

impl Vm {
    pub(crate) fn op_call(&mut self, opcode: crate::compiler::opcode::Opcode) -> crate::exception::RunResult<Step> {
        let argc = match opcode.short_call_argc() {
            Some(n) => n,
            None => self.fetch_u8(),
        };
        let base = self.stack.len() - argc as usize - 1;
        let callee = self.stack[base];
        self.begin_call(base, argc, Value::Null, callee)
    }

    pub(crate) fn op_invoke(&mut self, opcode: crate::compiler::opcode::Opcode) -> crate::exception::RunResult<Step> {
        let argc = match opcode.short_call_argc() {
            Some(n) => n,
            None => self.fetch_u8(),
        };
        let name_idx = self.fetch_u16();
        let name = self.current_constant(name_idx);
        let base = self.stack.len() - argc as usize - 1;
        let receiver = self.stack[base];
        let method = self.resolve_attr(receiver, name)?;
        self.begin_call(base, argc, receiver, method)
    }

    pub(crate) fn op_super(&mut self, opcode: crate::compiler::opcode::Opcode) -> crate::exception::RunResult<Step> {
        let argc = match opcode.short_call_argc() {
            Some(n) => n,
            None => self.fetch_u8(),
        };
        let name_idx = self.fetch_u16();
        let name = self.current_constant(name_idx);
        let base = self.stack.len() - argc as usize - 1;
        let receiver = self.stack[base];
        let method = self.resolve_super_method(name)?;
        self.begin_call(base, argc, receiver, method)
    }

    pub(crate) fn op_super_bind(&mut self) -> crate::exception::RunResult<Step> {
        let name_idx = self.fetch_u16();
        let name = self.current_constant(name_idx);
        let method = self.resolve_super_method(name)?;
        let receiver = self.pop();
        let bound = self.heap.alloc_bound_method(receiver, method, Some(self.builtins.bound_method_class));
        self.push(Value::Object(bound));
        Ok(Step::Continue)
    }

    /// Resolves `name` on the current method's *declared* class's
    /// superclass (the class `DEF_METHOD` attached to the running
    /// function), not on the receiver's dynamic class.
    fn resolve_super_method(&mut self, name: Value) -> crate::exception::RunResult<Value> {
        let frame = self.frames.last().expect("no active frame");
        let function_id = self.closure_function(frame.closure);
        let owner = self.function_ref(function_id).owner_class.expect("super used outside a method");
        let superclass = self.heap.class_superclass(owner).expect("super used in a class with no superclass");
        self.heap
            .class_get_method(superclass, name)
            .ok_or_else(|| self.method_error(name))
    }

    pub(crate) fn method_error(&mut self, name: Value) -> crate::exception::RunError {
        let shown = match name {
            Value::Object(id) if self.heap.kind(id) == ObjectKind::String => self.heap.string_str(id).to_string(),
            _ => "<name>".to_string(),
        };
        self.raise_exception(ExcType::MethodException, format!("no such method '{shown}'"))
    }

    /// Looks up `name` on `receiver`'s class chain: an instance field wins
    /// over a method of the same name, otherwise methods are resolved
    /// through the receiver's class and bound if found.
    pub(crate) fn resolve_attr(&mut self, receiver: Value, name: Value) -> crate::exception::RunResult<Value> {
        if let Value::Object(id) = receiver {
            if self.heap.kind(id) == ObjectKind::Instance {
                if let Some(field) = self.heap.instance_get_field(id, name) {
                    return Ok(field);
                }
            }
        }
        let class = self.builtins.class_of(&self.heap, receiver);
        match self.heap.class_get_method(class, name) {
            Some(method) => {
                let bound = self.heap.alloc_bound_method(receiver, method, Some(self.builtins.bound_method_class));
                Ok(Value::Object(bound))
            }
            None => Err(self.method_error(name)),
        }
    }

    fn begin_call(&mut self, base: usize, argc: u8, this: Value, callee: Value) -> crate::exception::RunResult<Step> {
        match self.dispatch_call(base, argc, this, callee)? {
            Dispatch::Pushed | Dispatch::Finished => Ok(Step::Continue),
        }
    }

    /// Resolves `callee` (unwrapping any chain of `BoundMethod`s) and either
    /// pushes a new frame for it or runs it to completion in place,
    /// normalizing the operand stack to `[.., result]` at `base` either way.
    pub(crate) fn dispatch_call(&mut self, base: usize, argc: u8, this: Value, callee: Value) -> crate::exception::RunResult<Dispatch> {
        let (this, callee) = self.unwrap_bound_method(this, callee);
        self.stack[base] = this;

        let Value::Object(callee_id) = callee else {
            return Err(self.raise_exception(ExcType::TypeException, "value is not callable"));
        };

        match self.heap.kind(callee_id) {
            ObjectKind::Closure => self.call_closure(base, argc, callee_id),
            ObjectKind::Native => {
                self.call_native(base, argc, callee_id, this)?;
                Ok(Dispatch::Finished)
            }
            ObjectKind::Class => self.call_construct(base, argc, callee_id),
            _ => Err(self.raise_exception(ExcType::TypeException, "value is not callable")),
        }
    }

    fn unwrap_bound_method(&self, mut this: Value, mut callee: Value) -> (Value, Value) {
        while let Value::Object(id) = callee {
            if self.heap.kind(id) != ObjectKind::BoundMethod {
                break;
            }
            let ObjectData::BoundMethod(BoundMethodObj { receiver, method }) = &self.heap.get(id).data else { unreachable!() };
            this = *receiver;
            callee = *method;
        }
        (this, callee)
    }

    fn call_closure(&mut self, base: usize, argc: u8, closure_id: ObjectId) -> crate::exception::RunResult<Dispatch> {
        if self.limits.recursion_exceeded(self.frames.len()) {
            return Err(self.raise_exception(ExcType::StackOverflowException, "call stack depth exceeded"));
        }
        let function_id = self.closure_function(closure_id);
        let function = self.function_ref(function_id);
        let arity = function.arity;
        // `arity.most` already excludes the variadic collector's own slot
        // (see `compiler::compile_params`), so it's directly the count of
        // caller-supplied fixed/defaulted argument slots for both the
        // variadic and non-variadic case.
        let fixed_count = arity.most;
        let is_method = function.is_method;
        let is_generator = function.is_generator;
        let owner_class = function.owner_class;
        let defaults = function.defaults.clone();
        let variadic = arity.variadic;
        let most = arity.most;
        let least = arity.least();
        let name = function.name;

        if argc < least || (!variadic && argc > most) {
            return Err(self.raise_exception(ExcType::TypeException, arity_message(least, most, variadic, argc)));
        }

        // Pad missing trailing parameters (those with defaults) up to `fixed_count`.
        let mut argc = argc;
        while (argc as usize) < fixed_count as usize {
            let default_index = argc as usize - (fixed_count as usize - defaults.len());
            self.push(defaults[default_index]);
            argc += 1;
        }

        if variadic {
            let extra_count = argc as usize - fixed_count as usize;
            let start = self.stack.len() - extra_count;
            let extra = self.stack.split_off(start);
            let tuple = self.heap.alloc_tuple(extra, Some(self.builtins.tuple_class));
            self.push(Value::Object(tuple));
        }

        // Calling a generator function never runs its body: it bundles the
        // already-bound argument slots into a fresh `Generator` in its `New`
        // state and hands that back as the call's result. Execution only
        // begins once something resumes it (`FOR_ITER`'s `resume_generator`,
        // or an explicit `__next__` call).
        if is_generator {
            let bound_args = self.stack.split_off(base);
            let gen_id = self.start_generator(closure_id, bound_args);
            self.push(Value::Object(gen_id));
            return Ok(Dispatch::Finished);
        }

        let is_initializer = is_method && owner_class.is_some() && self.function_is_construct(function_id);
        self.frames.push(Frame { closure: closure_id, ip: 0, base, handlers: smallvec::SmallVec::new(), is_initializer, generator: None });
        self.tracer.on_call(name, self.frames.len());
        Ok(Dispatch::Pushed)
    }

    fn function_is_construct(&self, function_id: ObjectId) -> bool {
        let function = self.function_ref(function_id);
        function.name.is_some_and(|n| self.interns.as_str(n) == "construct")
    }

    fn start_generator(&mut self, closure_id: ObjectId, bound_args: Vec<Value>) -> ObjectId {
        let gen_id = self.heap.alloc_generator(closure_id, Some(self.builtins.generator_class));
        if let ObjectData::Generator(g) = &mut self.heap.get_mut(gen_id).data {
            g.saved_stack = bound_args;
        }
        gen_id
    }

    fn call_native(&mut self, base: usize, argc: u8, native_id: ObjectId, this: Value) -> crate::exception::RunResult<()> {
        let native = match &self.heap.get(native_id).data {
            ObjectData::Native(n) => n.native,
            _ => unreachable!(),
        };
        let arity = native.arity;
        if argc < arity.least() || (!arity.variadic && argc > arity.most) {
            return Err(self.raise_exception(
                ExcType::TypeException,
                arity_message(arity.least(), arity.most, arity.variadic, argc),
            ));
        }
        let args: Vec<Value> = self.stack[base + 1..].to_vec();
        self.stack.truncate(base);
        let result = (native.func)(self, this, &args)?;
        self.push(result);
        Ok(())
    }

    /// The construct protocol: a class invoked as a value allocates either
    /// an `Instance` (running its `construct` method, if any, then
    /// discarding that method's own return value in favor of the instance)
    /// or, for the handful of intrinsic-value builtins, delegates entirely
    /// to their native `construct` which returns the value itself.
    fn call_construct(&mut self, base: usize, argc: u8, class_id: ObjectId) -> crate::exception::RunResult<Dispatch> {
        let construct_key = Value::Object(self.builtins.dunders.construct);
        let Some(construct) = self.heap.class_get_method(class_id, construct_key) else {
            self.stack.truncate(base);
            self.push(Value::Null);
            return Ok(Dispatch::Finished);
        };

        let is_intrinsic = matches!(
            construct,
            Value::Object(id) if self.heap.kind(id) == ObjectKind::Native
        ) && self.is_intrinsic_value_class(class_id);

        if is_intrinsic {
            let Value::Object(native_id) = construct else { unreachable!() };
            self.call_native(base, argc, native_id, Value::Null)?;
            return Ok(Dispatch::Finished);
        }

        let instance = self.heap.alloc_instance(class_id);
        self.stack[base] = Value::Object(instance);
        self.dispatch_call(base, argc, Value::Object(instance), construct)
    }

    fn is_intrinsic_value_class(&self, class_id: ObjectId) -> bool {
        let b = &self.builtins;
        class_id == b.list_class
            || class_id == b.tuple_class
            || class_id == b.number_class
            || class_id == b.boolean_class
            || class_id == b.string_class
    }

    /// Handles `RETURN`: runs any pending `ensure` handlers in the current
    /// frame first (a `return` must still flow through `ensure` blocks on
    /// its way out, re-entering this same logic once the ensure body itself
    /// re-emits `RETURN`), then pops the frame.
    pub(crate) fn op_return(&mut self) -> crate::exception::RunResult<Step> {
        let value = self.pop();
        self.handle_return(value)
    }

    pub(crate) fn handle_return(&mut self, value: Value) -> crate::exception::RunResult<Step> {
        loop {
            let frame = self.frames.last_mut().expect("no active frame");
            match frame.handlers.pop() {
                Some(handler) if handler.kind == crate::exception::HandlerKind::Ensure => {
                    self.stack.truncate(handler.saved_sp);
                    self.push(value);
                    self.push(Value::Handle(u64::from(super::unwind::CAUSE_RETURN)));
                    self.frames.last_mut().unwrap().ip = handler.address;
                    return Ok(Step::Continue);
                }
                Some(_) => continue,
                None => break,
            }
        }
        Ok(self.pop_frame_with_result(value))
    }

    pub(crate) fn pop_frame_with_result(&mut self, value: Value) -> Step {
        let frame = self.frames.pop().expect("no active frame");
        self.close_upvalues_from(frame.base);
        let result = if frame.is_initializer { self.stack[frame.base] } else { value };
        self.stack.truncate(frame.base);
        self.tracer.on_return(self.frames.len());
        let result = match frame.generator {
            Some(gen_id) => self.finish_generator_frame(gen_id, result),
            None => result,
        };
        if self.frames.is_empty() {
            Step::Done(result)
        } else {
            self.push(result);
            Step::Continue
        }
    }

    /// A generator frame that falls off its own end (or hits a bare
    /// `RETURN` without ever reaching `YIELD`) completes the generator:
    /// marks it `Done` and reports exhaustion (`null`) to whatever resumed
    /// it, per the iteration protocol's exhaustion convention.
    fn finish_generator_frame(&mut self, gen_id: ObjectId, value: Value) -> Value {
        let _ = value;
        if let ObjectData::Generator(g) = &mut self.heap.get_mut(gen_id).data {
            g.state = GeneratorState::Done;
            g.saved_stack.clear();
        }
        Value::Null
    }

    /// Runs `callee` to completion on the Rust call stack, for synchronous
    /// nested dispatch (operator overloads, `__iter__`/`__next__`). Bounds
    /// its own exception search to frames pushed by this call: an
    /// unhandled exception propagates via `?`, letting the next-outer level
    /// (another `run_call`, or the top-level `run`) continue the search
    /// from exactly where this one left off.
    pub(crate) fn run_call(&mut self, base: usize, argc: u8, this: Value, callee: Value) -> crate::exception::RunResult<Value> {
        let baseline = self.frames.len();
        match self.dispatch_call(base, argc, this, callee)? {
            Dispatch::Finished => {}
            Dispatch::Pushed => {
                while self.frames.len() > baseline {
                    let ip = self.frames.last().unwrap().ip;
                    let opcode = self.fetch_opcode();
                    self.tracer.on_instruction(ip, opcode, self.stack.len(), self.frames.len());
                    match self.step(opcode) {
                        Ok(Step::Continue | Step::Done(_)) => {}
                        Err(e) => self.unwind_except_bounded(e.value, baseline)?,
                    }
                }
            }
        }
        Ok(self.stack.pop().unwrap_or(Value::Null))
    }
}
