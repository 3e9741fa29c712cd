//! `YIELD` and the `FOR_ITER`/`FOR_NEXT` pair `foreach` compiles to.
//!
//! Ordinary iterables drive the two-method protocol (`__iter__` advances an
//! opaque state, `__next__` reads the value at it) via a synchronous nested
//! call exactly like any other dunder dispatch. A `[SUPPLEMENT]` generator
//! short-circuits both: `FOR_ITER` resumes its suspended frame directly
//! (there is no `__iter__` method registered on `generator_class`), and
//! `FOR_NEXT` just reads back the value that resume produced — collapsing
//! the protocol's two steps into the one resume.

use crate::exception::{ExcType, RunResult};
use crate::object::{GeneratorState, ObjectData, ObjectId, ObjectKind};
use crate::value::Value;

use super::{Frame, Step, Vm};

impl Vm {
    /// `YIELD`: suspends the running generator frame, stashing its
    /// instruction pointer and the stack above its base into the
    /// `GeneratorObj`, and pops it — handing the yielded value back to
    /// whichever resume drove this (`FOR_ITER`'s `resume_generator`, or a
    /// direct `__next__`/`next()` call), never running pending `ensure`
    /// handlers (a yield is not a return; they still fire whenever the
    /// generator eventually does return or falls off its end).
    pub(crate) fn op_yield(&mut self) -> RunResult<Step> {
        let value = self.pop();
        let frame = self.frames.pop().expect("no active frame");
        let gen_id = frame.generator.expect("YIELD used outside a generator body");
        self.close_upvalues_from(frame.base);
        let saved_stack = self.stack[frame.base..].to_vec();
        self.stack.truncate(frame.base);

        if let ObjectData::Generator(g) = &mut self.heap.get_mut(gen_id).data {
            g.saved_ip = frame.ip;
            g.saved_stack = saved_stack;
            g.state = GeneratorState::Suspended;
            g.last_value = value;
        }

        if self.frames.is_empty() {
            Ok(Step::Done(value))
        } else {
            self.push(value);
            Ok(Step::Continue)
        }
    }

    /// Resumes a suspended (or brand-new) generator's frame and steps it,
    /// on the Rust call stack, until it next yields or completes. Returns
    /// `Null` immediately, without touching the frame stack, if the
    /// generator is already `Done`.
    fn resume_generator(&mut self, gen_id: ObjectId) -> RunResult<Value> {
        let (closure, saved_ip, saved_stack, state) = match &self.heap.get(gen_id).data {
            ObjectData::Generator(g) => (g.closure, g.saved_ip, g.saved_stack.clone(), g.state),
            _ => unreachable!("resume_generator called on a non-generator object"),
        };
        if state == GeneratorState::Done {
            return Ok(Value::Null);
        }
        let closure_id = closure.expect("generator missing its closure");

        let baseline = self.frames.len();
        let base = self.stack.len();
        self.stack.extend(saved_stack);
        if let ObjectData::Generator(g) = &mut self.heap.get_mut(gen_id).data {
            g.state = GeneratorState::Running;
        }
        self.frames.push(Frame {
            closure: closure_id,
            ip: saved_ip,
            base,
            handlers: smallvec::SmallVec::new(),
            is_initializer: false,
            generator: Some(gen_id),
        });
        self.tracer.on_call(None, self.frames.len());

        while self.frames.len() > baseline {
            let ip = self.frames.last().unwrap().ip;
            let opcode = self.fetch_opcode();
            self.tracer.on_instruction(ip, opcode, self.stack.len(), self.frames.len());
            match self.step(opcode) {
                Ok(Step::Continue | Step::Done(_)) => {}
                Err(e) => self.unwind_except_bounded(e.value, baseline)?,
            }
        }
        Ok(self.stack.pop().unwrap_or(Value::Null))
    }

    /// `FOR_ITER slot`: advances `.iter` (the hidden local one slot above
    /// the iterable) in place — the next opaque state for an ordinary
    /// iterable, or the resumed yield/`null`-on-exhaustion for a generator.
    pub(crate) fn op_for_iter(&mut self) -> RunResult<Step> {
        let slot = self.fetch_u8() as usize;
        let base = self.frames.last().expect("no active frame").base;
        let iterable = self.stack[base + slot];
        let state = self.stack[base + slot + 1];
        let next_state = match iterable {
            Value::Object(id) if self.heap.kind(id) == ObjectKind::Generator => self.resume_generator(id)?,
            Value::Object(_) => self.dispatch_protocol(iterable, state, self.builtins.dunders.iter)?,
            _ => return Err(self.raise_exception(ExcType::TypeException, "value is not iterable")),
        };
        let base = self.frames.last().expect("no active frame").base;
        self.stack[base + slot + 1] = next_state;
        Ok(Step::Continue)
    }

    /// `FOR_NEXT slot offset`: if `.iter`'s latest state is falsy, the loop
    /// is over — jump past the body. Otherwise push this iteration's value:
    /// `__next__(iterable, state)` for an ordinary iterable, or (for a
    /// generator) the very state `FOR_ITER` just stored, since the resume
    /// that produced it already *is* the yielded value.
    pub(crate) fn op_for_next(&mut self) -> RunResult<Step> {
        let slot = self.fetch_u8() as usize;
        let offset = self.fetch_i16();
        let base = self.frames.last().expect("no active frame").base;
        let state = self.stack[base + slot + 1];
        if !state.is_truthy() {
            self.jump(offset);
            return Ok(Step::Continue);
        }
        let iterable = self.stack[base + slot];
        let value = match iterable {
            Value::Object(id) if self.heap.kind(id) == ObjectKind::Generator => state,
            Value::Object(_) => self.dispatch_protocol(iterable, state, self.builtins.dunders.next)?,
            _ => return Err(self.raise_exception(ExcType::TypeException, "value is not iterable")),
        };
        self.push(value);
        Ok(Step::Continue)
    }

    fn dispatch_protocol(&mut self, iterable: Value, state: Value, dunder: ObjectId) -> RunResult<Value> {
        let class = self.builtins.class_of(&self.heap, iterable);
        let method = match self.heap.class_get_method(class, Value::Object(dunder)) {
            Some(method) => method,
            None => return Err(self.raise_exception(ExcType::TypeException, "value is not iterable")),
        };
        let base = self.stack.len();
        self.push(iterable);
        self.push(state);
        self.run_call(base, 1, iterable, method)
    }
}
