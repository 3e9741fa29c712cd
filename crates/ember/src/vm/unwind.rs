//! Exception unwinding: `SETUP_EXCEPT`/`SETUP_ENSURE`/`POP_HANDLER`/`RAISE`,
//! and the two unwind entry points a raised exception funnels through — the
//! top-level dispatch loop (`run`, searching down to frame depth 0) and a
//! nested synchronous call (`call::run_call`, bounded to the frames it
//! itself pushed).
//!
//! A handler's kind doesn't gate whether unwinding stops there: both
//! `SETUP_EXCEPT` and `SETUP_ENSURE` targets are ordinary compiled bytecode
//! (`compile_except_chain`/`compile_ensure_tail` in `compiler/mod.rs`) that
//! inspects the `(exception, cause)` pair itself and re-`RAISE`s when no
//! clause matches — the unwinder's job is only to find the nearest pending
//! handler of either kind and jump to it with the stack restored.

use crate::exception::{ExcType, Handler, HandlerKind, RunError, RunResult};
use crate::object::{ObjectData, ObjectKind};
use crate::value::Value;

use super::{Step, Vm};

/// Tags matching `compiler/mod.rs`'s private `CAUSE_*` constants — the
/// second half of the `(payload, cause)` pair pushed before jumping to a
/// handler, read back by `compile_ensure_tail`'s `emit_ensure_resume`.
pub(crate) const CAUSE_NORMAL: u64 = 0;
pub(crate) const CAUSE_RETURN: u64 = 1;
pub(crate) const CAUSE_EXCEPT: u64 = 2;

impl Vm {
    pub(crate) fn op_setup_except(&mut self) -> RunResult<Step> {
        self.push_handler(HandlerKind::Except);
        Ok(Step::Continue)
    }

    pub(crate) fn op_setup_ensure(&mut self) -> RunResult<Step> {
        self.push_handler(HandlerKind::Ensure);
        Ok(Step::Continue)
    }

    /// Records a handler whose target is `offset` past this instruction,
    /// using the same relative-to-post-operand convention as `JUMP`,
    /// without actually jumping there — normal execution falls through to
    /// the body protected by the handler.
    fn push_handler(&mut self, kind: HandlerKind) {
        let offset = self.fetch_i16();
        let saved_sp = self.stack.len();
        let frame = self.frames.last_mut().expect("no active frame");
        let address = (frame.ip as i64 + i64::from(offset)) as usize;
        frame.handlers.push(Handler { address, saved_sp, kind });
    }

    pub(crate) fn op_pop_handler(&mut self) -> RunResult<Step> {
        self.frames.last_mut().expect("no active frame").handlers.pop();
        Ok(Step::Continue)
    }

    /// `RAISE`: the value on top of the stack must be an instance of
    /// `Exception` or one of its subclasses; attaches a fresh stack trace
    /// recording every frame from here to the outermost, then begins
    /// unwinding from the current frame.
    pub(crate) fn op_raise(&mut self) -> RunResult<Step> {
        let value = self.pop();
        self.require_exception_instance(value)?;
        self.tracer.on_raise(value, self.frames.len());
        Err(RunError::new(value))
    }

    fn require_exception_instance(&mut self, value: Value) -> RunResult<()> {
        let ok = matches!(value, Value::Object(id) if self.heap.kind(id) == ObjectKind::Instance
            && self.instance_is_exception(id));
        if ok {
            Ok(())
        } else {
            Err(self.raise_exception(ExcType::TypeException, "raise requires an instance of Exception or a subclass"))
        }
    }

    fn instance_is_exception(&self, instance_id: crate::object::ObjectId) -> bool {
        let class = self.heap.get(instance_id).header.class.expect("instance always has a class");
        let base = self.builtins.exception_class(ExcType::Exception);
        self.builtins.class_is_or_inherits(&self.heap, class, base)
    }

    /// Builds one frame record for `closure` at `ip`, the same shape
    /// `attach_stacktrace` bakes into a `StackTrace` object.
    fn frame_record(&mut self, closure: crate::object::ObjectId, ip: usize) -> crate::object::FrameRecord {
        let function_id = self.closure_function(closure);
        let function = self.function_ref(function_id);
        let line = function.code.line_at(ip.saturating_sub(1));
        let module_name = match &self.heap.get(function.module).data {
            ObjectData::Module(m) => m.name,
            _ => unreachable!("a function's module field always names a Module"),
        };
        let module_name = self.interns.intern_str(self.heap.string_str(module_name));
        let function_name = function.name.unwrap_or_else(|| self.interns.intern_str("<anonymous>"));
        crate::object::FrameRecord { line, module_name, function_name }
    }

    /// Sets (or replaces) the `stacktrace` field of `value` to a fresh
    /// `StackTrace` object wrapping `records`, innermost frame first.
    fn attach_stacktrace(&mut self, value: Value, records: Vec<crate::object::FrameRecord>) {
        let Value::Object(instance_id) = value else { return };
        let trace_id = self.heap.alloc_stack_trace(records, Some(self.builtins.stack_trace_class));
        let key = Value::Object(self.builtins.dunders.stacktrace);
        self.heap.instance_set_field(instance_id, key, Value::Object(trace_id));
    }

    /// Top-level unwind: searches from the current innermost frame down to
    /// (but not including) `depth`, appending a frame record for each frame
    /// visited as it's visited — not the whole active call stack eagerly —
    /// and stopping the moment a pending handler is found, so the attached
    /// trace covers exactly the frames between the raise site and the
    /// catching frame. Used by `run`'s main loop with `depth = 0` and,
    /// nested, by `run_call` with `depth` set to the frame count just before
    /// it pushed its own callee.
    pub(crate) fn unwind_except(&mut self, value: Value, depth: usize) -> RunResult<()> {
        let mut records = Vec::new();
        loop {
            if self.frames.len() <= depth {
                self.attach_stacktrace(value, records);
                return Err(RunError::new(value));
            }
            let frame_index = self.frames.len() - 1;
            let (closure, ip) = (self.frames[frame_index].closure, self.frames[frame_index].ip);
            records.push(self.frame_record(closure, ip));
            match self.frames[frame_index].handlers.pop() {
                Some(handler) => {
                    self.attach_stacktrace(value, records);
                    self.stack.truncate(handler.saved_sp);
                    self.push(value);
                    self.push(Value::Handle(CAUSE_EXCEPT));
                    self.frames[frame_index].ip = handler.address;
                    return Ok(());
                }
                None => {
                    let base = self.frames[frame_index].base;
                    self.close_upvalues_from(base);
                    self.stack.truncate(base);
                    self.frames.pop();
                }
            }
        }
    }

    /// Same search, but bounded to frames pushed by the current nested
    /// `run_call` (frames at or below `baseline` belong to an outer call and
    /// must be left for its own unwind to examine).
    pub(crate) fn unwind_except_bounded(&mut self, value: Value, baseline: usize) -> RunResult<()> {
        self.unwind_except(value, baseline)
    }
}
