//! VM execution tracing.
//!
//! A trait-based tracer with hooks at key execution events. [`NoopTracer`]'s
//! hooks are all empty defaults, so a production embedding holding one pays
//! only a vtable call per hook site, not a branch; debugging embeddings swap
//! in [`StderrTracer`] (or a host-defined tracer) behind the same
//! `Box<dyn Tracer>` the VM stores. The VM is kept non-generic over the
//! tracer (see `Vm` in `src/vm/mod.rs`) since the native-function contract in
//! `src/native.rs` needs a plain `fn(&mut Vm, ...)` pointer, which requires
//! `Vm` to name a single concrete type.

use crate::compiler::opcode::Opcode;
use crate::intern::StringId;
use crate::value::Value;

/// Hook points the VM calls during dispatch, call/return, raise, and GC.
///
/// All methods have a no-op default; implement only the ones a given tracer
/// cares about.
pub trait Tracer: std::fmt::Debug {
    /// Called immediately before dispatching `opcode` at `ip`.
    #[inline(always)]
    fn on_instruction(&mut self, _ip: usize, _opcode: Opcode, _stack_depth: usize, _frame_depth: usize) {}

    /// Called after a call pushes a new frame.
    #[inline(always)]
    fn on_call(&mut self, _name: Option<StringId>, _frame_depth: usize) {}

    /// Called after a return pops a frame.
    #[inline(always)]
    fn on_return(&mut self, _frame_depth: usize) {}

    /// Called when `RAISE` begins unwinding with `exc` as the raised value.
    #[inline(always)]
    fn on_raise(&mut self, _exc: Value, _frame_depth: usize) {}

    /// Called immediately before a collection's mark phase begins.
    #[inline(always)]
    fn on_gc_start(&mut self, _allocated: usize) {}

    /// Called after sweep completes, with the bytes now live and the new
    /// threshold.
    #[inline(always)]
    fn on_gc_end(&mut self, _allocated: usize, _next_gc: usize) {}
}

/// Production default: every hook is eliminated by the optimizer.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl Tracer for NoopTracer {}

/// Human-readable execution log written to stderr, for interactive debugging.
#[derive(Debug, Default)]
pub struct StderrTracer {
    instructions: u64,
}

impl StderrTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Tracer for StderrTracer {
    fn on_instruction(&mut self, ip: usize, opcode: Opcode, stack_depth: usize, frame_depth: usize) {
        self.instructions += 1;
        eprintln!("[{frame_depth:>3}] ip={ip:<5} sp={stack_depth:<4} {opcode:?}");
    }

    fn on_call(&mut self, name: Option<StringId>, frame_depth: usize) {
        eprintln!("[{frame_depth:>3}] call {name:?}");
    }

    fn on_return(&mut self, frame_depth: usize) {
        eprintln!("[{frame_depth:>3}] return");
    }

    fn on_raise(&mut self, _exc: Value, frame_depth: usize) {
        eprintln!("[{frame_depth:>3}] raise");
    }

    fn on_gc_start(&mut self, allocated: usize) {
        eprintln!("gc: start, allocated={allocated}");
    }

    fn on_gc_end(&mut self, allocated: usize, next_gc: usize) {
        eprintln!("gc: end, allocated={allocated} next_gc={next_gc} instructions_so_far={}", self.instructions);
    }
}
