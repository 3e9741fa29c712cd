//! Execution limits: recursion depth, exception-handler capacity, and heap
//! growth policy.
//!
//! Mirrors the resource-tracker split the host embeds this VM with: a
//! zero-cost [`NoLimits`] for trusted scripts and a [`Bounded`] tracker for
//! sandboxed ones, unified behind the [`Limits`] trait so the VM pays for the
//! check only when the host asked for it.

/// Maximum call-frame depth before a `StackOverflowException` is raised.
pub const RECURSION_LIMIT: usize = 5000;

/// Capacity of a frame's exception-handler table (`SETUP_EXCEPT`/`SETUP_ENSURE`).
pub const HANDLER_MAX: usize = 10;

/// Default multiplier applied to `allocated` to compute the next GC threshold.
pub const DEFAULT_HEAP_GROW_RATE: usize = 2;

/// Policy queried by the VM at call boundaries and by the heap at allocation
/// boundaries.
///
/// Implementations are expected to be cheap enough to call on every
/// function call; [`NoLimits`] compiles down to nothing.
pub trait Limits {
    /// Returns `true` if a call at `depth` frames deep should be rejected
    /// with `StackOverflowException`.
    fn recursion_exceeded(&self, depth: usize) -> bool;

    /// Heap growth multiplier used to compute the next collection threshold.
    fn heap_grow_rate(&self) -> usize {
        DEFAULT_HEAP_GROW_RATE
    }
}

/// No limits beyond the wire-format-inherited [`HANDLER_MAX`] and the
/// hard-coded [`RECURSION_LIMIT`] (a safety net against native stack
/// overflow, not a configurable sandbox policy).
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLimits;

impl Limits for NoLimits {
    #[inline]
    fn recursion_exceeded(&self, depth: usize) -> bool {
        depth >= RECURSION_LIMIT
    }
}

/// A sandbox-configurable tracker: a tighter recursion cap and heap growth
/// rate than the defaults, for hosts running untrusted scripts.
#[derive(Debug, Clone, Copy)]
pub struct Bounded {
    pub recursion_limit: usize,
    pub heap_grow_rate: usize,
}

impl Default for Bounded {
    fn default() -> Self {
        Self {
            recursion_limit: RECURSION_LIMIT,
            heap_grow_rate: DEFAULT_HEAP_GROW_RATE,
        }
    }
}

impl Limits for Bounded {
    #[inline]
    fn recursion_exceeded(&self, depth: usize) -> bool {
        depth >= self.recursion_limit
    }

    #[inline]
    fn heap_grow_rate(&self) -> usize {
        self.heap_grow_rate
    }
}
