//! The native function contract and the native registry.
//!
//! A native function is a boxed closure taking the running VM and the
//! arguments already placed on the operand stack, returning success with one
//! value left on the stack or failure with the raised exception on top —
//! exactly the contract §6 describes for the embedding surface.

use crate::exception::RunResult;
use crate::value::Value;
use crate::vm::Vm;

/// Outcome of invoking a native function.
///
/// `Ok(value)` pushes `value` as the call's result; `Err(exc)` begins
/// unwinding with `exc` as the raised exception, matching the VM's call
/// protocol for natives (step 4 of §4.5 Call protocol).
pub type NativeResult = RunResult<Value>;

/// Function pointer type satisfying the native-call contract.
///
/// `args` is the slice of argument values already validated against the
/// native's declared arity by the call protocol; `this` is the receiver for
/// a native method (`Value::Null` for plain functions).
pub type NativeFn = fn(vm: &mut Vm, this: Value, args: &[Value]) -> NativeResult;

/// Arity/variadic metadata shared by compiled and native callables, used by
/// the call protocol's arity check (§4.5 step 2).
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "bytecode-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Arity {
    /// Declared parameter count (`most`).
    pub most: u8,
    /// Number of trailing parameters with defaults; `least = most - defaults`.
    pub defaults: u8,
    /// Whether excess arguments beyond `most` are packed into a trailing
    /// `args` tuple.
    pub variadic: bool,
}

impl Arity {
    #[must_use]
    pub const fn least(self) -> u8 {
        self.most - self.defaults
    }

    #[must_use]
    pub const fn fixed(most: u8) -> Self {
        Self { most, defaults: 0, variadic: false }
    }
}

/// A native callable: its arity contract plus the function pointer invoked
/// by the VM's call protocol.
#[derive(Debug, Clone, Copy)]
pub struct Native {
    pub arity: Arity,
    pub func: NativeFn,
}

/// What kind of registry record a name resolves to after module import,
/// mirroring §6's "Native registry: an array of `{kind: method|function|…}`
/// records resolved by name".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeRegistryKind {
    /// A free function bound into the importing module's globals.
    Function,
    /// A method installed on a class's method table.
    Method,
    /// A sentinel marking the end of a registry array.
    Sentinel,
}

/// One entry of a native extension's registry, resolved by name after the
/// owning module has been imported.
#[derive(Debug, Clone, Copy)]
pub struct NativeRegistryEntry {
    pub kind: NativeRegistryKind,
    pub name: &'static str,
    pub native: Option<Native>,
}

/// Opaque handle to a native extension sidecar attached to a [`Module`](crate::object::ModuleObj).
///
/// The dynamic library loader itself is a host-facing embedding concern,
/// deliberately excluded from this core; a `NativeExtension` here is just
/// the registry the host already resolved, plus an optional finalizer run
/// when the owning module is collected.
#[derive(Debug, Clone, Copy)]
pub struct NativeExtension {
    pub registry: &'static [NativeRegistryEntry],
}
