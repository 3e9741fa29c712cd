//! Heap object headers and the object variants named in the data model.

use crate::compiler::code::Code;
use crate::intern::StringId;
use crate::native::{Arity, Native, NativeExtension};
use crate::table::Table;
use crate::value::Value;

/// Index of a heap-allocated object, handed out by [`crate::heap::Heap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "bytecode-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ObjectId(pub(crate) u32);

impl ObjectId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// The type tag every object header carries, independent of its payload —
/// used by hot paths (numeric/string fast paths, `is instanceof`-style
/// checks) that only need to know the shape, not the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    String,
    Class,
    Instance,
    Module,
    Function,
    Native,
    Closure,
    Upvalue,
    BoundMethod,
    List,
    Tuple,
    Table,
    StackTrace,
    Userdata,
    Generator,
}

/// Every heap object begins with this header: its type tag, the GC mark
/// bit, its class (may be transiently absent only during core bootstrap),
/// and the intrusive link threading every live object into one list owned
/// by the heap.
#[derive(Debug)]
pub struct ObjectHeader {
    pub kind: ObjectKind,
    pub marked: bool,
    pub class: Option<ObjectId>,
    pub next: Option<ObjectId>,
}

#[derive(Debug)]
pub struct StringObj {
    pub bytes: Box<[u8]>,
    pub hash: u32,
    pub interned: bool,
}

impl StringObj {
    #[must_use]
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.bytes).unwrap_or("<invalid utf-8>")
    }
}

#[derive(Debug)]
pub struct ClassObj {
    pub name: ObjectId,
    pub superclass: Option<ObjectId>,
    pub methods: Table,
}

#[derive(Debug, Default)]
pub struct InstanceObj {
    pub fields: Table,
}

#[derive(Debug)]
pub struct ModuleObj {
    pub name: ObjectId,
    pub globals: Table,
    pub native: Option<NativeExtension>,
}

#[derive(Debug)]
#[cfg_attr(feature = "bytecode-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FunctionObj {
    pub name: Option<StringId>,
    pub module: ObjectId,
    pub arity: Arity,
    pub upvalue_count: u8,
    /// Set on every method function. Per spec.md's constant-pool-slot-0
    /// convention this would hold the superclass reference directly in the
    /// function's own constants; we store it in `owner_class` instead (see
    /// DESIGN.md) and fill it from `DEF_METHOD`/`NAT_METHOD` at class-body
    /// time rather than reserving constant index 0.
    pub is_method: bool,
    pub is_generator: bool,
    /// The class this method was installed on, set by `DEF_METHOD`/
    /// `NAT_METHOD`. `super` dispatch reads this class's own `superclass`
    /// field so it resolves relative to where the method was *declared*,
    /// not to the receiver's dynamic class.
    pub owner_class: Option<ObjectId>,
    /// Trailing default-argument values, one per `arity.defaults`, applied
    /// by the call protocol's arity adjustment to params not supplied by
    /// the caller. Restricted to constant-foldable literals (see
    /// DESIGN.md's "default arguments" entry).
    pub defaults: Vec<Value>,
    pub code: Code,
}

#[derive(Debug, Clone, Copy)]
pub struct NativeObj {
    pub name: Option<StringId>,
    pub native: Native,
}

#[derive(Debug)]
pub struct ClosureObj {
    pub function: ObjectId,
    pub upvalues: Vec<ObjectId>,
}

/// An upvalue is open while it still aliases a stack slot of an enclosing
/// frame; it closes (copying the value into its own storage) when that
/// frame returns.
#[derive(Debug, Clone, Copy)]
pub enum UpvalueState {
    Open { stack_index: usize },
    Closed(Value),
}

#[derive(Debug)]
pub struct UpvalueObj {
    pub state: UpvalueState,
}

#[derive(Debug, Clone, Copy)]
pub struct BoundMethodObj {
    pub receiver: Value,
    pub method: Value,
}

#[derive(Debug, Default)]
pub struct ListObj {
    pub items: Vec<Value>,
}

#[derive(Debug)]
pub struct TupleObj {
    pub items: Box<[Value]>,
}

#[derive(Debug, Clone, Copy)]
pub struct FrameRecord {
    pub line: u32,
    pub module_name: StringId,
    pub function_name: StringId,
}

#[derive(Debug, Default)]
pub struct StackTraceObj {
    pub frames: Vec<FrameRecord>,
}

pub type Finalizer = fn(&mut [u8]);

pub struct UserdataObj {
    pub bytes: Box<[u8]>,
    pub finalizer: Option<Finalizer>,
}

impl std::fmt::Debug for UserdataObj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserdataObj").field("len", &self.bytes.len()).field("has_finalizer", &self.finalizer.is_some()).finish()
    }
}

/// `[SUPPLEMENT]` A generator is a suspended closure invocation: the
/// closure it is running, its lifecycle state, and — while suspended — the
/// saved instruction pointer and a copy of the operand-stack slice above
/// its frame base, restored when `__next__` resumes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GeneratorState {
    New,
    Running,
    Suspended,
    Done,
}

#[derive(Debug, Default)]
pub struct GeneratorObj {
    pub closure: Option<ObjectId>,
    pub saved_ip: usize,
    pub saved_stack: Vec<Value>,
    pub state: GeneratorState,
    /// The value produced by the most recent resume-to-yield, read back by
    /// `__next__` once `__iter__` has advanced the generator.
    pub last_value: Value,
}

impl Default for GeneratorState {
    fn default() -> Self {
        Self::New
    }
}

/// The payload half of a heap object; the type tag lives in its
/// [`ObjectHeader`].
#[derive(Debug)]
pub enum ObjectData {
    String(StringObj),
    Class(ClassObj),
    Instance(InstanceObj),
    Module(ModuleObj),
    Function(FunctionObj),
    Native(NativeObj),
    Closure(ClosureObj),
    Upvalue(UpvalueObj),
    BoundMethod(BoundMethodObj),
    List(ListObj),
    Tuple(TupleObj),
    Table(Table),
    StackTrace(StackTraceObj),
    Userdata(UserdataObj),
    Generator(GeneratorObj),
}

impl ObjectData {
    #[must_use]
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::String(_) => ObjectKind::String,
            Self::Class(_) => ObjectKind::Class,
            Self::Instance(_) => ObjectKind::Instance,
            Self::Module(_) => ObjectKind::Module,
            Self::Function(_) => ObjectKind::Function,
            Self::Native(_) => ObjectKind::Native,
            Self::Closure(_) => ObjectKind::Closure,
            Self::Upvalue(_) => ObjectKind::Upvalue,
            Self::BoundMethod(_) => ObjectKind::BoundMethod,
            Self::List(_) => ObjectKind::List,
            Self::Tuple(_) => ObjectKind::Tuple,
            Self::Table(_) => ObjectKind::Table,
            Self::StackTrace(_) => ObjectKind::StackTrace,
            Self::Userdata(_) => ObjectKind::Userdata,
            Self::Generator(_) => ObjectKind::Generator,
        }
    }
}

/// A heap object: its header plus its variant payload.
#[derive(Debug)]
pub struct Object {
    pub header: ObjectHeader,
    pub data: ObjectData,
}
