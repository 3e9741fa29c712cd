//! `[SUPPLEMENT]` bytecode-serde: the on-disk compiled-function format.
//!
//! §6 describes the format as "4-byte magic, 1-byte major + 1-byte minor
//! version, then a self-describing sequence of Function objects. Version
//! mismatch returns a dedicated error code." A compiled [`FunctionObj`] on
//! the heap is not itself self-describing, though: its `module` and
//! `owner_class` fields are [`ObjectId`]s meaningful only inside the heap
//! that allocated it, and its constant pool holds further `Value::Object`
//! entries referencing interned strings and, for every closure literal,
//! nested `FunctionObj`s. None of those ids survive a round trip to a
//! different heap (or a different process entirely).
//!
//! So `save` walks a function and its constant pool into an archive that
//! owns its strings and nested functions outright, and `load` re-allocates
//! that tree into the loading heap, rebinding `module` to whatever module
//! the caller is loading into. A loaded function that was a method
//! (`is_method`) comes back with `owner_class: None` — re-installing it onto
//! a class is the loader's job, the same `DEF_METHOD`/`NAT_METHOD` opcodes a
//! freshly compiled class body uses.

use serde::{Deserialize, Serialize};

use crate::compiler::code::Code;
use crate::heap::Heap;
use crate::intern::Interns;
use crate::native::Arity;
use crate::object::{FunctionObj, ObjectData, ObjectId, ObjectKind};
use crate::value::Value;

const MAGIC: [u8; 4] = *b"EMbc";
const VERSION_MAJOR: u8 = 1;
const VERSION_MINOR: u8 = 0;
const HEADER_LEN: usize = 6;

/// Failure loading a bytecode archive: either the header didn't match this
/// build's format at all, or `postcard` rejected the body.
#[derive(Debug)]
pub enum SerializeError {
    /// The first four bytes weren't the magic this build writes.
    BadMagic,
    /// The major version doesn't match; this build cannot read the archive.
    UnsupportedVersion { major: u8, minor: u8 },
    /// The body didn't decode to the expected shape.
    Codec(postcard::Error),
}

impl std::fmt::Display for SerializeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadMagic => write!(f, "not a bytecode archive: bad magic"),
            Self::UnsupportedVersion { major, minor } => {
                write!(f, "unsupported bytecode archive version {major}.{minor}")
            }
            Self::Codec(e) => write!(f, "corrupt bytecode archive: {e}"),
        }
    }
}

impl std::error::Error for SerializeError {}

impl From<postcard::Error> for SerializeError {
    fn from(e: postcard::Error) -> Self {
        Self::Codec(e)
    }
}

#[derive(Serialize, Deserialize)]
enum ArchivedConstant {
    Null,
    Bool(bool),
    Number(f64),
    Handle(u64),
    Str(Vec<u8>),
    Func(Box<ArchivedFunction>),
}

#[derive(Serialize, Deserialize)]
struct ArchivedCode {
    bytes: Vec<u8>,
    lines: Vec<u32>,
    constants: Vec<ArchivedConstant>,
}

#[derive(Serialize, Deserialize)]
struct ArchivedFunction {
    name: Option<Vec<u8>>,
    arity: Arity,
    upvalue_count: u8,
    is_method: bool,
    is_generator: bool,
    defaults: Vec<ArchivedConstant>,
    code: ArchivedCode,
}

/// Re-allocation context `load` threads through the recursive unarchive:
/// the class new `Function` objects and `String` constants are tagged with,
/// and the module every reconstructed function closes over.
struct LoadCtx {
    function_class: Option<ObjectId>,
    string_class: Option<ObjectId>,
    module: ObjectId,
}

/// Serializes `function` (and, recursively, every nested function reachable
/// through its constant pool) into the on-disk archive format.
#[must_use]
pub fn save(heap: &Heap, interns: &Interns, function: ObjectId) -> Vec<u8> {
    let archived = archive_function(heap, interns, function);
    let mut out = Vec::with_capacity(HEADER_LEN + 256);
    out.extend_from_slice(&MAGIC);
    out.push(VERSION_MAJOR);
    out.push(VERSION_MINOR);
    let body = postcard::to_allocvec(&archived).expect("an archived function tree always serializes");
    out.extend_from_slice(&body);
    out
}

/// Reads back an archive written by [`save`], allocating its function tree
/// into `heap` bound to `module`. Returns the top-level function's id.
pub fn load(
    heap: &mut Heap,
    interns: &mut Interns,
    function_class: Option<ObjectId>,
    string_class: Option<ObjectId>,
    module: ObjectId,
    bytes: &[u8],
) -> Result<ObjectId, SerializeError> {
    if bytes.len() < HEADER_LEN || bytes[..4] != MAGIC {
        return Err(SerializeError::BadMagic);
    }
    let (major, minor) = (bytes[4], bytes[5]);
    if major != VERSION_MAJOR {
        return Err(SerializeError::UnsupportedVersion { major, minor });
    }
    let archived: ArchivedFunction = postcard::from_bytes(&bytes[HEADER_LEN..])?;
    let ctx = LoadCtx { function_class, string_class, module };
    Ok(unarchive_function(heap, interns, &ctx, &archived))
}

fn archive_function(heap: &Heap, interns: &Interns, id: ObjectId) -> ArchivedFunction {
    let ObjectData::Function(f) = &heap.get(id).data else {
        unreachable!("archive_function called on a non-function object")
    };
    ArchivedFunction {
        name: f.name.map(|n| interns.bytes(n).to_vec()),
        arity: f.arity,
        upvalue_count: f.upvalue_count,
        is_method: f.is_method,
        is_generator: f.is_generator,
        defaults: f.defaults.iter().map(|v| archive_constant(heap, interns, *v)).collect(),
        code: archive_code(heap, interns, &f.code),
    }
}

fn archive_code(heap: &Heap, interns: &Interns, code: &Code) -> ArchivedCode {
    ArchivedCode {
        bytes: code.bytes.clone(),
        lines: code.lines.clone(),
        constants: code.constants.iter().map(|v| archive_constant(heap, interns, *v)).collect(),
    }
}

/// Constant-pool entries are only ever a primitive, an interned string, or
/// (for a closure literal) a nested function — never a class, module, or
/// any other heap object kind.
fn archive_constant(heap: &Heap, interns: &Interns, value: Value) -> ArchivedConstant {
    match value {
        Value::Null => ArchivedConstant::Null,
        Value::Bool(b) => ArchivedConstant::Bool(b),
        Value::Number(n) => ArchivedConstant::Number(n),
        Value::Handle(h) => ArchivedConstant::Handle(h),
        Value::Object(id) => match heap.kind(id) {
            ObjectKind::String => ArchivedConstant::Str(heap.string_bytes(id).to_vec()),
            ObjectKind::Function => ArchivedConstant::Func(Box::new(archive_function(heap, interns, id))),
            other => unreachable!("constant pool held an unexpected object kind {other:?}"),
        },
    }
}

fn unarchive_function(heap: &mut Heap, interns: &mut Interns, ctx: &LoadCtx, archived: &ArchivedFunction) -> ObjectId {
    let name = archived.name.as_deref().map(|bytes| interns.intern(bytes));
    let defaults = archived.defaults.iter().map(|c| unarchive_constant(heap, interns, ctx, c)).collect();
    let code = unarchive_code(heap, interns, ctx, &archived.code);
    let function = FunctionObj {
        name,
        module: ctx.module,
        arity: archived.arity,
        upvalue_count: archived.upvalue_count,
        is_method: archived.is_method,
        is_generator: archived.is_generator,
        owner_class: None,
        defaults,
        code,
    };
    heap.alloc_function(function, ctx.function_class)
}

fn unarchive_code(heap: &mut Heap, interns: &mut Interns, ctx: &LoadCtx, archived: &ArchivedCode) -> Code {
    let constants = archived.constants.iter().map(|c| unarchive_constant(heap, interns, ctx, c)).collect();
    Code { bytes: archived.bytes.clone(), lines: archived.lines.clone(), constants }
}

fn unarchive_constant(heap: &mut Heap, interns: &mut Interns, ctx: &LoadCtx, archived: &ArchivedConstant) -> Value {
    match archived {
        ArchivedConstant::Null => Value::Null,
        ArchivedConstant::Bool(b) => Value::Bool(*b),
        ArchivedConstant::Number(n) => Value::Number(*n),
        ArchivedConstant::Handle(h) => Value::Handle(*h),
        ArchivedConstant::Str(bytes) => Value::Object(heap.intern_string(bytes, ctx.string_class)),
        ArchivedConstant::Func(f) => Value::Object(unarchive_function(heap, interns, ctx, f)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectData;

    fn leaf_function(heap: &mut Heap, interns: &mut Interns, name: &str) -> ObjectId {
        let name_id = interns.intern_str(name);
        let greeting = heap.intern_string(b"hi", None);
        let code = Code { bytes: vec![0], lines: vec![1], constants: vec![Value::Object(greeting)] };
        let function = FunctionObj {
            name: Some(name_id),
            module: ObjectId(0),
            arity: Arity::fixed(0),
            upvalue_count: 0,
            is_method: false,
            is_generator: false,
            owner_class: None,
            defaults: Vec::new(),
            code,
        };
        heap.alloc_function(function, None)
    }

    #[test]
    fn round_trips_a_leaf_function() {
        let mut heap = Heap::new();
        let mut interns = Interns::new();
        let function = leaf_function(&mut heap, &mut interns, "greet");

        let bytes = save(&heap, &interns, function);
        assert_eq!(&bytes[..4], &MAGIC);
        assert_eq!(bytes[4], VERSION_MAJOR);

        let module = ObjectId(0);
        let loaded = load(&mut heap, &mut interns, None, None, module, &bytes).expect("archive loads");

        let ObjectData::Function(f) = &heap.get(loaded).data else { panic!("expected a function") };
        assert_eq!(interns.as_str(f.name.expect("name preserved")), "greet");
        assert_eq!(f.module, module);
        assert_eq!(f.code.bytes, vec![0]);
        let Value::Object(string_id) = f.code.constants[0] else { panic!("expected a string constant") };
        assert_eq!(heap.string_bytes(string_id), b"hi");
    }

    #[test]
    fn rejects_bad_magic() {
        let mut heap = Heap::new();
        let mut interns = Interns::new();
        let err = load(&mut heap, &mut interns, None, None, ObjectId(0), b"nope").unwrap_err();
        assert!(matches!(err, SerializeError::BadMagic));
    }

    #[test]
    fn rejects_future_major_version() {
        let mut heap = Heap::new();
        let mut interns = Interns::new();
        let function = leaf_function(&mut heap, &mut interns, "greet");
        let mut bytes = save(&heap, &interns, function);
        bytes[4] = VERSION_MAJOR + 1;
        let err = load(&mut heap, &mut interns, None, None, ObjectId(0), &bytes).unwrap_err();
        assert!(matches!(err, SerializeError::UnsupportedVersion { .. }));
    }
}
