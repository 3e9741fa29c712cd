//! The bytecode instruction set.
//!
//! Each variant is a single tag byte; operands (constant indices, jump
//! offsets, argument counts, ...) follow immediately in the code stream and
//! are read by the VM's `fetch_u8`/`fetch_u16` helpers rather than being
//! carried in the enum itself, so `Code::bytes` stays a flat `Vec<u8>`
//! instead of a `Vec<Opcode>`.

use strum::{Display, EnumString, FromRepr};

/// One bytecode instruction tag.
///
/// Numbering is stable within a compiled build but is not part of the
/// on-disk format's compatibility contract beyond the major/minor version
/// bytes in [`crate::vm`]'s bytecode header; a conforming implementation is
/// free to renumber between versions.
#[repr(u8)]
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, FromRepr, EnumString)]
#[cfg_attr(feature = "bytecode-serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Opcode {
    // --- constants / locals ---
    /// `GET_CONST idx16` — push `constants[idx]`.
    GetConst,
    /// Push the `null` singleton.
    Null,
    /// `GET_LOCAL slot8` — push the frame-local slot.
    GetLocal,
    /// `SET_LOCAL slot8` — store the top of stack into the frame-local slot (no pop).
    SetLocal,
    /// `GET_UPVALUE idx8` — push the current closure's upvalue.
    GetUpvalue,
    /// `SET_UPVALUE idx8` — store the top of stack into the closure's upvalue (no pop).
    SetUpvalue,
    /// `GET_GLOBAL nameIdx16` — push the module global named by the constant.
    GetGlobal,
    /// `SET_GLOBAL nameIdx16` — store into an already-defined module global (no pop).
    SetGlobal,
    /// `DEFINE_GLOBAL nameIdx16` — pop and bind as a new module global.
    DefineGlobal,
    /// `CLOSE_UPVALUE` — close the open upvalue pointing at the current stack top, then pop.
    CloseUpvalue,
    /// Pop and discard the top of stack.
    Pop,
    /// Duplicate the top of stack.
    Dup,

    // --- arithmetic / logic ---
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Neg,
    Not,
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
    /// Identity comparison (`is`), never dispatched to a dunder.
    Is,

    // --- subscript / attribute ---
    /// `GET_FIELD nameIdx16`.
    GetField,
    /// `SET_FIELD nameIdx16`.
    SetField,
    SubscrGet,
    SubscrSet,

    // --- collections ---
    /// `NEW_LIST count16` — pop `count` values and push a new `List`.
    NewList,
    /// Pop one value and append it to the list below it on the stack.
    AppendList,
    /// `NEW_TUPLE count16`.
    NewTuple,
    /// `NEW_TABLE count16` — pop `count` key/value pairs (key then value, repeated) and push a new `Table`.
    NewTable,

    // --- control flow ---
    /// `JUMP off16` — signed, relative to the address after the operand.
    Jump,
    /// `JUMPT off16` — peek the top of stack, jump if truthy. Never pops:
    /// callers that always want the branch taken follow with an explicit
    /// `POP` on the fallthrough path, which is how short-circuiting `or`
    /// returns its first truthy operand without re-evaluating it.
    Jumpt,
    /// `JUMPF off16` — peek the top of stack, jump if falsy. See `JUMPT`.
    Jumpf,
    /// `FOR_ITER exprSlot8` — calls `exprSlot.__iter__(exprSlot+1)` and
    /// stores the result back into `exprSlot+1` (the hidden `.iter` local
    /// immediately above the hidden `.expr` local at `exprSlot`).
    ForIter,
    /// `FOR_NEXT exprSlot8 off16` — if `exprSlot+1` (`.iter`) is null or
    /// false, jumps `off16` forward (loop exit); else calls
    /// `exprSlot.__next__(exprSlot+1)` and pushes the result for the
    /// compiler-emitted bind into the loop variable(s).
    ForNext,
    /// Placeholder for `break`, rewritten to `JUMP` by the enclosing loop's closer.
    SignBrk,
    /// Placeholder for `continue`, rewritten to `JUMP` by the enclosing loop's closer.
    SignCont,

    // --- calls ---
    /// `CALL argc8`.
    Call,
    Call0,
    Call1,
    Call2,
    Call3,
    Call4,
    Call5,
    Call6,
    Call7,
    Call8,
    Call9,
    Call10,
    /// `INVOKE argc8 nameIdx16`.
    Invoke,
    Invoke0,
    Invoke1,
    Invoke2,
    Invoke3,
    Invoke4,
    Invoke5,
    Invoke6,
    Invoke7,
    Invoke8,
    Invoke9,
    Invoke10,
    /// `SUPER argc8 nameIdx16`.
    Super,
    Super0,
    Super1,
    Super2,
    Super3,
    Super4,
    Super5,
    Super6,
    Super7,
    Super8,
    Super9,
    Super10,
    /// `SUPER_BIND nameIdx16` — resolves a method on the superclass without calling it.
    SuperBind,

    // --- closures / classes / natives ---
    /// `CLOSURE constIdx16` followed by `upvalueCount` `(isLocal u8, index u8)` pairs.
    Closure,
    /// `NEW_CLASS nameIdx16`.
    NewClass,
    /// `NEW_SUBCLASS nameIdx16` — pops the superclass value.
    NewSubclass,
    /// `DEF_METHOD nameIdx16` — pops a closure, installs it on the class below it.
    DefMethod,
    /// `NAT_METHOD nameIdx16 nativeConstIdx16`.
    NatMethod,
    /// `NATIVE nameIdx16` — binds a native function into the current scope.
    Native,
    /// `YIELD` — suspends the current generator frame, leaving the yielded value on the stack.
    Yield,

    // --- imports ---
    /// `IMPORT nameIdx16`.
    Import,
    /// `IMPORT_FROM nameIdx16`.
    ImportFrom,
    /// `IMPORT_AS modNameIdx16 asNameIdx16`.
    ImportAs,
    /// `IMPORT_NAME modNameIdx16 bindingNameIdx16`.
    ImportName,

    // --- exceptions ---
    /// `SETUP_EXCEPT off16`.
    SetupExcept,
    /// `SETUP_ENSURE off16`.
    SetupEnsure,
    PopHandler,
    EndTry,
    Raise,
    /// `UNPACK count8`.
    Unpack,
    Return,
}

impl Opcode {
    /// Short forms `CALL_0..CALL_10` exist purely so the common small-arity
    /// call sites skip encoding an `argc` operand; this maps a short form
    /// back to its implied argument count.
    #[must_use]
    pub const fn short_call_argc(self) -> Option<u8> {
        match self {
            Self::Call0 | Self::Invoke0 | Self::Super0 => Some(0),
            Self::Call1 | Self::Invoke1 | Self::Super1 => Some(1),
            Self::Call2 | Self::Invoke2 | Self::Super2 => Some(2),
            Self::Call3 | Self::Invoke3 | Self::Super3 => Some(3),
            Self::Call4 | Self::Invoke4 | Self::Super4 => Some(4),
            Self::Call5 | Self::Invoke5 | Self::Super5 => Some(5),
            Self::Call6 | Self::Invoke6 | Self::Super6 => Some(6),
            Self::Call7 | Self::Invoke7 | Self::Super7 => Some(7),
            Self::Call8 | Self::Invoke8 | Self::Super8 => Some(8),
            Self::Call9 | Self::Invoke9 | Self::Super9 => Some(9),
            Self::Call10 | Self::Invoke10 | Self::Super10 => Some(10),
            _ => None,
        }
    }
}
