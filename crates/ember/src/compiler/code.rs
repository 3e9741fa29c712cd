//! Compiled bytecode: the flat byte stream, its constant pool, and the
//! builder the compiler emits into.

use crate::compiler::opcode::Opcode;
use crate::value::Value;

/// A function's compiled body: bytecode bytes, a per-byte source line table
/// (used for tracebacks), and its constant pool.
///
/// `lines[i]` is the source line of the instruction that byte `i` belongs
/// to; operand bytes share their opcode's line.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "bytecode-serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Code {
    pub bytes: Vec<u8>,
    pub lines: Vec<u32>,
    pub constants: Vec<Value>,
}

impl Code {
    #[must_use]
    pub fn opcode_at(&self, ip: usize) -> Opcode {
        Opcode::from_repr(self.bytes[ip]).expect("corrupt bytecode: unknown opcode byte")
    }

    #[must_use]
    pub fn line_at(&self, ip: usize) -> u32 {
        self.lines.get(ip).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn read_u8(&self, at: usize) -> u8 {
        self.bytes[at]
    }

    #[must_use]
    pub fn read_u16(&self, at: usize) -> u16 {
        u16::from_be_bytes([self.bytes[at], self.bytes[at + 1]])
    }

    #[must_use]
    pub fn read_i16(&self, at: usize) -> i16 {
        self.read_u16(at) as i16
    }
}

/// Handle to a not-yet-patched forward jump, returned by
/// [`CodeBuilder::emit_jump`]. Carries both the opcode's own byte offset
/// (so a placeholder like `SIGN_BRK` can later be rewritten in place to a
/// real `JUMP`) and the offset of its 16-bit operand.
#[derive(Debug, Clone, Copy)]
pub struct JumpHandle {
    opcode_at: usize,
    operand_at: usize,
}

impl JumpHandle {
    #[must_use]
    pub fn opcode_offset(&self) -> usize {
        self.opcode_at
    }
}

/// Builder the compiler emits opcodes and operands into.
///
/// Tracks the current source line so every emitted byte gets a traceback
/// entry, and supports the forward-jump-then-patch pattern the compiler uses
/// for `if`/`while`/`for`/short-circuit operators/`break`/`continue`.
#[derive(Debug, Default)]
pub struct CodeBuilder {
    bytes: Vec<u8>,
    lines: Vec<u32>,
    constants: Vec<Value>,
    current_line: u32,
}

impl CodeBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn offset(&self) -> usize {
        self.bytes.len()
    }

    pub fn set_line(&mut self, line: u32) {
        self.current_line = line;
    }

    fn push_byte(&mut self, byte: u8) {
        self.bytes.push(byte);
        self.lines.push(self.current_line);
    }

    pub fn emit(&mut self, op: Opcode) -> usize {
        let at = self.offset();
        self.push_byte(op as u8);
        at
    }

    pub fn emit_u8(&mut self, op: Opcode, operand: u8) -> usize {
        let at = self.emit(op);
        self.push_byte(operand);
        at
    }

    pub fn emit_u16(&mut self, op: Opcode, operand: u16) -> usize {
        let at = self.emit(op);
        let [hi, lo] = operand.to_be_bytes();
        self.push_byte(hi);
        self.push_byte(lo);
        at
    }

    /// Appends two raw bytes with no leading opcode tag — used for the
    /// `CLOSURE` instruction's trailing `(isLocal, index)` upvalue pairs,
    /// which the VM reads directly rather than dispatching as instructions.
    pub fn emit_raw_u8_pair(&mut self, a: u8, b: u8) {
        self.push_byte(a);
        self.push_byte(b);
    }

    pub fn emit_u16_u16(&mut self, op: Opcode, a: u16, b: u16) -> usize {
        let at = self.emit(op);
        let [hi, lo] = a.to_be_bytes();
        self.push_byte(hi);
        self.push_byte(lo);
        let [hi, lo] = b.to_be_bytes();
        self.push_byte(hi);
        self.push_byte(lo);
        at
    }

    pub fn emit_u8_u16(&mut self, op: Opcode, a: u8, b: u16) -> usize {
        let at = self.emit(op);
        self.push_byte(a);
        let [hi, lo] = b.to_be_bytes();
        self.push_byte(hi);
        self.push_byte(lo);
        at
    }

    /// Emits `op` with a placeholder 16-bit offset, returning a handle to
    /// patch once the jump target is known.
    pub fn emit_jump(&mut self, op: Opcode) -> JumpHandle {
        let at = self.emit(op);
        self.push_byte(0);
        self.push_byte(0);
        JumpHandle { opcode_at: at, operand_at: at + 1 }
    }

    /// Emits `op` with a `u8` operand followed by a placeholder 16-bit jump
    /// offset — the shape `FOR_NEXT slot8 off16` needs (test-and-branch with
    /// an extra operand ahead of the jump target).
    pub fn emit_jump_u8(&mut self, op: Opcode, operand: u8) -> JumpHandle {
        let at = self.emit(op);
        self.push_byte(operand);
        self.push_byte(0);
        self.push_byte(0);
        JumpHandle { opcode_at: at, operand_at: at + 2 }
    }

    /// Patches a forward jump emitted by [`Self::emit_jump`] to land at the
    /// current offset.
    ///
    /// # Panics
    /// Panics if the jump distance does not fit in a signed 16-bit offset —
    /// functions long enough to hit this are rejected with a compile error
    /// by the caller before reaching this point in practice.
    pub fn patch_jump(&mut self, handle: JumpHandle) {
        let target = self.offset();
        self.patch_jump_to(handle, target);
    }

    /// Patches a jump (forward or backward, e.g. a rewritten `SIGN_BRK`) to
    /// land at an explicit `target` offset.
    pub fn patch_jump_to(&mut self, handle: JumpHandle, target: usize) {
        let operand_at = handle.operand_at;
        let from = operand_at + 2;
        let offset = i32::try_from(target).unwrap() - i32::try_from(from).unwrap();
        let offset = i16::try_from(offset).expect("jump offset exceeds 16-bit range");
        let [hi, lo] = offset.to_be_bytes();
        self.bytes[operand_at] = hi;
        self.bytes[operand_at + 1] = lo;
    }

    /// Emits a backward jump to `target`, used for loop back-edges.
    pub fn emit_loop(&mut self, op: Opcode, target: usize) {
        let at = self.emit(op);
        let from = at + 3;
        let offset = i32::try_from(target).unwrap() - i32::try_from(from).unwrap();
        let offset = i16::try_from(offset).expect("loop offset exceeds 16-bit range");
        let [hi, lo] = offset.to_be_bytes();
        self.push_byte(hi);
        self.push_byte(lo);
    }

    /// Rewrites the opcode byte at `at` in place — used to turn a placeholder
    /// `SIGN_BRK`/`SIGN_CONT` into a real `JUMP` once the loop's exit and
    /// continue targets are known.
    pub fn rewrite_opcode(&mut self, at: usize, op: Opcode) {
        self.bytes[at] = op as u8;
    }

    /// Interns `value` in the constant pool, returning its 16-bit index.
    ///
    /// # Errors
    /// Returns `None` if the pool already holds `u16::MAX` entries — the
    /// compiler turns this into a compile error ("constants cap").
    pub fn add_constant(&mut self, value: Value) -> Option<u16> {
        let idx = self.constants.len();
        let idx = u16::try_from(idx).ok()?;
        self.constants.push(value);
        Some(idx)
    }

    #[must_use]
    pub fn build(self) -> Code {
        Code { bytes: self.bytes, lines: self.lines, constants: self.constants }
    }
}
