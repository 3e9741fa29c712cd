//! AST → bytecode lowering: scope analysis, upvalue capture, and emission of
//! `Function` objects and their constant pools.
//!
//! Spec's "compiler chain" (each nested function's compiler holds a pointer
//! to its enclosing one, so the GC can mark in-progress functions and so
//! upvalue resolution can walk outward) is represented here as a `Vec` of
//! [`FunctionScope`]s inside one [`Compiler`], indexed from outermost (the
//! module body) to innermost (the function currently being compiled) —
//! the same chain, generalized from a linked pointer chain to an
//! index-addressed stack, matching this crate's general preference (see
//! `heap.rs`, `table.rs`) for indices over raw pointers.

pub mod code;
pub mod opcode;

use crate::arena::Arena;
use crate::ast::{
    BinaryOp, ClassDecl, ExceptClause, Expr, For, Foreach, FunLit, If, Import, ImportKind, MethodDecl, Params, Stmt,
    Try, UnaryOp, VarDecl, While, With,
};
use crate::diagnostics::{CompileError, DiagnosticSink};
use crate::heap::Heap;
use crate::intern::Interns;
use crate::native::Arity;
use crate::object::{FunctionObj, ObjectId};
use crate::parser::Parser;
use crate::value::Value;
use code::{CodeBuilder, JumpHandle};
use opcode::Opcode;

const MAX_LOCALS: usize = 256;

/// Tags distinguishing why control reached a `SETUP_ENSURE` handler's
/// target, carried as the second of the `(payload, cause)` pair the unwind
/// protocol (or this compiler's own normal-completion path) pushes before
/// jumping there. Shared by the VM's unwind implementation.
const CAUSE_NORMAL: u64 = 0;
const CAUSE_RETURN: u64 = 1;
const CAUSE_EXCEPT: u64 = 2;

/// A stack-resident binding inside one function's activation frame.
struct Local<'a> {
    name: &'a str,
    /// Block-nesting depth (relative to this function's own body) the local
    /// was declared at; `0` is the function's own top level.
    depth: i32,
    /// `false` between `add_local` and `mark_initialized` — rejects a
    /// variable's own initializer referring to itself (`var a = a`), except
    /// for function declarations which mark themselves initialized
    /// immediately to allow direct recursion via an upvalue.
    initialized: bool,
    captured: bool,
}

#[derive(Clone, Copy)]
struct UpvalueDesc {
    is_local: bool,
    index: u8,
}

/// Per-loop bookkeeping for patching `break`/`continue` placeholders once
/// the loop's exit and continue targets are known.
struct LoopCtx {
    continue_target: usize,
    break_jumps: Vec<JumpHandle>,
    continue_jumps: Vec<JumpHandle>,
}

/// One function's compile-time state: its code builder, its locals, its
/// upvalue table, and loop context for `break`/`continue`.
struct FunctionScope<'a> {
    builder: CodeBuilder,
    locals: Vec<Local<'a>>,
    scope_depth: i32,
    upvalues: Vec<UpvalueDesc>,
    loops: Vec<LoopCtx>,
    name: Option<&'a str>,
    arity_most: u8,
    arity_defaults: u8,
    variadic: bool,
    is_method: bool,
    is_generator: bool,
    /// Trailing default-argument values, constant-folded by
    /// `compile_params` (see `FunctionObj::defaults`).
    defaults: Vec<Value>,
}

impl<'a> FunctionScope<'a> {
    fn new(name: Option<&'a str>, is_method: bool, is_generator: bool, is_module: bool) -> Self {
        let mut scope = Self {
            builder: CodeBuilder::new(),
            locals: Vec::new(),
            // The module body's own top level is the one true "depth 0 =
            // global" scope; every function's own top level is local from
            // the start since it owns a fresh activation frame.
            scope_depth: i32::from(!is_module),
            upvalues: Vec::new(),
            loops: Vec::new(),
            name,
            arity_most: 0,
            arity_defaults: 0,
            variadic: false,
            is_method,
            is_generator,
            defaults: Vec::new(),
        };
        // Slot 0 is always the callee/`this`; give it an unnamed local entry
        // so user locals start at slot 1.
        scope.locals.push(Local { name: "", depth: 0, initialized: true, captured: false });
        scope
    }
}

/// A single-pass AST-to-bytecode compiler, holding the scope chain for the
/// function currently being compiled plus the shared heap and intern table
/// used to materialize identifier constants and the final `Function`
/// objects.
pub struct Compiler<'a, 'h, S: DiagnosticSink> {
    scopes: Vec<FunctionScope<'a>>,
    heap: &'h mut Heap,
    interns: &'h mut Interns,
    module: ObjectId,
    file: String,
    sink: &'h mut S,
    had_error: bool,
    /// Cached class ids for builtin method-receiver classes, used to build
    /// `Function`/`Closure` objects at the end of each scope.
    function_class: Option<ObjectId>,
    closure_class: Option<ObjectId>,
    string_class: Option<ObjectId>,
}

impl<'a, 'h, S: DiagnosticSink> Compiler<'a, 'h, S> {
    #[must_use]
    pub fn new(heap: &'h mut Heap, interns: &'h mut Interns, module: ObjectId, file: impl Into<String>, sink: &'h mut S) -> Self {
        Self {
            scopes: vec![FunctionScope::new(None, false, false, true)],
            heap,
            interns,
            module,
            file: file.into(),
            sink,
            had_error: false,
            function_class: None,
            closure_class: None,
            string_class: None,
        }
    }

    pub fn set_builtin_classes(&mut self, function_class: ObjectId, closure_class: ObjectId, string_class: ObjectId) {
        self.function_class = Some(function_class);
        self.closure_class = Some(closure_class);
        self.string_class = Some(string_class);
    }

    #[must_use]
    pub fn had_error(&self) -> bool {
        self.had_error
    }

    fn error(&mut self, line: u32, message: impl Into<String>) {
        self.had_error = true;
        self.sink.report(CompileError::new(self.file.clone(), line, message.into()));
    }

    fn current(&mut self) -> &mut FunctionScope<'a> {
        self.scopes.last_mut().expect("compiler scope stack is never empty")
    }

    /// Interns `name` as a heap `String` constant and returns its 16-bit
    /// constant-pool index — the representation every `*_GLOBAL`/`GET_FIELD`/
    /// `INVOKE`/… name operand uses, per the compiler's string-deduplication
    /// rule.
    fn name_constant(&mut self, name: &str) -> u16 {
        let id = self.heap.intern_string(name.as_bytes(), self.string_class);
        let value = Value::Object(id);
        match self.current().builder.add_constant(value) {
            Some(idx) => idx,
            None => {
                self.error(0, "too many constants in one function (16-bit constant pool exceeded)");
                0
            }
        }
    }

    fn value_constant(&mut self, value: Value) -> u16 {
        match self.current().builder.add_constant(value) {
            Some(idx) => idx,
            None => {
                self.error(0, "too many constants in one function (16-bit constant pool exceeded)");
                0
            }
        }
    }

    // --- top-level entry points ---

    /// Compiles a complete source unit (a script or an imported module body)
    /// into a top-level `Function` with no parameters, registered as
    /// belonging to `self.module`. Returns `None` if any compile error was
    /// reported (the parser's own syntax errors already went through
    /// `sink`; semantic errors detected here do too).
    pub fn compile(mut self, source: &'a str, arena: &'a Arena) -> Option<ObjectId> {
        let mut parser = Parser::new(source, self.file.clone(), arena, self.sink);
        let program = parser.parse_program();
        if parser.had_error() {
            return None;
        }
        let Some(stmts) = program else { return None };
        for stmt in stmts {
            self.statement(stmt);
        }
        self.current().builder.emit(Opcode::Null);
        self.current().builder.emit(Opcode::Return);
        if self.had_error {
            return None;
        }
        let scope = self.scopes.pop().expect("module scope present");
        Some(self.finish_function(scope))
    }

    fn finish_function(&mut self, scope: FunctionScope<'a>) -> ObjectId {
        let name = scope.name.map(|n| self.interns.intern_str(n));
        let code = scope.builder.build();
        let function = FunctionObj {
            name,
            module: self.module,
            arity: Arity { most: scope.arity_most, defaults: scope.arity_defaults, variadic: scope.variadic },
            upvalue_count: u8::try_from(scope.upvalues.len()).unwrap_or(u8::MAX),
            is_method: scope.is_method,
            is_generator: scope.is_generator,
            owner_class: None,
            defaults: scope.defaults,
            code,
        };
        self.heap.alloc_function(function, self.function_class)
    }

    // --- scope / local helpers ---

    fn begin_block(&mut self) {
        self.current().scope_depth += 1;
    }

    /// Pops locals declared in the block just left, emitting `CLOSE_UPVALUE`
    /// for any that were captured (so the upvalue sees the final value
    /// rather than dangling into a reused stack slot) and a plain `POP`
    /// otherwise.
    fn end_block(&mut self) {
        let scope = self.current();
        scope.scope_depth -= 1;
        let depth = scope.scope_depth;
        while let Some(local) = scope.locals.last() {
            if local.depth <= depth {
                break;
            }
            if local.captured {
                scope.builder.emit(Opcode::CloseUpvalue);
            } else {
                scope.builder.emit(Opcode::Pop);
            }
            scope.locals.pop();
        }
    }

    fn is_module_scope(&self) -> bool {
        self.scopes.len() == 1 && self.scopes[0].scope_depth == 0
    }

    fn add_local(&mut self, name: &'a str) -> bool {
        let scope = self.current();
        if scope.locals.len() >= MAX_LOCALS {
            return false;
        }
        for local in scope.locals.iter().rev() {
            if local.depth < scope.scope_depth {
                break;
            }
            if local.name == name {
                return false;
            }
        }
        scope.locals.push(Local { name, depth: scope.scope_depth, initialized: false, captured: false });
        true
    }

    fn mark_initialized(&mut self) {
        if let Some(local) = self.current().locals.last_mut() {
            local.initialized = true;
        }
    }

    fn resolve_local_in(scope: &FunctionScope<'a>, name: &str) -> Option<u8> {
        scope.locals.iter().enumerate().rev().find(|(_, l)| l.name == name).map(|(i, _)| i as u8)
    }

    fn resolve_upvalue(scopes: &mut [FunctionScope<'a>], index: usize, name: &str) -> Option<u8> {
        if index == 0 {
            return None;
        }
        let parent = index - 1;
        if let Some(slot) = Self::resolve_local_in(&scopes[parent], name) {
            scopes[parent].locals[slot as usize].captured = true;
            return Some(Self::add_upvalue(scopes, index, true, slot));
        }
        if let Some(slot) = Self::resolve_upvalue(scopes, parent, name) {
            return Some(Self::add_upvalue(scopes, index, false, slot));
        }
        None
    }

    fn add_upvalue(scopes: &mut [FunctionScope<'a>], index: usize, is_local: bool, slot: u8) -> u8 {
        let scope = &mut scopes[index];
        for (i, up) in scope.upvalues.iter().enumerate() {
            if up.is_local == is_local && up.index == slot {
                return i as u8;
            }
        }
        scope.upvalues.push(UpvalueDesc { is_local, index: slot });
        u8::try_from(scope.upvalues.len() - 1).unwrap_or(u8::MAX)
    }

    /// Declares `name` as new variable binding in the *enclosing* scope of
    /// whatever is currently being compiled — at module depth 0 this is a
    /// no-op at the local-table level (globals are not tracked positionally);
    /// locally it registers a new stack slot.
    fn declare_variable(&mut self, name: &'a str, line: u32) {
        if self.is_module_scope() {
            return;
        }
        if !self.add_local(name) {
            self.error(line, format!("redeclaration or too many locals: '{name}'"));
        }
    }

    /// Emits the binding opcode for `name` after its value is already on
    /// top of the operand stack (or, for a fresh local, simply finalizes the
    /// slot already occupied by the evaluated initializer).
    fn define_variable(&mut self, name: &'a str) {
        if self.is_module_scope() {
            let idx = self.name_constant(name);
            self.current().builder.emit_u16(Opcode::DefineGlobal, idx);
        } else {
            self.mark_initialized();
        }
    }

    // --- name resolution for reads/writes ---

    fn emit_get_name(&mut self, name: &str, line: u32) {
        if let Some(slot) = Self::resolve_local_in(self.scopes.last().unwrap(), name) {
            self.current().builder.emit_u8(Opcode::GetLocal, slot);
            return;
        }
        let last = self.scopes.len() - 1;
        if let Some(slot) = Self::resolve_upvalue(&mut self.scopes, last, name) {
            self.current().builder.emit_u8(Opcode::GetUpvalue, slot);
            return;
        }
        let idx = self.name_constant(name);
        self.current().builder.set_line(line);
        self.current().builder.emit_u16(Opcode::GetGlobal, idx);
    }

    fn emit_set_name(&mut self, name: &str, line: u32) {
        if let Some(slot) = Self::resolve_local_in(self.scopes.last().unwrap(), name) {
            self.current().builder.emit_u8(Opcode::SetLocal, slot);
            return;
        }
        let last = self.scopes.len() - 1;
        if let Some(slot) = Self::resolve_upvalue(&mut self.scopes, last, name) {
            self.current().builder.emit_u8(Opcode::SetUpvalue, slot);
            return;
        }
        let idx = self.name_constant(name);
        self.current().builder.set_line(line);
        self.current().builder.emit_u16(Opcode::SetGlobal, idx);
    }

    // --- statements ---

    fn statement(&mut self, stmt: &Stmt<'a>) {
        match stmt {
            Stmt::Expr(e) => {
                self.expression(e);
                self.current().builder.emit(Opcode::Pop);
            }
            Stmt::VarDecl(v) => self.var_decl(v),
            Stmt::FunDecl(f) => self.fun_decl(f),
            Stmt::NativeDecl { name, params } => self.native_decl(name, params),
            Stmt::ClassDecl(c) => self.class_decl(c),
            Stmt::If(i) => self.if_stmt(i),
            Stmt::While(w) => self.while_stmt(w),
            Stmt::For(f) => self.for_stmt(f),
            Stmt::Foreach(f) => self.foreach_stmt(f),
            Stmt::Return(e) => self.return_stmt(e.as_ref()),
            Stmt::Break => self.break_stmt(),
            Stmt::Continue => self.continue_stmt(),
            Stmt::Block(stmts) => {
                self.begin_block();
                for s in *stmts {
                    self.statement(s);
                }
                self.end_block();
            }
            Stmt::Import(i) => self.import_stmt(i),
            Stmt::Try(t) => self.try_stmt(t),
            Stmt::Raise(e) => {
                self.expression(e);
                self.current().builder.emit(Opcode::Raise);
            }
            Stmt::With(w) => self.with_stmt(w),
        }
    }

    fn var_decl(&mut self, decl: &VarDecl<'a>) {
        if decl.targets.len() == 1 {
            let name = decl.targets[0];
            self.declare_variable(name, 0);
            match &decl.value {
                Some(e) => self.expression(e),
                None => {
                    self.current().builder.emit(Opcode::Null);
                }
            }
            self.define_variable(name);
            return;
        }
        let n = decl.targets.len();
        let literal_matches = matches!(&decl.value, Some(Expr::List(items)) if items.len() == n)
            || matches!(&decl.value, Some(Expr::Tuple(items)) if items.len() == n);
        if literal_matches {
            let items: &[Expr<'a>] = match decl.value.as_ref().unwrap() {
                Expr::List(items) | Expr::Tuple(items) => items,
                _ => unreachable!(),
            };
            for item in items {
                self.expression(item);
            }
        } else {
            match &decl.value {
                Some(e) => self.expression(e),
                None => self.current().builder.emit(Opcode::Null),
            }
            self.current().builder.emit_u8(Opcode::Unpack, u8::try_from(n).unwrap_or(255));
        }
        if self.is_module_scope() {
            // Top of stack holds element(n-1) first; bind in reverse
            // declared order so each DEFINE_GLOBAL consumes the matching
            // element as it peels off the stack.
            for name in decl.targets.iter().rev() {
                self.declare_variable(name, 0);
                self.define_variable(name);
            }
        } else {
            // Fresh locals occupy ascending slots matching forward push
            // order (element 0 is deepest == first declared == lowest slot).
            for name in decl.targets {
                self.declare_variable(name, 0);
                self.define_variable(name);
            }
        }
    }

    fn compile_params(&mut self, params: &Params<'a>) {
        let default_count = params.defaults.iter().filter(|d| d.is_some()).count();
        // Default-argument values are restricted to constant-foldable
        // literals: the call protocol fills missing trailing params from a
        // plain `Vec<Value>` baked onto the `Function` rather than
        // re-evaluating an expression at every call (see DESIGN.md).
        let mut defaults = Vec::with_capacity(default_count);
        for default in params.defaults.iter().flatten() {
            match self.literal_default_value(default) {
                Some(value) => defaults.push(value),
                None => self.error(0, "default argument values must be constant literals"),
            }
        }
        let scope = self.current();
        // `params.names` includes the `...rest` collector's own name when
        // variadic (the parser pushes it before breaking out of the
        // parameter loop) — exclude it here so `arity_most` counts only
        // caller-supplied argument slots, matching the native arity
        // convention the call protocol's `Arity::least`/`most` checks assume.
        let collector = usize::from(params.variadic);
        scope.arity_most = u8::try_from(params.names.len() - collector).unwrap_or(u8::MAX);
        scope.variadic = params.variadic;
        scope.arity_defaults = u8::try_from(default_count).unwrap_or(0);
        scope.defaults = defaults;
        for name in params.names {
            self.add_local(name);
            self.mark_initialized();
        }
    }

    /// Folds a default-argument expression into a runtime `Value` at compile
    /// time. Only literals are supported (see `compile_params`).
    fn literal_default_value(&mut self, expr: &Expr<'a>) -> Option<Value> {
        match expr {
            Expr::Number(n) => Some(Value::Number(*n)),
            Expr::Bool(b) => Some(Value::Bool(*b)),
            Expr::Null => Some(Value::Null),
            Expr::Str(s) => {
                let id = self.heap.intern_string(s.as_bytes(), self.string_class);
                Some(Value::Object(id))
            }
            Expr::Unary(UnaryOp::Neg, inner) => match &**inner {
                Expr::Number(n) => Some(Value::Number(-*n)),
                _ => None,
            },
            _ => None,
        }
    }

    fn compile_function_body(&mut self, name: Option<&'a str>, params: &Params<'a>, body: &[Stmt<'a>], is_method: bool, is_generator: bool) -> ObjectId {
        self.scopes.push(FunctionScope::new(name, is_method, is_generator, false));
        self.compile_params(params);
        for stmt in body {
            self.statement(stmt);
        }
        self.current().builder.emit(Opcode::Null);
        self.current().builder.emit(Opcode::Return);
        let scope = self.scopes.pop().expect("pushed above");
        let upvalues: Vec<UpvalueDesc> = scope.upvalues.iter().copied().collect();
        let function_id = self.finish_function(scope);
        let const_idx = self.value_constant(Value::Object(function_id));
        self.current().builder.emit_u16(Opcode::Closure, const_idx);
        for up in upvalues {
            self.current().builder.emit_raw_u8_pair(u8::from(up.is_local), up.index);
        }
        function_id
    }

    fn fun_decl(&mut self, fun: &FunLit<'a>) {
        let name = fun.name.expect("fun declarations always carry a name");
        self.declare_variable(name, 0);
        if !self.is_module_scope() {
            // Locals see their own name immediately, enabling recursion
            // through the upvalue the closure will capture.
            self.mark_initialized();
        }
        self.compile_closure_inline(Some(name), &fun.params, fun.body, false, fun.is_generator);
        self.define_variable(name);
    }

    /// Emits `CLOSURE` (+ upvalue operand pairs) for a function literal
    /// without relying on `compile_function_body`'s own emit of the closure
    /// op, so callers that need the closure bytes in a specific place (none
    /// currently) can still reuse the pipeline; kept as the single place the
    /// `CLOSURE` opcode and its upvalue-pair encoding are emitted.
    fn compile_closure_inline(&mut self, name: Option<&'a str>, params: &Params<'a>, body: &[Stmt<'a>], is_method: bool, is_generator: bool) {
        self.compile_function_body(name, params, body, is_method, is_generator);
    }

    fn native_decl(&mut self, name: &'a str, params: &Params<'a>) {
        self.declare_variable(name, 0);
        let _ = params;
        let idx = self.name_constant(name);
        self.current().builder.emit_u16(Opcode::Native, idx);
        self.define_variable(name);
    }

    fn class_decl(&mut self, decl: &ClassDecl<'a>) {
        self.declare_variable(decl.name, 0);
        let name_idx = self.name_constant(decl.name);
        if let Some(super_name) = decl.superclass {
            self.emit_get_name(super_name, 0);
            self.current().builder.emit_u16(Opcode::NewSubclass, name_idx);
        } else {
            self.current().builder.emit_u16(Opcode::NewClass, name_idx);
        }
        for method in decl.methods {
            self.compile_method(method);
        }
        self.define_variable(decl.name);
    }

    fn compile_method(&mut self, method: &MethodDecl<'a>) {
        let method_name_idx = self.name_constant(method.name);
        if method.native {
            // Both operands name the same host-registry entry; there is no
            // separate alias syntax for `native fun` methods.
            self.current().builder.emit_u16_u16(Opcode::NatMethod, method_name_idx, method_name_idx);
            return;
        }
        self.compile_function_body(Some(method.name), &method.params, method.body, true, method.is_generator);
        self.current().builder.emit_u16(Opcode::DefMethod, method_name_idx);
    }

    fn if_stmt(&mut self, node: &If<'a>) {
        self.expression(&node.cond);
        let else_jump = self.current().builder.emit_jump(Opcode::Jumpf);
        self.current().builder.emit(Opcode::Pop);
        self.begin_block();
        for s in node.then_branch {
            self.statement(s);
        }
        self.end_block();
        let mut end_jumps = vec![self.current().builder.emit_jump(Opcode::Jump)];
        self.current().builder.patch_jump(else_jump);
        self.current().builder.emit(Opcode::Pop);
        for (cond, body) in node.elifs {
            self.expression(cond);
            let next_jump = self.current().builder.emit_jump(Opcode::Jumpf);
            self.current().builder.emit(Opcode::Pop);
            self.begin_block();
            for s in *body {
                self.statement(s);
            }
            self.end_block();
            end_jumps.push(self.current().builder.emit_jump(Opcode::Jump));
            self.current().builder.patch_jump(next_jump);
            self.current().builder.emit(Opcode::Pop);
        }
        if let Some(else_branch) = node.else_branch {
            self.begin_block();
            for s in else_branch {
                self.statement(s);
            }
            self.end_block();
        }
        for jump in end_jumps {
            self.current().builder.patch_jump(jump);
        }
    }

    fn while_stmt(&mut self, node: &While<'a>) {
        let loop_start = self.current().builder.offset();
        self.current().loops.push(LoopCtx { continue_target: loop_start, break_jumps: Vec::new(), continue_jumps: Vec::new() });
        self.expression(&node.cond);
        let exit_jump = self.current().builder.emit_jump(Opcode::Jumpf);
        self.current().builder.emit(Opcode::Pop);
        self.begin_block();
        for s in node.body {
            self.statement(s);
        }
        self.end_block();
        self.current().builder.emit_loop(Opcode::Jump, loop_start);
        self.current().builder.patch_jump(exit_jump);
        self.current().builder.emit(Opcode::Pop);
        self.close_loop();
    }

    fn close_loop(&mut self) {
        let end = self.current().builder.offset();
        let loop_ctx = self.current().loops.pop().expect("close_loop called within a loop");
        for handle in loop_ctx.break_jumps {
            self.rewrite_signal(handle, Opcode::Jump, end);
        }
        for handle in loop_ctx.continue_jumps {
            self.rewrite_signal(handle, Opcode::Jump, loop_ctx.continue_target);
        }
    }

    fn rewrite_signal(&mut self, handle: JumpHandle, op: Opcode, target: usize) {
        let at = handle.opcode_offset();
        self.current().builder.rewrite_opcode(at, op);
        self.current().builder.patch_jump_to(handle, target);
    }

    fn for_stmt(&mut self, node: &For<'a>) {
        self.begin_block();
        if let Some(init) = node.init {
            self.statement(init);
        }
        let loop_start = self.current().builder.offset();
        let exit_jump = if let Some(cond) = &node.cond {
            self.expression(cond);
            let j = self.current().builder.emit_jump(Opcode::Jumpf);
            self.current().builder.emit(Opcode::Pop);
            Some(j)
        } else {
            None
        };
        // Continue must still run the post-expression before re-testing the
        // condition, so the continue target is the post-expression's start,
        // patched in after we know its offset.
        let continue_placeholder = self.current().builder.offset();
        self.current().loops.push(LoopCtx { continue_target: continue_placeholder, break_jumps: Vec::new(), continue_jumps: Vec::new() });
        self.begin_block();
        for s in node.body {
            self.statement(s);
        }
        self.end_block();
        let post_start = self.current().builder.offset();
        if let Some(post) = node.post {
            self.statement(post);
        }
        self.current().builder.emit_loop(Opcode::Jump, loop_start);
        if let Some(j) = exit_jump {
            self.current().builder.patch_jump(j);
            self.current().builder.emit(Opcode::Pop);
        }
        // Fix up the continue target we guessed before compiling the body:
        // continues jump to the post-expression, not to our placeholder.
        let loop_ctx = self.current().loops.last_mut().unwrap();
        loop_ctx.continue_target = post_start;
        self.close_loop();
        self.end_block();
    }

    /// Lowers `foreach` per the compiler design: a hidden `.expr` local, a
    /// hidden `.iter` local initialized to `null`, and a `FOR_ITER`/`FOR_NEXT`
    /// pair driving the iteration protocol.
    fn foreach_stmt(&mut self, node: &Foreach<'a>) {
        self.begin_block();
        self.expression(&node.iterable);
        let expr_slot = self.declare_hidden_local(".expr");
        self.current().builder.emit(Opcode::Null);
        self.declare_hidden_local(".iter");

        let loop_start = self.current().builder.offset();
        self.current().loops.push(LoopCtx { continue_target: loop_start, break_jumps: Vec::new(), continue_jumps: Vec::new() });
        self.current().builder.emit_u8(Opcode::ForIter, expr_slot);
        let exit_jump = self.current().builder.emit_jump_u8(Opcode::ForNext, expr_slot);

        self.begin_block();
        if node.vars.len() == 1 {
            self.add_local(node.vars[0]);
            self.mark_initialized();
        } else {
            self.current().builder.emit_u8(Opcode::Unpack, u8::try_from(node.vars.len()).unwrap_or(255));
            for name in node.vars {
                self.add_local(name);
                self.mark_initialized();
            }
        }
        for s in node.body {
            self.statement(s);
        }
        self.end_block();
        self.current().builder.emit_loop(Opcode::Jump, loop_start);
        self.rewrite_signal(exit_jump, Opcode::ForNext, self.current().builder.offset());
        self.close_loop();
        self.end_block();
    }

    /// Declares a compiler-synthesized local (hidden iteration/resource
    /// bindings) whose name can never collide with user identifiers, and
    /// returns its stack slot.
    fn declare_hidden_local(&mut self, name: &'static str) -> u8 {
        self.add_local(name);
        self.mark_initialized();
        Self::resolve_local_in(self.scopes.last().unwrap(), name).expect("just added")
    }

    fn break_stmt(&mut self) {
        let handle = self.current().builder.emit_jump(Opcode::SignBrk);
        if let Some(loop_ctx) = self.current().loops.last_mut() {
            loop_ctx.break_jumps.push(handle);
        }
    }

    fn continue_stmt(&mut self) {
        let handle = self.current().builder.emit_jump(Opcode::SignCont);
        if let Some(loop_ctx) = self.current().loops.last_mut() {
            loop_ctx.continue_jumps.push(handle);
        }
    }

    fn return_stmt(&mut self, value: Option<&Expr<'a>>) {
        match value {
            Some(e) => self.expression(e),
            None => {
                self.current().builder.emit(Opcode::Null);
            }
        }
        self.current().builder.emit(Opcode::Return);
    }

    fn import_stmt(&mut self, import: &Import<'a>) {
        let dotted = import.path.join(".");
        let dotted_idx = self.name_constant(&dotted);
        match &import.kind {
            ImportKind::Module { alias: None } => {
                self.current().builder.emit_u16(Opcode::Import, dotted_idx);
                let top_name = import.path[0];
                self.declare_variable(top_name, 0);
                self.define_variable(top_name);
            }
            ImportKind::Module { alias: Some(alias) } => {
                let alias_idx = self.name_constant(alias);
                self.current().builder.emit_u16_u16(Opcode::ImportAs, dotted_idx, alias_idx);
                self.declare_variable(alias, 0);
                self.define_variable(alias);
            }
            ImportKind::Names(bindings) => {
                self.current().builder.emit_u16(Opcode::ImportFrom, dotted_idx);
                for binding in *bindings {
                    let name_idx = self.name_constant(binding.name);
                    self.current().builder.emit_u16(Opcode::ImportName, name_idx);
                    let local_name = binding.alias.unwrap_or(binding.name);
                    self.declare_variable(local_name, 0);
                    self.define_variable(local_name);
                }
            }
        }
    }

    /// Lowers `try`/`except*`/`ensure?` per §4.4: `SETUP_ENSURE` before
    /// `SETUP_EXCEPT` so ensure wraps except on the handler stack; the
    /// except-matching chain is ordinary compiled bytecode at the handler's
    /// target address (there is no separate runtime dispatch table), and
    /// `END_TRY` is the single sentinel every path funnels through.
    fn try_stmt(&mut self, node: &Try<'a>) {
        let has_ensure = node.ensure.is_some();
        let has_except = !node.excepts.is_empty();

        let ensure_handler = has_ensure.then(|| self.current().builder.emit_jump(Opcode::SetupEnsure));
        let except_handler = has_except.then(|| self.current().builder.emit_jump(Opcode::SetupExcept));

        self.begin_block();
        for s in node.body {
            self.statement(s);
        }
        self.end_block();

        if has_except {
            self.current().builder.emit(Opcode::PopHandler);
        }
        // Normal completion of the body (or, below, of a matched except
        // clause) converges here before reaching whatever the construct's
        // own tail is.
        let after_body_normal = has_except.then(|| self.current().builder.emit_jump(Opcode::Jump));

        if let Some(handle) = except_handler {
            let except_entry = self.current().builder.offset();
            self.current().builder.patch_jump_to(handle, except_entry);
            self.compile_except_chain(node.excepts);
        }
        if let Some(jump) = after_body_normal {
            self.current().builder.patch_jump(jump);
        }

        if has_ensure {
            // Reached here either because the body (and any except clause)
            // completed normally, or because the VM's unwind jumped
            // straight to `ensure_entry` with its own `(payload, cause)`
            // pair already on the stack. The normal route discharges the
            // handler itself and supplies a NORMAL-tagged pair so both
            // routes share the same tail from here on.
            self.current().builder.emit(Opcode::PopHandler);
            self.push_cause_pair(Value::Null, CAUSE_NORMAL);
            let ensure_entry = self.current().builder.offset();
            self.current().builder.patch_jump_to(ensure_handler.unwrap(), ensure_entry);
            self.compile_ensure_tail(node.ensure.unwrap());
        } else if has_except {
            self.current().builder.emit(Opcode::EndTry);
        }
    }

    /// Compiles the sequence of `except` clauses a handler jumps into: the
    /// exception value and cause tag are already on the stack (pushed either
    /// by the VM's unwind or by `try_stmt`'s normal-path simulation). A
    /// matching clause binds its name, runs its body, then falls through to
    /// whatever `try_stmt` emits next (its own `ensure` tail, or a plain
    /// `EndTry`); an unmatched exception is re-raised so an outer handler
    /// receives it instead of falling through.
    fn compile_except_chain(&mut self, excepts: &[ExceptClause<'a>]) {
        // Stack on entry: [.., exception, cause] (exception pushed first,
        // so it occupies the lower slot).
        self.begin_block();
        let exc_slot = self.declare_hidden_local(".exc");
        let _cause_slot = self.declare_hidden_local(".cause");
        let mut end_jumps = Vec::new();
        for except in excepts {
            let class_idx = self.name_constant(except.class_name);
            self.current().builder.emit_u8(Opcode::GetLocal, exc_slot);
            self.current().builder.emit_u16(Opcode::GetGlobal, class_idx);
            self.current().builder.emit(Opcode::Is);
            let next = self.current().builder.emit_jump(Opcode::Jumpf);
            self.current().builder.emit(Opcode::Pop);
            self.begin_block();
            if let Some(binding) = except.binding {
                self.current().builder.emit_u8(Opcode::GetLocal, exc_slot);
                self.add_local(binding);
                self.mark_initialized();
            }
            for s in except.body {
                self.statement(s);
            }
            self.end_block();
            end_jumps.push(self.current().builder.emit_jump(Opcode::Jump));
            self.current().builder.patch_jump(next);
            self.current().builder.emit(Opcode::Pop);
        }
        // No clause matched: re-raise so the next active handler (an outer
        // `ensure` or an enclosing `try`) receives it.
        self.current().builder.emit_u8(Opcode::GetLocal, exc_slot);
        self.current().builder.emit(Opcode::Raise);
        for jump in end_jumps {
            self.current().builder.patch_jump(jump);
        }
        self.end_block();
    }

    /// Pushes a `(payload, cause)` pair matching the shape the VM's own
    /// return/exception unwind pushes before jumping to a pending handler.
    fn push_cause_pair(&mut self, payload: Value, cause: u64) {
        let payload_idx = self.value_constant(payload);
        self.current().builder.emit_u16(Opcode::GetConst, payload_idx);
        let cause_idx = self.value_constant(Value::Handle(cause));
        self.current().builder.emit_u16(Opcode::GetConst, cause_idx);
    }

    /// Runs `body` with the entry `(payload, cause)` pair bound to hidden
    /// locals, then resumes whichever control transfer was in flight: a
    /// pending `return` re-returns `payload`, a pending exception re-raises
    /// it, and otherwise control simply falls through past `EndTry`.
    fn compile_ensure_tail(&mut self, body: &[Stmt<'a>]) {
        self.begin_block();
        let payload_slot = self.declare_hidden_local(".payload");
        let cause_slot = self.declare_hidden_local(".cause");
        for s in body {
            self.statement(s);
        }
        self.emit_ensure_resume(payload_slot, cause_slot);
        self.end_block();
        self.current().builder.emit(Opcode::EndTry);
    }

    fn emit_ensure_resume(&mut self, payload_slot: u8, cause_slot: u8) {
        self.current().builder.emit_u8(Opcode::GetLocal, cause_slot);
        let return_const = self.value_constant(Value::Handle(CAUSE_RETURN));
        self.current().builder.emit_u16(Opcode::GetConst, return_const);
        self.current().builder.emit(Opcode::Eq);
        let not_return = self.current().builder.emit_jump(Opcode::Jumpf);
        self.current().builder.emit(Opcode::Pop);
        self.current().builder.emit_u8(Opcode::GetLocal, payload_slot);
        self.current().builder.emit(Opcode::Return);
        self.current().builder.patch_jump(not_return);
        self.current().builder.emit(Opcode::Pop);

        self.current().builder.emit_u8(Opcode::GetLocal, cause_slot);
        let except_const = self.value_constant(Value::Handle(CAUSE_EXCEPT));
        self.current().builder.emit_u16(Opcode::GetConst, except_const);
        self.current().builder.emit(Opcode::Eq);
        let not_except = self.current().builder.emit_jump(Opcode::Jumpf);
        self.current().builder.emit(Opcode::Pop);
        self.current().builder.emit_u8(Opcode::GetLocal, payload_slot);
        self.current().builder.emit(Opcode::Raise);
        self.current().builder.patch_jump(not_except);
        self.current().builder.emit(Opcode::Pop);
    }

    /// `with name = expr { body }` desugars to
    /// `try { name = expr; body } ensure { if name: name.close() }`.
    fn with_stmt(&mut self, node: &With<'a>) {
        self.begin_block();
        self.declare_variable(node.binding, 0);
        self.expression(&node.expr);
        self.define_variable(node.binding);

        let ensure_handler = self.current().builder.emit_jump(Opcode::SetupEnsure);
        self.begin_block();
        for s in node.body {
            self.statement(s);
        }
        self.end_block();
        self.current().builder.emit(Opcode::PopHandler);
        self.push_cause_pair(Value::Null, CAUSE_NORMAL);
        let ensure_entry = self.current().builder.offset();
        self.current().builder.patch_jump_to(ensure_handler, ensure_entry);

        self.begin_block();
        let payload_slot = self.declare_hidden_local(".payload");
        let cause_slot = self.declare_hidden_local(".cause");

        self.emit_get_name(node.binding, 0);
        let skip_close = self.current().builder.emit_jump(Opcode::Jumpf);
        self.current().builder.emit(Opcode::Pop);
        self.emit_get_name(node.binding, 0);
        let close_idx = self.name_constant("close");
        self.current().builder.emit_u16(Opcode::Invoke0, close_idx);
        self.current().builder.emit(Opcode::Pop);
        let after_close = self.current().builder.emit_jump(Opcode::Jump);
        self.current().builder.patch_jump(skip_close);
        self.current().builder.emit(Opcode::Pop);
        self.current().builder.patch_jump(after_close);

        self.emit_ensure_resume(payload_slot, cause_slot);
        self.end_block();
        self.current().builder.emit(Opcode::EndTry);
        self.end_block();
    }

    // --- expressions ---

    fn expression(&mut self, expr: &Expr<'a>) {
        match expr {
            Expr::Number(n) => {
                let idx = self.value_constant(Value::Number(*n));
                self.current().builder.emit_u16(Opcode::GetConst, idx);
            }
            Expr::Bool(b) => {
                let idx = self.value_constant(Value::Bool(*b));
                self.current().builder.emit_u16(Opcode::GetConst, idx);
            }
            Expr::Null => {
                self.current().builder.emit(Opcode::Null);
            }
            Expr::Str(s) => {
                let bytes = crate::lexer::Lexer::unescape(s);
                let id = self.heap.intern_string(&bytes, self.string_class);
                let idx = self.value_constant(Value::Object(id));
                self.current().builder.emit_u16(Opcode::GetConst, idx);
            }
            Expr::Ident(name) => self.emit_get_name(name, 0),
            Expr::This => self.emit_get_name_this(),
            Expr::Super(method) => self.compile_super_access(*method),
            Expr::Unary(op, operand) => {
                self.expression(operand);
                self.current().builder.emit(match op {
                    UnaryOp::Neg => Opcode::Neg,
                    UnaryOp::Not => Opcode::Not,
                });
            }
            Expr::Binary(op, a, b) => {
                self.expression(a);
                self.expression(b);
                self.emit_binary_op(*op);
            }
            Expr::Logical(op, a, b) => self.logical(*op, a, b),
            Expr::Assign(lhs, rhs) => self.assign(lhs, rhs),
            Expr::CompoundAssign(op, lhs, rhs) => self.compound_assign(*op, lhs, rhs),
            Expr::Call(callee, args) => self.call(callee, args),
            Expr::GetField(recv, name) => {
                self.expression(recv);
                let idx = self.name_constant(name);
                self.current().builder.emit_u16(Opcode::GetField, idx);
            }
            Expr::Subscript(recv, index) => {
                self.expression(recv);
                self.expression(index);
                self.current().builder.emit(Opcode::SubscrGet);
            }
            Expr::List(items) => {
                for item in *items {
                    self.expression(item);
                }
                self.current().builder.emit_u16(Opcode::NewList, u16::try_from(items.len()).unwrap_or(u16::MAX));
            }
            Expr::Tuple(items) => {
                for item in *items {
                    self.expression(item);
                }
                self.current().builder.emit_u16(Opcode::NewTuple, u16::try_from(items.len()).unwrap_or(u16::MAX));
            }
            Expr::Table(pairs) => {
                for (k, v) in *pairs {
                    self.expression(k);
                    self.expression(v);
                }
                self.current().builder.emit_u16(Opcode::NewTable, u16::try_from(pairs.len()).unwrap_or(u16::MAX));
            }
            Expr::Fun(fun) => {
                self.compile_function_body(fun.name, &fun.params, fun.body, false, fun.is_generator);
            }
            Expr::Yield(value) => {
                self.expression(value);
                self.current().builder.emit(Opcode::Yield);
            }
        }
    }

    fn emit_get_name_this(&mut self) {
        // `this` is always slot 0 of the current (method) frame.
        self.current().builder.emit_u8(Opcode::GetLocal, 0);
    }

    /// `super` or `super.name`: resolves `name` on the *compiled* method's
    /// reserved superclass constant slot via `SUPER_BIND`, or — as a call
    /// target — is handled directly by `call()`.
    fn compile_super_access(&mut self, method: Option<&'a str>) {
        let name = method.unwrap_or("construct");
        let idx = self.name_constant(name);
        self.current().builder.emit_u8(Opcode::GetLocal, 0);
        self.current().builder.emit_u16(Opcode::SuperBind, idx);
    }

    fn logical(&mut self, op: crate::ast::LogicalOp, a: &Expr<'a>, b: &Expr<'a>) {
        use crate::ast::LogicalOp;
        self.expression(a);
        match op {
            LogicalOp::And => {
                let short = self.current().builder.emit_jump(Opcode::Jumpf);
                self.current().builder.emit(Opcode::Pop);
                self.expression(b);
                self.current().builder.patch_jump(short);
            }
            LogicalOp::Or => {
                let short = self.current().builder.emit_jump(Opcode::Jumpt);
                self.current().builder.emit(Opcode::Pop);
                self.expression(b);
                self.current().builder.patch_jump(short);
            }
        }
    }

    fn assign(&mut self, lhs: &Expr<'a>, rhs: &Expr<'a>) {
        match lhs {
            Expr::Ident(name) => {
                self.expression(rhs);
                self.current().builder.emit(Opcode::Dup);
                self.emit_set_name(name, 0);
                self.current().builder.emit(Opcode::Pop);
            }
            Expr::GetField(recv, field) => {
                self.expression(recv);
                self.expression(rhs);
                let idx = self.name_constant(field);
                self.current().builder.emit_u16(Opcode::SetField, idx);
            }
            Expr::Subscript(recv, index) => {
                self.expression(recv);
                self.expression(index);
                self.expression(rhs);
                self.current().builder.emit(Opcode::SubscrSet);
            }
            _ => self.error(0, "invalid assignment target"),
        }
    }

    /// `a op= b` desugars to `a = a op b` with a single evaluation of `a`'s
    /// receiver (for attribute/subscript lvalues).
    fn compound_assign(&mut self, op: BinaryOp, lhs: &Expr<'a>, rhs: &Expr<'a>) {
        match lhs {
            Expr::Ident(name) => {
                self.emit_get_name(name, 0);
                self.expression(rhs);
                self.emit_binary_op(op);
                self.emit_set_name(name, 0);
            }
            Expr::GetField(recv, field) => {
                self.expression(recv);
                self.current().builder.emit(Opcode::Dup);
                let idx = self.name_constant(field);
                self.current().builder.emit_u16(Opcode::GetField, idx);
                self.expression(rhs);
                self.emit_binary_op(op);
                self.current().builder.emit_u16(Opcode::SetField, idx);
            }
            Expr::Subscript(recv, index) => {
                // Receiver and index are evaluated once, onto two anonymous
                // stack slots addressable the same way a declared local
                // would be (the frame's current stack depth already equals
                // `locals.len()` here). Reading the current value via
                // `GET_LOCAL` copies leaves the originals sitting right
                // where `SUBSCR_SET` wants them (receiver, index, value)
                // once the combined value lands on top.
                let recv_slot = u8::try_from(self.current().locals.len()).unwrap_or(255);
                self.expression(recv);
                let index_slot = recv_slot + 1;
                self.expression(index);
                self.current().builder.emit_u8(Opcode::GetLocal, recv_slot);
                self.current().builder.emit_u8(Opcode::GetLocal, index_slot);
                self.current().builder.emit(Opcode::SubscrGet);
                self.expression(rhs);
                self.emit_binary_op(op);
                self.current().builder.emit(Opcode::SubscrSet);
            }
            _ => self.error(0, "invalid compound-assignment target"),
        }
    }

    fn call(&mut self, callee: &Expr<'a>, args: &[Expr<'a>]) {
        let argc = u8::try_from(args.len()).unwrap_or(255);
        match callee {
            Expr::GetField(recv, name) => {
                self.expression(recv);
                for a in args {
                    self.expression(a);
                }
                let idx = self.name_constant(name);
                self.emit_invoke_like(Opcode::Invoke, argc, idx);
            }
            Expr::Super(method) => {
                let name = method.unwrap_or("construct");
                let idx = self.name_constant(name);
                self.current().builder.emit_u8(Opcode::GetLocal, 0);
                for a in args {
                    self.expression(a);
                }
                self.emit_invoke_like(Opcode::Super, argc, idx);
            }
            _ => {
                self.expression(callee);
                for a in args {
                    self.expression(a);
                }
                self.emit_call_like(argc);
            }
        }
    }

    fn emit_call_like(&mut self, argc: u8) {
        if argc <= 10 {
            let op = call_short_form(Opcode::Call0, argc);
            self.current().builder.emit(op);
        } else {
            self.current().builder.emit_u8(Opcode::Call, argc);
        }
    }

    /// Emits the opcode(s) for a binary operator; `!=` has no opcode of its
    /// own and is lowered to `EQ` followed by `NOT`.
    fn emit_binary_op(&mut self, op: BinaryOp) {
        self.current().builder.emit(binary_opcode(op));
        if op == BinaryOp::Ne {
            self.current().builder.emit(Opcode::Not);
        }
    }

    fn emit_invoke_like(&mut self, base: Opcode, argc: u8, name_idx: u16) {
        if argc <= 10 {
            let op = call_short_form(if base == Opcode::Super { Opcode::Super0 } else { Opcode::Invoke0 }, argc);
            self.current().builder.emit_u16(op, name_idx);
        } else {
            self.current().builder.emit_u8_u16(base, argc, name_idx);
        }
    }
}

fn call_short_form(zero: Opcode, argc: u8) -> Opcode {
    let base = zero as u8;
    Opcode::from_repr(base + argc).expect("argc <= 10 maps to a valid short-call opcode")
}

fn binary_opcode(op: BinaryOp) -> Opcode {
    match op {
        BinaryOp::Add => Opcode::Add,
        BinaryOp::Sub => Opcode::Sub,
        BinaryOp::Mul => Opcode::Mul,
        BinaryOp::Div => Opcode::Div,
        BinaryOp::Mod => Opcode::Mod,
        BinaryOp::Pow => Opcode::Pow,
        BinaryOp::Eq | BinaryOp::Ne => Opcode::Eq,
        BinaryOp::Lt => Opcode::Lt,
        BinaryOp::Le => Opcode::Le,
        BinaryOp::Gt => Opcode::Gt,
        BinaryOp::Ge => Opcode::Ge,
        BinaryOp::Is => Opcode::Is,
    }
}
