//! The stack-based bytecode interpreter: frames, the operand stack, upvalue
//! capture/closing, garbage-collection wiring, and the main fetch-dispatch
//! loop. Call dispatch, arithmetic/attribute opcodes, unwind handling, and
//! iteration protocol each live in their own sibling module; this one owns
//! the `Vm`/`Frame` types and the opcodes with no better home (constants,
//! locals, globals, collections, closures, classes, imports).
//!
//! `Vm` is a single concrete type, not generic over [`Tracer`] or
//! [`Limits`] — see `tracer.rs`'s module doc comment for why the native
//! function contract forces this.

mod call;
mod iterate;
mod ops;
mod unwind;

use ahash::AHashMap;
use smallvec::SmallVec;

use crate::builtins::Builtins;
use crate::compiler::Compiler;
use crate::compiler::opcode::Opcode;
use crate::diagnostics::DiagnosticSink;
use crate::exception::{ExcType, Handler, RunError, RunResult};
use crate::heap::Heap;
use crate::import::{ImportHost, SearchPaths};
use crate::intern::Interns;
use crate::limits::{HANDLER_MAX, Limits, NoLimits};
use crate::native::{Native, NativeExtension, NativeObj, NativeRegistryKind};
use crate::object::{ClosureObj, FunctionObj, ObjectData, ObjectId, ObjectKind, UpvalueState};
use crate::tracer::{NoopTracer, Tracer};
use crate::value::Value;

pub(crate) use call::Dispatch;

/// Outcome of executing a single bytecode instruction.
pub(crate) enum Step {
    /// Keep dispatching from wherever `ip`/`frames` now point.
    Continue,
    /// The outermost frame just returned; the VM's caller gets this value.
    Done(Value),
}

/// One call's activation record: which closure is running, where in its
/// code, the base stack slot its locals start at, and the exception-handler
/// table `SETUP_EXCEPT`/`SETUP_ENSURE` push onto.
struct Frame {
    closure: ObjectId,
    ip: usize,
    base: usize,
    handlers: SmallVec<[Handler; HANDLER_MAX]>,
    /// Set when this frame is running a class's `construct` method; its
    /// `RETURN` pushes the instance at `base` instead of the computed
    /// return value (mirrors `init()` always returning `this`).
    is_initializer: bool,
    /// Set when this frame belongs to a generator's body, for diagnostics
    /// and `YIELD` validation.
    generator: Option<ObjectId>,
}

/// The bytecode interpreter: one heap, one intern table, the bootstrapped
/// builtin classes, the call stack, and the operand stack, plus the
/// host-supplied policy objects (tracer, limits, import resolution).
pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) interns: Interns,
    pub builtins: Builtins,
    frames: Vec<Frame>,
    stack: Vec<Value>,
    open_upvalues: Vec<ObjectId>,
    modules: AHashMap<String, ObjectId>,
    /// Set by `IMPORT_FROM`, read by the `IMPORT_NAME`s that follow it in
    /// the same `from` statement. See `vm/mod.rs`'s import opcodes.
    pending_import: Option<ObjectId>,
    import_host: Option<Box<dyn ImportHost>>,
    search_paths: SearchPaths,
    tracer: Box<dyn Tracer>,
    limits: Box<dyn Limits>,
    /// Test/embedding-only sink for a `print`-style native to write to
    /// instead of real stdout, so host embeddings can capture output.
    pub stdout: String,
}

impl Vm {
    #[must_use]
    pub fn new(tracer: Box<dyn Tracer>, limits: Box<dyn Limits>) -> Self {
        let mut heap = Heap::new();
        let mut interns = Interns::new();
        let builtins = Builtins::bootstrap(&mut heap, &mut interns);
        Self {
            heap,
            interns,
            builtins,
            frames: Vec::new(),
            stack: Vec::new(),
            open_upvalues: Vec::new(),
            modules: AHashMap::new(),
            pending_import: None,
            import_host: None,
            search_paths: SearchPaths::default(),
            tracer,
            limits,
            stdout: String::new(),
        }
    }

    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(Box::new(NoopTracer), Box::new(NoLimits))
    }

    pub fn set_import_host(&mut self, host: Box<dyn ImportHost>) {
        self.import_host = Some(host);
    }

    pub fn search_paths_mut(&mut self) -> &mut SearchPaths {
        &mut self.search_paths
    }

    #[must_use]
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    // --- module creation ---

    /// Creates a fresh module, seeded with every builtin/exception class
    /// binding a script can reference without an explicit import — the role
    /// spec.md §6 gives "the bootstrapped core library".
    pub fn create_module(&mut self, name: &str, native: Option<NativeExtension>) -> ObjectId {
        let name_id = self.heap.intern_string(name.as_bytes(), Some(self.builtins.string_class));
        let module = self.heap.alloc_module(name_id, native, Some(self.builtins.module_class));
        self.seed_module_globals(module);
        module
    }

    fn seed_module_globals(&mut self, module: ObjectId) {
        let b = &self.builtins;
        let entries: [(&str, ObjectId); 17] = [
            ("print", b.print),
            ("List", b.list_class),
            ("Tuple", b.tuple_class),
            ("Table", b.table_class),
            ("Number", b.number_class),
            ("Boolean", b.boolean_class),
            ("String", b.string_class),
            ("Exception", b.exception_class(ExcType::Exception)),
            ("TypeException", b.exception_class(ExcType::TypeException)),
            ("NameException", b.exception_class(ExcType::NameException)),
            ("FieldException", b.exception_class(ExcType::FieldException)),
            ("MethodException", b.exception_class(ExcType::MethodException)),
            ("InvalidArgException", b.exception_class(ExcType::InvalidArgException)),
            ("IndexOutOfBoundException", b.exception_class(ExcType::IndexOutOfBoundException)),
            ("ImportException", b.exception_class(ExcType::ImportException)),
            ("StackOverflowException", b.exception_class(ExcType::StackOverflowException)),
            ("SyntaxException", b.exception_class(ExcType::SyntaxException)),
        ];
        for (name, class) in entries {
            let key = self.heap.intern_string(name.as_bytes(), Some(self.builtins.string_class));
            self.heap.module_set_global(module, Value::Object(key), Value::Object(class));
        }
    }

    /// Compiles `source` against a freshly created module and runs its
    /// top-level body to completion, returning the top-level function's
    /// final expression statement's value (ordinarily `null`).
    pub fn run_source(&mut self, name: &str, source: &str, sink: &mut impl DiagnosticSink) -> RunResult<Value> {
        let module = self.create_module(name, None);
        self.run_module_source(module, name, source, sink)
    }

    fn run_module_source(&mut self, module: ObjectId, file: &str, source: &str, sink: &mut impl DiagnosticSink) -> RunResult<Value> {
        let arena = crate::arena::Arena::new();
        let mut compiler = Compiler::new(&mut self.heap, &mut self.interns, module, file, sink);
        compiler.set_builtin_classes(self.builtins.function_class, self.builtins.closure_class, self.builtins.string_class);
        let Some(function_id) = compiler.compile(source, &arena) else {
            return Err(self.raise_exception(ExcType::SyntaxException, "compilation failed"));
        };
        self.run_function(function_id)
    }

    /// Wraps a compiled top-level `Function` (no parameters, no upvalues) in
    /// a `Closure` and runs it to completion.
    fn run_function(&mut self, function_id: ObjectId) -> RunResult<Value> {
        let closure = self.heap.alloc_closure(function_id, Vec::new(), Some(self.builtins.closure_class));
        self.push(Value::Null); // slot 0: unused callee/this for a plain function
        self.frames.push(Frame { closure, ip: 0, base: self.stack.len() - 1, handlers: SmallVec::new(), is_initializer: false, generator: None });
        self.run()
    }

    // --- module resolution ---

    pub(crate) fn resolve_native(&self, module: ObjectId, name: &str) -> Option<Native> {
        let ObjectData::Module(m) = &self.heap.get(module).data else { panic!("not a module") };
        let registry = m.native.as_ref()?;
        registry.registry.iter().find(|e| e.kind != NativeRegistryKind::Sentinel && e.name == name).and_then(|e| e.native)
    }

    fn import_module(&mut self, dotted: &str) -> RunResult<ObjectId> {
        if let Some(&id) = self.modules.get(dotted) {
            return Ok(id);
        }
        let Some(host) = self.import_host.as_mut() else {
            return Err(self.raise_exception(ExcType::ImportException, format!("no import host configured for '{dotted}'")));
        };
        let Some(source) = host.resolve(dotted) else {
            return Err(self.raise_exception(ExcType::ImportException, format!("module not found: {dotted}")));
        };
        let module = self.create_module(dotted, source.native_registry);
        self.modules.insert(dotted.to_string(), module);
        let code = String::from_utf8(source.code).map_err(|_| self.raise_exception(ExcType::ImportException, format!("module source is not valid UTF-8: {dotted}")))?;
        let mut sink = crate::diagnostics::CollectingSink::default();
        self.run_module_source(module, &source.path, &code, &mut sink)?;
        Ok(module)
    }

    // --- stack / frame primitives ---

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("operand stack underflow")
    }

    fn peek(&self, back: usize) -> Value {
        self.stack[self.stack.len() - 1 - back]
    }

    fn current_module(&self) -> ObjectId {
        let frame = self.frames.last().expect("no active frame");
        self.function_ref(self.closure_function(frame.closure)).module
    }

    fn closure_function(&self, closure_id: ObjectId) -> ObjectId {
        match &self.heap.get(closure_id).data {
            ObjectData::Closure(ClosureObj { function, .. }) => *function,
            _ => panic!("not a closure"),
        }
    }

    fn function_ref(&self, id: ObjectId) -> &FunctionObj {
        match &self.heap.get(id).data {
            ObjectData::Function(f) => f,
            _ => panic!("not a function"),
        }
    }

    fn current_constant(&self, idx: u16) -> Value {
        let frame = self.frames.last().expect("no active frame");
        let function_id = self.closure_function(frame.closure);
        self.function_ref(function_id).code.constants[idx as usize]
    }

    fn fetch_opcode(&mut self) -> Opcode {
        let byte = self.fetch_u8();
        Opcode::from_repr(byte).expect("corrupt bytecode: unknown opcode byte")
    }

    fn fetch_u8(&mut self) -> u8 {
        let idx = self.frames.len() - 1;
        let closure = self.frames[idx].closure;
        let function_id = self.closure_function(closure);
        let ip = self.frames[idx].ip;
        let byte = self.function_ref(function_id).code.read_u8(ip);
        self.frames[idx].ip += 1;
        byte
    }

    fn fetch_u16(&mut self) -> u16 {
        let idx = self.frames.len() - 1;
        let closure = self.frames[idx].closure;
        let function_id = self.closure_function(closure);
        let ip = self.frames[idx].ip;
        let word = self.function_ref(function_id).code.read_u16(ip);
        self.frames[idx].ip += 2;
        word
    }

    fn fetch_i16(&mut self) -> i16 {
        self.fetch_u16() as i16
    }

    fn current_line(&self) -> u32 {
        let frame = self.frames.last().expect("no active frame");
        let function_id = self.closure_function(frame.closure);
        self.function_ref(function_id).code.line_at(frame.ip.saturating_sub(1))
    }

    // --- upvalues ---

    fn capture_upvalue(&mut self, stack_index: usize) -> ObjectId {
        for &id in &self.open_upvalues {
            if let ObjectData::Upvalue(u) = &self.heap.get(id).data {
                if let UpvalueState::Open { stack_index: si } = u.state {
                    if si == stack_index {
                        return id;
                    }
                }
            }
        }
        let id = self.heap.alloc_open_upvalue(stack_index);
        self.open_upvalues.push(id);
        id
    }

    /// Closes every still-open upvalue aliasing a stack slot `>= floor`,
    /// copying its current value into its own storage. Called once per
    /// `CLOSE_UPVALUE` (with `floor` equal to the single slot being closed)
    /// and once per frame pop (with `floor` equal to the frame's base).
    fn close_upvalues_from(&mut self, floor: usize) {
        let mut i = 0;
        while i < self.open_upvalues.len() {
            let id = self.open_upvalues[i];
            let stack_index = match &self.heap.get(id).data {
                ObjectData::Upvalue(u) => match u.state {
                    UpvalueState::Open { stack_index } => Some(stack_index),
                    UpvalueState::Closed(_) => None,
                },
                _ => None,
            };
            match stack_index {
                Some(si) if si >= floor => {
                    let value = self.stack.get(si).copied().unwrap_or(Value::Null);
                    self.heap.close_upvalue(id, value);
                    self.open_upvalues.swap_remove(i);
                }
                _ => i += 1,
            }
        }
    }

    // --- exception construction ---

    pub(crate) fn make_exception(&mut self, kind: ExcType, message: impl Into<String>) -> Value {
        let class = self.builtins.exception_class(kind);
        let instance = self.heap.alloc_instance(class);
        let msg_id = self.heap.alloc_string(message.into().into_bytes(), Some(self.builtins.string_class));
        let key = Value::Object(self.builtins.dunders.message);
        self.heap.instance_set_field(instance, key, Value::Object(msg_id));
        Value::Object(instance)
    }

    pub(crate) fn raise_exception(&mut self, kind: ExcType, message: impl Into<String>) -> RunError {
        RunError::new(self.make_exception(kind, message))
    }

    /// Reads back the `StackTrace` `RAISE` attached to an unhandled
    /// exception instance, for a host to render after `run_source`/
    /// `run_call` returns `Err`. `None` if `value` isn't an instance or
    /// never went through `RAISE` (e.g. a host constructed it directly).
    #[must_use]
    pub fn exception_stacktrace(&self, value: Value) -> Option<&crate::object::StackTraceObj> {
        let Value::Object(id) = value else { return None };
        let field = self.heap.instance_get_field(id, Value::Object(self.builtins.dunders.stacktrace))?;
        let Value::Object(trace_id) = field else { return None };
        match &self.heap.get(trace_id).data {
            ObjectData::StackTrace(t) => Some(t),
            _ => None,
        }
    }

    /// Renders any value the way the runtime's implicit `String(x)`
    /// conversion and error messages do.
    pub fn display_value(&mut self, value: Value) -> String {
        match value {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::Handle(h) => format!("<handle {h:#x}>"),
            Value::Object(id) => self.display_object(id),
        }
    }

    fn display_object(&mut self, id: ObjectId) -> String {
        match self.heap.kind(id) {
            ObjectKind::String => self.heap.string_str(id).to_string(),
            ObjectKind::List => {
                let items = match &self.heap.get(id).data {
                    ObjectData::List(l) => l.items.clone(),
                    _ => unreachable!(),
                };
                let parts: Vec<_> = items.into_iter().map(|v| self.display_value(v)).collect();
                format!("[{}]", parts.join(", "))
            }
            ObjectKind::Tuple => {
                let items = match &self.heap.get(id).data {
                    ObjectData::Tuple(t) => t.items.to_vec(),
                    _ => unreachable!(),
                };
                let parts: Vec<_> = items.into_iter().map(|v| self.display_value(v)).collect();
                format!("({})", parts.join(", "))
            }
            ObjectKind::Class => {
                let name = self.heap.class_name(id);
                format!("<class {}>", self.heap.string_str(name))
            }
            ObjectKind::Instance => {
                let class = self.heap.get(id).header.class.expect("instance always has a class");
                let name = self.heap.class_name(class);
                format!("<{} instance>", self.heap.string_str(name))
            }
            ObjectKind::Function | ObjectKind::Closure => "<function>".to_string(),
            ObjectKind::Native => "<native function>".to_string(),
            ObjectKind::Module => {
                let name = match &self.heap.get(id).data {
                    ObjectData::Module(m) => m.name,
                    _ => unreachable!(),
                };
                format!("<module {}>", self.heap.string_str(name))
            }
            _ => "<object>".to_string(),
        }
    }

    // --- GC wiring ---

    fn gc_roots(&self) -> (Vec<Value>, Vec<ObjectId>) {
        let mut roots = self.stack.clone();
        if let Some(id) = self.pending_import {
            roots.push(Value::Object(id));
        }
        let mut extra: Vec<ObjectId> = Vec::new();
        for frame in &self.frames {
            extra.push(frame.closure);
            if let Some(g) = frame.generator {
                extra.push(g);
            }
        }
        extra.extend(self.open_upvalues.iter().copied());
        extra.extend(self.modules.values().copied());
        let b = &self.builtins;
        extra.extend([
            b.class_class,
            b.module_class,
            b.function_class,
            b.native_class,
            b.closure_class,
            b.upvalue_class,
            b.bound_method_class,
            b.list_class,
            b.tuple_class,
            b.table_class,
            b.stack_trace_class,
            b.userdata_class,
            b.generator_class,
            b.string_class,
            b.number_class,
            b.boolean_class,
            b.null_class,
            b.print,
        ]);
        extra.extend(b.exceptions.iter().copied());
        let d = &b.dunders;
        extra.extend([
            d.construct, d.iter, d.next, d.close, d.add, d.radd, d.sub, d.rsub, d.mul, d.rmul, d.div, d.rdiv,
            d.modulo, d.rmod, d.pow, d.rpow, d.eq, d.lt, d.le, d.gt, d.ge, d.get, d.set, d.message, d.args,
            d.stacktrace,
        ]);
        (roots, extra)
    }

    fn maybe_collect(&mut self) {
        if !self.heap.should_collect() {
            return;
        }
        self.tracer.on_gc_start(self.heap.allocated());
        let (roots, extra) = self.gc_roots();
        let rate = self.limits.heap_grow_rate();
        self.heap.collect(roots, extra, rate);
        self.tracer.on_gc_end(self.heap.allocated(), self.heap.next_gc());
    }

    // --- main loop ---

    fn run(&mut self) -> RunResult<Value> {
        loop {
            self.maybe_collect();
            let ip = self.frames.last().expect("no active frame").ip;
            let opcode = self.fetch_opcode();
            self.tracer.on_instruction(ip, opcode, self.stack.len(), self.frames.len());
            match self.step(opcode) {
                Ok(Step::Continue) => {}
                Ok(Step::Done(value)) => return Ok(value),
                Err(e) => self.unwind_except(e.value, 0)?,
            }
        }
    }

    fn step(&mut self, opcode: Opcode) -> RunResult<Step> {
        match opcode {
            Opcode::GetConst => {
                let idx = self.fetch_u16();
                self.push(self.current_constant(idx));
                Ok(Step::Continue)
            }
            Opcode::Null => {
                self.push(Value::Null);
                Ok(Step::Continue)
            }
            Opcode::GetLocal => {
                let slot = self.fetch_u8() as usize;
                let base = self.frames.last().unwrap().base;
                self.push(self.stack[base + slot]);
                Ok(Step::Continue)
            }
            Opcode::SetLocal => {
                let slot = self.fetch_u8() as usize;
                let base = self.frames.last().unwrap().base;
                self.stack[base + slot] = self.peek(0);
                Ok(Step::Continue)
            }
            Opcode::GetUpvalue => {
                let idx = self.fetch_u8() as usize;
                let closure = self.frames.last().unwrap().closure;
                let up = match &self.heap.get(closure).data {
                    ObjectData::Closure(c) => c.upvalues[idx],
                    _ => panic!("not a closure"),
                };
                let value = match &self.heap.get(up).data {
                    ObjectData::Upvalue(u) => match u.state {
                        UpvalueState::Open { stack_index } => self.stack[stack_index],
                        UpvalueState::Closed(v) => v,
                    },
                    _ => panic!("not an upvalue"),
                };
                self.push(value);
                Ok(Step::Continue)
            }
            Opcode::SetUpvalue => {
                let idx = self.fetch_u8() as usize;
                let closure = self.frames.last().unwrap().closure;
                let up = match &self.heap.get(closure).data {
                    ObjectData::Closure(c) => c.upvalues[idx],
                    _ => panic!("not a closure"),
                };
                let value = self.peek(0);
                let stack_index = match &self.heap.get(up).data {
                    ObjectData::Upvalue(u) => match u.state {
                        UpvalueState::Open { stack_index } => Some(stack_index),
                        UpvalueState::Closed(_) => None,
                    },
                    _ => panic!("not an upvalue"),
                };
                match stack_index {
                    Some(si) => self.stack[si] = value,
                    None => self.heap.close_upvalue(up, value),
                }
                Ok(Step::Continue)
            }
            Opcode::GetGlobal => {
                let idx = self.fetch_u16();
                let name = self.current_constant(idx);
                let module = self.current_module();
                match self.heap.module_get_global(module, name) {
                    Some(v) => {
                        self.push(v);
                        Ok(Step::Continue)
                    }
                    None => Err(self.name_error(name)),
                }
            }
            Opcode::SetGlobal => {
                let idx = self.fetch_u16();
                let name = self.current_constant(idx);
                let module = self.current_module();
                if self.heap.module_get_global(module, name).is_none() {
                    return Err(self.name_error(name));
                }
                self.heap.module_set_global(module, name, self.peek(0));
                Ok(Step::Continue)
            }
            Opcode::DefineGlobal => {
                let idx = self.fetch_u16();
                let name = self.current_constant(idx);
                let module = self.current_module();
                let value = self.pop();
                self.heap.module_set_global(module, name, value);
                Ok(Step::Continue)
            }
            Opcode::CloseUpvalue => {
                let stack_index = self.stack.len() - 1;
                self.close_upvalues_from(stack_index);
                self.pop();
                Ok(Step::Continue)
            }
            Opcode::Pop => {
                self.pop();
                Ok(Step::Continue)
            }
            Opcode::Dup => {
                self.push(self.peek(0));
                Ok(Step::Continue)
            }
            Opcode::NewList => {
                let count = self.fetch_u16() as usize;
                let start = self.stack.len() - count;
                let items = self.stack.split_off(start);
                let id = self.heap.alloc_list(items, Some(self.builtins.list_class));
                self.push(Value::Object(id));
                Ok(Step::Continue)
            }
            Opcode::AppendList => {
                let value = self.pop();
                let list_value = self.peek(0);
                let Value::Object(list_id) = list_value else { panic!("APPEND_LIST target must be a list") };
                if let ObjectData::List(l) = &mut self.heap.get_mut(list_id).data {
                    l.items.push(value);
                }
                Ok(Step::Continue)
            }
            Opcode::NewTuple => {
                let count = self.fetch_u16() as usize;
                let start = self.stack.len() - count;
                let items = self.stack.split_off(start);
                let id = self.heap.alloc_tuple(items, Some(self.builtins.tuple_class));
                self.push(Value::Object(id));
                Ok(Step::Continue)
            }
            Opcode::NewTable => {
                let count = self.fetch_u16() as usize;
                let start = self.stack.len() - count * 2;
                let pairs = self.stack.split_off(start);
                let mut table = crate::table::Table::new();
                for pair in pairs.chunks_exact(2) {
                    table.set(&self.heap, pair[0], pair[1]);
                }
                let id = self.heap.alloc_table(table, Some(self.builtins.table_class));
                self.push(Value::Object(id));
                Ok(Step::Continue)
            }
            Opcode::Jump => {
                let offset = self.fetch_i16();
                self.jump(offset);
                Ok(Step::Continue)
            }
            Opcode::Jumpt => {
                let offset = self.fetch_i16();
                if self.peek(0).is_truthy() {
                    self.jump(offset);
                }
                Ok(Step::Continue)
            }
            Opcode::Jumpf => {
                let offset = self.fetch_i16();
                if !self.peek(0).is_truthy() {
                    self.jump(offset);
                }
                Ok(Step::Continue)
            }
            Opcode::SignBrk | Opcode::SignCont => {
                panic!("unpatched {opcode:?} reached the VM: the loop closer never rewrote it to JUMP")
            }
            Opcode::Closure => self.op_closure(),
            Opcode::NewClass => self.op_new_class(),
            Opcode::NewSubclass => self.op_new_subclass(),
            Opcode::DefMethod => self.op_def_method(),
            Opcode::NatMethod => self.op_nat_method(),
            Opcode::Native => self.op_native(),
            Opcode::Import => self.op_import(),
            Opcode::ImportFrom => self.op_import_from(),
            Opcode::ImportAs => self.op_import_as(),
            Opcode::ImportName => self.op_import_name(),
            Opcode::Unpack => self.op_unpack(),

            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::Pow
            | Opcode::Neg
            | Opcode::Not
            | Opcode::Eq
            | Opcode::Lt
            | Opcode::Le
            | Opcode::Gt
            | Opcode::Ge
            | Opcode::Is => self.op_binary_or_unary(opcode),

            Opcode::GetField => self.op_get_field(),
            Opcode::SetField => self.op_set_field(),
            Opcode::SubscrGet => self.op_subscr_get(),
            Opcode::SubscrSet => self.op_subscr_set(),

            Opcode::Call
            | Opcode::Call0
            | Opcode::Call1
            | Opcode::Call2
            | Opcode::Call3
            | Opcode::Call4
            | Opcode::Call5
            | Opcode::Call6
            | Opcode::Call7
            | Opcode::Call8
            | Opcode::Call9
            | Opcode::Call10 => self.op_call(opcode),
            Opcode::Invoke
            | Opcode::Invoke0
            | Opcode::Invoke1
            | Opcode::Invoke2
            | Opcode::Invoke3
            | Opcode::Invoke4
            | Opcode::Invoke5
            | Opcode::Invoke6
            | Opcode::Invoke7
            | Opcode::Invoke8
            | Opcode::Invoke9
            | Opcode::Invoke10 => self.op_invoke(opcode),
            Opcode::Super
            | Opcode::Super0
            | Opcode::Super1
            | Opcode::Super2
            | Opcode::Super3
            | Opcode::Super4
            | Opcode::Super5
            | Opcode::Super6
            | Opcode::Super7
            | Opcode::Super8
            | Opcode::Super9
            | Opcode::Super10 => self.op_super(opcode),
            Opcode::SuperBind => self.op_super_bind(),

            Opcode::Yield => self.op_yield(),
            Opcode::ForIter => self.op_for_iter(),
            Opcode::ForNext => self.op_for_next(),

            Opcode::SetupExcept => self.op_setup_except(),
            Opcode::SetupEnsure => self.op_setup_ensure(),
            Opcode::PopHandler => self.op_pop_handler(),
            Opcode::EndTry => Ok(Step::Continue),
            Opcode::Raise => self.op_raise(),
            Opcode::Return => self.op_return(),
        }
    }

    /// Applies a relative jump offset decoded per `Code`'s convention:
    /// relative to the byte immediately after the 16-bit operand just read.
    fn jump(&mut self, offset: i16) {
        let frame = self.frames.last_mut().expect("no active frame");
        frame.ip = (frame.ip as i64 + i64::from(offset)) as usize;
    }

    fn name_error(&mut self, name: Value) -> RunError {
        let shown = match name {
            Value::Object(id) if self.heap.kind(id) == ObjectKind::String => self.heap.string_str(id).to_string(),
            _ => "<name>".to_string(),
        };
        self.raise_exception(ExcType::NameException, format!("undefined name '{shown}'"))
    }

    fn op_closure(&mut self) -> RunResult<Step> {
        let const_idx = self.fetch_u16();
        let function_value = self.current_constant(const_idx);
        let Value::Object(function_id) = function_value else { panic!("CLOSURE constant must be a function") };
        let upvalue_count = self.function_ref(function_id).upvalue_count;
        let mut upvalues = Vec::with_capacity(upvalue_count as usize);
        for _ in 0..upvalue_count {
            let is_local = self.fetch_u8();
            let index = self.fetch_u8();
            let up = if is_local != 0 {
                let base = self.frames.last().unwrap().base;
                self.capture_upvalue(base + index as usize)
            } else {
                let enclosing = self.frames.last().unwrap().closure;
                match &self.heap.get(enclosing).data {
                    ObjectData::Closure(c) => c.upvalues[index as usize],
                    _ => panic!("not a closure"),
                }
            };
            upvalues.push(up);
        }
        let closure = self.heap.alloc_closure(function_id, upvalues, Some(self.builtins.closure_class));
        self.push(Value::Object(closure));
        Ok(Step::Continue)
    }

    fn op_new_class(&mut self) -> RunResult<Step> {
        let name_idx = self.fetch_u16();
        let Value::Object(name_id) = self.current_constant(name_idx) else { panic!("class name constant must be a string") };
        let class = self.heap.alloc_class(name_id, None, Some(self.builtins.class_class));
        self.push(Value::Object(class));
        Ok(Step::Continue)
    }

    fn op_new_subclass(&mut self) -> RunResult<Step> {
        let name_idx = self.fetch_u16();
        let Value::Object(name_id) = self.current_constant(name_idx) else { panic!("class name constant must be a string") };
        let super_value = self.pop();
        let Value::Object(super_id) = super_value else {
            return Err(self.raise_exception(ExcType::TypeException, "superclass expression did not evaluate to a class"));
        };
        if self.heap.kind(super_id) != ObjectKind::Class {
            return Err(self.raise_exception(ExcType::TypeException, "superclass expression did not evaluate to a class"));
        }
        let class = self.heap.alloc_class(name_id, Some(super_id), Some(self.builtins.class_class));
        self.heap.class_inherit_methods(class, super_id);
        self.push(Value::Object(class));
        Ok(Step::Continue)
    }

    fn op_def_method(&mut self) -> RunResult<Step> {
        let name_idx = self.fetch_u16();
        let name_value = self.current_constant(name_idx);
        let closure_value = self.pop();
        let Value::Object(closure_id) = closure_value else { panic!("DEF_METHOD expects a closure on the stack") };
        let Value::Object(class_id) = self.peek(0) else { panic!("DEF_METHOD expects a class below the closure") };
        let function_id = self.closure_function(closure_id);
        if let ObjectData::Function(f) = &mut self.heap.get_mut(function_id).data {
            f.owner_class = Some(class_id);
        }
        self.heap.class_set_method(class_id, name_value, Value::Object(closure_id));
        Ok(Step::Continue)
    }

    fn op_nat_method(&mut self) -> RunResult<Step> {
        let name_idx = self.fetch_u16();
        let _same_name_idx = self.fetch_u16();
        let name_value = self.current_constant(name_idx);
        let Value::Object(name_id) = name_value else { panic!("method name constant must be a string") };
        let name = self.heap.string_str(name_id).to_string();
        let module = self.current_module();
        let native = self
            .resolve_native(module, &name)
            .ok_or_else(|| self.raise_exception(ExcType::MethodException, format!("no native method registered: {name}")))?;
        let native_id = self.heap.alloc_native(NativeObj { name: None, native }, Some(self.builtins.native_class));
        let Value::Object(class_id) = self.peek(0) else { panic!("NAT_METHOD expects a class on the stack") };
        self.heap.class_set_method(class_id, name_value, Value::Object(native_id));
        Ok(Step::Continue)
    }

    fn op_native(&mut self) -> RunResult<Step> {
        let name_idx = self.fetch_u16();
        let name_value = self.current_constant(name_idx);
        let Value::Object(name_id) = name_value else { panic!("NATIVE name constant must be a string") };
        let name = self.heap.string_str(name_id).to_string();
        let module = self.current_module();
        let native = self
            .resolve_native(module, &name)
            .ok_or_else(|| self.raise_exception(ExcType::ImportException, format!("no native function registered: {name}")))?;
        let native_id = self.heap.alloc_native(NativeObj { name: None, native }, Some(self.builtins.native_class));
        self.heap.module_set_global(module, name_value, Value::Object(native_id));
        Ok(Step::Continue)
    }

    fn op_import(&mut self) -> RunResult<Step> {
        let name_idx = self.fetch_u16();
        let Value::Object(name_id) = self.current_constant(name_idx) else { panic!("IMPORT name constant must be a string") };
        let dotted = self.heap.string_str(name_id).to_string();
        let module = self.import_module(&dotted)?;
        self.push(Value::Object(module));
        Ok(Step::Continue)
    }

    fn op_import_as(&mut self) -> RunResult<Step> {
        let dotted_idx = self.fetch_u16();
        let _alias_idx = self.fetch_u16();
        let Value::Object(name_id) = self.current_constant(dotted_idx) else { panic!("IMPORT_AS name constant must be a string") };
        let dotted = self.heap.string_str(name_id).to_string();
        let module = self.import_module(&dotted)?;
        self.push(Value::Object(module));
        Ok(Step::Continue)
    }

    fn op_import_from(&mut self) -> RunResult<Step> {
        let name_idx = self.fetch_u16();
        let Value::Object(name_id) = self.current_constant(name_idx) else { panic!("IMPORT_FROM name constant must be a string") };
        let dotted = self.heap.string_str(name_id).to_string();
        let module = self.import_module(&dotted)?;
        self.pending_import = Some(module);
        Ok(Step::Continue)
    }

    fn op_import_name(&mut self) -> RunResult<Step> {
        let module_name_idx = self.fetch_u16();
        let binding_idx = self.fetch_u16();
        let _ = module_name_idx;
        let name_value = self.current_constant(binding_idx);
        let module = self.pending_import.expect("IMPORT_NAME without a preceding IMPORT_FROM");
        let value = self
            .heap
            .module_get_global(module, name_value)
            .ok_or_else(|| self.name_error(name_value))?;
        self.push(value);
        Ok(Step::Continue)
    }

    fn op_unpack(&mut self) -> RunResult<Step> {
        let count = self.fetch_u8() as usize;
        let value = self.pop();
        let items: Vec<Value> = match value {
            Value::Object(id) => match &self.heap.get(id).data {
                ObjectData::List(l) => l.items.clone(),
                ObjectData::Tuple(t) => t.items.to_vec(),
                _ => return Err(self.raise_exception(ExcType::TypeException, "value is not iterable for unpacking")),
            },
            _ => return Err(self.raise_exception(ExcType::TypeException, "value is not iterable for unpacking")),
        };
        if items.len() != count {
            return Err(self.raise_exception(
                ExcType::TypeException,
                format!("unpack expected {count} values, found {}", items.len()),
            ));
        }
        for item in items {
            self.push(item);
        }
        Ok(Step::Continue)
    }
}
