//! The GC arena: allocation, tricolor-style mark with an explicit gray
//! stack, sweep of the intrusive object list, and the heap-growth policy.

use ahash::AHashMap;

use crate::intern::fnv1a;
use crate::native::NativeExtension;
use crate::object::{
    BoundMethodObj, ClassObj, ClosureObj, FunctionObj, GeneratorObj, InstanceObj, ListObj, ModuleObj, NativeObj,
    Object, ObjectData, ObjectHeader, ObjectId, ObjectKind, StackTraceObj, StringObj, TupleObj, UpvalueObj,
    UpvalueState, UserdataObj,
};
use crate::table::{KeyOps, Table};
use crate::value::Value;

fn approx_size(data: &ObjectData) -> usize {
    let base = std::mem::size_of::<Object>();
    base + match data {
        ObjectData::String(s) => s.bytes.len(),
        ObjectData::List(l) => l.items.len() * std::mem::size_of::<Value>(),
        ObjectData::Tuple(t) => t.items.len() * std::mem::size_of::<Value>(),
        ObjectData::Table(t) => t.len() * std::mem::size_of::<(Value, Value)>() * 2,
        ObjectData::Userdata(u) => u.bytes.len(),
        ObjectData::Function(f) => f.code.bytes.len() + f.code.constants.len() * std::mem::size_of::<Value>(),
        ObjectData::Closure(c) => c.upvalues.len() * std::mem::size_of::<ObjectId>(),
        ObjectData::Generator(g) => g.saved_stack.len() * std::mem::size_of::<Value>(),
        _ => 0,
    }
}

struct Slot {
    object: Object,
    size: usize,
}

/// The GC arena owning every heap-allocated object for one VM instance.
pub struct Heap {
    slots: Vec<Option<Slot>>,
    free: Vec<u32>,
    head: Option<ObjectId>,
    allocated: usize,
    next_gc: usize,
    /// Weak table: interned strings, keyed by content. Purged of entries
    /// whose object did not survive the last sweep.
    interned: AHashMap<Box<[u8]>, ObjectId>,
    empty_tuple: Option<ObjectId>,
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

impl Heap {
    const INITIAL_NEXT_GC: usize = 1 << 20;

    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            allocated: 0,
            next_gc: Self::INITIAL_NEXT_GC,
            interned: AHashMap::new(),
            empty_tuple: None,
        }
    }

    #[must_use]
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    #[must_use]
    pub fn next_gc(&self) -> usize {
        self.next_gc
    }

    #[must_use]
    pub fn should_collect(&self) -> bool {
        self.allocated > self.next_gc
    }

    #[must_use]
    pub fn get(&self, id: ObjectId) -> &Object {
        &self.slots[id.index()].as_ref().expect("dangling ObjectId").object
    }

    pub fn get_mut(&mut self, id: ObjectId) -> &mut Object {
        &mut self.slots[id.index()].as_mut().expect("dangling ObjectId").object
    }

    #[must_use]
    pub fn kind(&self, id: ObjectId) -> ObjectKind {
        self.get(id).header.kind
    }

    /// Back-patches an object's class, for the handful of core-bootstrap
    /// allocations (the builtin classes themselves, and values interned
    /// before their own class exists) made with `class: None` and fixed up
    /// once the class is available.
    pub fn set_class(&mut self, id: ObjectId, class: ObjectId) {
        self.get_mut(id).header.class = Some(class);
    }

    fn insert(&mut self, class: Option<ObjectId>, data: ObjectData) -> ObjectId {
        let size = approx_size(&data);
        self.allocated += size;
        let header = ObjectHeader { kind: data.kind(), marked: false, class, next: self.head };
        let slot = Slot { object: Object { header, data }, size };
        let id = if let Some(index) = self.free.pop() {
            self.slots[index as usize] = Some(slot);
            ObjectId(index)
        } else {
            self.slots.push(Some(slot));
            ObjectId(u32::try_from(self.slots.len() - 1).expect("heap slot overflow"))
        };
        self.head = Some(id);
        id
    }

    // --- allocation helpers ---

    /// Interns `bytes`: returns the existing `String` object if an equal
    /// byte sequence is already interned, else allocates a new one.
    pub fn intern_string(&mut self, bytes: &[u8], string_class: Option<ObjectId>) -> ObjectId {
        if let Some(&id) = self.interned.get(bytes) {
            return id;
        }
        let hash = fnv1a(bytes);
        let id = self.insert(string_class, ObjectData::String(StringObj { bytes: bytes.into(), hash, interned: true }));
        self.interned.insert(bytes.into(), id);
        id
    }

    pub fn alloc_string(&mut self, bytes: Vec<u8>, string_class: Option<ObjectId>) -> ObjectId {
        let hash = fnv1a(&bytes);
        self.insert(string_class, ObjectData::String(StringObj { bytes: bytes.into_boxed_slice(), hash, interned: false }))
    }

    pub fn alloc_class(&mut self, name: ObjectId, superclass: Option<ObjectId>, class_class: Option<ObjectId>) -> ObjectId {
        self.insert(class_class, ObjectData::Class(ClassObj { name, superclass, methods: Table::new() }))
    }

    pub fn alloc_instance(&mut self, class: ObjectId) -> ObjectId {
        self.insert(Some(class), ObjectData::Instance(InstanceObj::default()))
    }

    pub fn alloc_module(&mut self, name: ObjectId, native: Option<NativeExtension>, module_class: Option<ObjectId>) -> ObjectId {
        self.insert(module_class, ObjectData::Module(ModuleObj { name, globals: Table::new(), native }))
    }

    pub fn alloc_function(&mut self, function: FunctionObj, function_class: Option<ObjectId>) -> ObjectId {
        self.insert(function_class, ObjectData::Function(function))
    }

    pub fn alloc_native(&mut self, native: NativeObj, native_class: Option<ObjectId>) -> ObjectId {
        self.insert(native_class, ObjectData::Native(native))
    }

    pub fn alloc_closure(&mut self, function: ObjectId, upvalues: Vec<ObjectId>, closure_class: Option<ObjectId>) -> ObjectId {
        self.insert(closure_class, ObjectData::Closure(ClosureObj { function, upvalues }))
    }

    pub fn alloc_open_upvalue(&mut self, stack_index: usize) -> ObjectId {
        self.insert(None, ObjectData::Upvalue(UpvalueObj { state: UpvalueState::Open { stack_index } }))
    }

    pub fn alloc_bound_method(&mut self, receiver: Value, method: Value, bound_method_class: Option<ObjectId>) -> ObjectId {
        self.insert(bound_method_class, ObjectData::BoundMethod(BoundMethodObj { receiver, method }))
    }

    pub fn alloc_list(&mut self, items: Vec<Value>, list_class: Option<ObjectId>) -> ObjectId {
        self.insert(list_class, ObjectData::List(ListObj { items }))
    }

    pub fn alloc_tuple(&mut self, items: Vec<Value>, tuple_class: Option<ObjectId>) -> ObjectId {
        if items.is_empty() {
            if let Some(id) = self.empty_tuple {
                return id;
            }
            let id = self.insert(tuple_class, ObjectData::Tuple(TupleObj { items: Box::new([]) }));
            self.empty_tuple = Some(id);
            return id;
        }
        self.insert(tuple_class, ObjectData::Tuple(TupleObj { items: items.into_boxed_slice() }))
    }

    pub fn alloc_table(&mut self, table: Table, table_class: Option<ObjectId>) -> ObjectId {
        self.insert(table_class, ObjectData::Table(table))
    }

    pub fn alloc_stack_trace(&mut self, frames: Vec<crate::object::FrameRecord>, stack_trace_class: Option<ObjectId>) -> ObjectId {
        self.insert(stack_trace_class, ObjectData::StackTrace(StackTraceObj { frames }))
    }

    pub fn alloc_userdata(&mut self, userdata: UserdataObj, userdata_class: Option<ObjectId>) -> ObjectId {
        self.insert(userdata_class, ObjectData::Userdata(userdata))
    }

    pub fn alloc_generator(&mut self, closure: ObjectId, generator_class: Option<ObjectId>) -> ObjectId {
        self.insert(generator_class, ObjectData::Generator(GeneratorObj { closure: Some(closure), ..GeneratorObj::default() }))
    }

    /// Closes an open upvalue by copying `value` into its own storage.
    pub fn close_upvalue(&mut self, id: ObjectId, value: Value) {
        if let ObjectData::Upvalue(up) = &mut self.get_mut(id).data {
            up.state = UpvalueState::Closed(value);
        }
    }

    // --- table-on-object helpers ---
    //
    // A class's method table, an instance's field table, and a module's
    // globals table are all plain `Table`s living behind a heap object
    // mutable borrow, so probing them needs `&Heap` as `KeyOps` at the same
    // time the table itself is reachable only through `&mut Heap`. These
    // helpers do the "take the table out, probe/mutate with the heap as
    // `KeyOps`, put it back" dance once instead of at every call site.

    #[must_use]
    pub fn class_name(&self, class_id: ObjectId) -> ObjectId {
        match &self.get(class_id).data {
            ObjectData::Class(c) => c.name,
            _ => panic!("not a class"),
        }
    }

    #[must_use]
    pub fn class_superclass(&self, class_id: ObjectId) -> Option<ObjectId> {
        match &self.get(class_id).data {
            ObjectData::Class(c) => c.superclass,
            _ => panic!("not a class"),
        }
    }

    #[must_use]
    pub fn class_get_method(&self, class_id: ObjectId, key: Value) -> Option<Value> {
        match &self.get(class_id).data {
            ObjectData::Class(c) => c.methods.get(self, key),
            _ => panic!("not a class"),
        }
    }

    pub fn class_set_method(&mut self, class_id: ObjectId, key: Value, value: Value) {
        let mut methods = match &mut self.get_mut(class_id).data {
            ObjectData::Class(c) => std::mem::take(&mut c.methods),
            _ => panic!("not a class"),
        };
        methods.set(self, key, value);
        if let ObjectData::Class(c) = &mut self.get_mut(class_id).data {
            c.methods = methods;
        }
    }

    /// Shallow-copies `superclass`'s method table onto `class_id`'s, per the
    /// data model's subclass-creation rule.
    pub fn class_inherit_methods(&mut self, class_id: ObjectId, superclass: ObjectId) {
        let inherited = match &self.get(superclass).data {
            ObjectData::Class(c) => c.methods.iter().collect::<Vec<_>>(),
            _ => panic!("not a class"),
        };
        for (k, v) in inherited {
            self.class_set_method(class_id, k, v);
        }
    }

    #[must_use]
    pub fn instance_get_field(&self, instance_id: ObjectId, key: Value) -> Option<Value> {
        match &self.get(instance_id).data {
            ObjectData::Instance(i) => i.fields.get(self, key),
            _ => panic!("not an instance"),
        }
    }

    pub fn instance_set_field(&mut self, instance_id: ObjectId, key: Value, value: Value) {
        let mut fields = match &mut self.get_mut(instance_id).data {
            ObjectData::Instance(i) => std::mem::take(&mut i.fields),
            _ => panic!("not an instance"),
        };
        fields.set(self, key, value);
        if let ObjectData::Instance(i) = &mut self.get_mut(instance_id).data {
            i.fields = fields;
        }
    }

    #[must_use]
    pub fn module_get_global(&self, module_id: ObjectId, key: Value) -> Option<Value> {
        match &self.get(module_id).data {
            ObjectData::Module(m) => m.globals.get(self, key),
            _ => panic!("not a module"),
        }
    }

    /// Returns `true` if `key` was not already bound.
    pub fn module_set_global(&mut self, module_id: ObjectId, key: Value, value: Value) -> bool {
        let mut globals = match &mut self.get_mut(module_id).data {
            ObjectData::Module(m) => std::mem::take(&mut m.globals),
            _ => panic!("not a module"),
        };
        let is_new = globals.set(self, key, value);
        if let ObjectData::Module(m) = &mut self.get_mut(module_id).data {
            m.globals = globals;
        }
        is_new
    }

    #[must_use]
    pub fn table_get(&self, table_id: ObjectId, key: Value) -> Option<Value> {
        match &self.get(table_id).data {
            ObjectData::Table(t) => t.get(self, key),
            _ => panic!("not a table"),
        }
    }

    pub fn table_set(&mut self, table_id: ObjectId, key: Value, value: Value) {
        let mut table = match &mut self.get_mut(table_id).data {
            ObjectData::Table(t) => std::mem::take(t),
            _ => panic!("not a table"),
        };
        table.set(self, key, value);
        if let ObjectData::Table(t) = &mut self.get_mut(table_id).data {
            *t = table;
        }
    }

    /// Byte-for-byte content of a `String` object, regardless of interned
    /// status — used by error messages, `is` semantics, and field-name
    /// comparisons against string constants.
    #[must_use]
    pub fn string_bytes(&self, id: ObjectId) -> &[u8] {
        match &self.get(id).data {
            ObjectData::String(s) => &s.bytes,
            _ => panic!("not a string"),
        }
    }

    #[must_use]
    pub fn string_str(&self, id: ObjectId) -> &str {
        std::str::from_utf8(self.string_bytes(id)).unwrap_or("<invalid utf-8>")
    }

    // --- mark / sweep ---

    fn mark_object(&mut self, id: ObjectId, gray: &mut Vec<ObjectId>) {
        let already_marked = self.get(id).header.marked;
        if already_marked {
            return;
        }
        self.get_mut(id).header.marked = true;
        gray.push(id);
    }

    /// Marks `value` if it is a heap reference, pushing it onto the gray
    /// stack for later blackening.
    pub fn mark_value(&mut self, value: Value, gray: &mut Vec<ObjectId>) {
        if let Value::Object(id) = value {
            self.mark_object(id, gray);
        }
    }

    /// Traces `id`'s type-specific fields, marking everything it reaches.
    fn blacken(&mut self, id: ObjectId, gray: &mut Vec<ObjectId>) {
        if let Some(class) = self.get(id).header.class {
            self.mark_object(class, gray);
        }
        // Field enumeration is done per-variant without holding a borrow of
        // `self` across the recursive mark calls, since marking mutates
        // `self.slots`.
        match &self.get(id).data {
            ObjectData::String(_) | ObjectData::Native(_) | ObjectData::Userdata(_) | ObjectData::StackTrace(_) => {}
            ObjectData::Class(class) => {
                let (name, superclass) = (class.name, class.superclass);
                let entries: Vec<_> = class.methods.iter().collect();
                self.mark_object(name, gray);
                if let Some(sup) = superclass {
                    self.mark_object(sup, gray);
                }
                for (k, v) in entries {
                    self.mark_value(k, gray);
                    self.mark_value(v, gray);
                }
            }
            ObjectData::Instance(instance) => {
                let entries: Vec<_> = instance.fields.iter().collect();
                for (k, v) in entries {
                    self.mark_value(k, gray);
                    self.mark_value(v, gray);
                }
            }
            ObjectData::Module(module) => {
                let name = module.name;
                let entries: Vec<_> = module.globals.iter().collect();
                self.mark_object(name, gray);
                for (k, v) in entries {
                    self.mark_value(k, gray);
                    self.mark_value(v, gray);
                }
            }
            ObjectData::Function(function) => {
                let module = function.module;
                let constants: Vec<_> = function.code.constants.clone();
                self.mark_object(module, gray);
                for c in constants {
                    self.mark_value(c, gray);
                }
            }
            ObjectData::Closure(closure) => {
                let function = closure.function;
                let upvalues = closure.upvalues.clone();
                self.mark_object(function, gray);
                for up in upvalues {
                    self.mark_object(up, gray);
                }
            }
            ObjectData::Upvalue(upvalue) => {
                if let UpvalueState::Closed(v) = upvalue.state {
                    self.mark_value(v, gray);
                }
            }
            ObjectData::BoundMethod(bound) => {
                let (receiver, method) = (bound.receiver, bound.method);
                self.mark_value(receiver, gray);
                self.mark_value(method, gray);
            }
            ObjectData::List(list) => {
                let items = list.items.clone();
                for v in items {
                    self.mark_value(v, gray);
                }
            }
            ObjectData::Tuple(tuple) => {
                let items = tuple.items.clone();
                for v in items {
                    self.mark_value(v, gray);
                }
            }
            ObjectData::Table(table) => {
                let entries: Vec<_> = table.iter().collect();
                for (k, v) in entries {
                    self.mark_value(k, gray);
                    self.mark_value(v, gray);
                }
            }
            ObjectData::Generator(generator) => {
                let closure = generator.closure;
                let saved = generator.saved_stack.clone();
                let last_value = generator.last_value;
                if let Some(c) = closure {
                    self.mark_object(c, gray);
                }
                for v in saved {
                    self.mark_value(v, gray);
                }
                self.mark_value(last_value, gray);
            }
        }
    }

    /// Runs a full mark-and-sweep collection: `roots` seeds the gray stack
    /// (the VM supplies the operand stack, frame callables, open upvalues,
    /// cached builtin classes, and the compiler's in-progress function
    /// chain), then the gray stack is drained, then unmarked objects are
    /// swept. `heap_grow_rate` sets the next collection threshold.
    pub fn collect(&mut self, roots: impl IntoIterator<Item = Value>, extra_roots: impl IntoIterator<Item = ObjectId>, heap_grow_rate: usize) {
        let mut gray = Vec::new();
        for root in roots {
            self.mark_value(root, &mut gray);
        }
        for root in extra_roots {
            self.mark_object(root, &mut gray);
        }
        while let Some(id) = gray.pop() {
            self.blacken(id, &mut gray);
        }
        self.sweep();
        self.next_gc = self.allocated.max(Self::INITIAL_NEXT_GC) * heap_grow_rate;
    }

    fn sweep(&mut self) {
        let mut cur = self.head;
        let mut prev: Option<ObjectId> = None;
        while let Some(id) = cur {
            let (marked, next) = {
                let slot = self.slots[id.index()].as_ref().expect("dangling ObjectId during sweep");
                (slot.object.header.marked, slot.object.header.next)
            };
            if marked {
                self.slots[id.index()].as_mut().unwrap().object.header.marked = false;
                prev = Some(id);
            } else {
                match prev {
                    Some(p) => self.slots[p.index()].as_mut().unwrap().object.header.next = next,
                    None => self.head = next,
                }
                self.free_slot(id);
            }
            cur = next;
        }
        let interned = &mut self.interned;
        let slots = &self.slots;
        interned.retain(|_, id| slots[id.index()].is_some());
    }

    fn free_slot(&mut self, id: ObjectId) {
        let slot = self.slots[id.index()].take().expect("dangling ObjectId freed twice");
        self.allocated = self.allocated.saturating_sub(slot.size);
        if let ObjectData::Userdata(mut userdata) = slot.object.data {
            if let Some(finalizer) = userdata.finalizer {
                finalizer(&mut userdata.bytes);
            }
        }
        self.free.push(id.0);
    }
}

impl KeyOps for Heap {
    fn hash_value(&self, v: Value) -> u32 {
        match v {
            Value::Null => 0,
            Value::Bool(b) => u32::from(b) + 1,
            Value::Number(n) => {
                let bits = n.to_bits();
                (bits ^ (bits >> 32)) as u32
            }
            Value::Handle(h) => (h ^ (h >> 32)) as u32,
            Value::Object(id) => match &self.get(id).data {
                ObjectData::String(s) => s.hash,
                _ => id.index() as u32,
            },
        }
    }

    fn values_equal(&self, a: Value, b: Value) -> bool {
        match (a, b) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Handle(a), Value::Handle(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => {
                if a == b {
                    return true;
                }
                match (&self.get(a).data, &self.get(b).data) {
                    (ObjectData::String(sa), ObjectData::String(sb)) => {
                        !sa.interned && !sb.interned && sa.bytes == sb.bytes
                    }
                    _ => false,
                }
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_reuses_equal_strings() {
        let mut heap = Heap::new();
        let a = heap.intern_string(b"hello", None);
        let b = heap.intern_string(b"hello", None);
        assert_eq!(a, b);
    }

    #[test]
    fn unreachable_objects_are_swept() {
        let mut heap = Heap::new();
        let kept = heap.alloc_string(b"kept".to_vec(), None);
        let _dropped = heap.alloc_string(b"dropped".to_vec(), None);
        heap.collect([Value::Object(kept)], [], 2);
        assert!(heap.get(kept).data.kind() == ObjectKind::String);
    }

    #[test]
    fn gc_is_idempotent_on_a_quiescent_heap() {
        let mut heap = Heap::new();
        let kept = heap.alloc_string(b"kept".to_vec(), None);
        heap.collect([Value::Object(kept)], [], 2);
        let allocated_after_first = heap.allocated();
        heap.collect([Value::Object(kept)], [], 2);
        assert_eq!(heap.allocated(), allocated_after_first);
    }

    #[test]
    fn empty_tuple_is_a_canonical_singleton() {
        let mut heap = Heap::new();
        let a = heap.alloc_tuple(vec![], None);
        let b = heap.alloc_tuple(vec![], None);
        assert_eq!(a, b);
    }

    #[test]
    fn cyclic_objects_with_no_roots_do_not_hang_collection() {
        let mut heap = Heap::new();
        let name = heap.intern_string(b"Stub", None);
        let class = heap.alloc_class(name, None, None);
        let a = heap.alloc_instance(class);
        let b = heap.alloc_instance(class);
        // a.field -> b, b.field -> a: a cycle with no external root.
        let key = Value::Number(0.0);
        let b_value = Value::Object(b);
        let a_value = Value::Object(a);
        if let ObjectData::Instance(inst) = &mut heap.get_mut(a).data {
            inst.fields.set(&IdentityOps, key, b_value);
        }
        if let ObjectData::Instance(inst) = &mut heap.get_mut(b).data {
            inst.fields.set(&IdentityOps, key, a_value);
        }
        // No roots at all: everything, including the cycle, is unreachable.
        heap.collect([], [], 2);
        assert_eq!(heap.allocated(), 0);
    }

    struct IdentityOps;
    impl KeyOps for IdentityOps {
        fn hash_value(&self, v: Value) -> u32 {
            match v {
                Value::Number(n) => n.to_bits() as u32,
                Value::Bool(b) => u32::from(b) + 1,
                Value::Null => 0,
                Value::Handle(h) => h as u32,
                Value::Object(id) => id.index() as u32,
            }
        }

        fn values_equal(&self, a: Value, b: Value) -> bool {
            a == b
        }
    }
}
