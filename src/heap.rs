// File: src/heap.rs
//
// The VM-owned object heap and its mark-sweep garbage collector.
// Heap objects live in a slot vector indexed by Handle; values carry
// handles rather than pointers, and collection marks by index. Cyclic
// ownership (arrays referencing maps referencing arrays) is reclaimed
// by tracing, not reference counting.

use crate::bytecode::FunctionProto;
use crate::collections::{ScriptMap, ScriptSet};
use crate::errors::{EmberError, ErrorKind, SourceLocation, StackEntry};
use crate::value::{Handle, Value};
use ahash::RandomState;
use std::hash::{BuildHasher, Hash, Hasher};
use std::rc::Rc;

/// First collection happens after this many bytes of allocation.
const INITIAL_WATERMARK: usize = 64 * 1024;
/// The watermark doubles after each collection, up to this ceiling.
const WATERMARK_CEILING: usize = 16 * 1024 * 1024;
/// Soft ceiling on tracked live bytes; allocation past it is a memory error.
const HEAP_CEILING: usize = 256 * 1024 * 1024;
/// Deep structural equality gives up past this depth. Distinct cyclic
/// structures would otherwise never terminate.
const EQ_DEPTH_LIMIT: usize = 64;
/// Aggregate formatting stops descending past this depth.
const FMT_DEPTH_LIMIT: usize = 8;

/// A closure: compiled function proto plus captured upvalue cells.
#[derive(Debug, Clone)]
pub struct Closure {
    pub proto: Rc<FunctionProto>,
    pub upvalues: Vec<Handle>,
}

/// Script-visible error object, as bound by `catch`.
#[derive(Debug, Clone)]
pub struct ErrorObj {
    pub kind: ErrorKind,
    pub message: String,
    pub location: SourceLocation,
    pub call_stack: Vec<StackEntry>,
}

/// Everything that can live on the heap
#[derive(Debug, Clone)]
pub enum HeapObject {
    /// Immutable byte string; NUL bytes are data
    Str(String),
    Array(Vec<Value>),
    Map(ScriptMap),
    Set(ScriptSet),
    Closure(Closure),
    Error(ErrorObj),
    /// Boxed captured local, shared between a frame and the closures
    /// that captured it
    Cell(Value),
}

impl HeapObject {
    /// Approximate payload size, used for the collection watermark and
    /// the heap ceiling. Precision is not required, monotonicity is.
    fn byte_size(&self) -> usize {
        let base = std::mem::size_of::<HeapObject>();
        base + match self {
            HeapObject::Str(s) => s.len(),
            HeapObject::Array(items) => items.len() * std::mem::size_of::<Value>(),
            HeapObject::Map(map) => map.byte_size(),
            HeapObject::Set(set) => set.byte_size(),
            HeapObject::Closure(c) => c.upvalues.len() * std::mem::size_of::<Handle>(),
            HeapObject::Error(e) => e.message.len() + e.call_stack.len() * 32,
            HeapObject::Cell(_) => 0,
        }
    }

    /// Enumerate the handles this object references, for the mark phase
    fn trace(&self, visit: &mut dyn FnMut(Handle)) {
        match self {
            HeapObject::Str(_) | HeapObject::Error(_) => {}
            HeapObject::Array(items) => {
                for item in items {
                    if let Some(h) = item.handle() {
                        visit(h);
                    }
                }
            }
            HeapObject::Map(map) => {
                for entry in map.entries() {
                    if let Some(h) = entry.key.handle() {
                        visit(h);
                    }
                    if let Some(h) = entry.value.handle() {
                        visit(h);
                    }
                }
            }
            HeapObject::Set(set) => {
                for item in set.items() {
                    if let Some(h) = item.handle() {
                        visit(h);
                    }
                }
            }
            HeapObject::Closure(closure) => {
                for &cell in &closure.upvalues {
                    visit(cell);
                }
            }
            HeapObject::Cell(inner) => {
                if let Some(h) = inner.handle() {
                    visit(h);
                }
            }
        }
    }
}

/// Mark-sweep garbage-collected heap for Ember values.
pub struct Heap {
    storage: Vec<Option<HeapObject>>,
    free_slots: Vec<usize>,
    marks: Vec<bool>,
    /// Bytes of live objects (recomputed at sweep)
    bytes_live: usize,
    /// Bytes allocated since the last collection
    alloc_debt: usize,
    watermark: usize,
    live_count: usize,
    hasher: RandomState,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            storage: Vec::with_capacity(256),
            free_slots: Vec::new(),
            marks: Vec::with_capacity(256),
            bytes_live: 0,
            alloc_debt: 0,
            watermark: INITIAL_WATERMARK,
            live_count: 0,
            hasher: RandomState::with_seeds(0x243f, 0x6a88, 0x85a3, 0x08d3),
        }
    }

    /// Allocate a heap object. The caller must root the returned handle
    /// (usually by pushing it on the operand stack) before the next
    /// allocation that could trigger a collection.
    pub fn alloc(&mut self, object: HeapObject) -> Result<Handle, EmberError> {
        let size = object.byte_size();
        if self.bytes_live + size > HEAP_CEILING {
            return Err(EmberError::memory("Heap ceiling exceeded"));
        }
        self.alloc_debt += size;
        self.bytes_live += size;
        self.live_count += 1;

        if let Some(idx) = self.free_slots.pop() {
            self.storage[idx] = Some(object);
            self.marks[idx] = false;
            return Ok(Handle(idx as u32));
        }

        let idx = self.storage.len();
        self.storage.push(Some(object));
        self.marks.push(false);
        Ok(Handle(idx as u32))
    }

    pub fn alloc_string(&mut self, s: String) -> Result<Handle, EmberError> {
        self.alloc(HeapObject::Str(s))
    }

    pub fn alloc_array(&mut self, items: Vec<Value>) -> Result<Handle, EmberError> {
        self.alloc(HeapObject::Array(items))
    }

    pub fn alloc_map(&mut self) -> Result<Handle, EmberError> {
        self.alloc(HeapObject::Map(ScriptMap::new()))
    }

    pub fn alloc_set(&mut self) -> Result<Handle, EmberError> {
        self.alloc(HeapObject::Set(ScriptSet::new()))
    }

    pub fn alloc_closure(&mut self, closure: Closure) -> Result<Handle, EmberError> {
        self.alloc(HeapObject::Closure(closure))
    }

    pub fn alloc_error(&mut self, error: ErrorObj) -> Result<Handle, EmberError> {
        self.alloc(HeapObject::Error(error))
    }

    pub fn alloc_cell(&mut self, inner: Value) -> Result<Handle, EmberError> {
        self.alloc(HeapObject::Cell(inner))
    }

    /// Get a reference to a live object.
    ///
    /// # Panics
    /// Panics if the handle refers to a freed slot; the VM's rooting
    /// discipline makes that unreachable.
    pub fn get(&self, h: Handle) -> &HeapObject {
        self.storage[h.0 as usize]
            .as_ref()
            .expect("use-after-free: handle refers to collected slot")
    }

    pub fn get_mut(&mut self, h: Handle) -> &mut HeapObject {
        self.storage[h.0 as usize]
            .as_mut()
            .expect("use-after-free: handle refers to collected slot")
    }

    pub fn get_str(&self, h: Handle) -> &str {
        match self.get(h) {
            HeapObject::Str(s) => s,
            other => panic!("expected string object, found {:?}", other),
        }
    }

    pub fn get_array(&self, h: Handle) -> &Vec<Value> {
        match self.get(h) {
            HeapObject::Array(items) => items,
            other => panic!("expected array object, found {:?}", other),
        }
    }

    pub fn get_array_mut(&mut self, h: Handle) -> &mut Vec<Value> {
        match self.get_mut(h) {
            HeapObject::Array(items) => items,
            other => panic!("expected array object, found {:?}", other),
        }
    }

    pub fn get_closure(&self, h: Handle) -> &Closure {
        match self.get(h) {
            HeapObject::Closure(c) => c,
            other => panic!("expected closure object, found {:?}", other),
        }
    }

    pub fn get_error(&self, h: Handle) -> &ErrorObj {
        match self.get(h) {
            HeapObject::Error(e) => e,
            other => panic!("expected error object, found {:?}", other),
        }
    }

    pub fn get_cell(&self, h: Handle) -> Value {
        match self.get(h) {
            HeapObject::Cell(inner) => *inner,
            other => panic!("expected cell object, found {:?}", other),
        }
    }

    pub fn set_cell(&mut self, h: Handle, value: Value) {
        match self.get_mut(h) {
            HeapObject::Cell(inner) => *inner = value,
            other => panic!("expected cell object, found {:?}", other),
        }
    }

    pub fn live_count(&self) -> usize {
        self.live_count
    }

    pub fn bytes_live(&self) -> usize {
        self.bytes_live
    }

    /// True when allocation debt has passed the watermark and the VM
    /// should run a collection at its next safe point.
    pub fn should_collect(&self) -> bool {
        self.alloc_debt >= self.watermark
    }

    /// Run mark-sweep collection from the given roots. Returns the
    /// number of objects freed. Collection never alters program-visible
    /// behavior; it only reclaims storage.
    pub fn collect(&mut self, roots: &[Handle]) -> usize {
        for mark in self.marks.iter_mut() {
            *mark = false;
        }

        // Mark phase: iterative DFS over the object graph
        let mut worklist: Vec<Handle> = roots.to_vec();
        while let Some(h) = worklist.pop() {
            let idx = h.0 as usize;
            if idx >= self.marks.len() || self.marks[idx] {
                continue;
            }
            self.marks[idx] = true;
            if let Some(object) = &self.storage[idx] {
                object.trace(&mut |child| {
                    let child_idx = child.0 as usize;
                    if child_idx < self.marks.len() && !self.marks[child_idx] {
                        worklist.push(child);
                    }
                });
            }
        }

        // Sweep phase: free unmarked slots and recompute live bytes
        let mut collected = 0;
        let mut bytes = 0;
        for i in 0..self.storage.len() {
            match (&self.storage[i], self.marks[i]) {
                (Some(_), false) => {
                    self.storage[i] = None;
                    self.free_slots.push(i);
                    collected += 1;
                }
                (Some(object), true) => {
                    bytes += object.byte_size();
                }
                (None, _) => {}
            }
        }

        self.live_count -= collected;
        self.bytes_live = bytes;
        self.alloc_debt = 0;
        self.watermark = (self.watermark * 2).min(WATERMARK_CEILING);
        collected
    }

    // === Structural hashing and equality ===

    /// Hash for map keys and set items. Structural for nil, bool, number
    /// and string; identity (handle or registry id) for everything else,
    /// so cyclic keys cannot hang the hasher.
    pub fn key_hash(&self, value: &Value) -> u64 {
        let mut hasher = self.hasher.build_hasher();
        match value {
            Value::Nil => 0u8.hash(&mut hasher),
            Value::Bool(b) => (1u8, b).hash(&mut hasher),
            Value::Number(n) => {
                let n = if *n == 0.0 { 0.0 } else { *n };
                (2u8, n.to_bits()).hash(&mut hasher);
            }
            Value::Str(h) => (3u8, self.get_str(*h).as_bytes()).hash(&mut hasher),
            Value::Array(h)
            | Value::Map(h)
            | Value::Set(h)
            | Value::Function(h)
            | Value::Error(h)
            | Value::Cell(h) => (4u8, h.0).hash(&mut hasher),
            Value::Native(id) => (5u8, id.0).hash(&mut hasher),
        }
        hasher.finish()
    }

    /// Key equality: structural for primitives and strings, identity for
    /// everything else. Never dereferences aggregate handles.
    pub fn key_equal(&self, a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Number(x), Value::Number(y)) => x == y,
            (Value::Str(x), Value::Str(y)) => x == y || self.get_str(*x) == self.get_str(*y),
            (Value::Native(x), Value::Native(y)) => x == y,
            _ => a.handle().is_some() && a.handle() == b.handle(),
        }
    }

    /// Deep structural equality, as used by the `==` operator: strings
    /// by bytes, collections element-wise, functions and natives by
    /// identity. NaN compares unequal to itself.
    pub fn values_equal(&self, a: &Value, b: &Value) -> bool {
        self.values_equal_at(a, b, 0)
    }

    fn values_equal_at(&self, a: &Value, b: &Value, depth: usize) -> bool {
        if depth > EQ_DEPTH_LIMIT {
            return a.handle().is_some() && a.handle() == b.handle();
        }
        match (a, b) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Number(x), Value::Number(y)) => x == y,
            (Value::Str(x), Value::Str(y)) => x == y || self.get_str(*x) == self.get_str(*y),
            (Value::Array(x), Value::Array(y)) => {
                if x == y {
                    return true;
                }
                let xs = self.get_array(*x);
                let ys = self.get_array(*y);
                xs.len() == ys.len()
                    && xs
                        .iter()
                        .zip(ys.iter())
                        .all(|(u, v)| self.values_equal_at(u, v, depth + 1))
            }
            (Value::Map(x), Value::Map(y)) => {
                if x == y {
                    return true;
                }
                let (HeapObject::Map(xm), HeapObject::Map(ym)) = (self.get(*x), self.get(*y))
                else {
                    return false;
                };
                if xm.len() != ym.len() {
                    return false;
                }
                xm.entries().iter().all(|entry| {
                    match ym.get(entry.hash, |k| self.key_equal(k, &entry.key)) {
                        Some(other) => self.values_equal_at(&entry.value, &other, depth + 1),
                        None => false,
                    }
                })
            }
            (Value::Set(x), Value::Set(y)) => {
                if x == y {
                    return true;
                }
                let (HeapObject::Set(xs), HeapObject::Set(ys)) = (self.get(*x), self.get(*y))
                else {
                    return false;
                };
                xs.len() == ys.len()
                    && xs
                        .items()
                        .all(|item| ys.contains(self.key_hash(item), |v| self.key_equal(v, item)))
            }
            (Value::Function(x), Value::Function(y)) => x == y,
            (Value::Native(x), Value::Native(y)) => x == y,
            (Value::Error(x), Value::Error(y)) => x == y,
            _ => false,
        }
    }

    // === Map / set operations (keyed by structural equality) ===

    pub fn map_len(&self, map: Handle) -> usize {
        match self.get(map) {
            HeapObject::Map(m) => m.len(),
            other => panic!("expected map object, found {:?}", other),
        }
    }

    pub fn map_get(&self, map: Handle, key: &Value) -> Option<Value> {
        let hash = self.key_hash(key);
        match self.get(map) {
            HeapObject::Map(m) => m.get(hash, |k| self.key_equal(k, key)),
            other => panic!("expected map object, found {:?}", other),
        }
    }

    /// Insert or update a map entry. The map object is detached from its
    /// slot for the duration so key comparisons can read the rest of the
    /// heap; key equality never dereferences the map itself.
    pub fn map_insert(&mut self, map: Handle, key: Value, value: Value) {
        let hash = self.key_hash(&key);
        let slot = map.0 as usize;
        let mut object = self.storage[slot]
            .take()
            .expect("use-after-free: handle refers to collected slot");
        let before;
        let after;
        match &mut object {
            HeapObject::Map(m) => {
                before = m.byte_size();
                m.insert(hash, key, value, |k| self.key_equal(k, &key));
                after = m.byte_size();
            }
            other => panic!("expected map object, found {:?}", other),
        }
        self.storage[slot] = Some(object);
        if after > before {
            self.alloc_debt += after - before;
            self.bytes_live += after - before;
        }
    }

    /// Look up a map entry under a string key without allocating the
    /// key on the heap. Hashes exactly as `key_hash` does for `Str`.
    pub fn map_get_str(&self, map: Handle, key: &str) -> Option<Value> {
        let mut hasher = self.hasher.build_hasher();
        (3u8, key.as_bytes()).hash(&mut hasher);
        let hash = hasher.finish();
        match self.get(map) {
            HeapObject::Map(m) => m.get(hash, |k| match k {
                Value::Str(h) => self.get_str(*h) == key,
                _ => false,
            }),
            other => panic!("expected map object, found {:?}", other),
        }
    }

    pub fn set_len(&self, set: Handle) -> usize {
        match self.get(set) {
            HeapObject::Set(s) => s.len(),
            other => panic!("expected set object, found {:?}", other),
        }
    }

    pub fn set_contains(&self, set: Handle, item: &Value) -> bool {
        let hash = self.key_hash(item);
        match self.get(set) {
            HeapObject::Set(s) => s.contains(hash, |v| self.key_equal(v, item)),
            other => panic!("expected set object, found {:?}", other),
        }
    }

    pub fn set_add(&mut self, set: Handle, item: Value) -> bool {
        let hash = self.key_hash(&item);
        let slot = set.0 as usize;
        let mut object = self.storage[slot]
            .take()
            .expect("use-after-free: handle refers to collected slot");
        let added;
        let before;
        let after;
        match &mut object {
            HeapObject::Set(s) => {
                before = s.byte_size();
                added = s.add(hash, item, |v| self.key_equal(v, &item));
                after = s.byte_size();
            }
            other => panic!("expected set object, found {:?}", other),
        }
        self.storage[slot] = Some(object);
        if after > before {
            self.alloc_debt += after - before;
            self.bytes_live += after - before;
        }
        added
    }

    /// Record growth of an array already on the heap, keeping the
    /// watermark accounting honest for in-place mutation.
    pub fn note_array_growth(&mut self, added_items: usize) {
        let bytes = added_items * std::mem::size_of::<Value>();
        self.alloc_debt += bytes;
        self.bytes_live += bytes;
    }

    // === Printing ===

    /// Printable form used by `print` and the REPL: numbers as %g, bools
    /// as true/false, nil as `nil`, strings raw, arrays `[v1, v2]`, maps
    /// `{k: v}`. Strings nested inside aggregates are quoted.
    pub fn format_value(&self, value: &Value) -> String {
        self.format_value_at(value, 0, false)
    }

    fn format_value_at(&self, value: &Value, depth: usize, quote_strings: bool) -> String {
        if depth > FMT_DEPTH_LIMIT {
            return "...".to_string();
        }
        match value {
            Value::Nil => "nil".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => crate::value::format_number(*n),
            Value::Str(h) => {
                if quote_strings {
                    format!("\"{}\"", self.get_str(*h))
                } else {
                    self.get_str(*h).to_string()
                }
            }
            Value::Array(h) => {
                let items: Vec<String> = self
                    .get_array(*h)
                    .iter()
                    .map(|v| self.format_value_at(v, depth + 1, true))
                    .collect();
                format!("[{}]", items.join(", "))
            }
            Value::Map(h) => match self.get(*h) {
                HeapObject::Map(m) => {
                    let entries: Vec<String> = m
                        .entries()
                        .iter()
                        .map(|e| {
                            format!(
                                "{}: {}",
                                self.format_value_at(&e.key, depth + 1, true),
                                self.format_value_at(&e.value, depth + 1, true)
                            )
                        })
                        .collect();
                    format!("{{{}}}", entries.join(", "))
                }
                other => panic!("expected map object, found {:?}", other),
            },
            Value::Set(h) => match self.get(*h) {
                HeapObject::Set(s) => {
                    let items: Vec<String> =
                        s.items().map(|v| self.format_value_at(v, depth + 1, true)).collect();
                    format!("set{{{}}}", items.join(", "))
                }
                other => panic!("expected set object, found {:?}", other),
            },
            Value::Function(h) => {
                format!("<function {}>", self.get_closure(*h).proto.name)
            }
            Value::Native(_) => "<native fn>".to_string(),
            Value::Error(h) => {
                let e = self.get_error(*h);
                format!("<error {}: {}>", e.kind.name(), e.message)
            }
            Value::Cell(_) => "<cell>".to_string(),
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}
