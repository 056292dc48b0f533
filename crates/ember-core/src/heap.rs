//! The garbage-collected heap.
//!
//! Objects live in a slot arena (`Vec<Option<…>>` plus a free list); a
//! [`ObjHandle`] is an index into it. Mark bits live in a bitmap parallel to
//! the slots, so tracing can read one object while marking its children.
//!
//! A collection is precise mark–sweep:
//!
//! 1. mark roots — the caller-supplied [`Roots`] (value stack, active
//!    frames, open-upvalue list) plus the heap's own roots (globals, the
//!    protect stack, the interned `init` string);
//! 2. trace — pop gray objects and mark everything they reference;
//! 3. remove white strings — drop intern-table entries that are about to
//!    die, so interning never resurrects garbage;
//! 4. sweep — free every unmarked slot and clear survivors' marks.
//!
//! Collection can only happen inside [`Heap::alloc`] (and the calls that
//! funnel into it). Growth of ordinary Rust buffers never triggers it, so a
//! freshly allocated handle stays valid until the next allocation; callers
//! root temporaries before allocating again.

use rustc_hash::FxHashMap;

use crate::object::{fnv1a, ObjHandle, ObjKind, ObjString, Object};
use crate::value::Value;

const GC_HEAP_GROW_FACTOR: usize = 2;
const GC_INITIAL_THRESHOLD: usize = 1024 * 1024;

/// One active call: the running closure, its instruction cursor, and the
/// base of its stack window (`stack[slots]` is the callee, arguments
/// follow).
#[derive(Clone, Copy, Debug)]
pub struct CallFrame {
    pub closure: ObjHandle,
    pub ip: usize,
    pub slots: usize,
}

/// The VM-owned roots of a collection. The heap adds its internal roots
/// (globals, protect stack, `init` string) by itself.
#[derive(Clone, Copy)]
pub struct Roots<'a> {
    pub stack: &'a [Value],
    pub frames: &'a [CallFrame],
    /// Head of the open-upvalue list; the collector walks the `next` links.
    pub open_upvalues: Option<ObjHandle>,
}

impl Roots<'static> {
    /// No external roots; what the compiler uses, since nothing is on the
    /// value stack while it runs.
    pub const EMPTY: Roots<'static> = Roots {
        stack: &[],
        frames: &[],
        open_upvalues: None,
    };
}

struct Slot {
    /// Bytes accounted against the collection threshold when this slot was
    /// filled; debited back on free.
    size: usize,
    object: Object,
}

/// Owner of every script object: allocator, intern table, globals, and the
/// collector.
///
/// # Examples
///
/// ```
/// use ember_core::{Heap, Roots};
///
/// let mut heap = Heap::new();
/// let a = heap.intern("hello", Roots::EMPTY);
/// let b = heap.intern("hello", Roots::EMPTY);
/// assert_eq!(a, b);
/// ```
pub struct Heap {
    slots: Vec<Option<Slot>>,
    marks: Vec<bool>,
    free: Vec<u32>,
    gray: Vec<ObjHandle>,
    /// Intern table: FNV-1a hash to the handles of strings with that hash.
    /// Weak — entries are removed, not kept alive, by the collector.
    strings: FxHashMap<u32, Vec<ObjHandle>>,
    globals: FxHashMap<ObjHandle, Value>,
    /// Temporaries rooted by the compiler (its chain of in-progress
    /// functions) or by anyone holding a handle across an allocation.
    protected: Vec<ObjHandle>,
    init_string: Option<ObjHandle>,
    bytes_allocated: usize,
    next_gc: usize,
    collections: u64,
}

impl Heap {
    pub fn new() -> Self {
        let mut heap = Self {
            slots: Vec::new(),
            marks: Vec::new(),
            free: Vec::new(),
            gray: Vec::new(),
            strings: FxHashMap::default(),
            globals: FxHashMap::default(),
            protected: Vec::new(),
            init_string: None,
            bytes_allocated: 0,
            next_gc: GC_INITIAL_THRESHOLD,
            collections: 0,
        };
        // Bootstrap intern, before `init_string` exists as a root; nothing
        // can trigger a collection yet.
        let hash = fnv1a(b"init");
        let object = Object::String(ObjString {
            text: "init".into(),
            hash,
        });
        let size = object.heap_size();
        heap.bytes_allocated += size;
        let init = heap.insert(object, size);
        heap.strings.entry(hash).or_default().push(init);
        heap.init_string = Some(init);
        heap
    }

    /// The interned `"init"` string used to find initializers.
    pub fn init_string(&self) -> ObjHandle {
        match self.init_string {
            Some(handle) => handle,
            None => unreachable!("heap constructed without init string"),
        }
    }

    // =========================================================================
    // ALLOCATION
    // =========================================================================

    /// Allocate an object, possibly collecting first. `roots` must cover
    /// every VM-side value that has to survive the collection.
    pub fn alloc(&mut self, object: Object, roots: Roots<'_>) -> ObjHandle {
        let size = object.heap_size();
        self.bytes_allocated += size;
        if cfg!(feature = "stress-gc") || self.bytes_allocated > self.next_gc {
            self.collect(roots);
        }
        let handle = self.insert(object, size);
        tracing::trace!(handle = handle.raw(), kind = ?self.object(handle).kind(), size, "alloc");
        handle
    }

    fn insert(&mut self, object: Object, size: usize) -> ObjHandle {
        let slot = Slot { size, object };
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(slot);
                ObjHandle::from_raw(index)
            }
            None => {
                self.slots.push(Some(slot));
                self.marks.push(false);
                ObjHandle::from_raw(self.slots.len() as u32 - 1)
            }
        }
    }

    /// Return the interned string for `text`, allocating it on first sight.
    pub fn intern(&mut self, text: &str, roots: Roots<'_>) -> ObjHandle {
        let hash = fnv1a(text.as_bytes());
        if let Some(existing) = self.find_interned(hash, text) {
            return existing;
        }
        let handle = self.alloc(
            Object::String(ObjString {
                text: text.into(),
                hash,
            }),
            roots,
        );
        self.strings.entry(hash).or_default().push(handle);
        handle
    }

    /// Interning for an already-owned buffer (string concatenation); the
    /// buffer is dropped if an equal string is already interned.
    pub fn intern_owned(&mut self, text: String, roots: Roots<'_>) -> ObjHandle {
        let hash = fnv1a(text.as_bytes());
        if let Some(existing) = self.find_interned(hash, &text) {
            return existing;
        }
        let handle = self.alloc(
            Object::String(ObjString {
                text: text.into_boxed_str(),
                hash,
            }),
            roots,
        );
        self.strings.entry(hash).or_default().push(handle);
        handle
    }

    fn find_interned(&self, hash: u32, text: &str) -> Option<ObjHandle> {
        let bucket = self.strings.get(&hash)?;
        bucket
            .iter()
            .copied()
            .find(|&handle| self.string(handle).text.as_ref() == text)
    }

    // =========================================================================
    // ACCESS
    // =========================================================================

    pub fn object(&self, handle: ObjHandle) -> &Object {
        match &self.slots[handle.index()] {
            Some(slot) => &slot.object,
            None => unreachable!("stale object handle {}", handle.raw()),
        }
    }

    pub fn object_mut(&mut self, handle: ObjHandle) -> &mut Object {
        match &mut self.slots[handle.index()] {
            Some(slot) => &mut slot.object,
            None => unreachable!("stale object handle {}", handle.raw()),
        }
    }

    pub fn kind(&self, handle: ObjHandle) -> ObjKind {
        self.object(handle).kind()
    }

    /// Whether this value is an object of the given kind.
    pub fn value_is(&self, value: Value, kind: ObjKind) -> bool {
        value.is_object() && self.kind(value.as_object()) == kind
    }

    // =========================================================================
    // GLOBALS
    // =========================================================================

    pub fn global(&self, name: ObjHandle) -> Option<Value> {
        self.globals.get(&name).copied()
    }

    /// Define (or redefine) a global binding.
    pub fn define_global(&mut self, name: ObjHandle, value: Value) {
        self.globals.insert(name, value);
    }

    /// Assign to an existing global. Returns false — without inserting —
    /// when no such binding exists.
    pub fn assign_global(&mut self, name: ObjHandle, value: Value) -> bool {
        match self.globals.get_mut(&name) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    // =========================================================================
    // PROTECTION
    // =========================================================================

    /// Root a handle for as long as it stays on the protect stack. The
    /// compiler keeps its chain of in-progress functions here.
    pub fn protect(&mut self, handle: ObjHandle) {
        self.protected.push(handle);
    }

    /// Drop the most recently protected handle.
    pub fn unprotect(&mut self) {
        self.protected.pop();
    }

    // =========================================================================
    // COLLECTION
    // =========================================================================

    /// Run a full mark–sweep collection.
    pub fn collect(&mut self, roots: Roots<'_>) {
        let before = self.bytes_allocated;
        tracing::debug!(bytes_allocated = before, "gc begin");

        self.mark_roots(roots);
        self.trace_references();
        self.remove_white_strings();
        self.sweep();

        self.next_gc = self.bytes_allocated * GC_HEAP_GROW_FACTOR;
        self.collections += 1;
        tracing::debug!(
            collected = before - self.bytes_allocated,
            bytes_allocated = self.bytes_allocated,
            next_gc = self.next_gc,
            "gc end"
        );
    }

    fn mark_roots(&mut self, roots: Roots<'_>) {
        for &value in roots.stack {
            mark_value(&mut self.marks, &mut self.gray, value);
        }
        for frame in roots.frames {
            mark(&mut self.marks, &mut self.gray, frame.closure);
        }

        let mut upvalue = roots.open_upvalues;
        while let Some(handle) = upvalue {
            mark(&mut self.marks, &mut self.gray, handle);
            upvalue = match self.object(handle) {
                Object::Upvalue(u) => u.next,
                _ => None,
            };
        }

        for (&name, &value) in &self.globals {
            mark(&mut self.marks, &mut self.gray, name);
            mark_value(&mut self.marks, &mut self.gray, value);
        }
        for &handle in &self.protected {
            mark(&mut self.marks, &mut self.gray, handle);
        }
        if let Some(init) = self.init_string {
            mark(&mut self.marks, &mut self.gray, init);
        }
    }

    fn trace_references(&mut self) {
        while let Some(handle) = self.gray.pop() {
            self.blacken(handle);
        }
    }

    fn blacken(&mut self, handle: ObjHandle) {
        let Heap {
            slots, marks, gray, ..
        } = self;
        let Some(slot) = slots[handle.index()].as_ref() else {
            return;
        };
        match &slot.object {
            Object::BoundMethod(bound) => {
                mark_value(marks, gray, bound.receiver);
                mark(marks, gray, bound.method);
            }
            Object::Class(class) => {
                mark(marks, gray, class.name);
                for (&name, &method) in &class.methods {
                    mark(marks, gray, name);
                    mark_value(marks, gray, method);
                }
            }
            Object::Closure(closure) => {
                mark(marks, gray, closure.function);
                for &upvalue in &closure.upvalues {
                    mark(marks, gray, upvalue);
                }
            }
            Object::Function(function) => {
                if let Some(name) = function.name {
                    mark(marks, gray, name);
                }
                for &constant in &function.chunk.constants {
                    mark_value(marks, gray, constant);
                }
            }
            Object::Instance(instance) => {
                mark(marks, gray, instance.class);
                for (&name, &value) in &instance.fields {
                    mark(marks, gray, name);
                    mark_value(marks, gray, value);
                }
            }
            Object::Upvalue(upvalue) => {
                if let crate::object::UpvalueState::Closed(value) = upvalue.state {
                    mark_value(marks, gray, value);
                }
            }
            Object::Native(_) | Object::String(_) => {}
        }
    }

    /// Delete intern-table entries whose string is unmarked, so the sweep
    /// cannot leave the table pointing at freed slots.
    fn remove_white_strings(&mut self) {
        let marks = &self.marks;
        self.strings
            .values_mut()
            .for_each(|bucket| bucket.retain(|handle| marks[handle.index()]));
        self.strings.retain(|_, bucket| !bucket.is_empty());
    }

    fn sweep(&mut self) {
        for index in 0..self.slots.len() {
            if self.marks[index] {
                self.marks[index] = false;
                continue;
            }
            if let Some(slot) = self.slots[index].take() {
                tracing::trace!(handle = index, kind = ?slot.object.kind(), "free");
                self.bytes_allocated -= slot.size;
                self.free.push(index as u32);
            }
        }
    }

    // =========================================================================
    // STATS
    // =========================================================================

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    pub fn next_gc(&self) -> usize {
        self.next_gc
    }

    pub fn collections(&self) -> u64 {
        self.collections
    }

    /// Number of live objects in the arena.
    pub fn object_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Number of distinct interned strings.
    pub fn interned_count(&self) -> usize {
        self.strings.values().map(Vec::len).sum()
    }

    // =========================================================================
    // PRINTING
    // =========================================================================

    /// Canonical textual form of a value, as `print` shows it.
    pub fn format_value(&self, value: Value) -> String {
        if value.is_number() {
            format!("{}", value.as_number())
        } else if value.is_nil() {
            "nil".to_string()
        } else if value.is_bool() {
            if value.as_bool() { "true" } else { "false" }.to_string()
        } else {
            self.format_object(value.as_object())
        }
    }

    fn format_object(&self, handle: ObjHandle) -> String {
        match self.object(handle) {
            Object::String(string) => string.text.to_string(),
            Object::Function(function) => self.format_function(function),
            Object::Closure(closure) => self.format_function(self.function(closure.function)),
            Object::BoundMethod(bound) => {
                self.format_function(self.function(self.closure(bound.method).function))
            }
            Object::Class(class) => self.string(class.name).text.to_string(),
            Object::Instance(instance) => {
                format!("{} instance", self.string(self.class(instance.class).name).text)
            }
            Object::Native(_) => "<native fn>".to_string(),
            Object::Upvalue(_) => "upvalue".to_string(),
        }
    }

    fn format_function(&self, function: &crate::object::ObjFunction) -> String {
        match function.name {
            Some(name) => format!("<fn {}>", self.string(name).text),
            None => "<script>".to_string(),
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

/// Typed accessors: each panics on a kind mismatch, which can only follow
/// from a compiler or collector defect.
macro_rules! typed_accessors {
    ($(($get:ident, $get_mut:ident, $variant:ident, $ty:ty)),* $(,)?) => {
        impl Heap {
            $(
                pub fn $get(&self, handle: ObjHandle) -> &$ty {
                    match self.object(handle) {
                        Object::$variant(inner) => inner,
                        other => unreachable!(
                            "expected {} object, found {:?}",
                            stringify!($variant),
                            other.kind()
                        ),
                    }
                }

                pub fn $get_mut(&mut self, handle: ObjHandle) -> &mut $ty {
                    match self.object_mut(handle) {
                        Object::$variant(inner) => inner,
                        other => unreachable!(
                            "expected {} object, found {:?}",
                            stringify!($variant),
                            other.kind()
                        ),
                    }
                }
            )*
        }
    };
}

typed_accessors!(
    (string, string_mut, String, crate::object::ObjString),
    (function, function_mut, Function, crate::object::ObjFunction),
    (closure, closure_mut, Closure, crate::object::ObjClosure),
    (upvalue, upvalue_mut, Upvalue, crate::object::ObjUpvalue),
    (class, class_mut, Class, crate::object::ObjClass),
    (instance, instance_mut, Instance, crate::object::ObjInstance),
    (bound_method, bound_method_mut, BoundMethod, crate::object::ObjBoundMethod),
    (native, native_mut, Native, crate::object::ObjNative),
);

fn mark(marks: &mut [bool], gray: &mut Vec<ObjHandle>, handle: ObjHandle) {
    if marks[handle.index()] {
        return;
    }
    marks[handle.index()] = true;
    gray.push(handle);
}

fn mark_value(marks: &mut [bool], gray: &mut Vec<ObjHandle>, value: Value) {
    if value.is_object() {
        mark(marks, gray, value.as_object());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ObjClass, ObjClosure, ObjFunction, ObjInstance, ObjUpvalue, UpvalueState};

    #[test]
    fn interning_returns_identical_handles() {
        let mut heap = Heap::new();
        let a = heap.intern("turret", Roots::EMPTY);
        let b = heap.intern("turret", Roots::EMPTY);
        let c = heap.intern_owned("turret".to_string(), Roots::EMPTY);
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_ne!(a, heap.intern("tower", Roots::EMPTY));
    }

    #[test]
    fn unrooted_objects_are_collected() {
        let mut heap = Heap::new();
        let baseline = heap.object_count();
        for i in 0..100 {
            heap.intern_owned(format!("garbage-{i}"), Roots::EMPTY);
        }
        assert_eq!(heap.object_count(), baseline + 100);

        heap.collect(Roots::EMPTY);
        assert_eq!(heap.object_count(), baseline);
    }

    #[test]
    fn stack_roots_survive_collection() {
        let mut heap = Heap::new();
        let keep = heap.intern("keep-me", Roots::EMPTY);
        let stack = [Value::object(keep)];
        let roots = Roots {
            stack: &stack,
            frames: &[],
            open_upvalues: None,
        };

        heap.intern("drop-me", Roots::EMPTY);
        heap.collect(roots);

        // Survivor is still interned and still readable.
        assert_eq!(heap.intern("keep-me", Roots::EMPTY), keep);
        assert_eq!(heap.string(keep).text.as_ref(), "keep-me");
    }

    #[test]
    fn remove_white_purges_the_intern_table() {
        let mut heap = Heap::new();
        let before = heap.interned_count();
        heap.intern("transient", Roots::EMPTY);
        assert_eq!(heap.interned_count(), before + 1);

        heap.collect(Roots::EMPTY);
        assert_eq!(heap.interned_count(), before);
    }

    #[test]
    fn init_string_survives_collection() {
        let mut heap = Heap::new();
        let init = heap.init_string();
        heap.collect(Roots::EMPTY);
        assert_eq!(heap.string(init).text.as_ref(), "init");
        assert_eq!(heap.intern("init", Roots::EMPTY), init);
    }

    #[test]
    fn protect_stack_roots_temporaries() {
        let mut heap = Heap::new();
        let handle = heap.intern("pinned", Roots::EMPTY);
        heap.protect(handle);
        heap.collect(Roots::EMPTY);
        assert_eq!(heap.string(handle).text.as_ref(), "pinned");

        let interned = heap.interned_count();
        heap.unprotect();
        heap.collect(Roots::EMPTY);
        assert_eq!(heap.interned_count(), interned - 1);
    }

    #[test]
    fn tracing_follows_the_object_graph() {
        let mut heap = Heap::new();

        // class -> name, method closure -> function; instance -> class,
        // field value.
        let class_name = heap.intern("Sprite", Roots::EMPTY);
        let class = heap.alloc(Object::Class(ObjClass::new(class_name)), Roots::EMPTY);
        heap.protect(class);

        let method_name = heap.intern("draw", Roots::EMPTY);
        let function = heap.alloc(Object::Function(ObjFunction::new()), Roots::EMPTY);
        heap.protect(function);
        let closure = heap.alloc(
            Object::Closure(ObjClosure {
                function,
                upvalues: Vec::new(),
            }),
            Roots::EMPTY,
        );
        heap.unprotect();
        heap.class_mut(class)
            .methods
            .insert(method_name, Value::object(closure));

        let field_name = heap.intern("hp", Roots::EMPTY);
        let instance = heap.alloc(Object::Instance(ObjInstance::new(class)), Roots::EMPTY);
        heap.instance_mut(instance)
            .fields
            .insert(field_name, Value::number(100.0));

        let stack = [Value::object(instance)];
        let live = heap.object_count();
        heap.collect(Roots {
            stack: &stack,
            frames: &[],
            open_upvalues: None,
        });

        // Everything reachable from the instance (class, names, closure,
        // function) survives; nothing else was allocated.
        assert_eq!(heap.object_count(), live);
        assert_eq!(heap.string(self_name(&heap, class)).text.as_ref(), "Sprite");
        assert!(heap
            .class(class)
            .methods
            .contains_key(&method_name));
    }

    fn self_name(heap: &Heap, class: ObjHandle) -> ObjHandle {
        heap.class(class).name
    }

    #[test]
    fn closed_upvalue_keeps_its_value_alive() {
        let mut heap = Heap::new();
        let text = heap.intern("captured", Roots::EMPTY);
        let upvalue = heap.alloc(
            Object::Upvalue(ObjUpvalue {
                state: UpvalueState::Closed(Value::object(text)),
                next: None,
            }),
            Roots::EMPTY,
        );
        heap.protect(upvalue);

        heap.collect(Roots::EMPTY);
        assert_eq!(heap.string(text).text.as_ref(), "captured");
    }

    #[test]
    fn next_gc_doubles_live_bytes_after_collection() {
        let mut heap = Heap::new();
        for i in 0..50 {
            heap.intern_owned(format!("bytes-{i}"), Roots::EMPTY);
        }
        heap.collect(Roots::EMPTY);
        assert_eq!(heap.next_gc(), heap.bytes_allocated() * 2);
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut heap = Heap::new();
        let dead = heap.intern("short-lived", Roots::EMPTY);
        heap.collect(Roots::EMPTY);
        let reborn = heap.intern("replacement", Roots::EMPTY);
        assert_eq!(dead, reborn);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Interning uniqueness: equal contents always resolve to the
            /// same handle, across arbitrary interleavings.
            #[test]
            fn interning_is_content_keyed(words in proptest::collection::vec("[a-z]{0,8}", 1..40)) {
                let mut heap = Heap::new();
                let mut first: std::collections::HashMap<String, ObjHandle> =
                    std::collections::HashMap::new();
                for word in &words {
                    let handle = heap.intern(word, Roots::EMPTY);
                    let canonical = *first.entry(word.clone()).or_insert(handle);
                    prop_assert_eq!(handle, canonical);
                    prop_assert_eq!(heap.string(handle).text.as_ref(), word.as_str());
                }
            }

            /// Heap-growth monotonicity: after any collection the threshold
            /// is exactly twice the live bytes, and allocation never leaves
            /// the counter above the threshold without a collection run.
            #[test]
            fn threshold_tracks_live_bytes(lengths in proptest::collection::vec(0usize..64, 1..30)) {
                let mut heap = Heap::new();
                for (i, len) in lengths.iter().enumerate() {
                    heap.intern_owned(format!("{i}:{}", "x".repeat(*len)), Roots::EMPTY);
                }
                heap.collect(Roots::EMPTY);
                prop_assert_eq!(heap.next_gc(), heap.bytes_allocated() * 2);
                prop_assert!(heap.bytes_allocated() <= heap.next_gc());
            }
        }
    }
}
