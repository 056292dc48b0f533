//! Heap object kinds and their payloads.
//!
//! Objects live in the [`Heap`](crate::heap::Heap) arena and are referred to
//! by [`ObjHandle`]s; the structs here are pure payloads. Anything that can
//! reference another object stores a handle, never a Rust reference, which
//! is what lets the collector treat the whole graph uniformly.

use rustc_hash::FxHashMap;

use crate::chunk::Chunk;
use crate::value::Value;

/// Index of a live object in the heap arena.
///
/// Handles are plain numbers; the collector guarantees that any handle
/// reachable from the roots refers to a live slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ObjHandle(u32);

impl ObjHandle {
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Index into the VM-side native function registry.
///
/// The heap stores only this id, so function pointers never enter the
/// object graph.
pub type NativeId = u32;

/// Discriminant of an [`Object`], used for dispatch and printing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjKind {
    BoundMethod,
    Class,
    Closure,
    Function,
    Instance,
    Native,
    String,
    Upvalue,
}

/// Immutable interned string with its precomputed FNV-1a hash.
#[derive(Debug)]
pub struct ObjString {
    pub text: Box<str>,
    pub hash: u32,
}

/// A compiled function body: arity, upvalue count, bytecode, and an
/// optional name (the top-level script has none).
#[derive(Debug)]
pub struct ObjFunction {
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    pub name: Option<ObjHandle>,
}

impl ObjFunction {
    pub fn new() -> Self {
        Self {
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
            name: None,
        }
    }
}

impl Default for ObjFunction {
    fn default() -> Self {
        Self::new()
    }
}

/// A function plus the upvalues it captured. Closures that capture the same
/// enclosing local share one upvalue object.
#[derive(Debug)]
pub struct ObjClosure {
    pub function: ObjHandle,
    /// Filled in one by one while the `Closure` opcode executes; its final
    /// length is the function's `upvalue_count`.
    pub upvalues: Vec<ObjHandle>,
}

/// Whether an upvalue still aliases a live stack slot or owns its value.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum UpvalueState {
    /// Aliases the VM stack at this absolute slot index.
    Open(usize),
    /// Owns the value; the variable has left the stack.
    Closed(Value),
}

/// A captured variable. Open upvalues form the VM's intrusive list, sorted
/// by descending stack slot.
#[derive(Debug)]
pub struct ObjUpvalue {
    pub state: UpvalueState,
    pub next: Option<ObjHandle>,
}

/// A class: name plus method table. Method tables key on interned strings.
#[derive(Debug)]
pub struct ObjClass {
    pub name: ObjHandle,
    pub methods: FxHashMap<ObjHandle, Value>,
}

impl ObjClass {
    pub fn new(name: ObjHandle) -> Self {
        Self {
            name,
            methods: FxHashMap::default(),
        }
    }
}

/// An instance: its class plus a field table keyed on interned strings.
#[derive(Debug)]
pub struct ObjInstance {
    pub class: ObjHandle,
    pub fields: FxHashMap<ObjHandle, Value>,
}

impl ObjInstance {
    pub fn new(class: ObjHandle) -> Self {
        Self {
            class,
            fields: FxHashMap::default(),
        }
    }
}

/// A closure bundled with the receiver it was looked up on.
#[derive(Debug)]
pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: ObjHandle,
}

/// A host-provided callable, referenced by registry id.
#[derive(Debug)]
pub struct ObjNative {
    pub native: NativeId,
}

/// One heap object. The heap stores these behind a mark bit and a size
/// account; every reachable object is exactly one of these kinds.
#[derive(Debug)]
pub enum Object {
    BoundMethod(ObjBoundMethod),
    Class(ObjClass),
    Closure(ObjClosure),
    Function(ObjFunction),
    Instance(ObjInstance),
    Native(ObjNative),
    String(ObjString),
    Upvalue(ObjUpvalue),
}

impl Object {
    pub fn kind(&self) -> ObjKind {
        match self {
            Object::BoundMethod(_) => ObjKind::BoundMethod,
            Object::Class(_) => ObjKind::Class,
            Object::Closure(_) => ObjKind::Closure,
            Object::Function(_) => ObjKind::Function,
            Object::Instance(_) => ObjKind::Instance,
            Object::Native(_) => ObjKind::Native,
            Object::String(_) => ObjKind::String,
            Object::Upvalue(_) => ObjKind::Upvalue,
        }
    }

    /// Bytes this object accounts for against the collection threshold: the
    /// slot itself plus owned buffers as sized right now. Buffers that grow
    /// later (field tables, chunks under compilation) are not re-measured.
    pub fn heap_size(&self) -> usize {
        const ENTRY: usize = std::mem::size_of::<(ObjHandle, Value)>();
        let owned = match self {
            Object::String(s) => s.text.len(),
            Object::Function(f) => {
                f.chunk.code.len()
                    + f.chunk.lines.len() * std::mem::size_of::<u32>()
                    + f.chunk.constants.len() * std::mem::size_of::<Value>()
            }
            Object::Closure(c) => c.upvalues.capacity() * std::mem::size_of::<ObjHandle>(),
            Object::Class(c) => c.methods.len() * ENTRY,
            Object::Instance(i) => i.fields.len() * ENTRY,
            Object::BoundMethod(_) | Object::Native(_) | Object::Upvalue(_) => 0,
        };
        std::mem::size_of::<Object>() + owned
    }
}

/// FNV-1a, 32-bit. Every interned string carries this hash, and the intern
/// table buckets on it.
///
/// # Examples
///
/// ```
/// use ember_core::fnv1a;
///
/// assert_eq!(fnv1a(b""), 0x811c9dc5);
/// assert_eq!(fnv1a(b"init"), fnv1a(b"init"));
/// assert_ne!(fnv1a(b"init"), fnv1a(b"tini"));
/// ```
pub fn fnv1a(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &byte in bytes {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(16_777_619);
    }
    hash
}
