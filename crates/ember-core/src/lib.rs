//! ember-core - The data model of the Ember scripting engine.
//!
//! Everything the compiler emits and the VM executes lives here:
//!
//! - [`value::Value`] — a NaN-boxed machine word holding nil, a boolean, an
//!   IEEE-754 double, or a heap handle;
//! - [`object`] — the heap object kinds (strings, functions, closures,
//!   upvalues, classes, instances, bound methods, natives);
//! - [`chunk`] — bytecode: opcodes, a parallel source-line array, and a
//!   constant pool;
//! - [`heap`] — the garbage-collected arena that owns every object, interns
//!   strings, stores globals, and runs precise mark–sweep collections.
//!
//! The crate knows nothing about parsing or dispatch; the compiler and VM
//! sit on top of it in `ember-vm`.

pub mod chunk;
pub mod heap;
pub mod object;
pub mod value;

pub use chunk::{Chunk, OpCode};
pub use heap::{CallFrame, Heap, Roots};
pub use object::{
    fnv1a, NativeId, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjHandle, ObjInstance,
    ObjKind, ObjNative, ObjString, ObjUpvalue, Object, UpvalueState,
};
pub use value::Value;
