//! ember-vm - Compiler and virtual machine for the Ember scripting
//! language.
//!
//! The embedding surface is small: build a [`Vm`], feed it source with
//! [`Vm::interpret`], and optionally expose host functions through
//! [`Vm::register_native`]. Everything else — the single-pass compiler, the
//! dispatch loop, the disassembler — sits behind it.
//!
//! ```
//! use ember_vm::Vm;
//!
//! let mut vm = Vm::new();
//! vm.interpret("print \"hello from ember\";").unwrap();
//! ```

pub mod compiler;
pub mod debug;
pub mod native;
pub mod vm;

pub use compiler::compile;
pub use native::NativeFn;
pub use vm::{InterpretError, Vm, FRAMES_MAX, STACK_MAX};

// Hosts writing natives need the value types without depending on the core
// crate directly.
pub use ember_core::{Heap, Value};
