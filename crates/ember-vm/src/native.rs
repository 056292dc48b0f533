//! Native functions: host callables exposed to scripts as globals.
//!
//! The heap only ever stores a registry id for a native, so the object
//! graph stays free of function pointers; the [`Vm`] owns the registry.
//! Natives receive the VM itself, which lets them read allocator stats or
//! force a collection, plus a copy of their argument window.

use std::time::{SystemTime, UNIX_EPOCH};

use ember_core::Value;

use crate::vm::Vm;

/// A host function: argument values in, one result value out. Arity is not
/// checked; natives see however many arguments the call site passed.
pub type NativeFn = fn(&mut Vm, &[Value]) -> Value;

/// Register the builtins every VM starts with.
pub(crate) fn install_builtins(vm: &mut Vm) {
    vm.register_native("clock", clock);
    vm.register_native("memory", memory);
    vm.register_native("gc", collect);
}

/// `clock()` — seconds of wall-clock time, for timing scripts.
fn clock(_vm: &mut Vm, _args: &[Value]) -> Value {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0.0, |elapsed| elapsed.as_secs_f64());
    Value::number(seconds)
}

/// `memory()` — bytes currently accounted to the script heap.
fn memory(vm: &mut Vm, _args: &[Value]) -> Value {
    Value::number(vm.heap().bytes_allocated() as f64)
}

/// `gc()` — force a full collection; returns nil.
fn collect(vm: &mut Vm, _args: &[Value]) -> Value {
    vm.collect_garbage();
    Value::NIL
}
