//! The virtual machine: a stack interpreter over the bytecode of
//! [`ember_core::Chunk`]s.
//!
//! One [`Vm`] owns the heap, the value stack, the call-frame stack, the
//! open-upvalue list, and the native-function registry. Dispatch is a plain
//! decode-and-match loop; a runtime error prints its message and a stack
//! trace, resets the VM to an empty stack, and surfaces as
//! [`InterpretError::Runtime`].
//!
//! Anything the VM allocates mid-instruction passes the current roots to
//! the heap, so a collection can strike between any two opcodes without
//! reclaiming live state. Values that only exist within one instruction are
//! kept on the value stack across allocations, never in Rust locals.

use std::io::{self, Write};

use ember_core::{
    CallFrame, Chunk, Heap, ObjBoundMethod, ObjClass, ObjClosure, ObjHandle, ObjInstance,
    ObjKind, ObjNative, ObjUpvalue, Object, OpCode, Roots, UpvalueState, Value,
};
use ember_util::Handler;
use thiserror::Error;

use crate::compiler::compile;
use crate::debug;
use crate::native::{self, NativeFn};

/// Maximum call depth; exceeding it is the scripted "Stack overflow.".
pub const FRAMES_MAX: usize = 64;
/// Value-stack capacity reserved up front: one full window per frame.
pub const STACK_MAX: usize = FRAMES_MAX * 256;

/// How a run of [`Vm::interpret`] failed. Diagnostics have already been
/// printed by the time this is returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum InterpretError {
    /// The source did not compile; diagnostics went to the handler/stderr.
    #[error("compile error")]
    Compile,
    /// The script failed at runtime; message and stack trace went to stderr.
    #[error("runtime error")]
    Runtime,
}

/// The current roots, spelled as disjoint field borrows so the heap can be
/// borrowed mutably in the same expression.
macro_rules! roots {
    ($vm:expr) => {
        Roots {
            stack: &$vm.stack,
            frames: &$vm.frames,
            open_upvalues: $vm.open_upvalues,
        }
    };
}

macro_rules! binary_op {
    ($vm:expr, $wrap:expr, $op:tt) => {{
        if !$vm.peek(0).is_number() || !$vm.peek(1).is_number() {
            return Err($vm.runtime_error("Operands must be numbers.".to_string()));
        }
        let b = $vm.pop().as_number();
        let a = $vm.pop().as_number();
        $vm.push(($wrap)(a $op b));
    }};
}

/// The Ember virtual machine.
///
/// # Examples
///
/// ```
/// use ember_vm::Vm;
///
/// let mut vm = Vm::new();
/// assert!(vm.interpret("print 1 + 2;").is_ok());
/// ```
pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    open_upvalues: Option<ObjHandle>,
    natives: Vec<NativeFn>,
    output: Box<dyn Write>,
    trace_execution: bool,
    dump_bytecode: bool,
}

impl Vm {
    /// Create a VM with the builtin natives (`clock`, `memory`, `gc`)
    /// registered and output going to stdout.
    pub fn new() -> Self {
        let mut vm = Self {
            heap: Heap::new(),
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            open_upvalues: None,
            natives: Vec::new(),
            output: Box::new(io::stdout()),
            trace_execution: false,
            dump_bytecode: false,
        };
        native::install_builtins(&mut vm);
        vm
    }

    /// Redirect `print` output, e.g. into a buffer for tests.
    pub fn set_output(&mut self, output: Box<dyn Write>) {
        self.output = output;
    }

    /// Print the value stack and each instruction while executing.
    pub fn set_trace_execution(&mut self, enabled: bool) {
        self.trace_execution = enabled;
    }

    /// Disassemble every function as it finishes compiling.
    pub fn set_dump_bytecode(&mut self, enabled: bool) {
        self.dump_bytecode = enabled;
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Compile and run a top-level script.
    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let handler = Handler::with_stderr();
        let function = compile(source, &mut self.heap, &handler, self.dump_bytecode);
        let Some(function) = function else {
            return Err(InterpretError::Compile);
        };

        let _span = tracing::debug_span!("run").entered();
        self.push(Value::object(function));
        let closure = self.heap.alloc(
            Object::Closure(ObjClosure {
                function,
                upvalues: Vec::new(),
            }),
            roots!(self),
        );
        self.pop();
        self.push(Value::object(closure));
        self.call(closure, 0)?;

        self.run()
    }

    /// Bind a host function to a global name.
    pub fn register_native(&mut self, name: &str, function: NativeFn) {
        let name = self.heap.intern(name, roots!(self));
        self.push(Value::object(name));

        let id = self.natives.len() as u32;
        self.natives.push(function);
        let native = self
            .heap
            .alloc(Object::Native(ObjNative { native: id }), roots!(self));
        self.push(Value::object(native));

        self.heap.define_global(name, Value::object(native));
        self.pop();
        self.pop();
    }

    /// Force a full collection with the VM's current roots.
    pub fn collect_garbage(&mut self) {
        self.heap.collect(roots!(self));
    }

    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Value {
        match self.stack.pop() {
            Some(value) => value,
            None => unreachable!("value stack underflow"),
        }
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    // =========================================================================
    // FRAME AND BYTE ACCESS
    // =========================================================================

    fn frame(&self) -> &CallFrame {
        let index = self.frames.len() - 1;
        &self.frames[index]
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        let index = self.frames.len() - 1;
        &mut self.frames[index]
    }

    fn current_chunk(&self) -> &Chunk {
        let frame = self.frame();
        let function = self.heap.closure(frame.closure).function;
        &self.heap.function(function).chunk
    }

    fn read_byte(&mut self) -> u8 {
        let ip = self.frame().ip;
        let byte = self.current_chunk().code[ip];
        self.frame_mut().ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let high = self.read_byte();
        let low = self.read_byte();
        u16::from(high) << 8 | u16::from(low)
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        self.current_chunk().constants[index]
    }

    fn read_string(&mut self) -> ObjHandle {
        self.read_constant().as_object()
    }

    // =========================================================================
    // DISPATCH
    // =========================================================================

    fn run(&mut self) -> Result<(), InterpretError> {
        loop {
            if self.trace_execution {
                self.trace_instruction();
            }

            let byte = self.read_byte();
            let Some(op) = OpCode::from_byte(byte) else {
                unreachable!("corrupt bytecode: opcode {byte}");
            };

            match op {
                OpCode::Constant => {
                    let constant = self.read_constant();
                    self.push(constant);
                }
                OpCode::Nil => self.push(Value::NIL),
                OpCode::True => self.push(Value::TRUE),
                OpCode::False => self.push(Value::FALSE),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().slots;
                    let value = self.stack[base + slot];
                    self.push(value);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().slots;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    match self.heap.global(name) {
                        Some(value) => self.push(value),
                        None => {
                            let message =
                                format!("Undefined variable '{}'.", self.heap.string(name).text);
                            return Err(self.runtime_error(message));
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let value = self.peek(0);
                    self.heap.define_global(name, value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    let value = self.peek(0);
                    if !self.heap.assign_global(name, value) {
                        let message =
                            format!("Undefined variable '{}'.", self.heap.string(name).text);
                        return Err(self.runtime_error(message));
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[slot];
                    let value = match self.heap.upvalue(upvalue).state {
                        UpvalueState::Open(index) => self.stack[index],
                        UpvalueState::Closed(value) => value,
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[slot];
                    let value = self.peek(0);
                    match self.heap.upvalue(upvalue).state {
                        UpvalueState::Open(index) => self.stack[index] = value,
                        UpvalueState::Closed(_) => {
                            self.heap.upvalue_mut(upvalue).state = UpvalueState::Closed(value);
                        }
                    }
                }
                OpCode::GetProperty => {
                    if !self.heap.value_is(self.peek(0), ObjKind::Instance) {
                        return Err(
                            self.runtime_error("Only instances have properties.".to_string())
                        );
                    }

                    let instance = self.peek(0).as_object();
                    let name = self.read_string();

                    let field = self.heap.instance(instance).fields.get(&name).copied();
                    if let Some(value) = field {
                        self.pop(); // Instance.
                        self.push(value);
                    } else {
                        let class = self.heap.instance(instance).class;
                        self.bind_method(class, name)?;
                    }
                }
                OpCode::SetProperty => {
                    if !self.heap.value_is(self.peek(1), ObjKind::Instance) {
                        return Err(self.runtime_error("Only instances have fields.".to_string()));
                    }

                    let instance = self.peek(1).as_object();
                    let name = self.read_string();
                    let value = self.peek(0);
                    self.heap.instance_mut(instance).fields.insert(name, value);

                    let value = self.pop();
                    self.pop();
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let name = self.read_string();
                    let superclass = self.pop().as_object();
                    self.bind_method(superclass, name)?;
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::boolean(a == b));
                }
                OpCode::Greater => binary_op!(self, Value::boolean, >),
                OpCode::Less => binary_op!(self, Value::boolean, <),
                OpCode::Add => {
                    if self.heap.value_is(self.peek(0), ObjKind::String)
                        && self.heap.value_is(self.peek(1), ObjKind::String)
                    {
                        self.concatenate();
                    } else if self.peek(0).is_number() && self.peek(1).is_number() {
                        let b = self.pop().as_number();
                        let a = self.pop().as_number();
                        self.push(Value::number(a + b));
                    } else {
                        return Err(self.runtime_error(
                            "Operands must be two numbers or two strings.".to_string(),
                        ));
                    }
                }
                OpCode::Subtract => binary_op!(self, Value::number, -),
                OpCode::Multiply => binary_op!(self, Value::number, *),
                OpCode::Divide => binary_op!(self, Value::number, /),
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::boolean(value.is_falsey()));
                }
                OpCode::Negate => {
                    if !self.peek(0).is_number() {
                        return Err(self.runtime_error("Operand must be a number.".to_string()));
                    }
                    let value = self.pop().as_number();
                    self.push(Value::number(-value));
                }
                OpCode::Print => {
                    let value = self.pop();
                    let text = self.heap.format_value(value);
                    let _ = writeln!(self.output, "{text}");
                }
                OpCode::Jump => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_u16() as usize;
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().ip -= offset;
                }
                OpCode::Call => {
                    let arg_count = self.read_byte() as usize;
                    let callee = self.peek(arg_count);
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte() as usize;
                    self.invoke(name, arg_count)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte() as usize;
                    let superclass = self.pop().as_object();
                    self.invoke_from_class(superclass, name, arg_count)?;
                }
                OpCode::Closure => {
                    let function = self.read_constant().as_object();
                    let closure = self.heap.alloc(
                        Object::Closure(ObjClosure {
                            function,
                            upvalues: Vec::new(),
                        }),
                        roots!(self),
                    );
                    self.push(Value::object(closure));

                    let count = self.heap.function(function).upvalue_count;
                    for _ in 0..count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        let upvalue = if is_local {
                            let slot = self.frame().slots + index;
                            self.capture_upvalue(slot)
                        } else {
                            self.heap.closure(self.frame().closure).upvalues[index]
                        };
                        self.heap.closure_mut(closure).upvalues.push(upvalue);
                    }
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let frame = *self.frame();
                    self.close_upvalues(frame.slots);
                    self.frames.pop();

                    if self.frames.is_empty() {
                        self.pop();
                        return Ok(());
                    }

                    self.stack.truncate(frame.slots);
                    self.push(result);
                }
                OpCode::Class => {
                    let name = self.read_string();
                    let class = self
                        .heap
                        .alloc(Object::Class(ObjClass::new(name)), roots!(self));
                    self.push(Value::object(class));
                }
                OpCode::Inherit => {
                    let superclass = self.peek(1);
                    if !self.heap.value_is(superclass, ObjKind::Class) {
                        return Err(self.runtime_error("Superclass must be a class.".to_string()));
                    }

                    let subclass = self.peek(0).as_object();
                    let inherited = self.heap.class(superclass.as_object()).methods.clone();
                    self.heap.class_mut(subclass).methods.extend(inherited);

                    self.pop(); // Subclass.
                }
                OpCode::Method => {
                    let name = self.read_string();
                    let method = self.peek(0);
                    let class = self.peek(1).as_object();
                    self.heap.class_mut(class).methods.insert(name, method);
                    self.pop();
                }
            }
        }
    }

    // =========================================================================
    // CALLS AND METHOD DISPATCH
    // =========================================================================

    fn call(&mut self, closure: ObjHandle, arg_count: usize) -> Result<(), InterpretError> {
        let arity = self.heap.function(self.heap.closure(closure).function).arity as usize;
        if arg_count != arity {
            let message = format!("Expected {arity} arguments but got {arg_count}.");
            return Err(self.runtime_error(message));
        }

        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow.".to_string()));
        }

        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slots: self.stack.len() - arg_count - 1,
        });
        Ok(())
    }

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), InterpretError> {
        if callee.is_object() {
            let handle = callee.as_object();
            match self.heap.kind(handle) {
                ObjKind::BoundMethod => {
                    let bound = self.heap.bound_method(handle);
                    let receiver = bound.receiver;
                    let method = bound.method;
                    let slot = self.stack.len() - arg_count - 1;
                    self.stack[slot] = receiver;
                    return self.call(method, arg_count);
                }
                ObjKind::Class => {
                    let instance = self
                        .heap
                        .alloc(Object::Instance(ObjInstance::new(handle)), roots!(self));
                    let slot = self.stack.len() - arg_count - 1;
                    self.stack[slot] = Value::object(instance);

                    let init_name = self.heap.init_string();
                    let initializer = self.heap.class(handle).methods.get(&init_name).copied();
                    if let Some(initializer) = initializer {
                        return self.call(initializer.as_object(), arg_count);
                    }
                    if arg_count != 0 {
                        let message = format!("Expected 0 arguments but got {arg_count}.");
                        return Err(self.runtime_error(message));
                    }
                    return Ok(());
                }
                ObjKind::Closure => return self.call(handle, arg_count),
                ObjKind::Native => {
                    let id = self.heap.native(handle).native as usize;
                    let function = self.natives[id];
                    let first_arg = self.stack.len() - arg_count;
                    let args: Vec<Value> = self.stack[first_arg..].to_vec();
                    let result = function(self, &args);
                    self.stack.truncate(first_arg - 1);
                    self.push(result);
                    return Ok(());
                }
                _ => {} // Non-callable object kind.
            }
        }
        Err(self.runtime_error("Can only call functions and classes.".to_string()))
    }

    fn invoke(&mut self, name: ObjHandle, arg_count: usize) -> Result<(), InterpretError> {
        let receiver = self.peek(arg_count);
        if !self.heap.value_is(receiver, ObjKind::Instance) {
            return Err(self.runtime_error("Only instances have methods.".to_string()));
        }

        let instance = receiver.as_object();
        let field = self.heap.instance(instance).fields.get(&name).copied();
        if let Some(value) = field {
            let slot = self.stack.len() - arg_count - 1;
            self.stack[slot] = value;
            return self.call_value(value, arg_count);
        }

        let class = self.heap.instance(instance).class;
        self.invoke_from_class(class, name, arg_count)
    }

    fn invoke_from_class(
        &mut self,
        class: ObjHandle,
        name: ObjHandle,
        arg_count: usize,
    ) -> Result<(), InterpretError> {
        let method = self.heap.class(class).methods.get(&name).copied();
        match method {
            Some(method) => self.call(method.as_object(), arg_count),
            None => {
                let message =
                    format!("Undefined property '{}'.", self.heap.string(name).text);
                Err(self.runtime_error(message))
            }
        }
    }

    /// Wrap the method found on `class` around the receiver on top of the
    /// stack, replacing it.
    fn bind_method(&mut self, class: ObjHandle, name: ObjHandle) -> Result<(), InterpretError> {
        let method = self.heap.class(class).methods.get(&name).copied();
        let Some(method) = method else {
            let message = format!("Undefined property '{}'.", self.heap.string(name).text);
            return Err(self.runtime_error(message));
        };

        let bound = self.heap.alloc(
            Object::BoundMethod(ObjBoundMethod {
                receiver: self.peek(0),
                method: method.as_object(),
            }),
            roots!(self),
        );
        self.pop();
        self.push(Value::object(bound));
        Ok(())
    }

    // =========================================================================
    // UPVALUES
    // =========================================================================

    /// Find or create the open upvalue for an absolute stack slot. The list
    /// stays sorted by strictly descending slot, one entry per slot.
    fn capture_upvalue(&mut self, slot: usize) -> ObjHandle {
        let mut prev: Option<ObjHandle> = None;
        let mut current = self.open_upvalues;
        while let Some(handle) = current {
            match self.heap.upvalue(handle).state {
                UpvalueState::Open(open_slot) if open_slot > slot => {
                    prev = Some(handle);
                    current = self.heap.upvalue(handle).next;
                }
                _ => break,
            }
        }

        if let Some(handle) = current {
            if self.heap.upvalue(handle).state == UpvalueState::Open(slot) {
                return handle;
            }
        }

        let created = self.heap.alloc(
            Object::Upvalue(ObjUpvalue {
                state: UpvalueState::Open(slot),
                next: current,
            }),
            roots!(self),
        );

        match prev {
            Some(prev) => self.heap.upvalue_mut(prev).next = Some(created),
            None => self.open_upvalues = Some(created),
        }
        created
    }

    /// Close every open upvalue at or above `last`: move the stack value
    /// into the upvalue and unlink it from the open list.
    fn close_upvalues(&mut self, last: usize) {
        while let Some(handle) = self.open_upvalues {
            let UpvalueState::Open(slot) = self.heap.upvalue(handle).state else {
                break;
            };
            if slot < last {
                break;
            }

            let value = self.stack[slot];
            let upvalue = self.heap.upvalue_mut(handle);
            upvalue.state = UpvalueState::Closed(value);
            self.open_upvalues = upvalue.next;
        }
    }

    // =========================================================================
    // STRINGS
    // =========================================================================

    /// Concatenate the two strings on top of the stack. Operands stay on
    /// the stack until the result exists, so the interning allocation
    /// cannot reclaim them.
    fn concatenate(&mut self) {
        let b = self.peek(0).as_object();
        let a = self.peek(1).as_object();

        let mut text =
            String::with_capacity(self.heap.string(a).text.len() + self.heap.string(b).text.len());
        text.push_str(&self.heap.string(a).text);
        text.push_str(&self.heap.string(b).text);

        let result = self.heap.intern_owned(text, roots!(self));
        self.pop();
        self.pop();
        self.push(Value::object(result));
    }

    // =========================================================================
    // ERRORS AND TRACING
    // =========================================================================

    /// Report a runtime error: message, then the call stack innermost
    /// first, then reset to an empty machine.
    fn runtime_error(&mut self, message: String) -> InterpretError {
        eprintln!("{message}");

        for frame in self.frames.iter().rev() {
            let function = self.heap.closure(frame.closure).function;
            let function = self.heap.function(function);
            let instruction = frame.ip.saturating_sub(1);
            let line = function.chunk.lines[instruction];
            match function.name {
                Some(name) => eprintln!("[line {}] in {}()", line, self.heap.string(name).text),
                None => eprintln!("[line {line}] in script"),
            }
        }

        self.reset_stack();
        InterpretError::Runtime
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
    }

    fn trace_instruction(&self) {
        let mut stack_line = String::from("          ");
        for &value in &self.stack {
            stack_line.push_str("[ ");
            stack_line.push_str(&self.heap.format_value(value));
            stack_line.push_str(" ]");
        }
        println!("{stack_line}");

        let (text, _) = debug::disassemble_instruction(&self.heap, self.current_chunk(), self.frame().ip);
        println!("{text}");
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
