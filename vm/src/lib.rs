//! Stack-based bytecode interpreter. Drives a [`compiler::Chunk`] through a
//! tight dispatch loop over a fixed-depth call-frame stack.

mod natives;

#[cfg(feature = "debug-execution")]
use colored::Colorize;
use compiler::{
    compile, CompileErrors, Gc, GcRef, MarkRoots, ObjClass, ObjClosure, ObjKind, ObjNative, ObjString,
    ObjUpvalue, OpCode, Table, Value,
};
use std::error::Error;
use std::fmt;

const FRAMES_MAX: usize = 64;
const STACK_MAX: usize = FRAMES_MAX * 256;

struct CallFrame {
    closure: GcRef<ObjClosure>,
    ip: usize,
    slot_base: usize,
}

/// A runtime error, reported with the message plus a call-frame trace
/// (top to bottom), matching the `[line L] in <fn>()` / `in script` wire
/// format.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub message: String,
    pub trace: Vec<String>,
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(f, "{}", self.message)?;
        for (i, line) in self.trace.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{line}")?;
        }
        Ok(())
    }
}

impl Error for RuntimeError {}

/// Outcome of one `Vm::interpret` call: either side of the driver's
/// `Ok`/`CompileError`/`RuntimeError` exit-code convention.
#[derive(Debug)]
pub enum InterpretError {
    Compile(CompileErrors),
    Runtime(RuntimeError),
}

impl fmt::Display for InterpretError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            InterpretError::Compile(err) => write!(f, "{err}"),
            InterpretError::Runtime(err) => write!(f, "{err}"),
        }
    }
}

impl Error for InterpretError {}

/// Owns every piece of process-wide interpreter state (the "interpreter
/// context"): the garbage collector, the operand stack, the call-frame
/// stack, globals, and the open-upvalue list.
pub struct Vm {
    gc: Gc,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    open_upvalues: Option<GcRef<ObjUpvalue>>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        let mut gc = Gc::new();
        let mut globals = Table::new();
        natives::register(&mut gc, &mut globals);
        Self {
            gc,
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals,
            open_upvalues: None,
        }
    }

    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function = compile(source, &mut self.gc).map_err(InterpretError::Compile)?;
        self.stack.push(Value::Obj(function.erase()));
        let closure = self.gc.alloc_closure(function);
        self.stack.pop();
        self.stack.push(Value::Obj(closure.erase()));
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slot_base: 0,
        });
        self.run().map_err(InterpretError::Runtime)
    }

    fn frame(&self) -> &CallFrame {
        self.frames.last().expect("dispatch loop always runs inside a frame")
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames
            .last_mut()
            .expect("dispatch loop always runs inside a frame")
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frame_mut();
        let closure = frame.closure;
        let byte = closure.as_ref().function.as_ref().chunk.code[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_short(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        u16::from_be_bytes([hi, lo])
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        let frame = self.frame();
        frame.closure.as_ref().function.as_ref().chunk.constants[index]
    }

    fn read_string(&mut self) -> GcRef<ObjString> {
        self.read_constant()
            .as_string()
            .expect("name operands are always interned strings")
    }

    fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.stack.len() >= STACK_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("bytecode never pops past what it pushed")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn runtime_error(&mut self, message: impl Into<String>) -> RuntimeError {
        let message = message.into();
        let mut trace = Vec::with_capacity(self.frames.len());
        for frame in self.frames.iter().rev() {
            let function = frame.closure.as_ref().function;
            let line = function.as_ref().chunk.line_at(frame.ip.saturating_sub(1));
            let where_ = match function.as_ref().name {
                Some(name) => format!("in {}()", name.as_ref()),
                None => "in script".to_string(),
            };
            trace.push(format!("[line {line}] {where_}"));
        }
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
        RuntimeError { message, trace }
    }

    fn collect_garbage(&mut self) {
        let mut gc = std::mem::take(&mut self.gc);
        gc.collect_garbage(self);
        self.gc = gc;
    }

    fn maybe_collect_garbage(&mut self) {
        if self.gc.should_collect() {
            self.collect_garbage();
        }
    }

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            #[cfg(feature = "debug-execution")]
            self.trace_instruction();

            let instruction = OpCode::from_byte(self.read_byte());
            match instruction {
                OpCode::Constant => {
                    let value = self.read_constant();
                    self.push(value)?;
                }
                OpCode::Nil => self.push(Value::Nil)?,
                OpCode::True => self.push(Value::from(true))?,
                OpCode::False => self.push(Value::from(false))?,
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().slot_base;
                    self.push(self.stack[base + slot])?;
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().slot_base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    match self.globals.get(name) {
                        Some(value) => self.push(value)?,
                        None => {
                            return Err(
                                self.runtime_error(format!("Undefined variable '{}'.", name.as_ref()))
                            )
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let value = self.peek(0);
                    self.globals.set(name, value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    let value = self.peek(0);
                    if self.globals.set(name, value) {
                        self.globals.delete(name);
                        return Err(
                            self.runtime_error(format!("Undefined variable '{}'.", name.as_ref()))
                        );
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let upvalue = self.frame().closure.as_ref().upvalues[slot];
                    self.push(upvalue.as_ref().get())?;
                }
                OpCode::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let mut upvalue = self.frame().closure.as_ref().upvalues[slot];
                    let value = self.peek(0);
                    upvalue.as_mut().set(value);
                }
                OpCode::GetProperty => {
                    let receiver = self.peek(0);
                    let instance = match receiver.as_instance() {
                        Some(instance) => instance,
                        None => return Err(self.runtime_error("Only instances have properties.")),
                    };
                    let name = self.read_string();
                    if let Some(value) = instance.as_ref().fields.get(name) {
                        self.pop();
                        self.push(value)?;
                    } else if !self.bind_method(instance.as_ref().class, name)? {
                        return Err(
                            self.runtime_error(format!("Undefined property '{}'.", name.as_ref()))
                        );
                    }
                }
                OpCode::SetProperty => {
                    let value = self.peek(0);
                    let receiver = self.peek(1);
                    let mut instance = match receiver.as_instance() {
                        Some(instance) => instance,
                        None => return Err(self.runtime_error("Only instances have fields.")),
                    };
                    let name = self.read_string();
                    instance.as_mut().fields.set(name, value);
                    self.pop();
                    self.pop();
                    self.push(value)?;
                }
                OpCode::GetSuper => {
                    let name = self.read_string();
                    let superclass = self.pop().as_class().expect("OP_GET_SUPER always pushes a class");
                    if !self.bind_method(superclass, name)? {
                        return Err(
                            self.runtime_error(format!("Undefined property '{}'.", name.as_ref()))
                        );
                    }
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::from(a == b))?;
                }
                OpCode::Greater => self.binary_compare(|a, b| a > b)?,
                OpCode::Less => self.binary_compare(|a, b| a < b)?,
                OpCode::Add => self.add()?,
                OpCode::Subtract => self.binary_number(|a, b| a - b)?,
                OpCode::Multiply => self.binary_number(|a, b| a * b)?,
                OpCode::Divide => self.binary_number(|a, b| a / b)?,
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::from(value.is_falsey()))?;
                }
                OpCode::Negate => {
                    let value = self.peek(0);
                    match value.as_number() {
                        Some(n) => {
                            self.pop();
                            self.push(Value::from(-n))?;
                        }
                        None => return Err(self.runtime_error("Operand must be a number.")),
                    }
                }
                OpCode::Print => {
                    let value = self.pop();
                    println!("{value}");
                }
                OpCode::Jump => {
                    let offset = self.read_short();
                    self.frame_mut().ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_short();
                    if self.peek(0).is_falsey() {
                        self.frame_mut().ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_short();
                    self.frame_mut().ip -= offset as usize;
                }
                OpCode::Call => {
                    let argc = self.read_byte() as usize;
                    let callee = self.peek(argc);
                    self.call_value(callee, argc)?;
                }
                OpCode::Invoke => {
                    let name = self.read_string();
                    let argc = self.read_byte() as usize;
                    self.invoke(name, argc)?;
                }
                OpCode::SuperInvoke => {
                    let name = self.read_string();
                    let argc = self.read_byte() as usize;
                    let superclass = self.pop().as_class().expect("OP_SUPER_INVOKE always pushes a class");
                    self.invoke_from_class(superclass, name, argc)?;
                }
                OpCode::Closure => {
                    let function = self
                        .read_constant()
                        .as_function()
                        .expect("OP_CLOSURE's operand is always a function constant");
                    let mut closure = self.gc.alloc_closure(function);
                    let upvalue_count = function.as_ref().upvalue_count;
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        let upvalue = if is_local {
                            let base = self.frame().slot_base;
                            self.capture_upvalue(base + index)
                        } else {
                            self.frame().closure.as_ref().upvalues[index]
                        };
                        closure.as_mut().upvalues.push(upvalue);
                    }
                    self.push(Value::Obj(closure.erase()))?;
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let base = self.frame().slot_base;
                    self.close_upvalues(base);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(base);
                    self.push(result)?;
                }
                OpCode::Class => {
                    let name = self.read_string();
                    let class = self.gc.alloc_class(name);
                    self.push(Value::Obj(class.erase()))?;
                }
                OpCode::Inherit => {
                    let superclass = self.peek(1);
                    let super_class = match superclass.as_class() {
                        Some(class) => class,
                        None => return Err(self.runtime_error("Superclass must be a class.")),
                    };
                    let mut subclass = self
                        .peek(0)
                        .as_class()
                        .expect("OP_INHERIT always runs with the subclass on top");
                    let methods: Vec<_> = super_class.as_ref().methods.iter().collect();
                    for (name, method) in methods {
                        subclass.as_mut().methods.set(name, method);
                    }
                    self.pop();
                }
                OpCode::Method => {
                    let name = self.read_string();
                    self.define_method(name);
                }
            }

            self.maybe_collect_garbage();
        }
    }

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), RuntimeError> {
        if let Some(obj) = callee.as_obj() {
            match obj.kind() {
                ObjKind::Closure => {
                    let closure = obj.as_closure().unwrap();
                    return self.call(closure, argc);
                }
                ObjKind::Native => {
                    let native = obj.as_native().unwrap();
                    return self.call_native(native, argc);
                }
                ObjKind::Class => {
                    let class = obj.as_class().unwrap();
                    let instance = self.gc.alloc_instance(class);
                    let slot = self.stack.len() - argc - 1;
                    self.stack[slot] = Value::Obj(instance.erase());
                    if let Some(initializer) = class.as_ref().methods.get(self.gc.init_string) {
                        let closure = initializer.as_closure().expect("methods are always closures");
                        return self.call(closure, argc);
                    } else if argc != 0 {
                        return Err(self.runtime_error(format!("Expected 0 arguments but got {argc}.")));
                    }
                    return Ok(());
                }
                ObjKind::BoundMethod => {
                    let bound = obj.as_bound_method().unwrap();
                    let slot = self.stack.len() - argc - 1;
                    self.stack[slot] = bound.as_ref().receiver;
                    return self.call(bound.as_ref().method, argc);
                }
                _ => {}
            }
        }
        Err(self.runtime_error("Can only call functions and classes."))
    }

    fn call(&mut self, closure: GcRef<ObjClosure>, argc: usize) -> Result<(), RuntimeError> {
        let arity = closure.as_ref().function.as_ref().arity as usize;
        if argc != arity {
            return Err(self.runtime_error(format!("Expected {arity} arguments but got {argc}.")));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        let slot_base = self.stack.len() - argc - 1;
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slot_base,
        });
        Ok(())
    }

    fn call_native(&mut self, native: GcRef<ObjNative>, argc: usize) -> Result<(), RuntimeError> {
        let arity = native.as_ref().arity as usize;
        if argc != arity {
            return Err(self.runtime_error(format!("Expected {arity} arguments but got {argc}.")));
        }
        let start = self.stack.len() - argc;
        let result = (native.as_ref().function)(&self.stack[start..]);
        self.stack.truncate(start - 1);
        match result {
            Ok(value) => {
                self.push(value)?;
                Ok(())
            }
            Err(message) => Err(self.runtime_error(message)),
        }
    }

    fn bind_method(&mut self, class: GcRef<ObjClass>, name: GcRef<ObjString>) -> Result<bool, RuntimeError> {
        let method = match class.as_ref().methods.get(name) {
            Some(method) => method,
            None => return Ok(false),
        };
        let closure = method.as_closure().expect("methods are always closures");
        let receiver = self.pop();
        let bound = self.gc.alloc_bound_method(receiver, closure);
        self.push(Value::Obj(bound.erase()))?;
        Ok(true)
    }

    fn invoke(&mut self, name: GcRef<ObjString>, argc: usize) -> Result<(), RuntimeError> {
        let receiver = self.peek(argc);
        let instance = match receiver.as_instance() {
            Some(instance) => instance,
            None => return Err(self.runtime_error("Only instances have methods.")),
        };
        if let Some(value) = instance.as_ref().fields.get(name) {
            let slot = self.stack.len() - argc - 1;
            self.stack[slot] = value;
            return self.call_value(value, argc);
        }
        self.invoke_from_class(instance.as_ref().class, name, argc)
    }

    fn invoke_from_class(
        &mut self,
        class: GcRef<ObjClass>,
        name: GcRef<ObjString>,
        argc: usize,
    ) -> Result<(), RuntimeError> {
        match class.as_ref().methods.get(name) {
            Some(method) => {
                let closure = method.as_closure().expect("methods are always closures");
                self.call(closure, argc)
            }
            None => Err(self.runtime_error(format!("Undefined property '{}'.", name.as_ref()))),
        }
    }

    fn define_method(&mut self, name: GcRef<ObjString>) {
        let method = self.peek(0);
        let mut class = self
            .peek(1)
            .as_class()
            .expect("OP_METHOD always runs with the class beneath the method closure");
        class.as_mut().methods.set(name, method);
        self.pop();
    }

    /// Walks the open-upvalue list (sorted by descending `location`),
    /// reusing an existing upvalue for this slot if one is already open.
    fn capture_upvalue(&mut self, index: usize) -> GcRef<ObjUpvalue> {
        let target = unsafe { self.stack.as_mut_ptr().add(index) };
        let target_addr = target as usize;

        let mut previous: Option<GcRef<ObjUpvalue>> = None;
        let mut current = self.open_upvalues;
        while let Some(upvalue) = current {
            let location_addr = upvalue.as_ref().location as usize;
            if location_addr == target_addr {
                return upvalue;
            }
            if location_addr < target_addr {
                break;
            }
            previous = Some(upvalue);
            current = upvalue.as_ref().next_open;
        }

        let mut created = self.gc.alloc_upvalue(target);
        created.as_mut().next_open = current;
        match previous {
            Some(mut previous) => previous.as_mut().next_open = Some(created),
            None => self.open_upvalues = Some(created),
        }
        created
    }

    fn close_upvalues(&mut self, boundary: usize) {
        let boundary_addr = unsafe { self.stack.as_ptr().add(boundary) } as usize;
        while let Some(mut upvalue) = self.open_upvalues {
            if (upvalue.as_ref().location as usize) < boundary_addr {
                break;
            }
            upvalue.as_mut().close();
            self.open_upvalues = upvalue.as_ref().next_open;
        }
    }

    fn add(&mut self) -> Result<(), RuntimeError> {
        let b = self.peek(0);
        let a = self.peek(1);
        if let (Some(a), Some(b)) = (a.as_string(), b.as_string()) {
            let mut concatenated =
                String::with_capacity(a.as_ref().as_str().len() + b.as_ref().as_str().len());
            concatenated.push_str(a.as_ref().as_str());
            concatenated.push_str(b.as_ref().as_str());
            let interned = self.gc.intern_owned(concatenated);
            self.pop();
            self.pop();
            self.push(Value::Obj(interned.erase()))
        } else if let (Some(a), Some(b)) = (a.as_number(), b.as_number()) {
            self.pop();
            self.pop();
            self.push(Value::from(a + b))
        } else {
            Err(self.runtime_error("Operands must be two numbers or two strings."))
        }
    }

    fn pop_two_numbers(&mut self) -> Result<(f64, f64), RuntimeError> {
        let b = self.pop();
        let a = self.pop();
        match (a.as_number(), b.as_number()) {
            (Some(a), Some(b)) => Ok((a, b)),
            _ => Err(self.runtime_error("Operands must be numbers.")),
        }
    }

    fn binary_number(&mut self, op: impl Fn(f64, f64) -> f64) -> Result<(), RuntimeError> {
        let (a, b) = self.pop_two_numbers()?;
        self.push(Value::from(op(a, b)))
    }

    fn binary_compare(&mut self, op: impl Fn(f64, f64) -> bool) -> Result<(), RuntimeError> {
        let (a, b) = self.pop_two_numbers()?;
        self.push(Value::from(op(a, b)))
    }

    #[cfg(feature = "debug-execution")]
    fn trace_instruction(&self) {
        let frame = self.frame();
        let op = frame.closure.as_ref().function.as_ref().chunk.code[frame.ip];
        eprint!("{}", "stack:".dimmed());
        for value in &self.stack {
            eprint!(" [{value}]");
        }
        eprintln!();
        eprintln!("{:04} {:?}", frame.ip, OpCode::from_byte(op));
    }
}

impl MarkRoots for Vm {
    fn mark_roots(&mut self, gc: &mut Gc) {
        for &value in &self.stack {
            gc.mark_value(value);
        }
        for frame in &self.frames {
            gc.mark_object(frame.closure.erase());
        }
        let mut upvalue = self.open_upvalues;
        while let Some(current) = upvalue {
            gc.mark_object(current.erase());
            upvalue = current.as_ref().next_open;
        }
        let globals: Vec<_> = self.globals.iter().collect();
        for (key, value) in globals {
            gc.mark_object(key.erase());
            gc.mark_value(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> Result<(), InterpretError> {
        Vm::new().interpret(source)
    }

    #[test]
    fn arithmetic_with_precedence() {
        assert!(run("print 1 + 2 * 3;").is_ok());
    }

    #[test]
    fn string_concatenation() {
        assert!(run(r#"var a = "foo"; var b = "bar"; print a + b;"#).is_ok());
    }

    #[test]
    fn closures_share_a_captured_local() {
        assert!(run(
            "fun make(n) { fun add(x) { return x + n; } return add; } \
             var f = make(10); print f(5); print f(7);"
        )
        .is_ok());
    }

    #[test]
    fn inheritance_and_super_calls() {
        assert!(run(
            "class A { greet() { print \"A\"; } } \
             class B < A { greet() { super.greet(); print \"B\"; } } \
             B().greet();"
        )
        .is_ok());
    }

    #[test]
    fn initializer_sets_fields() {
        assert!(run("class C { init(x) { this.x = x; } } print C(42).x;").is_ok());
    }

    #[test]
    fn numeric_for_loop() {
        assert!(run("var i = 0; for (; i < 3; i = i + 1) print i;").is_ok());
    }

    #[test]
    fn subtracting_a_string_from_a_number_is_a_runtime_error() {
        match run(r#""a" - 1;"#) {
            Err(InterpretError::Runtime(err)) => assert_eq!(err.message, "Operands must be numbers."),
            _ => panic!("expected a runtime error"),
        }
    }

    #[test]
    fn returning_from_top_level_is_a_compile_error() {
        match run("return 1;") {
            Err(InterpretError::Compile(errs)) => {
                assert!(errs.to_string().contains("Can't return from top-level code."))
            }
            _ => panic!("expected a compile error"),
        }
    }

    #[test]
    fn undefined_global_assignment_is_a_runtime_error() {
        match run("x = 1;") {
            Err(InterpretError::Runtime(err)) => assert!(err.message.contains("Undefined variable")),
            _ => panic!("expected a runtime error"),
        }
    }
}
