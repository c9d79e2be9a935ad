use super::{
    chunk::Instruction::{self, *},
    compiler::Compiler,
    debug,
    heap::{GcRef, Heap, ObjKind, UpValue},
    natives::{NativeFn, NATIVES},
    reporter::Reporter,
    table::Table,
    value::Value,
};
use std::{
    fmt,
    io::{self, Write},
    time::SystemTime,
};

pub const FRAMES_MAX: usize = 256;

#[derive(Debug, Clone)]
struct BacktraceFrame {
    line: usize,
    name: String,
    parens: bool,
}

#[derive(Debug, Clone)]
pub struct Backtrace {
    frames: Vec<BacktraceFrame>,
}

impl fmt::Display for Backtrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for frame in &self.frames {
            write!(f, "[line {}] in {}", frame.line, frame.name)?;
            if frame.parens {
                write!(f, "()")?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeError {
    msg: String,
    backtrace: Backtrace,
}

impl RuntimeError {
    pub fn message(&self) -> &str {
        &self.msg
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.msg)?;
        write!(f, "{}", self.backtrace)
    }
}

#[derive(Debug)]
pub enum InterpretError {
    Compile,
    Runtime(RuntimeError),
}

struct CallFrame {
    closure: GcRef,
    pc: usize,
    bp: usize,
}

pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    /// One pool for the whole compilation unit; chunks hold indices into it.
    /// It persists across REPL lines so earlier closures stay valid.
    constants: Vec<Value>,
    /// Open upvalues sorted by descending stack slot.
    open_upvalues: Vec<GcRef>,
    heap: Heap,
    init_string: GcRef,
    created_at: SystemTime,
    gc_stress: bool,
    output: Box<dyn Write>,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_output(Box::new(io::stdout()))
    }

    pub fn with_output(output: Box<dyn Write>) -> Self {
        let mut heap = Heap::new();
        let mut globals = Table::new();
        for (name, arity, fun) in NATIVES {
            let native = heap.alloc_native(arity, fun);
            let key = heap.intern_value(name);
            let hash = heap.value_hash(key);
            globals.set(key, hash, Value::Object(native));
        }
        let init_string = heap.intern("init");
        Self {
            stack: Vec::new(),
            frames: Vec::new(),
            globals,
            constants: Vec::new(),
            open_upvalues: Vec::new(),
            heap,
            init_string,
            created_at: SystemTime::now(),
            gc_stress: false,
            output,
        }
    }

    /// Seconds since this interpreter was created; the value `clock()`
    /// returns.
    pub fn uptime(&self) -> f64 {
        self.created_at
            .elapsed()
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or(0.0)
    }

    /// Forces a collection before every instruction dispatch. Observable
    /// behavior must not depend on this switch.
    pub fn set_gc_stress(&mut self, on: bool) {
        self.gc_stress = on;
    }

    pub fn interpret(
        &mut self,
        source: &str,
        reporter: &mut dyn Reporter,
    ) -> Result<(), InterpretError> {
        let function = Compiler::compile(source, &mut self.heap, &mut self.constants, reporter)
            .map_err(|_| InterpretError::Compile)?;
        if cfg!(feature = "debug-bytecode") {
            print!(
                "{}",
                debug::disassemble(
                    &self.heap.fun(function).chunk,
                    &self.constants,
                    &self.heap,
                    "script",
                )
            );
        }
        let closure = self.heap.alloc_closure(function, Vec::new());
        self.push(Value::Object(closure));
        self.frames.push(CallFrame {
            closure,
            pc: 0,
            bp: 0,
        });
        self.run().map_err(|err| {
            self.reset();
            InterpretError::Runtime(err)
        })
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    //>> Frame and stack plumbing

    fn frame(&self) -> &CallFrame {
        self.frames.last().unwrap()
    }

    fn frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().unwrap()
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().unwrap();
        let byte = self.heap.closure_chunk(frame.closure).byte(frame.pc);
        frame.pc += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        (self.read_byte() as u16) << 8 | self.read_byte() as u16
    }

    fn read_constant(&mut self) -> Value {
        let idx = self.read_byte() as usize;
        self.constants[idx]
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().unwrap()
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn runtime_error(&self, msg: String) -> RuntimeError {
        let mut frames = Vec::new();
        for (idx, frame) in self.frames.iter().enumerate().rev() {
            let fun = self.heap.fun(self.heap.closure(frame.closure).fun);
            let name = self.heap.string(fun.name);
            frames.push(BacktraceFrame {
                line: fun.chunk.line_at(frame.pc.saturating_sub(1)),
                name: if name.is_empty() {
                    "script".to_string()
                } else {
                    name.to_string()
                },
                parens: idx != 0,
            });
        }
        RuntimeError {
            msg,
            backtrace: Backtrace { frames },
        }
    }

    //>> Upvalues

    fn capture_upvalue(&mut self, slot: usize) -> GcRef {
        let mut insert_at = self.open_upvalues.len();
        for (i, upvalue) in self.open_upvalues.iter().enumerate() {
            let open_slot = self.heap.open_slot(*upvalue);
            if open_slot == slot {
                return *upvalue;
            }
            if open_slot < slot {
                insert_at = i;
                break;
            }
        }
        let created = self.heap.alloc_upvalue(slot);
        self.open_upvalues.insert(insert_at, created);
        created
    }

    /// Closes every open upvalue at or above `from`, lifting the captured
    /// value off the stack before its slot is reused.
    fn close_upvalues(&mut self, from: usize) {
        loop {
            let first = match self.open_upvalues.first() {
                Some(upvalue) => *upvalue,
                None => break,
            };
            let slot = self.heap.open_slot(first);
            if slot < from {
                break;
            }
            let value = self.stack[slot];
            self.heap.close_upvalue(first, value);
            self.open_upvalues.remove(0);
        }
    }

    //>> Calls

    fn call_closure(&mut self, closure: GcRef, argc: usize) -> Result<(), RuntimeError> {
        let arity = self.heap.fun(self.heap.closure(closure).fun).arity as usize;
        if argc != arity {
            return Err(self.runtime_error(format!(
                "Expected {} arguments but got {}.",
                arity, argc
            )));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow.".to_string()));
        }
        self.frames.push(CallFrame {
            closure,
            pc: 0,
            bp: self.stack.len() - argc - 1,
        });
        Ok(())
    }

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), RuntimeError> {
        enum Callee {
            Closure,
            Native(u8, NativeFn),
            Class,
            Bound(GcRef, Value),
            Other,
        }

        if let Value::Object(r) = callee {
            let kind = match &self.heap.get(r).kind {
                ObjKind::Closure(_) => Callee::Closure,
                ObjKind::Native(native) => Callee::Native(native.arity, native.fun),
                ObjKind::Class(_) => Callee::Class,
                ObjKind::Bound(bound) => Callee::Bound(bound.method, bound.receiver),
                _ => Callee::Other,
            };
            match kind {
                Callee::Closure => return self.call_closure(r, argc),
                Callee::Native(arity, fun) => {
                    if argc != arity as usize {
                        return Err(self.runtime_error(format!(
                            "Expected {} arguments but got {}.",
                            arity, argc
                        )));
                    }
                    let result = fun(self, argc).map_err(|msg| self.runtime_error(msg))?;
                    self.stack.truncate(self.stack.len() - argc - 1);
                    self.push(result);
                    return Ok(());
                }
                Callee::Class => {
                    let idx = self.stack.len() - argc - 1;
                    let instance = self.heap.alloc_instance(r);
                    self.stack[idx] = Value::Object(instance);
                    let init = Value::Object(self.init_string);
                    let hash = self.heap.value_hash(init);
                    return match self.heap.class(r).methods.get(init, hash) {
                        Some(init_method) => self.call_closure(init_method.as_object(), argc),
                        None if argc != 0 => Err(self
                            .runtime_error(format!("Expected 0 arguments but got {}.", argc))),
                        None => Ok(()),
                    };
                }
                Callee::Bound(method, receiver) => {
                    // the receiver takes the callee slot so methods see it
                    // as `this` in slot 0
                    let idx = self.stack.len() - argc - 1;
                    self.stack[idx] = receiver;
                    return self.call_closure(method, argc);
                }
                Callee::Other => {}
            }
        }
        Err(self.runtime_error("Can only call functions and classes.".to_string()))
    }

    fn instance_at(&self, distance: usize, missing: &str) -> Result<GcRef, RuntimeError> {
        match self.peek(distance) {
            Value::Object(r) if matches!(self.heap.get(r).kind, ObjKind::Instance(_)) => Ok(r),
            _ => Err(self.runtime_error(missing.to_string())),
        }
    }

    //>> Garbage collection

    fn collect_garbage(&mut self) {
        let mut worklist: Vec<GcRef> = Vec::new();
        for value in &self.stack {
            if let Value::Object(r) = value {
                worklist.push(*r);
            }
        }
        for value in &self.constants {
            if let Value::Object(r) = value {
                worklist.push(*r);
            }
        }
        for (key, value) in self.globals.iter() {
            if let Value::Object(r) = key {
                worklist.push(r);
            }
            if let Value::Object(r) = value {
                worklist.push(r);
            }
        }
        for frame in &self.frames {
            worklist.push(frame.closure);
        }
        worklist.extend(self.open_upvalues.iter().copied());
        worklist.push(self.init_string);
        self.heap.collect(worklist);
    }

    //>> Dispatch

    fn run(&mut self) -> Result<(), RuntimeError> {
        macro_rules! binary_num_op {
            ($op:tt, $wrap:expr) => {{
                let b = self.pop();
                let a = self.pop();
                match (a, b) {
                    (Value::Number(a), Value::Number(b)) => self.push($wrap(a $op b)),
                    _ => return Err(self.runtime_error("Operands must be numbers.".to_string())),
                }
            }};
        }

        loop {
            if self.gc_stress || self.heap.should_collect() {
                self.collect_garbage();
            }

            if cfg!(feature = "debug-execution") {
                let frame = self.frame();
                let chunk = self.heap.closure_chunk(frame.closure);
                print!(
                    "{}",
                    debug::disassemble_instr_at(chunk, &self.constants, &self.heap, frame.pc).0
                );
            }

            match Instruction::from(self.read_byte()) {
                CONSTANT => {
                    let value = self.read_constant();
                    self.push(value);
                }
                NIL => self.push(Value::Nil),
                TRUE => self.push(Value::Bool(true)),
                FALSE => self.push(Value::Bool(false)),
                NEGATIVE => match self.pop() {
                    Value::Number(n) => self.push(Value::Number(-n)),
                    _ => return Err(self.runtime_error("Operand must be a number.".to_string())),
                },
                NOT => {
                    let value = self.pop();
                    self.push(Value::Bool(!value.is_truthy()));
                }
                ADD => {
                    let b = self.pop();
                    let a = self.pop();
                    match (a, b) {
                        (Value::Number(a), Value::Number(b)) => self.push(Value::Number(a + b)),
                        (Value::Object(x), Value::Object(y))
                            if matches!(self.heap.get(x).kind, ObjKind::Str(_))
                                && matches!(self.heap.get(y).kind, ObjKind::Str(_)) =>
                        {
                            let concat =
                                format!("{}{}", self.heap.string(x), self.heap.string(y));
                            let interned = self.heap.intern(&concat);
                            self.push(Value::Object(interned));
                        }
                        _ => {
                            return Err(self.runtime_error(
                                "Operands must be two numbers or two strings.".to_string(),
                            ))
                        }
                    }
                }
                MINUS => binary_num_op!(-, Value::Number),
                MUL => binary_num_op!(*, Value::Number),
                DIV => binary_num_op!(/, Value::Number),
                EQUAL_EQUAL => {
                    let b = self.pop();
                    let a = self.pop();
                    let equal = self.heap.values_equal(a, b);
                    self.push(Value::Bool(equal));
                }
                BANG_EQUAL => {
                    let b = self.pop();
                    let a = self.pop();
                    let equal = self.heap.values_equal(a, b);
                    self.push(Value::Bool(!equal));
                }
                GREATER => binary_num_op!(>, Value::Bool),
                GREATER_EQUAL => binary_num_op!(>=, Value::Bool),
                LESS => binary_num_op!(<, Value::Bool),
                LESS_EQUAL => binary_num_op!(<=, Value::Bool),
                PRINT => {
                    let value = self.pop();
                    let shown = self.heap.value_to_string(value);
                    writeln!(self.output, "{}", shown).ok();
                }
                POP => {
                    self.pop();
                }
                CLOSE => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                GLOBAL => {
                    let name = self.read_constant();
                    let value = self.pop();
                    let hash = self.heap.value_hash(name);
                    self.globals.set(name, hash, value);
                }
                SET_GLOBAL => {
                    let name = self.read_constant();
                    let hash = self.heap.value_hash(name);
                    if self.globals.get(name, hash).is_none() {
                        return Err(self.runtime_error(format!(
                            "Undefined variable '{}'.",
                            self.heap.value_to_string(name)
                        )));
                    }
                    let value = self.peek(0);
                    self.globals.set(name, hash, value);
                }
                GET_GLOBAL => {
                    let name = self.read_constant();
                    let hash = self.heap.value_hash(name);
                    match self.globals.get(name, hash) {
                        Some(value) => self.push(value),
                        None => {
                            return Err(self.runtime_error(format!(
                                "Undefined variable '{}'.",
                                self.heap.value_to_string(name)
                            )))
                        }
                    }
                }
                SET_LOCAL => {
                    let slot = self.read_byte() as usize;
                    let bp = self.frame().bp;
                    self.stack[bp + slot] = self.peek(0);
                }
                GET_LOCAL => {
                    let slot = self.read_byte() as usize;
                    let bp = self.frame().bp;
                    self.push(self.stack[bp + slot]);
                }
                SET_UPVALUE => {
                    let idx = self.read_byte() as usize;
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[idx];
                    let value = self.peek(0);
                    match self.heap.upvalue(upvalue) {
                        UpValue::Open(slot) => {
                            let slot = *slot;
                            self.stack[slot] = value;
                        }
                        UpValue::Closed(_) => self.heap.set_upvalue(upvalue, value),
                    }
                }
                GET_UPVALUE => {
                    let idx = self.read_byte() as usize;
                    let upvalue = self.heap.closure(self.frame().closure).upvalues[idx];
                    let value = match self.heap.upvalue(upvalue) {
                        UpValue::Open(slot) => self.stack[*slot],
                        UpValue::Closed(value) => *value,
                    };
                    self.push(value);
                }
                JMP => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().pc += offset;
                }
                JMP_ON_FALSE => {
                    let offset = self.read_u16() as usize;
                    if !self.peek(0).is_truthy() {
                        self.frame_mut().pc += offset;
                    }
                }
                JMP_BACK => {
                    let offset = self.read_u16() as usize;
                    self.frame_mut().pc -= offset;
                }
                CLOSURE => {
                    let proto = self.read_constant().as_object();
                    let count = self.heap.fun(proto).upvalue_count;
                    let mut upvalues = Vec::with_capacity(count);
                    for _ in 0..count {
                        let idx = self.read_byte() as usize;
                        let is_local = self.read_byte() != 0;
                        if is_local {
                            let bp = self.frame().bp;
                            upvalues.push(self.capture_upvalue(bp + idx));
                        } else {
                            upvalues.push(self.heap.closure(self.frame().closure).upvalues[idx]);
                        }
                    }
                    let closure = self.heap.alloc_closure(proto, upvalues);
                    self.push(Value::Object(closure));
                }
                CALL => {
                    let argc = self.read_byte() as usize;
                    let callee = self.peek(argc);
                    self.call_value(callee, argc)?;
                }
                RETURN => {
                    let result = self.pop();
                    let frame = self.frames.pop().unwrap();
                    self.close_upvalues(frame.bp);
                    self.stack.truncate(frame.bp);
                    if self.frames.is_empty() {
                        return Ok(());
                    }
                    self.push(result);
                }
                CLASS => {
                    let name = self.read_constant();
                    let class = self.heap.alloc_class(name.as_object());
                    self.push(Value::Object(class));
                }
                DERIVE => {
                    let methods: Vec<(Value, Value)> = match self.peek(1) {
                        Value::Object(r) => match &self.heap.get(r).kind {
                            ObjKind::Class(class) => class.methods.iter().collect(),
                            _ => {
                                return Err(self
                                    .runtime_error("Superclass must be a class.".to_string()))
                            }
                        },
                        _ => {
                            return Err(
                                self.runtime_error("Superclass must be a class.".to_string())
                            )
                        }
                    };
                    // the subclass's table is still empty here, so the copy
                    // order cannot be observed
                    let subclass = self.peek(0).as_object();
                    for (key, value) in methods {
                        let hash = self.heap.value_hash(key);
                        self.heap.class_mut(subclass).methods.set(key, hash, value);
                    }
                    self.pop();
                }
                METHOD => {
                    let name = self.read_constant();
                    let method = self.peek(0);
                    let class = self.peek(1).as_object();
                    let hash = self.heap.value_hash(name);
                    self.heap.class_mut(class).methods.set(name, hash, method);
                    self.pop();
                }
                GET_FIELD => {
                    let name = self.read_constant();
                    let instance = self.instance_at(0, "Only instances have properties.")?;
                    let hash = self.heap.value_hash(name);
                    if let Some(value) = self.heap.instance(instance).fields.get(name, hash) {
                        self.pop();
                        self.push(value);
                        continue;
                    }
                    let class = self.heap.instance(instance).class;
                    match self.heap.class(class).methods.get(name, hash) {
                        Some(method) => {
                            let receiver = self.pop();
                            let bound = self.heap.alloc_bound(receiver, method.as_object());
                            self.push(Value::Object(bound));
                        }
                        None => {
                            return Err(self.runtime_error(format!(
                                "Undefined property '{}'.",
                                self.heap.value_to_string(name)
                            )))
                        }
                    }
                }
                SET_FIELD => {
                    let name = self.read_constant();
                    let instance = self.instance_at(1, "Only instances have fields.")?;
                    let value = self.peek(0);
                    let hash = self.heap.value_hash(name);
                    self.heap.instance_mut(instance).fields.set(name, hash, value);
                    let value = self.pop();
                    self.pop();
                    self.push(value);
                }
                INVOKE => {
                    let argc = self.read_byte() as usize;
                    let name = self.read_constant();
                    let instance = self.instance_at(argc, "Only instances have methods.")?;
                    let hash = self.heap.value_hash(name);
                    // a stored callable field shadows the method
                    if let Some(field) = self.heap.instance(instance).fields.get(name, hash) {
                        let idx = self.stack.len() - argc - 1;
                        self.stack[idx] = field;
                        self.call_value(field, argc)?;
                        continue;
                    }
                    let class = self.heap.instance(instance).class;
                    match self.heap.class(class).methods.get(name, hash) {
                        Some(method) => self.call_closure(method.as_object(), argc)?,
                        None => {
                            return Err(self.runtime_error(format!(
                                "Undefined property '{}'.",
                                self.heap.value_to_string(name)
                            )))
                        }
                    }
                }
                GET_SUPER => {
                    let name = self.read_constant();
                    let superclass = self.pop();
                    let receiver = self.pop();
                    let class = match superclass {
                        Value::Object(r)
                            if matches!(self.heap.get(r).kind, ObjKind::Class(_)) =>
                        {
                            r
                        }
                        _ => {
                            return Err(
                                self.runtime_error("Superclass must be a class.".to_string())
                            )
                        }
                    };
                    let hash = self.heap.value_hash(name);
                    match self.heap.class(class).methods.get(name, hash) {
                        Some(method) => {
                            let bound = self.heap.alloc_bound(receiver, method.as_object());
                            self.push(Value::Object(bound));
                        }
                        None => {
                            return Err(self.runtime_error(format!(
                                "Undefined property '{}'.",
                                self.heap.value_to_string(name)
                            )))
                        }
                    }
                }
                UNKNOWN => unreachable!(),
            }
        }
    }
}
