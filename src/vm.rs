// File: src/vm.rs
//
// The Ember virtual machine: a single-threaded bytecode interpreter with
// an operand stack, call frames, an exception-handler stack, and a
// VM-owned garbage-collected heap. One VM is one isolated execution
// unit; hosts get parallelism by owning multiple VMs.

use crate::bytecode::{Constant, FunctionProto, OpCode, UpvalueSource};
use crate::compiler::Compiler;
use crate::errors::{EmberError, ErrorKind, SourceLocation, StackEntry};
use crate::heap::{Closure, ErrorObj, Heap};
use crate::lexer::tokenize;
use crate::module::{validate_module_name, Module, ModuleLoader, MODULE_EXTENSION};
use crate::natives::{self, NativeDef, NativeFn};
use crate::parser::Parser;
use crate::value::{Handle, NativeId, Value};
use crate::vfs::{MountMode, Vfs};
use ahash::AHashMap;
use std::rc::Rc;

/// Operand stack capacity; overflow is a security error.
pub const STACK_MAX: usize = 1024;
/// Call-frame limit; exceeding it is the stack-depth security error.
pub const FRAMES_MAX: usize = 64;
/// Simultaneously active exception handlers.
pub const HANDLERS_MAX: usize = 64;

/// Per-call record: closure, instruction pointer, base of the locals
/// region on the operand stack, and the handler/finally depths at entry.
struct CallFrame {
    closure: Handle,
    proto: Rc<FunctionProto>,
    ip: usize,
    base: usize,
    handler_depth: usize,
    finally_depth: usize,
}

/// An installed exception handler. Catch regions carry a binding slot;
/// finally regions carry a finally ip and no binding.
struct HandlerFrame {
    catch_ip: usize,
    finally_ip: Option<usize>,
    binding_slot: Option<usize>,
    frame_index: usize,
    stack_height: usize,
    finally_depth: usize,
}

/// What a finally block resumes once it completes.
enum FinallyAction {
    /// Entered through normal control flow; continue at `resume_ip`
    Normal { resume_ip: usize },
    /// Entered while unwinding; continue propagating `value`
    Propagate { value: Value },
}

enum OutputSink {
    Stdout,
    Capture(String),
}

pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    pub(crate) heap: Heap,
    globals: AHashMap<String, Value>,
    /// Globals of evals suspended by module loading (GC roots)
    globals_stack: Vec<AHashMap<String, Value>>,
    handlers: Vec<HandlerFrame>,
    finally_stack: Vec<FinallyAction>,
    natives: Vec<NativeDef>,
    /// argv slices currently borrowed by native calls (GC roots)
    native_args: Vec<Vec<Value>>,
    loader: ModuleLoader,
    pub(crate) vfs: Vfs,
    last_error: Option<EmberError>,
    out: OutputSink,
    source_name: Option<String>,
    current_line: usize,
    trace: bool,
}

impl Vm {
    /// Create a VM with an initialized heap, all built-ins registered,
    /// and the default mounts installed.
    pub fn new() -> Self {
        let mut vm = Vm {
            stack: Vec::with_capacity(64),
            frames: Vec::new(),
            heap: Heap::new(),
            globals: AHashMap::new(),
            globals_stack: Vec::new(),
            handlers: Vec::new(),
            finally_stack: Vec::new(),
            natives: Vec::new(),
            native_args: Vec::new(),
            loader: ModuleLoader::new(),
            vfs: Vfs::with_defaults(),
            last_error: None,
            out: OutputSink::Stdout,
            source_name: None,
            current_line: 0,
            trace: std::env::var("EMBER_TRACE").is_ok(),
        };
        for def in natives::registry() {
            vm.natives.push(def.clone());
        }
        vm.install_builtin_globals();
        if let Ok(root) = crate::package::packages_root() {
            if root.is_dir() {
                let _ = vm.vfs.mount("/packages", root, MountMode::ReadOnly);
                let _ = vm.loader.add_search_path("/packages");
            }
        }
        if let Ok(spec) = std::env::var("MOUNTS") {
            let _ = vm.vfs.apply_mount_spec(&spec);
        }
        vm
    }

    fn install_builtin_globals(&mut self) {
        for (id, def) in self.natives.iter().enumerate() {
            self.globals.insert(def.name.clone(), Value::Native(NativeId(id as u32)));
        }
    }

    /// Install a host function. It becomes a `native` value in the
    /// globals table under `name`.
    pub fn register_native(&mut self, name: &str, arity: usize, func: NativeFn) -> NativeId {
        let id = NativeId(self.natives.len() as u32);
        self.natives.push(NativeDef { name: name.to_string(), arity, func });
        self.globals.insert(name.to_string(), Value::Native(id));
        id
    }

    // === Output ===

    /// Route `print` output into an internal buffer instead of stdout
    pub fn capture_output(&mut self) {
        self.out = OutputSink::Capture(String::new());
    }

    pub fn take_output(&mut self) -> String {
        match &mut self.out {
            OutputSink::Capture(buf) => std::mem::take(buf),
            OutputSink::Stdout => String::new(),
        }
    }

    pub(crate) fn write_line(&mut self, line: &str) {
        match &mut self.out {
            OutputSink::Stdout => println!("{}", line),
            OutputSink::Capture(buf) => {
                buf.push_str(line);
                buf.push('\n');
            }
        }
    }

    // === Error API ===

    pub fn has_error(&self) -> bool {
        self.last_error.is_some()
    }

    pub fn get_error(&self) -> Option<&EmberError> {
        self.last_error.as_ref()
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    // === Introspection (tests and embedders) ===

    pub fn stack_top(&self) -> usize {
        self.stack.len()
    }

    /// Inspect an operand-stack slot (0 is the bottom)
    pub fn stack_value(&self, index: usize) -> Option<Value> {
        self.stack.get(index).copied()
    }

    pub fn exception_handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn finally_block_count(&self) -> usize {
        self.finally_stack.len()
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.get(name).copied()
    }

    pub fn set_global(&mut self, name: &str, value: Value) {
        self.globals.insert(name.to_string(), value);
    }

    pub fn heap_live_count(&self) -> usize {
        self.heap.live_count()
    }

    pub fn add_module_path(&mut self, path: &str) -> Result<(), EmberError> {
        if !self.vfs.dir_exists(path) {
            return Err(EmberError::import(format!("Module path '{}' does not exist", path)));
        }
        self.loader.add_search_path(path)
    }

    pub fn mount(
        &mut self,
        virtual_prefix: &str,
        host_prefix: impl Into<std::path::PathBuf>,
        mode: MountMode,
    ) -> Result<(), EmberError> {
        self.vfs.mount(virtual_prefix, host_prefix, mode)
    }

    /// Apply a `--mount` style entry: `virtual:host[:ro|:rw]`
    pub fn mount_spec(&mut self, entry: &str) -> Result<(), EmberError> {
        self.vfs.apply_mount_entry(entry)
    }

    /// Format a value with the heap's printable format
    pub fn format_value(&self, value: &Value) -> String {
        self.heap.format_value(value)
    }

    // === Value construction for hosts and natives ===
    //
    // Allocation never collects; the collector runs at instruction
    // boundaries in the interpreter loop, where every live object is
    // reachable from a root.

    pub fn make_string(&mut self, s: impl Into<String>) -> Result<Value, EmberError> {
        Ok(Value::Str(self.heap.alloc_string(s.into())?))
    }

    pub fn make_array(&mut self, items: Vec<Value>) -> Result<Value, EmberError> {
        Ok(Value::Array(self.heap.alloc_array(items)?))
    }

    pub fn make_map(&mut self) -> Result<Value, EmberError> {
        Ok(Value::Map(self.heap.alloc_map()?))
    }

    pub fn make_set(&mut self) -> Result<Value, EmberError> {
        Ok(Value::Set(self.heap.alloc_set()?))
    }

    pub fn make_error(&mut self, kind: ErrorKind, message: String) -> Result<Value, EmberError> {
        let obj = ErrorObj {
            kind,
            message,
            location: SourceLocation::unknown(),
            call_stack: Vec::new(),
        };
        Ok(Value::Error(self.heap.alloc_error(obj)?))
    }

    pub fn get_string(&self, value: &Value) -> Option<&str> {
        match value {
            Value::Str(h) => Some(self.heap.get_str(*h)),
            _ => None,
        }
    }

    // === Evaluation ===

    /// Parse and execute a source string. On success the expression
    /// value of a trailing expression statement is returned (nil
    /// otherwise); on failure the error is also retrievable through the
    /// error API until cleared or replaced by the next evaluation.
    pub fn eval(&mut self, source: &str) -> Result<Value, EmberError> {
        self.last_error = None;
        let result = self.eval_source(source, None);
        if let Err(err) = &result {
            self.last_error = Some(err.clone());
        }
        result
    }

    /// `eval` with a file name attached to diagnostics
    pub fn eval_file_source(&mut self, source: &str, name: &str) -> Result<Value, EmberError> {
        self.last_error = None;
        let result = self.eval_source(source, Some(name.to_string()));
        if let Err(err) = &result {
            self.last_error = Some(err.clone());
        }
        result
    }

    /// Invoke a named global function (script or native) with the given
    /// arguments; returns the result value.
    pub fn call(&mut self, name: &str, args: &[Value]) -> Result<Value, EmberError> {
        self.last_error = None;
        let result = self.call_inner(name, args);
        if let Err(err) = &result {
            self.last_error = Some(err.clone());
        }
        result
    }

    fn call_inner(&mut self, name: &str, args: &[Value]) -> Result<Value, EmberError> {
        let callee = *self
            .globals
            .get(name)
            .ok_or_else(|| EmberError::runtime(format!("Undefined function '{}'", name)))?;

        let stack_floor = self.stack.len();
        let frame_floor = self.frames.len();
        let run = (|| -> Result<Value, EmberError> {
            self.push(callee)?;
            for arg in args {
                self.push(*arg)?;
            }
            let pushed_frame = self.call_value(args.len(), frame_floor)?;
            if pushed_frame {
                self.run(frame_floor)
            } else {
                Ok(self.stack.pop().unwrap_or(Value::Nil))
            }
        })();
        match run {
            Ok(value) => {
                self.stack.truncate(stack_floor);
                Ok(value)
            }
            Err(err) => {
                self.stack.truncate(stack_floor);
                self.frames.truncate(frame_floor);
                Err(err)
            }
        }
    }

    fn eval_source(
        &mut self,
        source: &str,
        chunk_name: Option<String>,
    ) -> Result<Value, EmberError> {
        let source = strip_shebang(source);

        let tokens = tokenize(source).map_err(|e| self.attach_source_line(e, source))?;
        let stmts = Parser::new(tokens)
            .parse()
            .map_err(|e| self.attach_source_line(e, source))?;
        let proto = Compiler::new()
            .compile_script(&stmts, chunk_name.as_deref().unwrap_or("<script>"))
            .map_err(|e| self.attach_source_line(e, source))?;

        let saved_name = self.source_name.clone();
        self.source_name = chunk_name;

        let stack_floor = self.stack.len();
        let frame_floor = self.frames.len();
        let handler_floor = self.handlers.len();
        let finally_floor = self.finally_stack.len();

        let result = (|| -> Result<Value, EmberError> {
            let closure = self.heap.alloc_closure(Closure { proto, upvalues: Vec::new() })?;
            self.push(Value::Function(closure))?;
            self.call_value(0, frame_floor)?;
            self.run(frame_floor)
        })();

        self.source_name = saved_name;
        match result {
            Ok(value) => {
                debug_assert_eq!(self.stack.len(), stack_floor);
                debug_assert_eq!(self.handlers.len(), handler_floor);
                debug_assert_eq!(self.finally_stack.len(), finally_floor);
                Ok(value)
            }
            Err(err) => {
                // Restore every count to its pre-eval value so the VM
                // stays usable after a failed evaluation.
                self.stack.truncate(stack_floor);
                self.frames.truncate(frame_floor);
                self.handlers.truncate(handler_floor);
                self.finally_stack.truncate(finally_floor);
                Err(err)
            }
        }
    }

    fn attach_source_line(&self, mut err: EmberError, source: &str) -> EmberError {
        if err.location.is_known() && err.source_line.is_none() {
            if let Some(line) = source.lines().nth(err.location.line - 1) {
                err = err.with_source(line.to_string());
            }
        }
        if err.location.file.is_none() {
            err.location.file = self.source_name.clone();
        }
        err
    }

    // === Interpreter loop ===

    fn push(&mut self, value: Value) -> Result<(), EmberError> {
        if self.stack.len() >= STACK_MAX {
            return Err(EmberError::security("[SECURITY] operand stack overflow"));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("operand stack underflow")
    }

    fn run(&mut self, frame_floor: usize) -> Result<Value, EmberError> {
        loop {
            if self.heap.should_collect() {
                self.collect_garbage();
            }

            let frame = self.frames.last_mut().expect("active call frame");
            if frame.ip >= frame.proto.chunk.code.len() {
                if let Some(result) = self.do_return(Value::Nil, frame_floor) {
                    return Ok(result);
                }
                continue;
            }
            let ip = frame.ip;
            let op = frame.proto.chunk.code[ip].clone();
            let line = frame.proto.chunk.line_at(ip);
            frame.ip += 1;
            self.current_line = line;

            if self.trace {
                eprintln!(
                    "[trace] {}:{:04} {:?} (stack {})",
                    self.frames.last().map(|f| f.proto.name.as_str()).unwrap_or("?"),
                    ip,
                    op,
                    self.stack.len()
                );
            }

            match self.execute_op(op, frame_floor) {
                Ok(Some(result)) => return Ok(result),
                Ok(None) => {}
                Err(err) => self.raise(err, frame_floor)?,
            }
        }
    }

    /// Execute one instruction. `Ok(Some(v))` means the frame at
    /// `frame_floor` returned with value `v`.
    fn execute_op(
        &mut self,
        op: OpCode,
        frame_floor: usize,
    ) -> Result<Option<Value>, EmberError> {
        match op {
            OpCode::LoadConst(idx) => {
                let constant = self.current_proto().chunk.constants[idx].clone();
                let value = match constant {
                    Constant::Number(n) => Value::Number(n),
                    Constant::String(s) => Value::Str(self.heap.alloc_string(s)?),
                    Constant::Function(proto) => {
                        let closure =
                            self.heap.alloc_closure(Closure { proto, upvalues: Vec::new() })?;
                        Value::Function(closure)
                    }
                };
                self.push(value)?;
            }
            OpCode::PushNil => self.push(Value::Nil)?,
            OpCode::PushTrue => self.push(Value::Bool(true))?,
            OpCode::PushFalse => self.push(Value::Bool(false))?,
            OpCode::Pop => {
                self.pop();
            }
            OpCode::Dup => {
                let top = *self.stack.last().expect("operand stack underflow");
                self.push(top)?;
            }

            OpCode::LoadLocal(slot) => {
                let base = self.current_frame().base;
                let value = self.stack[base + slot];
                self.push(value)?;
            }
            OpCode::StoreLocal(slot) => {
                let value = self.pop();
                let base = self.current_frame().base;
                self.stack[base + slot] = value;
            }
            OpCode::LoadGlobal(name) => {
                let value = *self.globals.get(&name).ok_or_else(|| {
                    EmberError::runtime(format!("Undefined variable '{}'", name))
                })?;
                self.push(value)?;
            }
            OpCode::StoreGlobal(name) => {
                let value = self.pop();
                self.globals.insert(name, value);
            }

            OpCode::NewCell(slot) => {
                let base = self.current_frame().base;
                let inner = self.stack[base + slot];
                let cell = self.heap.alloc_cell(inner)?;
                self.stack[base + slot] = Value::Cell(cell);
            }
            OpCode::LoadCell(slot) => {
                let base = self.current_frame().base;
                match self.stack[base + slot] {
                    Value::Cell(cell) => {
                        let value = self.heap.get_cell(cell);
                        self.push(value)?;
                    }
                    other => panic!("expected cell in local slot, found {:?}", other),
                }
            }
            OpCode::StoreCell(slot) => {
                let value = self.pop();
                let base = self.current_frame().base;
                match self.stack[base + slot] {
                    Value::Cell(cell) => self.heap.set_cell(cell, value),
                    other => panic!("expected cell in local slot, found {:?}", other),
                }
            }
            OpCode::LoadUpvalue(idx) => {
                let closure = self.current_frame().closure;
                let cell = self.heap.get_closure(closure).upvalues[idx];
                let value = self.heap.get_cell(cell);
                self.push(value)?;
            }
            OpCode::StoreUpvalue(idx) => {
                let value = self.pop();
                let closure = self.current_frame().closure;
                let cell = self.heap.get_closure(closure).upvalues[idx];
                self.heap.set_cell(cell, value);
            }

            OpCode::Add => {
                let right = self.pop();
                let left = self.pop();
                let value = match (left, right) {
                    (Value::Number(a), Value::Number(b)) => Value::Number(a + b),
                    (Value::Str(a), Value::Str(b)) => {
                        let mut s = String::with_capacity(
                            self.heap.get_str(a).len() + self.heap.get_str(b).len(),
                        );
                        s.push_str(self.heap.get_str(a));
                        s.push_str(self.heap.get_str(b));
                        Value::Str(self.heap.alloc_string(s)?)
                    }
                    (a, b) => {
                        return Err(EmberError::type_error(format!(
                            "Cannot add {} and {}",
                            a.type_name(),
                            b.type_name()
                        )))
                    }
                };
                self.push(value)?;
            }
            OpCode::Sub => self.numeric_binary(|a, b| a - b, "subtract")?,
            OpCode::Mul => self.numeric_binary(|a, b| a * b, "multiply")?,
            OpCode::Div => {
                let right = self.pop();
                let left = self.pop();
                match (left, right) {
                    (Value::Number(_), Value::Number(b)) if b == 0.0 => {
                        return Err(EmberError::runtime("Division by zero"))
                    }
                    (Value::Number(a), Value::Number(b)) => self.push(Value::Number(a / b))?,
                    (a, b) => {
                        return Err(EmberError::type_error(format!(
                            "Cannot divide {} by {}",
                            a.type_name(),
                            b.type_name()
                        )))
                    }
                }
            }
            OpCode::Mod => {
                let right = self.pop();
                let left = self.pop();
                match (left, right) {
                    (Value::Number(_), Value::Number(b)) if b == 0.0 => {
                        return Err(EmberError::runtime("Division by zero"))
                    }
                    (Value::Number(a), Value::Number(b)) => self.push(Value::Number(a % b))?,
                    (a, b) => {
                        return Err(EmberError::type_error(format!(
                            "Cannot take {} modulo {}",
                            a.type_name(),
                            b.type_name()
                        )))
                    }
                }
            }
            OpCode::Negate => {
                let value = self.pop();
                match value {
                    Value::Number(n) => self.push(Value::Number(-n))?,
                    other => {
                        return Err(EmberError::type_error(format!(
                            "Cannot negate {}",
                            other.type_name()
                        )))
                    }
                }
            }

            OpCode::Not => {
                let value = self.pop();
                self.push(Value::Bool(!value.is_truthy()))?;
            }
            OpCode::Equal => {
                let right = self.pop();
                let left = self.pop();
                let eq = self.heap.values_equal(&left, &right);
                self.push(Value::Bool(eq))?;
            }
            OpCode::NotEqual => {
                let right = self.pop();
                let left = self.pop();
                let eq = self.heap.values_equal(&left, &right);
                self.push(Value::Bool(!eq))?;
            }
            OpCode::Less => self.compare(|o| o == std::cmp::Ordering::Less)?,
            OpCode::LessEqual => self.compare(|o| o != std::cmp::Ordering::Greater)?,
            OpCode::Greater => self.compare(|o| o == std::cmp::Ordering::Greater)?,
            OpCode::GreaterEqual => self.compare(|o| o != std::cmp::Ordering::Less)?,

            OpCode::Jump(target) | OpCode::JumpBack(target) => {
                self.current_frame_mut().ip = target;
            }
            OpCode::JumpIfFalse(target) => {
                let value = self.pop();
                if !value.is_truthy() {
                    self.current_frame_mut().ip = target;
                }
            }
            OpCode::JumpIfTrue(target) => {
                let value = self.pop();
                if value.is_truthy() {
                    self.current_frame_mut().ip = target;
                }
            }

            OpCode::Call(argc) => {
                self.call_value(argc, frame_floor)?;
            }
            OpCode::Return => {
                if let Some(result) = self.do_return(Value::Nil, frame_floor) {
                    return Ok(Some(result));
                }
            }
            OpCode::ReturnValue => {
                let value = self.pop();
                if let Some(result) = self.do_return(value, frame_floor) {
                    return Ok(Some(result));
                }
            }
            OpCode::MakeClosure(idx) => {
                let proto = match &self.current_proto().chunk.constants[idx] {
                    Constant::Function(proto) => proto.clone(),
                    other => panic!("MakeClosure on non-function constant {:?}", other),
                };
                let base = self.current_frame().base;
                let enclosing = self.current_frame().closure;
                let mut upvalues = Vec::with_capacity(proto.upvalues.len());
                for source in &proto.upvalues {
                    let cell = match source {
                        UpvalueSource::Local(slot) => match self.stack[base + slot] {
                            Value::Cell(cell) => cell,
                            other => panic!("captured slot holds {:?}, not a cell", other),
                        },
                        UpvalueSource::Upvalue(i) => self.heap.get_closure(enclosing).upvalues[*i],
                    };
                    upvalues.push(cell);
                }
                let closure = self.heap.alloc_closure(Closure { proto, upvalues })?;
                self.push(Value::Function(closure))?;
            }

            OpCode::MakeArray(count) => {
                let start = self.stack.len() - count;
                let items: Vec<Value> = self.stack[start..].to_vec();
                // Allocate before truncating so the elements stay rooted
                let handle = self.heap.alloc_array(items)?;
                self.stack.truncate(start);
                self.push(Value::Array(handle))?;
            }
            OpCode::MakeMap(count) => {
                let start = self.stack.len() - count * 2;
                let handle = self.heap.alloc_map()?;
                for i in 0..count {
                    let key = self.stack[start + i * 2];
                    let value = self.stack[start + i * 2 + 1];
                    self.heap.map_insert(handle, key, value);
                }
                self.stack.truncate(start);
                self.push(Value::Map(handle))?;
            }
            OpCode::IndexGet => {
                let index = self.pop();
                let object = self.pop();
                let value = self.index_get(object, index)?;
                self.push(value)?;
            }
            OpCode::IndexSet => {
                let value = self.pop();
                let index = self.pop();
                let object = self.pop();
                self.index_set(object, index, value)?;
            }
            OpCode::FieldGet(name) => {
                let object = self.pop();
                match object {
                    Value::Map(map) => {
                        let value = self.heap.map_get_str(map, &name).unwrap_or(Value::Nil);
                        self.push(value)?;
                    }
                    other => {
                        return Err(EmberError::type_error(format!(
                            "Cannot read field '{}' of {}",
                            name,
                            other.type_name()
                        )))
                    }
                }
            }

            OpCode::Import(name) => {
                self.import_module(&name)?;
            }

            OpCode::BeginTry { catch_ip, finally_ip, binding_slot } => {
                if self.handlers.len() >= HANDLERS_MAX {
                    return Err(EmberError::security(
                        "[SECURITY] exception handler limit exceeded",
                    ));
                }
                self.handlers.push(HandlerFrame {
                    catch_ip,
                    finally_ip,
                    binding_slot,
                    frame_index: self.frames.len() - 1,
                    stack_height: self.stack.len(),
                    finally_depth: self.finally_stack.len(),
                });
            }
            OpCode::EndTry => {
                let handler = self.handlers.pop().expect("EndTry without handler");
                if let Some(finally_ip) = handler.finally_ip {
                    let resume_ip = self.current_frame().ip;
                    self.finally_stack.push(FinallyAction::Normal { resume_ip });
                    self.current_frame_mut().ip = finally_ip;
                }
            }
            OpCode::Throw => {
                let value = self.pop();
                self.unwind_value(value, frame_floor, None)?;
            }
            OpCode::FinallyBegin => {
                debug_assert!(!self.finally_stack.is_empty(), "finally entered without action");
            }
            OpCode::FinallyEnd => {
                let action = self.finally_stack.pop().expect("FinallyEnd without action");
                match action {
                    FinallyAction::Normal { resume_ip } => {
                        self.current_frame_mut().ip = resume_ip;
                    }
                    FinallyAction::Propagate { value } => {
                        self.unwind_value(value, frame_floor, None)?;
                    }
                }
            }
        }
        Ok(None)
    }

    fn current_frame(&self) -> &CallFrame {
        self.frames.last().expect("active call frame")
    }

    fn current_frame_mut(&mut self) -> &mut CallFrame {
        self.frames.last_mut().expect("active call frame")
    }

    fn current_proto(&self) -> &Rc<FunctionProto> {
        &self.current_frame().proto
    }

    fn numeric_binary(
        &mut self,
        op: fn(f64, f64) -> f64,
        verb: &str,
    ) -> Result<(), EmberError> {
        let right = self.pop();
        let left = self.pop();
        match (left, right) {
            (Value::Number(a), Value::Number(b)) => self.push(Value::Number(op(a, b))),
            (a, b) => Err(EmberError::type_error(format!(
                "Cannot {} {} and {}",
                verb,
                a.type_name(),
                b.type_name()
            ))),
        }
    }

    /// Ordering is defined for number-number and (lexicographically) for
    /// string-string; other pairs are a type error.
    fn compare(&mut self, accept: fn(std::cmp::Ordering) -> bool) -> Result<(), EmberError> {
        let right = self.pop();
        let left = self.pop();
        let ordering = match (left, right) {
            (Value::Number(a), Value::Number(b)) => a.partial_cmp(&b),
            (Value::Str(a), Value::Str(b)) => {
                Some(self.heap.get_str(a).cmp(self.heap.get_str(b)))
            }
            (a, b) => {
                return Err(EmberError::type_error(format!(
                    "Cannot order {} and {}",
                    a.type_name(),
                    b.type_name()
                )))
            }
        };
        // NaN comparisons are false
        let result = ordering.map(accept).unwrap_or(false);
        self.push(Value::Bool(result))
    }

    fn index_get(&mut self, object: Value, index: Value) -> Result<Value, EmberError> {
        match object {
            Value::Array(arr) => {
                let idx = index.as_number().ok_or_else(|| {
                    EmberError::type_error("Array index must be a number")
                })?;
                let items = self.heap.get_array(arr);
                let i = idx as i64;
                if i < 0 || (i as usize) >= items.len() {
                    return Err(EmberError::bounds("Index out of bounds"));
                }
                Ok(items[i as usize])
            }
            Value::Map(map) => Ok(self.heap.map_get(map, &index).unwrap_or(Value::Nil)),
            Value::Str(s) => {
                let idx = index.as_number().ok_or_else(|| {
                    EmberError::type_error("String index must be a number")
                })?;
                let i = idx as i64;
                let text = self.heap.get_str(s);
                if i < 0 {
                    return Err(EmberError::bounds("Index out of bounds"));
                }
                match text.chars().nth(i as usize) {
                    Some(c) => Ok(Value::Str(self.heap.alloc_string(c.to_string())?)),
                    None => Err(EmberError::bounds("Index out of bounds")),
                }
            }
            other => Err(EmberError::type_error(format!(
                "Cannot index {}",
                other.type_name()
            ))),
        }
    }

    fn index_set(
        &mut self,
        object: Value,
        index: Value,
        value: Value,
    ) -> Result<(), EmberError> {
        match object {
            Value::Array(arr) => {
                let idx = index.as_number().ok_or_else(|| {
                    EmberError::type_error("Array index must be a number")
                })?;
                let i = idx as i64;
                let items = self.heap.get_array_mut(arr);
                if i < 0 || (i as usize) >= items.len() {
                    return Err(EmberError::bounds("Index out of bounds"));
                }
                items[i as usize] = value;
                Ok(())
            }
            Value::Map(map) => {
                self.heap.map_insert(map, index, value);
                Ok(())
            }
            other => Err(EmberError::type_error(format!(
                "Cannot index-assign {}",
                other.type_name()
            ))),
        }
    }

    /// Dispatch a call: the callee sits below `argc` arguments on the
    /// stack. Returns true when a script frame was pushed (the caller
    /// then continues the interpreter loop) and false for native calls,
    /// whose result replaces callee and arguments immediately.
    fn call_value(&mut self, argc: usize, _frame_floor: usize) -> Result<bool, EmberError> {
        let callee_idx = self.stack.len() - 1 - argc;
        let callee = self.stack[callee_idx];
        match callee {
            Value::Function(closure) => {
                if self.frames.len() >= FRAMES_MAX {
                    return Err(EmberError::security("[SECURITY] stack depth exceeded"));
                }
                let proto = self.heap.get_closure(closure).proto.clone();
                if argc != proto.arity {
                    return Err(EmberError::runtime(format!(
                        "Function '{}' expects {} arguments, got {}",
                        proto.name, proto.arity, argc
                    )));
                }
                let base = self.stack.len() - argc;
                let slots_end = base + proto.local_count;
                if slots_end > STACK_MAX {
                    return Err(EmberError::security("[SECURITY] operand stack overflow"));
                }
                self.stack.resize(slots_end, Value::Nil);
                self.frames.push(CallFrame {
                    closure,
                    proto,
                    ip: 0,
                    base,
                    handler_depth: self.handlers.len(),
                    finally_depth: self.finally_stack.len(),
                });
                Ok(true)
            }
            Value::Native(id) => {
                let def = self.natives[id.0 as usize].clone();
                let args_start = self.stack.len() - argc;
                let args: Vec<Value> = self.stack[args_start..].to_vec();
                self.native_args.push(args.clone());
                let result = (def.func)(self, &args);
                self.native_args.pop();
                let result = result?;
                self.stack.truncate(args_start - 1);
                self.push(result)?;
                Ok(false)
            }
            other => Err(EmberError::type_error(format!(
                "Cannot call {}",
                other.type_name()
            ))),
        }
    }

    /// Pop the current frame, restore the caller's stack, and push the
    /// return value. Returns `Some(result)` when the returning frame was
    /// the floor frame of this run.
    fn do_return(&mut self, result: Value, frame_floor: usize) -> Option<Value> {
        let frame = self.frames.pop().expect("return without frame");
        // Handlers and finally records opened in this frame cannot
        // survive it.
        self.handlers.truncate(frame.handler_depth);
        self.finally_stack.truncate(frame.finally_depth);
        self.stack.truncate(frame.base - 1);
        if self.frames.len() == frame_floor {
            return Some(result);
        }
        self.stack.push(result);
        None
    }

    // === Exceptions ===

    /// Turn a host-level error into a thrown error object and unwind.
    fn raise(&mut self, mut err: EmberError, frame_floor: usize) -> Result<(), EmberError> {
        if !err.location.is_known() {
            err.location = SourceLocation {
                line: self.current_line.max(1),
                column: 1,
                file: self.source_name.clone(),
            };
        }
        if err.call_stack.is_empty() {
            err.call_stack = self.capture_call_stack();
        }
        let obj = ErrorObj {
            kind: err.kind,
            message: err.message.clone(),
            location: err.location.clone(),
            call_stack: err.call_stack.clone(),
        };
        let value = match self.heap.alloc_error(obj) {
            Ok(handle) => Value::Error(handle),
            // Allocation of the error object itself failed: surface the
            // memory error directly.
            Err(oom) => return Err(oom),
        };
        self.unwind_value(value, frame_floor, Some(err))
    }

    /// Unwind with a thrown value: pop exception handlers (and their
    /// call frames) until a catch or finally region takes it. An
    /// exception that reaches the eval boundary propagates to the host.
    fn unwind_value(
        &mut self,
        value: Value,
        frame_floor: usize,
        origin: Option<EmberError>,
    ) -> Result<(), EmberError> {
        while let Some(top) = self.handlers.last() {
            if top.frame_index < frame_floor {
                break;
            }
            let handler = self.handlers.pop().expect("handler present");
            self.frames.truncate(handler.frame_index + 1);
            self.stack.truncate(handler.stack_height);
            // Discard finally actions the unwound region left behind; an
            // exception thrown inside a finally block replaces the one
            // in flight.
            self.finally_stack.truncate(handler.finally_depth);

            if let Some(slot) = handler.binding_slot {
                let base = self.frames[handler.frame_index].base;
                self.stack[base + slot] = value;
                self.current_frame_mut().ip = handler.catch_ip;
                return Ok(());
            }
            if handler.finally_ip.is_some() {
                self.finally_stack.push(FinallyAction::Propagate { value });
                self.current_frame_mut().ip = handler.catch_ip;
                return Ok(());
            }
        }

        Err(origin.unwrap_or_else(|| self.error_from_value(&value)))
    }

    fn error_from_value(&self, value: &Value) -> EmberError {
        match value {
            Value::Error(h) => {
                let obj = self.heap.get_error(*h);
                let mut err =
                    EmberError::new(obj.kind, obj.message.clone(), obj.location.clone());
                err.call_stack = obj.call_stack.clone();
                err
            }
            other => {
                let mut err = EmberError::runtime(format!(
                    "Uncaught exception: {}",
                    self.heap.format_value(other)
                ));
                err.location = SourceLocation {
                    line: self.current_line.max(1),
                    column: 1,
                    file: self.source_name.clone(),
                };
                err.call_stack = self.capture_call_stack();
                err
            }
        }
    }

    fn capture_call_stack(&self) -> Vec<StackEntry> {
        self.frames
            .iter()
            .map(|frame| StackEntry {
                function_name: frame.proto.name.clone(),
                line: frame.proto.chunk.line_at(frame.ip.saturating_sub(1)),
            })
            .collect()
    }

    // === Modules ===

    /// `import name`: resolve against the module path list through the
    /// VFS, execute the module's top level with a fresh globals table,
    /// snapshot its globals as exports, and merge them into the current
    /// globals. Idempotent: a cached module is never re-parsed.
    pub fn import_module(&mut self, name: &str) -> Result<(), EmberError> {
        validate_module_name(name)?;

        if let Some(module) = self.loader.cached(name) {
            let exports = module.exports.clone();
            for (export_name, value) in exports {
                self.globals.insert(export_name, value);
            }
            return Ok(());
        }

        // A module whose top level is still executing: return the
        // partially constructed module (no exports yet) so cyclic
        // imports terminate.
        if self.loader.is_loading(name) {
            return Ok(());
        }

        let source = self.resolve_module_source(name)?;

        self.loader.begin_loading(name);
        let saved_globals = std::mem::take(&mut self.globals);
        self.globals_stack.push(saved_globals);
        self.install_builtin_globals();

        let chunk_name = format!("{}.{}", name, MODULE_EXTENSION);
        let result = self.eval_source(&source, Some(chunk_name));

        let module_globals = std::mem::replace(
            &mut self.globals,
            self.globals_stack.pop().expect("saved globals present"),
        );
        self.loader.finish_loading(name);

        match result {
            Ok(_) => {
                // Natives are re-registered per module run; only the
                // module's own definitions are exports.
                let exports: Vec<(String, Value)> = module_globals
                    .into_iter()
                    .filter(|(_, v)| !matches!(v, Value::Native(_)))
                    .collect();
                for (export_name, value) in &exports {
                    self.globals.insert(export_name.clone(), *value);
                }
                self.loader.cache(Module { name: name.to_string(), exports });
                Ok(())
            }
            Err(err) => Err(EmberError::import(format!(
                "Failed to import '{}': {}",
                name, err.message
            ))),
        }
    }

    fn resolve_module_source(&self, name: &str) -> Result<String, EmberError> {
        for path in self.loader.search_paths() {
            let candidate = format!("{}/{}.{}", path, name, MODULE_EXTENSION);
            if self.vfs.exists(&candidate) {
                return self.vfs.read(&candidate);
            }
            // Installed packages live in <path>/<name>/package.ember
            let package = format!("{}/{}/package.{}", path, name, MODULE_EXTENSION);
            if self.vfs.exists(&package) {
                return self.vfs.read(&package);
            }
        }
        Err(EmberError::import(format!("Module not found: {}", name)))
    }

    // === Garbage collection ===

    /// Collect garbage now. The root set is the operand stack, all call
    /// frames' closures, globals (current and suspended), module
    /// exports, pending finally actions, and native argv in flight.
    pub fn collect_garbage(&mut self) -> usize {
        let roots = self.gather_roots();
        self.heap.collect(&roots)
    }

    fn gather_roots(&self) -> Vec<Handle> {
        let mut roots = Vec::with_capacity(self.stack.len() + self.globals.len() + 16);
        let mut add = |value: &Value, roots: &mut Vec<Handle>| {
            if let Some(h) = value.handle() {
                roots.push(h);
            }
        };
        for value in &self.stack {
            add(value, &mut roots);
        }
        for frame in &self.frames {
            roots.push(frame.closure);
        }
        for value in self.globals.values() {
            add(value, &mut roots);
        }
        for globals in &self.globals_stack {
            for value in globals.values() {
                add(value, &mut roots);
            }
        }
        for value in self.loader.root_values() {
            add(value, &mut roots);
        }
        for action in &self.finally_stack {
            if let FinallyAction::Propagate { value } = action {
                add(value, &mut roots);
            }
        }
        for args in &self.native_args {
            for value in args {
                add(value, &mut roots);
            }
        }
        roots
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

/// Strip a leading `#!...` line before evaluation.
fn strip_shebang(source: &str) -> &str {
    if let Some(rest) = source.strip_prefix("#!") {
        match rest.find('\n') {
            Some(pos) => &rest[pos + 1..],
            None => "",
        }
    } else {
        source
    }
}
