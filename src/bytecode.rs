// File: src/bytecode.rs
//
// Bytecode instruction definitions and chunk structures for the Ember VM.
// A chunk is immutable once the code generator hands it to the VM: a flat
// instruction sequence, a constant pool, and a parallel source-line table.

use std::rc::Rc;

/// Bytecode instruction opcodes for the Ember VM.
/// Stack-based virtual machine with a separate call-frame stack.
#[derive(Debug, Clone, PartialEq)]
pub enum OpCode {
    // === Constants / immediates ===
    /// Load a constant from the constant pool onto the stack
    LoadConst(usize),
    PushNil,
    PushTrue,
    PushFalse,

    // === Stack management ===
    Pop,
    Dup,

    // === Locals / globals ===
    /// Load a frame-local slot onto the stack
    LoadLocal(usize),
    /// Pop the top of stack into a frame-local slot
    StoreLocal(usize),
    /// Load a global by name
    LoadGlobal(String),
    /// Pop the top of stack into a global (creates or updates)
    StoreGlobal(String),

    // === Captured variables ===
    /// Replace the value in a local slot with a fresh heap cell holding it.
    /// Emitted at the declaration of any local captured by a nested function.
    NewCell(usize),
    /// Load through the cell stored in a local slot
    LoadCell(usize),
    /// Pop the top of stack into the cell stored in a local slot
    StoreCell(usize),
    /// Load through the closure's upvalue cell
    LoadUpvalue(usize),
    /// Pop the top of stack into the closure's upvalue cell
    StoreUpvalue(usize),

    // === Arithmetic ===
    /// Binary ops require two numbers; Add also concatenates string+string
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Negate,

    // === Logic / comparison ===
    Not,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,

    // === Control flow ===
    /// Unconditional jump to an absolute instruction index
    Jump(usize),
    /// Pop a value, jump if falsy
    JumpIfFalse(usize),
    /// Pop a value, jump if truthy
    JumpIfTrue(usize),
    /// Backward jump (loops); kept distinct from Jump for readability
    /// of disassembly and for loop detection in tooling
    JumpBack(usize),

    // === Functions ===
    /// Call with N arguments; callee sits below the arguments on the stack
    Call(usize),
    /// Return nil from the current frame
    Return,
    /// Return the top of stack from the current frame
    ReturnValue,
    /// Build a closure over the function proto at the given constant index,
    /// resolving the proto's upvalue sources against the current frame
    MakeClosure(usize),

    // === Aggregates ===
    /// Create an array from the top N stack values
    MakeArray(usize),
    /// Create a map from the top 2N stack values (k1, v1, ..., kN, vN)
    MakeMap(usize),
    /// Pop index and object, push object[index]
    IndexGet,
    /// Pop value, index, object; set object[index] = value
    IndexSet,
    /// Pop a map, push the value under the given string key
    FieldGet(String),

    // === Modules ===
    /// Load (or fetch from cache) the named module and merge its exports
    /// into the globals table
    Import(String),

    // === Exceptions ===
    /// Install an exception handler covering the code up to EndTry.
    /// `binding_slot` is the frame-local slot that receives the caught value.
    BeginTry {
        catch_ip: usize,
        finally_ip: Option<usize>,
        binding_slot: Option<usize>,
    },
    /// Remove the innermost handler at normal completion of a try block;
    /// jumps to the finally block when one was recorded
    EndTry,
    /// Pop an exception value and unwind to the nearest matching handler
    Throw,
    /// Entry marker of a finally block; pushes the pending-action record
    FinallyBegin,
    /// Exit marker of a finally block; resumes the pending action
    FinallyEnd,
}

/// Where a closure's upvalue cell comes from when the closure is built.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpvalueSource {
    /// A cell stored in the enclosing frame's local slot
    Local(usize),
    /// A cell already captured by the enclosing closure
    Upvalue(usize),
}

/// A compiled bytecode chunk: instructions, constant pool, line table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Chunk {
    pub code: Vec<OpCode>,
    pub constants: Vec<Constant>,
    /// Source line per instruction (parallel to `code`)
    pub lines: Vec<usize>,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit an instruction and return its index
    pub fn emit(&mut self, instruction: OpCode, line: usize) -> usize {
        let index = self.code.len();
        self.code.push(instruction);
        self.lines.push(line);
        index
    }

    /// Add a constant to the pool and return its index, deduplicating
    /// identical entries
    pub fn add_constant(&mut self, constant: Constant) -> usize {
        if let Some(index) = self.constants.iter().position(|c| c == &constant) {
            return index;
        }
        let index = self.constants.len();
        self.constants.push(constant);
        index
    }

    /// Point a forward jump emitted earlier at the current position
    pub fn patch_jump(&mut self, jump_index: usize) {
        let target = self.code.len();
        self.set_jump_target(jump_index, target);
    }

    /// Set the target of a jump instruction
    pub fn set_jump_target(&mut self, jump_index: usize, target: usize) {
        match &mut self.code[jump_index] {
            OpCode::Jump(addr)
            | OpCode::JumpIfFalse(addr)
            | OpCode::JumpIfTrue(addr)
            | OpCode::JumpBack(addr) => {
                *addr = target;
            }
            OpCode::BeginTry { catch_ip, .. } => {
                *catch_ip = target;
            }
            other => panic!("Attempted to patch non-jump instruction {:?}", other),
        }
    }

    /// Source line for an instruction index, for diagnostics
    pub fn line_at(&self, ip: usize) -> usize {
        self.lines.get(ip).copied().unwrap_or(0)
    }
}

/// Constants that can be stored in the constant pool
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Number(f64),
    String(String),
    Function(Rc<FunctionProto>),
}

/// A compiled function: bytecode plus the metadata the VM needs to build
/// a call frame and, for closures, to capture upvalue cells.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionProto {
    pub name: String,
    pub arity: usize,
    /// Total frame-local slots, parameters included
    pub local_count: usize,
    pub chunk: Chunk,
    pub upvalues: Vec<UpvalueSource>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_tracks_lines() {
        let mut chunk = Chunk::new();
        chunk.emit(OpCode::PushNil, 1);
        chunk.emit(OpCode::Pop, 2);
        assert_eq!(chunk.line_at(0), 1);
        assert_eq!(chunk.line_at(1), 2);
    }

    #[test]
    fn test_add_constant_deduplicates() {
        let mut chunk = Chunk::new();
        let a = chunk.add_constant(Constant::Number(1.0));
        let b = chunk.add_constant(Constant::Number(1.0));
        let c = chunk.add_constant(Constant::String("x".to_string()));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_patch_jump_points_at_current_end() {
        let mut chunk = Chunk::new();
        let j = chunk.emit(OpCode::JumpIfFalse(0), 1);
        chunk.emit(OpCode::PushNil, 1);
        chunk.emit(OpCode::Pop, 1);
        chunk.patch_jump(j);
        assert_eq!(chunk.code[j], OpCode::JumpIfFalse(3));
    }

    #[test]
    fn test_patch_begin_try_sets_catch_ip() {
        let mut chunk = Chunk::new();
        let t = chunk.emit(
            OpCode::BeginTry { catch_ip: 0, finally_ip: None, binding_slot: Some(0) },
            1,
        );
        chunk.emit(OpCode::PushNil, 1);
        chunk.patch_jump(t);
        match &chunk.code[t] {
            OpCode::BeginTry { catch_ip, .. } => assert_eq!(*catch_ip, 2),
            other => panic!("unexpected instruction {:?}", other),
        }
    }
}
