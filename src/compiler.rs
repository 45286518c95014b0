// File: src/compiler.rs
//
// Bytecode code generator for Ember. Walks the AST and emits chunks:
// locals become frame slots, captured locals are promoted to heap cells,
// `&&`/`||` and the `for` statement are lowered to compare+jump
// sequences, and try/catch/finally is lowered to nested handler regions
// (an inner catch region and an outer finally region).

use crate::ast::{AssignTarget, Expr, Stmt};
use crate::bytecode::{Chunk, Constant, FunctionProto, OpCode, UpvalueSource};
use crate::errors::{EmberError, SourceLocation};
use ahash::AHashSet;
use std::rc::Rc;

const MAX_LOCALS: usize = 256;

struct Local {
    name: String,
    slot: usize,
    /// Locals referenced by nested functions live in heap cells
    is_cell: bool,
}

struct LoopContext {
    break_jumps: Vec<usize>,
    continue_jumps: Vec<usize>,
}

struct FuncState {
    name: String,
    arity: usize,
    chunk: Chunk,
    locals: Vec<Local>,
    upvalues: Vec<(String, UpvalueSource)>,
    /// Names referenced from nested functions of this body; declaring
    /// one of these makes the local a cell
    captured_names: AHashSet<String>,
    loops: Vec<LoopContext>,
    is_script: bool,
}

impl FuncState {
    fn resolve_local(&self, name: &str) -> Option<(usize, bool)> {
        self.locals
            .iter()
            .rev()
            .find(|l| l.name == name)
            .map(|l| (l.slot, l.is_cell))
    }

    fn declare_local(&mut self, name: &str, line: usize) -> Result<(usize, bool), EmberError> {
        if self.locals.len() >= MAX_LOCALS {
            return Err(EmberError::syntax(
                "Too many local variables in function",
                SourceLocation::new(line, 1),
            ));
        }
        let slot = self.locals.len();
        let is_cell = self.captured_names.contains(name);
        self.locals.push(Local { name: name.to_string(), slot, is_cell });
        Ok((slot, is_cell))
    }
}

pub struct Compiler {
    states: Vec<FuncState>,
}

impl Compiler {
    pub fn new() -> Self {
        Compiler { states: Vec::new() }
    }

    /// Compile a whole script into the proto for the implicit `<script>`
    /// function. Top-level name assignments define globals; locals at
    /// script level exist only for catch bindings.
    pub fn compile_script(
        &mut self,
        stmts: &[Stmt],
        name: &str,
    ) -> Result<Rc<FunctionProto>, EmberError> {
        let mut captured = AHashSet::new();
        collect_captured_names(stmts, &mut captured);
        self.states.push(FuncState {
            name: name.to_string(),
            arity: 0,
            chunk: Chunk::new(),
            locals: Vec::new(),
            upvalues: Vec::new(),
            captured_names: captured,
            loops: Vec::new(),
            is_script: true,
        });

        // The value of a trailing expression statement is the eval result.
        let split = stmts.len();
        let (body, tail) = match stmts.last() {
            Some(Stmt::ExprStmt { .. }) => stmts.split_at(split - 1),
            _ => (stmts, &[][..]),
        };
        for stmt in body {
            self.statement(stmt)?;
        }
        match tail.first() {
            Some(Stmt::ExprStmt { expr, line }) => {
                self.expression(expr)?;
                self.emit(OpCode::ReturnValue, *line);
            }
            _ => {
                let line = self.state().chunk.lines.last().copied().unwrap_or(1);
                self.emit(OpCode::Return, line);
            }
        }

        let state = self.states.pop().expect("script state present");
        Ok(Rc::new(FunctionProto {
            name: state.name,
            arity: 0,
            local_count: state.locals.len(),
            chunk: state.chunk,
            upvalues: Vec::new(),
        }))
    }

    fn state(&mut self) -> &mut FuncState {
        self.states.last_mut().expect("compiler state present")
    }

    fn emit(&mut self, op: OpCode, line: usize) -> usize {
        self.state().chunk.emit(op, line)
    }

    fn add_constant(&mut self, constant: Constant) -> usize {
        self.state().chunk.add_constant(constant)
    }

    fn here(&mut self) -> usize {
        self.state().chunk.code.len()
    }

    // === Statements ===

    fn statement(&mut self, stmt: &Stmt) -> Result<(), EmberError> {
        match stmt {
            Stmt::ExprStmt { expr, line } => {
                self.expression(expr)?;
                self.emit(OpCode::Pop, *line);
            }
            Stmt::Assign { target, value, line } => self.assignment(target, value, *line)?,
            Stmt::If { condition, then_branch, else_branch, line } => {
                self.expression(condition)?;
                let else_jump = self.emit(OpCode::JumpIfFalse(0), *line);
                for s in then_branch {
                    self.statement(s)?;
                }
                let end_jump = self.emit(OpCode::Jump(0), *line);
                self.state().chunk.patch_jump(else_jump);
                if let Some(else_branch) = else_branch {
                    for s in else_branch {
                        self.statement(s)?;
                    }
                }
                self.state().chunk.patch_jump(end_jump);
            }
            Stmt::While { condition, body, line } => {
                let loop_start = self.here();
                self.expression(condition)?;
                let exit_jump = self.emit(OpCode::JumpIfFalse(0), *line);
                self.state().loops.push(LoopContext {
                    break_jumps: Vec::new(),
                    continue_jumps: Vec::new(),
                });
                for s in body {
                    self.statement(s)?;
                }
                self.emit(OpCode::JumpBack(loop_start), *line);
                self.state().chunk.patch_jump(exit_jump);
                self.finish_loop(loop_start)?;
            }
            Stmt::For { init, condition, step, body, line } => {
                if let Some(init) = init {
                    self.statement(init)?;
                }
                let loop_start = self.here();
                let exit_jump = match condition {
                    Some(condition) => {
                        self.expression(condition)?;
                        Some(self.emit(OpCode::JumpIfFalse(0), *line))
                    }
                    None => None,
                };
                self.state().loops.push(LoopContext {
                    break_jumps: Vec::new(),
                    continue_jumps: Vec::new(),
                });
                for s in body {
                    self.statement(s)?;
                }
                // `continue` lands on the step clause
                let step_pos = self.here();
                if let Some(step) = step {
                    self.statement(step)?;
                }
                self.emit(OpCode::JumpBack(loop_start), *line);
                if let Some(exit_jump) = exit_jump {
                    self.state().chunk.patch_jump(exit_jump);
                }
                self.finish_loop(step_pos)?;
            }
            Stmt::FuncDef { name, params, body, line } => {
                self.function_definition(name, params, body, *line)?;
            }
            Stmt::Return { value, line } => {
                match value {
                    Some(value) => {
                        self.expression(value)?;
                        self.emit(OpCode::ReturnValue, *line);
                    }
                    None => {
                        self.emit(OpCode::Return, *line);
                    }
                };
            }
            Stmt::Try { try_block, catch_var, catch_block, finally_block, line } => {
                self.try_statement(
                    try_block,
                    catch_var.as_deref(),
                    catch_block.as_deref(),
                    finally_block.as_deref(),
                    *line,
                )?;
            }
            Stmt::Throw { value, line } => {
                self.expression(value)?;
                self.emit(OpCode::Throw, *line);
            }
            Stmt::Import { name, line } => {
                self.emit(OpCode::Import(name.clone()), *line);
            }
            Stmt::Break { line } => {
                let jump = self.emit(OpCode::Jump(0), *line);
                match self.state().loops.last_mut() {
                    Some(ctx) => ctx.break_jumps.push(jump),
                    None => {
                        return Err(EmberError::syntax(
                            "'break' outside of a loop",
                            SourceLocation::new(*line, 1),
                        ))
                    }
                }
            }
            Stmt::Continue { line } => {
                let jump = self.emit(OpCode::Jump(0), *line);
                match self.state().loops.last_mut() {
                    Some(ctx) => ctx.continue_jumps.push(jump),
                    None => {
                        return Err(EmberError::syntax(
                            "'continue' outside of a loop",
                            SourceLocation::new(*line, 1),
                        ))
                    }
                }
            }
            Stmt::Block(stmts) => {
                for s in stmts {
                    self.statement(s)?;
                }
            }
        }
        Ok(())
    }

    fn finish_loop(&mut self, continue_target: usize) -> Result<(), EmberError> {
        let ctx = self.state().loops.pop().expect("loop context present");
        for jump in ctx.break_jumps {
            self.state().chunk.patch_jump(jump);
        }
        for jump in ctx.continue_jumps {
            self.state().chunk.set_jump_target(jump, continue_target);
        }
        Ok(())
    }

    fn assignment(
        &mut self,
        target: &AssignTarget,
        value: &Expr,
        line: usize,
    ) -> Result<(), EmberError> {
        match target {
            AssignTarget::Name(name) => {
                self.expression(value)?;
                self.store_name(name, line)?;
            }
            AssignTarget::Index { object, index } => {
                self.expression(object)?;
                self.expression(index)?;
                self.expression(value)?;
                self.emit(OpCode::IndexSet, line);
            }
            AssignTarget::Field { object, name } => {
                self.expression(object)?;
                let idx = self.add_constant(Constant::String(name.clone()));
                self.emit(OpCode::LoadConst(idx), line);
                self.expression(value)?;
                self.emit(OpCode::IndexSet, line);
            }
        }
        Ok(())
    }

    /// Store the top of stack into a name. Existing locals and upvalues
    /// win; at script level unresolved names are globals; inside a
    /// function an unresolved name declares a function-wide local.
    fn store_name(&mut self, name: &str, line: usize) -> Result<(), EmberError> {
        if let Some((slot, is_cell)) = self.state().resolve_local(name) {
            let op = if is_cell { OpCode::StoreCell(slot) } else { OpCode::StoreLocal(slot) };
            self.emit(op, line);
            return Ok(());
        }
        let level = self.states.len() - 1;
        if let Some(idx) = self.resolve_upvalue(level, name) {
            self.emit(OpCode::StoreUpvalue(idx), line);
            return Ok(());
        }
        if self.state().is_script {
            self.emit(OpCode::StoreGlobal(name.to_string()), line);
            return Ok(());
        }
        let (slot, is_cell) = self.state().declare_local(name, line)?;
        self.emit(OpCode::StoreLocal(slot), line);
        if is_cell {
            self.emit(OpCode::NewCell(slot), line);
        }
        Ok(())
    }

    fn load_name(&mut self, name: &str, line: usize) {
        if let Some((slot, is_cell)) = self.state().resolve_local(name) {
            let op = if is_cell { OpCode::LoadCell(slot) } else { OpCode::LoadLocal(slot) };
            self.emit(op, line);
            return;
        }
        let level = self.states.len() - 1;
        if let Some(idx) = self.resolve_upvalue(level, name) {
            self.emit(OpCode::LoadUpvalue(idx), line);
            return;
        }
        // Unresolved names fall through to the globals table; an
        // undefined global is a runtime error, not a compile error,
        // because imports and natives populate globals dynamically.
        self.emit(OpCode::LoadGlobal(name.to_string()), line);
    }

    fn resolve_upvalue(&mut self, level: usize, name: &str) -> Option<usize> {
        if level == 0 {
            return None;
        }
        let parent = level - 1;
        if let Some((slot, is_cell)) = self.states[parent].resolve_local(name) {
            debug_assert!(is_cell, "captured local must have been promoted to a cell");
            return Some(self.add_upvalue(level, name, UpvalueSource::Local(slot)));
        }
        if let Some(idx) = self.resolve_upvalue(parent, name) {
            return Some(self.add_upvalue(level, name, UpvalueSource::Upvalue(idx)));
        }
        None
    }

    fn add_upvalue(&mut self, level: usize, name: &str, source: UpvalueSource) -> usize {
        let state = &mut self.states[level];
        if let Some(idx) = state.upvalues.iter().position(|(n, _)| n == name) {
            return idx;
        }
        state.upvalues.push((name.to_string(), source));
        state.upvalues.len() - 1
    }

    // === Functions ===

    fn function_definition(
        &mut self,
        name: &str,
        params: &[String],
        body: &[Stmt],
        line: usize,
    ) -> Result<(), EmberError> {
        if self.state().is_script {
            self.compile_function(name, params, body, line)?;
            self.emit(OpCode::StoreGlobal(name.to_string()), line);
            return Ok(());
        }

        // A local function: declare the name first so the body can refer
        // to itself. If the name is captured (self-recursion from the
        // nested body counts), seed the cell before building the closure
        // so the closure captures the shared cell.
        let (slot, is_cell) = match self.state().resolve_local(name) {
            Some(found) => found,
            None => self.state().declare_local(name, line)?,
        };
        if is_cell {
            self.emit(OpCode::PushNil, line);
            self.emit(OpCode::StoreLocal(slot), line);
            self.emit(OpCode::NewCell(slot), line);
            self.compile_function(name, params, body, line)?;
            self.emit(OpCode::StoreCell(slot), line);
        } else {
            self.compile_function(name, params, body, line)?;
            self.emit(OpCode::StoreLocal(slot), line);
        }
        Ok(())
    }

    /// Compile a function body and emit MakeClosure, leaving the closure
    /// on the stack.
    fn compile_function(
        &mut self,
        name: &str,
        params: &[String],
        body: &[Stmt],
        line: usize,
    ) -> Result<(), EmberError> {
        let mut captured = AHashSet::new();
        collect_captured_names(body, &mut captured);
        self.states.push(FuncState {
            name: name.to_string(),
            arity: params.len(),
            chunk: Chunk::new(),
            locals: Vec::new(),
            upvalues: Vec::new(),
            captured_names: captured,
            loops: Vec::new(),
            is_script: false,
        });

        for param in params {
            let (slot, is_cell) = self.state().declare_local(param, line)?;
            if is_cell {
                self.emit(OpCode::NewCell(slot), line);
            }
        }
        for stmt in body {
            self.statement(stmt)?;
        }
        let last_line = self.state().chunk.lines.last().copied().unwrap_or(line);
        self.emit(OpCode::Return, last_line);

        let state = self.states.pop().expect("function state present");
        let proto = FunctionProto {
            name: state.name,
            arity: state.arity,
            local_count: state.locals.len(),
            chunk: state.chunk,
            upvalues: state.upvalues.iter().map(|(_, src)| *src).collect(),
        };
        let idx = self.add_constant(Constant::Function(Rc::new(proto)));
        self.emit(OpCode::MakeClosure(idx), line);
        Ok(())
    }

    // === try/catch/finally ===
    //
    // Lowered to an outer finally region wrapping an inner catch region:
    //
    //   [outer]  BeginTry{catch_ip=FIN, finally_ip=FIN}      (if finally)
    //   [inner]  BeginTry{catch_ip=CAT, binding_slot=e}      (if catch)
    //            <try body>
    //            EndTry                                       (pop inner)
    //            Jump DONE
    //   CAT:     <catch body>
    //   DONE:    EndTry          -> pushes Normal, jumps FIN  (if finally)
    //            Jump END
    //   FIN:     FinallyBegin
    //            <finally body>
    //            FinallyEnd      -> resume Normal / rethrow
    //   END:
    fn try_statement(
        &mut self,
        try_block: &[Stmt],
        catch_var: Option<&str>,
        catch_block: Option<&[Stmt]>,
        finally_block: Option<&[Stmt]>,
        line: usize,
    ) -> Result<(), EmberError> {
        let outer = if finally_block.is_some() {
            Some(self.emit(
                OpCode::BeginTry { catch_ip: 0, finally_ip: Some(0), binding_slot: None },
                line,
            ))
        } else {
            None
        };

        let inner = if catch_block.is_some() {
            let name = catch_var.unwrap_or("_");
            let (slot, is_cell) = match self.state().resolve_local(name) {
                Some(found) => found,
                None => self.state().declare_local(name, line)?,
            };
            let begin = self.emit(
                OpCode::BeginTry { catch_ip: 0, finally_ip: None, binding_slot: Some(slot) },
                line,
            );
            Some((begin, slot, is_cell))
        } else {
            None
        };

        for stmt in try_block {
            self.statement(stmt)?;
        }

        let mut done_jump = None;
        if let Some((begin, slot, is_cell)) = inner {
            self.emit(OpCode::EndTry, line);
            done_jump = Some(self.emit(OpCode::Jump(0), line));
            self.state().chunk.patch_jump(begin); // catch_ip = here
            if is_cell {
                // The throw path stored the raw value in the slot
                self.emit(OpCode::NewCell(slot), line);
            }
            for stmt in catch_block.unwrap_or(&[]) {
                self.statement(stmt)?;
            }
        }
        if let Some(done_jump) = done_jump {
            self.state().chunk.patch_jump(done_jump);
        }

        if let Some(finally_block) = finally_block {
            self.emit(OpCode::EndTry, line);
            let end_jump = self.emit(OpCode::Jump(0), line);
            let fin = self.here();
            if let Some(outer) = outer {
                match &mut self.state().chunk.code[outer] {
                    OpCode::BeginTry { catch_ip, finally_ip, .. } => {
                        *catch_ip = fin;
                        *finally_ip = Some(fin);
                    }
                    _ => unreachable!("outer handler is a BeginTry"),
                }
            }
            self.emit(OpCode::FinallyBegin, line);
            for stmt in finally_block {
                self.statement(stmt)?;
            }
            self.emit(OpCode::FinallyEnd, line);
            self.state().chunk.patch_jump(end_jump);
        }

        Ok(())
    }

    // === Expressions ===

    fn expression(&mut self, expr: &Expr) -> Result<(), EmberError> {
        match expr {
            Expr::Nil => {
                self.emit(OpCode::PushNil, 0);
            }
            Expr::Bool(true) => {
                self.emit(OpCode::PushTrue, 0);
            }
            Expr::Bool(false) => {
                self.emit(OpCode::PushFalse, 0);
            }
            Expr::Number(n) => {
                let idx = self.add_constant(Constant::Number(*n));
                self.emit(OpCode::LoadConst(idx), 0);
            }
            Expr::String(s) => {
                let idx = self.add_constant(Constant::String(s.clone()));
                self.emit(OpCode::LoadConst(idx), 0);
            }
            Expr::Identifier { name, line } => {
                let name = name.clone();
                self.load_name(&name, *line);
            }
            Expr::Array { elements, line } => {
                for element in elements {
                    self.expression(element)?;
                }
                self.emit(OpCode::MakeArray(elements.len()), *line);
            }
            Expr::Map { entries, line } => {
                for (key, value) in entries {
                    self.expression(key)?;
                    self.expression(value)?;
                }
                self.emit(OpCode::MakeMap(entries.len()), *line);
            }
            Expr::Unary { op, operand, line } => {
                self.expression(operand)?;
                match op.as_str() {
                    "-" => self.emit(OpCode::Negate, *line),
                    "!" => self.emit(OpCode::Not, *line),
                    other => unreachable!("unknown unary operator {}", other),
                };
            }
            Expr::Binary { left, op, right, line } => {
                self.expression(left)?;
                self.expression(right)?;
                let opcode = match op.as_str() {
                    "+" => OpCode::Add,
                    "-" => OpCode::Sub,
                    "*" => OpCode::Mul,
                    "/" => OpCode::Div,
                    "%" => OpCode::Mod,
                    "==" => OpCode::Equal,
                    "!=" => OpCode::NotEqual,
                    "<" => OpCode::Less,
                    "<=" => OpCode::LessEqual,
                    ">" => OpCode::Greater,
                    ">=" => OpCode::GreaterEqual,
                    other => unreachable!("unknown binary operator {}", other),
                };
                self.emit(opcode, *line);
            }
            Expr::Logical { left, op, right, line } => {
                self.expression(left)?;
                self.emit(OpCode::Dup, *line);
                let short_circuit = if op == "&&" {
                    self.emit(OpCode::JumpIfFalse(0), *line)
                } else {
                    self.emit(OpCode::JumpIfTrue(0), *line)
                };
                self.emit(OpCode::Pop, *line);
                self.expression(right)?;
                self.state().chunk.patch_jump(short_circuit);
            }
            Expr::Call { callee, args, line } => {
                self.expression(callee)?;
                for arg in args {
                    self.expression(arg)?;
                }
                self.emit(OpCode::Call(args.len()), *line);
            }
            Expr::Index { object, index, line } => {
                self.expression(object)?;
                self.expression(index)?;
                self.emit(OpCode::IndexGet, *line);
            }
            Expr::Field { object, name, line } => {
                self.expression(object)?;
                self.emit(OpCode::FieldGet(name.clone()), *line);
            }
            Expr::IfExpr { condition, then_value, else_value, line } => {
                self.expression(condition)?;
                let else_jump = self.emit(OpCode::JumpIfFalse(0), *line);
                self.expression(then_value)?;
                let end_jump = self.emit(OpCode::Jump(0), *line);
                self.state().chunk.patch_jump(else_jump);
                self.expression(else_value)?;
                self.state().chunk.patch_jump(end_jump);
            }
            Expr::Function { params, body, line } => {
                self.compile_function("<anonymous>", params, body, *line)?;
            }
        }
        Ok(())
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

/// Collect every identifier mentioned inside nested functions of `stmts`.
/// Over-approximation is fine: a name in the set merely gets cell
/// treatment when declared as a local.
fn collect_captured_names(stmts: &[Stmt], set: &mut AHashSet<String>) {
    for stmt in stmts {
        walk_stmt_for_functions(stmt, set);
    }
}

fn walk_stmt_for_functions(stmt: &Stmt, set: &mut AHashSet<String>) {
    match stmt {
        Stmt::ExprStmt { expr, .. } | Stmt::Throw { value: expr, .. } => {
            walk_expr_for_functions(expr, set)
        }
        Stmt::Assign { target, value, .. } => {
            match target {
                AssignTarget::Name(_) => {}
                AssignTarget::Index { object, index } => {
                    walk_expr_for_functions(object, set);
                    walk_expr_for_functions(index, set);
                }
                AssignTarget::Field { object, .. } => walk_expr_for_functions(object, set),
            }
            walk_expr_for_functions(value, set);
        }
        Stmt::If { condition, then_branch, else_branch, .. } => {
            walk_expr_for_functions(condition, set);
            collect_captured_names(then_branch, set);
            if let Some(else_branch) = else_branch {
                collect_captured_names(else_branch, set);
            }
        }
        Stmt::While { condition, body, .. } => {
            walk_expr_for_functions(condition, set);
            collect_captured_names(body, set);
        }
        Stmt::For { init, condition, step, body, .. } => {
            if let Some(init) = init {
                walk_stmt_for_functions(init, set);
            }
            if let Some(condition) = condition {
                walk_expr_for_functions(condition, set);
            }
            if let Some(step) = step {
                walk_stmt_for_functions(step, set);
            }
            collect_captured_names(body, set);
        }
        Stmt::FuncDef { body, .. } => collect_all_identifiers(body, set),
        Stmt::Return { value, .. } => {
            if let Some(value) = value {
                walk_expr_for_functions(value, set);
            }
        }
        Stmt::Try { try_block, catch_block, finally_block, .. } => {
            collect_captured_names(try_block, set);
            if let Some(catch_block) = catch_block {
                collect_captured_names(catch_block, set);
            }
            if let Some(finally_block) = finally_block {
                collect_captured_names(finally_block, set);
            }
        }
        Stmt::Import { .. } | Stmt::Break { .. } | Stmt::Continue { .. } => {}
        Stmt::Block(stmts) => collect_captured_names(stmts, set),
    }
}

fn walk_expr_for_functions(expr: &Expr, set: &mut AHashSet<String>) {
    match expr {
        Expr::Function { body, .. } => collect_all_identifiers(body, set),
        Expr::Array { elements, .. } => {
            for e in elements {
                walk_expr_for_functions(e, set);
            }
        }
        Expr::Map { entries, .. } => {
            for (k, v) in entries {
                walk_expr_for_functions(k, set);
                walk_expr_for_functions(v, set);
            }
        }
        Expr::Unary { operand, .. } => walk_expr_for_functions(operand, set),
        Expr::Binary { left, right, .. } | Expr::Logical { left, right, .. } => {
            walk_expr_for_functions(left, set);
            walk_expr_for_functions(right, set);
        }
        Expr::Call { callee, args, .. } => {
            walk_expr_for_functions(callee, set);
            for arg in args {
                walk_expr_for_functions(arg, set);
            }
        }
        Expr::Index { object, index, .. } => {
            walk_expr_for_functions(object, set);
            walk_expr_for_functions(index, set);
        }
        Expr::Field { object, .. } => walk_expr_for_functions(object, set),
        Expr::IfExpr { condition, then_value, else_value, .. } => {
            walk_expr_for_functions(condition, set);
            walk_expr_for_functions(then_value, set);
            walk_expr_for_functions(else_value, set);
        }
        Expr::Nil
        | Expr::Bool(_)
        | Expr::Number(_)
        | Expr::String(_)
        | Expr::Identifier { .. } => {}
    }
}

/// Record every identifier inside a nested function body (any depth).
fn collect_all_identifiers(stmts: &[Stmt], set: &mut AHashSet<String>) {
    for stmt in stmts {
        collect_stmt_identifiers(stmt, set);
    }
}

fn collect_stmt_identifiers(stmt: &Stmt, set: &mut AHashSet<String>) {
    match stmt {
        Stmt::ExprStmt { expr, .. } | Stmt::Throw { value: expr, .. } => {
            collect_expr_identifiers(expr, set)
        }
        Stmt::Assign { target, value, .. } => {
            match target {
                AssignTarget::Name(name) => {
                    set.insert(name.clone());
                }
                AssignTarget::Index { object, index } => {
                    collect_expr_identifiers(object, set);
                    collect_expr_identifiers(index, set);
                }
                AssignTarget::Field { object, .. } => collect_expr_identifiers(object, set),
            }
            collect_expr_identifiers(value, set);
        }
        Stmt::If { condition, then_branch, else_branch, .. } => {
            collect_expr_identifiers(condition, set);
            collect_all_identifiers(then_branch, set);
            if let Some(else_branch) = else_branch {
                collect_all_identifiers(else_branch, set);
            }
        }
        Stmt::While { condition, body, .. } => {
            collect_expr_identifiers(condition, set);
            collect_all_identifiers(body, set);
        }
        Stmt::For { init, condition, step, body, .. } => {
            if let Some(init) = init {
                collect_stmt_identifiers(init, set);
            }
            if let Some(condition) = condition {
                collect_expr_identifiers(condition, set);
            }
            if let Some(step) = step {
                collect_stmt_identifiers(step, set);
            }
            collect_all_identifiers(body, set);
        }
        Stmt::FuncDef { name, body, .. } => {
            set.insert(name.clone());
            collect_all_identifiers(body, set);
        }
        Stmt::Return { value, .. } => {
            if let Some(value) = value {
                collect_expr_identifiers(value, set);
            }
        }
        Stmt::Try { try_block, catch_var, catch_block, finally_block, .. } => {
            if let Some(catch_var) = catch_var {
                set.insert(catch_var.clone());
            }
            collect_all_identifiers(try_block, set);
            if let Some(catch_block) = catch_block {
                collect_all_identifiers(catch_block, set);
            }
            if let Some(finally_block) = finally_block {
                collect_all_identifiers(finally_block, set);
            }
        }
        Stmt::Import { .. } | Stmt::Break { .. } | Stmt::Continue { .. } => {}
        Stmt::Block(stmts) => collect_all_identifiers(stmts, set),
    }
}

fn collect_expr_identifiers(expr: &Expr, set: &mut AHashSet<String>) {
    match expr {
        Expr::Identifier { name, .. } => {
            set.insert(name.clone());
        }
        Expr::Function { params, body, .. } => {
            for p in params {
                set.insert(p.clone());
            }
            collect_all_identifiers(body, set);
        }
        Expr::Array { elements, .. } => {
            for e in elements {
                collect_expr_identifiers(e, set);
            }
        }
        Expr::Map { entries, .. } => {
            for (k, v) in entries {
                collect_expr_identifiers(k, set);
                collect_expr_identifiers(v, set);
            }
        }
        Expr::Unary { operand, .. } => collect_expr_identifiers(operand, set),
        Expr::Binary { left, right, .. } | Expr::Logical { left, right, .. } => {
            collect_expr_identifiers(left, set);
            collect_expr_identifiers(right, set);
        }
        Expr::Call { callee, args, .. } => {
            collect_expr_identifiers(callee, set);
            for arg in args {
                collect_expr_identifiers(arg, set);
            }
        }
        Expr::Index { object, index, .. } => {
            collect_expr_identifiers(object, set);
            collect_expr_identifiers(index, set);
        }
        Expr::Field { object, .. } => collect_expr_identifiers(object, set),
        Expr::IfExpr { condition, then_value, else_value, .. } => {
            collect_expr_identifiers(condition, set);
            collect_expr_identifiers(then_value, set);
            collect_expr_identifiers(else_value, set);
        }
        Expr::Nil | Expr::Bool(_) | Expr::Number(_) | Expr::String(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lexer::tokenize;
    use crate::parser::Parser;

    fn compile(source: &str) -> Rc<FunctionProto> {
        let tokens = tokenize(source).unwrap();
        let stmts = Parser::new(tokens).parse().unwrap();
        Compiler::new().compile_script(&stmts, "<script>").unwrap()
    }

    #[test]
    fn test_trailing_expression_returns_value() {
        let proto = compile("1 + 2");
        assert_eq!(proto.chunk.code.last(), Some(&OpCode::ReturnValue));
    }

    #[test]
    fn test_script_assignments_are_globals() {
        let proto = compile("x = 1");
        assert!(proto
            .chunk
            .code
            .iter()
            .any(|op| matches!(op, OpCode::StoreGlobal(name) if name == "x")));
    }

    #[test]
    fn test_function_locals_are_slots() {
        let proto = compile("function f(a) { b = a + 1\nreturn b }");
        let inner = proto
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Constant::Function(f) => Some(f.clone()),
                _ => None,
            })
            .expect("inner function proto");
        assert_eq!(inner.arity, 1);
        assert_eq!(inner.local_count, 2);
        assert!(inner.chunk.code.iter().any(|op| matches!(op, OpCode::StoreLocal(1))));
    }

    #[test]
    fn test_captured_local_becomes_cell() {
        let proto = compile(
            "function outer() { n = 1\nreturn function () { return n } }",
        );
        let outer = proto
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Constant::Function(f) => Some(f.clone()),
                _ => None,
            })
            .expect("outer proto");
        assert!(outer.chunk.code.iter().any(|op| matches!(op, OpCode::NewCell(_))));
        let inner = outer
            .chunk
            .constants
            .iter()
            .find_map(|c| match c {
                Constant::Function(f) => Some(f.clone()),
                _ => None,
            })
            .expect("inner proto");
        assert_eq!(inner.upvalues.len(), 1);
        assert!(inner.chunk.code.iter().any(|op| matches!(op, OpCode::LoadUpvalue(0))));
    }

    #[test]
    fn test_logical_and_lowered_to_jumps() {
        let proto = compile("a && b");
        assert!(proto.chunk.code.iter().any(|op| matches!(op, OpCode::JumpIfFalse(_))));
        assert!(!proto.chunk.code.iter().any(|op| matches!(
            op,
            OpCode::Equal | OpCode::NotEqual
        )));
    }

    #[test]
    fn test_for_lowered_to_compare_and_jump() {
        let proto = compile("for (i = 0; i < 3; i = i + 1) { print(i) }");
        assert!(proto.chunk.code.iter().any(|op| matches!(op, OpCode::Less)));
        assert!(proto.chunk.code.iter().any(|op| matches!(op, OpCode::JumpBack(_))));
    }

    #[test]
    fn test_try_catch_finally_shape() {
        let proto = compile(
            "try { throw \"x\" } catch (e) { print(e) } finally { print(\"f\") }",
        );
        let begins = proto
            .chunk
            .code
            .iter()
            .filter(|op| matches!(op, OpCode::BeginTry { .. }))
            .count();
        assert_eq!(begins, 2);
        assert!(proto.chunk.code.iter().any(|op| matches!(op, OpCode::FinallyBegin)));
        assert!(proto.chunk.code.iter().any(|op| matches!(op, OpCode::FinallyEnd)));
        // Catch binding lands in a script-level local slot
        assert!(proto.chunk.code.iter().any(
            |op| matches!(op, OpCode::BeginTry { binding_slot: Some(0), .. })
        ));
        assert_eq!(proto.local_count, 1);
    }

    #[test]
    fn test_break_outside_loop_is_rejected() {
        let tokens = tokenize("break").unwrap();
        let stmts = Parser::new(tokens).parse().unwrap();
        let err = Compiler::new().compile_script(&stmts, "<script>").unwrap_err();
        assert!(err.message.contains("break"));
    }

    #[test]
    fn test_every_instruction_has_a_line() {
        let proto = compile("x = 1\ny = x + 2\nprint(y)");
        assert_eq!(proto.chunk.code.len(), proto.chunk.lines.len());
    }
}
