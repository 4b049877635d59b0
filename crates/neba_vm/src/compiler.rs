use std::rc::Rc;

use neba_parser::ast::{
    AssignOp, BinOp, BlockStatement, Expr, ExprKind, Program, Stmt, StmtKind, UnaryOp,
};

use crate::chunk::{make, Bytecode};
use crate::error::{CompileError, CompileResult};
use crate::opcode::Op;
use crate::stdlib;
use crate::symbol_table::{Symbol, SymbolScope, SymbolTable};
use crate::value::{CompiledFunction, Value};

#[derive(Debug, Clone, Copy, PartialEq)]
struct EmittedInstruction {
    op: Op,
    position: usize,
}

/// One function body's worth of instructions, plus enough bookkeeping to
/// back-patch the two most recently emitted instructions (needed to strip
/// a trailing `Pop` when a block turns out to be an expression's tail).
struct CompilationScope {
    instructions: Vec<u8>,
    last_instruction: Option<EmittedInstruction>,
    previous_instruction: Option<EmittedInstruction>,
}

impl CompilationScope {
    fn new() -> Self {
        CompilationScope { instructions: Vec::new(), last_instruction: None, previous_instruction: None }
    }
}

/// Walks the AST once, emitting bytecode and a parallel constant pool.
/// Scopes nest by pushing a fresh `CompilationScope` and a fresh
/// `SymbolTable` level together; leaving a scope pops both in lockstep.
pub struct Compiler {
    constants: Vec<Value>,
    symbol_table: SymbolTable,
    scopes: Vec<CompilationScope>,
}

impl Compiler {
    pub fn new() -> Self {
        let mut symbol_table = SymbolTable::new();
        for (i, (name, _)) in stdlib::BUILTINS.iter().enumerate() {
            symbol_table.define_builtin(i, name);
        }
        Compiler { constants: Vec::new(), symbol_table, scopes: vec![CompilationScope::new()] }
    }

    /// REPL entry point: resume compiling against constants and bindings
    /// left over from a previous top-level compilation.
    pub fn new_with_state(constants: Vec<Value>, symbol_table: SymbolTable) -> Self {
        Compiler { constants, symbol_table, scopes: vec![CompilationScope::new()] }
    }

    /// Hands back the constant pool and global bindings so the REPL can
    /// feed them into the next `Compiler::new_with_state` call.
    pub fn into_state(self) -> (Vec<Value>, SymbolTable) {
        (self.constants, self.symbol_table)
    }

    pub fn compile(&mut self, program: &Program) -> CompileResult<Bytecode> {
        self.compile_program(program)?;
        Ok(self.bytecode())
    }

    pub fn bytecode(&self) -> Bytecode {
        Bytecode { instructions: self.current_instructions().clone(), constants: self.constants.clone() }
    }

    fn compile_program(&mut self, program: &Program) -> CompileResult<()> {
        for stmt in &program.stmts {
            self.compile_stmt(stmt)?;
        }
        Ok(())
    }

    fn compile_block(&mut self, block: &BlockStatement) -> CompileResult<()> {
        for stmt in &block.stmts {
            self.compile_stmt(stmt)?;
        }
        Ok(())
    }

    fn compile_stmt(&mut self, stmt: &Stmt) -> CompileResult<()> {
        match &stmt.inner {
            StmtKind::Let { name, value } => {
                // Pre-defining the name before compiling a function literal's
                // body is what lets the literal call itself by this name.
                // Any other value is compiled first so `let x = x + 1`
                // still sees the outer `x`, not a half-defined shadow.
                if matches!(value.inner, ExprKind::FunctionLiteral { .. }) {
                    let symbol = self.symbol_table.define(name);
                    self.compile_expr(value)?;
                    self.emit_set(&symbol);
                } else {
                    self.compile_expr(value)?;
                    let symbol = self.symbol_table.define(name);
                    self.emit_set(&symbol);
                }
                Ok(())
            }
            StmtKind::Return(expr) => {
                self.compile_expr(expr)?;
                self.emit(Op::ReturnValue, &[]);
                Ok(())
            }
            StmtKind::While { condition, body } => self.compile_while(condition, body),
            StmtKind::FunctionDefinition { name, params, body } => {
                let symbol = self.symbol_table.define(name);
                self.compile_function_literal(Some(name.clone()), params, body)?;
                self.emit_set(&symbol);
                Ok(())
            }
            StmtKind::Expr(expr) => {
                self.compile_expr(expr)?;
                self.emit(Op::Pop, &[]);
                Ok(())
            }
        }
    }

    fn compile_while(&mut self, condition: &Expr, body: &BlockStatement) -> CompileResult<()> {
        let loop_start = self.current_instructions().len();
        self.compile_expr(condition)?;
        let jnt_pos = self.emit(Op::JumpNotTruthy, &[9999]);
        // The loop body shares this scope's symbol table: a `let` inside
        // re-defines in place rather than opening a nested scope.
        self.compile_block(body)?;
        self.emit(Op::Jump, &[loop_start]);
        let after_loop = self.current_instructions().len();
        self.change_operand(jnt_pos, after_loop);
        Ok(())
    }

    fn compile_expr(&mut self, expr: &Expr) -> CompileResult<()> {
        match &expr.inner {
            ExprKind::Int(n) => {
                let idx = self.add_constant(Value::Int(*n));
                self.emit(Op::Constant, &[idx]);
            }
            ExprKind::Str(s) => {
                let idx = self.add_constant(Value::str(s.clone()));
                self.emit(Op::Constant, &[idx]);
            }
            ExprKind::Bool(true) => {
                self.emit(Op::True, &[]);
            }
            ExprKind::Bool(false) => {
                self.emit(Op::False, &[]);
            }
            ExprKind::Null => {
                self.emit(Op::Null, &[]);
            }
            ExprKind::Ident(name) => {
                let symbol = self
                    .symbol_table
                    .resolve(name)
                    .ok_or_else(|| CompileError::UndefinedVariable(name.clone()))?;
                self.load_symbol(&symbol);
            }
            ExprKind::Unary { op, operand } => {
                self.compile_expr(operand)?;
                match op {
                    UnaryOp::Neg => self.emit(Op::Minus, &[]),
                    UnaryOp::Not => self.emit(Op::Bang, &[]),
                };
            }
            ExprKind::Binary { op, left, right } => self.compile_binary(*op, left, right)?,
            ExprKind::If { condition, consequence, alternative } => {
                self.compile_if(condition, consequence, alternative.as_ref())?
            }
            ExprKind::FunctionLiteral { name, params, body } => {
                self.compile_function_literal(name.clone(), params, body)?
            }
            ExprKind::Call { callee, args } => {
                self.compile_expr(callee)?;
                for arg in args {
                    self.compile_expr(arg)?;
                }
                self.emit(Op::Call, &[args.len()]);
            }
            ExprKind::Array(items) => {
                for item in items {
                    self.compile_expr(item)?;
                }
                self.emit(Op::Array, &[items.len()]);
            }
            ExprKind::Hash(pairs) => {
                // Sort by the key expression's source-level rendering so
                // output and disassembly are stable across runs.
                let mut ordered: Vec<&(Expr, Expr)> = pairs.iter().collect();
                ordered.sort_by_key(|(k, _)| format!("{:?}", k.inner));
                for (k, v) in &ordered {
                    self.compile_expr(k)?;
                    self.compile_expr(v)?;
                }
                self.emit(Op::Hash, &[pairs.len() * 2]);
            }
            ExprKind::Index { left, index } => {
                self.compile_expr(left)?;
                self.compile_expr(index)?;
                self.emit(Op::Index, &[]);
            }
            ExprKind::Assign { name, op, value } => self.compile_assign(name, *op, value)?,
        }
        Ok(())
    }

    fn compile_binary(&mut self, op: BinOp, left: &Expr, right: &Expr) -> CompileResult<()> {
        if op == BinOp::Lt {
            // No dedicated LessThan opcode: swap operands and reuse GreaterThan.
            self.compile_expr(right)?;
            self.compile_expr(left)?;
            self.emit(Op::GreaterThan, &[]);
            return Ok(());
        }
        self.compile_expr(left)?;
        self.compile_expr(right)?;
        match op {
            BinOp::Add => self.emit(Op::Add, &[]),
            BinOp::Sub => self.emit(Op::Sub, &[]),
            BinOp::Mul => self.emit(Op::Mul, &[]),
            BinOp::Div => self.emit(Op::Div, &[]),
            BinOp::Gt => self.emit(Op::GreaterThan, &[]),
            BinOp::Eq => self.emit(Op::Equal, &[]),
            BinOp::Ne => self.emit(Op::NotEqual, &[]),
            BinOp::Lt => unreachable!(),
        };
        Ok(())
    }

    fn compile_if(
        &mut self,
        condition: &Expr,
        consequence: &BlockStatement,
        alternative: Option<&BlockStatement>,
    ) -> CompileResult<()> {
        self.compile_expr(condition)?;
        let jnt_pos = self.emit(Op::JumpNotTruthy, &[9999]);

        self.compile_block(consequence)?;
        if self.last_instruction_is(Op::Pop) {
            self.remove_last_pop();
        }
        let jump_pos = self.emit(Op::Jump, &[9999]);

        let after_consequence = self.current_instructions().len();
        self.change_operand(jnt_pos, after_consequence);

        match alternative {
            Some(alt) => {
                self.compile_block(alt)?;
                if self.last_instruction_is(Op::Pop) {
                    self.remove_last_pop();
                }
            }
            None => {
                self.emit(Op::Null, &[]);
            }
        }

        let after_alternative = self.current_instructions().len();
        self.change_operand(jump_pos, after_alternative);
        Ok(())
    }

    fn compile_function_literal(
        &mut self,
        name: Option<String>,
        params: &[String],
        body: &BlockStatement,
    ) -> CompileResult<()> {
        self.enter_scope();

        // A named literal's own name resolves inside its body to a
        // Function-scope symbol, not the outer binding: this is what lets
        // a recursive call work whether that outer binding is a global
        // (resolved after the closure is built) or a still-uninitialized
        // local slot (which a Free capture would otherwise read too early).
        if let Some(fn_name) = &name {
            self.symbol_table.define_function_name(fn_name);
        }

        for p in params {
            self.symbol_table.define(p);
        }

        self.compile_block(body)?;
        self.finalize_function_body();

        let free_symbols = self.symbol_table.free_symbols.clone();
        let num_locals = self.symbol_table.num_definitions();
        let instructions = self.leave_scope();

        for sym in &free_symbols {
            self.load_symbol(sym);
        }

        let compiled = CompiledFunction {
            instructions: Rc::new(instructions),
            num_locals,
            num_parameters: params.len(),
            name,
        };
        let const_idx = self.add_constant(Value::CompiledFunction(Rc::new(compiled)));
        self.emit(Op::Closure, &[const_idx, free_symbols.len()]);
        Ok(())
    }

    fn compile_assign(&mut self, name: &str, op: AssignOp, value: &Expr) -> CompileResult<()> {
        let symbol = self
            .symbol_table
            .resolve(name)
            .ok_or_else(|| CompileError::UndefinedVariable(name.to_string()))?;
        if !matches!(symbol.scope, SymbolScope::Global | SymbolScope::Local) {
            return Err(CompileError::UnknownOperator(format!("cannot assign to '{}'", name)));
        }

        match op {
            AssignOp::Assign => {
                self.compile_expr(value)?;
            }
            AssignOp::AddAssign | AssignOp::SubAssign | AssignOp::MulAssign | AssignOp::DivAssign => {
                self.load_symbol(&symbol);
                self.compile_expr(value)?;
                let bin_op = match op {
                    AssignOp::AddAssign => Op::Add,
                    AssignOp::SubAssign => Op::Sub,
                    AssignOp::MulAssign => Op::Mul,
                    AssignOp::DivAssign => Op::Div,
                    AssignOp::Assign => unreachable!(),
                };
                self.emit(bin_op, &[]);
            }
        }

        // Set consumes the value; reload it so the assignment still
        // evaluates to that value as an expression (there is no Dup op).
        self.emit_set(&symbol);
        self.load_symbol(&symbol);
        Ok(())
    }

    fn emit_set(&mut self, symbol: &Symbol) {
        match symbol.scope {
            SymbolScope::Global => {
                self.emit(Op::SetGlobal, &[symbol.index]);
            }
            SymbolScope::Local => {
                self.emit(Op::SetLocal, &[symbol.index]);
            }
            SymbolScope::Builtin | SymbolScope::Free | SymbolScope::Function => {
                unreachable!("cannot store into a {:?} symbol", symbol.scope)
            }
        }
    }

    fn load_symbol(&mut self, symbol: &Symbol) {
        match symbol.scope {
            SymbolScope::Global => self.emit(Op::GetGlobal, &[symbol.index]),
            SymbolScope::Local => self.emit(Op::GetLocal, &[symbol.index]),
            SymbolScope::Builtin => self.emit(Op::GetBuiltin, &[symbol.index]),
            SymbolScope::Free => self.emit(Op::GetFree, &[symbol.index]),
            SymbolScope::Function => self.emit(Op::CurrentClosure, &[]),
        };
    }

    // ── scope / instruction plumbing ───────────────────────────────────────

    fn enter_scope(&mut self) {
        self.scopes.push(CompilationScope::new());
        let outer = std::mem::replace(&mut self.symbol_table, SymbolTable::new());
        self.symbol_table = SymbolTable::new_enclosed(outer);
    }

    fn leave_scope(&mut self) -> Vec<u8> {
        let scope = self.scopes.pop().expect("leave_scope on empty scope stack");
        let inner = std::mem::replace(&mut self.symbol_table, SymbolTable::new());
        self.symbol_table = inner.pop();
        scope.instructions
    }

    fn finalize_function_body(&mut self) {
        if self.last_instruction_is(Op::Pop) {
            self.replace_last_pop_with_return();
        } else if !self.last_instruction_is(Op::ReturnValue) {
            self.emit(Op::Return, &[]);
        }
    }

    fn replace_last_pop_with_return(&mut self) {
        let pos = self.current_scope().last_instruction.unwrap().position;
        self.replace_instruction(pos, &make(Op::ReturnValue, &[]));
        self.current_scope_mut().last_instruction.as_mut().unwrap().op = Op::ReturnValue;
    }

    fn add_constant(&mut self, value: Value) -> usize {
        self.constants.push(value);
        self.constants.len() - 1
    }

    fn emit(&mut self, op: Op, operands: &[usize]) -> usize {
        let ins = make(op, operands);
        let pos = self.add_instruction(ins);
        self.set_last_instruction(op, pos);
        pos
    }

    fn add_instruction(&mut self, ins: Vec<u8>) -> usize {
        let pos = self.current_instructions().len();
        self.current_scope_mut().instructions.extend(ins);
        pos
    }

    fn set_last_instruction(&mut self, op: Op, position: usize) {
        let scope = self.current_scope_mut();
        scope.previous_instruction = scope.last_instruction.take();
        scope.last_instruction = Some(EmittedInstruction { op, position });
    }

    fn last_instruction_is(&self, op: Op) -> bool {
        self.current_scope().last_instruction.map(|i| i.op == op).unwrap_or(false)
    }

    fn remove_last_pop(&mut self) {
        let last = self.current_scope().last_instruction.unwrap();
        self.current_scope_mut().instructions.truncate(last.position);
        let scope = self.current_scope_mut();
        scope.last_instruction = scope.previous_instruction.take();
    }

    fn replace_instruction(&mut self, pos: usize, new_instruction: &[u8]) {
        let ins = &mut self.current_scope_mut().instructions;
        ins[pos..pos + new_instruction.len()].copy_from_slice(new_instruction);
    }

    fn change_operand(&mut self, pos: usize, operand: usize) {
        let op = Op::from_u8(self.current_instructions()[pos]).expect("valid opcode at back-patch site");
        let new_ins = make(op, &[operand]);
        self.replace_instruction(pos, &new_ins);
    }

    fn current_instructions(&self) -> &Vec<u8> {
        &self.scopes.last().unwrap().instructions
    }

    fn current_scope(&self) -> &CompilationScope {
        self.scopes.last().unwrap()
    }

    fn current_scope_mut(&mut self) -> &mut CompilationScope {
        self.scopes.last_mut().unwrap()
    }
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use neba_parser::parse;

    fn compile_src(src: &str) -> Bytecode {
        let (program, lex_errors, parse_errors) = parse(src);
        assert!(lex_errors.is_empty(), "{:?}", lex_errors);
        assert!(parse_errors.is_empty(), "{:?}", parse_errors);
        let mut compiler = Compiler::new();
        compiler.compile(&program).expect("compile error")
    }

    #[test]
    fn test_integer_arithmetic_emits_add() {
        let bc = compile_src("1 + 2;");
        assert!(bc.instructions.contains(&(Op::Add as u8)));
    }

    #[test]
    fn test_less_than_reorders_into_greater_than() {
        let bc = compile_src("1 < 2;");
        assert!(bc.instructions.contains(&(Op::GreaterThan as u8)));
        assert!(!bc.instructions.contains(&(Op::Add as u8)));
    }

    #[test]
    fn test_global_let_emits_set_global() {
        let bc = compile_src("let x = 5;");
        assert!(bc.instructions.contains(&(Op::SetGlobal as u8)));
    }

    #[test]
    fn test_if_without_else_pushes_null_branch() {
        let bc = compile_src("if (true) { 10 };");
        assert!(bc.instructions.contains(&(Op::Null as u8)));
    }

    #[test]
    fn test_while_loop_jumps_backward() {
        let bc = compile_src("let i = 0; while (i < 3) { i = i + 1; }");
        assert!(bc.instructions.contains(&(Op::Jump as u8)));
        assert!(bc.instructions.contains(&(Op::JumpNotTruthy as u8)));
    }

    #[test]
    fn test_function_literal_produces_closure_constant() {
        let bc = compile_src("let f = fn(x) { return x; };");
        let has_fn = bc.constants.iter().any(|c| matches!(c, Value::CompiledFunction(_)));
        assert!(has_fn);
        assert!(bc.instructions.contains(&(Op::Closure as u8)));
    }

    #[test]
    fn test_recursive_function_resolves_self_name_via_current_closure() {
        let bc = compile_src("let fact = fn(n) { return fact(n); };");
        match bc.constants.iter().find(|c| matches!(c, Value::CompiledFunction(_))) {
            Some(Value::CompiledFunction(f)) => {
                assert!(f.instructions.contains(&(Op::CurrentClosure as u8)));
                assert!(!f.instructions.contains(&(Op::GetGlobal as u8)));
            }
            _ => panic!("expected a compiled function constant"),
        }
    }

    #[test]
    fn test_closure_captures_free_variable() {
        let bc = compile_src("let adder = fn(a) { fn(b) { a + b } };");
        assert!(bc.instructions.contains(&(Op::Closure as u8)));
    }

    #[test]
    fn test_closure_nfree_operand_matches_captured_count() {
        // The inner `fn(b) { a + b }` captures exactly one free variable
        // (`a`); its `Closure` instruction's nfree operand must say so.
        let bc = compile_src("let adder = fn(a) { fn(b) { a + b } };");
        let outer = match bc.constants.iter().find(|c| matches!(c, Value::CompiledFunction(_))) {
            Some(Value::CompiledFunction(f)) => f,
            _ => panic!("expected a compiled function constant for the outer literal"),
        };
        let closure_pos = outer
            .instructions
            .iter()
            .position(|&b| b == Op::Closure as u8)
            .expect("outer function body should build the inner closure");
        let nfree = outer.instructions[closure_pos + 3];
        assert_eq!(nfree, 1);
    }

    #[test]
    fn test_undefined_variable_is_compile_error() {
        let (program, _, _) = parse("foo;");
        let mut compiler = Compiler::new();
        let err = compiler.compile(&program).unwrap_err();
        assert!(matches!(err, CompileError::UndefinedVariable(n) if n == "foo"));
    }

    #[test]
    fn test_assign_to_builtin_is_compile_error() {
        let (program, _, _) = parse("len = 5;");
        let mut compiler = Compiler::new();
        assert!(compiler.compile(&program).is_err());
    }

    #[test]
    fn test_compound_assign_reloads_value() {
        let bc = compile_src("let x = 1; x += 2;");
        assert!(bc.instructions.contains(&(Op::Add as u8)));
        assert!(bc.instructions.contains(&(Op::SetGlobal as u8)));
        assert!(bc.instructions.contains(&(Op::GetGlobal as u8)));
    }

    #[test]
    fn test_hash_literal_keys_are_sorted_deterministically() {
        let bc1 = compile_src(r#"{"b": 1, "a": 2};"#);
        let bc2 = compile_src(r#"{"a": 2, "b": 1};"#);
        assert_eq!(bc1.instructions, bc2.instructions);
    }

    #[test]
    fn test_repl_state_round_trip_keeps_globals() {
        let (program1, _, _) = parse("let a = 1;");
        let mut compiler = Compiler::new();
        compiler.compile(&program1).unwrap();
        let (constants, symbol_table) = compiler.into_state();

        let (program2, _, _) = parse("a + 1;");
        let mut compiler2 = Compiler::new_with_state(constants, symbol_table);
        let bc = compiler2.compile(&program2).unwrap();
        assert!(bc.instructions.contains(&(Op::GetGlobal as u8)));
    }
}
