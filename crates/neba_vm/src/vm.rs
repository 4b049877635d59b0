use std::rc::Rc;

use indexmap::IndexMap;

use crate::chunk::{read_u16, read_u8, Bytecode};
use crate::error::{VmError, VmResult};
use crate::opcode::Op;
use crate::stdlib;
use crate::value::{ClosureObj, CompiledFunction, HashKey, Value};

pub const STACK_SIZE: usize = 2048;
pub const FRAMES_MAX: usize = 1024;
pub const GLOBALS_SIZE: usize = 65536;

struct Frame {
    closure: Rc<ClosureObj>,
    ip: usize,
    base_pointer: usize,
}

/// Stack-based interpreter over compiled bytecode. The topmost entry on
/// `frames` is always the call frame currently executing; the bottommost
/// wraps the whole program as a zero-argument, zero-local closure so it
/// can be driven through the same dispatch loop as any other call.
pub struct Vm {
    constants: Vec<Value>,
    stack: Vec<Value>,
    sp: usize,
    globals: Vec<Value>,
    frames: Vec<Frame>,
}

impl Vm {
    pub fn new(bytecode: Bytecode) -> Self {
        Self::new_with_globals_store(bytecode, vec![Value::Null; GLOBALS_SIZE])
    }

    /// REPL entry point: keep the global slots from a previous run so
    /// successive one-line compilations see each other's bindings.
    pub fn new_with_globals_store(bytecode: Bytecode, globals: Vec<Value>) -> Self {
        let main_fn = CompiledFunction {
            instructions: Rc::new(bytecode.instructions),
            num_locals: 0,
            num_parameters: 0,
            name: None,
        };
        let main_closure = Rc::new(ClosureObj { func: Rc::new(main_fn), free: Vec::new() });
        let main_frame = Frame { closure: main_closure, ip: 0, base_pointer: 0 };
        Vm {
            constants: bytecode.constants,
            stack: vec![Value::Null; STACK_SIZE],
            sp: 0,
            globals,
            frames: vec![main_frame],
        }
    }

    /// Hands the global slots back out so a REPL can feed them into the
    /// next `Vm::new_with_globals_store` call.
    pub fn take_globals(self) -> Vec<Value> {
        self.globals
    }

    /// The value of the last expression statement the program evaluated.
    pub fn last_popped(&self) -> &Value {
        &self.stack[self.sp]
    }

    pub fn run(&mut self) -> VmResult {
        while self.current_frame().ip < self.current_frame().closure.func.instructions.len() {
            let ins = self.current_frame().closure.func.instructions.clone();
            let ip = self.current_frame().ip;
            let op = Op::from_u8(ins[ip]).expect("invalid opcode in compiled bytecode");
            self.current_frame_mut().ip += 1;

            match op {
                Op::Constant => {
                    let idx = read_u16(&ins, self.current_frame().ip) as usize;
                    self.current_frame_mut().ip += 2;
                    self.push(self.constants[idx].clone())?;
                }
                Op::Pop => {
                    self.pop()?;
                }
                Op::Add | Op::Sub | Op::Mul | Op::Div => self.exec_binary_op(op)?,
                Op::True => self.push(Value::Bool(true))?,
                Op::False => self.push(Value::Bool(false))?,
                Op::Null => self.push(Value::Null)?,
                Op::Equal | Op::NotEqual | Op::GreaterThan => self.exec_comparison(op)?,
                Op::Minus => self.exec_minus()?,
                Op::Bang => self.exec_bang()?,
                Op::JumpNotTruthy => {
                    let pos = read_u16(&ins, self.current_frame().ip) as usize;
                    self.current_frame_mut().ip += 2;
                    let condition = self.pop()?;
                    if !condition.is_truthy() {
                        self.current_frame_mut().ip = pos;
                    }
                }
                Op::Jump => {
                    let pos = read_u16(&ins, self.current_frame().ip) as usize;
                    self.current_frame_mut().ip = pos;
                }
                Op::SetGlobal => {
                    let idx = read_u16(&ins, self.current_frame().ip) as usize;
                    self.current_frame_mut().ip += 2;
                    let val = self.pop()?;
                    self.globals[idx] = val;
                }
                Op::GetGlobal => {
                    let idx = read_u16(&ins, self.current_frame().ip) as usize;
                    self.current_frame_mut().ip += 2;
                    self.push(self.globals[idx].clone())?;
                }
                Op::SetLocal => {
                    let idx = read_u8(&ins, self.current_frame().ip) as usize;
                    self.current_frame_mut().ip += 1;
                    let base = self.current_frame().base_pointer;
                    let val = self.pop()?;
                    self.stack[base + idx] = val;
                }
                Op::GetLocal => {
                    let idx = read_u8(&ins, self.current_frame().ip) as usize;
                    self.current_frame_mut().ip += 1;
                    let base = self.current_frame().base_pointer;
                    self.push(self.stack[base + idx].clone())?;
                }
                Op::GetBuiltin => {
                    let idx = read_u8(&ins, self.current_frame().ip) as usize;
                    self.current_frame_mut().ip += 1;
                    let (name, func) = stdlib::BUILTINS[idx];
                    self.push(Value::Builtin(name, func))?;
                }
                Op::GetFree => {
                    let idx = read_u8(&ins, self.current_frame().ip) as usize;
                    self.current_frame_mut().ip += 1;
                    let val = self.current_frame().closure.free[idx].clone();
                    self.push(val)?;
                }
                Op::Array => {
                    let n = read_u16(&ins, self.current_frame().ip) as usize;
                    self.current_frame_mut().ip += 2;
                    self.exec_array(n)?;
                }
                Op::Hash => {
                    let n = read_u16(&ins, self.current_frame().ip) as usize;
                    self.current_frame_mut().ip += 2;
                    self.exec_hash(n)?;
                }
                Op::Index => self.exec_index()?,
                Op::Call => {
                    let argc = read_u8(&ins, self.current_frame().ip) as usize;
                    self.current_frame_mut().ip += 1;
                    self.call_function(argc)?;
                }
                Op::ReturnValue => {
                    let return_value = self.pop()?;
                    let frame = self.frames.pop().expect("return with no active frame");
                    self.sp = frame.base_pointer - 1;
                    self.push(return_value)?;
                }
                Op::Return => {
                    let frame = self.frames.pop().expect("return with no active frame");
                    self.sp = frame.base_pointer - 1;
                    self.push(Value::Null)?;
                }
                Op::Closure => {
                    let const_idx = read_u16(&ins, self.current_frame().ip) as usize;
                    self.current_frame_mut().ip += 2;
                    let nfree = read_u8(&ins, self.current_frame().ip) as usize;
                    self.current_frame_mut().ip += 1;
                    self.exec_closure(const_idx, nfree)?;
                }
                Op::CurrentClosure => {
                    let closure = self.current_frame().closure.clone();
                    self.push(Value::Closure(closure))?;
                }
            }
        }
        Ok(self.last_popped().clone())
    }

    fn current_frame(&self) -> &Frame {
        self.frames.last().expect("frame stack is never empty while running")
    }

    fn current_frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("frame stack is never empty while running")
    }

    fn push(&mut self, value: Value) -> VmResult<()> {
        if self.sp >= STACK_SIZE {
            return Err(VmError::StackOverflow);
        }
        self.stack[self.sp] = value;
        self.sp += 1;
        Ok(())
    }

    fn pop(&mut self) -> VmResult<Value> {
        if self.sp == 0 {
            return Err(VmError::StackOverflow);
        }
        self.sp -= 1;
        Ok(self.stack[self.sp].clone())
    }

    fn exec_binary_op(&mut self, op: Op) -> VmResult<()> {
        let right = self.pop()?;
        let left = self.pop()?;
        match (&left, &right) {
            (Value::Int(l), Value::Int(r)) => self.exec_binary_int(op, *l, *r),
            (Value::Str(l), Value::Str(r)) => {
                if op == Op::Add {
                    self.push(Value::str(format!("{}{}", l, r)))
                } else {
                    Err(VmError::UnknownStringOperator(op_symbol(op)))
                }
            }
            _ => Err(VmError::UnsupportedTypesForBinaryOperation {
                left: left.type_name(),
                right: right.type_name(),
            }),
        }
    }

    fn exec_binary_int(&mut self, op: Op, l: i64, r: i64) -> VmResult<()> {
        let result = match op {
            Op::Add => l.wrapping_add(r),
            Op::Sub => l.wrapping_sub(r),
            Op::Mul => l.wrapping_mul(r),
            Op::Div => {
                if r == 0 {
                    return Err(VmError::DivisionByZero);
                }
                l / r
            }
            _ => return Err(VmError::UnknownIntegerOperator(op_symbol(op))),
        };
        self.push(Value::Int(result))
    }

    fn exec_comparison(&mut self, op: Op) -> VmResult<()> {
        let right = self.pop()?;
        let left = self.pop()?;
        if let (Value::Int(l), Value::Int(r)) = (&left, &right) {
            let result = match op {
                Op::Equal => l == r,
                Op::NotEqual => l != r,
                Op::GreaterThan => l > r,
                _ => unreachable!(),
            };
            return self.push(Value::Bool(result));
        }
        match op {
            Op::Equal => self.push(Value::Bool(left == right)),
            Op::NotEqual => self.push(Value::Bool(left != right)),
            Op::GreaterThan => Err(VmError::UnsupportedTypesForBinaryOperation {
                left: left.type_name(),
                right: right.type_name(),
            }),
            _ => unreachable!(),
        }
    }

    fn exec_minus(&mut self) -> VmResult<()> {
        match self.pop()? {
            Value::Int(n) => self.push(Value::Int(-n)),
            other => Err(VmError::UnsupportedTypesForBinaryOperation {
                left: other.type_name(),
                right: other.type_name(),
            }),
        }
    }

    fn exec_bang(&mut self) -> VmResult<()> {
        let val = self.pop()?;
        self.push(Value::Bool(!val.is_truthy()))
    }

    fn exec_array(&mut self, n: usize) -> VmResult<()> {
        let start = self.sp - n;
        let items = self.stack[start..self.sp].to_vec();
        self.sp = start;
        self.push(Value::array(items))
    }

    fn exec_hash(&mut self, n: usize) -> VmResult<()> {
        let start = self.sp - n;
        let mut map = IndexMap::new();
        let mut i = start;
        while i < self.sp {
            let key = self.stack[i].clone();
            let val = self.stack[i + 1].clone();
            let hk = HashKey::of(&key).ok_or(VmError::UnusableAsHashKey(key.type_name()))?;
            map.insert(hk, (key, val));
            i += 2;
        }
        self.sp = start;
        self.push(Value::Hash(Rc::new(map)))
    }

    fn exec_index(&mut self) -> VmResult<()> {
        let index = self.pop()?;
        let left = self.pop()?;
        match &left {
            Value::Array(a) => match index {
                Value::Int(i) => {
                    if i < 0 || i as usize >= a.len() {
                        self.push(Value::Null)
                    } else {
                        self.push(a[i as usize].clone())
                    }
                }
                other => Err(VmError::IndexOperatorNotSupported(other.type_name())),
            },
            Value::Hash(h) => {
                let hk = HashKey::of(&index).ok_or_else(|| VmError::UnusableAsHashKey(index.type_name()))?;
                match h.get(&hk) {
                    Some((_, v)) => self.push(v.clone()),
                    None => self.push(Value::Null),
                }
            }
            other => Err(VmError::IndexOperatorNotSupported(other.type_name())),
        }
    }

    fn exec_closure(&mut self, const_idx: usize, nfree: usize) -> VmResult<()> {
        let func = match &self.constants[const_idx] {
            Value::CompiledFunction(f) => f.clone(),
            _ => return Err(VmError::NotAFunction),
        };
        let free = self.stack[self.sp - nfree..self.sp].to_vec();
        self.sp -= nfree;
        self.push(Value::Closure(Rc::new(ClosureObj { func, free })))
    }

    fn call_function(&mut self, argc: usize) -> VmResult<()> {
        let callee = self.stack[self.sp - 1 - argc].clone();
        match callee {
            Value::Closure(closure) => {
                if argc != closure.func.num_parameters {
                    return Err(VmError::WrongNumberOfArguments {
                        want: closure.func.num_parameters,
                        got: argc,
                    });
                }
                if self.frames.len() >= FRAMES_MAX {
                    return Err(VmError::StackOverflow);
                }
                let base_pointer = self.sp - argc;
                let num_locals = closure.func.num_locals;
                self.frames.push(Frame { closure, ip: 0, base_pointer });
                self.sp = base_pointer + num_locals;
                Ok(())
            }
            Value::Builtin(_, func) => {
                let args = self.stack[self.sp - argc..self.sp].to_vec();
                let result = func(&args)?;
                self.sp = self.sp - argc - 1;
                self.push(result)
            }
            _ => Err(VmError::CallingNonFunction),
        }
    }
}

fn op_symbol(op: Op) -> &'static str {
    match op {
        Op::Add => "+",
        Op::Sub => "-",
        Op::Mul => "*",
        Op::Div => "/",
        _ => "?",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;
    use neba_parser::parse;

    fn run_src(src: &str) -> Value {
        let (program, lex_errors, parse_errors) = parse(src);
        assert!(lex_errors.is_empty(), "{:?}", lex_errors);
        assert!(parse_errors.is_empty(), "{:?}", parse_errors);
        let mut compiler = Compiler::new();
        let bytecode = compiler.compile(&program).expect("compile error");
        let mut vm = Vm::new(bytecode);
        vm.run().expect("runtime error")
    }

    #[test]
    fn test_integer_arithmetic() {
        assert_eq!(run_src("1 + 2 * 3;"), Value::Int(7));
        assert_eq!(run_src("(1 + 2) * 3;"), Value::Int(9));
        assert_eq!(run_src("10 / 2 - 1;"), Value::Int(4));
    }

    #[test]
    fn test_division_by_zero_is_runtime_error() {
        let (program, _, _) = parse("1 / 0;");
        let mut compiler = Compiler::new();
        let bytecode = compiler.compile(&program).unwrap();
        let mut vm = Vm::new(bytecode);
        assert_eq!(vm.run(), Err(VmError::DivisionByZero));
    }

    #[test]
    fn test_string_concatenation() {
        assert_eq!(run_src(r#""foo" + "bar";"#), Value::str("foobar"));
    }

    #[test]
    fn test_boolean_and_comparison() {
        assert_eq!(run_src("1 < 2;"), Value::Bool(true));
        assert_eq!(run_src("1 > 2;"), Value::Bool(false));
        assert_eq!(run_src("(1 < 2) == true;"), Value::Bool(true));
    }

    #[test]
    fn test_if_else_expression() {
        assert_eq!(run_src("if (true) { 10 } else { 20 };"), Value::Int(10));
        assert_eq!(run_src("if (false) { 10 } else { 20 };"), Value::Int(20));
        assert_eq!(run_src("if (false) { 10 };"), Value::Null);
    }

    #[test]
    fn test_global_let_bindings() {
        assert_eq!(run_src("let a = 5; let b = a + 10; b;"), Value::Int(15));
    }

    #[test]
    fn test_assignment_updates_global() {
        assert_eq!(run_src("let x = 1; x = x + 41; x;"), Value::Int(42));
    }

    #[test]
    fn test_compound_assignment() {
        assert_eq!(run_src("let x = 10; x -= 3; x;"), Value::Int(7));
    }

    #[test]
    fn test_while_loop_with_shadowing_let() {
        // The `let i` inside the loop body redefines in the same scope each
        // pass; the outer binding created before the loop is left alone.
        let src = "let i = 0; let total = 0; while (i < 3) { let i = i + 1; total = total + i; } total;";
        assert_eq!(run_src(src), Value::Int(6));
    }

    #[test]
    fn test_function_call_with_return() {
        assert_eq!(run_src("let add = fn(a, b) { return a + b; }; add(2, 3);"), Value::Int(5));
    }

    #[test]
    fn test_function_implicit_return_of_last_expression() {
        assert_eq!(run_src("let add = fn(a, b) { a + b }; add(2, 3);"), Value::Int(5));
    }

    #[test]
    fn test_closures_capture_free_variables() {
        let src = "let new_adder = fn(a) { fn(b) { a + b } }; let add_two = new_adder(2); add_two(3);";
        assert_eq!(run_src(src), Value::Int(5));
    }

    #[test]
    fn test_closure_free_vector_length_matches_captures() {
        let (program, _, _) = parse(
            "let new_adder = fn(a) { fn(b) { a + b } }; let add_two = new_adder(2); add_two(3);",
        );
        let mut compiler = Compiler::new();
        let bytecode = compiler.compile(&program).unwrap();
        let mut vm = Vm::new(bytecode);
        vm.run().unwrap();
        let globals = vm.take_globals();
        // add_two is the second global binding (index 1).
        match &globals[1] {
            Value::Closure(c) => assert_eq!(c.free.len(), 1),
            other => panic!("expected add_two to be a Closure, got {:?}", other),
        }
    }

    #[test]
    fn test_recursive_factorial() {
        let src = "let fact = fn(n) { if (n < 2) { 1 } else { n * fact(n - 1) } }; fact(5);";
        assert_eq!(run_src(src), Value::Int(120));
    }

    #[test]
    fn test_recursive_function_defined_in_local_scope() {
        // `fact` is a local of `make_fact`'s frame, not a global: a naive
        // free-variable capture would read that slot before it is
        // assigned. The Function-scope self-reference must bypass that.
        let src = "let make_fact = fn() { \
                       let fact = fn(n) { if (n < 2) { 1 } else { n * fact(n - 1) } }; \
                       fact \
                   }; \
                   make_fact()(5);";
        assert_eq!(run_src(src), Value::Int(120));
    }

    #[test]
    fn test_wrong_number_of_arguments_is_runtime_error() {
        let (program, _, _) = parse("let f = fn(a, b) { a + b }; f(1);");
        let mut compiler = Compiler::new();
        let bytecode = compiler.compile(&program).unwrap();
        let mut vm = Vm::new(bytecode);
        assert_eq!(vm.run(), Err(VmError::WrongNumberOfArguments { want: 2, got: 1 }));
    }

    #[test]
    fn test_array_literal_and_index() {
        assert_eq!(run_src("[1, 2, 3][1];"), Value::Int(2));
        assert_eq!(run_src("[1, 2, 3][10];"), Value::Null);
    }

    #[test]
    fn test_hash_literal_and_index() {
        assert_eq!(run_src(r#"{"a": 1, "b": 2}["b"];"#), Value::Int(2));
        assert_eq!(run_src(r#"{"a": 1}["missing"];"#), Value::Null);
    }

    #[test]
    fn test_builtins_len_first_last_rest_push() {
        assert_eq!(run_src(r#"len("hello");"#), Value::Int(5));
        assert_eq!(run_src("first([1, 2, 3]);"), Value::Int(1));
        assert_eq!(run_src("last([1, 2, 3]);"), Value::Int(3));
        assert_eq!(run_src("len(rest([1, 2, 3]));"), Value::Int(2));
        assert_eq!(run_src("len(push([1, 2], 3));"), Value::Int(3));
    }

    #[test]
    fn test_push_is_functional_not_mutating() {
        let src = "let a = [1]; let b = push(a, 2); len(a);";
        assert_eq!(run_src(src), Value::Int(1));
    }

    #[test]
    fn test_repl_state_preserves_globals_and_stack_across_runs() {
        let (program1, _, _) = parse("let a = 10;");
        let mut compiler = Compiler::new();
        let bytecode1 = compiler.compile(&program1).unwrap();
        let (constants, symbol_table) = compiler.into_state();
        let mut vm = Vm::new(bytecode1);
        vm.run().unwrap();
        let globals = vm.take_globals();

        let (program2, _, _) = parse("a + 5;");
        let mut compiler2 = Compiler::new_with_state(constants, symbol_table);
        let bytecode2 = compiler2.compile(&program2).unwrap();
        let mut vm2 = Vm::new_with_globals_store(bytecode2, globals);
        assert_eq!(vm2.run().unwrap(), Value::Int(15));
    }
}
