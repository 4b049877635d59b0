pub mod chunk;
pub mod compiler;
pub mod error;
pub mod opcode;
pub mod stdlib;
pub mod symbol_table;
pub mod value;
pub mod vm;

pub use compiler::Compiler;
pub use error::{CompileError, VmError, VmResult};
pub use symbol_table::SymbolTable;
pub use value::Value;
pub use vm::Vm;

/// Compiles and runs one piece of source in a fresh compiler and VM. Each
/// call starts from empty constants/globals — for a session that should
/// remember bindings across calls, use `Repl` instead.
pub fn run(source: &str) -> VmResult<Value> {
    let (program, _lex_errors, parse_errors) = neba_parser::parse(source);
    if let Some(e) = parse_errors.into_iter().next() {
        return Err(VmError::Compile(CompileError::UnknownOperator(e.to_string())));
    }
    let mut compiler = Compiler::new();
    let bytecode = compiler.compile(&program)?;
    let mut vm = Vm::new(bytecode);
    vm.run()
}

/// Keeps a compiler's constant pool/symbol table and a VM's global slots
/// alive across calls, the way an interactive session needs to: each line
/// typed at the prompt sees bindings the previous lines created.
pub struct Repl {
    constants: Vec<Value>,
    symbol_table: SymbolTable,
    globals: Vec<Value>,
}

impl Repl {
    pub fn new() -> Self {
        Repl { constants: Vec::new(), symbol_table: SymbolTable::new(), globals: vec![Value::Null; vm::GLOBALS_SIZE] }
    }

    pub fn eval(&mut self, source: &str) -> VmResult<Value> {
        let (program, _lex_errors, parse_errors) = neba_parser::parse(source);
        if let Some(e) = parse_errors.into_iter().next() {
            return Err(VmError::Compile(CompileError::UnknownOperator(e.to_string())));
        }

        // Restore `self.constants`/`self.symbol_table` from whatever the
        // compiler ends up holding regardless of whether compilation
        // succeeds — a failed compile must not leave the REPL's state
        // behind in a dropped `Compiler`, or the next `eval()` would
        // silently restart from an empty symbol table.
        let constants = std::mem::take(&mut self.constants);
        let symbol_table = std::mem::replace(&mut self.symbol_table, SymbolTable::new());
        let mut compiler = Compiler::new_with_state(constants, symbol_table);
        let compiled = compiler.compile(&program);
        let (constants, symbol_table) = compiler.into_state();
        self.constants = constants;
        self.symbol_table = symbol_table;
        let bytecode = compiled?;

        // Same discipline for globals: hand them to the VM, but reclaim
        // them via `take_globals()` whether or not `run()` errors, so a
        // runtime error never strands the real globals store inside a
        // dropped `Vm`.
        let globals = std::mem::take(&mut self.globals);
        let mut vm = Vm::new_with_globals_store(bytecode, globals);
        let result = vm.run();
        self.globals = vm.take_globals();
        result
    }
}

impl Default for Repl {
    fn default() -> Self {
        Self::new()
    }
}
