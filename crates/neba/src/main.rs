use std::env;
use std::fs;
use std::process;

use neba_parser::parse;
use neba_vm::{Repl, Value};

fn main() {
    env_logger::init();
    let args: Vec<String> = env::args().collect();
    match args.len() {
        1 => run_repl(),
        2 => match fs::read_to_string(&args[1]) {
            Ok(source) => run_source(&args[1], &source),
            Err(e) => {
                log::error!("cannot read '{}': {}", args[1], e);
                eprintln!("neba: cannot read '{}': {}", args[1], e);
                process::exit(1);
            }
        },
        _ => {
            eprintln!("Usage: neba [script.neba]");
            process::exit(1);
        }
    }
}

fn run_source(path: &str, source: &str) {
    log::info!("compiling {}", path);
    let (program, lex_errors, parse_errors) = parse(source);
    let has_errors = !lex_errors.is_empty() || !parse_errors.is_empty();
    for e in &lex_errors {
        eprintln!("[LexError] {}", e);
    }
    for e in &parse_errors {
        eprintln!("[ParseError] {}", e);
    }
    if has_errors {
        eprintln!("{} error(s).", lex_errors.len() + parse_errors.len());
        process::exit(1);
    }

    let mut compiler = neba_vm::Compiler::new();
    let bytecode = match compiler.compile(&program) {
        Ok(bc) => bc,
        Err(e) => {
            eprintln!("[CompileError] {}", e);
            process::exit(1);
        }
    };

    let mut vm = neba_vm::Vm::new(bytecode);
    match vm.run() {
        Ok(_) => {}
        Err(e) => {
            log::warn!("runtime error in {}: {}", path, e);
            eprintln!("[RuntimeError] {}", e);
            process::exit(1);
        }
    }
}

fn run_repl() {
    use std::io::{self, BufRead, Write};
    log::info!("starting REPL");
    println!("Neba REPL v0.3.0 — Ctrl-D to exit");
    let mut repl = Repl::new();
    loop {
        print!(">>> ");
        io::stdout().flush().unwrap();
        let mut line = String::new();
        match io::stdin().lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => match repl.eval(&line) {
                Ok(Value::Null) => {}
                Ok(v) => println!("{}", v),
                Err(e) => eprintln!("  Error: {}", e),
            },
            Err(e) => {
                eprintln!("Error: {}", e);
                break;
            }
        }
    }
}
