//! Interactive REPL.
//!
//! Globals, the constant pool, and the symbol table persist across inputs:
//! the compiler and VM are handed the previous state so a binding made on
//! one line keeps its index on the next.

use std::io::{self, Write};

use colored::Colorize;

use crate::bytecode::vm::empty_globals;
use crate::bytecode::{Compiler, SymbolTable, Value, Vm};
use crate::lexer::Scanner;
use crate::parser::Parser;

const PROMPT: &str = ">> ";

pub struct Repl {
    constants: Vec<Value>,
    globals: Vec<Value>,
    symbol_table: SymbolTable,
}

impl Repl {
    pub fn new() -> Self {
        Self {
            constants: Vec::new(),
            globals: empty_globals(),
            symbol_table: SymbolTable::with_builtins(),
        }
    }

    pub fn run(&mut self) {
        println!("Maki {}", env!("CARGO_PKG_VERSION"));
        println!("Type exit to leave.\n");

        let stdin = io::stdin();

        loop {
            print!("{}", PROMPT);
            io::stdout().flush().unwrap();

            let mut line = String::new();
            match stdin.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    if line == "exit" || line == "quit" {
                        break;
                    }
                    self.eval_line(line);
                }
                Err(err) => {
                    eprintln!("{}", format!("read error: {}", err).red());
                    break;
                }
            }
        }
    }

    fn eval_line(&mut self, line: &str) {
        let tokens = match Scanner::new(line).scan_tokens() {
            Ok(tokens) => tokens,
            Err(err) => {
                eprintln!("{}", format!("lexer error: {}", err).red());
                return;
            }
        };

        let program = match Parser::new(tokens).parse() {
            Ok(program) => program,
            Err(err) => {
                eprintln!("{}", format!("parser error: {}", err).red());
                return;
            }
        };

        let mut compiler = Compiler::new_with_state(
            std::mem::take(&mut self.symbol_table),
            std::mem::take(&mut self.constants),
        );
        let compiled = compiler.compile(&program);
        let bytecode = compiler.bytecode();

        // Always reclaim the state, error or not, so the session survives.
        let (symbol_table, constants) = compiler.into_state();
        self.symbol_table = symbol_table;
        self.constants = constants;

        if let Err(err) = compiled {
            eprintln!("{}", format!("compile error: {}", err).red());
            return;
        }

        let mut vm = Vm::new_with_globals(bytecode, std::mem::take(&mut self.globals));
        match vm.run() {
            Ok(()) => println!("{}", vm.last_popped_stack_elem()),
            Err(err) => eprintln!("{}", format!("runtime error: {}", err).red()),
        }
        self.globals = vm.into_globals();
    }
}

impl Default for Repl {
    fn default() -> Self {
        Self::new()
    }
}
