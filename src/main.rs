//! Maki CLI: execute files, evaluate one-liners, or run the REPL.

use std::env;
use std::fs;
use std::process;

use colored::Colorize;

use maki::bytecode::{Value, Vm};
use maki::repl::Repl;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// CLI command to execute.
enum Command {
    /// Run a script file
    Run { file: String },
    /// Evaluate a string and print the result
    Eval { code: String },
    /// Start the REPL
    Repl,
}

/// CLI options parsed from arguments.
struct Options {
    command: Command,
    disassemble: bool,
}

fn print_usage() {
    eprintln!("Maki {} - bytecode-compiled scripting language", VERSION);
    eprintln!();
    eprintln!("Usage: maki [options] [script.maki]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -e <code>       Evaluate code and print the result");
    eprintln!("  --disasm        Print a bytecode listing before running");
    eprintln!("  --help, -h      Show this help message");
    eprintln!();
    eprintln!("Examples:");
    eprintln!("  maki                          Start interactive REPL");
    eprintln!("  maki script.maki              Run a script file");
    eprintln!("  maki -e \"1 + 2\"               Evaluate an expression");
    eprintln!("  maki --disasm script.maki     Show bytecode, then run");
}

fn parse_args(args: &[String]) -> Option<Options> {
    let mut command = None;
    let mut disassemble = false;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => return None,
            "--disasm" => disassemble = true,
            "-e" => {
                i += 1;
                let code = args.get(i)?;
                command = Some(Command::Eval { code: code.clone() });
            }
            file if !file.starts_with('-') => {
                command = Some(Command::Run {
                    file: file.to_string(),
                });
            }
            _ => return None,
        }
        i += 1;
    }

    Some(Options {
        command: command.unwrap_or(Command::Repl),
        disassemble,
    })
}

fn execute(source: &str, disassemble: bool, print_result: bool) -> Result<(), String> {
    let bytecode = maki::compile(source).map_err(|e| e.to_string())?;

    if disassemble {
        print!("{}", maki::disassemble(&bytecode));
        println!("---");
    }

    let mut vm = Vm::new(bytecode);
    vm.run().map_err(|e| format!("runtime error: {}", e))?;

    if print_result {
        let result = vm.last_popped_stack_elem();
        if result != Value::Null {
            println!("{}", result);
        }
    }

    Ok(())
}

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();

    let Some(options) = parse_args(&args) else {
        print_usage();
        process::exit(64);
    };

    match options.command {
        Command::Repl => Repl::new().run(),

        Command::Eval { code } => {
            if let Err(message) = execute(&code, options.disassemble, true) {
                eprintln!("{}", message.red());
                process::exit(1);
            }
        }

        Command::Run { file } => {
            let source = match fs::read_to_string(&file) {
                Ok(source) => source,
                Err(err) => {
                    eprintln!("{}", format!("cannot read {}: {}", file, err).red());
                    process::exit(66);
                }
            };

            if let Err(message) = execute(&source, options.disassemble, false) {
                eprintln!("{}", message.red());
                process::exit(1);
            }
        }
    }
}
