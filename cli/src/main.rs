mod disasm;

use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::Editor;
use std::{env, fs, path::PathBuf, process::exit};
use vm::{InterpretError, Vm};

const HELP_MSG: &str = "usage:
  qatam [path]

Runs the script at `path`, or starts an interactive REPL if no path is given.
";

fn main() {
    let mut args = env::args().skip(1);
    match args.next() {
        Some(flag) if flag == "--help" || flag == "-h" => {
            println!("{} {}\n\n{HELP_MSG}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
        }
        Some(flag) if flag == "--version" => {
            println!("{}", env!("CARGO_PKG_VERSION"));
        }
        Some(path) => run_file(PathBuf::from(path)),
        None => run_repl(),
    }
}

/// Exit codes follow the `Ok`/`CompileError`/`RuntimeError` convention:
/// 0, `EX_DATAERR` (65), `EX_SOFTWARE` (70).
fn run_file(path: PathBuf) {
    let source = fs::read_to_string(&path).unwrap_or_else(|err| {
        eprintln!("{}", format!("Couldn't read '{}': {err}", path.display()).red());
        exit(exitcode::IOERR);
    });
    disasm::disassemble_source(&source);
    let mut vm = Vm::new();
    match vm.interpret(&source) {
        Ok(()) => {}
        Err(InterpretError::Compile(errors)) => {
            eprintln!("{}", errors.to_string().red());
            exit(exitcode::DATAERR);
        }
        Err(InterpretError::Runtime(err)) => {
            eprintln!("{}", err.to_string().red());
            exit(exitcode::SOFTWARE);
        }
    }
}

fn run_repl() {
    let mut rl = Editor::<()>::new();
    let mut vm = Vm::new();
    println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    loop {
        match rl.readline("> ") {
            Ok(line) => {
                rl.add_history_entry(&line);
                disasm::disassemble_source(&line);
                if let Err(err) = vm.interpret(&line) {
                    eprintln!("{}", err.to_string().red());
                }
            }
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("{err}");
                break;
            }
        }
    }
}
