use rustyline::Editor;
use sable::reporter::CliReporter;
use sable::vm::{InterpretError, Vm};
use std::{env, fs, path::PathBuf, process::exit};

fn main() {
    let args: Vec<String> = env::args().skip(1).collect();
    match args.len() {
        0 => run_repl(),
        1 => run_file(PathBuf::from(&args[0])),
        _ => {
            eprintln!("Usage: sable [path]");
            exit(exitcode::USAGE);
        }
    }
}

fn run_repl() {
    let mut vm = Vm::new();
    let mut reporter = CliReporter::new();
    let mut rl = Editor::<()>::new();
    loop {
        match rl.readline("> ") {
            Ok(line) => {
                rl.add_history_entry(&line);
                // the VM resets itself after a runtime error, so the
                // session keeps its globals and carries on
                if let Err(InterpretError::Runtime(err)) = vm.interpret(&line, &mut reporter) {
                    eprint!("{}", err);
                }
            }
            Err(_) => break,
        }
    }
}

fn run_file(path: PathBuf) {
    let source = fs::read_to_string(&path).unwrap_or_else(|err| {
        eprintln!("Could not read \"{}\": {}", path.display(), err);
        exit(exitcode::IOERR);
    });
    let mut vm = Vm::new();
    let mut reporter = CliReporter::new();
    match vm.interpret(&source, &mut reporter) {
        Ok(()) => {}
        Err(InterpretError::Compile) => exit(exitcode::DATAERR),
        Err(InterpretError::Runtime(err)) => {
            eprint!("{}", err);
            exit(exitcode::SOFTWARE);
        }
    }
}
