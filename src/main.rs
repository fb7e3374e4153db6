/// Kestrel CLI driver.
///
/// With no arguments: runs the configured entry script, or enters the REPL
/// when the configuration names none. With a path: runs that script.
///
/// Exit codes: 0 success, 64 usage, 65 compile error, 70 runtime error,
/// 74 I/O or out-of-memory failure.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser as ClapParser;
use colored::Colorize;

use kestrel::conf::Configuration;
use kestrel::diagnostics::DiagnosticEngine;
use kestrel::errors::KesError;
use kestrel::vm::Vm;

// 64 MB worker stack: deeply nested reentrant interpretation (generators,
// promise callbacks) recurses through the host stack.
const STACK_SIZE: usize = 64 * 1024 * 1024;

const EXIT_USAGE: u8 = 64;
const EXIT_COMPILE: u8 = 65;
const EXIT_RUNTIME: u8 = 70;
const EXIT_IO: u8 = 74;

#[derive(ClapParser)]
#[command(
    name = "kestrel",
    version,
    about = "The Kestrel language",
    long_about = "kestrel — run Kestrel (.kes) scripts, or start a REPL."
)]
struct Cli {
    /// Script to execute; omit to use the configured script or the REPL.
    script: Option<PathBuf>,
    /// Configuration file (INI).
    #[arg(long, default_value = "kestrel.ini")]
    conf: PathBuf,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let worker = std::thread::Builder::new()
        .name("kestrel-worker".into())
        .stack_size(STACK_SIZE)
        .spawn(move || run(cli));
    match worker {
        Ok(handle) => match handle.join() {
            Ok(code) => code,
            Err(_) => {
                eprintln!("{}", "kestrel crashed: internal panic".red());
                ExitCode::from(EXIT_IO)
            }
        },
        Err(e) => {
            eprintln!("Cannot spawn worker thread: {}", e);
            ExitCode::from(EXIT_IO)
        }
    }
}

fn run(cli: Cli) -> ExitCode {
    let conf = match Configuration::load(&cli.conf) {
        Ok(conf) => conf,
        Err(e) => {
            eprintln!("Cannot read configuration '{}': {}", cli.conf.display(), e);
            return ExitCode::from(EXIT_USAGE);
        }
    };

    let script = cli
        .script
        .clone()
        .or_else(|| {
            if conf.script.is_empty() {
                None
            } else {
                Some(PathBuf::from(&conf.script))
            }
        });

    let mut vm = Vm::new(conf);
    match script {
        Some(path) => run_file(&mut vm, &path),
        None => repl(&mut vm),
    }
}

fn run_file(vm: &mut Vm, path: &PathBuf) -> ExitCode {
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("Cannot read '{}': {}", path.display(), e);
            return ExitCode::from(EXIT_IO);
        }
    };
    let display_path = path.display().to_string();
    match vm.interpret(&source, &display_path) {
        Ok(_) => ExitCode::SUCCESS,
        Err(error) => report(error, &display_path, &source),
    }
}

fn report(error: KesError, path: &str, source: &str) -> ExitCode {
    match error {
        KesError::Compile(errors) => {
            let engine = DiagnosticEngine::new(path, source);
            for e in &errors {
                let report = miette::Report::new(engine.from_frontend(e));
                eprintln!("{:?}", report);
            }
            ExitCode::from(EXIT_COMPILE)
        }
        KesError::Runtime(fatal) => {
            eprint!("{}", fatal);
            ExitCode::from(EXIT_RUNTIME)
        }
        KesError::Io(message) => {
            eprintln!("{}", message);
            ExitCode::from(EXIT_IO)
        }
    }
}

/// Line-oriented REPL sharing one module, so bindings persist between
/// lines. Errors print without exiting.
fn repl(vm: &mut Vm) -> ExitCode {
    println!(
        "{} {}",
        "kestrel".green().bold(),
        env!("CARGO_PKG_VERSION")
    );
    let module = vm.new_module("repl");
    vm.current_module = module;
    let stdin = std::io::stdin();
    loop {
        print!("> ");
        if std::io::stdout().flush().is_err() {
            return ExitCode::from(EXIT_IO);
        }
        let mut line = String::new();
        match stdin.read_line(&mut line) {
            Ok(0) => return ExitCode::SUCCESS,
            Ok(_) => {}
            Err(e) => {
                eprintln!("Cannot read input: {}", e);
                return ExitCode::from(EXIT_IO);
            }
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            return ExitCode::SUCCESS;
        }
        match vm.interpret_in_module(line, module) {
            Ok(_) => {
                if let Err(unwind) = vm.run_loop_until_idle() {
                    if let KesError::Runtime(fatal) = vm_unwind_error(vm, unwind) {
                        eprint!("{}", fatal.to_string().red());
                    }
                }
            }
            Err(KesError::Compile(errors)) => {
                let engine = DiagnosticEngine::new("repl", line);
                for e in &errors {
                    let report = miette::Report::new(engine.from_frontend(e));
                    eprintln!("{:?}", report);
                }
            }
            Err(KesError::Runtime(fatal)) => eprint!("{}", fatal.to_string().red()),
            Err(KesError::Io(message)) => eprintln!("{}", message.red()),
        }
    }
}

fn vm_unwind_error(vm: &mut Vm, unwind: kestrel::vm::Unwind) -> KesError {
    vm.unwind_error_for_host(unwind)
}
