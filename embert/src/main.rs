//! embert - command-line runner for Ember scripts.
//!
//! Reads a script file, feeds it to the VM, and maps the outcome to
//! sysexits-style codes: 0 on success, 65 for compile errors, 70 for
//! runtime errors, 74 when the file cannot be read. Debug surfaces of the
//! engine (token dumps, disassembly, execution tracing) hang off flags, and
//! `EMBER_LOG` controls the tracing filter (e.g. `EMBER_LOG=ember_core=debug`
//! to watch the collector).

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use ember_lex::Scanner;
use ember_vm::{InterpretError, Vm};
use tracing_subscriber::EnvFilter;

/// Run an Ember script.
#[derive(Parser, Debug)]
#[command(name = "embert")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run Ember scripts", long_about = None)]
struct Cli {
    /// Script file to run
    script: PathBuf,

    /// Print the token stream before compiling
    #[arg(long, env = "EMBERT_DUMP_TOKENS")]
    dump_tokens: bool,

    /// Disassemble each function as it finishes compiling
    #[arg(long, env = "EMBERT_DUMP_BYTECODE")]
    dump_bytecode: bool,

    /// Trace the value stack and every instruction while running
    #[arg(long, env = "EMBERT_TRACE")]
    trace: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_env("EMBER_LOG").unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    match run(&cli) {
        Ok(code) => code,
        Err(error) => {
            eprintln!("embert: {error:#}");
            ExitCode::from(74)
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<ExitCode> {
    let source = fs::read_to_string(&cli.script)
        .with_context(|| format!("could not read script '{}'", cli.script.display()))?;
    tracing::debug!(script = %cli.script.display(), bytes = source.len(), "loaded script");

    if cli.dump_tokens {
        dump_tokens(&source);
    }

    let mut vm = Vm::new();
    vm.set_dump_bytecode(cli.dump_bytecode);
    vm.set_trace_execution(cli.trace);

    let code = match vm.interpret(&source) {
        Ok(()) => ExitCode::SUCCESS,
        Err(InterpretError::Compile) => ExitCode::from(65),
        Err(InterpretError::Runtime) => ExitCode::from(70),
    };
    Ok(code)
}

fn dump_tokens(source: &str) {
    for token in Scanner::new(source) {
        println!("{:>4} {:<12} '{}'", token.line, format!("{:?}", token.kind), token.lexeme);
    }
}
