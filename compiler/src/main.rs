//! `seqc` CLI: compile one or more source files, an inline expression, or
//! (with no arguments) read-eval-print loop over stdin, emitting x86-64
//! assembly text to stdout.

use clap::Parser as ClapParser;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process;

use seqc::{compile_source, compile_sources, CompilerConfig};

#[derive(ClapParser)]
#[command(name = "seqc")]
#[command(about = "Ahead-of-time compiler for a Scheme-like Lisp", long_about = None)]
struct Cli {
    /// Compile an inline expression instead of reading from a file.
    #[arg(short = 'e', long = "eval")]
    expr: Option<String>,

    /// Source files to compile, concatenated as one program.
    #[arg(short = 'f', long = "file", num_args = 1..)]
    files: Vec<PathBuf>,

    /// Write emitted assembly to this path instead of stdout.
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Minor-generation heap size, in bytes.
    #[arg(long = "heap-size", default_value_t = seqc::config::DEFAULT_HEAP_SIZE)]
    heap_size: usize,

    /// Root-stack capacity, in entries.
    #[arg(long = "root-stack-size", default_value_t = seqc::config::DEFAULT_ROOT_STACK_SIZE)]
    root_stack_size: usize,
}

fn main() {
    let cli = Cli::parse();
    let config = CompilerConfig::new()
        .with_heap_size(cli.heap_size)
        .with_root_stack_size(cli.root_stack_size);

    if let Some(expr) = &cli.expr {
        run_and_exit(compile_source(expr, &config), cli.output.as_deref());
    }

    if !cli.files.is_empty() {
        let mut sources = Vec::with_capacity(cli.files.len());
        for path in &cli.files {
            match std::fs::read_to_string(path) {
                Ok(s) => sources.push(s),
                Err(e) => {
                    eprintln!("seqc: failed to read {}: {e}", path.display());
                    process::exit(1);
                }
            }
        }
        run_and_exit(compile_sources(&sources, &config), cli.output.as_deref());
    }

    run_repl(&config);
}

fn run_and_exit(result: Result<String, seqc::Diagnostics>, output: Option<&std::path::Path>) -> ! {
    match result {
        Ok(asm) => {
            match output {
                Some(path) => {
                    if let Err(e) = std::fs::write(path, &asm) {
                        eprintln!("seqc: failed to write {}: {e}", path.display());
                        process::exit(1);
                    }
                }
                None => print!("{asm}"),
            }
            process::exit(0);
        }
        Err(diagnostics) => {
            eprintln!("{diagnostics}");
            process::exit(1);
        }
    }
}

/// No arguments given: read one form at a time from stdin, echoing the
/// assembly each compiles to, until EOF. Deliberately a bare
/// `stdin().read_line` loop rather than a line-editing library, since the
/// generated assembly (not an interactive value) is the thing being
/// inspected.
fn run_repl(config: &CompilerConfig) {
    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("seqc> ");
        io::stdout().flush().ok();
        line.clear();
        let bytes_read = match stdin.read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let _ = bytes_read;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match compile_source(trimmed, config) {
            Ok(asm) => println!("{asm}"),
            Err(diagnostics) => eprintln!("{diagnostics}"),
        }
    }
}
