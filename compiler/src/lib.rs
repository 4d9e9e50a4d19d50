//! `seqc`: an ahead-of-time compiler for a Scheme-like Lisp, emitting
//! x86-64 AT&T assembly text paired with `seq-runtime`'s generational
//! copying collector.

pub mod ast;
pub mod codegen;
pub mod config;
pub mod diagnostics;
pub mod env;
pub mod parser;
pub mod prepass;
pub mod regs;
pub mod value_tags;

pub use ast::Program;
pub use codegen::CodeGen;
pub use config::CompilerConfig;
pub use diagnostics::Diagnostics;
pub use parser::Parser;

use std::fs;
use std::path::Path;

/// Parses and compiles a single source string to assembly text.
pub fn compile_source(source: &str, config: &CompilerConfig) -> Result<String, Diagnostics> {
    let program = Parser::new(source).parse()?;
    CodeGen::generate(&program, config)
}

/// Parses and compiles several source files as one program, concatenated
/// in the order given (so that later files may reference definitions from
/// earlier ones, mirroring a single-translation-unit build).
pub fn compile_sources(sources: &[String], config: &CompilerConfig) -> Result<String, Diagnostics> {
    let mut program = Program::new();
    let mut diagnostics = Diagnostics::new();
    for source in sources {
        match Parser::new(source).parse() {
            Ok(mut p) => program.exprs.append(&mut p.exprs),
            Err(d) => {
                for item in d.into_vec() {
                    diagnostics.push(item.pos, item.kind);
                }
            }
        }
    }
    if !diagnostics.is_empty() {
        return Err(diagnostics);
    }
    CodeGen::generate(&program, config)
}

/// Reads and compiles a source file from disk.
pub fn compile_file(source_path: &Path, config: &CompilerConfig) -> Result<String, CompileFileError> {
    let source = fs::read_to_string(source_path).map_err(CompileFileError::Io)?;
    compile_source(&source, config).map_err(CompileFileError::Diagnostics)
}

#[derive(Debug)]
pub enum CompileFileError {
    Io(std::io::Error),
    Diagnostics(Diagnostics),
}

impl std::fmt::Display for CompileFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileFileError::Io(e) => write!(f, "failed to read source file: {e}"),
            CompileFileError::Diagnostics(d) => write!(f, "{d}"),
        }
    }
}

impl std::error::Error for CompileFileError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compiles_simple_source_to_assembly() {
        let asm = compile_source("(+ 1 2)", &CompilerConfig::default()).unwrap();
        assert!(asm.contains("main:"));
        assert!(asm.contains("init_gc"));
    }

    #[test]
    fn reports_parse_diagnostics() {
        let result = compile_source("(+ 1 2", &CompilerConfig::default());
        assert!(result.is_err());
    }

    #[test]
    fn compiles_multiple_sources_as_one_program() {
        let sources = vec!["(define x 1)".to_string(), "(+ x 1)".to_string()];
        let asm = compile_sources(&sources, &CompilerConfig::default()).unwrap();
        assert!(asm.contains("main:"));
    }

    #[test]
    fn compile_file_reads_source_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prog.scm");
        std::fs::write(&path, "(+ 1 2)").unwrap();

        let asm = compile_file(&path, &CompilerConfig::default()).unwrap();
        assert!(asm.contains("main:"));
    }

    #[test]
    fn compile_file_reports_io_error_for_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist.scm");

        let err = compile_file(&missing, &CompilerConfig::default()).unwrap_err();
        assert!(matches!(err, CompileFileError::Io(_)));
    }
}
