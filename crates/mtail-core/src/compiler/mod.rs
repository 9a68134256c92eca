//! Compiler for the pattern/action language.
//!
//! Pipeline: `lexer` (logos tokens) → `parser` (recursive descent, with
//! recovery) → `checker` (declarations, kinds, captures, regexes) →
//! `codegen` (linear `bytecode`). Compilation is a pure function of the
//! source; a `Program` is immutable once built.

pub mod ast;
pub mod bytecode;
mod checker;
mod codegen;
mod error;
mod lexer;
mod parser;

use std::fmt::Write as _;

use regex::Regex;

pub use bytecode::Instruction;
pub use error::{CompileError, CompileErrorKind, Position};

use crate::metrics::MetricSpec;
use error::LineIndex;

/// A compiled program: source, syntax tree, bytecode and the tables the
/// bytecode indexes into.
#[derive(Debug)]
pub struct Program {
    name: String,
    source: String,
    ast: ast::Ast,
    code: Vec<Instruction>,
    patterns: Vec<Regex>,
    metrics: Vec<MetricSpec>,
}

impl Program {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn ast(&self) -> &ast::Ast {
        &self.ast
    }

    pub fn code(&self) -> &[Instruction] {
        &self.code
    }

    pub fn patterns(&self) -> &[Regex] {
        &self.patterns
    }

    /// Metrics declared by the program, in declaration order.
    pub fn metrics(&self) -> &[MetricSpec] {
        &self.metrics
    }

    /// Human-readable listing of the metric table, pattern table and code.
    pub fn disassemble(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "program {}", self.name);
        for (i, spec) in self.metrics.iter().enumerate() {
            let _ = write!(out, "  m{i} {} {}", spec.kind, spec.name);
            if !spec.labels.is_empty() {
                let _ = write!(out, " by {}", spec.labels.join(", "));
            }
            out.push('\n');
        }
        for (i, pattern) in self.patterns.iter().enumerate() {
            let _ = writeln!(out, "  #{i} /{}/", pattern.as_str());
        }
        for (pc, instruction) in self.code.iter().enumerate() {
            let _ = writeln!(out, "  {pc:>4}  {instruction}");
        }
        out
    }
}

/// Compile `source`. On failure every error found is returned, ordered by
/// position; semantic checks only run on a syntactically valid program.
pub fn compile(name: &str, source: &str) -> Result<Program, Vec<CompileError>> {
    let index = LineIndex::new(source);

    let (tokens, mut errors) = lexer::tokenize(source, &index);
    let (mut ast, parse_errors) = parser::parse(&tokens, &index, source.len());
    errors.extend(parse_errors);
    if !errors.is_empty() {
        errors.sort_by_key(|e| (e.line, e.column));
        return Err(errors);
    }

    let checked = checker::check(&mut ast, &index)?;
    let code = codegen::generate(&ast, &checked.metrics, &index).map_err(|e| vec![e])?;

    Ok(Program {
        name: name.to_string(),
        source: source.to_string(),
        ast,
        code,
        patterns: checked.patterns,
        metrics: checked.metrics,
    })
}
