//! Compile error types and source positions.

use thiserror::Error;

/// Category of compile error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileErrorKind {
    /// Unexpected token, unexpected end of input or malformed literal.
    Syntax,
    /// Reference to a metric the program never declares.
    UndeclaredMetric,
    /// Duplicate metric or label name, or bad histogram buckets.
    InvalidDeclaration,
    /// Pattern rejected by the regex engine.
    InvalidRegex,
    /// Operation not allowed on the metric's kind.
    KindMismatch,
    /// Wrong number of label values for the metric.
    LabelArity,
    /// Capture reference that cannot be resolved.
    Capture,
    /// Inconsistency between checker and code generator.
    Internal,
}

/// One diagnostic, positioned at a 1-based line and column.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{line}:{column}: {message}")]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub line: usize,
    pub column: usize,
    pub message: String,
}

impl CompileError {
    pub fn new(kind: CompileErrorKind, position: Position, message: impl Into<String>) -> Self {
        Self {
            kind,
            line: position.line,
            column: position.column,
            message: message.into(),
        }
    }
}

/// 1-based line and column (in characters).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

/// Maps byte offsets to line/column positions.
pub struct LineIndex<'src> {
    source: &'src str,
    line_starts: Vec<usize>,
}

impl<'src> LineIndex<'src> {
    pub fn new(source: &'src str) -> Self {
        let mut line_starts = vec![0];
        line_starts.extend(source.match_indices('\n').map(|(i, _)| i + 1));
        Self {
            source,
            line_starts,
        }
    }

    pub fn position(&self, offset: usize) -> Position {
        let offset = offset.min(self.source.len());
        let line = match self.line_starts.binary_search(&offset) {
            Ok(exact) => exact,
            Err(next) => next - 1,
        };
        let start = self.line_starts[line];
        let column = self
            .source
            .get(start..offset)
            .map_or(offset - start, |s| s.chars().count());
        Position {
            line: line + 1,
            column: column + 1,
        }
    }
}
