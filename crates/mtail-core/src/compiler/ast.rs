//! Syntax tree produced by the parser.
//!
//! The checker fills in the `Option` resolution slots (`Pattern::id`,
//! `MetricRef::index`, `Capture::slot`); code generation reads them.

use std::fmt;

use crate::metrics::MetricKind;

/// Byte range in the program source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn to(self, other: Span) -> Span {
        Span::new(self.start, other.end.max(self.end))
    }
}

#[derive(Debug, Clone, Default)]
pub struct Ast {
    pub items: Vec<Item>,
}

#[derive(Debug, Clone)]
pub enum Item {
    Decl(Decl),
    Block(CondBlock),
}

/// `counter name by a, b` / `histogram name buckets 1, 2, 5`
#[derive(Debug, Clone)]
pub struct Decl {
    pub kind: MetricKind,
    pub name: String,
    pub labels: Vec<String>,
    pub buckets: Option<Vec<f64>>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum Stmt {
    Block(CondBlock),
    Action(Action),
}

/// `cond { body } else { otherwise }`
#[derive(Debug, Clone)]
pub struct CondBlock {
    pub cond: Cond,
    pub body: Vec<Stmt>,
    pub otherwise: Option<Vec<Stmt>>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum Cond {
    Pattern(Pattern),
    Compare { lhs: Expr, op: CmpOp, rhs: Expr },
}

#[derive(Debug, Clone)]
pub struct Pattern {
    pub source: String,
    pub span: Span,
    /// Index into the program's pattern table.
    pub id: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct Action {
    pub target: MetricRef,
    pub op: ActionOp,
    pub value: Option<Expr>,
    pub span: Span,
}

/// `name` or `name[expr, ...]`
#[derive(Debug, Clone)]
pub struct MetricRef {
    pub name: String,
    pub labels: Vec<Expr>,
    pub span: Span,
    /// Index into the program's metric table.
    pub index: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOp {
    Inc,
    Dec,
    AddAssign,
    SubAssign,
    Assign,
}

impl ActionOp {
    pub fn symbol(self) -> &'static str {
        match self {
            ActionOp::Inc => "++",
            ActionOp::Dec => "--",
            ActionOp::AddAssign => "+=",
            ActionOp::SubAssign => "-=",
            ActionOp::Assign => "=",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Number(f64),
    /// String literal, possibly interpolating captures.
    Str(Vec<StrPart>),
    Capture(Capture),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Neg(Box<Expr>),
}

impl Expr {
    /// Value of the expression if it is a numeric literal, possibly negated.
    pub fn constant(&self) -> Option<f64> {
        match &self.kind {
            ExprKind::Number(n) => Some(*n),
            ExprKind::Neg(inner) => inner.constant().map(|n| -n),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum StrPart {
    Text(String),
    Capture(Capture),
}

#[derive(Debug, Clone)]
pub struct Capture {
    pub reference: CaptureRef,
    pub slot: Option<CaptureSlot>,
}

impl Capture {
    pub fn new(reference: CaptureRef) -> Self {
        Self {
            reference,
            slot: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureRef {
    Index(usize),
    Name(String),
}

impl fmt::Display for CaptureRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureRef::Index(i) => write!(f, "${i}"),
            CaptureRef::Name(n) => write!(f, "${n}"),
        }
    }
}

/// Resolved capture: capture frame (nesting depth of the defining pattern,
/// outermost = 0) and group index within that pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSlot {
    pub frame: usize,
    pub group: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }

    pub fn holds(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            CmpOp::Eq => ordering == Equal,
            CmpOp::Ne => ordering != Equal,
            CmpOp::Lt => ordering == Less,
            CmpOp::Le => ordering != Greater,
            CmpOp::Gt => ordering == Greater,
            CmpOp::Ge => ordering != Less,
        }
    }
}
