//! Instruction set executed by the VM.

use std::fmt;

use super::ast::CmpOp;
use crate::metrics::MetricOp;

/// One VM instruction. Jump targets are absolute instruction indices.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// Match pattern `n` against the line. On success push a capture frame
    /// and a `true`; otherwise push `false`.
    Match(usize),
    /// Pop a boolean; jump when it is false.
    JumpIfFalse(usize),
    Jump(usize),
    /// Drop the innermost capture frame.
    PopScope,
    /// Start a fallible region: a runtime fault resumes at the target with
    /// the stack and capture frames restored to their current heights.
    Recover(usize),
    PushNumber(f64),
    PushString(String),
    PushCapture { frame: usize, group: usize },
    /// Pop `n` values and push their concatenation as a string.
    Concat(usize),
    Add,
    Sub,
    Mul,
    Neg,
    /// Pop rhs then lhs, push the comparison result.
    Compare(CmpOp),
    /// Pop `labels` label values and push a handle to that series of
    /// metric `metric`.
    Fetch { metric: usize, labels: usize },
    /// Pop the value (not for `Inc`) and the series handle, then update it.
    Apply(MetricOp),
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Match(p) => write!(f, "match       #{p}"),
            Instruction::JumpIfFalse(t) => write!(f, "jfalse      {t}"),
            Instruction::Jump(t) => write!(f, "jmp         {t}"),
            Instruction::PopScope => f.write_str("popscope"),
            Instruction::Recover(t) => write!(f, "recover     {t}"),
            Instruction::PushNumber(n) => write!(f, "push        {n}"),
            Instruction::PushString(s) => write!(f, "push        {s:?}"),
            Instruction::PushCapture { frame, group } => write!(f, "capture     {frame}.{group}"),
            Instruction::Concat(n) => write!(f, "concat      {n}"),
            Instruction::Add => f.write_str("add"),
            Instruction::Sub => f.write_str("sub"),
            Instruction::Mul => f.write_str("mul"),
            Instruction::Neg => f.write_str("neg"),
            Instruction::Compare(op) => write!(f, "cmp         {}", op.symbol()),
            Instruction::Fetch { metric, labels } => write!(f, "fetch       m{metric} [{labels}]"),
            Instruction::Apply(op) => write!(f, "apply       {op}"),
        }
    }
}
