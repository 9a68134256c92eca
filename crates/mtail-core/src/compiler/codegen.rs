//! Lowering of a checked AST to linear bytecode.

use super::ast::*;
use super::bytecode::Instruction;
use super::error::{CompileError, CompileErrorKind, LineIndex};
use crate::metrics::{MetricKind, MetricOp, MetricSpec};

pub fn generate(
    ast: &Ast,
    metrics: &[MetricSpec],
    index: &LineIndex,
) -> Result<Vec<Instruction>, CompileError> {
    let mut codegen = Codegen {
        code: Vec::new(),
        metrics,
        index,
    };
    for item in &ast.items {
        if let Item::Block(block) = item {
            codegen.block(block)?;
        }
    }
    Ok(codegen.code)
}

struct Codegen<'a> {
    code: Vec<Instruction>,
    metrics: &'a [MetricSpec],
    index: &'a LineIndex<'a>,
}

impl Codegen<'_> {
    fn emit(&mut self, instruction: Instruction) -> usize {
        self.code.push(instruction);
        self.code.len() - 1
    }

    fn here(&self) -> usize {
        self.code.len()
    }

    /// Point the jump at `at` to the current position.
    fn patch(&mut self, at: usize) {
        let target = self.here();
        match &mut self.code[at] {
            Instruction::Jump(t) | Instruction::JumpIfFalse(t) | Instruction::Recover(t) => {
                *t = target
            }
            _ => {}
        }
    }

    fn unresolved(&self, span: Span, what: &str) -> CompileError {
        CompileError::new(
            CompileErrorKind::Internal,
            self.index.position(span.start),
            format!("{what} was not resolved"),
        )
    }

    fn block(&mut self, block: &CondBlock) -> Result<(), CompileError> {
        let opens_scope = match &block.cond {
            Cond::Pattern(pattern) => {
                let id = pattern
                    .id
                    .ok_or_else(|| self.unresolved(pattern.span, "pattern"))?;
                self.emit(Instruction::Match(id));
                true
            }
            Cond::Compare { lhs, op, rhs } => {
                // A fault while comparing skips the whole block.
                let recover = self.emit(Instruction::Recover(0));
                self.expr(lhs)?;
                self.expr(rhs)?;
                self.emit(Instruction::Compare(*op));
                let skip_else = self.emit(Instruction::JumpIfFalse(0));
                self.stmts(&block.body)?;
                return self.finish_block(block, skip_else, Some(recover), false);
            }
        };
        let skip_else = self.emit(Instruction::JumpIfFalse(0));
        self.stmts(&block.body)?;
        self.finish_block(block, skip_else, None, opens_scope)
    }

    fn finish_block(
        &mut self,
        block: &CondBlock,
        skip_else: usize,
        recover: Option<usize>,
        opens_scope: bool,
    ) -> Result<(), CompileError> {
        if opens_scope {
            self.emit(Instruction::PopScope);
        }
        match &block.otherwise {
            Some(otherwise) => {
                let skip_to_end = self.emit(Instruction::Jump(0));
                self.patch(skip_else);
                self.stmts(otherwise)?;
                self.patch(skip_to_end);
            }
            None => self.patch(skip_else),
        }
        if let Some(recover) = recover {
            self.patch(recover);
        }
        Ok(())
    }

    fn stmts(&mut self, stmts: &[Stmt]) -> Result<(), CompileError> {
        for stmt in stmts {
            match stmt {
                Stmt::Block(block) => self.block(block)?,
                Stmt::Action(action) => self.action(action)?,
            }
        }
        Ok(())
    }

    fn action(&mut self, action: &Action) -> Result<(), CompileError> {
        let target = &action.target;
        let metric = target
            .index
            .ok_or_else(|| self.unresolved(target.span, "metric reference"))?;
        let kind = self.metrics[metric].kind;

        let recover = self.emit(Instruction::Recover(0));
        for label in &target.labels {
            self.expr(label)?;
        }
        self.emit(Instruction::Fetch {
            metric,
            labels: target.labels.len(),
        });

        let value = action.value.as_ref();
        match (action.op, value) {
            (ActionOp::Inc, _) => {
                self.emit(Instruction::Apply(MetricOp::Inc));
            }
            (ActionOp::Dec, _) => {
                self.emit(Instruction::PushNumber(-1.0));
                self.emit(Instruction::Apply(MetricOp::Add));
            }
            (ActionOp::AddAssign, Some(value)) => {
                self.expr(value)?;
                self.emit(Instruction::Apply(MetricOp::Add));
            }
            (ActionOp::SubAssign, Some(value)) => {
                self.expr(value)?;
                self.emit(Instruction::Neg);
                self.emit(Instruction::Apply(MetricOp::Add));
            }
            (ActionOp::Assign, Some(value)) => {
                self.expr(value)?;
                let op = if kind == MetricKind::Histogram {
                    MetricOp::Observe
                } else {
                    MetricOp::Set
                };
                self.emit(Instruction::Apply(op));
            }
            (_, None) => return Err(self.unresolved(action.span, "action value")),
        }
        self.patch(recover);
        Ok(())
    }

    fn expr(&mut self, expr: &Expr) -> Result<(), CompileError> {
        match &expr.kind {
            ExprKind::Number(n) => {
                self.emit(Instruction::PushNumber(*n));
            }
            ExprKind::Capture(capture) => self.capture(capture, expr.span)?,
            ExprKind::Str(parts) => match parts.as_slice() {
                [] => {
                    self.emit(Instruction::PushString(String::new()));
                }
                [StrPart::Text(text)] => {
                    self.emit(Instruction::PushString(text.clone()));
                }
                parts => {
                    for part in parts {
                        match part {
                            StrPart::Text(text) => {
                                self.emit(Instruction::PushString(text.clone()));
                            }
                            StrPart::Capture(capture) => self.capture(capture, expr.span)?,
                        }
                    }
                    self.emit(Instruction::Concat(parts.len()));
                }
            },
            ExprKind::Binary { op, lhs, rhs } => {
                self.expr(lhs)?;
                self.expr(rhs)?;
                self.emit(match op {
                    BinOp::Add => Instruction::Add,
                    BinOp::Sub => Instruction::Sub,
                    BinOp::Mul => Instruction::Mul,
                });
            }
            ExprKind::Neg(inner) => {
                self.expr(inner)?;
                self.emit(Instruction::Neg);
            }
        }
        Ok(())
    }

    fn capture(&mut self, capture: &Capture, span: Span) -> Result<(), CompileError> {
        let slot = capture
            .slot
            .ok_or_else(|| self.unresolved(span, "capture reference"))?;
        self.emit(Instruction::PushCapture {
            frame: slot.frame,
            group: slot.group,
        });
        Ok(())
    }
}
