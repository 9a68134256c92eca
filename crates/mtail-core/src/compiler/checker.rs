//! Semantic checks: metric declarations, metric/kind consistency, regex
//! compilation and capture resolution.
//!
//! The checker annotates the AST in place (pattern ids, metric indices,
//! capture slots) and returns the tables code generation needs.

use std::collections::HashMap;

use regex::Regex;

use super::ast::*;
use super::error::{CompileError, CompileErrorKind, LineIndex};
use crate::metrics::{DEFAULT_BUCKETS, MetricKind, MetricSpec};

/// Tables produced by a successful check.
#[derive(Debug)]
pub struct Checked {
    pub metrics: Vec<MetricSpec>,
    pub patterns: Vec<Regex>,
}

pub fn check(ast: &mut Ast, index: &LineIndex) -> Result<Checked, Vec<CompileError>> {
    let mut checker = Checker {
        index,
        metrics: Vec::new(),
        by_name: HashMap::new(),
        patterns: Vec::new(),
        scopes: Vec::new(),
        errors: Vec::new(),
    };

    // Declarations first, so blocks may reference metrics declared below them.
    for item in &ast.items {
        if let Item::Decl(decl) = item {
            checker.declare(decl);
        }
    }
    for item in &mut ast.items {
        if let Item::Block(block) = item {
            checker.block(block);
        }
    }

    if checker.errors.is_empty() {
        Ok(Checked {
            metrics: checker.metrics,
            patterns: checker.patterns,
        })
    } else {
        checker.errors.sort_by_key(|e| (e.line, e.column));
        Err(checker.errors)
    }
}

/// Capture groups visible from one enclosing pattern.
struct Scope {
    groups: usize,
    names: HashMap<String, usize>,
    /// The pattern failed to compile; references into it are not reported.
    poisoned: bool,
}

struct Checker<'a> {
    index: &'a LineIndex<'a>,
    metrics: Vec<MetricSpec>,
    by_name: HashMap<String, usize>,
    patterns: Vec<Regex>,
    scopes: Vec<Scope>,
    errors: Vec<CompileError>,
}

impl Checker<'_> {
    fn error(&mut self, kind: CompileErrorKind, span: Span, message: String) {
        self.errors
            .push(CompileError::new(kind, self.index.position(span.start), message));
    }

    fn declare(&mut self, decl: &Decl) {
        if self.by_name.contains_key(&decl.name) {
            self.error(
                CompileErrorKind::InvalidDeclaration,
                decl.span,
                format!("metric `{}` is declared more than once", decl.name),
            );
            return;
        }
        for (i, label) in decl.labels.iter().enumerate() {
            if decl.labels[..i].contains(label) {
                self.error(
                    CompileErrorKind::InvalidDeclaration,
                    decl.span,
                    format!("label `{label}` repeated in declaration of `{}`", decl.name),
                );
            }
        }

        let buckets = match (&decl.buckets, decl.kind) {
            (None, MetricKind::Histogram) => DEFAULT_BUCKETS.to_vec(),
            (None, _) => Vec::new(),
            (Some(_), kind) if kind != MetricKind::Histogram => {
                self.error(
                    CompileErrorKind::InvalidDeclaration,
                    decl.span,
                    format!("`buckets` is only valid for histograms, `{}` is a {kind}", decl.name),
                );
                Vec::new()
            }
            (Some(bounds), _) => {
                if bounds.windows(2).any(|w| !(w[0] < w[1])) {
                    self.error(
                        CompileErrorKind::InvalidDeclaration,
                        decl.span,
                        format!("buckets of `{}` must be strictly increasing", decl.name),
                    );
                }
                bounds.clone()
            }
        };

        self.by_name.insert(decl.name.clone(), self.metrics.len());
        self.metrics.push(MetricSpec {
            name: decl.name.clone(),
            kind: decl.kind,
            labels: decl.labels.clone(),
            buckets,
        });
    }

    fn block(&mut self, block: &mut CondBlock) {
        match &mut block.cond {
            Cond::Pattern(pattern) => {
                let scope = match Regex::new(&pattern.source) {
                    Ok(regex) => {
                        let scope = Scope {
                            groups: regex.captures_len(),
                            names: regex
                                .capture_names()
                                .enumerate()
                                .filter_map(|(i, name)| name.map(|n| (n.to_string(), i)))
                                .collect(),
                            poisoned: false,
                        };
                        pattern.id = Some(self.patterns.len());
                        self.patterns.push(regex);
                        scope
                    }
                    Err(err) => {
                        self.error(
                            CompileErrorKind::InvalidRegex,
                            pattern.span,
                            format!("invalid pattern /{}/: {err}", pattern.source),
                        );
                        Scope {
                            groups: 0,
                            names: HashMap::new(),
                            poisoned: true,
                        }
                    }
                };
                self.scopes.push(scope);
                self.stmts(&mut block.body);
                self.scopes.pop();
            }
            Cond::Compare { lhs, rhs, .. } => {
                self.expr(lhs);
                self.expr(rhs);
                self.stmts(&mut block.body);
            }
        }
        if let Some(otherwise) = &mut block.otherwise {
            self.stmts(otherwise);
        }
    }

    fn stmts(&mut self, stmts: &mut [Stmt]) {
        for stmt in stmts {
            match stmt {
                Stmt::Block(block) => self.block(block),
                Stmt::Action(action) => self.action(action),
            }
        }
    }

    fn action(&mut self, action: &mut Action) {
        for label in &mut action.target.labels {
            self.expr(label);
        }
        if let Some(value) = &mut action.value {
            self.expr(value);
        }

        let target = &mut action.target;
        let Some(&index) = self.by_name.get(&target.name) else {
            let name = target.name.clone();
            self.error(
                CompileErrorKind::UndeclaredMetric,
                target.span,
                format!("metric `{name}` is not declared"),
            );
            return;
        };
        target.index = Some(index);

        let (kind, expected) = {
            let spec = &self.metrics[index];
            (spec.kind, spec.labels.len())
        };
        if target.labels.len() != expected {
            let message = format!(
                "metric `{}` has {expected} labels, {} given",
                target.name,
                target.labels.len()
            );
            self.error(CompileErrorKind::LabelArity, target.span, message);
        }

        let allowed = match kind {
            MetricKind::Counter => matches!(action.op, ActionOp::Inc | ActionOp::AddAssign),
            MetricKind::Gauge => true,
            MetricKind::Histogram => action.op == ActionOp::Assign,
        };
        if !allowed {
            let message = format!(
                "`{}` cannot be applied to {kind} `{}`",
                action.op.symbol(),
                action.target.name
            );
            self.error(CompileErrorKind::KindMismatch, action.span, message);
            return;
        }

        if kind == MetricKind::Counter
            && let Some(delta) = action.value.as_ref().and_then(Expr::constant)
            && delta < 0.0
        {
            let message = format!(
                "counter `{}` cannot be decremented (delta {delta})",
                action.target.name
            );
            self.error(CompileErrorKind::KindMismatch, action.span, message);
        }
    }

    fn expr(&mut self, expr: &mut Expr) {
        let span = expr.span;
        match &mut expr.kind {
            ExprKind::Number(_) => {}
            ExprKind::Capture(capture) => self.capture(capture, span),
            ExprKind::Str(parts) => {
                for part in parts {
                    if let StrPart::Capture(capture) = part {
                        self.capture(capture, span);
                    }
                }
            }
            ExprKind::Binary { lhs, rhs, .. } => {
                self.expr(lhs);
                self.expr(rhs);
            }
            ExprKind::Neg(inner) => self.expr(inner),
        }
    }

    fn capture(&mut self, capture: &mut Capture, span: Span) {
        let Some(innermost) = self.scopes.last() else {
            self.error(
                CompileErrorKind::Capture,
                span,
                format!("capture `{}` used outside of any pattern", capture.reference),
            );
            return;
        };
        let frame = self.scopes.len() - 1;

        match &capture.reference {
            CaptureRef::Index(group) => {
                if innermost.poisoned {
                    return;
                }
                if *group < innermost.groups {
                    capture.slot = Some(CaptureSlot {
                        frame,
                        group: *group,
                    });
                } else {
                    let message = format!(
                        "capture `${group}` out of range: enclosing pattern has {} groups",
                        innermost.groups.saturating_sub(1)
                    );
                    self.error(CompileErrorKind::Capture, span, message);
                }
            }
            CaptureRef::Name(name) => {
                let found = self
                    .scopes
                    .iter()
                    .enumerate()
                    .rev()
                    .find_map(|(frame, scope)| scope.names.get(name).map(|&group| (frame, group)));
                match found {
                    Some((frame, group)) => capture.slot = Some(CaptureSlot { frame, group }),
                    None if self.scopes.iter().any(|s| s.poisoned) => {}
                    None => {
                        let message = format!("no enclosing pattern defines capture `${name}`");
                        self.error(CompileErrorKind::Capture, span, message);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::lexer::tokenize;
    use crate::compiler::parser::parse;

    fn check_source(source: &str) -> Result<(Ast, Checked), Vec<CompileError>> {
        let index = LineIndex::new(source);
        let (tokens, lex_errors) = tokenize(source, &index);
        assert!(lex_errors.is_empty());
        let (mut ast, parse_errors) = parse(&tokens, &index, source.len());
        assert!(parse_errors.is_empty(), "{parse_errors:?}");
        let checked = check(&mut ast, &index)?;
        Ok((ast, checked))
    }

    fn kinds(source: &str) -> Vec<CompileErrorKind> {
        check_source(source)
            .expect_err("expected semantic errors")
            .into_iter()
            .map(|e| e.kind)
            .collect()
    }

    #[test]
    fn test_valid_program_builds_tables() {
        let (_, checked) = check_source(
            r#"counter requests by code
               histogram latency buckets 1, 10
               /(?P<code>\d{3}) (\d+)ms/ {
                 requests[$code]++
                 latency = $2
               }"#,
        )
        .unwrap();
        assert_eq!(checked.metrics.len(), 2);
        assert_eq!(checked.metrics[1].buckets, vec![1.0, 10.0]);
        assert_eq!(checked.patterns.len(), 1);
    }

    #[test]
    fn test_default_histogram_buckets() {
        let (_, checked) = check_source("histogram h\n/(\\d+)/ { h = $1 }").unwrap();
        assert_eq!(checked.metrics[0].buckets, DEFAULT_BUCKETS.to_vec());
    }

    #[test]
    fn test_undeclared_metric() {
        assert_eq!(kinds("/x/ { missing++ }"), vec![CompileErrorKind::UndeclaredMetric]);
    }

    #[test]
    fn test_declaration_after_use_is_allowed() {
        assert!(check_source("/x/ { late++ }\ncounter late").is_ok());
    }

    #[test]
    fn test_duplicate_declaration() {
        assert_eq!(
            kinds("counter a\ngauge a"),
            vec![CompileErrorKind::InvalidDeclaration]
        );
    }

    #[test]
    fn test_invalid_regex() {
        let errors = check_source("counter a\n/(unclosed/ { a++ }").unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].kind, CompileErrorKind::InvalidRegex);
        assert_eq!((errors[0].line, errors[0].column), (2, 1));
    }

    #[test]
    fn test_operation_kind_mismatches() {
        assert_eq!(kinds("counter c\n/x/ { c = 1 }"), vec![CompileErrorKind::KindMismatch]);
        assert_eq!(kinds("counter c\n/x/ { c-- }"), vec![CompileErrorKind::KindMismatch]);
        assert_eq!(kinds("counter c\n/x/ { c -= 1 }"), vec![CompileErrorKind::KindMismatch]);
        assert_eq!(kinds("histogram h\n/x/ { h++ }"), vec![CompileErrorKind::KindMismatch]);
        assert!(check_source("gauge g\n/x/ { g++; g--; g += 2; g -= 1; g = 5 }").is_ok());
    }

    #[test]
    fn test_negative_literal_counter_delta() {
        assert_eq!(kinds("counter c\n/x/ { c += -3 }"), vec![CompileErrorKind::KindMismatch]);
        assert!(check_source("counter c\n/x/ { c += 3 }").is_ok());
    }

    #[test]
    fn test_label_arity() {
        assert_eq!(
            kinds("counter c by a, b\n/(x)/ { c[$1]++ }"),
            vec![CompileErrorKind::LabelArity]
        );
        assert_eq!(kinds("counter c\n/(x)/ { c[$1]++ }"), vec![CompileErrorKind::LabelArity]);
    }

    #[test]
    fn test_capture_resolution_in_nested_scopes() {
        let (ast, _) = check_source(
            r#"counter c by outer, inner
               /(?P<host>\w+) (\w+)/ {
                 /(\d+)$/ {
                   c[$host, $1]++
                 }
               }"#,
        )
        .unwrap();
        let Item::Block(outer) = &ast.items[1] else {
            panic!("expected block");
        };
        let Stmt::Block(inner) = &outer.body[0] else {
            panic!("expected nested block");
        };
        let Stmt::Action(action) = &inner.body[0] else {
            panic!("expected action");
        };
        let slots: Vec<_> = action
            .target
            .labels
            .iter()
            .map(|l| match &l.kind {
                ExprKind::Capture(c) => c.slot,
                _ => None,
            })
            .collect();
        assert_eq!(
            slots,
            vec![
                Some(CaptureSlot { frame: 0, group: 1 }),
                Some(CaptureSlot { frame: 1, group: 1 }),
            ]
        );
    }

    #[test]
    fn test_capture_errors() {
        assert_eq!(kinds("counter c\n/(a)/ { c += $2 }"), vec![CompileErrorKind::Capture]);
        assert_eq!(kinds("counter c\n/(a)/ { c += $nope }"), vec![CompileErrorKind::Capture]);
        assert_eq!(
            kinds("counter c\n1 > 0 { c += $1 }"),
            vec![CompileErrorKind::Capture]
        );
    }

    #[test]
    fn test_else_branch_does_not_see_failed_captures() {
        assert_eq!(
            kinds("counter c by x\n/(a)/ { c[$1]++ } else { c[$1]++ }"),
            vec![CompileErrorKind::Capture]
        );
    }

    #[test]
    fn test_errors_sorted_by_position() {
        let errors = check_source("counter c\n/x/ { d++ }\n/y/ { c = 1 }\n/z/ { e++ }").unwrap_err();
        let lines: Vec<_> = errors.iter().map(|e| e.line).collect();
        assert_eq!(lines, vec![2, 3, 4]);
    }

    #[test]
    fn test_bad_buckets() {
        assert_eq!(
            kinds("counter c buckets 1, 2"),
            vec![CompileErrorKind::InvalidDeclaration]
        );
        assert_eq!(
            kinds("histogram h buckets 5, 1"),
            vec![CompileErrorKind::InvalidDeclaration]
        );
    }
}
