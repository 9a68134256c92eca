//! Hand-written recursive descent parser.
//!
//! On a syntax error the parser records it, skips to the start of the next
//! top-level item and carries on, so one pass reports every independent
//! syntax error in the program.

use super::ast::*;
use super::error::{CompileError, CompileErrorKind, LineIndex};
use super::lexer::{Spanned, Token};
use crate::metrics::MetricKind;

type PResult<T> = Result<T, CompileError>;

/// Deepest syntax tree the parser builds. Counts nested blocks, unary
/// operators, parentheses and operators of a `+`/`*` chain, which bounds the
/// recursion of every later pass over the tree.
pub const MAX_NESTING: usize = 128;

pub fn parse(tokens: &[Spanned], index: &LineIndex, source_len: usize) -> (Ast, Vec<CompileError>) {
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
        nesting: 0,
        index,
        eof: Span::new(source_len, source_len),
        errors: Vec::new(),
    };
    let ast = parser.program();
    (ast, parser.errors)
}

struct Parser<'a> {
    tokens: &'a [Spanned],
    pos: usize,
    /// Number of currently open `{`.
    depth: usize,
    /// Depth of the syntax tree under construction.
    nesting: usize,
    index: &'a LineIndex<'a>,
    eof: Span,
    errors: Vec<CompileError>,
}

impl Parser<'_> {
    fn program(&mut self) -> Ast {
        let mut items = Vec::new();
        while !self.at_end() {
            if self.eat(&Token::Semi) {
                continue;
            }
            let start = self.pos;
            match self.item() {
                Ok(item) => items.push(item),
                Err(err) => {
                    self.errors.push(err);
                    self.synchronize();
                    if self.pos == start {
                        self.advance();
                    }
                    self.depth = 0;
                }
            }
        }
        Ast { items }
    }

    fn item(&mut self) -> PResult<Item> {
        match self.peek() {
            Some(Token::Counter | Token::Gauge | Token::Histogram) => self.decl().map(Item::Decl),
            Some(Token::Ident(name)) => Err(self.error_here(format!(
                "action on `{name}` must be inside a pattern block"
            ))),
            _ => self.cond_block().map(Item::Block),
        }
    }

    fn decl(&mut self) -> PResult<Decl> {
        let start = self.current_span();
        let kind = match self.advance() {
            Some(Token::Counter) => MetricKind::Counter,
            Some(Token::Gauge) => MetricKind::Gauge,
            _ => MetricKind::Histogram,
        };
        let name = self.ident("metric name")?;

        let mut labels = Vec::new();
        if self.eat(&Token::By) {
            labels.push(self.ident("label name")?);
            while self.eat(&Token::Comma) {
                labels.push(self.ident("label name")?);
            }
        }

        let mut buckets = None;
        if self.eat(&Token::Buckets) {
            let mut bounds = vec![self.signed_number()?];
            while self.eat(&Token::Comma) {
                bounds.push(self.signed_number()?);
            }
            buckets = Some(bounds);
        }

        Ok(Decl {
            kind,
            name,
            labels,
            buckets,
            span: start.to(self.previous_span()),
        })
    }

    fn cond_block(&mut self) -> PResult<CondBlock> {
        let start = self.current_span();
        let cond = self.cond()?;
        let body = self.block_body()?;
        let otherwise = if self.eat(&Token::Else) {
            Some(self.block_body()?)
        } else {
            None
        };
        Ok(CondBlock {
            cond,
            body,
            otherwise,
            span: start.to(self.previous_span()),
        })
    }

    fn cond(&mut self) -> PResult<Cond> {
        if let Some(Token::Regex(source)) = self.peek() {
            let source = source.clone();
            let span = self.current_span();
            self.advance();
            return Ok(Cond::Pattern(Pattern {
                source,
                span,
                id: None,
            }));
        }

        let lhs = self.expr()?;
        let op = match self.peek() {
            Some(Token::Eq) => CmpOp::Eq,
            Some(Token::Ne) => CmpOp::Ne,
            Some(Token::Lt) => CmpOp::Lt,
            Some(Token::Le) => CmpOp::Le,
            Some(Token::Gt) => CmpOp::Gt,
            Some(Token::Ge) => CmpOp::Ge,
            _ => return Err(self.unexpected("a comparison operator")),
        };
        self.advance();
        let rhs = self.expr()?;
        Ok(Cond::Compare { lhs, op, rhs })
    }

    fn block_body(&mut self) -> PResult<Vec<Stmt>> {
        self.expect(&Token::LBrace)?;
        self.depth += 1;
        let stmts = self.nested(|p| {
            p.deeper("blocks")?;
            let mut stmts = Vec::new();
            loop {
                match p.peek() {
                    Some(Token::RBrace) => break,
                    Some(Token::Semi) => {
                        p.advance();
                    }
                    Some(_) => stmts.push(p.stmt()?),
                    None => return Err(p.unexpected("`}`")),
                }
            }
            Ok(stmts)
        })?;
        self.advance();
        self.depth -= 1;
        Ok(stmts)
    }

    fn stmt(&mut self) -> PResult<Stmt> {
        match self.peek() {
            Some(Token::Ident(_)) => self.action().map(Stmt::Action),
            _ => self.cond_block().map(Stmt::Block),
        }
    }

    fn action(&mut self) -> PResult<Action> {
        let target = self.metric_ref()?;
        let op = match self.peek() {
            Some(Token::PlusPlus) => ActionOp::Inc,
            Some(Token::MinusMinus) => ActionOp::Dec,
            Some(Token::PlusAssign) => ActionOp::AddAssign,
            Some(Token::MinusAssign) => ActionOp::SubAssign,
            Some(Token::Assign) => ActionOp::Assign,
            _ => return Err(self.unexpected("`++`, `--`, `+=`, `-=` or `=`")),
        };
        self.advance();
        let value = match op {
            ActionOp::Inc | ActionOp::Dec => None,
            _ => Some(self.expr()?),
        };
        Ok(Action {
            span: target.span.to(self.previous_span()),
            target,
            op,
            value,
        })
    }

    fn metric_ref(&mut self) -> PResult<MetricRef> {
        let start = self.current_span();
        let name = self.ident("metric name")?;
        let mut labels = Vec::new();
        if self.eat(&Token::LBracket) {
            labels.push(self.expr()?);
            while self.eat(&Token::Comma) {
                labels.push(self.expr()?);
            }
            self.expect(&Token::RBracket)?;
        }
        Ok(MetricRef {
            name,
            labels,
            span: start.to(self.previous_span()),
            index: None,
        })
    }

    fn expr(&mut self) -> PResult<Expr> {
        self.nested(|p| {
            let mut lhs = p.term()?;
            loop {
                let op = match p.peek() {
                    Some(Token::Plus) => BinOp::Add,
                    Some(Token::Minus) => BinOp::Sub,
                    _ => return Ok(lhs),
                };
                p.advance();
                // Each operator adds a level to the left-leaning tree.
                p.deeper("expression")?;
                let rhs = p.term()?;
                lhs = binary(op, lhs, rhs);
            }
        })
    }

    fn term(&mut self) -> PResult<Expr> {
        self.nested(|p| {
            let mut lhs = p.unary()?;
            while p.eat(&Token::Star) {
                p.deeper("expression")?;
                let rhs = p.unary()?;
                lhs = binary(BinOp::Mul, lhs, rhs);
            }
            Ok(lhs)
        })
    }

    fn unary(&mut self) -> PResult<Expr> {
        self.nested(|p| {
            p.deeper("expression")?;
            let start = p.current_span();
            if p.eat(&Token::Minus) {
                let inner = p.unary()?;
                return Ok(Expr {
                    span: start.to(inner.span),
                    kind: ExprKind::Neg(Box::new(inner)),
                });
            }
            p.primary()
        })
    }

    /// Run `f`, restoring the tree depth afterwards whatever it returns.
    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> PResult<T>) -> PResult<T> {
        let outer = self.nesting;
        let result = f(self);
        self.nesting = outer;
        result
    }

    fn deeper(&mut self, what: &str) -> PResult<()> {
        self.nesting += 1;
        if self.nesting > MAX_NESTING {
            return Err(self.error_here(format!("{what} nested too deeply")));
        }
        Ok(())
    }

    fn primary(&mut self) -> PResult<Expr> {
        let span = self.current_span();
        let kind = match self.peek() {
            Some(Token::Number(n)) => ExprKind::Number(*n),
            Some(Token::Str(raw)) => {
                let raw = raw.clone();
                ExprKind::Str(self.string_parts(&raw, span)?)
            }
            Some(Token::CapRef(reference)) => ExprKind::Capture(Capture::new(capture_ref(reference))),
            Some(Token::LParen) => {
                self.advance();
                let inner = self.expr()?;
                self.expect(&Token::RParen)?;
                return Ok(Expr {
                    kind: inner.kind,
                    span: span.to(self.previous_span()),
                });
            }
            _ => return Err(self.unexpected("a number, string or capture reference")),
        };
        self.advance();
        Ok(Expr { kind, span })
    }

    fn signed_number(&mut self) -> PResult<f64> {
        let negative = self.eat(&Token::Minus);
        match self.peek() {
            Some(Token::Number(n)) => {
                let n = *n;
                self.advance();
                Ok(if negative { -n } else { n })
            }
            _ => Err(self.unexpected("a number")),
        }
    }

    /// Resolve escapes and split `$1`, `$name`, `${name}` out of a string body.
    fn string_parts(&self, raw: &str, span: Span) -> PResult<Vec<StrPart>> {
        let mut parts = Vec::new();
        let mut text = String::new();
        let mut chars = raw.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '\\' => match chars.next() {
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some(other @ ('"' | '\\' | '$')) => text.push(other),
                    Some(other) => {
                        text.push('\\');
                        text.push(other);
                    }
                    None => text.push('\\'),
                },
                '$' => {
                    let reference = match chars.peek() {
                        Some('{') => {
                            chars.next();
                            let name: String = chars.by_ref().take_while(|&c| c != '}').collect();
                            if name.is_empty() {
                                return Err(CompileError::new(
                                    CompileErrorKind::Syntax,
                                    self.index.position(span.start),
                                    "empty `${}` in string",
                                ));
                            }
                            Some(capture_ref(&name))
                        }
                        Some(c) if c.is_ascii_digit() => {
                            let mut digits = String::new();
                            while let Some(&d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                                digits.push(d);
                                chars.next();
                            }
                            Some(capture_ref(&digits))
                        }
                        Some(c) if c.is_ascii_alphabetic() || *c == '_' => {
                            let mut name = String::new();
                            while let Some(&d) = chars
                                .peek()
                                .filter(|d| d.is_ascii_alphanumeric() || **d == '_')
                            {
                                name.push(d);
                                chars.next();
                            }
                            Some(capture_ref(&name))
                        }
                        _ => None,
                    };
                    match reference {
                        Some(reference) => {
                            if !text.is_empty() {
                                parts.push(StrPart::Text(std::mem::take(&mut text)));
                            }
                            parts.push(StrPart::Capture(Capture::new(reference)));
                        }
                        None => text.push('$'),
                    }
                }
                other => text.push(other),
            }
        }
        if !text.is_empty() || parts.is_empty() {
            parts.push(StrPart::Text(text));
        }
        Ok(parts)
    }

    // Token stream helpers.

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|t| &t.token)
    }

    fn advance(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos).map(|t| &t.token);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn check(&self, expected: &Token) -> bool {
        matches!(self.peek(), Some(t) if std::mem::discriminant(t) == std::mem::discriminant(expected))
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.check(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> PResult<()> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(self.unexpected(&expected.to_string()))
        }
    }

    fn ident(&mut self, what: &str) -> PResult<String> {
        match self.peek() {
            Some(Token::Ident(name)) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected(what)),
        }
    }

    fn current_span(&self) -> Span {
        self.tokens.get(self.pos).map_or(self.eof, |t| t.span)
    }

    fn previous_span(&self) -> Span {
        self.pos
            .checked_sub(1)
            .and_then(|i| self.tokens.get(i))
            .map_or(self.eof, |t| t.span)
    }

    fn error_here(&self, message: String) -> CompileError {
        CompileError::new(
            CompileErrorKind::Syntax,
            self.index.position(self.current_span().start),
            message,
        )
    }

    fn unexpected(&self, expected: &str) -> CompileError {
        let found = match self.peek() {
            Some(token) => token.to_string(),
            None => "end of input".to_string(),
        };
        self.error_here(format!("expected {expected}, found {found}"))
    }

    /// Skip to the next top-level item: a declaration keyword or pattern at
    /// brace depth zero, or just past the `}` that closes the current item.
    fn synchronize(&mut self) {
        while let Some(token) = self.peek() {
            match token {
                Token::LBrace => self.depth += 1,
                Token::RBrace => {
                    self.depth = self.depth.saturating_sub(1);
                    self.advance();
                    if self.depth == 0 {
                        return;
                    }
                    continue;
                }
                Token::Counter | Token::Gauge | Token::Histogram | Token::Regex(_) if self.depth == 0 => {
                    return;
                }
                _ => {}
            }
            self.advance();
        }
    }
}

fn binary(op: BinOp, lhs: Expr, rhs: Expr) -> Expr {
    Expr {
        span: lhs.span.to(rhs.span),
        kind: ExprKind::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        },
    }
}

fn capture_ref(text: &str) -> CaptureRef {
    match text.parse::<usize>() {
        Ok(index) => CaptureRef::Index(index),
        Err(_) => CaptureRef::Name(text.to_string()),
    }
}
