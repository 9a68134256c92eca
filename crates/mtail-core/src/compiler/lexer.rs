//! Tokenization of program source using logos.
//!
//! Whitespace (including newlines) and `#` comments are skipped. A `/`
//! always opens a regex literal; the language has no division operator.

use std::fmt;
use std::ops::Range;

use logos::Logos;

use super::ast::Span;
use super::error::{CompileError, CompileErrorKind, LineIndex};

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip r"#[^\n]*")]
pub enum Token {
    #[token("counter")]
    Counter,
    #[token("gauge")]
    Gauge,
    #[token("histogram")]
    Histogram,
    #[token("by")]
    By,
    #[token("buckets")]
    Buckets,
    #[token("else")]
    Else,

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),
    #[regex(r"[0-9]+(\.[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    Number(f64),
    /// Regex body without the delimiting slashes; `\/` already unescaped.
    #[regex(r"/([^/\\\n]|\\.)*/", |lex| unescape_regex(lex.slice()))]
    Regex(String),
    /// Raw string body without quotes. Escapes and `$` interpolation are
    /// resolved by the parser.
    #[regex(r#""([^"\\\n]|\\.)*""#, |lex| {
        let s = lex.slice();
        s[1..s.len() - 1].to_string()
    })]
    Str(String),
    /// Capture reference without the `$`: `1`, `0`, `name`.
    #[regex(r"\$[0-9]+", |lex| lex.slice()[1..].to_string())]
    #[regex(r"\$[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice()[1..].to_string())]
    CapRef(String),

    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token(",")]
    Comma,
    #[token(";")]
    Semi,

    #[token("++")]
    PlusPlus,
    #[token("--")]
    MinusMinus,
    #[token("+=")]
    PlusAssign,
    #[token("-=")]
    MinusAssign,
    #[token("=")]
    Assign,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,

    #[token("==")]
    Eq,
    #[token("!=")]
    Ne,
    #[token("<")]
    Lt,
    #[token("<=")]
    Le,
    #[token(">")]
    Gt,
    #[token(">=")]
    Ge,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Counter => f.write_str("`counter`"),
            Token::Gauge => f.write_str("`gauge`"),
            Token::Histogram => f.write_str("`histogram`"),
            Token::By => f.write_str("`by`"),
            Token::Buckets => f.write_str("`buckets`"),
            Token::Else => f.write_str("`else`"),
            Token::Ident(name) => write!(f, "identifier `{name}`"),
            Token::Number(n) => write!(f, "number `{n}`"),
            Token::Regex(re) => write!(f, "pattern `/{re}/`"),
            Token::Str(s) => write!(f, "string \"{s}\""),
            Token::CapRef(c) => write!(f, "capture `${c}`"),
            Token::LBrace => f.write_str("`{`"),
            Token::RBrace => f.write_str("`}`"),
            Token::LBracket => f.write_str("`[`"),
            Token::RBracket => f.write_str("`]`"),
            Token::LParen => f.write_str("`(`"),
            Token::RParen => f.write_str("`)`"),
            Token::Comma => f.write_str("`,`"),
            Token::Semi => f.write_str("`;`"),
            Token::PlusPlus => f.write_str("`++`"),
            Token::MinusMinus => f.write_str("`--`"),
            Token::PlusAssign => f.write_str("`+=`"),
            Token::MinusAssign => f.write_str("`-=`"),
            Token::Assign => f.write_str("`=`"),
            Token::Plus => f.write_str("`+`"),
            Token::Minus => f.write_str("`-`"),
            Token::Star => f.write_str("`*`"),
            Token::Eq => f.write_str("`==`"),
            Token::Ne => f.write_str("`!=`"),
            Token::Lt => f.write_str("`<`"),
            Token::Le => f.write_str("`<=`"),
            Token::Gt => f.write_str("`>`"),
            Token::Ge => f.write_str("`>=`"),
        }
    }
}

/// A token with its byte range in the source.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub span: Span,
}

fn unescape_regex(slice: &str) -> String {
    slice[1..slice.len() - 1].replace("\\/", "/")
}

/// Split `source` into tokens, collecting an error for every unrecognized
/// character sequence instead of stopping at the first one.
pub fn tokenize(source: &str, index: &LineIndex) -> (Vec<Spanned>, Vec<CompileError>) {
    let mut tokens = Vec::new();
    let mut errors = Vec::new();
    let mut lexer = Token::lexer(source);

    while let Some(result) = lexer.next() {
        let range: Range<usize> = lexer.span();
        let span = Span::new(range.start, range.end);
        match result {
            Ok(token) => tokens.push(Spanned { token, span }),
            Err(()) => errors.push(CompileError::new(
                CompileErrorKind::Syntax,
                index.position(span.start),
                format!("unexpected input `{}`", lexer.slice()),
            )),
        }
    }

    (tokens, errors)
}
