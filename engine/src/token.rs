//! Token types for the decision-rule language.
//!
//! Each token carries its kind, the raw source text, a byte span and the
//! 1-based line/column where it starts. Golf-mode keywords and operators are
//! first-class kinds rather than identifiers reinterpreted later.

use std::fmt;

/// Byte offset range in the source string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Merge two spans into one that covers both.
    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// Where in the grammar the next token will be read. Only consequence
/// context turns golf letters into consequence keywords; a rule-body
/// statement is lexed like a condition until the parser knows its role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LexContext {
    #[default]
    Condition,
    Consequence,
    RuleBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Literals
    Number(f64),
    Str(String),
    True,
    False,
    Null,

    Identifier(String),

    // Keywords
    Rule,
    If,
    Then,
    Else,
    End,
    When,
    Do,

    // Golf-mode keywords
    Win,
    Lose,
    Draw,
    Skip,
    Fail,
    Pass,
    Underscore,
    Any,
    All,

    // Operators
    Question,    // ?
    Colon,       // :
    Elvis,       // ?:  (golf mode only)
    And,         // && / and
    Or,          // || / or
    Bang,        // ! / not
    Chain,       // >>
    Arrow,       // ->
    FatArrow,    // =>
    Eq,          // =
    EqEq,        // ==
    BangEq,      // !=
    Lt,          // <
    LtEq,        // <=
    Gt,          // >
    GtEq,        // >=
    Plus,        // +
    Minus,       // -
    Star,        // *
    Slash,       // /
    Percent,     // %

    // Delimiters
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Semicolon,

    // Trivia, only produced when the lexer is configured not to skip it
    Whitespace,
    Newline,
    Comment,

    // Special
    Error(String),
    Eof,
}

impl TokenKind {
    /// Consequence keywords, full or single-letter.
    pub fn is_consequence_keyword(&self) -> bool {
        matches!(
            self,
            TokenKind::Win
                | TokenKind::Lose
                | TokenKind::Draw
                | TokenKind::Skip
                | TokenKind::Fail
                | TokenKind::Pass
        )
    }

    pub fn is_trivia(&self) -> bool {
        matches!(
            self,
            TokenKind::Whitespace | TokenKind::Newline | TokenKind::Comment
        )
    }
}

/// Static keyword table. Lookup is an exact match on the whole lexeme,
/// so `truex` is never split into `true` + `x`.
const KEYWORDS: &[(&str, TokenKind)] = &[
    ("rule", TokenKind::Rule),
    ("if", TokenKind::If),
    ("then", TokenKind::Then),
    ("else", TokenKind::Else),
    ("end", TokenKind::End),
    ("when", TokenKind::When),
    ("do", TokenKind::Do),
    ("true", TokenKind::True),
    ("false", TokenKind::False),
    ("null", TokenKind::Null),
    ("and", TokenKind::And),
    ("or", TokenKind::Or),
    ("not", TokenKind::Bang),
    ("win", TokenKind::Win),
    ("lose", TokenKind::Lose),
    ("draw", TokenKind::Draw),
    ("skip", TokenKind::Skip),
    ("fail", TokenKind::Fail),
    ("pass", TokenKind::Pass),
    ("_", TokenKind::Underscore),
    ("any", TokenKind::Any),
    ("all", TokenKind::All),
];

pub fn keyword(text: &str) -> Option<TokenKind> {
    KEYWORDS
        .iter()
        .find(|(word, _)| word.len() == text.len() && *word == text)
        .map(|(_, kind)| kind.clone())
}

/// Single-letter golf shorthand for consequence keywords.
pub fn golf_shorthand(text: &str) -> Option<TokenKind> {
    match text {
        "W" => Some(TokenKind::Win),
        "L" => Some(TokenKind::Lose),
        "D" => Some(TokenKind::Draw),
        "S" => Some(TokenKind::Skip),
        "F" => Some(TokenKind::Fail),
        "P" => Some(TokenKind::Pass),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    pub span: Span,
    pub line: usize,
    pub column: usize,
}

impl Token {
    pub fn new(kind: TokenKind, text: impl Into<String>, span: Span, line: usize, column: usize) -> Self {
        Self {
            kind,
            text: text.into(),
            span,
            line,
            column,
        }
    }

    /// Length of the lexeme in bytes.
    pub fn len(&self) -> usize {
        self.span.end - self.span.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_error(&self) -> bool {
        matches!(self.kind, TokenKind::Error(_))
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Number(n) => write!(f, "{}", n),
            TokenKind::Str(s) => write!(f, "\"{}\"", s),
            TokenKind::True => write!(f, "true"),
            TokenKind::False => write!(f, "false"),
            TokenKind::Null => write!(f, "null"),
            TokenKind::Identifier(s) => write!(f, "{}", s),
            TokenKind::Rule => write!(f, "rule"),
            TokenKind::If => write!(f, "if"),
            TokenKind::Then => write!(f, "then"),
            TokenKind::Else => write!(f, "else"),
            TokenKind::End => write!(f, "end"),
            TokenKind::When => write!(f, "when"),
            TokenKind::Do => write!(f, "do"),
            TokenKind::Win => write!(f, "win"),
            TokenKind::Lose => write!(f, "lose"),
            TokenKind::Draw => write!(f, "draw"),
            TokenKind::Skip => write!(f, "skip"),
            TokenKind::Fail => write!(f, "fail"),
            TokenKind::Pass => write!(f, "pass"),
            TokenKind::Underscore => write!(f, "_"),
            TokenKind::Any => write!(f, "any"),
            TokenKind::All => write!(f, "all"),
            TokenKind::Question => write!(f, "?"),
            TokenKind::Colon => write!(f, ":"),
            TokenKind::Elvis => write!(f, "?:"),
            TokenKind::And => write!(f, "&&"),
            TokenKind::Or => write!(f, "||"),
            TokenKind::Bang => write!(f, "!"),
            TokenKind::Chain => write!(f, ">>"),
            TokenKind::Arrow => write!(f, "->"),
            TokenKind::FatArrow => write!(f, "=>"),
            TokenKind::Eq => write!(f, "="),
            TokenKind::EqEq => write!(f, "=="),
            TokenKind::BangEq => write!(f, "!="),
            TokenKind::Lt => write!(f, "<"),
            TokenKind::LtEq => write!(f, "<="),
            TokenKind::Gt => write!(f, ">"),
            TokenKind::GtEq => write!(f, ">="),
            TokenKind::Plus => write!(f, "+"),
            TokenKind::Minus => write!(f, "-"),
            TokenKind::Star => write!(f, "*"),
            TokenKind::Slash => write!(f, "/"),
            TokenKind::Percent => write!(f, "%"),
            TokenKind::LParen => write!(f, "("),
            TokenKind::RParen => write!(f, ")"),
            TokenKind::LBrace => write!(f, "{{"),
            TokenKind::RBrace => write!(f, "}}"),
            TokenKind::Comma => write!(f, ","),
            TokenKind::Semicolon => write!(f, ";"),
            TokenKind::Whitespace => write!(f, "whitespace"),
            TokenKind::Newline => write!(f, "newline"),
            TokenKind::Comment => write!(f, "comment"),
            TokenKind::Error(msg) => write!(f, "error: {}", msg),
            TokenKind::Eof => write!(f, "EOF"),
        }
    }
}
