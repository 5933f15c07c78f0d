//! Error taxonomy and rich source diagnostics.
//!
//! Every phase reports failures through [`Error`]. Lexer and parser errors
//! carry a [`Span`] plus line/column so they can be rendered with miette,
//! underlining the exact characters that caused the problem.
//!
//! Evaluation failures that should flow through the tree as data use
//! [`crate::value::EvalError`] instead; only terminal conditions (recursion
//! ceilings, rule self-invocation) surface as [`Error`] from the evaluator.

use std::fmt;

use miette::{Diagnostic, SourceSpan};
use thiserror::Error;

use crate::token::Span;

pub type Result<T> = std::result::Result<T, Error>;

/// Flat classification of failures, independent of the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Syntax,
    Type,
    Recursion,
    Memory,
    InvalidState,
    Unsupported,
    Arithmetic,
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Syntax => "syntax",
            ErrorKind::Type => "type",
            ErrorKind::Recursion => "recursion",
            ErrorKind::Memory => "memory",
            ErrorKind::InvalidState => "invalid state",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Arithmetic => "arithmetic",
            ErrorKind::Config => "config",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// Malformed input found by the lexer or parser.
    #[error("syntax error at {line}:{column}: {message}")]
    Syntax {
        message: String,
        span: Span,
        line: usize,
        column: usize,
    },

    /// Operand types do not support the requested operation.
    #[error("type error: {0}")]
    Type(String),

    /// A depth ceiling was exceeded.
    #[error("maximum recursion depth {limit} exceeded in {phase}")]
    Recursion { phase: &'static str, limit: usize },

    /// A rule was invoked while it was already executing.
    #[error("rule '{name}' invoked recursively")]
    RuleRecursion { name: String },

    #[error("allocation failure: {0}")]
    Memory(String),

    /// Structural validation failed.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("arithmetic error: {0}")]
    Arithmetic(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn syntax(message: impl Into<String>, span: Span, line: usize, column: usize) -> Self {
        Self::Syntax {
            message: message.into(),
            span,
            line,
            column,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Syntax { .. } => ErrorKind::Syntax,
            Error::Type(_) => ErrorKind::Type,
            Error::Recursion { .. } | Error::RuleRecursion { .. } => ErrorKind::Recursion,
            Error::Memory(_) => ErrorKind::Memory,
            Error::InvalidState(_) => ErrorKind::InvalidState,
            Error::Unsupported(_) => ErrorKind::Unsupported,
            Error::Arithmetic(_) => ErrorKind::Arithmetic,
            Error::Config(_) => ErrorKind::Config,
        }
    }

    /// Source location, if the error came from the front end.
    pub fn span(&self) -> Option<Span> {
        match self {
            Error::Syntax { span, .. } => Some(*span),
            _ => None,
        }
    }
}

/// A syntax error attached to the source text it was found in.
#[derive(Error, Debug, Diagnostic)]
#[error("{message}")]
#[diagnostic(code(golf::syntax))]
pub struct SourceDiagnostic {
    pub message: String,

    #[source_code]
    pub src: String,

    #[label("{label}")]
    pub span: SourceSpan,

    pub label: String,
}

impl SourceDiagnostic {
    pub fn new(message: impl Into<String>, src: &str, span: Span, label: impl Into<String>) -> Self {
        let start = span.start.min(src.len());
        let end = span.end.clamp(start, src.len());
        Self {
            message: message.into(),
            src: src.to_string(),
            span: (start, end - start).into(),
            label: label.into(),
        }
    }

    /// Builds a diagnostic for a front-end error. Returns `None` for errors
    /// that have no source location.
    pub fn from_error(error: &Error, src: &str) -> Option<Self> {
        match error {
            Error::Syntax {
                message,
                span,
                line,
                column,
            } => Some(Self::new(
                format!("syntax error at {}:{}", line, column),
                src,
                *span,
                message.clone(),
            )),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(Error::Type("x".into()).kind(), ErrorKind::Type);
        assert_eq!(
            Error::RuleRecursion { name: "r".into() }.kind(),
            ErrorKind::Recursion
        );
        assert_eq!(
            Error::Recursion {
                phase: "parser",
                limit: 256
            }
            .kind(),
            ErrorKind::Recursion
        );
    }

    #[test]
    fn test_diagnostic_clamps_span() {
        let err = Error::syntax("unexpected '@'", Span::new(4, 40), 1, 5);
        let diag = SourceDiagnostic::from_error(&err, "1 + @").expect("syntax error has a span");
        assert_eq!(diag.span.offset(), 4);
        assert_eq!(diag.span.len(), 1);
        assert_eq!(diag.label, "unexpected '@'");
    }

    #[test]
    fn test_diagnostic_requires_location() {
        assert!(SourceDiagnostic::from_error(&Error::Type("bad".into()), "x").is_none());
    }
}
