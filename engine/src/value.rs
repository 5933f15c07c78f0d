//! Runtime values produced by evaluation.
//!
//! Strings are owned copies; nothing is interned at this layer. Errors that
//! should propagate through the tree as data are carried by
//! [`Value::Error`], keeping them distinguishable from `Null`.

use std::collections::BTreeMap;
use std::fmt;

use crate::ast::ConsequenceKind;
use crate::errors::{Error, ErrorKind};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<Value>),
    Dict(BTreeMap<String, Value>),
    Function(FunctionRef),
    Object(Box<Object>),
    Void,
    Error(EvalError),
}

/// A named callable supplied by a runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionRef {
    pub name: String,
    pub arity: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Object {
    /// The result of executing a consequence node.
    Consequence(ConsequenceOutcome),
    /// Any other structured value handed back by a runtime.
    Record {
        class: String,
        fields: BTreeMap<String, Value>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsequenceOutcome {
    pub action: String,
    pub kind: ConsequenceKind,
    pub success: bool,
    pub value: Value,
    pub message: Option<String>,
}

/// An error travelling through the tree as a value.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalError {
    pub kind: ErrorKind,
    pub message: String,
}

impl EvalError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&Error> for EvalError {
    fn from(error: &Error) -> Self {
        Self::new(error.kind(), error.to_string())
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind, self.message)
    }
}

impl Value {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Value::Error(EvalError::new(kind, message))
    }

    pub fn consequence(outcome: ConsequenceOutcome) -> Self {
        Value::Object(Box::new(Object::Consequence(outcome)))
    }

    /// Truthiness used by decisions, logic and chains.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Dict(entries) => !entries.is_empty(),
            Value::Function(_) => true,
            Value::Object(object) => match object.as_ref() {
                Object::Consequence(outcome) => outcome.success,
                Object::Record { .. } => true,
            },
            Value::Null | Value::Void | Value::Error(_) => false,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    pub fn as_consequence(&self) -> Option<&ConsequenceOutcome> {
        match self {
            Value::Object(object) => match object.as_ref() {
                Object::Consequence(outcome) => Some(outcome),
                Object::Record { .. } => None,
            },
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Dict(_) => "dict",
            Value::Function(_) => "function",
            Value::Object(_) => "object",
            Value::Void => "void",
            Value::Error(_) => "error",
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "\"{}\"", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Dict(entries) => {
                write!(f, "{{")?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", key, value)?;
                }
                write!(f, "}}")
            }
            Value::Function(func) => write!(f, "<fn {}/{}>", func.name, func.arity),
            Value::Object(object) => match object.as_ref() {
                Object::Consequence(outcome) => {
                    let status = if outcome.success { "ok" } else { "failed" };
                    write!(f, "{}({}) [{}]", outcome.kind, outcome.action, status)
                }
                Object::Record { class, fields } => {
                    write!(f, "{} {{", class)?;
                    for (i, (key, value)) in fields.iter().enumerate() {
                        if i > 0 {
                            write!(f, ",")?;
                        }
                        write!(f, " {}: {}", key, value)?;
                    }
                    write!(f, " }}")
                }
            },
            Value::Void => write!(f, "void"),
            Value::Error(err) => write!(f, "<{}>", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(Value::Bool(true).is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Number(-1.0).is_truthy());
        assert!(!Value::Number(0.0).is_truthy());
        assert!(Value::from("x").is_truthy());
        assert!(!Value::from("").is_truthy());
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Void.is_truthy());
        assert!(!Value::error(ErrorKind::Type, "bad").is_truthy());
    }

    #[test]
    fn test_consequence_truthiness_follows_success() {
        let outcome = |success| ConsequenceOutcome {
            action: "win".into(),
            kind: ConsequenceKind::Win,
            success,
            value: Value::Null,
            message: None,
        };
        assert!(Value::consequence(outcome(true)).is_truthy());
        assert!(!Value::consequence(outcome(false)).is_truthy());
        assert_eq!(
            Value::consequence(outcome(true)).to_string(),
            "win(win) [ok]"
        );
    }

    #[test]
    fn test_error_distinct_from_null() {
        let err = Value::error(ErrorKind::Type, "mismatch");
        assert_ne!(err, Value::Null);
        assert!(err.is_error());
        assert!(!Value::Null.is_error());
    }
}
