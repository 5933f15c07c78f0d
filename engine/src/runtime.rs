//! The capability the evaluator consumes to read variables and perform
//! consequences. The evaluator never knows how variables are stored.

use std::collections::HashMap;

use crate::ast::ConsequenceKind;
use crate::value::Value;

/// What a runtime reports after performing a consequence.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsequenceResult {
    /// `false` when the runtime has no handler for the action; the
    /// evaluator then treats the consequence as a successful no-op.
    pub handled: bool,
    pub success: bool,
    pub value: Value,
    pub message: Option<String>,
}

impl ConsequenceResult {
    pub fn unhandled() -> Self {
        Self {
            handled: false,
            success: true,
            value: Value::Null,
            message: None,
        }
    }

    pub fn ok(value: Value) -> Self {
        Self {
            handled: true,
            success: true,
            value,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            handled: true,
            success: false,
            value: Value::Null,
            message: Some(message.into()),
        }
    }
}

pub trait Runtime {
    /// Look up a variable. Unknown names yield `Value::Null`.
    fn get_variable(&self, name: &str) -> Value;

    /// Store a variable, returning the previous value if any.
    fn set_variable(&mut self, _name: &str, _value: Value) -> Option<Value> {
        None
    }

    fn execute_consequence(&mut self, action: &str, kind: ConsequenceKind) -> ConsequenceResult;
}

/// In-memory runtime: a variable map plus a log of performed actions.
/// `fail` consequences report failure; everything else succeeds.
#[derive(Debug, Default, Clone)]
pub struct Environment {
    variables: HashMap<String, Value>,
    executed: Vec<(String, ConsequenceKind)>,
}

impl Environment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_variable(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.variables.insert(name.to_string(), value.into());
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.variables.insert(name.to_string(), value.into());
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// Actions performed so far, in order.
    pub fn executed(&self) -> &[(String, ConsequenceKind)] {
        &self.executed
    }
}

impl Runtime for Environment {
    fn get_variable(&self, name: &str) -> Value {
        self.variables.get(name).cloned().unwrap_or(Value::Null)
    }

    fn set_variable(&mut self, name: &str, value: Value) -> Option<Value> {
        self.variables.insert(name.to_string(), value)
    }

    fn execute_consequence(&mut self, action: &str, kind: ConsequenceKind) -> ConsequenceResult {
        self.executed.push((action.to_string(), kind));
        match kind {
            ConsequenceKind::Fail => ConsequenceResult::failed(format!("'{}' failed", action)),
            _ => ConsequenceResult::ok(Value::String(action.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_variables() {
        let mut env = Environment::new().with_variable("x", 10.0);
        assert_eq!(env.get_variable("x"), Value::Number(10.0));
        assert_eq!(env.get_variable("missing"), Value::Null);
        let previous = env.set_variable("x", Value::Bool(true));
        assert_eq!(previous, Some(Value::Number(10.0)));
    }

    #[test]
    fn test_environment_records_actions() {
        let mut env = Environment::new();
        assert!(env.execute_consequence("win", ConsequenceKind::Win).success);
        assert!(!env.execute_consequence("fail", ConsequenceKind::Fail).success);
        assert_eq!(env.executed().len(), 2);
        assert_eq!(env.executed()[0], ("win".to_string(), ConsequenceKind::Win));
    }
}
