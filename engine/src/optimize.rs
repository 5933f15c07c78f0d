//! Constant folding over literal-only subexpressions.
//!
//! Folding rewrites nodes in place and keeps their ids, so traces of the
//! optimized tree still refer to nodes a caller may have looked up before.
//! Expressions that would produce an error value at runtime (division by
//! zero, cross-type comparison) are left alone for the evaluator to report.

use crate::ast::{Literal, LogicOperator, Node, NodeKind, AST_MAX_DEPTH};
use crate::errors::{Error, Result};
use crate::eval::{arithmetic, compare};
use crate::value::Value;

/// Fold every constant comparison, logic and arithmetic node under `root`.
/// Returns the number of nodes replaced by literals.
pub fn fold_constants(root: &mut Node) -> Result<usize> {
    if root.get_depth() > AST_MAX_DEPTH {
        return Err(Error::Recursion {
            phase: "optimizer",
            limit: AST_MAX_DEPTH,
        });
    }
    let folds = fold(root);
    if folds > 0 {
        tracing::debug!(folds, "folded constant expressions");
    }
    Ok(folds)
}

fn fold(node: &mut Node) -> usize {
    let mut folds = 0;
    for operand in node.kind.operands_mut().into_iter().flatten() {
        folds += fold(operand);
    }
    for child in &mut node.children {
        folds += fold(child);
    }

    if let Some(literal) = constant_value(node).and_then(into_literal) {
        node.kind = NodeKind::Literal(literal);
        folds += 1;
    }
    folds
}

fn literal_operand(node: Option<&Node>) -> Option<Value> {
    match &node?.kind {
        NodeKind::Literal(literal) => Some(literal.to_value()),
        _ => None,
    }
}

fn constant_value(node: &Node) -> Option<Value> {
    match &node.kind {
        NodeKind::Comparison { op, left, right } => {
            let lhs = literal_operand(left.as_deref())?;
            let rhs = literal_operand(right.as_deref())?;
            compare(*op, &lhs, &rhs).map(Value::Bool)
        }
        NodeKind::LogicOp { op, left, right } => {
            let lhs = literal_operand(left.as_deref())?;
            match op {
                LogicOperator::Not => Some(Value::Bool(!lhs.is_truthy())),
                LogicOperator::And if !lhs.is_truthy() => Some(Value::Bool(false)),
                LogicOperator::Or if lhs.is_truthy() => Some(Value::Bool(true)),
                _ => literal_operand(right.as_deref()).map(|rhs| Value::Bool(rhs.is_truthy())),
            }
        }
        NodeKind::Arithmetic { op, left, right } => {
            let lhs = literal_operand(left.as_deref())?;
            let rhs = match right.as_deref() {
                Some(right) => Some(literal_operand(Some(right))?),
                None => None,
            };
            arithmetic(*op, &lhs, rhs.as_ref()).ok()
        }
        _ => None,
    }
}

fn into_literal(value: Value) -> Option<Literal> {
    match value {
        Value::Null => Some(Literal::Null),
        Value::Bool(b) => Some(Literal::Bool(b)),
        Value::Number(n) => Some(Literal::Number(n)),
        Value::String(s) => Some(Literal::String(s)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;
    use pretty_assertions::assert_eq;

    fn folded(source: &str) -> (Node, usize) {
        let mut parser = Parser::new(source);
        let mut root = parser.parse();
        assert!(!parser.had_error());
        let folds = fold_constants(&mut root).unwrap();
        (root, folds)
    }

    #[test]
    fn test_folds_nested_arithmetic_and_comparison() {
        let (root, folds) = folded("1 + 2 * 3 > 6 && flag");
        assert_eq!(folds, 3);
        assert_eq!(root.to_string(), "true && flag");
    }

    #[test]
    fn test_folds_short_circuit_logic() {
        let (root, folds) = folded("false && flag");
        assert_eq!(folds, 1);
        assert_eq!(root.to_string(), "false");
    }

    #[test]
    fn test_leaves_runtime_errors_alone() {
        let (root, folds) = folded("1 / 0 > \"a\"");
        assert_eq!(folds, 0);
        assert_eq!(root.to_string(), "1 / 0 > \"a\"");
    }

    #[test]
    fn test_folding_keeps_ids_and_validity() {
        let (root, _) = folded("if 2 > 1 then score = 10 * 2 end");
        assert!(root.validate().is_ok());
        assert_eq!(root.to_string(), "if true then score = 20 end");
    }
}
