//! Evaluator — walks a decision tree against a [`Runtime`].
//!
//! Dispatch is a `match` over [`NodeKind`] handing each kind to its own
//! helper, so a recursion level costs only that kind's frame. Every evaluated node is
//! bracketed by tracer enter/exit events, so the trace mirrors the exact
//! set of nodes that ran: a short-circuited operand never shows up.
//!
//! Errors come in two flavours. Type mismatches, arithmetic faults and
//! unknown rules become [`Value::Error`] and flow through the tree like any
//! other value. Exceeding the depth ceiling and re-entering an active rule
//! are terminal: they unwind the whole evaluation as [`Error`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::ast::{
    ArithOperator, ChainType, CompareOperator, Consequence, ConsequenceKind, LogicOperator, Node,
    NodeKind, Rule,
};
use crate::errors::{Error, ErrorKind, Result};
use crate::explain::{explain_generate, ExplainMode};
use crate::runtime::Runtime;
use crate::tracer::{Branch, TraceConfig, Tracer};
use crate::value::{ConsequenceOutcome, EvalError, Value};

pub const EVAL_MAX_RECURSION_DEPTH: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    pub max_recursion_depth: usize,
    /// Stop chains at a falsy first operand, whatever the chain type.
    pub golf_mode: bool,
    /// Record a trace. Forced on when `explain` is set.
    pub trace: bool,
    pub trace_max_entries: Option<usize>,
    pub explain: Option<ExplainMode>,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            max_recursion_depth: EVAL_MAX_RECURSION_DEPTH,
            golf_mode: false,
            trace: true,
            trace_max_entries: None,
            explain: None,
        }
    }
}

impl EvalConfig {
    pub fn golf() -> Self {
        Self {
            golf_mode: true,
            ..Self::default()
        }
    }

    fn trace_config(&self) -> TraceConfig {
        TraceConfig {
            golf_mode: self.golf_mode,
            max_entries: self.trace_max_entries,
        }
    }
}

/// Per-run counters, reset by every [`Evaluator::eval_tree`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EvalStats {
    pub nodes_evaluated: u64,
    pub decisions: u64,
    pub consequences: u64,
    pub rule_activations: u64,
    pub max_depth: usize,
}

type RuleTable<'a> = HashMap<&'a str, &'a Node>;

pub struct Evaluator {
    config: EvalConfig,
    tracer: Tracer,
    stats: EvalStats,
    depth: usize,
    rule_stack: Vec<String>,
    errors: Vec<EvalError>,
    explanation: Option<String>,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl Evaluator {
    pub fn new() -> Self {
        Self::with_config(EvalConfig::default())
    }

    pub fn with_config(config: EvalConfig) -> Self {
        let tracer = Tracer::with_config(config.trace_config());
        Self {
            config,
            tracer,
            stats: EvalStats::default(),
            depth: 0,
            rule_stack: Vec::new(),
            errors: Vec::new(),
            explanation: None,
        }
    }

    pub fn config(&self) -> &EvalConfig {
        &self.config
    }

    pub fn set_explain(&mut self, mode: Option<ExplainMode>) {
        self.config.explain = mode;
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    /// Mutable access for cursor iteration over the last run's trace.
    pub fn tracer_mut(&mut self) -> &mut Tracer {
        &mut self.tracer
    }

    pub fn stats(&self) -> EvalStats {
        self.stats
    }

    pub fn had_error(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn errors(&self) -> &[EvalError] {
        &self.errors
    }

    /// Text produced by the explainer for the last run, if enabled.
    pub fn explanation(&self) -> Option<&str> {
        self.explanation.as_deref()
    }

    fn tracing_enabled(&self) -> bool {
        self.config.trace || self.config.explain.is_some()
    }

    fn trace(&mut self, record: impl FnOnce(&mut Tracer)) {
        if self.tracing_enabled() {
            record(&mut self.tracer);
        }
    }

    // ── Entry point ──────────────────────────────────────────────────

    /// Evaluate `root`. Counters, flags and the trace are reset first; the
    /// explanation, if configured, is generated from this run's trace.
    #[instrument(skip_all, name = "eval_tree")]
    pub fn eval_tree(&mut self, root: &Node, runtime: &mut dyn Runtime) -> Value {
        self.stats = EvalStats::default();
        self.depth = 0;
        self.rule_stack.clear();
        self.errors.clear();
        self.explanation = None;
        self.tracer.reset();
        root.reset_runtime_state();

        self.trace(|t| t.section("evaluation"));
        let rules = root.rule_table();

        let value = match self.eval_node(root, runtime, &rules) {
            Ok(value) => value,
            Err(err) => {
                warn!(%err, "evaluation aborted");
                let err = EvalError::from(&err);
                self.errors.push(err.clone());
                Value::Error(err)
            }
        };

        if let Some(mode) = self.config.explain.clone() {
            match explain_generate(root, &self.tracer, &mode) {
                Ok(text) => self.explanation = Some(text),
                Err(err) => warn!(%err, "explanation failed"),
            }
        }

        debug!(
            nodes = self.stats.nodes_evaluated,
            trace_entries = self.tracer.len(),
            had_error = self.had_error(),
            "evaluation finished"
        );
        value
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    fn eval_node(&mut self, node: &Node, rt: &mut dyn Runtime, rules: &RuleTable<'_>) -> Result<Value> {
        let limit = self.config.max_recursion_depth;
        if self.depth >= limit {
            return Err(self.recursion_limit(node, limit));
        }

        self.depth += 1;
        self.stats.nodes_evaluated += 1;
        self.stats.max_depth = self.stats.max_depth.max(self.depth);
        self.trace(|t| t.enter_node(node));

        let result = self.dispatch(node, rt, rules);

        self.depth -= 1;
        match &result {
            Ok(value) => self.trace(|t| t.exit_node(node, value)),
            Err(err) => self.trace_failed_exit(node, err),
        }
        result
    }

    /// One small helper per node kind keeps the frame of each recursion
    /// level to what that kind needs.
    fn dispatch(&mut self, node: &Node, rt: &mut dyn Runtime, rules: &RuleTable<'_>) -> Result<Value> {
        match &node.kind {
            NodeKind::Decision {
                condition,
                true_branch,
                false_branch,
            } => self.eval_decision(
                node,
                [condition.as_deref(), true_branch.as_deref(), false_branch.as_deref()],
                rt,
                rules,
            ),
            NodeKind::Consequence(consequence) if consequence.kind == ConsequenceKind::Assign => {
                self.assign(node, &consequence.action, rt, rules)
            }
            NodeKind::Consequence(consequence) => Ok(self.eval_consequence(node, consequence, rt)),
            NodeKind::Rule(rule) => self.eval_rule(node, rule, rt, rules),
            NodeKind::LogicOp { op, left, right } => {
                self.eval_logic(node, *op, left.as_deref(), right.as_deref(), rt, rules)
            }
            NodeKind::Comparison { op, left, right } => {
                self.eval_comparison(node, *op, left.as_deref(), right.as_deref(), rt, rules)
            }
            NodeKind::Identifier(name) => Ok(rt.get_variable(name)),
            NodeKind::Literal(literal) => Ok(literal.to_value()),
            NodeKind::Chain {
                chain_type,
                first,
                second,
            } => self.eval_chain(node, *chain_type, first.as_deref(), second.as_deref(), rt, rules),
            NodeKind::Arithmetic { op, left, right } => {
                self.eval_arithmetic(node, *op, left.as_deref(), right.as_deref(), rt, rules)
            }
            NodeKind::Block => self.eval_block(node, rt, rules),
            NodeKind::RuleCall(name) => match rules.get(name.as_str()) {
                Some(rule) => self.eval_node(rule, rt, rules),
                None => Ok(self.fail(node, ErrorKind::InvalidState, format!("unknown rule '{}'", name))),
            },
            NodeKind::Extension { tag } => Ok(self.fail(
                node,
                ErrorKind::Unsupported,
                format!("extension node '{}' cannot be evaluated", tag),
            )),
        }
    }

    fn eval_decision(
        &mut self,
        node: &Node,
        [condition, true_branch, false_branch]: [Option<&Node>; 3],
        rt: &mut dyn Runtime,
        rules: &RuleTable<'_>,
    ) -> Result<Value> {
        let Some(condition) = condition else {
            return Ok(self.fail(node, ErrorKind::InvalidState, "decision without condition"));
        };
        let value = self.eval_node(condition, rt, rules)?;
        let taken = value.is_truthy();
        self.stats.decisions += 1;
        self.trace(|t| {
            t.condition(condition, &value);
            t.decision(node, Branch::from_bool(taken));
        });
        match if taken { true_branch } else { false_branch } {
            Some(branch) => self.eval_node(branch, rt, rules),
            None => Ok(Value::Bool(taken)),
        }
    }

    fn eval_consequence(&mut self, node: &Node, consequence: &Consequence, rt: &mut dyn Runtime) -> Value {
        let result = rt.execute_consequence(&consequence.action, consequence.kind);
        consequence.executed.set(true);
        self.stats.consequences += 1;
        let outcome = ConsequenceOutcome {
            action: consequence.action.clone(),
            kind: consequence.kind,
            success: result.success,
            value: result.value,
            message: result.message,
        };
        if !result.handled {
            debug!(action = %consequence.action, "no runtime handler, treated as success");
        }
        self.trace(|t| t.consequence(node, &outcome));
        Value::consequence(outcome)
    }

    fn eval_rule(&mut self, node: &Node, rule: &Rule, rt: &mut dyn Runtime, rules: &RuleTable<'_>) -> Result<Value> {
        if !rule.is_active {
            self.trace(|t| t.message(Some(node), format!("rule {} is inactive", rule.name)));
            return Ok(Value::Bool(false));
        }
        if self.rule_stack.iter().any(|active| *active == rule.name) {
            return Err(self.rule_recursion(node, &rule.name));
        }

        let count = rule.execution_count.get() + 1;
        rule.execution_count.set(count);
        self.stats.rule_activations += 1;
        self.trace(|t| t.rule_execution(node, &rule.name, count));

        self.rule_stack.push(rule.name.clone());
        let result = match rule.body.as_deref() {
            Some(body) => self.eval_node(body, rt, rules),
            None => Ok(Value::Void),
        };
        self.rule_stack.pop();
        result
    }

    fn eval_logic(
        &mut self,
        node: &Node,
        op: LogicOperator,
        left: Option<&Node>,
        right: Option<&Node>,
        rt: &mut dyn Runtime,
        rules: &RuleTable<'_>,
    ) -> Result<Value> {
        let Some(left) = left else {
            return Ok(self.fail(node, ErrorKind::InvalidState, "logic operator without operand"));
        };
        let lhs = self.eval_node(left, rt, rules)?;
        if lhs.is_error() {
            return Ok(lhs);
        }
        let decided = match op {
            LogicOperator::Not => return Ok(Value::Bool(!lhs.is_truthy())),
            LogicOperator::And => !lhs.is_truthy(),
            LogicOperator::Or => lhs.is_truthy(),
        };
        if decided {
            return Ok(Value::Bool(lhs.is_truthy()));
        }
        let Some(right) = right else {
            return Ok(self.fail(node, ErrorKind::InvalidState, "logic operator without right operand"));
        };
        let rhs = self.eval_node(right, rt, rules)?;
        if rhs.is_error() {
            return Ok(rhs);
        }
        Ok(Value::Bool(rhs.is_truthy()))
    }

    fn eval_comparison(
        &mut self,
        node: &Node,
        op: CompareOperator,
        left: Option<&Node>,
        right: Option<&Node>,
        rt: &mut dyn Runtime,
        rules: &RuleTable<'_>,
    ) -> Result<Value> {
        let (Some(left), Some(right)) = (left, right) else {
            return Ok(self.fail(node, ErrorKind::InvalidState, "comparison without operands"));
        };
        let lhs = self.eval_node(left, rt, rules)?;
        if lhs.is_error() {
            return Ok(lhs);
        }
        let rhs = self.eval_node(right, rt, rules)?;
        if rhs.is_error() {
            return Ok(rhs);
        }
        match compare(op, &lhs, &rhs) {
            Some(result) => Ok(Value::Bool(result)),
            None => {
                let message = format!(
                    "cannot apply '{}' to {} and {}",
                    op.symbol(),
                    lhs.type_name(),
                    rhs.type_name()
                );
                Ok(self.fail(node, ErrorKind::Type, message))
            }
        }
    }

    fn eval_chain(
        &mut self,
        node: &Node,
        chain_type: ChainType,
        first: Option<&Node>,
        second: Option<&Node>,
        rt: &mut dyn Runtime,
        rules: &RuleTable<'_>,
    ) -> Result<Value> {
        let (Some(first), Some(second)) = (first, second) else {
            return Ok(self.fail(node, ErrorKind::InvalidState, "chain without operands"));
        };
        let head = self.eval_node(first, rt, rules)?;
        if head.is_error() {
            return Ok(head);
        }
        // Golf chains stop at a falsy head even when parallel.
        if self.config.golf_mode && !head.is_truthy() {
            self.trace(|t| t.message(Some(node), "golf chain stopped at falsy first operand"));
            return Ok(Value::Bool(false));
        }
        let tail = self.eval_node(second, rt, rules)?;
        if tail.is_error() {
            return Ok(tail);
        }
        Ok(match chain_type {
            ChainType::Sequential if head.is_truthy() && tail.is_truthy() => tail,
            ChainType::Parallel if head.is_truthy() => head,
            ChainType::Parallel if tail.is_truthy() => tail,
            _ => Value::Bool(false),
        })
    }

    fn eval_arithmetic(
        &mut self,
        node: &Node,
        op: ArithOperator,
        left: Option<&Node>,
        right: Option<&Node>,
        rt: &mut dyn Runtime,
        rules: &RuleTable<'_>,
    ) -> Result<Value> {
        let Some(left) = left else {
            return Ok(self.fail(node, ErrorKind::InvalidState, "arithmetic without operand"));
        };
        let lhs = self.eval_node(left, rt, rules)?;
        if lhs.is_error() {
            return Ok(lhs);
        }
        let rhs = match (op, right) {
            (ArithOperator::Neg, _) => None,
            (_, Some(right)) => {
                let rhs = self.eval_node(right, rt, rules)?;
                if rhs.is_error() {
                    return Ok(rhs);
                }
                Some(rhs)
            }
            (_, None) => {
                return Ok(self.fail(node, ErrorKind::InvalidState, "binary arithmetic without right operand"));
            }
        };
        match arithmetic(op, &lhs, rhs.as_ref()) {
            Ok(value) => Ok(value),
            Err(err) => Ok(self.fail(node, err.kind, err.message)),
        }
    }

    fn eval_block(&mut self, node: &Node, rt: &mut dyn Runtime, rules: &RuleTable<'_>) -> Result<Value> {
        let mut last = Value::Void;
        for statement in &node.children {
            let value = self.eval_node(statement, rt, rules)?;
            let settled = value.is_error()
                || value
                    .as_consequence()
                    .is_some_and(|outcome| outcome.kind != ConsequenceKind::Assign);
            if settled {
                return Ok(value);
            }
            last = value;
        }
        Ok(last)
    }

    fn recursion_limit(&mut self, node: &Node, limit: usize) -> Error {
        let err = Error::Recursion {
            phase: "evaluator",
            limit,
        };
        let traced = EvalError::from(&err);
        self.trace(|t| t.error(Some(node), &traced));
        err
    }

    fn rule_recursion(&mut self, node: &Node, name: &str) -> Error {
        let err = Error::RuleRecursion { name: name.to_string() };
        let traced = EvalError::from(&err);
        self.trace(|t| t.error(Some(node), &traced));
        err
    }

    fn trace_failed_exit(&mut self, node: &Node, err: &Error) {
        let value = Value::Error(EvalError::from(err));
        self.trace(|t| t.exit_node(node, &value));
    }

    /// `name = expr`: store through the runtime and record the change.
    fn assign(&mut self, node: &Node, name: &str, rt: &mut dyn Runtime, rules: &RuleTable<'_>) -> Result<Value> {
        let Some(expr) = node.children.first() else {
            return Ok(self.fail(node, ErrorKind::InvalidState, "assignment without value"));
        };
        let value = self.eval_node(expr, rt, rules)?;
        if value.is_error() {
            return Ok(value);
        }
        let previous = rt.set_variable(name, value.clone());
        if let Some(consequence) = node.as_consequence() {
            consequence.executed.set(true);
        }
        self.trace(|t| t.variable_change(node, name, previous.as_ref(), &value));
        Ok(Value::consequence(ConsequenceOutcome {
            action: name.to_string(),
            kind: ConsequenceKind::Assign,
            success: true,
            value,
            message: None,
        }))
    }

    /// Build an error value, record it and trace it at `node`.
    fn fail(&mut self, node: &Node, kind: ErrorKind, message: impl Into<String>) -> Value {
        let error = EvalError::new(kind, message);
        debug!(%error, node = %node.id, "evaluation error value");
        self.trace(|t| t.error(Some(node), &error));
        self.errors.push(error.clone());
        Value::Error(error)
    }
}

/// `None` when the operands are not in one comparable family.
pub(crate) fn compare(op: CompareOperator, lhs: &Value, rhs: &Value) -> Option<bool> {
    let ordering = match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) if op.is_equality() => Some(a.cmp(b)),
        _ => return None,
    };
    // NaN compares unequal to everything.
    let Some(ordering) = ordering else {
        return Some(op == CompareOperator::Ne);
    };
    Some(match op {
        CompareOperator::Eq => ordering.is_eq(),
        CompareOperator::Ne => ordering.is_ne(),
        CompareOperator::Lt => ordering.is_lt(),
        CompareOperator::Le => ordering.is_le(),
        CompareOperator::Gt => ordering.is_gt(),
        CompareOperator::Ge => ordering.is_ge(),
    })
}

pub(crate) fn arithmetic(op: ArithOperator, lhs: &Value, rhs: Option<&Value>) -> std::result::Result<Value, EvalError> {
    let type_error = |rhs: Option<&Value>| {
        let message = match rhs {
            Some(rhs) => format!(
                "cannot apply '{}' to {} and {}",
                op.symbol(),
                lhs.type_name(),
                rhs.type_name()
            ),
            None => format!("cannot negate {}", lhs.type_name()),
        };
        EvalError::new(ErrorKind::Type, message)
    };

    match (op, lhs, rhs) {
        (ArithOperator::Neg, Value::Number(n), _) => Ok(Value::Number(-n)),
        (ArithOperator::Neg, _, _) => Err(type_error(None)),
        (ArithOperator::Add, Value::String(a), Some(Value::String(b))) => {
            Ok(Value::String(format!("{}{}", a, b)))
        }
        (_, Value::Number(a), Some(Value::Number(b))) => {
            let (a, b) = (*a, *b);
            match op {
                ArithOperator::Add => Ok(Value::Number(a + b)),
                ArithOperator::Sub => Ok(Value::Number(a - b)),
                ArithOperator::Mul => Ok(Value::Number(a * b)),
                ArithOperator::Div | ArithOperator::Mod if b == 0.0 => Err(EvalError::new(
                    ErrorKind::Arithmetic,
                    format!("'{}' by zero", op.symbol()),
                )),
                ArithOperator::Div => Ok(Value::Number(a / b)),
                ArithOperator::Mod => Ok(Value::Number(a % b)),
                ArithOperator::Neg => Ok(Value::Number(-a)),
            }
        }
        _ => Err(type_error(rhs)),
    }
}
