//! Abstract Syntax Tree — Owned decision-rule trees.
//!
//! Every node owns its children exclusively (`Box` operands plus a generic
//! child list for extension points). The `parent` field is a non-owning back
//! reference by [`NodeId`]; it is used for diagnostics and validation only,
//! never for traversal.
//!
//! The structural operations (traverse, clone, compare, validate, print) live
//! here, one `match` per operation over [`NodeKind`]. Adding a variant is a
//! compile error until each of them handles it. Clone, compare and drop
//! walk an explicit stack, so a tree built by hand deeper than
//! [`AST_MAX_DEPTH`] is still safe to copy and free; printing stops
//! descending at that depth.
//!
//! Counters written by the evaluator (`executed`, `execution_count`) use
//! `Cell` so a tree can be evaluated through a shared reference while rules
//! are looked up by name elsewhere in the same tree.

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::errors::{Error, Result};
use crate::token::Span;
use crate::value::Value;

/// Deepest tree any structural algorithm accepts.
pub const AST_MAX_DEPTH: usize = 1024;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique node identity. Trace entries refer to nodes by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    fn fresh() -> Self {
        NodeId(NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ── Nodes ────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    pub span: Span,
    /// 1-based source line, 0 for synthesized nodes.
    pub line: usize,
    pub parent: Option<NodeId>,
    /// Generic children. `Block` keeps its statements here and assignment
    /// consequences keep their value expression here.
    pub children: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// `if condition then true_branch else false_branch end`
    Decision {
        condition: Option<Box<Node>>,
        true_branch: Option<Box<Node>>,
        false_branch: Option<Box<Node>>,
    },

    /// A leaf action: `win`, `"notify"`, `score = 10`
    Consequence(Consequence),

    /// `rule name { body }`
    Rule(Rule),

    /// `a && b`, `a || b`, `!a`
    LogicOp {
        op: LogicOperator,
        left: Option<Box<Node>>,
        right: Option<Box<Node>>,
    },

    /// `a < b`, `a == b`, ...
    Comparison {
        op: CompareOperator,
        left: Option<Box<Node>>,
        right: Option<Box<Node>>,
    },

    /// Variable reference resolved through the runtime.
    Identifier(String),

    Literal(Literal),

    /// `first >> second` (sequential) or `first -> second` (parallel)
    Chain {
        chain_type: ChainType,
        first: Option<Box<Node>>,
        second: Option<Box<Node>>,
    },

    /// `a + b`, `-a`
    Arithmetic {
        op: ArithOperator,
        left: Option<Box<Node>>,
        right: Option<Box<Node>>,
    },

    /// Statement sequence; statements are the generic children.
    Block,

    /// `name()`: run another rule of the same tree.
    RuleCall(String),

    /// Opaque extension point. The evaluator rejects it as unsupported.
    Extension { tag: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsequenceKind {
    Win,
    Lose,
    Draw,
    Skip,
    Fail,
    Pass,
    Custom,
    Assign,
}

impl fmt::Display for ConsequenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsequenceKind::Win => "win",
            ConsequenceKind::Lose => "lose",
            ConsequenceKind::Draw => "draw",
            ConsequenceKind::Skip => "skip",
            ConsequenceKind::Fail => "fail",
            ConsequenceKind::Pass => "pass",
            ConsequenceKind::Custom => "custom",
            ConsequenceKind::Assign => "assign",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct Consequence {
    pub action: String,
    pub kind: ConsequenceKind,
    pub weight: f64,
    /// Set by the evaluator when the consequence runs.
    pub executed: Cell<bool>,
}

impl PartialEq for Consequence {
    fn eq(&self, other: &Self) -> bool {
        self.action == other.action && self.kind == other.kind && self.weight == other.weight
    }
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub body: Option<Box<Node>>,
    pub is_active: bool,
    /// Incremented by the evaluator on every activation.
    pub execution_count: Cell<u64>,
}

impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.is_active == other.is_active && self.body == other.body
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicOperator {
    And,
    Or,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOperator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithOperator {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Neg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainType {
    Sequential,
    Parallel,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

impl Literal {
    pub fn to_value(&self) -> Value {
        match self {
            Literal::Null => Value::Null,
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Number(n) => Value::Number(*n),
            Literal::String(s) => Value::String(s.clone()),
        }
    }
}

impl LogicOperator {
    pub fn symbol(self) -> &'static str {
        match self {
            LogicOperator::And => "&&",
            LogicOperator::Or => "||",
            LogicOperator::Not => "!",
        }
    }
}

impl CompareOperator {
    pub fn symbol(self) -> &'static str {
        match self {
            CompareOperator::Eq => "==",
            CompareOperator::Ne => "!=",
            CompareOperator::Lt => "<",
            CompareOperator::Le => "<=",
            CompareOperator::Gt => ">",
            CompareOperator::Ge => ">=",
        }
    }

    pub fn is_equality(self) -> bool {
        matches!(self, CompareOperator::Eq | CompareOperator::Ne)
    }
}

impl ArithOperator {
    pub fn symbol(self) -> &'static str {
        match self {
            ArithOperator::Add => "+",
            ArithOperator::Sub | ArithOperator::Neg => "-",
            ArithOperator::Mul => "*",
            ArithOperator::Div => "/",
            ArithOperator::Mod => "%",
        }
    }
}

impl ChainType {
    pub fn symbol(self) -> &'static str {
        match self {
            ChainType::Sequential => ">>",
            ChainType::Parallel => "->",
        }
    }
}

/// Returned by preorder visitors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Continue,
    /// Do not descend into this node's children.
    SkipChildren,
    Stop,
}

// ── Factories ────────────────────────────────────────────────────────

fn boxed(node: Node) -> Option<Box<Node>> {
    Some(Box::new(node))
}

impl Node {
    pub fn new(kind: NodeKind) -> Self {
        let mut node = Self {
            id: NodeId::fresh(),
            kind,
            span: Span::default(),
            line: 0,
            parent: None,
            children: Vec::new(),
        };
        node.adopt();
        node
    }

    pub fn decision(condition: Node, true_branch: Option<Node>, false_branch: Option<Node>) -> Self {
        Self::new(NodeKind::Decision {
            condition: boxed(condition),
            true_branch: true_branch.map(Box::new),
            false_branch: false_branch.map(Box::new),
        })
    }

    pub fn consequence(action: impl Into<String>, kind: ConsequenceKind) -> Self {
        Self::new(NodeKind::Consequence(Consequence {
            action: action.into(),
            kind,
            weight: 1.0,
            executed: Cell::new(false),
        }))
    }

    /// `name = value`, stored as an assignment consequence.
    pub fn assignment(name: impl Into<String>, value: Node) -> Self {
        let mut node = Self::consequence(name, ConsequenceKind::Assign);
        node.add_child(value);
        node
    }

    pub fn rule(name: impl Into<String>, body: Node) -> Self {
        Self::new(NodeKind::Rule(Rule {
            name: name.into(),
            body: boxed(body),
            is_active: true,
            execution_count: Cell::new(0),
        }))
    }

    pub fn logic(op: LogicOperator, left: Node, right: Node) -> Self {
        Self::new(NodeKind::LogicOp {
            op,
            left: boxed(left),
            right: boxed(right),
        })
    }

    pub fn not(operand: Node) -> Self {
        Self::new(NodeKind::LogicOp {
            op: LogicOperator::Not,
            left: boxed(operand),
            right: None,
        })
    }

    pub fn comparison(op: CompareOperator, left: Node, right: Node) -> Self {
        Self::new(NodeKind::Comparison {
            op,
            left: boxed(left),
            right: boxed(right),
        })
    }

    pub fn identifier(name: impl Into<String>) -> Self {
        Self::new(NodeKind::Identifier(name.into()))
    }

    pub fn literal(literal: Literal) -> Self {
        Self::new(NodeKind::Literal(literal))
    }

    pub fn number(n: f64) -> Self {
        Self::literal(Literal::Number(n))
    }

    pub fn boolean(b: bool) -> Self {
        Self::literal(Literal::Bool(b))
    }

    pub fn chain(chain_type: ChainType, first: Node, second: Node) -> Self {
        Self::new(NodeKind::Chain {
            chain_type,
            first: boxed(first),
            second: boxed(second),
        })
    }

    pub fn arithmetic(op: ArithOperator, left: Node, right: Option<Node>) -> Self {
        Self::new(NodeKind::Arithmetic {
            op,
            left: boxed(left),
            right: right.map(Box::new),
        })
    }

    pub fn block(statements: Vec<Node>) -> Self {
        let mut node = Self::new(NodeKind::Block);
        for statement in statements {
            node.add_child(statement);
        }
        node
    }

    pub fn rule_call(name: impl Into<String>) -> Self {
        Self::new(NodeKind::RuleCall(name.into()))
    }

    pub fn with_span(mut self, span: Span, line: usize) -> Self {
        self.span = span;
        self.line = line;
        self
    }

    /// Append a generic child, pointing its parent link at `self`.
    pub fn add_child(&mut self, mut child: Node) {
        child.parent = Some(self.id);
        self.children.push(child);
    }

    /// Point every direct child's parent link at this node.
    fn adopt(&mut self) {
        let id = self.id;
        for child in self.kind.operands_mut().into_iter().flatten() {
            child.parent = Some(id);
        }
        for child in &mut self.children {
            child.parent = Some(id);
        }
    }
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Decision { .. } => "Decision",
            NodeKind::Consequence(_) => "Consequence",
            NodeKind::Rule(_) => "Rule",
            NodeKind::LogicOp { .. } => "LogicOp",
            NodeKind::Comparison { .. } => "Comparison",
            NodeKind::Identifier(_) => "Identifier",
            NodeKind::Literal(_) => "Literal",
            NodeKind::Chain { .. } => "Chain",
            NodeKind::Arithmetic { .. } => "Arithmetic",
            NodeKind::Block => "Block",
            NodeKind::RuleCall(_) => "RuleCall",
            NodeKind::Extension { .. } => "Extension",
        }
    }

    /// Structural operands in evaluation order: condition before branches,
    /// left before right, first before second.
    pub fn operands(&self) -> [Option<&Node>; 3] {
        match self {
            NodeKind::Decision {
                condition,
                true_branch,
                false_branch,
            } => [
                condition.as_deref(),
                true_branch.as_deref(),
                false_branch.as_deref(),
            ],
            NodeKind::Rule(rule) => [rule.body.as_deref(), None, None],
            NodeKind::LogicOp { left, right, .. }
            | NodeKind::Comparison { left, right, .. }
            | NodeKind::Arithmetic { left, right, .. } => [left.as_deref(), right.as_deref(), None],
            NodeKind::Chain { first, second, .. } => [first.as_deref(), second.as_deref(), None],
            NodeKind::Consequence(_)
            | NodeKind::Identifier(_)
            | NodeKind::Literal(_)
            | NodeKind::Block
            | NodeKind::RuleCall(_)
            | NodeKind::Extension { .. } => [None, None, None],
        }
    }

    pub fn operands_mut(&mut self) -> [Option<&mut Node>; 3] {
        match self {
            NodeKind::Decision {
                condition,
                true_branch,
                false_branch,
            } => [
                condition.as_deref_mut(),
                true_branch.as_deref_mut(),
                false_branch.as_deref_mut(),
            ],
            NodeKind::Rule(rule) => [rule.body.as_deref_mut(), None, None],
            NodeKind::LogicOp { left, right, .. }
            | NodeKind::Comparison { left, right, .. }
            | NodeKind::Arithmetic { left, right, .. } => {
                [left.as_deref_mut(), right.as_deref_mut(), None]
            }
            NodeKind::Chain { first, second, .. } => {
                [first.as_deref_mut(), second.as_deref_mut(), None]
            }
            NodeKind::Consequence(_)
            | NodeKind::Identifier(_)
            | NodeKind::Literal(_)
            | NodeKind::Block
            | NodeKind::RuleCall(_)
            | NodeKind::Extension { .. } => [None, None, None],
        }
    }
}

// ── Structural operations ────────────────────────────────────────────

impl Node {
    /// Structural children followed by generic children.
    pub fn child_nodes(&self) -> impl Iterator<Item = &Node> {
        self.kind
            .operands()
            .into_iter()
            .flatten()
            .chain(self.children.iter())
    }

    /// Preorder walk. The visitor receives each node with its depth (root
    /// is 1). Returns `false` if a visitor stopped the walk early.
    pub fn traverse_preorder<F>(&self, mut visit: F) -> bool
    where
        F: FnMut(&Node, usize) -> Visit,
    {
        let mut stack = vec![(self, 1usize)];
        while let Some((node, depth)) = stack.pop() {
            match visit(node, depth) {
                Visit::Stop => return false,
                Visit::SkipChildren => continue,
                Visit::Continue => {}
            }
            let children: Vec<&Node> = node.child_nodes().collect();
            for child in children.into_iter().rev() {
                stack.push((child, depth + 1));
            }
        }
        true
    }

    /// Postorder walk: every child is visited before its parent.
    pub fn traverse_postorder<F>(&self, mut visit: F)
    where
        F: FnMut(&Node, usize),
    {
        let mut stack = vec![(self, 1usize, false)];
        while let Some((node, depth, expanded)) = stack.pop() {
            if expanded {
                visit(node, depth);
                continue;
            }
            stack.push((node, depth, true));
            let children: Vec<&Node> = node.child_nodes().collect();
            for child in children.into_iter().rev() {
                stack.push((child, depth + 1, false));
            }
        }
    }

    pub fn count_nodes(&self) -> usize {
        let mut count = 0;
        self.traverse_preorder(|_, _| {
            count += 1;
            Visit::Continue
        });
        count
    }

    pub fn get_depth(&self) -> usize {
        let mut deepest = 0;
        self.traverse_preorder(|_, depth| {
            deepest = deepest.max(depth);
            Visit::Continue
        });
        deepest
    }

    /// Full deep copy with fresh node ids. Relative structure, spans and
    /// parent links are preserved; nothing is shared with `self`.
    pub fn clone_tree(&self) -> Node {
        // Postorder leaves each finished child copy on `built`, in order.
        let mut built: Vec<Node> = Vec::new();
        self.traverse_postorder(|node, _| {
            let arity = node.child_nodes().count();
            let mut parts = built.split_off(built.len() - arity).into_iter();
            let kind = node.kind.rebuild(&mut parts);
            let mut copy = Node {
                id: NodeId::fresh(),
                kind,
                span: node.span,
                line: node.line,
                parent: None,
                children: parts.collect(),
            };
            copy.adopt();
            built.push(copy);
        });
        built.pop().unwrap_or_else(|| Node::new(NodeKind::Block))
    }

    /// Structural equality: node kinds and payloads, recursively. Ids,
    /// parent links, spans and evaluator counters are ignored.
    pub fn equals(&self, other: &Node) -> bool {
        let mut pending = vec![(self, other)];
        while let Some((a, b)) = pending.pop() {
            if !a.kind.same_payload(&b.kind) || a.children.len() != b.children.len() {
                return false;
            }
            let (lhs, rhs) = (a.kind.operands(), b.kind.operands());
            for (l, r) in lhs.into_iter().zip(rhs) {
                match (l, r) {
                    (Some(l), Some(r)) => pending.push((l, r)),
                    (None, None) => {}
                    _ => return false,
                }
            }
            pending.extend(a.children.iter().zip(&b.children));
        }
        true
    }

    /// Check structural invariants: required fields present, depth within
    /// [`AST_MAX_DEPTH`], parent links pointing at the real owner.
    pub fn validate(&self) -> Result<()> {
        self.validate_at(1)
    }

    fn validate_at(&self, depth: usize) -> Result<()> {
        if depth > AST_MAX_DEPTH {
            return Err(Error::InvalidState(format!(
                "tree depth exceeds maximum of {}",
                AST_MAX_DEPTH
            )));
        }
        self.check_required_fields()?;

        for child in self.kind.operands().into_iter().flatten() {
            if child.parent.is_some_and(|parent| parent != self.id) {
                return Err(Error::InvalidState(format!(
                    "{} {} has a stale parent link",
                    child.kind.name(),
                    child.id
                )));
            }
        }
        for child in &self.children {
            if child.parent != Some(self.id) {
                return Err(Error::InvalidState(format!(
                    "child {} {} does not link back to its parent {}",
                    child.kind.name(),
                    child.id,
                    self.id
                )));
            }
        }

        for child in self.child_nodes() {
            child.validate_at(depth + 1)?;
        }
        Ok(())
    }

    fn check_required_fields(&self) -> Result<()> {
        let missing = |what: &str| -> Result<()> {
            Err(Error::InvalidState(format!(
                "{} {} is missing its {}",
                self.kind.name(),
                self.id,
                what
            )))
        };
        match &self.kind {
            NodeKind::Decision { condition, .. } => {
                if condition.is_none() {
                    return missing("condition");
                }
            }
            NodeKind::Consequence(consequence) => {
                if consequence.action.is_empty() {
                    return missing("action");
                }
                if !consequence.weight.is_finite() {
                    return Err(Error::InvalidState(format!(
                        "consequence {} has a non-finite weight",
                        self.id
                    )));
                }
                if consequence.kind == ConsequenceKind::Assign && self.children.len() != 1 {
                    return missing("assigned value");
                }
            }
            NodeKind::Rule(rule) => {
                if rule.name.is_empty() {
                    return missing("name");
                }
                if rule.body.is_none() {
                    return missing("body");
                }
            }
            NodeKind::LogicOp { op, left, right } => {
                if left.is_none() {
                    return missing("left operand");
                }
                match (op, right) {
                    (LogicOperator::Not, Some(_)) => {
                        return Err(Error::InvalidState(format!(
                            "unary NOT {} has a right operand",
                            self.id
                        )));
                    }
                    (LogicOperator::And | LogicOperator::Or, None) => {
                        return missing("right operand");
                    }
                    _ => {}
                }
            }
            NodeKind::Comparison { left, right, .. } => {
                if left.is_none() || right.is_none() {
                    return missing("operand");
                }
            }
            NodeKind::Arithmetic { op, left, right } => {
                if left.is_none() || (*op != ArithOperator::Neg && right.is_none()) {
                    return missing("operand");
                }
            }
            NodeKind::Chain { first, second, .. } => {
                if first.is_none() || second.is_none() {
                    return missing("operand");
                }
            }
            NodeKind::Identifier(name) | NodeKind::RuleCall(name) => {
                if name.is_empty() {
                    return missing("name");
                }
            }
            NodeKind::Literal(_) | NodeKind::Block | NodeKind::Extension { .. } => {}
        }
        Ok(())
    }

    /// First node in preorder matching `pred`.
    pub fn find<P>(&self, mut pred: P) -> Option<&Node>
    where
        P: FnMut(&Node) -> bool,
    {
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            if pred(node) {
                return Some(node);
            }
            let children: Vec<&Node> = node.child_nodes().collect();
            stack.extend(children.into_iter().rev());
        }
        None
    }

    pub fn find_by_id(&self, id: NodeId) -> Option<&Node> {
        self.find(|node| node.id == id)
    }

    /// First consequence whose action matches `action`.
    pub fn find_consequence(&self, action: &str) -> Option<&Node> {
        self.find(|node| matches!(&node.kind, NodeKind::Consequence(c) if c.action == action))
    }

    pub fn find_rule(&self, name: &str) -> Option<&Node> {
        self.find(|node| matches!(&node.kind, NodeKind::Rule(r) if r.name == name))
    }

    /// Rules keyed by name, in preorder. The first rule with a name wins.
    pub fn rule_table(&self) -> HashMap<&str, &Node> {
        let mut rules = HashMap::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            if let NodeKind::Rule(rule) = &node.kind {
                rules.entry(rule.name.as_str()).or_insert(node);
            }
            let children: Vec<&Node> = node.child_nodes().collect();
            stack.extend(children.into_iter().rev());
        }
        rules
    }

    pub fn as_rule(&self) -> Option<&Rule> {
        match &self.kind {
            NodeKind::Rule(rule) => Some(rule),
            _ => None,
        }
    }

    pub fn as_consequence(&self) -> Option<&Consequence> {
        match &self.kind {
            NodeKind::Consequence(consequence) => Some(consequence),
            _ => None,
        }
    }

    pub fn set_active(&mut self, active: bool) {
        if let NodeKind::Rule(rule) = &mut self.kind {
            rule.is_active = active;
        }
    }

    /// Clear evaluator-written flags and counters across the tree.
    pub fn reset_runtime_state(&self) {
        self.traverse_preorder(|node, _| {
            match &node.kind {
                NodeKind::Consequence(c) => c.executed.set(false),
                NodeKind::Rule(r) => r.execution_count.set(0),
                _ => {}
            }
            Visit::Continue
        });
    }

    /// Human-readable description used in explanations. Expressions are
    /// printed in full, decisions with their whole condition.
    pub fn label(&self) -> String {
        match &self.kind {
            NodeKind::Decision { condition, .. } => match condition {
                Some(cond) => format!("if {}", cond),
                None => "if <missing>".to_string(),
            },
            NodeKind::LogicOp { .. }
            | NodeKind::Comparison { .. }
            | NodeKind::Arithmetic { .. }
            | NodeKind::Chain { .. } => self.to_string(),
            _ => self.brief(),
        }
    }

    /// Constant-size description: the node itself, never its operands.
    pub fn brief(&self) -> String {
        match &self.kind {
            NodeKind::Decision { .. } => "if".to_string(),
            NodeKind::Consequence(c) if c.kind == ConsequenceKind::Assign => {
                format!("set {}", c.action)
            }
            NodeKind::Consequence(c) => format!("{} {}", c.kind, c.action),
            NodeKind::Rule(rule) => format!("rule {}", rule.name),
            NodeKind::LogicOp { op, .. } => op.symbol().to_string(),
            NodeKind::Comparison { op, .. } => op.symbol().to_string(),
            NodeKind::Arithmetic { op, .. } => op.symbol().to_string(),
            NodeKind::Chain { chain_type, .. } => chain_type.symbol().to_string(),
            NodeKind::Identifier(name) => name.clone(),
            NodeKind::Literal(_) => self.to_string(),
            NodeKind::Block => format!("block of {}", self.children.len()),
            NodeKind::RuleCall(name) => format!("call {}", name),
            NodeKind::Extension { tag } => format!("extension {}", tag),
        }
    }

    /// Indented tree dump, one node per line.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.traverse_preorder(|node, depth| {
            out.push_str(&"  ".repeat(depth - 1));
            out.push_str(node.kind.name());
            let detail = match &node.kind {
                NodeKind::Consequence(c) => format!("({}: {})", c.kind, c.action),
                NodeKind::Rule(r) => format!("({})", r.name),
                NodeKind::LogicOp { op, .. } => format!("({})", op.symbol()),
                NodeKind::Comparison { op, .. } => format!("({})", op.symbol()),
                NodeKind::Arithmetic { op, .. } => format!("({})", op.symbol()),
                NodeKind::Chain { chain_type, .. } => format!("({:?})", chain_type),
                NodeKind::Identifier(name) | NodeKind::RuleCall(name) => format!("({})", name),
                NodeKind::Literal(lit) => format!("({})", lit.to_value()),
                NodeKind::Extension { tag } => format!("({})", tag),
                NodeKind::Decision { .. } | NodeKind::Block => String::new(),
            };
            out.push_str(&detail);
            out.push('\n');
            Visit::Continue
        });
        out
    }
}

impl Clone for Node {
    fn clone(&self) -> Self {
        self.clone_tree()
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other)
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        // Detach descendants onto a heap stack so dropping never recurses.
        let mut pending = std::mem::take(&mut self.children);
        pending.extend(self.kind.take_operands().into_iter().flatten());
        while let Some(mut node) = pending.pop() {
            pending.append(&mut node.children);
            pending.extend(node.kind.take_operands().into_iter().flatten());
        }
    }
}

impl NodeKind {
    /// Equal variant and payload, operands not compared.
    fn same_payload(&self, other: &NodeKind) -> bool {
        match (self, other) {
            (NodeKind::Decision { .. }, NodeKind::Decision { .. })
            | (NodeKind::Block, NodeKind::Block) => true,
            (NodeKind::Consequence(a), NodeKind::Consequence(b)) => a == b,
            (NodeKind::Rule(a), NodeKind::Rule(b)) => {
                a.name == b.name && a.is_active == b.is_active
            }
            (NodeKind::LogicOp { op: a, .. }, NodeKind::LogicOp { op: b, .. }) => a == b,
            (NodeKind::Comparison { op: a, .. }, NodeKind::Comparison { op: b, .. }) => a == b,
            (NodeKind::Arithmetic { op: a, .. }, NodeKind::Arithmetic { op: b, .. }) => a == b,
            (NodeKind::Chain { chain_type: a, .. }, NodeKind::Chain { chain_type: b, .. }) => {
                a == b
            }
            (NodeKind::Identifier(a), NodeKind::Identifier(b))
            | (NodeKind::RuleCall(a), NodeKind::RuleCall(b)) => a == b,
            (NodeKind::Literal(a), NodeKind::Literal(b)) => a == b,
            (NodeKind::Extension { tag: a }, NodeKind::Extension { tag: b }) => a == b,
            _ => false,
        }
    }

    /// Copy of the payload with each present operand taken, in order, from
    /// `parts`.
    fn rebuild(&self, parts: &mut impl Iterator<Item = Node>) -> NodeKind {
        let mut take = |slot: &Option<Box<Node>>| {
            slot.as_ref().and_then(|_| parts.next()).map(Box::new)
        };
        match self {
            NodeKind::Decision {
                condition,
                true_branch,
                false_branch,
            } => NodeKind::Decision {
                condition: take(condition),
                true_branch: take(true_branch),
                false_branch: take(false_branch),
            },
            NodeKind::Rule(rule) => NodeKind::Rule(Rule {
                name: rule.name.clone(),
                body: take(&rule.body),
                is_active: rule.is_active,
                execution_count: rule.execution_count.clone(),
            }),
            NodeKind::LogicOp { op, left, right } => NodeKind::LogicOp {
                op: *op,
                left: take(left),
                right: take(right),
            },
            NodeKind::Comparison { op, left, right } => NodeKind::Comparison {
                op: *op,
                left: take(left),
                right: take(right),
            },
            NodeKind::Arithmetic { op, left, right } => NodeKind::Arithmetic {
                op: *op,
                left: take(left),
                right: take(right),
            },
            NodeKind::Chain {
                chain_type,
                first,
                second,
            } => NodeKind::Chain {
                chain_type: *chain_type,
                first: take(first),
                second: take(second),
            },
            NodeKind::Consequence(c) => NodeKind::Consequence(c.clone()),
            NodeKind::Identifier(name) => NodeKind::Identifier(name.clone()),
            NodeKind::Literal(literal) => NodeKind::Literal(literal.clone()),
            NodeKind::Block => NodeKind::Block,
            NodeKind::RuleCall(name) => NodeKind::RuleCall(name.clone()),
            NodeKind::Extension { tag } => NodeKind::Extension { tag: tag.clone() },
        }
    }

    fn take_operands(&mut self) -> [Option<Node>; 3] {
        let take = |slot: &mut Option<Box<Node>>| slot.take().map(|node| *node);
        match self {
            NodeKind::Decision {
                condition,
                true_branch,
                false_branch,
            } => [take(condition), take(true_branch), take(false_branch)],
            NodeKind::Rule(rule) => [take(&mut rule.body), None, None],
            NodeKind::LogicOp { left, right, .. }
            | NodeKind::Comparison { left, right, .. }
            | NodeKind::Arithmetic { left, right, .. } => [take(left), take(right), None],
            NodeKind::Chain { first, second, .. } => [take(first), take(second), None],
            NodeKind::Consequence(_)
            | NodeKind::Identifier(_)
            | NodeKind::Literal(_)
            | NodeKind::Block
            | NodeKind::RuleCall(_)
            | NodeKind::Extension { .. } => [None, None, None],
        }
    }
}

// ── Node index ───────────────────────────────────────────────────────

/// Read-only id lookup over a tree, with parent links derived from the
/// actual ownership structure rather than the stored back-links.
pub struct NodeIndex<'a> {
    nodes: HashMap<NodeId, &'a Node>,
    parents: HashMap<NodeId, NodeId>,
}

impl<'a> NodeIndex<'a> {
    pub fn build(root: &'a Node) -> Self {
        let mut nodes = HashMap::new();
        let mut parents = HashMap::new();
        let mut stack = vec![root];
        while let Some(node) = stack.pop() {
            nodes.insert(node.id, node);
            for child in node.child_nodes() {
                parents.insert(child.id, node.id);
                stack.push(child);
            }
        }
        Self { nodes, parents }
    }

    pub fn get(&self, id: NodeId) -> Option<&'a Node> {
        self.nodes.get(&id).copied()
    }

    pub fn parent_of(&self, id: NodeId) -> Option<&'a Node> {
        self.parents.get(&id).and_then(|parent| self.get(*parent))
    }

    /// Nodes from the root down to and including `id`.
    pub fn path_to(&self, id: NodeId) -> Option<Vec<&'a Node>> {
        let mut path = vec![self.get(id)?];
        let mut current = id;
        while let Some(parent) = self.parents.get(&current) {
            path.push(self.get(*parent)?);
            current = *parent;
        }
        path.reverse();
        Some(path)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

// ── Printing ─────────────────────────────────────────────────────────

const PREC_CHAIN: u8 = 2;
const PREC_TERNARY: u8 = 3;
const PREC_OR: u8 = 4;
const PREC_AND: u8 = 5;
const PREC_EQUALITY: u8 = 6;
const PREC_COMPARISON: u8 = 7;
const PREC_TERM: u8 = 8;
const PREC_FACTOR: u8 = 9;
const PREC_UNARY: u8 = 10;
const PREC_ATOM: u8 = 11;

impl Node {
    fn precedence(&self) -> u8 {
        match &self.kind {
            NodeKind::Chain { .. } => PREC_CHAIN,
            NodeKind::LogicOp { op, .. } => match op {
                LogicOperator::Or => PREC_OR,
                LogicOperator::And => PREC_AND,
                LogicOperator::Not => PREC_UNARY,
            },
            NodeKind::Comparison { op, .. } if op.is_equality() => PREC_EQUALITY,
            NodeKind::Comparison { .. } => PREC_COMPARISON,
            NodeKind::Arithmetic { op, .. } => match op {
                ArithOperator::Add | ArithOperator::Sub => PREC_TERM,
                ArithOperator::Mul | ArithOperator::Div | ArithOperator::Mod => PREC_FACTOR,
                ArithOperator::Neg => PREC_UNARY,
            },
            NodeKind::Consequence(c) if c.kind == ConsequenceKind::Assign => PREC_TERNARY,
            _ => PREC_ATOM,
        }
    }
}

/// Writes `node`, parenthesised when it binds looser than `min`.
fn write_operand(
    f: &mut fmt::Formatter<'_>,
    node: Option<&Node>,
    min: u8,
    budget: usize,
) -> fmt::Result {
    match node {
        Some(node) if node.precedence() < min => {
            write!(f, "(")?;
            node.render(f, budget)?;
            write!(f, ")")
        }
        Some(node) => node.render(f, budget),
        None => write!(f, "<missing>"),
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.render(f, AST_MAX_DEPTH)
    }
}

impl Node {
    /// Source-like rendering; subtrees below `budget` levels print as `...`.
    fn render(&self, f: &mut fmt::Formatter<'_>, budget: usize) -> fmt::Result {
        let Some(budget) = budget.checked_sub(1) else {
            return write!(f, "...");
        };
        let prec = self.precedence();
        match &self.kind {
            NodeKind::Decision {
                condition,
                true_branch,
                false_branch,
            } => {
                write!(f, "if ")?;
                write_operand(f, condition.as_deref(), 0, budget)?;
                if let Some(t) = true_branch {
                    write!(f, " then ")?;
                    t.render(f, budget)?;
                }
                if let Some(e) = false_branch {
                    write!(f, " else ")?;
                    e.render(f, budget)?;
                }
                write!(f, " end")
            }
            NodeKind::Consequence(c) => match c.kind {
                ConsequenceKind::Assign => {
                    write!(f, "{} = ", c.action)?;
                    write_operand(f, self.children.first(), PREC_TERNARY, budget)
                }
                ConsequenceKind::Custom => write!(f, "{:?}", c.action),
                _ if c.weight != 1.0 => write!(f, "{}({})", c.action, c.weight),
                _ => write!(f, "{}", c.action),
            },
            NodeKind::Rule(rule) => {
                write!(f, "rule {} {{ ", rule.name)?;
                match rule.body.as_deref() {
                    Some(body) if matches!(body.kind, NodeKind::Block) => {
                        for statement in &body.children {
                            statement.render(f, budget)?;
                            write!(f, " ")?;
                        }
                    }
                    Some(body) => {
                        body.render(f, budget)?;
                        write!(f, " ")?;
                    }
                    None => {}
                }
                write!(f, "}}")
            }
            NodeKind::LogicOp { op, left, right } => match op {
                LogicOperator::Not => {
                    write!(f, "!")?;
                    write_operand(f, left.as_deref(), PREC_UNARY, budget)
                }
                _ => {
                    write_operand(f, left.as_deref(), prec, budget)?;
                    write!(f, " {} ", op.symbol())?;
                    write_operand(f, right.as_deref(), prec + 1, budget)
                }
            },
            NodeKind::Comparison { op, left, right } => {
                write_operand(f, left.as_deref(), prec, budget)?;
                write!(f, " {} ", op.symbol())?;
                write_operand(f, right.as_deref(), prec + 1, budget)
            }
            NodeKind::Arithmetic { op, left, right } => match op {
                ArithOperator::Neg => {
                    write!(f, "-")?;
                    write_operand(f, left.as_deref(), PREC_UNARY, budget)
                }
                _ => {
                    write_operand(f, left.as_deref(), prec, budget)?;
                    write!(f, " {} ", op.symbol())?;
                    write_operand(f, right.as_deref(), prec + 1, budget)
                }
            },
            NodeKind::Chain {
                chain_type,
                first,
                second,
            } => {
                write_operand(f, first.as_deref(), prec, budget)?;
                write!(f, " {} ", chain_type.symbol())?;
                write_operand(f, second.as_deref(), prec + 1, budget)
            }
            NodeKind::Identifier(name) => write!(f, "{}", name),
            NodeKind::Literal(lit) => match lit {
                Literal::Null => write!(f, "null"),
                Literal::Bool(b) => write!(f, "{}", b),
                Literal::Number(n) => write!(f, "{}", n),
                Literal::String(s) => write!(f, "{:?}", s),
            },
            NodeKind::Block => {
                for (i, statement) in self.children.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    statement.render(f, budget)?;
                }
                Ok(())
            }
            NodeKind::RuleCall(name) => write!(f, "{}()", name),
            NodeKind::Extension { tag } => write!(f, "<{}>", tag),
        }
    }
}
