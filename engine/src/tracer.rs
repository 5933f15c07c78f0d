//! Execution tracer — a capped, append-only log of evaluation events.
//!
//! Entries are stamped relative to the tracer's start instant and keyed by
//! [`NodeId`]. When the cap is reached the oldest entry is evicted before the
//! newest is appended, so memory stays bounded for long evaluations.
//!
//! Each entry records the sequence number of the previous entry for the same
//! node, and the tracer keeps a `node → last entry` index. Explanations can
//! therefore walk backwards without rescanning the log from the start.
//!
//! Golf mode trades fidelity for footprint: no timestamps, no rendered
//! values, and a smaller cap.

use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::ast::{ConsequenceKind, Node, NodeId};
use crate::errors::ErrorKind;
use crate::value::{ConsequenceOutcome, EvalError, Value};

pub const TRACE_MAX_ENTRIES: usize = 10_000;
pub const TRACE_GOLF_MAX_ENTRIES: usize = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    pub golf_mode: bool,
    /// Overrides the mode's default cap.
    pub max_entries: Option<usize>,
}

impl TraceConfig {
    pub fn capacity(&self) -> usize {
        let default = if self.golf_mode {
            TRACE_GOLF_MAX_ENTRIES
        } else {
            TRACE_MAX_ENTRIES
        };
        self.max_entries.unwrap_or(default).max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceKind {
    Section,
    Enter,
    Exit,
    Condition,
    Decision,
    Consequence,
    RuleExecution,
    VariableChange,
    Error,
    Message,
}

impl TraceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TraceKind::Section => "section",
            TraceKind::Enter => "enter",
            TraceKind::Exit => "exit",
            TraceKind::Condition => "condition",
            TraceKind::Decision => "decision",
            TraceKind::Consequence => "consequence",
            TraceKind::RuleExecution => "rule_execution",
            TraceKind::VariableChange => "variable_change",
            TraceKind::Error => "error",
            TraceKind::Message => "message",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Branch {
    True,
    False,
}

impl Branch {
    pub fn from_bool(taken: bool) -> Self {
        if taken {
            Branch::True
        } else {
            Branch::False
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Branch::True => "THEN",
            Branch::False => "ELSE",
        }
    }

    pub fn other(self) -> Self {
        match self {
            Branch::True => Branch::False,
            Branch::False => Branch::True,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TraceEvent {
    Section(String),
    Enter,
    Exit,
    Condition { result: bool },
    Decision { branch: Branch },
    Consequence {
        action: String,
        kind: ConsequenceKind,
        success: bool,
    },
    RuleExecution { name: String, count: u64 },
    VariableChange { name: String },
    Error { kind: ErrorKind },
    Message,
}

impl TraceEvent {
    pub fn kind(&self) -> TraceKind {
        match self {
            TraceEvent::Section(_) => TraceKind::Section,
            TraceEvent::Enter => TraceKind::Enter,
            TraceEvent::Exit => TraceKind::Exit,
            TraceEvent::Condition { .. } => TraceKind::Condition,
            TraceEvent::Decision { .. } => TraceKind::Decision,
            TraceEvent::Consequence { .. } => TraceKind::Consequence,
            TraceEvent::RuleExecution { .. } => TraceKind::RuleExecution,
            TraceEvent::VariableChange { .. } => TraceKind::VariableChange,
            TraceEvent::Error { .. } => TraceKind::Error,
            TraceEvent::Message => TraceKind::Message,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraceEntry {
    /// Monotonic sequence number, unique within one tracer session.
    pub seq: u64,
    pub event: TraceEvent,
    pub depth: usize,
    /// Offset from the session start; `None` in golf mode.
    pub timestamp: Option<Duration>,
    pub node: Option<NodeId>,
    pub message: String,
    pub value: Option<Value>,
    /// Sequence number of the previous entry for the same node.
    pub previous_for_node: Option<u64>,
}

impl TraceEntry {
    pub fn kind(&self) -> TraceKind {
        self.event.kind()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub node: NodeId,
    pub label: String,
    pub depth: usize,
}

#[derive(Debug)]
pub struct Tracer {
    config: TraceConfig,
    capacity: usize,
    start: Instant,
    entries: VecDeque<TraceEntry>,
    next_seq: u64,
    depth: usize,
    stack: Vec<StackFrame>,
    last_by_node: HashMap<NodeId, u64>,
    cursor: usize,
    evicted: u64,
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracer {
    pub fn new() -> Self {
        Self::with_config(TraceConfig::default())
    }

    pub fn golf() -> Self {
        Self::with_config(TraceConfig {
            golf_mode: true,
            max_entries: None,
        })
    }

    pub fn with_config(config: TraceConfig) -> Self {
        Self {
            config,
            capacity: config.capacity(),
            start: Instant::now(),
            entries: VecDeque::new(),
            next_seq: 0,
            depth: 0,
            stack: Vec::new(),
            last_by_node: HashMap::new(),
            cursor: 0,
            evicted: 0,
        }
    }

    /// Drop every entry and start a new session clock.
    pub fn reset(&mut self) {
        *self = Self::with_config(self.config);
    }

    pub fn is_golf(&self) -> bool {
        self.config.golf_mode
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries dropped by the cap so far.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    // ── Recording ────────────────────────────────────────────────────

    pub fn section(&mut self, name: &str) {
        self.push(
            TraceEvent::Section(name.to_string()),
            None,
            format!("== {} ==", name),
            None,
        );
    }

    /// Entry messages and stack frames name the node only, never its
    /// operands, so a walk costs time linear in the nodes visited.
    pub fn enter_node(&mut self, node: &Node) {
        let label = node.brief();
        self.push(
            TraceEvent::Enter,
            Some(node.id),
            format!("enter {}", label),
            None,
        );
        self.stack.push(StackFrame {
            node: node.id,
            label,
            depth: self.depth,
        });
        self.depth += 1;
    }

    pub fn exit_node(&mut self, node: &Node, result: &Value) {
        self.depth = self.depth.saturating_sub(1);
        if let Some(pos) = self.stack.iter().rposition(|frame| frame.node == node.id) {
            self.stack.truncate(pos);
        }
        self.push(
            TraceEvent::Exit,
            Some(node.id),
            format!("exit {}", node.kind.name()),
            Some(result),
        );
    }

    pub fn condition(&mut self, node: &Node, value: &Value) {
        let result = value.is_truthy();
        self.push(
            TraceEvent::Condition { result },
            Some(node.id),
            format!("condition {} is {}", self.describe(node), result),
            Some(value),
        );
    }

    pub fn decision(&mut self, node: &Node, branch: Branch) {
        self.push(
            TraceEvent::Decision { branch },
            Some(node.id),
            format!("took {} branch of {}", branch.name(), self.describe(node)),
            None,
        );
    }

    /// Full expression text, or just the node itself in golf mode.
    fn describe(&self, node: &Node) -> String {
        if self.config.golf_mode {
            node.brief()
        } else {
            node.label()
        }
    }

    pub fn consequence(&mut self, node: &Node, outcome: &ConsequenceOutcome) {
        let status = if outcome.success { "succeeded" } else { "failed" };
        let mut message = format!("{} {} {}", outcome.kind, outcome.action, status);
        if let Some(detail) = &outcome.message {
            let _ = write!(message, ": {}", detail);
        }
        self.push(
            TraceEvent::Consequence {
                action: outcome.action.clone(),
                kind: outcome.kind,
                success: outcome.success,
            },
            Some(node.id),
            message,
            Some(&outcome.value),
        );
    }

    pub fn rule_execution(&mut self, node: &Node, name: &str, count: u64) {
        self.push(
            TraceEvent::RuleExecution {
                name: name.to_string(),
                count,
            },
            Some(node.id),
            format!("rule {} activation #{}", name, count),
            None,
        );
    }

    pub fn variable_change(&mut self, node: &Node, name: &str, old: Option<&Value>, new: &Value) {
        let message = match old {
            Some(old) if !self.config.golf_mode => format!("{}: {} -> {}", name, old, new),
            _ => format!("{} changed", name),
        };
        self.push(
            TraceEvent::VariableChange {
                name: name.to_string(),
            },
            Some(node.id),
            message,
            Some(new),
        );
    }

    pub fn error(&mut self, node: Option<&Node>, error: &EvalError) {
        tracing::debug!(kind = %error.kind, "traced evaluation error: {}", error.message);
        self.push(
            TraceEvent::Error { kind: error.kind },
            node.map(|n| n.id),
            error.message.clone(),
            None,
        );
    }

    pub fn message(&mut self, node: Option<&Node>, text: impl Into<String>) {
        self.push(TraceEvent::Message, node.map(|n| n.id), text.into(), None);
    }

    fn push(&mut self, event: TraceEvent, node: Option<NodeId>, message: String, value: Option<&Value>) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
            self.evicted += 1;
            self.cursor = self.cursor.saturating_sub(1);
            if self.evicted == 1 {
                tracing::debug!(capacity = self.capacity, "trace cap reached, evicting oldest entries");
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let previous_for_node = node.and_then(|id| self.last_by_node.insert(id, seq));
        let timestamp = (!self.config.golf_mode).then(|| self.start.elapsed());
        let value = if self.config.golf_mode {
            None
        } else {
            value.cloned()
        };

        self.entries.push_back(TraceEntry {
            seq,
            event,
            depth: self.depth,
            timestamp,
            node,
            message,
            value,
            previous_for_node,
        });
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn entries(&self) -> impl Iterator<Item = &TraceEntry> {
        self.entries.iter()
    }

    /// Entry by sequence number, if it has not been evicted.
    pub fn get(&self, seq: u64) -> Option<&TraceEntry> {
        let first = self.entries.front()?.seq;
        let offset = usize::try_from(seq.checked_sub(first)?).ok()?;
        self.entries.get(offset)
    }

    pub fn last_entry_for(&self, node: NodeId) -> Option<&TraceEntry> {
        self.last_by_node.get(&node).and_then(|seq| self.get(*seq))
    }

    /// The entry recorded for the same node just before `entry`.
    pub fn previous_for_node(&self, entry: &TraceEntry) -> Option<&TraceEntry> {
        entry.previous_for_node.and_then(|seq| self.get(seq))
    }

    /// Most recent entry of `kind` for `node`, following back-links.
    pub fn last_of_kind(&self, node: NodeId, kind: TraceKind) -> Option<&TraceEntry> {
        let mut entry = self.last_entry_for(node);
        while let Some(current) = entry {
            if current.kind() == kind {
                return Some(current);
            }
            entry = self.previous_for_node(current);
        }
        None
    }

    /// Live node stack, outermost first.
    pub fn stack_trace(&self) -> &[StackFrame] {
        &self.stack
    }

    pub fn render_stack_trace(&self) -> String {
        let mut out = String::new();
        for (i, frame) in self.stack.iter().rev().enumerate() {
            let _ = writeln!(out, "  #{} {} ({})", i, frame.label, frame.node);
        }
        out
    }

    /// Decision nodes in the order they were decided.
    pub fn decision_path(&self) -> Vec<NodeId> {
        self.entries
            .iter()
            .filter(|entry| entry.kind() == TraceKind::Decision)
            .filter_map(|entry| entry.node)
            .collect()
    }

    // ── Cursor iteration ─────────────────────────────────────────────

    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    pub fn has_more(&self) -> bool {
        self.cursor < self.entries.len()
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<&TraceEntry> {
        let entry = self.entries.get(self.cursor)?;
        self.cursor += 1;
        Some(entry)
    }

    // ── Rendering and export ─────────────────────────────────────────

    /// Plain-text listing, indented by depth.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            if let Some(ts) = entry.timestamp {
                let _ = write!(out, "[{:>8}us] ", ts.as_micros());
            }
            let _ = write!(
                out,
                "{}{:<15} {}",
                "  ".repeat(entry.depth),
                entry.kind().as_str(),
                entry.message
            );
            if let Some(value) = &entry.value {
                let _ = write!(out, " = {}", value);
            }
            out.push('\n');
        }
        out
    }

    fn records(&self) -> Vec<TraceRecord<'_>> {
        let mut previous: Option<Duration> = None;
        self.entries
            .iter()
            .map(|entry| {
                let elapsed = match (entry.timestamp, previous) {
                    (Some(ts), Some(prev)) => Some(ts.saturating_sub(prev)),
                    (Some(_), None) => Some(Duration::ZERO),
                    _ => None,
                };
                previous = entry.timestamp.or(previous);
                TraceRecord {
                    kind: entry.kind(),
                    depth: entry.depth,
                    timestamp: entry.timestamp.map(micros),
                    elapsed: elapsed.map(micros),
                    message: &entry.message,
                    value: entry.value.as_ref().map(|v| v.to_string()),
                }
            })
            .collect()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.records())
    }

    pub fn to_csv(&self) -> String {
        let mut out = String::from("type,depth,timestamp,elapsed,message,value\n");
        for record in self.records() {
            let fields = [
                record.kind.as_str().to_string(),
                record.depth.to_string(),
                record.timestamp.map(|t| t.to_string()).unwrap_or_default(),
                record.elapsed.map(|t| t.to_string()).unwrap_or_default(),
                csv_field(record.message),
                record.value.as_deref().map(csv_field).unwrap_or_default(),
            ];
            out.push_str(&fields.join(","));
            out.push('\n');
        }
        out
    }
}

/// One exported entry. Times are microseconds.
#[derive(Debug, Serialize)]
struct TraceRecord<'a> {
    #[serde(rename = "type")]
    kind: TraceKind,
    depth: usize,
    timestamp: Option<u64>,
    elapsed: Option<u64>,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
}

fn micros(d: Duration) -> u64 {
    u64::try_from(d.as_micros()).unwrap_or(u64::MAX)
}

fn csv_field(text: &str) -> String {
    if text.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text.to_string()
    }
}
