//! Explainer — turns a finished trace into "why" / "why not" narratives.
//!
//! Each section replays the trace once. Output depends only on the tree and
//! the recorded entries (never on timestamps or hash order), so explaining
//! the same run twice gives byte-identical text.
//!
//! Why-not reconstruction walks the tree path from the root to the target
//! and asks the tracer, through its per-node back-links, what each decision
//! on that path actually did. That keeps the search linear in the trace.

use std::collections::HashSet;
use std::fmt::Write as _;

use serde::Deserialize;

use crate::ast::{Node, NodeId, NodeIndex, NodeKind, Visit};
use crate::errors::{Error, Result};
use crate::tracer::{Branch, TraceEvent, TraceKind, Tracer};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExplainMode {
    /// Narrate the path that was taken.
    Why,
    /// Explain why the consequence with this action did not run.
    WhyNot(String),
}

/// The consequence node an explanation targets, by action name.
pub fn find_target<'a>(root: &'a Node, action: &str) -> Result<&'a Node> {
    root.find_consequence(action)
        .ok_or_else(|| Error::InvalidState(format!("no consequence '{}' in tree", action)))
}

pub fn explain_generate(root: &Node, trace: &Tracer, mode: &ExplainMode) -> Result<String> {
    let index = NodeIndex::build(root);
    let mut out = String::new();

    match mode {
        ExplainMode::Why => {
            out.push_str("Why: evaluation path\n");
        }
        ExplainMode::WhyNot(action) => {
            let target = find_target(root, action)?;
            let _ = writeln!(out, "Why not: {}", target.label());
            why_not_section(&mut out, &index, trace, target);
        }
    }

    decision_path_section(&mut out, &index, trace);
    condition_section(&mut out, &index, trace);
    consequence_section(&mut out, trace);
    rule_section(&mut out, trace);

    if let ExplainMode::WhyNot(_) = mode {
        alternatives_section(&mut out, &index, trace);
        error_section(&mut out, &index, trace);
    }

    tracing::debug!(bytes = out.len(), "generated explanation");
    Ok(out)
}

// ── Sections ─────────────────────────────────────────────────────────

fn label_of(index: &NodeIndex<'_>, id: Option<NodeId>) -> String {
    id.and_then(|id| index.get(id))
        .map(|node| node.label())
        .unwrap_or_else(|| "<unknown node>".to_string())
}

fn decision_path_section(out: &mut String, index: &NodeIndex<'_>, trace: &Tracer) {
    out.push_str("\nDecision path:\n");
    let mut step = 0;
    for entry in trace.entries() {
        if let TraceEvent::Decision { branch } = entry.event {
            step += 1;
            let _ = writeln!(
                out,
                "  {}. {} -> {}",
                step,
                label_of(index, entry.node),
                branch.name()
            );
        }
    }
    if step == 0 {
        out.push_str("  (no decisions)\n");
    }
}

fn condition_section(out: &mut String, index: &NodeIndex<'_>, trace: &Tracer) {
    out.push_str("\nCondition evaluations:\n");
    let mut visited = HashSet::new();
    for entry in trace.entries() {
        let TraceEvent::Condition { result } = entry.event else {
            continue;
        };
        let Some(id) = entry.node else {
            continue;
        };
        if !visited.insert(id) {
            continue;
        }
        let _ = write!(out, "  - {} was {}", label_of(index, Some(id)), result);
        if let Some(value) = &entry.value {
            let _ = write!(out, " (value {})", value);
        }
        out.push('\n');
    }
    if visited.is_empty() {
        out.push_str("  (none)\n");
    }
}

fn consequence_section(out: &mut String, trace: &Tracer) {
    out.push_str("\nConsequences executed:\n");
    let mut any = false;
    for entry in trace.entries() {
        if let TraceEvent::Consequence {
            action,
            kind,
            success,
        } = &entry.event
        {
            any = true;
            let status = if *success { "succeeded" } else { "failed" };
            let _ = writeln!(out, "  - {} ({}) {}", action, kind, status);
        }
    }
    if !any {
        out.push_str("  (none)\n");
    }
}

fn rule_section(out: &mut String, trace: &Tracer) {
    out.push_str("\nRule activations:\n");
    // First-seen order, last count wins.
    let mut rules: Vec<(String, u64)> = Vec::new();
    for entry in trace.entries() {
        if let TraceEvent::RuleExecution { name, count } = &entry.event {
            match rules.iter_mut().find(|(seen, _)| seen == name) {
                Some(slot) => slot.1 = *count,
                None => rules.push((name.clone(), *count)),
            }
        }
    }
    if rules.is_empty() {
        out.push_str("  (none)\n");
    }
    for (name, count) in rules {
        let plural = if count == 1 { "" } else { "s" };
        let _ = writeln!(out, "  - rule {} ({} activation{})", name, count, plural);
    }
}

/// For every decision on the recorded path, the consequences its untaken
/// branch would have run.
fn alternatives_section(out: &mut String, index: &NodeIndex<'_>, trace: &Tracer) {
    out.push_str("\nWhat would have happened:\n");
    let mut visited = HashSet::new();
    let mut any = false;
    for entry in trace.entries() {
        let TraceEvent::Decision { branch } = entry.event else {
            continue;
        };
        let Some(id) = entry.node else {
            continue;
        };
        if !visited.insert(id) {
            continue;
        }
        let Some(decision) = index.get(id) else {
            continue;
        };
        let untaken = branch.other();
        let actions = match branch_node(decision, untaken) {
            Some(node) => consequences_in(node),
            None => Vec::new(),
        };
        any = true;
        if actions.is_empty() {
            let _ = writeln!(
                out,
                "  - {}: {} branch has no consequences",
                decision.label(),
                untaken.name()
            );
        } else {
            let _ = writeln!(
                out,
                "  - {}: {} branch would have run {}",
                decision.label(),
                untaken.name(),
                actions.join(", ")
            );
        }
    }
    if !any {
        out.push_str("  (no alternatives recorded)\n");
    }
}

fn error_section(out: &mut String, index: &NodeIndex<'_>, trace: &Tracer) {
    out.push_str("\nErrors:\n");
    let mut any = false;
    for entry in trace.entries() {
        if let TraceEvent::Error { kind } = entry.event {
            any = true;
            let _ = write!(out, "  - {} error: {}", kind, entry.message);
            if entry.node.is_some() {
                let _ = write!(out, " at {}", label_of(index, entry.node));
            }
            out.push('\n');
        }
    }
    if !any {
        out.push_str("  (none)\n");
    }
}

/// Walk the path from the root to `target` and report, for every ancestor
/// that gates it, what was required versus what happened.
fn why_not_section(out: &mut String, index: &NodeIndex<'_>, trace: &Tracer, target: &Node) {
    if trace.last_of_kind(target.id, TraceKind::Consequence).is_some() {
        out.push_str("  It did run; see the consequences below.\n");
        return;
    }

    let Some(path) = index.path_to(target.id) else {
        out.push_str("  Target is not part of the evaluated tree.\n");
        return;
    };

    let mut blockers = 0;
    for pair in path.windows(2) {
        let (ancestor, next) = (pair[0], pair[1]);
        match &ancestor.kind {
            NodeKind::Decision { condition, .. } => {
                let Some(required) = required_branch(ancestor, next.id) else {
                    continue;
                };
                match trace.last_of_kind(ancestor.id, TraceKind::Decision) {
                    Some(entry) => {
                        let TraceEvent::Decision { branch } = entry.event else {
                            continue;
                        };
                        if branch == required {
                            continue;
                        }
                        blockers += 1;
                        let _ = write!(
                            out,
                            "  - {} took {}, but {} was needed",
                            ancestor.label(),
                            branch.name(),
                            required.name()
                        );
                        let observed = condition
                            .as_deref()
                            .and_then(|c| trace.last_of_kind(c.id, TraceKind::Condition));
                        if let Some(TraceEvent::Condition { result }) = observed.map(|e| &e.event) {
                            let _ = write!(out, " (condition was {})", result);
                        }
                        out.push('\n');
                    }
                    None => {
                        blockers += 1;
                        let _ = writeln!(out, "  - {} was never decided", ancestor.label());
                    }
                }
            }
            NodeKind::Rule(rule) => {
                if trace.last_of_kind(ancestor.id, TraceKind::RuleExecution).is_none() {
                    blockers += 1;
                    let state = if rule.is_active { "never activated" } else { "inactive" };
                    let _ = writeln!(out, "  - rule {} was {}", rule.name, state);
                }
            }
            NodeKind::LogicOp { .. } | NodeKind::Chain { .. } => {
                let reached = trace.last_of_kind(ancestor.id, TraceKind::Enter).is_some();
                let entered_next = trace.last_of_kind(next.id, TraceKind::Enter).is_some();
                if reached && !entered_next {
                    blockers += 1;
                    let _ = writeln!(
                        out,
                        "  - {} short-circuited before reaching it",
                        ancestor.label()
                    );
                }
            }
            _ => {}
        }
    }

    if blockers == 0 {
        let reached = trace.last_of_kind(target.id, TraceKind::Enter).is_some();
        if reached {
            out.push_str("  It was reached but did not complete.\n");
        } else {
            out.push_str("  Evaluation stopped before reaching it.\n");
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

fn branch_node(decision: &Node, branch: Branch) -> Option<&Node> {
    match &decision.kind {
        NodeKind::Decision {
            true_branch,
            false_branch,
            ..
        } => match branch {
            Branch::True => true_branch.as_deref(),
            Branch::False => false_branch.as_deref(),
        },
        _ => None,
    }
}

/// Which branch of `decision` leads to the child `next`; `None` when `next`
/// is the condition.
fn required_branch(decision: &Node, next: NodeId) -> Option<Branch> {
    [Branch::True, Branch::False]
        .into_iter()
        .find(|branch| branch_node(decision, *branch).map(|n| n.id) == Some(next))
}

fn consequences_in(node: &Node) -> Vec<String> {
    let mut actions = Vec::new();
    node.traverse_preorder(|n, _| {
        if let NodeKind::Consequence(_) = n.kind {
            actions.push(n.to_string());
        }
        Visit::Continue
    });
    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{CompareOperator, ConsequenceKind};
    use crate::value::{ConsequenceOutcome, Value};
    use pretty_assertions::assert_eq;

    // if x > 5 then win else lose end, replayed by hand with x = 10
    fn decided() -> (Node, Tracer) {
        let root = Node::decision(
            Node::comparison(CompareOperator::Gt, Node::identifier("x"), Node::number(5.0)),
            Some(Node::consequence("win", ConsequenceKind::Win)),
            Some(Node::consequence("lose", ConsequenceKind::Lose)),
        );
        let mut tracer = Tracer::golf();
        let NodeKind::Decision { condition, true_branch, .. } = &root.kind else {
            unreachable!();
        };
        let condition = condition.as_deref().unwrap();
        let win = true_branch.as_deref().unwrap();
        tracer.enter_node(&root);
        tracer.condition(condition, &Value::Bool(true));
        tracer.decision(&root, Branch::True);
        tracer.consequence(
            win,
            &ConsequenceOutcome {
                action: "win".into(),
                kind: ConsequenceKind::Win,
                success: true,
                value: Value::Null,
                message: None,
            },
        );
        tracer.exit_node(&root, &Value::Null);
        (root, tracer)
    }

    #[test]
    fn test_why_narrates_path() {
        let (root, tracer) = decided();
        let text = explain_generate(&root, &tracer, &ExplainMode::Why).unwrap();
        assert_eq!(
            text,
            "Why: evaluation path\n\
             \nDecision path:\n  1. if x > 5 -> THEN\n\
             \nCondition evaluations:\n  - x > 5 was true\n\
             \nConsequences executed:\n  - win (win) succeeded\n\
             \nRule activations:\n  (none)\n"
        );
    }

    #[test]
    fn test_why_not_reports_required_branch() {
        let (root, tracer) = decided();
        let text =
            explain_generate(&root, &tracer, &ExplainMode::WhyNot("lose".into())).unwrap();
        assert!(text.starts_with("Why not: lose lose\n"));
        assert!(text.contains("  - if x > 5 took THEN, but ELSE was needed (condition was true)\n"));
        assert!(text.contains("  - if x > 5: ELSE branch would have run lose\n"));
        assert!(text.contains("\nErrors:\n  (none)\n"));
    }

    #[test]
    fn test_why_not_for_executed_target() {
        let (root, tracer) = decided();
        let text = explain_generate(&root, &tracer, &ExplainMode::WhyNot("win".into())).unwrap();
        assert!(text.contains("It did run"));
    }

    #[test]
    fn test_unknown_target_is_an_error() {
        let (root, tracer) = decided();
        let err = explain_generate(&root, &tracer, &ExplainMode::WhyNot("draw".into()));
        assert!(matches!(err, Err(Error::InvalidState(_))));
    }

    #[test]
    fn test_conditions_narrated_once() {
        let (root, mut tracer) = decided();
        let NodeKind::Decision { condition, .. } = &root.kind else {
            unreachable!();
        };
        tracer.condition(condition.as_deref().unwrap(), &Value::Bool(true));
        let text = explain_generate(&root, &tracer, &ExplainMode::Why).unwrap();
        assert_eq!(text.matches("x > 5 was true").count(), 1);
    }

    #[test]
    fn test_output_is_deterministic() {
        let (root, tracer) = decided();
        let mode = ExplainMode::WhyNot("lose".into());
        let first = explain_generate(&root, &tracer, &mode).unwrap();
        let second = explain_generate(&root, &tracer, &mode).unwrap();
        assert_eq!(first, second);
    }
}
