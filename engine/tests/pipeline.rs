//! End-to-end behaviour: source text in, value, trace and explanation out.

use golf_engine::ast::{ChainType, ConsequenceKind, LogicOperator, NodeKind, AST_MAX_DEPTH};
use golf_engine::tracer::{TraceConfig, TraceKind, TRACE_MAX_ENTRIES};
use golf_engine::{
    explain_generate, parse_source, run_source, Config, Environment, ErrorKind, EvalConfig,
    Evaluator, ExplainMode, Node, Parser, SourceDiagnostic, Tracer, Value,
};
use pretty_assertions::assert_eq;

const SAMPLE: &str = "rule r { if x > 5 then win else lose end }";

fn parse(source: &str) -> Node {
    let (root, errors) = parse_source(source, &Config::default());
    assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
    root
}

#[test]
fn win_scenario_with_explanation() {
    let root = parse(SAMPLE);
    let mut env = Environment::new().with_variable("x", 10.0);
    let mut eval = Evaluator::with_config(EvalConfig {
        explain: Some(ExplainMode::Why),
        ..EvalConfig::default()
    });

    let value = eval.eval_tree(&root, &mut env);
    let outcome = value.as_consequence().expect("a consequence");
    assert_eq!(outcome.action, "win");
    assert!(outcome.success);
    assert!(!eval.had_error());

    let text = eval.explanation().expect("explanation enabled");
    assert!(text.contains("x > 5"));
    assert!(text.contains("win"));
    assert!(text.contains("rule r (1 activation)"));
}

#[test]
fn why_not_names_the_blocking_decision() {
    let root = parse(SAMPLE);
    let mut env = Environment::new().with_variable("x", 10.0);
    let mut eval = Evaluator::new();
    eval.eval_tree(&root, &mut env);

    let text =
        explain_generate(&root, eval.tracer(), &ExplainMode::WhyNot("lose".into())).unwrap();
    assert!(text.contains("if x > 5 took THEN, but ELSE was needed"));
    assert!(text.contains("ELSE branch would have run lose"));
}

#[test]
fn explanation_is_deterministic() {
    let root = parse(SAMPLE);
    let mut env = Environment::new().with_variable("x", 3.0);
    let mut eval = Evaluator::new();
    eval.eval_tree(&root, &mut env);

    for mode in [ExplainMode::Why, ExplainMode::WhyNot("win".into())] {
        let first = explain_generate(&root, eval.tracer(), &mode).unwrap();
        let second = explain_generate(&root, eval.tracer(), &mode).unwrap();
        assert_eq!(first, second);
    }
}

#[test]
fn short_circuit_leaves_no_trace_of_right_operand() {
    for (source, op) in [("false && y > 1", LogicOperator::And), ("true || y > 1", LogicOperator::Or)] {
        let root = parse(source);
        let logic = root
            .find(|n| matches!(&n.kind, NodeKind::LogicOp { op: found, .. } if *found == op))
            .unwrap();
        let NodeKind::LogicOp { right, .. } = &logic.kind else {
            unreachable!();
        };
        let right_id = right.as_deref().unwrap().id;

        let mut eval = Evaluator::new();
        eval.eval_tree(&root, &mut Environment::new());
        let entered = eval
            .tracer()
            .entries()
            .any(|e| e.kind() == TraceKind::Enter && e.node == Some(right_id));
        assert!(!entered, "{} evaluated its right operand", source);
    }
}

#[test]
fn golf_chain_gating_from_source() {
    let config = Config::golf();
    let source = "rule g { ready -> W }";
    let (root, errors) = parse_source(source, &config);
    assert!(errors.is_empty());
    let chain = root
        .find(|n| matches!(n.kind, NodeKind::Chain { chain_type: ChainType::Parallel, .. }))
        .expect("parallel chain");
    assert_eq!(chain.to_string(), "ready -> win");

    // The head is a variable read, so the guard is whatever `ready` holds.
    let mut idle = Environment::new().with_variable("ready", false);
    let mut eval = Evaluator::with_config(config.eval_config());
    assert_eq!(eval.eval_tree(&root, &mut idle), Value::Bool(false));
    assert!(idle.executed().is_empty());
    assert!(eval.tracer().entries().all(|e| e.timestamp.is_none()));

    let mut armed = Environment::new().with_variable("ready", true);
    eval.eval_tree(&root, &mut armed);
    assert_eq!(armed.executed(), &[("win".to_string(), ConsequenceKind::Win)]);
}

#[test]
fn golf_letters_in_bare_condition_are_variables() {
    let config = Config::golf();
    let source = "W > 3 then L end";

    let mut high = Environment::new().with_variable("W", 10.0);
    let run = run_source(source, &config, &mut high).expect("parses");
    assert_eq!(run.value.as_consequence().map(|o| o.kind), Some(ConsequenceKind::Lose));
    assert_eq!(high.executed(), &[("lose".to_string(), ConsequenceKind::Lose)]);

    let mut low = Environment::new().with_variable("W", 1.0);
    let run = run_source(source, &config, &mut low).expect("parses");
    assert_eq!(run.value, Value::Bool(false));
    assert!(low.executed().is_empty());
}

#[test]
fn deeply_nested_rules_are_rejected_not_crashed() {
    let mut source = String::new();
    for i in 0..400 {
        source.push_str(&format!("rule r{} {{ ", i));
    }
    source.push_str("win");
    source.push_str(&" }".repeat(400));

    let (root, errors) = parse_source(&source, &Config::default());
    assert!(errors.iter().any(|e| e.kind() == ErrorKind::Recursion));
    assert!(root.validate().is_ok());
}

#[test]
fn parser_recovers_to_second_rule() {
    let source = "rule broken { if x > 1 then win }\nrule fine { if y then pass end }";
    let mut parser = Parser::new(source);
    let root = parser.parse();
    assert!(parser.had_error());
    assert!(root.find_rule("fine").is_some());

    let first = parser.errors().next().unwrap();
    let diagnostic = SourceDiagnostic::from_error(first, source).unwrap();
    assert_eq!(&source[diagnostic.span.offset()..][..1], "}");
}

#[test]
fn run_source_rejects_syntax_errors() {
    let err = run_source("if x then", &Config::default(), &mut Environment::new())
        .err()
        .expect("syntax error");
    assert_eq!(err.kind(), ErrorKind::Syntax);
}

#[test]
fn rules_call_each_other() {
    let source = "rule main { check() }\nrule check { if score >= 3 then \"promote\" >> win end }";
    let mut env = Environment::new().with_variable("score", 4.0);
    let run = run_source(source, &Config::default(), &mut env).unwrap();
    // `main` runs first and settles the block through `check`.
    assert_eq!(run.value.as_consequence().unwrap().action, "win");
    let actions: Vec<_> = env.executed().iter().map(|(a, _)| a.as_str()).collect();
    assert_eq!(actions, vec!["promote", "win"]);
    assert_eq!(run.evaluator.stats().rule_activations, 2);
}

#[test]
fn trace_cap_evicts_oldest() {
    let mut tracer = Tracer::with_config(TraceConfig::default());
    for i in 0..TRACE_MAX_ENTRIES + 25 {
        tracer.message(None, format!("entry {}", i));
    }
    assert_eq!(tracer.len(), TRACE_MAX_ENTRIES);
    assert_eq!(tracer.entries().next().unwrap().message, "entry 25");
    let last = format!("entry {}", TRACE_MAX_ENTRIES + 24);
    assert_eq!(tracer.entries().last().unwrap().message, last);
}

#[test]
fn deep_decision_chain_fails_validation() {
    let mut tree = Node::consequence("win", golf_engine::ast::ConsequenceKind::Win);
    for _ in 0..AST_MAX_DEPTH {
        tree = Node::decision(Node::boolean(true), Some(tree), None);
    }
    let err = tree.validate().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[test]
fn clone_is_structurally_equal_and_independent() {
    let root = parse(SAMPLE);
    let mut copy = root.clone_tree();
    assert!(root.equals(&copy));
    copy.children[0].set_active(false);
    assert!(!root.equals(&copy));
    assert!(root.find_rule("r").unwrap().as_rule().unwrap().is_active);
}

#[test]
fn trace_exports_match_entry_count() {
    let root = parse(SAMPLE);
    let mut eval = Evaluator::new();
    eval.eval_tree(&root, &mut Environment::new().with_variable("x", 1.0));
    let tracer = eval.tracer();

    let csv = tracer.to_csv();
    assert_eq!(csv.lines().count(), tracer.len() + 1);

    let json: serde_json::Value = serde_json::from_str(&tracer.to_json().unwrap()).unwrap();
    assert_eq!(json.as_array().unwrap().len(), tracer.len());
    assert_eq!(json[0]["type"], "section");
}
