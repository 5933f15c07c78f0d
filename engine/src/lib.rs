//! Golf Engine — a small decision-rule language with explainable evaluation.
//!
//! # Pipeline
//!
//! ```text
//! Rule source
//!     │
//!     ▼
//! ┌──────────┐
//! │  Lexer    │  Streams tokens; golf shorthand depends on grammar context
//! └────┬─────┘
//!      │
//!      ▼
//! ┌──────────┐
//! │  Parser   │  Pratt parser (expressions) + recursive descent (rules)
//! └────┬─────┘
//!      │
//!      ▼
//! ┌──────────┐
//! │ Optimize  │  Optional constant folding
//! └────┬─────┘
//!      │
//!      ▼
//! ┌──────────┐
//! │ Evaluator │  Tree walk against a Runtime, every step traced
//! └────┬─────┘
//!      │
//!      ▼
//! ┌──────────┐
//! │ Explainer │  "why" / "why not" narratives from the trace
//! └──────────┘
//! ```
//!
//! ```
//! use golf_engine::{run_source, Config, Environment};
//!
//! let mut env = Environment::new().with_variable("x", 10.0);
//! let run = run_source("rule r { if x > 5 then win else lose end }", &Config::default(), &mut env)?;
//! assert_eq!(run.value.as_consequence().map(|c| c.action.as_str()), Some("win"));
//! # Ok::<(), golf_engine::Error>(())
//! ```

pub mod ast;
pub mod config;
pub mod errors;
pub mod eval;
pub mod explain;
pub mod lexer;
pub mod optimize;
pub mod parser;
pub mod runtime;
pub mod token;
pub mod tracer;
pub mod value;

pub use ast::{Node, NodeId, NodeKind};
pub use config::Config;
pub use errors::{Error, ErrorKind, Result, SourceDiagnostic};
pub use eval::{EvalConfig, Evaluator};
pub use explain::{explain_generate, ExplainMode};
pub use parser::Parser;
pub use runtime::{ConsequenceResult, Environment, Runtime};
pub use tracer::Tracer;
pub use value::Value;

/// Parse `source` with the lexer and parser settings from `config`. The
/// tree is returned even when errors were reported.
pub fn parse_source(source: &str, config: &Config) -> (Node, Vec<Error>) {
    let mut parser = Parser::with_config(source, config.lexer_config(), config.parser);
    let root = parser.parse();
    let errors = parser.errors().cloned().collect();
    (root, errors)
}

/// The products of one [`run_source`] call.
pub struct Run {
    pub tree: Node,
    pub value: Value,
    /// Holds the trace, stats and explanation of the run.
    pub evaluator: Evaluator,
}

/// Parse and evaluate `source`. Any syntax error aborts before evaluation.
pub fn run_source(source: &str, config: &Config, runtime: &mut dyn Runtime) -> Result<Run> {
    let (tree, errors) = parse_source(source, config);
    if let Some(first) = errors.into_iter().next() {
        return Err(first);
    }
    let mut evaluator = Evaluator::with_config(config.eval_config());
    let value = evaluator.eval_tree(&tree, runtime);
    Ok(Run {
        tree,
        value,
        evaluator,
    })
}
