//! Engine configuration, loadable from TOML.
//!
//! ```toml
//! golf_mode = true
//!
//! [parser]
//! max_recursion_depth = 128
//!
//! [eval]
//! trace_max_entries = 500
//! explain = "why"
//! ```
//!
//! Every field has a default, so an empty document is a valid config. The
//! top-level `golf_mode` switches the lexer and the evaluator together.

use std::path::Path;

use serde::Deserialize;

use crate::errors::{Error, Result};
use crate::eval::EvalConfig;
use crate::lexer::LexerConfig;
use crate::parser::ParserConfig;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub golf_mode: bool,
    pub lexer: LexerConfig,
    pub parser: ParserConfig,
    pub eval: EvalConfig,
}

impl Config {
    pub fn golf() -> Self {
        Self {
            golf_mode: true,
            ..Self::default()
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config = Self::from_toml_str(&text)?;
        tracing::debug!(path = %path.display(), golf = config.golf_mode, "loaded configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.parser.max_recursion_depth == 0 {
            return Err(Error::Config("parser.max_recursion_depth must be positive".into()));
        }
        if self.eval.max_recursion_depth == 0 {
            return Err(Error::Config("eval.max_recursion_depth must be positive".into()));
        }
        if self.eval.trace_max_entries == Some(0) {
            return Err(Error::Config("eval.trace_max_entries must be positive".into()));
        }
        Ok(())
    }

    pub fn lexer_config(&self) -> LexerConfig {
        LexerConfig {
            golf_mode: self.golf_mode || self.lexer.golf_mode,
            ..self.lexer
        }
    }

    pub fn eval_config(&self) -> EvalConfig {
        EvalConfig {
            golf_mode: self.golf_mode || self.eval.golf_mode,
            ..self.eval.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::explain::ExplainMode;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_document_is_default() {
        assert_eq!(Config::from_toml_str("").unwrap(), Config::default());
    }

    #[test]
    fn test_sections_and_golf_switch() {
        let config = Config::from_toml_str(
            r#"
            golf_mode = true

            [parser]
            max_recursion_depth = 64

            [eval]
            trace_max_entries = 500
            explain = { why_not = "lose" }
            "#,
        )
        .unwrap();
        assert!(config.lexer_config().golf_mode);
        assert!(config.lexer_config().skip_comments);
        assert_eq!(config.parser.max_recursion_depth, 64);
        let eval = config.eval_config();
        assert!(eval.golf_mode);
        assert_eq!(eval.trace_max_entries, Some(500));
        assert_eq!(eval.explain, Some(ExplainMode::WhyNot("lose".into())));
    }

    #[test]
    fn test_unit_explain_mode() {
        let config = Config::from_toml_str("[eval]\nexplain = \"why\"\n").unwrap();
        assert_eq!(config.eval.explain, Some(ExplainMode::Why));
    }

    #[test]
    fn test_rejects_bad_values() {
        let err = Config::from_toml_str("[parser]\nmax_recursion_depth = 0\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        let err = Config::from_toml_str("colour = \"blue\"\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/golf.toml").unwrap_err();
        assert!(err.to_string().contains("cannot read"));
    }
}
