//! Parser — Pratt parser (expressions) + recursive descent (rules and
//! decisions).
//!
//! The parser pulls tokens from the lexer on demand and builds an owned
//! [`Node`] tree. The root is always a `Block` holding the top-level rules
//! and decisions in source order.
//!
//! **Pratt parsing** for expressions:
//!   Each infix operator has a binding power. The loop keeps consuming
//!   operators while their power is at least the current minimum, so
//!   precedence and associativity fall out of one table:
//!   `assignment < chain < ternary < or < and < equality < comparison <
//!   term < factor < unary < call`.
//!
//! **Recursive descent** for `rule NAME { ... }`, `if .. then .. end`,
//! the bare `COND then .. end` form and `when COND do ..`.
//!
//! **Lexer context**:
//!   Every production knows whether it is reading a condition or a
//!   consequence and passes that to the lexer, so in golf mode `W` is the
//!   `win` keyword after `then` but a plain variable inside a condition.
//!   A statement is read like a condition; only when no `then` follows is a
//!   bare golf letter turned into its consequence.
//!
//! **Depth**:
//!   Nested rules and nested expressions share one recursion counter. Trees
//!   grown by the infix loop and by `any`/`all` never recurse, so every
//!   expression also has its height checked against what is left of
//!   [`AST_MAX_DEPTH`] below the enclosing rules.
//!
//! Error recovery:
//!   A failed production is recorded and the parser enters panic mode,
//!   discarding tokens up to the next `;`, `end`, `}`, `rule`, `if` or
//!   `when`. Only the first error of a panic episode is reported, and one
//!   malformed rule never hides the rules after it.

use serde::Deserialize;

use crate::ast::{
    ArithOperator, ChainType, CompareOperator, ConsequenceKind, Literal, LogicOperator, Node,
    NodeKind, AST_MAX_DEPTH,
};
use crate::errors::{Error, Result};
use crate::lexer::{Lexer, LexerConfig, LOOKAHEAD_CAPACITY};
use crate::token::{golf_shorthand, LexContext, Span, Token, TokenKind};

pub const MAX_RECURSION_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ParserConfig {
    pub max_recursion_depth: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            max_recursion_depth: MAX_RECURSION_DEPTH,
        }
    }
}

// Binding powers, lowest first.
const BP_CHAIN: u8 = 2;
const BP_TERNARY: u8 = 3;
const BP_OR: u8 = 4;
const BP_AND: u8 = 5;
const BP_EQUALITY: u8 = 6;
const BP_COMPARISON: u8 = 7;
const BP_TERM: u8 = 8;
const BP_FACTOR: u8 = 9;
const BP_UNARY: u8 = 10;

pub struct Parser<'src> {
    lexer: Lexer<'src>,
    config: ParserConfig,
    current: Token,
    previous: Token,
    errors: Vec<Error>,
    panic_mode: bool,
    depth: usize,
    /// Rules enclosing the production being parsed.
    rule_nesting: usize,
}

impl<'src> Parser<'src> {
    pub fn new(source: &'src str) -> Self {
        Self::with_config(source, LexerConfig::default(), ParserConfig::default())
    }

    /// Parser over a golf-mode lexer.
    pub fn golf(source: &'src str) -> Self {
        Self::with_config(source, LexerConfig::golf(), ParserConfig::default())
    }

    pub fn with_config(source: &'src str, lexer: LexerConfig, config: ParserConfig) -> Self {
        let lexer = Lexer::with_config(source, lexer);
        let placeholder = Token::new(TokenKind::Eof, "", Span::default(), 1, 1);
        let mut parser = Self {
            lexer,
            config,
            current: placeholder.clone(),
            previous: placeholder,
            errors: Vec::new(),
            panic_mode: false,
            depth: 0,
            rule_nesting: 0,
        };
        parser.current = parser.fetch();
        parser
    }

    /// Parse the whole input. Always returns a root `Block`; check
    /// [`Parser::had_error`] afterwards.
    pub fn parse(&mut self) -> Node {
        let start = self.current.span;
        let mut items = Vec::new();
        while !self.is_at_end() {
            if self.match_token(&TokenKind::Semicolon) {
                continue;
            }
            let mark = self.current.span.start;
            match self.declaration() {
                Ok(node) => items.push(node),
                Err(err) => self.recover(err, mark, false),
            }
        }
        let root = Node::block(items).with_span(start.merge(self.previous.span), 1);
        tracing::debug!(
            statements = root.children.len(),
            errors = self.error_count(),
            "parsed source"
        );
        root
    }

    /// True when the lexer or the parser reported anything.
    pub fn had_error(&self) -> bool {
        !self.errors.is_empty() || self.lexer.had_error()
    }

    /// Lexer errors first, then parser errors.
    pub fn errors(&self) -> impl Iterator<Item = &Error> {
        self.lexer.errors().iter().chain(self.errors.iter())
    }

    pub fn error_count(&self) -> usize {
        self.errors.len() + self.lexer.error_count()
    }

    // ── Declarations ─────────────────────────────────────────────────

    fn declaration(&mut self) -> Result<Node> {
        if self.check(&TokenKind::Rule) {
            self.rule_declaration()
        } else {
            self.statement()
        }
    }

    fn rule_declaration(&mut self) -> Result<Node> {
        self.nested(Self::rule_inner)
    }

    fn rule_inner(&mut self) -> Result<Node> {
        let start = self.advance();
        let name = self.expect_identifier("rule name")?;
        self.expect(&TokenKind::LBrace, "'{' after rule name")?;

        let body_start = self.previous.span;
        let mut statements = Vec::new();
        self.rule_nesting += 1;
        while !self.check(&TokenKind::RBrace) && !self.is_at_end() {
            if self.match_token(&TokenKind::Semicolon) {
                continue;
            }
            let mark = self.current.span.start;
            match self.declaration() {
                Ok(node) => statements.push(node),
                Err(err) => self.recover(err, mark, true),
            }
        }
        self.rule_nesting -= 1;
        let end = self.expect(&TokenKind::RBrace, "'}' after rule body")?;

        let body = Node::block(statements).with_span(body_start.merge(end.span), start.line);
        let rule = Node::rule(name, body).with_span(start.span.merge(end.span), start.line);
        self.check_height(rule.get_depth())?;
        Ok(rule)
    }

    fn statement(&mut self) -> Result<Node> {
        let start = self.current.clone();
        let expr = self.parse_expr(0, LexContext::RuleBody)?;
        if self.match_token(&TokenKind::Then) {
            let decision = self.decision_tail(expr, &start)?;
            self.check_height(decision.get_depth())?;
            return Ok(decision);
        }
        Ok(self.into_consequence(expr))
    }

    // ── Decisions ────────────────────────────────────────────────────

    fn if_expr(&mut self) -> Result<Node> {
        let start = self.advance();
        let condition = self.parse_expr(0, LexContext::Condition)?;
        self.expect(&TokenKind::Then, "'then' after condition")?;
        self.decision_tail(condition, &start)
    }

    /// Everything after `then`: `CONSEQ [else CONSEQ] end`.
    fn decision_tail(&mut self, condition: Node, start: &Token) -> Result<Node> {
        let true_branch = self.consequence()?;
        let false_branch = if self.match_token(&TokenKind::Else) {
            Some(self.consequence()?)
        } else {
            None
        };
        let end = self.expect(&TokenKind::End, "'end' to close decision")?;
        Ok(Node::decision(condition, Some(true_branch), false_branch)
            .with_span(start.span.merge(end.span), start.line))
    }

    fn when_expr(&mut self) -> Result<Node> {
        let start = self.advance();
        // Parsed above the ternary level so `=>` is left for the body.
        let condition = self.parse_expr(BP_OR, LexContext::Condition)?;
        if !self.match_token(&TokenKind::Do) && !self.match_token(&TokenKind::FatArrow) {
            return Err(self.error_at_current("expected 'do' or '=>' after when-condition"));
        }
        let body = self.consequence()?;
        let span = start.span.merge(body.span);
        Ok(Node::decision(condition, Some(body), None).with_span(span, start.line))
    }

    fn consequence(&mut self) -> Result<Node> {
        let node = self.parse_expr(0, LexContext::Consequence)?;
        Ok(self.into_consequence(node))
    }

    // ── Expressions ──────────────────────────────────────────────────

    fn parse_expr(&mut self, min_bp: u8, ctx: LexContext) -> Result<Node> {
        self.nested(|parser| parser.parse_expr_inner(min_bp, ctx))
    }

    fn parse_expr_inner(&mut self, min_bp: u8, ctx: LexContext) -> Result<Node> {
        let mut left = self.prefix(ctx)?;
        let mut height = left.get_depth();
        self.check_height(height)?;

        loop {
            let (op_bp, assoc) = match self.peek_kind() {
                TokenKind::Chain | TokenKind::Arrow => (BP_CHAIN, Assoc::Left),
                TokenKind::Question | TokenKind::Elvis | TokenKind::FatArrow => {
                    (BP_TERNARY, Assoc::Right)
                }
                TokenKind::Or => (BP_OR, Assoc::Left),
                TokenKind::And => (BP_AND, Assoc::Left),
                TokenKind::EqEq | TokenKind::BangEq => (BP_EQUALITY, Assoc::Left),
                TokenKind::Lt | TokenKind::LtEq | TokenKind::Gt | TokenKind::GtEq => {
                    (BP_COMPARISON, Assoc::Left)
                }
                TokenKind::Plus | TokenKind::Minus => (BP_TERM, Assoc::Left),
                TokenKind::Star | TokenKind::Slash | TokenKind::Percent => {
                    (BP_FACTOR, Assoc::Left)
                }
                _ => break,
            };

            if op_bp < min_bp {
                break;
            }

            let right_bp = match assoc {
                Assoc::Left => op_bp + 1,
                Assoc::Right => op_bp,
            };

            left = self.infix(left, right_bp, ctx)?;
            height = stacked_height(&left, height);
            self.check_height(height)?;
        }

        Ok(left)
    }

    /// Run `parse` one level deeper, failing once the recursion cap is hit.
    fn nested<T>(&mut self, parse: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let limit = self.config.max_recursion_depth;
        if self.depth >= limit {
            return Err(Error::Recursion {
                phase: "parser",
                limit,
            });
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    /// Fail when a node of `height` could not be placed under the root
    /// block and the enclosing rules without exceeding [`AST_MAX_DEPTH`].
    fn check_height(&self, height: usize) -> Result<()> {
        // The root block, then a rule and its body block per nesting level.
        let budget = AST_MAX_DEPTH.saturating_sub(1 + 2 * self.rule_nesting);
        if height > budget {
            return Err(Error::Recursion {
                phase: "parser",
                limit: AST_MAX_DEPTH,
            });
        }
        Ok(())
    }

    fn prefix(&mut self, ctx: LexContext) -> Result<Node> {
        let token = self.lexer.retokenize(self.current.clone(), ctx);
        let (span, line) = (token.span, token.line);

        match token.kind {
            TokenKind::Number(n) => {
                self.advance();
                Ok(Node::number(n).with_span(span, line))
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(Node::literal(Literal::String(s)).with_span(span, line))
            }
            TokenKind::True | TokenKind::Underscore => {
                self.advance();
                Ok(Node::boolean(true).with_span(span, line))
            }
            TokenKind::False => {
                self.advance();
                Ok(Node::boolean(false).with_span(span, line))
            }
            TokenKind::Null => {
                self.advance();
                Ok(Node::literal(Literal::Null).with_span(span, line))
            }

            TokenKind::Identifier(name) => self.identifier(name, span, line),

            TokenKind::Win
            | TokenKind::Lose
            | TokenKind::Draw
            | TokenKind::Skip
            | TokenKind::Fail
            | TokenKind::Pass => {
                self.advance();
                self.consequence_keyword(&token.kind, span, line)
            }

            TokenKind::Bang => {
                self.advance();
                let operand = self.parse_expr(BP_UNARY, ctx)?;
                let span = span.merge(operand.span);
                Ok(Node::not(operand).with_span(span, line))
            }
            TokenKind::Minus => {
                self.advance();
                let operand = self.parse_expr(BP_UNARY, ctx)?;
                let span = span.merge(operand.span);
                Ok(Node::arithmetic(ArithOperator::Neg, operand, None).with_span(span, line))
            }

            TokenKind::LParen => {
                self.advance();
                let inner = self.parse_expr(0, ctx)?;
                self.expect(&TokenKind::RParen, "')' after expression")?;
                Ok(inner)
            }

            TokenKind::Any => self.quantifier(LogicOperator::Or),
            TokenKind::All => self.quantifier(LogicOperator::And),

            TokenKind::If => self.if_expr(),
            TokenKind::When => self.when_expr(),

            _ => Err(self.error_at_current(format!(
                "expected expression, found '{}'",
                token.kind
            ))),
        }
    }

    fn infix(&mut self, left: Node, bp: u8, ctx: LexContext) -> Result<Node> {
        let op = self.advance();
        let line = left.line;

        match op.kind {
            TokenKind::Chain | TokenKind::Arrow => {
                let chain_type = if op.kind == TokenKind::Chain {
                    ChainType::Sequential
                } else {
                    ChainType::Parallel
                };
                let right = self.parse_expr(bp, LexContext::Consequence)?;
                let right = self.into_consequence(right);
                let first = self.chain_head(left, ctx);
                let span = first.span.merge(right.span);
                Ok(Node::chain(chain_type, first, right).with_span(span, line))
            }

            TokenKind::Question => {
                let true_branch = self.consequence()?;
                self.expect(&TokenKind::Colon, "':' in conditional expression")?;
                let false_branch = self.parse_expr(bp, LexContext::Consequence)?;
                let false_branch = self.into_consequence(false_branch);
                let span = left.span.merge(false_branch.span);
                Ok(Node::decision(left, Some(true_branch), Some(false_branch)).with_span(span, line))
            }

            // `cond ?: conseq` and `cond => conseq` are one-armed decisions.
            TokenKind::Elvis | TokenKind::FatArrow => {
                let body = self.parse_expr(bp, LexContext::Consequence)?;
                let body = self.into_consequence(body);
                let span = left.span.merge(body.span);
                Ok(Node::decision(left, Some(body), None).with_span(span, line))
            }

            TokenKind::Or | TokenKind::And => {
                let logic = if op.kind == TokenKind::Or {
                    LogicOperator::Or
                } else {
                    LogicOperator::And
                };
                let right = self.parse_expr(bp, ctx)?;
                let span = left.span.merge(right.span);
                Ok(Node::logic(logic, left, right).with_span(span, line))
            }

            TokenKind::EqEq
            | TokenKind::BangEq
            | TokenKind::Lt
            | TokenKind::LtEq
            | TokenKind::Gt
            | TokenKind::GtEq => {
                let compare = match op.kind {
                    TokenKind::EqEq => CompareOperator::Eq,
                    TokenKind::BangEq => CompareOperator::Ne,
                    TokenKind::Lt => CompareOperator::Lt,
                    TokenKind::LtEq => CompareOperator::Le,
                    TokenKind::Gt => CompareOperator::Gt,
                    _ => CompareOperator::Ge,
                };
                let right = self.parse_expr(bp, ctx)?;
                let span = left.span.merge(right.span);
                Ok(Node::comparison(compare, left, right).with_span(span, line))
            }

            TokenKind::Plus | TokenKind::Minus | TokenKind::Star | TokenKind::Slash | TokenKind::Percent => {
                let arith = match op.kind {
                    TokenKind::Plus => ArithOperator::Add,
                    TokenKind::Minus => ArithOperator::Sub,
                    TokenKind::Star => ArithOperator::Mul,
                    TokenKind::Slash => ArithOperator::Div,
                    _ => ArithOperator::Mod,
                };
                let right = self.parse_expr(bp, ctx)?;
                let span = left.span.merge(right.span);
                Ok(Node::arithmetic(arith, left, Some(right)).with_span(span, line))
            }

            _ => Err(Error::syntax(
                format!("unexpected operator '{}'", op.kind),
                op.span,
                op.line,
                op.column,
            )),
        }
    }

    /// Identifier, rule call `name()` or assignment `name = expr`.
    fn identifier(&mut self, name: String, span: Span, line: usize) -> Result<Node> {
        match self.peek_next_kind() {
            TokenKind::LParen => {
                self.advance();
                self.advance();
                let close = self.expect(&TokenKind::RParen, "')' to close rule call")?;
                Ok(Node::rule_call(name).with_span(span.merge(close.span), line))
            }
            TokenKind::Eq => {
                self.advance();
                self.advance();
                let value = self.parse_expr(BP_TERNARY, LexContext::Condition)?;
                let span = span.merge(value.span);
                Ok(Node::assignment(name, value).with_span(span, line))
            }
            _ => {
                self.advance();
                Ok(Node::identifier(name).with_span(span, line))
            }
        }
    }

    /// `win`, `W`, or a weighted form such as `win(0.5)`.
    fn consequence_keyword(&mut self, kind: &TokenKind, span: Span, line: usize) -> Result<Node> {
        let kind = consequence_kind(kind);
        let mut node = Node::consequence(kind.to_string(), kind);
        let mut span = span;

        if self.match_token(&TokenKind::LParen) {
            let weight = match self.current.kind {
                TokenKind::Number(w) => w,
                _ => return Err(self.error_at_current("expected numeric weight")),
            };
            self.advance();
            let close = self.expect(&TokenKind::RParen, "')' after weight")?;
            span = span.merge(close.span);
            if let NodeKind::Consequence(consequence) = &mut node.kind {
                consequence.weight = weight;
            }
        }

        Ok(node.with_span(span, line))
    }

    /// `any(a, b, ..)` folds into `a || b || ..`; `all(..)` into `&&`.
    fn quantifier(&mut self, op: LogicOperator) -> Result<Node> {
        let start = self.advance();
        self.expect(&TokenKind::LParen, "'(' after quantifier")?;

        let mut operands = Vec::new();
        if !self.check(&TokenKind::RParen) {
            loop {
                operands.push(self.parse_expr(0, LexContext::Condition)?);
                if !self.match_token(&TokenKind::Comma) {
                    break;
                }
            }
        }
        let close = self.expect(&TokenKind::RParen, "')' to close quantifier")?;
        let span = start.span.merge(close.span);

        // The fold nests every operand one level deeper than the next.
        let tallest = operands.iter().map(Node::get_depth).max().unwrap_or(0);
        self.check_height(tallest + operands.len().saturating_sub(1))?;

        let mut operands = operands.into_iter();
        let folded = match operands.next() {
            Some(first) => operands.fold(first, |acc, next| Node::logic(op, acc, next)),
            // Empty any() is false, empty all() is true.
            None => Node::boolean(op == LogicOperator::And),
        };
        Ok(folded.with_span(span, start.line))
    }

    // ── Token plumbing ───────────────────────────────────────────────

    /// Next significant token. Trivia is skipped; error tokens were already
    /// recorded by the lexer and are skipped too.
    fn fetch(&mut self) -> Token {
        loop {
            let token = self.lexer.next_token();
            if !token.kind.is_trivia() && !token.is_error() {
                return token;
            }
        }
    }

    fn advance(&mut self) -> Token {
        let next = self.fetch();
        self.previous = std::mem::replace(&mut self.current, next);
        self.previous.clone()
    }

    fn peek_kind(&self) -> &TokenKind {
        &self.current.kind
    }

    /// Kind of the significant token after `current`, looking through the
    /// lexer's ring.
    fn peek_next_kind(&mut self) -> TokenKind {
        for k in 1..=LOOKAHEAD_CAPACITY {
            let token = self.lexer.peek_token(k);
            if !token.kind.is_trivia() && !token.is_error() {
                return token.kind;
            }
        }
        TokenKind::Eof
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(self.peek_kind()) == std::mem::discriminant(kind)
    }

    fn match_token(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, kind: &TokenKind, what: &str) -> Result<Token> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            Err(self.error_at_current(format!(
                "expected {}, found '{}'",
                what, self.current.kind
            )))
        }
    }

    fn expect_identifier(&mut self, what: &str) -> Result<String> {
        match &self.current.kind {
            TokenKind::Identifier(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            other => Err(self.error_at_current(format!("expected {}, found '{}'", what, other))),
        }
    }

    fn is_at_end(&self) -> bool {
        self.check(&TokenKind::Eof)
    }

    // ── Error recovery ───────────────────────────────────────────────

    fn error_at_current(&self, message: impl Into<String>) -> Error {
        Error::syntax(
            message,
            self.current.span,
            self.current.line,
            self.current.column,
        )
    }

    fn report(&mut self, error: Error) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        tracing::debug!(%error, "parse error, entering panic mode");
        self.errors.push(error);
    }

    /// Record `error`, then skip to a synchronization point. `mark` is where
    /// the failed production started; at least one token is always consumed
    /// so recovery makes progress.
    fn recover(&mut self, error: Error, mark: usize, in_rule: bool) {
        self.report(error);
        if self.current.span.start == mark && !self.is_at_end() && !self.check(&TokenKind::RBrace) {
            self.advance();
        }
        self.synchronize(in_rule);
        self.panic_mode = false;
    }

    fn synchronize(&mut self, in_rule: bool) {
        while !self.is_at_end() {
            match self.peek_kind() {
                TokenKind::Semicolon | TokenKind::End => {
                    self.advance();
                    return;
                }
                // Inside a rule the closing brace belongs to the rule.
                TokenKind::RBrace => {
                    if !in_rule {
                        self.advance();
                    }
                    return;
                }
                TokenKind::Rule | TokenKind::If | TokenKind::When => return,
                _ => {
                    self.advance();
                }
            }
        }
    }
}

impl Parser<'_> {
    /// Bare identifiers and strings in consequence position name custom
    /// actions; in golf mode a shorthand letter names its keyword.
    fn into_consequence(&self, node: Node) -> Node {
        let action = match &node.kind {
            NodeKind::Identifier(name) => Some(match self.golf_letter(name) {
                Some(kind) => Node::consequence(kind.to_string(), kind),
                None => Node::consequence(name.clone(), ConsequenceKind::Custom),
            }),
            NodeKind::Literal(Literal::String(action)) => {
                Some(Node::consequence(action.clone(), ConsequenceKind::Custom))
            }
            _ => None,
        };
        match action {
            Some(action) => action.with_span(node.span, node.line),
            None => node,
        }
    }

    /// First operand of `>>` / `->`. Read outside consequence context, a
    /// plain identifier stays a variable so the chain can gate on it.
    fn chain_head(&self, node: Node, ctx: LexContext) -> Node {
        let variable = match &node.kind {
            NodeKind::Identifier(name) => self.golf_letter(name).is_none(),
            _ => false,
        };
        if variable && ctx != LexContext::Consequence {
            node
        } else {
            self.into_consequence(node)
        }
    }

    fn golf_letter(&self, name: &str) -> Option<ConsequenceKind> {
        if !self.lexer.config().golf_mode {
            return None;
        }
        golf_shorthand(name).map(|kind| consequence_kind(&kind))
    }
}

fn consequence_kind(kind: &TokenKind) -> ConsequenceKind {
    match kind {
        TokenKind::Win => ConsequenceKind::Win,
        TokenKind::Lose => ConsequenceKind::Lose,
        TokenKind::Draw => ConsequenceKind::Draw,
        TokenKind::Skip => ConsequenceKind::Skip,
        TokenKind::Fail => ConsequenceKind::Fail,
        _ => ConsequenceKind::Pass,
    }
}

/// Height of a node built by one infix step, whose first operand is the
/// previous left-hand side of known `left_height`.
fn stacked_height(node: &Node, left_height: usize) -> usize {
    let rest = node.child_nodes().skip(1).map(Node::get_depth).max().unwrap_or(0);
    1 + left_height.max(rest)
}

enum Assoc {
    Left,
    Right,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use pretty_assertions::assert_eq;

    fn parse(source: &str) -> Node {
        let mut parser = Parser::new(source);
        let root = parser.parse();
        let errors: Vec<_> = parser.errors().map(|e| e.to_string()).collect();
        assert!(errors.is_empty(), "unexpected errors: {:?}", errors);
        root
    }

    fn parse_golf(source: &str) -> Node {
        let mut parser = Parser::golf(source);
        let root = parser.parse();
        assert!(!parser.had_error());
        root
    }

    fn only_statement(root: &Node) -> &Node {
        assert_eq!(root.children.len(), 1);
        &root.children[0]
    }

    #[test]
    fn test_rule_with_decision() {
        let root = parse("rule r { if x > 5 then win else lose end }");
        let rule = only_statement(&root);
        assert_eq!(rule.to_string(), "rule r { if x > 5 then win else lose end }");
        assert!(root.validate().is_ok());
    }

    #[test]
    fn test_binary_precedence() {
        let root = parse("a + b * c > 10 && !done || flag");
        assert_eq!(only_statement(&root).to_string(), "a + b * c > 10 && !done || flag");
        let dump = only_statement(&root).dump();
        assert!(dump.starts_with("LogicOp(||)\n  LogicOp(&&)\n"));
    }

    #[test]
    fn test_parentheses_override_precedence() {
        let root = parse("(a + b) * c");
        let expr = only_statement(&root);
        assert_eq!(expr.dump(), "Arithmetic(*)\n  Arithmetic(+)\n    Identifier(a)\n    Identifier(b)\n  Identifier(c)\n");
    }

    #[test]
    fn test_bare_decision_and_when() {
        let root = parse("score >= 3 then pass end; when late do \"notify\"");
        assert_eq!(root.children.len(), 2);
        assert_eq!(root.children[0].to_string(), "if score >= 3 then pass end");
        let when = &root.children[1];
        assert_eq!(when.to_string(), "if late then \"notify\" end");
        let NodeKind::Decision { true_branch, .. } = &when.kind else {
            panic!("expected decision");
        };
        let action = true_branch.as_deref().unwrap().as_consequence().unwrap();
        assert_eq!(action.kind, ConsequenceKind::Custom);
    }

    #[test]
    fn test_chain_and_assignment() {
        let root = parse("rule r { if ok then score = score + 1 >> win -> lose end }");
        let rule = only_statement(&root);
        let chain = rule
            .find(|n| matches!(n.kind, NodeKind::Chain { chain_type: ChainType::Parallel, .. }))
            .unwrap();
        assert_eq!(chain.to_string(), "score = score + 1 >> win -> lose");
        let assign = rule.find_consequence("score").unwrap();
        assert_eq!(assign.as_consequence().unwrap().kind, ConsequenceKind::Assign);
    }

    #[test]
    fn test_weighted_consequence() {
        let root = parse("if x then win(0.5) end");
        let win = root.find_consequence("win").unwrap();
        assert_eq!(win.as_consequence().unwrap().weight, 0.5);
    }

    #[test]
    fn test_quantifiers_fold_into_logic() {
        let root = parse("any(a, b, c) && all()");
        assert_eq!(only_statement(&root).to_string(), "(a || b || c) && true");
    }

    #[test]
    fn test_rule_call() {
        let root = parse("rule a { b() } rule b { win }");
        assert!(root.find(|n| matches!(&n.kind, NodeKind::RuleCall(name) if name == "b")).is_some());
    }

    #[test]
    fn test_golf_letters_depend_on_context() {
        let root = parse_golf("rule g { if ready then ok ? W : L end }");
        let ternary = root
            .find(|n| matches!(n.kind, NodeKind::Decision { .. }) && n.label() == "if ok")
            .unwrap();
        let NodeKind::Decision { true_branch, false_branch, .. } = &ternary.kind else {
            unreachable!();
        };
        let kind = |branch: &Option<Box<Node>>| branch.as_deref().unwrap().as_consequence().unwrap().kind;
        assert_eq!(kind(true_branch), ConsequenceKind::Win);
        assert_eq!(kind(false_branch), ConsequenceKind::Lose);
    }

    #[test]
    fn test_golf_letters_in_condition_are_variables() {
        let root = parse_golf("if W > 3 then W end");
        let decision = only_statement(&root);
        let NodeKind::Decision { condition, .. } = &decision.kind else {
            panic!("expected decision");
        };
        assert_eq!(condition.as_deref().unwrap().to_string(), "W > 3");
    }

    #[test]
    fn test_elvis_builds_one_armed_decision() {
        let root = parse_golf("x > 5 ?: W");
        let decision = only_statement(&root);
        let NodeKind::Decision { condition, true_branch, false_branch } = &decision.kind else {
            panic!("expected decision");
        };
        assert_eq!(condition.as_deref().unwrap().to_string(), "x > 5");
        assert!(matches!(true_branch.as_deref().unwrap().kind, NodeKind::Consequence(_)));
        assert!(false_branch.is_none());
        assert_eq!(decision.count_nodes(), 5);
    }

    #[test]
    fn test_golf_letters_without_golf_mode_are_custom() {
        let root = parse("if x then W end");
        let w = root.find_consequence("W").unwrap();
        assert_eq!(w.as_consequence().unwrap().kind, ConsequenceKind::Custom);
    }

    #[test]
    fn test_recovery_keeps_following_rule() {
        let mut parser = Parser::new(
            "rule a { if x > 5 then win }\nrule b { if y < 2 then lose end }",
        );
        let root = parser.parse();
        assert!(parser.had_error());
        let b = root.find_rule("b").expect("rule b survives recovery");
        assert_eq!(b.to_string(), "rule b { if y < 2 then lose end }");
        assert!(root.find_rule("a").is_some());
    }

    #[test]
    fn test_recovery_reports_each_bad_statement() {
        let mut parser = Parser::new("if then win end; x > ; when y do pass");
        let root = parser.parse();
        assert_eq!(parser.error_count(), 2);
        assert_eq!(root.children.len(), 1);
        let first = parser.errors().next().unwrap();
        assert_eq!(first.kind(), ErrorKind::Syntax);
    }

    #[test]
    fn test_stray_tokens_do_not_hang() {
        let mut parser = Parser::new(") ) } rule ok { win }");
        let root = parser.parse();
        assert!(parser.had_error());
        assert!(root.find_rule("ok").is_some());
    }

    #[test]
    fn test_lexer_errors_are_reported() {
        let mut parser = Parser::new("if x & y then win end");
        parser.parse();
        assert!(parser.had_error());
        assert_eq!(parser.errors().next().unwrap().kind(), ErrorKind::Syntax);
    }

    #[test]
    fn test_recursion_depth_is_capped() {
        let source = format!("{}x{}", "(".repeat(300), ")".repeat(300));
        let mut parser = Parser::new(&source);
        parser.parse();
        assert!(parser.had_error());
        assert!(parser.errors().any(|e| e.kind() == ErrorKind::Recursion));
    }

    #[test]
    fn test_configured_depth() {
        let config = ParserConfig { max_recursion_depth: 4 };
        let mut parser = Parser::with_config("((((x))))", LexerConfig::default(), config);
        parser.parse();
        assert!(parser.had_error());

        let mut parser = Parser::with_config("((x))", LexerConfig::default(), config);
        parser.parse();
        assert!(!parser.had_error());
    }

    #[test]
    fn test_golf_bare_condition_keeps_letters() {
        let root = parse_golf("W > 3 then L end");
        let decision = only_statement(&root);
        let NodeKind::Decision { condition, true_branch, .. } = &decision.kind else {
            panic!("expected decision");
        };
        let condition = condition.as_deref().unwrap();
        assert_eq!(condition.dump(), "Comparison(>)\n  Identifier(W)\n  Literal(3)\n");
        let branch = true_branch.as_deref().unwrap().as_consequence().unwrap();
        assert_eq!(branch.kind, ConsequenceKind::Lose);
    }

    #[test]
    fn test_golf_letter_statement_is_consequence() {
        let root = parse_golf("rule g { W; \"log\" >> P }");
        let win = root.find_consequence("win").expect("W becomes win");
        assert_eq!(win.as_consequence().unwrap().kind, ConsequenceKind::Win);
        assert!(root.find_consequence("pass").is_some());
        assert!(root.find(|n| matches!(n.kind, NodeKind::Identifier(_))).is_none());
    }

    #[test]
    fn test_chain_head_context() {
        // In a rule body the head of a chain is a guard variable.
        let root = parse_golf("rule g { ready -> W }");
        let chain = root.find(|n| matches!(n.kind, NodeKind::Chain { .. })).unwrap();
        assert_eq!(chain.dump(), "Chain(Parallel)\n  Identifier(ready)\n  Consequence(win: win)\n");

        // After `then` it names an action, and golf letters stay keywords.
        let root = parse_golf("if ok then notify >> W end");
        let chain = root.find(|n| matches!(n.kind, NodeKind::Chain { .. })).unwrap();
        assert_eq!(
            chain.dump(),
            "Chain(Sequential)\n  Consequence(custom: notify)\n  Consequence(win: win)\n"
        );
        let root = parse_golf("W >> P");
        let chain = only_statement(&root);
        assert_eq!(chain.to_string(), "win >> pass");
    }

    #[test]
    fn test_nested_rules_share_recursion_cap() {
        let nested = |levels: usize| {
            format!("{}win{}", "rule r { ".repeat(levels), " }".repeat(levels))
        };

        let shallow = nested(10);
        let mut parser = Parser::new(&shallow);
        let root = parser.parse();
        assert!(!parser.had_error());
        assert!(root.validate().is_ok());

        for levels in [MAX_RECURSION_DEPTH + 44, 2_000] {
            let source = nested(levels);
            let mut parser = Parser::new(&source);
            let root = parser.parse();
            assert!(parser.errors().any(|e| e.kind() == ErrorKind::Recursion));
            assert!(root.validate().is_ok());
        }
    }

    #[test]
    fn test_flat_chain_height_is_capped() {
        for terms in [3_000, 20_000] {
            let source = format!("x{}", " + x".repeat(terms));
            let mut parser = Parser::new(&source);
            let root = parser.parse();
            assert!(parser.errors().any(|e| e.kind() == ErrorKind::Recursion));
            assert!(root.validate().is_ok());
            assert!(root.get_depth() <= AST_MAX_DEPTH);
        }

        let source = format!("x{}", " + x".repeat(500));
        let root = parse(&source);
        assert_eq!(root.get_depth(), 502);
        assert!(root.validate().is_ok());
    }

    #[test]
    fn test_quantifier_height_is_capped() {
        let args = vec!["a"; AST_MAX_DEPTH + 10].join(", ");
        let source = format!("any({})", args);
        let mut parser = Parser::new(&source);
        let root = parser.parse();
        assert!(parser.errors().any(|e| e.kind() == ErrorKind::Recursion));
        assert!(root.validate().is_ok());
    }

    #[test]
    fn test_spans_cover_decision() {
        let source = "if a then win end";
        let root = parse(source);
        let decision = only_statement(&root);
        assert_eq!(decision.span, Span::new(0, source.len()));
        assert_eq!(decision.line, 1);
    }
}
