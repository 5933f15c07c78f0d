//! Lexer — Streams tokens from rule source with error recovery.
//!
//! The lexer scans the source string character by character and hands out
//! tokens on demand. Key design decisions:
//!
//! - **Error recovery**: an unexpected character becomes an `Error` token and
//!   scanning resumes at the next character. The stream never aborts, and the
//!   number of error tokens produced is queryable.
//!
//! - **Bounded lookahead**: `peek_token(k)` is backed by a ring of
//!   [`LOOKAHEAD_CAPACITY`] tokens. Asking further ahead yields an `Error`
//!   token instead of growing the buffer.
//!
//! - **Context-sensitive retokenization**: in golf mode the letters
//!   `W L D S F P` are consequence keywords, but only when the caller reads
//!   in consequence or rule-body context. The context is passed with each
//!   request; the lexer keeps no global context state.

use std::collections::VecDeque;

use serde::Deserialize;

use crate::errors::Error;
use crate::token::{golf_shorthand, keyword, LexContext, Span, Token, TokenKind};

pub const LOOKAHEAD_CAPACITY: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LexerConfig {
    /// Recognise golf shorthand letters and the `?:` operator.
    pub golf_mode: bool,
    pub skip_whitespace: bool,
    pub skip_comments: bool,
}

impl Default for LexerConfig {
    fn default() -> Self {
        Self {
            golf_mode: false,
            skip_whitespace: true,
            skip_comments: true,
        }
    }
}

impl LexerConfig {
    pub fn golf() -> Self {
        Self {
            golf_mode: true,
            ..Self::default()
        }
    }
}

pub struct Lexer<'src> {
    source: &'src str,
    chars: Vec<char>,
    config: LexerConfig,
    start: usize,    // Start of current token (byte offset)
    current: usize,  // Current position (char index)
    byte_pos: usize, // Current byte position
    line: usize,
    column: usize,
    start_line: usize,
    start_column: usize,
    lookahead: VecDeque<Token>,
    errors: Vec<Error>,
}

impl<'src> Lexer<'src> {
    pub fn new(source: &'src str) -> Self {
        Self::with_config(source, LexerConfig::default())
    }

    pub fn with_config(source: &'src str, config: LexerConfig) -> Self {
        Self {
            source,
            chars: source.chars().collect(),
            config,
            start: 0,
            current: 0,
            byte_pos: 0,
            line: 1,
            column: 1,
            start_line: 1,
            start_column: 1,
            lookahead: VecDeque::with_capacity(LOOKAHEAD_CAPACITY),
            errors: Vec::new(),
        }
    }

    pub fn config(&self) -> &LexerConfig {
        &self.config
    }

    pub fn source(&self) -> &'src str {
        self.source
    }

    /// Consume and return the next token in condition context.
    pub fn next_token(&mut self) -> Token {
        match self.lookahead.pop_front() {
            Some(token) => token,
            None => self.scan_token(),
        }
    }

    /// Consume the next token, reinterpreting it for `context`.
    pub fn next_context_token(&mut self, context: LexContext) -> Token {
        let token = self.next_token();
        self.retokenize(token, context)
    }

    /// Return the `k`-th upcoming token (1-based) without consuming it.
    pub fn peek_token(&mut self, k: usize) -> Token {
        if k == 0 || k > LOOKAHEAD_CAPACITY {
            let message = format!(
                "lookahead of {} exceeds buffer capacity {}",
                k, LOOKAHEAD_CAPACITY
            );
            let at = Span::new(self.byte_pos, self.byte_pos);
            return Token::new(TokenKind::Error(message), "", at, self.line, self.column);
        }
        while self.lookahead.len() < k {
            let token = self.scan_token();
            self.lookahead.push_back(token);
        }
        self.lookahead[k - 1].clone()
    }

    /// Reinterpret an already-scanned token for a grammar context. Only golf
    /// shorthand letters are affected, and only in consequence context.
    pub fn retokenize(&self, token: Token, context: LexContext) -> Token {
        if !self.config.golf_mode || context != LexContext::Consequence {
            return token;
        }
        match &token.kind {
            TokenKind::Identifier(name) => match golf_shorthand(name) {
                Some(kind) => Token { kind, ..token },
                None => token,
            },
            _ => token,
        }
    }

    /// Scan the whole input. The last token is always `Eof`.
    pub fn scan_tokens(&mut self) -> Vec<Token> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token();
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                return tokens;
            }
        }
    }

    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    pub fn had_error(&self) -> bool {
        !self.errors.is_empty()
    }

    // ── Scanning ─────────────────────────────────────────────────────

    fn scan_token(&mut self) -> Token {
        loop {
            self.begin_token();
            if self.is_at_end() {
                return self.make_token(TokenKind::Eof);
            }

            let c = self.peek();
            if c == '\n' || c.is_whitespace() {
                let kind = self.whitespace();
                if self.config.skip_whitespace {
                    continue;
                }
                return self.make_token(kind);
            }

            let starts_comment = c == '#'
                || (c == '/' && (self.peek_next() == '/' || self.peek_next() == '*'));
            if starts_comment {
                if let Some(error) = self.comment() {
                    return error;
                }
                if self.config.skip_comments {
                    continue;
                }
                return self.make_token(TokenKind::Comment);
            }

            return self.scan_significant();
        }
    }

    fn whitespace(&mut self) -> TokenKind {
        if self.peek() == '\n' {
            self.advance();
            return TokenKind::Newline;
        }
        while !self.is_at_end() && self.peek() != '\n' && self.peek().is_whitespace() {
            self.advance();
        }
        TokenKind::Whitespace
    }

    /// Consume a comment. Returns an error token for an unterminated block.
    fn comment(&mut self) -> Option<Token> {
        if self.peek() == '/' && self.peek_next() == '*' {
            self.advance();
            self.advance();
            while !self.is_at_end() {
                if self.peek() == '*' && self.peek_next() == '/' {
                    self.advance();
                    self.advance();
                    return None;
                }
                self.advance();
            }
            return Some(self.error_token("unterminated block comment".to_string()));
        }
        while !self.is_at_end() && self.peek() != '\n' {
            self.advance();
        }
        None
    }

    fn scan_significant(&mut self) -> Token {
        let c = self.advance();
        match c {
            '(' => self.make_token(TokenKind::LParen),
            ')' => self.make_token(TokenKind::RParen),
            '{' => self.make_token(TokenKind::LBrace),
            '}' => self.make_token(TokenKind::RBrace),
            ',' => self.make_token(TokenKind::Comma),
            ';' => self.make_token(TokenKind::Semicolon),
            ':' => self.make_token(TokenKind::Colon),
            '+' => self.make_token(TokenKind::Plus),
            '*' => self.make_token(TokenKind::Star),
            '/' => self.make_token(TokenKind::Slash),
            '%' => self.make_token(TokenKind::Percent),

            '?' => {
                if self.config.golf_mode && self.match_char(':') {
                    self.make_token(TokenKind::Elvis)
                } else {
                    self.make_token(TokenKind::Question)
                }
            }

            '-' => {
                if self.match_char('>') {
                    self.make_token(TokenKind::Arrow)
                } else {
                    self.make_token(TokenKind::Minus)
                }
            }

            '=' => {
                if self.match_char('=') {
                    self.make_token(TokenKind::EqEq)
                } else if self.match_char('>') {
                    self.make_token(TokenKind::FatArrow)
                } else {
                    self.make_token(TokenKind::Eq)
                }
            }

            '!' => {
                if self.match_char('=') {
                    self.make_token(TokenKind::BangEq)
                } else {
                    self.make_token(TokenKind::Bang)
                }
            }

            '<' => {
                if self.match_char('=') {
                    self.make_token(TokenKind::LtEq)
                } else {
                    self.make_token(TokenKind::Lt)
                }
            }

            '>' => {
                if self.match_char('=') {
                    self.make_token(TokenKind::GtEq)
                } else if self.match_char('>') {
                    self.make_token(TokenKind::Chain)
                } else {
                    self.make_token(TokenKind::Gt)
                }
            }

            '&' => {
                if self.match_char('&') {
                    self.make_token(TokenKind::And)
                } else {
                    self.error_token("unexpected '&', did you mean '&&'?".to_string())
                }
            }

            '|' => {
                if self.match_char('|') {
                    self.make_token(TokenKind::Or)
                } else {
                    self.error_token("unexpected '|', did you mean '||'?".to_string())
                }
            }

            '"' | '\'' => self.string(c),

            c if c.is_ascii_digit() => self.number(c),

            '.' if self.peek().is_ascii_digit() => self.number(c),

            c if c.is_alphabetic() || c == '_' => self.identifier(),

            _ => self.error_token(format!("unexpected character '{}'", c)),
        }
    }

    // ── Literal scanners ─────────────────────────────────────────────

    fn string(&mut self, quote: char) -> Token {
        let mut value = String::new();
        let mut bad_escape: Option<String> = None;

        while !self.is_at_end() && self.peek() != quote {
            let c = self.advance();
            if c != '\\' {
                value.push(c);
                continue;
            }
            if self.is_at_end() {
                break;
            }
            match self.advance() {
                'n' => value.push('\n'),
                't' => value.push('\t'),
                'r' => value.push('\r'),
                '0' => value.push('\0'),
                '\\' => value.push('\\'),
                '"' => value.push('"'),
                '\'' => value.push('\''),
                'u' => match self.unicode_escape() {
                    Some(ch) => value.push(ch),
                    None => {
                        bad_escape.get_or_insert_with(|| "invalid unicode escape".to_string());
                    }
                },
                other => {
                    bad_escape.get_or_insert_with(|| format!("unknown escape sequence '\\{}'", other));
                }
            }
        }

        if self.is_at_end() {
            return self.error_token("unterminated string".to_string());
        }

        self.advance(); // closing quote
        match bad_escape {
            Some(message) => self.error_token(message),
            None => self.make_token(TokenKind::Str(value)),
        }
    }

    /// Parse the `{XXXX}` part of a `\u{XXXX}` escape.
    fn unicode_escape(&mut self) -> Option<char> {
        if !self.match_char('{') {
            return None;
        }
        let mut digits = String::new();
        while !self.is_at_end() && self.peek().is_ascii_hexdigit() && digits.len() < 6 {
            digits.push(self.advance());
        }
        if !self.match_char('}') {
            return None;
        }
        u32::from_str_radix(&digits, 16).ok().and_then(char::from_u32)
    }

    fn number(&mut self, first: char) -> Token {
        if first == '0' && matches!(self.peek(), 'x' | 'X') {
            self.advance();
            return self.radix_number(16, "hex");
        }
        if first == '0' && matches!(self.peek(), 'b' | 'B') {
            self.advance();
            return self.radix_number(2, "binary");
        }

        let mut s = String::new();
        s.push(first);
        while !self.is_at_end() && self.peek().is_ascii_digit() {
            s.push(self.advance());
        }

        // Check for fractional part
        if first != '.' && self.peek() == '.' && self.peek_next().is_ascii_digit() {
            s.push(self.advance());
        }
        while !self.is_at_end() && self.peek().is_ascii_digit() {
            s.push(self.advance());
        }

        // Check for exponent
        if matches!(self.peek(), 'e' | 'E') {
            s.push(self.advance());
            if matches!(self.peek(), '+' | '-') {
                s.push(self.advance());
            }
            if !self.peek().is_ascii_digit() {
                return self.error_token(format!("incomplete exponent in '{}'", s));
            }
            while !self.is_at_end() && self.peek().is_ascii_digit() {
                s.push(self.advance());
            }
        }

        match s.parse::<f64>() {
            Ok(n) => self.make_token(TokenKind::Number(n)),
            Err(_) => self.error_token(format!("invalid number literal '{}'", s)),
        }
    }

    fn radix_number(&mut self, radix: u32, name: &str) -> Token {
        let mut digits = String::new();
        while !self.is_at_end() && self.peek().is_digit(radix) {
            digits.push(self.advance());
        }
        if digits.is_empty() {
            return self.error_token(format!("incomplete {} literal", name));
        }
        match u64::from_str_radix(&digits, radix) {
            Ok(n) => self.make_token(TokenKind::Number(n as f64)),
            Err(_) => self.error_token(format!("{} literal '{}' out of range", name, digits)),
        }
    }

    fn identifier(&mut self) -> Token {
        while !self.is_at_end() && (self.peek().is_alphanumeric() || self.peek() == '_') {
            self.advance();
        }
        let text = self.lexeme();
        let kind = keyword(text).unwrap_or_else(|| TokenKind::Identifier(text.to_string()));
        self.make_token(kind)
    }

    // ── Character-level helpers ──────────────────────────────────────

    fn begin_token(&mut self) {
        self.start = self.byte_pos;
        self.start_line = self.line;
        self.start_column = self.column;
    }

    fn advance(&mut self) -> char {
        let c = self.chars[self.current];
        self.current += 1;
        self.byte_pos += c.len_utf8();
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        c
    }

    fn peek(&self) -> char {
        if self.is_at_end() {
            '\0'
        } else {
            self.chars[self.current]
        }
    }

    fn peek_next(&self) -> char {
        if self.current + 1 >= self.chars.len() {
            '\0'
        } else {
            self.chars[self.current + 1]
        }
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.is_at_end() || self.chars[self.current] != expected {
            return false;
        }
        self.advance();
        true
    }

    fn is_at_end(&self) -> bool {
        self.current >= self.chars.len()
    }

    fn lexeme(&self) -> &'src str {
        &self.source[self.start..self.byte_pos]
    }

    fn make_token(&self, kind: TokenKind) -> Token {
        Token::new(
            kind,
            self.lexeme(),
            Span::new(self.start, self.byte_pos),
            self.start_line,
            self.start_column,
        )
    }

    fn error_token(&mut self, message: String) -> Token {
        tracing::debug!(
            line = self.start_line,
            column = self.start_column,
            "lexer error: {}",
            message
        );
        let span = Span::new(self.start, self.byte_pos);
        self.errors.push(Error::syntax(
            message.clone(),
            span,
            self.start_line,
            self.start_column,
        ));
        self.make_token(TokenKind::Error(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn lex_with(source: &str, config: LexerConfig) -> Vec<TokenKind> {
        let mut lexer = Lexer::with_config(source, config);
        let tokens = lexer.scan_tokens();
        assert!(lexer.errors().is_empty(), "Lexer errors: {:?}", lexer.errors());
        tokens.into_iter().map(|t| t.kind).collect()
    }

    fn lex(source: &str) -> Vec<TokenKind> {
        lex_with(source, LexerConfig::default())
    }

    #[test]
    fn test_numbers() {
        assert_eq!(lex("42"), vec![TokenKind::Number(42.0), TokenKind::Eof]);
        assert_eq!(lex("3.25"), vec![TokenKind::Number(3.25), TokenKind::Eof]);
        assert_eq!(lex("1e3"), vec![TokenKind::Number(1000.0), TokenKind::Eof]);
        assert_eq!(lex("2.5E-1"), vec![TokenKind::Number(0.25), TokenKind::Eof]);
        assert_eq!(lex("0x1F"), vec![TokenKind::Number(31.0), TokenKind::Eof]);
        assert_eq!(lex("0b101"), vec![TokenKind::Number(5.0), TokenKind::Eof]);
    }

    #[test]
    fn test_incomplete_prefix_is_error() {
        let mut lexer = Lexer::new("0x + 1");
        let tokens = lexer.scan_tokens();
        assert!(tokens[0].is_error());
        assert_eq!(tokens[1].kind, TokenKind::Plus);
        assert_eq!(tokens[2].kind, TokenKind::Number(1.0));
        assert_eq!(lexer.error_count(), 1);

        let mut lexer = Lexer::new("1e");
        assert!(lexer.next_token().is_error());
    }

    #[test]
    fn test_strings() {
        assert_eq!(
            lex(r#""hello""#),
            vec![TokenKind::Str("hello".into()), TokenKind::Eof]
        );
        assert_eq!(
            lex(r#""line\nbreak\t\"q\"""#),
            vec![TokenKind::Str("line\nbreak\t\"q\"".into()), TokenKind::Eof]
        );
        assert_eq!(
            lex(r"'\u{41}b'"),
            vec![TokenKind::Str("Ab".into()), TokenKind::Eof]
        );
    }

    #[test]
    fn test_unterminated_string_is_error_token() {
        let mut lexer = Lexer::new("\"never closed");
        let tokens = lexer.scan_tokens();
        assert_eq!(tokens.len(), 2);
        assert_eq!(
            tokens[0].kind,
            TokenKind::Error("unterminated string".into())
        );
        assert_eq!(tokens[1].kind, TokenKind::Eof);
        assert!(lexer.had_error());
    }

    #[test]
    fn test_unknown_escape_is_error_token() {
        let mut lexer = Lexer::new(r#""a\qb" x"#);
        let tokens = lexer.scan_tokens();
        assert!(tokens[0].is_error());
        assert_eq!(tokens[1].kind, TokenKind::Identifier("x".into()));
    }

    #[test]
    fn test_keyword_precedence() {
        assert_eq!(lex("true"), vec![TokenKind::True, TokenKind::Eof]);
        assert_eq!(
            lex("truex"),
            vec![TokenKind::Identifier("truex".into()), TokenKind::Eof]
        );
        assert_eq!(
            lex("rule if then else end when do"),
            vec![
                TokenKind::Rule,
                TokenKind::If,
                TokenKind::Then,
                TokenKind::Else,
                TokenKind::End,
                TokenKind::When,
                TokenKind::Do,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_golf_keywords_are_first_class() {
        assert_eq!(
            lex("win lose draw skip fail pass _ any all"),
            vec![
                TokenKind::Win,
                TokenKind::Lose,
                TokenKind::Draw,
                TokenKind::Skip,
                TokenKind::Fail,
                TokenKind::Pass,
                TokenKind::Underscore,
                TokenKind::Any,
                TokenKind::All,
                TokenKind::Eof,
            ]
        );
        assert_eq!(
            lex("_x"),
            vec![TokenKind::Identifier("_x".into()), TokenKind::Eof]
        );
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            lex("? : && || ! >> -> => = == != < <= > >="),
            vec![
                TokenKind::Question,
                TokenKind::Colon,
                TokenKind::And,
                TokenKind::Or,
                TokenKind::Bang,
                TokenKind::Chain,
                TokenKind::Arrow,
                TokenKind::FatArrow,
                TokenKind::Eq,
                TokenKind::EqEq,
                TokenKind::BangEq,
                TokenKind::Lt,
                TokenKind::LtEq,
                TokenKind::Gt,
                TokenKind::GtEq,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_elvis_only_in_golf_mode() {
        assert_eq!(
            lex("a ?: b")[1..3],
            [TokenKind::Question, TokenKind::Colon]
        );
        assert_eq!(lex_with("a ?: b", LexerConfig::golf())[1], TokenKind::Elvis);
    }

    #[test]
    fn test_comments() {
        assert_eq!(
            lex("42 // line comment\n 7 # hash comment\n 8 /* block */ 9"),
            vec![
                TokenKind::Number(42.0),
                TokenKind::Number(7.0),
                TokenKind::Number(8.0),
                TokenKind::Number(9.0),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_trivia_kept_when_not_skipped() {
        let config = LexerConfig {
            skip_whitespace: false,
            skip_comments: false,
            ..LexerConfig::default()
        };
        assert_eq!(
            lex_with("a # note\nb", config),
            vec![
                TokenKind::Identifier("a".into()),
                TokenKind::Whitespace,
                TokenKind::Comment,
                TokenKind::Newline,
                TokenKind::Identifier("b".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_error_recovery() {
        let mut lexer = Lexer::new("42 @ 7 $");
        let tokens = lexer.scan_tokens();
        let kinds: Vec<_> = tokens.iter().map(|t| t.kind.clone()).collect();
        assert_eq!(kinds.len(), 5); // 42, error, 7, error, EOF
        assert_eq!(kinds[2], TokenKind::Number(7.0));
        assert_eq!(lexer.error_count(), 2);
    }

    #[test]
    fn test_positions() {
        let mut lexer = Lexer::new("rule r {\n  win\n}");
        let tokens = lexer.scan_tokens();
        let win = &tokens[3];
        assert_eq!(win.kind, TokenKind::Win);
        assert_eq!((win.line, win.column), (2, 3));
        assert_eq!(win.text, "win");
        assert_eq!(win.len(), 3);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut lexer = Lexer::new("a b c d");
        assert_eq!(lexer.peek_token(2).kind, TokenKind::Identifier("b".into()));
        assert_eq!(lexer.peek_token(3).kind, TokenKind::Identifier("c".into()));
        assert_eq!(lexer.next_token().kind, TokenKind::Identifier("a".into()));
        assert_eq!(lexer.next_token().kind, TokenKind::Identifier("b".into()));
        assert_eq!(lexer.peek_token(2).kind, TokenKind::Identifier("d".into()));
    }

    #[test]
    fn test_peek_beyond_ring_fails() {
        let mut lexer = Lexer::new("a b c d e");
        assert!(lexer.peek_token(LOOKAHEAD_CAPACITY + 1).is_error());
        assert!(lexer.peek_token(0).is_error());
        // The stream itself is untouched.
        assert_eq!(lexer.next_token().kind, TokenKind::Identifier("a".into()));
        assert_eq!(lexer.error_count(), 0);
    }

    #[test]
    fn test_context_retokenization() {
        let mut lexer = Lexer::with_config("W W", LexerConfig::golf());
        assert_eq!(
            lexer.next_context_token(LexContext::Condition).kind,
            TokenKind::Identifier("W".into())
        );
        assert_eq!(
            lexer.next_context_token(LexContext::Consequence).kind,
            TokenKind::Win
        );

        // Without golf mode the letter is always an identifier.
        let mut lexer = Lexer::new("L");
        assert_eq!(
            lexer.next_context_token(LexContext::Consequence).kind,
            TokenKind::Identifier("L".into())
        );
    }

    #[test]
    fn test_rule_body_context_keeps_letters() {
        // A statement may still turn out to be a condition, so the parser
        // decides once it has seen whether `then` follows.
        let mut lexer = Lexer::with_config("W", LexerConfig::golf());
        assert_eq!(
            lexer.next_context_token(LexContext::RuleBody).kind,
            TokenKind::Identifier("W".into())
        );
    }

    #[test]
    fn test_independent_lexers_do_not_share_context() {
        let mut outer = Lexer::with_config("P P", LexerConfig::golf());
        let mut inner = Lexer::with_config("P", LexerConfig::golf());
        assert_eq!(outer.next_context_token(LexContext::Consequence).kind, TokenKind::Pass);
        assert_eq!(
            inner.next_context_token(LexContext::Condition).kind,
            TokenKind::Identifier("P".into())
        );
        assert_eq!(outer.next_context_token(LexContext::Consequence).kind, TokenKind::Pass);
    }

    #[test]
    fn test_eof_is_sticky() {
        let mut lexer = Lexer::new("");
        assert_eq!(lexer.next_token().kind, TokenKind::Eof);
        assert_eq!(lexer.next_token().kind, TokenKind::Eof);
    }

    proptest::proptest! {
        #[test]
        fn prop_scan_always_terminates_with_eof(source in "\\PC{0,64}") {
            let mut lexer = Lexer::with_config(&source, LexerConfig::golf());
            let tokens = lexer.scan_tokens();
            proptest::prop_assert_eq!(&tokens.last().map(|t| t.kind.clone()), &Some(TokenKind::Eof));
            let error_tokens = tokens.iter().filter(|t| t.is_error()).count();
            proptest::prop_assert_eq!(error_tokens, lexer.error_count());
        }
    }
}
