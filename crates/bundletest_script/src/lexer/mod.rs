//! Lexer for bundle script.
//!
//! Handles tokenization including:
//! - Keywords and identifiers (`$` is an identifier character, as in emitted runtime code)
//! - Number and string literals (single or double quoted, with escapes)
//! - Operators and punctuation, including `===`/`!==` and `=>`
//! - Line (`//`) and block (`/* */`) comments
//!
//! Whitespace is insignificant; statements are terminated by `;`.

pub mod tokens;

pub use tokens::{Token, TokenKind, keyword_id};

use crate::ast::Span;
use crate::diagnostics::CompileError;
use bundletest_core::lang::operators::OperatorId;
use bundletest_core::lang::punctuation::PunctuationId;

/// Lexer for bundle-script source code.
pub struct Lexer<'a> {
    source: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    current_pos: usize,
    /// Open brackets, innermost last, for unmatched-bracket diagnostics.
    brackets: Vec<(PunctuationId, usize)>,
    tokens: Vec<Token>,
    errors: Vec<CompileError>,
}

impl<'a> Lexer<'a> {
    /// Create a new lexer for the given source code.
    pub fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().peekable(),
            current_pos: 0,
            brackets: Vec::new(),
            tokens: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Tokenize the entire source code.
    ///
    /// Returns a vector of tokens on success, or a vector of errors on failure.
    /// The token stream always ends with an `Eof` token.
    pub fn tokenize(mut self) -> Result<Vec<Token>, Vec<CompileError>> {
        while !self.is_at_end() {
            self.scan_token();
        }

        if let Some((open, at)) = self.brackets.pop() {
            let close = bundletest_core::lang::punctuation::closing(open)
                .map(bundletest_core::lang::punctuation::as_str)
                .unwrap_or("?");
            self.errors.push(
                CompileError::syntax("Unclosed bracket".to_string(), Span::new(at, at + 1))
                    .with_hint(format!("Add a matching '{}'", close)),
            );
        }

        self.tokens.push(Token::new(
            TokenKind::Eof,
            Span::new(self.current_pos, self.current_pos),
        ));

        if self.errors.is_empty() {
            Ok(self.tokens)
        } else {
            Err(self.errors)
        }
    }

    // ========================================================================
    // Core character handling
    // ========================================================================

    fn is_at_end(&mut self) -> bool {
        self.chars.peek().is_none()
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().map(|(_, c)| *c)
    }

    fn peek_next(&self) -> Option<char> {
        let mut iter = self.source[self.current_pos..].chars();
        iter.next();
        iter.next()
    }

    fn advance(&mut self) -> Option<char> {
        if let Some((pos, c)) = self.chars.next() {
            self.current_pos = pos + c.len_utf8();
            Some(c)
        } else {
            None
        }
    }

    // ========================================================================
    // Main scanning dispatch
    // ========================================================================

    fn scan_token(&mut self) {
        let start = self.current_pos;

        let Some(c) = self.advance() else {
            return;
        };

        match c {
            ' ' | '\t' | '\r' | '\n' => {}

            '/' if self.peek() == Some('/') => {
                while let Some(c) = self.peek() {
                    if c == '\n' {
                        break;
                    }
                    self.advance();
                }
            }
            '/' if self.peek() == Some('*') => self.scan_block_comment(start),

            '+' => self.operator(start, OperatorId::Plus, &[('=', OperatorId::PlusEq)]),
            '-' => self.operator(start, OperatorId::Minus, &[('=', OperatorId::MinusEq)]),
            '*' => self.add_op(OperatorId::Star, start),
            '/' => self.add_op(OperatorId::Slash, start),
            '%' => self.add_op(OperatorId::Percent, start),
            '=' => {
                if self.match_char('=') {
                    if self.match_char('=') {
                        self.add_op(OperatorId::StrictEq, start);
                    } else {
                        self.add_op(OperatorId::EqEq, start);
                    }
                } else if self.match_char('>') {
                    self.add_punct(PunctuationId::FatArrow, start);
                } else {
                    self.add_op(OperatorId::Eq, start);
                }
            }
            '!' => {
                if self.match_char('=') {
                    if self.match_char('=') {
                        self.add_op(OperatorId::StrictNotEq, start);
                    } else {
                        self.add_op(OperatorId::NotEq, start);
                    }
                } else {
                    self.add_op(OperatorId::Bang, start);
                }
            }
            '<' => self.operator(start, OperatorId::Lt, &[('=', OperatorId::LtEq)]),
            '>' => self.operator(start, OperatorId::Gt, &[('=', OperatorId::GtEq)]),
            '&' => {
                if self.match_char('&') {
                    self.add_op(OperatorId::AndAnd, start);
                } else {
                    self.unexpected('&', start);
                }
            }
            '|' => {
                if self.match_char('|') {
                    self.add_op(OperatorId::OrOr, start);
                } else {
                    self.unexpected('|', start);
                }
            }

            ',' => self.add_punct(PunctuationId::Comma, start),
            ':' => self.add_punct(PunctuationId::Colon, start),
            ';' => self.add_punct(PunctuationId::Semicolon, start),
            '.' if self.peek().is_some_and(|c| c.is_ascii_digit()) => self.scan_number(start),
            '.' => self.add_punct(PunctuationId::Dot, start),
            '(' => self.open_bracket(PunctuationId::LParen, start),
            ')' => self.close_bracket(PunctuationId::RParen, start),
            '[' => self.open_bracket(PunctuationId::LBracket, start),
            ']' => self.close_bracket(PunctuationId::RBracket, start),
            '{' => self.open_bracket(PunctuationId::LBrace, start),
            '}' => self.close_bracket(PunctuationId::RBrace, start),

            '"' => self.scan_string(start, '"'),
            '\'' => self.scan_string(start, '\''),

            '0'..='9' => self.scan_number(start),

            _ if is_ident_start(c) => self.scan_identifier(start),

            _ => self.unexpected(c, start),
        }
    }

    // ========================================================================
    // Operator helpers
    // ========================================================================

    fn match_char(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn add_token(&mut self, kind: TokenKind, start: usize) {
        self.tokens.push(Token::new(kind, Span::new(start, self.current_pos)));
    }

    fn add_op(&mut self, id: OperatorId, start: usize) {
        self.add_token(TokenKind::Operator(id), start);
    }

    fn add_punct(&mut self, id: PunctuationId, start: usize) {
        self.add_token(TokenKind::Punctuation(id), start);
    }

    /// Try to match compound operator, fallback to simple.
    fn operator(&mut self, start: usize, simple: OperatorId, compounds: &[(char, OperatorId)]) {
        for (c, id) in compounds {
            if self.match_char(*c) {
                self.add_op(*id, start);
                return;
            }
        }
        self.add_op(simple, start);
    }

    fn unexpected(&mut self, c: char, start: usize) {
        self.errors.push(CompileError::syntax(
            format!("Unexpected character '{}'", c),
            Span::new(start, self.current_pos),
        ));
    }

    fn open_bracket(&mut self, kind: PunctuationId, start: usize) {
        self.brackets.push((kind, start));
        self.add_punct(kind, start);
    }

    /// Emit a closing bracket token, reporting mismatches against the innermost open bracket.
    fn close_bracket(&mut self, kind: PunctuationId, start: usize) {
        use bundletest_core::lang::punctuation::closing;

        match self.brackets.pop() {
            Some((open, _)) if closing(open) == Some(kind) => {}
            Some((open, at)) => {
                self.errors.push(
                    CompileError::syntax(
                        "Mismatched closing bracket".to_string(),
                        Span::new(start, self.current_pos),
                    )
                    .with_note(format!(
                        "'{}' opened at byte {} is still open",
                        bundletest_core::lang::punctuation::as_str(open),
                        at
                    )),
                );
            }
            None => {
                self.errors.push(CompileError::syntax(
                    "Unmatched closing bracket".to_string(),
                    Span::new(start, self.current_pos),
                ));
            }
        }
        self.add_punct(kind, start);
    }

    // ========================================================================
    // Comments, strings and numbers
    // ========================================================================

    fn scan_block_comment(&mut self, start: usize) {
        self.advance(); // '*'
        loop {
            match self.advance() {
                Some('*') if self.peek() == Some('/') => {
                    self.advance();
                    return;
                }
                Some(_) => {}
                None => {
                    self.errors.push(CompileError::syntax(
                        "Unterminated block comment".to_string(),
                        Span::new(start, self.current_pos),
                    ));
                    return;
                }
            }
        }
    }

    fn scan_string(&mut self, start: usize, quote: char) {
        let mut value = String::new();
        loop {
            match self.advance() {
                Some(c) if c == quote => {
                    self.add_token(TokenKind::String(value), start);
                    return;
                }
                Some('\\') => match self.advance() {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some('r') => value.push('\r'),
                    Some('0') => value.push('\0'),
                    Some(other) => value.push(other),
                    None => break,
                },
                Some('\n') | None => break,
                Some(c) => value.push(c),
            }
        }
        self.errors.push(CompileError::syntax(
            "Unterminated string literal".to_string(),
            Span::new(start, self.current_pos),
        ));
    }

    fn scan_number(&mut self, start: usize) {
        while self.peek().is_some_and(|c| c.is_ascii_digit() || c == '_') {
            self.advance();
        }
        if self.peek() == Some('.') && self.peek_next().is_some_and(|c| c.is_ascii_digit()) {
            self.advance();
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.advance();
            }
        }
        if matches!(self.peek(), Some('e') | Some('E')) {
            self.advance();
            if matches!(self.peek(), Some('+') | Some('-')) {
                self.advance();
            }
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.advance();
            }
        }

        let text: String = self.source[start..self.current_pos].chars().filter(|c| *c != '_').collect();
        match text.parse::<f64>() {
            Ok(n) => self.add_token(TokenKind::Number(n), start),
            Err(_) => self.errors.push(CompileError::syntax(
                format!("Invalid number literal '{}'", text),
                Span::new(start, self.current_pos),
            )),
        }
    }

    // ========================================================================
    // Identifier scanning
    // ========================================================================

    fn scan_identifier(&mut self, start: usize) {
        while let Some(c) = self.peek() {
            if is_ident_continue(c) {
                self.advance();
            } else {
                break;
            }
        }

        let spelling = &self.source[start..self.current_pos];

        if let Some(id) = keyword_id(spelling) {
            self.add_token(TokenKind::Keyword(id), start);
        } else {
            self.add_token(TokenKind::Ident(spelling.to_string()), start);
        }
    }
}

// ============================================================================
// Helper functions
// ============================================================================

/// Check if a character can start an identifier (ASCII-only).
fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || c == '$'
}

/// Check if a character can continue an identifier (ASCII-only).
fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '$'
}

/// Convenience function to lex a source string.
///
/// This is a shorthand for `Lexer::new(source).tokenize()`.
#[tracing::instrument(skip_all, fields(source_len = source.len()))]
pub fn lex(source: &str) -> Result<Vec<Token>, Vec<CompileError>> {
    Lexer::new(source).tokenize()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use bundletest_core::lang::keywords::KeywordId;
    use bundletest_core::lang::punctuation::PUNCTUATION;

    #[test]
    fn test_punctuation_registry_parity() {
        for info in PUNCTUATION {
            let tokens = match info.id {
                // Openers and closers are only valid in pairs.
                PunctuationId::LParen => lex("()").unwrap(),
                PunctuationId::RParen => lex("()").unwrap()[1..].to_vec(),
                PunctuationId::LBracket => lex("[]").unwrap(),
                PunctuationId::RBracket => lex("[]").unwrap()[1..].to_vec(),
                PunctuationId::LBrace => lex("{}").unwrap(),
                PunctuationId::RBrace => lex("{}").unwrap()[1..].to_vec(),
                _ => lex(info.canonical).unwrap(),
            };
            assert!(
                tokens[0].kind.is_punctuation(info.id),
                "{:?} lexed as {:?}",
                info.canonical,
                tokens[0].kind
            );
        }
    }

    #[test]
    fn test_strict_equality_is_one_token() {
        let tokens = lex("a === b !== c == d").unwrap();
        assert!(tokens[1].kind.is_operator(OperatorId::StrictEq));
        assert!(tokens[3].kind.is_operator(OperatorId::StrictNotEq));
        assert!(tokens[5].kind.is_operator(OperatorId::EqEq));
    }

    #[test]
    fn test_import_statement() {
        let tokens = lex(r#"import { a as b } from "./dep";"#).unwrap();
        assert!(matches!(tokens[0].kind, TokenKind::Keyword(KeywordId::Import)));
        assert!(tokens[1].kind.is_punctuation(PunctuationId::LBrace));
        assert!(matches!(&tokens[2].kind, TokenKind::Ident(s) if s == "a"));
        assert!(matches!(tokens[3].kind, TokenKind::Keyword(KeywordId::As)));
        assert!(matches!(tokens[6].kind, TokenKind::Keyword(KeywordId::From)));
        assert!(matches!(&tokens[7].kind, TokenKind::String(s) if s == "./dep"));
        // Spans of string tokens cover the quotes; builders rewrite specifiers through them.
        assert_eq!(tokens[7].span, Span::new(23, 30));
    }

    #[test]
    fn test_numbers() {
        let tokens = lex("42 3.5 .5 1e3 1_000").unwrap();
        let nums: Vec<f64> = tokens
            .iter()
            .filter_map(|t| match t.kind {
                TokenKind::Number(n) => Some(n),
                _ => None,
            })
            .collect();
        assert_eq!(nums, vec![42.0, 3.5, 0.5, 1000.0, 1000.0]);
    }

    #[test]
    fn test_member_access_on_integer_literal_is_not_float() {
        let tokens = lex("1.toString").unwrap();
        assert!(matches!(tokens[0].kind, TokenKind::Number(n) if n == 1.0));
        assert!(tokens[1].kind.is_punctuation(PunctuationId::Dot));
    }

    #[test]
    fn test_string_escapes() {
        let tokens = lex(r#"'it\'s' "a\nb""#).unwrap();
        assert!(matches!(&tokens[0].kind, TokenKind::String(s) if s == "it's"));
        assert!(matches!(&tokens[1].kind, TokenKind::String(s) if s == "a\nb"));
    }

    #[test]
    fn test_comments_are_skipped() {
        let tokens = lex("a // line\n/* block\n */ b").unwrap();
        assert_eq!(tokens.len(), 3);
        assert!(matches!(&tokens[1].kind, TokenKind::Ident(s) if s == "b"));
    }

    #[test]
    fn test_unterminated_string() {
        let errors = lex("let s = \"abc;\n").unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("Unterminated string"));
    }

    #[test]
    fn test_unmatched_closing_bracket() {
        let errors = lex(")").unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("Unmatched closing bracket"));

        let errors = lex("(]").unwrap_err();
        assert!(errors[0].message.contains("Mismatched closing bracket"));
    }

    #[test]
    fn test_unclosed_bracket() {
        let errors = lex("define \"a\" {").unwrap_err();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("Unclosed bracket"));
        assert_eq!(errors[0].hints, vec!["Add a matching '}'".to_string()]);
    }

    #[test]
    fn test_dollar_identifiers() {
        let tokens = lex("$hot_runtime$").unwrap();
        assert!(matches!(&tokens[0].kind, TokenKind::Ident(s) if s == "$hot_runtime$"));
    }
}
