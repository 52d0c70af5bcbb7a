/// Token-stream helpers and error recovery.
///
/// This chunk contains the low-level primitives used throughout parsing:
/// - Peeking/consuming tokens (`peek`, `advance`)
/// - Matching / expecting keywords, operators, and punctuation
/// - Error recovery (`synchronize`)
impl<'a> Parser<'a> {
    // ========================================================================
    // Helpers
    // ========================================================================

    /// Return `true` if the current token is [`TokenKind::Eof`].
    fn is_at_end(&self) -> bool {
        matches!(self.peek().kind, TokenKind::Eof)
    }

    /// Return the current token without consuming it.
    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    /// Return the token `n` positions ahead without consuming anything.
    fn peek_at(&self, n: usize) -> &Token {
        let idx = (self.pos + n).min(self.tokens.len() - 1);
        &self.tokens[idx]
    }

    /// Advance to the next token and return the token we just consumed.
    fn advance(&mut self) -> &Token {
        if !self.is_at_end() {
            self.pos += 1;
        }
        &self.tokens[self.pos - 1]
    }

    fn check_keyword(&self, id: KeywordId) -> bool {
        self.peek().kind.is_keyword(id)
    }

    fn check_punct(&self, id: PunctuationId) -> bool {
        self.peek().kind.is_punctuation(id)
    }

    fn check_op(&self, id: OperatorId) -> bool {
        self.peek().kind.is_operator(id)
    }

    fn match_keyword(&mut self, id: KeywordId) -> bool {
        if self.check_keyword(id) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn match_punct(&mut self, id: PunctuationId) -> bool {
        if self.check_punct(id) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn match_op(&mut self, id: OperatorId) -> bool {
        if self.check_op(id) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn unexpected(&self, msg: &str) -> CompileError {
        CompileError::syntax(format!("{}, found {}", msg, describe(&self.peek().kind)), self.peek().span)
    }

    fn expect_keyword(&mut self, id: KeywordId, msg: &str) -> Result<Span, CompileError> {
        if self.check_keyword(id) {
            Ok(self.advance().span)
        } else {
            Err(self.unexpected(msg))
        }
    }

    fn expect_punct(&mut self, id: PunctuationId, msg: &str) -> Result<Span, CompileError> {
        if self.check_punct(id) {
            Ok(self.advance().span)
        } else {
            Err(self.unexpected(msg))
        }
    }

    /// Expect the statement terminator.
    fn expect_semicolon(&mut self, after: &str) -> Result<(), CompileError> {
        if self.match_punct(PunctuationId::Semicolon) {
            Ok(())
        } else {
            Err(self
                .unexpected(&format!("Expected ';' after {}", after))
                .with_hint("Statements in bundle script end with ';'"))
        }
    }

    fn expect_ident(&mut self, msg: &str) -> Result<Ident, CompileError> {
        if let TokenKind::Ident(name) = &self.peek().kind {
            let name = name.clone();
            self.advance();
            Ok(name)
        } else {
            Err(self.unexpected(msg))
        }
    }

    /// Expect a string literal, returning its value and span (quotes included).
    fn expect_string(&mut self, msg: &str) -> Result<(String, Span), CompileError> {
        if let TokenKind::String(value) = &self.peek().kind {
            let value = value.clone();
            let span = self.advance().span;
            Ok((value, span))
        } else {
            Err(self.unexpected(msg))
        }
    }

    /// Skip tokens until a plausible statement boundary.
    ///
    /// Bracketed regions are skipped as a whole. Recovery ends after a `;` at the starting depth,
    /// in front of the `}` closing the enclosing block, or (at the top level) in front of a token
    /// that can only start a top-level item.
    ///
    /// ## Parameters
    /// - `top_level`: Whether the failed statement was a top-level item. Top-level recovery always
    ///   consumes at least one token so the item loop makes progress.
    fn synchronize(&mut self, top_level: bool) {
        let mut depth = 0usize;
        let mut first = top_level;
        while !self.is_at_end() {
            let kind = self.peek().kind.clone();
            match kind.punctuation_id() {
                Some(PunctuationId::LBrace | PunctuationId::LParen | PunctuationId::LBracket) => depth += 1,
                Some(PunctuationId::RBrace) if depth == 0 && !top_level => return,
                Some(PunctuationId::RBrace | PunctuationId::RParen | PunctuationId::RBracket) => {
                    depth = depth.saturating_sub(1);
                }
                Some(PunctuationId::Semicolon) if depth == 0 => {
                    self.advance();
                    return;
                }
                _ if depth == 0 && top_level && !first => {
                    if matches!(
                        kind.keyword_id(),
                        Some(
                            KeywordId::Define
                                | KeywordId::Register
                                | KeywordId::Entry
                                | KeywordId::Import
                                | KeywordId::Export
                        )
                    ) {
                        return;
                    }
                }
                _ => {}
            }
            first = false;
            self.advance();
        }
    }

    fn current_span(&self) -> Span {
        self.peek().span
    }

    /// End offset of the most recently consumed token.
    fn prev_end(&self) -> usize {
        self.tokens[self.pos.saturating_sub(1)].span.end
    }
}

/// Human-readable token description for diagnostics.
fn describe(kind: &TokenKind) -> String {
    use bundletest_core::lang::{keywords, punctuation};

    match kind {
        TokenKind::Keyword(id) => format!("keyword '{}'", keywords::as_str(*id)),
        TokenKind::Operator(id) => format!("'{}'", operators::as_str(*id)),
        TokenKind::Punctuation(id) => format!("'{}'", punctuation::as_str(*id)),
        TokenKind::Ident(name) => format!("identifier '{}'", name),
        TokenKind::Number(n) => format!("number {}", n),
        TokenKind::String(s) => format!("string {:?}", s),
        TokenKind::Eof => "end of file".to_string(),
    }
}
