/// Expression parsing methods.
///
/// Binary operators are parsed by precedence climbing over the `bundletest_core` operator
/// registry; unary, postfix (member, index, call) and primary forms sit below that.
///
/// ## Notes
/// - All binary operators are left-associative.
/// - Arrow functions are recognised by scanning ahead for `=>` after a parameter list.
impl<'a> Parser<'a> {
    // ========================================================================
    // Expressions
    // ========================================================================

    fn expression(&mut self) -> Result<Spanned<Expr>, CompileError> {
        self.binary_expr(1)
    }

    fn binary_expr(&mut self, min_prec: u8) -> Result<Spanned<Expr>, CompileError> {
        let mut left = self.unary_expr()?;

        loop {
            let Some(op_id) = self.peek().kind.operator_id() else {
                break;
            };
            let (Some(prec), Some(op)) = (operators::infix_precedence(op_id), binary_op(op_id)) else {
                break;
            };
            if prec < min_prec {
                break;
            }
            self.advance();
            let right = self.binary_expr(prec + 1)?;
            let span = left.span.merge(right.span);
            left = Spanned::new(
                Expr::Binary(Box::new(left), op, Box::new(right)),
                span,
            );
        }

        Ok(left)
    }

    fn unary_expr(&mut self) -> Result<Spanned<Expr>, CompileError> {
        let start = self.current_span().start;
        let op = if self.match_op(OperatorId::Bang) {
            UnaryOp::Not
        } else if self.match_op(OperatorId::Minus) {
            UnaryOp::Neg
        } else if self.match_keyword(KeywordId::Typeof) {
            UnaryOp::Typeof
        } else {
            return self.postfix_expr();
        };
        let operand = self.unary_expr()?;
        let span = Span::new(start, operand.span.end);
        Ok(Spanned::new(Expr::Unary(op, Box::new(operand)), span))
    }

    fn postfix_expr(&mut self) -> Result<Spanned<Expr>, CompileError> {
        let mut expr = self.primary_expr()?;

        loop {
            if self.match_punct(PunctuationId::Dot) {
                let name = self.member_name()?;
                let span = Span::new(expr.span.start, self.prev_end());
                expr = Spanned::new(Expr::Member(Box::new(expr), name), span);
            } else if self.match_punct(PunctuationId::LBracket) {
                let index = self.expression()?;
                self.expect_punct(PunctuationId::RBracket, "Expected ']' after index")?;
                let span = Span::new(expr.span.start, self.prev_end());
                expr = Spanned::new(Expr::Index(Box::new(expr), Box::new(index)), span);
            } else if self.check_punct(PunctuationId::LParen) {
                let args = self.arguments()?;
                let span = Span::new(expr.span.start, self.prev_end());
                expr = Spanned::new(Expr::Call(Box::new(expr), args), span);
            } else {
                break;
            }
        }

        Ok(expr)
    }

    /// Property name after `.`; reserved words are allowed.
    fn member_name(&mut self) -> Result<Ident, CompileError> {
        let name = self
            .peek()
            .kind
            .property_name()
            .ok_or_else(|| self.unexpected("Expected property name after '.'"))?;
        self.advance();
        Ok(name)
    }

    /// Parse `(arg, ...)`.
    fn arguments(&mut self) -> Result<Vec<Spanned<Expr>>, CompileError> {
        self.expect_punct(PunctuationId::LParen, "Expected '('")?;
        let mut args = Vec::new();
        while !self.check_punct(PunctuationId::RParen) {
            args.push(self.expression()?);
            if !self.match_punct(PunctuationId::Comma) {
                break;
            }
        }
        self.expect_punct(PunctuationId::RParen, "Expected ')' after arguments")?;
        Ok(args)
    }

    fn primary_expr(&mut self) -> Result<Spanned<Expr>, CompileError> {
        let start = self.current_span().start;
        let token = self.peek().clone();

        let expr = match &token.kind {
            TokenKind::Number(n) => {
                self.advance();
                Expr::Number(*n)
            }
            TokenKind::String(s) => {
                self.advance();
                Expr::Str(s.clone())
            }
            TokenKind::Ident(name) => {
                if self.peek_at(1).kind.is_punctuation(PunctuationId::FatArrow) {
                    return self.arrow_function(start);
                }
                self.advance();
                Expr::Ident(name.clone())
            }
            TokenKind::Keyword(KeywordId::True) => {
                self.advance();
                Expr::Bool(true)
            }
            TokenKind::Keyword(KeywordId::False) => {
                self.advance();
                Expr::Bool(false)
            }
            TokenKind::Keyword(KeywordId::Null) => {
                self.advance();
                Expr::Null
            }
            TokenKind::Keyword(KeywordId::Undefined) => {
                self.advance();
                Expr::Undefined
            }
            // AMD `define(...)` calls the host function of that name.
            TokenKind::Keyword(KeywordId::Define) => {
                self.advance();
                Expr::Ident("define".to_string())
            }
            TokenKind::Keyword(KeywordId::Function) => {
                self.advance();
                let name = if let TokenKind::Ident(n) = &self.peek().kind {
                    let n = n.clone();
                    self.advance();
                    Some(n)
                } else {
                    None
                };
                let params = self.param_list()?;
                let body = self.block()?;
                Expr::Function(Rc::new(FunctionDef {
                    name,
                    params,
                    body: Rc::new(body),
                    arrow: false,
                }))
            }
            TokenKind::Keyword(KeywordId::New) => {
                self.advance();
                let callee = self.new_callee()?;
                let args = if self.check_punct(PunctuationId::LParen) {
                    self.arguments()?
                } else {
                    Vec::new()
                };
                Expr::New(Box::new(callee), args)
            }
            TokenKind::Punctuation(PunctuationId::LParen) => {
                if self.is_arrow_ahead() {
                    return self.arrow_function(start);
                }
                self.advance();
                let inner = self.expression()?;
                self.expect_punct(PunctuationId::RParen, "Expected ')' after expression")?;
                // Grouping keeps the inner node; only the span widens.
                return Ok(Spanned::new(inner.node, Span::new(start, self.prev_end())));
            }
            TokenKind::Punctuation(PunctuationId::LBracket) => {
                self.advance();
                let mut elements = Vec::new();
                while !self.check_punct(PunctuationId::RBracket) {
                    elements.push(self.expression()?);
                    if !self.match_punct(PunctuationId::Comma) {
                        break;
                    }
                }
                self.expect_punct(PunctuationId::RBracket, "Expected ']' after array elements")?;
                Expr::Array(elements)
            }
            TokenKind::Punctuation(PunctuationId::LBrace) => {
                self.advance();
                Expr::Object(self.object_fields()?)
            }
            TokenKind::Keyword(KeywordId::Await) => {
                return Err(self
                    .unexpected("Expected expression")
                    .with_hint("`await` is only allowed as `await expr;` or `let x = await expr;`"));
            }
            _ => return Err(self.unexpected("Expected expression")),
        };

        Ok(Spanned::new(expr, Span::new(start, self.prev_end())))
    }

    /// Callee of `new`: a primary followed by member accesses, but no call.
    fn new_callee(&mut self) -> Result<Spanned<Expr>, CompileError> {
        let start = self.current_span().start;
        let name = self.expect_ident("Expected constructor after 'new'")?;
        let mut expr = Spanned::new(Expr::Ident(name), Span::new(start, self.prev_end()));
        while self.match_punct(PunctuationId::Dot) {
            let member = self.member_name()?;
            expr = Spanned::new(
                Expr::Member(Box::new(expr), member),
                Span::new(start, self.prev_end()),
            );
        }
        Ok(expr)
    }

    /// Parse object literal fields after the opening `{`.
    fn object_fields(&mut self) -> Result<Vec<(String, Spanned<Expr>)>, CompileError> {
        let mut fields = Vec::new();
        while !self.check_punct(PunctuationId::RBrace) {
            let key_span = self.current_span();
            let key = match &self.peek().kind {
                TokenKind::String(s) => s.clone(),
                TokenKind::Number(n) => format_number_key(*n),
                other => other
                    .property_name()
                    .ok_or_else(|| self.unexpected("Expected property name"))?,
            };
            let shorthand = matches!(self.peek().kind, TokenKind::Ident(_));
            self.advance();

            let value = if self.match_punct(PunctuationId::Colon) {
                self.expression()?
            } else if shorthand {
                Spanned::new(Expr::Ident(key.clone()), key_span)
            } else {
                return Err(self.unexpected("Expected ':' after property name"));
            };
            fields.push((key, value));

            if !self.match_punct(PunctuationId::Comma) {
                break;
            }
        }
        self.expect_punct(PunctuationId::RBrace, "Expected '}' after object fields")?;
        Ok(fields)
    }

    /// Return `true` if the `(` at the cursor opens an arrow-function parameter list.
    fn is_arrow_ahead(&self) -> bool {
        let mut depth = 0usize;
        let mut i = self.pos;
        while i < self.tokens.len() {
            match self.tokens[i].kind.punctuation_id() {
                Some(PunctuationId::LParen) => depth += 1,
                Some(PunctuationId::RParen) => {
                    depth -= 1;
                    if depth == 0 {
                        return self
                            .tokens
                            .get(i + 1)
                            .is_some_and(|t| t.kind.is_punctuation(PunctuationId::FatArrow));
                    }
                }
                _ => {}
            }
            if matches!(self.tokens[i].kind, TokenKind::Eof) {
                return false;
            }
            i += 1;
        }
        false
    }

    /// Parse `x => body` or `(a, b) => body`.
    fn arrow_function(&mut self, start: usize) -> Result<Spanned<Expr>, CompileError> {
        let params = if self.check_punct(PunctuationId::LParen) {
            self.param_list()?
        } else {
            vec![self.expect_ident("Expected parameter name")?]
        };
        self.expect_punct(PunctuationId::FatArrow, "Expected '=>'")?;

        let body = if self.check_punct(PunctuationId::LBrace) {
            self.block()?
        } else {
            let value = self.expression()?;
            let span = value.span;
            vec![Spanned::new(Statement::Return(Some(value)), span)]
        };

        let def = FunctionDef {
            name: None,
            params,
            body: Rc::new(body),
            arrow: true,
        };
        Ok(Spanned::new(
            Expr::Function(Rc::new(def)),
            Span::new(start, self.prev_end()),
        ))
    }
}

fn binary_op(id: OperatorId) -> Option<BinaryOp> {
    let op = match id {
        OperatorId::Plus => BinaryOp::Add,
        OperatorId::Minus => BinaryOp::Sub,
        OperatorId::Star => BinaryOp::Mul,
        OperatorId::Slash => BinaryOp::Div,
        OperatorId::Percent => BinaryOp::Rem,
        OperatorId::EqEq => BinaryOp::Eq,
        OperatorId::NotEq => BinaryOp::NotEq,
        OperatorId::StrictEq => BinaryOp::StrictEq,
        OperatorId::StrictNotEq => BinaryOp::StrictNotEq,
        OperatorId::Lt => BinaryOp::Lt,
        OperatorId::LtEq => BinaryOp::LtEq,
        OperatorId::Gt => BinaryOp::Gt,
        OperatorId::GtEq => BinaryOp::GtEq,
        OperatorId::AndAnd => BinaryOp::And,
        OperatorId::OrOr => BinaryOp::Or,
        OperatorId::Bang | OperatorId::Eq | OperatorId::PlusEq | OperatorId::MinusEq => return None,
    };
    Some(op)
}

fn format_number_key(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}
