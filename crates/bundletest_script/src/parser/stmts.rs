/// Statement parsing methods.
///
/// This chunk parses statement forms (declarations, `if`, `try`, `return`, `throw`, `await`,
/// assignments) and brace-delimited blocks.
///
/// ## Notes
/// - Blocks recover from statement errors locally, so one bad statement inside a module body
///   does not swallow the rest of the file.
impl<'a> Parser<'a> {
    // ========================================================================
    // Statements
    // ========================================================================

    /// Parse `{ statement* }`.
    fn block(&mut self) -> Result<Vec<Spanned<Statement>>, CompileError> {
        self.expect_punct(PunctuationId::LBrace, "Expected '{'")?;
        let mut stmts = Vec::new();
        while !self.check_punct(PunctuationId::RBrace) && !self.is_at_end() {
            match self.statement() {
                Ok(stmt) => stmts.push(stmt),
                Err(e) => {
                    self.errors.push(e);
                    self.synchronize(false);
                }
            }
        }
        self.expect_punct(PunctuationId::RBrace, "Expected '}' to close block")?;
        Ok(stmts)
    }

    /// Parse a block, or a single statement standing in for one (`if (x) return;`).
    fn block_or_statement(&mut self) -> Result<Vec<Spanned<Statement>>, CompileError> {
        if self.check_punct(PunctuationId::LBrace) {
            self.block()
        } else {
            Ok(vec![self.statement()?])
        }
    }

    fn statement(&mut self) -> Result<Spanned<Statement>, CompileError> {
        let start = self.current_span().start;

        let stmt = if self.check_keyword(KeywordId::Let) || self.check_keyword(KeywordId::Const) {
            self.let_or_await_stmt()?
        } else if self.check_keyword(KeywordId::Function) {
            Statement::Function(self.function_decl()?)
        } else if self.check_keyword(KeywordId::Import) {
            self.import_decl()?
        } else if self.check_keyword(KeywordId::Export) {
            self.export_decl()?
        } else if self.check_keyword(KeywordId::If) {
            self.if_stmt()?
        } else if self.check_keyword(KeywordId::Try) {
            self.try_stmt()?
        } else if self.match_keyword(KeywordId::Return) {
            let value = if self.check_punct(PunctuationId::Semicolon) {
                None
            } else {
                Some(self.expression()?)
            };
            self.expect_semicolon("return")?;
            Statement::Return(value)
        } else if self.match_keyword(KeywordId::Throw) {
            let value = self.expression()?;
            self.expect_semicolon("throw")?;
            Statement::Throw(value)
        } else if self.match_keyword(KeywordId::Await) {
            let expr = self.expression()?;
            self.expect_semicolon("await")?;
            Statement::Await(AwaitStmt { binding: None, expr })
        } else if self.at_define_item()
            || self.check_keyword(KeywordId::Register)
            || self.check_keyword(KeywordId::Entry)
        {
            return Err(self
                .unexpected("Expected statement")
                .with_note("Chunk items are only allowed at the top level of an emitted file"));
        } else {
            self.assignment_or_expr_stmt()?
        };

        Ok(Spanned::new(stmt, Span::new(start, self.prev_end())))
    }

    fn decl_kind(&mut self) -> Result<DeclKind, CompileError> {
        if self.match_keyword(KeywordId::Let) {
            Ok(DeclKind::Let)
        } else if self.match_keyword(KeywordId::Const) {
            Ok(DeclKind::Const)
        } else {
            Err(self.unexpected("Expected 'let', 'const' or 'var'"))
        }
    }

    /// Parse `let x = expr;` (also used by `export let`).
    fn let_decl(&mut self) -> Result<LetStmt, CompileError> {
        let kind = self.decl_kind()?;
        let name = self.expect_ident("Expected binding name")?;
        let init = if self.match_op(OperatorId::Eq) {
            Some(self.expression()?)
        } else {
            None
        };
        if kind == DeclKind::Const && init.is_none() {
            return Err(self.unexpected("Missing initializer in const declaration"));
        }
        self.expect_semicolon("declaration")?;
        Ok(LetStmt { kind, name, init })
    }

    /// Parse a declaration, including the `let x = await expr;` suspension form.
    fn let_or_await_stmt(&mut self) -> Result<Statement, CompileError> {
        let is_await = self.peek_at(2).kind.is_operator(OperatorId::Eq)
            && self.peek_at(3).kind.is_keyword(KeywordId::Await);
        if !is_await {
            return Ok(Statement::Let(self.let_decl()?));
        }

        let kind = self.decl_kind()?;
        let name = self.expect_ident("Expected binding name")?;
        self.advance(); // =
        self.advance(); // await
        let expr = self.expression()?;
        self.expect_semicolon("await")?;
        Ok(Statement::Await(AwaitStmt {
            binding: Some((kind, name)),
            expr,
        }))
    }

    fn function_decl(&mut self) -> Result<Rc<FunctionDef>, CompileError> {
        self.expect_keyword(KeywordId::Function, "Expected 'function'")?;
        let name = self.expect_ident("Expected function name")?;
        let params = self.param_list()?;
        let body = self.block()?;
        Ok(Rc::new(FunctionDef {
            name: Some(name),
            params,
            body: Rc::new(body),
            arrow: false,
        }))
    }

    /// Parse `(a, b, c)`.
    fn param_list(&mut self) -> Result<Vec<Ident>, CompileError> {
        self.expect_punct(PunctuationId::LParen, "Expected '(' before parameters")?;
        let mut params = Vec::new();
        while !self.check_punct(PunctuationId::RParen) {
            params.push(self.expect_ident("Expected parameter name")?);
            if !self.match_punct(PunctuationId::Comma) {
                break;
            }
        }
        self.expect_punct(PunctuationId::RParen, "Expected ')' after parameters")?;
        Ok(params)
    }

    fn if_stmt(&mut self) -> Result<Statement, CompileError> {
        self.expect_keyword(KeywordId::If, "Expected 'if'")?;
        self.expect_punct(PunctuationId::LParen, "Expected '(' after 'if'")?;
        let condition = self.expression()?;
        self.expect_punct(PunctuationId::RParen, "Expected ')' after if condition")?;
        let then_body = self.block_or_statement()?;

        let else_body = if self.match_keyword(KeywordId::Else) {
            if self.check_keyword(KeywordId::If) {
                let start = self.current_span().start;
                let nested = self.if_stmt()?;
                Some(vec![Spanned::new(nested, Span::new(start, self.prev_end()))])
            } else {
                Some(self.block_or_statement()?)
            }
        } else {
            None
        };

        Ok(Statement::If(IfStmt {
            condition,
            then_body,
            else_body,
        }))
    }

    fn try_stmt(&mut self) -> Result<Statement, CompileError> {
        self.expect_keyword(KeywordId::Try, "Expected 'try'")?;
        let body = self.block()?;
        self.expect_keyword(KeywordId::Catch, "Expected 'catch' after try block")?;
        let param = if self.match_punct(PunctuationId::LParen) {
            let name = self.expect_ident("Expected catch binding")?;
            self.expect_punct(PunctuationId::RParen, "Expected ')' after catch binding")?;
            Some(name)
        } else {
            None
        };
        let handler = self.block()?;
        Ok(Statement::Try(TryStmt { body, param, handler }))
    }

    fn assignment_or_expr_stmt(&mut self) -> Result<Statement, CompileError> {
        let target = self.expression()?;

        let op = if self.match_op(OperatorId::Eq) {
            Some(AssignOp::Assign)
        } else if self.match_op(OperatorId::PlusEq) {
            Some(AssignOp::Add)
        } else if self.match_op(OperatorId::MinusEq) {
            Some(AssignOp::Sub)
        } else {
            None
        };

        let Some(op) = op else {
            self.expect_semicolon("expression")?;
            return Ok(Statement::Expr(target));
        };

        if !target.node.is_assignable() {
            return Err(CompileError::syntax(
                "Invalid assignment target".to_string(),
                target.span,
            ));
        }
        let value = self.expression()?;
        self.expect_semicolon("assignment")?;
        Ok(Statement::Assign(AssignStmt { target, op, value }))
    }
}
