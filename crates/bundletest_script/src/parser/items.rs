/// Top-level item and module-syntax parsing.
///
/// This chunk parses chunk items (`define`, `register`, `entry`) and the `import` / `export`
/// statement forms.
impl<'a> Parser<'a> {
    // ========================================================================
    // Items
    // ========================================================================

    fn item(&mut self) -> Result<Spanned<Item>, CompileError> {
        let start = self.current_span().start;

        let item = if self.at_define_item() {
            self.advance();
            let (id, id_span) = self.expect_string("Expected module id string after 'define'")?;
            let body = self.block()?;
            Item::Define(ModuleDecl {
                id,
                id_span,
                deps: Vec::new(),
                body: Rc::new(body),
            })
        } else if self.match_keyword(KeywordId::Register) {
            let (id, id_span) = self.expect_string("Expected module id string after 'register'")?;
            let deps = self.dependency_list()?;
            let body = self.block()?;
            Item::Register(ModuleDecl {
                id,
                id_span,
                deps,
                body: Rc::new(body),
            })
        } else if self.match_keyword(KeywordId::Entry) {
            let (id, _) = self.expect_string("Expected module id string after 'entry'")?;
            self.expect_semicolon("entry")?;
            Item::Entry(id)
        } else {
            Item::Statement(self.statement()?)
        };

        Ok(Spanned::new(item, Span::new(start, self.prev_end())))
    }

    /// `define` starts a chunk item unless it is called, as in an AMD `define([...], factory)`.
    fn at_define_item(&self) -> bool {
        self.check_keyword(KeywordId::Define) && !self.peek_at(1).kind.is_punctuation(PunctuationId::LParen)
    }

    /// Parse `["dep", ...]`.
    fn dependency_list(&mut self) -> Result<Vec<String>, CompileError> {
        self.expect_punct(PunctuationId::LBracket, "Expected '[' dependency list after module id")?;
        let mut deps = Vec::new();
        while !self.check_punct(PunctuationId::RBracket) {
            let (dep, _) = self.expect_string("Expected dependency id string")?;
            deps.push(dep);
            if !self.match_punct(PunctuationId::Comma) {
                break;
            }
        }
        self.expect_punct(PunctuationId::RBracket, "Expected ']' after dependency list")?;
        Ok(deps)
    }

    // ========================================================================
    // Module syntax
    // ========================================================================

    fn import_decl(&mut self) -> Result<Statement, CompileError> {
        self.expect_keyword(KeywordId::Import, "Expected 'import'")?;

        let clause = if let TokenKind::String(_) = self.peek().kind {
            ImportClause::SideEffect
        } else if self.match_op(OperatorId::Star) {
            self.expect_keyword(KeywordId::As, "Expected 'as' after '*'")?;
            ImportClause::Namespace(self.expect_ident("Expected namespace name")?)
        } else if self.match_punct(PunctuationId::LBrace) {
            let mut specs = Vec::new();
            while !self.check_punct(PunctuationId::RBrace) {
                let imported = self
                    .peek()
                    .kind
                    .property_name()
                    .ok_or_else(|| self.unexpected("Expected imported name"))?;
                self.advance();
                let local = if self.match_keyword(KeywordId::As) {
                    self.expect_ident("Expected local name after 'as'")?
                } else {
                    imported.clone()
                };
                specs.push(ImportSpecifier { imported, local });
                if !self.match_punct(PunctuationId::Comma) {
                    break;
                }
            }
            self.expect_punct(PunctuationId::RBrace, "Expected '}' after import specifiers")?;
            ImportClause::Named(specs)
        } else {
            ImportClause::Default(self.expect_ident("Expected import binding")?)
        };

        if !matches!(clause, ImportClause::SideEffect) {
            self.expect_keyword(KeywordId::From, "Expected 'from' after import clause")?;
        }
        let (source, source_span) = self.expect_string("Expected module specifier string")?;
        self.expect_semicolon("import")?;

        Ok(Statement::Import(ImportDecl {
            source,
            source_span,
            clause,
        }))
    }

    fn export_decl(&mut self) -> Result<Statement, CompileError> {
        self.expect_keyword(KeywordId::Export, "Expected 'export'")?;

        let decl = if self.match_keyword(KeywordId::Default) {
            let expr = self.expression()?;
            self.expect_semicolon("export default")?;
            ExportDecl::Default(expr)
        } else if self.check_keyword(KeywordId::Let) || self.check_keyword(KeywordId::Const) {
            ExportDecl::Let(self.let_decl()?)
        } else if self.check_keyword(KeywordId::Function) {
            ExportDecl::Function(self.function_decl()?)
        } else if self.match_punct(PunctuationId::LBrace) {
            let mut specs = Vec::new();
            while !self.check_punct(PunctuationId::RBrace) {
                let local = self.expect_ident("Expected exported binding")?;
                let exported = if self.match_keyword(KeywordId::As) {
                    let name = self
                        .peek()
                        .kind
                        .property_name()
                        .ok_or_else(|| self.unexpected("Expected export name after 'as'"))?;
                    self.advance();
                    name
                } else {
                    local.clone()
                };
                specs.push(ExportSpecifier { local, exported });
                if !self.match_punct(PunctuationId::Comma) {
                    break;
                }
            }
            self.expect_punct(PunctuationId::RBrace, "Expected '}' after export specifiers")?;
            self.expect_semicolon("export list")?;
            ExportDecl::Named(specs)
        } else {
            return Err(self
                .unexpected("Expected declaration after 'export'")
                .with_hint("Use `export let`, `export const`, `export function`, `export default` or `export { ... }`"));
        };

        Ok(Statement::Export(decl))
    }
}
