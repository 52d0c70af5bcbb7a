//! Module-specifier discovery.
//!
//! Builders need to know every place a source refers to another module so they can resolve and rewrite it:
//! `import ... from "x"`, `require("x")`, the dependency array of an AMD `define([...], factory)` and the dependency
//! arguments of `module.hot.accept` / `module.hot.decline`.
//! Spans cover the string literal including its quotes, so a builder can splice a replacement literal in place.

use crate::ast::*;
use std::collections::BTreeSet;

/// Where a specifier appeared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecifierKind {
    Import,
    Require,
    /// Argument of `module.hot.accept(...)` / `module.hot.decline(...)`.
    HotDependency,
    /// Entry of the dependency array of an AMD `define(...)`.
    AmdDependency,
}

/// AMD dependencies the runtime supplies itself rather than resolving.
pub const AMD_PSEUDO_DEPENDENCIES: [&str; 3] = ["require", "exports", "module"];

/// One reference to another module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecifierRef {
    pub value: String,
    pub span: Span,
    pub kind: SpecifierKind,
}

/// Collect every module reference in source order.
pub fn collect(program: &Program) -> Vec<SpecifierRef> {
    let mut out = Vec::new();
    for item in &program.items {
        match &item.node {
            Item::Statement(stmt) => visit_statement(stmt, &mut out),
            Item::Define(m) | Item::Register(m) => visit_body(&m.body, &mut out),
            Item::Entry(_) => {}
        }
    }
    out.sort_by_key(|s| s.span.start);
    out
}

/// Names a plain source module exports through `export` syntax.
pub fn exported_names(program: &Program) -> BTreeSet<String> {
    program
        .items
        .iter()
        .filter_map(|item| match &item.node {
            Item::Statement(Spanned {
                node: Statement::Export(decl),
                ..
            }) => Some(decl.exported_names()),
            _ => None,
        })
        .flatten()
        .map(str::to_string)
        .collect()
}

/// Return `true` if a plain source module uses `import`/`export` syntax at its top level.
pub fn uses_module_syntax(program: &Program) -> bool {
    program.items.iter().any(|item| {
        matches!(
            &item.node,
            Item::Statement(Spanned {
                node: Statement::Import(_) | Statement::Export(_),
                ..
            })
        )
    })
}

fn visit_body(stmts: &[Spanned<Statement>], out: &mut Vec<SpecifierRef>) {
    for stmt in stmts {
        visit_statement(stmt, out);
    }
}

fn visit_statement(stmt: &Spanned<Statement>, out: &mut Vec<SpecifierRef>) {
    match &stmt.node {
        Statement::Import(decl) => out.push(SpecifierRef {
            value: decl.source.clone(),
            span: decl.source_span,
            kind: SpecifierKind::Import,
        }),
        Statement::Let(l) => visit_opt(l.init.as_ref(), out),
        Statement::Function(f) => visit_body(&f.body, out),
        Statement::Export(decl) => match decl {
            ExportDecl::Let(l) => visit_opt(l.init.as_ref(), out),
            ExportDecl::Function(f) => visit_body(&f.body, out),
            ExportDecl::Default(e) => visit_expr(e, out),
            ExportDecl::Named(_) => {}
        },
        Statement::If(s) => {
            visit_expr(&s.condition, out);
            visit_body(&s.then_body, out);
            if let Some(else_body) = &s.else_body {
                visit_body(else_body, out);
            }
        }
        Statement::Return(value) => visit_opt(value.as_ref(), out),
        Statement::Throw(e) | Statement::Expr(e) => visit_expr(e, out),
        Statement::Try(t) => {
            visit_body(&t.body, out);
            visit_body(&t.handler, out);
        }
        Statement::Assign(a) => {
            visit_expr(&a.target, out);
            visit_expr(&a.value, out);
        }
        Statement::Await(a) => visit_expr(&a.expr, out),
    }
}

fn visit_opt(expr: Option<&Spanned<Expr>>, out: &mut Vec<SpecifierRef>) {
    if let Some(e) = expr {
        visit_expr(e, out);
    }
}

fn visit_expr(expr: &Spanned<Expr>, out: &mut Vec<SpecifierRef>) {
    match &expr.node {
        Expr::Call(callee, args) => {
            if matches!(&callee.node, Expr::Ident(name) if name == "define") {
                amd_dependencies(args, out);
            }
            if let Some(kind) = specifier_call(&callee.node) {
                let first = args.first();
                match first.map(|a| &a.node) {
                    Some(Expr::Str(value)) => out.push(SpecifierRef {
                        value: value.clone(),
                        span: args[0].span,
                        kind,
                    }),
                    Some(Expr::Array(items)) if kind == SpecifierKind::HotDependency => {
                        for item in items {
                            if let Expr::Str(value) = &item.node {
                                out.push(SpecifierRef {
                                    value: value.clone(),
                                    span: item.span,
                                    kind,
                                });
                            }
                        }
                    }
                    _ => {}
                }
            }
            visit_expr(callee, out);
            for arg in args {
                visit_expr(arg, out);
            }
        }
        Expr::New(callee, args) => {
            visit_expr(callee, out);
            for arg in args {
                visit_expr(arg, out);
            }
        }
        Expr::Member(obj, _) => visit_expr(obj, out),
        Expr::Index(obj, idx) => {
            visit_expr(obj, out);
            visit_expr(idx, out);
        }
        Expr::Object(fields) => {
            for (_, value) in fields {
                visit_expr(value, out);
            }
        }
        Expr::Array(items) => {
            for item in items {
                visit_expr(item, out);
            }
        }
        Expr::Function(f) => visit_body(&f.body, out),
        Expr::Unary(_, e) => visit_expr(e, out),
        Expr::Binary(l, _, r) => {
            visit_expr(l, out);
            visit_expr(r, out);
        }
        Expr::Number(_) | Expr::Str(_) | Expr::Bool(_) | Expr::Null | Expr::Undefined | Expr::Ident(_) => {}
    }
}

/// `define(deps, factory)` or `define("id", deps, factory)`.
fn amd_dependencies(args: &[Spanned<Expr>], out: &mut Vec<SpecifierRef>) {
    let Some(items) = args.iter().take(2).find_map(|a| match &a.node {
        Expr::Array(items) => Some(items),
        _ => None,
    }) else {
        return;
    };
    for item in items {
        if let Expr::Str(value) = &item.node {
            if !AMD_PSEUDO_DEPENDENCIES.contains(&value.as_str()) {
                out.push(SpecifierRef {
                    value: value.clone(),
                    span: item.span,
                    kind: SpecifierKind::AmdDependency,
                });
            }
        }
    }
}

/// Classify a callee that takes a module specifier as its first argument.
fn specifier_call(callee: &Expr) -> Option<SpecifierKind> {
    match callee {
        Expr::Ident(name) if name == "require" => Some(SpecifierKind::Require),
        Expr::Member(obj, method) if method == "accept" || method == "decline" => match &obj.node {
            Expr::Member(module, hot) if hot == "hot" => {
                matches!(&module.node, Expr::Ident(m) if m == "module").then_some(SpecifierKind::HotDependency)
            }
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_source;

    #[test]
    fn test_collects_imports_requires_and_hot_dependencies() {
        let src = r#"
import a from "./a";
const b = require("./b");
if (module.hot) {
  module.hot.accept(["./a", "./c"], function () {});
  module.hot.decline("./d");
}
"#;
        let program = parse_source(src).unwrap();
        let refs = collect(&program);
        let values: Vec<_> = refs.iter().map(|r| (r.value.as_str(), r.kind)).collect();
        assert_eq!(
            values,
            vec![
                ("./a", SpecifierKind::Import),
                ("./b", SpecifierKind::Require),
                ("./a", SpecifierKind::HotDependency),
                ("./c", SpecifierKind::HotDependency),
                ("./d", SpecifierKind::HotDependency),
            ]
        );
        for r in &refs {
            let literal = &src[r.span.start..r.span.end];
            assert_eq!(literal, format!("\"{}\"", r.value));
        }
    }

    #[test]
    fn test_amd_dependencies_skip_pseudo_modules() {
        let src = "define(\"named\", [\"./base\", \"exports\", \"module\", \"./util\"], function (b, e, m, u) {});\n";
        let program = parse_source(src).unwrap();
        let refs = collect(&program);
        let values: Vec<_> = refs.iter().map(|r| (r.value.as_str(), r.kind)).collect();
        assert_eq!(
            values,
            vec![("./base", SpecifierKind::AmdDependency), ("./util", SpecifierKind::AmdDependency)]
        );
        assert!(collect(&parse_source("define(function () { return 1; });\n").unwrap()).is_empty());
    }

    #[test]
    fn test_self_accept_has_no_specifier() {
        let program = parse_source("module.hot.accept();\n").unwrap();
        assert!(collect(&program).is_empty());
    }

    #[test]
    fn test_exported_names() {
        let src = "export let a = 1;\nexport function f() {}\nexport default 3;\nlet x = 1;\nexport { x as y };\n";
        let program = parse_source(src).unwrap();
        let names: Vec<_> = exported_names(&program).into_iter().collect();
        assert_eq!(names, vec!["a", "default", "f", "y"]);
        assert!(uses_module_syntax(&program));
    }
}
