#[cfg(test)]
/// Parser unit tests.
///
/// These tests focus on correctness of specific syntactic forms and on the parser's
/// error recovery behavior (avoiding cascaded errors).
mod tests {
    use super::*;
    use crate::lexer;

    fn parse_str(source: &str) -> Result<Program, Vec<CompileError>> {
        let tokens = lexer::lex(source).map_err(|_| vec![])?;
        parse(&tokens)
    }

    fn first_stmt(program: &Program) -> &Statement {
        match &program.items[0].node {
            Item::Statement(s) => &s.node,
            other => panic!("Expected statement, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_chunk_items() {
        let source = r#"
define "./value.js" {
  exports.value = 1;
}
register "./reg.js" ["./value.js", "./other.js"] {
  import { value } from "./value.js";
}
entry "./value.js";
"#;
        let program = parse_str(source).unwrap();
        assert_eq!(program.items.len(), 3);
        let modules: Vec<_> = program.modules().collect();
        assert_eq!(modules[0].id, "./value.js");
        assert!(modules[0].deps.is_empty());
        assert_eq!(modules[1].deps, vec!["./value.js", "./other.js"]);
        assert!(matches!(program.items[1].node, Item::Register(_)));
        assert_eq!(program.entries().collect::<Vec<_>>(), vec!["./value.js"]);
        assert!(!program.is_plain_module());
    }

    #[test]
    fn test_called_define_is_an_expression() {
        let source = "define([\"./base\", \"exports\"], function (base, exports) { exports.value = base; });\n";
        let program = parse_str(source).unwrap();
        assert!(program.is_plain_module());
        let Statement::Expr(expr) = first_stmt(&program) else {
            panic!("Expected expression statement");
        };
        let Expr::Call(callee, args) = &expr.node else {
            panic!("Expected call, got {:?}", expr.node);
        };
        assert!(matches!(&callee.node, Expr::Ident(name) if name == "define"));
        assert_eq!(args.len(), 2);
        assert!(matches!(args[0].node, Expr::Array(_)));
    }

    #[test]
    fn test_precedence_follows_registry() {
        let program = parse_str("let x = 1 + 2 * 3 === 7 && !false;\n").unwrap();
        let Statement::Let(l) = first_stmt(&program) else {
            panic!("Expected let");
        };
        let init = l.init.as_ref().unwrap();
        match &init.node {
            Expr::Binary(lhs, BinaryOp::And, rhs) => {
                assert!(matches!(lhs.node, Expr::Binary(_, BinaryOp::StrictEq, _)));
                assert!(matches!(rhs.node, Expr::Unary(UnaryOp::Not, _)));
                let Expr::Binary(sum, _, _) = &lhs.node else { unreachable!() };
                assert!(matches!(
                    &sum.node,
                    Expr::Binary(_, BinaryOp::Add, mul) if matches!(mul.node, Expr::Binary(_, BinaryOp::Mul, _))
                ));
            }
            other => panic!("Expected &&, got {:?}", other),
        }
    }

    #[test]
    fn test_subtraction_is_left_associative() {
        let program = parse_str("let x = 10 - 4 - 3;\n").unwrap();
        let Statement::Let(l) = first_stmt(&program) else {
            panic!("Expected let");
        };
        match &l.init.as_ref().unwrap().node {
            Expr::Binary(lhs, BinaryOp::Sub, rhs) => {
                assert!(matches!(lhs.node, Expr::Binary(_, BinaryOp::Sub, _)));
                assert!(matches!(rhs.node, Expr::Number(n) if n == 3.0));
            }
            other => panic!("Expected subtraction, got {:?}", other),
        }
    }

    #[test]
    fn test_import_forms() {
        let source = r#"
import def from "./a";
import { x, y as z, default as d } from "./b";
import * as ns from "./c";
import "./d";
"#;
        let program = parse_str(source).unwrap();
        let clauses: Vec<_> = program
            .items
            .iter()
            .map(|i| match &i.node {
                Item::Statement(Spanned {
                    node: Statement::Import(decl),
                    ..
                }) => decl.clause.clone(),
                other => panic!("Expected import, got {:?}", other),
            })
            .collect();
        assert_eq!(clauses[0], ImportClause::Default("def".to_string()));
        assert_eq!(
            clauses[1],
            ImportClause::Named(vec![
                ImportSpecifier {
                    imported: "x".to_string(),
                    local: "x".to_string()
                },
                ImportSpecifier {
                    imported: "y".to_string(),
                    local: "z".to_string()
                },
                ImportSpecifier {
                    imported: "default".to_string(),
                    local: "d".to_string()
                },
            ])
        );
        assert_eq!(clauses[2], ImportClause::Namespace("ns".to_string()));
        assert_eq!(clauses[3], ImportClause::SideEffect);
    }

    #[test]
    fn test_await_forms() {
        let program = parse_str("await NEXT_HMR();\nlet err = await NEXT_HMR({ expectError: true });\n").unwrap();
        assert!(matches!(
            first_stmt(&program),
            Statement::Await(AwaitStmt { binding: None, .. })
        ));
        match &program.items[1].node {
            Item::Statement(Spanned {
                node: Statement::Await(a),
                ..
            }) => {
                assert_eq!(a.binding, Some((DeclKind::Let, "err".to_string())));
                assert!(matches!(&a.expr.node, Expr::Call(_, args) if args.len() == 1));
            }
            other => panic!("Expected await, got {:?}", other),
        }
    }

    #[test]
    fn test_await_inside_expression_is_rejected() {
        let err = parse_str("let x = 1 + await y;\n").unwrap_err();
        assert_eq!(err.len(), 1);
        assert!(err[0].message.contains("Expected expression"), "{}", err[0].message);
        assert!(!err[0].hints.is_empty());
    }

    #[test]
    fn test_hot_accept_with_arrow_callback() {
        let source = "module.hot.accept(\"./dep\", () => { STATE.accepted = true; });\n";
        let program = parse_str(source).unwrap();
        let Statement::Expr(call) = first_stmt(&program) else {
            panic!("Expected expression statement");
        };
        let Expr::Call(callee, args) = &call.node else {
            panic!("Expected call");
        };
        assert!(matches!(&callee.node, Expr::Member(_, m) if m == "accept"));
        assert!(matches!(&args[1].node, Expr::Function(f) if f.arrow && f.params.is_empty()));
    }

    #[test]
    fn test_expression_bodied_arrow_returns_value() {
        let program = parse_str("const inc = x => x + 1;\n").unwrap();
        let Statement::Let(l) = first_stmt(&program) else {
            panic!("Expected let");
        };
        let Expr::Function(f) = &l.init.as_ref().unwrap().node else {
            panic!("Expected function");
        };
        assert_eq!(f.params, vec!["x".to_string()]);
        assert!(matches!(f.body[0].node, Statement::Return(Some(_))));
    }

    #[test]
    fn test_object_literal_keys() {
        let program = parse_str("let o = { a: 1, \"b-c\": 2, default: 3, a2, 4: 5, };\n").unwrap();
        let Statement::Let(l) = first_stmt(&program) else {
            panic!("Expected let");
        };
        let Expr::Object(fields) = &l.init.as_ref().unwrap().node else {
            panic!("Expected object");
        };
        let keys: Vec<_> = fields.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a", "b-c", "default", "a2", "4"]);
        assert!(matches!(&fields[3].1.node, Expr::Ident(n) if n == "a2"));
    }

    #[test]
    fn test_if_else_chain_and_try_catch() {
        let source = r#"
if (a) { b = 1; } else if (c) d(); else { e += 2; }
try { f(); } catch (err) { g = err; }
"#;
        let program = parse_str(source).unwrap();
        let Statement::If(s) = first_stmt(&program) else {
            panic!("Expected if");
        };
        let else_body = s.else_body.as_ref().unwrap();
        assert!(matches!(else_body[0].node, Statement::If(_)));
        match &program.items[1].node {
            Item::Statement(Spanned {
                node: Statement::Try(t),
                ..
            }) => assert_eq!(t.param.as_deref(), Some("err")),
            other => panic!("Expected try, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_semicolon_reports_hint() {
        let err = parse_str("let a = 1\nlet b = 2;\n").unwrap_err();
        assert_eq!(err.len(), 1);
        assert!(err[0].message.starts_with("Expected ';' after declaration"), "{}", err[0].message);
        assert_eq!(err[0].hints.len(), 1);
    }

    #[test]
    fn test_recovery_inside_module_body_does_not_cascade() {
        let source = r#"
define "a" {
  let x = ;
  let y = 2;
}
define "b" {
  exports.ok = true;
}
"#;
        let err = parse_str(source).unwrap_err();
        assert_eq!(err.len(), 1, "errors: {:?}", err);
    }

    #[test]
    fn test_several_errors_in_one_pass() {
        let err = parse_str("let = 1;\nlet b = 2;\nconst c;\n").unwrap_err();
        assert_eq!(err.len(), 2, "errors: {:?}", err);
    }

    #[test]
    fn test_chunk_items_rejected_in_nested_position() {
        let err = parse_str("function f() { entry \"a\"; }\n").unwrap_err();
        assert!(err[0].notes[0].contains("top level"));
    }

    #[test]
    fn test_invalid_assignment_target() {
        let err = parse_str("f() = 1;\n").unwrap_err();
        assert!(err[0].message.contains("Invalid assignment target"));
    }

    #[test]
    fn test_export_forms() {
        let source = "export const a = 1;\nexport function f(x) { return x; }\nexport default a + 1;\nexport { a as b };\n";
        let program = parse_str(source).unwrap();
        let names: Vec<Vec<&str>> = program
            .items
            .iter()
            .map(|i| match &i.node {
                Item::Statement(Spanned {
                    node: Statement::Export(d),
                    ..
                }) => d.exported_names(),
                other => panic!("Expected export, got {:?}", other),
            })
            .collect();
        assert_eq!(names, vec![vec!["a"], vec!["f"], vec!["default"], vec!["b"]]);
    }
}
