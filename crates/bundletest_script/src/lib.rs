//! Syntax frontend for bundle script: lexer, parser, AST, diagnostics.
//!
//! Bundle script is the small JavaScript-flavoured language fixture sources are written in and builders emit. The
//! harness sandbox executes the AST this crate produces.
//!
//! ## Notes
//! - This crate is "syntax-only": it does not resolve modules or evaluate anything.
//! - Vocabulary identity (keywords/operators/punctuation) comes from `bundletest_core::lang` registries.
//!
//! ## Examples
//! ```rust
//! use bundletest_script::{lexer, parser};
//!
//! let tokens = lexer::lex("define \"a\" { module.exports = 1; }\nentry \"a\";\n").unwrap();
//! let program = parser::parse(&tokens).unwrap();
//! assert_eq!(program.modules().count(), 1);
//! assert_eq!(program.entries().collect::<Vec<_>>(), vec!["a"]);
//! ```

pub mod ast;
pub mod diagnostics;
pub mod lexer;
pub mod parser;
pub mod specifiers;
pub mod token_helpers;

use diagnostics::CompileError;

/// Lex and parse a source string in one go.
///
/// ## Errors
/// - Lexer errors are returned as-is (parsing is skipped when lexing fails).
/// - Otherwise, every parse error the parser recovered from.
pub fn parse_source(source: &str) -> Result<ast::Program, Vec<CompileError>> {
    let tokens = lexer::lex(source)?;
    parser::parse(&tokens)
}
