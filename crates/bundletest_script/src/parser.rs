//! Parser for bundle script.
//!
//! Converts a token stream into an AST [`Program`].
//!
//! ## Examples
//!
//! ```rust
//! use bundletest_script::{lexer, parser};
//!
//! let source = "import value from \"./value\";\nexpect(value).toBe(1);\n";
//! let tokens = lexer::lex(source).unwrap();
//! let ast = parser::parse(&tokens).unwrap();
//! assert_eq!(ast.items.len(), 2);
//! ```

use crate::ast::*;
use crate::diagnostics::CompileError;
use crate::lexer::{Token, TokenKind};
use bundletest_core::lang::keywords::KeywordId;
use bundletest_core::lang::operators::{self, OperatorId};
use bundletest_core::lang::punctuation::PunctuationId;
use std::rc::Rc;

// NOTE: This module is split across multiple files using `include!` to keep all parser
// methods in the same Rust module (preserving privacy + call patterns) while avoiding
// a single large source file.

include!("parser/core.rs");
include!("parser/helpers.rs");
include!("parser/items.rs");
include!("parser/stmts.rs");
include!("parser/expr.rs");
include!("parser/api.rs");
include!("parser/tests.rs");
