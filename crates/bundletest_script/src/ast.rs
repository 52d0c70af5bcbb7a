//! Abstract Syntax Tree definitions for bundle script.
//!
//! The same tree describes both fixture sources (a list of statements forming one module) and emitted chunk files
//! (top-level `define` / `register` / `entry` items interleaved with runtime statements).

use std::fmt;
use std::rc::Rc;

/// Source location span (byte offsets)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn merge(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

/// A node with source location
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned<T> {
    pub node: T,
    pub span: Span,
}

impl<T> Spanned<T> {
    pub fn new(node: T, span: Span) -> Self {
        Self { node, span }
    }
}

pub type Ident = String;

/// Statement list shared between the parsed tree and every runtime closure created from it.
pub type Body = Rc<Vec<Spanned<Statement>>>;

/// A parsed file.
#[derive(Debug, Clone, PartialEq)]
pub struct Program {
    pub items: Vec<Spanned<Item>>,
}

impl Program {
    /// Iterate the module definitions (`define` and `register`) in file order.
    pub fn modules(&self) -> impl Iterator<Item = &ModuleDecl> {
        self.items.iter().filter_map(|item| match &item.node {
            Item::Define(m) | Item::Register(m) => Some(m),
            _ => None,
        })
    }

    /// Iterate the `entry` requests in file order.
    pub fn entries(&self) -> impl Iterator<Item = &str> {
        self.items.iter().filter_map(|item| match &item.node {
            Item::Entry(id) => Some(id.as_str()),
            _ => None,
        })
    }

    /// Return `true` when the file contains no chunk items (a plain source module).
    pub fn is_plain_module(&self) -> bool {
        self.items.iter().all(|i| matches!(i.node, Item::Statement(_)))
    }
}

/// Top-level items.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    /// `define "<id>" { ... }`: CommonJS-like factory.
    Define(ModuleDecl),
    /// `register "<id>" ["dep", ...] { ... }`: declarative registration.
    Register(ModuleDecl),
    /// `entry "<id>";`
    Entry(String),
    Statement(Spanned<Statement>),
}

/// A module factory emitted into a chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleDecl {
    pub id: String,
    pub id_span: Span,
    /// Declared dependencies (only populated for `register`).
    pub deps: Vec<String>,
    pub body: Body,
}

// ============================================================================
// Statements
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclKind {
    Let,
    Const,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Let(LetStmt),
    Function(Rc<FunctionDef>),
    Import(ImportDecl),
    Export(ExportDecl),
    If(IfStmt),
    Return(Option<Spanned<Expr>>),
    Throw(Spanned<Expr>),
    Try(TryStmt),
    Assign(AssignStmt),
    /// `await <expr>;` or `let x = await <expr>;`
    Await(AwaitStmt),
    Expr(Spanned<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LetStmt {
    pub kind: DeclKind,
    pub name: Ident,
    pub init: Option<Spanned<Expr>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportDecl {
    pub source: String,
    pub source_span: Span,
    pub clause: ImportClause,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ImportClause {
    /// `import "m";`
    SideEffect,
    /// `import x from "m";`
    Default(Ident),
    /// `import { a, b as c } from "m";`
    Named(Vec<ImportSpecifier>),
    /// `import * as ns from "m";`
    Namespace(Ident),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportSpecifier {
    pub imported: Ident,
    pub local: Ident,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExportDecl {
    Let(LetStmt),
    Function(Rc<FunctionDef>),
    Default(Spanned<Expr>),
    /// `export { a, b as c };`
    Named(Vec<ExportSpecifier>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportSpecifier {
    pub local: Ident,
    pub exported: Ident,
}

impl ExportDecl {
    /// Names this declaration adds to the module's export table.
    pub fn exported_names(&self) -> Vec<&str> {
        match self {
            ExportDecl::Let(l) => vec![l.name.as_str()],
            ExportDecl::Function(f) => f.name.as_deref().into_iter().collect(),
            ExportDecl::Default(_) => vec!["default"],
            ExportDecl::Named(specs) => specs.iter().map(|s| s.exported.as_str()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IfStmt {
    pub condition: Spanned<Expr>,
    pub then_body: Vec<Spanned<Statement>>,
    pub else_body: Option<Vec<Spanned<Statement>>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TryStmt {
    pub body: Vec<Spanned<Statement>>,
    pub param: Option<Ident>,
    pub handler: Vec<Spanned<Statement>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    Add,
    Sub,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssignStmt {
    /// Identifier, member or index expression.
    pub target: Spanned<Expr>,
    pub op: AssignOp,
    pub value: Spanned<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AwaitStmt {
    pub binding: Option<(DeclKind, Ident)>,
    pub expr: Spanned<Expr>,
}

// ============================================================================
// Expressions
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDef {
    pub name: Option<Ident>,
    pub params: Vec<Ident>,
    pub body: Body,
    /// Arrow functions with an expression body: the body is a single `return`.
    pub arrow: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
    Undefined,
    Ident(Ident),
    Member(Box<Spanned<Expr>>, Ident),
    Index(Box<Spanned<Expr>>, Box<Spanned<Expr>>),
    Call(Box<Spanned<Expr>>, Vec<Spanned<Expr>>),
    New(Box<Spanned<Expr>>, Vec<Spanned<Expr>>),
    Object(Vec<(String, Spanned<Expr>)>),
    Array(Vec<Spanned<Expr>>),
    Function(Rc<FunctionDef>),
    Unary(UnaryOp, Box<Spanned<Expr>>),
    Binary(Box<Spanned<Expr>>, BinaryOp, Box<Spanned<Expr>>),
}

impl Expr {
    /// Return `true` if this expression can appear on the left of an assignment.
    pub fn is_assignable(&self) -> bool {
        matches!(self, Expr::Ident(_) | Expr::Member(..) | Expr::Index(..))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not,
    Neg,
    Typeof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    NotEq,
    StrictEq,
    StrictNotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Eq => "==",
            BinaryOp::NotEq => "!=",
            BinaryOp::StrictEq => "===",
            BinaryOp::StrictNotEq => "!==",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        };
        f.write_str(s)
    }
}
