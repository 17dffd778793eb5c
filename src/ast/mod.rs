//! Abstract Syntax Tree consumed by the bytecode compiler.
//!
//! The lexer and parser live outside this crate; hosts hand the compiler a
//! ready-made node tree. The constructor helpers on [`Expr`] and [`Stmt`]
//! exist so embedders (and tests) can build trees programmatically.

pub mod expr;
pub mod stmt;

pub use expr::{BinaryOp, Expr, ExprKind, UnaryOp};
pub use stmt::{Program, Stmt, StmtKind};
