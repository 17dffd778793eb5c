//! Statement AST nodes.

use crate::ast::expr::Expr;
use crate::span::Span;

/// A statement in the AST.
#[derive(Debug, Clone, PartialEq)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

impl Stmt {
    pub fn new(kind: StmtKind, span: Span) -> Self {
        Self { kind, span }
    }
}

/// Statement variants.
#[derive(Debug, Clone, PartialEq)]
pub enum StmtKind {
    /// Expression statement: expr
    Expression(Expr),

    /// Declaration: x := expr. At file scope this binds a global slot,
    /// elsewhere a new local in the innermost block.
    Declare { name: String, value: Expr },

    /// Bare block: { statements }
    Block(Vec<Stmt>),

    /// If statement with optional else branch.
    If {
        condition: Expr,
        then_branch: Vec<Stmt>,
        else_branch: Option<Vec<Stmt>>,
    },

    /// C-style loop: for init; cond; post { body }. All three header
    /// pieces are optional; `for cond { }` and `for { }` are this node too.
    For {
        init: Option<Box<Stmt>>,
        condition: Option<Expr>,
        post: Option<Box<Stmt>>,
        body: Vec<Stmt>,
    },

    /// Iteration: for key, value in iterable { body }. The value binding is
    /// optional.
    ForIn {
        key: String,
        value: Option<String>,
        iterable: Expr,
        body: Vec<Stmt>,
    },

    /// break
    Break,

    /// continue
    Continue,

    /// return expr / return
    Return(Option<Expr>),

    /// export expr — only meaningful at the top level of a source module,
    /// where it yields the module's export value.
    Export(Expr),
}

/// A whole compilation unit: a script or a source module body.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Program {
    pub statements: Vec<Stmt>,
}

impl Program {
    pub fn new(statements: Vec<Stmt>) -> Self {
        Self { statements }
    }
}

// Constructor helpers for hosts building trees without the parser.
impl Stmt {
    pub fn expression(expr: Expr) -> Stmt {
        let span = expr.span;
        Stmt::new(StmtKind::Expression(expr), span)
    }

    pub fn declare(name: impl Into<String>, value: Expr) -> Stmt {
        let span = value.span;
        Stmt::new(
            StmtKind::Declare {
                name: name.into(),
                value,
            },
            span,
        )
    }

    pub fn block(statements: Vec<Stmt>, span: Span) -> Stmt {
        Stmt::new(StmtKind::Block(statements), span)
    }

    pub fn if_stmt(condition: Expr, then_branch: Vec<Stmt>, else_branch: Option<Vec<Stmt>>) -> Stmt {
        let span = condition.span;
        Stmt::new(
            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            },
            span,
        )
    }

    pub fn for_loop(
        init: Option<Stmt>,
        condition: Option<Expr>,
        post: Option<Stmt>,
        body: Vec<Stmt>,
        span: Span,
    ) -> Stmt {
        Stmt::new(
            StmtKind::For {
                init: init.map(Box::new),
                condition,
                post: post.map(Box::new),
                body,
            },
            span,
        )
    }

    pub fn for_in(
        key: impl Into<String>,
        value: Option<&str>,
        iterable: Expr,
        body: Vec<Stmt>,
    ) -> Stmt {
        let span = iterable.span;
        Stmt::new(
            StmtKind::ForIn {
                key: key.into(),
                value: value.map(String::from),
                iterable,
                body,
            },
            span,
        )
    }

    pub fn brk(span: Span) -> Stmt {
        Stmt::new(StmtKind::Break, span)
    }

    pub fn cont(span: Span) -> Stmt {
        Stmt::new(StmtKind::Continue, span)
    }

    pub fn ret(value: Option<Expr>, span: Span) -> Stmt {
        Stmt::new(StmtKind::Return(value), span)
    }

    pub fn export(value: Expr) -> Stmt {
        let span = value.span;
        Stmt::new(StmtKind::Export(value), span)
    }
}
