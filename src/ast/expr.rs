//! Expression AST nodes.

use crate::ast::stmt::Stmt;
use crate::span::Span;

/// An expression in the AST.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Self { kind, span }
    }
}

/// All expression variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    /// Integer literal: 42
    IntLit(i64),
    /// Float literal: 3.14
    FloatLit(f64),
    /// Boolean literal: true, false
    BoolLit(bool),
    /// Character literal: 'x'
    CharLit(char),
    /// String literal: "hello"
    StringLit(String),
    /// The undefined value
    Undefined,

    /// Variable reference: foo
    Ident(String),

    /// Binary operation: a + b
    Binary {
        operator: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    /// Unary operation: -x, !x
    Unary {
        operator: UnaryOp,
        operand: Box<Expr>,
    },

    /// Logical and: a && b (short-circuit)
    LogicalAnd { left: Box<Expr>, right: Box<Expr> },

    /// Logical or: a || b (short-circuit)
    LogicalOr { left: Box<Expr>, right: Box<Expr> },

    /// Conditional expression: cond ? a : b
    Cond {
        condition: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Box<Expr>,
    },

    /// Assignment expression: x = v, arr[i] = v.
    /// Its value is the stored value, or the Error value describing a
    /// rejected store (immutable target, bad index).
    Assign { target: Box<Expr>, value: Box<Expr> },

    /// Array literal: [1, 2, 3]
    Array(Vec<Expr>),

    /// Map literal: {a: 1, b: 2} — keys are strings
    Map(Vec<(String, Expr)>),

    /// Index access: obj[index]
    Index { object: Box<Expr>, index: Box<Expr> },

    /// Slice: obj[low:high], either bound optional
    Slice {
        object: Box<Expr>,
        low: Option<Box<Expr>>,
        high: Option<Box<Expr>>,
    },

    /// Function call: f(a, b) or f(a, rest...)
    Call {
        callee: Box<Expr>,
        arguments: Vec<Expr>,
        /// Whether the final argument is a spread (`xs...`).
        spread: bool,
    },

    /// Function literal: func(a, b) { ... }
    Func {
        params: Vec<String>,
        /// Whether the final parameter collects the remaining arguments.
        variadic: bool,
        body: Vec<Stmt>,
        /// Name for diagnostics, when the literal is bound to one.
        name: Option<String>,
    },

    /// Module import: import("name")
    Import(String),
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Remainder,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

impl std::fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BinaryOp::Add => write!(f, "+"),
            BinaryOp::Subtract => write!(f, "-"),
            BinaryOp::Multiply => write!(f, "*"),
            BinaryOp::Divide => write!(f, "/"),
            BinaryOp::Remainder => write!(f, "%"),
            BinaryOp::Equal => write!(f, "=="),
            BinaryOp::NotEqual => write!(f, "!="),
            BinaryOp::Less => write!(f, "<"),
            BinaryOp::LessEqual => write!(f, "<="),
            BinaryOp::Greater => write!(f, ">"),
            BinaryOp::GreaterEqual => write!(f, ">="),
        }
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    Not,
}

impl std::fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnaryOp::Negate => write!(f, "-"),
            UnaryOp::Not => write!(f, "!"),
        }
    }
}

// Constructor helpers for hosts building trees without the parser.
impl Expr {
    pub fn int(n: i64, span: Span) -> Expr {
        Expr::new(ExprKind::IntLit(n), span)
    }

    pub fn float(n: f64, span: Span) -> Expr {
        Expr::new(ExprKind::FloatLit(n), span)
    }

    pub fn boolean(b: bool, span: Span) -> Expr {
        Expr::new(ExprKind::BoolLit(b), span)
    }

    pub fn string(s: impl Into<String>, span: Span) -> Expr {
        Expr::new(ExprKind::StringLit(s.into()), span)
    }

    pub fn ident(name: impl Into<String>, span: Span) -> Expr {
        Expr::new(ExprKind::Ident(name.into()), span)
    }

    pub fn binary(operator: BinaryOp, left: Expr, right: Expr) -> Expr {
        let span = left.span.merge(right.span);
        Expr::new(
            ExprKind::Binary {
                operator,
                left: Box::new(left),
                right: Box::new(right),
            },
            span,
        )
    }

    pub fn unary(operator: UnaryOp, operand: Expr) -> Expr {
        let span = operand.span;
        Expr::new(
            ExprKind::Unary {
                operator,
                operand: Box::new(operand),
            },
            span,
        )
    }

    pub fn and(left: Expr, right: Expr) -> Expr {
        let span = left.span.merge(right.span);
        Expr::new(
            ExprKind::LogicalAnd {
                left: Box::new(left),
                right: Box::new(right),
            },
            span,
        )
    }

    pub fn or(left: Expr, right: Expr) -> Expr {
        let span = left.span.merge(right.span);
        Expr::new(
            ExprKind::LogicalOr {
                left: Box::new(left),
                right: Box::new(right),
            },
            span,
        )
    }

    pub fn cond(condition: Expr, then_branch: Expr, else_branch: Expr) -> Expr {
        let span = condition.span.merge(else_branch.span);
        Expr::new(
            ExprKind::Cond {
                condition: Box::new(condition),
                then_branch: Box::new(then_branch),
                else_branch: Box::new(else_branch),
            },
            span,
        )
    }

    pub fn assign(target: Expr, value: Expr) -> Expr {
        let span = target.span.merge(value.span);
        Expr::new(
            ExprKind::Assign {
                target: Box::new(target),
                value: Box::new(value),
            },
            span,
        )
    }

    pub fn array(elements: Vec<Expr>, span: Span) -> Expr {
        Expr::new(ExprKind::Array(elements), span)
    }

    pub fn map(entries: Vec<(String, Expr)>, span: Span) -> Expr {
        Expr::new(ExprKind::Map(entries), span)
    }

    pub fn index(object: Expr, index: Expr) -> Expr {
        let span = object.span.merge(index.span);
        Expr::new(
            ExprKind::Index {
                object: Box::new(object),
                index: Box::new(index),
            },
            span,
        )
    }

    pub fn slice(object: Expr, low: Option<Expr>, high: Option<Expr>, span: Span) -> Expr {
        Expr::new(
            ExprKind::Slice {
                object: Box::new(object),
                low: low.map(Box::new),
                high: high.map(Box::new),
            },
            span,
        )
    }

    pub fn call(callee: Expr, arguments: Vec<Expr>) -> Expr {
        let span = callee.span;
        Expr::new(
            ExprKind::Call {
                callee: Box::new(callee),
                arguments,
                spread: false,
            },
            span,
        )
    }

    pub fn call_spread(callee: Expr, arguments: Vec<Expr>) -> Expr {
        let span = callee.span;
        Expr::new(
            ExprKind::Call {
                callee: Box::new(callee),
                arguments,
                spread: true,
            },
            span,
        )
    }

    pub fn func(params: Vec<&str>, body: Vec<Stmt>, span: Span) -> Expr {
        Expr::new(
            ExprKind::Func {
                params: params.into_iter().map(String::from).collect(),
                variadic: false,
                body,
                name: None,
            },
            span,
        )
    }

    pub fn func_variadic(params: Vec<&str>, body: Vec<Stmt>, span: Span) -> Expr {
        Expr::new(
            ExprKind::Func {
                params: params.into_iter().map(String::from).collect(),
                variadic: true,
                body,
                name: None,
            },
            span,
        )
    }

    pub fn import(name: impl Into<String>, span: Span) -> Expr {
        Expr::new(ExprKind::Import(name.into()), span)
    }
}
