//! Error types for compilation and execution.

use crate::span::Span;
use thiserror::Error;

/// Bytecode compilation errors.
#[derive(Debug, Clone, Error)]
pub enum CompileError {
    #[error("Undefined variable '{0}' at {1}")]
    UndefinedVariable(String, Span),

    #[error("Variable '{0}' already declared in this scope at {1}")]
    Redeclared(String, Span),

    #[error("Unknown module '{0}' at {1}")]
    UnknownModule(String, Span),

    #[error("Cyclic import of module '{0}' at {1}")]
    CyclicImport(String, Span),

    #[error("'break' outside of a loop at {0}")]
    InvalidBreak(Span),

    #[error("'continue' outside of a loop at {0}")]
    InvalidContinue(Span),

    #[error("'export' outside of a module at {0}")]
    InvalidExport(Span),

    #[error("Too many {what} in one function at {span}")]
    TooMany { what: &'static str, span: Span },

    #[error("{message} at {span}")]
    General { message: String, span: Span },
}

impl CompileError {
    pub fn new(message: impl Into<String>, span: Span) -> Self {
        Self::General {
            message: message.into(),
            span,
        }
    }

    pub fn undefined_variable(name: impl Into<String>, span: Span) -> Self {
        Self::UndefinedVariable(name.into(), span)
    }

    pub fn too_many(what: &'static str, span: Span) -> Self {
        Self::TooMany { what, span }
    }

    pub fn span(&self) -> Span {
        match self {
            Self::UndefinedVariable(_, span) => *span,
            Self::Redeclared(_, span) => *span,
            Self::UnknownModule(_, span) => *span,
            Self::CyclicImport(_, span) => *span,
            Self::InvalidBreak(span) => *span,
            Self::InvalidContinue(span) => *span,
            Self::InvalidExport(span) => *span,
            Self::TooMany { span, .. } => *span,
            Self::General { span, .. } => *span,
        }
    }
}

/// Cap on diagnostics collected in one compile pass.
pub const MAX_COMPILE_ERRORS: usize = 16;

/// A position-sorted collection of compile diagnostics.
///
/// The compiler keeps going after an error (at statement granularity) so a
/// single pass can report several problems, up to [`MAX_COMPILE_ERRORS`].
#[derive(Debug, Clone, Default)]
pub struct ErrorList {
    pub errors: Vec<CompileError>,
}

impl std::error::Error for ErrorList {}

impl ErrorList {
    pub fn new() -> Self {
        Self { errors: Vec::new() }
    }

    pub fn push(&mut self, err: CompileError) {
        if self.errors.len() < MAX_COMPILE_ERRORS {
            self.errors.push(err);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Sort diagnostics by source position.
    pub fn sort(&mut self) {
        self.errors
            .sort_by_key(|e| (e.span().line, e.span().column, e.span().start));
    }
}

impl std::fmt::Display for ErrorList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

impl From<CompileError> for ErrorList {
    fn from(err: CompileError) -> Self {
        Self { errors: vec![err] }
    }
}

/// Runtime errors.
///
/// Most of these are recoverable: the VM turns them into a first-class
/// `Value::Error` at the result position and keeps running. The fatal ones
/// (instruction budget, stack overflow, cancellation, corrupt bytecode,
/// module compile failures) abort the whole run and surface to the host.
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error("Type mismatch: expected {expected}, found {found} at {span}")]
    TypeMismatch {
        expected: String,
        found: String,
        span: Span,
    },

    #[error("Wrong number of arguments: expected {want}, got {got} at {span}")]
    WrongArity { want: String, got: usize, span: Span },

    #[error("Index out of bounds: {index} (length {length}) at {span}")]
    IndexOutOfBounds {
        index: i64,
        length: usize,
        span: Span,
    },

    #[error("Invalid key type: {0} at {1}")]
    InvalidKeyType(String, Span),

    #[error("Division by zero at {0}")]
    DivisionByZero(Span),

    #[error("String length limit exceeded ({limit} bytes) at {span}")]
    StringLimit { limit: usize, span: Span },

    #[error("Bytes length limit exceeded ({limit} bytes) at {span}")]
    BytesLimit { limit: usize, span: Span },

    #[error("Instruction budget exhausted ({0} instructions)")]
    InstructionLimit(u64),

    #[error("Stack overflow at {0}")]
    StackOverflow(Span),

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Corrupt bytecode: {0}")]
    CorruptBytecode(String),

    #[error("Module '{name}' failed to compile: {errors}")]
    ModuleCompile { name: String, errors: ErrorList },

    #[error("{message} at {span}")]
    General { message: String, span: Span },
}

impl RuntimeError {
    pub fn new(message: impl Into<String>, span: Span) -> Self {
        Self::General {
            message: message.into(),
            span,
        }
    }

    pub fn type_mismatch(
        expected: impl Into<String>,
        found: impl Into<String>,
        span: Span,
    ) -> Self {
        Self::TypeMismatch {
            expected: expected.into(),
            found: found.into(),
            span,
        }
    }

    pub fn wrong_arity(want: impl Into<String>, got: usize, span: Span) -> Self {
        Self::WrongArity {
            want: want.into(),
            got,
            span,
        }
    }

    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::CorruptBytecode(message.into())
    }

    /// Whether this error must abort the run instead of becoming a
    /// script-catchable Error value.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InstructionLimit(_)
                | Self::StackOverflow(_)
                | Self::Cancelled
                | Self::CorruptBytecode(_)
                | Self::ModuleCompile { .. }
        )
    }
}
