//! rill: an embeddable, dynamically-typed scripting engine.
//!
//! Scripts compile once to bytecode and run on a stack-based virtual
//! machine. The host supplies global bindings, native ("builtin")
//! functions, and modules; native functions can call back into script
//! closures through an [`Interop`] handle.
//!
//! The parser is an external collaborator: hosts hand the engine an AST
//! built with the constructor helpers on [`Expr`] and [`Stmt`].
//!
//! ```
//! use rill::{compile, BinaryOp, Builtins, Expr, ModuleLoader, Program,
//!            ResourceLimits, Span, Stmt, Value, Vm};
//!
//! let span = Span::default();
//! let program = Program::new(vec![Stmt::declare(
//!     "answer",
//!     Expr::binary(BinaryOp::Multiply, Expr::int(6, span), Expr::int(7, span)),
//! )]);
//!
//! let builtins = Builtins::core();
//! let mut loader = ModuleLoader::new();
//! let unit = compile(&program, &builtins, &mut loader).unwrap();
//!
//! let mut vm = Vm::new(unit, builtins, loader, ResourceLimits::default());
//! vm.run().unwrap();
//! assert_eq!(vm.global("answer"), Some(Value::Int(42)));
//! ```

#![allow(clippy::module_inception)]
#![allow(clippy::result_large_err)]

pub mod ast;
pub mod builtins;
pub mod error;
pub mod limits;
pub mod modules;
pub mod span;
pub mod value;
pub mod vm;

pub use ast::{BinaryOp, Expr, ExprKind, Program, Stmt, StmtKind, UnaryOp};
pub use builtins::Builtins;
pub use error::{CompileError, ErrorList, RuntimeError};
pub use limits::ResourceLimits;
pub use modules::ModuleLoader;
pub use span::Span;
pub use value::{NativeFunction, NativeResult, Value, ValueMap};
pub use vm::{disassemble, CompiledUnit, Interop, Vm};

/// Compile a program against a builtin registry and a module loader.
///
/// Source modules the program imports are compiled (transitively) into the
/// loader, so cyclic and unknown imports are reported here. The returned
/// unit plus the same registry and loader construct a [`Vm`].
pub fn compile(
    program: &Program,
    builtins: &Builtins,
    loader: &mut ModuleLoader,
) -> Result<CompiledUnit, ErrorList> {
    vm::Compiler::compile(program, builtins.names(), loader)
}

/// Like [`compile`], with host-supplied global names predeclared. Scripts
/// read and assign them without declaring them; the host seeds their values
/// through [`Vm::with_globals`].
pub fn compile_with_globals(
    program: &Program,
    builtins: &Builtins,
    globals: &[&str],
    loader: &mut ModuleLoader,
) -> Result<CompiledUnit, ErrorList> {
    let names: Vec<String> = globals.iter().map(|g| g.to_string()).collect();
    vm::Compiler::compile_with_globals(program, builtins.names(), &names, loader)
}
