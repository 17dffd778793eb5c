//! Bytecode engine: symbol resolution, AST-to-bytecode compilation, and the
//! stack-based virtual machine that executes compiled units.

pub mod cell;
pub mod chunk;
pub mod compiler;
pub mod compiler_exprs;
pub mod compiler_stmts;
pub mod disassembler;
pub mod opcode;
pub mod symbol;
#[allow(clippy::module_inception)]
pub mod vm;
pub mod vm_calls;

pub use cell::{CaptureSource, Cell, Closure};
pub use chunk::{Chunk, CompiledUnit, Constant, FunctionProto};
pub use compiler::Compiler;
pub use disassembler::disassemble;
pub use opcode::Op;
pub use symbol::{Binding, SymbolTable};
pub use vm::Vm;
pub use vm_calls::Interop;
