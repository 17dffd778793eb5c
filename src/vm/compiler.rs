//! AST-to-bytecode compiler.
//!
//! Single-pass compilation: walks the AST once, emitting bytecode into a
//! `Chunk`. Name resolution happens at compile time through the
//! [`SymbolTable`]; locals become frame-relative stack slots, captured
//! variables become cell indices resolved at closure creation.
//!
//! Errors are collected at top-level statement granularity: a failed
//! statement is recorded and compilation moves on to the next one, so a
//! single pass reports several diagnostics.

use std::rc::Rc;

use crate::ast::stmt::Program;
use crate::error::{CompileError, ErrorList, MAX_COMPILE_ERRORS};
use crate::modules::ModuleLoader;
use crate::span::Span;

use super::chunk::{Chunk, CompiledUnit, Constant, FunctionProto};
use super::opcode::Op;
use super::symbol::SymbolTable;

/// Result type for compilation.
pub type CompileResult<T> = Result<T, CompileError>;

/// Per-loop state for break/continue patching.
pub struct LoopContext {
    /// Offset of the loop head (condition test or IterNext).
    pub start: usize,
    /// Block depth outside the loop body; break/continue unwind locals
    /// deeper than this before jumping.
    pub depth: u32,
    /// Function nesting level the loop belongs to; break/continue inside a
    /// nested function literal must not target it.
    pub func: usize,
    /// Forward jumps patched to the loop exit.
    pub breaks: Vec<usize>,
    /// Forward jumps patched to the post statement (or the back-edge).
    pub continues: Vec<usize>,
    /// Whether an iterator is live for this loop (for-in).
    pub for_in: bool,
    /// Header variable and its per-iteration shadow, when the loop header
    /// declared one: (header slot, shadow slot).
    pub shadow: Option<(u16, u16)>,
}

/// The compiler: transforms an AST into a [`CompiledUnit`].
pub struct Compiler<'a> {
    pub(super) table: SymbolTable,
    /// Function prototypes under construction, innermost last.
    pub(super) protos: Vec<FunctionProto>,
    /// Open loops, innermost last.
    pub(super) loops: Vec<LoopContext>,
    pub(super) errors: ErrorList,
    pub(super) loader: &'a ModuleLoader,
    /// Source-module imports seen in this unit, compiled transitively by the
    /// loader once this unit is done.
    pub(super) source_imports: Vec<(String, Span)>,
    /// Whether this unit is a source module body (export allowed, top-level
    /// declarations are locals of the module function).
    pub(super) module: bool,
}

impl<'a> Compiler<'a> {
    fn new(builtins: Vec<String>, loader: &'a ModuleLoader, module: bool) -> Self {
        let table = if module {
            SymbolTable::for_module(builtins)
        } else {
            SymbolTable::new(builtins)
        };
        Self {
            table,
            protos: vec![FunctionProto::new(None)],
            loops: Vec::new(),
            errors: ErrorList::new(),
            loader,
            source_imports: Vec::new(),
            module,
        }
    }

    /// Compile a program against a builtin name list and a module loader.
    ///
    /// Source modules the program imports (and their imports, transitively)
    /// are compiled into the loader's cache before this returns, so cyclic
    /// imports surface here rather than at run time.
    pub fn compile(
        program: &Program,
        builtins: Vec<String>,
        loader: &mut ModuleLoader,
    ) -> Result<CompiledUnit, ErrorList> {
        Self::compile_with_globals(program, builtins, &[], loader)
    }

    /// Compile with host-supplied global names predeclared, so scripts can
    /// read and assign them without `:=`. Their slots come first, in order;
    /// the host seeds values by name via `Vm::with_globals`.
    pub fn compile_with_globals(
        program: &Program,
        builtins: Vec<String>,
        globals: &[String],
        loader: &mut ModuleLoader,
    ) -> Result<CompiledUnit, ErrorList> {
        let (unit, imports) = {
            let mut compiler = Compiler::new(builtins.clone(), &*loader, false);
            for name in globals {
                compiler.table.predeclare_global(name);
            }
            compiler.run(program)?
        };

        let mut errors = ErrorList::new();
        for (name, span) in imports {
            if let Err(list) = loader.compile_module(&name, &builtins, span) {
                for err in list.errors {
                    errors.push(err);
                }
            }
        }
        if errors.is_empty() {
            Ok(unit)
        } else {
            errors.sort();
            Err(errors)
        }
    }

    /// Compile a source module body. Top-level declarations become locals of
    /// the module function; `export e` compiles to a return of `e`.
    pub(crate) fn compile_module(
        program: &Program,
        builtins: Vec<String>,
        loader: &ModuleLoader,
        name: &str,
    ) -> Result<(Rc<FunctionProto>, Vec<(String, Span)>), ErrorList> {
        let mut compiler = Compiler::new(builtins, loader, true);
        compiler.protos[0].name = Some(name.to_string());
        let (unit, imports) = compiler.run(program)?;
        Ok((unit.main, imports))
    }

    fn run(
        mut self,
        program: &Program,
    ) -> Result<(CompiledUnit, Vec<(String, Span)>), ErrorList> {
        let end = program
            .statements
            .last()
            .map(|s| s.span)
            .unwrap_or_default();

        for stmt in &program.statements {
            if let Err(err) = self.compile_stmt(stmt) {
                self.errors.push(err);
                self.recover_to_top_level();
                if self.errors.len() >= MAX_COMPILE_ERRORS {
                    break;
                }
            }
        }

        // Implicit result when control falls off the end.
        self.emit(Op::Undefined, end);
        self.emit(Op::Return, end);

        if !self.errors.is_empty() {
            self.errors.sort();
            return Err(self.errors);
        }

        let (captures, num_locals) = self.table.leave_function();
        let mut main = self.protos.pop().unwrap_or_default();
        main.captures = captures;
        main.num_locals = num_locals;
        let unit = CompiledUnit {
            main: Rc::new(main),
            global_names: self.table.global_names(),
        };
        Ok((unit, self.source_imports))
    }

    /// Discard the nesting a failed statement left open (function literals
    /// under construction, loop contexts, block scopes) so the next top-level
    /// statement resolves names against the top-level scope again.
    fn recover_to_top_level(&mut self) {
        self.protos.truncate(1);
        self.loops.clear();
        self.table.unwind_to_root();
    }

    // --- Emission helpers ---

    pub(super) fn chunk(&mut self) -> &mut Chunk {
        &mut self
            .protos
            .last_mut()
            .expect("no function under construction")
            .chunk
    }

    pub(super) fn emit(&mut self, op: Op, span: Span) -> usize {
        self.chunk().emit(op, span)
    }

    pub(super) fn patch_jump(&mut self, offset: usize) {
        self.chunk().patch_jump(offset);
    }

    /// Emit the back-edge to `start`.
    pub(super) fn emit_loop(&mut self, start: usize, span: Span) -> CompileResult<()> {
        // After fetching Loop(n) the ip sits one past it; jumping back n
        // lands on `start`.
        let distance = self.chunk().len() + 1 - start;
        if distance > u16::MAX as usize {
            return Err(CompileError::too_many("instructions in one loop", span));
        }
        self.emit(Op::Loop(distance as u16), span);
        Ok(())
    }

    /// Add a constant to the current pool, bounds-checked.
    pub(super) fn constant(&mut self, constant: Constant, span: Span) -> CompileResult<u16> {
        let chunk = self.chunk();
        if chunk.constants.len() >= u16::MAX as usize {
            return Err(CompileError::too_many("constants", span));
        }
        Ok(chunk.add_constant(constant))
    }

    // --- Scopes ---

    pub(super) fn begin_scope(&mut self) {
        self.table.begin_block();
    }

    /// Close the innermost block, releasing its stack slots. Captured slots
    /// are closed into cells instead of plainly popped.
    pub(super) fn end_scope(&mut self, span: Span) {
        for popped in self.table.end_block() {
            if popped.captured {
                self.emit(Op::CloseCell, span);
            } else {
                self.emit(Op::Pop, span);
            }
        }
    }

    /// Release the slots of every local deeper than `depth` without closing
    /// their blocks; break/continue jump past the normal scope epilogue.
    /// CloseCell is used unconditionally since a slot may be captured by a
    /// closure created later in the block than the jump.
    pub(super) fn unwind_to(&mut self, depth: u32, span: Span) {
        for _ in self.table.locals_deeper_than(depth) {
            self.emit(Op::CloseCell, span);
        }
    }

    // --- Functions ---

    pub(super) fn start_function(
        &mut self,
        name: Option<String>,
        params: &[String],
        variadic: bool,
        span: Span,
    ) -> CompileResult<()> {
        if params.len() > u8::MAX as usize {
            return Err(CompileError::too_many("parameters", span));
        }
        self.table.enter_function();
        let mut proto = FunctionProto::new(name);
        proto.num_params = params.len() as u8;
        proto.variadic = variadic;
        self.protos.push(proto);
        for param in params {
            self.table.define(param, span)?;
        }
        Ok(())
    }

    pub(super) fn finish_function(&mut self, span: Span) -> FunctionProto {
        // Implicit `return undefined` when control falls off the end.
        self.emit(Op::Undefined, span);
        self.emit(Op::Return, span);
        let (captures, num_locals) = self.table.leave_function();
        let mut proto = self.protos.pop().unwrap_or_default();
        proto.captures = captures;
        proto.num_locals = num_locals;
        proto
    }

    // --- Loops ---

    pub(super) fn begin_loop(&mut self, start: usize, for_in: bool) {
        let depth = self.table.block_depth();
        self.loops.push(LoopContext {
            start,
            depth,
            func: self.protos.len(),
            breaks: Vec::new(),
            continues: Vec::new(),
            for_in,
            shadow: None,
        });
    }

    pub(super) fn end_loop(&mut self) -> LoopContext {
        self.loops.pop().expect("no open loop")
    }

    /// The innermost loop, when it belongs to the current function.
    pub(super) fn current_loop(&self) -> Option<&LoopContext> {
        self.loops
            .last()
            .filter(|ctx| ctx.func == self.protos.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expr, Stmt};
    use pretty_assertions::assert_eq;

    fn line(n: usize) -> Span {
        Span::new(n * 10, n * 10 + 1, n, 1)
    }

    #[test]
    fn test_failed_loop_body_does_not_leak_loop_context() {
        // The loop body fails, so the loop context is abandoned mid-compile;
        // a later top-level break must still be rejected as outside a loop.
        let program = Program::new(vec![
            Stmt::for_loop(
                None,
                None,
                None,
                vec![Stmt::expression(Expr::ident("ghost", line(1)))],
                line(1),
            ),
            Stmt::brk(line(2)),
        ]);
        let mut loader = ModuleLoader::new();
        let errors = Compiler::compile(&program, vec![], &mut loader).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(matches!(
            errors.errors[0],
            CompileError::UndefinedVariable(_, _)
        ));
        assert!(matches!(errors.errors[1], CompileError::InvalidBreak(_)));
    }

    #[test]
    fn test_failed_function_literal_does_not_leak_its_scope() {
        // The function body fails, so its scope is abandoned mid-compile;
        // a later use of its parameter must not resolve against it.
        let program = Program::new(vec![
            Stmt::declare(
                "f",
                Expr::func(
                    vec!["p"],
                    vec![Stmt::expression(Expr::ident("ghost", line(1)))],
                    line(1),
                ),
            ),
            Stmt::expression(Expr::ident("p", line(2))),
        ]);
        let mut loader = ModuleLoader::new();
        let errors = Compiler::compile(&program, vec![], &mut loader).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors
            .errors
            .iter()
            .all(|e| matches!(e, CompileError::UndefinedVariable(_, _))));
    }
}
