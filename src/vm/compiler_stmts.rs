//! Statement compilation — AST statements to bytecode.

use crate::ast::expr::{Expr, ExprKind};
use crate::ast::stmt::StmtKind;
use crate::ast::Stmt;
use crate::error::CompileError;
use crate::span::Span;

use super::compiler::{CompileResult, Compiler};
use super::opcode::Op;
use super::symbol::Binding;

impl Compiler<'_> {
    /// Compile a statement.
    pub fn compile_stmt(&mut self, stmt: &Stmt) -> CompileResult<()> {
        match &stmt.kind {
            StmtKind::Expression(expr) => {
                self.compile_expr(expr)?;
                self.emit(Op::Pop, stmt.span);
            }

            StmtKind::Declare { name, value } => {
                self.declare_stmt(name, value, stmt.span)?;
            }

            StmtKind::Block(statements) => {
                self.begin_scope();
                for s in statements {
                    self.compile_stmt(s)?;
                }
                self.end_scope(stmt.span);
            }

            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            } => {
                self.compile_expr(condition)?;
                let jump_else = self.emit(Op::JumpIfFalse(0), stmt.span);
                self.begin_scope();
                for s in then_branch {
                    self.compile_stmt(s)?;
                }
                self.end_scope(stmt.span);
                if let Some(else_branch) = else_branch {
                    let jump_end = self.emit(Op::Jump(0), stmt.span);
                    self.patch_jump(jump_else);
                    self.begin_scope();
                    for s in else_branch {
                        self.compile_stmt(s)?;
                    }
                    self.end_scope(stmt.span);
                    self.patch_jump(jump_end);
                } else {
                    self.patch_jump(jump_else);
                }
            }

            StmtKind::For {
                init,
                condition,
                post,
                body,
            } => {
                self.for_stmt(
                    init.as_deref(),
                    condition.as_ref(),
                    post.as_deref(),
                    body,
                    stmt.span,
                )?;
            }

            StmtKind::ForIn {
                key,
                value,
                iterable,
                body,
            } => {
                self.for_in_stmt(key, value.as_deref(), iterable, body, stmt.span)?;
            }

            StmtKind::Break => {
                let Some(ctx) = self.current_loop() else {
                    return Err(CompileError::InvalidBreak(stmt.span));
                };
                let depth = ctx.depth;
                self.unwind_to(depth, stmt.span);
                let offset = self.emit(Op::Jump(0), stmt.span);
                if let Some(ctx) = self.loops.last_mut() {
                    ctx.breaks.push(offset);
                }
            }

            StmtKind::Continue => {
                let Some(ctx) = self.current_loop() else {
                    return Err(CompileError::InvalidContinue(stmt.span));
                };
                let depth = ctx.depth;
                let shadow = ctx.shadow;
                // The post statement reads the header variable, so the
                // iteration's shadow writes back before jumping there.
                if let Some((header, shadow)) = shadow {
                    self.copy_back(header, shadow, stmt.span);
                }
                self.unwind_to(depth, stmt.span);
                let offset = self.emit(Op::Jump(0), stmt.span);
                if let Some(ctx) = self.loops.last_mut() {
                    ctx.continues.push(offset);
                }
            }

            StmtKind::Return(value) => {
                match value {
                    Some(expr) => self.compile_expr(expr)?,
                    None => {
                        self.emit(Op::Undefined, stmt.span);
                    }
                }
                self.emit(Op::Return, stmt.span);
            }

            StmtKind::Export(value) => {
                // Only the top level of a source module body exports.
                if !self.module || self.protos.len() != 1 {
                    return Err(CompileError::InvalidExport(stmt.span));
                }
                self.compile_expr(value)?;
                self.emit(Op::Return, stmt.span);
            }
        }
        Ok(())
    }

    /// `name := value`. A function literal sees its own name, so recursive
    /// declarations resolve.
    fn declare_stmt(&mut self, name: &str, value: &Expr, span: Span) -> CompileResult<()> {
        if let ExprKind::Func {
            params,
            variadic,
            body,
            name: fn_name,
        } = &value.kind
        {
            let binding = self.table.define(name, span)?;
            let label = fn_name.clone().unwrap_or_else(|| name.to_string());
            self.func_literal(params, *variadic, body, Some(label), value.span)?;
            self.store_new(binding, span);
        } else {
            self.compile_expr(value)?;
            let binding = self.table.define(name, span)?;
            self.store_new(binding, span);
        }
        Ok(())
    }

    fn store_new(&mut self, binding: Binding, span: Span) {
        match binding {
            Binding::Global(idx) => {
                self.emit(Op::SetGlobal(idx), span);
                self.emit(Op::Pop, span);
            }
            // The value's stack slot is the local; nothing to emit.
            _ => {}
        }
    }

    /// C-style loop. A header-declared variable gets a per-iteration shadow
    /// copy in the body scope, written back before the post statement runs,
    /// so closures created in the body capture that iteration's value.
    fn for_stmt(
        &mut self,
        init: Option<&Stmt>,
        condition: Option<&Expr>,
        post: Option<&Stmt>,
        body: &[Stmt],
        span: Span,
    ) -> CompileResult<()> {
        self.begin_scope(); // header scope
        let mut header: Option<(String, u16)> = None;
        if let Some(init) = init {
            self.compile_stmt(init)?;
            if let StmtKind::Declare { name, .. } = &init.kind {
                if let Some(Binding::Local(slot)) = self.table.resolve(name) {
                    header = Some((name.clone(), slot));
                }
            }
        }

        let loop_start = self.chunk().len();
        let exit_jump = match condition {
            Some(cond) => {
                self.compile_expr(cond)?;
                Some(self.emit(Op::JumpIfFalse(0), cond.span))
            }
            None => None,
        };

        self.begin_loop(loop_start, false);
        self.begin_scope(); // body scope
        if let Some((name, slot)) = &header {
            // Fresh copy of the header variable for this iteration. It
            // shadows the header slot for the whole body.
            self.emit(Op::GetLocal(*slot), span);
            if let Binding::Local(shadow) = self.table.define(name, span)? {
                if let Some(ctx) = self.loops.last_mut() {
                    ctx.shadow = Some((*slot, shadow));
                }
            }
        }
        for s in body {
            self.compile_stmt(s)?;
        }
        if let Some((header_slot, shadow)) = self.current_loop().and_then(|ctx| ctx.shadow) {
            self.copy_back(header_slot, shadow, span);
        }
        self.end_scope(span);

        let ctx = self.end_loop();
        for offset in &ctx.continues {
            self.patch_jump(*offset);
        }
        if let Some(post) = post {
            self.compile_stmt(post)?;
        }
        self.emit_loop(loop_start, span)?;
        if let Some(offset) = exit_jump {
            self.patch_jump(offset);
        }
        for offset in &ctx.breaks {
            self.patch_jump(*offset);
        }
        self.end_scope(span); // header scope
        Ok(())
    }

    /// `for key, value in iterable { .. }`. The bindings are fresh locals in
    /// the body scope, so per-iteration capture holds without a shadow.
    fn for_in_stmt(
        &mut self,
        key: &str,
        value: Option<&str>,
        iterable: &Expr,
        body: &[Stmt],
        span: Span,
    ) -> CompileResult<()> {
        self.compile_expr(iterable)?;
        self.emit(Op::IterInit, iterable.span);

        let loop_start = self.chunk().len();
        let iter_jump = self.emit(Op::IterNext(0), span);

        self.begin_loop(loop_start, true);
        self.begin_scope();
        // IterNext pushed this round's key and value; bind their slots.
        self.table.define(key, span)?;
        // An anonymous slot keeps the stack shape when the value binding is
        // omitted; the empty name is unreferencable.
        self.table.define(value.unwrap_or(""), span)?;
        for s in body {
            self.compile_stmt(s)?;
        }
        self.end_scope(span);

        let ctx = self.end_loop();
        for offset in &ctx.continues {
            self.patch_jump(*offset);
        }
        self.emit_loop(loop_start, span)?;
        if ctx.breaks.is_empty() {
            self.patch_jump(iter_jump);
        } else {
            // Break paths land here to discard the live iterator; normal
            // exhaustion jumps past (IterNext already popped it).
            for offset in &ctx.breaks {
                self.patch_jump(*offset);
            }
            self.emit(Op::IterPop, span);
            self.patch_jump(iter_jump);
        }
        Ok(())
    }

    fn copy_back(&mut self, header: u16, shadow: u16, span: Span) {
        self.emit(Op::GetLocal(shadow), span);
        self.emit(Op::SetLocal(header), span);
        self.emit(Op::Pop, span);
    }
}
