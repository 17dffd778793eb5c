//! Expression compilation — AST expressions to bytecode.

use std::rc::Rc;

use crate::ast::expr::{BinaryOp, ExprKind, UnaryOp};
use crate::ast::{Expr, Stmt};
use crate::error::CompileError;
use crate::span::Span;

use super::chunk::Constant;
use super::compiler::{CompileResult, Compiler};
use super::opcode::Op;
use super::symbol::Binding;

impl Compiler<'_> {
    /// Compile an expression — the result is left on the stack.
    pub fn compile_expr(&mut self, expr: &Expr) -> CompileResult<()> {
        let span = expr.span;
        match &expr.kind {
            ExprKind::IntLit(n) => {
                let idx = self.constant(Constant::Int(*n), span)?;
                self.emit(Op::Constant(idx), span);
            }
            ExprKind::FloatLit(n) => {
                let idx = self.constant(Constant::Float(*n), span)?;
                self.emit(Op::Constant(idx), span);
            }
            ExprKind::BoolLit(b) => {
                self.emit(if *b { Op::True } else { Op::False }, span);
            }
            ExprKind::CharLit(c) => {
                let idx = self.constant(Constant::Char(*c), span)?;
                self.emit(Op::Constant(idx), span);
            }
            ExprKind::StringLit(s) => {
                let idx = self.constant(Constant::Str(s.clone()), span)?;
                self.emit(Op::Constant(idx), span);
            }
            ExprKind::Undefined => {
                self.emit(Op::Undefined, span);
            }

            ExprKind::Ident(name) => {
                self.load_name(name, span)?;
            }

            ExprKind::Binary {
                operator,
                left,
                right,
            } => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                self.emit(binary_op(*operator), span);
            }

            ExprKind::Unary { operator, operand } => {
                self.compile_expr(operand)?;
                match operator {
                    UnaryOp::Negate => self.emit(Op::Negate, span),
                    UnaryOp::Not => self.emit(Op::Not, span),
                };
            }

            ExprKind::LogicalAnd { left, right } => {
                self.compile_expr(left)?;
                let short = self.emit(Op::JumpIfFalseNoPop(0), span);
                self.emit(Op::Pop, span);
                self.compile_expr(right)?;
                self.patch_jump(short);
            }

            ExprKind::LogicalOr { left, right } => {
                self.compile_expr(left)?;
                let short = self.emit(Op::JumpIfTrueNoPop(0), span);
                self.emit(Op::Pop, span);
                self.compile_expr(right)?;
                self.patch_jump(short);
            }

            ExprKind::Cond {
                condition,
                then_branch,
                else_branch,
            } => {
                self.compile_expr(condition)?;
                let jump_else = self.emit(Op::JumpIfFalse(0), span);
                self.compile_expr(then_branch)?;
                let jump_end = self.emit(Op::Jump(0), span);
                self.patch_jump(jump_else);
                self.compile_expr(else_branch)?;
                self.patch_jump(jump_end);
            }

            ExprKind::Assign { target, value } => {
                self.assign(target, value, span)?;
            }

            ExprKind::Array(elements) => {
                if elements.len() > u16::MAX as usize {
                    return Err(CompileError::too_many("array elements", span));
                }
                for element in elements {
                    self.compile_expr(element)?;
                }
                self.emit(Op::MakeArray(elements.len() as u16), span);
            }

            ExprKind::Map(entries) => {
                if entries.len() > u16::MAX as usize {
                    return Err(CompileError::too_many("map entries", span));
                }
                for (key, value) in entries {
                    let idx = self.constant(Constant::Str(key.clone()), span)?;
                    self.emit(Op::Constant(idx), span);
                    self.compile_expr(value)?;
                }
                self.emit(Op::MakeMap(entries.len() as u16), span);
            }

            ExprKind::Index { object, index } => {
                self.compile_expr(object)?;
                self.compile_expr(index)?;
                self.emit(Op::GetIndex, span);
            }

            ExprKind::Slice { object, low, high } => {
                self.compile_expr(object)?;
                match low {
                    Some(low) => self.compile_expr(low)?,
                    None => {
                        self.emit(Op::Undefined, span);
                    }
                }
                match high {
                    Some(high) => self.compile_expr(high)?,
                    None => {
                        self.emit(Op::Undefined, span);
                    }
                }
                self.emit(Op::Slice, span);
            }

            ExprKind::Call {
                callee,
                arguments,
                spread,
            } => {
                if arguments.len() > u8::MAX as usize {
                    return Err(CompileError::too_many("call arguments", span));
                }
                if *spread && arguments.is_empty() {
                    return Err(CompileError::new("spread call without arguments", span));
                }
                self.compile_expr(callee)?;
                for argument in arguments {
                    self.compile_expr(argument)?;
                }
                self.emit(Op::Call(arguments.len() as u8, *spread), span);
            }

            ExprKind::Func {
                params,
                variadic,
                body,
                name,
            } => {
                self.func_literal(params, *variadic, body, name.clone(), span)?;
            }

            ExprKind::Import(name) => {
                self.import(name, span)?;
            }
        }
        Ok(())
    }

    fn load_name(&mut self, name: &str, span: Span) -> CompileResult<()> {
        match self.table.resolve(name) {
            Some(Binding::Local(idx)) => self.emit(Op::GetLocal(idx), span),
            Some(Binding::Global(idx)) => self.emit(Op::GetGlobal(idx), span),
            Some(Binding::Free(idx)) => self.emit(Op::GetFree(idx), span),
            Some(Binding::Builtin(idx)) => self.emit(Op::GetBuiltin(idx), span),
            None => return Err(CompileError::undefined_variable(name, span)),
        };
        Ok(())
    }

    /// Assignment expression: the stored value (or the Error value for a
    /// rejected store) is left on the stack.
    fn assign(&mut self, target: &Expr, value: &Expr, span: Span) -> CompileResult<()> {
        match &target.kind {
            ExprKind::Ident(name) => {
                self.compile_expr(value)?;
                match self.table.resolve(name) {
                    Some(Binding::Local(idx)) => self.emit(Op::SetLocal(idx), span),
                    Some(Binding::Global(idx)) => self.emit(Op::SetGlobal(idx), span),
                    Some(Binding::Free(idx)) => self.emit(Op::SetFree(idx), span),
                    Some(Binding::Builtin(_)) => {
                        return Err(CompileError::new(
                            format!("cannot assign to builtin '{}'", name),
                            span,
                        ))
                    }
                    None => return Err(CompileError::undefined_variable(name, span)),
                };
            }
            ExprKind::Index { object, index } => {
                self.compile_expr(object)?;
                self.compile_expr(index)?;
                self.compile_expr(value)?;
                self.emit(Op::SetIndex, span);
            }
            _ => {
                return Err(CompileError::new("invalid assignment target", span));
            }
        }
        Ok(())
    }

    /// Compile a function literal into a nested prototype and emit the
    /// MakeClosure that instantiates it.
    pub(super) fn func_literal(
        &mut self,
        params: &[String],
        variadic: bool,
        body: &[Stmt],
        name: Option<String>,
        span: Span,
    ) -> CompileResult<()> {
        self.start_function(name, params, variadic, span)?;
        for stmt in body {
            self.compile_stmt(stmt)?;
        }
        let proto = self.finish_function(span);
        let idx = self.constant(Constant::Function(Rc::new(proto)), span)?;
        self.emit(Op::MakeClosure(idx), span);
        Ok(())
    }

    /// Builtin modules resolve at compile time to their frozen value in the
    /// constant pool; source modules defer to an Import lookup.
    fn import(&mut self, name: &str, span: Span) -> CompileResult<()> {
        if let Some(value) = self.loader.builtin(name) {
            let idx = self.constant(Constant::Module(value.clone()), span)?;
            self.emit(Op::Constant(idx), span);
        } else if self.loader.has_source(name) {
            let idx = self.constant(Constant::Str(name.to_string()), span)?;
            self.emit(Op::Import(idx), span);
            self.source_imports.push((name.to_string(), span));
        } else {
            return Err(CompileError::UnknownModule(name.to_string(), span));
        }
        Ok(())
    }
}

fn binary_op(op: BinaryOp) -> Op {
    match op {
        BinaryOp::Add => Op::Add,
        BinaryOp::Subtract => Op::Subtract,
        BinaryOp::Multiply => Op::Multiply,
        BinaryOp::Divide => Op::Divide,
        BinaryOp::Remainder => Op::Remainder,
        BinaryOp::Equal => Op::Equal,
        BinaryOp::NotEqual => Op::NotEqual,
        BinaryOp::Less => Op::Less,
        BinaryOp::LessEqual => Op::LessEqual,
        BinaryOp::Greater => Op::Greater,
        BinaryOp::GreaterEqual => Op::GreaterEqual,
    }
}
