//! The bytecode virtual machine — stack-based execution engine.
//!
//! One dispatch loop serves the whole program: closure calls push a frame
//! and stay inside the loop, while native functions that call back into
//! script run a nested loop pinned to a frame floor (see
//! [`Interop`](super::vm_calls::Interop)).
//!
//! Failure discipline: recoverable errors (type and arity mismatches, bad
//! indexes, division by zero, string/bytes ceilings) become a first-class
//! `Error` value pushed at the result position, and execution continues on a
//! consistent stack. Fatal errors (instruction budget, stack or frame
//! overflow, cancellation, corrupt bytecode, module compile failures) abort
//! the run. At-most-once, no rollback: globals mutated before an abort stay
//! mutated.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::builtins::Builtins;
use crate::error::RuntimeError;
use crate::limits::ResourceLimits;
use crate::modules::ModuleLoader;
use crate::span::Span;
use crate::value::{ops, NativeFunction, Value, ValueMap};

use super::cell::{Cell, Closure};
use super::chunk::{CompiledUnit, Constant, FunctionProto};
use super::opcode::Op;

/// One activation record: the running closure, its instruction pointer, and
/// where its slots start on the operand stack (slot 0 holds the callee).
pub(crate) struct CallFrame {
    pub closure: Rc<Closure>,
    pub ip: usize,
    pub base: usize,
    /// Iterator-stack floor; Return truncates back to it so a return out of
    /// a for-in body discards the live iterator.
    pub iter_base: usize,
}

/// For-in state: key/value pairs snapshotted at IterInit, so mutating the
/// container mid-loop does not disturb the walk.
pub(crate) struct ValueIterator {
    pairs: Vec<(Value, Value)>,
    next: usize,
}

/// The virtual machine.
pub struct Vm {
    unit: CompiledUnit,
    globals: Vec<Value>,
    pub(super) stack: Vec<Value>,
    pub(super) frames: Vec<CallFrame>,
    iterators: Vec<ValueIterator>,
    /// Open cells over live stack slots, ascending by slot.
    open_cells: Vec<(usize, Rc<RefCell<Cell>>)>,
    builtins: Vec<NativeFunction>,
    builtin_names: Vec<String>,
    loader: ModuleLoader,
    pub(super) limits: ResourceLimits,
    cancel: Option<Arc<AtomicBool>>,
    instructions: u64,
}

impl Vm {
    pub fn new(
        unit: CompiledUnit,
        builtins: Builtins,
        loader: ModuleLoader,
        limits: ResourceLimits,
    ) -> Self {
        let globals = vec![Value::Undefined; unit.num_globals()];
        let builtins = builtins.into_functions();
        let builtin_names = builtins
            .iter()
            .map(|f| f.name.as_ref().clone())
            .collect();
        Self {
            unit,
            globals,
            stack: Vec::new(),
            frames: Vec::new(),
            iterators: Vec::new(),
            open_cells: Vec::new(),
            builtins,
            builtin_names,
            loader,
            limits,
            cancel: None,
            instructions: 0,
        }
    }

    /// Pre-seed named global slots before the first run. Names the program
    /// never declared are ignored.
    pub fn with_globals(mut self, globals: &[(&str, Value)]) -> Self {
        for (name, value) in globals {
            if let Some(idx) = self.unit.global_index(name) {
                self.globals[idx] = value.clone();
            }
        }
        self
    }

    /// Read a global by name after a run.
    pub fn global(&self, name: &str) -> Option<Value> {
        self.unit
            .global_index(name)
            .and_then(|idx| self.globals.get(idx))
            .cloned()
    }

    /// Instructions executed by the last run.
    pub fn instructions_executed(&self) -> u64 {
        self.instructions
    }

    pub fn run(&mut self) -> Result<(), RuntimeError> {
        self.cancel = None;
        self.execute()
    }

    /// Run with a cooperative cancellation token, polled at loop back-edges
    /// and call boundaries.
    pub fn run_with_cancellation(&mut self, token: Arc<AtomicBool>) -> Result<(), RuntimeError> {
        self.cancel = Some(token);
        self.execute()
    }

    fn execute(&mut self) -> Result<(), RuntimeError> {
        // Transient state resets per run; globals persist across runs.
        self.stack.clear();
        self.frames.clear();
        self.iterators.clear();
        self.open_cells.clear();
        self.instructions = 0;

        let main = Rc::new(Closure::new(self.unit.main.clone(), Vec::new()));
        self.stack.push(Value::Closure(main.clone()));
        self.frames.push(CallFrame {
            closure: main,
            ip: 0,
            base: 0,
            iter_base: 0,
        });
        self.run_loop(1).map(|_| ())
    }

    /// The dispatch loop. Runs until the frame count drops below
    /// `min_frames`, returning the value the last popped frame produced;
    /// nested entries (native re-entry, module evaluation) pin their own
    /// floor.
    pub(super) fn run_loop(&mut self, min_frames: usize) -> Result<Value, RuntimeError> {
        loop {
            let (op, span) = self.fetch()?;
            self.instructions += 1;
            if let Some(max) = self.limits.max_instructions {
                if self.instructions > max {
                    return Err(RuntimeError::InstructionLimit(max));
                }
            }

            match op {
                Op::Constant(idx) => {
                    let value = self.constant_at(idx)?;
                    self.push(value, span)?;
                }
                Op::True => self.push(Value::Bool(true), span)?,
                Op::False => self.push(Value::Bool(false), span)?,
                Op::Undefined => self.push(Value::Undefined, span)?,
                Op::Pop => {
                    self.pop()?;
                }

                Op::GetLocal(idx) => {
                    let slot = self.frame()?.base + idx as usize;
                    let value = self
                        .stack
                        .get(slot)
                        .cloned()
                        .ok_or_else(|| RuntimeError::corrupt("local slot out of range"))?;
                    self.push(value, span)?;
                }
                Op::SetLocal(idx) => {
                    let slot = self.frame()?.base + idx as usize;
                    let value = self.peek()?.clone();
                    match self.stack.get_mut(slot) {
                        Some(dest) => *dest = value,
                        None => return Err(RuntimeError::corrupt("local slot out of range")),
                    }
                }
                Op::GetGlobal(idx) => {
                    let value = self
                        .globals
                        .get(idx as usize)
                        .cloned()
                        .ok_or_else(|| RuntimeError::corrupt("global slot out of range"))?;
                    self.push(value, span)?;
                }
                Op::SetGlobal(idx) => {
                    let value = self.peek()?.clone();
                    match self.globals.get_mut(idx as usize) {
                        Some(dest) => *dest = value,
                        None => return Err(RuntimeError::corrupt("global slot out of range")),
                    }
                }
                Op::GetBuiltin(idx) => {
                    let native = self
                        .builtins
                        .get(idx as usize)
                        .cloned()
                        .ok_or_else(|| RuntimeError::corrupt("builtin index out of range"))?;
                    self.push(Value::Native(native), span)?;
                }

                Op::GetFree(idx) => {
                    let cell = self.cell_at(idx)?;
                    let value = match &*cell.borrow() {
                        Cell::Open(slot) => self
                            .stack
                            .get(*slot)
                            .cloned()
                            .ok_or_else(|| RuntimeError::corrupt("open cell slot out of range"))?,
                        Cell::Closed(value) => value.clone(),
                    };
                    self.push(value, span)?;
                }
                Op::SetFree(idx) => {
                    let cell = self.cell_at(idx)?;
                    let value = self.peek()?.clone();
                    let mut cell = cell.borrow_mut();
                    match &mut *cell {
                        Cell::Open(slot) => match self.stack.get_mut(*slot) {
                            Some(dest) => *dest = value,
                            None => {
                                return Err(RuntimeError::corrupt("open cell slot out of range"))
                            }
                        },
                        Cell::Closed(dest) => *dest = value,
                    }
                }
                Op::CloseCell => {
                    let slot = self
                        .stack
                        .len()
                        .checked_sub(1)
                        .ok_or_else(|| RuntimeError::corrupt("stack underflow"))?;
                    self.close_cells(slot);
                    self.stack.pop();
                }

                Op::Add => {
                    let (a, b) = self.pop_pair()?;
                    let result = ops::add(a, b, &self.limits, span);
                    self.push_result(result, span)?;
                }
                Op::Subtract => {
                    let (a, b) = self.pop_pair()?;
                    let result = ops::subtract(a, b, span);
                    self.push_result(result, span)?;
                }
                Op::Multiply => {
                    let (a, b) = self.pop_pair()?;
                    let result = ops::multiply(a, b, span);
                    self.push_result(result, span)?;
                }
                Op::Divide => {
                    let (a, b) = self.pop_pair()?;
                    let result = ops::divide(a, b, span);
                    self.push_result(result, span)?;
                }
                Op::Remainder => {
                    let (a, b) = self.pop_pair()?;
                    let result = ops::remainder(a, b, span);
                    self.push_result(result, span)?;
                }
                Op::Negate => {
                    let value = self.pop()?;
                    let result = ops::negate(value, span);
                    self.push_result(result, span)?;
                }

                Op::Equal => {
                    let (a, b) = self.pop_pair()?;
                    self.push(Value::Bool(a == b), span)?;
                }
                Op::NotEqual => {
                    let (a, b) = self.pop_pair()?;
                    self.push(Value::Bool(a != b), span)?;
                }
                Op::Less => {
                    let (a, b) = self.pop_pair()?;
                    let result = ops::compare_less(&a, &b, span).map(Value::Bool);
                    self.push_result(result, span)?;
                }
                Op::LessEqual => {
                    let (a, b) = self.pop_pair()?;
                    let result = ops::compare_less_equal(&a, &b, span).map(Value::Bool);
                    self.push_result(result, span)?;
                }
                Op::Greater => {
                    let (a, b) = self.pop_pair()?;
                    let result = ops::compare_less(&b, &a, span).map(Value::Bool);
                    self.push_result(result, span)?;
                }
                Op::GreaterEqual => {
                    let (a, b) = self.pop_pair()?;
                    let result = ops::compare_less_equal(&b, &a, span).map(Value::Bool);
                    self.push_result(result, span)?;
                }
                Op::Not => {
                    let value = self.pop()?;
                    self.push(Value::Bool(value.is_falsy()), span)?;
                }

                Op::Jump(offset) => {
                    self.frame_mut()?.ip += offset as usize;
                }
                Op::JumpIfFalse(offset) => {
                    let value = self.pop()?;
                    if value.is_falsy() {
                        self.frame_mut()?.ip += offset as usize;
                    }
                }
                Op::JumpIfFalseNoPop(offset) => {
                    if self.peek()?.is_falsy() {
                        self.frame_mut()?.ip += offset as usize;
                    }
                }
                Op::JumpIfTrueNoPop(offset) => {
                    if !self.peek()?.is_falsy() {
                        self.frame_mut()?.ip += offset as usize;
                    }
                }
                Op::Loop(offset) => {
                    self.poll_cancel()?;
                    let frame = self.frame_mut()?;
                    frame.ip = frame
                        .ip
                        .checked_sub(offset as usize)
                        .ok_or_else(|| RuntimeError::corrupt("loop target out of range"))?;
                }

                Op::MakeArray(count) => {
                    let start = self
                        .stack
                        .len()
                        .checked_sub(count as usize)
                        .ok_or_else(|| RuntimeError::corrupt("stack underflow"))?;
                    let elements = self.stack.split_off(start);
                    self.push(Value::array(elements), span)?;
                }
                Op::MakeMap(count) => {
                    let start = self
                        .stack
                        .len()
                        .checked_sub(2 * count as usize)
                        .ok_or_else(|| RuntimeError::corrupt("stack underflow"))?;
                    let mut entries = ValueMap::default();
                    let mut flat = self.stack.split_off(start).into_iter();
                    while let (Some(key), Some(value)) = (flat.next(), flat.next()) {
                        match key {
                            Value::Str(key) => {
                                entries.insert(key.as_ref().clone(), value);
                            }
                            _ => return Err(RuntimeError::corrupt("non-string map key")),
                        }
                    }
                    self.push(Value::Map(Rc::new(RefCell::new(entries))), span)?;
                }
                Op::MakeClosure(idx) => {
                    let closure = self.make_closure(idx)?;
                    self.push(Value::Closure(closure), span)?;
                }

                Op::GetIndex => {
                    let index = self.pop()?;
                    let object = self.pop()?;
                    let result = ops::index_get(&object, &index, span);
                    self.push_result(result, span)?;
                }
                Op::SetIndex => {
                    let value = self.pop()?;
                    let index = self.pop()?;
                    let object = self.pop()?;
                    match ops::index_set(&object, &index, value.clone(), span) {
                        // The assignment expression's value is the stored one.
                        Ok(()) => self.push(value, span)?,
                        Err(err) if err.is_fatal() => return Err(err),
                        Err(err) => self.push(Value::error_from(&err), span)?,
                    }
                }
                Op::Slice => {
                    let high = self.pop()?;
                    let low = self.pop()?;
                    let object = self.pop()?;
                    let result = ops::slice(&object, &low, &high, span);
                    self.push_result(result, span)?;
                }

                Op::IterInit => {
                    let value = self.pop()?;
                    // No result position exists here, so a non-iterable
                    // aborts the run instead of becoming an Error value.
                    let iterator = self.make_iterator(value, span)?;
                    self.iterators.push(iterator);
                }
                Op::IterNext(offset) => {
                    let iterator = self
                        .iterators
                        .last_mut()
                        .ok_or_else(|| RuntimeError::corrupt("no live iterator"))?;
                    if iterator.next < iterator.pairs.len() {
                        let (key, value) = iterator.pairs[iterator.next].clone();
                        iterator.next += 1;
                        self.push(key, span)?;
                        self.push(value, span)?;
                    } else {
                        self.iterators.pop();
                        self.frame_mut()?.ip += offset as usize;
                    }
                }
                Op::IterPop => {
                    self.iterators
                        .pop()
                        .ok_or_else(|| RuntimeError::corrupt("no live iterator"))?;
                }

                Op::Call(argc, spread) => {
                    self.poll_cancel()?;
                    self.call_value(argc, spread, span)?;
                }
                Op::Return => {
                    let result = self.pop()?;
                    let frame = self
                        .frames
                        .pop()
                        .ok_or_else(|| RuntimeError::corrupt("no call frame"))?;
                    self.close_cells(frame.base);
                    self.iterators.truncate(frame.iter_base);
                    self.stack.truncate(frame.base);
                    if self.frames.len() < min_frames {
                        return Ok(result);
                    }
                    self.push(result, span)?;
                }

                Op::Import(idx) => {
                    let name = match self.raw_constant(idx)? {
                        Constant::Str(name) => name.clone(),
                        _ => return Err(RuntimeError::corrupt("import of non-string constant")),
                    };
                    self.import_module(&name, span)?;
                }
            }
        }
    }

    // --- Fetch & constants ---

    fn fetch(&mut self) -> Result<(Op, Span), RuntimeError> {
        let frame = self
            .frames
            .last_mut()
            .ok_or_else(|| RuntimeError::corrupt("no call frame"))?;
        let chunk = &frame.closure.proto.chunk;
        match chunk.code.get(frame.ip).copied() {
            Some(op) => {
                let span = chunk.span_at(frame.ip);
                frame.ip += 1;
                Ok((op, span))
            }
            None => Err(RuntimeError::corrupt("instruction pointer past chunk end")),
        }
    }

    fn frame(&self) -> Result<&CallFrame, RuntimeError> {
        self.frames
            .last()
            .ok_or_else(|| RuntimeError::corrupt("no call frame"))
    }

    fn frame_mut(&mut self) -> Result<&mut CallFrame, RuntimeError> {
        self.frames
            .last_mut()
            .ok_or_else(|| RuntimeError::corrupt("no call frame"))
    }

    fn raw_constant(&self, idx: u16) -> Result<&Constant, RuntimeError> {
        self.frame()?
            .closure
            .proto
            .chunk
            .constants
            .get(idx as usize)
            .ok_or_else(|| RuntimeError::corrupt("constant index out of range"))
    }

    fn constant_at(&self, idx: u16) -> Result<Value, RuntimeError> {
        Ok(match self.raw_constant(idx)? {
            Constant::Int(n) => Value::Int(*n),
            Constant::Float(n) => Value::Float(*n),
            Constant::Char(c) => Value::Char(*c),
            Constant::Str(s) => Value::string(s.clone()),
            Constant::Module(value) => value.clone(),
            Constant::Function(proto) if proto.captures.is_empty() => {
                Value::Closure(Rc::new(Closure::new(proto.clone(), Vec::new())))
            }
            Constant::Function(_) => {
                return Err(RuntimeError::corrupt(
                    "capturing function outside MakeClosure",
                ))
            }
        })
    }

    fn cell_at(&self, idx: u16) -> Result<Rc<RefCell<Cell>>, RuntimeError> {
        self.frame()?
            .closure
            .cells
            .get(idx as usize)
            .cloned()
            .ok_or_else(|| RuntimeError::corrupt("capture index out of range"))
    }

    // --- Stack ---

    pub(super) fn push(&mut self, value: Value, span: Span) -> Result<(), RuntimeError> {
        if self.stack.len() >= self.limits.max_stack {
            return Err(RuntimeError::StackOverflow(span));
        }
        self.stack.push(value);
        Ok(())
    }

    pub(super) fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack
            .pop()
            .ok_or_else(|| RuntimeError::corrupt("stack underflow"))
    }

    fn peek(&self) -> Result<&Value, RuntimeError> {
        self.stack
            .last()
            .ok_or_else(|| RuntimeError::corrupt("stack underflow"))
    }

    fn pop_pair(&mut self) -> Result<(Value, Value), RuntimeError> {
        let b = self.pop()?;
        let a = self.pop()?;
        Ok((a, b))
    }

    /// Push an operation's outcome: recoverable failures become a catchable
    /// Error value at the result position, fatal ones abort.
    fn push_result(
        &mut self,
        result: Result<Value, RuntimeError>,
        span: Span,
    ) -> Result<(), RuntimeError> {
        match result {
            Ok(value) => self.push(value, span),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => self.push(Value::error_from(&err), span),
        }
    }

    // --- Cells ---

    /// Cell over a live stack slot, shared with any earlier capture of it.
    pub(super) fn capture_cell(&mut self, slot: usize) -> Rc<RefCell<Cell>> {
        if let Some((_, cell)) = self.open_cells.iter().find(|(s, _)| *s == slot) {
            return cell.clone();
        }
        let cell = Rc::new(RefCell::new(Cell::Open(slot)));
        let pos = self.open_cells.partition_point(|(s, _)| *s < slot);
        self.open_cells.insert(pos, (slot, cell.clone()));
        cell
    }

    /// Close every open cell at or above `from`: the captured value moves
    /// off the stack into the cell.
    pub(super) fn close_cells(&mut self, from: usize) {
        while let Some((slot, _)) = self.open_cells.last() {
            if *slot < from {
                break;
            }
            if let Some((slot, cell)) = self.open_cells.pop() {
                let value = self.stack.get(slot).cloned().unwrap_or(Value::Undefined);
                *cell.borrow_mut() = Cell::Closed(value);
            }
        }
    }

    fn make_closure(&mut self, idx: u16) -> Result<Rc<Closure>, RuntimeError> {
        let (proto, enclosing, base) = {
            let frame = self.frame()?;
            let proto = match frame.closure.proto.chunk.constants.get(idx as usize) {
                Some(Constant::Function(proto)) => proto.clone(),
                _ => return Err(RuntimeError::corrupt("MakeClosure of non-function constant")),
            };
            (proto, frame.closure.clone(), frame.base)
        };
        let mut cells = Vec::with_capacity(proto.captures.len());
        for capture in &proto.captures {
            if capture.is_local {
                cells.push(self.capture_cell(base + capture.index as usize));
            } else {
                let cell = enclosing
                    .cells
                    .get(capture.index as usize)
                    .cloned()
                    .ok_or_else(|| RuntimeError::corrupt("capture index out of range"))?;
                cells.push(cell);
            }
        }
        Ok(Rc::new(Closure::new(proto, cells)))
    }

    // --- Iteration ---

    fn make_iterator(&self, value: Value, span: Span) -> Result<ValueIterator, RuntimeError> {
        let pairs: Vec<(Value, Value)> = match &value {
            Value::Array(arr) => arr
                .borrow()
                .iter()
                .cloned()
                .enumerate()
                .map(|(i, element)| (Value::Int(i as i64), element))
                .collect(),
            Value::ImmutableArray(arr) => arr
                .iter()
                .cloned()
                .enumerate()
                .map(|(i, element)| (Value::Int(i as i64), element))
                .collect(),
            Value::Map(map) => map
                .borrow()
                .iter()
                .map(|(key, value)| (Value::string(key.clone()), value.clone()))
                .collect(),
            Value::ImmutableMap(map) => map
                .iter()
                .map(|(key, value)| (Value::string(key.clone()), value.clone()))
                .collect(),
            Value::Str(s) => s
                .chars()
                .enumerate()
                .map(|(i, c)| (Value::Int(i as i64), Value::Char(c)))
                .collect(),
            Value::Bytes(bytes) => bytes
                .iter()
                .enumerate()
                .map(|(i, byte)| (Value::Int(i as i64), Value::Int(*byte as i64)))
                .collect(),
            other => {
                return Err(RuntimeError::type_mismatch(
                    "iterable value",
                    other.type_name(),
                    span,
                ))
            }
        };
        Ok(ValueIterator { pairs, next: 0 })
    }

    // --- Modules ---

    fn import_module(&mut self, name: &str, span: Span) -> Result<(), RuntimeError> {
        if let Some(value) = self.loader.export(name) {
            return self.push(value, span);
        }
        let proto = self.loader.load_proto(name, &self.builtin_names, span)?;
        let value = self.eval_module(proto, span)?;
        self.loader.set_export(name, value.clone());
        self.push(value, span)
    }

    /// Run a module body to completion in a nested dispatch; its Return (the
    /// export, or undefined) is the module's value.
    fn eval_module(
        &mut self,
        proto: Rc<FunctionProto>,
        span: Span,
    ) -> Result<Value, RuntimeError> {
        let closure = Rc::new(Closure::new(proto, Vec::new()));
        let base = self.stack.len();
        self.push(Value::Closure(closure.clone()), span)?;
        self.push_frame(closure, base, span)?;
        self.run_loop(self.frames.len())
    }

    // --- Cancellation ---

    fn poll_cancel(&self) -> Result<(), RuntimeError> {
        match &self.cancel {
            Some(token) if token.load(Ordering::Relaxed) => Err(RuntimeError::Cancelled),
            _ => Ok(()),
        }
    }

    pub(super) fn push_frame(
        &mut self,
        closure: Rc<Closure>,
        base: usize,
        span: Span,
    ) -> Result<(), RuntimeError> {
        if self.frames.len() >= self.limits.max_frames {
            return Err(RuntimeError::StackOverflow(span));
        }
        if base + closure.proto.num_locals as usize > self.limits.max_stack {
            return Err(RuntimeError::StackOverflow(span));
        }
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            base,
            iter_base: self.iterators.len(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    use crate::ast::stmt::Program;
    use crate::ast::{BinaryOp, Expr, Stmt};
    use crate::vm::Compiler;

    fn sp() -> Span {
        Span::default()
    }

    fn int(n: i64) -> Expr {
        Expr::int(n, sp())
    }

    fn ident(name: &str) -> Expr {
        Expr::ident(name, sp())
    }

    fn bin(op: BinaryOp, left: Expr, right: Expr) -> Expr {
        Expr::binary(op, left, right)
    }

    fn build(stmts: Vec<Stmt>, builtins: Builtins, mut loader: ModuleLoader, limits: ResourceLimits) -> Vm {
        let unit = Compiler::compile(&Program::new(stmts), builtins.names(), &mut loader)
            .expect("compile");
        Vm::new(unit, builtins, loader, limits)
    }

    fn run_with(
        stmts: Vec<Stmt>,
        builtins: Builtins,
        loader: ModuleLoader,
        limits: ResourceLimits,
    ) -> Vm {
        let mut vm = build(stmts, builtins, loader, limits);
        vm.run().expect("run");
        vm
    }

    fn run_program(stmts: Vec<Stmt>) -> Vm {
        run_with(
            stmts,
            Builtins::core(),
            ModuleLoader::new(),
            ResourceLimits::default(),
        )
    }

    fn global(vm: &Vm, name: &str) -> Value {
        vm.global(name).expect("global should exist")
    }

    #[test]
    fn test_arithmetic_precedence_via_tree_shape() {
        let vm = run_program(vec![Stmt::declare(
            "x",
            bin(BinaryOp::Add, int(2), bin(BinaryOp::Multiply, int(3), int(4))),
        )]);
        assert_eq!(global(&vm, "x"), Value::Int(14));
    }

    #[test]
    fn test_if_else_branches() {
        let branchy = |cond: bool| {
            vec![
                Stmt::declare("x", int(0)),
                Stmt::if_stmt(
                    Expr::boolean(cond, sp()),
                    vec![Stmt::expression(Expr::assign(ident("x"), int(1)))],
                    Some(vec![Stmt::expression(Expr::assign(ident("x"), int(2)))]),
                ),
            ]
        };
        assert_eq!(global(&run_program(branchy(true)), "x"), Value::Int(1));
        assert_eq!(global(&run_program(branchy(false)), "x"), Value::Int(2));
    }

    #[test]
    fn test_conditional_and_short_circuit() {
        let vm = run_program(vec![
            Stmt::declare("hits", int(0)),
            Stmt::declare(
                "bump",
                Expr::func(
                    vec![],
                    vec![
                        Stmt::expression(Expr::assign(
                            ident("hits"),
                            bin(BinaryOp::Add, ident("hits"), int(1)),
                        )),
                        Stmt::ret(Some(Expr::boolean(true, sp())), sp()),
                    ],
                    sp(),
                ),
            ),
            Stmt::declare(
                "a",
                Expr::and(Expr::boolean(false, sp()), Expr::call(ident("bump"), vec![])),
            ),
            Stmt::declare(
                "b",
                Expr::or(Expr::boolean(true, sp()), Expr::call(ident("bump"), vec![])),
            ),
            Stmt::declare("t", Expr::cond(Expr::boolean(true, sp()), int(1), int(2))),
        ]);
        assert_eq!(global(&vm, "hits"), Value::Int(0));
        assert_eq!(global(&vm, "a"), Value::Bool(false));
        assert_eq!(global(&vm, "b"), Value::Bool(true));
        assert_eq!(global(&vm, "t"), Value::Int(1));
    }

    #[test]
    fn test_block_scoped_shadowing() {
        let vm = run_program(vec![
            Stmt::declare("x", int(10)),
            Stmt::declare("out", int(0)),
            Stmt::block(
                vec![
                    Stmt::declare("x", int(5)),
                    Stmt::expression(Expr::assign(ident("out"), ident("x"))),
                ],
                sp(),
            ),
            Stmt::declare("after", ident("x")),
        ]);
        assert_eq!(global(&vm, "out"), Value::Int(5));
        assert_eq!(global(&vm, "after"), Value::Int(10));
    }

    fn counted_for(body: Vec<Stmt>, bound: i64) -> Stmt {
        Stmt::for_loop(
            Some(Stmt::declare("i", int(0))),
            Some(bin(BinaryOp::Less, ident("i"), int(bound))),
            Some(Stmt::expression(Expr::assign(
                ident("i"),
                bin(BinaryOp::Add, ident("i"), int(1)),
            ))),
            body,
            sp(),
        )
    }

    #[test]
    fn test_for_loop_sums() {
        let vm = run_program(vec![
            Stmt::declare("total", int(0)),
            counted_for(
                vec![Stmt::expression(Expr::assign(
                    ident("total"),
                    bin(BinaryOp::Add, ident("total"), ident("i")),
                ))],
                5,
            ),
        ]);
        assert_eq!(global(&vm, "total"), Value::Int(10));
    }

    #[test]
    fn test_break_exits_unconditional_loop() {
        let vm = run_program(vec![
            Stmt::declare("count", int(0)),
            Stmt::for_loop(
                None,
                None,
                None,
                vec![
                    Stmt::expression(Expr::assign(
                        ident("count"),
                        bin(BinaryOp::Add, ident("count"), int(1)),
                    )),
                    Stmt::if_stmt(
                        bin(BinaryOp::Equal, ident("count"), int(3)),
                        vec![Stmt::brk(sp())],
                        None,
                    ),
                ],
                sp(),
            ),
        ]);
        assert_eq!(global(&vm, "count"), Value::Int(3));
    }

    #[test]
    fn test_continue_still_runs_post_statement() {
        // skips odd values of i; post statement must still advance i
        let vm = run_program(vec![
            Stmt::declare("total", int(0)),
            counted_for(
                vec![
                    Stmt::if_stmt(
                        bin(
                            BinaryOp::Equal,
                            bin(BinaryOp::Remainder, ident("i"), int(2)),
                            int(1),
                        ),
                        vec![Stmt::cont(sp())],
                        None,
                    ),
                    Stmt::expression(Expr::assign(
                        ident("total"),
                        bin(BinaryOp::Add, ident("total"), ident("i")),
                    )),
                ],
                5,
            ),
        ]);
        assert_eq!(global(&vm, "total"), Value::Int(6));
    }

    #[test]
    fn test_loop_variable_captured_per_iteration() {
        // each closure sees its own copy of the header variable
        let vm = run_program(vec![
            Stmt::declare("fs", Expr::array(vec![], sp())),
            counted_for(
                vec![Stmt::expression(Expr::assign(
                    ident("fs"),
                    bin(
                        BinaryOp::Add,
                        ident("fs"),
                        Expr::array(
                            vec![Expr::func(
                                vec![],
                                vec![Stmt::ret(Some(ident("i")), sp())],
                                sp(),
                            )],
                            sp(),
                        ),
                    ),
                ))],
                3,
            ),
            Stmt::declare("a", Expr::call(Expr::index(ident("fs"), int(0)), vec![])),
            Stmt::declare("b", Expr::call(Expr::index(ident("fs"), int(1)), vec![])),
            Stmt::declare("c", Expr::call(Expr::index(ident("fs"), int(2)), vec![])),
        ]);
        assert_eq!(global(&vm, "a"), Value::Int(0));
        assert_eq!(global(&vm, "b"), Value::Int(1));
        assert_eq!(global(&vm, "c"), Value::Int(2));
    }

    #[test]
    fn test_closures_share_one_captured_cell() {
        let vm = run_program(vec![
            Stmt::declare(
                "make",
                Expr::func(
                    vec![],
                    vec![
                        Stmt::declare("n", int(0)),
                        Stmt::ret(
                            Some(Expr::func(
                                vec![],
                                vec![
                                    Stmt::expression(Expr::assign(
                                        ident("n"),
                                        bin(BinaryOp::Add, ident("n"), int(1)),
                                    )),
                                    Stmt::ret(Some(ident("n")), sp()),
                                ],
                                sp(),
                            )),
                            sp(),
                        ),
                    ],
                    sp(),
                ),
            ),
            Stmt::declare("inc", Expr::call(ident("make"), vec![])),
            Stmt::expression(Expr::call(ident("inc"), vec![])),
            Stmt::expression(Expr::call(ident("inc"), vec![])),
            Stmt::declare("x", Expr::call(ident("inc"), vec![])),
        ]);
        assert_eq!(global(&vm, "x"), Value::Int(3));
    }

    #[test]
    fn test_recursive_function_sees_its_own_name() {
        let vm = run_program(vec![
            Stmt::declare(
                "fact",
                Expr::func(
                    vec!["n"],
                    vec![
                        Stmt::if_stmt(
                            bin(BinaryOp::LessEqual, ident("n"), int(1)),
                            vec![Stmt::ret(Some(int(1)), sp())],
                            None,
                        ),
                        Stmt::ret(
                            Some(bin(
                                BinaryOp::Multiply,
                                ident("n"),
                                Expr::call(
                                    ident("fact"),
                                    vec![bin(BinaryOp::Subtract, ident("n"), int(1))],
                                ),
                            )),
                            sp(),
                        ),
                    ],
                    sp(),
                ),
            ),
            Stmt::declare("x", Expr::call(ident("fact"), vec![int(5)])),
        ]);
        assert_eq!(global(&vm, "x"), Value::Int(120));
    }

    #[test]
    fn test_for_in_walks_arrays_and_maps() {
        let vm = run_program(vec![
            Stmt::declare("total", int(0)),
            Stmt::for_in(
                "i",
                Some("x"),
                Expr::array(vec![int(10), int(20), int(30)], sp()),
                vec![Stmt::expression(Expr::assign(
                    ident("total"),
                    bin(
                        BinaryOp::Add,
                        ident("total"),
                        bin(BinaryOp::Add, ident("i"), ident("x")),
                    ),
                ))],
            ),
            Stmt::declare("keys", Expr::string("", sp())),
            Stmt::declare("vals", int(0)),
            Stmt::for_in(
                "k",
                Some("v"),
                Expr::map(
                    vec![("a".to_string(), int(1)), ("b".to_string(), int(2))],
                    sp(),
                ),
                vec![
                    Stmt::expression(Expr::assign(
                        ident("keys"),
                        bin(BinaryOp::Add, ident("keys"), ident("k")),
                    )),
                    Stmt::expression(Expr::assign(
                        ident("vals"),
                        bin(BinaryOp::Add, ident("vals"), ident("v")),
                    )),
                ],
            ),
        ]);
        assert_eq!(global(&vm, "total"), Value::Int(63));
        assert_eq!(global(&vm, "keys"), Value::string("ab"));
        assert_eq!(global(&vm, "vals"), Value::Int(3));
    }

    #[test]
    fn test_break_out_of_for_in_discards_the_iterator() {
        let vm = run_program(vec![
            Stmt::declare("total", int(0)),
            Stmt::for_in(
                "i",
                Some("v"),
                Expr::array(vec![int(1), int(2), int(3), int(4)], sp()),
                vec![
                    Stmt::if_stmt(
                        bin(BinaryOp::Equal, ident("v"), int(3)),
                        vec![Stmt::brk(sp())],
                        None,
                    ),
                    Stmt::expression(Expr::assign(
                        ident("total"),
                        bin(BinaryOp::Add, ident("total"), ident("v")),
                    )),
                ],
            ),
            // a later loop still runs on a balanced iterator stack
            Stmt::declare("after", int(0)),
            Stmt::for_in(
                "i",
                Some("v"),
                Expr::array(vec![int(5)], sp()),
                vec![Stmt::expression(Expr::assign(
                    ident("after"),
                    ident("v"),
                ))],
            ),
        ]);
        assert_eq!(global(&vm, "total"), Value::Int(3));
        assert_eq!(global(&vm, "after"), Value::Int(5));
    }

    #[test]
    fn test_return_out_of_for_in_discards_the_iterator() {
        let vm = run_program(vec![
            Stmt::declare(
                "first",
                Expr::func(
                    vec!["xs"],
                    vec![
                        Stmt::for_in(
                            "i",
                            Some("v"),
                            ident("xs"),
                            vec![Stmt::ret(Some(ident("v")), sp())],
                        ),
                        Stmt::ret(Some(int(-1)), sp()),
                    ],
                    sp(),
                ),
            ),
            Stmt::declare(
                "x",
                Expr::call(
                    ident("first"),
                    vec![Expr::array(vec![int(7), int(8)], sp())],
                ),
            ),
        ]);
        assert_eq!(global(&vm, "x"), Value::Int(7));
    }

    #[test]
    fn test_slices() {
        let vm = run_program(vec![
            Stmt::declare(
                "mid",
                Expr::slice(
                    Expr::array(vec![int(1), int(2), int(3), int(4)], sp()),
                    Some(int(1)),
                    Some(int(3)),
                    sp(),
                ),
            ),
            Stmt::declare(
                "tail",
                Expr::slice(Expr::string("hello", sp()), Some(int(1)), None, sp()),
            ),
            Stmt::declare(
                "neg",
                Expr::slice(
                    Expr::array(vec![int(1), int(2), int(3)], sp()),
                    Some(int(-2)),
                    None,
                    sp(),
                ),
            ),
        ]);
        assert_eq!(
            global(&vm, "mid"),
            Value::array(vec![Value::Int(2), Value::Int(3)])
        );
        assert_eq!(global(&vm, "tail"), Value::string("ello"));
        assert_eq!(
            global(&vm, "neg"),
            Value::array(vec![Value::Int(2), Value::Int(3)])
        );
    }

    #[test]
    fn test_recoverable_errors_flow_as_values() {
        let vm = run_program(vec![
            Stmt::declare("e", bin(BinaryOp::Divide, int(1), int(0))),
            Stmt::declare(
                "chained",
                bin(
                    BinaryOp::Add,
                    bin(BinaryOp::Add, int(1), Expr::string("x", sp())),
                    int(5),
                ),
            ),
            Stmt::declare("after", int(42)),
        ]);
        assert!(global(&vm, "e").is_error());
        assert!(global(&vm, "chained").is_error());
        assert_eq!(global(&vm, "after"), Value::Int(42));
    }

    #[test]
    fn test_self_referential_container_stays_in_script() {
        // a := [1]; a[0] = a — comparing and stringifying the cycle must
        // complete inside the VM instead of faulting the host
        let vm = run_program(vec![
            Stmt::declare("a", Expr::array(vec![int(1)], sp())),
            Stmt::expression(Expr::assign(
                Expr::index(ident("a"), int(0)),
                ident("a"),
            )),
            Stmt::declare("e", bin(BinaryOp::Equal, ident("a"), ident("a"))),
            Stmt::declare("s", Expr::call(ident("string"), vec![ident("a")])),
            Stmt::declare("after", int(1)),
        ]);
        assert_eq!(global(&vm, "e"), Value::Bool(true));
        match global(&vm, "s") {
            Value::Str(s) => assert!(s.contains("[...]")),
            other => panic!("expected string, got {}", other.type_name()),
        }
        assert_eq!(global(&vm, "after"), Value::Int(1));
    }

    #[test]
    fn test_immutable_values_reject_mutation() {
        let vm = run_program(vec![
            Stmt::declare(
                "arr",
                Expr::call(
                    ident("immutable"),
                    vec![Expr::array(vec![int(1), int(2)], sp())],
                ),
            ),
            Stmt::declare(
                "e",
                Expr::assign(Expr::index(ident("arr"), int(0)), int(9)),
            ),
            Stmt::declare("x", Expr::index(ident("arr"), int(0))),
        ]);
        assert!(global(&vm, "e").is_error());
        assert_eq!(global(&vm, "x"), Value::Int(1));
    }

    #[test]
    fn test_string_limit_is_catchable_and_stack_stays_consistent() {
        let mut limits = ResourceLimits::default();
        limits.max_string_len = 8;
        let vm = run_with(
            vec![
                Stmt::declare(
                    "s",
                    bin(
                        BinaryOp::Add,
                        Expr::string("aaaaa", sp()),
                        Expr::string("bbbbb", sp()),
                    ),
                ),
                Stmt::declare("after", int(1)),
            ],
            Builtins::core(),
            ModuleLoader::new(),
            limits,
        );
        assert!(global(&vm, "s").is_error());
        assert_eq!(global(&vm, "after"), Value::Int(1));
    }

    #[test]
    fn test_instruction_budget_aborts_the_run() {
        let mut limits = ResourceLimits::default();
        limits.max_instructions = Some(1_000);
        let mut vm = build(
            vec![Stmt::for_loop(None, None, None, vec![], sp())],
            Builtins::core(),
            ModuleLoader::new(),
            limits,
        );
        assert!(matches!(vm.run(), Err(RuntimeError::InstructionLimit(1_000))));
    }

    #[test]
    fn test_cancellation_token_stops_a_hot_loop() {
        let mut vm = build(
            vec![Stmt::for_loop(None, None, None, vec![], sp())],
            Builtins::core(),
            ModuleLoader::new(),
            ResourceLimits::default(),
        );
        let token = Arc::new(AtomicBool::new(true));
        assert!(matches!(
            vm.run_with_cancellation(token),
            Err(RuntimeError::Cancelled)
        ));
    }

    #[test]
    fn test_runaway_recursion_overflows_the_frame_stack() {
        let mut limits = ResourceLimits::default();
        limits.max_frames = 16;
        let mut vm = build(
            vec![
                Stmt::declare(
                    "f",
                    Expr::func(
                        vec![],
                        vec![Stmt::ret(Some(Expr::call(ident("f"), vec![])), sp())],
                        sp(),
                    ),
                ),
                Stmt::expression(Expr::call(ident("f"), vec![])),
            ],
            Builtins::core(),
            ModuleLoader::new(),
            limits,
        );
        assert!(matches!(vm.run(), Err(RuntimeError::StackOverflow(_))));
    }

    #[test]
    fn test_two_runs_of_the_same_program_agree() {
        let stmts = || {
            vec![
                Stmt::declare(
                    "m",
                    Expr::map(
                        vec![("b".to_string(), int(1)), ("a".to_string(), int(2))],
                        sp(),
                    ),
                ),
                Stmt::declare("s", Expr::call(ident("string"), vec![ident("m")])),
            ]
        };
        let a = global(&run_program(stmts()), "s");
        let b = global(&run_program(stmts()), "s");
        assert_eq!(a, b);
    }

    #[test]
    fn test_host_seeded_globals() {
        let builtins = Builtins::core();
        let mut loader = ModuleLoader::new();
        let program = Program::new(vec![Stmt::declare(
            "y",
            bin(BinaryOp::Add, ident("x"), int(1)),
        )]);
        let unit = Compiler::compile_with_globals(
            &program,
            builtins.names(),
            &["x".to_string()],
            &mut loader,
        )
        .expect("compile");
        let mut vm = Vm::new(unit, builtins, loader, ResourceLimits::default())
            .with_globals(&[("x", Value::Int(41))]);
        vm.run().expect("run");
        assert_eq!(global(&vm, "y"), Value::Int(42));
    }

    #[test]
    fn test_source_module_evaluates_once_and_shares_its_export() {
        use std::cell::Cell as StdCell;

        let ticks = Rc::new(StdCell::new(0));
        let seen = ticks.clone();
        let mut builtins = Builtins::core();
        builtins.register(NativeFunction::new("tick", Some(0), move |_, _| {
            seen.set(seen.get() + 1);
            Ok(Value::Undefined)
        }));

        let mut loader = ModuleLoader::new();
        loader.register_source(
            "counter",
            Program::new(vec![
                Stmt::expression(Expr::call(ident("tick"), vec![])),
                Stmt::export(Expr::map(vec![("n".to_string(), int(1))], sp())),
            ]),
        );

        let vm = run_with(
            vec![
                Stmt::declare("m1", Expr::import("counter", sp())),
                Stmt::declare("m2", Expr::import("counter", sp())),
                Stmt::expression(Expr::assign(
                    Expr::index(ident("m1"), Expr::string("extra", sp())),
                    int(7),
                )),
                Stmt::declare(
                    "shared",
                    Expr::index(ident("m2"), Expr::string("extra", sp())),
                ),
            ],
            builtins,
            loader,
            ResourceLimits::default(),
        );
        assert_eq!(ticks.get(), 1);
        assert_eq!(global(&vm, "shared"), Value::Int(7));
    }

    #[test]
    fn test_builtin_module_imports_frozen() {
        let mut loader = ModuleLoader::new();
        let mut map = ValueMap::default();
        map.insert("pi".to_string(), Value::Float(3.14));
        loader.register_builtin("math", Value::map(map));

        let vm = run_with(
            vec![
                Stmt::declare(
                    "pi",
                    Expr::index(Expr::import("math", sp()), Expr::string("pi", sp())),
                ),
                Stmt::declare(
                    "e",
                    Expr::assign(
                        Expr::index(Expr::import("math", sp()), Expr::string("pi", sp())),
                        int(1),
                    ),
                ),
            ],
            Builtins::core(),
            loader,
            ResourceLimits::default(),
        );
        assert_eq!(global(&vm, "pi"), Value::Float(3.14));
        assert!(global(&vm, "e").is_error());
    }

    #[test]
    fn test_module_chain_resolves_through_dependencies() {
        let mut loader = ModuleLoader::new();
        loader.register_source(
            "base",
            Program::new(vec![Stmt::export(int(10))]),
        );
        loader.register_source(
            "double",
            Program::new(vec![Stmt::export(bin(
                BinaryOp::Multiply,
                Expr::import("base", sp()),
                int(2),
            ))]),
        );
        let vm = run_with(
            vec![Stmt::declare("x", Expr::import("double", sp()))],
            Builtins::core(),
            loader,
            ResourceLimits::default(),
        );
        assert_eq!(global(&vm, "x"), Value::Int(20));
    }

    #[test]
    fn test_globals_survive_an_abort() {
        let mut limits = ResourceLimits::default();
        limits.max_instructions = Some(10_000);
        let mut vm = build(
            vec![
                Stmt::declare("x", int(5)),
                Stmt::for_loop(None, None, None, vec![], sp()),
            ],
            Builtins::core(),
            ModuleLoader::new(),
            limits,
        );
        assert!(vm.run().is_err());
        // at-most-once, no rollback
        assert_eq!(vm.global("x"), Some(Value::Int(5)));
    }
}
