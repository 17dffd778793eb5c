//! Bytecode chunks, the constant pool, and compiled units.

use std::rc::Rc;

use crate::span::Span;
use crate::value::Value;

use super::cell::CaptureSource;
use super::opcode::Op;

/// A constant stored in a chunk's pool.
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Int(i64),
    Float(f64),
    Char(char),
    Str(String),
    /// A compiled function prototype.
    Function(Rc<FunctionProto>),
    /// A builtin module's value, bound at compile time.
    Module(Value),
}

/// A compiled function (or the top-level script / module body).
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FunctionProto {
    /// Name for diagnostics; `None` for anonymous literals and script bodies.
    pub name: Option<String>,
    /// Number of declared parameters.
    pub num_params: u8,
    /// Whether the last parameter collects the remaining arguments.
    pub variadic: bool,
    /// High-water mark of local slots (including the callee slot), used for
    /// the frame-size check at call time.
    pub num_locals: u16,
    /// Capture descriptors resolved into cells at closure creation.
    pub captures: Vec<CaptureSource>,
    /// The instruction stream.
    pub chunk: Chunk,
}

impl FunctionProto {
    pub fn new(name: Option<String>) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }
}

/// A chunk of bytecode: instructions + constant pool + position table.
///
/// The position table is parallel to `code`; the pool is immutable once the
/// owning unit finishes compiling.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Chunk {
    pub code: Vec<Op>,
    pub spans: Vec<Span>,
    pub constants: Vec<Constant>,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit an instruction and record its source span.
    pub fn emit(&mut self, op: Op, span: Span) -> usize {
        let offset = self.code.len();
        self.code.push(op);
        self.spans.push(span);
        offset
    }

    /// Add a constant, deduplicating by structural equality.
    pub fn add_constant(&mut self, constant: Constant) -> u16 {
        for (i, existing) in self.constants.iter().enumerate() {
            if *existing == constant {
                return i as u16;
            }
        }
        let idx = self.constants.len();
        self.constants.push(constant);
        idx as u16
    }

    /// Current offset (next instruction index).
    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Span recorded for the instruction at `offset`.
    pub fn span_at(&self, offset: usize) -> Span {
        self.spans.get(offset).copied().unwrap_or_default()
    }

    /// Patch a forward jump at `offset` to land on the next instruction.
    pub fn patch_jump(&mut self, offset: usize) {
        let jump = (self.code.len() - offset - 1) as u16;
        match &mut self.code[offset] {
            Op::Jump(target)
            | Op::JumpIfFalse(target)
            | Op::JumpIfFalseNoPop(target)
            | Op::JumpIfTrueNoPop(target)
            | Op::IterNext(target) => {
                *target = jump;
            }
            other => panic!("tried to patch non-jump instruction {:?} at {}", other, offset),
        }
    }
}

/// The output of compiling one program: the root function plus the global
/// name table the host uses to read results back out.
#[derive(Debug, Clone)]
pub struct CompiledUnit {
    pub main: Rc<FunctionProto>,
    /// Global names in slot order.
    pub global_names: Vec<String>,
}

impl CompiledUnit {
    /// Slot index of a named global, if the program declared it.
    pub fn global_index(&self, name: &str) -> Option<usize> {
        self.global_names.iter().position(|n| n == name)
    }

    pub fn num_globals(&self) -> usize {
        self.global_names.len()
    }
}
