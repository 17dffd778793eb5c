//! Captured cells and closures.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::value::Value;

use super::chunk::FunctionProto;

/// A closure: a compiled function paired with its captured cells.
#[derive(Clone)]
pub struct Closure {
    pub proto: Rc<FunctionProto>,
    pub cells: Vec<Rc<RefCell<Cell>>>,
}

impl Closure {
    pub fn new(proto: Rc<FunctionProto>, cells: Vec<Rc<RefCell<Cell>>>) -> Self {
        Self { proto, cells }
    }
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.proto.name {
            Some(name) => write!(f, "<fn {}>", name),
            None => write!(f, "<fn>"),
        }
    }
}

/// Shared mutable storage for a free variable.
///
/// While the declaring frame is live the cell is "open" and addresses a
/// stack slot by index; when that frame's scope ends the value moves into
/// the cell itself ("closed") and outlives the frame. Cells are reference
/// counted, so the longest-lived closure keeps the storage alive.
#[derive(Debug, Clone)]
pub enum Cell {
    /// Addresses a live stack slot by index.
    Open(usize),
    /// Holds the captured value after the declaring scope exits.
    Closed(Value),
}

/// Compiler-emitted descriptor for one capture of a closure.
///
/// Resolved by the VM at closure-creation time: a local capture takes a cell
/// over a slot of the *enclosing* frame, a non-local one forwards a cell the
/// enclosing closure already holds (the capture chain).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSource {
    /// True when the capture names a local slot of the immediately enclosing
    /// function; false when it names an entry of its capture table.
    pub is_local: bool,
    pub index: u16,
}
