//! Bytecode opcodes.

/// A single bytecode instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    // --- Constants & literals ---
    /// Push a constant from the constant pool.
    Constant(u16),
    /// Push true.
    True,
    /// Push false.
    False,
    /// Push undefined.
    Undefined,

    // --- Stack ---
    /// Pop the top value.
    Pop,

    // --- Variables ---
    /// Get a local by frame-relative slot.
    GetLocal(u16),
    /// Set a local by frame-relative slot.
    SetLocal(u16),
    /// Get a global by slot index.
    GetGlobal(u16),
    /// Set a global by slot index.
    SetGlobal(u16),
    /// Get a host builtin function by registry index.
    GetBuiltin(u16),

    // --- Captured cells ---
    /// Get a captured cell of the running closure.
    GetFree(u16),
    /// Set a captured cell of the running closure.
    SetFree(u16),
    /// Close the cell over the top stack slot, then pop it.
    CloseCell,

    // --- Arithmetic ---
    Add,
    Subtract,
    Multiply,
    Divide,
    Remainder,
    Negate,

    // --- Comparison / logic ---
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Not,

    // --- Control flow ---
    /// Unconditional forward jump by offset.
    Jump(u16),
    /// Jump forward if the popped value is falsy.
    JumpIfFalse(u16),
    /// Jump forward if falsy without popping (for &&).
    JumpIfFalseNoPop(u16),
    /// Jump forward if truthy without popping (for ||).
    JumpIfTrueNoPop(u16),
    /// Jump backward by offset (loop back-edge; cancellation safe point).
    Loop(u16),

    // --- Values ---
    /// Build an array from N stack values.
    MakeArray(u16),
    /// Build a map from N key/value pairs (2*N stack values, keys are strings).
    MakeMap(u16),
    /// Create a closure from a function constant, resolving its capture
    /// sources against the current frame.
    MakeClosure(u16),

    // --- Indexing ---
    /// stack: [obj, index] -> [value]
    GetIndex,
    /// stack: [obj, index, value] -> [value]
    SetIndex,
    /// stack: [obj, low, high] -> [slice] (bounds may be undefined)
    Slice,

    // --- Iteration ---
    /// Pop an iterable, push iterator state onto the iterator stack.
    IterInit,
    /// Push the next key/value pair, or pop the iterator and jump forward.
    IterNext(u16),
    /// Discard the top iterator (break out of a for-in loop).
    IterPop,

    // --- Functions ---
    /// Call with N positional arguments; the flag marks a trailing spread.
    Call(u8, bool),
    /// Return the top of stack to the caller.
    Return,

    // --- Modules ---
    /// Import a source module by name constant; pushes the memoized export.
    Import(u16),
}
