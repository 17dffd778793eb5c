//! Lexical scope resolution.
//!
//! One table serves a whole compilation: it owns the global slot map, the
//! host builtin names, and a stack of function scopes (each with nested
//! block scopes). Resolution order is locals, then enclosing functions
//! (recording a Free capture in every function between the use site and the
//! defining scope), then globals, then builtins.

use crate::error::CompileError;
use crate::span::Span;

use super::cell::CaptureSource;

/// Where a resolved name lives, with its slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Global(u16),
    Local(u16),
    Free(u16),
    Builtin(u16),
}

#[derive(Debug, Clone)]
struct Local {
    name: String,
    depth: u32,
    captured: bool,
}

#[derive(Debug, Default)]
struct FunctionScope {
    locals: Vec<Local>,
    /// Capture sources in closure cell order, with the captured name.
    captures: Vec<(CaptureSource, String)>,
    depth: u32,
    /// High-water mark of live locals, for the frame-size check at call time.
    max_locals: usize,
}

/// A local popped when its block closes; tells the compiler whether to emit
/// a plain Pop or to close the cell over its slot first.
#[derive(Debug, Clone, Copy)]
pub struct PoppedLocal {
    pub captured: bool,
}

/// The scope stack for one compilation.
pub struct SymbolTable {
    globals: Vec<String>,
    builtins: Vec<String>,
    funcs: Vec<FunctionScope>,
    /// Module mode: file-scope declarations become locals of the module
    /// function instead of global slots.
    module: bool,
}

impl SymbolTable {
    pub fn new(builtins: Vec<String>) -> Self {
        let mut table = Self {
            globals: Vec::new(),
            builtins,
            funcs: Vec::new(),
            module: false,
        };
        table.enter_function();
        table
    }

    /// A table for a source module body: its top level is itself a function.
    pub fn for_module(builtins: Vec<String>) -> Self {
        let mut table = Self::new(builtins);
        table.module = true;
        table
    }

    pub fn global_names(&self) -> Vec<String> {
        self.globals.clone()
    }

    /// Reserve a global slot for a host-supplied binding before compilation;
    /// scripts reference (and assign) it without declaring it.
    pub fn predeclare_global(&mut self, name: &str) {
        if !self.globals.iter().any(|g| g == name) {
            self.globals.push(name.to_string());
        }
    }

    // --- Function scopes ---

    pub fn enter_function(&mut self) {
        let mut scope = FunctionScope::default();
        // Slot 0 holds the callee, mirroring the frame layout at call time.
        scope.locals.push(Local {
            name: String::new(),
            depth: 0,
            captured: false,
        });
        scope.max_locals = 1;
        self.funcs.push(scope);
    }

    /// Close the innermost function scope, yielding its capture sources in
    /// closure cell order and the local slot high-water mark.
    pub fn leave_function(&mut self) -> (Vec<CaptureSource>, u16) {
        let scope = self.funcs.pop().unwrap_or_default();
        let num_locals = scope.max_locals as u16;
        let captures = scope.captures.into_iter().map(|(src, _)| src).collect();
        (captures, num_locals)
    }

    fn innermost(&mut self) -> &mut FunctionScope {
        self.funcs.last_mut().expect("no function scope open")
    }

    /// Drop every scope a failed statement left open: nested function scopes
    /// and any blocks still open in the root scope. Globals survive.
    pub fn unwind_to_root(&mut self) {
        self.funcs.truncate(1);
        let root = self.innermost();
        root.depth = 0;
        while root.locals.last().map_or(false, |local| local.depth > 0) {
            root.locals.pop();
        }
    }

    // --- Block scopes ---

    pub fn begin_block(&mut self) {
        self.innermost().depth += 1;
    }

    /// Current block depth in the innermost function.
    pub fn block_depth(&mut self) -> u32 {
        self.innermost().depth
    }

    /// Close the innermost block, returning its locals in pop order.
    pub fn end_block(&mut self) -> Vec<PoppedLocal> {
        let scope = self.innermost();
        scope.depth -= 1;
        let mut popped = Vec::new();
        while let Some(local) = scope.locals.last() {
            if local.depth <= scope.depth {
                break;
            }
            popped.push(PoppedLocal {
                captured: local.captured,
            });
            scope.locals.pop();
        }
        popped
    }

    /// Locals deeper than `depth`, in pop order, without removing them.
    /// Break and continue use this to unwind the slots they jump past.
    pub fn locals_deeper_than(&mut self, depth: u32) -> Vec<PoppedLocal> {
        self.innermost()
            .locals
            .iter()
            .rev()
            .take_while(|local| local.depth > depth)
            .map(|local| PoppedLocal {
                captured: local.captured,
            })
            .collect()
    }

    // --- Declaration ---

    /// Whether a declaration here binds a global slot.
    fn at_file_scope(&self) -> bool {
        !self.module && self.funcs.len() == 1 && self.funcs[0].depth == 0
    }

    /// Declare a name (`:=` or a function parameter).
    pub fn define(&mut self, name: &str, span: Span) -> Result<Binding, CompileError> {
        if self.at_file_scope() {
            if self.globals.iter().any(|g| g == name) {
                return Err(CompileError::Redeclared(name.to_string(), span));
            }
            if self.globals.len() >= u16::MAX as usize {
                return Err(CompileError::too_many("globals", span));
            }
            let idx = self.globals.len() as u16;
            self.globals.push(name.to_string());
            return Ok(Binding::Global(idx));
        }

        let scope = self.innermost();
        let depth = scope.depth;
        for local in scope.locals.iter().rev() {
            if local.depth < depth {
                break;
            }
            if local.name == name {
                return Err(CompileError::Redeclared(name.to_string(), span));
            }
        }
        if scope.locals.len() >= u16::MAX as usize {
            return Err(CompileError::too_many("locals", span));
        }
        let idx = scope.locals.len() as u16;
        scope.locals.push(Local {
            name: name.to_string(),
            depth,
            captured: false,
        });
        scope.max_locals = scope.max_locals.max(scope.locals.len());
        Ok(Binding::Local(idx))
    }

    // --- Resolution ---

    fn find_local(&self, func: usize, name: &str) -> Option<u16> {
        self.funcs[func]
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, local)| local.name == name)
            .map(|(i, _)| i as u16)
    }

    fn add_capture(&mut self, func: usize, source: CaptureSource, name: &str) -> u16 {
        let scope = &mut self.funcs[func];
        for (i, (existing, _)) in scope.captures.iter().enumerate() {
            if *existing == source {
                return i as u16;
            }
        }
        let idx = scope.captures.len() as u16;
        scope.captures.push((source, name.to_string()));
        idx
    }

    /// Resolve `name` as a Free capture of `func`, threading the capture
    /// chain through every function scope in between.
    fn resolve_capture(&mut self, func: usize, name: &str) -> Option<u16> {
        if func == 0 {
            return None;
        }
        let parent = func - 1;
        if let Some(local_idx) = self.find_local(parent, name) {
            self.funcs[parent].locals[local_idx as usize].captured = true;
            return Some(self.add_capture(
                func,
                CaptureSource {
                    is_local: true,
                    index: local_idx,
                },
                name,
            ));
        }
        if let Some(free_idx) = self.resolve_capture(parent, name) {
            return Some(self.add_capture(
                func,
                CaptureSource {
                    is_local: false,
                    index: free_idx,
                },
                name,
            ));
        }
        None
    }

    /// Resolve a name at a use site.
    pub fn resolve(&mut self, name: &str) -> Option<Binding> {
        let innermost = self.funcs.len() - 1;
        if let Some(idx) = self.find_local(innermost, name) {
            return Some(Binding::Local(idx));
        }
        if let Some(idx) = self.resolve_capture(innermost, name) {
            return Some(Binding::Free(idx));
        }
        if let Some(idx) = self.globals.iter().position(|g| g == name) {
            return Some(Binding::Global(idx as u16));
        }
        if let Some(idx) = self.builtins.iter().position(|b| b == name) {
            return Some(Binding::Builtin(idx as u16));
        }
        None
    }

    /// Whether the resolved local slot (in the innermost function) has been
    /// captured by some closure. Used when a loop body copies its shadow
    /// variable back.
    pub fn local_is_captured(&self, slot: u16) -> bool {
        self.funcs
            .last()
            .and_then(|scope| scope.locals.get(slot as usize))
            .map(|local| local.captured)
            .unwrap_or(false)
    }
}
