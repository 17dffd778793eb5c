//! Module registration and loading.
//!
//! Two module kinds. **Builtin** modules are host-constructed values
//! installed under a name; they are frozen at registration and bound into
//! the importing unit's constant pool at compile time. **Source** modules
//! are ASTs in the scripting language, compiled against a fresh global
//! scope, memoized per loader, and evaluated once — every import of the
//! same name shares the identical export value.

use std::rc::Rc;

use indexmap::IndexMap;

use crate::ast::stmt::Program;
use crate::error::{CompileError, ErrorList, RuntimeError};
use crate::span::Span;
use crate::value::Value;
use crate::vm::chunk::FunctionProto;
use crate::vm::Compiler;

type ModuleMap<V> = IndexMap<String, V, ahash::RandomState>;

/// Per-session module state: registrations, the compiled-prototype memo,
/// the evaluated-export memo, and the in-progress set for cycle detection.
#[derive(Default, Clone)]
pub struct ModuleLoader {
    builtins: ModuleMap<Value>,
    sources: ModuleMap<Program>,
    compiled: ModuleMap<Rc<FunctionProto>>,
    exports: ModuleMap<Value>,
    in_progress: Vec<String>,
}

impl ModuleLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a builtin module. The value is frozen so every importing
    /// script shares it without aliasing a mutable container.
    pub fn register_builtin(&mut self, name: impl Into<String>, value: Value) {
        self.builtins.insert(name.into(), value.frozen());
    }

    /// Install a source module body.
    pub fn register_source(&mut self, name: impl Into<String>, program: Program) {
        self.sources.insert(name.into(), program);
    }

    pub fn builtin(&self, name: &str) -> Option<&Value> {
        self.builtins.get(name)
    }

    pub fn has_source(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    /// Compiled prototype of a source module, if compilation has happened.
    pub fn proto(&self, name: &str) -> Option<Rc<FunctionProto>> {
        self.compiled.get(name).cloned()
    }

    pub(crate) fn export(&self, name: &str) -> Option<Value> {
        self.exports.get(name).cloned()
    }

    pub(crate) fn set_export(&mut self, name: &str, value: Value) {
        self.exports.insert(name.to_string(), value);
    }

    /// Compile a source module and, transitively, the source modules it
    /// imports. Memoized. A name that is already being compiled further up
    /// this recursion is a cyclic import.
    pub(crate) fn compile_module(
        &mut self,
        name: &str,
        builtins: &[String],
        span: Span,
    ) -> Result<(), ErrorList> {
        if self.in_progress.iter().any(|n| n == name) {
            return Err(CompileError::CyclicImport(name.to_string(), span).into());
        }
        if self.compiled.contains_key(name) {
            return Ok(());
        }
        let Some(program) = self.sources.get(name).cloned() else {
            return Err(CompileError::UnknownModule(name.to_string(), span).into());
        };

        self.in_progress.push(name.to_string());
        let result = match Compiler::compile_module(&program, builtins.to_vec(), self, name) {
            Ok((proto, imports)) => {
                self.compiled.insert(name.to_string(), proto);
                let mut errors = ErrorList::new();
                for (dep, dep_span) in imports {
                    if let Err(list) = self.compile_module(&dep, builtins, dep_span) {
                        for err in list.errors {
                            errors.push(err);
                        }
                    }
                }
                if errors.is_empty() {
                    Ok(())
                } else {
                    Err(errors)
                }
            }
            Err(list) => Err(list),
        };
        self.in_progress.retain(|n| n != name);
        result
    }

    /// Prototype for the VM at an Import site. Normally a cache hit, since
    /// `compile` walks imports eagerly; compiles on first use otherwise.
    pub(crate) fn load_proto(
        &mut self,
        name: &str,
        builtins: &[String],
        span: Span,
    ) -> Result<Rc<FunctionProto>, RuntimeError> {
        if let Some(proto) = self.compiled.get(name) {
            return Ok(proto.clone());
        }
        self.compile_module(name, builtins, span)
            .map_err(|errors| RuntimeError::ModuleCompile {
                name: name.to_string(),
                errors,
            })?;
        self.compiled
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::corrupt(format!("module '{}' missing after compile", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Expr, Stmt};

    fn import_of(name: &str) -> Program {
        Program::new(vec![Stmt::export(Expr::import(name, Span::default()))])
    }

    #[test]
    fn test_cyclic_import_is_a_compile_error() {
        let mut loader = ModuleLoader::new();
        loader.register_source("a", import_of("b"));
        loader.register_source("b", import_of("a"));

        let program = Program::new(vec![Stmt::expression(Expr::import("a", Span::default()))]);
        let errors = Compiler::compile(&program, vec![], &mut loader).unwrap_err();
        assert!(errors
            .errors
            .iter()
            .any(|e| matches!(e, CompileError::CyclicImport(..))));
    }

    #[test]
    fn test_self_import_is_a_compile_error() {
        let mut loader = ModuleLoader::new();
        loader.register_source("a", import_of("a"));

        let program = Program::new(vec![Stmt::expression(Expr::import("a", Span::default()))]);
        let errors = Compiler::compile(&program, vec![], &mut loader).unwrap_err();
        assert!(errors
            .errors
            .iter()
            .any(|e| matches!(e, CompileError::CyclicImport(..))));
    }

    #[test]
    fn test_unknown_module_is_a_compile_error() {
        let mut loader = ModuleLoader::new();
        let program = Program::new(vec![Stmt::expression(Expr::import(
            "ghost",
            Span::default(),
        ))]);
        let errors = Compiler::compile(&program, vec![], &mut loader).unwrap_err();
        assert!(errors
            .errors
            .iter()
            .any(|e| matches!(e, CompileError::UnknownModule(..))));
    }

    #[test]
    fn test_builtin_module_is_frozen_on_registration() {
        let mut loader = ModuleLoader::new();
        let mut map = crate::value::ValueMap::default();
        map.insert("answer".to_string(), Value::Int(42));
        loader.register_builtin("math", Value::map(map));

        assert!(matches!(
            loader.builtin("math"),
            Some(Value::ImmutableMap(_))
        ));
    }

    #[test]
    fn test_diamond_import_compiles_each_module_once() {
        let mut loader = ModuleLoader::new();
        loader.register_source(
            "base",
            Program::new(vec![Stmt::export(Expr::int(1, Span::default()))]),
        );
        loader.register_source("left", import_of("base"));
        loader.register_source("right", import_of("base"));

        let program = Program::new(vec![
            Stmt::expression(Expr::import("left", Span::default())),
            Stmt::expression(Expr::import("right", Span::default())),
        ]);
        Compiler::compile(&program, vec![], &mut loader).unwrap();
        assert!(loader.proto("base").is_some());
        assert!(loader.proto("left").is_some());
        assert!(loader.proto("right").is_some());
    }
}
