//! The builtin function registry and the core natives.
//!
//! Builtins resolve by name at compile time and by index at run time, so
//! the same registry instance (or one with identical registration order)
//! must be handed to both `compile` and the VM.

use std::rc::Rc;

use crate::error::RuntimeError;
use crate::value::{NativeFunction, Value};

/// An ordered registry of host functions visible to scripts by bare name.
#[derive(Clone)]
pub struct Builtins {
    functions: Vec<NativeFunction>,
}

impl Builtins {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            functions: Vec::new(),
        }
    }

    /// The core set every embedding usually wants: `len`, `type_name`,
    /// `string`, `int`, `float`, `bool`, `char`, `error`, `immutable`,
    /// `copy`, `append`.
    pub fn core() -> Self {
        let mut builtins = Self::new();
        builtins.register(NativeFunction::new("len", Some(1), |interop, args| {
            builtin_len(&args[0], interop.span())
        }));
        builtins.register(NativeFunction::new("type_name", Some(1), |_, args| {
            Ok(Value::string(args[0].type_name()))
        }));
        builtins.register(NativeFunction::new("string", Some(1), |interop, args| {
            let rendered = args[0].to_string();
            if rendered.len() > interop.limits().max_string_len {
                return Err(RuntimeError::StringLimit {
                    limit: interop.limits().max_string_len,
                    span: interop.span(),
                });
            }
            Ok(Value::string(rendered))
        }));
        builtins.register(NativeFunction::new("int", Some(1), |interop, args| {
            args[0].to_int().map(Value::Int).ok_or_else(|| {
                RuntimeError::type_mismatch("int-convertible value", args[0].type_name(), interop.span())
            })
        }));
        builtins.register(NativeFunction::new("float", Some(1), |interop, args| {
            args[0].to_float().map(Value::Float).ok_or_else(|| {
                RuntimeError::type_mismatch(
                    "float-convertible value",
                    args[0].type_name(),
                    interop.span(),
                )
            })
        }));
        builtins.register(NativeFunction::new("bool", Some(1), |_, args| {
            Ok(Value::Bool(args[0].to_bool()))
        }));
        builtins.register(NativeFunction::new("char", Some(1), |interop, args| {
            builtin_char(&args[0]).ok_or_else(|| {
                RuntimeError::type_mismatch(
                    "char-convertible value",
                    args[0].type_name(),
                    interop.span(),
                )
            })
        }));
        builtins.register(NativeFunction::new("error", Some(1), |_, args| {
            Ok(Value::Error(Rc::new(args[0].clone())))
        }));
        builtins.register(NativeFunction::new("immutable", Some(1), |_, args| {
            Ok(args[0].frozen())
        }));
        builtins.register(NativeFunction::new("copy", Some(1), |_, args| {
            Ok(builtin_copy(&args[0]))
        }));
        builtins.register(NativeFunction::new("append", None, |interop, args| {
            let Some((first, rest)) = args.split_first() else {
                return Err(RuntimeError::wrong_arity("at least 1", 0, interop.span()));
            };
            match first {
                Value::Array(arr) => {
                    let mut out = arr.borrow().clone();
                    out.extend(rest.iter().cloned());
                    Ok(Value::array(out))
                }
                Value::ImmutableArray(arr) => {
                    let mut out = arr.as_ref().clone();
                    out.extend(rest.iter().cloned());
                    Ok(Value::array(out))
                }
                other => Err(RuntimeError::type_mismatch(
                    "array",
                    other.type_name(),
                    interop.span(),
                )),
            }
        }));
        builtins
    }

    /// Register a native. A function with the same name is replaced in
    /// place, keeping registration order (and thus builtin indices) stable.
    pub fn register(&mut self, function: NativeFunction) {
        if let Some(existing) = self
            .functions
            .iter_mut()
            .find(|f| f.name == function.name)
        {
            *existing = function;
        } else {
            self.functions.push(function);
        }
    }

    /// Names in registration order; the compiler resolves against this.
    pub fn names(&self) -> Vec<String> {
        self.functions
            .iter()
            .map(|f| f.name.as_ref().clone())
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&NativeFunction> {
        self.functions.iter().find(|f| f.name.as_str() == name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub(crate) fn into_functions(self) -> Vec<NativeFunction> {
        self.functions
    }
}

impl Default for Builtins {
    fn default() -> Self {
        Self::core()
    }
}

fn builtin_len(value: &Value, span: crate::span::Span) -> Result<Value, RuntimeError> {
    let len = match value {
        Value::Str(s) => s.chars().count(),
        Value::Bytes(b) => b.len(),
        Value::Array(arr) => arr.borrow().len(),
        Value::ImmutableArray(arr) => arr.len(),
        Value::Map(map) => map.borrow().len(),
        Value::ImmutableMap(map) => map.len(),
        other => {
            return Err(RuntimeError::type_mismatch(
                "sized value",
                other.type_name(),
                span,
            ))
        }
    };
    Ok(Value::Int(len as i64))
}

fn builtin_char(value: &Value) -> Option<Value> {
    match value {
        Value::Char(c) => Some(Value::Char(*c)),
        Value::Int(n) => u32::try_from(*n).ok().and_then(char::from_u32).map(Value::Char),
        Value::Str(s) => {
            let mut chars = s.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Some(Value::Char(c)),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Shallow copy: a fresh container sharing its elements.
fn builtin_copy(value: &Value) -> Value {
    match value {
        Value::Array(arr) => Value::array(arr.borrow().clone()),
        Value::ImmutableArray(arr) => Value::array(arr.as_ref().clone()),
        Value::Map(map) => Value::map(map.borrow().clone()),
        Value::ImmutableMap(map) => Value::map(map.as_ref().clone()),
        other => other.clone(),
    }
}
