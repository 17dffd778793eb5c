//! Runtime values: the dynamic object model.

pub mod ops;

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;

use crate::error::RuntimeError;
use crate::vm::cell::Closure;
use crate::vm::vm_calls::Interop;

/// Map payload: ordered, O(1) lookups, fast non-cryptographic hashing.
pub type ValueMap = IndexMap<String, Value, ahash::RandomState>;

/// Result type for host-supplied native functions.
pub type NativeResult = Result<Value, RuntimeError>;

/// A runtime value.
///
/// A closed set: every operator, capability query, and VM opcode matches
/// exhaustively over these variants, so adding one is a compile error until
/// every dispatch site handles it.
#[derive(Clone)]
pub enum Value {
    /// The absent value.
    Undefined,
    /// Boolean.
    Bool(bool),
    /// 64-bit signed integer (wrapping arithmetic).
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// A single code point.
    Char(char),
    /// Immutable string, length-capped at concatenation sites.
    Str(Rc<String>),
    /// Length-capped byte buffer.
    Bytes(Rc<Vec<u8>>),
    /// Mutable ordered sequence.
    Array(Rc<RefCell<Vec<Value>>>),
    /// Frozen sequence; never mutated after construction.
    ImmutableArray(Rc<Vec<Value>>),
    /// Mutable string-keyed mapping.
    Map(Rc<RefCell<ValueMap>>),
    /// Frozen mapping; also the shape of module namespaces.
    ImmutableMap(Rc<ValueMap>),
    /// A wrapped value, catchable in-language.
    Error(Rc<Value>),
    /// A compiled function plus its captured cells.
    Closure(Rc<Closure>),
    /// Host-supplied callable.
    Native(NativeFunction),
    /// A point in time.
    Time(DateTime<Utc>),
}

/// A host function callable from script.
///
/// Receives an [`Interop`] handle for synchronous re-entrant calls back into
/// script closures, plus the popped argument run. Declared arity is checked
/// by the VM before invocation when present.
#[derive(Clone)]
pub struct NativeFunction {
    pub name: Rc<String>,
    pub arity: Option<usize>,
    pub func: Rc<dyn Fn(&mut Interop<'_>, &[Value]) -> NativeResult>,
}

impl NativeFunction {
    pub fn new<F>(name: impl Into<String>, arity: Option<usize>, func: F) -> Self
    where
        F: Fn(&mut Interop<'_>, &[Value]) -> NativeResult + 'static,
    {
        Self {
            name: Rc::new(name.into()),
            arity,
            func: Rc::new(func),
        }
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<native fn {}>", self.name)
    }
}

impl Value {
    pub fn string(s: impl Into<String>) -> Value {
        Value::Str(Rc::new(s.into()))
    }

    pub fn bytes(b: impl Into<Vec<u8>>) -> Value {
        Value::Bytes(Rc::new(b.into()))
    }

    pub fn array(elements: Vec<Value>) -> Value {
        Value::Array(Rc::new(RefCell::new(elements)))
    }

    pub fn map(entries: ValueMap) -> Value {
        Value::Map(Rc::new(RefCell::new(entries)))
    }

    pub fn empty_map() -> Value {
        Value::Map(Rc::new(RefCell::new(ValueMap::default())))
    }

    /// Wrap a message in a catchable Error value.
    pub fn error(message: impl Into<String>) -> Value {
        Value::Error(Rc::new(Value::string(message)))
    }

    /// The Error value form of a recoverable runtime error.
    pub fn error_from(err: &RuntimeError) -> Value {
        Value::error(err.to_string())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Char(_) => "char",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
            Value::ImmutableArray(_) => "immutable array",
            Value::Map(_) => "map",
            Value::ImmutableMap(_) => "immutable map",
            Value::Error(_) => "error",
            Value::Closure(_) => "function",
            Value::Native(_) => "function",
            Value::Time(_) => "time",
        }
    }

    /// Whether `for-in` can walk this value.
    pub fn can_iterate(&self) -> bool {
        matches!(
            self,
            Value::Array(_)
                | Value::ImmutableArray(_)
                | Value::Map(_)
                | Value::ImmutableMap(_)
                | Value::Str(_)
                | Value::Bytes(_)
        )
    }

    /// Whether `Call` accepts this value as a callee.
    pub fn can_call(&self) -> bool {
        matches!(self, Value::Closure(_) | Value::Native(_))
    }

    pub fn is_falsy(&self) -> bool {
        match self {
            Value::Undefined => true,
            Value::Bool(b) => !b,
            Value::Int(n) => *n == 0,
            Value::Float(n) => *n == 0.0,
            Value::Char(c) => *c == '\0',
            Value::Str(s) => s.is_empty(),
            Value::Bytes(b) => b.is_empty(),
            Value::Array(arr) => arr.borrow().is_empty(),
            Value::ImmutableArray(arr) => arr.is_empty(),
            Value::Map(map) => map.borrow().is_empty(),
            Value::ImmutableMap(map) => map.is_empty(),
            Value::Error(_) => true,
            Value::Closure(_) | Value::Native(_) => false,
            Value::Time(_) => false,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }

    /// One-way widening coercion to int. Floats truncate toward zero.
    pub fn to_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            Value::Float(n) if n.is_finite() => Some(*n as i64),
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Char(c) => Some(*c as i64),
            Value::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn to_float(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(n) => Some(*n),
            Value::Bool(b) => Some(f64::from(u8::from(*b))),
            Value::Str(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn to_bool(&self) -> bool {
        !self.is_falsy()
    }

    /// Explicit freeze: the immutable twin of a mutable container.
    ///
    /// Shallow — elements are shared, the container itself is copied out of
    /// its cell. Every other variant freezes to itself.
    pub fn frozen(&self) -> Value {
        match self {
            Value::Array(arr) => Value::ImmutableArray(Rc::new(arr.borrow().clone())),
            Value::Map(map) => Value::ImmutableMap(Rc::new(map.borrow().clone())),
            other => other.clone(),
        }
    }
}

/// Depth budget for deep walks (equality, printing). Containers can be made
/// cyclic from script (`a[0] = a`), so recursion cannot trust the data: past
/// the budget containers compare by identity and print as "...".
const MAX_VALUE_DEPTH: usize = 64;

fn arrays_eq(a: &[Value], b: &[Value], depth: usize) -> bool {
    a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| values_eq(x, y, depth))
}

fn maps_eq(a: &ValueMap, b: &ValueMap, depth: usize) -> bool {
    a.len() == b.len()
        && a.iter()
            .all(|(k, v)| b.get(k).map_or(false, |w| values_eq(v, w, depth)))
}

fn values_eq(a: &Value, b: &Value, depth: usize) -> bool {
    let deeper = depth < MAX_VALUE_DEPTH;
    match (a, b) {
        (Value::Undefined, Value::Undefined) => true,
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Int(a), Value::Int(b)) => a == b,
        (Value::Float(a), Value::Float(b)) => a == b,
        (Value::Int(a), Value::Float(b)) => (*a as f64) == *b,
        (Value::Float(a), Value::Int(b)) => *a == (*b as f64),
        (Value::Char(a), Value::Char(b)) => a == b,
        (Value::Str(a), Value::Str(b)) => a == b,
        (Value::Bytes(a), Value::Bytes(b)) => a == b,
        (Value::Array(a), Value::Array(b)) => {
            Rc::ptr_eq(a, b) || (deeper && arrays_eq(&a.borrow(), &b.borrow(), depth + 1))
        }
        (Value::Array(a), Value::ImmutableArray(b)) => {
            deeper && arrays_eq(&a.borrow(), b, depth + 1)
        }
        (Value::ImmutableArray(a), Value::Array(b)) => {
            deeper && arrays_eq(a, &b.borrow(), depth + 1)
        }
        (Value::ImmutableArray(a), Value::ImmutableArray(b)) => {
            Rc::ptr_eq(a, b) || (deeper && arrays_eq(a, b, depth + 1))
        }
        (Value::Map(a), Value::Map(b)) => {
            Rc::ptr_eq(a, b) || (deeper && maps_eq(&a.borrow(), &b.borrow(), depth + 1))
        }
        (Value::Map(a), Value::ImmutableMap(b)) => deeper && maps_eq(&a.borrow(), b, depth + 1),
        (Value::ImmutableMap(a), Value::Map(b)) => deeper && maps_eq(a, &b.borrow(), depth + 1),
        (Value::ImmutableMap(a), Value::ImmutableMap(b)) => {
            Rc::ptr_eq(a, b) || (deeper && maps_eq(a, b, depth + 1))
        }
        (Value::Error(a), Value::Error(b)) => {
            Rc::ptr_eq(a, b) || (deeper && values_eq(a, b, depth + 1))
        }
        (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
        (Value::Native(a), Value::Native(b)) => {
            #[allow(clippy::vtable_address_comparisons)]
            Rc::ptr_eq(&a.func, &b.func)
        }
        (Value::Time(a), Value::Time(b)) => a == b,
        _ => false,
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        values_eq(self, other, 0)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_value(f, self, 0)
    }
}

fn fmt_value(f: &mut fmt::Formatter<'_>, value: &Value, depth: usize) -> fmt::Result {
    match value {
        Value::Undefined => write!(f, "undefined"),
        Value::Bool(b) => write!(f, "{}", b),
        Value::Int(n) => write!(f, "{}", n),
        Value::Float(n) => write!(f, "{}", n),
        Value::Char(c) => write!(f, "{}", c),
        Value::Str(s) => write!(f, "{}", s),
        Value::Bytes(b) => {
            write!(f, "bytes[")?;
            for (i, byte) in b.iter().enumerate() {
                if i > 0 {
                    write!(f, " ")?;
                }
                write!(f, "{:02x}", byte)?;
            }
            write!(f, "]")
        }
        Value::Array(arr) => fmt_array(f, &arr.borrow(), depth),
        Value::ImmutableArray(arr) => fmt_array(f, arr, depth),
        Value::Map(map) => fmt_map(f, &map.borrow(), depth),
        Value::ImmutableMap(map) => fmt_map(f, map, depth),
        Value::Error(inner) => {
            if depth >= MAX_VALUE_DEPTH {
                write!(f, "error: ...")
            } else {
                write!(f, "error: ")?;
                fmt_value(f, inner, depth + 1)
            }
        }
        Value::Closure(c) => match &c.proto.name {
            Some(name) => write!(f, "<fn {}>", name),
            None => write!(f, "<fn>"),
        },
        Value::Native(n) => write!(f, "<native fn {}>", n.name),
        Value::Time(t) => write!(f, "{}", t.to_rfc3339()),
    }
}

fn fmt_array(f: &mut fmt::Formatter<'_>, elements: &[Value], depth: usize) -> fmt::Result {
    if depth >= MAX_VALUE_DEPTH {
        return write!(f, "[...]");
    }
    write!(f, "[")?;
    for (i, val) in elements.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        fmt_value(f, val, depth + 1)?;
    }
    write!(f, "]")
}

fn fmt_map(f: &mut fmt::Formatter<'_>, map: &ValueMap, depth: usize) -> fmt::Result {
    if depth >= MAX_VALUE_DEPTH {
        return write!(f, "{{...}}");
    }
    write!(f, "{{")?;
    for (i, (key, val)) in map.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}: ", key)?;
        fmt_value(f, val, depth + 1)?;
    }
    write!(f, "}}")
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Char(c) => write!(f, "{:?}", c),
            other => write!(f, "{}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_structural_equality_across_mutability() {
        let a = Value::array(vec![Value::Int(1), Value::Int(2)]);
        let b = a.frozen();
        assert_eq!(a, b);
        assert_eq!(b, b.clone());
    }

    #[test]
    fn test_numeric_cross_type_equality() {
        assert_eq!(Value::Int(3), Value::Float(3.0));
        assert_ne!(Value::Int(3), Value::Float(3.5));
    }

    #[test]
    fn test_falsiness() {
        assert!(Value::Undefined.is_falsy());
        assert!(Value::Int(0).is_falsy());
        assert!(Value::string("").is_falsy());
        assert!(Value::error("boom").is_falsy());
        assert!(!Value::Int(1).is_falsy());
        assert!(!Value::string("x").is_falsy());
    }

    #[test]
    fn test_coercions() {
        assert_eq!(Value::Float(-3.9).to_int(), Some(-3)); // truncates toward zero
        assert_eq!(Value::Bool(true).to_int(), Some(1));
        assert_eq!(Value::string("42").to_int(), Some(42));
        assert_eq!(Value::string("1.5").to_float(), Some(1.5));
        assert_eq!(Value::array(vec![]).to_int(), None);
    }

    #[test]
    fn test_frozen_is_shallow_and_observable() {
        let v = Value::array(vec![Value::Int(1)]);
        let frozen = v.frozen();
        assert_eq!(frozen.type_name(), "immutable array");
        // The original stays mutable and diverges after the freeze.
        if let Value::Array(arr) = &v {
            arr.borrow_mut().push(Value::Int(2));
        }
        assert_ne!(v, frozen);
    }

    fn cyclic_array() -> Value {
        let a = Value::array(vec![Value::Int(1)]);
        if let Value::Array(arr) = &a {
            arr.borrow_mut()[0] = a.clone();
        }
        a
    }

    #[test]
    fn test_cyclic_container_equality_terminates() {
        let a = cyclic_array();
        // Shared storage compares by identity before any walk.
        assert!(a == a.clone());
        // Distinct cycles bottom out at the depth budget instead of recursing.
        let b = cyclic_array();
        assert!(a != b);

        let m = Value::empty_map();
        if let Value::Map(map) = &m {
            map.borrow_mut().insert("self".to_string(), m.clone());
        }
        assert!(m == m.clone());
    }

    #[test]
    fn test_cyclic_container_display_terminates() {
        let a = cyclic_array();
        let rendered = a.to_string();
        assert!(rendered.starts_with('['));
        assert!(rendered.contains("[...]"));

        let m = Value::empty_map();
        if let Value::Map(map) = &m {
            map.borrow_mut().insert("self".to_string(), m.clone());
        }
        assert!(m.to_string().contains("{...}"));
    }

    #[test]
    fn test_capability_queries() {
        assert!(Value::string("ab").can_iterate());
        assert!(Value::empty_map().can_iterate());
        assert!(!Value::Int(1).can_iterate());
        assert!(!Value::Int(1).can_call());
        let native = Value::Native(NativeFunction::new("id", Some(1), |_, args| {
            Ok(args[0].clone())
        }));
        assert!(native.can_call());
    }
}
