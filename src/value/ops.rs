//! Operator semantics: binary dispatch on variant pairs, indexing, slicing.
//!
//! The VM pops operands and hands them here; every failure is a
//! `RuntimeError` the dispatch loop either converts to a catchable Error
//! value or, for fatal kinds, propagates to the host.

use std::rc::Rc;

use chrono::Duration;

use crate::error::RuntimeError;
use crate::limits::ResourceLimits;
use crate::span::Span;

use super::Value;

/// An Error operand flows through arithmetic unchanged, left-biased, so a
/// failed sub-expression surfaces at the end of a larger one.
fn propagate_error(a: &Value, b: &Value) -> Option<Value> {
    if a.is_error() {
        Some(a.clone())
    } else if b.is_error() {
        Some(b.clone())
    } else {
        None
    }
}

pub fn add(
    a: Value,
    b: Value,
    limits: &ResourceLimits,
    span: Span,
) -> Result<Value, RuntimeError> {
    if let Some(err) = propagate_error(&a, &b) {
        return Ok(err);
    }
    match (&a, &b) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_add(*b))),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a + b)),
        (Value::Int(a), Value::Float(b)) => Ok(Value::Float(*a as f64 + b)),
        (Value::Float(a), Value::Int(b)) => Ok(Value::Float(a + *b as f64)),
        (Value::Char(c), Value::Int(n)) | (Value::Int(n), Value::Char(c)) => {
            let code = (*c as i64).wrapping_add(*n);
            u32::try_from(code)
                .ok()
                .and_then(char::from_u32)
                .map(Value::Char)
                .ok_or_else(|| {
                    RuntimeError::type_mismatch("valid code point", format!("{}", code), span)
                })
        }
        (Value::Str(a), Value::Str(b)) => {
            concat_str(a.as_str(), b.as_str(), limits, span)
        }
        (Value::Str(a), Value::Char(c)) => {
            let mut buf = String::with_capacity(a.len() + c.len_utf8());
            buf.push_str(a);
            buf.push(*c);
            checked_str(buf, limits, span)
        }
        (Value::Char(c), Value::Str(b)) => {
            let mut buf = String::with_capacity(b.len() + c.len_utf8());
            buf.push(*c);
            buf.push_str(b);
            checked_str(buf, limits, span)
        }
        (Value::Bytes(a), Value::Bytes(b)) => {
            let total = a.len() + b.len();
            if total > limits.max_bytes_len {
                return Err(RuntimeError::BytesLimit {
                    limit: limits.max_bytes_len,
                    span,
                });
            }
            let mut buf = Vec::with_capacity(total);
            buf.extend_from_slice(a);
            buf.extend_from_slice(b);
            Ok(Value::Bytes(Rc::new(buf)))
        }
        (Value::Array(a), Value::Array(b)) => {
            let mut out = a.borrow().clone();
            out.extend(b.borrow().iter().cloned());
            Ok(Value::array(out))
        }
        (Value::Time(t), Value::Int(secs)) => Ok(Value::Time(*t + Duration::seconds(*secs))),
        _ => Err(binary_mismatch("+", &a, &b, span)),
    }
}

fn concat_str(
    a: &str,
    b: &str,
    limits: &ResourceLimits,
    span: Span,
) -> Result<Value, RuntimeError> {
    let total = a.len() + b.len();
    if total > limits.max_string_len {
        return Err(RuntimeError::StringLimit {
            limit: limits.max_string_len,
            span,
        });
    }
    let mut buf = String::with_capacity(total);
    buf.push_str(a);
    buf.push_str(b);
    Ok(Value::Str(Rc::new(buf)))
}

fn checked_str(buf: String, limits: &ResourceLimits, span: Span) -> Result<Value, RuntimeError> {
    if buf.len() > limits.max_string_len {
        return Err(RuntimeError::StringLimit {
            limit: limits.max_string_len,
            span,
        });
    }
    Ok(Value::Str(Rc::new(buf)))
}

pub fn subtract(a: Value, b: Value, span: Span) -> Result<Value, RuntimeError> {
    if let Some(err) = propagate_error(&a, &b) {
        return Ok(err);
    }
    match (&a, &b) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_sub(*b))),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a - b)),
        (Value::Int(a), Value::Float(b)) => Ok(Value::Float(*a as f64 - b)),
        (Value::Float(a), Value::Int(b)) => Ok(Value::Float(a - *b as f64)),
        (Value::Time(t), Value::Int(secs)) => Ok(Value::Time(*t - Duration::seconds(*secs))),
        (Value::Time(a), Value::Time(b)) => Ok(Value::Int((*a - *b).num_seconds())),
        _ => Err(binary_mismatch("-", &a, &b, span)),
    }
}

pub fn multiply(a: Value, b: Value, span: Span) -> Result<Value, RuntimeError> {
    if let Some(err) = propagate_error(&a, &b) {
        return Ok(err);
    }
    match (&a, &b) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_mul(*b))),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a * b)),
        (Value::Int(a), Value::Float(b)) => Ok(Value::Float(*a as f64 * b)),
        (Value::Float(a), Value::Int(b)) => Ok(Value::Float(a * *b as f64)),
        _ => Err(binary_mismatch("*", &a, &b, span)),
    }
}

pub fn divide(a: Value, b: Value, span: Span) -> Result<Value, RuntimeError> {
    if let Some(err) = propagate_error(&a, &b) {
        return Ok(err);
    }
    match (&a, &b) {
        // Only integer division by zero is an error; float division follows
        // IEEE semantics and non-numeric operands are a type mismatch.
        (Value::Int(_), Value::Int(0)) => Err(RuntimeError::DivisionByZero(span)),
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_div(*b))),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a / b)),
        (Value::Int(a), Value::Float(b)) => Ok(Value::Float(*a as f64 / b)),
        (Value::Float(a), Value::Int(b)) => Ok(Value::Float(a / *b as f64)),
        _ => Err(binary_mismatch("/", &a, &b, span)),
    }
}

pub fn remainder(a: Value, b: Value, span: Span) -> Result<Value, RuntimeError> {
    if let Some(err) = propagate_error(&a, &b) {
        return Ok(err);
    }
    match (&a, &b) {
        (Value::Int(_), Value::Int(0)) => Err(RuntimeError::DivisionByZero(span)),
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_rem(*b))),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a % b)),
        (Value::Int(a), Value::Float(b)) => Ok(Value::Float(*a as f64 % b)),
        (Value::Float(a), Value::Int(b)) => Ok(Value::Float(a % *b as f64)),
        _ => Err(binary_mismatch("%", &a, &b, span)),
    }
}

pub fn negate(v: Value, span: Span) -> Result<Value, RuntimeError> {
    match v {
        Value::Int(n) => Ok(Value::Int(n.wrapping_neg())),
        Value::Float(n) => Ok(Value::Float(-n)),
        err @ Value::Error(_) => Ok(err),
        other => Err(RuntimeError::type_mismatch("int or float", other.type_name(), span)),
    }
}

pub fn compare_less(a: &Value, b: &Value, span: Span) -> Result<bool, RuntimeError> {
    match (a, b) {
        (Value::Int(a), Value::Int(b)) => Ok(a < b),
        (Value::Float(a), Value::Float(b)) => Ok(a < b),
        (Value::Int(a), Value::Float(b)) => Ok((*a as f64) < *b),
        (Value::Float(a), Value::Int(b)) => Ok(*a < (*b as f64)),
        (Value::Char(a), Value::Char(b)) => Ok(a < b),
        (Value::Str(a), Value::Str(b)) => Ok(a < b),
        (Value::Time(a), Value::Time(b)) => Ok(a < b),
        _ => Err(binary_mismatch("<", a, b, span)),
    }
}

pub fn compare_less_equal(a: &Value, b: &Value, span: Span) -> Result<bool, RuntimeError> {
    match (a, b) {
        (Value::Int(a), Value::Int(b)) => Ok(a <= b),
        (Value::Float(a), Value::Float(b)) => Ok(a <= b),
        (Value::Int(a), Value::Float(b)) => Ok((*a as f64) <= *b),
        (Value::Float(a), Value::Int(b)) => Ok(*a <= (*b as f64)),
        (Value::Char(a), Value::Char(b)) => Ok(a <= b),
        (Value::Str(a), Value::Str(b)) => Ok(a <= b),
        (Value::Time(a), Value::Time(b)) => Ok(a <= b),
        _ => Err(binary_mismatch("<=", a, b, span)),
    }
}

fn binary_mismatch(op: &str, a: &Value, b: &Value, span: Span) -> RuntimeError {
    RuntimeError::type_mismatch(
        format!("operands supporting '{}'", op),
        format!("{} and {}", a.type_name(), b.type_name()),
        span,
    )
}

/// Normalize a (possibly negative) index against `len`, without clamping.
fn normalize(index: i64, len: usize) -> i64 {
    if index < 0 {
        len as i64 + index
    } else {
        index
    }
}

pub fn index_get(object: &Value, index: &Value, span: Span) -> Result<Value, RuntimeError> {
    match (object, index) {
        (Value::Array(arr), Value::Int(i)) => {
            let arr = arr.borrow();
            element_at(&arr, *i, span)
        }
        (Value::ImmutableArray(arr), Value::Int(i)) => element_at(arr, *i, span),
        (Value::Map(map), Value::Str(key)) => {
            Ok(map.borrow().get(key.as_str()).cloned().unwrap_or(Value::Undefined))
        }
        (Value::ImmutableMap(map), Value::Str(key)) => {
            Ok(map.get(key.as_str()).cloned().unwrap_or(Value::Undefined))
        }
        (Value::Str(s), Value::Int(i)) => {
            let chars: Vec<char> = s.chars().collect();
            let idx = normalize(*i, chars.len());
            chars
                .get(usize::try_from(idx).unwrap_or(usize::MAX))
                .map(|c| Value::Char(*c))
                .ok_or(RuntimeError::IndexOutOfBounds {
                    index: *i,
                    length: chars.len(),
                    span,
                })
        }
        (Value::Bytes(b), Value::Int(i)) => {
            let idx = normalize(*i, b.len());
            b.get(usize::try_from(idx).unwrap_or(usize::MAX))
                .map(|byte| Value::Int(i64::from(*byte)))
                .ok_or(RuntimeError::IndexOutOfBounds {
                    index: *i,
                    length: b.len(),
                    span,
                })
        }
        (Value::Map(_) | Value::ImmutableMap(_), other) => Err(RuntimeError::InvalidKeyType(
            other.type_name().to_string(),
            span,
        )),
        (Value::Array(_) | Value::ImmutableArray(_) | Value::Str(_) | Value::Bytes(_), other) => {
            Err(RuntimeError::type_mismatch("int index", other.type_name(), span))
        }
        (other, _) => Err(RuntimeError::type_mismatch(
            "indexable value",
            other.type_name(),
            span,
        )),
    }
}

fn element_at(elements: &[Value], index: i64, span: Span) -> Result<Value, RuntimeError> {
    let idx = normalize(index, elements.len());
    elements
        .get(usize::try_from(idx).unwrap_or(usize::MAX))
        .cloned()
        .ok_or(RuntimeError::IndexOutOfBounds {
            index,
            length: elements.len(),
            span,
        })
}

pub fn index_set(
    object: &Value,
    index: &Value,
    value: Value,
    span: Span,
) -> Result<(), RuntimeError> {
    match (object, index) {
        (Value::Array(arr), Value::Int(i)) => {
            let mut arr = arr.borrow_mut();
            let len = arr.len();
            let idx = normalize(*i, len);
            match usize::try_from(idx).ok().filter(|idx| *idx < len) {
                Some(idx) => {
                    arr[idx] = value;
                    Ok(())
                }
                None => Err(RuntimeError::IndexOutOfBounds {
                    index: *i,
                    length: len,
                    span,
                }),
            }
        }
        (Value::Map(map), Value::Str(key)) => {
            map.borrow_mut().insert(key.as_ref().clone(), value);
            Ok(())
        }
        (Value::ImmutableArray(_), _) => Err(RuntimeError::type_mismatch(
            "mutable array",
            object.type_name(),
            span,
        )),
        (Value::ImmutableMap(_), _) => Err(RuntimeError::type_mismatch(
            "mutable map",
            object.type_name(),
            span,
        )),
        (Value::Map(_), other) => Err(RuntimeError::InvalidKeyType(
            other.type_name().to_string(),
            span,
        )),
        (Value::Array(_), other) => {
            Err(RuntimeError::type_mismatch("int index", other.type_name(), span))
        }
        (other, _) => Err(RuntimeError::type_mismatch(
            "mutable indexable value",
            other.type_name(),
            span,
        )),
    }
}

/// Slice bounds: either bound may be Undefined (open). Negative indices
/// count from the end; both ends clamp to the value's length.
fn slice_bounds(
    low: &Value,
    high: &Value,
    len: usize,
    span: Span,
) -> Result<(usize, usize), RuntimeError> {
    let resolve = |bound: &Value, default: i64| -> Result<i64, RuntimeError> {
        match bound {
            Value::Undefined => Ok(default),
            Value::Int(n) => Ok(normalize(*n, len)),
            other => Err(RuntimeError::type_mismatch("int bound", other.type_name(), span)),
        }
    };
    let lo = resolve(low, 0)?.clamp(0, len as i64) as usize;
    let hi = resolve(high, len as i64)?.clamp(0, len as i64) as usize;
    Ok((lo, hi.max(lo)))
}

pub fn slice(
    object: &Value,
    low: &Value,
    high: &Value,
    span: Span,
) -> Result<Value, RuntimeError> {
    match object {
        Value::Array(arr) => {
            let arr = arr.borrow();
            let (lo, hi) = slice_bounds(low, high, arr.len(), span)?;
            Ok(Value::array(arr[lo..hi].to_vec()))
        }
        Value::ImmutableArray(arr) => {
            let (lo, hi) = slice_bounds(low, high, arr.len(), span)?;
            Ok(Value::ImmutableArray(Rc::new(arr[lo..hi].to_vec())))
        }
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            let (lo, hi) = slice_bounds(low, high, chars.len(), span)?;
            Ok(Value::string(chars[lo..hi].iter().collect::<String>()))
        }
        Value::Bytes(b) => {
            let (lo, hi) = slice_bounds(low, high, b.len(), span)?;
            Ok(Value::bytes(b[lo..hi].to_vec()))
        }
        other => Err(RuntimeError::type_mismatch(
            "sliceable value",
            other.type_name(),
            span,
        )),
    }
}
