//! Function call dispatch for the VM.
//!
//! Closure calls push a frame and stay in the dispatch loop; native calls
//! invoke the host function directly with an [`Interop`] handle so it can
//! call back into script values. Arity is validated here, at call time,
//! because the callee is a dynamically-typed value; a mismatch is a
//! recoverable failure that lands as an Error value at the result position.

use std::rc::Rc;

use crate::error::RuntimeError;
use crate::limits::ResourceLimits;
use crate::span::Span;
use crate::value::{NativeFunction, Value};

use super::cell::Closure;
use super::vm::Vm;

impl Vm {
    /// Dispatch a call: stack holds `[callee, arg0 .. argN-1]`.
    pub(super) fn call_value(
        &mut self,
        argc: u8,
        spread: bool,
        span: Span,
    ) -> Result<(), RuntimeError> {
        let mut argc = argc as usize;
        if spread {
            // The trailing argument unpacks into positional arguments.
            let last = self.pop()?;
            argc = argc
                .checked_sub(1)
                .ok_or_else(|| RuntimeError::corrupt("spread call without arguments"))?;
            match last {
                Value::Array(arr) => {
                    for element in arr.borrow().iter() {
                        self.push(element.clone(), span)?;
                        argc += 1;
                    }
                }
                Value::ImmutableArray(arr) => {
                    for element in arr.iter() {
                        self.push(element.clone(), span)?;
                        argc += 1;
                    }
                }
                other => {
                    let err = RuntimeError::type_mismatch(
                        "array to spread",
                        other.type_name(),
                        span,
                    );
                    return self.reject_call(argc, err, span);
                }
            }
        }

        let callee_idx = self
            .stack
            .len()
            .checked_sub(argc + 1)
            .ok_or_else(|| RuntimeError::corrupt("stack underflow in call"))?;
        let callee = self.stack[callee_idx].clone();
        match callee {
            Value::Closure(closure) => self.call_closure(closure, argc, callee_idx, span),
            Value::Native(native) => self.call_native(native, argc, span),
            other => {
                let err = RuntimeError::type_mismatch(
                    "callable value",
                    other.type_name(),
                    span,
                );
                self.reject_call(argc, err, span)
            }
        }
    }

    /// Drop the callee and arguments, leaving the Error value at the call's
    /// result position.
    fn reject_call(
        &mut self,
        argc: usize,
        err: RuntimeError,
        span: Span,
    ) -> Result<(), RuntimeError> {
        let floor = self
            .stack
            .len()
            .checked_sub(argc + 1)
            .ok_or_else(|| RuntimeError::corrupt("stack underflow in call"))?;
        self.stack.truncate(floor);
        self.push(Value::error_from(&err), span)
    }

    fn call_closure(
        &mut self,
        closure: Rc<Closure>,
        argc: usize,
        base: usize,
        span: Span,
    ) -> Result<(), RuntimeError> {
        let num_params = closure.proto.num_params as usize;
        if closure.proto.variadic {
            // The final parameter collects the remaining arguments.
            let fixed = num_params.saturating_sub(1);
            if argc < fixed {
                let err =
                    RuntimeError::wrong_arity(format!("at least {}", fixed), argc, span);
                return self.reject_call(argc, err, span);
            }
            let rest = self.stack.split_off(base + 1 + fixed);
            self.push(Value::array(rest), span)?;
        } else if argc != num_params {
            let err = RuntimeError::wrong_arity(num_params.to_string(), argc, span);
            return self.reject_call(argc, err, span);
        }
        self.push_frame(closure, base, span)
    }

    fn call_native(
        &mut self,
        native: NativeFunction,
        argc: usize,
        span: Span,
    ) -> Result<(), RuntimeError> {
        if let Some(arity) = native.arity {
            if argc != arity {
                let err = RuntimeError::wrong_arity(arity.to_string(), argc, span);
                return self.reject_call(argc, err, span);
            }
        }
        let start = self
            .stack
            .len()
            .checked_sub(argc)
            .ok_or_else(|| RuntimeError::corrupt("stack underflow in call"))?;
        let args = self.stack.split_off(start);
        self.pop()?; // callee

        let func = native.func.clone();
        let result = func(&mut Interop { vm: self, span }, &args);
        match result {
            Ok(value) => self.push(value, span),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => self.push(Value::error_from(&err), span),
        }
    }
}

/// Handle a native function uses to call back into script.
///
/// `call` runs a nested dispatch loop to completion, so host and script can
/// compose round trips (script calls host, host calls a script closure,
/// which may call host again) on the one VM.
pub struct Interop<'a> {
    pub(super) vm: &'a mut Vm,
    pub(super) span: Span,
}

impl Interop<'_> {
    /// Synchronously invoke a callable value.
    ///
    /// Recoverable failures (wrong arity, non-callable callee, errors the
    /// callee produced) come back as an `Ok` Error value, matching what a
    /// script-level call would see; fatal VM conditions propagate as `Err`.
    pub fn call(&mut self, callee: Value, args: &[Value]) -> Result<Value, RuntimeError> {
        if args.len() > u8::MAX as usize {
            return Err(RuntimeError::wrong_arity(
                "at most 255",
                args.len(),
                self.span,
            ));
        }
        let span = self.span;
        let floor = self.vm.frames.len();
        self.vm.push(callee, span)?;
        for arg in args {
            self.vm.push(arg.clone(), span)?;
        }
        self.vm.call_value(args.len() as u8, false, span)?;
        if self.vm.frames.len() > floor {
            self.vm.run_loop(floor + 1)
        } else {
            // Native or rejected call: the result is already on the stack.
            self.vm.pop()
        }
    }

    /// Span of the call site that entered native code.
    pub fn span(&self) -> Span {
        self.span
    }

    pub fn limits(&self) -> &ResourceLimits {
        &self.vm.limits
    }
}
