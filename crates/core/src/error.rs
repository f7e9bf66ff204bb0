//! Runtime error taxonomy
//!
//! Errors surfaced to the language are data; internally they travel as
//! typed variants. The split between catchable and internal kinds matters:
//! stack overflow, stack underflow, out-of-memory and invalid-instruction
//! indicate a broken engine invariant and must never be observable from a
//! `catch` clause.

use crate::value::Value;
use std::fmt;
use std::rc::Rc;

/// Classification of a runtime failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Wrong value kind for an operation
    Type,
    /// Callable invoked with an unsupported argument count
    Arity,
    /// Unresolved symbol or undefined var
    Name,
    /// Out-of-range collection access
    Index,
    /// Divide-by-zero, overflow past the promoting path, etc.
    Arithmetic,
    /// Illegal argument value
    Value,
    /// I/O failure (slurp)
    Io,
    /// A user `throw` or `ex-info` exception
    User,
    /// Operand stack exhausted (internal)
    StackOverflow,
    /// Operand stack underrun (internal)
    StackUnderflow,
    /// Allocation failure (internal)
    OutOfMemory,
    /// Corrupt or unknown bytecode (internal)
    InvalidInstruction,
}

impl ErrorKind {
    /// Whether user code may observe this error through `try`/`catch`.
    pub fn catchable(self) -> bool {
        !matches!(
            self,
            ErrorKind::StackOverflow
                | ErrorKind::StackUnderflow
                | ErrorKind::OutOfMemory
                | ErrorKind::InvalidInstruction
        )
    }

    /// Stable name used in the synthetic exception map's `:__ex_type`.
    pub fn type_name(self) -> &'static str {
        match self {
            ErrorKind::Type => "TypeError",
            ErrorKind::Arity => "ArityError",
            ErrorKind::Name => "NameError",
            ErrorKind::Index => "IndexError",
            ErrorKind::Arithmetic => "ArithmeticError",
            ErrorKind::Value => "ValueError",
            ErrorKind::Io => "IOError",
            ErrorKind::User => "Exception",
            ErrorKind::StackOverflow => "StackOverflow",
            ErrorKind::StackUnderflow => "StackUnderflow",
            ErrorKind::OutOfMemory => "OutOfMemory",
            ErrorKind::InvalidInstruction => "InvalidInstruction",
        }
    }
}

/// One saved call-stack entry, collected at call entry and pruned on return.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceFrame {
    pub name: Rc<str>,
    pub ns: Rc<str>,
    pub line: u32,
    pub col: u32,
}

/// A runtime failure travelling up through the VM or tree-walk evaluator.
///
/// `data` carries the thrown value for `ErrorKind::User` (what a `catch`
/// binding sees); `trace` is appended as frames unwind.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub kind: ErrorKind,
    pub message: String,
    pub data: Option<Value>,
    pub trace: Vec<TraceFrame>,
}

impl RuntimeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        RuntimeError {
            kind,
            message: message.into(),
            data: None,
            trace: Vec::new(),
        }
    }

    /// A user exception carrying the thrown value.
    pub fn thrown(value: Value) -> Self {
        RuntimeError {
            kind: ErrorKind::User,
            message: match &value {
                Value::Str(s) => s.to_string(),
                other => other.pr_str(),
            },
            data: Some(value),
            trace: Vec::new(),
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn catchable(&self) -> bool {
        self.kind.catchable()
    }

    pub fn push_frame(&mut self, frame: TraceFrame) {
        self.trace.push(frame);
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.type_name(), self.message)
    }
}

impl std::error::Error for RuntimeError {}

/// Shorthand constructors; the message is always the full user-facing text.
pub fn type_error(message: impl Into<String>) -> RuntimeError {
    RuntimeError::new(ErrorKind::Type, message)
}

pub fn arity_error(name: &str, got: usize) -> RuntimeError {
    RuntimeError::new(
        ErrorKind::Arity,
        format!("wrong number of args ({}) passed to {}", got, name),
    )
}

pub fn name_error(message: impl Into<String>) -> RuntimeError {
    RuntimeError::new(ErrorKind::Name, message)
}

pub fn index_error(message: impl Into<String>) -> RuntimeError {
    RuntimeError::new(ErrorKind::Index, message)
}

pub fn arithmetic_error(message: impl Into<String>) -> RuntimeError {
    RuntimeError::new(ErrorKind::Arithmetic, message)
}

pub fn value_error(message: impl Into<String>) -> RuntimeError {
    RuntimeError::new(ErrorKind::Value, message)
}

pub fn io_error(message: impl Into<String>) -> RuntimeError {
    RuntimeError::new(ErrorKind::Io, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_kinds_not_catchable() {
        assert!(!ErrorKind::StackOverflow.catchable());
        assert!(!ErrorKind::StackUnderflow.catchable());
        assert!(!ErrorKind::OutOfMemory.catchable());
        assert!(!ErrorKind::InvalidInstruction.catchable());
    }

    #[test]
    fn test_user_kinds_catchable() {
        assert!(ErrorKind::Type.catchable());
        assert!(ErrorKind::Arithmetic.catchable());
        assert!(ErrorKind::User.catchable());
    }

    #[test]
    fn test_thrown_keeps_value() {
        let err = RuntimeError::thrown(Value::Str("boom".into()));
        assert_eq!(err.kind, ErrorKind::User);
        assert_eq!(err.message, "boom");
        assert_eq!(err.data, Some(Value::Str("boom".into())));
    }

    #[test]
    fn test_display_includes_type_name() {
        let err = arithmetic_error("divide by zero");
        assert_eq!(err.to_string(), "ArithmeticError: divide by zero");
    }
}
