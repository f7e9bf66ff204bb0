//! Compiler-side error types
//!
//! Reader and analyzer failures are `SyntaxError`s carrying the source
//! position; code generation failures are `CodegenError`s (logic errors
//! plus the two overflow conditions). `CloveError` is the pipeline-level
//! sum the CLI reports.

use clove_core::error::RuntimeError;
use clove_runtime::SerializeError;
use std::fmt;

/// A reader or analyzer failure at a source position (1-indexed).
#[derive(Debug, Clone, PartialEq)]
pub struct SyntaxError {
    pub message: String,
    pub line: u32,
    pub col: u32,
}

impl SyntaxError {
    pub fn new(message: impl Into<String>, line: u32, col: u32) -> Self {
        SyntaxError {
            message: message.into(),
            line,
            col,
        }
    }
}

impl fmt::Display for SyntaxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "syntax error at line {}, column {}: {}",
            self.line, self.col, self.message
        )
    }
}

impl std::error::Error for SyntaxError {}

/// A code-generation failure.
#[derive(Debug)]
pub enum CodegenError {
    /// Invalid program shape reaching the emitter
    Logic {
        message: String,
        line: u32,
        col: u32,
    },
    /// More than 65536 constants in one chunk
    ConstantPoolOverflow { line: u32, col: u32 },
    /// A local slot index past the operand width
    LocalSlotOverflow { line: u32, col: u32 },
}

impl CodegenError {
    pub fn logic(message: impl Into<String>, line: u32, col: u32) -> Self {
        CodegenError::Logic {
            message: message.into(),
            line,
            col,
        }
    }
}

impl fmt::Display for CodegenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodegenError::Logic { message, line, col } => {
                write!(f, "compile error at line {}, column {}: {}", line, col, message)
            }
            CodegenError::ConstantPoolOverflow { line, col } => {
                write!(
                    f,
                    "compile error at line {}, column {}: constant pool overflow",
                    line, col
                )
            }
            CodegenError::LocalSlotOverflow { line, col } => {
                write!(
                    f,
                    "compile error at line {}, column {}: local slot overflow",
                    line, col
                )
            }
        }
    }
}

impl std::error::Error for CodegenError {}

/// Pipeline-level error: everything `eval` can fail with.
#[derive(Debug)]
pub enum CloveError {
    Syntax(SyntaxError),
    Codegen(CodegenError),
    Runtime(RuntimeError),
    Serialize(SerializeError),
    Io(std::io::Error),
}

impl fmt::Display for CloveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloveError::Syntax(e) => write!(f, "{}", e),
            CloveError::Codegen(e) => write!(f, "{}", e),
            CloveError::Runtime(e) => write!(f, "{}", e),
            CloveError::Serialize(e) => write!(f, "{}", e),
            CloveError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CloveError {}

impl From<SyntaxError> for CloveError {
    fn from(e: SyntaxError) -> Self {
        CloveError::Syntax(e)
    }
}

impl From<CodegenError> for CloveError {
    fn from(e: CodegenError) -> Self {
        CloveError::Codegen(e)
    }
}

impl From<RuntimeError> for CloveError {
    fn from(e: RuntimeError) -> Self {
        CloveError::Runtime(e)
    }
}

impl From<SerializeError> for CloveError {
    fn from(e: SerializeError) -> Self {
        CloveError::Serialize(e)
    }
}

impl From<std::io::Error> for CloveError {
    fn from(e: std::io::Error) -> Self {
        CloveError::Io(e)
    }
}
