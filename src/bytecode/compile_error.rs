use thiserror::Error;

use crate::bytecode::op::Opcode;

/// Errors that abort compilation of a top-level unit.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    #[error("compile error: identifier '{0}' not found")]
    UndefinedIdentifier(String),

    #[error("compile error: identifier '{0}' is already declared in this scope")]
    Redeclared(String),

    /// A local declared after the same name was read from an enclosing function.
    #[error("compile error: '{0}' was captured from an enclosing function before this declaration")]
    ShadowsCapture(String),

    #[error("compile error: cannot assign to a builtin function '{0}'")]
    AssignToBuiltin(String),

    /// An operand does not fit the width its opcode declares.
    #[error("compile error: {opcode} operand {operand} exceeds the maximum of {max}")]
    OperandOverflow {
        opcode: Opcode,
        operand: usize,
        max: usize,
    },

    /// Internal compiler error (shouldn't happen in normal use)
    #[error("compile error: internal error: {0}")]
    Internal(String),
}

impl CompileError {
    pub fn internal(msg: impl Into<String>) -> Self {
        CompileError::Internal(msg.into())
    }

    /// A short suggestion shown under the error by the CLI and REPL.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            CompileError::UndefinedIdentifier(_) => {
                Some("declare it with 'let' before use, or check the spelling")
            }
            CompileError::Redeclared(_) => Some("pick a different name for the new binding"),
            CompileError::ShadowsCapture(_) => {
                Some("declare the local before its first use, or rename it")
            }
            CompileError::AssignToBuiltin(_) => {
                Some("builtin names (len, first, last, rest, push, print) are reserved")
            }
            CompileError::OperandOverflow { opcode, .. } => match opcode {
                Opcode::Call | Opcode::GetClosure | Opcode::GetFree => {
                    Some("functions are limited to 255 arguments and 255 captured variables")
                }
                _ => Some("split the program into smaller units"),
            },
            CompileError::Internal(_) => None,
        }
    }
}
