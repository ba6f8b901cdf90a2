use thiserror::Error;

use crate::bytecode::op::DecodeError;
use crate::bytecode::verify::VerifyError;

/// Fatal errors that abort a VM run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    #[error("runtime error: type mismatch: {left} {op} {right}")]
    TypeMismatch {
        op: &'static str,
        left: &'static str,
        right: &'static str,
    },

    #[error("runtime error: unsupported operator {op} for {operand}")]
    UnsupportedOperator {
        op: &'static str,
        operand: &'static str,
    },

    #[error("runtime error: {0}")]
    Decode(#[from] DecodeError),

    #[error("runtime error: calling non-function {0}")]
    NotCallable(&'static str),

    #[error("runtime error: wrong number of arguments: want={want}, got={got}")]
    WrongArgumentCount { want: usize, got: usize },

    #[error("runtime error: division by zero")]
    DivisionByZero,

    #[error("runtime error: integer overflow in {0}")]
    IntegerOverflow(&'static str),

    #[error("runtime error: unusable as hash key: {0}")]
    UnhashableKey(&'static str),

    #[error("runtime error: index operator not supported: {collection}[{index}]")]
    IndexNotSupported {
        collection: &'static str,
        index: &'static str,
    },

    #[error("runtime error: free variable {0} is not captured by the running closure")]
    FreeOutOfRange(usize),

    #[error("runtime error: stack overflow (limit {0})")]
    StackOverflow(usize),

    #[error("runtime error: frame overflow (limit {0}), possible infinite recursion")]
    FrameOverflow(usize),

    #[error("runtime error: stack underflow")]
    StackUnderflow,

    /// The slot below a returning frame did not hold its callee.
    #[error("runtime error: frame misaligned on return at stack slot {0}")]
    FrameMisaligned(usize),

    #[error("runtime error: malformed bytecode: {0}")]
    MalformedBytecode(#[from] VerifyError),
}

impl RuntimeError {
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            RuntimeError::FrameOverflow(_) => Some("check that recursive functions have a base case"),
            RuntimeError::WrongArgumentCount { .. } => {
                Some("pass exactly as many arguments as the function declares parameters")
            }
            RuntimeError::UnhashableKey(_) => {
                Some("only integers, strings and booleans can be hash keys")
            }
            _ => None,
        }
    }
}
