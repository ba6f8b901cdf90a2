use serde::{Deserialize, Serialize};

use crate::bytecode::op::Instructions;
use crate::lang::value::Value;

/// A compiled top-level unit: the main instruction stream plus the constant
/// pool it (and every function in it) indexes into.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Bytecode {
    pub instructions: Instructions,
    pub constants: Vec<Value>,
}

impl Bytecode {
    pub fn new(instructions: Instructions, constants: Vec<Value>) -> Self {
        Self {
            instructions,
            constants,
        }
    }

    /// Encode as a compact binary blob.
    pub fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Decode a blob produced by [`Bytecode::to_bytes`].
    ///
    /// The result is not trusted; run it through the verifier before
    /// executing it.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}
