use std::collections::HashSet;

use thiserror::Error;

use crate::bytecode::ir::Bytecode;
use crate::bytecode::op::{DecodeError, Instructions, Opcode};
use crate::lang::value::Value;
use crate::runtime::builtins::Builtin;

/// Bytecode that must not be executed.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VerifyError {
    #[error("{location}: {source}")]
    Decode {
        location: String,
        source: DecodeError,
    },

    #[error("{location}: {opcode} at {offset} references constant {index}, pool has {len}")]
    ConstantOutOfRange {
        location: String,
        offset: usize,
        opcode: Opcode,
        index: usize,
        len: usize,
    },

    #[error("{location}: GETCLOSURE at {offset} references constant {index}, which is a {found}")]
    NotAFunction {
        location: String,
        offset: usize,
        index: usize,
        found: &'static str,
    },

    #[error("{location}: LOAD_BUILTIN at {offset} references unknown builtin {index}")]
    UnknownBuiltin {
        location: String,
        offset: usize,
        index: usize,
    },

    #[error("{location}: {opcode} at {offset} jumps to {target}, which is not an instruction boundary")]
    BadJumpTarget {
        location: String,
        offset: usize,
        opcode: Opcode,
        target: usize,
    },

    #[error("{location}: HASH at {offset} has odd operand {count}")]
    OddHashCount {
        location: String,
        offset: usize,
        count: usize,
    },

    #[error("{location}: stack underflow at {offset}, {opcode} needs {needed} values")]
    StackUnderflow {
        location: String,
        offset: usize,
        opcode: Opcode,
        needed: usize,
    },
}

/// Returns (pops, pushes) for an instruction.
fn effect(op: Opcode, operands: &[usize]) -> (usize, usize) {
    use Opcode::*;
    match op {
        Const | True | False | Null => (0, 1),
        GetGlobal | GetLocal | LoadBuiltin | GetFree | CurrentClosure => (0, 1),
        Pop => (1, 0),

        Add | Sub | Mul | Div | Gt | Eq | NotEq => (2, 1),
        Bang | Minus => (1, 1),

        Jump => (0, 0),
        JumpIfNotTrue => (1, 0),

        SetGlobal | SetLocal => (1, 0),

        // ( free... -- closure )
        GetClosure => (operands[1], 1),

        Array | Hash => (operands[0], 1),
        Index => (2, 1),

        // ( callee args... -- result )
        Call => (operands[0] + 1, 1),
        Return => (1, 0),
        ReturnNull => (0, 0),
    }
}

/// Check the main stream and every compiled function in the pool.
pub fn verify(bytecode: &Bytecode) -> Result<(), VerifyError> {
    verify_program(&bytecode.instructions, &bytecode.constants)
}

pub fn verify_program(main: &Instructions, constants: &[Value]) -> Result<(), VerifyError> {
    verify_stream("main", main, constants)?;

    for (index, constant) in constants.iter().enumerate() {
        if let Value::CompiledFunction(function) = constant {
            let location = format!("constant[{}]", index);
            verify_stream(&location, &function.instructions, constants)?;
        }
    }

    Ok(())
}

/// Decode a single stream and check its operands against `constants`.
///
/// The stack-height check is a linear scan that doesn't follow jumps. Both
/// arms of a compiled `if` are counted, which only overestimates the height,
/// so well-formed compiler output never trips it.
pub fn verify_stream(
    location: &str,
    instructions: &Instructions,
    constants: &[Value],
) -> Result<(), VerifyError> {
    let mut decoded = Vec::new();
    for item in instructions.iter() {
        let (offset, op, operands) = item.map_err(|source| VerifyError::Decode {
            location: location.to_string(),
            source,
        })?;
        decoded.push((offset, op, operands));
    }

    let mut boundaries: HashSet<usize> = decoded.iter().map(|(offset, _, _)| *offset).collect();
    boundaries.insert(instructions.len());

    let mut height: usize = 0;

    for (offset, op, operands) in &decoded {
        let (offset, op) = (*offset, *op);

        match op {
            Opcode::Const | Opcode::GetClosure => {
                let index = operands[0];
                let Some(constant) = constants.get(index) else {
                    return Err(VerifyError::ConstantOutOfRange {
                        location: location.to_string(),
                        offset,
                        opcode: op,
                        index,
                        len: constants.len(),
                    });
                };
                if op == Opcode::GetClosure && !matches!(constant, Value::CompiledFunction(_)) {
                    return Err(VerifyError::NotAFunction {
                        location: location.to_string(),
                        offset,
                        index,
                        found: constant.type_name(),
                    });
                }
            }

            Opcode::LoadBuiltin => {
                if Builtin::from_index(operands[0]).is_none() {
                    return Err(VerifyError::UnknownBuiltin {
                        location: location.to_string(),
                        offset,
                        index: operands[0],
                    });
                }
            }

            Opcode::Jump | Opcode::JumpIfNotTrue => {
                let target = operands[0];
                if !boundaries.contains(&target) {
                    return Err(VerifyError::BadJumpTarget {
                        location: location.to_string(),
                        offset,
                        opcode: op,
                        target,
                    });
                }
            }

            Opcode::Hash if operands[0] % 2 != 0 => {
                return Err(VerifyError::OddHashCount {
                    location: location.to_string(),
                    offset,
                    count: operands[0],
                });
            }

            _ => {}
        }

        let (pops, pushes) = effect(op, operands);
        height = height
            .checked_sub(pops)
            .ok_or_else(|| VerifyError::StackUnderflow {
                location: location.to_string(),
                offset,
                opcode: op,
                needed: pops,
            })?;
        height += pushes;
    }

    Ok(())
}
