use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// OPCODE - one-byte instruction tags
// =============================================================================

/// Every instruction is one opcode byte followed by zero or more big-endian
/// operands. Operand widths depend only on the opcode.
///
/// The byte value of each opcode is its position in this enum and is part of
/// the serialized bytecode format.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    // constants & stack
    /// u16 constant index
    Const,
    Pop,
    True,
    False,
    Null,

    // arithmetic & comparison ( left right -- result )
    Add,
    Sub,
    Mul,
    Div,
    Gt,
    Eq,
    NotEq,

    // unary ( x -- result )
    Bang,
    Minus,

    // control flow
    /// u16 absolute target
    Jump,
    /// u16 absolute target; pops the condition
    JumpIfNotTrue,

    // bindings
    /// u16 global slot
    SetGlobal,
    /// u16 global slot
    GetGlobal,
    /// u16 local slot, relative to the frame's base pointer
    SetLocal,
    /// u16 local slot, relative to the frame's base pointer
    GetLocal,
    /// u8 builtin index
    LoadBuiltin,
    /// u8 index into the running closure's captured values
    GetFree,
    /// u16 constant index of a compiled function, u8 number of captured
    /// values to pop; pushes a closure
    GetClosure,
    /// pushes the closure currently executing
    CurrentClosure,

    // aggregates
    /// u16 element count
    Array,
    /// u16 count of keys plus values (twice the pair count)
    Hash,
    /// ( collection index -- value )
    Index,

    // calls
    /// u8 argument count
    Call,
    Return,
    ReturnNull,
}

/// Static layout of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Definition {
    pub name: &'static str,
    pub operand_widths: &'static [usize],
}

impl Opcode {
    pub const ALL: [Opcode; 30] = [
        Opcode::Const,
        Opcode::Pop,
        Opcode::True,
        Opcode::False,
        Opcode::Null,
        Opcode::Add,
        Opcode::Sub,
        Opcode::Mul,
        Opcode::Div,
        Opcode::Gt,
        Opcode::Eq,
        Opcode::NotEq,
        Opcode::Bang,
        Opcode::Minus,
        Opcode::Jump,
        Opcode::JumpIfNotTrue,
        Opcode::SetGlobal,
        Opcode::GetGlobal,
        Opcode::SetLocal,
        Opcode::GetLocal,
        Opcode::LoadBuiltin,
        Opcode::GetFree,
        Opcode::GetClosure,
        Opcode::CurrentClosure,
        Opcode::Array,
        Opcode::Hash,
        Opcode::Index,
        Opcode::Call,
        Opcode::Return,
        Opcode::ReturnNull,
    ];

    pub fn definition(self) -> Definition {
        use Opcode::*;
        let (name, operand_widths): (&'static str, &'static [usize]) = match self {
            Const => ("CONST", &[2]),
            Pop => ("POP", &[]),
            True => ("TRUE", &[]),
            False => ("FALSE", &[]),
            Null => ("NULL", &[]),
            Add => ("ADD", &[]),
            Sub => ("SUB", &[]),
            Mul => ("MUL", &[]),
            Div => ("DIV", &[]),
            Gt => ("GT", &[]),
            Eq => ("EQ", &[]),
            NotEq => ("NOTEQ", &[]),
            Bang => ("BANG", &[]),
            Minus => ("MINUS", &[]),
            Jump => ("JUMP", &[2]),
            JumpIfNotTrue => ("JUMP_IF_NOT_TRUE", &[2]),
            SetGlobal => ("SETGLOBAL", &[2]),
            GetGlobal => ("GETGLOBAL", &[2]),
            SetLocal => ("SETLOCAL", &[2]),
            GetLocal => ("GETLOCAL", &[2]),
            LoadBuiltin => ("LOAD_BUILTIN", &[1]),
            GetFree => ("GETFREE", &[1]),
            GetClosure => ("GETCLOSURE", &[2, 1]),
            CurrentClosure => ("CURRENT_CLOSURE", &[]),
            Array => ("ARRAY", &[2]),
            Hash => ("HASH", &[2]),
            Index => ("INDEX", &[]),
            Call => ("CALL", &[1]),
            Return => ("RETURN", &[]),
            ReturnNull => ("RETURN_NULL", &[]),
        };
        Definition {
            name,
            operand_widths,
        }
    }

    /// Total encoded length, opcode byte included.
    pub fn instruction_len(self) -> usize {
        1 + self.definition().operand_widths.iter().sum::<usize>()
    }

    pub fn name(self) -> &'static str {
        self.definition().name
    }
}

impl TryFrom<u8> for Opcode {
    type Error = DecodeError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        Opcode::ALL
            .get(byte as usize)
            .copied()
            .ok_or(DecodeError::UnknownOpcode(byte))
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown opcode 0x{0:02x}")]
    UnknownOpcode(u8),

    #[error("truncated {opcode} instruction at offset {offset}")]
    Truncated { opcode: Opcode, offset: usize },

    #[error("offset {offset} is past the end of a {len}-byte stream")]
    OutOfBounds { offset: usize, len: usize },
}

// =============================================================================
// ENCODE / DECODE
// =============================================================================

/// Encode one instruction.
///
/// Operands are truncated to their declared width; callers check ranges
/// before encoding.
pub fn make(op: Opcode, operands: &[usize]) -> Vec<u8> {
    let def = op.definition();
    debug_assert_eq!(
        operands.len(),
        def.operand_widths.len(),
        "wrong operand count for {}",
        def.name
    );

    let mut bytes = Vec::with_capacity(op.instruction_len());
    bytes.push(op as u8);

    for (operand, width) in operands.iter().zip(def.operand_widths) {
        match width {
            2 => bytes.extend_from_slice(&(*operand as u16).to_be_bytes()),
            1 => bytes.push(*operand as u8),
            _ => {}
        }
    }

    bytes
}

pub fn read_u16(bytes: &[u8], offset: usize) -> usize {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]]) as usize
}

pub fn read_u8(bytes: &[u8], offset: usize) -> usize {
    bytes[offset] as usize
}

/// Decode the instruction starting at `offset`.
///
/// Returns the opcode, its operands and the number of bytes consumed.
pub fn decode(bytes: &[u8], offset: usize) -> Result<(Opcode, Vec<usize>, usize), DecodeError> {
    let byte = *bytes.get(offset).ok_or(DecodeError::OutOfBounds {
        offset,
        len: bytes.len(),
    })?;
    let op = Opcode::try_from(byte)?;
    let len = op.instruction_len();

    if offset + len > bytes.len() {
        return Err(DecodeError::Truncated { opcode: op, offset });
    }

    let mut operands = Vec::with_capacity(op.definition().operand_widths.len());
    let mut cursor = offset + 1;
    for width in op.definition().operand_widths {
        match width {
            2 => operands.push(read_u16(bytes, cursor)),
            1 => operands.push(read_u8(bytes, cursor)),
            _ => {}
        }
        cursor += width;
    }

    Ok((op, operands, len))
}

// =============================================================================
// INSTRUCTIONS - an encoded instruction stream
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instructions(Vec<u8>);

impl Instructions {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Append encoded bytes, returning the offset they start at.
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        let pos = self.0.len();
        self.0.extend_from_slice(bytes);
        pos
    }

    /// Overwrite bytes in place, used for backpatching.
    pub fn replace(&mut self, pos: usize, bytes: &[u8]) {
        self.0[pos..pos + bytes.len()].copy_from_slice(bytes);
    }

    pub fn truncate(&mut self, len: usize) {
        self.0.truncate(len);
    }

    /// Iterate decoded instructions as `(offset, opcode, operands)`.
    pub fn iter(&self) -> InstructionIter<'_> {
        InstructionIter {
            bytes: &self.0,
            offset: 0,
        }
    }
}

impl From<Vec<u8>> for Instructions {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl FromIterator<Vec<u8>> for Instructions {
    fn from_iter<I: IntoIterator<Item = Vec<u8>>>(iter: I) -> Self {
        Self(iter.into_iter().flatten().collect())
    }
}

pub struct InstructionIter<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl Iterator for InstructionIter<'_> {
    type Item = Result<(usize, Opcode, Vec<usize>), DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.bytes.len() {
            return None;
        }

        let offset = self.offset;
        match decode(self.bytes, offset) {
            Ok((op, operands, len)) => {
                self.offset += len;
                Some(Ok((offset, op, operands)))
            }
            Err(e) => {
                // stop after the first undecodable instruction
                self.offset = self.bytes.len();
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_make() {
        assert_eq!(make(Opcode::Const, &[65534]), vec![Opcode::Const as u8, 255, 254]);
        assert_eq!(make(Opcode::Add, &[]), vec![Opcode::Add as u8]);
        assert_eq!(make(Opcode::Call, &[3]), vec![Opcode::Call as u8, 3]);
        assert_eq!(
            make(Opcode::GetClosure, &[65534, 255]),
            vec![Opcode::GetClosure as u8, 255, 254, 255]
        );
    }

    #[test]
    fn test_decode_every_opcode() {
        for op in Opcode::ALL {
            let operands: Vec<usize> = op
                .definition()
                .operand_widths
                .iter()
                .map(|w| if *w == 2 { 0x1234 } else { 0x56 })
                .collect();
            let bytes = make(op, &operands);

            let (decoded, decoded_operands, len) = decode(&bytes, 0).unwrap();
            assert_eq!(decoded, op);
            assert_eq!(decoded_operands, operands, "{}", op);
            assert_eq!(len, op.instruction_len());
            assert_eq!(len, bytes.len());
        }
    }

    #[test]
    fn test_opcode_bytes_match_table() {
        for (i, op) in Opcode::ALL.iter().enumerate() {
            assert_eq!(*op as u8 as usize, i);
            assert_eq!(Opcode::try_from(i as u8), Ok(*op));
        }
    }

    #[test]
    fn test_unknown_opcode() {
        assert_eq!(Opcode::try_from(0xff), Err(DecodeError::UnknownOpcode(0xff)));
        assert_eq!(decode(&[0xfe], 0), Err(DecodeError::UnknownOpcode(0xfe)));
    }

    #[test]
    fn test_truncated_operand() {
        let bytes = vec![Opcode::Const as u8, 0];
        assert_eq!(
            decode(&bytes, 0),
            Err(DecodeError::Truncated {
                opcode: Opcode::Const,
                offset: 0
            })
        );
    }

    #[test]
    fn test_decode_past_end() {
        assert_eq!(
            decode(&[], 0),
            Err(DecodeError::OutOfBounds { offset: 0, len: 0 })
        );
        let bytes = make(Opcode::Pop, &[]);
        assert_eq!(
            decode(&bytes, 1),
            Err(DecodeError::OutOfBounds { offset: 1, len: 1 })
        );
    }

    #[test]
    fn test_iter_offsets() {
        let ins: Instructions = vec![
            make(Opcode::Const, &[1]),
            make(Opcode::Add, &[]),
            make(Opcode::Call, &[2]),
        ]
        .into_iter()
        .collect();

        let offsets: Vec<usize> = ins.iter().map(|r| r.unwrap().0).collect();
        assert_eq!(offsets, vec![0, 3, 4]);
    }

    #[test]
    fn test_replace_backpatches() {
        let mut ins = Instructions::new();
        let pos = ins.append(&make(Opcode::Jump, &[9999]));
        ins.replace(pos, &make(Opcode::Jump, &[7]));
        assert_eq!(ins.as_bytes(), &[Opcode::Jump as u8, 0, 7]);
    }
}
