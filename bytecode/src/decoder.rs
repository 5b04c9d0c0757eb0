use core::fmt;

use crate::instruction::Instruction;
use crate::op::Op;

/// Size of one encoded instruction: opcode byte plus a little-endian `i32`.
pub const INSTRUCTION_SIZE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    UnknownOpcode { offset: usize, byte: u8 },
    Truncated { offset: usize },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownOpcode { offset, byte } => {
                write!(f, "unknown opcode 0x{byte:02x} at offset {offset}")
            }
            Self::Truncated { offset } => {
                write!(f, "truncated instruction at offset {offset}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Encodes an instruction stream into its compact binary form.
pub fn encode(instructions: &[Instruction]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(instructions.len() * INSTRUCTION_SIZE);
    for instruction in instructions {
        buf.push(instruction.op as u8);
        buf.extend_from_slice(&instruction.operand.to_le_bytes());
    }
    buf
}

/// Decodes a byte slice into [`Instruction`]s.
///
/// Unlike the encoder the decoder never trusts its input: unknown opcodes
/// and trailing partial units are reported as [`DecodeError`]s.
pub struct BytecodeDecoder<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> BytecodeDecoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    /// Current byte offset in the stream.
    #[inline(always)]
    pub fn offset(&self) -> usize {
        self.pos
    }

    #[inline(always)]
    pub fn is_at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    /// Decode the next instruction, or `None` at end-of-stream.
    pub fn decode_next(&mut self) -> Option<Result<Instruction, DecodeError>> {
        if self.is_at_end() {
            return None;
        }
        let offset = self.pos;
        let Some(unit) = self.bytes.get(offset..offset + INSTRUCTION_SIZE)
        else {
            self.pos = self.bytes.len();
            return Some(Err(DecodeError::Truncated { offset }));
        };
        self.pos += INSTRUCTION_SIZE;

        let op = match Op::try_from(unit[0]) {
            Ok(op) => op,
            Err(byte) => {
                return Some(Err(DecodeError::UnknownOpcode { offset, byte }));
            }
        };
        let operand = i32::from_le_bytes([unit[1], unit[2], unit[3], unit[4]]);
        Some(Ok(Instruction::new(op, operand)))
    }

    /// Decode the whole stream, stopping at the first error.
    pub fn decode_all(self) -> Result<Vec<Instruction>, DecodeError> {
        self.collect()
    }
}

impl Iterator for BytecodeDecoder<'_> {
    type Item = Result<Instruction, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.decode_next()
    }
}
