use core::fmt;

use crate::op::Op;

/// One fixed-shape bytecode unit: an opcode and its integer operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Instruction {
    pub op: Op,
    pub operand: i32,
}

impl Instruction {
    pub const fn new(op: Op, operand: i32) -> Self {
        Self { op, operand }
    }

    /// An instruction whose operand is unused.
    pub const fn bare(op: Op) -> Self {
        Self { op, operand: 0 }
    }

    /// The operand as a table or instruction index.
    ///
    /// Returns `None` for negative operands, which never name a valid entry.
    pub fn index(self) -> Option<usize> {
        usize::try_from(self.operand).ok()
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.op.mnemonic();
        if !self.op.has_operand() {
            return write!(f, "{name}");
        }
        match self.op {
            Op::Br | Op::Brtrue | Op::Brfalse => {
                write!(f, "{name} @{}", self.operand)
            }
            Op::Ldtype => write!(f, "{name} {}", self.operand),
            _ => write!(f, "{name} #{}", self.operand),
        }
    }
}
