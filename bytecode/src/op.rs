/// Bytecode opcodes.
///
/// Every instruction carries one `i32` operand. Most opcodes interpret it as
/// an index into one of the module's metadata tables; branches interpret it
/// as an instruction index. Opcodes that take no operand ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Op {
    /// Does nothing.
    Nop = 0x00,

    /// Pops right then left, pushes `left + right`.
    Add,
    /// Pops right then left, pushes `left - right`.
    Sub,
    /// Pops right then left, pushes `left * right`.
    Mul,
    /// Pops right then left, pushes `left / right`.
    Div,
    /// Pops right then left, pushes `left % right`.
    Mod,
    /// Pops right then left, pushes the concatenation of both as a string.
    Cnct,
    /// Bitwise or (logical for booleans).
    Or,
    /// Bitwise and (logical for booleans).
    And,
    /// Bitwise xor (logical for booleans).
    Xor,
    /// Shift left by the right operand.
    Shl,
    /// Shift right by the right operand.
    Shr,
    /// Pops one value and pushes its negation.
    Neg,

    /// Push a constant.
    /// Operand: constant index.
    Ldc,
    /// Pops an array, pushes its length as `int`.
    Ldlen,
    /// Push a string constant.
    /// Operand: constant index whose pool offset is a string table index.
    Ldstr,
    /// Push the default value of a type.
    /// Operand: type definition index.
    Lddft,

    /// Operand: local index.
    Ldloc,
    /// Operand: local index.
    Stloc,
    /// Operand: parameter index.
    Ldarg,
    /// Operand: parameter index.
    Starg,
    /// Pops an instance, pushes the field.
    /// Operand: member reference index.
    Ldfld,
    /// Pops an instance then a value, stores the value into the field.
    /// Operand: member reference index.
    Stfld,
    /// Operand: member reference index.
    Ldsfld,
    /// Operand: member reference index.
    Stsfld,
    /// Push the bound instance.
    Ldthis,

    /// Pops an array then an index, pushes the element.
    Ldelem,
    /// Pops an array, an index, then a value, stores the element.
    Stelem,
    /// Pops a type token then an instance, pushes a pointer to the field.
    /// Operand: member reference index.
    Ldflda,
    /// Pops a type token, pushes a pointer to the static field.
    /// Operand: member reference index.
    Ldsflda,
    /// Pops a type token, pushes a pointer to the local.
    /// Operand: local index.
    Ldloca,
    /// Pops a type token, pushes a pointer to the argument.
    /// Operand: parameter index.
    Ldarga,
    /// Pops an array, an index, then a type token, pushes a pointer to the
    /// element.
    Ldelema,
    /// Pops a pointer, pushes a copy of the pointee.
    /// Operand: type definition index.
    Ldind,
    /// Pops a pointer then a value, copies the value into the pointee.
    /// Operand: type definition index.
    Stind,
    /// Push a type token (`int`) and remember it for address-taking opcodes.
    /// Operand: type definition index.
    Ldtype,

    /// Pops a value, pushes it converted to a type.
    /// Operand: type definition index.
    Conv,
    /// Pops a length, pushes a new array.
    /// Operand: element-carrying array type definition index.
    Newarr,
    /// Constructs an object.
    /// Operand: type reference index.
    Newobj,
    /// Invokes a method.
    /// Operand: member reference index.
    Call,
    /// Halt the current invocation.
    Ret,

    /// Pops a bool, jumps when true.
    /// Operand: instruction index.
    Brtrue,
    /// Pops a bool, jumps when false.
    /// Operand: instruction index.
    Brfalse,
    /// Unconditional jump.
    /// Operand: instruction index.
    Br,

    /// Pops right then left, pushes `left == right`.
    Ceq,
    /// Pops right then left, pushes `left != right`.
    Cne,
    /// Pops right then left, pushes `left > right`.
    Cgt,
    /// Pops right then left, pushes `left >= right`.
    Cge,
    /// Pops right then left, pushes `left < right`.
    Clt,
    /// Pops right then left, pushes `left <= right`.
    Cle,
}

impl Op {
    pub const COUNT: usize = Op::Cle as usize + 1;

    /// Mnemonic used by the disassembler.
    pub const fn mnemonic(self) -> &'static str {
        match self {
            Op::Nop => "nop",
            Op::Add => "add",
            Op::Sub => "sub",
            Op::Mul => "mul",
            Op::Div => "div",
            Op::Mod => "mod",
            Op::Cnct => "cnct",
            Op::Or => "or",
            Op::And => "and",
            Op::Xor => "xor",
            Op::Shl => "shl",
            Op::Shr => "shr",
            Op::Neg => "neg",
            Op::Ldc => "ldc",
            Op::Ldlen => "ldlen",
            Op::Ldstr => "ldstr",
            Op::Lddft => "lddft",
            Op::Ldloc => "ldloc",
            Op::Stloc => "stloc",
            Op::Ldarg => "ldarg",
            Op::Starg => "starg",
            Op::Ldfld => "ldfld",
            Op::Stfld => "stfld",
            Op::Ldsfld => "ldsfld",
            Op::Stsfld => "stsfld",
            Op::Ldthis => "ldthis",
            Op::Ldelem => "ldelem",
            Op::Stelem => "stelem",
            Op::Ldflda => "ldflda",
            Op::Ldsflda => "ldsflda",
            Op::Ldloca => "ldloca",
            Op::Ldarga => "ldarga",
            Op::Ldelema => "ldelema",
            Op::Ldind => "ldind",
            Op::Stind => "stind",
            Op::Ldtype => "ldtype",
            Op::Conv => "conv",
            Op::Newarr => "newarr",
            Op::Newobj => "newobj",
            Op::Call => "call",
            Op::Ret => "ret",
            Op::Brtrue => "brtrue",
            Op::Brfalse => "brfalse",
            Op::Br => "br",
            Op::Ceq => "ceq",
            Op::Cne => "cne",
            Op::Cgt => "cgt",
            Op::Cge => "cge",
            Op::Clt => "clt",
            Op::Cle => "cle",
        }
    }

    /// Whether the operand is meaningful for this opcode.
    pub const fn has_operand(self) -> bool {
        !matches!(
            self,
            Op::Nop
                | Op::Add
                | Op::Sub
                | Op::Mul
                | Op::Div
                | Op::Mod
                | Op::Cnct
                | Op::Or
                | Op::And
                | Op::Xor
                | Op::Shl
                | Op::Shr
                | Op::Neg
                | Op::Ldlen
                | Op::Ldthis
                | Op::Ldelem
                | Op::Stelem
                | Op::Ldelema
                | Op::Ret
                | Op::Ceq
                | Op::Cne
                | Op::Cgt
                | Op::Cge
                | Op::Clt
                | Op::Cle
        )
    }

    pub const fn is_branch(self) -> bool {
        matches!(self, Op::Br | Op::Brtrue | Op::Brfalse)
    }

    /// Binary operators that pop two operands and push the left operand's
    /// type.
    pub const fn is_binary_arithmetic(self) -> bool {
        matches!(
            self,
            Op::Add
                | Op::Sub
                | Op::Mul
                | Op::Div
                | Op::Mod
                | Op::Cnct
                | Op::Or
                | Op::And
                | Op::Xor
                | Op::Shl
                | Op::Shr
        )
    }

    pub const fn is_comparison(self) -> bool {
        matches!(
            self,
            Op::Ceq | Op::Cne | Op::Cgt | Op::Cge | Op::Clt | Op::Cle
        )
    }
}

impl TryFrom<u8> for Op {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        if byte < Self::COUNT as u8 {
            // SAFETY: Op is repr(u8) with contiguous variants starting at 0.
            Ok(unsafe { core::mem::transmute::<u8, Op>(byte) })
        } else {
            Err(byte)
        }
    }
}
