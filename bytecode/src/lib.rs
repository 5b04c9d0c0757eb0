mod op;
mod instruction;
mod builder;
mod decoder;
mod module;

pub use op::Op;
pub use instruction::Instruction;
pub use builder::{BuildError, Label, MethodBuilder, ModuleBuilder};
pub use decoder::{encode, BytecodeDecoder, DecodeError, INSTRUCTION_SIZE};
pub use module::{
    Constant, ConstantKind, FieldDefinition, LocalDefinition, Member,
    MemberReference, MethodDefinition, Module, ParameterDefinition,
    PrimitiveKind, TypeDefKind, TypeDefinition, TypeReference,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_round_trip() {
        let body = vec![
            Instruction::new(Op::Ldc, 0),
            Instruction::new(Op::Ldc, 1),
            Instruction::bare(Op::Add),
            Instruction::new(Op::Brtrue, 70_000),
            Instruction::new(Op::Ldtype, -3),
            Instruction::bare(Op::Ret),
        ];
        let bytes = encode(&body);
        assert_eq!(bytes.len(), body.len() * INSTRUCTION_SIZE);
        assert_eq!(BytecodeDecoder::new(&bytes).decode_all(), Ok(body));
    }

    #[test]
    fn decoder_rejects_unknown_opcode() {
        let bytes = [0xFF, 0, 0, 0, 0];
        let err = BytecodeDecoder::new(&bytes).decode_all().unwrap_err();
        assert_eq!(err, DecodeError::UnknownOpcode { offset: 0, byte: 0xFF });
    }

    #[test]
    fn decoder_rejects_truncated_unit() {
        let mut bytes = encode(&[Instruction::bare(Op::Ret)]);
        bytes.extend_from_slice(&[Op::Ldc as u8, 1]);
        let mut decoder = BytecodeDecoder::new(&bytes);
        assert_eq!(decoder.next(), Some(Ok(Instruction::bare(Op::Ret))));
        assert_eq!(decoder.next(), Some(Err(DecodeError::Truncated { offset: 5 })));
        assert_eq!(decoder.next(), None);
    }

    #[test]
    fn every_opcode_byte_converts_back() {
        for byte in 0..Op::COUNT as u8 {
            let op = Op::try_from(byte).expect("valid opcode");
            assert_eq!(op as u8, byte);
        }
        assert_eq!(Op::try_from(Op::COUNT as u8), Err(Op::COUNT as u8));
    }
}
