//! Frame sizing ahead of execution.
//!
//! A method body is replayed once, front to back, over a stack of types
//! instead of values. Branches are not followed, so every push along the
//! textual order is counted exactly once.

use bytecode::{Instruction, Member, MethodDefinition, Op, PrimitiveKind};
use log::debug;
use object::{REF_SIZE, TypeId};

use crate::{Runtime, RuntimeError};

/// Evaluation requirements of one method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StackSize {
    /// Deepest the evaluation stack gets.
    pub max_stack: usize,
    /// Sum of the sizes of every value pushed over the whole body.
    pub max_stack_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Entry {
    Value(TypeId),
    Pointer(TypeId),
    Token(TypeId),
}

struct Resolver<'a> {
    rt: &'a Runtime,
    method: &'a MethodDefinition,
    stack: Vec<Entry>,
    size: StackSize,
}

impl<'a> Resolver<'a> {
    fn push(&mut self, entry: Entry) {
        let bytes = match entry {
            Entry::Value(ty) => self.rt.descriptor(ty).size,
            Entry::Pointer(_) => REF_SIZE,
            Entry::Token(_) => PrimitiveKind::I32.size(),
        };
        self.stack.push(entry);
        self.size.max_stack = self.size.max_stack.max(self.stack.len());
        self.size.max_stack_size += bytes;
    }

    fn pop(&mut self) -> Result<Entry, RuntimeError> {
        self.stack.pop().ok_or(RuntimeError::EvalStackUnderflow)
    }

    fn pop_n(&mut self, n: usize) -> Result<(), RuntimeError> {
        for _ in 0..n {
            self.pop()?;
        }
        Ok(())
    }

    fn pop_token(&mut self, op: Op) -> Result<(), RuntimeError> {
        match self.stack.pop() {
            Some(Entry::Token(_)) => Ok(()),
            _ => Err(RuntimeError::MissingTypeToken { op }),
        }
    }

    fn ty(&self, def_index: i32) -> Result<TypeId, RuntimeError> {
        let idx = u32::try_from(def_index)
            .map_err(|_| object::TypeError::UnknownType(def_index as u32))?;
        Ok(self.rt.types.get_type(idx)?)
    }

    fn element_of(&self, entry: Entry) -> Result<TypeId, RuntimeError> {
        let (Entry::Value(ty) | Entry::Pointer(ty) | Entry::Token(ty)) = entry;
        let desc = self.rt.descriptor(ty);
        if !desc.is_array() {
            return Err(RuntimeError::UnexpectedValue {
                expected: "array",
                got: "non-array",
            });
        }
        let element = desc
            .underlying
            .ok_or_else(|| object::TypeError::MissingUnderlyingType(desc.name.clone()))?;
        Ok(element)
    }

    fn local(&self, idx: i32) -> Result<TypeId, RuntimeError> {
        let def = usize::try_from(idx)
            .ok()
            .and_then(|i| self.method.locals.get(i))
            .ok_or(RuntimeError::UnknownLocal(idx))?;
        Ok(self.rt.types.get_type(def.ty)?)
    }

    fn argument(&self, idx: i32) -> Result<TypeId, RuntimeError> {
        let def = usize::try_from(idx)
            .ok()
            .and_then(|i| self.method.parameters.get(i))
            .ok_or(RuntimeError::UnknownArgument(idx))?;
        Ok(self.rt.types.get_type(def.ty)?)
    }

    fn field(&self, member: i32, is_static: bool) -> Result<TypeId, RuntimeError> {
        Ok(self.rt.resolve_field(member, is_static)?.1.ty)
    }

    fn step(&mut self, insn: Instruction) -> Result<(), RuntimeError> {
        let rt = self.rt;
        let builtins = rt.types.builtins();
        let operand = insn.operand;
        match insn.op {
            Op::Nop | Op::Ret | Op::Br => {}

            op if op.is_binary_arithmetic() => {
                self.pop()?;
                let left = self.pop()?;
                let result = if op == Op::Cnct {
                    Entry::Value(builtins.string)
                } else {
                    left
                };
                self.push(result);
            }
            op if op.is_comparison() => {
                self.pop_n(2)?;
                self.push(Entry::Value(builtins.bool()));
            }
            Op::Neg => {
                let value = self.pop()?;
                self.push(value);
            }

            Op::Ldc | Op::Ldstr => {
                let ty = rt.constant_type(operand)?;
                self.push(Entry::Value(ty));
            }
            Op::Ldlen => {
                self.pop()?;
                self.push(Entry::Value(builtins.int()));
            }
            Op::Lddft => {
                let ty = self.ty(operand)?;
                self.push(Entry::Value(ty));
            }

            Op::Ldloc => {
                let ty = self.local(operand)?;
                self.push(Entry::Value(ty));
            }
            Op::Ldarg => {
                let ty = self.argument(operand)?;
                self.push(Entry::Value(ty));
            }
            Op::Stloc | Op::Starg | Op::Stsfld | Op::Brtrue | Op::Brfalse => {
                self.pop()?;
            }
            Op::Ldfld => {
                self.pop()?;
                let ty = self.field(operand, false)?;
                self.push(Entry::Value(ty));
            }
            Op::Stfld | Op::Stind => self.pop_n(2)?,
            Op::Ldsfld => {
                let ty = self.field(operand, true)?;
                self.push(Entry::Value(ty));
            }
            Op::Ldthis => {
                let owner = rt.types.get_type(self.method.owner)?;
                self.push(Entry::Value(owner));
            }

            Op::Ldelem => {
                let array = self.pop()?;
                self.pop()?;
                let element = self.element_of(array)?;
                self.push(Entry::Value(element));
            }
            Op::Stelem => self.pop_n(3)?,
            Op::Ldflda => {
                self.pop_token(insn.op)?;
                self.pop()?;
                let ty = self.field(operand, false)?;
                self.push(Entry::Pointer(ty));
            }
            Op::Ldsflda => {
                self.pop_token(insn.op)?;
                let ty = self.field(operand, true)?;
                self.push(Entry::Pointer(ty));
            }
            Op::Ldloca => {
                self.pop_token(insn.op)?;
                let ty = self.local(operand)?;
                self.push(Entry::Pointer(ty));
            }
            Op::Ldarga => {
                self.pop_token(insn.op)?;
                let ty = self.argument(operand)?;
                self.push(Entry::Pointer(ty));
            }
            Op::Ldelema => {
                let array = self.pop()?;
                self.pop()?;
                self.pop_token(insn.op)?;
                let element = self.element_of(array)?;
                self.push(Entry::Pointer(element));
            }
            Op::Ldind | Op::Conv | Op::Newarr => {
                self.pop()?;
                let ty = self.ty(operand)?;
                self.push(Entry::Value(ty));
            }
            Op::Ldtype => {
                let ty = self.ty(operand)?;
                self.push(Entry::Token(ty));
            }

            Op::Newobj => {
                let (ty, ctor) = rt.constructor(operand)?;
                let arity = rt.method_def(ctor)?.parameters.len();
                self.pop_n(arity)?;
                self.push(Entry::Value(ty));
            }
            Op::Call => {
                let callee = rt.method_def(rt.resolve_method(operand)?)?;
                let receiver = usize::from(!callee.is_static);
                self.pop_n(callee.parameters.len() + receiver)?;
                let ret = rt.types.get_type(callee.return_type)?;
                if !rt.descriptor(ret).is_void() {
                    self.push(Entry::Value(ret));
                }
            }

            op => {
                return Err(RuntimeError::UnsupportedOperation {
                    op: op.mnemonic(),
                    operand: "stack resolution".to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Replays `method`'s body over types and reports how deep and how large
/// its evaluation stack can get.
pub fn resolve_stack_size(rt: &Runtime, method: u32) -> Result<StackSize, RuntimeError> {
    let def = rt.method_def(method)?;
    let mut resolver = Resolver {
        rt,
        method: def,
        stack: Vec::new(),
        size: StackSize::default(),
    };
    for insn in &def.body {
        resolver.step(*insn)?;
    }
    debug!(
        "resolved '{}': depth {}, {} bytes",
        def.name, resolver.size.max_stack, resolver.size.max_stack_size
    );
    Ok(resolver.size)
}

/// Scratch bytes the natives called from `method` may request.
pub fn native_reserve(rt: &Runtime, method: u32) -> Result<usize, RuntimeError> {
    let def = rt.method_def(method)?;
    let mut reserve = 0;
    for insn in def.body.iter().filter(|i| i.op == Op::Call) {
        let callee = rt.method_def(rt.resolve_method(insn.operand)?)?;
        if callee.is_native
            && let Some(native) = rt.natives.lookup(rt.type_name(callee.owner)?, &callee.name)
        {
            reserve += native.scratch_reserve;
        }
    }
    Ok(reserve)
}

impl Runtime {
    pub fn method_def(&self, method: u32) -> Result<&MethodDefinition, RuntimeError> {
        self.module
            .method(method as usize)
            .ok_or(RuntimeError::UnknownMethod(method))
    }

    /// Method index named by a member reference.
    pub fn resolve_method(&self, member: i32) -> Result<u32, RuntimeError> {
        let reference = usize::try_from(member)
            .ok()
            .and_then(|i| self.module.member_ref(i))
            .ok_or(RuntimeError::UnknownMemberRef(member))?;
        match reference.member {
            Member::Method(method) => Ok(method),
            Member::Field(_) => Err(RuntimeError::NotAMethod(member)),
        }
    }

    /// Constructed type and constructor method of a type reference.
    pub fn constructor(&self, type_ref: i32) -> Result<(TypeId, u32), RuntimeError> {
        let reference = usize::try_from(type_ref)
            .ok()
            .and_then(|i| self.module.type_ref(i))
            .ok_or(RuntimeError::UnknownTypeRef(type_ref))?;
        let ty = self.types.get_type(reference.ty)?;
        let ctor = self.resolve_method(reference.constructor as i32)?;
        Ok((ty, ctor))
    }

    /// Type a constant loads as.
    pub fn constant_type(&self, idx: i32) -> Result<TypeId, RuntimeError> {
        let constant = usize::try_from(idx)
            .ok()
            .and_then(|i| self.module.constant(i))
            .ok_or(RuntimeError::UnknownConstant(idx))?;
        Ok(match constant.kind {
            bytecode::ConstantKind::Primitive(kind) => self.types.builtins().primitive(kind),
            bytecode::ConstantKind::String => self.types.builtins().string,
        })
    }

    pub fn type_name(&self, def_index: u32) -> Result<&str, RuntimeError> {
        Ok(&self.types.lookup(def_index)?.name)
    }
}
