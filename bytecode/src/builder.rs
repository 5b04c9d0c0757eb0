use std::collections::HashMap;
use std::fmt;

use crate::instruction::Instruction;
use crate::module::{
    Constant, ConstantKind, FieldDefinition, LocalDefinition, Member,
    MemberReference, MethodDefinition, Module, ParameterDefinition,
    PrimitiveKind, TypeDefKind, TypeDefinition, TypeReference,
};
use crate::op::Op;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    UnboundLabel { method: String, label: usize },
    UnknownField { owner: u32, name: String },
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnboundLabel { method, label } => {
                write!(f, "label L{label} in method '{method}' is unbound")
            }
            Self::UnknownField { owner, name } => {
                write!(f, "type #{owner} has no field '{name}'")
            }
        }
    }
}

impl std::error::Error for BuildError {}

/// A branch target whose instruction index may not be known yet.
///
/// Created by [`MethodBuilder::label`], bound with [`MethodBuilder::bind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

/// Builds one method body.
///
/// Branches to labels are patched with instruction indices when the method
/// is added to a [`ModuleBuilder`].
#[derive(Debug)]
pub struct MethodBuilder {
    def: MethodDefinition,
    labels: Vec<Option<usize>>,
    fixups: Vec<(usize, Label)>,
}

impl MethodBuilder {
    pub fn new(name: impl Into<String>, owner: u32, return_type: u32) -> Self {
        Self {
            def: MethodDefinition {
                name: name.into(),
                owner,
                return_type,
                is_static: false,
                is_native: false,
                is_constructor: false,
                parameters: Vec::new(),
                locals: Vec::new(),
                body: Vec::new(),
            },
            labels: Vec::new(),
            fixups: Vec::new(),
        }
    }

    pub fn set_static(mut self) -> Self {
        self.def.is_static = true;
        self
    }

    pub fn set_native(mut self) -> Self {
        self.def.is_native = true;
        self
    }

    pub fn set_constructor(mut self) -> Self {
        self.def.is_constructor = true;
        self
    }

    /// Declares a parameter and returns its index.
    pub fn param(&mut self, name: impl Into<String>, ty: u32) -> i32 {
        self.def.parameters.push(ParameterDefinition {
            name: name.into(),
            ty,
        });
        (self.def.parameters.len() - 1) as i32
    }

    /// Declares a local and returns its index.
    pub fn local(&mut self, name: impl Into<String>, ty: u32) -> i32 {
        self.def.locals.push(LocalDefinition {
            name: name.into(),
            ty,
        });
        (self.def.locals.len() - 1) as i32
    }

    /// Index the next emitted instruction will occupy.
    pub fn current_index(&self) -> usize {
        self.def.body.len()
    }

    pub fn emit(&mut self, op: Op, operand: i32) -> &mut Self {
        self.def.body.push(Instruction::new(op, operand));
        self
    }

    pub fn op(&mut self, op: Op) -> &mut Self {
        self.emit(op, 0)
    }

    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Binds `label` to the next emitted instruction.
    pub fn bind(&mut self, label: Label) {
        self.labels[label.0] = Some(self.def.body.len());
    }

    pub fn br(&mut self, label: Label) -> &mut Self {
        self.branch(Op::Br, label)
    }

    pub fn brtrue(&mut self, label: Label) -> &mut Self {
        self.branch(Op::Brtrue, label)
    }

    pub fn brfalse(&mut self, label: Label) -> &mut Self {
        self.branch(Op::Brfalse, label)
    }

    fn branch(&mut self, op: Op, label: Label) -> &mut Self {
        self.fixups.push((self.def.body.len(), label));
        self.emit(op, -1)
    }

    fn finish(mut self) -> Result<MethodDefinition, BuildError> {
        for (at, label) in self.fixups {
            let target = self.labels[label.0].ok_or_else(|| {
                BuildError::UnboundLabel {
                    method: self.def.name.clone(),
                    label: label.0,
                }
            })?;
            self.def.body[at].operand = target as i32;
        }
        Ok(self.def)
    }
}

/// Assembles a [`Module`] programmatically.
///
/// Builtin types are created on first use and memoized by name, so the same
/// `int` or `int[]` always yields the same type index.
#[derive(Debug, Default)]
pub struct ModuleBuilder {
    module: Module,
    types_by_name: HashMap<String, u32>,
    strings_by_value: HashMap<String, u32>,
}

impl ModuleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_type(&mut self, def: TypeDefinition) -> u32 {
        let idx = self.module.types.len() as u32;
        self.types_by_name.insert(def.name.clone(), idx);
        self.module.types.push(def);
        idx
    }

    fn named_type(
        &mut self,
        name: &str,
        make: impl FnOnce() -> TypeDefinition,
    ) -> u32 {
        if let Some(&idx) = self.types_by_name.get(name) {
            return idx;
        }
        self.add_type(make())
    }

    pub fn void(&mut self) -> u32 {
        self.named_type("void", || TypeDefinition::new("void", TypeDefKind::Void))
    }

    pub fn string(&mut self) -> u32 {
        self.named_type("string", || {
            TypeDefinition::new("string", TypeDefKind::String)
        })
    }

    pub fn primitive(&mut self, kind: PrimitiveKind) -> u32 {
        self.named_type(kind.name(), || {
            TypeDefinition::new(kind.name(), TypeDefKind::Primitive(kind))
        })
    }

    pub fn int(&mut self) -> u32 {
        self.primitive(PrimitiveKind::I32)
    }

    pub fn bool(&mut self) -> u32 {
        self.primitive(PrimitiveKind::Bool)
    }

    pub fn array_of(&mut self, element: u32) -> u32 {
        let name = format!("{}[]", self.module.types[element as usize].name);
        self.named_type(&name.clone(), || TypeDefinition {
            underlying: Some(element),
            ..TypeDefinition::new(name, TypeDefKind::Array)
        })
    }

    pub fn pointer_to(&mut self, pointee: u32) -> u32 {
        let name = format!("{}*", self.module.types[pointee as usize].name);
        self.named_type(&name.clone(), || TypeDefinition {
            underlying: Some(pointee),
            ..TypeDefinition::new(name, TypeDefKind::Pointer)
        })
    }

    /// Declares an empty struct or class; fields are added afterwards so
    /// types may refer to each other.
    pub fn composite(&mut self, name: &str, kind: TypeDefKind) -> u32 {
        self.add_type(TypeDefinition::new(name, kind))
    }

    /// A static holder type for free functions and globals.
    pub fn static_class(&mut self, name: &str) -> u32 {
        self.add_type(TypeDefinition {
            is_static: true,
            ..TypeDefinition::new(name, TypeDefKind::Class)
        })
    }

    /// Adds a field and returns a member reference to it.
    pub fn field(
        &mut self,
        owner: u32,
        name: &str,
        ty: u32,
        is_static: bool,
    ) -> i32 {
        let fields = &mut self.module.types[owner as usize].fields;
        fields.push(FieldDefinition {
            name: name.to_string(),
            ty,
            is_static,
        });
        let field = (fields.len() - 1) as u32;
        self.member_ref(owner, Member::Field(field))
    }

    /// Member reference to an existing field, looked up by name.
    pub fn field_ref(&mut self, owner: u32, name: &str) -> Result<i32, BuildError> {
        let field = self.module.types[owner as usize]
            .fields
            .iter()
            .position(|f| f.name == name)
            .ok_or_else(|| BuildError::UnknownField {
                owner,
                name: name.to_string(),
            })?;
        Ok(self.member_ref(owner, Member::Field(field as u32)))
    }

    pub fn member_ref(&mut self, owner: u32, member: Member) -> i32 {
        self.module.member_refs.push(MemberReference { owner, member });
        (self.module.member_refs.len() - 1) as i32
    }

    /// Adds a method and returns its index in the method table.
    pub fn add_method(&mut self, method: MethodBuilder) -> Result<u32, BuildError> {
        let def = method.finish()?;
        self.module.methods.push(def);
        Ok((self.module.methods.len() - 1) as u32)
    }

    /// Adds a method and returns a member reference suitable for `call`.
    pub fn add_callable(
        &mut self,
        method: MethodBuilder,
    ) -> Result<i32, BuildError> {
        let owner = method.def.owner;
        let idx = self.add_method(method)?;
        Ok(self.member_ref(owner, Member::Method(idx)))
    }

    /// Adds a constructor and returns a type reference suitable for
    /// `newobj`.
    pub fn add_constructor(
        &mut self,
        method: MethodBuilder,
    ) -> Result<i32, BuildError> {
        let ty = method.def.owner;
        let constructor = self.add_callable(method.set_constructor())? as u32;
        self.module.type_refs.push(TypeReference { ty, constructor });
        Ok((self.module.type_refs.len() - 1) as i32)
    }

    pub fn constant(&mut self, kind: PrimitiveKind, bytes: &[u8]) -> i32 {
        debug_assert_eq!(bytes.len(), kind.size());
        let offset = self.module.constant_pool.len() as u32;
        self.module.constant_pool.extend_from_slice(bytes);
        self.module.constants.push(Constant {
            kind: ConstantKind::Primitive(kind),
            offset,
        });
        (self.module.constants.len() - 1) as i32
    }

    pub fn const_i32(&mut self, value: i32) -> i32 {
        self.primitive(PrimitiveKind::I32);
        self.constant(PrimitiveKind::I32, &value.to_le_bytes())
    }

    pub fn const_i64(&mut self, value: i64) -> i32 {
        self.primitive(PrimitiveKind::I64);
        self.constant(PrimitiveKind::I64, &value.to_le_bytes())
    }

    pub fn const_f32(&mut self, value: f32) -> i32 {
        self.primitive(PrimitiveKind::F32);
        self.constant(PrimitiveKind::F32, &value.to_le_bytes())
    }

    pub fn const_f64(&mut self, value: f64) -> i32 {
        self.primitive(PrimitiveKind::F64);
        self.constant(PrimitiveKind::F64, &value.to_le_bytes())
    }

    pub fn const_bool(&mut self, value: bool) -> i32 {
        self.primitive(PrimitiveKind::Bool);
        self.constant(PrimitiveKind::Bool, &[value as u8])
    }

    pub fn const_char(&mut self, value: char) -> i32 {
        self.primitive(PrimitiveKind::Char);
        let mut units = [0u16; 2];
        let unit = value.encode_utf16(&mut units)[0];
        self.constant(PrimitiveKind::Char, &unit.to_le_bytes())
    }

    /// A string constant; identical strings share one string table entry.
    pub fn const_string(&mut self, value: &str) -> i32 {
        self.string();
        let offset = match self.strings_by_value.get(value) {
            Some(&offset) => offset,
            None => {
                let offset = self.module.strings.len() as u32;
                self.module.strings.push(value.to_string());
                self.strings_by_value.insert(value.to_string(), offset);
                offset
            }
        };
        self.module.constants.push(Constant {
            kind: ConstantKind::String,
            offset,
        });
        (self.module.constants.len() - 1) as i32
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn finish(self) -> Module {
        self.module
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_types_are_memoized() {
        let mut b = ModuleBuilder::new();
        let int = b.int();
        assert_eq!(b.int(), int);
        let arr = b.array_of(int);
        assert_eq!(b.array_of(int), arr);
        let module = b.finish();
        assert_eq!(module.types[arr as usize].name, "int[]");
        assert_eq!(module.types[arr as usize].underlying, Some(int));
    }

    #[test]
    fn forward_branches_are_patched() {
        let mut b = ModuleBuilder::new();
        let int = b.int();
        let program = b.static_class("program");
        let one = b.const_i32(1);
        let mut m = MethodBuilder::new("main", program, int).set_static();
        let end = m.label();
        m.br(end);
        m.emit(Op::Ldc, one);
        m.bind(end);
        m.emit(Op::Ldc, one).op(Op::Ret);
        let idx = b.add_method(m).expect("build");
        let module = b.finish();
        let body = &module.methods[idx as usize].body;
        assert_eq!(body[0], Instruction::new(Op::Br, 2));
    }

    #[test]
    fn unbound_label_is_reported() {
        let mut b = ModuleBuilder::new();
        let void = b.void();
        let program = b.static_class("program");
        let mut m = MethodBuilder::new("main", program, void).set_static();
        let nowhere = m.label();
        m.brtrue(nowhere);
        let err = b.add_method(m).unwrap_err();
        assert!(matches!(err, BuildError::UnboundLabel { .. }));
    }

    #[test]
    fn constants_are_encoded_little_endian() {
        let mut b = ModuleBuilder::new();
        let c = b.const_i32(0x0102_0304);
        let s = b.const_string("hi");
        let s2 = b.const_string("hi");
        let module = b.finish();
        let constant = module.constant(c as usize).expect("constant");
        assert_eq!(
            module.constant_bytes(constant),
            Some(&[4u8, 3, 2, 1][..])
        );
        assert_eq!(module.constants[s as usize].offset, 0);
        assert_eq!(module.constants[s2 as usize].offset, 0);
        assert_eq!(module.string(0), Some("hi"));
    }
}
