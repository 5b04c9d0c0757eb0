use core::fmt;
use std::collections::HashMap;

use bytecode::{Module, PrimitiveKind, TypeDefKind};

use crate::descriptor::{
    FieldLayout, REF_SIZE, TypeCategory, TypeDescriptor, TypeId,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeError {
    UnknownType(u32),
    MissingUnderlyingType(String),
    RecursiveLayout(String),
    DuplicateBuiltin(String),
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownType(idx) => write!(f, "unknown type definition #{idx}"),
            Self::MissingUnderlyingType(name) => {
                write!(f, "type '{name}' has no underlying type")
            }
            Self::RecursiveLayout(name) => {
                write!(f, "struct '{name}' contains itself by value")
            }
            Self::DuplicateBuiltin(name) => {
                write!(f, "builtin type '{name}' is declared more than once")
            }
        }
    }
}

impl std::error::Error for TypeError {}

/// Well-known types the runtime itself needs to produce values of.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Builtins {
    pub void: TypeId,
    pub string: TypeId,
    primitives: [TypeId; PrimitiveKind::ALL.len()],
}

impl Builtins {
    pub fn primitive(&self, kind: PrimitiveKind) -> TypeId {
        self.primitives[kind as usize]
    }

    pub fn int(&self) -> TypeId {
        self.primitive(PrimitiveKind::I32)
    }

    pub fn bool(&self) -> TypeId {
        self.primitive(PrimitiveKind::Bool)
    }
}

#[derive(Clone, Copy)]
enum Layout {
    Pending,
    InProgress,
    Done(usize),
}

/// Process-wide table of type descriptors, built once from a module.
#[derive(Debug, Clone)]
pub struct TypeRegistry {
    types: Vec<TypeDescriptor>,
    declared: usize,
    by_name: HashMap<String, TypeId>,
    builtins: Builtins,
}

impl TypeRegistry {
    pub fn from_module(module: &Module) -> Result<Self, TypeError> {
        let mut types = Vec::with_capacity(module.types.len() + 14);
        for (idx, def) in module.types.iter().enumerate() {
            let category = match def.kind {
                TypeDefKind::Void => TypeCategory::Void,
                TypeDefKind::Primitive(kind) => TypeCategory::Primitive(kind),
                TypeDefKind::String => TypeCategory::String,
                TypeDefKind::Struct => TypeCategory::Struct,
                TypeDefKind::Class => TypeCategory::Class,
                TypeDefKind::Array => TypeCategory::Array,
                TypeDefKind::Pointer => TypeCategory::Pointer,
            };
            let underlying = match def.underlying {
                Some(u) if (u as usize) < module.types.len() => Some(TypeId(u)),
                Some(u) => return Err(TypeError::UnknownType(u)),
                None => None,
            };
            if matches!(category, TypeCategory::Array | TypeCategory::Pointer)
                && underlying.is_none()
            {
                return Err(TypeError::MissingUnderlyingType(def.name.clone()));
            }
            types.push(TypeDescriptor {
                id: TypeId(idx as u32),
                name: def.name.clone(),
                category,
                size: 0,
                underlying,
                fields: Vec::new(),
                instance_size: 0,
                static_size: 0,
                is_static: def.is_static,
            });
        }

        let mut state = vec![Layout::Pending; types.len()];
        let mut sizes = Vec::with_capacity(types.len());
        for idx in 0..types.len() {
            sizes.push(inline_size(module, idx, &mut state)?);
        }
        for (idx, desc) in types.iter_mut().enumerate() {
            desc.size = sizes[idx];
            let def = &module.types[idx];
            let (mut instance_off, mut static_off) = (0, 0);
            for field in &def.fields {
                if field.ty as usize >= module.types.len() {
                    return Err(TypeError::UnknownType(field.ty));
                }
                let size = sizes[field.ty as usize];
                let cursor = if field.is_static {
                    &mut static_off
                } else {
                    &mut instance_off
                };
                desc.fields.push(FieldLayout {
                    name: field.name.clone(),
                    ty: TypeId(field.ty),
                    offset: *cursor,
                    size,
                    is_static: field.is_static,
                });
                *cursor += size;
            }
            desc.instance_size = instance_off;
            desc.static_size = static_off;
        }

        let declared = types.len();
        let mut by_name = HashMap::with_capacity(declared);
        for desc in &types {
            if by_name.insert(desc.name.clone(), desc.id).is_some()
                && is_builtin_name(&desc.name)
            {
                return Err(TypeError::DuplicateBuiltin(desc.name.clone()));
            }
        }

        let mut registry = Self {
            types,
            declared,
            by_name,
            builtins: Builtins {
                void: TypeId(0),
                string: TypeId(0),
                primitives: [TypeId(0); PrimitiveKind::ALL.len()],
            },
        };
        registry.builtins.void = registry.builtin("void", TypeCategory::Void, 0);
        registry.builtins.string =
            registry.builtin("string", TypeCategory::String, REF_SIZE);
        for kind in PrimitiveKind::ALL {
            registry.builtins.primitives[kind as usize] = registry.builtin(
                kind.name(),
                TypeCategory::Primitive(kind),
                kind.size(),
            );
        }
        Ok(registry)
    }

    fn builtin(
        &mut self,
        name: &str,
        category: TypeCategory,
        size: usize,
    ) -> TypeId {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let id = TypeId(self.types.len() as u32);
        self.types.push(TypeDescriptor {
            id,
            name: name.to_string(),
            category,
            size,
            underlying: None,
            fields: Vec::new(),
            instance_size: 0,
            static_size: 0,
            is_static: false,
        });
        self.by_name.insert(name.to_string(), id);
        id
    }

    /// Resolves a module type definition index to its descriptor id.
    ///
    /// Idempotent: the same index always yields the same id.
    pub fn get_type(&self, def_index: u32) -> Result<TypeId, TypeError> {
        if (def_index as usize) < self.declared {
            Ok(TypeId(def_index))
        } else {
            Err(TypeError::UnknownType(def_index))
        }
    }

    /// Descriptor for an id handed out by this registry.
    #[inline]
    pub fn descriptor(&self, id: TypeId) -> &TypeDescriptor {
        &self.types[id.index()]
    }

    pub fn lookup(&self, def_index: u32) -> Result<&TypeDescriptor, TypeError> {
        self.get_type(def_index).map(|id| self.descriptor(id))
    }

    pub fn find(&self, name: &str) -> Option<TypeId> {
        self.by_name.get(name).copied()
    }

    pub fn builtins(&self) -> &Builtins {
        &self.builtins
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TypeDescriptor> {
        self.types.iter()
    }
}

fn is_builtin_name(name: &str) -> bool {
    name == "void"
        || name == "string"
        || PrimitiveKind::ALL.iter().any(|k| k.name() == name)
}

/// Inline slot size of a declared type, resolving struct fields
/// depth-first.
fn inline_size(
    module: &Module,
    idx: usize,
    state: &mut [Layout],
) -> Result<usize, TypeError> {
    match state[idx] {
        Layout::Done(size) => return Ok(size),
        Layout::InProgress => {
            return Err(TypeError::RecursiveLayout(module.types[idx].name.clone()));
        }
        Layout::Pending => {}
    }
    let def = &module.types[idx];
    let size = match def.kind {
        TypeDefKind::Void => 0,
        TypeDefKind::Primitive(kind) => kind.size(),
        TypeDefKind::String
        | TypeDefKind::Class
        | TypeDefKind::Array
        | TypeDefKind::Pointer => REF_SIZE,
        TypeDefKind::Struct => {
            state[idx] = Layout::InProgress;
            let mut total = 0;
            for field in def.fields.iter().filter(|f| !f.is_static) {
                if field.ty as usize >= module.types.len() {
                    return Err(TypeError::UnknownType(field.ty));
                }
                total += inline_size(module, field.ty as usize, state)?;
            }
            total
        }
    };
    state[idx] = Layout::Done(size);
    Ok(size)
}
