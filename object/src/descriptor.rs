use core::fmt;

use bytecode::PrimitiveKind;

/// Bytes occupied by any address-valued slot (strings, arrays, class
/// instances, pointers).
pub const REF_SIZE: usize = 8;

/// Identity of a runtime type descriptor inside its [`TypeRegistry`].
///
/// For declared types the id equals the module's type definition index.
///
/// [`TypeRegistry`]: crate::TypeRegistry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub(crate) u32);

impl TypeId {
    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Void,
    Primitive(PrimitiveKind),
    String,
    Struct,
    Class,
    Array,
    Pointer,
}

/// Placement of one field within its block.
///
/// Instance fields are offset from the start of the instance; static fields
/// from the start of the type's static block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLayout {
    pub name: String,
    pub ty: TypeId,
    pub offset: usize,
    pub size: usize,
    pub is_static: bool,
}

/// Immutable per-type metadata used to lay out values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescriptor {
    pub id: TypeId,
    pub name: String,
    pub category: TypeCategory,
    /// Exact unpadded footprint of one slot of this type.
    pub size: usize,
    /// Element type for arrays, pointee type for pointers.
    pub underlying: Option<TypeId>,
    /// All fields in declaration order, static and instance alike.
    pub fields: Vec<FieldLayout>,
    /// Heap footprint of a class instance, inline footprint of a struct.
    pub instance_size: usize,
    pub static_size: usize,
    pub is_static: bool,
}

impl TypeDescriptor {
    #[inline]
    pub fn is_array(&self) -> bool {
        self.category == TypeCategory::Array
    }

    #[inline]
    pub fn is_pointer(&self) -> bool {
        self.category == TypeCategory::Pointer
    }

    #[inline]
    pub fn is_void(&self) -> bool {
        self.category == TypeCategory::Void
    }

    #[inline]
    pub fn is_struct(&self) -> bool {
        self.category == TypeCategory::Struct
    }

    #[inline]
    pub fn is_string(&self) -> bool {
        self.category == TypeCategory::String
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self.category, TypeCategory::Primitive(k) if k.is_numeric())
    }

    pub fn is_floating_point(&self) -> bool {
        matches!(
            self.category,
            TypeCategory::Primitive(k) if k.is_floating_point()
        )
    }

    /// True for types whose slots hold an owning heap address.
    pub fn is_reference(&self) -> bool {
        matches!(
            self.category,
            TypeCategory::String | TypeCategory::Class | TypeCategory::Array
        )
    }

    pub fn primitive(&self) -> Option<PrimitiveKind> {
        match self.category {
            TypeCategory::Primitive(kind) => Some(kind),
            _ => None,
        }
    }

    pub fn field(&self, idx: usize) -> Option<&FieldLayout> {
        self.fields.get(idx)
    }

    pub fn instance_fields(&self) -> impl Iterator<Item = &FieldLayout> {
        self.fields.iter().filter(|f| !f.is_static)
    }

    pub fn static_fields(&self) -> impl Iterator<Item = &FieldLayout> {
        self.fields.iter().filter(|f| f.is_static)
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
