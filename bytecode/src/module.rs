use crate::instruction::Instruction;

/// Scalar categories shared by constants and primitive type definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveKind {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    Bool,
    /// UTF-16 code unit.
    Char,
}

impl PrimitiveKind {
    pub const ALL: [PrimitiveKind; 12] = [
        PrimitiveKind::I8,
        PrimitiveKind::U8,
        PrimitiveKind::I16,
        PrimitiveKind::U16,
        PrimitiveKind::I32,
        PrimitiveKind::U32,
        PrimitiveKind::I64,
        PrimitiveKind::U64,
        PrimitiveKind::F32,
        PrimitiveKind::F64,
        PrimitiveKind::Bool,
        PrimitiveKind::Char,
    ];

    /// Exact byte footprint of one value.
    pub const fn size(self) -> usize {
        match self {
            Self::I8 | Self::U8 | Self::Bool => 1,
            Self::I16 | Self::U16 | Self::Char => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 => 8,
        }
    }

    pub const fn is_numeric(self) -> bool {
        !matches!(self, Self::Bool | Self::Char)
    }

    pub const fn is_floating_point(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }

    pub const fn is_signed(self) -> bool {
        matches!(
            self,
            Self::I8 | Self::I16 | Self::I32 | Self::I64 | Self::F32 | Self::F64
        )
    }

    /// Source-level name of the type.
    pub const fn name(self) -> &'static str {
        match self {
            Self::I8 => "sbyte",
            Self::U8 => "byte",
            Self::I16 => "short",
            Self::U16 => "ushort",
            Self::I32 => "int",
            Self::U32 => "uint",
            Self::I64 => "long",
            Self::U64 => "ulong",
            Self::F32 => "float",
            Self::F64 => "double",
            Self::Bool => "bool",
            Self::Char => "char",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstantKind {
    Primitive(PrimitiveKind),
    /// The constant's offset is an index into the string table.
    String,
}

/// A constant table entry: a type tag plus an offset into the constant pool
/// (or the string table for strings).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constant {
    pub kind: ConstantKind,
    pub offset: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeDefKind {
    Void,
    Primitive(PrimitiveKind),
    String,
    /// Value type, laid out inline wherever it is stored.
    Struct,
    /// Reference type, instances live on the heap.
    Class,
    /// Reference to a heap array of `underlying`.
    Array,
    /// Raw address of an `underlying`.
    Pointer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDefinition {
    pub name: String,
    pub ty: u32,
    pub is_static: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDefinition {
    pub name: String,
    pub kind: TypeDefKind,
    /// Element type for arrays, pointee type for pointers.
    pub underlying: Option<u32>,
    pub fields: Vec<FieldDefinition>,
    pub is_static: bool,
}

impl TypeDefinition {
    pub fn new(name: impl Into<String>, kind: TypeDefKind) -> Self {
        Self {
            name: name.into(),
            kind,
            underlying: None,
            fields: Vec::new(),
            is_static: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeReference {
    pub ty: u32,
    /// Member reference naming the constructor.
    pub constructor: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Member {
    /// Index into the owner's field list.
    Field(u32),
    /// Index into the module's method table.
    Method(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberReference {
    pub owner: u32,
    pub member: Member,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterDefinition {
    pub name: String,
    pub ty: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDefinition {
    pub name: String,
    pub ty: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDefinition {
    pub name: String,
    pub owner: u32,
    pub return_type: u32,
    pub is_static: bool,
    pub is_native: bool,
    pub is_constructor: bool,
    pub parameters: Vec<ParameterDefinition>,
    pub locals: Vec<LocalDefinition>,
    pub body: Vec<Instruction>,
}

/// The metadata tables produced by the front end for one compiled program.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Module {
    pub constants: Vec<Constant>,
    pub constant_pool: Vec<u8>,
    pub strings: Vec<String>,
    pub types: Vec<TypeDefinition>,
    pub type_refs: Vec<TypeReference>,
    pub member_refs: Vec<MemberReference>,
    pub methods: Vec<MethodDefinition>,
}

impl Module {
    pub fn constant(&self, idx: usize) -> Option<&Constant> {
        self.constants.get(idx)
    }

    /// Raw little-endian bytes of a primitive constant.
    pub fn constant_bytes(&self, constant: &Constant) -> Option<&[u8]> {
        let ConstantKind::Primitive(kind) = constant.kind else {
            return None;
        };
        let start = constant.offset as usize;
        self.constant_pool.get(start..start + kind.size())
    }

    pub fn string(&self, idx: usize) -> Option<&str> {
        self.strings.get(idx).map(String::as_str)
    }

    pub fn type_def(&self, idx: usize) -> Option<&TypeDefinition> {
        self.types.get(idx)
    }

    pub fn type_ref(&self, idx: usize) -> Option<&TypeReference> {
        self.type_refs.get(idx)
    }

    pub fn member_ref(&self, idx: usize) -> Option<&MemberReference> {
        self.member_refs.get(idx)
    }

    pub fn method(&self, idx: usize) -> Option<&MethodDefinition> {
        self.methods.get(idx)
    }

    pub fn find_type(&self, name: &str) -> Option<u32> {
        self.types
            .iter()
            .position(|ty| ty.name == name)
            .map(|idx| idx as u32)
    }

    /// Finds a method by the name of its declaring type and its own name.
    pub fn find_method(&self, owner: &str, name: &str) -> Option<u32> {
        self.methods
            .iter()
            .position(|method| {
                method.name == name
                    && self
                        .type_def(method.owner as usize)
                        .is_some_and(|ty| ty.name == owner)
            })
            .map(|idx| idx as u32)
    }
}
