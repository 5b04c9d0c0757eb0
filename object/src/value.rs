use core::fmt;

use crate::descriptor::{REF_SIZE, TypeId};

const STACK_BIT: u64 = 1 << 63;

/// Which arena an [`Address`] points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Space {
    Heap,
    Stack,
}

/// A byte address in either the heap or the stack arena.
///
/// The low bits hold the arena-relative offset, the top bit selects the
/// arena. The all-zero address is null and is never handed out.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(u64);

impl Address {
    pub const NULL: Address = Address(0);

    #[inline(always)]
    pub const fn heap(offset: usize) -> Self {
        Address(offset as u64)
    }

    #[inline(always)]
    pub const fn stack(offset: usize) -> Self {
        Address(offset as u64 | STACK_BIT)
    }

    #[inline(always)]
    pub const fn from_raw(raw: u64) -> Self {
        Address(raw)
    }

    #[inline(always)]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline(always)]
    pub const fn space(self) -> Space {
        if self.0 & STACK_BIT != 0 {
            Space::Stack
        } else {
            Space::Heap
        }
    }

    /// Offset relative to the start of the address's arena.
    #[inline(always)]
    pub const fn offset(self) -> usize {
        (self.0 & !STACK_BIT) as usize
    }

    #[inline(always)]
    pub const fn add(self, bytes: usize) -> Self {
        Address(self.0 + bytes as u64)
    }

    /// `self + bytes`, or `None` when the sum overflows or would leave the
    /// address's arena.
    #[inline]
    pub fn checked_add(self, bytes: usize) -> Option<Self> {
        let offset = (self.offset() as u64).checked_add(u64::try_from(bytes).ok()?)?;
        if offset & STACK_BIT != 0 {
            return None;
        }
        Some(Address(offset | (self.0 & STACK_BIT)))
    }

    /// Encoding used when the address is stored in a reference slot.
    #[inline]
    pub const fn to_bytes(self) -> [u8; REF_SIZE] {
        self.0.to_le_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let raw: [u8; REF_SIZE] = bytes.get(..REF_SIZE)?.try_into().ok()?;
        Some(Address(u64::from_le_bytes(raw)))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            return f.write_str("null");
        }
        match self.space() {
            Space::Heap => write!(f, "heap:{:#x}", self.offset()),
            Space::Stack => write!(f, "stack:{:#x}", self.offset()),
        }
    }
}

/// A runtime value: where its bytes live and how to interpret them.
///
/// Values are handles; the bytes themselves live in a frame or on the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Value {
    /// Fixed-size scalar stored at `addr`, copied on read.
    Primitive { ty: TypeId, addr: Address },
    /// Heap-allocated immutable text.
    String { ty: TypeId, target: Address },
    /// Inline struct laid out at `addr`.
    Struct { ty: TypeId, addr: Address },
    /// Class instance on the heap.
    Reference { ty: TypeId, target: Address },
    /// Borrowed view of a `pointee` at `target`. It never frees memory,
    /// but keeps the heap object it points into alive.
    Pointer { pointee: TypeId, target: Address },
    /// Heap array; `ty` is the array type, not the element type.
    Array { ty: TypeId, target: Address },
}

impl Value {
    /// The value's type; for pointers this is the pointee type.
    pub fn type_id(self) -> TypeId {
        match self {
            Value::Primitive { ty, .. }
            | Value::String { ty, .. }
            | Value::Struct { ty, .. }
            | Value::Reference { ty, .. }
            | Value::Array { ty, .. } => ty,
            Value::Pointer { pointee, .. } => pointee,
        }
    }

    /// The heap address this value owns, if it owns one.
    pub fn heap_target(self) -> Option<Address> {
        match self {
            Value::String { target, .. }
            | Value::Reference { target, .. }
            | Value::Array { target, .. } => Some(target),
            _ => None,
        }
    }

    /// Address of the bytes a slot holding this value must contain:
    /// the inline location for primitives and structs, otherwise the
    /// address stored in the slot.
    pub fn location(self) -> Address {
        match self {
            Value::Primitive { addr, .. } | Value::Struct { addr, .. } => addr,
            Value::String { target, .. }
            | Value::Reference { target, .. }
            | Value::Pointer { target, .. }
            | Value::Array { target, .. } => target,
        }
    }

    /// True when storing this value copies an address rather than bytes.
    pub fn is_address_valued(self) -> bool {
        !matches!(self, Value::Primitive { .. } | Value::Struct { .. })
    }

    pub fn kind_name(self) -> &'static str {
        match self {
            Value::Primitive { .. } => "primitive",
            Value::String { .. } => "string",
            Value::Struct { .. } => "struct",
            Value::Reference { .. } => "reference",
            Value::Pointer { .. } => "pointer",
            Value::Array { .. } => "array",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}) @ {}", self.kind_name(), self.type_id(), self.location())
    }
}
