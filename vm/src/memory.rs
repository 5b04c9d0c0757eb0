//! Uniform byte access over both arenas, plus the typed helpers that turn
//! slots into [`Value`]s and back.

use std::sync::Arc;

use bytecode::{ConstantKind, Member};
use heap::ObjectKind;
use object::{
    Address, FieldLayout, REF_SIZE, Scalar, Space, TypeCategory, TypeDescriptor,
    TypeError, TypeId, Value,
};

use crate::{Runtime, RuntimeError};

/// Bytes before the first element of an array or the first byte of a
/// string: the `u32` length prefix.
pub const LENGTH_PREFIX: usize = 4;

impl Runtime {
    #[inline]
    pub fn descriptor(&self, ty: TypeId) -> &TypeDescriptor {
        self.types.descriptor(ty)
    }

    // ── Raw bytes ─────────────────────────────────────────────────────

    pub fn read(&self, addr: Address, len: usize) -> Result<&[u8], RuntimeError> {
        if addr.is_null() {
            return Err(RuntimeError::NullReference);
        }
        match addr.space() {
            Space::Heap => Ok(self.heap.bytes(addr, len)?),
            Space::Stack => self.stack.bytes(addr, len),
        }
    }

    pub fn write(&mut self, addr: Address, data: &[u8]) -> Result<(), RuntimeError> {
        if addr.is_null() {
            return Err(RuntimeError::NullReference);
        }
        match addr.space() {
            Space::Heap => Ok(self.heap.write(addr, data)?),
            Space::Stack => {
                self.stack.bytes_mut(addr, data.len())?.copy_from_slice(data);
                Ok(())
            }
        }
    }

    pub fn copy(
        &mut self,
        src: Address,
        dst: Address,
        len: usize,
    ) -> Result<(), RuntimeError> {
        let data = self.read(src, len)?.to_vec();
        self.write(dst, &data)
    }

    // ── Values and slots ──────────────────────────────────────────────

    /// Bytes a slot holding `value` occupies.
    pub fn value_size(&self, value: Value) -> usize {
        match value {
            Value::Primitive { ty, .. } | Value::Struct { ty, .. } => {
                self.descriptor(ty).size
            }
            _ => REF_SIZE,
        }
    }

    /// The bytes a slot must contain to hold `value`.
    pub fn value_bytes(&self, value: Value) -> Result<Vec<u8>, RuntimeError> {
        match value {
            Value::Primitive { addr, .. } | Value::Struct { addr, .. } => {
                Ok(self.read(addr, self.value_size(value))?.to_vec())
            }
            other => Ok(other.location().to_bytes().to_vec()),
        }
    }

    /// A view of the slot of type `ty` at `addr`. Primitives and structs
    /// alias the slot; address-valued types read the stored address.
    pub fn materialize(&self, ty: TypeId, addr: Address) -> Result<Value, RuntimeError> {
        let desc = self.descriptor(ty);
        let stored = || -> Result<Address, RuntimeError> {
            let bytes = self.read(addr, REF_SIZE)?;
            Address::from_bytes(bytes).ok_or(RuntimeError::SizeMismatch {
                expected: REF_SIZE,
                got: bytes.len(),
            })
        };
        Ok(match desc.category {
            TypeCategory::Primitive(_) => Value::Primitive { ty, addr },
            TypeCategory::Struct => Value::Struct { ty, addr },
            TypeCategory::String => Value::String {
                ty,
                target: stored()?,
            },
            TypeCategory::Class => Value::Reference {
                ty,
                target: stored()?,
            },
            TypeCategory::Array => Value::Array {
                ty,
                target: stored()?,
            },
            TypeCategory::Pointer => Value::Pointer {
                pointee: desc.underlying.ok_or_else(|| {
                    TypeError::MissingUnderlyingType(desc.name.clone())
                })?,
                target: stored()?,
            },
            TypeCategory::Void => {
                return Err(RuntimeError::UnexpectedValue {
                    expected: "a storable type",
                    got: "void",
                });
            }
        })
    }

    /// Byte-copies `value` into the slot of type `ty` at `addr`.
    pub fn store(
        &mut self,
        addr: Address,
        ty: TypeId,
        value: Value,
    ) -> Result<(), RuntimeError> {
        let desc = self.descriptor(ty);
        let slot_holds_address = desc.is_reference() || desc.is_pointer();
        if slot_holds_address != value.is_address_valued() {
            return Err(RuntimeError::unexpected(
                if slot_holds_address { "an address" } else { "inline bytes" },
                value,
            ));
        }
        let expected = desc.size;
        let bytes = self.value_bytes(value)?;
        if bytes.len() != expected {
            return Err(RuntimeError::SizeMismatch {
                expected,
                got: bytes.len(),
            });
        }
        self.write(addr, &bytes)
    }

    /// Stores `value`, then releases whatever the slot referenced before if
    /// nothing else still does.
    pub fn assign(
        &mut self,
        addr: Address,
        ty: TypeId,
        value: Value,
    ) -> Result<(), RuntimeError> {
        let previous = self.references_in(addr, ty)?;
        self.store(addr, ty, value)?;
        self.release_unreferenced(previous)
    }

    /// Copy of the slot at `addr` placed in the active frame's scratch.
    pub fn load(&mut self, ty: TypeId, addr: Address) -> Result<Value, RuntimeError> {
        let view = self.materialize(ty, addr)?;
        self.duplicate(view)
    }

    /// Gives primitives and structs fresh storage in the active frame;
    /// address-valued values are returned unchanged.
    pub fn duplicate(&mut self, value: Value) -> Result<Value, RuntimeError> {
        match value {
            Value::Primitive { ty, addr } => {
                let size = self.descriptor(ty).size;
                let copy = self.allocate(size)?;
                self.copy(addr, copy, size)?;
                Ok(Value::Primitive { ty, addr: copy })
            }
            Value::Struct { ty, addr } => {
                let size = self.descriptor(ty).size;
                let copy = self.allocate(size)?;
                self.copy(addr, copy, size)?;
                Ok(Value::Struct { ty, addr: copy })
            }
            other => Ok(other),
        }
    }

    // ── Typed allocation ──────────────────────────────────────────────

    /// Carves `n` bytes from the active frame.
    pub fn allocate(&mut self, n: usize) -> Result<Address, RuntimeError> {
        self.stack.allocate(n)
    }

    pub fn allocate_primitive(
        &mut self,
        ty: TypeId,
        scalar: Scalar,
    ) -> Result<Value, RuntimeError> {
        let desc = self.descriptor(ty);
        let Some(kind) = desc.primitive() else {
            return Err(RuntimeError::UnexpectedValue {
                expected: "a primitive type",
                got: "composite type",
            });
        };
        let bytes = scalar.convert(kind).encode();
        let addr = self.allocate(bytes.len())?;
        self.write(addr, &bytes)?;
        Ok(Value::Primitive { ty, addr })
    }

    /// A primitive of the builtin type matching the scalar's kind.
    pub fn allocate_scalar(&mut self, scalar: Scalar) -> Result<Value, RuntimeError> {
        let ty = self.types.builtins().primitive(scalar.kind());
        self.allocate_primitive(ty, scalar)
    }

    pub fn allocate_constant(&mut self, idx: i32) -> Result<Value, RuntimeError> {
        let module = Arc::clone(&self.module);
        let constant = usize::try_from(idx)
            .ok()
            .and_then(|i| module.constant(i))
            .ok_or(RuntimeError::UnknownConstant(idx))?;
        match constant.kind {
            ConstantKind::Primitive(kind) => {
                let bytes = module
                    .constant_bytes(constant)
                    .ok_or(RuntimeError::UnknownConstant(idx))?;
                let ty = self.types.builtins().primitive(kind);
                let addr = self.allocate(bytes.len())?;
                self.write(addr, bytes)?;
                Ok(Value::Primitive { ty, addr })
            }
            ConstantKind::String => {
                let text = module
                    .string(constant.offset as usize)
                    .ok_or(RuntimeError::UnknownConstant(idx))?;
                self.allocate_string(text)
            }
        }
    }

    /// A new heap string holding `text`.
    pub fn allocate_string(&mut self, text: &str) -> Result<Value, RuntimeError> {
        let ty = self.types.builtins().string;
        let len = u32::try_from(text.len()).map_err(|_| RuntimeError::SizeMismatch {
            expected: u32::MAX as usize,
            got: text.len(),
        })?;
        let target = self.heap.allocate(
            LENGTH_PREFIX + text.len(),
            ty,
            ObjectKind::String,
        )?;
        self.heap.write(target, &len.to_le_bytes())?;
        self.heap.write(target.add(LENGTH_PREFIX), text.as_bytes())?;
        Ok(Value::String { ty, target })
    }

    /// A zero-initialised value of `ty`: structs and primitives in the
    /// active frame, class instances on the heap, arrays of length zero.
    pub fn allocate_object(&mut self, ty: TypeId) -> Result<Value, RuntimeError> {
        let desc = self.descriptor(ty);
        let (category, size, instance_size) =
            (desc.category, desc.size, desc.instance_size);
        let underlying = desc
            .underlying
            .ok_or_else(|| TypeError::MissingUnderlyingType(desc.name.clone()));
        let name = desc.name.clone();
        match category {
            TypeCategory::Primitive(_) => Ok(Value::Primitive {
                ty,
                addr: self.allocate(size)?,
            }),
            TypeCategory::Struct => Ok(Value::Struct {
                ty,
                addr: self.allocate(size)?,
            }),
            TypeCategory::Class => {
                let target =
                    self.heap.allocate(instance_size, ty, ObjectKind::Instance)?;
                Ok(Value::Reference { ty, target })
            }
            TypeCategory::String => self.allocate_string(""),
            TypeCategory::Array => self.allocate_array(ty, 0),
            TypeCategory::Pointer => Ok(Value::Pointer {
                pointee: underlying?,
                target: Address::NULL,
            }),
            TypeCategory::Void => Err(RuntimeError::NotConstructible(name)),
        }
    }

    /// A zeroed heap array of `length` elements; `array_ty` is the array
    /// type, not the element type.
    pub fn allocate_array(
        &mut self,
        array_ty: TypeId,
        length: u32,
    ) -> Result<Value, RuntimeError> {
        let desc = self.descriptor(array_ty);
        if !desc.is_array() {
            return Err(RuntimeError::UnexpectedValue {
                expected: "an array type",
                got: "non-array type",
            });
        }
        let element = desc
            .underlying
            .ok_or_else(|| TypeError::MissingUnderlyingType(desc.name.clone()))?;
        let size = LENGTH_PREFIX + self.descriptor(element).size * length as usize;
        let target =
            self.heap
                .allocate(size, array_ty, ObjectKind::Array { element, length })?;
        self.heap.write(target, &length.to_le_bytes())?;
        Ok(Value::Array {
            ty: array_ty,
            target,
        })
    }

    pub fn allocate_pointer(&self, pointee: TypeId, target: Address) -> Value {
        Value::Pointer { pointee, target }
    }

    // ── Readers ───────────────────────────────────────────────────────

    pub fn read_scalar(&self, value: Value) -> Result<Scalar, RuntimeError> {
        let Value::Primitive { ty, addr } = value else {
            return Err(RuntimeError::unexpected("primitive", value));
        };
        let desc = self.descriptor(ty);
        let kind = desc.primitive().ok_or(RuntimeError::unexpected("primitive", value))?;
        Scalar::decode(kind, self.read(addr, desc.size)?).ok_or(
            RuntimeError::SizeMismatch {
                expected: kind.size(),
                got: desc.size,
            },
        )
    }

    /// Integer view of a primitive, used for indices and lengths.
    pub fn read_index(&self, value: Value) -> Result<i64, RuntimeError> {
        match self.read_scalar(value)?.convert(bytecode::PrimitiveKind::I64) {
            Scalar::I64(v) => Ok(v),
            _ => Err(RuntimeError::unexpected("integer", value)),
        }
    }

    pub fn read_string(&self, value: Value) -> Result<String, RuntimeError> {
        let Value::String { target, .. } = value else {
            return Err(RuntimeError::unexpected("string", value));
        };
        if target.is_null() {
            return Err(RuntimeError::NullReference);
        }
        self.heap.get_object(target)?;
        let len = self.read_length(target)?;
        let bytes = self.read(target.add(LENGTH_PREFIX), len as usize)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    fn read_length(&self, target: Address) -> Result<u32, RuntimeError> {
        let prefix = self.read(target, LENGTH_PREFIX)?;
        Ok(u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]))
    }

    pub fn array_length(&self, value: Value) -> Result<u32, RuntimeError> {
        let Value::Array { target, .. } = value else {
            return Err(RuntimeError::unexpected("array", value));
        };
        if target.is_null() {
            return Err(RuntimeError::NullReference);
        }
        self.heap.get_object(target)?;
        self.read_length(target)
    }

    /// Address and type of element `index`.
    ///
    /// There is no index-out-of-range error; callers guarantee valid
    /// indices. An element that would not lie inside the array's own
    /// allocation is still refused with `InvalidRange`.
    pub fn element_address(
        &self,
        array: Value,
        index: i64,
    ) -> Result<(Address, TypeId), RuntimeError> {
        let Value::Array { ty, target } = array else {
            return Err(RuntimeError::unexpected("array", array));
        };
        if target.is_null() {
            return Err(RuntimeError::NullReference);
        }
        let extent = self.heap.get_object(target)?.size;
        let desc = self.descriptor(ty);
        let element = desc
            .underlying
            .ok_or_else(|| TypeError::MissingUnderlyingType(desc.name.clone()))?;
        let size = self.descriptor(element).size;
        usize::try_from(index)
            .ok()
            .and_then(|i| i.checked_mul(size))
            .and_then(|offset| offset.checked_add(LENGTH_PREFIX))
            .filter(|&offset| offset.checked_add(size).is_some_and(|end| end <= extent))
            .and_then(|offset| target.checked_add(offset))
            .map(|addr| (addr, element))
            .ok_or(RuntimeError::Heap(heap::HeapError::InvalidRange {
                address: target,
                len: size,
            }))
    }

    // ── Fields ────────────────────────────────────────────────────────

    /// Owner and layout of the field named by a member reference.
    pub fn resolve_field(
        &self,
        member: i32,
        want_static: bool,
    ) -> Result<(TypeId, FieldLayout), RuntimeError> {
        let reference = usize::try_from(member)
            .ok()
            .and_then(|i| self.module.member_ref(i))
            .ok_or(RuntimeError::UnknownMemberRef(member))?;
        let Member::Field(field) = reference.member else {
            return Err(RuntimeError::NotAField(member));
        };
        let owner = self.types.get_type(reference.owner)?;
        let layout = self
            .descriptor(owner)
            .field(field as usize)
            .ok_or(RuntimeError::NotAField(member))?;
        if layout.is_static != want_static {
            return Err(RuntimeError::StaticMismatch {
                field: layout.name.clone(),
                expected_static: want_static,
            });
        }
        Ok((owner, layout.clone()))
    }

    /// Address of an instance field of a class reference, struct, or
    /// pointer to a struct.
    pub fn field_address(
        &self,
        instance: Value,
        field: &FieldLayout,
    ) -> Result<Address, RuntimeError> {
        match instance {
            Value::Reference { target, .. } => {
                if target.is_null() {
                    return Err(RuntimeError::NullReference);
                }
                self.heap.get_object(target)?;
                Ok(target.add(field.offset))
            }
            Value::Struct { addr, .. } => Ok(addr.add(field.offset)),
            Value::Pointer { target, .. } if !target.is_null() => {
                Ok(target.add(field.offset))
            }
            Value::Pointer { .. } => Err(RuntimeError::NullReference),
            other => Err(RuntimeError::unexpected("object instance", other)),
        }
    }

    pub fn static_field_address(
        &self,
        owner: TypeId,
        field: &FieldLayout,
    ) -> Result<Address, RuntimeError> {
        let block = self.statics_of(owner).ok_or(RuntimeError::StaticMismatch {
            field: field.name.clone(),
            expected_static: true,
        })?;
        Ok(block.add(field.offset))
    }

    // ── Active frame ──────────────────────────────────────────────────

    pub fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        self.stack.push(value)
    }

    pub fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack.pop()
    }

    pub fn local_address(&self, idx: i32) -> Result<Address, RuntimeError> {
        Ok(self.stack.current()?.local(idx)?.addr)
    }

    pub fn argument_address(&self, idx: i32) -> Result<Address, RuntimeError> {
        Ok(self.stack.current()?.argument(idx)?.addr)
    }

    /// View of local `idx` in the active frame.
    pub fn get_local(&self, idx: i32) -> Result<Value, RuntimeError> {
        let binding = self.stack.current()?.local(idx)?;
        self.materialize(binding.ty, binding.addr)
    }

    pub fn set_local(&mut self, idx: i32, value: Value) -> Result<(), RuntimeError> {
        let binding = self.stack.current()?.local(idx)?;
        self.assign(binding.addr, binding.ty, value)
    }

    /// View of argument `idx` in the active frame.
    pub fn get_argument(&self, idx: i32) -> Result<Value, RuntimeError> {
        let binding = self.stack.current()?.argument(idx)?;
        self.materialize(binding.ty, binding.addr)
    }

    pub fn set_argument(&mut self, idx: i32, value: Value) -> Result<(), RuntimeError> {
        let binding = self.stack.current()?.argument(idx)?;
        self.assign(binding.addr, binding.ty, value)
    }
}
