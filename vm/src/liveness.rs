//! Reachability checks that decide when a heap object is released.
//!
//! There is no tracing collector. Whenever a value leaves the evaluation
//! stack or a slot is overwritten, the heap objects it owned are freed
//! unless some other slot still refers to them. Freeing cascades into the
//! references the freed object itself held.

use heap::{HeapObject, ObjectKind};
use log::debug;
use object::{Address, Space, TypeCategory, TypeId, Value};

use crate::memory::LENGTH_PREFIX;
use crate::{Runtime, RuntimeError};

impl Runtime {
    /// Releases the heap object(s) `value` owns when nothing else refers to
    /// them. Calling this on a value that was already released is a no-op.
    pub fn deallocate_if_dead(&mut self, value: Value) -> Result<(), RuntimeError> {
        let targets = self.owned_targets(value)?;
        self.release_unreferenced(targets)
    }

    /// Frees every target in `targets` that is no longer referenced, then
    /// repeats for whatever the freed objects referred to.
    pub fn release_unreferenced(
        &mut self,
        mut targets: Vec<Address>,
    ) -> Result<(), RuntimeError> {
        while let Some(target) = targets.pop() {
            let object = match self.heap.get_object(target) {
                Ok(object) if object.kind != ObjectKind::Statics => *object,
                _ => continue,
            };
            if self.is_referenced(target)? {
                continue;
            }
            let inner = self.references_of(&object)?;
            self.heap.free(target)?;
            debug!("released {:?} at {target}", object.kind);
            targets.extend(inner);
        }
        Ok(())
    }

    /// True when any frame slot, evaluation value, in-flight value, static
    /// field or other live heap object holds `target`.
    pub fn is_referenced(&self, target: Address) -> Result<bool, RuntimeError> {
        for frame in self.stack.frames() {
            for value in frame.instance().iter().chain(frame.values()) {
                if self.owned_targets(*value)?.contains(&target) {
                    return Ok(true);
                }
            }
            for slot in frame.locals().iter().chain(frame.arguments()) {
                if self.references_in(slot.addr, slot.ty)?.contains(&target) {
                    return Ok(true);
                }
            }
        }
        for value in &self.in_flight {
            if self.owned_targets(*value)?.contains(&target) {
                return Ok(true);
            }
        }
        for object in self.heap.live_objects() {
            if object.address != target
                && self.references_of(object)?.contains(&target)
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Heap addresses a value keeps alive: its own target, for a struct
    /// the references stored in its fields, for a pointer the heap object
    /// it points into.
    pub(crate) fn owned_targets(&self, value: Value) -> Result<Vec<Address>, RuntimeError> {
        match value {
            Value::Struct { ty, addr } => self.references_in(addr, ty),
            Value::Pointer { target, .. } => Ok(self
                .heap
                .object_containing(target)
                .map(|object| object.address)
                .into_iter()
                .collect()),
            other => Ok(other
                .heap_target()
                .filter(|t| !t.is_null())
                .into_iter()
                .collect()),
        }
    }

    /// Heap addresses stored in the slot of type `ty` at `addr`.
    pub(crate) fn references_in(
        &self,
        addr: Address,
        ty: TypeId,
    ) -> Result<Vec<Address>, RuntimeError> {
        let mut found = Vec::new();
        self.collect_references(addr, ty, &mut found)?;
        Ok(found)
    }

    fn collect_references(
        &self,
        addr: Address,
        ty: TypeId,
        found: &mut Vec<Address>,
    ) -> Result<(), RuntimeError> {
        let desc = self.descriptor(ty);
        match desc.category {
            TypeCategory::String | TypeCategory::Class | TypeCategory::Array => {
                let bytes = self.read(addr, object::REF_SIZE)?;
                if let Some(target) = Address::from_bytes(bytes)
                    && !target.is_null()
                    && target.space() == Space::Heap
                {
                    found.push(target);
                }
            }
            TypeCategory::Pointer => {
                let bytes = self.read(addr, object::REF_SIZE)?;
                if let Some(object) = Address::from_bytes(bytes)
                    .and_then(|target| self.heap.object_containing(target))
                {
                    found.push(object.address);
                }
            }
            TypeCategory::Struct => {
                for field in desc.instance_fields() {
                    self.collect_references(addr.add(field.offset), field.ty, found)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Whether a slot of type `ty` can hold a heap reference at all.
    fn holds_references(&self, ty: TypeId) -> bool {
        let desc = self.descriptor(ty);
        desc.is_reference()
            || desc.is_pointer()
            || (desc.is_struct()
                && desc.instance_fields().any(|f| self.holds_references(f.ty)))
    }

    /// References stored inside a heap object.
    fn references_of(&self, object: &HeapObject) -> Result<Vec<Address>, RuntimeError> {
        let mut found = Vec::new();
        match object.kind {
            ObjectKind::String => {}
            ObjectKind::Instance => {
                for field in self.descriptor(object.ty).instance_fields() {
                    self.collect_references(
                        object.address.add(field.offset),
                        field.ty,
                        &mut found,
                    )?;
                }
            }
            ObjectKind::Statics => {
                for field in self.descriptor(object.ty).static_fields() {
                    self.collect_references(
                        object.address.add(field.offset),
                        field.ty,
                        &mut found,
                    )?;
                }
            }
            ObjectKind::Array { element, length } => {
                if self.holds_references(element) {
                    let size = self.descriptor(element).size;
                    let first = object.address.add(LENGTH_PREFIX);
                    for i in 0..length as usize {
                        self.collect_references(first.add(i * size), element, &mut found)?;
                    }
                }
            }
        }
        Ok(found)
    }

    /// Pins `value` so liveness checks treat it as bound until the
    /// matching [`Runtime::unpin`].
    pub(crate) fn pin(&mut self, value: Value) {
        self.in_flight.push(value);
    }

    pub(crate) fn unpin(&mut self) -> Option<Value> {
        self.in_flight.pop()
    }
}
