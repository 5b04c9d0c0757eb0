//! Byte-arena heap with an address -> object side table.
//!
//! There is no collector: objects are freed explicitly by the runtime's
//! liveness checks. Freed addresses leave a tombstone so a later lookup can
//! tell a dangling address apart from one that was never handed out.

use core::fmt;
use std::collections::{BTreeMap, HashSet};

use log::trace;
use object::{Address, Space, TypeId};

/// Every region starts on this boundary; offset 0 is never handed out.
pub const HEAP_ALIGN: usize = 8;

// ── Heap settings ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Arena size reserved up front, in bytes.
    pub initial_size: usize,
    /// Hard cap the arena may grow to.
    pub max_size: usize,
    /// Multiplier applied to the arena size when it must grow.
    pub growth_factor: f64,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            initial_size: 65_536,      // 64 KB
            max_size: 268_435_456,     // 256 MB
            growth_factor: 2.0,
        }
    }
}

impl HeapSettings {
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.initial_size == 0 || self.max_size == 0 {
            return Err("Sizes must be > 0");
        }
        if self.initial_size > self.max_size {
            return Err("initial_size must not exceed max_size");
        }
        if self.growth_factor.is_nan() || self.growth_factor <= 1.0 {
            return Err("growth_factor must be > 1.0");
        }
        Ok(())
    }
}

// ── Objects ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// Length-prefixed UTF-8 text.
    String,
    /// Length-prefixed run of `length` inline elements.
    Array { element: TypeId, length: u32 },
    /// Class instance laid out by its descriptor.
    Instance,
    /// Static field block of a type.
    Statics,
}

/// Header for one live allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapObject {
    pub address: Address,
    pub ty: TypeId,
    /// Requested size in bytes, excluding alignment padding.
    pub size: usize,
    pub kind: ObjectKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapError {
    NotAllocated(Address),
    UseAfterFree(Address),
    OutOfMemory { requested: usize, limit: usize },
    InvalidRange { address: Address, len: usize },
    InvalidSettings(&'static str),
}

impl fmt::Display for HeapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAllocated(addr) => {
                write!(f, "address {addr} was never allocated")
            }
            Self::UseAfterFree(addr) => {
                write!(f, "address {addr} has already been freed")
            }
            Self::OutOfMemory { requested, limit } => write!(
                f,
                "heap exhausted: cannot allocate {requested} bytes (limit {limit})"
            ),
            Self::InvalidRange { address, len } => {
                write!(f, "access of {len} bytes at {address} is out of range")
            }
            Self::InvalidSettings(msg) => write!(f, "invalid heap settings: {msg}"),
        }
    }
}

impl std::error::Error for HeapError {}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub allocations: usize,
    pub frees: usize,
    pub live_objects: usize,
    pub live_bytes: usize,
    pub arena_size: usize,
}

// ── Heap ──────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Heap {
    settings: HeapSettings,
    memory: Vec<u8>,
    top: usize,
    objects: BTreeMap<usize, HeapObject>,
    /// Sorted, coalesced `(offset, len)` holes below `top`.
    free_list: Vec<(usize, usize)>,
    tombstones: HashSet<usize>,
    allocations: usize,
    frees: usize,
}

#[inline(always)]
const fn reserved(size: usize) -> usize {
    let size = if size == 0 { 1 } else { size };
    (size + HEAP_ALIGN - 1) & !(HEAP_ALIGN - 1)
}

impl Heap {
    pub fn new(settings: HeapSettings) -> Result<Self, HeapError> {
        settings.validate().map_err(HeapError::InvalidSettings)?;
        Ok(Self {
            memory: vec![0; settings.initial_size],
            settings,
            top: HEAP_ALIGN,
            objects: BTreeMap::new(),
            free_list: Vec::new(),
            tombstones: HashSet::new(),
            allocations: 0,
            frees: 0,
        })
    }

    pub fn settings(&self) -> &HeapSettings {
        &self.settings
    }

    /// Reserves `size` zeroed bytes and records the object header.
    pub fn allocate(
        &mut self,
        size: usize,
        ty: TypeId,
        kind: ObjectKind,
    ) -> Result<Address, HeapError> {
        let len = reserved(size);
        let offset = match self.take_hole(len) {
            Some(offset) => offset,
            None => self.bump(len, size)?,
        };
        self.memory[offset..offset + len].fill(0);
        let address = Address::heap(offset);
        self.tombstones.remove(&offset);
        self.objects.insert(
            offset,
            HeapObject {
                address,
                ty,
                size,
                kind,
            },
        );
        self.allocations += 1;
        trace!("heap: allocated {size} bytes at {address} ({kind:?})");
        Ok(address)
    }

    fn take_hole(&mut self, len: usize) -> Option<usize> {
        let idx = self.free_list.iter().position(|&(_, hole)| hole >= len)?;
        let (offset, hole) = self.free_list[idx];
        if hole == len {
            self.free_list.remove(idx);
        } else {
            self.free_list[idx] = (offset + len, hole - len);
        }
        Some(offset)
    }

    fn bump(&mut self, len: usize, requested: usize) -> Result<usize, HeapError> {
        let end = self.top + len;
        if end > self.settings.max_size {
            return Err(HeapError::OutOfMemory {
                requested,
                limit: self.settings.max_size,
            });
        }
        if end > self.memory.len() {
            let grown = (self.memory.len() as f64 * self.settings.growth_factor)
                as usize;
            let new_len = grown.max(end).min(self.settings.max_size);
            trace!("heap: growing arena {} -> {new_len}", self.memory.len());
            self.memory.resize(new_len, 0);
        }
        let offset = self.top;
        self.top = end;
        Ok(offset)
    }

    /// Releases the object at `address`, returning its header.
    pub fn free(&mut self, address: Address) -> Result<HeapObject, HeapError> {
        self.check_heap_space(address)?;
        let offset = address.offset();
        let Some(object) = self.objects.remove(&offset) else {
            return Err(self.missing(address));
        };
        self.release(offset, reserved(object.size));
        self.tombstones.insert(offset);
        self.frees += 1;
        trace!("heap: freed {address} ({:?})", object.kind);
        Ok(object)
    }

    fn release(&mut self, offset: usize, len: usize) {
        let idx = self.free_list.partition_point(|&(o, _)| o < offset);
        self.free_list.insert(idx, (offset, len));
        // merge with successor, then predecessor
        if idx + 1 < self.free_list.len() {
            let (next_off, next_len) = self.free_list[idx + 1];
            if offset + len == next_off {
                self.free_list[idx].1 += next_len;
                self.free_list.remove(idx + 1);
            }
        }
        if idx > 0 {
            let (prev_off, prev_len) = self.free_list[idx - 1];
            if prev_off + prev_len == offset {
                self.free_list[idx - 1].1 += self.free_list[idx].1;
                self.free_list.remove(idx);
            }
        }
        // give a trailing hole back to the bump region
        if let Some(&(last_off, last_len)) = self.free_list.last()
            && last_off + last_len == self.top
        {
            self.top = last_off;
            self.free_list.pop();
        }
    }

    fn missing(&self, address: Address) -> HeapError {
        if self.tombstones.contains(&address.offset()) {
            HeapError::UseAfterFree(address)
        } else {
            HeapError::NotAllocated(address)
        }
    }

    fn check_heap_space(&self, address: Address) -> Result<(), HeapError> {
        if address.space() != Space::Heap || address.is_null() {
            return Err(HeapError::NotAllocated(address));
        }
        Ok(())
    }

    /// Header of the live object starting at `address`.
    pub fn get_object(&self, address: Address) -> Result<&HeapObject, HeapError> {
        self.check_heap_space(address)?;
        self.objects
            .get(&address.offset())
            .ok_or_else(|| self.missing(address))
    }

    /// Header of the live object whose bytes include `address`.
    pub fn object_containing(&self, address: Address) -> Option<&HeapObject> {
        if address.space() != Space::Heap || address.is_null() {
            return None;
        }
        let offset = address.offset();
        let (&start, object) = self.objects.range(..=offset).next_back()?;
        (offset == start || offset < start + object.size).then_some(object)
    }

    #[inline]
    pub fn is_live(&self, address: Address) -> bool {
        address.space() == Space::Heap
            && self.objects.contains_key(&address.offset())
    }

    fn range(&self, address: Address, len: usize) -> Result<usize, HeapError> {
        let offset = address.offset();
        if address.space() != Space::Heap
            || offset < HEAP_ALIGN
            || offset + len > self.top
        {
            return Err(HeapError::InvalidRange { address, len });
        }
        Ok(offset)
    }

    /// Raw bytes at `address`. Interior addresses are allowed; only the
    /// arena bounds are checked.
    pub fn bytes(&self, address: Address, len: usize) -> Result<&[u8], HeapError> {
        let offset = self.range(address, len)?;
        Ok(&self.memory[offset..offset + len])
    }

    pub fn bytes_mut(
        &mut self,
        address: Address,
        len: usize,
    ) -> Result<&mut [u8], HeapError> {
        let offset = self.range(address, len)?;
        Ok(&mut self.memory[offset..offset + len])
    }

    pub fn write(&mut self, address: Address, data: &[u8]) -> Result<(), HeapError> {
        self.bytes_mut(address, data.len())?.copy_from_slice(data);
        Ok(())
    }

    pub fn live_objects(&self) -> impl Iterator<Item = &HeapObject> {
        self.objects.values()
    }

    pub fn stats(&self) -> HeapStats {
        HeapStats {
            allocations: self.allocations,
            frees: self.frees,
            live_objects: self.objects.len(),
            live_bytes: self.objects.values().map(|o| o.size).sum(),
            arena_size: self.memory.len(),
        }
    }
}
