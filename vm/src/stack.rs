use log::{debug, warn};
use object::{Address, Space, TypeId, Value};

use crate::RuntimeError;

/// A typed, fixed-size slot inside a frame (a local or an argument).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Binding {
    pub ty: TypeId,
    pub addr: Address,
}

/// What a new frame needs reserved.
#[derive(Debug, Clone, Default)]
pub struct FrameLayout {
    /// Method being run, `None` for the host frame.
    pub method: Option<u32>,
    /// Locals + arguments + evaluation footprint + native reserve.
    pub total_size: usize,
    pub max_depth: usize,
    pub instance: Option<Value>,
    /// `(type, size)` of each local in declaration order.
    pub locals: Vec<(TypeId, usize)>,
    /// `(type, size)` of each parameter in declaration order.
    pub arguments: Vec<(TypeId, usize)>,
}

/// One live invocation's window into the stack arena.
///
/// Layout: locals, then arguments, then scratch. Scratch is handed out by a
/// bump cursor and only reclaimed when the frame is popped.
#[derive(Debug, Clone)]
pub struct StackFrame {
    method: Option<u32>,
    base: usize,
    end: usize,
    /// First scratch byte, past the locals and arguments.
    scratch: usize,
    cursor: usize,
    max_depth: usize,
    instance: Option<Value>,
    locals: Vec<Binding>,
    arguments: Vec<Binding>,
    stack: Vec<Value>,
    grown: bool,
}

impl StackFrame {
    #[inline]
    pub fn method(&self) -> Option<u32> {
        self.method
    }

    #[inline]
    pub fn instance(&self) -> Option<Value> {
        self.instance
    }

    #[inline]
    pub fn locals(&self) -> &[Binding] {
        &self.locals
    }

    #[inline]
    pub fn arguments(&self) -> &[Binding] {
        &self.arguments
    }

    /// Live evaluation stack, bottom first.
    #[inline]
    pub fn values(&self) -> &[Value] {
        &self.stack
    }

    #[inline]
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    #[inline]
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Bytes reserved for this frame.
    #[inline]
    pub fn size(&self) -> usize {
        self.end - self.base
    }

    /// Scratch bytes handed out so far.
    #[inline]
    pub fn used(&self) -> usize {
        self.cursor - self.base
    }

    pub fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        if self.stack.len() >= self.max_depth {
            return Err(RuntimeError::EvalStackOverflow {
                limit: self.max_depth,
            });
        }
        self.stack.push(value);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack.pop().ok_or(RuntimeError::EvalStackUnderflow)
    }

    pub fn local(&self, idx: i32) -> Result<Binding, RuntimeError> {
        usize::try_from(idx)
            .ok()
            .and_then(|i| self.locals.get(i).copied())
            .ok_or(RuntimeError::UnknownLocal(idx))
    }

    pub fn argument(&self, idx: i32) -> Result<Binding, RuntimeError> {
        usize::try_from(idx)
            .ok()
            .and_then(|i| self.arguments.get(i).copied())
            .ok_or(RuntimeError::UnknownArgument(idx))
    }
}

/// The invocation sequence and the byte arena backing it.
#[derive(Debug)]
pub struct StackManager {
    memory: Vec<u8>,
    frames: Vec<StackFrame>,
    limit: usize,
}

impl StackManager {
    pub fn new(initial_size: usize, limit: usize) -> Self {
        Self {
            memory: vec![0; initial_size.min(limit)],
            frames: Vec::new(),
            limit,
        }
    }

    fn top(&self) -> usize {
        self.frames.last().map_or(0, |f| f.end)
    }

    fn reserve(&mut self, end: usize) -> Result<(), RuntimeError> {
        if end > self.limit {
            return Err(RuntimeError::StackOverflow {
                requested: end,
                limit: self.limit,
            });
        }
        if end > self.memory.len() {
            let new_len = (self.memory.len() * 2).max(end).min(self.limit);
            self.memory.resize(new_len, 0);
        }
        Ok(())
    }

    /// Reserves a zeroed frame and makes it the active one.
    pub fn allocate_frame(
        &mut self,
        layout: FrameLayout,
    ) -> Result<&mut StackFrame, RuntimeError> {
        let base = self.top();
        let slots: usize = layout
            .locals
            .iter()
            .chain(&layout.arguments)
            .map(|&(_, size)| size)
            .sum();
        let end = base + layout.total_size.max(slots);
        self.reserve(end)?;
        self.memory[base..end].fill(0);

        let mut cursor = base;
        let mut carve = |(ty, size): (TypeId, usize)| {
            let binding = Binding {
                ty,
                addr: Address::stack(cursor),
            };
            cursor += size;
            binding
        };
        let locals = layout.locals.into_iter().map(&mut carve).collect();
        let arguments = layout.arguments.into_iter().map(&mut carve).collect();

        debug!(
            "frame #{} pushed: {} bytes at {}, depth {}",
            self.frames.len(),
            end - base,
            Address::stack(base),
            layout.max_depth
        );
        self.frames.push(StackFrame {
            method: layout.method,
            base,
            end,
            scratch: cursor,
            cursor,
            max_depth: layout.max_depth,
            instance: layout.instance,
            locals,
            arguments,
            stack: Vec::with_capacity(layout.max_depth),
            grown: false,
        });
        self.current_mut()
    }

    /// Pops the most recently pushed frame.
    pub fn deallocate_frame(&mut self) -> Result<StackFrame, RuntimeError> {
        let frame = self.frames.pop().ok_or(RuntimeError::FrameUnderflow)?;
        debug!(
            "frame #{} popped: used {} of {} bytes",
            self.frames.len(),
            frame.used(),
            frame.size()
        );
        Ok(frame)
    }

    pub fn current(&self) -> Result<&StackFrame, RuntimeError> {
        self.frames.last().ok_or(RuntimeError::FrameUnderflow)
    }

    pub fn current_mut(&mut self) -> Result<&mut StackFrame, RuntimeError> {
        self.frames.last_mut().ok_or(RuntimeError::FrameUnderflow)
    }

    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }

    /// Number of active frames, host frame included.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn push(&mut self, value: Value) -> Result<(), RuntimeError> {
        self.current_mut()?.push(value)
    }

    /// Empties the active frame's evaluation stack and rewinds its scratch
    /// cursor, returning the values that were on the stack.
    pub fn reset_scratch(&mut self) -> Result<Vec<Value>, RuntimeError> {
        let frame = self.current_mut()?;
        let (start, end) = (frame.scratch, frame.cursor);
        frame.cursor = frame.scratch;
        let values = std::mem::take(&mut frame.stack);
        self.memory[start..end].fill(0);
        Ok(values)
    }

    pub fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.current_mut()?.pop()
    }

    /// Carves `n` zeroed bytes from the active frame's scratch region.
    ///
    /// When the frame's reservation is exhausted the frame is extended in
    /// place; only the top frame ever allocates, so this never overlaps a
    /// neighbour.
    pub fn allocate(&mut self, n: usize) -> Result<Address, RuntimeError> {
        let index = self
            .frames
            .len()
            .checked_sub(1)
            .ok_or(RuntimeError::FrameUnderflow)?;
        let frame = &self.frames[index];
        let (base, start, reserved_end) = (frame.base, frame.cursor, frame.end);
        let end = start + n;
        if end > reserved_end {
            self.reserve(end)?;
            self.memory[reserved_end..end].fill(0);
            let frame = &mut self.frames[index];
            if !frame.grown {
                warn!(
                    "frame #{index} outgrew its resolved size of {} bytes",
                    reserved_end - base
                );
                frame.grown = true;
            }
            frame.end = end;
        }
        self.frames[index].cursor = end;
        Ok(Address::stack(start))
    }

    fn range(&self, address: Address, len: usize) -> Result<usize, RuntimeError> {
        let offset = address.offset();
        if address.space() != Space::Stack || offset + len > self.top() {
            return Err(RuntimeError::Heap(heap::HeapError::InvalidRange {
                address,
                len,
            }));
        }
        Ok(offset)
    }

    pub fn bytes(&self, address: Address, len: usize) -> Result<&[u8], RuntimeError> {
        let offset = self.range(address, len)?;
        Ok(&self.memory[offset..offset + len])
    }

    pub fn bytes_mut(
        &mut self,
        address: Address,
        len: usize,
    ) -> Result<&mut [u8], RuntimeError> {
        let offset = self.range(address, len)?;
        Ok(&mut self.memory[offset..offset + len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::{Scalar, TypeRegistry};

    fn int() -> TypeId {
        let reg = TypeRegistry::from_module(&Default::default()).expect("registry");
        reg.builtins().int()
    }

    fn layout(total_size: usize, max_depth: usize) -> FrameLayout {
        FrameLayout {
            total_size,
            max_depth,
            ..FrameLayout::default()
        }
    }

    #[test]
    fn slots_are_carved_locals_first() {
        let int = int();
        let mut stack = StackManager::new(64, 1024);
        let frame = stack
            .allocate_frame(FrameLayout {
                method: Some(0),
                total_size: 16,
                max_depth: 2,
                instance: None,
                locals: vec![(int, 4), (int, 4)],
                arguments: vec![(int, 4)],
            })
            .unwrap();
        let offsets: Vec<_> = frame
            .locals()
            .iter()
            .chain(frame.arguments())
            .map(|b| b.addr.offset())
            .collect();
        assert_eq!(offsets, [0, 4, 8]);
        assert_eq!(frame.used(), 12);
        assert_eq!(stack.allocate(4).unwrap(), Address::stack(12));
        assert!(matches!(frame_local(&stack, 2), Err(RuntimeError::UnknownLocal(2))));
    }

    fn frame_local(stack: &StackManager, idx: i32) -> Result<Binding, RuntimeError> {
        stack.current()?.local(idx)
    }

    #[test]
    fn frames_pop_in_reverse() {
        let mut stack = StackManager::new(64, 1024);
        stack.allocate_frame(layout(8, 1)).unwrap();
        stack.allocate_frame(layout(8, 1)).unwrap();
        assert_eq!(stack.depth(), 2);
        assert_eq!(stack.allocate(4).unwrap(), Address::stack(8));
        stack.deallocate_frame().unwrap();
        stack.deallocate_frame().unwrap();
        assert!(matches!(stack.deallocate_frame(), Err(RuntimeError::FrameUnderflow)));
    }

    #[test]
    fn evaluation_depth_is_bounded() {
        let mut stack = StackManager::new(64, 1024);
        stack.allocate_frame(layout(8, 1)).unwrap();
        let value = Value::Primitive {
            ty: int(),
            addr: stack.allocate(4).unwrap(),
        };
        stack.push(value).unwrap();
        assert_eq!(
            stack.push(value),
            Err(RuntimeError::EvalStackOverflow { limit: 1 })
        );
        assert_eq!(stack.pop(), Ok(value));
        assert_eq!(stack.pop(), Err(RuntimeError::EvalStackUnderflow));
    }

    #[test]
    fn scratch_grows_past_the_reservation() {
        let mut stack = StackManager::new(16, 1024);
        stack.allocate_frame(layout(4, 1)).unwrap();
        stack.allocate(4).unwrap();
        let extra = stack.allocate(100).unwrap();
        assert_eq!(extra, Address::stack(4));
        assert_eq!(stack.current().unwrap().size(), 104);
        stack.bytes_mut(extra, 100).unwrap().fill(7);
        assert!(matches!(
            stack.allocate(2048),
            Err(RuntimeError::StackOverflow { limit: 1024, .. })
        ));
    }

    #[test]
    fn popped_bytes_are_out_of_range() {
        let mut stack = StackManager::new(64, 1024);
        stack.allocate_frame(layout(8, 1)).unwrap();
        stack.allocate_frame(layout(8, 1)).unwrap();
        let addr = stack.allocate(4).unwrap();
        stack
            .bytes_mut(addr, 4)
            .unwrap()
            .copy_from_slice(&Scalar::I32(5).encode());
        stack.deallocate_frame().unwrap();
        assert!(stack.bytes(addr, 4).is_err());
    }

    #[test]
    fn reset_rewinds_scratch() {
        let mut stack = StackManager::new(64, 1024);
        stack.allocate_frame(layout(8, 2)).unwrap();
        let addr = stack.allocate(4).unwrap();
        stack.bytes_mut(addr, 4).unwrap().fill(1);
        stack.push(Value::Primitive { ty: int(), addr }).unwrap();
        let dropped = stack.reset_scratch().unwrap();
        assert_eq!(dropped.len(), 1);
        assert_eq!(stack.current().unwrap().depth(), 0);
        assert_eq!(stack.allocate(4).unwrap(), addr);
        assert_eq!(stack.bytes(addr, 4).unwrap(), &[0; 4]);
    }
}
