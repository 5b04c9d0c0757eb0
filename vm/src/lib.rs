pub mod demos;
pub mod error;
pub mod interpreter;
pub mod liveness;
pub mod memory;
pub mod natives;
pub mod stack;
pub mod stack_effect;

use std::collections::HashMap;
use std::sync::Arc;

use bytecode::Module;
use heap::{Heap, HeapSettings, ObjectKind};
use log::debug;
use object::{Address, TypeId, TypeRegistry, Value};
use parking_lot::Mutex;

pub use error::RuntimeError;
pub use interpreter::InvocationRequest;
pub use natives::{NativeFn, NativeMethod, NativeRegistry};
pub use stack::{Binding, FrameLayout, StackFrame, StackManager};
pub use stack_effect::{StackSize, resolve_stack_size};

/// Nested invocations allowed before a call faults. Each guest call also
/// nests a few native frames, so this stays well inside a 2 MB thread
/// stack even in unoptimised builds.
pub const MAX_CALL_DEPTH: usize = 256;

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub heap: HeapSettings,
    /// Stack arena reserved up front, in bytes.
    pub stack_size: usize,
    /// Hard cap on the stack arena.
    pub max_stack_size: usize,
    pub max_call_depth: usize,
    /// Scratch bytes and evaluation slots given to the host frame.
    pub host_scratch: usize,
    pub host_depth: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            heap: HeapSettings::default(),
            stack_size: 65_536,         // 64 KB
            max_stack_size: 8_388_608,  // 8 MB
            max_call_depth: MAX_CALL_DEPTH,
            host_scratch: 1_024,
            host_depth: 256,
        }
    }
}

/// Lines printed by running programs, shared between host and runtime.
#[derive(Debug, Clone, Default)]
pub struct OutputSink(Arc<Mutex<Vec<String>>>);

impl OutputSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_line(&self, line: String) {
        self.0.lock().push(line);
    }

    pub fn lines(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    /// Drains everything printed so far.
    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock())
    }
}

/// Everything one program execution owns: type table, heap, frames,
/// static storage and native bindings.
pub struct Runtime {
    module: Arc<Module>,
    pub types: TypeRegistry,
    pub heap: Heap,
    pub stack: StackManager,
    /// Static field block of each type that declares static fields.
    statics: HashMap<TypeId, Address>,
    pub natives: NativeRegistry,
    output: OutputSink,
    settings: RuntimeSettings,
    /// Values held by the runtime between frames, e.g. a return value
    /// while the callee's locals are being released.
    in_flight: Vec<Value>,
}

impl Runtime {
    pub fn new(
        module: impl Into<Arc<Module>>,
        settings: RuntimeSettings,
    ) -> Result<Self, RuntimeError> {
        let module = module.into();
        let types = TypeRegistry::from_module(&module)?;
        let mut heap = Heap::new(settings.heap.clone())?;

        let mut statics = HashMap::new();
        for desc in types.iter().filter(|d| d.static_size > 0) {
            let block =
                heap.allocate(desc.static_size, desc.id, ObjectKind::Statics)?;
            debug!("static block for '{}' at {block}", desc.name);
            statics.insert(desc.id, block);
        }

        let mut stack =
            StackManager::new(settings.stack_size, settings.max_stack_size);
        stack.allocate_frame(FrameLayout {
            total_size: settings.host_scratch,
            max_depth: settings.host_depth,
            ..FrameLayout::default()
        })?;

        Ok(Self {
            module,
            types,
            heap,
            stack,
            statics,
            natives: NativeRegistry::with_defaults(),
            output: OutputSink::new(),
            settings,
            in_flight: Vec::new(),
        })
    }

    /// Replaces the output sink, e.g. to share one with the host.
    pub fn with_output(mut self, output: OutputSink) -> Self {
        self.output = output;
        self
    }

    pub fn module(&self) -> &Arc<Module> {
        &self.module
    }

    pub fn output(&self) -> &OutputSink {
        &self.output
    }

    pub fn settings(&self) -> &RuntimeSettings {
        &self.settings
    }

    /// Static field block of `ty`, if the type has static fields.
    pub fn statics_of(&self, ty: TypeId) -> Option<Address> {
        self.statics.get(&ty).copied()
    }

    /// Drops every value the host frame holds and rewinds its scratch.
    /// Only valid between invocations.
    pub fn clear_host_frame(&mut self) -> Result<(), RuntimeError> {
        if self.stack.depth() != 1 {
            return Err(RuntimeError::HostFrameBusy {
                depth: self.stack.depth(),
            });
        }
        let mut held = Vec::new();
        for value in self.stack.current()?.values() {
            held.extend(self.owned_targets(*value)?);
        }
        let dropped = self.stack.reset_scratch()?;
        debug!("host frame cleared: {} values dropped", dropped.len());
        self.release_unreferenced(held)
    }

    /// Keeps a value on the host frame so liveness checks see it as bound.
    pub fn retain(&mut self, value: Value) -> Result<(), RuntimeError> {
        self.stack.push(value)
    }
}
