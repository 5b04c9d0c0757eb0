//! Host-implemented methods.
//!
//! Methods flagged native in the module are never interpreted. The runtime
//! looks them up here by declaring type name and method name and calls the
//! bound function with the instance and positional arguments.

use std::collections::HashMap;

use object::Value;

use crate::{Runtime, RuntimeError};

pub mod system;

pub type NativeFn =
    fn(&mut Runtime, Option<Value>, &[Value]) -> Result<Option<Value>, RuntimeError>;

#[derive(Clone, Copy)]
pub struct NativeMethod {
    pub type_name: &'static str,
    pub name: &'static str,
    pub arity: u8,
    /// Scratch bytes the function may carve from the caller's frame.
    pub scratch_reserve: usize,
    pub func: NativeFn,
}

impl NativeMethod {
    pub const fn new(
        type_name: &'static str,
        name: &'static str,
        arity: u8,
        scratch_reserve: usize,
        func: NativeFn,
    ) -> Self {
        Self {
            type_name,
            name,
            arity,
            scratch_reserve,
            func,
        }
    }
}

impl std::fmt::Debug for NativeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}/{}", self.type_name, self.name, self.arity)
    }
}

pub fn default_natives() -> Vec<NativeMethod> {
    vec![
        NativeMethod::new("system", "Print", 1, 0, system::print),
        NativeMethod::new("system", "Length", 1, 4, system::length),
        NativeMethod::new("system", "Concat", 2, 0, system::concat),
    ]
}

/// Drops a generic suffix: `List`1` becomes `List`.
fn strip_template(name: &str) -> &str {
    name.split_once('`').map_or(name, |(base, _)| base)
}

#[derive(Debug, Default)]
pub struct NativeRegistry {
    table: HashMap<(String, String), NativeMethod>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for native in default_natives() {
            registry.register(native);
        }
        registry
    }

    /// Adds or replaces a binding.
    pub fn register(&mut self, native: NativeMethod) {
        let key = (
            native.type_name.to_string(),
            strip_template(native.name).to_string(),
        );
        self.table.insert(key, native);
    }

    pub fn lookup(&self, type_name: &str, name: &str) -> Option<&NativeMethod> {
        self.table.get(&(
            strip_template(type_name).to_string(),
            strip_template(name).to_string(),
        ))
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

pub(crate) fn native_error(method: &str, message: impl Into<String>) -> RuntimeError {
    RuntimeError::Native {
        method: method.to_string(),
        message: message.into(),
    }
}

pub(crate) fn expect_string(
    rt: &Runtime,
    method: &str,
    value: Value,
) -> Result<String, RuntimeError> {
    match value {
        Value::String { .. } => rt.read_string(value),
        other => Err(native_error(
            method,
            format!("expected string argument, got {}", other.kind_name()),
        )),
    }
}
