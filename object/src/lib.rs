mod descriptor;
mod registry;
mod scalar;
mod value;

pub use descriptor::{FieldLayout, REF_SIZE, TypeCategory, TypeDescriptor, TypeId};
pub use registry::{Builtins, TypeError, TypeRegistry};
pub use scalar::{ArithError, BinaryOp, Comparison, Scalar};
pub use value::{Address, Space, Value};
