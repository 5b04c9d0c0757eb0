use core::fmt;

use bytecode::{Instruction, Op};
use heap::HeapError;
use object::{ArithError, TypeError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    // ── Resolution ────────────────────────────────────────────────────
    Type(TypeError),
    UnknownMethod(u32),
    UnknownConstant(i32),
    UnknownLocal(i32),
    UnknownArgument(i32),
    UnknownMemberRef(i32),
    UnknownTypeRef(i32),
    NotAField(i32),
    NotAMethod(i32),
    StaticMismatch { field: String, expected_static: bool },
    MissingTypeToken { op: Op },
    BranchOutOfRange { target: i32 },
    UnknownNative { type_name: String, method: String },
    NotConstructible(String),

    // ── Stack discipline ──────────────────────────────────────────────
    EvalStackUnderflow,
    EvalStackOverflow { limit: usize },
    FrameUnderflow,
    HostFrameBusy { depth: usize },
    StackOverflow { requested: usize, limit: usize },
    CallDepthExceeded { limit: usize },
    EmptyStackOnReturn,
    StackNotDrained { remaining: usize },
    VoidReturnWithValues { remaining: usize },

    // ── Invocation contract ───────────────────────────────────────────
    MissingInstance { method: String },
    UnexpectedInstance { method: String },
    ArgumentCountMismatch { method: String, expected: usize, got: usize },

    // ── Value shape ───────────────────────────────────────────────────
    UnexpectedValue { expected: &'static str, got: &'static str },
    SizeMismatch { expected: usize, got: usize },
    NoInstance,
    NullReference,
    NegativeArrayLength(i64),

    // ── Arithmetic ────────────────────────────────────────────────────
    DivisionByZero,
    UnsupportedOperation { op: &'static str, operand: String },

    // ── Heap liveness ─────────────────────────────────────────────────
    Heap(HeapError),

    // ── Native bridge ─────────────────────────────────────────────────
    Native { method: String, message: String },

    /// An instruction failed; carries where.
    Fault {
        method: String,
        index: usize,
        instruction: Instruction,
        error: Box<RuntimeError>,
    },
}

impl RuntimeError {
    /// The innermost error, with every [`RuntimeError::Fault`] wrapper
    /// removed.
    pub fn root_cause(&self) -> &RuntimeError {
        let mut err = self;
        while let RuntimeError::Fault { error, .. } = err {
            err = error;
        }
        err
    }

    pub(crate) fn unexpected(expected: &'static str, got: object::Value) -> Self {
        RuntimeError::UnexpectedValue {
            expected,
            got: got.kind_name(),
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Type(err) => write!(f, "{err}"),
            Self::UnknownMethod(idx) => write!(f, "unknown method #{idx}"),
            Self::UnknownConstant(idx) => write!(f, "unknown constant #{idx}"),
            Self::UnknownLocal(idx) => write!(f, "unknown local #{idx}"),
            Self::UnknownArgument(idx) => write!(f, "unknown argument #{idx}"),
            Self::UnknownMemberRef(idx) => {
                write!(f, "unknown member reference #{idx}")
            }
            Self::UnknownTypeRef(idx) => {
                write!(f, "unknown type reference #{idx}")
            }
            Self::NotAField(idx) => {
                write!(f, "member reference #{idx} does not name a field")
            }
            Self::NotAMethod(idx) => {
                write!(f, "member reference #{idx} does not name a method")
            }
            Self::StaticMismatch {
                field,
                expected_static: true,
            } => write!(f, "field '{field}' is not static"),
            Self::StaticMismatch { field, .. } => {
                write!(f, "field '{field}' is static")
            }
            Self::MissingTypeToken { op } => {
                write!(f, "{} requires a preceding ldtype", op.mnemonic())
            }
            Self::BranchOutOfRange { target } => {
                write!(f, "branch target @{target} is out of range")
            }
            Self::UnknownNative { type_name, method } => {
                write!(f, "no native implementation for {type_name}::{method}")
            }
            Self::NotConstructible(name) => {
                write!(f, "type '{name}' cannot be constructed with newobj")
            }
            Self::EvalStackUnderflow => write!(f, "evaluation stack underflow"),
            Self::EvalStackOverflow { limit } => {
                write!(f, "evaluation stack overflow (limit {limit})")
            }
            Self::FrameUnderflow => write!(f, "no active stack frame"),
            Self::HostFrameBusy { depth } => {
                write!(f, "host frame is not active ({depth} frames on the stack)")
            }
            Self::StackOverflow { requested, limit } => write!(
                f,
                "stack arena exhausted: need {requested} bytes (limit {limit})"
            ),
            Self::CallDepthExceeded { limit } => {
                write!(f, "call depth exceeded {limit} frames")
            }
            Self::EmptyStackOnReturn => {
                write!(f, "empty evaluation stack on non-void return")
            }
            Self::StackNotDrained { remaining } => write!(
                f,
                "evaluation stack not drained on return ({remaining} items)"
            ),
            Self::VoidReturnWithValues { remaining } => write!(
                f,
                "void method returned with {remaining} items on the stack"
            ),
            Self::MissingInstance { method } => {
                write!(f, "instance method '{method}' invoked without instance")
            }
            Self::UnexpectedInstance { method } => {
                write!(f, "static method '{method}' invoked with an instance")
            }
            Self::ArgumentCountMismatch {
                method,
                expected,
                got,
            } => write!(
                f,
                "method '{method}' expects {expected} arguments, got {got}"
            ),
            Self::UnexpectedValue { expected, got } => {
                write!(f, "unexpected value: expected {expected}, got {got}")
            }
            Self::SizeMismatch { expected, got } => write!(
                f,
                "value of {got} bytes does not fit a {expected}-byte slot"
            ),
            Self::NoInstance => write!(f, "no instance bound in static context"),
            Self::NullReference => write!(f, "null reference"),
            Self::NegativeArrayLength(len) => {
                write!(f, "negative array length {len}")
            }
            Self::DivisionByZero => write!(f, "division by zero"),
            Self::UnsupportedOperation { op, operand } => {
                write!(f, "operator '{op}' is not defined for {operand}")
            }
            Self::Heap(err) => write!(f, "{err}"),
            Self::Native { method, message } => {
                write!(f, "native {method}: {message}")
            }
            Self::Fault {
                method,
                index,
                instruction,
                error,
            } => write!(f, "{method}@{index} `{instruction}`: {error}"),
        }
    }
}

impl std::error::Error for RuntimeError {}

impl From<HeapError> for RuntimeError {
    fn from(err: HeapError) -> Self {
        RuntimeError::Heap(err)
    }
}

impl From<TypeError> for RuntimeError {
    fn from(err: TypeError) -> Self {
        RuntimeError::Type(err)
    }
}

impl From<ArithError> for RuntimeError {
    fn from(err: ArithError) -> Self {
        match err {
            ArithError::DivisionByZero => RuntimeError::DivisionByZero,
            ArithError::Unsupported { op, kind } => {
                RuntimeError::UnsupportedOperation {
                    op,
                    operand: kind.name().to_string(),
                }
            }
        }
    }
}
