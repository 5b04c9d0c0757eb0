use core::cmp::Ordering;
use core::fmt;

use bytecode::PrimitiveKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Or,
    And,
    Xor,
    Shl,
    Shr,
}

impl BinaryOp {
    pub const fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Rem => "%",
            Self::Or => "|",
            Self::And => "&",
            Self::Xor => "^",
            Self::Shl => "<<",
            Self::Shr => ">>",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Comparison {
    /// Evaluates the comparison given an ordering of left against right.
    pub fn holds(self, ordering: Option<Ordering>) -> bool {
        match (self, ordering) {
            (Self::Ne, None) => true,
            (_, None) => false,
            (Self::Eq, Some(o)) => o == Ordering::Equal,
            (Self::Ne, Some(o)) => o != Ordering::Equal,
            (Self::Gt, Some(o)) => o == Ordering::Greater,
            (Self::Ge, Some(o)) => o != Ordering::Less,
            (Self::Lt, Some(o)) => o == Ordering::Less,
            (Self::Le, Some(o)) => o != Ordering::Greater,
        }
    }

    pub const fn is_equality(self) -> bool {
        matches!(self, Self::Eq | Self::Ne)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithError {
    DivisionByZero,
    Unsupported { op: &'static str, kind: PrimitiveKind },
}

impl fmt::Display for ArithError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DivisionByZero => write!(f, "division by zero"),
            Self::Unsupported { op, kind } => {
                write!(f, "operator '{op}' is not defined for {}", kind.name())
            }
        }
    }
}

impl std::error::Error for ArithError {}

/// A decoded primitive value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    Bool(bool),
    Char(u16),
}

macro_rules! integer_binary {
    ($a:expr, $b:expr, $op:expr, $ctor:ident) => {{
        let (a, b) = ($a, $b);
        Scalar::$ctor(match $op {
            BinaryOp::Add => a.wrapping_add(b),
            BinaryOp::Sub => a.wrapping_sub(b),
            BinaryOp::Mul => a.wrapping_mul(b),
            BinaryOp::Div | BinaryOp::Rem if b == 0 => {
                return Err(ArithError::DivisionByZero);
            }
            BinaryOp::Div => a.wrapping_div(b),
            BinaryOp::Rem => a.wrapping_rem(b),
            BinaryOp::Or => a | b,
            BinaryOp::And => a & b,
            BinaryOp::Xor => a ^ b,
            BinaryOp::Shl => a.wrapping_shl(b as u32),
            BinaryOp::Shr => a.wrapping_shr(b as u32),
        })
    }};
}

macro_rules! float_binary {
    ($a:expr, $b:expr, $op:expr, $ctor:ident) => {{
        let (a, b) = ($a, $b);
        Scalar::$ctor(match $op {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Rem => a % b,
            other => {
                return Err(ArithError::Unsupported {
                    op: other.symbol(),
                    kind: Scalar::$ctor(a).kind(),
                });
            }
        })
    }};
}

impl Scalar {
    /// Decodes little-endian bytes; `None` when `bytes` is too short.
    pub fn decode(kind: PrimitiveKind, bytes: &[u8]) -> Option<Scalar> {
        let b = bytes.get(..kind.size())?;
        Some(match kind {
            PrimitiveKind::I8 => Scalar::I8(b[0] as i8),
            PrimitiveKind::U8 => Scalar::U8(b[0]),
            PrimitiveKind::Bool => Scalar::Bool(b[0] != 0),
            PrimitiveKind::I16 => Scalar::I16(i16::from_le_bytes([b[0], b[1]])),
            PrimitiveKind::U16 => Scalar::U16(u16::from_le_bytes([b[0], b[1]])),
            PrimitiveKind::Char => Scalar::Char(u16::from_le_bytes([b[0], b[1]])),
            PrimitiveKind::I32 => Scalar::I32(i32::from_le_bytes(b.try_into().ok()?)),
            PrimitiveKind::U32 => Scalar::U32(u32::from_le_bytes(b.try_into().ok()?)),
            PrimitiveKind::F32 => Scalar::F32(f32::from_le_bytes(b.try_into().ok()?)),
            PrimitiveKind::I64 => Scalar::I64(i64::from_le_bytes(b.try_into().ok()?)),
            PrimitiveKind::U64 => Scalar::U64(u64::from_le_bytes(b.try_into().ok()?)),
            PrimitiveKind::F64 => Scalar::F64(f64::from_le_bytes(b.try_into().ok()?)),
        })
    }

    /// Little-endian encoding, exactly `self.kind().size()` bytes long.
    pub fn encode(self) -> Vec<u8> {
        match self {
            Scalar::I8(v) => v.to_le_bytes().to_vec(),
            Scalar::U8(v) => vec![v],
            Scalar::Bool(v) => vec![v as u8],
            Scalar::I16(v) => v.to_le_bytes().to_vec(),
            Scalar::U16(v) | Scalar::Char(v) => v.to_le_bytes().to_vec(),
            Scalar::I32(v) => v.to_le_bytes().to_vec(),
            Scalar::U32(v) => v.to_le_bytes().to_vec(),
            Scalar::F32(v) => v.to_le_bytes().to_vec(),
            Scalar::I64(v) => v.to_le_bytes().to_vec(),
            Scalar::U64(v) => v.to_le_bytes().to_vec(),
            Scalar::F64(v) => v.to_le_bytes().to_vec(),
        }
    }

    pub const fn kind(self) -> PrimitiveKind {
        match self {
            Scalar::I8(_) => PrimitiveKind::I8,
            Scalar::U8(_) => PrimitiveKind::U8,
            Scalar::I16(_) => PrimitiveKind::I16,
            Scalar::U16(_) => PrimitiveKind::U16,
            Scalar::I32(_) => PrimitiveKind::I32,
            Scalar::U32(_) => PrimitiveKind::U32,
            Scalar::I64(_) => PrimitiveKind::I64,
            Scalar::U64(_) => PrimitiveKind::U64,
            Scalar::F32(_) => PrimitiveKind::F32,
            Scalar::F64(_) => PrimitiveKind::F64,
            Scalar::Bool(_) => PrimitiveKind::Bool,
            Scalar::Char(_) => PrimitiveKind::Char,
        }
    }

    /// Truthiness used by conditional branches: any non-zero value.
    pub fn is_truthy(self) -> bool {
        match self {
            Scalar::Bool(v) => v,
            Scalar::F32(v) => v != 0.0,
            Scalar::F64(v) => v != 0.0,
            other => other.to_i128() != 0,
        }
    }

    fn to_i128(self) -> i128 {
        match self {
            Scalar::I8(v) => v as i128,
            Scalar::U8(v) => v as i128,
            Scalar::I16(v) => v as i128,
            Scalar::U16(v) | Scalar::Char(v) => v as i128,
            Scalar::I32(v) => v as i128,
            Scalar::U32(v) => v as i128,
            Scalar::I64(v) => v as i128,
            Scalar::U64(v) => v as i128,
            Scalar::F32(v) => v as i128,
            Scalar::F64(v) => v as i128,
            Scalar::Bool(v) => v as i128,
        }
    }

    fn to_f64(self) -> f64 {
        match self {
            Scalar::F32(v) => v as f64,
            Scalar::F64(v) => v,
            other => other.to_i128() as f64,
        }
    }

    /// Numeric cast to `kind` with `as`-cast semantics (integers truncate,
    /// floats saturate when narrowed to integers).
    pub fn convert(self, kind: PrimitiveKind) -> Scalar {
        if self.kind() == kind {
            return self;
        }
        let i = self.to_i128();
        match kind {
            PrimitiveKind::I8 => Scalar::I8(i as i8),
            PrimitiveKind::U8 => Scalar::U8(i as u8),
            PrimitiveKind::I16 => Scalar::I16(i as i16),
            PrimitiveKind::U16 => Scalar::U16(i as u16),
            PrimitiveKind::I32 => Scalar::I32(i as i32),
            PrimitiveKind::U32 => Scalar::U32(i as u32),
            PrimitiveKind::I64 => Scalar::I64(i as i64),
            PrimitiveKind::U64 => Scalar::U64(i as u64),
            PrimitiveKind::Char => Scalar::Char(i as u16),
            PrimitiveKind::F32 => Scalar::F32(self.to_f64() as f32),
            PrimitiveKind::F64 => Scalar::F64(self.to_f64()),
            PrimitiveKind::Bool => Scalar::Bool(self.is_truthy()),
        }
    }

    /// Applies `op` with `self` on the left. The right operand is first
    /// converted to the left operand's kind; the result has that kind.
    pub fn binary(self, op: BinaryOp, rhs: Scalar) -> Result<Scalar, ArithError> {
        let rhs = rhs.convert(self.kind());
        Ok(match (self, rhs) {
            (Scalar::I8(a), Scalar::I8(b)) => integer_binary!(a, b, op, I8),
            (Scalar::U8(a), Scalar::U8(b)) => integer_binary!(a, b, op, U8),
            (Scalar::I16(a), Scalar::I16(b)) => integer_binary!(a, b, op, I16),
            (Scalar::U16(a), Scalar::U16(b)) => integer_binary!(a, b, op, U16),
            (Scalar::I32(a), Scalar::I32(b)) => integer_binary!(a, b, op, I32),
            (Scalar::U32(a), Scalar::U32(b)) => integer_binary!(a, b, op, U32),
            (Scalar::I64(a), Scalar::I64(b)) => integer_binary!(a, b, op, I64),
            (Scalar::U64(a), Scalar::U64(b)) => integer_binary!(a, b, op, U64),
            (Scalar::Char(a), Scalar::Char(b)) => integer_binary!(a, b, op, Char),
            (Scalar::F32(a), Scalar::F32(b)) => float_binary!(a, b, op, F32),
            (Scalar::F64(a), Scalar::F64(b)) => float_binary!(a, b, op, F64),
            (Scalar::Bool(a), Scalar::Bool(b)) => match op {
                BinaryOp::Or => Scalar::Bool(a | b),
                BinaryOp::And => Scalar::Bool(a & b),
                BinaryOp::Xor => Scalar::Bool(a ^ b),
                other => {
                    return Err(ArithError::Unsupported {
                        op: other.symbol(),
                        kind: PrimitiveKind::Bool,
                    });
                }
            },
            (lhs, _) => {
                return Err(ArithError::Unsupported {
                    op: op.symbol(),
                    kind: lhs.kind(),
                });
            }
        })
    }

    pub fn negate(self) -> Result<Scalar, ArithError> {
        Ok(match self {
            Scalar::I8(v) => Scalar::I8(v.wrapping_neg()),
            Scalar::U8(v) => Scalar::U8(v.wrapping_neg()),
            Scalar::I16(v) => Scalar::I16(v.wrapping_neg()),
            Scalar::U16(v) => Scalar::U16(v.wrapping_neg()),
            Scalar::I32(v) => Scalar::I32(v.wrapping_neg()),
            Scalar::U32(v) => Scalar::U32(v.wrapping_neg()),
            Scalar::I64(v) => Scalar::I64(v.wrapping_neg()),
            Scalar::U64(v) => Scalar::U64(v.wrapping_neg()),
            Scalar::F32(v) => Scalar::F32(-v),
            Scalar::F64(v) => Scalar::F64(-v),
            Scalar::Bool(_) | Scalar::Char(_) => {
                return Err(ArithError::Unsupported {
                    op: "-",
                    kind: self.kind(),
                });
            }
        })
    }

    /// Compares against `rhs` converted to this value's kind.
    pub fn compare(self, cmp: Comparison, rhs: Scalar) -> Result<bool, ArithError> {
        let rhs = rhs.convert(self.kind());
        let ordering = match (self, rhs) {
            (Scalar::Bool(a), Scalar::Bool(b)) => {
                if !cmp.is_equality() {
                    return Err(ArithError::Unsupported {
                        op: "<",
                        kind: PrimitiveKind::Bool,
                    });
                }
                Some(a.cmp(&b))
            }
            (Scalar::F32(a), Scalar::F32(b)) => a.partial_cmp(&b),
            (Scalar::F64(a), Scalar::F64(b)) => a.partial_cmp(&b),
            (a, b) => Some(a.to_i128().cmp(&b.to_i128())),
        };
        Ok(cmp.holds(ordering))
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Scalar::I8(v) => write!(f, "{v}"),
            Scalar::U8(v) => write!(f, "{v}"),
            Scalar::I16(v) => write!(f, "{v}"),
            Scalar::U16(v) => write!(f, "{v}"),
            Scalar::I32(v) => write!(f, "{v}"),
            Scalar::U32(v) => write!(f, "{v}"),
            Scalar::I64(v) => write!(f, "{v}"),
            Scalar::U64(v) => write!(f, "{v}"),
            Scalar::F32(v) => write!(f, "{v}"),
            Scalar::F64(v) => write!(f, "{v}"),
            Scalar::Bool(v) => write!(f, "{v}"),
            Scalar::Char(v) => {
                let c = char::decode_utf16([v])
                    .next()
                    .and_then(Result::ok)
                    .unwrap_or(char::REPLACEMENT_CHARACTER);
                write!(f, "{c}")
            }
        }
    }
}
