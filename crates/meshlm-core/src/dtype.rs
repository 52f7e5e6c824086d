use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

// DType: numeric precision of a tensor
//
// Tensors keep their elements as f64 on the host and round every produced
// value to the precision of their DType. That gives the numerics of reduced
// precision storage and compute without a typed storage per precision:
//
//   F16: 16-bit IEEE half float
//   BF16: 16-bit brain float, the usual activation dtype on accelerators
//   F32: 32-bit float, the default workhorse
//   F64: 64-bit float, used by tests that compare numerics tightly
//   I64: integer ids (tokens, labels); values are truncated toward zero
//
// VARIABLE PRECISION TRIPLE
//
// A trainable variable carries three dtypes (VariableDType):
//
//   storage: what the variable is stored and checkpointed as
//   update: gradient accumulation and optimizer arithmetic
//   activation: forward/backward compute that reads the variable

/// Enum of all supported element data types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F16,
    BF16,
    F32,
    F64,
    I64,
}

impl DType {
    /// Size of one element in bytes when serialized.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F16 | DType::BF16 => 2,
            DType::F32 => 4,
            DType::F64 | DType::I64 => 8,
        }
    }

    /// Whether this dtype is a floating-point type (needed for gradient tracking).
    pub fn is_float(&self) -> bool {
        !matches!(self, DType::I64)
    }

    /// Whether this is a half-precision type (F16 or BF16).
    pub fn is_half(&self) -> bool {
        matches!(self, DType::F16 | DType::BF16)
    }

    /// Round a host value to this precision.
    #[inline]
    pub fn round(&self, v: f64) -> f64 {
        match self {
            DType::F16 => half::f16::from_f64(v).to_f64(),
            DType::BF16 => half::bf16::from_f64(v).to_f64(),
            DType::F32 => v as f32 as f64,
            DType::F64 => v,
            DType::I64 => v.trunc(),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            DType::I64 => 0,
            DType::F16 | DType::BF16 => 1,
            DType::F32 => 2,
            DType::F64 => 3,
        }
    }

    /// Result dtype of a binary op between `self` and `other`.
    ///
    /// The more precise type wins; mixing the two half types widens to F32.
    pub fn promote(self, other: DType) -> DType {
        if self == other {
            return self;
        }
        if self.is_half() && other.is_half() {
            return DType::F32;
        }
        if self.rank() >= other.rank() {
            self
        } else {
            other
        }
    }

    /// Widen to at least F32. Logits and losses are computed at this precision.
    pub fn at_least_f32(self) -> DType {
        match self {
            DType::F64 => DType::F64,
            _ => DType::F32,
        }
    }

    /// Tag used by the checkpoint format.
    pub fn to_u8(self) -> u8 {
        match self {
            DType::F16 => 0,
            DType::BF16 => 1,
            DType::F32 => 2,
            DType::F64 => 3,
            DType::I64 => 4,
        }
    }

    pub fn from_u8(v: u8) -> Result<DType> {
        Ok(match v {
            0 => DType::F16,
            1 => DType::BF16,
            2 => DType::F32,
            3 => DType::F64,
            4 => DType::I64,
            other => return Err(Error::msg(format!("unknown dtype tag {other}"))),
        })
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F16 => "float16",
            DType::BF16 => "bfloat16",
            DType::F32 => "float32",
            DType::F64 => "float64",
            DType::I64 => "int64",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for DType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "float16" | "f16" => Ok(DType::F16),
            "bfloat16" | "bf16" => Ok(DType::BF16),
            "float32" | "f32" => Ok(DType::F32),
            "float64" | "f64" => Ok(DType::F64),
            "int64" | "i64" => Ok(DType::I64),
            other => Err(Error::config(format!("unknown dtype '{other}'"))),
        }
    }
}

/// Precision triple of a trainable variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VariableDType {
    pub storage: DType,
    pub update: DType,
    pub activation: DType,
}

impl VariableDType {
    pub fn new(storage: DType, update: DType, activation: DType) -> Self {
        Self {
            storage,
            update,
            activation,
        }
    }

    /// All three roles at the same precision.
    pub fn uniform(dtype: DType) -> Self {
        Self::new(dtype, dtype, dtype)
    }

    /// Preset for the `precision` configuration string.
    ///
    /// `"float32"` keeps everything in F32. `"bfloat16"` keeps F32 master
    /// weights and optimizer math with BF16 activations.
    pub fn from_preset(name: &str) -> Result<Self> {
        match name {
            "bfloat16" | "bf16" => Ok(Self::new(DType::F32, DType::F32, DType::BF16)),
            "float16" | "f16" => Ok(Self::new(DType::F32, DType::F32, DType::F16)),
            other => Ok(Self::uniform(other.parse()?)),
        }
    }
}

impl Default for VariableDType {
    fn default() -> Self {
        Self::uniform(DType::F32)
    }
}
