//! Scalar data types understood by the IR

use serde::{Deserialize, Serialize};

/// Scalar element type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalarType {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F16,
    BF16,
    TF32,
    F32,
    F64,
}

/// A literal value; unsigned types are kept apart so `u64::MAX` stays exact
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ConstValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
}

impl ConstValue {
    pub fn as_f64(self) -> f64 {
        match self {
            ConstValue::Bool(b) => {
                if b {
                    1.0
                } else {
                    0.0
                }
            }
            ConstValue::Int(v) => v as f64,
            ConstValue::UInt(v) => v as f64,
            ConstValue::Float(v) => v,
        }
    }

    pub fn as_i64(self) -> Option<i64> {
        match self {
            ConstValue::Bool(b) => Some(b as i64),
            ConstValue::Int(v) => Some(v),
            ConstValue::UInt(v) => i64::try_from(v).ok(),
            ConstValue::Float(_) => None,
        }
    }
}

impl std::fmt::Display for ConstValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConstValue::Bool(b) => write!(f, "{}", b),
            ConstValue::Int(v) => write!(f, "{}", v),
            ConstValue::UInt(v) => write!(f, "{}u", v),
            ConstValue::Float(v) => {
                if v.fract() == 0.0 && v.abs() < 1e16 {
                    write!(f, "{:.1}", v)
                } else {
                    write!(f, "{:e}", v)
                }
            }
        }
    }
}

impl ScalarType {
    pub const ALL: [ScalarType; 14] = [
        ScalarType::Bool,
        ScalarType::I8,
        ScalarType::I16,
        ScalarType::I32,
        ScalarType::I64,
        ScalarType::U8,
        ScalarType::U16,
        ScalarType::U32,
        ScalarType::U64,
        ScalarType::F16,
        ScalarType::BF16,
        ScalarType::TF32,
        ScalarType::F32,
        ScalarType::F64,
    ];

    /// Storage width in bits (tf32 occupies a full 32-bit register)
    pub fn nbits(self) -> usize {
        match self {
            ScalarType::Bool | ScalarType::I8 | ScalarType::U8 => 8,
            ScalarType::I16 | ScalarType::U16 | ScalarType::F16 | ScalarType::BF16 => 16,
            ScalarType::I32 | ScalarType::U32 | ScalarType::F32 | ScalarType::TF32 => 32,
            ScalarType::I64 | ScalarType::U64 | ScalarType::F64 => 64,
        }
    }

    pub fn nbytes(self) -> usize {
        self.nbits() / 8
    }

    pub fn is_float(self) -> bool {
        matches!(
            self,
            ScalarType::F16 | ScalarType::BF16 | ScalarType::TF32 | ScalarType::F32 | ScalarType::F64
        )
    }

    pub fn is_integer(self) -> bool {
        !self.is_float() && self != ScalarType::Bool
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            ScalarType::I8 | ScalarType::I16 | ScalarType::I32 | ScalarType::I64
        ) || self.is_float()
    }

    /// Short name used in instruction templates and the frontend
    pub fn short_name(self) -> &'static str {
        match self {
            ScalarType::Bool => "bool",
            ScalarType::I8 => "i8",
            ScalarType::I16 => "i16",
            ScalarType::I32 => "i32",
            ScalarType::I64 => "i64",
            ScalarType::U8 => "u8",
            ScalarType::U16 => "u16",
            ScalarType::U32 => "u32",
            ScalarType::U64 => "u64",
            ScalarType::F16 => "f16",
            ScalarType::BF16 => "bf16",
            ScalarType::TF32 => "tf32",
            ScalarType::F32 => "f32",
            ScalarType::F64 => "f64",
        }
    }

    /// C spelling used when rendering device code
    pub fn c_name(self) -> &'static str {
        match self {
            ScalarType::Bool => "bool",
            ScalarType::I8 => "int8_t",
            ScalarType::I16 => "int16_t",
            ScalarType::I32 => "int32_t",
            ScalarType::I64 => "int64_t",
            ScalarType::U8 => "uint8_t",
            ScalarType::U16 => "uint16_t",
            ScalarType::U32 => "uint32_t",
            ScalarType::U64 => "uint64_t",
            ScalarType::F16 => "half",
            ScalarType::BF16 => "nv_bfloat16",
            ScalarType::TF32 => "tfloat32_t",
            ScalarType::F32 => "float",
            ScalarType::F64 => "double",
        }
    }

    /// Accepts both short (`f32`) and long (`float32`) spellings
    pub fn from_name(name: &str) -> Option<Self> {
        let dtype = match name {
            "bool" => ScalarType::Bool,
            "i8" | "int8" => ScalarType::I8,
            "i16" | "int16" => ScalarType::I16,
            "i32" | "int32" => ScalarType::I32,
            "i64" | "int64" => ScalarType::I64,
            "u8" | "uint8" => ScalarType::U8,
            "u16" | "uint16" => ScalarType::U16,
            "u32" | "uint32" => ScalarType::U32,
            "u64" | "uint64" => ScalarType::U64,
            "f16" | "float16" => ScalarType::F16,
            "bf16" | "bfloat16" => ScalarType::BF16,
            "tf32" | "tfloat32" => ScalarType::TF32,
            "f32" | "float32" => ScalarType::F32,
            "f64" | "float64" => ScalarType::F64,
            _ => return None,
        };
        Some(dtype)
    }

    pub fn zero(self) -> ConstValue {
        self.from_i64(0)
    }

    pub fn one(self) -> ConstValue {
        self.from_i64(1)
    }

    /// Convert an integer literal into this type's value domain
    pub fn from_i64(self, value: i64) -> ConstValue {
        if self == ScalarType::Bool {
            ConstValue::Bool(value != 0)
        } else if self.is_float() {
            ConstValue::Float(value as f64)
        } else if self.is_signed() {
            ConstValue::Int(value)
        } else {
            ConstValue::UInt(value.max(0) as u64)
        }
    }

    /// Lowest finite value
    pub fn min_value(self) -> ConstValue {
        match self {
            ScalarType::Bool => ConstValue::Bool(false),
            ScalarType::I8 => ConstValue::Int(i8::MIN as i64),
            ScalarType::I16 => ConstValue::Int(i16::MIN as i64),
            ScalarType::I32 => ConstValue::Int(i32::MIN as i64),
            ScalarType::I64 => ConstValue::Int(i64::MIN),
            ScalarType::U8 | ScalarType::U16 | ScalarType::U32 | ScalarType::U64 => {
                ConstValue::UInt(0)
            }
            ScalarType::F16 => ConstValue::Float(-65504.0),
            ScalarType::BF16 => ConstValue::Float(-3.389_531_4e38),
            ScalarType::TF32 | ScalarType::F32 => ConstValue::Float(f32::MIN as f64),
            ScalarType::F64 => ConstValue::Float(f64::MIN),
        }
    }

    /// Highest finite value
    pub fn max_value(self) -> ConstValue {
        match self {
            ScalarType::Bool => ConstValue::Bool(true),
            ScalarType::I8 => ConstValue::Int(i8::MAX as i64),
            ScalarType::I16 => ConstValue::Int(i16::MAX as i64),
            ScalarType::I32 => ConstValue::Int(i32::MAX as i64),
            ScalarType::I64 => ConstValue::Int(i64::MAX),
            ScalarType::U8 => ConstValue::UInt(u8::MAX as u64),
            ScalarType::U16 => ConstValue::UInt(u16::MAX as u64),
            ScalarType::U32 => ConstValue::UInt(u32::MAX as u64),
            ScalarType::U64 => ConstValue::UInt(u64::MAX),
            ScalarType::F16 => ConstValue::Float(65504.0),
            ScalarType::BF16 => ConstValue::Float(3.389_531_4e38),
            ScalarType::TF32 | ScalarType::F32 => ConstValue::Float(f32::MAX as f64),
            ScalarType::F64 => ConstValue::Float(f64::MAX),
        }
    }

    /// Result type of an arithmetic operation on two operands
    pub fn promote(self, other: ScalarType) -> ScalarType {
        if self == other {
            return self;
        }
        match (self.is_float(), other.is_float()) {
            (true, false) => self,
            (false, true) => other,
            (true, true) => {
                // f16 and bf16 have no common 16-bit type
                if self.nbits() == other.nbits() {
                    ScalarType::F32
                } else if self.nbits() > other.nbits() {
                    self
                } else {
                    other
                }
            }
            (false, false) => {
                if self == ScalarType::Bool {
                    other
                } else if other == ScalarType::Bool {
                    self
                } else if self.nbits() != other.nbits() {
                    if self.nbits() > other.nbits() {
                        self
                    } else {
                        other
                    }
                } else if self.is_signed() {
                    self
                } else {
                    other
                }
            }
        }
    }
}

impl std::fmt::Display for ScalarType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.short_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_round_trip() {
        for dtype in ScalarType::ALL {
            assert_eq!(ScalarType::from_name(dtype.short_name()), Some(dtype));
        }
        assert_eq!(ScalarType::from_name("float32"), Some(ScalarType::F32));
        assert_eq!(ScalarType::from_name("f8"), None);
    }

    #[test]
    fn test_widths() {
        assert_eq!(ScalarType::F16.nbits(), 16);
        assert_eq!(ScalarType::TF32.nbits(), 32);
        assert_eq!(ScalarType::U64.nbytes(), 8);
    }

    #[test]
    fn test_promotion() {
        assert_eq!(ScalarType::I32.promote(ScalarType::F32), ScalarType::F32);
        assert_eq!(ScalarType::F16.promote(ScalarType::BF16), ScalarType::F32);
        assert_eq!(ScalarType::I32.promote(ScalarType::I64), ScalarType::I64);
        assert_eq!(ScalarType::U32.promote(ScalarType::I32), ScalarType::I32);
        assert_eq!(ScalarType::Bool.promote(ScalarType::U8), ScalarType::U8);
    }

    #[test]
    fn test_extreme_values() {
        assert_eq!(ScalarType::I32.min_value(), ConstValue::Int(-2147483648));
        assert_eq!(ScalarType::U64.max_value(), ConstValue::UInt(u64::MAX));
        assert_eq!(ScalarType::F16.min_value(), ConstValue::Float(-65504.0));
    }
}
