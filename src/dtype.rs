use half::{bf16, f16};
use serde::{Deserialize, Serialize};

use crate::lite;

#[derive(Debug, thiserror::Error)]
pub enum DTypeError {
    #[error("The runtime does not support the dtype {0}")]
    DTypeNotSupportedByRuntime(DType),
    #[error("The serialized tensor type {0} is not supported")]
    UnsupportedTensorType(i32),
}

#[derive(
    Copy,
    Clone,
    Debug,
    Hash,
    Eq,
    PartialEq,
    PartialOrd,
    Serialize,
    Deserialize,
    strum_macros::Display,
)]
pub enum DType {
    #[strum(serialize = "Float64")]
    F64,
    #[strum(serialize = "Float32")]
    F32,
    #[strum(serialize = "BFloat16")]
    BF16,
    #[strum(serialize = "Float16")]
    F16,
    #[strum(serialize = "Int64")]
    I64,
    #[strum(serialize = "Int32")]
    I32,
    #[strum(serialize = "Int16")]
    I16,
    #[strum(serialize = "UInt8")]
    U8,
    #[strum(serialize = "Int8")]
    I8,
    #[strum(serialize = "Bool")]
    BOOL,
}

impl DType {
    pub fn size(&self) -> usize {
        match self {
            DType::F64 => 8,
            DType::F32 => 4,
            DType::BF16 => 2,
            DType::F16 => 2,
            DType::I64 => 8,
            DType::I32 => 4,
            DType::I16 => 2,
            DType::U8 => 1,
            DType::I8 => 1,
            DType::BOOL => 1,
        }
    }

    /// Decodes the raw enum field of a serialized tensor.
    pub fn from_serialized(raw: i32) -> Result<Self, DTypeError> {
        let ttype =
            lite::TensorType::try_from(raw).map_err(|_| DTypeError::UnsupportedTensorType(raw))?;
        Self::try_from(ttype)
    }
}

impl TryFrom<lite::TensorType> for DType {
    type Error = DTypeError;
    fn try_from(ttype: lite::TensorType) -> Result<Self, DTypeError> {
        Ok(match ttype {
            lite::TensorType::Float64 => DType::F64,
            lite::TensorType::Float32 => DType::F32,
            lite::TensorType::Bfloat16 => DType::BF16,
            lite::TensorType::Float16 => DType::F16,
            lite::TensorType::Int64 => DType::I64,
            lite::TensorType::Int32 => DType::I32,
            lite::TensorType::Int16 => DType::I16,
            lite::TensorType::Uint8 => DType::U8,
            lite::TensorType::Int8 => DType::I8,
            lite::TensorType::Bool => DType::BOOL,
        })
    }
}

impl From<DType> for lite::TensorType {
    fn from(dtype: DType) -> Self {
        match dtype {
            DType::F64 => lite::TensorType::Float64,
            DType::F32 => lite::TensorType::Float32,
            DType::BF16 => lite::TensorType::Bfloat16,
            DType::F16 => lite::TensorType::Float16,
            DType::I64 => lite::TensorType::Int64,
            DType::I32 => lite::TensorType::Int32,
            DType::I16 => lite::TensorType::Int16,
            DType::U8 => lite::TensorType::Uint8,
            DType::I8 => lite::TensorType::Int8,
            DType::BOOL => lite::TensorType::Bool,
        }
    }
}

pub trait DTypeOfPrimitive {
    const DTYPE: DType;
}

impl DTypeOfPrimitive for f64 { const DTYPE: DType = DType::F64; }
impl DTypeOfPrimitive for f32 { const DTYPE: DType = DType::F32; }
impl DTypeOfPrimitive for bf16 { const DTYPE: DType = DType::BF16; }
impl DTypeOfPrimitive for f16 { const DTYPE: DType = DType::F16; }
impl DTypeOfPrimitive for i64 { const DTYPE: DType = DType::I64; }
impl DTypeOfPrimitive for i32 { const DTYPE: DType = DType::I32; }
impl DTypeOfPrimitive for i16 { const DTYPE: DType = DType::I16; }
impl DTypeOfPrimitive for u8 { const DTYPE: DType = DType::U8; }
impl DTypeOfPrimitive for i8 { const DTYPE: DType = DType::I8; }
impl DTypeOfPrimitive for bool { const DTYPE: DType = DType::BOOL; }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialized_round_trip() {
        for dtype in [
            DType::F64,
            DType::F32,
            DType::BF16,
            DType::F16,
            DType::I64,
            DType::I32,
            DType::I16,
            DType::U8,
            DType::I8,
            DType::BOOL,
        ] {
            let ttype = lite::TensorType::from(dtype);
            assert_eq!(DType::try_from(ttype).unwrap(), dtype);
        }
    }

    #[test]
    fn unknown_serialized_type_is_rejected() {
        assert!(matches!(
            DType::from_serialized(99),
            Err(DTypeError::UnsupportedTensorType(99))
        ));
    }

    #[test]
    fn display_names() {
        assert_eq!(DType::F32.to_string(), "Float32");
        assert_eq!(DType::BOOL.to_string(), "Bool");
    }
}
