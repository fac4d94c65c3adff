use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

use crate::dtype::{DType, DTypeError};

#[derive(Debug, thiserror::Error)]
pub enum TensorDataError {
    #[error(transparent)]
    DType(#[from] DTypeError),
    #[error("Buffer of {0} bytes does not fit {1} elements of {2}")]
    BufferSizeMismatch(usize, usize, DType),
    #[error("Cannot reshape {0} elements into {1:?}")]
    ReshapeMismatch(usize, Vec<usize>),
    #[error("Expected {0} data, found {1}")]
    DTypeMismatch(DType, DType),
    #[error("Quantization parameters do not match tensor: {0}")]
    QuantizationMismatch(String),
    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

/// Runtime tensor storage, one ndarray per supported dtype.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TensorData {
    F32(ArrayD<f32>),
    I32(ArrayD<i32>),
    I64(ArrayD<i64>),
    U8(ArrayD<u8>),
    I8(ArrayD<i8>),
    Bool(ArrayD<bool>),
}

macro_rules! map_variants {
    ($value:expr, |$arr:ident| $body:expr) => {
        match $value {
            TensorData::F32($arr) => TensorData::F32($body),
            TensorData::I32($arr) => TensorData::I32($body),
            TensorData::I64($arr) => TensorData::I64($body),
            TensorData::U8($arr) => TensorData::U8($body),
            TensorData::I8($arr) => TensorData::I8($body),
            TensorData::Bool($arr) => TensorData::Bool($body),
        }
    };
}

fn vec_from_le<const N: usize, T>(data: &[u8], convert: impl Fn([u8; N]) -> T) -> Vec<T> {
    data.chunks_exact(N)
        .map(|chunk| convert(chunk.try_into().expect("chunks_exact yields N bytes")))
        .collect()
}

impl TensorData {
    pub fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::F32,
            TensorData::I32(_) => DType::I32,
            TensorData::I64(_) => DType::I64,
            TensorData::U8(_) => DType::U8,
            TensorData::I8(_) => DType::I8,
            TensorData::Bool(_) => DType::BOOL,
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            TensorData::F32(arr) => arr.shape(),
            TensorData::I32(arr) => arr.shape(),
            TensorData::I64(arr) => arr.shape(),
            TensorData::U8(arr) => arr.shape(),
            TensorData::I8(arr) => arr.shape(),
            TensorData::Bool(arr) => arr.shape(),
        }
    }

    pub fn num_elements(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn zeros(dtype: DType, shape: &[usize]) -> Result<Self, TensorDataError> {
        let dim = IxDyn(shape);
        Ok(match dtype {
            DType::F32 => TensorData::F32(ArrayD::zeros(dim)),
            DType::I32 => TensorData::I32(ArrayD::zeros(dim)),
            DType::I64 => TensorData::I64(ArrayD::zeros(dim)),
            DType::U8 => TensorData::U8(ArrayD::zeros(dim)),
            DType::I8 => TensorData::I8(ArrayD::zeros(dim)),
            DType::BOOL => TensorData::Bool(ArrayD::from_elem(dim, false)),
            other => Err(DTypeError::DTypeNotSupportedByRuntime(other))?,
        })
    }

    /// Builds a tensor from a little-endian buffer, e.g. a model constant.
    pub fn from_raw(dtype: DType, shape: &[usize], data: &[u8]) -> Result<Self, TensorDataError> {
        let numel: usize = shape.iter().product();
        if data.len() != numel * dtype.size() {
            return Err(TensorDataError::BufferSizeMismatch(
                data.len(),
                numel,
                dtype,
            ));
        }
        let dim = IxDyn(shape);
        Ok(match dtype {
            DType::F32 => {
                TensorData::F32(ArrayD::from_shape_vec(dim, vec_from_le(data, f32::from_le_bytes))?)
            }
            DType::I32 => {
                TensorData::I32(ArrayD::from_shape_vec(dim, vec_from_le(data, i32::from_le_bytes))?)
            }
            DType::I64 => {
                TensorData::I64(ArrayD::from_shape_vec(dim, vec_from_le(data, i64::from_le_bytes))?)
            }
            DType::U8 => TensorData::U8(ArrayD::from_shape_vec(dim, data.to_vec())?),
            DType::I8 => TensorData::I8(ArrayD::from_shape_vec(
                dim,
                bytemuck::cast_slice(data).to_vec(),
            )?),
            DType::BOOL => TensorData::Bool(ArrayD::from_shape_vec(
                dim,
                data.iter().map(|b| *b != 0).collect(),
            )?),
            other => Err(DTypeError::DTypeNotSupportedByRuntime(other))?,
        })
    }

    pub fn from_f32(shape: &[usize], values: &[f32]) -> Result<Self, TensorDataError> {
        Ok(TensorData::F32(ArrayD::from_shape_vec(
            IxDyn(shape),
            values.to_vec(),
        )?))
    }

    pub fn from_i32(shape: &[usize], values: &[i32]) -> Result<Self, TensorDataError> {
        Ok(TensorData::I32(ArrayD::from_shape_vec(
            IxDyn(shape),
            values.to_vec(),
        )?))
    }

    pub fn as_f32(&self) -> Result<&ArrayD<f32>, TensorDataError> {
        match self {
            TensorData::F32(arr) => Ok(arr),
            other => Err(TensorDataError::DTypeMismatch(DType::F32, other.dtype())),
        }
    }

    pub fn as_f32_mut(&mut self) -> Result<&mut ArrayD<f32>, TensorDataError> {
        match self {
            TensorData::F32(arr) => Ok(arr),
            other => Err(TensorDataError::DTypeMismatch(DType::F32, other.dtype())),
        }
    }

    pub fn to_f32_vec(&self) -> Result<Vec<f32>, TensorDataError> {
        Ok(self.as_f32()?.iter().cloned().collect())
    }

    /// Reads an integer tensor (shape operands, permutations, axes) as i64.
    pub fn to_index_vec(&self) -> Result<Vec<i64>, TensorDataError> {
        match self {
            TensorData::I32(arr) => Ok(arr.iter().map(|v| *v as i64).collect()),
            TensorData::I64(arr) => Ok(arr.iter().cloned().collect()),
            other => Err(TensorDataError::DTypeMismatch(DType::I64, other.dtype())),
        }
    }

    /// Reinterprets the elements in logical order under a new shape.
    pub fn reshaped(&self, target: &[usize]) -> Result<Self, TensorDataError> {
        let numel = self.num_elements();
        if target.iter().product::<usize>() != numel {
            return Err(TensorDataError::ReshapeMismatch(numel, target.to_vec()));
        }
        let dim = IxDyn(target);
        Ok(map_variants!(self, |arr| ArrayD::from_shape_vec(
            dim.clone(),
            arr.iter().cloned().collect()
        )?))
    }

    pub fn permuted(&self, axes: &[usize]) -> Self {
        map_variants!(self, |arr| arr
            .clone()
            .permuted_axes(IxDyn(axes))
            .as_standard_layout()
            .to_owned())
    }

    /// Expands a quantized tensor back to float32 using its stored
    /// parameters. Per-channel when `scale` has one entry per channel along
    /// `quantized_dimension`.
    pub fn dequantized(
        &self,
        scale: &[f32],
        zero_point: &[i64],
        quantized_dimension: usize,
    ) -> Result<Self, TensorDataError> {
        if scale.is_empty() || scale.len() != zero_point.len() {
            return Err(TensorDataError::QuantizationMismatch(format!(
                "{} scales, {} zero points",
                scale.len(),
                zero_point.len()
            )));
        }
        let shape = self.shape().to_vec();
        if scale.len() > 1 {
            if quantized_dimension >= shape.len() || shape[quantized_dimension] != scale.len() {
                return Err(TensorDataError::QuantizationMismatch(format!(
                    "{} scales along dimension {} of {:?}",
                    scale.len(),
                    quantized_dimension,
                    shape
                )));
            }
        }
        let channel_of = |idx: &IxDyn| {
            if scale.len() > 1 {
                idx[quantized_dimension]
            } else {
                0
            }
        };
        let out = match self {
            TensorData::U8(arr) => ArrayD::from_shape_fn(IxDyn(&shape), |idx| {
                let channel = channel_of(&idx);
                (arr[idx] as i64 - zero_point[channel]) as f32 * scale[channel]
            }),
            TensorData::I8(arr) => ArrayD::from_shape_fn(IxDyn(&shape), |idx| {
                let channel = channel_of(&idx);
                (arr[idx] as i64 - zero_point[channel]) as f32 * scale[channel]
            }),
            other => {
                return Err(TensorDataError::QuantizationMismatch(format!(
                    "dtype {} is not a quantized storage type",
                    other.dtype()
                )));
            }
        };
        Ok(TensorData::F32(out))
    }
}
