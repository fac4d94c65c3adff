mod ops;

use std::collections::HashMap;

use crate::dtype::{DType, DTypeError};
use crate::lite;
use crate::model::LiteModel;
use crate::tensor::{TensorData, TensorDataError};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    DType(#[from] DTypeError),
    #[error(transparent)]
    TensorData(#[from] TensorDataError),
    #[error("Unknown tensor \"{0}\"")]
    UnknownTensor(String),
    #[error("Tensor \"{0}\" is not a model input")]
    NotAnInput(String),
    #[error("Input \"{0}\": shape {1:?} does not match declared {2:?}")]
    ResizeMismatch(String, Vec<usize>, Vec<i32>),
    #[error("Input \"{0}\" has unresolved dimensions; resize it before allocation")]
    UnresolvedInputShape(String),
    #[error("allocate_tensors must run first")]
    NotAllocated,
    #[error("Tensor \"{0}\" has not been computed")]
    NotComputed(String),
    #[error("Custom operator \"{0}\" is not supported by this runtime")]
    CustomOpNotSupported(String),
    #[error("Operator {0:?} is not supported by this runtime")]
    UnsupportedBuiltin(lite::BuiltinOperator),
    #[error("{op}: {message}")]
    Kernel { op: &'static str, message: String },
}

pub(crate) fn kernel_error(op: &'static str, message: impl Into<String>) -> RuntimeError {
    RuntimeError::Kernel {
        op,
        message: message.into(),
    }
}

/// Executes a [`LiteModel`]: resize inputs carrying unknown dimensions,
/// allocate, fill inputs, invoke, read outputs.
pub struct Interpreter {
    model: LiteModel,
    tensors: Vec<Option<TensorData>>,
    resized: HashMap<usize, Vec<usize>>,
    allocated: bool,
}

impl Interpreter {
    pub fn new(model: LiteModel) -> Self {
        let slots = model.subgraph().tensors.len();
        Self {
            model,
            tensors: vec![None; slots],
            resized: HashMap::new(),
            allocated: false,
        }
    }

    pub fn model(&self) -> &LiteModel {
        &self.model
    }

    fn tensor_index(&self, name: &str) -> Result<usize, RuntimeError> {
        self.model
            .tensor_index(name)
            .ok_or_else(|| RuntimeError::UnknownTensor(name.to_string()))
    }

    fn is_input(&self, index: usize) -> bool {
        self.model.subgraph().inputs.contains(&(index as i32))
    }

    /// Fixes the shape of an input tensor, replacing unknown dimensions.
    /// Dimensions the model declares concretely must match.
    pub fn resize_input(&mut self, name: &str, shape: &[usize]) -> Result<(), RuntimeError> {
        let index = self.tensor_index(name)?;
        if !self.is_input(index) {
            return Err(RuntimeError::NotAnInput(name.to_string()));
        }
        let declared = &self.model.subgraph().tensors[index];
        if !declared.unknown_rank {
            let compatible = declared.shape.len() == shape.len()
                && declared
                    .shape
                    .iter()
                    .zip(shape)
                    .all(|(decl, actual)| *decl < 0 || *decl as usize == *actual);
            if !compatible {
                return Err(RuntimeError::ResizeMismatch(
                    name.to_string(),
                    shape.to_vec(),
                    declared.shape.clone(),
                ));
            }
        }
        self.resized.insert(index, shape.to_vec());
        self.allocated = false;
        Ok(())
    }

    /// Materializes input storage and loads constant buffers. Inputs whose
    /// shape is still unknown must have been resized first.
    pub fn allocate_tensors(&mut self) -> Result<(), RuntimeError> {
        let subgraph = self.model.subgraph();
        for (index, declared) in subgraph.tensors.iter().enumerate() {
            if self.is_input(index) {
                let shape = match self.resized.get(&index) {
                    Some(shape) => shape.clone(),
                    None => {
                        if declared.unknown_rank || declared.shape.iter().any(|d| *d < 0) {
                            return Err(RuntimeError::UnresolvedInputShape(declared.name.clone()));
                        }
                        declared.shape.iter().map(|d| *d as usize).collect()
                    }
                };
                let dtype = DType::from_serialized(declared.r#type)?;
                self.tensors[index] = Some(TensorData::zeros(dtype, &shape)?);
            } else if declared.buffer != 0 {
                let dtype = DType::from_serialized(declared.r#type)?;
                let shape: Vec<usize> = declared.shape.iter().map(|d| *d as usize).collect();
                let data = self.model.buffer(declared.buffer);
                let mut tensor = TensorData::from_raw(dtype, &shape, data)?;
                if let Some(params) = &declared.quantization {
                    if !params.scale.is_empty() {
                        tensor = tensor.dequantized(
                            &params.scale,
                            &params.zero_point,
                            params.quantized_dimension as usize,
                        )?;
                    }
                }
                self.tensors[index] = Some(tensor);
            } else {
                self.tensors[index] = None;
            }
        }
        self.allocated = true;
        log::debug!("Allocated {} tensor slots", self.tensors.len());
        Ok(())
    }

    fn checked_input_index(&self, name: &str) -> Result<usize, RuntimeError> {
        if !self.allocated {
            return Err(RuntimeError::NotAllocated);
        }
        let index = self.tensor_index(name)?;
        if !self.is_input(index) {
            return Err(RuntimeError::NotAnInput(name.to_string()));
        }
        Ok(index)
    }

    pub fn input_mut(&mut self, name: &str) -> Result<&mut TensorData, RuntimeError> {
        let index = self.checked_input_index(name)?;
        self.tensors[index]
            .as_mut()
            .ok_or_else(|| RuntimeError::NotComputed(name.to_string()))
    }

    /// Flat mutable float32 view of an input, in logical order.
    pub fn input_f32_mut(&mut self, name: &str) -> Result<&mut [f32], RuntimeError> {
        let tensor = self.input_mut(name)?;
        let arr = tensor.as_f32_mut().map_err(RuntimeError::TensorData)?;
        arr.as_slice_mut()
            .ok_or_else(|| kernel_error("input", "input storage is not contiguous"))
    }

    pub fn input_i32_mut(&mut self, name: &str) -> Result<&mut [i32], RuntimeError> {
        let tensor = self.input_mut(name)?;
        match tensor {
            TensorData::I32(arr) => arr
                .as_slice_mut()
                .ok_or_else(|| kernel_error("input", "input storage is not contiguous")),
            other => Err(RuntimeError::TensorData(TensorDataError::DTypeMismatch(
                DType::I32,
                other.dtype(),
            ))),
        }
    }

    /// Runs every operator in order. Shapes that were unknown at conversion
    /// time resolve as data flows.
    pub fn invoke(&mut self) -> Result<(), RuntimeError> {
        if !self.allocated {
            return Err(RuntimeError::NotAllocated);
        }
        for operator in &self.model.subgraph().operators {
            ops::eval_operator(&self.model, operator, &mut self.tensors)?;
        }
        Ok(())
    }

    /// Any computed tensor, by name.
    pub fn tensor(&self, name: &str) -> Result<&TensorData, RuntimeError> {
        let index = self.tensor_index(name)?;
        self.tensors[index]
            .as_ref()
            .ok_or_else(|| RuntimeError::NotComputed(name.to_string()))
    }

    pub fn output(&self, name: &str) -> Result<&TensorData, RuntimeError> {
        self.tensor(name)
    }

    pub fn output_f32(&self, name: &str) -> Result<Vec<f32>, RuntimeError> {
        Ok(self.output(name)?.to_f32_vec().map_err(RuntimeError::TensorData)?)
    }

    pub fn tensor_shape(&self, name: &str) -> Result<Vec<usize>, RuntimeError> {
        Ok(self.tensor(name)?.shape().to_vec())
    }
}
