use std::path::Path;

use prost::Message;
use tensor_lite_import::{CONVERSION_METADATA_KEY, ConversionMetadata, SCHEMA_VERSION};

use crate::lite;

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Model file read error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    DecodeError(#[from] prost::DecodeError),
    #[error("Unsupported schema version {0}, this runtime supports {1}")]
    UnsupportedSchemaVersion(u32, u32),
    #[error("Model must contain exactly one subgraph, found {0}")]
    SubgraphCount(usize),
    #[error("Malformed model: {0}")]
    Malformed(String),
    #[error(transparent)]
    MetadataError(#[from] serde_json::Error),
}

/// A decoded and structurally validated on-device model.
#[derive(Debug)]
pub struct LiteModel {
    model: lite::Model,
}

impl LiteModel {
    pub fn from_file(path: &Path) -> Result<Self, ModelError> {
        let data = std::fs::read(path)?;
        Self::from_bytes(&data)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ModelError> {
        let model = lite::Model::decode(data)?;
        Self::validate(&model)?;
        log::debug!(
            "Loaded model: {} tensors, {} operators",
            model.subgraphs[0].tensors.len(),
            model.subgraphs[0].operators.len()
        );
        Ok(Self { model })
    }

    /// Index bounds are checked once here so the interpreter can index
    /// without re-validating.
    fn validate(model: &lite::Model) -> Result<(), ModelError> {
        if model.schema_version != SCHEMA_VERSION {
            return Err(ModelError::UnsupportedSchemaVersion(
                model.schema_version,
                SCHEMA_VERSION,
            ));
        }
        if model.subgraphs.len() != 1 {
            return Err(ModelError::SubgraphCount(model.subgraphs.len()));
        }
        let subgraph = &model.subgraphs[0];
        let tensor_count = subgraph.tensors.len() as i32;
        for tensor in &subgraph.tensors {
            if tensor.buffer as usize >= model.buffers.len() {
                return Err(ModelError::Malformed(format!(
                    "tensor \"{}\" references buffer {} of {}",
                    tensor.name,
                    tensor.buffer,
                    model.buffers.len()
                )));
            }
        }
        for (position, operator) in subgraph.operators.iter().enumerate() {
            if operator.opcode_index as usize >= model.operator_codes.len() {
                return Err(ModelError::Malformed(format!(
                    "operator {} references opcode {} of {}",
                    position,
                    operator.opcode_index,
                    model.operator_codes.len()
                )));
            }
            for input in &operator.inputs {
                if *input != -1 && !(0..tensor_count).contains(input) {
                    return Err(ModelError::Malformed(format!(
                        "operator {position} input tensor {input} out of range"
                    )));
                }
            }
            if operator.outputs.is_empty() {
                return Err(ModelError::Malformed(format!(
                    "operator {position} has no outputs"
                )));
            }
            for output in &operator.outputs {
                if !(0..tensor_count).contains(output) {
                    return Err(ModelError::Malformed(format!(
                        "operator {position} output tensor {output} out of range"
                    )));
                }
            }
        }
        for boundary in subgraph.inputs.iter().chain(&subgraph.outputs) {
            if !(0..tensor_count).contains(boundary) {
                return Err(ModelError::Malformed(format!(
                    "boundary tensor {boundary} out of range"
                )));
            }
        }
        Ok(())
    }

    pub fn subgraph(&self) -> &lite::SubGraph {
        &self.model.subgraphs[0]
    }

    pub fn buffer(&self, index: u32) -> &[u8] {
        &self.model.buffers[index as usize].data
    }

    pub fn opcode(&self, index: u32) -> (lite::BuiltinOperator, &str) {
        let code = &self.model.operator_codes[index as usize];
        let builtin = lite::BuiltinOperator::try_from(code.builtin)
            .unwrap_or(lite::BuiltinOperator::BuiltinUnknown);
        (builtin, &code.custom_name)
    }

    pub fn tensor_index(&self, name: &str) -> Option<usize> {
        self.subgraph()
            .tensors
            .iter()
            .position(|tensor| tensor.name == name)
    }

    pub fn input_names(&self) -> Vec<&str> {
        let subgraph = self.subgraph();
        subgraph
            .inputs
            .iter()
            .map(|index| subgraph.tensors[*index as usize].name.as_str())
            .collect()
    }

    pub fn output_names(&self) -> Vec<&str> {
        let subgraph = self.subgraph();
        subgraph
            .outputs
            .iter()
            .map(|index| subgraph.tensors[*index as usize].name.as_str())
            .collect()
    }

    pub fn description(&self) -> &str {
        &self.model.description
    }

    /// The conversion record the importer embeds, if present.
    pub fn conversion_metadata(&self) -> Result<Option<ConversionMetadata>, ModelError> {
        match self.model.metadata.get(CONVERSION_METADATA_KEY) {
            Some(raw) => Ok(Some(serde_json::from_str(raw)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_model() -> lite::Model {
        lite::Model {
            schema_version: SCHEMA_VERSION,
            description: String::new(),
            operator_codes: vec![],
            subgraphs: vec![lite::SubGraph {
                tensors: vec![],
                inputs: vec![],
                outputs: vec![],
                operators: vec![],
                name: "main".to_string(),
            }],
            buffers: vec![lite::Buffer { data: Vec::new() }],
            metadata: Default::default(),
        }
    }

    #[test]
    fn schema_version_is_enforced() {
        let mut model = empty_model();
        model.schema_version = SCHEMA_VERSION + 1;
        let err = LiteModel::from_bytes(&model.encode_to_vec()).unwrap_err();
        assert!(matches!(err, ModelError::UnsupportedSchemaVersion(..)));
    }

    #[test]
    fn out_of_range_buffer_is_rejected() {
        let mut model = empty_model();
        model.subgraphs[0].tensors.push(lite::Tensor {
            shape: vec![1],
            r#type: lite::TensorType::Float32 as i32,
            buffer: 7,
            name: "w".to_string(),
            quantization: None,
            unknown_rank: false,
        });
        let err = LiteModel::from_bytes(&model.encode_to_vec()).unwrap_err();
        assert!(matches!(err, ModelError::Malformed(_)));
    }

    #[test]
    fn missing_subgraph_is_rejected() {
        let mut model = empty_model();
        model.subgraphs.clear();
        let err = LiteModel::from_bytes(&model.encode_to_vec()).unwrap_err();
        assert!(matches!(err, ModelError::SubgraphCount(0)));
    }
}
