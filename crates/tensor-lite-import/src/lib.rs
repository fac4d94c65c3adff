use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use prost::Message;

mod graph_ir;
mod lowering;
mod passes;
mod quantize;

pub mod tf {
    include!(concat!(env!("OUT_DIR"), "/tensorflow.rs"));
}

pub mod lite {
    include!(concat!(env!("OUT_DIR"), "/lite.rs"));
}

/// Bumped whenever the emitted model layout changes incompatibly.
pub const SCHEMA_VERSION: u32 = 1;

/// Key under which [`ConversionMetadata`] is stored in the model metadata map.
pub const CONVERSION_METADATA_KEY: &str = "tensor_lite_conversion";

#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("Graph file read error: {0}")]
    GraphFileReadError(#[from] std::io::Error),
    #[error("Graph decode error: {0}")]
    GraphDecodeError(#[from] prost::DecodeError),
    #[error("Duplicate node name \"{0}\" in graph definition")]
    DuplicateNodeName(String),
    #[error("Unknown tensor name \"{0}\"")]
    UnknownTensorName(String),
    #[error("Tensor name \"{0}\" repeated in input/output arrays")]
    RepeatedArrayEntry(String),
    #[error("Tensor \"{0}\" named as both input and output")]
    InputIsOutput(String),
    #[error("Graph contains a cycle through node \"{0}\"")]
    GraphCycle(String),
    #[error("Multi-output edge reference \"{0}\" is not supported")]
    MultiOutputEdge(String),
    #[error("Unsupported operator {0} (node \"{1}\")")]
    UnsupportedOperator(String, String),
    #[error("Unsupported configuration on node \"{0}\": {1}")]
    UnsupportedConfiguration(String, String),
    #[error("Missing expected attribute \"{1}\" on node \"{0}\"")]
    MissingAttribute(String, String),
    #[error("Unsupported dtype {0:?} (node \"{1}\")")]
    UnsupportedDType(tf::DataType, String),
    #[error("Malformed constant on node \"{0}\": {1}")]
    MalformedConstant(String, String),
}

/// Record of how a model was produced, embedded in the emitted model's
/// metadata map as JSON.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ConversionMetadata {
    pub producer: String,
    pub new_converter: bool,
    pub new_quantizer: bool,
    pub allow_custom_ops: bool,
    pub quantize_weights: bool,
}

/// Converts a frozen graph definition into on-device model bytes.
///
/// Bound at construction to the graph artifact and the tensor names to treat
/// as the model boundary; behavior flags are public fields set before
/// [`Converter::convert`].
pub struct Converter {
    graph: tf::GraphDef,
    input_arrays: Vec<String>,
    output_arrays: Vec<String>,
    /// Run the newer conversion pipeline: bias and activation fusion plus
    /// constant buffer deduplication.
    pub new_converter: bool,
    /// Use the per-channel symmetric quantizer instead of the per-tensor
    /// affine one. Only observable when `quantize_weights` is set.
    pub new_quantizer: bool,
    /// Lower operators outside the builtin table to CUSTOM pass-through
    /// operators instead of failing.
    pub allow_custom_ops: bool,
    /// Quantize float32 weight operands of FULLY_CONNECTED and CONV_2D.
    pub quantize_weights: bool,
}

impl Converter {
    pub fn from_frozen_graph(
        path: &Path,
        input_arrays: &[&str],
        output_arrays: &[&str],
    ) -> Result<Self, ConvertError> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file) }?;
        let graph = tf::GraphDef::decode(&mmap[..])?;
        log::info!(
            "Loaded graph definition from {} ({} nodes)",
            path.display(),
            graph.node.len()
        );
        Ok(Self::from_graph_def(graph, input_arrays, output_arrays))
    }

    pub fn from_graph_def(
        graph: tf::GraphDef,
        input_arrays: &[&str],
        output_arrays: &[&str],
    ) -> Self {
        Self {
            graph,
            input_arrays: input_arrays.iter().map(|s| s.to_string()).collect(),
            output_arrays: output_arrays.iter().map(|s| s.to_string()).collect(),
            new_converter: false,
            new_quantizer: false,
            allow_custom_ops: false,
            quantize_weights: false,
        }
    }

    pub fn convert(&self) -> Result<Vec<u8>, ConvertError> {
        let mut slice =
            graph_ir::slice_graph(&self.graph, &self.input_arrays, &self.output_arrays)?;

        if self.new_converter {
            passes::fold_biases(&mut slice.nodes, &self.output_arrays);
            passes::fold_activations(&mut slice.nodes, &self.output_arrays);
        }

        let mut model = lowering::lower(&slice, &self.output_arrays, self.allow_custom_ops)?;

        if self.quantize_weights {
            quantize::quantize_weights(&mut model, self.new_quantizer)?;
        }
        if self.new_converter {
            passes::dedup_buffers(&mut model);
        }

        let metadata = ConversionMetadata {
            producer: format!("tensor-lite-import {}", env!("CARGO_PKG_VERSION")),
            new_converter: self.new_converter,
            new_quantizer: self.new_quantizer,
            allow_custom_ops: self.allow_custom_ops,
            quantize_weights: self.quantize_weights,
        };
        model.metadata.insert(
            CONVERSION_METADATA_KEY.to_string(),
            serde_json::to_string(&metadata).expect("metadata serialization cannot fail"),
        );

        log::info!(
            "Converted {} nodes into {} operators",
            slice.nodes.len(),
            model.subgraphs[0].operators.len()
        );
        Ok(model.encode_to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn relu_graph() -> tf::GraphDef {
        let mut placeholder_attrs = HashMap::new();
        placeholder_attrs.insert(
            "dtype".to_string(),
            tf::AttrValue {
                value: Some(tf::attr_value::Value::Type(tf::DataType::DtFloat as i32)),
            },
        );
        placeholder_attrs.insert(
            "shape".to_string(),
            tf::AttrValue {
                value: Some(tf::attr_value::Value::Shape(tf::TensorShapeProto {
                    dim: vec![tf::tensor_shape_proto::Dim {
                        size: 4,
                        name: String::new(),
                    }],
                    unknown_rank: false,
                })),
            },
        );
        let mut relu_attrs = HashMap::new();
        relu_attrs.insert(
            "T".to_string(),
            tf::AttrValue {
                value: Some(tf::attr_value::Value::Type(tf::DataType::DtFloat as i32)),
            },
        );
        tf::GraphDef {
            node: vec![
                tf::NodeDef {
                    name: "in".to_string(),
                    op: "Placeholder".to_string(),
                    input: vec![],
                    device: String::new(),
                    attr: placeholder_attrs,
                },
                tf::NodeDef {
                    name: "out".to_string(),
                    op: "Relu".to_string(),
                    input: vec!["in".to_string()],
                    device: String::new(),
                    attr: relu_attrs,
                },
            ],
            versions: None,
        }
    }

    #[test]
    fn converts_a_frozen_graph_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&relu_graph().encode_to_vec()).unwrap();

        let converter = Converter::from_frozen_graph(file.path(), &["in"], &["out"]).unwrap();
        let bytes = converter.convert().unwrap();

        let model = lite::Model::decode(bytes.as_slice()).unwrap();
        assert_eq!(model.schema_version, SCHEMA_VERSION);
        assert_eq!(model.subgraphs.len(), 1);
        assert_eq!(model.subgraphs[0].operators.len(), 1);
        assert!(model.metadata.contains_key(CONVERSION_METADATA_KEY));
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        // A field header promising far more bytes than follow.
        file.write_all(&[0x0a, 0xff, 0xff, 0xff, 0x7f, 0x00]).unwrap();
        assert!(matches!(
            Converter::from_frozen_graph(file.path(), &["in"], &["out"]),
            Err(ConvertError::GraphDecodeError(_))
        ));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let result = Converter::from_frozen_graph(
            std::path::Path::new("/nonexistent/graph.pb"),
            &["in"],
            &["out"],
        );
        assert!(matches!(result, Err(ConvertError::GraphFileReadError(_))));
    }
}
