use std::collections::HashMap;

use prost::Message;

use crate::graph_ir::{self, Activation, GraphSlice, IrNode};
use crate::{ConvertError, lite, tf};

pub(crate) fn tensor_type_of(
    dtype: tf::DataType,
    node: &str,
) -> Result<lite::TensorType, ConvertError> {
    Ok(match dtype {
        tf::DataType::DtFloat => lite::TensorType::Float32,
        tf::DataType::DtHalf => lite::TensorType::Float16,
        tf::DataType::DtBfloat16 => lite::TensorType::Bfloat16,
        tf::DataType::DtDouble => lite::TensorType::Float64,
        tf::DataType::DtInt32 => lite::TensorType::Int32,
        tf::DataType::DtInt64 => lite::TensorType::Int64,
        tf::DataType::DtInt16 => lite::TensorType::Int16,
        tf::DataType::DtInt8 => lite::TensorType::Int8,
        tf::DataType::DtUint8 => lite::TensorType::Uint8,
        tf::DataType::DtBool => lite::TensorType::Bool,
        other => Err(ConvertError::UnsupportedDType(other, node.to_string()))?,
    })
}

fn element_size(ttype: lite::TensorType) -> usize {
    match ttype {
        lite::TensorType::Float64 | lite::TensorType::Int64 => 8,
        lite::TensorType::Float32 | lite::TensorType::Int32 => 4,
        lite::TensorType::Float16 | lite::TensorType::Bfloat16 | lite::TensorType::Int16 => 2,
        lite::TensorType::Uint8 | lite::TensorType::Int8 | lite::TensorType::Bool => 1,
    }
}

fn activation_of(activation: Activation) -> lite::ActivationFunction {
    match activation {
        Activation::None => lite::ActivationFunction::ActNone,
        Activation::Relu => lite::ActivationFunction::ActRelu,
        Activation::Relu6 => lite::ActivationFunction::ActRelu6,
    }
}

pub(crate) struct ModelBuilder {
    tensors: Vec<lite::Tensor>,
    index_by_name: HashMap<String, i32>,
    buffers: Vec<lite::Buffer>,
    operator_codes: Vec<lite::OperatorCode>,
    opcode_indices: HashMap<(i32, String), u32>,
    operators: Vec<lite::Operator>,
}

impl ModelBuilder {
    fn new() -> Self {
        Self {
            tensors: Vec::new(),
            index_by_name: HashMap::new(),
            // Buffer 0 is the shared empty buffer.
            buffers: vec![lite::Buffer { data: Vec::new() }],
            operator_codes: Vec::new(),
            opcode_indices: HashMap::new(),
            operators: Vec::new(),
        }
    }

    fn add_buffer(&mut self, data: Vec<u8>) -> u32 {
        self.buffers.push(lite::Buffer { data });
        (self.buffers.len() - 1) as u32
    }

    fn opcode(&mut self, builtin: lite::BuiltinOperator, custom_name: Option<&str>) -> u32 {
        let key = (builtin as i32, custom_name.unwrap_or("").to_string());
        if let Some(index) = self.opcode_indices.get(&key) {
            return *index;
        }
        let index = self.operator_codes.len() as u32;
        self.operator_codes.push(lite::OperatorCode {
            builtin: builtin as i32,
            custom_name: custom_name.unwrap_or("").to_string(),
        });
        self.opcode_indices.insert(key, index);
        index
    }

    fn add_tensor(
        &mut self,
        name: &str,
        ttype: lite::TensorType,
        shape: Vec<i32>,
        unknown_rank: bool,
        buffer: u32,
    ) -> Result<i32, ConvertError> {
        if self.index_by_name.contains_key(name) {
            return Err(ConvertError::DuplicateNodeName(name.to_string()));
        }
        let index = self.tensors.len() as i32;
        self.tensors.push(lite::Tensor {
            shape,
            r#type: ttype as i32,
            buffer,
            name: name.to_string(),
            quantization: None,
            unknown_rank,
        });
        self.index_by_name.insert(name.to_string(), index);
        Ok(index)
    }

    fn alias(&mut self, name: &str, index: i32) -> Result<(), ConvertError> {
        if self.index_by_name.contains_key(name) {
            return Err(ConvertError::DuplicateNodeName(name.to_string()));
        }
        self.index_by_name.insert(name.to_string(), index);
        Ok(())
    }

    fn index_of(&self, name: &str) -> Result<i32, ConvertError> {
        self.index_by_name
            .get(name)
            .copied()
            .ok_or_else(|| ConvertError::UnknownTensorName(name.to_string()))
    }

    fn tensor_type(&self, index: i32) -> lite::TensorType {
        lite::TensorType::try_from(self.tensors[index as usize].r#type)
            .expect("builder only stores valid tensor types")
    }

    fn finish(self, inputs: Vec<i32>, outputs: Vec<i32>) -> lite::Model {
        lite::Model {
            schema_version: crate::SCHEMA_VERSION,
            description: String::new(),
            operator_codes: self.operator_codes,
            subgraphs: vec![lite::SubGraph {
                tensors: self.tensors,
                inputs,
                outputs,
                operators: self.operators,
                name: "main".to_string(),
            }],
            buffers: self.buffers,
            metadata: HashMap::new(),
        }
    }
}

pub(crate) fn lower(
    slice: &GraphSlice,
    output_arrays: &[String],
    allow_custom_ops: bool,
) -> Result<lite::Model, ConvertError> {
    let mut b = ModelBuilder::new();

    let mut input_indices = Vec::new();
    for spec in &slice.inputs {
        let ttype = tensor_type_of(spec.dtype, &spec.name)?;
        let (shape, unknown_rank) = match &spec.shape {
            Some(dims) => (dims.iter().map(|d| *d as i32).collect(), false),
            None => (Vec::new(), true),
        };
        input_indices.push(b.add_tensor(&spec.name, ttype, shape, unknown_rank, 0)?);
    }

    for node in &slice.nodes {
        if let Err(err) = lower_builtin(&mut b, node) {
            let fallback = matches!(
                err,
                ConvertError::UnsupportedOperator(..) | ConvertError::UnsupportedConfiguration(..)
            );
            // A node carrying folded state cannot round-trip through an
            // opaque custom operator.
            if fallback
                && allow_custom_ops
                && node.bias_input.is_none()
                && node.fused_activation == Activation::None
            {
                log::warn!("Passing through {} (node \"{}\") as a custom operator", node.op, node.name);
                lower_custom(&mut b, node)?;
            } else {
                return Err(err);
            }
        }
    }

    let mut output_indices = Vec::new();
    for name in output_arrays {
        let index = b.index_of(name)?;
        if input_indices.contains(&index) {
            return Err(ConvertError::InputIsOutput(name.clone()));
        }
        // An output reached through elided aliases keeps its producer's
        // tensor name; surface the requested name instead.
        if b.tensors[index as usize].name != *name {
            b.tensors[index as usize].name = name.clone();
        }
        output_indices.push(index);
    }

    Ok(b.finish(input_indices, output_indices))
}

fn expect_arity(node: &IrNode, arity: usize) -> Result<(), ConvertError> {
    if node.inputs.len() != arity {
        return Err(ConvertError::UnsupportedConfiguration(
            node.name.clone(),
            format!("expected {} inputs, found {}", arity, node.inputs.len()),
        ));
    }
    Ok(())
}

fn out_type(b: &ModelBuilder, node: &IrNode, first_input: i32) -> Result<lite::TensorType, ConvertError> {
    match graph_ir::attr_dtype(&node.attrs, "T") {
        Some(dtype) => tensor_type_of(dtype, &node.name),
        None => Ok(b.tensor_type(first_input)),
    }
}

fn check_nhwc(node: &IrNode) -> Result<(), ConvertError> {
    if let Some(format) = graph_ir::attr_string(&node.attrs, "data_format") {
        if format != "NHWC" {
            return Err(ConvertError::UnsupportedConfiguration(
                node.name.clone(),
                format!("data_format {format}"),
            ));
        }
    }
    Ok(())
}

fn padding_of(node: &IrNode) -> Result<lite::Padding, ConvertError> {
    match graph_ir::attr_string(&node.attrs, "padding").as_deref() {
        Some("SAME") => Ok(lite::Padding::Same),
        Some("VALID") => Ok(lite::Padding::Valid),
        Some(other) => Err(ConvertError::UnsupportedConfiguration(
            node.name.clone(),
            format!("padding {other}"),
        )),
        None => Err(ConvertError::MissingAttribute(
            node.name.clone(),
            "padding".to_string(),
        )),
    }
}

/// Pulls a `[1, h, w, 1]` window attribute (strides, ksize) apart.
fn hw_attr(node: &IrNode, name: &str) -> Result<(i32, i32), ConvertError> {
    let values = graph_ir::attr_ints(&node.attrs, name)
        .ok_or_else(|| ConvertError::MissingAttribute(node.name.clone(), name.to_string()))?;
    if values.len() != 4 || values[0] != 1 || values[3] != 1 {
        return Err(ConvertError::UnsupportedConfiguration(
            node.name.clone(),
            format!("{name} {values:?}"),
        ));
    }
    Ok((values[1] as i32, values[2] as i32))
}

fn lower_builtin(b: &mut ModelBuilder, node: &IrNode) -> Result<(), ConvertError> {
    match node.op.as_str() {
        "Const" => {
            let (ttype, shape, data) = const_value(node)?;
            let buffer = b.add_buffer(data);
            b.add_tensor(&node.name, ttype, shape, false, buffer)?;
            Ok(())
        }
        "Identity" => {
            expect_arity(node, 1)?;
            let index = b.index_of(&node.inputs[0])?;
            b.alias(&node.name, index)
        }
        "Add" | "AddV2" | "BiasAdd" | "Sub" | "Mul" | "RealDiv" => {
            expect_arity(node, 2)?;
            if node.op == "BiasAdd" {
                check_nhwc(node)?;
            }
            let builtin = match node.op.as_str() {
                "Sub" => lite::BuiltinOperator::Sub,
                "Mul" => lite::BuiltinOperator::Mul,
                "RealDiv" => lite::BuiltinOperator::Div,
                _ => lite::BuiltinOperator::Add,
            };
            let lhs = b.index_of(&node.inputs[0])?;
            let rhs = b.index_of(&node.inputs[1])?;
            let ttype = out_type(b, node, lhs)?;
            let out = b.add_tensor(&node.name, ttype, Vec::new(), true, 0)?;
            let opcode_index = b.opcode(builtin, None);
            b.operators.push(lite::Operator {
                opcode_index,
                inputs: vec![lhs, rhs],
                outputs: vec![out],
                builtin_options: Some(lite::operator::BuiltinOptions::ElementwiseOptions(
                    lite::ElementwiseOptions {
                        fused_activation: activation_of(node.fused_activation) as i32,
                    },
                )),
                custom_options: Vec::new(),
            });
            Ok(())
        }
        "Relu" | "Relu6" => {
            expect_arity(node, 1)?;
            let builtin = if node.op == "Relu6" {
                lite::BuiltinOperator::Relu6
            } else {
                lite::BuiltinOperator::Relu
            };
            let input = b.index_of(&node.inputs[0])?;
            let ttype = out_type(b, node, input)?;
            let out = b.add_tensor(&node.name, ttype, Vec::new(), true, 0)?;
            let opcode_index = b.opcode(builtin, None);
            b.operators.push(lite::Operator {
                opcode_index,
                inputs: vec![input],
                outputs: vec![out],
                builtin_options: None,
                custom_options: Vec::new(),
            });
            Ok(())
        }
        "Softmax" => {
            expect_arity(node, 1)?;
            let input = b.index_of(&node.inputs[0])?;
            let ttype = out_type(b, node, input)?;
            let out = b.add_tensor(&node.name, ttype, Vec::new(), true, 0)?;
            let opcode_index = b.opcode(lite::BuiltinOperator::Softmax, None);
            b.operators.push(lite::Operator {
                opcode_index,
                inputs: vec![input],
                outputs: vec![out],
                builtin_options: Some(lite::operator::BuiltinOptions::SoftmaxOptions(
                    lite::SoftmaxOptions { beta: 1.0 },
                )),
                custom_options: Vec::new(),
            });
            Ok(())
        }
        "Reshape" => {
            expect_arity(node, 2)?;
            let input = b.index_of(&node.inputs[0])?;
            let shape = b.index_of(&node.inputs[1])?;
            let ttype = out_type(b, node, input)?;
            let out = b.add_tensor(&node.name, ttype, Vec::new(), true, 0)?;
            let opcode_index = b.opcode(lite::BuiltinOperator::Reshape, None);
            b.operators.push(lite::Operator {
                opcode_index,
                inputs: vec![input, shape],
                outputs: vec![out],
                builtin_options: None,
                custom_options: Vec::new(),
            });
            Ok(())
        }
        "Transpose" => {
            expect_arity(node, 2)?;
            let input = b.index_of(&node.inputs[0])?;
            let perm = b.index_of(&node.inputs[1])?;
            let ttype = out_type(b, node, input)?;
            let out = b.add_tensor(&node.name, ttype, Vec::new(), true, 0)?;
            let opcode_index = b.opcode(lite::BuiltinOperator::Transpose, None);
            b.operators.push(lite::Operator {
                opcode_index,
                inputs: vec![input, perm],
                outputs: vec![out],
                builtin_options: None,
                custom_options: Vec::new(),
            });
            Ok(())
        }
        "ConcatV2" => {
            if node.inputs.len() < 2 {
                return Err(ConvertError::UnsupportedConfiguration(
                    node.name.clone(),
                    "concatenation without an axis operand".to_string(),
                ));
            }
            if let Some(n) = graph_ir::attr_int(&node.attrs, "N") {
                if node.inputs.len() != n as usize + 1 {
                    return Err(ConvertError::UnsupportedConfiguration(
                        node.name.clone(),
                        format!("{} inputs for N = {n}", node.inputs.len()),
                    ));
                }
            }
            let mut inputs = Vec::new();
            for name in &node.inputs {
                inputs.push(b.index_of(name)?);
            }
            let ttype = out_type(b, node, inputs[0])?;
            let out = b.add_tensor(&node.name, ttype, Vec::new(), true, 0)?;
            let opcode_index = b.opcode(lite::BuiltinOperator::Concatenation, None);
            b.operators.push(lite::Operator {
                opcode_index,
                inputs,
                outputs: vec![out],
                builtin_options: None,
                custom_options: Vec::new(),
            });
            Ok(())
        }
        "MatMul" => {
            expect_arity(node, 2)?;
            if graph_ir::attr_bool(&node.attrs, "transpose_a").unwrap_or(false) {
                // No transposed-input form on the device side.
                return Err(ConvertError::UnsupportedConfiguration(
                    node.name.clone(),
                    "transpose_a".to_string(),
                ));
            }
            let weights_transposed = graph_ir::attr_bool(&node.attrs, "transpose_b").unwrap_or(false);
            let input = b.index_of(&node.inputs[0])?;
            let weights = b.index_of(&node.inputs[1])?;
            let mut inputs = vec![input, weights];
            if let Some(bias) = &node.bias_input {
                inputs.push(b.index_of(bias)?);
            }
            let ttype = out_type(b, node, input)?;
            let out = b.add_tensor(&node.name, ttype, Vec::new(), true, 0)?;
            let opcode_index = b.opcode(lite::BuiltinOperator::FullyConnected, None);
            b.operators.push(lite::Operator {
                opcode_index,
                inputs,
                outputs: vec![out],
                builtin_options: Some(lite::operator::BuiltinOptions::FullyConnectedOptions(
                    lite::FullyConnectedOptions {
                        fused_activation: activation_of(node.fused_activation) as i32,
                        // [out, in] weights when transpose_b was set.
                        weights_transposed,
                    },
                )),
                custom_options: Vec::new(),
            });
            Ok(())
        }
        "Conv2D" => {
            expect_arity(node, 2)?;
            check_nhwc(node)?;
            if let Some(dilations) = graph_ir::attr_ints(&node.attrs, "dilations") {
                if dilations.iter().any(|d| *d != 1) {
                    return Err(ConvertError::UnsupportedConfiguration(
                        node.name.clone(),
                        format!("dilations {dilations:?}"),
                    ));
                }
            }
            let (stride_h, stride_w) = hw_attr(node, "strides")?;
            let padding = padding_of(node)?;
            let input = b.index_of(&node.inputs[0])?;
            let filter = b.index_of(&node.inputs[1])?;
            let mut inputs = vec![input, filter];
            if let Some(bias) = &node.bias_input {
                inputs.push(b.index_of(bias)?);
            }
            let ttype = out_type(b, node, input)?;
            let out = b.add_tensor(&node.name, ttype, Vec::new(), true, 0)?;
            let opcode_index = b.opcode(lite::BuiltinOperator::Conv2d, None);
            b.operators.push(lite::Operator {
                opcode_index,
                inputs,
                outputs: vec![out],
                builtin_options: Some(lite::operator::BuiltinOptions::ConvOptions(
                    lite::ConvOptions {
                        padding: padding as i32,
                        stride_h,
                        stride_w,
                        fused_activation: activation_of(node.fused_activation) as i32,
                    },
                )),
                custom_options: Vec::new(),
            });
            Ok(())
        }
        "MaxPool" => {
            expect_arity(node, 1)?;
            check_nhwc(node)?;
            let (stride_h, stride_w) = hw_attr(node, "strides")?;
            let (filter_h, filter_w) = hw_attr(node, "ksize")?;
            let padding = padding_of(node)?;
            let input = b.index_of(&node.inputs[0])?;
            let ttype = out_type(b, node, input)?;
            let out = b.add_tensor(&node.name, ttype, Vec::new(), true, 0)?;
            let opcode_index = b.opcode(lite::BuiltinOperator::MaxPool2d, None);
            b.operators.push(lite::Operator {
                opcode_index,
                inputs: vec![input],
                outputs: vec![out],
                builtin_options: Some(lite::operator::BuiltinOptions::PoolOptions(
                    lite::PoolOptions {
                        padding: padding as i32,
                        stride_h,
                        stride_w,
                        filter_h,
                        filter_w,
                    },
                )),
                custom_options: Vec::new(),
            });
            Ok(())
        }
        op => Err(ConvertError::UnsupportedOperator(
            op.to_string(),
            node.name.clone(),
        )),
    }
}

/// Lowers a node the builtin table cannot express into an opaque CUSTOM
/// operator. The original attribute map rides along verbatim so a consumer
/// that knows the operator can reconstruct it.
fn lower_custom(b: &mut ModelBuilder, node: &IrNode) -> Result<(), ConvertError> {
    let mut inputs = Vec::new();
    for name in &node.inputs {
        inputs.push(b.index_of(name)?);
    }
    let ttype = match graph_ir::attr_dtype(&node.attrs, "T") {
        Some(dtype) => tensor_type_of(dtype, &node.name)?,
        None if !inputs.is_empty() => b.tensor_type(inputs[0]),
        None => lite::TensorType::Float32,
    };
    let out = b.add_tensor(&node.name, ttype, Vec::new(), true, 0)?;
    let opcode_index = b.opcode(lite::BuiltinOperator::Custom, Some(&node.op));
    let passthrough = tf::NodeDef {
        name: node.name.clone(),
        op: node.op.clone(),
        input: Vec::new(),
        device: String::new(),
        attr: node.attrs.clone(),
    };
    b.operators.push(lite::Operator {
        opcode_index,
        inputs,
        outputs: vec![out],
        builtin_options: None,
        custom_options: passthrough.encode_to_vec(),
    });
    Ok(())
}

fn const_value(node: &IrNode) -> Result<(lite::TensorType, Vec<i32>, Vec<u8>), ConvertError> {
    let tensor = graph_ir::attr_tensor(&node.attrs, "value")
        .ok_or_else(|| ConvertError::MissingAttribute(node.name.clone(), "value".to_string()))?;
    let dtype = tf::DataType::try_from(tensor.dtype).map_err(|_| {
        ConvertError::MalformedConstant(node.name.clone(), format!("dtype {}", tensor.dtype))
    })?;
    let ttype = tensor_type_of(dtype, &node.name)?;

    let dims: Vec<i64> = tensor
        .tensor_shape
        .as_ref()
        .map(|shape| shape.dim.iter().map(|d| d.size).collect())
        .unwrap_or_default();
    if dims.iter().any(|d| *d < 0) {
        return Err(ConvertError::MalformedConstant(
            node.name.clone(),
            format!("negative dimension in {dims:?}"),
        ));
    }
    let numel = dims.iter().product::<i64>() as usize;

    let data = if !tensor.tensor_content.is_empty() {
        if tensor.tensor_content.len() != numel * element_size(ttype) {
            return Err(ConvertError::MalformedConstant(
                node.name.clone(),
                format!(
                    "{} content bytes for {} elements",
                    tensor.tensor_content.len(),
                    numel
                ),
            ));
        }
        tensor.tensor_content.clone()
    } else {
        match ttype {
            lite::TensorType::Float32 => {
                packed(&tensor.float_val, numel, node, |v| v.to_le_bytes().to_vec())?
            }
            lite::TensorType::Float64 => {
                packed(&tensor.double_val, numel, node, |v| v.to_le_bytes().to_vec())?
            }
            lite::TensorType::Float16 | lite::TensorType::Bfloat16 => {
                packed(&tensor.half_val, numel, node, |v| {
                    half::f16::from_bits(*v as u16).to_le_bytes().to_vec()
                })?
            }
            lite::TensorType::Int32 => {
                packed(&tensor.int_val, numel, node, |v| v.to_le_bytes().to_vec())?
            }
            lite::TensorType::Int16 => packed(&tensor.int_val, numel, node, |v| {
                (*v as i16).to_le_bytes().to_vec()
            })?,
            lite::TensorType::Int8 => {
                packed(&tensor.int_val, numel, node, |v| vec![*v as i8 as u8])?
            }
            lite::TensorType::Uint8 => packed(&tensor.int_val, numel, node, |v| vec![*v as u8])?,
            lite::TensorType::Int64 => {
                packed(&tensor.int64_val, numel, node, |v| v.to_le_bytes().to_vec())?
            }
            lite::TensorType::Bool => {
                packed(&tensor.bool_val, numel, node, |v| vec![u8::from(*v)])?
            }
        }
    };

    let shape = dims.iter().map(|d| *d as i32).collect();
    Ok((ttype, shape, data))
}

/// Expands the typed value list of a constant: either one value per element
/// or a single splatted value.
fn packed<T>(
    values: &[T],
    numel: usize,
    node: &IrNode,
    to_bytes: impl Fn(&T) -> Vec<u8>,
) -> Result<Vec<u8>, ConvertError> {
    let mut out = Vec::new();
    if values.len() == numel {
        for value in values {
            out.extend(to_bytes(value));
        }
    } else if values.len() == 1 {
        for _ in 0..numel {
            out.extend(to_bytes(&values[0]));
        }
    } else {
        return Err(ConvertError::MalformedConstant(
            node.name.clone(),
            format!("{} values for {} elements", values.len(), numel),
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ir_node(name: &str, op: &str, inputs: &[&str]) -> IrNode {
        IrNode {
            name: name.to_string(),
            op: op.to_string(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            attrs: HashMap::new(),
            bias_input: None,
            fused_activation: Activation::None,
        }
    }

    fn const_node(name: &str, tensor: tf::TensorProto) -> IrNode {
        let mut node = ir_node(name, "Const", &[]);
        node.attrs.insert(
            "value".to_string(),
            tf::AttrValue {
                value: Some(tf::attr_value::Value::Tensor(tensor)),
            },
        );
        node
    }

    fn float_tensor(dims: &[i64], values: &[f32]) -> tf::TensorProto {
        tf::TensorProto {
            dtype: tf::DataType::DtFloat as i32,
            tensor_shape: Some(tf::TensorShapeProto {
                dim: dims
                    .iter()
                    .map(|size| tf::tensor_shape_proto::Dim {
                        size: *size,
                        name: String::new(),
                    })
                    .collect(),
                unknown_rank: false,
            }),
            float_val: values.to_vec(),
            ..Default::default()
        }
    }

    #[test]
    fn const_splat_expands() {
        let node = const_node("zeros", float_tensor(&[2, 3], &[0.5]));
        let (ttype, shape, data) = const_value(&node).unwrap();
        assert_eq!(ttype, lite::TensorType::Float32);
        assert_eq!(shape, vec![2, 3]);
        assert_eq!(data.len(), 24);
        assert_eq!(&data[..4], 0.5f32.to_le_bytes());
        assert_eq!(&data[20..], 0.5f32.to_le_bytes());
    }

    #[test]
    fn const_value_count_mismatch_is_rejected() {
        let node = const_node("bad", float_tensor(&[4], &[1.0, 2.0]));
        assert!(matches!(
            const_value(&node),
            Err(ConvertError::MalformedConstant(..))
        ));
    }

    #[test]
    fn const_content_length_is_checked() {
        let mut proto = float_tensor(&[4], &[]);
        proto.tensor_content = vec![0u8; 9];
        let node = const_node("bad", proto);
        assert!(matches!(
            const_value(&node),
            Err(ConvertError::MalformedConstant(..))
        ));
    }

    #[test]
    fn opcodes_are_interned() {
        let mut b = ModelBuilder::new();
        let a = b.opcode(lite::BuiltinOperator::Add, None);
        let c = b.opcode(lite::BuiltinOperator::Custom, Some("Erf"));
        let d = b.opcode(lite::BuiltinOperator::Add, None);
        assert_eq!(a, d);
        assert_ne!(a, c);
        assert_eq!(b.operator_codes.len(), 2);
    }

    #[test]
    fn unknown_builtin_is_an_error() {
        let mut b = ModelBuilder::new();
        let node = ir_node("erf", "Erf", &[]);
        assert!(matches!(
            lower_builtin(&mut b, &node),
            Err(ConvertError::UnsupportedOperator(op, _)) if op == "Erf"
        ));
    }
}
