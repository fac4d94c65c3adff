use crate::{ConvertError, lite};

/// Quantizes float32 constant weight operands of FULLY_CONNECTED and CONV_2D
/// operators in place. `per_channel` selects the newer symmetric int8
/// quantizer; otherwise the per-tensor affine uint8 one runs.
pub(crate) fn quantize_weights(
    model: &mut lite::Model,
    per_channel: bool,
) -> Result<(), ConvertError> {
    let operator_codes = model.operator_codes.clone();
    for subgraph_index in 0..model.subgraphs.len() {
        let mut targets: Vec<(usize, usize)> = Vec::new();
        {
            let subgraph = &model.subgraphs[subgraph_index];
            for operator in &subgraph.operators {
                let Some(code) = operator_codes.get(operator.opcode_index as usize) else {
                    continue;
                };
                let weight = match lite::BuiltinOperator::try_from(code.builtin) {
                    Ok(lite::BuiltinOperator::FullyConnected) => {
                        let transposed = match &operator.builtin_options {
                            Some(lite::operator::BuiltinOptions::FullyConnectedOptions(options)) => {
                                options.weights_transposed
                            }
                            _ => false,
                        };
                        // Output channels: dim 0 of [out, in], dim 1 of [in, out].
                        operator
                            .inputs
                            .get(1)
                            .filter(|index| **index >= 0)
                            .map(|index| (*index as usize, usize::from(!transposed)))
                    }
                    // Filter layout [h, w, in, out]: channels on dim 3.
                    Ok(lite::BuiltinOperator::Conv2d) => operator
                        .inputs
                        .get(1)
                        .filter(|index| **index >= 0)
                        .map(|index| (*index as usize, 3)),
                    _ => None,
                };
                if let Some(target) = weight {
                    targets.push(target);
                }
            }
        }

        for (tensor_index, quantized_dimension) in targets {
            let (buffer_index, shape) = {
                let tensor = &model.subgraphs[subgraph_index].tensors[tensor_index];
                if tensor.r#type != lite::TensorType::Float32 as i32 || tensor.buffer == 0 {
                    continue;
                }
                (tensor.buffer as usize, tensor.shape.clone())
            };
            let values = unpack_f32(&model.buffers[buffer_index].data, || {
                model.subgraphs[subgraph_index].tensors[tensor_index]
                    .name
                    .clone()
            })?;

            let (data, params, ttype) = if per_channel {
                quantize_per_channel(&values, &shape, quantized_dimension)
            } else {
                quantize_per_tensor(&values)
            };
            model.buffers[buffer_index].data = data;
            let tensor = &mut model.subgraphs[subgraph_index].tensors[tensor_index];
            tensor.r#type = ttype as i32;
            tensor.quantization = Some(params);
            log::debug!("Quantized weight tensor \"{}\"", tensor.name);
        }
    }
    Ok(())
}

fn unpack_f32(data: &[u8], name: impl Fn() -> String) -> Result<Vec<f32>, ConvertError> {
    if data.len() % 4 != 0 {
        return Err(ConvertError::MalformedConstant(
            name(),
            format!("{} bytes is not a float32 buffer", data.len()),
        ));
    }
    Ok(data
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes(chunk.try_into().expect("chunks_exact yields 4 bytes")))
        .collect())
}

/// Affine uint8 over the whole tensor. The representable range always
/// includes zero so zero-valued weights stay exact.
fn quantize_per_tensor(values: &[f32]) -> (Vec<u8>, lite::QuantizationParameters, lite::TensorType) {
    let mut min = 0.0f32;
    let mut max = 0.0f32;
    for v in values {
        min = min.min(*v);
        max = max.max(*v);
    }
    let mut scale = (max - min) / 255.0;
    if scale == 0.0 {
        scale = 1.0;
    }
    let zero_point = (-min / scale).round().clamp(0.0, 255.0) as i64;
    let data = values
        .iter()
        .map(|v| ((v / scale).round() + zero_point as f32).clamp(0.0, 255.0) as u8)
        .collect();
    (
        data,
        lite::QuantizationParameters {
            scale: vec![scale],
            zero_point: vec![zero_point],
            quantized_dimension: 0,
        },
        lite::TensorType::Uint8,
    )
}

/// Symmetric int8 with one scale per output channel.
fn quantize_per_channel(
    values: &[f32],
    shape: &[i32],
    quantized_dimension: usize,
) -> (Vec<u8>, lite::QuantizationParameters, lite::TensorType) {
    let dims: Vec<usize> = shape.iter().map(|d| *d as usize).collect();
    let channels = dims.get(quantized_dimension).copied().unwrap_or(1).max(1);
    let inner: usize = dims
        .get(quantized_dimension + 1..)
        .map(|rest| rest.iter().product())
        .unwrap_or(1);
    let channel_of = |index: usize| (index / inner.max(1)) % channels;

    let mut scales = vec![0.0f32; channels];
    for (index, v) in values.iter().enumerate() {
        let channel = channel_of(index);
        scales[channel] = scales[channel].max(v.abs());
    }
    for scale in &mut scales {
        *scale = if *scale == 0.0 { 1.0 } else { *scale / 127.0 };
    }

    let quantized: Vec<i8> = values
        .iter()
        .enumerate()
        .map(|(index, v)| (v / scales[channel_of(index)]).round().clamp(-127.0, 127.0) as i8)
        .collect();
    (
        bytemuck::cast_slice(&quantized).to_vec(),
        lite::QuantizationParameters {
            scale: scales,
            zero_point: vec![0; channels],
            quantized_dimension: quantized_dimension as i32,
        },
        lite::TensorType::Int8,
    )
}
