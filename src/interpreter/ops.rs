use ndarray::{Array2, Array4, ArrayD, Axis, Ix2, Ix4, IxDyn, Zip};

use super::{RuntimeError, kernel_error};
use crate::lite;
use crate::model::LiteModel;
use crate::tensor::TensorData;

pub(crate) fn eval_operator(
    model: &LiteModel,
    operator: &lite::Operator,
    tensors: &mut [Option<TensorData>],
) -> Result<(), RuntimeError> {
    let (builtin, custom_name) = model.opcode(operator.opcode_index);
    let result = match builtin {
        lite::BuiltinOperator::Add
        | lite::BuiltinOperator::Sub
        | lite::BuiltinOperator::Mul
        | lite::BuiltinOperator::Div => {
            let lhs = operand(model, tensors, operator, 0, "binary")?;
            let rhs = operand(model, tensors, operator, 1, "binary")?;
            eval_arith(builtin, lhs, rhs, elementwise_activation(operator))?
        }
        lite::BuiltinOperator::Relu => {
            let input = operand(model, tensors, operator, 0, "RELU")?;
            eval_relu(input, f32::MAX)?
        }
        lite::BuiltinOperator::Relu6 => {
            let input = operand(model, tensors, operator, 0, "RELU6")?;
            eval_relu(input, 6.0)?
        }
        lite::BuiltinOperator::Softmax => {
            let input = operand(model, tensors, operator, 0, "SOFTMAX")?;
            let beta = match &operator.builtin_options {
                Some(lite::operator::BuiltinOptions::SoftmaxOptions(options)) => options.beta,
                _ => 1.0,
            };
            eval_softmax(input, beta)?
        }
        lite::BuiltinOperator::Reshape => {
            let input = operand(model, tensors, operator, 0, "RESHAPE")?;
            let shape = operand(model, tensors, operator, 1, "RESHAPE")?;
            eval_reshape(input, shape)?
        }
        lite::BuiltinOperator::Transpose => {
            let input = operand(model, tensors, operator, 0, "TRANSPOSE")?;
            let perm = operand(model, tensors, operator, 1, "TRANSPOSE")?;
            eval_transpose(input, perm)?
        }
        lite::BuiltinOperator::Concatenation => {
            eval_concatenation(model, operator, tensors)?
        }
        lite::BuiltinOperator::FullyConnected => {
            let input = operand(model, tensors, operator, 0, "FULLY_CONNECTED")?;
            let weights = operand(model, tensors, operator, 1, "FULLY_CONNECTED")?;
            let bias = optional_operand(model, tensors, operator, 2)?;
            eval_fully_connected(input, weights, bias, operator)?
        }
        lite::BuiltinOperator::Conv2d => {
            let input = operand(model, tensors, operator, 0, "CONV_2D")?;
            let filter = operand(model, tensors, operator, 1, "CONV_2D")?;
            let bias = optional_operand(model, tensors, operator, 2)?;
            eval_conv(input, filter, bias, operator)?
        }
        lite::BuiltinOperator::MaxPool2d => {
            let input = operand(model, tensors, operator, 0, "MAX_POOL_2D")?;
            eval_max_pool(input, operator)?
        }
        lite::BuiltinOperator::Custom => {
            return Err(RuntimeError::CustomOpNotSupported(custom_name.to_string()));
        }
        other => return Err(RuntimeError::UnsupportedBuiltin(other)),
    };
    let out = operator.outputs[0] as usize;
    tensors[out] = Some(result);
    Ok(())
}

fn operand<'t>(
    model: &LiteModel,
    tensors: &'t [Option<TensorData>],
    operator: &lite::Operator,
    position: usize,
    op: &'static str,
) -> Result<&'t TensorData, RuntimeError> {
    let index = *operator
        .inputs
        .get(position)
        .ok_or_else(|| kernel_error(op, format!("missing operand {position}")))?;
    if index < 0 {
        return Err(kernel_error(op, format!("operand {position} marked absent")));
    }
    tensors[index as usize].as_ref().ok_or_else(|| {
        RuntimeError::NotComputed(model.subgraph().tensors[index as usize].name.clone())
    })
}

fn optional_operand<'t>(
    model: &LiteModel,
    tensors: &'t [Option<TensorData>],
    operator: &lite::Operator,
    position: usize,
) -> Result<Option<&'t TensorData>, RuntimeError> {
    match operator.inputs.get(position) {
        None => Ok(None),
        Some(index) if *index < 0 => Ok(None),
        Some(index) => tensors[*index as usize]
            .as_ref()
            .map(Some)
            .ok_or_else(|| {
                RuntimeError::NotComputed(model.subgraph().tensors[*index as usize].name.clone())
            }),
    }
}

fn elementwise_activation(operator: &lite::Operator) -> lite::ActivationFunction {
    match &operator.builtin_options {
        Some(lite::operator::BuiltinOptions::ElementwiseOptions(options)) => {
            lite::ActivationFunction::try_from(options.fused_activation)
                .unwrap_or(lite::ActivationFunction::ActNone)
        }
        _ => lite::ActivationFunction::ActNone,
    }
}

fn apply_activation(arr: &mut ArrayD<f32>, activation: lite::ActivationFunction) {
    match activation {
        lite::ActivationFunction::ActNone => {}
        lite::ActivationFunction::ActRelu => arr.mapv_inplace(|v| v.max(0.0)),
        lite::ActivationFunction::ActRelu6 => arr.mapv_inplace(|v| v.clamp(0.0, 6.0)),
    }
}

fn broadcast_shape(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0usize; rank];
    for position in 0..rank {
        let da = if position < rank - a.len() {
            1
        } else {
            a[position - (rank - a.len())]
        };
        let db = if position < rank - b.len() {
            1
        } else {
            b[position - (rank - b.len())]
        };
        out[position] = if da == db {
            da
        } else if da == 1 {
            db
        } else if db == 1 {
            da
        } else {
            return None;
        };
    }
    Some(out)
}

fn broadcast_binary<T: Copy>(
    op: &'static str,
    a: &ArrayD<T>,
    b: &ArrayD<T>,
    f: impl Fn(T, T) -> T,
) -> Result<ArrayD<T>, RuntimeError> {
    let shape = broadcast_shape(a.shape(), b.shape()).ok_or_else(|| {
        kernel_error(
            op,
            format!("shapes {:?} and {:?} do not broadcast", a.shape(), b.shape()),
        )
    })?;
    let lhs = a
        .broadcast(IxDyn(&shape))
        .ok_or_else(|| kernel_error(op, "left operand broadcast failed"))?;
    let rhs = b
        .broadcast(IxDyn(&shape))
        .ok_or_else(|| kernel_error(op, "right operand broadcast failed"))?;
    Ok(Zip::from(&lhs).and(&rhs).map_collect(|x, y| f(*x, *y)))
}

fn arith_name(builtin: lite::BuiltinOperator) -> &'static str {
    match builtin {
        lite::BuiltinOperator::Add => "ADD",
        lite::BuiltinOperator::Sub => "SUB",
        lite::BuiltinOperator::Mul => "MUL",
        lite::BuiltinOperator::Div => "DIV",
        _ => "binary",
    }
}

fn eval_arith(
    builtin: lite::BuiltinOperator,
    lhs: &TensorData,
    rhs: &TensorData,
    activation: lite::ActivationFunction,
) -> Result<TensorData, RuntimeError> {
    let op = arith_name(builtin);
    match (lhs, rhs) {
        (TensorData::F32(a), TensorData::F32(b)) => {
            let mut out = match builtin {
                lite::BuiltinOperator::Add => broadcast_binary(op, a, b, |x, y| x + y)?,
                lite::BuiltinOperator::Sub => broadcast_binary(op, a, b, |x, y| x - y)?,
                lite::BuiltinOperator::Mul => broadcast_binary(op, a, b, |x, y| x * y)?,
                _ => broadcast_binary(op, a, b, |x, y| x / y)?,
            };
            apply_activation(&mut out, activation);
            Ok(TensorData::F32(out))
        }
        (TensorData::I32(a), TensorData::I32(b)) => {
            Ok(TensorData::I32(int_arith(builtin, op, a, b, activation)?))
        }
        (TensorData::I64(a), TensorData::I64(b)) => {
            Ok(TensorData::I64(int_arith(builtin, op, a, b, activation)?))
        }
        (a, b) => Err(kernel_error(
            op,
            format!("operand dtypes {} and {}", a.dtype(), b.dtype()),
        )),
    }
}

fn int_arith<T: Copy + num_traits::PrimInt>(
    builtin: lite::BuiltinOperator,
    op: &'static str,
    a: &ArrayD<T>,
    b: &ArrayD<T>,
    activation: lite::ActivationFunction,
) -> Result<ArrayD<T>, RuntimeError> {
    if activation != lite::ActivationFunction::ActNone {
        return Err(kernel_error(op, "fused activation on an integer tensor"));
    }
    match builtin {
        lite::BuiltinOperator::Add => broadcast_binary(op, a, b, |x, y| x + y),
        lite::BuiltinOperator::Sub => broadcast_binary(op, a, b, |x, y| x - y),
        lite::BuiltinOperator::Mul => broadcast_binary(op, a, b, |x, y| x * y),
        _ => Err(kernel_error(op, "integer division is not supported")),
    }
}

fn eval_relu(input: &TensorData, upper: f32) -> Result<TensorData, RuntimeError> {
    let arr = input
        .as_f32()
        .map_err(|_| kernel_error("RELU", format!("dtype {}", input.dtype())))?;
    Ok(TensorData::F32(arr.mapv(|v| v.max(0.0).min(upper))))
}

fn eval_softmax(input: &TensorData, beta: f32) -> Result<TensorData, RuntimeError> {
    let arr = input
        .as_f32()
        .map_err(|_| kernel_error("SOFTMAX", format!("dtype {}", input.dtype())))?;
    let rank = arr.ndim();
    if rank == 0 {
        return Err(kernel_error("SOFTMAX", "rank 0 input"));
    }
    let mut out = arr.clone();
    for mut lane in out.lanes_mut(Axis(rank - 1)) {
        let max = lane.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0;
        for v in lane.iter_mut() {
            *v = ((*v - max) * beta).exp();
            sum += *v;
        }
        for v in lane.iter_mut() {
            *v /= sum;
        }
    }
    Ok(TensorData::F32(out))
}

fn eval_reshape(input: &TensorData, shape: &TensorData) -> Result<TensorData, RuntimeError> {
    let requested = shape
        .to_index_vec()
        .map_err(|_| kernel_error("RESHAPE", format!("shape operand dtype {}", shape.dtype())))?;
    let numel = input.num_elements() as i64;

    let mut wildcard = None;
    let mut known: i64 = 1;
    for (position, dim) in requested.iter().enumerate() {
        match *dim {
            -1 => {
                if wildcard.replace(position).is_some() {
                    return Err(kernel_error("RESHAPE", "more than one -1 dimension"));
                }
            }
            dim if dim < 0 => {
                return Err(kernel_error("RESHAPE", format!("dimension {dim}")));
            }
            dim => known *= dim,
        }
    }

    let mut target: Vec<usize> = Vec::with_capacity(requested.len());
    for (position, dim) in requested.iter().enumerate() {
        if wildcard == Some(position) {
            if known == 0 || numel % known != 0 {
                return Err(kernel_error(
                    "RESHAPE",
                    format!("cannot infer -1 from {numel} elements and {requested:?}"),
                ));
            }
            target.push((numel / known) as usize);
        } else {
            target.push(*dim as usize);
        }
    }
    if wildcard.is_none() && known != numel {
        return Err(kernel_error(
            "RESHAPE",
            format!("{numel} elements into {requested:?}"),
        ));
    }
    Ok(input.reshaped(&target)?)
}

fn eval_transpose(input: &TensorData, perm: &TensorData) -> Result<TensorData, RuntimeError> {
    let requested = perm
        .to_index_vec()
        .map_err(|_| kernel_error("TRANSPOSE", format!("perm operand dtype {}", perm.dtype())))?;
    let rank = input.shape().len();
    if requested.len() != rank {
        return Err(kernel_error(
            "TRANSPOSE",
            format!("perm of {} axes on rank {rank}", requested.len()),
        ));
    }
    let axes: Vec<usize> = requested
        .iter()
        .map(|axis| {
            if (0..rank as i64).contains(axis) {
                Ok(*axis as usize)
            } else {
                Err(kernel_error("TRANSPOSE", format!("axis {axis}")))
            }
        })
        .collect::<Result<_, _>>()?;
    let mut sorted = axes.clone();
    sorted.sort_unstable();
    if sorted != (0..rank).collect::<Vec<_>>() {
        return Err(kernel_error("TRANSPOSE", format!("{axes:?} is not a permutation")));
    }
    Ok(input.permuted(&axes))
}

fn eval_concatenation(
    model: &LiteModel,
    operator: &lite::Operator,
    tensors: &[Option<TensorData>],
) -> Result<TensorData, RuntimeError> {
    let count = operator.inputs.len();
    if count < 2 {
        return Err(kernel_error("CONCATENATION", "missing axis operand"));
    }
    let axis_operand = operand(model, tensors, operator, count - 1, "CONCATENATION")?;
    let axis_values = axis_operand.to_index_vec().map_err(|_| {
        kernel_error(
            "CONCATENATION",
            format!("axis operand dtype {}", axis_operand.dtype()),
        )
    })?;
    if axis_values.len() != 1 {
        return Err(kernel_error("CONCATENATION", "axis operand must be a scalar"));
    }

    let mut values = Vec::with_capacity(count - 1);
    for position in 0..count - 1 {
        values.push(operand(model, tensors, operator, position, "CONCATENATION")?);
    }
    let rank = values[0].shape().len() as i64;
    let mut axis = axis_values[0];
    if axis < 0 {
        axis += rank;
    }
    if !(0..rank).contains(&axis) {
        return Err(kernel_error("CONCATENATION", format!("axis {}", axis_values[0])));
    }
    let axis = axis as usize;

    match values[0] {
        TensorData::F32(_) => {
            let arrays: Vec<_> = values
                .iter()
                .map(|t| t.as_f32().map(|a| a.view()))
                .collect::<Result<_, _>>()
                .map_err(|_| kernel_error("CONCATENATION", "mixed operand dtypes"))?;
            ndarray::concatenate(Axis(axis), &arrays)
                .map(TensorData::F32)
                .map_err(|e| kernel_error("CONCATENATION", e.to_string()))
        }
        TensorData::I32(_) => {
            let arrays: Vec<_> = values
                .iter()
                .map(|t| match t {
                    TensorData::I32(a) => Ok(a.view()),
                    _ => Err(()),
                })
                .collect::<Result<_, ()>>()
                .map_err(|_| kernel_error("CONCATENATION", "mixed operand dtypes"))?;
            ndarray::concatenate(Axis(axis), &arrays)
                .map(TensorData::I32)
                .map_err(|e| kernel_error("CONCATENATION", e.to_string()))
        }
        other => Err(kernel_error(
            "CONCATENATION",
            format!("dtype {}", other.dtype()),
        )),
    }
}

fn eval_fully_connected(
    input: &TensorData,
    weights: &TensorData,
    bias: Option<&TensorData>,
    operator: &lite::Operator,
) -> Result<TensorData, RuntimeError> {
    const OP: &str = "FULLY_CONNECTED";
    let options = match &operator.builtin_options {
        Some(lite::operator::BuiltinOptions::FullyConnectedOptions(options)) => options.clone(),
        _ => lite::FullyConnectedOptions::default(),
    };
    let x = input
        .as_f32()
        .map_err(|_| kernel_error(OP, format!("input dtype {}", input.dtype())))?;
    let w = weights
        .as_f32()
        .map_err(|_| kernel_error(OP, format!("weights dtype {}", weights.dtype())))?;
    let w2 = w
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|_| kernel_error(OP, format!("weights of rank {}", w.ndim())))?;
    let (in_dim, out_dim) = if options.weights_transposed {
        (w2.shape()[1], w2.shape()[0])
    } else {
        (w2.shape()[0], w2.shape()[1])
    };
    let x_shape = x.shape().to_vec();
    if x_shape.is_empty() || x_shape[x_shape.len() - 1] != in_dim {
        return Err(kernel_error(
            OP,
            format!("input shape {x_shape:?} against {in_dim} weight rows"),
        ));
    }
    let batch = x.len() / in_dim;
    let x2 = Array2::from_shape_vec((batch, in_dim), x.iter().cloned().collect())
        .map_err(|e| kernel_error(OP, e.to_string()))?;
    let weights2 = if options.weights_transposed {
        w2.t().to_owned()
    } else {
        w2.to_owned()
    };
    let mut out2 = x2.dot(&weights2);
    if let Some(bias) = bias {
        let b = bias
            .as_f32()
            .map_err(|_| kernel_error(OP, format!("bias dtype {}", bias.dtype())))?;
        if b.ndim() != 1 || b.len() != out_dim {
            return Err(kernel_error(
                OP,
                format!("bias shape {:?} against {out_dim} outputs", b.shape()),
            ));
        }
        let b1 = b
            .view()
            .into_dimensionality::<ndarray::Ix1>()
            .map_err(|e| kernel_error(OP, e.to_string()))?;
        out2 = out2 + &b1;
    }

    let mut out_shape = x_shape;
    let last = out_shape.len() - 1;
    out_shape[last] = out_dim;
    let mut out = ArrayD::from_shape_vec(IxDyn(&out_shape), out2.iter().cloned().collect())
        .map_err(|e| kernel_error(OP, e.to_string()))?;
    let activation = lite::ActivationFunction::try_from(options.fused_activation)
        .unwrap_or(lite::ActivationFunction::ActNone);
    apply_activation(&mut out, activation);
    Ok(TensorData::F32(out))
}

enum PadMode {
    Same,
    Valid,
}

/// Output extent and leading padding for one spatial dimension.
fn padded_extent(
    op: &'static str,
    mode: &PadMode,
    input: usize,
    window: usize,
    stride: usize,
) -> Result<(usize, usize), RuntimeError> {
    if stride == 0 {
        return Err(kernel_error(op, "zero stride"));
    }
    match mode {
        PadMode::Same => {
            let out = input.div_ceil(stride);
            if out == 0 {
                return Ok((0, 0));
            }
            let needed = ((out - 1) * stride + window).saturating_sub(input);
            Ok((out, needed / 2))
        }
        PadMode::Valid => {
            if window > input {
                return Err(kernel_error(
                    op,
                    format!("window {window} over extent {input}"),
                ));
            }
            Ok(((input - window) / stride + 1, 0))
        }
    }
}

fn pad_mode(op: &'static str, raw: i32) -> Result<PadMode, RuntimeError> {
    match lite::Padding::try_from(raw) {
        Ok(lite::Padding::Same) => Ok(PadMode::Same),
        Ok(lite::Padding::Valid) => Ok(PadMode::Valid),
        Err(_) => Err(kernel_error(op, format!("padding mode {raw}"))),
    }
}

fn eval_conv(
    input: &TensorData,
    filter: &TensorData,
    bias: Option<&TensorData>,
    operator: &lite::Operator,
) -> Result<TensorData, RuntimeError> {
    const OP: &str = "CONV_2D";
    let options = match &operator.builtin_options {
        Some(lite::operator::BuiltinOptions::ConvOptions(options)) => options.clone(),
        _ => return Err(kernel_error(OP, "missing options")),
    };
    let x = input
        .as_f32()
        .map_err(|_| kernel_error(OP, format!("input dtype {}", input.dtype())))?
        .view()
        .into_dimensionality::<Ix4>()
        .map_err(|_| kernel_error(OP, "input is not NHWC"))?;
    let f = filter
        .as_f32()
        .map_err(|_| kernel_error(OP, format!("filter dtype {}", filter.dtype())))?
        .view()
        .into_dimensionality::<Ix4>()
        .map_err(|_| kernel_error(OP, "filter is not [h, w, in, out]"))?;
    let (batch, in_h, in_w, in_c) = x.dim();
    let (k_h, k_w, f_c, out_c) = f.dim();
    if f_c != in_c {
        return Err(kernel_error(
            OP,
            format!("{in_c} input channels against filter {f_c}"),
        ));
    }
    let bias = match bias {
        Some(tensor) => {
            let b = tensor
                .as_f32()
                .map_err(|_| kernel_error(OP, format!("bias dtype {}", tensor.dtype())))?;
            if b.ndim() != 1 || b.len() != out_c {
                return Err(kernel_error(OP, format!("bias shape {:?}", b.shape())));
            }
            Some(
                b.view()
                    .into_dimensionality::<ndarray::Ix1>()
                    .map_err(|e| kernel_error(OP, e.to_string()))?
                    .to_owned(),
            )
        }
        None => None,
    };

    let mode = pad_mode(OP, options.padding)?;
    let stride_h = options.stride_h.max(0) as usize;
    let stride_w = options.stride_w.max(0) as usize;
    let (out_h, pad_top) = padded_extent(OP, &mode, in_h, k_h, stride_h)?;
    let (out_w, pad_left) = padded_extent(OP, &mode, in_w, k_w, stride_w)?;

    let mut out = Array4::<f32>::zeros((batch, out_h, out_w, out_c));
    for b in 0..batch {
        for oh in 0..out_h {
            for ow in 0..out_w {
                for oc in 0..out_c {
                    let mut acc = match &bias {
                        Some(bias) => bias[oc],
                        None => 0.0,
                    };
                    for kh in 0..k_h {
                        let ih = (oh * stride_h + kh) as isize - pad_top as isize;
                        if ih < 0 || ih >= in_h as isize {
                            continue;
                        }
                        for kw in 0..k_w {
                            let iw = (ow * stride_w + kw) as isize - pad_left as isize;
                            if iw < 0 || iw >= in_w as isize {
                                continue;
                            }
                            for ic in 0..in_c {
                                acc += x[[b, ih as usize, iw as usize, ic]] * f[[kh, kw, ic, oc]];
                            }
                        }
                    }
                    out[[b, oh, ow, oc]] = acc;
                }
            }
        }
    }

    let mut out = out.into_dyn();
    let activation = lite::ActivationFunction::try_from(options.fused_activation)
        .unwrap_or(lite::ActivationFunction::ActNone);
    apply_activation(&mut out, activation);
    Ok(TensorData::F32(out))
}

fn eval_max_pool(input: &TensorData, operator: &lite::Operator) -> Result<TensorData, RuntimeError> {
    const OP: &str = "MAX_POOL_2D";
    let options = match &operator.builtin_options {
        Some(lite::operator::BuiltinOptions::PoolOptions(options)) => options.clone(),
        _ => return Err(kernel_error(OP, "missing options")),
    };
    let x = input
        .as_f32()
        .map_err(|_| kernel_error(OP, format!("input dtype {}", input.dtype())))?
        .view()
        .into_dimensionality::<Ix4>()
        .map_err(|_| kernel_error(OP, "input is not NHWC"))?;
    let (batch, in_h, in_w, channels) = x.dim();
    let k_h = options.filter_h.max(0) as usize;
    let k_w = options.filter_w.max(0) as usize;
    let mode = pad_mode(OP, options.padding)?;
    let stride_h = options.stride_h.max(0) as usize;
    let stride_w = options.stride_w.max(0) as usize;
    let (out_h, pad_top) = padded_extent(OP, &mode, in_h, k_h, stride_h)?;
    let (out_w, pad_left) = padded_extent(OP, &mode, in_w, k_w, stride_w)?;

    let mut out = Array4::<f32>::zeros((batch, out_h, out_w, channels));
    for b in 0..batch {
        for oh in 0..out_h {
            for ow in 0..out_w {
                for c in 0..channels {
                    // Padding cells do not participate in the max.
                    let mut best = f32::NEG_INFINITY;
                    for kh in 0..k_h {
                        let ih = (oh * stride_h + kh) as isize - pad_top as isize;
                        if ih < 0 || ih >= in_h as isize {
                            continue;
                        }
                        for kw in 0..k_w {
                            let iw = (ow * stride_w + kw) as isize - pad_left as isize;
                            if iw < 0 || iw >= in_w as isize {
                                continue;
                            }
                            best = best.max(x[[b, ih as usize, iw as usize, c]]);
                        }
                    }
                    out[[b, oh, ow, c]] = best;
                }
            }
        }
    }
    Ok(TensorData::F32(out.into_dyn()))
}
