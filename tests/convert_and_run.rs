use std::collections::HashMap;
use std::sync::Once;

use tensor_lite::interpreter::RuntimeError;
use tensor_lite::{Interpreter, LiteModel};
use tensor_lite_import::{ConvertError, Converter, tf};

static INIT: Once = Once::new();

fn init_logger() {
    INIT.call_once(|| {
        env_logger::init();
    });
}

fn attr_type(dtype: tf::DataType) -> tf::AttrValue {
    tf::AttrValue {
        value: Some(tf::attr_value::Value::Type(dtype as i32)),
    }
}

fn attr_bool(value: bool) -> tf::AttrValue {
    tf::AttrValue {
        value: Some(tf::attr_value::Value::B(value)),
    }
}

fn shape_proto(dims: &[i64]) -> tf::TensorShapeProto {
    tf::TensorShapeProto {
        dim: dims
            .iter()
            .map(|size| tf::tensor_shape_proto::Dim {
                size: *size,
                name: String::new(),
            })
            .collect(),
        unknown_rank: false,
    }
}

fn attr_shape(dims: &[i64]) -> tf::AttrValue {
    tf::AttrValue {
        value: Some(tf::attr_value::Value::Shape(shape_proto(dims))),
    }
}

fn node(name: &str, op: &str, inputs: &[&str], attrs: Vec<(&str, tf::AttrValue)>) -> tf::NodeDef {
    tf::NodeDef {
        name: name.to_string(),
        op: op.to_string(),
        input: inputs.iter().map(|s| s.to_string()).collect(),
        device: String::new(),
        attr: attrs
            .into_iter()
            .map(|(key, value)| (key.to_string(), value))
            .collect::<HashMap<_, _>>(),
    }
}

fn placeholder(name: &str, dtype: tf::DataType, dims: &[i64]) -> tf::NodeDef {
    node(
        name,
        "Placeholder",
        &[],
        vec![("dtype", attr_type(dtype)), ("shape", attr_shape(dims))],
    )
}

fn const_f32(name: &str, dims: &[i64], values: &[f32]) -> tf::NodeDef {
    let tensor = tf::TensorProto {
        dtype: tf::DataType::DtFloat as i32,
        tensor_shape: Some(shape_proto(dims)),
        float_val: values.to_vec(),
        ..Default::default()
    };
    node(
        name,
        "Const",
        &[],
        vec![
            ("dtype", attr_type(tf::DataType::DtFloat)),
            (
                "value",
                tf::AttrValue {
                    value: Some(tf::attr_value::Value::Tensor(tensor)),
                },
            ),
        ],
    )
}

fn const_i32(name: &str, dims: &[i64], values: &[i32]) -> tf::NodeDef {
    let tensor = tf::TensorProto {
        dtype: tf::DataType::DtInt32 as i32,
        tensor_shape: Some(shape_proto(dims)),
        int_val: values.to_vec(),
        ..Default::default()
    };
    node(
        name,
        "Const",
        &[],
        vec![
            ("dtype", attr_type(tf::DataType::DtInt32)),
            (
                "value",
                tf::AttrValue {
                    value: Some(tf::attr_value::Value::Tensor(tensor)),
                },
            ),
        ],
    )
}

fn attr_int(value: i64) -> tf::AttrValue {
    tf::AttrValue {
        value: Some(tf::attr_value::Value::I(value)),
    }
}

fn graph(nodes: Vec<tf::NodeDef>) -> tf::GraphDef {
    tf::GraphDef {
        node: nodes,
        versions: Some(tf::VersionDef {
            producer: 1987,
            min_consumer: 0,
            bad_consumers: vec![],
        }),
    }
}

/// The graph the conversion script ships: a reshape with both data
/// dimensions unknown, feeding a relu.
fn unknown_dim_graph() -> tf::GraphDef {
    graph(vec![
        placeholder("Placeholder", tf::DataType::DtFloat, &[-1, -1]),
        placeholder("Placeholder_1", tf::DataType::DtInt32, &[2]),
        node(
            "Reshape",
            "Reshape",
            &["Placeholder", "Placeholder_1"],
            vec![
                ("T", attr_type(tf::DataType::DtFloat)),
                ("Tshape", attr_type(tf::DataType::DtInt32)),
            ],
        ),
        node(
            "Relu",
            "Relu",
            &["Reshape"],
            vec![("T", attr_type(tf::DataType::DtFloat))],
        ),
    ])
}

fn dense_graph() -> tf::GraphDef {
    graph(vec![
        placeholder("x", tf::DataType::DtFloat, &[1, 4]),
        const_f32("w", &[4, 2], &[0.1, -0.2, 0.3, 0.4, -0.5, 0.6, 0.7, -0.8]),
        const_f32("b", &[2], &[0.25, -0.25]),
        node(
            "mm",
            "MatMul",
            &["x", "w"],
            vec![
                ("T", attr_type(tf::DataType::DtFloat)),
                ("transpose_a", attr_bool(false)),
                ("transpose_b", attr_bool(false)),
            ],
        ),
        node(
            "bias",
            "BiasAdd",
            &["mm", "b"],
            vec![("T", attr_type(tf::DataType::DtFloat))],
        ),
        node(
            "act",
            "Relu",
            &["bias"],
            vec![("T", attr_type(tf::DataType::DtFloat))],
        ),
    ])
}

fn run_dense(model_bytes: &[u8], input: &[f32; 4]) -> Vec<f32> {
    let model = LiteModel::from_bytes(model_bytes).expect("model loads");
    let mut interpreter = Interpreter::new(model);
    interpreter.allocate_tensors().expect("allocation");
    interpreter
        .input_f32_mut("x")
        .expect("input view")
        .copy_from_slice(input);
    interpreter.invoke().expect("invoke");
    interpreter.output_f32("act").expect("output")
}

#[test]
fn unknown_dim_reshape_end_to_end() {
    init_logger();

    let mut converter =
        Converter::from_graph_def(unknown_dim_graph(), &["Placeholder", "Placeholder_1"], &["Relu"]);
    converter.new_converter = true;
    converter.new_quantizer = true;
    converter.allow_custom_ops = true;

    let bytes = converter.convert().expect("conversion");
    assert!(!bytes.is_empty());

    // Write and reload through the filesystem, as the script does.
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("unknown_dim_reshape.tflite");
    std::fs::write(&path, &bytes).expect("write model");
    let model = LiteModel::from_file(&path).expect("model loads");
    assert_eq!(model.input_names(), vec!["Placeholder", "Placeholder_1"]);
    assert_eq!(model.output_names(), vec!["Relu"]);

    let mut interpreter = Interpreter::new(model);

    // Both data dimensions are unknown until resized.
    assert!(matches!(
        interpreter.allocate_tensors(),
        Err(RuntimeError::UnresolvedInputShape(name)) if name == "Placeholder"
    ));

    interpreter
        .resize_input("Placeholder", &[2, 3])
        .expect("resize");
    interpreter.allocate_tensors().expect("allocation");

    let input = interpreter.input_f32_mut("Placeholder").expect("input");
    for (position, value) in input.iter_mut().enumerate() {
        *value = position as f32 - 3.0;
    }
    interpreter
        .input_i32_mut("Placeholder_1")
        .expect("shape input")
        .copy_from_slice(&[1, 6]);

    interpreter.invoke().expect("invoke");

    assert_eq!(interpreter.tensor_shape("Relu").expect("shape"), vec![1, 6]);
    assert_eq!(
        interpreter.output_f32("Relu").expect("output"),
        vec![0.0, 0.0, 0.0, 0.0, 1.0, 2.0]
    );
}

#[test]
fn missing_tensor_name_fails_before_output_is_written() {
    init_logger();

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("broken.tflite");

    let converter = Converter::from_graph_def(unknown_dim_graph(), &["Placeholder"], &["Missing"]);
    // The script writes the output file only from a successful conversion.
    match converter.convert() {
        Ok(bytes) => std::fs::write(&path, bytes).expect("write"),
        Err(err) => {
            assert!(matches!(err, ConvertError::UnknownTensorName(name) if name == "Missing"));
        }
    }
    assert!(!path.exists());
}

#[test]
fn legacy_and_new_pipelines_agree() {
    init_logger();

    let input = [1.0f32, -2.0, 0.5, 2.0];

    let legacy = Converter::from_graph_def(dense_graph(), &["x"], &["act"]);
    let legacy_bytes = legacy.convert().expect("legacy conversion");

    let mut new = Converter::from_graph_def(dense_graph(), &["x"], &["act"]);
    new.new_converter = true;
    let new_bytes = new.convert().expect("new conversion");

    let legacy_out = run_dense(&legacy_bytes, &input);
    let new_out = run_dense(&new_bytes, &input);
    for (a, b) in legacy_out.iter().zip(&new_out) {
        assert!((a - b).abs() < 1e-6, "{legacy_out:?} vs {new_out:?}");
    }

    // The rewrites collapse matmul + bias + relu into one operator.
    let legacy_model = LiteModel::from_bytes(&legacy_bytes).expect("legacy model");
    let new_model = LiteModel::from_bytes(&new_bytes).expect("new model");
    assert_eq!(legacy_model.subgraph().operators.len(), 3);
    assert_eq!(new_model.subgraph().operators.len(), 1);
}

#[test]
fn both_quantizers_stay_close_to_float() {
    use rand::{Rng, SeedableRng};

    init_logger();

    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    let mut input = [0.0f32; 4];
    for value in &mut input {
        *value = rng.gen_range(-2.0..2.0);
    }
    let float_out = run_dense(
        &Converter::from_graph_def(dense_graph(), &["x"], &["act"])
            .convert()
            .expect("float conversion"),
        &input,
    );

    for new_quantizer in [false, true] {
        let mut converter = Converter::from_graph_def(dense_graph(), &["x"], &["act"]);
        converter.new_converter = true;
        converter.new_quantizer = new_quantizer;
        converter.quantize_weights = true;
        let bytes = converter.convert().expect("quantized conversion");

        let model = LiteModel::from_bytes(&bytes).expect("model loads");
        let weights = model
            .subgraph()
            .tensors
            .iter()
            .find(|tensor| tensor.name == "w")
            .expect("weight tensor");
        let expected = if new_quantizer {
            tensor_lite::lite::TensorType::Int8
        } else {
            tensor_lite::lite::TensorType::Uint8
        };
        assert_eq!(weights.r#type, expected as i32);

        let quantized_out = run_dense(&bytes, &input);
        for (a, b) in float_out.iter().zip(&quantized_out) {
            assert!((a - b).abs() < 0.05, "{float_out:?} vs {quantized_out:?}");
        }
    }
}

#[test]
fn unsupported_operator_needs_permissive_mode() {
    init_logger();

    let erf_graph = || {
        graph(vec![
            placeholder("x", tf::DataType::DtFloat, &[2]),
            node(
                "erf",
                "Erf",
                &["x"],
                vec![("T", attr_type(tf::DataType::DtFloat))],
            ),
        ])
    };

    let strict = Converter::from_graph_def(erf_graph(), &["x"], &["erf"]);
    assert!(matches!(
        strict.convert(),
        Err(ConvertError::UnsupportedOperator(op, _)) if op == "Erf"
    ));

    let mut permissive = Converter::from_graph_def(erf_graph(), &["x"], &["erf"]);
    permissive.allow_custom_ops = true;
    let bytes = permissive.convert().expect("permissive conversion");

    let model = LiteModel::from_bytes(&bytes).expect("model loads");
    let operator = &model.subgraph().operators[0];
    let (builtin, custom_name) = model.opcode(operator.opcode_index);
    assert_eq!(builtin, tensor_lite::lite::BuiltinOperator::Custom);
    assert_eq!(custom_name, "Erf");
    assert!(!operator.custom_options.is_empty());

    // This runtime refuses to execute pass-through operators.
    let mut interpreter = Interpreter::new(model);
    interpreter.allocate_tensors().expect("allocation");
    assert!(matches!(
        interpreter.invoke(),
        Err(RuntimeError::CustomOpNotSupported(name)) if name == "Erf"
    ));
}

#[test]
fn identity_outputs_take_the_requested_name() {
    init_logger();

    let g = graph(vec![
        placeholder("x", tf::DataType::DtFloat, &[2]),
        node(
            "relu",
            "Relu",
            &["x"],
            vec![("T", attr_type(tf::DataType::DtFloat))],
        ),
        node(
            "out",
            "Identity",
            &["relu"],
            vec![("T", attr_type(tf::DataType::DtFloat))],
        ),
    ]);
    let converter = Converter::from_graph_def(g, &["x"], &["out"]);
    let bytes = converter.convert().expect("conversion");

    let model = LiteModel::from_bytes(&bytes).expect("model loads");
    assert_eq!(model.output_names(), vec!["out"]);

    let mut interpreter = Interpreter::new(model);
    interpreter.allocate_tensors().expect("allocation");
    interpreter
        .input_f32_mut("x")
        .expect("input")
        .copy_from_slice(&[-1.0, 4.0]);
    interpreter.invoke().expect("invoke");
    assert_eq!(interpreter.output_f32("out").expect("output"), vec![0.0, 4.0]);
}

#[test]
fn concat_and_transpose_round_trip() {
    init_logger();

    let g = graph(vec![
        placeholder("a", tf::DataType::DtFloat, &[2, 2]),
        placeholder("b", tf::DataType::DtFloat, &[2, 2]),
        const_i32("axis", &[], &[0]),
        const_i32("perm", &[2], &[1, 0]),
        node(
            "joined",
            "ConcatV2",
            &["a", "b", "axis"],
            vec![
                ("T", attr_type(tf::DataType::DtFloat)),
                ("N", attr_int(2)),
            ],
        ),
        node(
            "flipped",
            "Transpose",
            &["joined", "perm"],
            vec![("T", attr_type(tf::DataType::DtFloat))],
        ),
    ]);

    let converter = Converter::from_graph_def(g, &["a", "b"], &["flipped"]);
    let bytes = converter.convert().expect("conversion");

    let model = LiteModel::from_bytes(&bytes).expect("model loads");
    let mut interpreter = Interpreter::new(model);
    interpreter.allocate_tensors().expect("allocation");
    interpreter
        .input_f32_mut("a")
        .expect("input a")
        .copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
    interpreter
        .input_f32_mut("b")
        .expect("input b")
        .copy_from_slice(&[5.0, 6.0, 7.0, 8.0]);
    interpreter.invoke().expect("invoke");

    // Concat along rows gives [4, 2]; the transpose flips it to [2, 4].
    assert_eq!(
        interpreter.tensor_shape("flipped").expect("shape"),
        vec![2, 4]
    );
    assert_eq!(
        interpreter.output_f32("flipped").expect("output"),
        vec![1.0, 3.0, 5.0, 7.0, 2.0, 4.0, 6.0, 8.0]
    );
}

#[test]
fn conv_bias_and_relu6_fuse_and_run() {
    init_logger();

    let g = graph(vec![
        placeholder("image", tf::DataType::DtFloat, &[1, 2, 2, 1]),
        const_f32("filter", &[1, 1, 1, 1], &[2.0]),
        const_f32("bias_term", &[1], &[0.5]),
        node(
            "conv",
            "Conv2D",
            &["image", "filter"],
            vec![
                ("T", attr_type(tf::DataType::DtFloat)),
                (
                    "strides",
                    tf::AttrValue {
                        value: Some(tf::attr_value::Value::List(tf::attr_value::ListValue {
                            i: vec![1, 1, 1, 1],
                            ..Default::default()
                        })),
                    },
                ),
                (
                    "padding",
                    tf::AttrValue {
                        value: Some(tf::attr_value::Value::S(b"SAME".to_vec())),
                    },
                ),
            ],
        ),
        node(
            "biased",
            "BiasAdd",
            &["conv", "bias_term"],
            vec![("T", attr_type(tf::DataType::DtFloat))],
        ),
        node(
            "clipped",
            "Relu6",
            &["biased"],
            vec![("T", attr_type(tf::DataType::DtFloat))],
        ),
    ]);

    let mut converter = Converter::from_graph_def(g, &["image"], &["clipped"]);
    converter.new_converter = true;
    let bytes = converter.convert().expect("conversion");

    let model = LiteModel::from_bytes(&bytes).expect("model loads");
    assert_eq!(model.subgraph().operators.len(), 1);

    let mut interpreter = Interpreter::new(model);
    interpreter.allocate_tensors().expect("allocation");
    interpreter
        .input_f32_mut("image")
        .expect("input")
        .copy_from_slice(&[-1.0, 0.0, 1.0, 4.0]);
    interpreter.invoke().expect("invoke");

    // 2x + 0.5, clamped to [0, 6].
    assert_eq!(
        interpreter.output_f32("clipped").expect("output"),
        vec![0.0, 0.5, 2.5, 6.0]
    );
}

#[test]
fn conversion_metadata_records_the_flags() {
    init_logger();

    let mut converter =
        Converter::from_graph_def(unknown_dim_graph(), &["Placeholder", "Placeholder_1"], &["Relu"]);
    converter.new_converter = true;
    converter.new_quantizer = true;
    converter.allow_custom_ops = true;
    let bytes = converter.convert().expect("conversion");

    let model = LiteModel::from_bytes(&bytes).expect("model loads");
    let metadata = model
        .conversion_metadata()
        .expect("metadata parses")
        .expect("metadata present");
    assert!(metadata.new_converter);
    assert!(metadata.new_quantizer);
    assert!(metadata.allow_custom_ops);
    assert!(!metadata.quantize_weights);
    assert!(metadata.producer.starts_with("tensor-lite-import"));
}
