use std::collections::{HashMap, HashSet};

use crate::ConvertError;
use crate::tf;

pub(crate) fn attr_int(attrs: &HashMap<String, tf::AttrValue>, name: &str) -> Option<i64> {
    if let Some(attr) = attrs.get(name) {
        if let Some(tf::attr_value::Value::I(i)) = attr.value {
            return Some(i);
        }
    }
    None
}

pub(crate) fn attr_ints(attrs: &HashMap<String, tf::AttrValue>, name: &str) -> Option<Vec<i64>> {
    if let Some(attr) = attrs.get(name) {
        if let Some(tf::attr_value::Value::List(list)) = &attr.value {
            return Some(list.i.clone());
        }
    }
    None
}

pub(crate) fn attr_bool(attrs: &HashMap<String, tf::AttrValue>, name: &str) -> Option<bool> {
    if let Some(attr) = attrs.get(name) {
        if let Some(tf::attr_value::Value::B(b)) = attr.value {
            return Some(b);
        }
    }
    None
}

pub(crate) fn attr_string(attrs: &HashMap<String, tf::AttrValue>, name: &str) -> Option<String> {
    if let Some(attr) = attrs.get(name) {
        if let Some(tf::attr_value::Value::S(s)) = &attr.value {
            return Some(String::from_utf8_lossy(s).to_string());
        }
    }
    None
}

pub(crate) fn attr_dtype(
    attrs: &HashMap<String, tf::AttrValue>,
    name: &str,
) -> Option<tf::DataType> {
    if let Some(attr) = attrs.get(name) {
        if let Some(tf::attr_value::Value::Type(t)) = attr.value {
            return tf::DataType::try_from(t).ok();
        }
    }
    None
}

pub(crate) fn attr_shape(
    attrs: &HashMap<String, tf::AttrValue>,
    name: &str,
) -> Option<tf::TensorShapeProto> {
    if let Some(attr) = attrs.get(name) {
        if let Some(tf::attr_value::Value::Shape(shape)) = &attr.value {
            return Some(shape.clone());
        }
    }
    None
}

pub(crate) fn attr_tensor(
    attrs: &HashMap<String, tf::AttrValue>,
    name: &str,
) -> Option<tf::TensorProto> {
    if let Some(attr) = attrs.get(name) {
        if let Some(tf::attr_value::Value::Tensor(tensor)) = &attr.value {
            return Some(tensor.clone());
        }
    }
    None
}

/// A `NodeDef.input` entry: either a data edge or a control dependency.
pub(crate) enum InputRef {
    /// Canonical producing-node name, output 0.
    Data(String),
    Control(String),
}

pub(crate) fn parse_input_ref(raw: &str) -> Result<InputRef, ConvertError> {
    if let Some(name) = raw.strip_prefix('^') {
        return Ok(InputRef::Control(name.to_string()));
    }
    match raw.split_once(':') {
        None => Ok(InputRef::Data(raw.to_string())),
        Some((name, index)) => {
            let index: usize = index
                .parse()
                .map_err(|_| ConvertError::MultiOutputEdge(raw.to_string()))?;
            if index == 0 {
                Ok(InputRef::Data(name.to_string()))
            } else {
                Err(ConvertError::MultiOutputEdge(raw.to_string()))
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Activation {
    None,
    Relu,
    Relu6,
}

/// A graph node retained by the slice, with data edges resolved to tensor
/// names and room for the rewrites the newer pipeline performs.
#[derive(Clone, Debug)]
pub(crate) struct IrNode {
    pub name: String,
    pub op: String,
    pub inputs: Vec<String>,
    pub attrs: HashMap<String, tf::AttrValue>,
    pub bias_input: Option<String>,
    pub fused_activation: Activation,
}

/// A model boundary tensor and what is known about it at conversion time.
#[derive(Clone, Debug)]
pub(crate) struct InputSpec {
    pub name: String,
    pub dtype: tf::DataType,
    /// None when the rank itself is unknown.
    pub shape: Option<Vec<i64>>,
}

pub(crate) struct GraphSlice {
    pub inputs: Vec<InputSpec>,
    /// Topologically ordered; excludes the nodes the input cut discards.
    pub nodes: Vec<IrNode>,
}

#[derive(Clone, Copy, PartialEq)]
enum VisitState {
    InProgress,
    Done,
}

/// Prunes the graph to the subgraph between the named inputs and outputs and
/// returns it in topological order. The named tensors must exist; this is the
/// first check so a bad name fails conversion before any other work.
pub(crate) fn slice_graph(
    graph: &tf::GraphDef,
    input_arrays: &[String],
    output_arrays: &[String],
) -> Result<GraphSlice, ConvertError> {
    let mut nodes_by_name: HashMap<&str, &tf::NodeDef> = HashMap::new();
    for node in &graph.node {
        if nodes_by_name.insert(node.name.as_str(), node).is_some() {
            return Err(ConvertError::DuplicateNodeName(node.name.clone()));
        }
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for name in input_arrays.iter().chain(output_arrays) {
        if !nodes_by_name.contains_key(name.as_str()) {
            return Err(ConvertError::UnknownTensorName(name.clone()));
        }
        if !seen.insert(name) {
            return Err(ConvertError::RepeatedArrayEntry(name.clone()));
        }
    }
    for name in output_arrays {
        if input_arrays.contains(name) {
            return Err(ConvertError::InputIsOutput(name.clone()));
        }
    }

    let input_set: HashSet<&str> = input_arrays.iter().map(|s| s.as_str()).collect();

    // Post-order DFS from the outputs, cutting at the input nodes.
    let mut states: HashMap<String, VisitState> = HashMap::new();
    let mut ordered: Vec<IrNode> = Vec::new();
    for output in output_arrays {
        visit(
            output,
            &nodes_by_name,
            &input_set,
            &mut states,
            &mut ordered,
        )?;
    }

    let mut inputs = Vec::new();
    for name in input_arrays {
        let node = nodes_by_name[name.as_str()];
        let dtype = attr_dtype(&node.attr, "dtype")
            .or_else(|| attr_dtype(&node.attr, "T"))
            .ok_or_else(|| ConvertError::MissingAttribute(name.clone(), "dtype".to_string()))?;
        let shape = attr_shape(&node.attr, "shape").and_then(|shape| {
            if shape.unknown_rank {
                None
            } else {
                Some(shape.dim.iter().map(|d| d.size).collect())
            }
        });
        inputs.push(InputSpec {
            name: name.clone(),
            dtype,
            shape,
        });
    }

    Ok(GraphSlice {
        inputs,
        nodes: ordered,
    })
}

fn visit(
    name: &str,
    nodes_by_name: &HashMap<&str, &tf::NodeDef>,
    input_set: &HashSet<&str>,
    states: &mut HashMap<String, VisitState>,
    ordered: &mut Vec<IrNode>,
) -> Result<(), ConvertError> {
    match states.get(name) {
        Some(VisitState::Done) => return Ok(()),
        Some(VisitState::InProgress) => return Err(ConvertError::GraphCycle(name.to_string())),
        None => {}
    }
    if input_set.contains(name) {
        states.insert(name.to_string(), VisitState::Done);
        return Ok(());
    }
    let node = *nodes_by_name
        .get(name)
        .ok_or_else(|| ConvertError::UnknownTensorName(name.to_string()))?;
    states.insert(name.to_string(), VisitState::InProgress);

    let mut data_inputs = Vec::new();
    for raw in &node.input {
        match parse_input_ref(raw)? {
            InputRef::Control(_) => {}
            InputRef::Data(producer) => {
                visit(&producer, nodes_by_name, input_set, states, ordered)?;
                data_inputs.push(producer);
            }
        }
    }

    states.insert(name.to_string(), VisitState::Done);
    ordered.push(IrNode {
        name: node.name.clone(),
        op: node.op.clone(),
        inputs: data_inputs,
        attrs: node.attr.clone(),
        bias_input: None,
        fused_activation: Activation::None,
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, op: &str, inputs: &[&str]) -> tf::NodeDef {
        tf::NodeDef {
            name: name.to_string(),
            op: op.to_string(),
            input: inputs.iter().map(|s| s.to_string()).collect(),
            device: String::new(),
            attr: HashMap::new(),
        }
    }

    fn float_placeholder(name: &str, dims: &[i64]) -> tf::NodeDef {
        let mut n = node(name, "Placeholder", &[]);
        n.attr.insert(
            "dtype".to_string(),
            tf::AttrValue {
                value: Some(tf::attr_value::Value::Type(tf::DataType::DtFloat as i32)),
            },
        );
        n.attr.insert(
            "shape".to_string(),
            tf::AttrValue {
                value: Some(tf::attr_value::Value::Shape(tf::TensorShapeProto {
                    dim: dims
                        .iter()
                        .map(|size| tf::tensor_shape_proto::Dim {
                            size: *size,
                            name: String::new(),
                        })
                        .collect(),
                    unknown_rank: false,
                })),
            },
        );
        n
    }

    fn graph(nodes: Vec<tf::NodeDef>) -> tf::GraphDef {
        tf::GraphDef {
            node: nodes,
            versions: None,
        }
    }

    #[test]
    fn input_ref_forms() {
        assert!(matches!(
            parse_input_ref("x").unwrap(),
            InputRef::Data(name) if name == "x"
        ));
        assert!(matches!(
            parse_input_ref("x:0").unwrap(),
            InputRef::Data(name) if name == "x"
        ));
        assert!(matches!(
            parse_input_ref("^x").unwrap(),
            InputRef::Control(name) if name == "x"
        ));
        assert!(matches!(
            parse_input_ref("x:1"),
            Err(ConvertError::MultiOutputEdge(_))
        ));
    }

    #[test]
    fn slice_prunes_unreached_nodes() {
        let g = graph(vec![
            float_placeholder("in", &[2, 2]),
            node("relu", "Relu", &["in"]),
            node("dead", "Relu", &["in"]),
        ]);
        let slice = slice_graph(&g, &["in".to_string()], &["relu".to_string()]).unwrap();
        assert_eq!(slice.nodes.len(), 1);
        assert_eq!(slice.nodes[0].name, "relu");
    }

    #[test]
    fn slice_orders_topologically() {
        // Node list order is deliberately scrambled.
        let g = graph(vec![
            node("add", "Add", &["relu", "relu"]),
            node("relu", "Relu", &["in"]),
            float_placeholder("in", &[2]),
        ]);
        let slice = slice_graph(&g, &["in".to_string()], &["add".to_string()]).unwrap();
        let order: Vec<&str> = slice.nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(order, vec!["relu", "add"]);
    }

    #[test]
    fn slice_cuts_at_named_inputs() {
        // "mid" is named as an input, so "pre" must not be visited at all.
        let g = graph(vec![
            float_placeholder("pre", &[2]),
            {
                let mut n = node("mid", "Relu", &["pre"]);
                n.attr.insert(
                    "T".to_string(),
                    tf::AttrValue {
                        value: Some(tf::attr_value::Value::Type(tf::DataType::DtFloat as i32)),
                    },
                );
                n
            },
            node("out", "Relu", &["mid"]),
        ]);
        let slice = slice_graph(&g, &["mid".to_string()], &["out".to_string()]).unwrap();
        assert_eq!(slice.nodes.len(), 1);
        assert_eq!(slice.inputs[0].name, "mid");
        assert_eq!(slice.inputs[0].shape, None);
    }

    #[test]
    fn missing_tensor_name_is_rejected() {
        let g = graph(vec![float_placeholder("in", &[2])]);
        let err = slice_graph(&g, &["in".to_string()], &["nope".to_string()]).unwrap_err();
        assert!(matches!(err, ConvertError::UnknownTensorName(name) if name == "nope"));
    }

    #[test]
    fn cycle_is_rejected() {
        let g = graph(vec![
            float_placeholder("in", &[2]),
            node("a", "Add", &["in", "b"]),
            node("b", "Relu", &["a"]),
        ]);
        let err = slice_graph(&g, &["in".to_string()], &["b".to_string()]).unwrap_err();
        assert!(matches!(err, ConvertError::GraphCycle(_)));
    }

    #[test]
    fn unknown_dims_survive_as_negative_sizes() {
        let g = graph(vec![
            float_placeholder("in", &[-1, -1]),
            node("relu", "Relu", &["in"]),
        ]);
        let slice = slice_graph(&g, &["in".to_string()], &["relu".to_string()]).unwrap();
        assert_eq!(slice.inputs[0].shape, Some(vec![-1, -1]));
    }
}
