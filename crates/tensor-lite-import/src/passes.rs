use std::collections::HashMap;

use crate::graph_ir::{self, Activation, IrNode};
use crate::lite;

fn consumer_counts(nodes: &[IrNode], outputs: &[String]) -> HashMap<String, usize> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for node in nodes {
        for input in &node.inputs {
            *counts.entry(input.clone()).or_default() += 1;
        }
        if let Some(bias) = &node.bias_input {
            *counts.entry(bias.clone()).or_default() += 1;
        }
    }
    // A requested output tensor has an external consumer.
    for output in outputs {
        *counts.entry(output.clone()).or_default() += 1;
    }
    counts
}

fn position_of(nodes: &[IrNode], name: &str) -> Option<usize> {
    nodes.iter().position(|node| node.name == name)
}

/// Folds a BiasAdd into its single-consumer MatMul/Conv2D producer. The
/// producer takes over the BiasAdd's name so downstream edges stay intact.
pub(crate) fn fold_biases(nodes: &mut Vec<IrNode>, outputs: &[String]) {
    loop {
        let counts = consumer_counts(nodes, outputs);
        let candidate = nodes.iter().position(|node| {
            if node.op != "BiasAdd" || node.inputs.len() != 2 {
                return false;
            }
            if let Some(format) = graph_ir::attr_string(&node.attrs, "data_format") {
                if format != "NHWC" {
                    return false;
                }
            }
            let Some(producer) = position_of(nodes, &node.inputs[0]) else {
                return false;
            };
            let producer = &nodes[producer];
            matches!(producer.op.as_str(), "MatMul" | "Conv2D")
                && producer.bias_input.is_none()
                && producer.fused_activation == Activation::None
                && counts.get(&node.inputs[0]) == Some(&1)
        });
        let Some(index) = candidate else {
            return;
        };
        let folded = nodes.remove(index);
        let producer = position_of(nodes, &folded.inputs[0]).expect("checked above");
        let mut fused = nodes.remove(producer);
        fused.bias_input = Some(folded.inputs[1].clone());
        fused.name = folded.name;
        log::debug!("Folded bias into node \"{}\"", fused.name);
        // The fused node takes over the folded node's slot: the folded node
        // sat after every operand the fused node now references.
        nodes.insert(index - 1, fused);
    }
}

const ACTIVATION_FUSABLE: &[&str] = &[
    "Add", "AddV2", "BiasAdd", "Sub", "Mul", "RealDiv", "MatMul", "Conv2D",
];

/// Folds a Relu/Relu6 into its single-consumer arithmetic producer as the
/// fused activation function.
pub(crate) fn fold_activations(nodes: &mut Vec<IrNode>, outputs: &[String]) {
    loop {
        let counts = consumer_counts(nodes, outputs);
        let candidate = nodes.iter().position(|node| {
            if !matches!(node.op.as_str(), "Relu" | "Relu6") || node.inputs.len() != 1 {
                return false;
            }
            let Some(producer) = position_of(nodes, &node.inputs[0]) else {
                return false;
            };
            let producer = &nodes[producer];
            ACTIVATION_FUSABLE.contains(&producer.op.as_str())
                && producer.fused_activation == Activation::None
                && counts.get(&node.inputs[0]) == Some(&1)
        });
        let Some(index) = candidate else {
            return;
        };
        let folded = nodes.remove(index);
        let producer = position_of(nodes, &folded.inputs[0]).expect("checked above");
        let mut fused = nodes.remove(producer);
        fused.fused_activation = if folded.op == "Relu6" {
            Activation::Relu6
        } else {
            Activation::Relu
        };
        fused.name = folded.name;
        log::debug!("Folded activation into node \"{}\"", fused.name);
        nodes.insert(index - 1, fused);
    }
}

/// Collapses identical constant buffers onto a single entry.
pub(crate) fn dedup_buffers(model: &mut lite::Model) {
    let mut first_by_data: HashMap<Vec<u8>, u32> = HashMap::new();
    let mut remap: Vec<u32> = Vec::with_capacity(model.buffers.len());
    let mut kept: Vec<lite::Buffer> = Vec::new();
    for buffer in &model.buffers {
        match first_by_data.get(&buffer.data) {
            Some(index) => remap.push(*index),
            None => {
                let index = kept.len() as u32;
                first_by_data.insert(buffer.data.clone(), index);
                kept.push(buffer.clone());
                remap.push(index);
            }
        }
    }
    if kept.len() < model.buffers.len() {
        log::debug!(
            "Deduplicated {} constant buffers",
            model.buffers.len() - kept.len()
        );
    }
    model.buffers = kept;
    for subgraph in &mut model.subgraphs {
        for tensor in &mut subgraph.tensors {
            tensor.buffer = remap[tensor.buffer as usize];
        }
    }
}
