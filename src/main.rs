use std::path::Path;

use tensor_lite_import::Converter;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    // Frozen graph base name, without ".pb".
    let graph_def_file = "unknown_dim_reshape";

    let input_arrays = ["Placeholder", "Placeholder_1"];
    let output_arrays = ["Relu"];

    let mut converter = Converter::from_frozen_graph(
        Path::new(&format!("{graph_def_file}.pb")),
        &input_arrays,
        &output_arrays,
    )?;
    converter.new_converter = true;
    converter.new_quantizer = true;
    converter.allow_custom_ops = true;

    let lite_model = converter.convert()?;

    std::fs::write(format!("{graph_def_file}.tflite"), &lite_model)?;
    log::info!(
        "Wrote {} bytes to {graph_def_file}.tflite",
        lite_model.len()
    );
    Ok(())
}
