use std::io::Result;
use std::path::Path;

fn main() -> Result<()> {
    let proto_dir = Path::new("protos");
    prost_build::compile_protos(&[proto_dir.join("lite.proto")], &[proto_dir])?;
    Ok(())
}
