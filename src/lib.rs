pub mod dtype;
pub mod interpreter;
pub mod model;
pub mod tensor;

pub mod lite {
    include!(concat!(env!("OUT_DIR"), "/lite.rs"));
}

pub use interpreter::Interpreter;
pub use model::LiteModel;
pub use tensor::TensorData;
