// Model graph builder: declarative spec, blocks and the compiled model

pub mod block;
pub mod gpt;
pub mod spec;

pub use block::Block;
pub use gpt::{GptModel, ModelOutput};
pub use spec::{BlockSpec, ModelSpec, OutputSpec, PositionSpec};
