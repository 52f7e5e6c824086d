//! # meshlm
//!
//! A GPT-style language model on a named-dimension device mesh.
//!
//! This is the top-level crate: configuration, the model graph builder and
//! the step controller that trains, evaluates and predicts with it.
//!
//! ## Usage
//!
//! ```rust
//! use meshlm::prelude::*;
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `meshlm-core` | Named shapes, Tensor, autograd, VarStore, mesh plans, auto-layout |
//! | `meshlm-nn` | Context, norms, dense, embeddings, attention variants, MLP, MoE, loss |
//! | `meshlm` | Parameters, features, model builder, microbatching, estimator |
//!
//! ## Modules
//!
//! - [`config`]: model parameters read from a JSON document
//! - [`features`]: the named tensors fed to one step
//! - [`model`]: block specs, the compiled `GptModel` and its forward pass
//! - [`microbatch`]: gradient accumulation over batch slices
//! - [`optim`]: the optimizer seam and plain SGD
//! - [`checkpoint`]: binary variable snapshots and checkpoint hooks
//! - [`estimator`]: TRAIN / EVAL / PREDICT steps and incremental decoding

/// Re-export core types.
pub use meshlm_core::{
    DType, Dim, Error, LayoutRules, MeshPlan, MeshShape, Result, Shape, Tensor, VarStore,
    Variable, VariableDType,
};

/// Re-export the layer library.
pub mod nn {
    pub use meshlm_nn::*;
}

pub mod checkpoint;
pub mod config;
pub mod estimator;
pub mod features;
pub mod microbatch;
pub mod model;
pub mod optim;

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::checkpoint::{CheckpointHook, FileCheckpointHook};
    pub use crate::config::{ModelParams, NormPlacement};
    pub use crate::estimator::{
        propose_layout, DecodeSession, Estimator, EvalMetrics, Predictions, StepOutput,
        TrainOutput,
    };
    pub use crate::features::{token_tensor, Features};
    pub use crate::microbatch::MicrobatchPlan;
    pub use crate::model::{GptModel, ModelOutput, ModelSpec};
    pub use crate::nn::{AttentionKind, Context, Mode};
    pub use crate::optim::{Optimizer, Sgd, Update};
    pub use crate::{DType, Dim, Error, Result, Shape, Tensor, VarStore, VariableDType};
}
