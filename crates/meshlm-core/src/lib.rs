//! # meshlm-core
//!
//! Named-dimension tensors, autograd, the variable registry and mesh layout
//! planning for meshlm.
//!
//! This crate provides:
//! - [`Shape`] / [`Dim`]: shapes made of uniquely named dimensions
//! - [`Tensor`]: n-dimensional array whose ops match dimensions by name
//! - [`GradStore`]: gradient storage returned by `backward()`, plus
//!   [`checkpoint`] for recomputed segments
//! - [`VarStore`] / [`VarBuilder`]: path-keyed registry of trainable variables
//! - [`MeshPlan`]: mesh shape + layout rules, shard queries and validation
//! - [`auto_layout`]: heuristic layout and mesh search over a built graph
// - DType: precisions and the variable precision triple
// - Shape: named dimension algebra
// - Tensor/Op/Backprop: eager named-dimension ops with a reverse-mode tape
// - VarStore: explicit variable scoping, no ambient naming stack
// - Mesh/AutoLayout: where each named dimension lives on the device mesh

pub mod auto_layout;
pub mod backprop;
pub mod dtype;
pub mod error;
pub mod mesh;
pub mod op;
pub mod shape;
pub mod tensor;
pub mod var_store;

pub use auto_layout::{GraphTrace, LayoutProposal};
pub use backprop::{checkpoint, GradStore};
pub use dtype::{DType, VariableDType};
pub use error::{Error, Result};
pub use mesh::{CommLedger, CommStats, LayoutRules, MeshAxis, MeshPlan, MeshShape};
pub use op::{Op, TensorId};
pub use shape::{Dim, Shape};
pub use tensor::Tensor;
pub use var_store::{Init, VarBuilder, VarStore, Variable};
