// Op: computational graph node for automatic differentiation
//
// Every tensor produced by a differentiable operation records HOW it was
// created. The records form a DAG that backward() walks in reverse
// topological order, applying the chain rule at every node.
//
// Example: c = einsum([a, b], [batch, vocab])
//   a.op = Op::None (leaf variable)
//   b.op = Op::None (leaf variable)
//   c.op = Op::Einsum { inputs: [a, b] }
//
// Each variant stores the input tensors themselves (Arc-wrapped, cheap to
// clone), so backward() can read input values and the graph keeps its inputs
// alive for exactly as long as the output exists.
//
// Operations whose inputs do not require gradients record Op::None: masks,
// one-hot encodings and position tables never enter the tape.

use std::sync::Arc;

use crate::backprop::RecomputeNode;
use crate::dtype::DType;
use crate::tensor::Tensor;

/// Unique identifier for a tensor. Used as keys in GradStore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(pub(crate) u64);

impl Default for TensorId {
    fn default() -> Self {
        Self::new()
    }
}

impl TensorId {
    /// Generate a new unique tensor ID (uses a global atomic counter).
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        TensorId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Exp,
    Log,
    Sqrt,
    Rsqrt,
    Square,
    Gelu,
    Relu,
    Tanh,
}

/// Records the operation that produced a tensor.
///
/// Dimension arguments are stored by name, never by position.
#[derive(Clone)]
pub enum Op {
    /// Leaf: a variable, an input, or a constant.
    None,

    /// Elementwise op, operands broadcast over the union of their names.
    Binary {
        lhs: Tensor,
        rhs: Tensor,
        op: BinaryOp,
    },

    Unary {
        input: Tensor,
        op: UnaryOp,
    },

    /// `input * mul + add`
    Affine {
        input: Tensor,
        mul: f64,
        add: f64,
    },

    /// Product of all inputs, summed over every name absent from the
    /// output shape and broadcast over output names absent from the inputs.
    /// Covers contraction, reduction, broadcast and permutation.
    Einsum {
        inputs: Vec<Tensor>,
    },

    /// Same data order, new shape (also used for renames).
    Reshape {
        input: Tensor,
        src_shape: crate::shape::Shape,
    },

    Cumsum {
        input: Tensor,
        dim: String,
        reverse: bool,
    },

    /// Move values `offset` steps along `dim`, filling with zeros.
    Shift {
        input: Tensor,
        dim: String,
        offset: isize,
    },

    Slice {
        input: Tensor,
        dim: String,
        start: usize,
        len: usize,
    },

    Pad {
        input: Tensor,
        dim: String,
        before: usize,
        after: usize,
    },

    Concat {
        inputs: Vec<Tensor>,
        dim: String,
    },

    /// Rows of `table` along `dim` selected by `ids`. Only `table` is
    /// differentiable.
    Gather {
        table: Tensor,
        ids: Tensor,
        dim: String,
    },

    Cast {
        input: Tensor,
        src: DType,
    },

    /// Output `index` of a recomputed segment (gradient checkpointing).
    Recompute {
        node: Arc<RecomputeNode>,
        index: usize,
    },
}

impl Op {
    /// The differentiable inputs of this op.
    pub fn inputs(&self) -> Vec<&Tensor> {
        match self {
            Op::None => vec![],
            Op::Binary { lhs, rhs, .. } => vec![lhs, rhs],
            Op::Unary { input, .. }
            | Op::Affine { input, .. }
            | Op::Reshape { input, .. }
            | Op::Cumsum { input, .. }
            | Op::Shift { input, .. }
            | Op::Slice { input, .. }
            | Op::Pad { input, .. }
            | Op::Cast { input, .. } => vec![input],
            Op::Einsum { inputs } | Op::Concat { inputs, .. } => inputs.iter().collect(),
            Op::Gather { table, .. } => vec![table],
            Op::Recompute { node, .. } => node.inputs().iter().collect(),
        }
    }

    /// Short name used by graph traces and debug output.
    pub fn kind(&self) -> &'static str {
        match self {
            Op::None => "leaf",
            Op::Binary { .. } => "binary",
            Op::Unary { .. } => "unary",
            Op::Affine { .. } => "affine",
            Op::Einsum { .. } => "einsum",
            Op::Reshape { .. } => "reshape",
            Op::Cumsum { .. } => "cumsum",
            Op::Shift { .. } => "shift",
            Op::Slice { .. } => "slice",
            Op::Pad { .. } => "pad",
            Op::Concat { .. } => "concat",
            Op::Gather { .. } => "gather",
            Op::Cast { .. } => "cast",
            Op::Recompute { .. } => "recompute",
        }
    }
}

impl std::fmt::Debug for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Op::{}(", self.kind())?;
        for (i, t) in self.inputs().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", t.shape())?;
        }
        write!(f, ")")
    }
}
