// Module trait: the interface every layer implements
//
// A layer is a plain struct holding the Variables it registered at
// construction. `forward` receives the explicit Context alongside the input,
// so the same layer runs under any mode, precision or mesh plan.
//
// Variables are returned as handles to the registry entries; their tensors
// share storage with the VarStore, which is what optimizers and checkpoint
// hooks act on.

use meshlm_core::{Result, Tensor, Variable};

use crate::context::Context;

/// The trait every layer implements.
pub trait Module {
    /// Compute the output from `x`.
    fn forward(&self, ctx: &mut Context<'_>, x: &Tensor) -> Result<Tensor>;

    /// Variables owned by this layer, in registration order.
    fn variables(&self) -> Vec<Variable>;

    /// Total number of trainable scalars.
    fn num_parameters(&self) -> usize {
        self.variables()
            .iter()
            .map(|v| v.shape().elem_count())
            .sum()
    }
}
