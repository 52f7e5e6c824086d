// Dense: named-dimension projection
//
// A Dense layer contracts the `reduced` dimensions of its input against a
// weight [reduced…, new…] and appends the `new` dimensions:
//
//   x: [batch, sequence, embd]   w: [embd, intermediate_expanded]
//   y = einsum(x, w) + b         y: [batch, sequence, intermediate_expanded]
//
// Every other input dimension passes through in order, so the same layer
// serves full sequences and single decode positions alike.

use meshlm_core::{Dim, Init, Result, Shape, Tensor, VarBuilder, Variable};

use crate::context::Context;
use crate::init::InitConfig;
use crate::module::Module;

/// A named-dimension projection with optional bias.
pub struct Dense {
    w: Variable,
    b: Option<Variable>,
    reduced: Vec<String>,
    new_dims: Vec<Dim>,
}

impl Dense {
    /// Register `w` (and `b` when `use_bias`) in the scope of `vb`.
    ///
    /// `residual` marks projections feeding a residual output, which get the
    /// depth-scaled init when enabled.
    pub fn new(
        vb: &mut VarBuilder<'_>,
        reduced: &[Dim],
        new_dims: &[Dim],
        use_bias: bool,
        init: &InitConfig,
        residual: bool,
    ) -> Result<Self> {
        let in_features: usize = reduced.iter().map(Dim::size).product();
        let std = init.std_for(in_features, residual);
        let mut w_dims = reduced.to_vec();
        w_dims.extend_from_slice(new_dims);
        let w = vb.get("w", Shape::new(w_dims)?, Init::Normal { std })?;
        let b = if use_bias {
            Some(vb.get("b", Shape::new(new_dims.to_vec())?, Init::Zeros)?)
        } else {
            None
        };
        Ok(Dense {
            w,
            b,
            reduced: reduced.iter().map(|d| d.name().to_string()).collect(),
            new_dims: new_dims.to_vec(),
        })
    }

    pub fn weight(&self) -> &Variable {
        &self.w
    }

    /// Shape of the output for an input of shape `input`.
    pub fn output_shape(&self, input: &Shape) -> Result<Shape> {
        let reduced: Vec<&str> = self.reduced.iter().map(String::as_str).collect();
        for r in &reduced {
            input.dim(r)?;
        }
        input
            .without_all(&reduced)
            .concat(&Shape::new(self.new_dims.clone())?)
    }
}

impl Module for Dense {
    fn forward(&self, ctx: &mut Context<'_>, x: &Tensor) -> Result<Tensor> {
        let out_shape = self.output_shape(x.shape())?;
        let y = ctx.contract(&[x, &self.w.value()?], &out_shape)?;
        match &self.b {
            Some(b) => y.add(&b.value()?),
            None => Ok(y),
        }
    }

    fn variables(&self) -> Vec<Variable> {
        let mut v = vec![self.w.clone()];
        v.extend(self.b.clone());
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshlm_core::{CommLedger, DType, LayoutRules, MeshPlan, MeshShape, VarStore, VariableDType};
    use std::sync::Arc;

    use crate::context::Mode;

    #[test]
    fn test_dense_shapes_and_bias() {
        let mut vs = VarStore::new(VariableDType::uniform(DType::F64), 3);
        let embd = Dim::new("embd", 4);
        let hidden = Dim::new("intermediate_expanded", 6);
        let dense = Dense::new(
            &mut vs.root().pp("c_fc"),
            &[embd],
            &[hidden],
            true,
            &InitConfig::default(),
            false,
        )
        .unwrap();
        let mut ctx = Context::new(
            Mode::Eval,
            VariableDType::uniform(DType::F64),
            Arc::new(MeshPlan::single_device()),
            Arc::new(CommLedger::new()),
        );
        let x = Tensor::ones(
            Shape::from_pairs(&[("batch", 2), ("sequence", 3), ("embd", 4)]).unwrap(),
            DType::F64,
        );
        let y = dense.forward(&mut ctx, &x).unwrap();
        assert_eq!(y.shape().names(), vec!["batch", "sequence", "intermediate_expanded"]);
        assert_eq!(dense.num_parameters(), 4 * 6 + 6);
        assert!(vs.get("c_fc/w").is_some());
    }

    #[test]
    fn test_contraction_over_sharded_dim_is_recorded() {
        let mut vs = VarStore::new(VariableDType::uniform(DType::F64), 3);
        let dense = Dense::new(
            &mut vs.root().pp("proj"),
            &[Dim::new("embd", 4)],
            &[Dim::new("vocab", 6)],
            false,
            &InitConfig::default(),
            false,
        )
        .unwrap();
        let plan = MeshPlan::new(
            MeshShape::parse("x:2").unwrap(),
            LayoutRules::parse("embd:x").unwrap(),
        )
        .unwrap();
        let ledger = Arc::new(CommLedger::new());
        let mut ctx = Context::new(
            Mode::Eval,
            VariableDType::uniform(DType::F64),
            Arc::new(plan),
            Arc::clone(&ledger),
        );
        let x = Tensor::ones(Shape::from_pairs(&[("batch", 2), ("embd", 4)]).unwrap(), DType::F64);
        dense.forward(&mut ctx, &x).unwrap();
        assert_eq!(ledger.stats().allreduces, 1);
        assert_eq!(ledger.stats().elements, 12);
    }
}
