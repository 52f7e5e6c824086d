// FeedForward: dense → gelu → dense over an expanded intermediate dim
//
//   plain   h = gelu(c_fc(x))                 intermediate_expanded = 4·embd
//   GLU     [u; gate] = c_fc(x)               intermediate_expanded = 8·embd
//           h = u * gelu(gate)                (each half 4·embd)
//   y = dropout(c_proj(h))
//
// c_proj feeds the residual stream, so it gets the depth-scaled init.

use meshlm_core::{Dim, Result, Tensor, VarBuilder, Variable};

use crate::context::Context;
use crate::dense::Dense;
use crate::dims;
use crate::dropout::Dropout;
use crate::init::InitConfig;
use crate::module::Module;

pub struct FeedForward {
    c_fc: Dense,
    c_proj: Dense,
    dropout: Dropout,
    glu: bool,
    hidden: usize,
}

impl FeedForward {
    /// Build in the scope of `vb` (e.g. `h0/mlp`).
    pub fn new(
        vb: &mut VarBuilder<'_>,
        embd: &Dim,
        glu: bool,
        res_dropout: f64,
        init: &InitConfig,
    ) -> Result<Self> {
        let hidden = embd.size() * 4;
        let expanded = Dim::new(dims::INTERMEDIATE, if glu { hidden * 2 } else { hidden });
        let c_fc = Dense::new(
            &mut vb.pp("c_fc"),
            std::slice::from_ref(embd),
            &[expanded],
            true,
            init,
            false,
        )?;
        let c_proj = Dense::new(
            &mut vb.pp("c_proj"),
            &[Dim::new(dims::INTERMEDIATE, hidden)],
            std::slice::from_ref(embd),
            true,
            init,
            true,
        )?;
        Ok(FeedForward {
            c_fc,
            c_proj,
            dropout: Dropout::new(res_dropout, vb.path("mlp_dropout"))?,
            glu,
            hidden,
        })
    }
}

impl Module for FeedForward {
    fn forward(&self, ctx: &mut Context<'_>, x: &Tensor) -> Result<Tensor> {
        let h = self.c_fc.forward(ctx, x)?;
        let h = if self.glu {
            let u = h.slice(dims::INTERMEDIATE, 0, self.hidden)?;
            let gate = h.slice(dims::INTERMEDIATE, self.hidden, self.hidden)?;
            u.mul(&gate.gelu()?)?
        } else {
            h.gelu()?
        };
        let y = self.c_proj.forward(ctx, &h)?;
        self.dropout.forward(ctx, &y)
    }

    fn variables(&self) -> Vec<Variable> {
        let mut v = self.c_fc.variables();
        v.extend(self.c_proj.variables());
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshlm_core::{CommLedger, DType, MeshPlan, Shape, VarStore, VariableDType};
    use std::sync::Arc;

    use crate::context::Mode;

    fn run(glu: bool) -> (Tensor, usize) {
        let mut vs = VarStore::new(VariableDType::uniform(DType::F64), 5);
        let embd = Dim::new("embd", 4);
        let ff = FeedForward::new(&mut vs.root().pp("mlp"), &embd, glu, 0.0, &InitConfig::default())
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
        (ff.forward(&mut ctx, &x).unwrap(), ff.num_parameters())
    }

    #[test]
    fn test_plain_and_glu_widths() {
        let (y, n) = run(false);
        assert_eq!(y.shape().names(), vec!["batch", "sequence", "embd"]);
        assert_eq!(n, (4 * 16 + 16) + (16 * 4 + 4));
        let (y, n) = run(true);
        assert_eq!(y.shape().sizes(), vec![2, 3, 4]);
        assert_eq!(n, (4 * 32 + 32) + (16 * 4 + 4));
    }
}
