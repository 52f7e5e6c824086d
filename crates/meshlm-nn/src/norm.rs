// Normalization: layernorm, scalenorm and the rezero residual gate
//
// FORMULA (both norms):
//   n(x) = (x - mean(x)) / sqrt(mean((x - mean(x))²) + ε)     over `embd`
//
//   layernorm   y = n(x) * g + b      g: [embd] init 1,  b: [embd] init 0
//   scalenorm   y = n(x) * g          g: scalar init 1
//
// REZERO
//
//   With rezero the pre-normalization is the identity and each residual
//   branch is multiplied by its own learned scalar `g`, initialized to 0, so
//   every block starts out as the identity function.

use meshlm_core::{Dim, Init, Result, Shape, Tensor, VarBuilder, Variable};

use crate::context::Context;
use crate::module::Module;

/// ε of layernorm and scalenorm.
pub const NORM_EPS: f64 = 1e-5;

/// Which normalization a block uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormKind {
    LayerNorm,
    ScaleNorm,
    ReZero,
}

/// A pre/post-normalization layer.
pub enum Norm {
    Layer {
        g: Variable,
        b: Variable,
        dim: String,
    },
    Scale {
        g: Variable,
        dim: String,
    },
    /// Rezero blocks normalize nothing.
    Identity,
}

fn normalize(x: &Tensor, dim: &str) -> Result<Tensor> {
    let centered = x.sub(&x.reduce_mean(&[dim])?)?;
    let var = centered.square()?.reduce_mean(&[dim])?;
    centered.mul(&var.affine(1.0, NORM_EPS)?.rsqrt()?)
}

impl Norm {
    /// Build the norm of `kind` in the scope of `vb` (e.g. `h0/norm_1`).
    pub fn new(kind: NormKind, vb: &mut VarBuilder<'_>, dim: &Dim) -> Result<Self> {
        match kind {
            NormKind::LayerNorm => Self::layer_norm(vb, dim),
            NormKind::ScaleNorm => Ok(Norm::Scale {
                g: vb.get("g", Shape::scalar(), Init::Ones)?,
                dim: dim.name().to_string(),
            }),
            NormKind::ReZero => Ok(Norm::Identity),
        }
    }

    pub fn layer_norm(vb: &mut VarBuilder<'_>, dim: &Dim) -> Result<Self> {
        let shape = Shape::new(vec![dim.clone()])?;
        Ok(Norm::Layer {
            g: vb.get("g", shape.clone(), Init::Ones)?,
            b: vb.get("b", shape, Init::Zeros)?,
            dim: dim.name().to_string(),
        })
    }
}

impl Module for Norm {
    fn forward(&self, _ctx: &mut Context<'_>, x: &Tensor) -> Result<Tensor> {
        match self {
            Norm::Layer { g, b, dim } => normalize(x, dim)?.mul(&g.value()?)?.add(&b.value()?),
            Norm::Scale { g, dim } => normalize(x, dim)?.mul(&g.value()?),
            Norm::Identity => Ok(x.clone()),
        }
    }

    fn variables(&self) -> Vec<Variable> {
        match self {
            Norm::Layer { g, b, .. } => vec![g.clone(), b.clone()],
            Norm::Scale { g, .. } => vec![g.clone()],
            Norm::Identity => vec![],
        }
    }
}

/// Learned scalar gate on a residual branch.
pub struct ReZero {
    g: Variable,
}

impl ReZero {
    pub fn new(vb: &mut VarBuilder<'_>) -> Result<Self> {
        Ok(ReZero {
            g: vb.get("g", Shape::scalar(), Init::Zeros)?,
        })
    }
}

impl Module for ReZero {
    fn forward(&self, _ctx: &mut Context<'_>, x: &Tensor) -> Result<Tensor> {
        x.mul(&self.g.value()?)
    }

    fn variables(&self) -> Vec<Variable> {
        vec![self.g.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshlm_core::{CommLedger, DType, MeshPlan, VarStore, VariableDType};
    use std::sync::Arc;

    use crate::context::Mode;

    fn ctx() -> Context<'static> {
        Context::new(
            Mode::Train,
            VariableDType::uniform(DType::F64),
            Arc::new(MeshPlan::single_device()),
            Arc::new(CommLedger::new()),
        )
    }

    fn input() -> Tensor {
        Tensor::new(
            vec![1.0, 2.0, 3.0, 6.0, -1.0, 0.0, 1.0, 4.0],
            Shape::from_pairs(&[("sequence", 2), ("embd", 4)]).unwrap(),
            DType::F64,
        )
        .unwrap()
    }

    #[test]
    fn test_layer_norm_statistics() {
        let mut vs = VarStore::new(VariableDType::uniform(DType::F64), 0);
        let embd = Dim::new("embd", 4);
        let ln = Norm::new(NormKind::LayerNorm, &mut vs.root().pp("ln_f"), &embd).unwrap();
        let y = ln.forward(&mut ctx(), &input()).unwrap();
        let v = y.to_f64_vec().unwrap();
        for row in v.chunks(4) {
            let mean: f64 = row.iter().sum::<f64>() / 4.0;
            let var: f64 = row.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / 4.0;
            assert!(mean.abs() < 1e-12);
            assert!((var - 1.0).abs() < 1e-4);
        }
        assert_eq!(ln.num_parameters(), 8);
        assert!(vs.get("ln_f/g").is_some() && vs.get("ln_f/b").is_some());
    }

    #[test]
    fn test_scale_norm_has_scalar_gain_only() {
        let mut vs = VarStore::new(VariableDType::uniform(DType::F64), 0);
        let embd = Dim::new("embd", 4);
        let sn = Norm::new(NormKind::ScaleNorm, &mut vs.root().pp("norm_1"), &embd).unwrap();
        assert_eq!(sn.num_parameters(), 1);
        let rz = Norm::new(NormKind::ReZero, &mut vs.root().pp("norm_2"), &embd).unwrap();
        let x = input();
        let y = rz.forward(&mut ctx(), &x).unwrap();
        assert_eq!(y.to_f64_vec().unwrap(), x.to_f64_vec().unwrap());
    }

    #[test]
    fn test_rezero_starts_closed() {
        let mut vs = VarStore::new(VariableDType::uniform(DType::F64), 0);
        let gate = ReZero::new(&mut vs.root().pp("norm_rezero_1")).unwrap();
        let y = gate.forward(&mut ctx(), &input()).unwrap();
        assert!(y.to_f64_vec().unwrap().iter().all(|&v| v == 0.0));
        assert!(y.requires_grad());
    }
}
