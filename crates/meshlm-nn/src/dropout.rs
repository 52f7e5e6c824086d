// Dropout with per-site deterministic masks
//
// In TRAIN mode each element is zeroed with probability `rate` and the rest
// are scaled by 1/(1-rate). Outside training, with rate 0, or with rate 1
// (keep probability 0) the layer is the identity.
//
// The mask comes from `ctx.dropout_rng(site)`, which depends only on the
// step seed, the microbatch index and the site path. Running the same site
// twice in one step (as a recomputed block does during backward) therefore
// draws the same mask.

use meshlm_core::{Error, Result, Tensor, Variable};
use rand::Rng;

use crate::context::Context;
use crate::module::Module;

/// Dropout bound to a site path (e.g. `h3/attn/res_dropout`).
#[derive(Debug, Clone)]
pub struct Dropout {
    rate: f64,
    site: String,
}

impl Dropout {
    pub fn new(rate: f64, site: impl Into<String>) -> Result<Self> {
        if !(0.0..=1.0).contains(&rate) {
            return Err(Error::config(format!(
                "dropout rate must be in [0, 1], got {rate}"
            )));
        }
        Ok(Dropout {
            rate,
            site: site.into(),
        })
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn site(&self) -> &str {
        &self.site
    }
}

impl Module for Dropout {
    fn forward(&self, ctx: &mut Context<'_>, x: &Tensor) -> Result<Tensor> {
        let keep = 1.0 - self.rate;
        if !ctx.is_training() || self.rate == 0.0 || keep <= 0.0 {
            return Ok(x.clone());
        }
        let mut rng = ctx.dropout_rng(&self.site);
        let mask: Vec<f64> = (0..x.elem_count())
            .map(|_| {
                if rng.gen::<f64>() < keep {
                    1.0 / keep
                } else {
                    0.0
                }
            })
            .collect();
        let mask = Tensor::new(mask, x.shape().clone(), x.dtype())?;
        x.mul(&mask)
    }

    fn variables(&self) -> Vec<Variable> {
        vec![]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshlm_core::{CommLedger, DType, MeshPlan, Shape, VariableDType};
    use std::sync::Arc;

    use crate::context::Mode;

    fn ctx(mode: Mode) -> Context<'static> {
        Context::new(
            mode,
            VariableDType::uniform(DType::F64),
            Arc::new(MeshPlan::single_device()),
            Arc::new(CommLedger::new()),
        )
        .with_seed(11)
    }

    fn x() -> Tensor {
        Tensor::ones(Shape::from_pairs(&[("batch", 4), ("embd", 64)]).unwrap(), DType::F64)
    }

    #[test]
    fn test_identity_outside_training() {
        let d = Dropout::new(0.5, "wte_dropout").unwrap();
        let y = d.forward(&mut ctx(Mode::Eval), &x()).unwrap();
        assert!(y.to_f64_vec().unwrap().iter().all(|&v| v == 1.0));
        let zero = Dropout::new(0.0, "wte_dropout").unwrap();
        let y = zero.forward(&mut ctx(Mode::Train), &x()).unwrap();
        assert!(y.to_f64_vec().unwrap().iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_mask_is_scaled_and_reproducible() {
        let d = Dropout::new(0.25, "h0/attn/res_dropout").unwrap();
        let a = d.forward(&mut ctx(Mode::Train), &x()).unwrap().to_f64_vec().unwrap();
        let b = d.forward(&mut ctx(Mode::Train), &x()).unwrap().to_f64_vec().unwrap();
        assert_eq!(a, b);
        assert!(a.iter().all(|&v| v == 0.0 || (v - 1.0 / 0.75).abs() < 1e-12));
        assert!(a.iter().any(|&v| v == 0.0));
    }

    #[test]
    fn test_zero_keep_probability_is_identity() {
        let d = Dropout::new(1.0, "h0/mlp/res_dropout").unwrap();
        let y = d.forward(&mut ctx(Mode::Train), &x()).unwrap();
        assert!(y.to_f64_vec().unwrap().iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_invalid_rate() {
        assert!(Dropout::new(1.5, "x").unwrap_err().is_config_error());
        assert!(Dropout::new(-0.1, "x").unwrap_err().is_config_error());
    }
}
