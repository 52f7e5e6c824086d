// Block: one transformer layer
//
//   [macaron]   x = x + 0.5 · mlp_macaron(x)
//   attention   x = residual(x, norm_1, attn)         skipped for "none"
//   ff          x = residual(x, norm_2, mlp | moe)    × 0.5 with macaron
//
// RESIDUAL PLACEMENT (gate = rezero scalar, identity otherwise):
//
//   pre        x + gate(f(norm(x)))
//   post       norm(x + gate(f(x)))
//   sandwich   x + gate(norm_post(f(norm(x))))
//
// With rezero the norms are the identity and every branch starts closed.
//
// RECOMPUTE:
//
//   In training (never during incremental decoding) a block marked for
//   recompute runs inside `checkpoint`: only its outputs are kept and the
//   block is run again during the backward pass. Dropout masks are seeded
//   by site, so the second run draws the same masks.

use std::sync::Arc;

use meshlm_core::{checkpoint, Result, Tensor, VarBuilder, Variable};
use meshlm_nn::{
    Attention, AttentionKind, Context, FeedForward, MixtureOfExperts, Module, Norm, ReZero,
};

use super::spec::{BlockSpec, ModelSpec};
use crate::config::NormPlacement;

enum FeedForwardLayer {
    Mlp(FeedForward),
    Moe(MixtureOfExperts),
}

impl FeedForwardLayer {
    fn variables(&self) -> Vec<Variable> {
        match self {
            FeedForwardLayer::Mlp(m) => m.variables(),
            FeedForwardLayer::Moe(m) => m.variables(),
        }
    }
}

/// Norms and gate around one sub-layer.
struct Residual {
    norm: Norm,
    post: Option<Norm>,
    gate: Option<ReZero>,
    placement: NormPlacement,
}

impl Residual {
    fn new(
        vb: &mut VarBuilder<'_>,
        spec: &BlockSpec,
        model: &ModelSpec,
        slot: usize,
    ) -> Result<Self> {
        let norm = Norm::new(spec.norm, &mut vb.pp(&format!("norm_{slot}")), &model.embd)?;
        let post = if spec.placement == NormPlacement::Sandwich {
            Some(Norm::new(
                spec.norm,
                &mut vb.pp(&format!("norm_{slot}_post")),
                &model.embd,
            )?)
        } else {
            None
        };
        let gate = if spec.rezero() {
            Some(ReZero::new(&mut vb.pp(&format!("norm_rezero_{slot}")))?)
        } else {
            None
        };
        Ok(Residual {
            norm,
            post,
            gate,
            placement: spec.placement,
        })
    }

    fn gated(&self, ctx: &mut Context<'_>, y: Tensor) -> Result<Tensor> {
        match &self.gate {
            Some(g) => g.forward(ctx, &y),
            None => Ok(y),
        }
    }

    fn apply<F>(&self, ctx: &mut Context<'_>, x: &Tensor, f: F) -> Result<Tensor>
    where
        F: FnOnce(&mut Context<'_>, &Tensor) -> Result<Tensor>,
    {
        match self.placement {
            NormPlacement::Pre => {
                let h = self.norm.forward(ctx, x)?;
                let y = f(ctx, &h)?;
                x.add(&self.gated(ctx, y)?)
            }
            NormPlacement::Post => {
                let y = f(ctx, x)?;
                let sum = x.add(&self.gated(ctx, y)?)?;
                self.norm.forward(ctx, &sum)
            }
            NormPlacement::Sandwich => {
                let h = self.norm.forward(ctx, x)?;
                let mut y = f(ctx, &h)?;
                if let Some(post) = &self.post {
                    y = post.forward(ctx, &y)?;
                }
                x.add(&self.gated(ctx, y)?)
            }
        }
    }

    fn variables(&self) -> Vec<Variable> {
        let mut v = self.norm.variables();
        if let Some(p) = &self.post {
            v.extend(p.variables());
        }
        if let Some(g) = &self.gate {
            v.extend(g.variables());
        }
        v
    }
}

pub struct Block {
    spec: BlockSpec,
    macaron: Option<FeedForward>,
    attn: Option<(Residual, Attention)>,
    ff: (Residual, FeedForwardLayer),
}

impl Block {
    /// Build in the scope of `vb` (`h{i}`, or the shared `h`).
    pub fn new(spec: &BlockSpec, vb: &mut VarBuilder<'_>, model: &ModelSpec) -> Result<Self> {
        let macaron = if spec.macaron {
            Some(FeedForward::new(
                &mut vb.pp("mlp_macaron"),
                &model.embd,
                spec.glu,
                model.attention.res_dropout,
                &model.init,
            )?)
        } else {
            None
        };

        let attn = match spec.attention {
            AttentionKind::None => None,
            kind => {
                let residual = Residual::new(vb, spec, model, 1)?;
                let layer = Attention::new(kind, &mut vb.pp("attn"), &model.embd, &model.attention)?;
                layer.map(|a| (residual, a.with_cache_key(format!("h{}/attn", spec.index))))
            }
        };

        let residual = Residual::new(vb, spec, model, 2)?;
        let layer = if spec.moe {
            FeedForwardLayer::Moe(MixtureOfExperts::new(
                &mut vb.pp("moe"),
                &model.embd,
                &model.moe,
                &model.init,
            )?)
        } else {
            FeedForwardLayer::Mlp(FeedForward::new(
                &mut vb.pp("mlp"),
                &model.embd,
                spec.glu,
                model.attention.res_dropout,
                &model.init,
            )?)
        };

        Ok(Block {
            spec: spec.clone(),
            macaron,
            attn,
            ff: (residual, layer),
        })
    }

    pub fn spec(&self) -> &BlockSpec {
        &self.spec
    }

    pub fn is_moe(&self) -> bool {
        matches!(self.ff.1, FeedForwardLayer::Moe(_))
    }

    /// Output and, for a mixture-of-experts block, its load-balancing loss.
    pub fn forward(&self, ctx: &mut Context<'_>, x: &Tensor) -> Result<(Tensor, Option<Tensor>)> {
        let mut x = x.clone();
        if let Some(m) = &self.macaron {
            let y = m.forward(ctx, &x)?.affine(0.5, 0.0)?;
            x = x.add(&y)?;
        }

        if let Some((residual, attn)) = &self.attn {
            x = residual.apply(ctx, &x, |ctx, h| attn.forward(ctx, h))?;
        }

        let scale = if self.macaron.is_some() { 0.5 } else { 1.0 };
        let mut aux = None;
        let (residual, layer) = &self.ff;
        x = residual.apply(ctx, &x, |ctx, h| {
            let y = match layer {
                FeedForwardLayer::Mlp(m) => m.forward(ctx, h)?,
                FeedForwardLayer::Moe(m) => {
                    let (y, a) = m.forward_with_aux(ctx, h)?;
                    aux = Some(a);
                    y
                }
            };
            if scale == 1.0 {
                Ok(y)
            } else {
                y.affine(scale, 0.0)
            }
        })?;
        Ok((x, aux))
    }

    /// [`Block::forward`], recomputed in the backward pass when the block
    /// asks for it and the call is a training call outside a decode session.
    pub fn run(
        self: &Arc<Self>,
        ctx: &mut Context<'_>,
        x: &Tensor,
    ) -> Result<(Tensor, Option<Tensor>)> {
        if !(self.spec.recompute && ctx.is_training() && !ctx.is_incremental()) {
            return self.forward(ctx, x);
        }
        let block = Arc::clone(self);
        let owned = ctx.snapshot();
        let zero_dtype = x.dtype();
        let outputs = checkpoint(std::slice::from_ref(x), move |inputs| {
            let mut c = owned.snapshot();
            let (y, aux) = block.forward(&mut c, &inputs[0])?;
            let aux = aux.unwrap_or_else(|| Tensor::scalar(0.0, zero_dtype));
            Ok(vec![y, aux])
        })?;
        let mut outputs = outputs.into_iter();
        let y = outputs
            .next()
            .ok_or_else(|| meshlm_core::Error::msg("recomputed block returned no output"))?;
        let aux = if self.is_moe() { outputs.next() } else { None };
        Ok((y, aux))
    }

    pub fn variables(&self) -> Vec<Variable> {
        let mut v = Vec::new();
        if let Some(m) = &self.macaron {
            v.extend(m.variables());
        }
        if let Some((residual, attn)) = &self.attn {
            v.extend(residual.variables());
            v.extend(attn.variables());
        }
        v.extend(self.ff.0.variables());
        v.extend(self.ff.1.variables());
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshlm_core::{CommLedger, DType, MeshPlan, Shape, VarStore, VariableDType};
    use meshlm_nn::{dims, Mode};
    use serde_json::{json, Value};

    use crate::config::ModelParams;

    fn block_spec(extra: Value) -> ModelSpec {
        let mut v = json!({
            "n_vocab": 50,
            "n_embd": 8,
            "n_head": 2,
            "n_layer": 1,
            "attention_types": ["global"],
            "n_ctx": 8,
            "train_batch_size": 2,
            "mesh_shape": "x:1",
            "layout": "batch:x",
        });
        for (k, val) in extra.as_object().unwrap() {
            v[k] = val.clone();
        }
        ModelSpec::from_params(&ModelParams::from_value(&v).unwrap()).unwrap()
    }

    fn build(spec: &ModelSpec) -> (VarStore, Block) {
        let mut vs = VarStore::new(VariableDType::uniform(DType::F64), 3);
        let block = {
            let mut root = vs.root();
            let mut vb = root.pp(&spec.blocks[0].scope);
            Block::new(&spec.blocks[0], &mut vb, spec).unwrap()
        };
        (vs, block)
    }

    fn ctx() -> Context<'static> {
        Context::new(
            Mode::Eval,
            VariableDType::uniform(DType::F64),
            Arc::new(MeshPlan::single_device()),
            Arc::new(CommLedger::new()),
        )
    }

    fn input() -> Tensor {
        let data: Vec<f64> = (0..2 * 8 * 8).map(|i| ((i * 5 % 13) as f64 - 6.0) / 4.0).collect();
        let shape =
            Shape::from_pairs(&[(dims::BATCH, 2), (dims::SEQUENCE, 8), (dims::EMBD, 8)]).unwrap();
        Tensor::new(data, shape, DType::F64).unwrap()
    }

    fn rows(t: &Tensor) -> Vec<Vec<f64>> {
        t.to_f64_vec()
            .unwrap()
            .chunks(8)
            .map(|r| r.to_vec())
            .collect()
    }

    fn paths(block: &Block) -> Vec<String> {
        block.variables().iter().map(|v| v.path().to_string()).collect()
    }

    #[test]
    fn test_rezero_block_starts_as_identity() {
        let spec = block_spec(json!({"rezero": true}));
        let (vs, block) = build(&spec);
        let p = paths(&block);
        assert!(p.contains(&"h0/norm_rezero_1/g".to_string()), "{p:?}");
        assert!(p.contains(&"h0/norm_rezero_2/g".to_string()), "{p:?}");

        let x = input();
        let (y, aux) = block.forward(&mut ctx(), &x).unwrap();
        assert!(aux.is_none());
        assert_eq!(y.to_f64_vec().unwrap(), x.to_f64_vec().unwrap());

        // Opening one gate lets its branch through.
        vs.get("h0/norm_rezero_2/g").unwrap().assign(&[1.0]).unwrap();
        let (y, _) = block.forward(&mut ctx(), &x).unwrap();
        assert_ne!(y.to_f64_vec().unwrap(), x.to_f64_vec().unwrap());
    }

    #[test]
    fn test_macaron_takes_two_half_steps() {
        let spec = block_spec(json!({"macaron": true, "attention_types": ["none"]}));
        let (_vs, block) = build(&spec);
        assert!(paths(&block).iter().any(|p| p.starts_with("h0/mlp_macaron/")));

        let x = input();
        let mut c = ctx();
        let (y, _) = block.forward(&mut c, &x).unwrap();

        let macaron = block.macaron.as_ref().unwrap();
        let x1 = x
            .add(&macaron.forward(&mut c, &x).unwrap().affine(0.5, 0.0).unwrap())
            .unwrap();
        let (residual, FeedForwardLayer::Mlp(mlp)) = &block.ff else {
            panic!("expected a dense feed-forward layer");
        };
        let normed = residual.norm.forward(&mut c, &x1).unwrap();
        let branch = mlp.forward(&mut c, &normed).unwrap();
        let half = x1.add(&branch.affine(0.5, 0.0).unwrap()).unwrap();
        let full = x1.add(&branch).unwrap();

        let got = y.to_f64_vec().unwrap();
        for (a, b) in got.iter().zip(half.to_f64_vec().unwrap()) {
            assert!((a - b).abs() < 1e-12, "{a} vs {b}");
        }
        assert_ne!(got, full.to_f64_vec().unwrap());
    }

    #[test]
    fn test_post_norm_normalizes_the_sum() {
        let spec = block_spec(json!({"norm_placement": "post", "attention_types": ["none"]}));
        let (_vs, block) = build(&spec);
        let (y, _) = block.forward(&mut ctx(), &input()).unwrap();
        for row in rows(&y) {
            let mean = row.iter().sum::<f64>() / 8.0;
            let var = row.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / 8.0;
            assert!(mean.abs() < 1e-9, "mean {mean}");
            assert!((var - 1.0).abs() < 1e-3, "variance {var}");
        }
    }

    #[test]
    fn test_sandwich_norm_wraps_the_branch() {
        let spec = block_spec(json!({"norm_placement": "sandwich", "attention_types": ["none"]}));
        let (_vs, block) = build(&spec);
        let p = paths(&block);
        assert!(p.contains(&"h0/norm_2_post/g".to_string()), "{p:?}");
        assert!(!p.iter().any(|p| p.starts_with("h0/norm_1")));

        let x = input();
        let (y, _) = block.forward(&mut ctx(), &x).unwrap();
        // The residual branch is itself normalized.
        let delta = y.sub(&x).unwrap();
        for row in rows(&delta) {
            let mean = row.iter().sum::<f64>() / 8.0;
            assert!(mean.abs() < 1e-9, "mean {mean}");
        }

        // Pre placement leaves the branch unnormalized.
        let pre = block_spec(json!({"attention_types": ["none"]}));
        let (_vs, block) = build(&pre);
        let (y, _) = block.forward(&mut ctx(), &x).unwrap();
        let delta = y.sub(&x).unwrap();
        assert!(rows(&delta)
            .iter()
            .any(|r| (r.iter().sum::<f64>() / 8.0).abs() > 1e-6));
    }

    #[test]
    fn test_moe_block_reports_aux_loss() {
        let spec = block_spec(json!({"moe_layers": [0], "moe_params": {"moe_num_experts": 2}}));
        let (_vs, block) = build(&spec);
        assert!(block.is_moe());
        let (y, aux) = block.forward(&mut ctx(), &input()).unwrap();
        assert_eq!(y.shape(), input().shape());
        let aux = aux.unwrap().to_scalar_f64().unwrap();
        assert!(aux.is_finite() && aux > 0.0);
    }
}
