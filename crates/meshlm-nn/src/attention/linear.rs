// Linear attention: kernelized attention in O(sequence) memory
//
// q and k move their feature axis to `features_per_head_in`; q is
// normalized by softmax over it. Then:
//
//   non-causal   k' = softmax(k, sequence)
//                C  = Σ_s k'[s] ⊗ v[s]                 [batch, heads, in, out]
//                a  = q · C
//
//   causal       k' = exp(k)
//                C[i] = Σ_{s≤i} k'[s] ⊗ v[s] / (Σ_{s≤i} k'[s] + ε)
//                a[i] = q[i] · C[i]
//
// The prefix sums are cumulative sums along `sequence`, so position i can
// only see keys and values at positions ≤ i. There is no mask.
//
// DECODE sums the prefix [0, t] of the caches directly.

use meshlm_core::{Dim, Result, Shape, Tensor, VarBuilder, Variable};

use super::{record_prefill, update_cache, AttentionConfig, OutputBias, Projections};
use crate::context::{Context, Phase};
use crate::dims;
use crate::module::Module;

const EPS: f64 = 1e-6;

pub struct LinearAttention {
    pub(super) name: String,
    proj: Projections,
    out: OutputBias,
    causal: bool,
}

impl LinearAttention {
    pub fn new(vb: &mut VarBuilder<'_>, embd: &Dim, cfg: &AttentionConfig) -> Result<Self> {
        Ok(LinearAttention {
            name: vb.prefix().to_string(),
            proj: Projections::new(vb, embd, cfg)?,
            out: OutputBias::new(vb, embd, cfg.res_dropout)?,
            causal: cfg.causal,
        })
    }

    fn feature_in(&self, t: &Tensor) -> Result<Tensor> {
        t.rename(dims::FEATURES_PER_HEAD, dims::FEATURES_PER_HEAD_IN)
    }

    /// `shape` (which carries features_per_head_in) plus features_per_head.
    fn with_out_features(&self, shape: &Shape) -> Result<Shape> {
        shape.concat(&Shape::new(vec![self.proj.kv().clone()])?)
    }

    fn attend_full(&self, ctx: &Context<'_>, q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor> {
        let q_in = self.feature_in(q)?.softmax(dims::FEATURES_PER_HEAD_IN)?;
        let k_in = self.feature_in(k)?;
        if !self.causal {
            let k_in = k_in.softmax(dims::SEQUENCE)?;
            let context_shape = self.with_out_features(&k_in.shape().without(dims::SEQUENCE)?)?;
            let context = ctx.contract(&[&k_in, v], &context_shape)?;
            return ctx.contract(&[&q_in, &context], q.shape());
        }
        let k_exp = k_in.exp()?;
        let cumulative_k = k_exp.cumsum(dims::SEQUENCE, false)?;
        let context_shape = self.with_out_features(k_exp.shape())?;
        let context = ctx
            .contract(&[&k_exp, v], &context_shape)?
            .cumsum(dims::SEQUENCE, false)?;
        let context = context.div(&cumulative_k.affine(1.0, EPS)?)?;
        ctx.contract(&[&q_in, &context], q.shape())
    }

    fn attend_at(
        &self,
        ctx: &Context<'_>,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        t: usize,
    ) -> Result<Tensor> {
        let q_in = self.feature_in(q)?.softmax(dims::FEATURES_PER_HEAD_IN)?;
        let k_exp = self.feature_in(&k.slice(dims::SEQUENCE, 0, t + 1)?)?.exp()?;
        let v = v.slice(dims::SEQUENCE, 0, t + 1)?;
        let context_shape = self.with_out_features(&k_exp.shape().without(dims::SEQUENCE)?)?;
        let context = ctx.contract(&[&k_exp, &v], &context_shape)?;
        let norm = k_exp.reduce_sum(&[dims::SEQUENCE])?.affine(1.0, EPS)?;
        ctx.contract(&[&q_in, &context.div(&norm)?], q.shape())
    }
}

impl Module for LinearAttention {
    fn forward(&self, ctx: &mut Context<'_>, x: &Tensor) -> Result<Tensor> {
        let (q, k, v) = self.proj.qkv(ctx, x)?;
        let a = match ctx.phase() {
            Some(Phase::Decode { index }) => {
                let kv = update_cache(ctx, &self.name, &[&k, &v], index)?;
                self.attend_at(ctx, &q, &kv[0], &kv[1], index)?
            }
            phase => {
                if phase == Some(Phase::Prefill) {
                    record_prefill(ctx, &self.name, &[&k, &v]);
                }
                self.attend_full(ctx, &q, &k, &v)?
            }
        };
        let a = self.proj.output(ctx, &a, x.shape())?;
        self.out.apply(ctx, &a)
    }

    fn variables(&self) -> Vec<Variable> {
        let mut v = self.proj.variables();
        v.extend(self.out.variables());
        v
    }
}
