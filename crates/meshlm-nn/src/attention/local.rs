// Local attention: each query attends to a window of radius r
//
// The window is built structurally. Keys and values are shifted along
// `sequence` by every offset of the window and stacked on a `window` dim:
//
//   causal      offsets 0..=r     query i sees keys i, i-1, …, i-r
//   non-causal  offsets -r..=r    query i sees keys i-r, …, i+r
//
//   k_w[i, o] = k[i - o]          [batch, sequence, heads, kv, window]
//   s = q·k_w / √d                [batch, sequence, heads, window]
//   a = softmax(s, window)·v_w
//
// A key outside the window is never a candidate, so no causal bias exists.
// The only mask drops window slots that fall off either end of the sequence
// (shift fills them with zeros, which must not take part in the softmax).
//
// DECODE takes the slice [max(0, t-r), t] of the caches as the window of the
// single query at t.

use meshlm_core::{Dim, Result, Shape, Tensor, VarBuilder, Variable};

use super::{record_prefill, update_cache, AttentionConfig, OutputBias, Projections, MASK_VALUE};
use crate::context::{Context, Phase};
use crate::dims;
use crate::module::Module;

pub struct LocalAttention {
    pub(super) name: String,
    proj: Projections,
    out: OutputBias,
    radius: usize,
    causal: bool,
}

impl LocalAttention {
    pub fn new(vb: &mut VarBuilder<'_>, embd: &Dim, cfg: &AttentionConfig) -> Result<Self> {
        Ok(LocalAttention {
            name: vb.prefix().to_string(),
            proj: Projections::new(vb, embd, cfg)?,
            out: OutputBias::new(vb, embd, cfg.res_dropout)?,
            radius: cfg.radius,
            causal: cfg.causal,
        })
    }

    fn offsets(&self, n: usize) -> Vec<isize> {
        let r = self.radius.min(n.saturating_sub(1)) as isize;
        if self.causal {
            (0..=r).collect()
        } else {
            (-r..=r).collect()
        }
    }

    fn scale(&self) -> f64 {
        1.0 / (self.proj.kv().size() as f64).sqrt()
    }

    fn attend_full(&self, ctx: &Context<'_>, q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor> {
        let n = k.size_of(dims::SEQUENCE)?;
        let offsets = self.offsets(n);
        let windowed = |t: &Tensor| -> Result<Tensor> {
            let shifted = offsets
                .iter()
                .map(|&o| t.shift(dims::SEQUENCE, o))
                .collect::<Result<Vec<_>>>()?;
            let refs: Vec<&Tensor> = shifted.iter().collect();
            Tensor::stack(&refs, dims::WINDOW)
        };
        let k_w = windowed(k)?;
        let v_w = windowed(v)?;

        let window = Dim::new(dims::WINDOW, offsets.len());
        let score_shape = q
            .shape()
            .without(self.proj.kv().name())?
            .concat(&Shape::new(vec![window.clone()])?)?;
        let s = ctx.contract(&[q, &k_w], &score_shape)?.affine(self.scale(), 0.0)?;

        let mut edge = Vec::with_capacity(n * offsets.len());
        for i in 0..n as isize {
            for &o in &offsets {
                let src = i - o;
                edge.push(if src >= 0 && src < n as isize { 0.0 } else { MASK_VALUE });
            }
        }
        let edge = Tensor::new(
            edge,
            Shape::new(vec![Dim::new(dims::SEQUENCE, n), window])?,
            s.dtype(),
        )?;
        let w = s.add(&edge)?.softmax(dims::WINDOW)?;
        ctx.contract(&[&w, &v_w], q.shape())
    }

    fn attend_at(
        &self,
        ctx: &Context<'_>,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        t: usize,
    ) -> Result<Tensor> {
        let start = t.saturating_sub(self.radius);
        let len = t - start + 1;
        let k_w = k.slice(dims::SEQUENCE, start, len)?.rename(dims::SEQUENCE, dims::WINDOW)?;
        let v_w = v.slice(dims::SEQUENCE, start, len)?.rename(dims::SEQUENCE, dims::WINDOW)?;
        let score_shape = q
            .shape()
            .without(self.proj.kv().name())?
            .concat(&Shape::new(vec![Dim::new(dims::WINDOW, len)])?)?;
        let s = ctx.contract(&[q, &k_w], &score_shape)?.affine(self.scale(), 0.0)?;
        let w = s.softmax(dims::WINDOW)?;
        ctx.contract(&[&w, &v_w], q.shape())
    }
}

impl Module for LocalAttention {
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_are_clamped_to_sequence() {
        let mut vs = meshlm_core::VarStore::new(Default::default(), 0);
        let cfg = AttentionConfig {
            n_head: 2,
            n_ctx: 4,
            radius: 10,
            ..Default::default()
        };
        let layer = LocalAttention::new(&mut vs.root().pp("attn"), &Dim::new("embd", 4), &cfg).unwrap();
        assert_eq!(layer.offsets(4), vec![0, 1, 2, 3]);
        assert_eq!(layer.offsets(1), vec![0]);
    }
}
