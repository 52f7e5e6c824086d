// Global attention: scaled dot product over every key position
//
//   k, v renamed sequence → memory_length
//   [mem_k; k], [mem_v; v]            optional learned memory slots
//   s = q·k / √d + bias               bias: -1e9 on future keys (causal only)
//   a = softmax(s, memory_length) · v
//
// MEMORY KEY/VALUES:
//
//   `num_mem_kv` learned slots mem_k, mem_v [mem_kv_sequence, heads,
//   features_per_head] are broadcast over the batch and prepended along
//   memory_length. Every query may attend to them.
//
// A non-causal (masked language model) layer has no bias at all; the add is
// skipped rather than adding zeros.

use meshlm_core::{Dim, Error, Init, Result, Shape, Tensor, VarBuilder, Variable};

use super::{
    record_prefill, update_cache, AttentionConfig, OutputBias, Projections, MASK_VALUE,
};
use crate::context::{Context, Phase};
use crate::dims;
use crate::dropout::Dropout;
use crate::module::Module;

pub struct GlobalAttention {
    pub(super) name: String,
    proj: Projections,
    memory: Option<(Variable, Variable)>,
    out: OutputBias,
    attn_dropout: Dropout,
    causal: bool,
}

impl GlobalAttention {
    pub fn new(vb: &mut VarBuilder<'_>, embd: &Dim, cfg: &AttentionConfig) -> Result<Self> {
        let proj = Projections::new(vb, embd, cfg)?;
        let memory = if cfg.num_mem_kv > 0 {
            let shape = Shape::new(vec![
                Dim::new(dims::MEM_KV_SEQUENCE, cfg.num_mem_kv),
                Dim::new(dims::HEADS, cfg.n_head),
                proj.kv().clone(),
            ])?;
            let std = 1.0 / (proj.kv().size() as f64).sqrt();
            let mut mem = vb.pp("memory_key_values");
            Some((
                mem.get("mem_k", shape.clone(), Init::Normal { std })?,
                mem.get("mem_v", shape, Init::Normal { std })?,
            ))
        } else {
            None
        };
        Ok(GlobalAttention {
            name: vb.prefix().to_string(),
            proj,
            memory,
            out: OutputBias::new(vb, embd, cfg.res_dropout)?,
            attn_dropout: Dropout::new(cfg.attn_dropout, vb.path("attn_dropout"))?,
            causal: cfg.causal,
        })
    }

    fn num_mem(&self) -> usize {
        self.memory
            .as_ref()
            .map_or(0, |(k, _)| k.shape().dims()[0].size())
    }

    /// Keys/values over memory_length, memory slots first.
    fn memory_axis(&self, t: &Tensor, slot: usize) -> Result<Tensor> {
        let t = t.rename(dims::SEQUENCE, dims::MEMORY_LENGTH)?;
        let Some(mem) = &self.memory else {
            return Ok(t);
        };
        let var = if slot == 0 { &mem.0 } else { &mem.1 };
        let mem_dim = var.shape().dim(dims::MEM_KV_SEQUENCE)?.clone();
        let target = t.shape().replace(dims::MEMORY_LENGTH, &[mem_dim])?;
        let m = var
            .value()?
            .broadcast_to(&target)?
            .rename(dims::MEM_KV_SEQUENCE, dims::MEMORY_LENGTH)?;
        Tensor::concat(&[&m, &t], dims::MEMORY_LENGTH)
    }

    /// Causal bias over (queries, keys). `query` is the decode index, or
    /// `None` for a full sequence of `n` queries.
    fn bias(&self, n: usize, query: Option<usize>, dtype: meshlm_core::DType) -> Result<Tensor> {
        let mem = self.num_mem();
        let keys = Dim::new(dims::MEMORY_LENGTH, mem + n);
        let masked = |i: usize, j: usize| j >= mem && j - mem > i;
        match query {
            Some(t) => {
                let data = (0..mem + n)
                    .map(|j| if masked(t, j) { MASK_VALUE } else { 0.0 })
                    .collect();
                Tensor::new(data, Shape::new(vec![keys])?, dtype)
            }
            None => {
                let mut data = Vec::with_capacity(n * (mem + n));
                for i in 0..n {
                    for j in 0..mem + n {
                        data.push(if masked(i, j) { MASK_VALUE } else { 0.0 });
                    }
                }
                Tensor::new(
                    data,
                    Shape::new(vec![Dim::new(dims::SEQUENCE, n), keys])?,
                    dtype,
                )
            }
        }
    }

    fn attend(
        &self,
        ctx: &mut Context<'_>,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        query: Option<usize>,
    ) -> Result<Tensor> {
        let n = k.size_of(dims::SEQUENCE)?;
        let k = self.memory_axis(k, 0)?;
        let v = self.memory_axis(v, 1)?;
        let kv = self.proj.kv();
        let score_shape = q
            .shape()
            .without(kv.name())?
            .concat(&Shape::new(vec![k.dim(dims::MEMORY_LENGTH)?])?)?;
        let mut s = ctx
            .contract(&[q, &k], &score_shape)?
            .affine(1.0 / (kv.size() as f64).sqrt(), 0.0)?;
        if self.causal {
            s = s.add(&self.bias(n, query, s.dtype())?)?;
        }
        let w = s.softmax(dims::MEMORY_LENGTH)?;
        let w = self.attn_dropout.forward(ctx, &w)?;
        ctx.contract(&[&w, &v], q.shape())
    }
}

impl Module for GlobalAttention {
    fn forward(&self, ctx: &mut Context<'_>, x: &Tensor) -> Result<Tensor> {
        let (q, k, v) = self.proj.qkv(ctx, x)?;
        let a = match ctx.phase() {
            Some(Phase::Decode { index }) => {
                let kv = update_cache(ctx, &self.name, &[&k, &v], index)?;
                self.attend(ctx, &q, &kv[0], &kv[1], Some(index))?
            }
            phase => {
                if phase == Some(Phase::Prefill) {
                    record_prefill(ctx, &self.name, &[&k, &v]);
                }
                if !x.shape().contains(dims::SEQUENCE) {
                    return Err(Error::shape(format!(
                        "attention input {} has no sequence dimension",
                        x.shape()
                    )));
                }
                self.attend(ctx, &q, &k, &v, None)?
            }
        };
        let a = self.proj.output(ctx, &a, x.shape())?;
        self.out.apply(ctx, &a)
    }

    fn variables(&self) -> Vec<Variable> {
        let mut v = self.proj.variables();
        if let Some((k, m)) = &self.memory {
            v.push(k.clone());
            v.push(m.clone());
        }
        v.extend(self.out.variables());
        v
    }
}
