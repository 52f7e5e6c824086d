// Attention: variant dispatch and the parts the variants share
//
// A block's attention sub-layer is one of five kinds, chosen per layer:
//
//   global         softmax(q·k / √d + bias) · v over every key position
//   local          the same over a window of radius r around each query
//   linear         softmax kernel feature maps, two chained contractions,
//                  linear in sequence length
//   convolutional  sum of causal 1-D convolutions at several distances,
//                  optionally mixed by a small softmax gate
//   none           no sub-layer at all
//
// The kind is a closed enum parsed from its configuration tag; an unknown
// tag is a configuration error before any variable or tensor exists.
//
// SHAPES:
//
//   x: [batch, sequence, embd]  (DECODE: [batch, embd])
//   q, k, v: x dims without embd ++ [heads, features_per_head]
//   output: same shape as x
//
// INCREMENTAL STATE:
//
//   PREFILL records each layer's keys/values (convolution: its input) under
//   the layer path. DECODE splices the new position into those caches with a
//   one-hot write at index t and computes only the query at t.

use std::fmt;
use std::str::FromStr;

use meshlm_core::{DType, Dim, Error, Init, Result, Shape, Tensor, VarBuilder, Variable};

use crate::context::Context;
use crate::dims;
use crate::dropout::Dropout;
use crate::init::InitConfig;
use crate::module::Module;

mod conv;
mod global;
mod linear;
mod local;

pub use conv::ConvAttention;
pub use global::GlobalAttention;
pub use linear::LinearAttention;
pub use local::LocalAttention;

/// Additive bias that removes a key from a softmax.
pub(crate) const MASK_VALUE: f64 = -1e9;

/// Attention variant of one layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttentionKind {
    Global,
    Local,
    Linear,
    Convolutional,
    None,
}

impl AttentionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AttentionKind::Global => "global",
            AttentionKind::Local => "local",
            AttentionKind::Linear => "linear",
            AttentionKind::Convolutional => "conv",
            AttentionKind::None => "none",
        }
    }
}

impl fmt::Display for AttentionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttentionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "global" => Ok(AttentionKind::Global),
            "local" => Ok(AttentionKind::Local),
            "linear" => Ok(AttentionKind::Linear),
            "conv" | "convolutional" => Ok(AttentionKind::Convolutional),
            "none" => Ok(AttentionKind::None),
            other => Err(Error::config(format!("unknown attention type '{other}'"))),
        }
    }
}

/// Hyperparameters shared by every attention variant.
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionConfig {
    pub n_head: usize,
    pub n_ctx: usize,
    pub causal: bool,
    /// Window radius of local attention, and the distance base of
    /// convolutional attention.
    pub radius: usize,
    pub num_mem_kv: usize,
    pub attn_dropout: f64,
    pub res_dropout: f64,
    /// Extra gate channels G of convolutional attention (0 = no gate).
    pub lightweight_conv: usize,
    pub conv_dim: usize,
    pub base_conv_size: usize,
    pub init: InitConfig,
}

impl Default for AttentionConfig {
    fn default() -> Self {
        Self {
            n_head: 1,
            n_ctx: 1,
            causal: true,
            radius: 256,
            num_mem_kv: 0,
            attn_dropout: 0.0,
            res_dropout: 0.0,
            lightweight_conv: 0,
            conv_dim: 1,
            base_conv_size: 256,
            init: InitConfig::default(),
        }
    }
}

/// The attention sub-layer of a block.
pub enum Attention {
    Global(GlobalAttention),
    Local(LocalAttention),
    Linear(LinearAttention),
    Convolutional(ConvAttention),
}

impl Attention {
    /// Build the sub-layer of `kind` in the scope of `vb` (e.g. `h0/attn`).
    /// `AttentionKind::None` builds nothing.
    pub fn new(
        kind: AttentionKind,
        vb: &mut VarBuilder<'_>,
        embd: &Dim,
        cfg: &AttentionConfig,
    ) -> Result<Option<Self>> {
        Ok(match kind {
            AttentionKind::Global => Some(Attention::Global(GlobalAttention::new(vb, embd, cfg)?)),
            AttentionKind::Local => Some(Attention::Local(LocalAttention::new(vb, embd, cfg)?)),
            AttentionKind::Linear => Some(Attention::Linear(LinearAttention::new(vb, embd, cfg)?)),
            AttentionKind::Convolutional => {
                Some(Attention::Convolutional(ConvAttention::new(vb, embd, cfg)?))
            }
            AttentionKind::None => None,
        })
    }

    /// Key under which the layer keeps its decode state. Defaults to the
    /// variable scope; layers that share one scope need distinct keys.
    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        match &mut self {
            Attention::Global(a) => a.name = key,
            Attention::Local(a) => a.name = key,
            Attention::Linear(a) => a.name = key,
            Attention::Convolutional(a) => a.name = key,
        }
        self
    }

    pub fn cache_key(&self) -> &str {
        match self {
            Attention::Global(a) => &a.name,
            Attention::Local(a) => &a.name,
            Attention::Linear(a) => &a.name,
            Attention::Convolutional(a) => &a.name,
        }
    }

    pub fn kind(&self) -> AttentionKind {
        match self {
            Attention::Global(_) => AttentionKind::Global,
            Attention::Local(_) => AttentionKind::Local,
            Attention::Linear(_) => AttentionKind::Linear,
            Attention::Convolutional(_) => AttentionKind::Convolutional,
        }
    }
}

impl Module for Attention {
    fn forward(&self, ctx: &mut Context<'_>, x: &Tensor) -> Result<Tensor> {
        match self {
            Attention::Global(a) => a.forward(ctx, x),
            Attention::Local(a) => a.forward(ctx, x),
            Attention::Linear(a) => a.forward(ctx, x),
            Attention::Convolutional(a) => a.forward(ctx, x),
        }
    }

    fn variables(&self) -> Vec<Variable> {
        match self {
            Attention::Global(a) => a.variables(),
            Attention::Local(a) => a.variables(),
            Attention::Linear(a) => a.variables(),
            Attention::Convolutional(a) => a.variables(),
        }
    }
}

// Shared pieces

/// Query/key/value/output weights of the multi-head variants.
pub(crate) struct Projections {
    wq: Variable,
    wk: Variable,
    wv: Variable,
    wo: Variable,
    embd: Dim,
    heads: Dim,
    kv: Dim,
}

impl Projections {
    pub(crate) fn new(vb: &mut VarBuilder<'_>, embd: &Dim, cfg: &AttentionConfig) -> Result<Self> {
        if cfg.n_head == 0 || embd.size() % cfg.n_head != 0 {
            return Err(Error::config(format!(
                "n_embd {} is not divisible by n_head {}",
                embd.size(),
                cfg.n_head
            )));
        }
        let heads = Dim::new(dims::HEADS, cfg.n_head);
        let kv = Dim::new(dims::FEATURES_PER_HEAD, embd.size() / cfg.n_head);
        let in_shape = Shape::new(vec![embd.clone(), heads.clone(), kv.clone()])?;
        let in_std = cfg.init.std_for(embd.size(), false);
        let out_std = cfg.init.std_for(heads.size() * kv.size(), true);
        Ok(Projections {
            wq: vb.get("q", in_shape.clone(), Init::Normal { std: in_std })?,
            wk: vb.get("k", in_shape.clone(), Init::Normal { std: in_std })?,
            wv: vb.get("v", in_shape, Init::Normal { std: in_std })?,
            wo: vb.get(
                "o",
                Shape::new(vec![heads.clone(), kv.clone(), embd.clone()])?,
                Init::Normal { std: out_std },
            )?,
            embd: embd.clone(),
            heads,
            kv,
        })
    }

    pub(crate) fn kv(&self) -> &Dim {
        &self.kv
    }

    fn project(&self, ctx: &Context<'_>, x: &Tensor, w: &Variable) -> Result<Tensor> {
        let out = x
            .shape()
            .without(self.embd.name())?
            .concat(&Shape::new(vec![self.heads.clone(), self.kv.clone()])?)?;
        ctx.contract(&[x, &w.value()?], &out)
    }

    /// (q, k, v) for the positions of `x`.
    pub(crate) fn qkv(&self, ctx: &Context<'_>, x: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        Ok((
            self.project(ctx, x, &self.wq)?,
            self.project(ctx, x, &self.wk)?,
            self.project(ctx, x, &self.wv)?,
        ))
    }

    /// `[.., heads, features_per_head] → x_shape`.
    pub(crate) fn output(&self, ctx: &Context<'_>, a: &Tensor, x_shape: &Shape) -> Result<Tensor> {
        ctx.contract(&[a, &self.wo.value()?], x_shape)
    }

    pub(crate) fn variables(&self) -> Vec<Variable> {
        vec![
            self.wq.clone(),
            self.wk.clone(),
            self.wv.clone(),
            self.wo.clone(),
        ]
    }
}

/// Output bias `o_b` and residual dropout, common to every variant.
pub(crate) struct OutputBias {
    o_b: Variable,
    dropout: Dropout,
}

impl OutputBias {
    pub(crate) fn new(vb: &mut VarBuilder<'_>, embd: &Dim, res_dropout: f64) -> Result<Self> {
        Ok(OutputBias {
            o_b: vb.get("o_b", Shape::new(vec![embd.clone()])?, Init::Zeros)?,
            dropout: Dropout::new(res_dropout, vb.path("res_dropout"))?,
        })
    }

    pub(crate) fn apply(&self, ctx: &mut Context<'_>, a: &Tensor) -> Result<Tensor> {
        let a = a.add(&self.o_b.value()?)?;
        self.dropout.forward(ctx, &a)
    }

    pub(crate) fn variables(&self) -> Vec<Variable> {
        vec![self.o_b.clone()]
    }
}

/// Write `new` (no sequence dim) into `cache` at sequence position `index`
/// with a one-hot mask.
pub(crate) fn splice(cache: &Tensor, new: &Tensor, index: usize) -> Result<Tensor> {
    let seq = cache.dim(dims::SEQUENCE)?;
    if index >= seq.size() {
        return Err(Error::shape(format!(
            "decode position {index} is outside the cached sequence of length {}",
            seq.size()
        )));
    }
    let one_hot = Tensor::scalar(index as f64, DType::I64).one_hot(&seq, 1.0, 0.0, cache.dtype())?;
    let keep = one_hot.affine(-1.0, 1.0)?;
    cache.mul(&keep)?.add(&new.mul(&one_hot)?)
}

/// Cached tensors of `layer`, spliced with `new` at `index` and recorded back.
pub(crate) fn update_cache(
    ctx: &mut Context<'_>,
    layer: &str,
    new: &[&Tensor],
    index: usize,
) -> Result<Vec<Tensor>> {
    let state = ctx
        .incremental_mut()
        .ok_or_else(|| Error::msg("decode step without an incremental context"))?;
    let cached = state.states(layer)?;
    if cached.len() != new.len() {
        return Err(Error::msg(format!(
            "layer '{layer}' caches {} tensors, decode produced {}",
            cached.len(),
            new.len()
        )));
    }
    let spliced = cached
        .iter()
        .zip(new)
        .map(|(c, n)| splice(c, n, index))
        .collect::<Result<Vec<_>>>()?;
    state.record(layer, spliced.iter().map(Tensor::detach).collect());
    Ok(spliced)
}

/// Record the prefill state of `layer`.
pub(crate) fn record_prefill(ctx: &mut Context<'_>, layer: &str, states: &[&Tensor]) {
    if let Some(state) = ctx.incremental_mut() {
        state.record(layer, states.iter().map(|t| t.detach()).collect());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parse() {
        assert_eq!("global".parse::<AttentionKind>().unwrap(), AttentionKind::Global);
        assert_eq!("conv".parse::<AttentionKind>().unwrap(), AttentionKind::Convolutional);
        assert_eq!("none".parse::<AttentionKind>().unwrap(), AttentionKind::None);
        let err = "sparse".parse::<AttentionKind>().unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_splice_writes_one_position() {
        let cache = Tensor::zeros(
            Shape::from_pairs(&[("batch", 2), ("sequence", 3), ("embd", 2)]).unwrap(),
            DType::F64,
        );
        let new = Tensor::new(
            vec![1.0, 2.0, 3.0, 4.0],
            Shape::from_pairs(&[("batch", 2), ("embd", 2)]).unwrap(),
            DType::F64,
        )
        .unwrap();
        let out = splice(&cache, &new, 1).unwrap();
        assert_eq!(out.shape(), cache.shape());
        assert_eq!(
            out.to_f64_vec().unwrap(),
            vec![0.0, 0.0, 1.0, 2.0, 0.0, 0.0, 0.0, 0.0, 3.0, 4.0, 0.0, 0.0]
        );
        assert!(splice(&cache, &new, 3).unwrap_err().is_shape_error());
    }
}
