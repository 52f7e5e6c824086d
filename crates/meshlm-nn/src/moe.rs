// Mixture of experts: a routed replacement for the feed-forward sub-layer
//
// ROUTING (per token, every dim of x except embd is a token dim):
//
//   probs = softmax(x · gate, experts)            at ≥ f32
//   each token picks its top-k experts (default k = 2)
//   capacity = ⌈capacity_factor · tokens · k / experts⌉
//
//   Assignments are granted rank by rank (every token's first choice before
//   any second choice), in token order, until an expert is full. Tokens past
//   capacity are dropped for that expert and contribute nothing there.
//
// COMBINE:
//
//   combine[t, e] = probs[t, e] / Σ_{e' in top-k(t)} probs[t, e']
//                   for granted (t, e), 0 otherwise
//   y[t] = Σ_e combine[t, e] · FF_e(x[t])
//
//   where FF_e = gelu(x · w_in[e]) · w_out[e]. The expert dim is an ordinary
//   named dimension, so a layout can split experts across the mesh.
//
// LOAD BALANCING:
//
//   density[e]       fraction of tokens whose first choice is e (constant)
//   density_proxy[e] mean router probability of e
//   aux = coef · experts² · mean_e(density · density_proxy)

use meshlm_core::{Dim, Error, Init, Result, Shape, Tensor, VarBuilder, Variable};
use rayon::prelude::*;

use crate::context::Context;
use crate::dims;
use crate::init::InitConfig;
use crate::module::Module;

/// Router and expert hyperparameters.
#[derive(Debug, Clone, PartialEq)]
pub struct MoeConfig {
    pub num_experts: usize,
    /// Hidden width of each expert; 4·embd when unset.
    pub hidden_size: Option<usize>,
    pub top_k: usize,
    pub capacity_factor_train: f64,
    pub capacity_factor_eval: f64,
    pub loss_coef: f64,
}

impl Default for MoeConfig {
    fn default() -> Self {
        Self {
            num_experts: 16,
            hidden_size: None,
            top_k: 2,
            capacity_factor_train: 1.25,
            capacity_factor_eval: 2.0,
            loss_coef: 1e-2,
        }
    }
}

pub struct MixtureOfExperts {
    gate: Variable,
    w_in: Variable,
    w_out: Variable,
    embd: Dim,
    experts: Dim,
    hidden: Dim,
    cfg: MoeConfig,
}

/// Indices of the `k` largest entries, largest first; ties keep the lower
/// index.
fn top_k_indices(row: &[f64], k: usize) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..row.len()).collect();
    idx.sort_by(|&a, &b| row[b].total_cmp(&row[a]).then(a.cmp(&b)));
    idx.truncate(k);
    idx
}

impl MixtureOfExperts {
    /// Build in the scope of `vb` (e.g. `h1/moe`).
    pub fn new(
        vb: &mut VarBuilder<'_>,
        embd: &Dim,
        cfg: &MoeConfig,
        init: &InitConfig,
    ) -> Result<Self> {
        if cfg.num_experts == 0 || cfg.top_k == 0 {
            return Err(Error::config(format!(
                "moe needs at least one expert and top_k >= 1 (got {} experts, top_k {})",
                cfg.num_experts, cfg.top_k
            )));
        }
        let experts = Dim::new(dims::EXPERTS, cfg.num_experts);
        let hidden = Dim::new(
            dims::EXPERT_HIDDEN,
            cfg.hidden_size.unwrap_or(embd.size() * 4),
        );
        let gate = vb.get(
            "gate",
            Shape::new(vec![embd.clone(), experts.clone()])?,
            Init::Normal {
                std: init.std_for(embd.size(), false),
            },
        )?;
        let w_in = vb.get(
            "w_in",
            Shape::new(vec![experts.clone(), embd.clone(), hidden.clone()])?,
            Init::Normal {
                std: init.std_for(embd.size(), false),
            },
        )?;
        let w_out = vb.get(
            "w_out",
            Shape::new(vec![experts.clone(), hidden.clone(), embd.clone()])?,
            Init::Normal {
                std: init.std_for(hidden.size(), true),
            },
        )?;
        Ok(MixtureOfExperts {
            gate,
            w_in,
            w_out,
            embd: embd.clone(),
            experts,
            hidden,
            cfg: cfg.clone(),
        })
    }

    /// Expert capacity for `tokens` routed tokens.
    pub fn capacity(&self, tokens: usize, training: bool) -> usize {
        let factor = if training {
            self.cfg.capacity_factor_train
        } else {
            self.cfg.capacity_factor_eval
        };
        let k = self.cfg.top_k.min(self.experts.size());
        ((factor * (tokens * k) as f64 / self.experts.size() as f64).ceil() as usize).max(1)
    }

    /// Routed output and the scalar load-balancing loss.
    pub fn forward_with_aux(&self, ctx: &mut Context<'_>, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let tokens_shape = x.shape().without(self.embd.name())?;
        let token_dims: Vec<&str> = tokens_shape.names();
        let n_tokens = tokens_shape.elem_count();
        let n_experts = self.experts.size();
        let k = self.cfg.top_k.min(n_experts);

        let probs_shape = tokens_shape.concat(&Shape::new(vec![self.experts.clone()])?)?;
        let logits = ctx.contract(&[x, &self.gate.value()?], &probs_shape)?;
        let probs = logits
            .to_dtype(logits.dtype().at_least_f32())?
            .softmax(dims::EXPERTS)?;

        let p = probs.to_f64_vec_in(&probs_shape)?;
        let choices: Vec<Vec<usize>> = p
            .par_chunks(n_experts)
            .map(|row| top_k_indices(row, k))
            .collect();

        let capacity = self.capacity(n_tokens, ctx.is_training());
        let mut load = vec![0usize; n_experts];
        let mut granted = vec![0.0; n_tokens * n_experts];
        let mut selected = vec![0.0; n_tokens * n_experts];
        let mut dropped = 0usize;
        for rank in 0..k {
            for (t, c) in choices.iter().enumerate() {
                let e = c[rank];
                selected[t * n_experts + e] = 1.0;
                if load[e] < capacity {
                    load[e] += 1;
                    granted[t * n_experts + e] = 1.0;
                } else {
                    dropped += 1;
                }
            }
        }
        if dropped > 0 {
            log::debug!("moe: {dropped} assignments over capacity {capacity} dropped");
        }

        let dtype = probs.dtype();
        let granted = Tensor::new(granted, probs_shape.clone(), dtype)?;
        let selected = Tensor::new(selected, probs_shape.clone(), dtype)?;
        let denom = probs
            .mul(&selected)?
            .reduce_sum(&[dims::EXPERTS])?
            .affine(1.0, 1e-9)?;
        let combine = probs.mul(&granted)?.div(&denom)?.to_dtype(x.dtype())?;

        let h_shape = probs_shape.concat(&Shape::new(vec![self.hidden.clone()])?)?;
        let h = ctx.contract(&[x, &self.w_in.value()?], &h_shape)?.gelu()?;
        let y = ctx.contract(&[&h, &self.w_out.value()?, &combine], x.shape())?;

        let mut density = vec![0.0; n_experts];
        for c in &choices {
            density[c[0]] += 1.0 / n_tokens as f64;
        }
        let density = Tensor::new(density, Shape::new(vec![self.experts.clone()])?, dtype)?;
        let proxy = probs.reduce_mean(&token_dims)?;
        let scale = self.cfg.loss_coef * (n_experts * n_experts) as f64;
        let aux = proxy
            .mul(&density)?
            .reduce_mean(&[dims::EXPERTS])?
            .affine(scale, 0.0)?;
        Ok((y, aux))
    }
}

impl Module for MixtureOfExperts {
    /// Routed output only; see [`MixtureOfExperts::forward_with_aux`].
    fn forward(&self, ctx: &mut Context<'_>, x: &Tensor) -> Result<Tensor> {
        Ok(self.forward_with_aux(ctx, x)?.0)
    }

    fn variables(&self) -> Vec<Variable> {
        vec![self.gate.clone(), self.w_in.clone(), self.w_out.clone()]
    }
}
