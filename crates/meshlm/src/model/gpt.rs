// GptModel: the compiled model
//
// FORWARD:
//
//   h = wte[inputs] + wpe[positions]          embed dropout on both lookups
//   h = block_i(h)  for every block
//   logits = ln_f(h) · wte    (tied)   or   lm_head(h)   (untied, no ln_f)
//
// Logits are returned in at least f32. With labels (outside DECODE):
//
//   loss_tok   = cross_entropy(logits, labels) + z_loss · lse²
//                zeroed on padding positions for masked language models
//   loss_batch = mean over sequence              [batch]
//   loss       = mean(loss_tok) + Σ moe aux losses
//
// INCREMENTAL:
//
//   The phase is read once per call from the context.
//   PREFILL   the whole (padded) prompt runs like a normal pass; every
//             attention layer records its state, the prompt length is kept
//   DECODE    only position t runs: inputs [batch] (or [batch, sequence],
//             sliced at t), position t is a scalar, logits are [batch, vocab]
//   The counter advances once after the call succeeds.

use std::collections::BTreeMap;
use std::sync::Arc;

use meshlm_core::{DType, Dim, Error, MeshPlan, Result, Shape, Tensor, VarStore, Variable};
use meshlm_nn::{
    cross_entropy_with_z_loss, dims, Context, Dense, Module, Norm, Phase, PositionEmbedding,
    TokenEmbedding,
};

use super::block::Block;
use super::spec::{build_blocks, ModelSpec, OutputSpec, PositionSpec};
use crate::features::Features;

/// Everything one forward pass produces.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// `[batch, sequence, vocab]`, or `[batch, vocab]` when decoding.
    pub logits: Tensor,
    /// Scalar training objective, aux losses included.
    pub loss: Option<Tensor>,
    /// Mean loss per example, `[batch]`.
    pub loss_batch: Option<Tensor>,
    /// Sum of the mixture-of-experts load-balancing losses.
    pub aux_loss: Option<Tensor>,
}

pub struct GptModel {
    spec: ModelSpec,
    plan: Arc<MeshPlan>,
    wte: TokenEmbedding,
    wpe: PositionEmbedding,
    blocks: Vec<Arc<Block>>,
    ln_f: Option<Norm>,
    lm_head: Option<Dense>,
}

impl GptModel {
    pub(super) fn build(spec: ModelSpec, store: &mut VarStore, plan: Arc<MeshPlan>) -> Result<Self> {
        let wte = TokenEmbedding::new(&mut store.root(), &spec.vocab, &spec.embd, spec.embed_dropout)?;
        let wpe = match spec.position {
            PositionSpec::Learned { length } => {
                PositionEmbedding::learned(&mut store.root(), length, &spec.embd, spec.embed_dropout)?
            }
            PositionSpec::Axial { a0, a1 } => {
                PositionEmbedding::axial(&mut store.root(), (a0, a1), &spec.embd, spec.embed_dropout)?
            }
        };
        let blocks = build_blocks(&spec, store)?;
        let (ln_f, lm_head) = match spec.output {
            OutputSpec::Tied => (
                Some(Norm::layer_norm(&mut store.root().pp("ln_f"), &spec.embd)?),
                None,
            ),
            OutputSpec::Untied => (None, Some(Dense::new(
                &mut store.root().pp("lm_head"),
                std::slice::from_ref(&spec.embd),
                std::slice::from_ref(&spec.vocab),
                false,
                &spec.init,
                false,
            )?)),
        };
        Ok(GptModel {
            spec,
            plan,
            wte,
            wpe,
            blocks,
            ln_f,
            lm_head,
        })
    }

    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }

    pub fn plan(&self) -> &Arc<MeshPlan> {
        &self.plan
    }

    pub fn blocks(&self) -> &[Arc<Block>] {
        &self.blocks
    }

    /// The token table (also the output projection when tied).
    pub fn token_table(&self) -> &Variable {
        self.wte.table()
    }

    pub fn lm_head(&self) -> Option<&Dense> {
        self.lm_head.as_ref()
    }

    /// Every variable of the model, once each, in path order.
    pub fn variables(&self) -> Vec<Variable> {
        let mut all = self.wte.variables();
        all.extend(self.wpe.variables());
        for b in &self.blocks {
            all.extend(b.variables());
        }
        if let Some(norm) = &self.ln_f {
            all.extend(norm.variables());
        }
        if let Some(head) = &self.lm_head {
            all.extend(head.variables());
        }
        let unique: BTreeMap<String, Variable> = all
            .into_iter()
            .map(|v| (v.path().to_string(), v))
            .collect();
        unique.into_values().collect()
    }

    pub fn num_parameters(&self) -> usize {
        self.variables().iter().map(|v| v.shape().elem_count()).sum()
    }

    pub fn forward(&self, ctx: &mut Context<'_>, features: &Features) -> Result<ModelOutput> {
        let phase = ctx.begin_incremental();
        if phase.is_some() && !self.spec.causal {
            return Err(Error::config(
                "incremental decoding needs a causal model (mlm_training is set)",
            ));
        }
        let prompt_len = match phase {
            Some(Phase::Prefill) => Some(self.prompt_length(features)?),
            _ => None,
        };
        let out = self.forward_phase(ctx, features, phase)?;
        ctx.finish_incremental(prompt_len);
        Ok(out)
    }

    /// The prefill input must span the whole context; decode steps write
    /// into the caches it creates.
    fn prompt_length(&self, features: &Features) -> Result<usize> {
        let seq = features.inputs()?.size_of(dims::SEQUENCE)?;
        if seq != self.spec.n_ctx {
            return Err(Error::shape(format!(
                "prefill input has {seq} positions, the prompt must be padded to n_ctx = {}",
                self.spec.n_ctx
            )));
        }
        let len = features.prompt_length().unwrap_or(seq);
        if len == 0 || len > self.spec.n_ctx {
            return Err(Error::shape(format!(
                "prompt length {len} outside 1..={}",
                self.spec.n_ctx
            )));
        }
        Ok(len)
    }

    fn embed(&self, ctx: &mut Context<'_>, features: &Features, phase: Option<Phase>) -> Result<Tensor> {
        let inputs = features.inputs()?;
        let (ids, positions) = match phase {
            Some(Phase::Decode { index }) => {
                if index >= self.spec.n_ctx {
                    return Err(Error::shape(format!(
                        "decode position {index} is past the context length {}",
                        self.spec.n_ctx
                    )));
                }
                let ids = if inputs.shape().contains(dims::SEQUENCE) {
                    let row = inputs.slice(dims::SEQUENCE, index, 1)?;
                    row.reshape(inputs.shape().without(dims::SEQUENCE)?)?
                } else {
                    inputs.clone()
                };
                (ids, Tensor::scalar(index as f64, DType::I64))
            }
            _ => {
                let n = inputs.size_of(dims::SEQUENCE)?;
                if n > self.wpe.length() {
                    return Err(Error::shape(format!(
                        "sequence length {n} is longer than the position table ({})",
                        self.wpe.length()
                    )));
                }
                let positions = Tensor::range(&Dim::new(dims::SEQUENCE, n), DType::I64)?;
                (inputs.clone(), positions)
            }
        };
        let tok = self.wte.forward(ctx, &ids)?;
        let pos = self.wpe.forward(ctx, &positions)?;
        tok.add(&pos)
    }

    fn forward_phase(
        &self,
        ctx: &mut Context<'_>,
        features: &Features,
        phase: Option<Phase>,
    ) -> Result<ModelOutput> {
        let mut h = self.embed(ctx, features, phase)?;

        let mut aux_loss: Option<Tensor> = None;
        for block in &self.blocks {
            let (y, aux) = block.run(ctx, &h)?;
            h = y;
            if let Some(a) = aux {
                aux_loss = Some(match aux_loss {
                    Some(total) => total.add(&a)?,
                    None => a,
                });
            }
        }

        let logits = match &self.lm_head {
            Some(head) => head.forward(ctx, &h)?,
            None => {
                let h = match &self.ln_f {
                    Some(norm) => norm.forward(ctx, &h)?,
                    None => h,
                };
                let out = h
                    .shape()
                    .without(dims::EMBD)?
                    .concat(&Shape::new(vec![self.spec.vocab.clone()])?)?;
                ctx.contract(&[&h, &self.wte.table().value()?], &out)?
            }
        };
        let logits = logits.to_dtype(logits.dtype().at_least_f32())?;

        let labels = match phase {
            Some(Phase::Decode { .. }) => None,
            _ => features.labels(),
        };
        let Some(labels) = labels else {
            return Ok(ModelOutput {
                logits,
                loss: None,
                loss_batch: None,
                aux_loss,
            });
        };

        let mut loss_tok = cross_entropy_with_z_loss(&logits, labels, &self.spec.vocab, self.spec.z_loss)?;
        if !self.spec.causal {
            let mask = meshlm_nn::padding_mask(labels, self.spec.padding_id, loss_tok.dtype())?;
            loss_tok = loss_tok.mul(&mask)?;
        }
        let loss_batch = loss_tok.reduce_mean(&[dims::SEQUENCE])?;
        let mut loss = loss_tok.mean_all()?;
        if let Some(aux) = &aux_loss {
            loss = loss.add(&aux.to_dtype(loss.dtype())?)?;
        }
        Ok(ModelOutput {
            logits,
            loss: Some(loss),
            loss_batch: Some(loss_batch),
            aux_loss,
        })
    }
}
