// ModelSpec: the declarative model tree
//
// Building a model is two phases:
//
//   ModelSpec::from_params(&params)     pure; fails on any configuration
//                                       error before a variable or tensor
//                                       exists
//   spec.compile(&mut store, plan)      registers every variable, checks
//                                       variable and activation shapes
//                                       against the layout, returns GptModel
//
// VARIABLE PATHS:
//
//   wte, wpe (or axial_wpe_1/axial_wpe_2)
//   h{i}/norm_1, h{i}/attn/..., h{i}/norm_rezero_1
//   h{i}/norm_2, h{i}/mlp/... or h{i}/moe/..., h{i}/norm_rezero_2
//   h{i}/mlp_macaron/...
//   ln_f (tied only), lm_head (untied only)
//
// With share_parameters every block uses the scope `h` instead of `h{i}`,
// so all blocks resolve to the same variables.

use std::sync::Arc;

use meshlm_core::{Dim, Error, MeshPlan, Result, Shape, VarStore};
use meshlm_nn::{dims, AttentionConfig, AttentionKind, InitConfig, MoeConfig, NormKind};

use super::block::Block;
use super::gpt::GptModel;
use crate::config::{ModelParams, NormPlacement};

/// Everything one block needs to build itself.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockSpec {
    pub index: usize,
    /// Variable scope (`h3`, or `h` for shared parameters).
    pub scope: String,
    pub attention: AttentionKind,
    pub norm: NormKind,
    pub placement: NormPlacement,
    pub moe: bool,
    pub macaron: bool,
    pub recompute: bool,
    pub glu: bool,
}

impl BlockSpec {
    pub fn rezero(&self) -> bool {
        self.norm == NormKind::ReZero
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionSpec {
    Learned { length: usize },
    Axial { a0: usize, a1: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSpec {
    /// Logits through the token table.
    Tied,
    /// A separate `lm_head` projection.
    Untied,
}

#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub vocab: Dim,
    pub embd: Dim,
    pub n_ctx: usize,
    pub batch_size: usize,
    pub position: PositionSpec,
    pub blocks: Vec<BlockSpec>,
    pub output: OutputSpec,
    pub attention: AttentionConfig,
    pub moe: MoeConfig,
    pub init: InitConfig,
    pub embed_dropout: f64,
    pub z_loss: f64,
    pub causal: bool,
    pub padding_id: i64,
}

impl ModelSpec {
    pub fn from_params(params: &ModelParams) -> Result<Self> {
        if params.n_embd % params.n_head != 0 {
            return Err(Error::config(format!(
                "n_embd {} is not divisible by n_head {}",
                params.n_embd, params.n_head
            )));
        }
        if params.attention_types.len() != params.n_layer {
            return Err(Error::config(format!(
                "{} attention types for {} layers",
                params.attention_types.len(),
                params.n_layer
            )));
        }
        if let Some(&layer) = params.moe_layers.iter().find(|&&l| l >= params.n_layer) {
            return Err(Error::config(format!(
                "moe layer {layer} does not exist in a {}-layer model",
                params.n_layer
            )));
        }

        let position = match params.axial_pos_emb {
            Some((a0, a1)) => {
                if a0 * a1 < params.n_ctx {
                    return Err(Error::config(format!(
                        "axial position table {a0}x{a1} covers fewer than n_ctx = {} positions",
                        params.n_ctx
                    )));
                }
                PositionSpec::Axial { a0, a1 }
            }
            None => PositionSpec::Learned {
                length: params.n_ctx,
            },
        };

        let norm = if params.rezero {
            NormKind::ReZero
        } else if params.scalenorm {
            NormKind::ScaleNorm
        } else {
            NormKind::LayerNorm
        };

        let blocks = params
            .attention_types
            .iter()
            .enumerate()
            .map(|(index, &attention)| BlockSpec {
                index,
                scope: if params.share_parameters {
                    "h".to_string()
                } else {
                    format!("h{index}")
                },
                attention,
                norm,
                placement: params.norm_placement,
                moe: params.is_moe_layer(index),
                macaron: params.macaron,
                recompute: params.recompute_grad,
                glu: params.mlp_glu,
            })
            .collect();

        let init = InitConfig {
            scale_by_depth: params.scale_by_depth,
            scale_by_in: params.scale_by_in,
            n_layer: params.n_layer,
            ..InitConfig::default()
        };

        Ok(ModelSpec {
            vocab: Dim::new(dims::VOCAB, params.n_vocab),
            embd: Dim::new(dims::EMBD, params.n_embd),
            n_ctx: params.n_ctx,
            batch_size: params.train_batch_size,
            position,
            blocks,
            output: if params.no_weight_tie {
                OutputSpec::Untied
            } else {
                OutputSpec::Tied
            },
            attention: AttentionConfig {
                n_head: params.n_head,
                n_ctx: params.n_ctx,
                causal: params.causal(),
                radius: params.local_attention_radius,
                num_mem_kv: params.num_mem_kv,
                attn_dropout: params.attn_dropout,
                res_dropout: params.res_dropout,
                lightweight_conv: params.lightweight_conv_attention,
                conv_dim: params.convolution_dimension,
                base_conv_size: params.base_convolution_size,
                init,
            },
            moe: params.moe_params.clone(),
            init,
            embed_dropout: params.embed_dropout,
            z_loss: params.z_loss,
            causal: params.causal(),
            padding_id: params.padding_id,
        })
    }

    pub fn n_layer(&self) -> usize {
        self.blocks.len()
    }

    /// Activation shapes every forward pass produces, for layout checks.
    pub fn activation_shapes(&self) -> Result<Vec<Shape>> {
        let batch = Dim::new(dims::BATCH, self.batch_size);
        let sequence = Dim::new(dims::SEQUENCE, self.n_ctx);
        let heads = Dim::new(dims::HEADS, self.attention.n_head);
        let per_head = Dim::new(
            dims::FEATURES_PER_HEAD,
            self.embd.size() / self.attention.n_head.max(1),
        );
        Ok(vec![
            Shape::new(vec![batch.clone(), sequence.clone(), self.embd.clone()])?,
            Shape::new(vec![batch.clone(), sequence.clone(), heads, per_head])?,
            Shape::new(vec![batch, sequence, self.vocab.clone()])?,
        ])
    }

    /// Register the variables in `store` and check the layout.
    pub fn compile(&self, store: &mut VarStore, plan: Arc<MeshPlan>) -> Result<GptModel> {
        let model = GptModel::build(self.clone(), store, Arc::clone(&plan))?;
        for var in model.variables() {
            plan.validate(var.shape())?;
        }
        for shape in self.activation_shapes()? {
            plan.validate(&shape)?;
        }
        log::info!(
            "compiled {} layers, {} variables, {} parameters on {} device(s)",
            self.n_layer(),
            model.variables().len(),
            model.num_parameters(),
            plan.num_devices()
        );
        Ok(model)
    }
}

/// Build the blocks in order; shared scopes resolve to the same variables.
pub(super) fn build_blocks(spec: &ModelSpec, store: &mut VarStore) -> Result<Vec<Arc<Block>>> {
    spec.blocks
        .iter()
        .map(|b| {
            let mut root = store.root();
            let mut vb = root.pp(&b.scope);
            Block::new(b, &mut vb, spec).map(Arc::new)
        })
        .collect()
}
