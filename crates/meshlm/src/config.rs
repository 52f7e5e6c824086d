// Model configuration: a JSON-like mapping turned into typed parameters
//
// Required keys:
//
//   n_vocab, n_embd, n_head, n_layer, attention_types, n_ctx,
//   train_batch_size, mesh_shape, layout
//
// Every other key has an inert default. Unknown keys are kept in `raw` and
// never read, so configurations can grow without breaking older builds.
//
// ATTENTION TYPES:
//
//   flat      ["global", "local", "global", "local"]
//   repeated  [[["global", "local"], 2]]        same four layers
//
// The expanded list must have exactly n_layer entries.
//
// DATASETS:
//
//   `datasets` lists dataset ids (or [id, ...] entries). Their configs come
//   from the host; each dataset's n_vocab must fit the model's table, and
//   the last dataset supplies padding_id / eos_id.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use meshlm_core::{Error, LayoutRules, MeshShape, Result, VariableDType};
use meshlm_nn::{AttentionKind, MoeConfig};
use serde_json::{Map, Value};

/// Where a block normalizes around each sub-layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NormPlacement {
    /// `x + f(norm(x))`
    #[default]
    Pre,
    /// `norm(x + f(x))`
    Post,
    /// `x + norm_post(f(norm(x)))`
    Sandwich,
}

impl FromStr for NormPlacement {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pre" => Ok(NormPlacement::Pre),
            "post" => Ok(NormPlacement::Post),
            "sandwich" => Ok(NormPlacement::Sandwich),
            other => Err(Error::config(format!("unknown norm_placement '{other}'"))),
        }
    }
}

impl fmt::Display for NormPlacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NormPlacement::Pre => "pre",
            NormPlacement::Post => "post",
            NormPlacement::Sandwich => "sandwich",
        })
    }
}

/// Typed model and run parameters.
#[derive(Debug, Clone)]
pub struct ModelParams {
    pub n_vocab: usize,
    pub n_embd: usize,
    pub n_head: usize,
    pub n_layer: usize,
    pub attention_types: Vec<AttentionKind>,
    pub n_ctx: usize,
    pub train_batch_size: usize,
    pub mesh_shape: MeshShape,
    pub layout: LayoutRules,

    pub embed_dropout: f64,
    pub attn_dropout: f64,
    pub res_dropout: f64,
    pub scalenorm: bool,
    pub rezero: bool,
    pub norm_placement: NormPlacement,
    pub mlp_glu: bool,
    pub macaron: bool,
    pub moe_layers: Vec<usize>,
    pub moe_params: MoeConfig,
    pub no_weight_tie: bool,
    pub z_loss: f64,
    pub microbatches_per_batch: usize,
    pub tokens_per_mb_per_replica: Option<usize>,
    pub precision: VariableDType,
    pub mlm_training: bool,
    pub padding_id: i64,
    pub eos_id: i64,
    pub axial_pos_emb: Option<(usize, usize)>,
    pub num_mem_kv: usize,
    pub local_attention_radius: usize,
    pub lightweight_conv_attention: usize,
    pub convolution_dimension: usize,
    pub base_convolution_size: usize,
    pub scale_by_depth: bool,
    pub scale_by_in: bool,
    pub recompute_grad: bool,
    pub share_parameters: bool,
    pub auto_layout: bool,
    pub auto_layout_and_mesh_shape: bool,
    pub num_cores: Option<usize>,
    pub steps_per_checkpoint: usize,
    pub seed: u64,
    pub datasets: Vec<String>,

    /// The mapping as given, unknown keys included.
    pub raw: Map<String, Value>,
}

// Typed getters over the raw mapping

fn get<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    map.get(key).filter(|v| !v.is_null())
}

fn required<'a>(map: &'a Map<String, Value>, key: &str) -> Result<&'a Value> {
    get(map, key).ok_or_else(|| Error::config(format!("missing required key '{key}'")))
}

fn as_usize(key: &str, v: &Value) -> Result<usize> {
    v.as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| Error::config(format!("'{key}' must be a non-negative integer, got {v}")))
}

fn as_str<'a>(key: &str, v: &'a Value) -> Result<&'a str> {
    v.as_str()
        .ok_or_else(|| Error::config(format!("'{key}' must be a string, got {v}")))
}

fn req_usize(map: &Map<String, Value>, key: &str) -> Result<usize> {
    let n = as_usize(key, required(map, key)?)?;
    if n == 0 {
        return Err(Error::config(format!("'{key}' must be at least 1")));
    }
    Ok(n)
}

fn opt_usize(map: &Map<String, Value>, key: &str, default: usize) -> Result<usize> {
    get(map, key).map_or(Ok(default), |v| as_usize(key, v))
}

fn opt_f64(map: &Map<String, Value>, key: &str, default: f64) -> Result<f64> {
    get(map, key).map_or(Ok(default), |v| {
        v.as_f64()
            .ok_or_else(|| Error::config(format!("'{key}' must be a number, got {v}")))
    })
}

fn opt_i64(map: &Map<String, Value>, key: &str, default: i64) -> Result<i64> {
    get(map, key).map_or(Ok(default), |v| {
        v.as_i64()
            .ok_or_else(|| Error::config(format!("'{key}' must be an integer, got {v}")))
    })
}

/// Flags are true only when set to `true`.
fn flag(map: &Map<String, Value>, key: &str) -> bool {
    get(map, key).and_then(Value::as_bool).unwrap_or(false)
}

fn parse_kind(v: &Value) -> Result<AttentionKind> {
    as_str("attention_types", v)?.parse()
}

/// Expand the flat or repeated attention type list.
fn attention_types(v: &Value) -> Result<Vec<AttentionKind>> {
    let entries = v
        .as_array()
        .ok_or_else(|| Error::config("'attention_types' must be a list"))?;
    let mut kinds = Vec::new();
    for entry in entries {
        match entry {
            Value::String(_) => kinds.push(parse_kind(entry)?),
            Value::Array(pair) if pair.len() == 2 => {
                let pattern = pair[0]
                    .as_array()
                    .ok_or_else(|| Error::config(format!("bad attention_types entry {entry}")))?
                    .iter()
                    .map(parse_kind)
                    .collect::<Result<Vec<_>>>()?;
                let repeat = as_usize("attention_types", &pair[1])?;
                for _ in 0..repeat {
                    kinds.extend_from_slice(&pattern);
                }
            }
            other => return Err(Error::config(format!("bad attention_types entry {other}"))),
        }
    }
    Ok(kinds)
}

fn moe_params(v: Option<&Value>) -> Result<MoeConfig> {
    let mut cfg = MoeConfig::default();
    let Some(v) = v else {
        return Ok(cfg);
    };
    let map = v
        .as_object()
        .ok_or_else(|| Error::config("'moe_params' must be a mapping"))?;
    cfg.num_experts = opt_usize(map, "moe_num_experts", cfg.num_experts)?;
    if let Some(h) = get(map, "moe_hidden_size") {
        cfg.hidden_size = Some(as_usize("moe_hidden_size", h)?);
    }
    cfg.capacity_factor_train =
        opt_f64(map, "moe_capacity_factor_train", cfg.capacity_factor_train)?;
    cfg.capacity_factor_eval = opt_f64(map, "moe_capacity_factor_eval", cfg.capacity_factor_eval)?;
    cfg.loss_coef = opt_f64(map, "moe_loss_coef", cfg.loss_coef)?;
    if let Some(g) = get(map, "moe_gating") {
        let g = as_str("moe_gating", g)?;
        cfg.top_k = g
            .strip_prefix("top_")
            .and_then(|k| k.parse().ok())
            .ok_or_else(|| Error::config(format!("unknown moe_gating '{g}'")))?;
    }
    Ok(cfg)
}

fn dataset_ids(v: Option<&Value>) -> Result<Vec<String>> {
    let Some(v) = v else {
        return Ok(Vec::new());
    };
    let entries = v
        .as_array()
        .ok_or_else(|| Error::config("'datasets' must be a list"))?;
    entries
        .iter()
        .map(|e| {
            let id = match e {
                Value::Array(parts) => parts.first().unwrap_or(&Value::Null),
                other => other,
            };
            as_str("datasets", id).map(str::to_string)
        })
        .collect()
}

impl ModelParams {
    /// Parse a configuration mapping.
    pub fn from_value(value: &Value) -> Result<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| Error::config("model configuration must be a mapping"))?;

        let n_layer = req_usize(map, "n_layer")?;
        let attention_types = attention_types(required(map, "attention_types")?)?;
        if attention_types.len() != n_layer {
            return Err(Error::config(format!(
                "attention_types expands to {} layers, n_layer is {n_layer}",
                attention_types.len()
            )));
        }

        let axial_pos_emb = match get(map, "axial_pos_emb") {
            None => None,
            Some(v) => {
                let dims = v
                    .as_array()
                    .filter(|a| a.len() == 2)
                    .ok_or_else(|| Error::config("'axial_pos_emb' must be a pair of sizes"))?;
                Some((
                    as_usize("axial_pos_emb", &dims[0])?,
                    as_usize("axial_pos_emb", &dims[1])?,
                ))
            }
        };

        let moe_layers = match get(map, "moe_layers") {
            None => Vec::new(),
            Some(v) => v
                .as_array()
                .ok_or_else(|| Error::config("'moe_layers' must be a list"))?
                .iter()
                .map(|i| as_usize("moe_layers", i))
                .collect::<Result<_>>()?,
        };

        let precision = match get(map, "precision") {
            None => VariableDType::default(),
            Some(v) => VariableDType::from_preset(as_str("precision", v)?)?,
        };

        let norm_placement = match get(map, "norm_placement") {
            None => NormPlacement::default(),
            Some(v) => as_str("norm_placement", v)?.parse()?,
        };

        let num_cores = get(map, "num_cores")
            .map(|v| as_usize("num_cores", v))
            .transpose()?;
        let tokens_per_mb_per_replica = get(map, "tokens_per_mb_per_replica")
            .map(|v| as_usize("tokens_per_mb_per_replica", v))
            .transpose()?;

        let params = ModelParams {
            n_vocab: req_usize(map, "n_vocab")?,
            n_embd: req_usize(map, "n_embd")?,
            n_head: req_usize(map, "n_head")?,
            n_layer,
            attention_types,
            n_ctx: req_usize(map, "n_ctx")?,
            train_batch_size: req_usize(map, "train_batch_size")?,
            mesh_shape: MeshShape::parse(as_str("mesh_shape", required(map, "mesh_shape")?)?)?,
            layout: LayoutRules::parse(as_str("layout", required(map, "layout")?)?)?,
            embed_dropout: opt_f64(map, "embed_dropout", 0.0)?,
            attn_dropout: opt_f64(map, "attn_dropout", 0.0)?,
            res_dropout: opt_f64(map, "res_dropout", 0.0)?,
            scalenorm: flag(map, "scalenorm"),
            rezero: flag(map, "rezero"),
            norm_placement,
            mlp_glu: flag(map, "mlp_glu"),
            macaron: flag(map, "macaron"),
            moe_layers,
            moe_params: moe_params(get(map, "moe_params"))?,
            no_weight_tie: flag(map, "no_weight_tie"),
            z_loss: opt_f64(map, "z_loss", 1e-4)?,
            microbatches_per_batch: opt_usize(map, "microbatches_per_batch", 1)?.max(1),
            tokens_per_mb_per_replica,
            precision,
            mlm_training: flag(map, "mlm_training"),
            padding_id: opt_i64(map, "padding_id", 0)?,
            eos_id: opt_i64(map, "eos_id", 1)?,
            axial_pos_emb,
            num_mem_kv: opt_usize(map, "num_mem_kv", 0)?,
            local_attention_radius: opt_usize(map, "local_attention_radius", 256)?,
            lightweight_conv_attention: opt_usize(map, "lightweight_conv_attention", 0)?,
            convolution_dimension: opt_usize(map, "convolution_dimension", 1)?,
            base_convolution_size: opt_usize(map, "base_convolution_size", 256)?,
            scale_by_depth: flag(map, "scale_by_depth"),
            scale_by_in: flag(map, "scale_by_in"),
            recompute_grad: flag(map, "recompute_grad"),
            share_parameters: flag(map, "share_parameters"),
            auto_layout: flag(map, "auto_layout"),
            auto_layout_and_mesh_shape: flag(map, "auto_layout_and_mesh_shape"),
            num_cores,
            steps_per_checkpoint: opt_usize(map, "steps_per_checkpoint", 0)?,
            seed: opt_usize(map, "seed", 0)? as u64,
            datasets: dataset_ids(get(map, "datasets"))?,
            raw: map.clone(),
        };
        log::debug!(
            "model params: {} layers, embd {}, heads {}, vocab {}, mesh {}, layout {}",
            params.n_layer,
            params.n_embd,
            params.n_head,
            params.n_vocab,
            params.mesh_shape,
            params.layout
        );
        Ok(params)
    }

    /// Parse a JSON document.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| Error::config(format!("invalid model configuration: {e}")))?;
        Self::from_value(&value)
    }

    /// Check the configured datasets against their configs and take
    /// `padding_id` / `eos_id` from the last one.
    pub fn resolve_datasets(&mut self, registry: &BTreeMap<String, Value>) -> Result<()> {
        let mut last = None;
        for id in &self.datasets {
            let cfg = registry
                .get(id)
                .ok_or_else(|| Error::config(format!("dataset '{id}' was not found")))?;
            let vocab = cfg
                .get("n_vocab")
                .and_then(Value::as_u64)
                .ok_or_else(|| Error::config(format!("dataset '{id}' has no n_vocab")))?;
            if vocab as usize > self.n_vocab {
                return Err(Error::config(format!(
                    "the embedding table size {} must be at least the vocab size of dataset '{id}' ({vocab})",
                    self.n_vocab
                )));
            }
            last = Some(cfg);
        }
        if let Some(cfg) = last {
            self.padding_id = cfg.get("padding_id").and_then(Value::as_i64).unwrap_or(0);
            self.eos_id = cfg.get("eos_id").and_then(Value::as_i64).unwrap_or(1);
        }
        Ok(())
    }

    /// Autoregressive unless trained as a masked language model.
    pub fn causal(&self) -> bool {
        !self.mlm_training
    }

    pub fn is_moe_layer(&self, layer: usize) -> bool {
        self.moe_layers.contains(&layer)
    }
}
