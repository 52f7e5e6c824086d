// Dimension names shared by the layers.
//
// Layers line tensors up by these names, and layout rules refer to them
// ("batch:x,heads:y"), so they are part of the public contract.

pub const BATCH: &str = "batch";
pub const SEQUENCE: &str = "sequence";
/// Key/value axis of global attention.
pub const MEMORY_LENGTH: &str = "memory_length";
pub const EMBD: &str = "embd";
pub const HEADS: &str = "heads";
pub const FEATURES_PER_HEAD: &str = "features_per_head";
/// Query/key feature axis of linear attention.
pub const FEATURES_PER_HEAD_IN: &str = "features_per_head_in";
pub const VOCAB: &str = "vocab";
/// Rows of the position embedding table.
pub const EMBED_SEQUENCE: &str = "embed_sequence";
pub const AXIAL_0: &str = "axial_dim_0";
pub const AXIAL_1: &str = "axial_dim_1";
pub const INTERMEDIATE: &str = "intermediate_expanded";
pub const EXPERTS: &str = "experts";
pub const EXPERT_HIDDEN: &str = "expert_hidden";
pub const MEM_KV_SEQUENCE: &str = "mem_kv_sequence";
/// Key offsets of local attention.
pub const WINDOW: &str = "window";
pub const CONV_TAPS: &str = "conv_taps";
pub const CONV_FEATURES: &str = "conv_features";
/// Shift offsets of the lightweight convolution gate.
pub const GATE: &str = "softmax_dim";
