//! # meshlm-nn
//!
//! Transformer layers over named-dimension tensors.
//!
//! Every layer registers its variables through a [`meshlm_core::VarBuilder`]
//! at construction and receives an explicit [`Context`] at run time:
//!
//! 1. **Context**: mode, precision, mesh plan, dropout seeding, incremental state
//! 2. **Norm / ReZero**: layernorm, scalenorm, residual gating
//! 3. **Dense**: named-dimension projection with scaled init
//! 4. **Embeddings**: token table, learned or axial positions
//! 5. **Attention**: global, local, linear and convolutional variants
//! 6. **FeedForward / MixtureOfExperts**: gelu MLP, GLU, routed experts
//! 7. **Loss / metrics**: cross-entropy with z-loss, accuracy, perplexity

pub mod attention;
pub mod context;
pub mod dense;
pub mod dims;
pub mod dropout;
pub mod embedding;
pub mod feed_forward;
pub mod init;
pub mod loss;
pub mod metrics;
pub mod module;
pub mod moe;
pub mod norm;

pub use attention::{Attention, AttentionConfig, AttentionKind};
pub use context::{Context, IncrementalContext, Mode, Phase};
pub use dense::Dense;
pub use dropout::Dropout;
pub use embedding::{PositionEmbedding, TokenEmbedding};
pub use feed_forward::FeedForward;
pub use init::InitConfig;
pub use loss::{cross_entropy_with_z_loss, padding_mask};
pub use metrics::{mean_logits, perplexity, token_accuracy};
pub use module::Module;
pub use moe::{MixtureOfExperts, MoeConfig};
pub use norm::{Norm, NormKind, ReZero};
