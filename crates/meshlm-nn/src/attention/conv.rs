// Convolutional attention: a single-head, non-attention sequence mixer
//
// The output is a sum of 1-D convolutions along `sequence`, one per
// distance:
//
//   distances   d_0 = 0,  d_i = ⌊r^(i / cdim)⌋ for i in 1..cdim
//   taps        s_0 = min(base_convolution_size, n_ctx),  s_i = 1
//
//   y[t] = Σ_i ( Σ_{j < s_i} W_i[j] · x[t - d_i - j] + b_i )
//
// (r = local_attention_radius, cdim = convolution_dimension.) Each tap is a
// shift of x stacked on `conv_taps`, so a single einsum per distance does the
// convolution. Non-causal layers center the taps of each distance on it.
//
// LIGHTWEIGHT GATE:
//
//   With G = lightweight_conv_attention > 0 the convolution produces
//   embd + G channels. The first G are a softmax gate over G shift offsets,
//   the rest the value:
//
//     out[t] = Σ_{g < G} gate[t, g] · value[t - g]
//
// DECODE caches the convolution input and splices x_t in. The convolution
// then runs over the whole cached sequence and position t is sliced out.

use meshlm_core::{Dim, Error, Init, Result, Shape, Tensor, VarBuilder, Variable};

use super::{record_prefill, update_cache, AttentionConfig, OutputBias};
use crate::context::{Context, Phase};
use crate::dims;
use crate::module::Module;

/// One convolution at a fixed distance.
struct Tap {
    distance: usize,
    w: Variable,
    b: Variable,
}

impl Tap {
    fn taps(&self) -> usize {
        self.w.shape().dims()[0].size()
    }
}

pub struct ConvAttention {
    pub(super) name: String,
    taps: Vec<Tap>,
    out: OutputBias,
    embd: Dim,
    gate: usize,
    causal: bool,
}

/// ⌊r^(i/cdim)⌋ for i in 1..cdim, after distance 0.
fn distances(radius: usize, cdim: usize) -> Vec<usize> {
    let mut d = vec![0];
    for i in 1..cdim {
        // Nudge exact powers (64^(1/3)) past float error before flooring.
        d.push(((radius as f64).powf(i as f64 / cdim as f64) + 1e-9).floor() as usize);
    }
    d
}

impl ConvAttention {
    pub fn new(vb: &mut VarBuilder<'_>, embd: &Dim, cfg: &AttentionConfig) -> Result<Self> {
        if cfg.conv_dim == 0 {
            return Err(Error::config("convolution_dimension must be at least 1"));
        }
        let features = Dim::new(dims::CONV_FEATURES, embd.size() + cfg.lightweight_conv);
        let base = cfg.base_conv_size.min(cfg.n_ctx).max(1);
        let mut taps = Vec::with_capacity(cfg.conv_dim);
        for (i, distance) in distances(cfg.radius, cfg.conv_dim).into_iter().enumerate() {
            let size = if i == 0 { base } else { 1 };
            let std = cfg.init.std_for(size * embd.size(), false);
            let mut scope = vb.pp(&format!("conv_{i}"));
            taps.push(Tap {
                distance,
                w: scope.get(
                    "w",
                    Shape::new(vec![
                        Dim::new(dims::CONV_TAPS, size),
                        embd.clone(),
                        features.clone(),
                    ])?,
                    Init::Normal { std },
                )?,
                b: scope.get("b", Shape::new(vec![features.clone()])?, Init::Zeros)?,
            });
        }
        Ok(ConvAttention {
            name: vb.prefix().to_string(),
            taps,
            out: OutputBias::new(vb, embd, cfg.res_dropout)?,
            embd: embd.clone(),
            gate: cfg.lightweight_conv,
            causal: cfg.causal,
        })
    }

    /// Convolution over a full `[.., sequence, embd]` input.
    fn convolve(&self, ctx: &Context<'_>, x: &Tensor) -> Result<Tensor> {
        let out_shape = x.shape().replace(
            self.embd.name(),
            &[Dim::new(dims::CONV_FEATURES, self.embd.size() + self.gate)],
        )?;
        let mut acc: Option<Tensor> = None;
        for tap in &self.taps {
            let size = tap.taps();
            let center = if self.causal { 0 } else { (size as isize - 1) / 2 };
            let shifted = (0..size)
                .map(|j| x.shift(dims::SEQUENCE, (tap.distance + j) as isize - center))
                .collect::<Result<Vec<_>>>()?;
            let refs: Vec<&Tensor> = shifted.iter().collect();
            let stacked = Tensor::stack(&refs, dims::CONV_TAPS)?;
            let y = ctx
                .contract(&[&stacked, &tap.w.value()?], &out_shape)?
                .add(&tap.b.value()?)?;
            acc = Some(match acc {
                Some(a) => a.add(&y)?,
                None => y,
            });
        }
        let a = acc.ok_or_else(|| Error::msg("convolutional attention without taps"))?;
        self.mix(ctx, &a, x.shape())
    }

    /// Apply the lightweight gate (or just rename) to get back to `x_shape`.
    fn mix(&self, ctx: &Context<'_>, a: &Tensor, x_shape: &Shape) -> Result<Tensor> {
        if self.gate == 0 {
            return a.rename(dims::CONV_FEATURES, self.embd.name());
        }
        let g = self.gate;
        let gate = a
            .slice(dims::CONV_FEATURES, 0, g)?
            .rename(dims::CONV_FEATURES, dims::GATE)?
            .softmax(dims::GATE)?;
        let value = a
            .slice(dims::CONV_FEATURES, g, self.embd.size())?
            .rename(dims::CONV_FEATURES, self.embd.name())?;
        let shifted = (0..g)
            .map(|i| value.shift(dims::SEQUENCE, i as isize))
            .collect::<Result<Vec<_>>>()?;
        let refs: Vec<&Tensor> = shifted.iter().collect();
        let stacked = Tensor::stack(&refs, dims::GATE)?;
        ctx.contract(&[&stacked, &gate], x_shape)
    }
}

impl Module for ConvAttention {
    fn forward(&self, ctx: &mut Context<'_>, x: &Tensor) -> Result<Tensor> {
        let a = match ctx.phase() {
            Some(Phase::Decode { index }) => {
                let cached = update_cache(ctx, &self.name, &[x], index)?;
                let full = self.convolve(ctx, &cached[0])?;
                let at = full.slice(dims::SEQUENCE, index, 1)?;
                at.reshape(full.shape().without(dims::SEQUENCE)?)?
            }
            phase => {
                if phase == Some(Phase::Prefill) {
                    record_prefill(ctx, &self.name, &[x]);
                }
                self.convolve(ctx, x)?
            }
        };
        self.out.apply(ctx, &a)
    }

    fn variables(&self) -> Vec<Variable> {
        let mut v: Vec<Variable> = self
            .taps
            .iter()
            .flat_map(|t| [t.w.clone(), t.b.clone()])
            .collect();
        v.extend(self.out.variables());
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distances() {
        assert_eq!(distances(256, 1), vec![0]);
        assert_eq!(distances(256, 2), vec![0, 16]);
        assert_eq!(distances(64, 3), vec![0, 4, 16]);
    }
}
