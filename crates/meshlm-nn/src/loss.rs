// Softmax cross-entropy with z-loss
//
//   lse   = logsumexp(logits, vocab)
//   loss  = lse - logits[label] + z · lse²
//
// per position, in the logits' dims minus vocab. The z term keeps the
// normalizer near 1 (log near 0) so half-precision logits do not drift.
// Everything here runs in at least f32 whatever the activation dtype is.

use meshlm_core::{DType, Dim, Result, Tensor};

/// Per-position cross-entropy plus `z_loss · logsumexp²`.
///
/// `labels` holds integer ids over the non-vocab dims of `logits`. Ids
/// outside the vocabulary select nothing, so they contribute only `lse`.
pub fn cross_entropy_with_z_loss(
    logits: &Tensor,
    labels: &Tensor,
    vocab: &Dim,
    z_loss: f64,
) -> Result<Tensor> {
    let dtype = logits.dtype().at_least_f32();
    let logits = logits.to_dtype(dtype)?;
    let lse = logits.logsumexp(vocab.name())?;
    let target = labels.one_hot(vocab, 1.0, 0.0, dtype)?;
    let picked = Tensor::einsum(&[&logits, &target], lse.shape())?;
    let loss = lse.sub(&picked)?;
    if z_loss == 0.0 {
        return Ok(loss);
    }
    loss.add(&lse.square()?.affine(z_loss, 0.0)?)
}

/// 1 where `labels` differs from `padding_id`, 0 on padding. Constant.
pub fn padding_mask(labels: &Tensor, padding_id: i64, dtype: DType) -> Result<Tensor> {
    labels
        .to_dtype(dtype)?
        .map_const(|v| if v as i64 == padding_id { 0.0 } else { 1.0 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshlm_core::Shape;

    fn logits(data: &[f64]) -> Tensor {
        Tensor::new(
            data.to_vec(),
            Shape::from_pairs(&[("batch", 1), ("sequence", 2), ("vocab", 3)]).unwrap(),
            DType::F64,
        )
        .unwrap()
    }

    fn labels(data: &[f64]) -> Tensor {
        Tensor::new(
            data.to_vec(),
            Shape::from_pairs(&[("batch", 1), ("sequence", 2)]).unwrap(),
            DType::I64,
        )
        .unwrap()
    }

    #[test]
    fn test_uniform_logits() {
        let loss = cross_entropy_with_z_loss(
            &logits(&[0.0; 6]),
            &labels(&[0.0, 2.0]),
            &Dim::new("vocab", 3),
            0.0,
        )
        .unwrap();
        for v in loss.to_f64_vec().unwrap() {
            assert!((v - 3f64.ln()).abs() < 1e-12);
        }
    }

    #[test]
    fn test_z_loss_term() {
        let l = logits(&[1.0, 2.0, 3.0, 0.5, 0.5, 0.5]);
        let y = labels(&[2.0, 1.0]);
        let vocab = Dim::new("vocab", 3);
        let plain = cross_entropy_with_z_loss(&l, &y, &vocab, 0.0).unwrap().to_f64_vec().unwrap();
        let with_z = cross_entropy_with_z_loss(&l, &y, &vocab, 1e-4).unwrap().to_f64_vec().unwrap();
        let lse0 = (1f64.exp() + 2f64.exp() + 3f64.exp()).ln();
        assert!((plain[0] - (lse0 - 3.0)).abs() < 1e-12);
        assert!((with_z[0] - plain[0] - 1e-4 * lse0 * lse0).abs() < 1e-12);
    }

    #[test]
    fn test_half_logits_are_promoted() {
        let l = logits(&[0.0; 6]).to_dtype(DType::BF16).unwrap();
        let loss = cross_entropy_with_z_loss(&l, &labels(&[0.0, 0.0]), &Dim::new("vocab", 3), 0.0)
            .unwrap();
        assert_eq!(loss.dtype(), DType::F32);
    }

    #[test]
    fn test_padding_mask() {
        let m = padding_mask(&labels(&[7.0, 0.0]), 0, DType::F32).unwrap();
        assert_eq!(m.to_f64_vec().unwrap(), vec![1.0, 0.0]);
        assert!(!m.requires_grad());
    }
}
