// Evaluation metrics over logits and per-example losses. All return host
// f64 values; none of them enter the autograd tape.

use meshlm_core::{Dim, Error, Result, Tensor};

/// Fraction of positions whose argmax over `vocab` equals the label.
pub fn token_accuracy(logits: &Tensor, labels: &Tensor, vocab: &Dim) -> Result<f64> {
    let predicted = logits.argmax(vocab.name())?;
    let predicted = predicted.to_f64_vec_in(labels.shape())?;
    let labels = labels.to_f64_vec()?;
    if labels.is_empty() {
        return Err(Error::shape("token accuracy over an empty label tensor"));
    }
    let hits = predicted
        .iter()
        .zip(&labels)
        .filter(|(p, l)| p == l)
        .count();
    Ok(hits as f64 / labels.len() as f64)
}

/// `exp(mean(loss))`.
pub fn perplexity(loss: &Tensor) -> Result<f64> {
    Ok(loss.mean_all()?.to_scalar_f64()?.exp())
}

pub fn mean_logits(logits: &Tensor) -> Result<f64> {
    logits.mean_all()?.to_scalar_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshlm_core::{DType, Shape};

    #[test]
    fn test_accuracy_and_perplexity() {
        let logits = Tensor::new(
            vec![0.1, 0.9, 0.8, 0.2, 0.3, 0.7, 0.6, 0.4],
            Shape::from_pairs(&[("batch", 2), ("sequence", 2), ("vocab", 2)]).unwrap(),
            DType::F64,
        )
        .unwrap();
        let labels = Tensor::new(
            vec![1.0, 0.0, 0.0, 0.0],
            Shape::from_pairs(&[("batch", 2), ("sequence", 2)]).unwrap(),
            DType::I64,
        )
        .unwrap();
        let acc = token_accuracy(&logits, &labels, &Dim::new("vocab", 2)).unwrap();
        assert!((acc - 0.75).abs() < 1e-12);
        assert!((mean_logits(&logits).unwrap() - 0.5).abs() < 1e-12);

        let loss = Tensor::new(vec![0.0, 2.0], Shape::from_pairs(&[("batch", 2)]).unwrap(), DType::F64)
            .unwrap();
        assert!((perplexity(&loss).unwrap() - 1f64.exp()).abs() < 1e-12);
    }
}
