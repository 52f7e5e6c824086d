// Input features: named tensors handed to a step
//
// LANGUAGE MODEL:
//
//   inputs   [batch, sequence]   token ids (I64)
//   labels   [batch, sequence]   next-token ids; optional outside TRAIN/EVAL
//
// MULTI-MODAL (validated by shape only, no model consumes it):
//
//   frame       [batch, sequence, ...]   image patches
//   token_x     [batch, sequence]
//   token_y     [batch, sequence]
//   frame_mask  [batch, sequence]
//   token_mask  [batch, sequence]
//
// An incremental DECODE call may pass `inputs` either as the full
// [batch, sequence] buffer or as the single position [batch].

use std::collections::BTreeMap;

use meshlm_core::{DType, Error, Result, Shape, Tensor};
use meshlm_nn::dims;

pub const INPUTS: &str = "inputs";
pub const LABELS: &str = "labels";
pub const FRAME: &str = "frame";
pub const TOKEN_X: &str = "token_x";
pub const TOKEN_Y: &str = "token_y";
pub const FRAME_MASK: &str = "frame_mask";
pub const TOKEN_MASK: &str = "token_mask";

/// Named input tensors of one step.
#[derive(Debug, Clone, Default)]
pub struct Features {
    tensors: BTreeMap<String, Tensor>,
    prompt_length: Option<usize>,
}

impl Features {
    pub fn new() -> Self {
        Self::default()
    }

    /// Language model features from `inputs` and optional `labels`.
    pub fn language_model(inputs: Tensor, labels: Option<Tensor>) -> Self {
        let f = Features::new().with(INPUTS, inputs);
        match labels {
            Some(l) => f.with(LABELS, l),
            None => f,
        }
    }

    pub fn with(mut self, name: &str, tensor: Tensor) -> Self {
        self.insert(name, tensor);
        self
    }

    pub fn insert(&mut self, name: &str, tensor: Tensor) {
        self.tensors.insert(name.to_string(), tensor);
    }

    /// Number of real prompt tokens in a PREFILL call. Defaults to the
    /// full sequence length.
    pub fn with_prompt_length(mut self, len: usize) -> Self {
        self.prompt_length = Some(len);
        self
    }

    pub fn prompt_length(&self) -> Option<usize> {
        self.prompt_length
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }

    pub fn require(&self, name: &str) -> Result<&Tensor> {
        self.get(name)
            .ok_or_else(|| Error::config(format!("missing input feature '{name}'")))
    }

    pub fn inputs(&self) -> Result<&Tensor> {
        self.require(INPUTS)
    }

    pub fn labels(&self) -> Option<&Tensor> {
        self.get(LABELS)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.tensors.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Batch size shared by every feature.
    pub fn batch_size(&self) -> Result<usize> {
        let mut size = None;
        for (name, t) in &self.tensors {
            let b = t.size_of(dims::BATCH)?;
            match size {
                None => size = Some(b),
                Some(s) if s != b => {
                    return Err(Error::DimensionSizeMismatch {
                        name: format!("{name}.{}", dims::BATCH),
                        expected: s,
                        got: b,
                    })
                }
                Some(_) => {}
            }
        }
        size.ok_or_else(|| Error::config("no input features"))
    }

    /// Rows `[start, start + len)` of every feature along the batch dim.
    pub fn slice_batch(&self, start: usize, len: usize) -> Result<Self> {
        let tensors = self
            .tensors
            .iter()
            .map(|(k, t)| Ok((k.clone(), t.slice(dims::BATCH, start, len)?)))
            .collect::<Result<_>>()?;
        Ok(Features {
            tensors,
            prompt_length: self.prompt_length,
        })
    }

    /// Check the language model contract against `[batch, sequence]`.
    pub fn validate_language_model(&self, batch: usize, sequence: usize) -> Result<()> {
        let expected = token_shape(batch, sequence)?;
        check_same_dims(INPUTS, self.inputs()?.shape(), &expected)?;
        if let Some(labels) = self.labels() {
            check_same_dims(LABELS, labels.shape(), &expected)?;
        }
        Ok(())
    }

    /// Check the multi-modal contract: every feature present, all sharing
    /// batch and sequence, masks shaped like their tokens.
    pub fn validate_multimodal(&self) -> Result<()> {
        let token_x = self.require(TOKEN_X)?;
        let tokens = token_x.shape();
        let batch = tokens.dim(dims::BATCH)?;
        let sequence = tokens.dim(dims::SEQUENCE)?;
        for name in [TOKEN_Y, FRAME_MASK, TOKEN_MASK] {
            check_same_dims(name, self.require(name)?.shape(), tokens)?;
        }
        let frame = self.require(FRAME)?.shape();
        for d in [batch, sequence] {
            let got = frame.size_of(d.name())?;
            if got != d.size() {
                return Err(Error::DimensionSizeMismatch {
                    name: format!("{FRAME}.{}", d.name()),
                    expected: d.size(),
                    got,
                });
            }
        }
        Ok(())
    }
}

/// `[batch, sequence]`.
pub fn token_shape(batch: usize, sequence: usize) -> Result<Shape> {
    Shape::from_pairs(&[(dims::BATCH, batch), (dims::SEQUENCE, sequence)])
}

/// Token id tensor `[batch, sequence]` from row-major ids.
pub fn token_tensor(ids: &[i64], batch: usize, sequence: usize) -> Result<Tensor> {
    Tensor::new(
        ids.iter().map(|&i| i as f64).collect(),
        token_shape(batch, sequence)?,
        DType::I64,
    )
}

fn check_same_dims(name: &str, got: &Shape, expected: &Shape) -> Result<()> {
    if got.same_dims(expected) {
        Ok(())
    } else {
        Err(Error::shape(format!(
            "feature '{name}' has shape {got}, expected {expected}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_model_contract() {
        let f = Features::language_model(
            token_tensor(&[1, 2, 3, 4, 5, 6], 2, 3).unwrap(),
            Some(token_tensor(&[2, 3, 4, 5, 6, 7], 2, 3).unwrap()),
        );
        f.validate_language_model(2, 3).unwrap();
        assert_eq!(f.batch_size().unwrap(), 2);
        assert!(f.validate_language_model(2, 4).unwrap_err().is_shape_error());

        let half = f.slice_batch(1, 1).unwrap();
        assert_eq!(half.inputs().unwrap().to_f64_vec().unwrap(), vec![4.0, 5.0, 6.0]);
        assert_eq!(half.labels().unwrap().to_f64_vec().unwrap(), vec![5.0, 6.0, 7.0]);
    }

    #[test]
    fn test_missing_inputs_is_config_error() {
        let f = Features::new();
        assert!(f.inputs().unwrap_err().is_config_error());
    }

    #[test]
    fn test_multimodal_contract() {
        let tokens = || token_tensor(&[0; 6], 2, 3).unwrap();
        let frame = Tensor::zeros(
            Shape::from_pairs(&[("batch", 2), ("sequence", 3), ("channels", 4)]).unwrap(),
            DType::F32,
        );
        let f = Features::new()
            .with(FRAME, frame)
            .with(TOKEN_X, tokens())
            .with(TOKEN_Y, tokens())
            .with(FRAME_MASK, tokens())
            .with(TOKEN_MASK, tokens());
        f.validate_multimodal().unwrap();

        let bad = f.clone().with(TOKEN_MASK, token_tensor(&[0; 4], 2, 2).unwrap());
        assert!(bad.validate_multimodal().unwrap_err().is_shape_error());

        let frame = Tensor::zeros(
            Shape::from_pairs(&[("batch", 2), ("sequence", 4), ("channels", 4)]).unwrap(),
            DType::F32,
        );
        let bad = f.with(FRAME, frame);
        assert!(bad.validate_multimodal().unwrap_err().is_shape_error());
    }
}
