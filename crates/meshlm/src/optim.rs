// Optimizer adapter
//
// An optimizer turns accumulated gradients into new variable values. It
// never writes a variable itself: the step controller checks every Update
// and only then assigns them all, so a failing step leaves the model
// untouched.
//
// Math runs in each variable's update dtype; the assigned value is rounded
// to the storage dtype by the variable.

use meshlm_core::{Error, Result, Tensor, Variable};
use rayon::prelude::*;

/// New value for one variable, row-major in the variable's shape.
#[derive(Debug, Clone)]
pub struct Update {
    pub variable: Variable,
    pub value: Vec<f64>,
}

impl Update {
    /// Element count and finiteness.
    pub fn validate(&self) -> Result<()> {
        let expected = self.variable.shape().elem_count();
        if self.value.len() != expected {
            return Err(Error::ElementCountMismatch {
                shape: self.variable.shape().clone(),
                expected,
                got: self.value.len(),
            });
        }
        if let Some(i) = self.value.iter().position(|v| !v.is_finite()) {
            return Err(Error::msg(format!(
                "update of '{}' has a non-finite value at {i}",
                self.variable.path()
            )));
        }
        Ok(())
    }

    pub fn apply(&self) -> Result<()> {
        self.variable.assign(&self.value)
    }
}

/// A pluggable update rule.
pub trait Optimizer {
    /// New values for the variables in `grads`.
    fn apply_gradients(&mut self, grads: &[(Variable, Tensor)]) -> Result<Vec<Update>>;
}

/// Plain gradient descent: `param = param - learning_rate * grad`.
#[derive(Debug, Clone, Copy)]
pub struct Sgd {
    pub learning_rate: f64,
}

impl Sgd {
    pub fn new(learning_rate: f64) -> Self {
        Self { learning_rate }
    }
}

impl Optimizer for Sgd {
    fn apply_gradients(&mut self, grads: &[(Variable, Tensor)]) -> Result<Vec<Update>> {
        let lr = self.learning_rate;
        grads
            .iter()
            .map(|(var, grad)| {
                let dtype = var.dtype().update;
                let param = var.tensor().to_f64_vec()?;
                let grad = grad.to_f64_vec_in(var.shape())?;
                let value = param
                    .par_iter()
                    .zip(grad.par_iter())
                    .map(|(p, g)| dtype.round(dtype.round(*p) - lr * g))
                    .collect();
                Ok(Update {
                    variable: var.clone(),
                    value,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshlm_core::{DType, Init, Shape, VarStore, VariableDType};

    #[test]
    fn test_sgd_update() {
        let mut vs = VarStore::new(VariableDType::uniform(DType::F64), 0);
        let w = vs
            .root()
            .get("w", Shape::from_pairs(&[("embd", 3)]).unwrap(), Init::Ones)
            .unwrap();
        let g = Tensor::new(vec![1.0, -2.0, 0.5], w.shape().clone(), DType::F64).unwrap();
        let updates = Sgd::new(0.1).apply_gradients(&[(w.clone(), g)]).unwrap();
        assert_eq!(updates.len(), 1);
        updates[0].validate().unwrap();
        // Nothing is written until the update is applied.
        assert_eq!(w.tensor().to_f64_vec().unwrap(), vec![1.0, 1.0, 1.0]);
        updates[0].apply().unwrap();
        let v = w.tensor().to_f64_vec().unwrap();
        assert!((v[0] - 0.9).abs() < 1e-12);
        assert!((v[1] - 1.2).abs() < 1e-12);
        assert!((v[2] - 0.95).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_update() {
        let mut vs = VarStore::new(VariableDType::uniform(DType::F64), 0);
        let w = vs
            .root()
            .get("w", Shape::from_pairs(&[("embd", 2)]).unwrap(), Init::Zeros)
            .unwrap();
        let short = Update {
            variable: w.clone(),
            value: vec![1.0],
        };
        assert!(short.validate().unwrap_err().is_shape_error());
        let nan = Update {
            variable: w,
            value: vec![1.0, f64::NAN],
        };
        assert!(nan.validate().is_err());
    }
}
