// VarStore: explicit registry of trainable variables
//
// Variables live in a path-keyed map ("h0/attn/q", "wte", ...). Layers are
// handed a VarBuilder scoped to their own prefix and register or look up
// their parameters through it. Nothing is read from an ambient naming
// stack, so the full parameter set can be enumerated, counted, checkpointed
// and sharded from the store alone.
//
//   let mut vs = VarStore::new(VariableDType::default(), seed);
//   let mut root = vs.root();
//   let mut h0 = root.pp("h0");
//   let q = h0.pp("attn").get("q", shape, Init::Normal { std: 0.02 })?;
//
// PARAMETER SHARING
//
//   Requesting an existing path returns the existing variable (after checking
//   the shape), which is how blocks share parameters when configured to.

use std::collections::{BTreeMap, BTreeSet};

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::dtype::{DType, VariableDType};
use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::tensor::Tensor;

/// How a new variable is initialized.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    Zeros,
    Ones,
    Const(f64),
    Normal { std: f64 },
}

/// A trainable variable: path, storage tensor and precision triple.
#[derive(Debug, Clone)]
pub struct Variable {
    path: String,
    tensor: Tensor,
    dtype: VariableDType,
}

impl Variable {
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The storage tensor (storage dtype). Gradients are keyed by its id.
    pub fn tensor(&self) -> &Tensor {
        &self.tensor
    }

    pub fn shape(&self) -> &Shape {
        self.tensor.shape()
    }

    pub fn dtype(&self) -> VariableDType {
        self.dtype
    }

    /// Read the variable for compute, cast to its activation dtype.
    pub fn value(&self) -> Result<Tensor> {
        self.tensor.to_dtype(self.dtype.activation)
    }

    /// Overwrite the stored value (rounded to the storage dtype).
    pub fn assign(&self, data: &[f64]) -> Result<()> {
        self.tensor.update_data_inplace(data)
    }
}

/// Path-keyed registry of all variables of a model.
pub struct VarStore {
    vars: BTreeMap<String, Variable>,
    precision: VariableDType,
    rng: StdRng,
}

impl VarStore {
    pub fn new(precision: VariableDType, seed: u64) -> Self {
        VarStore {
            vars: BTreeMap::new(),
            precision,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn precision(&self) -> VariableDType {
        self.precision
    }

    /// Builder at the root scope.
    pub fn root(&mut self) -> VarBuilder<'_> {
        VarBuilder {
            store: self,
            prefix: String::new(),
        }
    }

    pub fn get(&self, path: &str) -> Option<&Variable> {
        self.vars.get(path)
    }

    /// All variables in path order.
    pub fn variables(&self) -> impl Iterator<Item = &Variable> {
        self.vars.values()
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// Total number of trainable scalars.
    pub fn num_parameters(&self) -> usize {
        self.vars.values().map(|v| v.shape().elem_count()).sum()
    }

    /// Every dimension name used by a variable.
    pub fn dim_names(&self) -> BTreeSet<String> {
        self.vars
            .values()
            .flat_map(|v| v.shape().names().into_iter().map(String::from))
            .collect()
    }

    fn get_or_create(&mut self, path: String, shape: Shape, init: Init) -> Result<Variable> {
        if let Some(existing) = self.vars.get(&path) {
            if existing.shape() != &shape {
                return Err(Error::shape(format!(
                    "variable '{path}' exists with shape {}, requested {shape}",
                    existing.shape()
                )));
            }
            return Ok(existing.clone());
        }
        let dtype = self.precision.storage;
        let tensor = match init {
            Init::Zeros => Tensor::zeros(shape, dtype),
            Init::Ones => Tensor::ones(shape, dtype),
            Init::Const(v) => Tensor::full(shape, v, dtype),
            Init::Normal { std } => Tensor::randn(shape, 0.0, std, dtype, &mut self.rng)?,
        }
        .set_variable();
        let var = Variable {
            path: path.clone(),
            tensor,
            dtype: self.precision,
        };
        log::debug!("variable {path}: {} ({})", var.shape(), dtype);
        self.vars.insert(path, var.clone());
        Ok(var)
    }

    /// Replace the value of `path` from raw data. Used by restore hooks.
    pub fn load(&self, path: &str, data: &[f64]) -> Result<()> {
        let var = self
            .vars
            .get(path)
            .ok_or_else(|| Error::msg(format!("unknown variable '{path}'")))?;
        var.assign(data)
    }

    pub fn storage_dtype(&self) -> DType {
        self.precision.storage
    }
}

/// Scoped handle for registering variables under a path prefix.
pub struct VarBuilder<'a> {
    store: &'a mut VarStore,
    prefix: String,
}

impl<'a> VarBuilder<'a> {
    /// A child scope `prefix/name`.
    pub fn pp(&mut self, name: &str) -> VarBuilder<'_> {
        VarBuilder {
            prefix: self.path(name),
            store: &mut *self.store,
        }
    }

    /// Full path of `name` in this scope.
    pub fn path(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.prefix, name)
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Get the variable `name` of this scope, creating it if needed.
    pub fn get(&mut self, name: &str, shape: Shape, init: Init) -> Result<Variable> {
        let path = self.path(name);
        self.store.get_or_create(path, shape, init)
    }

    pub fn precision(&self) -> VariableDType {
        self.store.precision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape(pairs: &[(&str, usize)]) -> Shape {
        Shape::from_pairs(pairs).unwrap()
    }

    #[test]
    fn test_paths_and_reuse() {
        let mut vs = VarStore::new(VariableDType::default(), 0);
        {
            let mut root = vs.root();
            let mut h0 = root.pp("h0");
            let mut attn = h0.pp("attn");
            let q = attn.get("q", shape(&[("embd", 4), ("heads", 2)]), Init::Normal { std: 0.02 })
                .unwrap();
            assert_eq!(q.path(), "h0/attn/q");
            let again = attn.get("q", shape(&[("embd", 4), ("heads", 2)]), Init::Zeros).unwrap();
            assert_eq!(again.tensor().id(), q.tensor().id());
            assert!(attn.get("q", shape(&[("embd", 5)]), Init::Zeros).is_err());
        }
        vs.root().get("wte", shape(&[("vocab", 10), ("embd", 4)]), Init::Zeros).unwrap();
        assert_eq!(vs.len(), 2);
        assert_eq!(vs.num_parameters(), 48);
        let names: Vec<String> = vs.dim_names().into_iter().collect();
        assert_eq!(names, vec!["embd", "heads", "vocab"]);
    }

    #[test]
    fn test_storage_and_activation_dtypes() {
        let mut vs = VarStore::new(VariableDType::new(DType::F32, DType::F32, DType::BF16), 1);
        let v = vs.root().get("g", shape(&[("embd", 3)]), Init::Const(1.001)).unwrap();
        assert_eq!(v.tensor().dtype(), DType::F32);
        let x = v.value().unwrap();
        assert_eq!(x.dtype(), DType::BF16);
        assert!(x.requires_grad());
    }

    #[test]
    fn test_seeded_init_is_deterministic() {
        let make = || {
            let mut vs = VarStore::new(VariableDType::uniform(DType::F64), 42);
            let v = vs.root().get("w", shape(&[("a", 5)]), Init::Normal { std: 1.0 }).unwrap();
            v.tensor().to_f64_vec().unwrap()
        };
        assert_eq!(make(), make());
    }
}
