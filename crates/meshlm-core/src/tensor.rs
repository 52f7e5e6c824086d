use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rand::Rng;
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;

use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::op::{BinaryOp, Op, TensorId, UnaryOp};
use crate::shape::{broadcast_offsets, Dim, Shape};

// Tensor: an n-dimensional array over NAMED dimensions
//
// A Tensor couples a row-major buffer with a named Shape, a DType and the Op
// that produced it. Every operation identifies dimensions by name:
//
//   let h = Tensor::einsum(&[&x, &w], &out_shape)?;   // contract what out lacks
//   let y = h.add(&bias)?;                            // broadcast by name
//   let p = y.softmax("vocab")?;
//
// MEMORY MODEL:
//
//   Storage is behind Arc<RwLock<Vec<f64>>>. Cloning a Tensor only bumps the
//   Arc. Values are kept as f64 and rounded to the tensor's DType whenever an
//   op produces them, which reproduces half/bfloat precision numerics.
//   Variables share their storage with every handle, so an optimizer update
//   through `update_data_inplace` is seen by every holder.
//
// AUTOGRAD:
//
//   `requires_grad` is true for variables and for anything computed from
//   them. Ops whose inputs do not require gradients record Op::None, so
//   constant masks and one-hot tables never enter the tape.

struct TensorInner {
    id: TensorId,
    storage: Arc<RwLock<Vec<f64>>>,
    shape: Shape,
    dtype: DType,
    op: Op,
    is_variable: bool,
    requires_grad: bool,
}

/// An n-dimensional array with named dimensions.
#[derive(Clone)]
pub struct Tensor {
    inner: Arc<TensorInner>,
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tensor(id={:?}, shape={}, dtype={}, op={})",
            self.inner.id,
            self.inner.shape,
            self.inner.dtype,
            self.inner.op.kind(),
        )
    }
}

fn poisoned<T>(_: T) -> Error {
    Error::msg("tensor storage lock poisoned")
}

/// Split a shape around one dimension into (outer, size, inner) extents.
fn split_at(shape: &Shape, dim: &str) -> Result<(usize, usize, usize)> {
    let idx = shape.index_of(dim).ok_or_else(|| Error::DimensionNotFound {
        name: dim.to_string(),
        shape: shape.clone(),
    })?;
    let sizes = shape.sizes();
    let outer: usize = sizes[..idx].iter().product();
    let inner: usize = sizes[idx + 1..].iter().product();
    Ok((outer, sizes[idx], inner))
}

impl Tensor {
    // Internal constructors

    /// Build a tensor from data already rounded to `dtype`.
    ///
    /// If no input of `op` requires a gradient the op is dropped.
    pub(crate) fn from_op(data: Vec<f64>, shape: Shape, dtype: DType, op: Op) -> Self {
        let requires_grad = op.inputs().iter().any(|t| t.requires_grad());
        let op = if requires_grad { op } else { Op::None };
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage: Arc::new(RwLock::new(data)),
                shape,
                dtype,
                op,
                is_variable: false,
                requires_grad,
            }),
        }
    }

    fn with_flags(&self, op: Op, is_variable: bool, requires_grad: bool, fresh_id: bool) -> Self {
        Tensor {
            inner: Arc::new(TensorInner {
                id: if fresh_id { TensorId::new() } else { self.inner.id },
                storage: Arc::clone(&self.inner.storage),
                shape: self.inner.shape.clone(),
                dtype: self.inner.dtype,
                op,
                is_variable,
                requires_grad,
            }),
        }
    }

    // Creation

    /// Create a tensor from raw values, rounding them to `dtype`.
    pub fn new(data: Vec<f64>, shape: Shape, dtype: DType) -> Result<Self> {
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        let data = data.into_iter().map(|v| dtype.round(v)).collect();
        Ok(Self::from_op(data, shape, dtype, Op::None))
    }

    pub fn full(shape: Shape, value: f64, dtype: DType) -> Self {
        let n = shape.elem_count();
        Self::from_op(vec![dtype.round(value); n], shape, dtype, Op::None)
    }

    pub fn zeros(shape: Shape, dtype: DType) -> Self {
        Self::full(shape, 0.0, dtype)
    }

    pub fn ones(shape: Shape, dtype: DType) -> Self {
        Self::full(shape, 1.0, dtype)
    }

    pub fn scalar(value: f64, dtype: DType) -> Self {
        Self::full(Shape::scalar(), value, dtype)
    }

    /// Normal(mean, std) samples drawn from `rng`.
    pub fn randn<R: Rng + ?Sized>(
        shape: Shape,
        mean: f64,
        std: f64,
        dtype: DType,
        rng: &mut R,
    ) -> Result<Self> {
        let normal = Normal::new(mean, std)
            .map_err(|e| Error::msg(format!("invalid normal distribution: {e}")))?;
        let data = (0..shape.elem_count())
            .map(|_| dtype.round(normal.sample(rng)))
            .collect();
        Ok(Self::from_op(data, shape, dtype, Op::None))
    }

    /// `[0, 1, ..., dim.size - 1]` along `dim`.
    pub fn range(dim: &Dim, dtype: DType) -> Result<Self> {
        let shape = Shape::new(vec![dim.clone()])?;
        Self::new((0..dim.size()).map(|i| i as f64).collect(), shape, dtype)
    }

    /// One-hot encode integer values of `self` along a new dimension `dim`.
    ///
    /// Values outside `[0, dim.size)` produce an all-`off` row.
    pub fn one_hot(&self, dim: &Dim, on: f64, off: f64, dtype: DType) -> Result<Self> {
        let shape = self.shape().concat(&Shape::new(vec![dim.clone()])?)?;
        let ids = self.to_f64_vec()?;
        let n = dim.size();
        let mut data = vec![dtype.round(off); ids.len() * n];
        for (i, &id) in ids.iter().enumerate() {
            if id >= 0.0 && (id as usize) < n {
                data[i * n + id as usize] = dtype.round(on);
            }
        }
        Ok(Self::from_op(data, shape, dtype, Op::None))
    }

    // Accessors

    pub fn id(&self) -> TensorId {
        self.inner.id
    }

    pub fn shape(&self) -> &Shape {
        &self.inner.shape
    }

    pub fn dims(&self) -> &[Dim] {
        self.inner.shape.dims()
    }

    pub fn rank(&self) -> usize {
        self.inner.shape.rank()
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    pub fn elem_count(&self) -> usize {
        self.inner.shape.elem_count()
    }

    pub fn op(&self) -> &Op {
        &self.inner.op
    }

    pub fn is_variable(&self) -> bool {
        self.inner.is_variable
    }

    pub fn requires_grad(&self) -> bool {
        self.inner.requires_grad
    }

    /// Size of a named dimension.
    pub fn size_of(&self, name: &str) -> Result<usize> {
        self.inner.shape.size_of(name)
    }

    /// The named dimension itself.
    pub fn dim(&self, name: &str) -> Result<Dim> {
        self.inner.shape.dim(name).cloned()
    }

    pub(crate) fn read_storage(&self) -> Result<RwLockReadGuard<'_, Vec<f64>>> {
        self.inner.storage.read().map_err(poisoned)
    }

    fn write_storage(&self) -> Result<RwLockWriteGuard<'_, Vec<f64>>> {
        self.inner.storage.write().map_err(poisoned)
    }

    /// Copy the data out in row-major order of this tensor's shape.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        Ok(self.read_storage()?.clone())
    }

    /// Extract the single value of a one-element tensor.
    pub fn to_scalar_f64(&self) -> Result<f64> {
        if self.elem_count() != 1 {
            return Err(Error::shape(format!(
                "expected a single element, tensor has shape {}",
                self.shape()
            )));
        }
        Ok(self.read_storage()?[0])
    }

    /// Data transposed into the dimension order of `order` (same dims).
    pub fn to_f64_vec_in(&self, order: &Shape) -> Result<Vec<f64>> {
        if !self.shape().same_dims(order) {
            return Err(Error::shape(format!(
                "cannot view {} as {}",
                self.shape(),
                order
            )));
        }
        let data = self.read_storage()?;
        let offs = broadcast_offsets(self.shape(), order)?;
        Ok(offs.into_iter().map(|o| data[o]).collect())
    }

    // Variables

    /// Mark this tensor as a trainable variable (same id and storage).
    pub fn set_variable(self) -> Self {
        self.with_flags(Op::None, true, true, false)
    }

    /// A leaf sharing this tensor's storage with no autograd history.
    pub fn detach(&self) -> Self {
        self.with_flags(Op::None, false, false, true)
    }

    /// Overwrite this tensor's values in place, rounding to its dtype.
    ///
    /// Every handle sharing the storage observes the new values. Used by the
    /// training controller to apply optimizer updates.
    pub fn update_data_inplace(&self, new_data: &[f64]) -> Result<()> {
        let expected = self.elem_count();
        if new_data.len() != expected {
            return Err(Error::msg(format!(
                "update_data_inplace: expected {} elements, got {}",
                expected,
                new_data.len()
            )));
        }
        let dtype = self.dtype();
        let mut guard = self.write_storage()?;
        for (dst, &v) in guard.iter_mut().zip(new_data) {
            *dst = dtype.round(v);
        }
        Ok(())
    }

    /// Compute gradients of this scalar with respect to the whole graph.
    pub fn backward(&self) -> Result<crate::backprop::GradStore> {
        crate::backprop::backward(self)
    }

    /// Constant tensor of the same shape computed elementwise from this one.
    /// The result never requires a gradient.
    pub fn map_const(&self, f: impl Fn(f64) -> f64 + Sync + Send) -> Result<Self> {
        let dtype = self.dtype();
        let data = self
            .read_storage()?
            .par_iter()
            .map(|&v| dtype.round(f(v)))
            .collect();
        Ok(Self::from_op(data, self.shape().clone(), dtype, Op::None))
    }

    // Elementwise

    /// Elementwise binary op, broadcasting over the union of dimension names.
    pub fn binary(&self, rhs: &Tensor, op: BinaryOp) -> Result<Self> {
        let out_shape = self.shape().union(rhs.shape())?;
        let dtype = self.dtype().promote(rhs.dtype());
        let lo = broadcast_offsets(self.shape(), &out_shape)?;
        let ro = broadcast_offsets(rhs.shape(), &out_shape)?;
        let data = {
            let l = self.to_f64_vec()?;
            let r = rhs.to_f64_vec()?;
            lo.par_iter()
                .zip(ro.par_iter())
                .map(|(&i, &j)| {
                    let (a, b) = (l[i], r[j]);
                    dtype.round(match op {
                        BinaryOp::Add => a + b,
                        BinaryOp::Sub => a - b,
                        BinaryOp::Mul => a * b,
                        BinaryOp::Div => a / b,
                    })
                })
                .collect()
        };
        Ok(Self::from_op(
            data,
            out_shape,
            dtype,
            Op::Binary {
                lhs: self.clone(),
                rhs: rhs.clone(),
                op,
            },
        ))
    }

    pub fn add(&self, rhs: &Tensor) -> Result<Self> {
        self.binary(rhs, BinaryOp::Add)
    }

    pub fn sub(&self, rhs: &Tensor) -> Result<Self> {
        self.binary(rhs, BinaryOp::Sub)
    }

    pub fn mul(&self, rhs: &Tensor) -> Result<Self> {
        self.binary(rhs, BinaryOp::Mul)
    }

    pub fn div(&self, rhs: &Tensor) -> Result<Self> {
        self.binary(rhs, BinaryOp::Div)
    }

    pub fn unary(&self, op: UnaryOp) -> Result<Self> {
        let dtype = self.dtype();
        let data = self
            .read_storage()?
            .par_iter()
            .map(|&x| {
                dtype.round(match op {
                    UnaryOp::Neg => -x,
                    UnaryOp::Exp => x.exp(),
                    UnaryOp::Log => x.ln(),
                    UnaryOp::Sqrt => x.sqrt(),
                    UnaryOp::Rsqrt => 1.0 / x.sqrt(),
                    UnaryOp::Square => x * x,
                    UnaryOp::Gelu => gelu(x),
                    UnaryOp::Relu => x.max(0.0),
                    UnaryOp::Tanh => x.tanh(),
                })
            })
            .collect();
        Ok(Self::from_op(
            data,
            self.shape().clone(),
            dtype,
            Op::Unary {
                input: self.clone(),
                op,
            },
        ))
    }

    pub fn neg(&self) -> Result<Self> {
        self.unary(UnaryOp::Neg)
    }

    pub fn exp(&self) -> Result<Self> {
        self.unary(UnaryOp::Exp)
    }

    pub fn log(&self) -> Result<Self> {
        self.unary(UnaryOp::Log)
    }

    pub fn sqrt(&self) -> Result<Self> {
        self.unary(UnaryOp::Sqrt)
    }

    pub fn rsqrt(&self) -> Result<Self> {
        self.unary(UnaryOp::Rsqrt)
    }

    pub fn square(&self) -> Result<Self> {
        self.unary(UnaryOp::Square)
    }

    pub fn gelu(&self) -> Result<Self> {
        self.unary(UnaryOp::Gelu)
    }

    pub fn relu(&self) -> Result<Self> {
        self.unary(UnaryOp::Relu)
    }

    pub fn tanh(&self) -> Result<Self> {
        self.unary(UnaryOp::Tanh)
    }

    /// `self * mul + add`
    pub fn affine(&self, mul: f64, add: f64) -> Result<Self> {
        let dtype = self.dtype();
        let data = self
            .read_storage()?
            .par_iter()
            .map(|&x| dtype.round(x * mul + add))
            .collect();
        Ok(Self::from_op(
            data,
            self.shape().clone(),
            dtype,
            Op::Affine {
                input: self.clone(),
                mul,
                add,
            },
        ))
    }

    // Einsum

    /// Named-dimension Einstein summation.
    ///
    /// The result has exactly `output`'s dimensions. Names that appear in the
    /// inputs but not in `output` are summed over; names in `output` that no
    /// input carries are broadcast. A name shared by several operands must
    /// have the same size everywhere.
    pub fn einsum(inputs: &[&Tensor], output: &Shape) -> Result<Self> {
        if inputs.is_empty() {
            return Err(Error::msg("einsum needs at least one input"));
        }
        let mut reduced: Vec<Dim> = Vec::new();
        for t in inputs {
            for d in t.dims() {
                if let Ok(o) = output.dim(d.name()) {
                    if o.size() != d.size() {
                        return Err(Error::DimensionSizeMismatch {
                            name: d.name().to_string(),
                            expected: o.size(),
                            got: d.size(),
                        });
                    }
                    continue;
                }
                match reduced.iter().find(|r| r.name() == d.name()) {
                    Some(r) if r.size() != d.size() => {
                        return Err(Error::DimensionSizeMismatch {
                            name: d.name().to_string(),
                            expected: r.size(),
                            got: d.size(),
                        })
                    }
                    Some(_) => {}
                    None => reduced.push(d.clone()),
                }
            }
        }
        let reduced = Shape::new(reduced)?;
        let dtype = inputs
            .iter()
            .skip(1)
            .fold(inputs[0].dtype(), |acc, t| acc.promote(t.dtype()));

        let out_strides = inputs
            .iter()
            .map(|t| t.shape().strides_for(output))
            .collect::<Result<Vec<_>>>()?;
        let red_strides = inputs
            .iter()
            .map(|t| t.shape().strides_for(&reduced))
            .collect::<Result<Vec<_>>>()?;
        let out_sizes = output.sizes();
        let red_sizes = reduced.sizes();
        let red_count = reduced.elem_count();

        // Owned copies: the same tensor may appear more than once.
        let bufs = inputs
            .iter()
            .map(|t| t.to_f64_vec())
            .collect::<Result<Vec<_>>>()?;
        let n_in = bufs.len();

        let data: Vec<f64> = (0..output.elem_count())
            .into_par_iter()
            .map(|o| {
                let mut base = vec![0usize; n_in];
                let mut rem = o;
                for k in (0..out_sizes.len()).rev() {
                    let c = rem % out_sizes[k];
                    rem /= out_sizes[k];
                    for i in 0..n_in {
                        base[i] += c * out_strides[i][k];
                    }
                }
                let mut counter = vec![0usize; red_sizes.len()];
                let mut acc = 0.0;
                for _ in 0..red_count {
                    let mut p = 1.0;
                    for i in 0..n_in {
                        p *= bufs[i][base[i]];
                    }
                    acc += p;
                    let mut k = red_sizes.len();
                    while k > 0 {
                        k -= 1;
                        counter[k] += 1;
                        for i in 0..n_in {
                            base[i] += red_strides[i][k];
                        }
                        if counter[k] < red_sizes[k] {
                            break;
                        }
                        for i in 0..n_in {
                            base[i] -= red_strides[i][k] * red_sizes[k];
                        }
                        counter[k] = 0;
                    }
                }
                dtype.round(acc)
            })
            .collect();

        Ok(Self::from_op(
            data,
            output.clone(),
            dtype,
            Op::Einsum {
                inputs: inputs.iter().map(|t| (*t).clone()).collect(),
            },
        ))
    }

    /// Sum over the named dimensions.
    pub fn reduce_sum(&self, dims: &[&str]) -> Result<Self> {
        for d in dims {
            self.shape().dim(d)?;
        }
        Self::einsum(&[self], &self.shape().without_all(dims))
    }

    /// Mean over the named dimensions.
    pub fn reduce_mean(&self, dims: &[&str]) -> Result<Self> {
        let mut count = 1usize;
        for d in dims {
            count *= self.size_of(d)?;
        }
        self.reduce_sum(dims)?.affine(1.0 / count as f64, 0.0)
    }

    pub fn sum_all(&self) -> Result<Self> {
        Self::einsum(&[self], &Shape::scalar())
    }

    pub fn mean_all(&self) -> Result<Self> {
        let n = self.elem_count() as f64;
        self.sum_all()?.affine(1.0 / n, 0.0)
    }

    /// Sum away every dimension not in `shape` and order the rest like it.
    pub fn sum_to(&self, shape: &Shape) -> Result<Self> {
        shape.check_broadcast_to(self.shape())?;
        Self::einsum(&[self], shape)
    }

    /// Broadcast to `target`, which must contain every dimension of `self`.
    pub fn broadcast_to(&self, target: &Shape) -> Result<Self> {
        self.shape().check_broadcast_to(target)?;
        Self::einsum(&[self], target)
    }

    /// Reorder to the dimension order of `order` (same set of dimensions).
    pub fn transpose_to(&self, order: &Shape) -> Result<Self> {
        if !self.shape().same_dims(order) {
            return Err(Error::shape(format!(
                "transpose_to: {} and {} have different dimensions",
                self.shape(),
                order
            )));
        }
        if self.shape() == order {
            return Ok(self.clone());
        }
        Self::einsum(&[self], order)
    }

    /// Max over the named dimensions. Not differentiable: the result is a
    /// constant, which is all the softmax stabilizer needs.
    pub fn reduce_max(&self, dims: &[&str]) -> Result<Self> {
        for d in dims {
            self.shape().dim(d)?;
        }
        let out_shape = self.shape().without_all(dims);
        let offs = broadcast_offsets(&out_shape, self.shape())?;
        let mut out = vec![f64::NEG_INFINITY; out_shape.elem_count()];
        let data = self.read_storage()?;
        for (i, &o) in offs.iter().enumerate() {
            if data[i] > out[o] {
                out[o] = data[i];
            }
        }
        Ok(Self::from_op(out, out_shape, self.dtype(), Op::None))
    }

    /// Index of the maximum along `dim`, as an I64 constant.
    pub fn argmax(&self, dim: &str) -> Result<Self> {
        let (outer, n, inner) = split_at(self.shape(), dim)?;
        let out_shape = self.shape().without(dim)?;
        let data = self.read_storage()?;
        let mut out = vec![0.0; outer * inner];
        for o in 0..outer {
            for q in 0..inner {
                let mut best = 0usize;
                let mut best_v = f64::NEG_INFINITY;
                for j in 0..n {
                    let v = data[(o * n + j) * inner + q];
                    if v > best_v {
                        best_v = v;
                        best = j;
                    }
                }
                out[o * inner + q] = best as f64;
            }
        }
        Ok(Self::from_op(out, out_shape, DType::I64, Op::None))
    }

    /// Softmax along a named dimension.
    pub fn softmax(&self, dim: &str) -> Result<Self> {
        let max = self.reduce_max(&[dim])?;
        let e = self.sub(&max)?.exp()?;
        let s = e.reduce_sum(&[dim])?;
        e.div(&s)
    }

    /// `log(sum(exp(x)))` along a named dimension, numerically stabilized.
    pub fn logsumexp(&self, dim: &str) -> Result<Self> {
        let max = self.reduce_max(&[dim])?;
        self.sub(&max)?
            .exp()?
            .reduce_sum(&[dim])?
            .log()?
            .add(&max)
    }

    pub fn log_softmax(&self, dim: &str) -> Result<Self> {
        let lse = self.logsumexp(dim)?;
        self.sub(&lse)
    }

    // Layout ops

    /// Reinterpret the data under a new shape with the same element count.
    pub fn reshape(&self, shape: Shape) -> Result<Self> {
        if shape.elem_count() != self.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: self.elem_count(),
                shape,
            });
        }
        let data = self.to_f64_vec()?;
        Ok(Self::from_op(
            data,
            shape,
            self.dtype(),
            Op::Reshape {
                input: self.clone(),
                src_shape: self.shape().clone(),
            },
        ))
    }

    /// Rename one dimension, keeping the data as is.
    pub fn rename(&self, old: &str, new: &str) -> Result<Self> {
        let shape = self.shape().rename(old, new)?;
        self.reshape(shape)
    }

    /// Replace one dimension by several whose sizes multiply to its size
    /// (or several adjacent ones by one, via `reshape`).
    pub fn replace_dim(&self, name: &str, with: &[Dim]) -> Result<Self> {
        let shape = self.shape().replace(name, with)?;
        self.reshape(shape)
    }

    /// Running sum along `dim`; `reverse` sums from the end.
    pub fn cumsum(&self, dim: &str, reverse: bool) -> Result<Self> {
        let (_, n, inner) = split_at(self.shape(), dim)?;
        let mut data = self.to_f64_vec()?;
        let dtype = self.dtype();
        let len = data.len();
        if !reverse {
            for i in 0..len {
                if (i / inner) % n > 0 {
                    data[i] = dtype.round(data[i] + data[i - inner]);
                }
            }
        } else {
            for i in (0..len).rev() {
                if (i / inner) % n < n - 1 {
                    data[i] = dtype.round(data[i] + data[i + inner]);
                }
            }
        }
        Ok(Self::from_op(
            data,
            self.shape().clone(),
            dtype,
            Op::Cumsum {
                input: self.clone(),
                dim: dim.to_string(),
                reverse,
            },
        ))
    }

    /// `out[i] = x[i - offset]` along `dim`, zero where out of range.
    pub fn shift(&self, dim: &str, offset: isize) -> Result<Self> {
        let (_, n, inner) = split_at(self.shape(), dim)?;
        let src = self.read_storage()?;
        let data = (0..src.len())
            .map(|i| {
                let c = ((i / inner) % n) as isize;
                let s = c - offset;
                if s >= 0 && (s as usize) < n {
                    src[(i as isize - offset * inner as isize) as usize]
                } else {
                    0.0
                }
            })
            .collect();
        drop(src);
        Ok(Self::from_op(
            data,
            self.shape().clone(),
            self.dtype(),
            Op::Shift {
                input: self.clone(),
                dim: dim.to_string(),
                offset,
            },
        ))
    }

    /// Take `len` positions of `dim` starting at `start`.
    pub fn slice(&self, dim: &str, start: usize, len: usize) -> Result<Self> {
        let (outer, n, inner) = split_at(self.shape(), dim)?;
        if len == 0 || start + len > n {
            return Err(Error::shape(format!(
                "slice [{start}, {}) out of range for dimension '{dim}' of size {n}",
                start + len
            )));
        }
        let shape = self.shape().resize(dim, len)?;
        let src = self.read_storage()?;
        let mut data = Vec::with_capacity(outer * len * inner);
        for o in 0..outer {
            let begin = (o * n + start) * inner;
            data.extend_from_slice(&src[begin..begin + len * inner]);
        }
        drop(src);
        Ok(Self::from_op(
            data,
            shape,
            self.dtype(),
            Op::Slice {
                input: self.clone(),
                dim: dim.to_string(),
                start,
                len,
            },
        ))
    }

    /// Zero-pad `dim` with `before` and `after` positions.
    pub fn pad(&self, dim: &str, before: usize, after: usize) -> Result<Self> {
        let (outer, n, inner) = split_at(self.shape(), dim)?;
        let new_n = n + before + after;
        let shape = self.shape().resize(dim, new_n)?;
        let src = self.read_storage()?;
        let mut data = vec![0.0; outer * new_n * inner];
        for o in 0..outer {
            let s = o * n * inner;
            let d = (o * new_n + before) * inner;
            data[d..d + n * inner].copy_from_slice(&src[s..s + n * inner]);
        }
        drop(src);
        Ok(Self::from_op(
            data,
            shape,
            self.dtype(),
            Op::Pad {
                input: self.clone(),
                dim: dim.to_string(),
                before,
                after,
            },
        ))
    }

    /// Concatenate along `dim`. All other dimensions must match exactly,
    /// order included.
    pub fn concat(tensors: &[&Tensor], dim: &str) -> Result<Self> {
        let first = tensors
            .first()
            .ok_or_else(|| Error::msg("concat needs at least one tensor"))?;
        let base = first.shape().without(dim)?;
        let mut total = 0usize;
        for t in tensors {
            let rest = t.shape().without(dim)?;
            if rest != base || t.shape().index_of(dim) != first.shape().index_of(dim) {
                return Err(Error::shape(format!(
                    "concat along '{dim}': {} does not match {}",
                    t.shape(),
                    first.shape()
                )));
            }
            total += t.size_of(dim)?;
        }
        let shape = first.shape().resize(dim, total)?;
        let (outer, _, inner) = split_at(&shape, dim)?;
        let dtype = tensors
            .iter()
            .fold(first.dtype(), |acc, t| acc.promote(t.dtype()));
        let mut data = Vec::with_capacity(shape.elem_count());
        let bufs = tensors
            .iter()
            .map(|t| t.to_f64_vec())
            .collect::<Result<Vec<_>>>()?;
        for o in 0..outer {
            for (t, g) in tensors.iter().zip(&bufs) {
                let n = t.size_of(dim)?;
                let s = o * n * inner;
                data.extend(g[s..s + n * inner].iter().map(|&v| dtype.round(v)));
            }
        }
        Ok(Self::from_op(
            data,
            shape,
            dtype,
            Op::Concat {
                inputs: tensors.iter().map(|t| (*t).clone()).collect(),
                dim: dim.to_string(),
            },
        ))
    }

    /// Stack equally shaped tensors along a new trailing dimension.
    pub fn stack(tensors: &[&Tensor], name: &str) -> Result<Self> {
        let expanded = tensors
            .iter()
            .map(|t| {
                let shape = t.shape().concat(&Shape::new(vec![Dim::new(name, 1)])?)?;
                t.reshape(shape)
            })
            .collect::<Result<Vec<_>>>()?;
        let refs: Vec<&Tensor> = expanded.iter().collect();
        Self::concat(&refs, name)
    }

    /// Select rows of `table` along `dim` using the integer values of `ids`.
    ///
    /// The result has the dimensions of `ids` followed by the remaining
    /// dimensions of `table`.
    pub fn gather(table: &Tensor, ids: &Tensor, dim: &str) -> Result<Self> {
        let (outer, n, inner) = split_at(table.shape(), dim)?;
        let rest = table.shape().without(dim)?;
        let shape = ids.shape().concat(&rest)?;
        let idx = ids.to_f64_vec()?;
        let src = table.read_storage()?;
        let rest_count = outer * inner;
        let mut data = Vec::with_capacity(idx.len() * rest_count);
        for &id in &idx {
            if id < 0.0 || id as usize >= n {
                return Err(Error::shape(format!(
                    "gather index {id} out of range for dimension '{dim}' of size {n}"
                )));
            }
            let id = id as usize;
            for o in 0..outer {
                let s = (o * n + id) * inner;
                data.extend_from_slice(&src[s..s + inner]);
            }
        }
        drop(src);
        Ok(Self::from_op(
            data,
            shape,
            table.dtype(),
            Op::Gather {
                table: table.clone(),
                ids: ids.detach(),
                dim: dim.to_string(),
            },
        ))
    }

    /// Round to another dtype. The gradient is cast back.
    pub fn to_dtype(&self, dtype: DType) -> Result<Self> {
        if dtype == self.dtype() {
            return Ok(self.clone());
        }
        let data = self
            .read_storage()?
            .iter()
            .map(|&v| dtype.round(v))
            .collect();
        Ok(Self::from_op(
            data,
            self.shape().clone(),
            dtype,
            Op::Cast {
                input: self.clone(),
                src: self.dtype(),
            },
        ))
    }

    pub(crate) fn from_recompute(
        data: Vec<f64>,
        shape: Shape,
        dtype: DType,
        node: Arc<crate::backprop::RecomputeNode>,
        index: usize,
    ) -> Self {
        Self::from_op(data, shape, dtype, Op::Recompute { node, index })
    }
}

/// Tanh approximation of GELU.
pub(crate) fn gelu(x: f64) -> f64 {
    let c = (2.0 / std::f64::consts::PI).sqrt();
    0.5 * x * (1.0 + (c * (x + 0.044715 * x * x * x)).tanh())
}

/// Derivative of [`gelu`].
pub(crate) fn gelu_grad(x: f64) -> f64 {
    let c = (2.0 / std::f64::consts::PI).sqrt();
    let t = (c * (x + 0.044715 * x * x * x)).tanh();
    0.5 * (1.0 + t) + 0.5 * x * (1.0 - t * t) * c * (1.0 + 3.0 * 0.044715 * x * x)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(data: &[f64], pairs: &[(&str, usize)]) -> Tensor {
        Tensor::new(data.to_vec(), Shape::from_pairs(pairs).unwrap(), DType::F64).unwrap()
    }

    #[test]
    fn test_einsum_contracts_by_name() {
        let a = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[("batch", 2), ("embd", 3)]);
        let w = t(&[1.0, 0.0, 0.0, 1.0, 1.0, 1.0], &[("embd", 3), ("out", 2)]);
        let out = Tensor::einsum(&[&a, &w], &Shape::from_pairs(&[("batch", 2), ("out", 2)]).unwrap())
            .unwrap();
        assert_eq!(out.to_f64_vec().unwrap(), vec![4.0, 5.0, 10.0, 11.0]);

        // Output order is independent of input order.
        let out_t =
            Tensor::einsum(&[&w, &a], &Shape::from_pairs(&[("out", 2), ("batch", 2)]).unwrap())
                .unwrap();
        assert_eq!(out_t.to_f64_vec().unwrap(), vec![4.0, 10.0, 5.0, 11.0]);
    }

    #[test]
    fn test_einsum_size_mismatch() {
        let a = t(&[1.0, 2.0], &[("embd", 2)]);
        let b = t(&[1.0, 2.0, 3.0], &[("embd", 3)]);
        let err = Tensor::einsum(&[&a, &b], &Shape::scalar()).unwrap_err();
        assert!(err.is_shape_error());
    }

    #[test]
    fn test_binary_broadcast_by_name() {
        let x = t(&[1.0, 2.0, 3.0, 4.0], &[("batch", 2), ("embd", 2)]);
        let b = t(&[10.0, 20.0], &[("embd", 2)]);
        let y = x.add(&b).unwrap();
        assert_eq!(y.to_f64_vec().unwrap(), vec![11.0, 22.0, 13.0, 24.0]);
        let c = t(&[100.0, 200.0], &[("batch", 2)]);
        let z = x.add(&c).unwrap();
        assert_eq!(z.to_f64_vec().unwrap(), vec![101.0, 102.0, 203.0, 204.0]);
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let x = t(&[1.0, 2.0, 3.0, 0.0, 0.0, 0.0], &[("batch", 2), ("vocab", 3)]);
        let p = x.softmax("vocab").unwrap();
        let s = p.reduce_sum(&["vocab"]).unwrap().to_f64_vec().unwrap();
        for v in s {
            assert!((v - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_cumsum_and_shift() {
        let x = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[("batch", 2), ("sequence", 3)]);
        assert_eq!(
            x.cumsum("sequence", false).unwrap().to_f64_vec().unwrap(),
            vec![1.0, 3.0, 6.0, 4.0, 9.0, 15.0]
        );
        assert_eq!(
            x.cumsum("sequence", true).unwrap().to_f64_vec().unwrap(),
            vec![6.0, 5.0, 3.0, 15.0, 11.0, 6.0]
        );
        assert_eq!(
            x.shift("sequence", 1).unwrap().to_f64_vec().unwrap(),
            vec![0.0, 1.0, 2.0, 0.0, 4.0, 5.0]
        );
        assert_eq!(
            x.shift("sequence", -1).unwrap().to_f64_vec().unwrap(),
            vec![2.0, 3.0, 0.0, 5.0, 6.0, 0.0]
        );
    }

    #[test]
    fn test_slice_pad_concat() {
        let x = t(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[("batch", 2), ("sequence", 3)]);
        let s = x.slice("sequence", 1, 2).unwrap();
        assert_eq!(s.to_f64_vec().unwrap(), vec![2.0, 3.0, 5.0, 6.0]);
        let p = s.pad("sequence", 1, 0).unwrap();
        assert_eq!(p.to_f64_vec().unwrap(), vec![0.0, 2.0, 3.0, 0.0, 5.0, 6.0]);
        let a = x.slice("sequence", 0, 1).unwrap();
        let c = Tensor::concat(&[&a, &s], "sequence").unwrap();
        assert_eq!(c.to_f64_vec().unwrap(), x.to_f64_vec().unwrap());
        assert!(x.slice("sequence", 2, 2).is_err());
    }

    #[test]
    fn test_gather_and_one_hot() {
        let table = t(&[0.0, 1.0, 10.0, 11.0, 20.0, 21.0], &[("vocab", 3), ("embd", 2)]);
        let ids = t(&[2.0, 0.0], &[("sequence", 2)]);
        let g = Tensor::gather(&table, &ids, "vocab").unwrap();
        assert_eq!(g.shape().names(), vec!["sequence", "embd"]);
        assert_eq!(g.to_f64_vec().unwrap(), vec![20.0, 21.0, 0.0, 1.0]);

        let oh = ids.one_hot(&Dim::new("vocab", 3), 1.0, 0.0, DType::F64).unwrap();
        assert_eq!(oh.to_f64_vec().unwrap(), vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0]);
        let bad = t(&[3.0], &[("sequence", 1)]);
        assert!(Tensor::gather(&table, &bad, "vocab").is_err());
    }

    #[test]
    fn test_argmax_and_rounding() {
        let x = t(&[0.1, 0.7, 0.2, 0.9, 0.0, 0.1], &[("batch", 2), ("vocab", 3)]);
        assert_eq!(x.argmax("vocab").unwrap().to_f64_vec().unwrap(), vec![1.0, 0.0]);
        let h = x.to_dtype(DType::BF16).unwrap();
        assert_eq!(h.dtype(), DType::BF16);
        assert_ne!(h.to_f64_vec().unwrap()[0], 0.1);
    }

    #[test]
    fn test_update_inplace_shared() {
        let v = t(&[1.0, 2.0], &[("embd", 2)]).set_variable();
        let alias = v.clone();
        v.update_data_inplace(&[5.0, 6.0]).unwrap();
        assert_eq!(alias.to_f64_vec().unwrap(), vec![5.0, 6.0]);
        assert!(v.is_variable());
        assert!(!v.detach().requires_grad());
    }
}
