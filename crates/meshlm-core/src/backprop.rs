// Backpropagation: reverse-mode automatic differentiation
//
// backward() computes the gradient of a scalar with respect to every tensor
// of the graph that requires one.
//
// HOW IT WORKS:
//
//   1. Forward pass: every op records its inputs (see op.rs).
//   2. backward() sorts the DAG topologically from the root to the leaves.
//   3. Starting with grad(root) = 1 it walks the graph in reverse order and
//      applies the chain rule at each node, accumulating contributions.
//
// GRADIENT RULES (named dimensions make most of them einsums):
//
//   Einsum:  grad_i = einsum([grad_out, inputs except i], shape_i)
//   Binary:  grad_a = sum_to(grad_out * d/da, shape_a)   (and b alike)
//   Reshape: grad_in = reshape(grad_out, src_shape)
//   Cumsum:  grad_in = cumsum(grad_out, reversed direction)
//   Shift:   grad_in = shift(grad_out, -offset)
//   Slice:   grad_in = pad(grad_out) back to the source extent
//   Pad:     grad_in = slice(grad_out) of the unpadded region
//   Concat:  grad_k = slice of grad_out for operand k
//   Gather:  grad_table = scatter-add of grad_out rows at ids
//   Cast:    grad_in = cast(grad_out, source dtype)
//
// ACCUMULATION: a tensor used by several ops receives the SUM of all
// contributions (multivariate chain rule).
//
// GRADIENT CHECKPOINTING:
//
//   checkpoint() runs a segment on detached copies of its inputs and keeps
//   only the outputs. During backward the segment is run again to rebuild
//   its internal tape, and the gradients found for the inputs and for any
//   variable captured by the segment are merged into the outer store. The
//   segment must be deterministic (dropout masks derive from fixed seeds).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::op::{BinaryOp, Op, TensorId, UnaryOp};
use crate::shape::Shape;
use crate::tensor::{gelu_grad, Tensor};

/// Stores gradients for all tensors in a computation graph.
///
/// After calling `tensor.backward()`, use `grads.get(&tensor)` to retrieve
/// the gradient of any tensor that contributed to it.
#[derive(Clone, Default)]
pub struct GradStore {
    grads: HashMap<TensorId, Tensor>,
}

impl GradStore {
    pub fn new() -> Self {
        GradStore {
            grads: HashMap::new(),
        }
    }

    /// Get the gradient of a tensor (if it exists).
    pub fn get(&self, tensor: &Tensor) -> Option<&Tensor> {
        self.grads.get(&tensor.id())
    }

    pub fn get_by_id(&self, id: &TensorId) -> Option<&Tensor> {
        self.grads.get(id)
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    /// Accumulate gradient for a tensor.
    /// If a gradient already exists for this tensor, add the new one to it.
    pub fn accumulate(&mut self, id: TensorId, grad: Tensor) -> Result<()> {
        let grad = grad.detach();
        if let Some(existing) = self.grads.get(&id) {
            let sum = existing.add(&grad)?.transpose_to(existing.shape())?;
            self.grads.insert(id, sum);
        } else {
            self.grads.insert(id, grad);
        }
        Ok(())
    }

    /// Insert or replace a gradient.
    pub fn insert(&mut self, id: TensorId, grad: Tensor) {
        self.grads.insert(id, grad.detach());
    }

    pub fn remove(&mut self, id: &TensorId) -> Option<Tensor> {
        self.grads.remove(id)
    }
}

/// Topological ordering of the graph below `root`, leaves first.
///
/// Iterative depth-first search, so deep graphs do not exhaust the stack.
pub fn build_topo(root: &Tensor) -> Vec<Tensor> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    let mut stack: Vec<(Tensor, bool)> = vec![(root.clone(), false)];
    while let Some((t, expanded)) = stack.pop() {
        if expanded {
            order.push(t);
            continue;
        }
        if !visited.insert(t.id()) {
            continue;
        }
        stack.push((t.clone(), true));
        for input in t.op().inputs() {
            if !visited.contains(&input.id()) {
                stack.push((input.clone(), false));
            }
        }
    }
    order
}

/// Compute gradients of `root` with respect to all tensors in the graph.
///
/// `root` must be a scalar tensor (single element).
pub fn backward(root: &Tensor) -> Result<GradStore> {
    if root.elem_count() != 1 {
        return Err(Error::msg(
            "backward() requires a scalar tensor (single element). \
             Use .sum_all() or .mean_all() to reduce to a scalar first.",
        ));
    }
    let seed = Tensor::ones(root.shape().clone(), root.dtype());
    backward_with_grad(root, &seed)
}

/// Backpropagate an explicit upstream gradient `seed` (shaped like `root`).
pub fn backward_with_grad(root: &Tensor, seed: &Tensor) -> Result<GradStore> {
    let topo = build_topo(root);
    let mut grads = GradStore::new();
    grads.insert(root.id(), seed.transpose_to(root.shape())?);

    for tensor in topo.iter().rev() {
        let grad_output = match grads.get_by_id(&tensor.id()) {
            Some(g) => g.clone(),
            None => continue,
        };

        match tensor.op() {
            Op::None => {}

            Op::Binary { lhs, rhs, op } => {
                compute_binary_grad(*op, &grad_output, lhs, rhs, &mut grads)?;
            }

            Op::Unary { input, op } => {
                compute_unary_grad(*op, &grad_output, input, tensor, &mut grads)?;
            }

            Op::Affine { input, mul, .. } => {
                grads.accumulate(input.id(), grad_output.affine(*mul, 0.0)?)?;
            }

            Op::Einsum { inputs } => {
                for (i, input) in inputs.iter().enumerate() {
                    if !input.requires_grad() {
                        continue;
                    }
                    let mut operands: Vec<&Tensor> = vec![&grad_output];
                    operands.extend(
                        inputs
                            .iter()
                            .enumerate()
                            .filter(|(j, _)| *j != i)
                            .map(|(_, t)| t),
                    );
                    let g = Tensor::einsum(&operands, input.shape())?;
                    grads.accumulate(input.id(), g)?;
                }
            }

            Op::Reshape { input, src_shape } => {
                grads.accumulate(input.id(), grad_output.reshape(src_shape.clone())?)?;
            }

            Op::Cumsum {
                input,
                dim,
                reverse,
            } => {
                grads.accumulate(input.id(), grad_output.cumsum(dim, !reverse)?)?;
            }

            Op::Shift { input, dim, offset } => {
                grads.accumulate(input.id(), grad_output.shift(dim, -offset)?)?;
            }

            Op::Slice {
                input,
                dim,
                start,
                len,
            } => {
                let size = input.size_of(dim)?;
                let g = grad_output.pad(dim, *start, size - start - len)?;
                grads.accumulate(input.id(), g)?;
            }

            Op::Pad {
                input, dim, before, ..
            } => {
                let size = input.size_of(dim)?;
                grads.accumulate(input.id(), grad_output.slice(dim, *before, size)?)?;
            }

            Op::Concat { inputs, dim } => {
                let mut offset = 0;
                for input in inputs {
                    let n = input.size_of(dim)?;
                    if input.requires_grad() {
                        grads.accumulate(input.id(), grad_output.slice(dim, offset, n)?)?;
                    }
                    offset += n;
                }
            }

            Op::Gather { table, ids, dim } => {
                let g = scatter_add(&grad_output, table.shape(), ids, dim)?;
                grads.accumulate(table.id(), g)?;
            }

            Op::Cast { input, src } => {
                grads.accumulate(input.id(), grad_output.to_dtype(*src)?)?;
            }

            Op::Recompute { node, index } => {
                node.backward(*index, &grad_output, &mut grads)?;
            }
        }
    }

    Ok(grads)
}

fn compute_binary_grad(
    op: BinaryOp,
    grad: &Tensor,
    lhs: &Tensor,
    rhs: &Tensor,
    grads: &mut GradStore,
) -> Result<()> {
    match op {
        BinaryOp::Add => {
            if lhs.requires_grad() {
                grads.accumulate(lhs.id(), grad.sum_to(lhs.shape())?)?;
            }
            if rhs.requires_grad() {
                grads.accumulate(rhs.id(), grad.sum_to(rhs.shape())?)?;
            }
        }
        BinaryOp::Sub => {
            if lhs.requires_grad() {
                grads.accumulate(lhs.id(), grad.sum_to(lhs.shape())?)?;
            }
            if rhs.requires_grad() {
                grads.accumulate(rhs.id(), grad.sum_to(rhs.shape())?.neg()?)?;
            }
        }
        BinaryOp::Mul => {
            if lhs.requires_grad() {
                grads.accumulate(lhs.id(), Tensor::einsum(&[grad, &rhs.detach()], lhs.shape())?)?;
            }
            if rhs.requires_grad() {
                grads.accumulate(rhs.id(), Tensor::einsum(&[grad, &lhs.detach()], rhs.shape())?)?;
            }
        }
        BinaryOp::Div => {
            let inv = rhs.map_const(|b| 1.0 / b)?;
            if lhs.requires_grad() {
                grads.accumulate(lhs.id(), Tensor::einsum(&[grad, &inv], lhs.shape())?)?;
            }
            if rhs.requires_grad() {
                // d(a/b)/db = -a / b^2
                let inv_sq = rhs.map_const(|b| -1.0 / (b * b))?;
                let g = Tensor::einsum(&[grad, &lhs.detach(), &inv_sq], rhs.shape())?;
                grads.accumulate(rhs.id(), g)?;
            }
        }
    }
    Ok(())
}

fn compute_unary_grad(
    op: UnaryOp,
    grad: &Tensor,
    input: &Tensor,
    output: &Tensor,
    grads: &mut GradStore,
) -> Result<()> {
    let local = match op {
        UnaryOp::Neg => {
            grads.accumulate(input.id(), grad.neg()?)?;
            return Ok(());
        }
        UnaryOp::Exp => output.detach(),
        UnaryOp::Log => input.map_const(|x| 1.0 / x)?,
        UnaryOp::Sqrt => output.map_const(|y| 0.5 / y)?,
        UnaryOp::Rsqrt => output.map_const(|y| -0.5 * y * y * y)?,
        UnaryOp::Square => input.map_const(|x| 2.0 * x)?,
        UnaryOp::Gelu => input.map_const(gelu_grad)?,
        UnaryOp::Relu => input.map_const(|x| if x > 0.0 { 1.0 } else { 0.0 })?,
        UnaryOp::Tanh => output.map_const(|y| 1.0 - y * y)?,
    };
    grads.accumulate(input.id(), grad.mul(&local)?)?;
    Ok(())
}

/// Scatter-add the rows of `grad` back into a zero tensor shaped `table`.
fn scatter_add(grad: &Tensor, table: &Shape, ids: &Tensor, dim: &str) -> Result<Tensor> {
    let idx = table.index_of(dim).ok_or_else(|| Error::DimensionNotFound {
        name: dim.to_string(),
        shape: table.clone(),
    })?;
    let sizes = table.sizes();
    let outer: usize = sizes[..idx].iter().product();
    let n = sizes[idx];
    let inner: usize = sizes[idx + 1..].iter().product();

    // The gradient must be laid out as ids ++ table-without-dim.
    let expected = ids.shape().concat(&table.without(dim)?)?;
    let g = grad.to_f64_vec_in(&expected)?;
    let ids = ids.to_f64_vec()?;
    let mut out = vec![0.0; table.elem_count()];
    let rest = outer * inner;
    for (m, &id) in ids.iter().enumerate() {
        let id = id as usize;
        for o in 0..outer {
            for q in 0..inner {
                out[(o * n + id) * inner + q] += g[m * rest + o * inner + q];
            }
        }
    }
    Tensor::new(out, table.clone(), grad.dtype())
}

// Gradient checkpointing

type SegmentFn = dyn Fn(&[Tensor]) -> Result<Vec<Tensor>> + Send + Sync;

/// A recomputable segment: its inputs and the closure that produced its
/// outputs.
pub struct RecomputeNode {
    inputs: Vec<Tensor>,
    func: Arc<SegmentFn>,
}

impl RecomputeNode {
    pub fn inputs(&self) -> &[Tensor] {
        &self.inputs
    }

    fn backward(&self, index: usize, grad: &Tensor, grads: &mut GradStore) -> Result<()> {
        let leaves: Vec<Tensor> = self
            .inputs
            .iter()
            .map(|t| {
                if t.requires_grad() {
                    t.detach().set_variable()
                } else {
                    t.detach()
                }
            })
            .collect();
        let outputs = (self.func)(&leaves)?;
        let out = outputs.get(index).ok_or_else(|| {
            Error::msg(format!("recomputed segment lost output {index}"))
        })?;
        if !out.requires_grad() {
            return Ok(());
        }
        let inner = backward_with_grad(out, grad)?;

        let leaf_ids: HashMap<TensorId, TensorId> = leaves
            .iter()
            .zip(&self.inputs)
            .map(|(l, i)| (l.id(), i.id()))
            .collect();
        for t in build_topo(out) {
            let Some(g) = inner.get(&t) else { continue };
            if let Some(outer_id) = leaf_ids.get(&t.id()) {
                grads.accumulate(*outer_id, g.clone())?;
            } else if t.is_variable() {
                grads.accumulate(t.id(), g.clone())?;
            }
        }
        Ok(())
    }
}

/// Run `func` with gradient checkpointing.
///
/// The forward pass runs once on detached copies of `inputs`, so none of the
/// segment's intermediate tensors are kept alive by the outputs. Backward
/// reruns `func` to rebuild them.
pub fn checkpoint<F>(inputs: &[Tensor], func: F) -> Result<Vec<Tensor>>
where
    F: Fn(&[Tensor]) -> Result<Vec<Tensor>> + Send + Sync + 'static,
{
    let detached: Vec<Tensor> = inputs.iter().map(|t| t.detach()).collect();
    let outputs = func(&detached)?;
    let node = Arc::new(RecomputeNode {
        inputs: inputs.to_vec(),
        func: Arc::new(func),
    });
    outputs
        .iter()
        .enumerate()
        .map(|(i, o)| {
            Ok(Tensor::from_recompute(
                o.to_f64_vec()?,
                o.shape().clone(),
                o.dtype(),
                Arc::clone(&node),
                i,
            ))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;

    fn var(data: &[f64], pairs: &[(&str, usize)]) -> Tensor {
        Tensor::new(data.to_vec(), Shape::from_pairs(pairs).unwrap(), DType::F64)
            .unwrap()
            .set_variable()
    }

    fn grad_vec(g: &GradStore, t: &Tensor) -> Vec<f64> {
        g.get(t).unwrap().to_f64_vec().unwrap()
    }

    #[test]
    fn test_einsum_grad() {
        let a = var(&[1.0, 2.0, 3.0, 4.0], &[("batch", 2), ("embd", 2)]);
        let w = var(&[0.5, -1.0], &[("embd", 2)]);
        let y = Tensor::einsum(&[&a, &w], &Shape::from_pairs(&[("batch", 2)]).unwrap()).unwrap();
        let loss = y.sum_all().unwrap();
        let g = loss.backward().unwrap();
        assert_eq!(grad_vec(&g, &w), vec![4.0, 6.0]);
        assert_eq!(grad_vec(&g, &a), vec![0.5, -1.0, 0.5, -1.0]);
    }

    #[test]
    fn test_shared_use_accumulates() {
        let a = var(&[3.0], &[("x", 1)]);
        let y = a.mul(&a).unwrap().sum_all().unwrap();
        let g = y.backward().unwrap();
        assert_eq!(grad_vec(&g, &a), vec![6.0]);
    }

    #[test]
    fn test_softmax_grad_sums_to_zero() {
        let x = var(&[0.1, 0.5, -0.3], &[("vocab", 3)]);
        let w = Tensor::new(vec![1.0, 2.0, 3.0], x.shape().clone(), DType::F64).unwrap();
        let loss = x.softmax("vocab").unwrap().mul(&w).unwrap().sum_all().unwrap();
        let g = grad_vec(&loss.backward().unwrap(), &x);
        assert!(g.iter().sum::<f64>().abs() < 1e-12);
    }

    #[test]
    fn test_gather_scatter_grad() {
        let table = var(&[0.0; 6], &[("vocab", 3), ("embd", 2)]);
        let ids = Tensor::new(
            vec![1.0, 1.0, 2.0],
            Shape::from_pairs(&[("sequence", 3)]).unwrap(),
            DType::I64,
        )
        .unwrap();
        let loss = Tensor::gather(&table, &ids, "vocab").unwrap().sum_all().unwrap();
        let g = grad_vec(&loss.backward().unwrap(), &table);
        assert_eq!(g, vec![0.0, 0.0, 2.0, 2.0, 1.0, 1.0]);
    }

    #[test]
    fn test_cumsum_shift_grad() {
        let x = var(&[1.0, 2.0, 3.0], &[("sequence", 3)]);
        let w = Tensor::new(vec![1.0, 10.0, 100.0], x.shape().clone(), DType::F64).unwrap();
        let loss = x.cumsum("sequence", false).unwrap().mul(&w).unwrap().sum_all().unwrap();
        assert_eq!(grad_vec(&loss.backward().unwrap(), &x), vec![111.0, 110.0, 100.0]);

        let loss = x.shift("sequence", 1).unwrap().mul(&w).unwrap().sum_all().unwrap();
        assert_eq!(grad_vec(&loss.backward().unwrap(), &x), vec![10.0, 100.0, 0.0]);
    }

    #[test]
    fn test_checkpoint_matches_direct() {
        let x = var(&[0.3, -0.7, 1.1, 0.2], &[("batch", 2), ("embd", 2)]);
        let w = var(&[0.5, -0.25, 0.75, 1.5], &[("embd", 2), ("hidden", 2)]);
        let out_shape = Shape::from_pairs(&[("batch", 2), ("hidden", 2)]).unwrap();

        let direct = Tensor::einsum(&[&x, &w], &out_shape).unwrap().gelu().unwrap();
        let gd = direct.sum_all().unwrap().backward().unwrap();

        let w2 = w.clone();
        let s2 = out_shape.clone();
        let outs = checkpoint(&[x.clone()], move |ins| {
            Ok(vec![Tensor::einsum(&[&ins[0], &w2], &s2)?.gelu()?])
        })
        .unwrap();
        assert_eq!(outs[0].to_f64_vec().unwrap(), direct.to_f64_vec().unwrap());
        let gc = outs[0].sum_all().unwrap().backward().unwrap();

        for t in [&x, &w] {
            let a = grad_vec(&gd, t);
            let b = grad_vec(&gc, t);
            for (u, v) in a.iter().zip(&b) {
                assert!((u - v).abs() < 1e-12);
            }
        }
    }
}
