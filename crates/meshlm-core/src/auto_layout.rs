// Auto-layout: propose a layout (and optionally a mesh) for a built graph
//
// The search works on a GraphTrace, the list of ops of an already built
// forward graph with their input and output shapes. A candidate layout is
// scored by an estimate of what one training step would cost per device:
//
//   communication   every contraction over a split dimension, forward and
//                   backward, all-reduces its per-device result
//   memory          per-device elements of every traced activation and
//                   variable
//
// Starting from full replication, the search greedily adds the single
// dim → axis assignment that lowers the cost the most, until nothing helps.
// Every accepted candidate must pass MeshPlan::validate for every traced
// shape, so the result is always a legal layout. It is a heuristic: cheaper
// layouts may exist.

use std::collections::{BTreeMap, HashSet};

use crate::backprop::build_topo;
use crate::error::{Error, Result};
use crate::mesh::{LayoutRules, MeshAxis, MeshPlan, MeshShape};
use crate::op::Op;
use crate::shape::Shape;
use crate::tensor::Tensor;

/// Relative cost of one all-reduced element against one resident element.
const COMM_WEIGHT: f64 = 4.0;
const MEMORY_WEIGHT: f64 = 1.0;

/// One traced op.
#[derive(Debug, Clone)]
pub struct TraceOp {
    pub kind: &'static str,
    pub inputs: Vec<Shape>,
    pub output: Shape,
}

/// Shapes of a built graph, as seen by the layout search.
#[derive(Debug, Clone, Default)]
pub struct GraphTrace {
    ops: Vec<TraceOp>,
    variables: Vec<Shape>,
}

impl GraphTrace {
    /// Walk the tape below `outputs`.
    pub fn from_outputs(outputs: &[&Tensor]) -> Self {
        let mut seen = HashSet::new();
        let mut trace = GraphTrace::default();
        for out in outputs {
            for t in build_topo(out) {
                if !seen.insert(t.id()) {
                    continue;
                }
                match t.op() {
                    Op::None => {
                        if t.is_variable() {
                            trace.variables.push(t.shape().clone());
                        }
                    }
                    op => trace.ops.push(TraceOp {
                        kind: op.kind(),
                        inputs: op.inputs().iter().map(|i| i.shape().clone()).collect(),
                        output: t.shape().clone(),
                    }),
                }
            }
        }
        trace
    }

    pub fn ops(&self) -> &[TraceOp] {
        &self.ops
    }

    pub fn variables(&self) -> &[Shape] {
        &self.variables
    }

    /// Every shape in the trace.
    pub fn shapes(&self) -> impl Iterator<Item = &Shape> {
        self.ops
            .iter()
            .flat_map(|op| op.inputs.iter().chain(std::iter::once(&op.output)))
            .chain(self.variables.iter())
    }

    /// Dimension names and sizes. The same name may carry several sizes
    /// (e.g. after slicing); all of them are kept.
    pub fn dims(&self) -> BTreeMap<String, Vec<usize>> {
        let mut out: BTreeMap<String, Vec<usize>> = BTreeMap::new();
        for s in self.shapes() {
            for d in s.dims() {
                let sizes = out.entry(d.name().to_string()).or_default();
                if !sizes.contains(&d.size()) {
                    sizes.push(d.size());
                }
            }
        }
        out
    }
}

/// Result of a layout search.
#[derive(Debug, Clone)]
pub struct LayoutProposal {
    pub mesh: MeshShape,
    pub layout: LayoutRules,
    pub cost: f64,
}

/// Estimated per-device cost of running `trace` under `plan`.
pub fn estimate_cost(trace: &GraphTrace, plan: &MeshPlan) -> Result<f64> {
    let mut comm = 0.0;
    let mut memory = 0.0;
    let per_device = |s: &Shape| -> Result<f64> { Ok(plan.slice_shape(s)?.elem_count() as f64) };

    for op in trace.ops() {
        memory += per_device(&op.output)?;
        if op.kind != "einsum" {
            continue;
        }
        let inputs: Vec<&Shape> = op.inputs.iter().collect();
        if !plan
            .reduction_axes(&MeshPlan::reduced_dims(&inputs, &op.output))
            .is_empty()
        {
            comm += per_device(&op.output)?;
        }
        // Backward: the gradient of input i contracts the output and the
        // other inputs down to shape i.
        for (i, target) in op.inputs.iter().enumerate() {
            let mut operands: Vec<&Shape> = vec![&op.output];
            operands.extend(op.inputs.iter().enumerate().filter(|(j, _)| *j != i).map(|(_, s)| s));
            if !plan
                .reduction_axes(&MeshPlan::reduced_dims(&operands, target))
                .is_empty()
            {
                comm += per_device(target)?;
            }
        }
    }
    for v in trace.variables() {
        memory += per_device(v)?;
    }
    Ok(COMM_WEIGHT * comm + MEMORY_WEIGHT * memory)
}

fn is_valid(trace: &GraphTrace, plan: &MeshPlan) -> bool {
    trace.shapes().all(|s| plan.validate(s).is_ok())
}

/// Greedy layout search for a fixed mesh.
pub fn propose_layout(trace: &GraphTrace, mesh: &MeshShape) -> Result<LayoutProposal> {
    let dims: Vec<String> = trace.dims().into_keys().collect();
    let mut layout = LayoutRules::new();
    let mut cost = estimate_cost(trace, &MeshPlan::new(mesh.clone(), layout.clone())?)?;

    loop {
        let mut best: Option<(LayoutRules, f64)> = None;
        for dim in &dims {
            if layout.axis_for(dim).is_some() {
                continue;
            }
            for axis in mesh.axes().iter().filter(|a| a.size() > 1) {
                let mut candidate = layout.clone();
                candidate.insert(dim, axis.name())?;
                let plan = MeshPlan::new(mesh.clone(), candidate.clone())?;
                if !is_valid(trace, &plan) {
                    continue;
                }
                let c = estimate_cost(trace, &plan)?;
                if c < best.as_ref().map_or(cost, |(_, b)| *b) {
                    best = Some((candidate, c));
                }
            }
        }
        match best {
            Some((l, c)) => {
                log::debug!("auto-layout: {l} (cost {c:.1})");
                layout = l;
                cost = c;
            }
            None => break,
        }
    }

    let plan = MeshPlan::new(mesh.clone(), layout.clone())?;
    for s in trace.shapes() {
        plan.validate(s)?;
    }
    Ok(LayoutProposal {
        mesh: mesh.clone(),
        layout,
        cost,
    })
}

/// Ordered factorizations of `n` into at most `max_parts` factors ≥ 2,
/// factors non-increasing.
fn factorizations(n: usize, max_parts: usize, max_factor: usize) -> Vec<Vec<usize>> {
    if n == 1 {
        return vec![vec![]];
    }
    if max_parts == 0 {
        return vec![];
    }
    let mut out = Vec::new();
    for f in (2..=max_factor.min(n)).rev() {
        if n % f != 0 {
            continue;
        }
        for mut rest in factorizations(n / f, max_parts - 1, f) {
            rest.insert(0, f);
            out.push(rest);
        }
    }
    out
}

/// Search mesh shapes of `num_cores` devices with up to `max_mesh_dims`
/// axes, and a layout for each; return the cheapest.
pub fn propose_layout_and_mesh(
    trace: &GraphTrace,
    num_cores: usize,
    max_mesh_dims: usize,
) -> Result<LayoutProposal> {
    if num_cores == 0 {
        return Err(Error::config("num_cores must be positive"));
    }
    let mut best: Option<LayoutProposal> = None;
    for factors in factorizations(num_cores, max_mesh_dims.max(1), num_cores) {
        let axes = factors
            .iter()
            .enumerate()
            .map(|(i, &f)| MeshAxis::new(format!("mesh_{i}"), f))
            .collect::<Result<Vec<_>>>()?;
        let mesh = MeshShape::new(axes)?;
        let proposal = propose_layout(trace, &mesh)?;
        if best.as_ref().map_or(true, |b| proposal.cost < b.cost) {
            best = Some(proposal);
        }
    }
    best.ok_or_else(|| Error::config(format!("no mesh shape found for {num_cores} cores")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(inputs: &[&[(&str, usize)]], out: &[(&str, usize)]) -> TraceOp {
        TraceOp {
            kind: "einsum",
            inputs: inputs.iter().map(|p| Shape::from_pairs(p).unwrap()).collect(),
            output: Shape::from_pairs(out).unwrap(),
        }
    }

    fn toy_trace() -> GraphTrace {
        // x[batch, embd] · w[embd, hidden] → h[batch, hidden]
        GraphTrace {
            ops: vec![op(
                &[&[("batch", 64), ("embd", 6)], &[("embd", 6), ("hidden", 6)]],
                &[("batch", 64), ("hidden", 6)],
            )],
            variables: vec![Shape::from_pairs(&[("embd", 6), ("hidden", 6)]).unwrap()],
        }
    }

    #[test]
    fn test_factorizations() {
        let mut f = factorizations(8, 4, 8);
        f.sort();
        assert_eq!(f, vec![vec![2, 2, 2], vec![4, 2], vec![8]]);
        assert_eq!(factorizations(8, 1, 8), vec![vec![8]]);
    }

    #[test]
    fn test_proposal_is_valid_and_splits_batch() {
        let trace = toy_trace();
        let mesh = MeshShape::parse("x:4").unwrap();
        let p = propose_layout(&trace, &mesh).unwrap();
        assert_eq!(p.layout.axis_for("batch"), Some("x"));
        // embd and hidden are not divisible by 4.
        assert_eq!(p.layout.axis_for("embd"), None);
        let plan = MeshPlan::new(mesh, p.layout).unwrap();
        for s in trace.shapes() {
            plan.validate(s).unwrap();
        }
    }

    #[test]
    fn test_layout_and_mesh_search() {
        let trace = toy_trace();
        let p = propose_layout_and_mesh(&trace, 4, 2).unwrap();
        assert_eq!(p.mesh.size(), 4);
        assert!(p.mesh.axes().len() <= 2);
        let replicated =
            estimate_cost(&trace, &MeshPlan::new(p.mesh.clone(), LayoutRules::new()).unwrap())
                .unwrap();
        assert!(p.cost <= replicated);
    }
}
