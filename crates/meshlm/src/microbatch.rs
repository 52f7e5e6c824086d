// Microbatch serialization: one training step as a sequence of sub-batches
//
//   for i in 0..count:
//       features_i = features[batch i·m .. (i+1)·m]
//       out_i      = step(i, features_i)
//       grads     += ∇(loss_i / count)           summed in the update dtype
//   loss    = Σ loss_i / count
//   aux     = Σ aux_i / count
//   logits  = concat_i(logits_i)  along batch     (detached)
//
// Since every loss_i is a mean over an equally sized slice, the result
// matches a single pass over the whole batch up to rounding.
//
// DATA-PARALLEL REDUCTION:
//
//   Every variable gradient (and the loss) sums over the data dims batch
//   and sequence. When the layout splits one of them, each replica holds a
//   partial sum and one all-reduce per gradient combines them. It runs once
//   per step, after the microbatches are accumulated.
//
// COUNT FROM A TOKEN BUDGET:
//
//   per_replica = batch size per batch split of the layout
//   count = max(1, per_replica · sequence / tokens_per_mb_per_replica)
//   count is then raised until it divides per_replica.

use meshlm_core::{CommLedger, Dim, Error, GradStore, MeshPlan, Result, Shape, Tensor, Variable};
use meshlm_nn::dims;

use crate::features::Features;
use crate::model::ModelOutput;

/// How a batch is split into microbatches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MicrobatchPlan {
    batch: Dim,
    count: usize,
}

impl MicrobatchPlan {
    pub fn new(batch: Dim, count: usize) -> Result<Self> {
        if count == 0 || batch.size() % count != 0 {
            return Err(Error::config(format!(
                "batch size {} cannot be split into {count} microbatches",
                batch.size()
            )));
        }
        Ok(MicrobatchPlan { batch, count })
    }

    /// Derive the count from a per-replica token budget.
    pub fn from_token_budget(
        batch: Dim,
        sequence_length: usize,
        plan: &MeshPlan,
        tokens_per_mb_per_replica: Option<usize>,
    ) -> Result<Self> {
        let Some(budget) = tokens_per_mb_per_replica.filter(|&b| b > 0) else {
            return Self::new(batch, 1);
        };
        let per_replica = plan.size_per_split(&batch)?;
        let tokens = per_replica * sequence_length;
        let mut count = (tokens / budget).max(1);
        while per_replica % count != 0 {
            count += 1;
        }
        log::debug!(
            "{count} microbatches: {per_replica} examples x {sequence_length} tokens per replica, budget {budget}"
        );
        Self::new(batch, count)
    }

    pub fn batch(&self) -> &Dim {
        &self.batch
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Examples per microbatch.
    pub fn microbatch_size(&self) -> usize {
        self.batch.size() / self.count
    }

    pub fn is_serialized(&self) -> bool {
        self.count > 1
    }
}

/// Output of a (possibly serialized) training step.
pub struct StepGradients {
    /// Gradients in each variable's update dtype, variable order.
    pub grads: Vec<(Variable, Tensor)>,
    /// Detached outputs, merged over microbatches.
    pub output: ModelOutput,
}

/// Gradients of `loss` for `variables`, cast to their update dtype.
/// Variables the loss does not depend on are left out.
pub fn gradients(loss: &Tensor, variables: &[Variable]) -> Result<Vec<(Variable, Tensor)>> {
    let store = loss.backward()?;
    collect(&store, variables)
}

fn collect(store: &GradStore, variables: &[Variable]) -> Result<Vec<(Variable, Tensor)>> {
    let mut out = Vec::with_capacity(variables.len());
    for v in variables {
        match store.get(v.tensor()) {
            Some(g) => out.push((v.clone(), g.to_dtype(v.dtype().update)?)),
            None => log::debug!("no gradient for {}", v.path()),
        }
    }
    Ok(out)
}

/// Record the all-reduces that combine per-replica gradients and the loss
/// over the data dims split by the layout. Returns how many were needed.
pub fn reduce_gradients(
    plan: &MeshPlan,
    ledger: &CommLedger,
    grads: &[(Variable, Tensor)],
    data_dims: &[Dim],
) -> usize {
    let mut count = 0;
    for (var, _) in grads {
        let reduced: Vec<Dim> = data_dims
            .iter()
            .filter(|d| !var.shape().contains(d.name()))
            .cloned()
            .collect();
        if !ledger.record_reduction(plan, &reduced, var.shape()).is_empty() {
            count += 1;
        }
    }
    if !ledger.record_reduction(plan, data_dims, &Shape::scalar()).is_empty() {
        count += 1;
    }
    if count > 0 {
        log::debug!("{count} gradient/loss all-reduce(s) across data shards");
    }
    count
}

fn detach_output(out: &ModelOutput) -> ModelOutput {
    ModelOutput {
        logits: out.logits.detach(),
        loss: out.loss.as_ref().map(Tensor::detach),
        loss_batch: out.loss_batch.as_ref().map(Tensor::detach),
        aux_loss: out.aux_loss.as_ref().map(Tensor::detach),
    }
}

fn require_loss(out: &ModelOutput) -> Result<&Tensor> {
    out.loss
        .as_ref()
        .ok_or_else(|| Error::config("training step without labels: no loss to minimize"))
}

/// Run `step` once per microbatch, accumulating gradients.
///
/// `step` receives the microbatch index and its slice of `features`.
pub fn serialize_training_step<F>(
    plan: &MicrobatchPlan,
    features: &Features,
    variables: &[Variable],
    mut step: F,
) -> Result<StepGradients>
where
    F: FnMut(usize, &Features) -> Result<ModelOutput>,
{
    let batch = features.batch_size()?;
    if batch != plan.batch.size() {
        return Err(Error::DimensionSizeMismatch {
            name: dims::BATCH.to_string(),
            expected: plan.batch.size(),
            got: batch,
        });
    }

    if !plan.is_serialized() {
        let out = step(0, features)?;
        let grads = gradients(require_loss(&out)?, variables)?;
        return Ok(StepGradients {
            grads,
            output: detach_output(&out),
        });
    }

    let n = plan.count;
    let scale = 1.0 / n as f64;
    let m = plan.microbatch_size();
    let mut sums: Vec<Option<Tensor>> = vec![None; variables.len()];
    let mut outputs = Vec::with_capacity(n);

    for i in 0..n {
        let slice = features.slice_batch(i * m, m)?;
        let out = step(i, &slice)?;
        let store = require_loss(&out)?.affine(scale, 0.0)?.backward()?;
        for (sum, v) in sums.iter_mut().zip(variables) {
            let Some(g) = store.get(v.tensor()) else {
                continue;
            };
            let g = g.to_dtype(v.dtype().update)?;
            *sum = Some(match sum.take() {
                Some(acc) => acc.add(&g)?,
                None => g,
            });
        }
        outputs.push(detach_output(&out));
        log::debug!("microbatch {}/{n} done", i + 1);
    }

    let grads = variables
        .iter()
        .zip(sums)
        .filter_map(|(v, g)| g.map(|g| (v.clone(), g)))
        .collect();

    let logits: Vec<&Tensor> = outputs.iter().map(|o| &o.logits).collect();
    let logits = Tensor::concat(&logits, dims::BATCH)?;
    let loss_batch = outputs
        .iter()
        .map(|o| o.loss_batch.as_ref())
        .collect::<Option<Vec<_>>>()
        .map(|parts| Tensor::concat(&parts, dims::BATCH))
        .transpose()?;
    let loss = mean_of(outputs.iter().filter_map(|o| o.loss.as_ref()), n)?;
    let aux_loss = mean_of(outputs.iter().filter_map(|o| o.aux_loss.as_ref()), n)?;

    Ok(StepGradients {
        grads,
        output: ModelOutput {
            logits,
            loss,
            loss_batch,
            aux_loss,
        },
    })
}

/// `Σ parts / n`, or `None` when there are no parts.
fn mean_of<'a>(parts: impl Iterator<Item = &'a Tensor>, n: usize) -> Result<Option<Tensor>> {
    let mut total: Option<Tensor> = None;
    for p in parts {
        total = Some(match total {
            Some(t) => t.add(p)?,
            None => p.clone(),
        });
    }
    total.map(|t| t.affine(1.0 / n as f64, 0.0)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshlm_core::{DType, Init, LayoutRules, MeshShape, VarStore, VariableDType};
    use proptest::prelude::*;

    fn batch(n: usize) -> Dim {
        Dim::new("batch", n)
    }

    #[test]
    fn test_indivisible_count_is_config_error() {
        assert!(MicrobatchPlan::new(batch(6), 4).unwrap_err().is_config_error());
        assert!(MicrobatchPlan::new(batch(6), 0).unwrap_err().is_config_error());
        let plan = MicrobatchPlan::new(batch(8), 4).unwrap();
        assert_eq!(plan.microbatch_size(), 2);
        assert!(plan.is_serialized());
    }

    #[test]
    fn test_token_budget() {
        let single = MeshPlan::single_device();
        // 8 examples x 16 tokens, 32 tokens per microbatch: 4 microbatches.
        let plan = MicrobatchPlan::from_token_budget(batch(8), 16, &single, Some(32)).unwrap();
        assert_eq!(plan.count(), 4);
        // 6 examples x 10 tokens / 15 = 4, raised to 6 to divide the batch.
        let plan = MicrobatchPlan::from_token_budget(batch(6), 10, &single, Some(15)).unwrap();
        assert_eq!(plan.count(), 6);
        let plan = MicrobatchPlan::from_token_budget(batch(8), 16, &single, None).unwrap();
        assert_eq!(plan.count(), 1);

        // Batch split over 2 devices: 4 examples per replica.
        let sharded = MeshPlan::new(
            MeshShape::parse("x:2").unwrap(),
            LayoutRules::parse("batch:x").unwrap(),
        )
        .unwrap();
        let plan = MicrobatchPlan::from_token_budget(batch(8), 16, &sharded, Some(32)).unwrap();
        assert_eq!(plan.count(), 2);
    }

    #[test]
    fn test_gradients_reduced_over_split_batch() {
        let mut vs = VarStore::new(VariableDType::uniform(DType::F64), 0);
        let w = vs
            .root()
            .get("w", Shape::from_pairs(&[("embd", 4)]).unwrap(), Init::Ones)
            .unwrap();
        let grads = vec![(w.clone(), w.tensor().clone())];
        let data = [batch(8), Dim::new("sequence", 16)];

        let sharded = MeshPlan::new(
            MeshShape::parse("x:2").unwrap(),
            LayoutRules::parse("batch:x").unwrap(),
        )
        .unwrap();
        let ledger = CommLedger::new();
        // One for the gradient, one for the loss.
        assert_eq!(reduce_gradients(&sharded, &ledger, &grads, &data), 2);
        assert_eq!(ledger.stats().allreduces, 2);
        assert_eq!(ledger.stats().elements, 4 + 1);

        let ledger = CommLedger::new();
        assert_eq!(reduce_gradients(&MeshPlan::single_device(), &ledger, &grads, &data), 0);
        assert_eq!(ledger.stats().allreduces, 0);
    }

    #[test]
    fn test_losses_summed_then_divided() {
        let mut vs = VarStore::new(VariableDType::uniform(DType::F64), 0);
        let w = vs.root().get("w", Shape::scalar(), Init::Ones).unwrap();
        let ids: Vec<i64> = (0..8).collect();
        let features =
            Features::language_model(crate::features::token_tensor(&ids, 4, 2).unwrap(), None);
        let plan = MicrobatchPlan::new(batch(4), 2).unwrap();

        // Microbatch i has loss (i + 1)·w and aux loss 10·(i + 1).
        let step = serialize_training_step(&plan, &features, &[w.clone()], |i, f| {
            let m = f.batch_size()?;
            let scale = (i + 1) as f64;
            let per_example = Tensor::ones(Shape::from_pairs(&[("batch", m)])?, DType::F64)
                .mul(&w.value()?)?
                .affine(scale, 0.0)?;
            Ok(ModelOutput {
                logits: Tensor::zeros(Shape::from_pairs(&[("batch", m), ("vocab", 3)])?, DType::F64),
                loss: Some(per_example.mean_all()?),
                loss_batch: Some(per_example),
                aux_loss: Some(Tensor::scalar(10.0 * scale, DType::F64)),
            })
        })
        .unwrap();

        let out = step.output;
        assert_eq!(out.aux_loss.unwrap().to_scalar_f64().unwrap(), 15.0);
        assert_eq!(out.loss.unwrap().to_scalar_f64().unwrap(), 1.5);
        assert_eq!(out.loss_batch.unwrap().to_f64_vec().unwrap(), vec![1.0, 1.0, 2.0, 2.0]);
        assert_eq!(out.logits.size_of("batch").unwrap(), 4);
        assert_eq!(step.grads.len(), 1);
        assert_eq!(step.grads[0].1.to_scalar_f64().unwrap(), 1.5);
    }

    proptest! {
        #[test]
        fn prop_plan_exists_iff_count_divides_batch(size in 1usize..64, count in 1usize..16) {
            let plan = MicrobatchPlan::new(batch(size), count);
            prop_assert_eq!(plan.is_ok(), size % count == 0);
            if let Ok(p) = plan {
                prop_assert_eq!(p.microbatch_size() * p.count(), size);
            }
        }
    }
}
