// Estimator: the training step controller
//
// Owns the variable store, the compiled model, the mesh plan, the optimizer
// and the checkpoint hooks, and runs one step per call:
//
//   (once)    restore hooks, before anything reads a variable
//   TRAIN     forward (direct or per microbatch) → gradients → all-reduce
//             accounting over split data dims → optimizer
//             → every update validated → all applied → global_step + 1
//             → after_update hooks
//   EVAL      forward → loss, token accuracy, perplexity, mean logits
//   PREDICT   forward → argmax tokens and softmax probabilities
//
// Every mode runs the same GptModel::forward. A step takes `&mut self`, so
// exactly one step touches the variables at a time, and updates are only
// written once all of them exist and passed validation.
//
// AUTO-LAYOUT
//
// `propose_layout` is a separate analysis: it builds the graph once on a
// single device and searches a layout (and mesh) for it. An estimator
// refuses to start while `auto_layout` or `auto_layout_and_mesh_shape` is
// set, so a proposal is never silently trained with.

use std::fmt;
use std::sync::Arc;

use meshlm_core::auto_layout::{self, GraphTrace, LayoutProposal};
use meshlm_core::{CommLedger, CommStats, Dim, Error, MeshPlan, Result, Tensor, VarStore};
use meshlm_nn::{
    dims, mean_logits, perplexity, token_accuracy, Context, IncrementalContext, Mode,
};

use crate::checkpoint::CheckpointHook;
use crate::config::ModelParams;
use crate::features::{token_tensor, Features};
use crate::microbatch::{reduce_gradients, serialize_training_step, MicrobatchPlan};
use crate::model::{GptModel, ModelOutput, ModelSpec};
use crate::optim::Optimizer;

/// Mesh axes tried by `auto_layout_and_mesh_shape`.
const MAX_MESH_DIMS: usize = 2;

/// Result of a TRAIN step.
#[derive(Debug, Clone)]
pub struct TrainOutput {
    pub global_step: u64,
    pub loss: f64,
    pub aux_loss: Option<f64>,
    pub microbatches: usize,
    /// All-reduces implied by the layout during this step.
    pub comm: CommStats,
}

/// Result of an EVAL step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalMetrics {
    pub loss: f64,
    pub accuracy: f64,
    pub perplexity: f64,
    pub mean_logits: f64,
}

/// Result of a PREDICT step.
#[derive(Debug, Clone)]
pub struct Predictions {
    /// Argmax ids, `[batch, sequence]` (I64).
    pub tokens: Tensor,
    /// Softmax over vocab, `[batch, sequence, vocab]`.
    pub probabilities: Tensor,
}

#[derive(Debug, Clone)]
pub enum StepOutput {
    Train(TrainOutput),
    Eval(EvalMetrics),
    Predict(Predictions),
}

impl fmt::Display for TrainOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step {}: loss = {:.6}", self.global_step, self.loss)?;
        if let Some(aux) = self.aux_loss {
            write!(f, " (aux {aux:.6})")?;
        }
        write!(
            f,
            ", {} microbatch(es), {} all-reduce(s)",
            self.microbatches, self.comm.allreduces
        )
    }
}

impl fmt::Display for EvalMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "loss = {:.6}, accuracy = {:.4}, perplexity = {:.4}, mean logits = {:.6}",
            self.loss, self.accuracy, self.perplexity, self.mean_logits
        )
    }
}

fn scalar(t: &Option<Tensor>) -> Result<Option<f64>> {
    t.as_ref().map(Tensor::to_scalar_f64).transpose()
}

pub struct Estimator {
    params: ModelParams,
    store: VarStore,
    model: GptModel,
    plan: Arc<MeshPlan>,
    ledger: Arc<CommLedger>,
    microbatches: MicrobatchPlan,
    optimizer: Box<dyn Optimizer>,
    hooks: Vec<Box<dyn CheckpointHook>>,
    restored: bool,
    global_step: u64,
}

impl Estimator {
    /// Build the model described by `params` on its mesh.
    pub fn new(params: ModelParams, optimizer: Box<dyn Optimizer>) -> Result<Self> {
        if params.auto_layout || params.auto_layout_and_mesh_shape {
            return Err(Error::config(
                "auto_layout is set: run propose_layout and put the result in the configuration",
            ));
        }
        let plan = Arc::new(MeshPlan::new(
            params.mesh_shape.clone(),
            params.layout.clone(),
        )?);
        let spec = ModelSpec::from_params(&params)?;
        let mut store = VarStore::new(params.precision, params.seed);
        let model = spec.compile(&mut store, Arc::clone(&plan))?;

        let batch = Dim::new(dims::BATCH, params.train_batch_size);
        let microbatches = match params.tokens_per_mb_per_replica {
            Some(budget) => {
                MicrobatchPlan::from_token_budget(batch, params.n_ctx, &plan, Some(budget))?
            }
            None => MicrobatchPlan::new(batch, params.microbatches_per_batch)?,
        };
        log::info!(
            "estimator: mesh {} layout {}, {} microbatch(es) per step",
            plan.mesh(),
            plan.layout(),
            microbatches.count()
        );

        Ok(Estimator {
            params,
            store,
            model,
            plan,
            ledger: Arc::new(CommLedger::new()),
            microbatches,
            optimizer,
            hooks: Vec::new(),
            restored: false,
            global_step: 0,
        })
    }

    /// Parse a JSON configuration and build the estimator.
    pub fn from_config(config: &serde_json::Value, optimizer: Box<dyn Optimizer>) -> Result<Self> {
        Self::new(ModelParams::from_value(config)?, optimizer)
    }

    pub fn with_hook(mut self, hook: impl CheckpointHook + 'static) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }

    pub fn params(&self) -> &ModelParams {
        &self.params
    }

    pub fn model(&self) -> &GptModel {
        &self.model
    }

    pub fn store(&self) -> &VarStore {
        &self.store
    }

    pub fn plan(&self) -> &Arc<MeshPlan> {
        &self.plan
    }

    pub fn microbatch_plan(&self) -> &MicrobatchPlan {
        &self.microbatches
    }

    pub fn global_step(&self) -> u64 {
        self.global_step
    }

    fn context(&self, mode: Mode) -> Context<'static> {
        Context::new(
            mode,
            self.store.precision(),
            Arc::clone(&self.plan),
            Arc::clone(&self.ledger),
        )
        .with_seed(self.params.seed.wrapping_add(self.global_step))
    }

    fn ensure_restored(&mut self) -> Result<()> {
        if self.restored {
            return Ok(());
        }
        for hook in self.hooks.iter_mut() {
            if let Some(step) = hook.restore(&self.store)? {
                self.global_step = step;
            }
        }
        self.restored = true;
        Ok(())
    }

    /// Run one step in `mode`.
    pub fn step(&mut self, mode: Mode, features: &Features) -> Result<StepOutput> {
        match mode {
            Mode::Train => self.train(features).map(StepOutput::Train),
            Mode::Eval => self.evaluate(features).map(StepOutput::Eval),
            Mode::Predict => self.predict(features).map(StepOutput::Predict),
        }
    }

    pub fn train(&mut self, features: &Features) -> Result<TrainOutput> {
        self.ensure_restored()?;
        features.validate_language_model(self.microbatches.batch().size(), self.params.n_ctx)?;
        self.ledger.reset();

        let variables = self.model.variables();
        let computed = serialize_training_step(&self.microbatches, features, &variables, |i, f| {
            let mut ctx = self.context(Mode::Train).with_microbatch(i);
            self.model.forward(&mut ctx, f)
        })?;

        let data_dims = [
            self.microbatches.batch().clone(),
            Dim::new(dims::SEQUENCE, self.params.n_ctx),
        ];
        reduce_gradients(&self.plan, &self.ledger, &computed.grads, &data_dims);

        let updates = self.optimizer.apply_gradients(&computed.grads)?;
        for u in &updates {
            u.validate()?;
        }
        for u in &updates {
            u.apply()?;
        }
        self.global_step += 1;
        for hook in self.hooks.iter_mut() {
            hook.after_update(self.global_step, &self.store)?;
        }

        let out = TrainOutput {
            global_step: self.global_step,
            loss: scalar(&computed.output.loss)?.unwrap_or(f64::NAN),
            aux_loss: scalar(&computed.output.aux_loss)?,
            microbatches: self.microbatches.count(),
            comm: self.ledger.stats(),
        };
        log::info!("{out}");
        Ok(out)
    }

    fn forward(&mut self, mode: Mode, features: &Features) -> Result<ModelOutput> {
        self.ensure_restored()?;
        let mut ctx = self.context(mode);
        self.model.forward(&mut ctx, features)
    }

    pub fn evaluate(&mut self, features: &Features) -> Result<EvalMetrics> {
        let labels = features
            .labels()
            .ok_or_else(|| Error::config("evaluation needs labels"))?
            .clone();
        let out = self.forward(Mode::Eval, features)?;
        let (Some(loss), Some(loss_batch)) = (&out.loss, &out.loss_batch) else {
            return Err(Error::msg("evaluation produced no loss"));
        };
        let metrics = EvalMetrics {
            loss: loss.to_scalar_f64()?,
            accuracy: token_accuracy(&out.logits, &labels, &self.model.spec().vocab)?,
            perplexity: perplexity(loss_batch)?,
            mean_logits: mean_logits(&out.logits)?,
        };
        log::info!("eval at step {}: {metrics}", self.global_step);
        Ok(metrics)
    }

    pub fn predict(&mut self, features: &Features) -> Result<Predictions> {
        let out = self.forward(Mode::Predict, features)?;
        Ok(Predictions {
            tokens: out.logits.argmax(dims::VOCAB)?,
            probabilities: out.logits.softmax(dims::VOCAB)?.detach(),
        })
    }

    /// Start an incremental decoding session.
    pub fn decode_session(&mut self) -> Result<DecodeSession<'_>> {
        self.ensure_restored()?;
        if !self.model.spec().causal {
            return Err(Error::config(
                "incremental decoding needs a causal model (mlm_training is set)",
            ));
        }
        Ok(DecodeSession {
            estimator: self,
            state: IncrementalContext::new(),
        })
    }
}

/// One decoding session: a prefill call followed by one call per token.
pub struct DecodeSession<'a> {
    estimator: &'a Estimator,
    state: IncrementalContext,
}

impl DecodeSession<'_> {
    /// Number of completed calls.
    pub fn position(&self) -> usize {
        self.state.position()
    }

    /// Run one call: the prompt first, then single tokens.
    pub fn call(&mut self, features: &Features) -> Result<ModelOutput> {
        let mut ctx = self
            .estimator
            .context(Mode::Predict)
            .with_incremental(&mut self.state);
        self.estimator.model.forward(&mut ctx, features)
    }

    /// Feed the prompt `[batch, n_ctx]` (padded), of which the first
    /// `prompt_len` positions are real. Returns the logits of every position.
    pub fn prefill(&mut self, prompt: Tensor, prompt_len: usize) -> Result<Tensor> {
        let features = Features::language_model(prompt, None).with_prompt_length(prompt_len);
        Ok(self.call(&features)?.logits)
    }

    /// Feed one token per example; returns `[batch, vocab]` logits.
    pub fn next(&mut self, tokens: Tensor) -> Result<Tensor> {
        Ok(self.call(&Features::language_model(tokens, None))?.logits)
    }
}

/// Build the graph once and search a layout for it.
///
/// With `auto_layout_and_mesh_shape` the mesh is searched too, over
/// `num_cores` devices.
pub fn propose_layout(params: &ModelParams) -> Result<LayoutProposal> {
    let plan = Arc::new(MeshPlan::single_device());
    let spec = ModelSpec::from_params(params)?;
    let mut store = VarStore::new(params.precision, params.seed);
    let model = spec.compile(&mut store, Arc::clone(&plan))?;

    let (batch, seq) = (params.train_batch_size, params.n_ctx);
    let ids = vec![0i64; batch * seq];
    let features = Features::language_model(
        token_tensor(&ids, batch, seq)?,
        Some(token_tensor(&ids, batch, seq)?),
    );
    let mut ctx = Context::new(
        Mode::Train,
        params.precision,
        plan,
        Arc::new(CommLedger::new()),
    );
    let out = model.forward(&mut ctx, &features)?;
    let root = out.loss.as_ref().unwrap_or(&out.logits);
    let trace = GraphTrace::from_outputs(&[root]);

    let proposal = if params.auto_layout_and_mesh_shape {
        let cores = params.num_cores.ok_or_else(|| {
            Error::config("auto_layout_and_mesh_shape needs num_cores")
        })?;
        auto_layout::propose_layout_and_mesh(&trace, cores, MAX_MESH_DIMS)?
    } else {
        auto_layout::propose_layout(&trace, &params.mesh_shape)?
    };
    log::info!(
        "proposed mesh_shape \"{}\", layout \"{}\" (cost {:.1})",
        proposal.mesh,
        proposal.layout,
        proposal.cost
    );
    Ok(proposal)
}
