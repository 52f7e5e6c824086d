// Context: the explicit run-time argument of every layer
//
// A layer never reads ambient state. Everything that changes how it runs is
// carried here:
//
//   mode          TRAIN enables dropout and the training MoE capacity
//   precision     the variable precision triple (activation dtype for compute)
//   plan, ledger  the mesh layout, and where contractions over sharded
//                 dimensions are recorded as all-reduces
//   seed          base of every dropout mask; combined with the microbatch
//                 index and the site path so that a recomputed segment draws
//                 exactly the mask of its first run
//   incremental   the decode session state, if any
//
// INCREMENTAL INFERENCE
//
//   IncrementalContext holds the decode position counter and per-layer
//   caches. The model reads the counter once per call (`begin_incremental`),
//   layers consult the resulting Phase, and the model advances the counter
//   once after the call succeeded (`finish_incremental`). The context is
//   borrowed `&mut`, so two calls can never share it.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use meshlm_core::{CommLedger, DType, Error, MeshPlan, Result, Shape, Tensor, VariableDType};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Execution mode of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Train,
    Eval,
    Predict,
}

impl Mode {
    pub fn is_training(self) -> bool {
        self == Mode::Train
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Train => "train",
            Mode::Eval => "eval",
            Mode::Predict => "predict",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "train" => Ok(Mode::Train),
            "eval" => Ok(Mode::Eval),
            "predict" | "infer" => Ok(Mode::Predict),
            other => Err(Error::UnsupportedMode(other.to_string())),
        }
    }
}

/// Where an incremental call stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Counter at 0: run the whole prompt and fill the caches.
    Prefill,
    /// Counter p > 0: process the single token at `index = prompt_len + p - 1`.
    Decode { index: usize },
}

/// Per-session decode state. Owned by exactly one session.
#[derive(Debug, Default)]
pub struct IncrementalContext {
    position: usize,
    prompt_len: usize,
    states: HashMap<String, Vec<Tensor>>,
}

impl IncrementalContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of completed calls.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn prompt_len(&self) -> usize {
        self.prompt_len
    }

    pub fn phase(&self) -> Phase {
        if self.position == 0 {
            Phase::Prefill
        } else {
            Phase::Decode {
                index: self.prompt_len + self.position - 1,
            }
        }
    }

    /// Cached tensors of one layer.
    pub fn states(&self, layer: &str) -> Result<&[Tensor]> {
        self.states
            .get(layer)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::msg(format!("no cached state for layer '{layer}'")))
    }

    /// Replace the cached tensors of one layer.
    pub fn record(&mut self, layer: &str, states: Vec<Tensor>) {
        self.states.insert(layer.to_string(), states);
    }

    pub fn num_cached_layers(&self) -> usize {
        self.states.len()
    }

    fn advance(&mut self, prompt_len: Option<usize>) {
        if let Some(len) = prompt_len {
            self.prompt_len = len;
        }
        self.position += 1;
    }
}

/// Run-time arguments shared by every layer call.
pub struct Context<'a> {
    mode: Mode,
    precision: VariableDType,
    plan: Arc<MeshPlan>,
    ledger: Arc<CommLedger>,
    seed: u64,
    microbatch: usize,
    incremental: Option<&'a mut IncrementalContext>,
    phase: Option<Phase>,
}

impl Context<'static> {
    pub fn new(
        mode: Mode,
        precision: VariableDType,
        plan: Arc<MeshPlan>,
        ledger: Arc<CommLedger>,
    ) -> Self {
        Context {
            mode,
            precision,
            plan,
            ledger,
            seed: 0,
            microbatch: 0,
            incremental: None,
            phase: None,
        }
    }
}

impl<'a> Context<'a> {
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_microbatch(mut self, index: usize) -> Self {
        self.microbatch = index;
        self
    }

    /// Attach a decode session.
    pub fn with_incremental<'b>(self, state: &'b mut IncrementalContext) -> Context<'b> {
        Context {
            mode: self.mode,
            precision: self.precision,
            plan: self.plan,
            ledger: self.ledger,
            seed: self.seed,
            microbatch: self.microbatch,
            incremental: Some(state),
            phase: None,
        }
    }

    /// A copy without the decode session, for closures that must own
    /// their context (recomputed segments).
    pub fn snapshot(&self) -> Context<'static> {
        Context {
            mode: self.mode,
            precision: self.precision,
            plan: Arc::clone(&self.plan),
            ledger: Arc::clone(&self.ledger),
            seed: self.seed,
            microbatch: self.microbatch,
            incremental: None,
            phase: None,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_training(&self) -> bool {
        self.mode.is_training()
    }

    pub fn precision(&self) -> VariableDType {
        self.precision
    }

    pub fn activation_dtype(&self) -> DType {
        self.precision.activation
    }

    pub fn plan(&self) -> &Arc<MeshPlan> {
        &self.plan
    }

    pub fn ledger(&self) -> &Arc<CommLedger> {
        &self.ledger
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn microbatch(&self) -> usize {
        self.microbatch
    }

    pub fn is_incremental(&self) -> bool {
        self.incremental.is_some()
    }

    /// Read the decode counter. Called once per model call.
    pub fn begin_incremental(&mut self) -> Option<Phase> {
        self.phase = self.incremental.as_deref().map(IncrementalContext::phase);
        self.phase
    }

    /// Phase fixed by [`Context::begin_incremental`] for the current call.
    pub fn phase(&self) -> Option<Phase> {
        self.phase
    }

    pub fn incremental_mut(&mut self) -> Option<&mut IncrementalContext> {
        self.incremental.as_deref_mut()
    }

    pub fn incremental(&self) -> Option<&IncrementalContext> {
        self.incremental.as_deref()
    }

    /// Advance the decode counter after a successful call. `prompt_len` is
    /// recorded on the prefill call.
    pub fn finish_incremental(&mut self, prompt_len: Option<usize>) {
        if let Some(state) = self.incremental.as_deref_mut() {
            state.advance(prompt_len);
        }
        self.phase = None;
    }

    /// Deterministic generator for the dropout site `site`.
    pub fn dropout_rng(&self, site: &str) -> StdRng {
        // FNV-1a over the site path, mixed with seed and microbatch.
        let mut h: u64 = 0xcbf2_9ce4_8422_2325;
        for b in site.bytes() {
            h ^= u64::from(b);
            h = h.wrapping_mul(0x0000_0100_0000_01b3);
        }
        h ^= self.seed.rotate_left(17);
        h = h.wrapping_mul(0x9e37_79b9_7f4a_7c15);
        h ^= (self.microbatch as u64).wrapping_add(1).rotate_left(41);
        StdRng::seed_from_u64(h)
    }

    /// Einsum that reports reductions over sharded dimensions to the ledger
    /// and checks the result against the layout.
    pub fn contract(&self, inputs: &[&Tensor], output: &Shape) -> Result<Tensor> {
        self.plan.validate(output)?;
        let shapes: Vec<&Shape> = inputs.iter().map(|t| t.shape()).collect();
        self.ledger.record_contraction(&self.plan, &shapes, output);
        Tensor::einsum(inputs, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn ctx() -> Context<'static> {
        Context::new(
            Mode::Train,
            VariableDType::default(),
            Arc::new(MeshPlan::single_device()),
            Arc::new(CommLedger::new()),
        )
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("TRAIN".parse::<Mode>().unwrap(), Mode::Train);
        assert_eq!("predict".parse::<Mode>().unwrap(), Mode::Predict);
        assert!("serve".parse::<Mode>().unwrap_err().is_unsupported_mode());
    }

    #[test]
    fn test_dropout_rng_depends_on_site_seed_and_microbatch() {
        let c = ctx().with_seed(7);
        let draw = |c: &Context<'_>, site: &str| c.dropout_rng(site).gen::<u64>();
        assert_eq!(draw(&c, "h0/attn"), draw(&c.snapshot(), "h0/attn"));
        assert_ne!(draw(&c, "h0/attn"), draw(&c, "h1/attn"));
        let c1 = ctx().with_seed(7).with_microbatch(1);
        assert_ne!(draw(&c, "h0/attn"), draw(&c1, "h0/attn"));
    }

    #[test]
    fn test_counter_read_once_and_advanced_once() {
        let mut state = IncrementalContext::new();
        {
            let mut c = ctx().with_incremental(&mut state);
            assert_eq!(c.begin_incremental(), Some(Phase::Prefill));
            c.finish_incremental(Some(5));
        }
        assert_eq!(state.phase(), Phase::Decode { index: 5 });
        {
            let mut c = ctx().with_incremental(&mut state);
            assert_eq!(c.begin_incremental(), Some(Phase::Decode { index: 5 }));
            c.finish_incremental(None);
        }
        assert_eq!(state.position(), 2);
        assert_eq!(state.phase(), Phase::Decode { index: 6 });
    }
}
