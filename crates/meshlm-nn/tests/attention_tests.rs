// Integration tests for the attention variants: causal locality and
// agreement of the decode path with a full pass.

use std::sync::Arc;

use meshlm_core::{CommLedger, DType, Dim, MeshPlan, Shape, Tensor, VarStore, VariableDType};
use meshlm_nn::{
    Attention, AttentionConfig, AttentionKind, Context, IncrementalContext, InitConfig, Mode,
    Module, Phase,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const SEQ: usize = 6;
const EMBD: usize = 4;

fn ctx() -> Context<'static> {
    Context::new(
        Mode::Eval,
        VariableDType::uniform(DType::F64),
        Arc::new(MeshPlan::single_device()),
        Arc::new(CommLedger::new()),
    )
}

fn layer(kind: AttentionKind, causal: bool, radius: usize) -> (VarStore, Attention) {
    let mut vs = VarStore::new(VariableDType::uniform(DType::F64), 11);
    let cfg = AttentionConfig {
        n_head: 2,
        n_ctx: SEQ,
        causal,
        radius,
        base_conv_size: 3,
        conv_dim: 2,
        lightweight_conv: 2,
        init: InitConfig {
            std: 0.5,
            ..Default::default()
        },
        ..Default::default()
    };
    let attn = Attention::new(kind, &mut vs.root().pp("h0").pp("attn"), &Dim::new("embd", EMBD), &cfg)
        .unwrap()
        .unwrap();
    (vs, attn)
}

fn input(seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..2 * SEQ * EMBD).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

fn tensor(data: Vec<f64>) -> Tensor {
    Tensor::new(
        data,
        Shape::from_pairs(&[("batch", 2), ("sequence", SEQ), ("embd", EMBD)]).unwrap(),
        DType::F64,
    )
    .unwrap()
}

/// Row `t` of a [batch, sequence, embd] tensor, as [batch, embd].
fn position(x: &Tensor, t: usize) -> Tensor {
    let s = x.slice("sequence", t, 1).unwrap();
    s.reshape(Shape::from_pairs(&[("batch", 2), ("embd", EMBD)]).unwrap())
        .unwrap()
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f64 {
    a.to_f64_vec()
        .unwrap()
        .iter()
        .zip(b.to_f64_vec().unwrap())
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f64::max)
}

/// Change the input at position `changed` and report the largest output
/// change per position.
fn sensitivity(attn: &Attention, changed: usize) -> Vec<f64> {
    let base = input(1);
    let mut perturbed = base.clone();
    for b in 0..2 {
        for e in 0..EMBD {
            perturbed[(b * SEQ + changed) * EMBD + e] += 0.75;
        }
    }
    let y0 = attn.forward(&mut ctx(), &tensor(base)).unwrap();
    let y1 = attn.forward(&mut ctx(), &tensor(perturbed)).unwrap();
    (0..SEQ)
        .map(|t| max_abs_diff(&position(&y0, t), &position(&y1, t)))
        .collect()
}

#[test]
fn test_causal_variants_never_look_ahead() {
    for kind in [
        AttentionKind::Global,
        AttentionKind::Local,
        AttentionKind::Linear,
        AttentionKind::Convolutional,
    ] {
        let (_vs, attn) = layer(kind, true, 2);
        let diff = sensitivity(&attn, 3);
        for (t, d) in diff.iter().enumerate() {
            if t < 3 {
                assert!(*d < 1e-12, "{kind}: position {t} saw position 3 ({d})");
            }
        }
        assert!(diff[3] > 1e-6, "{kind}: position 3 ignored its own input");
    }
}

#[test]
fn test_local_attention_radius() {
    let (_vs, attn) = layer(AttentionKind::Local, true, 1);
    let diff = sensitivity(&attn, 1);
    // Radius 1: only positions 1 and 2 see position 1.
    assert!(diff[0] < 1e-12);
    assert!(diff[1] > 1e-6 && diff[2] > 1e-6);
    for d in &diff[3..] {
        assert!(*d < 1e-12);
    }

    let (_vs, attn) = layer(AttentionKind::Local, false, 1);
    let diff = sensitivity(&attn, 3);
    assert!(diff[2] > 1e-6 && diff[4] > 1e-6);
    assert!(diff[0] < 1e-12 && diff[1] < 1e-12 && diff[5] < 1e-12);
}

#[test]
fn test_non_causal_linear_attention_sees_everything() {
    let (_vs, attn) = layer(AttentionKind::Linear, false, 2);
    let diff = sensitivity(&attn, 5);
    assert!(diff.iter().all(|d| *d > 1e-9));
}

#[test]
fn test_decode_matches_full_pass() {
    const PROMPT: usize = 3;
    for kind in [
        AttentionKind::Global,
        AttentionKind::Local,
        AttentionKind::Linear,
        AttentionKind::Convolutional,
    ] {
        let (_vs, attn) = layer(kind, true, 2);
        let x = tensor(input(2));
        let full = attn.forward(&mut ctx(), &x).unwrap();

        // Prompt padded to the full length with zeros.
        let mut padded = input(2);
        for b in 0..2 {
            for t in PROMPT..SEQ {
                for e in 0..EMBD {
                    padded[(b * SEQ + t) * EMBD + e] = 0.0;
                }
            }
        }
        let mut state = IncrementalContext::new();
        {
            let mut c = ctx().with_incremental(&mut state);
            assert_eq!(c.begin_incremental(), Some(Phase::Prefill));
            attn.forward(&mut c, &tensor(padded)).unwrap();
            c.finish_incremental(Some(PROMPT));
        }
        assert_eq!(state.num_cached_layers(), 1);

        for t in PROMPT..SEQ {
            let mut c = ctx().with_incremental(&mut state);
            assert_eq!(c.begin_incremental(), Some(Phase::Decode { index: t }));
            let y = attn.forward(&mut c, &position(&x, t)).unwrap();
            c.finish_incremental(None);
            let d = max_abs_diff(&y, &position(&full, t));
            assert!(d < 1e-9, "{kind}: decode at {t} differs by {d}");
        }
    }
}

#[test]
fn test_decode_past_context_is_shape_error() {
    let (_vs, attn) = layer(AttentionKind::Global, true, 2);
    let mut state = IncrementalContext::new();
    {
        let mut c = ctx().with_incremental(&mut state);
        c.begin_incremental();
        attn.forward(&mut c, &tensor(input(3))).unwrap();
        c.finish_incremental(Some(SEQ));
    }
    let mut c = ctx().with_incremental(&mut state);
    assert_eq!(c.begin_incremental(), Some(Phase::Decode { index: SEQ }));
    let x = tensor(input(3));
    let err = attn.forward(&mut c, &position(&x, 0)).unwrap_err();
    assert!(err.is_shape_error());
}
