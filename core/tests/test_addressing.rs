/// Addressing pipeline: finite-difference checks of every stage's VJP and the
/// distribution invariant over random head signals.

use ntm_core::addressing::{
    address, content_backward, content_forward, gate_backward, gate_forward, sharpen_backward, sharpen_forward,
    shift_backward, shift_forward, HeadLayout, HeadSignals,
};
use ntm_core::tensor::{dot, fill_uniform, softmax};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const EPS: f64 = 1e-6;
const TOL: f64 = 1e-4;

// ── Helpers ──────────────────────────────────────────────────────────

/// Central difference of `f` w.r.t. x[i].
fn fd(f: &dyn Fn(&[f64]) -> f64, x: &[f64], i: usize) -> f64 {
    let mut plus = x.to_vec();
    plus[i] += EPS;
    let mut minus = x.to_vec();
    minus[i] -= EPS;
    (f(&plus) - f(&minus)) / (2.0 * EPS)
}

fn assert_grad(name: &str, analytic: &[f64], f: &dyn Fn(&[f64]) -> f64, x: &[f64]) {
    assert_eq!(analytic.len(), x.len());
    for i in 0..x.len() {
        let numerical = fd(f, x, i);
        let denom = analytic[i].abs().max(numerical.abs()).max(1e-5);
        let rel = (analytic[i] - numerical).abs() / denom;
        assert!(rel < TOL, "{name}[{i}]: analytic={:.8e} numerical={numerical:.8e} rel={rel:.3e}", analytic[i]);
    }
}

fn random_vec(rng: &mut StdRng, n: usize, scale: f64) -> Vec<f64> {
    let mut v = vec![0.0; n];
    fill_uniform(rng, &mut v, scale);
    v
}

fn random_distribution(rng: &mut StdRng, n: usize) -> Vec<f64> {
    let logits = random_vec(rng, n, 2.0);
    let mut w = vec![0.0; n];
    softmax(&logits, &mut w);
    w
}

fn assert_distribution(stage: &str, w: &[f64]) {
    let sum: f64 = w.iter().sum();
    assert!((sum - 1.0).abs() < 1e-9, "{stage}: sum={sum}");
    assert!(w.iter().all(|&v| v >= 0.0), "{stage}: negative entry in {w:?}");
}

// ── Content addressing ───────────────────────────────────────────────

#[test]
fn test_content_gradients() {
    let (n, m) = (5, 3);
    let mut rng = StdRng::seed_from_u64(100);
    let key = random_vec(&mut rng, m, 1.0);
    let memory = random_vec(&mut rng, n * m, 1.0);
    let beta_raw = 0.9;
    let c = random_vec(&mut rng, n, 1.0);

    let w = content_forward(&key, beta_raw, &memory, n, m).unwrap();
    let grads = content_backward(&key, beta_raw, &memory, &w, &c, n, m);

    assert_grad("d_key", &grads.d_key, &|k| dot(&content_forward(k, beta_raw, &memory, n, m).unwrap(), &c), &key);
    assert_grad("d_memory", &grads.d_memory, &|mem| dot(&content_forward(&key, beta_raw, mem, n, m).unwrap(), &c), &memory);
    assert_grad("d_beta", &[grads.d_beta], &|b| dot(&content_forward(&key, b[0], &memory, n, m).unwrap(), &c), &[beta_raw]);
}

// ── Gated interpolation ──────────────────────────────────────────────

#[test]
fn test_gate_gradients() {
    let n = 6;
    let mut rng = StdRng::seed_from_u64(101);
    let content = random_distribution(&mut rng, n);
    let prev = random_distribution(&mut rng, n);
    let gate_raw = -0.35;
    let c = random_vec(&mut rng, n, 1.0);

    let (d_content, d_prev, d_gate) = gate_backward(&content, &prev, gate_raw, &c);
    assert_grad("d_content", &d_content, &|x| dot(&gate_forward(x, &prev, gate_raw), &c), &content);
    assert_grad("d_prev", &d_prev, &|x| dot(&gate_forward(&content, x, gate_raw), &c), &prev);
    assert_grad("d_gate", &[d_gate], &|g| dot(&gate_forward(&content, &prev, g[0]), &c), &[gate_raw]);
}

// ── Circular shift ───────────────────────────────────────────────────

#[test]
fn test_shift_gradients() {
    let n = 5;
    let mut rng = StdRng::seed_from_u64(102);
    let gated = random_distribution(&mut rng, n);
    let c = random_vec(&mut rng, n, 1.0);

    // positive and negative displacements, away from the kink at max_shift = 0
    for &shift_raw in &[0.8, -1.1, 2.5] {
        let (d_gated, d_shift) = shift_backward(&gated, shift_raw, &c);
        assert_grad("d_gated", &d_gated, &|x| dot(&shift_forward(x, shift_raw).unwrap(), &c), &gated);
        assert_grad("d_shift", &[d_shift], &|s| dot(&shift_forward(&gated, s[0]).unwrap(), &c), &[shift_raw]);
    }
}

#[test]
fn test_shift_gradients_two_rows() {
    let gated = vec![0.3, 0.7];
    let c = vec![1.0, -0.5];
    let shift_raw = -0.6;
    let (d_gated, d_shift) = shift_backward(&gated, shift_raw, &c);
    assert_grad("d_gated", &d_gated, &|x| dot(&shift_forward(x, shift_raw).unwrap(), &c), &gated);
    assert_grad("d_shift", &[d_shift], &|s| dot(&shift_forward(&gated, s[0]).unwrap(), &c), &[shift_raw]);
}

// ── Sharpening ───────────────────────────────────────────────────────

#[test]
fn test_sharpen_gradients() {
    let n = 5;
    let mut rng = StdRng::seed_from_u64(103);
    let shifted = random_distribution(&mut rng, n);
    let gamma_raw = 0.7;
    let c = random_vec(&mut rng, n, 1.0);

    let w = sharpen_forward(&shifted, gamma_raw).unwrap();
    let (d_shifted, d_gamma) = sharpen_backward(&shifted, gamma_raw, &w, &c);
    assert_grad("d_shifted", &d_shifted, &|x| dot(&sharpen_forward(x, gamma_raw).unwrap(), &c), &shifted);
    assert_grad("d_gamma", &[d_gamma], &|g| dot(&sharpen_forward(&shifted, g[0]).unwrap(), &c), &[gamma_raw]);
}

#[test]
fn test_sharpen_gamma_gradient_skips_zero_rows() {
    let shifted = vec![0.0, 0.25, 0.0, 0.75];
    let gamma_raw = -0.4;
    let c = vec![0.3, 1.0, -2.0, 0.1];
    let w = sharpen_forward(&shifted, gamma_raw).unwrap();
    let (_, d_gamma) = sharpen_backward(&shifted, gamma_raw, &w, &c);
    assert!(d_gamma.is_finite());
    assert_grad("d_gamma", &[d_gamma], &|g| dot(&sharpen_forward(&shifted, g[0]).unwrap(), &c), &[gamma_raw]);
}

// ── Distribution invariant ───────────────────────────────────────────

#[test]
fn test_every_stage_is_a_distribution() {
    let (n, m) = (7, 4);
    let layout = HeadLayout::new(m);
    let mut rng = StdRng::seed_from_u64(104);
    for _ in 0..200 {
        let memory = random_vec(&mut rng, n * m, 1.0);
        let prev = random_distribution(&mut rng, n);
        let scale = rng.gen_range(0.1..4.0);
        let raw = random_vec(&mut rng, layout.unit_size(), scale);
        let signals = HeadSignals::split(&raw, layout).unwrap();
        let state = address(&signals, &memory, &prev, n, m).unwrap();
        assert_distribution("content", &state.content);
        assert_distribution("gated", &state.gated);
        assert_distribution("shifted", &state.shifted);
        assert_distribution("sharpened", &state.weighting);
    }
}
