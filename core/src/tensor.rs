/// Minimal tensor utilities for the NTM core.
///
/// All operations are free functions on flat f64 slices with explicit dimensions.
/// Row-major layout throughout. No clamping: a NaN produced here is caught by the
/// stage that consumes it, never silently squashed.

use rand::Rng;

// ── Activations ──────────────────────────────────────────────────────

/// Sigmoid: 1 / (1 + exp(-x)). Evaluated on the side that cannot overflow.
#[inline]
pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Softplus: ln(1 + exp(x)), as max(x, 0) + ln(1 + exp(-|x|)).
#[inline]
pub fn softplus(x: f64) -> f64 {
    x.max(0.0) + (-x.abs()).exp().ln_1p()
}

/// Binary cross-entropy of sigmoid(logit) against `target`, in nats:
/// -[y ln σ(l) + (1 - y) ln(1 - σ(l))] = softplus(l) - y · l.
#[inline]
pub fn bce_with_logits(logit: f64, target: f64) -> f64 {
    softplus(logit) - target * logit
}

// ── Vector ops ───────────────────────────────────────────────────────

pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// L2 norm of a vector: sqrt(sum(a[i]^2)).
pub fn norm(a: &[f64]) -> f64 {
    dot(a, a).sqrt()
}

/// Softmax of a single vector into `out`. Numerically stable (max-shifted).
pub fn softmax(x: &[f64], out: &mut [f64]) {
    debug_assert_eq!(x.len(), out.len());
    let max_val = x.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut sum = 0.0;
    for (o, &v) in out.iter_mut().zip(x.iter()) {
        *o = (v - max_val).exp();
        sum += *o;
    }
    for o in out.iter_mut() {
        *o /= sum;
    }
}

/// VJP of softmax: d_x[i] = y[i] * (d_y[i] - sum_j d_y[j] * y[j]).
pub fn softmax_backward(y: &[f64], d_y: &[f64], d_x: &mut [f64]) {
    let s = dot(y, d_y);
    for i in 0..y.len() {
        d_x[i] = y[i] * (d_y[i] - s);
    }
}

// ── Matrix-vector ops ────────────────────────────────────────────────

/// out[r] += sum_c W[r, c] * x[c]. W is [rows, cols].
pub fn matvec_acc(w: &[f64], x: &[f64], out: &mut [f64], rows: usize, cols: usize) {
    debug_assert_eq!(w.len(), rows * cols);
    debug_assert_eq!(x.len(), cols);
    debug_assert_eq!(out.len(), rows);
    for r in 0..rows {
        out[r] += dot(&w[r * cols..(r + 1) * cols], x);
    }
}

/// out[c] += sum_r W[r, c] * y[r]. Transposed product, W is [rows, cols].
pub fn matvec_t_acc(w: &[f64], y: &[f64], out: &mut [f64], rows: usize, cols: usize) {
    debug_assert_eq!(w.len(), rows * cols);
    debug_assert_eq!(y.len(), rows);
    debug_assert_eq!(out.len(), cols);
    for r in 0..rows {
        let yr = y[r];
        if yr == 0.0 {
            continue;
        }
        let row = &w[r * cols..(r + 1) * cols];
        for c in 0..cols {
            out[c] += row[c] * yr;
        }
    }
}

/// W[r, c] += a[r] * b[c]. Outer-product accumulation into a [rows, cols] buffer.
pub fn outer_acc(a: &[f64], b: &[f64], w: &mut [f64]) {
    let cols = b.len();
    debug_assert_eq!(w.len(), a.len() * cols);
    for (r, &ar) in a.iter().enumerate() {
        if ar == 0.0 {
            continue;
        }
        let row = &mut w[r * cols..(r + 1) * cols];
        for c in 0..cols {
            row[c] += ar * b[c];
        }
    }
}

/// Element-wise accumulation: dst[i] += src[i].
pub fn add_assign(dst: &mut [f64], src: &[f64]) {
    debug_assert_eq!(dst.len(), src.len());
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d += s;
    }
}

/// Fill slice with uniform random values in [-scale, scale).
pub fn fill_uniform<R: Rng + ?Sized>(rng: &mut R, buf: &mut [f64], scale: f64) {
    for v in buf.iter_mut() {
        *v = rng.gen_range(-scale..scale);
    }
}
