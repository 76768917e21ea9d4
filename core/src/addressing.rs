/// Addressing pipeline: content → gated interpolation → circular shift → sharpening.
///
/// Each stage is a forward/backward pair on flat slices. The backward functions
/// recompute cheap intermediates (similarities, shift coefficients) from the
/// immutable forward inputs instead of caching them.
///
/// Forward (per head, per timestep):
///   beta    = softplus(beta_raw)
///   w_c[i]  = softmax_i(beta * cos(key, M[i]))
///   g       = sigmoid(gate_raw)
///   w_g     = g * w_c + (1 - g) * w_prev
///   conv    = ((2 * sigmoid(shift_raw) - 1) + N) mod N
///   w_s[i]  = w_g[(i + ⌊conv⌋) mod N] * simj + w_g[(i + ⌊conv⌋ + 1) mod N] * (1 - simj)
///             where simj = 1 - frac(conv)
///   gamma   = softplus(gamma_raw) + 1
///   w[i]    = w_s[i]^gamma / Σ_j w_s[j]^gamma

use crate::error::{NtmError, Result};
use crate::tensor::{dot, norm, sigmoid, softmax, softmax_backward, softplus};

// ── Head signal layout ───────────────────────────────────────────────

/// Raw head signal layout for memory width M:
///   key[M] | beta | gate | shift | gamma | erase[M] | add[M]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeadLayout {
    pub m: usize,
}

impl HeadLayout {
    pub fn new(m: usize) -> Self {
        HeadLayout { m }
    }

    /// Number of raw controller outputs per head.
    pub fn unit_size(&self) -> usize {
        3 * self.m + 4
    }

    pub fn key(&self) -> std::ops::Range<usize> {
        0..self.m
    }

    pub fn beta(&self) -> usize {
        self.m
    }

    pub fn gate(&self) -> usize {
        self.m + 1
    }

    pub fn shift(&self) -> usize {
        self.m + 2
    }

    pub fn gamma(&self) -> usize {
        self.m + 3
    }

    pub fn erase(&self) -> std::ops::Range<usize> {
        self.m + 4..2 * self.m + 4
    }

    pub fn add(&self) -> std::ops::Range<usize> {
        2 * self.m + 4..3 * self.m + 4
    }
}

/// Borrowed view of one head's raw (pre-activation) control signals.
#[derive(Clone, Copy, Debug)]
pub struct HeadSignals<'a> {
    pub key: &'a [f64],
    pub beta: f64,
    pub gate: f64,
    pub shift: f64,
    pub gamma: f64,
    pub erase: &'a [f64],
    pub add: &'a [f64],
}

impl<'a> HeadSignals<'a> {
    /// Split one head's slice of the controller output.
    pub fn split(raw: &'a [f64], layout: HeadLayout) -> Result<Self> {
        crate::error::expect_len("head signals", layout.unit_size(), raw.len())?;
        Ok(HeadSignals {
            key: &raw[layout.key()],
            beta: raw[layout.beta()],
            gate: raw[layout.gate()],
            shift: raw[layout.shift()],
            gamma: raw[layout.gamma()],
            erase: &raw[layout.erase()],
            add: &raw[layout.add()],
        })
    }
}

/// Every intermediate weighting of one head at one timestep.
#[derive(Clone, Debug, PartialEq)]
pub struct AddressingState {
    pub content: Vec<f64>,
    pub gated: Vec<f64>,
    pub shifted: Vec<f64>,
    pub weighting: Vec<f64>,
}

/// Run all four stages for one head against the previous memory snapshot.
pub fn address(
    signals: &HeadSignals<'_>,
    memory: &[f64],
    prev_weighting: &[f64],
    rows: usize,
    cols: usize,
) -> Result<AddressingState> {
    crate::error::expect_len("previous weighting", rows, prev_weighting.len())?;
    let content = content_forward(signals.key, signals.beta, memory, rows, cols)?;
    let gated = gate_forward(&content, prev_weighting, signals.gate);
    let shifted = shift_forward(&gated, signals.shift)?;
    let weighting = sharpen_forward(&shifted, signals.gamma)?;
    Ok(AddressingState { content, gated, shifted, weighting })
}

/// Reject NaN or negative entries in a probability vector.
pub fn check_distribution(stage: &'static str, w: &[f64]) -> Result<()> {
    for (i, &v) in w.iter().enumerate() {
        if v.is_nan() || v < 0.0 {
            return Err(NtmError::numeric(stage, format!("weight {v} at row {i}")));
        }
    }
    Ok(())
}

// ── Stage 1: content addressing ──────────────────────────────────────

/// Cosine similarity between `key` and every row of `memory` [rows, cols].
/// A zero norm product is a fatal error, not a NaN.
pub fn cosine_similarities(key: &[f64], memory: &[f64], rows: usize, cols: usize) -> Result<Vec<f64>> {
    crate::error::expect_len("key", cols, key.len())?;
    crate::error::expect_len("memory", rows * cols, memory.len())?;
    let key_norm = norm(key);
    let mut sims = vec![0.0; rows];
    for i in 0..rows {
        let row = &memory[i * cols..(i + 1) * cols];
        let denom = key_norm * norm(row);
        if denom == 0.0 || !denom.is_finite() {
            return Err(NtmError::numeric(
                "content addressing",
                format!("cosine denominator {denom} at row {i}"),
            ));
        }
        let sim = dot(key, row) / denom;
        if !sim.is_finite() {
            return Err(NtmError::numeric("content addressing", format!("similarity {sim} at row {i}")));
        }
        sims[i] = sim;
    }
    Ok(sims)
}

pub fn content_forward(key: &[f64], beta_raw: f64, memory: &[f64], rows: usize, cols: usize) -> Result<Vec<f64>> {
    let sims = cosine_similarities(key, memory, rows, cols)?;
    let beta = softplus(beta_raw);
    if !beta.is_finite() {
        return Err(NtmError::numeric("content addressing", format!("beta {beta}")));
    }
    let scores: Vec<f64> = sims.iter().map(|s| beta * s).collect();
    let mut w = vec![0.0; rows];
    softmax(&scores, &mut w);
    check_distribution("content addressing", &w)?;
    Ok(w)
}

/// Gradients of content addressing w.r.t. its inputs.
pub struct ContentGrads {
    pub d_key: Vec<f64>,
    pub d_beta: f64,
    pub d_memory: Vec<f64>,
}

pub fn content_backward(
    key: &[f64],
    beta_raw: f64,
    memory: &[f64],
    weights: &[f64],
    d_weights: &[f64],
    rows: usize,
    cols: usize,
) -> ContentGrads {
    let beta = softplus(beta_raw);
    let key_norm = norm(key);

    // softmax VJP onto the scores beta * K[i]
    let mut d_scores = vec![0.0; rows];
    softmax_backward(weights, d_weights, &mut d_scores);

    let mut d_key = vec![0.0; cols];
    let mut d_memory = vec![0.0; rows * cols];
    let mut d_beta = 0.0;

    for i in 0..rows {
        let row = &memory[i * cols..(i + 1) * cols];
        let row_norm = norm(row);
        let uv = dot(key, row);
        let sim = uv / (key_norm * row_norm);
        d_beta += d_scores[i] * sim;

        // d cos(u, v) / du = v / (|u||v|) - cos * u / |u|^2
        let d_sim = d_scores[i] * beta;
        if d_sim == 0.0 {
            continue;
        }
        let inv = d_sim / (key_norm * row_norm);
        let key_coef = d_sim * sim / (key_norm * key_norm);
        let row_coef = d_sim * sim / (row_norm * row_norm);
        let d_row = &mut d_memory[i * cols..(i + 1) * cols];
        for j in 0..cols {
            d_key[j] += row[j] * inv - key[j] * key_coef;
            d_row[j] += key[j] * inv - row[j] * row_coef;
        }
    }

    ContentGrads { d_key, d_beta: d_beta * sigmoid(beta_raw), d_memory }
}

// ── Stage 2: gated interpolation ─────────────────────────────────────

pub fn gate_forward(content: &[f64], prev: &[f64], gate_raw: f64) -> Vec<f64> {
    debug_assert_eq!(content.len(), prev.len());
    let g = sigmoid(gate_raw);
    content.iter().zip(prev.iter()).map(|(c, p)| g * c + (1.0 - g) * p).collect()
}

/// Returns (d_content, d_prev, d_gate_raw).
pub fn gate_backward(content: &[f64], prev: &[f64], gate_raw: f64, d_out: &[f64]) -> (Vec<f64>, Vec<f64>, f64) {
    let g = sigmoid(gate_raw);
    let mut d_gate = 0.0;
    let mut d_content = vec![0.0; content.len()];
    let mut d_prev = vec![0.0; prev.len()];
    for i in 0..content.len() {
        d_content[i] = g * d_out[i];
        d_prev[i] = (1.0 - g) * d_out[i];
        d_gate += (content[i] - prev[i]) * d_out[i];
    }
    (d_content, d_prev, d_gate * g * (1.0 - g))
}

// ── Stage 3: circular shift ──────────────────────────────────────────

/// Integer offset and blend coefficient of a (possibly fractional) circular shift.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ShiftAmount {
    pub offset: usize,
    /// Weight on the donor at `offset`; the donor at `offset + 1` gets `1 - simj`.
    pub simj: f64,
}

impl ShiftAmount {
    /// Map a raw shift signal to a displacement: sigmoid → [-1, 1] → (x + N) mod N.
    pub fn from_signal(shift_raw: f64, n: usize) -> Self {
        let max_shift = 2.0 * sigmoid(shift_raw) - 1.0;
        let n_f = n as f64;
        Self::from_conv((max_shift + n_f) % n_f, n)
    }

    /// Displacement given directly in cells. Integer values rotate exactly.
    pub fn from_displacement(displacement: f64, n: usize) -> Self {
        Self::from_conv(displacement.rem_euclid(n as f64), n)
    }

    fn from_conv(conv: f64, n: usize) -> Self {
        let floor = conv.floor();
        ShiftAmount { offset: (floor as usize) % n.max(1), simj: 1.0 - (conv - floor) }
    }
}

pub fn shift_forward(gated: &[f64], shift_raw: f64) -> Result<Vec<f64>> {
    shift_by(gated, ShiftAmount::from_signal(shift_raw, gated.len()))
}

/// Apply a shift. Every output must be a non-negative number.
pub fn shift_by(gated: &[f64], amount: ShiftAmount) -> Result<Vec<f64>> {
    let n = gated.len();
    let ShiftAmount { offset, simj } = amount;
    let mut out = vec![0.0; n];
    for i in 0..n {
        let a = (i + offset) % n;
        let b = (a + 1) % n;
        out[i] = gated[a] * simj + gated[b] * (1.0 - simj);
    }
    check_distribution("circular shift", &out)?;
    Ok(out)
}

/// Returns (d_gated, d_shift_raw).
pub fn shift_backward(gated: &[f64], shift_raw: f64, d_out: &[f64]) -> (Vec<f64>, f64) {
    let n = gated.len();
    let ShiftAmount { offset, simj } = ShiftAmount::from_signal(shift_raw, n);
    let mut d_gated = vec![0.0; n];
    let mut d_simj = 0.0;
    for i in 0..n {
        let a = (i + offset) % n;
        let b = (a + 1) % n;
        d_gated[a] += d_out[i] * simj;
        d_gated[b] += d_out[i] * (1.0 - simj);
        d_simj += d_out[i] * (gated[a] - gated[b]);
    }
    // simj = 1 - frac(2 * sigmoid(x) - 1 + N): d simj / dx = -2 * s * (1 - s)
    let s = sigmoid(shift_raw);
    (d_gated, -d_simj * 2.0 * s * (1.0 - s))
}

// ── Stage 4: sharpening ──────────────────────────────────────────────

pub fn sharpen_forward(shifted: &[f64], gamma_raw: f64) -> Result<Vec<f64>> {
    let gamma = softplus(gamma_raw) + 1.0;
    let powered: Vec<f64> = shifted.iter().map(|&s| s.powf(gamma)).collect();
    let sum: f64 = powered.iter().sum();
    if sum == 0.0 || !sum.is_finite() {
        return Err(NtmError::numeric("sharpening", format!("normaliser {sum} (gamma {gamma})")));
    }
    let w: Vec<f64> = powered.iter().map(|p| p / sum).collect();
    check_distribution("sharpening", &w)?;
    Ok(w)
}

/// Returns (d_shifted, d_gamma_raw). `weights` is the forward output.
pub fn sharpen_backward(shifted: &[f64], gamma_raw: f64, weights: &[f64], d_out: &[f64]) -> (Vec<f64>, f64) {
    let n = shifted.len();
    let gamma = softplus(gamma_raw) + 1.0;
    let sum: f64 = shifted.iter().map(|&s| s.powf(gamma)).sum();
    let d_dot = dot(weights, d_out);

    // d w_i / d s_k = gamma * s_k^(gamma-1) / S * (δ_ik - w_i)
    let mut d_shifted = vec![0.0; n];
    for k in 0..n {
        d_shifted[k] = gamma * shifted[k].powf(gamma - 1.0) / sum * (d_out[k] - d_dot);
    }

    // d w_i / d gamma = w_i * (ln s_i - Σ_j w_j ln s_j); zero rows drop out (0 · ln 0 = 0)
    let mean_log: f64 = shifted
        .iter()
        .zip(weights.iter())
        .filter(|(&s, _)| s > 0.0)
        .map(|(&s, &w)| w * s.ln())
        .sum();
    let mut d_gamma = 0.0;
    for i in 0..n {
        if shifted[i] > 0.0 {
            d_gamma += d_out[i] * weights[i] * (shifted[i].ln() - mean_log);
        }
    }
    (d_shifted, d_gamma * sigmoid(gamma_raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_distribution(w: &[f64]) {
        let sum: f64 = w.iter().sum();
        assert!((sum - 1.0).abs() < 1e-9, "sum={sum}");
        assert!(w.iter().all(|&v| v >= 0.0), "negative entry in {w:?}");
    }

    fn memory_3x2() -> Vec<f64> {
        vec![1.0, 0.0, 0.0, 1.0, 0.6, 0.8]
    }

    #[test]
    fn test_layout_offsets() {
        let l = HeadLayout::new(4);
        assert_eq!(l.unit_size(), 16);
        assert_eq!(l.key(), 0..4);
        assert_eq!((l.beta(), l.gate(), l.shift(), l.gamma()), (4, 5, 6, 7));
        assert_eq!(l.erase(), 8..12);
        assert_eq!(l.add(), 12..16);
    }

    #[test]
    fn test_split_rejects_wrong_length() {
        let raw = vec![0.0; 9];
        assert!(matches!(
            HeadSignals::split(&raw, HeadLayout::new(2)),
            Err(NtmError::DimensionMismatch { expected: 10, got: 9, .. })
        ));
    }

    #[test]
    fn test_cosine_matches_rows() {
        let sims = cosine_similarities(&[1.0, 0.0], &memory_3x2(), 3, 2).unwrap();
        assert!((sims[0] - 1.0).abs() < 1e-12);
        assert!(sims[1].abs() < 1e-12);
        assert!((sims[2] - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_zero_row_is_fatal() {
        let memory = vec![1.0, 0.0, 0.0, 0.0];
        let err = content_forward(&[1.0, 1.0], 0.0, &memory, 2, 2).unwrap_err();
        assert!(matches!(err, NtmError::InvalidNumeric { stage: "content addressing", .. }));
    }

    #[test]
    fn test_zero_key_is_fatal() {
        assert!(content_forward(&[0.0, 0.0], 1.0, &memory_3x2(), 3, 2).is_err());
    }

    #[test]
    fn test_content_prefers_matching_row() {
        let w = content_forward(&[0.0, 2.0], 3.0, &memory_3x2(), 3, 2).unwrap();
        assert_distribution(&w);
        assert!(w[1] > w[2] && w[2] > w[0]);
    }

    #[test]
    fn test_gate_extremes() {
        let c = [0.7, 0.2, 0.1];
        let p = [0.0, 0.0, 1.0];
        let open = gate_forward(&c, &p, 40.0);
        let closed = gate_forward(&c, &p, -40.0);
        for i in 0..3 {
            assert!((open[i] - c[i]).abs() < 1e-12);
            assert!((closed[i] - p[i]).abs() < 1e-12);
        }
        assert_distribution(&gate_forward(&c, &p, 0.3));
    }

    #[test]
    fn test_zero_signal_is_identity_shift() {
        let g = [0.1, 0.2, 0.3, 0.4];
        let s = shift_forward(&g, 0.0).unwrap();
        assert_eq!(s, g.to_vec());
    }

    #[test]
    fn test_integer_displacement_rotates_exactly() {
        let g = [0.05, 0.1, 0.15, 0.2, 0.5];
        for d in 0..5usize {
            let s = shift_by(&g, ShiftAmount::from_displacement(d as f64, 5)).unwrap();
            let mut expected = g.to_vec();
            expected.rotate_left(d);
            assert_eq!(s, expected, "displacement {d}");
        }
        // negative displacement wraps
        let s = shift_by(&g, ShiftAmount::from_displacement(-1.0, 5)).unwrap();
        let mut expected = g.to_vec();
        expected.rotate_right(1);
        assert_eq!(s, expected);
    }

    #[test]
    fn test_fractional_shift_blends_neighbours() {
        let g = [1.0, 0.0, 0.0, 0.0];
        let s = shift_by(&g, ShiftAmount::from_displacement(3.25, 4)).unwrap();
        // out[i] = g[i+3]*0.75 + g[i+4]*0.25
        assert!((s[1] - 0.75).abs() < 1e-12);
        assert!((s[0] - 0.25).abs() < 1e-12);
        assert_distribution(&s);
    }

    #[test]
    fn test_shift_single_row() {
        let s = shift_forward(&[1.0], 1.7).unwrap();
        assert!((s[0] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_shift_two_rows() {
        let g = [0.25, 0.75];
        for &raw in &[-3.0, -0.4, 0.0, 0.4, 3.0] {
            let s = shift_forward(&g, raw).unwrap();
            assert_distribution(&s);
        }
        let s = shift_by(&g, ShiftAmount::from_displacement(1.0, 2)).unwrap();
        assert_eq!(s, vec![0.75, 0.25]);
    }

    #[test]
    fn test_negative_input_rejected_by_shift() {
        let err = shift_forward(&[0.5, -0.1, 0.6], 0.0).unwrap_err();
        assert!(matches!(err, NtmError::InvalidNumeric { stage: "circular shift", .. }));
        assert!(shift_forward(&[0.5, f64::NAN, 0.5], 0.2).is_err());
    }

    #[test]
    fn test_sharpen_moves_toward_one_hot() {
        let s = [0.1, 0.6, 0.3];
        let w = sharpen_forward(&s, 3.0).unwrap();
        assert_distribution(&w);
        assert!(w[1] > s[1]);
        assert!(w[0] < s[0]);
    }

    #[test]
    fn test_sharpen_all_zero_is_fatal() {
        assert!(sharpen_forward(&[0.0, 0.0], 0.0).is_err());
    }

    #[test]
    fn test_sharpen_backward_with_zero_entry() {
        let s = [0.0, 0.4, 0.6];
        let w = sharpen_forward(&s, 0.5).unwrap();
        let (d_s, d_gamma) = sharpen_backward(&s, 0.5, &w, &[1.0, -1.0, 0.5]);
        assert!(d_s.iter().all(|v| v.is_finite()));
        assert!(d_gamma.is_finite());
        assert_eq!(d_s[0], 0.0);
    }

    #[test]
    fn test_address_pipeline_distributions() {
        let raw = vec![0.3, -0.2, 1.5, 0.4, -0.8, 0.9, 0.0, 0.0, 0.0, 0.0];
        let signals = HeadSignals::split(&raw, HeadLayout::new(2)).unwrap();
        let prev = [0.2, 0.5, 0.3];
        let state = address(&signals, &memory_3x2(), &prev, 3, 2).unwrap();
        assert_distribution(&state.content);
        assert_distribution(&state.gated);
        assert_distribution(&state.shifted);
        assert_distribution(&state.weighting);
    }
}
